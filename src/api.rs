//! HTTP API for the chat orchestrator

mod admin;
mod auth;
mod handlers;
mod types;

pub use handlers::create_router;
#[allow(unused_imports)] // Public API re-exports
pub use types::*;

use crate::config::Settings;
use crate::config_store::ConfigStore;
use crate::db::Database;
use crate::handler::MessageHandler;
use crate::store::SharedStore;
use std::sync::Arc;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub handler: Arc<MessageHandler>,
    pub db: Database,
    pub configs: Arc<ConfigStore>,
    pub store: SharedStore,
    pub settings: Arc<Settings>,
}

impl AppState {
    pub fn new(db: Database, store: SharedStore, settings: Settings) -> Self {
        let configs = Arc::new(ConfigStore::new(db.clone()));
        let handler = Arc::new(MessageHandler::new(
            db.clone(),
            store.clone(),
            configs.clone(),
        ));

        Self {
            handler,
            db,
            configs,
            store,
            settings: Arc::new(settings),
        }
    }
}
