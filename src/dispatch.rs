//! Platform action dispatch
//!
//! Executes the AI's decision against the conversation's platform. Two
//! gates run before any HTTP call: the supersession guard (the lock must
//! still name this job, so a stale AI result can never race past a newer
//! one) and a sliding-window rate limiter per platform.

use crate::config_store::PlatformConfig;
use crate::lock::LockManager;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const PLATFORM_TIMEOUT: Duration = Duration::from_secs(30);
const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Terminal state of one dispatch attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStatus {
    Sent,
    RateLimited,
    Superseded,
    Failed,
}

impl DispatchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::RateLimited => "rate_limited",
            Self::Superseded => "superseded",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub success: bool,
    pub status: DispatchStatus,
    pub error: Option<String>,
}

impl DispatchOutcome {
    fn sent() -> Self {
        Self {
            success: true,
            status: DispatchStatus::Sent,
            error: None,
        }
    }

    fn failed(error: String) -> Self {
        Self {
            success: false,
            status: DispatchStatus::Failed,
            error: Some(error),
        }
    }
}

/// Sliding one-minute window per platform id.
///
/// Successful checks append their timestamp; rejected ones do not consume
/// quota.
pub struct RateLimiter {
    windows: Mutex<HashMap<String, Vec<Instant>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn try_acquire(&self, platform_id: &str, limit: u32) -> bool {
        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap();
        let window = windows.entry(platform_id.to_string()).or_default();
        window.retain(|t| now.duration_since(*t) < RATE_WINDOW);

        if window.len() >= limit as usize {
            tracing::warn!(
                platform_id,
                current = window.len(),
                limit,
                "Rate limit exceeded for platform"
            );
            return false;
        }
        window.push(now);
        true
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Conversation history as returned by the platform
#[derive(Debug, Clone)]
pub struct FetchedHistory {
    pub history: String,
    pub resources: Value,
}

pub struct PlatformDispatcher {
    client: reqwest::Client,
    limiter: RateLimiter,
    locks: LockManager,
}

impl PlatformDispatcher {
    pub fn new(locks: LockManager) -> Self {
        let client = reqwest::Client::builder()
            .timeout(PLATFORM_TIMEOUT)
            .build()
            .expect("Failed to create HTTP client");
        Self {
            client,
            limiter: RateLimiter::new(),
            locks,
        }
    }

    /// Execute the AI's action for `job_id`.
    ///
    /// Routing: `CHAT` posts the reply; `CREATE_ORDER` posts the reply and
    /// then the order (the order goes out regardless of the chat result,
    /// matching upstream behavior); `NOTIFY` posts a notification. Anything
    /// else fails without an HTTP call.
    pub async fn execute(
        &self,
        job_id: &str,
        conversation_id: &str,
        action: &str,
        data: &Value,
        config: &PlatformConfig,
    ) -> DispatchOutcome {
        // Supersession guard: a newer arrival owns the lock now
        let current_job = self
            .locks
            .get_info(conversation_id)
            .await
            .and_then(|lock| lock.ai_job_id);
        if current_job.as_deref() != Some(job_id) {
            tracing::info!(
                conversation_id,
                job_id,
                current_job = ?current_job,
                "Discarding dispatch for superseded job"
            );
            return DispatchOutcome {
                success: false,
                status: DispatchStatus::Superseded,
                error: None,
            };
        }

        if !self.limiter.try_acquire(&config.id, config.rate_limit_per_minute) {
            return DispatchOutcome {
                success: false,
                status: DispatchStatus::RateLimited,
                error: Some("Rate limit exceeded".to_string()),
            };
        }

        tracing::info!(
            conversation_id,
            job_id,
            action,
            platform_name = %config.name,
            "Executing platform action"
        );

        match action {
            "CHAT" => self.send_chat(conversation_id, data, config).await,
            "CREATE_ORDER" => {
                // Reply first, then the order; the chat result is not allowed
                // to block the order
                let chat = self.send_chat(conversation_id, data, config).await;
                if !chat.success {
                    tracing::warn!(
                        conversation_id,
                        error = ?chat.error,
                        "Chat leg of CREATE_ORDER failed, continuing with order"
                    );
                }
                self.create_order(conversation_id, data, config).await
            }
            "NOTIFY" => self.notify(conversation_id, data, config).await,
            other => DispatchOutcome::failed(format!("Unknown action type: {other}")),
        }
    }

    async fn send_chat(
        &self,
        conversation_id: &str,
        data: &Value,
        config: &PlatformConfig,
    ) -> DispatchOutcome {
        let payload = json!({
            "conversation_id": conversation_id,
            "response": {
                "answers": normalize_strings(data.get("answer")),
                "images": data.get("images").cloned().unwrap_or_else(|| json!([])),
                "sub_answers": normalize_strings(data.get("sub_answer")),
            }
        });
        self.post(config, "/send-message", &payload).await
    }

    async fn create_order(
        &self,
        conversation_id: &str,
        data: &Value,
        config: &PlatformConfig,
    ) -> DispatchOutcome {
        let customer = data.get("customer_info");
        let products: Vec<Value> = data
            .get("products")
            .and_then(Value::as_array)
            .map(|products| products.iter().map(order_product).collect())
            .unwrap_or_default();

        let payload = json!({
            "conversation_id": conversation_id,
            "customer_info": {
                "name": field_str(customer, "name"),
                "phone": field_str(customer, "phone"),
                "weight": field_str(customer, "weight"),
                "height": field_str(customer, "height"),
                "full_address": field_str(customer, "full_address"),
                "district_name": field_str(customer, "district_name"),
                "province_name": field_str(customer, "province_name"),
                "ward_name": field_str(customer, "ward_name"),
            },
            "products": products,
            "shipping_fee": data.get("shipping_fee").cloned().unwrap_or(json!(0)),
            "traffic_source": field_str(Some(data), "traffic_source"),
            "note": field_str(Some(data), "note"),
        });
        self.post(config, "/create-order", &payload).await
    }

    async fn notify(
        &self,
        conversation_id: &str,
        data: &Value,
        config: &PlatformConfig,
    ) -> DispatchOutcome {
        let payload = json!({
            "conversation_id": conversation_id,
            "phone": field_str(Some(data), "phone"),
            "intent": field_str(Some(data), "intent"),
        });
        self.post(config, "/notify", &payload).await
    }

    /// Pull the current transcript from the platform. Shares the rate
    /// limiter with action dispatch.
    pub async fn fetch_history(
        &self,
        conversation_id: &str,
        config: &PlatformConfig,
    ) -> Result<FetchedHistory, String> {
        if !self.limiter.try_acquire(&config.id, config.rate_limit_per_minute) {
            return Err("Rate limit exceeded".to_string());
        }

        let url = format!(
            "{}/history-chat?conversation_id={conversation_id}",
            config.base_url.trim_end_matches('/')
        );
        let response = self
            .request(config, self.client.post(&url))
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("HTTP {}", response.status().as_u16()));
        }
        let body: Value = response.json().await.map_err(|e| e.to_string())?;
        Ok(FetchedHistory {
            history: body
                .get("history")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            resources: body
                .get("resources")
                .cloned()
                .unwrap_or_else(|| json!({})),
        })
    }

    /// GET `<base_url>/health`.
    pub async fn health(&self, config: &PlatformConfig) -> bool {
        let url = format!("{}/health", config.base_url.trim_end_matches('/'));
        match self.request(config, self.client.get(&url)).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    async fn post(
        &self,
        config: &PlatformConfig,
        path: &str,
        payload: &Value,
    ) -> DispatchOutcome {
        let url = format!("{}{path}", config.base_url.trim_end_matches('/'));
        let result = self
            .request(config, self.client.post(&url))
            .json(payload)
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => DispatchOutcome::sent(),
            Ok(response) => {
                let status = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                let preview: String = body.chars().take(200).collect();
                tracing::error!(path, status, "Platform action failed");
                DispatchOutcome::failed(format!("HTTP {status}: {preview}"))
            }
            Err(e) => {
                tracing::error!(path, error = %e, "Platform request failed");
                DispatchOutcome::failed(e.to_string())
            }
        }
    }

    fn request(
        &self,
        config: &PlatformConfig,
        builder: reqwest::RequestBuilder,
    ) -> reqwest::RequestBuilder {
        let builder = builder.header("Accept", "application/json");
        match (&config.auth_token, config.auth_required) {
            (Some(token), true) => builder.bearer_auth(token),
            _ => builder,
        }
    }
}

/// Normalize an AI response field to a string array.
///
/// Scalars wrap into a one-element array; array elements that are not
/// strings are stringified; absent and null values yield an empty array.
fn normalize_strings(value: Option<&Value>) -> Vec<String> {
    match value {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.iter().map(value_to_string).collect(),
        Some(other) => vec![value_to_string(other)],
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn field_str(object: Option<&Value>, key: &str) -> String {
    object
        .and_then(|o| o.get(key))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn order_product(product: &Value) -> Value {
    let product_id = product.get("product_id");
    let product_code = product_id.map_or_else(|| "0".to_string(), value_to_string);
    let product_id_mapping = product_id.map_or(0, |id| match id {
        Value::Number(n) => n.as_i64().unwrap_or(0),
        Value::String(s) => s.parse().unwrap_or(0),
        _ => 0,
    });

    json!({
        "product_code": product_code,
        "product_id_mapping": product_id_mapping,
        "product_name": field_str(Some(product), "product_name"),
        "quantity": product.get("quantity").cloned().unwrap_or(json!(0)),
        "price": product.get("price").cloned().unwrap_or(json!(0)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SharedStore;
    use axum::extract::State;
    use axum::routing::post;
    use axum::{Json, Router};
    use std::sync::Arc;

    type Calls = Arc<Mutex<Vec<(String, Value)>>>;

    async fn stub_platform() -> (String, Calls) {
        let calls: Calls = Arc::new(Mutex::new(Vec::new()));

        async fn record(
            path: &str,
            calls: &Calls,
            body: Value,
        ) -> Json<Value> {
            calls.lock().unwrap().push((path.to_string(), body));
            Json(json!({"ok": true}))
        }

        let router = Router::new()
            .route(
                "/send-message",
                post(|State(calls): State<Calls>, Json(body): Json<Value>| async move {
                    record("/send-message", &calls, body).await
                }),
            )
            .route(
                "/create-order",
                post(|State(calls): State<Calls>, Json(body): Json<Value>| async move {
                    record("/create-order", &calls, body).await
                }),
            )
            .route(
                "/notify",
                post(|State(calls): State<Calls>, Json(body): Json<Value>| async move {
                    record("/notify", &calls, body).await
                }),
            )
            .with_state(calls.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        (format!("http://{addr}"), calls)
    }

    fn config(base_url: String, rate_limit: u32) -> PlatformConfig {
        PlatformConfig {
            base_url,
            rate_limit_per_minute: rate_limit,
            ..PlatformConfig::default_config()
        }
    }

    /// Dispatcher whose lock names `job_id` as current for `conv`.
    async fn dispatcher_owning(conv: &str, job_id: &str) -> PlatformDispatcher {
        let locks = LockManager::new(SharedStore::in_memory());
        locks.check_and_acquire(conv, "h").await;
        locks.attach_job(conv, job_id).await;
        PlatformDispatcher::new(locks)
    }

    #[test]
    fn test_rate_limiter_window() {
        let limiter = RateLimiter::new();
        assert!(limiter.try_acquire("p1", 2));
        assert!(limiter.try_acquire("p1", 2));
        assert!(!limiter.try_acquire("p1", 2));
        // Other platforms are unaffected
        assert!(limiter.try_acquire("p2", 2));
    }

    #[test]
    fn test_normalize_strings() {
        assert_eq!(normalize_strings(None), Vec::<String>::new());
        assert_eq!(normalize_strings(Some(&json!(null))), Vec::<String>::new());
        assert_eq!(normalize_strings(Some(&json!("one"))), vec!["one"]);
        assert_eq!(
            normalize_strings(Some(&json!(["a", 2, "c"]))),
            vec!["a", "2", "c"]
        );
    }

    #[tokio::test]
    async fn test_chat_dispatch_normalizes_payload() {
        let (base, calls) = stub_platform().await;
        let dispatcher = dispatcher_owning("c1", "job-1").await;

        let outcome = dispatcher
            .execute(
                "job-1",
                "c1",
                "CHAT",
                &json!({"answer": "hello", "images": ["i.png"]}),
                &config(base, 60),
            )
            .await;

        assert!(outcome.success);
        assert_eq!(outcome.status, DispatchStatus::Sent);

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        let (path, body) = &calls[0];
        assert_eq!(path, "/send-message");
        assert_eq!(body["conversation_id"], "c1");
        assert_eq!(body["response"]["answers"], json!(["hello"]));
        assert_eq!(body["response"]["images"], json!(["i.png"]));
        assert_eq!(body["response"]["sub_answers"], json!([]));
    }

    #[tokio::test]
    async fn test_create_order_sends_chat_then_order() {
        let (base, calls) = stub_platform().await;
        let dispatcher = dispatcher_owning("c2", "job-2").await;

        let data = json!({
            "answer": ["your order is placed"],
            "customer_info": {"name": "An", "phone": "0123"},
            "products": [{"product_id": "7", "product_name": "tea", "quantity": 2, "price": 50}],
            "shipping_fee": 10,
        });
        let outcome = dispatcher
            .execute("job-2", "c2", "CREATE_ORDER", &data, &config(base, 60))
            .await;
        assert!(outcome.success);

        let calls = calls.lock().unwrap();
        let paths: Vec<&str> = calls.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(paths, vec!["/send-message", "/create-order"]);

        let (_, order) = &calls[1];
        assert_eq!(order["customer_info"]["name"], "An");
        assert_eq!(order["customer_info"]["ward_name"], "");
        assert_eq!(order["products"][0]["product_code"], "7");
        assert_eq!(order["products"][0]["product_id_mapping"], 7);
        assert_eq!(order["shipping_fee"], 10);
        assert_eq!(order["note"], "");
    }

    #[tokio::test]
    async fn test_notify_dispatch() {
        let (base, calls) = stub_platform().await;
        let dispatcher = dispatcher_owning("c3", "job-3").await;

        let outcome = dispatcher
            .execute(
                "job-3",
                "c3",
                "NOTIFY",
                &json!({"phone": "0999", "intent": "call_back"}),
                &config(base, 60),
            )
            .await;
        assert!(outcome.success);

        let calls = calls.lock().unwrap();
        assert_eq!(calls[0].0, "/notify");
        assert_eq!(calls[0].1["phone"], "0999");
        assert_eq!(calls[0].1["intent"], "call_back");
    }

    #[tokio::test]
    async fn test_unknown_action_makes_no_http_call() {
        let (base, calls) = stub_platform().await;
        let dispatcher = dispatcher_owning("c4", "job-4").await;

        let outcome = dispatcher
            .execute("job-4", "c4", "UNKNOWN", &json!({}), &config(base, 60))
            .await;

        assert!(!outcome.success);
        assert!(outcome
            .error
            .unwrap()
            .contains("Unknown action type: UNKNOWN"));
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_superseded_job_is_discarded_silently() {
        let (base, calls) = stub_platform().await;
        // Lock names a different job
        let dispatcher = dispatcher_owning("c5", "job-new").await;

        let outcome = dispatcher
            .execute(
                "job-old",
                "c5",
                "CHAT",
                &json!({"answer": "stale"}),
                &config(base, 60),
            )
            .await;

        assert!(!outcome.success);
        assert_eq!(outcome.status, DispatchStatus::Superseded);
        assert!(outcome.error.is_none());
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rate_limit_rejects_second_action() {
        let (base, calls) = stub_platform().await;
        let dispatcher = dispatcher_owning("c6", "job-6").await;
        let config = config(base, 1);

        let first = dispatcher
            .execute("job-6", "c6", "CHAT", &json!({"answer": "a"}), &config)
            .await;
        assert!(first.success);

        let second = dispatcher
            .execute("job-6", "c6", "CHAT", &json!({"answer": "b"}), &config)
            .await;
        assert!(!second.success);
        assert_eq!(second.status, DispatchStatus::RateLimited);
        assert_eq!(second.error.as_deref(), Some("Rate limit exceeded"));

        // Only the first reached the platform
        assert_eq!(calls.lock().unwrap().len(), 1);
    }
}
