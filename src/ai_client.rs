//! HTTP client for configured AI inference endpoints
//!
//! Stateless: every call carries its own endpoint, auth, and timeout from
//! the job's captured `AiConfig`. The worker owns job lifecycle; this module
//! only talks HTTP and normalizes the response into an `AiOutcome`.

use crate::config_store::AiConfig;
use crate::history::ParsedMessage;
use serde::Serialize;
use serde_json::Value;
use std::time::{Duration, Instant};

/// Normalized result of one AI call
#[derive(Debug, Clone)]
pub struct AiOutcome {
    pub success: bool,
    pub action: String,
    pub data: Value,
    pub processing_time_ms: u64,
    pub error: Option<String>,
}

impl AiOutcome {
    fn failure(error: String, started: Instant) -> Self {
        Self {
            success: false,
            action: String::new(),
            data: Value::Object(serde_json::Map::new()),
            processing_time_ms: elapsed_ms(started),
            error: Some(error),
        }
    }
}

#[derive(Serialize)]
struct AiRequest<'a> {
    index: i64,
    messages: Vec<WireMessage<'a>>,
    resource: &'a Value,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
    timestamp: f64,
}

#[derive(Clone)]
pub struct AiClient {
    client: reqwest::Client,
}

impl AiClient {
    pub fn new() -> Self {
        // Timeouts are per request, from each endpoint's config
        let client = reqwest::Client::builder()
            .build()
            .expect("Failed to create HTTP client");
        Self { client }
    }

    /// Call the configured endpoint with the conversation's new messages.
    ///
    /// Never returns an error: failures come back as `success = false` with
    /// a descriptive message, which the worker records on the job.
    pub async fn process(
        &self,
        conversation_id: &str,
        messages: &[ParsedMessage],
        resources: &Value,
        lock_id: &str,
        config: &AiConfig,
    ) -> AiOutcome {
        let started = Instant::now();
        let endpoint = config.api_endpoint.replace("{session_id}", conversation_id);
        let timeout_secs = config.timeout_seconds.max(1);

        let payload = AiRequest {
            index: lock_index(lock_id),
            messages: messages.iter().map(wire_message).collect(),
            resource: resources,
        };

        tracing::info!(
            conversation_id,
            ai_name = %config.name,
            message_count = messages.len(),
            "Calling AI endpoint"
        );

        let mut request = self
            .client
            .post(&endpoint)
            .timeout(Duration::from_secs(timeout_secs))
            .header("Accept", "application/json")
            .json(&payload);
        if config.auth_required {
            if let Some(token) = &config.auth_token {
                request = request.bearer_auth(token);
            }
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                tracing::error!(conversation_id, timeout_secs, "AI request timed out");
                return AiOutcome::failure(
                    format!("AI service timeout after {timeout_secs}s"),
                    started,
                );
            }
            Err(e) => {
                tracing::error!(conversation_id, error = %e, "AI request failed");
                return AiOutcome::failure(e.to_string(), started);
            }
        };

        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            let preview: String = body.chars().take(100).collect();
            tracing::error!(
                conversation_id,
                status = status.as_u16(),
                "AI endpoint returned an error"
            );
            return AiOutcome::failure(
                format!("AI service returned {}: {preview}", status.as_u16()),
                started,
            );
        }

        let parsed: Value = serde_json::from_str(&body).unwrap_or(Value::Null);
        let action = parsed
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let data = parsed
            .get("data")
            .cloned()
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()));

        let processing_time_ms = elapsed_ms(started);
        tracing::info!(
            conversation_id,
            ai_name = %config.name,
            action = %action,
            processing_time_ms,
            "AI processing successful"
        );

        AiOutcome {
            success: true,
            action,
            data,
            processing_time_ms,
            error: None,
        }
    }

    /// GET `<endpoint>/health` with a short timeout.
    pub async fn health_check(&self, config: &AiConfig) -> bool {
        let endpoint = format!("{}/health", config.api_endpoint.trim_end_matches('/'));
        match self
            .client
            .get(&endpoint)
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

impl Default for AiClient {
    fn default() -> Self {
        Self::new()
    }
}

/// The wire `index` is numeric. Lock ids are UUIDs in practice, so this
/// nearly always takes the wall-clock substitute, matching the upstream
/// contract.
fn lock_index(lock_id: &str) -> i64 {
    lock_id
        .parse::<i64>()
        .unwrap_or_else(|_| chrono::Utc::now().timestamp())
}

fn wire_message(message: &ParsedMessage) -> WireMessage<'_> {
    use crate::db::MessageRole;
    WireMessage {
        role: match message.role {
            MessageRole::User => "user",
            MessageRole::Bot => "assistant",
            MessageRole::Sale => "sale",
        },
        content: &message.content,
        timestamp: message.timestamp,
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
