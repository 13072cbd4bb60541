use async_trait::async_trait;
use log::{debug, info};
use reqwest::Client;
use serde_json::{json, Value};

use crate::config::{Credentials, LlmSettings};
use crate::error::ServiceError;
use crate::web::models::{ChatMessage, ChatRequest, ChatResponse};

/// The direct-completion path: one turn against a hosted chat-completions
/// endpoint, no remote session state.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn get_chat_completion(&self, request: &ChatRequest)
        -> Result<ChatResponse, ServiceError>;
    fn model_name(&self) -> &str;
}

/// Client for an OpenAI-compatible completion endpoint. Built once at
/// startup from the initial configuration snapshot; the active model is
/// not rebuilt on refresh.
pub struct CompletionModel {
    client: Client,
    settings: LlmSettings,
    token: Option<String>,
}

impl CompletionModel {
    pub fn new(settings: LlmSettings, credentials: &Credentials) -> Self {
        info!(
            "completion model '{}' configured at {}",
            settings.model, settings.endpoint
        );
        Self {
            client: Client::new(),
            token: credentials.bearer_token().map(str::to_string),
            settings,
        }
    }
}

/// Assemble the chat-completions payload: optional system prompt, the
/// request history (entries without content are skipped), then the new
/// user message.
fn build_payload(settings: &LlmSettings, request: &ChatRequest) -> Value {
    let mut messages = Vec::new();
    if let Some(prompt) = &settings.system_prompt {
        messages.push(json!({ "role": "system", "content": prompt }));
    }
    for entry in &request.history {
        let Some(content) = entry.content.as_deref().filter(|c| !c.is_empty()) else {
            continue;
        };
        messages.push(json!({ "role": entry.role, "content": content }));
    }
    messages.push(json!({ "role": "user", "content": request.message }));

    let mut payload = json!({
        "model": settings.model,
        "messages": messages,
    });
    if let Some(temperature) = settings.temperature {
        payload["temperature"] = json!(temperature);
    }
    if let Some(max_tokens) = settings.max_tokens {
        payload["max_tokens"] = json!(max_tokens);
    }
    payload
}

fn extract_content(response: &Value) -> Option<&str> {
    response
        .get("choices")
        .and_then(|choices| choices.get(0))
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"))
        .and_then(Value::as_str)
}

#[async_trait]
impl CompletionBackend for CompletionModel {
    async fn get_chat_completion(
        &self,
        request: &ChatRequest,
    ) -> Result<ChatResponse, ServiceError> {
        let url = format!(
            "{}/v1/chat/completions",
            self.settings.endpoint.trim_end_matches('/')
        );
        let payload = build_payload(&self.settings, request);
        debug!("completion payload: {payload}");

        let mut call = self.client.post(&url).json(&payload);
        if let Some(token) = &self.token {
            call = call.bearer_auth(token);
        }
        let response = call
            .send()
            .await
            .map_err(|e| ServiceError::Completion(e.to_string()))?;
        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(ServiceError::Completion(format!(
                "completion endpoint returned {status}: {detail}"
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ServiceError::Completion(e.to_string()))?;
        let content = extract_content(&body).ok_or_else(|| {
            ServiceError::Completion("no content in completion response".to_string())
        })?;

        let mut history = request.history.clone();
        history.push(ChatMessage::new("user", &request.message));
        history.push(ChatMessage::new("assistant", content));
        Ok(ChatResponse {
            message: Some(content.to_string()),
            history: Some(history),
            thread_id: None,
        })
    }

    fn model_name(&self) -> &str {
        &self.settings.model
    }
}
