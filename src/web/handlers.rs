use std::time::Duration;

use actix_web::{web, HttpResponse, Responder};
use log::{error, info};
use serde_json::json;
use uuid::Uuid;

use crate::agent::AgentSettings;
use crate::error::ServiceError;
use crate::web::models::{ChatRequest, ChatResponse};
use crate::AppState;

// Bound on how long a request thread blocks on the agent path.
const AGENT_TIMEOUT: Duration = Duration::from_secs(60);
const BETA_FLAG: &str = "Beta";

fn bad_request() -> HttpResponse {
    HttpResponse::BadRequest().json(json!({ "error": "Message cannot be empty" }))
}

fn internal_error() -> HttpResponse {
    HttpResponse::InternalServerError()
        .json(json!({ "error": "An error occurred while processing your request" }))
}

pub async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(json!({ "status": "ok" }))
}

pub async fn model_name(data: web::Data<AppState>) -> impl Responder {
    HttpResponse::Ok().json(json!({ "model": data.completion.model_name() }))
}

pub async fn feature_flag_status(data: web::Data<AppState>) -> impl Responder {
    if let Err(e) = data.config.refresh().await {
        error!("configuration refresh failed: {e}");
    }
    match data.config.flag(BETA_FLAG) {
        Some(enabled) => HttpResponse::Ok().json(json!({ "isEnabled": enabled })),
        None => HttpResponse::NotFound()
            .json(json!({ "error": format!("Feature '{BETA_FLAG}' not found") })),
    }
}

/// Chat endpoint. Routes to the managed agent or the direct completion
/// endpoint depending on the `Beta` flag in the freshest snapshot.
pub async fn chat(data: web::Data<AppState>, body: web::Bytes) -> impl Responder {
    let request_id = Uuid::new_v4();

    // Best-effort: a no-op inside the refresh interval, and a stale
    // snapshot is still serviceable when the store is unreachable.
    if let Err(e) = data.config.refresh().await {
        error!("[{request_id}] configuration refresh failed: {e}");
    }

    let request: ChatRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            info!("[{request_id}] rejecting malformed chat body: {e}");
            return bad_request();
        }
    };
    if request.message.trim().is_empty() {
        info!("[{request_id}] rejecting chat request with empty message");
        return bad_request();
    }

    let snapshot = data.config.snapshot();
    let beta_enabled = snapshot.flag(BETA_FLAG).unwrap_or(false);
    info!(
        "[{request_id}] chat request on the {} path",
        if beta_enabled { "agent" } else { "completion" }
    );

    if beta_enabled {
        let agent = data.agent.clone();
        let bridge = data.bridge.clone();
        // submit_and_wait blocks, so it runs on the blocking pool rather
        // than a request executor.
        let outcome = web::block(move || {
            bridge.submit_and_wait(
                async move {
                    let settings = AgentSettings::from_snapshot(&snapshot)?;
                    let handle = agent.get_or_create(&settings, snapshot.version()).await?;
                    Ok::<ChatResponse, ServiceError>(handle.invoke(&request).await)
                },
                AGENT_TIMEOUT,
            )
        })
        .await;

        match outcome {
            Ok(Ok(Ok(response))) => HttpResponse::Ok().json(response),
            Ok(Ok(Err(e))) => {
                error!("[{request_id}] agent path failed: {e}");
                internal_error()
            }
            Ok(Err(e)) => {
                error!("[{request_id}] background runtime error: {e}");
                internal_error()
            }
            Err(e) => {
                error!("[{request_id}] blocking pool error: {e}");
                internal_error()
            }
        }
    } else {
        match data.completion.get_chat_completion(&request).await {
            Ok(response) => HttpResponse::Ok().json(response),
            Err(e) => {
                error!("[{request_id}] completion request failed: {e}");
                internal_error()
            }
        }
    }
}
