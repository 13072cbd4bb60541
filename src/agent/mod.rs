use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::config::{ConfigSnapshot, Credentials};
use crate::error::ServiceError;
use crate::web::models::{ChatRequest, ChatResponse};

const NO_RESPONSE_MESSAGE: &str = "No response received from agent";

/// Settings driving agent creation, read from the configuration snapshot
/// on every agent-path request.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub definition: String,
    pub project_endpoint: String,
    pub model_deployment: String,
    pub api_version: String,
    pub extras: BTreeMap<String, String>,
}

impl AgentSettings {
    pub fn from_snapshot(snapshot: &ConfigSnapshot) -> Result<Self, ServiceError> {
        let mut extras = BTreeMap::new();
        extras.insert(
            "SearchConnectionId".to_string(),
            snapshot.require("SearchConnectionId")?.to_string(),
        );
        Ok(Self {
            definition: snapshot.require("MyAgent")?.to_string(),
            project_endpoint: snapshot.require("MyAgent:ProjectEndpoint")?.to_string(),
            model_deployment: snapshot.require("MyAgent:ModelDeploymentName")?.to_string(),
            api_version: snapshot.require("MyAgent:ApiVersion")?.to_string(),
            extras,
        })
    }

    /// The definition text with `${Name}` placeholders substituted from the
    /// extras map.
    pub fn rendered_definition(&self) -> String {
        let mut rendered = self.definition.clone();
        for (name, value) in &self.extras {
            rendered = rendered.replace(&format!("${{{name}}}"), value);
        }
        rendered
    }
}

/// One item of an agent run's streamed response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentRunItem {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub thread_id: Option<String>,
}

/// Narrow contract of the opaque managed-agent runtime. `run` consumes the
/// whole response stream and yields only the final item.
#[async_trait]
pub trait AgentService: Send + Sync {
    async fn create_agent(&self, definition: &str) -> Result<String, ServiceError>;
    async fn run(
        &self,
        agent_id: &str,
        message: &str,
        thread_id: Option<&str>,
    ) -> Result<Option<AgentRunItem>, ServiceError>;
    async fn delete_agent(&self, agent_id: &str) -> Result<(), ServiceError>;
    async fn close(&self);
}

/// Opens a fresh, exclusively-owned connection to the agent runtime.
#[async_trait]
pub trait AgentConnector: Send + Sync {
    async fn open(&self, settings: &AgentSettings) -> Result<Arc<dyn AgentService>, ServiceError>;
}

pub struct RestConnector {
    token: Option<String>,
}

impl RestConnector {
    pub fn new(credentials: &Credentials) -> Self {
        Self {
            token: credentials.bearer_token().map(str::to_string),
        }
    }
}

#[async_trait]
impl AgentConnector for RestConnector {
    async fn open(&self, settings: &AgentSettings) -> Result<Arc<dyn AgentService>, ServiceError> {
        let client = Client::builder()
            .build()
            .map_err(|e| ServiceError::AgentCreation(e.to_string()))?;
        Ok(Arc::new(RestAgentService {
            client,
            endpoint: settings.project_endpoint.trim_end_matches('/').to_string(),
            model_deployment: settings.model_deployment.clone(),
            api_version: settings.api_version.clone(),
            token: self.token.clone(),
        }))
    }
}

/// REST transport for the agent runtime.
struct RestAgentService {
    client: Client,
    endpoint: String,
    model_deployment: String,
    api_version: String,
    token: Option<String>,
}

impl RestAgentService {
    fn url(&self, path: &str) -> String {
        format!("{}/{}?api-version={}", self.endpoint, path, self.api_version)
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

fn parse_run_item(line: &[u8]) -> Option<AgentRunItem> {
    let line = std::str::from_utf8(line).ok()?.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str(line) {
        Ok(item) => Some(item),
        Err(e) => {
            warn!("skipping malformed agent response item: {e}");
            None
        }
    }
}

#[async_trait]
impl AgentService for RestAgentService {
    async fn create_agent(&self, definition: &str) -> Result<String, ServiceError> {
        let payload = json!({
            "definition": definition,
            "model": self.model_deployment,
        });
        let response = self
            .authorized(self.client.post(self.url("agents")))
            .json(&payload)
            .send()
            .await
            .map_err(|e| ServiceError::AgentCreation(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ServiceError::AgentCreation(format!(
                "agent runtime returned {}",
                response.status()
            )));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| ServiceError::AgentCreation(e.to_string()))?;
        body.get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                ServiceError::AgentCreation("creation response carried no agent id".to_string())
            })
    }

    async fn run(
        &self,
        agent_id: &str,
        message: &str,
        thread_id: Option<&str>,
    ) -> Result<Option<AgentRunItem>, ServiceError> {
        let mut payload = json!({ "message": message });
        if let Some(thread_id) = thread_id {
            payload["thread_id"] = json!(thread_id);
        }
        let mut response = self
            .authorized(self.client.post(self.url(&format!("agents/{agent_id}/runs"))))
            .json(&payload)
            .send()
            .await
            .map_err(|e| ServiceError::RemoteInvocation(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ServiceError::RemoteInvocation(format!(
                "agent runtime returned {}",
                response.status()
            )));
        }

        // The run streams newline-delimited JSON items; intermediate items
        // are consumed, the final one wins.
        let mut buffer: Vec<u8> = Vec::new();
        let mut last = None;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| ServiceError::RemoteInvocation(e.to_string()))?
        {
            buffer.extend_from_slice(&chunk);
            while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                if let Some(item) = parse_run_item(&line) {
                    last = Some(item);
                }
            }
        }
        if let Some(item) = parse_run_item(&buffer) {
            last = Some(item);
        }
        Ok(last)
    }

    async fn delete_agent(&self, agent_id: &str) -> Result<(), ServiceError> {
        let response = self
            .authorized(self.client.delete(self.url(&format!("agents/{agent_id}"))))
            .send()
            .await
            .map_err(|e| ServiceError::RemoteInvocation(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ServiceError::RemoteInvocation(format!(
                "agent runtime returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn close(&self) {
        debug!("agent runtime connection released");
    }
}

/// One live remote agent session plus the connection it exclusively owns,
/// stamped with the configuration version it was created from.
pub struct AgentHandle {
    service: Arc<dyn AgentService>,
    agent_id: String,
    config_version: u64,
}

impl std::fmt::Debug for AgentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentHandle")
            .field("agent_id", &self.agent_id)
            .field("config_version", &self.config_version)
            .finish_non_exhaustive()
    }
}

impl AgentHandle {
    pub fn config_version(&self) -> u64 {
        self.config_version
    }

    /// Run one turn against the remote agent, continuing `request.thread_id`
    /// when set. Remote failures are downgraded into an error-bearing
    /// ChatResponse so the caller always gets a renderable message.
    pub async fn invoke(&self, request: &ChatRequest) -> ChatResponse {
        let outcome = self
            .service
            .run(&self.agent_id, &request.message, request.thread_id.as_deref())
            .await;
        match outcome {
            Ok(Some(item)) => ChatResponse {
                message: Some(item.content.unwrap_or_default()),
                history: None,
                thread_id: item.thread_id,
            },
            Ok(None) => ChatResponse {
                message: Some(NO_RESPONSE_MESSAGE.to_string()),
                history: None,
                thread_id: None,
            },
            Err(e) => {
                error!("agent invocation failed: {e}");
                ChatResponse {
                    message: Some(format!("Error getting agent response: {e}")),
                    history: None,
                    thread_id: None,
                }
            }
        }
    }
}

/// Process-wide slot holding at most one live agent handle. The whole
/// check-and-maybe-replace sequence runs under one async mutex.
pub struct ManagedAgent {
    connector: Arc<dyn AgentConnector>,
    slot: Mutex<Option<Arc<AgentHandle>>>,
}

impl ManagedAgent {
    pub fn new(connector: Arc<dyn AgentConnector>) -> Self {
        Self {
            connector,
            slot: Mutex::new(None),
        }
    }

    /// Return the live handle, creating it when absent and replacing it when
    /// the configuration version has advanced past its stamp. A superseded
    /// handle is torn down fire-and-forget; creation failures leave the slot
    /// empty so the next request retries.
    pub async fn get_or_create(
        &self,
        settings: &AgentSettings,
        version: u64,
    ) -> Result<Arc<AgentHandle>, ServiceError> {
        let mut slot = self.slot.lock().await;

        if let Some(handle) = slot.as_ref() {
            if handle.config_version >= version {
                return Ok(Arc::clone(handle));
            }
        }
        if let Some(stale) = slot.take() {
            info!(
                "configuration advanced past version {}, recreating agent",
                stale.config_version
            );
            tokio::spawn(async move { teardown(stale).await });
        }

        let service = self.connector.open(settings).await?;
        let agent_id = match service.create_agent(&settings.rendered_definition()).await {
            Ok(id) => id,
            Err(e) => {
                // The connection was opened for this handle only; release it
                // before reporting the failure.
                service.close().await;
                return Err(e);
            }
        };
        info!("agent {agent_id} created at configuration version {version}");

        let handle = Arc::new(AgentHandle {
            service,
            agent_id,
            config_version: version,
        });
        *slot = Some(Arc::clone(&handle));
        Ok(handle)
    }

    /// Best-effort removal of the live session. Safe to call repeatedly or
    /// when nothing was ever created.
    pub async fn cleanup(&self) {
        let handle = self.slot.lock().await.take();
        if let Some(handle) = handle {
            teardown(handle).await;
        }
    }
}

/// Delete the remote session, then close the connection. Each step is
/// independently best-effort; failures are logged only.
async fn teardown(handle: Arc<AgentHandle>) {
    info!("deleting agent {}", handle.agent_id);
    if let Err(e) = handle.service.delete_agent(&handle.agent_id).await {
        error!("error deleting agent {}: {e}", handle.agent_id);
    }
    handle.service.close().await;
}
