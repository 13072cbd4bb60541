use std::collections::BTreeMap;
use std::env;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{info, warn};
use reqwest::Client;
use serde::Deserialize;

use crate::error::ServiceError;

// Keys carrying feature flags in the remote store; everything after the
// prefix is the flag name, the value is a JSON flag document.
const FEATURE_FLAG_PREFIX: &str = ".featureflag/";

/// Bearer credentials attached to every remote call. Stands in for the
/// hosted credential provider; absence is permitted for local development.
#[derive(Clone)]
pub struct Credentials {
    token: Option<String>,
}

impl Credentials {
    pub fn from_env() -> Self {
        let token = env::var("API_ACCESS_TOKEN").ok().filter(|t| !t.is_empty());
        if token.is_none() {
            info!("API_ACCESS_TOKEN not set, remote calls will be unauthenticated");
        }
        Self { token }
    }

    pub fn bearer_token(&self) -> Option<&str> {
        self.token.as_deref()
    }
}

/// One fetch's worth of remote configuration: plain settings plus the
/// feature flags split out of the flag-prefixed keys.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigPayload {
    pub settings: BTreeMap<String, String>,
    pub features: BTreeMap<String, bool>,
}

/// The opaque remote configuration store.
#[async_trait]
pub trait ConfigProvider: Send + Sync {
    async fn fetch(&self) -> Result<ConfigPayload, ServiceError>;
}

#[derive(Deserialize)]
struct KvListing {
    #[serde(default)]
    items: Vec<KvItem>,
}

#[derive(Deserialize)]
struct KvItem {
    key: String,
    #[serde(default)]
    value: String,
}

#[derive(Deserialize)]
struct FlagDocument {
    enabled: bool,
}

/// REST client for the configuration store's key/value listing.
pub struct RestConfigProvider {
    client: Client,
    endpoint: String,
    token: Option<String>,
}

impl RestConfigProvider {
    pub fn new(endpoint: String, credentials: &Credentials) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token: credentials.bearer_token().map(str::to_string),
        }
    }
}

#[async_trait]
impl ConfigProvider for RestConfigProvider {
    async fn fetch(&self) -> Result<ConfigPayload, ServiceError> {
        let url = format!("{}/kv", self.endpoint);
        let mut call = self.client.get(&url);
        if let Some(token) = &self.token {
            call = call.bearer_auth(token);
        }
        let response = call
            .send()
            .await
            .map_err(|e| ServiceError::Provider(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ServiceError::Provider(format!(
                "configuration store returned {}",
                response.status()
            )));
        }
        let listing: KvListing = response
            .json()
            .await
            .map_err(|e| ServiceError::Provider(e.to_string()))?;

        let mut payload = ConfigPayload::default();
        for item in listing.items {
            if let Some(pos) = item.key.find(FEATURE_FLAG_PREFIX) {
                let name = item.key[pos + FEATURE_FLAG_PREFIX.len()..].to_string();
                match serde_json::from_str::<FlagDocument>(&item.value) {
                    Ok(doc) => {
                        payload.features.insert(name, doc.enabled);
                    }
                    Err(e) => warn!("skipping malformed feature flag '{}': {}", item.key, e),
                }
            } else {
                payload.settings.insert(item.key, item.value);
            }
        }
        Ok(payload)
    }
}

/// Immutable, versioned view of the configuration. Cheap to clone.
#[derive(Clone)]
pub struct ConfigSnapshot {
    settings: Arc<BTreeMap<String, String>>,
    features: Arc<BTreeMap<String, bool>>,
    version: u64,
}

impl ConfigSnapshot {
    fn from_payload(payload: ConfigPayload, version: u64) -> Self {
        Self {
            settings: Arc::new(payload.settings),
            features: Arc::new(payload.features),
            version,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.settings.get(key).map(String::as_str)
    }

    pub fn require(&self, key: &str) -> Result<&str, ServiceError> {
        self.get(key)
            .ok_or_else(|| ServiceError::InvalidConfiguration(key.to_string()))
    }

    /// Feature flag lookup; `None` when the flag is undefined in the store.
    pub fn flag(&self, name: &str) -> Option<bool> {
        self.features.get(name).copied()
    }

    fn matches(&self, payload: &ConfigPayload) -> bool {
        *self.settings == payload.settings && *self.features == payload.features
    }
}

struct StoreState {
    snapshot: ConfigSnapshot,
    last_fetch: Instant,
}

/// Locally cached view of the remote configuration with interval-gated
/// refresh and a monotonic version counter. The lock is never held across
/// an await; concurrent refreshes may both fetch, but the payload-equality
/// compare keeps the version bump to at most one per actual change.
pub struct ConfigStore {
    provider: Arc<dyn ConfigProvider>,
    interval: Duration,
    state: RwLock<StoreState>,
}

impl ConfigStore {
    /// Initial fetch; fatal on failure. The first snapshot is version 0.
    pub async fn load(
        provider: Arc<dyn ConfigProvider>,
        interval: Duration,
    ) -> Result<Self, ServiceError> {
        let payload = provider.fetch().await?;
        info!(
            "initial configuration loaded ({} settings, {} feature flags)",
            payload.settings.len(),
            payload.features.len()
        );
        Ok(Self {
            provider,
            interval,
            state: RwLock::new(StoreState {
                snapshot: ConfigSnapshot::from_payload(payload, 0),
                last_fetch: Instant::now(),
            }),
        })
    }

    /// Refresh the snapshot from the remote store. A no-op returning
    /// `Ok(false)` while the refresh interval has not elapsed; otherwise
    /// fetches and installs a new snapshot version only when the payload
    /// actually changed.
    pub async fn refresh(&self) -> Result<bool, ServiceError> {
        {
            let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
            if state.last_fetch.elapsed() < self.interval {
                return Ok(false);
            }
        }

        let payload = self.provider.fetch().await?;

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.last_fetch = Instant::now();
        if state.snapshot.matches(&payload) {
            return Ok(false);
        }
        let version = state.snapshot.version() + 1;
        state.snapshot = ConfigSnapshot::from_payload(payload, version);
        info!("configuration refreshed, new version: {}", version);
        Ok(true)
    }

    pub fn snapshot(&self) -> ConfigSnapshot {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.snapshot.clone()
    }

    pub fn flag(&self, name: &str) -> Option<bool> {
        self.snapshot().flag(name)
    }
}

/// Settings for the direct-completion endpoint, read once at startup.
#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub endpoint: String,
    pub model: String,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub system_prompt: Option<String>,
}

impl LlmSettings {
    pub fn from_snapshot(snapshot: &ConfigSnapshot) -> Result<Self, ServiceError> {
        Ok(Self {
            endpoint: snapshot.require("OpenAI:Endpoint")?.to_string(),
            model: snapshot.require("ChatLLM:Model")?.to_string(),
            temperature: snapshot.get("ChatLLM:Temperature").and_then(|v| v.parse().ok()),
            max_tokens: snapshot.get("ChatLLM:MaxTokens").and_then(|v| v.parse().ok()),
            system_prompt: snapshot.get("ChatLLM:SystemPrompt").map(str::to_string),
        })
    }
}
