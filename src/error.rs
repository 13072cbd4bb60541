use crate::runtime::BridgeError;

// Failure classes for the chat service. Collaborator errors (configuration
// store, completion endpoint, agent runtime) are converted into these at the
// module boundary; the web layer decides which generic body each one becomes.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("invalid or missing configuration key: {0}")]
    InvalidConfiguration(String),

    #[error("configuration provider error: {0}")]
    Provider(String),

    #[error("agent creation failed: {0}")]
    AgentCreation(String),

    #[error("agent invocation failed: {0}")]
    RemoteInvocation(String),

    #[error("completion request failed: {0}")]
    Completion(String),

    #[error("background runtime error: {0}")]
    Bridge(#[from] BridgeError),
}
