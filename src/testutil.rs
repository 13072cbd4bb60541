//! Hand-rolled mocks for the remote collaborators, shared across the
//! module test suites.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::agent::{AgentConnector, AgentRunItem, AgentService, AgentSettings};
use crate::config::{ConfigPayload, ConfigProvider};
use crate::error::ServiceError;
use crate::model::CompletionBackend;
use crate::web::models::{ChatMessage, ChatRequest, ChatResponse};

pub fn payload(settings: &[(&str, &str)], features: &[(&str, bool)]) -> ConfigPayload {
    ConfigPayload {
        settings: settings
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<BTreeMap<_, _>>(),
        features: features
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect::<BTreeMap<_, _>>(),
    }
}

/// Config provider fed from a queue of scripted fetch results; once the
/// queue is drained it keeps serving the fallback payload.
pub struct ScriptedConfigProvider {
    queue: Mutex<VecDeque<Result<ConfigPayload, String>>>,
    fallback: ConfigPayload,
    pub fetches: AtomicUsize,
}

impl ScriptedConfigProvider {
    pub fn with_fallback(fallback: ConfigPayload) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            fallback,
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn push(&self, result: Result<ConfigPayload, String>) {
        self.queue.lock().unwrap().push_back(result);
    }
}

#[async_trait]
impl ConfigProvider for ScriptedConfigProvider {
    async fn fetch(&self) -> Result<ConfigPayload, ServiceError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        match self.queue.lock().unwrap().pop_front() {
            Some(Ok(payload)) => Ok(payload),
            Some(Err(cause)) => Err(ServiceError::Provider(cause)),
            None => Ok(self.fallback.clone()),
        }
    }
}

/// What a `RecordingAgentService::run` call should do.
#[derive(Clone)]
pub enum RunScript {
    Item {
        content: Option<String>,
        thread_id: Option<String>,
    },
    Empty,
    Fail(String),
}

/// Agent service that records every call it receives.
pub struct RecordingAgentService {
    fail_create: bool,
    script: RunScript,
    pub definitions: Mutex<Vec<String>>,
    pub runs: Mutex<Vec<(String, Option<String>)>>,
    pub deletes: AtomicUsize,
    pub closes: AtomicUsize,
}

#[async_trait]
impl AgentService for RecordingAgentService {
    async fn create_agent(&self, definition: &str) -> Result<String, ServiceError> {
        self.definitions.lock().unwrap().push(definition.to_string());
        if self.fail_create {
            Err(ServiceError::AgentCreation("scripted create failure".to_string()))
        } else {
            Ok("agent-1".to_string())
        }
    }

    async fn run(
        &self,
        _agent_id: &str,
        message: &str,
        thread_id: Option<&str>,
    ) -> Result<Option<AgentRunItem>, ServiceError> {
        self.runs
            .lock()
            .unwrap()
            .push((message.to_string(), thread_id.map(str::to_string)));
        match &self.script {
            RunScript::Item { content, thread_id } => Ok(Some(AgentRunItem {
                content: content.clone(),
                thread_id: thread_id.clone(),
            })),
            RunScript::Empty => Ok(None),
            RunScript::Fail(cause) => Err(ServiceError::RemoteInvocation(cause.clone())),
        }
    }

    async fn delete_agent(&self, _agent_id: &str) -> Result<(), ServiceError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Connector that hands out one `RecordingAgentService` per open and keeps
/// every opened service around for inspection.
pub struct RecordingConnector {
    opened: Mutex<Vec<Arc<RecordingAgentService>>>,
    pub fail_next_create: AtomicBool,
    pub script: Mutex<RunScript>,
}

impl Default for RecordingConnector {
    fn default() -> Self {
        Self {
            opened: Mutex::new(Vec::new()),
            fail_next_create: AtomicBool::new(false),
            script: Mutex::new(RunScript::Item {
                content: Some("ok".to_string()),
                thread_id: None,
            }),
        }
    }
}

impl RecordingConnector {
    pub fn opened(&self) -> Vec<Arc<RecordingAgentService>> {
        self.opened.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentConnector for RecordingConnector {
    async fn open(&self, _settings: &AgentSettings) -> Result<Arc<dyn AgentService>, ServiceError> {
        let service = Arc::new(RecordingAgentService {
            fail_create: self.fail_next_create.swap(false, Ordering::SeqCst),
            script: self.script.lock().unwrap().clone(),
            definitions: Mutex::new(Vec::new()),
            runs: Mutex::new(Vec::new()),
            deletes: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        });
        self.opened.lock().unwrap().push(service.clone());
        Ok(service)
    }
}

/// Completion backend with a canned reply (or a scripted failure).
pub struct CannedCompletion {
    pub reply: String,
    pub model: String,
    pub fail: bool,
}

impl CannedCompletion {
    pub fn reply(reply: &str) -> Self {
        Self {
            reply: reply.to_string(),
            model: "gpt-test".to_string(),
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            reply: String::new(),
            model: "gpt-test".to_string(),
            fail: true,
        }
    }
}

#[async_trait]
impl CompletionBackend for CannedCompletion {
    async fn get_chat_completion(&self, request: &ChatRequest) -> Result<ChatResponse, ServiceError> {
        if self.fail {
            return Err(ServiceError::Completion("scripted completion failure".to_string()));
        }
        let mut history = request.history.clone();
        history.push(ChatMessage::new("user", &request.message));
        history.push(ChatMessage::new("assistant", &self.reply));
        Ok(ChatResponse {
            message: Some(self.reply.clone()),
            history: Some(history),
            thread_id: None,
        })
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
