//! Cross-cutting error reporting, plus the typed error enums for the
//! Agent Manager, Transport, and Scheduler components.

use serde::{Deserialize, Serialize};

/// Where an `ErrorReport` originated.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ErrorType {
    System,
    Agent,
    Tool,
    Llm,
    Transfer,
}

/// How urgently an `ErrorReport` should be surfaced.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    #[default]
    Error,
    Critical,
}

/// A structured error surfaced from any component, sent over the WebSocket
/// event bus as an `EventMessage::Error` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReport {
    #[serde(rename = "type")]
    pub error_type: ErrorType,
    pub message: String,
    #[serde(default)]
    pub severity: Severity,
    pub conversation_id: Option<String>,
    pub assistant_id: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub metadata: Option<serde_json::Value>,
}

/// Ships `ErrorReport`s to a remote monitoring endpoint. Grounded in
/// `original_source/src/cue/services/monitoring_client.py`'s
/// `MonitoringClient.report_error`. Implementations should not panic or
/// propagate — reporting failures are logged by the caller and otherwise
/// ignored, matching the Python client's try/except-and-log fallback.
#[async_trait::async_trait]
pub trait MonitoringClient: Send + Sync {
    async fn report_error(&self, report: &ErrorReport);
}

impl ErrorReport {
    pub fn new(error_type: ErrorType, message: impl Into<String>) -> Self {
        Self {
            error_type,
            message: message.into(),
            severity: Severity::default(),
            conversation_id: None,
            assistant_id: None,
            timestamp: chrono::Utc::now(),
            metadata: None,
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn with_assistant(mut self, assistant_id: impl Into<String>) -> Self {
        self.assistant_id = Some(assistant_id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("agent not found: {0}")]
    AgentNotFound(String),
    #[error("agent already registered: {0}")]
    AlreadyRegistered(String),
    #[error("no primary agent registered")]
    NoPrimaryAgent,
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("transfer target not found: {0}")]
    TransferTargetNotFound(String),
    #[error("run already in progress for agent {0}")]
    RunInProgress(String),
    #[error("provider error: {0}")]
    Provider(#[from] crate::provider::ProviderError),
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("connection closed")]
    Closed,
    #[error("heartbeat timed out")]
    HeartbeatTimeout,
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    #[error("already connected")]
    AlreadyConnected,
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage request failed: {0}")]
    RequestFailed(String),
    #[error("message already persisted with id: {0}")]
    AlreadyPersisted(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),
    #[error("recurring task missing interval: {0}")]
    MissingInterval(String),
    #[error("task client error: {0}")]
    Client(String),
    #[error("task not found: {0}")]
    TaskNotFound(String),
}
