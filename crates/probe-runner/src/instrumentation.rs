use async_trait::async_trait;
use probe_core::DeviceId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct BackendError {
    pub message: String,
}

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceHandle {
    pub id: DeviceId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttachHandle(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScriptHandle(pub String);

/// A message posted by the agent script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptEvent {
    pub script: ScriptHandle,
    pub message: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

pub type EventSender = mpsc::UnboundedSender<ScriptEvent>;

/// Attach/inject/call capability of an instrumentation framework.
///
/// Handles are opaque to the caller; a backend only has to accept back the
/// handles it returned. Ordering (attach before create, listen before load,
/// unload before detach) is enforced by `ReadySession`, not by backends.
#[async_trait]
pub trait Instrumentation: Send + Sync {
    async fn resolve_device(
        &self,
        id: &DeviceId,
        timeout: Duration,
    ) -> Result<DeviceHandle, BackendError>;

    async fn attach(
        &self,
        device: &DeviceHandle,
        process_name: &str,
    ) -> Result<AttachHandle, BackendError>;

    async fn create_script(
        &self,
        attachment: &AttachHandle,
        source: &str,
    ) -> Result<ScriptHandle, BackendError>;

    async fn listen(&self, script: &ScriptHandle, events: EventSender) -> Result<(), BackendError>;

    async fn load(&self, script: &ScriptHandle) -> Result<(), BackendError>;

    /// Names of the remote-callable functions the loaded script exports.
    async fn exports(&self, script: &ScriptHandle) -> Result<Vec<String>, BackendError>;

    async fn call_export(
        &self,
        script: &ScriptHandle,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, BackendError>;

    async fn unload(&self, script: &ScriptHandle) -> Result<(), BackendError>;

    async fn detach(&self, attachment: &AttachHandle) -> Result<(), BackendError>;
}
