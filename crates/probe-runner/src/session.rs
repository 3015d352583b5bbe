use crate::agent::{AgentClient, REQUIRED_EXPORTS};
use crate::config::SessionTimeouts;
use crate::instrumentation::{AttachHandle, BackendError, Instrumentation, ScriptEvent, ScriptHandle};
use crate::payload::AgentPayload;
use probe_core::{DeviceId, HarnessError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupStep {
    Unload,
    Detach,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupFailure {
    pub step: CleanupStep,
    pub reason: String,
}

impl fmt::Display for CleanupFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.step {
            CleanupStep::Unload => write!(f, "unload failed: {}", self.reason),
            CleanupStep::Detach => write!(f, "detach failed: {}", self.reason),
        }
    }
}

/// Session setup failure plus whatever went wrong releasing the partially
/// acquired resources.
#[derive(Debug, Clone)]
pub struct SessionOpenError {
    pub error: HarnessError,
    pub cleanup: Vec<CleanupFailure>,
}

pub(crate) async fn bounded<T, F>(timeout: Duration, fut: F) -> Result<T, BackendError>
where
    F: Future<Output = Result<T, BackendError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(BackendError::new(format!(
            "timed out after {} ms",
            timeout.as_millis()
        ))),
    }
}

/// A device attachment with the agent loaded and its exports resolved.
///
/// Must be released with [`ReadySession::close`]; dropping it unclosed leaks
/// the attachment and is logged as an error.
pub struct ReadySession<'a> {
    backend: &'a dyn Instrumentation,
    device_id: DeviceId,
    attachment: AttachHandle,
    script: ScriptHandle,
    exports: Vec<String>,
    events: mpsc::UnboundedReceiver<ScriptEvent>,
    timeouts: SessionTimeouts,
    closed: bool,
}

impl<'a> ReadySession<'a> {
    pub async fn open(
        backend: &'a dyn Instrumentation,
        device_id: &DeviceId,
        process_name: &str,
        payload: &AgentPayload,
        timeouts: SessionTimeouts,
    ) -> Result<ReadySession<'a>, SessionOpenError> {
        let step = timeouts.step;
        // The bound is passed down and enforced here as well, in case the
        // backend ignores it.
        let device = bounded(
            timeouts.device,
            backend.resolve_device(device_id, timeouts.device),
        )
        .await
        .map_err(|e| SessionOpenError {
            error: HarnessError::DeviceUnavailable {
                device_id: device_id.clone(),
                reason: e.message,
            },
            cleanup: Vec::new(),
        })?;
        debug!(device = %device_id, name = %device.name, "device resolved");

        let attachment = bounded(step, backend.attach(&device, process_name))
            .await
            .map_err(|e| SessionOpenError {
                error: HarnessError::Attach {
                    device_id: device_id.clone(),
                    process: process_name.to_string(),
                    reason: e.message,
                },
                cleanup: Vec::new(),
            })?;

        let script = match bounded(step, backend.create_script(&attachment, &payload.source)).await
        {
            Ok(script) => script,
            Err(e) => {
                let cleanup = release(backend, None, &attachment, step).await;
                return Err(SessionOpenError {
                    error: load_error(device_id, "create script", e),
                    cleanup,
                });
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let loaded = async {
            bounded(step, backend.listen(&script, tx))
                .await
                .map_err(|e| load_error(device_id, "register listener", e))?;
            bounded(step, backend.load(&script))
                .await
                .map_err(|e| load_error(device_id, "load script", e))?;
            let exports = bounded(step, backend.exports(&script))
                .await
                .map_err(|e| HarnessError::ExportResolution {
                    device_id: device_id.clone(),
                    reason: e.message,
                })?;
            let missing: Vec<&str> = REQUIRED_EXPORTS
                .iter()
                .copied()
                .filter(|name| !exports.iter().any(|e| e == name))
                .collect();
            if !missing.is_empty() {
                return Err(HarnessError::ExportResolution {
                    device_id: device_id.clone(),
                    reason: format!("agent does not export {}", missing.join(", ")),
                });
            }
            Ok(exports)
        }
        .await;

        match loaded {
            Ok(exports) => Ok(ReadySession {
                backend,
                device_id: device_id.clone(),
                attachment,
                script,
                exports,
                events: rx,
                timeouts,
                closed: false,
            }),
            Err(error) => {
                let cleanup = release(backend, Some(&script), &attachment, step).await;
                Err(SessionOpenError { error, cleanup })
            }
        }
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn exports(&self) -> &[String] {
        &self.exports
    }

    pub fn agent(&self) -> AgentClient<'_> {
        AgentClient::new(self.backend, &self.script, self.timeouts.step)
    }

    /// Agent messages received so far, in arrival order.
    pub fn drain_events(&mut self) -> Vec<ScriptEvent> {
        let mut drained = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            drained.push(event);
        }
        drained
    }

    /// Unloads the script, then detaches. Both steps run even if the first
    /// fails; failures are returned rather than raised so they never replace
    /// an error already in flight.
    pub async fn close(mut self) -> Vec<CleanupFailure> {
        self.closed = true;
        let cleanup = release(
            self.backend,
            Some(&self.script),
            &self.attachment,
            self.timeouts.step,
        )
        .await;
        for failure in &cleanup {
            warn!(device = %self.device_id, "{}", failure);
        }
        cleanup
    }
}

impl Drop for ReadySession<'_> {
    fn drop(&mut self) {
        if !self.closed {
            error!(
                device = %self.device_id,
                "session dropped without close; attachment {} leaked",
                self.attachment.0
            );
        }
    }
}

fn load_error(device_id: &DeviceId, step: &str, e: BackendError) -> HarnessError {
    HarnessError::Load {
        device_id: device_id.clone(),
        reason: format!("{}: {}", step, e.message),
    }
}

async fn release(
    backend: &dyn Instrumentation,
    script: Option<&ScriptHandle>,
    attachment: &AttachHandle,
    timeout: Duration,
) -> Vec<CleanupFailure> {
    let mut failures = Vec::new();
    if let Some(script) = script {
        if let Err(e) = bounded(timeout, backend.unload(script)).await {
            failures.push(CleanupFailure {
                step: CleanupStep::Unload,
                reason: e.message,
            });
        }
    }
    if let Err(e) = bounded(timeout, backend.detach(attachment)).await {
        failures.push(CleanupFailure {
            step: CleanupStep::Detach,
            reason: e.message,
        });
    }
    failures
}
