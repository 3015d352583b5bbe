//! Instrumentation backend that drives a helper process over stdio.
//!
//! The helper owns the actual instrumentation framework binding. Each line on
//! its stdin is a request and each line on its stdout is either a reply or an
//! agent event:
//!
//! ```text
//! -> {"id":1,"op":"attach","params":{"device_id":"emulator-5554","process":"com.android.systemui"}}
//! <- {"id":1,"ok":true,"result":"session-1"}
//! <- {"id":2,"ok":false,"error":"unable to find process"}
//! <- {"event":"message","script":"script-1","message":{"type":"send","payload":"ready"}}
//! ```
//!
//! Handles are the plain strings the helper returns. Event listeners are kept
//! on this side and keyed by script handle.

use crate::instrumentation::{
    AttachHandle, BackendError, DeviceHandle, EventSender, Instrumentation, ScriptEvent,
    ScriptHandle,
};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use probe_core::DeviceId;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

type Reply = Result<Value, BackendError>;

struct Pending {
    op: String,
    reply: oneshot::Sender<Reply>,
}

#[derive(Default)]
struct BridgeState {
    writer: Option<mpsc::UnboundedSender<String>>,
    next_id: u64,
    pending: HashMap<u64, Pending>,
    /// Abandoned requests whose late result is a remote handle to release.
    orphans: HashMap<u64, String>,
    listeners: HashMap<String, EventSender>,
    closed: Option<String>,
}

/// Request that undoes `op`, and the parameter naming the handle it returned.
fn release_op(op: &str) -> Option<(&'static str, &'static str)> {
    match op {
        "attach" => Some(("detach", "session")),
        "create_script" => Some(("unload", "script")),
        _ => None,
    }
}

impl BridgeState {
    fn send(&mut self, op: &str, params: Value) -> Result<u64, BackendError> {
        if let Some(reason) = &self.closed {
            return Err(BackendError::new(reason.clone()));
        }
        let Some(writer) = self.writer.as_ref() else {
            return Err(BackendError::new("bridge is shut down"));
        };
        let id = self.next_id + 1;
        let line = serde_json::to_string(&json!({ "id": id, "op": op, "params": params }))
            .map_err(|e| BackendError::new(format!("failed encoding {} request: {}", op, e)))?;
        writer
            .send(line)
            .map_err(|_| BackendError::new("bridge is shut down"))?;
        self.next_id = id;
        Ok(id)
    }

    /// Frees what a request produced after its caller stopped waiting.
    fn release_abandoned(&mut self, op: &str, result: &Value) {
        let Some((undo, key)) = release_op(op) else {
            return;
        };
        let Some(handle) = result.as_str() else {
            warn!(%op, %result, "abandoned request returned a non-handle result");
            return;
        };
        warn!(%op, %handle, "releasing {} from a request that timed out", handle);
        if undo == "unload" {
            self.listeners.remove(handle);
        }
        let mut params = Map::new();
        params.insert(key.to_string(), Value::String(handle.to_string()));
        if let Err(e) = self.send(undo, Value::Object(params)) {
            warn!(%handle, "failed to {} abandoned handle: {}", undo, e.message);
        }
    }
}

fn lock_state(state: &Mutex<BridgeState>) -> MutexGuard<'_, BridgeState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BridgeLine {
    Event {
        event: String,
        script: String,
        #[serde(default)]
        message: Value,
        #[serde(default)]
        data: Option<Value>,
    },
    Reply {
        id: u64,
        ok: bool,
        #[serde(default)]
        result: Value,
        #[serde(default)]
        error: Option<String>,
    },
}

pub struct BridgeInstrumentation {
    command: Vec<String>,
    child: tokio::sync::Mutex<Option<Child>>,
    state: Arc<Mutex<BridgeState>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl BridgeInstrumentation {
    pub fn spawn(command: &[String]) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| anyhow!("bridge command is empty"))?;
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to start bridge {}", program))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("bridge stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("bridge stdout unavailable"))?;
        debug!(command = ?command, pid = ?child.id(), "bridge started");

        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(BridgeState {
            writer: Some(writer_tx),
            ..BridgeState::default()
        }));
        let writer = tokio::spawn(writer_loop(stdin, writer_rx, Arc::clone(&state)));
        let reader = tokio::spawn(reader_loop(stdout, Arc::clone(&state)));

        Ok(Self {
            command: command.to_vec(),
            child: tokio::sync::Mutex::new(Some(child)),
            state,
            reader,
            writer,
        })
    }

    /// Closes the helper's stdin and waits briefly for it to exit before
    /// killing it. Pending requests fail once its stdout closes.
    pub async fn shutdown(&self) -> Result<()> {
        lock_state(&self.state).writer.take();
        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };
        match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
            Ok(status) => {
                let status = status.context("failed waiting for bridge")?;
                debug!(%status, "bridge exited");
            }
            Err(_) => {
                warn!(command = ?self.command, "bridge did not exit; killing");
                child.kill().await.context("failed killing bridge")?;
            }
        }
        Ok(())
    }

    async fn request(&self, op: &str, params: Value) -> Reply {
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut state = lock_state(&self.state);
            let id = state.send(op, params)?;
            state.pending.insert(
                id,
                Pending {
                    op: op.to_string(),
                    reply: tx,
                },
            );
            id
        };
        let mut guard = PendingGuard {
            state: Arc::clone(&self.state),
            id,
            op: op.to_string(),
            rx,
            done: false,
        };

        let reply = (&mut guard.rx)
            .await
            .unwrap_or_else(|_| Err(BackendError::new("bridge dropped the request")));
        guard.done = true;
        reply
    }

    async fn request_as<T: DeserializeOwned>(&self, op: &str, params: Value) -> Result<T, BackendError> {
        let value = self.request(op, params).await?;
        serde_json::from_value(value.clone()).map_err(|e| {
            BackendError::new(format!("unexpected {} result {}: {}", op, value, e))
        })
    }
}

impl Drop for BridgeInstrumentation {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// Runs when a caller stops waiting (timeout or cancellation) and makes sure
/// a late result that carries a handle is still released.
struct PendingGuard {
    state: Arc<Mutex<BridgeState>>,
    id: u64,
    op: String,
    rx: oneshot::Receiver<Reply>,
    done: bool,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let mut state = lock_state(&self.state);
        let pending = state.pending.remove(&self.id);
        match pending {
            Some(pending) => {
                if release_op(&pending.op).is_some() && state.closed.is_none() {
                    state.orphans.insert(self.id, pending.op);
                }
            }
            // Reply already routed but never read.
            None => {
                if let Ok(Ok(result)) = self.rx.try_recv() {
                    state.release_abandoned(&self.op, &result);
                }
            }
        }
    }
}

async fn writer_loop(
    mut stdin: ChildStdin,
    mut rx: mpsc::UnboundedReceiver<String>,
    state: Arc<Mutex<BridgeState>>,
) {
    while let Some(mut line) = rx.recv().await {
        line.push('\n');
        let written = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        }
        .await;
        if let Err(e) = written {
            warn!("bridge write failed: {}", e);
            fail_pending(&state, format!("failed writing to bridge: {}", e));
            break;
        }
    }
}

async fn reader_loop(stdout: ChildStdout, state: Arc<Mutex<BridgeState>>) {
    let mut lines = BufReader::new(stdout).lines();
    let reason = loop {
        match lines.next_line().await {
            Ok(Some(line)) => route_line(&state, &line),
            Ok(None) => break "bridge exited".to_string(),
            Err(e) => break format!("failed reading from bridge: {}", e),
        }
    };
    debug!(%reason, "bridge reader stopped");
    fail_pending(&state, reason);
}

fn fail_pending(state: &Mutex<BridgeState>, reason: String) {
    let mut state = lock_state(state);
    for (_, pending) in state.pending.drain() {
        let _ = pending.reply.send(Err(BackendError::new(reason.clone())));
    }
    if !state.orphans.is_empty() {
        warn!(count = state.orphans.len(), "bridge closed with abandoned handles outstanding");
        state.orphans.clear();
    }
    state.listeners.clear();
    state.closed.get_or_insert(reason);
}

fn route_line(state: &Mutex<BridgeState>, line: &str) {
    if line.trim().is_empty() {
        return;
    }
    let parsed: BridgeLine = match serde_json::from_str(line) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(%line, "ignoring malformed bridge line: {}", e);
            return;
        }
    };
    let mut state = lock_state(state);
    match parsed {
        BridgeLine::Event {
            event,
            script,
            message,
            data,
        } => {
            if event != "message" {
                debug!(%event, %script, "ignoring bridge event");
                return;
            }
            match state.listeners.get(&script) {
                Some(listener) => {
                    let _ = listener.send(ScriptEvent {
                        script: ScriptHandle(script),
                        message,
                        data,
                    });
                }
                None => warn!(%script, "agent message for script without listener"),
            }
        }
        BridgeLine::Reply {
            id,
            ok,
            result,
            error,
        } => {
            let pending = state.pending.remove(&id);
            if let Some(pending) = pending {
                let reply = if ok {
                    Ok(result)
                } else {
                    Err(BackendError::new(
                        error.unwrap_or_else(|| "bridge reported an unspecified error".to_string()),
                    ))
                };
                if let Err(Ok(result)) = pending.reply.send(reply) {
                    state.release_abandoned(&pending.op, &result);
                }
                return;
            }
            let orphan = state.orphans.remove(&id);
            match orphan {
                Some(op) if ok => state.release_abandoned(&op, &result),
                Some(op) => debug!(id, %op, "abandoned request failed; nothing to release"),
                None => debug!(id, "reply for abandoned request"),
            }
        }
    }
}

#[async_trait]
impl Instrumentation for BridgeInstrumentation {
    async fn resolve_device(
        &self,
        id: &DeviceId,
        timeout: Duration,
    ) -> Result<DeviceHandle, BackendError> {
        self.request_as(
            "resolve_device",
            json!({ "device_id": id, "timeout_ms": timeout.as_millis() as u64 }),
        )
        .await
    }

    async fn attach(
        &self,
        device: &DeviceHandle,
        process_name: &str,
    ) -> Result<AttachHandle, BackendError> {
        self.request_as(
            "attach",
            json!({ "device_id": device.id, "process": process_name }),
        )
        .await
    }

    async fn create_script(
        &self,
        attachment: &AttachHandle,
        source: &str,
    ) -> Result<ScriptHandle, BackendError> {
        self.request_as(
            "create_script",
            json!({ "session": attachment, "source": source }),
        )
        .await
    }

    async fn listen(&self, script: &ScriptHandle, events: EventSender) -> Result<(), BackendError> {
        let mut state = lock_state(&self.state);
        if let Some(reason) = &state.closed {
            return Err(BackendError::new(reason.clone()));
        }
        state.listeners.insert(script.0.clone(), events);
        Ok(())
    }

    async fn load(&self, script: &ScriptHandle) -> Result<(), BackendError> {
        self.request("load", json!({ "script": script })).await?;
        Ok(())
    }

    async fn exports(&self, script: &ScriptHandle) -> Result<Vec<String>, BackendError> {
        self.request_as("exports", json!({ "script": script })).await
    }

    async fn call_export(
        &self,
        script: &ScriptHandle,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, BackendError> {
        self.request(
            "call_export",
            json!({ "script": script, "method": method, "args": args }),
        )
        .await
    }

    async fn unload(&self, script: &ScriptHandle) -> Result<(), BackendError> {
        let result = self.request("unload", json!({ "script": script })).await;
        lock_state(&self.state).listeners.remove(&script.0);
        result.map(|_| ())
    }

    async fn detach(&self, attachment: &AttachHandle) -> Result<(), BackendError> {
        self.request("detach", json!({ "session": attachment })).await?;
        Ok(())
    }
}
