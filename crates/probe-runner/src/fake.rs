//! In-memory instrumentation backend with a scripted agent.
//!
//! Every backend call is recorded, so tests can assert on ordering and on how
//! often attach/detach happened. Failures and hangs are injected per step and
//! per device.

use crate::agent::{
    EXPORT_ANDROID_VERSION, EXPORT_CALL_MONITORED_METHOD, EXPORT_CLASS_LINKER_SPEC,
    EXPORT_HOOK_TRIGGER_COUNT, EXPORT_INSTALL_HOOK, EXPORT_METHOD_SPEC, EXPORT_POINTER_SIZE,
    EXPORT_RUNTIME_SPEC, REQUIRED_EXPORTS,
};
use crate::instrumentation::{
    AttachHandle, BackendError, DeviceHandle, EventSender, Instrumentation, ScriptEvent,
    ScriptHandle,
};
use async_trait::async_trait;
use probe_core::{
    DeviceId, MethodOffsets, OffsetField, OffsetTable, PointerSize, RuntimeDescriptor,
};
use probe_matrix::default_table;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FakeStep {
    Resolve,
    Attach,
    CreateScript,
    Listen,
    Load,
    Exports,
    Call,
    Unload,
    Detach,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeCall {
    pub op: String,
    pub device_id: DeviceId,
    pub detail: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FakeDevice {
    id: DeviceId,
    descriptor: RuntimeDescriptor,
    offsets: OffsetTable,
    hook_increment: i64,
    pre_hooked: bool,
    missing_exports: HashSet<String>,
    export_results: HashMap<String, Value>,
    load_messages: Vec<Value>,
}

impl FakeDevice {
    pub fn new(id: &str, descriptor: RuntimeDescriptor, offsets: OffsetTable) -> Self {
        Self {
            id: DeviceId::from(id),
            descriptor,
            offsets,
            hook_increment: 1,
            pre_hooked: false,
            missing_exports: HashSet::new(),
            export_results: HashMap::new(),
            load_messages: Vec::new(),
        }
    }

    /// A device whose agent reports exactly the built-in expectations for its
    /// flavor. Unknown flavors report all-zero offsets.
    pub fn art(id: &str, version: &str, pointer_size: PointerSize) -> Self {
        let descriptor = RuntimeDescriptor {
            version: version.to_string(),
            pointer_size,
        };
        let table = default_table();
        let offsets = match table.lookup(&descriptor) {
            Ok(row) => {
                let field = |f: OffsetField| row.expected.get(&f).copied().unwrap_or(0);
                OffsetTable {
                    class_linker: field(OffsetField::ClassLinker),
                    quick_generic_jni_trampoline: field(OffsetField::QuickGenericJniTrampoline),
                    method: MethodOffsets {
                        interpreter_code: field(OffsetField::MethodInterpreterCode),
                        jni_code: field(OffsetField::MethodJniCode),
                        quick_code: field(OffsetField::MethodQuickCode),
                        access_flags: field(OffsetField::MethodAccessFlags),
                    },
                }
            }
            Err(_) => OffsetTable {
                class_linker: 0,
                quick_generic_jni_trampoline: 0,
                method: MethodOffsets {
                    interpreter_code: 0,
                    jni_code: 0,
                    quick_code: 0,
                    access_flags: 0,
                },
            },
        };
        Self::new(id, descriptor, offsets)
    }

    pub fn with_offset(mut self, field: OffsetField, value: u64) -> Self {
        let slot = match field {
            OffsetField::ClassLinker => &mut self.offsets.class_linker,
            OffsetField::QuickGenericJniTrampoline => &mut self.offsets.quick_generic_jni_trampoline,
            OffsetField::MethodInterpreterCode => &mut self.offsets.method.interpreter_code,
            OffsetField::MethodJniCode => &mut self.offsets.method.jni_code,
            OffsetField::MethodQuickCode => &mut self.offsets.method.quick_code,
            OffsetField::MethodAccessFlags => &mut self.offsets.method.access_flags,
        };
        *slot = value;
        self
    }

    /// Counter increase per monitored call once the hook is active.
    pub fn with_hook_increment(mut self, increment: i64) -> Self {
        self.hook_increment = increment;
        self
    }

    /// The hook is already active before the harness installs it.
    pub fn pre_hooked(mut self) -> Self {
        self.pre_hooked = true;
        self
    }

    pub fn without_export(mut self, name: &str) -> Self {
        self.missing_exports.insert(name.to_string());
        self
    }

    pub fn with_export_result(mut self, name: &str, result: Value) -> Self {
        self.export_results.insert(name.to_string(), result);
        self
    }

    /// Posted to the registered listener while the script loads.
    pub fn with_load_message(mut self, message: Value) -> Self {
        self.load_messages.push(message);
        self
    }
}

struct FakeAttachment {
    device_id: DeviceId,
    detached: bool,
}

struct FakeScript {
    device_id: DeviceId,
    listener: Option<EventSender>,
    loaded: bool,
    unloaded: bool,
    hooked: bool,
    counter: i64,
}

#[derive(Default)]
struct FakeState {
    devices: BTreeMap<DeviceId, FakeDevice>,
    failures: HashMap<(FakeStep, DeviceId), String>,
    hangs: HashSet<(FakeStep, DeviceId)>,
    calls: Vec<FakeCall>,
    handle_seq: u64,
    attachments: HashMap<String, FakeAttachment>,
    scripts: HashMap<String, FakeScript>,
}

impl FakeState {
    fn next_handle(&mut self, prefix: &str) -> String {
        self.handle_seq += 1;
        format!("fake.{}.{}", prefix, self.handle_seq)
    }

    fn attachment_device(&self, handle: &AttachHandle) -> Result<DeviceId, BackendError> {
        self.attachments
            .get(&handle.0)
            .map(|a| a.device_id.clone())
            .ok_or_else(|| BackendError::new(format!("unknown attachment {}", handle.0)))
    }

    fn script_device(&self, handle: &ScriptHandle) -> Result<DeviceId, BackendError> {
        self.scripts
            .get(&handle.0)
            .map(|s| s.device_id.clone())
            .ok_or_else(|| BackendError::new(format!("unknown script {}", handle.0)))
    }
}

#[derive(Clone, Default)]
pub struct FakeInstrumentation {
    state: Arc<Mutex<FakeState>>,
}

impl FakeInstrumentation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(self, device: FakeDevice) -> Self {
        self.state().devices.insert(device.id.clone(), device);
        self
    }

    pub fn failing(self, step: FakeStep, device_id: &str, reason: &str) -> Self {
        self.state()
            .failures
            .insert((step, DeviceId::from(device_id)), reason.to_string());
        self
    }

    /// The step never completes; only a caller-side timeout gets past it.
    pub fn hanging(self, step: FakeStep, device_id: &str) -> Self {
        self.state().hangs.insert((step, DeviceId::from(device_id)));
        self
    }

    pub fn calls(&self) -> Vec<FakeCall> {
        self.state().calls.clone()
    }

    pub fn count(&self, op: &str) -> usize {
        self.state().calls.iter().filter(|c| c.op == op).count()
    }

    /// Attachments made and not yet detached.
    pub fn open_attachments(&self) -> usize {
        self.state()
            .attachments
            .values()
            .filter(|a| !a.detached)
            .count()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Records the call, then applies any injected failure or hang.
    async fn enter(
        &self,
        step: FakeStep,
        op: &str,
        device_id: &DeviceId,
        detail: Option<String>,
    ) -> Result<(), BackendError> {
        let hang = {
            let mut state = self.state();
            state.calls.push(FakeCall {
                op: op.to_string(),
                device_id: device_id.clone(),
                detail,
            });
            let key = (step, device_id.clone());
            if let Some(reason) = state.failures.get(&key) {
                return Err(BackendError::new(reason.clone()));
            }
            state.hangs.contains(&key)
        };
        if hang {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}

#[async_trait]
impl Instrumentation for FakeInstrumentation {
    async fn resolve_device(
        &self,
        id: &DeviceId,
        _timeout: Duration,
    ) -> Result<DeviceHandle, BackendError> {
        self.enter(FakeStep::Resolve, "resolve_device", id, None).await?;
        let state = self.state();
        if !state.devices.contains_key(id) {
            return Err(BackendError::new(format!(
                "unable to find device with id {}",
                id
            )));
        }
        Ok(DeviceHandle {
            id: id.clone(),
            name: format!("fake device {}", id),
        })
    }

    async fn attach(
        &self,
        device: &DeviceHandle,
        process_name: &str,
    ) -> Result<AttachHandle, BackendError> {
        self.enter(
            FakeStep::Attach,
            "attach",
            &device.id,
            Some(process_name.to_string()),
        )
        .await?;
        let mut state = self.state();
        let handle = state.next_handle("attachment");
        state.attachments.insert(
            handle.clone(),
            FakeAttachment {
                device_id: device.id.clone(),
                detached: false,
            },
        );
        Ok(AttachHandle(handle))
    }

    async fn create_script(
        &self,
        attachment: &AttachHandle,
        _source: &str,
    ) -> Result<ScriptHandle, BackendError> {
        let device_id = self.state().attachment_device(attachment)?;
        self.enter(FakeStep::CreateScript, "create_script", &device_id, None)
            .await?;
        let mut state = self.state();
        let handle = state.next_handle("script");
        state.scripts.insert(
            handle.clone(),
            FakeScript {
                device_id,
                listener: None,
                loaded: false,
                unloaded: false,
                hooked: false,
                counter: 0,
            },
        );
        Ok(ScriptHandle(handle))
    }

    async fn listen(&self, script: &ScriptHandle, events: EventSender) -> Result<(), BackendError> {
        let device_id = self.state().script_device(script)?;
        self.enter(FakeStep::Listen, "listen", &device_id, None).await?;
        if let Some(entry) = self.state().scripts.get_mut(&script.0) {
            entry.listener = Some(events);
        }
        Ok(())
    }

    async fn load(&self, script: &ScriptHandle) -> Result<(), BackendError> {
        let device_id = self.state().script_device(script)?;
        self.enter(FakeStep::Load, "load", &device_id, None).await?;
        let mut state = self.state();
        let messages = state
            .devices
            .get(&device_id)
            .map(|d| d.load_messages.clone())
            .unwrap_or_default();
        let pre_hooked = state
            .devices
            .get(&device_id)
            .map(|d| d.pre_hooked)
            .unwrap_or(false);
        let Some(entry) = state.scripts.get_mut(&script.0) else {
            return Err(BackendError::new(format!("unknown script {}", script.0)));
        };
        entry.loaded = true;
        entry.hooked = pre_hooked;
        if let Some(listener) = &entry.listener {
            for message in messages {
                let _ = listener.send(ScriptEvent {
                    script: script.clone(),
                    message,
                    data: None,
                });
            }
        }
        Ok(())
    }

    async fn exports(&self, script: &ScriptHandle) -> Result<Vec<String>, BackendError> {
        let device_id = self.state().script_device(script)?;
        self.enter(FakeStep::Exports, "exports", &device_id, None).await?;
        let state = self.state();
        let loaded = state.scripts.get(&script.0).map(|s| s.loaded).unwrap_or(false);
        if !loaded {
            return Err(BackendError::new("script is not loaded"));
        }
        let missing = state
            .devices
            .get(&device_id)
            .map(|d| d.missing_exports.clone())
            .unwrap_or_default();
        Ok(REQUIRED_EXPORTS
            .iter()
            .filter(|name| !missing.contains(**name))
            .map(|name| name.to_string())
            .collect())
    }

    async fn call_export(
        &self,
        script: &ScriptHandle,
        method: &str,
        _args: Vec<Value>,
    ) -> Result<Value, BackendError> {
        let device_id = self.state().script_device(script)?;
        self.enter(FakeStep::Call, "call", &device_id, Some(method.to_string()))
            .await?;
        let mut state = self.state();
        let Some(device) = state.devices.get(&device_id).cloned() else {
            return Err(BackendError::new(format!("device {} went away", device_id)));
        };
        let Some(entry) = state.scripts.get_mut(&script.0) else {
            return Err(BackendError::new(format!("unknown script {}", script.0)));
        };
        if !entry.loaded || entry.unloaded {
            return Err(BackendError::new("script is destroyed"));
        }
        if device.missing_exports.contains(method) {
            return Err(BackendError::new(format!("unable to find method '{}'", method)));
        }
        if let Some(result) = device.export_results.get(method) {
            return Ok(result.clone());
        }

        let offsets = device.offsets;
        match method {
            EXPORT_ANDROID_VERSION => Ok(json!(device.descriptor.version)),
            EXPORT_POINTER_SIZE => Ok(json!(device.descriptor.pointer_size.bytes())),
            EXPORT_RUNTIME_SPEC => Ok(json!({
                "offset": { "classLinker": offsets.class_linker }
            })),
            EXPORT_CLASS_LINKER_SPEC => Ok(json!({
                "offset": { "quickGenericJniTrampoline": offsets.quick_generic_jni_trampoline }
            })),
            EXPORT_METHOD_SPEC => Ok(json!({
                "offset": {
                    "interpreterCode": offsets.method.interpreter_code,
                    "jniCode": offsets.method.jni_code,
                    "quickCode": offsets.method.quick_code,
                    "accessFlags": offsets.method.access_flags,
                }
            })),
            EXPORT_HOOK_TRIGGER_COUNT => Ok(json!(entry.counter)),
            EXPORT_CALL_MONITORED_METHOD => {
                if entry.hooked {
                    entry.counter += device.hook_increment;
                }
                Ok(Value::Null)
            }
            EXPORT_INSTALL_HOOK => {
                entry.hooked = true;
                Ok(Value::Null)
            }
            other => Err(BackendError::new(format!("unable to find method '{}'", other))),
        }
    }

    async fn unload(&self, script: &ScriptHandle) -> Result<(), BackendError> {
        let device_id = self.state().script_device(script)?;
        self.enter(FakeStep::Unload, "unload", &device_id, None).await?;
        let mut state = self.state();
        let Some(entry) = state.scripts.get_mut(&script.0) else {
            return Err(BackendError::new(format!("unknown script {}", script.0)));
        };
        if entry.unloaded {
            return Err(BackendError::new("script is destroyed"));
        }
        entry.unloaded = true;
        entry.listener = None;
        Ok(())
    }

    async fn detach(&self, attachment: &AttachHandle) -> Result<(), BackendError> {
        let device_id = self.state().attachment_device(attachment)?;
        self.enter(FakeStep::Detach, "detach", &device_id, None).await?;
        let mut state = self.state();
        let Some(entry) = state.attachments.get_mut(&attachment.0) else {
            return Err(BackendError::new(format!("unknown attachment {}", attachment.0)));
        };
        if entry.detached {
            return Err(BackendError::new("session is detached"));
        }
        entry.detached = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn art_device_reports_the_built_in_row() {
        let device = FakeDevice::art("dev-1", "5.1.1", PointerSize::Four);
        assert_eq!(device.offsets.class_linker, 212);
        assert_eq!(device.offsets.method.access_flags, 20);

        let unknown = FakeDevice::art("dev-2", "7.0", PointerSize::Four);
        assert_eq!(unknown.offsets.class_linker, 0);
    }

    #[tokio::test]
    async fn injected_failure_is_recorded_and_returned() {
        let fake = FakeInstrumentation::new()
            .with_device(FakeDevice::art("dev-1", "6.0.1", PointerSize::Four))
            .failing(FakeStep::Attach, "dev-1", "process not found");
        let device = fake
            .resolve_device(&DeviceId::from("dev-1"), Duration::from_millis(10))
            .await
            .expect("resolve");
        let err = fake
            .attach(&device, "com.android.systemui")
            .await
            .expect_err("attach fails");
        assert_eq!(err.message, "process not found");
        assert_eq!(fake.count("attach"), 1);
        assert_eq!(fake.open_attachments(), 0);
        assert_eq!(
            fake.calls()[1].detail.as_deref(),
            Some("com.android.systemui")
        );
    }

    #[tokio::test]
    async fn second_detach_is_rejected() {
        let fake = FakeInstrumentation::new()
            .with_device(FakeDevice::art("dev-1", "6.0.1", PointerSize::Four));
        let device = fake
            .resolve_device(&DeviceId::from("dev-1"), Duration::from_millis(10))
            .await
            .expect("resolve");
        let attachment = fake.attach(&device, "p").await.expect("attach");
        assert_eq!(fake.open_attachments(), 1);
        fake.detach(&attachment).await.expect("detach");
        assert!(fake.detach(&attachment).await.is_err());
        assert_eq!(fake.open_attachments(), 0);
    }
}
