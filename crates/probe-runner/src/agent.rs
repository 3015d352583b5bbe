use crate::hooks::HookTarget;
use crate::instrumentation::{Instrumentation, ScriptHandle};
use crate::session::bounded;
use async_trait::async_trait;
use probe_core::{HarnessError, MethodOffsets, OffsetTable, PointerSize, RuntimeDescriptor};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

pub const EXPORT_ANDROID_VERSION: &str = "getAndroidVersion";
pub const EXPORT_POINTER_SIZE: &str = "getPointerSize";
pub const EXPORT_RUNTIME_SPEC: &str = "getArtRuntimeSpec";
pub const EXPORT_CLASS_LINKER_SPEC: &str = "getArtClassLinkerSpec";
pub const EXPORT_METHOD_SPEC: &str = "getArtMethodSpec";
pub const EXPORT_HOOK_TRIGGER_COUNT: &str = "getHookTriggerCount";
pub const EXPORT_CALL_MONITORED_METHOD: &str = "callJavaMethod";
pub const EXPORT_INSTALL_HOOK: &str = "hookJavaMethod";

pub const REQUIRED_EXPORTS: &[&str] = &[
    EXPORT_ANDROID_VERSION,
    EXPORT_POINTER_SIZE,
    EXPORT_RUNTIME_SPEC,
    EXPORT_CLASS_LINKER_SPEC,
    EXPORT_METHOD_SPEC,
    EXPORT_HOOK_TRIGGER_COUNT,
    EXPORT_CALL_MONITORED_METHOD,
    EXPORT_INSTALL_HOOK,
];

#[derive(Debug, Deserialize)]
struct Spec<T> {
    offset: T,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RuntimeOffsets {
    class_linker: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClassLinkerOffsets {
    quick_generic_jni_trampoline: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MethodSpecOffsets {
    interpreter_code: u64,
    jni_code: u64,
    quick_code: u64,
    access_flags: u64,
}

/// Typed view of the loaded agent's exports. Every call is bounded by the
/// session step timeout.
#[derive(Clone, Copy)]
pub struct AgentClient<'s> {
    backend: &'s dyn Instrumentation,
    script: &'s ScriptHandle,
    timeout: Duration,
}

impl<'s> AgentClient<'s> {
    pub fn new(backend: &'s dyn Instrumentation, script: &'s ScriptHandle, timeout: Duration) -> Self {
        Self {
            backend,
            script,
            timeout,
        }
    }

    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, HarnessError> {
        bounded(
            self.timeout,
            self.backend.call_export(self.script, method, args),
        )
        .await
        .map_err(|e| HarnessError::RemoteCall {
            method: method.to_string(),
            reason: e.message,
        })
    }

    async fn call_as<T: DeserializeOwned>(&self, method: &str) -> Result<T, HarnessError> {
        let value = self.call(method, Vec::new()).await?;
        serde_json::from_value(value.clone()).map_err(|e| HarnessError::RemoteCall {
            method: method.to_string(),
            reason: format!("unexpected result {}: {}", value, e),
        })
    }

    pub async fn runtime_descriptor(&self) -> Result<RuntimeDescriptor, HarnessError> {
        let version: String = self.call_as(EXPORT_ANDROID_VERSION).await?;
        let raw_pointer_size: u64 = self.call_as(EXPORT_POINTER_SIZE).await?;
        let pointer_size =
            PointerSize::try_from(raw_pointer_size).map_err(|reason| HarnessError::RemoteCall {
                method: EXPORT_POINTER_SIZE.to_string(),
                reason,
            })?;
        Ok(RuntimeDescriptor {
            version,
            pointer_size,
        })
    }

    pub async fn offset_table(&self) -> Result<OffsetTable, HarnessError> {
        let runtime: Spec<RuntimeOffsets> = self.call_as(EXPORT_RUNTIME_SPEC).await?;
        let linker: Spec<ClassLinkerOffsets> = self.call_as(EXPORT_CLASS_LINKER_SPEC).await?;
        let method: Spec<MethodSpecOffsets> = self.call_as(EXPORT_METHOD_SPEC).await?;
        Ok(OffsetTable {
            class_linker: runtime.offset.class_linker,
            quick_generic_jni_trampoline: linker.offset.quick_generic_jni_trampoline,
            method: MethodOffsets {
                interpreter_code: method.offset.interpreter_code,
                jni_code: method.offset.jni_code,
                quick_code: method.offset.quick_code,
                access_flags: method.offset.access_flags,
            },
        })
    }
}

#[async_trait]
impl HookTarget for AgentClient<'_> {
    async fn hook_trigger_count(&self) -> Result<i64, HarnessError> {
        self.call_as(EXPORT_HOOK_TRIGGER_COUNT).await
    }

    async fn call_monitored_method(&self) -> Result<(), HarnessError> {
        self.call(EXPORT_CALL_MONITORED_METHOD, Vec::new()).await?;
        Ok(())
    }

    async fn install_hook(&self) -> Result<(), HarnessError> {
        self.call(EXPORT_INSTALL_HOOK, Vec::new()).await?;
        Ok(())
    }
}
