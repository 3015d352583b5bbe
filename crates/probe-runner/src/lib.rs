mod agent;
mod bridge;
mod checks;
mod config;
mod devices;
pub mod fake;
mod hooks;
mod instrumentation;
mod orchestrator;
mod payload;
mod session;
mod sink;

pub use agent::{
    AgentClient, EXPORT_ANDROID_VERSION, EXPORT_CALL_MONITORED_METHOD, EXPORT_CLASS_LINKER_SPEC,
    EXPORT_HOOK_TRIGGER_COUNT, EXPORT_INSTALL_HOOK, EXPORT_METHOD_SPEC, EXPORT_POINTER_SIZE,
    EXPORT_RUNTIME_SPEC, REQUIRED_EXPORTS,
};
pub use bridge::BridgeInstrumentation;
pub use checks::{CheckKind, CheckReport, DeviceCheck, HookInstallCheck, OffsetLayoutCheck};
pub use config::{HarnessConfig, SessionTimeouts};
pub use devices::{
    normalize_device_ids, parse_device_listing, CommandDeviceSource, DeviceSource,
    StaticDeviceSource,
};
pub use hooks::{verify_hook_installation, HookReport, HookTarget};
pub use instrumentation::{
    AttachHandle, BackendError, DeviceHandle, EventSender, Instrumentation, ScriptEvent,
    ScriptHandle,
};
pub use orchestrator::{DeviceOutcome, Orchestrator, RunFailure, RunPhase, RunSummary};
pub use payload::{AgentPayload, PayloadCache};
pub use session::{CleanupFailure, CleanupStep, ReadySession, SessionOpenError};
pub use sink::{
    BufferedReportSink, DeviceRecord, ErrorRecord, EventRow, JsonlReportSink, ReportSink,
    RunManifestRecord, DEVICE_RECORD_SCHEMA_VERSION, RUN_MANIFEST_SCHEMA_VERSION,
};
