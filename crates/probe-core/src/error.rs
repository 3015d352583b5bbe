use crate::model::{DeviceId, HookPhase, OffsetField, PointerSize};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetMismatch {
    pub field: OffsetField,
    pub expected: u64,
    pub actual: u64,
}

impl fmt::Display for OffsetMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} expected {} got {}",
            self.field, self.expected, self.actual
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    RunSetup,
    SessionSetup,
    Assertion,
    Teardown,
    Report,
}

#[derive(Debug, Clone, Error)]
pub enum HarnessError {
    #[error("device enumeration failed: {0}")]
    Enumeration(String),

    #[error("no connected devices")]
    NoDevices,

    #[error("failed to load agent payload {}: {reason}", .path.display())]
    PayloadLoad { path: PathBuf, reason: String },

    #[error("device {device_id} unavailable: {reason}")]
    DeviceUnavailable { device_id: DeviceId, reason: String },

    #[error("failed to attach to {process} on {device_id}: {reason}")]
    Attach {
        device_id: DeviceId,
        process: String,
        reason: String,
    },

    #[error("failed to load agent on {device_id}: {reason}")]
    Load { device_id: DeviceId, reason: String },

    #[error("failed to resolve agent exports on {device_id}: {reason}")]
    ExportResolution { device_id: DeviceId, reason: String },

    #[error("agent call {method} failed: {reason}")]
    RemoteCall { method: String, reason: String },

    #[error("Unhandled flavor: no expectation row for version {version} with {pointer_size}-byte pointers")]
    UnclassifiedConfiguration {
        version: String,
        pointer_size: PointerSize,
    },

    #[error("ambiguous expectation rows {prefixes:?} for version {version} with {pointer_size}-byte pointers")]
    AmbiguousConfiguration {
        version: String,
        pointer_size: PointerSize,
        prefixes: Vec<String>,
    },

    #[error("offset mismatch: {}", join_mismatches(.mismatches))]
    OffsetMismatch { mismatches: Vec<OffsetMismatch> },

    #[error("hook misbehaved {phase}: expected counter delta {expected}, observed {observed}")]
    HookBehavior {
        phase: HookPhase,
        expected: i64,
        observed: i64,
    },

    #[error("session teardown failed on {device_id}: {reason}")]
    Teardown { device_id: DeviceId, reason: String },

    #[error("invalid expectation table: {0}")]
    InvalidExpectationTable(String),

    #[error("failed writing report: {0}")]
    Report(String),
}

fn join_mismatches(mismatches: &[OffsetMismatch]) -> String {
    mismatches
        .iter()
        .map(|m| m.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl HarnessError {
    pub fn code(&self) -> &'static str {
        match self {
            HarnessError::Enumeration(_) => "enumeration_error",
            HarnessError::NoDevices => "no_devices",
            HarnessError::PayloadLoad { .. } => "payload_load_error",
            HarnessError::DeviceUnavailable { .. } => "device_unavailable",
            HarnessError::Attach { .. } => "attach_error",
            HarnessError::Load { .. } => "load_error",
            HarnessError::ExportResolution { .. } => "export_resolution_error",
            HarnessError::RemoteCall { .. } => "remote_call_error",
            HarnessError::UnclassifiedConfiguration { .. } => "unclassified_configuration",
            HarnessError::AmbiguousConfiguration { .. } => "ambiguous_configuration",
            HarnessError::OffsetMismatch { .. } => "offset_mismatch",
            HarnessError::HookBehavior { .. } => "hook_behavior_error",
            HarnessError::Teardown { .. } => "teardown_error",
            HarnessError::InvalidExpectationTable(_) => "invalid_expectation_table",
            HarnessError::Report(_) => "report_error",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            HarnessError::Enumeration(_)
            | HarnessError::NoDevices
            | HarnessError::PayloadLoad { .. }
            | HarnessError::InvalidExpectationTable(_) => ErrorCategory::RunSetup,
            HarnessError::DeviceUnavailable { .. }
            | HarnessError::Attach { .. }
            | HarnessError::Load { .. }
            | HarnessError::ExportResolution { .. } => ErrorCategory::SessionSetup,
            HarnessError::RemoteCall { .. }
            | HarnessError::UnclassifiedConfiguration { .. }
            | HarnessError::AmbiguousConfiguration { .. }
            | HarnessError::OffsetMismatch { .. }
            | HarnessError::HookBehavior { .. } => ErrorCategory::Assertion,
            HarnessError::Teardown { .. } => ErrorCategory::Teardown,
            HarnessError::Report(_) => ErrorCategory::Report,
        }
    }

    /// Structured diagnostic detail for reports and `--json` output.
    pub fn details(&self) -> Value {
        match self {
            HarnessError::UnclassifiedConfiguration {
                version,
                pointer_size,
            } => json!({ "version": version, "pointer_size": pointer_size }),
            HarnessError::AmbiguousConfiguration {
                version,
                pointer_size,
                prefixes,
            } => json!({
                "version": version,
                "pointer_size": pointer_size,
                "prefixes": prefixes,
            }),
            HarnessError::OffsetMismatch { mismatches } => json!({ "mismatches": mismatches }),
            HarnessError::HookBehavior {
                phase,
                expected,
                observed,
            } => json!({ "phase": phase, "expected_delta": expected, "observed_delta": observed }),
            HarnessError::DeviceUnavailable { device_id, .. }
            | HarnessError::Load { device_id, .. }
            | HarnessError::ExportResolution { device_id, .. }
            | HarnessError::Teardown { device_id, .. } => json!({ "device_id": device_id }),
            HarnessError::Attach {
                device_id, process, ..
            } => json!({ "device_id": device_id, "process": process }),
            HarnessError::RemoteCall { method, .. } => json!({ "method": method }),
            HarnessError::PayloadLoad { path, .. } => json!({ "path": path }),
            _ => json!({}),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_mismatch_message_lists_every_field() {
        let err = HarnessError::OffsetMismatch {
            mismatches: vec![
                OffsetMismatch {
                    field: OffsetField::ClassLinker,
                    expected: 236,
                    actual: 237,
                },
                OffsetMismatch {
                    field: OffsetField::MethodAccessFlags,
                    expected: 12,
                    actual: 4,
                },
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("classLinkerOffset expected 236 got 237"), "{}", msg);
        assert!(msg.contains("method.accessFlags expected 12 got 4"), "{}", msg);
        assert_eq!(err.category(), ErrorCategory::Assertion);
        assert_eq!(err.details()["mismatches"][0]["field"], "classLinkerOffset");
    }

    #[test]
    fn unclassified_configuration_keeps_the_unhandled_flavor_wording() {
        let err = HarnessError::UnclassifiedConfiguration {
            version: "7.0".to_string(),
            pointer_size: PointerSize::Four,
        };
        assert!(err.to_string().starts_with("Unhandled flavor"));
        assert!(err.to_string().contains("7.0"));
        assert_eq!(err.code(), "unclassified_configuration");
        assert_eq!(err.details()["pointer_size"], 4);
    }

    #[test]
    fn setup_errors_are_classified_before_the_device_loop() {
        assert_eq!(HarnessError::NoDevices.category(), ErrorCategory::RunSetup);
        assert_eq!(
            HarnessError::Enumeration("adb missing".into()).category(),
            ErrorCategory::RunSetup
        );
        let attach = HarnessError::Attach {
            device_id: DeviceId::from("emulator-5554"),
            process: "com.android.systemui".into(),
            reason: "process not found".into(),
        };
        assert_eq!(attach.category(), ErrorCategory::SessionSetup);
        assert_eq!(attach.details()["process"], "com.android.systemui");
    }
}
