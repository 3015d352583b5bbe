use crate::checks::{CheckKind, CheckReport, DeviceCheck};
use crate::config::{HarnessConfig, SessionTimeouts};
use crate::devices::{normalize_device_ids, DeviceSource};
use crate::instrumentation::{Instrumentation, ScriptEvent};
use crate::payload::{AgentPayload, PayloadCache};
use crate::session::{CleanupFailure, ReadySession};
use crate::sink::{
    DeviceRecord, ErrorRecord, EventRow, ReportSink, RunManifestRecord,
    DEVICE_RECORD_SCHEMA_VERSION, RUN_MANIFEST_SCHEMA_VERSION,
};
use chrono::{DateTime, Utc};
use probe_core::{DeviceId, HarnessError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    Enumerating,
    Attaching,
    Loading,
    Testing,
    Unloading,
    Completed,
    Aborted,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunPhase::Idle => "idle",
            RunPhase::Enumerating => "enumerating",
            RunPhase::Attaching => "attaching",
            RunPhase::Loading => "loading",
            RunPhase::Testing => "testing",
            RunPhase::Unloading => "unloading",
            RunPhase::Completed => "completed",
            RunPhase::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceOutcome {
    pub device_id: DeviceId,
    pub report: CheckReport,
    pub events: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub check: CheckKind,
    pub devices: Vec<DeviceOutcome>,
}

/// First failure of a run. Devices after `device_id` were not attempted.
#[derive(Debug, Clone)]
pub struct RunFailure {
    pub run_id: String,
    pub check: CheckKind,
    pub phase: RunPhase,
    pub device_id: Option<DeviceId>,
    pub error: HarnessError,
    pub cleanup: Vec<CleanupFailure>,
    pub completed: Vec<DeviceOutcome>,
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.device_id {
            Some(device) => write!(
                f,
                "{} check failed on {} while {}: {}",
                self.check, device, self.phase, self.error
            )?,
            None => write!(
                f,
                "{} run aborted while {}: {}",
                self.check, self.phase, self.error
            )?,
        }
        for failure in &self.cleanup {
            write!(f, "; cleanup {}", failure)?;
        }
        Ok(())
    }
}

impl std::error::Error for RunFailure {}

impl RunFailure {
    pub fn to_json(&self) -> Value {
        json!({
            "run_id": self.run_id,
            "check": self.check,
            "phase": self.phase,
            "device_id": self.device_id,
            "code": self.error.code(),
            "category": self.error.category(),
            "message": self.error.to_string(),
            "details": self.error.details(),
            "cleanup": self.cleanup,
            "passed_devices": self.completed.iter().map(|d| &d.device_id).collect::<Vec<_>>(),
        })
    }
}

struct DeviceFailure {
    phase: RunPhase,
    error: HarnessError,
    cleanup: Vec<CleanupFailure>,
}

/// Runs one check against every attached device, one device at a time, and
/// stops at the first failure.
pub struct Orchestrator<'a> {
    backend: &'a dyn Instrumentation,
    devices: &'a dyn DeviceSource,
    payload: &'a PayloadCache,
    target_process: String,
    timeouts: SessionTimeouts,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        backend: &'a dyn Instrumentation,
        devices: &'a dyn DeviceSource,
        payload: &'a PayloadCache,
        config: &HarnessConfig,
    ) -> Self {
        Self {
            backend,
            devices,
            payload,
            target_process: config.target_process.clone(),
            timeouts: config.timeouts,
        }
    }

    pub async fn run(
        &self,
        check: &dyn DeviceCheck,
        sink: &mut dyn ReportSink,
    ) -> Result<RunSummary, RunFailure> {
        let run_id = new_run_id();
        let mut phase = RunPhase::Idle;
        let abort = |phase: RunPhase, error: HarnessError| RunFailure {
            run_id: run_id.clone(),
            check: check.kind(),
            phase,
            device_id: None,
            error,
            cleanup: Vec::new(),
            completed: Vec::new(),
        };

        transition(&mut phase, RunPhase::Enumerating);
        let ids = match self.devices.list_device_ids().await {
            Ok(ids) => normalize_device_ids(ids),
            Err(error) => return Err(abort(phase, error)),
        };
        if ids.is_empty() {
            return Err(abort(phase, HarnessError::NoDevices));
        }
        info!(count = ids.len(), devices = ?ids, check = %check.kind(), "devices to verify");

        let payload = self.payload.get().await.map_err(|e| abort(phase, e))?;
        sink.write_run_manifest(&RunManifestRecord {
            schema_version: RUN_MANIFEST_SCHEMA_VERSION.to_string(),
            run_id: run_id.clone(),
            created_at: Utc::now().to_rfc3339(),
            check: check.kind(),
            target_process: self.target_process.clone(),
            payload_path: payload.path.display().to_string(),
            payload_digest: payload.digest.clone(),
            device_ids: ids.clone(),
        })
        .map_err(|e| abort(phase, HarnessError::Report(e.to_string())))?;

        let mut completed = Vec::new();
        for device_id in &ids {
            match self
                .run_device(&run_id, device_id, &payload, check, sink, &mut phase)
                .await
            {
                Ok(outcome) => completed.push(outcome),
                Err(failure) => {
                    if let Err(e) = sink.flush() {
                        warn!("failed flushing report after device failure: {}", e);
                    }
                    transition(&mut phase, RunPhase::Aborted);
                    return Err(RunFailure {
                        run_id,
                        check: check.kind(),
                        phase: failure.phase,
                        device_id: Some(device_id.clone()),
                        error: failure.error,
                        cleanup: failure.cleanup,
                        completed,
                    });
                }
            }
        }

        sink.flush()
            .map_err(|e| abort(phase, HarnessError::Report(e.to_string())))?;
        transition(&mut phase, RunPhase::Completed);
        Ok(RunSummary {
            run_id,
            check: check.kind(),
            devices: completed,
        })
    }

    async fn run_device(
        &self,
        run_id: &str,
        device_id: &DeviceId,
        payload: &AgentPayload,
        check: &dyn DeviceCheck,
        sink: &mut dyn ReportSink,
        phase: &mut RunPhase,
    ) -> Result<DeviceOutcome, DeviceFailure> {
        let started_at = Utc::now();
        transition(phase, RunPhase::Attaching);
        info!(device = %device_id, process = %self.target_process, "attaching");

        let mut session = match ReadySession::open(
            self.backend,
            device_id,
            &self.target_process,
            payload,
            self.timeouts,
        )
        .await
        {
            Ok(session) => session,
            Err(open_err) => {
                let failed_in = match open_err.error {
                    HarnessError::DeviceUnavailable { .. } | HarnessError::Attach { .. } => {
                        RunPhase::Attaching
                    }
                    _ => RunPhase::Loading,
                };
                let failure = DeviceFailure {
                    phase: failed_in,
                    error: open_err.error,
                    cleanup: open_err.cleanup,
                };
                record_failure(sink, run_id, device_id, check.kind(), started_at, &failure);
                return Err(failure);
            }
        };

        transition(phase, RunPhase::Testing);
        let result = {
            let agent = session.agent();
            check.run(&agent, device_id).await
        };
        let events = session.drain_events();
        log_events(device_id, &events);

        transition(phase, RunPhase::Unloading);
        let cleanup = session.close().await;

        let rows = event_rows(run_id, device_id, &events);
        let outcome = match result {
            Ok(report) if cleanup.is_empty() => Ok(report),
            Ok(_) => Err(DeviceFailure {
                phase: RunPhase::Unloading,
                error: HarnessError::Teardown {
                    device_id: device_id.clone(),
                    reason: cleanup
                        .iter()
                        .map(|c| c.to_string())
                        .collect::<Vec<_>>()
                        .join("; "),
                },
                cleanup: Vec::new(),
            }),
            Err(error) => Err(DeviceFailure {
                phase: RunPhase::Testing,
                error,
                cleanup,
            }),
        };

        match outcome {
            Ok(report) => {
                let record = device_record(
                    run_id,
                    device_id,
                    check.kind(),
                    started_at,
                    Some(&report),
                    None,
                    Vec::new(),
                );
                sink.append_event_rows(&rows)
                    .and_then(|_| sink.append_device_record(&record))
                    .map_err(|e| DeviceFailure {
                        phase: RunPhase::Unloading,
                        error: HarnessError::Report(e.to_string()),
                        cleanup: Vec::new(),
                    })?;
                info!(device = %device_id, check = %check.kind(), "passed");
                Ok(DeviceOutcome {
                    device_id: device_id.clone(),
                    report,
                    events: events.len(),
                })
            }
            Err(failure) => {
                if let Err(e) = sink.append_event_rows(&rows) {
                    warn!(device = %device_id, "failed recording agent events: {}", e);
                }
                record_failure(sink, run_id, device_id, check.kind(), started_at, &failure);
                Err(failure)
            }
        }
    }
}

fn transition(phase: &mut RunPhase, next: RunPhase) {
    debug!(from = %phase, to = %next, "run phase");
    *phase = next;
}

fn new_run_id() -> String {
    format!("run_{}", Utc::now().format("%Y%m%d_%H%M%S_%6f"))
}

fn log_events(device_id: &DeviceId, events: &[ScriptEvent]) {
    for event in events {
        info!(device = %device_id, message = %event.message, "agent message");
    }
}

fn event_rows(run_id: &str, device_id: &DeviceId, events: &[ScriptEvent]) -> Vec<EventRow> {
    let ts = Utc::now().to_rfc3339();
    events
        .iter()
        .enumerate()
        .map(|(idx, event)| EventRow {
            run_id: run_id.to_string(),
            device_id: device_id.clone(),
            seq: idx + 1,
            ts: ts.clone(),
            message: event.message.clone(),
            data: event.data.clone(),
        })
        .collect()
}

fn device_record(
    run_id: &str,
    device_id: &DeviceId,
    check: CheckKind,
    started_at: DateTime<Utc>,
    report: Option<&CheckReport>,
    error: Option<&HarnessError>,
    cleanup: Vec<CleanupFailure>,
) -> DeviceRecord {
    DeviceRecord {
        schema_version: DEVICE_RECORD_SCHEMA_VERSION.to_string(),
        run_id: run_id.to_string(),
        device_id: device_id.clone(),
        check,
        outcome: if error.is_none() { "passed" } else { "failed" }.to_string(),
        started_at: started_at.to_rfc3339(),
        finished_at: Utc::now().to_rfc3339(),
        descriptor: report.and_then(|r| r.descriptor.clone()),
        details: report.map(|r| r.details.clone()).unwrap_or(Value::Null),
        error: error.map(|e| ErrorRecord {
            code: e.code().to_string(),
            message: e.to_string(),
            details: e.details(),
        }),
        cleanup,
    }
}

fn record_failure(
    sink: &mut dyn ReportSink,
    run_id: &str,
    device_id: &DeviceId,
    check: CheckKind,
    started_at: DateTime<Utc>,
    failure: &DeviceFailure,
) {
    let record = device_record(
        run_id,
        device_id,
        check,
        started_at,
        None,
        Some(&failure.error),
        failure.cleanup.clone(),
    );
    if let Err(e) = sink.append_device_record(&record) {
        warn!(device = %device_id, "failed recording device failure: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checks::{HookInstallCheck, OffsetLayoutCheck};
    use crate::devices::StaticDeviceSource;
    use crate::fake::{FakeDevice, FakeInstrumentation, FakeStep};
    use crate::sink::BufferedReportSink;
    use async_trait::async_trait;
    use probe_core::{OffsetField, PointerSize};
    use probe_matrix::default_table;
    use std::fs;
    use std::path::PathBuf;

    struct PayloadFile {
        path: PathBuf,
    }

    impl PayloadFile {
        fn new(name: &str) -> Self {
            let path = std::env::temp_dir().join(format!(
                "probe_orchestrator_{}_{}_{}.js",
                name,
                std::process::id(),
                Utc::now().timestamp_micros()
            ));
            fs::write(&path, "rpc.exports = {};").expect("write payload");
            Self { path }
        }
    }

    impl Drop for PayloadFile {
        fn drop(&mut self) {
            let _ = fs::remove_file(&self.path);
        }
    }

    fn ids(raw: &[&str]) -> Vec<DeviceId> {
        raw.iter().map(|s| DeviceId::from(*s)).collect()
    }

    fn attach_order(fake: &FakeInstrumentation) -> Vec<String> {
        fake.calls()
            .into_iter()
            .filter(|c| c.op == "attach")
            .map(|c| c.device_id.to_string())
            .collect()
    }

    async fn run_check(
        fake: &FakeInstrumentation,
        devices: &[&str],
        check: &dyn DeviceCheck,
        sink: &mut BufferedReportSink,
    ) -> Result<RunSummary, RunFailure> {
        let payload_file = PayloadFile::new("run");
        let payload = PayloadCache::new(&payload_file.path);
        let source = StaticDeviceSource::new(ids(devices));
        let orchestrator = Orchestrator::new(fake, &source, &payload, &HarnessConfig::default());
        orchestrator.run(check, sink).await
    }

    #[tokio::test]
    async fn devices_are_tested_in_sorted_order() {
        let fake = FakeInstrumentation::new()
            .with_device(FakeDevice::art("dev-2", "6.0.1", PointerSize::Eight))
            .with_device(FakeDevice::art("dev-1", "5.1.1", PointerSize::Four));
        let mut sink = BufferedReportSink::default();
        let summary = run_check(&fake, &["dev-2", "dev-1"], &HookInstallCheck, &mut sink)
            .await
            .expect("both devices pass");

        assert_eq!(attach_order(&fake), vec!["dev-1", "dev-2"]);
        let tested: Vec<String> = summary
            .devices
            .iter()
            .map(|d| d.device_id.to_string())
            .collect();
        assert_eq!(tested, vec!["dev-1", "dev-2"]);
        assert_eq!(sink.device_records.len(), 2);
        assert!(sink.device_records.iter().all(|r| r.outcome == "passed"));
    }

    #[tokio::test]
    async fn each_session_is_closed_before_the_next_device_is_attached() {
        let fake = FakeInstrumentation::new()
            .with_device(FakeDevice::art("dev-1", "6.0.1", PointerSize::Four))
            .with_device(FakeDevice::art("dev-2", "6.0", PointerSize::Eight));
        let mut sink = BufferedReportSink::default();
        let check = OffsetLayoutCheck::new(default_table());
        run_check(&fake, &["dev-1", "dev-2"], &check, &mut sink)
            .await
            .expect("offsets match");

        let ops: Vec<(String, String)> = fake
            .calls()
            .into_iter()
            .filter(|c| c.op != "call")
            .map(|c| (c.op, c.device_id.to_string()))
            .collect();
        let detach_dev1 = ops
            .iter()
            .position(|(op, d)| op == "detach" && d == "dev-1")
            .expect("dev-1 detached");
        let resolve_dev2 = ops
            .iter()
            .position(|(op, d)| op == "resolve_device" && d == "dev-2")
            .expect("dev-2 resolved");
        assert!(detach_dev1 < resolve_dev2);
        assert_eq!(fake.open_attachments(), 0);
    }

    #[tokio::test]
    async fn offsets_check_reports_descriptor_and_row() {
        let fake = FakeInstrumentation::new()
            .with_device(FakeDevice::art("emulator-5554", "5.0.2", PointerSize::Four));
        let mut sink = BufferedReportSink::default();
        let check = OffsetLayoutCheck::new(default_table());
        let summary = run_check(&fake, &["emulator-5554"], &check, &mut sink)
            .await
            .expect("5.0 offsets match");
        let report = &summary.devices[0].report;
        assert_eq!(report.descriptor.as_ref().map(|d| d.version.as_str()), Some("5.0.2"));
        assert_eq!(report.details["row"]["version_prefix"], "5.0");
        assert_eq!(report.details["offsets"]["class_linker"], 208);
        assert_eq!(sink.manifests.len(), 1);
        assert_eq!(sink.manifests[0].device_ids, ids(&["emulator-5554"]));
    }

    #[tokio::test]
    async fn zero_devices_abort_before_any_session() {
        let fake = FakeInstrumentation::new();
        let mut sink = BufferedReportSink::default();
        let failure = run_check(&fake, &[], &HookInstallCheck, &mut sink)
            .await
            .expect_err("no devices");
        assert!(matches!(failure.error, HarnessError::NoDevices));
        assert_eq!(failure.phase, RunPhase::Enumerating);
        assert!(failure.device_id.is_none());
        assert!(fake.calls().is_empty());
        assert!(sink.manifests.is_empty());
    }

    #[tokio::test]
    async fn broken_payload_aborts_before_any_device_is_touched() {
        let fake = FakeInstrumentation::new()
            .with_device(FakeDevice::art("dev-1", "6.0.1", PointerSize::Four));
        let payload = PayloadCache::new("/nonexistent/probe/_agent.js");
        let source = StaticDeviceSource::new(ids(&["dev-1"]));
        let orchestrator = Orchestrator::new(&fake, &source, &payload, &HarnessConfig::default());
        let mut sink = BufferedReportSink::default();
        let failure = orchestrator
            .run(&HookInstallCheck, &mut sink)
            .await
            .expect_err("payload missing");
        assert_eq!(failure.error.code(), "payload_load_error");
        assert!(fake.calls().is_empty());
    }

    #[tokio::test]
    async fn first_failing_device_stops_the_run() {
        let mut bad = FakeDevice::art("dev-1", "6.0.1", PointerSize::Four);
        bad = bad.with_offset(OffsetField::ClassLinker, 237);
        let fake = FakeInstrumentation::new()
            .with_device(bad)
            .with_device(FakeDevice::art("dev-2", "6.0.1", PointerSize::Four));
        let mut sink = BufferedReportSink::default();
        let check = OffsetLayoutCheck::new(default_table());
        let failure = run_check(&fake, &["dev-1", "dev-2"], &check, &mut sink)
            .await
            .expect_err("dev-1 mismatches");

        assert_eq!(failure.device_id, Some(DeviceId::from("dev-1")));
        assert_eq!(failure.phase, RunPhase::Testing);
        match &failure.error {
            HarnessError::OffsetMismatch { mismatches } => {
                assert_eq!(mismatches.len(), 1);
                assert_eq!(mismatches[0].field, OffsetField::ClassLinker);
                assert_eq!(mismatches[0].expected, 236);
                assert_eq!(mismatches[0].actual, 237);
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(attach_order(&fake).iter().all(|d| d == "dev-1"));
        assert_eq!(fake.count("detach"), 1);
        assert_eq!(sink.device_records.len(), 1);
        assert_eq!(sink.device_records[0].outcome, "failed");
        let msg = failure.to_string();
        assert!(msg.contains("offsets check failed on dev-1 while testing"), "{}", msg);
    }

    #[tokio::test]
    async fn later_failure_keeps_earlier_passes() {
        let fake = FakeInstrumentation::new()
            .with_device(FakeDevice::art("dev-1", "6.0.1", PointerSize::Four))
            .with_device(FakeDevice::art("dev-2", "7.0", PointerSize::Four))
            .with_device(FakeDevice::art("dev-3", "6.0.1", PointerSize::Four));
        let mut sink = BufferedReportSink::default();
        let check = OffsetLayoutCheck::new(default_table());
        let failure = run_check(&fake, &["dev-3", "dev-2", "dev-1"], &check, &mut sink)
            .await
            .expect_err("7.0 is unclassified");
        assert_eq!(failure.device_id, Some(DeviceId::from("dev-2")));
        assert_eq!(failure.error.code(), "unclassified_configuration");
        assert_eq!(failure.completed.len(), 1);
        assert_eq!(failure.completed[0].device_id, DeviceId::from("dev-1"));
        assert_eq!(attach_order(&fake), vec!["dev-1", "dev-2"]);
        let json = failure.to_json();
        assert_eq!(json["passed_devices"][0], "dev-1");
        assert_eq!(json["details"]["version"], "7.0");
    }

    #[tokio::test]
    async fn session_is_closed_exactly_once_when_the_check_fails() {
        let fake = FakeInstrumentation::new()
            .with_device(FakeDevice::art("dev-1", "6.0.1", PointerSize::Four).pre_hooked());
        let mut sink = BufferedReportSink::default();
        let failure = run_check(&fake, &["dev-1"], &HookInstallCheck, &mut sink)
            .await
            .expect_err("pre-existing hook");
        assert_eq!(failure.error.code(), "hook_behavior_error");
        assert_eq!(fake.count("attach"), 1);
        assert_eq!(fake.count("unload"), 1);
        assert_eq!(fake.count("detach"), 1);
        assert_eq!(fake.open_attachments(), 0);
    }

    struct UnknownExportCheck;

    #[async_trait]
    impl DeviceCheck for UnknownExportCheck {
        fn kind(&self) -> CheckKind {
            CheckKind::Hooks
        }

        async fn run(
            &self,
            agent: &crate::agent::AgentClient<'_>,
            _device_id: &DeviceId,
        ) -> Result<CheckReport, HarnessError> {
            agent.call("getHookTriggerCount", Vec::new()).await?;
            agent.call("noSuchExport", Vec::new()).await?;
            Ok(CheckReport {
                descriptor: None,
                details: Value::Null,
            })
        }
    }

    #[tokio::test]
    async fn every_opened_session_is_closed_across_many_devices() {
        let mut fake = FakeInstrumentation::new();
        let names: Vec<String> = (0..5).map(|i| format!("dev-{}", i)).collect();
        for name in &names {
            fake = fake.with_device(FakeDevice::art(name, "6.0.1", PointerSize::Four));
        }
        let refs: Vec<&str> = names.iter().map(|s| s.as_str()).collect();

        let mut sink = BufferedReportSink::default();
        run_check(&fake, &refs, &HookInstallCheck, &mut sink)
            .await
            .expect("all pass");
        assert_eq!(fake.count("attach"), 5);
        assert_eq!(fake.count("detach"), 5);

        let mut sink = BufferedReportSink::default();
        let failure = run_check(&fake, &refs, &UnknownExportCheck, &mut sink)
            .await
            .expect_err("unknown export");
        assert_eq!(failure.error.code(), "remote_call_error");
        assert_eq!(fake.count("attach"), 6);
        assert_eq!(fake.count("detach"), 6);
        assert_eq!(fake.open_attachments(), 0);
    }

    #[tokio::test]
    async fn attach_failure_is_reported_in_the_attaching_phase() {
        let fake = FakeInstrumentation::new()
            .with_device(FakeDevice::art("dev-1", "6.0.1", PointerSize::Four))
            .failing(FakeStep::Attach, "dev-1", "process not found");
        let mut sink = BufferedReportSink::default();
        let failure = run_check(&fake, &["dev-1"], &HookInstallCheck, &mut sink)
            .await
            .expect_err("attach fails");
        assert_eq!(failure.phase, RunPhase::Attaching);
        assert_eq!(failure.error.code(), "attach_error");
        assert_eq!(fake.count("detach"), 0);
    }

    #[tokio::test]
    async fn cleanup_failure_never_masks_the_check_failure() {
        let fake = FakeInstrumentation::new()
            .with_device(FakeDevice::art("dev-1", "6.0.1", PointerSize::Four).with_hook_increment(2))
            .failing(FakeStep::Detach, "dev-1", "connection lost");
        let mut sink = BufferedReportSink::default();
        let failure = run_check(&fake, &["dev-1"], &HookInstallCheck, &mut sink)
            .await
            .expect_err("double increment");
        assert_eq!(failure.error.code(), "hook_behavior_error");
        assert_eq!(failure.cleanup.len(), 1);
        assert!(failure.to_string().contains("cleanup detach failed: connection lost"));
        assert_eq!(sink.device_records[0].cleanup.len(), 1);
    }

    #[tokio::test]
    async fn teardown_failure_after_a_pass_fails_the_run() {
        let fake = FakeInstrumentation::new()
            .with_device(FakeDevice::art("dev-1", "6.0.1", PointerSize::Four))
            .with_device(FakeDevice::art("dev-2", "6.0.1", PointerSize::Four))
            .failing(FakeStep::Unload, "dev-1", "script already destroyed");
        let mut sink = BufferedReportSink::default();
        let failure = run_check(&fake, &["dev-1", "dev-2"], &HookInstallCheck, &mut sink)
            .await
            .expect_err("unload fails");
        assert_eq!(failure.phase, RunPhase::Unloading);
        assert_eq!(failure.error.code(), "teardown_error");
        assert_eq!(fake.count("detach"), 1);
        assert_eq!(attach_order(&fake), vec!["dev-1"]);
    }

    #[tokio::test]
    async fn agent_messages_are_recorded_per_device() {
        let fake = FakeInstrumentation::new().with_device(
            FakeDevice::art("dev-1", "6.0.1", PointerSize::Four)
                .with_load_message(json!({"type": "send", "payload": "ready"})),
        );
        let mut sink = BufferedReportSink::default();
        let summary = run_check(&fake, &["dev-1"], &HookInstallCheck, &mut sink)
            .await
            .expect("pass");
        assert_eq!(summary.devices[0].events, 1);
        assert_eq!(sink.event_rows.len(), 1);
        assert_eq!(sink.event_rows[0].seq, 1);
        assert_eq!(sink.event_rows[0].message["payload"], "ready");
    }

    #[tokio::test]
    async fn payload_is_shared_across_runs() {
        let fake = FakeInstrumentation::new()
            .with_device(FakeDevice::art("dev-1", "6.0.1", PointerSize::Four));
        let payload_file = PayloadFile::new("shared");
        let payload = PayloadCache::new(&payload_file.path);
        let source = StaticDeviceSource::new(ids(&["dev-1"]));
        let orchestrator = Orchestrator::new(&fake, &source, &payload, &HarnessConfig::default());
        let mut sink = BufferedReportSink::default();
        orchestrator
            .run(&OffsetLayoutCheck::new(default_table()), &mut sink)
            .await
            .expect("offsets");
        fs::remove_file(&payload_file.path).expect("remove payload");
        orchestrator
            .run(&HookInstallCheck, &mut sink)
            .await
            .expect("hooks run reuses cached payload");
        assert_eq!(sink.manifests.len(), 2);
        assert_eq!(sink.manifests[0].payload_digest, sink.manifests[1].payload_digest);
        assert_ne!(sink.manifests[0].run_id, sink.manifests[1].run_id);
    }

    #[tokio::test]
    async fn device_records_satisfy_the_report_schema() {
        let fake = FakeInstrumentation::new()
            .with_device(FakeDevice::art("dev-1", "6.0.1", PointerSize::Four))
            .with_device(FakeDevice::art("dev-2", "6.0.1", PointerSize::Four).pre_hooked());
        let mut sink = BufferedReportSink::default();
        let _ = run_check(&fake, &["dev-1", "dev-2"], &HookInstallCheck, &mut sink).await;
        assert_eq!(sink.device_records.len(), 2);
        for record in &sink.device_records {
            let value = serde_json::to_value(record).expect("record json");
            probe_schemas::validate_value(probe_schemas::DEVICE_RECORD_SCHEMA, &value)
                .expect("record matches schema");
        }
        assert_eq!(
            sink.device_records[1].error.as_ref().map(|e| e.code.as_str()),
            Some("hook_behavior_error")
        );
    }
}
