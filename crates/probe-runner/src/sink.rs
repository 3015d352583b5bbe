use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::checks::CheckKind;
use crate::session::CleanupFailure;
use probe_core::{DeviceId, RuntimeDescriptor};

const FACTS_DIR: &str = "facts";
const FACTS_DEVICES_FILE: &str = "devices.jsonl";
const FACTS_EVENTS_FILE: &str = "events.jsonl";
const FACTS_RUN_MANIFEST_FILE: &str = "run_manifest.json";

pub const RUN_MANIFEST_SCHEMA_VERSION: &str = "run_manifest_v1";
pub const DEVICE_RECORD_SCHEMA_VERSION: &str = "device_record_v1";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifestRecord {
    pub schema_version: String,
    pub run_id: String,
    pub created_at: String,
    pub check: CheckKind,
    pub target_process: String,
    pub payload_path: String,
    pub payload_digest: String,
    pub device_ids: Vec<DeviceId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub code: String,
    pub message: String,
    pub details: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub schema_version: String,
    pub run_id: String,
    pub device_id: DeviceId,
    pub check: CheckKind,
    pub outcome: String,
    pub started_at: String,
    pub finished_at: String,
    pub descriptor: Option<RuntimeDescriptor>,
    pub details: Value,
    pub error: Option<ErrorRecord>,
    pub cleanup: Vec<CleanupFailure>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRow {
    pub run_id: String,
    pub device_id: DeviceId,
    pub seq: usize,
    pub ts: String,
    pub message: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

pub trait ReportSink {
    fn write_run_manifest(&mut self, run: &RunManifestRecord) -> Result<()>;
    fn append_device_record(&mut self, row: &DeviceRecord) -> Result<()>;
    fn append_event_rows(&mut self, rows: &[EventRow]) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
}

pub struct JsonlReportSink {
    run_manifest_path: PathBuf,
    devices_writer: BufWriter<File>,
    events_writer: BufWriter<File>,
}

impl JsonlReportSink {
    pub fn new(report_dir: &Path) -> Result<Self> {
        let facts_dir = report_dir.join(FACTS_DIR);
        fs::create_dir_all(&facts_dir)?;

        Ok(Self {
            run_manifest_path: facts_dir.join(FACTS_RUN_MANIFEST_FILE),
            devices_writer: open_append(facts_dir.join(FACTS_DEVICES_FILE))?,
            events_writer: open_append(facts_dir.join(FACTS_EVENTS_FILE))?,
        })
    }

    pub fn devices_path(report_dir: &Path) -> PathBuf {
        report_dir.join(FACTS_DIR).join(FACTS_DEVICES_FILE)
    }

    pub fn events_path(report_dir: &Path) -> PathBuf {
        report_dir.join(FACTS_DIR).join(FACTS_EVENTS_FILE)
    }

    pub fn run_manifest_path(report_dir: &Path) -> PathBuf {
        report_dir.join(FACTS_DIR).join(FACTS_RUN_MANIFEST_FILE)
    }
}

impl ReportSink for JsonlReportSink {
    fn write_run_manifest(&mut self, run: &RunManifestRecord) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(run)?;
        fs::write(&self.run_manifest_path, bytes)?;
        Ok(())
    }

    fn append_device_record(&mut self, row: &DeviceRecord) -> Result<()> {
        write_jsonl_row(&mut self.devices_writer, row)
    }

    fn append_event_rows(&mut self, rows: &[EventRow]) -> Result<()> {
        for row in rows {
            write_jsonl_row(&mut self.events_writer, row)?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.devices_writer.flush()?;
        self.events_writer.flush()?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct BufferedReportSink {
    pub manifests: Vec<RunManifestRecord>,
    pub device_records: Vec<DeviceRecord>,
    pub event_rows: Vec<EventRow>,
}

impl ReportSink for BufferedReportSink {
    fn write_run_manifest(&mut self, run: &RunManifestRecord) -> Result<()> {
        self.manifests.push(run.clone());
        Ok(())
    }

    fn append_device_record(&mut self, row: &DeviceRecord) -> Result<()> {
        self.device_records.push(row.clone());
        Ok(())
    }

    fn append_event_rows(&mut self, rows: &[EventRow]) -> Result<()> {
        self.event_rows.extend(rows.iter().cloned());
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

fn open_append(path: PathBuf) -> Result<BufWriter<File>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(BufWriter::new(file))
}

fn write_jsonl_row<T: Serialize>(writer: &mut BufWriter<File>, row: &T) -> Result<()> {
    serde_json::to_writer(&mut *writer, row)?;
    writer.write_all(b"\n")?;
    Ok(())
}
