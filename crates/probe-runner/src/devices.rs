use async_trait::async_trait;
use probe_core::{DeviceId, HarnessError};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

#[async_trait]
pub trait DeviceSource: Send + Sync {
    async fn list_device_ids(&self) -> Result<Vec<DeviceId>, HarnessError>;
}

/// Lists devices by running an external command such as `adb devices -l`.
#[derive(Debug, Clone)]
pub struct CommandDeviceSource {
    command: Vec<String>,
}

impl CommandDeviceSource {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

#[async_trait]
impl DeviceSource for CommandDeviceSource {
    async fn list_device_ids(&self) -> Result<Vec<DeviceId>, HarnessError> {
        let Some((program, args)) = self.command.split_first() else {
            return Err(HarnessError::Enumeration(
                "device listing command is empty".to_string(),
            ));
        };
        debug!(command = ?self.command, "listing devices");
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| HarnessError::Enumeration(format!("failed to run {}: {}", program, e)))?;
        if !output.status.success() {
            let status = output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            return Err(HarnessError::Enumeration(format!(
                "{} exited with status {}: {}",
                program,
                status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(parse_device_listing(&String::from_utf8_lossy(
            &output.stdout,
        )))
    }
}

/// A fixed device list, e.g. devices pinned on the command line.
#[derive(Debug, Clone, Default)]
pub struct StaticDeviceSource {
    ids: Vec<DeviceId>,
}

impl StaticDeviceSource {
    pub fn new(ids: impl IntoIterator<Item = DeviceId>) -> Self {
        Self {
            ids: ids.into_iter().collect(),
        }
    }
}

#[async_trait]
impl DeviceSource for StaticDeviceSource {
    async fn list_device_ids(&self) -> Result<Vec<DeviceId>, HarnessError> {
        Ok(self.ids.clone())
    }
}

/// Parses `adb devices -l` style output: daemon notices (`* ...`) are
/// ignored, the first remaining line is a header, and every other non-blank
/// line starts with a device id.
pub fn parse_device_listing(stdout: &str) -> Vec<DeviceId> {
    let ids = stdout
        .lines()
        .filter(|line| !line.trim_start().starts_with('*'))
        .skip(1)
        .filter_map(|line| line.split_whitespace().next())
        .map(DeviceId::new)
        .collect();
    normalize_device_ids(ids)
}

pub fn normalize_device_ids(mut ids: Vec<DeviceId>) -> Vec<DeviceId> {
    ids.sort();
    ids.dedup();
    ids
}
