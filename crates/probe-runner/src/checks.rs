use crate::agent::AgentClient;
use crate::hooks::verify_hook_installation;
use async_trait::async_trait;
use probe_core::{DeviceId, HarnessError, RuntimeDescriptor};
use probe_matrix::ExpectationTable;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    Offsets,
    Hooks,
}

impl fmt::Display for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckKind::Offsets => f.write_str("offsets"),
            CheckKind::Hooks => f.write_str("hooks"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckReport {
    pub descriptor: Option<RuntimeDescriptor>,
    pub details: Value,
}

/// One assertion pass run against a ready session on a single device.
#[async_trait]
pub trait DeviceCheck: Send + Sync {
    fn kind(&self) -> CheckKind;

    async fn run(
        &self,
        agent: &AgentClient<'_>,
        device_id: &DeviceId,
    ) -> Result<CheckReport, HarnessError>;
}

/// Compares the agent's measured structure offsets with the expectation
/// table row for the device's runtime flavor.
#[derive(Debug, Clone)]
pub struct OffsetLayoutCheck {
    table: ExpectationTable,
}

impl OffsetLayoutCheck {
    pub fn new(table: ExpectationTable) -> Self {
        Self { table }
    }
}

#[async_trait]
impl DeviceCheck for OffsetLayoutCheck {
    fn kind(&self) -> CheckKind {
        CheckKind::Offsets
    }

    async fn run(
        &self,
        agent: &AgentClient<'_>,
        device_id: &DeviceId,
    ) -> Result<CheckReport, HarnessError> {
        let descriptor = agent.runtime_descriptor().await?;
        info!(
            device = %device_id,
            version = %descriptor.version,
            pointer_size = %descriptor.pointer_size,
            "runtime flavor"
        );
        // Classify before reading offsets so an unknown flavor is reported
        // as such even if the agent cannot measure it.
        self.table.lookup(&descriptor)?;
        let offsets = agent.offset_table().await?;
        let row = self.table.validate(&descriptor, &offsets)?;
        Ok(CheckReport {
            details: json!({
                "row": { "version_prefix": row.version_prefix, "pointer_size": row.pointer_size },
                "offsets": offsets,
            }),
            descriptor: Some(descriptor),
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HookInstallCheck;

#[async_trait]
impl DeviceCheck for HookInstallCheck {
    fn kind(&self) -> CheckKind {
        CheckKind::Hooks
    }

    async fn run(
        &self,
        agent: &AgentClient<'_>,
        _device_id: &DeviceId,
    ) -> Result<CheckReport, HarnessError> {
        let report = verify_hook_installation(agent).await?;
        Ok(CheckReport {
            descriptor: None,
            details: json!({ "hook_counts": report }),
        })
    }
}
