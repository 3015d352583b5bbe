use anyhow::Result;
use probe_core::{
    parse_optional_positive_u64_env, parse_optional_string_env, split_command,
    DEFAULT_DEVICES_COMMAND, DEFAULT_DEVICE_TIMEOUT_MS, DEFAULT_STEP_TIMEOUT_MS,
    DEFAULT_TARGET_PROCESS, PROBE_ENV_BRIDGE_COMMAND, PROBE_ENV_DEVICES_COMMAND,
    PROBE_ENV_DEVICE_TIMEOUT_MS, PROBE_ENV_STEP_TIMEOUT_MS, PROBE_ENV_TARGET_PROCESS,
};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimeouts {
    /// Bound on device resolution.
    pub device: Duration,
    /// Bound on every later step: attach, script load, export calls, teardown.
    pub step: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            device: Duration::from_millis(DEFAULT_DEVICE_TIMEOUT_MS),
            step: Duration::from_millis(DEFAULT_STEP_TIMEOUT_MS),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessConfig {
    pub target_process: String,
    pub timeouts: SessionTimeouts,
    pub devices_command: Vec<String>,
    pub bridge_command: Option<Vec<String>>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            target_process: DEFAULT_TARGET_PROCESS.to_string(),
            timeouts: SessionTimeouts::default(),
            devices_command: DEFAULT_DEVICES_COMMAND
                .iter()
                .map(|s| s.to_string())
                .collect(),
            bridge_command: None,
        }
    }
}

impl HarnessConfig {
    /// Defaults overridden by `PROBE_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(process) = parse_optional_string_env(PROBE_ENV_TARGET_PROCESS)? {
            config.target_process = process;
        }
        if let Some(ms) = parse_optional_positive_u64_env(PROBE_ENV_DEVICE_TIMEOUT_MS)? {
            config.timeouts.device = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_optional_positive_u64_env(PROBE_ENV_STEP_TIMEOUT_MS)? {
            config.timeouts.step = Duration::from_millis(ms);
        }
        if let Some(raw) = parse_optional_string_env(PROBE_ENV_DEVICES_COMMAND)? {
            config.devices_command = split_command(&raw);
        }
        if let Some(raw) = parse_optional_string_env(PROBE_ENV_BRIDGE_COMMAND)? {
            config.bridge_command = Some(split_command(&raw));
        }
        Ok(config)
    }
}
