use anyhow::{anyhow, Result};
use sha2::{Digest, Sha256};
use std::env;
use std::fs;
use std::path::Path;

mod error;
mod model;

pub use error::{ErrorCategory, HarnessError, OffsetMismatch};
pub use model::{
    DeviceId, HookPhase, MethodOffsets, OffsetField, OffsetTable, PointerSize, RuntimeDescriptor,
};

pub const DEFAULT_TARGET_PROCESS: &str = "com.android.systemui";
pub const DEFAULT_DEVICE_TIMEOUT_MS: u64 = 500;
pub const DEFAULT_STEP_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_DEVICES_COMMAND: &[&str] = &["adb", "devices", "-l"];

pub const PROBE_ENV_TARGET_PROCESS: &str = "PROBE_TARGET_PROCESS";
pub const PROBE_ENV_DEVICE_TIMEOUT_MS: &str = "PROBE_DEVICE_TIMEOUT_MS";
pub const PROBE_ENV_STEP_TIMEOUT_MS: &str = "PROBE_STEP_TIMEOUT_MS";
pub const PROBE_ENV_DEVICES_COMMAND: &str = "PROBE_DEVICES_COMMAND";
pub const PROBE_ENV_BRIDGE_COMMAND: &str = "PROBE_BRIDGE_COMMAND";
pub const PROBE_ENV_LOG: &str = "PROBE_LOG";

pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

pub fn parse_optional_positive_u64_env(name: &str) -> Result<Option<u64>> {
    match env::var(name) {
        Ok(raw) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            let parsed = trimmed.parse::<u64>().map_err(|_| {
                anyhow!(
                    "{} must be a positive integer when set (got: {})",
                    name,
                    raw
                )
            })?;
            if parsed == 0 {
                return Err(anyhow!("{} must be > 0 when set", name));
            }
            Ok(Some(parsed))
        }
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(anyhow!("failed reading {}: {}", name, err)),
    }
}

pub fn parse_optional_string_env(name: &str) -> Result<Option<String>> {
    match env::var(name) {
        Ok(raw) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                Ok(None)
            } else {
                Ok(Some(trimmed.to_string()))
            }
        }
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(anyhow!("failed reading {}: {}", name, err)),
    }
}

/// Splits a command line on whitespace. Quoting is not supported; commands
/// needing it should be wrapped in a script.
pub fn split_command(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_bytes_is_prefixed_hex() {
        let digest = sha256_bytes(b"agent");
        assert!(digest.starts_with("sha256:"));
        assert_eq!(digest.len(), "sha256:".len() + 64);
        assert_eq!(digest, sha256_bytes(b"agent"));
        assert_ne!(digest, sha256_bytes(b"agent2"));
    }

    #[test]
    fn positive_env_parsing_rejects_zero_and_garbage() {
        let name = "PROBE_CORE_TEST_POSITIVE_U64";
        env::set_var(name, "0");
        assert!(parse_optional_positive_u64_env(name).is_err());
        env::set_var(name, "abc");
        assert!(parse_optional_positive_u64_env(name).is_err());
        env::set_var(name, " 750 ");
        assert_eq!(parse_optional_positive_u64_env(name).expect("parse"), Some(750));
        env::set_var(name, "");
        assert_eq!(parse_optional_positive_u64_env(name).expect("parse"), None);
        env::remove_var(name);
        assert_eq!(parse_optional_positive_u64_env(name).expect("parse"), None);
    }

    #[test]
    fn split_command_drops_extra_whitespace() {
        assert_eq!(
            split_command("  adb   devices -l "),
            vec!["adb".to_string(), "devices".to_string(), "-l".to_string()]
        );
        assert!(split_command("   ").is_empty());
    }
}
