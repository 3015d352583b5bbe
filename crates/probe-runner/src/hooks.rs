//! Counter-based check that a remote hook fires exactly once per call.
//!
//! The agent counts how often its hook observed the monitored method. The
//! harness never sees the hook directly; it compares counter readings taken
//! around a triggering call, once before the hook is installed (the counter
//! must not move, which rules out a hook left over from an earlier session)
//! and once after (the counter must move by exactly one).

use crate::agent::EXPORT_HOOK_TRIGGER_COUNT;
use async_trait::async_trait;
use probe_core::{HarnessError, HookPhase};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[async_trait]
pub trait HookTarget: Send + Sync {
    async fn hook_trigger_count(&self) -> Result<i64, HarnessError>;

    async fn call_monitored_method(&self) -> Result<(), HarnessError>;

    async fn install_hook(&self) -> Result<(), HarnessError>;
}

/// Counter readings taken by [`verify_hook_installation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookReport {
    pub before_install: [i64; 2],
    pub after_install: [i64; 2],
}

pub async fn verify_hook_installation(
    target: &(dyn HookTarget + '_),
) -> Result<HookReport, HarnessError> {
    let c0 = target.hook_trigger_count().await?;
    target.call_monitored_method().await?;
    let c1 = target.hook_trigger_count().await?;
    check_delta(HookPhase::BeforeInstall, c0, c1, 0)?;

    target.install_hook().await?;

    let c2 = target.hook_trigger_count().await?;
    target.call_monitored_method().await?;
    let c3 = target.hook_trigger_count().await?;
    check_delta(HookPhase::AfterInstall, c2, c3, 1)?;

    debug!(c0, c1, c2, c3, "hook fired once per call");
    Ok(HookReport {
        before_install: [c0, c1],
        after_install: [c2, c3],
    })
}

fn check_delta(phase: HookPhase, before: i64, after: i64, expected: i64) -> Result<(), HarnessError> {
    let observed = after
        .checked_sub(before)
        .ok_or_else(|| HarnessError::RemoteCall {
            method: EXPORT_HOOK_TRIGGER_COUNT.to_string(),
            reason: format!("counter readings {} and {} are out of range", before, after),
        })?;
    if observed == expected {
        Ok(())
    } else {
        Err(HarnessError::HookBehavior {
            phase,
            expected,
            observed,
        })
    }
}
