//! Phased rollout state machine.
//!
//! The ramp sequence is internal -> pilot_1 -> pilot_2 -> pilot_3 ->
//! expansion, with control (no access) and production (open allowlist)
//! out of band. Advance and rollback move exactly one step, persist the
//! new phase atomically, and are single-flight: a concurrent call while a
//! transition is in flight gets `AlreadyUpdating` immediately instead of
//! queuing.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::audit::{event, AuditLog};
use crate::clock::Clock;
use crate::fail_safe::{read_failure_value, GuardedPredicate};
use crate::store::{ConfigStore, StoreError};

const COMPONENT: &str = "ramp_plan";
const PHASE_KEY: &str = "ramp.phase";

/// A rollout phase with its exposure percentage and access policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutPhase {
    /// Out of band: nobody has access.
    Control,
    /// Internal testing only.
    Internal,
    /// 5% pilot.
    Pilot1,
    /// 25% pilot.
    Pilot2,
    /// 50% pilot.
    Pilot3,
    /// Full allowlisted rollout.
    Expansion,
    /// Out of band: open allowlist, every device admitted.
    Production,
}

/// The ordered ramp sequence walked by advance/rollback.
pub const RAMP_SEQUENCE: &[RolloutPhase] = &[
    RolloutPhase::Internal,
    RolloutPhase::Pilot1,
    RolloutPhase::Pilot2,
    RolloutPhase::Pilot3,
    RolloutPhase::Expansion,
];

impl RolloutPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Control => "control",
            Self::Internal => "internal",
            Self::Pilot1 => "pilot_1",
            Self::Pilot2 => "pilot_2",
            Self::Pilot3 => "pilot_3",
            Self::Expansion => "expansion",
            Self::Production => "production",
        }
    }

    /// Percentage of the install base exposed in this phase.
    pub fn percentage(self) -> u8 {
        match self {
            Self::Control => 0,
            Self::Internal => 0,
            Self::Pilot1 => 5,
            Self::Pilot2 => 25,
            Self::Pilot3 => 50,
            Self::Expansion | Self::Production => 100,
        }
    }

    /// Whether devices in this phase have feature access.
    pub fn has_access(self) -> bool {
        !matches!(self, Self::Control)
    }

    /// Position on the ramp sequence; out-of-band phases have none.
    fn ramp_index(self) -> Option<usize> {
        RAMP_SEQUENCE.iter().position(|p| *p == self)
    }
}

impl fmt::Display for RolloutPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a phase transition attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PhaseTransition {
    /// The phase moved one step and was persisted.
    Success(RolloutPhase),
    /// Already at the last ramp phase (or in production).
    AlreadyAtMaxPhase,
    /// Already at the first ramp phase (or in control).
    AlreadyAtMinPhase,
    /// Another transition is in flight; nothing happened.
    AlreadyUpdating,
    /// Storage failed; the phase is unchanged.
    Error(String),
}

/// Ramp plan over the persistent store. Safe for concurrent use.
pub struct RampPlan {
    store: Arc<dyn ConfigStore>,
    clock: Arc<dyn Clock>,
    audit: Arc<AuditLog>,
    updating: AtomicBool,
}

impl RampPlan {
    pub fn new(store: Arc<dyn ConfigStore>, clock: Arc<dyn Clock>, audit: Arc<AuditLog>) -> Self {
        Self {
            store,
            clock,
            audit,
            updating: AtomicBool::new(false),
        }
    }

    /// Current phase, propagating storage failure. Absent state means the
    /// rollout has not started: `internal`.
    pub fn current_phase_checked(&self) -> Result<RolloutPhase, StoreError> {
        match self.store.get(PHASE_KEY)? {
            None => Ok(RolloutPhase::Internal),
            Some(record) => {
                serde_json::from_str::<RolloutPhase>(&record.value).map_err(|err| {
                    StoreError::ReadFailure {
                        detail: format!("corrupt phase record: {err}"),
                    }
                })
            }
        }
    }

    /// Current phase; storage failure reads as `control` (no access).
    pub fn current_phase(&self) -> RolloutPhase {
        self.current_phase_checked().unwrap_or(RolloutPhase::Control)
    }

    /// Whether the current phase grants feature access; fail-closed.
    pub fn has_feature_access(&self) -> bool {
        match self.current_phase_checked() {
            Ok(phase) => phase.has_access(),
            Err(err) => {
                self.audit.record(
                    event(COMPONENT, "has_feature_access", "fail_safe", self.clock.now_ms())
                        .with_error_code(err.code()),
                );
                read_failure_value(GuardedPredicate::PhaseAccess)
            }
        }
    }

    /// Advance one step along the ramp sequence.
    pub fn advance_to_next_phase(&self, actor: &str) -> PhaseTransition {
        self.transition(actor, 1)
    }

    /// Roll back one step along the ramp sequence.
    pub fn rollback_to_previous_phase(&self, actor: &str) -> PhaseTransition {
        self.transition(actor, -1)
    }

    /// Assign an out-of-band phase (`control`, `production`) or pin the
    /// rollout to a specific ramp phase.
    pub fn set_phase(&self, phase: RolloutPhase, actor: &str) -> Result<(), StoreError> {
        self.persist_phase(phase, actor)
    }

    fn transition(&self, actor: &str, direction: i8) -> PhaseTransition {
        if self
            .updating
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return PhaseTransition::AlreadyUpdating;
        }
        let result = self.transition_locked(actor, direction);
        self.updating.store(false, Ordering::Release);
        result
    }

    fn transition_locked(&self, actor: &str, direction: i8) -> PhaseTransition {
        let current = match self.current_phase_checked() {
            Ok(phase) => phase,
            Err(err) => return PhaseTransition::Error(err.to_string()),
        };
        let next = match current.ramp_index() {
            // Out-of-band phases are pinned; production counts as past the
            // top of the ramp, control as below the bottom.
            None if current == RolloutPhase::Production => {
                return PhaseTransition::AlreadyAtMaxPhase
            }
            None => return PhaseTransition::AlreadyAtMinPhase,
            Some(index) => {
                let target = index as i64 + i64::from(direction);
                if target < 0 {
                    return PhaseTransition::AlreadyAtMinPhase;
                }
                if target as usize >= RAMP_SEQUENCE.len() {
                    return PhaseTransition::AlreadyAtMaxPhase;
                }
                RAMP_SEQUENCE[target as usize]
            }
        };
        match self.persist_phase(next, actor) {
            Ok(()) => PhaseTransition::Success(next),
            Err(err) => PhaseTransition::Error(err.to_string()),
        }
    }

    fn persist_phase(&self, phase: RolloutPhase, actor: &str) -> Result<(), StoreError> {
        let now = self.clock.now_ms();
        let payload = serde_json::to_string(&phase).map_err(|err| StoreError::WriteFailure {
            detail: format!("phase serialization: {err}"),
        })?;
        self.store.put(PHASE_KEY, payload, actor, now)?;
        self.audit.record(
            event(COMPONENT, "set_phase", "ok", now)
                .with_actor(actor)
                .with_detail(phase.as_str()),
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
