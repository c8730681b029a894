//! Release gate: aggregated go/no-go decisions with rollback.
//!
//! Independent gates (feature enabled, no emergency kill, performance
//! threshold, privacy compliance) are evaluated on demand. The aggregate
//! is fail-closed: any failing gate fails the check, any gate that cannot
//! be evaluated short-circuits into an error, and only a fully passing
//! check marks quality gates as passed. A failing fleet can be contained
//! by `trigger_rollback`, which activates the emergency kill switch and
//! walks the ramp plan back one phase.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::audit::{event, AuditLog};
use crate::clock::Clock;
use crate::feature_flags::{FeatureFlagRegistry, FLAG_AMBIENT_SCRIBE};
use crate::kill_switch::KillSwitchRegistry;
use crate::ramp_plan::{PhaseTransition, RampPlan};
use crate::store::ConfigStore;

const COMPONENT: &str = "release_gate";
const CANARY_KEY: &str = "gate.canary_pct";
const ROLLOUT_PHASE_KEY: &str = "gate.rollout_phase";

/// Highest canary percentage the gate will accept.
pub const MAX_CANARY_PERCENTAGE: i32 = 50;
/// Minimum acceptable quality score in [0, 1].
pub const PERFORMANCE_THRESHOLD: f64 = 0.8;

/// The independent gates evaluated by a release check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateKind {
    FeatureEnabled,
    NoEmergencyKill,
    Performance,
    Privacy,
}

impl fmt::Display for GateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FeatureEnabled => f.write_str("feature_enabled"),
            Self::NoEmergencyKill => f.write_str("no_emergency_kill"),
            Self::Performance => f.write_str("performance"),
            Self::Privacy => f.write_str("privacy"),
        }
    }
}

/// Result of one gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateResult {
    pub kind: GateKind,
    pub passed: bool,
    pub issues: Vec<String>,
}

/// Aggregate outcome of a release check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GateCheckOutcome {
    /// Every gate passed; quality gates are marked passed.
    Passed,
    /// At least one gate failed; all issues are collected.
    Failed(Vec<String>),
    /// A gate could not be evaluated; remaining gates were skipped.
    Error(String),
    /// Another check is in flight.
    AlreadyChecking,
}

/// Outcome of a rollback trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RollbackOutcome {
    Success,
    AlreadyRollingBack,
    Error(String),
}

/// Live quality signals consumed by the performance and privacy gates.
/// The monitoring subsystem supplies the real implementation.
pub trait GateSignals: Send + Sync {
    /// Recent end-to-end quality score in [0, 1].
    fn performance_score(&self) -> Result<f64, String>;
    /// Outstanding privacy or compliance violations.
    fn privacy_violations(&self) -> Result<Vec<String>, String>;
}

/// Release gate over its peer managers. Safe for concurrent use.
pub struct ReleaseGate {
    store: Arc<dyn ConfigStore>,
    flags: Arc<FeatureFlagRegistry>,
    kills: Arc<KillSwitchRegistry>,
    ramp: Arc<RampPlan>,
    signals: Arc<dyn GateSignals>,
    clock: Arc<dyn Clock>,
    audit: Arc<AuditLog>,
    is_checking: AtomicBool,
    is_rolling_back: AtomicBool,
    quality_gates_passed: AtomicBool,
    last_check_ms: Mutex<Option<i64>>,
}

impl ReleaseGate {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn ConfigStore>,
        flags: Arc<FeatureFlagRegistry>,
        kills: Arc<KillSwitchRegistry>,
        ramp: Arc<RampPlan>,
        signals: Arc<dyn GateSignals>,
        clock: Arc<dyn Clock>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            store,
            flags,
            kills,
            ramp,
            signals,
            clock,
            audit,
            is_checking: AtomicBool::new(false),
            is_rolling_back: AtomicBool::new(false),
            quality_gates_passed: AtomicBool::new(false),
            last_check_ms: Mutex::new(None),
        }
    }

    /// Evaluate every gate and aggregate fail-closed.
    pub fn check_release_gates(&self) -> GateCheckOutcome {
        if self
            .is_checking
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return GateCheckOutcome::AlreadyChecking;
        }
        let outcome = self.check_locked();
        self.is_checking.store(false, Ordering::Release);
        outcome
    }

    fn check_locked(&self) -> GateCheckOutcome {
        let now = self.clock.now_ms();
        self.quality_gates_passed.store(false, Ordering::SeqCst);

        let mut issues = Vec::new();
        for kind in [
            GateKind::FeatureEnabled,
            GateKind::NoEmergencyKill,
            GateKind::Performance,
            GateKind::Privacy,
        ] {
            match self.evaluate_gate(kind) {
                Ok(result) => {
                    if !result.passed {
                        issues.extend(result.issues);
                    }
                }
                Err(detail) => {
                    let message = format!("gate {kind} errored: {detail}");
                    self.audit.record(
                        event(COMPONENT, "check_release_gates", "error", now)
                            .with_detail(&message),
                    );
                    return GateCheckOutcome::Error(message);
                }
            }
        }
        if let Ok(mut last) = self.last_check_ms.lock() {
            *last = Some(now);
        }
        if issues.is_empty() {
            self.quality_gates_passed.store(true, Ordering::SeqCst);
            self.audit
                .record(event(COMPONENT, "check_release_gates", "ok", now));
            GateCheckOutcome::Passed
        } else {
            self.audit.record(
                event(COMPONENT, "check_release_gates", "denied", now)
                    .with_detail(&issues.join("; ")),
            );
            GateCheckOutcome::Failed(issues)
        }
    }

    fn evaluate_gate(&self, kind: GateKind) -> Result<GateResult, String> {
        let (passed, issues) = match kind {
            GateKind::FeatureEnabled => {
                let enabled = self
                    .flags
                    .is_enabled_checked(FLAG_AMBIENT_SCRIBE)
                    .map_err(|err| err.to_string())?;
                if enabled {
                    (true, Vec::new())
                } else {
                    (false, vec!["ambient scribe feature is disabled".to_string()])
                }
            }
            GateKind::NoEmergencyKill => {
                let emergency = self
                    .kills
                    .is_emergency_killed_checked()
                    .map_err(|err| err.to_string())?;
                if emergency {
                    (false, vec!["emergency kill switch is active".to_string()])
                } else {
                    (true, Vec::new())
                }
            }
            GateKind::Performance => {
                let score = self.signals.performance_score()?;
                if score >= PERFORMANCE_THRESHOLD {
                    (true, Vec::new())
                } else {
                    (
                        false,
                        vec![format!(
                            "quality score {score:.2} below threshold {PERFORMANCE_THRESHOLD}"
                        )],
                    )
                }
            }
            GateKind::Privacy => {
                let violations = self.signals.privacy_violations()?;
                if violations.is_empty() {
                    (true, Vec::new())
                } else {
                    (false, violations)
                }
            }
        };
        Ok(GateResult {
            kind,
            passed,
            issues,
        })
    }

    /// Whether the most recent complete check passed every gate.
    pub fn quality_gates_passed(&self) -> bool {
        self.quality_gates_passed.load(Ordering::SeqCst)
    }

    /// Timestamp of the most recent complete check.
    pub fn last_check_ms(&self) -> Option<i64> {
        self.last_check_ms.lock().ok().and_then(|l| *l)
    }

    /// Set the canary percentage. Values outside [0, 50] are rejected and
    /// leave the prior value unchanged.
    pub fn set_canary_percentage(&self, percentage: i32, actor: &str) -> bool {
        if !(0..=MAX_CANARY_PERCENTAGE).contains(&percentage) {
            self.audit.record(
                event(COMPONENT, "set_canary_percentage", "denied", self.clock.now_ms())
                    .with_actor(actor)
                    .with_detail(&percentage.to_string()),
            );
            return false;
        }
        self.store
            .put(
                CANARY_KEY,
                percentage.to_string(),
                actor,
                self.clock.now_ms(),
            )
            .is_ok()
    }

    /// Current canary percentage; 0 when never set or unreadable.
    pub fn canary_percentage(&self) -> i32 {
        self.store
            .get(CANARY_KEY)
            .ok()
            .flatten()
            .and_then(|record| record.value.parse().ok())
            .unwrap_or(0)
    }

    /// Current rollout-phase label; "rollout" until a rollback happens.
    pub fn rollout_phase(&self) -> String {
        self.store
            .get(ROLLOUT_PHASE_KEY)
            .ok()
            .flatten()
            .map(|record| record.value)
            .unwrap_or_else(|| "rollout".to_string())
    }

    /// Contain a bad release: activate the emergency kill switch, walk the
    /// ramp plan back, and mark the rollout as rolled back.
    pub fn trigger_rollback(&self, reason: &str, actor: &str) -> RollbackOutcome {
        if self
            .is_rolling_back
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return RollbackOutcome::AlreadyRollingBack;
        }
        let outcome = self.rollback_locked(reason, actor);
        self.is_rolling_back.store(false, Ordering::Release);
        outcome
    }

    fn rollback_locked(&self, reason: &str, actor: &str) -> RollbackOutcome {
        let now = self.clock.now_ms();
        if let Err(err) = self.kills.activate_emergency(reason, actor) {
            return RollbackOutcome::Error(format!("emergency activation failed: {err}"));
        }
        match self.ramp.rollback_to_previous_phase(actor) {
            PhaseTransition::Success(_) | PhaseTransition::AlreadyAtMinPhase => {}
            PhaseTransition::AlreadyUpdating => {
                return RollbackOutcome::Error("ramp plan transition in flight".to_string())
            }
            PhaseTransition::AlreadyAtMaxPhase => {
                return RollbackOutcome::Error("ramp plan refused rollback".to_string())
            }
            PhaseTransition::Error(detail) => {
                return RollbackOutcome::Error(format!("ramp rollback failed: {detail}"))
            }
        }
        if let Err(err) =
            self.store
                .put(ROLLOUT_PHASE_KEY, "rollback".to_string(), actor, now)
        {
            return RollbackOutcome::Error(format!("rollout phase update failed: {err}"));
        }
        self.audit.record(
            event(COMPONENT, "trigger_rollback", "ok", now)
                .with_actor(actor)
                .with_detail(reason),
        );
        RollbackOutcome::Success
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
