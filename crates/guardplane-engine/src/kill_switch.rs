//! Kill switches: operator-controlled capability disablement.
//!
//! Three independent per-capability switches (audio, LLM, app) plus a
//! master emergency switch. Read-time composition:
//! `is_killed(x) = stored(x) OR emergency`. Deactivating emergency does
//! not rewrite per-capability state — the OR is evaluated on every read.
//!
//! The fail-safe here is inverted relative to feature flags: when the
//! store cannot be read, every kill predicate reports `true` (killed).
//! Absence of information about a kill switch must never be interpreted
//! as safe to run.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::audit::{event, AuditLog};
use crate::clock::Clock;
use crate::fail_safe::{read_failure_value, GuardedPredicate};
use crate::store::{ConfigStore, StoreError};

const COMPONENT: &str = "kill_switch";
const EMERGENCY_KEY: &str = "kill.emergency";

/// Capabilities subject to a per-capability kill switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Audio,
    Llm,
    App,
}

impl Capability {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Llm => "llm",
            Self::App => "app",
        }
    }

    fn store_key(self) -> String {
        format!("kill.{}", self.as_str())
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted switch state with its activation metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchRecord {
    pub active: bool,
    pub reason: String,
    pub activated_by: String,
}

/// Registry over the persistent store. Safe for concurrent use.
pub struct KillSwitchRegistry {
    store: Arc<dyn ConfigStore>,
    clock: Arc<dyn Clock>,
    audit: Arc<AuditLog>,
}

impl KillSwitchRegistry {
    pub fn new(store: Arc<dyn ConfigStore>, clock: Arc<dyn Clock>, audit: Arc<AuditLog>) -> Self {
        Self {
            store,
            clock,
            audit,
        }
    }

    fn read_switch(&self, key: &str) -> Result<bool, StoreError> {
        match self.store.get(key)? {
            None => Ok(false),
            Some(record) => match serde_json::from_str::<SwitchRecord>(&record.value) {
                Ok(switch) => Ok(switch.active),
                Err(err) => Err(StoreError::ReadFailure {
                    detail: format!("corrupt switch record at `{key}`: {err}"),
                }),
            },
        }
    }

    fn write_switch(
        &self,
        key: &str,
        active: bool,
        reason: &str,
        actor: &str,
    ) -> Result<(), StoreError> {
        let now = self.clock.now_ms();
        let record = SwitchRecord {
            active,
            reason: reason.to_string(),
            activated_by: actor.to_string(),
        };
        let payload = serde_json::to_string(&record).map_err(|err| StoreError::WriteFailure {
            detail: format!("switch record serialization: {err}"),
        })?;
        self.store.put(key, payload, actor, now)?;
        self.audit.record(
            event(
                COMPONENT,
                if active { "activate" } else { "restore" },
                "ok",
                now,
            )
            .with_actor(actor)
            .with_detail(&format!("{key}: {reason}")),
        );
        Ok(())
    }

    /// Kill one capability with a reason.
    pub fn kill(&self, capability: Capability, reason: &str, actor: &str) -> Result<(), StoreError> {
        self.write_switch(&capability.store_key(), true, reason, actor)
    }

    /// Restore one capability.
    pub fn restore(&self, capability: Capability, actor: &str) -> Result<(), StoreError> {
        self.write_switch(&capability.store_key(), false, "restored", actor)
    }

    /// Activate the master emergency switch. Per-capability stored state
    /// is left untouched; the OR composition happens at read time.
    pub fn activate_emergency(&self, reason: &str, actor: &str) -> Result<(), StoreError> {
        self.write_switch(EMERGENCY_KEY, true, reason, actor)
    }

    /// Deactivate the emergency switch. Capabilities individually killed
    /// remain killed.
    pub fn deactivate_emergency(&self, actor: &str) -> Result<(), StoreError> {
        self.write_switch(EMERGENCY_KEY, false, "emergency deactivated", actor)
    }

    /// Whether a capability is killed, propagating storage failure.
    pub fn is_killed_checked(&self, capability: Capability) -> Result<bool, StoreError> {
        Ok(self.read_switch(&capability.store_key())? || self.read_switch(EMERGENCY_KEY)?)
    }

    /// Whether the emergency switch is active, propagating storage failure.
    pub fn is_emergency_killed_checked(&self) -> Result<bool, StoreError> {
        self.read_switch(EMERGENCY_KEY)
    }

    /// Whether a capability is killed. Storage failure reports `true`.
    pub fn is_killed(&self, capability: Capability) -> bool {
        match self.is_killed_checked(capability) {
            Ok(value) => value,
            Err(err) => {
                self.record_fail_safe(capability.as_str(), &err);
                read_failure_value(GuardedPredicate::IsKilled)
            }
        }
    }

    /// Whether the emergency switch is active. Storage failure reports
    /// `true`.
    pub fn is_emergency_killed(&self) -> bool {
        match self.is_emergency_killed_checked() {
            Ok(value) => value,
            Err(err) => {
                self.record_fail_safe("emergency", &err);
                read_failure_value(GuardedPredicate::IsKilled)
            }
        }
    }

    /// The activation metadata for a capability switch, if stored.
    pub fn switch_record(&self, capability: Capability) -> Option<SwitchRecord> {
        let record = self.store.get(&capability.store_key()).ok()??;
        serde_json::from_str(&record.value).ok()
    }

    fn record_fail_safe(&self, switch: &str, err: &StoreError) {
        self.audit.record(
            event(COMPONENT, "is_killed", "fail_safe", self.clock.now_ms())
                .with_detail(switch)
                .with_error_code(err.code()),
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{FaultMode, MemoryStore};

    fn registry() -> (KillSwitchRegistry, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(1_000));
        let audit = Arc::new(AuditLog::new());
        (
            KillSwitchRegistry::new(store.clone(), clock, audit),
            store,
        )
    }

    #[test]
    fn fresh_store_has_no_kills() {
        let (kills, _) = registry();
        assert!(!kills.is_killed(Capability::Audio));
        assert!(!kills.is_killed(Capability::Llm));
        assert!(!kills.is_killed(Capability::App));
        assert!(!kills.is_emergency_killed());
    }

    #[test]
    fn kill_and_restore_one_capability() {
        let (kills, _) = registry();
        kills
            .kill(Capability::Audio, "mic driver crash loop", "ops")
            .unwrap();
        assert!(kills.is_killed(Capability::Audio));
        assert!(!kills.is_killed(Capability::Llm));

        let record = kills.switch_record(Capability::Audio).unwrap();
        assert_eq!(record.reason, "mic driver crash loop");
        assert_eq!(record.activated_by, "ops");

        kills.restore(Capability::Audio, "ops").unwrap();
        assert!(!kills.is_killed(Capability::Audio));
    }

    #[test]
    fn emergency_ors_into_every_capability() {
        let (kills, _) = registry();
        kills.activate_emergency("fleet incident", "oncall").unwrap();
        assert!(kills.is_killed(Capability::Audio));
        assert!(kills.is_killed(Capability::Llm));
        assert!(kills.is_killed(Capability::App));
        assert!(kills.is_emergency_killed());
    }

    #[test]
    fn deactivating_emergency_preserves_individual_kills() {
        let (kills, _) = registry();
        kills.kill(Capability::Llm, "bad model output", "ops").unwrap();
        kills.activate_emergency("fleet incident", "oncall").unwrap();
        kills.deactivate_emergency("oncall").unwrap();

        assert!(kills.is_killed(Capability::Llm));
        assert!(!kills.is_killed(Capability::Audio));
        assert!(!kills.is_killed(Capability::App));
    }

    #[test]
    fn read_failure_reports_everything_killed() {
        let (kills, store) = registry();
        store.set_fault_mode(FaultMode::FailReads);
        assert!(kills.is_killed(Capability::Audio));
        assert!(kills.is_killed(Capability::Llm));
        assert!(kills.is_killed(Capability::App));
        assert!(kills.is_emergency_killed());
    }

    #[test]
    fn corrupt_switch_record_reports_killed() {
        let (kills, store) = registry();
        store
            .put("kill.audio", "garbage".to_string(), "x", 1)
            .unwrap();
        assert!(kills.is_killed(Capability::Audio));
    }

    #[test]
    fn write_failure_surfaces_to_caller() {
        let (kills, store) = registry();
        store.set_fault_mode(FaultMode::FailWrites);
        assert!(kills
            .kill(Capability::App, "test", "ops")
            .is_err());
        store.set_fault_mode(FaultMode::None);
        assert!(!kills.is_killed(Capability::App));
    }
}
