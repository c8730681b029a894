//! Per-phase device allow-listing, fingerprinting, and hardware checks.
//!
//! Each ramp phase carries its own identifier set; `production` bypasses
//! the set entirely. Membership checks fail closed. The device
//! fingerprint is a deterministic SHA-256 over the hardware identity and
//! is memoized, so repeated calls on the same device return an identical
//! id.

use std::collections::BTreeSet;
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::audit::{event, AuditLog};
use crate::clock::Clock;
use crate::fail_safe::{read_failure_value, GuardedPredicate};
use crate::ramp_plan::{RampPlan, RolloutPhase};
use crate::store::{ConfigStore, StoreError};

const COMPONENT: &str = "device_allowlist";

/// Minimum device memory for on-device inference.
pub const MIN_MEMORY_BYTES: u64 = 3 * 1024 * 1024 * 1024;
/// Minimum free storage for model assets.
pub const MIN_FREE_STORAGE_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// Hardware identity inputs for the device fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub manufacturer: String,
    pub model: String,
    pub build_fingerprint: String,
}

impl DeviceIdentity {
    /// Deterministic fingerprint: SHA-256 over the identity fields with
    /// separators so field boundaries cannot collide.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.manufacturer.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.model.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.build_fingerprint.as_bytes());
        let digest = hasher.finalize();
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }
}

/// Hardware probe boundary; the host platform supplies the real one.
pub trait HardwareProbe: Send + Sync {
    fn total_memory_bytes(&self) -> Result<u64, String>;
    fn free_storage_bytes(&self) -> Result<u64, String>;
}

/// Outcome of a hardware requirements check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequirementsReport {
    pub meets_requirements: bool,
    /// Unmet requirements, one entry per failure.
    pub requirements: Vec<String>,
    /// Non-blocking concerns.
    pub warnings: Vec<String>,
}

/// Allowlist manager over the persistent store. Safe for concurrent use.
pub struct DeviceAllowlist {
    store: Arc<dyn ConfigStore>,
    ramp: Arc<RampPlan>,
    hardware: Arc<dyn HardwareProbe>,
    clock: Arc<dyn Clock>,
    audit: Arc<AuditLog>,
    identity: DeviceIdentity,
    fingerprint: OnceLock<String>,
}

impl DeviceAllowlist {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        ramp: Arc<RampPlan>,
        hardware: Arc<dyn HardwareProbe>,
        clock: Arc<dyn Clock>,
        audit: Arc<AuditLog>,
        identity: DeviceIdentity,
    ) -> Self {
        Self {
            store,
            ramp,
            hardware,
            clock,
            audit,
            identity,
            fingerprint: OnceLock::new(),
        }
    }

    fn phase_key(phase: RolloutPhase) -> String {
        format!("allowlist.{}", phase.as_str())
    }

    /// This device's fingerprint, generated once and reused.
    pub fn device_fingerprint(&self) -> &str {
        self.fingerprint
            .get_or_init(|| self.identity.fingerprint())
    }

    fn read_set(&self, phase: RolloutPhase) -> Result<BTreeSet<String>, StoreError> {
        match self.store.get(&Self::phase_key(phase))? {
            None => Ok(BTreeSet::new()),
            Some(record) => serde_json::from_str(&record.value).map_err(|err| {
                StoreError::ReadFailure {
                    detail: format!("corrupt allowlist for {phase}: {err}"),
                }
            }),
        }
    }

    fn write_set(
        &self,
        phase: RolloutPhase,
        set: &BTreeSet<String>,
        actor: &str,
    ) -> Result<(), StoreError> {
        let payload = serde_json::to_string(set).map_err(|err| StoreError::WriteFailure {
            detail: format!("allowlist serialization: {err}"),
        })?;
        self.store
            .put(&Self::phase_key(phase), payload, actor, self.clock.now_ms())?;
        Ok(())
    }

    /// Add a device to a phase's allowlist.
    pub fn add_device(
        &self,
        phase: RolloutPhase,
        device_id: &str,
        actor: &str,
    ) -> Result<(), StoreError> {
        let mut set = self.read_set(phase)?;
        set.insert(device_id.to_string());
        self.write_set(phase, &set, actor)?;
        self.audit.record(
            event(COMPONENT, "add_device", "ok", self.clock.now_ms())
                .with_actor(actor)
                .with_detail(&format!("{phase}: {device_id}")),
        );
        Ok(())
    }

    /// Remove a device from a phase's allowlist; returns whether it was
    /// present.
    pub fn remove_device(
        &self,
        phase: RolloutPhase,
        device_id: &str,
        actor: &str,
    ) -> Result<bool, StoreError> {
        let mut set = self.read_set(phase)?;
        let removed = set.remove(device_id);
        if removed {
            self.write_set(phase, &set, actor)?;
            self.audit.record(
                event(COMPONENT, "remove_device", "ok", self.clock.now_ms())
                    .with_actor(actor)
                    .with_detail(&format!("{phase}: {device_id}")),
            );
        }
        Ok(removed)
    }

    /// Whether this device is admitted in the current rollout phase.
    ///
    /// Production admits every device; all other phases require
    /// allowlist membership. Fails closed on any storage failure.
    pub fn is_device_allowed(&self) -> bool {
        match self.is_device_allowed_checked() {
            Ok(allowed) => allowed,
            Err(err) => {
                self.audit.record(
                    event(COMPONENT, "is_device_allowed", "fail_safe", self.clock.now_ms())
                        .with_error_code(err.code()),
                );
                read_failure_value(GuardedPredicate::DeviceAllowed)
            }
        }
    }

    fn is_device_allowed_checked(&self) -> Result<bool, StoreError> {
        let phase = self.ramp.current_phase_checked()?;
        if phase == RolloutPhase::Production {
            return Ok(true);
        }
        let set = self.read_set(phase)?;
        Ok(set.contains(self.device_fingerprint()))
    }

    /// Evaluate hardware minimums for on-device processing.
    ///
    /// Probe failures never propagate; they surface as an unmet
    /// requirement describing the probe error.
    pub fn check_device_requirements(&self) -> RequirementsReport {
        let mut requirements = Vec::new();
        let mut warnings = Vec::new();

        match self.hardware.total_memory_bytes() {
            Ok(memory) if memory < MIN_MEMORY_BYTES => {
                requirements.push(format!(
                    "device memory {memory} bytes below minimum {MIN_MEMORY_BYTES}"
                ));
            }
            Ok(memory) => {
                if memory < MIN_MEMORY_BYTES + 1024 * 1024 * 1024 {
                    warnings.push("device memory is close to the minimum".to_string());
                }
            }
            Err(err) => {
                requirements.push(format!("memory probe failed: {err}"));
            }
        }

        match self.hardware.free_storage_bytes() {
            Ok(storage) if storage < MIN_FREE_STORAGE_BYTES => {
                requirements.push(format!(
                    "free storage {storage} bytes below minimum {MIN_FREE_STORAGE_BYTES}"
                ));
            }
            Ok(_) => {}
            Err(err) => {
                requirements.push(format!("storage probe failed: {err}"));
            }
        }

        RequirementsReport {
            meets_requirements: requirements.is_empty(),
            requirements,
            warnings,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
