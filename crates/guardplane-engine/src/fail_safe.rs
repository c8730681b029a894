//! Fail-safe direction table.
//!
//! When the persistent store cannot be read, each guarded predicate
//! resolves to a fixed value instead of an error. The policy is
//! asymmetric: feature flags fail to "disabled", while kill-switch
//! predicates fail to "killed" — absence of information about a kill
//! switch must never read as safe to run. The whole policy lives in this
//! one table so the asymmetry is auditable in one place.

use std::fmt;

use serde::{Deserialize, Serialize};

/// What a fail-safe resolution means for the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailSafeDirection {
    /// The capability is denied / restricted on failure.
    Deny,
    /// The capability is allowed on failure.
    Allow,
}

impl fmt::Display for FailSafeDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deny => f.write_str("deny"),
            Self::Allow => f.write_str("allow"),
        }
    }
}

/// Predicates whose storage-failure behavior is governed by the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardedPredicate {
    /// `FeatureFlagRegistry::is_enabled`.
    FlagEnabled,
    /// `KillSwitchRegistry::is_*_killed` (any capability, and emergency).
    IsKilled,
    /// `RampPlan::has_feature_access`.
    PhaseAccess,
    /// `DeviceAllowlist::is_device_allowed`.
    DeviceAllowed,
    /// `UploadPolicy::is_upload_allowed`.
    UploadAllowed,
}

impl fmt::Display for GuardedPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FlagEnabled => f.write_str("flag_enabled"),
            Self::IsKilled => f.write_str("is_killed"),
            Self::PhaseAccess => f.write_str("phase_access"),
            Self::DeviceAllowed => f.write_str("device_allowed"),
            Self::UploadAllowed => f.write_str("upload_allowed"),
        }
    }
}

/// One row of the fail-safe policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailSafeRule {
    pub predicate: GuardedPredicate,
    pub direction: FailSafeDirection,
    /// The boolean the predicate reports when the store is unreadable.
    /// Note the inversion for `IsKilled`: reporting `true` (killed) is the
    /// denying direction.
    pub read_failure_value: bool,
}

/// The complete fail-safe policy. Every guarded predicate fails toward
/// the restrictive state.
pub const FAIL_SAFE_POLICY: &[FailSafeRule] = &[
    FailSafeRule {
        predicate: GuardedPredicate::FlagEnabled,
        direction: FailSafeDirection::Deny,
        read_failure_value: false,
    },
    FailSafeRule {
        predicate: GuardedPredicate::IsKilled,
        direction: FailSafeDirection::Deny,
        read_failure_value: true,
    },
    FailSafeRule {
        predicate: GuardedPredicate::PhaseAccess,
        direction: FailSafeDirection::Deny,
        read_failure_value: false,
    },
    FailSafeRule {
        predicate: GuardedPredicate::DeviceAllowed,
        direction: FailSafeDirection::Deny,
        read_failure_value: false,
    },
    FailSafeRule {
        predicate: GuardedPredicate::UploadAllowed,
        direction: FailSafeDirection::Deny,
        read_failure_value: false,
    },
];

/// The value `predicate` reports when its backing read fails.
pub fn read_failure_value(predicate: GuardedPredicate) -> bool {
    FAIL_SAFE_POLICY
        .iter()
        .find(|rule| rule.predicate == predicate)
        .map(|rule| rule.read_failure_value)
        // Unlisted predicates deny by construction.
        .unwrap_or(false)
}
