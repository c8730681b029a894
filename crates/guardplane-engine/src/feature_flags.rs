//! Feature flag registry with dependency cascades and A/B assignment.
//!
//! Flags are persisted one record per flag. The dependency cascade is
//! evaluated at read time, never at write time: `llm_processing_enabled`
//! and `te_language_enabled` read as disabled while
//! `ambient_scribe_enabled` is disabled, regardless of their stored
//! values. Storage-read failure reads every flag as disabled;
//! storage-write failure leaves prior state unchanged and is not raised
//! to the caller.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::audit::{event, AuditLog};
use crate::clock::Clock;
use crate::fail_safe::{read_failure_value, GuardedPredicate};
use crate::store::{ConfigStore, StoreError};

/// Master switch for the ambient scribe feature.
pub const FLAG_AMBIENT_SCRIBE: &str = "ambient_scribe_enabled";
/// On-device LLM processing; cascades off `ambient_scribe_enabled`.
pub const FLAG_LLM_PROCESSING: &str = "llm_processing_enabled";
/// Telugu language support; cascades off `ambient_scribe_enabled`.
pub const FLAG_TE_LANGUAGE: &str = "te_language_enabled";

/// Sentinel group for features with no A/B assignment.
pub const AB_CONTROL_GROUP: &str = "control";

const FLAG_KEY_PREFIX: &str = "flag.";
const AB_GROUP_KEY_PREFIX: &str = "ab_group.";
const COMPONENT: &str = "feature_flags";

/// Stored flag payload. Flags are boolean or free-form text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FlagValue {
    Bool(bool),
    Text(String),
}

/// Registry over the persistent store. Safe for concurrent use.
pub struct FeatureFlagRegistry {
    store: Arc<dyn ConfigStore>,
    clock: Arc<dyn Clock>,
    audit: Arc<AuditLog>,
}

impl FeatureFlagRegistry {
    pub fn new(store: Arc<dyn ConfigStore>, clock: Arc<dyn Clock>, audit: Arc<AuditLog>) -> Self {
        Self {
            store,
            clock,
            audit,
        }
    }

    /// Hard-coded default when a flag has never been written.
    fn default_value(name: &str) -> bool {
        matches!(name, FLAG_AMBIENT_SCRIBE | FLAG_LLM_PROCESSING)
    }

    fn flag_key(name: &str) -> String {
        format!("{FLAG_KEY_PREFIX}{name}")
    }

    fn read_stored(&self, name: &str) -> Result<bool, StoreError> {
        match self.store.get(&Self::flag_key(name))? {
            None => Ok(Self::default_value(name)),
            Some(record) => match serde_json::from_str::<FlagValue>(&record.value) {
                Ok(FlagValue::Bool(b)) => Ok(b),
                // A text value has no boolean reading; fall back to default.
                Ok(FlagValue::Text(_)) => Ok(Self::default_value(name)),
                Err(err) => Err(StoreError::ReadFailure {
                    detail: format!("corrupt flag record for `{name}`: {err}"),
                }),
            },
        }
    }

    /// Read a flag, propagating storage failure to the caller.
    ///
    /// Applies the read-time dependency cascade: dependent flags read
    /// `false` while the master flag is off.
    pub fn is_enabled_checked(&self, name: &str) -> Result<bool, StoreError> {
        let stored = self.read_stored(name)?;
        if matches!(name, FLAG_LLM_PROCESSING | FLAG_TE_LANGUAGE) && stored {
            return Ok(self.read_stored(FLAG_AMBIENT_SCRIBE)?);
        }
        Ok(stored)
    }

    /// Read a flag with the documented fail-safe: storage failure reads
    /// as disabled.
    pub fn is_enabled(&self, name: &str) -> bool {
        match self.is_enabled_checked(name) {
            Ok(value) => value,
            Err(err) => {
                self.audit.record(
                    event(COMPONENT, "is_enabled", "fail_safe", self.clock.now_ms())
                        .with_detail(name)
                        .with_error_code(err.code()),
                );
                read_failure_value(GuardedPredicate::FlagEnabled)
            }
        }
    }

    /// Atomically write a boolean flag with actor and timestamp.
    ///
    /// A write failure leaves prior state unchanged and is only recorded
    /// in the audit log.
    pub fn set_enabled(&self, name: &str, value: bool, actor: &str) {
        self.write_value(name, FlagValue::Bool(value), actor);
    }

    /// Atomically write a text flag.
    pub fn set_text(&self, name: &str, value: &str, actor: &str) {
        self.write_value(name, FlagValue::Text(value.to_string()), actor);
    }

    /// Read a text flag; `None` when absent, boolean-typed, or unreadable.
    pub fn text_value(&self, name: &str) -> Option<String> {
        let record = self.store.get(&Self::flag_key(name)).ok()??;
        match serde_json::from_str::<FlagValue>(&record.value).ok()? {
            FlagValue::Text(text) => Some(text),
            FlagValue::Bool(_) => None,
        }
    }

    fn write_value(&self, name: &str, value: FlagValue, actor: &str) {
        let now = self.clock.now_ms();
        let payload = match serde_json::to_string(&value) {
            Ok(payload) => payload,
            Err(err) => {
                self.audit.record(
                    event(COMPONENT, "set_flag", "error", now)
                        .with_actor(actor)
                        .with_detail(&format!("{name}: {err}")),
                );
                return;
            }
        };
        match self.store.put(&Self::flag_key(name), payload, actor, now) {
            Ok(_) => self.audit.record(
                event(COMPONENT, "set_flag", "ok", now)
                    .with_actor(actor)
                    .with_detail(name),
            ),
            Err(err) => self.audit.record(
                event(COMPONENT, "set_flag", "error", now)
                    .with_actor(actor)
                    .with_detail(name)
                    .with_error_code(err.code()),
            ),
        }
    }

    /// Apply a remote-config feature map. Each entry is applied
    /// individually; a failing field aborts only that field.
    ///
    /// Returns the number of entries applied.
    pub fn update_from_remote(
        &self,
        features: &BTreeMap<String, bool>,
        groups: &BTreeMap<String, String>,
        actor: &str,
    ) -> usize {
        let mut applied = 0;
        for (name, value) in features {
            let now = self.clock.now_ms();
            let payload = match serde_json::to_string(&FlagValue::Bool(*value)) {
                Ok(payload) => payload,
                Err(_) => continue,
            };
            if self
                .store
                .put(&Self::flag_key(name), payload, actor, now)
                .is_ok()
            {
                applied += 1;
            }
        }
        for (feature, group) in groups {
            let now = self.clock.now_ms();
            if self
                .store
                .put(
                    &format!("{AB_GROUP_KEY_PREFIX}{feature}"),
                    group.clone(),
                    actor,
                    now,
                )
                .is_ok()
            {
                applied += 1;
            }
        }
        applied
    }

    /// Assigned A/B group for a feature; unknown features and read
    /// failures resolve to `"control"`.
    pub fn ab_test_group(&self, feature: &str) -> String {
        match self.store.get(&format!("{AB_GROUP_KEY_PREFIX}{feature}")) {
            Ok(Some(record)) => record.value,
            _ => AB_CONTROL_GROUP.to_string(),
        }
    }

    /// Assign an A/B group for a feature.
    pub fn set_ab_test_group(&self, feature: &str, group: &str, actor: &str) {
        let now = self.clock.now_ms();
        let key = format!("{AB_GROUP_KEY_PREFIX}{feature}");
        if let Err(err) = self.store.put(&key, group.to_string(), actor, now) {
            self.audit.record(
                event(COMPONENT, "set_ab_group", "error", now)
                    .with_actor(actor)
                    .with_detail(feature)
                    .with_error_code(err.code()),
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
