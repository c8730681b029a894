//! Signature-verified remote configuration ingestion.
//!
//! Config snapshots arrive as a `{json, signature, version}` triple from
//! the distribution channel. Nothing is persisted until the signature
//! verifies against the pinned key; a verified payload is then
//! structurally validated (semver version, freshness window, boolean
//! feature values) before it becomes the active snapshot and its feature
//! map is applied to the flag registry. Typed getters read from the last
//! valid snapshot only and otherwise fall back to caller defaults.
//!
//! Forged or corrupted config (`InvalidSignature`) is reported distinctly
//! from malformed-but-authentic config (`InvalidConfig`) so operators can
//! tell the two apart.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::audit::{event, AuditLog};
use crate::clock::Clock;
use crate::feature_flags::FeatureFlagRegistry;
use crate::store::{ConfigStore, StoreError};

const COMPONENT: &str = "remote_config";
const SNAPSHOT_KEY: &str = "config.snapshot";

/// A snapshot older than this at verification time is rejected as stale.
pub const CONFIG_FRESHNESS_MS: i64 = 60 * 60 * 1000;
/// Tolerated forward clock skew on the snapshot timestamp.
pub const FUTURE_SKEW_MS: i64 = 5 * 60 * 1000;

/// Signature verification boundary; the platform crypto library supplies
/// the real implementation.
pub trait SignatureVerifier: Send + Sync {
    /// `Ok(true)` when `signature` is valid over `payload`, `Ok(false)`
    /// when it is definitively invalid, `Err` when verification itself
    /// failed.
    fn verify(&self, payload: &[u8], signature: &[u8]) -> Result<bool, String>;
}

/// Keyed-digest verifier over a pinned key: the signature is the SHA-256
/// of the pinned key followed by the payload.
#[derive(Debug, Clone)]
pub struct PinnedKeyVerifier {
    key: Vec<u8>,
}

impl PinnedKeyVerifier {
    pub fn new(key: Vec<u8>) -> Self {
        Self { key }
    }

    /// Produce a signature for `payload`; signer-side counterpart used by
    /// the distribution tooling and tests.
    pub fn sign(&self, payload: &[u8]) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(&self.key);
        hasher.update(payload);
        hasher.finalize().to_vec()
    }
}

impl SignatureVerifier for PinnedKeyVerifier {
    fn verify(&self, payload: &[u8], signature: &[u8]) -> Result<bool, String> {
        Ok(self.sign(payload) == signature)
    }
}

/// The last accepted configuration snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub version: String,
    pub timestamp_ms: i64,
    pub features: BTreeMap<String, bool>,
    /// All top-level payload values, for the typed getters.
    pub values: BTreeMap<String, serde_json::Value>,
    pub signature_valid: bool,
    pub cached_at_ms: i64,
}

/// Outcome of a config update attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConfigUpdateOutcome {
    /// The snapshot was verified, validated, persisted, and applied.
    Success,
    /// Signature verification rejected the payload; nothing persisted.
    InvalidSignature,
    /// The payload is authentic but structurally invalid.
    InvalidConfig(Vec<String>),
    /// Another update is in flight.
    AlreadyUpdating,
    /// Verification machinery or storage failed; the last valid snapshot
    /// is untouched.
    Error(String),
}

/// Ingest manager over the store and flag registry. Safe for concurrent
/// use.
pub struct RemoteConfigIngest {
    store: Arc<dyn ConfigStore>,
    flags: Arc<FeatureFlagRegistry>,
    verifier: Arc<dyn SignatureVerifier>,
    clock: Arc<dyn Clock>,
    audit: Arc<AuditLog>,
    updating: AtomicBool,
}

impl RemoteConfigIngest {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        flags: Arc<FeatureFlagRegistry>,
        verifier: Arc<dyn SignatureVerifier>,
        clock: Arc<dyn Clock>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            store,
            flags,
            verifier,
            clock,
            audit,
            updating: AtomicBool::new(false),
        }
    }

    /// Verify, validate, persist, and apply a config payload.
    pub fn update_config(
        &self,
        payload: &str,
        signature: &[u8],
        version: &str,
    ) -> ConfigUpdateOutcome {
        if self
            .updating
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return ConfigUpdateOutcome::AlreadyUpdating;
        }
        let outcome = self.update_locked(payload, signature, version);
        self.updating.store(false, Ordering::Release);
        outcome
    }

    fn update_locked(
        &self,
        payload: &str,
        signature: &[u8],
        version: &str,
    ) -> ConfigUpdateOutcome {
        let now = self.clock.now_ms();
        match self.verifier.verify(payload.as_bytes(), signature) {
            Ok(true) => {}
            Ok(false) => {
                self.audit.record(
                    event(COMPONENT, "update_config", "denied", now)
                        .with_detail("signature rejected"),
                );
                return ConfigUpdateOutcome::InvalidSignature;
            }
            // Verification internals are not disclosed in the outcome.
            Err(_) => {
                return ConfigUpdateOutcome::Error(
                    "signature verification unavailable".to_string(),
                )
            }
        }

        let (snapshot, issues) = self.validate_payload(payload, version, now);
        if !issues.is_empty() {
            self.audit.record(
                event(COMPONENT, "update_config", "denied", now)
                    .with_detail(&issues.join("; ")),
            );
            return ConfigUpdateOutcome::InvalidConfig(issues);
        }
        let Some(snapshot) = snapshot else {
            return ConfigUpdateOutcome::Error("validation produced no snapshot".to_string());
        };

        if let Err(err) = self.persist_snapshot(&snapshot) {
            return ConfigUpdateOutcome::Error(err.to_string());
        }
        self.flags
            .update_from_remote(&snapshot.features, &BTreeMap::new(), "remote_config");
        self.audit.record(
            event(COMPONENT, "update_config", "ok", now).with_detail(&snapshot.version),
        );
        ConfigUpdateOutcome::Success
    }

    fn validate_payload(
        &self,
        payload: &str,
        version: &str,
        now: i64,
    ) -> (Option<ConfigSnapshot>, Vec<String>) {
        let mut issues = Vec::new();

        let root: serde_json::Value = match serde_json::from_str(payload) {
            Ok(root) => root,
            Err(err) => return (None, vec![format!("payload is not valid JSON: {err}")]),
        };
        let Some(object) = root.as_object() else {
            return (None, vec!["payload is not a JSON object".to_string()]);
        };

        let payload_version = object.get("version").and_then(|v| v.as_str());
        match payload_version {
            None => issues.push("version missing or not a string".to_string()),
            Some(v) if !is_semver(v) => {
                issues.push(format!("version `{v}` is not semver-shaped (X.Y.Z)"));
            }
            Some(v) if v != version => {
                issues.push(format!(
                    "version `{v}` does not match declared version `{version}`"
                ));
            }
            Some(_) => {}
        }

        let timestamp_ms = object.get("timestamp").and_then(|v| v.as_i64());
        match timestamp_ms {
            None => issues.push("timestamp missing or not an integer".to_string()),
            Some(ts) => {
                if now - ts > CONFIG_FRESHNESS_MS {
                    issues.push("timestamp is outside the freshness window".to_string());
                } else if ts - now > FUTURE_SKEW_MS {
                    issues.push("timestamp is in the future".to_string());
                }
            }
        }

        let mut features = BTreeMap::new();
        match object.get("features") {
            Some(serde_json::Value::Object(map)) => {
                for (name, value) in map {
                    match value.as_bool() {
                        Some(flag) => {
                            features.insert(name.clone(), flag);
                        }
                        None => issues.push(format!("feature `{name}` is not a boolean")),
                    }
                }
            }
            Some(_) => issues.push("features is not an object".to_string()),
            None => issues.push("features map missing".to_string()),
        }

        if !issues.is_empty() {
            return (None, issues);
        }
        let values = object
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        (
            Some(ConfigSnapshot {
                version: payload_version.unwrap_or_default().to_string(),
                timestamp_ms: timestamp_ms.unwrap_or_default(),
                features,
                values,
                signature_valid: true,
                cached_at_ms: now,
            }),
            issues,
        )
    }

    fn persist_snapshot(&self, snapshot: &ConfigSnapshot) -> Result<(), StoreError> {
        let payload =
            serde_json::to_string(snapshot).map_err(|err| StoreError::WriteFailure {
                detail: format!("snapshot serialization: {err}"),
            })?;
        self.store
            .put(SNAPSHOT_KEY, payload, "remote_config", snapshot.cached_at_ms)?;
        Ok(())
    }

    /// The last snapshot that passed both verification and validation.
    pub fn last_valid_snapshot(&self) -> Option<ConfigSnapshot> {
        let record = self.store.get(SNAPSHOT_KEY).ok()??;
        let snapshot: ConfigSnapshot = serde_json::from_str(&record.value).ok()?;
        snapshot.signature_valid.then_some(snapshot)
    }

    /// String value from the last valid snapshot, or `default`.
    pub fn get_string_config(&self, key: &str, default: &str) -> String {
        self.last_valid_snapshot()
            .and_then(|s| s.values.get(key)?.as_str().map(str::to_string))
            .unwrap_or_else(|| default.to_string())
    }

    /// Integer value from the last valid snapshot, or `default`.
    pub fn get_int_config(&self, key: &str, default: i64) -> i64 {
        self.last_valid_snapshot()
            .and_then(|s| s.values.get(key)?.as_i64())
            .unwrap_or(default)
    }

    /// Boolean value from the last valid snapshot, or `default`.
    pub fn get_bool_config(&self, key: &str, default: bool) -> bool {
        self.last_valid_snapshot()
            .and_then(|s| s.values.get(key)?.as_bool())
            .unwrap_or(default)
    }
}

/// Strict `X.Y.Z` check with numeric components.
fn is_semver(version: &str) -> bool {
    let parts: Vec<&str> = version.split('.').collect();
    parts.len() == 3
        && parts
            .iter()
            .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_digit()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::feature_flags::FLAG_TE_LANGUAGE;
    use crate::store::{FaultMode, MemoryStore};

    const NOW_MS: i64 = 1_700_000_000_000;

    struct Fixture {
        ingest: RemoteConfigIngest,
        flags: Arc<FeatureFlagRegistry>,
        store: Arc<MemoryStore>,
        verifier: PinnedKeyVerifier,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock: Arc<ManualClock> = Arc::new(ManualClock::new(NOW_MS));
        let audit = Arc::new(AuditLog::new());
        let flags = Arc::new(FeatureFlagRegistry::new(
            store.clone(),
            clock.clone(),
            audit.clone(),
        ));
        let verifier = PinnedKeyVerifier::new(b"pinned-release-key".to_vec());
        let ingest = RemoteConfigIngest::new(
            store.clone(),
            flags.clone(),
            Arc::new(verifier.clone()),
            clock,
            audit,
        );
        Fixture {
            ingest,
            flags,
            store,
            verifier,
        }
    }

    fn payload(version: &str, timestamp: i64) -> String {
        format!(
            r#"{{"version": "{version}", "timestamp": {timestamp},
                "features": {{"te_language_enabled": true}},
                "upload_endpoint": "https://cfg.example/v1", "max_note_len": 4000,
                "beta_ui": false}}"#
        )
    }

    #[test]
    fn valid_signed_config_is_applied() {
        let fx = fixture();
        let body = payload("1.2.3", NOW_MS - 1_000);
        let sig = fx.verifier.sign(body.as_bytes());

        assert_eq!(
            fx.ingest.update_config(&body, &sig, "1.2.3"),
            ConfigUpdateOutcome::Success
        );
        let snapshot = fx.ingest.last_valid_snapshot().unwrap();
        assert_eq!(snapshot.version, "1.2.3");
        assert!(fx.flags.is_enabled(FLAG_TE_LANGUAGE));
        assert_eq!(
            fx.ingest.get_string_config("upload_endpoint", "none"),
            "https://cfg.example/v1"
        );
        assert_eq!(fx.ingest.get_int_config("max_note_len", 0), 4000);
        assert!(!fx.ingest.get_bool_config("beta_ui", true));
    }

    #[test]
    fn tampered_signature_persists_nothing() {
        let fx = fixture();
        let body = payload("1.2.3", NOW_MS - 1_000);
        let mut sig = fx.verifier.sign(body.as_bytes());
        sig[0] ^= 0xFF;

        assert_eq!(
            fx.ingest.update_config(&body, &sig, "1.2.3"),
            ConfigUpdateOutcome::InvalidSignature
        );
        assert!(fx.ingest.last_valid_snapshot().is_none());
        assert_eq!(fx.ingest.get_string_config("upload_endpoint", "none"), "none");
        assert!(!fx.flags.is_enabled(FLAG_TE_LANGUAGE));
    }

    #[test]
    fn rejected_update_keeps_the_prior_snapshot() {
        let fx = fixture();
        let good = payload("1.0.0", NOW_MS - 1_000);
        let sig = fx.verifier.sign(good.as_bytes());
        fx.ingest.update_config(&good, &sig, "1.0.0");

        let forged = payload("9.9.9", NOW_MS);
        assert_eq!(
            fx.ingest.update_config(&forged, b"junk", "9.9.9"),
            ConfigUpdateOutcome::InvalidSignature
        );
        assert_eq!(fx.ingest.last_valid_snapshot().unwrap().version, "1.0.0");
    }

    #[test]
    fn stale_timestamp_is_invalid_config() {
        let fx = fixture();
        let body = payload("1.2.3", NOW_MS - CONFIG_FRESHNESS_MS - 1);
        let sig = fx.verifier.sign(body.as_bytes());

        match fx.ingest.update_config(&body, &sig, "1.2.3") {
            ConfigUpdateOutcome::InvalidConfig(issues) => {
                assert!(issues.iter().any(|i| i.contains("freshness")));
            }
            other => panic!("expected InvalidConfig, got {other:?}"),
        }
        assert!(fx.ingest.last_valid_snapshot().is_none());
    }

    #[test]
    fn zero_timestamp_is_stale_not_missing() {
        let fx = fixture();
        // Epoch zero is a present, maximally stale timestamp; it must hit
        // the freshness window, not the missing-field branch.
        let body = payload("1.2.3", 0);
        let sig = fx.verifier.sign(body.as_bytes());

        match fx.ingest.update_config(&body, &sig, "1.2.3") {
            ConfigUpdateOutcome::InvalidConfig(issues) => {
                assert!(issues.iter().any(|i| i.contains("freshness")));
                assert!(!issues.iter().any(|i| i.contains("missing")));
            }
            other => panic!("expected InvalidConfig, got {other:?}"),
        }
        assert!(fx.ingest.last_valid_snapshot().is_none());
    }

    #[test]
    fn missing_version_field_is_invalid_config() {
        let fx = fixture();
        let body = format!(
            r#"{{"timestamp": {NOW_MS}, "features": {{"beta_ui": true}}}}"#
        );
        let sig = fx.verifier.sign(body.as_bytes());

        match fx.ingest.update_config(&body, &sig, "1.2.3") {
            ConfigUpdateOutcome::InvalidConfig(issues) => {
                assert!(issues.iter().any(|i| i.contains("version missing")));
            }
            other => panic!("expected InvalidConfig, got {other:?}"),
        }
        assert!(fx.ingest.last_valid_snapshot().is_none());
    }

    #[test]
    fn payload_version_must_match_declared_version() {
        let fx = fixture();
        let body = payload("1.2.3", NOW_MS - 1_000);
        let sig = fx.verifier.sign(body.as_bytes());

        match fx.ingest.update_config(&body, &sig, "2.0.0") {
            ConfigUpdateOutcome::InvalidConfig(issues) => {
                assert!(issues.iter().any(|i| i.contains("does not match")));
            }
            other => panic!("expected InvalidConfig, got {other:?}"),
        }
    }

    #[test]
    fn malformed_version_and_features_collect_issues() {
        let fx = fixture();
        let body = format!(
            r#"{{"version": "1.2", "timestamp": {},
                "features": {{"x": "yes"}}}}"#,
            NOW_MS
        );
        let sig = fx.verifier.sign(body.as_bytes());

        match fx.ingest.update_config(&body, &sig, "1.2") {
            ConfigUpdateOutcome::InvalidConfig(issues) => {
                assert_eq!(issues.len(), 2);
            }
            other => panic!("expected InvalidConfig, got {other:?}"),
        }
    }

    #[test]
    fn non_json_payload_is_invalid_config() {
        let fx = fixture();
        let body = "not json at all";
        let sig = fx.verifier.sign(body.as_bytes());
        assert!(matches!(
            fx.ingest.update_config(body, &sig, "1.0.0"),
            ConfigUpdateOutcome::InvalidConfig(_)
        ));
    }

    #[test]
    fn verifier_failure_is_an_error_without_internals() {
        struct BrokenVerifier;
        impl SignatureVerifier for BrokenVerifier {
            fn verify(&self, _: &[u8], _: &[u8]) -> Result<bool, String> {
                Err("keystore timeout at 0x7fe3".to_string())
            }
        }

        let store = Arc::new(MemoryStore::new());
        let clock: Arc<ManualClock> = Arc::new(ManualClock::new(NOW_MS));
        let audit = Arc::new(AuditLog::new());
        let flags = Arc::new(FeatureFlagRegistry::new(
            store.clone(),
            clock.clone(),
            audit.clone(),
        ));
        let ingest = RemoteConfigIngest::new(
            store,
            flags,
            Arc::new(BrokenVerifier),
            clock,
            audit,
        );

        match ingest.update_config("{}", b"sig", "1.0.0") {
            ConfigUpdateOutcome::Error(message) => {
                assert!(!message.contains("keystore"));
                assert!(!message.contains("0x7fe3"));
            }
            other => panic!("expected Error, got {other:?}"),
        }
        assert!(ingest.last_valid_snapshot().is_none());
    }

    #[test]
    fn storage_failure_leaves_prior_snapshot() {
        let fx = fixture();
        let good = payload("1.0.0", NOW_MS - 1_000);
        let sig = fx.verifier.sign(good.as_bytes());
        fx.ingest.update_config(&good, &sig, "1.0.0");

        fx.store.set_fault_mode(FaultMode::FailWrites);
        let next = payload("2.0.0", NOW_MS);
        let sig = fx.verifier.sign(next.as_bytes());
        assert!(matches!(
            fx.ingest.update_config(&next, &sig, "2.0.0"),
            ConfigUpdateOutcome::Error(_)
        ));
        fx.store.set_fault_mode(FaultMode::None);
        assert_eq!(fx.ingest.last_valid_snapshot().unwrap().version, "1.0.0");
    }

    #[test]
    fn semver_shapes() {
        assert!(is_semver("0.0.1"));
        assert!(is_semver("12.34.56"));
        assert!(!is_semver("1.2"));
        assert!(!is_semver("1.2.3.4"));
        assert!(!is_semver("1.2.x"));
        assert!(!is_semver(""));
    }

    #[test]
    fn getters_fall_back_without_snapshot() {
        let fx = fixture();
        assert_eq!(fx.ingest.get_string_config("k", "fallback"), "fallback");
        assert_eq!(fx.ingest.get_int_config("k", 7), 7);
        assert!(fx.ingest.get_bool_config("k", true));
    }
}
