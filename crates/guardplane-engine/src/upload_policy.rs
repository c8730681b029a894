//! Per-tenant upload/network policy combined with live connectivity.
//!
//! Policy decides whether encrypted note uploads may use the current
//! transport. Wi-Fi and Ethernet are always acceptable; cellular only
//! when the tenant permits metered uploads; anything else is blocked.
//! A connectivity-probe failure blocks rather than guessing.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::audit::{event, AuditLog};
use crate::clock::Clock;
use crate::store::{ConfigStore, StoreError};

const COMPONENT: &str = "upload_policy";

/// Network transport reported by the connectivity probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkTransport {
    Wifi,
    Ethernet,
    Cellular,
    /// Bluetooth, VPN-only, and other unclassified transports.
    Other,
    Offline,
}

impl fmt::Display for NetworkTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Wifi => f.write_str("wifi"),
            Self::Ethernet => f.write_str("ethernet"),
            Self::Cellular => f.write_str("cellular"),
            Self::Other => f.write_str("other"),
            Self::Offline => f.write_str("offline"),
        }
    }
}

/// Connectivity boundary; the host platform supplies the real probe.
pub trait ConnectivityProbe: Send + Sync {
    fn current_transport(&self) -> Result<NetworkTransport, String>;
}

/// Persisted per-tenant policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantPolicy {
    pub tenant_id: String,
    pub wifi_only: bool,
    pub metered_ok: bool,
    pub version: u32,
}

impl TenantPolicy {
    /// Conservative default: unmetered transports only.
    pub fn default_for(tenant_id: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            wifi_only: true,
            metered_ok: false,
            version: 1,
        }
    }
}

/// Typed upload decision with a user-presentable reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadDecision {
    Allowed(String),
    Blocked(String),
}

impl UploadDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed(_))
    }
}

/// Compliance evaluation of the stored policy against live state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceReport {
    pub compliant: bool,
    pub issues: Vec<String>,
}

/// Policy manager over the store and connectivity probe. Safe for
/// concurrent use.
pub struct UploadPolicy {
    store: Arc<dyn ConfigStore>,
    connectivity: Arc<dyn ConnectivityProbe>,
    clock: Arc<dyn Clock>,
    audit: Arc<AuditLog>,
}

impl UploadPolicy {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        connectivity: Arc<dyn ConnectivityProbe>,
        clock: Arc<dyn Clock>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            store,
            connectivity,
            clock,
            audit,
        }
    }

    fn policy_key(tenant_id: &str) -> String {
        format!("upload.policy.{tenant_id}")
    }

    /// Stored policy for a tenant, or the conservative default.
    pub fn policy(&self, tenant_id: &str) -> TenantPolicy {
        self.store
            .get(&Self::policy_key(tenant_id))
            .ok()
            .flatten()
            .and_then(|record| serde_json::from_str(&record.value).ok())
            .unwrap_or_else(|| TenantPolicy::default_for(tenant_id))
    }

    /// Persist a tenant policy.
    pub fn set_policy(&self, policy: &TenantPolicy, actor: &str) -> Result<(), StoreError> {
        let payload = serde_json::to_string(policy).map_err(|err| StoreError::WriteFailure {
            detail: format!("policy serialization: {err}"),
        })?;
        let now = self.clock.now_ms();
        self.store
            .put(&Self::policy_key(&policy.tenant_id), payload, actor, now)?;
        self.audit.record(
            event(COMPONENT, "set_policy", "ok", now)
                .with_actor(actor)
                .with_detail(&policy.tenant_id),
        );
        Ok(())
    }

    /// Decide whether an upload may proceed for this tenant right now.
    pub fn is_upload_allowed(&self, tenant_id: &str) -> UploadDecision {
        let policy = self.policy(tenant_id);
        let transport = match self.connectivity.current_transport() {
            Ok(transport) => transport,
            Err(err) => {
                self.audit.record(
                    event(COMPONENT, "is_upload_allowed", "fail_safe", self.clock.now_ms())
                        .with_detail(&err),
                );
                return UploadDecision::Blocked(format!("Error probing connectivity: {err}"));
            }
        };
        match transport {
            NetworkTransport::Offline => {
                UploadDecision::Blocked("No network connection".to_string())
            }
            NetworkTransport::Wifi => UploadDecision::Allowed("WiFi connection".to_string()),
            NetworkTransport::Ethernet => {
                UploadDecision::Allowed("Ethernet connection".to_string())
            }
            NetworkTransport::Cellular => {
                if policy.metered_ok {
                    UploadDecision::Allowed("Metered connection permitted by policy".to_string())
                } else {
                    UploadDecision::Blocked(
                        "Metered connection blocked by policy".to_string(),
                    )
                }
            }
            NetworkTransport::Other => {
                UploadDecision::Blocked("Unsupported network transport".to_string())
            }
        }
    }

    /// Evaluate the stored policy for internal consistency and current
    /// reachability. Conflicting intent is flagged, never auto-corrected.
    pub fn validate_policy_compliance(&self, tenant_id: &str) -> ComplianceReport {
        let mut issues = Vec::new();
        let policy = self.policy(tenant_id);

        if policy.tenant_id.trim().is_empty() {
            issues.push("tenant id is empty".to_string());
        }
        if policy.wifi_only && policy.metered_ok {
            issues.push(
                "policy conflict: wifi_only and metered_ok are both set".to_string(),
            );
        }
        match self.connectivity.current_transport() {
            Ok(NetworkTransport::Offline) => {
                issues.push("no network is currently reachable".to_string())
            }
            Ok(_) => {}
            Err(err) => issues.push(format!("connectivity probe failed: {err}")),
        }

        ComplianceReport {
            compliant: issues.is_empty(),
            issues,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
