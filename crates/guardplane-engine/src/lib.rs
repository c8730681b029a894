#![forbid(unsafe_code)]

//! Progressive-delivery and safety-guardrail control plane for an
//! on-device ambient clinical scribe.
//!
//! Nine managers share one persistent [`store::ConfigStore`] and one
//! [`audit::AuditLog`]: feature flags with a dependency cascade, layered
//! kill switches, a fallback resolver, a phased ramp plan, a per-phase
//! device allowlist, atomic model swap/rollback, aggregate release
//! gates, signed remote-config ingest, and per-tenant upload policy.
//! Every guarded read degrades in its documented fail-safe direction
//! (see [`fail_safe`]): kill predicates fail toward "killed", everything
//! else fails toward "denied".
//!
//! [`ControlPlane`] is the composition root: all environment boundaries
//! (store, clock, signature verification, hardware, gate signals,
//! connectivity) enter through constructor injection, so tests swap any
//! of them for a fake.

use std::path::PathBuf;
use std::sync::Arc;

pub mod audit;
pub mod clock;
pub mod device_allowlist;
pub mod fail_safe;
pub mod fallback;
pub mod feature_flags;
pub mod kill_switch;
pub mod model_lifecycle;
pub mod ramp_plan;
pub mod release_gate;
pub mod remote_config;
pub mod store;
pub mod upload_policy;

use audit::AuditLog;
use clock::Clock;
use device_allowlist::{DeviceAllowlist, DeviceIdentity, HardwareProbe};
use fallback::FallbackResolver;
use feature_flags::FeatureFlagRegistry;
use kill_switch::KillSwitchRegistry;
use model_lifecycle::ModelLifecycleManager;
use ramp_plan::RampPlan;
use release_gate::{GateSignals, ReleaseGate};
use remote_config::{RemoteConfigIngest, SignatureVerifier};
use store::ConfigStore;
use upload_policy::{ConnectivityProbe, UploadPolicy};

/// Environment boundaries the control plane depends on.
///
/// Bundled into one struct so the constructor stays readable; every
/// field is a trait object the host platform (or a test) supplies.
pub struct ControlPlaneDeps {
    pub store: Arc<dyn ConfigStore>,
    pub clock: Arc<dyn Clock>,
    pub verifier: Arc<dyn SignatureVerifier>,
    pub hardware: Arc<dyn HardwareProbe>,
    pub signals: Arc<dyn GateSignals>,
    pub connectivity: Arc<dyn ConnectivityProbe>,
    pub identity: DeviceIdentity,
    pub model_root: PathBuf,
}

/// Fully-wired control plane. One instance per device process.
pub struct ControlPlane {
    pub audit: Arc<AuditLog>,
    pub flags: Arc<FeatureFlagRegistry>,
    pub kills: Arc<KillSwitchRegistry>,
    pub fallback: FallbackResolver,
    pub ramp: Arc<RampPlan>,
    pub allowlist: DeviceAllowlist,
    pub models: ModelLifecycleManager,
    pub gate: ReleaseGate,
    pub config: RemoteConfigIngest,
    pub uploads: UploadPolicy,
}

impl ControlPlane {
    /// Wire every manager against the supplied boundaries.
    pub fn new(deps: ControlPlaneDeps) -> Self {
        let audit = Arc::new(AuditLog::new());
        let flags = Arc::new(FeatureFlagRegistry::new(
            deps.store.clone(),
            deps.clock.clone(),
            audit.clone(),
        ));
        let kills = Arc::new(KillSwitchRegistry::new(
            deps.store.clone(),
            deps.clock.clone(),
            audit.clone(),
        ));
        let ramp = Arc::new(RampPlan::new(
            deps.store.clone(),
            deps.clock.clone(),
            audit.clone(),
        ));
        let fallback = FallbackResolver::new(
            flags.clone(),
            kills.clone(),
            deps.clock.clone(),
            audit.clone(),
        );
        let allowlist = DeviceAllowlist::new(
            deps.store.clone(),
            ramp.clone(),
            deps.hardware,
            deps.clock.clone(),
            audit.clone(),
            deps.identity,
        );
        let models = ModelLifecycleManager::new(
            deps.store.clone(),
            deps.clock.clone(),
            audit.clone(),
            deps.model_root,
        );
        let gate = ReleaseGate::new(
            deps.store.clone(),
            flags.clone(),
            kills.clone(),
            ramp.clone(),
            deps.signals,
            deps.clock.clone(),
            audit.clone(),
        );
        let config = RemoteConfigIngest::new(
            deps.store.clone(),
            flags.clone(),
            deps.verifier,
            deps.clock.clone(),
            audit.clone(),
        );
        let uploads = UploadPolicy::new(deps.store, deps.connectivity, deps.clock, audit.clone());
        Self {
            audit,
            flags,
            kills,
            fallback,
            ramp,
            allowlist,
            models,
            gate,
            config,
            uploads,
        }
    }
}
