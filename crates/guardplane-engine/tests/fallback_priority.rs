use std::sync::Arc;

use tempfile::TempDir;

use guardplane_engine::clock::ManualClock;
use guardplane_engine::device_allowlist::{DeviceIdentity, HardwareProbe};
use guardplane_engine::fallback::{FallbackAction, FallbackMode};
use guardplane_engine::feature_flags::FLAG_AMBIENT_SCRIBE;
use guardplane_engine::kill_switch::Capability;
use guardplane_engine::release_gate::GateSignals;
use guardplane_engine::remote_config::PinnedKeyVerifier;
use guardplane_engine::store::{FaultMode, MemoryStore};
use guardplane_engine::upload_policy::{ConnectivityProbe, NetworkTransport};
use guardplane_engine::{ControlPlane, ControlPlaneDeps};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct CapableHardware;

impl HardwareProbe for CapableHardware {
    fn total_memory_bytes(&self) -> Result<u64, String> {
        Ok(6 * 1024 * 1024 * 1024)
    }

    fn free_storage_bytes(&self) -> Result<u64, String> {
        Ok(8 * 1024 * 1024 * 1024)
    }
}

struct HealthySignals;

impl GateSignals for HealthySignals {
    fn performance_score(&self) -> Result<f64, String> {
        Ok(0.95)
    }

    fn privacy_violations(&self) -> Result<Vec<String>, String> {
        Ok(Vec::new())
    }
}

struct WifiConnectivity;

impl ConnectivityProbe for WifiConnectivity {
    fn current_transport(&self) -> Result<NetworkTransport, String> {
        Ok(NetworkTransport::Wifi)
    }
}

struct Fixture {
    plane: ControlPlane,
    store: Arc<MemoryStore>,
    _tmp: TempDir,
}

fn fixture() -> Fixture {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let plane = ControlPlane::new(ControlPlaneDeps {
        store: store.clone(),
        clock: Arc::new(ManualClock::new(1_000)),
        verifier: Arc::new(PinnedKeyVerifier::new(b"test-key".to_vec())),
        hardware: Arc::new(CapableHardware),
        signals: Arc::new(HealthySignals),
        connectivity: Arc::new(WifiConnectivity),
        identity: DeviceIdentity {
            manufacturer: "acme".to_string(),
            model: "tablet-9".to_string(),
            build_fingerprint: "acme/tablet-9/build-42".to_string(),
        },
        model_root: tmp.path().to_path_buf(),
    });
    Fixture {
        plane,
        store,
        _tmp: tmp,
    }
}

// ---------------------------------------------------------------------------
// Integration tests
// ---------------------------------------------------------------------------

#[test]
fn healthy_plane_resolves_no_fallback() {
    let fx = fixture();
    assert_eq!(fx.plane.fallback.check_fallback_mode(), FallbackMode::None);
    assert!(!fx.plane.fallback.is_in_fallback_mode());
    assert_eq!(fx.plane.fallback.fallback_action(), FallbackAction::None);
}

#[test]
fn priority_chain_resolves_highest_active_restriction() {
    let fx = fixture();

    // Activate everything at once; the chain resolves top-down.
    fx.plane
        .flags
        .set_enabled(FLAG_AMBIENT_SCRIBE, false, "ops");
    fx.plane.kills.activate_emergency("incident", "ops").unwrap();
    fx.plane.kills.kill(Capability::App, "crash loop", "ops").unwrap();
    fx.plane.kills.kill(Capability::Audio, "mic fault", "ops").unwrap();
    fx.plane.kills.kill(Capability::Llm, "bad output", "ops").unwrap();

    assert_eq!(
        fx.plane.fallback.check_fallback_mode(),
        FallbackMode::FeatureDisabled
    );

    // Peel restrictions off one at a time and watch the chain walk down.
    fx.plane.flags.set_enabled(FLAG_AMBIENT_SCRIBE, true, "ops");
    assert_eq!(
        fx.plane.fallback.check_fallback_mode(),
        FallbackMode::Emergency
    );

    fx.plane.kills.deactivate_emergency("ops").unwrap();
    assert_eq!(
        fx.plane.fallback.check_fallback_mode(),
        FallbackMode::AppDisabled
    );

    fx.plane.kills.restore(Capability::App, "ops").unwrap();
    assert_eq!(
        fx.plane.fallback.check_fallback_mode(),
        FallbackMode::AudioDisabled
    );

    fx.plane.kills.restore(Capability::Audio, "ops").unwrap();
    assert_eq!(
        fx.plane.fallback.check_fallback_mode(),
        FallbackMode::LlmDisabled
    );

    fx.plane.kills.restore(Capability::Llm, "ops").unwrap();
    assert_eq!(fx.plane.fallback.check_fallback_mode(), FallbackMode::None);
}

#[test]
fn modes_carry_consistent_actions_and_messages() {
    let fx = fixture();

    fx.plane.kills.kill(Capability::Audio, "mic fault", "ops").unwrap();
    fx.plane.fallback.check_fallback_mode();
    assert_eq!(
        fx.plane.fallback.fallback_action(),
        FallbackAction::ManualEntry
    );
    assert!(fx.plane.fallback.is_manual_note_entry_available());
    assert!(!fx.plane.fallback.fallback_message().is_empty());

    fx.plane.kills.restore(Capability::Audio, "ops").unwrap();
    fx.plane.kills.kill(Capability::Llm, "bad output", "ops").unwrap();
    fx.plane.fallback.check_fallback_mode();
    assert_eq!(
        fx.plane.fallback.fallback_action(),
        FallbackAction::BasicGeneration
    );
    assert!(fx.plane.fallback.is_basic_generation_available());
}

#[test]
fn limited_functionality_only_when_feature_is_disabled() {
    let fx = fixture();

    fx.plane
        .flags
        .set_enabled(FLAG_AMBIENT_SCRIBE, false, "ops");
    fx.plane.fallback.check_fallback_mode();
    assert!(fx.plane.fallback.is_limited_functionality_available());

    fx.plane.flags.set_enabled(FLAG_AMBIENT_SCRIBE, true, "ops");
    fx.plane.kills.activate_emergency("incident", "ops").unwrap();
    fx.plane.fallback.check_fallback_mode();
    assert!(!fx.plane.fallback.is_limited_functionality_available());
}

#[test]
fn storage_failure_resolves_error_and_kills_fail_dangerous() {
    let fx = fixture();
    fx.store.set_fault_mode(FaultMode::FailReads);

    assert_eq!(fx.plane.fallback.check_fallback_mode(), FallbackMode::Error);
    // Individual predicates degrade in their documented directions.
    assert!(fx.plane.kills.is_killed(Capability::Audio));
    assert!(fx.plane.kills.is_emergency_killed());
    assert!(!fx.plane.flags.is_enabled(FLAG_AMBIENT_SCRIBE));
    assert!(!fx.plane.ramp.has_feature_access());
    assert!(!fx.plane.allowlist.is_device_allowed());

    fx.store.set_fault_mode(FaultMode::None);
    assert_eq!(fx.plane.fallback.check_fallback_mode(), FallbackMode::None);
}

#[test]
fn fallback_resolution_is_audited() {
    let fx = fixture();
    fx.plane.kills.kill(Capability::Llm, "bad output", "ops").unwrap();
    fx.plane.fallback.check_fallback_mode();

    let events = fx.plane.audit.events();
    assert!(events
        .iter()
        .any(|e| e.component == "fallback" && e.outcome == "fallback"));
}
