use std::collections::BTreeMap;
use std::sync::Arc;

use tempfile::TempDir;

use guardplane_engine::clock::ManualClock;
use guardplane_engine::device_allowlist::{DeviceIdentity, HardwareProbe};
use guardplane_engine::model_lifecycle::{
    ModelRollbackResult, SwapResult, MIN_MODEL_BIN_BYTES, PREVIOUS_RETENTION_MS,
};
use guardplane_engine::release_gate::GateSignals;
use guardplane_engine::remote_config::PinnedKeyVerifier;
use guardplane_engine::store::MemoryStore;
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
    clock: Arc<ManualClock>,
    _tmp: TempDir,
}

fn fixture() -> Fixture {
    let tmp = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(1_000));
    let plane = ControlPlane::new(ControlPlaneDeps {
        store: Arc::new(MemoryStore::new()),
        clock: clock.clone(),
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
        clock,
        _tmp: tmp,
    }
}

fn bundle(marker: u8) -> BTreeMap<String, Vec<u8>> {
    let mut files = BTreeMap::new();
    files.insert(
        "model.bin".to_string(),
        vec![marker; MIN_MODEL_BIN_BYTES as usize],
    );
    files.insert("config.json".to_string(), br#"{"layers": 12}"#.to_vec());
    files.insert("vocab.txt".to_string(), b"hello\nworld\n".to_vec());
    files
}

// ---------------------------------------------------------------------------
// Integration tests
// ---------------------------------------------------------------------------

#[test]
fn install_upgrade_and_roll_back() {
    let fx = fixture();

    assert!(matches!(
        fx.plane
            .models
            .swap_to_model("scribe", "1.0.0", &bundle(1), "installer"),
        SwapResult::Success(_)
    ));
    assert_eq!(fx.plane.models.current_model().unwrap().version, "1.0.0");
    assert!(fx.plane.models.previous_model().is_none());

    fx.clock.set(60_000);
    assert!(matches!(
        fx.plane
            .models
            .swap_to_model("scribe", "2.0.0", &bundle(2), "installer"),
        SwapResult::Success(_)
    ));
    assert_eq!(fx.plane.models.current_model().unwrap().version, "2.0.0");
    let previous = fx.plane.models.previous_model().unwrap();
    assert_eq!(previous.version, "1.0.0");
    assert_eq!(
        previous.retention_deadline_ms,
        60_000 + PREVIOUS_RETENTION_MS
    );

    match fx.plane.models.rollback_to_previous("oncall") {
        ModelRollbackResult::Success(descriptor) => {
            assert_eq!(descriptor.version, "1.0.0");
        }
        other => panic!("expected Success, got {other:?}"),
    }
    assert_eq!(fx.plane.models.current_model().unwrap().version, "1.0.0");

    // One retained slot; a second rollback has nothing to restore.
    assert_eq!(
        fx.plane.models.rollback_to_previous("oncall"),
        ModelRollbackResult::NoPreviousModel
    );
}

#[test]
fn invalid_bundle_is_rejected_before_any_disk_change() {
    let fx = fixture();
    fx.plane
        .models
        .swap_to_model("scribe", "1.0.0", &bundle(1), "installer");

    let mut broken = bundle(2);
    broken.insert("config.json".to_string(), b"{broken".to_vec());
    match fx
        .plane
        .models
        .swap_to_model("scribe", "2.0.0", &broken, "installer")
    {
        SwapResult::InvalidModel(errors) => {
            assert!(errors.iter().any(|e| e.contains("not valid JSON")));
        }
        other => panic!("expected InvalidModel, got {other:?}"),
    }
    // The active model is untouched.
    assert_eq!(fx.plane.models.current_model().unwrap().version, "1.0.0");
}

#[test]
fn retention_window_expires_the_previous_model() {
    let fx = fixture();
    fx.plane
        .models
        .swap_to_model("scribe", "1.0.0", &bundle(1), "installer");
    fx.plane
        .models
        .swap_to_model("scribe", "2.0.0", &bundle(2), "installer");

    // Inside the window nothing is purged.
    fx.clock.advance(PREVIOUS_RETENTION_MS - 1);
    assert!(!fx.plane.models.purge_expired_previous("gc").unwrap());
    assert!(fx.plane.models.previous_model().is_some());

    fx.clock.advance(2);
    assert!(fx.plane.models.purge_expired_previous("gc").unwrap());
    assert!(fx.plane.models.previous_model().is_none());
    assert_eq!(
        fx.plane.models.rollback_to_previous("oncall"),
        ModelRollbackResult::NoPreviousModel
    );
}

#[test]
fn another_swap_restarts_the_retention_clock() {
    let fx = fixture();
    fx.plane
        .models
        .swap_to_model("scribe", "1.0.0", &bundle(1), "installer");
    fx.clock.set(10_000);
    fx.plane
        .models
        .swap_to_model("scribe", "2.0.0", &bundle(2), "installer");
    fx.clock.set(20_000);
    fx.plane
        .models
        .swap_to_model("scribe", "3.0.0", &bundle(3), "installer");

    let previous = fx.plane.models.previous_model().unwrap();
    assert_eq!(previous.version, "2.0.0");
    assert_eq!(
        previous.retention_deadline_ms,
        20_000 + PREVIOUS_RETENTION_MS
    );
}

#[test]
fn swap_and_release_rollback_compose() {
    use guardplane_engine::ramp_plan::RolloutPhase;
    use guardplane_engine::release_gate::RollbackOutcome;

    let fx = fixture();
    fx.plane
        .models
        .swap_to_model("scribe", "1.0.0", &bundle(1), "installer");
    fx.plane
        .models
        .swap_to_model("scribe", "2.0.0", &bundle(2), "installer");
    fx.plane.ramp.set_phase(RolloutPhase::Pilot2, "ops").unwrap();

    // Fleet containment and model rollback are independent levers; an
    // incident typically pulls both.
    assert_eq!(
        fx.plane.gate.trigger_rollback("model regression", "oncall"),
        RollbackOutcome::Success
    );
    assert!(matches!(
        fx.plane.models.rollback_to_previous("oncall"),
        ModelRollbackResult::Success(_)
    ));
    assert_eq!(fx.plane.models.current_model().unwrap().version, "1.0.0");
    assert_eq!(fx.plane.ramp.current_phase(), RolloutPhase::Pilot1);
}
