//! Validated, atomic model swap with staged retention and rollback.
//!
//! Model bundles arrive as a name -> bytes map from the external
//! downloader. A swap validates the bundle, stages it to a temporary
//! directory, then promotes staging to current by rename — not
//! copy-then-delete — so there is no window where the active directory
//! is partially written. The prior current model is demoted to the
//! previous slot and retained for a fixed window before it is eligible
//! for garbage collection.
//!
//! Swap and rollback are single-flight: at most one of them is in flight
//! at a time, and a concurrent attempt returns `AlreadyUpdating` without
//! blocking. Any failure mid-swap restores the previously-active model;
//! there is no partial cutover.

use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::audit::{event, AuditLog};
use crate::clock::Clock;
use crate::store::{ConfigStore, StoreError};

const COMPONENT: &str = "model_lifecycle";
const CURRENT_KEY: &str = "model.current";
const PREVIOUS_KEY: &str = "model.previous";

/// Files every model bundle must contain, and nothing else.
pub const REQUIRED_MODEL_FILES: &[&str] = &["model.bin", "config.json", "vocab.txt"];

/// Bounds on the model binary.
pub const MIN_MODEL_BIN_BYTES: u64 = 1024 * 1024;
pub const MAX_MODEL_BIN_BYTES: u64 = 100 * 1024 * 1024;

/// How long a demoted model is retained before garbage collection.
pub const PREVIOUS_RETENTION_MS: i64 = 14 * 24 * 60 * 60 * 1000;

/// Identity of an installed model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub name: String,
    pub version: String,
}

/// Persisted record for the retained previous model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviousModelRecord {
    pub name: String,
    pub version: String,
    pub retention_deadline_ms: i64,
}

/// Outcome of bundle validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelValidation {
    pub is_valid: bool,
    pub errors: Vec<String>,
}

/// Outcome of a swap attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwapResult {
    /// The bundle was promoted and is now current.
    Success(ModelDescriptor),
    /// Validation rejected the bundle; disk was not touched.
    InvalidModel(Vec<String>),
    /// Writing the staging directory failed; the active model is intact.
    StagingFailed(String),
    /// Promotion failed; the previously-active model was restored.
    SwapFailed(String),
    /// Another swap or rollback is in flight.
    AlreadyUpdating,
    /// Unexpected storage/I-O failure.
    Error(String),
}

/// Outcome of a rollback attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelRollbackResult {
    /// The previous model is current again.
    Success(ModelDescriptor),
    /// No previous model is recorded.
    NoPreviousModel,
    /// A previous model is recorded but its files are gone.
    PreviousModelNotFound,
    /// The previous model no longer passes validation.
    InvalidPreviousModel(Vec<String>),
    /// Another swap or rollback is in flight.
    AlreadyUpdating,
    /// Unexpected storage/I-O failure.
    Error(String),
}

/// Validate a model bundle without touching disk.
pub fn validate_model(files: &BTreeMap<String, Vec<u8>>) -> ModelValidation {
    let mut errors = Vec::new();

    for required in REQUIRED_MODEL_FILES {
        match files.get(*required) {
            None => errors.push(format!("missing required file `{required}`")),
            Some(bytes) if bytes.is_empty() => {
                errors.push(format!("required file `{required}` is empty"))
            }
            Some(_) => {}
        }
    }
    for name in files.keys() {
        if !REQUIRED_MODEL_FILES.contains(&name.as_str()) {
            errors.push(format!("unexpected file `{name}` in bundle"));
        }
    }
    if let Some(model_bin) = files.get("model.bin") {
        let size = model_bin.len() as u64;
        if size > 0 && size < MIN_MODEL_BIN_BYTES {
            errors.push(format!(
                "model.bin is {size} bytes, below minimum {MIN_MODEL_BIN_BYTES}"
            ));
        }
        if size > MAX_MODEL_BIN_BYTES {
            errors.push(format!(
                "model.bin is {size} bytes, above maximum {MAX_MODEL_BIN_BYTES}"
            ));
        }
    }
    if let Some(config) = files.get("config.json") {
        if !config.is_empty() && serde_json::from_slice::<serde_json::Value>(config).is_err() {
            errors.push("config.json is not valid JSON".to_string());
        }
    }

    ModelValidation {
        is_valid: errors.is_empty(),
        errors,
    }
}

/// Manager for the on-disk model slots. Safe for concurrent use.
pub struct ModelLifecycleManager {
    store: Arc<dyn ConfigStore>,
    clock: Arc<dyn Clock>,
    audit: Arc<AuditLog>,
    root: PathBuf,
    updating: AtomicBool,
}

impl ModelLifecycleManager {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        clock: Arc<dyn Clock>,
        audit: Arc<AuditLog>,
        root: PathBuf,
    ) -> Self {
        Self {
            store,
            clock,
            audit,
            root,
            updating: AtomicBool::new(false),
        }
    }

    fn current_dir(&self) -> PathBuf {
        self.root.join("current")
    }

    fn previous_dir(&self) -> PathBuf {
        self.root.join("previous")
    }

    fn staging_dir(&self) -> PathBuf {
        self.root.join("staging")
    }

    /// Descriptor of the active model, if any.
    pub fn current_model(&self) -> Option<ModelDescriptor> {
        let record = self.store.get(CURRENT_KEY).ok()??;
        serde_json::from_str(&record.value).ok()
    }

    /// Record of the retained previous model, if any.
    pub fn previous_model(&self) -> Option<PreviousModelRecord> {
        let record = self.store.get(PREVIOUS_KEY).ok()??;
        serde_json::from_str(&record.value).ok()
    }

    /// Validate, stage, and atomically promote a new model bundle.
    pub fn swap_to_model(
        &self,
        name: &str,
        version: &str,
        files: &BTreeMap<String, Vec<u8>>,
        actor: &str,
    ) -> SwapResult {
        if self
            .updating
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return SwapResult::AlreadyUpdating;
        }
        let result = self.swap_locked(name, version, files, actor);
        self.updating.store(false, Ordering::Release);
        result
    }

    fn swap_locked(
        &self,
        name: &str,
        version: &str,
        files: &BTreeMap<String, Vec<u8>>,
        actor: &str,
    ) -> SwapResult {
        let now = self.clock.now_ms();
        let validation = validate_model(files);
        if !validation.is_valid {
            self.audit.record(
                event(COMPONENT, "swap", "denied", now)
                    .with_actor(actor)
                    .with_detail(&validation.errors.join("; ")),
            );
            return SwapResult::InvalidModel(validation.errors);
        }

        // Stage into a scratch directory under the same root so the later
        // rename stays on one filesystem.
        if let Err(err) = self.write_staging(files) {
            let _ = fs::remove_dir_all(self.staging_dir());
            return SwapResult::StagingFailed(err);
        }

        let had_current = self.current_dir().exists();
        if had_current {
            if self.previous_dir().exists() {
                if let Err(err) = fs::remove_dir_all(self.previous_dir()) {
                    let _ = fs::remove_dir_all(self.staging_dir());
                    return SwapResult::SwapFailed(format!(
                        "could not clear previous slot: {err}"
                    ));
                }
            }
            if let Err(err) = fs::rename(self.current_dir(), self.previous_dir()) {
                let _ = fs::remove_dir_all(self.staging_dir());
                return SwapResult::SwapFailed(format!("could not demote current: {err}"));
            }
        }
        if let Err(err) = fs::rename(self.staging_dir(), self.current_dir()) {
            // Restore the demoted model before reporting failure.
            if had_current {
                let _ = fs::rename(self.previous_dir(), self.current_dir());
            }
            let _ = fs::remove_dir_all(self.staging_dir());
            return SwapResult::SwapFailed(format!("could not promote staging: {err}"));
        }

        let demoted = self.current_model();
        let descriptor = ModelDescriptor {
            name: name.to_string(),
            version: version.to_string(),
        };
        if let Err(err) = self.persist_swap(&descriptor, demoted, had_current, actor, now) {
            // Undo the cutover so the active slot keeps matching the stored
            // descriptor: the new bundle goes back to staging, the demoted
            // model returns to current.
            let _ = fs::rename(self.current_dir(), self.staging_dir());
            if had_current {
                let _ = fs::rename(self.previous_dir(), self.current_dir());
            }
            let _ = fs::remove_dir_all(self.staging_dir());
            return SwapResult::Error(err.to_string());
        }
        self.audit.record(
            event(COMPONENT, "swap", "ok", now)
                .with_actor(actor)
                .with_detail(&format!("{name} {version}")),
        );
        SwapResult::Success(descriptor)
    }

    // The current descriptor is written last: if any earlier write fails,
    // `model.current` still names the model the cutover undo restores.
    fn persist_swap(
        &self,
        descriptor: &ModelDescriptor,
        demoted: Option<ModelDescriptor>,
        had_current: bool,
        actor: &str,
        now: i64,
    ) -> Result<(), StoreError> {
        match (had_current, demoted) {
            (true, Some(old)) => {
                let record = PreviousModelRecord {
                    name: old.name,
                    version: old.version,
                    // A fresh demotion restarts the retention clock.
                    retention_deadline_ms: now + PREVIOUS_RETENTION_MS,
                };
                let payload =
                    serde_json::to_string(&record).map_err(|err| StoreError::WriteFailure {
                        detail: format!("previous record serialization: {err}"),
                    })?;
                self.store.put(PREVIOUS_KEY, payload, actor, now)?;
            }
            _ => {
                self.store.delete(PREVIOUS_KEY)?;
            }
        }
        let payload =
            serde_json::to_string(descriptor).map_err(|err| StoreError::WriteFailure {
                detail: format!("descriptor serialization: {err}"),
            })?;
        self.store.put(CURRENT_KEY, payload, actor, now)?;
        Ok(())
    }

    fn write_staging(&self, files: &BTreeMap<String, Vec<u8>>) -> Result<(), String> {
        let staging = self.staging_dir();
        if staging.exists() {
            fs::remove_dir_all(&staging).map_err(|err| format!("stale staging: {err}"))?;
        }
        fs::create_dir_all(&staging).map_err(|err| format!("create staging: {err}"))?;
        for (name, bytes) in files {
            fs::write(staging.join(name), bytes)
                .map_err(|err| format!("write `{name}`: {err}"))?;
        }
        Ok(())
    }

    /// Roll the active model back to the retained previous one.
    ///
    /// The previous model is consumed: a second immediate rollback finds
    /// none recorded.
    pub fn rollback_to_previous(&self, actor: &str) -> ModelRollbackResult {
        if self
            .updating
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return ModelRollbackResult::AlreadyUpdating;
        }
        let result = self.rollback_locked(actor);
        self.updating.store(false, Ordering::Release);
        result
    }

    fn rollback_locked(&self, actor: &str) -> ModelRollbackResult {
        let now = self.clock.now_ms();
        let previous = match self.store.get(PREVIOUS_KEY) {
            Ok(Some(record)) => match serde_json::from_str::<PreviousModelRecord>(&record.value)
            {
                Ok(previous) => previous,
                Err(err) => {
                    return ModelRollbackResult::Error(format!(
                        "corrupt previous record: {err}"
                    ))
                }
            },
            Ok(None) => return ModelRollbackResult::NoPreviousModel,
            Err(err) => return ModelRollbackResult::Error(err.to_string()),
        };
        if !self.previous_dir().exists() {
            return ModelRollbackResult::PreviousModelNotFound;
        }
        let files = match read_bundle(&self.previous_dir()) {
            Ok(files) => files,
            Err(err) => return ModelRollbackResult::Error(err),
        };
        let validation = validate_model(&files);
        if !validation.is_valid {
            return ModelRollbackResult::InvalidPreviousModel(validation.errors);
        }

        // Swap the slots: current moves aside, previous becomes current.
        let scratch = self.root.join("rollback_scratch");
        let had_current = self.current_dir().exists();
        if had_current {
            if let Err(err) = fs::rename(self.current_dir(), &scratch) {
                return ModelRollbackResult::Error(format!("could not move current: {err}"));
            }
        }
        if let Err(err) = fs::rename(self.previous_dir(), self.current_dir()) {
            if had_current {
                let _ = fs::rename(&scratch, self.current_dir());
            }
            return ModelRollbackResult::Error(format!("could not restore previous: {err}"));
        }
        if had_current {
            let _ = fs::rename(&scratch, self.previous_dir());
        }

        let descriptor = ModelDescriptor {
            name: previous.name,
            version: previous.version,
        };
        let payload = match serde_json::to_string(&descriptor) {
            Ok(payload) => payload,
            Err(err) => {
                return ModelRollbackResult::Error(format!("descriptor serialization: {err}"))
            }
        };
        if let Err(err) = self.store.put(CURRENT_KEY, payload, actor, now) {
            return ModelRollbackResult::Error(err.to_string());
        }
        // The previous slot is consumed even though the rolled-back-from
        // files remain on disk until the next swap or purge.
        if let Err(err) = self.store.delete(PREVIOUS_KEY) {
            return ModelRollbackResult::Error(err.to_string());
        }
        self.audit.record(
            event(COMPONENT, "rollback", "ok", now)
                .with_actor(actor)
                .with_detail(&format!("{} {}", descriptor.name, descriptor.version)),
        );
        ModelRollbackResult::Success(descriptor)
    }

    /// Garbage-collect the previous model once its retention window has
    /// passed. Returns whether anything was purged.
    pub fn purge_expired_previous(&self, actor: &str) -> Result<bool, StoreError> {
        let now = self.clock.now_ms();
        let Some(previous) = self.previous_model() else {
            return Ok(false);
        };
        if now < previous.retention_deadline_ms {
            return Ok(false);
        }
        if self.previous_dir().exists() {
            fs::remove_dir_all(self.previous_dir()).map_err(|err| StoreError::WriteFailure {
                detail: format!("purge previous: {err}"),
            })?;
        }
        self.store.delete(PREVIOUS_KEY)?;
        self.audit.record(
            event(COMPONENT, "purge_previous", "ok", now)
                .with_actor(actor)
                .with_detail(&format!("{} {}", previous.name, previous.version)),
        );
        Ok(true)
    }
}

/// Read a bundle directory back into a name -> bytes map.
fn read_bundle(dir: &Path) -> Result<BTreeMap<String, Vec<u8>>, String> {
    let mut files = BTreeMap::new();
    let entries = fs::read_dir(dir).map_err(|err| format!("read bundle dir: {err}"))?;
    for entry in entries {
        let entry = entry.map_err(|err| format!("read bundle entry: {err}"))?;
        if !entry.path().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let mut bytes = Vec::new();
        fs::File::open(entry.path())
            .and_then(|mut f| f.read_to_end(&mut bytes))
            .map_err(|err| format!("read `{name}`: {err}"))?;
        files.insert(name, bytes);
    }
    Ok(files)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
