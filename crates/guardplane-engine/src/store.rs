//! Persistent state boundary for the guardrail control plane.
//!
//! Every manager persists through `ConfigStore`: a synchronous key/value
//! contract with per-key atomic read-modify-write and immediate
//! read-after-write visibility. The interface is intentionally
//! backend-agnostic:
//! - one logical record per key (value + actor + timestamp + revision)
//! - readers always observe a fully-written record, never a partial one
//! - state survives process restart; a fresh store means every manager
//!   falls back to its documented safe default
//!
//! `MemoryStore` is the reference backend. It carries injectable fault
//! modes so the fail-safe paths of every manager can be exercised without
//! a real broken disk.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A stored value with its write metadata.
///
/// The record is the unit of atomicity: a write replaces the whole record
/// in one step, so concurrent readers see either the old or the new record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreRecord {
    pub key: String,
    pub value: String,
    pub updated_at_ms: i64,
    pub updated_by: String,
    pub revision: u64,
}

/// Stable error taxonomy for store operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("invalid key `{key}`")]
    InvalidKey { key: String },
    #[error("read failure: {detail}")]
    ReadFailure { detail: String },
    #[error("write failure: {detail}")]
    WriteFailure { detail: String },
    #[error("backend unavailable: {detail}")]
    BackendUnavailable { detail: String },
}

impl StoreError {
    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidKey { .. } => "GP-STOR-0001",
            Self::ReadFailure { .. } => "GP-STOR-0002",
            Self::WriteFailure { .. } => "GP-STOR-0003",
            Self::BackendUnavailable { .. } => "GP-STOR-0004",
        }
    }
}

/// Synchronous key/value store contract consumed by every manager.
///
/// Implementations must be safe to call from multiple threads; each call
/// is atomic with respect to the addressed key.
pub trait ConfigStore: Send + Sync {
    /// Read the record at `key`, or `None` if absent.
    fn get(&self, key: &str) -> Result<Option<StoreRecord>, StoreError>;

    /// Atomically replace the record at `key`.
    fn put(
        &self,
        key: &str,
        value: String,
        actor: &str,
        now_ms: i64,
    ) -> Result<StoreRecord, StoreError>;

    /// Remove the record at `key`; returns whether it existed.
    fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Keys currently present under `prefix`, in sorted order.
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

/// Fault injection mode for `MemoryStore`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FaultMode {
    /// All operations succeed.
    #[default]
    None,
    /// Reads fail with `ReadFailure`; writes succeed.
    FailReads,
    /// Writes fail with `WriteFailure`; reads succeed.
    FailWrites,
    /// Every operation fails with `BackendUnavailable`.
    FailAll,
}

impl fmt::Display for FaultMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            Self::FailReads => f.write_str("fail_reads"),
            Self::FailWrites => f.write_str("fail_writes"),
            Self::FailAll => f.write_str("fail_all"),
        }
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    records: BTreeMap<String, StoreRecord>,
    next_revision: u64,
    fault_mode: FaultMode,
}

/// In-memory `ConfigStore` backend.
///
/// The whole map sits behind one mutex; per-key atomicity follows from
/// per-call exclusivity. Fault modes let tests drive every manager through
/// its storage-failure branch.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Switch the fault injection mode.
    pub fn set_fault_mode(&self, mode: FaultMode) {
        if let Ok(mut state) = self.state.lock() {
            state.fault_mode = mode;
        }
    }

    /// Number of records currently stored.
    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_read(mode: FaultMode) -> Result<(), StoreError> {
        match mode {
            FaultMode::FailReads => Err(StoreError::ReadFailure {
                detail: "injected read fault".to_string(),
            }),
            FaultMode::FailAll => Err(StoreError::BackendUnavailable {
                detail: "injected backend fault".to_string(),
            }),
            _ => Ok(()),
        }
    }

    fn check_write(mode: FaultMode) -> Result<(), StoreError> {
        match mode {
            FaultMode::FailWrites => Err(StoreError::WriteFailure {
                detail: "injected write fault".to_string(),
            }),
            FaultMode::FailAll => Err(StoreError::BackendUnavailable {
                detail: "injected backend fault".to_string(),
            }),
            _ => Ok(()),
        }
    }
}

fn validate_key(key: &str) -> Result<(), StoreError> {
    if key.trim().is_empty() {
        return Err(StoreError::InvalidKey {
            key: key.to_string(),
        });
    }
    Ok(())
}

impl ConfigStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<StoreRecord>, StoreError> {
        validate_key(key)?;
        let state = self.state.lock().map_err(|_| StoreError::BackendUnavailable {
            detail: "store mutex poisoned".to_string(),
        })?;
        Self::check_read(state.fault_mode)?;
        Ok(state.records.get(key).cloned())
    }

    fn put(
        &self,
        key: &str,
        value: String,
        actor: &str,
        now_ms: i64,
    ) -> Result<StoreRecord, StoreError> {
        validate_key(key)?;
        let mut state = self.state.lock().map_err(|_| StoreError::BackendUnavailable {
            detail: "store mutex poisoned".to_string(),
        })?;
        Self::check_write(state.fault_mode)?;
        state.next_revision = state.next_revision.saturating_add(1);
        let record = StoreRecord {
            key: key.to_string(),
            value,
            updated_at_ms: now_ms,
            updated_by: actor.to_string(),
            revision: state.next_revision,
        };
        state.records.insert(key.to_string(), record.clone());
        Ok(record)
    }

    fn delete(&self, key: &str) -> Result<bool, StoreError> {
        validate_key(key)?;
        let mut state = self.state.lock().map_err(|_| StoreError::BackendUnavailable {
            detail: "store mutex poisoned".to_string(),
        })?;
        Self::check_write(state.fault_mode)?;
        Ok(state.records.remove(key).is_some())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let state = self.state.lock().map_err(|_| StoreError::BackendUnavailable {
            detail: "store mutex poisoned".to_string(),
        })?;
        Self::check_read(state.fault_mode)?;
        Ok(state
            .records
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
