//! Fallback-mode resolution: the single degraded-experience decision.
//!
//! UI and pipeline code call `check_fallback_mode()` before starting any
//! sensitive work. The resolver walks a priority-ordered guard chain over
//! the flag and kill-switch registries; the first matching step is
//! authoritative and no further checks run:
//!
//! 1. any storage read fails          -> `Error`
//! 2. ambient scribe flag disabled    -> `FeatureDisabled`
//! 3. emergency kill active           -> `Emergency`
//! 4. app killed                      -> `AppDisabled`
//! 5. audio killed                    -> `AudioDisabled`
//! 6. LLM killed                      -> `LlmDisabled`
//! 7. otherwise                       -> `None`
//!
//! Message, action, and capability accessors are pure functions of the
//! last resolved mode; callers must resolve before querying them.

use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::audit::{event, AuditLog};
use crate::clock::Clock;
use crate::feature_flags::{FeatureFlagRegistry, FLAG_AMBIENT_SCRIBE};
use crate::kill_switch::{Capability, KillSwitchRegistry};

const COMPONENT: &str = "fallback";

/// The degraded operating mode, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackMode {
    /// No restriction; sensitive work may run.
    None,
    /// The ambient scribe feature is disabled by flag.
    FeatureDisabled,
    /// Master emergency kill is active.
    Emergency,
    /// The whole app capability is killed.
    AppDisabled,
    /// Audio capture is killed.
    AudioDisabled,
    /// LLM processing is killed.
    LlmDisabled,
    /// Restriction state could not be determined.
    Error,
}

impl fmt::Display for FallbackMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            Self::FeatureDisabled => f.write_str("feature_disabled"),
            Self::Emergency => f.write_str("emergency"),
            Self::AppDisabled => f.write_str("app_disabled"),
            Self::AudioDisabled => f.write_str("audio_disabled"),
            Self::LlmDisabled => f.write_str("llm_disabled"),
            Self::Error => f.write_str("error"),
        }
    }
}

/// User-visible action offered in a degraded mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackAction {
    /// Nothing is offered; the capability is simply unavailable.
    None,
    /// Offer manual note entry instead of audio capture.
    ManualEntry,
    /// Offer template-based generation instead of LLM output.
    BasicGeneration,
}

/// Process-wide observable state left by the last resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedFallback {
    pub mode: FallbackMode,
    pub is_in_fallback_mode: bool,
    pub reason: String,
}

impl Default for ResolvedFallback {
    fn default() -> Self {
        Self {
            mode: FallbackMode::None,
            is_in_fallback_mode: false,
            reason: String::new(),
        }
    }
}

/// Resolver over the flag and kill-switch registries. Safe for concurrent
/// use; the observable state is the outcome of the most recent resolution.
pub struct FallbackResolver {
    flags: Arc<FeatureFlagRegistry>,
    kills: Arc<KillSwitchRegistry>,
    clock: Arc<dyn Clock>,
    audit: Arc<AuditLog>,
    resolved: Mutex<ResolvedFallback>,
}

impl FallbackResolver {
    pub fn new(
        flags: Arc<FeatureFlagRegistry>,
        kills: Arc<KillSwitchRegistry>,
        clock: Arc<dyn Clock>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            flags,
            kills,
            clock,
            audit,
            resolved: Mutex::new(ResolvedFallback::default()),
        }
    }

    /// Resolve the current fallback mode and update observable state.
    pub fn check_fallback_mode(&self) -> FallbackMode {
        let mode = self.resolve();
        let reason = Self::reason_for(mode).to_string();
        let state = ResolvedFallback {
            mode,
            is_in_fallback_mode: mode != FallbackMode::None,
            reason: reason.clone(),
        };
        if let Ok(mut resolved) = self.resolved.lock() {
            *resolved = state;
        }
        if mode != FallbackMode::None {
            self.audit.record(
                event(COMPONENT, "check_fallback_mode", "fallback", self.clock.now_ms())
                    .with_detail(&format!("{mode}: {reason}")),
            );
        }
        mode
    }

    fn resolve(&self) -> FallbackMode {
        // Step 1 folds into each read: the first failing read resolves the
        // chain to Error.
        let enabled = match self.flags.is_enabled_checked(FLAG_AMBIENT_SCRIBE) {
            Ok(enabled) => enabled,
            Err(_) => return FallbackMode::Error,
        };
        if !enabled {
            return FallbackMode::FeatureDisabled;
        }
        let emergency = match self.kills.is_emergency_killed_checked() {
            Ok(value) => value,
            Err(_) => return FallbackMode::Error,
        };
        if emergency {
            return FallbackMode::Emergency;
        }
        for (capability, mode) in [
            (Capability::App, FallbackMode::AppDisabled),
            (Capability::Audio, FallbackMode::AudioDisabled),
            (Capability::Llm, FallbackMode::LlmDisabled),
        ] {
            match self.kills.is_killed_checked(capability) {
                Ok(true) => return mode,
                Ok(false) => {}
                Err(_) => return FallbackMode::Error,
            }
        }
        FallbackMode::None
    }

    /// The mode resolved by the most recent `check_fallback_mode` call.
    pub fn resolved(&self) -> ResolvedFallback {
        self.resolved.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Whether the last resolution left the system in a fallback mode.
    pub fn is_in_fallback_mode(&self) -> bool {
        self.resolved().is_in_fallback_mode
    }

    /// Human-readable reason for the last resolved mode.
    pub fn fallback_reason(&self) -> String {
        self.resolved().reason
    }

    /// User-visible message for the last resolved mode.
    pub fn fallback_message(&self) -> &'static str {
        match self.resolved_mode() {
            FallbackMode::None => "",
            FallbackMode::FeatureDisabled => {
                "Ambient scribe is turned off. You can still write notes manually."
            }
            FallbackMode::Emergency => {
                "The scribe service is temporarily suspended. Please try again later."
            }
            FallbackMode::AppDisabled => {
                "The scribe app is currently unavailable. Please try again later."
            }
            FallbackMode::AudioDisabled => {
                "Audio recording is unavailable. You can enter notes manually."
            }
            FallbackMode::LlmDisabled => {
                "Smart summaries are unavailable. A basic note will be generated instead."
            }
            FallbackMode::Error => {
                "The scribe service could not be reached. Please try again later."
            }
        }
    }

    /// User-visible action for the last resolved mode.
    pub fn fallback_action(&self) -> FallbackAction {
        match self.resolved_mode() {
            FallbackMode::None | FallbackMode::Emergency | FallbackMode::AppDisabled
            | FallbackMode::Error => FallbackAction::None,
            FallbackMode::FeatureDisabled | FallbackMode::AudioDisabled => {
                FallbackAction::ManualEntry
            }
            FallbackMode::LlmDisabled => FallbackAction::BasicGeneration,
        }
    }

    /// Whether manual note entry is offered in the last resolved mode.
    pub fn is_manual_note_entry_available(&self) -> bool {
        self.fallback_action() == FallbackAction::ManualEntry
    }

    /// Whether template-based generation is offered in the last resolved
    /// mode.
    pub fn is_basic_generation_available(&self) -> bool {
        self.fallback_action() == FallbackAction::BasicGeneration
    }

    /// Whether limited functionality remains available; true only when the
    /// feature itself is disabled (as opposed to killed).
    pub fn is_limited_functionality_available(&self) -> bool {
        self.resolved_mode() == FallbackMode::FeatureDisabled
    }

    fn resolved_mode(&self) -> FallbackMode {
        self.resolved().mode
    }

    fn reason_for(mode: FallbackMode) -> &'static str {
        match mode {
            FallbackMode::None => "",
            FallbackMode::FeatureDisabled => "ambient scribe feature flag is disabled",
            FallbackMode::Emergency => "emergency kill switch is active",
            FallbackMode::AppDisabled => "app kill switch is active",
            FallbackMode::AudioDisabled => "audio kill switch is active",
            FallbackMode::LlmDisabled => "llm kill switch is active",
            FallbackMode::Error => "restriction state could not be read",
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
