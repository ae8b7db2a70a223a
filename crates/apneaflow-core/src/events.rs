use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::metrics::SessionSummary;
use crate::session::{HoldTarget, Phase, Subphase};

/// Every state change in a session produces an Event.
/// Presentation layers render from these; nothing feeds back from them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    SessionStarted {
        session_id: String,
        cycles: u32,
        breaths_per_cycle: u32,
        audio_degraded: bool,
        at: DateTime<Utc>,
    },
    /// A breathing sub-step began.
    BreathStep {
        cycle_index: u32,
        breath_number: u32,
        subphase: Subphase,
        duration_ms: u64,
        at: DateTime<Utc>,
    },
    PreApneaCue {
        cycle_index: u32,
        breath_number: u32,
        at: DateTime<Utc>,
    },
    ApneaStarted {
        cycle_index: u32,
        at: DateTime<Utc>,
    },
    /// Apnea measured and recovery armed.
    ApneaEnded {
        cycle_index: u32,
        apnea_secs: u32,
        final_round: bool,
        recovery_ms: u64,
        at: DateTime<Utc>,
    },
    CycleAdvanced {
        cycle_index: u32,
        at: DateTime<Utc>,
    },
    SessionPaused {
        phase: Phase,
        time_left_ms: u64,
        at: DateTime<Utc>,
    },
    SessionResumed {
        phase: Phase,
        paused_ms: u64,
        at: DateTime<Utc>,
    },
    SessionCompleted {
        summary: SessionSummary,
        at: DateTime<Utc>,
    },
    SessionStopped {
        from_phase: Phase,
        at: DateTime<Utc>,
    },
    /// The completed session was dismissed; back to idle.
    SessionFinalized {
        at: DateTime<Utc>,
    },
    HoldStarted {
        target: HoldTarget,
        required_ms: u64,
        at: DateTime<Utc>,
    },
    HoldProgress {
        target: HoldTarget,
        percent: f64,
    },
    HoldCancelled {
        target: HoldTarget,
        at: DateTime<Utc>,
    },
    /// Timing was reconciled after the host came back to the foreground.
    TimingRecovered {
        phase: Phase,
        hidden_ms: u64,
        advanced: bool,
        at: DateTime<Utc>,
    },
    StateSnapshot {
        phase: Phase,
        phase_label: String,
        subphase: Subphase,
        cycle_index: u32,
        cycles: u32,
        breaths_done: u32,
        breaths_per_cycle: u32,
        current_breath_number: u32,
        time_left_ms: u64,
        is_paused: bool,
        is_awaiting_final_close: bool,
        audio_degraded: bool,
        hold_percent: f64,
        apnea_by_round: Vec<u32>,
        at: DateTime<Utc>,
    },
}
