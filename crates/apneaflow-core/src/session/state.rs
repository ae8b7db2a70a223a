use serde::{Deserialize, Serialize};

/// Top-level stage of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Idle,
    Breathing,
    Apnea,
    Recovery,
    Complete,
}

impl Phase {
    /// Breathing, apnea or recovery.
    pub fn is_running(&self) -> bool {
        matches!(self, Phase::Breathing | Phase::Apnea | Phase::Recovery)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Phase::Idle => "Ready",
            Phase::Breathing => "Guided breathing",
            Phase::Apnea => "Apnea",
            Phase::Recovery => "Recovery",
            Phase::Complete => "Session complete",
        }
    }
}

/// Sub-stage of breathing. Only meaningful while `phase == Breathing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Subphase {
    Inhale,
    Exhale,
}

/// Everything a presentation layer reads about the running session.
///
/// Owned and mutated only by the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub phase: Phase,
    pub subphase: Subphase,
    /// 1-based.
    pub cycle_index: u32,
    pub breaths_done: u32,
    /// 1-based number of the breath in progress.
    pub current_breath_number: u32,
    /// Countdown for timed phases, count-up for apnea.
    pub time_left_ms: u64,
    pub is_paused: bool,
    pub is_awaiting_final_close: bool,
    /// The primary apnea track did not resolve for this session.
    pub audio_degraded: bool,
}

impl SessionState {
    pub fn idle() -> Self {
        Self {
            phase: Phase::Idle,
            subphase: Subphase::Inhale,
            cycle_index: 1,
            breaths_done: 0,
            current_breath_number: 1,
            time_left_ms: 0,
            is_paused: false,
            is_awaiting_final_close: false,
            audio_degraded: false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.phase.is_running()
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::idle()
    }
}
