use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Most rounds the remote side keeps per session.
pub const MAX_REPORTED_ROUNDS: usize = 10;
const MAX_ROUNDS: u32 = 50;
const MAX_BREATHS_PER_CYCLE: u32 = 200;
const MAX_APNEA_SECS: u32 = 36_000;

/// Result of one finished session, produced by the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub completed_rounds: u32,
    pub planned_rounds: u32,
    pub breaths_per_cycle: u32,
    pub apnea_by_round: Vec<u32>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl SessionSummary {
    pub fn total_breaths(&self) -> u64 {
        self.breaths_per_cycle as u64 * self.planned_rounds as u64
    }

    pub fn last_apnea_secs(&self) -> u32 {
        self.apnea_by_round.last().copied().unwrap_or(0)
    }

    pub fn best_apnea_secs(&self) -> u32 {
        self.apnea_by_round.iter().copied().max().unwrap_or(0)
    }
}

/// Who a session belongs to on the remote side.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentIdentity {
    pub student_id: String,
    pub possession_token: String,
}

impl StudentIdentity {
    pub fn new(student_id: impl Into<String>, possession_token: impl Into<String>) -> Self {
        Self {
            student_id: student_id.into(),
            possession_token: possession_token.into(),
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.student_id.trim().is_empty() && !self.possession_token.trim().is_empty()
    }
}

/// Wire form of a finished session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsPayload {
    pub student_id: String,
    pub possession_token: String,
    pub completed_rounds: u32,
    pub planned_rounds: u32,
    pub breaths_per_cycle: u32,
    pub apnea_by_round: Vec<u32>,
    pub completed_at: DateTime<Utc>,
}

impl MetricsPayload {
    pub fn new(identity: &StudentIdentity, summary: &SessionSummary) -> Self {
        Self {
            student_id: identity.student_id.clone(),
            possession_token: identity.possession_token.clone(),
            completed_rounds: summary.completed_rounds,
            planned_rounds: summary.planned_rounds,
            breaths_per_cycle: summary.breaths_per_cycle,
            apnea_by_round: summary.apnea_by_round.clone(),
            completed_at: summary.completed_at,
        }
    }

    /// Clamp every field into the ranges the remote side accepts.
    pub fn normalized(mut self) -> Self {
        self.completed_rounds = self.completed_rounds.min(MAX_ROUNDS);
        self.planned_rounds = self.planned_rounds.min(MAX_ROUNDS);
        self.breaths_per_cycle = self.breaths_per_cycle.min(MAX_BREATHS_PER_CYCLE);
        self.apnea_by_round.truncate(MAX_REPORTED_ROUNDS);
        for secs in &mut self.apnea_by_round {
            *secs = (*secs).min(MAX_APNEA_SECS);
        }
        self
    }
}
