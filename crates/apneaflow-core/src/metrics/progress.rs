//! Per-student local progress: totals, day streak and recent apnea history.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::summary::SessionSummary;
use crate::error::Result;

/// Entries kept in [`ProgressStats::apnea_history`].
pub const APNEA_HISTORY_LEN: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApneaHistoryEntry {
    pub date: NaiveDate,
    pub seconds: u32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastSummary {
    pub date: NaiveDate,
    pub cycles: u32,
    pub breaths: u64,
    pub apnea_seconds: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProgressStats {
    pub total_sessions: u64,
    pub total_breaths: u64,
    pub streak: u32,
    pub last_session_date: Option<NaiveDate>,
    pub last_apnea_seconds: u32,
    pub apnea_history: Vec<ApneaHistoryEntry>,
    pub last_summary: Option<LastSummary>,
}

/// Fold a finished session into `prev`.
///
/// Streak: same day keeps it, the day after the last session extends it,
/// anything else restarts it at 1.
pub fn record_session(prev: &ProgressStats, summary: &SessionSummary, today: NaiveDate) -> ProgressStats {
    let streak = match prev.last_session_date {
        Some(last) if last == today => prev.streak,
        Some(last) if last.succ_opt() == Some(today) => prev.streak.saturating_add(1),
        _ => 1,
    };
    let breaths = summary.total_breaths();
    let apnea_seconds = summary.last_apnea_secs();

    let mut apnea_history = prev.apnea_history.clone();
    apnea_history.push(ApneaHistoryEntry {
        date: today,
        seconds: apnea_seconds,
        timestamp: summary.completed_at,
    });
    if apnea_history.len() > APNEA_HISTORY_LEN {
        apnea_history.drain(..apnea_history.len() - APNEA_HISTORY_LEN);
    }

    ProgressStats {
        total_sessions: prev.total_sessions + 1,
        total_breaths: prev.total_breaths + breaths,
        streak,
        last_session_date: Some(today),
        last_apnea_seconds: apnea_seconds,
        apnea_history,
        last_summary: Some(LastSummary {
            date: today,
            cycles: summary.planned_rounds,
            breaths,
            apnea_seconds,
        }),
    }
}

/// Where progress lives, keyed by student.
pub trait ProgressStore: Send {
    /// Missing keys yield default (empty) stats.
    fn load(&self, key: &str) -> Result<ProgressStats>;
    fn save(&mut self, key: &str, stats: &ProgressStats) -> Result<()>;
}

#[derive(Debug, Default, Clone)]
pub struct MemoryProgressStore {
    entries: HashMap<String, ProgressStats>,
}

impl MemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressStore for MemoryProgressStore {
    fn load(&self, key: &str) -> Result<ProgressStats> {
        Ok(self.entries.get(key).cloned().unwrap_or_default())
    }

    fn save(&mut self, key: &str, stats: &ProgressStats) -> Result<()> {
        self.entries.insert(key.to_string(), stats.clone());
        Ok(())
    }
}
