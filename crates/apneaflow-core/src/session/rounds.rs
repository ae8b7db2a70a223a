use serde::{Deserialize, Serialize};

/// Measured apnea seconds per cycle, indexed by `cycle_index - 1`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundRecords {
    seconds: Vec<u32>,
    capacity: usize,
}

impl RoundRecords {
    pub fn with_capacity(cycles: u32) -> Self {
        Self {
            seconds: Vec::with_capacity(cycles as usize),
            capacity: cycles as usize,
        }
    }

    /// Store the apnea length of `cycle_index` (1-based). Cycles beyond the
    /// capacity are ignored; skipped cycles read as zero.
    pub fn record(&mut self, cycle_index: u32, seconds: u32) -> bool {
        let Some(slot) = (cycle_index as usize).checked_sub(1) else {
            return false;
        };
        if slot >= self.capacity {
            return false;
        }
        if slot >= self.seconds.len() {
            self.seconds.resize(slot + 1, 0);
        }
        self.seconds[slot] = seconds;
        true
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.seconds
    }

    pub fn len(&self) -> usize {
        self.seconds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seconds.is_empty()
    }

    pub fn last(&self) -> Option<u32> {
        self.seconds.last().copied()
    }

    pub fn clear(&mut self) {
        self.seconds.clear();
    }
}

/// Whole seconds between two instants, rounded, never negative.
pub fn apnea_seconds(started_at_ms: u64, ended_at_ms: u64) -> u32 {
    let elapsed = ended_at_ms.saturating_sub(started_at_ms);
    ((elapsed + 500) / 1000).min(u32::MAX as u64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_in_cycle_order() {
        let mut rounds = RoundRecords::with_capacity(3);
        assert!(rounds.record(1, 9));
        assert!(rounds.record(2, 7));
        assert_eq!(rounds.as_slice(), &[9, 7]);
        assert_eq!(rounds.last(), Some(7));
    }

    #[test]
    fn capped_at_cycle_count() {
        let mut rounds = RoundRecords::with_capacity(2);
        assert!(!rounds.record(3, 10));
        assert!(!rounds.record(0, 10));
        assert!(rounds.is_empty());
    }

    #[test]
    fn gaps_are_zero_filled_and_rerecord_overwrites() {
        let mut rounds = RoundRecords::with_capacity(3);
        rounds.record(3, 12);
        assert_eq!(rounds.as_slice(), &[0, 0, 12]);
        rounds.record(3, 14);
        assert_eq!(rounds.as_slice(), &[0, 0, 14]);
    }

    #[test]
    fn apnea_seconds_clamps_and_rounds() {
        assert_eq!(apnea_seconds(16_000, 25_000), 9);
        assert_eq!(apnea_seconds(0, 1_499), 1);
        assert_eq!(apnea_seconds(0, 1_500), 2);
        assert_eq!(apnea_seconds(5_000, 1_000), 0);
    }
}
