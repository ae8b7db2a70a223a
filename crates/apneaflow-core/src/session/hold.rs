//! Hold-to-confirm gestures.
//!
//! A sustained press becomes a progress percentage and, once the required
//! duration has elapsed, a single completion signal. Only one hold is active
//! per timer; beginning a new one cancels the previous.
//!
//! The timer is polled by its owner rather than firing callbacks, so
//! completion is handled on the same logical thread that owns session state.

use serde::{Deserialize, Serialize};

/// What a completed hold does in the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldTarget {
    /// End the apnea early and start recovery.
    EndApnea,
    /// Abort the session mid-way.
    Stop,
    /// Dismiss the completed session.
    FinalClose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HoldHandle(u64);

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HoldSignal<T> {
    Progress { target: T, percent: f64 },
    Completed { target: T },
}

#[derive(Debug, Clone)]
struct ActiveHold<T> {
    handle: HoldHandle,
    target: T,
    started_at_ms: u64,
    required_ms: u64,
    last_report_ms: u64,
    progress_percent: f64,
}

#[derive(Debug, Clone)]
pub struct HoldGestureTimer<T> {
    active: Option<ActiveHold<T>>,
    next_handle: u64,
    poll_interval_ms: u64,
}

impl<T: Copy> HoldGestureTimer<T> {
    pub fn new(poll_interval_ms: u64) -> Self {
        Self {
            active: None,
            next_handle: 1,
            poll_interval_ms: poll_interval_ms.max(1),
        }
    }

    /// Start a hold, cancelling any hold already in progress.
    pub fn begin(&mut self, target: T, required_ms: u64, now_ms: u64) -> HoldHandle {
        let handle = HoldHandle(self.next_handle);
        self.next_handle += 1;
        self.active = Some(ActiveHold {
            handle,
            target,
            started_at_ms: now_ms,
            required_ms,
            last_report_ms: now_ms,
            progress_percent: 0.0,
        });
        handle
    }

    /// Cancel `handle` if it is still the active hold.
    pub fn cancel(&mut self, handle: HoldHandle) -> Option<T> {
        match &self.active {
            Some(active) if active.handle == handle => self.active.take().map(|a| a.target),
            _ => None,
        }
    }

    /// Cancel whatever hold is active.
    pub fn cancel_active(&mut self) -> Option<T> {
        self.active.take().map(|a| a.target)
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn active_target(&self) -> Option<T> {
        self.active.as_ref().map(|a| a.target)
    }

    pub fn progress_percent(&self) -> f64 {
        self.active.as_ref().map(|a| a.progress_percent).unwrap_or(0.0)
    }

    /// Advance the active hold to `now_ms`.
    ///
    /// Returns `Completed` exactly once when the required duration has
    /// elapsed (the hold is then gone), otherwise `Progress` at most once per
    /// poll interval.
    pub fn poll(&mut self, now_ms: u64) -> Option<HoldSignal<T>> {
        let active = self.active.as_mut()?;
        let elapsed = now_ms.saturating_sub(active.started_at_ms);
        if elapsed >= active.required_ms {
            let target = active.target;
            self.active = None;
            return Some(HoldSignal::Completed { target });
        }
        if now_ms.saturating_sub(active.last_report_ms) < self.poll_interval_ms {
            return None;
        }
        active.last_report_ms = now_ms;
        active.progress_percent = (elapsed as f64 / active.required_ms as f64 * 100.0).min(100.0);
        Some(HoldSignal::Progress {
            target: active.target,
            percent: active.progress_percent,
        })
    }
}
