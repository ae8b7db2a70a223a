//! Session phase controller.
//!
//! A deadline-driven state machine. It owns [`SessionState`] exclusively and
//! performs no I/O: every operation returns an [`Outcome`] listing the events
//! to publish, the audio commands to issue and the effects (reporting,
//! source refresh) for the caller to run. Commands in an outcome always
//! describe the state the controller is already in.
//!
//! ## Phases
//!
//! ```text
//! Idle -> Breathing(inhale <-> exhale) x N -> Apnea -> Recovery -> Breathing ...
//!      ... -> Apnea -> Recovery -> Complete -> Idle
//! ```
//!
//! Timed phases end at an absolute [`Deadline`]; apnea counts up from its
//! start until the user ends it. Pausing moves the deadline (or the apnea
//! start) forward by the paused time, so pauses never stretch nor shrink a
//! phase.
//!
//! ## Usage
//!
//! ```ignore
//! let mut ctl = SessionController::new(config, ControllerSettings::default(), SystemClock)?;
//! let out = ctl.start(sources);
//! // Every ~100ms:
//! let out = ctl.tick();
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::config::SessionConfig;
use super::hold::{HoldGestureTimer, HoldSignal, HoldTarget};
use super::rounds::{apnea_seconds, RoundRecords};
use super::state::{Phase, SessionState, Subphase};
use crate::audio::{AudioCommand, ResolvedSources, TrackId};
use crate::clock::{Clock, Deadline};
use crate::error::ValidationError;
use crate::events::Event;
use crate::metrics::SessionSummary;

/// Gesture and audio knobs that are not part of a session's timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerSettings {
    pub end_apnea_hold_ms: u64,
    pub stop_hold_ms: u64,
    pub final_close_hold_ms: u64,
    pub hold_poll_ms: u64,
    /// Leave ambient and secondary loops playing on the completion screen.
    pub keep_ambient_on_complete: bool,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            end_apnea_hold_ms: 1_500,
            stop_hold_ms: 1_000,
            final_close_hold_ms: 1_500,
            hold_poll_ms: 30,
            keep_ambient_on_complete: true,
        }
    }
}

impl ControllerSettings {
    pub fn hold_ms(&self, target: HoldTarget) -> u64 {
        match target {
            HoldTarget::EndApnea => self.end_apnea_hold_ms,
            HoldTarget::Stop => self.stop_hold_ms,
            HoldTarget::FinalClose => self.final_close_hold_ms,
        }
    }
}

/// Work the caller performs on the controller's behalf.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Persist and report a finished session.
    Completed(SessionSummary),
    /// Re-resolve `track`, then call
    /// [`SessionController::on_source_resolved`] or
    /// [`SessionController::on_source_failed`] with the same `cycle_index`.
    RefreshSource { track: TrackId, cycle_index: u32 },
}

/// Everything one controller operation produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Outcome {
    pub events: Vec<Event>,
    pub audio: Vec<AudioCommand>,
    pub effects: Vec<Effect>,
}

impl Outcome {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.audio.is_empty() && self.effects.is_empty()
    }

    pub fn merge(&mut self, other: Outcome) {
        self.events.extend(other.events);
        self.audio.extend(other.audio);
        self.effects.extend(other.effects);
    }

    fn emit(&mut self, event: Event) {
        self.events.push(event);
    }

    fn command(&mut self, command: AudioCommand) {
        self.audio.push(command);
    }
}

/// Proof that a start was requested. Only the latest ticket is honored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartTicket {
    nonce: u64,
}

impl StartTicket {
    pub fn nonce(&self) -> u64 {
        self.nonce
    }
}

pub struct SessionController<C: Clock> {
    config: SessionConfig,
    settings: ControllerSettings,
    clock: C,
    state: SessionState,
    deadline: Option<Deadline>,
    deadline_seq: u64,
    apnea_started_at_ms: Option<u64>,
    paused_at_ms: Option<u64>,
    hidden_at_ms: Option<u64>,
    rounds: RoundRecords,
    /// Cycle whose pre-apnea cue already fired.
    pre_apnea_fired_cycle: Option<u32>,
    transition_in_flight: bool,
    hold: HoldGestureTimer<HoldTarget>,
    start_nonce: u64,
    pending_start: Option<u64>,
    sources: ResolvedSources,
    session_id: String,
    started_at_ms: u64,
}

impl<C: Clock> SessionController<C> {
    /// # Errors
    /// Rejects a config that violates its invariants.
    pub fn new(
        config: SessionConfig,
        settings: ControllerSettings,
        clock: C,
    ) -> Result<Self, ValidationError> {
        config.validate()?;
        let hold = HoldGestureTimer::new(settings.hold_poll_ms);
        let rounds = RoundRecords::with_capacity(config.cycles);
        Ok(Self {
            config,
            settings,
            clock,
            state: SessionState::idle(),
            deadline: None,
            deadline_seq: 0,
            apnea_started_at_ms: None,
            paused_at_ms: None,
            hidden_at_ms: None,
            rounds,
            pre_apnea_fired_cycle: None,
            transition_in_flight: false,
            hold,
            start_nonce: 0,
            pending_start: None,
            sources: ResolvedSources::new(),
            session_id: String::new(),
            started_at_ms: 0,
        })
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn deadline(&self) -> Option<Deadline> {
        self.deadline
    }

    pub fn apnea_started_at_ms(&self) -> Option<u64> {
        self.apnea_started_at_ms
    }

    pub fn rounds(&self) -> &[u32] {
        self.rounds.as_slice()
    }

    pub fn is_start_pending(&self) -> bool {
        self.pending_start.is_some()
    }

    pub fn active_hold(&self) -> Option<HoldTarget> {
        self.hold.active_target()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Full state snapshot for rendering.
    pub fn snapshot(&self) -> Event {
        Event::StateSnapshot {
            phase: self.state.phase,
            phase_label: self.state.phase.label().to_string(),
            subphase: self.state.subphase,
            cycle_index: self.state.cycle_index,
            cycles: self.config.cycles,
            breaths_done: self.state.breaths_done,
            breaths_per_cycle: self.config.breaths_per_cycle,
            current_breath_number: self.state.current_breath_number,
            time_left_ms: self.state.time_left_ms,
            is_paused: self.state.is_paused,
            is_awaiting_final_close: self.state.is_awaiting_final_close,
            audio_degraded: self.state.audio_degraded,
            hold_percent: self.hold.progress_percent(),
            apnea_by_round: self.rounds.as_slice().to_vec(),
            at: self.at(self.clock.now_ms()),
        }
    }

    // ── Start ────────────────────────────────────────────────────────

    /// First half of an asynchronous start. Valid only from idle.
    ///
    /// Supersedes any earlier request: only the returned ticket will be
    /// accepted by [`begin_session`](Self::begin_session).
    pub fn request_start(&mut self) -> Option<StartTicket> {
        if self.state.phase != Phase::Idle {
            return None;
        }
        self.start_nonce += 1;
        self.pending_start = Some(self.start_nonce);
        Some(StartTicket {
            nonce: self.start_nonce,
        })
    }

    /// Second half of a start, once audio sources are resolved.
    /// A stale ticket is discarded silently.
    pub fn begin_session(&mut self, ticket: StartTicket, sources: ResolvedSources) -> Outcome {
        if self.pending_start != Some(ticket.nonce) {
            tracing::debug!(nonce = ticket.nonce, "discarding stale start");
            return Outcome::default();
        }
        self.pending_start = None;
        if self.state.phase != Phase::Idle {
            return Outcome::default();
        }

        let now = self.clock.now_ms();
        let mut out = Outcome::default();

        self.hold.cancel_active();
        self.sources = sources;
        self.rounds = RoundRecords::with_capacity(self.config.cycles);
        self.pre_apnea_fired_cycle = None;
        self.apnea_started_at_ms = None;
        self.paused_at_ms = None;
        self.hidden_at_ms = None;
        self.session_id = uuid::Uuid::new_v4().to_string();
        self.started_at_ms = now;

        self.state = SessionState {
            phase: Phase::Breathing,
            subphase: Subphase::Inhale,
            cycle_index: 1,
            breaths_done: 0,
            current_breath_number: 1,
            time_left_ms: 0,
            is_paused: false,
            is_awaiting_final_close: false,
            audio_degraded: !self.sources.contains(TrackId::ApneaCue),
        };
        let inhale_ms = self.config.inhale_ms();
        self.arm(now, inhale_ms);

        tracing::info!(
            session_id = %self.session_id,
            cycles = self.config.cycles,
            breaths_per_cycle = self.config.breaths_per_cycle,
            resolved_tracks = self.sources.len(),
            "session started"
        );

        out.emit(Event::SessionStarted {
            session_id: self.session_id.clone(),
            cycles: self.config.cycles,
            breaths_per_cycle: self.config.breaths_per_cycle,
            audio_degraded: self.state.audio_degraded,
            at: self.at(now),
        });
        out.emit(self.breath_step_event(now, inhale_ms));

        for track in TrackId::ALL {
            if let Some(url) = self.sources.get(track) {
                out.command(AudioCommand::Load {
                    track,
                    url: url.to_string(),
                });
            }
        }
        let volumes = self.config.volumes;
        for (track, volume) in [
            (TrackId::ApneaCue, volumes.apnea),
            (TrackId::Ambient, volumes.ambient),
            (TrackId::Secondary, volumes.secondary),
        ] {
            if self.sources.contains(track) {
                out.command(AudioCommand::SetVolume { track, volume });
            }
        }
        self.play_if_loaded(TrackId::BreathCue, &mut out);
        self.play_if_loaded(TrackId::Ambient, &mut out);
        self.play_if_loaded(TrackId::Secondary, &mut out);
        self.maybe_pre_apnea_cue(now, &mut out);
        out
    }

    /// Synchronous start with already-resolved sources.
    pub fn start(&mut self, sources: ResolvedSources) -> Outcome {
        match self.request_start() {
            Some(ticket) => self.begin_session(ticket, sources),
            None => Outcome::default(),
        }
    }

    // ── Timing ───────────────────────────────────────────────────────

    /// Periodic driver. Polls the active hold, refreshes the displayed
    /// time and advances the phase if its deadline has passed.
    pub fn tick(&mut self) -> Outcome {
        let now = self.clock.now_ms();
        let mut out = Outcome::default();
        self.poll_hold_at(now, &mut out);
        if self.state.is_running() && !self.state.is_paused {
            self.refresh_timing(now, &mut out);
        }
        out
    }

    /// Deadline-expiry handler for `deadline`.
    ///
    /// Advances the phase only if `deadline` is still the armed one and has
    /// passed; repeated calls for the same deadline advance at most once.
    pub fn expire(&mut self, deadline: Deadline) -> Outcome {
        let now = self.clock.now_ms();
        let mut out = Outcome::default();
        if self.state.is_running() && !self.state.is_paused {
            self.expire_at(deadline, now, &mut out);
        }
        out
    }

    /// The host is about to stop running us (tab hidden, app backgrounded).
    pub fn on_hidden(&mut self) {
        if self.state.is_running() && !self.state.is_paused {
            self.hidden_at_ms = Some(self.clock.now_ms());
        }
    }

    /// The host is back. Recompute timing from the stored anchors and
    /// advance at most one phase if a deadline passed meanwhile.
    pub fn on_visible(&mut self) -> Outcome {
        let now = self.clock.now_ms();
        let mut out = Outcome::default();
        let hidden_ms = self
            .hidden_at_ms
            .take()
            .map(|at| now.saturating_sub(at))
            .unwrap_or(0);
        if !self.state.is_running() || self.state.is_paused {
            return out;
        }
        let advanced = self.refresh_timing(now, &mut out);
        tracing::debug!(hidden_ms, advanced, phase = ?self.state.phase, "timing recovered");
        out.emit(Event::TimingRecovered {
            phase: self.state.phase,
            hidden_ms,
            advanced,
            at: self.at(now),
        });
        out
    }

    // ── User commands ────────────────────────────────────────────────

    /// End the apnea now, record it and start recovery.
    pub fn end_apnea(&mut self) -> Outcome {
        let now = self.clock.now_ms();
        let mut out = Outcome::default();
        if self.state.phase != Phase::Apnea || self.state.is_paused {
            return out;
        }
        if let Some(target) = self.hold.cancel_active() {
            out.emit(Event::HoldCancelled {
                target,
                at: self.at(now),
            });
        }
        self.guarded(|ctl| ctl.finish_apnea(now, &mut out));
        out
    }

    pub fn pause(&mut self) -> Outcome {
        let now = self.clock.now_ms();
        let mut out = Outcome::default();
        if !self.state.is_running() || self.state.is_paused {
            return out;
        }
        // Settle an overdue deadline before freezing the display.
        self.refresh_timing(now, &mut out);
        if !self.state.is_running() {
            return out;
        }
        if let Some(target) = self.hold.cancel_active() {
            out.emit(Event::HoldCancelled {
                target,
                at: self.at(now),
            });
        }
        self.paused_at_ms = Some(now);
        self.hidden_at_ms = None;
        self.state.is_paused = true;
        for track in self.active_loops() {
            out.command(AudioCommand::Stop { track });
        }
        out.emit(Event::SessionPaused {
            phase: self.state.phase,
            time_left_ms: self.state.time_left_ms,
            at: self.at(now),
        });
        out
    }

    pub fn resume(&mut self) -> Outcome {
        let now = self.clock.now_ms();
        let mut out = Outcome::default();
        if !self.state.is_running() || !self.state.is_paused {
            return out;
        }
        let paused_ms = self
            .paused_at_ms
            .take()
            .map(|at| now.saturating_sub(at))
            .unwrap_or(0);
        if self.state.phase == Phase::Apnea {
            self.apnea_started_at_ms = self
                .apnea_started_at_ms
                .map(|at| at.saturating_add(paused_ms));
        } else {
            self.deadline = self.deadline.map(|d| d.shift(paused_ms));
        }
        self.state.is_paused = false;
        for track in self.active_loops() {
            self.play_if_loaded(track, &mut out);
        }
        out.emit(Event::SessionResumed {
            phase: self.state.phase,
            paused_ms,
            at: self.at(now),
        });
        self.refresh_timing(now, &mut out);
        out
    }

    /// Abort everything and return to idle. Never fails, valid from any
    /// state, cancels a pending start and any hold.
    pub fn stop(&mut self) -> Outcome {
        let now = self.clock.now_ms();
        let mut out = Outcome::default();
        self.stop_into(now, &mut out);
        out
    }

    /// Start a hold gesture for `target` if the current phase allows it.
    pub fn begin_hold(&mut self, target: HoldTarget) -> Outcome {
        let now = self.clock.now_ms();
        let mut out = Outcome::default();
        let allowed = match target {
            HoldTarget::EndApnea => self.state.phase == Phase::Apnea && !self.state.is_paused,
            HoldTarget::Stop => self.state.is_running(),
            HoldTarget::FinalClose => self.state.is_awaiting_final_close,
        };
        if !allowed {
            return out;
        }
        if let Some(previous) = self.hold.cancel_active() {
            out.emit(Event::HoldCancelled {
                target: previous,
                at: self.at(now),
            });
        }
        let required_ms = self.settings.hold_ms(target);
        self.hold.begin(target, required_ms, now);
        out.emit(Event::HoldStarted {
            target,
            required_ms,
            at: self.at(now),
        });
        out
    }

    /// The press was released before completion.
    pub fn release_hold(&mut self) -> Outcome {
        let now = self.clock.now_ms();
        let mut out = Outcome::default();
        if let Some(target) = self.hold.cancel_active() {
            out.emit(Event::HoldCancelled {
                target,
                at: self.at(now),
            });
        }
        out
    }

    /// Poll only the hold gesture (for a faster UI cadence than the tick).
    pub fn poll_hold(&mut self) -> Outcome {
        let now = self.clock.now_ms();
        let mut out = Outcome::default();
        self.poll_hold_at(now, &mut out);
        out
    }

    /// Replace the ambient loop's source mid-session without touching timing.
    pub fn swap_ambient(&mut self, url: &str) -> Outcome {
        let mut out = Outcome::default();
        if self.state.phase == Phase::Idle {
            return out;
        }
        self.sources.insert(TrackId::Ambient, url);
        out.command(AudioCommand::CrossfadeTo {
            track: TrackId::Ambient,
            url: url.to_string(),
        });
        out
    }

    // ── Source refresh ───────────────────────────────────────────────

    /// A fresh source arrived for a [`Effect::RefreshSource`] request.
    pub fn on_source_resolved(&mut self, track: TrackId, cycle_index: u32, url: &str) -> Outcome {
        let mut out = Outcome::default();
        if self.state.phase == Phase::Idle {
            return out;
        }
        self.sources.insert(track, url);
        if track == TrackId::ApneaCue {
            self.state.audio_degraded = false;
        }
        if self.wants_apnea_track(track, cycle_index) {
            out.command(AudioCommand::Load {
                track,
                url: url.to_string(),
            });
            out.command(AudioCommand::SetVolume {
                track,
                volume: self.config.volumes.apnea,
            });
            out.command(AudioCommand::Play { track });
        }
        out
    }

    /// A [`Effect::RefreshSource`] request failed; fall back to whatever
    /// source the track already had.
    pub fn on_source_failed(&mut self, track: TrackId, cycle_index: u32) -> Outcome {
        let mut out = Outcome::default();
        if self.wants_apnea_track(track, cycle_index) {
            if self.sources.contains(track) {
                out.command(AudioCommand::Play { track });
            } else {
                self.state.audio_degraded = true;
            }
        }
        out
    }

    // ── Internal ─────────────────────────────────────────────────────

    fn wants_apnea_track(&self, track: TrackId, cycle_index: u32) -> bool {
        track == TrackId::ApneaCue
            && self.state.phase == Phase::Apnea
            && self.state.cycle_index == cycle_index
            && !self.state.is_paused
    }

    /// Run one transition with the in-flight flag held.
    fn guarded(&mut self, transition: impl FnOnce(&mut Self)) -> bool {
        if self.transition_in_flight {
            tracing::debug!(phase = ?self.state.phase, "transition already in flight");
            return false;
        }
        self.transition_in_flight = true;
        transition(self);
        self.transition_in_flight = false;
        true
    }

    /// Recompute the displayed time from the anchors; advance once if the
    /// armed deadline has passed. Returns whether a transition happened.
    fn refresh_timing(&mut self, now: u64, out: &mut Outcome) -> bool {
        match self.state.phase {
            Phase::Apnea => {
                let started = self.apnea_started_at_ms.unwrap_or(now);
                self.state.time_left_ms = now.saturating_sub(started);
                false
            }
            Phase::Breathing | Phase::Recovery => {
                let Some(deadline) = self.deadline else {
                    return false;
                };
                self.state.time_left_ms = deadline.remaining(now);
                if deadline.is_expired(now) {
                    self.expire_at(deadline, now, out)
                } else {
                    false
                }
            }
            Phase::Idle | Phase::Complete => false,
        }
    }

    fn expire_at(&mut self, deadline: Deadline, now: u64, out: &mut Outcome) -> bool {
        if self.deadline != Some(deadline) || !deadline.is_expired(now) {
            return false;
        }
        self.guarded(|ctl| match ctl.state.phase {
            Phase::Breathing => ctl.finish_breath_step(now, out),
            Phase::Recovery => ctl.finish_recovery(now, out),
            _ => {}
        })
    }

    /// Arm a fresh deadline. Marks the start of a new phase/subphase.
    fn arm(&mut self, now: u64, duration_ms: u64) {
        self.deadline_seq += 1;
        self.deadline = Some(Deadline::arm(now, duration_ms, self.deadline_seq));
        self.state.time_left_ms = duration_ms;
    }

    fn finish_breath_step(&mut self, now: u64, out: &mut Outcome) {
        match self.state.subphase {
            Subphase::Inhale => {
                self.state.subphase = Subphase::Exhale;
                let exhale_ms = self.config.exhale_ms();
                self.arm(now, exhale_ms);
                out.emit(self.breath_step_event(now, exhale_ms));
            }
            Subphase::Exhale => {
                self.state.breaths_done =
                    (self.state.breaths_done + 1).min(self.config.breaths_per_cycle);
                if self.state.breaths_done < self.config.breaths_per_cycle {
                    self.state.subphase = Subphase::Inhale;
                    self.state.current_breath_number = self.state.breaths_done + 1;
                    let inhale_ms = self.config.inhale_ms();
                    self.arm(now, inhale_ms);
                    out.emit(self.breath_step_event(now, inhale_ms));
                    self.maybe_pre_apnea_cue(now, out);
                } else {
                    self.enter_apnea(now, out);
                }
            }
        }
    }

    fn maybe_pre_apnea_cue(&mut self, now: u64, out: &mut Outcome) {
        let Some(cue_breath) = self.config.pre_apnea_breath() else {
            return;
        };
        if self.state.current_breath_number != cue_breath
            || self.pre_apnea_fired_cycle == Some(self.state.cycle_index)
        {
            return;
        }
        self.pre_apnea_fired_cycle = Some(self.state.cycle_index);
        self.play_if_loaded(TrackId::PreApneaCue, out);
        out.emit(Event::PreApneaCue {
            cycle_index: self.state.cycle_index,
            breath_number: cue_breath,
            at: self.at(now),
        });
    }

    fn enter_apnea(&mut self, now: u64, out: &mut Outcome) {
        self.state.phase = Phase::Apnea;
        self.state.time_left_ms = 0;
        self.deadline = None;
        self.apnea_started_at_ms = Some(now);
        tracing::debug!(cycle = self.state.cycle_index, "apnea started");
        out.command(AudioCommand::Stop {
            track: TrackId::BreathCue,
        });
        // The apnea track starts once its source is fresh; the phase does not wait.
        out.effects.push(Effect::RefreshSource {
            track: TrackId::ApneaCue,
            cycle_index: self.state.cycle_index,
        });
        out.emit(Event::ApneaStarted {
            cycle_index: self.state.cycle_index,
            at: self.at(now),
        });
    }

    fn finish_apnea(&mut self, now: u64, out: &mut Outcome) {
        let started = self.apnea_started_at_ms.take().unwrap_or(now);
        let secs = apnea_seconds(started, now);
        let cycle = self.state.cycle_index;
        self.rounds.record(cycle, secs);
        let final_round = cycle >= self.config.cycles;

        self.state.phase = Phase::Recovery;
        let recovery_ms = self.config.recovery_ms();
        self.arm(now, recovery_ms);
        tracing::info!(cycle, apnea_secs = secs, final_round, "apnea recorded");

        out.command(AudioCommand::Stop {
            track: TrackId::ApneaCue,
        });
        let cue = if final_round {
            TrackId::FinalCue
        } else {
            TrackId::ApneaEndCue
        };
        self.play_if_loaded(cue, out);
        out.emit(Event::ApneaEnded {
            cycle_index: cycle,
            apnea_secs: secs,
            final_round,
            recovery_ms,
            at: self.at(now),
        });
    }

    fn finish_recovery(&mut self, now: u64, out: &mut Outcome) {
        if self.state.cycle_index >= self.config.cycles {
            self.complete(now, out);
            return;
        }
        self.state.cycle_index += 1;
        self.state.breaths_done = 0;
        self.state.subphase = Subphase::Inhale;
        self.state.current_breath_number = 1;
        self.state.phase = Phase::Breathing;
        let inhale_ms = self.config.inhale_ms();
        self.arm(now, inhale_ms);

        self.play_if_loaded(TrackId::BreathCue, out);
        out.emit(Event::CycleAdvanced {
            cycle_index: self.state.cycle_index,
            at: self.at(now),
        });
        out.emit(self.breath_step_event(now, inhale_ms));
        self.maybe_pre_apnea_cue(now, out);
    }

    fn complete(&mut self, now: u64, out: &mut Outcome) {
        self.state.phase = Phase::Complete;
        self.state.is_awaiting_final_close = true;
        self.state.is_paused = false;
        self.state.time_left_ms = 0;
        self.deadline = None;

        for track in [TrackId::BreathCue, TrackId::ApneaCue] {
            out.command(AudioCommand::Stop { track });
        }
        if !self.settings.keep_ambient_on_complete {
            for track in [TrackId::Ambient, TrackId::Secondary] {
                out.command(AudioCommand::Stop { track });
            }
        }

        let summary = SessionSummary {
            session_id: self.session_id.clone(),
            completed_rounds: self.rounds.len() as u32,
            planned_rounds: self.config.cycles,
            breaths_per_cycle: self.config.breaths_per_cycle,
            apnea_by_round: self.rounds.as_slice().to_vec(),
            started_at: self.at(self.started_at_ms),
            completed_at: self.at(now),
        };
        tracing::info!(
            session_id = %summary.session_id,
            rounds = ?summary.apnea_by_round,
            "session completed"
        );
        out.effects.push(Effect::Completed(summary.clone()));
        out.emit(Event::SessionCompleted {
            summary,
            at: self.at(now),
        });
    }

    fn finalize(&mut self, now: u64, out: &mut Outcome) {
        if !self.state.is_awaiting_final_close {
            return;
        }
        self.state = SessionState::idle();
        self.deadline = None;
        self.apnea_started_at_ms = None;
        self.rounds.clear();
        self.pre_apnea_fired_cycle = None;
        self.session_id.clear();
        self.sources = ResolvedSources::new();
        for track in TrackId::ALL {
            out.command(AudioCommand::Stop { track });
        }
        out.emit(Event::SessionFinalized { at: self.at(now) });
    }

    fn stop_into(&mut self, now: u64, out: &mut Outcome) {
        let idle = self.state.phase == Phase::Idle;
        if idle && self.pending_start.is_none() && !self.hold.is_active() {
            return;
        }
        let from_phase = self.state.phase;
        self.pending_start = None;
        if let Some(target) = self.hold.cancel_active() {
            out.emit(Event::HoldCancelled {
                target,
                at: self.at(now),
            });
        }
        self.state = SessionState::idle();
        self.deadline = None;
        self.apnea_started_at_ms = None;
        self.paused_at_ms = None;
        self.hidden_at_ms = None;
        self.rounds.clear();
        self.pre_apnea_fired_cycle = None;
        self.transition_in_flight = false;
        self.sources = ResolvedSources::new();

        if !idle {
            for track in TrackId::ALL {
                out.command(AudioCommand::Stop { track });
            }
        }
        tracing::info!(from = ?from_phase, "session stopped");
        out.emit(Event::SessionStopped {
            from_phase,
            at: self.at(now),
        });
    }

    fn poll_hold_at(&mut self, now: u64, out: &mut Outcome) {
        match self.hold.poll(now) {
            Some(HoldSignal::Progress { target, percent }) => {
                out.emit(Event::HoldProgress { target, percent });
            }
            Some(HoldSignal::Completed { target }) => match target {
                HoldTarget::EndApnea => {
                    if self.state.phase == Phase::Apnea && !self.state.is_paused {
                        self.guarded(|ctl| ctl.finish_apnea(now, out));
                    }
                }
                HoldTarget::Stop => self.stop_into(now, out),
                HoldTarget::FinalClose => self.finalize(now, out),
            },
            None => {}
        }
    }

    /// Loops that should be sounding in the current phase.
    fn active_loops(&self) -> Vec<TrackId> {
        let mut tracks = vec![TrackId::Ambient, TrackId::Secondary];
        match self.state.phase {
            Phase::Breathing => tracks.push(TrackId::BreathCue),
            Phase::Apnea => tracks.push(TrackId::ApneaCue),
            _ => {}
        }
        tracks
    }

    fn play_if_loaded(&self, track: TrackId, out: &mut Outcome) {
        if self.sources.contains(track) {
            out.command(AudioCommand::Play { track });
        }
    }

    fn breath_step_event(&self, now: u64, duration_ms: u64) -> Event {
        Event::BreathStep {
            cycle_index: self.state.cycle_index,
            breath_number: self.state.current_breath_number,
            subphase: self.state.subphase,
            duration_ms,
            at: self.at(now),
        }
    }

    fn at(&self, ms: u64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(ms as i64).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn small_config() -> SessionConfig {
        SessionConfig {
            breaths_per_cycle: 4,
            inhale_seconds: 2.0,
            exhale_seconds: 2.0,
            recovery_seconds: 5.0,
            cycles: 2,
            ..SessionConfig::default()
        }
    }

    fn controller(config: SessionConfig) -> (SessionController<ManualClock>, ManualClock) {
        let clock = ManualClock::new(0);
        let ctl = SessionController::new(config, ControllerSettings::default(), clock.clone())
            .unwrap();
        (ctl, clock)
    }

    fn all_sources() -> ResolvedSources {
        let mut sources = ResolvedSources::new();
        for track in TrackId::ALL {
            sources.insert(track, format!("https://cdn/{track}.mp3"));
        }
        sources
    }

    /// Tick every 100ms until `until_ms`.
    fn run_until(ctl: &mut SessionController<ManualClock>, clock: &ManualClock, until_ms: u64) -> Outcome {
        let mut out = Outcome::default();
        while clock.now_ms() < until_ms {
            clock.advance(100);
            out.merge(ctl.tick());
        }
        out
    }

    #[test]
    fn rejects_invalid_config() {
        let config = SessionConfig {
            cycles: 0,
            ..SessionConfig::default()
        };
        assert!(SessionController::new(config, ControllerSettings::default(), ManualClock::new(0)).is_err());
    }

    #[test]
    fn start_enters_first_inhale() {
        let (mut ctl, _clock) = controller(small_config());
        let out = ctl.start(all_sources());
        let state = ctl.state();
        assert_eq!(state.phase, Phase::Breathing);
        assert_eq!(state.subphase, Subphase::Inhale);
        assert_eq!(state.breaths_done, 0);
        assert_eq!(state.cycle_index, 1);
        assert_eq!(state.time_left_ms, 2_000);
        assert!(out.audio.contains(&AudioCommand::Play { track: TrackId::BreathCue }));
        assert!(out.audio.contains(&AudioCommand::Play { track: TrackId::Ambient }));
        assert!(matches!(out.events[0], Event::SessionStarted { .. }));
    }

    #[test]
    fn start_is_ignored_unless_idle() {
        let (mut ctl, _clock) = controller(small_config());
        ctl.start(all_sources());
        assert!(ctl.request_start().is_none());
        assert!(ctl.start(all_sources()).is_empty());
    }

    #[test]
    fn stale_start_ticket_is_discarded() {
        let (mut ctl, _clock) = controller(small_config());
        let first = ctl.request_start().unwrap();
        let second = ctl.request_start().unwrap();
        assert!(ctl.begin_session(first, all_sources()).is_empty());
        assert_eq!(ctl.state().phase, Phase::Idle);
        assert!(!ctl.begin_session(second, all_sources()).is_empty());
        assert_eq!(ctl.state().phase, Phase::Breathing);
    }

    #[test]
    fn stop_cancels_pending_start() {
        let (mut ctl, _clock) = controller(small_config());
        let ticket = ctl.request_start().unwrap();
        ctl.stop();
        assert!(ctl.begin_session(ticket, all_sources()).is_empty());
        assert_eq!(ctl.state().phase, Phase::Idle);
    }

    #[test]
    fn apnea_begins_after_last_exhale() {
        let (mut ctl, clock) = controller(small_config());
        ctl.start(all_sources());
        run_until(&mut ctl, &clock, 15_900);
        assert_eq!(ctl.state().phase, Phase::Breathing);
        assert_eq!(ctl.state().breaths_done, 3);

        let out = run_until(&mut ctl, &clock, 16_000);
        assert_eq!(ctl.state().phase, Phase::Apnea);
        assert_eq!(ctl.state().breaths_done, 4);
        assert_eq!(ctl.apnea_started_at_ms(), Some(16_000));
        assert!(out.audio.contains(&AudioCommand::Stop { track: TrackId::BreathCue }));
        assert!(out.effects.contains(&Effect::RefreshSource {
            track: TrackId::ApneaCue,
            cycle_index: 1
        }));
    }

    #[test]
    fn apnea_track_plays_only_after_refresh_for_same_cycle() {
        let (mut ctl, clock) = controller(small_config());
        ctl.start(all_sources());
        run_until(&mut ctl, &clock, 16_000);

        let stale = ctl.on_source_resolved(TrackId::ApneaCue, 2, "https://signed/new.mp3");
        assert!(stale.audio.is_empty());

        let fresh = ctl.on_source_resolved(TrackId::ApneaCue, 1, "https://signed/new.mp3");
        assert_eq!(
            fresh.audio.last(),
            Some(&AudioCommand::Play { track: TrackId::ApneaCue })
        );
    }

    #[test]
    fn duplicate_expiry_advances_once() {
        let (mut ctl, clock) = controller(small_config());
        ctl.start(all_sources());
        let deadline = ctl.deadline().unwrap();
        clock.set(2_000);
        let first = ctl.expire(deadline);
        let second = ctl.expire(deadline);
        assert_eq!(first.events.len(), 1);
        assert!(second.is_empty());
        assert_eq!(ctl.state().subphase, Subphase::Exhale);
        assert_eq!(ctl.state().breaths_done, 0);
    }

    #[test]
    fn early_expiry_is_ignored() {
        let (mut ctl, clock) = controller(small_config());
        ctl.start(all_sources());
        let deadline = ctl.deadline().unwrap();
        clock.set(1_999);
        assert!(ctl.expire(deadline).is_empty());
        assert_eq!(ctl.state().subphase, Subphase::Inhale);
    }

    #[test]
    fn final_cue_fires_on_single_cycle() {
        let config = SessionConfig {
            cycles: 1,
            ..small_config()
        };
        let (mut ctl, clock) = controller(config);
        ctl.start(all_sources());
        run_until(&mut ctl, &clock, 16_000);
        clock.set(20_000);
        let out = ctl.end_apnea();
        assert!(out.audio.contains(&AudioCommand::Play { track: TrackId::FinalCue }));
        assert!(!out.audio.contains(&AudioCommand::Play { track: TrackId::ApneaEndCue }));
    }

    #[test]
    fn pause_during_apnea_excludes_paused_time() {
        let (mut ctl, clock) = controller(small_config());
        ctl.start(all_sources());
        run_until(&mut ctl, &clock, 16_000);

        clock.set(20_000);
        ctl.pause();
        assert!(ctl.end_apnea().is_empty());
        clock.set(50_000);
        ctl.resume();
        assert_eq!(ctl.apnea_started_at_ms(), Some(46_000));
        clock.set(55_000);
        ctl.end_apnea();
        assert_eq!(ctl.rounds(), &[9]);
    }

    #[test]
    fn pause_during_breathing_preserves_remaining_time() {
        let (mut ctl, clock) = controller(small_config());
        ctl.start(all_sources());
        clock.set(500);
        ctl.tick();
        ctl.pause();
        assert_eq!(ctl.state().time_left_ms, 1_500);

        clock.set(60_000);
        assert!(ctl.tick().is_empty());
        assert_eq!(ctl.state().subphase, Subphase::Inhale);

        ctl.resume();
        assert_eq!(ctl.state().time_left_ms, 1_500);
        clock.set(61_400);
        ctl.tick();
        assert_eq!(ctl.state().subphase, Subphase::Inhale);
        clock.set(61_500);
        ctl.tick();
        assert_eq!(ctl.state().subphase, Subphase::Exhale);
    }

    #[test]
    fn pause_and_resume_are_noops_when_idle() {
        let (mut ctl, _clock) = controller(small_config());
        assert!(ctl.pause().is_empty());
        assert!(ctl.resume().is_empty());
        assert!(ctl.end_apnea().is_empty());
        assert!(ctl.stop().is_empty());
    }

    #[test]
    fn visibility_recovery_advances_exactly_once() {
        let (mut ctl, clock) = controller(small_config());
        ctl.start(all_sources());
        ctl.on_hidden();
        clock.set(9_000);
        let out = ctl.on_visible();
        assert_eq!(ctl.state().subphase, Subphase::Exhale);
        assert_eq!(ctl.state().breaths_done, 0);
        assert_eq!(ctl.state().time_left_ms, 2_000);
        assert!(out.events.iter().any(|e| matches!(
            e,
            Event::TimingRecovered { hidden_ms: 9_000, advanced: true, .. }
        )));
    }

    #[test]
    fn hold_end_apnea_completes_after_required_time() {
        let (mut ctl, clock) = controller(small_config());
        ctl.start(all_sources());
        run_until(&mut ctl, &clock, 16_000);

        assert!(!ctl.begin_hold(HoldTarget::EndApnea).is_empty());
        clock.set(16_900);
        ctl.poll_hold();
        assert_eq!(ctl.state().phase, Phase::Apnea);
        clock.set(17_500);
        ctl.poll_hold();
        assert_eq!(ctl.state().phase, Phase::Recovery);
        assert_eq!(ctl.rounds(), &[2]);
    }

    #[test]
    fn hold_targets_are_gated_by_phase() {
        let (mut ctl, _clock) = controller(small_config());
        assert!(ctl.begin_hold(HoldTarget::EndApnea).is_empty());
        assert!(ctl.begin_hold(HoldTarget::FinalClose).is_empty());
        ctl.start(all_sources());
        assert!(ctl.begin_hold(HoldTarget::EndApnea).is_empty());
        assert!(!ctl.begin_hold(HoldTarget::Stop).is_empty());
    }

    #[test]
    fn released_hold_does_nothing() {
        let (mut ctl, clock) = controller(small_config());
        ctl.start(all_sources());
        ctl.begin_hold(HoldTarget::Stop);
        clock.set(500);
        ctl.release_hold();
        clock.set(1_900);
        ctl.tick();
        assert_eq!(ctl.state().phase, Phase::Breathing);
    }

    #[test]
    fn swap_ambient_crossfades() {
        let (mut ctl, _clock) = controller(small_config());
        assert!(ctl.swap_ambient("https://cdn/ocean.mp3").is_empty());
        ctl.start(all_sources());
        let out = ctl.swap_ambient("https://cdn/ocean.mp3");
        assert_eq!(
            out.audio,
            vec![AudioCommand::CrossfadeTo {
                track: TrackId::Ambient,
                url: "https://cdn/ocean.mp3".into()
            }]
        );
    }

    #[test]
    fn missing_apnea_source_marks_degraded() {
        let (mut ctl, _clock) = controller(small_config());
        let sources = ResolvedSources::new().with(TrackId::BreathCue, "https://cdn/b.mp3");
        let out = ctl.start(sources);
        assert!(ctl.state().audio_degraded);
        assert!(!out.audio.contains(&AudioCommand::Play { track: TrackId::Ambient }));
    }
}
