//! Async driver for a [`SessionController`].
//!
//! ## Architecture
//!
//! ```text
//! SessionHandle --Input--> SessionRunner::run ---Event---> subscriber
//!                            |   select! over:
//!                            |   - session tick (100ms)
//!                            |   - hold poll tick (while a hold is active)
//!                            |   - user inputs
//!                            |   - results of spawned resolution tasks
//!                            v
//!                   SessionController (sole owner of session state)
//!                            |
//!                            +--> AudioTrackSet (commands, best effort)
//!                            +--> ProgressStore / Database (on completion)
//!                            +--> MetricsReporter (spawned, fire-and-forget)
//! ```
//!
//! All controller calls happen on the runner task. Network work (source
//! resolution, reporting) runs in spawned tasks that never touch the
//! controller; resolution results come back as messages.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use crate::audio::{
    apply_commands, resolve_all, AudioSourceResolver, AudioTrackSet, ResolvedSources, SourcePlan,
    SourceRef, TrackId,
};
use crate::clock::Clock;
use crate::error::AudioError;
use crate::events::Event;
use crate::metrics::{
    record_session, MetricsPayload, MetricsReporter, ProgressStore, SessionSummary,
    StudentIdentity,
};
use crate::session::{Effect, HoldTarget, Outcome, SessionController, StartTicket};
use crate::storage::Database;

/// Progress key used when no student identity is configured.
pub const LOCAL_PROGRESS_KEY: &str = "local";

/// Requests accepted by a running [`SessionRunner`].
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Start,
    Stop,
    Pause,
    Resume,
    EndApnea,
    BeginHold(HoldTarget),
    ReleaseHold,
    /// The host went to the background.
    Hidden,
    /// The host is in the foreground again.
    Visible,
    /// Resolve `source` and crossfade the ambient loop to it.
    SwapAmbient(SourceRef),
    /// Publish a [`Event::StateSnapshot`].
    Snapshot,
    Shutdown,
}

/// Results of spawned work, fed back into the loop.
enum Internal {
    SourcesResolved {
        ticket: StartTicket,
        sources: ResolvedSources,
    },
    SourceRefreshed {
        track: TrackId,
        cycle_index: u32,
        result: Result<String, AudioError>,
    },
    AmbientResolved(Result<String, AudioError>),
}

/// Cloneable input side of a runner.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<Input>,
}

impl SessionHandle {
    /// Returns `false` once the runner has exited.
    pub fn send(&self, input: Input) -> bool {
        self.tx.send(input).is_ok()
    }

    pub fn start(&self) -> bool {
        self.send(Input::Start)
    }

    pub fn stop(&self) -> bool {
        self.send(Input::Stop)
    }

    pub fn shutdown(&self) -> bool {
        self.send(Input::Shutdown)
    }
}

pub struct SessionRunner<C: Clock> {
    controller: SessionController<C>,
    audio: Box<dyn AudioTrackSet + Send>,
    resolver: Arc<dyn AudioSourceResolver>,
    reporter: Arc<dyn MetricsReporter>,
    progress: Box<dyn ProgressStore>,
    history: Option<Database>,
    plan: SourcePlan,
    identity: StudentIdentity,
    tick: Duration,
    inputs: mpsc::UnboundedReceiver<Input>,
    events: mpsc::UnboundedSender<Event>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
}

impl<C: Clock + Send + 'static> SessionRunner<C> {
    /// Build a runner plus its input handle and event stream.
    pub fn new(
        controller: SessionController<C>,
        audio: Box<dyn AudioTrackSet + Send>,
        resolver: Arc<dyn AudioSourceResolver>,
        reporter: Arc<dyn MetricsReporter>,
        progress: Box<dyn ProgressStore>,
    ) -> (Self, SessionHandle, mpsc::UnboundedReceiver<Event>) {
        let (input_tx, inputs) = mpsc::unbounded_channel();
        let (events, event_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let runner = Self {
            controller,
            audio,
            resolver,
            reporter,
            progress,
            history: None,
            plan: SourcePlan::default(),
            identity: StudentIdentity::default(),
            tick: Duration::from_millis(100),
            inputs,
            events,
            internal_tx,
            internal_rx,
        };
        (runner, SessionHandle { tx: input_tx }, event_rx)
    }

    pub fn with_plan(mut self, plan: SourcePlan) -> Self {
        self.plan = plan;
        self
    }

    pub fn with_identity(mut self, identity: StudentIdentity) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick.max(Duration::from_millis(1));
        self
    }

    /// Also append completed sessions to `db`.
    pub fn with_history(mut self, db: Database) -> Self {
        self.history = Some(db);
        self
    }

    /// Drive the controller until [`Input::Shutdown`] or every handle is dropped.
    pub async fn run(mut self) {
        let mut tick = tokio::time::interval(self.tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let hold_every = Duration::from_millis(self.controller.settings().hold_poll_ms.max(1));
        let mut hold_tick = tokio::time::interval(hold_every);
        hold_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::debug!(tick_ms = self.tick.as_millis() as u64, "session runner started");
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let out = self.controller.tick();
                    self.apply(out);
                }
                _ = hold_tick.tick(), if self.controller.active_hold().is_some() => {
                    let out = self.controller.poll_hold();
                    self.apply(out);
                }
                Some(message) = self.internal_rx.recv() => self.handle_internal(message),
                input = self.inputs.recv() => match input {
                    None | Some(Input::Shutdown) => break,
                    Some(input) => self.handle_input(input),
                },
            }
        }

        let out = self.controller.stop();
        self.apply(out);
        tracing::debug!("session runner stopped");
    }

    fn handle_input(&mut self, input: Input) {
        let out = match input {
            Input::Start => {
                self.spawn_start();
                return;
            }
            Input::Stop => self.controller.stop(),
            Input::Pause => self.controller.pause(),
            Input::Resume => self.controller.resume(),
            Input::EndApnea => self.controller.end_apnea(),
            Input::BeginHold(target) => self.controller.begin_hold(target),
            Input::ReleaseHold => self.controller.release_hold(),
            Input::Hidden => {
                self.controller.on_hidden();
                return;
            }
            Input::Visible => self.controller.on_visible(),
            Input::SwapAmbient(source) => {
                let resolver = Arc::clone(&self.resolver);
                let tx = self.internal_tx.clone();
                tokio::spawn(async move {
                    let result = resolver.resolve(&source).await;
                    let _ = tx.send(Internal::AmbientResolved(result));
                });
                return;
            }
            Input::Snapshot => {
                let _ = self.events.send(self.controller.snapshot());
                return;
            }
            Input::Shutdown => return,
        };
        self.apply(out);
    }

    fn spawn_start(&mut self) {
        let Some(ticket) = self.controller.request_start() else {
            tracing::debug!(phase = ?self.controller.state().phase, "start ignored");
            return;
        };
        let resolver = Arc::clone(&self.resolver);
        let plan = self.plan.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let sources = resolve_all(resolver.as_ref(), &plan).await;
            let _ = tx.send(Internal::SourcesResolved { ticket, sources });
        });
    }

    fn handle_internal(&mut self, message: Internal) {
        let out = match message {
            Internal::SourcesResolved { ticket, sources } => {
                self.controller.begin_session(ticket, sources)
            }
            Internal::SourceRefreshed {
                track,
                cycle_index,
                result,
            } => match result {
                Ok(url) => self.controller.on_source_resolved(track, cycle_index, &url),
                Err(e) => {
                    tracing::warn!(%track, error = %e, "source refresh failed");
                    self.controller.on_source_failed(track, cycle_index)
                }
            },
            Internal::AmbientResolved(Ok(url)) => self.controller.swap_ambient(&url),
            Internal::AmbientResolved(Err(e)) => {
                tracing::debug!(error = %e, "ambient swap skipped");
                Outcome::default()
            }
        };
        self.apply(out);
    }

    fn apply(&mut self, out: Outcome) {
        if out.is_empty() {
            return;
        }
        let rejected = apply_commands(self.audio.as_mut(), &out.audio);
        if rejected > 0 {
            tracing::debug!(rejected, "audio commands rejected");
        }
        for event in out.events {
            let _ = self.events.send(event);
        }
        for effect in out.effects {
            match effect {
                Effect::Completed(summary) => self.complete(&summary),
                Effect::RefreshSource { track, cycle_index } => {
                    self.refresh_source(track, cycle_index)
                }
            }
        }
    }

    fn refresh_source(&mut self, track: TrackId, cycle_index: u32) {
        let Some(source) = self.plan.get(track).cloned() else {
            let out = self.controller.on_source_failed(track, cycle_index);
            self.apply(out);
            return;
        };
        let resolver = Arc::clone(&self.resolver);
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = resolver.resolve(&source).await;
            let _ = tx.send(Internal::SourceRefreshed {
                track,
                cycle_index,
                result,
            });
        });
    }

    /// Persist locally, then report remotely without waiting.
    fn complete(&mut self, summary: &SessionSummary) {
        let key = if self.identity.student_id.is_empty() {
            LOCAL_PROGRESS_KEY.to_string()
        } else {
            self.identity.student_id.clone()
        };
        let today = Utc::now().date_naive();
        match self.progress.load(&key) {
            Ok(prev) => {
                let next = record_session(&prev, summary, today);
                if let Err(e) = self.progress.save(&key, &next) {
                    tracing::warn!(error = %e, "failed to save progress");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to load progress"),
        }

        if let Some(db) = &self.history {
            if let Err(e) = db.record_session(&self.identity.student_id, summary) {
                tracing::warn!(error = %e, "failed to record session");
            }
        }

        if !self.identity.is_complete() {
            return;
        }
        let payload = MetricsPayload::new(&self.identity, summary).normalized();
        let reporter = Arc::clone(&self.reporter);
        tokio::spawn(async move {
            if let Err(e) = reporter.report(&payload).await {
                tracing::warn!(error = %e, "session report failed");
            }
        });
    }
}
