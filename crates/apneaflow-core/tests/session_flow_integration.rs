//! Integration tests for complete session flows.
//!
//! Drives a controller with a manual clock through whole sessions and feeds
//! its audio commands into a recording track set, the way a runner would.

use apneaflow_core::audio::{apply_commands, RecordingTrackSet, ResolvedSources};
use apneaflow_core::session::HoldTarget;
use apneaflow_core::{
    Clock, ControllerSettings, Effect, Event, ManualClock, Outcome, Phase, SessionConfig,
    SessionController, Subphase, TrackId,
};

struct Harness {
    ctl: SessionController<ManualClock>,
    clock: ManualClock,
    audio: RecordingTrackSet,
    events: Vec<Event>,
    effects: Vec<Effect>,
}

impl Harness {
    fn new(config: SessionConfig) -> Self {
        let clock = ManualClock::new(0);
        let ctl = SessionController::new(config, ControllerSettings::default(), clock.clone())
            .unwrap();
        Self {
            ctl,
            clock,
            audio: RecordingTrackSet::new(),
            events: Vec::new(),
            effects: Vec::new(),
        }
    }

    fn absorb(&mut self, out: Outcome) {
        apply_commands(&mut self.audio, &out.audio);
        self.events.extend(out.events);
        self.effects.extend(out.effects);
    }

    fn start(&mut self) {
        let sources = TrackId::ALL
            .iter()
            .fold(ResolvedSources::new(), |s, t| s.with(*t, format!("https://cdn/{t}.mp3")));
        let out = self.ctl.start(sources);
        self.absorb(out);
    }

    /// Tick every 100ms up to and including `until_ms`.
    fn run_until(&mut self, until_ms: u64) {
        while self.clock.now_ms() < until_ms {
            self.clock.advance(100);
            let out = self.ctl.tick();
            self.absorb(out);
        }
    }

    fn at(&mut self, ms: u64, op: impl FnOnce(&mut SessionController<ManualClock>) -> Outcome) {
        self.clock.set(ms);
        let out = op(&mut self.ctl);
        self.absorb(out);
    }

    fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.events.iter().filter(|e| pred(e)).count()
    }
}

fn example_config() -> SessionConfig {
    SessionConfig {
        breaths_per_cycle: 4,
        inhale_seconds: 2.0,
        exhale_seconds: 2.0,
        recovery_seconds: 5.0,
        cycles: 2,
        ..SessionConfig::default()
    }
}

#[test]
fn test_two_cycle_session_timeline() {
    let mut h = Harness::new(example_config());
    h.start();

    h.run_until(16_000);
    assert_eq!(h.ctl.state().phase, Phase::Apnea);
    assert_eq!(h.ctl.state().breaths_done, 4);
    assert_eq!(h.ctl.apnea_started_at_ms(), Some(16_000));

    h.run_until(25_000);
    assert_eq!(h.ctl.state().time_left_ms, 9_000);
    h.at(25_000, |c| c.end_apnea());
    assert_eq!(h.ctl.rounds(), &[9]);
    assert_eq!(h.ctl.state().phase, Phase::Recovery);

    h.run_until(29_900);
    assert_eq!(h.ctl.state().phase, Phase::Recovery);
    h.run_until(30_000);
    assert_eq!(h.ctl.state().phase, Phase::Breathing);
    assert_eq!(h.ctl.state().cycle_index, 2);
    assert_eq!(h.ctl.state().breaths_done, 0);
    assert_eq!(h.ctl.state().subphase, Subphase::Inhale);

    h.run_until(46_000);
    assert_eq!(h.ctl.state().phase, Phase::Apnea);
    // Second apnea started at 46000; end it 7s later and shift the rest.
    h.run_until(53_000);
    h.at(53_000, |c| c.end_apnea());
    assert_eq!(h.ctl.rounds(), &[9, 7]);

    h.run_until(57_900);
    assert_eq!(h.ctl.state().phase, Phase::Recovery);
    h.run_until(58_000);
    assert_eq!(h.ctl.state().phase, Phase::Complete);
    assert!(h.ctl.state().is_awaiting_final_close);

    let summaries: Vec<_> = h
        .effects
        .iter()
        .filter_map(|e| match e {
            Effect::Completed(summary) => Some(summary.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].apnea_by_round, vec![9, 7]);
    assert_eq!(summaries[0].completed_rounds, 2);
    assert_eq!(h.count(|e| matches!(e, Event::ApneaStarted { .. })), 2);
    assert_eq!(h.count(|e| matches!(e, Event::CycleAdvanced { .. })), 1);
}

#[test]
fn test_immediate_second_apnea_completes_after_recovery() {
    // Cycle 2 breathing runs 30000..46000; ending its apnea immediately
    // leaves only the 5s recovery, so completion lands at 51000.
    let mut h = Harness::new(example_config());
    h.start();
    h.run_until(25_000);
    h.at(25_000, |c| c.end_apnea());
    h.run_until(46_000);
    h.at(46_000, |c| c.end_apnea());
    h.run_until(50_900);
    assert_eq!(h.ctl.state().phase, Phase::Recovery);
    h.run_until(51_000);
    assert_eq!(h.ctl.state().phase, Phase::Complete);
    assert_eq!(h.ctl.rounds(), &[9, 0]);
}

#[test]
fn test_final_close_hold_returns_to_idle() {
    let config = SessionConfig {
        cycles: 1,
        ..example_config()
    };
    let mut h = Harness::new(config);
    h.start();
    h.run_until(16_000);
    h.at(18_000, |c| c.end_apnea());
    h.run_until(23_000);
    assert_eq!(h.ctl.state().phase, Phase::Complete);
    assert!(h.audio.is_playing(TrackId::Ambient));

    h.at(23_000, |c| c.begin_hold(HoldTarget::FinalClose));
    h.run_until(24_400);
    assert_eq!(h.ctl.state().phase, Phase::Complete);
    h.run_until(24_500);
    assert_eq!(h.ctl.state().phase, Phase::Idle);
    assert!(!h.ctl.state().is_awaiting_final_close);
    assert!(!h.audio.is_playing(TrackId::Ambient));
    assert_eq!(h.count(|e| matches!(e, Event::SessionFinalized { .. })), 1);
}

#[test]
fn test_finalize_clears_last_session() {
    let config = SessionConfig {
        cycles: 1,
        ..example_config()
    };
    let mut h = Harness::new(config);
    h.start();
    h.run_until(16_000);
    h.at(18_000, |c| c.end_apnea());
    h.run_until(23_000);
    assert_eq!(h.ctl.rounds(), &[2]);
    assert!(!h.ctl.session_id().is_empty());

    h.at(23_000, |c| c.begin_hold(HoldTarget::FinalClose));
    h.run_until(24_500);
    assert_eq!(h.ctl.state().phase, Phase::Idle);
    assert!(h.ctl.rounds().is_empty());
    assert!(h.ctl.session_id().is_empty());
    assert!(h.ctl.deadline().is_none());
    match h.ctl.snapshot() {
        Event::StateSnapshot { apnea_by_round, .. } => assert!(apnea_by_round.is_empty()),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_pre_apnea_cue_on_first_breath() {
    // Two breaths with a lead of one: the cue belongs to breath 1.
    let config = SessionConfig {
        breaths_per_cycle: 2,
        pre_apnea_lead_breaths: 1,
        ..example_config()
    };
    let mut h = Harness::new(config);
    h.start();
    let cues: Vec<(u32, u32)> = h
        .events
        .iter()
        .filter_map(|e| match e {
            Event::PreApneaCue { cycle_index, breath_number, .. } => {
                Some((*cycle_index, *breath_number))
            }
            _ => None,
        })
        .collect();
    assert_eq!(cues, vec![(1, 1)]);

    h.run_until(8_000);
    assert_eq!(h.ctl.state().phase, Phase::Apnea);
    assert_eq!(h.count(|e| matches!(e, Event::PreApneaCue { .. })), 1);
}

#[test]
fn test_stop_mid_apnea_resets_everything() {
    let mut h = Harness::new(example_config());
    h.start();
    h.run_until(25_000);
    h.at(25_000, |c| c.end_apnea());
    h.run_until(48_000);
    assert_eq!(h.ctl.state().phase, Phase::Apnea);
    assert_eq!(h.ctl.state().cycle_index, 2);

    h.at(48_000, |c| c.stop());
    let state = h.ctl.state();
    assert_eq!(state.phase, Phase::Idle);
    assert_eq!(state.breaths_done, 0);
    assert_eq!(state.cycle_index, 1);
    assert!(h.ctl.rounds().is_empty());
    assert!(h.ctl.deadline().is_none());
    assert!(!h.audio.is_playing(TrackId::BreathCue));
    assert!(!h.audio.is_playing(TrackId::Ambient));

    // Ticking afterwards does nothing.
    h.events.clear();
    h.run_until(60_000);
    assert!(h.events.is_empty());
}

#[test]
fn test_stop_hold_while_breathing() {
    let mut h = Harness::new(example_config());
    h.start();
    h.at(3_000, |c| c.begin_hold(HoldTarget::Stop));
    h.run_until(3_900);
    assert_eq!(h.ctl.state().phase, Phase::Breathing);
    h.run_until(4_000);
    assert_eq!(h.ctl.state().phase, Phase::Idle);
    assert_eq!(h.count(|e| matches!(e, Event::SessionStopped { .. })), 1);
}

#[test]
fn test_pre_apnea_cue_fires_once_per_cycle() {
    let config = SessionConfig {
        breaths_per_cycle: 10,
        inhale_seconds: 1.0,
        exhale_seconds: 1.0,
        recovery_seconds: 2.0,
        cycles: 2,
        pre_apnea_lead_breaths: 1,
        ..SessionConfig::default()
    };
    let mut h = Harness::new(config);
    h.start();

    // Breath 9 starts after 8 full breaths.
    h.run_until(15_900);
    assert_eq!(h.count(|e| matches!(e, Event::PreApneaCue { .. })), 0);
    h.run_until(16_000);
    assert_eq!(h.ctl.state().current_breath_number, 9);
    assert_eq!(h.count(|e| matches!(e, Event::PreApneaCue { .. })), 1);
    assert_eq!(h.audio.plays_of(TrackId::PreApneaCue), 1);

    h.run_until(20_000);
    assert_eq!(h.ctl.state().phase, Phase::Apnea);
    assert_eq!(h.count(|e| matches!(e, Event::PreApneaCue { .. })), 1);

    h.at(21_000, |c| c.end_apnea());
    h.run_until(23_000);
    assert_eq!(h.ctl.state().cycle_index, 2);
    h.run_until(39_000);
    let cues: Vec<u32> = h
        .events
        .iter()
        .filter_map(|e| match e {
            Event::PreApneaCue { cycle_index, breath_number, .. } => {
                assert_eq!(*breath_number, 9);
                Some(*cycle_index)
            }
            _ => None,
        })
        .collect();
    assert_eq!(cues, vec![1, 2]);
}

#[test]
fn test_pause_shifts_remaining_time_exactly() {
    let mut h = Harness::new(example_config());
    h.start();
    h.run_until(1_000);
    h.at(1_000, |c| c.pause());
    assert!(!h.audio.is_playing(TrackId::Ambient));
    h.run_until(31_000);
    assert_eq!(h.ctl.state().subphase, Subphase::Inhale);
    assert_eq!(h.ctl.state().time_left_ms, 1_000);

    h.at(31_000, |c| c.resume());
    assert!(h.audio.is_playing(TrackId::Ambient));
    // Apnea arrives 30s later than it would have without the pause.
    h.run_until(45_900);
    assert_eq!(h.ctl.state().phase, Phase::Breathing);
    h.run_until(46_000);
    assert_eq!(h.ctl.state().phase, Phase::Apnea);
}

#[test]
fn test_backgrounding_advances_one_step_only() {
    let mut h = Harness::new(example_config());
    h.start();
    h.run_until(500);
    h.at(500, |c| {
        c.on_hidden();
        Outcome::default()
    });
    // Host suspended for a long time: the deadline has long passed.
    h.at(12_000, |c| c.on_visible());
    assert_eq!(h.ctl.state().phase, Phase::Breathing);
    assert_eq!(h.ctl.state().subphase, Subphase::Exhale);
    assert_eq!(h.ctl.state().breaths_done, 0);
    assert_eq!(h.ctl.state().time_left_ms, 2_000);
    assert_eq!(
        h.count(|e| matches!(e, Event::TimingRecovered { advanced: true, .. })),
        1
    );
}

#[test]
fn test_autoplay_rejection_does_not_disturb_timing() {
    let mut h = Harness::new(example_config());
    h.audio = RecordingTrackSet::rejecting_playback();
    h.start();
    h.run_until(16_000);
    assert_eq!(h.ctl.state().phase, Phase::Apnea);
    assert!(!h.audio.is_playing(TrackId::BreathCue));
}

#[test]
fn test_snapshot_reflects_state() {
    let mut h = Harness::new(example_config());
    h.start();
    h.run_until(2_500);
    match h.ctl.snapshot() {
        Event::StateSnapshot {
            phase,
            subphase,
            time_left_ms,
            cycles,
            phase_label,
            ..
        } => {
            assert_eq!(phase, Phase::Breathing);
            assert_eq!(subphase, Subphase::Exhale);
            assert_eq!(time_left_ms, 1_500);
            assert_eq!(cycles, 2);
            assert!(!phase_label.is_empty());
        }
        other => panic!("unexpected {other:?}"),
    }
}
