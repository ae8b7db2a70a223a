use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::AudioError;

/// Logical tracks the controller commands. Backends map these to devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrackId {
    BreathCue,
    Ambient,
    Secondary,
    /// The student's own apnea guidance, looped during apnea.
    ApneaCue,
    ApneaEndCue,
    PreApneaCue,
    FinalCue,
}

impl TrackId {
    pub const ALL: [TrackId; 7] = [
        TrackId::BreathCue,
        TrackId::Ambient,
        TrackId::Secondary,
        TrackId::ApneaCue,
        TrackId::ApneaEndCue,
        TrackId::PreApneaCue,
        TrackId::FinalCue,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TrackId::BreathCue => "breath-cue",
            TrackId::Ambient => "ambient",
            TrackId::Secondary => "secondary",
            TrackId::ApneaCue => "apnea-cue",
            TrackId::ApneaEndCue => "apnea-end-cue",
            TrackId::PreApneaCue => "pre-apnea-cue",
            TrackId::FinalCue => "final-cue",
        }
    }

    /// Loops continuously while playing.
    pub fn is_loop(&self) -> bool {
        matches!(
            self,
            TrackId::BreathCue | TrackId::Ambient | TrackId::Secondary | TrackId::ApneaCue
        )
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A command issued to the audio backend after a state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum AudioCommand {
    Load { track: TrackId, url: String },
    Play { track: TrackId },
    Stop { track: TrackId },
    CrossfadeTo { track: TrackId, url: String },
    SetVolume { track: TrackId, volume: f32 },
}

impl AudioCommand {
    pub fn track(&self) -> TrackId {
        match self {
            AudioCommand::Load { track, .. }
            | AudioCommand::Play { track }
            | AudioCommand::Stop { track }
            | AudioCommand::CrossfadeTo { track, .. }
            | AudioCommand::SetVolume { track, .. } => *track,
        }
    }
}

/// Named tracks the controller can drive.
///
/// Every operation is a request: the backend may reject it (autoplay policy,
/// missing source) and the session carries on regardless.
pub trait AudioTrackSet {
    /// Point `track` at a new source without starting it.
    fn load(&mut self, track: TrackId, url: &str) -> Result<(), AudioError>;
    fn play(&mut self, track: TrackId) -> Result<(), AudioError>;
    fn stop(&mut self, track: TrackId) -> Result<(), AudioError>;
    /// Replace the source of a (possibly playing) loop with an overlap.
    fn crossfade_to(&mut self, track: TrackId, url: &str) -> Result<(), AudioError>;
    /// `volume` is clamped to 0..=1 by the caller.
    fn set_volume(&mut self, track: TrackId, volume: f32) -> Result<(), AudioError>;
    fn is_ready(&self, track: TrackId) -> bool;
}

/// Issue `commands` in order, best effort. Returns how many were rejected.
pub fn apply_commands(set: &mut dyn AudioTrackSet, commands: &[AudioCommand]) -> usize {
    let mut rejected = 0;
    for command in commands {
        let result = match command {
            AudioCommand::Load { track, url } => set.load(*track, url),
            AudioCommand::Play { track } => set.play(*track),
            AudioCommand::Stop { track } => set.stop(*track),
            AudioCommand::CrossfadeTo { track, url } => set.crossfade_to(*track, url),
            AudioCommand::SetVolume { track, volume } => {
                set.set_volume(*track, volume.clamp(0.0, 1.0))
            }
        };
        if let Err(e) = result {
            rejected += 1;
            tracing::debug!(track = %command.track(), error = %e, "audio command rejected");
        }
    }
    rejected
}

/// In-memory track set that records what it was told.
///
/// Used by tests and headless runs. With `reject_playback` set it behaves
/// like a host that has not seen a user gesture yet.
#[derive(Debug, Default, Clone)]
pub struct RecordingTrackSet {
    pub log: Vec<AudioCommand>,
    pub sources: HashMap<TrackId, String>,
    pub playing: HashMap<TrackId, bool>,
    pub volumes: HashMap<TrackId, f32>,
    pub reject_playback: bool,
}

impl RecordingTrackSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rejecting_playback() -> Self {
        Self {
            reject_playback: true,
            ..Self::default()
        }
    }

    pub fn is_playing(&self, track: TrackId) -> bool {
        self.playing.get(&track).copied().unwrap_or(false)
    }

    pub fn plays_of(&self, track: TrackId) -> usize {
        self.log
            .iter()
            .filter(|c| matches!(c, AudioCommand::Play { track: t } if *t == track))
            .count()
    }
}

impl AudioTrackSet for RecordingTrackSet {
    fn load(&mut self, track: TrackId, url: &str) -> Result<(), AudioError> {
        self.log.push(AudioCommand::Load {
            track,
            url: url.to_string(),
        });
        self.sources.insert(track, url.to_string());
        Ok(())
    }

    fn play(&mut self, track: TrackId) -> Result<(), AudioError> {
        self.log.push(AudioCommand::Play { track });
        if !self.sources.contains_key(&track) {
            return Err(AudioError::NoSource(track.to_string()));
        }
        if self.reject_playback {
            return Err(AudioError::PlaybackRejected {
                track: track.to_string(),
                reason: "no user gesture".into(),
            });
        }
        self.playing.insert(track, true);
        Ok(())
    }

    fn stop(&mut self, track: TrackId) -> Result<(), AudioError> {
        self.log.push(AudioCommand::Stop { track });
        self.playing.insert(track, false);
        Ok(())
    }

    fn crossfade_to(&mut self, track: TrackId, url: &str) -> Result<(), AudioError> {
        self.log.push(AudioCommand::CrossfadeTo {
            track,
            url: url.to_string(),
        });
        self.sources.insert(track, url.to_string());
        Ok(())
    }

    fn set_volume(&mut self, track: TrackId, volume: f32) -> Result<(), AudioError> {
        self.log.push(AudioCommand::SetVolume { track, volume });
        self.volumes.insert(track, volume);
        Ok(())
    }

    fn is_ready(&self, track: TrackId) -> bool {
        self.sources.contains_key(&track)
    }
}
