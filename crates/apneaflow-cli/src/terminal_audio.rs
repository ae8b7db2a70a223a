//! Audio backend for terminal runs: no device, only logs.

use std::collections::HashMap;

use apneaflow_core::error::AudioError;
use apneaflow_core::{AudioTrackSet, TrackId};

#[derive(Debug, Default)]
struct TrackSlot {
    url: Option<String>,
    playing: bool,
    volume: f32,
}

/// Tracks what would be audible and reports it through `tracing`.
#[derive(Debug, Default)]
pub struct TerminalTrackSet {
    tracks: HashMap<TrackId, TrackSlot>,
}

impl TerminalTrackSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&mut self, track: TrackId) -> &mut TrackSlot {
        self.tracks.entry(track).or_insert_with(|| TrackSlot {
            volume: 1.0,
            ..TrackSlot::default()
        })
    }
}

impl AudioTrackSet for TerminalTrackSet {
    fn load(&mut self, track: TrackId, url: &str) -> Result<(), AudioError> {
        tracing::debug!(%track, url, "load");
        self.slot(track).url = Some(url.to_string());
        Ok(())
    }

    fn play(&mut self, track: TrackId) -> Result<(), AudioError> {
        let slot = self.slot(track);
        if slot.url.is_none() {
            return Err(AudioError::NoSource(track.to_string()));
        }
        slot.playing = true;
        tracing::info!(%track, volume = slot.volume, "play");
        Ok(())
    }

    fn stop(&mut self, track: TrackId) -> Result<(), AudioError> {
        let slot = self.slot(track);
        if slot.playing {
            tracing::info!(%track, "stop");
        }
        slot.playing = false;
        Ok(())
    }

    fn crossfade_to(&mut self, track: TrackId, url: &str) -> Result<(), AudioError> {
        let slot = self.slot(track);
        slot.url = Some(url.to_string());
        tracing::info!(%track, url, playing = slot.playing, "crossfade");
        Ok(())
    }

    fn set_volume(&mut self, track: TrackId, volume: f32) -> Result<(), AudioError> {
        self.slot(track).volume = volume;
        Ok(())
    }

    fn is_ready(&self, track: TrackId) -> bool {
        self.tracks.get(&track).is_some_and(|s| s.url.is_some())
    }
}
