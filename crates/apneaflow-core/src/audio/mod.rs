mod resolver;
mod track;

pub use resolver::{
    resolve_all, AudioSourceResolver, HttpAudioResolver, ResolvedSources, SourcePlan, SourceRef,
    StaticResolver,
};
pub use track::{apply_commands, AudioCommand, AudioTrackSet, RecordingTrackSet, TrackId};
