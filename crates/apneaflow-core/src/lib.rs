//! # Apneaflow Core Library
//!
//! Core logic for guided breath-hold training sessions: rounds of paced
//! breathing, a user-ended breath hold (apnea) and a timed recovery. The CLI
//! is a thin layer over this crate.
//!
//! ## Architecture
//!
//! - **Session Controller**: a deadline-driven, I/O-free state machine. The
//!   caller invokes `tick()` periodically and applies the returned audio
//!   commands, events and effects
//! - **Audio**: logical track identifiers, a track-set trait for backends and
//!   async resolution of signed source URLs
//! - **Metrics**: session summaries, remote reporting and local progress
//! - **Storage**: SQLite session history and TOML configuration
//! - **Runtime**: a tokio task that owns a controller and wires it to the rest
//!
//! ## Key Components
//!
//! - [`SessionController`]: core session state machine
//! - [`SessionRunner`]: async driver around the controller
//! - [`Database`]: session and progress persistence
//! - [`AppConfig`]: application configuration management

pub mod audio;
pub mod clock;
pub mod error;
pub mod events;
pub mod metrics;
pub mod runtime;
pub mod session;
pub mod storage;

pub use audio::{AudioCommand, AudioTrackSet, TrackId};
pub use clock::{Clock, Deadline, ManualClock, SystemClock};
pub use error::{
    AudioError, ConfigError, CoreError, DatabaseError, ReporterError, Result, ValidationError,
};
pub use events::Event;
pub use metrics::{MetricsPayload, ProgressStats, SessionSummary, StudentIdentity};
pub use runtime::{Input, SessionHandle, SessionRunner};
pub use session::{
    ControllerSettings, Effect, Outcome, Phase, SessionConfig, SessionController, SessionState,
    Subphase,
};
pub use storage::{AppConfig, Database};
