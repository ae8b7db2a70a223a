//! Breathing/apnea session: configuration, state, timing and gestures.

pub mod config;
pub mod controller;
mod hold;
mod rounds;
mod state;

pub use config::{AmbientSound, BreathStyle, SecondaryTrack, SessionConfig, Volumes};
pub use controller::{ControllerSettings, Effect, Outcome, SessionController, StartTicket};
pub use hold::{HoldGestureTimer, HoldHandle, HoldSignal, HoldTarget};
pub use rounds::{apnea_seconds, RoundRecords};
pub use state::{Phase, SessionState, Subphase};
