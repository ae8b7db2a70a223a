//! Session results: the controller's summary, remote reporting and local
//! progress tracking.

mod progress;
mod reporter;
mod summary;

pub use progress::{
    record_session, ApneaHistoryEntry, LastSummary, MemoryProgressStore, ProgressStats,
    ProgressStore, APNEA_HISTORY_LEN,
};
pub use reporter::{HttpMetricsReporter, MetricsReporter, NullReporter};
pub use summary::{MetricsPayload, SessionSummary, StudentIdentity, MAX_REPORTED_ROUNDS};
