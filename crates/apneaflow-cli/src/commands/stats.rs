use clap::Subcommand;
use apneaflow_core::metrics::ProgressStore;
use apneaflow_core::runtime::LOCAL_PROGRESS_KEY;
use apneaflow_core::storage::{Database, SqliteProgressStore};
use apneaflow_core::AppConfig;

#[derive(Subcommand)]
pub enum StatsAction {
    /// Streak, totals and recent apnea times for a student
    Progress {
        /// Student id (defaults to remote.student_id, or local runs)
        #[arg(long)]
        student: Option<String>,
    },
    /// All-time stats across every recorded session
    All,
    /// Most recent sessions
    History {
        #[arg(long, default_value = "10")]
        limit: usize,
    },
}

pub fn run(action: StatsAction) -> Result<(), Box<dyn std::error::Error>> {
    let db = Database::open()?;

    match action {
        StatsAction::Progress { student } => {
            let key = student.unwrap_or_else(|| {
                let identity = AppConfig::load_or_default().identity();
                if identity.student_id.is_empty() {
                    LOCAL_PROGRESS_KEY.to_string()
                } else {
                    identity.student_id
                }
            });
            let store = SqliteProgressStore::new(db);
            let progress = store.load(&key)?;
            println!("{}", serde_json::to_string_pretty(&progress)?);
        }
        StatsAction::All => {
            let stats = db.stats_all()?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        StatsAction::History { limit } => {
            let sessions = db.recent_sessions(limit)?;
            println!("{}", serde_json::to_string_pretty(&sessions)?);
        }
    }
    Ok(())
}
