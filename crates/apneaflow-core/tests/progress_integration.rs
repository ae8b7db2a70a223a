//! Integration tests for session persistence.
//!
//! Covers the path from a finished session summary to the on-disk session
//! history and per-student progress document.

use apneaflow_core::metrics::{record_session, ProgressStore};
use apneaflow_core::storage::SqliteProgressStore;
use apneaflow_core::{Database, ProgressStats, SessionSummary};
use chrono::{Duration, NaiveDate, TimeZone, Utc};

fn summary(id: &str, rounds: Vec<u32>, day: u32) -> SessionSummary {
    let completed_at = Utc.with_ymd_and_hms(2026, 3, day, 7, 30, 0).unwrap();
    SessionSummary {
        session_id: id.into(),
        completed_rounds: rounds.len() as u32,
        planned_rounds: rounds.len() as u32,
        breaths_per_cycle: 30,
        apnea_by_round: rounds,
        started_at: completed_at - Duration::minutes(12),
        completed_at,
    }
}

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 3, d).unwrap()
}

#[test]
fn test_history_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("apneaflow.db");

    {
        let db = Database::open_at(&path).unwrap();
        db.record_session("ana", &summary("a", vec![61, 74, 90], 2)).unwrap();
        db.record_session("ana", &summary("b", vec![70, 80, 95], 3)).unwrap();
    }

    let db = Database::open_at(&path).unwrap();
    let recent = db.recent_sessions(10).unwrap();
    assert_eq!(recent.len(), 2);
    assert_eq!(recent[0].session_id, "b");
    assert_eq!(recent[1].apnea_by_round, vec![61, 74, 90]);
    assert_eq!(recent[0].completed_at, summary("b", vec![], 3).completed_at);

    let stats = db.stats_all().unwrap();
    assert_eq!(stats.total_sessions, 2);
    assert_eq!(stats.total_rounds, 6);
    assert_eq!(stats.total_breaths, 180);
    assert_eq!(stats.best_apnea_secs, 95);

    assert_eq!(db.recent_sessions(1).unwrap().len(), 1);
}

#[test]
fn test_progress_streak_across_week() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("apneaflow.db");
    let mut store = SqliteProgressStore::new(Database::open_at(&path).unwrap());

    for (d, secs) in [(2, 60), (3, 65), (3, 70), (4, 72), (7, 80)] {
        let prev = store.load("ana").unwrap();
        let next = record_session(&prev, &summary("s", vec![secs], d), day(d));
        store.save("ana", &next).unwrap();
        match d {
            4 => assert_eq!(next.streak, 3),
            7 => assert_eq!(next.streak, 1),
            _ => {}
        }
    }

    drop(store);
    let store = SqliteProgressStore::new(Database::open_at(&path).unwrap());
    let stats = store.load("ana").unwrap();
    assert_eq!(stats.total_sessions, 5);
    assert_eq!(stats.total_breaths, 150);
    assert_eq!(stats.last_session_date, Some(day(7)));
    assert_eq!(stats.last_apnea_seconds, 80);
    assert_eq!(
        stats.apnea_history.iter().map(|e| e.seconds).collect::<Vec<_>>(),
        vec![60, 65, 70, 72, 80]
    );
    assert_eq!(store.load("someone-else").unwrap(), ProgressStats::default());
}
