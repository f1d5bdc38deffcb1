mod common;

use pulselab::intake::{Intake, CANCEL_FILE};
use pulselab::journal::{read_journal, EntryKind};
use pulselab::{DriverRegistry, ErrorKind, LabConfig, LabGuardian, MockProbe};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn lab(root: &Path) -> LabConfig {
    let mut cfg = LabConfig::with_root(root);
    cfg.poll_interval_ms = 20;
    cfg.debounce_ms = 0;
    cfg.acquisition_timeout_ms = 500;
    cfg.ensure_dirs().unwrap();
    cfg
}

/// Polls `check` until it holds or `limit` runs out.
async fn eventually(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

// ============================================================================
// Intake on its own
// ============================================================================

#[test]
fn test_file_needs_two_stable_scans() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = lab(dir.path());
    std::fs::write(cfg.inbox_dir().join("a.yaml"), common::odmr_yaml(2, 1, "sum")).unwrap();

    let mut intake = Intake::new(cfg.clone());
    let first = intake.scan().unwrap();
    assert!(first.accepted.is_empty());
    assert_eq!(intake.backlog_len(), 0);

    let second = intake.scan().unwrap();
    assert_eq!(second.accepted.len(), 1);
    assert_eq!(intake.backlog_len(), 1);

    // Already queued: a third scan does not queue it again.
    let third = intake.scan().unwrap();
    assert!(third.accepted.is_empty());
    assert_eq!(intake.backlog_len(), 1);
}

#[test]
fn test_non_descriptor_files_are_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = lab(dir.path());
    std::fs::write(cfg.inbox_dir().join("notes.txt"), "hello").unwrap();
    std::fs::write(cfg.inbox_dir().join("b.yml"), common::odmr_yaml(2, 1, "sum")).unwrap();

    let mut intake = Intake::new(cfg.clone());
    intake.scan().unwrap();
    let report = intake.scan().unwrap();
    assert_eq!(report.accepted.len(), 1);
    assert!(cfg.inbox_dir().join("notes.txt").exists());
}

#[test]
fn test_malformed_file_is_moved_to_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = lab(dir.path());
    std::fs::write(cfg.inbox_dir().join("bad.yaml"), "sensor: [unclosed").unwrap();

    let mut intake = Intake::new(cfg.clone());
    intake.scan().unwrap();
    let report = intake.scan().unwrap();

    assert_eq!(report.rejected.len(), 1);
    assert_eq!(report.rejected[0].1.kind(), ErrorKind::Parse);
    assert!(!cfg.inbox_dir().join("bad.yaml").exists());
    assert_eq!(common::files_in(&cfg.rejected_dir()), vec!["bad.yaml"]);
    assert_eq!(intake.backlog_len(), 0);
}

#[test]
fn test_unmovable_reject_is_not_parsed_again() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = lab(dir.path());
    // A plain file where rejected/ should be: every move there fails.
    std::fs::remove_dir(cfg.rejected_dir()).unwrap();
    std::fs::write(cfg.rejected_dir(), "in the way").unwrap();
    let bad = cfg.inbox_dir().join("bad.yaml");
    std::fs::write(&bad, "sensor: [unclosed").unwrap();

    let mut intake = Intake::new(cfg.clone());
    intake.scan().unwrap();
    assert_eq!(intake.scan().unwrap().rejected.len(), 1);
    assert!(bad.exists());

    for _ in 0..3 {
        assert!(intake.scan().unwrap().rejected.is_empty());
    }

    // An edited file is a new submission.
    std::fs::write(&bad, "sensor: [still, unclosed").unwrap();
    intake.scan().unwrap();
    assert_eq!(intake.scan().unwrap().rejected.len(), 1);
}

#[test]
fn test_dispatch_is_fifo_and_marks_running() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = lab(dir.path());
    for name in ["b.yaml", "a.yaml", "c.yaml"] {
        std::fs::write(cfg.inbox_dir().join(name), common::odmr_yaml(2, 1, "sum")).unwrap();
    }

    let mut intake = Intake::new(cfg.clone());
    intake.scan().unwrap();
    intake.scan().unwrap();

    let first = intake.next_dispatch().unwrap();
    assert_eq!(first.running_path, cfg.inbox_dir().join("a.yaml_running"));
    assert!(first.running_path.exists());
    assert!(!cfg.inbox_dir().join("a.yaml").exists());

    let second = intake.next_dispatch().unwrap();
    assert_eq!(second.running_path, cfg.inbox_dir().join("b.yaml_running"));
    assert_eq!(intake.backlog_len(), 1);
}

#[test]
fn test_withdrawn_file_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = lab(dir.path());
    std::fs::write(cfg.inbox_dir().join("a.yaml"), common::odmr_yaml(2, 1, "sum")).unwrap();
    std::fs::write(cfg.inbox_dir().join("b.yaml"), common::odmr_yaml(2, 1, "sum")).unwrap();

    let mut intake = Intake::new(cfg.clone());
    intake.scan().unwrap();
    intake.scan().unwrap();
    std::fs::remove_file(cfg.inbox_dir().join("a.yaml")).unwrap();

    let next = intake.next_dispatch().unwrap();
    assert_eq!(next.running_path, cfg.inbox_dir().join("b.yaml_running"));
    assert!(intake.next_dispatch().is_none());
}

#[test]
fn test_cancel_file_is_consumed() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = lab(dir.path());
    std::fs::write(cfg.inbox_dir().join(CANCEL_FILE), "").unwrap();

    let mut intake = Intake::new(cfg.clone());
    assert!(intake.scan().unwrap().cancel_requested);
    assert!(!cfg.inbox_dir().join(CANCEL_FILE).exists());
    assert!(!intake.scan().unwrap().cancel_requested);
}

#[test]
fn test_settle_deletes_archives_or_fails() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = lab(dir.path());
    let intake = Intake::new(cfg.clone());

    let ok = cfg.inbox_dir().join("ok.yaml_running");
    std::fs::write(&ok, "x").unwrap();
    assert_eq!(intake.settle(&ok, true).unwrap(), None);
    assert!(!ok.exists());

    let bad = cfg.inbox_dir().join("bad.yaml_running");
    std::fs::write(&bad, "x").unwrap();
    let moved = intake.settle(&bad, false).unwrap().unwrap();
    assert_eq!(moved, cfg.failed_dir().join("bad.yaml"));

    // Same name again does not overwrite the first one.
    std::fs::write(&bad, "y").unwrap();
    let again = intake.settle(&bad, false).unwrap().unwrap();
    assert_eq!(again, cfg.failed_dir().join("bad.yaml.1"));

    let mut archiving = cfg.clone();
    archiving.archive_completed = true;
    let intake = Intake::new(archiving.clone());
    std::fs::write(&ok, "x").unwrap();
    let kept = intake.settle(&ok, true).unwrap().unwrap();
    assert_eq!(kept, archiving.archive_dir().join("ok.yaml"));
}

#[test]
fn test_recover_moves_stale_running_files() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = lab(dir.path());
    std::fs::write(cfg.inbox_dir().join("old.yaml_running"), "x").unwrap();
    std::fs::write(cfg.inbox_dir().join("new.yaml"), "x").unwrap();

    let intake = Intake::new(cfg.clone());
    let moved = intake.recover().unwrap();
    assert_eq!(moved, vec![cfg.failed_dir().join("old.yaml")]);
    assert_eq!(common::files_in(&cfg.inbox_dir()), vec!["new.yaml"]);
}

// ============================================================================
// The whole lab
// ============================================================================

#[tokio::test]
async fn test_bad_file_rejected_then_good_file_runs() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = lab(dir.path());
    let probe = MockProbe::new();
    let guardian = LabGuardian::boot(cfg.clone(), DriverRegistry::with_probe(probe.clone())).unwrap();

    let shutdown = Arc::new(AtomicBool::new(false));
    let lab_task = tokio::spawn(guardian.run(shutdown.clone()));

    std::fs::write(cfg.inbox_dir().join("bad.yaml"), "averages: [oops").unwrap();
    assert!(
        eventually(Duration::from_secs(5), || common::files_in(&cfg.rejected_dir()) == vec!["bad.yaml"]).await,
        "malformed file never reached rejected/"
    );

    std::fs::write(cfg.inbox_dir().join("good.yaml"), common::odmr_yaml(3, 2, "sum")).unwrap();
    let done = eventually(Duration::from_secs(10), || {
        let results = common::files_in(&cfg.results_dir());
        let status = std::fs::read_to_string(cfg.status_path()).unwrap_or_default();
        results.iter().any(|f| f.ends_with(".bin"))
            && results.iter().any(|f| f.ends_with(".yaml"))
            && common::files_in(&cfg.inbox_dir()).is_empty()
            && status == "ready"
    })
    .await;
    assert!(done, "good job did not complete");

    shutdown.store(true, Ordering::SeqCst);
    tokio::time::timeout(Duration::from_secs(5), lab_task)
        .await
        .expect("lab did not stop")
        .unwrap()
        .unwrap();

    let kinds: Vec<EntryKind> = read_journal(cfg.journal_path())
        .unwrap()
        .into_iter()
        .map(|r| r.kind)
        .collect();
    assert_eq!(kinds.first(), Some(&EntryKind::LabStarted));
    assert_eq!(kinds.last(), Some(&EntryKind::LabStopped));
    for k in [
        EntryKind::Rejected,
        EntryKind::Accepted,
        EntryKind::Started,
        EntryKind::Completed,
    ] {
        assert!(kinds.contains(&k), "journal misses {:?}: {:?}", k, kinds);
    }
    assert!(!kinds.contains(&EntryKind::Failed));
    assert_eq!(probe.count("sensor", &pulselab::drivers::ProbeCall::Release), 1);
}

#[tokio::test]
async fn test_failed_job_lands_in_failed_and_lab_keeps_going() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = lab(dir.path());
    let guardian = LabGuardian::boot(cfg.clone(), DriverRegistry::with_probe(MockProbe::new())).unwrap();

    let shutdown = Arc::new(AtomicBool::new(false));
    let lab_task = tokio::spawn(guardian.run(shutdown.clone()));

    let broken = common::odmr_yaml(2, 1, "sum").replace("type: MockCam", "type: Nope");
    std::fs::write(cfg.inbox_dir().join("a_broken.yaml"), broken).unwrap();
    std::fs::write(cfg.inbox_dir().join("b_fine.yaml"), common::odmr_yaml(2, 1, "sum")).unwrap();

    let done = eventually(Duration::from_secs(10), || {
        common::files_in(&cfg.failed_dir()) == vec!["a_broken.yaml"]
            && common::files_in(&cfg.results_dir()).iter().any(|f| f.ends_with(".bin"))
            && common::files_in(&cfg.inbox_dir()).is_empty()
    })
    .await;
    assert!(done, "lab did not settle both jobs");

    shutdown.store(true, Ordering::SeqCst);
    lab_task.await.unwrap().unwrap();

    let records = read_journal(cfg.journal_path()).unwrap();
    let failed = records
        .iter()
        .find(|r| r.kind == EntryKind::Failed)
        .expect("failure journaled");
    assert!(failed.detail.contains("ConfigError"), "{}", failed.detail);
    assert!(records.iter().any(|r| r.kind == EntryKind::Completed));
}

#[tokio::test]
async fn test_cancel_file_stops_running_job() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = lab(dir.path());
    let guardian = LabGuardian::boot(cfg.clone(), DriverRegistry::with_probe(MockProbe::new())).unwrap();

    let shutdown = Arc::new(AtomicBool::new(false));
    let lab_task = tokio::spawn(guardian.run(shutdown.clone()));

    // 50 x 2 units at 20 ms each: seconds of work, plenty of time to cancel.
    let slow = common::odmr_yaml(50, 2, "sum") + "sleep: 0.02\n";
    std::fs::write(cfg.inbox_dir().join("slow.yaml"), slow).unwrap();
    assert!(
        eventually(Duration::from_secs(5), || {
            std::fs::read_to_string(cfg.status_path()).unwrap_or_default() == "busy"
        })
        .await
    );

    std::fs::write(cfg.inbox_dir().join(CANCEL_FILE), "").unwrap();
    assert!(
        eventually(Duration::from_secs(5), || {
            common::files_in(&cfg.failed_dir()) == vec!["slow.yaml"]
        })
        .await,
        "cancelled job file did not reach failed/"
    );

    shutdown.store(true, Ordering::SeqCst);
    lab_task.await.unwrap().unwrap();

    let kinds: Vec<EntryKind> = read_journal(cfg.journal_path())
        .unwrap()
        .into_iter()
        .map(|r| r.kind)
        .collect();
    assert!(kinds.contains(&EntryKind::Cancelled));
    assert!(common::files_in(&cfg.results_dir()).is_empty());
}

#[tokio::test]
async fn test_hostile_jobs_do_not_wedge_the_lab() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = lab(dir.path());
    let guardian = LabGuardian::boot(cfg.clone(), DriverRegistry::with_probe(MockProbe::new())).unwrap();

    let shutdown = Arc::new(AtomicBool::new(false));
    let lab_task = tokio::spawn(guardian.run(shutdown.clone()));

    let huge = 1usize << 32;
    let endless = common::odmr_yaml(2, 1, "sum") + "sleep: 1.0e20\n";
    let uncountable = common::odmr_yaml(huge, huge, "sum");
    let explosive = common::odmr_yaml(2, 1, "sum")
        .replace("    signal: ramp\n", "    signal: ramp\n    panic_on_acquisition: 0\n");
    std::fs::write(cfg.inbox_dir().join("a_endless.yaml"), endless).unwrap();
    std::fs::write(cfg.inbox_dir().join("b_uncountable.yaml"), uncountable).unwrap();
    std::fs::write(cfg.inbox_dir().join("c_explosive.yaml"), explosive).unwrap();
    std::fs::write(cfg.inbox_dir().join("d_good.yaml"), common::odmr_yaml(2, 1, "sum")).unwrap();

    let done = eventually(Duration::from_secs(10), || {
        let status = std::fs::read_to_string(cfg.status_path()).unwrap_or_default();
        common::files_in(&cfg.rejected_dir()) == vec!["a_endless.yaml"]
            && common::files_in(&cfg.failed_dir()) == vec!["b_uncountable.yaml", "c_explosive.yaml"]
            && common::files_in(&cfg.results_dir()).iter().any(|f| f.ends_with(".bin"))
            && common::files_in(&cfg.inbox_dir()).is_empty()
            && status == "ready"
    })
    .await;
    assert!(done, "lab got stuck behind a bad job");

    shutdown.store(true, Ordering::SeqCst);
    tokio::time::timeout(Duration::from_secs(5), lab_task)
        .await
        .expect("lab did not stop")
        .unwrap()
        .unwrap();

    let failures: Vec<String> = read_journal(cfg.journal_path())
        .unwrap()
        .into_iter()
        .filter(|r| r.kind == EntryKind::Failed)
        .map(|r| r.detail)
        .collect();
    assert_eq!(failures.len(), 2, "{:?}", failures);
    assert!(failures[0].contains("ConfigError"), "{}", failures[0]);
    assert!(failures[1].contains("InternalError"), "{}", failures[1]);
}

#[tokio::test]
async fn test_unwritable_status_file_is_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = lab(dir.path());
    // A directory cannot be overwritten with "busy"/"ready".
    std::fs::create_dir(cfg.status_path()).unwrap();

    let guardian = LabGuardian::boot(cfg.clone(), DriverRegistry::with_probe(MockProbe::new())).unwrap();
    let shutdown = Arc::new(AtomicBool::new(false));
    let lab_task = tokio::spawn(guardian.run(shutdown.clone()));

    std::fs::write(cfg.inbox_dir().join("job.yaml"), common::odmr_yaml(2, 1, "sum")).unwrap();
    let done = eventually(Duration::from_secs(10), || {
        common::files_in(&cfg.results_dir()).iter().any(|f| f.ends_with(".bin"))
            && common::files_in(&cfg.inbox_dir()).is_empty()
    })
    .await;
    assert!(done, "job did not run");
    assert!(!lab_task.is_finished(), "lab stopped on its own");

    shutdown.store(true, Ordering::SeqCst);
    tokio::time::timeout(Duration::from_secs(5), lab_task)
        .await
        .expect("lab did not stop")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_restart_recovers_interrupted_job_file() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = lab(dir.path());
    std::fs::write(cfg.inbox_dir().join("crashed.yaml_running"), common::odmr_yaml(2, 1, "sum")).unwrap();

    let guardian = LabGuardian::boot(cfg.clone(), DriverRegistry::with_probe(MockProbe::new())).unwrap();
    let shutdown = Arc::new(AtomicBool::new(false));
    let lab_task = tokio::spawn(guardian.run(shutdown.clone()));

    assert!(
        eventually(Duration::from_secs(5), || {
            common::files_in(&cfg.failed_dir()) == vec!["crashed.yaml"]
        })
        .await
    );
    shutdown.store(true, Ordering::SeqCst);
    lab_task.await.unwrap().unwrap();
    assert!(common::files_in(&cfg.results_dir()).is_empty());
}
