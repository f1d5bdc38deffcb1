mod common;

use chrono::{TimeZone, Utc};
use pulselab::aggregate::StoredValues;
use pulselab::storage::sha256_file;
use pulselab::{JobDescriptor, MockProbe, ResultStore};
use uuid::Uuid;

#[test]
fn test_result_key_format() {
    let at = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
    let id = Uuid::parse_str("1234abcd-0000-4000-8000-000000000000").unwrap();
    assert_eq!(
        ResultStore::result_key("odmr", at, id),
        "odmr_20240309-140507_1234abcd"
    );
    // Anything that is not safe in a file name is flattened.
    assert_eq!(
        ResultStore::result_key("t1/rabi scan", at, id),
        "t1_rabi_scan_20240309-140507_1234abcd"
    );
}

#[tokio::test]
async fn test_committed_result_round_trips_with_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let probe = MockProbe::new();
    let mut runner = common::mock_runner(&probe, dir.path());
    let job = JobDescriptor::from_yaml_str(&common::odmr_yaml(3, 2, "spread"), None).unwrap();

    let outcome = runner.execute(&job).await.unwrap();
    let c = &outcome.committed;

    // Exactly one dataset plus its metadata, no temp files left behind.
    let files = common::files_in(&dir.path().join("results"));
    assert_eq!(files.len(), 2, "{:?}", files);
    assert!(files.iter().all(|f| !f.ends_with(".tmp")));
    assert_eq!(c.data_path.with_extension("yaml"), c.metadata_path);

    let stored = ResultStore::load_dataset(&c.data_path).unwrap();
    assert_eq!(stored.shape, outcome.dataset.shape);
    assert!(matches!(stored.values, StoredValues::F64(_)));
    assert_eq!(stored.values.to_f64(), outcome.dataset.values);

    let meta = ResultStore::load_metadata(&c.metadata_path).unwrap();
    assert_eq!(meta.job_id, job.id);
    assert_eq!(meta.experiment_type, "odmr");
    assert_eq!(meta.measurement_status, "completed");
    assert_eq!(meta.dynamic_steps, 3);
    assert_eq!(meta.averages, 2);
    assert!(!meta.compress);
    assert!(meta.started_at <= meta.finished_at);
    assert_eq!(meta.descriptor, job.document);
    assert_eq!(
        Some(meta.data_file.as_str()),
        c.data_path.file_name().and_then(|n| n.to_str())
    );

    // The recorded fingerprint is the fingerprint of the file on disk.
    assert_eq!(meta.data_sha256, sha256_file(&c.data_path).unwrap());
    assert_eq!(meta.data_sha256, c.sha256);

    let roles: Vec<&str> = meta.devices.iter().map(|d| d.role.as_str()).collect();
    assert_eq!(roles, vec!["sensor", "synchroniser", "dynamic", "static"]);
}

#[tokio::test]
async fn test_compressed_result_is_stored_as_f32() {
    let dir = tempfile::tempdir().unwrap();
    let probe = MockProbe::new();
    let mut runner = common::mock_runner(&probe, dir.path());
    let text = common::odmr_yaml(2, 1, "sum").replace("  averaging_mode: sum\n", "  averaging_mode: sum\n  compress: true\n");
    let job = JobDescriptor::from_yaml_str(&text, None).unwrap();

    let outcome = runner.execute(&job).await.unwrap();
    let stored = ResultStore::load_dataset(&outcome.committed.data_path).unwrap();
    assert!(matches!(stored.values, StoredValues::F32(_)));
    // Ramp values are small integers, exact in f32.
    assert_eq!(stored.values.to_f64(), outcome.dataset.values);

    let meta = ResultStore::load_metadata(&outcome.committed.metadata_path).unwrap();
    assert!(meta.compress);
}
