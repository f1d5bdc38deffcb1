use pulselab::journal::{decode_frames, read_journal, EntryKind, Journal};
use uuid::Uuid;

/// The raw bytes of a journal holding `entries`.
fn journal_bytes(entries: &[(EntryKind, &str)]) -> Vec<u8> {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("j.log");
    let mut j = Journal::open(&path).unwrap();
    for (kind, detail) in entries {
        j.append(*kind, None, *detail).unwrap();
    }
    drop(j);
    std::fs::read(&path).unwrap()
}

#[test]
fn test_append_and_read_back() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("journal.log");
    let id = Uuid::new_v4();

    let mut j = Journal::open(&path).unwrap();
    j.append(EntryKind::Accepted, Some(id), "inbox/a.yaml").unwrap();
    j.append(EntryKind::Started, Some(id), "odmr").unwrap();
    j.note(EntryKind::Completed, Some(id), "results/odmr.bin");
    drop(j);

    let records = read_journal(&path).unwrap();
    assert_eq!(records.len(), 3);
    assert_eq!(records[0].kind, EntryKind::Accepted);
    assert_eq!(records[0].detail, "inbox/a.yaml");
    assert_eq!(records[2].kind, EntryKind::Completed);
    assert!(records.iter().all(|r| r.job_id == Some(id)));
    assert!(records.windows(2).all(|w| w[0].ts_ms <= w[1].ts_ms));
}

#[test]
fn test_reopen_appends() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("journal.log");
    Journal::open(&path)
        .unwrap()
        .append(EntryKind::LabStarted, None, "first")
        .unwrap();
    Journal::open(&path)
        .unwrap()
        .append(EntryKind::LabStarted, None, "second")
        .unwrap();

    let details: Vec<String> = read_journal(&path)
        .unwrap()
        .into_iter()
        .map(|r| r.detail)
        .collect();
    assert_eq!(details, vec!["first", "second"]);
}

#[test]
fn test_missing_journal_is_empty() {
    let dir = tempfile::tempdir().unwrap();
    assert!(read_journal(dir.path().join("nope.log")).unwrap().is_empty());
}

#[test]
fn test_corrupted_body_is_skipped() {
    let one = journal_bytes(&[(EntryKind::Accepted, "one")]);
    let two = journal_bytes(&[(EntryKind::Started, "two")]);
    let three = journal_bytes(&[(EntryKind::Completed, "three")]);

    let mut bytes = one.clone();
    let mut damaged = two.clone();
    let last = damaged.len() - 1;
    damaged[last] ^= 0xFF;
    bytes.extend_from_slice(&damaged);
    bytes.extend_from_slice(&three);

    let details: Vec<String> = decode_frames(&bytes).into_iter().map(|r| r.detail).collect();
    assert_eq!(details, vec!["one", "three"]);
}

#[test]
fn test_garbage_between_frames_resyncs() {
    let one = journal_bytes(&[(EntryKind::Rejected, "one")]);
    let two = journal_bytes(&[(EntryKind::Failed, "two")]);

    let mut bytes = one;
    bytes.extend_from_slice(b"@@@@ not a frame @@@@");
    bytes.extend_from_slice(&two);

    let kinds: Vec<EntryKind> = decode_frames(&bytes).into_iter().map(|r| r.kind).collect();
    assert_eq!(kinds, vec![EntryKind::Rejected, EntryKind::Failed]);
}

#[test]
fn test_torn_tail_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("journal.log");
    let mut j = Journal::open(&path).unwrap();
    j.append(EntryKind::Started, None, "kept").unwrap();
    j.append(EntryKind::Completed, None, "torn away").unwrap();
    drop(j);

    let bytes = std::fs::read(&path).unwrap();
    std::fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();

    let records = read_journal(&path).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].detail, "kept");
}
