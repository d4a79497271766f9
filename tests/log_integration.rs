//! End-to-end tests for the log facade
//!
//! These exercise the public surface the way an embedding host would:
//! write/read round-trips across close and reopen, index and data segment
//! rotation, the vacuum protocol's file lifecycle, tail-following cursors
//! and the single-writer lock.

use seglog::{Config, SegLog, SegLogError};
use tempfile::tempdir;

fn config(dir: &std::path::Path, data_size: i64, index_size: i64) -> Config {
    Config::new(dir)
        .with_data_segment_size(data_size)
        .with_index_segment_size(index_size)
}

/// Simple create -> write -> close -> open -> read round-trip.
#[test]
fn test_write_read_single_across_reopen() {
    let dir = tempdir().unwrap();
    let conf = config(dir.path(), 90, 42);

    let log = SegLog::open(conf.clone()).unwrap();
    let id = log.write_object(b"Hello, World!").unwrap();
    assert_eq!(id, 0);
    log.close().unwrap();

    let log = SegLog::open(conf).unwrap();
    let mut cursor = log.read_objects(0, true);
    assert!(cursor.next());
    assert_eq!(cursor.read_to_vec().unwrap(), b"Hello, World!");
    assert!(!cursor.next());
    assert!(!cursor.next());
    log.close().unwrap();
}

/// With room for exactly one record per index segment, 50 writes must leave
/// 50 index files behind, and a cursor must still walk all of them after a
/// reopen.
#[test]
fn test_write_read_across_index_segments() {
    let dir = tempdir().unwrap();
    let conf = config(dir.path(), 1024, 41 + 3);

    let log = SegLog::open(conf.clone()).unwrap();
    for _ in 0..50 {
        log.write_object(b"Hello, World!").unwrap();
    }
    log.close().unwrap();

    let index_files = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("index"))
        .count();
    assert_eq!(index_files, 50);

    let log = SegLog::open(conf).unwrap();
    let mut cursor = log.read_objects(0, true);
    for i in 0..50 {
        assert!(cursor.next(), "cursor should yield record {i}");
        assert_eq!(cursor.read_to_vec().unwrap(), b"Hello, World!");
    }
    assert!(!cursor.next());
    log.close().unwrap();
}

/// Vacuuming the first half of the records must unlink the oldest data
/// segment.
#[test]
fn test_vacuum_unlinks_leading_data_segments() {
    let dir = tempdir().unwrap();
    let log = SegLog::open(config(dir.path(), 43, 41 + 3)).unwrap();

    for _ in 0..50 {
        log.write_object(b"Hello, World!").unwrap();
    }

    log.vacuum_records(25, true).unwrap();
    assert!(!dir.path().join("data0000").exists());
    log.close().unwrap();
}

/// A record spanning several data segments keeps those segments alive until
/// it is vacuumed itself, and the log keeps working afterwards.
///
/// The first payload takes 298 bytes against 128-byte data segments, so it
/// spans data0000..data0002; the two 25-byte payloads land in data0002.
#[test]
fn test_vacuum_preserves_shared_segments() {
    let dir = tempdir().unwrap();
    let log = SegLog::open(config(dir.path(), 128, 1024)).unwrap();

    let rec0: Vec<u8> = (0..298u32).map(|i| (i % 251) as u8).collect();
    let rec1: Vec<u8> = (0..25u8).map(|i| i.wrapping_mul(7)).collect();
    let rec2: Vec<u8> = (0..25u8).map(|i| i.wrapping_add(100)).collect();
    for payload in [&rec0, &rec1, &rec2] {
        log.write_object(payload).unwrap();
    }

    let read = log.read_object_to_vec(0).unwrap();
    assert_eq!(read, rec0);

    // Record 0 gone: its exclusive segments go, the shared one stays.
    log.vacuum_records(0, true).unwrap();
    assert!(!dir.path().join("data0000").exists());
    assert!(!dir.path().join("data0001").exists());
    assert!(dir.path().join("data0002").exists());

    // Record 1 gone: record 2 still lives in data0002.
    log.vacuum_records(1, true).unwrap();
    assert!(dir.path().join("data0002").exists());

    // Record 2 gone: nothing references data0002 anymore.
    log.vacuum_records(2, true).unwrap();
    assert!(!dir.path().join("data0002").exists());

    // The log is still usable after the full vacuum.
    log.write_object(&rec1).unwrap();
    log.close().unwrap();
}

/// Vacuumed records fail lookups with NotFound; survivors read back intact.
#[test]
fn test_vacuumed_records_are_not_found() {
    let dir = tempdir().unwrap();
    let log = SegLog::open(config(dir.path(), 4096, 4096)).unwrap();

    for i in 0..20 {
        log.write_object(format!("object {i}").as_bytes()).unwrap();
    }
    log.vacuum_records(9, true).unwrap();

    for id in 0..10 {
        match log.read_object(id) {
            Err(SegLogError::NotFound(missing)) => assert_eq!(missing, id),
            other => panic!("expected NotFound for {id}, got {:?}", other.map(|_| ())),
        }
    }
    for id in 10..20 {
        assert_eq!(
            log.read_object_to_vec(id).unwrap(),
            format!("object {id}").into_bytes()
        );
    }
    log.close().unwrap();
}

/// A cursor stalls at the tail and resumes as records arrive, without being
/// recreated.
#[test]
fn test_cursor_follows_tail() {
    let dir = tempdir().unwrap();
    let log = SegLog::open(config(dir.path(), 90, 90)).unwrap();

    let start = log.current_record_id();
    let mut cursor = log.read_objects(start, true);
    assert!(!cursor.next());
    assert!(!cursor.next());

    log.write_object(b"Hello, World!").unwrap();
    assert!(cursor.next());
    assert_eq!(cursor.read_to_vec().unwrap(), b"Hello, World!");
    assert!(!cursor.next());

    log.write_object(b"Hello, World! Again!").unwrap();
    assert!(cursor.next());
    assert_eq!(cursor.read_to_vec().unwrap(), b"Hello, World! Again!");
    log.close().unwrap();
}

fn distinct_payload(i: usize) -> Vec<u8> {
    (0..32).map(|j| (i * 37 + j * 11) as u8).collect()
}

/// An inclusive cursor from the middle yields the record itself onwards.
#[test]
fn test_cursor_from_middle_inclusive() {
    let dir = tempdir().unwrap();
    let log = SegLog::open(config(dir.path(), 1024, 1024)).unwrap();

    for i in 0..10 {
        log.write_object(&distinct_payload(i)).unwrap();
    }

    let mut cursor = log.read_objects(5, true);
    let mut expected = 5;
    while cursor.next() {
        assert_eq!(cursor.offset(), expected);
        assert_eq!(cursor.read_to_vec().unwrap(), distinct_payload(expected as usize));
        expected += 1;
    }
    assert_eq!(expected, 10);
    log.close().unwrap();
}

/// An exclusive cursor from record 5 yields exactly 6..9 in order.
#[test]
fn test_cursor_from_middle_exclusive() {
    let dir = tempdir().unwrap();
    let log = SegLog::open(config(dir.path(), 1024, 1024)).unwrap();

    for i in 0..10 {
        log.write_object(&distinct_payload(i)).unwrap();
    }

    let mut cursor = log.read_objects(5, false);
    let mut expected = 6;
    while cursor.next() {
        assert_eq!(cursor.offset(), expected);
        assert_eq!(cursor.read_to_vec().unwrap(), distinct_payload(expected as usize));
        expected += 1;
    }
    assert_eq!(expected, 10);
    log.close().unwrap();
}

/// A cursor travels the whole log across many segment boundaries.
#[test]
fn test_cursor_travels_across_segments() {
    let dir = tempdir().unwrap();
    let log = SegLog::open(config(dir.path(), 4096, 4096)).unwrap();

    for i in 0..1000 {
        log.write_object(format!("object {i}").as_bytes()).unwrap();
    }

    let mut read = 0;
    let mut cursor = log.read_objects(0, true);
    while cursor.next() {
        assert_eq!(
            cursor.read_to_vec().unwrap(),
            format!("object {read}").into_bytes()
        );
        read += 1;
    }
    assert_eq!(read, 1000);

    // Restart further in: 101..=999 remain.
    let mut read = 0;
    let mut cursor = log.read_objects(100, false);
    while cursor.next() {
        assert_eq!(cursor.offset(), 101 + read);
        read += 1;
    }
    assert_eq!(read, 899);
    log.close().unwrap();
}

/// Counting is exact on an unpurged log, inclusive and exclusive.
#[test]
fn test_count_objects() {
    let dir = tempdir().unwrap();
    let log = SegLog::open(config(dir.path(), 4096, 4096)).unwrap();

    for i in 0..1000 {
        log.write_object(format!("object {i}").as_bytes()).unwrap();
    }

    assert_eq!(log.count_objects(0, true), 1000);
    assert_eq!(log.count_objects(0, false), 999);
    assert_eq!(log.count_objects(49, false), 950);
    assert_eq!(log.count_objects(999, true), 1);
    assert_eq!(log.count_objects(999, false), 0);
    log.close().unwrap();
}

/// A fresh cursor picks up where a drained one left off.
#[test]
fn test_independent_cursors() {
    let dir = tempdir().unwrap();
    let log = SegLog::open(config(dir.path(), 4096, 4096)).unwrap();

    for i in 0..100 {
        log.write_object(format!("object {i}").as_bytes()).unwrap();
    }

    let mut last_offset = 0;
    let mut cursor = log.read_objects(0, true);
    while cursor.next() {
        last_offset = cursor.offset();
    }
    assert_eq!(last_offset, 99);

    for i in 0..100 {
        log.write_object(format!("object {i}").as_bytes()).unwrap();
    }

    let mut read = 0;
    let mut cursor = log.read_objects(last_offset, false);
    while cursor.next() {
        last_offset = cursor.offset();
        read += 1;
    }
    assert_eq!(read, 100);
    assert_eq!(last_offset, 199);
    log.close().unwrap();
}

/// Repeated partial vacuums never disturb the id of the latest record, in
/// the same process or across a reopen.
#[test]
fn test_partial_vacuum_keeps_current_record_id() {
    let dir = tempdir().unwrap();
    let conf = config(dir.path(), 64, 92);

    let log = SegLog::open(conf.clone()).unwrap();
    assert!(log.is_empty());

    for i in 0..1000 {
        log.write_object(format!("object {i}").as_bytes()).unwrap();
    }

    for id in [20, 30, 50, 100] {
        log.vacuum_records(id, true).unwrap();
        assert_eq!(log.current_record_id(), 999);
    }
    log.close().unwrap();

    let log = SegLog::open(conf).unwrap();
    assert_eq!(log.current_record_id(), 999);
    log.vacuum_records(500, true).unwrap();
    assert_eq!(log.current_record_id(), 999);
    log.close().unwrap();
}

/// A payload larger than a whole data segment splits, reads back identical,
/// and survives a reopen.
#[test]
fn test_payload_larger_than_data_segment() {
    let dir = tempdir().unwrap();
    let conf = config(dir.path(), 4096, 4096);

    let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 241) as u8).collect();

    let log = SegLog::open(conf.clone()).unwrap();
    let id = log.write_object(&payload).unwrap();
    assert_eq!(log.read_object_to_vec(id).unwrap(), payload);
    log.close().unwrap();

    // 10000 bytes over 4096-byte segments: data0000..data0002.
    assert!(dir.path().join("data0002").exists());

    let log = SegLog::open(conf).unwrap();
    assert_eq!(log.read_object_to_vec(id).unwrap(), payload);
    log.close().unwrap();
}

/// Empty on creation, non-empty after a write, empty again after vacuuming
/// everything.
#[test]
fn test_is_empty_lifecycle() {
    let dir = tempdir().unwrap();
    let log = SegLog::open(config(dir.path(), 4096, 4096)).unwrap();

    assert!(log.is_empty());

    for i in 0..100 {
        log.write_object(format!("object {i}").as_bytes()).unwrap();
    }
    assert!(!log.is_empty());

    log.vacuum_records(log.current_record_id(), true).unwrap();
    assert!(log.is_empty());
    log.close().unwrap();
}

/// Sequential ids: each append returns the previous current id plus one.
#[test]
fn test_append_returns_sequential_ids() {
    let dir = tempdir().unwrap();
    let log = SegLog::open(config(dir.path(), 1024, 1024)).unwrap();

    assert_eq!(log.write_object(b"first").unwrap(), 0);
    for expected in 1..20 {
        let before = log.current_record_id();
        let id = log.write_object(b"next").unwrap();
        assert_eq!(id, before + 1);
        assert_eq!(id, expected);
    }
    log.close().unwrap();
}

/// The work directory admits a single live log at a time.
#[test]
fn test_second_open_fails_lock_held() {
    let dir = tempdir().unwrap();
    let conf = config(dir.path(), 1024, 1024);

    let log = SegLog::open(conf.clone()).unwrap();
    match SegLog::open(conf.clone()) {
        Err(SegLogError::LockHeld(pid)) => assert_eq!(pid, std::process::id()),
        other => panic!("expected LockHeld, got {:?}", other.map(|_| ())),
    }

    // Closing releases the directory for the next instance.
    log.close().unwrap();
    let log = SegLog::open(conf).unwrap();
    log.close().unwrap();
}
