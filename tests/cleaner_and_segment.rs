//! Black-box coverage across the segment log, offset index, and cleaner
//! that exercises them the way an external caller (not `#[cfg(test)]` code
//! living next to the implementation) would: create a log on disk, write to
//! it, clean it, and reopen it from scratch to make sure the atomic swap
//! left a consistent, reloadable result behind.

use std::time::Duration;

use broker_core::cleaner::{Cleaner, CleanerOptions, Partition};
use broker_core::index::OffsetIndex;
use broker_core::segment::FileSegmentLog;
use broker_core::{Compression, Record};
use bytes::Bytes;
use tempfile::TempDir;

fn enable_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn record(offset: u64, key: &str, value: Option<&str>) -> Record {
    Record {
        offset,
        timestamp: offset as i64,
        key: Some(Bytes::copy_from_slice(key.as_bytes())),
        value: value.map(|v| Bytes::copy_from_slice(v.as_bytes())),
        compression: Compression::None,
    }
}

#[test]
fn cleaned_log_survives_a_process_restart() {
    enable_logging();
    let dir = TempDir::new().unwrap();

    {
        let log = FileSegmentLog::open(dir.path(), 0).unwrap();
        log.append(0, record(0, "user:1", Some("v1"))).unwrap();
        log.append(1, record(1, "user:2", Some("v1"))).unwrap();
        log.append(2, record(2, "user:1", Some("v2"))).unwrap();
        log.append(3, record(3, "user:3", Some("v1"))).unwrap();
        log.roll(4).unwrap();

        let cleaner = Cleaner::new(CleanerOptions::default());
        let outcome = cleaner
            .clean(&log, &Partition::new("users", 0), 0, || Ok(()))
            .unwrap();
        assert_eq!(outcome.end_offset, 4);
    }

    // Reopening from an empty in-memory state must reconstruct the same
    // directory-of-segments view the cleaner left behind.
    let reopened = FileSegmentLog::open(dir.path(), 0).unwrap();
    let records: Vec<_> = reopened
        .segment(0)
        .unwrap()
        .iter_from_start()
        .unwrap()
        .map(|r| r.unwrap().1)
        .collect();

    let keys: Vec<String> = records
        .iter()
        .map(|r| String::from_utf8(r.key.clone().unwrap().to_vec()).unwrap())
        .collect();
    assert_eq!(keys, vec!["user:2", "user:1", "user:3"]);
}

#[test]
fn offset_index_reopen_preserves_lookups_across_a_flush() {
    enable_logging();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("00000000000000000000.index");

    {
        let index = OffsetIndex::create(&path, 0, 16 * 1024).unwrap();
        index.append(0, 0).unwrap();
        index.append(10, 512).unwrap();
        index.append(25, 1200).unwrap();
        index.flush().unwrap();
    }

    let reopened = OffsetIndex::open(&path, 0, 3).unwrap();
    assert_eq!(reopened.lookup(24), (10, 512));
    assert_eq!(reopened.lookup(30), (25, 1200));
    reopened.sanity_check().unwrap();
}

#[test]
fn tombstone_past_retention_is_dropped_on_a_later_cycle() {
    enable_logging();
    let dir = TempDir::new().unwrap();
    let log = FileSegmentLog::open(dir.path(), 0).unwrap();

    // Segment 0 is the already-clean prefix the delete horizon is computed
    // from; segment 1 holds the tombstone and must look old enough, relative
    // to segment 0's mtime minus the retention window, to fall outside it.
    log.append(0, record(0, "other", Some("v"))).unwrap();
    log.roll(1).unwrap();
    log.append(1, record(1, "k", Some("v"))).unwrap();
    log.append(2, record(2, "k", None)).unwrap();
    log.roll(3).unwrap();

    let old_mtime = std::time::SystemTime::now() - Duration::from_secs(2 * 24 * 60 * 60);
    let file = std::fs::File::options().write(true).open(log.segment(1).unwrap().path()).unwrap();
    file.set_modified(old_mtime).unwrap();

    let cleaner = Cleaner::new(CleanerOptions::default());
    let outcome = cleaner
        .clean(&log, &Partition::new("t", 0), 1, || Ok(()))
        .unwrap();
    assert_eq!(outcome.end_offset, 3);

    // Segments 0 and 1 are in the same cleaned group and get merged into a
    // single replacement rooted at 0; segment 1's own file is gone.
    assert!(log.segment(1).is_err());
    let remaining: Vec<_> = log
        .segment(0)
        .unwrap()
        .iter_from_start()
        .unwrap()
        .map(|r| r.unwrap().1)
        .collect();
    let keys: Vec<String> = remaining
        .iter()
        .map(|r| String::from_utf8(r.key.clone().unwrap().to_vec()).unwrap())
        .collect();
    assert_eq!(keys, vec!["other"], "the superseded value and the expired tombstone should both be gone");
}
