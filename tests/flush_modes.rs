use std::time::{Duration, Instant};

use mqlog::commitlog::{CommitLog, PutMessageStatus};
use mqlog::config::{FlushDiskType, StoreConfig};
use mqlog::message::Message;
use tempfile::TempDir;

const TEST_SEGMENT_SIZE: usize = 64 * 1024;

fn store_config(dir: &TempDir) -> StoreConfig {
    StoreConfig {
        store_path: dir.path().to_path_buf(),
        segment_size: TEST_SEGMENT_SIZE,
        ..StoreConfig::default()
    }
}

fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
    let begin = Instant::now();
    while begin.elapsed() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    done()
}

#[test]
fn sync_flush_confirms_durability() {
    let dir = TempDir::new().expect("tempdir");
    let log = CommitLog::new(StoreConfig {
        flush_disk_type: FlushDiskType::SyncFlush,
        ..store_config(&dir)
    })
    .expect("commit log open");
    assert!(log.load());
    log.start().expect("services");

    let mut msg = Message::new("T", 0, b"durable".to_vec());
    let result = log.put_message(&mut msg);
    assert_eq!(result.status, PutMessageStatus::PutOk);

    let appended = result.append_result.expect("append result");
    assert!(log.flushed_where() >= appended.wrote_offset + appended.wrote_bytes as u64);

    log.shutdown();
}

#[test]
fn sync_flush_timeout_reports_but_keeps_record() {
    let dir = TempDir::new().expect("tempdir");
    let timeout_ms = 300u64;
    let log = CommitLog::new(StoreConfig {
        flush_disk_type: FlushDiskType::SyncFlush,
        sync_flush_timeout_ms: timeout_ms,
        ..store_config(&dir)
    })
    .expect("commit log open");
    assert!(log.load());
    // Services intentionally not started: the flush can never happen.

    let mut msg = Message::new("T", 0, b"stuck".to_vec());
    let begin = Instant::now();
    let result = log.put_message(&mut msg);
    let elapsed = begin.elapsed();

    assert_eq!(result.status, PutMessageStatus::FlushDiskTimeout);
    assert!(elapsed >= Duration::from_millis(timeout_ms));
    assert!(elapsed < Duration::from_millis(timeout_ms + 500), "{elapsed:?}");

    // The record is written and readable even though durability was never
    // confirmed.
    let appended = result.append_result.expect("append result");
    let frame = log
        .get_message(appended.wrote_offset, appended.wrote_bytes)
        .expect("mapped read");
    assert_eq!(frame.len(), appended.wrote_bytes);
    assert_eq!(log.flushed_where(), 0);
}

#[test]
fn sync_mode_flushes_non_waiting_messages_eventually() {
    let dir = TempDir::new().expect("tempdir");
    let log = CommitLog::new(StoreConfig {
        flush_disk_type: FlushDiskType::SyncFlush,
        ..store_config(&dir)
    })
    .expect("commit log open");
    assert!(log.load());
    log.start().expect("services");

    let mut msg = Message::new("T", 0, b"fire-and-forget".to_vec());
    msg.wait_store_msg_ok = false;
    let result = log.put_message(&mut msg);
    assert_eq!(result.status, PutMessageStatus::PutOk);
    let end = log.max_offset();

    assert!(
        wait_until(Duration::from_secs(5), || log.flushed_where() >= end),
        "group commit never flushed the non-waiting record"
    );
    log.shutdown();
}

#[test]
fn async_flush_catches_up_in_background() {
    let dir = TempDir::new().expect("tempdir");
    let log = CommitLog::new(StoreConfig {
        flush_interval_ms: 10,
        // Force the thorough path quickly; a single small record never
        // reaches the least-pages threshold.
        flush_thorough_interval_ms: 50,
        ..store_config(&dir)
    })
    .expect("commit log open");
    assert!(log.load());
    log.start().expect("services");

    let mut msg = Message::new("T", 0, b"async".to_vec());
    msg.wait_store_msg_ok = false;
    let result = log.put_message(&mut msg);
    assert_eq!(result.status, PutMessageStatus::PutOk);
    let end = log.max_offset();

    assert!(
        wait_until(Duration::from_secs(5), || log.flushed_where() >= end),
        "async flush never caught up"
    );
    log.shutdown();
}

#[test]
fn transient_pool_commits_then_flushes() {
    let dir = TempDir::new().expect("tempdir");
    let log = CommitLog::new(StoreConfig {
        transient_store_pool_enable: true,
        flush_interval_ms: 10,
        flush_thorough_interval_ms: 50,
        commit_interval_ms: 10,
        commit_thorough_interval_ms: 50,
        ..store_config(&dir)
    })
    .expect("commit log open");
    assert!(log.load());
    log.start().expect("services");

    let mut msg = Message::new("T", 0, b"buffered".to_vec());
    msg.wait_store_msg_ok = false;
    let result = log.put_message(&mut msg);
    assert_eq!(result.status, PutMessageStatus::PutOk);
    let appended = result.append_result.expect("append result");
    let end = appended.wrote_offset + appended.wrote_bytes as u64;

    // Bytes become readable once the commit service copies them into the
    // mapped region, and durable once the flusher runs behind it.
    assert!(
        wait_until(Duration::from_secs(5), || {
            log.get_message(appended.wrote_offset, appended.wrote_bytes)
                .is_some()
        }),
        "commit service never staged the record"
    );
    assert!(
        wait_until(Duration::from_secs(5), || log.flushed_where() >= end),
        "flush never ran behind the commit"
    );
    log.shutdown();
}

#[test]
fn shutdown_drains_dirty_pages() {
    let dir = TempDir::new().expect("tempdir");
    let log = CommitLog::new(StoreConfig {
        // Long intervals: only the shutdown drain can flush in time.
        flush_interval_ms: 60_000,
        flush_thorough_interval_ms: 600_000,
        ..store_config(&dir)
    })
    .expect("commit log open");
    assert!(log.load());
    log.start().expect("services");

    let mut msg = Message::new("T", 0, b"last words".to_vec());
    msg.wait_store_msg_ok = false;
    log.put_message(&mut msg);
    let end = log.max_offset();

    log.shutdown();
    assert!(log.flushed_where() >= end);
}
