use mqlog::commitlog::CommitLog;
use mqlog::config::StoreConfig;
use mqlog::message::Message;
use mqlog::record::{decode_record, DecodeResult, BLANK_MAGIC};
use tempfile::TempDir;

const TEST_SEGMENT_SIZE: usize = 1024;

fn open_log(dir: &TempDir) -> CommitLog {
    let log = CommitLog::new(StoreConfig {
        store_path: dir.path().to_path_buf(),
        segment_size: TEST_SEGMENT_SIZE,
        ..StoreConfig::default()
    })
    .expect("commit log open");
    assert!(log.load());
    log
}

fn put(log: &CommitLog, msg: &mut Message) -> mqlog::AppendMessageResult {
    msg.wait_store_msg_ok = false;
    let result = log.put_message(msg);
    assert!(result.is_ok(), "{:?}", result.status);
    result.append_result.expect("append result")
}

#[test]
fn full_segment_ends_with_blank_trailer() {
    let dir = TempDir::new().expect("tempdir");
    let log = open_log(&dir);

    // One 1010-byte record leaves 14 bytes of tail, too little for any
    // record plus the trailer headroom.
    let first = put(&log, &mut Message::new("T", 0, vec![0xAB; 918]));
    assert_eq!(first.wrote_offset, 0);
    assert_eq!(first.wrote_bytes, 1010);

    let second = put(&log, &mut Message::new("T", 0, b"hello".to_vec()));
    assert_eq!(second.wrote_offset, TEST_SEGMENT_SIZE as u64);
    assert_eq!(second.wrote_bytes, 97);

    // The trailer fills the old segment: total_size = remaining space,
    // blank magic, rest uninterpreted.
    let trailer = log.get_message(1010, 14).expect("trailer read");
    assert_eq!(u32::from_be_bytes(trailer[0..4].try_into().unwrap()), 14);
    assert_eq!(u32::from_be_bytes(trailer[4..8].try_into().unwrap()), BLANK_MAGIC);
    assert!(matches!(decode_record(&trailer, true, true), DecodeResult::EndOfSegment));

    // Both segment files exist under their base-offset names.
    let commitlog_dir = dir.path().join("commitlog");
    assert!(commitlog_dir.join("00000000000000000000").exists());
    assert!(commitlog_dir.join("00000000000000001024").exists());

    assert_eq!(log.min_offset(), 0);
    assert_eq!(log.max_offset(), 1024 + 97);
    assert_eq!(log.roll_next_file(first.wrote_offset), 1024);
}

#[test]
fn records_never_straddle_segments() {
    let dir = TempDir::new().expect("tempdir");
    let log = open_log(&dir);

    // Record length 167 does not divide the segment size, so every segment
    // ends in a trailer.
    for i in 0..30 {
        let mut msg = Message::new("T", 0, vec![i as u8; 75]);
        let appended = put(&log, &mut msg);
        let within = appended.wrote_offset % TEST_SEGMENT_SIZE as u64;
        assert!(
            within as usize + appended.wrote_bytes <= TEST_SEGMENT_SIZE,
            "record at {} crosses a segment boundary",
            appended.wrote_offset
        );
    }

    // Walking the whole log decodes exactly the appended records, hopping
    // segments at each trailer.
    let mut offset = 0u64;
    let mut records = 0;
    while offset < log.max_offset() {
        let data = log.get_data(offset).expect("segment data");
        let mut position = 0usize;
        loop {
            match decode_record(&data[position..], true, true) {
                DecodeResult::Record(req) => {
                    position += req.msg_size;
                    records += 1;
                }
                DecodeResult::EndOfSegment => {
                    offset = log.roll_next_file(offset);
                    break;
                }
                DecodeResult::Invalid => {
                    // Active segment tail: nothing more to read.
                    offset += position as u64;
                    assert_eq!(offset, log.max_offset());
                    break;
                }
            }
            if position >= data.len() {
                offset += position as u64;
                break;
            }
        }
    }
    assert_eq!(records, 30);
}

#[test]
fn queue_offsets_survive_rollover() {
    let dir = TempDir::new().expect("tempdir");
    let log = open_log(&dir);

    let mut last_queue_offset = None;
    for i in 0..20 {
        let appended = put(&log, &mut Message::new("T", 7, vec![0x11; 100]));
        assert_eq!(appended.queue_offset, i as u64);
        last_queue_offset = Some(appended.queue_offset);
    }
    assert_eq!(last_queue_offset, Some(19));
    assert!(log.max_offset() > TEST_SEGMENT_SIZE as u64, "expected a rollover");
}
