//! On-disk record codec.
//!
//! A record is a variable-length frame written contiguously into a segment.
//! All multi-byte integers are big-endian, strings UTF-8. Field order:
//!
//! ```text
//! offset  width  field
//!      0      4  total_size          frame length, sum of all fields
//!      4      4  magic               MESSAGE_MAGIC, or BLANK_MAGIC for filler
//!      8      4  body_crc            CRC-32 (IEEE) of the body bytes
//!     12      4  queue_id
//!     16      4  flag
//!     20      8  queue_offset
//!     28      8  physical_offset     absolute offset this record starts at
//!     36      4  sys_flag
//!     40      8  born_timestamp
//!     48      8  born_host           IPv4 + port
//!     56      8  store_timestamp
//!     64      8  store_host          IPv4 + port
//!     72      4  reconsume_times
//!     76      8  prep_txn_offset
//!     84    4+N  body_len, body
//!          1+M  topic_len, topic     M <= 255
//!          2+P  props_len, props     P <= 32767
//! ```
//!
//! When the active segment cannot hold `total_size + 8` more bytes, a blank
//! trailer is written instead: only `total_size` (= remaining space) and
//! `magic` (= `BLANK_MAGIC`); decoders skip to the next segment.

use std::collections::HashMap;

use log::{debug, warn};

use crate::dispatch::DispatchRequest;
use crate::message::{
    string_to_properties, tags_code, Message, PROPERTY_KEYS, PROPERTY_TAGS, PROPERTY_UNIQ_KEY,
};

/// Magic marking a real record. The expression is the wire contract;
/// evaluated with wrapping 32-bit arithmetic.
pub const MESSAGE_MAGIC: u32 = 0xAABB_CCDDu32 ^ 1_880_681_586u32.wrapping_add(8);
/// Magic marking the blank trailer at the end of a full segment.
pub const BLANK_MAGIC: u32 = 0xBBCC_DDEEu32 ^ 1_880_681_586u32.wrapping_add(8);

/// A segment always keeps room for at least a trailer header.
pub const END_OF_SEGMENT_MIN_BLANK: usize = 8;

/// Fixed-position fields used by cheap peeks.
pub const MAGIC_POSITION: usize = 4;
pub const STORE_TIMESTAMP_POSITION: usize = 56;

/// Byte length of everything before the body bytes.
const BODY_POSITION: usize = 88;

/// Exact frame length of a record with the given variable-part sizes.
pub fn encode_length(body_len: usize, topic_len: usize, props_len: usize) -> usize {
    4 // total_size
        + 4 // magic
        + 4 // body_crc
        + 4 // queue_id
        + 4 // flag
        + 8 // queue_offset
        + 8 // physical_offset
        + 4 // sys_flag
        + 8 // born_timestamp
        + 8 // born_host
        + 8 // store_timestamp
        + 8 // store_host
        + 4 // reconsume_times
        + 8 // prep_txn_offset
        + 4 + body_len
        + 1 + topic_len
        + 2 + props_len
}

/// Outcome of decoding one frame.
#[derive(Debug)]
pub enum DecodeResult {
    /// A valid record, fully parsed; the decoder consumed exactly
    /// `total_size` bytes.
    Record(DispatchRequest),
    /// The blank trailer; the rest of the segment carries no records.
    EndOfSegment,
    /// Unknown magic, a size/length mismatch, or a CRC failure. During
    /// recovery this means end-of-log.
    Invalid,
}

/// Reusable frame encoder. The append path owns one and rewrites its
/// scratch buffer per record, under the writer lock.
#[derive(Default)]
pub struct RecordEncoder {
    buf: Vec<u8>,
}

impl RecordEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encodes one record frame and returns the scratch buffer holding it.
    ///
    /// `properties` is the pre-encoded property string; the caller has
    /// already validated its length and computed `body_crc` on the message.
    pub fn encode(
        &mut self,
        msg: &Message,
        queue_offset: u64,
        physical_offset: u64,
        properties: &[u8],
    ) -> &[u8] {
        let topic = msg.topic.as_bytes();
        let total_size = encode_length(msg.body.len(), topic.len(), properties.len());

        self.buf.clear();
        self.buf.reserve(total_size);
        self.buf.extend_from_slice(&(total_size as u32).to_be_bytes());
        self.buf.extend_from_slice(&MESSAGE_MAGIC.to_be_bytes());
        self.buf.extend_from_slice(&msg.body_crc.to_be_bytes());
        self.buf.extend_from_slice(&msg.queue_id.to_be_bytes());
        self.buf.extend_from_slice(&msg.flag.to_be_bytes());
        self.buf.extend_from_slice(&queue_offset.to_be_bytes());
        self.buf.extend_from_slice(&physical_offset.to_be_bytes());
        self.buf.extend_from_slice(&msg.sys_flag.to_be_bytes());
        self.buf.extend_from_slice(&msg.born_timestamp.to_be_bytes());
        self.buf
            .extend_from_slice(&crate::message::host_to_bytes(&msg.born_host));
        self.buf.extend_from_slice(&msg.store_timestamp.to_be_bytes());
        self.buf
            .extend_from_slice(&crate::message::host_to_bytes(&msg.store_host));
        self.buf.extend_from_slice(&msg.reconsume_times.to_be_bytes());
        self.buf
            .extend_from_slice(&msg.prepared_transaction_offset.to_be_bytes());
        self.buf
            .extend_from_slice(&(msg.body.len() as u32).to_be_bytes());
        self.buf.extend_from_slice(&msg.body);
        self.buf.push(topic.len() as u8);
        self.buf.extend_from_slice(topic);
        self.buf
            .extend_from_slice(&(properties.len() as u16).to_be_bytes());
        self.buf.extend_from_slice(properties);

        debug_assert_eq!(self.buf.len(), total_size);
        &self.buf
    }

    /// Writes the two-field blank trailer into `region`.
    pub fn encode_blank(region: &mut [u8], remaining: usize) {
        region[0..4].copy_from_slice(&(remaining as u32).to_be_bytes());
        region[4..8].copy_from_slice(&BLANK_MAGIC.to_be_bytes());
    }
}

/// Decodes one frame starting at `buf[0]`.
///
/// `check_crc` recomputes the body CRC (only meaningful with `read_body`);
/// `read_body` controls whether body bytes are validated against the CRC or
/// merely skipped.
pub fn decode_record(buf: &[u8], check_crc: bool, read_body: bool) -> DecodeResult {
    match parse_record(buf, check_crc, read_body) {
        Some(result) => result,
        None => {
            debug!("record frame truncated or inconsistent, treating as invalid");
            DecodeResult::Invalid
        }
    }
}

/// Checked parse; `None` is any structural failure (short buffer, lengths
/// that do not add up).
fn parse_record(buf: &[u8], check_crc: bool, read_body: bool) -> Option<DecodeResult> {
    let mut cursor = Cursor::new(buf);

    let total_size = cursor.read_u32()? as usize;
    let magic = cursor.read_u32()?;
    match magic {
        MESSAGE_MAGIC => {}
        BLANK_MAGIC => return Some(DecodeResult::EndOfSegment),
        other => {
            debug!("unknown record magic {other:#010x}");
            return Some(DecodeResult::Invalid);
        }
    }

    if total_size < encode_length(0, 0, 0) || total_size > buf.len() {
        debug!("record total_size {total_size} out of bounds (buffer {})", buf.len());
        return Some(DecodeResult::Invalid);
    }

    let body_crc = cursor.read_u32()?;
    let queue_id = cursor.read_i32()?;
    let _flag = cursor.read_i32()?;
    let queue_offset = cursor.read_u64()?;
    let physical_offset = cursor.read_u64()?;
    let sys_flag = cursor.read_i32()?;
    let _born_timestamp = cursor.read_u64()?;
    let _born_host = cursor.read_bytes(8)?;
    let store_timestamp = cursor.read_u64()?;
    let _store_host = cursor.read_bytes(8)?;
    let _reconsume_times = cursor.read_i32()?;
    let prepared_transaction_offset = cursor.read_u64()?;

    let body_len = cursor.read_u32()? as usize;
    if read_body {
        let body = cursor.read_bytes(body_len)?;
        if check_crc {
            let crc = crc32fast::hash(body);
            if crc != body_crc {
                warn!(
                    "body CRC mismatch at physical offset {physical_offset}: stored {body_crc:#010x}, computed {crc:#010x}"
                );
                return Some(DecodeResult::Invalid);
            }
        }
    } else {
        cursor.skip(body_len)?;
    }

    let topic_len = cursor.read_u8()? as usize;
    let topic = std::str::from_utf8(cursor.read_bytes(topic_len)?).ok()?;

    let props_len = cursor.read_u16()? as usize;
    let properties: HashMap<String, String> = if props_len > 0 {
        let raw = std::str::from_utf8(cursor.read_bytes(props_len)?).ok()?;
        string_to_properties(raw)
    } else {
        HashMap::new()
    };

    let computed = encode_length(body_len, topic_len, props_len);
    if computed != total_size {
        warn!(
            "record length mismatch at physical offset {physical_offset}: total_size {total_size}, fields add to {computed}"
        );
        return Some(DecodeResult::Invalid);
    }

    let keys = properties.get(PROPERTY_KEYS).cloned().unwrap_or_default();
    let uniq_key = properties.get(PROPERTY_UNIQ_KEY).cloned();
    let tags = properties
        .get(PROPERTY_TAGS)
        .map(|t| tags_code(t))
        .unwrap_or(0);

    Some(DecodeResult::Record(DispatchRequest {
        topic: topic.to_string(),
        queue_id,
        commit_log_offset: physical_offset,
        msg_size: total_size,
        tags_code: tags,
        store_timestamp,
        consume_queue_offset: queue_offset,
        keys,
        uniq_key,
        sys_flag,
        prepared_transaction_offset,
        properties,
    }))
}

/// Reads the store timestamp at its fixed position without a full decode.
pub fn peek_store_timestamp(buf: &[u8]) -> Option<u64> {
    let raw = buf.get(STORE_TIMESTAMP_POSITION..STORE_TIMESTAMP_POSITION + 8)?;
    Some(u64::from_be_bytes(raw.try_into().ok()?))
}

/// Reads the magic at its fixed position.
pub fn peek_magic(buf: &[u8]) -> Option<u32> {
    let raw = buf.get(MAGIC_POSITION..MAGIC_POSITION + 4)?;
    Some(u32::from_be_bytes(raw.try_into().ok()?))
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn read_bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        let slice = self.buf.get(self.pos..self.pos.checked_add(len)?)?;
        self.pos += len;
        Some(slice)
    }

    fn skip(&mut self, len: usize) -> Option<()> {
        let end = self.pos.checked_add(len)?;
        if end > self.buf.len() {
            return None;
        }
        self.pos = end;
        Some(())
    }

    fn read_u8(&mut self) -> Option<u8> {
        self.read_bytes(1).map(|b| b[0])
    }

    fn read_u16(&mut self) -> Option<u16> {
        self.read_bytes(2)
            .map(|b| u16::from_be_bytes(b.try_into().expect("slice length")))
    }

    fn read_u32(&mut self) -> Option<u32> {
        self.read_bytes(4)
            .map(|b| u32::from_be_bytes(b.try_into().expect("slice length")))
    }

    fn read_i32(&mut self) -> Option<i32> {
        self.read_bytes(4)
            .map(|b| i32::from_be_bytes(b.try_into().expect("slice length")))
    }

    fn read_u64(&mut self) -> Option<u64> {
        self.read_bytes(8)
            .map(|b| u64::from_be_bytes(b.try_into().expect("slice length")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn sample_message() -> Message {
        let mut msg = Message::new("T", 3, b"hello".to_vec());
        msg.born_host = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 4000);
        msg.store_host = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 10911);
        msg.born_timestamp = 1_700_000_000_000;
        msg.store_timestamp = 1_700_000_000_123;
        msg.body_crc = crc32fast::hash(b"hello");
        msg
    }

    #[test]
    fn magic_constants_match_reference_expressions() {
        assert_eq!(MESSAGE_MAGIC, 0xAABB_CCDDu32 ^ 1_880_681_586u32.wrapping_add(8));
        assert_eq!(BLANK_MAGIC, 0xBBCC_DDEEu32 ^ 1_880_681_586u32.wrapping_add(8));
        assert_eq!(MESSAGE_MAGIC, 0xDAA3_20A7);
        assert_eq!(BLANK_MAGIC, 0xCBD4_3194);
    }

    #[test]
    fn encode_length_reference_value() {
        // body "hello", topic "T", no properties.
        assert_eq!(encode_length(5, 1, 0), 97);
        assert_eq!(encode_length(0, 0, 0), 91);
    }

    #[test]
    fn encode_decode_round_trip() {
        let msg = sample_message();
        let mut encoder = RecordEncoder::new();
        let frame = encoder.encode(&msg, 7, 4096, b"").to_vec();
        assert_eq!(frame.len(), 97);

        match decode_record(&frame, true, true) {
            DecodeResult::Record(req) => {
                assert_eq!(req.topic, "T");
                assert_eq!(req.queue_id, 3);
                assert_eq!(req.consume_queue_offset, 7);
                assert_eq!(req.commit_log_offset, 4096);
                assert_eq!(req.msg_size, 97);
                assert_eq!(req.store_timestamp, 1_700_000_000_123);
                assert_eq!(req.sys_flag, 0);
            }
            other => panic!("expected record, got {other:?}"),
        }
    }

    #[test]
    fn decode_consumes_exactly_total_size() {
        let msg = sample_message();
        let mut encoder = RecordEncoder::new();
        let mut bytes = encoder.encode(&msg, 0, 0, b"").to_vec();
        // Trailing garbage past the frame must not affect the parse.
        bytes.extend_from_slice(&[0xFF; 32]);

        match decode_record(&bytes, true, true) {
            DecodeResult::Record(req) => assert_eq!(req.msg_size, 97),
            other => panic!("expected record, got {other:?}"),
        }
    }

    #[test]
    fn blank_trailer_decodes_as_end_of_segment() {
        let mut region = vec![0u8; 64];
        RecordEncoder::encode_blank(&mut region, 14);
        assert!(matches!(
            decode_record(&region, true, true),
            DecodeResult::EndOfSegment
        ));
    }

    #[test]
    fn unknown_magic_is_invalid() {
        let mut frame = vec![0u8; 97];
        frame[0..4].copy_from_slice(&97u32.to_be_bytes());
        frame[4..8].copy_from_slice(&0xDEAD_BEEFu32.to_be_bytes());
        assert!(matches!(decode_record(&frame, true, true), DecodeResult::Invalid));

        // A zeroed region (fresh segment tail) reads as magic 0.
        let zeroes = vec![0u8; 97];
        assert!(matches!(decode_record(&zeroes, true, true), DecodeResult::Invalid));
    }

    #[test]
    fn crc_mismatch_is_invalid() {
        let msg = sample_message();
        let mut encoder = RecordEncoder::new();
        let mut frame = encoder.encode(&msg, 0, 0, b"").to_vec();
        frame[BODY_POSITION] ^= 0xFF;

        assert!(matches!(decode_record(&frame, true, true), DecodeResult::Invalid));
        // Without CRC checking the flip goes unnoticed.
        assert!(matches!(decode_record(&frame, false, true), DecodeResult::Record(_)));
    }

    #[test]
    fn length_mismatch_is_invalid() {
        let msg = sample_message();
        let mut encoder = RecordEncoder::new();
        let mut frame = encoder.encode(&msg, 0, 0, b"").to_vec();
        // Zero the topic length; the field sum no longer matches total_size.
        frame[BODY_POSITION + 5] = 0;

        assert!(matches!(decode_record(&frame, false, false), DecodeResult::Invalid));
    }

    #[test]
    fn truncated_frame_is_invalid() {
        let msg = sample_message();
        let mut encoder = RecordEncoder::new();
        let frame = encoder.encode(&msg, 0, 0, b"").to_vec();
        assert!(matches!(
            decode_record(&frame[..frame.len() - 10], true, true),
            DecodeResult::Invalid
        ));
        assert!(matches!(decode_record(&frame[..6], true, true), DecodeResult::Invalid));
    }

    #[test]
    fn peeks_read_fixed_positions() {
        let msg = sample_message();
        let mut encoder = RecordEncoder::new();
        let frame = encoder.encode(&msg, 0, 0, b"").to_vec();
        assert_eq!(peek_store_timestamp(&frame), Some(1_700_000_000_123));
        assert_eq!(peek_magic(&frame), Some(MESSAGE_MAGIC));
    }

    #[test]
    fn dispatch_fields_from_properties() {
        let mut msg = sample_message();
        msg.properties.insert("KEYS".into(), "k1".into());
        msg.properties.insert("UNIQ_KEY".into(), "u1".into());
        msg.properties.insert("TAGS".into(), "TagA".into());
        let props = crate::message::properties_to_string(&msg.properties);

        let mut encoder = RecordEncoder::new();
        let frame = encoder.encode(&msg, 0, 0, props.as_bytes()).to_vec();
        match decode_record(&frame, true, true) {
            DecodeResult::Record(req) => {
                assert_eq!(req.keys, "k1");
                assert_eq!(req.uniq_key.as_deref(), Some("u1"));
                assert_eq!(req.tags_code, 2598919);
            }
            other => panic!("expected record, got {other:?}"),
        }
    }
}
