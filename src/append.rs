//! The append callback: turns one message into one record (or the blank
//! trailer) inside the writable region handed over by the active segment,
//! and owns the per-queue tail table.

use std::collections::HashMap;
use std::time::Instant;

use crate::message::{
    create_message_id, properties_to_string, transaction_type, Message, TRANSACTION_COMMIT_TYPE,
    TRANSACTION_NOT_TYPE, TRANSACTION_PREPARED_TYPE, TRANSACTION_ROLLBACK_TYPE,
};
use crate::record::{encode_length, RecordEncoder, END_OF_SEGMENT_MIN_BLANK};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendMessageStatus {
    PutOk,
    /// The segment could not hold the record; a blank trailer was written
    /// and the caller must retry on a fresh segment.
    EndOfFile,
    MessageSizeExceeded,
    PropertiesSizeExceeded,
    UnknownError,
}

/// Outcome of one append callback invocation.
#[derive(Debug, Clone)]
pub struct AppendMessageResult {
    pub status: AppendMessageStatus,
    /// Physical offset the record (or trailer) was written at.
    pub wrote_offset: u64,
    pub wrote_bytes: usize,
    pub msg_id: String,
    pub store_timestamp: u64,
    pub queue_offset: u64,
    pub elapsed_ms: u64,
}

impl AppendMessageResult {
    pub fn error(status: AppendMessageStatus) -> Self {
        Self {
            status,
            wrote_offset: 0,
            wrote_bytes: 0,
            msg_id: String::new(),
            store_timestamp: 0,
            queue_offset: 0,
            elapsed_ms: 0,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == AppendMessageStatus::PutOk
    }
}

/// Invoked by a segment with the writable region starting at the segment's
/// current write position. Implementations write exactly one record or one
/// blank trailer.
pub trait AppendCallback {
    fn do_append(
        &mut self,
        wrote_offset: u64,
        region: &mut [u8],
        msg: &Message,
    ) -> AppendMessageResult;
}

/// The default callback: record framing plus queue-offset assignment.
///
/// Accessed only inside the writer critical section and during recovery
/// replay, so the tail table needs no further synchronization of its own.
pub struct RecordAppender {
    max_message_size: usize,
    encoder: RecordEncoder,
    topic_queue_table: HashMap<String, u64>,
}

impl RecordAppender {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            max_message_size,
            encoder: RecordEncoder::new(),
            topic_queue_table: HashMap::new(),
        }
    }

    fn queue_key(topic: &str, queue_id: i32) -> String {
        format!("{topic}-{queue_id}")
    }

    /// Next queue offset that would be assigned for `(topic, queue_id)`.
    pub fn next_queue_offset(&self, topic: &str, queue_id: i32) -> u64 {
        self.topic_queue_table
            .get(&Self::queue_key(topic, queue_id))
            .copied()
            .unwrap_or(0)
    }

    /// Bumps the tail to at least `next`; recovery replays records through
    /// this so appends resume where the log left off.
    pub fn advance_queue_tail(&mut self, topic: &str, queue_id: i32, next: u64) {
        let tail = self
            .topic_queue_table
            .entry(Self::queue_key(topic, queue_id))
            .or_insert(0);
        if next > *tail {
            *tail = next;
        }
    }
}

impl AppendCallback for RecordAppender {
    fn do_append(
        &mut self,
        wrote_offset: u64,
        region: &mut [u8],
        msg: &Message,
    ) -> AppendMessageResult {
        let begin = Instant::now();

        let key = Self::queue_key(&msg.topic, msg.queue_id);
        let tran_type = transaction_type(msg.sys_flag);
        // Prepared and rollback records are invisible to consumers and do
        // not occupy a consume-queue slot.
        let queue_offset = match tran_type {
            TRANSACTION_PREPARED_TYPE | TRANSACTION_ROLLBACK_TYPE => 0,
            _ => self.topic_queue_table.get(&key).copied().unwrap_or(0),
        };

        let properties = properties_to_string(&msg.properties);
        if properties.len() > i16::MAX as usize {
            return AppendMessageResult::error(AppendMessageStatus::PropertiesSizeExceeded);
        }

        let topic_len = msg.topic.as_bytes().len();
        let msg_len = encode_length(msg.body.len(), topic_len, properties.len());
        if msg_len > self.max_message_size {
            return AppendMessageResult::error(AppendMessageStatus::MessageSizeExceeded);
        }

        let msg_id = create_message_id(&msg.store_host, wrote_offset);
        let remaining = region.len();

        if msg_len + END_OF_SEGMENT_MIN_BLANK > remaining {
            RecordEncoder::encode_blank(region, remaining);
            return AppendMessageResult {
                status: AppendMessageStatus::EndOfFile,
                wrote_offset,
                wrote_bytes: remaining,
                msg_id,
                store_timestamp: msg.store_timestamp,
                queue_offset,
                elapsed_ms: begin.elapsed().as_millis() as u64,
            };
        }

        let frame = self
            .encoder
            .encode(msg, queue_offset, wrote_offset, properties.as_bytes());
        region[..frame.len()].copy_from_slice(frame);

        match tran_type {
            TRANSACTION_NOT_TYPE | TRANSACTION_COMMIT_TYPE => {
                self.topic_queue_table.insert(key, queue_offset + 1);
            }
            _ => {}
        }

        AppendMessageResult {
            status: AppendMessageStatus::PutOk,
            wrote_offset,
            wrote_bytes: msg_len,
            msg_id,
            store_timestamp: msg.store_timestamp,
            queue_offset,
            elapsed_ms: begin.elapsed().as_millis() as u64,
        }
    }
}
