//! The commit-log facade.
//!
//! Every produced message is serialized into the append-only log before any
//! downstream index is built; on crash all derived state is recoverable by
//! replaying it. This module owns the append path (single writer over the
//! active segment), the durability hand-off to the background services, the
//! optional replication rendezvous, and the two recovery algorithms.

use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{error, info, warn};

use crate::append::{AppendMessageResult, AppendMessageStatus, RecordAppender};
use crate::checkpoint::StoreCheckpoint;
use crate::clock::{Clock, SystemClock};
use crate::config::{BrokerRole, FlushDiskType, StoreConfig};
use crate::dispatch::{DispatchRequest, Dispatcher};
use crate::flush::{CommitService, FlushService, GroupCommitRequest, GroupCommitService};
use crate::ha::HaService;
use crate::locker::WriterLock;
use crate::message::{
    transaction_type, Message, PROPERTY_REAL_QUEUE_ID, PROPERTY_REAL_TOPIC, SCHEDULE_TOPIC,
    TRANSACTION_COMMIT_TYPE, TRANSACTION_NOT_TYPE, TRANSACTION_PREPARED_TYPE,
    TRANSACTION_ROLLBACK_TYPE,
};
use crate::record::{
    decode_record, peek_magic, peek_store_timestamp, DecodeResult, MESSAGE_MAGIC,
};
use crate::segment::Segment;
use crate::segment_store::SegmentStore;
use crate::Result;

/// How many trailing segments a clean-shutdown recovery rescans.
const NORMAL_RECOVER_SEGMENTS: usize = 3;
/// Lock-hold time past which the append path complains.
const LOCK_WARN_MS: u64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutMessageStatus {
    PutOk,
    FlushDiskTimeout,
    FlushSlaveTimeout,
    SlaveNotAvailable,
    MessageIllegal,
    CreateMappedFileFailed,
    UnknownError,
}

#[derive(Debug)]
pub struct PutMessageResult {
    pub status: PutMessageStatus,
    pub append_result: Option<AppendMessageResult>,
}

impl PutMessageResult {
    fn new(status: PutMessageStatus, append_result: Option<AppendMessageResult>) -> Self {
        Self {
            status,
            append_result,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == PutMessageStatus::PutOk
    }
}

/// Which durability services run, decided once from the config.
enum FlushEngine {
    Sync {
        group_commit: Arc<GroupCommitService>,
    },
    Async {
        flush: Arc<FlushService>,
        commit: Option<Arc<CommitService>>,
    },
}

pub struct CommitLog {
    config: StoreConfig,
    clock: Arc<dyn Clock>,
    store: Arc<SegmentStore>,
    checkpoint: Arc<StoreCheckpoint>,
    writer_lock: WriterLock,
    /// Frame encoder and per-queue tails; touched only under the writer
    /// lock and during recovery replay.
    appender: Mutex<RecordAppender>,
    /// Highest physical offset acknowledged replicated.
    confirm_offset: AtomicU64,
    ha: Option<Arc<dyn HaService>>,
    engine: FlushEngine,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl CommitLog {
    pub fn new(config: StoreConfig) -> Result<Self> {
        Self::with_parts(config, Arc::new(SystemClock), None)
    }

    pub fn with_parts(
        config: StoreConfig,
        clock: Arc<dyn Clock>,
        ha: Option<Arc<dyn HaService>>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&config.store_path)?;
        let store = Arc::new(SegmentStore::new(
            config.commitlog_path(),
            config.segment_size,
            config.use_transient_pool(),
        ));
        let checkpoint = Arc::new(StoreCheckpoint::load(config.checkpoint_path())?);

        let engine = match config.flush_disk_type {
            FlushDiskType::SyncFlush => FlushEngine::Sync {
                group_commit: GroupCommitService::new(Arc::clone(&store), Arc::clone(&checkpoint)),
            },
            FlushDiskType::AsyncFlush => {
                let flush = FlushService::new(
                    Arc::clone(&store),
                    Arc::clone(&checkpoint),
                    config.flush_interval_ms,
                    config.flush_least_pages,
                    config.flush_thorough_interval_ms,
                );
                let commit = config.use_transient_pool().then(|| {
                    CommitService::new(
                        Arc::clone(&store),
                        Arc::clone(&flush),
                        config.commit_interval_ms,
                        config.commit_least_pages,
                        config.commit_thorough_interval_ms,
                    )
                });
                FlushEngine::Async { flush, commit }
            }
        };

        Ok(Self {
            writer_lock: WriterLock::new(config.use_spin_lock),
            appender: Mutex::new(RecordAppender::new(config.max_message_size)),
            config,
            clock,
            store,
            checkpoint,
            confirm_offset: AtomicU64::new(0),
            ha,
            engine,
            handles: Mutex::new(Vec::new()),
        })
    }

    /// Maps the existing segments. Returns false on a store the broker
    /// cannot read; the caller must abort startup.
    pub fn load(&self) -> bool {
        self.store.load()
    }

    /// Starts the durability services.
    pub fn start(&self) -> Result<()> {
        let mut handles = lock_recovering(&self.handles);
        match &self.engine {
            FlushEngine::Sync { group_commit } => handles.push(group_commit.start()?),
            FlushEngine::Async { flush, commit } => {
                handles.push(flush.start()?);
                if let Some(commit) = commit {
                    handles.push(commit.start()?);
                }
            }
        }
        Ok(())
    }

    /// Stops the services in reverse startup order and joins them. The
    /// group-commit drain releases any producer still blocked on a
    /// rendezvous.
    pub fn shutdown(&self) {
        match &self.engine {
            FlushEngine::Sync { group_commit } => group_commit.request_stop(),
            FlushEngine::Async { flush, commit } => {
                if let Some(commit) = commit {
                    commit.request_stop();
                }
                flush.request_stop();
            }
        }
        let handles = mem::take(&mut *lock_recovering(&self.handles));
        for handle in handles.into_iter().rev() {
            if handle.join().is_err() {
                error!("durability service thread panicked");
            }
        }
    }

    /// Serializes one message into the log and waits out the configured
    /// durability and replication guarantees.
    pub fn put_message(&self, msg: &mut Message) -> PutMessageResult {
        msg.store_timestamp = self.clock.now_ms();
        msg.body_crc = crc32fast::hash(&msg.body);

        let tran_type = transaction_type(msg.sys_flag);
        if matches!(tran_type, TRANSACTION_NOT_TYPE | TRANSACTION_COMMIT_TYPE)
            && msg.delay_level > 0
        {
            // Retarget to the schedule topic; the scheduler restores the
            // real destination from the properties at delivery time.
            msg.properties
                .insert(PROPERTY_REAL_TOPIC.to_string(), msg.topic.clone());
            msg.properties
                .insert(PROPERTY_REAL_QUEUE_ID.to_string(), msg.queue_id.to_string());
            msg.topic = SCHEDULE_TOPIC.to_string();
            msg.queue_id = msg.delay_level - 1;
        }

        let (result, elapsed_ms) = {
            let _guard = self.writer_lock.lock(self.clock.now_ms());
            let begin_lock = self.clock.now_ms();
            // Re-stamp under the lock so timestamps are non-decreasing in
            // offset order.
            msg.store_timestamp = begin_lock;

            let mut appender = lock_recovering(&self.appender);
            let segment = match self.store.last_segment_or_create(0) {
                Ok(segment) => segment,
                Err(err) => {
                    error!("failed to create segment for {}: {err}", msg.topic);
                    return PutMessageResult::new(PutMessageStatus::CreateMappedFileFailed, None);
                }
            };

            let mut result = segment.append(msg, &mut *appender);
            if result.status == AppendMessageStatus::EndOfFile {
                // The trailer filled the segment; roll to a fresh one and
                // retry exactly once.
                let segment = match self.store.last_segment_or_create(0) {
                    Ok(segment) => segment,
                    Err(err) => {
                        error!("failed to roll segment for {}: {err}", msg.topic);
                        return PutMessageResult::new(
                            PutMessageStatus::CreateMappedFileFailed,
                            Some(result),
                        );
                    }
                };
                result = segment.append(msg, &mut *appender);
            }

            (result, self.clock.now_ms().saturating_sub(begin_lock))
        };

        if elapsed_ms > LOCK_WARN_MS {
            warn!(
                "append held the writer lock for {elapsed_ms} ms, topic: {}, body length: {}",
                msg.topic,
                msg.body.len()
            );
        }

        match result.status {
            AppendMessageStatus::PutOk => {}
            AppendMessageStatus::EndOfFile => {
                // A fresh segment still could not hold the record.
                return PutMessageResult::new(
                    PutMessageStatus::CreateMappedFileFailed,
                    Some(result),
                );
            }
            AppendMessageStatus::MessageSizeExceeded
            | AppendMessageStatus::PropertiesSizeExceeded => {
                return PutMessageResult::new(PutMessageStatus::MessageIllegal, Some(result));
            }
            AppendMessageStatus::UnknownError => {
                return PutMessageResult::new(PutMessageStatus::UnknownError, Some(result));
            }
        }

        let mut status = self.handle_disk_flush(&result, msg);
        let replica_status = self.handle_replica(&result, msg);
        if replica_status != PutMessageStatus::PutOk {
            status = replica_status;
        }
        PutMessageResult::new(status, Some(result))
    }

    fn handle_disk_flush(&self, result: &AppendMessageResult, msg: &Message) -> PutMessageStatus {
        match &self.engine {
            FlushEngine::Sync { group_commit } => {
                if !msg.wait_store_msg_ok {
                    group_commit.wakeup();
                    return PutMessageStatus::PutOk;
                }
                let request =
                    GroupCommitRequest::new(result.wrote_offset + result.wrote_bytes as u64);
                group_commit.put_request(Arc::clone(&request));
                let timeout = Duration::from_millis(self.config.sync_flush_timeout_ms);
                if request.wait_for_flush(timeout) {
                    PutMessageStatus::PutOk
                } else {
                    warn!(
                        "sync flush timed out, topic: {}, tags: {:?}, client: {}",
                        msg.topic,
                        msg.properties.get(crate::message::PROPERTY_TAGS),
                        msg.born_host
                    );
                    PutMessageStatus::FlushDiskTimeout
                }
            }
            FlushEngine::Async { flush, commit } => {
                if let Some(commit) = commit {
                    commit.wakeup();
                } else {
                    flush.wakeup();
                }
                PutMessageStatus::PutOk
            }
        }
    }

    fn handle_replica(&self, result: &AppendMessageResult, msg: &Message) -> PutMessageStatus {
        if self.config.broker_role != BrokerRole::SyncMaster || !msg.wait_store_msg_ok {
            return PutMessageStatus::PutOk;
        }
        let Some(ha) = &self.ha else {
            return PutMessageStatus::PutOk;
        };

        let next_offset = result.wrote_offset + result.wrote_bytes as u64;
        if !ha.is_slave_ok(next_offset) {
            // Replica too far behind; report without waiting.
            return PutMessageStatus::SlaveNotAvailable;
        }

        let request = GroupCommitRequest::new(next_offset);
        ha.put_request(Arc::clone(&request));
        ha.notify_waiters();
        let timeout = Duration::from_millis(self.config.sync_flush_timeout_ms);
        if request.wait_for_flush(timeout) {
            PutMessageStatus::PutOk
        } else {
            warn!(
                "sync to slave timed out, topic: {}, offset: {next_offset}",
                msg.topic
            );
            PutMessageStatus::FlushSlaveTimeout
        }
    }

    /// Rebuilds the write/commit/flush pointers after a clean shutdown by
    /// rescanning the trailing segments.
    pub fn recover_normally(&self) {
        let segments = self.store.segments();
        if segments.is_empty() {
            self.store.set_flushed_where(0);
            self.store.set_committed_where(0);
            return;
        }

        let index = segments.len().saturating_sub(NORMAL_RECOVER_SEGMENTS);
        let process_offset = self.replay(&segments, index, None);

        self.store.set_flushed_where(process_offset);
        self.store.set_committed_where(process_offset);
        self.store.truncate_to(process_offset);
        info!("normal recovery complete, log ends at {process_offset}");
    }

    /// Crash recovery: finds the last segment whose first record predates
    /// the checkpoint, replays forward re-dispatching every record, and
    /// truncates both the log tail and downstream derived files.
    pub fn recover_abnormally(&self, dispatcher: &dyn Dispatcher) {
        let segments = self.store.segments();
        if segments.is_empty() {
            info!("commit log is empty, destroying derived files");
            self.store.set_flushed_where(0);
            self.store.set_committed_where(0);
            dispatcher.destroy();
            return;
        }

        let mut index = segments.len() - 1;
        loop {
            if self.segment_matches_recover(&segments[index]) {
                break;
            }
            if index == 0 {
                break;
            }
            index -= 1;
        }
        info!(
            "abnormal recovery starting from segment {}",
            segments[index].path().display()
        );

        let process_offset = self.replay(&segments, index, Some(dispatcher));

        self.store.set_flushed_where(process_offset);
        self.store.set_committed_where(process_offset);
        self.store.truncate_to(process_offset);
        dispatcher.truncate_to(process_offset);
        info!("abnormal recovery complete, log ends at {process_offset}");
    }

    /// Decodes forward from `segments[index]`, rebuilding queue tails and
    /// optionally re-dispatching records. Returns the absolute offset just
    /// past the last valid record.
    fn replay(
        &self,
        segments: &[Arc<Segment>],
        mut index: usize,
        dispatcher: Option<&dyn Dispatcher>,
    ) -> u64 {
        let check_crc = self.config.check_crc_on_recover;
        let mut segment = &segments[index];
        let mut mapped_file_offset = 0usize;

        loop {
            let buf = segment.mapped_slice(mapped_file_offset);
            match decode_record(buf, check_crc, true) {
                DecodeResult::Record(request) => {
                    mapped_file_offset += request.msg_size;
                    self.replay_queue_tail(&request);
                    if let Some(dispatcher) = dispatcher {
                        if !self.config.duplication_enable
                            || request.commit_log_offset < self.confirm_offset()
                        {
                            dispatcher.do_dispatch(&request);
                        }
                    }
                }
                DecodeResult::EndOfSegment => {
                    index += 1;
                    if index >= segments.len() {
                        info!(
                            "recovery reached the end of the last segment {}",
                            segment.path().display()
                        );
                        break;
                    }
                    segment = &segments[index];
                    mapped_file_offset = 0;
                }
                DecodeResult::Invalid => {
                    info!(
                        "recovery stopped at segment {} offset {mapped_file_offset}",
                        segment.path().display()
                    );
                    break;
                }
            }
        }

        segment.base_offset() + mapped_file_offset as u64
    }

    fn replay_queue_tail(&self, request: &DispatchRequest) {
        match transaction_type(request.sys_flag) {
            TRANSACTION_PREPARED_TYPE | TRANSACTION_ROLLBACK_TYPE => {}
            _ => {
                lock_recovering(&self.appender).advance_queue_tail(
                    &request.topic,
                    request.queue_id,
                    request.consume_queue_offset + 1,
                );
            }
        }
    }

    /// First record of `segment` is a real record old enough that the
    /// checkpoint vouches for everything before this segment.
    fn segment_matches_recover(&self, segment: &Segment) -> bool {
        let head = segment.mapped_slice(0);
        if peek_magic(head) != Some(MESSAGE_MAGIC) {
            return false;
        }
        let Some(timestamp) = peek_store_timestamp(head) else {
            return false;
        };
        if timestamp == 0 {
            return false;
        }
        let min_timestamp = if self.config.message_index_enable && self.config.message_index_safe {
            self.checkpoint.min_timestamp_index()
        } else {
            self.checkpoint.min_timestamp()
        };
        timestamp <= min_timestamp
    }

    /// Bytes from `offset` through the containing segment's read position.
    pub fn get_data(&self, offset: u64) -> Option<Vec<u8>> {
        self.get_data_with_option(offset, offset == 0)
    }

    pub fn get_data_with_option(
        &self,
        offset: u64,
        return_first_on_not_found: bool,
    ) -> Option<Vec<u8>> {
        let segment = self.store.find_by_offset(offset, return_first_on_not_found)?;
        let position = (offset % self.config.segment_size as u64) as usize;
        let read_position = segment.read_position();
        if position >= read_position {
            return None;
        }
        segment.read_bytes(position, read_position - position)
    }

    /// `size` bytes starting at `offset`, within one segment.
    pub fn get_message(&self, offset: u64, size: usize) -> Option<Vec<u8>> {
        let segment = self.store.find_by_offset(offset, offset == 0)?;
        let position = (offset % self.config.segment_size as u64) as usize;
        segment.read_bytes(position, size)
    }

    /// Reads a record's store timestamp without a full decode.
    pub fn pickup_store_timestamp(&self, offset: u64, size: usize) -> Option<u64> {
        if offset < self.min_offset() {
            return None;
        }
        let bytes = self.get_message(offset, size)?;
        peek_store_timestamp(&bytes)
    }

    pub fn min_offset(&self) -> u64 {
        self.store.min_offset()
    }

    pub fn max_offset(&self) -> u64 {
        self.store.max_offset()
    }

    pub fn flushed_where(&self) -> u64 {
        self.store.flushed_where()
    }

    /// First offset of the segment after the one containing `offset`.
    pub fn roll_next_file(&self, offset: u64) -> u64 {
        let segment_size = self.config.segment_size as u64;
        offset + segment_size - offset % segment_size
    }

    pub fn confirm_offset(&self) -> u64 {
        self.confirm_offset.load(Ordering::Acquire)
    }

    pub fn set_confirm_offset(&self, offset: u64) {
        self.confirm_offset.store(offset, Ordering::Release);
    }

    /// Next queue offset that will be assigned for `(topic, queue_id)`.
    pub fn next_queue_offset(&self, topic: &str, queue_id: i32) -> u64 {
        lock_recovering(&self.appender).next_queue_offset(topic, queue_id)
    }

    /// How long the writer lock has currently been held; a health signal.
    pub fn lock_hold_time_ms(&self) -> u64 {
        self.writer_lock.hold_time_ms(self.clock.now_ms())
    }

    pub fn checkpoint(&self) -> &StoreCheckpoint {
        &self.checkpoint
    }

    pub fn store(&self) -> &SegmentStore {
        &self.store
    }
}

/// Mutex access that shrugs off poisoning: a panicked writer must not wedge
/// the whole broker.
fn lock_recovering<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
