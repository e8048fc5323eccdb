use std::path::PathBuf;

/// Role this broker plays with respect to replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerRole {
    /// Master that replicates to slaves asynchronously.
    AsyncMaster,
    /// Master that waits for slave acknowledgement before confirming a write.
    SyncMaster,
    Slave,
}

/// Durability strategy for the commit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushDiskType {
    /// Background flush on an interval; producers never wait for disk.
    AsyncFlush,
    /// Producers that request it block until their bytes are flushed.
    SyncFlush,
}

/// Commit-log store configuration.
///
/// Plain data with defaults matching a production broker; tests override
/// individual fields with struct-update syntax.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Root directory of the store. Segments live in `{store_path}/commitlog`,
    /// the checkpoint file at `{store_path}/checkpoint`.
    pub store_path: PathBuf,
    /// Fixed size of every segment file.
    pub segment_size: usize,
    /// Upper bound on a single encoded record.
    pub max_message_size: usize,
    pub flush_disk_type: FlushDiskType,
    pub broker_role: BrokerRole,
    /// Bound on sync-flush and replication waits.
    pub sync_flush_timeout_ms: u64,
    pub flush_interval_ms: u64,
    pub flush_least_pages: usize,
    /// Ceiling on how long least-pages suppression may delay a flush.
    pub flush_thorough_interval_ms: u64,
    pub commit_interval_ms: u64,
    pub commit_least_pages: usize,
    pub commit_thorough_interval_ms: u64,
    /// Route appends through an off-heap write buffer; a separate commit
    /// step copies buffered bytes into the mapped region before flush.
    pub transient_store_pool_enable: bool,
    /// Serialize writers with a CAS spin claim instead of a blocking mutex.
    pub use_spin_lock: bool,
    /// Gate replay dispatch on the replicated confirm offset.
    pub duplication_enable: bool,
    pub message_index_enable: bool,
    /// Use the index-inclusive checkpoint minimum when picking the
    /// abnormal-recovery start segment.
    pub message_index_safe: bool,
    pub check_crc_on_recover: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from("store"),
            segment_size: 1024 * 1024 * 1024,
            max_message_size: 1024 * 1024 * 4,
            flush_disk_type: FlushDiskType::AsyncFlush,
            broker_role: BrokerRole::AsyncMaster,
            sync_flush_timeout_ms: 5_000,
            flush_interval_ms: 500,
            flush_least_pages: 4,
            flush_thorough_interval_ms: 10_000,
            commit_interval_ms: 200,
            commit_least_pages: 4,
            commit_thorough_interval_ms: 200,
            transient_store_pool_enable: false,
            use_spin_lock: true,
            duplication_enable: false,
            message_index_enable: true,
            message_index_safe: false,
            check_crc_on_recover: true,
        }
    }
}

impl StoreConfig {
    /// The transient buffer only applies with asynchronous flush; a sync
    /// flusher would have nothing committed to persist.
    pub fn use_transient_pool(&self) -> bool {
        self.transient_store_pool_enable && self.flush_disk_type == FlushDiskType::AsyncFlush
    }

    pub fn commitlog_path(&self) -> PathBuf {
        self.store_path.join("commitlog")
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.store_path.join("checkpoint")
    }
}
