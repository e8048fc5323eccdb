use std::collections::HashMap;

/// A fully decoded record handed to the downstream dispatch pipeline, which
/// rebuilds consume queues and index files from it during replay.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub topic: String,
    pub queue_id: i32,
    /// Physical offset the record starts at.
    pub commit_log_offset: u64,
    /// Full frame length of the record.
    pub msg_size: usize,
    pub tags_code: i64,
    pub store_timestamp: u64,
    /// Queue offset assigned at append time.
    pub consume_queue_offset: u64,
    pub keys: String,
    pub uniq_key: Option<String>,
    pub sys_flag: i32,
    pub prepared_transaction_offset: u64,
    pub properties: HashMap<String, String>,
}

/// Downstream consumer of replayed records.
///
/// Implemented by the message store that owns consume queues and index
/// files; the commit log drives it during abnormal recovery.
pub trait Dispatcher: Send + Sync {
    /// Rebuild derived state for one valid record.
    fn do_dispatch(&self, request: &DispatchRequest);

    /// Drop derived state beyond `phy_offset` after the commit log truncated
    /// its dirty tail.
    fn truncate_to(&self, phy_offset: u64);

    /// Remove all derived state; called when the commit log is empty.
    fn destroy(&self);
}
