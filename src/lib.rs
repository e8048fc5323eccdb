//! Append-only commit log for a persistent message broker.
//!
//! The commit log is the broker's system of record: every produced message
//! is serialized into it before any consume queue or index is built, and
//! after a crash all derived state is rebuilt by replaying it. The crate
//! covers the bit-exact record codec, the single-writer append path over
//! memory-mapped segments, the asynchronous and group-synchronous
//! durability services, and normal/abnormal recovery.

pub mod append;
pub mod checkpoint;
pub mod clock;
pub mod commitlog;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod flush;
pub mod ha;
pub mod locker;
pub mod message;
pub mod record;
pub mod segment;
pub mod segment_store;

pub use append::{AppendMessageResult, AppendMessageStatus};
pub use checkpoint::StoreCheckpoint;
pub use clock::{Clock, QuantaClock, SystemClock};
pub use commitlog::{CommitLog, PutMessageResult, PutMessageStatus};
pub use config::{BrokerRole, FlushDiskType, StoreConfig};
pub use dispatch::{DispatchRequest, Dispatcher};
pub use error::{Error, Result};
pub use flush::GroupCommitRequest;
pub use ha::HaService;
pub use message::Message;
pub use record::{DecodeResult, BLANK_MAGIC, MESSAGE_MAGIC};
pub use segment_store::SegmentStore;
