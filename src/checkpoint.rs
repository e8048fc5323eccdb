//! The store checkpoint: three progress timestamps persisted in a small
//! fixed-layout file, consulted by abnormal recovery to pick a safe replay
//! start.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::Result;

/// Slack subtracted from the minimum so that records flushed concurrently
/// with the checkpoint write are still replayed.
const MIN_TIMESTAMP_SLACK_MS: u64 = 3_000;

pub struct StoreCheckpoint {
    path: PathBuf,
    /// Store timestamp of the last flushed commit-log record.
    physic_msg_timestamp: AtomicU64,
    /// Store timestamp of the last record reflected in consume queues.
    logics_msg_timestamp: AtomicU64,
    /// Store timestamp of the last record reflected in the index files.
    index_msg_timestamp: AtomicU64,
}

impl StoreCheckpoint {
    /// Loads the checkpoint, treating a missing file as a fresh store.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut buf = [0u8; 24];
        match File::open(&path) {
            Ok(mut file) => file.read_exact(&mut buf)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        let physic = u64::from_le_bytes(buf[0..8].try_into().expect("slice length"));
        let logics = u64::from_le_bytes(buf[8..16].try_into().expect("slice length"));
        let index = u64::from_le_bytes(buf[16..24].try_into().expect("slice length"));
        Ok(Self {
            path,
            physic_msg_timestamp: AtomicU64::new(physic),
            logics_msg_timestamp: AtomicU64::new(logics),
            index_msg_timestamp: AtomicU64::new(index),
        })
    }

    /// Persists all three timestamps and syncs the file.
    pub fn flush(&self) -> Result<()> {
        let mut buf = [0u8; 24];
        buf[0..8].copy_from_slice(&self.physic_msg_timestamp.load(Ordering::Acquire).to_le_bytes());
        buf[8..16].copy_from_slice(&self.logics_msg_timestamp.load(Ordering::Acquire).to_le_bytes());
        buf[16..24].copy_from_slice(&self.index_msg_timestamp.load(Ordering::Acquire).to_le_bytes());

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        file.write_all(&buf)?;
        file.sync_all()?;
        Ok(())
    }

    pub fn physic_msg_timestamp(&self) -> u64 {
        self.physic_msg_timestamp.load(Ordering::Acquire)
    }

    pub fn set_physic_msg_timestamp(&self, timestamp: u64) {
        self.physic_msg_timestamp.store(timestamp, Ordering::Release);
    }

    pub fn set_logics_msg_timestamp(&self, timestamp: u64) {
        self.logics_msg_timestamp.store(timestamp, Ordering::Release);
    }

    pub fn set_index_msg_timestamp(&self, timestamp: u64) {
        self.index_msg_timestamp.store(timestamp, Ordering::Release);
    }

    /// Oldest progress point across log and consume queues, minus slack.
    pub fn min_timestamp(&self) -> u64 {
        let physic = self.physic_msg_timestamp.load(Ordering::Acquire);
        let logics = self.logics_msg_timestamp.load(Ordering::Acquire);
        physic.min(logics).saturating_sub(MIN_TIMESTAMP_SLACK_MS)
    }

    /// As `min_timestamp`, but also bounded by index progress.
    pub fn min_timestamp_index(&self) -> u64 {
        self.min_timestamp()
            .min(self.index_msg_timestamp.load(Ordering::Acquire))
    }
}
