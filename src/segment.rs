//! One mapped segment of the commit log.
//!
//! A segment is a preallocated fixed-size file named by the absolute offset
//! of its first byte, in 20-digit zero-padded decimal. The single writer
//! appends records at `wrote_position`; readers see bytes strictly below
//! the read position. When the transient write buffer is enabled, appends
//! land in the buffer first and a commit step copies them into the mapped
//! region; flush then persists mapped pages.
//!
//! Position invariant: `flushed <= committed <= wrote <= size`.

use std::cell::UnsafeCell;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use log::{error, warn};
use memmap2::MmapMut;

use crate::append::{AppendCallback, AppendMessageResult, AppendMessageStatus};
use crate::message::Message;
use crate::{Error, Result};

pub const OS_PAGE_SIZE: usize = 4096;

/// Segment filename: the base offset, 20 digits, zero padded.
pub fn segment_file_name(base_offset: u64) -> String {
    format!("{base_offset:020}")
}

/// Parses a segment filename back into its base offset.
pub fn parse_segment_file_name(name: &str) -> Option<u64> {
    if name.len() != 20 || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    name.parse::<u64>().ok()
}

pub struct Segment {
    base_offset: u64,
    size: usize,
    path: PathBuf,
    mmap: UnsafeCell<MmapMut>,
    /// Transient tier; `None` writes straight into the mapped region.
    write_buffer: Option<UnsafeCell<Box<[u8]>>>,
    wrote_position: AtomicUsize,
    committed_position: AtomicUsize,
    flushed_position: AtomicUsize,
    /// Store timestamp of the last appended record.
    store_timestamp: AtomicU64,
}

// SAFETY: the byte regions behind the UnsafeCells follow a single-writer
// protocol. Appends (serialized by the commit-log writer lock) only touch
// bytes at or above `wrote_position`; the commit thread only copies the
// range [committed, wrote), which the writer no longer mutates; readers
// only access bytes below the read position. Position words are atomics
// with release/acquire pairing, so a reader that observes a position also
// observes the bytes written before it.
unsafe impl Sync for Segment {}
unsafe impl Send for Segment {}

impl Segment {
    /// Creates and maps a fresh segment file of exactly `size` bytes.
    pub fn create(
        dir: &Path,
        base_offset: u64,
        size: usize,
        with_write_buffer: bool,
    ) -> Result<Self> {
        let path = dir.join(segment_file_name(base_offset));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        file.set_len(size as u64)?;
        // SAFETY: the file was just created with the mapped length and the
        // mapping is owned by this Segment for its whole lifetime.
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        let write_buffer =
            with_write_buffer.then(|| UnsafeCell::new(vec![0u8; size].into_boxed_slice()));

        Ok(Self {
            base_offset,
            size,
            path,
            mmap: UnsafeCell::new(mmap),
            write_buffer,
            wrote_position: AtomicUsize::new(0),
            committed_position: AtomicUsize::new(0),
            flushed_position: AtomicUsize::new(0),
            store_timestamp: AtomicU64::new(0),
        })
    }

    /// Maps an existing segment file. All positions start at the file end;
    /// recovery truncates them back to the last valid record.
    pub fn open(path: &Path, base_offset: u64, size: usize) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if len != size as u64 {
            return Err(Error::Corrupt("segment length does not match configured size"));
        }
        // SAFETY: mapped length equals the file length checked above.
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        Ok(Self {
            base_offset,
            size,
            path: path.to_path_buf(),
            mmap: UnsafeCell::new(mmap),
            write_buffer: None,
            wrote_position: AtomicUsize::new(size),
            committed_position: AtomicUsize::new(size),
            flushed_position: AtomicUsize::new(size),
            store_timestamp: AtomicU64::new(0),
        })
    }

    pub fn base_offset(&self) -> u64 {
        self.base_offset
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_full(&self) -> bool {
        self.wrote_position.load(Ordering::Acquire) >= self.size
    }

    pub fn wrote_position(&self) -> usize {
        self.wrote_position.load(Ordering::Acquire)
    }

    pub fn flushed_position(&self) -> usize {
        self.flushed_position.load(Ordering::Acquire)
    }

    pub fn committed_position(&self) -> usize {
        self.committed_position.load(Ordering::Acquire)
    }

    /// Highest position readers may access: with the transient buffer the
    /// mapped region only holds committed bytes, otherwise everything
    /// written is visible.
    pub fn read_position(&self) -> usize {
        if self.write_buffer.is_some() {
            self.committed_position.load(Ordering::Acquire)
        } else {
            self.wrote_position.load(Ordering::Acquire)
        }
    }

    pub fn store_timestamp(&self) -> u64 {
        self.store_timestamp.load(Ordering::Acquire)
    }

    /// Rewinds all three positions; used when truncating a dirty tail.
    pub fn set_positions(&self, position: usize) {
        let position = position.min(self.size);
        self.wrote_position.store(position, Ordering::Release);
        self.committed_position.store(position, Ordering::Release);
        self.flushed_position.store(position, Ordering::Release);
    }

    /// Hands the writable tail of the segment to `callback`, which writes
    /// exactly one record or one blank trailer. Must only be called by the
    /// single writer, under the commit-log writer lock.
    pub fn append(&self, msg: &Message, callback: &mut dyn AppendCallback) -> AppendMessageResult {
        let current = self.wrote_position.load(Ordering::Acquire);
        if current >= self.size {
            error!(
                "append past segment end, wrote_position: {current}, size: {}",
                self.size
            );
            return AppendMessageResult::error(AppendMessageStatus::UnknownError);
        }

        let wrote_offset = self.base_offset + current as u64;
        // SAFETY: single-writer protocol (see the Sync impl): the region at
        // or above wrote_position is not observed by readers or the commit
        // thread until the position word is advanced below.
        let region = unsafe {
            let target: *mut u8 = match &self.write_buffer {
                Some(buffer) => (*buffer.get()).as_mut_ptr(),
                None => (*self.mmap.get()).as_mut_ptr(),
            };
            std::slice::from_raw_parts_mut(target.add(current), self.size - current)
        };

        let result = callback.do_append(wrote_offset, region, msg);
        match result.status {
            AppendMessageStatus::PutOk | AppendMessageStatus::EndOfFile => {
                self.store_timestamp
                    .store(result.store_timestamp, Ordering::Release);
                let next = current + result.wrote_bytes;
                if self.write_buffer.is_none() {
                    // No transient tier: written bytes are committed bytes.
                    self.committed_position.store(next, Ordering::Release);
                }
                self.wrote_position.store(next, Ordering::Release);
            }
            _ => {}
        }
        result
    }

    /// Copies `[committed, wrote)` from the write buffer into the mapped
    /// region. Returns the new committed position.
    pub fn commit(&self, least_pages: usize) -> usize {
        let Some(buffer) = &self.write_buffer else {
            // Nothing to stage; committed tracks wrote directly.
            return self.committed_position.load(Ordering::Acquire);
        };

        let wrote = self.wrote_position.load(Ordering::Acquire);
        let committed = self.committed_position.load(Ordering::Acquire);
        if !self.pages_ready(committed, wrote, least_pages) {
            return committed;
        }

        // SAFETY: the writer no longer mutates [committed, wrote), and the
        // destination range in the mapped region is below wrote_position,
        // which readers do not access until committed_position advances.
        unsafe {
            let src = (*buffer.get()).as_ptr().add(committed);
            let dst = (*self.mmap.get()).as_mut_ptr().add(committed);
            std::ptr::copy_nonoverlapping(src, dst, wrote - committed);
        }
        self.committed_position.store(wrote, Ordering::Release);
        wrote
    }

    /// Persists mapped pages up to the read position. Returns the new
    /// flushed position.
    pub fn flush(&self, least_pages: usize) -> usize {
        let flushable = self.read_position();
        let flushed = self.flushed_position.load(Ordering::Acquire);
        if !self.pages_ready(flushed, flushable, least_pages) {
            return flushed;
        }

        let start = flushed - flushed % OS_PAGE_SIZE;
        // SAFETY: flush_range only reads the mapping.
        let result = unsafe { (*self.mmap.get()).flush_range(start, flushable - start) };
        if let Err(err) = result {
            warn!("segment {} flush failed: {err}", self.path.display());
            return flushed;
        }
        self.flushed_position.store(flushable, Ordering::Release);
        flushable
    }

    fn pages_ready(&self, done: usize, available: usize, least_pages: usize) -> bool {
        if available <= done {
            return false;
        }
        if self.is_full() {
            return true;
        }
        if least_pages > 0 {
            return available / OS_PAGE_SIZE - done / OS_PAGE_SIZE >= least_pages;
        }
        true
    }

    /// Copies `len` bytes starting at `position`, bounded by the read
    /// position.
    pub fn read_bytes(&self, position: usize, len: usize) -> Option<Vec<u8>> {
        let end = position.checked_add(len)?;
        if end > self.read_position() {
            return None;
        }
        // SAFETY: the range is below read_position, which the writer never
        // mutates again.
        let slice = unsafe { &(&*self.mmap.get())[position..end] };
        Some(slice.to_vec())
    }

    /// Borrows the mapped bytes from `position` to the end of the file.
    /// Recovery decodes straight out of this; on a freshly opened segment
    /// the whole file is in range.
    pub fn mapped_slice(&self, position: usize) -> &[u8] {
        let position = position.min(self.size);
        // SAFETY: recovery runs single-threaded before the writer starts;
        // afterwards callers stay below the read position.
        unsafe { &(&*self.mmap.get())[position..] }
    }

    /// Deletes the backing file. The caller removes the segment from the
    /// store first; the mapping stays valid until drop.
    pub fn destroy(&self) -> Result<()> {
        std::fs::remove_file(&self.path)?;
        Ok(())
    }
}
