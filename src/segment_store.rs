//! The ordered set of mapped segments backing the commit log.
//!
//! Responsibilities: discovery and mapping of existing segment files, lazy
//! creation of the next segment when the active one fills, locating a
//! segment by absolute offset, driving flush/commit from the global
//! progress pointers, and truncating the dirty tail after recovery.
//!
//! Global pointer invariant: `flushed_where <= committed_where <= max_offset`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::{error, info, warn};

use crate::segment::{parse_segment_file_name, Segment};
use crate::Result;

pub struct SegmentStore {
    dir: PathBuf,
    segment_size: usize,
    /// Attach a transient write buffer to newly created segments.
    with_write_buffer: bool,
    segments: RwLock<Vec<Arc<Segment>>>,
    flushed_where: AtomicU64,
    committed_where: AtomicU64,
    /// Store timestamp of the last record known flushed; feeds the
    /// checkpoint.
    store_timestamp: AtomicU64,
}

impl SegmentStore {
    pub fn new(dir: impl Into<PathBuf>, segment_size: usize, with_write_buffer: bool) -> Self {
        Self {
            dir: dir.into(),
            segment_size,
            with_write_buffer,
            segments: RwLock::new(Vec::new()),
            flushed_where: AtomicU64::new(0),
            committed_where: AtomicU64::new(0),
            store_timestamp: AtomicU64::new(0),
        }
    }

    /// Discovers and maps every segment file in the store directory.
    /// Returns false when any segment cannot be mapped; the broker must
    /// not start on a store it cannot read.
    pub fn load(&self) -> bool {
        if let Err(err) = std::fs::create_dir_all(&self.dir) {
            error!("failed to create store directory {}: {err}", self.dir.display());
            return false;
        }

        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) => {
                error!("failed to read store directory {}: {err}", self.dir.display());
                return false;
            }
        };

        let mut found: Vec<(u64, PathBuf)> = Vec::new();
        for entry in entries {
            let Ok(entry) = entry else { continue };
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some(base_offset) = parse_segment_file_name(name) {
                found.push((base_offset, path));
            }
        }
        found.sort_unstable_by_key(|(base, _)| *base);

        let mut segments = Vec::with_capacity(found.len());
        for (base_offset, path) in found {
            match Segment::open(&path, base_offset, self.segment_size) {
                Ok(segment) => segments.push(Arc::new(segment)),
                Err(err) => {
                    error!("failed to map segment {}: {err}", path.display());
                    return false;
                }
            }
        }

        info!("loaded {} segment(s) from {}", segments.len(), self.dir.display());
        *self.write_segments() = segments;
        true
    }

    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    /// Snapshot of all segments in offset order.
    pub fn segments(&self) -> Vec<Arc<Segment>> {
        self.read_segments().clone()
    }

    pub fn last_segment(&self) -> Option<Arc<Segment>> {
        self.read_segments().last().cloned()
    }

    /// Returns the active segment, creating the next one when the last is
    /// full or none exists. `start_offset` seeds the base of the very first
    /// segment.
    pub fn last_segment_or_create(&self, start_offset: u64) -> Result<Arc<Segment>> {
        let create_base = {
            let segments = self.read_segments();
            match segments.last() {
                Some(last) if !last.is_full() => return Ok(Arc::clone(last)),
                Some(last) => last.base_offset() + self.segment_size as u64,
                None => start_offset - start_offset % self.segment_size as u64,
            }
        };

        let segment = Arc::new(Segment::create(
            &self.dir,
            create_base,
            self.segment_size,
            self.with_write_buffer,
        )?);
        info!("created segment {}", segment.path().display());
        self.write_segments().push(Arc::clone(&segment));
        Ok(segment)
    }

    /// Locates the segment covering `offset`. Outside the stored range,
    /// returns the first segment when asked to, otherwise `None`.
    pub fn find_by_offset(
        &self,
        offset: u64,
        return_first_on_not_found: bool,
    ) -> Option<Arc<Segment>> {
        let segments = self.read_segments();
        let first = segments.first()?;
        let last = segments.last()?;

        let in_range =
            offset >= first.base_offset() && offset < last.base_offset() + self.segment_size as u64;
        if in_range {
            let index = ((offset - first.base_offset()) / self.segment_size as u64) as usize;
            if let Some(segment) = segments.get(index) {
                if Self::contains(segment, offset, self.segment_size) {
                    return Some(Arc::clone(segment));
                }
            }
            // The index math assumes a gap-free sequence; fall back to a
            // scan when retention has punched holes.
            for segment in segments.iter() {
                if Self::contains(segment, offset, self.segment_size) {
                    return Some(Arc::clone(segment));
                }
            }
            warn!("offset {offset} maps to no segment despite being in range");
        }

        if return_first_on_not_found {
            return Some(Arc::clone(first));
        }
        None
    }

    fn contains(segment: &Segment, offset: u64, segment_size: usize) -> bool {
        offset >= segment.base_offset() && offset < segment.base_offset() + segment_size as u64
    }

    /// Flushes pages starting at the global flushed pointer. Returns true
    /// when there was nothing left to flush.
    pub fn flush(&self, least_pages: usize) -> bool {
        let flushed_where = self.flushed_where.load(Ordering::Acquire);
        let Some(segment) = self.find_by_offset(flushed_where, flushed_where == 0) else {
            return true;
        };

        let timestamp = segment.store_timestamp();
        let position = segment.flush(least_pages);
        let new_where = segment.base_offset() + position as u64;
        let nothing_to_do = new_where == flushed_where;
        self.flushed_where.store(new_where, Ordering::Release);
        if least_pages == 0 && timestamp > 0 {
            self.store_timestamp.store(timestamp, Ordering::Release);
        }
        nothing_to_do
    }

    /// Commits write-buffer pages starting at the global committed pointer.
    /// Returns true when there was nothing left to commit.
    pub fn commit(&self, least_pages: usize) -> bool {
        let committed_where = self.committed_where.load(Ordering::Acquire);
        let Some(segment) = self.find_by_offset(committed_where, committed_where == 0) else {
            return true;
        };

        let position = segment.commit(least_pages);
        let new_where = segment.base_offset() + position as u64;
        let nothing_to_do = new_where == committed_where;
        self.committed_where.store(new_where, Ordering::Release);
        nothing_to_do
    }

    pub fn flushed_where(&self) -> u64 {
        self.flushed_where.load(Ordering::Acquire)
    }

    pub fn set_flushed_where(&self, offset: u64) {
        self.flushed_where.store(offset, Ordering::Release);
    }

    pub fn committed_where(&self) -> u64 {
        self.committed_where.load(Ordering::Acquire)
    }

    pub fn set_committed_where(&self, offset: u64) {
        self.committed_where.store(offset, Ordering::Release);
    }

    pub fn store_timestamp(&self) -> u64 {
        self.store_timestamp.load(Ordering::Acquire)
    }

    /// Discards everything at or beyond `offset`: rewinds the segment that
    /// straddles it and deletes segments entirely beyond it.
    pub fn truncate_to(&self, offset: u64) {
        let mut segments = self.write_segments();
        segments.retain(|segment| {
            let tail = segment.base_offset() + self.segment_size as u64;
            if tail <= offset {
                return true;
            }
            if offset >= segment.base_offset() {
                segment.set_positions((offset - segment.base_offset()) as usize);
                true
            } else {
                info!("destroying dirty segment {}", segment.path().display());
                if let Err(err) = segment.destroy() {
                    warn!("failed to destroy {}: {err}", segment.path().display());
                }
                false
            }
        });
    }

    /// Base offset of the first segment, or 0 with no segments.
    pub fn min_offset(&self) -> u64 {
        self.read_segments()
            .first()
            .map(|s| s.base_offset())
            .unwrap_or(0)
    }

    /// One past the last readable byte.
    pub fn max_offset(&self) -> u64 {
        self.read_segments()
            .last()
            .map(|s| s.base_offset() + s.read_position() as u64)
            .unwrap_or(0)
    }

    /// Retention hook: drops the oldest segment and deletes its file.
    pub fn delete_first_segment(&self) -> bool {
        let mut segments = self.write_segments();
        if segments.is_empty() {
            return false;
        }
        let segment = segments.remove(0);
        if let Err(err) = segment.destroy() {
            warn!("failed to delete expired segment {}: {err}", segment.path().display());
        }
        true
    }

    /// Deletes every segment file and resets the pointers.
    pub fn destroy(&self) {
        let mut segments = self.write_segments();
        for segment in segments.drain(..) {
            if let Err(err) = segment.destroy() {
                warn!("failed to delete segment {}: {err}", segment.path().display());
            }
        }
        self.flushed_where.store(0, Ordering::Release);
        self.committed_where.store(0, Ordering::Release);
    }

    fn read_segments(&self) -> RwLockReadGuard<'_, Vec<Arc<Segment>>> {
        self.segments
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_segments(&self) -> RwLockWriteGuard<'_, Vec<Arc<Segment>>> {
        self.segments
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::append::RecordAppender;
    use crate::message::Message;
    use tempfile::TempDir;

    const SEGMENT_SIZE: usize = 1024;

    fn fill_one_record(store: &SegmentStore, appender: &mut RecordAppender, body: &[u8]) {
        let segment = store.last_segment_or_create(0).unwrap();
        let mut msg = Message::new("T", 0, body.to_vec());
        msg.store_timestamp = 1;
        msg.body_crc = crc32fast::hash(body);
        let result = segment.append(&msg, appender);
        assert!(result.is_ok(), "{:?}", result.status);
    }

    #[test]
    fn lazy_creation_names_segments_by_offset() {
        let dir = TempDir::new().unwrap();
        let store = SegmentStore::new(dir.path(), SEGMENT_SIZE, false);
        assert!(store.load());

        let first = store.last_segment_or_create(0).unwrap();
        assert_eq!(first.base_offset(), 0);
        assert!(dir.path().join("00000000000000000000").exists());

        // Fill the first segment so the next create rolls over.
        first.set_positions(SEGMENT_SIZE);
        let second = store.last_segment_or_create(0).unwrap();
        assert_eq!(second.base_offset(), SEGMENT_SIZE as u64);
        assert!(dir.path().join("00000000000000001024").exists());
    }

    #[test]
    fn start_offset_seeds_first_base() {
        let dir = TempDir::new().unwrap();
        let store = SegmentStore::new(dir.path(), SEGMENT_SIZE, false);
        assert!(store.load());

        let segment = store.last_segment_or_create(5000).unwrap();
        // Aligned down to a segment boundary.
        assert_eq!(segment.base_offset(), 4096);
    }

    #[test]
    fn find_by_offset_resolves_and_falls_back() {
        let dir = TempDir::new().unwrap();
        let store = SegmentStore::new(dir.path(), SEGMENT_SIZE, false);
        assert!(store.load());

        let first = store.last_segment_or_create(0).unwrap();
        first.set_positions(SEGMENT_SIZE);
        store.last_segment_or_create(0).unwrap();

        assert_eq!(store.find_by_offset(10, false).unwrap().base_offset(), 0);
        assert_eq!(store.find_by_offset(1500, false).unwrap().base_offset(), 1024);
        assert!(store.find_by_offset(99_999, false).is_none());
        assert_eq!(store.find_by_offset(99_999, true).unwrap().base_offset(), 0);
    }

    #[test]
    fn flush_advances_global_pointer() {
        let dir = TempDir::new().unwrap();
        let store = SegmentStore::new(dir.path(), SEGMENT_SIZE, false);
        assert!(store.load());
        let mut appender = RecordAppender::new(1024);

        fill_one_record(&store, &mut appender, b"hello");
        assert_eq!(store.flushed_where(), 0);

        assert!(!store.flush(0));
        assert_eq!(store.flushed_where(), 97);
        // Nothing further to flush.
        assert!(store.flush(0));
    }

    #[test]
    fn truncate_rewinds_and_destroys() {
        let dir = TempDir::new().unwrap();
        let store = SegmentStore::new(dir.path(), SEGMENT_SIZE, false);
        assert!(store.load());

        let first = store.last_segment_or_create(0).unwrap();
        first.set_positions(SEGMENT_SIZE);
        let second = store.last_segment_or_create(0).unwrap();
        second.set_positions(SEGMENT_SIZE);
        let third = store.last_segment_or_create(0).unwrap();
        third.set_positions(100);

        store.truncate_to(1500);
        let segments = store.segments();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].wrote_position(), SEGMENT_SIZE);
        assert_eq!(segments[1].wrote_position(), 1500 - 1024);
        assert!(!dir.path().join("00000000000000002048").exists());
    }

    #[test]
    fn reload_after_restart() {
        let dir = TempDir::new().unwrap();
        {
            let store = SegmentStore::new(dir.path(), SEGMENT_SIZE, false);
            assert!(store.load());
            let first = store.last_segment_or_create(0).unwrap();
            first.set_positions(SEGMENT_SIZE);
            store.last_segment_or_create(0).unwrap();
        }

        let store = SegmentStore::new(dir.path(), SEGMENT_SIZE, false);
        assert!(store.load());
        let segments = store.segments();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].base_offset(), 0);
        assert_eq!(segments[1].base_offset(), 1024);
        // Freshly mapped segments report their full extent until recovery
        // rewinds them.
        assert_eq!(store.max_offset(), 2048);
    }

    #[test]
    fn load_rejects_size_mismatch() {
        let dir = TempDir::new().unwrap();
        {
            let store = SegmentStore::new(dir.path(), SEGMENT_SIZE, false);
            assert!(store.load());
            store.last_segment_or_create(0).unwrap();
        }

        let store = SegmentStore::new(dir.path(), 2048, false);
        assert!(!store.load());
    }

    #[test]
    fn min_max_offsets() {
        let dir = TempDir::new().unwrap();
        let store = SegmentStore::new(dir.path(), SEGMENT_SIZE, false);
        assert!(store.load());
        assert_eq!(store.min_offset(), 0);
        assert_eq!(store.max_offset(), 0);

        let mut appender = RecordAppender::new(1024);
        fill_one_record(&store, &mut appender, b"hello");
        assert_eq!(store.max_offset(), 97);

        assert!(store.delete_first_segment());
        assert_eq!(store.segments().len(), 0);
    }
}
