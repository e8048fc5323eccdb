//! Background durability services.
//!
//! Three cooperating services drive pages from the writer to disk:
//!
//! - `GroupCommitService` (sync-flush mode): producers enqueue a target
//!   offset and block on a one-shot rendezvous until the log is flushed
//!   through it. Requests double-buffer between a producer-side write list
//!   and a service-side read list so producers never block the service
//!   beyond a brief list push.
//! - `FlushService` (async mode, no transient buffer): flushes on an
//!   interval, holding back until `least_pages` are dirty; the thorough
//!   interval caps how long that suppression may defer a flush.
//! - `CommitService` (transient buffer enabled): copies buffered bytes
//!   into the mapped region on an interval and wakes the flush service
//!   when it moved data.
//!
//! Service errors are logged and retried on the next tick, never
//! propagated.

use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{info, warn};

use crate::checkpoint::StoreCheckpoint;
use crate::segment_store::SegmentStore;

/// How long the group-commit loop sleeps between forced wakeups.
const GROUP_COMMIT_INTERVAL: Duration = Duration::from_millis(10);
/// Shutdown retries for the final flush/commit drain.
const SHUTDOWN_RETRIES: usize = 10;

/// A producer's rendezvous with the group-commit (or HA) service: carries
/// the offset the log must be flushed through and a one-shot completion
/// signal.
pub struct GroupCommitRequest {
    next_offset: u64,
    state: Mutex<Option<bool>>,
    completed: Condvar,
}

impl GroupCommitRequest {
    pub fn new(next_offset: u64) -> Arc<Self> {
        Arc::new(Self {
            next_offset,
            state: Mutex::new(None),
            completed: Condvar::new(),
        })
    }

    /// First byte past the record; the log is durable for this request
    /// once `flushed_where` reaches it.
    pub fn next_offset(&self) -> u64 {
        self.next_offset
    }

    /// Completes the rendezvous and releases the waiting producer.
    pub fn wakeup_customer(&self, ok: bool) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        *state = Some(ok);
        self.completed.notify_all();
    }

    /// Blocks until completion or `timeout`. Returns false on timeout or a
    /// failed flush.
    pub fn wait_for_flush(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        while state.is_none() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let Ok((guard, _)) = self.completed.wait_timeout(state, deadline - now) else {
                return false;
            };
            state = guard;
        }
        state.unwrap_or(false)
    }
}

/// Sleep/wake primitive for the service loops: `wake` is sticky until the
/// next `wait` observes it.
pub(crate) struct ServiceSignal {
    notified: Mutex<bool>,
    condvar: Condvar,
}

impl ServiceSignal {
    pub(crate) fn new() -> Self {
        Self {
            notified: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    pub(crate) fn wake(&self) {
        if let Ok(mut notified) = self.notified.lock() {
            *notified = true;
            self.condvar.notify_all();
        }
    }

    pub(crate) fn wait(&self, timeout: Duration) {
        let Ok(mut notified) = self.notified.lock() else {
            return;
        };
        if !*notified {
            if let Ok((guard, _)) = self.condvar.wait_timeout(notified, timeout) {
                notified = guard;
            } else {
                return;
            }
        }
        *notified = false;
    }
}

/// Rendezvous service for synchronous flush.
pub struct GroupCommitService {
    store: Arc<SegmentStore>,
    checkpoint: Arc<StoreCheckpoint>,
    write_list: Mutex<Vec<Arc<GroupCommitRequest>>>,
    signal: ServiceSignal,
    stopped: AtomicBool,
}

impl GroupCommitService {
    pub fn new(store: Arc<SegmentStore>, checkpoint: Arc<StoreCheckpoint>) -> Arc<Self> {
        Arc::new(Self {
            store,
            checkpoint,
            write_list: Mutex::new(Vec::new()),
            signal: ServiceSignal::new(),
            stopped: AtomicBool::new(false),
        })
    }

    /// Enqueues a rendezvous and wakes the service. The producer-side lock
    /// covers only the push.
    pub fn put_request(&self, request: Arc<GroupCommitRequest>) {
        if let Ok(mut write_list) = self.write_list.lock() {
            write_list.push(request);
        }
        self.signal.wake();
    }

    /// Wakes the service without a rendezvous; non-waiting messages rely on
    /// the empty-batch forced flush.
    pub fn wakeup(&self) {
        self.signal.wake();
    }

    pub fn start(self: &Arc<Self>) -> std::io::Result<JoinHandle<()>> {
        let service = Arc::clone(self);
        std::thread::Builder::new()
            .name("group-commit".into())
            .spawn(move || service.run())
    }

    pub fn request_stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.signal.wake();
    }

    fn run(&self) {
        info!("group commit service started");
        while !self.stopped.load(Ordering::Acquire) {
            self.signal.wait(GROUP_COMMIT_INTERVAL);
            self.do_commit(self.swap_requests());
        }

        // Producers may have slipped a request in after the stop flag was
        // observed; drain once more so no waiter stays blocked.
        std::thread::sleep(GROUP_COMMIT_INTERVAL);
        self.do_commit(self.swap_requests());
        info!("group commit service stopped");
    }

    fn swap_requests(&self) -> Vec<Arc<GroupCommitRequest>> {
        match self.write_list.lock() {
            Ok(mut write_list) => mem::take(&mut *write_list),
            Err(_) => Vec::new(),
        }
    }

    fn do_commit(&self, read_list: Vec<Arc<GroupCommitRequest>>) {
        if read_list.is_empty() {
            // A forced wake with no waiters still flushes, for messages
            // that chose not to wait.
            self.store.flush(0);
            return;
        }

        for request in read_list {
            // A record straddles at most two segments, so two passes
            // suffice to flush through any target.
            let mut flush_ok = false;
            for _ in 0..2 {
                flush_ok = self.store.flushed_where() >= request.next_offset();
                if flush_ok {
                    break;
                }
                self.store.flush(0);
            }
            request.wakeup_customer(flush_ok);
        }

        let timestamp = self.store.store_timestamp();
        if timestamp > 0 {
            self.checkpoint.set_physic_msg_timestamp(timestamp);
        }
    }
}

/// Interval flush for asynchronous durability.
pub struct FlushService {
    store: Arc<SegmentStore>,
    checkpoint: Arc<StoreCheckpoint>,
    interval: Duration,
    least_pages: usize,
    thorough_interval: Duration,
    signal: ServiceSignal,
    stopped: AtomicBool,
}

impl FlushService {
    pub fn new(
        store: Arc<SegmentStore>,
        checkpoint: Arc<StoreCheckpoint>,
        interval_ms: u64,
        least_pages: usize,
        thorough_interval_ms: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            checkpoint,
            interval: Duration::from_millis(interval_ms),
            least_pages,
            thorough_interval: Duration::from_millis(thorough_interval_ms),
            signal: ServiceSignal::new(),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn wakeup(&self) {
        self.signal.wake();
    }

    pub fn start(self: &Arc<Self>) -> std::io::Result<JoinHandle<()>> {
        let service = Arc::clone(self);
        std::thread::Builder::new()
            .name("commitlog-flush".into())
            .spawn(move || service.run())
    }

    pub fn request_stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.signal.wake();
    }

    fn run(&self) {
        info!("flush service started");
        let mut last_thorough = Instant::now();
        while !self.stopped.load(Ordering::Acquire) {
            self.signal.wait(self.interval);

            let mut least_pages = self.least_pages;
            if last_thorough.elapsed() >= self.thorough_interval {
                least_pages = 0;
                last_thorough = Instant::now();
            }

            let begin = Instant::now();
            self.store.flush(least_pages);
            let timestamp = self.store.store_timestamp();
            if timestamp > 0 {
                self.checkpoint.set_physic_msg_timestamp(timestamp);
                if let Err(err) = self.checkpoint.flush() {
                    warn!("checkpoint flush failed: {err}");
                }
            }
            let elapsed = begin.elapsed();
            if elapsed > Duration::from_millis(500) {
                warn!("flush to disk took {} ms", elapsed.as_millis());
            }
        }

        // Normal shutdown flushes everything that is still dirty.
        let mut drained = false;
        for attempt in 0..SHUTDOWN_RETRIES {
            drained = self.store.flush(0);
            if drained {
                break;
            }
            info!("shutdown flush retry {}", attempt + 1);
        }
        if !drained {
            warn!("flush service stopped with dirty pages remaining");
        }
        info!("flush service stopped");
    }
}

/// Interval commit for the transient write buffer.
pub struct CommitService {
    store: Arc<SegmentStore>,
    flush_service: Arc<FlushService>,
    interval: Duration,
    least_pages: usize,
    thorough_interval: Duration,
    signal: ServiceSignal,
    stopped: AtomicBool,
}

impl CommitService {
    pub fn new(
        store: Arc<SegmentStore>,
        flush_service: Arc<FlushService>,
        interval_ms: u64,
        least_pages: usize,
        thorough_interval_ms: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            flush_service,
            interval: Duration::from_millis(interval_ms),
            least_pages,
            thorough_interval: Duration::from_millis(thorough_interval_ms),
            signal: ServiceSignal::new(),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn wakeup(&self) {
        self.signal.wake();
    }

    pub fn start(self: &Arc<Self>) -> std::io::Result<JoinHandle<()>> {
        let service = Arc::clone(self);
        std::thread::Builder::new()
            .name("commitlog-commit".into())
            .spawn(move || service.run())
    }

    pub fn request_stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.signal.wake();
    }

    fn run(&self) {
        info!("commit service started");
        let mut last_thorough = Instant::now();
        while !self.stopped.load(Ordering::Acquire) {
            self.signal.wait(self.interval);

            let mut least_pages = self.least_pages;
            if last_thorough.elapsed() >= self.thorough_interval {
                least_pages = 0;
                last_thorough = Instant::now();
            }

            let nothing_to_do = self.store.commit(least_pages);
            if !nothing_to_do {
                // Data reached the mapped region; let the flusher persist it.
                self.flush_service.wakeup();
            }
        }

        let mut drained = false;
        for attempt in 0..SHUTDOWN_RETRIES {
            drained = self.store.commit(0);
            if drained {
                break;
            }
            info!("shutdown commit retry {}", attempt + 1);
        }
        if !drained {
            warn!("commit service stopped with buffered pages remaining");
        }
        info!("commit service stopped");
    }
}
