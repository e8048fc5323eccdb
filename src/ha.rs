use std::sync::Arc;

use crate::flush::GroupCommitRequest;

/// Replication transport consumed by the commit log.
///
/// The transport itself lives outside this crate; the commit log only needs
/// the rendezvous: ask whether the replica is close enough to wait for,
/// hand over a flush target, and prod the transfer loop.
pub trait HaService: Send + Sync {
    /// Whether the replica lags `target_offset` by less than the configured
    /// window. Outside the window the master does not wait.
    fn is_slave_ok(&self, target_offset: u64) -> bool;

    /// Registers a rendezvous completed once the replica acknowledges
    /// `target_offset`.
    fn put_request(&self, request: Arc<GroupCommitRequest>);

    /// Wakes transfer threads blocked on new data.
    fn notify_waiters(&self);
}
