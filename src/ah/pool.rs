//! C5 - AH pool and wait list.
//!
//! Grounded on `lws_header_table_attach`/`__lws_header_table_detach`: a
//! fixed-size pool of [`AllocatedHeader`]s guarded by a lock (the
//! original's per-thread "pt-lock"), with a FIFO wait list for connections
//! that arrive when every AH in the pool is in use, plus a leaf lock
//! enforcing a per-peer cap across all shards.
//!
//! The original partitions pools per OS thread, one epoll loop per thread
//! owning many connections. This crate's connections are one-tokio-task-
//! each rather than epoll-multiplexed, so there's no "thread that owns many
//! connections" to key a pool on. Partitioning is done per **shard**
//! instead (round-robin assignment at accept time, stable for the
//! connection's life) - same requirement as the original (don't collapse
//! into a process-wide singleton pool), different partition key.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;

use super::AllocatedHeader;
use crate::limits::{AhLimits, PeerLimits};

/// Identifies a peer for the purpose of the per-peer AH quota - typically a
/// hash of the remote socket address. Opaque to the pool itself.
pub(crate) type PeerId = u64;

/// A lightweight, `Copy` reference to one AH slot: which shard, which index
/// within that shard's `ah_list`. Mirrors the original's `wsi->ah` pointer
/// with an index instead, per the "indices not pointers" design note.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AhGuard {
    shard: usize,
    index: usize,
}

struct ShardState {
    ah_list: Vec<Box<AllocatedHeader>>,
    /// FIFO-arrival order, oldest at the front. Carries the waiting peer's
    /// id alongside its `Notify` so `detach` can scan for a waiter that's
    /// actually under quota instead of blindly waking whoever parked last.
    wait_list: VecDeque<(PeerId, Arc<Notify>)>,
}

/// Per-peer AH count, the "leaf" lock taken after a shard's pt-lock.
struct PeerQuota {
    counts: Mutex<HashMap<PeerId, usize>>,
}

impl PeerQuota {
    fn new() -> Self {
        Self {
            counts: Mutex::new(HashMap::new()),
        }
    }

    fn try_reserve(&self, peer: PeerId, max: usize) -> bool {
        let mut counts = self.counts.lock();
        let slot = counts.entry(peer).or_insert(0);
        if *slot >= max {
            return false;
        }
        *slot += 1;
        true
    }

    fn release(&self, peer: PeerId) {
        let mut counts = self.counts.lock();
        if let Some(slot) = counts.get_mut(&peer) {
            *slot = slot.saturating_sub(1);
            if *slot == 0 {
                counts.remove(&peer);
            }
        }
    }

    /// Non-mutating check: would `peer` still be under quota right now.
    /// Used to scan the wait list without reserving on behalf of a waiter
    /// that isn't the one ultimately chosen.
    fn under_cap(&self, peer: PeerId, max: usize) -> bool {
        let counts = self.counts.lock();
        counts.get(&peer).copied().unwrap_or(0) < max
    }
}

/// The full set of per-shard AH pools for one server.
pub(crate) struct AhPoolSet {
    shards: Box<[Mutex<ShardState>]>,
    peer_quota: PeerQuota,
    peer_limits: PeerLimits,
    ah_limits: AhLimits,
    next_shard: AtomicUsize,
}

impl AhPoolSet {
    /// Builds a pool with `shard_count` shards, each pre-populated with
    /// `ah_limits.pool_size` AHs (no per-request allocation, matching the
    /// crate's zero-allocation-after-startup design).
    pub(crate) fn new(ah_limits: AhLimits, peer_limits: PeerLimits, shard_count: usize) -> Self {
        let shard_count = shard_count.max(1);
        let shards = (0..shard_count)
            .map(|_| {
                let ah_list = (0..ah_limits.pool_size)
                    .map(|_| Box::new(AllocatedHeader::new(&ah_limits)))
                    .collect();
                Mutex::new(ShardState {
                    ah_list,
                    wait_list: VecDeque::new(),
                })
            })
            .collect();

        Self {
            shards,
            peer_quota: PeerQuota::new(),
            peer_limits,
            ah_limits,
            next_shard: AtomicUsize::new(0),
        }
    }

    pub(crate) fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Assigns a shard to a new connection, round-robin, stable for the
    /// connection's lifetime once picked.
    pub(crate) fn pick_shard(&self) -> usize {
        self.next_shard.fetch_add(1, Ordering::Relaxed) % self.shard_count()
    }

    /// Acquires an AH for `peer` on `shard`, waiting on that shard's FIFO
    /// wait list if the pool is full or the peer is already at its quota.
    pub(crate) async fn attach(&self, shard: usize, peer: PeerId) -> AhGuard {
        loop {
            let notify = {
                let mut state = self.shards[shard].lock();
                if let Some(index) = Self::find_free(&state.ah_list) {
                    if self
                        .peer_quota
                        .try_reserve(peer, self.peer_limits.max_ah_per_peer)
                    {
                        let ah = &mut state.ah_list[index];
                        ah.in_use = true;
                        ah.assigned_at = Some(Instant::now());
                        return AhGuard { shard, index };
                    }
                }
                let notify = Arc::new(Notify::new());
                state.wait_list.push_back((peer, notify.clone()));
                notify
            };
            notify.notified().await;
        }
    }

    fn find_free(ah_list: &[Box<AllocatedHeader>]) -> Option<usize> {
        ah_list.iter().position(|ah| !ah.in_use)
    }

    /// Releases an AH back to its shard's pool, resetting it for reuse, and
    /// wakes a waiter per the "last eligible in scan order" handoff rule:
    /// scan the wait list oldest-first, remembering the last entry whose
    /// peer is still under quota, then wake only that one. A peer parked
    /// ahead of its own still-held AHs is skipped rather than woken onto a
    /// slot it would immediately fail to claim.
    pub(crate) fn detach(&self, guard: AhGuard, peer: PeerId) {
        let mut state = self.shards[guard.shard].lock();
        {
            let ah = &mut state.ah_list[guard.index];
            ah.reset();
            ah.in_use = false;
            ah.assigned_at = None;
        }
        self.peer_quota.release(peer);

        let max = self.peer_limits.max_ah_per_peer;
        let mut chosen = None;
        for (i, (waiting_peer, _)) in state.wait_list.iter().enumerate() {
            if self.peer_quota.under_cap(*waiting_peer, max) {
                chosen = Some(i);
            }
        }
        if let Some(i) = chosen {
            let (_, notify) = state.wait_list.remove(i).expect("index from this scan");
            drop(state);
            notify.notify_one();
        }
    }

    /// Diagnostic-only sweep: logs a warning for any AH held past
    /// `ah_limits.held_too_long_warn`. Never reclaims or fails the AH - the
    /// 3-second check in the original is purely observational.
    pub(crate) fn warn_held_too_long(&self) {
        let threshold = self.ah_limits.held_too_long_warn;
        for (shard_idx, shard) in self.shards.iter().enumerate() {
            let state = shard.lock();
            for (idx, ah) in state.ah_list.iter().enumerate() {
                if let Some(assigned) = ah.assigned_at {
                    if assigned.elapsed() > threshold {
                        tracing::warn!(
                            shard = shard_idx,
                            index = idx,
                            held_for = ?assigned.elapsed(),
                            "AH held unusually long"
                        );
                    }
                }
            }
        }
    }

    pub(crate) fn with<R>(&self, guard: AhGuard, f: impl FnOnce(&AllocatedHeader) -> R) -> R {
        let state = self.shards[guard.shard].lock();
        f(&state.ah_list[guard.index])
    }

    pub(crate) fn with_mut<R>(
        &self,
        guard: AhGuard,
        f: impl FnOnce(&mut AllocatedHeader) -> R,
    ) -> R {
        let mut state = self.shards[guard.shard].lock();
        f(&mut state.ah_list[guard.index])
    }
}
