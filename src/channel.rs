// Copyright (c) 2025, The AMQP Transport Authors
// MIT License
// All rights reserved.

//! # Borrowed Channels and Confirm Bookkeeping
//!
//! This module provides the channel handle the connection manager lends out
//! for one dispatch or one consumer, together with the per-channel ledger
//! that correlates outstanding publishes with their publisher confirms.
//!
//! The ledger assigns a strictly monotonic sequence number to every publish
//! before its frame is written, which removes the race between sending and
//! the broker's acknowledgment. Entries are removed when the confirm
//! resolves, whichever way it resolves, and the whole ledger is purged when
//! a channel is discarded so stale completions can never fire after
//! teardown.

use lapin::Channel;
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
};
use tracing::warn;

/// Correlates in-flight publishes with their confirms on one channel.
#[derive(Debug, Default)]
pub struct ConfirmLedger {
    next: AtomicU64,
    entries: Mutex<BTreeMap<u64, String>>,
}

impl ConfirmLedger {
    fn entries(&self) -> MutexGuard<'_, BTreeMap<u64, String>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Reserves the next sequence number for a publish of the given message.
    ///
    /// Must be called before the frame is written. The returned entry
    /// removes itself from the ledger when dropped, so resolution by ack,
    /// nack, timeout, or cancellation all clean up the same way.
    pub(crate) fn reserve(self: &Arc<Self>, message_id: &str) -> PendingConfirm {
        let sequence = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        self.entries().insert(sequence, message_id.to_owned());
        PendingConfirm {
            ledger: Arc::clone(self),
            sequence,
        }
    }

    /// Removes every outstanding entry, returning the ids of the messages
    /// whose confirms will never arrive.
    pub(crate) fn purge(&self) -> Vec<String> {
        let mut entries = self.entries();
        let abandoned: Vec<String> = entries.values().cloned().collect();
        entries.clear();
        abandoned
    }

    /// Number of publishes currently awaiting a confirm.
    pub fn in_flight(&self) -> usize {
        self.entries().len()
    }

    fn remove(&self, sequence: u64) {
        self.entries().remove(&sequence);
    }
}

/// An outstanding publish awaiting its confirm.
///
/// Holds the channel-scoped sequence number assigned to the publish. The
/// ledger entry lives exactly as long as this value.
pub(crate) struct PendingConfirm {
    ledger: Arc<ConfirmLedger>,
    sequence: u64,
}

impl PendingConfirm {
    /// The sequence number assigned to this publish.
    pub(crate) fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl Drop for PendingConfirm {
    fn drop(&mut self) {
        self.ledger.remove(self.sequence);
    }
}

/// A channel borrowed from the connection manager.
///
/// Owned by whichever operation requested it; never used concurrently by
/// two operations. Returned to the pool on healthy release, discarded on
/// protocol-level error.
pub struct PooledChannel {
    channel: Channel,
    ledger: Arc<ConfirmLedger>,
    confirms_enabled: bool,
}

impl PooledChannel {
    pub(crate) fn new(channel: Channel, confirms_enabled: bool) -> PooledChannel {
        PooledChannel {
            channel,
            ledger: Arc::new(ConfirmLedger::default()),
            confirms_enabled,
        }
    }

    /// The underlying protocol channel.
    pub fn raw(&self) -> &Channel {
        &self.channel
    }

    /// Whether publisher confirms were selected on this channel.
    pub fn confirms_enabled(&self) -> bool {
        self.confirms_enabled
    }

    /// The confirm ledger scoped to this channel's lifetime.
    pub(crate) fn ledger(&self) -> &Arc<ConfirmLedger> {
        &self.ledger
    }

    /// Whether the channel can still carry frames.
    pub(crate) fn is_usable(&self) -> bool {
        self.channel.status().connected()
    }

    /// Purges the confirm ledger ahead of discarding the channel.
    ///
    /// Every outstanding publish on this channel resolves as failed; their
    /// message ids are logged so the loss is visible.
    pub(crate) fn discard(&self) {
        let abandoned = self.ledger.purge();
        if !abandoned.is_empty() {
            warn!(
                count = abandoned.len(),
                "discarding channel with unconfirmed publishes"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequences_are_strictly_monotonic() {
        let ledger = Arc::new(ConfirmLedger::default());
        let first = ledger.reserve("m1");
        let second = ledger.reserve("m2");
        let third = ledger.reserve("m3");
        assert!(first.sequence() < second.sequence());
        assert!(second.sequence() < third.sequence());
    }

    #[test]
    fn resolution_removes_the_entry() {
        let ledger = Arc::new(ConfirmLedger::default());
        let pending = ledger.reserve("m1");
        assert_eq!(ledger.in_flight(), 1);
        drop(pending);
        assert_eq!(ledger.in_flight(), 0);
    }

    #[test]
    fn purge_returns_the_abandoned_message_ids() {
        let ledger = Arc::new(ConfirmLedger::default());
        let _first = ledger.reserve("m1");
        let _second = ledger.reserve("m2");
        let abandoned = ledger.purge();
        assert_eq!(abandoned, vec!["m1".to_owned(), "m2".to_owned()]);
        assert_eq!(ledger.in_flight(), 0);
    }

    #[test]
    fn confirms_observe_publish_order_on_one_channel() {
        let ledger = Arc::new(ConfirmLedger::default());
        let pending: Vec<PendingConfirm> =
            (0..5).map(|i| ledger.reserve(&format!("m{i}"))).collect();
        let sequences: Vec<u64> = pending.iter().map(PendingConfirm::sequence).collect();
        let mut sorted = sequences.clone();
        sorted.sort_unstable();
        assert_eq!(sequences, sorted);
    }
}
