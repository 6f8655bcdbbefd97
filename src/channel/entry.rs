//! Queue entries and the opportunistic-cleanup queue wrapper shared by
//! [`crate::channel::Channel`] and [`crate::broadcast::BroadcastChannel`]
//! (spec.md §3, §4.2.4).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use futures::channel::oneshot;

use crate::channel::config::OverflowPolicy;
use crate::deadline::Deadline;
use crate::error::ChannelError;
use crate::offer::TwoPhaseOffer;

/// Minimum opportunistic-cleanup threshold (spec.md §4.2.4).
const CLEANUP_MIN: usize = 100;

static NEXT_ENTRY_ID: AtomicU64 = AtomicU64::new(0);

/// Process-wide unique id, used only to cancel one specific queued entry
/// (e.g. a broadcast request whose deadline elapsed before its batch ever
/// became ready) without scanning by offer identity.
pub(crate) fn next_entry_id() -> u64 {
    NEXT_ENTRY_ID.fetch_add(1, Ordering::Relaxed)
}

pub(crate) trait QueueEntry {
    fn offer(&self) -> &Option<TwoPhaseOffer>;
    fn deadline(&self) -> Deadline;
    fn id(&self) -> u64;
    fn fail(self, err: ChannelError);
}

#[derive(Debug)]
pub(crate) struct ReaderEntry<T> {
    pub(crate) id: u64,
    pub(crate) offer: Option<TwoPhaseOffer>,
    pub(crate) completion: oneshot::Sender<Result<T, ChannelError>>,
    pub(crate) deadline: Deadline,
}

impl<T> ReaderEntry<T> {
    pub(crate) fn new(offer: Option<TwoPhaseOffer>, completion: oneshot::Sender<Result<T, ChannelError>>, deadline: Deadline) -> Self {
        Self { id: next_entry_id(), offer, completion, deadline }
    }

    pub(crate) fn succeed(self, value: T) {
        let _ = self.completion.send(Ok(value));
    }

    /// Whether the caller that submitted this read already dropped its
    /// returned future (spec.md §4.2 step "c", symmetric for readers).
    pub(crate) fn promise_already_resolved(&self) -> bool {
        self.completion.is_canceled()
    }
}

impl<T> QueueEntry for ReaderEntry<T> {
    fn offer(&self) -> &Option<TwoPhaseOffer> {
        &self.offer
    }
    fn deadline(&self) -> Deadline {
        self.deadline
    }
    fn id(&self) -> u64 {
        self.id
    }
    fn fail(self, err: ChannelError) {
        let _ = self.completion.send(Err(err));
    }
}

#[derive(Debug)]
pub(crate) struct WriterEntry<T> {
    pub(crate) id: u64,
    pub(crate) offer: Option<TwoPhaseOffer>,
    /// `None` once the entry has entered the buffered prefix: its promise
    /// has already been resolved (spec.md §3).
    pub(crate) completion: Option<oneshot::Sender<Result<(), ChannelError>>>,
    pub(crate) deadline: Deadline,
    pub(crate) value: Option<T>,
}

impl<T> WriterEntry<T> {
    pub(crate) fn new(
        offer: Option<TwoPhaseOffer>,
        completion: Option<oneshot::Sender<Result<(), ChannelError>>>,
        deadline: Deadline,
        value: T,
    ) -> Self {
        Self { id: next_entry_id(), offer, completion, deadline, value: Some(value) }
    }

    /// A writer entry that is immediately buffered: no offer, no completion
    /// to wait on (its promise already resolved), infinite deadline.
    pub(crate) fn buffered(value: T) -> Self {
        Self { id: next_entry_id(), offer: None, completion: None, deadline: Deadline::Infinite, value: Some(value) }
    }

    pub(crate) fn is_buffered(&self) -> bool {
        self.completion.is_none()
    }

    /// Whether the caller that submitted this write already dropped its
    /// returned future — spec.md §4.2 step "c": "treat its offer as failed
    /// and discard it".
    pub(crate) fn promise_already_resolved(&self) -> bool {
        match &self.completion {
            Some(tx) => tx.is_canceled(),
            None => false,
        }
    }

    /// Moves the entry into the buffered prefix: resolves its promise with
    /// success, clears its offer, and makes its deadline infinite.
    pub(crate) fn mark_buffered(&mut self) {
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(Ok(()));
        }
        self.offer = None;
        self.deadline = Deadline::Infinite;
    }

    pub(crate) fn take_value(&mut self) -> T {
        self.value.take().expect("writer entry value consumed twice")
    }
}

impl<T> QueueEntry for WriterEntry<T> {
    fn offer(&self) -> &Option<TwoPhaseOffer> {
        &self.offer
    }
    fn deadline(&self) -> Deadline {
        self.deadline
    }
    fn id(&self) -> u64 {
        self.id
    }
    fn fail(self, err: ChannelError) {
        if let Some(tx) = self.completion {
            let _ = tx.send(Err(err));
        }
    }
}

/// A FIFO queue of pending entries with policy-driven overflow handling and
/// opportunistic pruning of entries whose external offer was consumed
/// elsewhere (spec.md §4.2.4).
pub(crate) struct Queue<E> {
    pub(crate) entries: VecDeque<E>,
    cleanup_threshold: usize,
}

impl<E> Default for Queue<E> {
    fn default() -> Self {
        Self {
            entries: VecDeque::new(),
            cleanup_threshold: CLEANUP_MIN,
        }
    }
}

impl<E: QueueEntry> Queue<E> {
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Pushes `entry`, applying `policy` if the queue is already at `max`.
    /// Returns the entry evicted by `EvictOldest`/`EvictNewest` for the
    /// caller to fail with `Overflow`, or `Err(entry)` if `Reject` applies
    /// to the entry itself.
    pub(crate) fn push_with_overflow(
        &mut self,
        entry: E,
        max: Option<usize>,
        policy: OverflowPolicy,
    ) -> Result<Option<E>, E> {
        if let Some(max) = max
            && self.entries.len() >= max
        {
            return match policy {
                OverflowPolicy::Reject => Err(entry),
                OverflowPolicy::EvictOldest => {
                    let evicted = self.entries.pop_front();
                    self.entries.push_back(entry);
                    Ok(evicted)
                }
                OverflowPolicy::EvictNewest => {
                    let evicted = self.entries.pop_back();
                    self.entries.push_back(entry);
                    Ok(evicted)
                }
            };
        }
        self.entries.push_back(entry);
        Ok(None)
    }

    /// Probes every entry once `cleanup_threshold` is exceeded; an entry
    /// whose offer still accepts is withdrawn again (side-effect-free) and
    /// kept, one that declines is dropped and failed with `Cancelled`.
    /// Resets the threshold to `max(MIN, len + MIN)`.
    pub(crate) async fn maybe_cleanup(&mut self) {
        if self.entries.len() <= self.cleanup_threshold {
            return;
        }
        let mut survivors = VecDeque::with_capacity(self.entries.len());
        for entry in self.entries.drain(..) {
            if crate::offer::probe(entry.offer()).await {
                crate::offer::withdraw(entry.offer());
                survivors.push_back(entry);
            } else {
                entry.fail(ChannelError::Cancelled);
            }
        }
        self.entries = survivors;
        self.cleanup_threshold = CLEANUP_MIN.max(self.entries.len() + CLEANUP_MIN);
    }

    /// Removes and returns every entry whose finite deadline has reached
    /// `now + slack`, ordered by deadline ascending (spec.md "Deadlines").
    pub(crate) fn take_expired(&mut self, now: Instant, slack: Duration) -> Vec<E> {
        let mut expired = Vec::new();
        let mut remaining = VecDeque::with_capacity(self.entries.len());
        for entry in self.entries.drain(..) {
            match entry.deadline() {
                Deadline::At(at) if at <= now + slack => expired.push(entry),
                _ => remaining.push_back(entry),
            }
        }
        self.entries = remaining;
        expired.sort_by_key(|e| e.deadline().instant());
        expired
    }

    pub(crate) fn fail_all(&mut self, mut err_for: impl FnMut() -> ChannelError) {
        for entry in self.entries.drain(..) {
            entry.fail(err_for());
        }
    }

    /// Removes one entry by id, regardless of its position. Used to cancel
    /// a specific request (e.g. a broadcast sub-request whose deadline
    /// elapsed before its batch ever became ready) without disturbing FIFO
    /// order of the rest.
    pub(crate) fn remove_by_id(&mut self, id: u64) -> Option<E> {
        let pos = self.entries.iter().position(|e| e.id() == id)?;
        self.entries.remove(pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;

    fn reader(deadline: Deadline) -> (ReaderEntry<u32>, oneshot::Receiver<Result<u32, ChannelError>>) {
        let (tx, rx) = oneshot::channel();
        (ReaderEntry::new(None, tx, deadline), rx)
    }

    #[test]
    fn evict_oldest_returns_the_head() {
        let mut q: Queue<ReaderEntry<u32>> = Queue::default();
        let (e1, _r1) = reader(Deadline::Infinite);
        let (e2, _r2) = reader(Deadline::Infinite);
        let (e3, _r3) = reader(Deadline::Infinite);
        q.push_with_overflow(e1, Some(2), OverflowPolicy::EvictOldest).unwrap();
        q.push_with_overflow(e2, Some(2), OverflowPolicy::EvictOldest).unwrap();
        let evicted = q
            .push_with_overflow(e3, Some(2), OverflowPolicy::EvictOldest)
            .unwrap();
        assert!(evicted.is_some());
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn reject_fails_the_incoming_entry() {
        let mut q: Queue<ReaderEntry<u32>> = Queue::default();
        let (e1, _r1) = reader(Deadline::Infinite);
        let (e2, _r2) = reader(Deadline::Infinite);
        q.push_with_overflow(e1, Some(1), OverflowPolicy::Reject).unwrap();
        let result = q.push_with_overflow(e2, Some(1), OverflowPolicy::Reject);
        assert!(result.is_err());
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn expired_entries_are_removed_in_deadline_order() {
        let mut q: Queue<ReaderEntry<u32>> = Queue::default();
        let now = Instant::now();
        let (e1, r1) = reader(Deadline::At(now - Duration::from_millis(5)));
        let (e2, r2) = reader(Deadline::At(now - Duration::from_millis(10)));
        let (e3, r3) = reader(Deadline::Infinite);
        q.entries.push_back(e1);
        q.entries.push_back(e2);
        q.entries.push_back(e3);

        let expired = q.take_expired(now, Duration::from_millis(1));
        assert_eq!(expired.len(), 2);
        assert_eq!(q.len(), 1);
        for e in expired {
            e.fail(ChannelError::Timeout);
        }
        assert!(matches!(block_on(r2).unwrap(), Err(ChannelError::Timeout)));
        assert!(matches!(block_on(r1).unwrap(), Err(ChannelError::Timeout)));
        drop(r3);
    }

    #[test]
    fn writer_entry_buffering_resolves_its_promise() {
        let (tx, rx) = oneshot::channel();
        let mut entry = WriterEntry::new(None, Some(tx), Deadline::Immediate, 42u32);
        assert!(!entry.is_buffered());
        entry.mark_buffered();
        assert!(entry.is_buffered());
        assert_eq!(entry.deadline, Deadline::Infinite);
        assert!(matches!(block_on(rx).unwrap(), Ok(())));
    }

    #[test]
    fn cleanup_drops_entries_whose_offer_is_already_taken() {
        let offer_taken = TwoPhaseOffer::new(Deadline::Infinite);
        block_on(offer_taken.offer());
        offer_taken.commit().unwrap();

        let offer_free = TwoPhaseOffer::new(Deadline::Infinite);

        let mut q: Queue<ReaderEntry<u32>> = Queue::default();
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        q.entries.push_back(ReaderEntry::new(Some(offer_taken), tx1, Deadline::Infinite));
        q.entries.push_back(ReaderEntry::new(Some(offer_free), tx2, Deadline::Infinite));

        // Force cleanup regardless of the default threshold.
        block_on(async {
            q.cleanup_threshold = 0;
            q.maybe_cleanup().await;
        });

        assert_eq!(q.len(), 1);
        assert!(matches!(block_on(rx1).unwrap(), Err(ChannelError::Cancelled)));
        drop(rx2);
    }
}
