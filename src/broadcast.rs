//! A channel variant that pairs one writer with every currently joined
//! reader in a single atomic step, gated by reader-count barriers
//! (spec.md §4.3, component D).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_utils::CachePadded;
use futures::channel::oneshot;
use futures::lock::Mutex as AsyncMutex;

use crate::channel::config::{ChannelConfig, OverflowPolicy};
use crate::channel::entry::{Queue, QueueEntry, ReaderEntry, WriterEntry};
use crate::deadline::Deadline;
use crate::error::{ChannelError, ConfigError};
use crate::expiration::ExpirationService;
use crate::offer::{self, TwoPhaseOffer};

/// Construction parameters for a [`BroadcastChannel`] (spec.md §6).
#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    base: ChannelConfig,
    minimum_readers: usize,
    initial_barrier: Option<usize>,
}

impl BroadcastConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            base: ChannelConfig::new(name),
            minimum_readers: 1,
            initial_barrier: None,
        }
    }

    pub fn max_pending_readers(mut self, n: Option<usize>) -> Self {
        self.base = self.base.max_pending_readers(n);
        self
    }

    pub fn max_pending_writers(mut self, n: Option<usize>) -> Self {
        self.base = self.base.max_pending_writers(n);
        self
    }

    pub fn readers_overflow_policy(mut self, policy: OverflowPolicy) -> Self {
        self.base = self.base.readers_overflow_policy(policy);
        self
    }

    pub fn writers_overflow_policy(mut self, policy: OverflowPolicy) -> Self {
        self.base = self.base.writers_overflow_policy(policy);
        self
    }

    /// The reader count required for every broadcast once `initial_barrier`
    /// (if any) has been consumed. Defaults to 1.
    pub fn minimum_readers(mut self, n: usize) -> Self {
        self.minimum_readers = n;
        self
    }

    /// An extra one-time bump to the barrier, required only for the very
    /// first broadcast; permanently cleared after it succeeds (spec.md §4.3).
    pub fn initial_barrier(mut self, n: Option<usize>) -> Self {
        self.initial_barrier = n;
        self
    }

    fn floor(&self) -> usize {
        self.minimum_readers.max(self.initial_barrier.unwrap_or(0))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.base.validate(self.floor())
    }

    pub fn name(&self) -> &str {
        self.base.name()
    }
}

struct BroadcastState<T> {
    readers: Queue<ReaderEntry<T>>,
    writers: Queue<WriterEntry<T>>,
    retired: bool,
    joined_readers: usize,
    joined_writers: usize,
    minimum_readers: usize,
    initial_barrier: Option<usize>,
}

impl<T> BroadcastState<T> {
    fn new(minimum_readers: usize, initial_barrier: Option<usize>) -> Self {
        Self {
            readers: Queue::default(),
            writers: Queue::default(),
            retired: false,
            joined_readers: 0,
            joined_writers: 0,
            minimum_readers,
            initial_barrier,
        }
    }

    /// The number of readers a broadcast would need to pair with right now,
    /// or `None` if fewer readers are joined than the barrier requires
    /// (spec.md §4.3 step 1).
    fn batch_size(&self) -> Option<usize> {
        let floor = self.minimum_readers.max(self.initial_barrier.unwrap_or(0));
        if self.joined_readers > 0 && self.joined_readers >= floor {
            Some(self.joined_readers)
        } else {
            None
        }
    }
}

/// Repeatedly attempts broadcast transfers until none more are possible
/// (spec.md §4.3 "Repeat while conditions allow further broadcasts").
async fn run_match_loop<T: Clone>(state: &mut BroadcastState<T>) {
    while try_broadcast_once(state).await {}
}

/// Attempts exactly one broadcast transfer: one writer paired with a full
/// batch of `batch_size()` readers, all committed atomically. Returns `true`
/// if a transfer occurred (the caller should try again; more may now be
/// possible).
async fn try_broadcast_once<T: Clone>(state: &mut BroadcastState<T>) -> bool {
    loop {
        let Some(front) = state.writers.entries.front() else {
            return false;
        };
        if front.promise_already_resolved() {
            let stale = state.writers.entries.pop_front().unwrap();
            stale.fail(ChannelError::Cancelled);
            continue;
        }
        break;
    }

    let Some(threshold) = state.batch_size() else {
        return false;
    };
    if state.readers.len() < threshold {
        return false;
    }

    let writer_offer = state.writers.entries.front().unwrap().offer.clone();
    if !offer::probe(&writer_offer).await {
        let stale = state.writers.entries.pop_front().unwrap();
        stale.fail(ChannelError::Cancelled);
        return true;
    }

    // Assemble a full batch of held reader probes, permanently dropping
    // every candidate that declines (spec.md §4.3 step "c").
    let mut held: VecDeque<ReaderEntry<T>> = VecDeque::new();
    while held.len() < threshold {
        let Some(candidate) = state.readers.entries.pop_front() else {
            break;
        };
        if candidate.promise_already_resolved() {
            continue;
        }
        if offer::probe(candidate.offer()).await {
            held.push_back(candidate);
        }
        // A decline means this candidate's offer went elsewhere; it is not
        // restored to the queue.
    }

    if held.len() < threshold {
        offer::withdraw(&writer_offer);
        while let Some(h) = held.pop_back() {
            offer::withdraw(h.offer());
            state.readers.entries.push_front(h);
        }
        return false;
    }

    let mut writer = state.writers.entries.pop_front().unwrap();
    if let Err(e) = offer::commit(&writer_offer) {
        while let Some(h) = held.pop_back() {
            offer::withdraw(h.offer());
            state.readers.entries.push_front(h);
        }
        writer.fail(ChannelError::user_msg(e.to_string()));
        return true;
    }

    let value = writer.take_value();
    if let Some(tx) = writer.completion.take() {
        let _ = tx.send(Ok(()));
    }

    for reader in held {
        match offer::commit(reader.offer()) {
            Ok(()) => reader.succeed(value.clone()),
            Err(e) => reader.fail(ChannelError::user_msg(e.to_string())),
        }
    }

    // "initialBarrier is permanently cleared after the first broadcast"
    // (spec.md §4.3 step "e").
    state.initial_barrier = None;

    true
}

struct BroadcastInner<T> {
    config: BroadcastConfig,
    state: AsyncMutex<BroadcastState<T>>,
    retired: CachePadded<AtomicBool>,
    expiration: ExpirationService,
}

/// A channel in which one writer's value is delivered to every currently
/// joined reader in a single atomic step (spec.md §4.3, component D).
pub struct BroadcastChannel<T> {
    inner: Arc<BroadcastInner<T>>,
}

impl<T> Clone for BroadcastChannel<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T: Clone + Send + 'static> BroadcastChannel<T> {
    pub fn new(config: BroadcastConfig) -> Result<Self, ConfigError> {
        Self::with_expiration(config, ExpirationService::new())
    }

    pub fn with_expiration(config: BroadcastConfig, expiration: ExpirationService) -> Result<Self, ConfigError> {
        config.validate()?;
        let state = BroadcastState::new(config.minimum_readers, config.initial_barrier);
        Ok(Self {
            inner: Arc::new(BroadcastInner {
                config,
                state: AsyncMutex::new(state),
                retired: CachePadded::new(AtomicBool::new(false)),
                expiration,
            }),
        })
    }

    pub fn name(&self) -> &str {
        self.inner.config.name()
    }

    pub fn is_retired(&self) -> bool {
        self.inner.retired.load(Ordering::Acquire)
    }

    /// Requests to receive the next broadcast value.
    pub async fn read(&self, deadline: Deadline, offer: Option<TwoPhaseOffer>) -> Result<T, ChannelError> {
        let mut guard = self.inner.state.lock().await;
        if guard.retired {
            return Err(ChannelError::Retired);
        }

        let (tx, rx) = oneshot::channel();
        guard.readers.maybe_cleanup().await;
        let entry = ReaderEntry::new(offer, tx, deadline);
        let id = entry.id;
        match guard.readers.push_with_overflow(
            entry,
            self.inner.config.base.max_pending_readers,
            self.inner.config.base.readers_overflow_policy,
        ) {
            Err(entry) => {
                drop(guard);
                entry.fail(ChannelError::Overflow);
                return Err(ChannelError::Overflow);
            }
            Ok(Some(evicted)) => evicted.fail(ChannelError::Overflow),
            Ok(None) => {}
        }

        run_match_loop(&mut guard).await;

        if deadline.has_elapsed()
            && let Some(stale) = guard.readers.remove_by_id(id)
        {
            drop(guard);
            stale.fail(ChannelError::Timeout);
            return Err(ChannelError::Timeout);
        }
        if let Some(at) = deadline.instant() {
            self.register_deadline(at);
        }
        drop(guard);

        match rx.await {
            Ok(result) => result,
            Err(_canceled) => Err(ChannelError::Cancelled),
        }
    }

    /// Broadcasts one value to the current batch of joined readers once
    /// enough of them are waiting (spec.md §4.3).
    pub async fn write(&self, value: T, deadline: Deadline, offer: Option<TwoPhaseOffer>) -> Result<(), ChannelError> {
        let mut guard = self.inner.state.lock().await;
        if guard.retired {
            return Err(ChannelError::Retired);
        }

        let (tx, rx) = oneshot::channel();
        guard.writers.maybe_cleanup().await;
        let entry = WriterEntry::new(offer, Some(tx), deadline, value);
        let id = entry.id;
        match guard.writers.push_with_overflow(
            entry,
            self.inner.config.base.max_pending_writers,
            self.inner.config.base.writers_overflow_policy,
        ) {
            Err(entry) => {
                drop(guard);
                entry.fail(ChannelError::Overflow);
                return Err(ChannelError::Overflow);
            }
            Ok(Some(evicted)) => evicted.fail(ChannelError::Overflow),
            Ok(None) => {}
        }

        run_match_loop(&mut guard).await;

        if deadline.has_elapsed()
            && let Some(stale) = guard.writers.remove_by_id(id)
        {
            drop(guard);
            stale.fail(ChannelError::Timeout);
            return Err(ChannelError::Timeout);
        }
        if let Some(at) = deadline.instant() {
            self.register_deadline(at);
        }
        drop(guard);

        match rx.await {
            Ok(result) => result,
            Err(_canceled) => Err(ChannelError::Cancelled),
        }
    }

    /// Joins as a reader or writer and re-runs the match loop: newly joined
    /// readers can immediately complete a barrier that was just satisfied
    /// (spec.md §4.3 "On any state change ... join").
    pub async fn join(&self, as_reader: bool) -> Result<(), ChannelError> {
        let mut guard = self.inner.state.lock().await;
        if guard.retired {
            return Err(ChannelError::Retired);
        }
        if as_reader {
            guard.joined_readers += 1;
        } else {
            guard.joined_writers += 1;
        }
        run_match_loop(&mut guard).await;
        Ok(())
    }

    /// Leaves the channel; the last participant of either side retires it
    /// (spec.md Glossary: Join/Leave).
    pub async fn leave(&self, as_reader: bool) {
        let mut guard = self.inner.state.lock().await;
        if guard.retired {
            return;
        }
        if as_reader {
            guard.joined_readers = guard.joined_readers.saturating_sub(1);
        } else {
            guard.joined_writers = guard.joined_writers.saturating_sub(1);
        }
        let last_of_either = guard.joined_readers == 0 || guard.joined_writers == 0;
        run_match_loop(&mut guard).await;
        if last_of_either {
            self.finish_retirement(&mut guard);
        }
    }

    /// Adjusts the steady-state reader barrier and immediately re-checks
    /// whether a broadcast is now possible (spec.md §4.3 "Configurable
    /// mutators").
    pub async fn set_minimum_readers(&self, n: usize) {
        let mut guard = self.inner.state.lock().await;
        guard.minimum_readers = n;
        run_match_loop(&mut guard).await;
    }

    /// Adjusts the one-time first-broadcast barrier and immediately
    /// re-checks whether a broadcast is now possible.
    pub async fn set_next_barrier_count(&self, n: Option<usize>) {
        let mut guard = self.inner.state.lock().await;
        guard.initial_barrier = n;
        run_match_loop(&mut guard).await;
    }

    /// Retires the channel: a broadcast channel carries no buffered prefix,
    /// so graceful and immediate retirement coincide — every pending
    /// request simply fails with `Retired`.
    pub async fn retire(&self, _immediate: bool) {
        let mut guard = self.inner.state.lock().await;
        if guard.retired {
            return;
        }
        self.finish_retirement(&mut guard);
    }

    fn finish_retirement(&self, guard: &mut BroadcastState<T>) {
        guard.retired = true;
        self.inner.retired.store(true, Ordering::Release);
        guard.readers.fail_all(|| ChannelError::Retired);
        guard.writers.fail_all(|| ChannelError::Retired);
        tracing::info!(channel = self.inner.config.name(), "broadcast channel retired");
    }

    fn register_deadline(&self, at: Instant) {
        let this = self.clone();
        self.inner.expiration.schedule(at, move || {
            futures::executor::block_on(this.sweep_expired());
        });
    }

    async fn sweep_expired(&self) {
        let mut guard = self.inner.state.lock().await;
        let now = Instant::now();
        let slack = self.inner.expiration.slack();
        for r in guard.readers.take_expired(now, slack) {
            r.fail(ChannelError::Timeout);
        }
        for w in guard.writers.take_expired(now, slack) {
            w.fail(ChannelError::Timeout);
        }
    }
}
