//! A rendezvous channel: readers and writers are matched pairwise, never
//! sharing memory directly (spec.md §4.2, component C).

pub mod config;
pub(crate) mod entry;
pub(crate) mod state;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_utils::CachePadded;
use futures::channel::oneshot;
use futures::lock::Mutex as AsyncMutex;

pub use config::{ChannelConfig, OverflowPolicy};

use entry::{QueueEntry, ReaderEntry, WriterEntry};
use state::{ChannelState, MatchOutcome};

use crate::deadline::Deadline;
use crate::error::{ChannelError, ConfigError};
use crate::expiration::ExpirationService;
use crate::offer::{self, TwoPhaseOffer};

struct ChannelInner<T> {
    config: ChannelConfig,
    state: AsyncMutex<ChannelState<T>>,
    joined_readers: CachePadded<AtomicUsize>,
    joined_writers: CachePadded<AtomicUsize>,
    retired: CachePadded<AtomicBool>,
    expiration: ExpirationService,
}

/// A cheap-to-clone handle to one rendezvous channel. Every clone shares the
/// same underlying queues; dropping the last clone tears down the channel's
/// background timer registrations but never implicitly retires it (retiring
/// is a deliberate call, see [`Channel::retire`]).
pub struct Channel<T> {
    inner: Arc<ChannelInner<T>>,
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T: Send + 'static> Channel<T> {
    /// Builds a channel with its own dedicated deadline timer. Most programs
    /// with more than a handful of channels should prefer
    /// [`Channel::with_expiration`] and share one [`ExpirationService`].
    pub fn new(config: ChannelConfig) -> Result<Self, ConfigError> {
        Self::with_expiration(config, ExpirationService::new())
    }

    pub fn with_expiration(config: ChannelConfig, expiration: ExpirationService) -> Result<Self, ConfigError> {
        config.validate(0)?;
        Ok(Self {
            inner: Arc::new(ChannelInner {
                config,
                state: AsyncMutex::new(ChannelState::new()),
                joined_readers: CachePadded::new(AtomicUsize::new(0)),
                joined_writers: CachePadded::new(AtomicUsize::new(0)),
                retired: CachePadded::new(AtomicBool::new(false)),
                expiration,
            }),
        })
    }

    pub fn name(&self) -> &str {
        self.inner.config.name()
    }

    /// Fast, lock-free query. Only ever transitions `false -> true`.
    pub fn is_retired(&self) -> bool {
        self.inner.retired.load(Ordering::Acquire)
    }

    /// Attempts to read one value, optionally as part of an external choice
    /// (`offer`) and bounded by `deadline` (spec.md §4.2 "Core algorithm").
    pub async fn read(&self, deadline: Deadline, offer: Option<TwoPhaseOffer>) -> Result<T, ChannelError> {
        let mut guard = self.inner.state.lock().await;

        if guard.retired {
            return Err(ChannelError::Retired);
        }

        match state::match_read(&mut guard, &offer).await? {
            MatchOutcome::Committed(value) => {
                state::replenish_buffer(&mut guard, self.inner.config.buffer_size).await;
                self.advance_retirement(&mut guard);
                return Ok(value);
            }
            MatchOutcome::Cancelled => return Err(ChannelError::Cancelled),
            MatchOutcome::NoMatch => {}
        }

        if let Some(err) = self.reject_if_retiring(&mut guard) {
            return Err(err);
        }

        if deadline.has_elapsed() {
            return Err(ChannelError::Timeout);
        }

        let (tx, rx) = oneshot::channel();
        guard.readers.maybe_cleanup().await;
        let entry = ReaderEntry::new(offer, tx, deadline);
        match guard.readers.push_with_overflow(
            entry,
            self.inner.config.max_pending_readers,
            self.inner.config.readers_overflow_policy,
        ) {
            Err(entry) => {
                drop(guard);
                entry.fail(ChannelError::Overflow);
                return Err(ChannelError::Overflow);
            }
            Ok(Some(evicted)) => evicted.fail(ChannelError::Overflow),
            Ok(None) => {}
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

    /// Attempts to write one value, optionally as part of an external choice
    /// (`offer`) and bounded by `deadline`. May land directly in the
    /// buffered prefix instead of waiting for a reader (spec.md §3).
    pub async fn write(&self, value: T, deadline: Deadline, offer: Option<TwoPhaseOffer>) -> Result<(), ChannelError> {
        let mut guard = self.inner.state.lock().await;

        if guard.retired {
            return Err(ChannelError::Retired);
        }

        let (outcome, value) = state::match_write(&mut guard, value, &offer).await;
        match outcome? {
            MatchOutcome::Committed(()) => {
                self.advance_retirement(&mut guard);
                return Ok(());
            }
            MatchOutcome::Cancelled => return Err(ChannelError::Cancelled),
            MatchOutcome::NoMatch => {}
        }
        let value = value.expect("match_write returns the value back on NoMatch");

        if let Some(err) = self.reject_if_retiring(&mut guard) {
            return Err(err);
        }

        if state::can_buffer(&guard, &self.inner.config) {
            if !offer::probe(&offer).await {
                return Err(ChannelError::Cancelled);
            }
            offer::commit(&offer)?;
            guard.writers.entries.push_back(WriterEntry::buffered(value));
            return Ok(());
        }

        if deadline.has_elapsed() {
            return Err(ChannelError::Timeout);
        }

        match state::apply_writer_overflow(&mut guard, &self.inner.config) {
            Err(()) => return Err(ChannelError::Overflow),
            Ok(Some(evicted)) => evicted.fail(ChannelError::Overflow),
            Ok(None) => {}
        }

        let (tx, rx) = oneshot::channel();
        guard.writers.maybe_cleanup().await;
        guard.writers.entries.push_back(WriterEntry::new(offer, Some(tx), deadline, value));
        if let Some(at) = deadline.instant() {
            self.register_deadline(at);
        }
        drop(guard);

        match rx.await {
            Ok(result) => result,
            Err(_canceled) => Err(ChannelError::Cancelled),
        }
    }

    /// Begins retirement. `immediate == true` additionally fails every
    /// already-buffered writer with `Retired` before the countdown starts
    /// (spec.md §4.2 "Retirement"). Idempotent once retiring has begun.
    pub async fn retire(&self, immediate: bool) {
        let mut guard = self.inner.state.lock().await;
        if guard.retired || guard.is_retiring() {
            return;
        }

        if immediate {
            let mut remaining = std::collections::VecDeque::new();
            for w in guard.writers.entries.drain(..) {
                if w.is_buffered() {
                    w.fail(ChannelError::Retired);
                } else {
                    remaining.push_back(w);
                }
            }
            guard.writers.entries = remaining;
        }

        let buffered = guard.buffered_writer_count();
        guard.retire_countdown = buffered as i64 + 1;
        tracing::info!(channel = self.inner.config.name(), countdown = guard.retire_countdown, immediate, "channel retiring");

        if guard.readers.is_empty() && guard.writers.is_empty() {
            self.finish_retirement(&mut guard);
        }
    }

    /// Joins the channel as a reader or writer; rejects once retired.
    pub async fn join(&self, as_reader: bool) -> Result<(), ChannelError> {
        let guard = self.inner.state.lock().await;
        if guard.retired {
            return Err(ChannelError::Retired);
        }
        drop(guard);
        let counter = if as_reader { &self.inner.joined_readers } else { &self.inner.joined_writers };
        counter.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Leaves the channel. When the last participant of either side leaves,
    /// the channel enters graceful retirement (spec.md Glossary: Join/Leave).
    pub async fn leave(&self, as_reader: bool) {
        if self.is_retired() {
            return;
        }
        let counter = if as_reader { &self.inner.joined_readers } else { &self.inner.joined_writers };
        let remaining = counter.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining == 0 {
            self.retire(false).await;
        }
    }

    fn advance_retirement(&self, guard: &mut ChannelState<T>) {
        if guard.retire_countdown > 0 {
            guard.retire_countdown -= 1;
        }
        if guard.is_retiring() && guard.readers.is_empty() && guard.writers.is_empty() {
            self.finish_retirement(guard);
        }
    }

    /// If the channel is retiring and this request found no peer, it fails
    /// with `Retired` instead of queueing: retirement admits no new waiters
    /// (spec.md §8 end-to-end "Retirement drains"/"Immediate retirement").
    fn reject_if_retiring(&self, guard: &mut ChannelState<T>) -> Option<ChannelError> {
        if !guard.is_retiring() {
            return None;
        }
        if guard.readers.is_empty() && guard.writers.is_empty() {
            self.finish_retirement(guard);
        }
        Some(ChannelError::Retired)
    }

    fn finish_retirement(&self, guard: &mut ChannelState<T>) {
        guard.retired = true;
        self.inner.retired.store(true, Ordering::Release);
        guard.readers.fail_all(|| ChannelError::Retired);
        guard.writers.fail_all(|| ChannelError::Retired);
        tracing::info!(channel = self.inner.config.name(), "channel retired");
    }

    /// Schedules a coalesced expiry sweep of both queues at `at`. Multiple
    /// overlapping schedules are harmless: the sweep only removes entries
    /// whose own deadline has actually elapsed.
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
