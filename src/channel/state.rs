//! The channel rendezvous engine (spec.md §4.2, component C).

use crate::channel::config::{ChannelConfig, OverflowPolicy};
use crate::channel::entry::{Queue, QueueEntry, ReaderEntry, WriterEntry};
use crate::error::ChannelError;
use crate::offer::{self, TwoPhaseOffer};

/// Everything guarded by a channel's private critical section.
pub(crate) struct ChannelState<T> {
    pub(crate) readers: Queue<ReaderEntry<T>>,
    pub(crate) writers: Queue<WriterEntry<T>>,
    /// `-1` when not retiring; otherwise the number of remaining
    /// peer-transfers before the channel latches `Retired` (spec.md §3).
    pub(crate) retire_countdown: i64,
    pub(crate) retired: bool,
}

impl<T> ChannelState<T> {
    pub(crate) fn new() -> Self {
        Self {
            readers: Queue::default(),
            writers: Queue::default(),
            retire_countdown: -1,
            retired: false,
        }
    }

    pub(crate) fn is_retiring(&self) -> bool {
        self.retire_countdown >= 0
    }

    pub(crate) fn buffered_writer_count(&self) -> usize {
        self.writers.entries.iter().take_while(|w| w.is_buffered()).count()
    }
}

/// Outcome of matching a request against the opposite queue.
pub(crate) enum MatchOutcome<T> {
    Committed(T),
    /// The request's own offer has already been taken elsewhere.
    Cancelled,
    /// No peer was found; the caller decides between buffering, enqueueing,
    /// or failing with `Retired`/`Timeout`.
    NoMatch,
}

/// Read-path matching loop (spec.md §4.2 "Core algorithm") against
/// `state.writers`. `self_offer` is the read request's own offer, probed
/// fresh against every writer candidate.
pub(crate) async fn match_read<T>(
    state: &mut ChannelState<T>,
    self_offer: &Option<TwoPhaseOffer>,
) -> Result<MatchOutcome<T>, ChannelError> {
    loop {
        let Some(front) = state.writers.entries.front() else {
            return Ok(MatchOutcome::NoMatch);
        };

        if front.promise_already_resolved() {
            state.writers.entries.pop_front();
            continue;
        }

        if !offer::probe(self_offer).await {
            return Ok(MatchOutcome::Cancelled);
        }

        let writer_offer = state.writers.entries.front().unwrap().offer.clone();
        if !offer::probe(&writer_offer).await {
            // The writer's offer is already spoken for elsewhere; drop it
            // and withdraw our own probe before retrying the next head.
            state.writers.entries.pop_front();
            offer::withdraw(self_offer);
            continue;
        }

        if let Err(e) = offer::commit(self_offer) {
            offer::withdraw(&writer_offer);
            return Err(e);
        }

        let mut w = state.writers.entries.pop_front().unwrap();
        return match offer::commit(&w.offer) {
            Ok(()) => {
                let value = w.take_value();
                if let Some(tx) = w.completion.take() {
                    let _ = tx.send(Ok(()));
                }
                Ok(MatchOutcome::Committed(value))
            }
            Err(e) => {
                if let Some(tx) = w.completion.take() {
                    let _ = tx.send(Err(ChannelError::user_msg(e.to_string())));
                }
                Err(e)
            }
        };
    }
}

/// Write-path matching loop against `state.readers`; symmetric to
/// [`match_read`]. On success the matched reader already has its value.
/// Returns the value back on `NoMatch`/`Cancelled` so the caller can decide
/// what to do with it next.
pub(crate) async fn match_write<T>(
    state: &mut ChannelState<T>,
    value: T,
    self_offer: &Option<TwoPhaseOffer>,
) -> (Result<MatchOutcome<()>, ChannelError>, Option<T>) {
    loop {
        if state.readers.is_empty() {
            return (Ok(MatchOutcome::NoMatch), Some(value));
        }

        if !offer::probe(self_offer).await {
            return (Ok(MatchOutcome::Cancelled), Some(value));
        }

        let reader_offer = state.readers.entries.front().unwrap().offer.clone();
        if !offer::probe(&reader_offer).await {
            state.readers.entries.pop_front();
            offer::withdraw(self_offer);
            continue;
        }

        if let Err(e) = offer::commit(self_offer) {
            offer::withdraw(&reader_offer);
            return (Err(e), Some(value));
        }

        let r = state.readers.entries.pop_front().unwrap();
        return match offer::commit(&r.offer) {
            Ok(()) => {
                r.succeed(value);
                (Ok(MatchOutcome::Committed(())), None)
            }
            Err(e) => {
                r.fail(ChannelError::user_msg(e.to_string()));
                (Err(e), None)
            }
        };
    }
}

/// After a successful read-path transfer drained the writer queue, one
/// previously-waiting writer may now fall within the buffer window
/// (spec.md §4.2.3). At most one entry is absorbed per call.
pub(crate) async fn replenish_buffer<T>(state: &mut ChannelState<T>, buffer_size: usize) {
    if buffer_size == 0 || state.writers.len() < buffer_size {
        return;
    }
    let idx = buffer_size - 1;
    if state.writers.entries[idx].is_buffered() {
        return;
    }
    let candidate_offer = state.writers.entries[idx].offer.clone();
    if offer::probe(&candidate_offer).await {
        match offer::commit(&candidate_offer) {
            Ok(()) => state.writers.entries[idx].mark_buffered(),
            Err(e) => {
                let entry = state.writers.entries.remove(idx).unwrap();
                entry.fail(e);
            }
        }
    } else {
        state.writers.entries.remove(idx);
    }
}

/// Whether a newly-submitted write, finding no waiting reader, lands
/// directly in the buffered prefix instead of queueing (spec.md §3: the
/// buffered prefix is always contiguous from the front).
pub(crate) fn can_buffer<T>(state: &ChannelState<T>, config: &ChannelConfig) -> bool {
    let prefix = state.buffered_writer_count();
    prefix == state.writers.len() && prefix < config.buffer_size
}

/// Applies the overflow policy to the *unbuffered suffix* of the writer
/// queue (spec.md Open Questions: buffered entries are never eviction
/// candidates). Returns the entry evicted, if any, for the caller to fail.
pub(crate) fn apply_writer_overflow<T>(
    state: &mut ChannelState<T>,
    config: &ChannelConfig,
) -> Result<Option<WriterEntry<T>>, ()> {
    let Some(max) = config.max_pending_writers else {
        return Ok(None);
    };
    let buffered_prefix = state.buffered_writer_count();
    let unbuffered_len = state.writers.len() - buffered_prefix;
    if unbuffered_len < max {
        return Ok(None);
    }
    match config.writers_overflow_policy {
        OverflowPolicy::Reject => Err(()),
        OverflowPolicy::EvictOldest => Ok(state.writers.entries.remove(buffered_prefix)),
        OverflowPolicy::EvictNewest => Ok(state.writers.entries.pop_back()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deadline::Deadline;
    use futures::executor::block_on;

    #[test]
    fn match_read_returns_no_match_on_empty_writer_queue() {
        let mut state: ChannelState<u32> = ChannelState::new();
        let result = block_on(match_read(&mut state, &None));
        assert!(matches!(result, Ok(MatchOutcome::NoMatch)));
    }

    #[test]
    fn match_read_commits_against_a_buffered_writer() {
        let mut state: ChannelState<u32> = ChannelState::new();
        state.writers.entries.push_back(WriterEntry::buffered(7));
        let result = block_on(match_read(&mut state, &None)).unwrap();
        match result {
            MatchOutcome::Committed(v) => assert_eq!(v, 7),
            _ => panic!("expected a match"),
        }
        assert!(state.writers.is_empty());
    }

    #[test]
    fn can_buffer_is_false_once_prefix_has_a_gap() {
        let cfg = ChannelConfig::new("c").buffer_size(2);
        let mut state: ChannelState<u32> = ChannelState::new();
        state.writers.entries.push_back(WriterEntry::buffered(1));
        assert!(can_buffer(&state, &cfg));
        let (tx, _rx) = futures::channel::oneshot::channel();
        state.writers.entries.push_back(WriterEntry::new(None, Some(tx), Deadline::Infinite, 2));
        assert!(!can_buffer(&state, &cfg));
    }
}
