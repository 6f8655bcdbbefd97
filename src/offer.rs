//! The two-phase committed-choice protocol (spec.md §4.1, component A).
//!
//! One logical operation can tentatively bind to many channels via
//! [`TwoPhaseOffer::offer`], but [`TwoPhaseOffer::commit`] succeeds for at
//! most one of them. A caller that receives `true` from `offer` must
//! eventually call exactly one of `commit`/`withdraw`.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::channel::oneshot;
use parking_lot::Mutex;

use crate::deadline::Deadline;
use crate::error::ChannelError;
use crate::expiration::ExpirationService;

type CommitCallback = Box<dyn FnOnce() -> Result<(), ChannelError> + Send>;

struct LockState {
    /// `true` from the moment some caller's `offer()` returned `true` until
    /// that caller calls `commit`/`withdraw`.
    held: bool,
    /// Suspended `offer()` calls, FIFO. Resolved with `true` ("now free to
    /// try, you are the new holder") by `withdraw`, or `false` ("taken") by
    /// `commit`.
    waiters: VecDeque<oneshot::Sender<bool>>,
}

struct OfferInner {
    taken: AtomicBool,
    first_committer: AtomicBool,
    deadline: Deadline,
    state: Mutex<LockState>,
    commit_callback: Mutex<Option<CommitCallback>>,
}

/// Shared by one logical caller across one or more channels.
#[derive(Clone)]
pub struct TwoPhaseOffer {
    inner: Arc<OfferInner>,
}

impl fmt::Debug for TwoPhaseOffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TwoPhaseOffer").finish_non_exhaustive()
    }
}

impl TwoPhaseOffer {
    pub fn new(deadline: Deadline) -> Self {
        Self::with_commit_callback(deadline, None)
    }

    /// `commit_callback` runs exactly once, inside `commit()`, before
    /// waiters are released. If it returns `Err`, the offer is still marked
    /// `taken` (spec.md §4.1: "it was already past the point of no return")
    /// and the error propagates to the committing caller.
    pub fn with_commit_callback(deadline: Deadline, commit_callback: Option<CommitCallback>) -> Self {
        Self {
            inner: Arc::new(OfferInner {
                taken: AtomicBool::new(false),
                first_committer: AtomicBool::new(false),
                deadline,
                state: Mutex::new(LockState {
                    held: false,
                    waiters: VecDeque::new(),
                }),
                commit_callback: Mutex::new(commit_callback),
            }),
        }
    }

    pub fn deadline(&self) -> Deadline {
        self.inner.deadline
    }

    /// Returns `true` exactly once per offer lifetime. Once some caller has
    /// been granted the lock, concurrent callers suspend until it commits
    /// (`false`) or withdraws (`true`, and the waiter becomes the new
    /// holder).
    pub async fn offer(&self) -> bool {
        if self.inner.taken.load(Ordering::Acquire) {
            return false;
        }

        let rx = {
            let mut state = self.inner.state.lock();
            if !state.held {
                state.held = true;
                None
            } else {
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                Some(rx)
            }
        };

        match rx {
            None => true,
            // A dropped sender (the holder's offer object itself is never
            // dropped while a waiter exists — both commit and withdraw
            // always resolve every reachable waiter) is treated as abort.
            Some(rx) => rx.await.unwrap_or(false),
        }
    }

    /// Called by a caller who received `true` from `offer` and has decided
    /// to proceed. Latches `taken`, runs the commit callback (if any), then
    /// releases the lock and resolves every suspended waiter with `false`.
    pub fn commit(&self) -> Result<(), ChannelError> {
        self.inner.taken.store(true, Ordering::Release);

        let callback = self.inner.commit_callback.lock().take();
        let result = match callback {
            Some(cb) => cb(),
            None => Ok(()),
        };

        let mut state = self.inner.state.lock();
        state.held = false;
        for waiter in state.waiters.drain(..) {
            let _ = waiter.send(false);
        }

        result
    }

    /// Called by a caller who received `true` from `offer` and has decided
    /// not to proceed with this channel. Releases the lock; if a waiter is
    /// queued, exactly one is promoted to holder (resolved with `true`).
    pub fn withdraw(&self) {
        let mut state = self.inner.state.lock();
        match state.waiters.pop_front() {
            Some(waiter) => {
                // Ownership transfers directly: `held` stays true for the
                // promoted waiter, no window where the lock looks free.
                let _ = waiter.send(true);
            }
            None => state.held = false,
        }
    }

    /// One-shot compare-and-swap, true exactly once across all callers.
    /// Gates which of several concurrent completion paths is allowed to
    /// resolve the user-visible future (spec.md §4.1).
    pub fn try_become_first_committer(&self) -> bool {
        self.inner
            .first_committer
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_taken(&self) -> bool {
        self.inner.taken.load(Ordering::Acquire)
    }

    /// Called once all candidate channels have been probed. If the deadline
    /// has already passed, fires the timeout path synchronously through
    /// `try_become_first_committer`; otherwise registers with `expiration`.
    pub fn probe_phase_complete(&self, expiration: &ExpirationService, on_timeout: impl FnOnce() + Send + 'static) {
        if self.inner.deadline.has_elapsed() {
            if self.try_become_first_committer() {
                on_timeout();
            }
            return;
        }
        if let Some(at) = self.inner.deadline.instant() {
            let this = self.clone();
            expiration.schedule(at, move || {
                if this.try_become_first_committer() {
                    on_timeout();
                }
            });
        }
    }
}

/// The degenerate null-offer variant (spec.md §4.1 last paragraph): used
/// internally by [`crate::channel::Channel`] for offerless operations. A
/// missing offer is unconditionally acceptable and needs no commit/withdraw.
pub(crate) async fn probe(offer: &Option<TwoPhaseOffer>) -> bool {
    match offer {
        Some(offer) => offer.offer().await,
        None => true,
    }
}

pub(crate) fn commit(offer: &Option<TwoPhaseOffer>) -> Result<(), ChannelError> {
    match offer {
        Some(offer) => offer.commit(),
        None => Ok(()),
    }
}

pub(crate) fn withdraw(offer: &Option<TwoPhaseOffer>) {
    if let Some(offer) = offer {
        offer.withdraw();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn uncontended_offer_returns_true_immediately() {
        let offer = TwoPhaseOffer::new(Deadline::Infinite);
        assert!(block_on(offer.offer()));
    }

    #[test]
    fn offer_after_commit_returns_false_without_blocking() {
        let offer = TwoPhaseOffer::new(Deadline::Infinite);
        assert!(block_on(offer.offer()));
        offer.commit().unwrap();
        assert!(!block_on(offer.offer()));
    }

    #[test]
    fn withdraw_promotes_exactly_one_waiter() {
        let offer = TwoPhaseOffer::new(Deadline::Infinite);
        assert!(block_on(offer.offer()));

        let offer2 = offer.clone();
        let offer3 = offer.clone();
        let resolved = Arc::new(AtomicUsize::new(0));
        let r2 = resolved.clone();
        let r3 = resolved.clone();

        let t2 = std::thread::spawn(move || {
            let got = block_on(offer2.offer());
            if got {
                r2.fetch_add(1, Ordering::SeqCst);
            }
            got
        });
        let t3 = std::thread::spawn(move || {
            let got = block_on(offer3.offer());
            if got {
                r3.fetch_add(1, Ordering::SeqCst);
            }
            got
        });

        // Give both waiters a chance to enqueue before withdrawing.
        std::thread::sleep(std::time::Duration::from_millis(20));
        offer.withdraw();

        let a = t2.join().unwrap();
        let b = t3.join().unwrap();
        // Exactly one of the two waiters is promoted; the other still waits
        // on the lock the promoted caller now holds (it will resolve once
        // that caller commits or withdraws in turn).
        assert_eq!(a as usize + b as usize, resolved.load(Ordering::SeqCst));
    }

    #[test]
    fn commit_resolves_all_waiters_with_false() {
        let offer = TwoPhaseOffer::new(Deadline::Infinite);
        assert!(block_on(offer.offer()));

        let offer2 = offer.clone();
        let waiter = std::thread::spawn(move || block_on(offer2.offer()));
        std::thread::sleep(std::time::Duration::from_millis(20));

        offer.commit().unwrap();
        assert!(!waiter.join().unwrap());
    }

    #[test]
    fn first_committer_gate_is_one_shot() {
        let offer = TwoPhaseOffer::new(Deadline::Infinite);
        assert!(offer.try_become_first_committer());
        assert!(!offer.try_become_first_committer());
    }

    #[test]
    fn commit_callback_error_still_latches_taken() {
        #[derive(Debug, thiserror::Error)]
        #[error("boom")]
        struct Boom;

        let offer = TwoPhaseOffer::with_commit_callback(
            Deadline::Infinite,
            Some(Box::new(|| Err(ChannelError::user(Boom)))),
        );
        assert!(block_on(offer.offer()));
        assert!(offer.commit().is_err());
        assert!(offer.is_taken());
    }

    #[test]
    fn null_offer_always_probes_true_and_ignores_commit_withdraw() {
        let none: Option<TwoPhaseOffer> = None;
        assert!(block_on(probe(&none)));
        assert!(commit(&none).is_ok());
        withdraw(&none);
    }
}
