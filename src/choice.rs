//! Composes N individual channel operations into one logical "read/write
//! from any of N" request that completes on the first success (spec.md
//! §4.5, component E).

use std::any::Any;

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use rand::seq::SliceRandom;

use crate::channel::Channel;
use crate::deadline::Deadline;
use crate::error::{ChannelError, ConfigError};
use crate::expiration::ExpirationService;
use crate::offer::TwoPhaseOffer;

/// How sub-requests are ordered before submission (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectPolicy {
    /// Submit in the order given.
    First,
    /// Submit in a freshly shuffled order.
    Random,
    /// Stateful round-robin rotation; only meaningful for a long-lived
    /// `MultiChannelSet`, not this ad-hoc driver (spec.md §4.5).
    Fair,
}

fn submission_order(n: usize, policy: SelectPolicy) -> Result<Vec<usize>, ConfigError> {
    match policy {
        SelectPolicy::First => Ok((0..n).collect()),
        SelectPolicy::Random => {
            let mut order: Vec<usize> = (0..n).collect();
            order.shuffle(&mut rand::thread_rng());
            Ok(order)
        }
        SelectPolicy::Fair => Err(ConfigError::FairPolicyNotSupported),
    }
}

type Submit<R> = Box<dyn FnOnce(TwoPhaseOffer) -> BoxFuture<'static, Result<R, ChannelError>> + Send>;

/// Drives the shared two-phase offer across an ordered set of sub-requests:
/// submits each with an infinite per-channel deadline (the offer itself
/// owns `deadline`), races them, and arbitrates the winner against the
/// offer's own timeout through `try_become_first_committer` (spec.md §4.1,
/// §4.5 steps 3-5).
async fn run<R: Send + 'static>(
    submits: Vec<Submit<R>>,
    policy: SelectPolicy,
    deadline: Deadline,
    expiration: &ExpirationService,
) -> Result<(R, usize), ChannelError> {
    if submits.is_empty() {
        return Err(ChannelError::Cancelled);
    }
    let order = submission_order(submits.len(), policy).map_err(|e| ChannelError::user(e))?;
    let offer = TwoPhaseOffer::new(deadline);

    let mut submits: Vec<Option<Submit<R>>> = submits.into_iter().map(Some).collect();
    let mut pending = FuturesUnordered::new();
    for idx in order {
        if offer.is_taken() {
            break;
        }
        let submit = submits[idx].take().expect("each index is visited at most once");
        let this_offer = offer.clone();
        pending.push(async move { (idx, submit(this_offer).await) });
    }

    let (timeout_tx, timeout_rx) = futures::channel::oneshot::channel::<()>();
    offer.probe_phase_complete(expiration, move || {
        let _ = timeout_tx.send(());
    });
    let mut timeout_rx = timeout_rx.fuse();

    loop {
        futures::select! {
            next = pending.next() => match next {
                None => return Err(ChannelError::Cancelled),
                Some((idx, Ok(value))) => {
                    if offer.try_become_first_committer() {
                        return Ok((value, idx));
                    }
                    // The offer's own timeout already won the arbitration
                    // race; this result is stranded and dropped.
                }
                Some((_idx, Err(_cancelled))) => continue,
            },
            _ = timeout_rx => {
                if offer.try_become_first_committer() {
                    return Err(ChannelError::Timeout);
                }
            }
        }
    }
}

/// The type-erased single result of whichever sub-operation won.
pub type AnyResult = Result<(Box<dyn Any + Send>, usize), ChannelError>;

/// A single entry point composing N individual channel operations (each
/// either read or write) into one logical operation (spec.md §4.5).
pub struct ExternalChoice;

impl ExternalChoice {
    /// Reads from whichever of `channels` is ready first.
    pub async fn read<T: Send + 'static>(
        channels: &[Channel<T>],
        policy: SelectPolicy,
        deadline: Deadline,
        expiration: &ExpirationService,
    ) -> Result<(T, usize), ChannelError> {
        let submits: Vec<Submit<T>> = channels
            .iter()
            .cloned()
            .map(|c| -> Submit<T> {
                Box::new(move |offer| async move { c.read(Deadline::Infinite, Some(offer)).await }.boxed())
            })
            .collect();
        run(submits, policy, deadline, expiration).await
    }

    /// Writes whichever of `requests` (channel, value) finds a peer first.
    pub async fn write<T: Send + 'static>(
        requests: Vec<(Channel<T>, T)>,
        policy: SelectPolicy,
        deadline: Deadline,
        expiration: &ExpirationService,
    ) -> Result<usize, ChannelError> {
        let submits: Vec<Submit<()>> = requests
            .into_iter()
            .map(|(c, v)| -> Submit<()> {
                Box::new(move |offer| async move { c.write(v, Deadline::Infinite, Some(offer)).await }.boxed())
            })
            .collect();
        run(submits, policy, deadline, expiration).await.map(|(_, idx)| idx)
    }

    /// The type-erased variant: each [`AnyRequest`] already knows whether it
    /// reads or writes (spec.md §4.5 "untyped variant").
    pub async fn any(
        requests: Vec<AnyRequest>,
        policy: SelectPolicy,
        deadline: Deadline,
        expiration: &ExpirationService,
    ) -> AnyResult {
        let submits: Vec<Submit<Box<dyn Any + Send>>> = requests.into_iter().map(|r| r.submit).collect();
        run(submits, policy, deadline, expiration).await
    }
}

/// One type-erased sub-request: a channel reference bundled with whether to
/// read or write it, for callers that route requests dynamically instead of
/// through a statically-typed slice (spec.md §4.5 last paragraph).
pub struct AnyRequest {
    submit: Submit<Box<dyn Any + Send>>,
}

impl AnyRequest {
    pub fn read<T: Send + 'static>(channel: Channel<T>) -> Self {
        Self {
            submit: Box::new(move |offer| {
                async move {
                    channel
                        .read(Deadline::Infinite, Some(offer))
                        .await
                        .map(|v| Box::new(v) as Box<dyn Any + Send>)
                }
                .boxed()
            }),
        }
    }

    pub fn write<T: Send + 'static>(channel: Channel<T>, value: T) -> Self {
        Self {
            submit: Box::new(move |offer| {
                async move {
                    channel
                        .write(value, Deadline::Infinite, Some(offer))
                        .await
                        .map(|()| Box::new(()) as Box<dyn Any + Send>)
                }
                .boxed()
            }),
        }
    }
}
