//! Centralised deadline timer (spec.md §4.4, component B).
//!
//! A single background thread services every scheduled deadline across every
//! channel and offer in the process. Callbacks fire once, at or slightly
//! before their deadline — the allowed "advance-fire" slack `ε` is part of
//! the contract: a callback must treat any entry within `[now, now + ε]` as
//! expired.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

const DEFAULT_SLACK: Duration = Duration::from_millis(1);

type TimerCallback = Box<dyn FnOnce() + Send>;

struct TimerEntry {
    deadline: Instant,
    seq: u64,
    callback: TimerCallback,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for TimerEntry {}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

struct State {
    heap: BinaryHeap<Reverse<TimerEntry>>,
    shutdown: bool,
}

struct Inner {
    state: Mutex<State>,
    wake: Condvar,
    slack: Duration,
    next_seq: AtomicU64,
}

/// A cheap-to-clone handle to the shared deadline scheduler.
#[derive(Clone)]
pub struct ExpirationService {
    inner: Arc<Inner>,
}

impl ExpirationService {
    pub fn new() -> Self {
        Self::with_slack(DEFAULT_SLACK)
    }

    pub fn with_slack(slack: Duration) -> Self {
        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                heap: BinaryHeap::new(),
                shutdown: false,
            }),
            wake: Condvar::new(),
            slack,
            next_seq: AtomicU64::new(0),
        });

        let worker_inner = inner.clone();
        std::thread::Builder::new()
            .name("rendezvous-expiration".into())
            .spawn(move || run(worker_inner))
            .expect("failed to spawn expiration service thread");

        Self { inner }
    }

    /// Register `callback` to fire once, at or slightly before `deadline`.
    pub fn schedule(&self, deadline: Instant, callback: impl FnOnce() + Send + 'static) {
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        let mut state = self.inner.state.lock();
        if state.shutdown {
            tracing::warn!("expiration service scheduled after shutdown; firing immediately");
            drop(state);
            callback();
            return;
        }
        state.heap.push(Reverse(TimerEntry {
            deadline,
            seq,
            callback: Box::new(callback),
        }));
        drop(state);
        self.inner.wake.notify_one();
    }

    pub fn slack(&self) -> Duration {
        self.inner.slack
    }
}

impl Default for ExpirationService {
    fn default() -> Self {
        Self::new()
    }
}

impl ExpirationService {
    /// Stops the background thread. Pending callbacks are dropped, never
    /// invoked — callers that need the firm "Timeout on drop" behaviour must
    /// not call this while operations are outstanding.
    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock();
        state.shutdown = true;
        drop(state);
        self.inner.wake.notify_all();
    }
}

fn run(inner: Arc<Inner>) {
    loop {
        let mut state = inner.state.lock();
        loop {
            if state.shutdown {
                return;
            }
            match state.heap.peek() {
                None => {
                    inner.wake.wait(&mut state);
                }
                Some(Reverse(top)) => {
                    let now = Instant::now();
                    if top.deadline <= now + inner.slack {
                        break;
                    }
                    let timeout = top.deadline - now;
                    let _ = inner.wake.wait_for(&mut state, timeout);
                }
            }
        }

        // Drain every entry that is due right now, so one wakeup can fire a
        // burst of coalesced deadlines.
        let mut due = Vec::new();
        let now = Instant::now();
        while let Some(Reverse(top)) = state.heap.peek() {
            if top.deadline > now + inner.slack {
                break;
            }
            let Reverse(entry) = state.heap.pop().unwrap();
            due.push(entry.callback);
        }
        drop(state);

        for callback in due {
            callback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn fires_after_deadline() {
        let svc = ExpirationService::new();
        let (tx, rx) = mpsc::channel();
        svc.schedule(Instant::now() + Duration::from_millis(20), move || {
            tx.send(()).unwrap();
        });
        rx.recv_timeout(Duration::from_secs(1))
            .expect("callback should fire");
    }

    #[test]
    fn fires_immediately_for_past_deadline() {
        let svc = ExpirationService::new();
        let (tx, rx) = mpsc::channel();
        svc.schedule(Instant::now() - Duration::from_millis(5), move || {
            tx.send(()).unwrap();
        });
        rx.recv_timeout(Duration::from_millis(200))
            .expect("already-past deadlines fire promptly");
    }

    #[test]
    fn coalesces_many_deadlines_in_order() {
        let svc = ExpirationService::new();
        let (tx, rx) = mpsc::channel();
        let base = Instant::now() + Duration::from_millis(10);
        for i in (0..5).rev() {
            let tx = tx.clone();
            svc.schedule(base + Duration::from_millis(i), move || {
                tx.send(i).unwrap();
            });
        }
        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(rx.recv_timeout(Duration::from_secs(1)).unwrap());
        }
        let mut sorted = seen.clone();
        sorted.sort();
        assert_eq!(seen, sorted, "callbacks fire in deadline-ascending order");
    }

    #[test]
    fn shutdown_stops_the_worker() {
        let svc = ExpirationService::new();
        svc.shutdown();
        // Scheduling after shutdown fires inline rather than hanging forever.
        let (tx, rx) = mpsc::channel();
        svc.schedule(Instant::now() + Duration::from_secs(60), move || {
            tx.send(()).unwrap();
        });
        rx.recv_timeout(Duration::from_millis(200)).unwrap();
    }
}
