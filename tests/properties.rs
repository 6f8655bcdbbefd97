//! Property-based coverage of the universal invariants and round-trip laws
//! in spec.md §8.

use std::collections::HashSet;

use proptest::prelude::*;
use rendezvous::{Channel, ChannelConfig, Deadline};
use tokio::runtime::Runtime;

fn rt() -> Runtime {
    Runtime::new().unwrap()
}

proptest! {
    /// "FIFO per queue": readers submitted to a buffered channel observe
    /// writes in submission order.
    #[test]
    fn fifo_ordering_holds_for_buffered_writes(values in prop::collection::vec(any::<u32>(), 1..64)) {
        rt().block_on(async {
            let c: Channel<u32> = Channel::new(ChannelConfig::new("fifo").buffer_size(values.len())).unwrap();
            for v in &values {
                c.write(*v, Deadline::Infinite, None).await.unwrap();
            }
            let mut observed = Vec::with_capacity(values.len());
            for _ in 0..values.len() {
                observed.push(c.read(Deadline::Infinite, None).await.unwrap());
            }
            prop_assert_eq!(observed, values);
            Ok(())
        })?;
    }

    /// "Buffer bound": at most `buffer_size` writes ever resolve without a
    /// waiting reader; the next one suspends until a reader arrives.
    #[test]
    fn buffer_bound_is_never_exceeded(buffer_size in 0usize..8) {
        rt().block_on(async {
            let c: Channel<u32> = Channel::new(ChannelConfig::new("bound").buffer_size(buffer_size)).unwrap();
            for v in 0..buffer_size as u32 {
                c.write(v, Deadline::Infinite, None).await.unwrap();
            }

            let overflow_writer = c.clone();
            let overflow_task = tokio::spawn(async move {
                overflow_writer.write(u32::MAX, Deadline::Infinite, None).await
            });
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            prop_assert!(!overflow_task.is_finished());

            for v in 0..buffer_size as u32 {
                prop_assert_eq!(c.read(Deadline::Infinite, None).await.unwrap(), v);
            }
            overflow_task.await.unwrap().unwrap();
            prop_assert_eq!(c.read(Deadline::Infinite, None).await.unwrap(), u32::MAX);
            Ok(())
        })?;
    }

    /// "Message conservation" + "Rendezvous uniqueness": every written value
    /// is received by exactly one reader, with no duplicates and nothing
    /// lost, regardless of how many concurrent readers/writers race.
    #[test]
    fn every_written_value_is_received_exactly_once(writer_count in 1usize..6, values_per_writer in 1usize..8) {
        rt().block_on(async {
            let c: Channel<u64> = Channel::new(ChannelConfig::new("conservation")).unwrap();
            let total = writer_count * values_per_writer;

            let mut write_tasks = Vec::new();
            for w in 0..writer_count {
                let writer = c.clone();
                write_tasks.push(tokio::spawn(async move {
                    for i in 0..values_per_writer {
                        let value = (w * values_per_writer + i) as u64;
                        writer.write(value, Deadline::Infinite, None).await.unwrap();
                    }
                }));
            }

            let mut read_tasks = Vec::new();
            for _ in 0..total {
                let reader = c.clone();
                read_tasks.push(tokio::spawn(async move { reader.read(Deadline::Infinite, None).await.unwrap() }));
            }

            for t in write_tasks {
                t.await.unwrap();
            }
            let mut received = Vec::with_capacity(total);
            for t in read_tasks {
                received.push(t.await.unwrap());
            }

            let unique: HashSet<u64> = received.iter().copied().collect();
            prop_assert_eq!(unique.len(), total, "no value was received twice");
            prop_assert_eq!((0..total as u64).collect::<HashSet<_>>(), unique, "every written value arrived");
            Ok(())
        })?;
    }
}

/// Round-trip law: `Join(r) ; Leave(r)` returns a channel's join counters to
/// their initial state as long as nothing else observes the side trip. The
/// last participant of either side leaving retires the channel immediately,
/// so this is only a round trip when the other side never reached zero.
#[tokio::test]
async fn join_then_leave_of_the_same_side_round_trips_without_retiring() {
    let c: Channel<u32> = Channel::new(ChannelConfig::new("join-leave")).unwrap();
    c.join(false).await.unwrap();
    c.join(true).await.unwrap();
    c.join(true).await.unwrap();
    c.leave(true).await;
    assert!(!c.is_retired(), "one reader remains and the writer side never emptied");
}

/// The last participant of either side leaving retires the channel right
/// away, even while the other side is still populated.
#[tokio::test]
async fn last_participant_of_either_side_leaving_retires_immediately() {
    let c: Channel<u32> = Channel::new(ChannelConfig::new("join-leave-retire")).unwrap();
    c.join(true).await.unwrap();
    c.join(false).await.unwrap();
    c.leave(true).await;
    assert!(c.is_retired(), "the reader side just emptied");
}

/// Round-trip law: `Write(v) ; Read()` on a freshly created unbuffered
/// channel resolves both futures with `v` and leaves the queues empty.
#[tokio::test]
async fn write_then_read_on_a_fresh_unbuffered_channel_leaves_no_residue() {
    let c: Channel<u32> = Channel::new(ChannelConfig::new("fresh")).unwrap();
    let reader = c.clone();
    let read_task = tokio::spawn(async move { reader.read(Deadline::Infinite, None).await });
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    c.write(11, Deadline::Infinite, None).await.unwrap();
    assert_eq!(read_task.await.unwrap().unwrap(), 11);

    // Empty queues: a third party with an immediate deadline sees nothing
    // pending on either side.
    assert!(matches!(
        c.read(Deadline::Immediate, None).await,
        Err(rendezvous::ChannelError::Timeout)
    ));
}

/// Boundary: `buffer=0, reader with deadline=0` fails with `Timeout`
/// immediately.
#[tokio::test]
async fn zero_deadline_read_on_unbuffered_channel_times_out_immediately() {
    let c: Channel<u32> = Channel::new(ChannelConfig::new("zero-deadline")).unwrap();
    let result = c.read(Deadline::Immediate, None).await;
    assert!(matches!(result, Err(rendezvous::ChannelError::Timeout)));
}
