//! Merging several source channels into one.

use crate::{
    channel::api::{channel, Channel},
    runtime::Scheduler,
};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};


/// Merge several source channels into one
///
/// One forwarding routine per source loops take-from-source, put-to-output; the output is
/// a rendezvous channel, so a value is only forwarded after it was actually taken from its
/// source, and sources cannot outrun the consumer. Values from one source keep that
/// source's order; no order is imposed across sources.
///
/// The output closes once every source has closed and drained. Closing the output early
/// stops the forwarders at their next put. An empty source set yields an already-closed
/// channel.
pub fn merge<T: Send + 'static>(
    sched: &Scheduler,
    sources: impl IntoIterator<Item = Channel<T>>,
) -> Channel<T> {
    let out = channel(0);
    let sources: Vec<Channel<T>> = sources.into_iter().collect();
    if sources.is_empty() {
        out.close();
        return out;
    }
    let open = Arc::new(AtomicUsize::new(sources.len()));
    for source in sources {
        let out = out.clone();
        let open = Arc::clone(&open);
        sched.spawn(async move {
            while let Some(value) = source.take().await {
                if out.put(value).await.is_err() {
                    break;
                }
            }
            if open.fetch_sub(1, Ordering::AcqRel) == 1 {
                trace!("all merge sources closed, closing output");
                out.close();
            }
        });
    }
    out
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn forwards_from_every_source_then_closes() {
        let sched = Scheduler::new();
        let a = channel(4);
        let b = channel(4);
        for n in [1, 2] {
            a.try_put(n).unwrap();
        }
        b.try_put(10).unwrap();
        a.close();
        b.close();

        let merged = merge(&sched, [a, b]);
        let drained = {
            let merged = merged.clone();
            sched.spawn(async move {
                let mut seen = Vec::new();
                while let Some(value) = merged.take().await {
                    seen.push(value);
                }
                seen
            })
        };
        sched.run();

        let seen = drained.output().unwrap();
        assert_eq!(seen.iter().copied().collect::<BTreeSet<_>>(), BTreeSet::from([1, 2, 10]));
        // per-source order is preserved
        let from_a: Vec<_> = seen.iter().copied().filter(|n| *n < 10).collect();
        assert_eq!(from_a, vec![1, 2]);
        assert!(merged.is_closed());
    }

    #[test]
    fn closes_only_after_the_last_source_closes() {
        let sched = Scheduler::new();
        let a = channel(2);
        let b = channel(2);
        a.try_put(1).unwrap();
        a.close();
        b.try_put(2).unwrap();

        let merged = merge(&sched, [a, b.clone()]);
        let first_two = {
            let merged = merged.clone();
            sched.spawn(async move {
                let x = merged.take().await;
                let y = merged.take().await;
                (x, y)
            })
        };
        // the forwarder for `b` is still parked on its open source, so drive without
        // waiting for it
        sched.run_until_idle();
        // one source closed, the other still delivers
        let (x, y) = first_two.output().unwrap();
        assert_eq!(
            BTreeSet::from([x.unwrap(), y.unwrap()]),
            BTreeSet::from([1, 2]),
        );
        assert!(!merged.is_closed());

        b.close();
        let tail = {
            let merged = merged.clone();
            sched.spawn(async move { merged.take().await })
        };
        sched.run();
        assert_eq!(tail.output(), Some(None));
        assert!(merged.is_closed());
    }

    #[test]
    fn empty_source_set_closes_immediately() {
        let sched = Scheduler::new();
        let merged = merge(&sched, Vec::<Channel<u32>>::new());
        assert!(merged.is_closed());
        sched.run();
        assert_eq!(merged.try_take().unwrap(), None);
    }
}
