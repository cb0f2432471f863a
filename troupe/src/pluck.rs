//! Combine-latest aggregation over a collection's live instances.
//!
//! [`pluck`] projects one value-shaped output channel out of every live
//! instance and recombines the latest values into one array whenever any of
//! them changes or the live set changes. Subscriptions are memoized per
//! instance id for the instance's whole lifetime: a later snapshot containing
//! the same id reuses the existing subscription instead of restarting it, so
//! instance-side effects run once and identity is never lost to
//! resubscription.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use futures::{Stream, StreamExt, pin_mut, select};
use futures_signals::signal::{Mutable, Signal, SignalExt};
use indexmap::IndexMap;

use crate::instance::{Instance, InstanceId, Snapshot};
use crate::task::{self, TaskHandle};

/// Stream of combined arrays produced by [`pluck`]. Dropping it releases
/// every memoized subscription.
#[derive(Debug)]
pub struct Plucked<T> {
    output: UnboundedReceiver<Vec<T>>,
    _worker: TaskHandle,
}

impl<T> Stream for Plucked<T> {
    type Item = Vec<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().output).poll_next(cx)
    }
}

struct MemoEntry<T> {
    latest: Mutable<Option<T>>,
    _feed: TaskHandle,
}

/// Combine-latest over the currently live instance set.
///
/// Emits an empty array as the defined first value, then an array of every
/// live instance's latest selected value, in snapshot order, once each of
/// them has produced one. Removing an instance removes its contribution and
/// releases its memo entry.
pub fn pluck<O, T, Sig, F>(
    snapshots: impl Signal<Item = Snapshot<O>> + Send + 'static,
    mut selector: F,
) -> Plucked<T>
where
    O: Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
    Sig: Signal<Item = T> + Send + 'static,
    F: FnMut(&Instance<O>) -> Sig + Send + 'static,
{
    let (output_tx, output_rx) = mpsc::unbounded();

    let worker = task::spawn(async move {
        let snaps = snapshots.to_stream().fuse();
        pin_mut!(snaps);
        let (tick_tx, mut ticks) = mpsc::unbounded::<InstanceId>();
        let mut memo: IndexMap<InstanceId, MemoEntry<T>> = IndexMap::new();
        let mut current: Option<Snapshot<O>> = None;

        loop {
            select! {
                snap = snaps.next() => {
                    let Some(snap) = snap else { break };

                    for instance in snap.iter() {
                        let id = instance.id();
                        if !memo.contains_key(&id) {
                            let latest = Mutable::new(None);
                            let mirror = latest.clone();
                            let tick = tick_tx.clone();
                            let feed = task::spawn(selector(instance).for_each(move |value| {
                                mirror.set(Some(value));
                                let _ = tick.unbounded_send(id);
                                async {}
                            }));
                            memo.insert(id, MemoEntry { latest, _feed: feed });
                        }
                    }
                    memo.retain(|id, _| snap.contains(*id));

                    let first = current.is_none();
                    current = Some(snap);
                    if first {
                        // The defined first value, before any instance has
                        // produced anything.
                        if output_tx.unbounded_send(Vec::new()).is_err() {
                            break;
                        }
                    } else if !emit_if_complete(&current, &memo, &output_tx) {
                        break;
                    }
                }
                tick = ticks.next() => {
                    let Some(id) = tick else { break };
                    let mut relevant = memo.contains_key(&id);
                    // Coalesce queued ticks so one wake emits one array, and
                    // ignore ticks from already-released subscriptions.
                    while let Ok(Some(more)) = ticks.try_next() {
                        relevant |= memo.contains_key(&more);
                    }
                    if relevant && !emit_if_complete(&current, &memo, &output_tx) {
                        break;
                    }
                }
            }
        }
    });

    Plucked {
        output: output_rx,
        _worker: worker,
    }
}

/// Emit the combined array if every live instance has a value. Returns false
/// only when the consumer is gone.
fn emit_if_complete<O, T: Clone>(
    current: &Option<Snapshot<O>>,
    memo: &IndexMap<InstanceId, MemoEntry<T>>,
    output: &UnboundedSender<Vec<T>>,
) -> bool {
    let Some(snapshot) = current else {
        return true;
    };
    if snapshot.is_empty() {
        return output.unbounded_send(Vec::new()).is_ok();
    }

    let mut values = Vec::with_capacity(snapshot.len());
    for instance in snapshot.iter() {
        match memo
            .get(&instance.id())
            .and_then(|entry| entry.latest.get_cloned())
        {
            Some(value) => values.push(value),
            // A live instance has not produced yet; its first value will
            // trigger the emission.
            None => return true,
        }
    }
    output.unbounded_send(values).is_ok()
}
