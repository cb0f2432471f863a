//! Fan-in aggregation over a collection's live instances.
//!
//! [`merge`] flattens one event-shaped output channel of every live instance
//! into a single stream, fire-as-it-happens. Each emission is tagged with the
//! source instance's id so key-sensitive consumers can disambiguate. A sink
//! that completes naturally is silenced by a never-ending sentinel rather
//! than terminating the aggregate; only the registry's removal protocol
//! retires a subscription.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::channel::mpsc::{self, UnboundedReceiver};
use futures::channel::oneshot;
use futures::stream::{self, BoxStream, SelectAll};
use futures::{Stream, StreamExt, pin_mut, select};
use futures_signals::signal::{Signal, SignalExt};
use indexmap::IndexMap;

use crate::instance::{Instance, InstanceId, Snapshot};
use crate::task::{self, TaskHandle};

/// One event from a merged stream, tagged with its source instance.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Emission<T> {
    pub id: InstanceId,
    pub value: T,
}

/// Stream of tagged events produced by [`merge`]. Dropping it releases every
/// per-instance subscription.
#[derive(Debug)]
pub struct Merged<T> {
    output: UnboundedReceiver<Emission<T>>,
    _worker: TaskHandle,
}

impl<T> Stream for Merged<T> {
    type Item = Emission<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().output).poll_next(cx)
    }
}

/// Union of every live instance's selected output channel.
///
/// Unlike [`pluck`](crate::pluck::pluck) this never waits for values: events
/// pass through as they happen. Subscriptions are memoized per instance id;
/// an id observed again in a later snapshot is not resubscribed.
pub fn merge<O, T, St, F>(
    snapshots: impl Signal<Item = Snapshot<O>> + Send + 'static,
    mut selector: F,
) -> Merged<T>
where
    O: Send + Sync + 'static,
    T: Send + 'static,
    St: Stream<Item = T> + Send + 'static,
    F: FnMut(&Instance<O>) -> St + Send + 'static,
{
    let (output_tx, output_rx) = mpsc::unbounded();

    let worker = task::spawn(async move {
        let snaps = snapshots.to_stream().fuse();
        pin_mut!(snaps);

        let mut feeds: SelectAll<BoxStream<'static, Emission<T>>> = SelectAll::new();
        // A SelectAll with no members terminates; a silent permanent member
        // keeps the union alive across moments with no instances.
        feeds.push(stream::pending().boxed());
        let mut cancels: IndexMap<InstanceId, oneshot::Sender<()>> = IndexMap::new();

        loop {
            select! {
                snap = snaps.next() => {
                    let Some(snap) = snap else { break };

                    for instance in snap.iter() {
                        let id = instance.id();
                        if !cancels.contains_key(&id) {
                            let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
                            let feed = selector(instance)
                                .map(move |value| Emission { id, value })
                                // The sink ending on its own must not retire
                                // the feed; only the cancel below does.
                                .chain(stream::pending())
                                .take_until(cancel_rx);
                            feeds.push(feed.boxed());
                            cancels.insert(id, cancel_tx);
                        }
                    }
                    // Dropping a cancel sender resolves its receiver and ends
                    // the corresponding feed.
                    cancels.retain(|id, _| snap.contains(*id));
                }
                emission = feeds.next() => {
                    let Some(emission) = emission else { break };
                    if output_tx.unbounded_send(emission).is_err() {
                        break;
                    }
                }
            }
        }
    });

    Merged {
        output: output_rx,
        _worker: worker,
    }
}
