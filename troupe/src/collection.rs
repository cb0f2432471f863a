//! The instance registry: a dynamic collection of running components.
//!
//! A [`Collection`] owns one processor task that folds a serialized
//! instruction stream (adds from the caller or the reconciler, removals from
//! instance removal channels and from the handle) over a persistent
//! [`Snapshot`]. All state transitions happen inside that single fold, so the
//! engine needs no locks: instances' own streams may fire concurrently, but
//! nothing touches the registry except through the instruction channel.

use std::sync::Arc;

use futures::channel::mpsc::{self, UnboundedSender};
use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt, future, pin_mut};
use futures_signals::signal::{Mutable, Signal, SignalExt};
use indexmap::IndexMap;

use crate::error::{BoxError, CollectionError};
use crate::instance::{IdAllocator, Instance, InstanceId, Snapshot};
use crate::merge::{self, Merged};
use crate::pluck::{self, Plucked};
use crate::scope::{Bus, Scope, ScopedBus};
use crate::task::{self, TaskHandle};

/// Everything the engine provides to a component constructor: the instance's
/// scope token and the collection-wide shared inputs.
pub struct ItemContext<S> {
    scope: Scope,
    shared: S,
}

impl<S> ItemContext<S> {
    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn shared(&self) -> &S {
        &self.shared
    }

    /// This instance's isolated view of a shared bus: outgoing events are
    /// tagged with the instance's id, incoming events are filtered to what
    /// this instance may observe.
    pub fn isolate<T>(&self, bus: &Bus<T>) -> ScopedBus<T>
    where
        T: Clone + Send + 'static,
    {
        bus.scoped(&self.scope)
    }
}

pub(crate) struct AddEntry<A> {
    pub(crate) overrides: A,
    /// Engine-supplied removal stream, merged with the caller's removal
    /// selector. The reconciler routes its destroyed signal through here.
    pub(crate) lifetime: Option<BoxStream<'static, ()>>,
}

impl<A> AddEntry<A> {
    pub(crate) fn plain(overrides: A) -> Self {
        Self {
            overrides,
            lifetime: None,
        }
    }
}

pub(crate) enum Instruction<A> {
    /// Add a batch of instances; the whole batch lands in one snapshot.
    Add(Vec<AddEntry<A>>),
    Remove(InstanceId),
}

/// A dynamic collection of running component instances.
///
/// Constructed with a component, the shared inputs every instance receives,
/// an add-event stream and a removal selector picking the output channel
/// whose *first* emission removes the instance. The collection publishes a
/// replay-last snapshot stream which [`pluck`](Collection::pluck) and
/// [`merge`](Collection::merge) aggregate over.
///
/// Cloning the handle shares the same collection. Dropping every handle stops
/// the fold and releases all instance subscriptions.
///
/// # Examples
///
/// ```no_run
/// use futures_signals::signal::Mutable;
/// use troupe::{BoxError, Collection, ItemContext, Outlet, relay};
///
/// struct CardOutputs {
///     text: Mutable<String>,
///     removed: Outlet<()>,
/// }
///
/// fn card(_ctx: ItemContext<()>, text: String) -> Result<CardOutputs, BoxError> {
///     Ok(CardOutputs {
///         text: Mutable::new(text),
///         removed: Outlet::new(),
///     })
/// }
///
/// # fn main() {
/// # let rt = tokio::runtime::Runtime::new().unwrap();
/// # rt.block_on(async {
/// let (add_card, add_stream) = relay::<String>();
/// let cards = Collection::new(card, (), add_stream, |outputs: &CardOutputs| {
///     outputs.removed.subscribe()
/// });
///
/// add_card.send("hello".to_string());
/// let texts = cards.pluck(|card| card.outputs().text.signal_cloned());
/// # let _ = texts;
/// # });
/// # }
/// ```
pub struct Collection<O> {
    snapshot: Mutable<Snapshot<O>>,
    failure: Mutable<Option<Arc<CollectionError>>>,
    removals: UnboundedSender<InstanceId>,
    _tasks: Arc<Vec<TaskHandle>>,
}

impl<O> Collection<O>
where
    O: Send + Sync + 'static,
{
    /// Create a collection that adds one instance per add event.
    ///
    /// `remove` selects the output channel whose first emission removes the
    /// instance; a component with no removal channel can pass a selector
    /// returning `futures::stream::pending()`.
    pub fn new<S, A, F, RSel, RS>(
        component: F,
        shared: S,
        add: impl Stream<Item = A> + Send + 'static,
        remove: RSel,
    ) -> Self
    where
        S: Clone + Send + Sync + 'static,
        A: Send + 'static,
        F: FnMut(ItemContext<S>, A) -> Result<O, BoxError> + Send + 'static,
        RSel: FnMut(&O) -> RS + Send + 'static,
        RS: Stream + Send + 'static,
    {
        Self::from_instructions(
            component,
            shared,
            add.map(|overrides| Instruction::Add(vec![AddEntry::plain(overrides)])),
            remove,
            Vec::new(),
        )
    }

    /// Create a collection that adds a whole batch per add event; each batch
    /// is applied as one snapshot transition.
    pub fn new_batched<S, A, F, RSel, RS>(
        component: F,
        shared: S,
        add: impl Stream<Item = Vec<A>> + Send + 'static,
        remove: RSel,
    ) -> Self
    where
        S: Clone + Send + Sync + 'static,
        A: Send + 'static,
        F: FnMut(ItemContext<S>, A) -> Result<O, BoxError> + Send + 'static,
        RSel: FnMut(&O) -> RS + Send + 'static,
        RS: Stream + Send + 'static,
    {
        Self::from_instructions(
            component,
            shared,
            add.map(|batch| Instruction::Add(batch.into_iter().map(AddEntry::plain).collect())),
            remove,
            Vec::new(),
        )
    }

    pub(crate) fn from_instructions<S, A, F, RSel, RS>(
        mut component: F,
        shared: S,
        instructions: impl Stream<Item = Instruction<A>> + Send + 'static,
        mut remove: RSel,
        mut aux_tasks: Vec<TaskHandle>,
    ) -> Self
    where
        S: Clone + Send + Sync + 'static,
        A: Send + 'static,
        F: FnMut(ItemContext<S>, A) -> Result<O, BoxError> + Send + 'static,
        RSel: FnMut(&O) -> RS + Send + 'static,
        RS: Stream + Send + 'static,
    {
        let snapshot = Mutable::new(Snapshot::empty());
        let failure = Mutable::new(None);
        let (removal_tx, removal_rx) = mpsc::unbounded::<InstanceId>();

        let state = snapshot.clone();
        let failed = failure.clone();

        let fold = task::spawn(async move {
            let mut ids = IdAllocator::new();
            // Removal watchers keyed by instance id; dropping an entry aborts
            // the watcher and releases its subscription.
            let mut watchers: IndexMap<InstanceId, TaskHandle> = IndexMap::new();
            let (instr_tx, instr_rx) = mpsc::unbounded::<Instruction<A>>();

            let merged = stream::select(
                instructions,
                stream::select(instr_rx, removal_rx.map(Instruction::Remove)),
            );
            pin_mut!(merged);

            while let Some(instruction) = merged.next().await {
                match instruction {
                    Instruction::Add(batch) => {
                        let mut added = Vec::with_capacity(batch.len());
                        let mut batch_watchers = Vec::with_capacity(batch.len());

                        let mut build_failure = None;
                        for entry in batch {
                            let id = ids.next_id();
                            let context = ItemContext {
                                scope: Scope::new(id),
                                shared: shared.clone(),
                            };

                            let outputs = match component(context, entry.overrides) {
                                Ok(outputs) => outputs,
                                Err(reason) => {
                                    build_failure = Some(CollectionError::Build {
                                        type_name: std::any::type_name::<O>(),
                                        reason,
                                    });
                                    break;
                                }
                            };
                            let instance = Instance::new(id, outputs);

                            let trigger = remove(instance.outputs()).map(|_| ()).boxed();
                            let trigger = match entry.lifetime {
                                Some(lifetime) => stream::select(trigger, lifetime).boxed(),
                                None => trigger,
                            };
                            let removal = instr_tx.clone();
                            let watcher = task::spawn(async move {
                                let mut trigger = trigger;
                                // Only the first emission counts; later ones
                                // would be redundant removal instructions.
                                if trigger.next().await.is_some() {
                                    let _ = removal.unbounded_send(Instruction::Remove(id));
                                }
                            });

                            batch_watchers.push((id, watcher));
                            added.push(instance);
                        }

                        if let Some(error) = build_failure {
                            // The whole batch is discarded: instances built so
                            // far are dropped along with their watchers, the
                            // previous snapshot stands, and the fold stops.
                            failed.set(Some(Arc::new(error)));
                            return;
                        }

                        watchers.extend(batch_watchers);
                        if !added.is_empty() {
                            let next = {
                                let current = state.lock_ref();
                                current.append(added)
                            };
                            state.set(next);
                        }
                    }
                    Instruction::Remove(id) => {
                        watchers.swap_remove(&id);
                        // Removing an absent id is a no-op, not a fault:
                        // near-simultaneous removal triggers for one instance
                        // are expected, and the second must emit nothing.
                        let next = {
                            let current = state.lock_ref();
                            current.contains(id).then(|| current.without(id))
                        };
                        if let Some(next) = next {
                            state.set(next);
                        }
                    }
                }
            }
        });

        aux_tasks.push(fold);

        Self {
            snapshot,
            failure,
            removals: removal_tx,
            _tasks: Arc::new(aux_tasks),
        }
    }

    /// Replay-last signal of the current snapshot.
    pub fn signal(&self) -> impl Signal<Item = Snapshot<O>> + use<O> {
        self.snapshot.signal_cloned()
    }

    /// The current snapshot: an immutable, read-only view of the live
    /// instances in insertion order.
    pub fn current(&self) -> Snapshot<O> {
        self.snapshot.get_cloned()
    }

    /// Reactive count of live instances.
    pub fn len_signal(&self) -> impl Signal<Item = usize> + use<O> {
        self.snapshot.signal_ref(Snapshot::len).dedupe()
    }

    /// The snapshot stream, with the fatal error channel folded in.
    ///
    /// Yields `Ok` for every snapshot; if a component constructor fails, the
    /// error is yielded once as `Err` and the stream ends.
    pub fn snapshots(
        &self,
    ) -> impl Stream<Item = Result<Snapshot<O>, Arc<CollectionError>>> + use<O> {
        let failure_watch = self.failure.clone();
        let until_failed = async move {
            let mut changes = failure_watch.signal_cloned().to_stream();
            while let Some(state) = changes.next().await {
                if state.is_some() {
                    return;
                }
            }
            // The collection went away without failing; let the Ok side end
            // on its own.
            future::pending::<()>().await
        };

        let failure_tail = self.failure.clone();
        let tail = stream::once(async move { failure_tail.get_cloned() }).filter_map(|failure| {
            future::ready(failure.map(Err::<Snapshot<O>, Arc<CollectionError>>))
        });

        self.snapshot
            .signal_cloned()
            .to_stream()
            .map(Ok)
            .take_until(until_failed)
            .chain(tail)
            .boxed()
    }

    /// Remove an instance by id. Idempotent: naming an id that is already
    /// gone does nothing.
    pub fn remove(&self, id: InstanceId) {
        let _ = self.removals.unbounded_send(id);
    }

    /// Combine-latest over every live instance's selected output.
    /// See [`pluck::pluck`].
    pub fn pluck<T, Sig, F>(&self, selector: F) -> Plucked<T>
    where
        T: Clone + Send + Sync + 'static,
        Sig: Signal<Item = T> + Send + 'static,
        F: FnMut(&Instance<O>) -> Sig + Send + 'static,
    {
        pluck::pluck(self.signal(), selector)
    }

    /// Fan-in union of every live instance's selected output.
    /// See [`merge::merge`].
    pub fn merge<T, St, F>(&self, selector: F) -> Merged<T>
    where
        T: Send + 'static,
        St: Stream<Item = T> + Send + 'static,
        F: FnMut(&Instance<O>) -> St + Send + 'static,
    {
        merge::merge(self.signal(), selector)
    }
}

impl<O> Clone for Collection<O> {
    fn clone(&self) -> Self {
        Self {
            snapshot: self.snapshot.clone(),
            failure: self.failure.clone(),
            removals: self.removals.clone(),
            _tasks: self._tasks.clone(),
        }
    }
}

impl<O> std::fmt::Debug for Collection<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("len", &self.snapshot.lock_ref().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::{Outlet, relay};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::sleep;

    struct CounterOutputs {
        start: u32,
        label: String,
        removed: Outlet<()>,
    }

    fn counter(ctx: ItemContext<String>, start: u32) -> Result<CounterOutputs, BoxError> {
        Ok(CounterOutputs {
            start,
            label: ctx.shared().clone(),
            removed: Outlet::new(),
        })
    }

    fn removal(outputs: &CounterOutputs) -> crate::relay::OutletStream<()> {
        outputs.removed.subscribe()
    }

    fn record_lengths<O: Send + Sync + 'static>(
        collection: &Collection<O>,
    ) -> (Arc<Mutex<Vec<usize>>>, TaskHandle) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let recorder = task::spawn(collection.len_signal().for_each(move |len| {
            sink.lock().unwrap().push(len);
            async {}
        }));
        (log, recorder)
    }

    #[tokio::test]
    async fn adds_items_and_passes_shared_and_overrides() {
        let (add, add_stream) = relay::<u32>();
        let collection = Collection::new(counter, "shared".to_string(), add_stream, removal);

        add.send(7);
        add.send(9);
        sleep(Duration::from_millis(20)).await;

        let snapshot = collection.current();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.as_slice()[0].outputs().start, 7);
        assert_eq!(snapshot.as_slice()[1].outputs().start, 9);
        assert!(snapshot.iter().all(|i| i.outputs().label == "shared"));
        assert!(snapshot.as_slice()[0].type_name().contains("CounterOutputs"));
    }

    #[tokio::test]
    async fn items_remove_themselves_through_their_removal_channel() {
        let (add, add_stream) = relay::<u32>();
        let collection = Collection::new(counter, String::new(), add_stream, removal);
        let (lengths, _recorder) = record_lengths(&collection);

        add.send(0);
        sleep(Duration::from_millis(20)).await;
        add.send(1);
        sleep(Duration::from_millis(20)).await;

        collection.current().as_slice()[0].outputs().removed.emit(());
        sleep(Duration::from_millis(20)).await;

        assert_eq!(*lengths.lock().unwrap(), vec![0, 1, 2, 1]);
        let snapshot = collection.current();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.as_slice()[0].outputs().start, 1);
    }

    #[tokio::test]
    async fn removal_is_idempotent() {
        let (add, add_stream) = relay::<u32>();
        let collection = Collection::new(counter, String::new(), add_stream, removal);
        let (lengths, _recorder) = record_lengths(&collection);

        add.send(0);
        sleep(Duration::from_millis(20)).await;

        let id = collection.current().as_slice()[0].id();
        collection.remove(id);
        collection.remove(id);
        sleep(Duration::from_millis(20)).await;

        // The second removal produced no state transition at all.
        assert_eq!(*lengths.lock().unwrap(), vec![0, 1, 0]);
    }

    #[tokio::test]
    async fn repeated_emissions_on_the_removal_channel_are_harmless() {
        let (add, add_stream) = relay::<u32>();
        let collection = Collection::new(counter, String::new(), add_stream, removal);
        let (lengths, _recorder) = record_lengths(&collection);

        add.send(0);
        sleep(Duration::from_millis(20)).await;

        let removed = collection.current().as_slice()[0].outputs().removed.clone();
        removed.emit(());
        removed.emit(());
        removed.emit(());
        sleep(Duration::from_millis(20)).await;

        assert_eq!(*lengths.lock().unwrap(), vec![0, 1, 0]);
    }

    #[tokio::test]
    async fn batched_adds_land_in_one_snapshot() {
        let (add, add_stream) = relay::<Vec<u32>>();
        let collection = Collection::new_batched(counter, String::new(), add_stream, removal);
        let (lengths, _recorder) = record_lengths(&collection);

        add.send(vec![1, 2, 3]);
        sleep(Duration::from_millis(20)).await;

        assert_eq!(*lengths.lock().unwrap(), vec![0, 3]);
    }

    #[tokio::test]
    async fn survivor_order_matches_insertion_order() {
        let (add, add_stream) = relay::<u32>();
        let collection = Collection::new(counter, String::new(), add_stream, removal);

        add.send(10);
        add.send(20);
        add.send(30);
        sleep(Duration::from_millis(20)).await;

        let middle = collection.current().as_slice()[1].id();
        collection.remove(middle);
        sleep(Duration::from_millis(20)).await;

        let starts: Vec<u32> = collection
            .current()
            .iter()
            .map(|i| i.outputs().start)
            .collect();
        assert_eq!(starts, vec![10, 30]);
    }

    #[tokio::test]
    async fn earlier_snapshots_are_not_mutated_by_later_adds() {
        let (add, add_stream) = relay::<u32>();
        let collection = Collection::new(counter, String::new(), add_stream, removal);

        add.send(1);
        sleep(Duration::from_millis(20)).await;
        let before = collection.current();

        add.send(2);
        sleep(Duration::from_millis(20)).await;

        assert_eq!(before.len(), 1);
        assert_eq!(collection.current().len(), 2);
    }

    #[tokio::test]
    async fn ids_are_unique_and_increasing() {
        let (add, add_stream) = relay::<u32>();
        let collection = Collection::new(counter, String::new(), add_stream, removal);

        add.send(0);
        add.send(0);
        sleep(Duration::from_millis(20)).await;
        let first = collection.current().as_slice()[0].id();
        collection.remove(first);
        add.send(0);
        sleep(Duration::from_millis(20)).await;

        let ids: Vec<u64> = collection
            .current()
            .iter()
            .map(|i| i.id().as_u64())
            .collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn shared_bus_reaches_siblings_but_never_echoes() {
        #[derive(Clone)]
        struct Channels {
            chat: Bus<u32>,
        }

        struct ChatOutputs {
            voice: ScopedBus<u32>,
            heard: Mutable<Vec<u32>>,
            removed: Outlet<()>,
            _listener: TaskHandle,
        }

        fn chat(ctx: ItemContext<Channels>, _: ()) -> Result<ChatOutputs, BoxError> {
            let voice = ctx.isolate(&ctx.shared().chat);
            let heard = Mutable::new(Vec::new());
            let sink = heard.clone();
            let listener = task::spawn(voice.events().for_each(move |value| {
                sink.lock_mut().push(value);
                async {}
            }));
            Ok(ChatOutputs {
                voice,
                heard,
                removed: Outlet::new(),
                _listener: listener,
            })
        }

        let (add, add_stream) = relay::<()>();
        let bus = Bus::new();
        let collection = Collection::new(
            chat,
            Channels { chat: bus.clone() },
            add_stream,
            |outputs: &ChatOutputs| outputs.removed.subscribe(),
        );

        add.send(());
        add.send(());
        sleep(Duration::from_millis(20)).await;

        let snapshot = collection.current();
        snapshot.as_slice()[0].outputs().voice.publish(1);
        snapshot.as_slice()[1].outputs().voice.publish(2);
        bus.broadcast(3);
        sleep(Duration::from_millis(20)).await;

        // Each instance heard its sibling and the external broadcast, never
        // its own echo.
        assert_eq!(snapshot.as_slice()[0].outputs().heard.get_cloned(), vec![2, 3]);
        assert_eq!(snapshot.as_slice()[1].outputs().heard.get_cloned(), vec![1, 3]);
    }

    #[tokio::test]
    async fn constructor_failure_is_fatal_and_leaves_no_partial_instance() {
        fn fallible(_ctx: ItemContext<()>, start: u32) -> Result<CounterOutputs, BoxError> {
            if start == 13 {
                return Err("unlucky".into());
            }
            Ok(CounterOutputs {
                start,
                label: String::new(),
                removed: Outlet::new(),
            })
        }

        let (add, add_stream) = relay::<Vec<u32>>();
        let collection = Collection::new_batched(fallible, (), add_stream, removal);
        let mut snapshots = collection.snapshots();

        assert!(matches!(snapshots.next().await, Some(Ok(s)) if s.is_empty()));

        add.send(vec![1]);
        assert!(matches!(snapshots.next().await, Some(Ok(s)) if s.len() == 1));

        // The failing entry sinks its whole batch, including the valid one.
        add.send(vec![2, 13]);
        assert!(matches!(
            snapshots.next().await,
            Some(Err(e)) if matches!(*e, CollectionError::Build { .. })
        ));
        assert_eq!(snapshots.next().await.map(|_| ()), None);
        assert_eq!(collection.current().len(), 1);

        // The fold has stopped: later instructions are ignored.
        add.send(vec![3]);
        sleep(Duration::from_millis(20)).await;
        assert_eq!(collection.current().len(), 1);
    }
}
