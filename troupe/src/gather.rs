//! Reconciliation of desired-state snapshots into a collection.
//!
//! [`gather`] consumes a stream of desired-state snapshots (ordered lists of
//! keyed records) and drives a [`Collection`] from them: records appearing
//! under a new key become instances, records persisting under a known key
//! become live updates, and records disappearing destroy their instance.
//! Components receive an [`ItemSource`] carrying the record's live state,
//! per-field projections and a one-shot destroyed signal.

use std::hash::Hash;

use futures::channel::mpsc;
use futures::stream;
use futures::{Stream, StreamExt, pin_mut};
use futures_signals::signal::{Mutable, ReadOnlyMutable, Signal, SignalExt};
use indexmap::{IndexMap, IndexSet};

use crate::collection::{AddEntry, Collection, Instruction, ItemContext};
use crate::error::BoxError;
use crate::relay::{Outlet, OutletStream};
use crate::task;

/// A desired-state record with a stable identity.
///
/// Two records are the same logical entity iff their keys are equal; every
/// other field may change between snapshots and is treated as a live update,
/// not entity churn. For records whose key is not a natural part of the type,
/// use [`gather_by_key`] with an explicit extractor instead.
pub trait Record: Clone + Send + Sync + 'static {
    type Key: Clone + Eq + Hash + Send + Sync + 'static;

    fn key(&self) -> Self::Key;
}

/// The input bundle handed to a reconciled component: the record's live
/// state, derived per-field streams and the destroyed signal.
///
/// All streams end shortly after [`destroyed`](ItemSource::destroyed) fires;
/// the reconciler holds the write handle open just long enough for final-value
/// consumers to observe the terminal state.
pub struct ItemSource<R> {
    state: ReadOnlyMutable<R>,
    destroyed: Outlet<()>,
}

impl<R> ItemSource<R>
where
    R: Clone + Send + Sync + 'static,
{
    /// The record as of the latest snapshot.
    pub fn current(&self) -> R {
        self.state.get_cloned()
    }

    /// Replay-last signal of the whole record, starting with its value at the
    /// moment of addition.
    pub fn state(&self) -> impl Signal<Item = R> + Send + use<R> {
        self.state.signal_cloned()
    }

    /// Live stream of one field, deduplicated by structural equality: an
    /// unchanged value in a later snapshot emits nothing.
    pub fn field<V, P>(&self, mut project: P) -> impl Signal<Item = V> + Send + use<R, V, P>
    where
        V: Clone + PartialEq + Send + 'static,
        P: FnMut(&R) -> V + Send + 'static,
    {
        self.state
            .signal_cloned()
            .map(move |record| project(&record))
            .dedupe_cloned()
    }

    /// Live stream of one field with no equality requirement: treated
    /// conservatively as changed on every snapshot that touches the record.
    pub fn field_raw<V, P>(&self, mut project: P) -> impl Signal<Item = V> + Send + use<R, V, P>
    where
        V: Send + 'static,
        P: FnMut(&R) -> V + Send + 'static,
    {
        self.state
            .signal_cloned()
            .map(move |record| project(&record))
    }

    /// Fires exactly once, when a later snapshot no longer contains this
    /// record's key.
    pub fn destroyed(&self) -> OutletStream<()> {
        self.destroyed.subscribe()
    }
}

impl<R> Clone for ItemSource<R> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            destroyed: self.destroyed.clone(),
        }
    }
}

impl<R> std::fmt::Debug for ItemSource<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ItemSource").finish_non_exhaustive()
    }
}

/// Reconciler-side bookkeeping for one live key.
struct ItemState<R> {
    record: Mutable<R>,
    destroyed: Outlet<()>,
}

/// Drive a collection from a stream of desired-state snapshots, keyed by
/// [`Record::key`].
///
/// Instances are removed only by key disappearance. Duplicate keys within one
/// snapshot are a caller error: panics in debug builds, unspecified (but never
/// silently deduplicated) in release builds.
///
/// # Examples
///
/// ```no_run
/// use troupe::{BoxError, ItemContext, ItemSource, Record, gather, relay};
///
/// #[derive(Clone)]
/// struct Task {
///     id: u32,
///     title: String,
/// }
///
/// impl Record for Task {
///     type Key = u32;
///     fn key(&self) -> u32 {
///         self.id
///     }
/// }
///
/// struct TaskOutputs {
///     source: ItemSource<Task>,
/// }
///
/// fn task_widget(_ctx: ItemContext<()>, source: ItemSource<Task>) -> Result<TaskOutputs, BoxError> {
///     Ok(TaskOutputs { source })
/// }
///
/// # fn main() {
/// # let rt = tokio::runtime::Runtime::new().unwrap();
/// # rt.block_on(async {
/// let (desired, desired_stream) = relay::<Vec<Task>>();
/// let tasks = gather(task_widget, (), desired_stream);
///
/// desired.send(vec![Task { id: 0, title: "first".into() }]);
/// # let _ = tasks;
/// # });
/// # }
/// ```
pub fn gather<R, S, O, F, D>(component: F, shared: S, desired: D) -> Collection<O>
where
    R: Record,
    S: Clone + Send + Sync + 'static,
    O: Send + Sync + 'static,
    F: FnMut(ItemContext<S>, ItemSource<R>) -> Result<O, BoxError> + Send + 'static,
    D: Stream<Item = Vec<R>> + Send + 'static,
{
    gather_inner(component, shared, desired, R::key, |_: &O| {
        stream::pending::<()>()
    })
}

/// [`gather`] with an explicit key extractor instead of the [`Record`] trait.
pub fn gather_by_key<R, Key, KF, S, O, F, D>(
    component: F,
    shared: S,
    desired: D,
    key_fn: KF,
) -> Collection<O>
where
    R: Clone + Send + Sync + 'static,
    Key: Clone + Eq + Hash + Send + Sync + 'static,
    KF: Fn(&R) -> Key + Send + 'static,
    S: Clone + Send + Sync + 'static,
    O: Send + Sync + 'static,
    F: FnMut(ItemContext<S>, ItemSource<R>) -> Result<O, BoxError> + Send + 'static,
    D: Stream<Item = Vec<R>> + Send + 'static,
{
    gather_inner(component, shared, desired, key_fn, |_: &O| {
        stream::pending::<()>()
    })
}

/// [`gather`] for components that also expose their own removal channel: the
/// selected channel is merged with the synthesized destroyed stream, so an
/// instance goes away on whichever fires first.
pub fn gather_with_removal<R, S, O, F, D, RSel, RS>(
    component: F,
    shared: S,
    desired: D,
    remove: RSel,
) -> Collection<O>
where
    R: Record,
    S: Clone + Send + Sync + 'static,
    O: Send + Sync + 'static,
    F: FnMut(ItemContext<S>, ItemSource<R>) -> Result<O, BoxError> + Send + 'static,
    D: Stream<Item = Vec<R>> + Send + 'static,
    RSel: FnMut(&O) -> RS + Send + 'static,
    RS: Stream + Send + 'static,
{
    gather_inner(component, shared, desired, R::key, remove)
}

fn gather_inner<R, Key, KF, S, O, F, D, RSel, RS>(
    component: F,
    shared: S,
    desired: D,
    key_fn: KF,
    remove: RSel,
) -> Collection<O>
where
    R: Clone + Send + Sync + 'static,
    Key: Clone + Eq + Hash + Send + Sync + 'static,
    KF: Fn(&R) -> Key + Send + 'static,
    S: Clone + Send + Sync + 'static,
    O: Send + Sync + 'static,
    F: FnMut(ItemContext<S>, ItemSource<R>) -> Result<O, BoxError> + Send + 'static,
    D: Stream<Item = Vec<R>> + Send + 'static,
    RSel: FnMut(&O) -> RS + Send + 'static,
    RS: Stream + Send + 'static,
{
    let (instr_tx, instr_rx) = mpsc::unbounded::<Instruction<ItemSource<R>>>();

    let driver = task::spawn(async move {
        let mut items: IndexMap<Key, ItemState<R>> = IndexMap::new();
        pin_mut!(desired);

        while let Some(records) = desired.next().await {
            #[cfg(debug_assertions)]
            {
                let mut seen = IndexSet::with_capacity(records.len());
                for record in &records {
                    assert!(
                        seen.insert(key_fn(record)),
                        "gather: duplicate key within one desired-state snapshot"
                    );
                }
            }

            let live_keys: IndexSet<Key> = records.iter().map(|record| key_fn(record)).collect();

            let mut added = Vec::new();
            for record in records {
                let key = key_fn(&record);
                match items.get(&key) {
                    Some(item) => {
                        // Same logical entity: a live update, not churn. Field
                        // projections deduplicate unchanged values downstream.
                        item.record.set(record);
                    }
                    None => {
                        let state = Mutable::new(record);
                        let destroyed = Outlet::new();
                        let source = ItemSource {
                            state: state.read_only(),
                            destroyed: destroyed.clone(),
                        };
                        // Key disappearance must remove the instance even if
                        // the component exposes no removal channel of its own.
                        let lifetime = destroyed.subscribe().boxed();
                        items.insert(
                            key,
                            ItemState {
                                record: state,
                                destroyed,
                            },
                        );
                        added.push(AddEntry {
                            overrides: source,
                            lifetime: Some(lifetime),
                        });
                    }
                }
            }

            let stale: Vec<Key> = items
                .keys()
                .filter(|key| !live_keys.contains(*key))
                .cloned()
                .collect();

            if !added.is_empty() && instr_tx.unbounded_send(Instruction::Add(added)).is_err() {
                return;
            }

            for key in stale {
                if let Some(item) = items.shift_remove(&key) {
                    item.destroyed.emit(());
                    task::spawn_detached(async move {
                        // Grace period: let same-step consumers observe the
                        // terminal state before the item's streams end.
                        tokio::task::yield_now().await;
                        tokio::task::yield_now().await;
                        drop(item);
                    });
                }
            }
        }
    });

    Collection::from_instructions(component, shared, instr_rx, remove, vec![driver])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::relay;
    use crate::task::TaskHandle;
    use std::sync::{Arc, Mutex as StdMutex};
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    #[derive(Clone, Debug, PartialEq)]
    struct Todo {
        id: u32,
        title: String,
        done: bool,
    }

    impl Record for Todo {
        type Key = u32;

        fn key(&self) -> u32 {
            self.id
        }
    }

    fn todo(id: u32, title: &str) -> Todo {
        Todo {
            id,
            title: title.to_string(),
            done: false,
        }
    }

    struct TodoOutputs {
        source: ItemSource<Todo>,
    }

    fn widget(_ctx: ItemContext<()>, source: ItemSource<Todo>) -> Result<TodoOutputs, BoxError> {
        Ok(TodoOutputs { source })
    }

    fn record_lengths(
        collection: &Collection<TodoOutputs>,
    ) -> (Arc<StdMutex<Vec<usize>>>, TaskHandle) {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let sink = log.clone();
        let recorder = task::spawn(collection.len_signal().for_each(move |len| {
            sink.lock().unwrap().push(len);
            async {}
        }));
        (log, recorder)
    }

    #[tokio::test]
    async fn adds_initial_items_in_snapshot_order() {
        let (desired, desired_stream) = relay::<Vec<Todo>>();
        let collection = gather(widget, (), desired_stream);
        let (lengths, _recorder) = record_lengths(&collection);

        desired.send(vec![todo(0, "first"), todo(1, "second")]);
        sleep(Duration::from_millis(20)).await;

        assert_eq!(*lengths.lock().unwrap(), vec![0, 2]);
        let titles: Vec<String> = collection
            .current()
            .iter()
            .map(|i| i.outputs().source.current().title)
            .collect();
        assert_eq!(titles, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn tracks_record_state_by_key_without_churn() {
        let (desired, desired_stream) = relay::<Vec<Todo>>();
        let collection = gather(widget, (), desired_stream);

        desired.send(vec![todo(0, "before")]);
        sleep(Duration::from_millis(20)).await;
        let id = collection.current().as_slice()[0].id();

        desired.send(vec![Todo {
            id: 0,
            title: "after".to_string(),
            done: true,
        }]);
        sleep(Duration::from_millis(20)).await;

        let snapshot = collection.current();
        assert_eq!(snapshot.len(), 1);
        // Same instance, updated record.
        assert_eq!(snapshot.as_slice()[0].id(), id);
        assert_eq!(snapshot.as_slice()[0].outputs().source.current().title, "after");
    }

    #[tokio::test]
    async fn newly_appearing_keys_become_instances() {
        let (desired, desired_stream) = relay::<Vec<Todo>>();
        let collection = gather(widget, (), desired_stream);
        let (lengths, _recorder) = record_lengths(&collection);

        desired.send(vec![todo(0, "first")]);
        sleep(Duration::from_millis(20)).await;
        desired.send(vec![todo(0, "first"), todo(1, "second")]);
        sleep(Duration::from_millis(20)).await;

        assert_eq!(*lengths.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn disappeared_keys_destroy_their_instance_exactly_once() {
        let (desired, desired_stream) = relay::<Vec<Todo>>();
        let collection = gather(widget, (), desired_stream);
        let (lengths, _recorder) = record_lengths(&collection);

        desired.send(vec![todo(0, "keep"), todo(1, "drop")]);
        sleep(Duration::from_millis(20)).await;

        let destroys = Arc::new(StdMutex::new(0usize));
        let counter = destroys.clone();
        let destroyed_stream = collection.current().as_slice()[1]
            .outputs()
            .source
            .destroyed();
        let _watch = task::spawn(destroyed_stream.for_each(move |()| {
            *counter.lock().unwrap() += 1;
            async {}
        }));

        desired.send(vec![todo(0, "keep")]);
        sleep(Duration::from_millis(20)).await;

        assert_eq!(*lengths.lock().unwrap(), vec![0, 2, 1]);
        assert_eq!(*destroys.lock().unwrap(), 1);
        let survivors: Vec<u32> = collection
            .current()
            .iter()
            .map(|i| i.outputs().source.current().id)
            .collect();
        assert_eq!(survivors, vec![0]);
    }

    #[tokio::test]
    async fn unchanged_field_values_emit_exactly_once() {
        let (desired, desired_stream) = relay::<Vec<Todo>>();
        let collection = gather(widget, (), desired_stream);

        desired.send(vec![todo(0, "same")]);
        sleep(Duration::from_millis(20)).await;

        let titles = Arc::new(StdMutex::new(Vec::new()));
        let sink = titles.clone();
        let field = collection.current().as_slice()[0]
            .outputs()
            .source
            .field(|todo| todo.title.clone());
        let _watch = task::spawn(field.for_each(move |title| {
            sink.lock().unwrap().push(title);
            async {}
        }));
        sleep(Duration::from_millis(20)).await;

        // Structurally identical record: the field stream stays silent.
        desired.send(vec![todo(0, "same")]);
        sleep(Duration::from_millis(20)).await;
        desired.send(vec![todo(0, "different")]);
        sleep(Duration::from_millis(20)).await;

        assert_eq!(*titles.lock().unwrap(), vec!["same", "different"]);
    }

    #[tokio::test]
    async fn item_streams_terminate_shortly_after_destruction() {
        let (desired, desired_stream) = relay::<Vec<Todo>>();
        let collection = gather(widget, (), desired_stream);

        desired.send(vec![todo(0, "doomed")]);
        sleep(Duration::from_millis(20)).await;

        let state_stream = collection.current().as_slice()[0]
            .outputs()
            .source
            .state()
            .to_stream();

        desired.send(vec![]);
        sleep(Duration::from_millis(20)).await;

        // The stream delivers the terminal state and then completes.
        let observed = timeout(Duration::from_secs(1), state_stream.collect::<Vec<Todo>>())
            .await
            .expect("state stream should have completed after destruction");
        assert_eq!(observed.last().map(|t| t.title.as_str()), Some("doomed"));
    }

    #[tokio::test]
    async fn gather_by_key_uses_the_extractor() {
        #[derive(Clone)]
        struct Named {
            name: String,
        }

        struct NamedOutputs {
            source: ItemSource<Named>,
        }

        fn named_widget(
            _ctx: ItemContext<()>,
            source: ItemSource<Named>,
        ) -> Result<NamedOutputs, BoxError> {
            Ok(NamedOutputs { source })
        }

        let (desired, desired_stream) = relay::<Vec<Named>>();
        let collection = gather_by_key(named_widget, (), desired_stream, |record: &Named| {
            record.name.clone()
        });

        desired.send(vec![
            Named {
                name: "a".to_string(),
            },
            Named {
                name: "b".to_string(),
            },
        ]);
        sleep(Duration::from_millis(20)).await;
        desired.send(vec![Named {
            name: "b".to_string(),
        }]);
        sleep(Duration::from_millis(20)).await;

        let names: Vec<String> = collection
            .current()
            .iter()
            .map(|i| i.outputs().source.current().name)
            .collect();
        assert_eq!(names, vec!["b"]);
    }

    #[tokio::test]
    async fn component_removal_channel_is_merged_with_destruction() {
        use crate::relay::Outlet;

        struct RemovableOutputs {
            source: ItemSource<Todo>,
            removed: Outlet<()>,
        }

        fn removable(
            _ctx: ItemContext<()>,
            source: ItemSource<Todo>,
        ) -> Result<RemovableOutputs, BoxError> {
            Ok(RemovableOutputs {
                source,
                removed: Outlet::new(),
            })
        }

        let (desired, desired_stream) = relay::<Vec<Todo>>();
        let collection = gather_with_removal(removable, (), desired_stream, |o: &RemovableOutputs| {
            o.removed.subscribe()
        });

        desired.send(vec![todo(0, "self-removing"), todo(1, "reconciled")]);
        sleep(Duration::from_millis(20)).await;
        assert_eq!(collection.current().len(), 2);

        // The component removes itself without the key disappearing.
        collection.current().as_slice()[0].outputs().removed.emit(());
        sleep(Duration::from_millis(20)).await;
        assert_eq!(collection.current().len(), 1);

        // And reconciliation still removes the other one.
        desired.send(vec![]);
        sleep(Duration::from_millis(20)).await;
        assert_eq!(collection.current().len(), 0);
    }
}
