//! Instance identity and registry snapshots.
//!
//! An [`Instance`] is one running component occurrence: an id allocated once,
//! a diagnostic type name and a shared handle to the component's outputs.
//! A [`Snapshot`] is the registry's instance list at one point in logical
//! time: a persistent value, so previously published snapshots are never
//! mutated by later adds or removals.

use std::fmt;
use std::sync::Arc;

/// Identifier of one instance, unique for the lifetime of the allocator that
/// issued it. Ids are never reused.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct InstanceId(u64);

impl InstanceId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Strictly increasing id source.
///
/// Each collection owns its own allocator inside its fold task, so there is
/// no process-wide counter and no synchronization. No wraparound handling: a
/// `u64` does not wrap within a process lifetime at any realistic add rate.
#[derive(Debug, Default)]
pub struct IdAllocator {
    next: u64,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self) -> InstanceId {
        let id = InstanceId(self.next);
        self.next += 1;
        id
    }
}

/// One running component occurrence inside a collection.
///
/// Instances are immutable value handles wrapping live streams: cloning an
/// instance shares its outputs, and nothing about an instance changes after
/// construction. Aggregator memo tables hold instances without ever mutating
/// them.
pub struct Instance<O> {
    id: InstanceId,
    type_name: &'static str,
    outputs: Arc<O>,
}

impl<O> Instance<O> {
    pub(crate) fn new(id: InstanceId, outputs: O) -> Self {
        Self {
            id,
            type_name: std::any::type_name::<O>(),
            outputs: Arc::new(outputs),
        }
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    /// Diagnostic name of the component's output type.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// The component's output channels.
    pub fn outputs(&self) -> &O {
        &self.outputs
    }
}

impl<O> Clone for Instance<O> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            type_name: self.type_name,
            outputs: self.outputs.clone(),
        }
    }
}

impl<O> fmt::Debug for Instance<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

/// An ordered, duplicate-free-by-id list of live instances.
///
/// Snapshots are persistent: `append`/`without` build new values over shared
/// instance handles, so a clone taken at any point keeps observing exactly the
/// instance set it was taken with. Relative order is insertion order and is
/// stable across removals.
pub struct Snapshot<O> {
    items: Arc<[Instance<O>]>,
}

impl<O> Snapshot<O> {
    pub(crate) fn empty() -> Self {
        Self {
            items: Arc::from(Vec::new()),
        }
    }

    /// Read-only view of the current instances.
    pub fn as_slice(&self) -> &[Instance<O>] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Instance<O>> {
        self.items.iter()
    }

    pub fn get(&self, id: InstanceId) -> Option<&Instance<O>> {
        self.items.iter().find(|instance| instance.id() == id)
    }

    pub fn contains(&self, id: InstanceId) -> bool {
        self.get(id).is_some()
    }

    pub(crate) fn append(&self, added: Vec<Instance<O>>) -> Self {
        let mut items: Vec<Instance<O>> = self.items.iter().cloned().collect();
        items.extend(added);
        Self {
            items: Arc::from(items),
        }
    }

    /// New snapshot without `id`. Removing an absent id yields an equivalent
    /// snapshot; callers decide whether that counts as a change.
    pub(crate) fn without(&self, id: InstanceId) -> Self {
        let items: Vec<Instance<O>> = self
            .items
            .iter()
            .filter(|instance| instance.id() != id)
            .cloned()
            .collect();
        Self {
            items: Arc::from(items),
        }
    }
}

impl<O> Clone for Snapshot<O> {
    fn clone(&self) -> Self {
        Self {
            items: self.items.clone(),
        }
    }
}

impl<O> fmt::Debug for Snapshot<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.items.iter()).finish()
    }
}
