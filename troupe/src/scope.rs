//! Per-instance scope isolation for shared channels.
//!
//! A [`Bus`] is a broadcast channel shared by every instance of a collection
//! and by external drivers. Every event on the bus carries two tags: the
//! instance that published it (if any) and the instance it is addressed to
//! (if any). [`Bus::scoped`] produces an instance's isolated view: outgoing
//! events are tagged with the instance's own id, and the incoming stream
//! passes only events addressed to this instance or broadcast by *other*
//! instances. An instance never hears its own echo, and siblings never see
//! events that were not meant for them.
//!
//! A component that uses no buses needs no isolation; the scope token is then
//! simply unused.

use futures::{Stream, StreamExt, future};

use crate::instance::InstanceId;
use crate::relay::Outlet;

/// The scope token of one instance, handed to its component through
/// [`ItemContext`](crate::ItemContext).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Scope {
    id: InstanceId,
}

impl Scope {
    pub(crate) fn new(id: InstanceId) -> Self {
        Self { id }
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }
}

#[derive(Clone, Debug)]
struct BusEvent<T> {
    origin: Option<InstanceId>,
    target: Option<InstanceId>,
    value: T,
}

/// A shared broadcast channel with per-instance tagging.
///
/// Cloning a bus clones a handle to the same channel; a bus typically lives in
/// a collection's shared inputs so every instance can scope it.
pub struct Bus<T> {
    channel: Outlet<BusEvent<T>>,
}

impl<T> Bus<T>
where
    T: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            channel: Outlet::new(),
        }
    }

    /// Publish an external event visible to every scoped subscriber.
    pub fn broadcast(&self, value: T) {
        self.channel.emit(BusEvent {
            origin: None,
            target: None,
            value,
        });
    }

    /// Publish an external event visible only to the addressed instance.
    pub fn send_to(&self, target: InstanceId, value: T) {
        self.channel.emit(BusEvent {
            origin: None,
            target: Some(target),
            value,
        });
    }

    /// An instance's isolated view of this bus.
    ///
    /// Lazy: nothing is subscribed until [`ScopedBus::events`] is consumed.
    pub fn scoped(&self, scope: &Scope) -> ScopedBus<T> {
        ScopedBus {
            id: scope.id(),
            channel: self.channel.clone(),
        }
    }
}

impl<T> Clone for Bus<T> {
    fn clone(&self) -> Self {
        Self {
            channel: self.channel.clone(),
        }
    }
}

impl<T> Default for Bus<T>
where
    T: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Bus<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus").finish_non_exhaustive()
    }
}

/// One instance's isolated view of a [`Bus`].
pub struct ScopedBus<T> {
    id: InstanceId,
    channel: Outlet<BusEvent<T>>,
}

impl<T> ScopedBus<T>
where
    T: Clone + Send + 'static,
{
    /// Publish to the bus, tagged with this instance's id. Siblings receive
    /// it through their own [`events`](ScopedBus::events) streams; this
    /// instance does not.
    pub fn publish(&self, value: T) {
        self.channel.emit(BusEvent {
            origin: Some(self.id),
            target: None,
            value,
        });
    }

    /// Publish an event addressed to one sibling only.
    pub fn send_to(&self, target: InstanceId, value: T) {
        self.channel.emit(BusEvent {
            origin: Some(self.id),
            target: Some(target),
            value,
        });
    }

    /// Events this instance is allowed to observe: anything addressed to it,
    /// plus broadcasts that did not originate from it.
    pub fn events(&self) -> impl Stream<Item = T> + Send + use<T> {
        let own = self.id;
        self.channel.subscribe().filter_map(move |event| {
            let visible = match event.target {
                Some(target) => target == own,
                None => event.origin != Some(own),
            };
            future::ready(visible.then_some(event.value))
        })
    }
}

impl<T> Clone for ScopedBus<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            channel: self.channel.clone(),
        }
    }
}

impl<T> std::fmt::Debug for ScopedBus<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedBus")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}
