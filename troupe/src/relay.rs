//! Event channels: single-consumer relays and multi-subscriber outlets.
//!
//! [`Relay`] carries events *into* the engine (add events, desired-state
//! snapshots, component inputs) over a plain unbounded channel. [`Outlet`]
//! carries events *out of* a component instance: the same channel pattern
//! fanned out, so the removal watcher, a `merge` aggregation and the consumer
//! can all subscribe to one sink independently.

use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::Stream;
use futures::channel::mpsc::{UnboundedReceiver, UnboundedSender, unbounded};

/// Sender half of a single-consumer event channel.
///
/// The receiver is returned by [`relay()`] and is usually handed straight to
/// [`Collection::new`](crate::Collection::new) as the add stream, or consumed
/// inside a component. If the receiver has been dropped, sends are silently
/// discarded; use [`try_send`](Relay::try_send) to observe that.
///
/// # Examples
///
/// ```no_run
/// use troupe::relay;
///
/// let (add_relay, add_stream) = relay::<String>();
/// add_relay.send("first item".to_string());
/// # let _ = add_stream;
/// ```
#[derive(Clone, Debug)]
pub struct Relay<T>
where
    T: Send + 'static,
{
    sender: UnboundedSender<T>,
}

/// Error type for [`Relay`] operations.
#[derive(Debug, Clone)]
pub enum RelayError {
    /// The channel has been closed (receiver dropped).
    ChannelClosed,
}

impl<T> Relay<T>
where
    T: Send + 'static,
{
    /// Create a relay with its receiver stream. Prefer the [`relay()`]
    /// function, which reads like the channel constructors it mirrors.
    pub fn new() -> (Self, UnboundedReceiver<T>) {
        let (sender, receiver) = unbounded();
        (Relay { sender }, receiver)
    }

    /// Send an event, discarding it silently when the receiver is gone.
    pub fn send(&self, value: T) {
        let _ = self.sender.unbounded_send(value);
    }

    /// Send an event with explicit error handling.
    pub fn try_send(&self, value: T) -> Result<(), RelayError> {
        self.sender
            .unbounded_send(value)
            .map_err(|_| RelayError::ChannelClosed)
    }
}

impl<T> Default for Relay<T>
where
    T: Send + 'static,
{
    /// A disconnected relay: events are silently discarded. Useful as a
    /// placeholder for optional inputs that a particular caller never wires.
    fn default() -> Self {
        let (relay, _receiver) = Self::new();
        relay
    }
}

/// Create a relay with its receiver stream.
///
/// # Examples
///
/// ```
/// use futures::StreamExt;
/// use troupe::relay;
///
/// # async fn example() {
/// let (tick_relay, mut tick_stream) = relay::<u32>();
/// tick_relay.send(1);
/// assert_eq!(tick_stream.next().await, Some(1));
/// # }
/// ```
pub fn relay<T>() -> (Relay<T>, UnboundedReceiver<T>)
where
    T: Send + 'static,
{
    Relay::new()
}

/// A multi-subscriber output sink.
///
/// Components expose outlets as their output channels: every
/// [`subscribe`](Outlet::subscribe) call opens an independent stream that sees
/// every event emitted from then on. The engine relies on this to watch a
/// removal channel while `merge` and the consumer watch the same sink.
///
/// Emitting with no subscribers discards the event, matching [`Relay`].
pub struct Outlet<T> {
    subscribers: Arc<Mutex<Vec<UnboundedSender<T>>>>,
}

impl<T> Outlet<T>
where
    T: Send + 'static,
{
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Open a stream over all events emitted after this call.
    pub fn subscribe(&self) -> OutletStream<T> {
        let (sender, receiver) = unbounded();
        self.lock().push(sender);
        OutletStream { receiver }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<UnboundedSender<T>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<T> Outlet<T>
where
    T: Clone + Send + 'static,
{
    /// Emit an event to every live subscriber.
    pub fn emit(&self, value: T) {
        let mut subscribers = self.lock();
        subscribers.retain(|sender| !sender.is_closed());
        for sender in subscribers.iter() {
            let _ = sender.unbounded_send(value.clone());
        }
    }
}

impl<T> Clone for Outlet<T> {
    fn clone(&self) -> Self {
        Self {
            subscribers: self.subscribers.clone(),
        }
    }
}

impl<T> Default for Outlet<T>
where
    T: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Outlet<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outlet").finish_non_exhaustive()
    }
}

/// One subscriber's view of an [`Outlet`].
#[derive(Debug)]
pub struct OutletStream<T> {
    receiver: UnboundedReceiver<T>,
}

impl<T> Stream for OutletStream<T> {
    type Item = T;

    fn poll_next(self: std::pin::Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        std::pin::Pin::new(&mut self.get_mut().receiver).poll_next(cx)
    }
}
