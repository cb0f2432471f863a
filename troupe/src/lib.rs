//! # troupe
//!
//! Dynamic collections of concurrently-running reactive component instances.
//!
//! A component is a plain constructor `Fn(ItemContext<S>, A) -> Result<O, _>`
//! turning shared inputs and per-add overrides into a bundle of output
//! channels. A [`Collection`] runs many instances of one component, adding
//! them from an event stream and removing each when its designated removal
//! channel first fires, all folded through one serialized instruction stream,
//! so the registry needs no locks and snapshots are totally ordered.
//!
//! ## Architecture
//!
//! ```text
//! add events ──┐
//! removal triggers ──┤→ instruction fold → Snapshot stream → pluck / merge → consumer
//! desired-state snapshots → gather (reconciler) ──┘
//! ```
//!
//! - [`collection`] - the instance registry and its mutation protocol
//! - [`pluck`] - combine-latest aggregation over every live instance
//! - [`merge`] - id-tagged event fan-in over every live instance
//! - [`gather`] - reconciles desired-state snapshots into add/remove/update
//! - [`scope`] - per-instance isolation of shared broadcast channels
//! - [`relay`] - event channels: single-consumer relays, fan-out outlets
//! - [`instance`] - instance identity and persistent registry snapshots
//!
//! Everything is push-based and runs on an ambient tokio runtime; state is
//! exposed through `futures-signals` signals (replay-last, multi-subscriber)
//! and `futures` streams.

pub mod collection;
pub mod error;
pub mod gather;
pub mod instance;
pub mod merge;
pub mod pluck;
pub mod relay;
pub mod scope;
pub mod task;

pub use collection::{Collection, ItemContext};
pub use error::{BoxError, CollectionError};
pub use gather::{ItemSource, Record, gather, gather_by_key, gather_with_removal};
pub use instance::{IdAllocator, Instance, InstanceId, Snapshot};
pub use merge::{Emission, Merged, merge};
pub use pluck::{Plucked, pluck};
pub use relay::{Outlet, OutletStream, Relay, RelayError, relay};
pub use scope::{Bus, Scope, ScopedBus};
pub use task::{TaskHandle, spawn};
