//! Error types for the collection engine.

use thiserror::Error;

/// Boxed error returned by component constructors.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Fatal errors surfaced on a collection's snapshot stream.
///
/// Local, recoverable conditions (double removal, empty collections,
/// undecidable field comparisons) are absorbed inside the engine and never
/// reach this type. Only component construction failures escalate: the
/// offending batch is discarded, the error is emitted once through
/// [`Collection::snapshots`](crate::Collection::snapshots) and the collection
/// stops processing instructions.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CollectionError {
    /// A component constructor returned an error while an instance was being
    /// added. No partial instance is retained.
    #[error("failed to build `{type_name}` instance: {reason}")]
    Build {
        /// Output type of the component that failed.
        type_name: &'static str,
        /// The constructor's own error.
        reason: BoxError,
    },
}
