//! Storage backends for committed state intervals.
//!
//! A [`HistoryBackend`] receives every interval the transient state closes
//! and answers point queries over them. Backends are shared between the
//! state system and its owner through `Arc<dyn HistoryBackend>`, so all
//! methods take `&self` and implementations use interior mutability.

pub mod file;
pub mod memory;
pub mod null;

use crate::error::Result;
use crate::interval::StateInterval;
use crate::{Quark, Timestamp};

pub use file::{FileBackend, FileBackendConfig, SyncMode};
pub use memory::InMemoryBackend;
pub use null::NullBackend;

/// Storage of committed intervals.
pub trait HistoryBackend: Send + Sync {
    /// Identifier of this history.
    fn id(&self) -> &str;

    /// Earliest timestamp of the history.
    fn start_time(&self) -> Timestamp;

    /// Latest timestamp covered so far. Never decreases.
    fn end_time(&self) -> Timestamp;

    /// Stores one committed interval.
    ///
    /// # Errors
    ///
    /// Returns `StateError::TimeRange` if `start > end`, if the interval
    /// begins before the history start, or if it overlaps the previous
    /// interval of the same quark. Returns `StateError::BuildFinished` if
    /// the backend no longer accepts intervals.
    fn insert_interval(&self, interval: StateInterval) -> Result<()>;

    /// Fills `out[q]` with the interval of quark `q` intersecting `t`, for
    /// every quark the backend knows about. Other slots are left untouched.
    fn query_full_state(&self, t: Timestamp, out: &mut [Option<StateInterval>]) -> Result<()>;

    /// Returns the interval of `quark` intersecting `t`, if one is stored.
    fn query_single_state(&self, t: Timestamp, quark: Quark) -> Result<Option<StateInterval>>;

    /// Signals that no more intervals will be inserted.
    fn finish_building(&self, end_time: Timestamp) -> Result<()>;

    /// Persists the serialized attribute tree alongside the history.
    ///
    /// Returns `false` if this backend has no place for it.
    fn store_attribute_tree(&self, _bytes: &[u8]) -> Result<bool> {
        Ok(false)
    }

    /// Returns the attribute tree persisted with the history, if any.
    fn load_attribute_tree(&self) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    /// Deletes any files backing this history.
    fn remove_files(&self) -> Result<()> {
        Ok(())
    }

    /// Releases resources held by the backend.
    fn dispose(&self) {}
}
