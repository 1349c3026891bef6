//! Backend that discards every interval.
//!
//! Useful when only the ongoing state matters (for example when a provider
//! is used to compute the final state of a trace).

use super::HistoryBackend;
use crate::error::Result;
use crate::interval::StateInterval;
use crate::{Quark, Timestamp};
use std::sync::atomic::{AtomicI64, Ordering};

/// Backend storing nothing and answering no queries.
#[derive(Debug)]
pub struct NullBackend {
    id: String,
    start_time: Timestamp,
    end_time: AtomicI64,
}

impl NullBackend {
    /// Creates a backend for a history starting at `start_time`.
    pub fn new(id: impl Into<String>, start_time: Timestamp) -> Self {
        Self {
            id: id.into(),
            start_time,
            end_time: AtomicI64::new(start_time),
        }
    }
}

impl HistoryBackend for NullBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn start_time(&self) -> Timestamp {
        self.start_time
    }

    fn end_time(&self) -> Timestamp {
        self.end_time.load(Ordering::Acquire)
    }

    fn insert_interval(&self, interval: StateInterval) -> Result<()> {
        self.end_time.fetch_max(interval.end, Ordering::AcqRel);
        Ok(())
    }

    fn query_full_state(&self, _t: Timestamp, _out: &mut [Option<StateInterval>]) -> Result<()> {
        Ok(())
    }

    fn query_single_state(&self, _t: Timestamp, _quark: Quark) -> Result<Option<StateInterval>> {
        Ok(None)
    }

    fn finish_building(&self, end_time: Timestamp) -> Result<()> {
        self.end_time.fetch_max(end_time, Ordering::AcqRel);
        Ok(())
    }
}
