//! In-memory interval storage.
//!
//! Intervals are kept per quark in append order. Because the transient
//! state commits the intervals of one quark in time order, every per-quark
//! vector is sorted and point lookups are a binary search.

use super::HistoryBackend;
use crate::error::{Result, StateError};
use crate::interval::StateInterval;
use crate::{Quark, Timestamp};
use std::sync::RwLock;

#[derive(Debug)]
struct MemoryIndex {
    end_time: Timestamp,
    /// Committed intervals indexed by quark, sorted by start time.
    by_quark: Vec<Vec<StateInterval>>,
    interval_count: usize,
}

/// Backend keeping every committed interval in memory.
#[derive(Debug)]
pub struct InMemoryBackend {
    id: String,
    start_time: Timestamp,
    index: RwLock<MemoryIndex>,
}

impl InMemoryBackend {
    /// Creates an empty backend for a history starting at `start_time`.
    pub fn new(id: impl Into<String>, start_time: Timestamp) -> Self {
        Self {
            id: id.into(),
            start_time,
            index: RwLock::new(MemoryIndex {
                end_time: start_time,
                by_quark: Vec::new(),
                interval_count: 0,
            }),
        }
    }

    /// Returns the number of stored intervals.
    pub fn interval_count(&self) -> usize {
        self.index
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .interval_count
    }

    /// Returns a copy of every interval stored for `quark`, in time order.
    pub fn intervals_of(&self, quark: Quark) -> Vec<StateInterval> {
        let index = self.index.read().unwrap_or_else(|err| err.into_inner());
        usize::try_from(quark)
            .ok()
            .and_then(|q| index.by_quark.get(q))
            .cloned()
            .unwrap_or_default()
    }

    fn check_interval(&self, index: &MemoryIndex, interval: &StateInterval) -> Result<usize> {
        if interval.start > interval.end {
            return Err(StateError::TimeRange(format!(
                "interval start {} is after its end {}",
                interval.start, interval.end
            )));
        }
        if interval.start < self.start_time {
            return Err(StateError::TimeRange(format!(
                "interval start {} is before history start {}",
                interval.start, self.start_time
            )));
        }
        let quark = usize::try_from(interval.quark).map_err(|_| {
            StateError::AttributeNotFound(format!("invalid quark {}", interval.quark))
        })?;
        if let Some(last) = index.by_quark.get(quark).and_then(|v| v.last()) {
            if interval.start <= last.end {
                return Err(StateError::TimeRange(format!(
                    "interval {} overlaps previous interval {}",
                    interval, last
                )));
            }
        }
        Ok(quark)
    }
}

fn lookup(intervals: &[StateInterval], t: Timestamp) -> Option<&StateInterval> {
    let idx = intervals.partition_point(|interval| interval.end < t);
    intervals.get(idx).filter(|interval| interval.start <= t)
}

impl HistoryBackend for InMemoryBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn start_time(&self) -> Timestamp {
        self.start_time
    }

    fn end_time(&self) -> Timestamp {
        self.index
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .end_time
    }

    fn insert_interval(&self, interval: StateInterval) -> Result<()> {
        let mut index = self.index.write().unwrap_or_else(|err| err.into_inner());
        let quark = self.check_interval(&index, &interval)?;

        if index.by_quark.len() <= quark {
            index.by_quark.resize_with(quark + 1, Vec::new);
        }
        index.end_time = index.end_time.max(interval.end);
        index.interval_count += 1;
        index.by_quark[quark].push(interval);
        Ok(())
    }

    fn query_full_state(&self, t: Timestamp, out: &mut [Option<StateInterval>]) -> Result<()> {
        let index = self.index.read().unwrap_or_else(|err| err.into_inner());
        for (slot, intervals) in out.iter_mut().zip(index.by_quark.iter()) {
            if let Some(interval) = lookup(intervals, t) {
                *slot = Some(interval.clone());
            }
        }
        Ok(())
    }

    fn query_single_state(&self, t: Timestamp, quark: Quark) -> Result<Option<StateInterval>> {
        let index = self.index.read().unwrap_or_else(|err| err.into_inner());
        Ok(usize::try_from(quark)
            .ok()
            .and_then(|q| index.by_quark.get(q))
            .and_then(|intervals| lookup(intervals, t))
            .cloned())
    }

    fn finish_building(&self, end_time: Timestamp) -> Result<()> {
        let mut index = self.index.write().unwrap_or_else(|err| err.into_inner());
        index.end_time = index.end_time.max(end_time);
        Ok(())
    }
}
