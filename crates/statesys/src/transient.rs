//! Transient state: the ongoing value of every attribute during a build.
//!
//! Each quark has one slot holding the value currently in effect and the
//! time it started. A state change closes the previous value into an
//! interval that is handed to the backend, then opens the new one.
//!
//! The slot vector grows in lock-step with the attribute tree: the state
//! system calls [`TransientState::add_empty_entry`] for every new quark
//! while it holds the tree write lock.

use crate::backend::HistoryBackend;
use crate::error::{Result, StateError};
use crate::interval::{StateInterval, UNKNOWN_END};
use crate::value::{StateValue, ValueKind};
use crate::{Quark, Timestamp};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::debug;

#[derive(Debug, Clone)]
struct OngoingEntry {
    value: StateValue,
    start: Timestamp,
}

impl OngoingEntry {
    /// Kind recorded for the attribute; null resets it.
    fn kind(&self) -> ValueKind {
        self.value.kind()
    }
}

/// Ongoing state of all attributes of a history under construction.
pub struct TransientState {
    backend: Arc<dyn HistoryBackend>,
    entries: RwLock<Vec<OngoingEntry>>,
    active: AtomicBool,
    latest_time: AtomicI64,
}

impl std::fmt::Debug for TransientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransientState")
            .field("backend", &self.backend.id())
            .field("attributes", &self.len())
            .field("active", &self.is_active())
            .field("latest_time", &self.latest_time())
            .finish()
    }
}

impl TransientState {
    /// Creates an empty, active transient state feeding `backend`.
    pub fn new(backend: Arc<dyn HistoryBackend>) -> Self {
        let start = backend.start_time();
        Self {
            backend,
            entries: RwLock::new(Vec::new()),
            active: AtomicBool::new(true),
            latest_time: AtomicI64::new(start),
        }
    }

    /// Returns true until [`TransientState::close`] has run.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Latest timestamp seen by a state change.
    pub fn latest_time(&self) -> Timestamp {
        self.latest_time.load(Ordering::Acquire)
    }

    /// Number of slots (equals the attribute count while active).
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .len()
    }

    /// Returns true if no slot exists.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends a null slot starting at the backend start time.
    pub fn add_empty_entry(&self) {
        let mut entries = self.entries.write().unwrap_or_else(|err| err.into_inner());
        if !self.is_active() {
            return;
        }
        entries.push(OngoingEntry {
            value: StateValue::Null,
            start: self.backend.start_time(),
        });
    }

    /// Applies a state change of `quark` to `value` at `t`.
    ///
    /// If the value differs from the ongoing one, the ongoing value is
    /// committed to the backend as `[start, t - 1]` (when `start < t`) and
    /// `value` becomes the ongoing value from `t`.
    ///
    /// # Errors
    ///
    /// - `StateError::BuildFinished` if the transient state was closed
    /// - `StateError::AttributeNotFound` if `quark` has no slot
    /// - `StateError::StateValueType` if `value` is non-null and the
    ///   attribute currently holds a non-null value of another kind
    /// - `StateError::TimeRange` if `t` is before the ongoing start time
    pub fn process_state_change(&self, t: Timestamp, value: StateValue, quark: Quark) -> Result<()> {
        let mut entries = self.entries.write().unwrap_or_else(|err| err.into_inner());
        if !self.is_active() {
            return Err(StateError::BuildFinished);
        }
        let entry = slot_mut(&mut entries, quark)?;

        let expected = entry.kind();
        if !value.is_null() && expected != ValueKind::Null && value.kind() != expected {
            return Err(StateError::StateValueType(format!(
                "{} quark {}: got {}, expected {}",
                self.backend.id(),
                quark,
                value.kind(),
                expected
            )));
        }
        if t < entry.start {
            return Err(StateError::TimeRange(format!(
                "quark {}: change at {} precedes ongoing state start {}",
                quark, t, entry.start
            )));
        }
        if entry.value != value {
            if entry.start < t {
                let previous = StateInterval::new(entry.start, t - 1, quark, entry.value.clone());
                self.backend.insert_interval(previous)?;
                entry.start = t;
            }
            entry.value = value;
        }

        self.latest_time.fetch_max(t, Ordering::AcqRel);
        Ok(())
    }

    /// Returns the ongoing interval of `quark` if it covers `t`.
    pub fn interval_at(&self, t: Timestamp, quark: Quark) -> Option<StateInterval> {
        let entries = self.entries.read().unwrap_or_else(|err| err.into_inner());
        if !self.is_active() {
            return None;
        }
        slot(&entries, quark)
            .ok()
            .filter(|entry| entry.start <= t)
            .map(|entry| StateInterval::new(entry.start, UNKNOWN_END, quark, entry.value.clone()))
    }

    /// Returns the ongoing interval of `quark` regardless of time.
    pub fn ongoing_interval(&self, quark: Quark) -> Result<StateInterval> {
        let entries = self.read_active()?;
        let entry = slot(&entries, quark)?;
        Ok(StateInterval::new(
            entry.start,
            UNKNOWN_END,
            quark,
            entry.value.clone(),
        ))
    }

    /// Returns the ongoing value of `quark`.
    pub fn ongoing_value(&self, quark: Quark) -> Result<StateValue> {
        let entries = self.read_active()?;
        Ok(slot(&entries, quark)?.value.clone())
    }

    /// Returns the start time of the ongoing value of `quark`.
    pub fn ongoing_start_time(&self, quark: Quark) -> Result<Timestamp> {
        let entries = self.read_active()?;
        Ok(slot(&entries, quark)?.start)
    }

    /// Overwrites `out[q]` with the ongoing interval of every quark whose
    /// ongoing state started at or before `t`.
    pub fn query_full(&self, out: &mut [Option<StateInterval>], t: Timestamp) {
        let entries = self.entries.read().unwrap_or_else(|err| err.into_inner());
        if !self.is_active() {
            return;
        }
        for (quark, (target, entry)) in out.iter_mut().zip(entries.iter()).enumerate() {
            if entry.start <= t {
                *target = Some(StateInterval::new(
                    entry.start,
                    UNKNOWN_END,
                    quark as Quark,
                    entry.value.clone(),
                ));
            }
        }
    }

    /// Replaces the ongoing value of `quark` without touching its start
    /// time or committing anything.
    pub fn change_ongoing_value(&self, quark: Quark, value: StateValue) -> Result<()> {
        let mut entries = self.entries.write().unwrap_or_else(|err| err.into_inner());
        if !self.is_active() {
            return Err(StateError::BuildFinished);
        }
        slot_mut(&mut entries, quark)?.value = value;
        Ok(())
    }

    /// Replaces every slot at once. Only the start times and values of
    /// `intervals` are used; slot `i` takes `intervals[i]`.
    pub fn replace_ongoing_state(&self, intervals: Vec<StateInterval>) -> Result<()> {
        let mut entries = self.entries.write().unwrap_or_else(|err| err.into_inner());
        if !self.is_active() {
            return Err(StateError::BuildFinished);
        }
        *entries = intervals
            .into_iter()
            .map(|interval| OngoingEntry {
                value: interval.value,
                start: interval.start,
            })
            .collect();
        Ok(())
    }

    /// Commits every ongoing value as `[start, end]`, then deactivates.
    ///
    /// Slots whose ongoing state starts after `end` are dropped.
    ///
    /// # Errors
    ///
    /// Returns `StateError::BuildFinished` if already closed, or the first
    /// backend error. The transient state is deactivated either way.
    pub fn close(&self, end: Timestamp) -> Result<()> {
        let mut entries = self.entries.write().unwrap_or_else(|err| err.into_inner());
        if !self.active.swap(false, Ordering::AcqRel) {
            return Err(StateError::BuildFinished);
        }

        let mut result = Ok(());
        let mut committed = 0usize;
        for (quark, entry) in entries.drain(..).enumerate() {
            if entry.start > end {
                continue;
            }
            let interval = StateInterval::new(entry.start, end, quark as Quark, entry.value);
            if let Err(e) = self.backend.insert_interval(interval) {
                if result.is_ok() {
                    result = Err(e);
                }
                continue;
            }
            committed += 1;
        }
        self.latest_time.fetch_max(end, Ordering::AcqRel);

        debug!(
            "Closed transient state of {} at {} ({} intervals committed)",
            self.backend.id(),
            end,
            committed
        );
        result
    }

    /// Deactivates without committing anything; ongoing values are lost.
    pub fn deactivate(&self) {
        let mut entries = self.entries.write().unwrap_or_else(|err| err.into_inner());
        self.active.store(false, Ordering::Release);
        entries.clear();
    }

    fn read_active(&self) -> Result<std::sync::RwLockReadGuard<'_, Vec<OngoingEntry>>> {
        let entries = self.entries.read().unwrap_or_else(|err| err.into_inner());
        if !self.is_active() {
            return Err(StateError::BuildFinished);
        }
        Ok(entries)
    }
}

fn slot(entries: &[OngoingEntry], quark: Quark) -> Result<&OngoingEntry> {
    usize::try_from(quark)
        .ok()
        .and_then(|idx| entries.get(idx))
        .ok_or_else(|| StateError::AttributeNotFound(format!("invalid quark {}", quark)))
}

fn slot_mut(entries: &mut [OngoingEntry], quark: Quark) -> Result<&mut OngoingEntry> {
    usize::try_from(quark)
        .ok()
        .and_then(|idx| entries.get_mut(idx))
        .ok_or_else(|| StateError::AttributeNotFound(format!("invalid quark {}", quark)))
}
