use super::StateSystem;
use crate::error::{Result, StateError};
use crate::interval::StateInterval;
use crate::value::StateValue;
use crate::{Quark, Timestamp};
use tracing::warn;

impl StateSystem {
    fn check_time(&self, t: Timestamp) -> Result<()> {
        let start = self.start_time();
        if t < start {
            return Err(StateError::TimeRange(format!(
                "{}: time {} is before history start {}",
                self.ssid(),
                t,
                start
            )));
        }
        if self.is_closed() {
            let end = self.current_end_time();
            if t > end {
                return Err(StateError::TimeRange(format!(
                    "{}: time {} is after history end {}",
                    self.ssid(),
                    t,
                    end
                )));
            }
        }
        Ok(())
    }

    /// Returns the value `quark` currently holds. On a closed history this
    /// is the value at the end time.
    pub fn query_ongoing_state(&self, quark: Quark) -> Result<StateValue> {
        self.check_disposed()?;
        if self.transient.is_active() {
            return self.transient.ongoing_value(quark);
        }
        Ok(self.query_single_state(self.current_end_time(), quark)?.value)
    }

    /// Returns the time at which the current value of `quark` started.
    pub fn ongoing_start_time(&self, quark: Quark) -> Result<Timestamp> {
        self.check_disposed()?;
        if self.transient.is_active() {
            return self.transient.ongoing_start_time(quark);
        }
        Ok(self.query_single_state(self.current_end_time(), quark)?.start)
    }

    /// Returns the interval of `quark` covering `t`.
    ///
    /// The ongoing state answers first, then the backend. If neither knows
    /// the attribute at `t`, a null interval `[t, max(t, end)]` is returned.
    ///
    /// # Errors
    ///
    /// - `StateError::TimeRange` if `t` is outside the history
    /// - `StateError::AttributeNotFound` for an unknown quark
    /// - `StateError::Disposed` after [`StateSystem::dispose`]
    pub fn query_single_state(&self, t: Timestamp, quark: Quark) -> Result<StateInterval> {
        self.check_disposed()?;
        self.check_time(t)?;
        self.check_quark(quark)?;

        if let Some(interval) = self.transient.interval_at(t, quark) {
            return Ok(interval);
        }
        if let Some(interval) = self.backend.query_single_state(t, quark)? {
            return Ok(interval);
        }

        let end = t.max(self.current_end_time());
        warn!(
            "{}: no interval for quark {} at {}, answering null",
            self.ssid(),
            quark,
            t
        );
        Ok(StateInterval::null(t, end, quark))
    }

    /// Returns one interval per attribute, indexed by quark, covering `t`.
    ///
    /// Attributes without any stored information get a null `[t, t]`.
    pub fn query_full_state(&self, t: Timestamp) -> Result<Vec<StateInterval>> {
        self.check_disposed()?;
        self.check_time(t)?;

        let count = self.attribute_count();
        let mut slots: Vec<Option<StateInterval>> = vec![None; count];
        // Ongoing state first: anything it misses is already committed.
        self.transient.query_full(&mut slots, t);
        self.backend.query_full_state(t, &mut slots)?;

        let mut missing = 0usize;
        let states: Vec<StateInterval> = slots
            .into_iter()
            .enumerate()
            .map(|(quark, slot)| {
                slot.unwrap_or_else(|| {
                    missing += 1;
                    StateInterval::null(t, t, quark as Quark)
                })
            })
            .collect();
        if missing > 0 {
            warn!(
                "{}: {} attributes without interval at {}, answering null",
                self.ssid(),
                missing,
                t
            );
        }
        Ok(states)
    }

    /// Returns every interval of `quark` intersecting `[t1, t2]`, in time
    /// order. `t2` is clamped to the current end time.
    ///
    /// # Errors
    ///
    /// Returns `StateError::TimeRange` if `t2 <= t1` or `t1` is outside the
    /// history.
    pub fn query_history_range(&self, quark: Quark, t1: Timestamp, t2: Timestamp) -> Result<Vec<StateInterval>> {
        if t2 <= t1 {
            return Err(StateError::TimeRange(format!(
                "invalid range [{}, {}]",
                t1, t2
            )));
        }
        let t_end = t2.min(self.current_end_time());
        let mut intervals = Vec::new();
        self.walk_intervals(quark, t1, t_end, &mut intervals)?;
        Ok(intervals)
    }

    /// Appends the consecutive intervals of `quark` from the one covering
    /// `t1` up to the one covering `t_end` (or the ongoing one).
    fn walk_intervals(
        &self,
        quark: Quark,
        t1: Timestamp,
        t_end: Timestamp,
        out: &mut Vec<StateInterval>,
    ) -> Result<()> {
        let mut current = self.query_single_state(t1, quark)?;
        loop {
            let next = current.end.checked_add(1);
            let done = current.is_ongoing() || current.end >= t_end;
            out.push(current);
            match next {
                Some(next) if !done => current = self.query_single_state(next, quark)?,
                _ => return Ok(()),
            }
        }
    }

    /// Samples the intervals of `quark` over `[t1, t2]` every `resolution`
    /// time units. An interval spanning several sample points is returned
    /// once; the interval covering the clamped end is always included.
    ///
    /// # Errors
    ///
    /// Returns `StateError::TimeRange` if `t2 < t1`, if `resolution <= 0`
    /// or if `t1` is outside the history.
    pub fn query_history_range_with_resolution(
        &self,
        quark: Quark,
        t1: Timestamp,
        t2: Timestamp,
        resolution: i64,
    ) -> Result<Vec<StateInterval>> {
        if t2 < t1 || resolution <= 0 {
            return Err(StateError::TimeRange(format!(
                "invalid range [{}, {}] with resolution {}",
                t1, t2, resolution
            )));
        }
        let t_end = t2.min(self.current_end_time());

        let mut intervals: Vec<StateInterval> = Vec::new();
        let mut ts = t1;
        while ts <= t_end {
            let current = self.query_single_state(ts, quark)?;
            if current.is_ongoing() {
                intervals.push(current);
                break;
            }
            // Jump to the first sample point past this interval
            let steps = current.end.saturating_sub(ts) / resolution + 1;
            let next = steps.checked_mul(resolution).and_then(|d| ts.checked_add(d));
            intervals.push(current);
            match next {
                Some(next) => ts = next,
                None => break,
            }
        }

        if let Some(last) = intervals.last() {
            if !last.is_ongoing() && last.end < t_end {
                intervals.push(self.query_single_state(t_end, quark)?);
            }
        }
        Ok(intervals)
    }

    /// Returns every interval of `quarks` intersecting `[start, end]`.
    ///
    /// Results are grouped by ascending quark (duplicates ignored), each
    /// group in time order. On a closed history `end` is clamped to the
    /// end time.
    ///
    /// # Errors
    ///
    /// - `StateError::TimeRange` if `end < start` or `start` precedes the
    ///   history start
    /// - `StateError::AttributeNotFound` if a quark is unknown
    pub fn query_2d(
        &self,
        quarks: &[Quark],
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<StateInterval>> {
        self.check_disposed()?;
        if end < start {
            return Err(StateError::TimeRange(format!(
                "invalid range [{}, {}]",
                start, end
            )));
        }
        self.check_2d_start(start)?;
        let quarks = self.checked_quarks(quarks)?;

        let t_end = if self.is_closed() {
            end.min(self.current_end_time())
        } else {
            end
        };
        let mut intervals = Vec::new();
        if t_end < start {
            return Ok(intervals);
        }
        for quark in quarks {
            self.walk_intervals(quark, start, t_end, &mut intervals)?;
        }
        Ok(intervals)
    }

    /// Returns the intervals of `quarks` covering any of `times`, each
    /// interval once.
    ///
    /// Results are grouped by ascending quark, each group in time order.
    /// On a closed history, times after the end time are ignored.
    ///
    /// # Errors
    ///
    /// - `StateError::TimeRange` if a time precedes the history start
    /// - `StateError::AttributeNotFound` if a quark is unknown
    pub fn query_2d_at(
        &self,
        quarks: &[Quark],
        times: &[Timestamp],
    ) -> Result<Vec<StateInterval>> {
        self.check_disposed()?;
        let mut times = times.to_vec();
        times.sort_unstable();
        times.dedup();
        let Some(&first) = times.first() else {
            return Ok(Vec::new());
        };
        self.check_2d_start(first)?;
        let quarks = self.checked_quarks(quarks)?;

        if self.is_closed() {
            let end = self.current_end_time();
            times.retain(|&t| t <= end);
        }

        let mut intervals = Vec::new();
        for quark in quarks {
            let mut covered_until: Option<Timestamp> = None;
            for &t in &times {
                if covered_until.is_some_and(|end| t <= end) {
                    continue;
                }
                let interval = self.query_single_state(t, quark)?;
                covered_until = Some(interval.end);
                intervals.push(interval);
            }
        }
        Ok(intervals)
    }

    fn check_2d_start(&self, t: Timestamp) -> Result<()> {
        let start = self.start_time();
        if t < start {
            return Err(StateError::TimeRange(format!(
                "{}: time {} is before history start {}",
                self.ssid(),
                t,
                start
            )));
        }
        Ok(())
    }

    /// Sorted, deduplicated copy of `quarks`, all of them valid.
    fn checked_quarks(&self, quarks: &[Quark]) -> Result<Vec<Quark>> {
        let mut quarks = quarks.to_vec();
        quarks.sort_unstable();
        quarks.dedup();
        for &quark in &quarks {
            self.check_quark(quark)?;
        }
        Ok(quarks)
    }

    /// Returns the interval of the top element of the stack attribute
    /// `quark` at `t`, or `None` if the stack is empty then.
    pub fn query_single_stack_top(&self, t: Timestamp, quark: Quark) -> Result<Option<StateInterval>> {
        match self.query_single_state(t, quark)?.value {
            StateValue::Null => Ok(None),
            StateValue::Int(depth) => {
                let top = self.quark_relative(quark, &[depth.to_string()])?;
                Ok(Some(self.query_single_state(t, top)?))
            }
            other => Err(StateError::StateValueType(format!(
                "quark {} holds a {} value, not a stack depth",
                quark,
                other.kind()
            ))),
        }
    }
}
