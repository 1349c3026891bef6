use super::StateSystem;
use crate::error::{Result, StateError};
use crate::interval::StateInterval;
use crate::value::StateValue;
use crate::{Quark, Timestamp};

/// Maximum depth of a stack attribute.
pub const MAX_STACK_DEPTH: i32 = 100_000;

impl StateSystem {
    /// Sets the value of `quark` to `value` from time `t` on.
    ///
    /// # Errors
    ///
    /// - `StateError::TimeRange` if `t` precedes the ongoing state start
    /// - `StateError::StateValueType` on a kind mismatch
    /// - `StateError::AttributeNotFound` for an unknown quark
    /// - `StateError::BuildFinished` once the history is closed
    pub fn modify_attribute(&self, t: Timestamp, value: StateValue, quark: Quark) -> Result<()> {
        self.check_disposed()?;
        self.transient.process_state_change(t, value, quark)
    }

    /// Adds one to the integer value of `quark` (null counts as zero).
    ///
    /// # Errors
    ///
    /// Returns `StateError::StateValueType` if the attribute holds a value
    /// that is neither null nor an integer.
    pub fn increment_attribute(&self, t: Timestamp, quark: Quark) -> Result<()> {
        self.check_disposed()?;
        let current = match self.transient.ongoing_value(quark)? {
            StateValue::Null => 0,
            StateValue::Int(v) => v,
            other => {
                return Err(StateError::StateValueType(format!(
                    "cannot increment {} value of quark {}",
                    other.kind(),
                    quark
                )))
            }
        };
        self.transient
            .process_state_change(t, StateValue::Int(current.wrapping_add(1)), quark)
    }

    /// Pushes `value` onto the stack attribute `quark`.
    ///
    /// The attribute holds the stack depth; the pushed value goes to the
    /// child named after the new depth (`"1"`, `"2"`, ...).
    ///
    /// # Errors
    ///
    /// - `StateError::StateValueType` if the attribute is not a stack
    /// - `StateError::AttributeNotFound` if the stack is already
    ///   [`MAX_STACK_DEPTH`] deep
    pub fn push_attribute(&self, t: Timestamp, value: StateValue, quark: Quark) -> Result<()> {
        self.check_disposed()?;
        let depth = self.stack_depth(quark)?.unwrap_or(0);
        if depth >= MAX_STACK_DEPTH {
            return Err(StateError::AttributeNotFound(format!(
                "Stack limit reached on quark {}, not pushing",
                quark
            )));
        }

        let depth = depth + 1;
        let child = self.quark_relative_and_add(quark, &[depth.to_string()])?;
        self.transient
            .process_state_change(t, StateValue::Int(depth), quark)?;
        self.transient.process_state_change(t, value, child)
    }

    /// Pops the top value of the stack attribute `quark`.
    ///
    /// Returns `Ok(None)` if the stack is empty. The popped child is
    /// nullified and the depth becomes null when the stack empties.
    ///
    /// # Errors
    ///
    /// Returns `StateError::StateValueType` if the attribute does not hold
    /// a valid stack depth.
    pub fn pop_attribute(&self, t: Timestamp, quark: Quark) -> Result<Option<StateValue>> {
        self.check_disposed()?;
        let Some(depth) = self.stack_depth(quark)? else {
            return Ok(None);
        };
        if depth <= 0 {
            return Err(StateError::StateValueType(format!(
                "invalid stack depth {} on quark {}",
                depth, quark
            )));
        }

        let child = self.quark_relative(quark, &[depth.to_string()])?;
        let popped = self.transient.ongoing_value(child)?;

        let next = if depth == 1 {
            StateValue::Null
        } else {
            StateValue::Int(depth - 1)
        };
        self.transient.process_state_change(t, next, quark)?;
        self.remove_attribute(t, child)?;
        Ok(Some(popped))
    }

    /// Ongoing depth of a stack attribute; `None` for an empty stack.
    fn stack_depth(&self, quark: Quark) -> Result<Option<i32>> {
        match self.transient.ongoing_value(quark)? {
            StateValue::Null => Ok(None),
            StateValue::Int(depth) => Ok(Some(depth)),
            other => Err(StateError::StateValueType(format!(
                "quark {} holds a {} value, not a stack depth",
                quark,
                other.kind()
            ))),
        }
    }

    /// Sets `quark` and all of its descendants to null at `t`.
    pub fn remove_attribute(&self, t: Timestamp, quark: Quark) -> Result<()> {
        self.check_disposed()?;
        for child in self.sub_attributes(quark, false)? {
            self.remove_attribute(t, child)?;
        }
        self.transient
            .process_state_change(t, StateValue::Null, quark)
    }

    /// Replaces the ongoing value of `quark` without changing its start
    /// time or committing an interval.
    pub fn update_ongoing_state(&self, value: StateValue, quark: Quark) -> Result<()> {
        self.check_disposed()?;
        self.transient.change_ongoing_value(quark, value)
    }

    /// Replaces the whole ongoing state, one interval per attribute in
    /// quark order. Only start times and values are used.
    ///
    /// # Errors
    ///
    /// Returns `StateError::AttributeNotFound` if the number of intervals
    /// differs from the attribute count.
    pub fn replace_ongoing_state(&self, intervals: Vec<StateInterval>) -> Result<()> {
        self.check_disposed()?;
        let count = self.attribute_count();
        if intervals.len() != count {
            return Err(StateError::AttributeNotFound(format!(
                "ongoing state has {} intervals for {} attributes",
                intervals.len(),
                count
            )));
        }
        self.transient.replace_ongoing_state(intervals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use std::sync::Arc;

    fn create_test_system() -> StateSystem {
        StateSystem::new(Arc::new(InMemoryBackend::new("test", 0)))
    }

    #[test]
    fn test_increment() {
        let ss = create_test_system();
        let q = ss.quark_absolute_and_add(&["count"]).unwrap();
        ss.increment_attribute(10, q).unwrap();
        ss.increment_attribute(20, q).unwrap();
        assert_eq!(ss.query_ongoing_state(q).unwrap(), StateValue::Int(2));

        let s = ss.quark_absolute_and_add(&["name"]).unwrap();
        ss.modify_attribute(5, StateValue::from("x"), s).unwrap();
        assert!(matches!(
            ss.increment_attribute(10, s),
            Err(StateError::StateValueType(_))
        ));
    }

    #[test]
    fn test_push_creates_numbered_children() {
        let ss = create_test_system();
        let stack = ss.quark_absolute_and_add(&["stack"]).unwrap();
        ss.push_attribute(10, StateValue::from("a"), stack).unwrap();
        ss.push_attribute(20, StateValue::from("b"), stack).unwrap();

        assert_eq!(ss.query_ongoing_state(stack).unwrap(), StateValue::Int(2));
        let second = ss.quark_relative(stack, &["2"]).unwrap();
        assert_eq!(ss.query_ongoing_state(second).unwrap(), StateValue::from("b"));
    }

    #[test]
    fn test_pop_empty_stack_is_lenient() {
        let ss = create_test_system();
        let stack = ss.quark_absolute_and_add(&["stack"]).unwrap();
        assert_eq!(ss.pop_attribute(10, stack).unwrap(), None);
    }

    #[test]
    fn test_pop_restores_null_depth() {
        let ss = create_test_system();
        let stack = ss.quark_absolute_and_add(&["stack"]).unwrap();
        ss.push_attribute(10, StateValue::Int(7), stack).unwrap();
        assert_eq!(ss.pop_attribute(20, stack).unwrap(), Some(StateValue::Int(7)));

        assert_eq!(ss.query_ongoing_state(stack).unwrap(), StateValue::Null);
        let child = ss.quark_relative(stack, &["1"]).unwrap();
        assert_eq!(ss.query_ongoing_state(child).unwrap(), StateValue::Null);
    }

    #[test]
    fn test_push_on_non_stack() {
        let ss = create_test_system();
        let q = ss.quark_absolute_and_add(&["str"]).unwrap();
        ss.modify_attribute(1, StateValue::from("x"), q).unwrap();
        assert!(matches!(
            ss.push_attribute(2, StateValue::Int(1), q),
            Err(StateError::StateValueType(_))
        ));
        assert!(matches!(
            ss.pop_attribute(2, q),
            Err(StateError::StateValueType(_))
        ));
    }

    #[test]
    fn test_stack_limit() {
        let ss = create_test_system();
        let stack = ss.quark_absolute_and_add(&["stack"]).unwrap();
        ss.update_ongoing_state(StateValue::Int(MAX_STACK_DEPTH), stack)
            .unwrap();
        assert!(matches!(
            ss.push_attribute(10, StateValue::Int(1), stack),
            Err(StateError::AttributeNotFound(_))
        ));
        assert_eq!(ss.attribute_count(), 1);
    }

    #[test]
    fn test_pop_with_corrupt_depth() {
        let ss = create_test_system();
        let stack = ss.quark_absolute_and_add(&["stack"]).unwrap();
        ss.update_ongoing_state(StateValue::Int(0), stack).unwrap();
        assert!(matches!(
            ss.pop_attribute(10, stack),
            Err(StateError::StateValueType(_))
        ));
    }

    #[test]
    fn test_remove_attribute_nullifies_subtree() {
        let ss = create_test_system();
        let parent = ss.quark_absolute_and_add(&["p"]).unwrap();
        let child = ss.quark_absolute_and_add(&["p", "c"]).unwrap();
        let grandchild = ss.quark_absolute_and_add(&["p", "c", "g"]).unwrap();
        for q in [parent, child, grandchild] {
            ss.modify_attribute(10, StateValue::Int(q), q).unwrap();
        }

        ss.remove_attribute(50, parent).unwrap();
        for q in [parent, child, grandchild] {
            assert_eq!(ss.query_ongoing_state(q).unwrap(), StateValue::Null);
            assert_eq!(ss.ongoing_start_time(q).unwrap(), 50);
        }
    }

    #[test]
    fn test_replace_ongoing_state_size_checked() {
        let ss = create_test_system();
        ss.quark_absolute_and_add(&["a"]).unwrap();
        ss.quark_absolute_and_add(&["b"]).unwrap();

        assert!(ss
            .replace_ongoing_state(vec![StateInterval::null(0, 0, 0)])
            .is_err());
        ss.replace_ongoing_state(vec![
            StateInterval::new(30, 40, 0, StateValue::Int(1)),
            StateInterval::new(35, 40, 1, StateValue::Int(2)),
        ])
        .unwrap();
        assert_eq!(ss.ongoing_start_time(1).unwrap(), 35);
        assert_eq!(ss.query_ongoing_state(0).unwrap(), StateValue::Int(1));
    }

    #[test]
    fn test_writes_after_close() {
        let ss = create_test_system();
        let q = ss.quark_absolute_and_add(&["a"]).unwrap();
        ss.close_history(10).unwrap();
        assert!(matches!(
            ss.modify_attribute(20, StateValue::Int(1), q),
            Err(StateError::BuildFinished)
        ));
        assert!(matches!(
            ss.update_ongoing_state(StateValue::Int(1), q),
            Err(StateError::BuildFinished)
        ));
    }
}
