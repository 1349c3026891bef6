//! Alopex StateSys - state history storage engine
//!
//! This crate records how the values of named attributes evolve over time
//! and answers point and range queries about them.
//!
//! # Components
//!
//! - [`AttributeTree`]: hierarchical attribute paths mapped to quarks
//! - [`TransientState`]: ongoing value of every attribute during a build
//! - [`HistoryBackend`]: committed interval storage ([`InMemoryBackend`],
//!   [`NullBackend`], [`FileBackend`])
//! - [`StateSystem`]: the write and query facade over all of the above
//! - [`HistoryBuilder`]: drives a [`StateProvider`] over an event stream
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use alopex_statesys::{InMemoryBackend, StateSystem, StateValue};
//!
//! let backend = Arc::new(InMemoryBackend::new("example", 0));
//! let ss = StateSystem::new(backend);
//!
//! let cpu = ss.quark_absolute_and_add(&["CPUs", "0", "Current_thread"]).unwrap();
//! ss.modify_attribute(10, StateValue::Int(1000), cpu).unwrap();
//! ss.modify_attribute(20, StateValue::Int(1001), cpu).unwrap();
//! ss.close_history(30).unwrap();
//!
//! let interval = ss.query_single_state(15, cpu).unwrap();
//! assert_eq!(interval.value, StateValue::Int(1000));
//! assert_eq!((interval.start, interval.end), (10, 19));
//! ```

#![deny(missing_docs)]

pub mod attribute;
pub mod backend;
pub mod builder;
pub mod error;
pub mod interval;
pub mod system;
pub mod transient;
pub mod value;

/// Dense integer handle of an attribute.
pub type Quark = i32;

/// Timestamp in trace time units.
pub type Timestamp = i64;

/// Quark standing for the tree root in path-resolution calls.
pub const ROOT_QUARK: Quark = -1;

pub use attribute::AttributeTree;
pub use backend::{
    FileBackend, FileBackendConfig, HistoryBackend, InMemoryBackend, NullBackend, SyncMode,
};
pub use builder::{BuilderConfig, HistoryBuilder, StateProvider, TimedEvent};
pub use error::{Result, StateError};
pub use interval::{StateInterval, UNKNOWN_END};
pub use system::{StateSystem, MAX_STACK_DEPTH};
pub use transient::TransientState;
pub use value::{StateValue, ValueKind};
