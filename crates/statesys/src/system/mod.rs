//! The state system: attribute namespace, ongoing state and committed
//! history behind one facade.
//!
//! A state system goes through two phases. While **building**, a single
//! writer (usually a [`crate::HistoryBuilder`]) creates attributes and
//! applies state changes; concurrent readers may query at any time. Once
//! [`StateSystem::close_history`] runs, the history is **closed**: every
//! ongoing value is committed, the attribute tree is persisted when the
//! backend supports it, and waiters are released.
//!
//! Write operations live in `build.rs`, queries in `query.rs`.

mod build;
mod query;

use crate::attribute::AttributeTree;
use crate::backend::HistoryBackend;
use crate::error::{Result, StateError};
use crate::transient::TransientState;
use crate::{Quark, Timestamp, ROOT_QUARK};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, RwLockReadGuard};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub use build::MAX_STACK_DEPTH;

/// Path segment matching every child in [`StateSystem::quarks`].
pub const WILDCARD: &str = "*";

#[derive(Debug, Default, Clone, Copy)]
struct BuildStatus {
    finished: bool,
    cancelled: bool,
}

/// A state history under construction or ready for querying.
pub struct StateSystem {
    backend: Arc<dyn HistoryBackend>,
    tree: RwLock<AttributeTree>,
    transient: TransientState,
    status: Mutex<BuildStatus>,
    built: Condvar,
    disposed: AtomicBool,
}

impl std::fmt::Debug for StateSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateSystem")
            .field("ssid", &self.ssid())
            .field("attributes", &self.attribute_count())
            .field("transient", &self.transient)
            .field("disposed", &self.disposed.load(Ordering::Acquire))
            .finish()
    }
}

impl StateSystem {
    /// Creates a state system building a new history into `backend`.
    pub fn new(backend: Arc<dyn HistoryBackend>) -> Self {
        Self {
            transient: TransientState::new(backend.clone()),
            backend,
            tree: RwLock::new(AttributeTree::new()),
            status: Mutex::new(BuildStatus::default()),
            built: Condvar::new(),
            disposed: AtomicBool::new(false),
        }
    }

    /// Opens an already built history whose backend supplies a persisted
    /// attribute tree. The returned system is closed and query-only.
    ///
    /// # Errors
    ///
    /// Returns `StateError::Corrupted` if the backend holds no attribute
    /// tree, or any error from decoding it.
    pub fn open_existing(backend: Arc<dyn HistoryBackend>) -> Result<Self> {
        let bytes = backend.load_attribute_tree()?.ok_or_else(|| {
            StateError::Corrupted(format!("history {} has no attribute tree", backend.id()))
        })?;
        let tree = AttributeTree::from_bytes(&bytes)?;

        let system = Self::new(backend);
        system.transient.close(system.backend.end_time())?;
        *system.tree.write().unwrap_or_else(|err| err.into_inner()) = tree;
        system.release(false);

        debug!(
            "Opened state system {} ({} attributes)",
            system.ssid(),
            system.attribute_count()
        );
        Ok(system)
    }

    /// Identifier of this state system (the backend id).
    pub fn ssid(&self) -> &str {
        self.backend.id()
    }

    /// The backend storing committed intervals.
    pub fn backend(&self) -> &Arc<dyn HistoryBackend> {
        &self.backend
    }

    /// Start time of the history.
    pub fn start_time(&self) -> Timestamp {
        self.backend.start_time()
    }

    /// Latest time covered by the history so far. While building, this
    /// includes the latest state change; once closed, it is the end time
    /// of the committed history.
    pub fn current_end_time(&self) -> Timestamp {
        let committed = self.backend.end_time();
        if self.is_closed() {
            committed
        } else {
            committed.max(self.transient.latest_time())
        }
    }

    /// Returns true once [`StateSystem::close_history`] completed or the
    /// system was opened from an existing history.
    pub fn is_closed(&self) -> bool {
        self.lock_status().finished
    }

    fn lock_status(&self) -> std::sync::MutexGuard<'_, BuildStatus> {
        self.status.lock().unwrap_or_else(|err| err.into_inner())
    }

    fn read_tree(&self) -> RwLockReadGuard<'_, AttributeTree> {
        self.tree.read().unwrap_or_else(|err| err.into_inner())
    }

    fn check_disposed(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(StateError::Disposed);
        }
        Ok(())
    }

    /// Marks the build finished and wakes every waiter.
    fn release(&self, cancelled: bool) {
        let mut status = self.lock_status();
        status.finished = true;
        status.cancelled |= cancelled;
        self.built.notify_all();
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Closes the history at `end` (raised to the backend end time if
    /// lower). Every ongoing value is committed, the backend is finished,
    /// the attribute tree is persisted if the backend accepts it, and
    /// waiters are released.
    ///
    /// # Errors
    ///
    /// Returns `StateError::BuildFinished` if the history is already
    /// closed, or the first backend error encountered.
    pub fn close_history(&self, end: Timestamp) -> Result<()> {
        self.check_disposed()?;
        let result = self.close_inner(end);
        self.release(false);
        result
    }

    fn close_inner(&self, end: Timestamp) -> Result<()> {
        let end = end.max(self.backend.end_time());
        self.transient.close(end)?;
        self.backend.finish_building(end)?;

        let bytes = match self.read_tree().to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(
                    "Attribute tree of {} cannot be persisted: {}",
                    self.ssid(),
                    e
                );
                return Ok(());
            }
        };
        if self.backend.store_attribute_tree(&bytes)? {
            debug!("Persisted attribute tree of {}", self.ssid());
        }
        debug!("Closed history {} at {}", self.ssid(), end);
        Ok(())
    }

    /// Blocks until the history is closed. Returns true if the build
    /// completed without being cancelled.
    pub fn wait_until_built(&self) -> bool {
        let mut status = self.lock_status();
        while !status.finished {
            status = self
                .built
                .wait(status)
                .unwrap_or_else(|err| err.into_inner());
        }
        !status.cancelled
    }

    /// Blocks until the history is closed or `timeout` elapses. Returns
    /// true if the history was closed in time.
    pub fn wait_until_built_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut status = self.lock_status();
        while !status.finished {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .built
                .wait_timeout(status, deadline - now)
                .unwrap_or_else(|err| err.into_inner());
            status = guard;
        }
        true
    }

    /// Returns true if the build was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.lock_status().cancelled
    }

    /// Flags the build as cancelled. Closing remains the caller's job.
    pub fn mark_cancelled(&self) {
        self.lock_status().cancelled = true;
    }

    /// Disposes the state system. Later reads and writes fail with
    /// `StateError::Disposed`. An unfinished build is cancelled and its
    /// waiters are released.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.transient.is_active() {
            self.transient.deactivate();
            self.release(true);
            debug!("Disposed state system {} before it was built", self.ssid());
        }
        self.backend.dispose();
    }

    /// Deletes the files backing the history, if any.
    pub fn remove_files(&self) -> Result<()> {
        self.backend.remove_files()
    }

    // ------------------------------------------------------------------
    // Attribute tree
    // ------------------------------------------------------------------

    /// Number of attributes.
    pub fn attribute_count(&self) -> usize {
        self.read_tree().len()
    }

    fn check_quark(&self, quark: Quark) -> Result<()> {
        let count = self.attribute_count();
        if quark < 0 || quark as usize >= count {
            return Err(StateError::AttributeNotFound(format!(
                "invalid quark {} ({} attributes)",
                quark, count
            )));
        }
        Ok(())
    }

    /// Name (last path segment) of `quark`.
    pub fn attribute_name(&self, quark: Quark) -> Result<String> {
        Ok(self.read_tree().name(quark)?.to_string())
    }

    /// Full path of `quark`, segments joined with `/`.
    pub fn full_attribute_path(&self, quark: Quark) -> Result<String> {
        self.read_tree().full_path(quark)
    }

    /// Path segments of `quark` from the root.
    pub fn full_attribute_path_segments(&self, quark: Quark) -> Result<Vec<String>> {
        self.read_tree().full_path_segments(quark)
    }

    /// Resolves an absolute path.
    ///
    /// # Errors
    ///
    /// Returns `StateError::AttributeNotFound` if the path does not exist.
    pub fn quark_absolute<S: AsRef<str>>(&self, path: &[S]) -> Result<Quark> {
        self.read_tree().resolve(ROOT_QUARK, path)
    }

    /// Resolves a path relative to `start`.
    pub fn quark_relative<S: AsRef<str>>(&self, start: Quark, path: &[S]) -> Result<Quark> {
        self.read_tree().resolve(start, path)
    }

    /// Resolves an absolute path, returning `None` if it does not exist.
    pub fn opt_quark_absolute<S: AsRef<str>>(&self, path: &[S]) -> Option<Quark> {
        self.quark_absolute(path).ok()
    }

    /// Resolves a relative path, returning `None` if it does not exist.
    pub fn opt_quark_relative<S: AsRef<str>>(&self, start: Quark, path: &[S]) -> Option<Quark> {
        self.quark_relative(start, path).ok()
    }

    /// Resolves an absolute path, creating missing attributes.
    pub fn quark_absolute_and_add<S: AsRef<str>>(&self, path: &[S]) -> Result<Quark> {
        self.quark_relative_and_add(ROOT_QUARK, path)
    }

    /// Resolves a path relative to `start`, creating missing attributes.
    ///
    /// Every new attribute gets a null ongoing state from the history start
    /// before it becomes visible to readers.
    pub fn quark_relative_and_add<S: AsRef<str>>(&self, start: Quark, path: &[S]) -> Result<Quark> {
        let mut tree = self.tree.write().unwrap_or_else(|err| err.into_inner());
        tree.resolve_or_create(start, path, |_| self.transient.add_empty_entry())
    }

    /// Children of `quark` (root if -1), depth-first when `recursive`.
    pub fn sub_attributes(&self, quark: Quark, recursive: bool) -> Result<Vec<Quark>> {
        self.read_tree().children(quark, recursive)
    }

    /// Children of `quark` whose name satisfies `matches`.
    pub fn sub_attributes_matching<F>(&self, quark: Quark, recursive: bool, matches: F) -> Result<Vec<Quark>>
    where
        F: Fn(&str) -> bool,
    {
        let tree = self.read_tree();
        let mut result = Vec::new();
        for child in tree.children(quark, recursive)? {
            if matches(tree.name(child)?) {
                result.push(child);
            }
        }
        Ok(result)
    }

    /// Parent of `quark` (-1 for top-level attributes and the root).
    pub fn parent_attribute_quark(&self, quark: Quark) -> Result<Quark> {
        self.read_tree().parent(quark)
    }

    /// Resolves a path that may contain one [`WILDCARD`] segment.
    ///
    /// Without a wildcard, returns the single matching quark (or nothing).
    /// With one, every direct child at that position is tried and the ones
    /// where the rest of the path resolves are returned. More than one
    /// wildcard matches nothing.
    pub fn quarks<S: AsRef<str>>(&self, pattern: &[S]) -> Vec<Quark> {
        self.quarks_relative(ROOT_QUARK, pattern)
    }

    /// Same as [`StateSystem::quarks`], starting from `start` instead of
    /// the root. An empty pattern matches `start` itself.
    pub fn quarks_relative<S: AsRef<str>>(&self, start: Quark, pattern: &[S]) -> Vec<Quark> {
        let segments: Vec<&str> = pattern.iter().map(AsRef::as_ref).collect();
        let wildcards: Vec<usize> = segments
            .iter()
            .enumerate()
            .filter(|(_, s)| **s == WILDCARD)
            .map(|(i, _)| i)
            .collect();

        let tree = self.read_tree();
        match wildcards.as_slice() {
            [] => tree.resolve(start, &segments).into_iter().collect(),
            [at] => {
                let (prefix, rest) = segments.split_at(*at);
                let suffix = &rest[1..];
                let Ok(parent) = tree.resolve(start, prefix) else {
                    return Vec::new();
                };
                tree.children(parent, false)
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|child| tree.resolve(child, suffix).ok())
                    .collect()
            }
            _ => {
                debug!("Pattern {:?} has more than one wildcard", segments);
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{InMemoryBackend, NullBackend};
    use crate::value::StateValue;
    use std::thread;

    fn create_test_system() -> StateSystem {
        StateSystem::new(Arc::new(InMemoryBackend::new("test", 0)))
    }

    #[test]
    fn test_quark_creation_grows_transient_state() {
        let ss = create_test_system();
        let q = ss.quark_absolute_and_add(&["a", "b", "c"]).unwrap();
        assert_eq!(q, 2);
        assert_eq!(ss.attribute_count(), 3);
        assert_eq!(ss.transient.len(), 3);
        assert_eq!(ss.quark_absolute(&["a", "b"]).unwrap(), 1);
        assert_eq!(ss.quark_relative(0, &["b", "c"]).unwrap(), 2);
        assert_eq!(ss.quark_relative_and_add(1, &["d"]).unwrap(), 3);
        assert_eq!(ss.full_attribute_path(3).unwrap(), "a/b/d");
        assert_eq!(ss.attribute_name(3).unwrap(), "d");
        assert_eq!(ss.parent_attribute_quark(3).unwrap(), 1);
    }

    #[test]
    fn test_opt_quark() {
        let ss = create_test_system();
        ss.quark_absolute_and_add(&["x"]).unwrap();
        assert_eq!(ss.opt_quark_absolute(&["x"]), Some(0));
        assert_eq!(ss.opt_quark_absolute(&["y"]), None);
        assert_eq!(ss.opt_quark_relative(0, &["z"]), None);
        assert!(matches!(
            ss.quark_absolute(&["y"]),
            Err(StateError::AttributeNotFound(_))
        ));
    }

    #[test]
    fn test_sub_attributes_matching() {
        let ss = create_test_system();
        for path in [["Threads", "100"], ["Threads", "200"], ["Threads", "idle"]] {
            ss.quark_absolute_and_add(&path).unwrap();
        }
        let threads = ss.quark_absolute(&["Threads"]).unwrap();
        let numeric = ss
            .sub_attributes_matching(threads, false, |name| name.chars().all(|c| c.is_ascii_digit()))
            .unwrap();
        assert_eq!(numeric, vec![1, 2]);
        assert_eq!(ss.sub_attributes(ROOT_QUARK, true).unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_quarks_pattern() {
        let ss = create_test_system();
        ss.quark_absolute_and_add(&["CPUs", "0", "freq"]).unwrap();
        ss.quark_absolute_and_add(&["CPUs", "1", "freq"]).unwrap();
        ss.quark_absolute_and_add(&["CPUs", "2", "status"]).unwrap();

        let freq0 = ss.quark_absolute(&["CPUs", "0", "freq"]).unwrap();
        let freq1 = ss.quark_absolute(&["CPUs", "1", "freq"]).unwrap();

        assert_eq!(ss.quarks(&["CPUs", "*", "freq"]), vec![freq0, freq1]);
        assert_eq!(ss.quarks(&["CPUs", "0", "freq"]), vec![freq0]);
        assert!(ss.quarks(&["CPUs", "9", "freq"]).is_empty());
        assert_eq!(ss.quarks(&["*"]), vec![0]);
        assert!(ss.quarks(&["*", "*", "freq"]).is_empty());
        assert!(ss.quarks(&["GPUs", "*"]).is_empty());
    }

    #[test]
    fn test_quarks_relative_pattern() {
        let ss = create_test_system();
        let cpus = ss.quark_absolute_and_add(&["CPUs"]).unwrap();
        let freq0 = ss.quark_relative_and_add(cpus, &["0", "freq"]).unwrap();
        ss.quark_relative_and_add(cpus, &["0", "load"]).unwrap();
        let freq1 = ss.quark_relative_and_add(cpus, &["1", "freq"]).unwrap();

        assert_eq!(ss.quarks_relative(cpus, &["*", "freq"]), vec![freq0, freq1]);
        assert_eq!(ss.quarks_relative(cpus, &["1", "freq"]), vec![freq1]);
        assert_eq!(ss.quarks_relative::<&str>(cpus, &[]), vec![cpus]);
        assert!(ss.quarks_relative(freq0, &["*"]).is_empty());
        assert!(ss.quarks_relative(42, &["*"]).is_empty());
    }

    #[test]
    fn test_wait_until_built_released_by_close() {
        let ss = Arc::new(create_test_system());
        assert!(!ss.wait_until_built_timeout(Duration::from_millis(10)));

        let waiter = {
            let ss = ss.clone();
            thread::spawn(move || ss.wait_until_built())
        };
        ss.close_history(100).unwrap();
        assert!(waiter.join().unwrap());
        assert!(ss.is_closed());
        assert!(ss.wait_until_built_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn test_close_twice() {
        let ss = create_test_system();
        ss.close_history(10).unwrap();
        assert!(matches!(ss.close_history(20), Err(StateError::BuildFinished)));
    }

    #[test]
    fn test_close_end_raised_to_backend_end() {
        let ss = create_test_system();
        let q = ss.quark_absolute_and_add(&["a"]).unwrap();
        ss.modify_attribute(500, StateValue::Int(1), q).unwrap();
        assert_eq!(ss.current_end_time(), 500);
        ss.close_history(100).unwrap();
        // Null interval [0, 499] pushed the backend end to 499
        assert_eq!(ss.current_end_time(), 499);
    }

    #[test]
    fn test_dispose_cancels_unfinished_build() {
        let ss = create_test_system();
        let q = ss.quark_absolute_and_add(&["a"]).unwrap();
        ss.dispose();

        assert!(ss.is_cancelled());
        assert!(!ss.wait_until_built());
        assert!(matches!(
            ss.modify_attribute(10, StateValue::Int(1), q),
            Err(StateError::Disposed)
        ));
        assert!(matches!(ss.query_single_state(0, q), Err(StateError::Disposed)));
        assert!(matches!(ss.close_history(10), Err(StateError::Disposed)));
    }

    #[test]
    fn test_mark_cancelled() {
        let ss = create_test_system();
        ss.mark_cancelled();
        ss.close_history(0).unwrap();
        assert!(ss.is_cancelled());
        assert!(!ss.wait_until_built());
    }

    #[test]
    fn test_open_existing_requires_tree() {
        let backend = Arc::new(NullBackend::new("null", 0));
        assert!(matches!(
            StateSystem::open_existing(backend),
            Err(StateError::Corrupted(_))
        ));
    }
}
