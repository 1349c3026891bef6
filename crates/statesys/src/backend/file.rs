//! Single-file history backend.
//!
//! Intervals are appended to the file as they are committed, each framed
//! with its length and a CRC32 checksum. An in-memory index answers the
//! queries. Once the build finishes, the attribute tree and a footer are
//! written after the interval section.
//!
//! ## File Structure
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  File Header (16 bytes)                                      │
//! │  - Magic: "SKSH" (4 bytes)                                   │
//! │  - Version: u16 (2 bytes) = 1                                │
//! │  - Reserved: 2 bytes                                         │
//! │  - Start Timestamp: i64 (8 bytes)                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Interval Records (repeated)                                 │
//! │  - Length: u32, CRC32: u32, payload                          │
//! │  End marker: u32 = 0                                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Attribute Tree Section (may be empty)                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Footer (40 bytes)                                           │
//! │  - Tree offset, tree length, end time, interval count        │
//! │  - Tree CRC32, reverse magic "HSKS", reserved                │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! All integers are little-endian. A reopened file is read-only.

use super::memory::InMemoryBackend;
use super::HistoryBackend;
use crate::error::{Result, StateError};
use crate::interval::StateInterval;
use crate::{Quark, Timestamp};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Magic bytes for the history file header: "SKSH"
pub const HISTORY_MAGIC: [u8; 4] = *b"SKSH";

/// Reverse magic bytes for the history file footer: "HSKS"
pub const HISTORY_MAGIC_REVERSE: [u8; 4] = *b"HSKS";

/// Current history file format version.
pub const HISTORY_VERSION: u16 = 1;

/// Header size in bytes.
pub const HEADER_SIZE: usize = 16;

/// Footer size in bytes.
pub const FOOTER_SIZE: usize = 40;

/// Default write buffer capacity (64 KB).
pub const DEFAULT_BUFFER_CAPACITY: usize = 64 * 1024;

/// Upper bound on a single interval record, guarding against garbage lengths.
const MAX_RECORD_SIZE: usize = 64 * 1024 * 1024;

/// Sync mode for history file durability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Fsync when the history is finished (default, highest durability).
    #[default]
    Fsync,
    /// Use fdatasync (skip metadata update, faster).
    Fdatasync,
    /// No sync (fastest, lowest durability - for testing only).
    None,
}

/// Configuration for the file backend.
#[derive(Debug, Clone)]
pub struct FileBackendConfig {
    /// Sync mode applied when the interval section and the footer are done.
    pub sync_mode: SyncMode,
    /// Capacity of the write buffer in front of the history file.
    pub buffer_capacity: usize,
}

impl Default for FileBackendConfig {
    fn default() -> Self {
        Self {
            sync_mode: SyncMode::default(),
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
        }
    }
}

impl FileBackendConfig {
    /// Sets the sync mode.
    pub fn with_sync_mode(mut self, sync_mode: SyncMode) -> Self {
        self.sync_mode = sync_mode;
        self
    }

    /// Sets the write buffer capacity.
    pub fn with_buffer_capacity(mut self, buffer_capacity: usize) -> Self {
        self.buffer_capacity = buffer_capacity;
        self
    }
}

fn le_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn le_u32(buf: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(bytes)
}

fn le_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}

/// History file header (16 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryHeader {
    /// Format version.
    pub version: u16,
    /// Start time of the history.
    pub start_time: Timestamp,
}

impl HistoryHeader {
    /// Creates a header for the current format version.
    pub fn new(start_time: Timestamp) -> Self {
        Self {
            version: HISTORY_VERSION,
            start_time,
        }
    }

    /// Writes the header to a writer.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&HISTORY_MAGIC)?;
        writer.write_all(&self.version.to_le_bytes())?;
        writer.write_all(&[0u8; 2])?;
        writer.write_all(&self.start_time.to_le_bytes())?;
        Ok(())
    }

    /// Reads a header from a reader.
    ///
    /// # Errors
    ///
    /// Returns `StateError::InvalidMagic` if the magic bytes don't match.
    /// Returns `StateError::UnsupportedVersion` if the version is newer than
    /// this library.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf = [0u8; HEADER_SIZE];
        reader.read_exact(&mut buf)?;

        if buf[0..4] != HISTORY_MAGIC {
            return Err(StateError::InvalidMagic(u32::from_be_bytes([
                buf[0], buf[1], buf[2], buf[3],
            ])));
        }
        let version = le_u16(&buf, 4);
        if version == 0 || version > HISTORY_VERSION {
            return Err(StateError::UnsupportedVersion(version));
        }
        // Reserved (2 bytes) - ignored
        let start_time = le_u64(&buf, 8) as i64;

        Ok(Self {
            version,
            start_time,
        })
    }
}

/// History file footer (40 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryFooter {
    /// Offset of the attribute tree section from file start.
    pub tree_offset: u64,
    /// Size of the attribute tree section (0 if not stored).
    pub tree_len: u32,
    /// End time of the history.
    pub end_time: Timestamp,
    /// Number of interval records.
    pub interval_count: u64,
    /// CRC32 of the attribute tree section.
    pub tree_crc32: u32,
}

impl HistoryFooter {
    /// Writes the footer to a writer.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.tree_offset.to_le_bytes())?;
        writer.write_all(&self.tree_len.to_le_bytes())?;
        writer.write_all(&self.end_time.to_le_bytes())?;
        writer.write_all(&self.interval_count.to_le_bytes())?;
        writer.write_all(&self.tree_crc32.to_le_bytes())?;
        writer.write_all(&HISTORY_MAGIC_REVERSE)?;
        writer.write_all(&[0u8; 4])?;
        Ok(())
    }

    /// Reads a footer from a reader.
    ///
    /// # Errors
    ///
    /// Returns `StateError::InvalidMagic` if the reverse magic bytes don't
    /// match.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf = [0u8; FOOTER_SIZE];
        reader.read_exact(&mut buf)?;

        if buf[32..36] != HISTORY_MAGIC_REVERSE {
            return Err(StateError::InvalidMagic(u32::from_be_bytes([
                buf[32], buf[33], buf[34], buf[35],
            ])));
        }

        Ok(Self {
            tree_offset: le_u64(&buf, 0),
            tree_len: le_u32(&buf, 8),
            end_time: le_u64(&buf, 12) as i64,
            interval_count: le_u64(&buf, 20),
            tree_crc32: le_u32(&buf, 28),
        })
    }
}

#[derive(Debug)]
struct FileState {
    /// `None` once finished writing, or for a reopened file.
    writer: Option<BufWriter<File>>,
    /// Offset of the next record (or of the tree section once finished).
    offset: u64,
    interval_count: u64,
    finished: bool,
    tree: Option<Vec<u8>>,
}

/// Backend persisting the history to a single file.
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    config: FileBackendConfig,
    index: InMemoryBackend,
    state: Mutex<FileState>,
}

impl FileBackend {
    /// Creates a new history file at `path`, truncating any existing file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or the header cannot
    /// be written.
    pub fn create(
        id: impl Into<String>,
        path: impl AsRef<Path>,
        start_time: Timestamp,
        config: FileBackendConfig,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        let mut writer = BufWriter::with_capacity(config.buffer_capacity, file);
        HistoryHeader::new(start_time).write_to(&mut writer)?;

        debug!("Created history file: {}", path.display());

        Ok(Self {
            path,
            config,
            index: InMemoryBackend::new(id, start_time),
            state: Mutex::new(FileState {
                writer: Some(writer),
                offset: HEADER_SIZE as u64,
                interval_count: 0,
                finished: false,
                tree: None,
            }),
        })
    }

    /// Opens a finished history file for querying.
    ///
    /// Every record checksum is verified and the query index is rebuilt.
    ///
    /// # Errors
    ///
    /// Returns `StateError::InvalidMagic`, `StateError::UnsupportedVersion`,
    /// `StateError::ChecksumMismatch` or `StateError::Corrupted` if the file
    /// is not an intact history file.
    pub fn open(id: impl Into<String>, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let file_len = file.metadata()?.len();
        if file_len < (HEADER_SIZE + 4 + FOOTER_SIZE) as u64 {
            return Err(StateError::Corrupted(format!(
                "history file too small: {} bytes",
                file_len
            )));
        }
        let mut reader = BufReader::new(file);

        let header = HistoryHeader::read_from(&mut reader)?;
        reader.seek(SeekFrom::Start(file_len - FOOTER_SIZE as u64))?;
        let footer = HistoryFooter::read_from(&mut reader)?;
        let section_end = footer
            .tree_offset
            .checked_add(footer.tree_len as u64 + FOOTER_SIZE as u64);
        if footer.tree_offset < (HEADER_SIZE + 4) as u64 || section_end != Some(file_len) {
            return Err(StateError::Corrupted(format!(
                "footer tree section [{}, +{}) does not end at footer",
                footer.tree_offset, footer.tree_len
            )));
        }

        let index = InMemoryBackend::new(id, header.start_time);
        reader.seek(SeekFrom::Start(HEADER_SIZE as u64))?;
        let mut offset = HEADER_SIZE as u64;
        let mut count = 0u64;
        while let Some((interval, size)) =
            read_record(&mut reader, footer.tree_offset.saturating_sub(offset))?
        {
            index.insert_interval(interval)?;
            offset += size;
            count += 1;
        }
        offset += 4;
        if offset != footer.tree_offset {
            return Err(StateError::Corrupted(format!(
                "interval section ends at {} but tree starts at {}",
                offset, footer.tree_offset
            )));
        }
        if count != footer.interval_count {
            return Err(StateError::Corrupted(format!(
                "footer declares {} intervals, found {}",
                footer.interval_count, count
            )));
        }

        let tree = if footer.tree_len > 0 {
            let mut bytes = vec![0u8; footer.tree_len as usize];
            reader.read_exact(&mut bytes)?;
            let actual = crc32fast::hash(&bytes);
            if actual != footer.tree_crc32 {
                return Err(StateError::ChecksumMismatch {
                    expected: footer.tree_crc32,
                    actual,
                });
            }
            Some(bytes)
        } else {
            None
        };
        index.finish_building(footer.end_time)?;

        debug!(
            "Opened history file {} ({} intervals)",
            path.display(),
            count
        );

        Ok(Self {
            path,
            config: FileBackendConfig::default(),
            index,
            state: Mutex::new(FileState {
                writer: None,
                offset,
                interval_count: count,
                finished: true,
                tree,
            }),
        })
    }

    /// Returns the path of the history file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the number of intervals written or loaded.
    pub fn interval_count(&self) -> u64 {
        self.lock_state().interval_count
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, FileState> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }

    fn sync(&self, file: &File) -> Result<()> {
        match self.config.sync_mode {
            SyncMode::Fsync => file.sync_all()?,
            SyncMode::Fdatasync => file.sync_data()?,
            SyncMode::None => {
                // No sync - only for testing
            }
        }
        Ok(())
    }

    fn footer(&self, state: &FileState, tree_len: u32, tree_crc32: u32) -> HistoryFooter {
        HistoryFooter {
            tree_offset: state.offset,
            tree_len,
            end_time: self.index.end_time(),
            interval_count: state.interval_count,
            tree_crc32,
        }
    }
}

/// Reads one interval record. Returns `None` at the end marker.
///
/// `remaining` bounds the bytes available before the tree section.
fn read_record<R: Read>(reader: &mut R, remaining: u64) -> Result<Option<(StateInterval, u64)>> {
    let mut head = [0u8; 4];
    reader.read_exact(&mut head).map_err(truncated)?;
    let len = u32::from_le_bytes(head) as usize;
    if len == 0 {
        return Ok(None);
    }
    if len > MAX_RECORD_SIZE || (8 + len) as u64 > remaining {
        return Err(StateError::Corrupted(format!(
            "interval record length {} exceeds section",
            len
        )));
    }

    reader.read_exact(&mut head).map_err(truncated)?;
    let expected = u32::from_le_bytes(head);
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).map_err(truncated)?;

    let actual = crc32fast::hash(&payload);
    if actual != expected {
        return Err(StateError::ChecksumMismatch { expected, actual });
    }
    let interval = StateInterval::decode(&payload)?;
    Ok(Some((interval, 8 + len as u64)))
}

fn truncated(err: io::Error) -> StateError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        StateError::Corrupted("truncated interval section".to_string())
    } else {
        StateError::IoError(err)
    }
}

impl HistoryBackend for FileBackend {
    fn id(&self) -> &str {
        self.index.id()
    }

    fn start_time(&self) -> Timestamp {
        self.index.start_time()
    }

    fn end_time(&self) -> Timestamp {
        self.index.end_time()
    }

    fn insert_interval(&self, interval: StateInterval) -> Result<()> {
        let mut state = self.lock_state();
        if state.finished {
            return Err(StateError::BuildFinished);
        }

        let mut payload = Vec::with_capacity(32);
        interval.encode(&mut payload);
        let crc = crc32fast::hash(&payload);
        self.index.insert_interval(interval)?;

        let writer = state.writer.as_mut().ok_or(StateError::BuildFinished)?;
        // Write: length (4) + crc (4) + payload
        writer.write_all(&(payload.len() as u32).to_le_bytes())?;
        writer.write_all(&crc.to_le_bytes())?;
        writer.write_all(&payload)?;

        state.offset += 8 + payload.len() as u64;
        state.interval_count += 1;
        Ok(())
    }

    fn query_full_state(&self, t: Timestamp, out: &mut [Option<StateInterval>]) -> Result<()> {
        self.index.query_full_state(t, out)
    }

    fn query_single_state(&self, t: Timestamp, quark: Quark) -> Result<Option<StateInterval>> {
        self.index.query_single_state(t, quark)
    }

    fn finish_building(&self, end_time: Timestamp) -> Result<()> {
        let mut state = self.lock_state();
        if state.finished {
            return Ok(());
        }
        self.index.finish_building(end_time)?;

        let mut writer = state.writer.take().ok_or(StateError::BuildFinished)?;
        writer.write_all(&0u32.to_le_bytes())?;
        state.offset += 4;
        state.finished = true;

        self.footer(&state, 0, 0).write_to(&mut writer)?;
        writer.flush()?;
        let file = writer.into_inner().map_err(|err| err.into_error())?;
        self.sync(&file)?;

        debug!(
            "Finished history file {} ({} intervals, end time {})",
            self.path.display(),
            state.interval_count,
            self.index.end_time()
        );
        Ok(())
    }

    fn store_attribute_tree(&self, bytes: &[u8]) -> Result<bool> {
        let mut state = self.lock_state();
        if !state.finished {
            warn!(
                "Attribute tree stored before history {} was finished",
                self.path.display()
            );
            return Ok(false);
        }
        let tree_len = u32::try_from(bytes.len()).map_err(|_| {
            StateError::Corrupted(format!("attribute tree too large: {} bytes", bytes.len()))
        })?;

        let mut file = OpenOptions::new().write(true).open(&self.path)?;
        file.seek(SeekFrom::Start(state.offset))?;
        let mut writer = BufWriter::new(&mut file);
        writer.write_all(bytes)?;
        self.footer(&state, tree_len, crc32fast::hash(bytes))
            .write_to(&mut writer)?;
        writer.flush()?;
        drop(writer);
        file.set_len(state.offset + tree_len as u64 + FOOTER_SIZE as u64)?;
        self.sync(&file)?;

        state.tree = Some(bytes.to_vec());
        debug!(
            "Stored attribute tree ({} bytes) in {}",
            tree_len,
            self.path.display()
        );
        Ok(true)
    }

    fn load_attribute_tree(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.lock_state().tree.clone())
    }

    fn remove_files(&self) -> Result<()> {
        let mut state = self.lock_state();
        state.writer = None;
        state.finished = true;
        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!("Removed history file: {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn dispose(&self) {
        let mut state = self.lock_state();
        if let Some(mut writer) = state.writer.take() {
            if let Err(e) = writer.flush() {
                warn!("Failed to flush history file on dispose: {:?}", e);
            }
        }
    }
}

impl Drop for FileBackend {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|err| err.into_inner());
        if let Some(writer) = state.writer.as_mut() {
            // Best effort to flush buffered records of an unfinished history
            if let Err(e) = writer.flush() {
                warn!("Failed to flush history file on drop: {:?}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::StateValue;
    use tempfile::TempDir;

    fn test_config() -> FileBackendConfig {
        FileBackendConfig::default().with_sync_mode(SyncMode::None)
    }

    fn create_test_backend() -> (TempDir, FileBackend) {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("history.sksh");
        let backend = FileBackend::create("test", &path, 0, test_config()).unwrap();
        (temp_dir, backend)
    }

    fn fill(backend: &FileBackend) {
        for (start, end, quark, value) in [
            (0, 99, 0, StateValue::from("A")),
            (0, 49, 1, StateValue::Int(1)),
            (100, 199, 0, StateValue::from("B")),
            (50, 250, 1, StateValue::Double(0.5)),
            (200, 300, 0, StateValue::from("C")),
        ] {
            backend
                .insert_interval(StateInterval::new(start, end, quark, value))
                .unwrap();
        }
    }

    #[test]
    fn test_header_footer_layout() {
        let (_dir, backend) = create_test_backend();
        fill(&backend);
        backend.finish_building(300).unwrap();
        assert!(backend.store_attribute_tree(b"tree-bytes").unwrap());

        let bytes = fs::read(backend.path()).unwrap();
        assert_eq!(&bytes[0..4], b"SKSH");
        assert_eq!(le_u16(&bytes, 4), HISTORY_VERSION);

        let footer_start = bytes.len() - FOOTER_SIZE;
        let footer = HistoryFooter::read_from(&mut &bytes[footer_start..]).unwrap();
        assert_eq!(footer.interval_count, 5);
        assert_eq!(footer.end_time, 300);
        assert_eq!(footer.tree_len, 10);
        assert_eq!(&bytes[footer_start + 32..footer_start + 36], b"HSKS");
        let tree_start = footer.tree_offset as usize;
        assert_eq!(&bytes[tree_start..tree_start + 10], b"tree-bytes");
        // End marker right before the tree section
        assert_eq!(&bytes[tree_start - 4..tree_start], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_reopen_answers_queries() {
        let (_dir, backend) = create_test_backend();
        fill(&backend);
        backend.finish_building(300).unwrap();
        backend.store_attribute_tree(b"tree").unwrap();
        let path = backend.path().to_path_buf();
        drop(backend);

        let reopened = FileBackend::open("test", &path).unwrap();
        assert_eq!(reopened.start_time(), 0);
        assert_eq!(reopened.end_time(), 300);
        assert_eq!(reopened.interval_count(), 5);
        assert_eq!(reopened.load_attribute_tree().unwrap().unwrap(), b"tree");

        let hit = reopened.query_single_state(150, 0).unwrap().unwrap();
        assert_eq!(hit.value, StateValue::from("B"));
        let mut out = vec![None; 2];
        reopened.query_full_state(60, &mut out).unwrap();
        assert_eq!(out[1].as_ref().unwrap().value, StateValue::Double(0.5));
    }

    #[test]
    fn test_reopened_file_is_read_only() {
        let (_dir, backend) = create_test_backend();
        fill(&backend);
        backend.finish_building(300).unwrap();
        let path = backend.path().to_path_buf();
        drop(backend);

        let reopened = FileBackend::open("test", &path).unwrap();
        assert!(reopened.load_attribute_tree().unwrap().is_none());
        assert!(matches!(
            reopened.insert_interval(StateInterval::new(301, 400, 0, StateValue::Null)),
            Err(StateError::BuildFinished)
        ));
    }

    #[test]
    fn test_corrupted_record_detected() {
        let (_dir, backend) = create_test_backend();
        fill(&backend);
        backend.finish_building(300).unwrap();
        let path = backend.path().to_path_buf();
        drop(backend);

        let mut bytes = fs::read(&path).unwrap();
        // Flip a payload byte of the first record
        bytes[HEADER_SIZE + 8] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        assert!(matches!(
            FileBackend::open("test", &path),
            Err(StateError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_bad_magic_and_version() {
        let (_dir, backend) = create_test_backend();
        backend.finish_building(0).unwrap();
        let path = backend.path().to_path_buf();
        drop(backend);
        let original = fs::read(&path).unwrap();

        let mut bytes = original.clone();
        bytes[0] = b'X';
        fs::write(&path, &bytes).unwrap();
        assert!(matches!(
            FileBackend::open("test", &path),
            Err(StateError::InvalidMagic(_))
        ));

        let mut bytes = original.clone();
        bytes[4] = 9;
        fs::write(&path, &bytes).unwrap();
        assert!(matches!(
            FileBackend::open("test", &path),
            Err(StateError::UnsupportedVersion(9))
        ));

        let mut bytes = original;
        let len = bytes.len();
        bytes[len - 8] = b'X';
        fs::write(&path, &bytes).unwrap();
        assert!(matches!(
            FileBackend::open("test", &path),
            Err(StateError::InvalidMagic(_))
        ));
    }

    #[test]
    fn test_truncated_file() {
        let (_dir, backend) = create_test_backend();
        fill(&backend);
        backend.finish_building(300).unwrap();
        let path = backend.path().to_path_buf();
        drop(backend);

        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..20]).unwrap();
        assert!(matches!(
            FileBackend::open("test", &path),
            Err(StateError::Corrupted(_))
        ));
    }

    #[test]
    fn test_tree_checksum_verified() {
        let (_dir, backend) = create_test_backend();
        backend.finish_building(10).unwrap();
        backend.store_attribute_tree(b"abcdef").unwrap();
        let path = backend.path().to_path_buf();
        drop(backend);

        let mut bytes = fs::read(&path).unwrap();
        let tree_start = bytes.len() - FOOTER_SIZE - 6;
        bytes[tree_start] = b'z';
        fs::write(&path, &bytes).unwrap();

        assert!(matches!(
            FileBackend::open("test", &path),
            Err(StateError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_remove_files() {
        let (_dir, backend) = create_test_backend();
        fill(&backend);
        let path = backend.path().to_path_buf();
        assert!(path.exists());

        backend.remove_files().unwrap();
        assert!(!path.exists());
        // Idempotent
        backend.remove_files().unwrap();
        assert!(matches!(
            backend.insert_interval(StateInterval::new(400, 500, 0, StateValue::Null)),
            Err(StateError::BuildFinished)
        ));
    }

    #[test]
    fn test_config_builder() {
        let config = FileBackendConfig::default();
        assert_eq!(config.sync_mode, SyncMode::Fsync);
        assert_eq!(config.buffer_capacity, DEFAULT_BUFFER_CAPACITY);

        let config = config
            .with_sync_mode(SyncMode::Fdatasync)
            .with_buffer_capacity(512);
        assert_eq!(config.sync_mode, SyncMode::Fdatasync);
        assert_eq!(config.buffer_capacity, 512);
    }
}
