//! Persisted form of the attribute tree.
//!
//! ## Layout
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Header (12 bytes, big-endian)                               │
//! │  - Magic: i32 = 0x06EC3671                                   │
//! │  - Section byte length: i32 (header included)                │
//! │  - Entry count: i32                                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Entries (one per quark, in quark order)                     │
//! │  - Path byte length: i8                                      │
//! │  - Escaped full path: UTF-8                                  │
//! │  - Terminator: 0x00                                          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Full paths join segments with `/`. A `/` or `\` inside a segment is
//! preceded by `\`.

use super::AttributeTree;
use crate::error::{Result, StateError};
use crate::{Quark, ROOT_QUARK};
use std::io::{self, Read, Write};

/// Magic number opening a persisted attribute tree section.
pub const ATTRIBUTE_TREE_MAGIC: u32 = 0x06EC_3671;

/// Header size in bytes.
pub const TREE_HEADER_SIZE: usize = 12;

/// Maximum encoded length of one full path.
pub const MAX_PATH_BYTES: usize = i8::MAX as usize;

const SEPARATOR: char = '/';
const ESCAPE: char = '\\';

fn escape_segment(segment: &str, out: &mut String) {
    for c in segment.chars() {
        if c == SEPARATOR || c == ESCAPE {
            out.push(ESCAPE);
        }
        out.push(c);
    }
}

/// Splits an escaped full path into its segments.
fn split_escaped(path: &str) -> Result<Vec<String>> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = path.chars();
    while let Some(c) = chars.next() {
        match c {
            ESCAPE => match chars.next() {
                Some(escaped) => current.push(escaped),
                None => {
                    return Err(StateError::Corrupted(format!(
                        "dangling escape in attribute path '{}'",
                        path
                    )))
                }
            },
            SEPARATOR => segments.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    segments.push(current);
    Ok(segments)
}

fn truncated(err: io::Error) -> StateError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        StateError::Corrupted("truncated attribute tree section".to_string())
    } else {
        StateError::IoError(err)
    }
}

impl AttributeTree {
    /// Returns the escaped full path of `quark`, as stored on disk.
    pub fn escaped_path(&self, quark: Quark) -> Result<String> {
        let mut path = String::new();
        for (i, segment) in self.full_path_segments(quark)?.iter().enumerate() {
            if i > 0 {
                path.push(SEPARATOR);
            }
            escape_segment(segment, &mut path);
        }
        Ok(path)
    }

    /// Serializes the tree into a byte buffer.
    ///
    /// # Errors
    ///
    /// Returns `StateError::AttributeNameTooLong` if a full path exceeds
    /// [`MAX_PATH_BYTES`] once escaped.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        for idx in 0..self.nodes.len() {
            let quark = idx as Quark;
            let path = self.escaped_path(quark)?;
            if path.len() > MAX_PATH_BYTES {
                return Err(StateError::AttributeNameTooLong {
                    len: path.len(),
                    path,
                });
            }
            body.push(path.len() as u8);
            body.extend_from_slice(path.as_bytes());
            body.push(0);
        }

        let section_len = i32::try_from(TREE_HEADER_SIZE + body.len())
            .map_err(|_| StateError::Corrupted("attribute tree section too large".to_string()))?;
        let entry_count = self.nodes.len() as i32;

        let mut buf = Vec::with_capacity(TREE_HEADER_SIZE + body.len());
        buf.extend_from_slice(&ATTRIBUTE_TREE_MAGIC.to_be_bytes());
        buf.extend_from_slice(&section_len.to_be_bytes());
        buf.extend_from_slice(&entry_count.to_be_bytes());
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    /// Writes the serialized tree to `writer`, returning the byte count.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<usize> {
        let bytes = self.to_bytes()?;
        writer.write_all(&bytes)?;
        Ok(bytes.len())
    }

    /// Reads a tree from `reader`, replaying every entry in quark order.
    ///
    /// `on_new` is invoked once per rebuilt quark.
    ///
    /// # Errors
    ///
    /// Returns `StateError::InvalidMagic` on a bad header and
    /// `StateError::Corrupted` on any length, terminator, UTF-8 or quark
    /// order inconsistency. No partial tree is returned.
    pub fn read_from<R: Read, F: FnMut(Quark)>(reader: &mut R, mut on_new: F) -> Result<Self> {
        let mut header = [0u8; TREE_HEADER_SIZE];
        reader.read_exact(&mut header).map_err(truncated)?;

        let magic = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        if magic != ATTRIBUTE_TREE_MAGIC {
            return Err(StateError::InvalidMagic(magic));
        }
        let section_len = i32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        let entry_count = i32::from_be_bytes([header[8], header[9], header[10], header[11]]);
        if section_len < TREE_HEADER_SIZE as i32 || entry_count < 0 {
            return Err(StateError::Corrupted(format!(
                "invalid attribute tree header: length {}, entries {}",
                section_len, entry_count
            )));
        }

        // Read at most the declared length, then check it was all there
        let body_len = section_len as usize - TREE_HEADER_SIZE;
        let mut body = Vec::new();
        reader.by_ref().take(body_len as u64).read_to_end(&mut body)?;
        if body.len() != body_len {
            return Err(StateError::Corrupted(format!(
                "truncated attribute tree section: {} of {} body bytes",
                body.len(),
                body_len
            )));
        }

        let mut tree = AttributeTree::new();
        let mut pos = 0usize;
        for expected in 0..entry_count {
            let len = *body.get(pos).ok_or_else(|| {
                StateError::Corrupted(format!("missing attribute tree entry {}", expected))
            })? as i8;
            if len < 0 {
                return Err(StateError::Corrupted(format!(
                    "negative path length {} at entry {}",
                    len, expected
                )));
            }
            pos += 1;

            let end = pos + len as usize;
            let raw = body.get(pos..end).ok_or_else(|| {
                StateError::Corrupted(format!("truncated attribute tree entry {}", expected))
            })?;
            let path = std::str::from_utf8(raw).map_err(|e| {
                StateError::Corrupted(format!("invalid UTF-8 in entry {}: {}", expected, e))
            })?;
            if body.get(end) != Some(&0) {
                return Err(StateError::Corrupted(format!(
                    "missing terminator after entry {}",
                    expected
                )));
            }
            pos = end + 1;

            let segments = split_escaped(path)?;
            let quark = tree.resolve_or_create(ROOT_QUARK, &segments, &mut on_new)?;
            if quark != expected {
                return Err(StateError::Corrupted(format!(
                    "entry '{}' replayed as quark {} instead of {}",
                    path, quark, expected
                )));
            }
        }

        if pos != body.len() {
            return Err(StateError::Corrupted(format!(
                "attribute tree section declares {} bytes but entries use {}",
                section_len,
                TREE_HEADER_SIZE + pos
            )));
        }
        Ok(tree)
    }

    /// Rebuilds a tree from a buffer written by [`AttributeTree::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut reader = bytes;
        let tree = Self::read_from(&mut reader, |_| {})?;
        if !reader.is_empty() {
            return Err(StateError::Corrupted(format!(
                "{} bytes after attribute tree section",
                reader.len()
            )));
        }
        Ok(tree)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> AttributeTree {
        let mut tree = AttributeTree::new();
        for path in [
            vec!["CPUs", "0", "Current_thread"],
            vec!["CPUs", "1", "Current_thread"],
            vec!["Threads", "a/b", "Status"],
            vec!["Threads", "c\\d"],
        ] {
            tree.resolve_or_create(ROOT_QUARK, &path, |_| {}).unwrap();
        }
        tree
    }

    #[test]
    fn test_header_layout() {
        let tree = sample_tree();
        let bytes = tree.to_bytes().unwrap();

        assert_eq!(&bytes[0..4], &[0x06, 0xEC, 0x36, 0x71]);
        let section_len = i32::from_be_bytes(bytes[4..8].try_into().unwrap());
        assert_eq!(section_len as usize, bytes.len());
        let entries = i32::from_be_bytes(bytes[8..12].try_into().unwrap());
        assert_eq!(entries as usize, tree.len());

        // First entry is "CPUs"
        assert_eq!(bytes[12], 4);
        assert_eq!(&bytes[13..17], b"CPUs");
        assert_eq!(bytes[17], 0);
    }

    #[test]
    fn test_reload_preserves_quarks_and_escapes() {
        let tree = sample_tree();
        let bytes = tree.to_bytes().unwrap();

        let mut minted = Vec::new();
        let mut reader = bytes.as_slice();
        let reloaded = AttributeTree::read_from(&mut reader, |q| minted.push(q)).unwrap();

        assert_eq!(reloaded.len(), tree.len());
        assert_eq!(minted, (0..tree.len() as Quark).collect::<Vec<_>>());
        for q in 0..tree.len() as Quark {
            assert_eq!(
                reloaded.full_path_segments(q).unwrap(),
                tree.full_path_segments(q).unwrap()
            );
        }
        let slash = reloaded
            .resolve(ROOT_QUARK, &["Threads", "a/b", "Status"])
            .unwrap();
        assert_eq!(reloaded.escaped_path(slash).unwrap(), "Threads/a\\/b/Status");
    }

    #[test]
    fn test_empty_tree() {
        let tree = AttributeTree::new();
        let bytes = tree.to_bytes().unwrap();
        assert_eq!(bytes.len(), TREE_HEADER_SIZE);
        assert!(AttributeTree::from_bytes(&bytes).unwrap().is_empty());
    }

    #[test]
    fn test_path_too_long() {
        let mut tree = AttributeTree::new();
        let long = "x".repeat(MAX_PATH_BYTES + 1);
        tree.resolve_or_create(ROOT_QUARK, &[long.as_str()], |_| {})
            .unwrap();
        assert!(matches!(
            tree.to_bytes(),
            Err(StateError::AttributeNameTooLong { len, .. }) if len == MAX_PATH_BYTES + 1
        ));
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = sample_tree().to_bytes().unwrap();
        bytes[0] = 0xFF;
        assert!(matches!(
            AttributeTree::from_bytes(&bytes),
            Err(StateError::InvalidMagic(_))
        ));
    }

    #[test]
    fn test_truncated_section() {
        let bytes = sample_tree().to_bytes().unwrap();
        for cut in [4, TREE_HEADER_SIZE + 3, bytes.len() - 1] {
            assert!(matches!(
                AttributeTree::from_bytes(&bytes[..cut]),
                Err(StateError::Corrupted(_))
            ));
        }
    }

    #[test]
    fn test_oversized_length_is_truncation() {
        let mut bytes = sample_tree().to_bytes().unwrap();
        bytes[4..8].copy_from_slice(&i32::MAX.to_be_bytes());
        assert!(matches!(
            AttributeTree::from_bytes(&bytes),
            Err(StateError::Corrupted(msg)) if msg.contains("truncated")
        ));
    }

    #[test]
    fn test_length_mismatch() {
        let mut bytes = sample_tree().to_bytes().unwrap();
        bytes.extend_from_slice(&[0, 0]);
        let declared = bytes.len() as i32;
        bytes[4..8].copy_from_slice(&declared.to_be_bytes());
        assert!(matches!(
            AttributeTree::from_bytes(&bytes),
            Err(StateError::Corrupted(_))
        ));
    }

    #[test]
    fn test_missing_terminator() {
        let mut bytes = sample_tree().to_bytes().unwrap();
        bytes[17] = b'!';
        assert!(matches!(
            AttributeTree::from_bytes(&bytes),
            Err(StateError::Corrupted(_))
        ));
    }

    #[test]
    fn test_invalid_utf8() {
        let mut bytes = sample_tree().to_bytes().unwrap();
        bytes[13] = 0xFF;
        assert!(matches!(
            AttributeTree::from_bytes(&bytes),
            Err(StateError::Corrupted(_))
        ));
    }

    #[test]
    fn test_out_of_order_entries_rejected() {
        // "a/b" recorded before "a": replay would mint "a" first.
        let mut body = Vec::new();
        for path in ["a/b", "a"] {
            body.push(path.len() as u8);
            body.extend_from_slice(path.as_bytes());
            body.push(0);
        }
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&ATTRIBUTE_TREE_MAGIC.to_be_bytes());
        bytes.extend_from_slice(&((TREE_HEADER_SIZE + body.len()) as i32).to_be_bytes());
        bytes.extend_from_slice(&2i32.to_be_bytes());
        bytes.extend_from_slice(&body);

        assert!(matches!(
            AttributeTree::from_bytes(&bytes),
            Err(StateError::Corrupted(_))
        ));
    }

    #[test]
    fn test_split_escaped() {
        assert_eq!(split_escaped("a/b").unwrap(), vec!["a", "b"]);
        assert_eq!(split_escaped("a\\/b/c").unwrap(), vec!["a/b", "c"]);
        assert_eq!(split_escaped("x\\\\").unwrap(), vec!["x\\"]);
        assert!(split_escaped("bad\\").is_err());
    }
}
