//! Attribute tree: hierarchical attribute paths mapped to dense quarks.
//!
//! Every attribute is a node identified by the sequence of names leading to
//! it from the root (for example `CPUs/0/Current_thread`) and by its quark,
//! an index assigned in creation order. Nodes are never removed.
//!
//! The tree itself is not synchronized; [`crate::StateSystem`] keeps it
//! behind a lock and grows the transient state from the `on_new` callback of
//! [`AttributeTree::resolve_or_create`] while holding that lock.

pub mod codec;

use crate::error::{Result, StateError};
use crate::{Quark, ROOT_QUARK};
use std::collections::HashMap;

pub use codec::ATTRIBUTE_TREE_MAGIC;

/// Children of one node, in creation order and indexed by name.
#[derive(Debug, Default, Clone)]
struct ChildIndex {
    order: Vec<Quark>,
    by_name: HashMap<String, Quark>,
}

#[derive(Debug, Clone)]
struct AttributeNode {
    name: String,
    parent: Quark,
    children: ChildIndex,
}

impl AttributeNode {
    fn new(name: String, parent: Quark) -> Self {
        Self {
            name,
            parent,
            children: ChildIndex::default(),
        }
    }
}

/// The attribute namespace of a state system.
#[derive(Debug, Clone)]
pub struct AttributeTree {
    root: AttributeNode,
    /// Nodes indexed by quark.
    nodes: Vec<AttributeNode>,
}

impl Default for AttributeTree {
    fn default() -> Self {
        Self::new()
    }
}

impl AttributeTree {
    /// Creates an empty tree.
    pub fn new() -> Self {
        Self {
            root: AttributeNode::new(String::new(), ROOT_QUARK),
            nodes: Vec::new(),
        }
    }

    /// Returns the number of attributes (excluding the root).
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if no attribute was created yet.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn node(&self, quark: Quark) -> Result<&AttributeNode> {
        if quark == ROOT_QUARK {
            return Ok(&self.root);
        }
        usize::try_from(quark)
            .ok()
            .and_then(|idx| self.nodes.get(idx))
            .ok_or_else(|| StateError::AttributeNotFound(format!("invalid quark {}", quark)))
    }

    fn node_mut(&mut self, quark: Quark) -> Result<&mut AttributeNode> {
        if quark == ROOT_QUARK {
            return Ok(&mut self.root);
        }
        usize::try_from(quark)
            .ok()
            .and_then(|idx| self.nodes.get_mut(idx))
            .ok_or_else(|| StateError::AttributeNotFound(format!("invalid quark {}", quark)))
    }

    /// Resolves `path` relative to `start` without creating anything.
    ///
    /// An empty path resolves to `start` itself.
    ///
    /// # Errors
    ///
    /// Returns `StateError::AttributeNotFound` if `start` is not a valid
    /// quark or if any segment of the path does not exist.
    pub fn resolve<S: AsRef<str>>(&self, start: Quark, path: &[S]) -> Result<Quark> {
        let mut current = start;
        let mut node = self.node(start)?;
        for segment in path {
            let segment = segment.as_ref();
            current = *node.children.by_name.get(segment).ok_or_else(|| {
                StateError::AttributeNotFound(format!(
                    "no attribute '{}' under quark {}",
                    segment, current
                ))
            })?;
            node = self.node(current)?;
        }
        Ok(current)
    }

    /// Resolves `path` relative to `start`, creating missing nodes.
    ///
    /// Each new node receives the next quark (the current attribute count)
    /// and `on_new` is called with it before the node is linked to its
    /// parent.
    ///
    /// # Errors
    ///
    /// Returns `StateError::AttributeNotFound` if `start` is not a valid
    /// quark.
    pub fn resolve_or_create<S, F>(&mut self, start: Quark, path: &[S], mut on_new: F) -> Result<Quark>
    where
        S: AsRef<str>,
        F: FnMut(Quark),
    {
        let mut current = start;
        self.node(start)?;
        for segment in path {
            let segment = segment.as_ref();
            let existing = self.node(current)?.children.by_name.get(segment).copied();
            current = match existing {
                Some(child) => child,
                None => {
                    let quark = Quark::try_from(self.nodes.len()).map_err(|_| {
                        StateError::AttributeNotFound("attribute quark space exhausted".to_string())
                    })?;
                    on_new(quark);
                    self.nodes.push(AttributeNode::new(segment.to_string(), current));
                    let parent = self.node_mut(current)?;
                    parent.children.order.push(quark);
                    parent.children.by_name.insert(segment.to_string(), quark);
                    quark
                }
            };
        }
        Ok(current)
    }

    /// Returns the children of `quark` (the root if `quark` is -1), in
    /// creation order. With `recursive`, the whole subtree is returned in
    /// depth-first order.
    ///
    /// # Errors
    ///
    /// Returns `StateError::AttributeNotFound` if `quark` is not valid.
    pub fn children(&self, quark: Quark, recursive: bool) -> Result<Vec<Quark>> {
        let node = self.node(quark)?;
        if !recursive {
            return Ok(node.children.order.clone());
        }

        let mut result = Vec::new();
        let mut stack: Vec<Quark> = node.children.order.iter().rev().copied().collect();
        while let Some(current) = stack.pop() {
            result.push(current);
            let children = &self.node(current)?.children.order;
            stack.extend(children.iter().rev());
        }
        Ok(result)
    }

    /// Returns the name (last path segment) of `quark`.
    pub fn name(&self, quark: Quark) -> Result<&str> {
        Ok(&self.node(quark)?.name)
    }

    /// Returns the parent quark of `quark` (-1 for top-level attributes).
    pub fn parent(&self, quark: Quark) -> Result<Quark> {
        if quark == ROOT_QUARK {
            return Ok(ROOT_QUARK);
        }
        Ok(self.node(quark)?.parent)
    }

    /// Returns the path segments from the root down to `quark`.
    pub fn full_path_segments(&self, quark: Quark) -> Result<Vec<String>> {
        let mut segments = Vec::new();
        let mut current = quark;
        while current != ROOT_QUARK {
            let node = self.node(current)?;
            segments.push(node.name.clone());
            current = node.parent;
        }
        segments.reverse();
        Ok(segments)
    }

    /// Returns the full path of `quark`, segments joined with `/`.
    pub fn full_path(&self, quark: Quark) -> Result<String> {
        Ok(self.full_path_segments(quark)?.join("/"))
    }
}
