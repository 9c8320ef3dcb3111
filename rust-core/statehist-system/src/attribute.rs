// SPDX-License-Identifier: PMPL-1.0-or-later
//
// Attribute tree: the mapping between attribute paths and quarks.
//
// Quarks are handed out densely in creation order and never reused, so the
// tree is a plain vector indexed by quark plus a name index per node. The
// root is not a quark; it is addressed with `ROOT_QUARK`.
//
// # Snapshot format (little-endian)
//
// ```text
// [magic: u32][version: u8][count: u32]
// count x [parent: u32][name_len: u32][name: UTF-8]
// ```
//
// Entries appear in quark order, so every parent precedes its children.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use statehist_core::{ByteReader, Quark, ValueError, ROOT_QUARK};

use crate::error::{StateSystemError, StateSystemResult};

/// Magic number opening an attribute tree snapshot.
pub const ATTRIBUTE_TREE_MAGIC: u32 = 0x4154_5452;

/// Snapshot format version.
pub const ATTRIBUTE_TREE_VERSION: u8 = 1;

#[derive(Debug, Clone, Default)]
struct Attribute {
    name: String,
    parent: Quark,
    children: Vec<Quark>,
    by_name: HashMap<String, Quark>,
}

impl Attribute {
    fn new(name: &str, parent: Quark) -> Self {
        Self {
            name: name.to_string(),
            parent,
            children: Vec::new(),
            by_name: HashMap::new(),
        }
    }
}

/// One attribute as listed by [`AttributeTree::entries`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeEntry {
    pub quark: Quark,
    /// `None` for top-level attributes.
    pub parent: Option<Quark>,
    /// Full `/`-joined path.
    pub path: String,
}

/// Append-only tree of named attributes.
#[derive(Debug, Clone)]
pub struct AttributeTree {
    root: Attribute,
    attributes: Vec<Attribute>,
}

impl Default for AttributeTree {
    fn default() -> Self {
        Self::new()
    }
}

impl AttributeTree {
    pub fn new() -> Self {
        Self {
            root: Attribute::new("", ROOT_QUARK),
            attributes: Vec::new(),
        }
    }

    /// Number of attributes (the root excluded).
    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    /// True if `quark` names an existing attribute.
    pub fn contains(&self, quark: Quark) -> bool {
        (quark as usize) < self.attributes.len()
    }

    fn node(&self, quark: Quark) -> StateSystemResult<&Attribute> {
        if quark == ROOT_QUARK {
            return Ok(&self.root);
        }
        self.attributes
            .get(quark as usize)
            .ok_or_else(|| StateSystemError::not_found(quark))
    }

    fn node_mut(&mut self, quark: Quark) -> StateSystemResult<&mut Attribute> {
        if quark == ROOT_QUARK {
            return Ok(&mut self.root);
        }
        self.attributes
            .get_mut(quark as usize)
            .ok_or_else(|| StateSystemError::not_found(quark))
    }

    fn attribute(&self, quark: Quark) -> StateSystemResult<&Attribute> {
        if quark == ROOT_QUARK {
            return Err(StateSystemError::AttributeNotFound(
                "the root is not an attribute".to_string(),
            ));
        }
        self.node(quark)
    }

    /// The child of `parent` named `name`, if it exists.
    pub fn child(&self, parent: Quark, name: &str) -> StateSystemResult<Option<Quark>> {
        Ok(self.node(parent)?.by_name.get(name).copied())
    }

    /// Resolve `path` below `start` without creating anything.
    pub fn lookup(&self, start: Quark, path: &[&str]) -> StateSystemResult<Option<Quark>> {
        let mut current = start;
        self.node(current)?;
        for segment in path {
            match self.child(current, segment)? {
                Some(q) => current = q,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    /// Resolve `path` below `start`, creating missing attributes.
    ///
    /// New quarks are numbered from the previous `len()` upwards.
    pub fn lookup_or_add(&mut self, start: Quark, path: &[&str]) -> StateSystemResult<Quark> {
        let mut current = start;
        self.node(current)?;
        for segment in path {
            current = match self.child(current, segment)? {
                Some(q) => q,
                None => self.add(current, segment)?,
            };
        }
        Ok(current)
    }

    fn add(&mut self, parent: Quark, name: &str) -> StateSystemResult<Quark> {
        let quark = Quark::try_from(self.attributes.len())
            .ok()
            .filter(|q| *q != ROOT_QUARK)
            .ok_or_else(|| StateSystemError::AttributeNotFound("attribute limit reached".into()))?;
        let node = self.node_mut(parent)?;
        node.children.push(quark);
        node.by_name.insert(name.to_string(), quark);
        self.attributes.push(Attribute::new(name, parent));
        Ok(quark)
    }

    /// Direct children of `quark`, in creation order.
    pub fn children(&self, quark: Quark) -> StateSystemResult<&[Quark]> {
        Ok(&self.node(quark)?.children)
    }

    /// Children of `quark`, or its whole subtree in pre-order when
    /// `recursive` is set.
    pub fn sub_attributes(&self, quark: Quark, recursive: bool) -> StateSystemResult<Vec<Quark>> {
        let children = self.children(quark)?;
        if !recursive {
            return Ok(children.to_vec());
        }
        let mut out = Vec::new();
        let mut stack: Vec<Quark> = children.iter().rev().copied().collect();
        while let Some(q) = stack.pop() {
            out.push(q);
            stack.extend(self.children(q)?.iter().rev());
        }
        Ok(out)
    }

    /// Last path segment of `quark`.
    pub fn name(&self, quark: Quark) -> StateSystemResult<&str> {
        Ok(&self.attribute(quark)?.name)
    }

    /// Parent of `quark`; `ROOT_QUARK` for top-level attributes.
    pub fn parent(&self, quark: Quark) -> StateSystemResult<Quark> {
        Ok(self.attribute(quark)?.parent)
    }

    /// Path segments from the top level down to `quark`.
    pub fn full_path_array(&self, quark: Quark) -> StateSystemResult<Vec<String>> {
        let mut segments = Vec::new();
        let mut current = quark;
        while current != ROOT_QUARK {
            let node = self.attribute(current)?;
            segments.push(node.name.clone());
            current = node.parent;
        }
        segments.reverse();
        Ok(segments)
    }

    /// `/`-joined full path of `quark`.
    pub fn full_path(&self, quark: Quark) -> StateSystemResult<String> {
        Ok(self.full_path_array(quark)?.join("/"))
    }

    /// Every attribute in quark order.
    pub fn entries(&self) -> StateSystemResult<Vec<AttributeEntry>> {
        (0..self.attributes.len() as Quark)
            .map(|quark| {
                let parent = self.parent(quark)?;
                Ok(AttributeEntry {
                    quark,
                    parent: (parent != ROOT_QUARK).then_some(parent),
                    path: self.full_path(quark)?,
                })
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Snapshot
    // -----------------------------------------------------------------------

    /// Serialize the tree for storage after the last history node.
    pub fn encode(&self) -> Vec<u8> {
        let names: usize = self.attributes.iter().map(|a| a.name.len() + 8).sum();
        let mut out = Vec::with_capacity(9 + names);
        out.extend_from_slice(&ATTRIBUTE_TREE_MAGIC.to_le_bytes());
        out.push(ATTRIBUTE_TREE_VERSION);
        out.extend_from_slice(&(self.attributes.len() as u32).to_le_bytes());
        for attr in &self.attributes {
            out.extend_from_slice(&attr.parent.to_le_bytes());
            out.extend_from_slice(&(attr.name.len() as u32).to_le_bytes());
            out.extend_from_slice(attr.name.as_bytes());
        }
        out
    }

    /// Rebuild a tree from [`encode`](Self::encode) output.
    pub fn decode(bytes: &[u8]) -> StateSystemResult<Self> {
        let corrupt = |reason: String| StateSystemError::CorruptFile(format!("attribute tree: {reason}"));
        let truncated = |e: ValueError| corrupt(e.to_string());

        let mut reader = ByteReader::new(bytes);
        let magic = reader.u32().map_err(truncated)?;
        if magic != ATTRIBUTE_TREE_MAGIC {
            return Err(corrupt(format!("bad magic {magic:#010x}")));
        }
        let version = reader.u8().map_err(truncated)?;
        if version != ATTRIBUTE_TREE_VERSION {
            return Err(StateSystemError::VersionMismatch {
                what: "attribute tree",
                expected: u32::from(ATTRIBUTE_TREE_VERSION),
                found: u32::from(version),
            });
        }
        let count = reader.u32().map_err(truncated)?;

        let mut tree = Self::new();
        tree.attributes.reserve((count as usize).min(reader.remaining() / 8));
        for quark in 0..count {
            let parent = reader.u32().map_err(truncated)?;
            if parent != ROOT_QUARK && parent >= quark {
                return Err(corrupt(format!("quark {quark} has parent {parent} defined after it")));
            }
            let len = reader.u32().map_err(truncated)? as usize;
            let name = std::str::from_utf8(reader.bytes(len).map_err(truncated)?)
                .map_err(|_| corrupt(format!("quark {quark} name is not UTF-8")))?;
            if tree.child(parent, name)?.is_some() {
                return Err(corrupt(format!("duplicate attribute {name:?} under {parent}")));
            }
            tree.add(parent, name)?;
        }
        if reader.remaining() != 0 {
            return Err(corrupt(format!("{} trailing bytes", reader.remaining())));
        }
        Ok(tree)
    }
}
