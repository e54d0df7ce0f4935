// Copyright 2026 Magisk Boot Core Authors
// SPDX-License-Identifier: GPL-3.0-or-later

//! In-memory representation of the composed overlay.
//!
//! The tree is a prefix tree over the composed filesystem: a node's
//! absolute path is the concatenation of its ancestors' names. Paths are
//! assembled by the traversals in `mount::magic`, not stored per node, so
//! the tree carries no parent pointers and owns its children outright.

use std::collections::{btree_map::Entry, BTreeMap};
use std::fs::FileType;

use bitflags::bitflags;

bitflags! {
    /// Node status set. A node can hold several bits at once; the numeric
    /// value of the set doubles as its precedence, so MODULE beats SKEL
    /// beats INTER beats DUMMY, and a parent promoted to SKEL by a child
    /// keeps any MODULE bit it already carried.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Status: u8 {
        /// Re-mounted from the mirror inside a skeleton.
        const DUMMY  = 1 << 0;
        /// Intermediate directory; traversal only.
        const INTER  = 1 << 1;
        /// Replaced by a fresh tmpfs and re-populated.
        const SKEL   = 1 << 2;
        /// Mounted from a module tree.
        const MODULE = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeFileType {
    Directory,
    RegularFile,
    Symlink,
}

impl NodeFileType {
    /// Maps an lstat file type. Anything that is not a directory, regular
    /// file or symlink has no representation in the overlay.
    pub fn from_file_type(ft: FileType) -> Option<Self> {
        if ft.is_symlink() {
            Some(NodeFileType::Symlink)
        } else if ft.is_dir() {
            Some(NodeFileType::Directory)
        } else if ft.is_file() {
            Some(NodeFileType::RegularFile)
        } else {
            None
        }
    }

    pub fn is_dir(self) -> bool {
        self == NodeFileType::Directory
    }

    pub fn is_lnk(self) -> bool {
        self == NodeFileType::Symlink
    }

    pub fn is_reg(self) -> bool {
        self == NodeFileType::RegularFile
    }
}

#[derive(Debug)]
pub struct Node {
    pub name: String,
    pub file_type: NodeFileType,
    pub status: Status,
    /// Contributing module; meaningful only while MODULE is set.
    pub module: Option<String>,
    pub children: BTreeMap<String, Node>,
}

impl Node {
    pub fn new(name: &str, file_type: NodeFileType, status: Status) -> Self {
        Node {
            name: name.to_string(),
            file_type,
            status,
            module: None,
            children: BTreeMap::new(),
        }
    }

    pub fn new_module(name: &str, file_type: NodeFileType, module: &str) -> Self {
        Node {
            name: name.to_string(),
            file_type,
            status: Status::empty(),
            module: Some(module.to_string()),
            children: BTreeMap::new(),
        }
    }

    /// Synthetic root of a partition tree (INTER directory).
    pub fn new_root(name: &str) -> Self {
        Node::new(name, NodeFileType::Directory, Status::INTER)
    }

    /// Inserts a child, resolving name collisions by precedence: a higher
    /// status replaces the existing subtree (which is dropped), and a
    /// MODULE-for-MODULE tie goes to the later insertion so a later
    /// module overrides an earlier one at the same path. Everything else
    /// keeps the existing child (INTER-for-INTER collisions merge by
    /// continuing the walk into the survivor).
    pub fn insert(&mut self, node: Node) -> &mut Node {
        match self.children.entry(node.name.clone()) {
            Entry::Vacant(slot) => slot.insert(node),
            Entry::Occupied(mut slot) => {
                let existing = slot.get().status;
                let replace = node.status.bits() > existing.bits()
                    || (node.status == existing && node.status.contains(Status::MODULE));
                if replace {
                    slot.insert(node);
                }
                slot.into_mut()
            }
        }
    }

    /// Detaches a direct child, leaving a status-less placeholder of the
    /// same name so later mount passes do not descend into the extracted
    /// subtree.
    pub fn extract(&mut self, name: &str) -> Option<Node> {
        let node = self.children.remove(name)?;
        let placeholder = Node::new(name, node.file_type, Status::empty());
        self.children.insert(name.to_string(), placeholder);
        Some(node)
    }
}
