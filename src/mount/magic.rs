// Copyright 2026 Magisk Boot Core Authors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Magic mount: composes the module override trees into a node tree
//! (precedence MODULE > SKEL > INTER > DUMMY), then walks the finished
//! tree emitting the mount plan. A directory whose children disagree with
//! the live filesystem's shape is skeletonized: replaced by a tmpfs and
//! re-populated with bind-mounts, module children from the module tree
//! and untouched siblings from the read-only mirror.

use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::defs::{MIRRDIR, MOUNTPOINT, REPLACE_DIR_FILE_NAME};
use crate::mount::{MountOp, MountPlan};
use crate::node::{Node, NodeFileType, Status};
use crate::utils::getattr;

/// Composition context. All filesystem consultations go through the three
/// roots, so tests can point the engine at a fake tree; `live_root` is `/`
/// in production.
pub struct MagicMount {
    module_root: PathBuf,
    mirror_root: PathBuf,
    live_root: PathBuf,
    separate_vendor: bool,
}

impl MagicMount {
    pub fn new<P: AsRef<Path>>(
        module_root: P,
        mirror_root: P,
        live_root: P,
        separate_vendor: bool,
    ) -> Self {
        MagicMount {
            module_root: module_root.as_ref().to_path_buf(),
            mirror_root: mirror_root.as_ref().to_path_buf(),
            live_root: live_root.as_ref().to_path_buf(),
            separate_vendor,
        }
    }

    pub fn with_defaults(separate_vendor: bool) -> Self {
        MagicMount::new(MOUNTPOINT, MIRRDIR, "/", separate_vendor)
    }

    fn module_dir(&self, module: &str) -> PathBuf {
        self.module_root.join(module)
    }

    /// Walks `<module>/system` and merges its contributions into the tree.
    /// When the module ships `system/vendor`, a `<module>/vendor` symlink
    /// is created first so the extracted vendor tree resolves back into
    /// the module.
    pub fn create_module_tree(&self, tree: &mut Node, module: &str) -> Result<()> {
        let mod_vendor = self.module_dir(module).join("system/vendor");
        if mod_vendor.exists() {
            let link = self.module_dir(module).join("vendor");
            if link.symlink_metadata().is_ok() {
                let _ = fs::remove_file(&link);
            }
            symlink(&mod_vendor, &link)
                .with_context(|| format!("link {} -> {}", link.display(), mod_vendor.display()))?;
        }
        self.build(tree, Path::new("system"), true, module)
    }

    fn build(&self, node: &mut Node, rel: &Path, is_root: bool, module: &str) -> Result<()> {
        let module_dir = self.module_dir(module).join(rel);
        let entries = match fs::read_dir(&module_dir) {
            Ok(entries) => entries,
            Err(_) => return Ok(()),
        };

        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            let file_type = match NodeFileType::from_file_type(entry.file_type()?) {
                Some(ft) => ft,
                None => {
                    log::debug!("ignoring special file {}/{name}", module_dir.display());
                    continue;
                }
            };

            let child_rel = rel.join(&name);
            let live = self.live_root.join(&child_rel);
            let mut child = Node::new_module(&name, file_type, module);

            // Clone the parent when:
            // 1. the module entry is a symlink
            // 2. the live target does not exist
            // 3. the live target is a symlink (except /system/vendor)
            let clone = if file_type.is_lnk() || !live.exists() {
                true
            } else if !(is_root && name == "vendor") {
                live.symlink_metadata()
                    .map(|m| m.file_type().is_symlink())
                    .unwrap_or(false)
            } else {
                false
            };

            if clone {
                // will not clear a MODULE bit the parent already carries
                node.status |= Status::SKEL;
                child.status = Status::MODULE;
            } else if file_type.is_dir() {
                if self
                    .module_dir(module)
                    .join(&child_rel)
                    .join(REPLACE_DIR_FILE_NAME)
                    .exists()
                {
                    // replace everything, no descent
                    child.status = Status::MODULE;
                } else {
                    child.status = Status::INTER;
                }
            } else if file_type.is_reg() {
                child.status = Status::MODULE;
            }

            let effective = node.insert(child);
            if effective.status.intersects(Status::SKEL | Status::INTER) {
                self.build(effective, &child_rel, false, module)?;
            }
        }
        Ok(())
    }

    /// Detaches the vendor subtree so a separate /vendor partition is
    /// overlaid directly instead of dragging a whole-/system skeleton.
    /// Without a separate partition, vendor stays a subtree of system.
    pub fn extract_vendor(&self, tree: &mut Node) -> Option<Node> {
        if !self.separate_vendor {
            return None;
        }
        tree.extract("vendor")
    }

    /// Emits the mount plan for a finished tree rooted at `/{tree.name}`.
    pub fn emit(&self, tree: &mut Node, plan: &mut MountPlan) -> Result<()> {
        let rel = PathBuf::from(&tree.name);
        self.emit_node(tree, &rel, true, plan)
    }

    fn module_src(&self, node: &Node, rel: &Path) -> Result<PathBuf> {
        let module = node
            .module
            .as_deref()
            .with_context(|| format!("MODULE node without owner at {}", rel.display()))?;
        Ok(self.module_dir(module).join(rel))
    }

    fn emit_node(
        &self,
        node: &mut Node,
        rel: &Path,
        is_root: bool,
        plan: &mut MountPlan,
    ) -> Result<()> {
        if node.status.contains(Status::MODULE) {
            let src = self.module_src(node, rel)?;
            plan.push(MountOp::Bind {
                src,
                dst: self.live_root.join(rel),
            });
        } else if node.status.contains(Status::SKEL) {
            self.emit_skeleton(node, rel, is_root, true, plan)?;
        } else if node.status.contains(Status::INTER) {
            for (name, child) in node.children.iter_mut() {
                let child_rel = rel.join(name);
                self.emit_node(child, &child_rel, false, plan)?;
            }
        }
        // empty status is the extracted-vendor placeholder: nothing to do
        Ok(())
    }

    /// Skeleton synthesis: tmpfs with the live directory's attributes,
    /// placeholders for every expected child, then bind-mounts onto the
    /// placeholders (module children from the module tree, untouched
    /// siblings from the mirror). `with_tmpfs` is false for intermediate
    /// directories inside an already-mounted skeleton.
    fn emit_skeleton(
        &self,
        node: &mut Node,
        rel: &Path,
        is_root: bool,
        with_tmpfs: bool,
        plan: &mut MountPlan,
    ) -> Result<()> {
        // mirror enumeration: every live sibling the modules left alone
        // becomes a DUMMY placeholder
        let mirror_dir = self.mirror_root.join(rel);
        if let Ok(entries) = fs::read_dir(&mirror_dir) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().to_string();
                let file_type = match NodeFileType::from_file_type(entry.file_type()?) {
                    Some(ft) => ft,
                    None => continue,
                };
                node.insert(Node::new(&name, file_type, Status::DUMMY));
            }
        }

        if with_tmpfs {
            let live = self.live_root.join(rel);
            // capture before the tmpfs shadows the original
            let attr = match getattr(&live) {
                Ok(attr) => Some(attr),
                Err(_) => node
                    .module
                    .as_deref()
                    .and_then(|m| getattr(self.module_dir(m).join(rel)).ok()),
            };
            plan.push(MountOp::Tmpfs { dst: live.clone() });
            if let Some(attr) = attr {
                plan.push(MountOp::SetAttr { dst: live, attr });
            }
        }

        for (name, child) in node.children.iter_mut() {
            let child_rel = rel.join(name);
            let dst = self.live_root.join(&child_rel);

            if is_root && name == "vendor" && self.separate_vendor {
                // handled by the extracted vendor tree; keep lookups from
                // the system overlay resolving into the real partition
                plan.push(MountOp::CopyTree {
                    src: self.mirror_root.join(&child_rel),
                    dst,
                });
                continue;
            }

            if child.status.is_empty() {
                continue;
            }

            match child.file_type {
                NodeFileType::Directory => plan.push(MountOp::Mkdir { dst: dst.clone() }),
                NodeFileType::RegularFile => plan.push(MountOp::Touch { dst: dst.clone() }),
                // symlinks are copied, never used as mountpoints
                NodeFileType::Symlink => {}
            }

            if child.status.contains(Status::MODULE) {
                let src = self.module_src(child, &child_rel)?;
                if child.file_type.is_lnk() {
                    plan.push(MountOp::CloneLink { src, dst });
                } else {
                    plan.push(MountOp::Bind { src, dst });
                }
            } else if child.status.intersects(Status::SKEL | Status::INTER) {
                let nested_tmpfs = child.status.contains(Status::SKEL);
                self.emit_skeleton(child, &child_rel, false, nested_tmpfs, plan)?;
            } else if child.status.contains(Status::DUMMY) {
                let src = self.mirror_root.join(&child_rel);
                if child.file_type.is_lnk() {
                    plan.push(MountOp::CloneLink { src, dst });
                } else {
                    plan.push(MountOp::Bind { src, dst });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    struct Env {
        _tmp: tempfile::TempDir,
        engine: MagicMount,
        modules: PathBuf,
        live: PathBuf,
        mirror: PathBuf,
    }

    fn env(separate_vendor: bool) -> Env {
        let tmp = tempfile::tempdir().unwrap();
        let modules = tmp.path().join("img");
        let mirror = tmp.path().join("mirror");
        let live = tmp.path().join("live");
        for dir in [&modules, &mirror, &live] {
            fs::create_dir_all(dir).unwrap();
        }
        let engine = MagicMount::new(&modules, &mirror, &live, separate_vendor);
        Env {
            _tmp: tmp,
            engine,
            modules,
            live,
            mirror,
        }
    }

    #[test]
    fn existing_file_override_is_plain_module_leaf() {
        let e = env(false);
        fs::create_dir_all(e.live.join("system/etc")).unwrap();
        File::create(e.live.join("system/etc/hosts")).unwrap();
        fs::create_dir_all(e.modules.join("hosts_mod/system/etc")).unwrap();
        File::create(e.modules.join("hosts_mod/system/etc/hosts")).unwrap();

        let mut tree = Node::new_root("system");
        e.engine.create_module_tree(&mut tree, "hosts_mod").unwrap();

        let etc = &tree.children["etc"];
        assert_eq!(etc.status, Status::INTER);
        let hosts = &etc.children["hosts"];
        assert_eq!(hosts.status, Status::MODULE);
        assert_eq!(hosts.module.as_deref(), Some("hosts_mod"));
        assert!(!tree.status.contains(Status::SKEL));
    }

    #[test]
    fn new_file_skeletonizes_parent_only() {
        let e = env(false);
        fs::create_dir_all(e.live.join("system/bin")).unwrap();
        File::create(e.live.join("system/bin/ls")).unwrap();
        fs::create_dir_all(e.modules.join("new_tool/system/bin")).unwrap();
        File::create(e.modules.join("new_tool/system/bin/tool_x")).unwrap();

        let mut tree = Node::new_root("system");
        e.engine.create_module_tree(&mut tree, "new_tool").unwrap();

        let bin = &tree.children["bin"];
        assert!(bin.status.contains(Status::SKEL));
        assert_eq!(bin.children["tool_x"].status, Status::MODULE);
        // the root itself stays intermediate
        assert_eq!(tree.status, Status::INTER);
    }

    #[test]
    fn module_symlink_skeletonizes_parent() {
        let e = env(false);
        fs::create_dir_all(e.live.join("system/lib")).unwrap();
        File::create(e.live.join("system/lib/libx.so")).unwrap();
        fs::create_dir_all(e.modules.join("m/system/lib")).unwrap();
        symlink("libx.so", e.modules.join("m/system/lib/liby.so")).unwrap();

        let mut tree = Node::new_root("system");
        e.engine.create_module_tree(&mut tree, "m").unwrap();

        let lib = &tree.children["lib"];
        assert!(lib.status.contains(Status::SKEL));
        assert_eq!(lib.children["liby.so"].status, Status::MODULE);
    }

    #[test]
    fn root_vendor_symlink_does_not_clone() {
        let e = env(true);
        // live: /system/vendor -> /vendor
        fs::create_dir_all(e.live.join("system")).unwrap();
        fs::create_dir_all(e.live.join("vendor")).unwrap();
        File::create(e.live.join("vendor/fw.bin")).unwrap();
        symlink(e.live.join("vendor"), e.live.join("system/vendor")).unwrap();

        fs::create_dir_all(e.modules.join("m/system/vendor")).unwrap();
        File::create(e.modules.join("m/system/vendor/fw.bin")).unwrap();

        let mut tree = Node::new_root("system");
        e.engine.create_module_tree(&mut tree, "m").unwrap();

        assert!(
            !tree.status.contains(Status::SKEL),
            "root must not be skeletonized by the vendor symlink"
        );
        // module vendor link created for the extracted tree
        let link = e.modules.join("m/vendor");
        assert!(link.symlink_metadata().unwrap().file_type().is_symlink());

        let vendor = e.engine.extract_vendor(&mut tree).expect("vendor extracted");
        assert!(vendor.children.contains_key("fw.bin"));
        assert!(tree.children["vendor"].status.is_empty());
    }

    #[test]
    fn replace_marker_stops_descent() {
        let e = env(false);
        fs::create_dir_all(e.live.join("system/etc/deep")).unwrap();
        let mod_etc = e.modules.join("full_etc/system/etc");
        fs::create_dir_all(mod_etc.join("deep")).unwrap();
        File::create(mod_etc.join(".replace")).unwrap();
        File::create(mod_etc.join("deep/file")).unwrap();

        let mut tree = Node::new_root("system");
        e.engine.create_module_tree(&mut tree, "full_etc").unwrap();

        let etc = &tree.children["etc"];
        assert_eq!(etc.status, Status::MODULE);
        assert!(etc.children.is_empty(), "no recursion past .replace");
    }

    #[test]
    fn skeleton_emits_tmpfs_attrs_and_mirror_dummies() {
        let e = env(false);
        fs::create_dir_all(e.live.join("system/bin")).unwrap();
        File::create(e.live.join("system/bin/ls")).unwrap();
        fs::create_dir_all(e.mirror.join("system/bin")).unwrap();
        File::create(e.mirror.join("system/bin/ls")).unwrap();
        fs::create_dir_all(e.modules.join("new_tool/system/bin")).unwrap();
        File::create(e.modules.join("new_tool/system/bin/tool_x")).unwrap();

        let mut tree = Node::new_root("system");
        e.engine.create_module_tree(&mut tree, "new_tool").unwrap();

        let mut plan = MountPlan::new();
        e.engine.emit(&mut tree, &mut plan).unwrap();

        let bin = e.live.join("system/bin");
        assert!(plan
            .ops
            .iter()
            .any(|op| matches!(op, MountOp::Tmpfs { dst } if dst == &bin)));
        assert!(plan
            .ops
            .iter()
            .any(|op| matches!(op, MountOp::SetAttr { dst, .. } if dst == &bin)));
        // untouched sibling re-mounted from the mirror
        assert!(plan.ops.iter().any(|op| matches!(
            op,
            MountOp::Bind { src, dst }
                if src == &e.mirror.join("system/bin/ls") && dst == &e.live.join("system/bin/ls")
        )));
        // module file mounted from the module tree
        assert!(plan.ops.iter().any(|op| matches!(
            op,
            MountOp::Bind { src, dst }
                if src == &e.modules.join("new_tool/system/bin/tool_x")
                    && dst == &e.live.join("system/bin/tool_x")
        )));
    }
}
