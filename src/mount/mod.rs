// Copyright 2026 Magisk Boot Core Authors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Mount plan and its executor. The composition engine and the simple
//! mounter both emit an ordered list of operations; applying the list in
//! order reproduces exactly the mount sequence the overlay needs, and
//! tests can inspect plans without touching a real mount table.

pub mod magic;
pub mod simple;

use std::fs;
use std::path::{Path, PathBuf};

use crate::utils::{
    bind_mount, clone_symlink, copy_afc, mount_tmpfs, setattr, FileAttr,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountOp {
    /// Bind-mount a file or directory onto its target.
    Bind { src: PathBuf, dst: PathBuf },
    /// Mount a fresh tmpfs at a skeletonized directory.
    Tmpfs { dst: PathBuf },
    /// Restore captured attributes onto a synthesized node.
    SetAttr { dst: PathBuf, attr: FileAttr },
    /// Skeleton placeholder directory.
    Mkdir { dst: PathBuf },
    /// Skeleton placeholder regular file.
    Touch { dst: PathBuf },
    /// Copy a symlink from module or mirror; symlinks are never mounted.
    CloneLink { src: PathBuf, dst: PathBuf },
    /// Archive-copy a subtree (the separate-vendor resolution copy).
    CopyTree { src: PathBuf, dst: PathBuf },
}

impl MountOp {
    /// The path in the live tree this op lands a mount on, if any.
    pub fn mount_target(&self) -> Option<&Path> {
        match self {
            MountOp::Bind { dst, .. } | MountOp::Tmpfs { dst } => Some(dst),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct MountPlan {
    pub ops: Vec<MountOp>,
}

impl MountPlan {
    pub fn new() -> Self {
        MountPlan::default()
    }

    pub fn push(&mut self, op: MountOp) {
        self.ops.push(op);
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// All bind/tmpfs targets, in emission order.
    pub fn mount_targets(&self) -> impl Iterator<Item = &Path> {
        self.ops.iter().filter_map(MountOp::mount_target)
    }

    pub fn log_summary(&self) {
        let binds = self
            .ops
            .iter()
            .filter(|op| matches!(op, MountOp::Bind { .. }))
            .count();
        let skeletons = self
            .ops
            .iter()
            .filter(|op| matches!(op, MountOp::Tmpfs { .. }))
            .count();
        log::info!("* Mount plan: {binds} binds, {skeletons} skeletons, {} ops", self.ops.len());
    }

    /// Applies the plan in order. The overlay is best-effort: a failed op
    /// is logged and the rest of the plan continues. Returns the number
    /// of ops that succeeded.
    pub fn apply(&self) -> usize {
        let mut applied = 0;
        for op in &self.ops {
            let result = match op {
                MountOp::Bind { src, dst } => bind_mount(src, dst),
                MountOp::Tmpfs { dst } => mount_tmpfs(dst),
                MountOp::SetAttr { dst, attr } => setattr(dst, attr),
                MountOp::Mkdir { dst } => fs::create_dir_all(dst).map_err(Into::into),
                MountOp::Touch { dst } => fs::File::create(dst).map(drop).map_err(Into::into),
                MountOp::CloneLink { src, dst } => clone_symlink(src, dst),
                MountOp::CopyTree { src, dst } => {
                    log::debug!("copy_link: {} <- {}", dst.display(), src.display());
                    copy_afc(src, dst)
                }
            };
            match result {
                Ok(()) => applied += 1,
                Err(e) => log::error!("mount op failed: {e:#}"),
            }
        }
        applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mount_targets_cover_binds_and_tmpfs_only() {
        let mut plan = MountPlan::new();
        plan.push(MountOp::Mkdir { dst: "/a".into() });
        plan.push(MountOp::Tmpfs { dst: "/b".into() });
        plan.push(MountOp::Bind { src: "/m".into(), dst: "/c".into() });
        plan.push(MountOp::CloneLink { src: "/m/l".into(), dst: "/d".into() });

        let targets: Vec<_> = plan.mount_targets().collect();
        assert_eq!(targets, vec![Path::new("/b"), Path::new("/c")]);
    }
}
