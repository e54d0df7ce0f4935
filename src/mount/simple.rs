//! Simple mount: precedence-free file-by-file binds from a flat override
//! directory. Used while the composition engine is out of the picture
//! (startup, uninstall, core-only). Targets that do not exist in the live
//! tree are skipped, never created.

use std::fs;
use std::path::Path;

use anyhow::Result;

use crate::mount::{MountOp, MountPlan};
use crate::utils::getattr;

/// Emits binds for every regular file under `overlay_root/<rel>` whose
/// counterpart exists under `live_root/<rel>`. Attributes are cloned from
/// the live target onto the overlay file first so the bind presents the
/// original mode, owner and context.
pub fn emit<P: AsRef<Path>>(
    overlay_root: P,
    live_root: P,
    rel: &Path,
    plan: &mut MountPlan,
) -> Result<()> {
    let overlay_root = overlay_root.as_ref();
    let live_root = live_root.as_ref();

    let dir = overlay_root.join(rel);
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(_) => return Ok(()),
    };

    for entry in entries.flatten() {
        let name = entry.file_name();
        let child_rel = rel.join(&name);
        let target = live_root.join(&child_rel);
        // only mount over existing files
        if !target.exists() {
            continue;
        }
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            emit(overlay_root, live_root, &child_rel, plan)?;
        } else if file_type.is_file() {
            let src = overlay_root.join(&child_rel);
            if let Ok(attr) = getattr(&target) {
                plan.push(MountOp::SetAttr {
                    dst: src.clone(),
                    attr,
                });
            }
            plan.push(MountOp::Bind { src, dst: target });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::path::PathBuf;

    fn setup() -> (tempfile::TempDir, PathBuf, PathBuf) {
        let tmp = tempfile::tempdir().unwrap();
        let overlay = tmp.path().join("overlay");
        let live = tmp.path().join("live");
        fs::create_dir_all(&overlay).unwrap();
        fs::create_dir_all(&live).unwrap();
        (tmp, overlay, live)
    }

    #[test]
    fn missing_targets_are_skipped() {
        let (_tmp, overlay, live) = setup();
        fs::create_dir_all(overlay.join("system/etc")).unwrap();
        File::create(overlay.join("system/etc/hosts")).unwrap();
        File::create(overlay.join("system/etc/extra")).unwrap();
        fs::create_dir_all(live.join("system/etc")).unwrap();
        File::create(live.join("system/etc/hosts")).unwrap();

        let mut plan = MountPlan::new();
        emit(&overlay, &live, Path::new("system"), &mut plan).unwrap();

        let targets: Vec<_> = plan.mount_targets().collect();
        assert_eq!(targets, vec![live.join("system/etc/hosts").as_path()]);
        // the missing target was not created
        assert!(!live.join("system/etc/extra").exists());
    }

    #[test]
    fn attrs_cloned_before_bind() {
        let (_tmp, overlay, live) = setup();
        fs::create_dir_all(overlay.join("vendor")).unwrap();
        File::create(overlay.join("vendor/fw.bin")).unwrap();
        fs::create_dir_all(live.join("vendor")).unwrap();
        File::create(live.join("vendor/fw.bin")).unwrap();

        let mut plan = MountPlan::new();
        emit(&overlay, &live, Path::new("vendor"), &mut plan).unwrap();

        match &plan.ops[..] {
            [MountOp::SetAttr { dst, .. }, MountOp::Bind { src, dst: target }] => {
                assert_eq!(dst, &overlay.join("vendor/fw.bin"));
                assert_eq!(src, &overlay.join("vendor/fw.bin"));
                assert_eq!(target, &live.join("vendor/fw.bin"));
            }
            other => panic!("unexpected plan: {other:?}"),
        }
    }
}
