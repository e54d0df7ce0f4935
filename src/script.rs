//! Boot-stage script execution. Scripts run sequentially through `sh`
//! with a PATH matched to the stage: post-fs-data runs before the real
//! system is patched, so its PATH points into the read-only mirrors.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::Command;

use anyhow::Result;

use crate::defs::{BBPATH, DISABLE_FILE_NAME, MIRRDIR};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    PostFsData,
    Service,
}

impl Stage {
    pub fn name(self) -> &'static str {
        match self {
            Stage::PostFsData => "post-fs-data",
            Stage::Service => "service",
        }
    }

    /// PATH policy for scripts of this stage.
    pub fn path_env(self) -> String {
        match self {
            Stage::PostFsData => format!(
                "{BBPATH}:/sbin:{MIRRDIR}/system/bin:{MIRRDIR}/system/xbin:{MIRRDIR}/vendor/bin"
            ),
            Stage::Service => {
                let path = std::env::var("PATH").unwrap_or_default();
                format!("{BBPATH}:{path}")
            }
        }
    }
}

fn run_script(stage: Stage, script: &Path, tag: &str) {
    log::info!("{tag}: exec [{}]", script.display());
    let result = Command::new("sh")
        .arg(script)
        .env("PATH", stage.path_env())
        .status();
    match result {
        Ok(status) if status.success() => {}
        Ok(status) => log::warn!("{tag}: [{}] exit {status}", script.display()),
        Err(e) => log::warn!("{tag}: [{}] spawn failed: {e}", script.display()),
    }
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Runs every executable in `<core_dir>/<stage>.d`, sequentially, in
/// directory-sorted order. Non-executable entries are skipped; non-zero
/// exits are logged and do not abort the sequence.
pub fn exec_common_scripts<P: AsRef<Path>>(core_dir: P, stage: Stage) -> Result<()> {
    let dir = core_dir.as_ref().join(format!("{}.d", stage.name()));
    let entries = match std::fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(_) => return Ok(()),
    };

    let mut scripts: Vec<_> = entries
        .flatten()
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .map(|e| e.path())
        .collect();
    scripts.sort();

    for script in scripts {
        if !is_executable(&script) {
            continue;
        }
        run_script(stage, &script, &format!("{}.d", stage.name()));
    }
    Ok(())
}

/// Runs `<module>/<stage>.sh` for each active module, skipping modules
/// with a disable marker.
pub fn exec_module_scripts<P: AsRef<Path>>(
    module_root: P,
    modules: &[String],
    stage: Stage,
) -> Result<()> {
    let module_root = module_root.as_ref();
    for module in modules {
        let dir = module_root.join(module);
        let script = dir.join(format!("{}.sh", stage.name()));
        if !script.exists() || dir.join(DISABLE_FILE_NAME).exists() {
            continue;
        }
        run_script(stage, &script, module);
    }
    Ok(())
}
