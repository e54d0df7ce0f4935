//! Module registry: enumerates active modules from the mounted image and
//! performs the per-boot marker cleanup.

use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use anyhow::Result;
use regex_lite::Regex;

use crate::defs::{
    DISABLE_FILE_NAME, REMOVE_FILE_NAME, UPDATE_FILE_NAME,
};
use crate::utils::{ensure_dir_exists, rm_rf};

static MODULE_ID_REGEX: OnceLock<Regex> = OnceLock::new();

fn valid_module_id(id: &str) -> bool {
    let re = MODULE_ID_REGEX
        .get_or_init(|| Regex::new(r"^[a-zA-Z][a-zA-Z0-9._-]+$").expect("Invalid Regex pattern"));
    re.is_match(id)
}

/// Names that can never be modules.
fn reserved_name(name: &str) -> bool {
    matches!(name, "." | ".." | ".core" | "lost+found")
}

/// Walks the mounted module image and returns the active module list.
///
/// Side effects, applied exactly once per boot:
/// - a `remove` marker deletes the whole module directory;
/// - an `update` marker is unlinked (one-shot flag);
/// - a `disable` marker excludes the module but touches nothing.
///
/// The returned order is directory order, sorted, so it is stable across
/// calls within a boot.
pub fn collect_modules<P: AsRef<Path>>(mountpoint: P) -> Result<Vec<String>> {
    let mountpoint = mountpoint.as_ref();
    let mut modules = Vec::new();

    for entry in fs::read_dir(mountpoint)?.flatten() {
        if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if reserved_name(&name) {
            continue;
        }
        if !valid_module_id(&name) {
            log::warn!("skipping invalid module id: {name}");
            continue;
        }

        let module_dir = entry.path();
        if module_dir.join(REMOVE_FILE_NAME).exists() {
            log::info!("{name}: remove");
            rm_rf(&module_dir);
            continue;
        }
        let update = module_dir.join(UPDATE_FILE_NAME);
        if update.exists() {
            let _ = fs::remove_file(update);
        }
        if module_dir.join(DISABLE_FILE_NAME).exists() {
            continue;
        }
        modules.push(name);
    }

    modules.sort();
    Ok(modules)
}

/// Read-only enumeration of the active modules: same filtering as
/// [`collect_modules`] but without the marker cleanup. Later stages use
/// this to re-derive the list settled during image preparation.
pub fn list_modules<P: AsRef<Path>>(mountpoint: P) -> Result<Vec<String>> {
    let mut modules = Vec::new();
    for entry in fs::read_dir(mountpoint.as_ref())?.flatten() {
        if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if reserved_name(&name) || !valid_module_id(&name) {
            continue;
        }
        let module_dir = entry.path();
        if module_dir.join(REMOVE_FILE_NAME).exists()
            || module_dir.join(DISABLE_FILE_NAME).exists()
        {
            continue;
        }
        modules.push(name);
    }
    modules.sort();
    Ok(modules)
}

/// Creates the standard core subdirectories if absent.
pub fn ensure_core_dirs<P: AsRef<Path>>(coredir: P) -> Result<()> {
    let coredir = coredir.as_ref();
    ensure_dir_exists(coredir)?;
    for sub in ["post-fs-data.d", "service.d", "props"] {
        ensure_dir_exists(coredir.join(sub))?;
    }
    Ok(())
}
