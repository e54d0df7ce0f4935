//! Shared test utilities: a fake filesystem layout for the composition
//! engine, with separate module-image, mirror and live roots.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use magiskd::mount::magic::MagicMount;
use magiskd::mount::MountPlan;
use magiskd::node::Node;

pub struct OverlayEnv {
    /// Temporary directory (kept alive for the lifetime of the env)
    pub _temp_dir: TempDir,
    /// Fake module image root (one subdirectory per module)
    pub modules: PathBuf,
    /// Fake read-only mirror of the live tree
    pub mirror: PathBuf,
    /// Fake live filesystem root (stands in for `/`)
    pub live: PathBuf,
}

impl OverlayEnv {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let base = temp_dir.path();

        let modules = base.join("img");
        let mirror = base.join("mirror");
        let live = base.join("live");
        for dir in [&modules, &mirror, &live] {
            fs::create_dir_all(dir).expect("Failed to create env dir");
        }

        Self {
            _temp_dir: temp_dir,
            modules,
            mirror,
            live,
        }
    }

    pub fn engine(&self, separate_vendor: bool) -> MagicMount {
        MagicMount::new(&self.modules, &self.mirror, &self.live, separate_vendor)
    }

    /// Creates an empty file (and its parents) under the live root, and
    /// mirrors it so skeleton synthesis sees the same shape.
    pub fn live_file(&self, rel: &str) {
        touch(&self.live.join(rel));
        touch(&self.mirror.join(rel));
    }

    /// Creates a directory under both the live root and the mirror.
    pub fn live_dir(&self, rel: &str) {
        fs::create_dir_all(self.live.join(rel)).unwrap();
        fs::create_dir_all(self.mirror.join(rel)).unwrap();
    }

    /// Creates an empty file under a module's override tree.
    pub fn module_file(&self, module: &str, rel: &str) {
        touch(&self.modules.join(module).join(rel));
    }

    pub fn module_dir(&self, module: &str, rel: &str) {
        fs::create_dir_all(self.modules.join(module).join(rel)).unwrap();
    }

    /// Runs the full composition: tree construction per module in order,
    /// vendor extraction, plan emission for both trees.
    pub fn compose(&self, separate_vendor: bool, modules: &[&str]) -> MountPlan {
        let engine = self.engine(separate_vendor);
        let mut tree = Node::new_root("system");
        for module in modules {
            engine
                .create_module_tree(&mut tree, module)
                .expect("tree construction");
        }
        let vendor = engine.extract_vendor(&mut tree);

        let mut plan = MountPlan::new();
        engine.emit(&mut tree, &mut plan).expect("emit system");
        if let Some(mut vendor) = vendor {
            engine.emit(&mut vendor, &mut plan).expect("emit vendor");
        }
        plan
    }
}

pub fn touch(path: &Path) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    File::create(path).unwrap();
}

/// No two emitted mounts may share a target path.
pub fn assert_unique_targets(plan: &MountPlan) {
    let targets: Vec<_> = plan.mount_targets().collect();
    let mut seen = std::collections::HashSet::new();
    for target in &targets {
        assert!(seen.insert(*target), "duplicate mount target: {}", target.display());
    }
}
