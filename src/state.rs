//! Runtime state snapshot written after the mount phase so the manager
//! app can show what this boot actually did. Best-effort; nothing in the
//! boot flow reads it back.

use std::path::Path;

use anyhow::Result;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct RuntimeState {
    pub modules: Vec<String>,
    pub mounts_emitted: usize,
    pub separate_vendor: bool,
    pub core_only: bool,
}

impl RuntimeState {
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_round_trips_as_json() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state.json");
        let state = RuntimeState {
            modules: vec!["a".into(), "b".into()],
            mounts_emitted: 7,
            separate_vendor: true,
            core_only: false,
        };
        state.save(&path).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["modules"][1], "b");
        assert_eq!(value["mounts_emitted"], 7);
        assert_eq!(value["separate_vendor"], true);
    }
}
