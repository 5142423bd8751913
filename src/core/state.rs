// Copyright 2026 Hymo Developers
// SPDX-License-Identifier: GPL-3.0-or-later

use std::{fs, path::{Path, PathBuf}};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::{defs, utils};

/// Snapshot of the last run, persisted for reporting and `reload`.
/// Advisory only: whether a mount exists is always answered by
/// /proc/self/mountinfo, never by this file.
#[derive(Debug, Serialize, Deserialize, Default)]
pub struct RuntimeState {
    #[serde(default)]
    pub storage_mode: String,
    #[serde(default)]
    pub mount_point: PathBuf,
    #[serde(default)]
    pub overlay_module_ids: Vec<String>,
    #[serde(default)]
    pub magic_module_ids: Vec<String>,
    #[serde(default)]
    pub hymofs_module_ids: Vec<String>,
    /// Partition names under which any content is live.
    #[serde(default)]
    pub active_mounts: Vec<String>,
    #[serde(default)]
    pub nuke_active: bool,
    #[serde(default)]
    pub hymofs_mismatch: bool,
    #[serde(default)]
    pub mismatch_message: String,
}

impl RuntimeState {
    pub fn save(&self) -> Result<()> {
        self.save_to(Path::new(defs::STATE_FILE))
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            utils::ensure_dir_exists(parent)?;
        }

        let json = serde_json::to_string_pretty(self)?;
        utils::atomic_write(path, json)?;

        Ok(())
    }

    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(defs::STATE_FILE))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)?;
        let state = serde_json::from_str(&content)?;

        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn state_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run/daemon_state.json");

        let state = RuntimeState {
            storage_mode: "tmpfs".into(),
            mount_point: PathBuf::from("/data/adb/modules_update"),
            overlay_module_ids: vec!["mB".into()],
            magic_module_ids: vec!["mC".into()],
            hymofs_module_ids: vec!["mA".into()],
            active_mounts: vec!["system".into()],
            nuke_active: false,
            hymofs_mismatch: true,
            mismatch_message: "kernel too old".into(),
        };

        state.save_to(&path).unwrap();
        let loaded = RuntimeState::load_from(&path).unwrap();

        assert_eq!(loaded.storage_mode, "tmpfs");
        assert_eq!(loaded.overlay_module_ids, vec!["mB".to_string()]);
        assert_eq!(loaded.hymofs_module_ids, vec!["mA".to_string()]);
        assert!(loaded.hymofs_mismatch);
        assert_eq!(loaded.mismatch_message, "kernel too old");
    }

    #[test]
    fn load_tolerates_missing_fields() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("daemon_state.json");
        fs::write(&path, r#"{"storage_mode": "ext4"}"#).unwrap();

        let loaded = RuntimeState::load_from(&path).unwrap();

        assert_eq!(loaded.storage_mode, "ext4");
        assert!(loaded.overlay_module_ids.is_empty());
        assert!(!loaded.nuke_active);
        assert!(loaded.mismatch_message.is_empty());
    }

    #[test]
    fn load_missing_file_yields_default() {
        let dir = tempdir().unwrap();
        let loaded = RuntimeState::load_from(&dir.path().join("nope.json")).unwrap();

        assert!(loaded.storage_mode.is_empty());
        assert!(loaded.active_mounts.is_empty());
    }
}
