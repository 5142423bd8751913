// Copyright 2026 Hymo Developers
// SPDX-License-Identifier: GPL-3.0-or-later

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::defs;

/// Per-module delivery strategy. `Auto` lets the planner pick HymoFS when
/// the kernel driver is usable and fall back to overlay otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleMode {
    #[default]
    Auto,
    Magic,
    Overlay,
}

impl ModuleMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "auto" => Some(ModuleMode::Auto),
            "magic" => Some(ModuleMode::Magic),
            "overlay" => Some(ModuleMode::Overlay),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleMode::Auto => "auto",
            ModuleMode::Magic => "magic",
            ModuleMode::Overlay => "overlay",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_moduledir")]
    pub moduledir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tempdir: Option<PathBuf>,
    #[serde(default = "default_mountsource")]
    pub mountsource: String,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub force_ext4: bool,
    #[serde(default)]
    pub disable_umount: bool,
    #[serde(default)]
    pub enable_nuke: bool,
    #[serde(default)]
    pub ignore_protocol_mismatch: bool,
    /// Extra partition names beyond the builtins. Builtins are never listed
    /// here, the planner always appends them itself.
    #[serde(default)]
    pub partitions: Vec<String>,
    #[serde(skip)]
    pub module_modes: HashMap<String, ModuleMode>,
}

fn default_moduledir() -> PathBuf {
    PathBuf::from(defs::MODULES_DIR)
}

fn default_mountsource() -> String {
    defs::DEFAULT_MOUNT_SOURCE.to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            moduledir: default_moduledir(),
            tempdir: None,
            mountsource: default_mountsource(),
            verbose: false,
            force_ext4: false,
            disable_umount: false,
            enable_nuke: false,
            ignore_protocol_mismatch: false,
            partitions: Vec::new(),
            module_modes: HashMap::new(),
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).context("failed to read config file")?;

        let mut config: Config = toml::from_str(&content).context("failed to parse config file")?;
        config
            .partitions
            .retain(|p| !defs::BUILTIN_PARTITIONS.contains(&p.as_str()));
        config.module_modes = load_module_modes(Path::new(defs::MODULE_MODE_FILE));

        Ok(config)
    }

    pub fn load_default() -> Result<Self> {
        Self::from_file(defs::CONFIG_FILE)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self).context("failed to serialize config")?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent).context("failed to create config directory")?;
        }

        fs::write(path.as_ref(), content).context("failed to write config file")?;

        Ok(())
    }

    pub fn merge_with_cli(
        &mut self,
        moduledir: Option<PathBuf>,
        tempdir: Option<PathBuf>,
        mountsource: Option<String>,
        verbose: bool,
        partitions: Vec<String>,
    ) {
        if let Some(dir) = moduledir {
            self.moduledir = dir;
        }

        if let Some(dir) = tempdir {
            self.tempdir = Some(dir);
        }

        if let Some(source) = mountsource {
            self.mountsource = source;
        }

        if verbose {
            self.verbose = true;
        }

        if !partitions.is_empty() {
            self.partitions = partitions;
            self.partitions
                .retain(|p| !defs::BUILTIN_PARTITIONS.contains(&p.as_str()));
        }
    }

    /// Builtin partitions followed by the configured extras.
    pub fn all_partitions(&self) -> Vec<String> {
        let mut parts: Vec<String> = defs::BUILTIN_PARTITIONS
            .iter()
            .map(|s| s.to_string())
            .collect();
        for extra in &self.partitions {
            if !parts.contains(extra) {
                parts.push(extra.clone());
            }
        }
        parts
    }

    pub fn module_mode(&self, id: &str) -> ModuleMode {
        self.module_modes.get(id).copied().unwrap_or_default()
    }
}

/// Parse `module_mode.conf`: one `module_id = mode` per line, `#` comments,
/// mode case-insensitive. Unknown modes are dropped with a warning.
pub fn load_module_modes(path: &Path) -> HashMap<String, ModuleMode> {
    let mut modes = HashMap::new();

    let Ok(content) = fs::read_to_string(path) else {
        return modes;
    };

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((id, mode)) = line.split_once('=') else {
            continue;
        };

        let id = id.trim().trim_matches('"');
        let mode_str = mode.trim().trim_matches('"');

        match ModuleMode::parse(mode_str) {
            Some(mode) if !id.is_empty() => {
                modes.insert(id.to_string(), mode);
            }
            _ => {
                log::warn!("Ignoring invalid module mode line: {}", line);
            }
        }
    }

    modes
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn config_parses_known_keys() {
        let toml = r#"
            moduledir = "/tmp/mods"
            mountsource = "KSU"
            verbose = true
            force_ext4 = false
            disable_umount = true
            enable_nuke = false
            partitions = ["mi_ext", "system"]
        "#;

        let mut config: Config = toml::from_str(toml).unwrap();
        config
            .partitions
            .retain(|p| !defs::BUILTIN_PARTITIONS.contains(&p.as_str()));

        assert_eq!(config.moduledir, PathBuf::from("/tmp/mods"));
        assert!(config.verbose);
        assert!(config.disable_umount);
        assert!(!config.force_ext4);
        // builtins never survive into the extras list
        assert_eq!(config.partitions, vec!["mi_ext".to_string()]);
    }

    #[test]
    fn config_tolerates_missing_keys() {
        let config: Config = toml::from_str("verbose = true").unwrap();

        assert_eq!(config.moduledir, PathBuf::from(defs::MODULES_DIR));
        assert_eq!(config.mountsource, defs::DEFAULT_MOUNT_SOURCE);
        assert!(!config.ignore_protocol_mismatch);
    }

    #[test]
    fn module_modes_lowercased_and_filtered() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "# comment").unwrap();
        writeln!(file, "alpha = MAGIC").unwrap();
        writeln!(file, "beta = Overlay").unwrap();
        writeln!(file, "gamma = bogus").unwrap();
        writeln!(file, "delta=auto").unwrap();

        let modes = load_module_modes(file.path());

        assert_eq!(modes.get("alpha"), Some(&ModuleMode::Magic));
        assert_eq!(modes.get("beta"), Some(&ModuleMode::Overlay));
        assert_eq!(modes.get("delta"), Some(&ModuleMode::Auto));
        assert!(!modes.contains_key("gamma"));
    }

    #[test]
    fn all_partitions_keeps_builtins_first() {
        let config = Config {
            partitions: vec!["mi_ext".to_string()],
            ..Default::default()
        };

        let parts = config.all_partitions();
        assert_eq!(parts[0], "system");
        assert!(parts.contains(&"mi_ext".to_string()));
        assert_eq!(
            parts.len(),
            defs::BUILTIN_PARTITIONS.len() + 1
        );
    }
}
