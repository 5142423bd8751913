// Copyright 2026 Hymo Developers
// SPDX-License-Identifier: GPL-3.0-or-later

use std::{
    fs,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
    sync::OnceLock,
};

use anyhow::Result;
use rayon::prelude::*;
use regex_lite::Regex;
use serde::Serialize;

use crate::{
    conf::config::{Config, ModuleMode},
    defs, utils,
};

static MODULE_PROP_REGEX: OnceLock<Regex> = OnceLock::new();

#[derive(Debug, Clone, Serialize)]
pub struct Module {
    pub id: String,
    pub source_path: PathBuf,
    pub mode: ModuleMode,
    pub name: String,
    pub version: String,
    pub author: String,
    pub description: String,
}

fn parse_module_prop(module: &mut Module, prop_path: &Path) {
    let re = MODULE_PROP_REGEX.get_or_init(|| {
        Regex::new(r"^([a-zA-Z0-9_.]+)=(.*)$").expect("Failed to compile module prop regex")
    });

    let Ok(file) = fs::File::open(prop_path) else {
        return;
    };

    for line in BufReader::new(file).lines().map_while(Result::ok) {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(caps) = re.captures(line) {
            let k = caps.get(1).map_or("", |m| m.as_str());
            let v = caps.get(2).map_or("", |m| m.as_str());

            match k {
                "name" => module.name = v.to_string(),
                "version" => module.version = v.to_string(),
                "author" => module.author = v.to_string(),
                "description" => module.description = v.to_string(),
                _ => {}
            }
        }
    }
}

fn has_skip_marker(path: &Path) -> bool {
    path.join(defs::DISABLE_FILE_NAME).exists()
        || path.join(defs::REMOVE_FILE_NAME).exists()
        || path.join(defs::SKIP_MOUNT_FILE_NAME).exists()
}

/// Enumerate module directories under `source_dir`. Reserved ids and
/// modules carrying a skip marker are dropped; the result is sorted by id
/// descending so ids later in the alphabet get overlay priority.
pub fn scan(source_dir: &Path, config: &Config) -> Result<Vec<Module>> {
    if !source_dir.exists() {
        return Ok(Vec::new());
    }

    let dir_entries = fs::read_dir(source_dir)?.collect::<std::io::Result<Vec<_>>>()?;

    let mut modules: Vec<Module> = dir_entries
        .into_par_iter()
        .filter_map(|entry| {
            let path = entry.path();

            if !path.is_dir() {
                return None;
            }

            let id = entry.file_name().to_string_lossy().to_string();

            if defs::RESERVED_MODULE_IDS.contains(&id.as_str()) {
                return None;
            }

            if has_skip_marker(&path) {
                return None;
            }

            let mut module = Module {
                mode: config.module_mode(&id),
                id,
                source_path: path.clone(),
                name: String::new(),
                version: String::new(),
                author: String::new(),
                description: String::new(),
            };

            parse_module_prop(&mut module, &path.join("module.prop"));

            Some(module)
        })
        .collect();

    modules.sort_by(|a, b| b.id.cmp(&a.id));

    Ok(modules)
}

#[derive(Serialize)]
struct ModuleInfo<'a> {
    id: &'a str,
    path: String,
    mode: &'static str,
    name: &'a str,
    version: &'a str,
    author: &'a str,
    description: &'a str,
}

pub fn print_module_list(config: &Config) -> Result<()> {
    let modules = scan(&config.moduledir, config)?;
    let all_partitions = config.all_partitions();

    let infos: Vec<ModuleInfo> = modules
        .iter()
        .filter(|m| {
            all_partitions
                .iter()
                .any(|p| utils::has_files_recursive(&m.source_path.join(p)))
        })
        .map(|m| ModuleInfo {
            id: &m.id,
            path: m.source_path.display().to_string(),
            mode: m.mode.as_str(),
            name: &m.name,
            version: &m.version,
            author: &m.author,
            description: &m.description,
        })
        .collect();

    println!("{}", serde_json::to_string_pretty(&infos)?);

    Ok(())
}

/// Rewrite the `description=` line of this framework's own module.prop so
/// the manager app shows the outcome of the last run.
pub fn update_description(
    success: bool,
    storage_mode: &str,
    nuke_active: bool,
    hymofs_count: usize,
    overlay_count: usize,
    magic_count: usize,
    warning: Option<&str>,
) {
    let prop_path = Path::new(defs::MODULE_PROP_FILE);

    if !prop_path.exists() {
        log::warn!("module.prop not found, skipping description update");
        return;
    }

    let mut desc = format!(
        "{} Hymo | Storage: {} | Modules: {} HymoFS + {} Overlay + {} Magic",
        if success { "😋" } else { "😭" },
        storage_mode,
        hymofs_count,
        overlay_count,
        magic_count
    );
    if nuke_active {
        desc.push_str(" 🐾");
    }
    if let Some(warning) = warning {
        desc.push_str(" | ");
        desc.push_str(warning);
    }

    let Ok(file) = fs::File::open(prop_path) else {
        return;
    };

    let mut lines: Vec<String> = BufReader::new(file).lines().map_while(Result::ok).collect();
    let mut replaced = false;

    for line in &mut lines {
        if line.starts_with("description=") {
            *line = format!("description={}", desc);
            replaced = true;
        }
    }

    if !replaced {
        lines.push(format!("description={}", desc));
    }

    let content = format!("{}\n", lines.join("\n"));
    if let Err(e) = utils::atomic_write(prop_path, content) {
        log::warn!("Failed to update module description: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::tempdir;

    fn make_module(root: &Path, id: &str, prop: &str) -> PathBuf {
        let dir = root.join(id);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("module.prop"), prop).unwrap();
        dir
    }

    #[test]
    fn scan_filters_reserved_and_skip_markers() {
        let dir = tempdir().unwrap();
        let root = dir.path();

        make_module(root, "alpha", "name=Alpha\nversion=1.0\n");
        make_module(root, "hymo", "name=Self\n");
        make_module(root, "lost+found", "");
        let disabled = make_module(root, "beta", "name=Beta\n");
        File::create(disabled.join(defs::DISABLE_FILE_NAME)).unwrap();
        let removed = make_module(root, "gamma", "name=Gamma\n");
        File::create(removed.join(defs::REMOVE_FILE_NAME)).unwrap();
        let skipped = make_module(root, "delta", "name=Delta\n");
        File::create(skipped.join(defs::SKIP_MOUNT_FILE_NAME)).unwrap();
        fs::write(root.join("stray_file"), "not a module").unwrap();

        let modules = scan(root, &Config::default()).unwrap();

        assert_eq!(modules.len(), 1);
        assert_eq!(modules[0].id, "alpha");
        assert_eq!(modules[0].name, "Alpha");
        assert_eq!(modules[0].version, "1.0");
    }

    #[test]
    fn scan_sorts_descending_by_id() {
        let dir = tempdir().unwrap();
        let root = dir.path();

        for id in ["mA", "mC", "mB"] {
            make_module(root, id, "");
        }

        let modules = scan(root, &Config::default()).unwrap();
        let ids: Vec<&str> = modules.iter().map(|m| m.id.as_str()).collect();

        assert_eq!(ids, vec!["mC", "mB", "mA"]);
    }

    #[test]
    fn scan_applies_mode_overrides() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        make_module(root, "alpha", "");
        make_module(root, "beta", "");

        let mut config = Config::default();
        config
            .module_modes
            .insert("alpha".to_string(), ModuleMode::Magic);

        let modules = scan(root, &config).unwrap();

        let alpha = modules.iter().find(|m| m.id == "alpha").unwrap();
        let beta = modules.iter().find(|m| m.id == "beta").unwrap();
        assert_eq!(alpha.mode, ModuleMode::Magic);
        assert_eq!(beta.mode, ModuleMode::Auto);
    }

    #[test]
    fn prop_parser_skips_comments_and_unknown_keys() {
        let dir = tempdir().unwrap();
        let path = make_module(
            dir.path(),
            "m",
            "# comment\n\nname=My Module\nauthor=someone\nupdateJson=https://x\n",
        );

        let mut module = Module {
            id: "m".into(),
            source_path: path.clone(),
            mode: ModuleMode::Auto,
            name: String::new(),
            version: String::new(),
            author: String::new(),
            description: String::new(),
        };
        parse_module_prop(&mut module, &path.join("module.prop"));

        assert_eq!(module.name, "My Module");
        assert_eq!(module.author, "someone");
        assert!(module.version.is_empty());
    }
}
