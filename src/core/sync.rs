// Copyright 2026 Hymo Developers
// SPDX-License-Identifier: GPL-3.0-or-later

use std::{collections::HashSet, fs, path::Path};

use anyhow::Result;
use rayon::prelude::*;
use walkdir::WalkDir;

use crate::{
    conf::config::Config,
    core::inventory::Module,
    defs, utils,
    utils::xattr::{copy_path_context, lgetfilecon, lsetfilecon, set_overlay_opaque},
};

/// Bring the mirror into a state where each active module's tree is present
/// under `storage_root/<id>/` with contexts safe to expose via mounts.
/// Per-module failures are logged and never abort the run.
pub fn perform_sync(modules: &[Module], storage_root: &Path, config: &Config) -> Result<()> {
    log::info!("Starting smart module sync to {}", storage_root.display());

    let all_partitions = config.all_partitions();

    prune_orphaned_modules(modules, storage_root)?;

    modules.par_iter().for_each(|module| {
        let dst = storage_root.join(&module.id);

        if !has_content(&module.source_path, &all_partitions) {
            log::debug!("Skipping empty module: {}", module.id);
            return;
        }

        if !should_sync(&module.source_path, &dst) {
            log::debug!("Skipping module: {} (up-to-date)", module.id);
            return;
        }

        log::info!("Syncing module: {} (updated/new)", module.id);

        if dst.exists()
            && let Err(e) = fs::remove_dir_all(&dst)
        {
            log::warn!("Failed to clean target dir for {}: {}", module.id, e);
        }

        if let Err(e) = utils::sync_dir(&module.source_path, &dst) {
            log::error!("Failed to sync module {}: {:#}", module.id, e);
            return;
        }

        if let Err(e) = apply_overlay_opaque_flags(&dst) {
            log::warn!("Failed to apply opaque xattrs for {}: {:#}", module.id, e);
        }

        repair_module_contexts(&dst, &module.id, &all_partitions);
    });

    log::info!("Module sync completed.");
    Ok(())
}

/// Remove mirror children that are neither reserved names nor active ids.
fn prune_orphaned_modules(modules: &[Module], storage_root: &Path) -> Result<()> {
    if !storage_root.exists() {
        return Ok(());
    }

    let active_ids: HashSet<&str> = modules.iter().map(|m| m.id.as_str()).collect();

    for entry in fs::read_dir(storage_root)?.flatten() {
        let name_os = entry.file_name();
        let name = name_os.to_string_lossy();

        if defs::RESERVED_MODULE_IDS.contains(&name.as_ref()) || active_ids.contains(name.as_ref())
        {
            continue;
        }

        log::info!("Pruning orphaned module storage: {}", name);

        let path = entry.path();
        let result = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };

        if let Err(e) = result {
            log::warn!("Failed to remove orphan {}: {}", name, e);
        }
    }

    Ok(())
}

/// A module needs a re-copy when its mirror is missing or its module.prop
/// differs byte-for-byte from the source.
fn should_sync(src: &Path, dst: &Path) -> bool {
    if !dst.exists() {
        return true;
    }

    let src_prop = src.join("module.prop");
    let dst_prop = dst.join("module.prop");

    if !src_prop.exists() || !dst_prop.exists() {
        return true;
    }

    match (fs::read(&src_prop), fs::read(&dst_prop)) {
        (Ok(s), Ok(d)) => s != d,
        _ => true,
    }
}

fn has_content(module_path: &Path, all_partitions: &[String]) -> bool {
    all_partitions
        .iter()
        .any(|p| utils::has_files_recursive(&module_path.join(p)))
}

/// Directories holding a `.replace` marker become opaque so overlay serves
/// only the module's copy.
fn apply_overlay_opaque_flags(root: &Path) -> Result<()> {
    for entry in WalkDir::new(root).min_depth(1).into_iter().flatten() {
        if entry.file_type().is_file()
            && entry.file_name() == defs::REPLACE_DIR_FILE_NAME
            && let Some(parent) = entry.path().parent()
        {
            set_overlay_opaque(parent)?;
            log::debug!("Set overlay opaque xattr on: {}", parent.display());
        }
    }
    Ok(())
}

fn repair_module_contexts(module_root: &Path, module_id: &str, all_partitions: &[String]) {
    log::debug!("Repairing SELinux contexts for module: {}", module_id);

    for partition in all_partitions {
        let part_root = module_root.join(partition);

        if part_root.is_dir()
            && let Err(e) = recursive_context_repair(module_root, &part_root)
        {
            log::warn!(
                "Context repair failed for {}/{}: {:#}",
                module_id,
                partition,
                e
            );
        }
    }
}

/// `upperdir`/`workdir` are overlay-internal names that should never appear
/// inside a module tree; when they do, inherit the parent's context instead
/// of a stock system one. Everything else takes the context of its existing
/// system counterpart.
fn recursive_context_repair(base: &Path, current: &Path) -> Result<()> {
    let file_name = current.file_name().and_then(|n| n.to_str()).unwrap_or("");

    if file_name == "upperdir" || file_name == "workdir" {
        if let Some(parent) = current.parent()
            && let Ok(parent_ctx) = lgetfilecon(parent)
        {
            let _ = lsetfilecon(current, &parent_ctx);
        }
    } else if let Ok(relative) = current.strip_prefix(base) {
        let system_path = Path::new("/").join(relative);

        if system_path.exists() || system_path.is_symlink() {
            let _ = copy_path_context(&system_path, current);
        }
    }

    if current.is_dir() && !current.is_symlink() {
        for entry in fs::read_dir(current)?.flatten() {
            recursive_context_repair(base, &entry.path())?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::config::ModuleMode;
    use std::os::unix::fs::symlink;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn module(root: &Path, id: &str, prop: &str) -> Module {
        let dir = root.join(id);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("module.prop"), prop).unwrap();
        Module {
            id: id.to_string(),
            source_path: dir,
            mode: ModuleMode::Auto,
            name: String::new(),
            version: String::new(),
            author: String::new(),
            description: String::new(),
        }
    }

    fn mtime_map(root: &Path) -> Vec<(PathBuf, std::time::SystemTime)> {
        WalkDir::new(root)
            .into_iter()
            .flatten()
            .map(|e| {
                let mtime = e.path().symlink_metadata().unwrap().modified().unwrap();
                (e.path().to_path_buf(), mtime)
            })
            .collect()
    }

    #[test]
    fn contentless_module_is_not_copied() {
        let dir = tempdir().unwrap();
        let src_root = dir.path().join("modules");
        let mirror = dir.path().join("mirror");
        fs::create_dir_all(&mirror).unwrap();

        let m = module(&src_root, "m1", "name=Empty\n");

        perform_sync(&[m], &mirror, &Config::default()).unwrap();

        assert!(!mirror.join("m1").exists());
    }

    #[test]
    fn sync_copies_and_prunes() {
        let dir = tempdir().unwrap();
        let src_root = dir.path().join("modules");
        let mirror = dir.path().join("mirror");
        fs::create_dir_all(mirror.join("stale_module")).unwrap();
        fs::create_dir_all(mirror.join("lost+found")).unwrap();

        let m = module(&src_root, "m1", "name=M1\n");
        fs::create_dir_all(m.source_path.join("system/etc")).unwrap();
        fs::write(m.source_path.join("system/etc/hosts"), b"127.0.0.1\n").unwrap();
        symlink("hosts", m.source_path.join("system/etc/hosts.bak")).unwrap();

        perform_sync(&[m.clone()], &mirror, &Config::default()).unwrap();

        assert!(!mirror.join("stale_module").exists());
        assert!(mirror.join("lost+found").exists());
        assert_eq!(
            fs::read(mirror.join("m1/system/etc/hosts")).unwrap(),
            b"127.0.0.1\n"
        );
        assert_eq!(
            fs::read_link(mirror.join("m1/system/etc/hosts.bak")).unwrap(),
            Path::new("hosts")
        );
        assert!(utils::dir_content_equal(&m.source_path, &mirror.join("m1")).unwrap());
    }

    #[test]
    fn sync_is_idempotent_when_prop_unchanged() {
        let dir = tempdir().unwrap();
        let src_root = dir.path().join("modules");
        let mirror = dir.path().join("mirror");

        let m = module(&src_root, "m1", "name=M1\nversion=1\n");
        fs::create_dir_all(m.source_path.join("system/app")).unwrap();
        fs::write(m.source_path.join("system/app/a.apk"), b"apk").unwrap();

        perform_sync(std::slice::from_ref(&m), &mirror, &Config::default()).unwrap();
        let before = mtime_map(&mirror.join("m1"));

        perform_sync(std::slice::from_ref(&m), &mirror, &Config::default()).unwrap();
        let after = mtime_map(&mirror.join("m1"));

        assert_eq!(before, after);
    }

    #[test]
    fn prop_change_triggers_recopy() {
        let dir = tempdir().unwrap();
        let src_root = dir.path().join("modules");
        let mirror = dir.path().join("mirror");

        let m = module(&src_root, "m1", "version=1\n");
        fs::create_dir_all(m.source_path.join("system")).unwrap();
        fs::write(m.source_path.join("system/old"), b"1").unwrap();

        perform_sync(std::slice::from_ref(&m), &mirror, &Config::default()).unwrap();

        fs::remove_file(m.source_path.join("system/old")).unwrap();
        fs::write(m.source_path.join("system/new"), b"2").unwrap();
        fs::write(m.source_path.join("module.prop"), "version=2\n").unwrap();

        perform_sync(std::slice::from_ref(&m), &mirror, &Config::default()).unwrap();

        assert!(!mirror.join("m1/system/old").exists());
        assert!(mirror.join("m1/system/new").exists());
    }
}
