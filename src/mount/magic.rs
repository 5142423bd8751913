// Copyright 2026 Hymo Developers
// SPDX-License-Identifier: GPL-3.0-or-later

use std::{
    fs,
    os::unix::fs::{FileTypeExt, MetadataExt},
    path::{Path, PathBuf},
};

use anyhow::Result;

use crate::{conf::config::Config, mount::overlay::bind_mount_rec};

/// Recursively bind-mount a module tree onto its system-path counterparts.
/// Modules are processed in reverse priority order so a higher-priority
/// module's bind lands last and wins.
pub fn mount_modules(module_paths: &[PathBuf], config: &Config) -> Result<()> {
    let all_partitions = config.all_partitions();

    for module_path in module_paths.iter().rev() {
        log::info!("Magic mounting module tree: {}", module_path.display());

        for partition in &all_partitions {
            let part_root = module_path.join(partition);
            if !part_root.is_dir() || part_root.is_symlink() {
                continue;
            }

            let system_target = Path::new("/").join(partition);
            if !system_target.is_dir() {
                log::debug!(
                    "Magic: partition /{} absent on host, skipping",
                    partition
                );
                continue;
            }

            if let Err(e) = mount_subtree(&part_root, &system_target, config.disable_umount) {
                log::warn!(
                    "Magic mount failed for {}/{}: {:#}",
                    module_path.display(),
                    partition,
                    e
                );
            }
        }
    }

    Ok(())
}

fn mount_subtree(module_dir: &Path, system_dir: &Path, disable_umount: bool) -> Result<()> {
    for entry in fs::read_dir(module_dir)?.flatten() {
        let src = entry.path();
        let target = system_dir.join(entry.file_name());

        let Ok(meta) = src.symlink_metadata() else {
            continue;
        };
        let ft = meta.file_type();

        if ft.is_char_device() && meta.rdev() == 0 {
            // Whiteouts cannot be expressed by bind mounts.
            log::debug!("Magic: skipping whiteout {}", src.display());
            continue;
        }

        if ft.is_dir() {
            if target.is_dir() && !target.is_symlink() {
                mount_subtree(&src, &target, disable_umount)?;
            } else {
                log::debug!(
                    "Magic: cannot add directory {} (no stock counterpart)",
                    target.display()
                );
            }
            continue;
        }

        if ft.is_symlink() {
            log::debug!(
                "Magic: skipping symlink {} (bind mounts cannot carry links)",
                src.display()
            );
            continue;
        }

        if !target.exists() {
            log::debug!(
                "Magic: cannot add file {} (no stock counterpart)",
                target.display()
            );
            continue;
        }

        if let Err(e) = bind_mount_rec(&src, &target, disable_umount) {
            log::warn!("Magic: bind failed for {}: {:#}", target.display(), e);
        }
    }

    Ok(())
}
