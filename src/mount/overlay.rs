// Copyright 2026 Hymo Developers
// SPDX-License-Identifier: GPL-3.0-or-later

use std::{
    env,
    ffi::{CStr, CString},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use procfs::process::Process;
use rustix::{
    fd::AsFd,
    fs::CWD,
    mount::{
        FsMountFlags, FsOpenFlags, MountAttrFlags, MountFlags, MoveMountFlags, OpenTreeFlags,
        fsconfig_create, fsconfig_set_string, fsmount, fsopen, mount, move_mount, open_tree,
    },
};

use crate::{
    defs,
    utils::xattr::{lgetfilecon, lsetfilecon},
};

#[cfg(any(target_os = "linux", target_os = "android"))]
use crate::mount::try_umount::send_unmountable;

fn notify_unmountable(path: &Path, disable_umount: bool) {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    if !disable_umount {
        let _ = send_unmountable(path);
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let _ = (path, disable_umount);
}

fn get_overlay_features() -> String {
    let mut features = String::new();

    if Path::new("/sys/module/overlay/parameters/redirect_dir").exists() {
        features.push_str(",redirect_dir=on");
    }

    if Path::new("/sys/module/overlay/parameters/metacopy").exists() {
        if !features.contains("redirect_dir") {
            features.push_str(",redirect_dir=on");
        }
        features.push_str(",metacopy=on");
    }

    features
}

/// Mountpoints strictly beneath `target`, deduplicated and sorted shallow
/// first. /proc/self/mountinfo is the authority here, never persisted state.
fn get_child_mounts(target: &Path) -> Result<Vec<PathBuf>> {
    let process = Process::myself().context("Failed to read own proc entry")?;
    let mountinfo = process.mountinfo().context("Failed to parse mountinfo")?;

    let mut mounts: Vec<PathBuf> = mountinfo
        .into_iter()
        .map(|m| m.mount_point)
        .filter(|mp| mp.starts_with(target) && mp.as_path() != target)
        .collect();

    mounts.sort();
    mounts.dedup();
    mounts.sort_by_key(|p| p.as_os_str().len());

    Ok(mounts)
}

/// Mount an overlay composed of `lowerdir_config` onto `dest`, preferring
/// the new mount API and falling back to mount(2). The target's SELinux
/// context is carried over onto the mount root.
fn do_mount_overlay(lowerdir_config: &str, dest: &Path, mount_source: &str) -> Result<()> {
    let root_context = lgetfilecon(dest).ok();
    let extra_features = get_overlay_features();

    let result = (|| {
        let fs = fsopen("overlay", FsOpenFlags::FSOPEN_CLOEXEC)?;
        let fs = fs.as_fd();

        fsconfig_set_string(fs, "lowerdir", lowerdir_config)?;

        if extra_features.contains("redirect_dir") {
            let _ = fsconfig_set_string(fs, "redirect_dir", "on");
        }
        if extra_features.contains("metacopy") {
            let _ = fsconfig_set_string(fs, "metacopy", "on");
        }

        fsconfig_set_string(fs, "source", mount_source)?;
        fsconfig_create(fs)?;

        let mnt = fsmount(fs, FsMountFlags::FSMOUNT_CLOEXEC, MountAttrFlags::empty())?;

        move_mount(
            mnt.as_fd(),
            "",
            CWD,
            dest,
            MoveMountFlags::MOVE_MOUNT_F_EMPTY_PATH,
        )
    })();

    if let Err(fsopen_err) = result {
        let data = format!("lowerdir={lowerdir_config}{extra_features}");
        let data_c = CString::new(data).context("Invalid string for mount data")?;

        mount(
            mount_source,
            dest,
            "overlay",
            MountFlags::empty(),
            Some(data_c.as_c_str()),
        )
        .with_context(|| format!("Legacy mount failed (fsopen also failed: {})", fsopen_err))?;
    }

    if let Some(context) = root_context {
        let _ = lsetfilecon(dest, &context);
    }

    Ok(())
}

/// Recursive bind of `from` (resolved against the current working
/// directory, which is pinned to the pre-overlay tree) onto `to`.
pub fn bind_mount_rec(from: &Path, to: &Path, disable_umount: bool) -> Result<()> {
    log::debug!("bind mount {} -> {}", from.display(), to.display());

    let result = open_tree(
        CWD,
        from,
        OpenTreeFlags::OPEN_TREE_CLOEXEC
            | OpenTreeFlags::OPEN_TREE_CLONE
            | OpenTreeFlags::AT_RECURSIVE,
    )
    .context("open_tree failed")
    .and_then(|fd| {
        move_mount(
            fd.as_fd(),
            "",
            CWD,
            to,
            MoveMountFlags::MOVE_MOUNT_F_EMPTY_PATH,
        )
        .with_context(|| format!("move_mount failed for {}", to.display()))
    });

    if result.is_err() {
        mount(
            from,
            to,
            "",
            MountFlags::BIND | MountFlags::REC,
            None::<&CStr>,
        )
        .with_context(|| format!("legacy bind mount failed for {}", to.display()))?;
    }

    notify_unmountable(to, disable_umount);

    Ok(())
}

/// Re-establish one pre-existing child mount after the root overlay landed.
fn mount_overlay_child(
    mount_point: &Path,
    relative: &str,
    layers: &[PathBuf],
    mount_source: &str,
    disable_umount: bool,
) -> Result<()> {
    let stock = PathBuf::from(format!("./{}", relative.trim_start_matches('/')));

    let has_modification = layers.iter().any(|lower| {
        let path = lower.join(relative.trim_start_matches('/'));
        path.exists() || path.is_symlink()
    });

    if !has_modification {
        return bind_mount_rec(&stock, mount_point, disable_umount);
    }

    let mut lower_dirs: Vec<String> = Vec::new();
    for lower in layers {
        let path = lower.join(relative.trim_start_matches('/'));
        if path.is_dir() {
            lower_dirs.push(path.display().to_string());
        } else if path.exists() {
            // A file overlaying a mountpoint directory cannot be expressed
            // as an overlay; keep the stock mount visible instead.
            log::warn!(
                "File modification at mount point {}, falling back to bind mount",
                mount_point.display()
            );
            return bind_mount_rec(&stock, mount_point, disable_umount);
        }
    }

    if lower_dirs.is_empty() {
        return bind_mount_rec(&stock, mount_point, disable_umount);
    }

    let stock_str = stock.to_string_lossy();
    let lowerdir_config = lower_dirs
        .iter()
        .map(|s| s.as_str())
        .chain(std::iter::once(stock_str.as_ref()))
        .collect::<Vec<_>>()
        .join(":");

    if let Err(e) = do_mount_overlay(&lowerdir_config, mount_point, mount_source) {
        log::warn!(
            "failed to overlay child {}: {:#}, fallback to bind mount",
            mount_point.display(),
            e
        );
        return bind_mount_rec(&stock, mount_point, disable_umount);
    }

    notify_unmountable(mount_point, disable_umount);

    Ok(())
}

/// Overlay `layers` onto `target_root` while preserving every pre-existing
/// child mount and restoring partition symlinks the overlay shadows.
pub fn mount_overlay(
    target_root: &Path,
    layers: &[PathBuf],
    mount_source: &str,
    disable_umount: bool,
) -> Result<()> {
    log::info!("Starting overlay mount for {}", target_root.display());

    // Pin the pre-overlay tree; "./rel" keeps resolving into it after the
    // overlay covers the absolute path.
    env::set_current_dir(target_root)
        .with_context(|| format!("failed to chdir to {}", target_root.display()))?;

    let child_mounts = get_child_mounts(target_root).unwrap_or_else(|e| {
        log::warn!("Failed to detect child mounts: {:#}", e);
        Vec::new()
    });

    if !child_mounts.is_empty() {
        log::debug!(
            "Found {} child mounts under {}",
            child_mounts.len(),
            target_root.display()
        );
    }

    let lowerdir_config = layers
        .iter()
        .map(|l| l.display().to_string())
        .chain(std::iter::once(target_root.display().to_string()))
        .collect::<Vec<_>>()
        .join(":");

    log::debug!("lowerdir={}", lowerdir_config);

    do_mount_overlay(&lowerdir_config, target_root, mount_source)
        .with_context(|| format!("mount overlayfs for root {} failed", target_root.display()))?;

    notify_unmountable(target_root, disable_umount);

    for mount_point in &child_mounts {
        let relative = match mount_point.strip_prefix(target_root) {
            Ok(rel) => rel.to_string_lossy().to_string(),
            Err(_) => continue,
        };

        let stock_check = Path::new(".").join(&relative);
        if !stock_check.exists() {
            log::debug!("Stock tree for child mount is gone: {}", relative);
            continue;
        }

        log::debug!("Restoring child mount: {}", mount_point.display());

        if let Err(e) = mount_overlay_child(
            mount_point,
            &relative,
            layers,
            mount_source,
            disable_umount,
        ) {
            log::warn!(
                "failed to restore child mount {}: {:#}",
                mount_point.display(),
                e
            );
        }
    }

    restore_shadowed_partitions(target_root, &child_mounts, disable_umount);

    Ok(())
}

/// /system/vendor and friends are usually symlinks into /. A module shipping
/// a real `system/vendor/` directory makes the overlay replace the symlink
/// with a synthetic directory; bind the real partition back on top.
fn restore_shadowed_partitions(
    target_root: &Path,
    restored: &[PathBuf],
    disable_umount: bool,
) {
    for part in defs::SHADOWED_PARTITIONS {
        let root_part = Path::new("/").join(part);
        let target_part = target_root.join(part);

        if !root_part.is_dir() {
            continue;
        }

        if target_part.is_symlink() || !target_part.is_dir() {
            continue;
        }

        if restored.iter().any(|mp| mp == &target_part) {
            continue;
        }

        log::info!(
            "Restoring shadowed partition: {} -> {}",
            root_part.display(),
            target_part.display()
        );

        if let Err(e) = bind_mount_rec(&root_part, &target_part, disable_umount) {
            log::error!("Failed to restore partition {}: {:#}", part, e);
        }
    }
}
