// Copyright 2026 Hymo Developers
// SPDX-License-Identifier: GPL-3.0-or-later

use std::{fs, os::unix::fs::PermissionsExt, path::{Path, PathBuf}};

use anyhow::{Context, Result, bail};
use rustix::fs::{Gid, Uid, chown};

use crate::{
    defs,
    utils::{self, xattr::lsetfilecon},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    Tmpfs,
    Ext4,
    /// No writable mirror: planning runs directly against the module sources.
    HymofsDirect,
}

impl StorageMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageMode::Tmpfs => "tmpfs",
            StorageMode::Ext4 => "ext4",
            StorageMode::HymofsDirect => "hymofs_direct",
        }
    }
}

pub struct StorageHandle {
    pub mount_point: PathBuf,
    pub mode: StorageMode,
}

/// Provision a writable mirror root. Tmpfs is preferred when it can carry
/// SELinux xattrs; otherwise a pre-existing ext4 image is loop-mounted.
/// The mount outlives this process on purpose.
pub fn setup(mnt_dir: &Path, image_path: &Path, config_force_ext4: bool) -> Result<StorageHandle> {
    log::info!("Setting up storage at {}", mnt_dir.display());

    if utils::is_mounted(mnt_dir) {
        let _ = utils::umount_detach(mnt_dir);
    }
    utils::ensure_dir_exists(mnt_dir)?;

    if !config_force_ext4 && try_setup_tmpfs(mnt_dir)? {
        return Ok(StorageHandle {
            mount_point: mnt_dir.to_path_buf(),
            mode: StorageMode::Tmpfs,
        });
    }

    setup_ext4_image(mnt_dir, image_path)?;

    Ok(StorageHandle {
        mount_point: mnt_dir.to_path_buf(),
        mode: StorageMode::Ext4,
    })
}

fn try_setup_tmpfs(target: &Path) -> Result<bool> {
    log::info!("Attempting tmpfs mode...");

    if let Err(e) = utils::mount_tmpfs(target, "hymo_storage") {
        log::warn!("Tmpfs mount failed: {:#}. Falling back to image.", e);
        return Ok(false);
    }

    if utils::probe_xattr_support(target) {
        log::info!("Tmpfs mode active (xattr supported).");
        Ok(true)
    } else {
        log::warn!("Tmpfs does NOT support xattrs. Unmounting...");
        let _ = utils::umount_detach(target);
        Ok(false)
    }
}

fn setup_ext4_image(target: &Path, image_path: &Path) -> Result<()> {
    log::info!("Falling back to ext4 image mode...");

    if !image_path.exists() {
        bail!("modules.img not found at {}", image_path.display());
    }

    lsetfilecon(image_path, defs::IMG_FILE_CONTEXT).ok();

    if utils::mount_ext4_image(image_path, target).is_err() {
        utils::repair_image(image_path).context("Failed to repair modules.img")?;
        utils::mount_ext4_image(image_path, target)
            .context("Failed to mount modules.img after repair")?;
    }

    repair_root(target)?;

    log::info!("Image mode active and secured.");
    Ok(())
}

fn repair_root(target: &Path) -> Result<()> {
    fs::set_permissions(target, fs::Permissions::from_mode(0o755))
        .with_context(|| format!("chmod failed for {}", target.display()))?;
    chown(target, Some(Uid::from_raw(0)), Some(Gid::from_raw(0)))
        .with_context(|| format!("chown failed for {}", target.display()))?;
    lsetfilecon(target, defs::DEFAULT_SELINUX_CONTEXT)?;
    Ok(())
}

/// Sync may have replaced the root's permissions or label; re-apply them
/// before anything is exposed through mounts.
pub fn finalize_permissions(handle: &StorageHandle) -> Result<()> {
    if handle.mode == StorageMode::Ext4 {
        log::info!("Repairing storage root permissions...");
        repair_root(&handle.mount_point)?;
    }
    Ok(())
}

pub fn print_status() -> Result<()> {
    let state = crate::core::state::RuntimeState::load().unwrap_or_default();

    let path = if state.mount_point.as_os_str().is_empty() {
        PathBuf::from(defs::FALLBACK_CONTENT_DIR)
    } else {
        state.mount_point.clone()
    };

    if !path.exists() {
        println!("{{ \"error\": \"Not mounted\" }}");
        return Ok(());
    }

    let stats = rustix::fs::statvfs(&path).context("statvfs failed")?;

    let block_size = stats.f_bsize;
    let total_bytes = stats.f_blocks * block_size;
    let free_bytes = stats.f_bfree * block_size;
    let used_bytes = total_bytes.saturating_sub(free_bytes);
    let percent = if total_bytes > 0 {
        used_bytes * 100 / total_bytes
    } else {
        0
    };

    let mode = if state.storage_mode.is_empty() {
        "unknown".to_string()
    } else {
        state.storage_mode
    };

    println!(
        "{}",
        serde_json::json!({
            "size": format_size(total_bytes),
            "used": format_size(used_bytes),
            "avail": format_size(free_bytes),
            "percent": format!("{}%", percent),
            "type": mode,
        })
    );

    Ok(())
}

fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1}G", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.0}M", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.0}K", bytes as f64 / KB as f64)
    } else {
        format!("{}B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_mode_strings_match_state_vocabulary() {
        assert_eq!(StorageMode::Tmpfs.as_str(), "tmpfs");
        assert_eq!(StorageMode::Ext4.as_str(), "ext4");
        assert_eq!(StorageMode::HymofsDirect.as_str(), "hymofs_direct");
    }

    #[test]
    fn format_size_picks_unit() {
        assert_eq!(format_size(512), "512B");
        assert_eq!(format_size(64 * 1024), "64K");
        assert_eq!(format_size(3 * 1024 * 1024), "3M");
        assert_eq!(format_size(1024 * 1024 * 1024 * 3 / 2), "1.5G");
    }
}
