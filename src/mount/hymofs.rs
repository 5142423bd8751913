// Copyright 2026 Hymo Developers
// SPDX-License-Identifier: GPL-3.0-or-later

use std::{
    ffi::{CStr, CString},
    fs::{File, OpenOptions},
    io::Write,
    os::unix::{fs::FileTypeExt, io::AsRawFd},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use nix::{ioctl_none, ioctl_read, ioctl_readwrite, ioctl_write_ptr};

use crate::defs;

const HYMO_IOC_MAGIC: u8 = 0xE0;

/// Directory-entry type constants as the kernel sees them (dirent d_type).
pub const DT_FIFO: u8 = 1;
pub const DT_CHR: u8 = 2;
pub const DT_DIR: u8 = 4;
pub const DT_BLK: u8 = 6;
pub const DT_REG: u8 = 8;
pub const DT_LNK: u8 = 10;
pub const DT_SOCK: u8 = 12;

pub fn dtype_of(ft: &std::fs::FileType) -> u8 {
    if ft.is_symlink() {
        DT_LNK
    } else if ft.is_dir() {
        DT_DIR
    } else if ft.is_char_device() {
        DT_CHR
    } else if ft.is_block_device() {
        DT_BLK
    } else if ft.is_fifo() {
        DT_FIFO
    } else if ft.is_socket() {
        DT_SOCK
    } else {
        DT_REG
    }
}

/// One entry of the planner's redirector batch. `src` is the path processes
/// see; `target` is the backing path inside the mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HymoRule {
    ClearAll,
    InjectDir { path: PathBuf },
    Add { src: PathBuf, target: PathBuf, dtype: u8 },
    Hide { path: PathBuf },
    Delete { key: PathBuf },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HymoFsStatus {
    Available,
    NotPresent,
    KernelTooOld,
    ModuleTooOld,
}

#[repr(C)]
pub struct HymoIoctlArg {
    pub src: *const std::ffi::c_char,
    pub target: *const std::ffi::c_char,
    pub type_: std::ffi::c_int,
}

#[repr(C)]
pub struct HymoIoctlListArg {
    pub buf: *mut std::ffi::c_char,
    pub size: usize,
}

ioctl_write_ptr!(ioc_add_rule, HYMO_IOC_MAGIC, 1, HymoIoctlArg);
ioctl_write_ptr!(ioc_del_rule, HYMO_IOC_MAGIC, 2, HymoIoctlArg);
ioctl_write_ptr!(ioc_hide_rule, HYMO_IOC_MAGIC, 3, HymoIoctlArg);
ioctl_write_ptr!(ioc_inject_rule, HYMO_IOC_MAGIC, 4, HymoIoctlArg);
ioctl_none!(ioc_clear_all, HYMO_IOC_MAGIC, 5);
ioctl_read!(ioc_get_version, HYMO_IOC_MAGIC, 6, i32);
ioctl_readwrite!(ioc_list_rules, HYMO_IOC_MAGIC, 7, HymoIoctlListArg);
ioctl_write_ptr!(ioc_set_debug, HYMO_IOC_MAGIC, 8, i32);

pub struct HymoFs;

impl HymoFs {
    fn open_dev_ro() -> Result<File> {
        File::open(defs::HYMO_CTL_DEV)
            .with_context(|| format!("Failed to open {}", defs::HYMO_CTL_DEV))
    }

    fn open_dev_rw() -> Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(defs::HYMO_CTL_DEV)
            .with_context(|| format!("Failed to open {}", defs::HYMO_CTL_DEV))
    }

    fn has_ioctl_dev() -> bool {
        Path::new(defs::HYMO_CTL_DEV).exists()
    }

    fn has_procfs_node() -> bool {
        Path::new(defs::HYMO_CTL_PROC).exists()
    }

    /// Line protocol spoken by the legacy procfs control node.
    fn write_ctl_line(line: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .open(defs::HYMO_CTL_PROC)
            .with_context(|| format!("Failed to open {}", defs::HYMO_CTL_PROC))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("Failed to write control line: {}", line))?;
        Ok(())
    }

    pub fn check_status() -> HymoFsStatus {
        if !Self::has_ioctl_dev() && !Self::has_procfs_node() {
            return HymoFsStatus::NotPresent;
        }

        match Self::get_version() {
            Some(v) if v == defs::HYMOFS_PROTOCOL_VERSION => HymoFsStatus::Available,
            Some(v) if v < defs::HYMOFS_PROTOCOL_VERSION => HymoFsStatus::KernelTooOld,
            Some(_) => HymoFsStatus::ModuleTooOld,
            // Legacy procfs driver has no version query; treat it as current.
            None if Self::has_procfs_node() && !Self::has_ioctl_dev() => HymoFsStatus::Available,
            None => HymoFsStatus::NotPresent,
        }
    }

    pub fn get_version() -> Option<i32> {
        if !Self::has_ioctl_dev() {
            return None;
        }
        let file = Self::open_dev_ro().ok()?;
        let mut version: i32 = 0;
        match unsafe { ioc_get_version(file.as_raw_fd(), &mut version) } {
            // Some driver revisions return the version as the ioctl result
            // instead of writing through the pointer.
            Ok(ret) if version == 0 && ret > 0 => Some(ret),
            Ok(_) => Some(version),
            Err(_) => None,
        }
    }

    pub fn clear() -> Result<()> {
        log::debug!("HymoFS: clearing all rules");
        if !Self::has_ioctl_dev() {
            return Self::write_ctl_line("clear\n");
        }
        let file = Self::open_dev_rw()?;
        unsafe { ioc_clear_all(file.as_raw_fd()) }.context("HymoFS clear failed")?;
        Ok(())
    }

    pub fn add_rule(src: &Path, target: &Path, dtype: u8) -> Result<()> {
        log::debug!(
            "HymoFS: ADD_RULE src='{}' target='{}' type={}",
            src.display(),
            target.display(),
            dtype
        );
        if !Self::has_ioctl_dev() {
            return Self::write_ctl_line(&format!(
                "add {} {} {}\n",
                src.display(),
                target.display(),
                dtype
            ));
        }
        let file = Self::open_dev_rw()?;
        let c_src = path_cstring(src)?;
        let c_target = path_cstring(target)?;

        let arg = HymoIoctlArg {
            src: c_src.as_ptr(),
            target: c_target.as_ptr(),
            type_: dtype as std::ffi::c_int,
        };

        unsafe { ioc_add_rule(file.as_raw_fd(), &arg) }.context("HymoFS add_rule failed")?;
        Ok(())
    }

    pub fn delete_rule(key: &Path) -> Result<()> {
        log::debug!("HymoFS: DEL_RULE key='{}'", key.display());
        if !Self::has_ioctl_dev() {
            return Self::write_ctl_line(&format!("delete {}\n", key.display()));
        }
        let file = Self::open_dev_rw()?;
        let c_src = path_cstring(key)?;

        let arg = HymoIoctlArg {
            src: c_src.as_ptr(),
            target: std::ptr::null(),
            type_: 0,
        };

        unsafe { ioc_del_rule(file.as_raw_fd(), &arg) }.context("HymoFS delete_rule failed")?;
        Ok(())
    }

    pub fn hide_path(path: &Path) -> Result<()> {
        log::debug!("HymoFS: HIDE_RULE path='{}'", path.display());
        if !Self::has_ioctl_dev() {
            return Self::write_ctl_line(&format!("hide {}\n", path.display()));
        }
        let file = Self::open_dev_rw()?;
        let c_path = path_cstring(path)?;

        let arg = HymoIoctlArg {
            src: c_path.as_ptr(),
            target: std::ptr::null(),
            type_: 0,
        };

        unsafe { ioc_hide_rule(file.as_raw_fd(), &arg) }.context("HymoFS hide_path failed")?;
        Ok(())
    }

    /// Declare a synthetic directory so lookups inside it can resolve even
    /// when the underlying filesystem has no such entry.
    pub fn inject_dir(path: &Path) -> Result<()> {
        log::debug!("HymoFS: INJECT_RULE path='{}'", path.display());
        if !Self::has_ioctl_dev() {
            return Self::write_ctl_line(&format!("inject {}\n", path.display()));
        }
        let file = Self::open_dev_rw()?;
        let c_path = path_cstring(path)?;

        let arg = HymoIoctlArg {
            src: c_path.as_ptr(),
            target: std::ptr::null(),
            type_: DT_DIR as std::ffi::c_int,
        };

        unsafe { ioc_inject_rule(file.as_raw_fd(), &arg) }.context("HymoFS inject_dir failed")?;
        Ok(())
    }

    /// Apply a planner batch in its given order. The batch is already
    /// arranged so intermediate kernel states stay safe (dirs first, hides
    /// last); a single failed rule is logged and does not abort the rest.
    pub fn apply_batch(rules: &[HymoRule]) -> Result<()> {
        let mut failures = 0usize;

        for rule in rules {
            let result = match rule {
                HymoRule::ClearAll => Self::clear(),
                HymoRule::InjectDir { path } => Self::inject_dir(path),
                HymoRule::Add { src, target, dtype } => Self::add_rule(src, target, *dtype),
                HymoRule::Hide { path } => Self::hide_path(path),
                HymoRule::Delete { key } => Self::delete_rule(key),
            };

            if let Err(e) = result {
                failures += 1;
                log::warn!("HymoFS rule failed: {:#}", e);
                // A failed ClearAll means the device is gone; bail early.
                if matches!(rule, HymoRule::ClearAll) {
                    bail!("HymoFS control channel unusable: {:#}", e);
                }
            }
        }

        if failures > 0 {
            log::warn!("HymoFS batch applied with {} failed rules", failures);
        }
        Ok(())
    }

    /// Translate one module partition tree into incremental rules: inject
    /// the parent directories first, then adds, then hides for whiteouts.
    pub fn add_rules_from_directory(target_base: &Path, module_dir: &Path) -> Result<()> {
        use std::os::unix::fs::MetadataExt;

        if !module_dir.is_dir() {
            return Ok(());
        }

        log::debug!(
            "HymoFS: scanning module dir {} -> {}",
            module_dir.display(),
            target_base.display()
        );

        let mut inject_dirs = std::collections::BTreeSet::new();
        let mut adds = Vec::new();
        let mut hides = Vec::new();

        for entry in walkdir::WalkDir::new(module_dir)
            .min_depth(1)
            .into_iter()
            .flatten()
        {
            let Ok(rel) = entry.path().strip_prefix(module_dir) else {
                continue;
            };
            let target_path = target_base.join(rel);
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            let ft = meta.file_type();

            if ft.is_char_device() && meta.rdev() == 0 {
                hides.push(target_path);
            } else if ft.is_file() || ft.is_symlink() {
                if let Some(parent) = target_path.parent() {
                    inject_dirs.insert(parent.to_path_buf());
                }
                adds.push((target_path, entry.path().to_path_buf(), dtype_of(&ft)));
            }
        }

        for dir in inject_dirs {
            if let Err(e) = Self::inject_dir(&dir) {
                log::warn!("Failed to inject dir {}: {:#}", dir.display(), e);
            }
        }
        for (src, target, dtype) in adds {
            if let Err(e) = Self::add_rule(&src, &target, dtype) {
                log::warn!("Failed to add rule for {}: {:#}", src.display(), e);
            }
        }
        for path in hides {
            if let Err(e) = Self::hide_path(&path) {
                log::warn!("Failed to hide {}: {:#}", path.display(), e);
            }
        }

        Ok(())
    }

    /// Remove every rule a module partition tree would have produced.
    pub fn remove_rules_from_directory(target_base: &Path, module_dir: &Path) -> Result<()> {
        use std::os::unix::fs::MetadataExt;

        if !module_dir.is_dir() {
            return Ok(());
        }

        for entry in walkdir::WalkDir::new(module_dir)
            .min_depth(1)
            .into_iter()
            .flatten()
        {
            let Ok(rel) = entry.path().strip_prefix(module_dir) else {
                continue;
            };
            let target_path = target_base.join(rel);
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            let ft = meta.file_type();

            let is_whiteout = ft.is_char_device() && meta.rdev() == 0;
            if ft.is_file() || ft.is_symlink() || is_whiteout {
                if let Err(e) = Self::delete_rule(&target_path) {
                    log::warn!(
                        "Failed to delete rule for {}: {:#}",
                        target_path.display(),
                        e
                    );
                }
            }
        }

        Ok(())
    }

    #[allow(dead_code)]
    pub fn list_active_rules() -> Result<String> {
        let file = Self::open_dev_ro()?;
        let capacity = 128 * 1024;
        let mut buffer = vec![0u8; capacity];
        let mut arg = HymoIoctlListArg {
            buf: buffer.as_mut_ptr() as *mut std::ffi::c_char,
            size: capacity,
        };

        unsafe { ioc_list_rules(file.as_raw_fd(), &mut arg) }
            .context("HymoFS list_rules failed")?;

        let c_str = unsafe { CStr::from_ptr(buffer.as_ptr() as *const std::ffi::c_char) };
        Ok(c_str.to_string_lossy().into_owned())
    }

    #[allow(dead_code)]
    pub fn set_debug(enable: bool) -> Result<()> {
        let file = Self::open_dev_rw()?;
        let val: i32 = if enable { 1 } else { 0 };
        unsafe { ioc_set_debug(file.as_raw_fd(), &val) }.context("HymoFS set_debug failed")?;
        Ok(())
    }
}

fn path_cstring(path: &Path) -> Result<CString> {
    use std::os::unix::ffi::OsStrExt;
    CString::new(path.as_os_str().as_bytes())
        .with_context(|| format!("Path contains NUL: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dtype_matches_dirent_constants() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        std::fs::write(&file, b"x").unwrap();
        let link = dir.path().join("l");
        std::os::unix::fs::symlink("f", &link).unwrap();

        assert_eq!(dtype_of(&file.symlink_metadata().unwrap().file_type()), DT_REG);
        assert_eq!(dtype_of(&link.symlink_metadata().unwrap().file_type()), DT_LNK);
        assert_eq!(
            dtype_of(&dir.path().symlink_metadata().unwrap().file_type()),
            DT_DIR
        );
    }
}
