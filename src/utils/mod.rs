// Copyright 2026 Hymo Developers
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod xattr;

use std::{
    ffi::CString,
    fs::{self, OpenOptions, create_dir_all, remove_file},
    io::Write,
    os::unix::{
        ffi::OsStrExt,
        fs::{FileTypeExt, MetadataExt, symlink},
    },
    path::Path,
    process::Command,
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::{Context, Result, bail};
use procfs::process::Process;
use rustix::{
    fs::{Gid, Uid, chown},
    mount::{MountFlags, UnmountFlags, mount, unmount},
};
use walkdir::WalkDir;

use crate::{defs, utils::xattr::copy_extended_attributes};

pub fn init_logging(verbose: bool) -> Result<()> {
    let level = if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };

    #[cfg(target_os = "android")]
    {
        android_logger::init_once(
            android_logger::Config::default()
                .with_max_level(level)
                .with_tag("hymo"),
        );
    }

    #[cfg(not(target_os = "android"))]
    {
        let mut builder = env_logger::Builder::new();

        builder.format(|buf, record| {
            writeln!(
                buf,
                "[{}] [{}] {}",
                record.level(),
                record.target(),
                record.args()
            )
        });
        builder.filter_level(level).init();
    }
    Ok(())
}

pub fn ensure_dir_exists<T: AsRef<Path>>(dir: T) -> Result<()> {
    if !dir.as_ref().exists() {
        create_dir_all(&dir)?;
    }
    Ok(())
}

pub fn atomic_write<P: AsRef<Path>, C: AsRef<[u8]>>(path: P, content: C) -> Result<()> {
    let path = path.as_ref();
    let dir = path.parent().unwrap_or_else(|| Path::new("."));

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let pid = std::process::id();
    let temp_file = dir.join(format!(".{}_{}.tmp", pid, now));

    {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_file)?;
        file.write_all(content.as_ref())?;
    }

    fs::rename(&temp_file, path)?;
    Ok(())
}

pub fn camouflage_process(name: &str) -> Result<()> {
    let c_name = CString::new(name)?;
    unsafe {
        libc::prctl(libc::PR_SET_NAME, c_name.as_ptr() as u64, 0, 0, 0);
    }
    Ok(())
}

pub fn random_kworker_name() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    let x = nanos % 16;
    let y = (nanos >> 4) % 10;
    format!("kworker/u{}:{}", x, y)
}

pub fn validate_module_id(module_id: &str) -> Result<()> {
    static MODULE_ID_REGEX: std::sync::OnceLock<regex_lite::Regex> = std::sync::OnceLock::new();

    let re = MODULE_ID_REGEX.get_or_init(|| {
        regex_lite::Regex::new(r"^[a-zA-Z][a-zA-Z0-9._-]+$").expect("Invalid regex pattern")
    });
    if re.is_match(module_id) {
        Ok(())
    } else {
        bail!("Invalid module ID: '{module_id}'. Must match /^[a-zA-Z][a-zA-Z0-9._-]+$/")
    }
}

pub fn is_mounted<P: AsRef<Path>>(path: P) -> bool {
    let path_str = path.as_ref().to_string_lossy();
    let search = path_str.trim_end_matches('/');

    if let Ok(process) = Process::myself()
        && let Ok(mountinfo) = process.mountinfo()
    {
        return mountinfo
            .into_iter()
            .any(|m| m.mount_point.to_string_lossy() == search);
    }

    if let Ok(content) = fs::read_to_string("/proc/mounts") {
        for line in content.lines() {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() > 1 && parts[1] == search {
                return true;
            }
        }
    }
    false
}

pub fn mount_tmpfs(target: &Path, source: &str) -> Result<()> {
    ensure_dir_exists(target)?;
    mount(
        source,
        target,
        c"tmpfs",
        MountFlags::empty(),
        Some(c"mode=0755"),
    )
    .context("Failed to mount tmpfs")?;
    Ok(())
}

/// Loop-mount an ext4 image. The mount binary drives the loop-device
/// attachment for us, same as the erofs path on stock Android.
pub fn mount_ext4_image(image_path: &Path, target: &Path) -> Result<()> {
    ensure_dir_exists(target)?;
    let status = Command::new("mount")
        .args(["-t", "ext4", "-o", "loop,rw,noatime"])
        .arg(image_path)
        .arg(target)
        .status()
        .context("Failed to execute mount command")?;

    if !status.success() {
        bail!("Mount command failed for {}", image_path.display());
    }
    Ok(())
}

pub fn umount_detach<P: AsRef<Path>>(target: P) -> Result<()> {
    unmount(target.as_ref(), UnmountFlags::DETACH)
        .with_context(|| format!("Failed to umount {}", target.as_ref().display()))?;
    Ok(())
}

pub fn repair_image(image_path: &Path) -> Result<()> {
    log::info!("Running e2fsck on {}", image_path.display());
    let status = Command::new("e2fsck")
        .args(["-y", "-f"])
        .arg(image_path)
        .status()
        .context("Failed to execute e2fsck")?;

    if let Some(code) = status.code()
        && code > 2
    {
        bail!("e2fsck failed with exit code: {}", code);
    }
    Ok(())
}

/// Probe whether the filesystem under `path` accepts the xattrs overlay and
/// module content need: write security.selinux to a scratch file and read it
/// back, falling back to a user xattr when the security namespace is locked.
pub fn probe_xattr_support(path: &Path) -> bool {
    let test_file = path.join(".xattr_probe");
    if fs::write(&test_file, b"probe").is_err() {
        return false;
    }

    let selinux_ok = xattr::lsetfilecon(&test_file, defs::DEFAULT_SELINUX_CONTEXT).is_ok()
        && xattr::lgetfilecon(&test_file)
            .map(|c| c == defs::DEFAULT_SELINUX_CONTEXT)
            .unwrap_or(false);
    let supported = selinux_ok || probe_user_xattr(&test_file);

    let _ = remove_file(test_file);
    supported
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn probe_user_xattr(path: &Path) -> bool {
    use extattr::{Flags, lgetxattr, lsetxattr};

    lsetxattr(path, "user.hymo_probe", b"1", Flags::empty()).is_ok()
        && lgetxattr(path, "user.hymo_probe").is_ok()
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn probe_user_xattr(_path: &Path) -> bool {
    false
}

fn make_device_node(path: &Path, mode: u32, rdev: u64) -> Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())?;
    unsafe {
        if libc::mknod(c_path.as_ptr(), mode as libc::mode_t, rdev as libc::dev_t) != 0 {
            let err = std::io::Error::last_os_error();
            bail!("mknod failed for {}: {}", path.display(), err);
        }
    }
    Ok(())
}

fn copy_file_times(meta: &fs::Metadata, dst: &Path) {
    let Ok(c_path) = CString::new(dst.as_os_str().as_bytes()) else {
        return;
    };
    let times = [
        libc::timespec {
            tv_sec: meta.atime() as libc::time_t,
            tv_nsec: meta.atime_nsec() as _,
        },
        libc::timespec {
            tv_sec: meta.mtime() as libc::time_t,
            tv_nsec: meta.mtime_nsec() as _,
        },
    ];
    unsafe {
        libc::utimensat(
            libc::AT_FDCWD,
            c_path.as_ptr(),
            times.as_ptr(),
            libc::AT_SYMLINK_NOFOLLOW,
        );
    }
}

fn copy_ownership(meta: &fs::Metadata, dst: &Path) {
    let _ = chown(
        dst,
        Some(Uid::from_raw(meta.uid())),
        Some(Gid::from_raw(meta.gid())),
    );
}

fn native_cp_r(src: &Path, dst: &Path) -> Result<()> {
    if !dst.exists() {
        create_dir_all(dst)?;
        let meta = src.metadata()?;
        fs::set_permissions(dst, meta.permissions())?;
        copy_ownership(&meta, dst);
        let _ = copy_extended_attributes(src, dst);
        copy_file_times(&meta, dst);
    }

    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());

        let metadata = src_path.symlink_metadata()?;
        let ft = metadata.file_type();

        if ft.is_dir() {
            native_cp_r(&src_path, &dst_path)?;
            continue;
        }

        if dst_path.exists() || dst_path.is_symlink() {
            remove_file(&dst_path)?;
        }

        if ft.is_symlink() {
            let link_target = fs::read_link(&src_path)?;
            symlink(&link_target, &dst_path)?;
        } else if ft.is_char_device() || ft.is_block_device() || ft.is_fifo() {
            make_device_node(&dst_path, metadata.mode(), metadata.rdev())?;
        } else {
            fs::copy(&src_path, &dst_path)?;
        }

        if !ft.is_symlink() {
            let _ = fs::set_permissions(&dst_path, metadata.permissions());
            copy_ownership(&metadata, &dst_path);
        }
        let _ = copy_extended_attributes(&src_path, &dst_path);
        copy_file_times(&metadata, &dst_path);
    }
    Ok(())
}

/// Recursive copy preserving file kind, symlink values, permission bits,
/// ownership, timestamps and extended attributes.
pub fn sync_dir(src: &Path, dst: &Path) -> Result<()> {
    if !src.exists() {
        return Ok(());
    }
    ensure_dir_exists(dst)?;
    native_cp_r(src, dst).with_context(|| {
        format!("Failed to sync {} to {}", src.display(), dst.display())
    })
}

/// True if any regular file or symlink exists anywhere below `path`.
/// Short-circuits on the first hit.
pub fn has_files_recursive(path: &Path) -> bool {
    if !path.is_dir() {
        return false;
    }

    WalkDir::new(path)
        .min_depth(1)
        .into_iter()
        .flatten()
        .any(|e| e.file_type().is_file() || e.file_type().is_symlink())
}

/// Structural equality of two directory trees: entry names, file kinds,
/// symlink targets and regular-file contents.
pub fn dir_content_equal(a: &Path, b: &Path) -> Result<bool> {
    let mut names_a: Vec<_> = fs::read_dir(a)?
        .filter_map(|e| e.ok().map(|e| e.file_name()))
        .collect();
    let mut names_b: Vec<_> = fs::read_dir(b)?
        .filter_map(|e| e.ok().map(|e| e.file_name()))
        .collect();
    names_a.sort();
    names_b.sort();

    if names_a != names_b {
        return Ok(false);
    }

    for name in names_a {
        let pa = a.join(&name);
        let pb = b.join(&name);
        let ma = pa.symlink_metadata()?;
        let mb = pb.symlink_metadata()?;

        if ma.file_type().is_symlink() != mb.file_type().is_symlink()
            || ma.file_type().is_dir() != mb.file_type().is_dir()
        {
            return Ok(false);
        }

        if ma.file_type().is_symlink() {
            if fs::read_link(&pa)? != fs::read_link(&pb)? {
                return Ok(false);
            }
        } else if ma.file_type().is_dir() {
            if !dir_content_equal(&pa, &pb)? {
                return Ok(false);
            }
        } else if ma.file_type().is_file() && fs::read(&pa)? != fs::read(&pb)? {
            return Ok(false);
        }
    }

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn atomic_write_replaces_content() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("module.prop");

        atomic_write(&target, "id=alpha\n").unwrap();
        atomic_write(&target, "id=beta\n").unwrap();

        assert_eq!(fs::read_to_string(&target).unwrap(), "id=beta\n");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn sync_dir_preserves_symlinks_and_content() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");

        fs::create_dir_all(src.join("system/lib")).unwrap();
        fs::write(src.join("system/lib/libx.so"), b"elf").unwrap();
        symlink("libx.so", src.join("system/lib/libx.so.1")).unwrap();

        sync_dir(&src, &dst).unwrap();

        assert_eq!(fs::read(dst.join("system/lib/libx.so")).unwrap(), b"elf");
        assert_eq!(
            fs::read_link(dst.join("system/lib/libx.so.1")).unwrap(),
            Path::new("libx.so")
        );
        assert!(dir_content_equal(&src, &dst).unwrap());
    }

    #[test]
    fn sync_dir_overwrites_stale_entries() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");

        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("f"), b"new").unwrap();
        fs::create_dir_all(&dst).unwrap();
        symlink("dangling", dst.join("f")).unwrap();

        sync_dir(&src, &dst).unwrap();

        assert_eq!(fs::read(dst.join("f")).unwrap(), b"new");
    }

    #[test]
    fn has_files_recursive_ignores_empty_dirs() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a/b/c")).unwrap();

        assert!(!has_files_recursive(dir.path()));

        symlink("x", dir.path().join("a/b/c/link")).unwrap();
        assert!(has_files_recursive(dir.path()));
    }
}
