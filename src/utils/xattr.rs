// Copyright 2026 Hymo Developers
// SPDX-License-Identifier: GPL-3.0-or-later

use std::path::Path;

use anyhow::{Context, Result};
#[cfg(any(target_os = "linux", target_os = "android"))]
use extattr::{Flags as XattrFlags, lgetxattr, llistxattr, lsetxattr};

use crate::defs;

pub const SELINUX_XATTR: &str = "security.selinux";
pub const OVERLAY_OPAQUE_XATTR: &str = "trusted.overlay.opaque";

#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn lsetfilecon<P: AsRef<Path>>(path: P, con: &str) -> Result<()> {
    if let Err(e) = lsetxattr(
        path.as_ref(),
        SELINUX_XATTR,
        con.as_bytes(),
        XattrFlags::empty(),
    ) {
        let io_err = std::io::Error::from(e);
        log::debug!(
            "lsetfilecon: {} -> {} failed: {}",
            path.as_ref().display(),
            con,
            io_err
        );
    }
    Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn lsetfilecon<P: AsRef<Path>>(_path: P, _con: &str) -> Result<()> {
    unimplemented!();
}

#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn lgetfilecon<P: AsRef<Path>>(path: P) -> Result<String> {
    let con = lgetxattr(path.as_ref(), SELINUX_XATTR).with_context(|| {
        format!(
            "Failed to get SELinux context for {}",
            path.as_ref().display()
        )
    })?;
    let con_str = String::from_utf8_lossy(&con).trim_matches('\0').to_string();

    Ok(con_str)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn lgetfilecon<P: AsRef<Path>>(_path: P) -> Result<String> {
    unimplemented!();
}

/// Transfer the SELinux context of `src` onto `dst`, falling back to the
/// stock system context when the source carries none. Contexts inherited
/// from /data (rootfs) are rewritten, they would be rejected on /system.
pub fn copy_path_context<S: AsRef<Path>, D: AsRef<Path>>(src: S, dst: D) -> Result<()> {
    let mut context = if src.as_ref().exists() || src.as_ref().is_symlink() {
        lgetfilecon(&src).unwrap_or_else(|_| defs::DEFAULT_SELINUX_CONTEXT.to_string())
    } else {
        defs::DEFAULT_SELINUX_CONTEXT.to_string()
    };

    if context.contains("u:object_r:rootfs:s0") {
        context = defs::DEFAULT_SELINUX_CONTEXT.to_string();
    }

    lsetfilecon(dst, &context)
}

/// Copy every extended attribute from `src` to `dst`, including the
/// `security.*` namespace. Used by the sync copier so the mirror carries the
/// exact labels of the module source.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn copy_extended_attributes(src: &Path, dst: &Path) -> Result<()> {
    if let Ok(names) = llistxattr(src) {
        for name in names {
            if let Ok(value) = lgetxattr(src, &name) {
                let _ = lsetxattr(dst, &name, &value, XattrFlags::empty());
            }
        }
    }
    Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn copy_extended_attributes(_src: &Path, _dst: &Path) -> Result<()> {
    unimplemented!();
}

/// Mark a directory opaque so an overlay serves only the module's copy of it.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn set_overlay_opaque<P: AsRef<Path>>(path: P) -> Result<()> {
    lsetxattr(
        path.as_ref(),
        OVERLAY_OPAQUE_XATTR,
        b"y",
        XattrFlags::empty(),
    )?;
    Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn set_overlay_opaque<P: AsRef<Path>>(_path: P) -> Result<()> {
    unimplemented!();
}
