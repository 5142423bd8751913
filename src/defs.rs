// Copyright 2026 Hymo Developers
// SPDX-License-Identifier: GPL-3.0-or-later

pub const CONFIG_FILE: &str = "/data/adb/hymo/config.toml";
pub const MODULE_MODE_FILE: &str = "/data/adb/hymo/module_mode.conf";
pub const RUN_DIR: &str = "/data/adb/hymo/run";
pub const STATE_FILE: &str = "/data/adb/hymo/run/daemon_state.json";
pub const MODULES_IMG_FILE: &str = "/data/adb/hymo/modules.img";

pub const MODULES_DIR: &str = "/data/adb/modules";
pub const MODULE_PROP_FILE: &str = "/data/adb/modules/hymo/module.prop";
pub const FALLBACK_CONTENT_DIR: &str = "/data/adb/modules_update";

pub const HYMO_CTL_DEV: &str = "/dev/hymo_ctl";
pub const HYMO_CTL_PROC: &str = "/proc/hymo_ctl";

/// Protocol version this client speaks; the kernel side reports its own via
/// GET_VERSION and the two must match unless the user opts out.
pub const HYMOFS_PROTOCOL_VERSION: i32 = 3;

pub const DISABLE_FILE_NAME: &str = "disable";
pub const REMOVE_FILE_NAME: &str = "remove";
pub const SKIP_MOUNT_FILE_NAME: &str = "skipmount";
pub const REPLACE_DIR_FILE_NAME: &str = ".replace";

pub const RESERVED_MODULE_IDS: &[&str] = &["hymo", "lost+found", ".git"];

pub const BUILTIN_PARTITIONS: &[&str] =
    &["system", "vendor", "product", "system_ext", "odm", "oem"];

/// Partitions that commonly live behind a symlink like /system/vendor and
/// get shadowed by a root overlay on /system.
pub const SHADOWED_PARTITIONS: &[&str] = &["vendor", "product", "system_ext", "odm", "oem"];

pub const DEFAULT_MOUNT_SOURCE: &str = "KSU";
pub const DEFAULT_SELINUX_CONTEXT: &str = "u:object_r:system_file:s0";
pub const IMG_FILE_CONTEXT: &str = "u:object_r:ksu_file:s0";
