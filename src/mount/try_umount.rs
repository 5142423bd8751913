use std::{ffi::CString, os::fd::RawFd, path::Path, sync::OnceLock};

use anyhow::Result;
use rustix::path::Arg;

const KSU_INSTALL_MAGIC1: u32 = 0xDEAD_BEEF;
const KSU_INSTALL_MAGIC2: u32 = 0xCAFE_BABE;
const KSU_IOCTL_ADD_TRY_UMOUNT: u32 = 0x4000_4B12;
const KSU_IOCTL_NUKE_EXT4_SYSFS: u32 = 0x4000_4B13;

static DRIVER_FD: OnceLock<RawFd> = OnceLock::new();

#[repr(C)]
struct KsuPathCmd {
    arg: u64,
    flags: u32,
    mode: u8,
}

fn driver_fd() -> RawFd {
    *DRIVER_FD.get_or_init(|| {
        let mut fd = -1;
        unsafe {
            libc::syscall(
                libc::SYS_reboot,
                KSU_INSTALL_MAGIC1,
                KSU_INSTALL_MAGIC2,
                0,
                &mut fd,
            );
        };
        fd
    })
}

fn issue_path_ioctl(cmd: u32, target: &Path, flags: u32, mode: u8) -> Result<bool> {
    let fd = driver_fd();
    if fd < 0 {
        // No KSU control plane on this kernel; requests are advisory.
        return Ok(false);
    }

    let path = CString::new(target.as_str()?)?;
    let arg = KsuPathCmd {
        arg: path.as_ptr() as u64,
        flags,
        mode,
    };

    let ret = unsafe {
        #[cfg(target_env = "gnu")]
        {
            libc::ioctl(fd as libc::c_int, cmd as u64, &arg)
        }

        #[cfg(not(target_env = "gnu"))]
        {
            libc::ioctl(fd as libc::c_int, cmd as i32, &arg)
        }
    };

    if ret < 0 {
        log::debug!(
            "KSU ioctl {:#x} for {} failed: {}",
            cmd,
            target.display(),
            std::io::Error::last_os_error()
        );
        return Ok(false);
    }

    Ok(true)
}

/// Flag a mount as detachable so downstream namespace isolation may lazily
/// unmount it. Purely informational to the rest of this framework.
pub fn send_unmountable<P>(target: P) -> Result<()>
where
    P: AsRef<Path>,
{
    issue_path_ioctl(KSU_IOCTL_ADD_TRY_UMOUNT, target.as_ref(), 2, 1)?;
    Ok(())
}

/// Ask the kernel to scrub ext4 sysfs traces of a loop-mounted image.
/// Returns whether the scrub actually took effect.
pub fn nuke_ext4_sysfs<P>(target: P) -> Result<bool>
where
    P: AsRef<Path>,
{
    issue_path_ioctl(KSU_IOCTL_NUKE_EXT4_SYSFS, target.as_ref(), 0, 0)
}
