//! Mount syscalls used to assemble the source view.
//!
//! The pipeline goes through [`MountOps`] so the mount sequence can be
//! checked without privileges; [`HostMounts`] is the real implementation.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr;

pub trait MountOps {
    /// Bind-mount `source` onto `target`.
    fn bind(&self, source: &Path, target: &Path) -> io::Result<()>;

    /// Turn an existing bind mount at `target` read-only.
    fn remount_readonly(&self, target: &Path) -> io::Result<()>;

    /// Lazily detach whatever is mounted at `target`.
    fn unmount(&self, target: &Path) -> io::Result<()>;
}

/// Whether an unmount error just means nothing was mounted there.
pub fn is_not_mounted(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::EINVAL) | Some(libc::ENOENT))
}

fn path_cstring(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains a NUL byte"))
}

fn check(ret: libc::c_int) -> io::Result<()> {
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Mount operations on the calling thread's mount namespace.
pub struct HostMounts;

impl MountOps for HostMounts {
    fn bind(&self, source: &Path, target: &Path) -> io::Result<()> {
        let c_source = path_cstring(source)?;
        let c_target = path_cstring(target)?;
        let fstype = c"none";
        check(unsafe {
            libc::mount(
                c_source.as_ptr(),
                c_target.as_ptr(),
                fstype.as_ptr(),
                libc::MS_BIND,
                ptr::null(),
            )
        })
    }

    fn remount_readonly(&self, target: &Path) -> io::Result<()> {
        let c_target = path_cstring(target)?;
        let fstype = c"none";
        check(unsafe {
            libc::mount(
                c"".as_ptr(),
                c_target.as_ptr(),
                fstype.as_ptr(),
                libc::MS_BIND | libc::MS_REMOUNT | libc::MS_RDONLY,
                ptr::null(),
            )
        })
    }

    fn unmount(&self, target: &Path) -> io::Result<()> {
        let c_target = path_cstring(target)?;
        check(unsafe { libc::umount2(c_target.as_ptr(), libc::MNT_DETACH) })
    }
}
