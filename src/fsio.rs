use crate::util::{errno_from_nix, path_to_cstring, retry_eintr};
use fuse3::Errno;
use nix::fcntl::OFlag;
use nix::sys::stat::{FchmodatFlags, FileStat, Mode, SFlag, UtimensatFlags};
use nix::sys::statvfs::FsFlags;
use nix::sys::time::TimeSpec;
use nix::unistd::{Gid, LinkatFlags, Uid, UnlinkatFlags};
use std::ffi::{CStr, OsStr, OsString};
use std::io;
use std::os::fd::{FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStringExt;
use std::path::Path;

// Thin wrappers over one native syscall each. Error translation is identity;
// nothing here consults branches, policies, or config.

pub fn lstat(path: &Path) -> Result<FileStat, Errno> {
    nix::sys::stat::lstat(path).map_err(errno_from_nix)
}

pub fn exists(path: &Path) -> bool {
    nix::sys::stat::lstat(path).is_ok()
}

pub fn open(path: &Path, oflag: OFlag, mode: Mode) -> Result<OwnedFd, Errno> {
    let fd = retry_eintr(|| nix::fcntl::open(path, oflag | OFlag::O_CLOEXEC, mode))
        .map_err(errno_from_nix)?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

pub fn mkdir(path: &Path, mode: Mode) -> Result<(), Errno> {
    nix::unistd::mkdir(path, mode).map_err(errno_from_nix)
}

pub fn mknod(path: &Path, kind: SFlag, perm: Mode, dev: u64) -> Result<(), Errno> {
    nix::sys::stat::mknod(path, kind, perm, dev as nix::sys::stat::dev_t).map_err(errno_from_nix)
}

pub fn symlink(target: &OsStr, linkpath: &Path) -> Result<(), Errno> {
    nix::unistd::symlinkat(target, None, linkpath).map_err(errno_from_nix)
}

pub fn readlink(path: &Path) -> Result<OsString, Errno> {
    nix::fcntl::readlink(path).map_err(errno_from_nix)
}

pub fn unlink(path: &Path) -> Result<(), Errno> {
    nix::unistd::unlink(path).map_err(errno_from_nix)
}

pub fn rmdir(path: &Path) -> Result<(), Errno> {
    nix::unistd::unlinkat(None, path, UnlinkatFlags::RemoveDir).map_err(errno_from_nix)
}

pub fn rename(from: &Path, to: &Path) -> Result<(), Errno> {
    nix::fcntl::renameat(None, from, None, to).map_err(errno_from_nix)
}

pub fn link(oldpath: &Path, newpath: &Path) -> Result<(), Errno> {
    nix::unistd::linkat(None, oldpath, None, newpath, LinkatFlags::empty())
        .map_err(errno_from_nix)
}

pub fn chmod(path: &Path, mode: Mode) -> Result<(), Errno> {
    nix::sys::stat::fchmodat(None, path, mode, FchmodatFlags::FollowSymlink)
        .map_err(errno_from_nix)
}

pub fn lchown(path: &Path, uid: Option<Uid>, gid: Option<Gid>) -> Result<(), Errno> {
    nix::unistd::fchownat(
        None,
        path,
        uid,
        gid,
        nix::fcntl::AtFlags::AT_SYMLINK_NOFOLLOW,
    )
    .map_err(errno_from_nix)
}

pub fn utimens(path: &Path, atime: &TimeSpec, mtime: &TimeSpec) -> Result<(), Errno> {
    nix::sys::stat::utimensat(None, path, atime, mtime, UtimensatFlags::NoFollowSymlink)
        .map_err(errno_from_nix)
}

pub fn truncate(path: &Path, len: i64) -> Result<(), Errno> {
    nix::unistd::truncate(path, len).map_err(errno_from_nix)
}

#[derive(Clone, Copy, Debug)]
pub struct FsInfo {
    pub spaceavail: u64,
    pub readonly: bool,
}

pub fn statvfs(path: &Path) -> Result<nix::sys::statvfs::Statvfs, Errno> {
    nix::sys::statvfs::statvfs(path).map_err(errno_from_nix)
}

pub fn fs_info(path: &Path) -> Result<FsInfo, Errno> {
    let st = statvfs(path)?;
    Ok(FsInfo {
        spaceavail: st.blocks_available() as u64 * st.fragment_size() as u64,
        readonly: st.flags().contains(FsFlags::ST_RDONLY),
    })
}

pub fn lgetxattr(path: &Path, name: &CStr, buf: &mut [u8]) -> Result<usize, Errno> {
    let c_path = path_to_cstring(path)?;
    let res = unsafe {
        libc::lgetxattr(
            c_path.as_ptr(),
            name.as_ptr(),
            if buf.is_empty() {
                std::ptr::null_mut()
            } else {
                buf.as_mut_ptr() as *mut libc::c_void
            },
            buf.len(),
        )
    };
    if res < 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(res as usize)
}

pub fn lsetxattr(path: &Path, name: &CStr, value: &[u8], flags: libc::c_int) -> Result<(), Errno> {
    let c_path = path_to_cstring(path)?;
    let res = unsafe {
        libc::lsetxattr(
            c_path.as_ptr(),
            name.as_ptr(),
            value.as_ptr() as *const libc::c_void,
            value.len(),
            flags,
        )
    };
    if res < 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(())
}

pub fn llistxattr(path: &Path, buf: &mut [u8]) -> Result<usize, Errno> {
    let c_path = path_to_cstring(path)?;
    let res = unsafe {
        libc::llistxattr(
            c_path.as_ptr(),
            if buf.is_empty() {
                std::ptr::null_mut()
            } else {
                buf.as_mut_ptr() as *mut libc::c_char
            },
            buf.len(),
        )
    };
    if res < 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(res as usize)
}

pub fn lremovexattr(path: &Path, name: &CStr) -> Result<(), Errno> {
    let c_path = path_to_cstring(path)?;
    let res = unsafe { libc::lremovexattr(c_path.as_ptr(), name.as_ptr()) };
    if res < 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(())
}

const POSIX_ACL_DEFAULT_XATTR: &CStr = c"system.posix_acl_default";

/// True iff `dir` carries a POSIX default ACL; the kernel then derives child
/// modes itself and umask must not be applied.
pub fn dir_has_default_acl(dir: &Path) -> bool {
    matches!(lgetxattr(dir, POSIX_ACL_DEFAULT_XATTR, &mut []), Ok(n) if n > 0)
}

/// Symlink targets readable for readdirplus and follow-symlink handling.
pub fn read_symlink_bytes(path: &Path) -> Result<Vec<u8>, Errno> {
    Ok(readlink(path)?.into_vec())
}
