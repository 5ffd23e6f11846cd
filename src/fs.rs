use crate::branch::native_path;
use crate::cache;
use crate::clonepath;
use crate::config::{CONTROL_FILE, Config, ConfigStore, ctl_get, ctl_keys, ctl_set};
use crate::engine;
use crate::fsio;
use crate::handle_table::HandleTable;
use crate::policy;
use crate::ugid::{self, UgidGuard};
use crate::util::{
    access_mask_from_bits, errno_from_nix, file_attr_from_stat, make_child_path, retry_eintr,
};
use bytes::Bytes;
use fuse3::path::prelude::*;
use fuse3::path::reply::{DirectoryEntryPlus, ReplyXAttr};
use fuse3::{FileType, SetAttr};
use nix::fcntl::{FallocateFlags, OFlag};
use nix::sys::stat::{Mode, SFlag, fstat};
use nix::sys::time::TimeSpec;
use nix::sys::uio::{pread, pwrite};
use nix::unistd::{Gid, Uid, fdatasync, fsync};
use std::collections::HashSet;
use std::ffi::{CString, OsStr, OsString};
use std::num::NonZeroU32;
use std::os::fd::AsRawFd;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::PathBuf;
use std::time::UNIX_EPOCH;

const MAX_WRITE: u32 = 1 << 20;

pub struct PoolFs {
    config: ConfigStore,
    handles: HandleTable,
    max_write: NonZeroU32,
}

impl PoolFs {
    pub fn new(config: Config) -> Self {
        PoolFs {
            config: ConfigStore::new(config),
            handles: HandleTable::new(),
            max_write: NonZeroU32::new(MAX_WRITE).unwrap(),
        }
    }

    fn stat_virtual(&self, cfg: &Config, path: &OsStr) -> Result<FileAttr, fuse3::Errno> {
        engine::search_op(&cfg.branches, cfg.search_policy(), path, |_, native| {
            let stat = fsio::lstat(native)?;
            Ok(file_attr_from_stat(&stat))
        })
    }

    fn entry_reply(&self, cfg: &Config, path: &OsStr) -> Result<ReplyEntry, fuse3::Errno> {
        let attr = self.stat_virtual(cfg, path)?;
        Ok(ReplyEntry {
            ttl: cfg.entry_ttl(attr.kind),
            attr,
        })
    }

    fn attr_reply(&self, cfg: &Config, path: &OsStr) -> Result<ReplyAttr, fuse3::Errno> {
        let attr = self.stat_virtual(cfg, path)?;
        Ok(ReplyAttr {
            ttl: cfg.attr_ttl(attr.kind),
            attr,
        })
    }

    fn open_common(
        &self,
        cfg: &Config,
        pid: u32,
        path: &OsStr,
        flags: u32,
        create_mode: Option<u32>,
    ) -> Result<(u64, cache::FfiFlags), fuse3::Errno> {
        let ffi = cache::ffi_flags(cfg, pid);
        let mut oflags = flags as i32;
        if cfg.writeback_cache {
            cache::tweak_flags_writeback_cache(&mut oflags);
        }

        let fd = match create_mode {
            Some(mode) => engine::create_op(
                &cfg.branches,
                cfg.search_policy(),
                cfg.func.create,
                cfg.minfreespace,
                path,
                |_, native| {
                    let oflag = OFlag::from_bits_truncate(oflags) | OFlag::O_CREAT;
                    fsio::open(native, oflag, Mode::from_bits_truncate(mode & 0o7777))
                },
            )?,
            None => engine::search_op(&cfg.branches, cfg.func.open, path, |_, native| {
                fsio::open(native, OFlag::from_bits_truncate(oflags), Mode::empty())
            })?,
        };

        let fh = self.handles.insert_file(fd, path);
        Ok((fh, ffi))
    }

    fn union_entries(&self, cfg: &Config, path: &OsStr) -> Vec<(OsString, FileType, PathBuf)> {
        let snapshot = cfg.branches.snapshot();
        let mut seen = HashSet::new();
        let mut out = Vec::new();

        for branch in snapshot.iter() {
            let native_dir = branch.native_path(path);
            let Ok(mut dir) = nix::dir::Dir::open(
                &native_dir,
                OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
                Mode::empty(),
            ) else {
                continue;
            };

            for entry in dir.iter() {
                let Ok(entry) = entry else { continue };
                let name_bytes = entry.file_name().to_bytes();
                if name_bytes == b"." || name_bytes == b".." {
                    continue;
                }
                let name = OsString::from_vec(name_bytes.to_vec());
                if !seen.insert(name.clone()) {
                    continue;
                }
                let native_child = native_dir.join(&name);
                let kind = entry
                    .file_type()
                    .map(file_type_from_dir)
                    .or_else(|| {
                        fsio::lstat(&native_child)
                            .ok()
                            .map(|st| crate::util::file_type_from_mode(st.st_mode))
                    })
                    .unwrap_or(FileType::RegularFile);
                out.push((name, kind, native_child));
            }
        }
        out
    }

    fn apply_times(
        &self,
        cfg: &Config,
        path: &OsStr,
        set_attr: &SetAttr,
    ) -> Result<(), fuse3::Errno> {
        if set_attr.atime.is_none() && set_attr.mtime.is_none() {
            return Ok(());
        }
        let atime = set_attr
            .atime
            .map(|t| TimeSpec::new(t.sec, t.nsec as _))
            .unwrap_or(TimeSpec::UTIME_OMIT);
        let mtime = set_attr
            .mtime
            .map(|t| TimeSpec::new(t.sec, t.nsec as _))
            .unwrap_or(TimeSpec::UTIME_OMIT);

        engine::action_op(&cfg.branches, cfg.func.utimens, path, |_, native| {
            fsio::utimens(native, &atime, &mtime)
        })
    }
}

fn file_type_from_dir(kind: nix::dir::Type) -> FileType {
    match kind {
        nix::dir::Type::Directory => FileType::Directory,
        nix::dir::Type::Symlink => FileType::Symlink,
        nix::dir::Type::BlockDevice => FileType::BlockDevice,
        nix::dir::Type::CharacterDevice => FileType::CharDevice,
        nix::dir::Type::Fifo => FileType::NamedPipe,
        nix::dir::Type::Socket => FileType::Socket,
        nix::dir::Type::File => FileType::RegularFile,
    }
}

fn control_attr() -> FileAttr {
    FileAttr {
        size: 0,
        blocks: 0,
        atime: UNIX_EPOCH,
        mtime: UNIX_EPOCH,
        ctime: UNIX_EPOCH,
        kind: FileType::RegularFile,
        perm: 0o644,
        nlink: 1,
        uid: nix::unistd::getuid().as_raw(),
        gid: nix::unistd::getgid().as_raw(),
        rdev: 0,
        blksize: 4096,
        #[cfg(target_os = "macos")]
        crtime: UNIX_EPOCH,
        #[cfg(target_os = "macos")]
        flags: 0,
    }
}

fn is_control(path: &OsStr) -> bool {
    path == OsStr::new(CONTROL_FILE)
}

fn xattr_name_to_cstring(name: &OsStr) -> Result<CString, fuse3::Errno> {
    CString::new(name.as_bytes()).map_err(|_| fuse3::Errno::from(libc::EINVAL))
}

fn sized_xattr_reply(data: Vec<u8>, size: u32) -> Result<ReplyXAttr, fuse3::Errno> {
    if size == 0 {
        return Ok(ReplyXAttr::Size(data.len() as u32));
    }
    if data.len() > size as usize {
        return Err(fuse3::Errno::from(libc::ERANGE));
    }
    Ok(ReplyXAttr::Data(data.into()))
}

impl PathFilesystem for PoolFs {
    async fn init(&self, _req: Request) -> Result<ReplyInit, fuse3::Errno> {
        Ok(ReplyInit {
            max_write: self.max_write,
        })
    }

    async fn destroy(&self, _req: Request) {}

    async fn lookup(
        &self,
        req: Request,
        parent: &OsStr,
        name: &OsStr,
    ) -> Result<ReplyEntry, fuse3::Errno> {
        let cfg = self.config.read();
        let path = make_child_path(parent, name);
        if is_control(&path) {
            return Ok(ReplyEntry {
                ttl: cfg.cache_entry,
                attr: control_attr(),
            });
        }
        let _ugid = UgidGuard::new(req.uid, req.gid);
        self.entry_reply(&cfg, &path)
    }

    async fn getattr(
        &self,
        req: Request,
        path: Option<&OsStr>,
        fh: Option<u64>,
        _flags: u32,
    ) -> Result<ReplyAttr, fuse3::Errno> {
        let cfg = self.config.read();
        let _ugid = UgidGuard::new(req.uid, req.gid);

        if let Some(handle) = fh.and_then(|id| self.handles.get_file(id)) {
            let stat = fstat(handle.as_fd().as_raw_fd()).map_err(errno_from_nix)?;
            let attr = file_attr_from_stat(&stat);
            return Ok(ReplyAttr {
                ttl: cfg.attr_ttl(attr.kind),
                attr,
            });
        }

        let path = path.ok_or_else(fuse3::Errno::new_not_exist)?;
        if is_control(path) {
            return Ok(ReplyAttr {
                ttl: cfg.cache_attr,
                attr: control_attr(),
            });
        }
        self.attr_reply(&cfg, path)
    }

    async fn setattr(
        &self,
        req: Request,
        path: Option<&OsStr>,
        fh: Option<u64>,
        set_attr: SetAttr,
    ) -> Result<ReplyAttr, fuse3::Errno> {
        let cfg = self.config.read();

        let owned;
        let path = match path {
            Some(path) => path,
            None => {
                let handle = fh
                    .and_then(|id| self.handles.get_file(id))
                    .ok_or_else(|| fuse3::Errno::from(libc::EBADF))?;
                owned = handle.path;
                owned.as_os_str()
            }
        };
        if is_control(path) {
            return Err(fuse3::Errno::from(libc::EPERM));
        }

        let _ugid = UgidGuard::new(req.uid, req.gid);

        if let Some(mode) = set_attr.mode {
            engine::action_op(&cfg.branches, cfg.func.chmod, path, |_, native| {
                fsio::chmod(native, Mode::from_bits_truncate(mode))
            })?;
        }

        if set_attr.uid.is_some() || set_attr.gid.is_some() {
            let uid = set_attr.uid.map(Uid::from_raw);
            let gid = set_attr.gid.map(Gid::from_raw);
            engine::action_op(&cfg.branches, cfg.func.chown, path, |_, native| {
                fsio::lchown(native, uid, gid)
            })?;
        }

        if let Some(size) = set_attr.size {
            engine::action_op(&cfg.branches, cfg.func.truncate, path, |_, native| {
                fsio::truncate(native, size as i64)
            })?;
        }

        self.apply_times(&cfg, path, &set_attr)?;
        self.attr_reply(&cfg, path)
    }

    async fn readlink(&self, req: Request, path: &OsStr) -> Result<ReplyData, fuse3::Errno> {
        let cfg = self.config.read();
        let _ugid = UgidGuard::new(req.uid, req.gid);
        let target = engine::search_op(&cfg.branches, cfg.func.readlink, path, |_, native| {
            fsio::read_symlink_bytes(native)
        })?;
        Ok(Bytes::from(target).into())
    }

    async fn symlink(
        &self,
        req: Request,
        parent: &OsStr,
        name: &OsStr,
        link_path: &OsStr,
    ) -> Result<ReplyEntry, fuse3::Errno> {
        let cfg = self.config.read();
        let _ugid = UgidGuard::new(req.uid, req.gid);
        let path = make_child_path(parent, name);

        engine::create_op(
            &cfg.branches,
            cfg.search_policy(),
            cfg.func.symlink,
            cfg.minfreespace,
            &path,
            |_, native| fsio::symlink(link_path, native),
        )?;
        self.entry_reply(&cfg, &path)
    }

    async fn mknod(
        &self,
        req: Request,
        parent: &OsStr,
        name: &OsStr,
        mode: u32,
        rdev: u32,
    ) -> Result<ReplyEntry, fuse3::Errno> {
        let cfg = self.config.read();
        let _ugid = UgidGuard::new(req.uid, req.gid);
        let path = make_child_path(parent, name);

        engine::create_op(
            &cfg.branches,
            cfg.search_policy(),
            cfg.func.mknod,
            cfg.minfreespace,
            &path,
            |_, native| {
                fsio::mknod(
                    native,
                    SFlag::from_bits_truncate(mode),
                    Mode::from_bits_truncate(mode),
                    rdev as u64,
                )
            },
        )?;
        self.entry_reply(&cfg, &path)
    }

    async fn mkdir(
        &self,
        req: Request,
        parent: &OsStr,
        name: &OsStr,
        mode: u32,
        umask: u32,
    ) -> Result<ReplyEntry, fuse3::Errno> {
        let cfg = self.config.read();
        let _ugid = UgidGuard::new(req.uid, req.gid);
        let path = make_child_path(parent, name);

        engine::create_op(
            &cfg.branches,
            cfg.search_policy(),
            cfg.func.mkdir,
            cfg.minfreespace,
            &path,
            |_, native| {
                // With a default ACL on the parent the kernel derives the
                // mode itself; masking here would double-apply.
                let mode = match native.parent() {
                    Some(dir) if fsio::dir_has_default_acl(dir) => mode,
                    _ => mode & !umask,
                };
                fsio::mkdir(native, Mode::from_bits_truncate(mode))
            },
        )?;
        self.entry_reply(&cfg, &path)
    }

    async fn unlink(&self, req: Request, parent: &OsStr, name: &OsStr) -> Result<(), fuse3::Errno> {
        let cfg = self.config.read();
        let _ugid = UgidGuard::new(req.uid, req.gid);
        let path = make_child_path(parent, name);
        engine::action_op(&cfg.branches, cfg.func.unlink, &path, |_, native| {
            fsio::unlink(native)
        })
    }

    async fn rmdir(&self, req: Request, parent: &OsStr, name: &OsStr) -> Result<(), fuse3::Errno> {
        let cfg = self.config.read();
        let _ugid = UgidGuard::new(req.uid, req.gid);
        let path = make_child_path(parent, name);
        engine::action_op(&cfg.branches, cfg.func.rmdir, &path, |_, native| {
            fsio::rmdir(native)
        })
    }

    async fn rename(
        &self,
        req: Request,
        origin_parent: &OsStr,
        origin_name: &OsStr,
        parent: &OsStr,
        name: &OsStr,
    ) -> Result<(), fuse3::Errno> {
        let cfg = self.config.read();
        let _ugid = UgidGuard::new(req.uid, req.gid);
        let from = make_child_path(origin_parent, origin_name);
        let to = make_child_path(parent, name);
        let todir = crate::util::dirname(&to);

        let snapshot = cfg.branches.snapshot();
        let existing = policy::search(cfg.search_policy(), &snapshot, &todir)?;

        engine::action_op(&cfg.branches, cfg.func.rename, &from, |root, native_from| {
            if !fsio::exists(&native_path(root, &todir)) {
                let _root_scope = ugid::AsRoot::new();
                clonepath::clonepath(&existing[0], root, &todir)?;
            }
            fsio::rename(native_from, &native_path(root, &to))
        })
    }

    async fn link(
        &self,
        req: Request,
        path: &OsStr,
        new_parent: &OsStr,
        new_name: &OsStr,
    ) -> Result<ReplyEntry, fuse3::Errno> {
        let cfg = self.config.read();
        let _ugid = UgidGuard::new(req.uid, req.gid);
        let dest = make_child_path(new_parent, new_name);
        let destdir = crate::util::dirname(&dest);

        let snapshot = cfg.branches.snapshot();
        let existing = policy::search(cfg.search_policy(), &snapshot, &destdir)?;

        engine::action_op(&cfg.branches, cfg.func.link, path, |root, native_old| {
            if !fsio::exists(&native_path(root, &destdir)) {
                let _root_scope = ugid::AsRoot::new();
                clonepath::clonepath(&existing[0], root, &destdir)?;
            }
            fsio::link(native_old, &native_path(root, &dest))
        })?;
        self.entry_reply(&cfg, &dest)
    }

    async fn open(&self, req: Request, path: &OsStr, flags: u32) -> Result<ReplyOpen, fuse3::Errno> {
        let cfg = self.config.read();
        if is_control(path) {
            return Err(fuse3::Errno::from(libc::EACCES));
        }
        let _ugid = UgidGuard::new(req.uid, req.gid);
        let (fh, ffi) = self.open_common(&cfg, req.pid, path, flags, None)?;
        Ok(ReplyOpen {
            fh,
            flags: ffi.to_open_flags(),
        })
    }

    async fn create(
        &self,
        req: Request,
        parent: &OsStr,
        name: &OsStr,
        mode: u32,
        flags: u32,
    ) -> Result<ReplyCreated, fuse3::Errno> {
        let cfg = self.config.read();
        let _ugid = UgidGuard::new(req.uid, req.gid);
        let path = make_child_path(parent, name);

        let (fh, ffi) = self.open_common(&cfg, req.pid, &path, flags, Some(mode))?;
        let handle = self
            .handles
            .get_file(fh)
            .ok_or_else(|| fuse3::Errno::from(libc::EBADF))?;
        let stat = fstat(handle.as_fd().as_raw_fd()).map_err(errno_from_nix)?;
        let attr = file_attr_from_stat(&stat);

        Ok(ReplyCreated {
            ttl: cfg.entry_ttl(attr.kind),
            attr,
            generation: 0,
            fh,
            flags: ffi.to_open_flags(),
        })
    }

    async fn read(
        &self,
        _req: Request,
        _path: Option<&OsStr>,
        fh: u64,
        offset: u64,
        size: u32,
    ) -> Result<ReplyData, fuse3::Errno> {
        let handle = self
            .handles
            .get_file(fh)
            .ok_or_else(|| fuse3::Errno::from(libc::EBADF))?;

        let mut buf = vec![0u8; size as usize];
        let read_len = retry_eintr(|| pread(handle.as_fd(), &mut buf, offset as i64))
            .map_err(errno_from_nix)?;
        buf.truncate(read_len);
        Ok(Bytes::from(buf).into())
    }

    async fn write(
        &self,
        _req: Request,
        _path: Option<&OsStr>,
        fh: u64,
        offset: u64,
        data: &[u8],
        _write_flags: u32,
        _flags: u32,
    ) -> Result<ReplyWrite, fuse3::Errno> {
        let handle = self
            .handles
            .get_file(fh)
            .ok_or_else(|| fuse3::Errno::from(libc::EBADF))?;

        let written =
            retry_eintr(|| pwrite(handle.as_fd(), data, offset as i64)).map_err(errno_from_nix)?;
        Ok(ReplyWrite {
            written: written as u32,
        })
    }

    async fn release(
        &self,
        _req: Request,
        _path: Option<&OsStr>,
        fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> Result<(), fuse3::Errno> {
        self.handles.remove(fh);
        Ok(())
    }

    async fn fsync(
        &self,
        _req: Request,
        _path: Option<&OsStr>,
        fh: u64,
        datasync: bool,
    ) -> Result<(), fuse3::Errno> {
        let handle = self
            .handles
            .get_file(fh)
            .ok_or_else(|| fuse3::Errno::from(libc::EBADF))?;

        if datasync {
            fdatasync(handle.as_fd().as_raw_fd()).map_err(errno_from_nix)
        } else {
            fsync(handle.as_fd().as_raw_fd()).map_err(errno_from_nix)
        }
    }

    async fn flush(
        &self,
        _req: Request,
        _path: Option<&OsStr>,
        fh: u64,
        _lock_owner: u64,
    ) -> Result<(), fuse3::Errno> {
        let handle = self
            .handles
            .get_file(fh)
            .ok_or_else(|| fuse3::Errno::from(libc::EBADF))?;
        fsync(handle.as_fd().as_raw_fd()).map_err(errno_from_nix)
    }

    async fn fallocate(
        &self,
        _req: Request,
        _path: Option<&OsStr>,
        fh: u64,
        offset: u64,
        length: u64,
        mode: u32,
    ) -> Result<(), fuse3::Errno> {
        let handle = self
            .handles
            .get_file(fh)
            .ok_or_else(|| fuse3::Errno::from(libc::EBADF))?;
        nix::fcntl::fallocate(
            handle.as_fd().as_raw_fd(),
            FallocateFlags::from_bits_truncate(mode as i32),
            offset as i64,
            length as i64,
        )
        .map_err(errno_from_nix)
    }

    async fn access(&self, req: Request, path: &OsStr, mask: u32) -> Result<(), fuse3::Errno> {
        let cfg = self.config.read();
        if is_control(path) {
            return Ok(());
        }
        let _ugid = UgidGuard::new(req.uid, req.gid);
        let flags = access_mask_from_bits(mask);
        engine::search_op(&cfg.branches, cfg.func.access, path, |_, native| {
            nix::unistd::access(native, flags).map_err(errno_from_nix)
        })
    }

    async fn setxattr(
        &self,
        req: Request,
        path: &OsStr,
        name: &OsStr,
        value: &[u8],
        flags: u32,
        position: u32,
    ) -> Result<(), fuse3::Errno> {
        if position != 0 {
            return Err(fuse3::Errno::from(libc::EINVAL));
        }
        let cfg = self.config.read();

        if is_control(path) {
            let key = name
                .to_str()
                .ok_or_else(|| fuse3::Errno::from(libc::EINVAL))?;
            let value =
                std::str::from_utf8(value).map_err(|_| fuse3::Errno::from(libc::EINVAL))?;
            return ctl_set(&self.config, key, value);
        }

        let _ugid = UgidGuard::new(req.uid, req.gid);
        let name = xattr_name_to_cstring(name)?;
        engine::action_op(&cfg.branches, cfg.func.setxattr, path, |_, native| {
            fsio::lsetxattr(native, &name, value, flags as libc::c_int)
        })
    }

    async fn getxattr(
        &self,
        req: Request,
        path: &OsStr,
        name: &OsStr,
        size: u32,
    ) -> Result<ReplyXAttr, fuse3::Errno> {
        let cfg = self.config.read();

        if is_control(path) {
            let key = name
                .to_str()
                .ok_or_else(|| fuse3::Errno::from(libc::ENODATA))?;
            let value = ctl_get(&cfg, key).ok_or_else(|| fuse3::Errno::from(libc::ENODATA))?;
            return sized_xattr_reply(value.into_bytes(), size);
        }

        let _ugid = UgidGuard::new(req.uid, req.gid);
        let name = xattr_name_to_cstring(name)?;
        engine::search_op(&cfg.branches, cfg.func.getxattr, path, |_, native| {
            if size == 0 {
                let len = fsio::lgetxattr(native, &name, &mut [])?;
                return Ok(ReplyXAttr::Size(len as u32));
            }
            let mut buf = vec![0u8; size as usize];
            let len = fsio::lgetxattr(native, &name, &mut buf)?;
            buf.truncate(len);
            Ok(ReplyXAttr::Data(buf.into()))
        })
    }

    async fn listxattr(
        &self,
        req: Request,
        path: &OsStr,
        size: u32,
    ) -> Result<ReplyXAttr, fuse3::Errno> {
        let cfg = self.config.read();

        if is_control(path) {
            let mut data = Vec::new();
            for key in ctl_keys(&cfg) {
                data.extend_from_slice(key.as_bytes());
                data.push(0);
            }
            return sized_xattr_reply(data, size);
        }

        let _ugid = UgidGuard::new(req.uid, req.gid);
        engine::search_op(&cfg.branches, cfg.func.listxattr, path, |_, native| {
            if size == 0 {
                let len = fsio::llistxattr(native, &mut [])?;
                return Ok(ReplyXAttr::Size(len as u32));
            }
            let mut buf = vec![0u8; size as usize];
            let len = fsio::llistxattr(native, &mut buf)?;
            buf.truncate(len);
            Ok(ReplyXAttr::Data(buf.into()))
        })
    }

    async fn removexattr(
        &self,
        req: Request,
        path: &OsStr,
        name: &OsStr,
    ) -> Result<(), fuse3::Errno> {
        let cfg = self.config.read();
        if is_control(path) {
            return Err(fuse3::Errno::from(libc::ENODATA));
        }
        let _ugid = UgidGuard::new(req.uid, req.gid);
        let name = xattr_name_to_cstring(name)?;
        engine::action_op(&cfg.branches, cfg.func.removexattr, path, |_, native| {
            fsio::lremovexattr(native, &name)
        })
    }

    async fn opendir(
        &self,
        req: Request,
        path: &OsStr,
        flags: u32,
    ) -> Result<ReplyOpen, fuse3::Errno> {
        let cfg = self.config.read();
        let _ugid = UgidGuard::new(req.uid, req.gid);
        // Resolve now so a missing directory fails at opendir, not readdir.
        self.stat_virtual(&cfg, path)?;
        let fh = self.handles.insert_dir(path);
        Ok(ReplyOpen { fh, flags })
    }

    type DirEntryStream<'a>
        = futures_util::stream::Iter<std::vec::IntoIter<fuse3::Result<DirectoryEntry>>>
    where
        Self: 'a;
    type DirEntryPlusStream<'a>
        = futures_util::stream::Iter<std::vec::IntoIter<fuse3::Result<DirectoryEntryPlus>>>
    where
        Self: 'a;

    async fn readdir<'a>(
        &'a self,
        req: Request,
        _path: &'a OsStr,
        fh: u64,
        offset: i64,
    ) -> Result<ReplyDirectory<Self::DirEntryStream<'a>>, fuse3::Errno> {
        let cfg = self.config.read();
        let handle = self
            .handles
            .get_dir(fh)
            .ok_or_else(|| fuse3::Errno::from(libc::EBADF))?;
        let _ugid = UgidGuard::new(req.uid, req.gid);

        let union = self.union_entries(&cfg, &handle.path);
        let mut entries: Vec<fuse3::Result<DirectoryEntry>> = Vec::with_capacity(union.len() + 2);

        let mut idx: i64 = 0;
        for name in [".", ".."] {
            idx += 1;
            entries.push(Ok(DirectoryEntry {
                kind: FileType::Directory,
                name: OsString::from(name),
                offset: idx,
            }));
        }
        for (name, kind, _) in union {
            idx += 1;
            entries.push(Ok(DirectoryEntry {
                kind,
                name,
                offset: idx,
            }));
        }

        let skip = offset.max(0) as usize;
        let entries: Vec<_> = entries.into_iter().skip(skip).collect();
        Ok(ReplyDirectory {
            entries: futures_util::stream::iter(entries),
        })
    }

    async fn readdirplus<'a>(
        &'a self,
        req: Request,
        _parent: &'a OsStr,
        fh: u64,
        offset: u64,
        _lock_owner: u64,
    ) -> Result<ReplyDirectoryPlus<Self::DirEntryPlusStream<'a>>, fuse3::Errno> {
        let cfg = self.config.read();
        let handle = self
            .handles
            .get_dir(fh)
            .ok_or_else(|| fuse3::Errno::from(libc::EBADF))?;
        let _ugid = UgidGuard::new(req.uid, req.gid);

        let dir_attr = self.stat_virtual(&cfg, &handle.path)?;
        let union = self.union_entries(&cfg, &handle.path);
        let mut entries: Vec<fuse3::Result<DirectoryEntryPlus>> =
            Vec::with_capacity(union.len() + 2);

        let mut idx: i64 = 0;
        for name in [".", ".."] {
            idx += 1;
            entries.push(Ok(DirectoryEntryPlus {
                kind: FileType::Directory,
                name: OsString::from(name),
                offset: idx,
                attr: dir_attr,
                entry_ttl: cfg.cache_entry,
                attr_ttl: cfg.cache_attr,
            }));
        }
        for (name, _, native_child) in union {
            // Entries racing with removal on the backing branch are dropped.
            let Ok(stat) = fsio::lstat(&native_child) else {
                continue;
            };
            let attr = file_attr_from_stat(&stat);
            idx += 1;
            entries.push(Ok(DirectoryEntryPlus {
                kind: attr.kind,
                name,
                offset: idx,
                attr,
                entry_ttl: cfg.entry_ttl(attr.kind),
                attr_ttl: cfg.attr_ttl(attr.kind),
            }));
        }

        let skip = offset as usize;
        let entries: Vec<_> = entries.into_iter().skip(skip).collect();
        Ok(ReplyDirectoryPlus {
            entries: futures_util::stream::iter(entries),
        })
    }

    async fn releasedir(
        &self,
        _req: Request,
        _path: &OsStr,
        fh: u64,
        _flags: u32,
    ) -> Result<(), fuse3::Errno> {
        self.handles.remove(fh);
        Ok(())
    }

    async fn fsyncdir(
        &self,
        _req: Request,
        _path: &OsStr,
        fh: u64,
        _datasync: bool,
    ) -> Result<(), fuse3::Errno> {
        if self.handles.get_dir(fh).is_none() {
            return Err(fuse3::Errno::from(libc::EBADF));
        }
        Ok(())
    }

    async fn statfs(&self, req: Request, _path: &OsStr) -> Result<ReplyStatFs, fuse3::Errno> {
        let cfg = self.config.read();
        let _ugid = UgidGuard::new(req.uid, req.gid);
        let snapshot = cfg.branches.snapshot();

        let mut seen_devs = HashSet::new();
        let mut vfs_entries = Vec::new();
        for branch in snapshot.iter() {
            let Ok(stat) = fsio::lstat(&branch.root) else {
                continue;
            };
            if !seen_devs.insert(stat.st_dev) {
                continue;
            }
            if let Ok(vfs) = fsio::statvfs(&branch.root) {
                vfs_entries.push(vfs);
            }
        }
        if vfs_entries.is_empty() {
            return Err(fuse3::Errno::new_not_exist());
        }

        // Normalize counts to the largest fragment size across branches.
        let frsize = vfs_entries
            .iter()
            .map(|v| v.fragment_size() as u64)
            .max()
            .unwrap()
            .max(1);
        let mut blocks: u64 = 0;
        let mut bfree: u64 = 0;
        let mut bavail: u64 = 0;
        let mut files: u64 = 0;
        let mut ffree: u64 = 0;
        let mut namelen: u64 = u64::MAX;
        for vfs in &vfs_entries {
            let fr = vfs.fragment_size() as u64;
            blocks += vfs.blocks() as u64 * fr / frsize;
            bfree += vfs.blocks_free() as u64 * fr / frsize;
            bavail += vfs.blocks_available() as u64 * fr / frsize;
            files += vfs.files() as u64;
            ffree += vfs.files_free() as u64;
            namelen = namelen.min(vfs.name_max() as u64);
        }

        Ok(ReplyStatFs {
            blocks,
            bfree,
            bavail,
            files,
            ffree,
            bsize: frsize as u32,
            namelen: namelen as u32,
            frsize: frsize as u32,
        })
    }
}
