use crate::fsio;
use fuse3::Errno;
use nix::sys::stat::Mode;
use nix::sys::time::TimeSpec;
use nix::unistd::{Gid, Uid};
use std::ffi::{CString, OsStr};
use std::path::{Component, Path, PathBuf};

/// Rebuild every missing ancestor of `fusedirpath` on `dst_root`, copying
/// owner, mode, extended attributes (POSIX ACLs included), and timestamps
/// from the same ancestor on `src_root`. Walks root-outward; components that
/// already exist are left alone, so the call is idempotent and safe to race.
/// A partial chain left behind by a failure is not rolled back.
pub fn clonepath(src_root: &Path, dst_root: &Path, fusedirpath: &OsStr) -> Result<(), Errno> {
    if src_root == dst_root {
        return Ok(());
    }

    let mut rel = PathBuf::new();
    for component in Path::new(fusedirpath).components() {
        let Component::Normal(name) = component else {
            continue;
        };
        rel.push(name);

        let dst = dst_root.join(&rel);
        if fsio::exists(&dst) {
            continue;
        }

        let src = src_root.join(&rel);
        let st = fsio::lstat(&src)?;
        let mode = Mode::from_bits_truncate(st.st_mode);
        match fsio::mkdir(&dst, mode) {
            Ok(()) => {}
            // Lost a race with another request cloning the same chain.
            Err(err) if err == Errno::from(libc::EEXIST) => continue,
            Err(err) => return Err(err),
        }

        fsio::lchown(&dst, Some(Uid::from_raw(st.st_uid)), Some(Gid::from_raw(st.st_gid)))?;
        // mkdir honors the umask; reassert the source's exact bits.
        fsio::chmod(&dst, mode)?;
        copy_xattrs(&src, &dst)?;
        let atime = TimeSpec::new(st.st_atime, st.st_atime_nsec);
        let mtime = TimeSpec::new(st.st_mtime, st.st_mtime_nsec);
        fsio::utimens(&dst, &atime, &mtime)?;
    }

    Ok(())
}

fn copy_xattrs(src: &Path, dst: &Path) -> Result<(), Errno> {
    let names = match list_xattr_names(src) {
        Ok(names) => names,
        // Source filesystem has no xattr support; nothing to copy.
        Err(err) if err == Errno::from(libc::EOPNOTSUPP) => return Ok(()),
        Err(err) => return Err(err),
    };

    let mut value = Vec::new();
    for name in names {
        let size = fsio::lgetxattr(src, &name, &mut [])?;
        value.resize(size, 0);
        let size = fsio::lgetxattr(src, &name, &mut value)?;
        match fsio::lsetxattr(dst, &name, &value[..size], 0) {
            Ok(()) => {}
            // Destination cannot hold this attribute class; keep the rest.
            Err(err)
                if err == Errno::from(libc::EOPNOTSUPP)
                    || err == Errno::from(libc::EPERM) => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

fn list_xattr_names(path: &Path) -> Result<Vec<CString>, Errno> {
    let size = fsio::llistxattr(path, &mut [])?;
    if size == 0 {
        return Ok(Vec::new());
    }
    let mut buf = vec![0u8; size];
    let size = fsio::llistxattr(path, &mut buf)?;
    buf.truncate(size);

    let mut names = Vec::new();
    for chunk in buf.split(|b| *b == 0) {
        if chunk.is_empty() {
            continue;
        }
        if let Ok(name) = CString::new(chunk.to_vec()) {
            names.push(name);
        }
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    #[test]
    fn clones_missing_ancestors_with_mode() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        fs::create_dir_all(src.path().join("a/b/c")).unwrap();
        for dir in ["a", "a/b", "a/b/c"] {
            fs::set_permissions(src.path().join(dir), fs::Permissions::from_mode(0o750)).unwrap();
        }

        clonepath(src.path(), dst.path(), OsStr::new("/a/b/c")).unwrap();

        for dir in ["a", "a/b", "a/b/c"] {
            let meta = fs::metadata(dst.path().join(dir)).unwrap();
            assert!(meta.is_dir());
            assert_eq!(meta.permissions().mode() & 0o7777, 0o750);
        }
    }

    #[test]
    fn clone_preserves_timestamps() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        fs::create_dir(src.path().join("d")).unwrap();
        let when = TimeSpec::new(1_500_000_000, 0);
        fsio::utimens(&src.path().join("d"), &when, &when).unwrap();

        clonepath(src.path(), dst.path(), OsStr::new("/d")).unwrap();

        let st = fsio::lstat(&dst.path().join("d")).unwrap();
        assert_eq!(st.st_mtime, 1_500_000_000);
    }

    #[test]
    fn clone_is_idempotent_and_keeps_existing_components() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        fs::create_dir_all(src.path().join("a/b")).unwrap();
        fs::create_dir(dst.path().join("a")).unwrap();
        fs::set_permissions(dst.path().join("a"), fs::Permissions::from_mode(0o700)).unwrap();

        clonepath(src.path(), dst.path(), OsStr::new("/a/b")).unwrap();
        clonepath(src.path(), dst.path(), OsStr::new("/a/b")).unwrap();

        // The pre-existing component was not touched.
        let meta = fs::metadata(dst.path().join("a")).unwrap();
        assert_eq!(meta.permissions().mode() & 0o7777, 0o700);
        assert!(dst.path().join("a/b").is_dir());
    }

    #[test]
    fn clone_of_root_or_same_branch_is_a_noop() {
        let src = TempDir::new().unwrap();
        clonepath(src.path(), src.path(), OsStr::new("/a/b")).unwrap();
        let dst = TempDir::new().unwrap();
        clonepath(src.path(), dst.path(), OsStr::new("/")).unwrap();
    }

    #[test]
    fn missing_source_ancestor_is_an_error() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let err = clonepath(src.path(), dst.path(), OsStr::new("/nope")).unwrap_err();
        assert_eq!(err, Errno::from(libc::ENOENT));
    }
}
