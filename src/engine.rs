use crate::branch::{Branches, native_path};
use crate::clonepath;
use crate::policy::{self, Policy};
use crate::ugid;
use crate::util::dirname;
use fuse3::Errno;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

/// Folds per-branch results into one errno: the first success is sticky and
/// wins over any failure; otherwise the most recent failure is kept.
#[derive(Debug, Default)]
pub struct ErrorCalc {
    succeeded: bool,
    last: Option<Errno>,
}

impl ErrorCalc {
    pub fn new() -> Self {
        ErrorCalc::default()
    }

    pub fn success(&mut self) {
        self.succeeded = true;
    }

    pub fn failure(&mut self, err: Errno) {
        if !self.succeeded {
            self.last = Some(err);
        }
    }

    pub fn finish(&self) -> Result<(), Errno> {
        if self.succeeded {
            return Ok(());
        }
        match self.last {
            Some(err) => Err(err),
            None => Err(Errno::from(libc::EIO)),
        }
    }
}

fn erofs() -> Errno {
    Errno::from(libc::EROFS)
}

/// Create-category pipeline: resolve where the parent already lives, where
/// the new entry should go, clone the parent chain onto each target branch,
/// run the primitive, and fold. EROFS from a branch demotes it to RO and the
/// create policy is re-evaluated for exactly one more pass. The first
/// successful branch supplies the returned value.
pub fn create_op<T>(
    branches: &Branches,
    search_policy: Policy,
    create_policy: Policy,
    minfreespace: u64,
    fusepath: &OsStr,
    exec: impl Fn(&Path, &Path) -> Result<T, Errno>,
) -> Result<T, Errno> {
    let fusedirpath = dirname(fusepath);
    let snapshot = branches.snapshot();
    let existing = policy::search(search_policy, &snapshot, &fusedirpath)?;
    let creates = policy::create(create_policy, &snapshot, &fusedirpath, minfreespace)?;

    let run = |roots: &[PathBuf], demoted: &mut bool| -> Result<T, Errno> {
        let mut calc = ErrorCalc::new();
        let mut value = None;
        for root in roots {
            let attempt = clone_parent(&existing[0], root, &fusedirpath)
                .and_then(|()| exec(root, &native_path(root, fusepath)));
            match attempt {
                Ok(v) => {
                    if value.is_none() {
                        value = Some(v);
                    }
                    calc.success();
                }
                Err(err) => {
                    if err == erofs() && branches.find_and_demote(root).is_some() {
                        *demoted = true;
                    }
                    calc.failure(err);
                }
            }
        }
        match value {
            Some(v) => Ok(v),
            None => Err(calc.finish().unwrap_err()),
        }
    };

    let mut demoted = false;
    match run(&creates, &mut demoted) {
        Err(err) if err == erofs() && demoted => {
            let snapshot = branches.snapshot();
            let creates = policy::create(create_policy, &snapshot, &fusedirpath, minfreespace)?;
            run(&creates, &mut demoted)
        }
        other => other,
    }
}

fn clone_parent(existing: &Path, target: &Path, fusedirpath: &OsStr) -> Result<(), Errno> {
    if existing == target {
        return Ok(());
    }
    // The chain's owners may be outside the caller's reach.
    let _root = ugid::AsRoot::new();
    clonepath::clonepath(existing, target, fusedirpath)
}

/// Action-category pipeline: fan out over every instance the policy returns,
/// fold, demote on EROFS, retry the whole fan-out once.
pub fn action_op(
    branches: &Branches,
    action_policy: Policy,
    fusepath: &OsStr,
    exec: impl Fn(&Path, &Path) -> Result<(), Errno>,
) -> Result<(), Errno> {
    let snapshot = branches.snapshot();
    let roots = policy::action(action_policy, &snapshot, fusepath)?;

    let run = |roots: &[PathBuf], demoted: &mut bool| -> Result<(), Errno> {
        let mut calc = ErrorCalc::new();
        for root in roots {
            match exec(root, &native_path(root, fusepath)) {
                Ok(()) => calc.success(),
                Err(err) => {
                    if err == erofs() && branches.find_and_demote(root).is_some() {
                        *demoted = true;
                    }
                    calc.failure(err);
                }
            }
        }
        calc.finish()
    };

    let mut demoted = false;
    match run(&roots, &mut demoted) {
        Err(err) if err == erofs() && demoted => {
            let snapshot = branches.snapshot();
            let roots = policy::action(action_policy, &snapshot, fusepath)?;
            run(&roots, &mut demoted)
        }
        other => other,
    }
}

/// Search-category resolution: the first instance the policy returns serves
/// the request.
pub fn search_op<T>(
    branches: &Branches,
    search_policy: Policy,
    fusepath: &OsStr,
    exec: impl FnOnce(&Path, &Path) -> Result<T, Errno>,
) -> Result<T, Errno> {
    let snapshot = branches.snapshot();
    let roots = policy::search(search_policy, &snapshot, fusepath)?;
    exec(&roots[0], &native_path(&roots[0], fusepath))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::{Branch, BranchMode};
    use crate::fsio;
    use nix::sys::stat::Mode;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn pool(dirs: &[(&TempDir, BranchMode)]) -> Branches {
        Branches::new(
            dirs.iter()
                .map(|(d, m)| Branch::new(d.path().to_path_buf(), *m))
                .collect(),
        )
    }

    #[test]
    fn error_calc_success_is_sticky() {
        let mut calc = ErrorCalc::new();
        calc.success();
        calc.failure(Errno::from(libc::EPERM));
        assert!(calc.finish().is_ok());
    }

    #[test]
    fn error_calc_keeps_the_most_recent_failure() {
        let mut calc = ErrorCalc::new();
        calc.failure(Errno::from(libc::ENOENT));
        calc.failure(Errno::from(libc::EPERM));
        assert_eq!(calc.finish().unwrap_err(), Errno::from(libc::EPERM));

        let mut calc = ErrorCalc::new();
        calc.failure(Errno::from(libc::EPERM));
        calc.success();
        assert!(calc.finish().is_ok());
    }

    #[test]
    fn error_calc_with_no_attempts_is_an_io_error() {
        let calc = ErrorCalc::new();
        assert_eq!(calc.finish().unwrap_err(), Errno::from(libc::EIO));
    }

    #[test]
    fn create_op_places_entry_on_first_writable_branch() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        let branches = pool(&[(&a, BranchMode::ReadOnly), (&b, BranchMode::ReadWrite)]);

        create_op(
            &branches,
            Policy::Ff,
            Policy::Ff,
            0,
            std::ffi::OsStr::new("/d"),
            |_, native| fsio::mkdir(native, Mode::from_bits_truncate(0o755)),
        )
        .unwrap();

        assert!(!a.path().join("d").exists());
        assert!(b.path().join("d").is_dir());
    }

    #[test]
    fn create_op_demotes_on_erofs_and_retries_once() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        let branches = pool(&[(&a, BranchMode::ReadWrite), (&b, BranchMode::ReadWrite)]);
        let attempts = AtomicUsize::new(0);

        // Branch A claims EROFS, as a backing mount gone read-only would.
        create_op(
            &branches,
            Policy::Ff,
            Policy::Ff,
            0,
            std::ffi::OsStr::new("/y"),
            |root, native| {
                attempts.fetch_add(1, Ordering::Relaxed);
                if root == a.path() {
                    return Err(Errno::from(libc::EROFS));
                }
                fs::write(native, b"").map_err(Errno::from)
            },
        )
        .unwrap();

        assert_eq!(attempts.load(Ordering::Relaxed), 2);
        assert!(b.path().join("y").is_file());
        let snap = branches.snapshot();
        assert_eq!(snap[0].mode, BranchMode::ReadOnly);
        assert_eq!(snap[1].mode, BranchMode::ReadWrite);
    }

    #[test]
    fn create_op_gives_up_after_one_retry() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        let branches = pool(&[(&a, BranchMode::ReadWrite), (&b, BranchMode::ReadWrite)]);
        let attempts = AtomicUsize::new(0);

        let err = create_op(
            &branches,
            Policy::Ff,
            Policy::Ff,
            0,
            std::ffi::OsStr::new("/y"),
            |_, _| -> Result<(), Errno> {
                attempts.fetch_add(1, Ordering::Relaxed);
                Err(Errno::from(libc::EROFS))
            },
        )
        .unwrap_err();

        assert_eq!(err, Errno::from(libc::EROFS));
        assert_eq!(attempts.load(Ordering::Relaxed), 2);
        let snap = branches.snapshot();
        assert!(snap.iter().all(|b| b.mode == BranchMode::ReadOnly));
    }

    #[test]
    fn create_op_does_not_retry_enospc() {
        let a = TempDir::new().unwrap();
        let branches = pool(&[(&a, BranchMode::ReadWrite)]);
        let attempts = AtomicUsize::new(0);

        let err = create_op(
            &branches,
            Policy::Ff,
            Policy::Ff,
            0,
            std::ffi::OsStr::new("/z"),
            |_, _| -> Result<(), Errno> {
                attempts.fetch_add(1, Ordering::Relaxed);
                Err(Errno::from(libc::ENOSPC))
            },
        )
        .unwrap_err();

        assert_eq!(err, Errno::from(libc::ENOSPC));
        assert_eq!(attempts.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn create_op_clones_the_parent_chain() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        fs::create_dir_all(a.path().join("a/b/c")).unwrap();
        for dir in ["a", "a/b", "a/b/c"] {
            fs::set_permissions(a.path().join(dir), fs::Permissions::from_mode(0o750)).unwrap();
        }
        // B first so the create lands there while the chain lives on A.
        let branches = pool(&[(&b, BranchMode::ReadWrite), (&a, BranchMode::ReadWrite)]);

        create_op(
            &branches,
            Policy::Ff,
            Policy::Ff,
            0,
            std::ffi::OsStr::new("/a/b/c/new"),
            |_, native| fs::write(native, b"").map_err(Errno::from),
        )
        .unwrap();

        for dir in ["a", "a/b", "a/b/c"] {
            let meta = fs::metadata(b.path().join(dir)).unwrap();
            assert!(meta.is_dir());
            assert_eq!(meta.permissions().mode() & 0o7777, 0o750);
        }
        assert!(b.path().join("a/b/c/new").is_file());
    }

    #[test]
    fn action_op_fans_out_and_success_wins() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        let c = TempDir::new().unwrap();
        fs::write(a.path().join("k"), b"").unwrap();
        fs::write(c.path().join("k"), b"").unwrap();
        let branches = pool(&[
            (&a, BranchMode::ReadWrite),
            (&b, BranchMode::ReadWrite),
            (&c, BranchMode::ReadWrite),
        ]);
        let touched = AtomicUsize::new(0);

        action_op(&branches, Policy::All, std::ffi::OsStr::new("/k"), |root, native| {
            touched.fetch_add(1, Ordering::Relaxed);
            if root == c.path() {
                return Err(Errno::from(libc::EPERM));
            }
            fsio::chmod(native, Mode::from_bits_truncate(0o644))
        })
        .unwrap();

        // Both instances were visited even though one failed.
        assert_eq!(touched.load(Ordering::Relaxed), 2);
        let meta = fs::metadata(a.path().join("k")).unwrap();
        assert_eq!(meta.permissions().mode() & 0o7777, 0o644);
    }

    #[test]
    fn search_op_resolves_in_branch_order() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        fs::write(a.path().join("f"), b"from-a").unwrap();
        fs::write(b.path().join("f"), b"from-b").unwrap();
        let branches = pool(&[(&a, BranchMode::ReadOnly), (&b, BranchMode::ReadWrite)]);

        let data = search_op(
            &branches,
            Policy::Ff,
            std::ffi::OsStr::new("/f"),
            |_, native| fs::read(native).map_err(Errno::from),
        )
        .unwrap();
        assert_eq!(data, b"from-a");
    }
}
