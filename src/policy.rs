use crate::branch::{Branch, native_path};
use crate::fsio::{self, FsInfo};
use fuse3::Errno;
use rand::Rng;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Operation classification the per-op policy tables are keyed by.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Category {
    Create,
    Action,
    Search,
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Category::Create),
            "action" => Ok(Category::Action),
            "search" => Ok(Category::Search),
            other => Err(format!("unknown category {other:?}")),
        }
    }
}

/// Branch selection algorithm. A policy is pure: it reads a branch snapshot
/// and the filesystem, never mutates either, and two evaluations over the
/// same snapshot and disk state agree.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Policy {
    All,
    Epall,
    Epff,
    Epmfs,
    Ff,
    Ffwp,
    Fwfs,
    Lfs,
    Mfs,
    Newest,
    Pfrd,
    Rand,
}

impl Policy {
    pub fn as_str(self) -> &'static str {
        match self {
            Policy::All => "all",
            Policy::Epall => "epall",
            Policy::Epff => "epff",
            Policy::Epmfs => "epmfs",
            Policy::Ff => "ff",
            Policy::Ffwp => "ffwp",
            Policy::Fwfs => "fwfs",
            Policy::Lfs => "lfs",
            Policy::Mfs => "mfs",
            Policy::Newest => "newest",
            Policy::Pfrd => "pfrd",
            Policy::Rand => "rand",
        }
    }

    /// Create-category variants that additionally require the (parent) path
    /// to already live on the branch.
    fn requires_existing_path(self) -> bool {
        matches!(
            self,
            Policy::Epall | Policy::Epff | Policy::Epmfs | Policy::Ffwp | Policy::Newest
        )
    }

    fn select(self) -> Select {
        match self {
            Policy::All | Policy::Epall => Select::All,
            Policy::Ff | Policy::Epff | Policy::Ffwp | Policy::Fwfs => Select::First,
            Policy::Mfs | Policy::Epmfs => Select::MaxAvail,
            Policy::Lfs => Select::MinAvail,
            Policy::Newest => Select::Newest,
            Policy::Rand => Select::Rand,
            Policy::Pfrd => Select::WeightedRand,
        }
    }
}

impl FromStr for Policy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(Policy::All),
            "epall" => Ok(Policy::Epall),
            "epff" => Ok(Policy::Epff),
            "epmfs" => Ok(Policy::Epmfs),
            "ff" => Ok(Policy::Ff),
            "ffwp" => Ok(Policy::Ffwp),
            "fwfs" => Ok(Policy::Fwfs),
            "lfs" => Ok(Policy::Lfs),
            "mfs" => Ok(Policy::Mfs),
            "newest" => Ok(Policy::Newest),
            "pfrd" => Ok(Policy::Pfrd),
            "rand" => Ok(Policy::Rand),
            other => Err(format!("unknown policy {other:?}")),
        }
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy)]
enum Select {
    All,
    First,
    MaxAvail,
    MinAvail,
    Newest,
    Rand,
    WeightedRand,
}

impl Select {
    fn needs_avail(self) -> bool {
        matches!(self, Select::MaxAvail | Select::MinAvail | Select::WeightedRand)
    }
}

/// Sticky errno across skipped branches: a later failure replaces the held
/// one only when it is more actionable (ENOENT < EROFS < ENOSPC).
struct StickyErrno {
    errno: i32,
}

fn errno_rank(errno: i32) -> u8 {
    match errno {
        libc::ENOSPC => 2,
        libc::EROFS => 1,
        _ => 0,
    }
}

impl StickyErrno {
    fn new() -> Self {
        StickyErrno {
            errno: libc::ENOENT,
        }
    }

    fn note(&mut self, errno: i32) {
        if errno_rank(errno) > errno_rank(self.errno) {
            self.errno = errno;
        }
    }

    fn into_errno(self) -> Errno {
        Errno::from(self.errno)
    }
}

/// statvfs results are cached for the lifetime of one policy evaluation.
#[derive(Default)]
struct FsInfoCache {
    map: HashMap<PathBuf, Option<FsInfo>>,
}

impl FsInfoCache {
    fn get(&mut self, root: &Path) -> Option<FsInfo> {
        if let Some(cached) = self.map.get(root) {
            return *cached;
        }
        let info = fsio::fs_info(root).ok();
        self.map.insert(root.to_path_buf(), info);
        info
    }
}

struct Qualifier {
    root: PathBuf,
    avail: u64,
}

/// Where may a new entry be placed? `fusepath` is the virtual parent
/// directory of the entry being created.
pub fn create(
    policy: Policy,
    branches: &[Branch],
    fusepath: &OsStr,
    global_minfreespace: u64,
) -> Result<Vec<PathBuf>, Errno> {
    let mut cache = FsInfoCache::default();
    let mut sticky = StickyErrno::new();
    let mut quals = Vec::new();

    for branch in branches {
        if policy.requires_existing_path() && !fsio::exists(&branch.native_path(fusepath)) {
            sticky.note(libc::ENOENT);
            continue;
        }
        if branch.mode.no_create() {
            sticky.note(libc::EROFS);
            continue;
        }
        let Some(info) = cache.get(&branch.root) else {
            sticky.note(libc::ENOENT);
            continue;
        };
        if info.readonly {
            sticky.note(libc::EROFS);
            continue;
        }
        if info.spaceavail < branch.effective_minfreespace(global_minfreespace) {
            sticky.note(libc::ENOSPC);
            continue;
        }
        quals.push(Qualifier {
            root: branch.root.clone(),
            avail: info.spaceavail,
        });
    }

    if quals.is_empty() {
        return Err(sticky.into_errno());
    }
    select_roots(policy, quals, fusepath)
}

/// Which existing instances may be modified?
pub fn action(policy: Policy, branches: &[Branch], fusepath: &OsStr) -> Result<Vec<PathBuf>, Errno> {
    let mut cache = FsInfoCache::default();
    let mut sticky = StickyErrno::new();
    let mut quals = Vec::new();

    for branch in branches {
        if !fsio::exists(&branch.native_path(fusepath)) {
            sticky.note(libc::ENOENT);
            continue;
        }
        if branch.mode.read_only() {
            sticky.note(libc::EROFS);
            continue;
        }
        let Some(info) = cache.get(&branch.root) else {
            sticky.note(libc::ENOENT);
            continue;
        };
        if info.readonly {
            sticky.note(libc::EROFS);
            continue;
        }
        quals.push(Qualifier {
            root: branch.root.clone(),
            avail: info.spaceavail,
        });
    }

    if quals.is_empty() {
        return Err(sticky.into_errno());
    }
    select_roots(policy, quals, fusepath)
}

/// Where does this already exist? Branch mode never disqualifies.
pub fn search(policy: Policy, branches: &[Branch], fusepath: &OsStr) -> Result<Vec<PathBuf>, Errno> {
    let mut cache = FsInfoCache::default();
    let mut quals = Vec::new();
    let needs_avail = policy.select().needs_avail();

    for branch in branches {
        if !fsio::exists(&branch.native_path(fusepath)) {
            continue;
        }
        let avail = if needs_avail {
            match cache.get(&branch.root) {
                Some(info) => info.spaceavail,
                None => continue,
            }
        } else {
            0
        };
        quals.push(Qualifier {
            root: branch.root.clone(),
            avail,
        });
    }

    if quals.is_empty() {
        return Err(Errno::new_not_exist());
    }
    select_roots(policy, quals, fusepath)
}

fn select_roots(
    policy: Policy,
    quals: Vec<Qualifier>,
    fusepath: &OsStr,
) -> Result<Vec<PathBuf>, Errno> {
    let pick = |idx: usize, quals: Vec<Qualifier>| vec![quals.into_iter().nth(idx).unwrap().root];

    match policy.select() {
        Select::All => Ok(quals.into_iter().map(|q| q.root).collect()),
        Select::First => Ok(pick(0, quals)),
        Select::MaxAvail => {
            let mut best = 0;
            for (idx, qual) in quals.iter().enumerate() {
                if qual.avail > quals[best].avail {
                    best = idx;
                }
            }
            Ok(pick(best, quals))
        }
        Select::MinAvail => {
            let mut best = 0;
            for (idx, qual) in quals.iter().enumerate() {
                if qual.avail < quals[best].avail {
                    best = idx;
                }
            }
            Ok(pick(best, quals))
        }
        Select::Newest => {
            let mut best: Option<(usize, (i64, i64))> = None;
            for (idx, qual) in quals.iter().enumerate() {
                let Ok(st) = fsio::lstat(&native_path(&qual.root, fusepath)) else {
                    continue;
                };
                let mtime = (st.st_mtime, st.st_mtime_nsec);
                if best.is_none_or(|(_, t)| mtime > t) {
                    best = Some((idx, mtime));
                }
            }
            match best {
                Some((idx, _)) => Ok(pick(idx, quals)),
                None => Err(Errno::new_not_exist()),
            }
        }
        Select::Rand => {
            let idx = rand::thread_rng().gen_range(0..quals.len());
            Ok(pick(idx, quals))
        }
        Select::WeightedRand => {
            let total: u64 = quals.iter().map(|q| q.avail).sum();
            if total == 0 {
                let idx = rand::thread_rng().gen_range(0..quals.len());
                return Ok(pick(idx, quals));
            }
            let mut point = rand::thread_rng().gen_range(0..total);
            for (idx, qual) in quals.iter().enumerate() {
                if point < qual.avail {
                    return Ok(pick(idx, quals));
                }
                point -= qual.avail;
            }
            Ok(pick(quals.len() - 1, quals))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::BranchMode;
    use nix::sys::time::TimeSpec;
    use std::fs;
    use tempfile::TempDir;

    fn branch(dir: &TempDir, mode: BranchMode) -> Branch {
        Branch::new(dir.path().to_path_buf(), mode)
    }

    fn qual(root: &str, avail: u64) -> Qualifier {
        Qualifier {
            root: PathBuf::from(root),
            avail,
        }
    }

    #[test]
    fn ff_create_skips_non_writable_branches() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        let branches = vec![branch(&a, BranchMode::ReadOnly), branch(&b, BranchMode::ReadWrite)];

        let roots = create(Policy::Ff, &branches, OsStr::new("/"), 0).unwrap();
        assert_eq!(roots, vec![b.path().to_path_buf()]);
    }

    #[test]
    fn nc_branch_is_excluded_from_create_but_not_action() {
        let a = TempDir::new().unwrap();
        let branches = vec![branch(&a, BranchMode::NoCreate)];

        let err = create(Policy::Ff, &branches, OsStr::new("/"), 0).unwrap_err();
        assert_eq!(err, Errno::from(libc::EROFS));

        let roots = action(Policy::Ff, &branches, OsStr::new("/")).unwrap();
        assert_eq!(roots, vec![a.path().to_path_buf()]);
    }

    #[test]
    fn search_ignores_branch_mode() {
        let a = TempDir::new().unwrap();
        let branches = vec![branch(&a, BranchMode::ReadOnly)];
        let roots = search(Policy::Ff, &branches, OsStr::new("/")).unwrap();
        assert_eq!(roots, vec![a.path().to_path_buf()]);
    }

    #[test]
    fn existing_path_policies_require_the_parent_on_branch() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        let c = TempDir::new().unwrap();
        fs::create_dir(c.path().join("parent")).unwrap();
        let branches = vec![
            branch(&a, BranchMode::ReadWrite),
            branch(&b, BranchMode::ReadWrite),
            branch(&c, BranchMode::ReadWrite),
        ];

        let roots = create(Policy::Epff, &branches, OsStr::new("/parent"), 0).unwrap();
        assert_eq!(roots, vec![c.path().to_path_buf()]);

        let roots = create(Policy::Epall, &branches, OsStr::new("/parent"), 0).unwrap();
        assert_eq!(roots, vec![c.path().to_path_buf()]);
    }

    #[test]
    fn empty_result_surfaces_the_stickiest_errno() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();

        // Only existence failures: ENOENT.
        let branches = vec![branch(&a, BranchMode::ReadWrite)];
        let err = create(Policy::Epff, &branches, OsStr::new("/missing"), 0).unwrap_err();
        assert_eq!(err, Errno::from(libc::ENOENT));

        // Mode failure outranks existence failure.
        let branches = vec![branch(&a, BranchMode::ReadOnly)];
        let err = create(Policy::Ff, &branches, OsStr::new("/"), 0).unwrap_err();
        assert_eq!(err, Errno::from(libc::EROFS));

        // Space failure outranks both.
        let branches = vec![branch(&a, BranchMode::ReadOnly), branch(&b, BranchMode::ReadWrite)];
        let err = create(Policy::Ff, &branches, OsStr::new("/"), u64::MAX).unwrap_err();
        assert_eq!(err, Errno::from(libc::ENOSPC));
    }

    #[test]
    fn action_reports_enoent_for_missing_path() {
        let a = TempDir::new().unwrap();
        let branches = vec![branch(&a, BranchMode::ReadWrite)];
        let err = action(Policy::All, &branches, OsStr::new("/nope")).unwrap_err();
        assert_eq!(err, Errno::from(libc::ENOENT));
    }

    #[test]
    fn policy_evaluation_is_pure() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        let branches = vec![branch(&a, BranchMode::ReadWrite), branch(&b, BranchMode::ReadWrite)];

        let first = create(Policy::Ff, &branches, OsStr::new("/"), 0).unwrap();
        let second = create(Policy::Ff, &branches, OsStr::new("/"), 0).unwrap();
        assert_eq!(first, second);
        assert_eq!(branches.len(), 2);
    }

    #[test]
    fn mfs_and_lfs_select_by_available_space() {
        let quals = vec![qual("/a", 10), qual("/b", 50), qual("/c", 5)];
        let roots = select_roots(Policy::Mfs, quals, OsStr::new("/")).unwrap();
        assert_eq!(roots, vec![PathBuf::from("/b")]);

        let quals = vec![qual("/a", 10), qual("/b", 50), qual("/c", 5)];
        let roots = select_roots(Policy::Lfs, quals, OsStr::new("/")).unwrap();
        assert_eq!(roots, vec![PathBuf::from("/c")]);

        // Ties break toward branch order.
        let quals = vec![qual("/a", 50), qual("/b", 50)];
        let roots = select_roots(Policy::Mfs, quals, OsStr::new("/")).unwrap();
        assert_eq!(roots, vec![PathBuf::from("/a")]);
    }

    #[test]
    fn all_returns_every_qualifier_in_order() {
        let quals = vec![qual("/a", 1), qual("/b", 2)];
        let roots = select_roots(Policy::All, quals, OsStr::new("/")).unwrap();
        assert_eq!(roots, vec![PathBuf::from("/a"), PathBuf::from("/b")]);
    }

    #[test]
    fn random_policies_pick_from_the_qualifier_set() {
        for _ in 0..16 {
            let quals = vec![qual("/a", 10), qual("/b", 0)];
            let roots = select_roots(Policy::Rand, quals, OsStr::new("/")).unwrap();
            assert_eq!(roots.len(), 1);
            assert!(roots[0] == Path::new("/a") || roots[0] == Path::new("/b"));
        }
        // All weight on one branch: pfrd must pick it.
        let quals = vec![qual("/a", 10), qual("/b", 0)];
        let roots = select_roots(Policy::Pfrd, quals, OsStr::new("/")).unwrap();
        assert_eq!(roots, vec![PathBuf::from("/a")]);
    }

    #[test]
    fn newest_prefers_the_most_recent_mtime() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        fs::write(a.path().join("f"), b"").unwrap();
        fs::write(b.path().join("f"), b"").unwrap();
        let old = TimeSpec::new(1_000_000, 0);
        let new = TimeSpec::new(2_000_000, 0);
        fsio::utimens(&a.path().join("f"), &old, &old).unwrap();
        fsio::utimens(&b.path().join("f"), &new, &new).unwrap();

        let branches = vec![branch(&a, BranchMode::ReadWrite), branch(&b, BranchMode::ReadWrite)];
        let roots = search(Policy::Newest, &branches, OsStr::new("/f")).unwrap();
        assert_eq!(roots, vec![b.path().to_path_buf()]);
    }

    #[test]
    fn policy_names_round_trip() {
        for name in [
            "all", "epall", "epff", "epmfs", "ff", "ffwp", "fwfs", "lfs", "mfs", "newest",
            "pfrd", "rand",
        ] {
            let policy: Policy = name.parse().unwrap();
            assert_eq!(policy.as_str(), name);
        }
        assert!("firstfound".parse::<Policy>().is_err());
    }
}
