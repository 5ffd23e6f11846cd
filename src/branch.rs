use parking_lot::RwLock;
use std::ffi::OsStr;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tracing::warn;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BranchMode {
    ReadWrite,
    ReadOnly,
    NoCreate,
}

impl BranchMode {
    /// Existing entries may not be modified either.
    pub fn read_only(self) -> bool {
        matches!(self, BranchMode::ReadOnly)
    }

    /// New entries may not be created here.
    pub fn no_create(self) -> bool {
        !matches!(self, BranchMode::ReadWrite)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BranchMode::ReadWrite => "RW",
            BranchMode::ReadOnly => "RO",
            BranchMode::NoCreate => "NC",
        }
    }
}

impl FromStr for BranchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "RW" => Ok(BranchMode::ReadWrite),
            "RO" => Ok(BranchMode::ReadOnly),
            "NC" => Ok(BranchMode::NoCreate),
            other => Err(format!("unknown branch mode {other:?} (expected RW, RO, or NC)")),
        }
    }
}

impl fmt::Display for BranchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parse a byte count with optional 1024-based K/M/G/T suffix.
pub fn parse_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty size".to_string());
    }
    let (digits, mult) = match s.as_bytes()[s.len() - 1].to_ascii_uppercase() {
        b'K' => (&s[..s.len() - 1], 1u64 << 10),
        b'M' => (&s[..s.len() - 1], 1u64 << 20),
        b'G' => (&s[..s.len() - 1], 1u64 << 30),
        b'T' => (&s[..s.len() - 1], 1u64 << 40),
        _ => (s, 1),
    };
    digits
        .parse::<u64>()
        .map_err(|_| format!("invalid size {s:?}"))?
        .checked_mul(mult)
        .ok_or_else(|| format!("size {s:?} overflows"))
}

#[derive(Clone, Debug)]
pub struct Branch {
    pub root: PathBuf,
    pub mode: BranchMode,
    pub minfreespace: Option<u64>,
}

impl Branch {
    pub fn new(root: PathBuf, mode: BranchMode) -> Self {
        Branch {
            root,
            mode,
            minfreespace: None,
        }
    }

    /// A per-branch floor never lowers the global one.
    pub fn effective_minfreespace(&self, global: u64) -> u64 {
        match self.minfreespace {
            Some(own) => own.max(global),
            None => global,
        }
    }

    pub fn native_path(&self, fusepath: &OsStr) -> PathBuf {
        native_path(&self.root, fusepath)
    }

    pub fn spec(&self) -> String {
        match self.minfreespace {
            Some(min) => format!("{}={}={}", self.root.display(), self.mode, min),
            None => format!("{}={}", self.root.display(), self.mode),
        }
    }
}

/// `branch_root` ⧺ absolute virtual path, by concatenation.
pub fn native_path(root: &Path, fusepath: &OsStr) -> PathBuf {
    let rel = Path::new(fusepath);
    let rel = rel.strip_prefix("/").unwrap_or(rel);
    if rel.as_os_str().is_empty() {
        root.to_path_buf()
    } else {
        root.join(rel)
    }
}

impl FromStr for Branch {
    type Err = String;

    /// `<path>[=RW|=RO|=NC[=<minfreespace>]]`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('=');
        let root = parts.next().filter(|p| !p.is_empty()).ok_or("empty branch path")?;
        if !root.starts_with('/') {
            return Err(format!("branch path {root:?} must be absolute"));
        }
        let mode = match parts.next() {
            Some(m) => m.parse::<BranchMode>()?,
            None => BranchMode::ReadWrite,
        };
        let minfreespace = match parts.next() {
            Some(v) => Some(parse_size(v)?),
            None => None,
        };
        if parts.next().is_some() {
            return Err(format!("trailing fields in branch spec {s:?}"));
        }
        Ok(Branch {
            root: PathBuf::from(root),
            mode,
            minfreespace,
        })
    }
}

/// Parse a colon-separated branch list.
pub fn parse_branch_list(s: &str) -> Result<Vec<Branch>, String> {
    let branches = s
        .split(':')
        .filter(|spec| !spec.is_empty())
        .map(str::parse)
        .collect::<Result<Vec<Branch>, _>>()?;
    if branches.is_empty() {
        return Err("at least one branch is required".to_string());
    }
    Ok(branches)
}

/// Ordered branch list. Readers clone a snapshot; writers install a new
/// vector, so a policy evaluation never observes a mutation mid-run.
#[derive(Debug)]
pub struct Branches {
    inner: RwLock<Arc<Vec<Branch>>>,
}

impl Branches {
    pub fn new(list: Vec<Branch>) -> Self {
        Branches {
            inner: RwLock::new(Arc::new(list)),
        }
    }

    pub fn snapshot(&self) -> Arc<Vec<Branch>> {
        self.inner.read().clone()
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut Vec<Branch>) -> R) -> R {
        let mut guard = self.inner.write();
        let mut next = (**guard).clone();
        let out = f(&mut next);
        *guard = Arc::new(next);
        out
    }

    pub fn set_mode(&self, root: &Path, mode: BranchMode) -> bool {
        self.mutate(|list| {
            let mut changed = false;
            for branch in list.iter_mut() {
                if branch.root == root && branch.mode != mode {
                    branch.mode = mode;
                    changed = true;
                }
            }
            changed
        })
    }

    /// Locate the branch owning `native_path` (longest root prefix) and set
    /// it read-only. Returns the demoted root, or None if no owner was found
    /// or it was already non-writable.
    pub fn find_and_demote(&self, native_path: &Path) -> Option<PathBuf> {
        let demoted = self.mutate(|list| {
            let owner = list
                .iter_mut()
                .filter(|b| native_path.starts_with(&b.root))
                .max_by_key(|b| b.root.as_os_str().len())?;
            if owner.mode == BranchMode::ReadOnly {
                return None;
            }
            owner.mode = BranchMode::ReadOnly;
            Some(owner.root.clone())
        });
        if let Some(root) = &demoted {
            warn!(branch = %root.display(), "EROFS from branch, mode set to RO");
        }
        demoted
    }

    pub fn add(&self, branch: Branch) {
        self.mutate(|list| list.push(branch));
    }

    /// The last branch cannot be removed while mounted.
    pub fn remove(&self, root: &Path) -> Result<(), fuse3::Errno> {
        self.mutate(|list| {
            let Some(pos) = list.iter().position(|b| b.root == root) else {
                return Err(fuse3::Errno::from(libc::ENOENT));
            };
            if list.len() == 1 {
                return Err(fuse3::Errno::from(libc::EINVAL));
            }
            list.remove(pos);
            Ok(())
        })
    }

    /// Replace the whole set, e.g. from the control interface.
    pub fn reset(&self, list: Vec<Branch>) -> Result<(), fuse3::Errno> {
        if list.is_empty() {
            return Err(fuse3::Errno::from(libc::EINVAL));
        }
        *self.inner.write() = Arc::new(list);
        Ok(())
    }

    pub fn describe(&self) -> String {
        self.snapshot()
            .iter()
            .map(Branch::spec)
            .collect::<Vec<_>>()
            .join(":")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_size_accepts_binary_suffixes() {
        assert_eq!(parse_size("512"), Ok(512));
        assert_eq!(parse_size("4K"), Ok(4096));
        assert_eq!(parse_size("1g"), Ok(1 << 30));
        assert_eq!(parse_size("2T"), Ok(2 << 40));
        assert!(parse_size("").is_err());
        assert!(parse_size("12Q").is_err());
    }

    #[test]
    fn branch_spec_parses_mode_and_floor() {
        let b: Branch = "/data/a".parse().unwrap();
        assert_eq!(b.mode, BranchMode::ReadWrite);
        assert_eq!(b.minfreespace, None);

        let b: Branch = "/data/b=NC".parse().unwrap();
        assert_eq!(b.mode, BranchMode::NoCreate);

        let b: Branch = "/data/c=RO=4G".parse().unwrap();
        assert_eq!(b.mode, BranchMode::ReadOnly);
        assert_eq!(b.minfreespace, Some(4 << 30));

        assert!("relative/path".parse::<Branch>().is_err());
        assert!("/x=XX".parse::<Branch>().is_err());
    }

    #[test]
    fn branch_list_requires_one_entry() {
        let list = parse_branch_list("/a=RW:/b=RO").unwrap();
        assert_eq!(list.len(), 2);
        assert!(parse_branch_list("").is_err());
    }

    #[test]
    fn effective_floor_never_drops_below_global() {
        let mut b = Branch::new(PathBuf::from("/a"), BranchMode::ReadWrite);
        assert_eq!(b.effective_minfreespace(100), 100);
        b.minfreespace = Some(50);
        assert_eq!(b.effective_minfreespace(100), 100);
        b.minfreespace = Some(200);
        assert_eq!(b.effective_minfreespace(100), 200);
    }

    #[test]
    fn native_path_concatenates_virtual_path() {
        let b = Branch::new(PathBuf::from("/mnt/disk0"), BranchMode::ReadWrite);
        assert_eq!(
            b.native_path(OsStr::new("/a/b")),
            PathBuf::from("/mnt/disk0/a/b")
        );
        assert_eq!(b.native_path(OsStr::new("/")), PathBuf::from("/mnt/disk0"));
    }

    #[test]
    fn find_and_demote_picks_longest_owning_root() {
        let branches = Branches::new(vec![
            Branch::new(PathBuf::from("/mnt"), BranchMode::ReadWrite),
            Branch::new(PathBuf::from("/mnt/disk0"), BranchMode::ReadWrite),
        ]);
        let demoted = branches.find_and_demote(Path::new("/mnt/disk0/a/b"));
        assert_eq!(demoted, Some(PathBuf::from("/mnt/disk0")));
        let snap = branches.snapshot();
        assert_eq!(snap[0].mode, BranchMode::ReadWrite);
        assert_eq!(snap[1].mode, BranchMode::ReadOnly);

        // Already RO: demotion is monotonic and reports nothing new.
        assert_eq!(branches.find_and_demote(Path::new("/mnt/disk0/a")), None);
        assert_eq!(branches.find_and_demote(Path::new("/elsewhere")), None);
    }

    #[test]
    fn snapshots_are_isolated_from_mutation() {
        let branches = Branches::new(vec![Branch::new(
            PathBuf::from("/a"),
            BranchMode::ReadWrite,
        )]);
        let before = branches.snapshot();
        branches.add(Branch::new(PathBuf::from("/b"), BranchMode::NoCreate));
        assert_eq!(before.len(), 1);
        assert_eq!(branches.snapshot().len(), 2);
    }

    #[test]
    fn remove_refuses_to_empty_the_pool() {
        let branches = Branches::new(vec![
            Branch::new(PathBuf::from("/a"), BranchMode::ReadWrite),
            Branch::new(PathBuf::from("/b"), BranchMode::ReadWrite),
        ]);
        branches.remove(Path::new("/b")).unwrap();
        assert!(branches.remove(Path::new("/a")).is_err());
        assert!(branches.remove(Path::new("/missing")).is_err());
    }
}
