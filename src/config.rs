use crate::branch::{Branches, parse_branch_list, parse_size};
use crate::policy::{Category, Policy};
use fuse3::Errno;
use fuse3::FileType;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CacheFiles {
    Libfuse,
    Off,
    Partial,
    Full,
    AutoFull,
    PerProcess,
}

impl CacheFiles {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheFiles::Libfuse => "libfuse",
            CacheFiles::Off => "off",
            CacheFiles::Partial => "partial",
            CacheFiles::Full => "full",
            CacheFiles::AutoFull => "auto-full",
            CacheFiles::PerProcess => "per-process",
        }
    }
}

impl FromStr for CacheFiles {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "libfuse" => Ok(CacheFiles::Libfuse),
            "off" => Ok(CacheFiles::Off),
            "partial" => Ok(CacheFiles::Partial),
            "full" => Ok(CacheFiles::Full),
            "auto-full" | "auto_full" => Ok(CacheFiles::AutoFull),
            "per-process" | "per_process" => Ok(CacheFiles::PerProcess),
            other => Err(format!("unknown cache-files mode {other:?}")),
        }
    }
}

impl fmt::Display for CacheFiles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FollowSymlinks {
    Never,
    Directory,
    All,
}

impl FollowSymlinks {
    pub fn as_str(self) -> &'static str {
        match self {
            FollowSymlinks::Never => "never",
            FollowSymlinks::Directory => "directory",
            FollowSymlinks::All => "all",
        }
    }
}

impl FromStr for FollowSymlinks {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "never" => Ok(FollowSymlinks::Never),
            "directory" => Ok(FollowSymlinks::Directory),
            "all" => Ok(FollowSymlinks::All),
            other => Err(format!("unknown follow-symlinks mode {other:?}")),
        }
    }
}

pub const FUNC_NAMES: &[&str] = &[
    "access",
    "chmod",
    "chown",
    "create",
    "getattr",
    "getxattr",
    "link",
    "listxattr",
    "mkdir",
    "mknod",
    "open",
    "readlink",
    "removexattr",
    "rename",
    "rmdir",
    "setxattr",
    "symlink",
    "truncate",
    "unlink",
    "utimens",
];

/// Per-operation policy table. `getattr` doubles as the default search
/// policy the create pipeline uses to locate existing parents.
#[derive(Clone, Copy, Debug)]
pub struct FuncPolicies {
    pub access: Policy,
    pub chmod: Policy,
    pub chown: Policy,
    pub create: Policy,
    pub getattr: Policy,
    pub getxattr: Policy,
    pub link: Policy,
    pub listxattr: Policy,
    pub mkdir: Policy,
    pub mknod: Policy,
    pub open: Policy,
    pub readlink: Policy,
    pub removexattr: Policy,
    pub rename: Policy,
    pub rmdir: Policy,
    pub setxattr: Policy,
    pub symlink: Policy,
    pub truncate: Policy,
    pub unlink: Policy,
    pub utimens: Policy,
}

impl Default for FuncPolicies {
    fn default() -> Self {
        let mut func = FuncPolicies {
            access: Policy::Ff,
            chmod: Policy::Ff,
            chown: Policy::Ff,
            create: Policy::Ff,
            getattr: Policy::Ff,
            getxattr: Policy::Ff,
            link: Policy::Ff,
            listxattr: Policy::Ff,
            mkdir: Policy::Ff,
            mknod: Policy::Ff,
            open: Policy::Ff,
            readlink: Policy::Ff,
            removexattr: Policy::Ff,
            rename: Policy::Ff,
            rmdir: Policy::Ff,
            setxattr: Policy::Ff,
            symlink: Policy::Ff,
            truncate: Policy::Ff,
            unlink: Policy::Ff,
            utimens: Policy::Ff,
        };
        func.set_category(Category::Create, Policy::Epmfs);
        func.set_category(Category::Action, Policy::Epall);
        func.set_category(Category::Search, Policy::Ff);
        func
    }
}

impl FuncPolicies {
    pub fn get(&self, func: &str) -> Option<Policy> {
        Some(match func {
            "access" => self.access,
            "chmod" => self.chmod,
            "chown" => self.chown,
            "create" => self.create,
            "getattr" => self.getattr,
            "getxattr" => self.getxattr,
            "link" => self.link,
            "listxattr" => self.listxattr,
            "mkdir" => self.mkdir,
            "mknod" => self.mknod,
            "open" => self.open,
            "readlink" => self.readlink,
            "removexattr" => self.removexattr,
            "rename" => self.rename,
            "rmdir" => self.rmdir,
            "setxattr" => self.setxattr,
            "symlink" => self.symlink,
            "truncate" => self.truncate,
            "unlink" => self.unlink,
            "utimens" => self.utimens,
            _ => return None,
        })
    }

    pub fn set(&mut self, func: &str, policy: Policy) -> bool {
        let slot = match func {
            "access" => &mut self.access,
            "chmod" => &mut self.chmod,
            "chown" => &mut self.chown,
            "create" => &mut self.create,
            "getattr" => &mut self.getattr,
            "getxattr" => &mut self.getxattr,
            "link" => &mut self.link,
            "listxattr" => &mut self.listxattr,
            "mkdir" => &mut self.mkdir,
            "mknod" => &mut self.mknod,
            "open" => &mut self.open,
            "readlink" => &mut self.readlink,
            "removexattr" => &mut self.removexattr,
            "rename" => &mut self.rename,
            "rmdir" => &mut self.rmdir,
            "setxattr" => &mut self.setxattr,
            "symlink" => &mut self.symlink,
            "truncate" => &mut self.truncate,
            "unlink" => &mut self.unlink,
            "utimens" => &mut self.utimens,
            _ => return false,
        };
        *slot = policy;
        true
    }

    pub fn set_category(&mut self, category: Category, policy: Policy) {
        let funcs: &[&str] = match category {
            Category::Create => &["create", "mkdir", "mknod", "symlink"],
            Category::Action => &[
                "chmod",
                "chown",
                "link",
                "removexattr",
                "rename",
                "rmdir",
                "setxattr",
                "truncate",
                "unlink",
                "utimens",
            ],
            Category::Search => &[
                "access",
                "getattr",
                "getxattr",
                "listxattr",
                "open",
                "readlink",
            ],
        };
        for func in funcs {
            self.set(func, policy);
        }
    }
}

/// One immutable view of the mount's settings. Requests clone an Arc of the
/// current snapshot; writers install a replacement through `ConfigStore`.
/// `Branches` is shared across snapshots so demotions are seen everywhere.
#[derive(Clone)]
pub struct Config {
    pub branches: Arc<Branches>,
    pub minfreespace: u64,
    pub func: FuncPolicies,
    pub cache_files: CacheFiles,
    pub cache_files_process_names: HashSet<String>,
    pub direct_io: bool,
    pub kernel_cache: bool,
    pub auto_cache: bool,
    pub writeback_cache: bool,
    pub cache_entry: Duration,
    pub cache_negative_entry: Duration,
    pub cache_attr: Duration,
    pub follow_symlinks: FollowSymlinks,
}

impl Config {
    pub fn new(branches: Arc<Branches>, minfreespace: u64) -> Self {
        Config {
            branches,
            minfreespace,
            func: FuncPolicies::default(),
            cache_files: CacheFiles::Libfuse,
            cache_files_process_names: HashSet::new(),
            direct_io: false,
            kernel_cache: false,
            auto_cache: false,
            writeback_cache: false,
            cache_entry: Duration::from_secs(1),
            cache_negative_entry: Duration::ZERO,
            cache_attr: Duration::from_secs(1),
            follow_symlinks: FollowSymlinks::Never,
        }
    }

    pub fn search_policy(&self) -> Policy {
        self.func.getattr
    }

    /// Symlink entries must be revalidated every time when the mount
    /// resolves symlinks itself.
    pub fn entry_ttl(&self, kind: FileType) -> Duration {
        if kind == FileType::Symlink && self.follow_symlinks != FollowSymlinks::Never {
            return Duration::ZERO;
        }
        self.cache_entry
    }

    pub fn attr_ttl(&self, kind: FileType) -> Duration {
        if kind == FileType::Symlink && self.follow_symlinks != FollowSymlinks::Never {
            return Duration::ZERO;
        }
        self.cache_attr
    }
}

/// Read-copy-update cell for the live config.
pub struct ConfigStore {
    inner: RwLock<Arc<Config>>,
}

impl ConfigStore {
    pub fn new(config: Config) -> Self {
        ConfigStore {
            inner: RwLock::new(Arc::new(config)),
        }
    }

    pub fn read(&self) -> Arc<Config> {
        self.inner.read().clone()
    }

    pub fn modify(&self, f: impl FnOnce(&mut Config)) {
        let mut guard = self.inner.write();
        let mut next = (**guard).clone();
        f(&mut next);
        *guard = Arc::new(next);
    }
}

// Runtime control surface, exposed as xattrs on the control file.

pub const CONTROL_FILE: &str = "/.poolfs";
const CTL_PREFIX: &str = "user.poolfs.";

pub fn ctl_keys(_cfg: &Config) -> Vec<String> {
    let mut keys = vec![
        format!("{CTL_PREFIX}branches"),
        format!("{CTL_PREFIX}minfreespace"),
        format!("{CTL_PREFIX}cache_files"),
        format!("{CTL_PREFIX}follow_symlinks"),
    ];
    keys.extend(FUNC_NAMES.iter().map(|f| format!("{CTL_PREFIX}func.{f}.policy")));
    keys
}

pub fn ctl_get(cfg: &Config, key: &str) -> Option<String> {
    let key = key.strip_prefix(CTL_PREFIX)?;
    match key {
        "branches" => Some(cfg.branches.describe()),
        "minfreespace" => Some(cfg.minfreespace.to_string()),
        "cache_files" => Some(cfg.cache_files.as_str().to_string()),
        "follow_symlinks" => Some(cfg.follow_symlinks.as_str().to_string()),
        _ => {
            let func = key.strip_prefix("func.")?.strip_suffix(".policy")?;
            cfg.func.get(func).map(|p| p.as_str().to_string())
        }
    }
}

pub fn ctl_set(store: &ConfigStore, key: &str, value: &str) -> Result<(), Errno> {
    let invalid = Errno::from(libc::EINVAL);
    let unknown = Errno::from(libc::ENODATA);
    let short_key = key.strip_prefix(CTL_PREFIX).ok_or(unknown)?;

    match short_key {
        "branches" => {
            let list = parse_branch_list(value).map_err(|_| invalid)?;
            store.read().branches.reset(list)
        }
        "minfreespace" => {
            let floor = parse_size(value).map_err(|_| invalid)?;
            store.modify(|cfg| cfg.minfreespace = floor);
            Ok(())
        }
        "cache_files" => {
            let mode = value.parse::<CacheFiles>().map_err(|_| invalid)?;
            store.modify(|cfg| cfg.cache_files = mode);
            Ok(())
        }
        "follow_symlinks" => {
            let mode = value.parse::<FollowSymlinks>().map_err(|_| invalid)?;
            store.modify(|cfg| cfg.follow_symlinks = mode);
            Ok(())
        }
        _ => {
            if let Some(func) = short_key.strip_prefix("func.").and_then(|k| k.strip_suffix(".policy")) {
                if store.read().func.get(func).is_none() {
                    return Err(unknown);
                }
                let policy = value.parse::<Policy>().map_err(|_| invalid)?;
                store.modify(|cfg| {
                    cfg.func.set(func, policy);
                });
                return Ok(());
            }
            if let Some(cat) = short_key.strip_prefix("category.").and_then(|k| k.strip_suffix(".policy")) {
                let category = cat.parse::<Category>().map_err(|_| unknown)?;
                let policy = value.parse::<Policy>().map_err(|_| invalid)?;
                store.modify(|cfg| cfg.func.set_category(category, policy));
                return Ok(());
            }
            Err(unknown)
        }
    }
}
