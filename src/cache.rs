use crate::config::{CacheFiles, Config};
use std::fs;

// Kernel-facing open flags (fuse_open_out.open_flags bits).
pub const FOPEN_DIRECT_IO: u32 = 1 << 0;
pub const FOPEN_KEEP_CACHE: u32 = 1 << 1;

/// Per-open page-cache disposition handed back to the kernel.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FfiFlags {
    pub direct_io: bool,
    pub keep_cache: bool,
    pub auto_cache: bool,
}

impl FfiFlags {
    pub fn to_open_flags(self) -> u32 {
        let mut flags = 0;
        if self.direct_io {
            flags |= FOPEN_DIRECT_IO;
        }
        if self.keep_cache {
            flags |= FOPEN_KEEP_CACHE;
        }
        flags
    }
}

pub fn ffi_flags(cfg: &Config, pid: u32) -> FfiFlags {
    match cfg.cache_files {
        CacheFiles::Libfuse => FfiFlags {
            direct_io: cfg.direct_io,
            keep_cache: cfg.kernel_cache,
            auto_cache: cfg.auto_cache,
        },
        CacheFiles::Off => FfiFlags {
            direct_io: true,
            keep_cache: false,
            auto_cache: false,
        },
        CacheFiles::Partial => FfiFlags::default(),
        CacheFiles::Full => FfiFlags {
            direct_io: false,
            keep_cache: true,
            auto_cache: false,
        },
        CacheFiles::AutoFull => FfiFlags {
            direct_io: false,
            keep_cache: false,
            auto_cache: true,
        },
        CacheFiles::PerProcess => {
            let allowed = proc_name(pid)
                .map(|name| cfg.cache_files_process_names.contains(&name))
                .unwrap_or(false);
            FfiFlags {
                direct_io: !allowed,
                keep_cache: false,
                auto_cache: false,
            }
        }
    }
}

/// With writeback caching the kernel issues reads to refill the cache, so a
/// write-only open must become read-write; the kernel also manages the append
/// offset itself, so O_APPEND is dropped.
pub fn tweak_flags_writeback_cache(flags: &mut i32) {
    if *flags & libc::O_ACCMODE == libc::O_WRONLY {
        *flags = (*flags & !libc::O_ACCMODE) | libc::O_RDWR;
    }
    if *flags & libc::O_APPEND != 0 {
        *flags &= !libc::O_APPEND;
    }
}

/// Short process name of the caller, as /proc reports it.
pub fn proc_name(pid: u32) -> Option<String> {
    let comm = fs::read_to_string(format!("/proc/{pid}/comm")).ok()?;
    Some(comm.trim_end_matches('\n').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::{Branch, BranchMode, Branches};
    use std::path::PathBuf;
    use std::sync::Arc;

    fn config_with(cache_files: CacheFiles) -> Config {
        let branches = Arc::new(Branches::new(vec![Branch::new(
            PathBuf::from("/tmp"),
            BranchMode::ReadWrite,
        )]));
        let mut cfg = Config::new(branches, 0);
        cfg.cache_files = cache_files;
        cfg
    }

    #[test]
    fn dispositions_match_the_mode_table() {
        let cases = [
            (CacheFiles::Off, (true, false, false)),
            (CacheFiles::Partial, (false, false, false)),
            (CacheFiles::Full, (false, true, false)),
            (CacheFiles::AutoFull, (false, false, true)),
        ];
        for (mode, (direct_io, keep_cache, auto_cache)) in cases {
            let flags = ffi_flags(&config_with(mode), std::process::id());
            assert_eq!(flags.direct_io, direct_io, "{mode:?}");
            assert_eq!(flags.keep_cache, keep_cache, "{mode:?}");
            assert_eq!(flags.auto_cache, auto_cache, "{mode:?}");
        }
    }

    #[test]
    fn libfuse_mode_reflects_config_booleans() {
        let mut cfg = config_with(CacheFiles::Libfuse);
        cfg.direct_io = true;
        cfg.kernel_cache = true;
        let flags = ffi_flags(&cfg, std::process::id());
        assert!(flags.direct_io);
        assert!(flags.keep_cache);
        assert!(!flags.auto_cache);
    }

    #[test]
    fn per_process_mode_keys_on_caller_comm() {
        let pid = std::process::id();
        let own_name = proc_name(pid).unwrap();

        let mut cfg = config_with(CacheFiles::PerProcess);
        assert!(ffi_flags(&cfg, pid).direct_io);

        cfg.cache_files_process_names.insert(own_name);
        assert!(!ffi_flags(&cfg, pid).direct_io);
    }

    #[test]
    fn writeback_tweak_promotes_wronly_and_drops_append() {
        let mut flags = libc::O_WRONLY | libc::O_APPEND;
        tweak_flags_writeback_cache(&mut flags);
        assert_eq!(flags & libc::O_ACCMODE, libc::O_RDWR);
        assert_eq!(flags & libc::O_APPEND, 0);

        let mut flags = libc::O_RDONLY;
        tweak_flags_writeback_cache(&mut flags);
        assert_eq!(flags, libc::O_RDONLY);
    }

    #[test]
    fn open_flag_bits_follow_the_disposition() {
        let flags = FfiFlags {
            direct_io: true,
            keep_cache: true,
            auto_cache: false,
        };
        assert_eq!(flags.to_open_flags(), FOPEN_DIRECT_IO | FOPEN_KEEP_CACHE);
        assert_eq!(FfiFlags::default().to_open_flags(), 0);
    }
}
