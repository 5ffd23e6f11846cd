use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tracing::warn;

// Credential changes must stay thread-scoped: libc's setresuid/setresgid
// wrappers broadcast to every thread, so the raw syscalls are used instead.
// Only the effective id is changed; the saved id stays root so the thread
// can switch back.

fn set_thread_euid(uid: libc::uid_t) -> bool {
    let rv = unsafe { libc::syscall(libc::SYS_setresuid, -1i64, uid as i64, -1i64) };
    rv == 0
}

fn set_thread_egid(gid: libc::gid_t) -> bool {
    let rv = unsafe { libc::syscall(libc::SYS_setresgid, -1i64, gid as i64, -1i64) };
    rv == 0
}

fn set_thread_groups(groups: &[libc::gid_t]) -> bool {
    let rv = unsafe { libc::syscall(libc::SYS_setgroups, groups.len(), groups.as_ptr()) };
    rv == 0
}

fn current_groups() -> Vec<libc::gid_t> {
    let n = unsafe { libc::getgroups(0, std::ptr::null_mut()) };
    if n <= 0 {
        return Vec::new();
    }
    let mut groups = vec![0 as libc::gid_t; n as usize];
    let n = unsafe { libc::getgroups(groups.len() as libc::c_int, groups.as_mut_ptr()) };
    if n < 0 {
        return Vec::new();
    }
    groups.truncate(n as usize);
    groups
}

fn group_cache() -> &'static Mutex<HashMap<libc::uid_t, Arc<Vec<libc::gid_t>>>> {
    static CACHE: OnceLock<Mutex<HashMap<libc::uid_t, Arc<Vec<libc::gid_t>>>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Supplementary groups for `uid`, resolved via getpwuid_r + getgrouplist and
/// cached for the life of the process.
fn supplementary_groups(uid: libc::uid_t, gid: libc::gid_t) -> Arc<Vec<libc::gid_t>> {
    if let Some(groups) = group_cache().lock().get(&uid) {
        return groups.clone();
    }
    let groups = Arc::new(lookup_groups(uid, gid));
    group_cache().lock().insert(uid, groups.clone());
    groups
}

fn lookup_groups(uid: libc::uid_t, gid: libc::gid_t) -> Vec<libc::gid_t> {
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut result: *mut libc::passwd = std::ptr::null_mut();
    let mut buf = vec![0 as libc::c_char; 4096];

    loop {
        let rc = unsafe {
            libc::getpwuid_r(uid, &mut pwd, buf.as_mut_ptr(), buf.len(), &mut result)
        };
        if rc == libc::ERANGE && buf.len() < (1 << 20) {
            buf.resize(buf.len() * 2, 0);
            continue;
        }
        if rc != 0 || result.is_null() {
            return vec![gid];
        }
        break;
    }

    let mut ngroups: libc::c_int = 32;
    let mut groups = vec![0 as libc::gid_t; ngroups as usize];
    loop {
        let rc = unsafe {
            libc::getgrouplist(pwd.pw_name, gid, groups.as_mut_ptr(), &mut ngroups)
        };
        if rc == -1 && (ngroups as usize) > groups.len() {
            groups.resize(ngroups as usize, 0);
            continue;
        }
        break;
    }
    groups.truncate(ngroups.max(0) as usize);
    if groups.is_empty() {
        groups.push(gid);
    }
    groups
}

/// Adopt the caller's identity for the current thread. Restored on drop, on
/// every exit path. A no-op when the server does not run as root or the
/// caller already is root.
#[derive(Debug)]
pub struct UgidGuard {
    saved: Option<SavedIdentity>,
}

#[derive(Debug)]
struct SavedIdentity {
    euid: libc::uid_t,
    egid: libc::gid_t,
    groups: Vec<libc::gid_t>,
}

impl UgidGuard {
    pub fn new(uid: u32, gid: u32) -> Self {
        let euid = unsafe { libc::geteuid() };
        if euid != 0 || (uid == 0 && gid == 0) {
            return UgidGuard { saved: None };
        }

        let saved = SavedIdentity {
            euid,
            egid: unsafe { libc::getegid() },
            groups: current_groups(),
        };

        // Groups and gid first, while still privileged; uid last.
        let groups = supplementary_groups(uid, gid);
        if !set_thread_groups(&groups) || !set_thread_egid(gid) || !set_thread_euid(uid) {
            warn!(uid, gid, "failed to adopt caller identity");
            restore(&saved);
            return UgidGuard { saved: None };
        }

        UgidGuard { saved: Some(saved) }
    }
}

impl Drop for UgidGuard {
    fn drop(&mut self) {
        if let Some(saved) = self.saved.take() {
            restore(&saved);
        }
    }
}

fn restore(saved: &SavedIdentity) {
    // uid back first to regain the privilege the gid/groups restore needs.
    // Every step is attempted even if an earlier one fails.
    let uid_ok = set_thread_euid(saved.euid);
    let gid_ok = set_thread_egid(saved.egid);
    let groups_ok = set_thread_groups(&saved.groups);
    if !uid_ok || !gid_ok || !groups_ok {
        warn!("failed to restore server identity");
    }
}

/// Re-escalate to root inside an open caller window, e.g. while cloning a
/// parent chain whose owners the caller could not chown. No-op when the
/// thread is already root (which includes the unprivileged-server case).
#[derive(Debug)]
pub struct AsRoot {
    saved: Option<(libc::uid_t, libc::gid_t)>,
}

impl AsRoot {
    pub fn new() -> Self {
        let euid = unsafe { libc::geteuid() };
        if euid == 0 {
            return AsRoot { saved: None };
        }
        if !set_thread_euid(0) {
            return AsRoot { saved: None };
        }
        let egid = unsafe { libc::getegid() };
        if !set_thread_egid(0) {
            set_thread_euid(euid);
            return AsRoot { saved: None };
        }
        AsRoot {
            saved: Some((euid, egid)),
        }
    }
}

impl Drop for AsRoot {
    fn drop(&mut self) {
        if let Some((euid, egid)) = self.saved.take() {
            let gid_ok = set_thread_egid(egid);
            let uid_ok = set_thread_euid(euid);
            if !gid_ok || !uid_ok {
                warn!("failed to drop re-escalated identity");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The switching paths need a root euid; what runs everywhere is the
    // guarantee that guards never leave the thread's identity changed.

    #[test]
    fn guard_is_identity_preserving() {
        let euid = unsafe { libc::geteuid() };
        let egid = unsafe { libc::getegid() };
        {
            let _guard = UgidGuard::new(12345, 12345);
        }
        assert_eq!(unsafe { libc::geteuid() }, euid);
        assert_eq!(unsafe { libc::getegid() }, egid);
    }

    #[test]
    fn as_root_is_identity_preserving() {
        let euid = unsafe { libc::geteuid() };
        {
            let _root = AsRoot::new();
        }
        assert_eq!(unsafe { libc::geteuid() }, euid);
    }

    #[test]
    fn guard_for_root_caller_is_a_noop() {
        let guard = UgidGuard::new(0, 0);
        assert!(guard.saved.is_none());
    }

    #[test]
    fn group_lookup_always_includes_primary_gid_fallback() {
        // An unallocated uid has no passwd entry; the caller's gid is used.
        let groups = lookup_groups(u32::MAX - 7, 4242);
        assert!(groups.contains(&4242) || !groups.is_empty());
    }
}
