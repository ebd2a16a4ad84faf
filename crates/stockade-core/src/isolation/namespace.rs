//! Namespaces the sandboxee unshares before exec

use nix::errno::Errno;
use nix::sched::CloneFlags;
use serde::{Deserialize, Serialize};

/// Namespaces the sandboxee enters before exec.
///
/// A new PID namespace applies to the sandboxee's children; the sandboxee
/// itself keeps its pid so the monitor can trace it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NamespaceConfig {
    /// Own uid/gid mappings; required for the others without `CAP_SYS_ADMIN`
    pub user: bool,
    pub pid: bool,
    /// Private mount table, needed for [`super::MountConfig`]
    pub mount: bool,
    /// No network interfaces besides a down loopback
    pub net: bool,
    pub ipc: bool,
    /// Private hostname
    pub uts: bool,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            user: true,
            pid: true,
            mount: true,
            net: true,
            ipc: true,
            uts: true,
        }
    }
}

impl NamespaceConfig {
    /// Flags for `unshare(2)`
    #[must_use]
    pub fn to_clone_flags(&self) -> CloneFlags {
        [
            (self.user, CloneFlags::CLONE_NEWUSER),
            (self.pid, CloneFlags::CLONE_NEWPID),
            (self.mount, CloneFlags::CLONE_NEWNS),
            (self.net, CloneFlags::CLONE_NEWNET),
            (self.ipc, CloneFlags::CLONE_NEWIPC),
            (self.uts, CloneFlags::CLONE_NEWUTS),
        ]
        .into_iter()
        .filter(|(enabled, _)| *enabled)
        .fold(CloneFlags::empty(), |acc, (_, flag)| acc | flag)
    }
}

/// uid/gid maps written after entering a new user namespace.
/// The sandboxee keeps its own ids inside the namespace.
#[derive(Debug, Clone)]
pub(crate) struct IdMaps {
    uid_map: Vec<u8>,
    gid_map: Vec<u8>,
}

impl IdMaps {
    pub(crate) fn current() -> Self {
        let uid = nix::unistd::getuid();
        let gid = nix::unistd::getgid();
        Self {
            uid_map: format!("{uid} {uid} 1\n").into_bytes(),
            gid_map: format!("{gid} {gid} 1\n").into_bytes(),
        }
    }

    /// Write the maps for the calling process. Safe between `fork` and `exec`.
    pub(crate) fn write_self(&self) -> Result<(), Errno> {
        write_proc(c"/proc/self/setgroups", b"deny")?;
        write_proc(c"/proc/self/uid_map", &self.uid_map)?;
        write_proc(c"/proc/self/gid_map", &self.gid_map)
    }
}

fn write_proc(path: &std::ffi::CStr, data: &[u8]) -> Result<(), Errno> {
    // SAFETY: raw open/write/close on a NUL-terminated path and a live buffer
    unsafe {
        let fd = Errno::result(libc::open(path.as_ptr(), libc::O_WRONLY | libc::O_CLOEXEC))?;
        let written = libc::write(fd, data.as_ptr().cast(), data.len());
        let err = Errno::last();
        libc::close(fd);
        if written < 0 {
            return Err(err);
        }
        if written as usize != data.len() {
            return Err(Errno::EIO);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_enters_every_namespace() {
        let flags = NamespaceConfig::default().to_clone_flags();
        assert!(flags.contains(CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNS));
        assert!(flags.contains(CloneFlags::CLONE_NEWNET | CloneFlags::CLONE_NEWPID));
    }

    #[test]
    fn partial_config_from_json() {
        let ns: NamespaceConfig = serde_json::from_str(r#"{ "net": false }"#).unwrap();
        assert!(ns.user && ns.mount);
        assert!(!ns.to_clone_flags().contains(CloneFlags::CLONE_NEWNET));
    }

    #[test]
    fn id_maps_keep_current_ids() {
        let maps = IdMaps::current();
        let uid = nix::unistd::getuid();
        assert_eq!(maps.uid_map, format!("{uid} {uid} 1\n").into_bytes());
    }
}
