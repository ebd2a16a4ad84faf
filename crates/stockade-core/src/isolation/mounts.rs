//! Bind mounts and tmpfs inside the sandboxee's mount namespace
//!
//! [`MountConfig::prepare`] runs in the parent: it creates missing mount
//! points and turns every path into a `CString`. The forked child then only
//! calls [`MountPlan::apply`], which issues raw `mount(2)` calls.

use crate::{Result, StockadeError};
use nix::errno::Errno;
use serde::{Deserialize, Serialize};
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

/// Configuration for filesystem mounts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MountConfig {
    /// Read-only bind mounts, `(source, destination)`
    pub ro_binds: Vec<(PathBuf, PathBuf)>,
    /// Read-write bind mounts, `(source, destination)`
    pub rw_binds: Vec<(PathBuf, PathBuf)>,
    /// tmpfs mounts with size limits in bytes
    pub tmpfs: Vec<(PathBuf, u64)>,
}

impl MountConfig {
    /// Add a read-only bind mount
    #[must_use]
    pub fn ro_bind(mut self, src: impl Into<PathBuf>, dst: impl Into<PathBuf>) -> Self {
        self.ro_binds.push((src.into(), dst.into()));
        self
    }

    /// Add a read-write bind mount
    #[must_use]
    pub fn rw_bind(mut self, src: impl Into<PathBuf>, dst: impl Into<PathBuf>) -> Self {
        self.rw_binds.push((src.into(), dst.into()));
        self
    }

    /// Add a tmpfs mount with size limit in bytes
    #[must_use]
    pub fn tmpfs(mut self, path: impl Into<PathBuf>, size_bytes: u64) -> Self {
        self.tmpfs.push((path.into(), size_bytes));
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ro_binds.is_empty() && self.rw_binds.is_empty() && self.tmpfs.is_empty()
    }

    /// Create mount points and precompute every argument the child needs
    pub fn prepare(&self) -> Result<MountPlan> {
        let mut ops = Vec::new();

        for (src, dst, read_only) in self
            .ro_binds
            .iter()
            .map(|(s, d)| (s, d, true))
            .chain(self.rw_binds.iter().map(|(s, d)| (s, d, false)))
        {
            if !src.exists() {
                tracing::warn!(src = %src.display(), "bind source does not exist, skipping");
                continue;
            }
            create_mount_point(dst, src.is_dir())?;
            tracing::debug!(src = %src.display(), dst = %dst.display(), read_only, "bind mount");
            ops.push(MountOp::Bind {
                src: path_to_cstring(src)?,
                dst: path_to_cstring(dst)?,
                read_only,
            });
        }

        for (path, size) in &self.tmpfs {
            create_mount_point(path, true)?;
            tracing::debug!(path = %path.display(), size, "tmpfs mount");
            ops.push(MountOp::Tmpfs {
                dst: path_to_cstring(path)?,
                options: CString::new(format!("size={size},mode=0755"))
                    .map_err(|e| StockadeError::Mount(format!("invalid options: {e}")))?,
            });
        }

        Ok(MountPlan { ops })
    }
}

#[derive(Debug)]
enum MountOp {
    Bind {
        src: CString,
        dst: CString,
        read_only: bool,
    },
    Tmpfs {
        dst: CString,
        options: CString,
    },
}

/// Mount operations ready to run in a forked child
#[derive(Debug)]
pub struct MountPlan {
    ops: Vec<MountOp>,
}

impl MountPlan {
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Apply the plan inside a fresh mount namespace. Safe between `fork` and `exec`.
    pub fn apply(&self) -> std::result::Result<(), Errno> {
        // Keep our mounts from propagating back to the parent namespace
        mount(None, c"/", None, libc::MS_REC | libc::MS_PRIVATE, None)?;

        for op in &self.ops {
            match op {
                MountOp::Bind {
                    src,
                    dst,
                    read_only,
                } => {
                    mount(Some(src.as_c_str()), dst, None, libc::MS_BIND | libc::MS_REC, None)?;
                    if *read_only {
                        let locked = locked_flags(dst)?;
                        mount(
                            None,
                            dst,
                            None,
                            libc::MS_BIND | libc::MS_REMOUNT | libc::MS_RDONLY | locked,
                            None,
                        )?;
                    }
                }
                MountOp::Tmpfs { dst, options } => {
                    mount(
                        Some(c"tmpfs"),
                        dst,
                        Some(c"tmpfs"),
                        libc::MS_NOSUID | libc::MS_NODEV,
                        Some(options.as_c_str()),
                    )?;
                }
            }
        }
        Ok(())
    }
}

// Flags a user namespace may not clear on remount
fn locked_flags(path: &std::ffi::CStr) -> std::result::Result<libc::c_ulong, Errno> {
    // SAFETY: statvfs writes into a zeroed, properly sized struct
    let st = unsafe {
        let mut st: libc::statvfs = std::mem::zeroed();
        Errno::result(libc::statvfs(path.as_ptr(), &raw mut st))?;
        st
    };
    let mut flags = 0;
    for (st_flag, ms_flag) in [
        (libc::ST_NOSUID, libc::MS_NOSUID),
        (libc::ST_NODEV, libc::MS_NODEV),
        (libc::ST_NOEXEC, libc::MS_NOEXEC),
        (libc::ST_NOATIME, libc::MS_NOATIME),
        (libc::ST_NODIRATIME, libc::MS_NODIRATIME),
        (libc::ST_RELATIME, libc::MS_RELATIME),
    ] {
        if st.f_flag & st_flag != 0 {
            flags |= ms_flag;
        }
    }
    Ok(flags)
}

fn mount(
    src: Option<&std::ffi::CStr>,
    dst: &std::ffi::CStr,
    fstype: Option<&std::ffi::CStr>,
    flags: libc::c_ulong,
    data: Option<&std::ffi::CStr>,
) -> std::result::Result<(), Errno> {
    // SAFETY: every pointer is either null or a live NUL-terminated string
    let ret = unsafe {
        libc::mount(
            src.map_or(std::ptr::null(), std::ffi::CStr::as_ptr),
            dst.as_ptr(),
            fstype.map_or(std::ptr::null(), std::ffi::CStr::as_ptr),
            flags,
            data.map_or(std::ptr::null(), |d| d.as_ptr().cast()),
        )
    };
    Errno::result(ret).map(drop)
}

fn create_mount_point(dst: &Path, dir: bool) -> Result<()> {
    if dst.exists() {
        return Ok(());
    }
    let made = if dir {
        std::fs::create_dir_all(dst)
    } else {
        dst.parent()
            .map_or(Ok(()), std::fs::create_dir_all)
            .and_then(|()| std::fs::File::create(dst).map(drop))
    };
    made.map_err(|e| {
        StockadeError::Mount(format!("failed to create mount point {}: {e}", dst.display()))
    })
}

fn path_to_cstring(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|e| StockadeError::Mount(format!("invalid path {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepare_creates_mount_points() {
        let dir = tempfile::tempdir().unwrap();
        let src_file = dir.path().join("data.txt");
        std::fs::write(&src_file, b"x").unwrap();

        let config = MountConfig::default()
            .ro_bind(dir.path(), dir.path().join("a/b"))
            .rw_bind(&src_file, dir.path().join("c/data.txt"))
            .tmpfs(dir.path().join("scratch"), 1 << 20);
        let plan = config.prepare().unwrap();

        assert_eq!(plan.len(), 3);
        assert!(dir.path().join("a/b").is_dir());
        assert!(dir.path().join("c/data.txt").is_file());
        assert!(dir.path().join("scratch").is_dir());
    }

    #[test]
    fn missing_sources_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let plan = MountConfig::default()
            .ro_bind(dir.path().join("nope"), dir.path().join("dst"))
            .prepare()
            .unwrap();
        assert!(plan.is_empty());
        assert!(!dir.path().join("dst").exists());
    }

    #[test]
    fn config_from_json() {
        let config: MountConfig =
            serde_json::from_str(r#"{ "tmpfs": [["/tmp", 1048576]] }"#).unwrap();
        assert_eq!(config.tmpfs, vec![(PathBuf::from("/tmp"), 1 << 20)]);
        assert!(config.ro_binds.is_empty());
    }
}
