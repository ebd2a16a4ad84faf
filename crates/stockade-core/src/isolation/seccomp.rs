//! Seccomp-BPF filter installation
//!
//! Two entry points:
//! - [`install_current_thread`]: for a freshly forked, single-threaded child.
//!   Async-signal-safe, reports a raw errno.
//! - [`install_all_threads`]: for a running, possibly multithreaded process.
//!   Uses `SECCOMP_FILTER_FLAG_TSYNC` so every thread transitions at once.
//!   If the kernel does not support thread sync, the filter is installed on
//!   the calling thread only when it is provably the only thread; otherwise
//!   installation fails and nothing is installed.

use crate::policy::bpf::{SockFilter, SockFprog};
use crate::{Result, StockadeError};
use nix::errno::Errno;

const SECCOMP_SET_MODE_FILTER: libc::c_uint = 1;
const SECCOMP_MODE_FILTER: libc::c_ulong = 2;
const SECCOMP_FILTER_FLAG_TSYNC: libc::c_uint = 1;

/// How far an [`install_all_threads`] call reached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Installed {
    /// Synchronized across the whole thread group
    AllThreads,
    /// Thread sync unavailable; the process had a single thread
    SingleThread,
}

fn fprog(program: &[SockFilter]) -> std::result::Result<SockFprog, Errno> {
    let len = u16::try_from(program.len()).map_err(|_| Errno::EINVAL)?;
    if len == 0 {
        return Err(Errno::EINVAL);
    }
    Ok(SockFprog {
        len,
        filter: program.as_ptr(),
    })
}

fn set_no_new_privs() -> std::result::Result<(), Errno> {
    // SAFETY: prctl with integer arguments only
    let ret = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    Errno::result(ret).map(drop)
}

fn seccomp_filter(flags: libc::c_uint, prog: &SockFprog) -> std::result::Result<libc::c_long, Errno> {
    // SAFETY: `prog` points to a live program for the duration of the call
    let ret = unsafe {
        libc::syscall(
            libc::SYS_seccomp,
            SECCOMP_SET_MODE_FILTER,
            flags,
            std::ptr::from_ref(prog),
        )
    };
    Errno::result(ret)
}

/// Install `program` on the calling thread.
///
/// Safe to call between `fork` and `exec`: no allocation, no locks.
pub fn install_current_thread(program: &[SockFilter]) -> std::result::Result<(), Errno> {
    let prog = fprog(program)?;
    set_no_new_privs()?;
    match seccomp_filter(0, &prog) {
        Ok(_) => Ok(()),
        Err(Errno::ENOSYS) => {
            // SAFETY: `prog` points to a live program for the duration of the call
            let ret = unsafe {
                libc::prctl(
                    libc::PR_SET_SECCOMP,
                    SECCOMP_MODE_FILTER,
                    std::ptr::from_ref(&prog),
                    0,
                    0,
                )
            };
            Errno::result(ret).map(drop)
        }
        Err(e) => Err(e),
    }
}

/// Install `program` on every thread of the calling process
pub fn install_all_threads(program: &[SockFilter]) -> Result<Installed> {
    let prog = fprog(program).map_err(|e| StockadeError::Seccomp(format!("bad program: {e}")))?;
    set_no_new_privs()
        .map_err(|e| StockadeError::Seccomp(format!("PR_SET_NO_NEW_PRIVS: {e}")))?;

    match seccomp_filter(SECCOMP_FILTER_FLAG_TSYNC, &prog) {
        Ok(0) => {
            tracing::debug!(instructions = program.len(), "filter installed on all threads");
            Ok(Installed::AllThreads)
        }
        Ok(tid) => Err(StockadeError::Seccomp(format!(
            "thread {tid} could not be synchronized"
        ))),
        Err(Errno::EINVAL | Errno::ENOSYS) => {
            let threads = thread_count()?;
            if threads != 1 {
                return Err(StockadeError::Seccomp(format!(
                    "thread sync unsupported and process has {threads} threads"
                )));
            }
            tracing::warn!("thread sync unsupported, installing on the only thread");
            install_current_thread(program)
                .map_err(|e| StockadeError::Seccomp(format!("install failed: {e}")))?;
            Ok(Installed::SingleThread)
        }
        Err(e) => Err(StockadeError::Seccomp(format!("install failed: {e}"))),
    }
}

fn thread_count() -> Result<usize> {
    Ok(std::fs::read_dir("/proc/self/task")?.count())
}
