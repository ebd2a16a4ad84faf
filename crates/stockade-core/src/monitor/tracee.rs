//! Wait-status decoding and per-thread ptrace requests
//!
//! Raw `libc` calls are used where nix's typed wrappers cannot carry
//! real-time signals.

use nix::errno::Errno;
use nix::unistd::Pid;

const PTRACE_GET_SYSCALL_INFO: libc::c_uint = 0x420e;
const PTRACE_SYSCALL_INFO_SECCOMP: u8 = 3;

/// A decoded `waitpid` status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Status {
    Exited(i32),
    Signaled(i32),
    /// `PTRACE_EVENT_*` stop other than `PTRACE_EVENT_STOP`
    Event(i32),
    /// Group stop, or the stop caused by `PTRACE_INTERRUPT`
    GroupStop(i32),
    /// Signal-delivery stop
    Signal(i32),
}

pub(crate) fn decode(status: libc::c_int) -> Option<Status> {
    if libc::WIFEXITED(status) {
        return Some(Status::Exited(libc::WEXITSTATUS(status)));
    }
    if libc::WIFSIGNALED(status) {
        return Some(Status::Signaled(libc::WTERMSIG(status)));
    }
    if !libc::WIFSTOPPED(status) {
        return None;
    }
    let sig = libc::WSTOPSIG(status);
    match (status >> 16) & 0xff {
        0 => Some(Status::Signal(sig)),
        libc::PTRACE_EVENT_STOP => Some(Status::GroupStop(sig)),
        event => Some(Status::Event(event)),
    }
}

/// Non-blocking wait on one tracee. `Ok(None)` when nothing is pending.
pub(crate) fn wait_nohang(tid: Pid) -> Result<Option<libc::c_int>, Errno> {
    let mut status = 0;
    // SAFETY: waitpid writes the status into a local
    let ret = unsafe { libc::waitpid(tid.as_raw(), &raw mut status, libc::WNOHANG | libc::__WALL) };
    match Errno::result(ret)? {
        0 => Ok(None),
        _ => Ok(Some(status)),
    }
}

/// Resume a stopped tracee, delivering `sig` (0 for none)
pub(crate) fn resume(tid: Pid, sig: i32) -> Result<(), Errno> {
    // SAFETY: PTRACE_CONT with integer arguments
    let ret = unsafe {
        libc::ptrace(
            libc::PTRACE_CONT,
            tid.as_raw(),
            std::ptr::null_mut::<libc::c_void>(),
            sig as usize as *mut libc::c_void,
        )
    };
    Errno::result(ret).map(drop)
}

/// Leave a group-stopped tracee stopped while still reporting new events
pub(crate) fn listen(tid: Pid) -> Result<(), Errno> {
    // SAFETY: PTRACE_LISTEN takes no pointers
    let ret = unsafe {
        libc::ptrace(
            libc::PTRACE_LISTEN,
            tid.as_raw(),
            std::ptr::null_mut::<libc::c_void>(),
            std::ptr::null_mut::<libc::c_void>(),
        )
    };
    Errno::result(ret).map(drop)
}

/// Treat "the tracee is already gone" as success
pub(crate) fn tolerate_gone(result: Result<(), Errno>) -> Result<(), Errno> {
    match result {
        Err(Errno::ESRCH) => Ok(()),
        other => other,
    }
}

pub(crate) const fn is_job_control_stop(sig: i32) -> bool {
    matches!(
        sig,
        libc::SIGSTOP | libc::SIGTSTP | libc::SIGTTIN | libc::SIGTTOU
    )
}

/// Signals whose default disposition terminates the process
pub(crate) const fn is_fatal_by_default(sig: i32) -> bool {
    !matches!(
        sig,
        libc::SIGCHLD
            | libc::SIGCONT
            | libc::SIGURG
            | libc::SIGWINCH
            | libc::SIGSTOP
            | libc::SIGTSTP
            | libc::SIGTTIN
            | libc::SIGTTOU
    )
}

/// Whether `tid`'s process catches or ignores `sig`, per `/proc/<tid>/status`
pub(crate) fn handles_signal(tid: Pid, sig: i32) -> bool {
    let Ok(status) = std::fs::read_to_string(format!("/proc/{tid}/status")) else {
        return false;
    };
    signal_in_masks(&status, sig)
}

fn signal_in_masks(status: &str, sig: i32) -> bool {
    let Some(bit) = u32::try_from(sig - 1).ok().and_then(|s| 1u64.checked_shl(s)) else {
        return false;
    };
    status
        .lines()
        .filter_map(|line| {
            line.strip_prefix("SigCgt:")
                .or_else(|| line.strip_prefix("SigIgn:"))
        })
        .filter_map(|mask| u64::from_str_radix(mask.trim(), 16).ok())
        .any(|mask| mask & bit != 0)
}

/// The syscall a thread is stopped in at a seccomp stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SeccompStop {
    pub arch: u32,
    pub nr: i64,
    pub instruction_pointer: u64,
}

// struct ptrace_syscall_info, seccomp variant
#[repr(C)]
#[derive(Default)]
#[allow(dead_code)]
struct RawSyscallInfo {
    op: u8,
    pad: [u8; 3],
    arch: u32,
    instruction_pointer: u64,
    stack_pointer: u64,
    nr: u64,
    args: [u64; 6],
    ret_data: u32,
    reserved: u32,
}

/// Read the intercepted syscall with `PTRACE_GET_SYSCALL_INFO`
pub(crate) fn seccomp_stop(tid: Pid) -> Option<SeccompStop> {
    let mut info = RawSyscallInfo::default();
    // SAFETY: the kernel writes at most `size_of::<RawSyscallInfo>()` bytes
    let ret = unsafe {
        libc::ptrace(
            PTRACE_GET_SYSCALL_INFO,
            tid.as_raw(),
            std::mem::size_of::<RawSyscallInfo>() as *mut libc::c_void,
            (&raw mut info).cast::<libc::c_void>(),
        )
    };
    if ret <= 0 || info.op != PTRACE_SYSCALL_INFO_SECCOMP {
        return None;
    }
    Some(SeccompStop {
        arch: info.arch,
        nr: info.nr as i64,
        instruction_pointer: info.instruction_pointer,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const fn stopped(sig: i32, event: i32) -> libc::c_int {
        (event << 16) | (sig << 8) | 0x7f
    }

    #[test]
    fn decodes_exit_and_signal() {
        assert_eq!(decode(3 << 8), Some(Status::Exited(3)));
        assert_eq!(decode(libc::SIGKILL), Some(Status::Signaled(libc::SIGKILL)));
    }

    #[test]
    fn decodes_ptrace_stops() {
        assert_eq!(
            decode(stopped(libc::SIGTRAP, libc::PTRACE_EVENT_SECCOMP)),
            Some(Status::Event(libc::PTRACE_EVENT_SECCOMP))
        );
        assert_eq!(
            decode(stopped(libc::SIGSTOP, libc::PTRACE_EVENT_STOP)),
            Some(Status::GroupStop(libc::SIGSTOP))
        );
        assert_eq!(decode(stopped(libc::SIGABRT, 0)), Some(Status::Signal(libc::SIGABRT)));
        let rt = libc::SIGRTMIN() + 3;
        assert_eq!(decode(stopped(rt, 0)), Some(Status::Signal(rt)));
    }

    #[test]
    fn default_fatal_signals() {
        assert!(is_fatal_by_default(libc::SIGSEGV));
        assert!(is_fatal_by_default(libc::SIGRTMIN()));
        assert!(!is_fatal_by_default(libc::SIGCHLD));
        assert!(!is_fatal_by_default(libc::SIGTSTP));
    }

    #[test]
    fn reads_signal_masks() {
        let status = "Name:\tx\nSigBlk:\t0000000000000000\nSigIgn:\t0000000000001000\nSigCgt:\t0000000000000002\n";
        assert!(signal_in_masks(status, libc::SIGINT));
        assert!(signal_in_masks(status, libc::SIGPIPE));
        assert!(!signal_in_masks(status, libc::SIGABRT));
    }

    #[test]
    fn no_info_for_non_tracee() {
        assert_eq!(seccomp_stop(nix::unistd::getpid()), None);
    }
}
