//! Forking the sandboxee
//!
//! Everything the child needs is computed before `fork`: C strings, pointer
//! arrays, descriptors, the mount plan, the landlock ruleset and the filter.
//! After `fork` the child only issues raw syscalls on that data, reports the
//! first failing stage over an error pipe and exits with 127.

use crate::comms::{Comms, PolicyTransfer};
use crate::executor::{Executor, MAX_MAPPED_FD, Program};
use crate::isolation::namespace::IdMaps;
use crate::isolation::{MountPlan, seccomp};
use crate::policy::EXECVEAT_MAGIC;
use crate::policy::bpf::SockFilter;
use crate::{Policy, Result, StockadeError};
use landlock::RulesetCreated;
use nix::errno::Errno;
use nix::sched::CloneFlags;
use nix::sys::ptrace::{self, Options};
use nix::sys::resource::{Resource, getrlimit, setrlimit};
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, waitpid};
use nix::unistd::{ForkResult, Pid, fork, pipe2};
use std::ffi::{CString, OsStr};
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::net::UnixStream;

/// Descriptor number of the comms socket inside a cooperative sandboxee
pub(crate) const COMMS_FD: RawFd = 1023;

/// Internal descriptors live at or above this number until exec
const INTERNAL_FD_BASE: RawFd = MAX_MAPPED_FD + 1;

const CLOSE_RANGE_CLOEXEC: libc::c_uint = 1 << 2;
const FALLBACK_FD_LIMIT: RawFd = 4096;

/// Step of the child's setup sequence, reported on failure
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stage {
    ProcessGroup = 1,
    DeathSignal,
    Sync,
    Namespaces,
    IdMaps,
    Mounts,
    Descriptors,
    Limits,
    WorkingDir,
    Capabilities,
    Landlock,
    NoNewPrivs,
    Seccomp,
    Exec,
}

impl Stage {
    const ALL: [Self; 14] = [
        Self::ProcessGroup,
        Self::DeathSignal,
        Self::Sync,
        Self::Namespaces,
        Self::IdMaps,
        Self::Mounts,
        Self::Descriptors,
        Self::Limits,
        Self::WorkingDir,
        Self::Capabilities,
        Self::Landlock,
        Self::NoNewPrivs,
        Self::Seccomp,
        Self::Exec,
    ];

    fn from_u32(v: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|s| *s as u32 == v)
    }

    pub(crate) const fn describe(self) -> &'static str {
        match self {
            Self::ProcessGroup => "setting the process group",
            Self::DeathSignal => "setting the parent-death signal",
            Self::Sync => "waiting for the monitor",
            Self::Namespaces => "entering namespaces",
            Self::IdMaps => "writing uid/gid maps",
            Self::Mounts => "setting up mounts",
            Self::Descriptors => "arranging file descriptors",
            Self::Limits => "applying resource limits",
            Self::WorkingDir => "changing directory",
            Self::Capabilities => "dropping capabilities",
            Self::Landlock => "applying landlock rules",
            Self::NoNewPrivs => "setting no_new_privs",
            Self::Seccomp => "installing the seccomp filter",
            Self::Exec => "executing the program",
        }
    }
}

/// A setup failure reported by the child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SetupFailure {
    pub stage: Stage,
    pub errno: i32,
}

impl SetupFailure {
    fn encode(self) -> [u8; 8] {
        let mut buf = [0u8; 8];
        buf[..4].copy_from_slice(&(self.stage as u32).to_le_bytes());
        buf[4..].copy_from_slice(&self.errno.to_le_bytes());
        buf
    }

    fn decode(buf: [u8; 8]) -> Option<Self> {
        let stage = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let errno = i32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        Some(Self {
            stage: Stage::from_u32(stage)?,
            errno,
        })
    }

    pub(crate) fn message(self) -> String {
        format!(
            "{} failed: {}",
            self.stage.describe(),
            Errno::from_raw(self.errno).desc()
        )
    }
}

/// A forked, seized sandboxee that has been released to run
#[derive(Debug)]
pub(crate) struct Spawned {
    pub pid: Pid,
    pub error_pipe: File,
    pub comms: Option<Comms>,
}

impl Spawned {
    /// The child's failure report, if it wrote one
    pub(crate) fn setup_failure(&mut self) -> Option<SetupFailure> {
        let mut buf = [0u8; 8];
        match self.error_pipe.read_exact(&mut buf) {
            Ok(()) => SetupFailure::decode(buf),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof || e.kind() == ErrorKind::WouldBlock => {
                None
            }
            Err(e) => {
                tracing::debug!(error = %e, "error pipe unreadable");
                None
            }
        }
    }
}

/// Fork `executor`'s program under `policy`, seize it with ptrace and let it run
pub(crate) fn spawn(executor: Executor, policy: &Policy) -> Result<Spawned> {
    let plan = ChildPlan::prepare(executor, policy)?;

    // SAFETY: the child branch only runs `ChildPlan::exec`, which performs raw
    // syscalls on data prepared before the fork and never returns
    match unsafe { fork() }.map_err(|e| StockadeError::Spawn(format!("fork failed: {e}")))? {
        ForkResult::Child => plan.exec(),
        ForkResult::Parent { child } => plan.release(child),
    }
}

struct ChildPlan {
    exe: OwnedFd,
    // backing storage for the pointer arrays
    _strings: (Vec<CString>, Vec<CString>),
    argv_ptrs: Vec<*const libc::c_char>,
    envp_ptrs: Vec<*const libc::c_char>,
    cwd: Option<CString>,
    sync_rx: OwnedFd,
    sync_tx: OwnedFd,
    err_rx: OwnedFd,
    err_tx: OwnedFd,
    comms: Option<(UnixStream, OwnedFd)>,
    transfer: Option<PolicyTransfer>,
    fd_maps: Vec<(OwnedFd, RawFd)>,
    clone_flags: CloneFlags,
    id_maps: Option<IdMaps>,
    mounts: Option<MountPlan>,
    landlock: Option<RulesetCreated>,
    filter: Option<Vec<SockFilter>>,
    rlimits: Vec<(Resource, u64)>,
    parent: Pid,
}

impl ChildPlan {
    fn prepare(executor: Executor, policy: &Policy) -> Result<Self> {
        let Executor {
            program,
            argv,
            env,
            cwd,
            limits,
            sandbox_before_exec,
            fd_maps,
        } = executor;

        let exe = match program {
            Program::Path(path) => OpenOptions::new()
                .read(true)
                .custom_flags(libc::O_PATH)
                .open(&path)
                .map_err(|source| StockadeError::Program {
                    path,
                    source,
                })?
                .into(),
            Program::Fd(fd) => fd,
        };
        let exe = move_high(exe)?;

        let mut argv = argv
            .iter()
            .map(|a| to_cstring(a))
            .collect::<Result<Vec<_>>>()?;
        if argv.is_empty() {
            argv.push(to_cstring(OsStr::new(&format!("FD:{}", exe.as_raw_fd())))?);
        }

        let mut envp = env
            .iter()
            .filter(|(k, _)| k != crate::client::COMMS_FD_ENV)
            .map(|(k, v)| {
                let mut kv = k.as_bytes().to_vec();
                kv.push(b'=');
                kv.extend_from_slice(v.as_bytes());
                to_cstring(OsStr::from_bytes(&kv))
            })
            .collect::<Result<Vec<_>>>()?;

        let (comms, transfer) = if sandbox_before_exec {
            (None, None)
        } else {
            let (parent_end, child_end) = UnixStream::pair()?;
            let child_end = move_high(child_end.into())?;
            envp.push(to_cstring(OsStr::new(&format!(
                "{}={COMMS_FD}",
                crate::client::COMMS_FD_ENV
            )))?);
            (
                Some((parent_end, child_end)),
                Some(PolicyTransfer::from_policy(policy)),
            )
        };

        let argv_ptrs = null_terminated(&argv);
        let envp_ptrs = null_terminated(&envp);

        let cwd = cwd.as_deref().map(|d| to_cstring(d.as_os_str())).transpose()?;

        let (sync_rx, sync_tx) = pipe2(nix::fcntl::OFlag::O_CLOEXEC)?;
        let (err_rx, err_tx) = pipe2(nix::fcntl::OFlag::O_CLOEXEC)?;
        let sync_rx = move_high(sync_rx)?;
        let err_tx = move_high(err_tx)?;
        set_nonblocking(&err_rx)?;

        let fd_maps = fd_maps
            .into_iter()
            .map(|(fd, target)| {
                if !(0..=MAX_MAPPED_FD).contains(&target) {
                    return Err(StockadeError::Spawn(format!(
                        "cannot map a descriptor to {target}, the limit is {MAX_MAPPED_FD}"
                    )));
                }
                Ok((move_high(fd)?, target))
            })
            .collect::<Result<Vec<_>>>()?;

        let (clone_flags, id_maps) = match policy.namespaces() {
            Some(ns) => {
                if !ns.user && !has_sys_admin() {
                    return Err(StockadeError::Namespace(
                        "namespaces without a user namespace need CAP_SYS_ADMIN".into(),
                    ));
                }
                (ns.to_clone_flags(), ns.user.then(IdMaps::current))
            }
            None => (CloneFlags::empty(), None),
        };

        let mounts = policy
            .mounts()
            .filter(|m| !m.is_empty())
            .map(crate::isolation::MountConfig::prepare)
            .transpose()?;
        let landlock = policy.landlock().prepare()?;

        let filter = sandbox_before_exec.then(|| policy.program().to_vec());

        let mut rlimits = Vec::new();
        for (resource, value) in [
            (Resource::RLIMIT_CPU, limits.cpu_time),
            (Resource::RLIMIT_AS, limits.address_space),
            (Resource::RLIMIT_FSIZE, limits.file_size),
            (Resource::RLIMIT_NOFILE, limits.open_files),
            (Resource::RLIMIT_CORE, (!limits.core_dump).then_some(0)),
        ] {
            if let Some(value) = value {
                let (_, hard) = getrlimit(resource)?;
                rlimits.push((resource, value.min(hard)));
            }
        }

        tracing::debug!(
            argv0 = ?argv.first(),
            cooperative = !sandbox_before_exec,
            namespaces = ?clone_flags,
            "child plan prepared"
        );

        Ok(Self {
            exe,
            _strings: (argv, envp),
            argv_ptrs,
            envp_ptrs,
            cwd,
            sync_rx,
            sync_tx,
            err_rx,
            err_tx,
            comms,
            transfer,
            fd_maps,
            clone_flags,
            id_maps,
            mounts,
            landlock,
            filter,
            rlimits,
            parent: nix::unistd::getpid(),
        })
    }

    /// Parent side: seize the child, hand over the policy, release it
    fn release(self, child: Pid) -> Result<Spawned> {
        let Self {
            sync_tx,
            err_rx,
            comms,
            transfer,
            ..
        } = self;
        let comms = comms.map(|(parent_end, _child_end)| Comms::new(parent_end));

        let options = Options::PTRACE_O_TRACESECCOMP
            | Options::PTRACE_O_TRACECLONE
            | Options::PTRACE_O_TRACEFORK
            | Options::PTRACE_O_TRACEVFORK
            | Options::PTRACE_O_TRACEEXEC
            | Options::PTRACE_O_TRACEEXIT
            | Options::PTRACE_O_EXITKILL;
        if let Err(e) = ptrace::seize(child, options) {
            abandon(child);
            return Err(StockadeError::Spawn(format!("ptrace seize failed: {e}")));
        }

        let mut comms = comms;
        if let (Some(channel), Some(transfer)) = (comms.as_mut(), transfer.as_ref()) {
            if let Err(e) = channel.send_policy(transfer) {
                abandon(child);
                return Err(e);
            }
        }

        let mut sync = File::from(sync_tx);
        if let Err(e) = sync.write_all(&[1]) {
            abandon(child);
            return Err(StockadeError::Spawn(format!("failed to release child: {e}")));
        }

        tracing::info!(pid = child.as_raw(), "sandboxee started");
        Ok(Spawned {
            pid: child,
            error_pipe: File::from(err_rx),
            comms,
        })
    }

    /// Child side. Never returns.
    fn exec(mut self) -> ! {
        let err_fd = self.err_tx.as_raw_fd();
        let fail = |stage: Stage, errno: Errno| -> ! { report_and_exit(err_fd, stage, errno) };

        // SAFETY: raw syscalls on descriptors and buffers owned by this plan
        unsafe {
            if libc::setpgid(0, 0) != 0 {
                fail(Stage::ProcessGroup, Errno::last());
            }
            if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL, 0, 0, 0) != 0 {
                fail(Stage::DeathSignal, Errno::last());
            }
            if libc::getppid() != self.parent.as_raw() {
                libc::_exit(127);
            }

            let mut byte = 0u8;
            loop {
                let n = libc::read(self.sync_rx.as_raw_fd(), (&raw mut byte).cast(), 1);
                if n == 1 {
                    break;
                }
                if n == 0 {
                    // monitor gave up before releasing us
                    libc::_exit(127);
                }
                if Errno::last() != Errno::EINTR {
                    fail(Stage::Sync, Errno::last());
                }
            }
        }

        if !self.clone_flags.is_empty() {
            // SAFETY: unshare takes flags only
            if unsafe { libc::unshare(self.clone_flags.bits()) } != 0 {
                fail(Stage::Namespaces, Errno::last());
            }
            if let Some(maps) = &self.id_maps {
                if let Err(e) = maps.write_self() {
                    fail(Stage::IdMaps, e);
                }
            }
        }

        if let Some(mounts) = &self.mounts {
            if let Err(e) = mounts.apply() {
                fail(Stage::Mounts, e);
            }
        }

        if let Err(e) = self.arrange_descriptors() {
            fail(Stage::Descriptors, e);
        }

        for (resource, value) in &self.rlimits {
            if let Err(e) = setrlimit(*resource, *value, *value) {
                fail(Stage::Limits, e);
            }
        }

        if let Some(dir) = &self.cwd {
            // SAFETY: NUL-terminated path
            if unsafe { libc::chdir(dir.as_ptr()) } != 0 {
                fail(Stage::WorkingDir, Errno::last());
            }
        }

        // SAFETY: prctl with integer arguments only
        let ret = unsafe {
            libc::prctl(
                libc::PR_CAP_AMBIENT,
                libc::PR_CAP_AMBIENT_CLEAR_ALL,
                0,
                0,
                0,
            )
        };
        if ret != 0 && Errno::last() != Errno::EINVAL {
            fail(Stage::Capabilities, Errno::last());
        }

        if let Some(ruleset) = self.landlock.take() {
            if ruleset.restrict_self().is_err() {
                fail(Stage::Landlock, Errno::EPERM);
            }
        }

        // SAFETY: prctl with integer arguments only
        if unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) } != 0 {
            fail(Stage::NoNewPrivs, Errno::last());
        }

        if let Some(filter) = &self.filter {
            if let Err(e) = seccomp::install_current_thread(filter) {
                fail(Stage::Seccomp, e);
            }
        }

        // SAFETY: argv/envp are null-terminated arrays into CStrings owned
        // by `self`; the magic argument marks this call for the filter
        unsafe {
            libc::syscall(
                libc::SYS_execveat,
                self.exe.as_raw_fd(),
                c"".as_ptr(),
                self.argv_ptrs.as_ptr(),
                self.envp_ptrs.as_ptr(),
                libc::AT_EMPTY_PATH,
                EXECVEAT_MAGIC,
            );
        }
        report_and_exit(err_fd, Stage::Exec, Errno::last())
    }

    /// Mark everything close-on-exec, then install the mapped descriptors
    fn arrange_descriptors(&self) -> std::result::Result<(), Errno> {
        // SAFETY: close_range/fcntl/dup2 on integer descriptors
        unsafe {
            let ret = libc::syscall(libc::SYS_close_range, 3u32, u32::MAX, CLOSE_RANGE_CLOEXEC);
            if ret != 0 {
                for fd in 3..FALLBACK_FD_LIMIT {
                    libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
                }
            }

            for (fd, target) in &self.fd_maps {
                Errno::result(libc::dup2(fd.as_raw_fd(), *target))?;
            }
            if let Some((_, child_end)) = &self.comms {
                Errno::result(libc::dup2(child_end.as_raw_fd(), COMMS_FD))?;
            }
        }
        Ok(())
    }
}

fn report_and_exit(err_fd: RawFd, stage: Stage, errno: Errno) -> ! {
    let report = SetupFailure {
        stage,
        errno: errno as i32,
    }
    .encode();
    // SAFETY: write and _exit are async-signal-safe
    unsafe {
        libc::write(err_fd, report.as_ptr().cast(), report.len());
        libc::_exit(127)
    }
}

/// Kill and reap a child that will never be monitored
fn abandon(child: Pid) {
    let _ = kill(child, Signal::SIGKILL);
    let _ = waitpid(child, Some(WaitPidFlag::__WALL));
}

fn has_sys_admin() -> bool {
    caps::has_cap(None, caps::CapSet::Effective, caps::Capability::CAP_SYS_ADMIN).unwrap_or(false)
}

/// Duplicate `fd` into the internal range, closing the original
fn move_high(fd: OwnedFd) -> Result<OwnedFd> {
    if fd.as_raw_fd() >= INTERNAL_FD_BASE && fd.as_raw_fd() < COMMS_FD {
        return Ok(fd);
    }
    // SAFETY: F_DUPFD_CLOEXEC on a descriptor we own
    let raw = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_DUPFD_CLOEXEC, INTERNAL_FD_BASE) };
    let raw = Errno::result(raw)?;
    // SAFETY: `raw` is a fresh descriptor returned by fcntl
    let high = unsafe { OwnedFd::from_raw_fd(raw) };
    if raw >= COMMS_FD {
        return Err(StockadeError::Spawn(format!(
            "too many open descriptors: got {raw}"
        )));
    }
    Ok(high)
}

fn set_nonblocking(fd: &OwnedFd) -> Result<()> {
    // SAFETY: fcntl on a descriptor we own
    unsafe {
        let flags = Errno::result(libc::fcntl(fd.as_raw_fd(), libc::F_GETFL))?;
        Errno::result(libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK))?;
    }
    Ok(())
}

fn to_cstring(s: &OsStr) -> Result<CString> {
    CString::new(s.as_bytes())
        .map_err(|_| StockadeError::Spawn(format!("{s:?} contains a NUL byte")))
}

fn null_terminated(strings: &[CString]) -> Vec<*const libc::c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_report_survives_the_pipe() {
        let report = SetupFailure {
            stage: Stage::Seccomp,
            errno: libc::EACCES,
        };
        assert_eq!(SetupFailure::decode(report.encode()), Some(report));
        assert!(report.message().contains("seccomp"));
    }

    #[test]
    fn unknown_stage_is_rejected() {
        let mut buf = [0u8; 8];
        buf[..4].copy_from_slice(&99u32.to_le_bytes());
        assert_eq!(SetupFailure::decode(buf), None);
    }

    #[test]
    fn descriptors_move_into_internal_range() {
        let file = tempfile::tempfile().unwrap();
        let fd = move_high(file.into()).unwrap();
        assert!((INTERNAL_FD_BASE..COMMS_FD).contains(&fd.as_raw_fd()));
    }

    #[test]
    fn pointer_arrays_are_null_terminated() {
        let strings = vec![CString::new("a").unwrap(), CString::new("b").unwrap()];
        let ptrs = null_terminated(&strings);
        assert_eq!(ptrs.len(), 3);
        assert!(ptrs[2].is_null());
    }

    #[test]
    fn mapping_above_the_limit_is_rejected() {
        let policy = Policy::builder()
            .danger_default_allow_all()
            .build()
            .unwrap();
        let file = tempfile::tempfile().unwrap();
        let exec = Executor::new("/bin/true", ["true"]).map_fd(file.into(), MAX_MAPPED_FD + 1);
        assert!(matches!(
            ChildPlan::prepare(exec, &policy),
            Err(StockadeError::Spawn(_))
        ));
    }

    #[test]
    fn fd_argv0_names_the_exec_descriptor() {
        let policy = Policy::builder()
            .danger_default_allow_all()
            .build()
            .unwrap();
        let file = std::fs::File::open("/proc/self/exe").unwrap();
        let exec = Executor::from_fd(file.into(), Vec::<String>::new());
        let plan = ChildPlan::prepare(exec, &policy).unwrap();
        let expected = CString::new(format!("FD:{}", plan.exe.as_raw_fd())).unwrap();
        assert_eq!(plan._strings.0, [expected]);
    }

    #[test]
    fn missing_binary_fails_before_fork() {
        let policy = Policy::builder()
            .danger_default_allow_all()
            .build()
            .unwrap();
        let exec = Executor::new("/nonexistent/binary", Vec::<String>::new());
        let err = spawn(exec, &policy).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
    }
}
