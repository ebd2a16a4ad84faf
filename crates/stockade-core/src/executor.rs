//! What to run and under which limits

use std::ffi::OsString;
use std::os::fd::{OwnedFd, RawFd};
use std::path::PathBuf;
use std::time::Duration;

/// Highest descriptor number a caller may map into the sandboxee.
/// Descriptors at and above it are reserved for the sandbox itself.
pub const MAX_MAPPED_FD: RawFd = 511;

/// Resource limits applied to the sandboxee before exec
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Limits {
    /// Wall-clock limit, counted from the start of the run
    pub walltime: Option<Duration>,
    /// `RLIMIT_CPU`, whole seconds
    pub cpu_time: Option<u64>,
    /// `RLIMIT_AS` in bytes
    pub address_space: Option<u64>,
    /// `RLIMIT_FSIZE` in bytes
    pub file_size: Option<u64>,
    /// `RLIMIT_NOFILE`
    pub open_files: Option<u64>,
    /// Leave `RLIMIT_CORE` alone; otherwise it is set to 0
    pub core_dump: bool,
}

impl Limits {
    #[must_use]
    pub const fn walltime(mut self, limit: Duration) -> Self {
        self.walltime = Some(limit);
        self
    }

    #[must_use]
    pub const fn cpu_time_secs(mut self, secs: u64) -> Self {
        self.cpu_time = Some(secs);
        self
    }

    #[must_use]
    pub const fn address_space(mut self, bytes: u64) -> Self {
        self.address_space = Some(bytes);
        self
    }

    #[must_use]
    pub const fn address_space_mb(self, mb: u64) -> Self {
        self.address_space(mb * 1024 * 1024)
    }

    #[must_use]
    pub const fn file_size(mut self, bytes: u64) -> Self {
        self.file_size = Some(bytes);
        self
    }

    #[must_use]
    pub const fn open_files(mut self, count: u64) -> Self {
        self.open_files = Some(count);
        self
    }

    #[must_use]
    pub const fn core_dump(mut self, enable: bool) -> Self {
        self.core_dump = enable;
        self
    }
}

/// The program image
#[derive(Debug)]
pub enum Program {
    Path(PathBuf),
    /// An already opened executable
    Fd(OwnedFd),
}

/// Identity, arguments, environment and limits of the program to sandbox
#[derive(Debug)]
pub struct Executor {
    pub(crate) program: Program,
    pub(crate) argv: Vec<OsString>,
    pub(crate) env: Vec<(OsString, OsString)>,
    pub(crate) cwd: Option<PathBuf>,
    pub(crate) limits: Limits,
    pub(crate) sandbox_before_exec: bool,
    pub(crate) fd_maps: Vec<(OwnedFd, RawFd)>,
}

impl Executor {
    /// Run the binary at `path`. `args` is the full argument vector including
    /// `argv[0]`; when empty, `argv[0]` is the path itself.
    #[must_use]
    pub fn new<I, S>(path: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let path = path.into();
        let mut argv: Vec<OsString> = args.into_iter().map(Into::into).collect();
        if argv.is_empty() {
            argv.push(path.clone().into_os_string());
        }
        Self::with_program(Program::Path(path), argv)
    }

    /// Run an already opened executable. When `args` is empty, `argv[0]`
    /// becomes `FD:<n>` at spawn time, where `n` is the descriptor handed to
    /// `execveat`. That descriptor is close-on-exec, so the name is only
    /// informational inside the sandboxee.
    #[must_use]
    pub fn from_fd<I, S>(fd: OwnedFd, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let argv: Vec<OsString> = args.into_iter().map(Into::into).collect();
        Self::with_program(Program::Fd(fd), argv)
    }

    fn with_program(program: Program, argv: Vec<OsString>) -> Self {
        Self {
            program,
            argv,
            env: std::env::vars_os().collect(),
            cwd: None,
            limits: Limits::default(),
            sandbox_before_exec: true,
            fd_maps: Vec::new(),
        }
    }

    /// Replace the environment. The default is a copy of the caller's.
    #[must_use]
    pub fn env<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<OsString>,
        V: Into<OsString>,
    {
        self.env = vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        self
    }

    /// Set or replace one environment variable
    #[must_use]
    pub fn env_var(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        let key = key.into();
        self.env.retain(|(k, _)| *k != key);
        self.env.push((key, value.into()));
        self
    }

    #[must_use]
    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    #[must_use]
    pub fn limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn limits_mut(&mut self) -> &mut Limits {
        &mut self.limits
    }

    /// When false, the sandboxee installs the policy itself through
    /// [`crate::client::Client`] once it is ready.
    #[must_use]
    pub const fn enable_sandbox_before_exec(mut self, enable: bool) -> Self {
        self.sandbox_before_exec = enable;
        self
    }

    /// Make `fd` available as `target` in the sandboxee. `target` must not
    /// exceed [`MAX_MAPPED_FD`]; this is checked when the run starts.
    #[must_use]
    pub fn map_fd(mut self, fd: OwnedFd, target: RawFd) -> Self {
        self.fd_maps.push((fd, target));
        self
    }

    #[must_use]
    pub fn argv(&self) -> &[OsString] {
        &self.argv
    }

    #[must_use]
    pub const fn program(&self) -> &Program {
        &self.program
    }

    #[must_use]
    pub const fn limits_ref(&self) -> &Limits {
        &self.limits
    }

    #[must_use]
    pub const fn sandbox_before_exec(&self) -> bool {
        self.sandbox_before_exec
    }
}
