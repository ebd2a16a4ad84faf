//! Syscall names, numbers and argument counts for the native architecture

/// Name, number and argument count of a known syscall
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallInfo {
    pub name: &'static str,
    pub nr: i64,
    pub arity: u8,
}

const fn s(name: &'static str, nr: libc::c_long, arity: u8) -> SyscallInfo {
    SyscallInfo {
        name,
        nr: nr as i64,
        arity,
    }
}

const COMMON: &[SyscallInfo] = &[
    s("read", libc::SYS_read, 3),
    s("write", libc::SYS_write, 3),
    s("close", libc::SYS_close, 1),
    s("close_range", libc::SYS_close_range, 3),
    s("openat", libc::SYS_openat, 4),
    s("fstat", libc::SYS_fstat, 2),
    s("newfstatat", libc::SYS_newfstatat, 4),
    s("statx", libc::SYS_statx, 5),
    s("lseek", libc::SYS_lseek, 3),
    s("mmap", libc::SYS_mmap, 6),
    s("mprotect", libc::SYS_mprotect, 3),
    s("munmap", libc::SYS_munmap, 2),
    s("mremap", libc::SYS_mremap, 5),
    s("madvise", libc::SYS_madvise, 3),
    s("brk", libc::SYS_brk, 1),
    s("rt_sigaction", libc::SYS_rt_sigaction, 4),
    s("rt_sigprocmask", libc::SYS_rt_sigprocmask, 4),
    s("rt_sigreturn", libc::SYS_rt_sigreturn, 0),
    s("sigaltstack", libc::SYS_sigaltstack, 2),
    s("ioctl", libc::SYS_ioctl, 3),
    s("pread64", libc::SYS_pread64, 4),
    s("pwrite64", libc::SYS_pwrite64, 4),
    s("readv", libc::SYS_readv, 3),
    s("writev", libc::SYS_writev, 3),
    s("faccessat", libc::SYS_faccessat, 3),
    s("pipe2", libc::SYS_pipe2, 2),
    s("dup", libc::SYS_dup, 1),
    s("dup3", libc::SYS_dup3, 3),
    s("fcntl", libc::SYS_fcntl, 3),
    s("flock", libc::SYS_flock, 2),
    s("fsync", libc::SYS_fsync, 1),
    s("ftruncate", libc::SYS_ftruncate, 2),
    s("getdents64", libc::SYS_getdents64, 3),
    s("getcwd", libc::SYS_getcwd, 2),
    s("chdir", libc::SYS_chdir, 1),
    s("fchdir", libc::SYS_fchdir, 1),
    s("mkdirat", libc::SYS_mkdirat, 3),
    s("unlinkat", libc::SYS_unlinkat, 3),
    s("readlinkat", libc::SYS_readlinkat, 4),
    s("fchmod", libc::SYS_fchmod, 2),
    s("fchown", libc::SYS_fchown, 3),
    s("umask", libc::SYS_umask, 1),
    s("sched_yield", libc::SYS_sched_yield, 0),
    s("sched_getaffinity", libc::SYS_sched_getaffinity, 3),
    s("sched_setaffinity", libc::SYS_sched_setaffinity, 3),
    s("nanosleep", libc::SYS_nanosleep, 2),
    s("clock_gettime", libc::SYS_clock_gettime, 2),
    s("clock_getres", libc::SYS_clock_getres, 2),
    s("clock_nanosleep", libc::SYS_clock_nanosleep, 4),
    s("gettimeofday", libc::SYS_gettimeofday, 2),
    s("getpid", libc::SYS_getpid, 0),
    s("getppid", libc::SYS_getppid, 0),
    s("gettid", libc::SYS_gettid, 0),
    s("getuid", libc::SYS_getuid, 0),
    s("geteuid", libc::SYS_geteuid, 0),
    s("getgid", libc::SYS_getgid, 0),
    s("getegid", libc::SYS_getegid, 0),
    s("setpgid", libc::SYS_setpgid, 2),
    s("setsid", libc::SYS_setsid, 0),
    s("getrlimit", libc::SYS_getrlimit, 2),
    s("prlimit64", libc::SYS_prlimit64, 4),
    s("uname", libc::SYS_uname, 1),
    s("prctl", libc::SYS_prctl, 5),
    s("futex", libc::SYS_futex, 6),
    s("set_tid_address", libc::SYS_set_tid_address, 1),
    s("set_robust_list", libc::SYS_set_robust_list, 2),
    s("get_robust_list", libc::SYS_get_robust_list, 3),
    s("rseq", libc::SYS_rseq, 4),
    s("getrandom", libc::SYS_getrandom, 3),
    s("ppoll", libc::SYS_ppoll, 5),
    s("pselect6", libc::SYS_pselect6, 6),
    s("epoll_create1", libc::SYS_epoll_create1, 1),
    s("epoll_ctl", libc::SYS_epoll_ctl, 4),
    s("epoll_pwait", libc::SYS_epoll_pwait, 6),
    s("eventfd2", libc::SYS_eventfd2, 2),
    s("socket", libc::SYS_socket, 3),
    s("socketpair", libc::SYS_socketpair, 4),
    s("connect", libc::SYS_connect, 3),
    s("bind", libc::SYS_bind, 3),
    s("listen", libc::SYS_listen, 2),
    s("accept", libc::SYS_accept, 3),
    s("accept4", libc::SYS_accept4, 4),
    s("sendto", libc::SYS_sendto, 6),
    s("recvfrom", libc::SYS_recvfrom, 6),
    s("sendmsg", libc::SYS_sendmsg, 3),
    s("recvmsg", libc::SYS_recvmsg, 3),
    s("shutdown", libc::SYS_shutdown, 2),
    s("clone", libc::SYS_clone, 5),
    s("clone3", libc::SYS_clone3, 2),
    s("execve", libc::SYS_execve, 3),
    s("execveat", libc::SYS_execveat, 5),
    s("wait4", libc::SYS_wait4, 4),
    s("waitid", libc::SYS_waitid, 5),
    s("kill", libc::SYS_kill, 2),
    s("tgkill", libc::SYS_tgkill, 3),
    s("exit", libc::SYS_exit, 1),
    s("exit_group", libc::SYS_exit_group, 1),
    s("memfd_create", libc::SYS_memfd_create, 2),
    s("capget", libc::SYS_capget, 2),
    s("capset", libc::SYS_capset, 2),
    s("mount", libc::SYS_mount, 5),
    s("umount2", libc::SYS_umount2, 2),
    s("pivot_root", libc::SYS_pivot_root, 2),
    s("unshare", libc::SYS_unshare, 1),
    s("setns", libc::SYS_setns, 2),
    s("seccomp", libc::SYS_seccomp, 3),
    s("ptrace", libc::SYS_ptrace, 4),
    s("bpf", libc::SYS_bpf, 3),
    s("kexec_load", libc::SYS_kexec_load, 4),
    s("kexec_file_load", libc::SYS_kexec_file_load, 5),
    s("init_module", libc::SYS_init_module, 3),
    s("finit_module", libc::SYS_finit_module, 3),
    s("delete_module", libc::SYS_delete_module, 2),
    s("reboot", libc::SYS_reboot, 4),
];

#[cfg(target_arch = "x86_64")]
const ARCH_SPECIFIC: &[SyscallInfo] = &[
    s("open", libc::SYS_open, 3),
    s("stat", libc::SYS_stat, 2),
    s("lstat", libc::SYS_lstat, 2),
    s("access", libc::SYS_access, 2),
    s("readlink", libc::SYS_readlink, 3),
    s("pipe", libc::SYS_pipe, 1),
    s("dup2", libc::SYS_dup2, 2),
    s("poll", libc::SYS_poll, 3),
    s("select", libc::SYS_select, 5),
    s("epoll_wait", libc::SYS_epoll_wait, 4),
    s("arch_prctl", libc::SYS_arch_prctl, 2),
    s("fork", libc::SYS_fork, 0),
    s("vfork", libc::SYS_vfork, 0),
    s("getdents", libc::SYS_getdents, 3),
    s("mkdir", libc::SYS_mkdir, 2),
    s("unlink", libc::SYS_unlink, 1),
    s("rename", libc::SYS_rename, 2),
    s("time", libc::SYS_time, 1),
    s("alarm", libc::SYS_alarm, 1),
    s("pause", libc::SYS_pause, 0),
    s("getpgrp", libc::SYS_getpgrp, 0),
];

#[cfg(target_arch = "aarch64")]
const ARCH_SPECIFIC: &[SyscallInfo] = &[];

fn all() -> impl Iterator<Item = &'static SyscallInfo> {
    COMMON.iter().chain(ARCH_SPECIFIC)
}

/// Look up a syscall by name
#[must_use]
pub fn by_name(name: &str) -> Option<SyscallInfo> {
    all().find(|s| s.name == name).copied()
}

/// Look up a syscall by number
#[must_use]
pub fn by_number(nr: i64) -> Option<SyscallInfo> {
    all().find(|s| s.nr == nr).copied()
}

/// Name of a native syscall, if known
#[must_use]
pub fn name(nr: i64) -> Option<&'static str> {
    by_number(nr).map(|s| s.name)
}

/// Argument count, if the syscall is known
#[must_use]
pub fn arity(nr: i64) -> Option<u8> {
    by_number(nr).map(|s| s.arity)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_and_numbers_agree() {
        let write = by_name("write").unwrap();
        assert_eq!(write.nr, libc::SYS_write);
        assert_eq!(name(write.nr), Some("write"));
        assert_eq!(arity(libc::SYS_getpid), Some(0));
    }

    #[test]
    fn unknown_syscalls_have_no_arity() {
        assert_eq!(arity(0xfff), None);
        assert!(by_name("definitely_not_a_syscall").is_none());
    }

    #[test]
    fn table_has_no_duplicate_numbers() {
        let mut seen = std::collections::HashSet::new();
        for info in all() {
            assert!(seen.insert(info.nr), "duplicate entry for {}", info.name);
        }
    }
}
