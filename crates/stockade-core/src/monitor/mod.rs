//! ptrace supervision of a running sandboxee
//!
//! The monitor thread forks the sandboxee, becomes its tracer, and turns
//! every ptrace event into either "continue" or a final [`ExecutionResult`].
//! It waits on SIGCHLD, the sandbox's wake socket and a bounded poll
//! interval, so kills and deadline changes take effect within
//! [`POLL_INTERVAL`].

mod notify;
mod tracee;

use self::notify::Notifier;
use self::tracee::Status;
use crate::comms::Ack;
use crate::policy::{Decision, NATIVE_AUDIT_ARCH, syscalls};
use crate::result::{ExecutionResult, FinalStatus, Violation};
use crate::sandbox::Shared;
use crate::spawn::{self, Spawned};
use crate::stack_trace::{self, Frame};
use crate::{Executor, Policy};
use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::Pid;
use std::collections::BTreeSet;
use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

/// Longest the loop sleeps before rechecking the kill flag and deadline
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Bound on events handled between two deadline checks
const MAX_EVENTS_PER_PASS: usize = 4096;
const FREEZE_BUDGET: Duration = Duration::from_millis(500);
const CAPTURE_BUDGET: Duration = Duration::from_secs(1);
const REAP_BUDGET: Duration = Duration::from_secs(2);
const SECCOMP_RET_DATA: u64 = 0xffff;

/// Entry point of the monitor thread. Always leaves a result in `shared`.
pub(crate) fn run(executor: Executor, policy: &Policy, shared: &Shared, wake: UnixStream) {
    let started = Instant::now();
    let _guard = FinishGuard { shared, started };
    shared.start_clock(executor.limits.walltime);

    let result = match Notifier::new(wake) {
        Err(e) => setup_error(&e),
        Ok(notifier) => match spawn::spawn(executor, policy) {
            Err(e) => {
                tracing::warn!(error = %e, "sandboxee setup failed");
                setup_error(&e)
            }
            Ok(child) => Monitor::new(policy, shared, notifier, child).run(),
        },
    };
    shared.finish(result.with_wall_time(started.elapsed()));
}

/// Stores a result if the monitor unwinds before reaching `finish`. The
/// sandboxee dies with the thread through its parent-death signal.
struct FinishGuard<'a> {
    shared: &'a Shared,
    started: Instant,
}

impl Drop for FinishGuard<'_> {
    fn drop(&mut self) {
        if !self.shared.is_finished() {
            tracing::error!("monitor stopped without a result");
            self.shared.finish(
                ExecutionResult::setup_error(0, "monitor thread failed")
                    .with_wall_time(self.started.elapsed()),
            );
        }
    }
}

fn unsandboxed(message: String) -> ExecutionResult {
    ExecutionResult::setup_error(i64::from(libc::EPIPE), message)
}

fn setup_error(e: &crate::StockadeError) -> ExecutionResult {
    ExecutionResult::setup_error(e.raw_os_error().map_or(0, i64::from), e.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Forked, not yet exec'd into the target program
    Spawning,
    Tracing,
}

#[derive(Debug, Clone, Copy)]
enum Exit {
    Code(i32),
    Signal(i32),
}

struct Monitor<'a> {
    policy: &'a Policy,
    shared: &'a Shared,
    notifier: Notifier,
    child: Spawned,
    tracees: BTreeSet<Pid>,
    /// Auto-attached tracees that have not reported their initial stop
    fresh: BTreeSet<Pid>,
    phase: Phase,
    marker_seen: bool,
    /// Trace captured at a fatal signal or abnormal exit, reported with it
    stashed_trace: Vec<Frame>,
}

impl<'a> Monitor<'a> {
    fn new(policy: &'a Policy, shared: &'a Shared, notifier: Notifier, child: Spawned) -> Self {
        let mut tracees = BTreeSet::new();
        tracees.insert(child.pid);
        Self {
            policy,
            shared,
            notifier,
            child,
            tracees,
            fresh: BTreeSet::new(),
            phase: Phase::Spawning,
            marker_seen: false,
            stashed_trace: Vec::new(),
        }
    }

    const fn pid(&self) -> Pid {
        self.child.pid
    }

    fn run(mut self) -> ExecutionResult {
        loop {
            if self.shared.kill_requested() {
                return self.external_kill();
            }

            if let Some(result) = self.drain() {
                return result;
            }

            let now = Instant::now();
            let mut wait = POLL_INTERVAL;
            if let Some(deadline) = self.shared.deadline() {
                if now >= deadline {
                    return self.timeout();
                }
                wait = wait.min(deadline - now);
            }

            let comms = self.child.comms.as_ref().map(AsFd::as_fd);
            if let Err(e) = self.notifier.wait(wait, comms) {
                tracing::warn!(error = %e, "poll failed");
                std::thread::sleep(wait);
            }
            if let Some(result) = self.poll_ack() {
                return result;
            }
        }
    }

    /// Handle every pending event, up to [`MAX_EVENTS_PER_PASS`]
    fn drain(&mut self) -> Option<ExecutionResult> {
        let mut handled = 0;
        let tids: Vec<Pid> = self.tracees.iter().copied().collect();
        for tid in tids {
            while handled < MAX_EVENTS_PER_PASS && self.tracees.contains(&tid) {
                let status = match tracee::wait_nohang(tid) {
                    Ok(Some(status)) => status,
                    Ok(None) => break,
                    Err(Errno::EINTR) => continue,
                    Err(e) => {
                        self.tracees.remove(&tid);
                        if tid == self.pid() {
                            tracing::error!(error = %e, "lost track of the sandboxee");
                            self.kill_all();
                            return Some(ExecutionResult::new(
                                FinalStatus::Signaled,
                                i64::from(libc::SIGKILL),
                            ));
                        }
                        break;
                    }
                };
                handled += 1;
                let Some(status) = tracee::decode(status) else {
                    continue;
                };
                if let Some(result) = self.handle(tid, status) {
                    return Some(result);
                }
            }
        }
        None
    }

    fn handle(&mut self, tid: Pid, status: Status) -> Option<ExecutionResult> {
        match status {
            Status::Exited(code) => return self.exited(tid, Exit::Code(code)),
            Status::Signaled(sig) => return self.exited(tid, Exit::Signal(sig)),
            Status::Event(event) => return self.event(tid, event),
            Status::GroupStop(sig) => {
                let initial = self.fresh.remove(&tid);
                let resumed = if !initial && tracee::is_job_control_stop(sig) {
                    tracee::listen(tid)
                } else {
                    tracee::resume(tid, 0)
                };
                check_resume(tid, resumed);
            }
            Status::Signal(sig) => self.signal(tid, sig),
        }
        None
    }

    fn exited(&mut self, tid: Pid, exit: Exit) -> Option<ExecutionResult> {
        self.tracees.remove(&tid);
        self.fresh.remove(&tid);
        if tid != self.pid() {
            tracing::trace!(tid = tid.as_raw(), ?exit, "tracee gone");
            return None;
        }

        if self.phase == Phase::Spawning {
            let failure = self.child.setup_failure();
            self.kill_all();
            return Some(match failure {
                Some(failure) => {
                    tracing::warn!(stage = ?failure.stage, errno = failure.errno, "sandboxee setup failed");
                    ExecutionResult::setup_error(i64::from(failure.errno), failure.message())
                }
                None => ExecutionResult::setup_error(
                    0,
                    format!("sandboxee ended ({exit:?}) before running its program"),
                ),
            });
        }

        // An ack sent just before exiting is still buffered
        if let Some(result) = self.poll_ack() {
            return Some(result);
        }
        if self.child.comms.is_some() {
            self.kill_all();
            return Some(unsandboxed(format!(
                "sandboxee ended ({exit:?}) without installing its policy"
            )));
        }

        self.kill_all();
        let trace = std::mem::take(&mut self.stashed_trace);
        let result = match exit {
            Exit::Code(code) => ExecutionResult::new(FinalStatus::Ok, i64::from(code)),
            Exit::Signal(sig) => ExecutionResult::new(FinalStatus::Signaled, i64::from(sig)),
        };
        Some(result.with_stack_trace(trace))
    }

    fn event(&mut self, tid: Pid, event: i32) -> Option<ExecutionResult> {
        match event {
            libc::PTRACE_EVENT_SECCOMP => return self.seccomp(tid),
            libc::PTRACE_EVENT_CLONE | libc::PTRACE_EVENT_FORK | libc::PTRACE_EVENT_VFORK => {
                match ptrace::getevent(tid) {
                    Ok(new) => {
                        let new = Pid::from_raw(new as i32);
                        tracing::trace!(parent = tid.as_raw(), tid = new.as_raw(), "new tracee");
                        self.tracees.insert(new);
                        self.fresh.insert(new);
                    }
                    Err(e) => tracing::debug!(tid = tid.as_raw(), error = %e, "no new tracee id"),
                }
            }
            libc::PTRACE_EVENT_EXEC => {
                if self.phase == Phase::Spawning {
                    self.phase = Phase::Tracing;
                    self.shared.mark_running();
                    tracing::debug!(pid = self.pid().as_raw(), "sandboxee running");
                }
            }
            libc::PTRACE_EVENT_EXIT => {
                if tid == self.pid()
                    && self.phase == Phase::Tracing
                    && self.policy.stacktraces().on_exit
                    && self.stashed_trace.is_empty()
                {
                    let status = ptrace::getevent(tid).unwrap_or(0) as libc::c_int;
                    let clean = libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0;
                    if !clean {
                        self.stashed_trace = stack_trace::capture(&[tid], CAPTURE_BUDGET);
                    }
                }
            }
            _ => {}
        }
        let resumed = tracee::resume(tid, 0);
        check_resume(tid, resumed);
        None
    }

    fn seccomp(&mut self, tid: Pid) -> Option<ExecutionResult> {
        let data = ptrace::getevent(tid).map_or(0, |d| d as u64 & SECCOMP_RET_DATA) as u16;
        let decision = Decision::from_trace_data(data);

        if self.phase == Phase::Spawning && tid == self.pid() {
            if decision == Decision::ExecMarker && !self.marker_seen {
                self.marker_seen = true;
                let resumed = tracee::resume(tid, 0);
                check_resume(tid, resumed);
                return None;
            }
            if self.marker_seen {
                // exec failed; the setup code is reporting it
                let resumed = tracee::resume(tid, 0);
                check_resume(tid, resumed);
                return None;
            }
        }

        let (syscall, foreign_arch) = match decision {
            Decision::Violation {
                syscall,
                foreign_arch,
            } => (syscall, foreign_arch),
            _ => (libc::SYS_execveat, false),
        };
        Some(self.violation(tid, syscall, foreign_arch))
    }

    fn violation(&mut self, tid: Pid, syscall: i64, foreign_arch: bool) -> ExecutionResult {
        // The filter only carries the low bits of the number
        let (syscall, foreign_arch) = match tracee::seccomp_stop(tid) {
            Some(stop) => (stop.nr, stop.arch != NATIVE_AUDIT_ARCH || foreign_arch),
            None => (syscall, foreign_arch),
        };
        let name = (!foreign_arch)
            .then(|| syscalls::name(syscall))
            .flatten()
            .map(str::to_string);
        tracing::warn!(
            tid = tid.as_raw(),
            syscall,
            name = name.as_deref().unwrap_or("?"),
            foreign_arch,
            "syscall violation"
        );

        let trace = if self.policy.stacktraces().on_violation {
            stack_trace::capture(&[tid], CAPTURE_BUDGET)
        } else {
            Vec::new()
        };
        self.kill_all();

        ExecutionResult::violation(Violation {
            syscall,
            name,
            foreign_arch,
            tid: tid.as_raw(),
        })
        .with_stack_trace(trace)
    }

    fn signal(&mut self, tid: Pid, sig: i32) {
        if self.phase == Phase::Tracing
            && self.policy.stacktraces().on_signal
            && self.stashed_trace.is_empty()
            && tracee::is_fatal_by_default(sig)
            && !tracee::handles_signal(tid, sig)
        {
            tracing::debug!(tid = tid.as_raw(), sig, "fatal signal");
            self.stashed_trace = stack_trace::capture(&[tid], CAPTURE_BUDGET);
        }
        let resumed = tracee::resume(tid, sig);
        check_resume(tid, resumed);
    }

    fn timeout(&mut self) -> ExecutionResult {
        tracing::warn!(pid = self.pid().as_raw(), "wall-time limit reached");
        let trace = if self.policy.stacktraces().on_timeout {
            let stopped = self.freeze();
            stack_trace::capture(&stopped, CAPTURE_BUDGET)
        } else {
            Vec::new()
        };
        self.kill_all();
        ExecutionResult::new(FinalStatus::Timeout, 0).with_stack_trace(trace)
    }

    fn external_kill(&mut self) -> ExecutionResult {
        tracing::info!(pid = self.pid().as_raw(), "killing sandboxee on request");
        self.kill_all();
        ExecutionResult::new(FinalStatus::ExternalKill, 0)
    }

    /// Interrupt every tracee and collect those that stopped, main pid first
    fn freeze(&mut self) -> Vec<Pid> {
        for &tid in &self.tracees {
            let _ = ptrace::interrupt(tid);
        }

        let deadline = Instant::now() + FREEZE_BUDGET;
        let mut stopped = Vec::new();
        let mut pending: Vec<Pid> = self.tracees.iter().copied().collect();
        while !pending.is_empty() && Instant::now() < deadline {
            pending.retain(|&tid| match tracee::wait_nohang(tid) {
                Ok(None) | Err(Errno::EINTR) => true,
                Ok(Some(status)) => {
                    match tracee::decode(status) {
                        Some(Status::Exited(_) | Status::Signaled(_)) | None => {
                            self.tracees.remove(&tid);
                        }
                        Some(_) => stopped.push(tid),
                    }
                    false
                }
                Err(_) => {
                    self.tracees.remove(&tid);
                    false
                }
            });
            if !pending.is_empty() {
                let _ = self.notifier.wait(Duration::from_millis(10), None);
            }
        }
        if !pending.is_empty() {
            tracing::debug!(unfrozen = pending.len(), "some tracees did not stop in time");
        }

        let main = self.pid();
        stopped.sort_by_key(|&tid| tid != main);
        stopped
    }

    /// SIGKILL every tracee and the sandboxee's process group, then reap
    fn kill_all(&mut self) {
        for &tid in &self.tracees {
            let _ = kill(tid, Signal::SIGKILL);
        }
        let _ = killpg(self.pid(), Signal::SIGKILL);

        let deadline = Instant::now() + REAP_BUDGET;
        while !self.tracees.is_empty() && Instant::now() < deadline {
            let tids: Vec<Pid> = self.tracees.iter().copied().collect();
            for tid in tids {
                loop {
                    match tracee::wait_nohang(tid) {
                        Ok(None) => break,
                        Ok(Some(status)) => match tracee::decode(status) {
                            Some(Status::Exited(_) | Status::Signaled(_)) => {
                                self.tracees.remove(&tid);
                                break;
                            }
                            _ => {
                                let _ = tracee::resume(tid, 0);
                            }
                        },
                        Err(Errno::EINTR) => {}
                        Err(_) => {
                            self.tracees.remove(&tid);
                            break;
                        }
                    }
                }
            }
            if !self.tracees.is_empty() {
                let _ = self.notifier.wait(Duration::from_millis(10), None);
            }
        }
        if !self.tracees.is_empty() {
            tracing::error!(left = self.tracees.len(), "tracees survived SIGKILL");
        }
    }

    /// Check a cooperative sandboxee's comms channel. Losing the channel
    /// before the ack ends the run: the program would run unfiltered.
    fn poll_ack(&mut self) -> Option<ExecutionResult> {
        // Setup failures are reported through the error pipe instead
        if self.phase != Phase::Tracing {
            return None;
        }
        let comms = self.child.comms.as_mut()?;
        match comms.try_recv_ack() {
            Ok(None) => None,
            Ok(Some(ack)) => {
                tracing::info!(
                    all_threads = ack == Ack::AllThreads,
                    "sandboxee installed its policy"
                );
                if let Some(comms) = self.child.comms.take() {
                    self.shared.hand_over_comms(comms);
                }
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "comms channel lost before the policy was installed");
                self.child.comms = None;
                self.kill_all();
                Some(unsandboxed(format!(
                    "sandboxee did not install its policy: {e}"
                )))
            }
        }
    }
}

fn check_resume(tid: Pid, result: Result<(), Errno>) {
    if let Err(e) = tracee::tolerate_gone(result) {
        tracing::debug!(tid = tid.as_raw(), error = %e, "cannot resume tracee");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{AssertUnwindSafe, catch_unwind};

    #[test]
    fn unwinding_monitor_still_stores_a_result() {
        let shared = Shared::new();
        let unwound = catch_unwind(AssertUnwindSafe(|| {
            let _guard = FinishGuard {
                shared: &shared,
                started: Instant::now(),
            };
            panic!("monitor failure");
        }));
        assert!(unwound.is_err());
        assert!(shared.is_finished());
    }

    #[test]
    fn guard_keeps_an_existing_result() {
        let shared = Shared::new();
        {
            let _guard = FinishGuard {
                shared: &shared,
                started: Instant::now(),
            };
            shared.finish(ExecutionResult::new(FinalStatus::Ok, 0));
        }
        assert!(shared.is_finished());
        assert!(!shared.kill_requested());
    }
}
