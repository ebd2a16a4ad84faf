//! The caller-facing sandbox
//!
//! A [`Sandbox`] owns one run of one [`Executor`] under one [`Policy`]. The
//! run is supervised by a dedicated monitor thread, so the thread that
//! starts it may exit at any time without affecting the sandboxee.

use crate::comms::Comms;
use crate::monitor;
use crate::result::{ExecutionResult, FinalStatus};
use crate::{Executor, Policy};
use parking_lot::{Condvar, Mutex};
use std::io::Write;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Starting,
    Running,
    Finished,
}

#[derive(Debug)]
struct State {
    phase: Phase,
    result: Option<ExecutionResult>,
    /// Set before the clock starts; zero disables the limit
    walltime_override: Option<Duration>,
    clock_started: bool,
    deadline: Option<Instant>,
    wake: Option<UnixStream>,
    /// Cooperative runs hand the comms channel over once the policy is in
    comms_expected: bool,
    comms: Option<Comms>,
}

/// State shared between a [`Sandbox`] and its monitor thread
#[derive(Debug)]
pub(crate) struct Shared {
    state: Mutex<State>,
    cond: Condvar,
    kill: AtomicBool,
}

impl Shared {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(State {
                phase: Phase::Idle,
                result: None,
                walltime_override: None,
                clock_started: false,
                deadline: None,
                wake: None,
                comms_expected: false,
                comms: None,
            }),
            cond: Condvar::new(),
            kill: AtomicBool::new(false),
        }
    }

    /// Start counting wall time; `limit` is the executor's own limit
    pub(crate) fn start_clock(&self, limit: Option<Duration>) {
        let mut state = self.state.lock();
        let limit = state.walltime_override.or(limit).filter(|d| !d.is_zero());
        state.deadline = limit.and_then(deadline_after);
        state.clock_started = true;
    }

    /// Give the caller the comms channel of a sandboxee that has installed
    /// its policy
    pub(crate) fn hand_over_comms(&self, comms: Comms) {
        self.state.lock().comms = Some(comms);
        self.cond.notify_all();
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.state.lock().result.is_some()
    }

    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.state.lock().deadline
    }

    pub(crate) fn kill_requested(&self) -> bool {
        self.kill.load(Ordering::Acquire)
    }

    /// The sandboxee has exec'd its program
    pub(crate) fn mark_running(&self) {
        let mut state = self.state.lock();
        if state.phase == Phase::Starting {
            state.phase = Phase::Running;
        }
        drop(state);
        self.cond.notify_all();
    }

    /// Store the final result. A pending kill request overrides every
    /// outcome except a setup error.
    pub(crate) fn finish(&self, result: ExecutionResult) {
        let result = if self.kill_requested() && result.final_status() != FinalStatus::SetupError {
            ExecutionResult::new(FinalStatus::ExternalKill, 0).with_wall_time(result.wall_time())
        } else {
            result
        };
        tracing::info!(status = %result.final_status(), reason = result.reason_code(), "sandbox finished");

        let mut state = self.state.lock();
        if state.result.is_none() {
            state.result = Some(result);
        }
        state.phase = Phase::Finished;
        state.wake = None;
        drop(state);
        self.cond.notify_all();
    }

    fn wake(state: &mut State) {
        if let Some(wake) = state.wake.as_mut() {
            // Non-blocking; a full buffer already guarantees a wake-up
            let _ = wake.write(&[1]);
        }
    }
}

/// `now + limit`, or `None` when that is past the end of the clock
fn deadline_after(limit: Duration) -> Option<Instant> {
    Instant::now().checked_add(limit)
}

/// One sandboxed execution
#[derive(Debug)]
pub struct Sandbox {
    executor: Mutex<Option<Executor>>,
    policy: Arc<Policy>,
    shared: Arc<Shared>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl Sandbox {
    #[must_use]
    pub fn new(executor: Executor, policy: Policy) -> Self {
        Self {
            executor: Mutex::new(Some(executor)),
            policy: Arc::new(policy),
            shared: Arc::new(Shared::new()),
            monitor: Mutex::new(None),
        }
    }

    /// Run to completion
    pub fn run(&self) -> ExecutionResult {
        self.run_async();
        self.await_result()
    }

    /// Start the run and return once the sandboxee has exec'd its program
    /// or setup has failed. Returns false on setup failure and on every
    /// call after the first.
    pub fn run_async(&self) -> bool {
        let Some(executor) = self.executor.lock().take() else {
            return false;
        };

        let (wake_rx, wake_tx) = match UnixStream::pair() {
            Ok(pair) => pair,
            Err(e) => {
                self.shared.finish(ExecutionResult::setup_error(
                    e.raw_os_error().map_or(0, i64::from),
                    format!("wake socket: {e}"),
                ));
                return false;
            }
        };
        if let Err(e) = wake_tx.set_nonblocking(true) {
            tracing::warn!(error = %e, "wake socket stays blocking");
        }
        {
            let mut state = self.shared.state.lock();
            state.phase = Phase::Starting;
            state.wake = Some(wake_tx);
            state.comms_expected = !executor.sandbox_before_exec();
        }

        let policy = Arc::clone(&self.policy);
        let shared = Arc::clone(&self.shared);
        let spawned = std::thread::Builder::new()
            .name("stockade-monitor".into())
            .spawn(move || monitor::run(executor, &policy, &shared, wake_rx));
        match spawned {
            Ok(handle) => *self.monitor.lock() = Some(handle),
            Err(e) => {
                self.shared.finish(ExecutionResult::setup_error(
                    e.raw_os_error().map_or(0, i64::from),
                    format!("failed to start monitor thread: {e}"),
                ));
                return false;
            }
        }

        let mut state = self.shared.state.lock();
        while state.phase == Phase::Starting {
            self.shared.cond.wait(&mut state);
        }
        !state
            .result
            .as_ref()
            .is_some_and(|r| r.final_status() == FinalStatus::SetupError)
    }

    /// Block until the run finishes. Starts the run if needed. Every call
    /// returns the same result.
    pub fn await_result(&self) -> ExecutionResult {
        if self.shared.state.lock().phase == Phase::Idle {
            self.run_async();
        }
        let result = {
            let mut state = self.shared.state.lock();
            loop {
                if let Some(result) = &state.result {
                    break result.clone();
                }
                self.shared.cond.wait(&mut state);
            }
        };
        self.join_monitor();
        result
    }

    /// Like [`Self::await_result`], but gives up after `timeout`
    pub fn await_result_timeout(&self, timeout: Duration) -> Option<ExecutionResult> {
        let Some(deadline) = deadline_after(timeout) else {
            return Some(self.await_result());
        };
        let result = {
            let mut state = self.shared.state.lock();
            loop {
                if let Some(result) = &state.result {
                    break result.clone();
                }
                if self.shared.cond.wait_until(&mut state, deadline).timed_out() {
                    return state.result.clone();
                }
            }
        };
        self.join_monitor();
        Some(result)
    }

    /// The result if the run has finished
    #[must_use]
    pub fn try_result(&self) -> Option<ExecutionResult> {
        self.shared.state.lock().result.clone()
    }

    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.shared.state.lock().phase == Phase::Finished
    }

    /// Set the wall-time limit. Before the run starts this replaces the
    /// executor's limit; afterwards the deadline becomes now + `limit`.
    /// Zero disables the limit.
    pub fn set_walltime_limit(&self, limit: Duration) {
        let mut state = self.shared.state.lock();
        if state.clock_started {
            state.deadline = if limit.is_zero() {
                None
            } else {
                deadline_after(limit)
            };
            Shared::wake(&mut state);
        } else {
            state.walltime_override = Some(limit);
        }
    }

    /// Take the caller's end of the comms channel of a cooperative run.
    ///
    /// Blocks until the sandboxee has installed its policy, so nothing sent
    /// here reaches unfiltered code. Returns `None` for runs that sandbox
    /// before exec, for runs that end first, and on every call after the
    /// one that returned the channel.
    pub fn take_comms(&self) -> Option<Comms> {
        let mut state = self.shared.state.lock();
        loop {
            if let Some(comms) = state.comms.take() {
                state.comms_expected = false;
                return Some(comms);
            }
            if !state.comms_expected || state.result.is_some() || state.phase == Phase::Idle {
                return None;
            }
            self.shared.cond.wait(&mut state);
        }
    }

    /// Request termination. Non-blocking and idempotent.
    pub fn kill(&self) {
        let mut state = self.shared.state.lock();
        if state.phase == Phase::Finished {
            return;
        }
        self.shared.kill.store(true, Ordering::Release);
        Shared::wake(&mut state);
    }

    #[must_use]
    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    fn join_monitor(&self) {
        let handle = self.monitor.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("monitor thread panicked");
            }
        }
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        if self.monitor.lock().is_some() {
            self.kill();
            self.join_monitor();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DefaultAction;

    fn policy() -> Policy {
        Policy::builder()
            .default_action(DefaultAction::AllowAllSyscalls)
            .build()
            .unwrap()
    }

    #[test]
    fn second_start_is_refused() {
        let sandbox = Sandbox::new(Executor::new("/nonexistent/binary", ["x"]), policy());
        assert!(!sandbox.run_async());
        assert!(!sandbox.run_async());
        assert_eq!(
            sandbox.await_result().final_status(),
            FinalStatus::SetupError
        );
    }

    #[test]
    fn results_are_stable() {
        let sandbox = Sandbox::new(Executor::new("/nonexistent/binary", ["x"]), policy());
        let first = sandbox.await_result();
        assert_eq!(sandbox.await_result(), first);
        assert_eq!(sandbox.try_result(), Some(first));
        assert!(sandbox.is_terminated());
    }

    #[test]
    fn kill_does_not_override_setup_error() {
        let shared = Shared::new();
        shared.kill.store(true, Ordering::Release);
        shared.finish(ExecutionResult::setup_error(2, "boom"));
        let state = shared.state.lock();
        assert_eq!(
            state.result.as_ref().map(ExecutionResult::final_status),
            Some(FinalStatus::SetupError)
        );
    }

    #[test]
    fn kill_overrides_other_outcomes() {
        let shared = Shared::new();
        shared.kill.store(true, Ordering::Release);
        shared.finish(ExecutionResult::new(FinalStatus::Timeout, 0));
        let result = shared.state.lock().result.clone().unwrap();
        assert_eq!(result.final_status(), FinalStatus::ExternalKill);
        assert!(result.stack_trace().is_empty());
    }

    #[test]
    fn walltime_override_applies_at_start() {
        let shared = Shared::new();
        shared.state.lock().walltime_override = Some(Duration::ZERO);
        shared.start_clock(Some(Duration::from_secs(1)));
        assert_eq!(shared.deadline(), None);

        let shared = Shared::new();
        shared.start_clock(Some(Duration::from_secs(60)));
        assert!(shared.deadline().is_some());
    }

    #[test]
    fn huge_walltime_means_no_deadline() {
        let shared = Shared::new();
        shared.start_clock(Some(Duration::MAX));
        assert_eq!(shared.deadline(), None);
        assert!(shared.state.lock().clock_started);
    }

    #[test]
    fn huge_walltime_after_start_clears_the_deadline() {
        let sandbox = Sandbox::new(Executor::new("/bin/true", ["true"]), policy());
        sandbox.shared.start_clock(Some(Duration::from_secs(1)));
        assert!(sandbox.shared.deadline().is_some());
        sandbox.set_walltime_limit(Duration::MAX);
        assert_eq!(sandbox.shared.deadline(), None);
    }

    #[test]
    fn huge_walltime_before_start_runs_to_a_result() {
        let sandbox = Sandbox::new(Executor::new("/nonexistent/binary", ["x"]), policy());
        sandbox.set_walltime_limit(Duration::MAX);
        assert!(!sandbox.run_async());
        let result = sandbox.await_result_timeout(Duration::from_secs(10));
        assert_eq!(
            result.as_ref().map(ExecutionResult::final_status),
            Some(FinalStatus::SetupError)
        );
        assert!(sandbox.await_result_timeout(Duration::MAX).is_some());
    }

    #[test]
    fn comms_is_handed_over_once() {
        let sandbox = Sandbox::new(Executor::new("/bin/true", ["true"]), policy());
        {
            let mut state = sandbox.shared.state.lock();
            state.phase = Phase::Running;
            state.comms_expected = true;
        }
        let (ours, _theirs) = UnixStream::pair().unwrap();
        sandbox.shared.hand_over_comms(Comms::new(ours));
        assert!(sandbox.take_comms().is_some());
        assert!(sandbox.take_comms().is_none());
    }

    #[test]
    fn take_comms_wakes_when_the_run_ends() {
        let sandbox = Arc::new(Sandbox::new(
            Executor::new("/bin/true", ["true"]),
            policy(),
        ));
        {
            let mut state = sandbox.shared.state.lock();
            state.phase = Phase::Running;
            state.comms_expected = true;
        }
        let waiter = {
            let sandbox = Arc::clone(&sandbox);
            std::thread::spawn(move || sandbox.take_comms().is_none())
        };
        std::thread::sleep(Duration::from_millis(50));
        sandbox.shared.finish(ExecutionResult::new(FinalStatus::Ok, 0));
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn sandbox_before_exec_has_no_comms() {
        let sandbox = Sandbox::new(Executor::new("/nonexistent/binary", ["x"]), policy());
        assert!(sandbox.take_comms().is_none());
        assert!(!sandbox.run_async());
        assert!(sandbox.take_comms().is_none());
    }

    #[test]
    fn unstarted_sandbox_has_no_result() {
        let sandbox = Sandbox::new(Executor::new("/bin/true", ["true"]), policy());
        assert!(sandbox.try_result().is_none());
        assert!(!sandbox.is_terminated());
    }
}
