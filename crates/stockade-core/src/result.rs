//! Execution result types

use crate::stack_trace::Frame;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Terminal classification of a sandboxed run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FinalStatus {
    /// The main process exited on its own
    Ok,
    /// The main process was terminated by a signal it triggered itself
    Signaled,
    /// A syscall outside the policy was attempted
    Violation,
    /// The wall-time limit expired
    Timeout,
    /// The run was cancelled with `Sandbox::kill`
    ExternalKill,
    /// The sandboxee never reached its own code
    SetupError,
}

impl fmt::Display for FinalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ok => "OK",
            Self::Signaled => "SIGNALED",
            Self::Violation => "VIOLATION",
            Self::Timeout => "TIMEOUT",
            Self::ExternalKill => "EXTERNAL_KILL",
            Self::SetupError => "SETUP_ERROR",
        };
        f.write_str(s)
    }
}

/// Details of the syscall that caused a [`FinalStatus::Violation`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    /// Syscall number as seen by the filter
    pub syscall: i64,
    /// Syscall name, when known for the native architecture
    pub name: Option<String>,
    /// The call came from a different audit architecture
    pub foreign_arch: bool,
    /// Thread that issued the call
    pub tid: i32,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.name, self.foreign_arch) {
            (_, true) => write!(f, "foreign-arch syscall {} (tid {})", self.syscall, self.tid),
            (Some(name), false) => write!(f, "{name} [{}] (tid {})", self.syscall, self.tid),
            (None, false) => write!(f, "syscall {} (tid {})", self.syscall, self.tid),
        }
    }
}

/// Outcome of a sandboxed run, produced once by the monitor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    status: FinalStatus,
    reason_code: i64,
    stack_trace: Vec<Frame>,
    violation: Option<Violation>,
    setup_error: Option<String>,
    wall_time: Duration,
}

impl ExecutionResult {
    pub(crate) const fn new(status: FinalStatus, reason_code: i64) -> Self {
        Self {
            status,
            reason_code,
            stack_trace: Vec::new(),
            violation: None,
            setup_error: None,
            wall_time: Duration::ZERO,
        }
    }

    pub(crate) fn setup_error(reason_code: i64, message: impl Into<String>) -> Self {
        Self {
            setup_error: Some(message.into()),
            ..Self::new(FinalStatus::SetupError, reason_code)
        }
    }

    pub(crate) fn violation(violation: Violation) -> Self {
        Self {
            violation: Some(violation.clone()),
            ..Self::new(FinalStatus::Violation, violation.syscall)
        }
    }

    #[must_use]
    pub(crate) fn with_stack_trace(mut self, frames: Vec<Frame>) -> Self {
        self.stack_trace = frames;
        self
    }

    #[must_use]
    pub(crate) const fn with_wall_time(mut self, wall_time: Duration) -> Self {
        self.wall_time = wall_time;
        self
    }

    /// Final status of the run
    #[must_use]
    pub const fn final_status(&self) -> FinalStatus {
        self.status
    }

    /// Exit code, signal number, violating syscall number, errno of a
    /// setup failure, or 0 for timeouts and external kills
    #[must_use]
    pub const fn reason_code(&self) -> i64 {
        self.reason_code
    }

    /// Captured frames, possibly empty
    #[must_use]
    pub fn stack_trace(&self) -> &[Frame] {
        &self.stack_trace
    }

    /// One frame per line
    #[must_use]
    pub fn stack_trace_string(&self) -> String {
        self.stack_trace
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[must_use]
    pub const fn violation_info(&self) -> Option<&Violation> {
        self.violation.as_ref()
    }

    #[must_use]
    pub fn setup_error_message(&self) -> Option<&str> {
        self.setup_error.as_deref()
    }

    #[must_use]
    pub const fn wall_time(&self) -> Duration {
        self.wall_time
    }

    /// Check if the sandboxee exited on its own with code 0
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == FinalStatus::Ok && self.reason_code == 0
    }
}

impl fmt::Display for ExecutionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (reason {})", self.status, self.reason_code)?;
        if let Some(v) = &self.violation {
            write!(f, ": {v}")?;
        }
        if let Some(msg) = &self.setup_error {
            write!(f, ": {msg}")?;
        }
        if !self.stack_trace.is_empty() {
            write!(f, " [{} frames]", self.stack_trace.len())?;
        }
        Ok(())
    }
}
