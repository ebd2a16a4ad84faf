//! # stockade-core
//!
//! Run an untrusted program under a syscall policy and report what happened.
//!
//! This crate provides:
//! - [`PolicyBuilder`] / [`Policy`]: first-match syscall rules compiled to seccomp-BPF
//! - [`Executor`]: program identity, arguments, environment and resource limits
//! - a ptrace monitor that classifies every intercepted event
//! - [`Sandbox`]: synchronous and asynchronous run, kill and wall-time control
//! - [`ExecutionResult`]: final status, reason code and captured stack trace
//! - [`client::Client`]: cooperative entry point for sandboxees that install
//!   the policy themselves

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

#[cfg(not(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64"))))]
compile_error!("stockade supports Linux on x86_64 and aarch64 only");

pub mod client;
pub mod comms;
pub mod error;
pub mod executor;
pub mod isolation;
mod monitor;
pub mod policy;
pub mod result;
pub mod sandbox;
mod spawn;
pub mod stack_trace;

pub use error::StockadeError;
pub use executor::{Executor, Limits};
pub use policy::{Action, Condition, DefaultAction, Policy, PolicyBuilder};
pub use result::{ExecutionResult, FinalStatus};
pub use sandbox::Sandbox;

/// Crate-level result type
pub type Result<T> = std::result::Result<T, StockadeError>;
