//! Common helpers for the end-to-end tests.

use stockade_core::{DefaultAction, Policy, PolicyBuilder};

/// A policy that lets everything through the hardening prologue
pub fn permissive() -> PolicyBuilder {
    Policy::builder().default_action(DefaultAction::AllowAllSyscalls)
}

pub fn build(builder: PolicyBuilder) -> Policy {
    builder.build().expect("policy should compile")
}
