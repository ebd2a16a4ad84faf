//! JSON policy files
//!
//! ```json
//! {
//!   "default_action": "kill",
//!   "rules": [
//!     { "syscall": "write", "action": "allow",
//!       "conditions": [{ "arg": 0, "op": "eq", "value": 1 }] },
//!     { "syscall": "uname", "action": { "errno": 1 } }
//!   ],
//!   "read_only": ["/usr"],
//!   "libraries_for": ["/usr/bin/true"],
//!   "stacktraces": { "on_timeout": false }
//! }
//! ```

use super::{Action, Condition, DefaultAction, PolicyBuilder, Rule, syscalls};
use crate::isolation::{MountConfig, NamespaceConfig};
use crate::{Policy, Result, StockadeError};
use seccompiler::{SeccompCmpArgLen, SeccompCmpOp, TargetArch};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyFile {
    #[serde(default)]
    pub default_action: Option<DefaultAction>,
    /// Allow everything with no hardening
    #[serde(default)]
    pub danger_allow_all: bool,
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
    #[serde(default)]
    pub read_only: Vec<PathBuf>,
    #[serde(default)]
    pub read_write: Vec<PathBuf>,
    #[serde(default)]
    pub libraries_for: Vec<PathBuf>,
    #[serde(default)]
    pub namespaces: Option<NamespaceConfig>,
    #[serde(default)]
    pub mounts: Option<MountConfig>,
    #[serde(default)]
    pub stacktraces: StackTraceSpec,
}

/// A syscall by name or number
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SyscallRef {
    Number(i64),
    Name(String),
}

impl SyscallRef {
    fn resolve(&self) -> Result<i64> {
        match self {
            Self::Number(nr) => Ok(*nr),
            Self::Name(name) => syscalls::by_name(name)
                .map(|s| s.nr)
                .ok_or_else(|| StockadeError::Config(format!("unknown syscall {name:?}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleSpec {
    pub syscall: SyscallRef,
    pub action: Action,
    #[serde(default)]
    pub conditions: Vec<ConditionSpec>,
    /// `x86_64`, `aarch64` or `riscv64`
    #[serde(default)]
    pub arch: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    MaskedEq,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Width {
    Dword,
    #[default]
    Qword,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConditionSpec {
    pub arg: u8,
    pub op: CmpOp,
    pub value: u64,
    /// Required for `masked_eq`
    #[serde(default)]
    pub mask: Option<u64>,
    #[serde(default)]
    pub width: Width,
}

impl ConditionSpec {
    fn to_condition(&self) -> Result<Condition> {
        let op = match self.op {
            CmpOp::Eq => SeccompCmpOp::Eq,
            CmpOp::Ne => SeccompCmpOp::Ne,
            CmpOp::Gt => SeccompCmpOp::Gt,
            CmpOp::Ge => SeccompCmpOp::Ge,
            CmpOp::Lt => SeccompCmpOp::Lt,
            CmpOp::Le => SeccompCmpOp::Le,
            CmpOp::MaskedEq => SeccompCmpOp::MaskedEq(self.mask.ok_or_else(|| {
                StockadeError::Config("masked_eq condition without a mask".into())
            })?),
        };
        let width = match self.width {
            Width::Dword => SeccompCmpArgLen::Dword,
            Width::Qword => SeccompCmpArgLen::Qword,
        };
        Ok(Condition::new(self.arg, width, op, self.value))
    }
}

/// Overrides for the stack-trace collection defaults
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StackTraceSpec {
    pub on_violation: Option<bool>,
    pub on_timeout: Option<bool>,
    pub on_signal: Option<bool>,
    pub on_exit: Option<bool>,
}

impl PolicyFile {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| StockadeError::Config(format!("{}: {e}", path.display())))?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| StockadeError::Config(format!("policy file: {e}")))
    }

    /// Translate into a builder, resolving syscall names and architectures
    pub fn to_builder(&self) -> Result<PolicyBuilder> {
        let mut builder = PolicyBuilder::new();
        if let Some(action) = self.default_action {
            builder = builder.default_action(action);
        }
        if self.danger_allow_all {
            builder = builder.danger_default_allow_all();
        }

        for spec in &self.rules {
            let mut rule = Rule::new(spec.syscall.resolve()?, spec.action);
            for condition in &spec.conditions {
                rule = rule.with_condition(condition.to_condition()?);
            }
            if let Some(arch) = &spec.arch {
                rule = rule.for_arch(parse_arch(arch)?);
            }
            builder = builder.add_rule(rule);
        }

        for path in &self.read_only {
            builder = builder.allow_read_only(path);
        }
        for path in &self.read_write {
            builder = builder.allow_read_write(path);
        }
        for binary in &self.libraries_for {
            builder = builder.add_libraries_for_binary(binary);
        }
        if let Some(ns) = &self.namespaces {
            builder = builder.namespaces(ns.clone());
        }
        if let Some(mounts) = &self.mounts {
            builder = builder.mounts(mounts.clone());
        }

        let st = self.stacktraces;
        if let Some(v) = st.on_violation {
            builder = builder.collect_stacktraces_on_violation(v);
        }
        if let Some(v) = st.on_timeout {
            builder = builder.collect_stacktraces_on_timeout(v);
        }
        if let Some(v) = st.on_signal {
            builder = builder.collect_stacktraces_on_signal(v);
        }
        if let Some(v) = st.on_exit {
            builder = builder.collect_stacktraces_on_exit(v);
        }
        Ok(builder)
    }

    pub fn build(&self) -> Result<Policy> {
        self.to_builder()?.build()
    }
}

fn parse_arch(name: &str) -> Result<TargetArch> {
    let arch: TargetArch = name
        .try_into()
        .map_err(|e| StockadeError::Config(format!("arch {name:?}: {e:?}")))?;
    Ok(arch)
}
