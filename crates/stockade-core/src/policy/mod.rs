//! Syscall policies and their seccomp-BPF compilation.
//!
//! A [`Policy`] is an ordered list of [`Rule`]s plus one [`DefaultAction`].
//! Rules are matched in insertion order and the first match decides. The
//! compiled program always:
//!
//! 1. routes syscalls from a foreign audit architecture (and x32 on x86_64)
//!    to a violation
//! 2. recognizes the framework's own initial `execveat` and hands it to the
//!    monitor
//! 3. applies the hardening prologue: `ptrace`, `bpf`, `kexec_*`, module
//!    loading and `reboot` are violations, `clone` with `CLONE_UNTRACED`
//!    is a violation and `clone3` fails with `ENOSYS`
//! 4. evaluates user rules, then the default action
//!
//! [`PolicyBuilder::danger_default_allow_all`] skips all of the above and
//! compiles to a bare `RET ALLOW`.
//!
//! Violations are compiled to `SECCOMP_RET_TRACE` carrying a tag and the
//! syscall number, so the tracing monitor can freeze the thread and capture
//! a stack trace before it kills the process.

pub mod bpf;
pub mod config;
pub mod libraries;
pub mod syscalls;

use crate::isolation::{LandlockConfig, MountConfig, NamespaceConfig};
use crate::{Result, StockadeError};
use bpf::{Assembler, JumpOp, SockFilter, Target};
use seccompiler::{SeccompCmpArgLen, SeccompCmpOp, TargetArch};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[cfg(target_arch = "x86_64")]
pub const NATIVE_AUDIT_ARCH: u32 = 0xc000_003e;
#[cfg(target_arch = "aarch64")]
pub const NATIVE_AUDIT_ARCH: u32 = 0xc000_00b7;

// seccomp_data layout
const OFF_NR: u32 = 0;
const OFF_ARCH: u32 = 4;

const fn arg_lo(arg: u8) -> u32 {
    16 + 8 * arg as u32
}

const fn arg_hi(arg: u8) -> u32 {
    arg_lo(arg) + 4
}

pub(crate) const SECCOMP_RET_TRAP: u32 = 0x0003_0000;
pub(crate) const SECCOMP_RET_ERRNO: u32 = 0x0005_0000;
pub(crate) const SECCOMP_RET_TRACE: u32 = 0x7ff0_0000;
pub(crate) const SECCOMP_RET_LOG: u32 = 0x7ffc_0000;
pub(crate) const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;
const SECCOMP_RET_ACTION_FULL: u32 = 0xffff_0000;
const SECCOMP_RET_DATA: u32 = 0x0000_ffff;

// SECCOMP_RET_TRACE data: 4-bit tag, 12-bit syscall number
const TRACE_TAG_MASK: u16 = 0xf000;
const TRACE_NR_MASK: u16 = 0x0fff;
const TAG_VIOLATION: u16 = 0x1000;
const TAG_FOREIGN: u16 = 0x2000;
const TAG_EXEC: u16 = 0x3000;

/// Value passed in the otherwise unused sixth argument of the framework's
/// own `execveat`
pub const EXECVEAT_MAGIC: u64 = 0x5354_4b44_0000_e7ec;

#[cfg(target_arch = "x86_64")]
const X32_SYSCALL_BIT: u32 = 0x4000_0000;
const CLONE_UNTRACED: u32 = 0x0080_0000;
const AT_EMPTY_PATH: u64 = 0x1000;
const MAX_ERRNO: u16 = 4095;

/// Always violations unless the policy is danger-allow-all
const HARDENED: &[libc::c_long] = &[
    libc::SYS_ptrace,
    libc::SYS_bpf,
    libc::SYS_kexec_load,
    libc::SYS_kexec_file_load,
    libc::SYS_init_module,
    libc::SYS_finit_module,
    libc::SYS_delete_module,
    libc::SYS_reboot,
];

/// What happens when a rule matches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Allow,
    /// Fail the call with this errno without executing it
    Errno(u16),
    /// Terminate the sandboxee and report a violation
    Kill,
    /// Deliver `SIGSYS`
    Trap,
    /// Allow and record in the audit log
    Log,
}

impl Action {
    fn seccomp_ret(self, syscall: i64) -> u32 {
        match self {
            Self::Allow => SECCOMP_RET_ALLOW,
            Self::Errno(e) => SECCOMP_RET_ERRNO | u32::from(e),
            Self::Kill => violation_ret(syscall),
            Self::Trap => SECCOMP_RET_TRAP,
            Self::Log => SECCOMP_RET_LOG,
        }
    }
}

/// Action taken when no rule matches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultAction {
    Kill,
    Errno(u16),
    Trap,
    Log,
    /// Allow anything not matched by a rule. The hardening prologue still applies.
    AllowAllSyscalls,
}

/// Comparison against one syscall argument
#[derive(Debug, Clone)]
pub struct Condition {
    pub arg: u8,
    pub width: SeccompCmpArgLen,
    pub op: SeccompCmpOp,
    pub value: u64,
}

impl Condition {
    #[must_use]
    pub const fn new(arg: u8, width: SeccompCmpArgLen, op: SeccompCmpOp, value: u64) -> Self {
        Self {
            arg,
            width,
            op,
            value,
        }
    }

    /// 64-bit equality, the common case
    #[must_use]
    pub const fn eq(arg: u8, value: u64) -> Self {
        Self::new(arg, SeccompCmpArgLen::Qword, SeccompCmpOp::Eq, value)
    }

    /// Whether `args` satisfy this condition
    #[must_use]
    pub fn matches(&self, args: &[u64; 6]) -> bool {
        let Some(&raw) = args.get(usize::from(self.arg)) else {
            return false;
        };
        let (arg, value, narrow) = match self.width {
            SeccompCmpArgLen::Dword => (raw & 0xffff_ffff, self.value & 0xffff_ffff, true),
            SeccompCmpArgLen::Qword => (raw, self.value, false),
        };
        match &self.op {
            SeccompCmpOp::Eq => arg == value,
            SeccompCmpOp::Ne => arg != value,
            SeccompCmpOp::Gt => arg > value,
            SeccompCmpOp::Ge => arg >= value,
            SeccompCmpOp::Lt => arg < value,
            SeccompCmpOp::Le => arg <= value,
            SeccompCmpOp::MaskedEq(mask) => {
                let mask = if narrow { mask & 0xffff_ffff } else { *mask };
                arg & mask == value
            }
        }
    }

    fn validate(&self, syscall: i64, check_arity: bool) -> Result<()> {
        if self.arg >= 6 {
            return Err(StockadeError::Policy(format!(
                "syscall {syscall}: argument index {} out of range",
                self.arg
            )));
        }
        if check_arity {
            if let Some(arity) = syscalls::arity(syscall) {
                if self.arg >= arity {
                    return Err(StockadeError::Policy(format!(
                        "syscall {} takes {arity} arguments, condition on argument {}",
                        syscalls::name(syscall).unwrap_or("?"),
                        self.arg
                    )));
                }
            }
        }
        if matches!(self.width, SeccompCmpArgLen::Dword) {
            let mask_too_wide =
                matches!(self.op, SeccompCmpOp::MaskedEq(m) if m > u64::from(u32::MAX));
            if self.value > u64::from(u32::MAX) || mask_too_wide {
                return Err(StockadeError::Policy(format!(
                    "syscall {syscall}: 32-bit condition with 64-bit operand {:#x}",
                    self.value
                )));
            }
        }
        Ok(())
    }

    fn emit(&self, asm: &mut Assembler, fail: bpf::Label) {
        let (lo, hi) = (arg_lo(self.arg), arg_hi(self.arg));
        let v_lo = (self.value & 0xffff_ffff) as u32;
        let v_hi = (self.value >> 32) as u32;
        let fail = Target::To(fail);

        if matches!(self.width, SeccompCmpArgLen::Dword) {
            asm.load(lo);
            match &self.op {
                SeccompCmpOp::Eq => asm.jump(JumpOp::Eq, v_lo, Target::Next, fail),
                SeccompCmpOp::Ne => asm.jump(JumpOp::Eq, v_lo, fail, Target::Next),
                SeccompCmpOp::Gt => asm.jump(JumpOp::Gt, v_lo, Target::Next, fail),
                SeccompCmpOp::Ge => asm.jump(JumpOp::Ge, v_lo, Target::Next, fail),
                SeccompCmpOp::Lt => asm.jump(JumpOp::Ge, v_lo, fail, Target::Next),
                SeccompCmpOp::Le => asm.jump(JumpOp::Gt, v_lo, fail, Target::Next),
                SeccompCmpOp::MaskedEq(mask) => {
                    asm.and((mask & 0xffff_ffff) as u32);
                    asm.jump(JumpOp::Eq, v_lo, Target::Next, fail);
                }
            }
            return;
        }

        let ok = asm.label();
        let pass = Target::To(ok);
        asm.load(hi);
        match &self.op {
            SeccompCmpOp::Eq => {
                asm.jump(JumpOp::Eq, v_hi, Target::Next, fail);
                asm.load(lo);
                asm.jump(JumpOp::Eq, v_lo, Target::Next, fail);
            }
            SeccompCmpOp::Ne => {
                asm.jump(JumpOp::Eq, v_hi, Target::Next, pass);
                asm.load(lo);
                asm.jump(JumpOp::Eq, v_lo, fail, Target::Next);
            }
            SeccompCmpOp::Gt | SeccompCmpOp::Ge => {
                asm.jump(JumpOp::Gt, v_hi, pass, Target::Next);
                asm.jump(JumpOp::Eq, v_hi, Target::Next, fail);
                asm.load(lo);
                let op = if matches!(self.op, SeccompCmpOp::Gt) {
                    JumpOp::Gt
                } else {
                    JumpOp::Ge
                };
                asm.jump(op, v_lo, Target::Next, fail);
            }
            SeccompCmpOp::Lt | SeccompCmpOp::Le => {
                asm.jump(JumpOp::Gt, v_hi, fail, Target::Next);
                asm.jump(JumpOp::Eq, v_hi, Target::Next, pass);
                asm.load(lo);
                let op = if matches!(self.op, SeccompCmpOp::Lt) {
                    JumpOp::Ge
                } else {
                    JumpOp::Gt
                };
                asm.jump(op, v_lo, fail, Target::Next);
            }
            SeccompCmpOp::MaskedEq(mask) => {
                asm.and((mask >> 32) as u32);
                asm.jump(JumpOp::Eq, v_hi, Target::Next, fail);
                asm.load(lo);
                asm.and((mask & 0xffff_ffff) as u32);
                asm.jump(JumpOp::Eq, v_lo, Target::Next, fail);
            }
        }
        asm.bind(ok);
    }
}

/// A syscall rule. All conditions must hold for the rule to match.
#[derive(Debug, Clone)]
pub struct Rule {
    pub syscall: i64,
    pub conditions: Vec<Condition>,
    pub action: Action,
    /// Restrict the rule to one architecture. Rules for other
    /// architectures are not compiled into the native program.
    pub arch: Option<TargetArch>,
}

impl Rule {
    #[must_use]
    pub const fn new(syscall: i64, action: Action) -> Self {
        Self {
            syscall,
            conditions: Vec::new(),
            action,
            arch: None,
        }
    }

    #[must_use]
    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    #[must_use]
    pub const fn for_arch(mut self, arch: TargetArch) -> Self {
        self.arch = Some(arch);
        self
    }

    fn is_native(&self) -> bool {
        self.arch.as_ref().is_none_or(is_native_arch)
    }

    fn matches(&self, nr: i64, args: &[u64; 6]) -> bool {
        self.syscall == nr && self.conditions.iter().all(|c| c.matches(args))
    }
}

fn is_native_arch(arch: &TargetArch) -> bool {
    #[cfg(target_arch = "x86_64")]
    return matches!(arch, TargetArch::x86_64);
    #[cfg(target_arch = "aarch64")]
    return matches!(arch, TargetArch::aarch64);
}

#[cfg(target_arch = "x86_64")]
const fn is_x32(nr: i32) -> bool {
    nr as u32 >= X32_SYSCALL_BIT
}

#[cfg(target_arch = "aarch64")]
const fn is_x32(_nr: i32) -> bool {
    false
}

const fn violation_ret(syscall: i64) -> u32 {
    SECCOMP_RET_TRACE | TAG_VIOLATION as u32 | (syscall as u32 & TRACE_NR_MASK as u32)
}

/// The contents of `struct seccomp_data`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyscallData {
    pub nr: i32,
    pub arch: u32,
    pub instruction_pointer: u64,
    pub args: [u64; 6],
}

impl SyscallData {
    /// A call on the native architecture
    #[must_use]
    pub fn native(nr: i64, args: [u64; 6]) -> Self {
        Self {
            nr: nr as i32,
            arch: NATIVE_AUDIT_ARCH,
            instruction_pointer: 0,
            args,
        }
    }

    /// Serialize in kernel layout
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 64] {
        let mut out = [0u8; 64];
        out[0..4].copy_from_slice(&self.nr.to_le_bytes());
        out[4..8].copy_from_slice(&self.arch.to_le_bytes());
        out[8..16].copy_from_slice(&self.instruction_pointer.to_le_bytes());
        for (i, arg) in self.args.iter().enumerate() {
            out[16 + 8 * i..24 + 8 * i].copy_from_slice(&arg.to_le_bytes());
        }
        out
    }
}

/// Outcome of evaluating one syscall against a policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Errno(u16),
    Trap,
    Log,
    Violation { syscall: i64, foreign_arch: bool },
    /// The framework's own initial `execveat`
    ExecMarker,
}

impl Decision {
    /// Decode a filter return value
    #[must_use]
    pub fn from_seccomp_ret(ret: u32) -> Option<Self> {
        let data = (ret & SECCOMP_RET_DATA) as u16;
        match ret & SECCOMP_RET_ACTION_FULL {
            SECCOMP_RET_ALLOW => Some(Self::Allow),
            SECCOMP_RET_ERRNO => Some(Self::Errno(data)),
            SECCOMP_RET_TRAP => Some(Self::Trap),
            SECCOMP_RET_LOG => Some(Self::Log),
            SECCOMP_RET_TRACE => Some(Self::from_trace_data(data)),
            _ => None,
        }
    }

    /// Decode the data of a `PTRACE_EVENT_SECCOMP` stop. Unknown tags are violations.
    #[must_use]
    pub fn from_trace_data(data: u16) -> Self {
        let syscall = i64::from(data & TRACE_NR_MASK);
        match data & TRACE_TAG_MASK {
            TAG_EXEC => Self::ExecMarker,
            TAG_FOREIGN => Self::Violation {
                syscall,
                foreign_arch: true,
            },
            _ => Self::Violation {
                syscall,
                foreign_arch: false,
            },
        }
    }
}

/// Which terminations capture a stack trace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackTraceConfig {
    pub on_violation: bool,
    pub on_timeout: bool,
    pub on_signal: bool,
    pub on_exit: bool,
}

impl Default for StackTraceConfig {
    fn default() -> Self {
        Self {
            on_violation: true,
            on_timeout: true,
            on_signal: false,
            on_exit: false,
        }
    }
}

/// A validated, compiled policy. Immutable once built.
#[derive(Debug, Clone)]
pub struct Policy {
    rules: Vec<Rule>,
    default_action: Option<DefaultAction>,
    danger_allow_all: bool,
    program: Vec<SockFilter>,
    landlock: LandlockConfig,
    namespaces: Option<NamespaceConfig>,
    mounts: Option<MountConfig>,
    stacktraces: StackTraceConfig,
}

impl Policy {
    #[must_use]
    pub fn builder() -> PolicyBuilder {
        PolicyBuilder::new()
    }

    /// The compiled filter program
    #[must_use]
    pub fn program(&self) -> &[SockFilter] {
        &self.program
    }

    #[must_use]
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// `None` only for danger-allow-all policies
    #[must_use]
    pub const fn default_action(&self) -> Option<DefaultAction> {
        self.default_action
    }

    /// True when the policy allows every syscall with no hardening at all
    #[must_use]
    pub const fn is_danger_allow_all(&self) -> bool {
        self.danger_allow_all
    }

    #[must_use]
    pub const fn landlock(&self) -> &LandlockConfig {
        &self.landlock
    }

    #[must_use]
    pub const fn namespaces(&self) -> Option<&NamespaceConfig> {
        self.namespaces.as_ref()
    }

    #[must_use]
    pub const fn mounts(&self) -> Option<&MountConfig> {
        self.mounts.as_ref()
    }

    #[must_use]
    pub const fn stacktraces(&self) -> StackTraceConfig {
        self.stacktraces
    }

    /// Decide a syscall the way the compiled program does
    #[must_use]
    pub fn evaluate(&self, data: &SyscallData) -> Decision {
        if self.danger_allow_all {
            return Decision::Allow;
        }

        let masked = i64::from(data.nr as u32 & u32::from(TRACE_NR_MASK));
        let foreign = Decision::Violation {
            syscall: masked,
            foreign_arch: true,
        };
        if data.arch != NATIVE_AUDIT_ARCH || is_x32(data.nr) {
            return foreign;
        }

        let nr = i64::from(data.nr);
        let args = &data.args;
        if nr == libc::SYS_execveat && args[4] == AT_EMPTY_PATH && args[5] == EXECVEAT_MAGIC {
            return Decision::ExecMarker;
        }

        let violation = Decision::Violation {
            syscall: masked,
            foreign_arch: false,
        };
        if HARDENED.contains(&nr) {
            return violation;
        }
        if nr == libc::SYS_clone && args[0] as u32 & CLONE_UNTRACED != 0 {
            return violation;
        }
        if nr == libc::SYS_clone3 {
            return Decision::Errno(libc::ENOSYS as u16);
        }

        if let Some(rule) = self
            .rules
            .iter()
            .filter(|r| r.is_native())
            .find(|r| r.matches(nr, args))
        {
            return match rule.action {
                Action::Allow => Decision::Allow,
                Action::Errno(e) => Decision::Errno(e),
                Action::Kill => violation,
                Action::Trap => Decision::Trap,
                Action::Log => Decision::Log,
            };
        }

        match self.default_action {
            Some(DefaultAction::Kill) => violation,
            Some(DefaultAction::Errno(e)) => Decision::Errno(e),
            Some(DefaultAction::Trap) => Decision::Trap,
            Some(DefaultAction::Log) => Decision::Log,
            Some(DefaultAction::AllowAllSyscalls) | None => Decision::Allow,
        }
    }

    fn compile(&self) -> Result<Vec<SockFilter>> {
        let mut asm = Assembler::new();
        if self.danger_allow_all {
            asm.ret(SECCOMP_RET_ALLOW);
            return asm.finish();
        }

        let foreign = asm.label();
        let body = asm.label();
        asm.load(OFF_ARCH);
        asm.jump(JumpOp::Eq, NATIVE_AUDIT_ARCH, Target::Next, Target::To(foreign));
        asm.load(OFF_NR);
        #[cfg(target_arch = "x86_64")]
        asm.jump(JumpOp::Ge, X32_SYSCALL_BIT, Target::To(foreign), Target::Next);
        asm.ja(body);
        asm.bind(foreign);
        asm.load(OFF_NR);
        emit_dynamic_violation(&mut asm, TAG_FOREIGN);
        asm.bind(body);

        emit_exec_marker(&mut asm);
        emit_hardening(&mut asm);

        // A holds the syscall number until a condition clobbers it
        let mut a_is_nr = true;
        for rule in self.rules.iter().filter(|r| r.is_native()) {
            if !a_is_nr {
                asm.load(OFF_NR);
            }
            let next = asm.label();
            asm.jump(
                JumpOp::Eq,
                rule.syscall as u32,
                Target::Next,
                Target::To(next),
            );
            for condition in &rule.conditions {
                condition.emit(&mut asm, next);
            }
            asm.ret(rule.action.seccomp_ret(rule.syscall));
            asm.bind(next);
            a_is_nr = rule.conditions.is_empty();
        }

        match self.default_action {
            Some(DefaultAction::Kill) => {
                if !a_is_nr {
                    asm.load(OFF_NR);
                }
                emit_dynamic_violation(&mut asm, TAG_VIOLATION);
            }
            Some(DefaultAction::Errno(e)) => asm.ret(SECCOMP_RET_ERRNO | u32::from(e)),
            Some(DefaultAction::Trap) => asm.ret(SECCOMP_RET_TRAP),
            Some(DefaultAction::Log) => asm.ret(SECCOMP_RET_LOG),
            Some(DefaultAction::AllowAllSyscalls) | None => asm.ret(SECCOMP_RET_ALLOW),
        }

        asm.finish()
    }
}

/// Expects the syscall number in A
fn emit_dynamic_violation(asm: &mut Assembler, tag: u16) {
    asm.and(u32::from(TRACE_NR_MASK));
    asm.or(SECCOMP_RET_TRACE | u32::from(tag));
    asm.ret_a();
}

fn emit_exec_marker(asm: &mut Assembler) {
    let after = asm.label();
    let reload = asm.label();
    let miss = Target::To(reload);
    asm.jump(
        JumpOp::Eq,
        libc::SYS_execveat as u32,
        Target::Next,
        Target::To(after),
    );
    asm.load(arg_lo(4));
    asm.jump(JumpOp::Eq, AT_EMPTY_PATH as u32, Target::Next, miss);
    asm.load(arg_hi(4));
    asm.jump(JumpOp::Eq, 0, Target::Next, miss);
    asm.load(arg_lo(5));
    asm.jump(JumpOp::Eq, (EXECVEAT_MAGIC & 0xffff_ffff) as u32, Target::Next, miss);
    asm.load(arg_hi(5));
    asm.jump(JumpOp::Eq, (EXECVEAT_MAGIC >> 32) as u32, Target::Next, miss);
    asm.ret(SECCOMP_RET_TRACE | u32::from(TAG_EXEC));
    asm.bind(reload);
    asm.load(OFF_NR);
    asm.bind(after);
}

fn emit_hardening(asm: &mut Assembler) {
    for &nr in HARDENED {
        let skip = asm.label();
        asm.jump(JumpOp::Eq, nr as u32, Target::Next, Target::To(skip));
        asm.ret(violation_ret(nr));
        asm.bind(skip);
    }

    let done = asm.label();
    let reload = asm.label();
    asm.jump(
        JumpOp::Eq,
        libc::SYS_clone as u32,
        Target::Next,
        Target::To(done),
    );
    asm.load(arg_lo(0));
    asm.jump(JumpOp::Set, CLONE_UNTRACED, Target::Next, Target::To(reload));
    asm.ret(violation_ret(libc::SYS_clone));
    asm.bind(reload);
    asm.load(OFF_NR);
    asm.bind(done);

    let skip = asm.label();
    asm.jump(
        JumpOp::Eq,
        libc::SYS_clone3 as u32,
        Target::Next,
        Target::To(skip),
    );
    asm.ret(SECCOMP_RET_ERRNO | libc::ENOSYS as u32);
    asm.bind(skip);
}

/// Accumulates rules and restrictions, validated and compiled by [`build`](Self::build)
#[derive(Debug, Clone, Default)]
pub struct PolicyBuilder {
    rules: Vec<Rule>,
    default_action: Option<DefaultAction>,
    danger_allow_all: bool,
    landlock: LandlockConfig,
    namespaces: Option<NamespaceConfig>,
    mounts: Option<MountConfig>,
    stacktraces: StackTraceConfig,
}

impl PolicyBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn add_rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    #[must_use]
    pub fn allow_syscall(self, nr: i64) -> Self {
        self.add_rule(Rule::new(nr, Action::Allow))
    }

    #[must_use]
    pub fn allow_syscalls(self, nrs: &[i64]) -> Self {
        nrs.iter().fold(self, |b, &nr| b.allow_syscall(nr))
    }

    /// Allow `nr` only when every condition holds
    #[must_use]
    pub fn allow_syscall_if(self, nr: i64, conditions: Vec<Condition>) -> Self {
        self.add_rule(Rule {
            conditions,
            ..Rule::new(nr, Action::Allow)
        })
    }

    /// Fail `nr` with `errno` without executing it
    #[must_use]
    pub fn block_syscall_with_errno(self, nr: i64, errno: i32) -> Self {
        let errno = u16::try_from(errno).unwrap_or(u16::MAX);
        self.add_rule(Rule::new(nr, Action::Errno(errno)))
    }

    /// Treat `nr` as a violation even if the default would allow it
    #[must_use]
    pub fn deny_syscall(self, nr: i64) -> Self {
        self.add_rule(Rule::new(nr, Action::Kill))
    }

    #[must_use]
    pub fn trap_syscall(self, nr: i64) -> Self {
        self.add_rule(Rule::new(nr, Action::Trap))
    }

    #[must_use]
    pub fn log_syscall(self, nr: i64) -> Self {
        self.add_rule(Rule::new(nr, Action::Log))
    }

    /// `exit` and `exit_group`
    #[must_use]
    pub fn allow_exit(self) -> Self {
        self.allow_syscalls(&[libc::SYS_exit, libc::SYS_exit_group])
    }

    #[must_use]
    pub const fn default_action(mut self, action: DefaultAction) -> Self {
        self.default_action = Some(action);
        self
    }

    /// Allow every syscall, including the ones the hardening prologue
    /// forbids. For non-security test scenarios only.
    #[must_use]
    pub const fn danger_default_allow_all(mut self) -> Self {
        self.danger_allow_all = true;
        self
    }

    /// Allow reading and executing beneath `path`
    #[must_use]
    pub fn allow_read_only(mut self, path: impl Into<PathBuf>) -> Self {
        self.landlock = self.landlock.ro(path);
        self
    }

    /// Allow full access beneath `path`
    #[must_use]
    pub fn allow_read_write(mut self, path: impl Into<PathBuf>) -> Self {
        self.landlock = self.landlock.rw(path);
        self
    }

    /// Allow read-only access to the directories holding `binary`, its
    /// interpreter and its shared-library closure. Best effort.
    #[must_use]
    pub fn add_libraries_for_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        let binary = binary.into();
        match libraries::library_dirs(&binary) {
            Ok(dirs) => {
                tracing::debug!(binary = %binary.display(), dirs = dirs.len(), "resolved library closure");
                for dir in dirs {
                    self.landlock = self.landlock.ro(dir);
                }
            }
            Err(e) => {
                tracing::warn!(binary = %binary.display(), "library closure unavailable: {e}");
            }
        }
        self
    }

    #[must_use]
    pub const fn namespaces(mut self, config: NamespaceConfig) -> Self {
        self.namespaces = Some(config);
        self
    }

    #[must_use]
    pub fn mounts(mut self, config: MountConfig) -> Self {
        self.mounts = Some(config);
        self
    }

    #[must_use]
    pub const fn collect_stacktraces_on_violation(mut self, enable: bool) -> Self {
        self.stacktraces.on_violation = enable;
        self
    }

    #[must_use]
    pub const fn collect_stacktraces_on_timeout(mut self, enable: bool) -> Self {
        self.stacktraces.on_timeout = enable;
        self
    }

    #[must_use]
    pub const fn collect_stacktraces_on_signal(mut self, enable: bool) -> Self {
        self.stacktraces.on_signal = enable;
        self
    }

    #[must_use]
    pub const fn collect_stacktraces_on_exit(mut self, enable: bool) -> Self {
        self.stacktraces.on_exit = enable;
        self
    }

    /// Validate and compile
    pub fn build(self) -> Result<Policy> {
        if self.default_action.is_none() && !self.danger_allow_all {
            return Err(StockadeError::Policy(
                "no default action set and allow-all not requested".into(),
            ));
        }
        if let Some(DefaultAction::Errno(e)) = self.default_action {
            validate_errno(e)?;
        }

        for rule in &self.rules {
            if !(0..=i64::from(u32::MAX)).contains(&rule.syscall) {
                return Err(StockadeError::Policy(format!(
                    "invalid syscall number {}",
                    rule.syscall
                )));
            }
            if let Action::Errno(e) = rule.action {
                validate_errno(e)?;
            }
            let native = rule.is_native();
            for condition in &rule.conditions {
                condition.validate(rule.syscall, native)?;
            }
        }

        if self.mounts.is_some() && !self.namespaces.as_ref().is_some_and(|ns| ns.mount) {
            return Err(StockadeError::Policy(
                "mounts require a mount namespace".into(),
            ));
        }

        let mut policy = Policy {
            rules: self.rules,
            default_action: if self.danger_allow_all {
                None
            } else {
                self.default_action
            },
            danger_allow_all: self.danger_allow_all,
            program: Vec::new(),
            landlock: self.landlock,
            namespaces: self.namespaces,
            mounts: self.mounts,
            stacktraces: self.stacktraces,
        };
        policy.program = policy.compile()?;

        if policy.danger_allow_all {
            tracing::warn!("policy allows every syscall with no hardening");
        }
        tracing::debug!(
            rules = policy.rules.len(),
            instructions = policy.program.len(),
            "policy compiled"
        );
        Ok(policy)
    }
}

fn validate_errno(errno: u16) -> Result<()> {
    if errno > MAX_ERRNO {
        return Err(StockadeError::Policy(format!(
            "errno {errno} exceeds {MAX_ERRNO}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::bpf::emulate;
    use super::*;
    use proptest::prelude::*;

    fn run(policy: &Policy, data: &SyscallData) -> Decision {
        Decision::from_seccomp_ret(emulate(policy.program(), &data.to_bytes()))
            .expect("known seccomp action")
    }

    fn call(nr: i64) -> SyscallData {
        SyscallData::native(nr, [0; 6])
    }

    #[cfg(target_arch = "x86_64")]
    fn foreign_target() -> TargetArch {
        TargetArch::aarch64
    }

    #[cfg(target_arch = "aarch64")]
    fn foreign_target() -> TargetArch {
        TargetArch::x86_64
    }

    #[test]
    fn build_requires_default_action() {
        let err = PolicyBuilder::new().allow_exit().build().unwrap_err();
        assert!(err.to_string().contains("no default action"));
    }

    #[test]
    fn danger_allow_all_is_a_bare_allow() {
        let policy = PolicyBuilder::new().danger_default_allow_all().build().unwrap();
        assert!(policy.is_danger_allow_all());
        assert_eq!(policy.program().len(), 1);
        assert_eq!(policy.default_action(), None);
        assert_eq!(run(&policy, &call(libc::SYS_ptrace)), Decision::Allow);
    }

    #[test]
    fn allow_all_syscalls_keeps_hardening() {
        let policy = PolicyBuilder::new()
            .default_action(DefaultAction::AllowAllSyscalls)
            .build()
            .unwrap();
        assert!(!policy.is_danger_allow_all());
        assert_eq!(run(&policy, &call(libc::SYS_getpid)), Decision::Allow);
        for &nr in HARDENED {
            assert_eq!(
                run(&policy, &call(nr)),
                Decision::Violation {
                    syscall: nr,
                    foreign_arch: false
                }
            );
        }
        assert_eq!(
            run(&policy, &call(libc::SYS_clone3)),
            Decision::Errno(libc::ENOSYS as u16)
        );
    }

    #[test]
    fn clone_untraced_is_a_violation() {
        let policy = PolicyBuilder::new()
            .default_action(DefaultAction::AllowAllSyscalls)
            .build()
            .unwrap();
        let thread_flags = (libc::CLONE_VM | libc::CLONE_THREAD | libc::CLONE_SIGHAND) as u64;
        let plain = SyscallData::native(libc::SYS_clone, [thread_flags, 0, 0, 0, 0, 0]);
        let untraced = SyscallData::native(
            libc::SYS_clone,
            [thread_flags | u64::from(CLONE_UNTRACED), 0, 0, 0, 0, 0],
        );
        assert_eq!(run(&policy, &plain), Decision::Allow);
        assert!(matches!(run(&policy, &untraced), Decision::Violation { .. }));
    }

    #[test]
    fn foreign_architecture_is_a_violation() {
        let policy = PolicyBuilder::new()
            .default_action(DefaultAction::AllowAllSyscalls)
            .build()
            .unwrap();
        let data = SyscallData {
            arch: 0x4000_0003,
            ..call(20)
        };
        assert_eq!(
            run(&policy, &data),
            Decision::Violation {
                syscall: 20,
                foreign_arch: true
            }
        );
    }

    #[test]
    fn foreign_violation_reports_the_syscall_not_the_arch() {
        let policy = PolicyBuilder::new()
            .default_action(DefaultAction::Kill)
            .build()
            .unwrap();
        let data = SyscallData {
            arch: 0x4000_0003,
            ..call(999)
        };
        let expected = Decision::Violation {
            syscall: 999,
            foreign_arch: true,
        };
        assert_eq!(run(&policy, &data), expected);
        assert_eq!(policy.evaluate(&data), expected);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn x32_syscalls_are_foreign() {
        let policy = PolicyBuilder::new()
            .default_action(DefaultAction::AllowAllSyscalls)
            .build()
            .unwrap();
        let data = call(0x4000_0000 | libc::SYS_write);
        assert_eq!(
            run(&policy, &data),
            Decision::Violation {
                syscall: libc::SYS_write,
                foreign_arch: true
            }
        );
    }

    #[test]
    fn exec_marker_needs_magic() {
        let policy = PolicyBuilder::new()
            .default_action(DefaultAction::Kill)
            .build()
            .unwrap();
        let marker = SyscallData::native(
            libc::SYS_execveat,
            [3, 0, 0, 0, AT_EMPTY_PATH, EXECVEAT_MAGIC],
        );
        let plain = SyscallData::native(libc::SYS_execveat, [3, 0, 0, 0, AT_EMPTY_PATH, 0]);
        assert_eq!(run(&policy, &marker), Decision::ExecMarker);
        assert_eq!(
            run(&policy, &plain),
            Decision::Violation {
                syscall: libc::SYS_execveat,
                foreign_arch: false
            }
        );
    }

    #[test]
    fn first_matching_rule_wins() {
        let policy = PolicyBuilder::new()
            .block_syscall_with_errno(libc::SYS_uname, libc::EPERM)
            .allow_syscall(libc::SYS_uname)
            .allow_exit()
            .default_action(DefaultAction::Kill)
            .build()
            .unwrap();
        assert_eq!(
            run(&policy, &call(libc::SYS_uname)),
            Decision::Errno(libc::EPERM as u16)
        );
        assert_eq!(run(&policy, &call(libc::SYS_exit_group)), Decision::Allow);
        assert_eq!(
            run(&policy, &call(libc::SYS_getpid)),
            Decision::Violation {
                syscall: libc::SYS_getpid,
                foreign_arch: false
            }
        );
    }

    #[test]
    fn conditional_rules_fall_through() {
        let policy = PolicyBuilder::new()
            .allow_syscall_if(libc::SYS_write, vec![Condition::eq(0, 2)])
            .default_action(DefaultAction::Errno(libc::EBADF as u16))
            .build()
            .unwrap();
        let stderr = SyscallData::native(libc::SYS_write, [2, 0, 0, 0, 0, 0]);
        let stdout = SyscallData::native(libc::SYS_write, [1, 0, 0, 0, 0, 0]);
        assert_eq!(run(&policy, &stderr), Decision::Allow);
        assert_eq!(run(&policy, &stdout), Decision::Errno(libc::EBADF as u16));
    }

    #[test]
    fn rules_for_other_architectures_are_skipped() {
        let policy = PolicyBuilder::new()
            .add_rule(Rule::new(libc::SYS_getpid, Action::Kill).for_arch(foreign_target()))
            .default_action(DefaultAction::AllowAllSyscalls)
            .build()
            .unwrap();
        assert_eq!(run(&policy, &call(libc::SYS_getpid)), Decision::Allow);
    }

    #[test]
    fn condition_beyond_arity_is_rejected() {
        let err = PolicyBuilder::new()
            .allow_syscall_if(libc::SYS_getpid, vec![Condition::eq(0, 1)])
            .default_action(DefaultAction::Kill)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("getpid"));

        let err = PolicyBuilder::new()
            .allow_syscall_if(0xabc, vec![Condition::eq(6, 1)])
            .default_action(DefaultAction::Kill)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn dword_condition_rejects_wide_operand() {
        let result = PolicyBuilder::new()
            .allow_syscall_if(
                libc::SYS_write,
                vec![Condition::new(
                    0,
                    SeccompCmpArgLen::Dword,
                    SeccompCmpOp::Eq,
                    1 << 40,
                )],
            )
            .default_action(DefaultAction::Kill)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn errno_out_of_range_is_rejected() {
        assert!(
            PolicyBuilder::new()
                .default_action(DefaultAction::Errno(5000))
                .build()
                .is_err()
        );
        assert!(
            PolicyBuilder::new()
                .block_syscall_with_errno(libc::SYS_uname, 70000)
                .default_action(DefaultAction::Kill)
                .build()
                .is_err()
        );
    }

    #[test]
    fn mounts_need_a_mount_namespace() {
        let result = PolicyBuilder::new()
            .mounts(MountConfig::default().tmpfs("/tmp", 1 << 20))
            .default_action(DefaultAction::AllowAllSyscalls)
            .build();
        assert!(result.is_err());

        let result = PolicyBuilder::new()
            .namespaces(NamespaceConfig::default())
            .mounts(MountConfig::default().tmpfs("/tmp", 1 << 20))
            .default_action(DefaultAction::AllowAllSyscalls)
            .build();
        assert!(result.is_ok());
    }

    #[test]
    fn stacktrace_defaults() {
        let policy = PolicyBuilder::new()
            .default_action(DefaultAction::Kill)
            .build()
            .unwrap();
        let st = policy.stacktraces();
        assert!(st.on_violation && st.on_timeout);
        assert!(!st.on_signal && !st.on_exit);
    }

    #[test]
    fn oversized_policy_fails_to_build() {
        let mut builder = PolicyBuilder::new().default_action(DefaultAction::Kill);
        for nr in 0..2100 {
            builder = builder.allow_syscall(1000 + nr);
        }
        assert!(builder.build().is_err());
    }

    // Syscall numbers outside the arity table so any argument index is legal
    const FAKE_NR: std::ops::Range<i64> = 1000..1004;

    fn operand() -> impl Strategy<Value = u64> {
        prop_oneof![
            Just(0u64),
            Just(1),
            Just(0xffff_ffff),
            Just(1 << 32),
            Just((1 << 32) | 1),
            Just(u64::MAX),
            any::<u64>(),
        ]
    }

    fn condition() -> impl Strategy<Value = Condition> {
        let op = prop_oneof![
            Just(SeccompCmpOp::Eq),
            Just(SeccompCmpOp::Ne),
            Just(SeccompCmpOp::Gt),
            Just(SeccompCmpOp::Ge),
            Just(SeccompCmpOp::Lt),
            Just(SeccompCmpOp::Le),
            operand().prop_map(SeccompCmpOp::MaskedEq),
        ];
        (0u8..3, any::<bool>(), op, operand()).prop_map(|(arg, dword, op, value)| {
            if dword {
                let op = match op {
                    SeccompCmpOp::MaskedEq(m) => SeccompCmpOp::MaskedEq(m & 0xffff_ffff),
                    other => other,
                };
                Condition::new(arg, SeccompCmpArgLen::Dword, op, value & 0xffff_ffff)
            } else {
                Condition::new(arg, SeccompCmpArgLen::Qword, op, value)
            }
        })
    }

    fn action() -> impl Strategy<Value = Action> {
        prop_oneof![
            Just(Action::Allow),
            (1u16..200).prop_map(Action::Errno),
            Just(Action::Kill),
            Just(Action::Trap),
            Just(Action::Log),
        ]
    }

    fn default_action() -> impl Strategy<Value = DefaultAction> {
        prop_oneof![
            Just(DefaultAction::Kill),
            (1u16..200).prop_map(DefaultAction::Errno),
            Just(DefaultAction::Trap),
            Just(DefaultAction::Log),
            Just(DefaultAction::AllowAllSyscalls),
        ]
    }

    fn rule() -> impl Strategy<Value = Rule> {
        (FAKE_NR, prop::collection::vec(condition(), 0..3), action()).prop_map(
            |(nr, conditions, action)| Rule {
                conditions,
                ..Rule::new(nr, action)
            },
        )
    }

    fn syscall_data() -> impl Strategy<Value = SyscallData> {
        let arch = prop_oneof![9 => Just(NATIVE_AUDIT_ARCH), 1 => Just(0x4000_0003u32)];
        (
            FAKE_NR.start - 1..FAKE_NR.end + 1,
            arch,
            [operand(), operand(), operand(), operand(), operand(), operand()],
        )
            .prop_map(|(nr, arch, args)| SyscallData {
                arch,
                ..SyscallData::native(nr, args)
            })
    }

    proptest! {
        #[test]
        fn compiled_program_agrees_with_evaluate(
            rules in prop::collection::vec(rule(), 0..8),
            default in default_action(),
            calls in prop::collection::vec(syscall_data(), 1..16),
        ) {
            let policy = rules
                .into_iter()
                .fold(PolicyBuilder::new(), PolicyBuilder::add_rule)
                .default_action(default)
                .build()
                .unwrap();
            for data in &calls {
                prop_assert_eq!(run(&policy, data), policy.evaluate(data));
            }
        }
    }
}
