//! Classic BPF assembler for seccomp programs.
//!
//! Programs are built from statements and label-addressed jumps, then
//! resolved in [`Assembler::finish`]. Conditional jumps can only reach 255
//! instructions forward; [`Assembler::ja`] covers anything further.

use crate::{Result, StockadeError};
use serde::{Deserialize, Serialize};

// Instruction classes
pub const BPF_LD: u16 = 0x00;
pub const BPF_ALU: u16 = 0x04;
pub const BPF_JMP: u16 = 0x05;
pub const BPF_RET: u16 = 0x06;

// ld/ldx fields
pub const BPF_W: u16 = 0x00;
pub const BPF_ABS: u16 = 0x20;

// alu/jmp fields
pub const BPF_OR: u16 = 0x40;
pub const BPF_AND: u16 = 0x50;
pub const BPF_JA: u16 = 0x00;
pub const BPF_JEQ: u16 = 0x10;
pub const BPF_JGT: u16 = 0x20;
pub const BPF_JGE: u16 = 0x30;
pub const BPF_JSET: u16 = 0x40;
pub const BPF_K: u16 = 0x00;
pub const BPF_A: u16 = 0x10;

/// Kernel limit on program length
pub const BPF_MAXINSNS: usize = 4096;

/// A single `struct sock_filter`
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SockFilter {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

impl SockFilter {
    #[inline]
    #[must_use]
    pub const fn stmt(code: u16, k: u32) -> Self {
        Self { code, jt: 0, jf: 0, k }
    }

    #[inline]
    #[must_use]
    pub const fn jump(code: u16, k: u32, jt: u8, jf: u8) -> Self {
        Self { code, jt, jf, k }
    }
}

/// `struct sock_fprog`
#[repr(C)]
#[derive(Debug)]
pub struct SockFprog {
    pub len: u16,
    pub filter: *const SockFilter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

/// Where a conditional branch goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Next,
    To(Label),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpOp {
    Eq,
    Gt,
    Ge,
    Set,
}

impl JumpOp {
    const fn code(self) -> u16 {
        let op = match self {
            Self::Eq => BPF_JEQ,
            Self::Gt => BPF_JGT,
            Self::Ge => BPF_JGE,
            Self::Set => BPF_JSET,
        };
        BPF_JMP | op | BPF_K
    }
}

#[derive(Debug)]
enum Insn {
    Stmt(SockFilter),
    Jump {
        op: JumpOp,
        k: u32,
        jt: Target,
        jf: Target,
    },
    Ja(Label),
    Bind(Label),
}

#[derive(Debug, Default)]
pub struct Assembler {
    insns: Vec<Insn>,
    labels: usize,
}

impl Assembler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn label(&mut self) -> Label {
        self.labels += 1;
        Label(self.labels - 1)
    }

    pub fn bind(&mut self, label: Label) {
        self.insns.push(Insn::Bind(label));
    }

    /// `A = seccomp_data[offset]`
    pub fn load(&mut self, offset: u32) {
        self.insns
            .push(Insn::Stmt(SockFilter::stmt(BPF_LD | BPF_W | BPF_ABS, offset)));
    }

    pub fn and(&mut self, k: u32) {
        self.insns
            .push(Insn::Stmt(SockFilter::stmt(BPF_ALU | BPF_AND | BPF_K, k)));
    }

    pub fn or(&mut self, k: u32) {
        self.insns
            .push(Insn::Stmt(SockFilter::stmt(BPF_ALU | BPF_OR | BPF_K, k)));
    }

    pub fn ret(&mut self, k: u32) {
        self.insns.push(Insn::Stmt(SockFilter::stmt(BPF_RET | BPF_K, k)));
    }

    /// Return the accumulator
    pub fn ret_a(&mut self) {
        self.insns.push(Insn::Stmt(SockFilter::stmt(BPF_RET | BPF_A, 0)));
    }

    pub fn jump(&mut self, op: JumpOp, k: u32, jt: Target, jf: Target) {
        self.insns.push(Insn::Jump { op, k, jt, jf });
    }

    pub fn ja(&mut self, label: Label) {
        self.insns.push(Insn::Ja(label));
    }

    /// Resolve labels and emit the program
    pub fn finish(self) -> Result<Vec<SockFilter>> {
        let mut positions = vec![None; self.labels];
        let mut pc = 0usize;
        for insn in &self.insns {
            match insn {
                Insn::Bind(Label(l)) => positions[*l] = Some(pc),
                _ => pc += 1,
            }
        }

        if pc == 0 {
            return Err(StockadeError::Policy("empty filter program".into()));
        }
        if pc > BPF_MAXINSNS {
            return Err(StockadeError::Policy(format!(
                "filter program has {pc} instructions, kernel limit is {BPF_MAXINSNS}"
            )));
        }

        let resolve = |label: Label, from: usize| -> Result<usize> {
            let to = positions[label.0]
                .ok_or_else(|| StockadeError::Policy(format!("unbound label {}", label.0)))?;
            to.checked_sub(from + 1)
                .ok_or_else(|| StockadeError::Policy("backward jump in filter".into()))
        };

        let short = |target: Target, from: usize| -> Result<u8> {
            match target {
                Target::Next => Ok(0),
                Target::To(label) => {
                    let off = resolve(label, from)?;
                    u8::try_from(off).map_err(|_| {
                        StockadeError::Policy(format!("conditional jump of {off} is out of range"))
                    })
                }
            }
        };

        let mut out = Vec::with_capacity(pc);
        for insn in &self.insns {
            let here = out.len();
            match *insn {
                Insn::Bind(_) => continue,
                Insn::Stmt(f) => out.push(f),
                Insn::Jump { op, k, jt, jf } => {
                    out.push(SockFilter::jump(op.code(), k, short(jt, here)?, short(jf, here)?));
                }
                Insn::Ja(label) => {
                    let off = u32::try_from(resolve(label, here)?)
                        .map_err(|_| StockadeError::Policy("jump out of range".into()))?;
                    out.push(SockFilter::stmt(BPF_JMP | BPF_JA, off));
                }
            }
        }
        Ok(out)
    }
}

/// Run a program against a serialized `seccomp_data`, the way the kernel does
#[cfg(test)]
pub fn emulate(program: &[SockFilter], data: &[u8; 64]) -> u32 {
    let word = |off: u32| {
        let o = off as usize;
        u32::from_le_bytes([data[o], data[o + 1], data[o + 2], data[o + 3]])
    };
    let mut a = 0u32;
    let mut pc = 0usize;
    loop {
        let f = program[pc];
        pc += 1;
        match f.code {
            c if c == BPF_LD | BPF_W | BPF_ABS => a = word(f.k),
            c if c == BPF_ALU | BPF_AND | BPF_K => a &= f.k,
            c if c == BPF_ALU | BPF_OR | BPF_K => a |= f.k,
            c if c == BPF_JMP | BPF_JA => pc += f.k as usize,
            c if c & 0x07 == BPF_JMP => {
                let taken = match c & 0xf0 {
                    BPF_JEQ => a == f.k,
                    BPF_JGT => a > f.k,
                    BPF_JGE => a >= f.k,
                    BPF_JSET => a & f.k != 0,
                    other => panic!("unsupported jump {other:#x}"),
                };
                pc += usize::from(if taken { f.jt } else { f.jf });
            }
            c if c == BPF_RET | BPF_K => return f.k,
            c if c == BPF_RET | BPF_A => return a,
            other => panic!("unsupported opcode {other:#x}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(nr: u32) -> [u8; 64] {
        let mut d = [0u8; 64];
        d[..4].copy_from_slice(&nr.to_le_bytes());
        d
    }

    #[test]
    fn labels_resolve_to_forward_offsets() {
        let mut asm = Assembler::new();
        let skip = asm.label();
        asm.load(0);
        asm.jump(JumpOp::Eq, 7, Target::Next, Target::To(skip));
        asm.ret(1);
        asm.bind(skip);
        asm.ret(2);
        let prog = asm.finish().unwrap();
        assert_eq!(prog.len(), 4);
        assert_eq!(prog[1].jf, 1);
        assert_eq!(emulate(&prog, &data(7)), 1);
        assert_eq!(emulate(&prog, &data(8)), 2);
    }

    #[test]
    fn far_conditional_jump_is_rejected() {
        let mut asm = Assembler::new();
        let far = asm.label();
        asm.load(0);
        asm.jump(JumpOp::Eq, 0, Target::To(far), Target::Next);
        for _ in 0..300 {
            asm.ret(0);
        }
        asm.bind(far);
        asm.ret(1);
        assert!(asm.finish().is_err());
    }

    #[test]
    fn ja_reaches_past_short_range() {
        let mut asm = Assembler::new();
        let far = asm.label();
        asm.ja(far);
        for _ in 0..300 {
            asm.ret(0);
        }
        asm.bind(far);
        asm.ret(9);
        let prog = asm.finish().unwrap();
        assert_eq!(emulate(&prog, &data(0)), 9);
    }

    #[test]
    fn oversized_program_is_rejected() {
        let mut asm = Assembler::new();
        for _ in 0..=BPF_MAXINSNS {
            asm.ret(0);
        }
        assert!(asm.finish().is_err());
    }

    #[test]
    fn unbound_label_is_rejected() {
        let mut asm = Assembler::new();
        let nowhere = asm.label();
        asm.ja(nowhere);
        assert!(asm.finish().is_err());
    }
}
