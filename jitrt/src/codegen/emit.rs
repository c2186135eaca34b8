//! The instruction interface code generation targets implement.
//!
//! Code generation never writes target bytes itself: it drives an [Emitter], which knows how to
//! encode each abstract instruction for one target. Registers are numbered; `Reg(14)`, `Reg(15)`,
//! `FReg(14)`, and `FReg(15)` are scratch registers the register allocator never hands out.

use std::fmt;
use strum::{Display, FromRepr};

/// A general purpose register.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub(crate) struct Reg(pub u8);

/// A floating point register.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub(crate) struct FReg(pub u8);

pub(crate) const NUM_GPRS: u8 = 16;
pub(crate) const NUM_FPRS: u8 = 16;

/// Generated code returns the tag of its boxed result here...
pub(crate) const RET_TAG: Reg = Reg(0);
/// ...and the payload here.
pub(crate) const RET_PAYLOAD: Reg = Reg(1);
pub(crate) const SCRATCH0: Reg = Reg(14);
pub(crate) const SCRATCH1: Reg = Reg(15);
pub(crate) const FSCRATCH0: FReg = FReg(14);
pub(crate) const FSCRATCH1: FReg = FReg(15);

/// How many registers of each class the register allocator may use.
pub(crate) const ALLOCATABLE_GPRS: u8 = 14;
pub(crate) const ALLOCATABLE_FPRS: u8 = 14;

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

impl fmt::Display for FReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "f{}", self.0)
    }
}

/// A memory operand.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum Addr {
    /// `sp + off`.
    Sp(i32),
    /// `base + off`.
    Base { base: Reg, off: i32 },
    /// `base + index * scale + off`.
    Index {
        base: Reg,
        index: Reg,
        scale: u8,
        off: i32,
    },
    /// An absolute address.
    Abs(u64),
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Addr::Sp(off) => write!(f, "[sp{off:+}]"),
            Addr::Base { base, off } => write!(f, "[{base}{off:+}]"),
            Addr::Index {
                base,
                index,
                scale,
                off,
            } => write!(f, "[{base}+{index}*{scale}{off:+}]"),
            Addr::Abs(a) => write!(f, "[{a:#x}]"),
        }
    }
}

/// The right hand operand of a general purpose instruction.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum RegOrImm {
    Reg(Reg),
    Imm(i32),
}

impl fmt::Display for RegOrImm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegOrImm::Reg(r) => write!(f, "{r}"),
            RegOrImm::Imm(i) => write!(f, "{i}"),
        }
    }
}

/// 32-bit integer operations. Results are zero extended to 64 bits; `Add`, `Sub`, and `Mul` set
/// the overflow flag on signed overflow.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Display, Eq, FromRepr, Hash, PartialEq)]
#[strum(serialize_all = "lowercase")]
pub(crate) enum AluOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, Display, Eq, FromRepr, Hash, PartialEq)]
#[strum(serialize_all = "lowercase")]
pub(crate) enum FAluOp {
    Add,
    Sub,
    Mul,
}

/// A condition on the flags set by the most recent comparison or arithmetic instruction. After
/// a floating point comparison with a NaN operand, only `Ne` holds.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Display, Eq, FromRepr, Hash, PartialEq)]
#[strum(serialize_all = "lowercase")]
pub(crate) enum Cond {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Overflow,
    NoOverflow,
}

/// What a comparison compares.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
#[strum(serialize_all = "lowercase")]
pub(crate) enum CmpKind {
    /// Signed 32-bit integers.
    I32,
    /// 64-bit words, for equality of booleans, strings, and objects.
    W64,
    F64,
}

/// A position in the code being emitted.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub(crate) struct Label(pub(crate) usize);

/// Encodes abstract instructions for one target.
pub(crate) trait Emitter {
    /// The byte offset the next instruction will be emitted at.
    fn offset(&self) -> usize;
    fn new_label(&mut self) -> Label;
    /// Bind `l` to the current offset.
    fn bind(&mut self, l: Label);

    fn mov(&mut self, dst: Reg, src: Reg);
    fn mov_imm(&mut self, dst: Reg, imm: u64);
    fn fmov(&mut self, dst: FReg, src: FReg);
    /// Move the bits of a general purpose register into a float register.
    fn fmov_from_bits(&mut self, dst: FReg, src: Reg);
    /// Move the bits of a float register into a general purpose register.
    fn fmov_to_bits(&mut self, dst: Reg, src: FReg);
    fn load(&mut self, dst: Reg, addr: Addr);
    fn store(&mut self, src: Reg, addr: Addr);
    fn fload(&mut self, dst: FReg, addr: Addr);
    fn fstore(&mut self, src: FReg, addr: Addr);

    fn alu32(&mut self, op: AluOp, dst: Reg, lhs: Reg, rhs: RegOrImm);
    fn falu(&mut self, op: FAluOp, dst: FReg, lhs: FReg, rhs: FReg);
    fn cvt_i32_to_f64(&mut self, dst: FReg, src: Reg);

    fn cmp32(&mut self, lhs: Reg, rhs: RegOrImm);
    fn cmp64(&mut self, lhs: Reg, rhs: RegOrImm);
    fn fcmp(&mut self, lhs: FReg, rhs: FReg);
    /// Set `dst` to 1 if `cond` holds, 0 otherwise.
    fn set_cond(&mut self, cond: Cond, dst: Reg);

    fn branch(&mut self, cond: Cond, target: Label);
    fn jump(&mut self, target: Label);
    /// Push the return address and jump to the address in `target`.
    fn call_reg(&mut self, target: Reg);
    fn call_label(&mut self, target: Label);
    fn ret(&mut self);

    fn push(&mut self, src: Reg);
    fn add_sp(&mut self, imm: i32);
    fn add_sp_reg(&mut self, src: Reg);
    /// Set `dst` to the address `addr` refers to.
    fn lea(&mut self, dst: Reg, addr: Addr);

    /// Leave generated code to the bailout engine. The word at the top of the stack is the
    /// return address pushed by the guard's out of line call.
    fn bailout_exit(&mut self);

    /// Resolve labels and return the encoded code.
    fn finish(self) -> Result<Vec<u8>, String>;
}
