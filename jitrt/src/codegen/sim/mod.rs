//! The sim target: a small register machine with a byte encoded instruction set, executed by
//! [machine::Machine].
//!
//! Every instruction starts with a one byte [Opcode]. Registers are one byte, immediates and
//! offsets little endian. Relative branch offsets are always the last four bytes of an
//! instruction and are relative to the end of the instruction.

use super::emit::{
    Addr, AluOp, Cond, Emitter, FAluOp, FReg, Label, Reg, RegOrImm, NUM_FPRS, NUM_GPRS,
};
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use std::{fmt, io::Cursor};
use strum::FromRepr;
use thiserror::Error;

pub(crate) mod machine;

/// Generated code is installed at addresses from here upwards.
pub(crate) const CODE_BASE: u64 = 0x4000_0000;
/// A call to `RUNTIME_CALL_BASE + id` leaves generated code to run the VM function `id`.
pub(crate) const RUNTIME_CALL_BASE: u64 = 0x8000_0000_0000_0000;
/// The return address of entry frames: returning to it ends the activation.
pub(crate) const ENTRY_RETURN: u64 = 0x3fff_fff8;
/// Loading a word from this address reads the runtime's interrupt flag.
pub(crate) const INTERRUPT_FLAG_ADDR: u64 = 0x1000;
/// Object `i` occupies [OBJECT_SIZE](crate::value::OBJECT_SIZE) bytes from
/// `OBJECT_BASE + i * OBJECT_SIZE`.
pub(crate) const OBJECT_BASE: u64 = 0x1_0000_0000;

#[repr(u8)]
#[derive(Clone, Copy, Debug, FromRepr, PartialEq)]
enum Opcode {
    Nop,
    Mov,
    MovImm,
    FMov,
    FMovFromBits,
    FMovToBits,
    Load,
    Store,
    FLoad,
    FStore,
    Alu32,
    Alu32Imm,
    FAlu,
    CvtI32ToF64,
    Cmp32,
    Cmp32Imm,
    Cmp64,
    Cmp64Imm,
    FCmp,
    SetCond,
    Branch,
    Jump,
    CallReg,
    Call,
    Ret,
    Push,
    AddSp,
    AddSpReg,
    Lea,
    Bailout,
}

const ADDR_SP: u8 = 0;
const ADDR_BASE: u8 = 1;
const ADDR_INDEX: u8 = 2;
const ADDR_ABS: u8 = 3;

#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    #[error("truncated instruction")]
    Truncated,
    #[error("invalid opcode {0:#x}")]
    BadOpcode(u8),
    #[error("invalid {what} {val}")]
    BadOperand { what: &'static str, val: u8 },
}

/// One decoded instruction.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum Inst {
    Nop,
    Mov { dst: Reg, src: Reg },
    MovImm { dst: Reg, imm: u64 },
    FMov { dst: FReg, src: FReg },
    FMovFromBits { dst: FReg, src: Reg },
    FMovToBits { dst: Reg, src: FReg },
    Load { dst: Reg, addr: Addr },
    Store { src: Reg, addr: Addr },
    FLoad { dst: FReg, addr: Addr },
    FStore { src: FReg, addr: Addr },
    Alu32 {
        op: AluOp,
        dst: Reg,
        lhs: Reg,
        rhs: RegOrImm,
    },
    FAlu {
        op: FAluOp,
        dst: FReg,
        lhs: FReg,
        rhs: FReg,
    },
    CvtI32ToF64 { dst: FReg, src: Reg },
    Cmp32 { lhs: Reg, rhs: RegOrImm },
    Cmp64 { lhs: Reg, rhs: RegOrImm },
    FCmp { lhs: FReg, rhs: FReg },
    SetCond { cond: Cond, dst: Reg },
    Branch { cond: Cond, rel: i32 },
    Jump { rel: i32 },
    CallReg { target: Reg },
    Call { rel: i32 },
    Ret,
    Push { src: Reg },
    AddSp { imm: i32 },
    AddSpReg { src: Reg },
    Lea { dst: Reg, addr: Addr },
    Bailout,
}

impl Inst {
    pub(crate) fn encode(&self, buf: &mut Vec<u8>) {
        // Writes to a `Vec` cannot fail.
        fn w32(buf: &mut Vec<u8>, x: i32) {
            buf.write_i32::<LittleEndian>(x).ok();
        }
        fn w64(buf: &mut Vec<u8>, x: u64) {
            buf.write_u64::<LittleEndian>(x).ok();
        }
        fn addr(buf: &mut Vec<u8>, a: &Addr) {
            match *a {
                Addr::Sp(off) => {
                    buf.push(ADDR_SP);
                    w32(buf, off);
                }
                Addr::Base { base, off } => {
                    buf.extend([ADDR_BASE, base.0]);
                    w32(buf, off);
                }
                Addr::Index {
                    base,
                    index,
                    scale,
                    off,
                } => {
                    buf.extend([ADDR_INDEX, base.0, index.0, scale]);
                    w32(buf, off);
                }
                Addr::Abs(x) => {
                    buf.push(ADDR_ABS);
                    w64(buf, x);
                }
            }
        }

        match *self {
            Inst::Nop => buf.push(Opcode::Nop as u8),
            Inst::Mov { dst, src } => buf.extend([Opcode::Mov as u8, dst.0, src.0]),
            Inst::MovImm { dst, imm } => {
                buf.extend([Opcode::MovImm as u8, dst.0]);
                w64(buf, imm);
            }
            Inst::FMov { dst, src } => buf.extend([Opcode::FMov as u8, dst.0, src.0]),
            Inst::FMovFromBits { dst, src } => {
                buf.extend([Opcode::FMovFromBits as u8, dst.0, src.0])
            }
            Inst::FMovToBits { dst, src } => buf.extend([Opcode::FMovToBits as u8, dst.0, src.0]),
            Inst::Load { dst, addr: a } => {
                buf.extend([Opcode::Load as u8, dst.0]);
                addr(buf, &a);
            }
            Inst::Store { src, addr: a } => {
                buf.extend([Opcode::Store as u8, src.0]);
                addr(buf, &a);
            }
            Inst::FLoad { dst, addr: a } => {
                buf.extend([Opcode::FLoad as u8, dst.0]);
                addr(buf, &a);
            }
            Inst::FStore { src, addr: a } => {
                buf.extend([Opcode::FStore as u8, src.0]);
                addr(buf, &a);
            }
            Inst::Alu32 { op, dst, lhs, rhs } => match rhs {
                RegOrImm::Reg(r) => buf.extend([Opcode::Alu32 as u8, op as u8, dst.0, lhs.0, r.0]),
                RegOrImm::Imm(i) => {
                    buf.extend([Opcode::Alu32Imm as u8, op as u8, dst.0, lhs.0]);
                    w32(buf, i);
                }
            },
            Inst::FAlu { op, dst, lhs, rhs } => {
                buf.extend([Opcode::FAlu as u8, op as u8, dst.0, lhs.0, rhs.0])
            }
            Inst::CvtI32ToF64 { dst, src } => {
                buf.extend([Opcode::CvtI32ToF64 as u8, dst.0, src.0])
            }
            Inst::Cmp32 { lhs, rhs } | Inst::Cmp64 { lhs, rhs } => {
                let wide = matches!(self, Inst::Cmp64 { .. });
                match (rhs, wide) {
                    (RegOrImm::Reg(r), false) => buf.extend([Opcode::Cmp32 as u8, lhs.0, r.0]),
                    (RegOrImm::Reg(r), true) => buf.extend([Opcode::Cmp64 as u8, lhs.0, r.0]),
                    (RegOrImm::Imm(i), false) => {
                        buf.extend([Opcode::Cmp32Imm as u8, lhs.0]);
                        w32(buf, i);
                    }
                    (RegOrImm::Imm(i), true) => {
                        buf.extend([Opcode::Cmp64Imm as u8, lhs.0]);
                        w32(buf, i);
                    }
                }
            }
            Inst::FCmp { lhs, rhs } => buf.extend([Opcode::FCmp as u8, lhs.0, rhs.0]),
            Inst::SetCond { cond, dst } => buf.extend([Opcode::SetCond as u8, cond as u8, dst.0]),
            Inst::Branch { cond, rel } => {
                buf.extend([Opcode::Branch as u8, cond as u8]);
                w32(buf, rel);
            }
            Inst::Jump { rel } => {
                buf.push(Opcode::Jump as u8);
                w32(buf, rel);
            }
            Inst::CallReg { target } => buf.extend([Opcode::CallReg as u8, target.0]),
            Inst::Call { rel } => {
                buf.push(Opcode::Call as u8);
                w32(buf, rel);
            }
            Inst::Ret => buf.push(Opcode::Ret as u8),
            Inst::Push { src } => buf.extend([Opcode::Push as u8, src.0]),
            Inst::AddSp { imm } => {
                buf.push(Opcode::AddSp as u8);
                w32(buf, imm);
            }
            Inst::AddSpReg { src } => buf.extend([Opcode::AddSpReg as u8, src.0]),
            Inst::Lea { dst, addr: a } => {
                buf.extend([Opcode::Lea as u8, dst.0]);
                addr(buf, &a);
            }
            Inst::Bailout => buf.push(Opcode::Bailout as u8),
        }
    }

    /// Decode the instruction at the start of `buf`, returning it and its length in bytes.
    pub(crate) fn decode(buf: &[u8]) -> Result<(Inst, usize), DecodeError> {
        let mut c = Cursor::new(buf);
        let inst = decode_one(&mut c)?;
        Ok((inst, c.position() as usize))
    }

    /// If this instruction has a relative target, return it.
    fn rel(&self) -> Option<i32> {
        match self {
            Inst::Branch { rel, .. } | Inst::Jump { rel } | Inst::Call { rel } => Some(*rel),
            _ => None,
        }
    }
}

fn decode_one(c: &mut Cursor<&[u8]>) -> Result<Inst, DecodeError> {
    fn byte(c: &mut Cursor<&[u8]>) -> Result<u8, DecodeError> {
        c.read_u8().map_err(|_| DecodeError::Truncated)
    }
    fn reg(c: &mut Cursor<&[u8]>) -> Result<Reg, DecodeError> {
        match byte(c)? {
            r if r < NUM_GPRS => Ok(Reg(r)),
            val => Err(DecodeError::BadOperand {
                what: "register",
                val,
            }),
        }
    }
    fn freg(c: &mut Cursor<&[u8]>) -> Result<FReg, DecodeError> {
        match byte(c)? {
            r if r < NUM_FPRS => Ok(FReg(r)),
            val => Err(DecodeError::BadOperand {
                what: "float register",
                val,
            }),
        }
    }
    fn i32_(c: &mut Cursor<&[u8]>) -> Result<i32, DecodeError> {
        c.read_i32::<LittleEndian>()
            .map_err(|_| DecodeError::Truncated)
    }
    fn u64_(c: &mut Cursor<&[u8]>) -> Result<u64, DecodeError> {
        c.read_u64::<LittleEndian>()
            .map_err(|_| DecodeError::Truncated)
    }
    fn addr(c: &mut Cursor<&[u8]>) -> Result<Addr, DecodeError> {
        match byte(c)? {
            ADDR_SP => Ok(Addr::Sp(i32_(c)?)),
            ADDR_BASE => Ok(Addr::Base {
                base: reg(c)?,
                off: i32_(c)?,
            }),
            ADDR_INDEX => Ok(Addr::Index {
                base: reg(c)?,
                index: reg(c)?,
                scale: byte(c)?,
                off: i32_(c)?,
            }),
            ADDR_ABS => Ok(Addr::Abs(u64_(c)?)),
            val => Err(DecodeError::BadOperand {
                what: "address mode",
                val,
            }),
        }
    }
    fn cond(c: &mut Cursor<&[u8]>) -> Result<Cond, DecodeError> {
        let val = byte(c)?;
        Cond::from_repr(val).ok_or(DecodeError::BadOperand {
            what: "condition",
            val,
        })
    }
    fn alu(c: &mut Cursor<&[u8]>) -> Result<AluOp, DecodeError> {
        let val = byte(c)?;
        AluOp::from_repr(val).ok_or(DecodeError::BadOperand {
            what: "alu op",
            val,
        })
    }

    let op = byte(c)?;
    let op = Opcode::from_repr(op).ok_or(DecodeError::BadOpcode(op))?;
    Ok(match op {
        Opcode::Nop => Inst::Nop,
        Opcode::Mov => Inst::Mov {
            dst: reg(c)?,
            src: reg(c)?,
        },
        Opcode::MovImm => Inst::MovImm {
            dst: reg(c)?,
            imm: u64_(c)?,
        },
        Opcode::FMov => Inst::FMov {
            dst: freg(c)?,
            src: freg(c)?,
        },
        Opcode::FMovFromBits => Inst::FMovFromBits {
            dst: freg(c)?,
            src: reg(c)?,
        },
        Opcode::FMovToBits => Inst::FMovToBits {
            dst: reg(c)?,
            src: freg(c)?,
        },
        Opcode::Load => Inst::Load {
            dst: reg(c)?,
            addr: addr(c)?,
        },
        Opcode::Store => Inst::Store {
            src: reg(c)?,
            addr: addr(c)?,
        },
        Opcode::FLoad => Inst::FLoad {
            dst: freg(c)?,
            addr: addr(c)?,
        },
        Opcode::FStore => Inst::FStore {
            src: freg(c)?,
            addr: addr(c)?,
        },
        Opcode::Alu32 => Inst::Alu32 {
            op: alu(c)?,
            dst: reg(c)?,
            lhs: reg(c)?,
            rhs: RegOrImm::Reg(reg(c)?),
        },
        Opcode::Alu32Imm => Inst::Alu32 {
            op: alu(c)?,
            dst: reg(c)?,
            lhs: reg(c)?,
            rhs: RegOrImm::Imm(i32_(c)?),
        },
        Opcode::FAlu => {
            let val = byte(c)?;
            let op = FAluOp::from_repr(val).ok_or(DecodeError::BadOperand {
                what: "float op",
                val,
            })?;
            Inst::FAlu {
                op,
                dst: freg(c)?,
                lhs: freg(c)?,
                rhs: freg(c)?,
            }
        }
        Opcode::CvtI32ToF64 => Inst::CvtI32ToF64 {
            dst: freg(c)?,
            src: reg(c)?,
        },
        Opcode::Cmp32 => Inst::Cmp32 {
            lhs: reg(c)?,
            rhs: RegOrImm::Reg(reg(c)?),
        },
        Opcode::Cmp32Imm => Inst::Cmp32 {
            lhs: reg(c)?,
            rhs: RegOrImm::Imm(i32_(c)?),
        },
        Opcode::Cmp64 => Inst::Cmp64 {
            lhs: reg(c)?,
            rhs: RegOrImm::Reg(reg(c)?),
        },
        Opcode::Cmp64Imm => Inst::Cmp64 {
            lhs: reg(c)?,
            rhs: RegOrImm::Imm(i32_(c)?),
        },
        Opcode::FCmp => Inst::FCmp {
            lhs: freg(c)?,
            rhs: freg(c)?,
        },
        Opcode::SetCond => Inst::SetCond {
            cond: cond(c)?,
            dst: reg(c)?,
        },
        Opcode::Branch => Inst::Branch {
            cond: cond(c)?,
            rel: i32_(c)?,
        },
        Opcode::Jump => Inst::Jump { rel: i32_(c)? },
        Opcode::CallReg => Inst::CallReg { target: reg(c)? },
        Opcode::Call => Inst::Call { rel: i32_(c)? },
        Opcode::Ret => Inst::Ret,
        Opcode::Push => Inst::Push { src: reg(c)? },
        Opcode::AddSp => Inst::AddSp { imm: i32_(c)? },
        Opcode::AddSpReg => Inst::AddSpReg { src: reg(c)? },
        Opcode::Lea => Inst::Lea {
            dst: reg(c)?,
            addr: addr(c)?,
        },
        Opcode::Bailout => Inst::Bailout,
    })
}

impl fmt::Display for Inst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Inst::Nop => write!(f, "nop"),
            Inst::Mov { dst, src } => write!(f, "mov {dst}, {src}"),
            Inst::MovImm { dst, imm } => write!(f, "mov {dst}, {imm:#x}"),
            Inst::FMov { dst, src } => write!(f, "fmov {dst}, {src}"),
            Inst::FMovFromBits { dst, src } => write!(f, "fmov.bits {dst}, {src}"),
            Inst::FMovToBits { dst, src } => write!(f, "fmov.bits {dst}, {src}"),
            Inst::Load { dst, addr } => write!(f, "load {dst}, {addr}"),
            Inst::Store { src, addr } => write!(f, "store {addr}, {src}"),
            Inst::FLoad { dst, addr } => write!(f, "fload {dst}, {addr}"),
            Inst::FStore { src, addr } => write!(f, "fstore {addr}, {src}"),
            Inst::Alu32 { op, dst, lhs, rhs } => write!(f, "{op}32 {dst}, {lhs}, {rhs}"),
            Inst::FAlu { op, dst, lhs, rhs } => write!(f, "f{op} {dst}, {lhs}, {rhs}"),
            Inst::CvtI32ToF64 { dst, src } => write!(f, "cvt.i32.f64 {dst}, {src}"),
            Inst::Cmp32 { lhs, rhs } => write!(f, "cmp32 {lhs}, {rhs}"),
            Inst::Cmp64 { lhs, rhs } => write!(f, "cmp64 {lhs}, {rhs}"),
            Inst::FCmp { lhs, rhs } => write!(f, "fcmp {lhs}, {rhs}"),
            Inst::SetCond { cond, dst } => write!(f, "set.{cond} {dst}"),
            Inst::Branch { cond, rel } => write!(f, "b.{cond} {rel:+}"),
            Inst::Jump { rel } => write!(f, "jmp {rel:+}"),
            Inst::CallReg { target } => write!(f, "call {target}"),
            Inst::Call { rel } => write!(f, "call {rel:+}"),
            Inst::Ret => write!(f, "ret"),
            Inst::Push { src } => write!(f, "push {src}"),
            Inst::AddSp { imm } => write!(f, "add sp, {imm}"),
            Inst::AddSpReg { src } => write!(f, "add sp, {src}"),
            Inst::Lea { dst, addr } => write!(f, "lea {dst}, {addr}"),
            Inst::Bailout => write!(f, "bailout"),
        }
    }
}

/// Render `code` one instruction per line, with relative targets resolved to offsets.
pub(crate) fn disassemble(code: &[u8]) -> String {
    let mut out = String::new();
    let mut off = 0;
    while off < code.len() {
        match Inst::decode(&code[off..]) {
            Ok((inst, len)) => {
                let end = off + len;
                match inst.rel() {
                    Some(rel) => out.push_str(&format!(
                        "{off:>6}: {inst} ; -> {}\n",
                        end as i64 + i64::from(rel)
                    )),
                    None => out.push_str(&format!("{off:>6}: {inst}\n")),
                }
                off = end;
            }
            Err(e) => {
                out.push_str(&format!("{off:>6}: <{e}>\n"));
                break;
            }
        }
    }
    out
}

/// An [Emitter] for the sim target.
#[derive(Default)]
pub(crate) struct SimAssembler {
    buf: Vec<u8>,
    labels: Vec<Option<usize>>,
    /// `(offset of a rel32 field, the label it refers to)`.
    fixups: Vec<(usize, Label)>,
}

impl SimAssembler {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn emit(&mut self, inst: Inst) {
        inst.encode(&mut self.buf);
    }

    fn emit_rel(&mut self, inst: Inst, target: Label) {
        self.emit(inst);
        self.fixups.push((self.buf.len() - 4, target));
    }
}

impl Emitter for SimAssembler {
    fn offset(&self) -> usize {
        self.buf.len()
    }

    fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    fn bind(&mut self, l: Label) {
        self.labels[l.0] = Some(self.buf.len());
    }

    fn mov(&mut self, dst: Reg, src: Reg) {
        if dst != src {
            self.emit(Inst::Mov { dst, src });
        }
    }

    fn mov_imm(&mut self, dst: Reg, imm: u64) {
        self.emit(Inst::MovImm { dst, imm });
    }

    fn fmov(&mut self, dst: FReg, src: FReg) {
        if dst != src {
            self.emit(Inst::FMov { dst, src });
        }
    }

    fn fmov_from_bits(&mut self, dst: FReg, src: Reg) {
        self.emit(Inst::FMovFromBits { dst, src });
    }

    fn fmov_to_bits(&mut self, dst: Reg, src: FReg) {
        self.emit(Inst::FMovToBits { dst, src });
    }

    fn load(&mut self, dst: Reg, addr: Addr) {
        self.emit(Inst::Load { dst, addr });
    }

    fn store(&mut self, src: Reg, addr: Addr) {
        self.emit(Inst::Store { src, addr });
    }

    fn fload(&mut self, dst: FReg, addr: Addr) {
        self.emit(Inst::FLoad { dst, addr });
    }

    fn fstore(&mut self, src: FReg, addr: Addr) {
        self.emit(Inst::FStore { src, addr });
    }

    fn alu32(&mut self, op: AluOp, dst: Reg, lhs: Reg, rhs: RegOrImm) {
        self.emit(Inst::Alu32 { op, dst, lhs, rhs });
    }

    fn falu(&mut self, op: FAluOp, dst: FReg, lhs: FReg, rhs: FReg) {
        self.emit(Inst::FAlu { op, dst, lhs, rhs });
    }

    fn cvt_i32_to_f64(&mut self, dst: FReg, src: Reg) {
        self.emit(Inst::CvtI32ToF64 { dst, src });
    }

    fn cmp32(&mut self, lhs: Reg, rhs: RegOrImm) {
        self.emit(Inst::Cmp32 { lhs, rhs });
    }

    fn cmp64(&mut self, lhs: Reg, rhs: RegOrImm) {
        self.emit(Inst::Cmp64 { lhs, rhs });
    }

    fn fcmp(&mut self, lhs: FReg, rhs: FReg) {
        self.emit(Inst::FCmp { lhs, rhs });
    }

    fn set_cond(&mut self, cond: Cond, dst: Reg) {
        self.emit(Inst::SetCond { cond, dst });
    }

    fn branch(&mut self, cond: Cond, target: Label) {
        self.emit_rel(Inst::Branch { cond, rel: 0 }, target);
    }

    fn jump(&mut self, target: Label) {
        self.emit_rel(Inst::Jump { rel: 0 }, target);
    }

    fn call_reg(&mut self, target: Reg) {
        self.emit(Inst::CallReg { target });
    }

    fn call_label(&mut self, target: Label) {
        self.emit_rel(Inst::Call { rel: 0 }, target);
    }

    fn ret(&mut self) {
        self.emit(Inst::Ret);
    }

    fn push(&mut self, src: Reg) {
        self.emit(Inst::Push { src });
    }

    fn add_sp(&mut self, imm: i32) {
        if imm != 0 {
            self.emit(Inst::AddSp { imm });
        }
    }

    fn add_sp_reg(&mut self, src: Reg) {
        self.emit(Inst::AddSpReg { src });
    }

    fn lea(&mut self, dst: Reg, addr: Addr) {
        self.emit(Inst::Lea { dst, addr });
    }

    fn bailout_exit(&mut self) {
        self.emit(Inst::Bailout);
    }

    fn finish(mut self) -> Result<Vec<u8>, String> {
        for (off, l) in &self.fixups {
            let target = self.labels[l.0].ok_or_else(|| format!("label {} never bound", l.0))?;
            let rel = i32::try_from(target as i64 - (*off as i64 + 4))
                .map_err(|_| "branch out of range".to_owned())?;
            LittleEndian::write_i32(&mut self.buf[*off..*off + 4], rel);
        }
        Ok(self.buf)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn decode_what_was_encoded() {
        let insts = [
            Inst::MovImm {
                dst: Reg(3),
                imm: 0xdead_beef_0000_0001,
            },
            Inst::Load {
                dst: Reg(1),
                addr: Addr::Index {
                    base: Reg(7),
                    index: Reg(2),
                    scale: 16,
                    off: 24,
                },
            },
            Inst::Alu32 {
                op: AluOp::Mul,
                dst: Reg(0),
                lhs: Reg(1),
                rhs: RegOrImm::Imm(-3),
            },
            Inst::FStore {
                src: FReg(13),
                addr: Addr::Abs(INTERRUPT_FLAG_ADDR),
            },
            Inst::Branch {
                cond: Cond::Overflow,
                rel: -12,
            },
            Inst::Lea {
                dst: Reg(15),
                addr: Addr::Index {
                    base: Reg(15),
                    index: Reg(14),
                    scale: 136,
                    off: 0,
                },
            },
        ];
        let mut buf = Vec::new();
        for i in &insts {
            i.encode(&mut buf);
        }
        let mut off = 0;
        for i in &insts {
            let (d, len) = Inst::decode(&buf[off..]).unwrap();
            assert_eq!(d, *i);
            off += len;
        }
        assert_eq!(off, buf.len());
    }

    #[test]
    fn bad_encodings() {
        assert_eq!(Inst::decode(&[0xff]), Err(DecodeError::BadOpcode(0xff)));
        assert_eq!(
            Inst::decode(&[Opcode::Mov as u8, 1, 16]),
            Err(DecodeError::BadOperand {
                what: "register",
                val: 16
            })
        );
        assert_eq!(
            Inst::decode(&[Opcode::Jump as u8, 0, 0]),
            Err(DecodeError::Truncated)
        );
    }

    #[test]
    fn labels() {
        let mut asm = SimAssembler::new();
        let top = asm.new_label();
        let out = asm.new_label();
        asm.bind(top);
        asm.cmp32(Reg(0), RegOrImm::Imm(0));
        asm.branch(Cond::Eq, out);
        asm.alu32(AluOp::Sub, Reg(0), Reg(0), RegOrImm::Imm(1));
        asm.jump(top);
        asm.bind(out);
        asm.ret();
        let code = asm.finish().unwrap();
        crate::testing::assert_matches(
            "     0: cmp32 r0, 0
     6: b.eq +13 ; -> 25
    12: sub32 r0, r0, 1
    20: jmp -25 ; -> 0
    25: ret
",
            &disassemble(&code),
        );

        let mut asm = SimAssembler::new();
        let l = asm.new_label();
        asm.jump(l);
        assert!(asm.finish().is_err());
    }
}
