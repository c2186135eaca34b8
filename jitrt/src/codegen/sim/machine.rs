//! Execute sim code.

use super::{
    DecodeError, Inst, ENTRY_RETURN, INTERRUPT_FLAG_ADDR, OBJECT_BASE, RUNTIME_CALL_BASE,
};
use crate::{
    codegen::emit::{Addr, AluOp, Cond, FAluOp, RegOrImm, NUM_FPRS, NUM_GPRS},
    frame::StackMemory,
};
use std::{
    cmp::Ordering,
    sync::{
        atomic::{AtomicBool, Ordering as AtomicOrdering},
        Arc,
    },
};
use thiserror::Error;

/// The machine stack grows down from here.
pub(crate) const STACK_TOP: u64 = 0x2000_0000;
const STACK_WORDS: usize = 1 << 16;

/// Where a [Machine] fetches instructions from.
pub(crate) trait CodeSource {
    /// The bytes from `addr` to the end of the code object containing it.
    fn code_at(&self, addr: u64) -> Option<&[u8]>;
}

/// The object memory generated code can read and write, from [OBJECT_BASE] upwards.
pub(crate) trait ObjectMemory: Send + Sync {
    fn load(&self, addr: u64) -> Option<u64>;
    fn store(&self, addr: u64, val: u64) -> Option<()>;
}

/// Why [Machine::run] returned.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum MachineExit {
    /// The entry frame's return address was popped. `r0` and `r1` hold the boxed result.
    EntryReturn,
    /// Generated code called the VM function `id`. The stack holds (from the top down) `id`, the
    /// return address, and the caller's frame header and arguments.
    VmCall(u64),
    /// A guard failed. The top of the stack is the return address of the guard's call to the
    /// bailout trampoline.
    Bailout,
}

#[derive(Debug, Error, PartialEq)]
pub enum MachineError {
    #[error("access to unmapped address {0:#x}")]
    BadAddress(u64),
    #[error("machine stack overflow")]
    StackOverflow,
    #[error("no code at {0:#x}")]
    NoCode(u64),
    #[error("at {pc:#x}: {err}")]
    Decode { pc: u64, err: DecodeError },
}

#[derive(Clone, Copy, Debug, Default)]
struct Flags {
    /// The result of the last comparison: `None` if it was unordered.
    ord: Option<Ordering>,
    overflow: bool,
}

pub(crate) struct Machine {
    pub(crate) gprs: [u64; NUM_GPRS as usize],
    pub(crate) fprs: [f64; NUM_FPRS as usize],
    sp: u64,
    pc: u64,
    flags: Flags,
    stack: Vec<u64>,
    interrupt: Arc<AtomicBool>,
    objects: Option<Arc<dyn ObjectMemory>>,
}

impl Machine {
    pub(crate) fn new(interrupt: Arc<AtomicBool>) -> Self {
        Self {
            gprs: [0; NUM_GPRS as usize],
            fprs: [0.0; NUM_FPRS as usize],
            sp: STACK_TOP,
            pc: 0,
            flags: Flags::default(),
            stack: vec![0; STACK_WORDS],
            interrupt,
            objects: None,
        }
    }

    pub(crate) fn with_objects(mut self, objects: Arc<dyn ObjectMemory>) -> Self {
        self.objects = Some(objects);
        self
    }

    pub(crate) fn sp(&self) -> u64 {
        self.sp
    }

    pub(crate) fn set_sp(&mut self, sp: u64) {
        self.sp = sp;
    }

    pub(crate) fn set_pc(&mut self, pc: u64) {
        self.pc = pc;
    }

    fn stack_bottom() -> u64 {
        STACK_TOP - (STACK_WORDS as u64) * 8
    }

    fn slot(&self, addr: u64) -> Result<usize, MachineError> {
        if addr % 8 != 0 || !(Self::stack_bottom()..STACK_TOP).contains(&addr) {
            return Err(MachineError::BadAddress(addr));
        }
        Ok(((addr - Self::stack_bottom()) / 8) as usize)
    }

    pub(crate) fn read(&self, addr: u64) -> Result<u64, MachineError> {
        if addr == INTERRUPT_FLAG_ADDR {
            return Ok(u64::from(self.interrupt.load(AtomicOrdering::Relaxed)));
        }
        if addr >= OBJECT_BASE {
            return self
                .objects
                .as_ref()
                .and_then(|o| o.load(addr))
                .ok_or(MachineError::BadAddress(addr));
        }
        Ok(self.stack[self.slot(addr)?])
    }

    pub(crate) fn write(&mut self, addr: u64, val: u64) -> Result<(), MachineError> {
        if addr >= OBJECT_BASE {
            return self
                .objects
                .as_ref()
                .and_then(|o| o.store(addr, val))
                .ok_or(MachineError::BadAddress(addr));
        }
        let i = self.slot(addr)?;
        self.stack[i] = val;
        Ok(())
    }

    pub(crate) fn push(&mut self, val: u64) -> Result<(), MachineError> {
        if self.sp <= Self::stack_bottom() {
            return Err(MachineError::StackOverflow);
        }
        self.sp -= 8;
        self.write(self.sp, val)
    }

    pub(crate) fn pop(&mut self) -> Result<u64, MachineError> {
        let v = self.read(self.sp)?;
        self.sp += 8;
        Ok(v)
    }

    /// Return from a VM call, optionally setting the boxed result registers.
    pub(crate) fn return_from_vm_call(
        &mut self,
        result: Option<(u64, u64)>,
    ) -> Result<(), MachineError> {
        // The function id.
        self.pop()?;
        self.pc = self.pop()?;
        if let Some((tag, payload)) = result {
            self.gprs[0] = tag;
            self.gprs[1] = payload;
        }
        Ok(())
    }

    fn ea(&self, addr: Addr) -> u64 {
        match addr {
            Addr::Sp(off) => self.sp.wrapping_add_signed(i64::from(off)),
            Addr::Base { base, off } => self.gprs[base.0 as usize].wrapping_add_signed(i64::from(off)),
            Addr::Index {
                base,
                index,
                scale,
                off,
            } => self.gprs[base.0 as usize]
                .wrapping_add(self.gprs[index.0 as usize].wrapping_mul(u64::from(scale)))
                .wrapping_add_signed(i64::from(off)),
            Addr::Abs(a) => a,
        }
    }

    fn rhs32(&self, rhs: RegOrImm) -> i32 {
        match rhs {
            RegOrImm::Reg(r) => self.gprs[r.0 as usize] as u32 as i32,
            RegOrImm::Imm(i) => i,
        }
    }

    fn rhs64(&self, rhs: RegOrImm) -> i64 {
        match rhs {
            RegOrImm::Reg(r) => self.gprs[r.0 as usize] as i64,
            RegOrImm::Imm(i) => i64::from(i),
        }
    }

    fn holds(&self, cond: Cond) -> bool {
        let ord = self.flags.ord;
        match cond {
            Cond::Eq => ord == Some(Ordering::Equal),
            Cond::Ne => ord != Some(Ordering::Equal),
            Cond::Lt => ord == Some(Ordering::Less),
            Cond::Le => matches!(ord, Some(Ordering::Less | Ordering::Equal)),
            Cond::Gt => ord == Some(Ordering::Greater),
            Cond::Ge => matches!(ord, Some(Ordering::Greater | Ordering::Equal)),
            Cond::Overflow => self.flags.overflow,
            Cond::NoOverflow => !self.flags.overflow,
        }
    }

    /// Run from the current pc until generated code needs the runtime.
    pub(crate) fn run(&mut self, code: &dyn CodeSource) -> Result<MachineExit, MachineError> {
        loop {
            let pc = self.pc;
            let bytes = code.code_at(pc).ok_or(MachineError::NoCode(pc))?;
            let (inst, len) = Inst::decode(bytes).map_err(|err| MachineError::Decode { pc, err })?;
            let next = pc + len as u64;
            self.pc = next;
            match inst {
                Inst::Nop => (),
                Inst::Mov { dst, src } => self.gprs[dst.0 as usize] = self.gprs[src.0 as usize],
                Inst::MovImm { dst, imm } => self.gprs[dst.0 as usize] = imm,
                Inst::FMov { dst, src } => self.fprs[dst.0 as usize] = self.fprs[src.0 as usize],
                Inst::FMovFromBits { dst, src } => {
                    self.fprs[dst.0 as usize] = f64::from_bits(self.gprs[src.0 as usize])
                }
                Inst::FMovToBits { dst, src } => {
                    self.gprs[dst.0 as usize] = self.fprs[src.0 as usize].to_bits()
                }
                Inst::Load { dst, addr } => self.gprs[dst.0 as usize] = self.read(self.ea(addr))?,
                Inst::Store { src, addr } => self.write(self.ea(addr), self.gprs[src.0 as usize])?,
                Inst::FLoad { dst, addr } => {
                    self.fprs[dst.0 as usize] = f64::from_bits(self.read(self.ea(addr))?)
                }
                Inst::FStore { src, addr } => {
                    self.write(self.ea(addr), self.fprs[src.0 as usize].to_bits())?
                }
                Inst::Alu32 { op, dst, lhs, rhs } => {
                    let a = self.gprs[lhs.0 as usize] as u32 as i32;
                    let b = self.rhs32(rhs);
                    let (r, overflow) = match op {
                        AluOp::Add => a.overflowing_add(b),
                        AluOp::Sub => a.overflowing_sub(b),
                        AluOp::Mul => a.overflowing_mul(b),
                        AluOp::And => (a & b, false),
                        AluOp::Or => (a | b, false),
                        AluOp::Xor => (a ^ b, false),
                    };
                    self.flags.overflow = overflow;
                    self.gprs[dst.0 as usize] = u64::from(r as u32);
                }
                Inst::FAlu { op, dst, lhs, rhs } => {
                    let a = self.fprs[lhs.0 as usize];
                    let b = self.fprs[rhs.0 as usize];
                    self.fprs[dst.0 as usize] = match op {
                        FAluOp::Add => a + b,
                        FAluOp::Sub => a - b,
                        FAluOp::Mul => a * b,
                    };
                }
                Inst::CvtI32ToF64 { dst, src } => {
                    self.fprs[dst.0 as usize] = f64::from(self.gprs[src.0 as usize] as u32 as i32)
                }
                Inst::Cmp32 { lhs, rhs } => {
                    let a = self.gprs[lhs.0 as usize] as u32 as i32;
                    self.flags.ord = Some(a.cmp(&self.rhs32(rhs)));
                }
                Inst::Cmp64 { lhs, rhs } => {
                    let a = self.gprs[lhs.0 as usize] as i64;
                    self.flags.ord = Some(a.cmp(&self.rhs64(rhs)));
                }
                Inst::FCmp { lhs, rhs } => {
                    self.flags.ord =
                        self.fprs[lhs.0 as usize].partial_cmp(&self.fprs[rhs.0 as usize])
                }
                Inst::SetCond { cond, dst } => self.gprs[dst.0 as usize] = u64::from(self.holds(cond)),
                Inst::Branch { cond, rel } => {
                    if self.holds(cond) {
                        self.pc = next.wrapping_add_signed(i64::from(rel));
                    }
                }
                Inst::Jump { rel } => self.pc = next.wrapping_add_signed(i64::from(rel)),
                Inst::CallReg { target } => {
                    let target = self.gprs[target.0 as usize];
                    self.push(next)?;
                    if target >= RUNTIME_CALL_BASE {
                        let id = target - RUNTIME_CALL_BASE;
                        self.push(id)?;
                        return Ok(MachineExit::VmCall(id));
                    }
                    self.pc = target;
                }
                Inst::Call { rel } => {
                    self.push(next)?;
                    self.pc = next.wrapping_add_signed(i64::from(rel));
                }
                Inst::Ret => {
                    let ret = self.pop()?;
                    if ret == ENTRY_RETURN {
                        return Ok(MachineExit::EntryReturn);
                    }
                    self.pc = ret;
                }
                Inst::Push { src } => self.push(self.gprs[src.0 as usize])?,
                Inst::AddSp { imm } => self.move_sp(i64::from(imm))?,
                Inst::AddSpReg { src } => self.move_sp(self.gprs[src.0 as usize] as i64)?,
                Inst::Lea { dst, addr } => self.gprs[dst.0 as usize] = self.ea(addr),
                Inst::Bailout => {
                    self.pc = pc;
                    return Ok(MachineExit::Bailout);
                }
            }
        }
    }

    fn move_sp(&mut self, by: i64) -> Result<(), MachineError> {
        let sp = self.sp.wrapping_add_signed(by);
        if sp < Self::stack_bottom() {
            return Err(MachineError::StackOverflow);
        }
        if sp > STACK_TOP {
            return Err(MachineError::BadAddress(sp));
        }
        self.sp = sp;
        Ok(())
    }
}

impl StackMemory for Machine {
    fn read_word(&self, addr: u64) -> Option<u64> {
        self.read(addr).ok()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::codegen::{
        emit::{Emitter, FReg, Reg},
        sim::{SimAssembler, CODE_BASE},
    };

    struct Code(Vec<u8>);

    impl CodeSource for Code {
        fn code_at(&self, addr: u64) -> Option<&[u8]> {
            let off = usize::try_from(addr.checked_sub(CODE_BASE)?).ok()?;
            self.0.get(off..)
        }
    }

    fn run(asm: SimAssembler, m: &mut Machine) -> Result<MachineExit, MachineError> {
        let code = Code(asm.finish().unwrap());
        m.push(ENTRY_RETURN).unwrap();
        m.set_pc(CODE_BASE);
        m.run(&code)
    }

    fn machine() -> Machine {
        Machine::new(Arc::new(AtomicBool::new(false)))
    }

    #[test]
    fn overflow_flag() {
        let mut asm = SimAssembler::new();
        let l = asm.new_label();
        asm.mov_imm(Reg(0), i32::MAX as u64);
        asm.alu32(AluOp::Add, Reg(1), Reg(0), RegOrImm::Imm(1));
        asm.branch(Cond::Overflow, l);
        asm.ret();
        asm.bind(l);
        asm.mov_imm(Reg(2), 7);
        asm.ret();
        let mut m = machine();
        assert_eq!(run(asm, &mut m), Ok(MachineExit::EntryReturn));
        assert_eq!(m.gprs[2], 7);
        assert_eq!(m.gprs[1], 0x8000_0000);
    }

    #[test]
    fn nan_compares_unordered() {
        let mut asm = SimAssembler::new();
        asm.mov_imm(Reg(0), f64::NAN.to_bits());
        asm.fmov_from_bits(FReg(0), Reg(0));
        asm.fcmp(FReg(0), FReg(0));
        asm.set_cond(Cond::Eq, Reg(1));
        asm.set_cond(Cond::Ne, Reg(2));
        asm.set_cond(Cond::Ge, Reg(3));
        asm.ret();
        let mut m = machine();
        run(asm, &mut m).unwrap();
        assert_eq!(&m.gprs[1..4], &[0, 1, 0]);
    }

    #[test]
    fn runtime_calls_and_stack() {
        let mut asm = SimAssembler::new();
        asm.mov_imm(Reg(3), 5);
        asm.push(Reg(3));
        asm.mov_imm(Reg(15), RUNTIME_CALL_BASE + 42);
        asm.call_reg(Reg(15));
        asm.add_sp(8);
        asm.ret();
        let mut m = machine();
        let sp = m.sp();
        assert_eq!(run(asm, &mut m), Ok(MachineExit::VmCall(42)));
        assert_eq!(m.read(m.sp()), Ok(42));
        assert_eq!(m.read(m.sp() + 16), Ok(5));
        m.return_from_vm_call(Some((3, 9))).unwrap();
        let code = Code(Vec::new());
        // Nothing left to fetch once the call returns to the end of the code.
        assert!(matches!(m.run(&code), Err(MachineError::NoCode(_))));
        assert_eq!((m.gprs[0], m.gprs[1]), (3, 9));
        assert_eq!(m.sp(), sp - 16);
    }

    #[test]
    fn interrupt_flag_and_bad_addresses() {
        let flag = Arc::new(AtomicBool::new(true));
        let m = Machine::new(Arc::clone(&flag));
        assert_eq!(m.read(INTERRUPT_FLAG_ADDR), Ok(1));
        flag.store(false, AtomicOrdering::Relaxed);
        assert_eq!(m.read(INTERRUPT_FLAG_ADDR), Ok(0));
        assert_eq!(m.read(8), Err(MachineError::BadAddress(8)));
        assert_eq!(m.read(STACK_TOP - 4), Err(MachineError::BadAddress(STACK_TOP - 4)));
    }

    /// A single object of two words: its shape, then one writable word.
    struct OneObject(parking_lot::Mutex<[u64; 2]>);

    impl ObjectMemory for OneObject {
        fn load(&self, addr: u64) -> Option<u64> {
            let i = usize::try_from((addr.checked_sub(OBJECT_BASE)?) / 8).ok()?;
            self.0.lock().get(i).copied()
        }

        fn store(&self, addr: u64, val: u64) -> Option<()> {
            match addr.checked_sub(OBJECT_BASE)? {
                8 => {
                    self.0.lock()[1] = val;
                    Some(())
                }
                _ => None,
            }
        }
    }

    #[test]
    fn object_memory() {
        let mut asm = SimAssembler::new();
        asm.mov_imm(Reg(0), OBJECT_BASE);
        asm.mov_imm(Reg(1), 1);
        asm.lea(Reg(2), Addr::Index { base: Reg(0), index: Reg(1), scale: 8, off: 0 });
        asm.load(Reg(3), Addr::Base { base: Reg(0), off: 0 });
        asm.mov_imm(Reg(4), 99);
        asm.store(Reg(4), Addr::Base { base: Reg(2), off: 0 });
        asm.ret();
        let objects = Arc::new(OneObject(parking_lot::Mutex::new([7, 0])));
        let mut m = machine().with_objects(Arc::clone(&objects) as Arc<dyn ObjectMemory>);
        assert_eq!(run(asm, &mut m), Ok(MachineExit::EntryReturn));
        assert_eq!(m.gprs[2], OBJECT_BASE + 8);
        assert_eq!(m.gprs[3], 7);
        assert_eq!(*objects.0.lock(), [7, 99]);
        assert_eq!(
            m.write(OBJECT_BASE, 1),
            Err(MachineError::BadAddress(OBJECT_BASE))
        );
        // Without object memory, nothing is mapped there.
        assert_eq!(
            machine().read(OBJECT_BASE),
            Err(MachineError::BadAddress(OBJECT_BASE))
        );
    }

    #[test]
    fn stack_overflow() {
        let mut asm = SimAssembler::new();
        let top = asm.new_label();
        asm.bind(top);
        asm.push(Reg(0));
        asm.jump(top);
        let mut m = machine();
        assert_eq!(run(asm, &mut m), Err(MachineError::StackOverflow));
    }
}
