//! Code generation: allocated LIR to target code.
//!
//! Code is generated through the [Emitter] interface into a position independent
//! [CompiledFunction]: branches are relative, and the only absolute addresses in the code are
//! the runtime's (VM calls and the interrupt flag).
//!
//! A generated frame's body holds the register allocator's spill slots. The prologue reserves
//! it, the epilogue releases it; the arguments are read from the caller pushed header above.
//!
//! Every guard branches to a stub of its own at the end of the function. A stub calls the
//! shared bailout trampoline, so that the return address the trampoline finds at the top of the
//! stack identifies the guard: the bailout table maps that return address (as an offset into
//! the code) to the guard's snapshot. VM calls and interrupt checks are safepoints: the
//! safepoint table maps the call's return address to a snapshot the runtime can inspect while
//! the call is in progress.
//!
//! A property cache checks the receiver's tag and shape inline and reads or writes the slot
//! directly in object memory; a receiver of any other shape takes a VM call instead.

use crate::{
    bytecode::FuncId,
    compile::CompilationError,
    frame::{round_frame_size, FrameDescriptor, FrameKind, ARG_SIZE, HEADER_SIZE},
    lir::{
        regalloc::{Allocation, Location},
        LInst, LOp, LUse, LValue, LirFunction, Part, RegClass, SnapshotIdx, VReg,
    },
    mir::{BlockIdx, VmFunction},
    value::{ShapeId, Value, ValueType, OBJECT_SIZE},
};
use emit::{
    Addr, CmpKind, Cond, Emitter, FReg, Label, Reg, RegOrImm, FSCRATCH0, FSCRATCH1, RET_PAYLOAD,
    RET_TAG, SCRATCH0, SCRATCH1,
};
use jitsnap::{BailoutKind, Loc, Slot, SlotType, SnapshotOffset, SnapshotWriter};
use moves::{Move, Operand};
use sim::{SimAssembler, INTERRUPT_FLAG_ADDR, OBJECT_BASE, RUNTIME_CALL_BASE};
use std::{collections::HashMap, fmt};

pub(crate) mod emit;
pub(crate) mod moves;
pub(crate) mod sim;

/// One guard of a [CompiledFunction].
#[derive(Clone, Copy, Debug)]
pub(crate) struct BailoutEntry {
    /// The offset of the return address of the stub's call to the trampoline.
    pub ret_offset: u32,
    pub snapshot: SnapshotOffset,
    pub kind: BailoutKind,
}

/// One VM call or interrupt check of a [CompiledFunction].
#[derive(Clone, Copy, Debug)]
pub(crate) struct SafepointEntry {
    /// The offset of the call's return address.
    pub ret_offset: u32,
    pub snapshot: SnapshotOffset,
}

/// The output of a successful compilation, not yet installed anywhere.
pub struct CompiledFunction {
    pub(crate) func: FuncId,
    pub(crate) nargs: u16,
    pub(crate) code: Vec<u8>,
    /// The size of the frame body, padded to its size class.
    pub(crate) frame_size: u32,
    /// The snapshots bailouts decode.
    pub(crate) snapshots: Vec<u8>,
    /// The snapshots of safepoints.
    pub(crate) safepoint_snapshots: Vec<u8>,
    /// Sorted by `ret_offset`.
    pub(crate) bailouts: Vec<BailoutEntry>,
    /// Sorted by `ret_offset`.
    pub(crate) safepoints: Vec<SafepointEntry>,
    /// Doubles, strings, and objects referenced by snapshots.
    pub(crate) constants: Vec<Value>,
}

impl CompiledFunction {
    pub fn func(&self) -> FuncId {
        self.func
    }

    pub fn code_size(&self) -> usize {
        self.code.len()
    }

    pub fn frame_size(&self) -> u32 {
        self.frame_size
    }

    /// The encoded bailout snapshot table: empty for a function without guards.
    pub fn snapshot_table(&self) -> &[u8] {
        &self.snapshots
    }

    /// How many guards the function has.
    pub fn num_guards(&self) -> usize {
        self.bailouts.len()
    }

    pub fn disassemble(&self) -> String {
        sim::disassemble(&self.code)
    }
}

impl fmt::Debug for CompiledFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledFunction")
            .field("func", &self.func)
            .field("code_size", &self.code.len())
            .field("frame_size", &self.frame_size)
            .field("guards", &self.bailouts.len())
            .field("safepoints", &self.safepoints.len())
            .finish()
    }
}

pub(crate) fn generate(
    lir: &LirFunction,
    alloc: &Allocation,
) -> Result<CompiledFunction, CompilationError> {
    // Both sim targets share an encoding; they only differ in which templates lowering may use.
    let asm = SimAssembler::new();
    Codegen::new(lir, alloc, asm).run()
}

/// Return the vreg `v`'s location as a move operand.
fn operand(loc: Location, pushed: i32) -> Operand {
    match loc {
        Location::Reg(r) => Operand::Reg(r),
        Location::FReg(r) => Operand::FReg(r),
        Location::Stack(n) => Operand::Stack(slot_offset(n) + pushed),
    }
}

fn slot_offset(n: u32) -> i32 {
    (n * 8) as i32
}

struct Codegen<'a, E: Emitter> {
    lir: &'a LirFunction,
    alloc: &'a Allocation,
    asm: E,
    frame_size: u32,
    /// Bytes pushed below the frame body while a VM call is being set up.
    pushed: i32,
    blocks: HashMap<BlockIdx, Label>,
    /// Guard stubs still to be emitted: `(stub, snapshot)`.
    stubs: Vec<(Label, SnapshotIdx)>,
    /// Out of line interrupt calls still to be emitted: `(call, resume, snapshot)`.
    interrupts: Vec<(Label, Label, SnapshotIdx)>,
    bailout_snaps: SnapshotWriter,
    safepoint_snaps: SnapshotWriter,
    encoded_bailout: HashMap<SnapshotIdx, SnapshotOffset>,
    encoded_safepoint: HashMap<SnapshotIdx, SnapshotOffset>,
    bailouts: Vec<BailoutEntry>,
    safepoints: Vec<SafepointEntry>,
    constants: Vec<Value>,
}

impl<'a, E: Emitter> Codegen<'a, E> {
    fn new(lir: &'a LirFunction, alloc: &'a Allocation, asm: E) -> Self {
        Self {
            lir,
            alloc,
            asm,
            frame_size: round_frame_size(alloc.frame_size()),
            pushed: 0,
            blocks: HashMap::new(),
            stubs: Vec::new(),
            interrupts: Vec::new(),
            bailout_snaps: SnapshotWriter::new(),
            safepoint_snaps: SnapshotWriter::new(),
            encoded_bailout: HashMap::new(),
            encoded_safepoint: HashMap::new(),
            bailouts: Vec::new(),
            safepoints: Vec::new(),
            constants: Vec::new(),
        }
    }

    fn run(mut self) -> Result<CompiledFunction, CompilationError> {
        let lir = self.lir;
        for b in &lir.order {
            let l = self.asm.new_label();
            self.blocks.insert(*b, l);
        }
        let frame = i32::try_from(self.frame_size).map_err(|_| {
            CompilationError::LimitExceeded(format!("frame of {} bytes", self.frame_size))
        })?;
        self.asm.add_sp(-frame);
        for (i, b) in lir.order.iter().enumerate() {
            self.asm.bind(self.blocks[b]);
            let next = lir.order.get(i + 1).copied();
            for inst in &lir.blocks[*b] {
                self.inst(inst, next)?;
            }
        }
        self.out_of_line()?;

        let code = self
            .asm
            .finish()
            .map_err(|e| CompilationError::InternalError(format!("assembler: {e}")))?;
        self.bailouts.sort_by_key(|b| b.ret_offset);
        self.safepoints.sort_by_key(|s| s.ret_offset);
        Ok(CompiledFunction {
            func: self.lir.func,
            nargs: self.lir.nargs,
            code,
            frame_size: self.frame_size,
            snapshots: self.bailout_snaps.finish(),
            safepoint_snapshots: self.safepoint_snaps.finish(),
            bailouts: self.bailouts,
            safepoints: self.safepoints,
            constants: self.constants,
        })
    }

    fn loc(&self, v: VReg) -> Location {
        self.alloc.loc(v)
    }

    fn offset(&self) -> Result<u32, CompilationError> {
        u32::try_from(self.asm.offset())
            .map_err(|_| CompilationError::LimitExceeded("code exceeds 4GiB".to_owned()))
    }

    /// Put the general purpose operand `u` in a register, using `scratch` if need be.
    fn gpr(&mut self, u: LUse, scratch: Reg) -> Reg {
        match u {
            LUse::Imm(x) => {
                self.asm.mov_imm(scratch, x);
                scratch
            }
            LUse::VReg(v, _) => match self.loc(v) {
                Location::Reg(r) => r,
                Location::Stack(n) => {
                    self.asm.load(scratch, Addr::Sp(slot_offset(n) + self.pushed));
                    scratch
                }
                Location::FReg(r) => {
                    self.asm.fmov_to_bits(scratch, r);
                    scratch
                }
            },
        }
    }

    /// Put the float operand `u` in a register, using `scratch` if need be.
    fn fpr(&mut self, u: LUse, scratch: FReg) -> FReg {
        match u {
            LUse::Imm(x) => {
                self.asm.mov_imm(SCRATCH1, x);
                self.asm.fmov_from_bits(scratch, SCRATCH1);
                scratch
            }
            LUse::VReg(v, _) => match self.loc(v) {
                Location::FReg(r) => r,
                Location::Stack(n) => {
                    self.asm.fload(scratch, Addr::Sp(slot_offset(n) + self.pushed));
                    scratch
                }
                Location::Reg(r) => {
                    self.asm.fmov_from_bits(scratch, r);
                    scratch
                }
            },
        }
    }

    /// The right hand side of a 32-bit operation.
    fn rhs32(&mut self, u: LUse) -> RegOrImm {
        match u {
            LUse::Imm(x) => RegOrImm::Imm(x as u32 as i32),
            u => RegOrImm::Reg(self.gpr(u, SCRATCH1)),
        }
    }

    /// The right hand side of a 64-bit comparison.
    fn rhs64(&mut self, u: LUse) -> RegOrImm {
        match u {
            LUse::Imm(x) if i32::try_from(x as i64).is_ok() => RegOrImm::Imm(x as i64 as i32),
            u => RegOrImm::Reg(self.gpr(u, SCRATCH1)),
        }
    }

    /// The register to compute the general purpose vreg `v` into.
    fn def_gpr(&self, v: VReg) -> Reg {
        match self.loc(v) {
            Location::Reg(r) => r,
            _ => SCRATCH0,
        }
    }

    fn def_fpr(&self, v: VReg) -> FReg {
        match self.loc(v) {
            Location::FReg(r) => r,
            _ => FSCRATCH0,
        }
    }

    /// Store a value computed into `r` by [Self::def_gpr] if `v` lives on the stack.
    fn finish_gpr(&mut self, v: VReg, r: Reg) {
        if let Location::Stack(n) = self.loc(v) {
            self.asm.store(r, Addr::Sp(slot_offset(n) + self.pushed));
        }
    }

    fn finish_fpr(&mut self, v: VReg, r: FReg) {
        if let Location::Stack(n) = self.loc(v) {
            self.asm.fstore(r, Addr::Sp(slot_offset(n) + self.pushed));
        }
    }

    fn snapshot(inst: &LInst) -> Result<SnapshotIdx, CompilationError> {
        inst.snapshot.ok_or_else(|| {
            CompilationError::InternalError(format!("{} has no snapshot", inst.op))
        })
    }

    fn guard_stub(&mut self, snap: SnapshotIdx) -> Label {
        let l = self.asm.new_label();
        self.stubs.push((l, snap));
        l
    }

    fn inst(&mut self, inst: &LInst, next: Option<BlockIdx>) -> Result<(), CompilationError> {
        let u = |i: usize| inst.uses[i];
        match &inst.op {
            LOp::Param(i) => {
                let base = self.frame_size as i32 + HEADER_SIZE as i32 + ARG_SIZE as i32 * i32::from(*i);
                for (k, v) in inst.defs.iter().enumerate() {
                    let r = self.def_gpr(*v);
                    self.asm.load(r, Addr::Sp(base + 8 * k as i32));
                    self.finish_gpr(*v, r);
                }
            }
            LOp::Const(x) => {
                let v = inst.defs[0];
                match self.lir.class(v) {
                    RegClass::General => {
                        let r = self.def_gpr(v);
                        self.asm.mov_imm(r, *x);
                        self.finish_gpr(v, r);
                    }
                    RegClass::Float => {
                        let r = self.def_fpr(v);
                        self.asm.mov_imm(SCRATCH1, *x);
                        self.asm.fmov_from_bits(r, SCRATCH1);
                        self.finish_fpr(v, r);
                    }
                }
            }
            LOp::CheckTag(ty) => {
                let stub = self.guard_stub(Self::snapshot(inst)?);
                let tag = self.gpr(u(0), SCRATCH0);
                self.asm.cmp64(tag, RegOrImm::Imm(*ty as i32));
                self.asm.branch(Cond::Ne, stub);
            }
            LOp::UnboxDouble => {
                let stub = self.guard_stub(Self::snapshot(inst)?);
                let tag = self.gpr(u(0), SCRATCH0);
                let payload = self.gpr(u(1), SCRATCH1);
                let d = inst.defs[0];
                let r = self.def_fpr(d);
                let not_double = self.asm.new_label();
                let done = self.asm.new_label();
                self.asm.cmp64(tag, RegOrImm::Imm(ValueType::Double as i32));
                self.asm.branch(Cond::Ne, not_double);
                self.asm.fmov_from_bits(r, payload);
                self.asm.jump(done);
                self.asm.bind(not_double);
                self.asm.cmp64(tag, RegOrImm::Imm(ValueType::Int32 as i32));
                self.asm.branch(Cond::Ne, stub);
                self.asm.cvt_i32_to_f64(r, payload);
                self.asm.bind(done);
                self.finish_fpr(d, r);
            }
            LOp::Alu32 { op, checked } => {
                let lhs = self.gpr(u(0), SCRATCH0);
                let rhs = self.rhs32(u(1));
                let d = inst.defs[0];
                let r = self.def_gpr(d);
                self.asm.alu32(*op, r, lhs, rhs);
                if *checked {
                    let stub = self.guard_stub(Self::snapshot(inst)?);
                    self.asm.branch(Cond::Overflow, stub);
                }
                self.finish_gpr(d, r);
            }
            LOp::FAlu(op) => {
                let lhs = self.fpr(u(0), FSCRATCH0);
                let rhs = self.fpr(u(1), FSCRATCH1);
                let d = inst.defs[0];
                let r = self.def_fpr(d);
                self.asm.falu(*op, r, lhs, rhs);
                self.finish_fpr(d, r);
            }
            LOp::Int32ToDouble => {
                let src = self.gpr(u(0), SCRATCH0);
                let d = inst.defs[0];
                let r = self.def_fpr(d);
                self.asm.cvt_i32_to_f64(r, src);
                self.finish_fpr(d, r);
            }
            LOp::DoubleToBits => {
                let src = self.fpr(u(0), FSCRATCH0);
                let d = inst.defs[0];
                let r = self.def_gpr(d);
                self.asm.fmov_to_bits(r, src);
                self.finish_gpr(d, r);
            }
            LOp::Compare { kind, cond } => {
                match kind {
                    CmpKind::I32 => {
                        let lhs = self.gpr(u(0), SCRATCH0);
                        let rhs = self.rhs32(u(1));
                        self.asm.cmp32(lhs, rhs);
                    }
                    CmpKind::W64 => {
                        let lhs = self.gpr(u(0), SCRATCH0);
                        let rhs = self.rhs64(u(1));
                        self.asm.cmp64(lhs, rhs);
                    }
                    CmpKind::F64 => {
                        let lhs = self.fpr(u(0), FSCRATCH0);
                        let rhs = self.fpr(u(1), FSCRATCH1);
                        self.asm.fcmp(lhs, rhs);
                    }
                }
                let d = inst.defs[0];
                let r = self.def_gpr(d);
                self.asm.set_cond(*cond, r);
                self.finish_gpr(d, r);
            }
            LOp::CallVm(f) => self.call_vm(inst, *f)?,
            LOp::PropertyCache { func, shape, slot } => {
                self.property_cache(inst, *func, *shape, *slot)?
            }
            LOp::InterruptCheck => {
                let call = self.asm.new_label();
                let resume = self.asm.new_label();
                self.asm.load(SCRATCH0, Addr::Abs(INTERRUPT_FLAG_ADDR));
                self.asm.cmp64(SCRATCH0, RegOrImm::Imm(0));
                self.asm.branch(Cond::Ne, call);
                self.asm.bind(resume);
                self.interrupts.push((call, resume, Self::snapshot(inst)?));
            }
            LOp::ParallelMove => {
                let moves = inst
                    .defs
                    .iter()
                    .zip(inst.uses.iter())
                    .map(|(d, s)| Move {
                        dst: operand(self.loc(*d), self.pushed),
                        src: match s {
                            LUse::Imm(x) => Operand::Imm(*x),
                            LUse::VReg(v, _) => operand(self.loc(*v), self.pushed),
                        },
                        float: self.lir.class(*d) == RegClass::Float,
                    })
                    .collect::<Vec<_>>();
                moves::emit_parallel(&mut self.asm, &moves);
            }
            LOp::Jump(b) => {
                if next != Some(*b) {
                    self.asm.jump(self.blocks[b]);
                }
            }
            LOp::Branch { if_true, if_false } => {
                let c = self.gpr(u(0), SCRATCH0);
                self.asm.cmp64(c, RegOrImm::Imm(0));
                if next == Some(*if_true) {
                    self.asm.branch(Cond::Eq, self.blocks[if_false]);
                } else {
                    self.asm.branch(Cond::Ne, self.blocks[if_true]);
                    if next != Some(*if_false) {
                        self.asm.jump(self.blocks[if_false]);
                    }
                }
            }
            LOp::Return => {
                let moves = [(RET_TAG, u(0)), (RET_PAYLOAD, u(1))]
                    .into_iter()
                    .map(|(r, s)| Move {
                        dst: Operand::Reg(r),
                        src: match s {
                            LUse::Imm(x) => Operand::Imm(x),
                            LUse::VReg(v, _) => operand(self.loc(v), self.pushed),
                        },
                        float: false,
                    })
                    .collect::<Vec<_>>();
                moves::emit_parallel(&mut self.asm, &moves);
                self.asm.add_sp(self.frame_size as i32);
                self.asm.ret();
            }
        }
        Ok(())
    }

    /// Push the header of a call to the runtime function `f` and call it, leaving the stack
    /// as it was. The arguments, if any, must already have been pushed.
    fn runtime_call(&mut self, f: VmFunction, argc: usize) -> Result<u32, CompilationError> {
        self.asm.mov_imm(SCRATCH0, argc as u64);
        self.asm.push(SCRATCH0);
        self.asm.mov_imm(
            SCRATCH0,
            FrameDescriptor::new(FrameKind::Normal, self.frame_size).encode(),
        );
        self.asm.push(SCRATCH0);
        self.pushed += 16;
        self.asm.mov_imm(SCRATCH1, RUNTIME_CALL_BASE + f.to_id());
        self.asm.call_reg(SCRATCH1);
        let ret = self.offset()?;
        self.asm.add_sp(self.pushed);
        self.pushed = 0;
        Ok(ret)
    }

    fn call_vm(&mut self, inst: &LInst, f: VmFunction) -> Result<(), CompilationError> {
        let snap = Self::snapshot(inst)?;
        let argc = inst.uses.len() / 2;
        for i in (0..argc).rev() {
            for u in [inst.uses[2 * i + 1], inst.uses[2 * i]] {
                let r = self.gpr(u, SCRATCH0);
                self.asm.push(r);
                self.pushed += 8;
            }
        }
        let ret = self.runtime_call(f, argc)?;
        let snapshot = self.encode_safepoint(snap)?;
        self.safepoints.push(SafepointEntry {
            ret_offset: ret,
            snapshot,
        });
        let moves = [RET_TAG, RET_PAYLOAD]
            .into_iter()
            .zip(inst.defs.iter())
            .map(|(r, d)| Move {
                dst: operand(self.loc(*d), 0),
                src: Operand::Reg(r),
                float: false,
            })
            .collect::<Vec<_>>();
        moves::emit_parallel(&mut self.asm, &moves);
        Ok(())
    }

    /// Access slot `slot` of the object `uses[0..2]` in place if it is an object of `shape`, and
    /// call `f` otherwise.
    fn property_cache(
        &mut self,
        inst: &LInst,
        f: VmFunction,
        shape: ShapeId,
        slot: u32,
    ) -> Result<(), CompilationError> {
        let shape = i32::try_from(shape.raw())
            .map_err(|_| CompilationError::LimitExceeded("too many shapes".to_owned()))?;
        let miss = self.asm.new_label();
        let done = self.asm.new_label();
        let tag = self.gpr(inst.uses[0], SCRATCH0);
        self.asm.cmp64(tag, RegOrImm::Imm(ValueType::Object as i32));
        self.asm.branch(Cond::Ne, miss);
        let obj = self.gpr(inst.uses[1], SCRATCH0);
        self.asm.mov_imm(SCRATCH1, OBJECT_BASE);
        self.asm.lea(
            SCRATCH1,
            Addr::Index {
                base: SCRATCH1,
                index: obj,
                scale: OBJECT_SIZE as u8,
                off: 0,
            },
        );
        self.asm.load(SCRATCH0, Addr::Base { base: SCRATCH1, off: 0 });
        self.asm.cmp64(SCRATCH0, RegOrImm::Imm(shape));
        self.asm.branch(Cond::Ne, miss);
        // Slot `slot` is a tag word then a payload word, after the shape word.
        let off = 8 + 16 * slot as i32;
        if inst.defs.is_empty() {
            for k in 0..2 {
                let r = self.gpr(inst.uses[2 + k], SCRATCH0);
                let off = off + 8 * k as i32;
                self.asm.store(r, Addr::Base { base: SCRATCH1, off });
            }
        } else {
            for (k, d) in inst.defs.iter().enumerate() {
                let r = self.def_gpr(*d);
                let off = off + 8 * k as i32;
                self.asm.load(r, Addr::Base { base: SCRATCH1, off });
                self.finish_gpr(*d, r);
            }
        }
        self.asm.jump(done);
        self.asm.bind(miss);
        self.call_vm(inst, f)?;
        self.asm.bind(done);
        Ok(())
    }

    fn out_of_line(&mut self) -> Result<(), CompilationError> {
        for (call, resume, snap) in std::mem::take(&mut self.interrupts) {
            self.asm.bind(call);
            let ret = self.runtime_call(VmFunction::Interrupt, 0)?;
            let snapshot = self.encode_safepoint(snap)?;
            self.safepoints.push(SafepointEntry {
                ret_offset: ret,
                snapshot,
            });
            self.asm.jump(resume);
        }
        if self.stubs.is_empty() {
            return Ok(());
        }
        let trampoline = self.asm.new_label();
        for (stub, snap) in std::mem::take(&mut self.stubs) {
            self.asm.bind(stub);
            self.asm.call_label(trampoline);
            let ret_offset = self.offset()?;
            let kind = self.lir.snapshots[snap].kind;
            let snapshot = self.encode_bailout(snap)?;
            self.bailouts.push(BailoutEntry {
                ret_offset,
                snapshot,
                kind,
            });
        }
        self.asm.bind(trampoline);
        self.asm.bailout_exit();
        Ok(())
    }

    fn encode_bailout(&mut self, snap: SnapshotIdx) -> Result<SnapshotOffset, CompilationError> {
        if let Some(off) = self.encoded_bailout.get(&snap) {
            return Ok(*off);
        }
        let mut w = std::mem::replace(&mut self.bailout_snaps, SnapshotWriter::new());
        let r = self.encode(&mut w, snap);
        self.bailout_snaps = w;
        let off = r?;
        self.encoded_bailout.insert(snap, off);
        Ok(off)
    }

    fn encode_safepoint(&mut self, snap: SnapshotIdx) -> Result<SnapshotOffset, CompilationError> {
        if let Some(off) = self.encoded_safepoint.get(&snap) {
            return Ok(*off);
        }
        let mut w = std::mem::replace(&mut self.safepoint_snaps, SnapshotWriter::new());
        let r = self.encode(&mut w, snap);
        self.safepoint_snaps = w;
        let off = r?;
        self.encoded_safepoint.insert(snap, off);
        Ok(off)
    }

    fn encode(
        &mut self,
        w: &mut SnapshotWriter,
        snap: SnapshotIdx,
    ) -> Result<SnapshotOffset, CompilationError> {
        let lir = self.lir;
        let s = &lir.snapshots[snap];
        // Work out every slot first, so that an error leaves the writer untouched.
        let mut frames = Vec::with_capacity(s.frames.len());
        for fr in &s.frames {
            let slots = fr
                .slots
                .iter()
                .map(|v| self.slot(*v))
                .collect::<Result<Vec<_>, _>>()?;
            frames.push((fr.func.raw(), fr.pc, slots));
        }
        let off = w.start_snapshot(frames.len() as u32, s.kind);
        for (func, pc, slots) in frames {
            w.start_frame(func, pc, slots.len() as u32);
            for sl in &slots {
                w.add_slot(sl);
            }
            w.end_frame();
        }
        w.end_snapshot();
        Ok(off)
    }

    fn snap_loc(&self, v: VReg) -> Loc {
        match self.loc(v) {
            Location::Reg(r) => Loc::Reg(r.0),
            Location::FReg(r) => Loc::FloatReg(r.0),
            Location::Stack(n) => Loc::Stack(n * 8),
        }
    }

    fn constant(&mut self, v: Value) -> u32 {
        let i = match self
            .constants
            .iter()
            .position(|c| c.to_bits() == v.to_bits())
        {
            Some(i) => i,
            None => {
                self.constants.push(v);
                self.constants.len() - 1
            }
        };
        i as u32
    }

    fn const_slot(&mut self, v: Value) -> Slot {
        match v {
            Value::Undefined => Slot::Undefined,
            Value::Null => Slot::Null,
            Value::Boolean(b) => Slot::Boolean(b),
            Value::Int32(x) => Slot::Int32(x),
            v => Slot::Constant(self.constant(v)),
        }
    }

    fn slot(&mut self, v: LValue) -> Result<Slot, CompilationError> {
        Ok(match v {
            LValue::Const(c) => self.const_slot(c),
            LValue::Word(r, ty) => match slot_type(ty) {
                Some(ty) => Slot::Typed {
                    ty,
                    loc: self.snap_loc(r),
                },
                None => self.const_slot(Value::from_payload(ty, 0)),
            },
            LValue::Float(r) => Slot::Typed {
                ty: SlotType::Double,
                loc: self.snap_loc(r),
            },
            LValue::Boxed(Part::VReg(t), Part::VReg(p)) => Slot::Boxed {
                tag: self.snap_loc(t),
                payload: self.snap_loc(p),
            },
            LValue::Boxed(Part::Const(t), Part::VReg(p)) => {
                let ty = u8::try_from(t)
                    .ok()
                    .and_then(ValueType::from_repr)
                    .ok_or_else(|| CompilationError::InternalError(format!("bad tag {t}")))?;
                match slot_type(ty) {
                    Some(ty) => Slot::Typed {
                        ty,
                        loc: self.snap_loc(p),
                    },
                    None => self.const_slot(Value::from_payload(ty, 0)),
                }
            }
            LValue::Boxed(Part::Const(t), Part::Const(p)) => match Value::from_bits(t, p) {
                Some(c) => self.const_slot(c),
                None => {
                    return Err(CompilationError::InternalError(format!("bad tag {t}")))
                }
            },
            LValue::Boxed(Part::VReg(_), Part::Const(_)) => {
                return Err(CompilationError::InternalError(
                    "boxed value with a constant payload and unknown tag".to_owned(),
                ))
            }
        })
    }
}

fn slot_type(ty: ValueType) -> Option<SlotType> {
    match ty {
        ValueType::Undefined | ValueType::Null => None,
        ValueType::Boolean => Some(SlotType::Boolean),
        ValueType::Int32 => Some(SlotType::Int32),
        ValueType::Double => Some(SlotType::Double),
        ValueType::String => Some(SlotType::String),
        ValueType::Object => Some(SlotType::Object),
    }
}

/// Generate the argument rectifier: a stub that pads a call with fewer arguments than the
/// callee declares with `undefined`s. The runtime enters it, in place of the callee, with the
/// callee's address in `r2` and its declared argument count in `r3`. The callee sees a
/// rectifier frame as its caller.
pub(crate) fn rectifier() -> Result<Vec<u8>, CompilationError> {
    let mut asm = SimAssembler::new();
    let (target, nargs) = (Reg(2), Reg(3));
    let (argc, i, w, frame) = (Reg(4), Reg(5), Reg(6), Reg(7));
    asm.lea(frame, Addr::Sp(0));
    asm.load(argc, Addr::Base { base: frame, off: 16 });

    // Arguments are pushed last to first: first the padding...
    let pad = asm.new_label();
    let copy = asm.new_label();
    asm.mov(i, nargs);
    asm.bind(pad);
    asm.cmp64(i, RegOrImm::Reg(argc));
    asm.branch(Cond::Le, copy);
    asm.mov_imm(w, 0);
    asm.push(w);
    asm.mov_imm(w, ValueType::Undefined as u64);
    asm.push(w);
    asm.alu32(emit::AluOp::Sub, i, i, RegOrImm::Imm(1));
    asm.jump(pad);

    // ...then the actual arguments.
    let copy_loop = asm.new_label();
    let call = asm.new_label();
    asm.bind(copy);
    asm.mov(i, argc);
    asm.bind(copy_loop);
    asm.cmp64(i, RegOrImm::Imm(0));
    asm.branch(Cond::Le, call);
    asm.alu32(emit::AluOp::Sub, i, i, RegOrImm::Imm(1));
    for off in [HEADER_SIZE as i32 + 8, HEADER_SIZE as i32] {
        asm.load(
            w,
            Addr::Index {
                base: frame,
                index: i,
                scale: ARG_SIZE as u8,
                off,
            },
        );
        asm.push(w);
    }
    asm.jump(copy_loop);

    asm.bind(call);
    asm.push(nargs);
    asm.mov_imm(w, FrameDescriptor::new(FrameKind::Rectifier, 0).encode());
    asm.push(w);
    asm.call_reg(target);
    // Pop the header and the arguments, however many the callee was given.
    asm.load(w, Addr::Sp(8));
    asm.alu32(emit::AluOp::Mul, w, w, RegOrImm::Imm(ARG_SIZE as i32));
    asm.alu32(emit::AluOp::Add, w, w, RegOrImm::Imm(16));
    asm.add_sp_reg(w);
    asm.ret();
    asm.finish()
        .map_err(|e| CompilationError::InternalError(format!("assembler: {e}")))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        bytecode::{Op, Program, ScriptBuilder},
        compile::{compile, CompileContext},
        options::JitOptions,
        oracle::ProfileOracle,
        testing::assert_matches,
        value::{Heap, TypeSet},
    };
    use sim::{
        machine::{CodeSource, Machine, MachineExit, ObjectMemory},
        CODE_BASE, ENTRY_RETURN,
    };
    use std::sync::{atomic::AtomicBool, Arc};

    const RECTIFIER_BASE: u64 = CODE_BASE + 0x10_0000;

    struct Code {
        func: Vec<u8>,
        rectifier: Vec<u8>,
    }

    impl CodeSource for Code {
        fn code_at(&self, addr: u64) -> Option<&[u8]> {
            if addr >= RECTIFIER_BASE {
                self.rectifier.get(usize::try_from(addr - RECTIFIER_BASE).ok()?..)
            } else {
                self.func.get(usize::try_from(addr.checked_sub(CODE_BASE)?).ok()?..)
            }
        }
    }

    fn int_add() -> (Program, ProfileOracle) {
        let mut b = ScriptBuilder::new("add", 2, 0);
        b.ops(&[Op::GetArg(0), Op::GetArg(1), Op::Add, Op::Return]);
        let program = Program::new(vec![b.build().unwrap()]).unwrap();
        let f = FuncId::from_raw(0);
        let mut oracle = ProfileOracle::new(&program);
        oracle.set_arg(f, 0, TypeSet::single(ValueType::Int32));
        oracle.set_arg(f, 1, TypeSet::single(ValueType::Int32));
        oracle.set(f, 2, TypeSet::single(ValueType::Int32));
        (program, oracle)
    }

    fn compile_f0(program: &Program, oracle: &ProfileOracle) -> CompiledFunction {
        let opts = JitOptions::default();
        let ctx = CompileContext {
            program,
            oracle,
            options: &opts,
        };
        compile(&ctx, FuncId::from_raw(0)).unwrap()
    }

    /// Call the code at `pc` the way the runtime's entry does.
    fn call(m: &mut Machine, code: &Code, pc: u64, args: &[Value]) -> MachineExit {
        for a in args.iter().rev() {
            let (tag, payload) = a.to_bits();
            m.push(payload).unwrap();
            m.push(tag).unwrap();
        }
        m.push(args.len() as u64).unwrap();
        m.push(FrameDescriptor::new(FrameKind::Entry, 0).encode())
            .unwrap();
        m.push(ENTRY_RETURN).unwrap();
        m.set_pc(pc);
        m.run(code).unwrap()
    }

    fn result(m: &Machine) -> Option<Value> {
        Value::from_bits(m.gprs[0], m.gprs[1])
    }

    #[test]
    fn int_add_and_its_overflow_guard() {
        let (program, oracle) = int_add();
        let cf = compile_f0(&program, &oracle);
        assert_matches(
            "...
...: add sp, -32
...
...: add32 ...
...: b.overflow ...
...
...: add sp, 32
...: ret
...
...: bailout
",
            &cf.disassemble(),
        );
        // Two argument checks and the overflow check, all at distinct return addresses.
        assert_eq!(cf.num_guards(), 3);
        let kinds = cf.bailouts.iter().map(|b| b.kind).collect::<Vec<_>>();
        assert!(kinds.contains(&BailoutKind::Overflow));
        assert!(kinds.contains(&BailoutKind::ArgumentCheck));
        assert!(cf.safepoints.is_empty());

        let code = Code {
            func: cf.code.clone(),
            rectifier: Vec::new(),
        };
        let mut m = Machine::new(Arc::new(AtomicBool::new(false)));
        let exit = call(&mut m, &code, CODE_BASE, &[Value::Int32(2), Value::Int32(40)]);
        assert_eq!(exit, MachineExit::EntryReturn);
        assert_eq!(result(&m), Some(Value::Int32(42)));

        let mut m = Machine::new(Arc::new(AtomicBool::new(false)));
        let exit = call(
            &mut m,
            &code,
            CODE_BASE,
            &[Value::Int32(i32::MAX), Value::Int32(1)],
        );
        assert_eq!(exit, MachineExit::Bailout);
        let ret = m.read(m.sp()).unwrap() - CODE_BASE;
        let site = cf
            .bailouts
            .iter()
            .find(|b| u64::from(b.ret_offset) == ret)
            .unwrap();
        assert_eq!(site.kind, BailoutKind::Overflow);
        let snap = jitsnap::decode(&cf.snapshots, site.snapshot).unwrap();
        assert_eq!(snap.frames.len(), 1);
        assert_eq!(snap.frames[0].0.pc, 2);
    }

    #[test]
    fn guard_free_functions_have_no_snapshots() {
        let mut b = ScriptBuilder::new("seven", 0, 0);
        b.ops(&[Op::Int(7), Op::Return]);
        let program = Program::new(vec![b.build().unwrap()]).unwrap();
        let oracle = ProfileOracle::new(&program);
        let cf = compile_f0(&program, &oracle);
        assert_eq!(cf.num_guards(), 0);
        assert!(cf.snapshot_table().is_empty());
        assert!(!cf.disassemble().contains("bailout"));

        let code = Code {
            func: cf.code.clone(),
            rectifier: Vec::new(),
        };
        let mut m = Machine::new(Arc::new(AtomicBool::new(false)));
        assert_eq!(call(&mut m, &code, CODE_BASE, &[]), MachineExit::EntryReturn);
        assert_eq!(result(&m), Some(Value::Int32(7)));
    }

    #[test]
    fn rectifier_pads_missing_arguments() {
        // Return the second argument, which the caller does not pass.
        let mut b = ScriptBuilder::new("second", 2, 0);
        b.ops(&[Op::GetArg(1), Op::Return]);
        let program = Program::new(vec![b.build().unwrap()]).unwrap();
        let oracle = ProfileOracle::new(&program);
        let cf = compile_f0(&program, &oracle);
        let code = Code {
            func: cf.code.clone(),
            rectifier: rectifier().unwrap(),
        };
        let mut m = Machine::new(Arc::new(AtomicBool::new(false)));
        m.gprs[2] = CODE_BASE;
        m.gprs[3] = 2;
        let sp = m.sp();
        let exit = call(&mut m, &code, RECTIFIER_BASE, &[Value::Int32(1)]);
        assert_eq!(exit, MachineExit::EntryReturn);
        assert_eq!(result(&m), Some(Value::Undefined));
        // Everything but the entry's own header and arguments was popped.
        assert_eq!(m.sp(), sp - 8 * 4);
    }

    #[test]
    fn property_caches_hit_in_place_and_miss_to_the_runtime() {
        // f(o, v) { o.x = v; return o.x }
        let mut b = ScriptBuilder::new("f", 2, 0);
        b.ops(&[Op::GetArg(0), Op::GetArg(1)]).set_prop("x");
        b.op(Op::GetArg(0)).get_prop("x").op(Op::Return);
        let program = Program::new(vec![b.build().unwrap()]).unwrap();
        let mut heap = Heap::new();
        let x = heap.intern("x");
        let (p, q) = (heap.new_object("Point"), heap.new_object("Point"));
        heap.set_property(Value::Object(p), x, Value::Int32(5));
        let shape = heap.object(p).shape;
        let y = heap.intern("y");
        heap.set_property(Value::Object(q), y, Value::Int32(1));
        heap.set_property(Value::Object(q), x, Value::Int32(2));
        let f = FuncId::from_raw(0);
        let mut oracle = ProfileOracle::new(&program);
        oracle.observe_shape(f, 2, shape, Some(0));
        oracle.observe_shape(f, 4, shape, Some(0));
        let cf = compile_f0(&program, &oracle);
        assert_eq!(cf.safepoints.len(), 2);
        assert!(cf.disassemble().contains(&format!("mov r15, {OBJECT_BASE:#x}")));
        let code = Code {
            func: cf.code.clone(),
            rectifier: Vec::new(),
        };
        let heap = Arc::new(parking_lot::Mutex::new(heap));
        let machine = || {
            Machine::new(Arc::new(AtomicBool::new(false)))
                .with_objects(Arc::clone(&heap) as Arc<dyn ObjectMemory>)
        };

        // The store and the load both hit.
        let mut m = machine();
        let exit = call(&mut m, &code, CODE_BASE, &[Value::Object(p), Value::Double(0.5)]);
        assert_eq!(exit, MachineExit::EntryReturn);
        assert_eq!(result(&m), Some(Value::Double(0.5)));
        assert_eq!(heap.lock().get_property(Value::Object(p), x), Value::Double(0.5));

        // Another shape, or no object at all, goes to the runtime.
        let set = VmFunction::SetProp { name: x }.to_id();
        for o in [Value::Object(q), Value::Int32(3)] {
            let mut m = machine();
            assert_eq!(
                call(&mut m, &code, CODE_BASE, &[o, Value::Null]),
                MachineExit::VmCall(set)
            );
            let ret = m.read(m.sp() + 8).unwrap() - CODE_BASE;
            assert!(cf.safepoints.iter().any(|s| u64::from(s.ret_offset) == ret));
        }
        assert_eq!(heap.lock().get_property(Value::Object(q), x), Value::Int32(2));
    }
}
