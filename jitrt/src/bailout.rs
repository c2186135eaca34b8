//! The bailout engine: from a failed guard back to the interpreter.
//!
//! When a guard fails, generated code calls the bailout trampoline, which leaves the machine
//! with the guard's return address on top of the stack. That address identifies the guard, and
//! so its snapshot. The snapshot is decoded against the machine's registers and the generated
//! frame to yield one interpreter frame per (possibly inlined) function, oldest first, which the
//! interpreter then runs to completion.
//!
//! Each guard is a small state machine:
//!
//! ```text
//! Armed -> Triggered -> Resolving -> Reconstructed -> Resumed -> Armed
//!                           |
//!                           +-> Fatal
//! ```
//!
//! Before resuming, the guard's [BailoutKind] decides how the type predictions are updated so
//! that the next compilation does not make the same mistake.

use crate::{
    bytecode::{FuncId, Op, Program},
    codegen::sim::machine::Machine,
    frame::{FrameError, StackMemory},
    interp::InterpFrame,
    ops,
    oracle::ProfileOracle,
    value::{Value, ValueType},
};
use jitsnap::{BailoutKind, Loc, Slot, SlotType, SnapshotError, SnapshotOffset, SnapshotReader};
use strum::Display;
use thiserror::Error;

/// The state of one guard.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub(crate) enum SiteState {
    /// The guard's jump to the trampoline is in place.
    Armed,
    /// The guard failed.
    Triggered,
    /// The snapshot is being decoded against the machine state.
    Resolving,
    /// Equivalent interpreter frames have been built.
    Reconstructed,
    /// Control has been handed to the interpreter.
    Resumed,
    /// Reconstruction failed: the guard can never be resumed from.
    Fatal,
}

impl SiteState {
    /// Move to `next`.
    ///
    /// # Panics
    ///
    /// If the transition is not one of the state machine's edges.
    pub(crate) fn advance(&mut self, next: SiteState) {
        use SiteState::*;
        let ok = matches!(
            (*self, next),
            (Armed, Triggered)
                | (Triggered, Resolving)
                | (Resolving, Reconstructed)
                | (Resolving, Fatal)
                | (Reconstructed, Resumed)
                | (Resumed, Armed)
        );
        assert!(ok, "illegal guard transition {self} -> {next}");
        *self = next;
    }
}

/// What the runtime does after a bailout.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum BailoutResult {
    /// Resume where the guard was, predictions unchanged or relaxed at that point.
    #[strum(to_string = "resume-normal")]
    ResumeNormal,
    /// Resume after widening the prediction of the value that failed the type barrier.
    #[strum(to_string = "resume-after-type-widen")]
    ResumeAfterTypeWiden,
    /// Resume after recording the actual argument types.
    #[strum(to_string = "resume-after-argument-recheck")]
    ResumeAfterArgumentRecheck,
    /// The interpreter frames could not be built.
    #[strum(to_string = "fatal")]
    Fatal,
}

/// A record of one bailout, for diagnostics and tests.
#[derive(Clone, Debug, PartialEq)]
pub struct BailoutReport {
    /// The function whose generated code bailed out.
    pub func: FuncId,
    pub kind: BailoutKind,
    pub result: BailoutResult,
    /// The reconstructed frames, outermost first. Empty if reconstruction failed.
    pub frames: Vec<InterpFrame>,
    /// Did the bailout widen a prediction?
    pub widened: bool,
    /// Did the bailout invalidate the generated code?
    pub invalidated: bool,
}

#[derive(Debug, Error, PartialEq)]
pub enum BailoutError {
    #[error("malformed snapshot: {0}")]
    Snapshot(#[from] SnapshotError),
    #[error("unreadable frame: {0}")]
    Frame(#[from] FrameError),
    #[error("no guard returns to {0:#x}")]
    NoGuard(u64),
    #[error("constant {0} is not in the pool")]
    NoConstant(u32),
    #[error("slot {0} is not a value")]
    BadSlot(String),
    #[error("f{func}@{pc}: snapshot has {nslots} slots, the frame needs {expected}")]
    SlotCount {
        func: u32,
        pc: u32,
        nslots: u32,
        expected: u32,
    },
    #[error("snapshot frame for unknown function f{0}")]
    UnknownFunction(u32),
}

/// The machine state a snapshot is decoded against.
pub(crate) trait MachineState: StackMemory {
    fn gpr(&self, r: u8) -> Option<u64>;
    fn fpr(&self, r: u8) -> Option<f64>;
}

impl MachineState for Machine {
    fn gpr(&self, r: u8) -> Option<u64> {
        self.gprs.get(usize::from(r)).copied()
    }

    fn fpr(&self, r: u8) -> Option<f64> {
        self.fprs.get(usize::from(r)).copied()
    }
}

/// One frame of a decoded snapshot.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct DecodedFrame {
    pub func: FuncId,
    pub pc: u32,
    pub slots: Vec<Value>,
}

/// Decode the snapshot at `off` in `buf`. Stack slots are relative to `body`, the lowest address
/// of the generated frame.
pub(crate) fn decode(
    buf: &[u8],
    off: SnapshotOffset,
    state: &impl MachineState,
    body: u64,
    constants: &[Value],
) -> Result<(BailoutKind, Vec<DecodedFrame>), BailoutError> {
    let mut rdr = SnapshotReader::new(buf, off)?;
    let mut frames = Vec::new();
    while let Some(hdr) = rdr.next_frame()? {
        let mut slots = Vec::with_capacity(hdr.nslots as usize);
        for _ in 0..hdr.nslots {
            slots.push(read_slot(rdr.read_slot()?, state, body, constants)?);
        }
        frames.push(DecodedFrame {
            func: FuncId::from_raw(hdr.func),
            pc: hdr.pc,
            slots,
        });
    }
    Ok((rdr.bailout_kind(), frames))
}

fn read_loc(loc: Loc, state: &impl MachineState, body: u64) -> Result<u64, BailoutError> {
    match loc {
        Loc::Reg(r) => state
            .gpr(r)
            .ok_or_else(|| BailoutError::BadSlot(loc.to_string())),
        Loc::FloatReg(r) => state
            .fpr(r)
            .map(f64::to_bits)
            .ok_or_else(|| BailoutError::BadSlot(loc.to_string())),
        Loc::Stack(off) => {
            let addr = body + u64::from(off);
            state
                .read_word(addr)
                .ok_or(BailoutError::Frame(FrameError::Unreadable(addr)))
        }
    }
}

fn read_slot(
    slot: Slot,
    state: &impl MachineState,
    body: u64,
    constants: &[Value],
) -> Result<Value, BailoutError> {
    Ok(match slot {
        Slot::Undefined => Value::Undefined,
        Slot::Null => Value::Null,
        Slot::Boolean(b) => Value::Boolean(b),
        Slot::Int32(x) => Value::Int32(x),
        Slot::Constant(i) => *constants
            .get(i as usize)
            .ok_or(BailoutError::NoConstant(i))?,
        Slot::Typed { ty, loc } => {
            let ty = match ty {
                SlotType::Boolean => ValueType::Boolean,
                SlotType::Int32 => ValueType::Int32,
                SlotType::Double => ValueType::Double,
                SlotType::String => ValueType::String,
                SlotType::Object => ValueType::Object,
            };
            Value::from_payload(ty, read_loc(loc, state, body)?)
        }
        Slot::Boxed { tag, payload } => {
            let t = read_loc(tag, state, body)?;
            let p = read_loc(payload, state, body)?;
            Value::from_bits(t, p).ok_or_else(|| BailoutError::BadSlot(slot.to_string()))?
        }
    })
}

/// Turn decoded frames into interpreter frames, checking that each has exactly the slots its
/// function needs at its pc. Every frame but the innermost is stopped at a call whose
/// arguments the callee frame has consumed.
pub(crate) fn reconstruct(
    program: &Program,
    decoded: Vec<DecodedFrame>,
) -> Result<Vec<InterpFrame>, BailoutError> {
    let n = decoded.len();
    let mut frames = Vec::with_capacity(n);
    for (i, d) in decoded.into_iter().enumerate() {
        let script = program
            .get(d.func)
            .ok_or(BailoutError::UnknownFunction(d.func.raw()))?;
        let nslots = script.nslots_at(d.pc);
        let expected = match (i + 1 < n, script.op(d.pc)) {
            (true, Op::Call { argc, .. }) => nslots.and_then(|x| x.checked_sub(u32::from(argc))),
            (true, _) => None,
            (false, _) => nslots,
        };
        let nslots = d.slots.len() as u32;
        if expected != Some(nslots) {
            return Err(BailoutError::SlotCount {
                func: d.func.raw(),
                pc: d.pc,
                nslots,
                expected: expected.unwrap_or(0),
            });
        }
        let fr = InterpFrame::from_slots(d.func, d.pc, script, d.slots).ok_or(
            BailoutError::SlotCount {
                func: d.func.raw(),
                pc: d.pc,
                nslots,
                expected: expected.unwrap_or(0),
            },
        )?;
        frames.push(fr);
    }
    Ok(frames)
}

/// Update the predictions in `oracle` according to the kind of guard that failed. Returns the
/// [BailoutResult] and whether any prediction was widened. Nothing but `oracle` is touched: the
/// interpreter has yet to run the instruction the frames stopped at.
pub(crate) fn apply_policy(
    kind: BailoutKind,
    frames: &[InterpFrame],
    program: &Program,
    oracle: &mut ProfileOracle,
) -> (BailoutResult, bool) {
    let (Some(outer), Some(inner)) = (frames.first(), frames.last()) else {
        return (BailoutResult::Fatal, false);
    };
    match kind {
        BailoutKind::Normal => {
            // Record the type of what the interpreter is about to compute.
            let op = program.script(inner.func).op(inner.pc);
            let widened = match (binary(op), &inner.stack[..]) {
                (Some(bop), [.., a, b]) => {
                    oracle.observe(inner.func, inner.pc, ops::binary_type(bop, *a, *b))
                }
                (None, _)
                    if matches!(
                        op,
                        Op::Lt | Op::Le | Op::Gt | Op::Ge | Op::Eq | Op::Ne | Op::Not
                    ) =>
                {
                    oracle.observe(inner.func, inner.pc, ValueType::Boolean)
                }
                _ => false,
            };
            (BailoutResult::ResumeNormal, widened)
        }
        BailoutKind::Overflow => (
            BailoutResult::ResumeNormal,
            oracle.observe(inner.func, inner.pc, ValueType::Double),
        ),
        BailoutKind::TypeBarrier => {
            let widened = match (inner.stack.last(), inner.pc.checked_sub(1)) {
                (Some(v), Some(pc)) => oracle.observe(inner.func, pc, v.ty()),
                _ => false,
            };
            (BailoutResult::ResumeAfterTypeWiden, widened)
        }
        BailoutKind::ArgumentCheck => {
            let mut widened = false;
            for (i, a) in outer.args.iter().enumerate() {
                widened |= oracle.observe_arg(outer.func, i as u16, a.ty());
            }
            (BailoutResult::ResumeAfterArgumentRecheck, widened)
        }
    }
}

fn binary(op: Op) -> Option<ops::BinaryOp> {
    match op {
        Op::Add => Some(ops::BinaryOp::Add),
        Op::Sub => Some(ops::BinaryOp::Sub),
        Op::Mul => Some(ops::BinaryOp::Mul),
        Op::BitAnd => Some(ops::BinaryOp::BitAnd),
        Op::BitOr => Some(ops::BinaryOp::BitOr),
        _ => None,
    }
}
