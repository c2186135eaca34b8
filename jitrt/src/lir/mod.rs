//! Low-level IR (LIR).
//!
//! LIR is a machine oriented rendering of an optimised MIR graph: each block holds a list of
//! [LInst]s whose operands are virtual registers ([VReg]s) of a [RegClass]. LIR blocks are the
//! MIR blocks (same [BlockIdx]), in the same order.
//!
//! A MIR node becomes an [LValue]: boxed values take two general purpose vregs (tag and
//! payload), doubles one float vreg, other unboxed types one general purpose vreg, and values
//! known at compile time none at all. Constants are folded into instructions as immediates
//! ([LUse::Imm]) wherever the instruction allows it and materialised into a fresh vreg where it
//! does not.
//!
//! Phis become [LOp::ParallelMove]s at the end of each predecessor, so a phi's vregs are the
//! only vregs with more than one definition.

use crate::{
    bytecode::FuncId,
    codegen::emit::{AluOp, CmpKind, Cond, FAluOp, Reg},
    mir::{BlockIdx, VmFunction},
    value::{ShapeId, Value, ValueType},
};
use index_vec::IndexVec;
use jitsnap::BailoutKind;
use smallvec::SmallVec;
use std::fmt::{self, Write};

pub(crate) mod lower;
pub(crate) mod regalloc;

use regalloc::Allocation;

index_vec::define_index_type! {
    pub(crate) struct VReg = u32;
}

index_vec::define_index_type! {
    pub(crate) struct SnapshotIdx = u32;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum RegClass {
    General,
    Float,
}

/// Where an instruction wants an operand.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Policy {
    /// In this particular register: code generation moves the operand there.
    FixedReg(Reg),
    /// In any register of the vreg's class.
    AnyReg,
    /// Anywhere: a register or a stack slot.
    Memory,
}

/// An operand of an [LInst].
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum LUse {
    VReg(VReg, Policy),
    /// A word known at compile time, folded into the instruction.
    Imm(u64),
}

impl LUse {
    pub(crate) fn vreg(&self) -> Option<VReg> {
        match self {
            LUse::VReg(v, _) => Some(*v),
            LUse::Imm(_) => None,
        }
    }
}

/// Half of a boxed value.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum Part {
    VReg(VReg),
    Const(u64),
}

impl Part {
    pub(crate) fn to_use(self, policy: Policy) -> LUse {
        match self {
            Part::VReg(v) => LUse::VReg(v, policy),
            Part::Const(x) => LUse::Imm(x),
        }
    }
}

/// How a MIR value is held.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum LValue {
    /// Known at compile time. Values of the unit types are always constants.
    Const(Value),
    /// An unboxed payload in a general purpose vreg.
    Word(VReg, ValueType),
    /// A double in a float vreg.
    Float(VReg),
    /// A boxed value.
    Boxed(Part, Part),
}

impl LValue {
    pub(crate) fn vregs(&self) -> SmallVec<[VReg; 2]> {
        let mut out = SmallVec::new();
        match *self {
            LValue::Const(_) => (),
            LValue::Word(v, _) | LValue::Float(v) => out.push(v),
            LValue::Boxed(tag, payload) => {
                for p in [tag, payload] {
                    if let Part::VReg(v) = p {
                        out.push(v);
                    }
                }
            }
        }
        out
    }
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum LOp {
    /// Load argument `n`: defines its tag and payload.
    Param(u16),
    /// Define a vreg to be a constant word (for float vregs: the double with these bits).
    Const(u64),
    /// Bail out unless the tag `uses[0]` is this type.
    CheckTag(ValueType),
    /// Convert a boxed number (`uses`: tag, payload) to a double, bailing out if it is neither
    /// an Int32 nor a Double.
    UnboxDouble,
    Alu32 {
        op: AluOp,
        /// Bail out on signed overflow?
        checked: bool,
    },
    FAlu(FAluOp),
    Int32ToDouble,
    DoubleToBits,
    /// Compare `uses[0]` with `uses[1]`, defining a boolean.
    Compare {
        kind: CmpKind,
        cond: Cond,
    },
    /// Call a VM function with boxed arguments (`uses`: tag, payload pairs). Defines the boxed
    /// result, which the call leaves in `r0` and `r1`. Every register is clobbered.
    CallVm(VmFunction),
    /// A property access through an inline cache. `uses` are as for [LOp::CallVm]; the first
    /// pair is the object. If it is an object of `shape`, slot `slot` is accessed in place;
    /// otherwise the VM function is called. Every register is clobbered.
    PropertyCache {
        func: VmFunction,
        shape: ShapeId,
        slot: u32,
    },
    /// Service a pending interrupt. No registers are clobbered.
    InterruptCheck,
    /// Simultaneously set `defs[i]` to `uses[i]`.
    ParallelMove,
    Jump(BlockIdx),
    /// Branch on the boolean `uses[0]`.
    Branch {
        if_true: BlockIdx,
        if_false: BlockIdx,
    },
    /// Return the boxed value `uses` (tag, payload).
    Return,
}

impl LOp {
    /// Can this instruction call into the runtime?
    pub(crate) fn is_safepoint(&self) -> bool {
        matches!(
            self,
            LOp::CallVm(_) | LOp::PropertyCache { .. } | LOp::InterruptCheck
        )
    }

    /// Does this instruction clobber every register?
    pub(crate) fn is_call(&self) -> bool {
        matches!(self, LOp::CallVm(_) | LOp::PropertyCache { .. })
    }

    pub(crate) fn successors(&self) -> SmallVec<[BlockIdx; 2]> {
        match self {
            LOp::Jump(b) => smallvec::smallvec![*b],
            LOp::Branch { if_true, if_false } => smallvec::smallvec![*if_true, *if_false],
            _ => SmallVec::new(),
        }
    }
}

impl fmt::Display for LOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LOp::Param(i) => write!(f, "param {i}"),
            LOp::Const(x) => write!(f, "const {x:#x}"),
            LOp::CheckTag(ty) => write!(f, "checktag.{}", ty.to_string().to_lowercase()),
            LOp::UnboxDouble => write!(f, "unboxdouble"),
            LOp::Alu32 { op, checked } => {
                write!(f, "alu32.{op}")?;
                if *checked {
                    write!(f, ".checked")?;
                }
                Ok(())
            }
            LOp::FAlu(op) => write!(f, "falu.{op}"),
            LOp::Int32ToDouble => write!(f, "int32todouble"),
            LOp::DoubleToBits => write!(f, "doubletobits"),
            LOp::Compare { kind, cond } => write!(f, "compare.{kind}.{cond}"),
            LOp::CallVm(func) => write!(f, "callvm {func}"),
            LOp::PropertyCache { func, shape, slot } => {
                write!(f, "propcache {func} shape#{} slot {slot}", shape.raw())
            }
            LOp::InterruptCheck => write!(f, "interruptcheck"),
            LOp::ParallelMove => write!(f, "parallelmove"),
            LOp::Jump(b) => write!(f, "jump bb{}", b.index()),
            LOp::Branch { if_true, if_false } => {
                write!(f, "branch bb{}, bb{}", if_true.index(), if_false.index())
            }
            LOp::Return => write!(f, "return"),
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct LInst {
    pub op: LOp,
    pub defs: SmallVec<[VReg; 2]>,
    pub uses: SmallVec<[LUse; 4]>,
    /// For guards, the state to bail out with. For safepoints, the state the runtime may inspect
    /// while the call is in progress.
    pub snapshot: Option<SnapshotIdx>,
}

/// One interpreter frame of an [LSnapshot].
#[derive(Clone, Debug)]
pub(crate) struct LFrame {
    pub func: FuncId,
    pub pc: u32,
    pub slots: Vec<LValue>,
}

/// The interpreter state at one point: frames from the outermost caller inwards.
#[derive(Clone, Debug)]
pub(crate) struct LSnapshot {
    pub kind: BailoutKind,
    pub frames: Vec<LFrame>,
}

impl LSnapshot {
    pub(crate) fn vregs(&self) -> impl Iterator<Item = VReg> + '_ {
        self.frames
            .iter()
            .flat_map(|f| f.slots.iter().flat_map(|s| s.vregs()))
    }
}

pub(crate) struct LirFunction {
    pub func: FuncId,
    pub nargs: u16,
    pub blocks: IndexVec<BlockIdx, Vec<LInst>>,
    pub order: Vec<BlockIdx>,
    pub vregs: IndexVec<VReg, RegClass>,
    pub snapshots: IndexVec<SnapshotIdx, LSnapshot>,
}

impl LirFunction {
    pub(crate) fn class(&self, v: VReg) -> RegClass {
        self.vregs[v]
    }

    /// Render this function, with each vreg's location if `alloc` is given.
    pub(crate) fn display(&self, alloc: Option<&Allocation>) -> String {
        let vreg = |v: VReg| match alloc {
            Some(a) => format!("v{}:{}", v.index(), a.loc(v)),
            None => format!("v{}", v.index()),
        };
        let luse = |u: &LUse| match u {
            LUse::VReg(v, Policy::FixedReg(r)) => format!("{}@{r}", vreg(*v)),
            LUse::VReg(v, _) => vreg(*v),
            LUse::Imm(x) => format!("{x:#x}"),
        };
        let mut s = format!("lir f{} (args={})\n", self.func.raw(), self.nargs);
        for b in &self.order {
            writeln!(s, "bb{}:", b.index()).ok();
            for inst in &self.blocks[*b] {
                s.push_str("  ");
                if !inst.defs.is_empty() {
                    let defs = inst.defs.iter().map(|v| vreg(*v)).collect::<Vec<_>>();
                    write!(s, "{} = ", defs.join(", ")).ok();
                }
                write!(s, "{}", inst.op).ok();
                if !inst.uses.is_empty() {
                    let uses = inst.uses.iter().map(luse).collect::<Vec<_>>();
                    write!(s, " {}", uses.join(", ")).ok();
                }
                if let Some(snap) = inst.snapshot {
                    write!(s, " snap{}", snap.index()).ok();
                }
                s.push('\n');
            }
        }
        for (i, snap) in self.snapshots.iter_enumerated() {
            write!(s, "snap{}: {}", i.index(), snap.kind).ok();
            for fr in &snap.frames {
                let slots = fr
                    .slots
                    .iter()
                    .map(|v| match v {
                        LValue::Const(c) => format!("{c:?}"),
                        LValue::Word(v, _) | LValue::Float(v) => vreg(*v),
                        LValue::Boxed(t, p) => {
                            let part = |p: &Part| match p {
                                Part::VReg(v) => vreg(*v),
                                Part::Const(x) => format!("{x:#x}"),
                            };
                            format!("box({}, {})", part(t), part(p))
                        }
                    })
                    .collect::<Vec<_>>();
                write!(s, " f{}@{} [{}]", fr.func.raw(), fr.pc, slots.join(", ")).ok();
            }
            s.push('\n');
        }
        s
    }
}
