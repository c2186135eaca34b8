//! Lower an optimised MIR [Graph] to LIR.

use super::{
    LFrame, LInst, LOp, LSnapshot, LUse, LValue, LirFunction, Part, Policy, RegClass, SnapshotIdx,
    VReg,
};
use crate::{
    codegen::emit::{AluOp, CmpKind, Cond, FAluOp, RET_PAYLOAD, RET_TAG},
    compile::{CompilationError, CompileContext},
    mir::{BlockIdx, Graph, MirType, Node, NodeIdx, NodeT, ResumePointIdx},
    ops::{BinaryOp, CmpOp},
    value::{Value, ValueType},
};
use index_vec::IndexVec;
use jitsnap::BailoutKind;
use smallvec::SmallVec;
use std::collections::HashMap;

pub(crate) fn lower(ctx: &CompileContext, g: &Graph) -> Result<LirFunction, CompilationError> {
    let mut blocks = IndexVec::with_capacity(g.blocks_len());
    for _ in 0..g.blocks_len() {
        blocks.push(Vec::new());
    }
    let lir = LirFunction {
        func: g.func,
        nargs: ctx.program.script(g.func).nargs(),
        blocks,
        order: g.order().to_vec(),
        vregs: IndexVec::new(),
        snapshots: IndexVec::new(),
    };
    let mut lw = Lowerer {
        ctx,
        g,
        lir,
        values: HashMap::new(),
        snapshots: HashMap::new(),
        cur: g.entry(),
    };
    lw.lower()?;
    Ok(lw.lir)
}

struct Lowerer<'a> {
    ctx: &'a CompileContext<'a>,
    g: &'a Graph,
    lir: LirFunction,
    values: HashMap<NodeIdx, LValue>,
    snapshots: HashMap<(ResumePointIdx, BailoutKind), SnapshotIdx>,
    cur: BlockIdx,
}

impl Lowerer<'_> {
    fn lower(&mut self) -> Result<(), CompilationError> {
        // Phis can be referenced by moves in blocks lowered before their own block.
        for b in self.g.order() {
            for phi in &self.g.block(*b).phis {
                let v = self.fresh_value(self.g.ty(*phi))?;
                self.values.insert(*phi, v);
            }
        }
        for b in self.g.order().to_vec() {
            self.cur = b;
            let mut last_rp = self.g.block(b).entry_rp;
            for n in self.g.block(b).nodes.clone() {
                if let Some(rp) = self.g.data(n).resume_point {
                    last_rp = Some(rp);
                }
                self.lower_node(n, last_rp)?;
            }
        }
        Ok(())
    }

    fn new_vreg(&mut self, class: RegClass) -> VReg {
        self.lir.vregs.push(class)
    }

    /// Fresh vregs for a value of type `ty` that is defined by moves (i.e. a phi).
    fn fresh_value(&mut self, ty: MirType) -> Result<LValue, CompilationError> {
        Ok(match ty {
            MirType::Undefined => LValue::Const(Value::Undefined),
            MirType::Null => LValue::Const(Value::Null),
            MirType::Double => LValue::Float(self.new_vreg(RegClass::Float)),
            MirType::Value => LValue::Boxed(
                Part::VReg(self.new_vreg(RegClass::General)),
                Part::VReg(self.new_vreg(RegClass::General)),
            ),
            MirType::None => {
                return Err(CompilationError::InternalError(
                    "phi of type none".to_owned(),
                ))
            }
            ty => {
                let vt = ty.value_type().ok_or_else(|| {
                    CompilationError::InternalError(format!("phi of type {ty}"))
                })?;
                LValue::Word(self.new_vreg(RegClass::General), vt)
            }
        })
    }

    fn value(&self, n: NodeIdx) -> Result<LValue, CompilationError> {
        if let Some(c) = self.g.constant(n) {
            return Ok(LValue::Const(c));
        }
        self.values.get(&n).copied().ok_or_else(|| {
            CompilationError::InternalError(format!("%{} used before it was lowered", n.index()))
        })
    }

    fn emit(
        &mut self,
        op: LOp,
        defs: &[VReg],
        uses: &[LUse],
        snapshot: Option<SnapshotIdx>,
    ) -> Result<(), CompilationError> {
        let target = self.ctx.options.target;
        if !target.has_fpu() {
            let float = |v: VReg| self.lir.class(v) == RegClass::Float;
            if defs.iter().any(|v| float(*v)) || uses.iter().filter_map(|u| u.vreg()).any(float)
            {
                return Err(CompilationError::Unsupported(format!(
                    "target {target} has no template for {op}"
                )));
            }
        }
        self.lir.blocks[self.cur].push(LInst {
            op,
            defs: SmallVec::from_slice(defs),
            uses: SmallVec::from_slice(uses),
            snapshot,
        });
        Ok(())
    }

    /// Put a word value in a general purpose vreg.
    fn word_vreg(&mut self, v: LValue) -> Result<VReg, CompilationError> {
        match v {
            LValue::Word(r, _) => Ok(r),
            LValue::Const(c) => {
                let r = self.new_vreg(RegClass::General);
                self.emit(LOp::Const(c.payload()), &[r], &[], None)?;
                Ok(r)
            }
            v => Err(CompilationError::InternalError(format!(
                "{v:?} is not a word"
            ))),
        }
    }

    /// The word operand `v`, as an immediate if it is a constant.
    fn word_use(&mut self, v: LValue) -> Result<LUse, CompilationError> {
        match v {
            LValue::Const(c) if c.payload() <= u64::from(u32::MAX) => Ok(LUse::Imm(c.payload())),
            v => Ok(LUse::VReg(self.word_vreg(v)?, Policy::AnyReg)),
        }
    }

    fn float_vreg(&mut self, v: LValue) -> Result<VReg, CompilationError> {
        match v {
            LValue::Float(r) => Ok(r),
            LValue::Const(c) => {
                let d = c.as_f64().ok_or_else(|| {
                    CompilationError::InternalError(format!("{c:?} is not a number"))
                })?;
                let r = self.new_vreg(RegClass::Float);
                self.emit(LOp::Const(d.to_bits()), &[r], &[], None)?;
                Ok(r)
            }
            v => Err(CompilationError::InternalError(format!(
                "{v:?} is not a double"
            ))),
        }
    }

    /// The tag and payload of a boxed value.
    fn boxed_parts(&mut self, v: LValue) -> Result<(Part, Part), CompilationError> {
        Ok(match v {
            LValue::Const(c) => {
                let (t, p) = c.to_bits();
                (Part::Const(t), Part::Const(p))
            }
            LValue::Boxed(t, p) => (t, p),
            LValue::Word(r, ty) => (Part::Const(ty as u64), Part::VReg(r)),
            LValue::Float(f) => {
                let r = self.new_vreg(RegClass::General);
                self.emit(LOp::DoubleToBits, &[r], &[LUse::VReg(f, Policy::AnyReg)], None)?;
                (Part::Const(ValueType::Double as u64), Part::VReg(r))
            }
        })
    }

    fn part_vreg(&mut self, p: Part) -> Result<VReg, CompilationError> {
        match p {
            Part::VReg(r) => Ok(r),
            Part::Const(x) => {
                let r = self.new_vreg(RegClass::General);
                self.emit(LOp::Const(x), &[r], &[], None)?;
                Ok(r)
            }
        }
    }

    /// The snapshot for `rp`, creating it if need be.
    /// The uses of a call taking the boxed values `ops`: a tag and payload each, anywhere.
    fn call_uses(&mut self, ops: &[NodeIdx]) -> Result<Vec<LUse>, CompilationError> {
        let mut uses = Vec::with_capacity(ops.len() * 2);
        for op in ops {
            let (t, p) = self.boxed_parts(self.value(*op)?)?;
            uses.push(t.to_use(Policy::Memory));
            uses.push(p.to_use(Policy::Memory));
        }
        Ok(uses)
    }

    fn snapshot(
        &mut self,
        rp: Option<ResumePointIdx>,
        kind: BailoutKind,
    ) -> Result<SnapshotIdx, CompilationError> {
        let rp = rp.ok_or_else(|| {
            CompilationError::InternalError(format!(
                "bb{}: guard has no resume point",
                self.cur.index()
            ))
        })?;
        if let Some(s) = self.snapshots.get(&(rp, kind)) {
            return Ok(*s);
        }
        let mut frames = Vec::new();
        for r in self.g.rp_chain(rp) {
            let rpd = self.g.resume_point(r);
            let slots = rpd
                .slots()
                .iter()
                .map(|n| self.value(*n))
                .collect::<Result<Vec<_>, _>>()?;
            frames.push(LFrame {
                func: rpd.func,
                pc: rpd.pc,
                slots,
            });
        }
        let s = self.lir.snapshots.push(LSnapshot { kind, frames });
        self.snapshots.insert((rp, kind), s);
        Ok(s)
    }

    fn lower_node(
        &mut self,
        n: NodeIdx,
        rp: Option<ResumePointIdx>,
    ) -> Result<(), CompilationError> {
        let ops = self.g.operands(n).to_vec();
        let node = self.g.node(n).clone();
        let v = match node {
            Node::Parameter(p) => {
                let t = self.new_vreg(RegClass::General);
                let pl = self.new_vreg(RegClass::General);
                self.emit(LOp::Param(p.index), &[t, pl], &[], None)?;
                LValue::Boxed(Part::VReg(t), Part::VReg(pl))
            }
            Node::Constant(c) => LValue::Const(c.value),
            Node::Unbox(u) => {
                let snap = self.snapshot(rp, u.kind)?;
                let src = self.value(ops[0])?;
                self.unbox(src, u.ty, snap)?
            }
            Node::BoxValue(_) => {
                let (t, p) = self.boxed_parts(self.value(ops[0])?)?;
                match (t, p) {
                    (Part::Const(t), Part::Const(p)) => match Value::from_bits(t, p) {
                        Some(c) => LValue::Const(c),
                        None => LValue::Boxed(Part::Const(t), Part::Const(p)),
                    },
                    _ => LValue::Boxed(t, p),
                }
            }
            Node::ToDouble(_) => match self.value(ops[0])? {
                LValue::Const(Value::Int32(x)) => LValue::Const(Value::Double(f64::from(x))),
                v => {
                    let src = self.word_vreg(v)?;
                    let d = self.new_vreg(RegClass::Float);
                    self.emit(
                        LOp::Int32ToDouble,
                        &[d],
                        &[LUse::VReg(src, Policy::AnyReg)],
                        None,
                    )?;
                    LValue::Float(d)
                }
            },
            Node::Arith(a) => {
                let (l, r) = (self.value(ops[0])?, self.value(ops[1])?);
                match a.ty {
                    MirType::Int32 => {
                        let snap = match a.guard() {
                            Some(kind) => Some(self.snapshot(rp, kind)?),
                            None => None,
                        };
                        self.alu32(a.op, l, r, snap)?
                    }
                    MirType::Double => {
                        let op = match a.op {
                            BinaryOp::Add => FAluOp::Add,
                            BinaryOp::Sub => FAluOp::Sub,
                            BinaryOp::Mul => FAluOp::Mul,
                            op => {
                                return Err(CompilationError::InternalError(format!(
                                    "no double {op}"
                                )))
                            }
                        };
                        let l = self.float_vreg(l)?;
                        let r = self.float_vreg(r)?;
                        let d = self.new_vreg(RegClass::Float);
                        self.emit(
                            LOp::FAlu(op),
                            &[d],
                            &[
                                LUse::VReg(l, Policy::AnyReg),
                                LUse::VReg(r, Policy::AnyReg),
                            ],
                            None,
                        )?;
                        LValue::Float(d)
                    }
                    ty => {
                        return Err(CompilationError::InternalError(format!(
                            "arithmetic on {ty}"
                        )))
                    }
                }
            }
            Node::Compare(c) => {
                let (l, r) = (self.value(ops[0])?, self.value(ops[1])?);
                self.compare(c.op, c.ty, l, r)?
            }
            Node::Not(_) => match self.value(ops[0])? {
                LValue::Const(Value::Boolean(b)) => LValue::Const(Value::Boolean(!b)),
                v => {
                    let src = self.word_vreg(v)?;
                    let d = self.new_vreg(RegClass::General);
                    self.emit(
                        LOp::Alu32 {
                            op: AluOp::Xor,
                            checked: false,
                        },
                        &[d],
                        &[LUse::VReg(src, Policy::AnyReg), LUse::Imm(1)],
                        None,
                    )?;
                    LValue::Word(d, ValueType::Boolean)
                }
            },
            Node::VmCall(c) => {
                let snap = self.snapshot(rp, BailoutKind::Normal)?;
                let uses = self.call_uses(&ops)?;
                let t = self.new_vreg(RegClass::General);
                let p = self.new_vreg(RegClass::General);
                self.emit(LOp::CallVm(c.func), &[t, p], &uses, Some(snap))?;
                LValue::Boxed(Part::VReg(t), Part::VReg(p))
            }
            Node::PropertyCache(c) => {
                let snap = self.snapshot(rp, BailoutKind::Normal)?;
                let uses = self.call_uses(&ops)?;
                let op = LOp::PropertyCache {
                    func: c.func,
                    shape: c.shape,
                    slot: c.slot,
                };
                if self.g.ty(n) == MirType::None {
                    self.emit(op, &[], &uses, Some(snap))?;
                    return Ok(());
                }
                let t = self.new_vreg(RegClass::General);
                let p = self.new_vreg(RegClass::General);
                self.emit(op, &[t, p], &uses, Some(snap))?;
                LValue::Boxed(Part::VReg(t), Part::VReg(p))
            }
            Node::InterruptCheck(_) => {
                let snap = self.snapshot(rp, BailoutKind::Normal)?;
                self.emit(LOp::InterruptCheck, &[], &[], Some(snap))?;
                return Ok(());
            }
            Node::Phi(_) => return Ok(()),
            Node::Goto(_) => {
                let succ = self.g.block(self.cur).succs[0];
                self.phi_moves(succ)?;
                self.emit(LOp::Jump(succ), &[], &[], None)?;
                return Ok(());
            }
            Node::Test(_) => {
                let succs = self.g.block(self.cur).succs.clone();
                match self.value(ops[0])? {
                    LValue::Const(Value::Boolean(b)) => {
                        let taken = if b { succs[0] } else { succs[1] };
                        self.emit(LOp::Jump(taken), &[], &[], None)?;
                    }
                    v => {
                        let cond = self.word_vreg(v)?;
                        self.emit(
                            LOp::Branch {
                                if_true: succs[0],
                                if_false: succs[1],
                            },
                            &[],
                            &[LUse::VReg(cond, Policy::AnyReg)],
                            None,
                        )?;
                    }
                }
                return Ok(());
            }
            Node::Return(_) => {
                let (t, p) = self.boxed_parts(self.value(ops[0])?)?;
                self.emit(
                    LOp::Return,
                    &[],
                    &[
                        t.to_use(Policy::FixedReg(RET_TAG)),
                        p.to_use(Policy::FixedReg(RET_PAYLOAD)),
                    ],
                    None,
                )?;
                return Ok(());
            }
        };
        self.values.insert(n, v);
        Ok(())
    }

    fn unbox(
        &mut self,
        src: LValue,
        ty: MirType,
        snap: SnapshotIdx,
    ) -> Result<LValue, CompilationError> {
        let (tag, payload) = self.boxed_parts(src)?;
        if ty == MirType::Double {
            if let (Part::Const(t), Part::Const(p)) = (tag, payload) {
                if let Some(d) = Value::from_bits(t, p).and_then(|c| c.as_f64()) {
                    return Ok(LValue::Const(Value::Double(d)));
                }
            }
            let d = self.new_vreg(RegClass::Float);
            self.emit(
                LOp::UnboxDouble,
                &[d],
                &[tag.to_use(Policy::AnyReg), payload.to_use(Policy::AnyReg)],
                Some(snap),
            )?;
            return Ok(LValue::Float(d));
        }
        let vt = ty
            .value_type()
            .ok_or_else(|| CompilationError::InternalError(format!("unbox to {ty}")))?;
        match tag {
            Part::Const(t) if t == vt as u64 => (),
            _ => self.emit(
                LOp::CheckTag(vt),
                &[],
                &[tag.to_use(Policy::AnyReg)],
                Some(snap),
            )?,
        }
        Ok(match (vt, payload) {
            (ValueType::Undefined, _) => LValue::Const(Value::Undefined),
            (ValueType::Null, _) => LValue::Const(Value::Null),
            (_, Part::Const(p)) => LValue::Const(Value::from_payload(vt, p)),
            (_, Part::VReg(r)) => LValue::Word(r, vt),
        })
    }

    fn alu32(
        &mut self,
        op: BinaryOp,
        l: LValue,
        r: LValue,
        snap: Option<SnapshotIdx>,
    ) -> Result<LValue, CompilationError> {
        let aop = match op {
            BinaryOp::Add => AluOp::Add,
            BinaryOp::Sub => AluOp::Sub,
            BinaryOp::Mul => AluOp::Mul,
            BinaryOp::BitAnd => AluOp::And,
            BinaryOp::BitOr => AluOp::Or,
        };
        // Put a lone constant on the right, where it can be an immediate.
        let (l, r) = match (l, r) {
            (LValue::Const(_), LValue::Word(..)) if op != BinaryOp::Sub => (r, l),
            _ => (l, r),
        };
        // Identities need neither an instruction nor a guard.
        if let (LValue::Word(..), LValue::Const(Value::Int32(c))) = (l, r) {
            if matches!((op, c), (BinaryOp::Add | BinaryOp::Sub, 0) | (BinaryOp::Mul, 1)) {
                return Ok(l);
            }
        }
        let lhs = self.word_vreg(l)?;
        let rhs = self.word_use(r)?;
        let d = self.new_vreg(RegClass::General);
        self.emit(
            LOp::Alu32 {
                op: aop,
                checked: snap.is_some(),
            },
            &[d],
            &[LUse::VReg(lhs, Policy::AnyReg), rhs],
            snap,
        )?;
        Ok(LValue::Word(d, ValueType::Int32))
    }

    fn compare(
        &mut self,
        op: CmpOp,
        ty: MirType,
        l: LValue,
        r: LValue,
    ) -> Result<LValue, CompilationError> {
        let mut cond = match op {
            CmpOp::Lt => Cond::Lt,
            CmpOp::Le => Cond::Le,
            CmpOp::Gt => Cond::Gt,
            CmpOp::Ge => Cond::Ge,
            CmpOp::Eq => Cond::Eq,
            CmpOp::Ne => Cond::Ne,
        };
        let d = self.new_vreg(RegClass::General);
        match ty {
            MirType::Double => {
                let l = self.float_vreg(l)?;
                let r = self.float_vreg(r)?;
                self.emit(
                    LOp::Compare {
                        kind: CmpKind::F64,
                        cond,
                    },
                    &[d],
                    &[LUse::VReg(l, Policy::AnyReg), LUse::VReg(r, Policy::AnyReg)],
                    None,
                )?;
            }
            MirType::Int32 | MirType::Boolean | MirType::String | MirType::Object => {
                let kind = if ty == MirType::Int32 {
                    CmpKind::I32
                } else {
                    CmpKind::W64
                };
                let (l, r) = match (l, r) {
                    (LValue::Const(_), LValue::Word(..)) => {
                        cond = match cond {
                            Cond::Lt => Cond::Gt,
                            Cond::Le => Cond::Ge,
                            Cond::Gt => Cond::Lt,
                            Cond::Ge => Cond::Le,
                            c => c,
                        };
                        (r, l)
                    }
                    _ => (l, r),
                };
                let lhs = self.word_vreg(l)?;
                let rhs = self.word_use(r)?;
                self.emit(
                    LOp::Compare { kind, cond },
                    &[d],
                    &[LUse::VReg(lhs, Policy::AnyReg), rhs],
                    None,
                )?;
            }
            ty => {
                return Err(CompilationError::InternalError(format!(
                    "comparison of {ty}"
                )))
            }
        }
        Ok(LValue::Word(d, ValueType::Boolean))
    }

    /// At the end of the current block, move each of `succ`'s phi operands into the phi.
    fn phi_moves(&mut self, succ: BlockIdx) -> Result<(), CompilationError> {
        let Some(pred_idx) = self
            .g
            .block(succ)
            .preds
            .iter()
            .position(|p| *p == self.cur)
        else {
            return Err(CompilationError::InternalError(format!(
                "bb{} is not a predecessor of bb{}",
                self.cur.index(),
                succ.index()
            )));
        };
        let mut defs = Vec::new();
        let mut uses = Vec::new();
        for phi in self.g.block(succ).phis.clone() {
            let dst = self.value(phi)?;
            let src = self.value(self.g.operand(phi, pred_idx))?;
            match dst {
                LValue::Const(_) => (),
                LValue::Word(d, _) => {
                    let s = match src {
                        LValue::Const(c) => LUse::Imm(c.payload()),
                        v => LUse::VReg(self.word_vreg(v)?, Policy::Memory),
                    };
                    defs.push(d);
                    uses.push(s);
                }
                LValue::Float(d) => {
                    let s = match src {
                        LValue::Const(c) => match c.as_f64() {
                            Some(x) => LUse::Imm(x.to_bits()),
                            None => {
                                return Err(CompilationError::InternalError(format!(
                                    "{c:?} flows into a double phi"
                                )))
                            }
                        },
                        v => LUse::VReg(self.float_vreg(v)?, Policy::Memory),
                    };
                    defs.push(d);
                    uses.push(s);
                }
                LValue::Boxed(dt, dp) => {
                    let (st, sp) = self.boxed_parts(src)?;
                    let dt = self.part_vreg(dt)?;
                    let dp = self.part_vreg(dp)?;
                    defs.extend([dt, dp]);
                    uses.extend([st.to_use(Policy::Memory), sp.to_use(Policy::Memory)]);
                }
            }
        }
        if !defs.is_empty() {
            self.emit(LOp::ParallelMove, &defs, &uses, None)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        bytecode::{FuncId, Op, Program, ScriptBuilder},
        mir::{builder, passes},
        options::JitOptions,
        oracle::ProfileOracle,
        testing::assert_matches,
        value::{ShapeId, TypeSet},
    };

    fn lower_script(
        script: crate::bytecode::Script,
        setup: impl FnOnce(&mut ProfileOracle),
    ) -> LirFunction {
        let program = Program::new(vec![script]).unwrap();
        let mut oracle = ProfileOracle::new(&program);
        setup(&mut oracle);
        let opts = JitOptions::default();
        let ctx = CompileContext {
            program: &program,
            oracle: &oracle,
            options: &opts,
        };
        let mut g = builder::build(&ctx, FuncId::from_raw(0)).unwrap();
        passes::optimize(&mut g);
        lower(&ctx, &g).unwrap()
    }

    #[test]
    fn guarded_int_add() {
        let mut b = ScriptBuilder::new("f", 2, 0);
        b.ops(&[Op::GetArg(0), Op::Int(5), Op::Add, Op::Return]);
        let f = FuncId::from_raw(0);
        let lir = lower_script(b.build().unwrap(), |o| {
            o.set_arg(f, 0, TypeSet::single(ValueType::Int32));
            o.set(f, 2, TypeSet::single(ValueType::Int32));
        });
        assert_matches(
            "lir f0 (args=2)
bb0:
  v0, v1 = param 0
  v2, v3 = param 1
  checktag.int32 v0 snap0
  jump bb1
bb1:
  v{{r}} = alu32.add.checked v1, 0x5 snap1
  return 0x3@r0, v{{r}}@r1
snap0: argument-check f0@0 [box(v0, v1), box(v2, v3)]
...",
            &lir.display(None),
        );
        let snap = &lir.snapshots[SnapshotIdx::from_raw(1)];
        assert_eq!(snap.kind, BailoutKind::Overflow);
        assert_eq!(snap.frames.len(), 1);
        assert_eq!(snap.frames[0].pc, 2);
    }

    #[test]
    fn property_caches_are_safepoints() {
        // f(o, v) { o.x = v; return o.x }
        let mut b = ScriptBuilder::new("f", 2, 0);
        b.ops(&[Op::GetArg(0), Op::GetArg(1)]).set_prop("x");
        b.op(Op::GetArg(0)).get_prop("x").op(Op::Return);
        let f = FuncId::from_raw(0);
        let lir = lower_script(b.build().unwrap(), |o| {
            o.observe_shape(f, 2, ShapeId::from_raw(2), Some(0));
            o.observe_shape(f, 4, ShapeId::from_raw(2), Some(0));
        });
        assert_matches(
            "lir f0 (args=2)
...
  propcache setprop str#0 shape#2 slot 0 v0, v1, v2, v3 snap{{a}}
  v{{t}}, v{{p}} = propcache getprop str#0 shape#2 slot 0 v0, v1 snap{{b}}
  return v{{t}}@r0, v{{p}}@r1
snap{{a}}: normal f0@2 [box(v0, v1), box(v2, v3), box(v0, v1), box(v2, v3)]
snap{{b}}: normal f0@4 [box(v0, v1), box(v2, v3), box(v0, v1)]",
            &lir.display(None),
        );
        let get = lir
            .blocks
            .iter()
            .flatten()
            .find(|i| matches!(i.op, LOp::PropertyCache { .. }) && !i.defs.is_empty())
            .unwrap();
        assert!(get.op.is_call() && get.op.is_safepoint());
    }

    #[test]
    fn loop_phis_become_moves() {
        // local0 = 0; while (local0 < 10) local0 = local0 + 1; return local0
        let mut b = ScriptBuilder::new("f", 0, 1);
        let head = b.new_label();
        let exit = b.new_label();
        b.ops(&[Op::Int(0), Op::SetLocal(0)]);
        b.bind(head);
        b.ops(&[Op::LoopHead, Op::GetLocal(0), Op::Int(10), Op::Lt]);
        b.jump_if_false(exit);
        b.ops(&[Op::GetLocal(0), Op::Int(1), Op::Add, Op::SetLocal(0)]);
        b.jump(head);
        b.bind(exit);
        b.ops(&[Op::GetLocal(0), Op::Return]);
        let f = FuncId::from_raw(0);
        let lir = lower_script(b.build().unwrap(), |o| {
            o.set(f, 9, TypeSet::single(ValueType::Int32));
        });
        let s = lir.display(None);
        assert!(s.contains("v0 = parallelmove 0x0"), "{s}");
        assert!(s.contains("compare.i32.lt v0, 0xa"), "{s}");
        assert!(s.contains("= alu32.add.checked v0, 0x1 snap"), "{s}");
        assert!(s.contains("interruptcheck snap"), "{s}");
        assert_eq!(
            lir.blocks
                .iter()
                .flatten()
                .filter(|i| i.op == LOp::ParallelMove)
                .count(),
            2
        );
    }
}
