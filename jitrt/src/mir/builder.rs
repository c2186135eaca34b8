//! Build a MIR [Graph] from a function's bytecode.
//!
//! The builder abstractly interprets the bytecode, tracking which node holds each interpreter
//! slot. Bytecode blocks are visited in program order; values merging at a join get a phi, and
//! every loop header gets a phi per slot whose type is guessed from the values entering the loop.
//! If a back edge later brings in a value the guess cannot accept, the build restarts with that
//! phi widened.
//!
//! Arithmetic is specialised using the [TypeOracle](crate::oracle::TypeOracle)'s predictions,
//! guarded so that a wrong prediction bails out to the interpreter. Small callees are inlined.

use super::{
    Arith, BlockIdx, BoxValue, Compare, Constant, Goto, Graph, InterruptCheck, MirType, Node,
    NodeIdx, Not, Parameter, PropertyCache, ResumeMode, ResumePointIdx, Return, Test, ToDouble,
    Unbox, VmCall, VmFunction,
};
use crate::{
    bytecode::{FuncId, Op, Script},
    compile::{CompilationError, CompileContext},
    ops::{BinaryOp, CmpOp},
    oracle::ShapeCache,
    value::{Value, ValueType, FIXED_SLOTS},
};
use jitsnap::BailoutKind;
use std::{
    collections::{BTreeSet, HashMap, HashSet},
    iter,
    sync::Arc,
};

/// How many times a build may restart because a loop phi was typed too narrowly.
const MAX_RESTARTS: usize = 64;

/// Identifies a loop phi across builds: `(inline site, loop header pc, slot)`.
type PhiKey = (u32, u32, usize);

enum BuildError {
    /// A loop phi must be rebuilt with (at least) the given type.
    Restart(PhiKey, MirType),
    Compile(CompilationError),
}

impl From<CompilationError> for BuildError {
    fn from(e: CompilationError) -> Self {
        BuildError::Compile(e)
    }
}

/// Build the graph for `func`.
pub(crate) fn build(ctx: &CompileContext, func: FuncId) -> Result<Graph, CompilationError> {
    let mut widened = HashMap::new();
    for _ in 0..MAX_RESTARTS {
        match Builder::new(ctx, func, &widened).build() {
            Ok(g) => return Ok(g),
            Err(BuildError::Compile(e)) => return Err(e),
            Err(BuildError::Restart(key, ty)) => {
                if widened.insert(key, ty) == Some(ty) {
                    return Err(CompilationError::InternalError(format!(
                        "loop phi {key:?} widened to {ty} twice"
                    )));
                }
            }
        }
    }
    Err(CompilationError::LimitExceeded(
        "too many graph rebuilds".to_owned(),
    ))
}

/// The abstract interpreter state: which node holds each argument, local, and operand stack
/// slot, in that order.
#[derive(Clone, Debug)]
struct FrameState {
    slots: Vec<NodeIdx>,
    /// The index of the bottom of the operand stack.
    base: usize,
}

impl FrameState {
    fn depth(&self) -> usize {
        self.slots.len() - self.base
    }

    fn push(&mut self, n: NodeIdx) {
        self.slots.push(n);
    }

    fn pop(&mut self) -> NodeIdx {
        assert!(self.depth() > 0, "operand stack underflow");
        self.slots.pop().unwrap()
    }

    /// The node `i` slots below the top of the stack.
    fn peek(&self, i: usize) -> NodeIdx {
        self.slots[self.slots.len() - 1 - i]
    }

    fn pop_n(&mut self, n: usize) -> Vec<NodeIdx> {
        assert!(self.depth() >= n, "operand stack underflow");
        self.slots.split_off(self.slots.len() - n)
    }
}

/// One bytecode function being built, either the outermost one or an inlined callee.
struct Frame {
    func: FuncId,
    script: Arc<Script>,
    /// Distinguishes the different places a function is inlined at. The outermost function is
    /// site 0.
    site: u32,
    depth: usize,
    caller_rp: Option<ResumePointIdx>,
    leaders: BTreeSet<u32>,
    headers: HashSet<u32>,
    blocks: HashMap<u32, BlockIdx>,
    built: HashSet<u32>,
    /// Edges into blocks that have not been built yet.
    pending: HashMap<u32, Vec<(BlockIdx, FrameState)>>,
    loop_phis: HashMap<u32, Vec<(usize, NodeIdx)>>,
    /// For inlined functions, the block returns jump to and the values they return.
    return_block: Option<BlockIdx>,
    returns: Vec<(BlockIdx, NodeIdx)>,
}

impl Frame {
    fn new(
        func: FuncId,
        script: Arc<Script>,
        site: u32,
        depth: usize,
        caller_rp: Option<ResumePointIdx>,
    ) -> Self {
        let mut leaders = BTreeSet::from([0]);
        let mut headers = HashSet::new();
        for (pc, op) in script.ops().iter().enumerate() {
            let pc = pc as u32;
            if let Some(t) = op.jump_target() {
                leaders.insert(t);
                if t <= pc {
                    headers.insert(t);
                }
            }
            if (op.jump_target().is_some() || !op.falls_through())
                && ((pc + 1) as usize) < script.len()
            {
                leaders.insert(pc + 1);
            }
        }
        Self {
            func,
            script,
            site,
            depth,
            caller_rp,
            leaders,
            headers,
            blocks: HashMap::new(),
            built: HashSet::new(),
            pending: HashMap::new(),
            loop_phis: HashMap::new(),
            return_block: None,
            returns: Vec::new(),
        }
    }
}

struct Builder<'a> {
    ctx: &'a CompileContext<'a>,
    func: FuncId,
    widened: &'a HashMap<PhiKey, MirType>,
    graph: Graph,
    /// The block nodes are currently being appended to.
    cur: BlockIdx,
    next_site: u32,
    inline_stack: Vec<FuncId>,
    /// Constants, keyed by `(type, payload)`. All constants live in the entry block.
    consts: HashMap<(ValueType, u64), NodeIdx>,
}

impl<'a> Builder<'a> {
    fn new(
        ctx: &'a CompileContext<'a>,
        func: FuncId,
        widened: &'a HashMap<PhiKey, MirType>,
    ) -> Self {
        let graph = Graph::new(func);
        let cur = graph.entry();
        Self {
            ctx,
            func,
            widened,
            graph,
            cur,
            next_site: 0,
            inline_stack: Vec::new(),
            consts: HashMap::new(),
        }
    }

    fn build(mut self) -> Result<Graph, BuildError> {
        let script = Arc::clone(self.ctx.program.script(self.func));
        let entry = self.graph.entry();
        let params = (0..script.nargs())
            .map(|i| {
                self.graph.add(
                    entry,
                    Node::Parameter(Parameter { index: i }),
                    MirType::Value,
                    &[],
                )
            })
            .collect::<Vec<_>>();
        let undef = self.constant(Value::Undefined);
        let mut state = FrameState {
            slots: params
                .iter()
                .copied()
                .chain(iter::repeat(undef).take(usize::from(script.nlocals())))
                .collect(),
            base: usize::from(script.nargs()) + usize::from(script.nlocals()),
        };
        let rp = self.graph.add_resume_point(
            self.func,
            0,
            ResumeMode::At,
            state.slots.clone(),
            None,
        );
        self.graph.block_mut(entry).entry_rp = Some(rp);

        // Speculate on the arguments' types as they have been observed on entry.
        for (i, p) in params.iter().enumerate() {
            let pred = self.ctx.oracle.argument(self.func, i as u16);
            let ty = match pred.only() {
                Some(ty) => MirType::from_value_type(ty),
                None if pred.is_numeric() => MirType::Double,
                None => continue,
            };
            state.slots[i] = self.unbox(*p, ty, BailoutKind::ArgumentCheck, rp);
        }

        self.inline_stack.push(self.func);
        let mut fr = Frame::new(self.func, script, 0, 0, None);
        self.build_frame(&mut fr, state)?;
        Ok(self.graph)
    }

    fn build_frame(&mut self, fr: &mut Frame, state: FrameState) -> Result<(), BuildError> {
        self.graph
            .add(self.cur, Node::Goto(Goto), MirType::None, &[]);
        self.edge(fr, 0, state)?;
        for pc in fr.leaders.clone() {
            self.build_block(fr, pc)?;
        }
        Ok(())
    }

    fn block_for(&mut self, fr: &mut Frame, pc: u32) -> BlockIdx {
        if let Some(b) = fr.blocks.get(&pc) {
            return *b;
        }
        let b = self.graph.new_block();
        fr.blocks.insert(pc, b);
        b
    }

    /// Record the edge from the current block, which must already have its terminator, to the
    /// bytecode block starting at `target`.
    fn edge(&mut self, fr: &mut Frame, target: u32, state: FrameState) -> Result<(), BuildError> {
        let from = self.cur;
        let to = self.block_for(fr, target);
        self.graph.add_edge(from, to);
        if let Some(phis) = fr.loop_phis.get(&target).cloned() {
            for (i, phi) in phis {
                let v = state.slots[i];
                let ty = self.graph.ty(phi);
                match self.coerce(from, v, ty) {
                    Some(v) => self.graph.push_operand(phi, v),
                    None => {
                        let wider = MirType::merge([ty, self.graph.ty(v)]);
                        return Err(BuildError::Restart((fr.site, target, i), wider));
                    }
                }
            }
        } else if fr.built.contains(&target) {
            return Err(
                CompilationError::Unsupported("irreducible control flow".to_owned()).into(),
            );
        } else {
            fr.pending.entry(target).or_default().push((from, state));
        }
        Ok(())
    }

    /// Convert `v` to type `ty` at the end of `block`. Returns `None` if that needs a guard.
    fn coerce(&mut self, block: BlockIdx, v: NodeIdx, ty: MirType) -> Option<NodeIdx> {
        let from = self.graph.ty(v);
        if from == ty {
            return Some(v);
        }
        match (from, ty) {
            (_, MirType::Value) => Some(self.graph.add_before_terminator(
                block,
                Node::BoxValue(BoxValue),
                MirType::Value,
                &[v],
            )),
            (MirType::Int32, MirType::Double) => Some(self.graph.add_before_terminator(
                block,
                Node::ToDouble(ToDouble),
                MirType::Double,
                &[v],
            )),
            _ => None,
        }
    }

    fn build_block(&mut self, fr: &mut Frame, pc: u32) -> Result<(), BuildError> {
        let Some(preds) = fr.pending.remove(&pc) else {
            // Unreachable.
            return Ok(());
        };
        let b = self.block_for(fr, pc);
        self.cur = b;
        let state = if fr.headers.contains(&pc) {
            self.loop_header(fr, pc, b, preds)
        } else {
            self.join(b, preds)
        };
        fr.built.insert(pc);
        let rp = self.resume_point(fr, pc, ResumeMode::At, &state)?;
        self.graph.block_mut(b).entry_rp = Some(rp);
        self.build_ops(fr, pc, state)
    }

    fn join(&mut self, b: BlockIdx, mut preds: Vec<(BlockIdx, FrameState)>) -> FrameState {
        if preds.len() == 1 {
            return preds.pop().unwrap().1;
        }
        let mut state = preds[0].1.clone();
        for i in 0..state.slots.len() {
            let first = preds[0].1.slots[i];
            if preds.iter().all(|(_, s)| s.slots[i] == first) {
                continue;
            }
            let ty = MirType::merge(preds.iter().map(|(_, s)| self.graph.ty(s.slots[i])));
            let phi = self.graph.add_phi(b, ty);
            for (p, s) in &preds {
                let v = self
                    .coerce(*p, s.slots[i], ty)
                    .expect("merged type accepts every input");
                self.graph.push_operand(phi, v);
            }
            state.slots[i] = phi;
        }
        state
    }

    fn loop_header(
        &mut self,
        fr: &mut Frame,
        pc: u32,
        b: BlockIdx,
        preds: Vec<(BlockIdx, FrameState)>,
    ) -> FrameState {
        self.graph.block_mut(b).loop_header = true;
        let mut state = preds[0].1.clone();
        let mut phis = Vec::with_capacity(state.slots.len());
        for i in 0..state.slots.len() {
            let mut ty = MirType::merge(preds.iter().map(|(_, s)| self.graph.ty(s.slots[i])));
            if let Some(w) = self.widened.get(&(fr.site, pc, i)) {
                ty = MirType::merge([ty, *w]);
            }
            let phi = self.graph.add_phi(b, ty);
            for (p, s) in &preds {
                let v = self
                    .coerce(*p, s.slots[i], ty)
                    .expect("merged type accepts every input");
                self.graph.push_operand(phi, v);
            }
            state.slots[i] = phi;
            phis.push((i, phi));
        }
        fr.loop_phis.insert(pc, phis);
        state
    }

    fn resume_point(
        &mut self,
        fr: &Frame,
        pc: u32,
        mode: ResumeMode,
        state: &FrameState,
    ) -> Result<ResumePointIdx, BuildError> {
        let expected = match (mode, fr.script.op(pc)) {
            (ResumeMode::Call, Op::Call { argc, .. }) => fr
                .script
                .depth_at(pc)
                .and_then(|d| d.checked_sub(u32::from(argc))),
            (ResumeMode::Call, _) => None,
            _ => fr.script.depth_at(pc),
        };
        if expected != Some(state.depth() as u32) {
            return Err(CompilationError::InternalError(format!(
                "f{}@{pc}: abstract stack depth {} does not match the bytecode",
                fr.func.raw(),
                state.depth()
            ))
            .into());
        }
        Ok(self.graph.add_resume_point(
            fr.func,
            pc,
            mode,
            state.slots.clone(),
            fr.caller_rp,
        ))
    }

    fn constant(&mut self, v: Value) -> NodeIdx {
        let key = (v.ty(), v.payload());
        if let Some(n) = self.consts.get(&key) {
            return *n;
        }
        let n = self.graph.add_before_terminator(
            self.graph.entry(),
            Node::Constant(Constant { value: v }),
            MirType::from_value_type(v.ty()),
            &[],
        );
        self.consts.insert(key, n);
        n
    }

    fn add(&mut self, node: Node, ty: MirType, ops: &[NodeIdx]) -> NodeIdx {
        self.graph.add(self.cur, node, ty, ops)
    }

    fn add_with_rp(
        &mut self,
        node: Node,
        ty: MirType,
        ops: &[NodeIdx],
        rp: ResumePointIdx,
    ) -> NodeIdx {
        let n = self.add(node, ty, ops);
        self.graph.set_resume_point(n, rp);
        n
    }

    fn unbox(&mut self, v: NodeIdx, ty: MirType, kind: BailoutKind, rp: ResumePointIdx) -> NodeIdx {
        if self.graph.ty(v) == ty {
            return v;
        }
        self.add_with_rp(Node::Unbox(Unbox { ty, kind }), ty, &[v], rp)
    }

    fn boxed(&mut self, v: NodeIdx) -> NodeIdx {
        if self.graph.ty(v) == MirType::Value {
            return v;
        }
        self.add(Node::BoxValue(BoxValue), MirType::Value, &[v])
    }

    fn check_limits(&self) -> Result<(), CompilationError> {
        if self.graph.num_nodes() > self.ctx.options.max_graph_nodes as usize {
            return Err(CompilationError::LimitExceeded(format!(
                "graph exceeds {} nodes",
                self.ctx.options.max_graph_nodes
            )));
        }
        Ok(())
    }

    fn build_ops(
        &mut self,
        fr: &mut Frame,
        mut pc: u32,
        mut state: FrameState,
    ) -> Result<(), BuildError> {
        loop {
            self.check_limits()?;
            match fr.script.op(pc) {
                Op::Nop => (),
                Op::Debugger => {
                    return Err(CompilationError::Unsupported(
                        "debugger statement".to_owned(),
                    )
                    .into())
                }
                Op::LoopHead => {
                    let rp = self.resume_point(fr, pc, ResumeMode::At, &state)?;
                    self.add_with_rp(
                        Node::InterruptCheck(InterruptCheck),
                        MirType::None,
                        &[],
                        rp,
                    );
                }
                Op::Pop => {
                    state.pop();
                }
                Op::Dup => state.push(state.peek(0)),
                Op::Int(x) => state.push(self.constant(Value::Int32(x))),
                Op::Double(d) => state.push(self.constant(Value::Double(d))),
                Op::Str(i) => {
                    let s = fr.script.const_id(i);
                    state.push(self.constant(Value::String(s)))
                }
                Op::Undefined => state.push(self.constant(Value::Undefined)),
                Op::Null => state.push(self.constant(Value::Null)),
                Op::True => state.push(self.constant(Value::Boolean(true))),
                Op::False => state.push(self.constant(Value::Boolean(false))),
                Op::GetArg(i) => state.push(state.slots[usize::from(i)]),
                Op::GetLocal(i) => {
                    let n = state.slots[usize::from(fr.script.nargs()) + usize::from(i)];
                    state.push(n)
                }
                Op::SetArg(i) => {
                    let v = state.pop();
                    state.slots[usize::from(i)] = v;
                }
                Op::SetLocal(i) => {
                    let v = state.pop();
                    state.slots[usize::from(fr.script.nargs()) + usize::from(i)] = v;
                }
                Op::Add => self.binary(fr, pc, BinaryOp::Add, &mut state)?,
                Op::Sub => self.binary(fr, pc, BinaryOp::Sub, &mut state)?,
                Op::Mul => self.binary(fr, pc, BinaryOp::Mul, &mut state)?,
                Op::BitAnd => self.binary(fr, pc, BinaryOp::BitAnd, &mut state)?,
                Op::BitOr => self.binary(fr, pc, BinaryOp::BitOr, &mut state)?,
                Op::Lt => self.compare(fr, pc, CmpOp::Lt, &mut state)?,
                Op::Le => self.compare(fr, pc, CmpOp::Le, &mut state)?,
                Op::Gt => self.compare(fr, pc, CmpOp::Gt, &mut state)?,
                Op::Ge => self.compare(fr, pc, CmpOp::Ge, &mut state)?,
                Op::Eq => self.compare(fr, pc, CmpOp::Eq, &mut state)?,
                Op::Ne => self.compare(fr, pc, CmpOp::Ne, &mut state)?,
                Op::Not => {
                    let b = self.truthy(fr, pc, &mut state)?;
                    let n = self.add(Node::Not(Not), MirType::Boolean, &[b]);
                    state.push(n);
                }
                Op::Jump(t) => {
                    self.add(Node::Goto(Goto), MirType::None, &[]);
                    return self.edge(fr, t, state);
                }
                op @ (Op::JumpIfFalse(t) | Op::JumpIfTrue(t)) => {
                    let cond = self.truthy(fr, pc, &mut state)?;
                    self.add(Node::Test(Test), MirType::None, &[cond]);
                    let (on_true, on_false) = match op {
                        Op::JumpIfTrue(_) => (t, pc + 1),
                        _ => (pc + 1, t),
                    };
                    self.edge(fr, on_true, state.clone())?;
                    return self.edge(fr, on_false, state);
                }
                Op::Return => {
                    let v = state.pop();
                    match fr.return_block {
                        Some(rb) => {
                            self.add(Node::Goto(Goto), MirType::None, &[]);
                            self.graph.add_edge(self.cur, rb);
                            fr.returns.push((self.cur, v));
                        }
                        None => {
                            let v = self.boxed(v);
                            self.add(Node::Return(Return), MirType::None, &[v]);
                        }
                    }
                    return Ok(());
                }
                Op::Call { func, argc } => {
                    if self.can_inline(fr, func) {
                        self.inline(fr, pc, func, argc, &mut state)?;
                    } else {
                        self.vm_call(fr, pc, VmFunction::Call { func, argc }, &mut state)?;
                    }
                }
                Op::NewObject(i) => {
                    let class = fr.script.const_id(i);
                    self.vm_call(fr, pc, VmFunction::NewObject { class }, &mut state)?;
                }
                Op::GetProp(i) => {
                    let name = fr.script.const_id(i);
                    self.property(fr, pc, VmFunction::GetProp { name }, &mut state)?;
                }
                Op::SetProp(i) => {
                    let name = fr.script.const_id(i);
                    self.property(fr, pc, VmFunction::SetProp { name }, &mut state)?;
                }
            }
            pc += 1;
            if fr.leaders.contains(&pc) {
                self.add(Node::Goto(Goto), MirType::None, &[]);
                return self.edge(fr, pc, state);
            }
        }
    }

    /// Call the runtime function `f` on the top `f.arity()` stack values, replacing them with
    /// the result. If the instruction at `pc` has only ever produced one type, the result is
    /// unboxed to it behind a type barrier.
    fn vm_call(
        &mut self,
        fr: &Frame,
        pc: u32,
        f: VmFunction,
        state: &mut FrameState,
    ) -> Result<(), BuildError> {
        let rp = self.resume_point(fr, pc, ResumeMode::At, state)?;
        let args = state
            .pop_n(f.arity())
            .into_iter()
            .map(|a| self.boxed(a))
            .collect::<Vec<_>>();
        let call = self.add_with_rp(Node::VmCall(VmCall { func: f }), MirType::Value, &args, rp);
        state.push(call);
        self.type_barrier(fr, pc, state)
    }

    /// If the instruction at `pc` has only ever produced one type, unbox the value it left on
    /// top of the stack to that type.
    fn type_barrier(
        &mut self,
        fr: &Frame,
        pc: u32,
        state: &mut FrameState,
    ) -> Result<(), BuildError> {
        if let Some(ty) = self.ctx.oracle.observed(fr.func, pc).only() {
            let after = self.resume_point(fr, pc + 1, ResumeMode::After, state)?;
            let v = self.unbox(
                state.peek(0),
                MirType::from_value_type(ty),
                BailoutKind::TypeBarrier,
                after,
            );
            state.pop();
            state.push(v);
        }
        Ok(())
    }

    /// A property get or set. If every receiver seen so far had the same shape and held the
    /// property in a fixed slot, the access goes through an inline cache for that shape;
    /// otherwise it is a plain runtime call.
    fn property(
        &mut self,
        fr: &Frame,
        pc: u32,
        f: VmFunction,
        state: &mut FrameState,
    ) -> Result<(), BuildError> {
        let get = matches!(f, VmFunction::GetProp { .. });
        let (shape, slot) = match self.ctx.oracle.property(fr.func, pc) {
            ShapeCache::Mono {
                shape,
                slot: Some(slot),
            } if slot < FIXED_SLOTS => (shape, slot),
            _ => {
                self.vm_call(fr, pc, f, state)?;
                if !get {
                    state.pop();
                }
                return Ok(());
            }
        };
        let rp = self.resume_point(fr, pc, ResumeMode::At, state)?;
        let args = state
            .pop_n(f.arity())
            .into_iter()
            .map(|a| self.boxed(a))
            .collect::<Vec<_>>();
        let node = Node::PropertyCache(PropertyCache {
            func: f,
            shape,
            slot,
        });
        if get {
            let n = self.add_with_rp(node, MirType::Value, &args, rp);
            state.push(n);
            self.type_barrier(fr, pc, state)?;
        } else {
            self.add_with_rp(node, MirType::None, &args, rp);
        }
        Ok(())
    }

    fn binary(
        &mut self,
        fr: &Frame,
        pc: u32,
        op: BinaryOp,
        state: &mut FrameState,
    ) -> Result<(), BuildError> {
        let (lhs, rhs) = (state.peek(1), state.peek(0));
        let (lt, rt) = (self.graph.ty(lhs), self.graph.ty(rhs));
        let pred = self.ctx.oracle.observed(fr.func, pc);
        let int_like = |t: MirType| matches!(t, MirType::Int32 | MirType::Value);
        let num_like =
            |t: MirType| matches!(t, MirType::Int32 | MirType::Double | MirType::Value);
        let (ty, l, r) = match op {
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul
                if pred.only() == Some(ValueType::Int32) && int_like(lt) && int_like(rt) =>
            {
                let rp = self.resume_point(fr, pc, ResumeMode::At, state)?;
                let l = self.unbox(lhs, MirType::Int32, BailoutKind::Normal, rp);
                let r = self.unbox(rhs, MirType::Int32, BailoutKind::Normal, rp);
                let n = self.add_with_rp(
                    Node::Arith(Arith {
                        op,
                        ty: MirType::Int32,
                    }),
                    MirType::Int32,
                    &[l, r],
                    rp,
                );
                state.pop_n(2);
                state.push(n);
                return Ok(());
            }
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul
                if pred.is_numeric() && num_like(lt) && num_like(rt) =>
            {
                let rp = if lt == MirType::Value || rt == MirType::Value {
                    Some(self.resume_point(fr, pc, ResumeMode::At, state)?)
                } else {
                    None
                };
                let l = self.to_double(lhs, rp);
                let r = self.to_double(rhs, rp);
                (MirType::Double, l, r)
            }
            BinaryOp::BitAnd | BinaryOp::BitOr
                if lt == MirType::Int32 && rt == MirType::Int32 =>
            {
                (MirType::Int32, lhs, rhs)
            }
            _ => return self.vm_call(fr, pc, VmFunction::Binary(op), state),
        };
        let n = self.add(Node::Arith(Arith { op, ty }), ty, &[l, r]);
        state.pop_n(2);
        state.push(n);
        Ok(())
    }

    /// Convert a numeric or boxed node to a double. Boxed nodes need a resume point for the
    /// guard.
    fn to_double(&mut self, v: NodeIdx, rp: Option<ResumePointIdx>) -> NodeIdx {
        match (self.graph.ty(v), rp) {
            (MirType::Double, _) => v,
            (MirType::Int32, _) => self.add(Node::ToDouble(ToDouble), MirType::Double, &[v]),
            (MirType::Value, Some(rp)) => {
                self.unbox(v, MirType::Double, BailoutKind::Normal, rp)
            }
            (ty, _) => unreachable!("cannot convert {ty} to a double"),
        }
    }

    fn compare(
        &mut self,
        fr: &Frame,
        pc: u32,
        op: CmpOp,
        state: &mut FrameState,
    ) -> Result<(), BuildError> {
        let (lhs, rhs) = (state.peek(1), state.peek(0));
        let eq = matches!(op, CmpOp::Eq | CmpOp::Ne);
        let ty = match (self.graph.ty(lhs), self.graph.ty(rhs)) {
            (MirType::Int32, MirType::Int32) => MirType::Int32,
            (MirType::Int32 | MirType::Double, MirType::Int32 | MirType::Double) => {
                MirType::Double
            }
            (x, y)
                if eq
                    && x == y
                    && matches!(x, MirType::Boolean | MirType::String | MirType::Object) =>
            {
                x
            }
            _ => return self.vm_call(fr, pc, VmFunction::Compare(op), state),
        };
        let (l, r) = if ty == MirType::Double {
            (self.to_double(lhs, None), self.to_double(rhs, None))
        } else {
            (lhs, rhs)
        };
        let n = self.add(Node::Compare(Compare { op, ty }), MirType::Boolean, &[l, r]);
        state.pop_n(2);
        state.push(n);
        Ok(())
    }

    /// Pop the top of the stack and convert it to a boolean.
    fn truthy(
        &mut self,
        fr: &Frame,
        pc: u32,
        state: &mut FrameState,
    ) -> Result<NodeIdx, BuildError> {
        let v = state.peek(0);
        let b = match self.graph.ty(v) {
            MirType::Boolean => v,
            MirType::Int32 => {
                let zero = self.constant(Value::Int32(0));
                self.add(
                    Node::Compare(Compare {
                        op: CmpOp::Ne,
                        ty: MirType::Int32,
                    }),
                    MirType::Boolean,
                    &[v, zero],
                )
            }
            MirType::Undefined | MirType::Null => self.constant(Value::Boolean(false)),
            _ => {
                let rp = self.resume_point(fr, pc, ResumeMode::At, state)?;
                let bx = self.boxed(v);
                let call = self.add_with_rp(
                    Node::VmCall(VmCall {
                        func: VmFunction::ToBoolean,
                    }),
                    MirType::Value,
                    &[bx],
                    rp,
                );
                self.unbox(call, MirType::Boolean, BailoutKind::Normal, rp)
            }
        };
        state.pop();
        Ok(b)
    }

    fn can_inline(&self, fr: &Frame, func: FuncId) -> bool {
        let opts = &self.ctx.options;
        let callee = self.ctx.program.script(func);
        fr.depth < opts.max_inline_depth as usize
            && callee.len() <= opts.max_inline_size as usize
            && !self.inline_stack.contains(&func)
            && !callee.ops().iter().any(|op| matches!(op, Op::Debugger))
    }

    fn inline(
        &mut self,
        fr: &Frame,
        pc: u32,
        func: FuncId,
        argc: u8,
        state: &mut FrameState,
    ) -> Result<(), BuildError> {
        let callee = Arc::clone(self.ctx.program.script(func));
        let mut args = state.pop_n(usize::from(argc));
        let caller_rp = self.resume_point(fr, pc, ResumeMode::Call, state)?;
        let undef = self.constant(Value::Undefined);
        // Missing arguments are undefined; extra ones are dropped.
        args.resize(usize::from(callee.nargs()), undef);
        args.extend(iter::repeat(undef).take(usize::from(callee.nlocals())));
        let entry = FrameState {
            base: args.len(),
            slots: args,
        };

        self.next_site += 1;
        let mut cfr = Frame::new(
            func,
            Arc::clone(&callee),
            self.next_site,
            fr.depth + 1,
            Some(caller_rp),
        );
        let join = self.graph.new_block();
        cfr.return_block = Some(join);
        self.inline_stack.push(func);
        self.build_frame(&mut cfr, entry)?;
        self.inline_stack.pop();

        self.cur = join;
        let returns = cfr.returns;
        let v = match returns.as_slice() {
            [] => {
                return Err(CompilationError::Unsupported(format!(
                    "inlined function {} never returns",
                    callee.name()
                ))
                .into())
            }
            [(_, v)] => *v,
            [(_, first), rest @ ..] if rest.iter().all(|(_, v)| v == first) => *first,
            _ => {
                let ty = MirType::merge(returns.iter().map(|(_, v)| self.graph.ty(*v)));
                let phi = self.graph.add_phi(join, ty);
                for (b, v) in &returns {
                    let v = self
                        .coerce(*b, *v, ty)
                        .expect("merged type accepts every input");
                    self.graph.push_operand(phi, v);
                }
                phi
            }
        };
        state.push(v);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        bytecode::{Program, ScriptBuilder},
        mir::passes,
        options::JitOptions,
        oracle::ProfileOracle,
        testing::assert_matches,
        value::{ShapeId, TypeSet},
    };

    fn build_graph(
        scripts: Vec<Script>,
        setup: impl FnOnce(&mut ProfileOracle),
        opts: JitOptions,
    ) -> Result<Graph, CompilationError> {
        let program = Program::new(scripts).unwrap();
        let mut oracle = ProfileOracle::new(&program);
        setup(&mut oracle);
        let ctx = CompileContext {
            program: &program,
            oracle: &oracle,
            options: &opts,
        };
        let mut g = build(&ctx, FuncId::from_raw(0))?;
        passes::optimize(&mut g);
        Ok(g)
    }

    fn add_script() -> Script {
        let mut b = ScriptBuilder::new("add", 2, 0);
        b.ops(&[Op::GetArg(0), Op::GetArg(1), Op::Add, Op::Return]);
        b.build().unwrap()
    }

    #[test]
    fn int_add_is_speculated() {
        let f = FuncId::from_raw(0);
        let g = build_graph(
            vec![add_script()],
            |o| {
                o.set_arg(f, 0, TypeSet::single(ValueType::Int32));
                o.set_arg(f, 1, TypeSet::single(ValueType::Int32));
                o.set(f, 2, TypeSet::single(ValueType::Int32));
            },
            JitOptions::default(),
        )
        .unwrap();
        assert_matches(
            "func f0
bb0:
  %0: value = parameter 0
  %1: value = parameter 1
  ...
  %{{a}}: int32 = unbox.int32 [argument-check] %0 rp0
  %{{b}}: int32 = unbox.int32 [argument-check] %1 rp0
  ...: none = goto -> bb1
bb1: preds=[bb0]
  %{{c}}: int32 = arith.add.int32 [overflow] %{{a}}, %{{b}} rp...
  %{{d}}: value = box %{{c}}
  ...: none = return %{{d}}
...",
            &g.to_string(),
        );
    }

    #[test]
    fn unknown_types_use_vm_calls() {
        let g = build_graph(vec![add_script()], |_| (), JitOptions::default()).unwrap();
        let s = g.to_string();
        assert!(s.contains("vmcall add %0, %1"), "{s}");
        assert!(!s.contains("unbox"), "{s}");
    }

    #[test]
    fn mixed_numbers_use_doubles() {
        let f = FuncId::from_raw(0);
        let g = build_graph(
            vec![add_script()],
            |o| {
                o.set(f, 2, TypeSet::of(&[ValueType::Int32, ValueType::Double]));
            },
            JitOptions::default(),
        )
        .unwrap();
        let s = g.to_string();
        assert!(s.contains("unbox.double [normal] %0"), "{s}");
        assert!(s.contains("arith.add.double"), "{s}");
    }

    /// `for (i = 0; i < n; i = i + 1) acc = acc + 0.5`: the accumulator starts as an integer but
    /// becomes a double, so its loop phi has to be rebuilt as a double.
    #[test]
    fn loop_phi_is_widened() {
        let mut b = ScriptBuilder::new("f", 1, 2);
        let head = b.new_label();
        let exit = b.new_label();
        b.ops(&[Op::Int(0), Op::SetLocal(0), Op::Int(0), Op::SetLocal(1)]);
        b.bind(head);
        b.ops(&[Op::LoopHead, Op::GetLocal(0), Op::GetArg(0), Op::Lt]);
        b.jump_if_false(exit);
        b.ops(&[Op::GetLocal(1), Op::Double(0.5), Op::Add, Op::SetLocal(1)]);
        b.ops(&[Op::GetLocal(0), Op::Int(1), Op::Add, Op::SetLocal(0)]);
        b.jump(head);
        b.bind(exit);
        b.ops(&[Op::GetLocal(1), Op::Return]);
        let script = b.build().unwrap();
        let f = FuncId::from_raw(0);
        let g = build_graph(
            vec![script],
            |o| {
                o.set_arg(f, 0, TypeSet::single(ValueType::Int32));
                o.set(f, 11, TypeSet::single(ValueType::Double));
                o.set(f, 15, TypeSet::single(ValueType::Int32));
            },
            JitOptions::default(),
        )
        .unwrap();
        let s = g.to_string();
        assert!(s.contains(": double = phi"), "{s}");
        assert!(s.contains(": int32 = phi"), "{s}");
        assert!(s.contains("interruptcheck"), "{s}");
    }

    #[test]
    fn small_callees_are_inlined() {
        let scripts = || {
            let mut caller = ScriptBuilder::new("caller", 1, 0);
            caller.op(Op::GetArg(0));
            caller.call(FuncId::from_raw(1), 0);
            caller.ops(&[Op::Add, Op::Return]);
            let mut one = ScriptBuilder::new("one", 1, 0);
            one.ops(&[Op::GetArg(0), Op::Return]);
            vec![caller.build().unwrap(), one.build().unwrap()]
        };
        let g = build_graph(scripts(), |_| (), JitOptions::default()).unwrap();
        let s = g.to_string();
        assert!(!s.contains("vmcall call"), "{s}");
        // The inlined frame's resume point chains to the caller's.
        assert!(s.contains("f1@0 at [%") && s.contains("caller=rp"), "{s}");

        let g = build_graph(
            scripts(),
            |_| (),
            JitOptions::default().with_max_inline_depth(0),
        )
        .unwrap();
        assert!(g.to_string().contains("vmcall call f1/0"));
    }

    /// `f(o, v) { o.x = v; return o.y }`
    fn property_script() -> Script {
        let mut b = ScriptBuilder::new("f", 2, 0);
        b.ops(&[Op::GetArg(0), Op::GetArg(1)]).set_prop("x");
        b.op(Op::GetArg(0)).get_prop("y").op(Op::Return);
        b.build().unwrap()
    }

    #[test]
    fn monomorphic_properties_use_inline_caches() {
        let f = FuncId::from_raw(0);
        let shape = ShapeId::from_raw(3);
        let g = build_graph(
            vec![property_script()],
            |o| {
                o.observe_shape(f, 2, shape, Some(0));
                o.observe_shape(f, 4, shape, Some(1));
                o.set(f, 4, TypeSet::single(ValueType::Int32));
            },
            JitOptions::default(),
        )
        .unwrap();
        assert_matches(
            "func f0
bb0:
  %0: value = parameter 0
  %1: value = parameter 1
  ...
  ...: none = propcache setprop str#0 shape#3 slot 0 %0, %1 rp{{a}}
  %{{b}}: value = propcache getprop str#1 shape#3 slot 1 %0 rp{{c}}
  %{{d}}: int32 = unbox.int32 [type-barrier] %{{b}} rp{{e}}
  ...",
            &g.to_string(),
        );
    }

    #[test]
    fn unpredictable_properties_use_vm_calls() {
        let f = FuncId::from_raw(0);
        let g = build_graph(
            vec![property_script()],
            |o| {
                // The store adds the property; the load sees two shapes.
                o.observe_shape(f, 2, ShapeId::from_raw(0), None);
                o.observe_shape(f, 4, ShapeId::from_raw(1), Some(0));
                o.observe_shape(f, 4, ShapeId::from_raw(2), Some(0));
            },
            JitOptions::default(),
        )
        .unwrap();
        let s = g.to_string();
        assert!(s.contains("vmcall setprop str#0 %0, %1"), "{s}");
        assert!(s.contains("vmcall getprop str#1 %0"), "{s}");
        assert!(!s.contains("propcache"), "{s}");

        // Slots beyond the fixed ones are only reachable through the runtime.
        let g = build_graph(
            vec![property_script()],
            |o| o.observe_shape(f, 4, ShapeId::from_raw(0), Some(FIXED_SLOTS)),
            JitOptions::default(),
        )
        .unwrap();
        assert!(g.to_string().contains("vmcall getprop"));
    }

    #[test]
    fn debugger_is_unsupported() {
        let mut b = ScriptBuilder::new("f", 0, 0);
        b.ops(&[Op::Debugger, Op::Undefined, Op::Return]);
        match build_graph(vec![b.build().unwrap()], |_| (), JitOptions::default()) {
            Err(CompilationError::Unsupported(_)) => (),
            Err(e) => panic!("{e}"),
            Ok(_) => panic!(),
        }
    }

    #[test]
    fn node_limit() {
        let mut b = ScriptBuilder::new("f", 0, 0);
        for i in 0..100 {
            b.op(Op::Int(i));
            b.op(Op::Pop);
        }
        b.ops(&[Op::Undefined, Op::Return]);
        match build_graph(
            vec![b.build().unwrap()],
            |_| (),
            JitOptions::default().with_max_graph_nodes(20),
        ) {
            Err(CompilationError::LimitExceeded(_)) => (),
            Err(e) => panic!("{e}"),
            Ok(_) => panic!(),
        }
    }
}
