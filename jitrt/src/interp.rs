//! The reference interpreter.
//!
//! The interpreter runs a stack of [InterpFrame]s, innermost last. Normally it is handed a single
//! frame; after a bailout it is handed every frame the bailout reconstructed, and it runs the
//! innermost one and returns into the others in turn. Calls made by interpreted code go through
//! the [Runtime], which decides whether the callee runs in the interpreter or in generated code.
//!
//! While it runs, the interpreter records the type of every value-producing instruction's result
//! in the runtime's [ProfileOracle](crate::oracle::ProfileOracle): these are the observations
//! the compiler speculates on.

use crate::{
    bytecode::{FuncId, Op, Script},
    ops::{self, BinaryOp, CmpOp},
    runtime::{Exec, Runtime, RuntimeError},
    value::Value,
};

/// One interpreter activation.
#[derive(Clone, Debug, PartialEq)]
pub struct InterpFrame {
    pub func: FuncId,
    /// The instruction to execute next. For a frame with a callee frame above it, the call
    /// instruction: the frame continues after it once the callee returns.
    pub pc: u32,
    pub args: Vec<Value>,
    pub locals: Vec<Value>,
    pub stack: Vec<Value>,
}

impl InterpFrame {
    /// A frame about to execute `script` from its start. Missing arguments are `undefined`;
    /// extra ones are dropped.
    pub fn new(func: FuncId, script: &Script, args: &[Value]) -> Self {
        let mut args = args.to_vec();
        args.resize(usize::from(script.nargs()), Value::Undefined);
        Self {
            func,
            pc: 0,
            args,
            locals: vec![Value::Undefined; usize::from(script.nlocals())],
            stack: Vec::new(),
        }
    }

    /// A frame at `pc` whose slots (arguments, then locals, then the operand stack) are `slots`.
    /// Returns `None` if there are fewer slots than arguments and locals.
    pub(crate) fn from_slots(
        func: FuncId,
        pc: u32,
        script: &Script,
        mut slots: Vec<Value>,
    ) -> Option<Self> {
        let nargs = usize::from(script.nargs());
        let nlocals = usize::from(script.nlocals());
        if slots.len() < nargs + nlocals {
            return None;
        }
        let stack = slots.split_off(nargs + nlocals);
        let locals = slots.split_off(nargs);
        Some(Self {
            func,
            pc,
            args: slots,
            locals,
            stack,
        })
    }

    fn pop(&mut self) -> Result<Value, RuntimeError> {
        self.stack.pop().ok_or_else(|| {
            RuntimeError::Internal(format!("f{}@{}: operand stack underflow", self.func.raw(), self.pc))
        })
    }

    fn pop_n(&mut self, n: usize) -> Result<Vec<Value>, RuntimeError> {
        if n > self.stack.len() {
            return Err(RuntimeError::Internal(format!(
                "f{}@{}: operand stack underflow",
                self.func.raw(),
                self.pc
            )));
        }
        Ok(self.stack.split_off(self.stack.len() - n))
    }
}

/// Run `frames` (innermost last) to completion, returning the outermost frame's result.
pub(crate) fn run(
    rt: &Runtime,
    exec: &mut Exec,
    frames: Vec<InterpFrame>,
) -> Result<Value, RuntimeError> {
    let base = exec.depth;
    let r = exec
        .enter(frames.len(), rt.options().max_frames)
        .and_then(|_| run_frames(rt, exec, frames));
    exec.depth = base;
    r
}

fn run_frames(
    rt: &Runtime,
    exec: &mut Exec,
    mut frames: Vec<InterpFrame>,
) -> Result<Value, RuntimeError> {
    loop {
        let Some(fr) = frames.last_mut() else {
            return Err(RuntimeError::Internal("no frame to run".to_owned()));
        };
        let script = rt.program().script(fr.func);
        let pc = fr.pc;
        if pc as usize >= script.len() {
            return Err(RuntimeError::Internal(format!(
                "f{}: pc {pc} out of bounds",
                fr.func.raw()
            )));
        }
        fr.pc = pc + 1;
        match script.op(pc) {
            Op::Nop | Op::Debugger => (),
            Op::Pop => {
                fr.pop()?;
            }
            Op::Dup => {
                let v = fr.pop()?;
                fr.stack.extend([v, v]);
            }
            Op::Int(x) => fr.stack.push(Value::Int32(x)),
            Op::Double(d) => fr.stack.push(Value::Double(d)),
            Op::Str(i) => fr.stack.push(Value::String(script.const_id(i))),
            Op::Undefined => fr.stack.push(Value::Undefined),
            Op::Null => fr.stack.push(Value::Null),
            Op::True => fr.stack.push(Value::Boolean(true)),
            Op::False => fr.stack.push(Value::Boolean(false)),
            Op::GetArg(i) => fr.stack.push(fr.args[usize::from(i)]),
            Op::SetArg(i) => fr.args[usize::from(i)] = fr.pop()?,
            Op::GetLocal(i) => fr.stack.push(fr.locals[usize::from(i)]),
            Op::SetLocal(i) => fr.locals[usize::from(i)] = fr.pop()?,
            op @ (Op::Add | Op::Sub | Op::Mul | Op::BitAnd | Op::BitOr) => {
                let b = fr.pop()?;
                let a = fr.pop()?;
                let v = ops::binary(&mut rt.heap(), binary_op(op), a, b);
                rt.observe(fr.func, pc, v);
                fr.stack.push(v);
            }
            op @ (Op::Lt | Op::Le | Op::Gt | Op::Ge | Op::Eq | Op::Ne) => {
                let b = fr.pop()?;
                let a = fr.pop()?;
                let v = Value::Boolean(ops::compare(&rt.heap(), cmp_op(op), a, b));
                rt.observe(fr.func, pc, v);
                fr.stack.push(v);
            }
            Op::Not => {
                let a = fr.pop()?;
                let v = Value::Boolean(!ops::to_boolean(&rt.heap(), a));
                rt.observe(fr.func, pc, v);
                fr.stack.push(v);
            }
            Op::NewObject(i) => {
                let v = Value::Object(rt.heap().new_object_of(script.const_id(i)));
                rt.observe(fr.func, pc, v);
                fr.stack.push(v);
            }
            Op::GetProp(i) => {
                let obj = fr.pop()?;
                let name = script.const_id(i);
                rt.observe_property(fr.func, pc, obj, name);
                let v = rt.heap().get_property(obj, name);
                rt.observe(fr.func, pc, v);
                fr.stack.push(v);
            }
            Op::SetProp(i) => {
                let v = fr.pop()?;
                let obj = fr.pop()?;
                let name = script.const_id(i);
                // The shape before the store: that is what generated code will check.
                rt.observe_property(fr.func, pc, obj, name);
                rt.heap().set_property(obj, name, v);
            }
            Op::Jump(t) => fr.pc = t,
            Op::JumpIfFalse(t) => {
                let a = fr.pop()?;
                if !ops::to_boolean(&rt.heap(), a) {
                    fr.pc = t;
                }
            }
            Op::JumpIfTrue(t) => {
                let a = fr.pop()?;
                if ops::to_boolean(&rt.heap(), a) {
                    fr.pc = t;
                }
            }
            Op::LoopHead => {
                if rt.interrupt_pending() {
                    rt.service_interrupt(exec)?;
                }
            }
            Op::Call { func, argc } => {
                let args = fr.pop_n(usize::from(argc))?;
                let caller = fr.func;
                let v = rt.call_with(exec, func, args)?;
                rt.observe(caller, pc, v);
                // `frames` cannot have changed: the callee ran in its own activation.
                if let Some(fr) = frames.last_mut() {
                    fr.stack.push(v);
                }
            }
            Op::Return => {
                let v = fr.pop()?;
                frames.pop();
                exec.depth -= 1;
                match frames.last_mut() {
                    None => return Ok(v),
                    Some(caller) => {
                        // A caller frame from a bailout: it is stopped at its call instruction.
                        rt.observe(caller.func, caller.pc, v);
                        caller.stack.push(v);
                        caller.pc += 1;
                    }
                }
            }
        }
    }
}

fn binary_op(op: Op) -> BinaryOp {
    match op {
        Op::Sub => BinaryOp::Sub,
        Op::Mul => BinaryOp::Mul,
        Op::BitAnd => BinaryOp::BitAnd,
        Op::BitOr => BinaryOp::BitOr,
        _ => BinaryOp::Add,
    }
}

fn cmp_op(op: Op) -> CmpOp {
    match op {
        Op::Lt => CmpOp::Lt,
        Op::Le => CmpOp::Le,
        Op::Gt => CmpOp::Gt,
        Op::Ge => CmpOp::Ge,
        Op::Eq => CmpOp::Eq,
        _ => CmpOp::Ne,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        bytecode::{Program, ScriptBuilder},
        options::JitOptions,
        oracle::ShapeCache,
        value::{TypeSet, ValueType},
    };

    /// A runtime that never compiles, so that everything runs here.
    fn interpreter(scripts: Vec<Script>) -> Runtime {
        let program = Program::new(scripts).unwrap();
        Runtime::new(program, JitOptions::default().with_hot_threshold(u32::MAX)).unwrap()
    }

    #[test]
    fn frame_slots() {
        let mut b = ScriptBuilder::new("f", 2, 1);
        b.ops(&[Op::Int(1), Op::Return]);
        let script = b.build().unwrap();
        let f = FuncId::from_raw(0);
        let fr = InterpFrame::new(f, &script, &[Value::Int32(1)]);
        assert_eq!(fr.args, [Value::Int32(1), Value::Undefined]);
        assert_eq!(fr.locals, [Value::Undefined]);
        let slots = vec![Value::Int32(1), Value::Null, Value::Boolean(true), Value::Int32(4)];
        let fr = InterpFrame::from_slots(f, 1, &script, slots).unwrap();
        assert_eq!(fr.args, [Value::Int32(1), Value::Null]);
        assert_eq!(fr.locals, [Value::Boolean(true)]);
        assert_eq!(fr.stack, [Value::Int32(4)]);
        assert!(InterpFrame::from_slots(f, 1, &script, vec![Value::Null]).is_none());
    }

    #[test]
    fn loops_and_calls() {
        // f(n): s = 0; i = 0; while i < n { s = s + sq(i); i = i + 1 }; return s
        let sq = FuncId::from_raw(1);
        let mut b = ScriptBuilder::new("f", 1, 2);
        let (top, out) = (b.new_label(), b.new_label());
        b.ops(&[Op::Int(0), Op::SetLocal(0), Op::Int(0), Op::SetLocal(1)]);
        b.bind(top);
        b.ops(&[Op::LoopHead, Op::GetLocal(1), Op::GetArg(0), Op::Lt]);
        b.jump_if_false(out);
        b.ops(&[Op::GetLocal(0), Op::GetLocal(1)]);
        b.call(sq, 1);
        b.ops(&[Op::Add, Op::SetLocal(0)]);
        b.ops(&[Op::GetLocal(1), Op::Int(1), Op::Add, Op::SetLocal(1)]);
        b.jump(top);
        b.bind(out);
        b.ops(&[Op::GetLocal(0), Op::Return]);
        let f = b.build().unwrap();
        let mut b = ScriptBuilder::new("sq", 1, 0);
        b.ops(&[Op::GetArg(0), Op::Dup, Op::Mul, Op::Return]);
        let rt = interpreter(vec![f, b.build().unwrap()]);
        let r = rt.call(FuncId::from_raw(0), &[Value::Int32(4)]).unwrap();
        assert_eq!(r, Value::Int32(1 + 4 + 9));
    }

    #[test]
    fn strings_and_overflow() {
        let mut b = ScriptBuilder::new("f", 2, 0);
        b.ops(&[Op::GetArg(0), Op::GetArg(1), Op::Add, Op::Return]);
        let rt = interpreter(vec![b.build().unwrap()]);
        let f = FuncId::from_raw(0);
        let r = rt
            .call(f, &[Value::Int32(i32::MAX), Value::Int32(1)])
            .unwrap();
        assert_eq!(r, Value::Double(2147483648.0));
        let s = rt.string("n=");
        let r = rt.call(f, &[s, Value::Int32(3)]).unwrap();
        assert_eq!(rt.display(r), "n=3");
        // Both results were observed.
        assert_eq!(rt.observed(f, 2).iter().count(), 2);
    }

    #[test]
    fn properties() {
        // f(o, v): o.x = v; return o.x
        let mut b = ScriptBuilder::new("f", 2, 0);
        b.ops(&[Op::GetArg(0), Op::GetArg(1)]).set_prop("x");
        b.op(Op::GetArg(0)).get_prop("x").op(Op::Return);
        let rt = interpreter(vec![b.build().unwrap()]);
        let f = FuncId::from_raw(0);
        let o = rt.object("Point");
        assert_eq!(rt.call(f, &[o, Value::Int32(3)]), Ok(Value::Int32(3)));
        // The store added the property, so it saw the empty shape; the load saw the new one.
        let ShapeCache::Mono { shape: before, slot: None } = rt.property_cache(f, 2) else {
            panic!("{:?}", rt.property_cache(f, 2));
        };
        let ShapeCache::Mono { shape: after, slot: Some(0) } = rt.property_cache(f, 4) else {
            panic!("{:?}", rt.property_cache(f, 4));
        };
        assert_ne!(before, after);
        assert_eq!(rt.call(f, &[o, Value::Int32(4)]), Ok(Value::Int32(4)));
        assert_eq!(rt.property_cache(f, 2), ShapeCache::Poly);
        // Non-objects have no properties, and are not recorded.
        assert_eq!(rt.call(f, &[Value::Int32(1), Value::Int32(4)]), Ok(Value::Undefined));
        assert!(matches!(rt.property_cache(f, 4), ShapeCache::Mono { .. }));
        assert_eq!(
            rt.observed(f, 4),
            TypeSet::of(&[ValueType::Int32, ValueType::Undefined])
        );

        let mut b = ScriptBuilder::new("g", 0, 0);
        b.new_object("Point").op(Op::Return);
        let rt = interpreter(vec![b.build().unwrap()]);
        let r = rt.call(f, &[]).unwrap();
        assert_eq!(rt.display(r), "[object Point]");
    }

    #[test]
    fn runaway_recursion() {
        let mut b = ScriptBuilder::new("f", 0, 0);
        b.call(FuncId::from_raw(0), 0);
        b.op(Op::Return);
        let program = Program::new(vec![b.build().unwrap()]).unwrap();
        let opts = JitOptions::default()
            .with_hot_threshold(u32::MAX)
            .with_max_frames(50);
        let rt = Runtime::new(program, opts).unwrap();
        assert!(matches!(
            rt.call(FuncId::from_raw(0), &[]),
            Err(RuntimeError::StackOverflow)
        ));
    }
}
