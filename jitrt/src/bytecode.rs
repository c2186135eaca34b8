//! The stack bytecode executed by the interpreter and consumed by the graph builder.
//!
//! A [Script] is a flat sequence of [Op]s addressed by instruction index (its "pc"). Every
//! script is verified on construction, which also produces the side table of expected operand
//! stack depths used to validate resume points.

use crate::value::StrId;
use index_vec::IndexVec;
use std::{collections::HashMap, fmt, sync::Arc};
use thiserror::Error;

index_vec::define_index_type! {
    pub struct FuncId = u32;
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Op {
    Nop,
    Pop,
    Dup,
    Int(i32),
    Double(f64),
    /// Push the string constant at the given index of the script's constant table.
    Str(u32),
    Undefined,
    Null,
    True,
    False,
    GetArg(u16),
    SetArg(u16),
    GetLocal(u16),
    SetLocal(u16),
    Add,
    Sub,
    Mul,
    BitAnd,
    BitOr,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    Not,
    Jump(u32),
    JumpIfFalse(u32),
    JumpIfTrue(u32),
    /// Marks the head of a loop. Generated code checks for interrupts here.
    LoopHead,
    Call {
        func: FuncId,
        argc: u8,
    },
    Return,
    /// Push a new, empty object whose class is the string constant at the given index.
    NewObject(u32),
    /// Replace the object on top of the stack with its property named by the given string
    /// constant, or with `undefined` if it has no such property or is not an object.
    GetProp(u32),
    /// Pop a value and an object and store the value in the object's property named by the
    /// given string constant. Storing to a non-object does nothing.
    SetProp(u32),
    /// Accepted by the interpreter (as a no-op) but never compiled.
    Debugger,
}

impl Op {
    /// How many values this instruction pops and pushes.
    pub fn stack_effect(&self) -> (u32, u32) {
        match self {
            Op::Nop | Op::LoopHead | Op::Debugger | Op::Jump(_) => (0, 0),
            Op::Pop | Op::SetArg(_) | Op::SetLocal(_) => (1, 0),
            Op::JumpIfFalse(_) | Op::JumpIfTrue(_) | Op::Return => (1, 0),
            Op::Dup => (1, 2),
            Op::Int(_)
            | Op::Double(_)
            | Op::Str(_)
            | Op::Undefined
            | Op::Null
            | Op::True
            | Op::False
            | Op::GetArg(_)
            | Op::GetLocal(_)
            | Op::NewObject(_) => (0, 1),
            Op::Add
            | Op::Sub
            | Op::Mul
            | Op::BitAnd
            | Op::BitOr
            | Op::Lt
            | Op::Le
            | Op::Gt
            | Op::Ge
            | Op::Eq
            | Op::Ne => (2, 1),
            Op::Not | Op::GetProp(_) => (1, 1),
            Op::SetProp(_) => (2, 0),
            Op::Call { argc, .. } => (u32::from(*argc), 1),
        }
    }

    /// If this instruction can transfer control somewhere other than the next instruction,
    /// return that target.
    pub fn jump_target(&self) -> Option<u32> {
        match self {
            Op::Jump(t) | Op::JumpIfFalse(t) | Op::JumpIfTrue(t) => Some(*t),
            _ => None,
        }
    }

    /// Can control fall through to the next instruction?
    pub fn falls_through(&self) -> bool {
        !matches!(self, Op::Jump(_) | Op::Return)
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Int(x) => write!(f, "int {x}"),
            Op::Double(x) => write!(f, "double {x}"),
            Op::Str(x) => write!(f, "str #{x}"),
            Op::GetArg(x) => write!(f, "getarg {x}"),
            Op::SetArg(x) => write!(f, "setarg {x}"),
            Op::GetLocal(x) => write!(f, "getlocal {x}"),
            Op::SetLocal(x) => write!(f, "setlocal {x}"),
            Op::Jump(x) => write!(f, "jump @{x}"),
            Op::JumpIfFalse(x) => write!(f, "jumpiffalse @{x}"),
            Op::JumpIfTrue(x) => write!(f, "jumpiftrue @{x}"),
            Op::Call { func, argc } => write!(f, "call f{} {argc}", func.raw()),
            Op::NewObject(x) => write!(f, "newobject #{x}"),
            Op::GetProp(x) => write!(f, "getprop #{x}"),
            Op::SetProp(x) => write!(f, "setprop #{x}"),
            _ => write!(f, "{}", format!("{self:?}").to_lowercase()),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum BytecodeError {
    #[error("{script}@{pc}: jump to {target} is out of range")]
    BadJump { script: String, pc: u32, target: u32 },
    #[error("{script}@{pc}: operand stack underflow")]
    StackUnderflow { script: String, pc: u32 },
    #[error("{script}@{pc}: inconsistent stack depths {first} and {second}")]
    InconsistentDepth {
        script: String,
        pc: u32,
        first: u32,
        second: u32,
    },
    #[error("{script}@{pc}: control falls off the end of the script")]
    FallsOffEnd { script: String, pc: u32 },
    #[error("{script}@{pc}: {what} index {idx} out of range")]
    BadIndex {
        script: String,
        pc: u32,
        what: &'static str,
        idx: u32,
    },
    #[error("{script}: script is empty")]
    Empty { script: String },
}

pub struct Script {
    name: String,
    nargs: u16,
    nlocals: u16,
    consts: Vec<Arc<str>>,
    /// The [StrId]s of `consts`, filled in by [Program::new].
    const_ids: Vec<StrId>,
    code: Vec<Op>,
    /// The operand stack depth before each instruction, or `None` if the instruction is
    /// unreachable.
    depths: Vec<Option<u32>>,
    max_depth: u32,
}

impl Script {
    pub fn new(
        name: &str,
        nargs: u16,
        nlocals: u16,
        consts: Vec<Arc<str>>,
        code: Vec<Op>,
    ) -> Result<Self, BytecodeError> {
        let mut s = Script {
            name: name.to_owned(),
            nargs,
            nlocals,
            consts,
            const_ids: Vec::new(),
            code,
            depths: Vec::new(),
            max_depth: 0,
        };
        s.verify()?;
        Ok(s)
    }

    /// Check the script's basic rules, computing the stack depth table along the way.
    fn verify(&mut self) -> Result<(), BytecodeError> {
        if self.code.is_empty() {
            return Err(BytecodeError::Empty {
                script: self.name.clone(),
            });
        }
        let len = u32::try_from(self.code.len()).map_err(|_| BytecodeError::BadIndex {
            script: self.name.clone(),
            pc: 0,
            what: "code",
            idx: u32::MAX,
        })?;
        let mut depths = vec![None; self.code.len()];
        let mut max_depth = 0;
        let mut todo = vec![(0u32, 0u32)];
        let err_name = || self.name.clone();
        while let Some((pc, depth)) = todo.pop() {
            match depths[pc as usize] {
                Some(d) if d == depth => continue,
                Some(d) => {
                    return Err(BytecodeError::InconsistentDepth {
                        script: err_name(),
                        pc,
                        first: d,
                        second: depth,
                    })
                }
                None => depths[pc as usize] = Some(depth),
            }
            let op = self.code[pc as usize];
            self.check_indices(pc, &op)?;
            let (pops, pushes) = op.stack_effect();
            if depth < pops {
                return Err(BytecodeError::StackUnderflow {
                    script: err_name(),
                    pc,
                });
            }
            let after = depth - pops + pushes;
            max_depth = max_depth.max(after).max(depth);
            if let Some(target) = op.jump_target() {
                if target >= len {
                    return Err(BytecodeError::BadJump {
                        script: err_name(),
                        pc,
                        target,
                    });
                }
                todo.push((target, after));
            }
            if op.falls_through() {
                if pc + 1 >= len {
                    return Err(BytecodeError::FallsOffEnd {
                        script: err_name(),
                        pc,
                    });
                }
                todo.push((pc + 1, after));
            }
        }
        self.depths = depths;
        self.max_depth = max_depth;
        Ok(())
    }

    fn check_indices(&self, pc: u32, op: &Op) -> Result<(), BytecodeError> {
        let (what, idx, max) = match *op {
            Op::GetArg(i) | Op::SetArg(i) => ("argument", u32::from(i), u32::from(self.nargs)),
            Op::GetLocal(i) | Op::SetLocal(i) => ("local", u32::from(i), u32::from(self.nlocals)),
            Op::Str(i) | Op::NewObject(i) | Op::GetProp(i) | Op::SetProp(i) => {
                ("constant", i, self.consts.len() as u32)
            }
            _ => return Ok(()),
        };
        if idx >= max {
            return Err(BytecodeError::BadIndex {
                script: self.name.clone(),
                pc,
                what,
                idx,
            });
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nargs(&self) -> u16 {
        self.nargs
    }

    pub fn nlocals(&self) -> u16 {
        self.nlocals
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn op(&self, pc: u32) -> Op {
        self.code[pc as usize]
    }

    pub fn ops(&self) -> &[Op] {
        &self.code
    }

    /// The operand stack depth before the instruction at `pc`, or `None` if it is unreachable.
    pub fn depth_at(&self, pc: u32) -> Option<u32> {
        self.depths.get(pc as usize).copied().flatten()
    }

    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    /// How many slots a frame of this script has at `pc`: arguments, locals, then the operand
    /// stack.
    pub fn nslots_at(&self, pc: u32) -> Option<u32> {
        self.depth_at(pc)
            .map(|d| u32::from(self.nargs) + u32::from(self.nlocals) + d)
    }

    pub fn const_id(&self, idx: u32) -> StrId {
        self.const_ids[idx as usize]
    }
}

impl fmt::Display for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "script {}(args={}, locals={})",
            self.name, self.nargs, self.nlocals
        )?;
        for (pc, op) in self.code.iter().enumerate() {
            writeln!(f, "  @{pc}: {op}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// A set of scripts that can call each other, together with their interned string constants.
#[derive(Debug)]
pub struct Program {
    scripts: IndexVec<FuncId, Arc<Script>>,
    strings: Vec<Arc<str>>,
}

impl Program {
    pub fn new(scripts: Vec<Script>) -> Result<Self, BytecodeError> {
        let nscripts = scripts.len();
        let mut strings: Vec<Arc<str>> = Vec::new();
        let mut interned: HashMap<Arc<str>, StrId> = HashMap::new();
        let mut out = IndexVec::with_capacity(nscripts);
        for mut s in scripts {
            for (pc, op) in s.code.iter().enumerate() {
                if let Op::Call { func, .. } = op {
                    if func.index() >= nscripts {
                        return Err(BytecodeError::BadIndex {
                            script: s.name.clone(),
                            pc: pc as u32,
                            what: "function",
                            idx: func.raw(),
                        });
                    }
                }
            }
            s.const_ids = s
                .consts
                .iter()
                .map(|c| {
                    *interned.entry(Arc::clone(c)).or_insert_with(|| {
                        strings.push(Arc::clone(c));
                        StrId::from_usize(strings.len() - 1)
                    })
                })
                .collect();
            out.push(Arc::new(s));
        }
        Ok(Self {
            scripts: out,
            strings,
        })
    }

    pub fn script(&self, func: FuncId) -> &Arc<Script> {
        &self.scripts[func]
    }

    pub fn get(&self, func: FuncId) -> Option<&Arc<Script>> {
        self.scripts.get(func)
    }

    pub fn len(&self) -> usize {
        self.scripts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }

    pub fn funcs(&self) -> impl Iterator<Item = FuncId> {
        self.scripts.indices()
    }

    /// The program's string constants, in [StrId] order.
    pub fn strings(&self) -> &[Arc<str>] {
        &self.strings
    }
}

/// A label for [ScriptBuilder].
#[derive(Clone, Copy, Debug)]
pub struct Label(usize);

/// Assembles a [Script], resolving forward jumps.
pub struct ScriptBuilder {
    name: String,
    nargs: u16,
    nlocals: u16,
    consts: Vec<Arc<str>>,
    code: Vec<Op>,
    labels: Vec<Option<u32>>,
    fixups: Vec<(usize, Label)>,
}

impl ScriptBuilder {
    pub fn new(name: &str, nargs: u16, nlocals: u16) -> Self {
        Self {
            name: name.to_owned(),
            nargs,
            nlocals,
            consts: Vec::new(),
            code: Vec::new(),
            labels: Vec::new(),
            fixups: Vec::new(),
        }
    }

    pub fn op(&mut self, op: Op) -> &mut Self {
        self.code.push(op);
        self
    }

    pub fn ops(&mut self, ops: &[Op]) -> &mut Self {
        self.code.extend_from_slice(ops);
        self
    }

    /// Push the string `s`.
    pub fn str(&mut self, s: &str) -> &mut Self {
        let idx = self.constant(s);
        self.op(Op::Str(idx))
    }

    pub fn new_object(&mut self, class: &str) -> &mut Self {
        let i = self.constant(class);
        self.op(Op::NewObject(i))
    }

    pub fn get_prop(&mut self, name: &str) -> &mut Self {
        let i = self.constant(name);
        self.op(Op::GetProp(i))
    }

    pub fn set_prop(&mut self, name: &str) -> &mut Self {
        let i = self.constant(name);
        self.op(Op::SetProp(i))
    }

    fn constant(&mut self, s: &str) -> u32 {
        let idx = match self.consts.iter().position(|c| &**c == s) {
            Some(i) => i,
            None => {
                self.consts.push(Arc::from(s));
                self.consts.len() - 1
            }
        };
        idx as u32
    }

    pub fn call(&mut self, func: FuncId, argc: u8) -> &mut Self {
        self.op(Op::Call { func, argc })
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Bind `l` to the next instruction.
    pub fn bind(&mut self, l: Label) -> &mut Self {
        self.labels[l.0] = Some(self.code.len() as u32);
        self
    }

    pub fn jump(&mut self, l: Label) -> &mut Self {
        self.fixups.push((self.code.len(), l));
        self.op(Op::Jump(u32::MAX))
    }

    pub fn jump_if_false(&mut self, l: Label) -> &mut Self {
        self.fixups.push((self.code.len(), l));
        self.op(Op::JumpIfFalse(u32::MAX))
    }

    pub fn jump_if_true(&mut self, l: Label) -> &mut Self {
        self.fixups.push((self.code.len(), l));
        self.op(Op::JumpIfTrue(u32::MAX))
    }

    pub fn build(&mut self) -> Result<Script, BytecodeError> {
        let mut code = self.code.clone();
        for (pc, l) in &self.fixups {
            let target = self.labels[l.0].unwrap_or(u32::MAX);
            code[*pc] = match code[*pc] {
                Op::Jump(_) => Op::Jump(target),
                Op::JumpIfFalse(_) => Op::JumpIfFalse(target),
                Op::JumpIfTrue(_) => Op::JumpIfTrue(target),
                x => x,
            };
        }
        Script::new(&self.name, self.nargs, self.nlocals, self.consts.clone(), code)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn depths() {
        // local0 = 0; while (local0 < arg0) local0 = local0 + 1; return local0
        let mut b = ScriptBuilder::new("count", 1, 1);
        let head = b.new_label();
        let exit = b.new_label();
        b.op(Op::Int(0)).op(Op::SetLocal(0));
        b.bind(head).op(Op::LoopHead);
        b.op(Op::GetLocal(0)).op(Op::GetArg(0)).op(Op::Lt);
        b.jump_if_false(exit);
        b.op(Op::GetLocal(0)).op(Op::Int(1)).op(Op::Add).op(Op::SetLocal(0));
        b.jump(head);
        b.bind(exit).op(Op::GetLocal(0)).op(Op::Return);
        let s = b.build().unwrap();
        assert_eq!(s.depth_at(0), Some(0));
        assert_eq!(s.depth_at(5), Some(2));
        assert_eq!(s.depth_at(6), Some(1));
        assert_eq!(s.depth_at(7), Some(0));
        assert_eq!(s.nslots_at(5), Some(4));
        assert_eq!(s.max_depth(), 2);
        assert_eq!(s.op(6), Op::JumpIfFalse(12));
    }

    #[test]
    fn verification_errors() {
        let e = Script::new("a", 0, 0, vec![], vec![Op::Add, Op::Return]).unwrap_err();
        assert!(matches!(e, BytecodeError::StackUnderflow { pc: 0, .. }));
        let e = Script::new("b", 0, 0, vec![], vec![Op::Int(1)]).unwrap_err();
        assert!(matches!(e, BytecodeError::FallsOffEnd { pc: 0, .. }));
        let e = Script::new("c", 0, 0, vec![], vec![Op::Jump(7)]).unwrap_err();
        assert!(matches!(e, BytecodeError::BadJump { target: 7, .. }));
        let e = Script::new("d", 1, 0, vec![], vec![Op::GetArg(1), Op::Return]).unwrap_err();
        assert!(matches!(
            e,
            BytecodeError::BadIndex {
                what: "argument",
                idx: 1,
                ..
            }
        ));
        // Two paths reach @3 with different depths.
        let e = Script::new(
            "e",
            0,
            0,
            vec![],
            vec![
                Op::True,
                Op::JumpIfTrue(3),
                Op::Int(1),
                Op::Undefined,
                Op::Return,
            ],
        )
        .unwrap_err();
        assert!(matches!(e, BytecodeError::InconsistentDepth { pc: 3, .. }));
        let e = Script::new("f", 0, 0, vec![], vec![Op::NewObject(0), Op::Return]).unwrap_err();
        assert!(matches!(
            e,
            BytecodeError::BadIndex {
                what: "constant",
                idx: 0,
                ..
            }
        ));
    }

    #[test]
    fn property_ops() {
        // o = new Point; o.x = 3; return o.x
        let mut b = ScriptBuilder::new("point", 0, 1);
        b.new_object("Point").op(Op::SetLocal(0));
        b.op(Op::GetLocal(0)).op(Op::Int(3)).set_prop("x");
        b.op(Op::GetLocal(0)).get_prop("x").op(Op::Return);
        let s = b.build().unwrap();
        assert_eq!(s.op(0), Op::NewObject(0));
        assert_eq!(s.op(4), Op::SetProp(1));
        assert_eq!(s.op(6), Op::GetProp(1));
        assert_eq!(s.depth_at(4), Some(2));
        assert_eq!(s.depth_at(5), Some(0));
        assert_eq!(s.depth_at(7), Some(1));
        assert_eq!(s.op(6).to_string(), "getprop #1");
    }

    #[test]
    fn program_interns_constants() {
        let mut a = ScriptBuilder::new("a", 0, 0);
        a.str("x").str("y").op(Op::Pop).op(Op::Return);
        let mut b = ScriptBuilder::new("b", 0, 0);
        b.str("y").call(FuncId::from_raw(0), 0).op(Op::Pop).op(Op::Return);
        let p = Program::new(vec![a.build().unwrap(), b.build().unwrap()]).unwrap();
        assert_eq!(p.strings().len(), 2);
        let a = p.script(FuncId::from_raw(0));
        let b = p.script(FuncId::from_raw(1));
        assert_eq!(a.const_id(1), b.const_id(0));

        let mut c = ScriptBuilder::new("c", 0, 0);
        c.call(FuncId::from_raw(5), 0).op(Op::Return);
        assert!(matches!(
            Program::new(vec![c.build().unwrap()]),
            Err(BytecodeError::BadIndex {
                what: "function",
                ..
            })
        ));
    }
}
