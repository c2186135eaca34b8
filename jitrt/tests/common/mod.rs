#![allow(dead_code)]

use jitrt::{
    bytecode::{FuncId, Op, Program, Script, ScriptBuilder},
    options::JitOptions,
    Runtime,
};
use std::env;

pub fn f(i: u32) -> FuncId {
    FuncId::from_raw(i)
}

/// A runtime for `scripts` that records statistics.
pub fn runtime(scripts: Vec<Script>, opts: JitOptions) -> Runtime {
    // Statistics are only recorded when this is set. Every test sets it to the same value.
    env::set_var("JITRT_LOG_STATS", "-");
    Runtime::new(Program::new(scripts).unwrap(), opts).unwrap()
}

/// `name(a, b) = a + b`.
pub fn add(name: &str) -> Script {
    let mut b = ScriptBuilder::new(name, 2, 0);
    b.ops(&[Op::GetArg(0), Op::GetArg(1), Op::Add, Op::Return]);
    b.build().unwrap()
}

/// `name(a, b) = callee(a, b)`.
pub fn forward(name: &str, callee: FuncId) -> Script {
    let mut b = ScriptBuilder::new(name, 2, 0);
    b.ops(&[Op::GetArg(0), Op::GetArg(1)]);
    b.call(callee, 2);
    b.op(Op::Return);
    b.build().unwrap()
}
