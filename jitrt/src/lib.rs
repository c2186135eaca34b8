//! An optimising back end for a speculative JIT.
//!
//! Hot functions are compiled from bytecode, through a typed SSA graph (MIR) and a low-level IR
//! (LIR) with virtual registers, into code for a portable target. The compiler speculates on the
//! types the interpreter has observed; every speculation is guarded, and each guard has a
//! snapshot from which the bailout engine rebuilds the interpreter frames the generated code
//! stands in for.

#![allow(clippy::new_without_default)]
#![allow(clippy::comparison_chain)]

mod bailout;
pub mod bytecode;
mod code;
mod codegen;
pub mod compile;
mod frame;
mod function;
mod interp;
mod lir;
pub mod log;
mod mir;
pub mod ops;
pub mod options;
pub mod oracle;
mod runtime;
#[cfg(test)]
mod testing;
pub mod value;

pub use self::{
    bailout::{BailoutReport, BailoutResult},
    code::GeneratedCode,
    codegen::{sim::machine::MachineError, CompiledFunction},
    frame::{FrameDescriptor, FrameKind, SIZE_CLASSES},
    function::JitState,
    interp::InterpFrame,
    log::stats::StatsCounts,
    runtime::{RootScan, Runtime, RuntimeError},
};
pub use jitsnap::BailoutKind;
