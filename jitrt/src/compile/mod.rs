//! Compile a function's bytecode to generated code.
//!
//! A compilation goes through MIR (built, then optimised), LIR (lowered, then register
//! allocated), and finally target code. The IR of each stage can be logged with `JITRT_LOG_IR`
//! when the `jitrt_debug` feature is enabled.

use crate::{
    bytecode::{FuncId, Program},
    codegen::{self, CompiledFunction},
    lir,
    log::{log_ir, should_log_ir, IRPhase},
    mir,
    options::JitOptions,
    oracle::TypeOracle,
};
use thiserror::Error;

/// A failure to compile a function. None of these are fatal: the function keeps running in the
/// interpreter.
#[derive(Error, Debug, PartialEq)]
pub enum CompilationError {
    #[error("General error: {0}")]
    /// Compilation failed for a reason not covered by the other variants.
    General(String),
    #[error("Unsupported: {0}")]
    /// The function uses a feature, or needs an instruction template, that the compiler or the
    /// target does not provide.
    Unsupported(String),
    #[error("Limit exceeded: {0}")]
    /// The function is too large or too complex to compile with the configured limits.
    LimitExceeded(String),
    #[error("Internal error: {0}")]
    /// Something went wrong when compiling that is probably the result of a bug in jitrt.
    InternalError(String),
}

/// Everything a compilation reads. A compilation never writes to shared state, so several can
/// run at once on different threads.
pub struct CompileContext<'a> {
    pub program: &'a Program,
    pub oracle: &'a dyn TypeOracle,
    pub options: &'a JitOptions,
}

/// Compile `func` into position independent code, ready to be installed in a
/// [CodeSpace](crate::code::CodeSpace).
pub fn compile(ctx: &CompileContext, func: FuncId) -> Result<CompiledFunction, CompilationError> {
    if ctx.program.get(func).is_none() {
        return Err(CompilationError::General(format!(
            "no function f{}",
            func.raw()
        )));
    }
    let mut g = mir::builder::build(ctx, func)?;
    if should_log_ir(IRPhase::Mir) {
        log_ir(&format!("--- Begin mir ---\n{g}--- End mir ---\n"));
    }
    mir::passes::optimize(&mut g);
    if should_log_ir(IRPhase::MirOpt) {
        log_ir(&format!("--- Begin mir-opt ---\n{g}--- End mir-opt ---\n"));
    }
    let lir = lir::lower::lower(ctx, &g)?;
    let alloc = lir::regalloc::allocate(&lir)?;
    if should_log_ir(IRPhase::Lir) {
        log_ir(&format!(
            "--- Begin lir ---\n{}--- End lir ---\n",
            lir.display(Some(&alloc))
        ));
    }
    let cf = codegen::generate(&lir, &alloc)?;
    if should_log_ir(IRPhase::Asm) {
        log_ir(&format!(
            "--- Begin asm ---\n{}--- End asm ---\n",
            cf.disassemble()
        ));
    }
    Ok(cf)
}
