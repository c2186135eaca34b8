//! Per-function JIT state: when to compile a function, and whether it has code to enter.

use crate::code::GeneratedCode;
use parking_lot::Mutex;
use std::{fmt, sync::Arc};

/// The publicly visible state of a function. See [JitFunction] for the transitions.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum JitState {
    /// Interpreted, and called this many times since the last (re)start of counting.
    Counting(u32),
    Compiling,
    Compiled,
    /// Interpreted forever.
    DontCompile,
}

impl fmt::Display for JitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JitState::Counting(n) => write!(f, "counting({n})"),
            JitState::Compiling => write!(f, "compiling"),
            JitState::Compiled => write!(f, "compiled"),
            JitState::DontCompile => write!(f, "dont-compile"),
        }
    }
}

enum FunctionState {
    Counting(u32),
    Compiling,
    Compiled(Arc<GeneratedCode>),
    DontCompile,
}

/// What a call to a function should do.
pub(crate) enum Tick {
    /// Run in the interpreter.
    Interpret,
    /// This caller has moved the function to `Compiling`: it must compile it and then call
    /// [JitFunction::compiled] or [JitFunction::failed].
    Compile,
    Enter(Arc<GeneratedCode>),
}

/// The JIT state of one function. A function is a state machine:
///
/// ```text
///           ┌───────────────┐  call below threshold
///   ───────▶│   Counting    │◀────────┐
///           └───────────────┘─────────┘
///             │           ▲
///             │ hot       │ invalidated, may recompile
///             ▼           │
///           ┌───────────────┐        ┌───────────────┐
///           │   Compiling   │───────▶│   Compiled    │
///           └───────────────┘        └───────────────┘
///             │                        │
///             │ failed                 │ invalidated, no recompiles left
///             ▼                        │ or circuit breaker
///           ┌───────────────┐          │
///           │  DontCompile  │◀─────────┘
///           └───────────────┘
/// ```
///
/// `DontCompile` is terminal. Only the caller that moved the function to `Compiling` moves it
/// out again, so a function is never compiled by two threads at once: other callers keep
/// interpreting it meanwhile. A function can also be given up on while it is compiling (an
/// older activation of its code bailing out once too often): the compilation's result is then
/// discarded.
pub(crate) struct JitFunction {
    state: Mutex<FunctionState>,
    /// How many times the function has been compiled successfully.
    compiles: Mutex<u32>,
}

impl JitFunction {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(FunctionState::Counting(0)),
            compiles: Mutex::new(0),
        }
    }

    pub(crate) fn state(&self) -> JitState {
        match &*self.state.lock() {
            FunctionState::Counting(n) => JitState::Counting(*n),
            FunctionState::Compiling => JitState::Compiling,
            FunctionState::Compiled(_) => JitState::Compiled,
            FunctionState::DontCompile => JitState::DontCompile,
        }
    }

    pub(crate) fn code(&self) -> Option<Arc<GeneratedCode>> {
        match &*self.state.lock() {
            FunctionState::Compiled(c) => Some(Arc::clone(c)),
            _ => None,
        }
    }

    pub(crate) fn compiles(&self) -> u32 {
        *self.compiles.lock()
    }

    /// Count a call, deciding what it should do.
    pub(crate) fn tick(&self, hot_threshold: u32) -> Tick {
        let mut st = self.state.lock();
        match &*st {
            FunctionState::Counting(n) => {
                let n = n.saturating_add(1);
                if n >= hot_threshold {
                    *st = FunctionState::Compiling;
                    Tick::Compile
                } else {
                    *st = FunctionState::Counting(n);
                    Tick::Interpret
                }
            }
            FunctionState::Compiled(c) => Tick::Enter(Arc::clone(c)),
            FunctionState::Compiling | FunctionState::DontCompile => Tick::Interpret,
        }
    }

    /// Move to `Compiling` regardless of the count. Returns `false` if the function is
    /// already compiling, compiled, or never to be compiled.
    pub(crate) fn start_compile(&self) -> bool {
        let mut st = self.state.lock();
        match &*st {
            FunctionState::Counting(_) => {
                *st = FunctionState::Compiling;
                true
            }
            _ => false,
        }
    }

    /// Install `code`, unless the function was given up on while it was compiling. Returns
    /// `code` back in that case: nothing will ever enter it, so the caller must invalidate it.
    pub(crate) fn compiled(&self, code: Arc<GeneratedCode>) -> Option<Arc<GeneratedCode>> {
        let mut st = self.state.lock();
        *self.compiles.lock() += 1;
        match &*st {
            FunctionState::DontCompile => Some(code),
            _ => {
                debug_assert!(matches!(*st, FunctionState::Compiling));
                *st = FunctionState::Compiled(code);
                None
            }
        }
    }

    pub(crate) fn failed(&self) {
        let mut st = self.state.lock();
        debug_assert!(matches!(
            *st,
            FunctionState::Compiling | FunctionState::DontCompile
        ));
        *st = FunctionState::DontCompile;
    }

    /// `code` has been invalidated: stop entering it. Returns the new state, or `None` if the
    /// function had already moved on from `code`.
    pub(crate) fn invalidated(
        &self,
        code: &Arc<GeneratedCode>,
        max_recompiles: u32,
    ) -> Option<JitState> {
        let mut st = self.state.lock();
        match &*st {
            FunctionState::Compiled(c) if Arc::ptr_eq(c, code) => {
                if *self.compiles.lock() > max_recompiles {
                    *st = FunctionState::DontCompile;
                    Some(JitState::DontCompile)
                } else {
                    *st = FunctionState::Counting(0);
                    Some(JitState::Counting(0))
                }
            }
            _ => None,
        }
    }

    /// Never compile, nor enter, the function again. Returns the code it was entering, if any.
    pub(crate) fn dont_compile(&self) -> Option<Arc<GeneratedCode>> {
        match std::mem::replace(&mut *self.state.lock(), FunctionState::DontCompile) {
            FunctionState::Compiled(c) => Some(c),
            _ => None,
        }
    }
}
