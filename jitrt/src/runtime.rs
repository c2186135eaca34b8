//! The runtime: counts calls, compiles hot functions, enters generated code, and services
//! what generated code asks of it (VM calls, interrupts, and bailouts).

use crate::{
    bailout::{self, BailoutError, BailoutReport, BailoutResult, MachineState, SiteState},
    bytecode::{FuncId, Program},
    code::{CodeSpace, EntryView, GeneratedCode},
    codegen::sim::{
        machine::{Machine, MachineError, MachineExit, ObjectMemory},
        ENTRY_RETURN, OBJECT_BASE,
    },
    compile::{compile, CompilationError, CompileContext},
    frame::{FrameDescriptor, FrameError, FrameKind, StackMemory, StackWalker},
    function::{JitFunction, JitState, Tick},
    interp::{self, InterpFrame},
    log::{
        stats::{Stats, StatsCounts, TimingState},
        Log, Verbosity,
    },
    mir::VmFunction,
    ops,
    options::JitOptions,
    oracle::{ProfileOracle, ShapeCache, TypeOracle},
    value::{Heap, ObjId, StrId, TypeSet, Value, OBJECT_SIZE},
};
use index_vec::IndexVec;
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::{
    error::Error,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum RuntimeError {
    #[error("stack overflow")]
    StackOverflow,
    #[error("out of memory")]
    OutOfMemory,
    #[error("f{func} called with {argc} arguments, more than a call can pass")]
    ArityMismatch { func: u32, argc: usize },
    #[error("no function f{0}")]
    UnknownFunction(u32),
    #[error("machine fault: {0}")]
    Machine(MachineError),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<MachineError> for RuntimeError {
    fn from(e: MachineError) -> Self {
        match e {
            MachineError::StackOverflow => RuntimeError::StackOverflow,
            e => RuntimeError::Machine(e),
        }
    }
}

impl From<FrameError> for RuntimeError {
    fn from(e: FrameError) -> Self {
        RuntimeError::Internal(e.to_string())
    }
}

impl From<BailoutError> for RuntimeError {
    fn from(e: BailoutError) -> Self {
        RuntimeError::Internal(e.to_string())
    }
}

/// The most arguments a call can pass.
const MAX_ARGS: usize = u8::MAX as usize;

/// The collector-visible values found by the last interrupt's stack walk.
#[derive(Clone, Debug, PartialEq)]
pub struct RootScan {
    /// How many frames the walk visited.
    pub frames: usize,
    /// Every String and Object held by a generated frame.
    pub roots: Vec<Value>,
}

/// The state of one top-level call. Generated code entered during the call, however deeply
/// nested, runs on the same machine.
pub(crate) struct Exec {
    pub(crate) machine: Machine,
    /// How many frames (interpreted, or generated) are active.
    pub(crate) depth: usize,
    /// The stack pointers of the exit frames of the VM calls in progress, oldest first.
    pub(crate) exits: Vec<u64>,
}

impl Exec {
    fn new(interrupt: Arc<AtomicBool>, objects: Arc<dyn ObjectMemory>) -> Self {
        Self {
            machine: Machine::new(interrupt).with_objects(objects),
            depth: 0,
            exits: Vec::new(),
        }
    }

    /// Account for `n` more frames.
    pub(crate) fn enter(&mut self, n: usize, max_frames: u32) -> Result<(), RuntimeError> {
        let depth = self.depth + n;
        if depth > max_frames as usize {
            return Err(RuntimeError::StackOverflow);
        }
        self.depth = depth;
        Ok(())
    }
}

/// Generated code addresses object `i` at `OBJECT_BASE + i * OBJECT_SIZE`, laid out as
/// [Heap::object_word] describes.
impl ObjectMemory for Mutex<Heap> {
    fn load(&self, addr: u64) -> Option<u64> {
        let (obj, word) = object_word(addr)?;
        self.lock().object_word(obj, word)
    }

    fn store(&self, addr: u64, val: u64) -> Option<()> {
        let (obj, word) = object_word(addr)?;
        self.lock().set_object_word(obj, word, val)
    }
}

fn object_word(addr: u64) -> Option<(ObjId, u32)> {
    let off = addr.checked_sub(OBJECT_BASE)?;
    if off % 8 != 0 {
        return None;
    }
    let obj = u32::try_from(off / OBJECT_SIZE).ok()?;
    Some((ObjId::from_raw(obj), ((off % OBJECT_SIZE) / 8) as u32))
}

/// A view of the machine that only exposes the stack. At a safepoint below the innermost one
/// the registers belong to someone else.
struct StackOnly<'a>(&'a Machine);

impl StackMemory for StackOnly<'_> {
    fn read_word(&self, addr: u64) -> Option<u64> {
        self.0.read_word(addr)
    }
}

impl MachineState for StackOnly<'_> {
    fn gpr(&self, _: u8) -> Option<u64> {
        None
    }

    fn fpr(&self, _: u8) -> Option<f64> {
        None
    }
}

pub struct Runtime {
    program: Arc<Program>,
    options: JitOptions,
    log: Log,
    stats: Stats,
    heap: Arc<Mutex<Heap>>,
    oracle: RwLock<ProfileOracle>,
    functions: IndexVec<FuncId, JitFunction>,
    code: CodeSpace,
    interrupt: Arc<AtomicBool>,
    last_bailout: Mutex<Option<BailoutReport>>,
    last_roots: Mutex<Option<RootScan>>,
    /// How many top-level calls are in progress, on any thread.
    active_calls: AtomicUsize,
}

impl Runtime {
    pub fn new(program: Program, options: JitOptions) -> Result<Self, Box<dyn Error>> {
        let mut heap = Heap::new();
        // Interned in order, so that the program's string ids are heap ids.
        for s in program.strings() {
            heap.intern(s);
        }
        let oracle = ProfileOracle::new(&program);
        let functions = program.funcs().map(|_| JitFunction::new()).collect();
        Ok(Self {
            program: Arc::new(program),
            options,
            log: Log::new()?,
            stats: Stats::new(),
            heap: Arc::new(Mutex::new(heap)),
            oracle: RwLock::new(oracle),
            functions,
            code: CodeSpace::new()?,
            interrupt: Arc::new(AtomicBool::new(false)),
            last_bailout: Mutex::new(None),
            last_roots: Mutex::new(None),
            active_calls: AtomicUsize::new(0),
        })
    }

    /// A runtime configured by the `JITRT_*` environment variables.
    pub fn from_env(program: Program) -> Result<Self, Box<dyn Error>> {
        Self::new(program, JitOptions::from_env()?)
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn options(&self) -> &JitOptions {
        &self.options
    }

    /// Call `func` with `args`, returning its result.
    pub fn call(&self, func: FuncId, args: &[Value]) -> Result<Value, RuntimeError> {
        self.active_calls.fetch_add(1, Ordering::SeqCst);
        let prev = self.stats.timing_state(TimingState::Interpreting);
        let mut exec = self.exec();
        let r = self.call_with(&mut exec, func, args.to_vec());
        self.stats.timing_state(prev);
        // With no call left in progress, no stack can hold invalidated code.
        if self.active_calls.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.release_code(&[]);
        }
        r
    }

    /// Compile `func` now, whatever its call count. Compiling a function that already has
    /// code does nothing.
    pub fn compile(&self, func: FuncId) -> Result<(), CompilationError> {
        let jf = self
            .functions
            .get(func)
            .ok_or_else(|| CompilationError::General(format!("no function f{}", func.raw())))?;
        if !jf.start_compile() {
            return match jf.state() {
                JitState::Compiled => Ok(()),
                st => Err(CompilationError::General(format!(
                    "{} is {st}",
                    self.program.script(func).name()
                ))),
            };
        }
        self.compile_function(func).map(|_| ())
    }

    pub fn function_state(&self, func: FuncId) -> Option<JitState> {
        self.functions.get(func).map(|f| f.state())
    }

    /// How many times `func` has been compiled.
    pub fn compile_count(&self, func: FuncId) -> u32 {
        self.functions.get(func).map_or(0, |f| f.compiles())
    }

    /// The code calls to `func` currently enter.
    pub fn code_for(&self, func: FuncId) -> Option<Arc<GeneratedCode>> {
        self.functions.get(func).and_then(|f| f.code())
    }

    /// The types observed for the value produced at `pc`.
    pub fn observed(&self, func: FuncId, pc: u32) -> TypeSet {
        self.oracle.read().observed(func, pc)
    }

    /// The receiver shapes seen by the property access at `pc`.
    pub fn property_cache(&self, func: FuncId, pc: u32) -> ShapeCache {
        self.oracle.read().property(func, pc)
    }

    pub fn observed_argument(&self, func: FuncId, idx: u16) -> TypeSet {
        self.oracle.read().argument(func, idx)
    }

    /// Setting this flag makes generated code and the interpreter service an interrupt at the
    /// next loop head.
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    pub fn last_bailout(&self) -> Option<BailoutReport> {
        self.last_bailout.lock().clone()
    }

    pub fn last_root_scan(&self) -> Option<RootScan> {
        self.last_roots.lock().clone()
    }

    pub fn stats(&self) -> Option<StatsCounts> {
        self.stats.counts()
    }

    /// How many invalidated code objects are waiting for their last frame to go.
    pub fn pending_code(&self) -> usize {
        self.code.pending()
    }

    pub fn string(&self, s: &str) -> Value {
        Value::String(self.heap.lock().intern(s))
    }

    pub fn object(&self, class: &str) -> Value {
        Value::Object(self.heap.lock().new_object(class))
    }

    pub fn display(&self, v: Value) -> String {
        self.heap.lock().display(v)
    }

    /// The state for a new top-level call.
    fn exec(&self) -> Exec {
        Exec::new(
            Arc::clone(&self.interrupt),
            Arc::clone(&self.heap) as Arc<dyn ObjectMemory>,
        )
    }

    pub(crate) fn heap(&self) -> MutexGuard<'_, Heap> {
        self.heap.lock()
    }

    pub(crate) fn observe(&self, func: FuncId, pc: u32, v: Value) {
        self.oracle.write().observe(func, pc, v.ty());
    }

    /// Record the shape of `obj` at the property access at `pc`, if it is an object.
    pub(crate) fn observe_property(&self, func: FuncId, pc: u32, obj: Value, name: StrId) {
        let Value::Object(o) = obj else {
            return;
        };
        let (shape, slot) = {
            let heap = self.heap.lock();
            let shape = heap.object(o).shape;
            (shape, heap.slot(shape, name))
        };
        self.oracle.write().observe_shape(func, pc, shape, slot);
    }

    pub(crate) fn interrupt_pending(&self) -> bool {
        self.interrupt.load(Ordering::Relaxed)
    }

    /// Call `func` from within `exec`: in the interpreter, or in generated code if it has any.
    pub(crate) fn call_with(
        &self,
        exec: &mut Exec,
        func: FuncId,
        args: Vec<Value>,
    ) -> Result<Value, RuntimeError> {
        let Some(jf) = self.functions.get(func) else {
            return Err(RuntimeError::UnknownFunction(func.raw()));
        };
        if args.len() > MAX_ARGS {
            return Err(RuntimeError::ArityMismatch {
                func: func.raw(),
                argc: args.len(),
            });
        }
        match jf.tick(self.options.hot_threshold) {
            Tick::Enter(code) => self.enter(exec, &code, &args),
            Tick::Compile => match self.compile_function(func) {
                Ok(code) => self.enter(exec, &code, &args),
                Err(_) => self.interpret(exec, func, args),
            },
            Tick::Interpret => self.interpret(exec, func, args),
        }
    }

    fn interpret(
        &self,
        exec: &mut Exec,
        func: FuncId,
        args: Vec<Value>,
    ) -> Result<Value, RuntimeError> {
        let script = self.program.script(func);
        {
            let mut oracle = self.oracle.write();
            for (i, a) in args.iter().take(usize::from(script.nargs())).enumerate() {
                oracle.observe_arg(func, i as u16, a.ty());
            }
        }
        let frame = InterpFrame::new(func, script, &args);
        interp::run(self, exec, vec![frame])
    }

    /// Compile `func`, which the caller has moved to `Compiling`.
    fn compile_function(&self, func: FuncId) -> Result<Arc<GeneratedCode>, CompilationError> {
        let name = self.program.script(func).name();
        self.transition(func, "counting", "compiling");
        let prev = self.stats.timing_state(TimingState::Compiling);
        // Compile against a copy so that interpreters can keep recording meanwhile.
        let oracle = self.oracle.read().clone();
        let ctx = CompileContext {
            program: &self.program,
            oracle: &oracle,
            options: &self.options,
        };
        let r = compile(&ctx, func);
        self.stats.timing_state(prev);
        let jf = &self.functions[func];
        match r {
            Ok(cf) => {
                let code = self.code.install(cf);
                self.stats.function_compiled_ok();
                self.log.log(
                    Verbosity::JitEvent,
                    &format!(
                        "compiled {name} at {:#x}: {} bytes, {} guards",
                        code.entry(),
                        code.code_size(),
                        code.num_guards()
                    ),
                );
                if let Some(c) = jf.compiled(Arc::clone(&code)) {
                    self.invalidate(&c);
                    return Err(CompilationError::General(format!(
                        "{name} was given up on while compiling"
                    )));
                }
                self.transition(func, "compiling", "compiled");
                Ok(code)
            }
            Err(e) => {
                self.stats.function_compiled_err();
                self.log
                    .log(Verbosity::Warning, &format!("compiling {name} aborted: {e}"));
                jf.failed();
                self.transition(func, "compiling", "dont-compile");
                Err(e)
            }
        }
    }

    fn transition(&self, func: FuncId, from: &str, to: &str) {
        self.log.log(
            Verbosity::FunctionTransition,
            &format!("{}: {from} -> {to}", self.program.script(func).name()),
        );
    }

    /// Run `code` with `args`. The generated frame counts as one frame until it returns or
    /// bails out.
    fn enter(
        &self,
        exec: &mut Exec,
        code: &Arc<GeneratedCode>,
        args: &[Value],
    ) -> Result<Value, RuntimeError> {
        let base = exec.depth;
        exec.enter(1, self.options.max_frames)?;
        self.stats.jit_entry();
        let prev = self.stats.timing_state(TimingState::JitExecuting);
        let saved_sp = exec.machine.sp();
        let r = self
            .push_entry_frame(&mut exec.machine, code, args)
            .and_then(|_| self.execute(exec, code));
        exec.machine.set_sp(saved_sp);
        self.stats.timing_state(prev);
        exec.depth = base;
        r
    }

    fn push_entry_frame(
        &self,
        m: &mut Machine,
        code: &GeneratedCode,
        args: &[Value],
    ) -> Result<(), RuntimeError> {
        for a in args.iter().rev() {
            let (tag, payload) = a.to_bits();
            m.push(payload)?;
            m.push(tag)?;
        }
        m.push(args.len() as u64)?;
        m.push(FrameDescriptor::new(FrameKind::Entry, 0).encode())?;
        m.push(ENTRY_RETURN)?;
        if args.len() < usize::from(code.nargs()) {
            m.gprs[2] = code.entry();
            m.gprs[3] = u64::from(code.nargs());
            m.set_pc(self.code.rectifier());
        } else {
            m.set_pc(code.entry());
        }
        Ok(())
    }

    fn execute(&self, exec: &mut Exec, code: &Arc<GeneratedCode>) -> Result<Value, RuntimeError> {
        let view = EntryView {
            space: &self.code,
            code,
        };
        loop {
            match exec.machine.run(&view)? {
                MachineExit::EntryReturn => {
                    let (tag, payload) = (exec.machine.gprs[0], exec.machine.gprs[1]);
                    return Value::from_bits(tag, payload).ok_or_else(|| {
                        RuntimeError::Internal(format!("generated code returned tag {tag}"))
                    });
                }
                MachineExit::VmCall(id) => self.vm_call(exec, id)?,
                MachineExit::Bailout => return self.bail_out(exec, code),
            }
        }
    }

    /// Perform the VM call `id` made by generated code, and return to it.
    fn vm_call(&self, exec: &mut Exec, id: u64) -> Result<(), RuntimeError> {
        let f = VmFunction::from_id(id)
            .ok_or_else(|| RuntimeError::Internal(format!("unknown VM function {id:#x}")))?;
        let exit_sp = exec.machine.sp();
        let args = {
            let m = &exec.machine;
            let frame = StackWalker::from_exit(m, &self.code, exit_sp, 1)
                .next()
                .ok_or(FrameError::Unterminated)??;
            let argc = frame.argc(m)?;
            if argc != f.arity() as u64 {
                return Err(RuntimeError::Internal(format!(
                    "{f} called with {argc} arguments"
                )));
            }
            (0..argc)
                .map(|i| {
                    let (tag, payload) = frame.arg(m, i)?;
                    Value::from_bits(tag, payload).ok_or_else(|| {
                        RuntimeError::Internal(format!("argument {i} of {f} has tag {tag}"))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?
        };
        exec.exits.push(exit_sp);
        let r = match (f, &args[..]) {
            (VmFunction::Binary(op), [a, b]) => {
                Ok(Some(ops::binary(&mut self.heap(), op, *a, *b)))
            }
            (VmFunction::Compare(op), [a, b]) => Ok(Some(Value::Boolean(ops::compare(
                &self.heap(),
                op,
                *a,
                *b,
            )))),
            (VmFunction::ToBoolean, [a]) => {
                Ok(Some(Value::Boolean(ops::to_boolean(&self.heap(), *a))))
            }
            (VmFunction::Call { func, .. }, _) => {
                let prev = self.stats.timing_state(TimingState::Interpreting);
                let r = self.call_with(exec, func, args.clone());
                self.stats.timing_state(prev);
                r.map(Some)
            }
            (VmFunction::Interrupt, _) => self.service_interrupt(exec).map(|_| None),
            (VmFunction::NewObject { class }, []) => {
                Ok(Some(Value::Object(self.heap().new_object_of(class))))
            }
            (VmFunction::GetProp { name }, [obj]) => {
                Ok(Some(self.heap().get_property(*obj, name)))
            }
            (VmFunction::SetProp { name }, [obj, v]) => {
                self.heap().set_property(*obj, name, *v);
                Ok(Some(Value::Undefined))
            }
            _ => Err(RuntimeError::Internal(format!("bad arguments to {f}"))),
        };
        exec.exits.pop();
        exec.machine.return_from_vm_call(r?.map(|v| v.to_bits()))?;
        Ok(())
    }

    /// Clear the interrupt flag and walk every generated frame of `exec`, recording the values
    /// the collector would have to trace. Invalidated code no frame executes is released.
    pub(crate) fn service_interrupt(&self, exec: &Exec) -> Result<(), RuntimeError> {
        self.interrupt.store(false, Ordering::SeqCst);
        let limit = self.options.max_frames as usize * 4 + 4;
        let mut scan = RootScan {
            frames: 0,
            roots: Vec::new(),
        };
        let mut pcs = Vec::new();
        for exit_sp in &exec.exits {
            for fr in StackWalker::from_exit(&exec.machine, &self.code, *exit_sp, limit) {
                let fr = fr?;
                scan.frames += 1;
                let (FrameKind::Normal, Some(code), Some(pc)) = (fr.kind, &fr.code, fr.pc) else {
                    continue;
                };
                pcs.push(pc);
                let Some(sp) = code.safepoint(pc) else {
                    return Err(RuntimeError::Internal(format!(
                        "no safepoint at {pc:#x} in {code:?}"
                    )));
                };
                let (_, frames) = bailout::decode(
                    code.safepoint_snapshots(),
                    sp.snapshot,
                    &StackOnly(&exec.machine),
                    fr.body,
                    code.constants(),
                )?;
                scan.roots.extend(
                    frames
                        .iter()
                        .flat_map(|f| f.slots.iter())
                        .filter(|v| matches!(v, Value::String(_) | Value::Object(_))),
                );
            }
        }
        self.log.log(
            Verbosity::JitEvent,
            &format!(
                "interrupt: {} frames, {} roots",
                scan.frames,
                scan.roots.len()
            ),
        );
        *self.last_roots.lock() = Some(scan);
        if self.active_calls.load(Ordering::SeqCst) == 1 {
            self.release_code(&pcs);
        }
        Ok(())
    }

    fn release_code(&self, live_pcs: &[u64]) {
        let n = self.code.release_unreferenced(live_pcs);
        if n > 0 {
            self.log.log(
                Verbosity::JitEvent,
                &format!("released {n} invalidated code objects"),
            );
        }
    }

    fn invalidate(&self, code: &Arc<GeneratedCode>) -> bool {
        if !self.code.invalidate(code) {
            return false;
        }
        self.stats.invalidation();
        self.log.log(
            Verbosity::JitEvent,
            &format!(
                "invalidated {} at {:#x}",
                self.program.script(code.func()).name(),
                code.entry()
            ),
        );
        true
    }

    /// A guard of `code` failed: rebuild the interpreter frames its snapshot describes, learn
    /// from the failure, and finish the activation in the interpreter.
    fn bail_out(&self, exec: &mut Exec, code: &Arc<GeneratedCode>) -> Result<Value, RuntimeError> {
        let prev = self.stats.timing_state(TimingState::BailingOut);
        self.stats.bailout();
        let r = self.resolve(exec, code);
        self.stats.timing_state(prev);
        let frames = r?;
        // The generated frame is replaced by the reconstructed ones.
        exec.depth -= 1;
        interp::run(self, exec, frames)
    }

    fn resolve(
        &self,
        exec: &mut Exec,
        code: &Arc<GeneratedCode>,
    ) -> Result<Vec<InterpFrame>, RuntimeError> {
        let sp = exec.machine.sp();
        let ret = exec.machine.read(sp)?;
        let site = code
            .bailout_site(ret)
            .ok_or(BailoutError::NoGuard(ret))?;
        let func = code.func();
        let name = self.program.script(func).name();

        let mut state = site.state.lock();
        if *state == SiteState::Fatal {
            return Err(RuntimeError::OutOfMemory);
        }
        state.advance(SiteState::Triggered);
        let count = site.count.fetch_add(1, Ordering::Relaxed) + 1;
        state.advance(SiteState::Resolving);
        let frames = StackWalker::from_bailout(&exec.machine, &self.code, sp, code.frame_size(), 1)
            .map_err(BailoutError::from)
            .and_then(|mut w| {
                let fr = w.next().ok_or(FrameError::Unterminated)??;
                bailout::decode(
                    code.snapshot_table(),
                    site.snapshot,
                    &exec.machine,
                    fr.body,
                    code.constants(),
                )
            })
            .and_then(|(_, decoded)| bailout::reconstruct(&self.program, decoded));
        let base = exec.depth.saturating_sub(1);
        let frames = match frames {
            Ok(frames) if base + frames.len() <= self.options.max_frames as usize => frames,
            r => {
                state.advance(SiteState::Fatal);
                drop(state);
                let err = match r {
                    Err(e) => {
                        self.log
                            .log(Verbosity::Error, &format!("bailout in {name} failed: {e}"));
                        RuntimeError::from(e)
                    }
                    Ok(_) => RuntimeError::OutOfMemory,
                };
                if let Some(c) = self.functions[func].dont_compile() {
                    self.invalidate(&c);
                }
                self.invalidate(code);
                self.transition(func, "compiled", "dont-compile");
                *self.last_bailout.lock() = Some(BailoutReport {
                    func,
                    kind: site.kind,
                    result: BailoutResult::Fatal,
                    frames: Vec::new(),
                    widened: false,
                    invalidated: true,
                });
                return Err(err);
            }
        };
        state.advance(SiteState::Reconstructed);

        let (result, widened) =
            bailout::apply_policy(site.kind, &frames, &self.program, &mut self.oracle.write());
        let jf = &self.functions[func];
        let tripped = count >= self.options.bailout_threshold;
        if tripped {
            if let Some(c) = jf.dont_compile() {
                self.invalidate(&c);
            }
            self.log.log(
                Verbosity::Warning,
                &format!("{name}: guard failed {count} times, giving up on compiling it"),
            );
            self.transition(func, "compiled", "dont-compile");
        } else if widened {
            if let Some(st) = jf.invalidated(code, self.options.max_recompiles) {
                self.transition(func, "compiled", &st.to_string());
            }
        }
        let invalidated = (tripped || widened) && self.invalidate(code);
        self.log.log(
            Verbosity::JitEvent,
            &format!(
                "bailout in {name}: {} guard, {} frames, {result}",
                site.kind,
                frames.len()
            ),
        );
        *self.last_bailout.lock() = Some(BailoutReport {
            func,
            kind: site.kind,
            result,
            frames: frames.clone(),
            widened,
            invalidated,
        });
        // The interpreter may reach this guard again, so it must be armed before resuming.
        state.advance(SiteState::Resumed);
        state.advance(SiteState::Armed);
        Ok(frames)
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.stats.output();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bytecode::{Op, ScriptBuilder};

    fn add_program() -> Program {
        let mut b = ScriptBuilder::new("add", 2, 0);
        b.ops(&[Op::GetArg(0), Op::GetArg(1), Op::Add, Op::Return]);
        Program::new(vec![b.build().unwrap()]).unwrap()
    }

    #[test]
    fn bad_calls() {
        let rt = Runtime::new(add_program(), JitOptions::default()).unwrap();
        assert_eq!(
            rt.call(FuncId::from_raw(1), &[]),
            Err(RuntimeError::UnknownFunction(1))
        );
        let args = vec![Value::Null; 256];
        assert_eq!(
            rt.call(FuncId::from_raw(0), &args),
            Err(RuntimeError::ArityMismatch { func: 0, argc: 256 })
        );
        assert!(rt.compile(FuncId::from_raw(1)).is_err());
    }

    #[test]
    fn object_memory_addresses() {
        let mut heap = Heap::new();
        let x = heap.intern("x");
        heap.new_object("A");
        let o = heap.new_object("A");
        heap.set_property(Value::Object(o), x, Value::Int32(7));
        let shape = heap.object(o).shape;
        let heap = Mutex::new(heap);
        let base = OBJECT_BASE + OBJECT_SIZE;
        assert_eq!(heap.load(base), Some(u64::from(shape.raw())));
        assert_eq!(heap.load(base + 16), Some(7));
        assert_eq!(heap.load(base + 4), None);
        // The first object has no slots; the second only one.
        assert_eq!(heap.load(OBJECT_BASE + 8), None);
        assert_eq!(heap.load(base + 24), None);
        assert_eq!(heap.store(base + 16, 9), Some(()));
        assert_eq!(heap.lock().get_property(Value::Object(o), x), Value::Int32(9));
        assert_eq!(heap.store(base, 0), None);
        assert_eq!(heap.load(OBJECT_BASE + 2 * OBJECT_SIZE), None);
    }

    #[test]
    fn hot_functions_are_compiled_and_entered() {
        let f = FuncId::from_raw(0);
        let rt = Runtime::new(add_program(), JitOptions::default().with_hot_threshold(3)).unwrap();
        for i in 0..2 {
            assert_eq!(rt.call(f, &[Value::Int32(i), Value::Int32(1)]), Ok(Value::Int32(i + 1)));
        }
        assert_eq!(rt.function_state(f), Some(JitState::Counting(2)));
        assert_eq!(rt.call(f, &[Value::Int32(2), Value::Int32(1)]), Ok(Value::Int32(3)));
        assert_eq!(rt.function_state(f), Some(JitState::Compiled));
        assert_eq!(rt.call(f, &[Value::Int32(3), Value::Int32(1)]), Ok(Value::Int32(4)));
        let counts = rt.stats().unwrap();
        assert_eq!(counts.functions_compiled_ok, 1);
        assert_eq!(counts.jit_entries, 2);
        assert_eq!(counts.bailouts, 0);
        // Already compiled: nothing to do.
        assert_eq!(rt.compile(f), Ok(()));
        assert_eq!(rt.compile_count(f), 1);
    }

    #[test]
    fn aborted_compilations_keep_interpreting() {
        let mut b = ScriptBuilder::new("f", 0, 0);
        b.ops(&[Op::Debugger, Op::Int(1), Op::Return]);
        let program = Program::new(vec![b.build().unwrap()]).unwrap();
        let f = FuncId::from_raw(0);
        let rt = Runtime::new(program, JitOptions::default().with_hot_threshold(1)).unwrap();
        for _ in 0..3 {
            assert_eq!(rt.call(f, &[]), Ok(Value::Int32(1)));
        }
        assert_eq!(rt.function_state(f), Some(JitState::DontCompile));
        assert_eq!(rt.stats().unwrap().functions_compiled_err, 1);
        assert!(matches!(rt.compile(f), Err(CompilationError::General(_))));
    }

    #[test]
    fn argument_guards_invalidate() {
        // Arguments predicted Int32, then called with a double.
        let f = FuncId::from_raw(0);
        let rt = Runtime::new(add_program(), JitOptions::default().with_hot_threshold(2)).unwrap();
        for _ in 0..2 {
            rt.call(f, &[Value::Int32(1), Value::Int32(2)]).unwrap();
        }
        assert_eq!(rt.function_state(f), Some(JitState::Compiled));
        let code = rt.code_for(f).unwrap();
        let r = rt.call(f, &[Value::Double(0.5), Value::Int32(2)]);
        assert_eq!(r, Ok(Value::Double(2.5)));
        let report = rt.last_bailout().unwrap();
        assert_eq!(report.kind, jitsnap::BailoutKind::ArgumentCheck);
        assert_eq!(report.result, BailoutResult::ResumeAfterArgumentRecheck);
        assert!(report.widened && report.invalidated);
        assert!(rt.observed_argument(f, 0).contains(crate::value::ValueType::Double));
        assert!(code.is_invalidated());
        assert_eq!(rt.function_state(f), Some(JitState::Counting(0)));
        // Nothing references the invalidated code any more.
        assert_eq!(rt.pending_code(), 0);
    }

    #[test]
    fn fatal_guards_stay_fatal() {
        // f0(a, b) = f1(a, b); f1(a, b) = f2(a, b); f2(a, b) = a + b
        let forward = |name, callee| {
            let mut b = ScriptBuilder::new(name, 2, 0);
            b.ops(&[Op::GetArg(0), Op::GetArg(1)]);
            b.call(FuncId::from_raw(callee), 2);
            b.op(Op::Return);
            b.build().unwrap()
        };
        let mut b = ScriptBuilder::new("f2", 2, 0);
        b.ops(&[Op::GetArg(0), Op::GetArg(1), Op::Add, Op::Return]);
        let program = Program::new(vec![forward("f0", 1), forward("f1", 2), b.build().unwrap()])
            .unwrap();
        let opts = JitOptions::default()
            .with_hot_threshold(u32::MAX)
            .with_max_frames(2);
        let rt = Runtime::new(program, opts).unwrap();
        let (f0, f1, f2) = (FuncId::from_raw(0), FuncId::from_raw(1), FuncId::from_raw(2));
        for f in [f2, f1] {
            rt.call(f, &[Value::Int32(1), Value::Int32(2)]).unwrap();
        }
        rt.compile(f0).unwrap();
        let code = rt.code_for(f0).unwrap();
        let args = [Value::Int32(i32::MAX), Value::Int32(1)];
        assert_eq!(rt.call(f0, &args), Err(RuntimeError::OutOfMemory));
        assert_eq!(rt.function_state(f0), Some(JitState::DontCompile));
        let report = rt.last_bailout().unwrap();
        assert_eq!(report.result, BailoutResult::Fatal);
        assert!(report.invalidated);
        let bailouts = rt.stats().unwrap().bailouts;

        // An activation that was already running the code reaches the same guard.
        let mut exec = rt.exec();
        assert_eq!(rt.enter(&mut exec, &code, &args), Err(RuntimeError::OutOfMemory));
        assert_eq!(exec.depth, 0);
        assert_eq!(rt.stats().unwrap().bailouts, bailouts + 1);
        // Nothing was decoded, so nothing new was reported or learnt.
        assert_eq!(rt.last_bailout(), Some(report));
        assert_eq!(rt.function_state(f0), Some(JitState::DontCompile));
    }

    #[test]
    fn compiles_given_up_on_midway_are_discarded() {
        let f = FuncId::from_raw(0);
        let rt = Runtime::new(add_program(), JitOptions::default()).unwrap();
        assert!(rt.functions[f].start_compile());
        assert!(rt.functions[f].dont_compile().is_none());
        assert!(matches!(
            rt.compile_function(f),
            Err(CompilationError::General(_))
        ));
        assert_eq!(rt.function_state(f), Some(JitState::DontCompile));
        assert!(rt.code_for(f).is_none());
        // The discarded code waits to be released like any other invalidated code.
        assert_eq!(rt.pending_code(), 1);
        assert_eq!(rt.call(f, &[Value::Int32(1), Value::Int32(2)]), Ok(Value::Int32(3)));
        assert_eq!(rt.pending_code(), 0);
    }

    #[test]
    fn circuit_breaker() {
        let f = FuncId::from_raw(0);
        let opts = JitOptions::default()
            .with_hot_threshold(2)
            .with_bailout_threshold(1);
        let rt = Runtime::new(add_program(), opts).unwrap();
        for _ in 0..2 {
            rt.call(f, &[Value::Int32(1), Value::Int32(2)]).unwrap();
        }
        let code = rt.code_for(f).unwrap();
        let s = rt.string("a");
        let r = rt.call(f, &[s, Value::Int32(2)]).unwrap();
        assert_eq!(rt.display(r), "a2");
        assert_eq!(code.max_guard_failures(), 1);
        assert!(code.is_invalidated());
        assert_eq!(rt.function_state(f), Some(JitState::DontCompile));
        // Interpreted from now on.
        for _ in 0..3 {
            rt.call(f, &[Value::Int32(1), Value::Int32(2)]).unwrap();
        }
        assert_eq!(rt.stats().unwrap().jit_entries, 2);
        assert_eq!(rt.compile_count(f), 1);
    }
}
