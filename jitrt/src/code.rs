//! Installed generated code.
//!
//! A [CompiledFunction] becomes a [GeneratedCode] once the [CodeSpace] has given it an address
//! range. Generated code is shared (`Arc`) between every caller executing it and is never
//! changed after installation, with one exception: invalidation, which marks it as no longer to
//! be entered. An invalidated code object keeps its address range until no stack holds a frame
//! executing it.

use crate::{
    bailout::SiteState,
    bytecode::FuncId,
    codegen::{
        self,
        sim::{machine::CodeSource, CODE_BASE},
        CompiledFunction, SafepointEntry,
    },
    compile::CompilationError,
    value::Value,
};
use jitsnap::{BailoutKind, SnapshotOffset};
use parking_lot::{Mutex, RwLock};
use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
};

/// Code objects are placed at addresses aligned to this.
const CODE_ALIGN: u64 = 16;

/// One guard of an installed code object.
pub(crate) struct BailoutSite {
    pub(crate) ret_offset: u32,
    pub(crate) snapshot: SnapshotOffset,
    pub(crate) kind: BailoutKind,
    pub(crate) state: Mutex<SiteState>,
    /// How many times this guard has failed.
    pub(crate) count: AtomicU32,
}

pub struct GeneratedCode {
    func: FuncId,
    nargs: u16,
    base: u64,
    code: Vec<u8>,
    frame_size: u32,
    snapshots: Vec<u8>,
    safepoint_snapshots: Vec<u8>,
    constants: Vec<Value>,
    /// Sorted by `ret_offset`.
    bailouts: Vec<BailoutSite>,
    /// Sorted by `ret_offset`.
    safepoints: Vec<SafepointEntry>,
    invalidated: AtomicBool,
}

impl GeneratedCode {
    fn new(cf: CompiledFunction, base: u64) -> Self {
        let bailouts = cf
            .bailouts
            .iter()
            .map(|b| BailoutSite {
                ret_offset: b.ret_offset,
                snapshot: b.snapshot,
                kind: b.kind,
                state: Mutex::new(SiteState::Armed),
                count: AtomicU32::new(0),
            })
            .collect();
        Self {
            func: cf.func,
            nargs: cf.nargs,
            base,
            code: cf.code,
            frame_size: cf.frame_size,
            snapshots: cf.snapshots,
            safepoint_snapshots: cf.safepoint_snapshots,
            constants: cf.constants,
            bailouts,
            safepoints: cf.safepoints,
            invalidated: AtomicBool::new(false),
        }
    }

    pub fn func(&self) -> FuncId {
        self.func
    }

    pub fn nargs(&self) -> u16 {
        self.nargs
    }

    /// The address execution of this code starts at.
    pub fn entry(&self) -> u64 {
        self.base
    }

    pub fn code_size(&self) -> usize {
        self.code.len()
    }

    pub fn frame_size(&self) -> u32 {
        self.frame_size
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr - self.base < self.code.len() as u64
    }

    pub fn snapshot_table(&self) -> &[u8] {
        &self.snapshots
    }

    pub fn num_guards(&self) -> usize {
        self.bailouts.len()
    }

    /// The most times any one guard of this code has failed.
    pub fn max_guard_failures(&self) -> u32 {
        self.bailouts
            .iter()
            .map(|b| b.count.load(Ordering::Relaxed))
            .max()
            .unwrap_or(0)
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::Acquire)
    }

    pub fn disassemble(&self) -> String {
        codegen::sim::disassemble(&self.code)
    }

    pub(crate) fn constants(&self) -> &[Value] {
        &self.constants
    }

    pub(crate) fn safepoint_snapshots(&self) -> &[u8] {
        &self.safepoint_snapshots
    }

    fn offset_of(&self, addr: u64) -> Option<u32> {
        if addr < self.base {
            return None;
        }
        u32::try_from(addr - self.base).ok()
    }

    /// The guard whose call to the bailout trampoline returns to `ret_addr`.
    pub(crate) fn bailout_site(&self, ret_addr: u64) -> Option<&BailoutSite> {
        let off = self.offset_of(ret_addr)?;
        self.bailouts
            .binary_search_by_key(&off, |b| b.ret_offset)
            .ok()
            .map(|i| &self.bailouts[i])
    }

    /// The safepoint whose call returns to `ret_addr`.
    pub(crate) fn safepoint(&self, ret_addr: u64) -> Option<&SafepointEntry> {
        let off = self.offset_of(ret_addr)?;
        self.safepoints
            .binary_search_by_key(&off, |s| s.ret_offset)
            .ok()
            .map(|i| &self.safepoints[i])
    }
}

impl fmt::Debug for GeneratedCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeneratedCode")
            .field("func", &self.func)
            .field("base", &format_args!("{:#x}", self.base))
            .field("code_size", &self.code.len())
            .field("frame_size", &self.frame_size)
            .field("guards", &self.bailouts.len())
            .field("invalidated", &self.is_invalidated())
            .finish()
    }
}

/// Find the code object containing an address.
pub(crate) trait CodeLookup {
    fn lookup(&self, addr: u64) -> Option<Arc<GeneratedCode>>;
}

/// Where generated code is installed: a bump allocated address range starting at the argument
/// rectifier.
pub struct CodeSpace {
    rectifier: Vec<u8>,
    inner: RwLock<CodeSpaceInner>,
}

struct CodeSpaceInner {
    next: u64,
    /// Every code object with an address range, keyed by base address.
    codes: BTreeMap<u64, Arc<GeneratedCode>>,
    /// Invalidated code objects whose address range has not been released yet.
    pending: Vec<Arc<GeneratedCode>>,
}

impl CodeSpace {
    pub fn new() -> Result<Self, CompilationError> {
        let rectifier = codegen::rectifier()?;
        let next = (CODE_BASE + rectifier.len() as u64).next_multiple_of(CODE_ALIGN);
        Ok(Self {
            rectifier,
            inner: RwLock::new(CodeSpaceInner {
                next,
                codes: BTreeMap::new(),
                pending: Vec::new(),
            }),
        })
    }

    /// The address of the argument rectifier.
    pub(crate) fn rectifier(&self) -> u64 {
        CODE_BASE
    }

    pub fn install(&self, cf: CompiledFunction) -> Arc<GeneratedCode> {
        let mut inner = self.inner.write();
        let base = inner.next;
        inner.next = (base + cf.code.len() as u64).next_multiple_of(CODE_ALIGN) + CODE_ALIGN;
        let code = Arc::new(GeneratedCode::new(cf, base));
        inner.codes.insert(base, Arc::clone(&code));
        code
    }

    /// Mark `code` as never to be entered again. Returns `false` if it already was.
    pub fn invalidate(&self, code: &Arc<GeneratedCode>) -> bool {
        if code.invalidated.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.inner.write().pending.push(Arc::clone(code));
        true
    }

    /// Release the address range of every invalidated code object that contains none of
    /// `live_pcs`. Returns how many were released.
    pub fn release_unreferenced(&self, live_pcs: &[u64]) -> usize {
        let mut inner = self.inner.write();
        let (keep, release): (Vec<_>, Vec<_>) = inner
            .pending
            .drain(..)
            .partition(|c| live_pcs.iter().any(|pc| c.contains(*pc)));
        inner.pending = keep;
        for c in &release {
            inner.codes.remove(&c.base);
        }
        release.len()
    }

    /// How many invalidated code objects are still waiting to be released.
    pub fn pending(&self) -> usize {
        self.inner.read().pending.len()
    }
}

impl CodeLookup for CodeSpace {
    fn lookup(&self, addr: u64) -> Option<Arc<GeneratedCode>> {
        let inner = self.inner.read();
        let (_, code) = inner.codes.range(..=addr).next_back()?;
        code.contains(addr).then(|| Arc::clone(code))
    }
}

/// The code one entry into generated code can execute: the entered code object and the
/// rectifier. Generated code only reaches other code objects through the runtime.
pub(crate) struct EntryView<'a> {
    pub(crate) space: &'a CodeSpace,
    pub(crate) code: &'a GeneratedCode,
}

impl CodeSource for EntryView<'_> {
    fn code_at(&self, addr: u64) -> Option<&[u8]> {
        if self.code.contains(addr) {
            return self.code.code.get(usize::try_from(addr - self.code.base).ok()?..);
        }
        let off = usize::try_from(addr.checked_sub(CODE_BASE)?).ok()?;
        self.space.rectifier.get(off..)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        bytecode::{Op, Program, ScriptBuilder},
        compile::{compile, CompileContext},
        options::JitOptions,
        oracle::ProfileOracle,
    };

    fn compiled() -> CompiledFunction {
        let mut b = ScriptBuilder::new("f", 1, 0);
        b.ops(&[Op::GetArg(0), Op::Return]);
        let program = Program::new(vec![b.build().unwrap()]).unwrap();
        let oracle = ProfileOracle::new(&program);
        let opts = JitOptions::default();
        let ctx = CompileContext {
            program: &program,
            oracle: &oracle,
            options: &opts,
        };
        compile(&ctx, FuncId::from_raw(0)).unwrap()
    }

    #[test]
    fn install_and_lookup() {
        let cs = CodeSpace::new().unwrap();
        let a = cs.install(compiled());
        let b = cs.install(compiled());
        assert!(a.entry() > cs.rectifier());
        assert!(b.entry() >= a.entry() + a.code_size() as u64);
        assert_eq!(b.entry() % CODE_ALIGN, 0);
        let found = cs.lookup(a.entry() + 1).unwrap();
        assert!(Arc::ptr_eq(&found, &a));
        assert!(Arc::ptr_eq(&cs.lookup(b.entry()).unwrap(), &b));
        // The rectifier, and the gap after each code object, belong to no code object.
        assert!(cs.lookup(cs.rectifier()).is_none());
        assert!(cs.lookup(a.entry() + a.code_size() as u64).is_none());
    }

    #[test]
    fn invalidated_code_lives_while_referenced() {
        let cs = CodeSpace::new().unwrap();
        let a = cs.install(compiled());
        assert!(cs.invalidate(&a));
        assert!(!cs.invalidate(&a));
        assert!(a.is_invalidated());
        // A frame still executing `a` keeps it findable.
        assert_eq!(cs.release_unreferenced(&[a.entry() + 2]), 0);
        assert!(cs.lookup(a.entry()).is_some());
        assert_eq!(cs.pending(), 1);
        assert_eq!(cs.release_unreferenced(&[]), 1);
        assert!(cs.lookup(a.entry()).is_none());
        assert_eq!(cs.pending(), 0);
    }
}
