//! Linear scan register allocation.
//!
//! Each vreg gets a single live interval: the hull of every position at which it is live. Values
//! live across a VM call always live on the stack, since calls clobber every register. So do
//! values referenced by a safepoint's snapshot: the runtime walks the stack while the safepoint's
//! call is in progress, and by then the registers belong to whatever ran last.

use super::{LirFunction, RegClass, VReg};
use crate::{
    codegen::emit::{FReg, Reg, ALLOCATABLE_FPRS, ALLOCATABLE_GPRS},
    compile::CompilationError,
    mir::BlockIdx,
};
use index_vec::IndexVec;
use std::{
    collections::{HashMap, HashSet},
    fmt,
};

/// Where a vreg lives for its whole lifetime.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Location {
    Reg(Reg),
    FReg(FReg),
    /// A word slot in the frame, at `sp + 8 * n` once the prologue has run.
    Stack(u32),
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Reg(r) => write!(f, "{r}"),
            Location::FReg(r) => write!(f, "{r}"),
            Location::Stack(n) => write!(f, "s{n}"),
        }
    }
}

pub(crate) struct Allocation {
    locs: IndexVec<VReg, Location>,
    frame_slots: u32,
}

impl Allocation {
    pub(crate) fn loc(&self, v: VReg) -> Location {
        self.locs[v]
    }

    /// The bytes of spill slots the frame needs.
    pub(crate) fn frame_size(&self) -> u32 {
        self.frame_slots * 8
    }
}

#[derive(Clone, Copy, Debug)]
struct Interval {
    vreg: VReg,
    start: usize,
    end: usize,
}

pub(crate) fn allocate(lir: &LirFunction) -> Result<Allocation, CompilationError> {
    let positions = number(lir);
    let (live_in, live_out) = liveness(lir);

    let mut hull: HashMap<VReg, (usize, usize)> = HashMap::new();
    let mut extend = |v: VReg, p: usize| {
        let e = hull.entry(v).or_insert((p, p));
        e.0 = e.0.min(p);
        e.1 = e.1.max(p);
    };
    let mut calls = Vec::new();
    let mut forced = HashSet::new();
    for b in &lir.order {
        let (start, end) = positions[b];
        for v in &live_in[b] {
            extend(*v, start);
        }
        for v in &live_out[b] {
            extend(*v, end);
        }
        for (i, inst) in lir.blocks[*b].iter().enumerate() {
            let p = start + 2 * i;
            for v in inst.uses.iter().filter_map(|u| u.vreg()) {
                extend(v, p);
            }
            for v in &inst.defs {
                extend(*v, p);
            }
            if let Some(s) = inst.snapshot {
                for v in lir.snapshots[s].vregs() {
                    extend(v, p);
                    if inst.op.is_safepoint() {
                        forced.insert(v);
                    }
                }
            }
            if inst.op.is_call() {
                calls.push(p);
            }
        }
    }

    let mut intervals = hull
        .into_iter()
        .map(|(vreg, (start, end))| Interval { vreg, start, end })
        .collect::<Vec<_>>();
    intervals.sort_by_key(|i| (i.start, i.vreg));
    for i in &intervals {
        if calls.iter().any(|p| i.start < *p && *p < i.end) {
            forced.insert(i.vreg);
        }
    }

    let mut locs = IndexVec::with_capacity(lir.vregs.len());
    for class in lir.vregs.iter() {
        locs.push(match class {
            RegClass::General => Location::Reg(Reg(0)),
            RegClass::Float => Location::FReg(FReg(0)),
        });
    }
    let mut scan = Scan::default();
    for class in [RegClass::General, RegClass::Float] {
        scan.run(
            lir,
            class,
            intervals.iter().filter(|i| lir.class(i.vreg) == class),
            &forced,
            &mut locs,
        );
    }
    if scan.frame_slots > u32::from(u16::MAX) {
        return Err(CompilationError::LimitExceeded(format!(
            "{} spill slots",
            scan.frame_slots
        )));
    }
    Ok(Allocation {
        locs,
        frame_slots: scan.frame_slots,
    })
}

/// The first and last positions of each block. Instruction `i` of a block starting at `s` is at
/// position `s + 2 * i`.
fn number(lir: &LirFunction) -> HashMap<BlockIdx, (usize, usize)> {
    let mut out = HashMap::new();
    let mut pos = 0;
    for b in &lir.order {
        let n = lir.blocks[*b].len().max(1);
        out.insert(*b, (pos, pos + 2 * (n - 1)));
        pos += 2 * n;
    }
    out
}

type LiveSets = HashMap<BlockIdx, HashSet<VReg>>;

/// Backwards dataflow: which vregs are live on entry to, and exit from, each block.
fn liveness(lir: &LirFunction) -> (LiveSets, LiveSets) {
    let mut live_in: LiveSets = lir.order.iter().map(|b| (*b, HashSet::new())).collect();
    let mut live_out: LiveSets = live_in.clone();
    let mut changed = true;
    while changed {
        changed = false;
        for b in lir.order.iter().rev() {
            let insts = &lir.blocks[*b];
            let mut out = HashSet::new();
            if let Some(last) = insts.last() {
                for s in last.op.successors() {
                    if let Some(l) = live_in.get(&s) {
                        out.extend(l.iter().copied());
                    }
                }
            }
            let mut live = out.clone();
            for inst in insts.iter().rev() {
                for v in &inst.defs {
                    live.remove(v);
                }
                live.extend(inst.uses.iter().filter_map(|u| u.vreg()));
                if let Some(s) = inst.snapshot {
                    live.extend(lir.snapshots[s].vregs());
                }
            }
            if live != live_in[b] {
                live_in.insert(*b, live);
                changed = true;
            }
            live_out.insert(*b, out);
        }
    }
    (live_in, live_out)
}

/// The state of the linear scan. Each register class gets its own stack slots.
#[derive(Default)]
struct Scan {
    frame_slots: u32,
    free_slots: Vec<u32>,
    /// Intervals currently holding a stack slot: `(end, slot)`.
    stack_active: Vec<(usize, u32)>,
}

impl Scan {
    fn new_slot(&mut self, start: usize, end: usize) -> u32 {
        let mut i = 0;
        while i < self.stack_active.len() {
            if self.stack_active[i].0 < start {
                let (_, s) = self.stack_active.swap_remove(i);
                self.free_slots.push(s);
            } else {
                i += 1;
            }
        }
        // Hand out the lowest free slot so that frames stay small.
        self.free_slots.sort_unstable_by(|a, b| b.cmp(a));
        let slot = match self.free_slots.pop() {
            Some(s) => s,
            None => {
                self.frame_slots += 1;
                self.frame_slots - 1
            }
        };
        self.stack_active.push((end, slot));
        slot
    }

    fn run<'a>(
        &mut self,
        lir: &LirFunction,
        class: RegClass,
        intervals: impl Iterator<Item = &'a Interval>,
        forced: &HashSet<VReg>,
        locs: &mut IndexVec<VReg, Location>,
    ) {
        let nregs = match class {
            RegClass::General => ALLOCATABLE_GPRS,
            RegClass::Float => ALLOCATABLE_FPRS,
        };
        let reg = |n: u8| match class {
            RegClass::General => Location::Reg(Reg(n)),
            RegClass::Float => Location::FReg(FReg(n)),
        };
        // Highest first, so that `pop` hands out low registers first.
        let mut free = (0..nregs).rev().collect::<Vec<_>>();
        self.free_slots.clear();
        self.stack_active.clear();
        let mut active: Vec<(Interval, u8)> = Vec::new();
        for iv in intervals {
            debug_assert_eq!(lir.class(iv.vreg), class);
            active.retain(|(a, r)| {
                if a.end < iv.start {
                    free.push(*r);
                    false
                } else {
                    true
                }
            });
            if forced.contains(&iv.vreg) {
                locs[iv.vreg] = Location::Stack(self.new_slot(iv.start, iv.end));
                continue;
            }
            if let Some(r) = free.pop() {
                locs[iv.vreg] = reg(r);
                active.push((*iv, r));
                continue;
            }
            // Out of registers: whichever interval ends last goes to the stack.
            let (victim, _) = active
                .iter()
                .enumerate()
                .max_by_key(|(_, (a, _))| a.end)
                .map(|(i, (a, _))| (i, a.end))
                .unwrap_or((usize::MAX, 0));
            if victim != usize::MAX && active[victim].0.end > iv.end {
                let (spilled, r) = active.swap_remove(victim);
                locs[spilled.vreg] = Location::Stack(self.new_slot(iv.start, spilled.end));
                locs[iv.vreg] = reg(r);
                active.push((*iv, r));
            } else {
                locs[iv.vreg] = Location::Stack(self.new_slot(iv.start, iv.end));
            }
        }
    }
}
