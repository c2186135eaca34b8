//! Type predictions.
//!
//! The graph builder consults a [TypeOracle] for the types values had at each program point when
//! the function was interpreted. Predictions are only hints: every narrowed type the compiler
//! relies upon is guarded at run time.

use crate::{
    bytecode::{FuncId, Program},
    value::{ShapeId, TypeSet, ValueType},
};
use index_vec::IndexVec;

pub trait TypeOracle: Sync {
    /// The types of the value produced by the instruction at `pc`. An empty set means the
    /// instruction has never produced a value.
    fn observed(&self, func: FuncId, pc: u32) -> TypeSet;

    /// The types the argument `idx` has had on entry.
    fn argument(&self, func: FuncId, idx: u16) -> TypeSet;

    /// The shapes of the objects whose properties the instruction at `pc` has accessed.
    fn property(&self, func: FuncId, pc: u32) -> ShapeCache;
}

/// What a property access has seen of its receivers' shapes.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum ShapeCache {
    #[default]
    Empty,
    /// Every receiver had `shape`, in which the property is at `slot` (or absent).
    Mono { shape: ShapeId, slot: Option<u32> },
    Poly,
}

impl ShapeCache {
    fn with(self, shape: ShapeId, slot: Option<u32>) -> Self {
        match self {
            ShapeCache::Empty => ShapeCache::Mono { shape, slot },
            ShapeCache::Mono { shape: s, .. } if s == shape => self,
            _ => ShapeCache::Poly,
        }
    }
}

#[derive(Clone, Debug, Default)]
struct FunctionProfile {
    results: Vec<TypeSet>,
    args: Vec<TypeSet>,
    shapes: Vec<ShapeCache>,
}

/// Type observations recorded by the interpreter, widened further by the bailout engine.
#[derive(Clone, Debug)]
pub struct ProfileOracle {
    funcs: IndexVec<FuncId, FunctionProfile>,
}

impl ProfileOracle {
    pub fn new(program: &Program) -> Self {
        let funcs = program
            .funcs()
            .map(|f| {
                let s = program.script(f);
                FunctionProfile {
                    results: vec![TypeSet::EMPTY; s.len()],
                    args: vec![TypeSet::EMPTY; usize::from(s.nargs())],
                    shapes: vec![ShapeCache::Empty; s.len()],
                }
            })
            .collect();
        Self { funcs }
    }

    /// Record that the instruction at `pc` produced a value of type `ty`. Returns `true` if this
    /// widened the prediction.
    pub fn observe(&mut self, func: FuncId, pc: u32, ty: ValueType) -> bool {
        match self.funcs[func].results.get_mut(pc as usize) {
            Some(s) => s.insert(ty),
            None => false,
        }
    }

    /// Record that argument `idx` had type `ty` on entry. Returns `true` if this widened the
    /// prediction.
    pub fn observe_arg(&mut self, func: FuncId, idx: u16, ty: ValueType) -> bool {
        match self.funcs[func].args.get_mut(usize::from(idx)) {
            Some(s) => s.insert(ty),
            None => false,
        }
    }

    /// Record that the property access at `pc` saw a receiver of shape `shape`, holding the
    /// property at `slot`.
    pub fn observe_shape(&mut self, func: FuncId, pc: u32, shape: ShapeId, slot: Option<u32>) {
        if let Some(c) = self.funcs[func].shapes.get_mut(pc as usize) {
            *c = c.with(shape, slot);
        }
    }

    /// Replace the prediction at `pc`.
    pub fn set(&mut self, func: FuncId, pc: u32, set: TypeSet) {
        self.funcs[func].results[pc as usize] = set;
    }

    /// Replace the prediction for argument `idx`.
    pub fn set_arg(&mut self, func: FuncId, idx: u16, set: TypeSet) {
        self.funcs[func].args[usize::from(idx)] = set;
    }
}

impl TypeOracle for ProfileOracle {
    fn observed(&self, func: FuncId, pc: u32) -> TypeSet {
        self.funcs
            .get(func)
            .and_then(|p| p.results.get(pc as usize))
            .copied()
            .unwrap_or(TypeSet::ANY)
    }

    fn argument(&self, func: FuncId, idx: u16) -> TypeSet {
        self.funcs
            .get(func)
            .and_then(|p| p.args.get(usize::from(idx)))
            .copied()
            .unwrap_or(TypeSet::ANY)
    }

    fn property(&self, func: FuncId, pc: u32) -> ShapeCache {
        self.funcs
            .get(func)
            .and_then(|p| p.shapes.get(pc as usize))
            .copied()
            .unwrap_or(ShapeCache::Poly)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bytecode::{Op, ScriptBuilder};

    #[test]
    fn observe_and_widen() {
        let mut b = ScriptBuilder::new("f", 2, 0);
        b.ops(&[Op::GetArg(0), Op::GetArg(1), Op::Add, Op::Return]);
        let p = Program::new(vec![b.build().unwrap()]).unwrap();
        let f = FuncId::from_raw(0);
        let mut o = ProfileOracle::new(&p);
        assert!(o.observed(f, 2).is_empty());
        assert!(o.observe(f, 2, ValueType::Int32));
        assert!(!o.observe(f, 2, ValueType::Int32));
        assert!(o.observe(f, 2, ValueType::Double));
        assert_eq!(
            o.observed(f, 2),
            TypeSet::of(&[ValueType::Int32, ValueType::Double])
        );
        assert!(o.observe_arg(f, 1, ValueType::String));
        assert_eq!(o.argument(f, 1), TypeSet::single(ValueType::String));
        assert!(o.argument(f, 7).is_any());
        assert!(o.observed(FuncId::from_raw(3), 0).is_any());
    }

    #[test]
    fn shape_caches() {
        let mut b = ScriptBuilder::new("f", 1, 0);
        b.op(Op::GetArg(0)).get_prop("x").op(Op::Return);
        let p = Program::new(vec![b.build().unwrap()]).unwrap();
        let f = FuncId::from_raw(0);
        let (s0, s1) = (ShapeId::from_raw(0), ShapeId::from_raw(1));
        let mut o = ProfileOracle::new(&p);
        assert_eq!(o.property(f, 1), ShapeCache::Empty);
        o.observe_shape(f, 1, s0, Some(2));
        o.observe_shape(f, 1, s0, Some(2));
        assert_eq!(
            o.property(f, 1),
            ShapeCache::Mono {
                shape: s0,
                slot: Some(2)
            }
        );
        o.observe_shape(f, 1, s1, None);
        assert_eq!(o.property(f, 1), ShapeCache::Poly);
        o.observe_shape(f, 1, s0, Some(2));
        assert_eq!(o.property(f, 1), ShapeCache::Poly);
        assert_eq!(o.property(FuncId::from_raw(3), 1), ShapeCache::Poly);
    }
}
