//! Values as seen by the interpreter and by generated code.
//!
//! Generated code handles a [Value] either unboxed (a single payload word whose type is known at
//! compile time) or boxed: a pair of machine words `(tag, payload)` where the tag is the
//! [ValueType] discriminant. Strings and objects are handles into a [Heap].

use index_vec::IndexVec;
use std::{collections::HashMap, fmt, sync::Arc};
use strum::{Display, EnumCount, EnumIter, FromRepr, IntoEnumIterator};

index_vec::define_index_type! {
    pub struct StrId = u32;
}

index_vec::define_index_type! {
    pub struct ObjId = u32;
}

index_vec::define_index_type! {
    pub struct ShapeId = u32;
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, Display, EnumCount, EnumIter, Eq, FromRepr, Hash, PartialEq)]
pub enum ValueType {
    Undefined,
    Null,
    Boolean,
    Int32,
    Double,
    String,
    Object,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Value {
    Undefined,
    Null,
    Boolean(bool),
    Int32(i32),
    Double(f64),
    String(StrId),
    Object(ObjId),
}

impl Value {
    pub fn ty(&self) -> ValueType {
        match self {
            Value::Undefined => ValueType::Undefined,
            Value::Null => ValueType::Null,
            Value::Boolean(_) => ValueType::Boolean,
            Value::Int32(_) => ValueType::Int32,
            Value::Double(_) => ValueType::Double,
            Value::String(_) => ValueType::String,
            Value::Object(_) => ValueType::Object,
        }
    }

    /// The payload word of this value.
    pub fn payload(&self) -> u64 {
        match *self {
            Value::Undefined | Value::Null => 0,
            Value::Boolean(b) => u64::from(b),
            Value::Int32(x) => u64::from(x as u32),
            Value::Double(d) => d.to_bits(),
            Value::String(s) => u64::from(s.raw()),
            Value::Object(o) => u64::from(o.raw()),
        }
    }

    /// Box this value into `(tag, payload)`.
    pub fn to_bits(&self) -> (u64, u64) {
        (self.ty() as u64, self.payload())
    }

    /// Rebuild a value from a payload whose type is known.
    pub fn from_payload(ty: ValueType, payload: u64) -> Value {
        match ty {
            ValueType::Undefined => Value::Undefined,
            ValueType::Null => Value::Null,
            ValueType::Boolean => Value::Boolean(payload & 1 != 0),
            ValueType::Int32 => Value::Int32(payload as u32 as i32),
            ValueType::Double => Value::Double(f64::from_bits(payload)),
            ValueType::String => Value::String(StrId::from_raw(payload as u32)),
            ValueType::Object => Value::Object(ObjId::from_raw(payload as u32)),
        }
    }

    /// Unbox `(tag, payload)`, returning `None` if `tag` is not a valid [ValueType].
    pub fn from_bits(tag: u64, payload: u64) -> Option<Value> {
        let ty = ValueType::from_repr(u8::try_from(tag).ok()?)?;
        Some(Value::from_payload(ty, payload))
    }

    pub fn is_number(&self) -> bool {
        matches!(self, Value::Int32(_) | Value::Double(_))
    }

    /// Do `self` and `other` print identically? Numbers compare by numeric value (so `Int32(3)`
    /// and `Double(3.0)` are the same), with NaN equal to itself.
    pub fn same_observable(&self, other: &Value) -> bool {
        match (self.as_f64(), other.as_f64()) {
            (Some(x), Some(y)) => x == y || (x.is_nan() && y.is_nan()),
            _ => self == other,
        }
    }

    pub(crate) fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Int32(x) => Some(f64::from(x)),
            Value::Double(d) => Some(d),
            _ => None,
        }
    }
}

/// A set of [ValueType]s. The empty set means "never observed"; [TypeSet::ANY] means nothing is
/// known.
#[derive(Clone, Copy, Default, Eq, Hash, PartialEq)]
pub struct TypeSet(u8);

static_assertions::const_assert!(ValueType::COUNT <= 8);

impl TypeSet {
    pub const EMPTY: TypeSet = TypeSet(0);
    pub const ANY: TypeSet = TypeSet((1 << ValueType::COUNT) - 1);

    pub fn single(ty: ValueType) -> Self {
        TypeSet(1 << ty as u8)
    }

    pub fn of(tys: &[ValueType]) -> Self {
        tys.iter().fold(Self::EMPTY, |s, ty| s.with(*ty))
    }

    pub fn contains(self, ty: ValueType) -> bool {
        self.0 & (1 << ty as u8) != 0
    }

    pub fn with(self, ty: ValueType) -> Self {
        TypeSet(self.0 | (1 << ty as u8))
    }

    pub fn insert(&mut self, ty: ValueType) -> bool {
        let old = *self;
        *self = self.with(ty);
        old != *self
    }

    pub fn union(self, other: TypeSet) -> TypeSet {
        TypeSet(self.0 | other.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn is_any(self) -> bool {
        self == Self::ANY
    }

    /// If this set contains exactly one type, return it.
    pub fn only(self) -> Option<ValueType> {
        if self.0.count_ones() == 1 {
            ValueType::from_repr(self.0.trailing_zeros() as u8)
        } else {
            None
        }
    }

    /// Is this a non-empty subset of {Int32, Double}?
    pub fn is_numeric(self) -> bool {
        !self.is_empty() && self.0 & !(TypeSet::of(&[ValueType::Int32, ValueType::Double]).0) == 0
    }

    pub fn iter(self) -> impl Iterator<Item = ValueType> {
        ValueType::iter().filter(move |ty| self.contains(*ty))
    }
}

impl fmt::Debug for TypeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for TypeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_any() {
            return write!(f, "any");
        }
        write!(
            f,
            "{{{}}}",
            self.iter()
                .map(|x| x.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        )
    }
}

/// How many properties an object stores inline. Generated code only accesses these directly.
pub const FIXED_SLOTS: u32 = 8;

/// The size in bytes of an object as generated code sees it: its shape word followed by a
/// `(tag, payload)` pair per fixed slot.
pub const OBJECT_SIZE: u64 = 8 * (1 + 2 * FIXED_SLOTS as u64);

static_assertions::const_assert!(OBJECT_SIZE <= u8::MAX as u64);

/// The layout of an object: its class and the properties it has, in slot order. Objects that
/// gained the same properties in the same order share a shape, so checking an object's shape is
/// enough to know which slot a property lives in.
#[derive(Debug)]
pub struct Shape {
    pub class: StrId,
    pub parent: Option<ShapeId>,
    /// The property added by this shape, or `None` for a class's empty shape.
    pub name: Option<StrId>,
    pub nslots: u32,
}

#[derive(Debug)]
pub struct Object {
    pub shape: ShapeId,
    /// Property values, boxed, in the order given by `shape`.
    slots: Vec<(u64, u64)>,
}

/// Interned strings and objects. Strings are interned so that two [StrId]s are equal iff their
/// contents are equal.
#[derive(Debug, Default)]
pub struct Heap {
    strings: IndexVec<StrId, Arc<str>>,
    interned: HashMap<Arc<str>, StrId>,
    objects: IndexVec<ObjId, Object>,
    shapes: IndexVec<ShapeId, Shape>,
    empty_shapes: HashMap<StrId, ShapeId>,
    transitions: HashMap<(ShapeId, StrId), ShapeId>,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, s: &str) -> StrId {
        if let Some(id) = self.interned.get(s) {
            return *id;
        }
        let s: Arc<str> = Arc::from(s);
        let id = self.strings.push(Arc::clone(&s));
        self.interned.insert(s, id);
        id
    }

    pub fn string(&self, id: StrId) -> &str {
        &self.strings[id]
    }

    pub fn new_object(&mut self, class: &str) -> ObjId {
        let class = self.intern(class);
        self.new_object_of(class)
    }

    /// Create an object of `class` with no properties.
    pub fn new_object_of(&mut self, class: StrId) -> ObjId {
        let shapes = &mut self.shapes;
        let shape = *self.empty_shapes.entry(class).or_insert_with(|| {
            shapes.push(Shape {
                class,
                parent: None,
                name: None,
                nslots: 0,
            })
        });
        self.objects.push(Object {
            shape,
            slots: Vec::new(),
        })
    }

    pub fn object(&self, id: ObjId) -> &Object {
        &self.objects[id]
    }

    pub fn shape(&self, id: ShapeId) -> &Shape {
        &self.shapes[id]
    }

    /// The slot holding property `name` in objects of shape `shape`, if they have it.
    pub fn slot(&self, mut shape: ShapeId, name: StrId) -> Option<u32> {
        loop {
            let s = &self.shapes[shape];
            if s.name == Some(name) {
                return Some(s.nslots - 1);
            }
            shape = s.parent?;
        }
    }

    /// Read property `name` of `obj`. Missing properties, and properties of anything that is not
    /// an object, are `undefined`.
    pub fn get_property(&self, obj: Value, name: StrId) -> Value {
        let Value::Object(o) = obj else {
            return Value::Undefined;
        };
        let o = &self.objects[o];
        self.slot(o.shape, name)
            .and_then(|i| o.slots.get(i as usize))
            .and_then(|(tag, payload)| Value::from_bits(*tag, *payload))
            .unwrap_or(Value::Undefined)
    }

    /// Write property `name` of `obj`, adding it if needed. Writes to anything that is not an
    /// object are ignored.
    pub fn set_property(&mut self, obj: Value, name: StrId, v: Value) {
        let Value::Object(o) = obj else {
            return;
        };
        let shape = self.objects[o].shape;
        match self.slot(shape, name) {
            Some(i) => self.objects[o].slots[i as usize] = v.to_bits(),
            None => {
                let next = self.add_property(shape, name);
                let o = &mut self.objects[o];
                o.shape = next;
                o.slots.push(v.to_bits());
            }
        }
    }

    fn add_property(&mut self, shape: ShapeId, name: StrId) -> ShapeId {
        if let Some(s) = self.transitions.get(&(shape, name)) {
            return *s;
        }
        let (class, nslots) = (self.shapes[shape].class, self.shapes[shape].nslots);
        let next = self.shapes.push(Shape {
            class,
            parent: Some(shape),
            name: Some(name),
            nslots: nslots + 1,
        });
        self.transitions.insert((shape, name), next);
        next
    }

    /// Word `word` of `obj` in the [OBJECT_SIZE] layout: the shape, then each slot's tag and
    /// payload. Returns `None` for slots the object does not have.
    pub fn object_word(&self, obj: ObjId, word: u32) -> Option<u64> {
        let o = self.objects.get(obj)?;
        match word.checked_sub(1) {
            None => Some(u64::from(o.shape.raw())),
            Some(w) => o
                .slots
                .get((w / 2) as usize)
                .map(|(tag, payload)| if w % 2 == 0 { *tag } else { *payload }),
        }
    }

    /// Overwrite a slot word of `obj`. The shape word cannot be written.
    pub fn set_object_word(&mut self, obj: ObjId, word: u32, val: u64) -> Option<()> {
        let w = word.checked_sub(1)?;
        let slot = self.objects.get_mut(obj)?.slots.get_mut((w / 2) as usize)?;
        if w % 2 == 0 {
            slot.0 = val;
        } else {
            slot.1 = val;
        }
        Some(())
    }

    /// Convert `v` to a string the way the interpreter prints it.
    pub fn display(&self, v: Value) -> String {
        match v {
            Value::Undefined => "undefined".to_owned(),
            Value::Null => "null".to_owned(),
            Value::Boolean(b) => b.to_string(),
            Value::Int32(x) => x.to_string(),
            Value::Double(d) => fmt_double(d),
            Value::String(s) => self.string(s).to_owned(),
            Value::Object(o) => {
                let class = self.shape(self.object(o).shape).class;
                format!("[object {}]", self.string(class))
            },
        }
    }
}

/// Format a double the way a JavaScript engine would: integral values print without a
/// fractional part.
pub fn fmt_double(d: f64) -> String {
    if d.is_nan() {
        "NaN".to_owned()
    } else if d.is_infinite() {
        (if d > 0.0 { "Infinity" } else { "-Infinity" }).to_owned()
    } else if d == d.trunc() && d.abs() < 1e21 {
        format!("{}", d as i64)
    } else {
        format!("{d}")
    }
}
