#![allow(clippy::new_without_default)]

//! Snapshot encoding for speculatively compiled code.
//!
//! A snapshot records, for one guard site, where each logical interpreter slot (arguments, then
//! locals, then the expression stack) lives once the guard has failed. Snapshots are written once
//! by the code generator into a per-function buffer and read only when a guard fails. A snapshot
//! is identified by its byte offset ([SnapshotOffset]) in that buffer.
//!
//! The layout of one snapshot is:
//!
//! ```text
//! snapshot := frame_count:uvar kind:u8 frame*
//! frame    := func:uvar pc:uvar nslots:uvar slot*
//! slot     := mode:u8 payload
//! ```
//!
//! where `uvar` is an unsigned LEB128 integer and signed integers are zig-zag encoded first.
//! Frames are written outermost caller first: the last frame is the one the guard belongs to.
//! The order of slots within a frame is a contract between writer and reader: neither side
//! reorders.

use byteorder::ReadBytesExt;
use std::{fmt, io::Cursor};
use strum::{Display, EnumCount, FromRepr};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("snapshot buffer truncated at byte {0}")]
    Truncated(usize),
    #[error("snapshot offset {0} out of bounds")]
    BadOffset(u32),
    #[error("invalid slot mode {mode} at byte {off}")]
    BadMode { mode: u8, off: usize },
    #[error("invalid {what} {val} at byte {off}")]
    BadValue {
        what: &'static str,
        val: u64,
        off: usize,
    },
    #[error("frame has {0} unread slots")]
    UnreadSlots(u32),
    #[error("no slots left in frame")]
    NoSlotsLeft,
}

/// The byte offset of a snapshot within its buffer.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SnapshotOffset(u32);

impl SnapshotOffset {
    pub fn new(off: u32) -> Self {
        Self(off)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for SnapshotOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "snap@{}", self.0)
    }
}

/// Why a guard failed. The runtime applies a different policy to each kind.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Display, EnumCount, Eq, FromRepr, Hash, PartialEq)]
pub enum BailoutKind {
    /// A speculated operand type or control path did not hold.
    #[strum(to_string = "normal")]
    Normal,
    /// Checked integer arithmetic overflowed.
    #[strum(to_string = "overflow")]
    Overflow,
    /// A value produced by a call or a generic operation had an unpredicted type.
    #[strum(to_string = "type-barrier")]
    TypeBarrier,
    /// An argument did not have the type assumed at function entry.
    #[strum(to_string = "argument-check")]
    ArgumentCheck,
}

/// The statically known type of a [Slot::Typed] payload.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Display, EnumCount, Eq, FromRepr, Hash, PartialEq)]
pub enum SlotType {
    Boolean,
    Int32,
    Double,
    String,
    Object,
}

/// Where a machine word lives once a guard has failed.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Loc {
    /// A general purpose register.
    Reg(u8),
    /// A floating point register.
    FloatReg(u8),
    /// A byte offset from the bottom of the generated frame.
    Stack(u32),
}

impl fmt::Display for Loc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Loc::Reg(r) => write!(f, "r{r}"),
            Loc::FloatReg(r) => write!(f, "f{r}"),
            Loc::Stack(off) => write!(f, "[sp+{off}]"),
        }
    }
}

/// One logical interpreter slot.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Slot {
    Undefined,
    Null,
    Boolean(bool),
    Int32(i32),
    /// An index into the owning code object's constant pool.
    Constant(u32),
    /// A payload whose type is known at compile time.
    Typed { ty: SlotType, loc: Loc },
    /// A boxed value: the tag and the payload are separate machine words.
    Boxed { tag: Loc, payload: Loc },
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::Undefined => write!(f, "undefined"),
            Slot::Null => write!(f, "null"),
            Slot::Boolean(b) => write!(f, "{b}"),
            Slot::Int32(x) => write!(f, "{x}i32"),
            Slot::Constant(i) => write!(f, "const#{i}"),
            Slot::Typed { ty, loc } => write!(f, "{ty}:{loc}"),
            Slot::Boxed { tag, payload } => write!(f, "box({tag}, {payload})"),
        }
    }
}

const MODE_UNDEFINED: u8 = 0;
const MODE_NULL: u8 = 1;
const MODE_FALSE: u8 = 2;
const MODE_TRUE: u8 = 3;
const MODE_INT32: u8 = 4;
const MODE_CONSTANT: u8 = 5;
const MODE_TYPED: u8 = 6;
const MODE_BOXED: u8 = 7;

const LOC_REG: u8 = 0;
const LOC_FLOAT_REG: u8 = 1;
const LOC_STACK: u8 = 2;

/// Writes snapshots into a single growable buffer.
pub struct SnapshotWriter {
    buf: Vec<u8>,
    /// How many frames the current snapshot still expects.
    frames_left: u32,
    /// How many slots the current frame still expects.
    slots_left: u32,
    in_snapshot: bool,
}

impl SnapshotWriter {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            frames_left: 0,
            slots_left: 0,
            in_snapshot: false,
        }
    }

    /// Start a new snapshot of `frame_count` frames, returning its offset.
    ///
    /// # Panics
    ///
    /// If a previous snapshot has not been ended.
    pub fn start_snapshot(&mut self, frame_count: u32, kind: BailoutKind) -> SnapshotOffset {
        assert!(!self.in_snapshot, "snapshot started before previous one ended");
        assert!(frame_count > 0);
        let off = SnapshotOffset(
            u32::try_from(self.buf.len()).expect("snapshot buffer exceeds 4GiB"),
        );
        self.write_uvar(u64::from(frame_count));
        self.buf.push(kind as u8);
        self.frames_left = frame_count;
        self.in_snapshot = true;
        off
    }

    pub fn start_frame(&mut self, func: u32, pc: u32, nslots: u32) {
        assert!(self.in_snapshot && self.frames_left > 0 && self.slots_left == 0);
        self.write_uvar(u64::from(func));
        self.write_uvar(u64::from(pc));
        self.write_uvar(u64::from(nslots));
        self.frames_left -= 1;
        self.slots_left = nslots;
    }

    pub fn add_slot(&mut self, slot: &Slot) {
        assert!(self.slots_left > 0, "more slots written than declared");
        self.slots_left -= 1;
        match *slot {
            Slot::Undefined => self.buf.push(MODE_UNDEFINED),
            Slot::Null => self.buf.push(MODE_NULL),
            Slot::Boolean(false) => self.buf.push(MODE_FALSE),
            Slot::Boolean(true) => self.buf.push(MODE_TRUE),
            Slot::Int32(x) => {
                self.buf.push(MODE_INT32);
                self.write_svar(i64::from(x));
            }
            Slot::Constant(idx) => {
                self.buf.push(MODE_CONSTANT);
                self.write_uvar(u64::from(idx));
            }
            Slot::Typed { ty, loc } => {
                self.buf.push(MODE_TYPED);
                self.buf.push(ty as u8);
                self.write_loc(loc);
            }
            Slot::Boxed { tag, payload } => {
                self.buf.push(MODE_BOXED);
                self.write_loc(tag);
                self.write_loc(payload);
            }
        }
    }

    pub fn end_frame(&mut self) {
        assert_eq!(self.slots_left, 0, "fewer slots written than declared");
    }

    pub fn end_snapshot(&mut self) {
        assert!(self.in_snapshot);
        assert_eq!(self.frames_left, 0, "fewer frames written than declared");
        assert_eq!(self.slots_left, 0);
        self.in_snapshot = false;
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Consume the writer and return the encoded buffer.
    ///
    /// # Panics
    ///
    /// If a snapshot is still being written.
    pub fn finish(self) -> Vec<u8> {
        assert!(!self.in_snapshot);
        self.buf
    }

    fn write_loc(&mut self, loc: Loc) {
        match loc {
            Loc::Reg(r) => {
                self.buf.push(LOC_REG);
                self.buf.push(r);
            }
            Loc::FloatReg(r) => {
                self.buf.push(LOC_FLOAT_REG);
                self.buf.push(r);
            }
            Loc::Stack(off) => {
                self.buf.push(LOC_STACK);
                self.write_uvar(u64::from(off));
            }
        }
    }

    fn write_uvar(&mut self, mut v: u64) {
        loop {
            let b = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                self.buf.push(b);
                break;
            }
            self.buf.push(b | 0x80);
        }
    }

    fn write_svar(&mut self, v: i64) {
        self.write_uvar(((v << 1) ^ (v >> 63)) as u64);
    }
}

/// The header of one frame within a snapshot.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FrameHeader {
    pub func: u32,
    pub pc: u32,
    pub nslots: u32,
}

/// Reads one snapshot. Frames must be read in order, and every slot of a frame must be read
/// before moving to the next frame.
pub struct SnapshotReader<'a> {
    cursor: Cursor<&'a [u8]>,
    frame_count: u32,
    frames_read: u32,
    slots_left: u32,
    kind: BailoutKind,
}

impl<'a> SnapshotReader<'a> {
    pub fn new(buf: &'a [u8], off: SnapshotOffset) -> Result<Self, SnapshotError> {
        if usize::try_from(off.0).map_or(true, |x| x >= buf.len()) {
            return Err(SnapshotError::BadOffset(off.0));
        }
        let mut cursor = Cursor::new(buf);
        cursor.set_position(u64::from(off.0));
        let mut rdr = Self {
            cursor,
            frame_count: 0,
            frames_read: 0,
            slots_left: 0,
            kind: BailoutKind::Normal,
        };
        rdr.frame_count = rdr.read_u32("frame count")?;
        let pos = rdr.pos();
        let kind = rdr.read_u8()?;
        rdr.kind = BailoutKind::from_repr(kind).ok_or(SnapshotError::BadValue {
            what: "bailout kind",
            val: u64::from(kind),
            off: pos,
        })?;
        Ok(rdr)
    }

    pub fn frame_count(&self) -> u32 {
        self.frame_count
    }

    pub fn bailout_kind(&self) -> BailoutKind {
        self.kind
    }

    /// Return the next frame's header, or `None` if all frames have been read.
    pub fn next_frame(&mut self) -> Result<Option<FrameHeader>, SnapshotError> {
        if self.slots_left != 0 {
            return Err(SnapshotError::UnreadSlots(self.slots_left));
        }
        if self.frames_read == self.frame_count {
            return Ok(None);
        }
        let func = self.read_u32("function")?;
        let pc = self.read_u32("pc")?;
        let nslots = self.read_u32("slot count")?;
        self.frames_read += 1;
        self.slots_left = nslots;
        Ok(Some(FrameHeader { func, pc, nslots }))
    }

    pub fn read_slot(&mut self) -> Result<Slot, SnapshotError> {
        if self.slots_left == 0 {
            return Err(SnapshotError::NoSlotsLeft);
        }
        self.slots_left -= 1;
        let off = self.pos();
        let slot = match self.read_u8()? {
            MODE_UNDEFINED => Slot::Undefined,
            MODE_NULL => Slot::Null,
            MODE_FALSE => Slot::Boolean(false),
            MODE_TRUE => Slot::Boolean(true),
            MODE_INT32 => {
                let off = self.pos();
                let v = self.read_svar()?;
                Slot::Int32(i32::try_from(v).map_err(|_| SnapshotError::BadValue {
                    what: "int32",
                    val: v as u64,
                    off,
                })?)
            }
            MODE_CONSTANT => Slot::Constant(self.read_u32("constant index")?),
            MODE_TYPED => {
                let off = self.pos();
                let ty = self.read_u8()?;
                let ty = SlotType::from_repr(ty).ok_or(SnapshotError::BadValue {
                    what: "slot type",
                    val: u64::from(ty),
                    off,
                })?;
                Slot::Typed {
                    ty,
                    loc: self.read_loc()?,
                }
            }
            MODE_BOXED => {
                let tag = self.read_loc()?;
                let payload = self.read_loc()?;
                Slot::Boxed { tag, payload }
            }
            mode => return Err(SnapshotError::BadMode { mode, off }),
        };
        Ok(slot)
    }

    fn pos(&self) -> usize {
        // The cursor is built over a slice, so its position always fits in a usize.
        self.cursor.position() as usize
    }

    fn read_u8(&mut self) -> Result<u8, SnapshotError> {
        let pos = self.pos();
        self.cursor
            .read_u8()
            .map_err(|_| SnapshotError::Truncated(pos))
    }

    fn read_loc(&mut self) -> Result<Loc, SnapshotError> {
        let off = self.pos();
        match self.read_u8()? {
            LOC_REG => Ok(Loc::Reg(self.read_u8()?)),
            LOC_FLOAT_REG => Ok(Loc::FloatReg(self.read_u8()?)),
            LOC_STACK => Ok(Loc::Stack(self.read_u32("stack offset")?)),
            x => Err(SnapshotError::BadValue {
                what: "location",
                val: u64::from(x),
                off,
            }),
        }
    }

    fn read_uvar(&mut self) -> Result<u64, SnapshotError> {
        let mut v = 0u64;
        let mut shift = 0;
        loop {
            let off = self.pos();
            let b = self.read_u8()?;
            if shift >= 64 {
                return Err(SnapshotError::BadValue {
                    what: "varint",
                    val: u64::from(b),
                    off,
                });
            }
            v |= u64::from(b & 0x7f) << shift;
            if b & 0x80 == 0 {
                return Ok(v);
            }
            shift += 7;
        }
    }

    fn read_svar(&mut self) -> Result<i64, SnapshotError> {
        let v = self.read_uvar()?;
        Ok(((v >> 1) as i64) ^ -((v & 1) as i64))
    }

    fn read_u32(&mut self, what: &'static str) -> Result<u32, SnapshotError> {
        let off = self.pos();
        let v = self.read_uvar()?;
        u32::try_from(v).map_err(|_| SnapshotError::BadValue { what, val: v, off })
    }
}

/// A fully decoded snapshot, mostly useful for debugging and for tests.
#[derive(Debug, PartialEq)]
pub struct DecodedSnapshot {
    pub kind: BailoutKind,
    pub frames: Vec<(FrameHeader, Vec<Slot>)>,
}

/// Decode the snapshot at `off` in one go.
pub fn decode(buf: &[u8], off: SnapshotOffset) -> Result<DecodedSnapshot, SnapshotError> {
    let mut rdr = SnapshotReader::new(buf, off)?;
    let mut frames = Vec::with_capacity(usize::try_from(rdr.frame_count()).unwrap_or(0));
    while let Some(hdr) = rdr.next_frame()? {
        let mut slots = Vec::with_capacity(usize::try_from(hdr.nslots).unwrap_or(0));
        for _ in 0..hdr.nslots {
            slots.push(rdr.read_slot()?);
        }
        frames.push((hdr, slots));
    }
    Ok(DecodedSnapshot {
        kind: rdr.bailout_kind(),
        frames,
    })
}
