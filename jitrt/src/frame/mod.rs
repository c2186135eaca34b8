//! Frame descriptors and the stack walker.
//!
//! Every call made by generated code (or into it) pushes a header onto the machine stack.
//! Viewed from the callee, with `addr` the address of the return address slot:
//!
//! ```text
//! addr + 24 + 16 * argc ... ^ caller's frame body (spill slots), then the caller's own header
//! addr + 24 + 16 * i        | argument i: tag, then payload
//! addr + 16                 | argc
//! addr + 8                  | descriptor of the caller
//! addr                      | return address into the caller
//! addr - 8                  | (exit frames only) the VM function id
//! ```
//!
//! A descriptor describes the frame that pushed it: its kind and the size of its body. The
//! walk therefore learns each frame's kind from the header of the frame below it. It starts
//! from the newest exit frame (recorded by the runtime when generated code calls it) or from a
//! failed guard, and ends with the entry frame: the runtime's own frame, which has no header.

use crate::code::{CodeLookup, GeneratedCode};
use std::{fmt, sync::Arc};
use strum::{Display, FromRepr};
use thiserror::Error;

const KIND_BITS: u32 = 2;
const KIND_MASK: u64 = (1 << KIND_BITS) - 1;
const CLASS_BIT: u64 = 1 << KIND_BITS;
const SIZE_SHIFT: u32 = KIND_BITS + 1;

/// The sizes in bytes a frame body is padded up to, if it fits one.
pub const SIZE_CLASSES: [u32; 6] = [32, 64, 128, 256, 512, 1024];

/// The bytes between a frame's return address slot and its first argument.
pub(crate) const HEADER_SIZE: u64 = 24;
/// The bytes one boxed argument takes.
pub(crate) const ARG_SIZE: u64 = 16;

#[repr(u8)]
#[derive(Clone, Copy, Debug, Display, Eq, FromRepr, Hash, PartialEq)]
#[strum(serialize_all = "lowercase")]
pub enum FrameKind {
    /// The runtime, calling into generated code.
    Entry,
    /// Generated code.
    Normal,
    /// The stub that pads a call with too few arguments.
    Rectifier,
    /// The runtime, called by generated code.
    Exit,
}

#[derive(Debug, Error, PartialEq)]
pub enum FrameError {
    #[error("invalid frame descriptor {0:#x}")]
    BadDescriptor(u64),
    #[error("stack unreadable at {0:#x}")]
    Unreadable(u64),
    #[error("frame chain does not reach an entry frame")]
    Unterminated,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FrameDescriptor {
    pub kind: FrameKind,
    /// The size in bytes of the frame's body.
    pub size: u32,
}

impl FrameDescriptor {
    pub fn new(kind: FrameKind, size: u32) -> Self {
        Self { kind, size }
    }

    pub fn encode(self) -> u64 {
        let kind = self.kind as u64;
        match SIZE_CLASSES.iter().position(|c| *c == self.size) {
            Some(class) => ((class as u64) << SIZE_SHIFT) | CLASS_BIT | kind,
            None => (u64::from(self.size) << SIZE_SHIFT) | kind,
        }
    }

    pub fn decode(word: u64) -> Result<Self, FrameError> {
        let kind = FrameKind::from_repr((word & KIND_MASK) as u8)
            .ok_or(FrameError::BadDescriptor(word))?;
        let n = word >> SIZE_SHIFT;
        let size = if word & CLASS_BIT != 0 {
            usize::try_from(n)
                .ok()
                .and_then(|i| SIZE_CLASSES.get(i))
                .copied()
                .ok_or(FrameError::BadDescriptor(word))?
        } else {
            u32::try_from(n).map_err(|_| FrameError::BadDescriptor(word))?
        };
        Ok(Self { kind, size })
    }
}

impl fmt::Display for FrameDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.size)
    }
}

/// Pad a frame body of `size` bytes up to its size class, or to a multiple of 16 if it is
/// larger than every class.
pub(crate) fn round_frame_size(size: u32) -> u32 {
    SIZE_CLASSES
        .iter()
        .copied()
        .find(|c| *c >= size)
        .unwrap_or_else(|| size.next_multiple_of(16))
}

/// Read access to the machine stack.
pub(crate) trait StackMemory {
    fn read_word(&self, addr: u64) -> Option<u64>;
}

/// One frame found by the [StackWalker].
#[derive(Clone)]
pub struct FrameView {
    pub kind: FrameKind,
    /// The address of the frame's return address slot. For the entry frame, the address just
    /// above the header and arguments of the frame it called.
    pub addr: u64,
    /// Where the frame returns to. `None` for the entry frame.
    pub return_address: Option<u64>,
    /// For normal frames, the generated code being executed.
    pub code: Option<Arc<GeneratedCode>>,
    /// The lowest address of the frame's body.
    pub(crate) body: u64,
    /// The address the frame is executing at: the return address of the frame it called.
    pub(crate) pc: Option<u64>,
}

impl fmt::Debug for FrameView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} frame at {:#x}", self.kind, self.addr)?;
        if let Some(ra) = self.return_address {
            write!(f, " (returns to {ra:#x})")?;
        }
        Ok(())
    }
}

impl FrameView {
    /// Read this frame's argument count. Not available for the entry frame.
    pub(crate) fn argc(&self, stack: &impl StackMemory) -> Result<u64, FrameError> {
        read(stack, self.addr + 16)
    }

    /// Read this frame's argument `i` as `(tag, payload)`.
    pub(crate) fn arg(&self, stack: &impl StackMemory, i: u64) -> Result<(u64, u64), FrameError> {
        let a = self.addr + HEADER_SIZE + ARG_SIZE * i;
        Ok((read(stack, a)?, read(stack, a + 8)?))
    }
}

fn read(stack: &impl StackMemory, addr: u64) -> Result<u64, FrameError> {
    stack.read_word(addr).ok_or(FrameError::Unreadable(addr))
}

/// Walks frames from the newest to the entry frame.
pub(crate) struct StackWalker<'a, S, C> {
    stack: &'a S,
    codes: &'a C,
    next: Option<(FrameKind, u64, u64, Option<u64>)>,
    /// Stops walks over a corrupted stack.
    limit: usize,
}

impl<'a, S: StackMemory, C: CodeLookup> StackWalker<'a, S, C> {
    /// Walk from the exit frame whose footer is at `exit_sp`.
    pub(crate) fn from_exit(stack: &'a S, codes: &'a C, exit_sp: u64, limit: usize) -> Self {
        Self {
            stack,
            codes,
            next: Some((FrameKind::Exit, exit_sp + 8, exit_sp, None)),
            limit,
        }
    }

    /// Walk from a generated frame with a `size` byte body stopped at a failed guard. `sp`
    /// points at the return address of the guard's call to the bailout trampoline.
    pub(crate) fn from_bailout(
        stack: &'a S,
        codes: &'a C,
        sp: u64,
        size: u32,
        limit: usize,
    ) -> Result<Self, FrameError> {
        let pc = read(stack, sp)?;
        let body = sp + 8;
        Ok(Self {
            stack,
            codes,
            next: Some((FrameKind::Normal, body + u64::from(size), body, Some(pc))),
            limit,
        })
    }

    fn step(&mut self) -> Result<Option<FrameView>, FrameError> {
        let Some((kind, addr, body, pc)) = self.next.take() else {
            return Ok(None);
        };
        if self.limit == 0 {
            return Err(FrameError::Unterminated);
        }
        self.limit -= 1;
        let code = match (kind, pc) {
            (FrameKind::Normal, Some(pc)) => self.codes.lookup(pc),
            _ => None,
        };
        if kind == FrameKind::Entry {
            return Ok(Some(FrameView {
                kind,
                addr,
                return_address: None,
                code: None,
                body,
                pc,
            }));
        }
        let ret = read(self.stack, addr)?;
        let caller = FrameDescriptor::decode(read(self.stack, addr + 8)?)?;
        let argc = read(self.stack, addr + 16)?;
        let caller_body = argc
            .checked_mul(ARG_SIZE)
            .and_then(|x| x.checked_add(addr + HEADER_SIZE))
            .ok_or(FrameError::Unreadable(addr + 16))?;
        self.next = Some((
            caller.kind,
            caller_body + u64::from(caller.size),
            caller_body,
            Some(ret),
        ));
        Ok(Some(FrameView {
            kind,
            addr,
            return_address: Some(ret),
            code,
            body,
            pc,
        }))
    }
}

impl<S: StackMemory, C: CodeLookup> Iterator for StackWalker<'_, S, C> {
    type Item = Result<FrameView, FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.step() {
            Ok(Some(f)) => Some(Ok(f)),
            Ok(None) => None,
            Err(e) => {
                self.next = None;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct Stack(HashMap<u64, u64>);

    impl StackMemory for Stack {
        fn read_word(&self, addr: u64) -> Option<u64> {
            self.0.get(&addr).copied()
        }
    }

    struct NoCode;

    impl CodeLookup for NoCode {
        fn lookup(&self, _addr: u64) -> Option<Arc<GeneratedCode>> {
            None
        }
    }

    #[test]
    fn descriptors() {
        for (kind, size) in [
            (FrameKind::Entry, 0),
            (FrameKind::Normal, 64),
            (FrameKind::Normal, 2048),
            (FrameKind::Rectifier, 0),
            (FrameKind::Exit, 1024),
        ] {
            let d = FrameDescriptor::new(kind, size);
            assert_eq!(FrameDescriptor::decode(d.encode()), Ok(d));
        }
        assert_eq!(
            FrameDescriptor::new(FrameKind::Normal, 64).encode(),
            (1 << 3) | 4 | 1
        );
        assert_eq!(
            FrameDescriptor::decode((6 << 3) | 4),
            Err(FrameError::BadDescriptor((6 << 3) | 4))
        );
        assert_eq!(round_frame_size(0), 32);
        assert_eq!(round_frame_size(40), 64);
        assert_eq!(round_frame_size(1032), 1040);
    }

    /// A stack with, from the top: an exit frame called by a generated frame, called through
    /// the rectifier, called by the runtime.
    #[test]
    fn walk_to_entry() {
        let mut s = Stack::default();
        let mut sp = 0x10000;
        let mut push = |v: u64| {
            sp -= 8;
            s.0.insert(sp, v);
            sp
        };
        // The runtime calls the rectifier with 1 argument.
        push(5);
        push(3);
        push(1);
        push(FrameDescriptor::new(FrameKind::Entry, 0).encode());
        let rect = push(0xdead);
        // The rectifier calls the generated function with 2.
        for w in [0, 0, 5, 3] {
            push(w);
        }
        push(2);
        push(FrameDescriptor::new(FrameKind::Rectifier, 0).encode());
        let jit = push(0x1000);
        // The generated function has a 32 byte body and calls the runtime with no arguments.
        for _ in 0..4 {
            push(0);
        }
        push(0);
        push(FrameDescriptor::new(FrameKind::Normal, 32).encode());
        push(0x4000_0010);
        let exit_sp = push(42);

        let frames = StackWalker::from_exit(&s, &NoCode, exit_sp, 10)
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        let kinds = frames.iter().map(|f| f.kind).collect::<Vec<_>>();
        assert_eq!(
            kinds,
            [
                FrameKind::Exit,
                FrameKind::Normal,
                FrameKind::Rectifier,
                FrameKind::Entry
            ]
        );
        assert_eq!(frames[1].addr, jit);
        assert_eq!(frames[1].pc, Some(0x4000_0010));
        assert_eq!(frames[1].argc(&s), Ok(2));
        assert_eq!(frames[1].arg(&s, 1), Ok((0, 0)));
        assert_eq!(frames[2].addr, rect);
        assert_eq!(frames[2].arg(&s, 0), Ok((3, 5)));
        assert_eq!(frames[3].addr, 0x10000);
        assert_eq!(frames[3].return_address, None);
    }

    #[test]
    fn corrupt_stacks_end_the_walk() {
        let mut s = Stack::default();
        // A frame that claims to be its own caller, forever.
        s.0.insert(0x100, 0);
        s.0.insert(0x108, FrameDescriptor::new(FrameKind::Normal, 0).encode());
        s.0.insert(0x110, u64::MAX);
        let r = StackWalker::from_exit(&s, &NoCode, 0xf8, 10).collect::<Vec<_>>();
        assert!(matches!(r.last(), Some(Err(FrameError::Unreadable(_)))));

        s.0.insert(0x110, 0);
        s.0.insert(0x118, 0);
        s.0.insert(0x120, FrameDescriptor::new(FrameKind::Normal, 0).encode());
        s.0.insert(0x128, 0);
        let r = StackWalker::from_exit(&s, &NoCode, 0xf8, 1).collect::<Vec<_>>();
        assert!(matches!(r.last(), Some(Err(FrameError::Unterminated))));
    }
}
