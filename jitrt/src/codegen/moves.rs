//! Sequentialise parallel moves.
//!
//! A parallel move sets every destination to the value its source held before any of the moves
//! happened. Moves are emitted once nothing still to be read is overwritten; cycles are broken
//! by parking one value in `r14`/`f14`. Memory to memory moves go through `r15`/`f15`.

use super::emit::{Addr, Emitter, FReg, Reg, FSCRATCH0, FSCRATCH1, SCRATCH0, SCRATCH1};

/// One end of a move.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum Operand {
    Reg(Reg),
    FReg(FReg),
    /// The word at `sp + n`.
    Stack(i32),
    /// A constant word. Only valid as a source.
    Imm(u64),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct Move {
    pub dst: Operand,
    pub src: Operand,
    /// Does the value belong in float registers?
    pub float: bool,
}

pub(crate) fn emit_parallel(asm: &mut impl Emitter, moves: &[Move]) {
    let mut pending = moves
        .iter()
        .filter(|m| m.dst != m.src)
        .copied()
        .collect::<Vec<_>>();
    while !pending.is_empty() {
        let ready = pending
            .iter()
            .position(|m| !pending.iter().any(|o| o.src == m.dst));
        match ready {
            Some(i) => {
                let m = pending.remove(i);
                emit_one(asm, m);
            }
            None => {
                // Every remaining destination is still to be read: park one of them.
                let d = pending[0].dst;
                let float = pending[0].float;
                let tmp = if float {
                    Operand::FReg(FSCRATCH0)
                } else {
                    Operand::Reg(SCRATCH0)
                };
                emit_one(
                    asm,
                    Move {
                        dst: tmp,
                        src: d,
                        float,
                    },
                );
                for m in pending.iter_mut() {
                    if m.src == d {
                        m.src = tmp;
                    }
                }
            }
        }
    }
}

fn emit_one(asm: &mut impl Emitter, m: Move) {
    match (m.dst, m.src, m.float) {
        (Operand::Reg(d), Operand::Reg(s), _) => asm.mov(d, s),
        (Operand::Reg(d), Operand::Stack(off), _) => asm.load(d, Addr::Sp(off)),
        (Operand::Reg(d), Operand::Imm(x), _) => asm.mov_imm(d, x),
        (Operand::Reg(d), Operand::FReg(s), _) => asm.fmov_to_bits(d, s),
        (Operand::FReg(d), Operand::FReg(s), _) => asm.fmov(d, s),
        (Operand::FReg(d), Operand::Stack(off), _) => asm.fload(d, Addr::Sp(off)),
        (Operand::FReg(d), Operand::Imm(x), _) => {
            asm.mov_imm(SCRATCH1, x);
            asm.fmov_from_bits(d, SCRATCH1);
        }
        (Operand::FReg(d), Operand::Reg(s), _) => asm.fmov_from_bits(d, s),
        (Operand::Stack(off), Operand::Reg(s), _) => asm.store(s, Addr::Sp(off)),
        (Operand::Stack(off), Operand::FReg(s), _) => asm.fstore(s, Addr::Sp(off)),
        (Operand::Stack(off), Operand::Imm(x), _) => {
            asm.mov_imm(SCRATCH1, x);
            asm.store(SCRATCH1, Addr::Sp(off));
        }
        (Operand::Stack(d), Operand::Stack(s), false) => {
            asm.load(SCRATCH1, Addr::Sp(s));
            asm.store(SCRATCH1, Addr::Sp(d));
        }
        (Operand::Stack(d), Operand::Stack(s), true) => {
            asm.fload(FSCRATCH1, Addr::Sp(s));
            asm.fstore(FSCRATCH1, Addr::Sp(d));
        }
        (Operand::Imm(_), _, _) => unreachable!("move to an immediate"),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::codegen::sim::{
        machine::{CodeSource, Machine, MachineExit, STACK_TOP},
        SimAssembler, CODE_BASE, ENTRY_RETURN,
    };
    use std::sync::{atomic::AtomicBool, Arc};

    struct Code(Vec<u8>);

    impl CodeSource for Code {
        fn code_at(&self, addr: u64) -> Option<&[u8]> {
            self.0.get(usize::try_from(addr - CODE_BASE).ok()?..)
        }
    }

    /// Run `moves` on a machine whose registers and two stack slots are set by `init`.
    fn run_moves(moves: &[Move], init: impl FnOnce(&mut Machine)) -> Machine {
        let mut asm = SimAssembler::new();
        asm.add_sp(-16);
        emit_parallel(&mut asm, moves);
        asm.add_sp(16);
        asm.ret();
        let code = Code(asm.finish().unwrap());
        let mut m = Machine::new(Arc::new(AtomicBool::new(false)));
        m.push(ENTRY_RETURN).unwrap();
        init(&mut m);
        m.set_pc(CODE_BASE);
        assert_eq!(m.run(&code), Ok(MachineExit::EntryReturn));
        m
    }

    fn mv(dst: Operand, src: Operand) -> Move {
        Move {
            dst,
            src,
            float: false,
        }
    }

    #[test]
    fn swap() {
        let m = run_moves(
            &[
                mv(Operand::Reg(Reg(0)), Operand::Reg(Reg(1))),
                mv(Operand::Reg(Reg(1)), Operand::Reg(Reg(0))),
            ],
            |m| {
                m.gprs[0] = 10;
                m.gprs[1] = 11;
            },
        );
        assert_eq!((m.gprs[0], m.gprs[1]), (11, 10));
    }

    #[test]
    fn cycle_through_memory_and_a_chain() {
        // s0 -> r2 -> r3 -> s0, and r3 -> r4, and 7 -> s1.
        // The slots are below the entry return address.
        let s = STACK_TOP - 24;
        let m = run_moves(
            &[
                mv(Operand::Reg(Reg(2)), Operand::Stack(0)),
                mv(Operand::Reg(Reg(3)), Operand::Reg(Reg(2))),
                mv(Operand::Stack(0), Operand::Reg(Reg(3))),
                mv(Operand::Reg(Reg(4)), Operand::Reg(Reg(3))),
                mv(Operand::Stack(8), Operand::Imm(7)),
            ],
            |m| {
                m.write(s, 100).unwrap();
                m.gprs[2] = 102;
                m.gprs[3] = 103;
            },
        );
        assert_eq!((m.gprs[2], m.gprs[3], m.gprs[4]), (100, 102, 103));
        assert_eq!((m.read(s), m.read(s + 8)), (Ok(103), Ok(7)));
    }

    #[test]
    fn float_rotation() {
        let f = |n| Operand::FReg(FReg(n));
        let moves = [(0, 1), (1, 2), (2, 0)]
            .map(|(d, s)| Move {
                dst: f(d),
                src: f(s),
                float: true,
            });
        let m = run_moves(&moves, |m| m.fprs[..3].copy_from_slice(&[0.5, 1.5, 2.5]));
        assert_eq!(&m.fprs[..3], &[1.5, 2.5, 0.5]);
    }
}
