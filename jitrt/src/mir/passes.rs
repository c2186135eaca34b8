//! Transformations over a MIR [Graph].
//!
//! [optimize] runs every pass in the order lowering needs: afterwards no edge is critical, the
//! blocks are in reverse postorder, and dominators are known.

use super::{BlockIdx, Goto, Graph, MirType, Node, NodeT};
use index_vec::IndexVec;
use std::collections::HashSet;

pub(crate) fn optimize(g: &mut Graph) {
    split_critical_edges(g);
    eliminate_redundant_phis(g);
    eliminate_dead_code(g);
    reorder_blocks(g);
    build_dominators(g);
    if cfg!(debug_assertions) {
        g.assert_well_formed();
    }
}

/// Put a block on every edge from a block with several successors to a block with several
/// predecessors, so that phi moves always have a block of their own.
pub(crate) fn split_critical_edges(g: &mut Graph) {
    let blocks = g.blocks().collect::<Vec<_>>();
    for b in blocks {
        if g.block(b).succs.len() < 2 {
            continue;
        }
        for s in g.block(b).succs.clone() {
            if g.block(s).preds.len() < 2 {
                continue;
            }
            let nb = g.new_block();
            g.split_edge(b, s, nb);
            g.add(nb, Node::Goto(Goto), MirType::None, &[]);
        }
    }
}

/// Replace phis whose operands are all the same node (or the phi itself) with that node.
pub(crate) fn eliminate_redundant_phis(g: &mut Graph) {
    let mut changed = true;
    while changed {
        changed = false;
        let blocks = g.blocks().collect::<Vec<_>>();
        for b in blocks {
            for phi in g.block(b).phis.clone() {
                let mut same = None;
                let redundant = g.operands(phi).iter().all(|op| {
                    if *op == phi || Some(*op) == same {
                        true
                    } else if same.is_none() {
                        same = Some(*op);
                        true
                    } else {
                        false
                    }
                });
                if let (true, Some(same)) = (redundant, same) {
                    if g.ty(same) != g.ty(phi) {
                        continue;
                    }
                    // A phi that refers to itself must drop that use before it can go.
                    for i in 0..g.operands(phi).len() {
                        g.replace_operand(phi, i, same);
                    }
                    g.replace_all_uses(phi, same);
                    g.remove_node(phi);
                    changed = true;
                }
            }
        }
    }
}

/// Remove pure nodes nothing uses. Nodes a resume point refers to are kept, as bailouts need
/// them.
pub(crate) fn eliminate_dead_code(g: &mut Graph) {
    let mut work = Vec::new();
    for b in g.blocks() {
        let blk = g.block(b);
        work.extend(blk.phis.iter().chain(blk.nodes.iter()).copied());
    }
    while let Some(n) = work.pop() {
        if g.is_removed(n) || !g.uses(n).is_empty() || !g.node(n).is_pure() {
            continue;
        }
        let ops = g.operands(n).to_vec();
        g.remove_node(n);
        work.extend(ops);
    }
}

/// Remove unreachable blocks and order the remainder in reverse postorder.
pub(crate) fn reorder_blocks(g: &mut Graph) {
    let mut seen = HashSet::new();
    let mut post = Vec::new();
    // Each stack entry is a block and the index of the next successor to visit.
    let mut stack = vec![(g.entry(), 0)];
    seen.insert(g.entry());
    while let Some((b, i)) = stack.pop() {
        match g.block(b).succs.get(i) {
            Some(s) => {
                let s = *s;
                stack.push((b, i + 1));
                if seen.insert(s) {
                    stack.push((s, 0));
                }
            }
            None => post.push(b),
        }
    }
    let dead = g.blocks().filter(|b| !seen.contains(b)).collect::<Vec<_>>();
    for b in dead {
        g.remove_block(b);
    }
    post.reverse();
    g.set_order(post);
}

/// Compute immediate dominators with the algorithm from "A Simple, Fast Dominance Algorithm"
/// (Cooper, Harvey, Kennedy). The blocks must be in reverse postorder.
pub(crate) fn build_dominators(g: &mut Graph) {
    let order = g.order().to_vec();
    let mut rpo_num = IndexVec::<BlockIdx, usize>::new();
    let mut idoms = IndexVec::<BlockIdx, Option<BlockIdx>>::new();
    for _ in 0..g.blocks_len() {
        rpo_num.push(usize::MAX);
        idoms.push(None);
    }
    for (i, b) in order.iter().enumerate() {
        rpo_num[*b] = i;
    }
    let entry = g.entry();
    idoms[entry] = Some(entry);
    let mut changed = true;
    while changed {
        changed = false;
        for b in order.iter().skip(1) {
            let mut new_idom = None;
            for p in &g.block(*b).preds {
                if idoms[*p].is_none() {
                    continue;
                }
                new_idom = Some(match new_idom {
                    None => *p,
                    Some(cur) => intersect(&idoms, &rpo_num, *p, cur),
                });
            }
            if new_idom.is_some() && idoms[*b] != new_idom {
                idoms[*b] = new_idom;
                changed = true;
            }
        }
    }
    // The entry dominates itself only for the purposes of the algorithm.
    idoms[entry] = None;
    g.set_idoms(idoms);
}

fn intersect(
    idoms: &IndexVec<BlockIdx, Option<BlockIdx>>,
    rpo_num: &IndexVec<BlockIdx, usize>,
    mut a: BlockIdx,
    mut b: BlockIdx,
) -> BlockIdx {
    while a != b {
        while rpo_num[a] > rpo_num[b] {
            a = idoms[a].expect("processed block has an idom");
        }
        while rpo_num[b] > rpo_num[a] {
            b = idoms[b].expect("processed block has an idom");
        }
    }
    a
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        bytecode::FuncId,
        mir::{Compare, Constant, NodeIdx, Parameter, Return, Test},
        ops::CmpOp,
        value::Value,
    };

    fn live_nodes(g: &Graph) -> Vec<NodeIdx> {
        g.blocks()
            .flat_map(|b| {
                let blk = g.block(b);
                blk.phis
                    .iter()
                    .chain(blk.nodes.iter())
                    .copied()
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// A diamond: bb0 branches either to bb1 or straight to the join bb2, whose phi merges
    /// parameter 0 from both paths.
    fn diamond() -> (Graph, NodeIdx) {
        let mut g = Graph::new(FuncId::from_raw(0));
        let b0 = g.entry();
        let b1 = g.new_block();
        let b2 = g.new_block();
        let p = g.add(b0, Node::Parameter(Parameter { index: 0 }), MirType::Value, &[]);
        let c = g.add(
            b0,
            Node::Constant(Constant {
                value: Value::Boolean(true),
            }),
            MirType::Boolean,
            &[],
        );
        let t = g.add(
            b0,
            Node::Compare(Compare {
                op: CmpOp::Eq,
                ty: MirType::Boolean,
            }),
            MirType::Boolean,
            &[c, c],
        );
        g.add(b0, Node::Test(Test), MirType::None, &[t]);
        g.add_edge(b0, b1);
        g.add_edge(b0, b2);
        g.add(b1, Node::Goto(Goto), MirType::None, &[]);
        g.add_edge(b1, b2);
        let phi = g.add_phi(b2, MirType::Value);
        g.push_operand(phi, p);
        g.push_operand(phi, p);
        g.add(b2, Node::Return(Return), MirType::None, &[phi]);
        (g, p)
    }

    #[test]
    fn critical_edges_are_split() {
        let (mut g, _) = diamond();
        split_critical_edges(&mut g);
        // bb0 -> bb2 was critical.
        let b0 = g.entry();
        let succs = g.block(b0).succs.clone();
        assert_eq!(succs.len(), 2);
        assert_eq!(succs[0].index(), 1);
        let split = succs[1];
        assert_eq!(g.block(split).succs.as_slice(), &[BlockIdx::from_raw(2)]);
        assert_eq!(
            g.block(BlockIdx::from_raw(2)).preds.as_slice(),
            &[split, BlockIdx::from_raw(1)]
        );
        g.assert_well_formed();
    }

    #[test]
    fn redundant_phis_and_dead_code() {
        let (mut g, p) = diamond();
        optimize(&mut g);
        let ret = g.terminator(BlockIdx::from_raw(2)).unwrap();
        assert_eq!(g.operand(ret, 0), p);
        // The test's operands are still used, and the phi has gone.
        assert_eq!(live_nodes(&g).len(), 7);
        assert!(g.block(BlockIdx::from_raw(2)).phis.is_empty());
    }

    #[test]
    fn dominators() {
        let (mut g, _) = diamond();
        optimize(&mut g);
        let [b0, b1, b2] = [0, 1, 2].map(BlockIdx::from_raw);
        assert_eq!(g.order()[0], b0);
        assert_eq!(g.idom(b1), Some(b0));
        assert_eq!(g.idom(b2), Some(b0));
        assert!(g.dominates(b0, b2));
        assert!(!g.dominates(b1, b2));
    }

    #[test]
    fn unreachable_blocks_are_removed() {
        let (mut g, p) = diamond();
        let dead = g.new_block();
        g.add(dead, Node::Return(Return), MirType::None, &[p]);
        optimize(&mut g);
        assert!(!g.blocks().any(|b| b == dead));
        assert_eq!(g.uses(p).len(), 1);
    }
}
