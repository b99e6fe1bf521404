/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Dominators for generated test functions, so that every generated
//! use is dominated by its definition.
//!
//! This is the algorithm of Cooper, Harvey and Kennedy, "A Simple,
//! Fast Dominance Algorithm".

use alloc::vec;
use alloc::vec::Vec;

use crate::Block;

/// Blocks reachable from `entry`, in postorder.
pub fn postorder(num_blocks: usize, entry: Block, succs: &[Vec<Block>]) -> Vec<Block> {
    let mut visited = vec![false; num_blocks];
    let mut out = Vec::with_capacity(num_blocks);
    let mut stack: Vec<(Block, usize)> = vec![(entry, 0)];
    visited[entry.index()] = true;
    while let Some((block, next)) = stack.last_mut() {
        match succs[block.index()].get(*next) {
            Some(&succ) => {
                *next += 1;
                if !visited[succ.index()] {
                    visited[succ.index()] = true;
                    stack.push((succ, 0));
                }
            }
            None => {
                out.push(*block);
                stack.pop();
            }
        }
    }
    out
}

fn merge_sets(idom: &[Block], block_to_rpo: &[Option<u32>], mut a: Block, mut b: Block) -> Block {
    while a != b {
        if a.is_invalid() || b.is_invalid() {
            return Block::invalid();
        }
        let (ra, rb) = (block_to_rpo[a.index()], block_to_rpo[b.index()]);
        if ra > rb {
            a = idom[a.index()];
        } else if rb > ra {
            b = idom[b.index()];
        }
    }
    a
}

/// Immediate dominator of every block; `invalid()` for the entry and
/// for unreachable blocks.
pub fn calculate(num_blocks: usize, preds: &[Vec<Block>], post_ord: &[Block], entry: Block) -> Vec<Block> {
    let mut block_to_rpo = vec![None; num_blocks];
    for (i, block) in post_ord.iter().rev().enumerate() {
        block_to_rpo[block.index()] = Some(i as u32);
    }

    let mut idom = vec![Block::invalid(); num_blocks];
    idom[entry.index()] = entry;

    let mut changed = true;
    while changed {
        changed = false;
        for &node in post_ord.iter().rev() {
            if node == entry {
                continue;
            }
            let mut parent = Block::invalid();
            for &pred in preds[node.index()].iter() {
                if block_to_rpo[pred.index()].is_none() || idom[pred.index()].is_invalid() {
                    continue;
                }
                parent = if parent.is_invalid() {
                    pred
                } else {
                    merge_sets(&idom, &block_to_rpo, parent, pred)
                };
            }
            if parent.is_valid() && parent != idom[node.index()] {
                idom[node.index()] = parent;
                changed = true;
            }
        }
    }

    idom[entry.index()] = Block::invalid();
    idom
}

pub fn dominates(idom: &[Block], a: Block, mut b: Block) -> bool {
    loop {
        if a == b {
            return true;
        }
        if b.is_invalid() {
            return false;
        }
        b = idom[b.index()];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(n: usize) -> Block {
        Block::new(n)
    }

    #[test]
    fn diamond_with_loop() {
        // 0 -> 1 -> {2, 3}; 2 -> 4; 3 -> 4; 4 -> 1.
        let succs = vec![
            vec![b(1)],
            vec![b(2), b(3)],
            vec![b(4)],
            vec![b(4)],
            vec![b(1)],
        ];
        let preds = vec![vec![], vec![b(0), b(4)], vec![b(1)], vec![b(1)], vec![b(2), b(3)]];
        let po = postorder(5, b(0), &succs);
        assert_eq!(po.len(), 5);
        assert_eq!(*po.last().unwrap(), b(0));
        let idom = calculate(5, &preds, &po, b(0));
        assert_eq!(idom[1], b(0));
        assert_eq!(idom[4], b(1));
        assert!(dominates(&idom, b(1), b(3)));
        assert!(!dominates(&idom, b(2), b(4)));
    }
}
