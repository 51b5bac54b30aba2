//! CFG Traversal, DFS, Dominators
//!
//! Reverse-post-order DFS with pre/post numbering, and a dominator tree built
//! with the Cooper-Harvey-Kennedy iterative algorithm (`spec.md` §4.2 accepts
//! either that or Lengauer-Tarjan; the iterative form is simpler to keep
//! correct by inspection, which matters more here than asymptotic optimality
//! on the method sizes a JIT actually sees).

use rustc_hash::FxHashMap;

use crate::cfg::BlockId;
use crate::compiler::Compiler;

/// Result of a full DFS from the entry block: pre/post-order numbers and the
/// reverse-post-order block sequence. A block with no post-order number is
/// unreachable.
#[derive(Debug, Clone, Default)]
pub struct DfsTree {
    pub preorder: FxHashMap<BlockId, u32>,
    pub postorder: FxHashMap<BlockId, u32>,
    pub rpo: Vec<BlockId>,
}

impl DfsTree {
    pub fn is_reachable(&self, block: BlockId) -> bool {
        self.postorder.contains_key(&block)
    }
}

/// Builds the DFS tree via an explicit stack (no recursion, so method sizes
/// the real JIT would see without blowing the host stack are fine here too).
/// `pre`/`post`/`cross_or_back` are invoked exactly as the spec's three
/// traversal callbacks.
pub fn build_dfs(
    compiler: &Compiler,
    mut pre: impl FnMut(BlockId),
    mut post: impl FnMut(BlockId),
    mut cross_or_back: impl FnMut(BlockId, BlockId),
) -> DfsTree {
    let mut tree = DfsTree::default();
    let mut pre_counter = 0u32;
    let mut post_counter = 0u32;

    #[derive(Clone, Copy)]
    enum Frame {
        Enter(BlockId),
        Leave(BlockId),
    }

    let mut stack = vec![Frame::Enter(compiler.entry_block)];
    let mut visiting: FxHashMap<BlockId, bool> = FxHashMap::default();

    while let Some(frame) = stack.pop() {
        match frame {
            Frame::Enter(b) => {
                if tree.preorder.contains_key(&b) {
                    continue;
                }
                tree.preorder.insert(b, pre_counter);
                pre_counter += 1;
                visiting.insert(b, true);
                pre(b);
                stack.push(Frame::Leave(b));
                for succ in compiler.successors(b).into_iter().rev() {
                    if tree.preorder.contains_key(&succ) {
                        cross_or_back(b, succ);
                    } else {
                        stack.push(Frame::Enter(succ));
                    }
                }
            }
            Frame::Leave(b) => {
                visiting.insert(b, false);
                tree.postorder.insert(b, post_counter);
                post_counter += 1;
                tree.rpo.push(b);
                post(b);
            }
        }
    }

    tree.rpo.reverse();
    tree
}

/// Dominator tree exposing O(1) `dominates` via pre/post interval checks
/// over the DFS numbering that was current when the tree was built.
#[derive(Debug, Clone, Default)]
pub struct DomTree {
    idom: FxHashMap<BlockId, BlockId>,
    /// `[lo, hi)` subtree interval per block in the dominator tree's own
    /// pre-order, independent of the CFG DFS pre-order.
    interval: FxHashMap<BlockId, (u32, u32)>,
    pub entry: BlockId,
}

impl DomTree {
    pub fn idom(&self, block: BlockId) -> Option<BlockId> {
        self.idom.get(&block).copied()
    }

    /// O(1): does `a` dominate `b`?
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        if a == b {
            return true;
        }
        match (self.interval.get(&a), self.interval.get(&b)) {
            (Some(&(alo, ahi)), Some(&(blo, _))) => alo <= blo && blo < ahi,
            _ => false,
        }
    }
}

/// Cooper-Harvey-Kennedy: iterate `idom` assignment to a fixed point over
/// reverse-post-order, using the DFS postorder numbers as the "earlier in
/// RPO" comparator required by `intersect`.
pub fn build_dominators(compiler: &Compiler, dfs: &DfsTree) -> DomTree {
    let entry = compiler.entry_block;
    let rpo = &dfs.rpo;
    let rpo_index: FxHashMap<BlockId, usize> =
        rpo.iter().enumerate().map(|(i, &b)| (b, i)).collect();

    let mut idom: FxHashMap<BlockId, BlockId> = FxHashMap::default();
    idom.insert(entry, entry);

    let preds_in_rpo = |b: BlockId| -> Vec<BlockId> {
        compiler
            .predecessor_edges(b)
            .map(|e| e.from)
            .filter(|p| rpo_index.contains_key(p))
            .collect()
    };

    let intersect = |idom: &FxHashMap<BlockId, BlockId>, mut a: BlockId, mut b: BlockId| -> BlockId {
        while a != b {
            while rpo_index[&a] > rpo_index[&b] {
                a = idom[&a];
            }
            while rpo_index[&b] > rpo_index[&a] {
                b = idom[&b];
            }
        }
        a
    };

    let mut changed = true;
    while changed {
        changed = false;
        for &b in rpo.iter() {
            if b == entry {
                continue;
            }
            let preds = preds_in_rpo(b);
            let mut new_idom = None;
            for p in preds {
                if idom.contains_key(&p) {
                    new_idom = Some(match new_idom {
                        None => p,
                        Some(cur) => intersect(&idom, cur, p),
                    });
                }
            }
            if let Some(new_idom) = new_idom {
                if idom.get(&b) != Some(&new_idom) {
                    idom.insert(b, new_idom);
                    changed = true;
                }
            }
        }
    }

    // Build dominator-tree pre-order intervals via an explicit-stack walk of
    // the idom-induced tree.
    let mut children: FxHashMap<BlockId, Vec<BlockId>> = FxHashMap::default();
    for (&b, &parent) in idom.iter() {
        if b != entry {
            children.entry(parent).or_default().push(b);
        }
    }

    let mut interval = FxHashMap::default();
    let mut counter = 0u32;
    let mut stack = vec![(entry, false)];
    let mut lo_stack: Vec<u32> = Vec::new();
    while let Some((b, leaving)) = stack.pop() {
        if !leaving {
            let lo = counter;
            counter += 1;
            lo_stack.push(lo);
            stack.push((b, true));
            if let Some(kids) = children.get(&b) {
                for &k in kids.iter().rev() {
                    stack.push((k, false));
                }
            }
        } else {
            let lo = lo_stack.pop().unwrap();
            interval.insert(b, (lo, counter));
        }
    }

    DomTree { idom, interval, entry }
}
