//! Loop Discovery and Iteration Analysis
//!
//! Natural loops from back-edges, nested by block-set inclusion, with
//! preheader canonicalization and best-effort induction-variable fitting
//! (`spec.md` §4.5).

use rustc_hash::FxHashSet;

use crate::cfg::{BlockId, BranchKind};
use crate::compiler::Compiler;
use crate::ir::{ArithOp, CmpOp, Expr, ExprKind, StmtKind};
use crate::traversal::{DfsTree, DomTree};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LoopId(pub u32);

/// Source of a loop's induction-variable bound.
#[derive(Debug, Clone, PartialEq)]
pub enum BoundSource {
    Const(i64),
    InvariantLocal(crate::ir::LocalId),
    /// Length of an invariant array/collection reference.
    InvariantArrayLength(crate::ir::LocalId),
}

/// A fitted `for (iv = init; iv testOp limit; iv += stride)` pattern.
#[derive(Debug, Clone, PartialEq)]
pub struct IterationInfo {
    pub iv: crate::ir::LocalId,
    pub init: BoundSource,
    pub limit: BoundSource,
    pub test_op: CmpOp,
    pub stride: i64,
}

impl IterationInfo {
    pub fn is_increasing(&self) -> bool {
        self.stride > 0 && matches!(self.test_op, CmpOp::Lt | CmpOp::Le)
    }

    pub fn is_decreasing(&self) -> bool {
        self.stride < 0 && matches!(self.test_op, CmpOp::Gt | CmpOp::Ge)
    }

    pub fn is_monotonic(&self) -> bool {
        self.is_increasing() || self.is_decreasing()
    }
}

#[derive(Debug, Clone)]
pub struct NaturalLoop {
    pub id: LoopId,
    pub header: BlockId,
    pub blocks: FxHashSet<BlockId>,
    pub parent: Option<LoopId>,
    pub children: Vec<LoopId>,
    /// Unique `ALWAYS` entry edge's source outside the loop, if canonical.
    pub preheader: Option<BlockId>,
    pub iteration: Option<IterationInfo>,
}

impl NaturalLoop {
    pub fn contains(&self, b: BlockId) -> bool {
        self.blocks.contains(&b)
    }

    pub fn is_canonical(&self) -> bool {
        self.preheader.is_some()
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoopForest {
    loops: Vec<NaturalLoop>,
}

impl LoopForest {
    pub fn get(&self, id: LoopId) -> &NaturalLoop {
        &self.loops[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: LoopId) -> &mut NaturalLoop {
        &mut self.loops[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.loops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NaturalLoop> {
        self.loops.iter()
    }

    /// Innermost loop containing `block`, if any.
    pub fn innermost_containing(&self, block: BlockId) -> Option<LoopId> {
        self.loops
            .iter()
            .filter(|l| l.contains(block))
            .min_by_key(|l| l.blocks.len())
            .map(|l| l.id)
    }
}

/// Finds every back edge `v -> u` (`u` dominates `v`) and merges those
/// sharing a header into one natural loop: the loop body is every block
/// that can reach `v` without passing through `u`, found by a reverse
/// worklist walk seeded at each back edge's tail.
pub fn discover_loops(compiler: &Compiler, dfs: &DfsTree, doms: &DomTree) -> LoopForest {
    let mut by_header: Vec<(BlockId, FxHashSet<BlockId>)> = Vec::new();

    for edge in &compiler.edges {
        if !dfs.is_reachable(edge.from) || !dfs.is_reachable(edge.to) {
            continue;
        }
        if !doms.dominates(edge.to, edge.from) {
            continue;
        }
        let header = edge.to;
        let tail = edge.from;

        let mut body: FxHashSet<BlockId> = FxHashSet::default();
        body.insert(header);
        let mut worklist = vec![tail];
        body.insert(tail);
        while let Some(b) = worklist.pop() {
            for pred_edge in compiler.predecessor_edges(b) {
                let p = pred_edge.from;
                if body.insert(p) {
                    worklist.push(p);
                }
            }
        }

        if let Some(existing) = by_header.iter_mut().find(|(h, _)| *h == header) {
            existing.1.extend(body);
        } else {
            by_header.push((header, body));
        }
    }

    // Deterministic order: by header's DFS preorder number, matching the
    // source's "loops discovered in RPO of their headers" convention.
    by_header.sort_by_key(|(h, _)| dfs.preorder.get(h).copied().unwrap_or(u32::MAX));

    let mut loops: Vec<NaturalLoop> = by_header
        .into_iter()
        .enumerate()
        .map(|(i, (header, blocks))| NaturalLoop {
            id: LoopId(i as u32),
            header,
            blocks,
            parent: None,
            children: Vec::new(),
            preheader: None,
            iteration: None,
        })
        .collect();

    // Nesting by inclusion: parent is the smallest strict superset.
    let n = loops.len();
    for i in 0..n {
        let mut parent: Option<usize> = None;
        for j in 0..n {
            if i == j {
                continue;
            }
            let is_superset = loops[j].blocks.len() > loops[i].blocks.len()
                && loops[i].blocks.is_subset(&loops[j].blocks);
            if is_superset {
                match parent {
                    None => parent = Some(j),
                    Some(p) if loops[j].blocks.len() < loops[p].blocks.len() => parent = Some(j),
                    _ => {}
                }
            }
        }
        loops[i].parent = parent.map(|p| LoopId(p as u32));
    }
    for i in 0..n {
        if let Some(p) = loops[i].parent {
            loops[p.0 as usize].children.push(LoopId(i as u32));
        }
    }

    for i in 0..n {
        let header = loops[i].header;
        loops[i].preheader = find_preheader(compiler, header, &loops[i].blocks);
        loops[i].iteration = fit_iteration(compiler, &loops[i]);
    }

    LoopForest { loops }
}

/// A loop is canonical iff the header has exactly one predecessor outside
/// the loop, and that predecessor is an `ALWAYS` block in the header's EH
/// region (`spec.md` §4.5).
fn find_preheader(
    compiler: &Compiler,
    header: BlockId,
    body: &FxHashSet<BlockId>,
) -> Option<BlockId> {
    let outside: Vec<BlockId> = compiler
        .predecessor_edges(header)
        .map(|e| e.from)
        .filter(|p| !body.contains(p))
        .collect();
    if outside.len() != 1 {
        return None;
    }
    let candidate = outside[0];
    let cb = compiler.block(candidate);
    if !matches!(cb.branch, BranchKind::Always(_)) {
        return None;
    }
    let header_block = compiler.block(header);
    if cb.try_region != header_block.try_region || cb.handler_region != header_block.handler_region {
        return None;
    }
    Some(candidate)
}

/// Best-effort fit of the `for (iv = init; iv testOp limit; iv += stride)`
/// pattern (`spec.md` §4.5). Requires a canonical preheader: without one
/// there is nowhere well-defined to look for `init`.
fn fit_iteration(compiler: &Compiler, lp: &NaturalLoop) -> Option<IterationInfo> {
    let preheader = lp.preheader?;
    let header_block = compiler.block(lp.header);

    let (test_op, iv_candidate, limit_expr) = find_header_test(header_block)?;

    if single_def_count(compiler, &lp.blocks, iv_candidate) != 1
        || compiler.locals.get(iv_candidate).address_exposed
    {
        return None;
    }

    let limit = classify_bound(compiler, &lp.blocks, limit_expr)?;
    let (stride, update_block) = find_stride_update(compiler, &lp.blocks, iv_candidate)?;
    let _ = update_block;
    if stride == 0 || stride.abs() >= 58 {
        return None;
    }

    let init = find_init(compiler, preheader, iv_candidate)?;

    let info = IterationInfo { iv: iv_candidate, init, limit, test_op, stride };
    if info.is_monotonic() {
        Some(info)
    } else {
        None
    }
}

/// Looks for a trailing `Cond` on the header whose condition is a direct
/// `Cmp` over a local (the induction-variable candidate) and some bound
/// expression, normalizing a reversed comparison back to `local op bound`.
fn find_header_test(
    header: &crate::cfg::BasicBlock,
) -> Option<(CmpOp, crate::ir::LocalId, &Expr)> {
    if !matches!(header.branch, BranchKind::Cond { .. }) {
        return None;
    }
    let stmts = match &header.body {
        crate::ir::BlockBodyKind::Statements(s) => s,
        crate::ir::BlockBodyKind::Linear { .. } => return None,
    };
    for stmt in stmts.iter().rev() {
        if let StmtKind::Expr(e) = &stmt.kind {
            if let ExprKind::Cmp(op, a, b) = &e.kind {
                if let ExprKind::LocalRead(l) = &a.kind {
                    return Some((*op, *l, b));
                }
                if let ExprKind::LocalRead(l) = &b.kind {
                    return Some((op.reversed(), *l, a));
                }
            }
        }
    }
    None
}

fn classify_bound(
    compiler: &Compiler,
    body: &FxHashSet<BlockId>,
    expr: &Expr,
) -> Option<BoundSource> {
    match &expr.kind {
        ExprKind::ConstInt(v) => Some(BoundSource::Const(*v)),
        ExprKind::LocalRead(l) => {
            if single_def_count(compiler, body, *l) == 0 {
                Some(BoundSource::InvariantLocal(*l))
            } else {
                None
            }
        }
        ExprKind::Length(inner) => match &inner.kind {
            ExprKind::LocalRead(l) if single_def_count(compiler, body, *l) == 0 => {
                Some(BoundSource::InvariantArrayLength(*l))
            }
            _ => None,
        },
        _ => None,
    }
}

/// Counts assignments to `local` across every statement in `body`'s blocks.
fn single_def_count(compiler: &Compiler, body: &FxHashSet<BlockId>, local: crate::ir::LocalId) -> usize {
    let mut count = 0;
    for &b in body {
        if let crate::ir::BlockBodyKind::Statements(stmts) = &compiler.block(b).body {
            for s in stmts {
                if let StmtKind::Assign { dst, .. } = &s.kind {
                    if *dst == local {
                        count += 1;
                    }
                }
            }
        }
    }
    count
}

/// Finds `iv = iv +/- const` within the loop body and returns the signed
/// stride plus the block it occurs in.
fn find_stride_update(
    compiler: &Compiler,
    body: &FxHashSet<BlockId>,
    iv: crate::ir::LocalId,
) -> Option<(i64, BlockId)> {
    for &b in body {
        if let crate::ir::BlockBodyKind::Statements(stmts) = &compiler.block(b).body {
            for s in stmts {
                if let StmtKind::Assign { dst, src } = &s.kind {
                    if *dst != iv {
                        continue;
                    }
                    if let ExprKind::BinArith(op, lhs, rhs) = &src.kind {
                        let (base, delta) = match (&lhs.kind, &rhs.kind) {
                            (ExprKind::LocalRead(l), ExprKind::ConstInt(c)) if *l == iv => (l, *c),
                            (ExprKind::ConstInt(c), ExprKind::LocalRead(l))
                                if *l == iv && matches!(op, ArithOp::Add) =>
                            {
                                (l, *c)
                            }
                            _ => continue,
                        };
                        let _ = base;
                        let stride = match op {
                            ArithOp::Add => delta,
                            ArithOp::Sub => -delta,
                        };
                        return Some((stride, b));
                    }
                }
            }
        }
    }
    None
}

/// Finds `iv = init` in the preheader, classified the same way a loop
/// bound is (constant or invariant local reference per `spec.md` §4.5;
/// an invariant array length is not a valid `init` source).
fn find_init(compiler: &Compiler, preheader: BlockId, iv: crate::ir::LocalId) -> Option<BoundSource> {
    let stmts = match &compiler.block(preheader).body {
        crate::ir::BlockBodyKind::Statements(s) => s,
        crate::ir::BlockBodyKind::Linear { .. } => return None,
    };
    for s in stmts.iter().rev() {
        if let StmtKind::Assign { dst, src } = &s.kind {
            if *dst != iv {
                continue;
            }
            return match &src.kind {
                ExprKind::ConstInt(v) => Some(BoundSource::Const(*v)),
                ExprKind::LocalRead(l) => Some(BoundSource::InvariantLocal(*l)),
                _ => None,
            };
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::{BasicBlock, BlockFlags};
    use crate::config::CompilerOptions;
    use crate::ir::{BlockBodyKind, LocalFlags, LocalType, Stmt};
    use crate::runtime::MockRuntime;
    use smallvec::SmallVec;
    use std::sync::Arc;

    fn mk_block(branch: BranchKind) -> BasicBlock {
        BasicBlock {
            id: BlockId(0),
            ordinal: 0,
            code_offs: 0,
            code_offs_end: 0,
            flags: BlockFlags::IMPORTED,
            branch,
            weight: 1.0,
            try_region: None,
            handler_region: None,
            catch_type: None,
            body: BlockBodyKind::Statements(vec![]),
            lexical_prev: None,
            lexical_next: None,
            pred_edges: SmallVec::new(),
            loop_num: None,
            has_profile_weight: false,
        }
    }

    /// preheader -[ALWAYS]-> header -[COND]-> { body -[ALWAYS]-> header , exit }
    fn simple_counted_loop() -> (Compiler, BlockId) {
        let mut c = Compiler::new(CompilerOptions::default(), Arc::new(MockRuntime::default()));
        let iv = c.locals.push(LocalType::Int, LocalFlags::default());

        let preheader = c.alloc_block(mk_block(BranchKind::Always(BlockId(0))));
        let header = c.alloc_block(mk_block(BranchKind::Cond {
            false_target: BlockId(0),
            true_target: BlockId(0),
        }));
        let body = c.alloc_block(mk_block(BranchKind::Always(BlockId(0))));
        let exit = c.alloc_block(mk_block(BranchKind::Return));

        c.block_mut(preheader).branch = BranchKind::Always(header);
        c.block_mut(header).branch = BranchKind::Cond { false_target: exit, true_target: body };
        c.block_mut(body).branch = BranchKind::Always(header);

        c.add_edge(preheader, header);
        c.add_edge(header, exit);
        c.add_edge(header, body);
        c.add_edge(body, header);

        c.block_mut(preheader).body = BlockBodyKind::Statements(vec![Stmt {
            id: c.next_id(),
            block: preheader,
            kind: StmtKind::Assign {
                dst: iv,
                src: Expr::new(c.next_id(), ExprKind::ConstInt(0)),
            },
        }]);

        let limit = Expr::new(0, ExprKind::ConstInt(10));
        c.block_mut(header).body = BlockBodyKind::Statements(vec![Stmt {
            id: c.next_id(),
            block: header,
            kind: StmtKind::Expr(Expr::new(
                c.next_id(),
                ExprKind::Cmp(CmpOp::Lt, Box::new(Expr::new(0, ExprKind::LocalRead(iv))), Box::new(limit)),
            )),
        }]);

        c.block_mut(body).body = BlockBodyKind::Statements(vec![Stmt {
            id: c.next_id(),
            block: body,
            kind: StmtKind::Assign {
                dst: iv,
                src: Expr::new(
                    c.next_id(),
                    ExprKind::BinArith(
                        ArithOp::Add,
                        Box::new(Expr::new(0, ExprKind::LocalRead(iv))),
                        Box::new(Expr::new(0, ExprKind::ConstInt(1))),
                    ),
                ),
            },
        }]);

        (c, header)
    }

    #[test]
    fn discovers_single_natural_loop_with_canonical_preheader() {
        let (c, header) = simple_counted_loop();
        let dfs = crate::traversal::build_dfs(&c, |_| {}, |_| {}, |_, _| {});
        let doms = crate::traversal::build_dominators(&c, &dfs);
        let forest = discover_loops(&c, &dfs, &doms);

        assert_eq!(forest.len(), 1);
        let lp = forest.get(LoopId(0));
        assert_eq!(lp.header, header);
        assert!(lp.is_canonical());
        assert_eq!(lp.blocks.len(), 2);
    }

    #[test]
    fn fits_increasing_iteration_pattern() {
        let (c, _) = simple_counted_loop();
        let dfs = crate::traversal::build_dfs(&c, |_| {}, |_| {}, |_, _| {});
        let doms = crate::traversal::build_dominators(&c, &dfs);
        let forest = discover_loops(&c, &dfs, &doms);
        let lp = forest.get(LoopId(0));

        let info = lp.iteration.as_ref().expect("iteration info should be fitted");
        assert_eq!(info.stride, 1);
        assert_eq!(info.test_op, CmpOp::Lt);
        assert!(info.is_increasing());
        assert_eq!(info.limit, BoundSource::Const(10));
        assert_eq!(info.init, BoundSource::Const(0));
    }

    #[test]
    fn no_back_edge_means_no_loops() {
        let mut c = Compiler::new(CompilerOptions::default(), Arc::new(MockRuntime::default()));
        let a = c.alloc_block(mk_block(BranchKind::Always(BlockId(0))));
        let b = c.alloc_block(mk_block(BranchKind::Return));
        c.block_mut(a).branch = BranchKind::Always(b);
        c.add_edge(a, b);
        let dfs = crate::traversal::build_dfs(&c, |_| {}, |_| {}, |_, _| {});
        let doms = crate::traversal::build_dominators(&c, &dfs);
        let forest = discover_loops(&c, &dfs, &doms);
        assert!(forest.is_empty());
    }
}
