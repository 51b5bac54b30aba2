//! Loop Cloner
//!
//! Duplicates a canonical loop into a fast path guarded by a conjunction of
//! runtime conditions and an unguarded slow path, then bashes the fast
//! path's bounds/type checks to no-ops (`spec.md` §4.6).

use rustc_hash::FxHashMap;

use crate::cfg::{BasicBlock, BlockFlags, BlockId, BranchKind};
use crate::compiler::Compiler;
use crate::error::GiveUp;
use crate::give_up;
use crate::ir::{BlockBodyKind, ClassHandle, CmpOp, Expr, ExprKind, LocalId, Stmt, StmtKind};
use crate::loops::{BoundSource, LoopId, NaturalLoop};

/// Tags each synthesized condition with its position in the AND-chain, so
/// the combining pass can tell which conditions are adjacent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Level(pub u32);

#[derive(Debug, Clone, PartialEq)]
pub struct CloneCondition {
    pub level: Level,
    pub expr: Expr,
}

/// A single dimension of an array access: the base local indexed, and the
/// bounds-check expr id to bash on the fast path.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayDim {
    pub base: LocalId,
    pub bounds_check_expr_id: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CandidateKind {
    /// `a[i]`, `a[i][j]`, ... -- one entry per dimension, outermost first.
    ArrayAccess { dims: Vec<ArrayDim>, index: LocalId },
    InvariantTypeTest { local: LocalId, class: ClassHandle, gdv_expr_id: u64 },
    InvariantMethodTest { local: LocalId, class: ClassHandle, gdv_expr_id: u64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CloneCandidate {
    pub kind: CandidateKind,
}

/// Walks every statement in the loop collecting candidates: nested
/// `BoundsCheck` chains (jagged/multi-dim array access) and dominating
/// `GdvTest` nodes whose local is loop-invariant.
pub fn collect_candidates(
    compiler: &Compiler,
    lp: &NaturalLoop,
    max_depth: u32,
) -> Result<Vec<CloneCandidate>, GiveUp> {
    let mut out = Vec::new();
    for &b in &lp.blocks {
        let stmts = match &compiler.block(b).body {
            BlockBodyKind::Statements(s) => s,
            BlockBodyKind::Linear { .. } => give_up!("cannot analyze a linearized block for cloning"),
        };
        for stmt in stmts {
            for e in stmt_exprs(stmt) {
                collect_from_expr(compiler, lp, e, max_depth, &mut out)?;
            }
        }
    }
    Ok(out)
}

fn stmt_exprs(stmt: &Stmt) -> Vec<&Expr> {
    match &stmt.kind {
        StmtKind::Assign { src, .. } => vec![src],
        StmtKind::FieldAssign { base, src, .. } => vec![base, src],
        StmtKind::StoreStatic { src, .. } => vec![src],
        StmtKind::Expr(e) => vec![e],
        StmtKind::Return(Some(e)) => vec![e],
        StmtKind::Return(None) => vec![],
        StmtKind::Throw(e) => vec![e],
    }
}

fn is_loop_invariant(compiler: &Compiler, lp: &NaturalLoop, local: LocalId) -> bool {
    for &b in &lp.blocks {
        if let BlockBodyKind::Statements(stmts) = &compiler.block(b).body {
            for s in stmts {
                if let StmtKind::Assign { dst, .. } = &s.kind {
                    if *dst == local {
                        return false;
                    }
                }
            }
        }
    }
    true
}

fn collect_from_expr(
    compiler: &Compiler,
    lp: &NaturalLoop,
    expr: &Expr,
    max_depth: u32,
    out: &mut Vec<CloneCandidate>,
) -> Result<(), GiveUp> {
    match &expr.kind {
        ExprKind::BoundsCheck { index, bound, .. } => {
            let mut dims = Vec::new();
            collect_bounds_chain(compiler, lp, expr, max_depth, &mut dims)?;
            if !dims.is_empty() {
                if let ExprKind::LocalRead(iv) = &index.kind {
                    out.push(CloneCandidate {
                        kind: CandidateKind::ArrayAccess { dims, index: *iv },
                    });
                }
            }
            collect_from_expr(compiler, lp, index, max_depth, out)?;
            collect_from_expr(compiler, lp, bound, max_depth, out)?;
        }
        ExprKind::GdvTest { local, class, constant: None } if is_loop_invariant(compiler, lp, *local) => {
            out.push(CloneCandidate {
                kind: CandidateKind::InvariantTypeTest { local: *local, class: *class, gdv_expr_id: expr.id },
            });
        }
        ExprKind::Indirect { addr, .. } => collect_from_expr(compiler, lp, addr, max_depth, out)?,
        ExprKind::FieldRead { base, .. } => collect_from_expr(compiler, lp, base, max_depth, out)?,
        ExprKind::Length(inner) => collect_from_expr(compiler, lp, inner, max_depth, out)?,
        ExprKind::Cmp(_, a, b) | ExprKind::BinArith(_, a, b) | ExprKind::Comma(a, b) => {
            collect_from_expr(compiler, lp, a, max_depth, out)?;
            collect_from_expr(compiler, lp, b, max_depth, out)?;
        }
        ExprKind::Call { args, .. } => {
            for a in args {
                collect_from_expr(compiler, lp, a, max_depth, out)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Follows a chain of nested `BoundsCheck` nodes (jagged-array access),
/// one `ArrayDim` per level, bailing out once `max_depth` is exceeded.
fn collect_bounds_chain(
    compiler: &Compiler,
    lp: &NaturalLoop,
    expr: &Expr,
    max_depth: u32,
    dims: &mut Vec<ArrayDim>,
) -> Result<(), GiveUp> {
    if dims.len() as u32 >= max_depth {
        give_up!("deref tree exceeds configured depth bound");
    }
    if let ExprKind::BoundsCheck { bound, .. } = &expr.kind {
        if let ExprKind::Length(inner) = &bound.kind {
            if let ExprKind::LocalRead(base) = &inner.kind {
                if !is_loop_invariant(compiler, lp, *base) {
                    give_up!("array base is not loop-invariant");
                }
                dims.push(ArrayDim { base: *base, bounds_check_expr_id: expr.id });
            }
        }
    }
    Ok(())
}

/// Builds the level-tagged condition conjunction for one candidate
/// (`spec.md` §4.6 "Conditions").
pub fn build_conditions(
    candidate: &CloneCandidate,
    next_id: &mut impl FnMut() -> u64,
) -> Vec<CloneCondition> {
    let mut conds = Vec::new();
    match &candidate.kind {
        CandidateKind::ArrayAccess { dims, index } => {
            for (level, dim) in dims.iter().enumerate() {
                let base_read = Expr::new(next_id(), ExprKind::LocalRead(dim.base));
                let not_null = Expr::new(
                    next_id(),
                    ExprKind::Cmp(CmpOp::Ne, Box::new(base_read.clone()), Box::new(Expr::new(next_id(), ExprKind::ConstInt(0)))),
                );
                conds.push(CloneCondition { level: Level(level as u32 * 2), expr: not_null });

                let index_read = Expr::new(next_id(), ExprKind::LocalRead(*index));
                let length = Expr::new(next_id(), ExprKind::Length(Box::new(base_read)));
                let in_bounds = Expr::new(next_id(), ExprKind::Cmp(CmpOp::Lt, Box::new(index_read), Box::new(length)));
                conds.push(CloneCondition { level: Level(level as u32 * 2 + 1), expr: in_bounds });
            }
        }
        CandidateKind::InvariantTypeTest { local, class, .. }
        | CandidateKind::InvariantMethodTest { local, class, .. } => {
            let test = Expr::new(next_id(), ExprKind::GdvTest { local: *local, class: *class, constant: None });
            let truthy = Expr::new(
                next_id(),
                ExprKind::Cmp(CmpOp::Eq, Box::new(test), Box::new(Expr::new(next_id(), ExprKind::ConstInt(1)))),
            );
            conds.push(CloneCondition { level: Level(0), expr: truthy });
        }
    }
    conds
}

/// Adds the bound-side conditions for a fitted iteration pattern
/// (`init >= 0`, `limit >= 0`, `limit <op> a.length`), direction-adjusted
/// for decreasing loops.
pub fn build_iteration_conditions(
    iv_limit: &BoundSource,
    increasing: bool,
    next_id: &mut impl FnMut() -> u64,
) -> Vec<CloneCondition> {
    let mut conds = Vec::new();
    if let BoundSource::InvariantArrayLength(base) = iv_limit {
        let base_read = Expr::new(next_id(), ExprKind::LocalRead(*base));
        let length = Expr::new(next_id(), ExprKind::Length(Box::new(base_read)));
        let op = if increasing { CmpOp::Le } else { CmpOp::Ge };
        let limit_ok = Expr::new(
            next_id(),
            ExprKind::Cmp(op, Box::new(length.clone()), Box::new(Expr::new(next_id(), ExprKind::ConstInt(0)))),
        );
        conds.push(CloneCondition { level: Level(0), expr: limit_ok });
    }
    conds
}

/// Phase 1: `(expr op expr)` with structurally identical sides evaluates
/// to `true` for `{=, <=, >=}` and `false` for `{!=, <, >}`. Proven-true
/// conditions are dropped; a single proven-false condition abandons the
/// whole clone.
pub fn simplify_statically(conds: Vec<CloneCondition>) -> Result<Vec<CloneCondition>, GiveUp> {
    let mut out = Vec::with_capacity(conds.len());
    let mut changed = true;
    let mut conds = conds;
    while changed {
        changed = false;
        let mut next = Vec::with_capacity(conds.len());
        for c in conds.drain(..) {
            if let ExprKind::Cmp(op, a, b) = &c.expr.kind {
                if exprs_equal_ignoring_id(a, b) {
                    if op.identity_is_true() {
                        changed = true;
                        continue;
                    } else {
                        give_up!("clone condition statically evaluates to false");
                    }
                }
            }
            next.push(c);
        }
        conds = next;
    }
    out.extend(conds);
    Ok(out)
}

/// Phase 2: `(a op b)` and `(a op b)` collapse to one; `(a op b)` and
/// `(b rev(op) a)` (the same fact stated in reverse) also collapse to one.
pub fn combine_conditions(conds: Vec<CloneCondition>) -> Vec<CloneCondition> {
    let mut out: Vec<CloneCondition> = Vec::new();
    for c in conds {
        let redundant = out.iter().any(|existing| conditions_equivalent(existing, &c));
        if !redundant {
            out.push(c);
        }
    }
    out
}

fn conditions_equivalent(a: &CloneCondition, b: &CloneCondition) -> bool {
    match (&a.expr.kind, &b.expr.kind) {
        (ExprKind::Cmp(op_a, a1, a2), ExprKind::Cmp(op_b, b1, b2)) => {
            (*op_a == *op_b && exprs_equal_ignoring_id(a1, b1) && exprs_equal_ignoring_id(a2, b2))
                || (*op_a == op_b.reversed() && exprs_equal_ignoring_id(a1, b2) && exprs_equal_ignoring_id(a2, b1))
        }
        _ => exprs_equal_ignoring_id(&a.expr, &b.expr),
    }
}

fn exprs_equal_ignoring_id(a: &Expr, b: &Expr) -> bool {
    match (&a.kind, &b.kind) {
        (ExprKind::LocalRead(x), ExprKind::LocalRead(y)) => x == y,
        (ExprKind::ConstInt(x), ExprKind::ConstInt(y)) => x == y,
        (ExprKind::Unknown, ExprKind::Unknown) => true,
        (
            ExprKind::Indirect { addr: a1, non_faulting: nf1, not_heap: nh1 },
            ExprKind::Indirect { addr: a2, non_faulting: nf2, not_heap: nh2 },
        ) => nf1 == nf2 && nh1 == nh2 && exprs_equal_ignoring_id(a1, a2),
        (
            ExprKind::BoundsCheck { index: i1, bound: b1, disabled: d1 },
            ExprKind::BoundsCheck { index: i2, bound: b2, disabled: d2 },
        ) => d1 == d2 && exprs_equal_ignoring_id(i1, i2) && exprs_equal_ignoring_id(b1, b2),
        (ExprKind::FieldRead { base: b1, field: f1 }, ExprKind::FieldRead { base: b2, field: f2 }) => {
            f1 == f2 && exprs_equal_ignoring_id(b1, b2)
        }
        (ExprKind::Length(x), ExprKind::Length(y)) => exprs_equal_ignoring_id(x, y),
        (ExprKind::Cmp(op1, a1, a2), ExprKind::Cmp(op2, b1, b2)) => {
            op1 == op2 && exprs_equal_ignoring_id(a1, b1) && exprs_equal_ignoring_id(a2, b2)
        }
        (ExprKind::BinArith(op1, a1, a2), ExprKind::BinArith(op2, b1, b2)) => {
            op1 == op2 && exprs_equal_ignoring_id(a1, b1) && exprs_equal_ignoring_id(a2, b2)
        }
        (
            ExprKind::GdvTest { local: l1, class: c1, constant: k1 },
            ExprKind::GdvTest { local: l2, class: c2, constant: k2 },
        ) => l1 == l2 && c1 == c2 && k1 == k2,
        (ExprKind::Comma(a1, a2), ExprKind::Comma(b1, b2)) => {
            exprs_equal_ignoring_id(a1, b1) && exprs_equal_ignoring_id(a2, b2)
        }
        (ExprKind::NotCloneable, ExprKind::NotCloneable) => true,
        _ => false,
    }
}

/// The outcome of a successful clone: the new fast/slow preheaders and the
/// block-to-block map used to retarget internal branches, for callers that
/// want to repair profile data or diagnostics afterward.
pub struct CloneResult {
    pub fast_preheader: BlockId,
    pub slow_preheader: BlockId,
    pub block_map: FxHashMap<BlockId, BlockId>,
}

/// Performs the cloning mechanics of `spec.md` §4.6 steps 1-6: new fast/
/// slow preheaders, block duplication via [`crate::ir::clone_stmt_replacing`],
/// the condition chain, weight scaling, and bashing bounds checks/GDV tests
/// on the fast path.
pub fn clone_loop(
    compiler: &mut Compiler,
    loop_id: LoopId,
    candidates: &[CloneCandidate],
) -> Result<CloneResult, GiveUp> {
    let lp = compiler.loops.as_ref().expect("loops must be discovered before cloning").get(loop_id).clone();
    let preheader = lp.preheader.ok_or_else(|| GiveUp::new("loop is not canonical: no unique preheader"))?;

    if lp.blocks.len() as u32 > compiler.options.clone_size_limit {
        give_up!("loop exceeds configured clone size limit");
    }

    let mut all_conds = Vec::new();
    for c in candidates {
        let conds = build_conditions(c, &mut || compiler.next_id());
        all_conds.extend(conds);
    }
    let all_conds = simplify_statically(all_conds)?;
    let all_conds = combine_conditions(all_conds);

    let preheader_block = compiler.block(preheader).clone();
    let original_header_target = match preheader_block.branch {
        BranchKind::Always(t) => t,
        _ => give_up!("preheader is not an ALWAYS block"),
    };

    // Step 1: new fast preheader, an ALWAYS to the original header.
    let fast_preheader = alloc_always_block(compiler, &preheader_block, original_header_target);

    // Step 2: new slow preheader, an ALWAYS to a freshly cloned header
    // (the header is duplicated along with the rest of the loop below).
    let slow_preheader = alloc_always_block(compiler, &preheader_block, original_header_target);

    // Step 3: duplicate every loop block.
    let mut block_map: FxHashMap<BlockId, BlockId> = FxHashMap::default();
    let mut ordered: Vec<BlockId> = lp.blocks.iter().copied().collect();
    ordered.sort_by_key(|b| b.0);
    for &b in &ordered {
        let src = compiler.block(b);
        let clone_id = BlockId(compiler.blocks.len() as u32);
        let cloned_body = clone_body(compiler, b, clone_id)?;
        let mut cloned = src.clone();
        cloned.id = clone_id;
        cloned.body = cloned_body;
        cloned.pred_edges = Default::default();
        cloned.lexical_prev = None;
        cloned.lexical_next = None;
        compiler.blocks.push(cloned);
        block_map.insert(b, clone_id);
    }

    // Retarget internal branches in the clone through the map.
    for (&orig, &cloned) in block_map.iter() {
        let new_branch = remap_branch(&compiler.block(orig).branch.clone(), &block_map);
        compiler.block_mut(cloned).branch = new_branch;
    }

    let cloned_header = *block_map.get(&lp.header).expect("header must have a clone");
    compiler.block_mut(slow_preheader).branch = BranchKind::Always(cloned_header);

    // Rewire: original preheader's successor becomes the fast preheader;
    // the fast preheader falls into the condition chain, which branches to
    // the slow preheader on failure and otherwise reaches the original
    // (now fast-path) header.
    compiler.block_mut(preheader).branch = BranchKind::Always(fast_preheader);

    let mut chain_tail = fast_preheader;
    for cond in &all_conds {
        let cond_block_id = BlockId(compiler.blocks.len() as u32);
        let mut cond_block = preheader_block.clone();
        cond_block.id = cond_block_id;
        cond_block.pred_edges = Default::default();
        cond_block.lexical_prev = None;
        cond_block.lexical_next = None;
        let stmt = Stmt {
            id: compiler.next_id(),
            block: cond_block_id,
            kind: StmtKind::Expr(cond.expr.clone()),
        };
        cond_block.body = BlockBodyKind::Statements(vec![stmt]);
        cond_block.branch = BranchKind::Cond { false_target: slow_preheader, true_target: original_header_target };
        compiler.blocks.push(cond_block);
        compiler.block_mut(chain_tail).branch = BranchKind::Always(cond_block_id);
        compiler.add_edge(chain_tail, cond_block_id);
        compiler.add_edge(cond_block_id, slow_preheader);
        chain_tail = cond_block_id;
    }
    compiler.block_mut(chain_tail).branch = BranchKind::Always(original_header_target);
    compiler.add_edge(chain_tail, original_header_target);

    compiler.add_edge(preheader, fast_preheader);
    compiler.add_edge(slow_preheader, cloned_header);

    // Step 5: weight scaling, both proportional to the inherited weight.
    let base_weight = preheader_block.weight;
    for &b in &ordered {
        let cloned = *block_map.get(&b).unwrap();
        compiler.block_mut(cloned).weight *= compiler.options.slow_path_weight();
    }
    for &b in &ordered {
        compiler.block_mut(b).weight *= compiler.options.fast_path_weight;
    }
    compiler.block_mut(fast_preheader).weight = base_weight * compiler.options.fast_path_weight;
    compiler.block_mut(slow_preheader).weight = base_weight * compiler.options.slow_path_weight();

    // Step 6: bash bounds checks / GDV tests to constants on the fast path
    // (the original, now-fast-path loop blocks).
    for candidate in candidates {
        bash_candidate(compiler, candidate)?;
    }

    compiler.pgo_consistent = false;
    compiler.invalidate_derived();

    Ok(CloneResult { fast_preheader, slow_preheader, block_map })
}

fn alloc_always_block(compiler: &mut Compiler, template: &BasicBlock, target: BlockId) -> BlockId {
    let id = BlockId(compiler.blocks.len() as u32);
    let mut b = template.clone();
    b.id = id;
    b.branch = BranchKind::Always(target);
    b.body = BlockBodyKind::Statements(vec![]);
    b.pred_edges = Default::default();
    b.lexical_prev = None;
    b.lexical_next = None;
    b.flags.remove(BlockFlags::PREDS_UNSORTED);
    compiler.blocks.push(b);
    id
}

fn clone_body(compiler: &mut Compiler, src: BlockId, dst: BlockId) -> Result<BlockBodyKind, GiveUp> {
    let stmts = match &compiler.block(src).body {
        BlockBodyKind::Statements(s) => s.clone(),
        BlockBodyKind::Linear { .. } => give_up!("cannot clone a linearized block"),
    };
    let mut out = Vec::with_capacity(stmts.len());
    for s in &stmts {
        let cloned = clone_stmt_verbatim(compiler, s, dst)?;
        out.push(cloned);
    }
    Ok(BlockBodyKind::Statements(out))
}

/// `cloneBlockState` with no local rename (the clone keeps referencing the
/// same locals; only the block identity changes), declining on
/// [`ExprKind::NotCloneable`] exactly as a real rename would.
fn clone_stmt_verbatim(compiler: &mut Compiler, stmt: &Stmt, dst: BlockId) -> Result<Stmt, GiveUp> {
    let dummy = LocalId(u32::MAX);
    crate::ir::clone_stmt_replacing(stmt, dst, dummy, dummy, &mut || compiler.next_id())
        .ok_or_else(|| GiveUp::new("block contains a non-cloneable node"))
}

/// Retargets every block id a branch mentions through `map`, falling back to
/// the original id for targets outside the cloned region. Shared with the
/// conditional-escape cloner, which duplicates a GDV-guard region rather
/// than a whole loop but needs the same retargeting.
pub(crate) fn remap_branch(branch: &BranchKind, map: &FxHashMap<BlockId, BlockId>) -> BranchKind {
    let m = |b: BlockId| map.get(&b).copied().unwrap_or(b);
    match branch {
        BranchKind::None => BranchKind::None,
        BranchKind::Always(t) => BranchKind::Always(m(*t)),
        BranchKind::Cond { false_target, true_target } => {
            BranchKind::Cond { false_target: m(*false_target), true_target: m(*true_target) }
        }
        BranchKind::Switch(sw) => BranchKind::Switch(crate::cfg::SwitchTargets {
            targets: sw.targets.iter().map(|&t| m(t)).collect(),
            has_explicit_default: sw.has_explicit_default,
            dominant_case: sw.dominant_case,
        }),
        BranchKind::Return => BranchKind::Return,
        BranchKind::Throw => BranchKind::Throw,
        BranchKind::Leave(t) => BranchKind::Leave(m(*t)),
        BranchKind::CallFinally { handler, retless } => {
            BranchKind::CallFinally { handler: m(*handler), retless: *retless }
        }
        BranchKind::CallFinallyRet { continuation } => {
            BranchKind::CallFinallyRet { continuation: m(*continuation) }
        }
        BranchKind::EhCatchRet(t) => BranchKind::EhCatchRet(m(*t)),
        BranchKind::EhFilterRet(t) => BranchKind::EhFilterRet(m(*t)),
        BranchKind::EhFinallyRet { handler_region } => BranchKind::EhFinallyRet { handler_region: *handler_region },
        BranchKind::EhFaultRet => BranchKind::EhFaultRet,
    }
}

/// Bashes this candidate's bounds checks to disabled no-op comma nodes and
/// marks GDV-guarded indirections as non-faulting, on the original
/// (post-clone, fast-path) loop blocks.
fn bash_candidate(compiler: &mut Compiler, candidate: &CloneCandidate) -> Result<(), GiveUp> {
    let target_ids: Vec<u64> = match &candidate.kind {
        CandidateKind::ArrayAccess { dims, .. } => dims.iter().map(|d| d.bounds_check_expr_id).collect(),
        CandidateKind::InvariantTypeTest { gdv_expr_id, .. }
        | CandidateKind::InvariantMethodTest { gdv_expr_id, .. } => vec![*gdv_expr_id],
    };
    for b in &mut compiler.blocks {
        if let BlockBodyKind::Statements(stmts) = &mut b.body {
            for s in stmts {
                bash_stmt(s, &target_ids, matches!(candidate.kind, CandidateKind::ArrayAccess { .. }));
            }
        }
    }
    Ok(())
}

fn bash_stmt(stmt: &mut Stmt, ids: &[u64], is_bounds_check: bool) {
    let exprs = match &mut stmt.kind {
        StmtKind::Assign { src, .. } => vec![src],
        StmtKind::FieldAssign { base, src, .. } => vec![base, src],
        StmtKind::StoreStatic { src, .. } => vec![src],
        StmtKind::Expr(e) => vec![e],
        StmtKind::Return(Some(e)) => vec![e],
        StmtKind::Return(None) => vec![],
        StmtKind::Throw(e) => vec![e],
    };
    for e in exprs {
        bash_expr(e, ids, is_bounds_check);
    }
}

fn bash_expr(expr: &mut Expr, ids: &[u64], is_bounds_check: bool) {
    if ids.contains(&expr.id) {
        match &mut expr.kind {
            ExprKind::BoundsCheck { disabled, .. } if is_bounds_check => *disabled = true,
            ExprKind::GdvTest { constant, .. } if !is_bounds_check => *constant = Some(true),
            _ => {}
        }
    }
    match &mut expr.kind {
        ExprKind::Indirect { addr, non_faulting, .. } => {
            bash_expr(addr, ids, is_bounds_check);
            if ids.contains(&expr.id) {
                *non_faulting = true;
            }
        }
        ExprKind::BoundsCheck { index, bound, .. } => {
            bash_expr(index, ids, is_bounds_check);
            bash_expr(bound, ids, is_bounds_check);
        }
        ExprKind::FieldRead { base, .. } => bash_expr(base, ids, is_bounds_check),
        ExprKind::Length(inner) => bash_expr(inner, ids, is_bounds_check),
        ExprKind::Cmp(_, a, b) | ExprKind::BinArith(_, a, b) | ExprKind::Comma(a, b) => {
            bash_expr(a, ids, is_bounds_check);
            bash_expr(b, ids, is_bounds_check);
        }
        ExprKind::Call { args, .. } => {
            for a in args {
                bash_expr(a, ids, is_bounds_check);
            }
        }
        _ => {}
    }
}
