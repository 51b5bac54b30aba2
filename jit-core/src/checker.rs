//! Flowgraph Consistency Checker
//!
//! A debug-only pass, one method per numbered check in `spec.md` §4.4, each
//! returning the first violation as `Err(CompilerError::Invariant)` instead
//! of aborting the host process -- there is no free-standing assert that
//! can abort a Rust *library*, so the pass driver treats this `Err` as
//! fatal per `spec.md` §7.

use std::collections::HashSet;

use crate::cfg::{self, BlockId, BranchKind};
use crate::compiler::Compiler;
use crate::error::CompilerError;
use crate::ir::{Expr, ExprKind, Stmt, StmtKind};

fn invariant(pass: &'static str, invariant: &'static str, block: Option<BlockId>, detail: impl Into<String>) -> CompilerError {
    CompilerError::Invariant { pass, invariant, block, detail: detail.into() }
}

/// Runs every check in order, short-circuiting on the first failure, as
/// `spec.md` §4.4 prescribes ("each reporting at the first violation").
pub struct FlowgraphChecker<'a> {
    compiler: &'a Compiler,
}

impl<'a> FlowgraphChecker<'a> {
    pub fn new(compiler: &'a Compiler) -> Self {
        Self { compiler }
    }

    pub fn check_all(&self) -> Result<(), CompilerError> {
        self.check_reachability()?;
        self.check_emptiness()?;
        self.check_import_completeness()?;
        self.check_compactability()?;
        self.check_conditional_redundancy()?;
        self.check_call_finally_pairing()?;
        self.check_predecessor_consistency()?;
        self.check_eh_boundary()?;
        self.check_ssa_sanity()?;
        self.check_tree_structural()?;
        self.check_uniqueness()?;
        Ok(())
    }

    /// 1. Every block has positive predecessor count, or is flagged
    /// do-not-remove.
    fn check_reachability(&self) -> Result<(), CompilerError> {
        for b in &self.compiler.blocks {
            if b.pred_edges.is_empty() && !b.do_not_remove() {
                return Err(invariant(
                    "checker",
                    "reachability",
                    Some(b.id),
                    "block has zero predecessors and is not DO_NOT_REMOVE",
                ));
            }
        }
        Ok(())
    }

    /// 2. Empty blocks must have a kind from the allowed-empty set, or be
    /// do-not-remove.
    fn check_emptiness(&self) -> Result<(), CompilerError> {
        for b in &self.compiler.blocks {
            if b.is_empty_of_code() && !cfg::allowed_empty(b) && !b.do_not_remove() {
                return Err(invariant(
                    "checker",
                    "emptiness",
                    Some(b.id),
                    format!("empty block has disallowed kind {:?}", b.branch),
                ));
            }
        }
        Ok(())
    }

    /// 3. Every non-internal block has its IMPORTED flag set. "Internal"
    /// here means a block created by a later pass (loop cloning, escape
    /// rewriting) rather than the importer; this crate has no separate
    /// marker for that distinction yet, so the check applies to every
    /// block, matching a freshly-imported method body.
    fn check_import_completeness(&self) -> Result<(), CompilerError> {
        for b in &self.compiler.blocks {
            if !b.flags.contains(crate::cfg::BlockFlags::IMPORTED) {
                return Err(invariant(
                    "checker",
                    "import-completeness",
                    Some(b.id),
                    "block missing IMPORTED flag",
                ));
            }
        }
        Ok(())
    }

    /// 4. No `A -ALWAYS-> B` where `B`'s only predecessor is `A` (should
    /// have been merged).
    fn check_compactability(&self) -> Result<(), CompilerError> {
        for b in &self.compiler.blocks {
            if let BranchKind::Always(target) = b.branch {
                let target_block = self.compiler.block(target);
                if target_block.pred_edges.len() == 1 {
                    if let Some(only_pred) = self.compiler.predecessor_edges(target).next() {
                        if only_pred.from == b.id {
                            return Err(invariant(
                                "checker",
                                "compactability",
                                Some(b.id),
                                format!("block {:?} should have been merged into {:?}", target, b.id),
                            ));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// 5. No `COND` block whose two targets are the same (that should have
    /// collapsed to an `ALWAYS`).
    fn check_conditional_redundancy(&self) -> Result<(), CompilerError> {
        for b in &self.compiler.blocks {
            if let BranchKind::Cond { false_target, true_target } = b.branch {
                if false_target == true_target {
                    return Err(invariant(
                        "checker",
                        "conditional-redundancy",
                        Some(b.id),
                        "COND block has identical true/false targets",
                    ));
                }
            }
        }
        Ok(())
    }

    /// 6. Every non-retless `CALLFINALLY` is followed by an empty
    /// continuation block (`CALLFINALLYRET`, or legacy `ALWAYS` with
    /// `KEEP`).
    fn check_call_finally_pairing(&self) -> Result<(), CompilerError> {
        for b in &self.compiler.blocks {
            if let BranchKind::CallFinally { retless, .. } = b.branch {
                if retless {
                    continue;
                }
                let cont = b.lexical_next.ok_or_else(|| {
                    invariant(
                        "checker",
                        "call-finally-pairing",
                        Some(b.id),
                        "non-retless CALLFINALLY has no lexical successor",
                    )
                })?;
                let cont_block = self.compiler.block(cont);
                let is_paired = matches!(cont_block.branch, BranchKind::CallFinallyRet { .. })
                    || (matches!(cont_block.branch, BranchKind::Always(_))
                        && cont_block.flags.contains(crate::cfg::BlockFlags::KEEP));
                if !is_paired || !cont_block.is_empty_of_code() {
                    return Err(invariant(
                        "checker",
                        "call-finally-pairing",
                        Some(b.id),
                        "CALLFINALLY not followed by a paired empty continuation block",
                    ));
                }
            }
        }
        Ok(())
    }

    /// 7. For every predecessor edge `P -> B`, `P` lists `B` among its
    /// successors per its kind.
    fn check_predecessor_consistency(&self) -> Result<(), CompilerError> {
        for b in &self.compiler.blocks {
            for edge in self.compiler.predecessor_edges(b.id) {
                let p = edge.from;
                let succs = self.compiler.successors(p);
                if !succs.contains(&b.id) {
                    return Err(invariant(
                        "checker",
                        "predecessor-consistency",
                        Some(b.id),
                        format!("predecessor {:?} does not list {:?} among its successors", p, b.id),
                    ));
                }
            }
        }
        Ok(())
    }

    /// 8. EH boundary. Branches into the middle of a try region must come
    /// from within the same try, its catch handler, or a `CALLFINALLYRET`
    /// paired with an `EHFINALLYRET` in this try's finally; entries into a
    /// handler are likewise restricted.
    fn check_eh_boundary(&self) -> Result<(), CompilerError> {
        for b in &self.compiler.blocks {
            let is_region_entry_point = b.try_region.is_some() || b.handler_region.is_some();
            if !is_region_entry_point {
                continue;
            }
            for edge in self.compiler.predecessor_edges(b.id) {
                let p = self.compiler.block(edge.from);
                if let Some(try_region) = b.try_region {
                    if b.try_region != p.try_region {
                        let from_same_handler = p.handler_region == Some(try_region);
                        let from_finally_ret = matches!(p.branch, BranchKind::CallFinallyRet { .. })
                            && p.handler_region.is_some();
                        if !from_same_handler && !from_finally_ret {
                            return Err(invariant(
                                "checker",
                                "eh-boundary",
                                Some(b.id),
                                format!("branch into try region {:?} from outside an allowed origin", try_region),
                            ));
                        }
                    }
                }
                if let Some(handler_region) = b.handler_region {
                    if p.handler_region != Some(handler_region) {
                        let allowed = matches!(
                            p.branch,
                            BranchKind::EhFinallyRet { .. } | BranchKind::EhFilterRet(_)
                        ) || matches!(p.branch, BranchKind::CallFinally { handler, .. } if handler == b.id);
                        if !allowed {
                            return Err(invariant(
                                "checker",
                                "eh-boundary",
                                Some(b.id),
                                format!("branch into handler region {:?} from a disallowed origin", handler_region),
                            ));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// 9. SSA sanity, only meaningful once an SSA build has run.
    fn check_ssa_sanity(&self) -> Result<(), CompilerError> {
        if let Some(ssa) = &self.compiler.ssa {
            let dfs = self.compiler.dfs.as_ref().ok_or_else(|| {
                invariant("checker", "ssa-sanity", None, "SSA is valid but DFS has not been built")
            })?;
            ssa.validate(self.compiler, dfs)?;
            for local in self.compiler.locals.iter() {
                if !local.is_tracked() && !ssa.ssa_numbers(local.id).is_empty() {
                    return Err(invariant(
                        "checker",
                        "ssa-sanity",
                        None,
                        format!("untracked local {:?} carries SSA numbers", local.id),
                    ));
                }
            }
        }
        Ok(())
    }

    /// 10. Tree structural. This crate stores a block's statements as a
    /// `Vec` rather than a hand-linked list, so the structural invariant
    /// that survives the translation is: every statement records the
    /// block it actually lives in.
    fn check_tree_structural(&self) -> Result<(), CompilerError> {
        for b in &self.compiler.blocks {
            if let crate::ir::BlockBodyKind::Statements(stmts) = &b.body {
                for s in stmts {
                    if s.block != b.id {
                        return Err(invariant(
                            "checker",
                            "tree-structural",
                            Some(b.id),
                            format!("statement {} claims block {:?} but lives in {:?}", s.id, s.block, b.id),
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    /// 11. Every IR node has a globally unique id (P5).
    fn check_uniqueness(&self) -> Result<(), CompilerError> {
        let mut seen: HashSet<u64> = HashSet::new();
        for b in &self.compiler.blocks {
            if let crate::ir::BlockBodyKind::Statements(stmts) = &b.body {
                for s in stmts {
                    if !seen.insert(s.id) {
                        return Err(invariant(
                            "checker",
                            "uniqueness",
                            Some(b.id),
                            format!("duplicate statement id {}", s.id),
                        ));
                    }
                    check_expr_ids(s, &mut seen)?;
                }
            }
        }
        Ok(())
    }
}

fn check_expr_ids(stmt: &Stmt, seen: &mut HashSet<u64>) -> Result<(), CompilerError> {
    let exprs: Vec<&Expr> = match &stmt.kind {
        StmtKind::Assign { src, .. } => vec![src],
        StmtKind::FieldAssign { base, src, .. } => vec![base, src],
        StmtKind::StoreStatic { src, .. } => vec![src],
        StmtKind::Expr(e) => vec![e],
        StmtKind::Return(Some(e)) => vec![e],
        StmtKind::Return(None) => vec![],
        StmtKind::Throw(e) => vec![e],
    };
    for e in exprs {
        check_expr_ids_rec(e, seen, stmt.block)?;
    }
    Ok(())
}

fn check_expr_ids_rec(expr: &Expr, seen: &mut HashSet<u64>, block: BlockId) -> Result<(), CompilerError> {
    if !seen.insert(expr.id) {
        return Err(invariant(
            "checker",
            "uniqueness",
            Some(block),
            format!("duplicate expr id {}", expr.id),
        ));
    }
    let children: Vec<&Expr> = match &expr.kind {
        ExprKind::Indirect { addr, .. } => vec![addr],
        ExprKind::BoundsCheck { index, bound, .. } => vec![index, bound],
        ExprKind::FieldRead { base, .. } => vec![base],
        ExprKind::Length(inner) => vec![inner],
        ExprKind::Cmp(_, a, b) => vec![a, b],
        ExprKind::BinArith(_, a, b) => vec![a, b],
        ExprKind::Call { args, .. } => args.iter().collect(),
        ExprKind::Comma(a, b) => vec![a, b],
        ExprKind::LocalRead(_)
        | ExprKind::ConstInt(_)
        | ExprKind::Unknown
        | ExprKind::GdvTest { .. }
        | ExprKind::Alloc(_)
        | ExprKind::NotCloneable => vec![],
    };
    for c in children {
        check_expr_ids_rec(c, seen, block)?;
    }
    Ok(())
}
