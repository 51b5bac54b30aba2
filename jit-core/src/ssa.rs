//! SSA Validator
//!
//! Per-SSA-lifetime facts (defining block, saturating use count, phi/global/
//! multiple-def flags) built from and cross-checked against a DFS walk of
//! the tracked locals (`spec.md` §4.4 check 9, §9 P6).

use rustc_hash::FxHashMap;

use crate::cfg::BlockId;
use crate::compiler::Compiler;
use crate::error::CompilerError;
use crate::ir::{BlockBodyKind, ExprKind, LocalId, StmtKind};
use crate::traversal::DfsTree;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SsaNum(pub u32);

/// One SSA lifetime's facts. The use-count field saturates rather than
/// wrapping, matching the documented tolerance for it to be an upper bound
/// once a later transform stops maintaining it precisely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SsaLifetime {
    pub def_block: Option<BlockId>,
    pub use_count: u16,
    pub has_phi_use: bool,
    pub has_global_use: bool,
    pub has_multiple_def: bool,
}

impl SsaLifetime {
    fn bump_use(&mut self) {
        self.use_count = self.use_count.saturating_add(1);
    }
}

/// Per-(local, ssa-number) lifetime table, keyed only over tracked locals.
/// Rebuilt wholesale on every SSA build/rebuild; never mutated in place
/// across unrelated passes (`spec.md` §3 "Lifecycles").
#[derive(Debug, Clone, Default)]
pub struct SsaState {
    lifetimes: FxHashMap<(LocalId, SsaNum), SsaLifetime>,
    def_order: FxHashMap<LocalId, Vec<SsaNum>>,
}

impl SsaState {
    pub fn lifetime(&self, local: LocalId, ssa: SsaNum) -> Option<&SsaLifetime> {
        self.lifetimes.get(&(local, ssa))
    }

    pub fn ssa_numbers(&self, local: LocalId) -> &[SsaNum] {
        self.def_order.get(&local).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Builds SSA lifetime facts for every tracked local by walking the
    /// CFG in DFS reverse-post-order: each `Assign` to a tracked local
    /// opens a new SSA number in definition order, and every `LocalRead`
    /// is attributed to the most recently opened number for that local
    /// reached so far in the walk.
    pub fn build(compiler: &Compiler, dfs: &DfsTree) -> Self {
        let mut state = SsaState::default();
        let mut current: FxHashMap<LocalId, SsaNum> = FxHashMap::default();

        // Parameters get an implicit SSA number 0 defined at entry, with
        // no corresponding `Assign` anywhere in the IR (spec's tolerated
        // "walker sees no def, table sees entry block" discrepancy is
        // reconciled here at build time rather than deferred).
        for local in compiler.locals.iter() {
            if local.is_tracked() && local.is_param {
                let num = SsaNum(0);
                state.lifetimes.insert(
                    (local.id, num),
                    SsaLifetime {
                        def_block: Some(compiler.entry_block),
                        use_count: 0,
                        has_phi_use: false,
                        has_global_use: false,
                        has_multiple_def: false,
                    },
                );
                state.def_order.entry(local.id).or_default().push(num);
                current.insert(local.id, num);
            }
        }

        for &block in &dfs.rpo {
            let stmts = match &compiler.block(block).body {
                BlockBodyKind::Statements(s) => s,
                BlockBodyKind::Linear { .. } => continue,
            };
            for stmt in stmts {
                walk_stmt_kind(&stmt.kind, &mut |is_def, local, block_here| {
                    if !compiler.locals.get(local).is_tracked() {
                        return;
                    }
                    if is_def {
                        let existing_count =
                            state.def_order.get(&local).map(|v| v.len()).unwrap_or(0);
                        let num = SsaNum(existing_count as u32);
                        let has_multiple_def = existing_count > 0;
                        if has_multiple_def {
                            for prior in state.def_order.get(&local).cloned().unwrap_or_default() {
                                if let Some(l) = state.lifetimes.get_mut(&(local, prior)) {
                                    l.has_multiple_def = true;
                                }
                            }
                        }
                        state.lifetimes.insert(
                            (local, num),
                            SsaLifetime {
                                def_block: Some(block_here),
                                use_count: 0,
                                has_phi_use: false,
                                has_global_use: false,
                                has_multiple_def,
                            },
                        );
                        state.def_order.entry(local).or_default().push(num);
                        current.insert(local, num);
                    } else if let Some(&num) = current.get(&local) {
                        if let Some(l) = state.lifetimes.get_mut(&(local, num)) {
                            l.bump_use();
                            if let Some(def_block) = l.def_block {
                                if def_block != block_here {
                                    l.has_global_use = true;
                                }
                            }
                        }
                    }
                }, block);
            }
        }

        // A join point reached from more than one distinct current SSA
        // number per local is approximated as needing a phi: mark every
        // number live at a block with two or more predecessor defs.
        for &block in &dfs.rpo {
            let preds: Vec<BlockId> = compiler.predecessor_edges(block).map(|e| e.from).collect();
            if preds.len() < 2 {
                continue;
            }
            for (local, nums) in state.def_order.clone() {
                let reaching: std::collections::HashSet<SsaNum> = nums
                    .iter()
                    .filter(|n| {
                        state
                            .lifetimes
                            .get(&(local, **n))
                            .and_then(|l| l.def_block)
                            .map(|db| dfs.is_reachable(db))
                            .unwrap_or(false)
                    })
                    .copied()
                    .collect();
                if reaching.len() > 1 {
                    for n in reaching {
                        if let Some(l) = state.lifetimes.get_mut(&(local, n)) {
                            l.has_phi_use = true;
                        }
                    }
                }
            }
        }

        state
    }

    /// Cross-checks this table's recorded def blocks against a fresh DFS
    /// walk, tolerating the documented parameter-initial-value discrepancy
    /// (walker finds no real `Assign`, table records the entry block).
    pub fn validate(&self, compiler: &Compiler, dfs: &DfsTree) -> Result<(), CompilerError> {
        let observed = SsaState::build(compiler, dfs);
        for ((local, ssa), recorded) in &self.lifetimes {
            let local_desc = compiler.locals.get(*local);
            if !local_desc.is_tracked() {
                return Err(CompilerError::Invariant {
                    pass: "ssa",
                    invariant: "untracked local carries an SSA number",
                    block: recorded.def_block,
                    detail: format!("local {:?}", local),
                });
            }
            let seen = observed.lifetimes.get(&(*local, *ssa));
            match (recorded.def_block, seen.and_then(|s| s.def_block)) {
                (Some(r), Some(o)) if r == o => {}
                (Some(r), None) if local_desc.is_param && r == compiler.entry_block => {}
                (a, b) => {
                    return Err(CompilerError::Invariant {
                        pass: "ssa",
                        invariant: "def block mismatch between recorded table and DFS walk",
                        block: a.or(b),
                        detail: format!("local {:?} ssa {:?}: recorded {:?}, observed {:?}", local, ssa, a, b),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Invokes `f(is_def, local, block)` for every tracked-local def/use in a
/// statement, in left-to-right evaluation order.
fn walk_stmt_kind(kind: &StmtKind, f: &mut impl FnMut(bool, LocalId, BlockId), block: BlockId) {
    match kind {
        StmtKind::Assign { dst, src } => {
            walk_expr(src, f, block);
            f(true, *dst, block);
        }
        StmtKind::FieldAssign { base, src, .. } => {
            walk_expr(base, f, block);
            walk_expr(src, f, block);
        }
        StmtKind::StoreStatic { src, .. } => walk_expr(src, f, block),
        StmtKind::Expr(e) => walk_expr(e, f, block),
        StmtKind::Return(Some(e)) => walk_expr(e, f, block),
        StmtKind::Return(None) => {}
        StmtKind::Throw(e) => walk_expr(e, f, block),
    }
}

fn walk_expr(expr: &crate::ir::Expr, f: &mut impl FnMut(bool, LocalId, BlockId), block: BlockId) {
    crate::ir::for_each_local_use(expr, &mut |l| f(false, l, block));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::{BasicBlock, BlockFlags, BranchKind};
    use crate::config::CompilerOptions;
    use crate::ir::{Expr, LocalFlags, LocalType, Stmt};
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

    #[test]
    fn single_def_single_use_is_consistent() {
        let mut c = Compiler::new(CompilerOptions::default(), Arc::new(MockRuntime::default()));
        let mut local_flags = LocalFlags::default();
        local_flags.is_param = false;
        let l = c.locals.push(LocalType::Int, local_flags);
        c.locals.assign_tracked_indices(|_| true);

        let entry = c.alloc_block(mk_block(BranchKind::Return));
        c.entry_block = entry;
        c.block_mut(entry).body = BlockBodyKind::Statements(vec![
            Stmt {
                id: c.next_id(),
                block: entry,
                kind: StmtKind::Assign { dst: l, src: Expr::new(c.next_id(), ExprKind::ConstInt(1)) },
            },
            Stmt {
                id: c.next_id(),
                block: entry,
                kind: StmtKind::Return(Some(Expr::new(c.next_id(), ExprKind::LocalRead(l)))),
            },
        ]);

        let dfs = crate::traversal::build_dfs(&c, |_| {}, |_| {}, |_, _| {});
        let ssa = SsaState::build(&c, &dfs);
        let nums = ssa.ssa_numbers(l);
        assert_eq!(nums.len(), 1);
        let lt = ssa.lifetime(l, nums[0]).unwrap();
        assert_eq!(lt.def_block, Some(entry));
        assert_eq!(lt.use_count, 1);
        assert!(!lt.has_multiple_def);
        assert!(ssa.validate(&c, &dfs).is_ok());
    }

    #[test]
    fn param_with_no_assign_uses_entry_block_tolerance() {
        let mut c = Compiler::new(CompilerOptions::default(), Arc::new(MockRuntime::default()));
        let mut flags = LocalFlags::default();
        flags.is_param = true;
        let l = c.locals.push(LocalType::Int, flags);
        c.locals.assign_tracked_indices(|_| true);

        let entry = c.alloc_block(mk_block(BranchKind::Return));
        c.entry_block = entry;
        c.block_mut(entry).body = BlockBodyKind::Statements(vec![Stmt {
            id: c.next_id(),
            block: entry,
            kind: StmtKind::Return(Some(Expr::new(c.next_id(), ExprKind::LocalRead(l)))),
        }]);

        let dfs = crate::traversal::build_dfs(&c, |_| {}, |_| {}, |_, _| {});
        let ssa = SsaState::build(&c, &dfs);
        assert!(ssa.validate(&c, &dfs).is_ok());
    }
}
