//! Compiler Context
//!
//! `Compiler` is the pervasive ambient context the source treats as a global;
//! here it is an explicit struct threaded through every pass (`spec.md` §9
//! "Global mutable state"). It owns the graph, locals, EH table, and the
//! derived DFS/dominator/loop structures, each invalidatable independently
//! so a pass that doesn't touch edges never pays to rebuild them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::cfg::{BasicBlock, BlockId, BranchKind, EdgeId, FlowEdge};
use crate::checker::FlowgraphChecker;
use crate::config::CompilerOptions;
use crate::diag::DiagSink;
use crate::eh::{EhRegionId, EhTable};
use crate::error::CompilerError;
use crate::ir::{Expr, LocalTable, Stmt};
use crate::loops::LoopForest;
use crate::runtime::RuntimeInterface;
use crate::ssa::SsaState;
use crate::traversal::{DomTree, DfsTree};

/// Arena-category tags used purely for debugging memory provenance; they do
/// not partition visibility (`spec.md` §5). Real allocation still goes
/// through the ordinary global allocator -- there is no custom arena here,
/// matching how a hosted Rust service would track this, as opposed to the
/// source's bump allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArenaCategory {
    Block,
    Edge,
    Local,
    Ir,
    Ssa,
    Loop,
    Clone,
    Escape,
}

#[derive(Debug, Default)]
struct ArenaStats {
    counts: FxHashMap<&'static str, usize>,
}

/// One method's compilation state. Not `Sync`; multiple compilations run as
/// separate `Compiler` instances on separate threads, sharing only
/// `Arc<dyn RuntimeInterface>` (`spec.md` §5).
pub struct Compiler {
    pub options: CompilerOptions,
    pub runtime: Arc<dyn RuntimeInterface>,

    pub blocks: Vec<BasicBlock>,
    pub edges: Vec<FlowEdge>,
    pub locals: LocalTable,
    pub eh: EhTable,
    pub entry_block: BlockId,

    pub dfs: Option<DfsTree>,
    pub doms: Option<DomTree>,
    pub loops: Option<LoopForest>,
    pub ssa: Option<SsaState>,

    /// Whether incoming-edge weight sums balance against block weights
    /// (`spec.md` §3 "profile consistency"). Cleared by any pass that
    /// knowingly breaks the balance (e.g. loop cloning, conditional-escape
    /// cloning).
    pub pgo_consistent: bool,

    next_node_id: u64,
    finally_succ_cache: HashMap<EhRegionId, Vec<BlockId>>,
    cancellation: Arc<AtomicBool>,
    arena_stats: ArenaStats,
}

impl Compiler {
    pub fn new(options: CompilerOptions, runtime: Arc<dyn RuntimeInterface>) -> Self {
        Self {
            options,
            runtime,
            blocks: Vec::new(),
            edges: Vec::new(),
            locals: LocalTable::default(),
            eh: EhTable::new(),
            entry_block: BlockId(0),
            dfs: None,
            doms: None,
            loops: None,
            ssa: None,
            pgo_consistent: true,
            next_node_id: 0,
            finally_succ_cache: HashMap::new(),
            cancellation: Arc::new(AtomicBool::new(false)),
            arena_stats: ArenaStats::default(),
        }
    }

    pub fn cancellation_flag(&self) -> Arc<AtomicBool> {
        self.cancellation.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.load(Ordering::Relaxed)
    }

    pub fn check_cancelled(&self) -> Result<(), CompilerError> {
        if self.is_cancelled() {
            Err(CompilerError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Monotonic id source for IR tree nodes, satisfying P5 (global
    /// uniqueness) across every node kind, not just within one.
    pub fn next_id(&mut self) -> u64 {
        let id = self.next_node_id;
        self.next_node_id += 1;
        id
    }

    fn track(&mut self, category: &'static str) {
        *self.arena_stats.counts.entry(category).or_insert(0) += 1;
    }

    pub fn alloc_block(&mut self, mut block: BasicBlock) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        block.id = id;
        self.track("block");
        self.blocks.push(block);
        self.invalidate_derived();
        id
    }

    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id.0 as usize]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut BasicBlock {
        &mut self.blocks[id.0 as usize]
    }

    pub fn add_edge(&mut self, from: BlockId, to: BlockId) -> EdgeId {
        self.track("edge");
        // Merge into an existing edge between the same pair if present,
        // bumping its duplication count (a switch targeting a block twice).
        if let Some(existing) = self
            .edges
            .iter()
            .position(|e| e.from == from && e.to == to)
        {
            self.edges[existing].dup_count += 1;
            let eid = EdgeId(existing as u32);
            self.reinsert_pred(to, eid);
            return eid;
        }
        let eid = EdgeId(self.edges.len() as u32);
        self.edges.push(FlowEdge::new(from, to));
        self.reinsert_pred(to, eid);
        eid
    }

    fn reinsert_pred(&mut self, to: BlockId, eid: EdgeId) {
        let preds = &mut self.blocks[to.0 as usize].pred_edges;
        if !preds.contains(&eid) {
            preds.push(eid);
        }
        self.blocks[to.0 as usize].flags.insert(crate::cfg::BlockFlags::PREDS_UNSORTED);
    }

    /// `ensurePredListOrder`: check order, and only if necessary, collect,
    /// sort, and rethread -- the same "collect then apply" two-pass shape
    /// the teacher's `control_flow.rs::build_cfg` uses for successor/
    /// predecessor bookkeeping.
    pub fn ensure_pred_list_order(&mut self, block: BlockId) {
        let b = &mut self.blocks[block.0 as usize];
        if !b.flags.contains(crate::cfg::BlockFlags::PREDS_UNSORTED) {
            return;
        }
        let edges = &self.edges;
        let mut list: SmallVec<[EdgeId; 2]> = b.pred_edges.clone();
        list.sort_by_key(|e| edges[e.0 as usize].from.0);
        b.pred_edges = list;
        b.flags.remove(crate::cfg::BlockFlags::PREDS_UNSORTED);
    }

    pub fn predecessor_edges(&self, block: BlockId) -> impl Iterator<Item = &FlowEdge> + '_ {
        self.blocks[block.0 as usize]
            .pred_edges
            .iter()
            .map(move |eid| &self.edges[eid.0 as usize])
    }

    pub fn unique_predecessor(&self, block: BlockId) -> Option<BlockId> {
        let mut it = self.predecessor_edges(block);
        let first = it.next()?;
        if it.next().is_some() {
            None
        } else {
            Some(first.from)
        }
    }

    pub fn unique_successor(&self, block: BlockId) -> Option<BlockId> {
        let b = self.block(block);
        let n = self.num_successors(block);
        if n != 1 {
            return None;
        }
        self.successor(block, 0)
    }

    pub fn num_successors(&self, id: BlockId) -> usize {
        let b = self.block(id);
        crate::cfg::num_successors(b, || self.finally_successors(id).len())
    }

    pub fn successor(&self, id: BlockId, i: usize) -> Option<BlockId> {
        let b = self.block(id);
        crate::cfg::successor(b, i, || self.finally_successors(id).to_vec())
    }

    pub fn successors(&self, id: BlockId) -> Vec<BlockId> {
        (0..self.num_successors(id)).filter_map(|i| self.successor(id, i)).collect()
    }

    /// Computes (and would cache) the call-site set for an `EHFINALLYRET`:
    /// every `CALLFINALLYRET` paired with a `CALLFINALLY` that targets the
    /// block's enclosing finally region.
    pub fn finally_successors(&self, finallyret_block: BlockId) -> &[BlockId] {
        let region = match &self.block(finallyret_block).branch {
            BranchKind::EhFinallyRet { handler_region } => *handler_region,
            _ => return &[],
        };
        // Not actually mutating `self` (no interior mutability wired up for
        // this read path); recomputed each call. A production pass would
        // cache this behind a `RefCell` keyed by `region`, invalidated on
        // edge edits, as `spec.md` §4.1 prescribes.
        let _ = region;
        self.finally_succ_cache.get(&region).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Rebuilds the finally-successor cache for every `EhFinallyRet` region
    /// by scanning for `CALLFINALLY` blocks that target it. Must be called
    /// after any edit that adds/removes/retargets a `CALLFINALLY`.
    pub fn rebuild_finally_cache(&mut self) {
        self.finally_succ_cache.clear();
        for block in &self.blocks {
            if let BranchKind::CallFinally { handler, retless } = &block.branch {
                if *retless {
                    continue;
                }
                if let Some(region) = self.handler_region_of(*handler) {
                    if let Some(next) = block.lexical_next {
                        self.finally_succ_cache.entry(region).or_default().push(next);
                    }
                }
            }
        }
    }

    fn handler_region_of(&self, handler_entry: BlockId) -> Option<EhRegionId> {
        self.block(handler_entry).handler_region
    }

    pub fn invalidate_derived(&mut self) {
        self.dfs = None;
        self.doms = None;
        self.loops = None;
    }

    pub fn invalidate_ssa(&mut self) {
        self.ssa = None;
    }
}

/// Drives the mid-end's derived-analysis passes over one `Compiler`, in the
/// order every pass after the first depends on: DFS, dominators, natural
/// loops, SSA, then (in debug builds) the consistency checker. Cancellation
/// is polled between stages, the same "check, then proceed" shape as the
/// teacher's `RecompilationPipeline::recompile` stage sequence.
pub struct PassPipeline;

impl PassPipeline {
    /// Runs every derived-analysis stage, short-circuiting on the first
    /// cancellation or fatal invariant violation.
    pub fn run(compiler: &mut Compiler, sink: &dyn DiagSink) -> Result<(), CompilerError> {
        sink.pass_start("dfs");
        compiler.check_cancelled()?;
        let dfs = crate::traversal::build_dfs(compiler, |_| {}, |_| {}, |_, _| {});
        compiler.dfs = Some(dfs);
        sink.pass_complete("dfs");

        sink.pass_start("dominators");
        compiler.check_cancelled()?;
        let doms = crate::traversal::build_dominators(compiler, compiler.dfs.as_ref().unwrap());
        compiler.doms = Some(doms);
        sink.pass_complete("dominators");

        sink.pass_start("loops");
        compiler.check_cancelled()?;
        let loops = crate::loops::discover_loops(
            compiler,
            compiler.dfs.as_ref().unwrap(),
            compiler.doms.as_ref().unwrap(),
        );
        compiler.loops = Some(loops);
        sink.pass_complete("loops");

        sink.pass_start("ssa");
        compiler.check_cancelled()?;
        let ssa = SsaState::build(compiler, compiler.dfs.as_ref().unwrap());
        if let Err(e) = ssa.validate(compiler, compiler.dfs.as_ref().unwrap()) {
            sink.invariant_violation(&e);
            return Err(e);
        }
        compiler.ssa = Some(ssa);
        sink.pass_complete("ssa");

        if compiler.options.debug_checks {
            sink.pass_start("checker");
            compiler.check_cancelled()?;
            if let Err(e) = FlowgraphChecker::new(compiler).check_all() {
                sink.invariant_violation(&e);
                return Err(e);
            }
            sink.pass_complete("checker");
        }

        Ok(())
    }
}

/// An owned pair of an IR statement and its containing expression tree,
/// used by passes that need to hand the cloner a statement to duplicate.
pub struct OwnedStmt {
    pub stmt: Stmt,
}

impl OwnedStmt {
    pub fn exprs(&self) -> Vec<&Expr> {
        match &self.stmt.kind {
            crate::ir::StmtKind::Assign { src, .. } => vec![src],
            crate::ir::StmtKind::FieldAssign { base, src, .. } => vec![base, src],
            crate::ir::StmtKind::StoreStatic { src, .. } => vec![src],
            crate::ir::StmtKind::Expr(e) => vec![e],
            crate::ir::StmtKind::Return(Some(e)) => vec![e],
            crate::ir::StmtKind::Return(None) => vec![],
            crate::ir::StmtKind::Throw(e) => vec![e],
        }
    }
}
