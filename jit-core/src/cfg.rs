//! Basic Block & Edge Model
//!
//! Typed blocks, successor kinds, and predecessor edges with duplication
//! counts and weight ranges (`spec.md` §3, §4.1).
//!
//! # Memory layout
//! Blocks and edges live in flat `Vec`s on [`crate::compiler::Compiler`] and
//! are addressed by `u32` index (`BlockId`), following the teacher's
//! `control_flow.rs` convention of `u32` ids plus `SmallVec`-backed
//! predecessor/successor lists to avoid a heap allocation for the overwhelming
//! common case of one or two edges per block.

use bitflags::bitflags;
use smallvec::SmallVec;

use crate::eh::EhRegionId;
use crate::ir::{BlockBodyKind, ClassHandle};

/// Sentinel for an unknown/unset IL offset (`spec.md` §3).
pub const BAD_IL_OFFSET: u32 = u32::MAX;

/// Index of a [`BasicBlock`] in `Compiler::blocks`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BlockFlags: u32 {
        /// Block must not be removed even with zero predecessors (entry,
        /// handler/filter entries, certain intrinsics).
        const DO_NOT_REMOVE   = 1 << 0;
        /// Set by the importer once a block's statements have been built.
        const IMPORTED        = 1 << 1;
        /// A `CALLFINALLY` with no paired `CALLFINALLYRET` (the finally never returns).
        const RETLESS_CALL    = 1 << 2;
        /// Block is known to run on the runtime's zero-init fast path.
        const ZERO_INIT_FAST  = 1 << 3;
        /// Predecessor-edge order invariant may have been violated by a bulk edit.
        const PREDS_UNSORTED  = 1 << 4;
        /// Legacy `ALWAYS` block standing in for a `CALLFINALLYRET`.
        const KEEP            = 1 << 5;
    }
}

/// Branch kind and kind-specific targets (`spec.md` §3, successor table in §4.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchKind {
    /// Falls through to the lexically next block.
    None,
    Always(BlockId),
    /// `false_target` is the fall-through; `true_target` is the explicit branch.
    Cond { false_target: BlockId, true_target: BlockId },
    Switch(SwitchTargets),
    Return,
    Throw,
    /// Pre-EH-normalization cross-region branch.
    Leave(BlockId),
    CallFinally { handler: BlockId, retless: bool },
    CallFinallyRet { continuation: BlockId },
    EhCatchRet(BlockId),
    /// Successor (the handler body) is fixed once the filter/handler pair is built.
    EhFilterRet(BlockId),
    /// Successors are every `CALLFINALLYRET` paired with a `CALLFINALLY` that
    /// targets this finally; computed and cached (`spec.md` §4.1, Open Questions).
    EhFinallyRet { handler_region: EhRegionId },
    EhFaultRet,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchTargets {
    /// Ordered target table; a target may repeat (duplication count > 1).
    pub targets: Vec<BlockId>,
    pub has_explicit_default: bool,
    /// Index into `targets` of the statistically dominant case, with its
    /// observed fraction of total switch executions.
    pub dominant_case: Option<(usize, f64)>,
}

impl SwitchTargets {
    /// Distinct targets, used both for `numSuccessors` and as the cached
    /// unique-successor set (`spec.md` §4.1 table).
    pub fn unique_targets(&self) -> Vec<BlockId> {
        let mut seen = Vec::new();
        for &t in &self.targets {
            if !seen.contains(&t) {
                seen.push(t);
            }
        }
        seen
    }
}

/// A basic block. Owns either a statement list or a linear instruction range,
/// never both (P5 of `spec.md` §3 invariant 5).
#[derive(Debug, Clone, PartialEq)]
pub struct BasicBlock {
    pub id: BlockId,
    /// Renumbering-friendly ordinal, monotonic in lexical order.
    pub ordinal: u32,
    pub code_offs: u32,
    pub code_offs_end: u32,
    pub flags: BlockFlags,
    pub branch: BranchKind,
    /// `0` = never executes; `f64::MAX` = maximum (the spec's weight sentinel).
    pub weight: f64,
    pub try_region: Option<EhRegionId>,
    pub handler_region: Option<EhRegionId>,
    pub catch_type: Option<ClassHandle>,
    pub body: BlockBodyKind,

    pub lexical_prev: Option<BlockId>,
    pub lexical_next: Option<BlockId>,

    /// Predecessor edges, indices into `Compiler::edges`, kept sorted by
    /// source id (`spec.md` §3 invariant 2 / P2).
    pub pred_edges: SmallVec<[EdgeId; 2]>,

    /// Natural loop this block belongs to, if any (set by `loops.rs`).
    pub loop_num: Option<u32>,
    /// Whether profile-derived reachability/weight info is present at all.
    pub has_profile_weight: bool,
}

impl BasicBlock {
    pub fn is_empty_of_code(&self) -> bool {
        matches!(&self.body, BlockBodyKind::Statements(s) if s.is_empty())
            || matches!(&self.body, BlockBodyKind::Linear { start, end } if start == end)
    }

    pub fn do_not_remove(&self) -> bool {
        self.flags.contains(BlockFlags::DO_NOT_REMOVE)
    }
}

/// Index of a [`FlowEdge`] in `Compiler::edges`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeId(pub u32);

/// A weighted, possibly-duplicated directed edge between two blocks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlowEdge {
    pub from: BlockId,
    pub to: BlockId,
    /// Number of kind-level occurrences this single edge entry represents
    /// (e.g. a switch listing the same target twice).
    pub dup_count: u32,
    pub weight_min: f64,
    pub weight_max: f64,
}

impl FlowEdge {
    pub fn new(from: BlockId, to: BlockId) -> Self {
        Self { from, to, dup_count: 1, weight_min: 0.0, weight_max: 0.0 }
    }
}

/// Number of successors per `spec.md` §4.1's table. `compiler` is required
/// only to resolve [`BranchKind::EhFinallyRet`]'s cached call-site set.
pub fn num_successors(block: &BasicBlock, finally_succ_count: impl FnOnce() -> usize) -> usize {
    match &block.branch {
        BranchKind::Throw | BranchKind::Return | BranchKind::EhFaultRet => 0,
        BranchKind::EhFinallyRet { .. } => finally_succ_count(),
        BranchKind::EhFilterRet(_) => 1,
        BranchKind::Always(_)
        | BranchKind::Leave(_)
        | BranchKind::CallFinally { .. }
        | BranchKind::CallFinallyRet { .. }
        | BranchKind::EhCatchRet(_)
        | BranchKind::None => 1,
        BranchKind::Cond { false_target, true_target } => {
            if false_target == true_target {
                1
            } else {
                2
            }
        }
        BranchKind::Switch(sw) => sw.unique_targets().len(),
    }
}

/// `successor(block, i, ...)`: the `i`th successor per the kind-specific
/// ordering. `finally_succs` supplies the cached call-site list for
/// `EhFinallyRet`; `fallthrough` supplies the lexically-next block id for
/// `None`/`CallFinallyRet`-as-fallthrough style kinds.
pub fn successor(
    block: &BasicBlock,
    i: usize,
    finally_succs: impl FnOnce() -> Vec<BlockId>,
) -> Option<BlockId> {
    match &block.branch {
        BranchKind::Throw | BranchKind::Return | BranchKind::EhFaultRet => None,
        BranchKind::None => {
            if i == 0 {
                block.lexical_next
            } else {
                None
            }
        }
        BranchKind::Always(t)
        | BranchKind::Leave(t)
        | BranchKind::CallFinally { handler: t, .. }
        | BranchKind::CallFinallyRet { continuation: t }
        | BranchKind::EhCatchRet(t)
        | BranchKind::EhFilterRet(t) => {
            if i == 0 {
                Some(*t)
            } else {
                None
            }
        }
        BranchKind::Cond { false_target, true_target } => match i {
            0 => Some(*false_target),
            1 if false_target != true_target => Some(*true_target),
            _ => None,
        },
        BranchKind::Switch(sw) => sw.unique_targets().get(i).copied(),
        BranchKind::EhFinallyRet { .. } => finally_succs().get(i).copied(),
    }
}

pub fn falls_through(block: &BasicBlock) -> bool {
    matches!(block.branch, BranchKind::None | BranchKind::CallFinallyRet { .. })
}

/// Allowed-to-be-empty kinds (`spec.md` §4.4 check 2).
pub fn allowed_empty(block: &BasicBlock) -> bool {
    matches!(
        block.branch,
        BranchKind::CallFinally { .. }
            | BranchKind::EhFinallyRet { .. }
            | BranchKind::EhFaultRet
            | BranchKind::EhFilterRet(_)
            | BranchKind::Return
            | BranchKind::Always(_)
            | BranchKind::EhCatchRet(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(id: u32, branch: BranchKind) -> BasicBlock {
        BasicBlock {
            id: BlockId(id),
            ordinal: id,
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
    fn cond_with_distinct_targets_has_two_successors() {
        let b = block(0, BranchKind::Cond { false_target: BlockId(1), true_target: BlockId(2) });
        assert_eq!(num_successors(&b, || 0), 2);
        assert_eq!(successor(&b, 0, Vec::new), Some(BlockId(1)));
        assert_eq!(successor(&b, 1, Vec::new), Some(BlockId(2)));
    }

    #[test]
    fn cond_with_same_targets_collapses_to_one() {
        let b = block(0, BranchKind::Cond { false_target: BlockId(1), true_target: BlockId(1) });
        assert_eq!(num_successors(&b, || 0), 1);
        assert_eq!(successor(&b, 1, Vec::new), None);
    }

    #[test]
    fn switch_successor_count_is_distinct_targets() {
        let sw = SwitchTargets {
            targets: vec![BlockId(1), BlockId(2), BlockId(2)],
            has_explicit_default: true,
            dominant_case: None,
        };
        let b = block(0, BranchKind::Switch(sw));
        assert_eq!(num_successors(&b, || 0), 2);
    }

    #[test]
    fn throw_return_faultret_have_no_successors() {
        assert_eq!(num_successors(&block(0, BranchKind::Throw), || 0), 0);
        assert_eq!(num_successors(&block(0, BranchKind::Return), || 0), 0);
        assert_eq!(num_successors(&block(0, BranchKind::EhFaultRet), || 0), 0);
    }

    #[test]
    fn allowed_empty_matches_spec_set() {
        assert!(allowed_empty(&block(0, BranchKind::Return)));
        assert!(allowed_empty(&block(0, BranchKind::EhFaultRet)));
        assert!(!allowed_empty(&block(0, BranchKind::None)));
    }
}
