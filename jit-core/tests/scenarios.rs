//! Black-box scenario tests exercising the public API end to end, the way
//! the teacher's `tests/integration` suite drives whole pipelines rather
//! than individual functions.

use std::sync::Arc;

use jit_core::cfg::{BasicBlock, BlockFlags, BlockId, BranchKind};
use jit_core::checker::FlowgraphChecker;
use jit_core::clone::{self, CandidateKind};
use jit_core::compiler::Compiler;
use jit_core::config::CompilerOptions;
use jit_core::error::{CompilerError, GiveUp};
use jit_core::escape;
use jit_core::ir::{
    AllocInfo, ArithOp, BlockBodyKind, ClassHandle, CmpOp, Expr, ExprKind, LocalFlags, LocalType,
    Stmt, StmtKind,
};
use jit_core::loops::discover_loops;
use jit_core::runtime::MockRuntime;
use jit_core::traversal::{build_dfs, build_dominators};
use smallvec::SmallVec;

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

fn mk_compiler() -> Compiler {
    Compiler::new(CompilerOptions::default(), Arc::new(MockRuntime::default()))
}

/// S1. An allocation under a successful-GDV guard, never assigned anywhere
/// else, does not escape: the conditional-escape rescue should mark its
/// clone pseudo as eligible to clone (`will_clone`), and once the
/// allocation is confirmed not to escape, the stack-allocation rewrite
/// retypes it off the GC heap.
#[test_log::test]
fn s1_gdv_guarded_allocation_does_not_escape_and_is_stack_rewritten() {
    let mut c = mk_compiler();
    // The implementation requires the GDV-tested local to be the same one
    // the allocation under the guard assigns into (a speculative
    // re-specialization pattern: "if (x's observed type matches, x = new
    // SpecializedT()"), not an unrelated guard local.
    let x = c.locals.push(LocalType::GcRef, LocalFlags { is_param: true, ..Default::default() });
    c.locals.assign_tracked_indices(|_| true);
    let class = ClassHandle(42);

    let guard = c.alloc_block(mk_block(BranchKind::Cond { false_target: BlockId(0), true_target: BlockId(0) }));
    let body = c.alloc_block(mk_block(BranchKind::Return));
    let slow = c.alloc_block(mk_block(BranchKind::Return));

    c.block_mut(guard).branch = BranchKind::Cond { false_target: slow, true_target: body };
    c.add_edge(guard, body);
    c.add_edge(guard, slow);
    c.entry_block = guard;

    c.block_mut(guard).body = BlockBodyKind::Statements(vec![Stmt {
        id: c.next_id(),
        block: guard,
        kind: StmtKind::Expr(Expr::new(
            c.next_id(),
            ExprKind::Cmp(
                CmpOp::Eq,
                Box::new(Expr::new(c.next_id(), ExprKind::GdvTest { local: x, class, constant: None })),
                Box::new(Expr::new(c.next_id(), ExprKind::ConstInt(1))),
            ),
        )),
    }]);
    c.block_mut(body).body = BlockBodyKind::Statements(vec![Stmt {
        id: c.next_id(),
        block: body,
        kind: StmtKind::Assign {
            dst: x,
            src: Expr::new(c.next_id(), ExprKind::Alloc(AllocInfo { class, is_array: false, helper_has_side_effects: false })),
        },
    }]);

    let dfs = build_dfs(&c, |_| {}, |_| {}, |_, _| {});
    let doms = build_dominators(&c, &dfs);

    let result = escape::analyze(&c, Some(&doms), 1);
    assert_eq!(result.clone_infos.len(), 1);
    assert!(result.clone_infos[0].will_clone, "non-escaping GDV-guarded allocation should be clone-eligible");

    let x_idx = c.locals.get(x).tracked_index.unwrap();
    assert!(!result.graph.is_escaping(result.universe.local_node(x_idx)));

    let pointing = escape::compute_pointing(&result.graph, &[result.universe.local_node(x_idx)]);
    escape::rewrite_stack_allocation(&mut c, x, &pointing, &result.universe);
    assert_eq!(c.locals.get(x).ty, LocalType::Int);
}

/// S2. A loop indexing a single invariant array by an invariant-bounded
/// induction variable clones cleanly: the fast path's bounds check is
/// disabled and both copies carry the fast/slow weight split.
#[test_log::test]
fn s2_array_access_loop_clones_with_bounds_check_disabled_on_fast_path() {
    let mut c = mk_compiler();
    let arr = c.locals.push(LocalType::GcRef, LocalFlags::default());
    let iv = c.locals.push(LocalType::Int, LocalFlags::default());
    c.locals.assign_tracked_indices(|_| true);

    let preheader = c.alloc_block(mk_block(BranchKind::Always(BlockId(0))));
    let header = c.alloc_block(mk_block(BranchKind::Cond { false_target: BlockId(0), true_target: BlockId(0) }));
    let body = c.alloc_block(mk_block(BranchKind::Always(BlockId(0))));
    let exit = c.alloc_block(mk_block(BranchKind::Return));

    c.block_mut(preheader).branch = BranchKind::Always(header);
    c.block_mut(header).branch = BranchKind::Cond { false_target: exit, true_target: body };
    c.block_mut(body).branch = BranchKind::Always(header);
    c.add_edge(preheader, header);
    c.add_edge(header, exit);
    c.add_edge(header, body);
    c.add_edge(body, header);
    c.entry_block = preheader;

    c.block_mut(preheader).body = BlockBodyKind::Statements(vec![Stmt {
        id: c.next_id(),
        block: preheader,
        kind: StmtKind::Assign { dst: iv, src: Expr::new(c.next_id(), ExprKind::ConstInt(0)) },
    }]);
    c.block_mut(header).body = BlockBodyKind::Statements(vec![Stmt {
        id: c.next_id(),
        block: header,
        kind: StmtKind::Expr(Expr::new(
            c.next_id(),
            ExprKind::Cmp(
                CmpOp::Lt,
                Box::new(Expr::new(c.next_id(), ExprKind::LocalRead(iv))),
                Box::new(Expr::new(c.next_id(), ExprKind::ConstInt(100))),
            ),
        )),
    }]);

    let bounds_check_id = c.next_id();
    let access = Expr::new(
        c.next_id(),
        ExprKind::BoundsCheck {
            index: Box::new(Expr::new(c.next_id(), ExprKind::LocalRead(iv))),
            bound: Box::new(Expr::new(
                c.next_id(),
                ExprKind::Length(Box::new(Expr::new(c.next_id(), ExprKind::LocalRead(arr)))),
            )),
            disabled: false,
        },
    );
    let mut access = access;
    access.id = bounds_check_id;
    c.block_mut(body).body = BlockBodyKind::Statements(vec![
        Stmt { id: c.next_id(), block: body, kind: StmtKind::Expr(access) },
        Stmt {
            id: c.next_id(),
            block: body,
            kind: StmtKind::Assign {
                dst: iv,
                src: Expr::new(
                    c.next_id(),
                    ExprKind::BinArith(
                        ArithOp::Add,
                        Box::new(Expr::new(c.next_id(), ExprKind::LocalRead(iv))),
                        Box::new(Expr::new(c.next_id(), ExprKind::ConstInt(1))),
                    ),
                ),
            },
        },
    ]);

    let dfs = build_dfs(&c, |_| {}, |_| {}, |_, _| {});
    let doms = build_dominators(&c, &dfs);
    let forest = discover_loops(&c, &dfs, &doms);
    c.loops = Some(forest);
    let loop_id = c.loops.as_ref().unwrap().iter().next().unwrap().id;
    let lp = c.loops.as_ref().unwrap().get(loop_id).clone();
    assert!(lp.is_canonical());

    let candidates = clone::collect_candidates(&c, &lp, c.options.deref_tree_max_depth).unwrap();
    assert_eq!(candidates.len(), 1);
    assert!(matches!(candidates[0].kind, CandidateKind::ArrayAccess { .. }));

    let blocks_before = c.blocks.len();
    let result = clone::clone_loop(&mut c, loop_id, &candidates).unwrap();
    assert_eq!(c.blocks.len(), blocks_before + lp.blocks.len() + 2 + 2);

    let fast_weight = c.block(result.fast_preheader).weight;
    let slow_weight = c.block(result.slow_preheader).weight;
    assert!((fast_weight - c.options.fast_path_weight).abs() < 1e-9);
    assert!((slow_weight - c.options.slow_path_weight()).abs() < 1e-9);

    let disabled_somewhere = c.blocks.iter().any(|b| {
        if let BlockBodyKind::Statements(stmts) = &b.body {
            stmts.iter().any(|s| {
                if let StmtKind::Expr(Expr { kind: ExprKind::BoundsCheck { disabled, .. }, .. }) = &s.kind {
                    *disabled
                } else {
                    false
                }
            })
        } else {
            false
        }
    });
    assert!(disabled_somewhere, "fast path copy of the loop should have its bounds check bashed");
    assert!(!c.pgo_consistent);
}

/// S3. A loop whose body exceeds the configured clone size limit is left
/// unmodified; cloning declines with a `GiveUp`, not an error.
#[test_log::test]
fn s3_cloning_declines_past_the_size_limit() {
    let mut c = mk_compiler();
    c.options.clone_size_limit = 1;
    let iv = c.locals.push(LocalType::Int, LocalFlags::default());
    c.locals.assign_tracked_indices(|_| true);

    let preheader = c.alloc_block(mk_block(BranchKind::Always(BlockId(0))));
    let header = c.alloc_block(mk_block(BranchKind::Cond { false_target: BlockId(0), true_target: BlockId(0) }));
    let body = c.alloc_block(mk_block(BranchKind::Always(BlockId(0))));
    let exit = c.alloc_block(mk_block(BranchKind::Return));

    c.block_mut(preheader).branch = BranchKind::Always(header);
    c.block_mut(header).branch = BranchKind::Cond { false_target: exit, true_target: body };
    c.block_mut(body).branch = BranchKind::Always(header);
    c.add_edge(preheader, header);
    c.add_edge(header, exit);
    c.add_edge(header, body);
    c.add_edge(body, header);
    c.entry_block = preheader;

    c.block_mut(body).body = BlockBodyKind::Statements(vec![Stmt {
        id: c.next_id(),
        block: body,
        kind: StmtKind::Assign {
            dst: iv,
            src: Expr::new(
                c.next_id(),
                ExprKind::BinArith(
                    ArithOp::Add,
                    Box::new(Expr::new(c.next_id(), ExprKind::LocalRead(iv))),
                    Box::new(Expr::new(c.next_id(), ExprKind::ConstInt(1))),
                ),
            ),
        },
    }]);

    let dfs = build_dfs(&c, |_| {}, |_| {}, |_, _| {});
    let doms = build_dominators(&c, &dfs);
    let forest = discover_loops(&c, &dfs, &doms);
    let loop_id = forest.iter().next().unwrap().id;
    let lp = forest.get(loop_id).clone();
    // Three blocks (header, body) exceed the configured limit of 1.
    assert!(lp.blocks.len() as u32 > c.options.clone_size_limit);
    c.loops = Some(forest);

    let err = clone::clone_loop(&mut c, loop_id, &[]).unwrap_err();
    pretty_assertions::assert_eq!(err, GiveUp::new("loop exceeds configured clone size limit"));
}

/// S4. Two GDV-guarded allocations whose clone regions overlap (the second
/// guard sits inside the first guard's success arm, so cloning the first
/// would also have to duplicate the second's blocks) can't both be
/// materialized. The earlier candidate wins; the later one is abandoned and
/// marked escaping even though, considered alone, neither allocation ever
/// escapes.
#[test_log::test]
fn s4_conditional_escape_candidates_with_overlapping_clone_regions_are_not_both_rescued() {
    let mut c = mk_compiler();
    // Each guard must test the same local its own allocation assigns into
    // (see the comment in the S1 test above).
    let x1 = c.locals.push(LocalType::GcRef, LocalFlags { is_param: true, ..Default::default() });
    let x2 = c.locals.push(LocalType::GcRef, LocalFlags { is_param: true, ..Default::default() });
    c.locals.assign_tracked_indices(|_| true);
    let class = ClassHandle(7);

    // guard2/body2 sit inside guard1's success arm (body1), so body1's
    // clone region -- everything it dominates -- also claims body2.
    let guard1 = c.alloc_block(mk_block(BranchKind::Cond { false_target: BlockId(0), true_target: BlockId(0) }));
    let body1 = c.alloc_block(mk_block(BranchKind::Always(BlockId(0))));
    let slow1 = c.alloc_block(mk_block(BranchKind::Return));
    let guard2 = c.alloc_block(mk_block(BranchKind::Cond { false_target: BlockId(0), true_target: BlockId(0) }));
    let body2 = c.alloc_block(mk_block(BranchKind::Return));
    let skip2 = c.alloc_block(mk_block(BranchKind::Return));

    c.block_mut(guard1).branch = BranchKind::Cond { false_target: slow1, true_target: body1 };
    c.block_mut(body1).branch = BranchKind::Always(guard2);
    c.block_mut(guard2).branch = BranchKind::Cond { false_target: skip2, true_target: body2 };
    c.add_edge(guard1, body1);
    c.add_edge(guard1, slow1);
    c.add_edge(body1, guard2);
    c.add_edge(guard2, body2);
    c.add_edge(guard2, skip2);
    c.entry_block = guard1;

    let gdv_stmt = |block: BlockId, local: jit_core::ir::LocalId, c: &mut Compiler| Stmt {
        id: c.next_id(),
        block,
        kind: StmtKind::Expr(Expr::new(
            c.next_id(),
            ExprKind::Cmp(
                CmpOp::Eq,
                Box::new(Expr::new(c.next_id(), ExprKind::GdvTest { local, class, constant: None })),
                Box::new(Expr::new(c.next_id(), ExprKind::ConstInt(1))),
            ),
        )),
    };
    let s = gdv_stmt(guard1, x1, &mut c);
    c.block_mut(guard1).body = BlockBodyKind::Statements(vec![s]);
    let s = gdv_stmt(guard2, x2, &mut c);
    c.block_mut(guard2).body = BlockBodyKind::Statements(vec![s]);

    c.block_mut(body1).body = BlockBodyKind::Statements(vec![Stmt {
        id: c.next_id(),
        block: body1,
        kind: StmtKind::Assign {
            dst: x1,
            src: Expr::new(c.next_id(), ExprKind::Alloc(AllocInfo { class, is_array: false, helper_has_side_effects: false })),
        },
    }]);
    c.block_mut(body2).body = BlockBodyKind::Statements(vec![Stmt {
        id: c.next_id(),
        block: body2,
        kind: StmtKind::Assign {
            dst: x2,
            src: Expr::new(c.next_id(), ExprKind::Alloc(AllocInfo { class, is_array: false, helper_has_side_effects: false })),
        },
    }]);

    let dfs = build_dfs(&c, |_| {}, |_| {}, |_, _| {});
    let doms = build_dominators(&c, &dfs);

    // Two slots available -- budget is not the limiting factor here, the
    // overlapping clone regions are.
    let result = escape::analyze(&c, Some(&doms), 2);
    assert_eq!(result.clone_infos.len(), 2);
    assert!(
        !result.clone_infos[0].blocks_to_clone.is_disjoint(&result.clone_infos[1].blocks_to_clone),
        "test setup should produce overlapping clone regions"
    );
    assert_eq!(result.clone_infos[0].guarded_local, x1);
    assert!(result.clone_infos[0].will_clone, "the earlier, outer candidate should win");
    assert_eq!(result.clone_infos[1].guarded_local, x2);
    assert!(!result.clone_infos[1].will_clone, "the later, nested candidate should be abandoned");

    let x2_idx = c.locals.get(x2).tracked_index.unwrap();
    assert!(
        result.graph.is_escaping(result.universe.pseudo_node(1)),
        "an abandoned pseudo is marked escaping so its local is too"
    );
    assert!(result.graph.is_escaping(result.universe.local_node(x2_idx)));
}

/// S5. An allocation assigned to a global (modeled here as a static store)
/// escapes and is left on the heap.
#[test_log::test]
fn s5_allocation_stored_to_a_global_escapes() {
    let mut c = mk_compiler();
    let o = c.locals.push(LocalType::GcRef, LocalFlags::default());
    c.locals.assign_tracked_indices(|_| true);

    let entry = c.alloc_block(mk_block(BranchKind::Return));
    c.entry_block = entry;
    c.block_mut(entry).body = BlockBodyKind::Statements(vec![
        Stmt {
            id: c.next_id(),
            block: entry,
            kind: StmtKind::Assign {
                dst: o,
                src: Expr::new(
                    c.next_id(),
                    ExprKind::Alloc(AllocInfo { class: ClassHandle(1), is_array: false, helper_has_side_effects: false }),
                ),
            },
        },
        Stmt {
            id: c.next_id(),
            block: entry,
            kind: StmtKind::StoreStatic { static_id: 0, src: Expr::new(c.next_id(), ExprKind::LocalRead(o)) },
        },
    ]);

    let result = escape::analyze(&c, None, 0);
    let idx = c.locals.get(o).tracked_index.unwrap();
    assert!(result.graph.is_escaping(result.universe.local_node(idx)));
    // Escaping locals keep their original GC-tracked type; no rewrite runs.
    assert_eq!(c.locals.get(o).ty, LocalType::GcRef);
}

/// S6. A block with no predecessors and no `DO_NOT_REMOVE` flag aborts the
/// consistency checker with the reachability invariant.
#[test_log::test]
fn s6_unreachable_block_fails_the_consistency_checker() {
    let mut c = mk_compiler();
    let entry = c.alloc_block(mk_block(BranchKind::Return));
    c.block_mut(entry).flags.insert(BlockFlags::DO_NOT_REMOVE);
    c.entry_block = entry;
    let _unreachable = c.alloc_block(mk_block(BranchKind::Return));

    let err = FlowgraphChecker::new(&c).check_all().unwrap_err();
    match err {
        CompilerError::Invariant { invariant, .. } => assert_eq!(invariant, "reachability"),
        other => panic!("expected a reachability invariant violation, got {other:?}"),
    }
}
