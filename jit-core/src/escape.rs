//! Object Escape Analyzer
//!
//! A connection-graph bit-vector fixed-point solver over the tracked-local /
//! clone-local / pseudo-node / unknown-source universe of `spec.md` §3, used
//! to decide which `new`/`new[]` sites can be satisfied with a stack slot
//! instead of a heap allocation (`spec.md` §4.7).

use bitvec::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::cfg::{BasicBlock, BlockId, BranchKind};
use crate::compiler::Compiler;
use crate::error::GiveUp;
use crate::give_up;
use crate::ir::{
    for_each_local_use, AllocInfo, BlockBodyKind, ClassHandle, CmpOp, Expr, ExprKind, LocalFlags, LocalId, LocalType,
    Stmt, StmtKind,
};
use crate::traversal::DomTree;

/// Index into the connection graph's bit-vector universe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

/// `[0..T)` tracked locals, `[T..T+M)` clone locals, `[T+M..T+2M)` pseudo
/// nodes, `T+2M` the unknown-source sentinel (`spec.md` §3).
#[derive(Debug, Clone, Copy)]
pub struct Universe {
    pub tracked: u32,
    pub clone_slots: u32,
}

impl Universe {
    pub fn new(tracked: u32, clone_slots: u32) -> Self {
        Self { tracked, clone_slots }
    }

    pub fn len(&self) -> u32 {
        self.tracked + 2 * self.clone_slots + 1
    }

    pub fn local_node(&self, tracked_index: u32) -> NodeId {
        NodeId(tracked_index)
    }

    pub fn clone_node(&self, site: u32) -> NodeId {
        NodeId(self.tracked + site)
    }

    pub fn pseudo_node(&self, site: u32) -> NodeId {
        NodeId(self.tracked + self.clone_slots + site)
    }

    pub fn unknown_source(&self) -> NodeId {
        NodeId(self.tracked + 2 * self.clone_slots)
    }
}

/// Directed edge `a -> b`: "the value held by `a` might come from `b`".
/// Escape flows in the reverse direction: if `a` escapes, `b` escapes too.
#[derive(Debug, Clone)]
pub struct ConnectionGraph {
    universe: Universe,
    adjacency: Vec<BitVec>,
    pub escaping: BitVec,
}

impl ConnectionGraph {
    pub fn new(universe: Universe) -> Self {
        let n = universe.len() as usize;
        Self {
            universe,
            adjacency: vec![BitVec::repeat(false, n); n],
            escaping: BitVec::repeat(false, n),
        }
    }

    pub fn universe(&self) -> Universe {
        self.universe
    }

    pub fn add_edge(&mut self, a: NodeId, b: NodeId) {
        self.adjacency[a.0 as usize].set(b.0 as usize, true);
    }

    pub fn seed_escaping(&mut self, node: NodeId) {
        self.escaping.set(node.0 as usize, true);
    }

    pub fn is_escaping(&self, node: NodeId) -> bool {
        self.escaping[node.0 as usize]
    }

    /// Standard worklist fixed point: `i` escaping and `i -> j` implies `j`
    /// escaping. Idempotent: running it again on an unchanged graph leaves
    /// `escaping` unchanged.
    pub fn close_escaping(&mut self) {
        let mut worklist: Vec<usize> = self.escaping.iter_ones().collect();
        while let Some(i) = worklist.pop() {
            let targets: Vec<usize> = self.adjacency[i].iter_ones().collect();
            for j in targets {
                if !self.escaping[j] {
                    self.escaping.set(j, true);
                    worklist.push(j);
                }
            }
        }
    }

    /// Forward-flow closure seeded at `seeds`, propagating along reverse
    /// edges: if `j` is in the result and `i -> j`, `i` joins too (the
    /// opposite direction of escape propagation, since here we're asking
    /// "who might hold a value that originated at the seed").
    fn reverse_closure(&self, seeds: &BitVec) -> BitVec {
        let n = self.universe.len() as usize;
        let mut result = seeds.clone();
        let mut worklist: Vec<usize> = seeds.iter_ones().collect();
        while let Some(j) = worklist.pop() {
            for i in 0..n {
                if self.adjacency[i][j] && !result[i] {
                    result.set(i, true);
                    worklist.push(i);
                }
            }
        }
        result
    }
}

/// Which side of a GDV guard an appearance of a guarded local was found on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UseSite {
    /// Strictly under the guard's success (`true`) edge.
    Success,
    /// Strictly under the guard's failure (`false`) edge.
    Failure,
}

/// One textual appearance of a guarded local, recorded the way the source
/// appearance map does so the eventual clone knows exactly which statements
/// to rewrite (`spec.md` §3 "Clone info").
#[derive(Debug, Clone)]
pub struct Appearance {
    pub block: BlockId,
    pub stmt_id: u64,
    pub site: UseSite,
    pub is_def: bool,
}

/// Per conditional-escape site bookkeeping (`spec.md` §3 "Clone info").
#[derive(Debug, Clone)]
pub struct CloneInfo {
    pub guarded_local: LocalId,
    pub guard_class: ClassHandle,
    pub guard_block: BlockId,
    pub alloc_block: BlockId,
    /// The allocation this pseudo stands in for.
    pub alloc_info: AllocInfo,
    pub pseudo: NodeId,
    /// Every appearance of `guarded_local` under the guard's success or
    /// failure arm, in block order.
    pub appearances: Vec<Appearance>,
    /// Other tracked locals read or written alongside `guarded_local` on the
    /// success (alloc) path; the clone must rename these too or the two
    /// copies would alias through a shared temporary.
    pub alloc_path_temps: FxHashSet<LocalId>,
    /// The same, for appearances on the failure path.
    pub use_path_temps: FxHashSet<LocalId>,
    /// Blocks a successful clone would duplicate: everything dominated by
    /// the guard's success edge.
    pub blocks_to_clone: FxHashSet<BlockId>,
    /// Weight share assigned to the cloned (confirmed-type) copy.
    pub scale_factor: f64,
    pub will_clone: bool,
}

/// Outcome of escape analysis: the closed connection graph, per-local
/// stack-allocation decisions, and any conditional-escape clone candidates.
pub struct EscapeAnalysis {
    pub universe: Universe,
    pub graph: ConnectionGraph,
    pub clone_infos: Vec<CloneInfo>,
}

/// Builds the connection graph for `compiler` and closes the `escaping`
/// set. `alloc_sites` bounds the clone-local/pseudo-node partitions (one
/// slot reserved per site that could plausibly need conditional-escape
/// treatment); callers typically pass the count of GDV-guarded allocation
/// sites found during a first scan.
pub fn analyze(compiler: &Compiler, doms: Option<&DomTree>, alloc_sites: u32) -> EscapeAnalysis {
    let tracked = compiler.locals.tracked_count();
    let universe = Universe::new(tracked, alloc_sites.max(1));
    let mut graph = ConnectionGraph::new(universe);

    // Seeds (spec.md P8 / §4.7 "Seeds"): unknownSource itself, and every
    // address-exposed / OSR / implicit-byref local.
    graph.seed_escaping(universe.unknown_source());
    for local in compiler.locals.iter() {
        let Some(idx) = local.tracked_index else { continue };
        let node = universe.local_node(idx);
        if local.address_exposed || local.is_osr || local.is_implicit_byref {
            graph.seed_escaping(node);
        }
        if local.is_param || local.is_osr {
            graph.add_edge(node, universe.unknown_source());
        }
    }

    // Phase 1 (spec.md §4.7 point 1): find every allocation under a GDV
    // success guard and reserve it a pseudo before any escape edges are
    // built, so phase 2 below can route failure-path escapes through it
    // instead of marking the guarded local escaping directly.
    let mut clone_infos: Vec<CloneInfo> = Vec::new();
    let mut next_site = 0u32;

    if compiler.options.enable_conditional_escape {
        if let Some(doms) = doms {
            for block in &compiler.blocks {
                let stmts = match &block.body {
                    BlockBodyKind::Statements(s) => s,
                    BlockBodyKind::Linear { .. } => continue,
                };
                for stmt in stmts {
                    if let StmtKind::Assign { dst, src: Expr { kind: ExprKind::Alloc(info), .. } } = &stmt.kind {
                        if let Some(guard) = find_gdv_guard(compiler, doms, block.id, *dst, UseSite::Success) {
                            if next_site >= universe.clone_slots {
                                continue;
                            }
                            let pseudo = universe.pseudo_node(next_site);
                            next_site += 1;
                            if let Some(idx) = compiler.locals.get(*dst).tracked_index {
                                graph.add_edge(pseudo, universe.local_node(idx));
                            }
                            let blocks_to_clone = blocks_dominated_by(compiler, doms, guard.true_target);
                            clone_infos.push(CloneInfo {
                                guarded_local: *dst,
                                guard_class: guard.class,
                                guard_block: guard.guard_block,
                                alloc_block: block.id,
                                alloc_info: info.clone(),
                                pseudo,
                                appearances: Vec::new(),
                                alloc_path_temps: FxHashSet::default(),
                                use_path_temps: FxHashSet::default(),
                                blocks_to_clone,
                                scale_factor: compiler.options.fast_path_weight,
                                will_clone: false,
                            });
                        }
                    }
                }
            }
        }
    }

    // Phase 2: ordinary edge sources, with failure-path uses of a guarded
    // local routed through its pseudo (spec.md §4.7 point 2) rather than
    // seeded escaping directly, and appearances/temps recorded for every
    // pseudo along the way.
    for block in &compiler.blocks {
        let stmts = match &block.body {
            BlockBodyKind::Statements(s) => s,
            BlockBodyKind::Linear { .. } => continue,
        };
        for stmt in stmts {
            record_appearances(compiler, doms, &mut clone_infos, stmt, block.id);
            let route = active_route(compiler, doms, &clone_infos, block.id, stmt);
            process_stmt(compiler, &universe, &mut graph, stmt, route);
        }
    }

    graph.close_escaping();

    // Rescue decision (spec.md §4.7 point 3 gate): a pseudo not escaping,
    // and whose guarded local also did not escape independently, is a
    // candidate for cloning.
    recompute_rescue_decisions(compiler, &universe, &graph, &mut clone_infos);

    // Point 4: overlap-bound abandonment. Two rescued pseudos whose clone
    // regions claim a shared block can't both be materialized -- abandon
    // the later one, mark its pseudo escaping, and let the closure (and
    // rescue decisions) settle again.
    loop {
        let mut abandoned = false;
        for i in 0..clone_infos.len() {
            if !clone_infos[i].will_clone {
                continue;
            }
            for j in 0..i {
                if !clone_infos[j].will_clone {
                    continue;
                }
                if !clone_infos[i].blocks_to_clone.is_disjoint(&clone_infos[j].blocks_to_clone) {
                    clone_infos[i].will_clone = false;
                    graph.seed_escaping(clone_infos[i].pseudo);
                    abandoned = true;
                    break;
                }
            }
        }
        if !abandoned {
            break;
        }
        graph.close_escaping();
        recompute_rescue_decisions(compiler, &universe, &graph, &mut clone_infos);
    }

    EscapeAnalysis { universe, graph, clone_infos }
}

fn recompute_rescue_decisions(
    compiler: &Compiler,
    universe: &Universe,
    graph: &ConnectionGraph,
    clone_infos: &mut [CloneInfo],
) {
    for info in clone_infos.iter_mut() {
        if graph.is_escaping(info.pseudo) {
            info.will_clone = false;
            continue;
        }
        let local_idx = compiler.locals.get(info.guarded_local).tracked_index;
        let local_escapes = local_idx.map(|i| graph.is_escaping(universe.local_node(i))).unwrap_or(true);
        info.will_clone = !local_escapes;
    }
}

/// A resolved GDV guard: the `Cond` block and both of its edge targets.
struct GuardInfo {
    guard_block: BlockId,
    true_target: BlockId,
    class: ClassHandle,
}

/// Finds the nearest enclosing GDV guard (a `Cond` block whose trailing
/// statement tests `indir(local) == class`) such that `block` lies strictly
/// under the requested edge (`site`) for `local`. Mirrors `IsGuarded`'s
/// single dominator-tree walk, parameterized on which outcome is wanted
/// instead of duplicating the walk per outcome.
fn find_gdv_guard(compiler: &Compiler, doms: &DomTree, block: BlockId, local: LocalId, site: UseSite) -> Option<GuardInfo> {
    for candidate in &compiler.blocks {
        let BranchKind::Cond { true_target, false_target } = &candidate.branch else { continue };
        let (true_target, false_target) = (*true_target, *false_target);
        let stmts = match &candidate.body {
            BlockBodyKind::Statements(s) => s,
            BlockBodyKind::Linear { .. } => continue,
        };
        let test = stmts.iter().rev().find_map(|s| match &s.kind {
            StmtKind::Expr(e) => gdv_test_in(e),
            _ => None,
        });
        let Some((test_local, class)) = test else { continue };
        if test_local != local {
            continue;
        }
        let target = match site {
            UseSite::Success => true_target,
            UseSite::Failure => false_target,
        };
        let other = match site {
            UseSite::Success => false_target,
            UseSite::Failure => true_target,
        };
        // The other arm must not also dominate `block`, or this would be
        // the top of a diamond both outcomes reach -- not actually guarded.
        if doms.dominates(target, block) && !doms.dominates(other, block) {
            return Some(GuardInfo { guard_block: candidate.id, true_target, class });
        }
    }
    None
}

fn gdv_test_in(e: &Expr) -> Option<(LocalId, ClassHandle)> {
    if let ExprKind::Cmp(CmpOp::Eq, a, b) = &e.kind {
        if let ExprKind::GdvTest { local, class, .. } = &a.kind {
            if matches!(b.kind, ExprKind::ConstInt(1)) {
                return Some((*local, *class));
            }
        }
        if let ExprKind::GdvTest { local, class, .. } = &b.kind {
            if matches!(a.kind, ExprKind::ConstInt(1)) {
                return Some((*local, *class));
            }
        }
    }
    None
}

/// All blocks dominated by `root`, inclusive -- the region a clone of the
/// guard's success (or failure) edge would need to duplicate.
fn blocks_dominated_by(compiler: &Compiler, doms: &DomTree, root: BlockId) -> FxHashSet<BlockId> {
    compiler.blocks.iter().filter(|b| doms.dominates(root, b.id)).map(|b| b.id).collect()
}

/// Records every appearance of a tracked `CloneInfo::guarded_local` in
/// `stmt`, and folds in any other tracked locals referenced alongside it as
/// alloc-path or use-path temporaries that a clone must also rename.
fn record_appearances(
    compiler: &Compiler,
    doms: Option<&DomTree>,
    clone_infos: &mut [CloneInfo],
    stmt: &Stmt,
    block: BlockId,
) {
    let Some(doms) = doms else { return };
    let mut referenced = Vec::new();
    for_each_stmt_local_use(stmt, &mut |l| referenced.push(l));
    if referenced.is_empty() {
        return;
    }
    let def_local = match &stmt.kind {
        StmtKind::Assign { dst, .. } => Some(*dst),
        _ => None,
    };

    for info in clone_infos.iter_mut() {
        if !referenced.contains(&info.guarded_local) {
            continue;
        }
        let BranchKind::Cond { true_target, false_target } = compiler.block(info.guard_block).branch else {
            continue;
        };
        let site = if doms.dominates(true_target, block) {
            UseSite::Success
        } else if doms.dominates(false_target, block) {
            UseSite::Failure
        } else {
            continue;
        };
        info.appearances.push(Appearance { block, stmt_id: stmt.id, site, is_def: def_local == Some(info.guarded_local) });
        for &other in &referenced {
            if other == info.guarded_local || compiler.locals.get(other).tracked_index.is_none() {
                continue;
            }
            match site {
                UseSite::Success => {
                    info.alloc_path_temps.insert(other);
                }
                UseSite::Failure => {
                    info.use_path_temps.insert(other);
                }
            }
        }
    }
}

fn for_each_stmt_local_use(stmt: &Stmt, f: &mut impl FnMut(LocalId)) {
    match &stmt.kind {
        StmtKind::Assign { dst, src } => {
            f(*dst);
            for_each_local_use(src, f);
        }
        StmtKind::FieldAssign { base, src, .. } => {
            for_each_local_use(base, f);
            for_each_local_use(src, f);
        }
        StmtKind::StoreStatic { src, .. } => for_each_local_use(src, f),
        StmtKind::Expr(e) => for_each_local_use(e, f),
        StmtKind::Return(Some(e)) => for_each_local_use(e, f),
        StmtKind::Return(None) => {}
        StmtKind::Throw(e) => for_each_local_use(e, f),
    }
}

/// Escape-routing decision for the statement currently being processed: for
/// each guarded local with an active pseudo at this block, whether an
/// escaping use should seed the pseudo (and add `pseudo -> local`) instead
/// of seeding the local directly.
struct Route<'a> {
    clone_infos: &'a [CloneInfo],
    doms: Option<&'a DomTree>,
    block: BlockId,
}

fn active_route<'a>(
    _compiler: &Compiler,
    doms: Option<&'a DomTree>,
    clone_infos: &'a [CloneInfo],
    block: BlockId,
    _stmt: &Stmt,
) -> Route<'a> {
    Route { clone_infos, doms, block }
}

impl Route<'_> {
    /// If `local` is guarded and `self.block` lies under that guard's
    /// failure edge, returns the pseudo node an escaping use should route
    /// through instead of marking `local` escaping directly.
    fn failure_pseudo_for(&self, compiler: &Compiler, local: LocalId) -> Option<NodeId> {
        let doms = self.doms?;
        for info in self.clone_infos {
            if info.guarded_local != local {
                continue;
            }
            if let Some(guard) = find_gdv_guard(compiler, doms, self.block, local, UseSite::Failure) {
                if guard.guard_block == info.guard_block {
                    return Some(info.pseudo);
                }
            }
        }
        None
    }
}

/// Edge sources 1-6 and the direct-escape cases (`spec.md` §4.7).
fn process_stmt(compiler: &Compiler, universe: &Universe, graph: &mut ConnectionGraph, stmt: &Stmt, route: Route<'_>) {
    match &stmt.kind {
        StmtKind::Assign { dst, src } => {
            let Some(dst_idx) = compiler.locals.get(*dst).tracked_index else { return };
            let dst_node = universe.local_node(dst_idx);
            match &src.kind {
                // 1. x = y (both tracked locals): x -> y.
                ExprKind::LocalRead(y) => {
                    if let Some(y_idx) = compiler.locals.get(*y).tracked_index {
                        graph.add_edge(dst_node, universe.local_node(y_idx));
                    } else {
                        graph.add_edge(dst_node, universe.unknown_source());
                    }
                }
                // 2. x.f = y through a tracked struct base is handled in
                // FieldAssign below; a plain FieldRead on the RHS widens to
                // the base (field granularity optional per spec.md).
                ExprKind::FieldRead { base, .. } => {
                    if let ExprKind::LocalRead(b) = &base.kind {
                        if let Some(b_idx) = compiler.locals.get(*b).tracked_index {
                            graph.add_edge(dst_node, universe.local_node(b_idx));
                            return;
                        }
                    }
                    graph.add_edge(dst_node, universe.unknown_source());
                }
                ExprKind::Alloc(_) => {
                    // The allocation site itself: no incoming edge needed,
                    // the local simply names a fresh object.
                }
                // 3. x = <unknown> (call result, non-tracked memory read, etc).
                _ => graph.add_edge(dst_node, universe.unknown_source()),
            }
        }
        StmtKind::FieldAssign { base, src, .. } => {
            // x.f = y where x is a tracked local struct: x -> y.
            if let (ExprKind::LocalRead(x), ExprKind::LocalRead(y)) = (&base.kind, &src.kind) {
                if let (Some(xi), Some(yi)) = (compiler.locals.get(*x).tracked_index, compiler.locals.get(*y).tracked_index) {
                    graph.add_edge(universe.local_node(xi), universe.local_node(yi));
                    return;
                }
            }
            // 4. Store through an address that didn't resolve to a tracked
            // local: the stored value escapes directly.
            mark_escaping_if_local(compiler, universe, graph, src, &route);
        }
        // 6. Store to a static, return, throw: escapes.
        StmtKind::StoreStatic { src, .. } | StmtKind::Return(Some(src)) | StmtKind::Throw(src) => {
            mark_escaping_if_local(compiler, universe, graph, src, &route);
        }
        StmtKind::Return(None) => {}
        StmtKind::Expr(e) => {
            if let ExprKind::Call { args, no_escape_args, .. } = &e.kind {
                // 5. Pass to a call whose argument is not known no-escape.
                for (i, arg) in args.iter().enumerate() {
                    let no_escape = no_escape_args.get(i).copied().unwrap_or(false);
                    if !no_escape {
                        mark_escaping_if_local(compiler, universe, graph, arg, &route);
                    }
                }
            }
        }
    }
}

/// Marks a `LocalRead` escaping, or -- if it names a local currently guarded
/// by a GDV test and this use lies under that guard's failure edge -- routes
/// the escape through the pseudo instead (`spec.md` §4.7 point 2): adds
/// `pseudo -> local` and seeds the *pseudo*, so the local only escapes if the
/// pseudo does, via the ordinary closure.
fn mark_escaping_if_local(
    compiler: &Compiler,
    universe: &Universe,
    graph: &mut ConnectionGraph,
    expr: &Expr,
    route: &Route<'_>,
) {
    if let ExprKind::LocalRead(l) = &expr.kind {
        let Some(idx) = compiler.locals.get(*l).tracked_index else { return };
        let node = universe.local_node(idx);
        if let Some(pseudo) = route.failure_pseudo_for(compiler, *l) {
            graph.add_edge(pseudo, node);
            graph.seed_escaping(pseudo);
        } else {
            graph.seed_escaping(node);
        }
    }
}

/// Clones the blocks a [`CloneInfo`] claims (its GDV guard's success-edge
/// region), specializes the guard's outcome in both copies, and rewrites the
/// clone's uses of the guarded local to a fresh local with the confirmed
/// exact type (`spec.md` §4.7 point 3). Mirrors `clone::clone_loop`'s
/// block-duplication shape, applied to a guard region instead of a loop
/// body: new blocks via [`crate::ir::clone_stmt_replacing`], branch
/// retargeting via [`crate::clone::remap_branch`], weight split via
/// `scale_factor`.
pub fn materialize_clone(compiler: &mut Compiler, info: &CloneInfo) -> Result<LocalId, GiveUp> {
    if !info.will_clone {
        give_up!("clone info was not selected for materialization");
    }
    if info.blocks_to_clone.is_empty() {
        give_up!("clone region is empty");
    }

    let guard_branch = compiler.block(info.guard_block).branch.clone();
    let BranchKind::Cond { true_target, false_target } = guard_branch else {
        give_up!("guarding block is not a conditional branch");
    };

    let guarded_ty = compiler.locals.get(info.guarded_local).ty.clone();
    let fresh_local = compiler.locals.push(guarded_ty, LocalFlags::default());

    let mut ordered: Vec<BlockId> = info.blocks_to_clone.iter().copied().collect();
    ordered.sort_by_key(|b| b.0);

    let mut block_map: FxHashMap<BlockId, BlockId> = FxHashMap::default();
    for &b in &ordered {
        let src = compiler.block(b).clone();
        let clone_id = BlockId(compiler.blocks.len() as u32);
        let stmts = match &src.body {
            BlockBodyKind::Statements(s) => s.clone(),
            BlockBodyKind::Linear { .. } => give_up!("cannot clone a linearized block"),
        };
        let mut cloned_stmts = Vec::with_capacity(stmts.len());
        for s in &stmts {
            let cloned = crate::ir::clone_stmt_replacing(s, clone_id, info.guarded_local, fresh_local, &mut || {
                compiler.next_id()
            })
            .ok_or_else(|| GiveUp::new("conditional-escape clone region contains a non-cloneable node"))?;
            cloned_stmts.push(cloned);
        }
        let mut cloned = src;
        cloned.id = clone_id;
        cloned.body = BlockBodyKind::Statements(cloned_stmts);
        cloned.pred_edges = Default::default();
        cloned.lexical_prev = None;
        cloned.lexical_next = None;
        compiler.blocks.push(cloned);
        block_map.insert(b, clone_id);
    }

    for (&orig, &cloned) in block_map.iter() {
        let new_branch = crate::clone::remap_branch(&compiler.block(orig).branch.clone(), &block_map);
        compiler.block_mut(cloned).branch = new_branch;
    }

    // The two copies now run under disjoint, statically known guard
    // outcomes: the clone's tests are confirmed true, the original's are
    // confirmed false.
    for &b in &ordered {
        specialize_gdv_tests(compiler.block_mut(b), info.guarded_local, info.guard_class, false);
    }
    for &cloned in block_map.values() {
        specialize_gdv_tests(compiler.block_mut(cloned), fresh_local, info.guard_class, true);
    }

    let clone_entry = *block_map
        .get(&true_target)
        .ok_or_else(|| GiveUp::new("guard's success target was not part of the cloned region"))?;
    compiler.block_mut(info.guard_block).branch = BranchKind::Cond { true_target: clone_entry, false_target };
    compiler.add_edge(info.guard_block, clone_entry);

    let slow_share = 1.0 - info.scale_factor;
    for &b in &ordered {
        compiler.block_mut(b).weight *= slow_share;
    }
    for &cloned in block_map.values() {
        compiler.block_mut(cloned).weight *= info.scale_factor;
    }

    compiler.pgo_consistent = false;
    compiler.invalidate_derived();

    Ok(fresh_local)
}

fn specialize_gdv_tests(block: &mut BasicBlock, local: LocalId, class: ClassHandle, constant: bool) {
    if let BlockBodyKind::Statements(stmts) = &mut block.body {
        for stmt in stmts {
            specialize_stmt(stmt, local, class, constant);
        }
    }
}

fn specialize_stmt(stmt: &mut Stmt, local: LocalId, class: ClassHandle, constant: bool) {
    let exprs: Vec<&mut Expr> = match &mut stmt.kind {
        StmtKind::Assign { src, .. } => vec![src],
        StmtKind::FieldAssign { base, src, .. } => vec![base, src],
        StmtKind::StoreStatic { src, .. } => vec![src],
        StmtKind::Expr(e) => vec![e],
        StmtKind::Return(Some(e)) => vec![e],
        StmtKind::Return(None) => vec![],
        StmtKind::Throw(e) => vec![e],
    };
    for e in exprs {
        specialize_expr(e, local, class, constant);
    }
}

fn specialize_expr(expr: &mut Expr, local: LocalId, class: ClassHandle, constant: bool) {
    if let ExprKind::GdvTest { local: l, class: c, constant: k } = &mut expr.kind {
        if *l == local && *c == class {
            *k = Some(constant);
        }
    }
    match &mut expr.kind {
        ExprKind::Indirect { addr, .. } => specialize_expr(addr, local, class, constant),
        ExprKind::BoundsCheck { index, bound, .. } => {
            specialize_expr(index, local, class, constant);
            specialize_expr(bound, local, class, constant);
        }
        ExprKind::FieldRead { base, .. } => specialize_expr(base, local, class, constant),
        ExprKind::Length(inner) => specialize_expr(inner, local, class, constant),
        ExprKind::Cmp(_, a, b) | ExprKind::BinArith(_, a, b) | ExprKind::Comma(a, b) => {
            specialize_expr(a, local, class, constant);
            specialize_expr(b, local, class, constant);
        }
        ExprKind::Call { args, .. } => {
            for a in args {
                specialize_expr(a, local, class, constant);
            }
        }
        _ => {}
    }
}

/// Stack-allocatability safety gates (`spec.md` §4.7 "Safety gates"),
/// checked independently of the connection-graph escape result.
pub fn passes_safety_gates(
    compiler: &Compiler,
    alloc_block: BlockId,
    info: &AllocInfo,
    class_max_size: u32,
) -> Result<(), GiveUp> {
    if let Some(loops) = &compiler.loops {
        if loops.innermost_containing(alloc_block).is_some() {
            give_up!("allocation site is inside a loop");
        }
    }
    match compiler.runtime.block_profile_count(alloc_block.0) {
        None => give_up!("allocation block lacks profile data"),
        Some(count) => {
            let entry_count = compiler.runtime.block_profile_count(compiler.entry_block.0).unwrap_or(0.0);
            if entry_count > 0.0 && count < entry_count * 0.10 {
                give_up!("allocation block executes below the 10% entry-frequency threshold");
            }
        }
    }
    let size = compiler.runtime.heap_class_size(info.class);
    if size > class_max_size {
        give_up!("object size exceeds the configured stack allocation maximum");
    }
    if !compiler.runtime.is_exact_handle(info.class) {
        give_up!("target class handle is not exact (open generic)");
    }
    if !compiler.runtime.can_allocate_on_stack(info.class) {
        give_up!("runtime reports class is not stack-allocatable");
    }
    let attrs = compiler.runtime.class_attributes(info.class);
    if attrs.has_finalizer || attrs.has_special_layout {
        give_up!("class has a finalizer or special layout");
    }
    Ok(())
}

/// The stack-pointing / heap-pointing closure, run after allocation
/// decisions are finalized (`spec.md` §4.7 "Stack-pointing closure").
pub struct PointingAnalysis {
    pub possibly_stack_pointing: BitVec,
    pub possibly_heap_pointing: BitVec,
}

impl PointingAnalysis {
    /// A local is *definitely* stack-pointing iff possibly stack-pointing
    /// and not possibly heap-pointing.
    pub fn is_definitely_stack_pointing(&self, node: NodeId) -> bool {
        self.possibly_stack_pointing[node.0 as usize] && !self.possibly_heap_pointing[node.0 as usize]
    }

    pub fn is_possibly_stack_pointing(&self, node: NodeId) -> bool {
        self.possibly_stack_pointing[node.0 as usize]
    }
}

pub fn compute_pointing(graph: &ConnectionGraph, stack_allocated_locals: &[NodeId]) -> PointingAnalysis {
    let n = graph.universe.len() as usize;
    let mut stack_seeds = BitVec::repeat(false, n);
    for &node in stack_allocated_locals {
        stack_seeds.set(node.0 as usize, true);
    }
    let mut heap_seeds = BitVec::repeat(false, n);
    heap_seeds.set(graph.universe.unknown_source().0 as usize, true);

    PointingAnalysis {
        possibly_stack_pointing: graph.reverse_closure(&stack_seeds),
        possibly_heap_pointing: graph.reverse_closure(&heap_seeds),
    }
}

/// Rewrites a non-escaping allocation's uses to reference a stack slot
/// instead of a heap object (`spec.md` §4.7 "Stack-allocation rewrite").
/// Retypes the local per the pointing analysis and flags every `Indirect`
/// through it as non-faulting / not-heap, eliding downstream write
/// barriers and null checks.
pub fn rewrite_stack_allocation(
    compiler: &mut Compiler,
    local: LocalId,
    pointing: &PointingAnalysis,
    universe: &Universe,
) {
    let tracked_idx = compiler.locals.get(local).tracked_index;
    let node = tracked_idx.map(|i| universe.local_node(i));

    if let Some(node) = node {
        if pointing.is_definitely_stack_pointing(node) {
            compiler.locals.get_mut(local).ty = LocalType::Int;
        } else if pointing.is_possibly_stack_pointing(node) {
            compiler.locals.get_mut(local).ty = LocalType::ByRef;
        }
    }

    let mut seen: FxHashMap<u64, ()> = FxHashMap::default();
    for block in &mut compiler.blocks {
        if let BlockBodyKind::Statements(stmts) = &mut block.body {
            for stmt in stmts {
                retype_indirections(stmt, local, &mut seen);
            }
        }
    }
}

fn retype_indirections(stmt: &mut Stmt, local: LocalId, seen: &mut FxHashMap<u64, ()>) {
    let exprs: Vec<&mut Expr> = match &mut stmt.kind {
        StmtKind::Assign { src, .. } => vec![src],
        StmtKind::FieldAssign { base, src, .. } => vec![base, src],
        StmtKind::StoreStatic { src, .. } => vec![src],
        StmtKind::Expr(e) => vec![e],
        StmtKind::Return(Some(e)) => vec![e],
        StmtKind::Return(None) => vec![],
        StmtKind::Throw(e) => vec![e],
    };
    for e in exprs {
        retype_expr(e, local, seen);
    }
}

fn retype_expr(expr: &mut Expr, local: LocalId, seen: &mut FxHashMap<u64, ()>) {
    if let ExprKind::Indirect { addr, non_faulting, not_heap } = &mut expr.kind {
        if matches!(addr.kind, ExprKind::LocalRead(l) if l == local) {
            *non_faulting = true;
            *not_heap = true;
            seen.insert(expr.id, ());
        }
        retype_expr(addr, local, seen);
        return;
    }
    match &mut expr.kind {
        ExprKind::BoundsCheck { index, bound, .. } => {
            retype_expr(index, local, seen);
            retype_expr(bound, local, seen);
        }
        ExprKind::FieldRead { base, .. } => retype_expr(base, local, seen),
        ExprKind::Length(inner) => retype_expr(inner, local, seen),
        ExprKind::Cmp(_, a, b) | ExprKind::BinArith(_, a, b) | ExprKind::Comma(a, b) => {
            retype_expr(a, local, seen);
            retype_expr(b, local, seen);
        }
        ExprKind::Call { args, .. } => {
            for a in args {
                retype_expr(a, local, seen);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::BlockFlags;
    use crate::config::CompilerOptions;
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
    fn unknown_source_is_seeded_escaping() {
        let universe = Universe::new(4, 1);
        let graph = ConnectionGraph::new(universe);
        assert!(!graph.is_escaping(universe.unknown_source()));
        let mut graph = graph;
        graph.seed_escaping(universe.unknown_source());
        graph.close_escaping();
        assert!(graph.is_escaping(universe.unknown_source()));
    }

    #[test]
    fn escape_propagates_along_edges() {
        let universe = Universe::new(2, 1);
        let mut graph = ConnectionGraph::new(universe);
        let a = universe.local_node(0);
        let b = universe.local_node(1);
        graph.add_edge(a, b);
        graph.seed_escaping(a);
        graph.close_escaping();
        assert!(graph.is_escaping(b));
    }

    #[test]
    fn repeated_closure_is_idempotent() {
        let universe = Universe::new(2, 1);
        let mut graph = ConnectionGraph::new(universe);
        graph.add_edge(universe.local_node(0), universe.local_node(1));
        graph.seed_escaping(universe.local_node(0));
        graph.close_escaping();
        let first = graph.escaping.clone();
        graph.close_escaping();
        assert_eq!(first, graph.escaping);
    }

    #[test]
    fn simple_local_new_does_not_escape() {
        let mut c = Compiler::new(CompilerOptions::default(), Arc::new(MockRuntime::default()));
        let l = c.locals.push(LocalType::GcRef, LocalFlags::default());
        c.locals.assign_tracked_indices(|_| true);

        let entry = c.alloc_block(mk_block(BranchKind::Return));
        c.entry_block = entry;
        c.block_mut(entry).body = BlockBodyKind::Statements(vec![Stmt {
            id: c.next_id(),
            block: entry,
            kind: StmtKind::Assign {
                dst: l,
                src: Expr::new(
                    c.next_id(),
                    ExprKind::Alloc(AllocInfo { class: ClassHandle(1), is_array: false, helper_has_side_effects: false }),
                ),
            },
        }]);

        let result = analyze(&c, None, 0);
        let idx = c.locals.get(l).tracked_index.unwrap();
        assert!(!result.graph.is_escaping(result.universe.local_node(idx)));
    }

    #[test]
    fn returned_local_escapes() {
        let mut c = Compiler::new(CompilerOptions::default(), Arc::new(MockRuntime::default()));
        let l = c.locals.push(LocalType::GcRef, LocalFlags::default());
        c.locals.assign_tracked_indices(|_| true);

        let entry = c.alloc_block(mk_block(BranchKind::Return));
        c.entry_block = entry;
        c.block_mut(entry).body = BlockBodyKind::Statements(vec![
            Stmt {
                id: c.next_id(),
                block: entry,
                kind: StmtKind::Assign {
                    dst: l,
                    src: Expr::new(
                        c.next_id(),
                        ExprKind::Alloc(AllocInfo { class: ClassHandle(1), is_array: false, helper_has_side_effects: false }),
                    ),
                },
            },
            Stmt {
                id: c.next_id(),
                block: entry,
                kind: StmtKind::Return(Some(Expr::new(c.next_id(), ExprKind::LocalRead(l)))),
            },
        ]);

        let result = analyze(&c, None, 0);
        let idx = c.locals.get(l).tracked_index.unwrap();
        assert!(result.graph.is_escaping(result.universe.local_node(idx)));
    }
}
