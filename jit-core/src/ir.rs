//! IR Tree Surface
//!
//! The minimal statement/expression/local shape the core consumes from the
//! (out of scope) bytecode importer. This is not the importer: it only
//! defines the data the core's passes read and rewrite -- locals and their
//! layouts, and the tree nodes the loop cloner and escape analyzer walk
//! (allocation sites, field accesses, indirections, bounds checks, and
//! guarded-devirtualization test nodes).
//!
//! Every node (`Stmt`, `Expr`) carries a globally unique id drawn from
//! [`crate::compiler::Compiler`]'s monotonic counter, satisfying P5.

use std::collections::HashMap;

use crate::cfg::BlockId;

/// Index of a local variable in [`crate::compiler::Compiler::locals`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalId(pub u32);

/// Opaque handle into the host runtime's class/method-table universe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassHandle(pub u64);

/// Semantic type of a local, independent of its physical layout.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LocalType {
    Int,
    GcRef,
    ByRef,
    Float,
    Struct(StructLayout),
}

/// GC-tracking kind of one slot inside a struct layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GcSlotKind {
    None,
    Reference,
    ByRef,
}

/// Physical layout of a struct-typed local (`spec.md` §3).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StructLayout {
    pub size_bytes: u32,
    pub slot_count: u32,
    pub gc_slots: Vec<GcSlotKind>,
    pub padding_bytes: u32,
}

/// A local-variable descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct Local {
    pub id: LocalId,
    pub ty: LocalType,
    pub address_exposed: bool,
    pub is_param: bool,
    pub is_osr: bool,
    pub is_implicit_byref: bool,
    /// Contiguous tracked-bit index among locals of interest, if tracked.
    pub tracked_index: Option<u32>,
}

impl Local {
    pub fn is_tracked(&self) -> bool {
        self.tracked_index.is_some()
    }
}

/// Allocation-site marker data (`new T()`, `new T[n]`, boxing).
#[derive(Debug, Clone, PartialEq)]
pub struct AllocInfo {
    pub class: ClassHandle,
    pub is_array: bool,
    pub helper_has_side_effects: bool,
}

/// Binary operators relevant to condition synthesis in the loop cloner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    /// The operator that holds when operands are swapped: `a op b` iff `b rev(op) a`.
    pub fn reversed(self) -> CmpOp {
        match self {
            CmpOp::Eq => CmpOp::Eq,
            CmpOp::Ne => CmpOp::Ne,
            CmpOp::Lt => CmpOp::Gt,
            CmpOp::Le => CmpOp::Ge,
            CmpOp::Gt => CmpOp::Lt,
            CmpOp::Ge => CmpOp::Le,
        }
    }

    /// True for the identity-implying operators (`spec.md` §4.6 static evaluation:
    /// `a op a` is `true` for `{=, <=, >=}`).
    pub fn identity_is_true(self) -> bool {
        matches!(self, CmpOp::Eq | CmpOp::Le | CmpOp::Ge)
    }
}

/// Arithmetic operator for induction-variable stride updates (`spec.md`
/// §4.5 `iv += stride`). Kept deliberately minimal: the core only ever
/// needs to recognize a stride update, not evaluate arbitrary arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArithOp {
    Add,
    Sub,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    /// Read of a tracked or untracked local.
    LocalRead(LocalId),
    /// Constant integer.
    ConstInt(i64),
    /// Value of unknown provenance (call result load, non-tracked memory read).
    Unknown,
    /// Dereference of an address-valued expression. `non_faulting` and
    /// `not_heap` are set by the escape analyzer's stack-allocation rewrite.
    Indirect {
        addr: Box<Expr>,
        non_faulting: bool,
        not_heap: bool,
    },
    /// `index op bound` guard preceding an array access; bashed to a no-op
    /// comma by the loop cloner's fast path.
    BoundsCheck {
        index: Box<Expr>,
        bound: Box<Expr>,
        disabled: bool,
    },
    /// Field read through a (possibly struct-typed) base.
    FieldRead { base: Box<Expr>, field: u32 },
    /// Length of an array/collection reference.
    Length(Box<Expr>),
    /// Comparison, used both in source code and in synthesized clone conditions.
    Cmp(CmpOp, Box<Expr>, Box<Expr>),
    /// Simple arithmetic, recognized by iteration analysis as a stride update.
    BinArith(ArithOp, Box<Expr>, Box<Expr>),
    /// Guarded-devirtualization type test: `indir(local) == class`.
    /// `constant` is `Some(v)` once the loop cloner has specialized this test
    /// on the fast (`true`) or slow (`false`) path.
    GdvTest {
        local: LocalId,
        class: ClassHandle,
        constant: Option<bool>,
    },
    /// A heap/stack allocation site.
    Alloc(AllocInfo),
    /// Call to a helper or user method; `no_escape_args` lists argument
    /// positions the callee is known not to let escape.
    Call {
        target: u64,
        args: Vec<Expr>,
        no_escape_args: Vec<bool>,
    },
    /// Sequencing: evaluate `first` for side effects, yield `second`.
    Comma(Box<Expr>, Box<Expr>),
    /// A node the block cloner must refuse to duplicate (models the source's
    /// "cloner declines" outcome for opaque side-effecting constructs).
    NotCloneable,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub id: u64,
    pub kind: ExprKind,
}

impl Expr {
    pub fn new(id: u64, kind: ExprKind) -> Self {
        Self { id, kind }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    Assign { dst: LocalId, src: Expr },
    FieldAssign { base: Expr, field: u32, src: Expr },
    StoreStatic { static_id: u32, src: Expr },
    Expr(Expr),
    Return(Option<Expr>),
    Throw(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub id: u64,
    pub block: BlockId,
    pub kind: StmtKind,
}

/// A block's body: a statement list, or (after the one-way flag flip to
/// linear form) a flat instruction range. Mutually exclusive per block
/// (`spec.md` §3 invariant 5).
#[derive(Debug, Clone, PartialEq)]
pub enum BlockBodyKind {
    Statements(Vec<Stmt>),
    Linear { start: u32, end: u32 },
}

/// Walks `expr`, invoking `f` on every `LocalRead`/write-adjacent local use.
/// Used by both the escape analyzer (to find edge sources) and the cloner's
/// deref-closure analysis (to find index/base locals).
pub fn for_each_local_use(expr: &Expr, f: &mut impl FnMut(LocalId)) {
    match &expr.kind {
        ExprKind::LocalRead(l) => f(*l),
        ExprKind::GdvTest { local, .. } => f(*local),
        ExprKind::Indirect { addr, .. } => for_each_local_use(addr, f),
        ExprKind::BoundsCheck { index, bound, .. } => {
            for_each_local_use(index, f);
            for_each_local_use(bound, f);
        }
        ExprKind::FieldRead { base, .. } => for_each_local_use(base, f),
        ExprKind::Length(inner) => for_each_local_use(inner, f),
        ExprKind::Cmp(_, a, b) => {
            for_each_local_use(a, f);
            for_each_local_use(b, f);
        }
        ExprKind::BinArith(_, a, b) => {
            for_each_local_use(a, f);
            for_each_local_use(b, f);
        }
        ExprKind::Call { args, .. } => {
            for arg in args {
                for_each_local_use(arg, f);
            }
        }
        ExprKind::Comma(a, b) => {
            for_each_local_use(a, f);
            for_each_local_use(b, f);
        }
        ExprKind::ConstInt(_)
        | ExprKind::Unknown
        | ExprKind::Alloc(_)
        | ExprKind::NotCloneable => {}
    }
}

/// Replaces every occurrence of `from` with a fresh `LocalRead(to)` in `expr`.
/// Mirrors `cloneBlockState`'s `replaceLocal`/`replaceWith` contract
/// (`spec.md` §4.1): returns `None` if a [`ExprKind::NotCloneable`] node is
/// reached, signaling the clone must be discarded.
pub fn clone_expr_replacing(
    expr: &Expr,
    from: LocalId,
    to: LocalId,
    next_id: &mut impl FnMut() -> u64,
) -> Option<Expr> {
    let kind = match &expr.kind {
        ExprKind::LocalRead(l) => ExprKind::LocalRead(if *l == from { to } else { *l }),
        ExprKind::ConstInt(v) => ExprKind::ConstInt(*v),
        ExprKind::Unknown => ExprKind::Unknown,
        ExprKind::Indirect { addr, non_faulting, not_heap } => ExprKind::Indirect {
            addr: Box::new(clone_expr_replacing(addr, from, to, next_id)?),
            non_faulting: *non_faulting,
            not_heap: *not_heap,
        },
        ExprKind::BoundsCheck { index, bound, disabled } => ExprKind::BoundsCheck {
            index: Box::new(clone_expr_replacing(index, from, to, next_id)?),
            bound: Box::new(clone_expr_replacing(bound, from, to, next_id)?),
            disabled: *disabled,
        },
        ExprKind::FieldRead { base, field } => ExprKind::FieldRead {
            base: Box::new(clone_expr_replacing(base, from, to, next_id)?),
            field: *field,
        },
        ExprKind::Length(inner) => {
            ExprKind::Length(Box::new(clone_expr_replacing(inner, from, to, next_id)?))
        }
        ExprKind::Cmp(op, a, b) => ExprKind::Cmp(
            *op,
            Box::new(clone_expr_replacing(a, from, to, next_id)?),
            Box::new(clone_expr_replacing(b, from, to, next_id)?),
        ),
        ExprKind::BinArith(op, a, b) => ExprKind::BinArith(
            *op,
            Box::new(clone_expr_replacing(a, from, to, next_id)?),
            Box::new(clone_expr_replacing(b, from, to, next_id)?),
        ),
        ExprKind::GdvTest { local, class, constant } => ExprKind::GdvTest {
            local: if *local == from { to } else { *local },
            class: *class,
            constant: *constant,
        },
        ExprKind::Alloc(info) => ExprKind::Alloc(info.clone()),
        ExprKind::Call { target, args, no_escape_args } => {
            let mut new_args = Vec::with_capacity(args.len());
            for a in args {
                new_args.push(clone_expr_replacing(a, from, to, next_id)?);
            }
            ExprKind::Call {
                target: *target,
                args: new_args,
                no_escape_args: no_escape_args.clone(),
            }
        }
        ExprKind::Comma(a, b) => ExprKind::Comma(
            Box::new(clone_expr_replacing(a, from, to, next_id)?),
            Box::new(clone_expr_replacing(b, from, to, next_id)?),
        ),
        ExprKind::NotCloneable => return None,
    };
    Some(Expr::new(next_id(), kind))
}

/// Per-statement clone, delegating expression cloning to [`clone_expr_replacing`].
pub fn clone_stmt_replacing(
    stmt: &Stmt,
    dst_block: BlockId,
    from: LocalId,
    to: LocalId,
    next_id: &mut impl FnMut() -> u64,
) -> Option<Stmt> {
    let kind = match &stmt.kind {
        StmtKind::Assign { dst, src } => StmtKind::Assign {
            dst: if *dst == from { to } else { *dst },
            src: clone_expr_replacing(src, from, to, next_id)?,
        },
        StmtKind::FieldAssign { base, field, src } => StmtKind::FieldAssign {
            base: clone_expr_replacing(base, from, to, next_id)?,
            field: *field,
            src: clone_expr_replacing(src, from, to, next_id)?,
        },
        StmtKind::StoreStatic { static_id, src } => StmtKind::StoreStatic {
            static_id: *static_id,
            src: clone_expr_replacing(src, from, to, next_id)?,
        },
        StmtKind::Expr(e) => StmtKind::Expr(clone_expr_replacing(e, from, to, next_id)?),
        StmtKind::Return(e) => StmtKind::Return(match e {
            Some(e) => Some(clone_expr_replacing(e, from, to, next_id)?),
            None => None,
        }),
        StmtKind::Throw(e) => StmtKind::Throw(clone_expr_replacing(e, from, to, next_id)?),
    };
    Some(Stmt { id: next_id(), block: dst_block, kind })
}

/// Lookup table from local id to its descriptor; a thin wrapper so passes
/// don't each re-derive "locals indexed by id" bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct LocalTable {
    locals: Vec<Local>,
}

impl LocalTable {
    pub fn push(&mut self, ty: LocalType, flags: LocalFlags) -> LocalId {
        let id = LocalId(self.locals.len() as u32);
        self.locals.push(Local {
            id,
            ty,
            address_exposed: flags.address_exposed,
            is_param: flags.is_param,
            is_osr: flags.is_osr,
            is_implicit_byref: flags.is_implicit_byref,
            tracked_index: None,
        });
        id
    }

    pub fn get(&self, id: LocalId) -> &Local {
        &self.locals[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: LocalId) -> &mut Local {
        &mut self.locals[id.0 as usize]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Local> {
        self.locals.iter()
    }

    pub fn len(&self) -> usize {
        self.locals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locals.is_empty()
    }

    /// Assigns contiguous tracked-bit indices to every local for which
    /// `is_of_interest` holds, in ascending `LocalId` order.
    pub fn assign_tracked_indices(&mut self, mut is_of_interest: impl FnMut(&Local) -> bool) {
        let mut next = 0u32;
        for local in self.locals.iter_mut() {
            if is_of_interest(local) {
                local.tracked_index = Some(next);
                next += 1;
            } else {
                local.tracked_index = None;
            }
        }
    }

    pub fn tracked_count(&self) -> u32 {
        self.locals.iter().filter(|l| l.tracked_index.is_some()).count() as u32
    }

    pub fn by_tracked_index(&self) -> HashMap<u32, LocalId> {
        self.locals
            .iter()
            .filter_map(|l| l.tracked_index.map(|t| (t, l.id)))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFlags {
    pub address_exposed: bool,
    pub is_param: bool,
    pub is_osr: bool,
    pub is_implicit_byref: bool,
}
