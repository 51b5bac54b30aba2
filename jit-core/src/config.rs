//! Compiler Configuration
//!
//! Every option a pass may consult, with the defaults from `spec.md` §6's
//! configuration table. There is no persisted state and no wire protocol:
//! `CompilerOptions` is constructed once per compilation and handed to
//! [`crate::compiler::Compiler::new`].

/// Options shared by every pass in the pipeline.
///
/// Derives `Serialize`/`Deserialize` so a host can load these from a project
/// config file rather than hand-constructing `Default::default()` overrides,
/// the way the teacher's own tunable structs round-trip through `serde_json`.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct CompilerOptions {
    /// Maximum object size, bytes, eligible for stack allocation.
    pub stack_alloc_max_size: u32,
    /// Enable field-granularity escape tracking on structs.
    pub track_struct_fields: bool,
    /// Enable the pseudo-node/cloning path of the conditional escape analysis.
    pub enable_conditional_escape: bool,
    /// Maximum deref-tree depth the loop cloner will synthesize conditions for.
    pub deref_tree_max_depth: u32,
    /// Maximum per-region cloned-block complexity before the cloner gives up.
    pub clone_size_limit: u32,
    /// Weight share assigned to the fast path after cloning.
    pub fast_path_weight: f64,
    /// Non-zero enables deterministic list-shuffling stress mode, seeded per method.
    pub stress_hash: u64,
    /// Enable the flowgraph consistency checker between passes.
    pub debug_checks: bool,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self {
            stack_alloc_max_size: 512,
            track_struct_fields: false,
            enable_conditional_escape: true,
            deref_tree_max_depth: 3,
            clone_size_limit: 4096,
            fast_path_weight: 0.99,
            stress_hash: 0,
            debug_checks: cfg!(debug_assertions),
        }
    }
}

impl CompilerOptions {
    /// Weight share assigned to the slow path, derived from `fast_path_weight`
    /// so the two always sum to exactly 1.0 (`spec.md` §4.6 step 5).
    pub fn slow_path_weight(&self) -> f64 {
        1.0 - self.fast_path_weight
    }
}
