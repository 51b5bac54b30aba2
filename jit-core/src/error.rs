//! Error Handling
//!
//! This module provides the two error categories described by the core's
//! contract with its callers: fatal invariant violations (`CompilerError`),
//! which indicate a compiler defect and abort the compilation, and give-ups
//! (`GiveUp`), which are not errors at all -- a pass declines an optimization
//! for a well-formed reason and the core proceeds without it.
//!
//! # Error Categories
//! - **Fatal**: invariant violations raised by the consistency checker or an
//!   internal assertion. No recovery path; the caller releases the arena.
//! - **Give-up**: the loop cloner, escape analyzer, or iteration-analysis
//!   helper may decline to produce a result. These carry a short reason
//!   string for diagnostics and are threaded through `Result<T, GiveUp>`,
//!   never through `CompilerError`.

use std::borrow::Cow;
use thiserror::Error;

use crate::cfg::BlockId;

/// Fatal invariant violations and unrecoverable failures.
///
/// All variants are zero-cost (no heap allocation beyond the owned strings
/// needed to name the violation precisely, as required by `spec.md` §7.1:
/// every fatal error names the violated invariant, the offending
/// block/statement id, and the pass under which the check ran).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompilerError {
    /// A named consistency-checker invariant failed.
    #[error("[{pass}] invariant {invariant} violated at block {block:?}: {detail}")]
    Invariant {
        pass: &'static str,
        invariant: &'static str,
        block: Option<BlockId>,
        detail: String,
    },

    /// An IR node id collided with another (violates P5: global uniqueness).
    #[error("[{pass}] duplicate node id {id}")]
    DuplicateId { pass: &'static str, id: u64 },

    /// The runtime interface reported a failure (out of memory, bad handle, etc).
    #[error("runtime interface failure: {0}")]
    RuntimeFailure(String),

    /// The compilation arena could not satisfy an allocation.
    #[error("arena exhausted: {0}")]
    Arena(String),

    /// The caller set the cancellation flag between passes.
    #[error("compilation cancelled")]
    Cancelled,
}

/// A pass declined to produce an optimized result for a well-formed reason.
///
/// This is deliberately not part of [`CompilerError`]: giving up on loop
/// cloning because the size budget was exceeded, or on iteration analysis
/// because the limit isn't a recognized form, is expected, routine behavior,
/// not a compiler defect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GiveUp {
    pub reason: Cow<'static, str>,
}

impl GiveUp {
    pub fn new(reason: impl Into<Cow<'static, str>>) -> Self {
        Self { reason: reason.into() }
    }
}

impl std::fmt::Display for GiveUp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.reason)
    }
}

impl std::error::Error for GiveUp {}

/// Convenience macro mirroring the teacher's early-return validation style
/// (see `validator.rs`), but producing a [`GiveUp`] instead of aborting.
#[macro_export]
macro_rules! give_up {
    ($($arg:tt)*) => {
        return Err($crate::error::GiveUp::new(format!($($arg)*)))
    };
}
