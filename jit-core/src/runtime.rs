//! Runtime Interface
//!
//! The host VM is an external collaborator (`spec.md` §1, §6): it supplies
//! class layouts, helper entry points, and profile data. The core never
//! touches the runtime directly -- every query goes through this trait, so
//! a test can substitute [`MockRuntime`] without standing up a real VM.

use std::collections::HashMap;

use crate::ir::{ClassHandle, StructLayout};

/// Bit flags mirroring `classAttributes` in `spec.md` §6.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassAttributes {
    pub is_delegate: bool,
    pub has_finalizer: bool,
    pub has_special_layout: bool,
}

/// Everything the core queries from the host runtime while compiling one method.
///
/// Implementations must be reentrant: multiple `Compiler` instances on
/// separate threads may call through the same `Arc<dyn RuntimeInterface>`
/// concurrently (`spec.md` §5).
pub trait RuntimeInterface: Send + Sync {
    fn is_value_class(&self, handle: ClassHandle) -> bool;
    fn can_allocate_on_stack(&self, handle: ClassHandle) -> bool;
    fn class_size(&self, handle: ClassHandle) -> u32;
    /// Includes the object header, unlike [`Self::class_size`].
    fn heap_class_size(&self, handle: ClassHandle) -> u32;
    fn class_layout(&self, handle: ClassHandle) -> Option<StructLayout>;
    fn get_helper(&self, id: u32) -> Option<u64>;
    fn class_attributes(&self, handle: ClassHandle) -> ClassAttributes;
    /// `None` means no profile data is available for this block.
    fn block_profile_count(&self, block_id: u32) -> Option<f64>;
    /// Whether `handle` is an exact (non-generic-open) handle, required for
    /// stack allocation eligibility (`spec.md` §4.7 safety gates).
    fn is_exact_handle(&self, handle: ClassHandle) -> bool;
}

/// A programmable test double. Every query defaults to a conservative
/// (pessimistic) answer unless explicitly configured, mirroring how a real
/// runtime would behave for a handle it knows nothing about.
#[derive(Debug, Default)]
pub struct MockRuntime {
    pub value_classes: HashMap<u64, bool>,
    pub stack_allocatable: HashMap<u64, bool>,
    pub sizes: HashMap<u64, u32>,
    pub heap_sizes: HashMap<u64, u32>,
    pub layouts: HashMap<u64, StructLayout>,
    pub helpers: HashMap<u32, u64>,
    pub attributes: HashMap<u64, ClassAttributes>,
    pub profile_counts: HashMap<u32, f64>,
    pub exact_handles: HashMap<u64, bool>,
}

impl RuntimeInterface for MockRuntime {
    fn is_value_class(&self, handle: ClassHandle) -> bool {
        *self.value_classes.get(&handle.0).unwrap_or(&false)
    }

    fn can_allocate_on_stack(&self, handle: ClassHandle) -> bool {
        *self.stack_allocatable.get(&handle.0).unwrap_or(&true)
    }

    fn class_size(&self, handle: ClassHandle) -> u32 {
        *self.sizes.get(&handle.0).unwrap_or(&16)
    }

    fn heap_class_size(&self, handle: ClassHandle) -> u32 {
        *self.heap_sizes.get(&handle.0).unwrap_or(&(self.class_size(handle) + 16))
    }

    fn class_layout(&self, handle: ClassHandle) -> Option<StructLayout> {
        self.layouts.get(&handle.0).cloned()
    }

    fn get_helper(&self, id: u32) -> Option<u64> {
        self.helpers.get(&id).copied()
    }

    fn class_attributes(&self, handle: ClassHandle) -> ClassAttributes {
        self.attributes.get(&handle.0).copied().unwrap_or_default()
    }

    fn block_profile_count(&self, block_id: u32) -> Option<f64> {
        self.profile_counts.get(&block_id).copied()
    }

    fn is_exact_handle(&self, handle: ClassHandle) -> bool {
        *self.exact_handles.get(&handle.0).unwrap_or(&true)
    }
}
