//! `bufmargin_targets` contains runtime code, linked into the target itself
//! during compilation.
//!
//! The instrumentation pass (`bufmargin_pass`) rewrites the target so that
//! every allocator event and every memory access calls back into this crate.
//! The runtime keeps an interval tree of live heap allocations and, for each
//! access, folds the signed distances to the enclosing allocation's
//! boundaries into two max-reduced feedback maps that the fuzzing engine
//! reads after each execution.
//!
//! Everything here is single-threaded by contract: one target process, one
//! execution at a time, reset between executions via [`__bufmargin_reset`].
#![cfg_attr(not(test), warn(
    missing_debug_implementations,
    missing_docs,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications
))]

pub mod alloc_tree;
pub mod dsf;
pub mod hooks;

pub use alloc_tree::AllocTree;
pub use dsf::*;
pub use hooks::*;

/// An address inside the instrumented target, as a pointer-width integer.
///
/// The runtime never dereferences these; they are opaque keys into the
/// registry.
pub type TargetAddr = usize;

/// A per-instrumentation-site provenance tag, embedded as an immediate in
/// the rewritten target. Only used to decorrelate feedback-map slots.
pub type SiteTag = u32;
