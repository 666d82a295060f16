//! Hook entry points called by the code `bufmargin_pass` inserts into the
//! target.
//!
//! The symbol names and signatures here are the binary contract with the
//! pass: addresses and sizes are pointer-width integers, site tags are
//! 32 bit. Allocation-lifecycle hooks mutate the live-allocation registry;
//! access hooks score margins into the feedback maps. None of them can
//! fail: events for untracked memory are silent no-ops, because allocator
//! activity from before instrumentation attached (or through unrecognized
//! paths) is expected.

use core::ptr::addr_of_mut;

use log::trace;
use meminterval::Interval;

use crate::{
    alloc_tree::AllocTree,
    dsf::{dsf_max, reset_maps, BUF_END_MAP, BUF_MAP_SIZE, BUF_START_MAP},
    SiteTag, TargetAddr,
};

/// Near-miss window for resolving an access to an allocation, in bytes.
///
/// An access landing within this many bytes of a live range still resolves
/// to it, so accesses just past an edge keep scoring. One allocator
/// alignment quantum; anything further has no meaningful proximity signal.
pub const ACCESS_SLACK: usize = 16;

/// The live-allocation registry for the current execution.
static mut ALLOC_TREE: Option<AllocTree> = None;

#[inline]
fn alloc_tree() -> &'static mut AllocTree {
    unsafe { (*addr_of_mut!(ALLOC_TREE)).get_or_insert_with(AllocTree::new) }
}

/// Signed distances from an access at `addr` of `size` bytes to the
/// boundaries of `interval`: `(start - addr, addr + size - end)`.
///
/// A positive start margin means the access begins before the allocation
/// (underflow); a positive end margin means it runs past the end
/// (overflow); non-positive margins are safe.
#[inline]
#[must_use]
pub fn margins(interval: &Interval<TargetAddr>, addr: TargetAddr, size: usize) -> (isize, isize) {
    let under = interval.start.wrapping_sub(addr) as isize;
    let over = addr.wrapping_add(size).wrapping_sub(interval.end) as isize;
    (under, over)
}

/// Folds an access-site tag and an allocation-site tag into a map slot.
#[inline]
#[must_use]
pub fn dsf_slot(k: SiteTag, alloc_site: SiteTag) -> usize {
    let k = k as usize;
    ((k >> 4) ^ (k << 8) ^ alloc_site as usize) & (BUF_MAP_SIZE - 1)
}

/// Tracks the result of a `malloc`-shaped allocation.
///
/// Zero-size allocations are not tracked: `[p, p)` is not a valid interval
/// and a zero-byte buffer has no interior to approach. The later `free` is
/// the ordinary untracked no-op.
///
/// # Safety
/// Mutates the process-global registry; single-threaded target contract.
#[no_mangle]
pub unsafe extern "C" fn __bufmargin_handle_malloc(k: SiteTag, ptr: TargetAddr, size: usize) {
    trace!("malloc - k: {k:#x}, ptr: {ptr:#x}, size: {size:#x}");
    let end = ptr.wrapping_add(size);
    if size == 0 || end < ptr {
        return;
    }
    alloc_tree().insert(ptr, end, k);
}

/// Tracks the result of a `calloc`-shaped allocation.
///
/// Overflow of the element product is the target's own bug and is not
/// re-validated here; the wrapped value is tracked as-is.
///
/// # Safety
/// See [`__bufmargin_handle_malloc`].
#[no_mangle]
pub unsafe extern "C" fn __bufmargin_handle_calloc(
    k: SiteTag,
    ptr: TargetAddr,
    elem_size: usize,
    elem_cnt: usize,
) {
    trace!("calloc - k: {k:#x}, ptr: {ptr:#x}, elem_size: {elem_size:#x}, elem_cnt: {elem_cnt:#x}");
    __bufmargin_handle_malloc(k, ptr, elem_size.wrapping_mul(elem_cnt));
}

/// Tracks a `realloc`-shaped resize: the old range is dropped, the new one
/// inserted. Correct for in-place resizes too, because the insert happens
/// after the removal.
///
/// # Safety
/// See [`__bufmargin_handle_malloc`].
#[no_mangle]
pub unsafe extern "C" fn __bufmargin_handle_realloc(
    k: SiteTag,
    old_ptr: TargetAddr,
    new_ptr: TargetAddr,
    size: usize,
) {
    trace!("realloc - k: {k:#x}, old_ptr: {old_ptr:#x}, new_ptr: {new_ptr:#x}, size: {size:#x}");
    let tree = alloc_tree();
    tree.remove_all_overlapping(old_ptr, old_ptr);
    let end = new_ptr.wrapping_add(size);
    if size > 0 && end > new_ptr {
        tree.insert(new_ptr, end, k);
    }
}

/// Untracks the allocation containing `ptr`. A no-op when `ptr` is
/// untracked, including the second call of a double free.
///
/// # Safety
/// See [`__bufmargin_handle_malloc`].
#[no_mangle]
pub unsafe extern "C" fn __bufmargin_handle_free(ptr: TargetAddr) {
    trace!("free - ptr: {ptr:#x}");
    alloc_tree().remove_all_overlapping(ptr, ptr);
}

/// Scores one access of `size` bytes at `ptr` from access site `k`.
///
/// Resolves `ptr` against the registry (with the [`ACCESS_SLACK`] near-miss
/// window), computes both margins and max-folds them, truncated to the map
/// counter width, into the slot derived from `k` and the allocation's site
/// tag. Accesses to untracked memory contribute nothing.
///
/// # Safety
/// Reads the registry and writes the `static mut` maps; single-threaded
/// target contract.
#[no_mangle]
pub unsafe extern "C" fn __bufmargin_access(k: SiteTag, ptr: TargetAddr, size: usize) {
    let Some((interval, site)) = alloc_tree().find_first_overlap_near(ptr, ACCESS_SLACK) else {
        return;
    };
    let (under, over) = margins(&interval, ptr, size);
    let slot = dsf_slot(k, site);
    dsf_max(addr_of_mut!(BUF_START_MAP), slot, under as u32);
    dsf_max(addr_of_mut!(BUF_END_MAP), slot, over as u32);
}

/// Unit-sized fallback access hook: scores every access as a single byte.
///
/// For targets where static type store sizes are unreliable; the size-aware
/// [`__bufmargin_access`] is authoritative.
///
/// # Safety
/// See [`__bufmargin_access`].
#[no_mangle]
pub unsafe extern "C" fn __bufmargin_access1(k: SiteTag, ptr: TargetAddr) {
    __bufmargin_access(k, ptr, 1);
}

/// Forgets all tracked allocations and zeroes both feedback maps.
///
/// The explicit per-execution reset point: the harness calls this before
/// each run of the target, where a forking harness would get the same
/// effect from the fresh address space.
///
/// # Safety
/// Replaces the process-global registry; single-threaded target contract.
#[no_mangle]
pub unsafe extern "C" fn __bufmargin_reset() {
    *addr_of_mut!(ALLOC_TREE) = None;
    reset_maps();
}

/// The live interval containing `addr`, if any. Engine-side introspection
/// and test support; the hot path goes through [`__bufmargin_access`].
///
/// # Safety
/// Reads the process-global registry; single-threaded target contract.
#[must_use]
pub unsafe fn live_interval(addr: TargetAddr) -> Option<(Interval<TargetAddr>, SiteTag)> {
    alloc_tree().find_first_overlap(addr)
}
