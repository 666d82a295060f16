//! The domain-specific feedback maps, as static mut arrays.
//!
//! Two parallel maps rather than one, so underflow-prone and overflow-prone
//! inputs are rewarded independently and do not cancel out in a single
//! max-reduction: `__bufmargin_start_dsf` holds start (underflow) margins,
//! `__bufmargin_end_dsf` holds end (overflow) margins. The engine side
//! applies a `MAX` reduction per slot when merging; the runtime here only
//! ever raises slots and never reads them back for control flow.

use core::ptr::addr_of_mut;

/// The number of slots in each feedback map.
pub const BUF_MAP_SIZE: usize = 65536;

/// The start-margin (underflow proximity) feedback map.
#[no_mangle]
pub static mut __bufmargin_start_dsf: [u32; BUF_MAP_SIZE] = [0; BUF_MAP_SIZE];

pub use __bufmargin_start_dsf as BUF_START_MAP;

/// The end-margin (overflow proximity) feedback map.
#[no_mangle]
pub static mut __bufmargin_end_dsf: [u32; BUF_MAP_SIZE] = [0; BUF_MAP_SIZE];

pub use __bufmargin_end_dsf as BUF_END_MAP;

/// Gets the start-margin map as a mutable slice, for the engine side.
///
/// # Safety
/// The map is a plain `static mut` written by the running target; only call
/// this while the target is not executing.
#[must_use]
pub unsafe fn buf_start_map_mut_slice<'a>() -> &'a mut [u32] {
    &mut *addr_of_mut!(BUF_START_MAP)
}

/// Gets the end-margin map as a mutable slice, for the engine side.
///
/// # Safety
/// See [`buf_start_map_mut_slice`].
#[must_use]
pub unsafe fn buf_end_map_mut_slice<'a>() -> &'a mut [u32] {
    &mut *addr_of_mut!(BUF_END_MAP)
}

/// Zeroes both feedback maps to their initial value.
///
/// # Safety
/// Writes the `static mut` maps; single-threaded callers only.
pub unsafe fn reset_maps() {
    (*addr_of_mut!(BUF_START_MAP)).fill(0);
    (*addr_of_mut!(BUF_END_MAP)).fill(0);
}

/// Raises `map[slot]` to `value` if `value` is larger (the `MAX` reduction).
///
/// # Safety
/// `slot` must be in bounds; this is the unchecked hot path.
#[inline]
pub unsafe fn dsf_max(map: *mut [u32; BUF_MAP_SIZE], slot: usize, value: u32) {
    let cell = (*map).get_unchecked_mut(slot);
    if value > *cell {
        *cell = value;
    }
}

#[cfg(test)]
mod tests {
    use core::ptr::addr_of_mut;

    use serial_test::serial;

    use super::{buf_end_map_mut_slice, dsf_max, reset_maps, BUF_END_MAP};

    #[test]
    #[serial]
    fn test_max_reduction() {
        unsafe {
            reset_maps();
            dsf_max(addr_of_mut!(BUF_END_MAP), 42, 3);
            dsf_max(addr_of_mut!(BUF_END_MAP), 42, 8);
            dsf_max(addr_of_mut!(BUF_END_MAP), 42, 5);
            assert_eq!(buf_end_map_mut_slice()[42], 8);
            reset_maps();
            assert_eq!(buf_end_map_mut_slice()[42], 0);
        }
    }
}
