use crate::sync::atomic::{AtomicI64, Ordering};

#[cfg(not(any(loom, miri)))]
use super::stats;
use super::vm::{PAGE_SIZE, VmError, is_page_aligned};
#[cfg(not(any(loom, miri)))]
use super::vm::{PageOps, PlatformPageOps};

// Page-address key derivation, assuming x86-64-style 48-bit addressing:
// the low 12 bits are the page offset and the high bits are insignificant,
// leaving 36 significant middle bits. The same window comfortably covers
// the usable range on aarch64 with 4-level translation.
const PM_PAGE_BITS: usize = PAGE_SIZE.trailing_zeros() as usize;
#[cfg(not(any(loom, miri)))]
const PM_SIG_BITS: usize = 36;
#[cfg(not(any(loom, miri)))]
const PM_KEY_MASK: usize = (1 << PM_SIG_BITS) - 1;

/// Full table footprint: one word per page slot. Multiple terabytes of
/// address space, but the mapping is demand-paged; only slots actually
/// touched consume physical memory.
#[cfg(not(any(loom, miri)))]
const PM_BYTES: usize = (1 << PM_SIG_BITS) * std::mem::size_of::<i64>();

const _: () = assert!(std::mem::size_of::<AtomicI64>() == std::mem::size_of::<i64>());

/// Per-page block-boundary metadata, packed into a single signed word so the
/// table can be mutated with plain compare-and-swap.
///
/// - `0`: the page is neither the first nor the last page of a block.
/// - `+S`: the page is the first page of a block of `S` bytes.
/// - `-S`: the page is the last page of a block of `S` bytes.
///
/// Single-page blocks store only `+S` on their sole page.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct PageInfo(i64);

impl PageInfo {
    pub const EMPTY: Self = Self(0);

    pub fn head(size: usize) -> Self {
        debug_assert!(size > 0 && is_page_aligned(size));
        debug_assert!(i64::try_from(size).is_ok());
        Self(size as i64)
    }

    pub fn tail(size: usize) -> Self {
        debug_assert!(size > 0 && is_page_aligned(size));
        debug_assert!(i64::try_from(size).is_ok());
        Self(-(size as i64))
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Block size if this entry marks a block's first page.
    #[inline]
    pub fn head_size(self) -> Option<usize> {
        (self.0 > 0).then(|| self.0 as usize)
    }

    /// Block size if this entry marks a block's last page.
    #[inline]
    pub fn tail_size(self) -> Option<usize> {
        (self.0 < 0).then(|| -self.0 as usize)
    }

    #[inline]
    pub fn raw(self) -> i64 {
        self.0
    }
}

/// Flat address-indexed side table of per-page [`PageInfo`] entries.
///
/// Readers and writers are all wait-free: `get`/`set` are single atomic
/// accesses and `update` is one CAS. The CAS is the only mutation the
/// coalescing engine uses. Two racing coalescers claiming the same neighbor
/// page are arbitrated by whose boundary-clear CAS succeeds.
///
/// Out-of-range addresses alias into the table by key truncation; the caller
/// only ever passes addresses produced by the page primitive, which keeps
/// them inside the significant window by construction.
#[cfg(not(any(loom, miri)))]
pub(crate) struct PageMap {
    slots: std::ptr::NonNull<AtomicI64>,
}

#[cfg(not(any(loom, miri)))]
// Safety: PageMap owns the mapping; all slot access is atomic.
unsafe impl Send for PageMap {}
#[cfg(not(any(loom, miri)))]
// Safety: slots are only accessed through atomic operations.
unsafe impl Sync for PageMap {}

#[cfg(not(any(loom, miri)))]
impl PageMap {
    /// Reserve the table. Created once per arena, never resized.
    pub fn new() -> Result<Self, VmError> {
        // Safety: FFI reservation; the zero-filled mapping is a valid
        // all-EMPTY table because AtomicI64 is layout-compatible with i64.
        let base = unsafe { PlatformPageOps::reserve_lazy(PM_BYTES)? };
        stats::PAGE_MAP_RESERVED.add(PM_BYTES);
        Ok(Self { slots: base.cast() })
    }

    #[inline]
    fn slot(&self, addr: usize) -> &AtomicI64 {
        let key = (addr >> PM_PAGE_BITS) & PM_KEY_MASK;
        // Safety: key < 2^PM_SIG_BITS by masking, within the reservation.
        unsafe { &*self.slots.as_ptr().add(key) }
    }
}

#[cfg(not(any(loom, miri)))]
impl Drop for PageMap {
    fn drop(&mut self) {
        // Safety: we own the reservation created in `new`.
        unsafe {
            drop(PlatformPageOps::release(self.slots.cast(), PM_BYTES));
        }
        stats::PAGE_MAP_RESERVED.sub(PM_BYTES);
    }
}

// ---------------------------------------------------------------------------
// Loom/Miri mock: lazily materialised slots
//
// The real table is a multi-terabyte demand-paged reservation whose slots are
// never constructed; zero bytes already are valid atomics. Loom atomics must
// be constructed explicitly, so the mock materialises one leaked slot per
// touched page on demand. The mutex only serialises slot creation; loads,
// stores, and CAS still hit a real (loom-tracked) atomic.
// ---------------------------------------------------------------------------
#[cfg(any(loom, miri))]
pub(crate) struct PageMap {
    slots: crate::sync::Mutex<std::collections::HashMap<usize, &'static AtomicI64>>,
}

#[cfg(any(loom, miri))]
impl PageMap {
    pub fn new() -> Result<Self, VmError> {
        Ok(Self {
            slots: crate::sync::Mutex::new(std::collections::HashMap::new()),
        })
    }

    fn slot(&self, addr: usize) -> &AtomicI64 {
        // Unmasked key: heap addresses in tests must never alias.
        let key = addr >> PM_PAGE_BITS;
        let mut guard = self.slots.lock().unwrap();
        *guard
            .entry(key)
            .or_insert_with(|| Box::leak(Box::new(AtomicI64::new(0))))
    }
}

impl PageMap {
    pub fn get(&self, addr: usize) -> PageInfo {
        debug_assert!(is_page_aligned(addr));
        PageInfo(self.slot(addr).load(Ordering::SeqCst))
    }

    pub fn set(&self, addr: usize, info: PageInfo) {
        debug_assert!(is_page_aligned(addr));
        self.slot(addr).store(info.0, Ordering::SeqCst);
    }

    /// Conditional update with CAS semantics; the only mutation used by the
    /// coalescing engine.
    pub fn update(&self, addr: usize, expected: PageInfo, desired: PageInfo) -> bool {
        debug_assert!(is_page_aligned(addr));
        self.slot(addr)
            .compare_exchange(expected.0, desired.0, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}
