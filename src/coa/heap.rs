//! Malloc-family adapters over a process-wide [`CoalescingArena`].
//!
//! These are thin wrappers: round sizes up to whole pages, check arithmetic,
//! zero or copy memory, and translate errors to null returns. All policy
//! lives in the arena.

use std::alloc::{GlobalAlloc, Layout};
use std::ptr::NonNull;

use crate::sync::OnceLock;

use super::arena::CoalescingArena;
use super::stats;
use super::vm::{PAGE_SIZE, VmError, page_ceil};

static GLOBAL_ARENA: OnceLock<CoalescingArena> = OnceLock::new();

/// Handle to the process-wide arena behind the malloc-family functions.
/// Initialization is one-shot; the first allocation triggers it implicitly.
pub struct GlobalHeap;

impl GlobalHeap {
    fn ensure_initialized() -> Result<&'static CoalescingArena, VmError> {
        if let Some(arena) = GLOBAL_ARENA.get() {
            return Ok(arena);
        }

        let candidate = CoalescingArena::new()?;
        drop(GLOBAL_ARENA.set(candidate));
        Ok(GLOBAL_ARENA
            .get()
            .expect("GlobalHeap should be initialized"))
    }

    /// Initialize the process-wide arena eagerly.
    ///
    /// # Panics
    ///
    /// Panics if initialization fails (e.g. out of memory).
    pub fn init() {
        if let Err(e) = Self::ensure_initialized() {
            panic!("Failed to init GlobalHeap: {e:?}");
        }
    }

    /// Initialize and pre-charge the arena with `initial_pages` pages from
    /// the OS as one free block.
    ///
    /// # Panics
    ///
    /// Panics if initialization or the reservation fails.
    pub fn init_with_pages(initial_pages: usize) {
        let arena = match Self::ensure_initialized() {
            Ok(arena) => arena,
            Err(e) => panic!("Failed to init GlobalHeap: {e:?}"),
        };
        if initial_pages > 0 {
            if let Err(e) = arena.reserve_pages(initial_pages) {
                panic!("Failed to pre-charge GlobalHeap: {e:?}");
            }
        }
    }

    pub fn get() -> Option<&'static CoalescingArena> {
        GLOBAL_ARENA.get()
    }
}

/// Allocate at least `size` bytes, rounded up to whole pages. The first call
/// initializes the heap. Returns null on out-of-memory.
pub fn malloc(size: usize) -> *mut u8 {
    let Ok(arena) = GlobalHeap::ensure_initialized() else {
        return std::ptr::null_mut();
    };
    match arena.alloc(size) {
        Ok(p) => p.as_ptr(),
        Err(_) => std::ptr::null_mut(),
    }
}

/// Null-safe free.
///
/// # Safety
///
/// `ptr` must be null or a live pointer produced by this module's allocation
/// functions, and must not be used after this call.
pub unsafe fn free(ptr: *mut u8) {
    let Some(ptr) = NonNull::new(ptr) else {
        return;
    };
    let arena = GLOBAL_ARENA
        .get()
        .expect("free called before any allocation");
    // Safety: contract forwarded to the caller.
    unsafe { arena.free(ptr) };
}

/// Null-safe free that keeps merging until neither neighbor yields. Plain
/// [`free`] stops after one backward and one forward attempt, which is
/// already maximal for sequential histories; this variant also closes the
/// transient gaps concurrent frees can leave behind.
///
/// # Safety
///
/// Same contract as [`free`].
pub unsafe fn free_recursive(ptr: *mut u8) {
    let Some(ptr) = NonNull::new(ptr) else {
        return;
    };
    let arena = GLOBAL_ARENA
        .get()
        .expect("free called before any allocation");
    // Safety: contract forwarded to the caller.
    unsafe { arena.free_coalesce_all(ptr) };
}

/// `n` zero-filled elements of `size` bytes. Returns null when `n` is zero
/// or `n * size` overflows.
pub fn calloc(n: usize, size: usize) -> *mut u8 {
    if n == 0 {
        return std::ptr::null_mut();
    }
    let Some(total) = n.checked_mul(size) else {
        return std::ptr::null_mut();
    };

    let ptr = malloc(total);
    if !ptr.is_null() {
        // A recycled block may hold stale data; only fresh OS regions are
        // known-zero, and we cannot tell which one we got.
        // Safety: the block is at least `total` bytes and exclusively ours.
        unsafe { std::ptr::write_bytes(ptr, 0, total) };
    }
    ptr
}

/// Grow or shrink `ptr` to `size` bytes.
///
/// Null `ptr` behaves as `malloc(size)`; `size == 0` frees and returns null;
/// a request within the current block returns `ptr` unchanged; growth
/// allocates, copies the old contents, and frees the old block.
///
/// # Safety
///
/// `ptr` must be null or a live pointer produced by this module, and is
/// invalidated whenever a different pointer (or null, for `size == 0`) is
/// returned.
pub unsafe fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
    let Some(nn) = NonNull::new(ptr) else {
        return malloc(size);
    };

    let arena = GLOBAL_ARENA
        .get()
        .expect("realloc called before any allocation");
    // Safety: live block per contract.
    let block_size = unsafe { arena.usable_size(nn) };

    if size == 0 {
        // Safety: contract forwarded.
        unsafe { free(ptr) };
        return std::ptr::null_mut();
    }

    if size <= block_size {
        return ptr;
    }

    let new_ptr = malloc(size);
    if !new_ptr.is_null() {
        // Safety: disjoint blocks, both at least `block_size` bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(ptr, new_ptr, block_size);
            free(ptr);
        }
    }
    new_ptr
}

/// Size of the block behind `ptr` (a page multiple); 0 for null.
///
/// # Safety
///
/// `ptr` must be null or a live pointer produced by this module.
pub unsafe fn malloc_usable_size(ptr: *mut u8) -> usize {
    let Some(nn) = NonNull::new(ptr) else {
        return 0;
    };
    let arena = GLOBAL_ARENA
        .get()
        .expect("malloc_usable_size called before any allocation");
    // Safety: contract forwarded.
    unsafe { arena.usable_size(nn) }
}

/// Aligned allocation. Every block is page-aligned already, so any
/// `alignment <= PAGE_SIZE` is satisfied by plain `malloc`; larger
/// alignments are outside the contract.
///
/// Returns 0 on success or `ENOMEM`.
///
/// # Safety
///
/// `memptr` must be valid for a pointer write.
pub unsafe fn posix_memalign(memptr: *mut *mut u8, alignment: usize, size: usize) -> i32 {
    debug_assert!(
        alignment <= PAGE_SIZE,
        "alignment beyond one page is unsupported"
    );

    let ptr = malloc(size);
    if ptr.is_null() {
        return libc::ENOMEM;
    }
    // Safety: memptr valid per contract.
    unsafe { memptr.write(ptr) };
    0
}

pub fn aligned_alloc(alignment: usize, size: usize) -> *mut u8 {
    let mut ptr = std::ptr::null_mut();
    // Safety: out-slot is a local.
    let ret = unsafe { posix_memalign(&mut ptr, alignment, size) };
    if ret != 0 {
        return std::ptr::null_mut();
    }
    ptr
}

pub fn valloc(size: usize) -> *mut u8 {
    aligned_alloc(PAGE_SIZE, size)
}

pub fn memalign(alignment: usize, size: usize) -> *mut u8 {
    aligned_alloc(alignment, size)
}

/// Like `valloc`, but the request itself is first rounded up to a whole
/// page.
pub fn pvalloc(size: usize) -> *mut u8 {
    let Some(size) = page_ceil(size) else {
        return std::ptr::null_mut();
    };
    aligned_alloc(PAGE_SIZE, size)
}

/// Process-wide allocator statistics snapshot (diagnostic only).
#[derive(Clone, Copy, Debug)]
pub struct HeapStats {
    pub os_regions: usize,
    pub os_bytes: usize,
    pub page_map_reserved: usize,
    pub node_region_bytes: usize,
}

pub fn heap_stats() -> HeapStats {
    HeapStats {
        os_regions: stats::OS_REGIONS_ACQUIRED.get(),
        os_bytes: stats::OS_BYTES_ACQUIRED.get(),
        page_map_reserved: stats::PAGE_MAP_RESERVED.get(),
        node_region_bytes: stats::NODE_REGION_BYTES.get(),
    }
}

/// `GlobalAlloc` over the process-wide arena.
///
/// Page-granular: economical only for page-scale payloads, but safe to
/// install as `#[global_allocator]`: the tree's node storage and the page
/// map are fed straight from the page primitive, so the allocator never
/// re-enters itself.
pub struct CoaAlloc;

// Safety: all state is behind the concurrent arena; alignment above one page
// is rejected with null as the GlobalAlloc contract allows.
unsafe impl GlobalAlloc for CoaAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > PAGE_SIZE {
            return std::ptr::null_mut();
        }
        malloc(layout.size())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        // Safety: GlobalAlloc contract matches free's.
        unsafe { free(ptr) };
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > PAGE_SIZE {
            return std::ptr::null_mut();
        }
        calloc(1, layout.size())
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > PAGE_SIZE {
            return std::ptr::null_mut();
        }
        // Safety: GlobalAlloc contract matches realloc's.
        unsafe { realloc(ptr, new_size) }
    }
}
