use std::ptr::NonNull;

use crate::sync::Mutex;
use crate::sync::atomic::{AtomicUsize, Ordering};

use super::block_tree::{BlockKey, BlockTree};
use super::page_map::{PageInfo, PageMap};
use super::stats;
use super::vm::{PAGE_SIZE, PageOps, PlatformPageOps, VmError, is_page_aligned, page_ceil};

/// Default OS acquisition unit when the free index has nothing large enough.
#[cfg(not(any(loom, miri)))]
const DEFAULT_REFILL: usize = super::vm::HUGE_PAGE_SIZE;

/// Loom re-runs the model body thousands of times; keep mock regions small.
#[cfg(any(loom, miri))]
const DEFAULT_REFILL: usize = 8 * PAGE_SIZE;

/// Snapshot of an arena's OS acquisitions (diagnostic).
#[derive(Clone, Copy, Debug)]
pub struct ArenaOsStats {
    pub regions: usize,
    pub bytes: usize,
}

/// Page-granularity allocator with immediate coalescing.
///
/// Blocks are carved out of large OS regions. A freed block probes the
/// page-info table at the pages just before and after itself, atomically
/// detaches whichever neighbors are free from the block index, and publishes
/// the merged block. The index (a lock-free BST keyed by size, then address)
/// is the sole publication point for "free": a block removed from it belongs
/// exclusively to the remover until re-inserted, which is what keeps every
/// page owned by at most one block at any moment.
///
/// All operations may be called concurrently from any number of threads.
pub struct CoalescingArena {
    tree: BlockTree,
    pages: PageMap,
    // Acquired OS regions, kept only so Drop can hand them back; blocks are
    // never returned to the OS while the arena lives.
    regions: Mutex<Vec<(usize, usize)>>,
    os_regions: AtomicUsize,
    os_bytes: AtomicUsize,
}

impl CoalescingArena {
    /// Create an empty arena. The first allocation will acquire storage from
    /// the OS on demand.
    pub fn new() -> Result<Self, VmError> {
        Self::with_initial_pages(0)
    }

    /// Create an arena pre-charged with `initial_pages` pages acquired from
    /// the OS as one free block.
    pub fn with_initial_pages(initial_pages: usize) -> Result<Self, VmError> {
        let arena = Self {
            tree: BlockTree::new(),
            pages: PageMap::new()?,
            regions: Mutex::new(Vec::new()),
            os_regions: AtomicUsize::new(0),
            os_bytes: AtomicUsize::new(0),
        };
        if initial_pages > 0 {
            arena.reserve_pages(initial_pages)?;
        }
        Ok(arena)
    }

    /// Allocate a block of at least `bytes`, rounded up to whole pages.
    /// Zero rounds to one page. The returned address is page-aligned.
    pub fn alloc(&self, bytes: usize) -> Result<NonNull<u8>, VmError> {
        let size = page_ceil(bytes).ok_or_else(|| {
            VmError::MapFailed(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "request size overflows page rounding",
            ))
        })?;
        self.alloc_block(size)
    }

    /// Allocate a block of exactly `pages` pages.
    pub fn alloc_pages(&self, pages: usize) -> Result<NonNull<u8>, VmError> {
        let size = pages.checked_mul(PAGE_SIZE).ok_or_else(|| {
            VmError::MapFailed(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "page count overflows",
            ))
        })?;
        self.alloc_block(size)
    }

    /// Allocate only from already-tracked storage; never touches the OS.
    /// Returns `None` when no tracked block is large enough.
    pub fn try_alloc_reserved(&self, bytes: usize) -> Option<NonNull<u8>> {
        let mut size = page_ceil(bytes)?;
        if size == 0 {
            size = PAGE_SIZE;
        }
        let key = self.tree.remove_lower_bound(BlockKey::probe(size))?;
        Some(self.finish_block(key, size))
    }

    /// Return a block, merging it with whichever physical neighbors are free.
    ///
    /// # Safety
    ///
    /// - `ptr` must have been returned by an allocation method of this exact
    ///   arena.
    /// - `ptr` must not have been freed already.
    /// - The block must not be accessed after this call.
    pub unsafe fn free(&self, ptr: NonNull<u8>) {
        // Safety: contract forwarded to the caller.
        unsafe { self.free_with(ptr, false) }
    }

    /// Like [`free`](Self::free), but repeats the neighbor probes until
    /// neither side yields another merge.
    ///
    /// # Safety
    ///
    /// Same contract as [`free`](Self::free).
    pub unsafe fn free_coalesce_all(&self, ptr: NonNull<u8>) {
        // Safety: contract forwarded to the caller.
        unsafe { self.free_with(ptr, true) }
    }

    /// Size of the live block at `ptr`, recovered from the page-info table.
    ///
    /// # Safety
    ///
    /// `ptr` must address a live block of this arena.
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        let info = self.pages.get(ptr.as_ptr() as usize);
        debug_assert!(
            info.head_size().is_some(),
            "usable_size of unknown pointer {ptr:p}"
        );
        info.head_size().unwrap_or(0)
    }

    /// Acquire `pages` pages from the OS and add them to storage as one free
    /// block.
    pub fn reserve_pages(&self, pages: usize) -> Result<(), VmError> {
        let size = pages.checked_mul(PAGE_SIZE).ok_or_else(|| {
            VmError::MapFailed(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "page count overflows",
            ))
        })?;
        let block = self.acquire_from_os(size)?;
        let key = BlockKey::new(size, block.as_ptr() as usize);
        self.set_block(key);
        let inserted = self.tree.insert(key);
        debug_assert!(inserted, "fresh region collides with a tracked block");
        Ok(())
    }

    pub fn os_stats(&self) -> ArenaOsStats {
        ArenaOsStats {
            regions: self.os_regions.load(Ordering::Relaxed),
            bytes: self.os_bytes.load(Ordering::Relaxed),
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn alloc_block(&self, mut size: usize) -> Result<NonNull<u8>, VmError> {
        if size == 0 {
            size = PAGE_SIZE;
        }
        debug_assert!(is_page_aligned(size));

        let key = match self.tree.remove_lower_bound(BlockKey::probe(size)) {
            Some(key) => key,
            None => {
                // Nothing tracked is large enough: acquire a fresh region
                // and carve from it.
                let region_size = size.max(DEFAULT_REFILL);
                let block = self.acquire_from_os(region_size)?;
                let key = BlockKey::new(region_size, block.as_ptr() as usize);
                self.set_block(key);
                key
            }
        };

        Ok(self.finish_block(key, size))
    }

    /// The caller owns `key` (removed from the index or freshly mapped).
    /// Split it if oversized, republish boundaries, and return the prefix.
    fn finish_block(&self, key: BlockKey, size: usize) -> NonNull<u8> {
        debug_assert!(key.size >= size);

        if key.size > size {
            self.clear_block(key);
            self.set_block(BlockKey::new(size, key.addr));

            let leftover = BlockKey::new(key.size - size, key.addr + size);
            self.set_block(leftover);
            let inserted = self.tree.insert(leftover);
            // We own the leftover pages; the insert cannot collide.
            debug_assert!(inserted);
        }

        debug_assert!(is_page_aligned(key.addr));
        // Safety: block addresses originate from successful OS mappings.
        unsafe { NonNull::new_unchecked(key.addr as *mut u8) }
    }

    unsafe fn free_with(&self, ptr: NonNull<u8>, recursive: bool) {
        let addr = ptr.as_ptr() as usize;
        let info = self.pages.get(addr);
        let Some(size) = info.head_size() else {
            debug_assert!(false, "free of unknown pointer {ptr:p}");
            // Safety: precondition violated; matches the C heap contract for
            // freeing a pointer the allocator never produced.
            unsafe { std::hint::unreachable_unchecked() }
        };

        self.free_block(BlockKey::new(size, addr), recursive);
    }

    fn free_block(&self, key: BlockKey, recursive: bool) {
        debug_assert!(key.size > 0 && is_page_aligned(key.size));
        debug_assert!(is_page_aligned(key.addr));

        let mut key = key;

        // Withdraw our boundaries before probing: a concurrent freer
        // examining this block as its own neighbor must see a clean state
        // and abandon its merge.
        self.clear_block(key);

        // Backward: the page just below is the neighbor's last page.
        loop {
            let prev_page = key.addr - PAGE_SIZE;
            let info = self.pages.get(prev_page);

            let neighbor = if let Some(size) = info.tail_size() {
                BlockKey::new(size, key.addr - size)
            } else if info.head_size() == Some(PAGE_SIZE) {
                BlockKey::new(PAGE_SIZE, prev_page)
            } else {
                // Empty, or the head of a block that cannot end here.
                break;
            };

            // Only a successful removal proves the neighbor is free and
            // transfers its pages to us. Failure means it is in use, mid
            // allocation, or mid merge: abandon.
            if !self.tree.remove(neighbor) {
                break;
            }

            self.clear_block(neighbor);
            key = BlockKey::new(key.size + neighbor.size, neighbor.addr);
            if !recursive {
                break;
            }
        }

        // Forward: the first page past our end is the neighbor's head.
        loop {
            let next = key.addr + key.size;
            let info = self.pages.get(next);

            // A non-positive entry is empty or another block's tail: no merge.
            let Some(size) = info.head_size() else {
                break;
            };
            let neighbor = BlockKey::new(size, next);

            if !self.tree.remove(neighbor) {
                break;
            }

            self.clear_block(neighbor);
            key = BlockKey::new(key.size + size, key.addr);
            if !recursive {
                break;
            }
        }

        // Publish the merged block, then hand it to the index.
        self.set_block(key);
        let inserted = self.tree.insert(key);
        debug_assert!(inserted, "merged block collides with a tracked block");
    }

    /// Publish both boundary entries for a block the caller exclusively owns.
    fn set_block(&self, key: BlockKey) {
        let ok = self
            .pages
            .update(key.addr, PageInfo::EMPTY, PageInfo::head(key.size));
        debug_assert!(ok, "head boundary already occupied at {:#x}", key.addr);

        // Single-page blocks carry only the head entry.
        if key.size == PAGE_SIZE {
            return;
        }

        let tail_addr = key.addr + key.size - PAGE_SIZE;
        let ok = self
            .pages
            .update(tail_addr, PageInfo::EMPTY, PageInfo::tail(key.size));
        debug_assert!(ok, "tail boundary already occupied at {tail_addr:#x}");
    }

    /// Clear both boundary entries. For a single-page block the tail slot is
    /// the head slot and its expectation cannot match; that failed CAS is
    /// the intended no-op.
    fn clear_block(&self, key: BlockKey) {
        let ok = self
            .pages
            .update(key.addr, PageInfo::head(key.size), PageInfo::EMPTY);
        debug_assert!(ok, "head boundary missing at {:#x}", key.addr);

        let tail_addr = key.addr + key.size - PAGE_SIZE;
        let _ = self
            .pages
            .update(tail_addr, PageInfo::tail(key.size), PageInfo::EMPTY);
    }

    fn acquire_from_os(&self, size: usize) -> Result<NonNull<u8>, VmError> {
        debug_assert!(size > 0 && is_page_aligned(size));
        // Safety: size validated above.
        let block = unsafe { PlatformPageOps::alloc(size) }?;

        self.regions
            .lock()
            .unwrap()
            .push((block.as_ptr() as usize, size));
        self.os_regions.fetch_add(1, Ordering::Relaxed);
        self.os_bytes.fetch_add(size, Ordering::Relaxed);
        stats::OS_REGIONS_ACQUIRED.add(1);
        stats::OS_BYTES_ACQUIRED.add(size);

        Ok(block)
    }

    /// Drain every tracked free block, smallest first. Test-only.
    #[cfg(test)]
    pub(crate) fn drain_free_blocks(&self) -> Vec<BlockKey> {
        let keys = self.tree.drain_keys();
        for &key in &keys {
            self.clear_block(key);
        }
        keys
    }
}

impl Drop for CoalescingArena {
    fn drop(&mut self) {
        // Hand the regions back. Carved-out blocks must be dead by now;
        // dropping the arena invalidates every pointer it ever produced.
        let regions = std::mem::take(&mut *self.regions.lock().unwrap());
        for (base, size) in regions {
            // Safety: we own the mapping; recorded verbatim at acquisition.
            unsafe {
                let ptr = NonNull::new_unchecked(base as *mut u8);
                drop(PlatformPageOps::release(ptr, size));
            }
            stats::OS_REGIONS_ACQUIRED.sub(1);
            stats::OS_BYTES_ACQUIRED.sub(size);
        }
        // Tree nodes are deliberately not reclaimed.
    }
}
