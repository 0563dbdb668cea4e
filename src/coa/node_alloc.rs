use std::ptr::NonNull;

use super::block_tree::{BlockKey, Node};
use super::stats;
use super::vm::{PageOps, PlatformPageOps};

/// Region size carved into node cells. One huge page yields tens of
/// thousands of nodes per refill.
#[cfg(not(any(loom, miri)))]
const NODE_REGION_SIZE: usize = super::vm::HUGE_PAGE_SIZE;

/// Loom re-runs the model body thousands of times and node regions are never
/// released; keep each mock region small.
#[cfg(any(loom, miri))]
const NODE_REGION_SIZE: usize = super::vm::PAGE_SIZE;

const NODE_CELL_SIZE: usize = std::mem::size_of::<Node>();

// Free cells store the next-cell link in their first word.
const _: () = assert!(NODE_CELL_SIZE >= std::mem::size_of::<*mut u8>());
// Page-aligned region bases keep every cell aligned for Node (size is
// always a multiple of alignment).
const _: () = assert!(NODE_CELL_SIZE % std::mem::align_of::<Node>() == 0);
// Edge bit-stealing needs the low pointer bits free.
const _: () = assert!(std::mem::align_of::<Node>() >= 8);
const _: () = assert!(NODE_REGION_SIZE / NODE_CELL_SIZE >= 1);

thread_local! {
    // Head of this thread's free-cell list. Thread-local so tree-node
    // allocation inside a malloc path can never contend with, or recurse
    // into, the allocator being built.
    static FREE_HEAD: crate::sync::cell::Cell<*mut u8> =
        crate::sync::cell::Cell::new(std::ptr::null_mut());
}

/// Pop a cell from the calling thread's free list, refilling it from the
/// page primitive when empty, and construct a node in place.
///
/// # Panics
///
/// Panics if the OS refuses a node region. Without node storage the tree
/// cannot record free blocks at all, so there is nothing to propagate.
pub(crate) fn alloc_node(key: BlockKey) -> NonNull<Node> {
    FREE_HEAD.with(|head| {
        loop {
            let cell = head.get();
            if cell.is_null() {
                refill(head);
                continue;
            }

            // Safety: a free cell's first word is the next-cell link,
            // written by `refill` (or zero from the fresh mapping's end
            // cell), and the cell is owned by this thread.
            let next = unsafe { cell.cast::<*mut u8>().read() };
            head.set(next);

            let node = cell.cast::<Node>();
            // Safety: the cell is NODE_CELL_SIZE bytes, aligned for Node
            // (region base is page-aligned, cells at Node-size strides),
            // and exclusively ours until the caller publishes it.
            unsafe { node.write(Node::new(key)) };
            // Safety: carved from a non-null region.
            return unsafe { NonNull::new_unchecked(node) };
        }
    })
}

/// Retiring is a no-op: published node cells are never reused, which
/// sidesteps ABA on edge pointers without a reclamation scheme. An
/// epoch-based scheme can be layered here later without changing the
/// tree's contract.
pub(crate) fn retire_node(_node: NonNull<Node>) {}

fn refill(head: &crate::sync::cell::Cell<*mut u8>) {
    // Safety: requesting a fresh zero-filled region from the OS.
    let region = unsafe { PlatformPageOps::alloc(NODE_REGION_SIZE) }
        .expect("node allocator: OS region acquisition failed");
    stats::NODE_REGION_BYTES.add(NODE_REGION_SIZE);

    let base = region.as_ptr();
    let count = NODE_REGION_SIZE / NODE_CELL_SIZE;
    for i in 0..count - 1 {
        // Safety: cell i is inside the region; link it to cell i + 1.
        unsafe {
            let cell = base.add(i * NODE_CELL_SIZE);
            cell.cast::<*mut u8>().write(base.add((i + 1) * NODE_CELL_SIZE));
        }
    }
    // Safety: last cell terminates the list.
    unsafe {
        base.add((count - 1) * NODE_CELL_SIZE)
            .cast::<*mut u8>()
            .write(std::ptr::null_mut());
    }

    head.set(base);
}
