use std::fmt;
use std::ptr::NonNull;

/// Allocation granularity. Every block address and size is a multiple of
/// this, independent of the OS page size (on 16KB-page systems the OS keeps
/// the invariant for us, since mappings are at least page-aligned).
pub const PAGE_SIZE: usize = 4096;

/// Default OS acquisition unit. Fresh regions are requested at
/// `max(request, HUGE_PAGE_SIZE)` so small allocations amortise the syscall
/// and leave a large carvable remainder.
pub const HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

/// Smallest page multiple >= `bytes`, or `None` on overflow.
#[inline]
pub(crate) fn page_ceil(bytes: usize) -> Option<usize> {
    bytes.checked_add(PAGE_SIZE - 1).map(|b| b & !(PAGE_SIZE - 1))
}

#[inline]
pub(crate) fn is_page_aligned(value: usize) -> bool {
    value & (PAGE_SIZE - 1) == 0
}

#[derive(Debug)]
pub enum VmError {
    MapFailed(std::io::Error),
    ReserveFailed(std::io::Error),
    ReleaseFailed(std::io::Error),
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::MapFailed(e) => write!(f, "page allocation failed: {e}"),
            VmError::ReserveFailed(e) => write!(f, "lazy reservation failed: {e}"),
            VmError::ReleaseFailed(e) => write!(f, "unmap failed: {e}"),
        }
    }
}

impl std::error::Error for VmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            VmError::MapFailed(e) | VmError::ReserveFailed(e) | VmError::ReleaseFailed(e) => {
                Some(e)
            }
        }
    }
}

/// Abstract interface for obtaining page-granularity memory from the OS.
///
/// The coalescing core never returns block memory to the OS; `release` exists
/// for the page-map reservation and for tests.
pub(crate) trait PageOps {
    /// Allocate a zero-filled, committed, page-aligned region.
    ///
    /// `size` must be a non-zero page multiple.
    unsafe fn alloc(size: usize) -> Result<NonNull<u8>, VmError>;

    /// Reserve a large zero-filled mapping whose physical backing is
    /// committed lazily by OS demand paging. Suitable for sparse tables that
    /// span far more address space than they will ever touch.
    unsafe fn reserve_lazy(size: usize) -> Result<NonNull<u8>, VmError>;

    /// Release a mapping previously obtained from [`alloc`](Self::alloc) or
    /// [`reserve_lazy`](Self::reserve_lazy).
    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError>;

    /// OS page size (default/minimum).
    fn os_page_size() -> usize;
}

pub(crate) struct PlatformPageOps;

#[cfg(all(unix, not(any(loom, miri))))]
mod unix {
    use super::{NonNull, PageOps, PlatformPageOps, VmError};
    use std::io;

    unsafe fn map_anon(size: usize, extra_flags: libc::c_int) -> Result<NonNull<u8>, VmError> {
        if size == 0 {
            return Err(VmError::MapFailed(io::Error::new(
                io::ErrorKind::InvalidInput,
                "zero-size mapping",
            )));
        }

        // Safety: FFI call to mmap.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON | extra_flags,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(VmError::MapFailed(io::Error::last_os_error()));
        }

        match NonNull::new(ptr.cast::<u8>()) {
            Some(p) => Ok(p),
            None => Err(VmError::MapFailed(io::Error::other("mmap returned null"))),
        }
    }

    impl PageOps for PlatformPageOps {
        unsafe fn alloc(size: usize) -> Result<NonNull<u8>, VmError> {
            debug_assert!(
                super::is_page_aligned(size),
                "PageOps::alloc: size {size} is not a page multiple"
            );

            // Safety: size validated above; map_anon performs the FFI call.
            let ptr = unsafe { map_anon(size, 0)? };

            #[cfg(target_os = "linux")]
            if size >= super::HUGE_PAGE_SIZE {
                // Transparent Huge Pages: ask the kernel to back this region
                // with 2MB pages when possible. Only worth the hint for
                // regions of at least one huge page.
                // Safety: FFI call to madvise on a mapping we own.
                unsafe {
                    libc::madvise(
                        ptr.as_ptr().cast::<libc::c_void>(),
                        size,
                        libc::MADV_HUGEPAGE,
                    )
                };
            }

            Ok(ptr)
        }

        unsafe fn reserve_lazy(size: usize) -> Result<NonNull<u8>, VmError> {
            #[cfg(target_os = "linux")]
            let flags = libc::MAP_NORESERVE;
            // macOS and the BSDs overcommit anonymous memory by default.
            #[cfg(not(target_os = "linux"))]
            let flags = 0;

            // Safety: FFI call via map_anon.
            unsafe { map_anon(size, flags) }.map_err(|e| match e {
                VmError::MapFailed(io) => VmError::ReserveFailed(io),
                other => other,
            })
        }

        unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
            // Safety: FFI call to munmap.
            if unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), size) } != 0 {
                return Err(VmError::ReleaseFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        fn os_page_size() -> usize {
            use crate::sync::OnceLock;
            static CACHED: OnceLock<usize> = OnceLock::new();
            *CACHED.get_or_init(|| {
                // Safety: FFI call to sysconf.
                let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                assert!(
                    raw > 0,
                    "sysconf(_SC_PAGESIZE) failed: {}",
                    io::Error::last_os_error()
                );
                // 64-bit targets only; page size fits in usize there.
                #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
                {
                    raw as usize
                }
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Loom/Miri mock: heap-backed PageOps (no real mmap)
//
// Under `cfg(loom)` we cannot issue real VM syscalls (loom runs inside a
// single OS process with its own scheduler). Instead we back every mapping
// with a plain zeroed heap allocation, which also keeps Miri's pointer
// tracking happy. `reserve_lazy` degenerates to an eager allocation; mock
// callers only ever reserve small tables.
// ---------------------------------------------------------------------------
#[cfg(any(loom, miri))]
impl PageOps for PlatformPageOps {
    unsafe fn alloc(size: usize) -> Result<NonNull<u8>, VmError> {
        if size == 0 {
            return Err(VmError::MapFailed(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "zero-size mapping",
            )));
        }
        let layout = std::alloc::Layout::from_size_align(size, PAGE_SIZE)
            .map_err(|e| VmError::MapFailed(std::io::Error::other(e)))?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or_else(|| {
            VmError::MapFailed(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                "alloc returned null",
            ))
        })
    }

    unsafe fn reserve_lazy(size: usize) -> Result<NonNull<u8>, VmError> {
        // Safety: forwarded; the mock has no lazy-commit distinction.
        unsafe { Self::alloc(size) }
    }

    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), VmError> {
        let layout = std::alloc::Layout::from_size_align(size, PAGE_SIZE)
            .map_err(|e| VmError::ReleaseFailed(std::io::Error::other(e)))?;
        // Safety: ptr was allocated with the same layout via `alloc`.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }

    fn os_page_size() -> usize {
        PAGE_SIZE
    }
}
