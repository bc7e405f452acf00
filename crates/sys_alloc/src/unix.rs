use std::io::{self, Error};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

#[cfg(any(target_os = "linux", target_os = "android"))]
const MAP_POPULATE: libc::c_int = libc::MAP_POPULATE;

#[cfg(not(any(target_os = "linux", target_os = "android")))]
const MAP_POPULATE: libc::c_int = 0;

/// Returns the system page size, cached atomically.
pub fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            // SAFETY: sysconf has no preconditions.
            let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            let page_size = usize::try_from(raw).unwrap_or(4096);
            PAGE_SIZE.store(page_size, Ordering::Relaxed);
            page_size
        }
        page_size => page_size,
    }
}

pub struct MappingInner {
    ptr: *mut libc::c_void,
    len: usize,
}

impl MappingInner {
    /// Maps `len` bytes of private anonymous memory.
    ///
    /// # Safety
    ///
    /// `len` must be a non-zero multiple of the page size.
    pub unsafe fn map_anon(len: usize, populate: bool) -> io::Result<Self> {
        let populate = if populate { MAP_POPULATE } else { 0 };
        let flags = libc::MAP_PRIVATE | libc::MAP_ANON | populate;
        let prot = libc::PROT_READ | libc::PROT_WRITE;

        // SAFETY: a null hint lets the kernel pick a fresh range.
        let ptr = unsafe { libc::mmap(ptr::null_mut(), len, prot, flags, -1, 0) };
        if ptr == libc::MAP_FAILED {
            return Err(Error::last_os_error());
        }

        Ok(Self { ptr, len })
    }

    pub fn ptr(&self) -> *mut u8 {
        self.ptr.cast::<u8>()
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    /// Drops the physical pages of a page-aligned sub-range.
    ///
    /// # Safety
    ///
    /// `[offset, offset + len)` must be page aligned and inside the mapping.
    pub unsafe fn discard(&self, offset: usize, len: usize) -> io::Result<()> {
        // SAFETY: caller guarantees the range is inside our mapping.
        let start = unsafe { self.ptr.cast::<u8>().add(offset) };
        // SAFETY: MADV_DONTNEED on private anonymous memory only drops pages.
        let rc = unsafe { libc::madvise(start.cast::<libc::c_void>(), len, libc::MADV_DONTNEED) };
        if rc != 0 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for MappingInner {
    fn drop(&mut self) {
        if self.len > 0 {
            // SAFETY: `ptr`/`len` came from a successful mmap and are unmapped once.
            unsafe {
                libc::munmap(self.ptr, self.len);
            }
        }
    }
}
