use std::io::{self, Error};
use std::mem;
use std::ptr;

#[cfg(not(miri))]
use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, MEM_RESET, PAGE_READWRITE,
};
#[cfg(not(miri))]
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

#[cfg(not(miri))]
fn system_info() -> SYSTEM_INFO {
    // SAFETY: GetSystemInfo fills a caller-provided struct.
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        info
    }
}

/// Returns the system allocation granularity (typically 64KB).
pub fn allocation_granularity() -> usize {
    #[cfg(miri)]
    {
        65536
    }
    #[cfg(not(miri))]
    {
        match system_info().dwAllocationGranularity as usize {
            0 => 65536,
            gran => gran,
        }
    }
}

pub fn page_size() -> usize {
    #[cfg(miri)]
    {
        4096
    }
    #[cfg(not(miri))]
    {
        match system_info().dwPageSize as usize {
            0 => 4096,
            size => size,
        }
    }
}

pub struct MappingInner {
    ptr: *mut std::ffi::c_void,
    len: usize,
}

impl MappingInner {
    /// Reserves and commits `len` bytes of read-write memory.
    ///
    /// # Safety
    ///
    /// `len` must be a non-zero multiple of the page size.
    pub unsafe fn map_anon(len: usize, _populate: bool) -> io::Result<Self> {
        #[cfg(miri)]
        {
            use std::alloc::{alloc_zeroed, Layout};
            let layout = Layout::from_size_align(len, allocation_granularity())
                .map_err(|_| Error::from(io::ErrorKind::InvalidInput))?;
            // SAFETY: layout has non-zero size.
            let ptr = unsafe { alloc_zeroed(layout) };
            if ptr.is_null() {
                return Err(Error::from(io::ErrorKind::OutOfMemory));
            }
            Ok(Self {
                ptr: ptr.cast::<std::ffi::c_void>(),
                len,
            })
        }
        #[cfg(not(miri))]
        {
            // SAFETY: a null address lets the system choose the range.
            let ptr = unsafe {
                VirtualAlloc(ptr::null(), len, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE)
            };
            if ptr.is_null() {
                return Err(Error::last_os_error());
            }
            Ok(Self { ptr, len })
        }
    }

    pub const fn ptr(&self) -> *mut u8 {
        self.ptr.cast::<u8>()
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    /// Marks a page-aligned sub-range as no longer needed.
    ///
    /// # Safety
    ///
    /// `[offset, offset + len)` must be page aligned and inside the mapping.
    pub unsafe fn discard(&self, offset: usize, len: usize) -> io::Result<()> {
        #[cfg(miri)]
        {
            let _ = (offset, len);
            Ok(())
        }
        #[cfg(not(miri))]
        {
            // SAFETY: caller guarantees the range is inside our mapping.
            let start = unsafe { self.ptr.cast::<u8>().add(offset) };
            // SAFETY: MEM_RESET keeps the range committed but lets the pages go.
            let ptr = unsafe {
                VirtualAlloc(start.cast::<std::ffi::c_void>(), len, MEM_RESET, PAGE_READWRITE)
            };
            if ptr.is_null() {
                return Err(Error::last_os_error());
            }
            Ok(())
        }
    }
}

impl Drop for MappingInner {
    fn drop(&mut self) {
        if self.len > 0 {
            #[cfg(miri)]
            {
                use std::alloc::{dealloc, Layout};
                if let Ok(layout) = Layout::from_size_align(self.len, allocation_granularity()) {
                    // SAFETY: allocated above with this layout.
                    unsafe { dealloc(self.ptr.cast::<u8>(), layout) };
                }
            }
            #[cfg(not(miri))]
            {
                // SAFETY: MEM_RELEASE requires dwSize to be 0.
                unsafe {
                    VirtualFree(self.ptr, 0, MEM_RELEASE);
                }
            }
        }
    }
}
