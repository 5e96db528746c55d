use std::borrow::Borrow;
use std::ops::{Drop, Index};

use crate::error::{MappingError, Result};

/// An anonymous, private mapping of whole pages.
///
/// Freshly mapped regions are read-only; use [crate::WritableRegion::from]
/// to make one writable.
pub struct MappedRegion {
    addr: *mut u8,
    len: usize,
}

impl MappedRegion {
    /// Maps at least `size` bytes (rounded up to whole pages).
    #[cfg(unix)]
    pub fn allocate(size: usize) -> Result<Self> {
        use libc::{MAP_ANON, MAP_PRIVATE, PROT_READ};

        let len = round_to_page(size);
        let memory = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                PROT_READ,
                MAP_PRIVATE | MAP_ANON | extra_map_flags(),
                -1,
                0,
            )
        };

        if memory == libc::MAP_FAILED {
            return Err(errno::errno().into());
        }

        Ok(MappedRegion {
            addr: memory as *mut u8,
            len,
        })
    }

    #[cfg(windows)]
    pub fn allocate(size: usize) -> Result<Self> {
        use windows_sys::Win32::System::Memory::{
            VirtualAlloc, MEM_COMMIT, MEM_RESERVE, PAGE_READONLY,
        };

        let len = round_to_page(size);
        let memory = unsafe {
            VirtualAlloc(std::ptr::null(), len, MEM_COMMIT | MEM_RESERVE, PAGE_READONLY)
        };

        if memory.is_null() {
            return Err(MappingError::AllocationFailed);
        }

        Ok(MappedRegion {
            addr: memory as *mut u8,
            len,
        })
    }

    pub fn addr(&self) -> *const u8 {
        self.addr
    }

    pub fn addr_mut(&self) -> *mut u8 {
        self.addr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// macOS refuses PROT_EXEC on ordinary anonymous maps without MAP_JIT.
#[cfg(all(unix, target_os = "macos"))]
fn extra_map_flags() -> libc::c_int {
    libc::MAP_JIT
}

#[cfg(all(unix, not(target_os = "macos")))]
fn extra_map_flags() -> libc::c_int {
    0
}

#[cfg(unix)]
pub(crate) fn round_to_page(size: usize) -> usize {
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    size.div_ceil(page) * page
}

#[cfg(windows)]
pub(crate) fn round_to_page(size: usize) -> usize {
    const PAGE: usize = 4096;
    size.div_ceil(PAGE) * PAGE
}

impl<I> Index<I> for MappedRegion
where
    I: std::slice::SliceIndex<[u8]>,
{
    type Output = I::Output;

    fn index(&self, index: I) -> &Self::Output {
        unsafe { &std::slice::from_raw_parts(self.addr as *const u8, self.len)[index] }
    }
}

impl Borrow<[u8]> for MappedRegion {
    fn borrow(&self) -> &[u8] {
        &self[..]
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        if self.addr.is_null() {
            return;
        }

        #[cfg(unix)]
        unsafe {
            libc::munmap(self.addr as *mut libc::c_void, self.len);
        }

        #[cfg(windows)]
        unsafe {
            use windows_sys::Win32::System::Memory::{VirtualFree, MEM_RELEASE};
            VirtualFree(self.addr as *mut _, 0, MEM_RELEASE);
        }

        self.addr = std::ptr::null_mut();
        self.len = 0;
    }
}
