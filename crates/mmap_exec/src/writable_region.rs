use std::borrow::{Borrow, BorrowMut};
use std::ops::{Index, IndexMut};
use std::slice::SliceIndex;

use crate::error::Result;
use crate::ExecutableRegion;
use crate::MappedRegion;

/// A memory-mapped region that can be written to, but never executed.
///
/// Indexing and borrowing from the WritableRegion returns `[u8]`.
pub struct WritableRegion {
    region: MappedRegion,
}

impl WritableRegion {
    /// Consumes the existing [MappedRegion] and makes its memory writable.
    #[cfg(unix)]
    pub fn from(region: MappedRegion) -> Result<Self> {
        use libc::{PROT_READ, PROT_WRITE};

        unsafe {
            if libc::mprotect(
                region.addr_mut() as *mut libc::c_void,
                region.len(),
                PROT_READ | PROT_WRITE,
            ) < 0
            {
                return Err(errno::errno().into());
            }
        }

        Ok(Self { region })
    }

    #[cfg(windows)]
    pub fn from(region: MappedRegion) -> Result<Self> {
        use windows_sys::Win32::System::Memory::{VirtualProtect, PAGE_READWRITE};

        let mut old = 0;
        unsafe {
            if VirtualProtect(region.addr_mut() as *mut _, region.len(), PAGE_READWRITE, &mut old)
                == 0
            {
                return Err(crate::MappingError::AllocationFailed);
            }
        }

        Ok(Self { region })
    }

    /// Convenience function to allocate a region and mark it writable in one go.
    pub fn allocate(size: usize) -> Result<Self> {
        let region = MappedRegion::allocate(size)?;
        WritableRegion::from(region)
    }

    /// Consumes the region and returns a read-only, [ExecutableRegion].
    pub fn into_executable(self) -> Result<ExecutableRegion> {
        ExecutableRegion::from(self.region)
    }

    pub fn len(&self) -> usize {
        self.region.len()
    }

    pub fn is_empty(&self) -> bool {
        self.region.is_empty()
    }
}

impl<I> Index<I> for WritableRegion
where
    I: SliceIndex<[u8]>,
{
    type Output = I::Output;

    fn index(&self, index: I) -> &Self::Output {
        unsafe {
            &std::slice::from_raw_parts(self.region.addr() as *const u8, self.region.len())[index]
        }
    }
}

impl<I> IndexMut<I> for WritableRegion
where
    I: SliceIndex<[u8]>,
{
    fn index_mut(&mut self, index: I) -> &mut Self::Output {
        unsafe {
            &mut std::slice::from_raw_parts_mut(
                self.region.addr_mut() as *mut u8,
                self.region.len(),
            )[index]
        }
    }
}

impl Borrow<[u8]> for WritableRegion {
    fn borrow(&self) -> &[u8] {
        &self.region[..]
    }
}

impl BorrowMut<[u8]> for WritableRegion {
    fn borrow_mut(&mut self) -> &mut [u8] {
        &mut self[..]
    }
}
