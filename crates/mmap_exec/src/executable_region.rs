use crate::error::Result;
use crate::MappedRegion;

/// A read-only region of executable machine code.
///
/// The only way to obtain one is [crate::WritableRegion::into_executable],
/// which gives up write permission in the same step.
pub struct ExecutableRegion {
    region: MappedRegion,
}

impl ExecutableRegion {
    #[cfg(unix)]
    pub fn from(region: MappedRegion) -> Result<Self> {
        use libc::{PROT_EXEC, PROT_READ};

        unsafe {
            if libc::mprotect(
                region.addr_mut() as *mut libc::c_void,
                region.len(),
                PROT_READ | PROT_EXEC,
            ) < 0
            {
                return Err(errno::errno().into());
            }
        }

        Ok(Self { region })
    }

    #[cfg(windows)]
    pub fn from(region: MappedRegion) -> Result<Self> {
        use windows_sys::Win32::System::Memory::{VirtualProtect, PAGE_EXECUTE_READ};

        let mut old = 0;
        unsafe {
            if VirtualProtect(
                region.addr_mut() as *mut _,
                region.len(),
                PAGE_EXECUTE_READ,
                &mut old,
            ) == 0
            {
                return Err(crate::MappingError::AllocationFailed);
            }
        }

        Ok(Self { region })
    }

    pub fn addr(&self) -> *const u8 {
        self.region.addr()
    }

    pub fn len(&self) -> usize {
        self.region.len()
    }

    pub fn is_empty(&self) -> bool {
        self.region.is_empty()
    }
}
