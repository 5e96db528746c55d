//! Process-wide fault handler for tape overruns.
//!
//! The tape's danger pages have no access permission, so a runaway cell
//! pointer faults instead of corrupting memory. This module owns the
//! handler that turns such a fault into a warning and a clean `exit(1)`.
//!
//! Exactly one tape is active per process; it is published here as a bare
//! (base, length) pair so the handler can run without locks. Ordering
//! contract with [crate::tape]: publish before arming the danger pages,
//! clear before unmapping. Faults anywhere else re-raise with the default
//! disposition.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Once;

static ACTIVE_TAPE_BASE: AtomicUsize = AtomicUsize::new(0);
static ACTIVE_TAPE_LEN: AtomicUsize = AtomicUsize::new(0);
static INSTALL: Once = Once::new();

/// Publishes the mapping the handler should claim faults for.
pub(crate) fn set_active_tape(base: usize, len: usize) {
    ACTIVE_TAPE_BASE.store(base, Ordering::Release);
    ACTIVE_TAPE_LEN.store(len, Ordering::Release);
}

/// Unpublishes a mapping, but only if it is still the active one.
pub(crate) fn clear_active_tape(base: usize) {
    if ACTIVE_TAPE_BASE.load(Ordering::Acquire) == base {
        ACTIVE_TAPE_BASE.store(0, Ordering::Release);
        ACTIVE_TAPE_LEN.store(0, Ordering::Release);
    }
}

fn is_tape_address(addr: usize) -> bool {
    let base = ACTIVE_TAPE_BASE.load(Ordering::Acquire);
    let len = ACTIVE_TAPE_LEN.load(Ordering::Acquire);
    base != 0 && addr >= base && addr < base + len
}

/// Installs the handler. Idempotent; call once at startup, before any
/// guest code runs.
pub fn install() {
    INSTALL.call_once(install_platform_handler);
}

#[cfg(unix)]
fn install_platform_handler() {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = fault_handler as usize;
        action.sa_flags = libc::SA_SIGINFO;

        libc::sigaction(libc::SIGSEGV, &action, std::ptr::null_mut());

        // macOS reports guard-page hits as SIGBUS.
        #[cfg(target_os = "macos")]
        libc::sigaction(libc::SIGBUS, &action, std::ptr::null_mut());
    }
}

#[cfg(unix)]
extern "C" fn fault_handler(
    _sig: libc::c_int,
    info: *mut libc::siginfo_t,
    _context: *mut libc::c_void,
) {
    unsafe {
        #[cfg(target_os = "linux")]
        let fault_addr = (*info).si_addr() as usize;
        #[cfg(not(target_os = "linux"))]
        let fault_addr = (*info).si_addr as usize;

        if is_tape_address(fault_addr) {
            // Only async-signal-safe calls from here on.
            const MSG: &[u8] = b"warning: Reached end of tape\n";
            libc::write(2, MSG.as_ptr() as *const libc::c_void, MSG.len());
            libc::_exit(1);
        }

        // Not our fault: restore the default disposition; returning
        // re-executes the faulting access, which then re-raises.
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = libc::SIG_DFL;
        libc::sigaction(libc::SIGSEGV, &action, std::ptr::null_mut());
        #[cfg(target_os = "macos")]
        libc::sigaction(libc::SIGBUS, &action, std::ptr::null_mut());
    }
}

#[cfg(windows)]
fn install_platform_handler() {
    use windows_sys::Win32::System::Diagnostics::Debug::AddVectoredExceptionHandler;

    unsafe {
        AddVectoredExceptionHandler(1, Some(vectored_handler));
    }
}

#[cfg(windows)]
unsafe extern "system" fn vectored_handler(
    exception_info: *mut windows_sys::Win32::System::Diagnostics::Debug::EXCEPTION_POINTERS,
) -> i32 {
    use windows_sys::Win32::Foundation::EXCEPTION_ACCESS_VIOLATION;

    const EXCEPTION_CONTINUE_SEARCH: i32 = 0;

    let record = unsafe { (*exception_info).ExceptionRecord };
    if unsafe { (*record).ExceptionCode } != EXCEPTION_ACCESS_VIOLATION {
        return EXCEPTION_CONTINUE_SEARCH;
    }

    // Second element of an access violation is the faulting address.
    let fault_addr = unsafe { (*record).ExceptionInformation[1] };
    if is_tape_address(fault_addr) {
        eprintln!("warning: Reached end of tape");
        std::process::exit(1);
    }

    EXCEPTION_CONTINUE_SEARCH
}

#[cfg(test)]
mod tests {
    use super::*;

    // One test body: these poke process-wide state and must not interleave.
    #[test]
    fn active_tape_registration() {
        set_active_tape(0x10000, 0x1000);
        assert!(is_tape_address(0x10000));
        assert!(is_tape_address(0x10FFF));
        assert!(!is_tape_address(0x11000));
        assert!(!is_tape_address(0xFFFF));

        // clearing a stale mapping is a no-op
        clear_active_tape(0x30000);
        assert!(is_tape_address(0x10000));

        clear_active_tape(0x10000);
        assert!(!is_tape_address(0x10000));
    }
}
