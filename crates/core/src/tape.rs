//! The sandboxed tape.
//!
//! Cells live in a page-aligned anonymous mapping flanked on both sides by
//! *danger zones*: pages with no access permission at all. Pointer
//! arithmetic on the tape wraps, so an out-of-range access lands in a
//! danger zone and traps into [crate::fault] instead of touching foreign
//! memory.
//!
//! Danger zones start at one page and only ever grow (between REPL chunks,
//! driven by the program's `max_off`); they are never shrunk.

use std::io;
use std::marker::PhantomData;
use std::mem::size_of;

use crate::cell::Cell;
use crate::fault;

pub struct Tape<C: Cell> {
    mapping: TapeMapping,
    cell_count: usize,
    ptr: *mut C,
    _cells: PhantomData<C>,
}

impl<C: Cell> Tape<C> {
    /// Maps a tape of at least `cell_count` cells (rounded up to whole
    /// pages) with one danger page on each side, and publishes it as the
    /// process's active tape.
    pub fn new(cell_count: usize, start_cell: usize) -> io::Result<Tape<C>> {
        let page = page_size();
        let data_len = round_up(cell_count.max(1) * size_of::<C>(), page);
        let cell_count = data_len / size_of::<C>();

        let mapping = TapeMapping::allocate(data_len, page)?;
        fault::set_active_tape(mapping.base as usize, mapping.len);
        mapping.arm_danger_zones()?;

        let start = start_cell.min(cell_count - 1);
        let ptr = unsafe { (mapping.cells_base() as *mut C).add(start) };

        Ok(Tape {
            mapping,
            cell_count,
            ptr,
            _cells: PhantomData,
        })
    }

    /// Ensures each danger zone covers at least `max_off` cells.
    ///
    /// Grow-only: if the current zones are already wide enough this is a
    /// no-op. Otherwise the whole tape is remapped, cell contents are
    /// copied over, and the cell pointer keeps its index.
    pub fn grow_danger_zone(&mut self, max_off: u64) -> io::Result<()> {
        let page = page_size();
        let needed_bytes = (max_off as usize).saturating_mul(size_of::<C>());
        let danger_len = round_up(needed_bytes, page).max(page);

        if danger_len <= self.mapping.danger_len {
            return Ok(());
        }

        let index = self.cell_index();
        let new = TapeMapping::allocate(self.mapping.data_len, danger_len)?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.mapping.cells_base(),
                new.cells_base(),
                self.mapping.data_len,
            );
        }

        // Publish the replacement before arming it and before the old
        // mapping goes away, so the fault handler never sees a gap.
        fault::set_active_tape(new.base as usize, new.len);
        new.arm_danger_zones()?;

        self.mapping = new;
        self.ptr = unsafe { (self.mapping.cells_base() as *mut C).offset(index as isize) };
        Ok(())
    }

    /// The pointer `off` cells away from the current cell, computed with
    /// wrapping arithmetic: a wild offset still lands inside the mapping's
    /// danger zones and traps rather than invoking undefined behavior.
    pub fn ptr_at(&self, off: i64) -> *mut C {
        let byte_off = (off as usize).wrapping_mul(size_of::<C>());
        (self.ptr as usize).wrapping_add(byte_off) as *mut C
    }

    pub fn load(&self, off: i64) -> C {
        unsafe { self.ptr_at(off).read() }
    }

    pub fn store(&mut self, off: i64, value: C) {
        unsafe { self.ptr_at(off).write(value) }
    }

    pub fn move_by(&mut self, cells: i64) {
        self.ptr = self.ptr_at(cells);
    }

    /// True iff the current pointer is inside the writable cell range.
    pub fn check_pointer(&self) -> bool {
        let base = self.mapping.cells_base() as usize;
        let end = base + self.cell_count * size_of::<C>();
        let p = self.ptr as usize;
        p >= base && p < end
    }

    /// Index of the current cell, relative to the start of the cell region.
    pub fn cell_index(&self) -> i64 {
        let base = self.mapping.cells_base() as i64;
        (self.ptr as i64 - base) / size_of::<C>() as i64
    }

    pub fn cell_count(&self) -> usize {
        self.cell_count
    }

    /// Bytes of no-access padding on each side of the cell region.
    pub fn danger_zone_len(&self) -> usize {
        self.mapping.danger_len
    }

    /// Entry pointer handed to compiled code.
    pub fn current_ptr(&self) -> *mut C {
        self.ptr
    }

    /// Adopts the cell pointer returned by compiled code.
    pub fn set_current_ptr(&mut self, ptr: *mut C) {
        self.ptr = ptr;
    }

    /// The whole cell region, for inspection.
    pub fn cells(&self) -> &[C] {
        unsafe {
            std::slice::from_raw_parts(self.mapping.cells_base() as *const C, self.cell_count)
        }
    }
}

struct TapeMapping {
    base: *mut u8,
    len: usize,
    data_len: usize,
    danger_len: usize,
}

impl TapeMapping {
    /// Maps `danger ‖ data ‖ danger` read-write; the danger zones are shut
    /// off separately by [TapeMapping::arm_danger_zones].
    fn allocate(data_len: usize, danger_len: usize) -> io::Result<TapeMapping> {
        let len = data_len + 2 * danger_len;

        #[cfg(unix)]
        let base = unsafe {
            let p = libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            );
            if p == libc::MAP_FAILED {
                return Err(io::Error::last_os_error());
            }
            p as *mut u8
        };

        #[cfg(windows)]
        let base = unsafe {
            use windows_sys::Win32::System::Memory::{
                VirtualAlloc, MEM_COMMIT, MEM_RESERVE, PAGE_READWRITE,
            };
            let p = VirtualAlloc(std::ptr::null(), len, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE);
            if p.is_null() {
                return Err(io::Error::last_os_error());
            }
            p as *mut u8
        };

        Ok(TapeMapping {
            base,
            len,
            data_len,
            danger_len,
        })
    }

    /// Removes all access permissions from both danger zones.
    fn arm_danger_zones(&self) -> io::Result<()> {
        self.protect_none(self.base, self.danger_len)?;
        let right = unsafe { self.base.add(self.danger_len + self.data_len) };
        self.protect_none(right, self.danger_len)
    }

    #[cfg(unix)]
    fn protect_none(&self, at: *mut u8, len: usize) -> io::Result<()> {
        let rc = unsafe { libc::mprotect(at as *mut libc::c_void, len, libc::PROT_NONE) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(windows)]
    fn protect_none(&self, at: *mut u8, len: usize) -> io::Result<()> {
        use windows_sys::Win32::System::Memory::{VirtualProtect, PAGE_NOACCESS};
        let mut old = 0;
        let rc = unsafe { VirtualProtect(at as *mut _, len, PAGE_NOACCESS, &mut old) };
        if rc == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn cells_base(&self) -> *mut u8 {
        unsafe { self.base.add(self.danger_len) }
    }
}

impl Drop for TapeMapping {
    fn drop(&mut self) {
        // Unpublish before the pages disappear.
        fault::clear_active_tape(self.base as usize);

        #[cfg(unix)]
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.len);
        }

        #[cfg(windows)]
        unsafe {
            use windows_sys::Win32::System::Memory::{VirtualFree, MEM_RELEASE};
            VirtualFree(self.base as *mut _, 0, MEM_RELEASE);
        }
    }
}

pub(crate) fn page_size() -> usize {
    #[cfg(unix)]
    unsafe {
        libc::sysconf(libc::_SC_PAGESIZE) as usize
    }

    #[cfg(windows)]
    {
        4096
    }
}

fn round_up(n: usize, to: usize) -> usize {
    n.div_ceil(to) * to
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cells_start_zeroed_and_page_aligned() {
        let tape: Tape<u8> = Tape::new(1000, 0).unwrap();
        assert_eq!(tape.cell_count() % page_size(), 0);
        assert!(tape.cell_count() >= 1000);
        assert!(tape.cells().iter().all(|&c| c == 0));
        assert_eq!(tape.mapping.cells_base() as usize % page_size(), 0);
    }

    #[test]
    fn loads_and_stores_honor_offsets() {
        let mut tape: Tape<u16> = Tape::new(64, 8).unwrap();
        tape.store(0, 7);
        tape.store(3, 9);
        assert_eq!(tape.load(0), 7);
        assert_eq!(tape.load(3), 9);
        tape.move_by(3);
        assert_eq!(tape.load(0), 9);
        assert_eq!(tape.load(-3), 7);
        assert_eq!(tape.cell_index(), 11);
    }

    #[test]
    fn check_pointer_detects_escapes() {
        let mut tape: Tape<u8> = Tape::new(16, 0).unwrap();
        assert!(tape.check_pointer());
        tape.move_by(-1);
        assert!(!tape.check_pointer());
        tape.move_by(1);
        assert!(tape.check_pointer());
    }

    #[test]
    fn danger_zone_growth_preserves_cells_and_index() {
        let mut tape: Tape<u32> = Tape::new(100, 5).unwrap();
        tape.store(0, 0xDEAD);
        tape.store(10, 0xBEEF);
        let old_danger = tape.danger_zone_len();

        tape.grow_danger_zone(100_000).unwrap();

        assert!(tape.danger_zone_len() >= 100_000 * size_of::<u32>());
        assert!(tape.danger_zone_len() > old_danger);
        assert_eq!(tape.cell_index(), 5);
        assert_eq!(tape.load(0), 0xDEAD);
        assert_eq!(tape.load(10), 0xBEEF);
    }

    #[test]
    fn danger_zones_never_shrink() {
        let mut tape: Tape<u8> = Tape::new(16, 0).unwrap();
        tape.grow_danger_zone(3 * page_size() as u64).unwrap();
        let grown = tape.danger_zone_len();
        tape.grow_danger_zone(1).unwrap();
        assert_eq!(tape.danger_zone_len(), grown);
    }

    #[test]
    fn danger_zone_covers_max_off_distance() {
        let mut tape: Tape<u64> = Tape::new(32, 0).unwrap();
        let max_off = 10_000u64;
        tape.grow_danger_zone(max_off).unwrap();
        assert!(tape.danger_zone_len() as u64 >= max_off * size_of::<u64>() as u64);
    }
}
