//! Memory backend contracts and the segment-to-backend routing.
//!
//! The core itself owns no RAM. Segments address memory through one of
//! three routes: the physical space (real mode), the linear space (paging
//! applied by the external memory subsystem), or the alignment-checked
//! overlay, which is the linear space plus an #AC probe on word and wider
//! accesses. The linear space also carries the supervisor flag that
//! descriptor-table and TSS walks must set for the duration of the access;
//! [`MemoryBus::with_supervisor`] restores it on every exit path,
//! unwinding included.

use std::cell::RefCell;
use std::rc::Rc;

use crate::exceptions::{ProcessorException, Vector};

/// Byte-addressed, fallible memory. All multi-byte accesses are
/// little-endian.
pub trait AddressSpace {
    fn get_byte(&mut self, addr: u32) -> Result<u8, ProcessorException>;
    fn get_word(&mut self, addr: u32) -> Result<u16, ProcessorException>;
    fn get_dword(&mut self, addr: u32) -> Result<u32, ProcessorException>;
    fn get_qword(&mut self, addr: u32) -> Result<u64, ProcessorException>;
    fn set_byte(&mut self, addr: u32, val: u8) -> Result<(), ProcessorException>;
    fn set_word(&mut self, addr: u32, val: u16) -> Result<(), ProcessorException>;
    fn set_dword(&mut self, addr: u32, val: u32) -> Result<(), ProcessorException>;
    fn set_qword(&mut self, addr: u32, val: u64) -> Result<(), ProcessorException>;
}

/// The paging-mediated linear address space, owned by the external memory
/// subsystem. The processor forwards CR0/CR3/CR4 side effects here and
/// toggles the supervisor flag around system-structure walks.
pub trait LinearAddressSpace: AddressSpace {
    /// Set the supervisor flag, returning the prior value.
    fn set_supervisor(&mut self, supervisor: bool) -> bool;
    fn is_supervisor(&self) -> bool;
    fn set_paging_enabled(&mut self, enabled: bool);
    fn set_page_cache_enabled(&mut self, enabled: bool);
    fn set_page_write_through(&mut self, enabled: bool);
    fn set_write_protect_user_pages(&mut self, enabled: bool);
    fn set_page_directory_base_address(&mut self, base: u32);
    fn set_page_size_extensions_enabled(&mut self, enabled: bool);
    fn set_global_pages_enabled(&mut self, enabled: bool);
    /// Linear address of the last page walk, for CR2 on #PF.
    fn last_walked_address(&self) -> u32;
    fn reset(&mut self);
}

/// Which backend a segment is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceKind {
    Physical,
    Linear,
    AlignmentChecked,
}

/// The pair of memory backends the processor addresses through its
/// segments. Owned by the machine, lent mutably to every processor
/// operation.
pub struct MemoryBus {
    pub physical: Box<dyn AddressSpace>,
    pub linear: Box<dyn LinearAddressSpace>,
}

fn ac_check(addr: u32, align: u32) -> Result<(), ProcessorException> {
    if addr & (align - 1) != 0 {
        return Err(ProcessorException::with_code(Vector::AlignmentCheck, 0));
    }
    Ok(())
}

impl MemoryBus {
    pub fn new(physical: Box<dyn AddressSpace>, linear: Box<dyn LinearAddressSpace>) -> Self {
        Self { physical, linear }
    }

    pub fn get_byte(&mut self, kind: SpaceKind, addr: u32) -> Result<u8, ProcessorException> {
        match kind {
            SpaceKind::Physical => self.physical.get_byte(addr),
            SpaceKind::Linear | SpaceKind::AlignmentChecked => self.linear.get_byte(addr),
        }
    }

    pub fn get_word(&mut self, kind: SpaceKind, addr: u32) -> Result<u16, ProcessorException> {
        match kind {
            SpaceKind::Physical => self.physical.get_word(addr),
            SpaceKind::Linear => self.linear.get_word(addr),
            SpaceKind::AlignmentChecked => {
                ac_check(addr, 2)?;
                self.linear.get_word(addr)
            }
        }
    }

    pub fn get_dword(&mut self, kind: SpaceKind, addr: u32) -> Result<u32, ProcessorException> {
        match kind {
            SpaceKind::Physical => self.physical.get_dword(addr),
            SpaceKind::Linear => self.linear.get_dword(addr),
            SpaceKind::AlignmentChecked => {
                ac_check(addr, 4)?;
                self.linear.get_dword(addr)
            }
        }
    }

    pub fn get_qword(&mut self, kind: SpaceKind, addr: u32) -> Result<u64, ProcessorException> {
        match kind {
            SpaceKind::Physical => self.physical.get_qword(addr),
            SpaceKind::Linear => self.linear.get_qword(addr),
            SpaceKind::AlignmentChecked => {
                ac_check(addr, 8)?;
                self.linear.get_qword(addr)
            }
        }
    }

    pub fn set_byte(&mut self, kind: SpaceKind, addr: u32, val: u8) -> Result<(), ProcessorException> {
        match kind {
            SpaceKind::Physical => self.physical.set_byte(addr, val),
            SpaceKind::Linear | SpaceKind::AlignmentChecked => self.linear.set_byte(addr, val),
        }
    }

    pub fn set_word(
        &mut self,
        kind: SpaceKind,
        addr: u32,
        val: u16,
    ) -> Result<(), ProcessorException> {
        match kind {
            SpaceKind::Physical => self.physical.set_word(addr, val),
            SpaceKind::Linear => self.linear.set_word(addr, val),
            SpaceKind::AlignmentChecked => {
                ac_check(addr, 2)?;
                self.linear.set_word(addr, val)
            }
        }
    }

    pub fn set_dword(
        &mut self,
        kind: SpaceKind,
        addr: u32,
        val: u32,
    ) -> Result<(), ProcessorException> {
        match kind {
            SpaceKind::Physical => self.physical.set_dword(addr, val),
            SpaceKind::Linear => self.linear.set_dword(addr, val),
            SpaceKind::AlignmentChecked => {
                ac_check(addr, 4)?;
                self.linear.set_dword(addr, val)
            }
        }
    }

    pub fn set_qword(
        &mut self,
        kind: SpaceKind,
        addr: u32,
        val: u64,
    ) -> Result<(), ProcessorException> {
        match kind {
            SpaceKind::Physical => self.physical.set_qword(addr, val),
            SpaceKind::Linear => self.linear.set_qword(addr, val),
            SpaceKind::AlignmentChecked => {
                ac_check(addr, 8)?;
                self.linear.set_qword(addr, val)
            }
        }
    }

    /// Run `f` with the linear space in supervisor mode, restoring the
    /// prior flag afterwards. The restore also runs if `f` unwinds.
    pub fn with_supervisor<R>(&mut self, f: impl FnOnce(&mut MemoryBus) -> R) -> R {
        struct Restore<'m> {
            bus: &'m mut MemoryBus,
            prior: bool,
        }
        impl Drop for Restore<'_> {
            fn drop(&mut self) {
                self.bus.linear.set_supervisor(self.prior);
            }
        }

        let prior = self.linear.set_supervisor(true);
        let mut restore = Restore { bus: self, prior };
        f(&mut *restore.bus)
    }
}

// ------------------------------------------------------------------
// Identity-mapped test memory.
// ------------------------------------------------------------------

/// Flat RAM shared between the physical and linear views, used by unit and
/// integration tests. Out-of-range physical accesses raise #GP(0);
/// out-of-range linear accesses raise #PF and record the walked address,
/// which is what a real paging walker does for an unmapped page.
#[derive(Clone)]
pub struct FlatRam {
    bytes: Rc<RefCell<Vec<u8>>>,
}

impl FlatRam {
    pub fn new(size: usize) -> Self {
        Self {
            bytes: Rc::new(RefCell::new(vec![0; size])),
        }
    }

    pub fn load(&self, addr: u32, data: &[u8]) {
        let mut bytes = self.bytes.borrow_mut();
        let start = addr as usize;
        bytes[start..start + data.len()].copy_from_slice(data);
    }

    pub fn read(&self, addr: u32, len: usize) -> Vec<u8> {
        let bytes = self.bytes.borrow();
        bytes[addr as usize..addr as usize + len].to_vec()
    }

    fn get(&self, addr: u32, len: usize) -> Option<u64> {
        let bytes = self.bytes.borrow();
        let start = addr as usize;
        let end = start.checked_add(len)?;
        if end > bytes.len() {
            return None;
        }
        let mut val = 0u64;
        for (i, b) in bytes[start..end].iter().enumerate() {
            val |= u64::from(*b) << (8 * i);
        }
        Some(val)
    }

    fn set(&self, addr: u32, len: usize, val: u64) -> Option<()> {
        let mut bytes = self.bytes.borrow_mut();
        let start = addr as usize;
        let end = start.checked_add(len)?;
        if end > bytes.len() {
            return None;
        }
        for (i, slot) in bytes[start..end].iter_mut().enumerate() {
            *slot = (val >> (8 * i)) as u8;
        }
        Some(())
    }
}

impl AddressSpace for FlatRam {
    fn get_byte(&mut self, addr: u32) -> Result<u8, ProcessorException> {
        self.get(addr, 1)
            .map(|v| v as u8)
            .ok_or(ProcessorException::GENERAL_PROTECTION_0)
    }

    fn get_word(&mut self, addr: u32) -> Result<u16, ProcessorException> {
        self.get(addr, 2)
            .map(|v| v as u16)
            .ok_or(ProcessorException::GENERAL_PROTECTION_0)
    }

    fn get_dword(&mut self, addr: u32) -> Result<u32, ProcessorException> {
        self.get(addr, 4)
            .map(|v| v as u32)
            .ok_or(ProcessorException::GENERAL_PROTECTION_0)
    }

    fn get_qword(&mut self, addr: u32) -> Result<u64, ProcessorException> {
        self.get(addr, 8)
            .ok_or(ProcessorException::GENERAL_PROTECTION_0)
    }

    fn set_byte(&mut self, addr: u32, val: u8) -> Result<(), ProcessorException> {
        self.set(addr, 1, u64::from(val))
            .ok_or(ProcessorException::GENERAL_PROTECTION_0)
    }

    fn set_word(&mut self, addr: u32, val: u16) -> Result<(), ProcessorException> {
        self.set(addr, 2, u64::from(val))
            .ok_or(ProcessorException::GENERAL_PROTECTION_0)
    }

    fn set_dword(&mut self, addr: u32, val: u32) -> Result<(), ProcessorException> {
        self.set(addr, 4, u64::from(val))
            .ok_or(ProcessorException::GENERAL_PROTECTION_0)
    }

    fn set_qword(&mut self, addr: u32, val: u64) -> Result<(), ProcessorException> {
        self.set(addr, 8, val)
            .ok_or(ProcessorException::GENERAL_PROTECTION_0)
    }
}

/// Identity-mapped linear view over [`FlatRam`], with the supervisor flag
/// and page-fault bookkeeping the processor expects from a real walker.
pub struct FlatLinear {
    ram: FlatRam,
    supervisor: bool,
    last_walked: u32,
    /// Addresses at or above this limit page-fault, letting tests provoke
    /// #PF at a chosen boundary.
    fault_floor: Option<u32>,
}

impl FlatLinear {
    pub fn new(ram: FlatRam) -> Self {
        Self {
            ram,
            supervisor: false,
            last_walked: 0,
            fault_floor: None,
        }
    }

    /// Make every access at `addr` and above raise #PF.
    pub fn set_fault_floor(&mut self, addr: Option<u32>) {
        self.fault_floor = addr;
    }

    fn walk(&mut self, addr: u32, write: bool) -> Result<(), ProcessorException> {
        let unmapped = self.fault_floor.is_some_and(|floor| addr >= floor);
        if unmapped {
            self.last_walked = addr;
            let mut code = 0u16;
            if write {
                code |= 2;
            }
            if !self.supervisor {
                code |= 4;
            }
            return Err(ProcessorException::page_fault(code));
        }
        Ok(())
    }

    fn fault_out_of_range(&mut self, addr: u32, write: bool) -> ProcessorException {
        self.last_walked = addr;
        let mut code = 0u16;
        if write {
            code |= 2;
        }
        if !self.supervisor {
            code |= 4;
        }
        ProcessorException::page_fault(code)
    }
}

impl AddressSpace for FlatLinear {
    fn get_byte(&mut self, addr: u32) -> Result<u8, ProcessorException> {
        self.walk(addr, false)?;
        self.ram
            .get(addr, 1)
            .map(|v| v as u8)
            .ok_or_else(|| self.fault_out_of_range(addr, false))
    }

    fn get_word(&mut self, addr: u32) -> Result<u16, ProcessorException> {
        self.walk(addr, false)?;
        self.ram
            .get(addr, 2)
            .map(|v| v as u16)
            .ok_or_else(|| self.fault_out_of_range(addr, false))
    }

    fn get_dword(&mut self, addr: u32) -> Result<u32, ProcessorException> {
        self.walk(addr, false)?;
        self.ram
            .get(addr, 4)
            .map(|v| v as u32)
            .ok_or_else(|| self.fault_out_of_range(addr, false))
    }

    fn get_qword(&mut self, addr: u32) -> Result<u64, ProcessorException> {
        self.walk(addr, false)?;
        self.ram
            .get(addr, 8)
            .ok_or_else(|| self.fault_out_of_range(addr, false))
    }

    fn set_byte(&mut self, addr: u32, val: u8) -> Result<(), ProcessorException> {
        self.walk(addr, true)?;
        self.ram
            .set(addr, 1, u64::from(val))
            .ok_or_else(|| self.fault_out_of_range(addr, true))
    }

    fn set_word(&mut self, addr: u32, val: u16) -> Result<(), ProcessorException> {
        self.walk(addr, true)?;
        self.ram
            .set(addr, 2, u64::from(val))
            .ok_or_else(|| self.fault_out_of_range(addr, true))
    }

    fn set_dword(&mut self, addr: u32, val: u32) -> Result<(), ProcessorException> {
        self.walk(addr, true)?;
        self.ram
            .set(addr, 4, u64::from(val))
            .ok_or_else(|| self.fault_out_of_range(addr, true))
    }

    fn set_qword(&mut self, addr: u32, val: u64) -> Result<(), ProcessorException> {
        self.walk(addr, true)?;
        self.ram
            .set(addr, 8, val)
            .ok_or_else(|| self.fault_out_of_range(addr, true))
    }
}

impl LinearAddressSpace for FlatLinear {
    fn set_supervisor(&mut self, supervisor: bool) -> bool {
        std::mem::replace(&mut self.supervisor, supervisor)
    }

    fn is_supervisor(&self) -> bool {
        self.supervisor
    }

    fn set_paging_enabled(&mut self, _enabled: bool) {}
    fn set_page_cache_enabled(&mut self, _enabled: bool) {}
    fn set_page_write_through(&mut self, _enabled: bool) {}
    fn set_write_protect_user_pages(&mut self, _enabled: bool) {}
    fn set_page_directory_base_address(&mut self, _base: u32) {}
    fn set_page_size_extensions_enabled(&mut self, _enabled: bool) {}
    fn set_global_pages_enabled(&mut self, _enabled: bool) {}

    fn last_walked_address(&self) -> u32 {
        self.last_walked
    }

    fn reset(&mut self) {
        self.supervisor = false;
        self.last_walked = 0;
        self.fault_floor = None;
    }
}

/// Build a [`MemoryBus`] over a single shared flat RAM, returning the RAM
/// handle for loading test images.
pub fn flat_bus(size: usize) -> (MemoryBus, FlatRam) {
    let ram = FlatRam::new(size);
    let bus = MemoryBus::new(
        Box::new(ram.clone()),
        Box::new(FlatLinear::new(ram.clone())),
    );
    (bus, ram)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn little_endian_round_trip() {
        let (mut bus, ram) = flat_bus(0x100);
        bus.set_dword(SpaceKind::Physical, 0x10, 0x1122_3344).unwrap();
        assert_eq!(ram.read(0x10, 4), vec![0x44, 0x33, 0x22, 0x11]);
        assert_eq!(bus.get_word(SpaceKind::Linear, 0x10).unwrap(), 0x3344);
        assert_eq!(bus.get_qword(SpaceKind::Physical, 0x10).unwrap() & 0xffff_ffff, 0x1122_3344);
    }

    #[test]
    fn alignment_checked_overlay_rejects_misaligned() {
        let (mut bus, _ram) = flat_bus(0x100);
        assert!(bus.get_word(SpaceKind::AlignmentChecked, 0x11).is_err());
        assert!(bus.get_dword(SpaceKind::AlignmentChecked, 0x12).is_err());
        assert!(bus.get_qword(SpaceKind::AlignmentChecked, 0x14).is_err());
        assert!(bus.get_dword(SpaceKind::AlignmentChecked, 0x14).is_ok());
        // Byte accesses are never alignment-checked.
        assert!(bus.get_byte(SpaceKind::AlignmentChecked, 0x11).is_ok());
    }

    #[test]
    fn supervisor_scope_restores_on_exit() {
        let (mut bus, _ram) = flat_bus(0x10);
        assert!(!bus.linear.is_supervisor());
        bus.with_supervisor(|bus| {
            assert!(bus.linear.is_supervisor());
            // Nesting keeps the outer scope's value on exit.
            bus.with_supervisor(|bus| assert!(bus.linear.is_supervisor()));
            assert!(bus.linear.is_supervisor());
        });
        assert!(!bus.linear.is_supervisor());
    }

    #[test]
    fn unmapped_linear_access_records_walked_address() {
        let (mut bus, ram) = flat_bus(0x100);
        let _ = ram;
        let err = bus.get_dword(SpaceKind::Linear, 0x1000).unwrap_err();
        assert_eq!(err.vector, Vector::PageFault);
        assert_eq!(bus.linear.last_walked_address(), 0x1000);
    }
}
