//! Guest physical memory management using the `vm-memory` crate.
//!
//! Generalizes a single contiguous region into a bounded set of
//! independently-addressable slots, each registered with the backend as
//! its own `MemorySlot`. A GPA never spans more than one slot: address
//! translation fails rather than silently reading across a gap.

use crate::backend::{Backend, MemorySlot};
use std::sync::Mutex;
use thiserror::Error;
use vm_memory::{Bytes, GuestAddress, GuestMemory as GuestMemoryTrait, GuestMemoryMmap};

/// Hard cap on the number of memory slots a VM may register.
pub const MAX_SLOTS: usize = 32;

const PAGE_SIZE: u64 = 4096;

#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("failed to allocate guest memory region: {0}")]
    Allocate(#[source] std::io::Error),

    #[error("guest physical address {addr:#x} (len {len}) is not mapped")]
    Unmapped { addr: u64, len: usize },

    #[error("guest physical address {addr:#x} (len {len}) crosses a slot boundary")]
    CrossSlot { addr: u64, len: usize },

    #[error("memory slot limit ({MAX_SLOTS}) exceeded")]
    TooManySlots,

    #[error("regions overlap: new region [{new_start:#x}, {new_end:#x}) overlaps existing [{existing_start:#x}, {existing_end:#x})")]
    Overlap {
        new_start: u64,
        new_end: u64,
        existing_start: u64,
        existing_end: u64,
    },
}

struct Region {
    gpa_start: u64,
    size: u64,
    mmap: GuestMemoryMmap,
}

impl Region {
    fn gpa_end(&self) -> u64 {
        self.gpa_start + self.size
    }

    fn host_addr(&self) -> u64 {
        self.mmap.iter().next().expect("region has a mapping").as_ptr() as u64
    }
}

/// Owns every guest memory region and knows how to translate a guest
/// physical address into the host mapping backing it.
///
/// Regions live behind a `Mutex` rather than requiring `&mut self` to add
/// one: the manager is shared via `Arc` between the `Vm` that adds regions
/// before boot and the device set that reads/writes them from vCPU
/// threads afterward, so it can never be uniquely owned again once a
/// second `Arc` clone exists.
pub struct MemoryManager {
    regions: Mutex<Vec<Region>>,
}

impl MemoryManager {
    pub fn new() -> Self {
        Self {
            regions: Mutex::new(Vec::new()),
        }
    }

    /// Allocate `size` bytes of anonymous memory and add it as a new
    /// slot at guest physical address `gpa_start`, registering it with
    /// the backend.
    pub fn add_region<B: Backend>(
        &self,
        vm: &B::Vm,
        gpa_start: u64,
        size: u64,
    ) -> Result<(), MemoryError> {
        let gpa_start = gpa_start & !(PAGE_SIZE - 1);

        let mut regions = self.regions.lock().unwrap();
        if regions.len() >= MAX_SLOTS {
            return Err(MemoryError::TooManySlots);
        }
        let new_end = gpa_start + size;
        for r in regions.iter() {
            if gpa_start < r.gpa_end() && r.gpa_start < new_end {
                return Err(MemoryError::Overlap {
                    new_start: gpa_start,
                    new_end,
                    existing_start: r.gpa_start,
                    existing_end: r.gpa_end(),
                });
            }
        }

        let mmap = GuestMemoryMmap::from_ranges(&[(GuestAddress(0), size as usize)])
            .map_err(|e| MemoryError::Allocate(std::io::Error::other(e.to_string())))?;

        let region = Region {
            gpa_start,
            size,
            mmap,
        };
        let slot = MemorySlot {
            slot: regions.len() as u32,
            gpa: region.gpa_start,
            size: region.size,
            hva: region.host_addr(),
        };
        B::map_memory(vm, slot)
            .map_err(|e| MemoryError::Allocate(std::io::Error::other(e.to_string())))?;

        regions.push(region);
        Ok(())
    }

    fn with_region<T>(
        &self,
        addr: u64,
        len: usize,
        f: impl FnOnce(&Region) -> Result<T, MemoryError>,
    ) -> Result<T, MemoryError> {
        let regions = self.regions.lock().unwrap();
        for r in regions.iter() {
            if addr >= r.gpa_start && addr < r.gpa_end() {
                if addr + len as u64 > r.gpa_end() {
                    return Err(MemoryError::CrossSlot { addr, len });
                }
                return f(r);
            }
        }
        Err(MemoryError::Unmapped { addr, len })
    }

    /// Host virtual address a GPA resolves to, not crossing slot
    /// boundaries.
    pub fn gpa_to_hva(&self, addr: u64, len: usize) -> Result<u64, MemoryError> {
        self.with_region(addr, len, |r| Ok(r.host_addr() + (addr - r.gpa_start)))
    }

    pub fn write(&self, addr: u64, data: &[u8]) -> Result<(), MemoryError> {
        self.with_region(addr, data.len(), |r| {
            r.mmap
                .write_slice(data, GuestAddress(addr - r.gpa_start))
                .map_err(|e| MemoryError::Allocate(std::io::Error::other(e.to_string())))
        })
    }

    pub fn read(&self, addr: u64, data: &mut [u8]) -> Result<(), MemoryError> {
        self.with_region(addr, data.len(), |r| {
            r.mmap
                .read_slice(data, GuestAddress(addr - r.gpa_start))
                .map_err(|e| MemoryError::Allocate(std::io::Error::other(e.to_string())))
        })
    }

    pub fn write_u8(&self, addr: u64, value: u8) -> Result<(), MemoryError> {
        self.write(addr, &[value])
    }

    pub fn write_u32(&self, addr: u64, value: u32) -> Result<(), MemoryError> {
        self.write(addr, &value.to_le_bytes())
    }

    pub fn write_u64(&self, addr: u64, value: u64) -> Result<(), MemoryError> {
        self.write(addr, &value.to_le_bytes())
    }

    pub fn read_u32(&self, addr: u64) -> Result<u32, MemoryError> {
        let mut buf = [0u8; 4];
        self.read(addr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn read_u64(&self, addr: u64) -> Result<u64, MemoryError> {
        let mut buf = [0u8; 8];
        self.read(addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }
}

impl Default for MemoryManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Exercises the manager's own bookkeeping against a fake backend so
    // these tests run without real KVM/HVF hardware.
    struct NoopBackend;
    impl Backend for NoopBackend {
        type Vm = ();
        type Vcpu = ();
        fn init() -> Result<(), crate::backend::BackendError> {
            Ok(())
        }
        fn create_vm() -> Result<Self::Vm, crate::backend::BackendError> {
            Ok(())
        }
        fn destroy_vm(_vm: Self::Vm) {}
        fn create_vcpu(_vm: &Self::Vm, _index: u32) -> Result<Self::Vcpu, crate::backend::BackendError> {
            Ok(())
        }
        fn destroy_vcpu(_vcpu: Self::Vcpu) {}
        fn map_memory(_vm: &Self::Vm, _slot: MemorySlot) -> Result<(), crate::backend::BackendError> {
            Ok(())
        }
        fn unmap_memory(_vm: &Self::Vm, _slot: u32) -> Result<(), crate::backend::BackendError> {
            Ok(())
        }
        fn run(
            _vcpu: &Self::Vcpu,
            _handler: &mut dyn crate::backend::ExitHandler,
        ) -> Result<crate::backend::ExitReason, crate::backend::BackendError> {
            unimplemented!()
        }
        fn vcpu_exit(_vcpu: &Self::Vcpu) -> Result<(), crate::backend::BackendError> {
            Ok(())
        }
        fn get_regs(_vcpu: &Self::Vcpu) -> Result<crate::backend::GpRegs, crate::backend::BackendError> {
            unimplemented!()
        }
        fn set_regs(_vcpu: &Self::Vcpu, _regs: &crate::backend::GpRegs) -> Result<(), crate::backend::BackendError> {
            unimplemented!()
        }
        fn get_sregs(_vcpu: &Self::Vcpu) -> Result<crate::backend::SpecialRegs, crate::backend::BackendError> {
            unimplemented!()
        }
        fn set_sregs(_vcpu: &Self::Vcpu, _sregs: &crate::backend::SpecialRegs) -> Result<(), crate::backend::BackendError> {
            unimplemented!()
        }
        fn irq_line(_vm: &Self::Vm, _irq: u32, _level: bool) -> Result<(), crate::backend::BackendError> {
            Ok(())
        }
    }

    #[test]
    fn write_read_roundtrip() {
        let mgr = MemoryManager::new();
        let vm = NoopBackend::create_vm().unwrap();
        mgr.add_region::<NoopBackend>(&vm, 0, 4096).unwrap();
        mgr.write(100, &[1, 2, 3, 4]).unwrap();
        let mut buf = [0u8; 4];
        mgr.read(100, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn unmapped_read_fails() {
        let mgr = MemoryManager::new();
        let vm = NoopBackend::create_vm().unwrap();
        mgr.add_region::<NoopBackend>(&vm, 0, 4096).unwrap();
        let mut buf = [0u8; 4];
        assert!(mgr.read(1_000_000, &mut buf).is_err());
    }

    #[test]
    fn cross_slot_read_fails() {
        let mgr = MemoryManager::new();
        let vm = NoopBackend::create_vm().unwrap();
        mgr.add_region::<NoopBackend>(&vm, 0, 4096).unwrap();
        mgr.add_region::<NoopBackend>(&vm, 8192, 4096).unwrap();
        let mut buf = [0u8; 16];
        assert!(mgr.read(4090, &mut buf).is_err());
    }

    #[test]
    fn overlapping_regions_rejected() {
        let mgr = MemoryManager::new();
        let vm = NoopBackend::create_vm().unwrap();
        mgr.add_region::<NoopBackend>(&vm, 0, 4096).unwrap();
        assert!(mgr.add_region::<NoopBackend>(&vm, 2048, 4096).is_err());
    }

    #[test]
    fn slot_limit_enforced() {
        let mgr = MemoryManager::new();
        let vm = NoopBackend::create_vm().unwrap();
        for i in 0..MAX_SLOTS {
            mgr.add_region::<NoopBackend>(&vm, (i as u64) * 4096, 4096)
                .unwrap();
        }
        assert!(mgr
            .add_region::<NoopBackend>(&vm, (MAX_SLOTS as u64) * 4096, 4096)
            .is_err());
    }

}
