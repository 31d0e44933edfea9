//! MMIO bus: dispatches guest memory-mapped I/O to whichever device owns
//! the targeted address range, plus the IRQ-line signaling devices use to
//! tell the vCPU runner an interrupt is pending.

use crate::memory::MemoryManager;
use crate::virtio::VirtioMmioDevice;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Hard cap on the number of devices a bus may carry.
pub const MAX_DEVICES: usize = 16;

#[derive(Error, Debug)]
pub enum BusError {
    #[error("mmio device capacity ({MAX_DEVICES}) exceeded")]
    TooManyDevices,

    #[error("mmio range [{new_start:#x}, {new_end:#x}) overlaps existing [{existing_start:#x}, {existing_end:#x})")]
    Overlap {
        new_start: u64,
        new_end: u64,
        existing_start: u64,
        existing_end: u64,
    },
}

/// A shared interrupt line a device can assert/deassert and the vCPU
/// runner can query. Routing an asserted line into a real GSI injection
/// (`Backend::irq_line`) needs an IOAPIC/GSI-routing model this VMM
/// doesn't implement, so for now a device only ever flips `interrupt_status`
/// and this flag without ever injecting an interrupt into the guest.
#[derive(Clone)]
pub struct IrqLine {
    gsi: u32,
    pending: Arc<AtomicBool>,
}

impl IrqLine {
    pub fn new(gsi: u32) -> std::io::Result<Self> {
        Ok(Self {
            gsi,
            pending: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn gsi(&self) -> u32 {
        self.gsi
    }

    pub fn assert(&self) {
        self.pending.store(true, Ordering::SeqCst);
    }

    pub fn deassert(&self) {
        self.pending.store(false, Ordering::SeqCst);
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }
}

/// The small, closed set of devices that can sit on the MMIO bus. An
/// enum instead of `Box<dyn MmioDevice>` keeps dispatch a single match
/// with no vtable indirection, matching the fixed device roster this VMM
/// supports.
pub enum DeviceKind {
    Uart(crate::device::uart::Uart16550, IrqLine),
    VirtioMmio(VirtioMmioDevice),
}

impl DeviceKind {
    fn read(&mut self, offset: u64, data: &mut [u8], _memory: &MemoryManager) {
        match self {
            DeviceKind::Uart(uart, _) => {
                if let Some(first) = data.first_mut() {
                    *first = uart.read(offset as u16);
                }
                for b in data.iter_mut().skip(1) {
                    *b = 0;
                }
            }
            DeviceKind::VirtioMmio(dev) => dev.read(offset, data),
        }
    }

    fn write(&mut self, offset: u64, data: &[u8], memory: &MemoryManager) {
        match self {
            DeviceKind::Uart(uart, _) => {
                if let Some(&first) = data.first() {
                    uart.write(offset as u16, first);
                }
            }
            DeviceKind::VirtioMmio(dev) => dev.write(offset, data, memory),
        }
    }
}

struct Entry {
    base: u64,
    size: u64,
    device: DeviceKind,
}

/// Non-overlapping `[base, base+size)` device ranges, scanned linearly -
/// the device count is small enough (single digits) that a linear scan
/// beats any indexed structure's setup cost.
pub struct MmioBus {
    entries: Vec<Entry>,
}

impl MmioBus {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn register(&mut self, base: u64, size: u64, device: DeviceKind) -> Result<(), BusError> {
        if self.entries.len() >= MAX_DEVICES {
            return Err(BusError::TooManyDevices);
        }
        let new_end = base + size;
        for e in &self.entries {
            if base < e.base + e.size && e.base < new_end {
                return Err(BusError::Overlap {
                    new_start: base,
                    new_end,
                    existing_start: e.base,
                    existing_end: e.base + e.size,
                });
            }
        }
        self.entries.push(Entry { base, size, device });
        Ok(())
    }

    fn find(&mut self, addr: u64) -> Option<&mut Entry> {
        self.entries
            .iter_mut()
            .find(|e| addr >= e.base && addr < e.base + e.size)
    }

    /// Reads from an unmapped address return zero rather than propagating
    /// an error - an unclaimed MMIO window reads as all-zero hardware,
    /// never as a bus fault.
    pub fn read(&mut self, addr: u64, data: &mut [u8], memory: &MemoryManager) {
        match self.find(addr) {
            Some(entry) => {
                let offset = addr - entry.base;
                entry.device.read(offset, data, memory);
            }
            None => data.fill(0),
        }
    }

    /// Writes to an unmapped address are silently dropped.
    pub fn write(&mut self, addr: u64, data: &[u8], memory: &MemoryManager) {
        if let Some(entry) = self.find(addr) {
            let offset = addr - entry.base;
            entry.device.write(offset, data, memory);
        }
    }
}

impl Default for MmioBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmapped_read_returns_zero() {
        let mut bus = MmioBus::new();
        let memory = MemoryManager::new();
        let mut buf = [0xffu8; 4];
        bus.read(0x1000, &mut buf, &memory);
        assert_eq!(buf, [0, 0, 0, 0]);
    }

    #[test]
    fn unmapped_write_is_ignored() {
        let mut bus = MmioBus::new();
        let memory = MemoryManager::new();
        // Should not panic even though nothing is registered.
        bus.write(0x2000, &[1, 2, 3, 4], &memory);
    }

    #[test]
    fn registered_device_receives_offset_relative_access() {
        let mut bus = MmioBus::new();
        let memory = MemoryManager::new();
        let irq = IrqLine::new(5).unwrap();
        bus.register(
            0x9000_0000,
            0x1000,
            DeviceKind::Uart(crate::device::uart::Uart16550::new(), irq),
        )
        .unwrap();
        bus.write(0x9000_0007, &[0x42], &memory); // SCR offset
        let mut buf = [0u8; 1];
        bus.read(0x9000_0007, &mut buf, &memory);
        assert_eq!(buf[0], 0x42);
    }

    #[test]
    fn overlapping_device_registration_rejected() {
        let mut bus = MmioBus::new();
        bus.register(
            0x9000_0000,
            0x1000,
            DeviceKind::Uart(crate::device::uart::Uart16550::new(), IrqLine::new(5).unwrap()),
        )
        .unwrap();
        let err = bus.register(
            0x9000_0800,
            0x1000,
            DeviceKind::Uart(crate::device::uart::Uart16550::new(), IrqLine::new(6).unwrap()),
        );
        assert!(err.is_err());
    }

    #[test]
    fn device_capacity_enforced() {
        let mut bus = MmioBus::new();
        for i in 0..MAX_DEVICES {
            bus.register(
                (i as u64) * 0x1000,
                0x1000,
                DeviceKind::Uart(crate::device::uart::Uart16550::new(), IrqLine::new(i as u32).unwrap()),
            )
            .unwrap();
        }
        let err = bus.register(
            (MAX_DEVICES as u64) * 0x1000,
            0x1000,
            DeviceKind::Uart(crate::device::uart::Uart16550::new(), IrqLine::new(99).unwrap()),
        );
        assert!(matches!(err, Err(BusError::TooManyDevices)));
    }
}
