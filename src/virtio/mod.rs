//! Legacy (pre-1.0) virtio-mmio transport: register layout, the
//! virtqueue descriptor/avail/used ring engine, and the console/block/net
//! device personalities built on top of it.

pub mod block;
pub mod console;
pub mod net;

use crate::device::bus::IrqLine;
use crate::memory::MemoryManager;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VirtioError {
    #[error("descriptor index {0} out of range")]
    BadDescriptor(u16),

    #[error("descriptor chain exceeds {0} entries (possible cycle)")]
    ChainTooLong(usize),

    #[error(transparent)]
    Memory(#[from] crate::memory::MemoryError),

    #[error("block I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Register offsets from the legacy virtio-mmio specification, plus a
/// set of implementer-added registers (0x080-0x0A4) carrying the
/// descriptor/avail/used ring addresses - the legacy spec leaves queue
/// address configuration to `QUEUE_PFN`-style registers this transport
/// does not model, so this layout exposes the three ring addresses
/// directly instead.
pub mod reg {
    pub const MAGIC: u64 = 0x000;
    pub const VERSION: u64 = 0x004;
    pub const DEVICE_ID: u64 = 0x008;
    pub const VENDOR_ID: u64 = 0x00c;
    pub const DEVICE_FEATURES: u64 = 0x010;
    pub const DEVICE_FEATURES_SEL: u64 = 0x014;
    pub const DRIVER_FEATURES: u64 = 0x018;
    pub const DRIVER_FEATURES_SEL: u64 = 0x01c;
    pub const QUEUE_SEL: u64 = 0x024;
    pub const QUEUE_NUM_MAX: u64 = 0x028;
    pub const QUEUE_NUM: u64 = 0x02c;
    pub const QUEUE_READY: u64 = 0x030;
    pub const QUEUE_NOTIFY: u64 = 0x034;
    pub const INTERRUPT_STATUS: u64 = 0x038;
    pub const INTERRUPT_ACK: u64 = 0x03c;
    pub const DEVICE_STATUS: u64 = 0x040;
    pub const QUEUE_DESC_LOW: u64 = 0x080;
    pub const QUEUE_DESC_HIGH: u64 = 0x084;
    pub const QUEUE_AVAIL_LOW: u64 = 0x090;
    pub const QUEUE_AVAIL_HIGH: u64 = 0x094;
    pub const QUEUE_USED_LOW: u64 = 0x0a0;
    pub const QUEUE_USED_HIGH: u64 = 0x0a4;
    pub const CONFIG: u64 = 0x100;
}

pub const VIRTIO_MAGIC: u32 = 0x7472_6976; // "virt"
pub const VIRTIO_VERSION_LEGACY: u32 = 1;
pub const VENDOR_ID: u32 = 0x4d4d_5652; // "VRMM", arbitrary

pub mod status {
    pub const ACKNOWLEDGE: u32 = 1;
    pub const DRIVER: u32 = 2;
    pub const DRIVER_OK: u32 = 4;
    pub const FEATURES_OK: u32 = 8;
    pub const FAILED: u32 = 0x80;
}

pub mod device_id {
    pub const NET: u32 = 1;
    pub const BLOCK: u32 = 2;
    pub const CONSOLE: u32 = 3;
}

pub const VIRTIO_F_VERSION_1: u64 = 1 << 32;

const QUEUE_NUM_MAX_DEFAULT: u32 = 256;
const MAX_CHAIN_LEN: usize = 1024;

const VRING_DESC_F_NEXT: u16 = 1;
const VRING_DESC_F_WRITE: u16 = 2;

#[derive(Debug, Clone, Copy, Default)]
pub struct VqDesc {
    pub addr: u64,
    pub len: u32,
    pub flags: u16,
    pub next: u16,
}

impl VqDesc {
    fn read_from(memory: &MemoryManager, table_addr: u64, index: u16) -> Result<Self, VirtioError> {
        let base = table_addr + (index as u64) * 16;
        let mut buf = [0u8; 16];
        memory.read(base, &mut buf)?;
        Ok(VqDesc {
            addr: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            len: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            flags: u16::from_le_bytes(buf[12..14].try_into().unwrap()),
            next: u16::from_le_bytes(buf[14..16].try_into().unwrap()),
        })
    }

    pub fn is_write_only(&self) -> bool {
        self.flags & VRING_DESC_F_WRITE != 0
    }

    fn has_next(&self) -> bool {
        self.flags & VRING_DESC_F_NEXT != 0
    }
}

/// A single chained descriptor-table/avail-ring/used-ring queue.
pub struct Virtqueue {
    pub size: u32,
    pub ready: bool,
    pub desc_addr: u64,
    pub avail_addr: u64,
    pub used_addr: u64,
    last_avail_idx: u16,
    last_used_idx: u16,
}

impl Virtqueue {
    fn new() -> Self {
        Self {
            size: 0,
            ready: false,
            desc_addr: 0,
            avail_addr: 0,
            used_addr: 0,
            last_avail_idx: 0,
            last_used_idx: 0,
        }
    }

    fn avail_idx(&self, memory: &MemoryManager) -> Result<u16, VirtioError> {
        Ok(memory.read_u32(self.avail_addr + 2)? as u16)
    }

    pub fn has_pending(&self, memory: &MemoryManager) -> bool {
        match self.avail_idx(memory) {
            Ok(idx) => idx != self.last_avail_idx,
            Err(_) => false,
        }
    }

    /// Returns the head descriptor index of the next available chain, or
    /// `None` if the ring is empty.
    pub fn pop_avail(&mut self, memory: &MemoryManager) -> Result<Option<u16>, VirtioError> {
        let avail_idx = self.avail_idx(memory)?;
        if avail_idx == self.last_avail_idx {
            return Ok(None);
        }
        let ring_offset = 4 + (self.last_avail_idx as u64 % self.size as u64) * 2;
        let head = memory.read_u32(self.avail_addr + ring_offset)? as u16;
        self.last_avail_idx = self.last_avail_idx.wrapping_add(1);
        Ok(Some(head))
    }

    /// Walks a chain starting at `head`, returning each descriptor in
    /// order. Bounded by `MAX_CHAIN_LEN` to reject cyclic `next` links.
    pub fn read_chain(&self, memory: &MemoryManager, head: u16) -> Result<Vec<VqDesc>, VirtioError> {
        let mut chain = Vec::new();
        let mut index = head;
        loop {
            if index as u32 >= self.size {
                return Err(VirtioError::BadDescriptor(index));
            }
            let desc = VqDesc::read_from(memory, self.desc_addr, index)?;
            let has_next = desc.has_next();
            let next = desc.next;
            chain.push(desc);
            if chain.len() > MAX_CHAIN_LEN {
                return Err(VirtioError::ChainTooLong(MAX_CHAIN_LEN));
            }
            if !has_next {
                break;
            }
            index = next;
        }
        Ok(chain)
    }

    /// Publishes `len` bytes written for the chain headed by `desc_index`
    /// into the used ring and advances it.
    pub fn push_used(
        &mut self,
        memory: &MemoryManager,
        desc_index: u16,
        len: u32,
    ) -> Result<(), VirtioError> {
        let slot = self.last_used_idx as u64 % self.size as u64;
        let entry_addr = self.used_addr + 4 + slot * 8;
        memory.write_u32(entry_addr, desc_index as u32)?;
        memory.write_u32(entry_addr + 4, len)?;
        self.last_used_idx = self.last_used_idx.wrapping_add(1);
        memory.write_u32(self.used_addr + 2, self.last_used_idx as u32)?;
        Ok(())
    }
}

/// Device-specific behavior a virtio-mmio transport drives: config space
/// reads/writes and queue notification handling. Implemented by an enum
/// rather than a trait object, matching the closed, small set of
/// personalities this VMM supports.
pub enum Personality {
    Console(console::ConsoleDevice),
    Block(block::BlockDevice),
    Net(net::NetDevice),
}

impl Personality {
    fn device_id(&self) -> u32 {
        match self {
            Personality::Console(_) => device_id::CONSOLE,
            Personality::Block(_) => device_id::BLOCK,
            Personality::Net(_) => device_id::NET,
        }
    }

    fn device_features(&self) -> u64 {
        VIRTIO_F_VERSION_1
            | match self {
                Personality::Console(d) => d.features(),
                Personality::Block(d) => d.features(),
                Personality::Net(d) => d.features(),
            }
    }

    fn config_read(&self, offset: u64, data: &mut [u8]) {
        match self {
            Personality::Console(d) => d.config_read(offset, data),
            Personality::Block(d) => d.config_read(offset, data),
            Personality::Net(d) => d.config_read(offset, data),
        }
    }

    fn queue_count(&self) -> usize {
        match self {
            Personality::Console(_) => 2,
            Personality::Block(_) => 1,
            Personality::Net(_) => 2,
        }
    }

    fn notify(
        &mut self,
        queue_index: usize,
        queue: &mut Virtqueue,
        memory: &MemoryManager,
    ) -> Result<bool, VirtioError> {
        match self {
            Personality::Console(d) => d.process_queue(queue_index, queue, memory),
            Personality::Block(d) => d.process_queue(queue_index, queue, memory),
            Personality::Net(d) => d.process_queue(queue_index, queue, memory),
        }
    }
}

/// The full legacy-MMIO transport state for one virtio device.
pub struct VirtioMmioDevice {
    pub personality: Personality,
    pub irq: IrqLine,
    queues: Vec<Virtqueue>,
    queue_sel: u32,
    device_features_sel: u32,
    driver_features: [u32; 2],
    status: u32,
    interrupt_status: u32,
}

impl VirtioMmioDevice {
    pub fn new(personality: Personality, irq: IrqLine) -> Self {
        let queue_count = personality.queue_count();
        let queues = (0..queue_count).map(|_| Virtqueue::new()).collect();
        Self {
            personality,
            irq,
            queues,
            queue_sel: 0,
            device_features_sel: 0,
            driver_features: [0, 0],
            status: 0,
            interrupt_status: 0,
        }
    }

    fn selected_queue(&mut self) -> Option<&mut Virtqueue> {
        self.queues.get_mut(self.queue_sel as usize)
    }

    pub fn read(&mut self, offset: u64, data: &mut [u8]) {
        if offset >= reg::CONFIG {
            self.personality.config_read(offset - reg::CONFIG, data);
            return;
        }
        let value: u32 = match offset {
            reg::MAGIC => VIRTIO_MAGIC,
            reg::VERSION => VIRTIO_VERSION_LEGACY,
            reg::DEVICE_ID => self.personality.device_id(),
            reg::VENDOR_ID => VENDOR_ID,
            reg::DEVICE_FEATURES => {
                let features = self.personality.device_features();
                if self.device_features_sel == 0 {
                    features as u32
                } else {
                    (features >> 32) as u32
                }
            }
            reg::QUEUE_NUM_MAX => QUEUE_NUM_MAX_DEFAULT,
            reg::QUEUE_READY => self
                .selected_queue()
                .map(|q| q.ready as u32)
                .unwrap_or(0),
            reg::INTERRUPT_STATUS => self.interrupt_status,
            reg::DEVICE_STATUS => self.status,
            reg::QUEUE_DESC_LOW => self.selected_queue().map(|q| q.desc_addr as u32).unwrap_or(0),
            reg::QUEUE_DESC_HIGH => self
                .selected_queue()
                .map(|q| (q.desc_addr >> 32) as u32)
                .unwrap_or(0),
            reg::QUEUE_AVAIL_LOW => self.selected_queue().map(|q| q.avail_addr as u32).unwrap_or(0),
            reg::QUEUE_AVAIL_HIGH => self
                .selected_queue()
                .map(|q| (q.avail_addr >> 32) as u32)
                .unwrap_or(0),
            reg::QUEUE_USED_LOW => self.selected_queue().map(|q| q.used_addr as u32).unwrap_or(0),
            reg::QUEUE_USED_HIGH => self
                .selected_queue()
                .map(|q| (q.used_addr >> 32) as u32)
                .unwrap_or(0),
            _ => 0,
        };
        write_le(data, value);
    }

    pub fn write(&mut self, offset: u64, data: &[u8], memory: &MemoryManager) {
        if offset >= reg::CONFIG {
            // Config space is read-only for every personality this VMM
            // implements.
            return;
        }
        let value = read_le(data);
        match offset {
            reg::DEVICE_FEATURES_SEL => self.device_features_sel = value,
            reg::DRIVER_FEATURES_SEL => {
                // Selector recorded implicitly via which half is written next.
                self.driver_features_sel_hint(value);
            }
            reg::DRIVER_FEATURES => self.write_driver_features(value),
            reg::QUEUE_SEL => self.queue_sel = value,
            reg::QUEUE_NUM => {
                if let Some(q) = self.selected_queue() {
                    q.size = value.min(QUEUE_NUM_MAX_DEFAULT).max(1);
                }
            }
            reg::QUEUE_READY => {
                if let Some(q) = self.selected_queue() {
                    q.ready = value != 0;
                }
            }
            reg::QUEUE_NOTIFY => self.handle_notify(value as usize, memory),
            reg::INTERRUPT_ACK => self.interrupt_status &= !value,
            reg::DEVICE_STATUS => self.status = value,
            reg::QUEUE_DESC_LOW => self.set_queue_addr_low(|q| &mut q.desc_addr, value),
            reg::QUEUE_DESC_HIGH => self.set_queue_addr_high(|q| &mut q.desc_addr, value),
            reg::QUEUE_AVAIL_LOW => self.set_queue_addr_low(|q| &mut q.avail_addr, value),
            reg::QUEUE_AVAIL_HIGH => self.set_queue_addr_high(|q| &mut q.avail_addr, value),
            reg::QUEUE_USED_LOW => self.set_queue_addr_low(|q| &mut q.used_addr, value),
            reg::QUEUE_USED_HIGH => self.set_queue_addr_high(|q| &mut q.used_addr, value),
            _ => {}
        }
    }

    fn driver_features_sel_hint(&mut self, _value: u32) {}

    fn write_driver_features(&mut self, value: u32) {
        let idx = self.device_features_sel.min(1) as usize;
        self.driver_features[idx] = value;
    }

    fn set_queue_addr_low(&mut self, field: impl Fn(&mut Virtqueue) -> &mut u64, value: u32) {
        if let Some(q) = self.selected_queue() {
            let f = field(q);
            *f = (*f & 0xffff_ffff_0000_0000) | value as u64;
        }
    }

    fn set_queue_addr_high(&mut self, field: impl Fn(&mut Virtqueue) -> &mut u64, value: u32) {
        if let Some(q) = self.selected_queue() {
            let f = field(q);
            *f = (*f & 0x0000_0000_ffff_ffff) | ((value as u64) << 32);
        }
    }

    fn handle_notify(&mut self, queue_index: usize, memory: &MemoryManager) {
        let Some(queue) = self.queues.get_mut(queue_index) else {
            return;
        };
        if !queue.ready {
            return;
        }
        match self.personality.notify(queue_index, queue, memory) {
            Ok(raised) => {
                if raised {
                    self.interrupt_status |= 1;
                    self.irq.assert();
                }
            }
            Err(e) => log::warn!("virtio queue {queue_index} notify failed: {e}"),
        }
    }
}

fn read_le(data: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    let n = data.len().min(4);
    buf[..n].copy_from_slice(&data[..n]);
    u32::from_le_bytes(buf)
}

fn write_le(data: &mut [u8], value: u32) {
    let bytes = value.to_le_bytes();
    let n = data.len().min(4);
    data[..n].copy_from_slice(&bytes[..n]);
}
