//! virtio-net: a tap-backed network device. Each notification on the
//! transmitq sends one framed packet per descriptor chain out the tap
//! fd; receive is best-effort and limited to one packet per notify (the
//! device does not poll the tap fd on its own between notifications).

use super::{VirtioError, Virtqueue};
use crate::memory::MemoryManager;
use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};

/// `_IOW('T', 202, int)` - TUNSETIFF, from `linux/if_tun.h`. The kernel
/// encodes this request as carrying an `int` even though callers actually
/// pass a `struct ifreq *`; the size field in the ioctl number is fixed by
/// the header and does not track the real argument type.
const TUNSETIFF: u64 = 0x4004_54ca;

const RECEIVEQ: usize = 0;
const TRANSMITQ: usize = 1;

/// The fixed-size virtio-net packet header prepended to every frame on
/// both the tx and rx virtqueues.
const VNET_HDR_LEN: usize = 10;

mod feature {
    pub const CSUM: u64 = 1 << 0;
}

#[repr(C)]
struct IfReq {
    ifr_name: [u8; 16],
    ifr_flags: i16,
    _pad: [u8; 22],
}

pub struct Tap {
    file: File,
}

impl Tap {
    pub fn open(if_name: &str) -> Result<Self, VirtioError> {
        let fd = unsafe {
            libc::open(
                c"/dev/net/tun".as_ptr(),
                libc::O_RDWR | libc::O_NONBLOCK | libc::O_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(VirtioError::Io(std::io::Error::last_os_error()));
        }
        let file = unsafe { File::from_raw_fd(fd) };

        let mut req = IfReq {
            ifr_name: [0u8; 16],
            ifr_flags: (libc::IFF_TAP | libc::IFF_NO_PI | libc::IFF_VNET_HDR) as i16,
            _pad: [0u8; 22],
        };
        let name_bytes = if_name.as_bytes();
        let n = name_bytes.len().min(15);
        req.ifr_name[..n].copy_from_slice(&name_bytes[..n]);

        let ret = unsafe { libc::ioctl(fd, TUNSETIFF, &mut req as *mut IfReq) };
        if ret < 0 {
            return Err(VirtioError::Io(std::io::Error::last_os_error()));
        }
        Ok(Self { file })
    }
}

impl AsRawFd for Tap {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

pub struct NetDevice {
    tap: Option<Tap>,
}

impl NetDevice {
    pub fn new(if_name: Option<&str>) -> Result<Self, VirtioError> {
        let tap = match if_name {
            Some(name) => Some(Tap::open(name)?),
            None => None,
        };
        Ok(Self { tap })
    }

    pub fn features(&self) -> u64 {
        feature::CSUM
    }

    pub fn config_read(&self, _offset: u64, data: &mut [u8]) {
        data.fill(0);
    }

    pub fn process_queue(
        &mut self,
        queue_index: usize,
        queue: &mut Virtqueue,
        memory: &MemoryManager,
    ) -> Result<bool, VirtioError> {
        match queue_index {
            TRANSMITQ => self.process_tx(queue, memory),
            RECEIVEQ => self.process_rx(queue, memory),
            _ => Ok(false),
        }
    }

    fn process_tx(&mut self, queue: &mut Virtqueue, memory: &MemoryManager) -> Result<bool, VirtioError> {
        let Some(tap) = self.tap.as_mut() else {
            // No tap attached: drain the queue so the driver doesn't stall.
            while let Some(head) = queue.pop_avail(memory)? {
                queue.push_used(memory, head, 0)?;
            }
            return Ok(false);
        };

        let mut raised = false;
        while let Some(head) = queue.pop_avail(memory)? {
            let chain = queue.read_chain(memory, head)?;
            let mut frame = Vec::new();
            for desc in &chain {
                let mut buf = vec![0u8; desc.len as usize];
                memory.read(desc.addr, &mut buf)?;
                frame.extend_from_slice(&buf);
            }
            if frame.len() > VNET_HDR_LEN {
                let _ = tap.file.write(&frame[VNET_HDR_LEN..]);
            }
            queue.push_used(memory, head, 0)?;
            raised = true;
        }
        Ok(raised)
    }

    fn process_rx(&mut self, queue: &mut Virtqueue, memory: &MemoryManager) -> Result<bool, VirtioError> {
        let Some(tap) = self.tap.as_mut() else {
            return Ok(false);
        };
        let Some(head) = queue.pop_avail(memory)? else {
            return Ok(false);
        };
        let chain = queue.read_chain(memory, head)?;
        let Some(first) = chain.first() else {
            return Ok(false);
        };

        let mut packet = vec![0u8; 65536];
        let n = match tap.file.read(&mut packet) {
            Ok(n) if n > 0 => n,
            Ok(_) => return Ok(false),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(false),
            Err(e) => {
                log::warn!("virtio-net: tap read failed: {e}");
                return Ok(false);
            }
        };

        let header = [0u8; VNET_HDR_LEN];
        memory.write(first.addr, &header)?;
        let payload_cap = (first.len as usize).saturating_sub(VNET_HDR_LEN);
        let write_len = n.min(payload_cap);
        memory.write(first.addr + VNET_HDR_LEN as u64, &packet[..write_len])?;

        queue.push_used(memory, head, (VNET_HDR_LEN + write_len) as u32)?;
        Ok(true)
    }
}
