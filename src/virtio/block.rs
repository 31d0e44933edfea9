//! virtio-blk: a single request queue processing 3-descriptor chains
//! (header, data, status), backed by a plain file opened read-write
//! (falling back to read-only) and accessed with positioned I/O so no
//! separate file-offset bookkeeping is needed across requests.

use super::{VirtioError, Virtqueue};
use crate::memory::MemoryManager;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;

mod feature {
    pub const RO: u64 = 1 << 5;
    pub const FLUSH: u64 = 1 << 9;
}

mod req_type {
    pub const IN: u32 = 0;
    pub const OUT: u32 = 1;
    pub const FLUSH: u32 = 4;
}

mod status {
    pub const OK: u8 = 0;
    pub const IOERR: u8 = 1;
    pub const UNSUPP: u8 = 2;
}

const SECTOR_SIZE: u64 = 512;

pub struct BlockDevice {
    file: File,
    read_only: bool,
    capacity_sectors: u64,
}

impl BlockDevice {
    pub fn open(path: &str) -> Result<Self, VirtioError> {
        let (file, read_only) = match OpenOptions::new().read(true).write(true).open(path) {
            Ok(f) => (f, false),
            Err(_) => (OpenOptions::new().read(true).open(path)?, true),
        };
        let len = file.metadata()?.len();
        Ok(Self {
            file,
            read_only,
            capacity_sectors: len / SECTOR_SIZE,
        })
    }

    pub fn features(&self) -> u64 {
        if self.read_only {
            feature::RO | feature::FLUSH
        } else {
            feature::FLUSH
        }
    }

    pub fn config_read(&self, offset: u64, data: &mut [u8]) {
        data.fill(0);
        if offset == 0 && data.len() >= 8 {
            data[..8].copy_from_slice(&self.capacity_sectors.to_le_bytes());
        }
    }

    pub fn process_queue(
        &mut self,
        _queue_index: usize,
        queue: &mut Virtqueue,
        memory: &MemoryManager,
    ) -> Result<bool, VirtioError> {
        let mut raised = false;
        while let Some(head) = queue.pop_avail(memory)? {
            let chain = queue.read_chain(memory, head)?;
            if chain.len() < 2 {
                queue.push_used(memory, head, 0)?;
                raised = true;
                continue;
            }
            let header = &chain[0];
            let status_desc = chain.last().unwrap();
            let data_descs = &chain[1..chain.len() - 1];

            let mut hdr_buf = [0u8; 16];
            memory.read(header.addr, &mut hdr_buf)?;
            let req_type = u32::from_le_bytes(hdr_buf[0..4].try_into().unwrap());
            let sector = u64::from_le_bytes(hdr_buf[8..16].try_into().unwrap());

            let result_status = match req_type {
                req_type::IN => self.handle_read(memory, sector, data_descs),
                req_type::OUT => self.handle_write(memory, sector, data_descs),
                req_type::FLUSH => self.handle_flush(),
                _ => Ok(status::UNSUPP),
            }
            .unwrap_or(status::IOERR);

            memory.write_u8(status_desc.addr, result_status)?;
            queue.push_used(memory, head, 1)?;
            raised = true;
        }
        Ok(raised)
    }

    fn handle_read(
        &self,
        memory: &MemoryManager,
        sector: u64,
        data_descs: &[super::VqDesc],
    ) -> Result<u8, VirtioError> {
        let mut file_offset = sector * SECTOR_SIZE;
        for desc in data_descs {
            let mut buf = vec![0u8; desc.len as usize];
            self.file.read_exact_at(&mut buf, file_offset)?;
            memory.write(desc.addr, &buf)?;
            file_offset += desc.len as u64;
        }
        Ok(status::OK)
    }

    fn handle_write(
        &self,
        memory: &MemoryManager,
        sector: u64,
        data_descs: &[super::VqDesc],
    ) -> Result<u8, VirtioError> {
        if self.read_only {
            return Ok(status::IOERR);
        }
        let mut file_offset = sector * SECTOR_SIZE;
        for desc in data_descs {
            let mut buf = vec![0u8; desc.len as usize];
            memory.read(desc.addr, &mut buf)?;
            self.file.write_all_at(&buf, file_offset)?;
            file_offset += desc.len as u64;
        }
        Ok(status::OK)
    }

    fn handle_flush(&self) -> Result<u8, VirtioError> {
        self.file.sync_all()?;
        Ok(status::OK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn capacity_read_from_file_len() {
        let path = std::env::temp_dir().join(format!("vmmlet-blk-test-{}", std::process::id()));
        {
            let mut f = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)
                .unwrap();
            f.write_all(&[0u8; 4096]).unwrap();
        }
        let dev = BlockDevice::open(path.to_str().unwrap()).unwrap();
        assert_eq!(dev.capacity_sectors, 8);
        let mut cfg = [0u8; 8];
        dev.config_read(0, &mut cfg);
        assert_eq!(u64::from_le_bytes(cfg), 8);
        std::fs::remove_file(&path).ok();
    }
}
