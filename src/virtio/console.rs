//! virtio-console: transmit-only. The driver's receiveq (queue 0) is
//! accepted but never produces data - there is no host-side input source
//! wired up.

use super::{VirtioError, Virtqueue};
use crate::memory::MemoryManager;
use std::io::{self, Write};

const RECEIVEQ: usize = 0;
const TRANSMITQ: usize = 1;

pub struct ConsoleDevice;

impl ConsoleDevice {
    pub fn new() -> Self {
        Self
    }

    pub fn features(&self) -> u64 {
        0
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
        if queue_index == RECEIVEQ {
            return Ok(false);
        }
        if queue_index != TRANSMITQ {
            return Ok(false);
        }

        let mut raised = false;
        while let Some(head) = queue.pop_avail(memory)? {
            let chain = queue.read_chain(memory, head)?;
            for desc in &chain {
                let mut buf = vec![0u8; desc.len as usize];
                memory.read(desc.addr, &mut buf)?;
                let _ = io::stdout().write_all(&buf);
            }
            let _ = io::stdout().flush();
            // Completion is signalled with written-length 0 - there is no
            // notion of bytes written back to a tx-only queue.
            queue.push_used(memory, head, 0)?;
            raised = true;
        }
        Ok(raised)
    }
}

impl Default for ConsoleDevice {
    fn default() -> Self {
        Self::new()
    }
}
