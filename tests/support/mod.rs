pub mod fake_backend;

use std::io::{Read, Write};
use std::os::unix::io::FromRawFd;
use std::sync::Mutex;
use vmmlet::memory::MemoryManager;

/// Guards the process-wide stdout fd against concurrent capture from
/// multiple test threads - `cargo test` runs tests in parallel by
/// default, and redirecting fd 1 is inherently a global operation.
static STDOUT_CAPTURE: Mutex<()> = Mutex::new(());

/// Runs `f` with process stdout redirected to a pipe, returning whatever
/// was written to it. Used to assert on UART/virtio-console output,
/// which both write straight to `io::stdout()`.
pub fn capture_stdout<F: FnOnce()>(f: F) -> String {
    let _guard = STDOUT_CAPTURE.lock().unwrap();
    std::io::stdout().flush().ok();

    let mut fds = [0i32; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    let (read_fd, write_fd) = (fds[0], fds[1]);

    let saved_stdout = unsafe { libc::dup(libc::STDOUT_FILENO) };
    assert!(saved_stdout >= 0);
    assert_eq!(unsafe { libc::dup2(write_fd, libc::STDOUT_FILENO) }, libc::STDOUT_FILENO);
    unsafe { libc::close(write_fd) };

    f();

    std::io::stdout().flush().ok();
    unsafe {
        libc::dup2(saved_stdout, libc::STDOUT_FILENO);
        libc::close(saved_stdout);
    }

    let mut file = unsafe { std::fs::File::from_raw_fd(read_fd) };
    let mut out = String::new();
    file.read_to_string(&mut out).ok();
    out
}

/// Descriptor-table/avail-ring/used-ring layout for one virtqueue, carved
/// out of guest memory at a fixed base so tests can hand-assemble chains
/// without pulling in a guest-side virtio driver.
pub struct RingLayout {
    pub desc_addr: u64,
    pub avail_addr: u64,
    pub used_addr: u64,
    pub queue_size: u32,
}

impl RingLayout {
    pub fn at(base: u64, queue_size: u32) -> Self {
        Self {
            desc_addr: base,
            avail_addr: base + 0x1000,
            used_addr: base + 0x2000,
            queue_size,
        }
    }

    pub fn write_desc(&self, memory: &MemoryManager, index: u16, addr: u64, len: u32, flags: u16, next: u16) {
        let entry = self.desc_addr + (index as u64) * 16;
        memory.write(entry, &addr.to_le_bytes()).unwrap();
        memory.write_u32(entry + 8, len).unwrap();
        memory.write(entry + 12, &flags.to_le_bytes()).unwrap();
        memory.write(entry + 14, &next.to_le_bytes()).unwrap();
    }

    /// Publishes `head` as the next available chain and bumps avail.idx.
    /// Writes the ring slot before the index so a reader never observes a
    /// bumped index with a stale ring entry.
    pub fn publish_avail(&self, memory: &MemoryManager, slot: u16, head: u16, new_idx: u16) {
        let ring_entry = self.avail_addr + 4 + (slot as u64) * 2;
        memory.write(ring_entry, &head.to_le_bytes()).unwrap();
        memory.write(self.avail_addr + 2, &new_idx.to_le_bytes()).unwrap();
    }

    pub fn used_idx(&self, memory: &MemoryManager) -> u16 {
        memory.read_u32(self.used_addr + 2).unwrap() as u16
    }

    pub fn used_entry(&self, memory: &MemoryManager, slot: u16) -> (u32, u32) {
        let entry = self.used_addr + 4 + (slot as u64) * 8;
        (memory.read_u32(entry).unwrap(), memory.read_u32(entry + 4).unwrap())
    }
}
