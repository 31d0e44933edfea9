//! Cross-module integration tests driven against a scripted fake backend:
//! each test configures guest memory and/or devices, scripts a sequence of
//! vCPU exits, runs it to completion, and inspects the resulting device
//! and guest-memory state.

mod support;

use std::sync::{Arc, Mutex};
use support::fake_backend::{ExitStep, FakeBackend};
use support::{capture_stdout, RingLayout};
use vmmlet::backend::GpRegs;
use vmmlet::device::bus::{DeviceKind, IrqLine};
use vmmlet::virtio::block::BlockDevice;
use vmmlet::virtio::console::ConsoleDevice;
use vmmlet::virtio::{reg, status, Personality, VirtioMmioDevice};
use vmmlet::vm::Vm;

const VRING_DESC_F_NEXT: u16 = 1;
const VRING_DESC_F_WRITE: u16 = 2;

fn new_vm(mem_size: u64) -> Vm<FakeBackend> {
    let mut vm = Vm::<FakeBackend>::create().unwrap();
    vm.add_memory_region(0, mem_size).unwrap();
    vm
}

#[test]
fn boot_and_halt() {
    let mut vm = new_vm(64 * 1024 * 1024);
    vm.backend_vm().set_script(0, vec![ExitStep::Hlt]);

    vm.start(vec![(GpRegs::default(), None)]).unwrap();
    vm.join().unwrap();

    // Hlt is non-fatal (the vcpu loops back into run), so the thread only
    // stops once the script runs dry and the fake backend reports
    // Shutdown: one counted exit for each.
    assert_eq!(vm.total_exit_count(), 2);
}

#[test]
fn serial_hello() {
    let mut vm = new_vm(1024 * 1024);
    let steps = vec![
        ExitStep::IoOut { port: 0x3f8, data: vec![0x48] },
        ExitStep::IoOut { port: 0x3f8, data: vec![0x69] },
        ExitStep::IoOut { port: 0x3f8, data: vec![0x0A] },
        ExitStep::Hlt,
    ];
    vm.backend_vm().set_script(0, steps);

    let output = capture_stdout(|| {
        vm.start(vec![(GpRegs::default(), None)]).unwrap();
        vm.join().unwrap();
    });

    assert_eq!(output, "Hi\n");
    // 3 IoOut + Hlt (non-fatal, loops back) + the trailing Shutdown once
    // the script runs dry.
    assert_eq!(vm.total_exit_count(), 5);
}

#[test]
fn virtio_console_write() {
    const BASE: u64 = 0xd000_0000;
    const TXQ: u32 = 1; // virtio-console: queue 0 is receiveq, queue 1 is transmitq.

    let mut vm = new_vm(4 * 1024 * 1024);
    let irq = IrqLine::new(5).unwrap();
    let irq_probe = irq.clone();
    {
        let mut bus = vm.devices.bus.lock().unwrap();
        bus.register(
            BASE,
            0x200,
            DeviceKind::VirtioMmio(VirtioMmioDevice::new(Personality::Console(ConsoleDevice::new()), irq)),
        )
        .unwrap();
    }

    // Two descriptors chained together, each carrying one byte of "ok" -
    // exercises chain-walking, not just a single-descriptor buffer.
    let ring = RingLayout::at(0x10_0000, 2);
    let payload0 = 0x20_0000u64;
    let payload1 = payload0 + 1;
    vm.memory.write(payload0, b"o").unwrap();
    vm.memory.write(payload1, b"k").unwrap();
    ring.write_desc(&vm.memory, 0, payload0, 1, VRING_DESC_F_NEXT, 1);
    ring.write_desc(&vm.memory, 1, payload1, 1, 0, 0);
    ring.publish_avail(&vm.memory, 0, 0, 1);

    let status_capture = Arc::new(Mutex::new(Vec::new()));
    let reg_addr = |r: u64| BASE + r;
    let steps = vec![
        ExitStep::MmioWrite { addr: reg_addr(reg::DEVICE_STATUS), data: status::ACKNOWLEDGE.to_le_bytes().to_vec() },
        ExitStep::MmioWrite {
            addr: reg_addr(reg::DEVICE_STATUS),
            data: (status::ACKNOWLEDGE | status::DRIVER).to_le_bytes().to_vec(),
        },
        ExitStep::MmioRead { addr: reg_addr(reg::DEVICE_STATUS), len: 4, capture: Some(status_capture.clone()) },
        ExitStep::MmioWrite { addr: reg_addr(reg::QUEUE_SEL), data: TXQ.to_le_bytes().to_vec() },
        ExitStep::MmioWrite { addr: reg_addr(reg::QUEUE_NUM), data: 2u32.to_le_bytes().to_vec() },
        ExitStep::MmioWrite { addr: reg_addr(reg::QUEUE_DESC_LOW), data: (ring.desc_addr as u32).to_le_bytes().to_vec() },
        ExitStep::MmioWrite {
            addr: reg_addr(reg::QUEUE_DESC_HIGH),
            data: ((ring.desc_addr >> 32) as u32).to_le_bytes().to_vec(),
        },
        ExitStep::MmioWrite {
            addr: reg_addr(reg::QUEUE_AVAIL_LOW),
            data: (ring.avail_addr as u32).to_le_bytes().to_vec(),
        },
        ExitStep::MmioWrite {
            addr: reg_addr(reg::QUEUE_AVAIL_HIGH),
            data: ((ring.avail_addr >> 32) as u32).to_le_bytes().to_vec(),
        },
        ExitStep::MmioWrite { addr: reg_addr(reg::QUEUE_USED_LOW), data: (ring.used_addr as u32).to_le_bytes().to_vec() },
        ExitStep::MmioWrite {
            addr: reg_addr(reg::QUEUE_USED_HIGH),
            data: ((ring.used_addr >> 32) as u32).to_le_bytes().to_vec(),
        },
        ExitStep::MmioWrite { addr: reg_addr(reg::QUEUE_READY), data: 1u32.to_le_bytes().to_vec() },
        ExitStep::MmioWrite {
            addr: reg_addr(reg::DEVICE_STATUS),
            data: (status::ACKNOWLEDGE | status::DRIVER | status::FEATURES_OK | status::DRIVER_OK)
                .to_le_bytes()
                .to_vec(),
        },
        ExitStep::MmioWrite { addr: reg_addr(reg::QUEUE_NOTIFY), data: TXQ.to_le_bytes().to_vec() },
        ExitStep::Hlt,
    ];
    vm.backend_vm().set_script(0, steps);

    let output = capture_stdout(|| {
        vm.start(vec![(GpRegs::default(), None)]).unwrap();
        vm.join().unwrap();
    });

    assert_eq!(output, "ok");
    assert_eq!(
        *status_capture.lock().unwrap(),
        (status::ACKNOWLEDGE | status::DRIVER).to_le_bytes().to_vec(),
        "mmio write followed by read at the same offset must return the written value",
    );
    assert_eq!(ring.used_idx(&vm.memory), 1);
    assert_eq!(ring.used_entry(&vm.memory, 0), (0, 0), "console completion reports written-length 0");
    assert!(irq_probe.is_pending(), "notify should have asserted the device's irq exactly once");
}

#[test]
fn virtio_block_read_sector_zero() {
    const BASE: u64 = 0xd000_1000;

    let backing_path = std::env::temp_dir().join(format!("vmmlet-scenario-blk-{}", std::process::id()));
    std::fs::write(&backing_path, vec![0xA5u8; 512]).unwrap();
    let block = BlockDevice::open(backing_path.to_str().unwrap()).unwrap();

    let mut vm = new_vm(4 * 1024 * 1024);
    let irq = IrqLine::new(6).unwrap();
    {
        let mut bus = vm.devices.bus.lock().unwrap();
        bus.register(BASE, 0x200, DeviceKind::VirtioMmio(VirtioMmioDevice::new(Personality::Block(block), irq)))
            .unwrap();
    }

    let ring = RingLayout::at(0x10_0000, 4);
    let header_addr = 0x20_0000u64;
    let data_addr = 0x21_0000u64;
    let status_addr = 0x22_0000u64;

    let mut header = [0u8; 16];
    header[0..4].copy_from_slice(&0u32.to_le_bytes()); // VIRTIO_BLK_T_IN
    header[8..16].copy_from_slice(&0u64.to_le_bytes()); // sector 0
    vm.memory.write(header_addr, &header).unwrap();
    vm.memory.write(data_addr, &[0u8; 512]).unwrap();
    vm.memory.write_u8(status_addr, 0xff).unwrap(); // sentinel, must be overwritten with OK (0)

    ring.write_desc(&vm.memory, 0, header_addr, 16, VRING_DESC_F_NEXT, 1);
    ring.write_desc(&vm.memory, 1, data_addr, 512, VRING_DESC_F_NEXT | VRING_DESC_F_WRITE, 2);
    ring.write_desc(&vm.memory, 2, status_addr, 1, VRING_DESC_F_WRITE, 0);
    ring.publish_avail(&vm.memory, 0, 0, 1);

    let reg_addr = |r: u64| BASE + r;
    let steps = vec![
        ExitStep::MmioWrite { addr: reg_addr(reg::QUEUE_SEL), data: 0u32.to_le_bytes().to_vec() },
        ExitStep::MmioWrite { addr: reg_addr(reg::QUEUE_NUM), data: 4u32.to_le_bytes().to_vec() },
        ExitStep::MmioWrite { addr: reg_addr(reg::QUEUE_DESC_LOW), data: (ring.desc_addr as u32).to_le_bytes().to_vec() },
        ExitStep::MmioWrite {
            addr: reg_addr(reg::QUEUE_DESC_HIGH),
            data: ((ring.desc_addr >> 32) as u32).to_le_bytes().to_vec(),
        },
        ExitStep::MmioWrite {
            addr: reg_addr(reg::QUEUE_AVAIL_LOW),
            data: (ring.avail_addr as u32).to_le_bytes().to_vec(),
        },
        ExitStep::MmioWrite {
            addr: reg_addr(reg::QUEUE_AVAIL_HIGH),
            data: ((ring.avail_addr >> 32) as u32).to_le_bytes().to_vec(),
        },
        ExitStep::MmioWrite { addr: reg_addr(reg::QUEUE_USED_LOW), data: (ring.used_addr as u32).to_le_bytes().to_vec() },
        ExitStep::MmioWrite {
            addr: reg_addr(reg::QUEUE_USED_HIGH),
            data: ((ring.used_addr >> 32) as u32).to_le_bytes().to_vec(),
        },
        ExitStep::MmioWrite { addr: reg_addr(reg::QUEUE_READY), data: 1u32.to_le_bytes().to_vec() },
        ExitStep::MmioWrite { addr: reg_addr(reg::QUEUE_NOTIFY), data: 0u32.to_le_bytes().to_vec() },
        ExitStep::Hlt,
    ];
    vm.backend_vm().set_script(0, steps);

    vm.start(vec![(GpRegs::default(), None)]).unwrap();
    vm.join().unwrap();

    let mut data_out = [0u8; 512];
    vm.memory.read(data_addr, &mut data_out).unwrap();
    assert_eq!(data_out, [0xA5u8; 512]);

    let status_byte = {
        let mut buf = [0u8; 1];
        vm.memory.read(status_addr, &mut buf).unwrap();
        buf[0]
    };
    assert_eq!(status_byte, 0, "VIRTIO_BLK_S_OK");
    assert_eq!(ring.used_idx(&vm.memory), 1);
    assert_eq!(ring.used_entry(&vm.memory, 0), (0, 1));

    std::fs::remove_file(&backing_path).ok();
}

#[test]
fn mmio_access_to_unmapped_address_reads_zero_and_continues() {
    let mut vm = new_vm(1024 * 1024);
    let capture = Arc::new(Mutex::new(Vec::new()));
    let steps = vec![
        ExitStep::MmioRead { addr: 0x0F00_0000, len: 4, capture: Some(capture.clone()) },
        ExitStep::Hlt,
    ];
    vm.backend_vm().set_script(0, steps);

    vm.start(vec![(GpRegs::default(), None)]).unwrap();
    vm.join().unwrap();

    assert_eq!(*capture.lock().unwrap(), vec![0, 0, 0, 0]);
    // Mmio + Hlt (non-fatal) + the trailing Shutdown once the script runs
    // dry.
    assert_eq!(vm.total_exit_count(), 3);
}

#[test]
fn cross_slot_translation_rejected() {
    let mut vm = Vm::<FakeBackend>::create().unwrap();
    vm.add_memory_region(0x0, 0x100000).unwrap();
    vm.add_memory_region(0x200000, 0x100000).unwrap();

    assert!(vm.memory.gpa_to_hva(0xFF000, 0x2000).is_err());
    assert!(vm.memory.gpa_to_hva(0xFF000, 0x1000).is_ok());
}
