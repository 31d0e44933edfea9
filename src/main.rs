//! vmmlet entry point: parses CLI arguments, builds guest memory, loads a
//! kernel or raw image, wires up the console/block/net virtio devices onto
//! the MMIO bus, and runs the guest to completion.
//!
//! Exactly one hypervisor backend is compiled in, selected by
//! `cfg(target_os, target_arch)`: `KvmBackend` on Linux, `HvfX86Backend` or
//! `HvfArmBackend` on macOS, `StubBackend` everywhere else (builds, but
//! every call returns `BackendError::Unavailable`).

use clap::Parser;
use std::process::ExitCode;
use vmmlet::backend::{self, Backend};
use vmmlet::boot::{self, BootConfig, VirtioDeviceConfig};
use vmmlet::device;
use vmmlet::device::bus::{DeviceKind, IrqLine};
use vmmlet::virtio::block::BlockDevice;
use vmmlet::virtio::console::ConsoleDevice;
use vmmlet::virtio::net::NetDevice;
use vmmlet::virtio::{self, Personality, VirtioMmioDevice};
use vmmlet::vm::{self, Vm};

/// First virtio-mmio device's base address; each subsequent device gets
/// the next `VIRTIO_MMIO_STRIDE`-sized slot. Chosen to sit above any
/// address the x86_64 boot layout or a guest's low-memory kernel image
/// could plausibly touch.
const VIRTIO_MMIO_BASE: u64 = 0xd000_0000;
const VIRTIO_MMIO_SIZE: u64 = 0x200;
const VIRTIO_MMIO_STRIDE: u64 = 0x1000;

/// GSIs 0-4 are reserved for legacy PC interrupts (PIT, keyboard, cascade,
/// COM2/COM1); virtio devices start at the next one.
const VIRTIO_IRQ_BASE: u32 = 5;

#[derive(Parser, Debug)]
#[command(name = "vmmlet")]
#[command(about = "A minimal virtual machine monitor for KVM and Hypervisor.framework")]
struct Args {
    /// Path to a Linux kernel bzImage, booted via the x86_64 Linux boot
    /// protocol. Mutually exclusive with --raw.
    #[arg(short, long)]
    kernel: Option<String>,

    /// Path to a raw flat binary, loaded at --load-addr and entered
    /// directly with no boot-protocol scaffolding. Mutually exclusive
    /// with --kernel; this is the only boot path on non-x86_64 backends.
    #[arg(long)]
    raw: Option<String>,

    /// Load address / entry point for --raw images, in hex or decimal.
    #[arg(long, default_value = "0x8000")]
    load_addr: String,

    /// Kernel command line (bzImage boot only; vmmlet appends a few
    /// fast-boot flags automatically).
    #[arg(short, long, default_value = "console=ttyS0")]
    cmdline: String,

    /// Guest memory size in megabytes.
    #[arg(short, long, default_value = "512")]
    memory: u64,

    /// Path to a raw disk image backing a virtio-blk device.
    #[arg(short, long)]
    disk: Option<String>,

    /// Host tap interface name backing a virtio-net device.
    #[arg(long)]
    tap: Option<String>,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    if let Err(e) = run(args) {
        log::error!("{e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

#[derive(thiserror::Error, Debug)]
enum AppError {
    #[error(transparent)]
    Vm(#[from] vm::VmError),

    #[error(transparent)]
    Boot(#[from] boot::BootError),

    #[error(transparent)]
    Backend(#[from] backend::BackendError),

    #[error(transparent)]
    Virtio(#[from] virtio::VirtioError),

    #[error(transparent)]
    Bus(#[from] device::bus::BusError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("either --kernel or --raw must be given, not both or neither")]
    NoBootTarget,

    #[error("invalid --load-addr {0:?}: {1}")]
    BadLoadAddr(String, std::num::ParseIntError),
}

#[cfg(target_os = "linux")]
type ActiveBackend = backend::kvm::KvmBackend;

#[cfg(all(target_os = "macos", target_arch = "x86_64"))]
type ActiveBackend = backend::hvf_x86::HvfX86Backend;

#[cfg(all(target_os = "macos", target_arch = "aarch64"))]
type ActiveBackend = backend::hvf_arm::HvfArmBackend;

#[cfg(not(any(
    target_os = "linux",
    all(target_os = "macos", target_arch = "x86_64"),
    all(target_os = "macos", target_arch = "aarch64")
)))]
type ActiveBackend = backend::stub::StubBackend;

fn run(args: Args) -> Result<(), AppError> {
    run_with_backend::<ActiveBackend>(args)
}

fn parse_load_addr(s: &str) -> Result<u64, AppError> {
    let parsed = if let Some(hex) = s.strip_prefix("0x") {
        u64::from_str_radix(hex, 16)
    } else {
        s.parse::<u64>()
    };
    parsed.map_err(|e| AppError::BadLoadAddr(s.to_string(), e))
}

fn run_with_backend<B>(args: Args) -> Result<(), AppError>
where
    B: Backend + 'static,
    B::Vm: Send + Sync,
    B::Vcpu: Send + Sync,
{
    if args.kernel.is_some() == args.raw.is_some() {
        return Err(AppError::NoBootTarget);
    }

    log::info!(
        "starting vmmlet: memory={} MB, kernel={:?}, raw={:?}",
        args.memory,
        args.kernel,
        args.raw
    );

    let mem_size = args.memory * 1024 * 1024;
    let mut vm = Vm::<B>::create()?;
    vm.add_memory_region(0, mem_size)?;

    let mut virtio_acpi_devices = Vec::new();
    {
        let mut bus = vm.devices.bus.lock().unwrap();
        register_virtio_devices(&mut bus, &args, &mut virtio_acpi_devices)?;
    }

    if let Some(kernel_path) = &args.kernel {
        boot_linux_kernel::<B>(&mut vm, kernel_path, &args, &virtio_acpi_devices)?;
    } else if let Some(raw_path) = &args.raw {
        let load_addr = parse_load_addr(&args.load_addr)?;
        boot::setup_boot_raw(&vm.memory, raw_path, load_addr)?;
        let regs = backend::GpRegs {
            rip: load_addr,
            ..Default::default()
        };
        vm.start(vec![(regs, None)])?;
    }

    log::info!("guest running, waiting for it to halt or shut down");
    vm.join()?;
    log::info!("guest exited after {} total vcpu exits", vm.total_exit_count());
    Ok(())
}

/// Registers one virtio-mmio device at the next free slot and records its
/// ACPI description for the x86_64 boot path to advertise in the DSDT.
fn add_virtio_device(
    bus: &mut device::bus::MmioBus,
    acpi_devices: &mut Vec<VirtioDeviceConfig>,
    id: u8,
    personality: Personality,
) -> Result<(), AppError> {
    let base = VIRTIO_MMIO_BASE + (id as u64) * VIRTIO_MMIO_STRIDE;
    let gsi = VIRTIO_IRQ_BASE + id as u32;
    let irq = IrqLine::new(gsi)?;
    acpi_devices.push(VirtioDeviceConfig {
        id,
        mmio_base: base,
        mmio_size: VIRTIO_MMIO_SIZE as u32,
        gsi,
    });
    bus.register(
        base,
        VIRTIO_MMIO_SIZE,
        DeviceKind::VirtioMmio(VirtioMmioDevice::new(personality, irq)),
    )?;
    log::info!("virtio device {id} registered at {base:#x}, gsi {gsi}");
    Ok(())
}

/// Registers the console device (always present) plus the optional
/// block/net devices onto the MMIO bus.
fn register_virtio_devices(
    bus: &mut device::bus::MmioBus,
    args: &Args,
    acpi_devices: &mut Vec<VirtioDeviceConfig>,
) -> Result<(), AppError> {
    let mut next_id = 0u8;

    add_virtio_device(bus, acpi_devices, next_id, Personality::Console(ConsoleDevice::new()))?;
    next_id += 1;

    if let Some(disk_path) = &args.disk {
        let block = BlockDevice::open(disk_path)?;
        add_virtio_device(bus, acpi_devices, next_id, Personality::Block(block))?;
        next_id += 1;
    }

    // virtio-net is only attached when a tap device is requested; a
    // tap-less NetDevice could never move a packet, so there is no
    // "default" net device the way there is a default console.
    if let Some(tap_name) = &args.tap {
        let net = NetDevice::new(Some(tap_name.as_str()))?;
        add_virtio_device(bus, acpi_devices, next_id, Personality::Net(net))?;
        next_id += 1;
    }

    Ok(())
}

/// Boots a Linux kernel via the x86_64 Linux boot protocol: kernel load,
/// boot_params/E820, ACPI tables (advertising the registered virtio
/// devices), MP tables, page tables, and initial vCPU register state.
#[cfg(target_arch = "x86_64")]
fn boot_linux_kernel<B>(
    vm: &mut Vm<B>,
    kernel_path: &str,
    args: &Args,
    virtio_acpi_devices: &[VirtioDeviceConfig],
) -> Result<(), AppError>
where
    B: Backend + 'static,
    B::Vm: Send + Sync,
    B::Vcpu: Send + Sync,
{
    let mem_size = args.memory * 1024 * 1024;

    let cmdline = [args.cmdline.as_str(), "reboot=t", "panic=-1", "noapictimer"].join(" ");
    log::info!("cmdline: {cmdline}");

    boot::setup_acpi(&vm.memory, 1, virtio_acpi_devices)?;
    boot::setup_mptable(&vm.memory, 1)?;

    let config = BootConfig {
        kernel_path: kernel_path.to_string(),
        cmdline,
        mem_size,
    };
    boot::setup_boot(&vm.memory, &config)?;

    let (regs, sregs) = boot::compute_vcpu_regs(&vm.memory)?;
    vm.start(vec![(regs, Some(sregs))])?;
    Ok(())
}

#[cfg(not(target_arch = "x86_64"))]
fn boot_linux_kernel<B>(
    _vm: &mut Vm<B>,
    _kernel_path: &str,
    _args: &Args,
    _virtio_acpi_devices: &[VirtioDeviceConfig],
) -> Result<(), AppError>
where
    B: Backend + 'static,
    B::Vm: Send + Sync,
    B::Vcpu: Send + Sync,
{
    Err(AppError::Backend(backend::BackendError::Unavailable(
        "the Linux boot protocol (--kernel) is only supported on x86_64; use --raw on this architecture",
    )))
}
