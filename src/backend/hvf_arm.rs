//! macOS/ARM64 backend, hand-written FFI against Hypervisor.framework's
//! ARM64 API. Differs from the x86_64 arm in two load-bearing ways:
//! vCPU creation takes an extra `hv_vcpu_exit_t *` that the framework
//! writes exit details into, and a vCPU must be created on the same
//! thread that will call `hv_vcpu_run` on it (enforced by the runner via
//! `HandleState::Deferred`, not by this module).

use super::{Backend, BackendError, ExitHandler, ExitReason, GpRegs, MemorySlot, SpecialRegs};
use std::os::raw::c_void;

type HvReturnT = u32;
type HvVcpuT = u64;

const HV_SUCCESS: HvReturnT = 0;

const HV_MEMORY_READ: u64 = 1 << 0;
const HV_MEMORY_WRITE: u64 = 1 << 1;
const HV_MEMORY_EXEC: u64 = 1 << 2;

// hv_reg_t selectors used here; the full set covers X0-X30 as well.
const HV_REG_PC: u32 = 32;
const HV_REG_CPSR: u32 = 33;

// EL1h, IRQ and FIQ masked - matches the entry state the reference
// ARM64 boot path expects before handing control to the guest.
const CPSR_BOOT: u64 = 0x3c5;

const HV_EXIT_REASON_CANCELED: u32 = 0;
const HV_EXIT_REASON_EXCEPTION: u32 = 1;
const HV_EXIT_REASON_VTIMER_ACTIVATED: u32 = 2;

#[repr(C)]
struct HvExitException {
    syndrome: u64,
    virtual_address: u64,
    physical_address: u64,
}

#[repr(C)]
struct HvVcpuExitT {
    reason: u32,
    exception: HvExitException,
}

#[link(name = "Hypervisor", kind = "framework")]
extern "C" {
    fn hv_vm_create(flags: u64) -> HvReturnT;
    fn hv_vm_destroy() -> HvReturnT;
    fn hv_vm_map(addr: *mut c_void, gpa: u64, size: u64, flags: u64) -> HvReturnT;

    fn hv_vcpu_create(vcpu: *mut HvVcpuT, exit: *mut *mut HvVcpuExitT, flags: *const c_void)
        -> HvReturnT;
    fn hv_vcpu_destroy(vcpu: HvVcpuT) -> HvReturnT;
    fn hv_vcpu_run(vcpu: HvVcpuT) -> HvReturnT;

    /// Forces `hv_vcpu_run` to return `HV_EXIT_REASON_CANCELED` on the
    /// named vCPUs, even if they are parked in WFI. Safe to call from any
    /// thread.
    fn hv_vcpus_exit(vcpus: *const HvVcpuT, vcpu_count: u32) -> HvReturnT;

    fn hv_vcpu_get_reg(vcpu: HvVcpuT, reg: u32, value: *mut u64) -> HvReturnT;
    fn hv_vcpu_set_reg(vcpu: HvVcpuT, reg: u32, value: u64) -> HvReturnT;
}

fn check(ret: HvReturnT, what: &'static str) -> Result<(), BackendError> {
    if ret == HV_SUCCESS {
        Ok(())
    } else {
        Err(BackendError::Call(format!("{what} failed: hv_return={ret:#x}")))
    }
}

pub struct HvfVm;

pub struct HvfArmVcpu {
    handle: HvVcpuT,
    exit: *mut HvVcpuExitT,
}

// The exit pointer is framework-owned for this vCPU's lifetime and only
// ever touched from the thread that created it.
unsafe impl Send for HvfArmVcpu {}

// `hv_vcpus_exit` is the one operation the framework documents as safe to
// call concurrently with `hv_vcpu_run` from another thread; every other
// method here is only ever invoked from the owning vCPU's thread, so a
// shared reference crossing threads for `vcpu_exit` alone cannot race with
// the framework's own thread-affinity requirement.
unsafe impl Sync for HvfArmVcpu {}

pub struct HvfArmBackend;

impl Backend for HvfArmBackend {
    type Vm = HvfVm;
    type Vcpu = HvfArmVcpu;

    fn init() -> Result<(), BackendError> {
        Ok(())
    }

    fn create_vm() -> Result<Self::Vm, BackendError> {
        check(unsafe { hv_vm_create(0) }, "hv_vm_create")?;
        Ok(HvfVm)
    }

    fn destroy_vm(_vm: Self::Vm) {
        unsafe {
            hv_vm_destroy();
        }
    }

    /// Must run on the thread that will drive this vCPU: Hypervisor.framework
    /// binds the handle to the calling thread on ARM64.
    fn create_vcpu(_vm: &Self::Vm, _index: u32) -> Result<Self::Vcpu, BackendError> {
        let mut handle: HvVcpuT = 0;
        let mut exit: *mut HvVcpuExitT = std::ptr::null_mut();
        check(
            unsafe { hv_vcpu_create(&mut handle, &mut exit, std::ptr::null()) },
            "hv_vcpu_create",
        )?;
        Ok(HvfArmVcpu { handle, exit })
    }

    fn destroy_vcpu(vcpu: Self::Vcpu) {
        unsafe {
            hv_vcpu_destroy(vcpu.handle);
        }
    }

    fn map_memory(_vm: &Self::Vm, slot: MemorySlot) -> Result<(), BackendError> {
        check(
            unsafe {
                hv_vm_map(
                    slot.hva as *mut c_void,
                    slot.gpa,
                    slot.size,
                    HV_MEMORY_READ | HV_MEMORY_WRITE | HV_MEMORY_EXEC,
                )
            },
            "hv_vm_map",
        )
    }

    fn unmap_memory(_vm: &Self::Vm, _slot: u32) -> Result<(), BackendError> {
        Ok(())
    }

    fn run(vcpu: &Self::Vcpu, handler: &mut dyn ExitHandler) -> Result<ExitReason, BackendError> {
        check(unsafe { hv_vcpu_run(vcpu.handle) }, "hv_vcpu_run")?;
        // SAFETY: the framework populates *exit before hv_vcpu_run returns
        // and the pointer remains valid for this vCPU's lifetime.
        let info = unsafe { &*vcpu.exit };
        Ok(match info.reason {
            HV_EXIT_REASON_CANCELED => ExitReason::Canceled,
            HV_EXIT_REASON_EXCEPTION => {
                if info.exception.virtual_address != 0 {
                    // The reference implementation this is grounded on
                    // does not decode the faulting register out of the
                    // syndrome, so writes are dispatched with a zeroed
                    // payload and reads are dispatched but their result
                    // is discarded - same stub-level fidelity as the
                    // original.
                    let mut buf = [0u8; 4];
                    handler.mmio_write(info.exception.physical_address, &buf);
                    handler.mmio_read(info.exception.physical_address, &mut buf);
                    ExitReason::Mmio
                } else {
                    ExitReason::Exception(info.exception.syndrome)
                }
            }
            HV_EXIT_REASON_VTIMER_ACTIVATED => ExitReason::Vtimer,
            // WFI and anything else unclassified is treated as a halt,
            // matching a guest quiescing while waiting for an interrupt.
            _ => ExitReason::Hlt,
        })
    }

    fn vcpu_exit(vcpu: &Self::Vcpu) -> Result<(), BackendError> {
        check(unsafe { hv_vcpus_exit(&vcpu.handle, 1) }, "hv_vcpus_exit")
    }

    fn get_regs(vcpu: &Self::Vcpu) -> Result<GpRegs, BackendError> {
        let mut pc = 0u64;
        check(
            unsafe { hv_vcpu_get_reg(vcpu.handle, HV_REG_PC, &mut pc) },
            "hv_vcpu_get_reg(PC)",
        )?;
        let mut cpsr = 0u64;
        check(
            unsafe { hv_vcpu_get_reg(vcpu.handle, HV_REG_CPSR, &mut cpsr) },
            "hv_vcpu_get_reg(CPSR)",
        )?;
        Ok(GpRegs {
            rip: pc,
            rflags: cpsr,
            ..Default::default()
        })
    }

    fn set_regs(vcpu: &Self::Vcpu, regs: &GpRegs) -> Result<(), BackendError> {
        check(
            unsafe { hv_vcpu_set_reg(vcpu.handle, HV_REG_PC, regs.rip) },
            "hv_vcpu_set_reg(PC)",
        )?;
        check(
            unsafe { hv_vcpu_set_reg(vcpu.handle, HV_REG_CPSR, CPSR_BOOT) },
            "hv_vcpu_set_reg(CPSR)",
        )
    }

    /// ARM64 has no x86 segment model; this is a no-op that accepts
    /// whatever callers pass so shared boot code need not special-case it.
    fn get_sregs(_vcpu: &Self::Vcpu) -> Result<SpecialRegs, BackendError> {
        Ok(SpecialRegs::default())
    }

    fn set_sregs(_vcpu: &Self::Vcpu, _sregs: &SpecialRegs) -> Result<(), BackendError> {
        Ok(())
    }

    fn irq_line(_vm: &Self::Vm, _irq: u32, _level: bool) -> Result<(), BackendError> {
        log::warn!("hvf arm: irq_line not implemented");
        Ok(())
    }
}
