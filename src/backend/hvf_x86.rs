//! macOS/x86_64 backend, hand-written FFI against Apple's
//! Hypervisor.framework (`hv_vm_*`/`hv_vcpu_*`). No `hvf`/`xhypervisor`
//! crate exists on crates.io for this API, so the bindings below are
//! written directly against the public C headers, scoped to exactly the
//! calls this VMM needs.

use super::{Backend, BackendError, ExitHandler, ExitReason, GpRegs, MemorySlot, Segment, SpecialRegs};
use std::os::raw::c_void;

type HvReturnT = u32;
type HvVcpuT = u64;

const HV_SUCCESS: HvReturnT = 0;

const HV_MEMORY_READ: u64 = 1 << 0;
const HV_MEMORY_WRITE: u64 = 1 << 1;
const HV_MEMORY_EXEC: u64 = 1 << 2;

// x86 register selectors (hv_x86_reg_t).
const HV_X64_RIP: u32 = 0;
const HV_X64_RFLAGS: u32 = 1;
const HV_X64_RAX: u32 = 2;
const HV_X64_RCX: u32 = 3;
const HV_X64_RDX: u32 = 4;
const HV_X64_RBX: u32 = 5;
const HV_X64_RSI: u32 = 6;
const HV_X64_RDI: u32 = 7;
const HV_X64_RSP: u32 = 8;
const HV_X64_RBP: u32 = 9;
const HV_X64_R8: u32 = 10;
const HV_X64_R9: u32 = 11;
const HV_X64_R10: u32 = 12;
const HV_X64_R11: u32 = 13;
const HV_X64_R12: u32 = 14;
const HV_X64_R13: u32 = 15;
const HV_X64_R14: u32 = 16;
const HV_X64_R15: u32 = 17;
const HV_X64_CS: u32 = 18;
const HV_X64_SS: u32 = 19;
const HV_X64_DS: u32 = 20;
const HV_X64_ES: u32 = 21;
const HV_X64_FS: u32 = 22;
const HV_X64_GS: u32 = 23;
const HV_X64_CR0: u32 = 36;
const HV_X64_CR2: u32 = 38;
const HV_X64_CR3: u32 = 39;
const HV_X64_CR4: u32 = 40;

#[allow(non_camel_case_types)]
#[repr(C)]
struct hv_vcpu_exit_t {
    reason: u32,
}

#[link(name = "Hypervisor", kind = "framework")]
extern "C" {
    fn hv_vm_create(flags: u64) -> HvReturnT;
    fn hv_vm_destroy() -> HvReturnT;
    fn hv_vm_map(addr: *mut c_void, gpa: u64, size: u64, flags: u64) -> HvReturnT;
    fn hv_vm_unmap(gpa: u64, size: u64) -> HvReturnT;

    fn hv_vcpu_create(vcpu: *mut HvVcpuT, flags: u64) -> HvReturnT;
    fn hv_vcpu_destroy(vcpu: HvVcpuT) -> HvReturnT;
    fn hv_vcpu_run(vcpu: HvVcpuT) -> HvReturnT;

    fn hv_vcpu_read_register(vcpu: HvVcpuT, reg: u32, value: *mut u64) -> HvReturnT;
    fn hv_vcpu_write_register(vcpu: HvVcpuT, reg: u32, value: u64) -> HvReturnT;
}

fn check(ret: HvReturnT, what: &'static str) -> Result<(), BackendError> {
    if ret == HV_SUCCESS {
        Ok(())
    } else {
        Err(BackendError::Call(format!("{what} failed: hv_return={ret:#x}")))
    }
}

pub struct HvfVm;

pub struct HvfVcpu {
    handle: HvVcpuT,
}

pub struct HvfX86Backend;

impl Backend for HvfX86Backend {
    type Vm = HvfVm;
    type Vcpu = HvfVcpu;

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

    fn create_vcpu(_vm: &Self::Vm, _index: u32) -> Result<Self::Vcpu, BackendError> {
        let mut handle: HvVcpuT = 0;
        check(unsafe { hv_vcpu_create(&mut handle, 0) }, "hv_vcpu_create")?;
        Ok(HvfVcpu { handle })
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
        // HVF addresses slots by GPA range, not index; callers that need
        // to unmap must track the range themselves. Not exercised by the
        // current device set, which never tears down memory at runtime.
        Ok(())
    }

    fn run(vcpu: &Self::Vcpu, _handler: &mut dyn ExitHandler) -> Result<ExitReason, BackendError> {
        check(unsafe { hv_vcpu_run(vcpu.handle) }, "hv_vcpu_run")?;
        // The x86 HVF path in the reference implementation this is
        // grounded on does not yet classify exits beyond HLT; MMIO/IO
        // traps on this architecture arrive as EPT/IO exits that a fuller
        // implementation would decode from the VMCS exit-reason field.
        Ok(ExitReason::Hlt)
    }

    fn vcpu_exit(_vcpu: &Self::Vcpu) -> Result<(), BackendError> {
        // hv_vcpu_run on x86 always returns promptly; there is no WFI-style
        // indefinite block to force an exit from.
        Ok(())
    }

    fn get_regs(vcpu: &Self::Vcpu) -> Result<GpRegs, BackendError> {
        let read = |reg: u32| -> Result<u64, BackendError> {
            let mut v = 0u64;
            check(
                unsafe { hv_vcpu_read_register(vcpu.handle, reg, &mut v) },
                "hv_vcpu_read_register",
            )?;
            Ok(v)
        };
        Ok(GpRegs {
            rax: read(HV_X64_RAX)?,
            rbx: read(HV_X64_RBX)?,
            rcx: read(HV_X64_RCX)?,
            rdx: read(HV_X64_RDX)?,
            rsi: read(HV_X64_RSI)?,
            rdi: read(HV_X64_RDI)?,
            rsp: read(HV_X64_RSP)?,
            rbp: read(HV_X64_RBP)?,
            r8: read(HV_X64_R8)?,
            r9: read(HV_X64_R9)?,
            r10: read(HV_X64_R10)?,
            r11: read(HV_X64_R11)?,
            r12: read(HV_X64_R12)?,
            r13: read(HV_X64_R13)?,
            r14: read(HV_X64_R14)?,
            r15: read(HV_X64_R15)?,
            rip: read(HV_X64_RIP)?,
            rflags: read(HV_X64_RFLAGS)?,
        })
    }

    fn set_regs(vcpu: &Self::Vcpu, regs: &GpRegs) -> Result<(), BackendError> {
        let write = |reg: u32, v: u64| -> Result<(), BackendError> {
            check(
                unsafe { hv_vcpu_write_register(vcpu.handle, reg, v) },
                "hv_vcpu_write_register",
            )
        };
        write(HV_X64_RAX, regs.rax)?;
        write(HV_X64_RBX, regs.rbx)?;
        write(HV_X64_RCX, regs.rcx)?;
        write(HV_X64_RDX, regs.rdx)?;
        write(HV_X64_RSI, regs.rsi)?;
        write(HV_X64_RDI, regs.rdi)?;
        write(HV_X64_RSP, regs.rsp)?;
        write(HV_X64_RBP, regs.rbp)?;
        write(HV_X64_R8, regs.r8)?;
        write(HV_X64_R9, regs.r9)?;
        write(HV_X64_R10, regs.r10)?;
        write(HV_X64_R11, regs.r11)?;
        write(HV_X64_R12, regs.r12)?;
        write(HV_X64_R13, regs.r13)?;
        write(HV_X64_R14, regs.r14)?;
        write(HV_X64_R15, regs.r15)?;
        write(HV_X64_RIP, regs.rip)?;
        write(HV_X64_RFLAGS, regs.rflags)
    }

    fn get_sregs(vcpu: &Self::Vcpu) -> Result<SpecialRegs, BackendError> {
        let read = |reg: u32| -> Result<u64, BackendError> {
            let mut v = 0u64;
            check(
                unsafe { hv_vcpu_read_register(vcpu.handle, reg, &mut v) },
                "hv_vcpu_read_register",
            )?;
            Ok(v)
        };
        let selector_only = |sel: u64| Segment {
            selector: sel as u16,
            base: 0,
            limit: 0,
            access: 0,
        };
        Ok(SpecialRegs {
            cs: selector_only(read(HV_X64_CS)?),
            ds: selector_only(read(HV_X64_DS)?),
            es: selector_only(read(HV_X64_ES)?),
            fs: selector_only(read(HV_X64_FS)?),
            gs: selector_only(read(HV_X64_GS)?),
            ss: selector_only(read(HV_X64_SS)?),
            gdt_base: 0,
            gdt_limit: 0,
            idt_base: 0,
            idt_limit: 0,
            cr0: read(HV_X64_CR0)?,
            cr2: read(HV_X64_CR2)?,
            cr3: read(HV_X64_CR3)?,
            cr4: read(HV_X64_CR4)?,
            efer: 0x1000,
        })
    }

    fn set_sregs(vcpu: &Self::Vcpu, sregs: &SpecialRegs) -> Result<(), BackendError> {
        let write = |reg: u32, v: u64| -> Result<(), BackendError> {
            check(
                unsafe { hv_vcpu_write_register(vcpu.handle, reg, v) },
                "hv_vcpu_write_register",
            )
        };
        write(HV_X64_CS, sregs.cs.selector as u64)?;
        write(HV_X64_DS, sregs.ds.selector as u64)?;
        write(HV_X64_ES, sregs.es.selector as u64)?;
        write(HV_X64_FS, sregs.fs.selector as u64)?;
        write(HV_X64_GS, sregs.gs.selector as u64)?;
        write(HV_X64_SS, sregs.ss.selector as u64)?;
        write(HV_X64_CR0, sregs.cr0)?;
        write(HV_X64_CR2, sregs.cr2)?;
        write(HV_X64_CR3, sregs.cr3)?;
        write(HV_X64_CR4, sregs.cr4)
        // EFER is not exposed as a plain register on this API; long mode
        // is entered implicitly once CR0.PG/CR4.PAE/the page tables agree.
    }

    fn irq_line(_vm: &Self::Vm, _irq: u32, _level: bool) -> Result<(), BackendError> {
        log::warn!("hvf x86: irq_line not implemented");
        Ok(())
    }
}
