//! Linux backend, built on `kvm-ioctls`/`kvm-bindings`.

use super::{Backend, BackendError, ExitHandler, ExitReason, GpRegs, MemorySlot, Segment, SpecialRegs};

use kvm_bindings::{
    kvm_fpu, kvm_pit_config, kvm_regs, kvm_segment, kvm_sregs, kvm_userspace_memory_region,
    CpuId, MsrEntry, Msrs, KVM_PIT_SPEAKER_DUMMY,
};
use kvm_ioctls::{Kvm, VcpuExit as KvmVcpuExit, VcpuFd, VmFd};

const TSS_ADDRESS: u64 = 0xffff_bd00;
const KVM_MAX_CPUID_ENTRIES: usize = 80;

mod msr {
    pub const IA32_SYSENTER_CS: u32 = 0x174;
    pub const IA32_SYSENTER_ESP: u32 = 0x175;
    pub const IA32_SYSENTER_EIP: u32 = 0x176;
    pub const STAR: u32 = 0xc000_0081;
    pub const LSTAR: u32 = 0xc000_0082;
    pub const CSTAR: u32 = 0xc000_0083;
    pub const SYSCALL_MASK: u32 = 0xc000_0084;
    pub const KERNEL_GS_BASE: u32 = 0xc000_0102;
    pub const IA32_TSC: u32 = 0x10;
    pub const IA32_MISC_ENABLE: u32 = 0x1a0;
    pub const MISC_ENABLE_FAST_STRING: u64 = 1;
    pub const MTRR_DEF_TYPE: u32 = 0x2ff;
}

/// Thread-confined KVM VM handle: the opened `/dev/kvm` fd, the VM fd, and
/// the CPUID template shared by every vCPU created on it.
pub struct KvmVm {
    pub vm_fd: VmFd,
    pub supported_cpuid: CpuId,
}

pub struct KvmVcpu {
    pub fd: VcpuFd,
}

// `vcpu_exit` is a no-op on this backend and never touches `fd`; the only
// way a `&KvmVcpu` crosses threads is through that no-op, so it never
// races the owning thread's own ioctls.
unsafe impl Sync for KvmVcpu {}

pub struct KvmBackend;

fn seg(s: &kvm_segment) -> Segment {
    Segment {
        selector: s.selector,
        base: s.base,
        limit: s.limit,
        access: (s.type_ as u32) | ((s.present as u32) << 7) | ((s.dpl as u32) << 5),
    }
}

fn build_cpuid_with_tsc(base: &CpuId, tsc_khz: u32) -> CpuId {
    let mut entries: Vec<_> = base
        .as_slice()
        .iter()
        .filter(|e| !(0x4000_0000..=0x4000_00ff).contains(&e.function))
        .cloned()
        .collect();

    for e in entries.iter_mut() {
        if e.function == 1 {
            e.ecx |= 1 << 31;
        }
    }

    let mut sig = kvm_bindings::kvm_cpuid_entry2 {
        function: 0x4000_0000,
        eax: 0x4000_0010,
        ebx: 0x4b4d_564b,
        ecx: 0x564d_4b56,
        edx: 0x0000_004d,
        ..Default::default()
    };
    sig.flags = 0;
    entries.push(sig);

    const CLOCKSOURCE: u32 = 1 << 0;
    const NOP_IO_DELAY: u32 = 1 << 1;
    const CLOCKSOURCE2: u32 = 1 << 3;
    const ASYNC_PF: u32 = 1 << 4;
    const PV_EOI: u32 = 1 << 6;
    const PV_UNHALT: u32 = 1 << 7;
    const CLOCKSOURCE_STABLE_BIT: u32 = 1 << 24;

    let feat = kvm_bindings::kvm_cpuid_entry2 {
        function: 0x4000_0001,
        eax: CLOCKSOURCE
            | NOP_IO_DELAY
            | CLOCKSOURCE2
            | ASYNC_PF
            | PV_EOI
            | PV_UNHALT
            | CLOCKSOURCE_STABLE_BIT,
        ..Default::default()
    };
    entries.push(feat);

    let freq = kvm_bindings::kvm_cpuid_entry2 {
        function: 0x4000_0010,
        eax: tsc_khz,
        ..Default::default()
    };
    entries.push(freq);

    CpuId::from_entries(&entries).expect("cpuid entries within KVM limit")
}

impl Backend for KvmBackend {
    type Vm = KvmVm;
    type Vcpu = KvmVcpu;

    fn init() -> Result<(), BackendError> {
        Ok(())
    }

    fn create_vm() -> Result<Self::Vm, BackendError> {
        let kvm = Kvm::new().map_err(|e| BackendError::Call(format!("open /dev/kvm: {e}")))?;
        let supported_cpuid = kvm
            .get_supported_cpuid(KVM_MAX_CPUID_ENTRIES)
            .map_err(|e| BackendError::Call(format!("get_supported_cpuid: {e}")))?;
        let vm_fd = kvm
            .create_vm()
            .map_err(|e| BackendError::Call(format!("create_vm: {e}")))?;

        vm_fd
            .set_tss_address(TSS_ADDRESS as usize)
            .map_err(|e| BackendError::Call(format!("set_tss_address: {e}")))?;
        vm_fd
            .create_irq_chip()
            .map_err(|e| BackendError::Call(format!("create_irq_chip: {e}")))?;
        let pit_config = kvm_pit_config {
            flags: KVM_PIT_SPEAKER_DUMMY,
            ..Default::default()
        };
        vm_fd
            .create_pit2(pit_config)
            .map_err(|e| BackendError::Call(format!("create_pit2: {e}")))?;

        Ok(KvmVm {
            vm_fd,
            supported_cpuid,
        })
    }

    fn destroy_vm(_vm: Self::Vm) {}

    fn create_vcpu(vm: &Self::Vm, index: u32) -> Result<Self::Vcpu, BackendError> {
        let fd = vm
            .vm_fd
            .create_vcpu(index as u64)
            .map_err(|e| BackendError::Call(format!("create_vcpu: {e}")))?;

        let tsc_khz = fd.get_tsc_khz().unwrap_or(0);
        let cpuid = if tsc_khz > 0 {
            build_cpuid_with_tsc(&vm.supported_cpuid, tsc_khz as u32)
        } else {
            vm.supported_cpuid.clone()
        };
        fd.set_cpuid2(&cpuid)
            .map_err(|e| BackendError::Call(format!("set_cpuid2: {e}")))?;

        let entries = [
            MsrEntry {
                index: msr::IA32_SYSENTER_CS,
                data: 0,
                ..Default::default()
            },
            MsrEntry {
                index: msr::IA32_SYSENTER_ESP,
                data: 0,
                ..Default::default()
            },
            MsrEntry {
                index: msr::IA32_SYSENTER_EIP,
                data: 0,
                ..Default::default()
            },
            MsrEntry {
                index: msr::STAR,
                data: 0,
                ..Default::default()
            },
            MsrEntry {
                index: msr::LSTAR,
                data: 0,
                ..Default::default()
            },
            MsrEntry {
                index: msr::CSTAR,
                data: 0,
                ..Default::default()
            },
            MsrEntry {
                index: msr::SYSCALL_MASK,
                data: 0,
                ..Default::default()
            },
            MsrEntry {
                index: msr::KERNEL_GS_BASE,
                data: 0,
                ..Default::default()
            },
            MsrEntry {
                index: msr::IA32_TSC,
                data: 0,
                ..Default::default()
            },
            MsrEntry {
                index: msr::IA32_MISC_ENABLE,
                data: msr::MISC_ENABLE_FAST_STRING,
                ..Default::default()
            },
            MsrEntry {
                index: msr::MTRR_DEF_TYPE,
                data: 0,
                ..Default::default()
            },
        ];
        let msrs = Msrs::from_entries(&entries)
            .map_err(|e| BackendError::Call(format!("build msrs: {e}")))?;
        fd.set_msrs(&msrs)
            .map_err(|e| BackendError::Call(format!("set_msrs: {e}")))?;

        let mut fpu = kvm_fpu::default();
        fpu.fcw = 0x37f;
        fd.set_fpu(&fpu)
            .map_err(|e| BackendError::Call(format!("set_fpu: {e}")))?;

        Ok(KvmVcpu { fd })
    }

    fn destroy_vcpu(_vcpu: Self::Vcpu) {}

    fn map_memory(vm: &Self::Vm, slot: MemorySlot) -> Result<(), BackendError> {
        let region = kvm_userspace_memory_region {
            slot: slot.slot,
            guest_phys_addr: slot.gpa,
            memory_size: slot.size,
            userspace_addr: slot.hva,
            flags: 0,
        };
        // SAFETY: `hva` points at a mapping at least `size` bytes long that
        // outlives the VM, guaranteed by the memory manager.
        unsafe {
            vm.vm_fd
                .set_user_memory_region(region)
                .map_err(|e| BackendError::Call(format!("set_user_memory_region: {e}")))?;
        }
        Ok(())
    }

    fn unmap_memory(vm: &Self::Vm, slot: u32) -> Result<(), BackendError> {
        let region = kvm_userspace_memory_region {
            slot,
            guest_phys_addr: 0,
            memory_size: 0,
            userspace_addr: 0,
            flags: 0,
        };
        unsafe {
            vm.vm_fd
                .set_user_memory_region(region)
                .map_err(|e| BackendError::Call(format!("unmap set_user_memory_region: {e}")))?;
        }
        Ok(())
    }

    fn run(vcpu: &Self::Vcpu, handler: &mut dyn ExitHandler) -> Result<ExitReason, BackendError> {
        match vcpu.fd.run() {
            Ok(KvmVcpuExit::IoIn(port, data)) => {
                handler.io_in(port, data);
                Ok(ExitReason::Io)
            }
            Ok(KvmVcpuExit::IoOut(port, data)) => {
                handler.io_out(port, data);
                Ok(ExitReason::Io)
            }
            Ok(KvmVcpuExit::MmioRead(addr, data)) => {
                handler.mmio_read(addr, data);
                Ok(ExitReason::Mmio)
            }
            Ok(KvmVcpuExit::MmioWrite(addr, data)) => {
                handler.mmio_write(addr, data);
                Ok(ExitReason::Mmio)
            }
            Ok(KvmVcpuExit::Hlt) => Ok(ExitReason::Hlt),
            Ok(KvmVcpuExit::Shutdown) => Ok(ExitReason::Shutdown),
            Ok(KvmVcpuExit::InternalError) => Ok(ExitReason::InternalError),
            Ok(KvmVcpuExit::FailEntry(reason, _cpu)) => Ok(ExitReason::FailEntry(reason)),
            Ok(KvmVcpuExit::SystemEvent(_, _)) => Ok(ExitReason::Shutdown),
            Ok(_) => Ok(ExitReason::Unknown),
            // A signal (e.g. delivered to unblock a stuck ioctl) interrupted
            // the run syscall; this is not a guest exit and is not counted
            // as one - the caller retries.
            Err(e) if e.errno() == libc::EINTR => Ok(ExitReason::Interrupted),
            Err(e) => Err(BackendError::Call(format!("vcpu run: {e}"))),
        }
    }

    fn vcpu_exit(_vcpu: &Self::Vcpu) -> Result<(), BackendError> {
        // KVM's run ioctl always returns on its own (HLT, I/O, MMIO, or an
        // actual exit); there is nothing to force.
        Ok(())
    }

    fn get_regs(vcpu: &Self::Vcpu) -> Result<GpRegs, BackendError> {
        let r: kvm_regs = vcpu
            .fd
            .get_regs()
            .map_err(|e| BackendError::Call(format!("get_regs: {e}")))?;
        Ok(GpRegs {
            rax: r.rax,
            rbx: r.rbx,
            rcx: r.rcx,
            rdx: r.rdx,
            rsi: r.rsi,
            rdi: r.rdi,
            rsp: r.rsp,
            rbp: r.rbp,
            r8: r.r8,
            r9: r.r9,
            r10: r.r10,
            r11: r.r11,
            r12: r.r12,
            r13: r.r13,
            r14: r.r14,
            r15: r.r15,
            rip: r.rip,
            rflags: r.rflags,
        })
    }

    fn set_regs(vcpu: &Self::Vcpu, regs: &GpRegs) -> Result<(), BackendError> {
        let r = kvm_regs {
            rax: regs.rax,
            rbx: regs.rbx,
            rcx: regs.rcx,
            rdx: regs.rdx,
            rsi: regs.rsi,
            rdi: regs.rdi,
            rsp: regs.rsp,
            rbp: regs.rbp,
            r8: regs.r8,
            r9: regs.r9,
            r10: regs.r10,
            r11: regs.r11,
            r12: regs.r12,
            r13: regs.r13,
            r14: regs.r14,
            r15: regs.r15,
            rip: regs.rip,
            rflags: regs.rflags,
        };
        vcpu.fd
            .set_regs(&r)
            .map_err(|e| BackendError::Call(format!("set_regs: {e}")))
    }

    fn get_sregs(vcpu: &Self::Vcpu) -> Result<SpecialRegs, BackendError> {
        let s: kvm_sregs = vcpu
            .fd
            .get_sregs()
            .map_err(|e| BackendError::Call(format!("get_sregs: {e}")))?;
        Ok(SpecialRegs {
            cs: seg(&s.cs),
            ds: seg(&s.ds),
            es: seg(&s.es),
            fs: seg(&s.fs),
            gs: seg(&s.gs),
            ss: seg(&s.ss),
            gdt_base: s.gdt.base,
            gdt_limit: s.gdt.limit,
            idt_base: s.idt.base,
            idt_limit: s.idt.limit,
            cr0: s.cr0,
            cr2: s.cr2,
            cr3: s.cr3,
            cr4: s.cr4,
            efer: s.efer,
        })
    }

    fn set_sregs(vcpu: &Self::Vcpu, sregs: &SpecialRegs) -> Result<(), BackendError> {
        let mut s: kvm_sregs = vcpu
            .fd
            .get_sregs()
            .map_err(|e| BackendError::Call(format!("get_sregs (for set): {e}")))?;

        let apply = |dst: &mut kvm_segment, src: &Segment| {
            dst.selector = src.selector;
            dst.base = src.base;
            dst.limit = src.limit;
            dst.type_ = (src.access & 0xf) as u8;
            dst.present = ((src.access >> 7) & 1) as u8;
            dst.dpl = ((src.access >> 5) & 0x3) as u8;
            dst.s = 1;
            dst.g = if src.limit > 0xfffff { 1 } else { 0 };
            dst.db = 0;
            dst.l = 1;
        };
        apply(&mut s.cs, &sregs.cs);
        apply(&mut s.ds, &sregs.ds);
        apply(&mut s.es, &sregs.es);
        apply(&mut s.fs, &sregs.fs);
        apply(&mut s.gs, &sregs.gs);
        apply(&mut s.ss, &sregs.ss);
        s.gdt.base = sregs.gdt_base;
        s.gdt.limit = sregs.gdt_limit;
        s.idt.base = sregs.idt_base;
        s.idt.limit = sregs.idt_limit;
        s.cr0 = sregs.cr0;
        s.cr2 = sregs.cr2;
        s.cr3 = sregs.cr3;
        s.cr4 = sregs.cr4;
        s.efer = sregs.efer;

        vcpu.fd
            .set_sregs(&s)
            .map_err(|e| BackendError::Call(format!("set_sregs: {e}")))
    }

    fn irq_line(vm: &Self::Vm, irq: u32, level: bool) -> Result<(), BackendError> {
        vm.vm_fd
            .set_irq_line(irq, level)
            .map_err(|e| BackendError::Call(format!("set_irq_line: {e}")))
    }
}
