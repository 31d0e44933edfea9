//! Hypervisor backend abstraction.
//!
//! A `Backend` is the thin layer between the VMM and whatever hardware
//! virtualization facility the host provides: KVM on Linux, or
//! Hypervisor.framework on macOS (x86_64 and ARM64 each need their own
//! arm because Apple's API and thread-affinity rules differ per
//! architecture). Exactly one concrete backend is compiled into any given
//! binary, selected by `cfg(target_os, target_arch)` - there is no runtime
//! registry and no trait object, so the compiler can see straight through
//! to the real implementation on every call.

#[cfg(target_os = "linux")]
pub mod kvm;

#[cfg(all(target_os = "macos", target_arch = "x86_64"))]
pub mod hvf_x86;

#[cfg(all(target_os = "macos", target_arch = "aarch64"))]
pub mod hvf_arm;

#[cfg(not(any(
    target_os = "linux",
    all(target_os = "macos", target_arch = "x86_64"),
    all(target_os = "macos", target_arch = "aarch64")
)))]
pub mod stub;

use thiserror::Error;

/// Errors a backend call can fail with.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("backend unavailable on this platform: {0}")]
    Unavailable(&'static str),

    #[error("hypervisor call failed: {0}")]
    Call(String),
}

/// A guest memory slot as seen by the backend: a GPA range mapped to a
/// host virtual address.
#[derive(Debug, Clone, Copy)]
pub struct MemorySlot {
    pub slot: u32,
    pub gpa: u64,
    pub size: u64,
    pub hva: u64,
}

/// General-purpose register file, x86_64-shaped (the common case across
/// both supported architectures - ARM64 backends only populate `rip`
/// (program counter) and `rflags` (CPSR) and leave the rest zero).
#[derive(Debug, Clone, Copy, Default)]
pub struct GpRegs {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
}

/// A segment descriptor, shared by the six x86 segment registers.
#[derive(Debug, Clone, Copy, Default)]
pub struct Segment {
    pub selector: u16,
    pub base: u64,
    pub limit: u32,
    pub access: u32,
}

/// Special/system registers. Only meaningful on x86_64 backends; ARM64
/// backends accept and ignore sets of this (see `hvf_arm::HvfArmBackend`).
#[derive(Debug, Clone, Copy, Default)]
pub struct SpecialRegs {
    pub cs: Segment,
    pub ds: Segment,
    pub es: Segment,
    pub fs: Segment,
    pub gs: Segment,
    pub ss: Segment,
    pub gdt_base: u64,
    pub gdt_limit: u32,
    pub idt_base: u64,
    pub idt_limit: u32,
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub efer: u64,
}

/// Why a vCPU stopped running and returned to the VMM.
///
/// `Io`/`Mmio` mean the backend already dispatched the access through the
/// `ExitHandler` passed to `run` before returning - the VMM only needs
/// this variant to count the exit and decide whether to call `run` again.
///
/// `Interrupted` and `Canceled` both originate from `run` returning early
/// without the guest actually exiting on its own, but they are not the
/// same condition: `Interrupted` is a host signal breaking a blocking
/// syscall mid-flight (absorbed, retried, never counted as an exit);
/// `Canceled` is the guest-visible result of a `vcpu_exit` request (a real
/// exit - counted, and it stops the vCPU).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Hlt,
    Io,
    Mmio,
    External,
    FailEntry(u64),
    Shutdown,
    InternalError,
    Exception(u64),
    Canceled,
    Interrupted,
    Vtimer,
    Unknown,
}

/// Callbacks a backend invokes synchronously, from inside `run`, to
/// service an I/O or MMIO exit while the underlying hypervisor's exit
/// buffer is still live (for KVM, a borrow into the `kvm_run` mmap page
/// that must be filled before the next `run` ioctl).
pub trait ExitHandler {
    fn io_in(&mut self, port: u16, data: &mut [u8]);
    fn io_out(&mut self, port: u16, data: &[u8]);
    fn mmio_read(&mut self, addr: u64, data: &mut [u8]);
    fn mmio_write(&mut self, addr: u64, data: &[u8]);
}

/// The operations every hypervisor backend must provide.
///
/// This mirrors a C-style `hv_ops` table one-for-one, except expressed as
/// a Rust trait with an associated VM/vCPU handle type pair instead of
/// `void *` backend data.
pub trait Backend: Sized {
    type Vm;
    type Vcpu;

    fn init() -> Result<(), BackendError>;

    fn create_vm() -> Result<Self::Vm, BackendError>;
    fn destroy_vm(vm: Self::Vm);

    fn create_vcpu(vm: &Self::Vm, index: u32) -> Result<Self::Vcpu, BackendError>;
    fn destroy_vcpu(vcpu: Self::Vcpu);

    fn map_memory(vm: &Self::Vm, slot: MemorySlot) -> Result<(), BackendError>;
    fn unmap_memory(vm: &Self::Vm, slot: u32) -> Result<(), BackendError>;

    fn run(vcpu: &Self::Vcpu, handler: &mut dyn ExitHandler) -> Result<ExitReason, BackendError>;

    /// Force a `run` call that may be blocked indefinitely (e.g. ARM64
    /// WFI) to return early with `ExitReason::Canceled`. Called from a
    /// thread other than the one inside `run`, so it must not require
    /// exclusive access to the vCPU. Backends whose `run` always returns
    /// promptly on its own (KVM, x86 HVF) implement this as a no-op.
    fn vcpu_exit(vcpu: &Self::Vcpu) -> Result<(), BackendError>;

    fn get_regs(vcpu: &Self::Vcpu) -> Result<GpRegs, BackendError>;
    fn set_regs(vcpu: &Self::Vcpu, regs: &GpRegs) -> Result<(), BackendError>;

    fn get_sregs(vcpu: &Self::Vcpu) -> Result<SpecialRegs, BackendError>;
    fn set_sregs(vcpu: &Self::Vcpu, sregs: &SpecialRegs) -> Result<(), BackendError>;

    fn irq_line(vm: &Self::Vm, irq: u32, level: bool) -> Result<(), BackendError>;
}

/// Maximum number of consecutive exits processed without giving the host
/// a chance to intervene, guarding against a guest stuck in a tight
/// fault loop (e.g. repeatedly faulting the same unmapped MMIO address).
pub const STUCK_EXIT_CAP: u64 = 1000;
