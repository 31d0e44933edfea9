//! Placeholder backend for platforms with neither KVM nor Hypervisor.framework.
//! Every call fails with `BackendError::Unavailable` so `main` can report a
//! clear error instead of failing to link.

use super::{Backend, BackendError, ExitHandler, ExitReason, GpRegs, MemorySlot, SpecialRegs};

pub struct StubVm;
pub struct StubVcpu;
pub struct StubBackend;

const UNAVAILABLE: &str = "no supported hypervisor on this platform";

impl Backend for StubBackend {
    type Vm = StubVm;
    type Vcpu = StubVcpu;

    fn init() -> Result<(), BackendError> {
        Err(BackendError::Unavailable(UNAVAILABLE))
    }

    fn create_vm() -> Result<Self::Vm, BackendError> {
        Err(BackendError::Unavailable(UNAVAILABLE))
    }

    fn destroy_vm(_vm: Self::Vm) {}

    fn create_vcpu(_vm: &Self::Vm, _index: u32) -> Result<Self::Vcpu, BackendError> {
        Err(BackendError::Unavailable(UNAVAILABLE))
    }

    fn destroy_vcpu(_vcpu: Self::Vcpu) {}

    fn map_memory(_vm: &Self::Vm, _slot: MemorySlot) -> Result<(), BackendError> {
        Err(BackendError::Unavailable(UNAVAILABLE))
    }

    fn unmap_memory(_vm: &Self::Vm, _slot: u32) -> Result<(), BackendError> {
        Err(BackendError::Unavailable(UNAVAILABLE))
    }

    fn run(_vcpu: &Self::Vcpu, _handler: &mut dyn ExitHandler) -> Result<ExitReason, BackendError> {
        Err(BackendError::Unavailable(UNAVAILABLE))
    }

    // No backend, so nothing can be blocked inside `run` to force an exit
    // from; a no-op returning success matches every other backend's
    // already-prompt `run`.
    fn vcpu_exit(_vcpu: &Self::Vcpu) -> Result<(), BackendError> {
        Ok(())
    }

    fn get_regs(_vcpu: &Self::Vcpu) -> Result<GpRegs, BackendError> {
        Err(BackendError::Unavailable(UNAVAILABLE))
    }

    fn set_regs(_vcpu: &Self::Vcpu, _regs: &GpRegs) -> Result<(), BackendError> {
        Err(BackendError::Unavailable(UNAVAILABLE))
    }

    fn get_sregs(_vcpu: &Self::Vcpu) -> Result<SpecialRegs, BackendError> {
        Err(BackendError::Unavailable(UNAVAILABLE))
    }

    fn set_sregs(_vcpu: &Self::Vcpu, _sregs: &SpecialRegs) -> Result<(), BackendError> {
        Err(BackendError::Unavailable(UNAVAILABLE))
    }

    fn irq_line(_vm: &Self::Vm, _irq: u32, _level: bool) -> Result<(), BackendError> {
        Err(BackendError::Unavailable(UNAVAILABLE))
    }
}
