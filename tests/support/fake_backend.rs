//! A scripted `Backend` implementation: each vCPU replays a fixed sequence
//! of exits instead of talking to `/dev/kvm` or Hypervisor.framework, so
//! the runner/dispatch/virtqueue code can be exercised without real
//! virtualization hardware.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use vmmlet::backend::{Backend, BackendError, ExitHandler, ExitReason, GpRegs, MemorySlot, SpecialRegs};

/// One step of a scripted vCPU run. `FakeBackend::run` pops one of these
/// per call and feeds it to the `ExitHandler`, mirroring what a real
/// backend does when it decodes a `kvm_run`/`hv_vcpu_run` exit.
pub enum ExitStep {
    IoOut { port: u16, data: Vec<u8> },
    IoIn { port: u16, len: usize },
    MmioWrite { addr: u64, data: Vec<u8> },
    /// A guest MMIO read; `capture`, if set, receives the bytes the
    /// device returned so the test can assert on them afterward.
    MmioRead { addr: u64, len: usize, capture: Option<Arc<Mutex<Vec<u8>>>> },
    Hlt,
    Shutdown,
}

pub struct FakeVm {
    scripts: Mutex<HashMap<u32, VecDeque<ExitStep>>>,
}

impl FakeVm {
    /// Installs the script a not-yet-created vCPU will replay. Must be
    /// called before `Vm::start` spawns the worker thread that creates it.
    pub fn set_script(&self, vcpu_index: u32, steps: Vec<ExitStep>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(vcpu_index, steps.into_iter().collect());
    }
}

pub struct FakeVcpu {
    steps: Mutex<VecDeque<ExitStep>>,
}

pub struct FakeBackend;

impl Backend for FakeBackend {
    type Vm = FakeVm;
    type Vcpu = FakeVcpu;

    fn init() -> Result<(), BackendError> {
        Ok(())
    }

    fn create_vm() -> Result<Self::Vm, BackendError> {
        Ok(FakeVm {
            scripts: Mutex::new(HashMap::new()),
        })
    }

    fn destroy_vm(_vm: Self::Vm) {}

    fn create_vcpu(vm: &Self::Vm, index: u32) -> Result<Self::Vcpu, BackendError> {
        let steps = vm.scripts.lock().unwrap().remove(&index).unwrap_or_default();
        Ok(FakeVcpu {
            steps: Mutex::new(steps),
        })
    }

    fn destroy_vcpu(_vcpu: Self::Vcpu) {}

    fn map_memory(_vm: &Self::Vm, _slot: MemorySlot) -> Result<(), BackendError> {
        Ok(())
    }

    fn unmap_memory(_vm: &Self::Vm, _slot: u32) -> Result<(), BackendError> {
        Ok(())
    }

    fn run(vcpu: &Self::Vcpu, handler: &mut dyn ExitHandler) -> Result<ExitReason, BackendError> {
        let step = vcpu.steps.lock().unwrap().pop_front();
        Ok(match step {
            // Script exhausted with no explicit Shutdown: behave as if the
            // harness itself requested the stop, so a test whose guest
            // just halts doesn't spin the now non-fatal Hlt forever.
            None => ExitReason::Shutdown,
            Some(ExitStep::IoOut { port, data }) => {
                handler.io_out(port, &data);
                ExitReason::Io
            }
            Some(ExitStep::IoIn { port, len }) => {
                let mut buf = vec![0u8; len];
                handler.io_in(port, &mut buf);
                ExitReason::Io
            }
            Some(ExitStep::MmioWrite { addr, data }) => {
                handler.mmio_write(addr, &data);
                ExitReason::Mmio
            }
            Some(ExitStep::MmioRead { addr, len, capture }) => {
                let mut buf = vec![0u8; len];
                handler.mmio_read(addr, &mut buf);
                if let Some(capture) = capture {
                    *capture.lock().unwrap() = buf;
                }
                ExitReason::Mmio
            }
            Some(ExitStep::Hlt) => ExitReason::Hlt,
            Some(ExitStep::Shutdown) => ExitReason::Shutdown,
        })
    }

    fn vcpu_exit(_vcpu: &Self::Vcpu) -> Result<(), BackendError> {
        Ok(())
    }

    fn get_regs(_vcpu: &Self::Vcpu) -> Result<GpRegs, BackendError> {
        Ok(GpRegs::default())
    }

    fn set_regs(_vcpu: &Self::Vcpu, _regs: &GpRegs) -> Result<(), BackendError> {
        Ok(())
    }

    fn get_sregs(_vcpu: &Self::Vcpu) -> Result<SpecialRegs, BackendError> {
        Ok(SpecialRegs::default())
    }

    fn set_sregs(_vcpu: &Self::Vcpu, _sregs: &SpecialRegs) -> Result<(), BackendError> {
        Ok(())
    }

    fn irq_line(_vm: &Self::Vm, _irq: u32, _level: bool) -> Result<(), BackendError> {
        Ok(())
    }
}
