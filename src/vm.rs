//! VM lifecycle container: owns the backend VM handle, guest memory, and
//! the vCPU worker threads built on top of them.

use crate::backend::{Backend, GpRegs, SpecialRegs};
use crate::memory::MemoryManager;
use crate::vcpu::{DeviceSet, ExitCounters, VcpuRunner};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Stopped,
    Running,
    Paused,
    Error,
}

#[derive(Error, Debug)]
pub enum VmError {
    #[error(transparent)]
    Backend(#[from] crate::backend::BackendError),

    #[error(transparent)]
    Memory(#[from] crate::memory::MemoryError),

    #[error("vm already running")]
    AlreadyRunning,

    #[error("vm is not running")]
    NotRunning,
}

/// Owns the backend-level VM handle plus every vCPU spawned against it.
/// Memory slots and devices are frozen once the VM transitions to
/// `Running` - adding a region or device afterward would race the vCPU
/// threads reading the bus/memory without synchronization.
pub struct Vm<B: Backend> {
    backend_vm: Arc<B::Vm>,
    pub memory: Arc<MemoryManager>,
    pub devices: Arc<DeviceSet>,
    runners: Vec<VcpuRunner<B>>,
    state: VmState,
}

impl<B> Vm<B>
where
    B: Backend + 'static,
    B::Vm: Send + Sync,
    B::Vcpu: Send + Sync,
{
    pub fn create() -> Result<Self, VmError> {
        B::init()?;
        let backend_vm = Arc::new(B::create_vm()?);
        let memory = Arc::new(MemoryManager::new());
        let devices = Arc::new(DeviceSet::new(memory.clone()));
        Ok(Self {
            backend_vm,
            memory,
            devices,
            runners: Vec::new(),
            state: VmState::Stopped,
        })
    }

    pub fn backend_vm(&self) -> &Arc<B::Vm> {
        &self.backend_vm
    }

    pub fn state(&self) -> VmState {
        self.state
    }

    /// Adds a guest memory region. Only valid before the VM starts
    /// running.
    pub fn add_memory_region(&mut self, gpa: u64, size: u64) -> Result<(), VmError> {
        if self.state != VmState::Stopped {
            return Err(VmError::AlreadyRunning);
        }
        self.memory.add_region::<B>(&self.backend_vm, gpa, size)?;
        Ok(())
    }

    /// Starts one vCPU thread per entry in `vcpus`, each given its own
    /// initial register state (entry point, stack, boot_params pointer,
    /// etc. - whatever the loader computed).
    pub fn start(
        &mut self,
        vcpus: Vec<(GpRegs, Option<SpecialRegs>)>,
    ) -> Result<(), VmError> {
        if self.state != VmState::Stopped {
            return Err(VmError::AlreadyRunning);
        }
        for (index, (regs, sregs)) in vcpus.into_iter().enumerate() {
            let runner = VcpuRunner::<B>::spawn(
                self.backend_vm.clone(),
                index as u32,
                regs,
                sregs,
                self.devices.clone(),
            );
            self.runners.push(runner);
        }
        self.state = VmState::Running;
        Ok(())
    }

    /// Requests every vCPU thread stop, then joins them.
    pub fn stop(&mut self) -> Result<(), VmError> {
        if self.state != VmState::Running {
            return Err(VmError::NotRunning);
        }
        for runner in &self.runners {
            runner.request_stop();
        }
        self.state = VmState::Stopped;
        Ok(())
    }

    /// Blocks until every vCPU thread exits on its own (guest halted,
    /// shut down, or hit a fatal error).
    pub fn join(&mut self) -> Result<(), VmError> {
        let mut first_err = None;
        for runner in self.runners.drain(..) {
            if let Err(e) = runner.join() {
                log::error!("vcpu worker exited with error: {e}");
                first_err = Some(e);
            }
        }
        if first_err.is_some() {
            self.state = VmState::Error;
        }
        Ok(())
    }

    pub fn total_exit_count(&self) -> u64 {
        self.runners.iter().map(|r| r.exit_count()).sum()
    }

    /// Per-vCPU exit-reason tallies, in runner order. Empty once `join`
    /// has drained the runners.
    pub fn exit_counters(&self) -> Vec<&ExitCounters> {
        self.runners.iter().map(|r| r.exit_counters()).collect()
    }
}

impl<B: Backend> Drop for Vm<B> {
    fn drop(&mut self) {
        for runner in &self.runners {
            runner.request_stop();
        }
    }
}
