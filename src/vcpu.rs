//! Per-vCPU worker thread and exit dispatch.
//!
//! Every vCPU gets its own OS thread. The vCPU handle itself is created
//! on that thread rather than handed in from the spawner: Hypervisor.framework's
//! ARM64 API binds a vCPU to whichever thread creates it, so rather than
//! special-case that one backend, every backend creates its handle the
//! same way (`HandleState::Deferred` below - there is no eager path left
//! to choose between, which is itself the simplification this design
//! settled on).

use crate::backend::{Backend, BackendError, ExitHandler, ExitReason, GpRegs, SpecialRegs, STUCK_EXIT_CAP};
use crate::device::{Cmos, Com1, MmioBus, CMOS_PORT_DATA, CMOS_PORT_INDEX, SERIAL_COM1_BASE, SERIAL_COM1_END};
use crate::memory::MemoryManager;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VcpuError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("guest stuck in a tight exit loop ({0} consecutive exits)")]
    StuckGuest(u64),

    #[error("vcpu worker thread panicked")]
    ThreadPanicked,
}

/// Where a vCPU's hardware handle gets created relative to the worker
/// thread that drives it. Every backend this VMM supports ends up using
/// `Deferred` in practice - KVM's `VcpuFd` has no thread affinity
/// requirement but gains nothing from being created elsewhere, while
/// HVF's ARM64 API requires it. Keeping a single code path avoids a
/// parallel "eager" implementation that would only ever run on KVM.
pub enum HandleState {
    Deferred,
}

/// Devices reachable from the vCPU exit-dispatch loop: the two legacy
/// I/O-port devices and the MMIO bus, shared across every vCPU.
pub struct DeviceSet {
    pub com1: Mutex<Com1>,
    pub cmos: Mutex<Cmos>,
    pub bus: Mutex<MmioBus>,
    pub memory: Arc<MemoryManager>,
}

impl DeviceSet {
    pub fn new(memory: Arc<MemoryManager>) -> Self {
        Self {
            com1: Mutex::new(Com1::new()),
            cmos: Mutex::new(Cmos::new()),
            bus: Mutex::new(MmioBus::new()),
            memory,
        }
    }
}

struct Dispatcher<'a> {
    devices: &'a DeviceSet,
}

impl ExitHandler for Dispatcher<'_> {
    fn io_in(&mut self, port: u16, data: &mut [u8]) {
        if (SERIAL_COM1_BASE..=SERIAL_COM1_END).contains(&port) {
            let value = self.devices.com1.lock().unwrap().read(port);
            data.iter_mut().for_each(|b| *b = value);
        } else if port == CMOS_PORT_INDEX || port == CMOS_PORT_DATA {
            let value = self.devices.cmos.lock().unwrap().read(port);
            data.iter_mut().for_each(|b| *b = value);
        } else {
            data.iter_mut().for_each(|b| *b = 0xff);
        }
    }

    fn io_out(&mut self, port: u16, data: &[u8]) {
        if (SERIAL_COM1_BASE..=SERIAL_COM1_END).contains(&port) {
            let mut com1 = self.devices.com1.lock().unwrap();
            for &b in data {
                com1.write(port, b);
            }
        } else if port == CMOS_PORT_INDEX || port == CMOS_PORT_DATA {
            let mut cmos = self.devices.cmos.lock().unwrap();
            for &b in data {
                cmos.write(port, b);
            }
        }
    }

    fn mmio_read(&mut self, addr: u64, data: &mut [u8]) {
        self.devices
            .bus
            .lock()
            .unwrap()
            .read(addr, data, &self.devices.memory);
    }

    fn mmio_write(&mut self, addr: u64, data: &[u8]) {
        self.devices
            .bus
            .lock()
            .unwrap()
            .write(addr, data, &self.devices.memory);
    }
}

/// Per-exit-reason tally, incremented once per genuinely counted exit.
/// `ExitReason::Interrupted` never reaches `record` - a signal-interrupted
/// `run` is retried and is not an exit at all.
#[derive(Default)]
pub struct ExitCounters {
    hlt: AtomicU64,
    io: AtomicU64,
    mmio: AtomicU64,
    external: AtomicU64,
    fail_entry: AtomicU64,
    shutdown: AtomicU64,
    internal_error: AtomicU64,
    exception: AtomicU64,
    canceled: AtomicU64,
    vtimer: AtomicU64,
    unknown: AtomicU64,
}

impl ExitCounters {
    fn record(&self, reason: ExitReason) {
        let counter = match reason {
            ExitReason::Hlt => &self.hlt,
            ExitReason::Io => &self.io,
            ExitReason::Mmio => &self.mmio,
            ExitReason::External => &self.external,
            ExitReason::FailEntry(_) => &self.fail_entry,
            ExitReason::Shutdown => &self.shutdown,
            ExitReason::InternalError => &self.internal_error,
            ExitReason::Exception(_) => &self.exception,
            ExitReason::Canceled => &self.canceled,
            ExitReason::Vtimer => &self.vtimer,
            ExitReason::Unknown => &self.unknown,
            ExitReason::Interrupted => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hlt(&self) -> u64 {
        self.hlt.load(Ordering::Relaxed)
    }
    pub fn io(&self) -> u64 {
        self.io.load(Ordering::Relaxed)
    }
    pub fn mmio(&self) -> u64 {
        self.mmio.load(Ordering::Relaxed)
    }
    pub fn external(&self) -> u64 {
        self.external.load(Ordering::Relaxed)
    }
    pub fn fail_entry(&self) -> u64 {
        self.fail_entry.load(Ordering::Relaxed)
    }
    pub fn shutdown(&self) -> u64 {
        self.shutdown.load(Ordering::Relaxed)
    }
    pub fn internal_error(&self) -> u64 {
        self.internal_error.load(Ordering::Relaxed)
    }
    pub fn exception(&self) -> u64 {
        self.exception.load(Ordering::Relaxed)
    }
    pub fn canceled(&self) -> u64 {
        self.canceled.load(Ordering::Relaxed)
    }
    pub fn vtimer(&self) -> u64 {
        self.vtimer.load(Ordering::Relaxed)
    }
    pub fn unknown(&self) -> u64 {
        self.unknown.load(Ordering::Relaxed)
    }
}

/// A handle to a running vCPU worker thread.
///
/// The vCPU handle itself lives behind `Arc<Mutex<Option<Arc<B::Vcpu>>>>`
/// rather than being owned outright: `request_stop` runs on a different
/// thread than the one driving `run`, and calling `B::vcpu_exit` to break
/// a blocked `run` needs a reference to the same handle without requiring
/// exclusive access to it. The worker thread publishes its handle into the
/// slot right after creating it and keeps its own clone for the rest of
/// the loop; `join` reclaims the slot's clone once the thread has
/// definitely exited, at which point it is the only clone left and
/// `Arc::try_unwrap` hands the handle back for `destroy_vcpu`.
pub struct VcpuRunner<B: Backend> {
    join: Option<JoinHandle<Result<(), VcpuError>>>,
    should_stop: Arc<AtomicBool>,
    exit_count: Arc<AtomicU64>,
    exit_counters: Arc<ExitCounters>,
    vcpu_handle: Arc<Mutex<Option<Arc<B::Vcpu>>>>,
    index: u32,
}

impl<B> VcpuRunner<B>
where
    B: Backend + 'static,
    B::Vm: Send + Sync,
    B::Vcpu: Send + Sync,
{
    pub fn spawn(
        vm: Arc<B::Vm>,
        index: u32,
        initial_regs: GpRegs,
        initial_sregs: Option<SpecialRegs>,
        devices: Arc<DeviceSet>,
    ) -> Self {
        let should_stop = Arc::new(AtomicBool::new(false));
        let exit_count = Arc::new(AtomicU64::new(0));
        let exit_counters = Arc::new(ExitCounters::default());
        let vcpu_handle: Arc<Mutex<Option<Arc<B::Vcpu>>>> = Arc::new(Mutex::new(None));

        let thread_should_stop = should_stop.clone();
        let thread_exit_count = exit_count.clone();
        let thread_exit_counters = exit_counters.clone();
        let thread_vcpu_handle = vcpu_handle.clone();

        let join = std::thread::Builder::new()
            .name(format!("vcpu-{index}"))
            .spawn(move || -> Result<(), VcpuError> {
                let vcpu = Arc::new(B::create_vcpu(&vm, index)?);
                B::set_regs(vcpu.as_ref(), &initial_regs)?;
                if let Some(sregs) = &initial_sregs {
                    B::set_sregs(vcpu.as_ref(), sregs)?;
                }
                *thread_vcpu_handle.lock().unwrap() = Some(vcpu.clone());

                let mut dispatcher = Dispatcher { devices: &devices };
                let mut consecutive_exits = 0u64;

                loop {
                    if thread_should_stop.load(Ordering::Relaxed) {
                        break;
                    }

                    let reason = match B::run(vcpu.as_ref(), &mut dispatcher) {
                        Ok(reason) => reason,
                        Err(e) => {
                            log::error!("vcpu {index}: run failed: {e}");
                            return Err(e.into());
                        }
                    };

                    // A signal broke the run call mid-flight; retry
                    // without treating it as an exit.
                    if reason == ExitReason::Interrupted {
                        continue;
                    }

                    thread_exit_count.fetch_add(1, Ordering::Relaxed);
                    thread_exit_counters.record(reason);

                    match reason {
                        // A benign idle notice: loop back into run. A real
                        // kernel's idle loop halts and wakes on every
                        // interrupt, so this must not end the vCPU.
                        ExitReason::Hlt
                        | ExitReason::Io
                        | ExitReason::Mmio
                        | ExitReason::External
                        | ExitReason::Vtimer => {
                            consecutive_exits += 1;
                            if consecutive_exits > STUCK_EXIT_CAP {
                                log::error!("vcpu {index}: exceeded stuck-exit cap");
                                return Err(VcpuError::StuckGuest(consecutive_exits));
                            }
                            continue;
                        }
                        ExitReason::Shutdown => {
                            log::info!("vcpu {index}: guest requested shutdown");
                            thread_should_stop.store(true, Ordering::Relaxed);
                            break;
                        }
                        ExitReason::Canceled => {
                            log::info!("vcpu {index}: vcpu_exit cancellation");
                            thread_should_stop.store(true, Ordering::Relaxed);
                            break;
                        }
                        ExitReason::FailEntry(code) => {
                            log::error!("vcpu {index}: failed to enter guest, reason={code:#x}");
                            break;
                        }
                        ExitReason::InternalError => {
                            log::error!("vcpu {index}: hypervisor internal error");
                            break;
                        }
                        ExitReason::Exception(syndrome) => {
                            log::error!("vcpu {index}: unhandled exception, syndrome={syndrome:#x}");
                            break;
                        }
                        ExitReason::Unknown => {
                            log::warn!("vcpu {index}: unknown exit reason");
                            break;
                        }
                        ExitReason::Interrupted => unreachable!("handled above"),
                    }
                }

                Ok(())
            })
            .expect("failed to spawn vcpu thread");

        Self {
            join: Some(join),
            should_stop,
            exit_count,
            exit_counters,
            vcpu_handle,
            index,
        }
    }

    /// Flags the worker to stop and, if it has published its vCPU handle,
    /// asks the backend to force a blocked `run` to return. On backends
    /// where `run` never blocks this is a no-op and the flag check at the
    /// top of the next loop iteration is what actually stops the thread.
    pub fn request_stop(&self) {
        self.should_stop.store(true, Ordering::Relaxed);
        if let Some(vcpu) = self.vcpu_handle.lock().unwrap().as_ref() {
            if let Err(e) = B::vcpu_exit(vcpu.as_ref()) {
                log::warn!("vcpu {}: vcpu_exit failed: {e}", self.index);
            }
        }
    }

    pub fn exit_count(&self) -> u64 {
        self.exit_count.load(Ordering::Relaxed)
    }

    pub fn exit_counters(&self) -> &ExitCounters {
        &self.exit_counters
    }

    pub fn join(mut self) -> Result<(), VcpuError> {
        let result = self
            .join
            .take()
            .expect("join called twice")
            .join()
            .unwrap_or(Err(VcpuError::ThreadPanicked));

        // The worker's own clone of the handle has dropped by now - the
        // thread has fully exited, so the slot holds the only one left.
        if let Some(vcpu) = self.vcpu_handle.lock().unwrap().take() {
            match Arc::try_unwrap(vcpu) {
                Ok(vcpu) => B::destroy_vcpu(vcpu),
                Err(_) => log::error!("vcpu {}: handle still shared at join, leaking it", self.index),
            }
        }

        result
    }
}
