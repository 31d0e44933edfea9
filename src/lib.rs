//! vmmlet: a minimal virtual machine monitor for KVM and Hypervisor.framework.
//!
//! `main.rs` is a thin CLI wrapper around this library; integration tests
//! under `tests/` link against it directly to drive the vCPU runner, device
//! bus, and virtio dispatch against a scripted fake backend.

pub mod backend;
pub mod boot;
pub mod device;
pub mod memory;
pub mod vcpu;
pub mod virtio;
pub mod vm;
