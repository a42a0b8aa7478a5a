// Proxmox VE REST client and VmController implementation

mod client;
mod task;
mod vm;


pub use client::{
    NodeStatus, ProxmoxClient, TaskStatus, Version, VmSummary, DEFAULT_TASK_POLL_INTERVAL,
    DEFAULT_TASK_TIMEOUT,
};
pub use vm::ProxmoxVm;
