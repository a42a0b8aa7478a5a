//! VM Manager - Per-machine entity loops for the Proxmox bridge.
//!
//! Every monitored virtual machine becomes one hub device with two entities:
//! a state sensor that reports the machine's power status and a command
//! select that accepts lifecycle commands.
//!
//! # Architecture
//!
//! ```text
//!            BridgeServer
//!   (scan, filter, connect, shutdown)
//!                 ↓
//! ┌─────────────────────────────────────────┐
//! │   VirtualMachineDevice (one per VM)     │
//! │  - builds the device descriptor         │
//! │  - runs its entities concurrently       │
//! │  - stops them in creation order         │
//! └─────────────────────────────────────────┘
//!          ↓                     ↓
//!    VmStateSensor         VmCommandSelect
//!   probe → state topic   command topic → VmController
//! ```
//!
//! # Core Types
//!
//! - [`Entity`] - Trait implemented by every entity loop
//! - [`StopSignal`] - Stop request / acknowledgement pair for one loop
//! - [`VirtualMachineDevice`] - Supervisor for one machine
//! - [`BridgeServer`] - Fleet server for all monitored machines

pub mod device;
pub mod entity;
pub mod manager;
pub mod runners;
pub mod shutdown;

pub use device::{DeviceSettings, VirtualMachineDevice};
pub use entity::{Entity, EntitySettings, ExitReason, StopSignal};
pub use manager::BridgeServer;
pub use runners::command::VmCommandSelect;
pub use runners::sensor::VmStateSensor;

#[cfg(test)]
pub(crate) mod testing;
