// Configuration loading and validation
pub mod config;

// Hypervisor capability contracts
pub mod controller;

// Pub/sub transport (NATS and in-memory)
pub mod events;

// Home Assistant discovery documents and entity publishing
pub mod hass;

// Proxmox VE API client
pub mod proxmox;

pub use controller::{HypervisorError, VmController, VmInventory};
pub use events::{EventsClient, MessageStream};
