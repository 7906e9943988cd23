//! Flotilla allocator — network and endpoint resources.
//!
//! Before a task is eligible for scheduling it needs its addresses:
//! networks get subnet pools carved from the cluster address space,
//! services get published ports, tasks get per-attachment IPs and
//! volume bindings. The allocation loop watches the store and advances
//! tasks `New → Allocated` once everything they reference is resolved.

pub mod allocator;
pub mod error;
pub mod ipam;
pub mod ports;

pub use allocator::Allocator;
pub use error::{AllocatorError, AllocatorResult};
pub use ipam::{AddressSpace, SubnetPool};
pub use ports::PortAllocator;
