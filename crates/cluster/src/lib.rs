//! Cluster control plane.
//!
//! The seam to the group-communication bus, the membership state machine
//! that orders joins, leaves and vdi mutations into epoch-stamped views,
//! and the recovery engine that moves objects whenever the ring changes.

pub mod driver;
pub mod local;
pub mod machine;
pub mod message;
pub mod recovery;
pub mod vdi;

pub use driver::{connect, ClusterDriver, DriverEvent};
pub use local::LocalBus;
pub use machine::{spawn, ClusterHandle, MachineParams};
pub use vdi::{VdiRegistry, VdiState};
