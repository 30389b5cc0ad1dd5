//! Replicated object I/O.
//!
//! The gateway side of the data plane: local op execution for forwarded
//! frames, and the fan-out that turns one client op into writes on every
//! replica owner (or a first-answer read across them).

pub mod gateway;
pub mod local;

pub use gateway::Gateway;
pub use local::LocalOps;
