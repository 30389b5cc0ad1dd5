//! Core library for the flock object store.
//!
//! This crate provides the fundamental abstractions shared by every other
//! crate in the workspace:
//! - Node identity and membership snapshots
//! - Virtual nodes and the consistent-hash ring
//! - The append-only epoch log
//! - The shared cluster view
//! - Named worker pools for blocking work

pub mod epoch;
pub mod error;
pub mod hash;
pub mod node;
pub mod ring;
pub mod view;
pub mod vnode;
pub mod work;

pub use epoch::EpochLog;
pub use error::{Error, Result};
pub use node::{Node, NodeId};
pub use ring::Ring;
pub use view::{ClusterConfig, ClusterView, OldRing, SharedView, Status, WritePolicy};
pub use vnode::VirtualNode;
pub use work::{WorkQueue, WorkQueues};

/// Fixed size of a data object.
pub const DATA_OBJ_SIZE: u64 = 4 << 20;

/// Upper bound on the replication factor a format request may ask for.
pub const MAX_COPIES: usize = 8;

/// Default number of ring positions a storage node claims.
pub const DEFAULT_VNODES: u16 = 64;
