//! The seam to the group-communication bus.
//!
//! The membership state machine is driven entirely by the totally-ordered
//! event stream a driver delivers; everything cluster-wide (joins, leaves,
//! vdi mutations, format) rides on it. Drivers are looked up by name at
//! startup; the in-process `local` driver ships with the crate, external
//! buses plug in behind the same trait.

use std::sync::Arc;

use async_trait::async_trait;
use corelib::{Error, Node, NodeId, Result};
use tokio::sync::mpsc;

use crate::local::LocalBus;

/// One totally-ordered delivery from the bus.
#[derive(Clone, Debug)]
pub enum DriverEvent {
    /// An application message broadcast by `from`.
    Message { from: NodeId, data: Vec<u8> },
    /// A membership change observed by the bus (clean leave or failure
    /// detector, the machine does not care which).
    ConfChange {
        joined: Vec<Node>,
        left: Vec<Node>,
        members: Vec<Node>,
    },
}

/// A handle onto the group-communication bus, bound to one node.
///
/// The contract every implementation must keep: events are delivered to all
/// subscribers in one global order, a `join` delivers the configuration
/// change before the carried join message, and a node's own events are
/// delivered back to it like everyone else's.
#[async_trait]
pub trait ClusterDriver: Send + Sync + 'static {
    /// Subscribe to the event stream. Must be called before `join` so no
    /// delivery is missed.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<DriverEvent>;

    /// Enter the group, carrying an opaque join payload for the members.
    async fn join(&self, node: Node, msg: Vec<u8>) -> Result<()>;

    /// Depart cleanly.
    async fn leave(&self, node: NodeId) -> Result<()>;

    /// Broadcast an application message to the whole group, self included.
    async fn notify(&self, msg: Vec<u8>) -> Result<()>;
}

/// Resolve a driver by its `--cluster` name.
pub fn connect(name: &str, node: Node) -> Result<Arc<dyn ClusterDriver>> {
    match name {
        "local" => Ok(LocalBus::new().handle(node)),
        other => Err(Error::InvalidParms(format!(
            "unknown cluster driver '{other}'"
        ))),
    }
}
