//! The shared cluster view.
//!
//! The membership state machine is the only writer; every other component
//! (gateway fan-out, local op execution, recovery) snapshots the view by
//! cloning an `Arc` under a short read lock. A snapshot stays internally
//! consistent for as long as the holder keeps it, which is what request
//! handlers rely on when they stamp their epoch into forwarded frames.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::node::Node;
use crate::ring::Ring;

/// Local node status, driven by the membership state machine.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Status {
    /// First boot with an empty epoch log; waiting for a format request.
    WaitForFormat,
    /// Has an epoch log but no accepted join yet.
    WaitForJoin,
    /// Join sent, response pending.
    Joining,
    Serving,
    /// Too few live nodes or zones for the configured redundancy; writes
    /// are rejected, reads continue.
    Halted,
    ShuttingDown,
    Killed,
}

/// What a gateway write needs before it reports success.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum WritePolicy {
    /// Every replica must ack; anything less fails the write with `halt`.
    Halt,
    /// A majority of the configured copies suffices.
    Degraded,
}

impl Status {
    /// Numeric form carried in cluster-stat responses.
    pub fn to_wire(self) -> u32 {
        match self {
            Status::WaitForFormat => 1,
            Status::WaitForJoin => 2,
            Status::Joining => 3,
            Status::Serving => 4,
            Status::Halted => 5,
            Status::ShuttingDown => 6,
            Status::Killed => 7,
        }
    }

    pub fn from_wire(v: u32) -> Option<Self> {
        Some(match v {
            1 => Status::WaitForFormat,
            2 => Status::WaitForJoin,
            3 => Status::Joining,
            4 => Status::Serving,
            5 => Status::Halted,
            6 => Status::ShuttingDown,
            7 => Status::Killed,
            _ => return None,
        })
    }
}

impl std::str::FromStr for WritePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "halt" => Ok(WritePolicy::Halt),
            "degraded" => Ok(WritePolicy::Degraded),
            other => Err(Error::InvalidParms(format!("unknown write policy '{other}'"))),
        }
    }
}

/// Node-local configuration threaded through construction.
#[derive(Copy, Clone, Debug)]
pub struct ClusterConfig {
    pub write_policy: WritePolicy,
    /// Skip the per-write fsync; durability is traded for throughput.
    pub write_cache: bool,
    /// Advertised capacity in bytes, 0 for unlimited.
    pub disk_space: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            write_policy: WritePolicy::Halt,
            write_cache: false,
            disk_space: 0,
        }
    }
}

/// The ring of the previous epoch, kept while recovery is rebuilding the
/// on-disk layout toward the current one.
#[derive(Clone, Debug)]
pub struct OldRing {
    pub epoch: u32,
    pub ring: Ring,
}

/// One consistent snapshot of cluster state.
#[derive(Clone, Debug)]
pub struct ClusterView {
    pub epoch: u32,
    pub ctime: u64,
    pub status: Status,
    /// Replication factor fixed at format time; 0 before format.
    pub copies: usize,
    pub ring: Ring,
    pub prev: Option<OldRing>,
}

impl ClusterView {
    /// The view of a node that has never seen a formatted cluster.
    pub fn unformatted() -> Self {
        Self {
            epoch: 0,
            ctime: 0,
            status: Status::WaitForFormat,
            copies: 0,
            ring: Ring::default(),
            prev: None,
        }
    }

    /// The master is the lowest-ranked live member.
    pub fn master(&self) -> Option<Node> {
        self.ring.nodes().first().copied()
    }

    pub fn recovering(&self) -> bool {
        self.prev.is_some()
    }

    /// Gate a remote request against the local epoch.
    pub fn check_epoch(&self, req_epoch: u32) -> Result<()> {
        if req_epoch < self.epoch {
            Err(Error::OldNodeVer)
        } else if req_epoch > self.epoch {
            Err(Error::NewNodeVer)
        } else {
            Ok(())
        }
    }
}

/// Cheap cloneable handle to the current view.
///
/// Readers take a short read lock and clone the inner `Arc`; the state
/// machine swaps the whole snapshot on every epoch bump.
#[derive(Clone)]
pub struct SharedView {
    inner: Arc<RwLock<Arc<ClusterView>>>,
}

impl SharedView {
    pub fn new(view: ClusterView) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(view))),
        }
    }

    pub fn get(&self) -> Arc<ClusterView> {
        self.inner.read().clone()
    }

    pub fn set(&self, view: ClusterView) {
        *self.inner.write() = Arc::new(view);
    }

    /// Point mutation of the status without an epoch change.
    pub fn set_status(&self, status: Status) {
        let mut guard = self.inner.write();
        let mut view = (**guard).clone();
        view.status = status;
        *guard = Arc::new(view);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeId;
    use std::net::IpAddr;

    fn node(ip: &str, port: u16) -> Node {
        Node::new(NodeId::new(ip.parse::<IpAddr>().unwrap(), port), 1, 64)
    }

    #[test]
    fn test_master_is_lowest_ranked() {
        let ring = Ring::build(&[node("10.0.0.9", 7000), node("10.0.0.1", 7000)]);
        let view = ClusterView {
            epoch: 1,
            ctime: 1,
            status: Status::Serving,
            copies: 1,
            ring,
            prev: None,
        };
        assert_eq!(view.master().unwrap().nid, node("10.0.0.1", 7000).nid);
    }

    #[test]
    fn test_check_epoch() {
        let mut view = ClusterView::unformatted();
        view.epoch = 5;
        assert!(matches!(view.check_epoch(4), Err(Error::OldNodeVer)));
        assert!(matches!(view.check_epoch(6), Err(Error::NewNodeVer)));
        assert!(view.check_epoch(5).is_ok());
    }

    #[test]
    fn test_shared_view_swap() {
        let shared = SharedView::new(ClusterView::unformatted());
        let before = shared.get();
        shared.set_status(Status::Serving);
        assert_eq!(before.status, Status::WaitForFormat);
        assert_eq!(shared.get().status, Status::Serving);
    }
}
