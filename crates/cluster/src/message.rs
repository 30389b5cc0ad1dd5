//! Messages carried on the group-communication bus.
//!
//! Bus payloads are bincode-encoded; they never touch the 48-byte client
//! wire format. Deliveries are totally ordered, so every member applies the
//! same mutations in the same order and the replicated state (epoch, ring,
//! vdi registry) stays identical without further coordination.

use corelib::{Error, Node, NodeId, Result};
use serde::{Deserialize, Serialize};

use crate::vdi::VdiState;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ClusterMessage {
    Join(JoinRequest),
    JoinResponse(JoinResponse),
    VdiOp(VdiOpMessage),
    /// The previous master left; informational.
    MasterChanged { master: NodeId },
    /// Cluster-wide clean stop.
    Shutdown,
}

impl ClusterMessage {
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::System(e.to_string()))
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(|e| Error::System(e.to_string()))
    }
}

/// What a booting node announces when entering the group.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JoinRequest {
    pub node: Node,
    /// Latest epoch in the joiner's local log, 0 for a fresh directory.
    pub epoch: u32,
    /// The joiner's recorded cluster creation time, 0 for a fresh directory.
    pub ctime: u64,
}

/// The master's verdict, broadcast so every member applies the same
/// membership transition.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JoinResponse {
    /// The joiner being answered.
    pub node: Node,
    pub verdict: JoinVerdict,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum JoinVerdict {
    Accept {
        ctime: u64,
        copies: u32,
        /// The accepted member set including the joiner; every member
        /// converges on this list for the next epoch snapshot.
        members: Vec<Node>,
        /// Epoch entries the joiner is missing, oldest first, so its log
        /// catches up before the new epoch is appended on top.
        replay: Vec<(u32, Vec<Node>)>,
        /// The replicated vdi registry, so the joiner serves lookups
        /// without waiting for recovery to move inode objects.
        vdis: Vec<(String, VdiState)>,
    },
    Reject(JoinReject),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinReject {
    InvalidCtime,
    /// The joiner's log is ahead of the cluster.
    NewNodeVer,
}

impl JoinReject {
    pub fn into_error(self) -> Error {
        match self {
            JoinReject::InvalidCtime => Error::InvalidCtime,
            JoinReject::NewNodeVer => Error::NewNodeVer,
        }
    }
}

/// A globally-ordered vdi mutation. `origin` and `seq` let the proposing
/// node match the applied outcome back to its pending client request;
/// every other member applies the mutation and moves on.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VdiOpMessage {
    pub origin: NodeId,
    pub seq: u64,
    pub op: VdiOp,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum VdiOp {
    /// Creates the cluster: epoch 0 becomes epoch 1 over the current
    /// members.
    Format { ctime: u64, copies: u32 },
    Create {
        name: String,
        size: u64,
        base_vdi_id: u32,
        snap_id: u32,
        /// Stamped by the proposer so every member records the same value.
        ctime: u64,
    },
    Delete { name: String },
    Lock { name: String, owner: NodeId },
    Release { name: String, owner: NodeId },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    #[test]
    fn test_message_roundtrip() {
        let nid = NodeId::new("10.0.0.1".parse::<IpAddr>().unwrap(), 7000);
        let msg = ClusterMessage::VdiOp(VdiOpMessage {
            origin: nid,
            seq: 9,
            op: VdiOp::Create {
                name: "test".into(),
                size: 4 << 20,
                base_vdi_id: 0,
                snap_id: 0,
                ctime: 1_700_000_000,
            },
        });
        let encoded = msg.encode().unwrap();
        match ClusterMessage::decode(&encoded).unwrap() {
            ClusterMessage::VdiOp(op) => {
                assert_eq!(op.origin, nid);
                assert_eq!(op.seq, 9);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
