//! Virtual node expansion.
//!
//! Each physical node claims `nr_vnodes` positions on the ring so that load
//! and rebalancing spread across the id space. A position is the running
//! FNV-1a hash of the node's port followed by its address bytes folded from
//! the last byte to the first; the hash value chains from one slot to the
//! next, which is what makes the slots of a single node distinct.
//!
//! The expansion is a pure function of the sorted member list, so every node
//! at the same epoch computes an identical ring without coordination.

use crate::hash::{fnv_64a, FNV1A_64_INIT};
use crate::node::{Node, NodeId};

/// One ring position owned by a physical node.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct VirtualNode {
    /// Position on the ring.
    pub id: u64,
    /// Index of the owner in the canonical (sorted) member slice.
    pub node_idx: u16,
    /// Failure domain of the owner, copied here so the replica walk can
    /// skip same-zone candidates without a node lookup.
    pub zone: u32,
    /// Identity of the owner.
    pub nid: NodeId,
}

/// Expand `nodes` into their virtual nodes, sorted by ring position.
///
/// Ties on the position are broken by owner identity so that the resulting
/// order is total and deterministic.
pub fn expand(nodes: &[Node]) -> Vec<VirtualNode> {
    let mut vnodes = Vec::with_capacity(nodes.iter().map(|n| n.nr_vnodes as usize).sum());
    for (idx, n) in nodes.iter().enumerate() {
        let mut hval = FNV1A_64_INIT;
        for _ in 0..n.nr_vnodes {
            hval = fnv_64a(&n.nid.port.to_le_bytes(), hval);
            for j in (0..n.nid.addr.len()).rev() {
                hval = fnv_64a(&n.nid.addr[j..j + 1], hval);
            }
            vnodes.push(VirtualNode {
                id: hval,
                node_idx: idx as u16,
                zone: n.zone,
                nid: n.nid,
            });
        }
    }
    vnodes.sort_by(|a, b| a.id.cmp(&b.id).then_with(|| a.nid.cmp(&b.nid)));
    vnodes
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn node(ip: &str, port: u16, zone: u32, nr_vnodes: u16) -> Node {
        Node::new(NodeId::new(ip.parse::<IpAddr>().unwrap(), port), zone, nr_vnodes)
    }

    #[test]
    fn test_expand_counts_and_distinct_positions() {
        let nodes = [node("10.0.0.1", 7000, 1, 64), node("10.0.0.2", 7000, 2, 64)];
        let vnodes = expand(&nodes);
        assert_eq!(vnodes.len(), 128);

        let mut ids: Vec<u64> = vnodes.iter().map(|v| v.id).collect();
        ids.dedup();
        assert_eq!(ids.len(), 128, "positions should be distinct");
    }

    #[test]
    fn test_expand_sorted() {
        let nodes = [node("10.0.0.1", 7000, 1, 32), node("10.0.0.2", 7000, 2, 32)];
        let vnodes = expand(&nodes);
        assert!(vnodes.windows(2).all(|w| w[0].id <= w[1].id));
    }

    #[test]
    fn test_gateway_only_node_claims_nothing() {
        let nodes = [node("10.0.0.1", 7000, 1, 64), node("10.0.0.2", 7000, 2, 0)];
        let vnodes = expand(&nodes);
        assert!(vnodes.iter().all(|v| v.nid == nodes[0].nid));
    }

    #[test]
    fn test_expand_is_deterministic() {
        let nodes = [
            node("10.0.0.1", 7000, 1, 16),
            node("10.0.0.2", 7000, 2, 16),
            node("10.0.0.3", 7000, 3, 16),
        ];
        assert_eq!(expand(&nodes), expand(&nodes));
    }
}
