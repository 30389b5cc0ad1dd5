//! The consistent-hash ring and replica placement.
//!
//! # Placement
//!
//! An object id hashes to a position; its primary owner is the virtual node
//! with the smallest position at or after it (wrapping to the ring head).
//! Further replicas come from walking clockwise, skipping candidates whose
//! owner is already selected or shares a non-zero zone with a selection.
//!
//! # Determinism
//!
//! `build` canonicalizes the member list by `(address, port)` before vnode
//! expansion, so two nodes holding the same membership always agree on
//! `owners` for every object id. This property is what lets any node act as
//! a gateway without a metadata lookup.

use crate::error::{Error, Result};
use crate::hash::oid_hash;
use crate::node::{Node, NodeId};
use crate::vnode::{self, VirtualNode};

/// Immutable ring over one membership snapshot.
#[derive(Clone, Debug, Default)]
pub struct Ring {
    nodes: Vec<Node>,
    vnodes: Vec<VirtualNode>,
}

impl Ring {
    /// Build a ring from a membership snapshot.
    ///
    /// The input does not need to be sorted or deduplicated; the ring keeps
    /// its own canonical copy.
    pub fn build(nodes: &[Node]) -> Self {
        let mut nodes = nodes.to_vec();
        nodes.sort_by(|a, b| a.nid.cmp(&b.nid));
        nodes.dedup_by_key(|n| n.nid);
        let vnodes = vnode::expand(&nodes);
        Self { nodes, vnodes }
    }

    /// Canonical (sorted) member list of this ring.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// All virtual nodes, sorted by ring position.
    pub fn vnodes(&self) -> &[VirtualNode] {
        &self.vnodes
    }

    pub fn is_member(&self, nid: NodeId) -> bool {
        self.nodes.iter().any(|n| n.nid == nid)
    }

    /// Number of distinct failure domains among storage nodes. Nodes with
    /// zone 0 each count as their own domain.
    pub fn zone_count(&self) -> usize {
        let mut zones: Vec<u32> = Vec::new();
        let mut unzoned = 0usize;
        for n in self.nodes.iter().filter(|n| n.nr_vnodes > 0) {
            if n.zone == 0 {
                unzoned += 1;
            } else if !zones.contains(&n.zone) {
                zones.push(n.zone);
            }
        }
        zones.len() + unzoned
    }

    /// Index of the vnode owning position `hash` (smallest id >= hash,
    /// wrapping to the head).
    fn position(&self, hash: u64) -> usize {
        let i = self.vnodes.partition_point(|v| v.id < hash);
        if i == self.vnodes.len() {
            0
        } else {
            i
        }
    }

    /// The `copies` distinct nodes responsible for `oid`, primary first.
    ///
    /// Fails with [`Error::InsufficientZones`] when the walk wraps around
    /// without collecting `copies` zone-diverse owners; the caller decides
    /// between halting and serving degraded.
    pub fn owners(&self, oid: u64, copies: usize) -> Result<Vec<NodeId>> {
        if copies == 0 {
            return Ok(Vec::new());
        }
        if self.vnodes.is_empty() {
            return Err(Error::InsufficientZones { copies, zones: 0 });
        }

        let start = self.position(oid_hash(oid));
        let mut picked: Vec<&VirtualNode> = Vec::with_capacity(copies);
        let mut idx = start;
        loop {
            let cand = &self.vnodes[idx];
            let skip = picked
                .iter()
                .any(|p| p.nid == cand.nid || (cand.zone != 0 && p.zone == cand.zone));
            if !skip {
                picked.push(cand);
                if picked.len() == copies {
                    return Ok(picked.into_iter().map(|v| v.nid).collect());
                }
            }
            idx = (idx + 1) % self.vnodes.len();
            if idx == start {
                return Err(Error::InsufficientZones {
                    copies,
                    zones: self.zone_count(),
                });
            }
        }
    }

    /// Like [`owners`](Self::owners) but tolerating an under-filled set:
    /// returns as many zone-diverse owners as the ring can provide.
    pub fn owners_at_most(&self, oid: u64, copies: usize) -> Vec<NodeId> {
        match self.owners(oid, copies) {
            Ok(v) => v,
            Err(_) => {
                let mut n = copies.saturating_sub(1);
                while n > 0 {
                    if let Ok(v) = self.owners(oid, n) {
                        return v;
                    }
                    n -= 1;
                }
                Vec::new()
            }
        }
    }
}
