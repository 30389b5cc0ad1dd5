//! Node descriptors for the cluster.
//!
//! Nodes are identified by their advertised `(address, port)` pair. The
//! identifier doubles as the ranking key: the lowest-ranked live member is
//! the master that arbitrates vdi id allocation and join acceptance.

use std::fmt;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Compact identity of a node.
///
/// Addresses are stored as 16 bytes with IPv4 mapped into IPv6 space, so the
/// derived ordering (address bytes, then port) is total and identical on
/// every member.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct NodeId {
    pub addr: [u8; 16],
    pub port: u16,
}

impl NodeId {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        let addr = match ip {
            IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
            IpAddr::V6(v6) => v6.octets(),
        };
        Self { addr, port }
    }

    /// The address to dial for peer traffic.
    pub fn socket_addr(&self) -> SocketAddr {
        let v6 = Ipv6Addr::from(self.addr);
        match v6.to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), self.port),
            None => SocketAddr::new(IpAddr::V6(v6), self.port),
        }
    }
}

impl From<SocketAddr> for NodeId {
    fn from(sa: SocketAddr) -> Self {
        Self::new(sa.ip(), sa.port())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let v6 = Ipv6Addr::from(self.addr);
        match v6.to_ipv4_mapped() {
            Some(v4) => write!(f, "{}:{}", v4, self.port),
            None => write!(f, "[{}]:{}", v6, self.port),
        }
    }
}

/// A member of the cluster as recorded in membership snapshots.
///
/// `nr_vnodes == 0` marks a gateway-only node: it participates in membership
/// and serves client requests but claims no ring positions and stores no
/// objects. Nodes sharing a non-zero `zone` are never picked as two replicas
/// of the same object.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Node {
    pub nid: NodeId,
    pub zone: u32,
    pub nr_vnodes: u16,
}

/// Size of one packed node record in an epoch file.
pub const NODE_RECORD_SIZE: usize = 32;

impl Node {
    pub fn new(nid: NodeId, zone: u32, nr_vnodes: u16) -> Self {
        Self { nid, zone, nr_vnodes }
    }

    /// Append the packed on-disk representation to `buf`.
    ///
    /// Layout, little-endian: `addr[16] | port u16 | nr_vnodes u16 |
    /// zone u32 | reserved [u8; 8]`.
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.nid.addr);
        buf.put_u16_le(self.nid.port);
        buf.put_u16_le(self.nr_vnodes);
        buf.put_u32_le(self.zone);
        buf.put_bytes(0, 8);
    }

    /// Decode one packed record; fails when fewer than
    /// [`NODE_RECORD_SIZE`] bytes remain.
    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < NODE_RECORD_SIZE {
            return Err(Error::InvalidParms("short node record".into()));
        }
        let mut addr = [0u8; 16];
        buf.copy_to_slice(&mut addr);
        let port = buf.get_u16_le();
        let nr_vnodes = buf.get_u16_le();
        let zone = buf.get_u32_le();
        buf.advance(8);
        Ok(Self { nid: NodeId { addr, port }, zone, nr_vnodes })
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} zone={} vnodes={}", self.nid, self.zone, self.nr_vnodes)
    }
}
