//! In-process group-communication bus.
//!
//! A sequencer over per-subscriber channels: every broadcast happens inside
//! one critical section that pushes to all subscribers, which is what gives
//! the total order the state machine depends on. A standalone daemon gets a
//! private bus (a cluster of one); tests share a bus between several
//! in-process nodes.

use std::sync::Arc;

use async_trait::async_trait;
use corelib::{Node, NodeId, Result};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::driver::{ClusterDriver, DriverEvent};

#[derive(Default)]
struct BusInner {
    members: Vec<Node>,
    subs: Vec<mpsc::UnboundedSender<DriverEvent>>,
}

#[derive(Default)]
pub struct LocalBus {
    inner: Mutex<BusInner>,
}

impl LocalBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Bind a driver handle for one node.
    pub fn handle(self: Arc<Self>, node: Node) -> Arc<LocalDriver> {
        Arc::new(LocalDriver { bus: self, node })
    }

    fn broadcast_locked(inner: &mut BusInner, event: DriverEvent) {
        inner.subs.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn join(&self, node: Node, msg: Vec<u8>) {
        let mut inner = self.inner.lock();
        if !inner.members.iter().any(|m| m.nid == node.nid) {
            inner.members.push(node);
        }
        let members = inner.members.clone();
        Self::broadcast_locked(
            &mut inner,
            DriverEvent::ConfChange {
                joined: vec![node],
                left: Vec::new(),
                members: members.clone(),
            },
        );
        Self::broadcast_locked(
            &mut inner,
            DriverEvent::Message {
                from: node.nid,
                data: msg,
            },
        );
    }

    fn leave(&self, nid: NodeId) {
        let mut inner = self.inner.lock();
        let Some(pos) = inner.members.iter().position(|m| m.nid == nid) else {
            return;
        };
        let node = inner.members.remove(pos);
        let members = inner.members.clone();
        Self::broadcast_locked(
            &mut inner,
            DriverEvent::ConfChange {
                joined: Vec::new(),
                left: vec![node],
                members,
            },
        );
    }

    fn notify(&self, from: NodeId, data: Vec<u8>) {
        let mut inner = self.inner.lock();
        Self::broadcast_locked(&mut inner, DriverEvent::Message { from, data });
    }
}

pub struct LocalDriver {
    bus: Arc<LocalBus>,
    node: Node,
}

#[async_trait]
impl ClusterDriver for LocalDriver {
    fn subscribe(&self) -> mpsc::UnboundedReceiver<DriverEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.bus.inner.lock().subs.push(tx);
        rx
    }

    async fn join(&self, node: Node, msg: Vec<u8>) -> Result<()> {
        self.bus.join(node, msg);
        Ok(())
    }

    async fn leave(&self, node: NodeId) -> Result<()> {
        self.bus.leave(node);
        Ok(())
    }

    async fn notify(&self, msg: Vec<u8>) -> Result<()> {
        self.bus.notify(self.node.nid, msg);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn node(port: u16) -> Node {
        Node::new(NodeId::new("127.0.0.1".parse::<IpAddr>().unwrap(), port), 0, 4)
    }

    #[tokio::test]
    async fn test_join_delivers_confchange_then_message() {
        let bus = LocalBus::new();
        let a = bus.clone().handle(node(1));
        let mut rx = a.subscribe();

        a.join(node(1), b"hi".to_vec()).await.unwrap();
        match rx.recv().await.unwrap() {
            DriverEvent::ConfChange { joined, members, .. } => {
                assert_eq!(joined.len(), 1);
                assert_eq!(members.len(), 1);
            }
            other => panic!("expected ConfChange, got {other:?}"),
        }
        match rx.recv().await.unwrap() {
            DriverEvent::Message { data, .. } => assert_eq!(data, b"hi"),
            other => panic!("expected Message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_total_order_across_subscribers() {
        let bus = LocalBus::new();
        let a = bus.clone().handle(node(1));
        let b = bus.clone().handle(node(2));
        let mut rx_a = a.subscribe();
        let mut rx_b = b.subscribe();

        for i in 0..16u8 {
            let from = if i % 2 == 0 { &a } else { &b };
            from.notify(vec![i]).await.unwrap();
        }
        for i in 0..16u8 {
            for rx in [&mut rx_a, &mut rx_b] {
                match rx.recv().await.unwrap() {
                    DriverEvent::Message { data, .. } => assert_eq!(data, vec![i]),
                    other => panic!("unexpected {other:?}"),
                }
            }
        }
    }

    #[tokio::test]
    async fn test_leave_delivers_confchange() {
        let bus = LocalBus::new();
        let a = bus.clone().handle(node(1));
        let mut rx = a.subscribe();
        a.join(node(1), Vec::new()).await.unwrap();
        a.join(node(2), Vec::new()).await.unwrap();
        a.leave(node(2).nid).await.unwrap();

        let mut left_seen = false;
        while let Ok(ev) = rx.try_recv() {
            if let DriverEvent::ConfChange { left, members, .. } = ev {
                if !left.is_empty() {
                    assert_eq!(left[0].nid, node(2).nid);
                    assert_eq!(members.len(), 1);
                    left_seen = true;
                }
            }
        }
        assert!(left_seen);
    }
}
