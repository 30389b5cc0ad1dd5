//! Idle connection pool for peer traffic.
//!
//! The gateway dials the same small set of peers for every forwarded frame,
//! so connections are parked here between requests instead of being torn
//! down. The pool is bounded per peer and a reaper drops anything idle past
//! the timeout; a reaped peer entry is rebuilt lazily on next use.

use std::sync::Arc;
use std::time::{Duration, Instant};

use corelib::{NodeId, Result};
use dashmap::DashMap;
use tokio::net::TcpStream;

const MAX_IDLE_PER_PEER: usize = 8;

struct Idle {
    stream: TcpStream,
    since: Instant,
}

pub struct ConnectionPool {
    idle: DashMap<NodeId, Vec<Idle>>,
    idle_timeout: Duration,
}

impl ConnectionPool {
    pub fn new(idle_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            idle: DashMap::new(),
            idle_timeout,
        })
    }

    /// An idle connection to `peer`, or a freshly dialed one.
    pub async fn checkout(&self, peer: NodeId) -> Result<TcpStream> {
        if let Some(mut entry) = self.idle.get_mut(&peer) {
            if let Some(idle) = entry.pop() {
                return Ok(idle.stream);
            }
        }
        let stream = TcpStream::connect(peer.socket_addr()).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    /// Park a healthy connection for reuse. Full entries drop the stream.
    pub fn checkin(&self, peer: NodeId, stream: TcpStream) {
        let mut entry = self.idle.entry(peer).or_default();
        if entry.len() < MAX_IDLE_PER_PEER {
            entry.push(Idle {
                stream,
                since: Instant::now(),
            });
        }
    }

    /// Drop every parked connection for `peer` (it left the cluster or
    /// answered garbage).
    pub fn invalidate(&self, peer: NodeId) {
        self.idle.remove(&peer);
    }

    fn reap(&self) {
        let timeout = self.idle_timeout;
        self.idle.retain(|_, conns| {
            conns.retain(|idle| idle.since.elapsed() < timeout);
            !conns.is_empty()
        });
    }

    /// Periodically drop connections idle past the timeout.
    pub fn spawn_reaper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(pool.idle_timeout);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                pool.reap();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_checkout_checkin_reuses() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let peer = NodeId::new(IpAddr::from([127, 0, 0, 1]), addr.port());
        let pool = ConnectionPool::new(Duration::from_secs(15));
        let conn = pool.checkout(peer).await.unwrap();
        pool.checkin(peer, conn);
        assert_eq!(pool.idle.get(&peer).unwrap().len(), 1);
        let _conn = pool.checkout(peer).await.unwrap();
        assert!(pool.idle.get(&peer).map_or(true, |e| e.is_empty()));
    }

    #[tokio::test]
    async fn test_reap_drops_stale() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let peer = NodeId::new(IpAddr::from([127, 0, 0, 1]), addr.port());
        let pool = ConnectionPool::new(Duration::from_millis(1));
        let conn = pool.checkout(peer).await.unwrap();
        pool.checkin(peer, conn);
        tokio::time::sleep(Duration::from_millis(10)).await;
        pool.reap();
        assert!(pool.idle.get(&peer).is_none());
    }
}
