//! Request/response calls to peer nodes.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use corelib::{Error, NodeId, Result};
use tokio::net::TcpStream;

use crate::codec;
use crate::pool::ConnectionPool;
use crate::proto::{SdReq, SdRsp};

/// Issue one request on an already-connected stream.
pub async fn request_on(
    stream: &mut TcpStream,
    req: &SdReq,
    data: &[u8],
) -> Result<(SdRsp, Bytes)> {
    codec::write_req(stream, req, data).await?;
    codec::read_rsp(stream).await
}

/// Pooled peer caller with a per-request read timeout.
///
/// A timed-out or failed connection is discarded rather than parked; the
/// caller treats the replica as failed for this request and the pool
/// redials on the next one.
#[derive(Clone)]
pub struct PeerClient {
    pool: Arc<ConnectionPool>,
    timeout: Duration,
}

impl PeerClient {
    pub fn new(pool: Arc<ConnectionPool>, timeout: Duration) -> Self {
        Self { pool, timeout }
    }

    pub async fn call(&self, peer: NodeId, req: &SdReq, data: &[u8]) -> Result<(SdRsp, Bytes)> {
        let mut stream = self.pool.checkout(peer).await?;
        match tokio::time::timeout(self.timeout, request_on(&mut stream, req, data)).await {
            Ok(Ok(out)) => {
                self.pool.checkin(peer, stream);
                Ok(out)
            }
            Ok(Err(e)) => {
                tracing::debug!(%peer, error = %e, "peer call failed");
                Err(e)
            }
            Err(_) => {
                tracing::debug!(%peer, "peer call timed out");
                Err(Error::Timeout)
            }
        }
    }

    /// Like [`call`](Self::call) but folding a non-success result code into
    /// the error, for callers that have no use for the response header.
    pub async fn call_ok(&self, peer: NodeId, req: &SdReq, data: &[u8]) -> Result<Bytes> {
        let (rsp, body) = self.call(peer, req, data).await?;
        rsp.ok()?;
        Ok(body)
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }
}
