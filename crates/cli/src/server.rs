//! The TCP server: connection handling and request dispatch.
//!
//! Per connection, a reader task decodes frames and dispatches each request
//! as its own task; completions flow through a bounded channel to a writer
//! task, so responses can return out of order and a slow client
//! back-pressures its own reads. Closing the connection orphans whatever is
//! in flight; the work still runs, the responses are dropped with the
//! channel.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use bytes::{Bytes, BytesMut};
use cluster::{ClusterHandle, VdiRegistry};
use corelib::{EpochLog, Error, Node, Result, SharedView, Status};
use parking_lot::RwLock;
use replication::{Gateway, LocalOps};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use transport::proto::{flag, op, RspBody, SdReq, SdRsp};
use transport::{codec, PeerClient};

/// Requests in flight per connection before reads pause.
const MAX_OUTSTANDING_PER_CONN: usize = 64;

/// One row of a `READ_VDIS` response body (bincode-encoded list).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VdiEntry {
    pub name: String,
    pub vdi_id: u32,
    pub snap_id: u32,
    pub size: u64,
}

#[derive(Clone)]
pub struct ServerCtx {
    pub node: Node,
    pub view: SharedView,
    pub registry: Arc<RwLock<VdiRegistry>>,
    pub epoch_log: Arc<EpochLog>,
    pub local: LocalOps,
    pub gateway: Gateway,
    pub cluster: ClusterHandle,
    pub client: PeerClient,
    pub outstanding: Arc<AtomicUsize>,
}

pub async fn serve(listener: TcpListener, ctx: ServerCtx) {
    // Connections live as children of the accept loop, so tearing the
    // listener down severs them too.
    let mut conns = tokio::task::JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    tracing::debug!(%peer, "connection accepted");
                    conns.spawn(handle_conn(stream, ctx.clone()));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            },
            Some(_) = conns.join_next() => {}
        }
    }
}

async fn handle_conn(stream: TcpStream, ctx: ServerCtx) {
    let (mut rd, mut wr) = stream.into_split();
    let (done_tx, mut done_rx) = mpsc::channel::<(SdRsp, Bytes)>(MAX_OUTSTANDING_PER_CONN);

    let writer = tokio::spawn(async move {
        while let Some((rsp, body)) = done_rx.recv().await {
            if let Err(e) = codec::write_rsp(&mut wr, &rsp, &body).await {
                tracing::debug!(error = %e, "response write failed");
                break;
            }
        }
    });

    loop {
        match codec::read_req(&mut rd).await {
            Ok(Some((req, data))) => {
                // Reserve the completion slot first: a full channel parks
                // the reader until the writer drains.
                let Ok(permit) = done_tx.clone().reserve_owned().await else {
                    break;
                };
                let ctx = ctx.clone();
                ctx.outstanding.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let (rsp, body) = process(&ctx, req, data).await;
                    permit.send((rsp, body));
                    ctx.outstanding.fetch_sub(1, Ordering::SeqCst);
                });
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(error = %e, "request read failed");
                break;
            }
        }
    }
    drop(done_tx);
    let _ = writer.await;
}

async fn process(ctx: &ServerCtx, req: SdReq, data: Bytes) -> (SdRsp, Bytes) {
    let mut rsp = SdRsp::for_req(&req);
    let body = match execute(ctx, &req, data, &mut rsp).await {
        Ok(body) => body,
        Err(e) => {
            rsp.result = transport::proto::error_to_code(&e);
            Bytes::new()
        }
    };
    rsp.epoch = ctx.view.get().epoch;
    rsp.data_length = body.len() as u32;
    (rsp, body)
}

/// Which requests a node honors in each lifecycle state.
fn gate(status: Status, req: &SdReq) -> Result<()> {
    use transport::proto::op::*;
    if req.flags & flag::IO_LOCAL != 0 {
        // Forwarded replica traffic is epoch-gated instead; recovery and
        // degraded reads depend on it flowing even while halted.
        return match status {
            Status::ShuttingDown | Status::Killed => Err(Error::Shutdown),
            _ => Ok(()),
        };
    }
    match status {
        Status::Serving => Ok(()),
        Status::WaitForFormat => match req.opcode {
            MAKE_FS | STAT_CLUSTER | GET_EPOCH => Ok(()),
            _ => Err(Error::WaitForFormat),
        },
        Status::WaitForJoin | Status::Joining => match req.opcode {
            STAT_CLUSTER | GET_EPOCH => Ok(()),
            _ => Err(Error::WaitForJoin),
        },
        Status::Halted => match req.opcode {
            READ_OBJ | GET_VDI_INFO | READ_VDIS | STAT_CLUSTER | GET_EPOCH | SHUTDOWN => Ok(()),
            _ => Err(Error::Halt),
        },
        Status::ShuttingDown | Status::Killed => match req.opcode {
            STAT_CLUSTER => Ok(()),
            _ => Err(Error::Shutdown),
        },
    }
}

async fn execute(ctx: &ServerCtx, req: &SdReq, data: Bytes, rsp: &mut SdRsp) -> Result<Bytes> {
    let view = ctx.view.get();
    gate(view.status, req)?;

    if req.flags & flag::IO_LOCAL != 0 {
        return ctx.local.exec(req, data).await;
    }

    match req.opcode {
        op::READ_OBJ => {
            let hdr = req.obj()?;
            ctx.gateway.read_obj(hdr.oid, hdr.offset, req.data_length).await
        }
        op::WRITE_OBJ => {
            let hdr = req.obj()?;
            ctx.gateway.write_obj(hdr.oid, hdr.offset, data, false, 0).await?;
            Ok(Bytes::new())
        }
        op::CREATE_AND_WRITE_OBJ => {
            let hdr = req.obj()?;
            ctx.gateway
                .write_obj(hdr.oid, hdr.offset, data, true, hdr.cow_oid)
                .await?;
            Ok(Bytes::new())
        }
        op::REMOVE_OBJ => {
            let hdr = req.obj()?;
            ctx.gateway.remove_obj(hdr.oid).await?;
            Ok(Bytes::new())
        }
        op::NEW_VDI => new_vdi(ctx, req, data, rsp).await,
        op::DEL_VDI => {
            let name = utf8_name(&data)?;
            ctx.cluster.del_vdi(name).await?;
            Ok(Bytes::new())
        }
        op::GET_VDI_INFO => {
            let name = utf8_name(&data)?;
            let registry = ctx.registry.read();
            let state = registry.get(&name).ok_or(Error::NoVdi)?;
            rsp.body = RspBody::Vdi {
                vdi_id: state.vdi_id,
                copies: state.copies,
            };
            Ok(Bytes::new())
        }
        op::LOCK_VDI => {
            let name = utf8_name(&data)?;
            ctx.cluster.lock_vdi(name, ctx.node.nid).await?;
            Ok(Bytes::new())
        }
        op::RELEASE_VDI => {
            let name = utf8_name(&data)?;
            ctx.cluster.release_vdi(name, ctx.node.nid).await?;
            Ok(Bytes::new())
        }
        op::READ_VDIS => {
            let entries: Vec<VdiEntry> = {
                let registry = ctx.registry.read();
                registry
                    .iter()
                    .map(|(name, state)| VdiEntry {
                        name: name.clone(),
                        vdi_id: state.vdi_id,
                        snap_id: state.snap_id,
                        size: state.size,
                    })
                    .collect()
            };
            let body = bincode::serialize(&entries).map_err(|e| Error::System(e.to_string()))?;
            Ok(Bytes::from(body))
        }
        op::STAT_CLUSTER => {
            rsp.body = RspBody::Cluster {
                ctime: view.ctime,
                epoch: view.epoch,
                nr_nodes: view.ring.nodes().len() as u32,
                status: view.status.to_wire(),
            };
            let mut body = BytesMut::new();
            for node in view.ring.nodes() {
                node.encode(&mut body);
            }
            Ok(body.freeze())
        }
        op::MAKE_FS => {
            let hdr = req.cluster()?;
            ctx.cluster.format(hdr.ctime, hdr.copies).await?;
            Ok(Bytes::new())
        }
        op::SHUTDOWN => {
            ctx.cluster.shutdown().await?;
            Ok(Bytes::new())
        }
        op::GET_EPOCH => {
            let hdr = req.cluster()?;
            let nodes = ctx.epoch_log.read(hdr.epoch)?;
            rsp.body = RspBody::Cluster {
                ctime: view.ctime,
                epoch: hdr.epoch,
                nr_nodes: nodes.len() as u32,
                status: view.status.to_wire(),
            };
            let mut body = BytesMut::new();
            for node in &nodes {
                node.encode(&mut body);
            }
            Ok(body.freeze())
        }
        other => Err(Error::InvalidParms(format!("unknown opcode {other:#04x}"))),
    }
}

/// Vdi creation is arbitrated by the master; any other entry node forwards
/// the frame there verbatim.
async fn new_vdi(ctx: &ServerCtx, req: &SdReq, data: Bytes, rsp: &mut SdRsp) -> Result<Bytes> {
    let view = ctx.view.get();
    let master = view.master().ok_or(Error::WaitForJoin)?;
    if master.nid != ctx.node.nid {
        let (fwd_rsp, fwd_body) = ctx.client.call(master.nid, req, &data).await?;
        fwd_rsp.ok()?;
        rsp.body = fwd_rsp.body;
        return Ok(fwd_body);
    }

    let hdr = req.vdi()?;
    let name = utf8_name(&data)?;
    let ctime = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let vdi_id = ctx
        .cluster
        .new_vdi(name, hdr.vdi_size, hdr.base_vdi_id, hdr.snap_id, ctime)
        .await?;
    rsp.body = RspBody::Vdi {
        vdi_id,
        copies: view.copies as u32,
    };
    Ok(Bytes::new())
}

fn utf8_name(data: &[u8]) -> Result<String> {
    let end = data.iter().position(|b| *b == 0).unwrap_or(data.len());
    String::from_utf8(data[..end].to_vec())
        .map_err(|_| Error::InvalidParms("vdi name is not valid utf-8".into()))
}
