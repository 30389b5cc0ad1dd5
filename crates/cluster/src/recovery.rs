//! Epoch-transition recovery.
//!
//! Rebuilds the on-disk layout to match the current ring after a membership
//! change. The worklist is the union of this node's objects and whatever
//! the previous layout's owners report; each object is then pulled, pushed,
//! or displaced according to the ring diff. Every step is idempotent (file
//! presence is the truth), so a crashed or repeated pass converges to the
//! same layout.

use std::collections::BTreeSet;
use std::sync::Arc;

use bytes::Buf;
use corelib::{Error, NodeId, OldRing, Result, SharedView, WorkQueues, DATA_OBJ_SIZE};
use store::ObjectStore;
use tokio::task::JoinSet;
use transport::proto::{flag, op, SdReq};
use transport::PeerClient;

/// In-flight object transfers at any moment.
const RECOVERY_CONCURRENCY: usize = 2;

#[derive(Clone)]
pub struct RecoveryCtx {
    pub me: NodeId,
    pub view: SharedView,
    pub store: Arc<ObjectStore>,
    pub queues: Arc<WorkQueues>,
    pub client: PeerClient,
}

/// Run one full recovery pass toward the current epoch. Per-object
/// failures are logged and skipped; the next epoch change (or a restart)
/// retries them.
pub async fn run(ctx: RecoveryCtx) -> Result<()> {
    let view = ctx.view.get();
    let Some(old) = view.prev.clone() else {
        return Ok(());
    };
    let epoch = view.epoch;
    tracing::info!(epoch, old_epoch = old.epoch, "recovery started");

    let oids = build_worklist(&ctx, epoch, &old).await?;
    let total = oids.len();

    let mut set: JoinSet<(u64, Result<()>)> = JoinSet::new();
    let mut iter = oids.into_iter();
    let mut failed = 0usize;
    loop {
        while set.len() < RECOVERY_CONCURRENCY {
            let Some(oid) = iter.next() else { break };
            let ctx = ctx.clone();
            let old = old.clone();
            set.spawn(async move {
                let result = recover_object(&ctx, oid, &old).await;
                (oid, result)
            });
        }
        match set.join_next().await {
            Some(Ok((oid, Err(e)))) => {
                failed += 1;
                tracing::warn!(oid = format_args!("{oid:016x}"), error = %e, "object recovery failed");
            }
            Some(Ok((_, Ok(())))) => {}
            Some(Err(e)) => {
                failed += 1;
                tracing::warn!(error = %e, "recovery task aborted");
            }
            None => break,
        }
    }

    let store = Arc::clone(&ctx.store);
    let old_epoch = old.epoch;
    let swept = ctx.queues.recovery.run(move || store.sweep_stale(old_epoch)).await??;
    tracing::info!(epoch, total, failed, swept, "recovery finished");
    Ok(())
}

/// Union of local oids and the old owners' object lists.
async fn build_worklist(ctx: &RecoveryCtx, epoch: u32, old: &OldRing) -> Result<BTreeSet<u64>> {
    let store = Arc::clone(&ctx.store);
    let mut oids: BTreeSet<u64> = ctx
        .queues
        .recovery
        .run(move || store.list())
        .await??
        .into_iter()
        .collect();

    for peer in old
        .ring
        .nodes()
        .iter()
        .map(|n| n.nid)
        .filter(|nid| *nid != ctx.me)
    {
        let mut req = SdReq::new(op::GET_OBJ_LIST);
        req.flags = flag::IO_LOCAL | flag::RECOVERY;
        req.epoch = epoch;
        req.obj_mut().tgt_epoch = old.epoch;
        match ctx.client.call_ok(peer, &req, &[]).await {
            Ok(mut body) => {
                while body.remaining() >= 8 {
                    oids.insert(body.get_u64_le());
                }
            }
            Err(e) => {
                tracing::warn!(%peer, error = %e, "object list fetch failed");
            }
        }
    }
    Ok(oids)
}

async fn recover_object(ctx: &RecoveryCtx, oid: u64, old: &OldRing) -> Result<()> {
    let view = ctx.view.get();
    let copies = view.copies.max(1);
    let owners = view.ring.owners_at_most(oid, copies);
    let is_owner = owners.contains(&ctx.me);

    let store = Arc::clone(&ctx.store);
    let have = ctx.queues.recovery.run(move || store.exists(oid)).await?;

    if is_owner && !have {
        pull(ctx, oid, old, view.epoch).await
    } else if !is_owner && have {
        push(ctx, oid, &owners, old, view.epoch).await
    } else {
        Ok(())
    }
}

/// Fetch `oid` from any owner of the previous layout. The source answers
/// for the old epoch, serving its displaced copy if it already moved on.
async fn pull(ctx: &RecoveryCtx, oid: u64, old: &OldRing, epoch: u32) -> Result<()> {
    let mut req = SdReq::new(op::READ_OBJ);
    req.flags = flag::IO_LOCAL | flag::RECOVERY;
    req.epoch = epoch;
    req.data_length = DATA_OBJ_SIZE as u32;
    {
        let hdr = req.obj_mut();
        hdr.oid = oid;
        hdr.tgt_epoch = old.epoch;
    }

    let mut last_err = Error::NoObject;
    for src in old
        .ring
        .owners_at_most(oid, ctx.view.get().copies.max(1))
        .into_iter()
        .filter(|nid| *nid != ctx.me)
    {
        match ctx.client.call_ok(src, &req, &[]).await {
            Ok(body) => {
                let store = Arc::clone(&ctx.store);
                return match ctx
                    .queues
                    .recovery
                    .run(move || store.write(oid, 0, &body, true))
                    .await?
                {
                    // A client write landed first; the newer copy wins.
                    Err(Error::ObjectExists) | Ok(()) => Ok(()),
                    Err(e) => Err(e),
                };
            }
            Err(e) => last_err = e,
        }
    }
    Err(last_err)
}

/// Hand `oid` to every owner of the new layout, then displace the local
/// copy. The copy is kept when any hand-off fails, so a later pass can
/// retry.
async fn push(ctx: &RecoveryCtx, oid: u64, owners: &[NodeId], old: &OldRing, epoch: u32) -> Result<()> {
    let store = Arc::clone(&ctx.store);
    let body = ctx
        .queues
        .recovery
        .run(move || store.read(oid, 0, DATA_OBJ_SIZE as u32))
        .await??;

    let mut req = SdReq::new(op::CREATE_AND_WRITE_OBJ);
    req.flags = flag::WRITE | flag::IO_LOCAL;
    req.epoch = epoch;
    req.data_length = body.len() as u32;
    req.obj_mut().oid = oid;

    for target in owners {
        match ctx.client.call_ok(*target, &req, &body).await {
            Ok(_) => {}
            // The target already holds a copy, which is what we want.
            Err(Error::InvalidParms(_)) | Err(Error::ObjectExists) => {}
            Err(e) => return Err(e),
        }
    }

    let store = Arc::clone(&ctx.store);
    let old_epoch = old.epoch;
    ctx.queues
        .recovery
        .run(move || store.mark_stale(oid, old_epoch))
        .await??;
    Ok(())
}
