//! Wire protocol and peer transport.
//!
//! This crate owns everything that crosses a socket:
//! - The fixed 48-byte frame headers and their result codes
//! - Async frame read/write
//! - The pooled peer client used by gateway fan-out and recovery

pub mod client;
pub mod codec;
pub mod pool;
pub mod proto;

pub use client::{request_on, PeerClient};
pub use pool::ConnectionPool;
pub use proto::{ClusterReq, ObjReq, ReqBody, RspBody, SdReq, SdRsp, VdiReq};
