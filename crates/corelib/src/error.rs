//! Error types shared across the workspace.
//!
//! Every variant maps to exactly one wire result code (the mapping lives in
//! the transport crate); request handlers set a variant instead of raising,
//! and the connection layer translates it when the response frame is built.

use thiserror::Error;

/// Result type alias used across the workspace.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no object found")]
    NoObject,
    #[error("object already exists")]
    ObjectExists,
    #[error("vdi exists already")]
    VdiExists,
    #[error("no vdi found")]
    NoVdi,
    #[error("vdi is already locked")]
    VdiLocked,
    #[error("maximum number of vdis reached")]
    FullVdi,
    #[error("system is still booting")]
    Startup,
    #[error("system is shutting down")]
    Shutdown,
    #[error("protocol version mismatch")]
    VerMismatch,
    #[error("no space for new objects")]
    NoSpace,
    #[error("waiting for cluster to be formatted")]
    WaitForFormat,
    #[error("waiting for other nodes to join")]
    WaitForJoin,
    #[error("node has failed to join the cluster")]
    JoinFailed,
    #[error("i/o has halted, too few living nodes")]
    Halt,
    #[error("remote node has an old epoch")]
    OldNodeVer,
    #[error("remote node has a new epoch")]
    NewNodeVer,
    #[error("cluster has not been formatted")]
    NotFormatted,
    #[error("creation times differ")]
    InvalidCtime,
    #[error("invalid epoch {0}")]
    InvalidEpoch(u32),
    #[error("cannot place {copies} copies across {zones} zones")]
    InsufficientZones { copies: usize, zones: usize },
    #[error("invalid request: {0}")]
    InvalidParms(String),
    #[error("request timed out")]
    Timeout,
    #[error("system error: {0}")]
    System(String),
    #[error("unknown result code {0}")]
    Unknown(u32),
}

impl Error {
    /// Whether a gateway should refresh its ring view and retry the request.
    pub fn is_epoch_mismatch(&self) -> bool {
        matches!(self, Error::OldNodeVer | Error::NewNodeVer)
    }
}
