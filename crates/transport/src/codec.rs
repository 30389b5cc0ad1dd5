//! Framed header + body I/O over a byte stream.
//!
//! A request frame carries a body only when its `WRITE` flag is set; for
//! reads, `data_length` names the length the caller wants back and nothing
//! follows the header. Response frames always carry `data_length` bytes.

use bytes::{Bytes, BytesMut};
use corelib::{Error, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::proto::{flag, SdReq, SdRsp, HEADER_SIZE};

/// Fill `buf` completely, or report a clean end-of-stream when the peer
/// closed at a frame boundary.
async fn read_frame_header<S>(stream: &mut S, buf: &mut [u8; HEADER_SIZE]) -> Result<bool>
where
    S: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = stream.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(Error::System("connection closed mid-header".into()));
        }
        filled += n;
    }
    Ok(true)
}

/// Read one request frame. `None` when the peer closed the connection
/// between frames.
pub async fn read_req<S>(stream: &mut S) -> Result<Option<(SdReq, Bytes)>>
where
    S: AsyncRead + Unpin,
{
    let mut raw = [0u8; HEADER_SIZE];
    if !read_frame_header(stream, &mut raw).await? {
        return Ok(None);
    }
    let req = SdReq::decode(&raw)?;
    let body_len = if req.flags & flag::WRITE != 0 {
        req.data_length
    } else {
        0
    };
    let data = read_body(stream, body_len).await?;
    Ok(Some((req, data)))
}

/// Read one response frame.
pub async fn read_rsp<S>(stream: &mut S) -> Result<(SdRsp, Bytes)>
where
    S: AsyncRead + Unpin,
{
    let mut raw = [0u8; HEADER_SIZE];
    if !read_frame_header(stream, &mut raw).await? {
        return Err(Error::System("connection closed awaiting response".into()));
    }
    let rsp = SdRsp::decode(&raw)?;
    let data = read_body(stream, rsp.data_length).await?;
    Ok((rsp, data))
}

async fn read_body<S>(stream: &mut S, len: u32) -> Result<Bytes>
where
    S: AsyncRead + Unpin,
{
    let mut body = BytesMut::zeroed(len as usize);
    if len > 0 {
        stream.read_exact(&mut body).await?;
    }
    Ok(body.freeze())
}

/// Write one request frame; `data` must be empty unless the `WRITE` flag
/// is set.
pub async fn write_req<S>(stream: &mut S, req: &SdReq, data: &[u8]) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    debug_assert!(req.flags & flag::WRITE != 0 || data.is_empty());
    let mut buf = BytesMut::with_capacity(HEADER_SIZE);
    req.encode(&mut buf);
    stream.write_all(&buf).await?;
    if !data.is_empty() {
        stream.write_all(data).await?;
    }
    stream.flush().await?;
    Ok(())
}

/// Write one response frame. `rsp.data_length` must equal `data.len()`.
pub async fn write_rsp<S>(stream: &mut S, rsp: &SdRsp, data: &[u8]) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    debug_assert_eq!(rsp.data_length as usize, data.len());
    let mut buf = BytesMut::with_capacity(HEADER_SIZE);
    rsp.encode(&mut buf);
    stream.write_all(&buf).await?;
    if !data.is_empty() {
        stream.write_all(data).await?;
    }
    stream.flush().await?;
    Ok(())
}
