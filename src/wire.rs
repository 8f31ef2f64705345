//! Wire protocol for BitGrid, spoken by clients and peers alike.
//!
//! Every message is a MessagePack payload framed by a 4-byte big-endian
//! length:
//!
//! ```text
//! Request:  [4-byte length BE] [MessagePack payload]
//! Response: [4-byte length BE] [MessagePack payload]
//! ```
//!
//! The same request surface serves two callers: clients (`Write`,
//! `Read`, `Status`) and anti-entropy peers (`Digest`, `Block`). A
//! transport is anything that can deliver one request and return one
//! response; routing a write to the owning node across the wire is a
//! forwarding layer's job, not the protocol's.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::bitmap::BlockDigest;
use crate::error::{GridError, Result};
use crate::stats::StatsSnapshot;

/// Upper bound on a single frame. A full block record is well under
/// 10 KiB; anything near this limit is a broken or hostile peer.
pub const MAX_FRAME: usize = 16 * 1024 * 1024;

/// Client write kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WriteOp {
    Set,
    Clear,
}

/// Request from a client or a reconciling peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "camelCase")]
pub enum Request {
    /// Set or clear one bit.
    Write {
        index: String,
        frame: String,
        row: u64,
        col: u64,
        op: WriteOp,
    },

    /// Read one row of a frame (union across local slices).
    Read {
        index: String,
        frame: String,
        row: u64,
    },

    /// Anti-entropy: fetch a fragment's digest sequence.
    Digest {
        index: String,
        frame: String,
        slice: u64,
    },

    /// Anti-entropy: fetch one encoded block.
    Block {
        index: String,
        frame: String,
        slice: u64,
        row: u64,
        block: u32,
    },

    /// Server counters and timers.
    Status,

    /// Liveness probe.
    Ping,
}

/// Response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum Response {
    /// Write acknowledged; `changed` is false when the bit already had
    /// the requested state.
    Written { changed: bool },

    /// Row contents as a sorted column list.
    Row { cols: Vec<u64> },

    /// Digest sequence, ordered by (row, block). Empty for a fragment
    /// the node does not hold.
    Digest { digest: Vec<BlockDigest> },

    /// Encoded block payload; None when the block is absent (empty).
    Block { payload: Option<Vec<u8>> },

    /// Node identity plus a stats snapshot.
    Status {
        node: String,
        stats: StatsSnapshot,
    },

    Pong,

    /// Failure: stable machine code plus a human message.
    Error { code: String, message: String },
}

impl Response {
    /// Build the error envelope for a `GridError`.
    pub fn from_error(err: &GridError) -> Self {
        Response::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

// ── Framing ────────────────────────────────────────────────────────

/// Read one length-prefixed frame. Returns None on clean EOF (peer
/// closed between frames).
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME {
        return Err(GridError::Protocol(format!(
            "frame of {len} bytes exceeds limit"
        )));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

/// Write one length-prefixed frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Encode a message to its MessagePack payload.
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    Ok(rmp_serde::to_vec_named(msg)?)
}

/// Decode a MessagePack payload.
pub fn decode<'a, T: Deserialize<'a>>(payload: &'a [u8]) -> Result<T> {
    Ok(rmp_serde::from_slice(payload)?)
}
