//! Gossip frames: one JSON document per line, one request and one reply per
//! connection.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::auth::constant_time_eq;
use crate::error::SupError;
use crate::member::{Member, Rumor};
use crate::types::MemberId;

/// Upper bound on a single frame.
pub const MAX_FRAME_BYTES: u64 = 4 * 1024 * 1024;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GossipMessage {
    /// Direct probe. `from` is the sender's own record.
    Ping { from: Member, rumors: Vec<Rumor> },
    /// Reply to a ping, or a relay's report that the target answered.
    Ack { from: Member, rumors: Vec<Rumor> },
    /// Ask the receiver to probe `target` on the sender's behalf.
    PingReq { from: Member, target: Member },
    /// Relay could not reach the target.
    Nack { from: Member },
    /// Push-pull anti-entropy: the sender's full state.
    Sync { from: Member, rumors: Vec<Rumor> },
    SyncReply { rumors: Vec<Rumor> },
    /// Ask the ring to mark a member departed.
    Depart { member_id: MemberId },
}

impl GossipMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            GossipMessage::Ping { .. } => "ping",
            GossipMessage::Ack { .. } => "ack",
            GossipMessage::PingReq { .. } => "ping_req",
            GossipMessage::Nack { .. } => "nack",
            GossipMessage::Sync { .. } => "sync",
            GossipMessage::SyncReply { .. } => "sync_reply",
            GossipMessage::Depart { .. } => "depart",
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ring_key: Option<String>,
    pub message: GossipMessage,
}

impl Envelope {
    pub fn seal(ring_key: Option<&str>, message: GossipMessage) -> Self {
        Self {
            ring_key: ring_key.map(str::to_string),
            message,
        }
    }

    /// Unwrap the message if the envelope's key matches `expected`.
    pub fn open(self, expected: Option<&str>) -> Result<GossipMessage, SupError> {
        let matches = match (expected, self.ring_key.as_deref()) {
            (None, None) => true,
            (Some(want), Some(got)) => constant_time_eq(want.as_bytes(), got.as_bytes()),
            _ => false,
        };
        if matches {
            Ok(self.message)
        } else {
            Err(SupError::Codec("ring key mismatch".into()))
        }
    }
}

pub async fn write_frame<W>(writer: &mut W, envelope: &Envelope) -> Result<(), SupError>
where
    W: AsyncWrite + Unpin,
{
    let mut bytes = serde_json::to_vec(envelope).map_err(|e| SupError::Codec(e.to_string()))?;
    bytes.push(b'\n');
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R>(reader: R) -> Result<Envelope, SupError>
where
    R: AsyncRead + Unpin,
{
    let mut line = String::new();
    let mut limited = BufReader::new(reader.take(MAX_FRAME_BYTES));
    let n = limited.read_line(&mut line).await?;
    if n == 0 {
        return Err(SupError::Codec("connection closed before a frame arrived".into()));
    }
    if !line.ends_with('\n') {
        return Err(SupError::Codec("frame too large or truncated".into()));
    }
    serde_json::from_str(line.trim_end()).map_err(|e| SupError::Codec(e.to_string()))
}
