// relay-net::codec: framing for every message exchanged inside a process
// group: rendezvous handshakes, barrier tokens and broadcast tensors.
//
// Wire format: [u32 big-endian length][bincode payload]
// Bincode is used because tensor frames carry raw activation bytes; it writes
// them as length + raw bytes, where JSON would inflate them.

use std::io;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use relay_types::pipeline::HostTensor;

use crate::error::{NetError, Result};

/// Safety limit: reject any single frame larger than 512 MiB.
/// A `[1, 2048, 8192]` f32 hidden state is 64 MiB.
const MAX_FRAME_BYTES: usize = 512 * 1024 * 1024;

// ── Message Types ─────────────────────────────────────────────────────────────

/// A broadcast payload together with the collective it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorFrame {
    /// Collective sequence number; every rank counts collectives identically.
    pub seq: u64,
    /// Rank that produced the tensor.
    pub source_rank: u32,
    pub tensor: HostTensor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireMessage {
    /// First message on a new connection, sent by a joining rank.
    Hello { rank: u32, world_size: u32 },

    /// Rank 0 admits a joining rank once every rank has arrived.
    Welcome { run_id: String },

    /// Rank 0 refuses a joining rank.
    Reject { reason: String },

    /// A non-zero rank reached barrier `seq`.
    Barrier { seq: u64 },

    /// Rank 0 releases barrier `seq`.
    Release { seq: u64 },

    Tensor(TensorFrame),

    /// The sender is tearing down and will not take part in more collectives.
    Goodbye { rank: u32 },
}

impl WireMessage {
    /// Short name for logs and protocol errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hello { .. }   => "Hello",
            Self::Welcome { .. } => "Welcome",
            Self::Reject { .. }  => "Reject",
            Self::Barrier { .. } => "Barrier",
            Self::Release { .. } => "Release",
            Self::Tensor(_)      => "Tensor",
            Self::Goodbye { .. } => "Goodbye",
        }
    }
}

// ── Codec ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_bytes: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self {
            max_frame_bytes: MAX_FRAME_BYTES,
        }
    }
}

impl FrameCodec {
    pub fn with_limit(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }

    pub fn encode(&self, msg: &WireMessage) -> Result<Vec<u8>> {
        bincode::serde::encode_to_vec(msg, bincode::config::standard())
            .map_err(|e| NetError::Serialization(e.to_string()))
    }

    pub fn decode(&self, payload: &[u8]) -> Result<WireMessage> {
        let (msg, _) = bincode::serde::decode_from_slice(payload, bincode::config::standard())
            .map_err(|e| NetError::Serialization(e.to_string()))?;
        Ok(msg)
    }

    pub async fn read_message<T>(&self, io: &mut T) -> Result<WireMessage>
    where
        T: AsyncRead + Unpin,
    {
        let payload = self.read_frame(io).await?;
        self.decode(&payload)
    }

    pub async fn write_message<T>(&self, io: &mut T, msg: &WireMessage) -> Result<()>
    where
        T: AsyncWrite + Unpin,
    {
        let payload = self.encode(msg)?;
        self.write_frame(io, &payload).await
    }

    /// Read a `[u32 BE length][payload]` frame.
    pub async fn read_frame<T>(&self, io: &mut T) -> Result<Vec<u8>>
    where
        T: AsyncRead + Unpin,
    {
        let mut len_buf = [0u8; 4];
        io.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > self.max_frame_bytes {
            return Err(NetError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("message too large: {len} bytes (max {})", self.max_frame_bytes),
            )));
        }
        let mut buf = vec![0u8; len];
        io.read_exact(&mut buf).await?;
        Ok(buf)
    }

    /// Write a `[u32 BE length][payload]` frame.
    pub async fn write_frame<T>(&self, io: &mut T, payload: &[u8]) -> Result<()>
    where
        T: AsyncWrite + Unpin,
    {
        let len = u32::try_from(payload.len()).map_err(|_| {
            NetError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("payload exceeds u32::MAX: {} bytes", payload.len()),
            ))
        })?;
        io.write_all(&len.to_be_bytes()).await?;
        io.write_all(payload).await?;
        io.flush().await?;
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use relay_types::pipeline::TensorDtype;

    #[tokio::test]
    async fn tensor_frame_round_trip() {
        let codec = FrameCodec::default();
        let msg = WireMessage::Tensor(TensorFrame {
            seq: 7,
            source_rank: 1,
            tensor: HostTensor {
                shape: vec![1, 3, 4],
                dtype: TensorDtype::F32,
                data: vec![0xAB; 48],
            },
        });

        let mut buf = Vec::new();
        codec.write_message(&mut buf, &msg).await.unwrap();
        let decoded = codec.read_message(&mut buf.as_slice()).await.unwrap();

        match decoded {
            WireMessage::Tensor(frame) => {
                assert_eq!(frame.seq, 7);
                assert_eq!(frame.source_rank, 1);
                assert_eq!(frame.tensor.shape, vec![1, 3, 4]);
                assert_eq!(frame.tensor.data[0], 0xAB);
            }
            other => panic!("wrong variant: {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn frames_are_read_in_order() {
        let codec = FrameCodec::default();
        let mut buf = Vec::new();
        codec.write_message(&mut buf, &WireMessage::Barrier { seq: 1 }).await.unwrap();
        codec.write_message(&mut buf, &WireMessage::Goodbye { rank: 2 }).await.unwrap();

        let mut reader = buf.as_slice();
        assert_eq!(codec.read_message(&mut reader).await.unwrap(), WireMessage::Barrier { seq: 1 });
        assert_eq!(codec.read_message(&mut reader).await.unwrap(), WireMessage::Goodbye { rank: 2 });
    }

    #[tokio::test]
    async fn rejects_oversized_message() {
        let codec = FrameCodec::with_limit(16);

        // Fabricate a frame claiming 1000 bytes.
        let mut buf = Vec::new();
        buf.extend_from_slice(&1000u32.to_be_bytes());
        buf.extend_from_slice(&[0u8; 1000]);

        let err = codec.read_message(&mut buf.as_slice()).await.unwrap_err();
        assert!(err.to_string().contains("message too large"));
    }

    #[tokio::test]
    async fn truncated_frame_is_an_io_error() {
        let codec = FrameCodec::default();
        let mut buf = Vec::new();
        buf.extend_from_slice(&10u32.to_be_bytes());
        buf.extend_from_slice(&[1, 2, 3]);

        let err = codec.read_frame(&mut buf.as_slice()).await.unwrap_err();
        assert!(matches!(err, NetError::Io(ref e) if e.kind() == io::ErrorKind::UnexpectedEof));
    }
}
