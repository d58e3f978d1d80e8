//! Peer wire protocol: bincode bodies behind a 4-byte big-endian length prefix.
use bincode::{Decode, Encode};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::Result;
use crate::node::messages::{Message, SeenDigest};
use crate::node::NodeId;

/// Frames above this size are rejected without reading the body
pub const MAX_FRAME_LEN: usize = 10 * 1024 * 1024;

#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub enum PeerRequest {
    SendMessage(Message),
    SyncSeenMsgs { sender: NodeId, digest: SeenDigest },
    Ping,
}

#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub enum PeerResponse {
    Ack { success: bool },
}

impl PeerRequest {
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let config = bincode::config::standard().with_big_endian();
        Ok(bincode::encode_to_vec(self, config)?)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let config = bincode::config::standard().with_big_endian();
        let (request, _) = bincode::decode_from_slice(data, config)?;
        Ok(request)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PeerRequest::SendMessage(_) => "send_message",
            PeerRequest::SyncSeenMsgs { .. } => "sync_seen_msgs",
            PeerRequest::Ping => "ping",
        }
    }
}

impl PeerResponse {
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let config = bincode::config::standard().with_big_endian();
        Ok(bincode::encode_to_vec(self, config)?)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let config = bincode::config::standard().with_big_endian();
        let (response, _) = bincode::decode_from_slice(data, config)?;
        Ok(response)
    }
}

pub async fn write_frame<W>(stream: &mut W, data: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(data.len()).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "frame too large")
    })?;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(data).await?;
    stream.flush().await
}

pub async fn read_frame<R>(stream: &mut R) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit", len),
        ));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::messages::MsgId;

    fn message() -> Message {
        Message {
            msg_id: MsgId::compute(&"A".into(), 12.5, b"hello"),
            topic: "chat".to_string(),
            content: "68656c6c6f".to_string(),
            sender: "A".into(),
            timestamp: 12.5,
            lamport: 3,
        }
    }

    #[test]
    fn test_request_wire_format() {
        let request = PeerRequest::SendMessage(message());
        let bytes = request.serialize().unwrap();
        assert_eq!(PeerRequest::deserialize(&bytes).unwrap(), request);

        let sync = PeerRequest::SyncSeenMsgs {
            sender: "B".into(),
            digest: SeenDigest::new(f64::NEG_INFINITY, vec![message().msg_id]),
        };
        assert_eq!(sync.kind(), "sync_seen_msgs");
        assert_eq!(
            PeerRequest::deserialize(&sync.serialize().unwrap()).unwrap(),
            sync
        );
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(PeerRequest::deserialize(&[0xff, 0xff, 0xff, 0xff, 0x01]).is_err());
        assert!(PeerResponse::deserialize(&[]).is_err());
    }

    #[tokio::test]
    async fn test_frames_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_frame(&mut client, b"abc").await.unwrap();
        write_frame(&mut client, b"").await.unwrap();
        assert_eq!(read_frame(&mut server).await.unwrap(), b"abc");
        assert_eq!(read_frame(&mut server).await.unwrap(), b"");
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let len = (MAX_FRAME_LEN as u32 + 1).to_be_bytes();
        client.write_all(&len).await.unwrap();
        let err = read_frame(&mut server).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }
}
