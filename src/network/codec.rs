//! Length-prefixed bincode frames: a 4-byte big-endian length, then the payload.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::NetworkError;

pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<(), NetworkError>
where
    W: AsyncWriteExt + Unpin,
    T: Serialize,
{
    let payload = bincode::serde::encode_to_vec(message, bincode::config::standard())
        .map_err(|e| NetworkError::Codec(e.to_string()))?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(NetworkError::FrameTooLarge {
            size: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame. Returns `None` if the peer closed the stream cleanly
/// before a new frame started.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, NetworkError>
where
    R: AsyncReadExt + Unpin,
    T: DeserializeOwned,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_SIZE {
        return Err(NetworkError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    let (message, _) = bincode::serde::decode_from_slice(&payload, bincode::config::standard())
        .map_err(|e| NetworkError::Codec(e.to_string()))?;
    Ok(Some(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::{RequestVoteRequest, RpcRequest};

    #[tokio::test]
    async fn frames_survive_a_stream() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let request = RpcRequest::RequestVote(RequestVoteRequest {
            term: 3,
            candidate_id: "n2".to_string(),
            last_log_index: 7,
            last_log_term: 2,
        });
        write_frame(&mut a, &request).await.unwrap();
        write_frame(&mut a, &RpcRequest::Status).await.unwrap();
        drop(a);

        let first: Option<RpcRequest> = read_frame(&mut b).await.unwrap();
        match first {
            Some(RpcRequest::RequestVote(req)) => assert_eq!(req.last_log_index, 7),
            other => panic!("unexpected frame: {other:?}"),
        }
        let second: Option<RpcRequest> = read_frame(&mut b).await.unwrap();
        assert!(matches!(second, Some(RpcRequest::Status)));
        let eof: Option<RpcRequest> = read_frame(&mut b).await.unwrap();
        assert!(eof.is_none());
    }

    #[tokio::test]
    async fn oversized_length_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_u32((MAX_FRAME_SIZE + 1) as u32).await.unwrap();
        let result: Result<Option<RpcRequest>, _> = read_frame(&mut b).await;
        assert!(matches!(result, Err(NetworkError::FrameTooLarge { .. })));
    }

    #[tokio::test]
    async fn truncated_payload_is_an_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_u32(10).await.unwrap();
        a.write_all(&[1, 2, 3]).await.unwrap();
        drop(a);
        let result: Result<Option<RpcRequest>, _> = read_frame(&mut b).await;
        assert!(matches!(result, Err(NetworkError::Io(_))));
    }
}
