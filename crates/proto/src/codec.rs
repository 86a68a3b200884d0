//! Length-prefixed framing over async byte streams

use crate::Frame;
use prost::Message;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on an encoded frame (256 MiB)
pub const MAX_FRAME_BYTES: usize = 256 * 1024 * 1024;

/// Write one frame and flush
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = frame.encode_to_vec();
    if body.len() > MAX_FRAME_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame of {} bytes exceeds limit", body.len()),
        ));
    }

    writer.write_u32(body.len() as u32).await?;
    writer.write_all(&body).await?;
    writer.flush().await
}

/// Read one frame
///
/// Returns `Ok(None)` when the peer closed the stream cleanly between frames.
pub async fn read_frame<R>(reader: &mut R) -> io::Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };

    if len > MAX_FRAME_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame length {} exceeds limit", len),
        ));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;

    Frame::decode(body.as_slice())
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{frame, FaultKind};

    #[tokio::test]
    async fn test_frames_survive_a_duplex_stream() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        write_frame(&mut a, &Frame::contribute(7, vec![1.0, 2.5]))
            .await
            .unwrap();
        write_frame(&mut a, &Frame::fault(FaultKind::ShapeMismatch, "len 2 vs 3"))
            .await
            .unwrap();
        drop(a);

        match read_frame(&mut b).await.unwrap().unwrap().kind {
            Some(frame::Kind::Contribute(c)) => {
                assert_eq!(c.seq, 7);
                assert_eq!(c.values, vec![1.0, 2.5]);
            }
            other => panic!("unexpected frame: {:?}", other),
        }

        match read_frame(&mut b).await.unwrap().unwrap().kind {
            Some(frame::Kind::Fault(f)) => {
                assert_eq!(f.kind(), FaultKind::ShapeMismatch);
                assert_eq!(f.message, "len 2 vs 3");
            }
            other => panic!("unexpected frame: {:?}", other),
        }

        assert!(read_frame(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_length_prefix_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_u32(u32::MAX).await.unwrap();

        let err = read_frame(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_undecodable_body_is_invalid_data() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_u32(2).await.unwrap();
        a.write_all(&[0xff, 0xff]).await.unwrap();

        let err = read_frame(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_frame_names() {
        assert_eq!(Frame::join(0, 2, "host-a", 42).name(), "join");
        assert_eq!(Frame::reduced(0, vec![]).name(), "reduced");
        assert_eq!(Frame::default().name(), "empty");
    }
}
