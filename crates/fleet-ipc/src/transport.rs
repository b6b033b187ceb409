//! Async transport for length-prefixed bincode frames.
//!
//! [`FrameWriter`] and [`FrameReader`] wrap any tokio `AsyncWrite` /
//! `AsyncRead`, which for workers are the child's stdin and stdout pipes.
//! Each half is owned by a single task, so neither type needs locking.

use serde::{Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::error::Direction;
use crate::{LENGTH_PREFIX_SIZE, MAX_PAYLOAD_SIZE, TransportError, TransportResult};

fn encode_payload<T: Serialize + ?Sized>(msg: &T) -> TransportResult<Vec<u8>> {
    let payload = bincode::serde::encode_to_vec(msg, bincode::config::standard())
        .map_err(|e| TransportError::Encode(e.to_string()))?;
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(TransportError::FrameTooLarge { len: payload.len() });
    }
    Ok(payload)
}

/// Payload length announced by a prefix.
fn payload_len(prefix: [u8; LENGTH_PREFIX_SIZE]) -> TransportResult<usize> {
    let len = usize::try_from(u32::from_be_bytes(prefix)).unwrap_or(usize::MAX);
    match len {
        0 => Err(TransportError::EmptyFrame),
        n if n > MAX_PAYLOAD_SIZE => Err(TransportError::FrameTooLarge { len: n }),
        n => Ok(n),
    }
}

fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> TransportResult<T> {
    bincode::serde::decode_from_slice(payload, bincode::config::standard())
        .map(|(value, _)| value)
        .map_err(|e| TransportError::Decode {
            reason: e.to_string(),
            len: payload.len(),
        })
}

/// Encode a message into a complete frame (prefix + payload).
///
/// # Errors
///
/// `Encode`, or `FrameTooLarge` above [`MAX_PAYLOAD_SIZE`].
pub fn encode_frame<T: Serialize + ?Sized>(msg: &T) -> TransportResult<Vec<u8>> {
    let payload = encode_payload(msg)?;
    let prefix = u32::try_from(payload.len())
        .map_err(|_| TransportError::FrameTooLarge { len: payload.len() })?
        .to_be_bytes();

    let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    frame.extend_from_slice(&prefix);
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decode a complete frame produced by [`encode_frame`].
///
/// # Errors
///
/// `Truncated` when the buffer is shorter than the frame, `EmptyFrame` or
/// `FrameTooLarge` for a bad prefix, `Decode` for a corrupt payload.
pub fn decode_frame<T: DeserializeOwned>(frame: &[u8]) -> TransportResult<T> {
    let (prefix, rest) = frame
        .split_first_chunk::<LENGTH_PREFIX_SIZE>()
        .ok_or(TransportError::Truncated {
            read: frame.len(),
            expected: LENGTH_PREFIX_SIZE,
        })?;
    let len = payload_len(*prefix)?;
    let payload = rest.get(..len).ok_or(TransportError::Truncated {
        read: frame.len(),
        expected: LENGTH_PREFIX_SIZE + len,
    })?;
    decode_payload(payload)
}

/// Writing half of a worker channel.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub const fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Send one message and flush it.
    ///
    /// # Errors
    ///
    /// `Encode`, `FrameTooLarge`, or `Io` (broken pipe once the worker has
    /// exited).
    pub async fn send<T: Serialize + ?Sized>(&mut self, msg: &T) -> TransportResult<()> {
        let frame = encode_frame(msg)?;
        self.inner
            .write_all(&frame)
            .await
            .map_err(|e| TransportError::io(Direction::Write, &e))?;
        self.inner
            .flush()
            .await
            .map_err(|e| TransportError::io(Direction::Write, &e))
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Reading half of a worker channel.
pub struct FrameReader<R> {
    inner: BufReader<R>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
        }
    }

    /// Receive the next message.
    ///
    /// # Errors
    ///
    /// `Closed` when the peer hung up between frames, `Truncated` when it
    /// hung up inside one. A `Decode` error leaves the stream aligned on the
    /// next frame.
    pub async fn recv<T: DeserializeOwned>(&mut self) -> TransportResult<T> {
        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        self.inner
            .read_exact(&mut prefix)
            .await
            .map_err(|e| Self::read_error(&e, || TransportError::Closed))?;

        let len = payload_len(prefix)?;
        let mut payload = vec![0u8; len];
        self.inner.read_exact(&mut payload).await.map_err(|e| {
            Self::read_error(&e, || TransportError::Truncated {
                read: LENGTH_PREFIX_SIZE,
                expected: LENGTH_PREFIX_SIZE + len,
            })
        })?;

        decode_payload(&payload)
    }

    fn read_error(err: &std::io::Error, on_eof: impl FnOnce() -> TransportError) -> TransportError {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            on_eof()
        } else {
            TransportError::io(Direction::Read, err)
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::{ControllerMessage, WorkerMessage};

    #[test]
    fn test_frame_has_big_endian_prefix() {
        let frame = encode_frame(&ControllerMessage::Shutdown).unwrap();
        let prefix: [u8; 4] = frame[..4].try_into().unwrap();
        assert_eq!(u32::from_be_bytes(prefix) as usize, frame.len() - 4);
    }

    #[test]
    fn test_decode_rejects_zero_length() {
        let result = decode_frame::<ControllerMessage>(&[0, 0, 0, 0]);
        assert!(matches!(result, Err(TransportError::EmptyFrame)));
    }

    #[test]
    fn test_decode_rejects_truncated_payload() {
        let mut frame = encode_frame(&WorkerMessage::Ready { pid: 7 }).unwrap();
        frame.truncate(frame.len() - 1);
        let result = decode_frame::<WorkerMessage>(&frame);
        assert!(matches!(result, Err(TransportError::Truncated { .. })));
    }

    #[test]
    fn test_decode_rejects_oversized_prefix() {
        let prefix = u32::try_from(MAX_PAYLOAD_SIZE + 1).unwrap().to_be_bytes();
        let result = decode_frame::<WorkerMessage>(&prefix);
        assert!(matches!(
            result,
            Err(TransportError::FrameTooLarge { len }) if len == MAX_PAYLOAD_SIZE + 1
        ));
    }

    #[tokio::test]
    async fn test_reader_reports_clean_close() {
        let (writer_side, reader_side) = tokio::io::duplex(1024);
        drop(writer_side);
        let mut reader = FrameReader::new(reader_side);
        let err = reader.recv::<WorkerMessage>().await.unwrap_err();
        assert!(err.is_closed());
    }
}
