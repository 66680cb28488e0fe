//! Newline-delimited JSON framing
//!
//! One frame per line. Lines longer than [`MAX_FRAME_LEN`] are refused so a
//! misbehaving peer cannot make the privileged side buffer without bound.

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest accepted frame, newline included
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Framing errors
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Frame exceeds {} bytes", MAX_FRAME_LEN)]
    FrameTooLarge,
}

impl CodecError {
    /// Can the stream still be read after this error?
    ///
    /// A malformed line is consumed whole, so the next frame is intact.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CodecError::Malformed(_))
    }
}

/// Serialize a frame into a single terminated line
pub fn encode_frame<T: Serialize>(frame: &T) -> Result<Vec<u8>, CodecError> {
    let mut line = serde_json::to_vec(frame)?;
    line.push(b'\n');
    Ok(line)
}

/// Parse one line (with or without its terminator)
///
/// Bytes that are not UTF-8 are a malformed frame like any other bad JSON.
pub fn decode_frame<T: DeserializeOwned>(line: &[u8]) -> Result<T, CodecError> {
    let end = line
        .iter()
        .rposition(|b| !matches!(b, b'\r' | b'\n'))
        .map_or(0, |i| i + 1);
    Ok(serde_json::from_slice(&line[..end])?)
}

/// Write a frame and flush it
pub async fn write_frame<W, T>(writer: &mut W, frame: &T) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let line = encode_frame(frame)?;
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads frames line by line from a buffered stream
pub struct FrameReader<R> {
    inner: R,
    line: Vec<u8>,
}

impl<R: AsyncBufRead + Unpin> FrameReader<R> {
    /// Wrap a buffered reader
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            line: Vec::new(),
        }
    }

    /// Read the next frame
    ///
    /// Returns `Ok(None)` once the peer has closed its side. Blank lines are
    /// skipped.
    pub async fn next_frame<T: DeserializeOwned>(&mut self) -> Result<Option<T>, CodecError> {
        loop {
            self.line.clear();

            let mut limited = (&mut self.inner).take(MAX_FRAME_LEN as u64);
            let read = limited.read_until(b'\n', &mut self.line).await?;
            if read == 0 {
                return Ok(None);
            }
            if self.line.last() != Some(&b'\n') && read >= MAX_FRAME_LEN {
                return Err(CodecError::FrameTooLarge);
            }
            if self.line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            return decode_frame(&self.line).map(Some);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ClientFrame, HelperFrame};
    use tokio::io::BufReader;

    #[test]
    fn test_encode_is_single_line() {
        let line = encode_frame(&HelperFrame::TaskTerminated { seq: 1 }).unwrap();
        assert_eq!(line.last(), Some(&b'\n'));
        assert_eq!(line.iter().filter(|b| **b == b'\n').count(), 1);
    }

    #[tokio::test]
    async fn test_reads_consecutive_frames() {
        let input = b"{\"type\":\"get_version\",\"id\":1}\n\n{\"type\":\"close\",\"id\":2}\n";
        let mut reader = FrameReader::new(BufReader::new(&input[..]));

        let first: Option<ClientFrame> = reader.next_frame().await.unwrap();
        assert_eq!(first, Some(ClientFrame::GetVersion { id: 1 }));

        let second: Option<ClientFrame> = reader.next_frame().await.unwrap();
        assert_eq!(second, Some(ClientFrame::Close { id: 2 }));

        let end: Option<ClientFrame> = reader.next_frame().await.unwrap();
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn test_malformed_frame_is_recoverable() {
        let input = b"not json\n{\"type\":\"close\",\"id\":9}\n";
        let mut reader = FrameReader::new(BufReader::new(&input[..]));

        let err = reader.next_frame::<ClientFrame>().await.unwrap_err();
        assert!(err.is_recoverable());

        let next: Option<ClientFrame> = reader.next_frame().await.unwrap();
        assert_eq!(next, Some(ClientFrame::Close { id: 9 }));
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_recoverable() {
        let mut input = b"{\"type\":\"close\",\"id\":\"".to_vec();
        input.extend_from_slice(&[0xff, 0xfe]);
        input.extend_from_slice(b"\"}\n{\"type\":\"get_version\",\"id\":3}\n");
        let mut reader = FrameReader::new(BufReader::new(&input[..]));

        let err = reader.next_frame::<ClientFrame>().await.unwrap_err();
        assert!(matches!(err, CodecError::Malformed(_)));
        assert!(err.is_recoverable());

        let next: Option<ClientFrame> = reader.next_frame().await.unwrap();
        assert_eq!(next, Some(ClientFrame::GetVersion { id: 3 }));
    }

    #[test]
    fn test_decode_frame_trims_terminator() {
        let frame: ClientFrame = decode_frame(b"{\"type\":\"close\",\"id\":1}\r\n").unwrap();
        assert_eq!(frame, ClientFrame::Close { id: 1 });
        assert!(decode_frame::<ClientFrame>(b"\n").is_err());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let input = vec![b'a'; MAX_FRAME_LEN + 10];
        let mut reader = FrameReader::new(BufReader::new(&input[..]));

        let err = reader.next_frame::<ClientFrame>().await.unwrap_err();
        assert!(matches!(err, CodecError::FrameTooLarge));
        assert!(!err.is_recoverable());
    }

    #[tokio::test]
    async fn test_write_frame_flushes_line() {
        let mut out = Vec::new();
        write_frame(&mut out, &ClientFrame::TaskTerminatedAck { seq: 4 })
            .await
            .unwrap();

        assert_eq!(out, b"{\"type\":\"task_terminated_ack\",\"seq\":4}\n");
    }
}
