//! Line-delimited JSON framing
//!
//! One UTF-8 JSON value per line. The newline is the only framing signal:
//! bytes are buffered until a newline arrives, and only then is the line
//! parsed. A parse failure on a complete line is a `FramingError`, never a
//! request for more bytes.

use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::FramingError;

const READ_CHUNK_BYTES: usize = 8 * 1024;

/// Encode a message as a single JSON line
pub fn encode_frame<T: Serialize>(message: &T) -> Result<Vec<u8>, FramingError> {
    let mut bytes = serde_json::to_vec(message).map_err(|e| FramingError::Encode {
        message: e.to_string(),
    })?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Incremental decoder for newline-delimited JSON
#[derive(Debug)]
pub struct LineDecoder {
    buffer: Vec<u8>,
    /// Bytes already known to contain no newline
    scanned: usize,
    max_line_bytes: usize,
}

impl LineDecoder {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            max_line_bytes,
        }
    }

    /// Append bytes read from the stream
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Number of bytes waiting for a newline
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Whether the buffer holds anything besides whitespace
    pub fn has_partial_line(&self) -> bool {
        self.buffer.iter().any(|b| !b.is_ascii_whitespace())
    }

    /// Pop the next complete message, if a full line is buffered
    pub fn next_frame(&mut self) -> Result<Option<Value>, FramingError> {
        loop {
            let Some(offset) = self.buffer[self.scanned..].iter().position(|&b| b == b'\n')
            else {
                self.scanned = self.buffer.len();
                if self.buffer.len() > self.max_line_bytes {
                    return Err(FramingError::LineTooLong {
                        len: self.buffer.len(),
                        max: self.max_line_bytes,
                    });
                }
                return Ok(None);
            };

            let end = self.scanned + offset;
            let mut line: Vec<u8> = self.buffer.drain(..=end).collect();
            self.scanned = 0;
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }

            if line.len() > self.max_line_bytes {
                return Err(FramingError::LineTooLong {
                    len: line.len(),
                    max: self.max_line_bytes,
                });
            }

            let text = std::str::from_utf8(&line).map_err(|_| FramingError::InvalidUtf8)?;
            if text.trim().is_empty() {
                continue;
            }

            return serde_json::from_str(text)
                .map(Some)
                .map_err(|e| FramingError::InvalidJson {
                    message: e.to_string(),
                });
        }
    }
}

/// Reads framed messages from an async byte stream
pub struct FrameReader<R> {
    reader: R,
    decoder: LineDecoder,
    chunk: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, max_line_bytes: usize) -> Self {
        Self {
            reader,
            decoder: LineDecoder::new(max_line_bytes),
            chunk: vec![0; READ_CHUNK_BYTES],
        }
    }

    /// Next message, or `None` on a clean end of stream
    pub async fn read_frame(&mut self) -> Result<Option<Value>, FramingError> {
        loop {
            if let Some(frame) = self.decoder.next_frame()? {
                return Ok(Some(frame));
            }

            let read = self.reader.read(&mut self.chunk).await?;
            if read == 0 {
                if self.decoder.has_partial_line() {
                    return Err(FramingError::UnexpectedEof {
                        buffered: self.decoder.buffered(),
                    });
                }
                return Ok(None);
            }
            self.decoder.extend(&self.chunk[..read]);
        }
    }
}

/// Writes framed messages to an async byte stream
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write one message and flush it
    pub async fn write_frame<T: Serialize>(&mut self, message: &T) -> Result<(), FramingError> {
        let bytes = encode_frame(message)?;
        self.write_encoded(&bytes).await
    }

    /// Write a frame produced by [`encode_frame`] and flush it
    pub async fn write_encoded(&mut self, frame: &[u8]) -> Result<(), FramingError> {
        self.writer.write_all(frame).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Close the write half
    pub async fn shutdown(&mut self) -> Result<(), FramingError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}
