//! Newline-delimited JSON framing.
//!
//! One UTF-8 JSON object per line, terminated by a single `\n`. Partial
//! reads accumulate until a newline; lines above the configured ceiling
//! are a protocol violation and close the connection.

use std::io::{Read, Write};

use thiserror::Error;

use super::wire::Envelope;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("line too long: max {max_line_bytes} got {got_bytes}")]
    LineTooLong {
        max_line_bytes: usize,
        got_bytes: usize,
    },
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

pub struct LineReader<R> {
    reader: R,
    buf: Vec<u8>,
    max_line_bytes: usize,
}

impl<R: Read> LineReader<R> {
    pub fn new(reader: R, max_line_bytes: usize) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            max_line_bytes,
        }
    }

    /// Read the next envelope. `Ok(None)` means the peer closed the
    /// connection cleanly at a line boundary.
    pub fn read_envelope(&mut self) -> Result<Option<Envelope>, FrameError> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.buf.drain(..=pos).collect();
                let mut line = &line[..pos];
                if line.ends_with(b"\r") {
                    line = &line[..line.len() - 1];
                }
                if line.is_empty() {
                    continue;
                }
                let envelope = serde_json::from_slice(line)?;
                return Ok(Some(envelope));
            }

            if self.buf.len() >= self.max_line_bytes {
                return Err(FrameError::LineTooLong {
                    max_line_bytes: self.max_line_bytes,
                    got_bytes: self.buf.len(),
                });
            }

            let mut chunk = [0u8; 4096];
            let n = self.reader.read(&mut chunk)?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "frame truncated mid-line",
                )
                .into());
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

pub struct LineWriter<W> {
    writer: W,
    max_line_bytes: usize,
}

impl<W: Write> LineWriter<W> {
    pub fn new(writer: W, max_line_bytes: usize) -> Self {
        Self {
            writer,
            max_line_bytes,
        }
    }

    pub fn write_envelope(&mut self, envelope: &Envelope) -> Result<(), FrameError> {
        let line = encode_line(envelope, self.max_line_bytes)?;
        self.writer.write_all(&line)?;
        self.writer.flush()?;
        Ok(())
    }
}

pub fn encode_line(envelope: &Envelope, max_line_bytes: usize) -> Result<Vec<u8>, FrameError> {
    let mut line = serde_json::to_vec(envelope)?;
    if line.len() + 1 > max_line_bytes {
        return Err(FrameError::LineTooLong {
            max_line_bytes,
            got_bytes: line.len() + 1,
        });
    }
    line.push(b'\n');
    Ok(line)
}
