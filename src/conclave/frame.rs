//! Conclave line framing (newline-delimited JSON, optional deflate).

use std::io::Write;

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use serde_json::Value;
use thiserror::Error;

use crate::error::Transience;

pub const FRAME_DELIMITER: u8 = b'\n';

const INFLATE_CHUNK_RESERVE: usize = 8 * 1024;
const DEFLATE_CHUNK_RESERVE: usize = 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("deflate stream error: {0}")]
    Deflate(String),
    #[error("frame too large: max {max_frame_bytes} got {got_bytes}")]
    FrameTooLarge {
        max_frame_bytes: usize,
        got_bytes: usize,
    },
    #[error("json serialize error: {0}")]
    Serialize(#[source] serde_json::Error),
}

impl FrameError {
    pub fn transience(&self) -> Transience {
        match self {
            FrameError::Io(_) => Transience::Retryable,
            FrameError::Deflate(_) | FrameError::FrameTooLarge { .. } => Transience::Unknown,
            FrameError::Serialize(_) => Transience::Permanent,
        }
    }
}

/// One decoded unit of the inbound byte stream.
///
/// Parse failures are value-level events, not connection failures; only
/// [`FrameError`] tears the stream down.
#[derive(Debug)]
pub enum FrameEvent {
    /// Empty segment between two delimiters: the server heartbeat sentinel.
    Heartbeat,
    /// One parsed JSON document.
    Value(Value),
    /// A segment that was not valid JSON.
    ParseError(serde_json::Error),
}

/// Splits an accumulating byte stream into delimited JSON documents.
///
/// When a deflate filter is configured, each incoming chunk is decompressed
/// whole before delimiter splitting; compressed frames only decompress
/// correctly as the complete chunks the peer emitted.
pub struct FrameDecoder {
    buf: Vec<u8>,
    inflate: Option<Decompress>,
    max_frame_bytes: usize,
}

impl FrameDecoder {
    pub fn new(compressed: bool, max_frame_bytes: usize) -> Self {
        Self {
            buf: Vec::new(),
            inflate: compressed.then(|| Decompress::new(false)),
            max_frame_bytes,
        }
    }

    /// Consume one chunk read off the stream and return the frames it
    /// completed, in order. Bytes after the last delimiter are retained
    /// and prepended to the next chunk.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<FrameEvent>, FrameError> {
        match &mut self.inflate {
            Some(inflate) => {
                let inflated = inflate_chunk(inflate, chunk)?;
                self.buf.extend_from_slice(&inflated);
            }
            None => self.buf.extend_from_slice(chunk),
        }

        let mut events = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == FRAME_DELIMITER) {
            let segment = self.buf[..pos].to_vec();
            self.buf.drain(..=pos);

            if segment.is_empty() {
                events.push(FrameEvent::Heartbeat);
                continue;
            }
            match serde_json::from_slice::<Value>(&segment) {
                Ok(value) => events.push(FrameEvent::Value(value)),
                Err(err) => events.push(FrameEvent::ParseError(err)),
            }
        }

        if self.buf.len() > self.max_frame_bytes {
            return Err(FrameError::FrameTooLarge {
                max_frame_bytes: self.max_frame_bytes,
                got_bytes: self.buf.len(),
            });
        }
        Ok(events)
    }
}

/// Serializes values into delimited frames and drains them through a sink
/// that may accept partial writes.
pub struct FrameEncoder {
    pending: Vec<u8>,
    deflate: Option<Compress>,
    max_frame_bytes: usize,
}

impl FrameEncoder {
    pub fn new(compressed: bool, max_frame_bytes: usize) -> Self {
        Self {
            pending: Vec::new(),
            deflate: compressed.then(|| Compress::new(Compression::default(), false)),
            max_frame_bytes,
        }
    }

    /// Frame one value (or a bare delimiter heartbeat for `None`) onto the
    /// pending buffer.
    pub fn enqueue(&mut self, value: Option<&Value>) -> Result<(), FrameError> {
        let mut framed = match value {
            Some(value) => serde_json::to_vec(value).map_err(FrameError::Serialize)?,
            None => Vec::new(),
        };
        if framed.len() > self.max_frame_bytes {
            return Err(FrameError::FrameTooLarge {
                max_frame_bytes: self.max_frame_bytes,
                got_bytes: framed.len(),
            });
        }
        framed.push(FRAME_DELIMITER);

        match &mut self.deflate {
            Some(deflate) => {
                let compressed = deflate_chunk(deflate, &framed)?;
                self.pending.extend_from_slice(&compressed);
            }
            None => self.pending.extend_from_slice(&framed),
        }
        Ok(())
    }

    /// Attempt one write of the pending buffer, advancing past exactly the
    /// bytes the sink accepted. Never duplicates, never drops.
    pub fn write_pending(&mut self, sink: &mut impl Write) -> std::io::Result<usize> {
        if self.pending.is_empty() {
            return Ok(0);
        }
        let written = sink.write(&self.pending)?;
        self.pending.drain(..written);
        Ok(written)
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

fn inflate_chunk(inflate: &mut Decompress, chunk: &[u8]) -> Result<Vec<u8>, FrameError> {
    let mut out = Vec::with_capacity(chunk.len().saturating_mul(2));
    let mut consumed = 0usize;

    while consumed < chunk.len() {
        if out.capacity() == out.len() {
            out.reserve(INFLATE_CHUNK_RESERVE);
        }
        let before_in = inflate.total_in();
        let status = inflate
            .decompress_vec(&chunk[consumed..], &mut out, FlushDecompress::Sync)
            .map_err(|err| FrameError::Deflate(err.to_string()))?;
        consumed += (inflate.total_in() - before_in) as usize;
        if status == Status::StreamEnd {
            break;
        }
    }
    Ok(out)
}

fn deflate_chunk(deflate: &mut Compress, framed: &[u8]) -> Result<Vec<u8>, FrameError> {
    let mut out = Vec::with_capacity(framed.len() + 64);
    let mut consumed = 0usize;

    while consumed < framed.len() {
        if out.capacity() == out.len() {
            out.reserve(DEFLATE_CHUNK_RESERVE);
        }
        let before_in = deflate.total_in();
        deflate
            .compress_vec(&framed[consumed..], &mut out, FlushCompress::Sync)
            .map_err(|err| FrameError::Deflate(err.to_string()))?;
        consumed += (deflate.total_in() - before_in) as usize;
    }

    // Drain whatever the sync flush still holds so the peer can decode
    // this chunk without waiting for more input.
    loop {
        if out.capacity() == out.len() {
            out.reserve(DEFLATE_CHUNK_RESERVE);
        }
        let before_out = deflate.total_out();
        deflate
            .compress_vec(&[], &mut out, FlushCompress::Sync)
            .map_err(|err| FrameError::Deflate(err.to_string()))?;
        if deflate.total_out() == before_out {
            break;
        }
    }
    Ok(out)
}
