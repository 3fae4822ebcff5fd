//! Framed codec for engine communication.
//!
//! One JSON document per line, the framing Node.js uses for its `json` IPC
//! serialization mode. Works over any AsyncRead/AsyncWrite (pipes, sockets, etc).

use std::io;
use std::marker::PhantomData;
use std::ops::ControlFlow;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

/// Longest line accepted from the engine, matching tokio-util's default frame cap.
pub const MAX_FRAME_LENGTH: usize = 8 * 1024 * 1024;

/// Codec that frames messages by newline and serializes with JSON.
///
/// Lines that are blank, not UTF-8, longer than the frame cap, or fail to
/// deserialize as `T` are skipped, so a single malformed frame never tears
/// down the stream.
pub struct JsonLinesCodec<T> {
    inner: LinesCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonLinesCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonLinesCodec<T> {
    pub fn new() -> Self {
        Self::with_max_length(MAX_FRAME_LENGTH)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            inner: LinesCodec::new_with_max_length(max_length),
            _phantom: PhantomData,
        }
    }
}

fn into_io(err: LinesCodecError) -> io::Error {
    match err {
        LinesCodecError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    }
}

fn parse_line<T: DeserializeOwned>(line: &str) -> Option<T> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str(line) {
        Ok(item) => Some(item),
        Err(e) => {
            tracing::warn!(error = %e, frame_len = line.len(), "Skipping undecodable frame");
            None
        }
    }
}

/// Maps one step of the line decoder to a parsed item.
///
/// `Err` from `LinesCodec` only ever means a bad line: non-UTF-8 input has
/// already been consumed, and an over-long line puts the codec into discard
/// mode until the next newline. Both are skipped.
fn next_line<T: DeserializeOwned>(
    step: Result<Option<String>, LinesCodecError>,
) -> ControlFlow<Option<T>> {
    match step {
        Ok(Some(line)) => match parse_line(&line) {
            Some(item) => ControlFlow::Break(Some(item)),
            None => ControlFlow::Continue(()),
        },
        Ok(None) => ControlFlow::Break(None),
        Err(e) => {
            tracing::warn!(error = %e, "Skipping unreadable frame");
            ControlFlow::Continue(())
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonLinesCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if let ControlFlow::Break(item) = next_line(self.inner.decode(src)) {
                return Ok(item);
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if let ControlFlow::Break(item) = next_line(self.inner.decode_eof(buf)) {
                return Ok(item);
            }
        }
    }
}

impl<T: Serialize> Encoder<T> for JsonLinesCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_string(&item)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(json_size_bytes = json.len(), "Encoding frame");
        self.inner.encode(json, dst).map_err(into_io)
    }
}
