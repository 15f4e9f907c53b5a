//! Line codec for process event streams.
//!
//! Wraps [`tokio_util::codec::LinesCodec`] with a maximum line length so
//! an unterminated line from a misbehaving process cannot grow without
//! bound. The runner feeds raw stdout chunks into a `BytesMut` and calls
//! [`EventLineCodec::decode`] until it yields `None`; a trailing partial
//! line stays in the buffer until the next chunk completes it.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, LinesCodec, LinesCodecError};

use crate::{AppError, Result};

/// Maximum line length accepted by the codec: 1 MiB.
pub const MAX_LINE_BYTES: usize = 1_048_576;

/// Newline-delimited UTF-8 line decoder with a length ceiling.
///
/// Lines longer than [`MAX_LINE_BYTES`] produce an error once; the codec
/// then discards input up to the next newline and resumes normally.
#[derive(Debug)]
pub struct EventLineCodec(LinesCodec);

impl EventLineCodec {
    /// Create a codec with the default [`MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_length(MAX_LINE_BYTES)
    }

    /// Create a codec with a custom line limit.
    #[must_use]
    pub fn with_max_length(max_length: usize) -> Self {
        Self(LinesCodec::new_with_max_length(max_length))
    }
}

impl Default for EventLineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for EventLineCodec {
    type Item = String;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.0.decode(src).map_err(map_codec_error)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.0.decode_eof(src).map_err(map_codec_error)
    }
}

fn map_codec_error(e: LinesCodecError) -> AppError {
    match e {
        LinesCodecError::MaxLineLengthExceeded => {
            AppError::Io("line too long: exceeded max line length".into())
        }
        LinesCodecError::Io(io_err) => AppError::Io(io_err.to_string()),
    }
}
