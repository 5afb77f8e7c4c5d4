//! Frame codec for byte-stream transports.
//!
//! Wraps `AnyDelimiterCodec` (newline-delimited JSON, the default) and
//! `LengthDelimitedCodec` (4-byte big-endian length prefix) behind one
//! `Decoder`/`Encoder` pair that speaks [`Bytes`]. Both tolerate partial
//! reads. Lines are passed up as raw bytes, so a line that is not valid
//! UTF-8 is one bad frame rather than a broken stream; only an oversized
//! frame or an I/O failure is a [`TransportError::FrameDesync`].

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{
    AnyDelimiterCodec, AnyDelimiterCodecError, Decoder, Encoder, LengthDelimitedCodec,
};

use crate::error::TransportError;

/// Default upper bound on a single frame (16 MiB)
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// How frames are delimited on a byte stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    /// One JSON document per line
    #[default]
    Newline,
    /// Each frame prefixed with its length as a 4-byte big-endian integer
    LengthDelimited,
}

impl std::str::FromStr for Framing {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "newline" | "lines" => Ok(Self::Newline),
            "length" | "length-delimited" => Ok(Self::LengthDelimited),
            other => Err(format!("unknown framing '{other}'")),
        }
    }
}

/// Codec producing and consuming whole frames
#[derive(Debug)]
pub struct FrameCodec {
    inner: Inner,
}

#[derive(Debug)]
enum Inner {
    Lines(AnyDelimiterCodec),
    Length(LengthDelimitedCodec),
}

impl FrameCodec {
    /// Create a codec for the given framing
    pub fn new(framing: Framing, max_frame_length: usize) -> Self {
        let inner = match framing {
            Framing::Newline => Inner::Lines(AnyDelimiterCodec::new_with_max_length(
                b"\n".to_vec(),
                b"\n".to_vec(),
                max_frame_length,
            )),
            Framing::LengthDelimited => Inner::Length(
                LengthDelimitedCodec::builder()
                    .max_frame_length(max_frame_length)
                    .new_codec(),
            ),
        };
        Self { inner }
    }

    /// Which framing this codec speaks
    pub fn framing(&self) -> Framing {
        match self.inner {
            Inner::Lines(_) => Framing::Newline,
            Inner::Length(_) => Framing::LengthDelimited,
        }
    }
}

fn lines_error(err: AnyDelimiterCodecError) -> TransportError {
    match err {
        AnyDelimiterCodecError::MaxChunkLengthExceeded => {
            TransportError::FrameDesync("line exceeds maximum frame length".to_string())
        }
        AnyDelimiterCodecError::Io(e) => TransportError::FrameDesync(e.to_string()),
    }
}

/// Drop the `\r` of a CRLF line ending
fn without_cr(mut line: Bytes) -> Bytes {
    if line.last() == Some(&b'\r') {
        line.truncate(line.len() - 1);
    }
    line
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, TransportError> {
        match &mut self.inner {
            Inner::Lines(codec) => codec
                .decode(src)
                .map(|line| line.map(without_cr))
                .map_err(lines_error),
            Inner::Length(codec) => codec
                .decode(src)
                .map(|frame| frame.map(BytesMut::freeze))
                .map_err(|e| TransportError::FrameDesync(e.to_string())),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, TransportError> {
        match &mut self.inner {
            Inner::Lines(codec) => codec
                .decode_eof(src)
                .map(|line| line.map(without_cr))
                .map_err(lines_error),
            Inner::Length(codec) => codec
                .decode_eof(src)
                .map(|frame| frame.map(BytesMut::freeze))
                .map_err(|e| TransportError::FrameDesync(e.to_string())),
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = TransportError;

    fn encode(&mut self, frame: Bytes, dst: &mut BytesMut) -> Result<(), TransportError> {
        match &mut self.inner {
            Inner::Lines(codec) => {
                let line = std::str::from_utf8(&frame)
                    .map_err(|e| TransportError::SerializationFailed(e.to_string()))?;
                // A raw newline inside a frame would split it in two on the peer's side
                if line.contains('\n') || line.contains('\r') {
                    return Err(TransportError::SerializationFailed(
                        "frame contains embedded newlines".to_string(),
                    ));
                }
                codec.encode(line, dst).map_err(lines_error)
            }
            Inner::Length(codec) => codec
                .encode(frame, dst)
                .map_err(|e| TransportError::SerializationFailed(e.to_string())),
        }
    }
}
