/// Botnet line codec: frames a TCP byte stream into botnet lines.
///
/// Splits on `\n`, dropping a preceding `\r` if the peer sent CRLF.
/// Decoded items are the raw line bytes: parsing into a [`Line`] happens in
/// the relay so that a malformed line can be dropped without tearing down
/// the stream. Outgoing lines are written with a bare `\n`, as eggdrop does.
///
/// Oversized lines (> 8191 bytes) are skipped rather than killing the
/// connection, whether they arrive in one read or many.
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use super::line::Line;

/// Maximum line length (including the terminator).
const MAX_LINE_LENGTH: usize = 8191;

/// Codec error. Framing itself never fails; only the socket can.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A tokio codec that frames botnet lines on `\n` boundaries.
#[derive(Debug, Default)]
pub struct LineCodec {
    /// True while discarding an oversized line until its `\n`.
    skipping: bool,
}

impl LineCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

fn take_line(src: &mut BytesMut, len: usize, terminator: usize) -> BytesMut {
    let mut line = src.split_to(len);
    src.advance(terminator);
    if line.last() == Some(&b'\r') {
        line.truncate(line.len() - 1);
    }
    line
}

impl Decoder for LineCodec {
    type Item = BytesMut;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.skipping {
            match src.iter().position(|b| *b == b'\n') {
                Some(pos) => {
                    warn!(bytes = pos + 1, "codec: finished skipping oversized line tail");
                    src.advance(pos + 1);
                    self.skipping = false;
                }
                None => {
                    src.clear();
                    return Ok(None);
                }
            }
        }

        match src.iter().position(|b| *b == b'\n') {
            Some(pos) if pos > MAX_LINE_LENGTH => {
                warn!(bytes = pos, "codec: skipped oversized line ({pos} bytes)");
                src.advance(pos + 1);
                self.decode(src)
            }
            Some(pos) => Ok(Some(take_line(src, pos, 1))),
            None => {
                if src.len() > MAX_LINE_LENGTH {
                    warn!(
                        bytes = src.len(),
                        "codec: discarding oversized partial line, waiting for terminator"
                    );
                    src.clear();
                    self.skipping = true;
                }
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }
        // An unterminated final line is still a line.
        if src.is_empty() {
            Ok(None)
        } else {
            let len = src.len();
            Ok(Some(take_line(src, len, 0)))
        }
    }
}

impl Encoder<Line> for LineCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Line, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let wire = item.to_bytes();
        dst.reserve(wire.len() + 1);
        dst.put_slice(&wire);
        dst.put_u8(b'\n');
        Ok(())
    }
}
