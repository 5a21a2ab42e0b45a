// cs-resp: RESP wire format for the clousocket server.
//
// Frames travel in both directions as RESP (the Redis serialization
// protocol).  Inbound commands are flat arrays of bulk strings; outbound
// traffic is either a relayed upstream reply or one of the server-originated
// notifications built by the constructors at the bottom of this file.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

// ---------------------------------------------------------------------------
// Frame model
// ---------------------------------------------------------------------------

/// A single RESP frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// `+OK\r\n`
    Simple(String),
    /// `-ERR …\r\n`
    Error(String),
    /// `:42\r\n`
    Integer(i64),
    /// `$5\r\nhello\r\n`
    Bulk(String),
    /// `$-1\r\n` (also produced for `*-1\r\n`)
    Null,
    /// `*N\r\n` followed by N frames
    Array(Vec<Frame>),
}

impl Frame {
    /// Build an array of bulk strings from string tokens.
    ///
    /// This is the only outbound shape the server itself originates.
    pub fn array_of<I, S>(tokens: I) -> Frame
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Frame::Array(tokens.into_iter().map(|t| Frame::Bulk(t.into())).collect())
    }

    /// Flatten an inbound command frame into its string tokens.
    ///
    /// Commands must be flat arrays of bulk strings.  Simple strings and
    /// integers inside the array are tolerated and stringified; nested
    /// arrays, errors, and nulls are protocol errors.
    pub fn tokens(&self) -> Result<Vec<String>, FrameError> {
        let Frame::Array(items) = self else {
            return Err(FrameError::Protocol(
                "command frame must be an array".to_owned(),
            ));
        };
        let mut tokens = Vec::with_capacity(items.len());
        for item in items {
            match item {
                Frame::Bulk(s) | Frame::Simple(s) => tokens.push(s.clone()),
                Frame::Integer(i) => tokens.push(i.to_string()),
                other => {
                    return Err(FrameError::Protocol(format!(
                        "unexpected element in command array: {other:?}"
                    )));
                }
            }
        }
        Ok(tokens)
    }

    /// `["HEARTBEAT", "ACK", "<ms>"]`
    pub fn heartbeat_ack(interval_ms: u64) -> Frame {
        Frame::array_of(["HEARTBEAT".to_owned(), "ACK".to_owned(), interval_ms.to_string()])
    }

    /// `["HEARTBEAT", "TIMEOUT"]`
    pub fn heartbeat_timeout() -> Frame {
        Frame::array_of(["HEARTBEAT", "TIMEOUT"])
    }

    /// `["ERR", "unknown", "command", "'<name>'"]`
    pub fn unknown_command(name: &str) -> Frame {
        Frame::array_of([
            "ERR".to_owned(),
            "unknown".to_owned(),
            "command".to_owned(),
            format!("'{name}'"),
        ])
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// Malformed wire data: bad type byte, bad length, missing CRLF,
    /// non-UTF-8 payload.
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// Upper bound on a single bulk payload (matches the conventional RESP
/// proto-max-bulk-len of 512 MB).
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// `tokio_util` codec for RESP frames.
///
/// Decoding is incremental: a partial frame leaves the read buffer untouched
/// and yields `None` until more bytes arrive.
#[derive(Debug, Default, Clone, Copy)]
pub struct RespCodec;

impl RespCodec {
    pub fn new() -> Self {
        RespCodec
    }
}

impl Decoder for RespCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        match parse_at(src, 0)? {
            None => Ok(None),
            Some((frame, consumed)) => {
                let _ = src.split_to(consumed);
                Ok(Some(frame))
            }
        }
    }
}

impl Encoder<Frame> for RespCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        write_frame(&frame, dst);
        Ok(())
    }
}

/// Append the wire form of `frame` to `dst`.
pub fn write_frame(frame: &Frame, dst: &mut BytesMut) {
    match frame {
        Frame::Simple(s) => {
            dst.put_u8(b'+');
            dst.put_slice(s.as_bytes());
            dst.put_slice(b"\r\n");
        }
        Frame::Error(s) => {
            dst.put_u8(b'-');
            dst.put_slice(s.as_bytes());
            dst.put_slice(b"\r\n");
        }
        Frame::Integer(i) => {
            dst.put_u8(b':');
            dst.put_slice(i.to_string().as_bytes());
            dst.put_slice(b"\r\n");
        }
        Frame::Bulk(s) => {
            dst.put_u8(b'$');
            dst.put_slice(s.len().to_string().as_bytes());
            dst.put_slice(b"\r\n");
            dst.put_slice(s.as_bytes());
            dst.put_slice(b"\r\n");
        }
        Frame::Null => dst.put_slice(b"$-1\r\n"),
        Frame::Array(items) => {
            dst.put_u8(b'*');
            dst.put_slice(items.len().to_string().as_bytes());
            dst.put_slice(b"\r\n");
            for item in items {
                write_frame(item, dst);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Incremental parser
// ---------------------------------------------------------------------------

/// Parse one frame starting at `pos`.
///
/// Returns `None` when the buffer holds only a prefix of a frame, otherwise
/// the frame and the position just past it.
fn parse_at(buf: &[u8], pos: usize) -> Result<Option<(Frame, usize)>, FrameError> {
    if pos >= buf.len() {
        return Ok(None);
    }
    let type_byte = buf[pos];
    let Some((line, next)) = read_line(buf, pos + 1) else {
        return Ok(None);
    };
    match type_byte {
        b'+' => Ok(Some((Frame::Simple(utf8_line(line)?), next))),
        b'-' => Ok(Some((Frame::Error(utf8_line(line)?), next))),
        b':' => Ok(Some((Frame::Integer(parse_int(line)?), next))),
        b'$' => {
            let len = parse_int(line)?;
            if len == -1 {
                return Ok(Some((Frame::Null, next)));
            }
            if len < 0 || len > MAX_BULK_LEN {
                return Err(FrameError::Protocol(format!("invalid bulk length {len}")));
            }
            let len = usize::try_from(len).expect("bounds checked above");
            let end = next + len;
            if buf.len() < end + 2 {
                return Ok(None);
            }
            if &buf[end..end + 2] != b"\r\n" {
                return Err(FrameError::Protocol(
                    "bulk payload not terminated by CRLF".to_owned(),
                ));
            }
            Ok(Some((Frame::Bulk(utf8_line(&buf[next..end])?), end + 2)))
        }
        b'*' => {
            let count = parse_int(line)?;
            if count == -1 {
                return Ok(Some((Frame::Null, next)));
            }
            if count < 0 {
                return Err(FrameError::Protocol(format!(
                    "invalid array length {count}"
                )));
            }
            let count = usize::try_from(count).expect("bounds checked above");
            let mut items = Vec::with_capacity(count.min(64));
            let mut p = next;
            for _ in 0..count {
                match parse_at(buf, p)? {
                    None => return Ok(None),
                    Some((frame, np)) => {
                        items.push(frame);
                        p = np;
                    }
                }
            }
            Ok(Some((Frame::Array(items), p)))
        }
        other => Err(FrameError::Protocol(format!(
            "invalid frame type byte 0x{other:02x}"
        ))),
    }
}

/// Slice up to the next CRLF, returning the line body and the position just
/// past the terminator.
fn read_line(buf: &[u8], pos: usize) -> Option<(&[u8], usize)> {
    let mut i = pos;
    while i + 1 < buf.len() {
        if buf[i] == b'\r' && buf[i + 1] == b'\n' {
            return Some((&buf[pos..i], i + 2));
        }
        i += 1;
    }
    None
}

fn utf8_line(line: &[u8]) -> Result<String, FrameError> {
    std::str::from_utf8(line)
        .map(|s| s.to_owned())
        .map_err(|_| FrameError::Protocol("payload is not valid UTF-8".to_owned()))
}

fn parse_int(line: &[u8]) -> Result<i64, FrameError> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| {
            FrameError::Protocol(format!("invalid integer line {:?}", String::from_utf8_lossy(line)))
        })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
