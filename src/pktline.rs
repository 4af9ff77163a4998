//! Git protocol-v2 pkt-line framing (spec.md §4.2).
//!
//! A pkt-line is a 4-hex-digit ASCII length prefix followed by that many bytes
//! of payload, or one of three reserved zero-payload markers: flush (`0000`),
//! delim (`0001`), response-end (`0002`). This module only knows about framing;
//! interpreting the payload (command headers, `want`/`have` arguments,
//! capabilities) is [`crate::protocol`]'s job.

use bytes::{Buf, Bytes};

use crate::error::{Error, Result};

/// Largest payload a single pkt-line may carry (spec.md §4.2 invariant).
pub const MAX_PAYLOAD: usize = 65516;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PktLine {
    Flush,
    Delim,
    ResponseEnd,
    Data(Bytes),
}

impl PktLine {
    pub fn data(payload: impl Into<Bytes>) -> Self {
        PktLine::Data(payload.into())
    }

    pub fn as_data(&self) -> Option<&[u8]> {
        match self {
            PktLine::Data(b) => Some(b),
            _ => None,
        }
    }
}

/// Encodes a single pkt-line.
pub fn encode(line: &PktLine) -> Vec<u8> {
    match line {
        PktLine::Flush => b"0000".to_vec(),
        PktLine::Delim => b"0001".to_vec(),
        PktLine::ResponseEnd => b"0002".to_vec(),
        PktLine::Data(payload) => encode_data(payload),
    }
}

/// Encodes a data pkt-line: `n+4` as 4 lowercase hex digits, then the payload.
pub fn encode_data(payload: &[u8]) -> Vec<u8> {
    assert!(
        payload.len() <= MAX_PAYLOAD,
        "pkt-line payload exceeds {MAX_PAYLOAD} bytes"
    );
    let mut out = Vec::with_capacity(payload.len() + 4);
    out.extend_from_slice(format!("{:04x}", payload.len() + 4).as_bytes());
    out.extend_from_slice(payload);
    out
}

pub fn encode_flush() -> Vec<u8> {
    encode(&PktLine::Flush)
}

pub fn encode_delim() -> Vec<u8> {
    encode(&PktLine::Delim)
}

pub fn encode_response_end() -> Vec<u8> {
    encode(&PktLine::ResponseEnd)
}

/// Encodes a full sequence of chunks back-to-back, coalescing adjacent
/// identical-typed data chunks is *not* performed here (that's an allowed, not
/// required, optimisation per spec.md §4.2) — every chunk becomes its own line.
pub fn encode_all<'a>(lines: impl IntoIterator<Item = &'a PktLine>) -> Vec<u8> {
    let mut out = Vec::new();
    for line in lines {
        out.extend(encode(line));
    }
    out
}

/// Reads one pkt-line from the front of `buf`, advancing it past the line.
/// Returns `Ok(None)` when `buf` is empty (clean end of stream between frames).
pub fn decode_one(buf: &mut Bytes) -> Result<Option<PktLine>> {
    if buf.is_empty() {
        return Ok(None);
    }
    if buf.len() < 4 {
        return Err(Error::invalid_argument("truncated pkt-line length prefix"));
    }
    let len_hex = std::str::from_utf8(&buf[..4])
        .map_err(|_| Error::invalid_argument("pkt-line length prefix is not ASCII"))?;
    let len = usize::from_str_radix(len_hex, 16)
        .map_err(|_| Error::invalid_argument("pkt-line length prefix is not hex"))?;

    match len {
        0 => {
            buf.advance(4);
            Ok(Some(PktLine::Flush))
        }
        1 => {
            buf.advance(4);
            Ok(Some(PktLine::Delim))
        }
        2 => {
            buf.advance(4);
            Ok(Some(PktLine::ResponseEnd))
        }
        3 => Err(Error::invalid_argument("reserved pkt-line length 0003")),
        len if len < 4 => Err(Error::invalid_argument("pkt-line length below minimum")),
        len if len - 4 > MAX_PAYLOAD => Err(Error::invalid_argument(format!(
            "pkt-line payload of {} bytes exceeds the {MAX_PAYLOAD} byte limit",
            len - 4
        ))),
        len => {
            if buf.len() < len {
                return Err(Error::invalid_argument("truncated pkt-line payload"));
            }
            buf.advance(4);
            let payload = buf.split_to(len - 4);
            Ok(Some(PktLine::Data(payload)))
        }
    }
}

/// Reads pkt-lines from `buf` until (and including) a flush packet, per
/// spec.md §4.2 "Decode a command". Errors: malformed length prefix, truncated
/// payload, missing flush — all `InvalidArgument`.
pub fn decode_until_flush(buf: &mut Bytes) -> Result<Vec<PktLine>> {
    let mut lines = Vec::new();
    loop {
        match decode_one(buf)? {
            None => {
                return Err(Error::invalid_argument(
                    "pkt-line stream ended before a flush packet",
                ))
            }
            Some(PktLine::Flush) => {
                lines.push(PktLine::Flush);
                return Ok(lines);
            }
            Some(line) => lines.push(line),
        }
    }
}

/// Decodes every pkt-line remaining in `buf` (no flush required at the end).
/// Used for responses, where delim and response-end packets may also appear.
pub fn decode_all(mut buf: Bytes) -> Result<Vec<PktLine>> {
    let mut lines = Vec::new();
    while let Some(line) = decode_one(&mut buf)? {
        lines.push(line);
    }
    Ok(lines)
}

/// State threaded through [`decode_response_stream`]'s `unfold`.
struct ResponseDecoderState<S> {
    body: S,
    buf: bytes::BytesMut,
    done: bool,
}

/// Lazily decodes a byte stream into pkt-lines (spec.md §4.2 "Decode a response
/// stream"). Consumes `body` chunk by chunk, only buffering enough to assemble
/// full lines, and yields one `Result<PktLine>` at a time so a caller can start
/// forwarding a response before it has been read in full.
pub fn decode_response_stream<S, E>(body: S) -> impl futures_util::Stream<Item = Result<PktLine>>
where
    S: futures_util::Stream<Item = std::result::Result<Bytes, E>> + Unpin,
    E: std::error::Error + Send + Sync + 'static,
{
    use futures_util::StreamExt;

    let state = ResponseDecoderState {
        body,
        buf: bytes::BytesMut::new(),
        done: false,
    };

    futures_util::stream::unfold(state, |mut state| async move {
        loop {
            if !state.buf.is_empty() {
                let mut frozen = state.buf.clone().freeze();
                match decode_one(&mut frozen) {
                    Ok(Some(line)) => {
                        let consumed = state.buf.len() - frozen.len();
                        state.buf.advance(consumed);
                        return Some((Ok(line), state));
                    }
                    Ok(None) => {}
                    Err(e) => {
                        if state.done {
                            state.buf.clear();
                            return Some((Err(e), state));
                        }
                        // Might just be a short read; fall through and pull more.
                    }
                }
            }
            if state.done {
                return None;
            }
            match state.body.next().await {
                Some(Ok(chunk)) => state.buf.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    state.done = true;
                    return Some((Err(Error::internal(anyhow::Error::new(e))), state));
                }
                None => state.done = true,
            }
        }
    })
}
