//! Precomputed permessage-deflate WebSocket frame codec.
//!
//! Builds a single ready-to-write frame (header + deflated payload) for
//! peers that negotiated `permessage-deflate; server_no_context_takeover;
//! client_no_context_takeover`. One compressor is shared across all
//! messages: `server_no_context_takeover` means the compression context is
//! reset with a full flush at the end of every frame anyway, so reusing the
//! `Compress` instance costs nothing and avoids a per-connection context.

use std::sync::Mutex;

use flate2::{Compress, Compression, FlushCompress, Status};

use crate::{Error, Result};

/// WebSocket opcode for the payload being framed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Text,
    Binary,
}

/// Shared, single-threaded-by-lock deflate compressor plus frame encoder.
pub struct FrameCodec {
    compress: Mutex<Compress>,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            compress: Mutex::new(Compress::new(Compression::default(), false)),
        }
    }

    /// Deflates `payload` with a full-flush boundary and wraps it in a
    /// single `FIN=1, RSV0=1, MASK=0` frame, per RFC 7692.
    pub fn compressed_frame(&self, opcode: Opcode, payload: &[u8]) -> Result<Vec<u8>> {
        let mut compress = self.compress.lock().expect("compressor mutex poisoned");
        let deflated = deflate(&mut compress, payload)?;
        Ok(encode_frame(opcode, &deflated, true))
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Frames `payload` with no compression, for peers that did not negotiate
/// `permessage-deflate`.
pub fn uncompressed_frame(opcode: Opcode, payload: &[u8]) -> Vec<u8> {
    encode_frame(opcode, payload, false)
}

/// A complete, empty PING control frame: `FIN=1`, opcode `0x9`, zero-length
/// payload, unmasked (server-to-client frames are never masked).
pub const PING_FRAME: [u8; 2] = [0x89, 0x00];

/// A complete, empty CLOSE control frame, written to a peer being shed
/// during quiesce (spec.md §4.6 step 4).
pub const CLOSE_FRAME: [u8; 2] = [0x88, 0x00];

/// zlib's `deflateBound`: the largest a deflate stream can possibly grow an
/// input of `len` bytes, for an uncompressible payload. `compress_vec` only
/// ever writes into a `Vec`'s existing spare capacity — it never reallocates
/// — so under-sizing this silently truncates the stream instead of erroring.
fn deflate_bound(len: usize) -> usize {
    len + (len >> 12) + (len >> 14) + (len >> 25) + 13
}

fn deflate(compress: &mut Compress, payload: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(deflate_bound(payload.len()));
    let mut consumed = 0usize;

    loop {
        let before_in = compress.total_in();
        let status = compress
            .compress_vec(&payload[consumed..], &mut out, FlushCompress::Full)
            .map_err(|_| Error::Compression("deflate stream error"))?;
        consumed += (compress.total_in() - before_in) as usize;

        if consumed >= payload.len() {
            break;
        }
        match status {
            // the spare capacity in `out` ran out before all of `payload`
            // was consumed; grow it and feed the remainder through.
            Status::Ok | Status::BufError => out.reserve(out.capacity().max(1024)),
            Status::StreamEnd => break,
        }
    }

    // RFC 7692: a full-flush block at the end of a message always ends in
    // the four-byte empty-block marker 00 00 FF FF; strip it.
    if out.ends_with(&[0x00, 0x00, 0xff, 0xff]) {
        out.truncate(out.len() - 4);
    }
    Ok(out)
}

const RSV0_COMPRESSED: u8 = 0x40;
const FIN: u8 = 0x80;

fn encode_frame(opcode: Opcode, payload: &[u8], compressed: bool) -> Vec<u8> {
    let opcode_bits: u8 = match opcode {
        Opcode::Text => 0x1,
        Opcode::Binary => 0x2,
    };

    let mut byte0 = FIN | opcode_bits;
    if compressed {
        byte0 |= RSV0_COMPRESSED;
    }

    let mut frame = Vec::with_capacity(payload.len() + 10);
    frame.push(byte0);

    let len = payload.len();
    if len <= 125 {
        frame.push(len as u8);
    } else if len <= 0xFFFF {
        frame.push(126);
        frame.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        frame.push(127);
        frame.extend_from_slice(&(len as u64).to_be_bytes());
    }

    frame.extend_from_slice(payload);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Decompress;

    fn inflate(payload: &[u8]) -> Vec<u8> {
        let mut decompress = Decompress::new(false);
        let input = {
            let mut input = payload.to_vec();
            input.extend_from_slice(&[0x00, 0x00, 0xff, 0xff]);
            input
        };

        // `decompress_vec` only ever writes into `out`'s existing spare
        // capacity, same as `compress_vec` in `deflate` above, so this grows
        // until the whole stream is consumed instead of guessing a size up
        // front.
        let mut out = Vec::with_capacity(input.len() * 4);
        let mut consumed = 0usize;
        loop {
            let before_in = decompress.total_in();
            decompress
                .decompress_vec(&input[consumed..], &mut out, flate2::FlushDecompress::Sync)
                .unwrap();
            consumed += (decompress.total_in() - before_in) as usize;
            if consumed >= input.len() {
                break;
            }
            out.reserve(out.capacity().max(1024));
        }
        out
    }

    #[test]
    fn frame_header_marks_fin_and_rsv0() {
        let codec = FrameCodec::new();
        let payload = vec![b'x'; 2000];
        let frame = codec.compressed_frame(Opcode::Text, &payload).unwrap();

        assert_eq!(frame[0] & FIN, FIN);
        assert_eq!(frame[0] & RSV0_COMPRESSED, RSV0_COMPRESSED);
        assert_eq!(frame[0] & 0x0f, 0x1);
    }

    #[test]
    fn compressed_payload_round_trips() {
        let codec = FrameCodec::new();
        let payload = b"a".repeat(2000);
        let frame = codec.compressed_frame(Opcode::Binary, &payload).unwrap();

        // skip the variable-length header to reach the deflated body
        let header_len = if payload.len() <= 125 {
            2
        } else if payload.len() <= 0xFFFF {
            4
        } else {
            10
        };
        let body = &frame[header_len..];
        assert_eq!(inflate(body), payload);
    }

    #[test]
    fn incompressible_payload_is_not_truncated() {
        let codec = FrameCodec::new();
        // Deterministic pseudo-random bytes: deflate cannot shrink these, so
        // the compressed output lands slightly above `payload.len()`. A
        // buffer sized to exactly `payload.len()` silently truncates the
        // stream here, dropping the trailing `00 00 ff ff` flush marker.
        let mut state: u32 = 0xC0FFEE;
        let payload: Vec<u8> = (0..2000)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                (state & 0xff) as u8
            })
            .collect();

        let frame = codec.compressed_frame(Opcode::Binary, &payload).unwrap();
        let header_len = if payload.len() <= 125 {
            2
        } else if payload.len() <= 0xFFFF {
            4
        } else {
            10
        };
        let body = &frame[header_len..];
        assert_eq!(inflate(body), payload);
    }

    #[test]
    fn reused_compressor_resets_context_per_frame() {
        let codec = FrameCodec::new();
        let payload = b"repeat-me ".repeat(200);
        let first = codec.compressed_frame(Opcode::Text, &payload).unwrap();
        let second = codec.compressed_frame(Opcode::Text, &payload).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn uncompressed_frame_carries_rsv0_clear() {
        let frame = uncompressed_frame(Opcode::Text, b"hello");
        assert_eq!(frame[0] & RSV0_COMPRESSED, 0);
        assert_eq!(&frame[2..], b"hello");
    }

    #[test]
    fn ping_frame_is_fin_opcode_9_zero_length() {
        assert_eq!(PING_FRAME, [0x89, 0x00]);
    }

    #[test]
    fn close_frame_is_fin_opcode_8_zero_length() {
        assert_eq!(CLOSE_FRAME, [0x88, 0x00]);
    }
}
