//! Wire framing
//!
//! Every frame starts with the protocol version byte `'2'` and a code byte:
//!
//! ```text
//! Window      '2' 'W' <u32 count>
//! Data        '2' 'J' <u32 seq> <u32 len> <payload>
//! Compressed  '2' 'C' <u32 len> <zlib(Data frames...)>
//! Ack         '2' 'A' <u32 cumulative count>
//! ```
//!
//! All integers are big-endian. Sequence numbers start at 1 in every round
//! and an ack carries the highest sequence received so far.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use std::io::{self, Read, Write};
use thiserror::Error;
use toimitus_core::OutputError;

pub const VERSION: u8 = b'2';
pub const CODE_WINDOW: u8 = b'W';
pub const CODE_DATA: u8 = b'J';
pub const CODE_COMPRESSED: u8 = b'C';
pub const CODE_ACK: u8 = b'A';

/// Size of an ack frame on the wire
pub const ACK_FRAME_LEN: usize = 6;

/// Largest length prefix accepted when decoding
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

const HEADER_LEN: usize = 2;

/// Decoding failure
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("unsupported protocol version {0:#04x}")]
    Version(u8),

    #[error("unknown frame code {0:#04x}")]
    UnknownCode(u8),

    #[error("frame length {0} exceeds limit")]
    TooLarge(usize),

    #[error("expected ack frame, got code {0:#04x}")]
    NotAck(u8),

    #[error("{0} trailing bytes do not form a frame")]
    Truncated(usize),

    #[error("zlib: {0}")]
    Compression(#[from] io::Error),
}

impl From<FrameError> for OutputError {
    fn from(err: FrameError) -> Self {
        OutputError::Protocol(err.to_string())
    }
}

/// A decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Window(u32),
    Data { seq: u32, payload: Bytes },
    /// Inflated contents of a compressed frame, itself a run of frames
    Compressed(Bytes),
    Ack(u32),
}

pub fn encode_window(buf: &mut BytesMut, count: u32) {
    buf.reserve(HEADER_LEN + 4);
    buf.put_u8(VERSION);
    buf.put_u8(CODE_WINDOW);
    buf.put_u32(count);
}

pub fn encode_data(buf: &mut BytesMut, seq: u32, payload: &[u8]) {
    buf.reserve(HEADER_LEN + 8 + payload.len());
    buf.put_u8(VERSION);
    buf.put_u8(CODE_DATA);
    buf.put_u32(seq);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
}

pub fn encode_ack(buf: &mut BytesMut, seq: u32) {
    buf.reserve(ACK_FRAME_LEN);
    buf.put_u8(VERSION);
    buf.put_u8(CODE_ACK);
    buf.put_u32(seq);
}

/// Wrap already-encoded data frames into one compressed frame
pub fn encode_compressed(buf: &mut BytesMut, frames: &[u8], level: u32) -> io::Result<()> {
    let mut encoder = ZlibEncoder::new(
        Vec::with_capacity(frames.len() / 2),
        Compression::new(level.min(9)),
    );
    encoder.write_all(frames)?;
    let compressed = encoder.finish()?;

    buf.reserve(HEADER_LEN + 4 + compressed.len());
    buf.put_u8(VERSION);
    buf.put_u8(CODE_COMPRESSED);
    buf.put_u32(compressed.len() as u32);
    buf.put_slice(&compressed);
    Ok(())
}

/// Encode one round: the window announcement followed by the payload
///
/// `compression` of `None` (or level 0) sends plain data frames.
pub fn encode_round(payloads: &[Bytes], compression: Option<u32>) -> io::Result<BytesMut> {
    let data_len: usize = payloads.iter().map(|p| HEADER_LEN + 8 + p.len()).sum();

    let mut data = BytesMut::with_capacity(data_len);
    for (i, payload) in payloads.iter().enumerate() {
        encode_data(&mut data, i as u32 + 1, payload);
    }

    let mut out = BytesMut::with_capacity(HEADER_LEN + 4 + data_len);
    encode_window(&mut out, payloads.len() as u32);
    match compression {
        Some(level) if level > 0 => encode_compressed(&mut out, &data, level)?,
        _ => out.unsplit(data),
    }
    Ok(out)
}

/// Parse a 6-byte ack frame
pub fn decode_ack(raw: &[u8; ACK_FRAME_LEN]) -> Result<u32, FrameError> {
    if raw[0] != VERSION {
        return Err(FrameError::Version(raw[0]));
    }
    if raw[1] != CODE_ACK {
        return Err(FrameError::NotAck(raw[1]));
    }
    Ok(u32::from_be_bytes([raw[2], raw[3], raw[4], raw[5]]))
}

/// Decode one frame from the front of `buf`
///
/// Returns `Ok(None)` when more bytes are needed; nothing is consumed in
/// that case.
pub fn decode(buf: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }
    if buf[0] != VERSION {
        return Err(FrameError::Version(buf[0]));
    }

    let code = buf[1];
    let body = &buf[HEADER_LEN..];
    match code {
        CODE_WINDOW | CODE_ACK => {
            if body.len() < 4 {
                return Ok(None);
            }
            buf.advance(HEADER_LEN);
            let value = buf.get_u32();
            Ok(Some(if code == CODE_WINDOW {
                Frame::Window(value)
            } else {
                Frame::Ack(value)
            }))
        }
        CODE_DATA => {
            if body.len() < 8 {
                return Ok(None);
            }
            let len = u32::from_be_bytes([body[4], body[5], body[6], body[7]]) as usize;
            if len > MAX_FRAME_LEN {
                return Err(FrameError::TooLarge(len));
            }
            if body.len() < 8 + len {
                return Ok(None);
            }
            buf.advance(HEADER_LEN);
            let seq = buf.get_u32();
            buf.advance(4);
            let payload = buf.split_to(len).freeze();
            Ok(Some(Frame::Data { seq, payload }))
        }
        CODE_COMPRESSED => {
            if body.len() < 4 {
                return Ok(None);
            }
            let len = u32::from_be_bytes([body[0], body[1], body[2], body[3]]) as usize;
            if len > MAX_FRAME_LEN {
                return Err(FrameError::TooLarge(len));
            }
            if body.len() < 4 + len {
                return Ok(None);
            }
            buf.advance(HEADER_LEN + 4);
            let compressed = buf.split_to(len);
            let mut inflated = Vec::new();
            ZlibDecoder::new(compressed.as_ref())
                .take(MAX_FRAME_LEN as u64 + 1)
                .read_to_end(&mut inflated)?;
            if inflated.len() > MAX_FRAME_LEN {
                return Err(FrameError::TooLarge(inflated.len()));
            }
            Ok(Some(Frame::Compressed(Bytes::from(inflated))))
        }
        other => Err(FrameError::UnknownCode(other)),
    }
}

/// Decode a complete buffer into frames
///
/// Trailing bytes that do not form a whole frame are an error.
pub fn decode_all(bytes: &[u8]) -> Result<Vec<Frame>, FrameError> {
    let mut buf = BytesMut::from(bytes);
    let mut frames = Vec::new();
    while let Some(frame) = decode(&mut buf)? {
        frames.push(frame);
    }
    if !buf.is_empty() {
        return Err(FrameError::Truncated(buf.len()));
    }
    Ok(frames)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn window_frame_layout() {
        let mut buf = BytesMut::new();
        encode_window(&mut buf, 258);
        assert_eq!(buf.as_ref(), &[b'2', b'W', 0, 0, 1, 2]);
    }

    #[test]
    fn data_frame_layout() {
        let mut buf = BytesMut::new();
        encode_data(&mut buf, 1, b"{}");
        assert_eq!(buf.as_ref(), &[b'2', b'J', 0, 0, 0, 1, 0, 0, 0, 2, b'{', b'}']);
    }

    #[test]
    fn ack_frame_is_six_bytes() {
        let mut buf = BytesMut::new();
        encode_ack(&mut buf, 7);
        assert_eq!(buf.len(), ACK_FRAME_LEN);

        let raw: [u8; ACK_FRAME_LEN] = buf.as_ref().try_into().unwrap();
        assert_eq!(decode_ack(&raw).unwrap(), 7);
    }

    #[test]
    fn decode_ack_rejects_garbage() {
        assert!(matches!(
            decode_ack(&[b'1', b'A', 0, 0, 0, 1]),
            Err(FrameError::Version(b'1'))
        ));
        assert!(matches!(
            decode_ack(&[b'2', b'W', 0, 0, 0, 1]),
            Err(FrameError::NotAck(b'W'))
        ));
    }

    #[test]
    fn plain_round_numbers_sequences_from_one() {
        let payloads = vec![Bytes::from_static(b"a"), Bytes::from_static(b"bc")];
        let round = encode_round(&payloads, None).unwrap();

        let frames = decode_all(&round).unwrap();
        assert_eq!(
            frames,
            vec![
                Frame::Window(2),
                Frame::Data {
                    seq: 1,
                    payload: Bytes::from_static(b"a")
                },
                Frame::Data {
                    seq: 2,
                    payload: Bytes::from_static(b"bc")
                },
            ]
        );
    }

    #[test]
    fn compressed_round_inflates_to_data_frames() {
        let payloads: Vec<Bytes> = (0..50)
            .map(|i| Bytes::from(format!("{{\"message\":\"event {i}\"}}")))
            .collect();
        let plain = encode_round(&payloads, None).unwrap();
        let compressed = encode_round(&payloads, Some(6)).unwrap();
        assert!(compressed.len() < plain.len());

        let frames = decode_all(&compressed).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], Frame::Window(50));
        let Frame::Compressed(inner) = &frames[1] else {
            panic!("expected compressed frame, got {:?}", frames[1]);
        };

        let inner = decode_all(inner).unwrap();
        assert_eq!(inner.len(), 50);
        assert_eq!(
            inner[49],
            Frame::Data {
                seq: 50,
                payload: payloads[49].clone()
            }
        );
    }

    #[test]
    fn level_zero_means_plain() {
        let payloads = vec![Bytes::from_static(b"x")];
        let round = encode_round(&payloads, Some(0)).unwrap();
        assert_eq!(round[7], CODE_DATA);
    }

    #[test]
    fn partial_input_needs_more_bytes() {
        let mut full = BytesMut::new();
        encode_data(&mut full, 1, b"hello");

        for cut in 0..full.len() {
            let mut partial = BytesMut::from(&full[..cut]);
            assert!(decode(&mut partial).unwrap().is_none());
            assert_eq!(partial.len(), cut);
        }
    }

    #[test]
    fn decode_all_rejects_truncated_tail() {
        let mut buf = BytesMut::new();
        encode_window(&mut buf, 1);
        encode_data(&mut buf, 1, b"abc");
        let cut = &buf[..buf.len() - 1];
        assert!(matches!(decode_all(cut), Err(FrameError::Truncated(_))));
    }

    #[test]
    fn unknown_code_is_rejected() {
        let mut buf = BytesMut::from(&[b'2', b'Z', 0, 0][..]);
        assert!(matches!(decode(&mut buf), Err(FrameError::UnknownCode(b'Z'))));
    }

    #[test]
    fn oversized_length_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(VERSION);
        buf.put_u8(CODE_DATA);
        buf.put_u32(1);
        buf.put_u32(u32::MAX);
        assert!(matches!(decode(&mut buf), Err(FrameError::TooLarge(_))));
    }

    #[test]
    fn frame_error_is_protocol_error() {
        let err: OutputError = FrameError::UnknownCode(b'Q').into();
        assert!(matches!(err, OutputError::Protocol(_)));
    }
}
