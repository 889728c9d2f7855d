//! Binary frame codec
//!
//! Wire layout, all multi-byte fields big-endian:
//!
//! ```text
//! [ver u8][seq u32][ts_hi u32][ts_lo u32][codec_len u8][codec][topic_len u8][topic][payload]
//! ```
//!
//! The 64-bit millisecond timestamp travels as two u32 halves. Codec tag and
//! topic are length-prefixed UTF-8, each at most 255 bytes, so the header
//! length is fully determined by the two string lengths. Everything after the
//! topic is payload.

use crate::error::{Error, Result};

/// Current wire version
pub const FRAME_VERSION: u8 = 1;

/// Fixed part of the header: version + seq + split timestamp + two length bytes
const FIXED_HEADER_LEN: usize = 1 + 4 + 4 + 4 + 1 + 1;

/// One decoded wire frame
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub version: u8,
    pub seq: u32,
    pub ts_ms: u64,
    pub codec: String,
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Encode a frame.
///
/// Fails only when the topic or codec tag exceeds the 255-byte length prefix.
pub fn encode_frame(
    topic: &str,
    seq: u32,
    ts_ms: u64,
    codec: &str,
    payload: &[u8],
) -> Result<Vec<u8>> {
    let codec_bytes = codec.as_bytes();
    let topic_bytes = topic.as_bytes();
    if codec_bytes.len() > 255 {
        return Err(Error::InvalidFrame("codec tag longer than 255 bytes"));
    }
    if topic_bytes.len() > 255 {
        return Err(Error::InvalidFrame("topic longer than 255 bytes"));
    }

    let mut out =
        Vec::with_capacity(FIXED_HEADER_LEN + codec_bytes.len() + topic_bytes.len() + payload.len());
    out.push(FRAME_VERSION);
    out.extend_from_slice(&seq.to_be_bytes());
    out.extend_from_slice(&((ts_ms >> 32) as u32).to_be_bytes());
    out.extend_from_slice(&(ts_ms as u32).to_be_bytes());
    out.push(codec_bytes.len() as u8);
    out.extend_from_slice(codec_bytes);
    out.push(topic_bytes.len() as u8);
    out.extend_from_slice(topic_bytes);
    out.extend_from_slice(payload);
    Ok(out)
}

/// Decode a frame produced by [`encode_frame`].
///
/// Returns an error on truncated or malformed input; callers drop the frame
/// and keep running.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame> {
    let mut o = 0usize;

    let version = *bytes.first().ok_or(Error::InvalidFrame("empty input"))?;
    o += 1;

    let seq = u32::from_be_bytes(read4(bytes, o)?);
    o += 4;
    let hi = u32::from_be_bytes(read4(bytes, o)?);
    o += 4;
    let lo = u32::from_be_bytes(read4(bytes, o)?);
    o += 4;
    let ts_ms = ((hi as u64) << 32) | lo as u64;

    let (codec, next) = read_string(bytes, o)?;
    o = next;
    let (topic, next) = read_string(bytes, o)?;
    o = next;

    Ok(Frame {
        version,
        seq,
        ts_ms,
        codec,
        topic,
        payload: bytes[o..].to_vec(),
    })
}

fn read4(bytes: &[u8], at: usize) -> Result<[u8; 4]> {
    let slice = bytes
        .get(at..at + 4)
        .ok_or(Error::InvalidFrame("truncated header"))?;
    let mut buf = [0u8; 4];
    buf.copy_from_slice(slice);
    Ok(buf)
}

fn read_string(bytes: &[u8], at: usize) -> Result<(String, usize)> {
    let len = *bytes.get(at).ok_or(Error::InvalidFrame("truncated length"))? as usize;
    let start = at + 1;
    let slice = bytes
        .get(start..start + len)
        .ok_or(Error::InvalidFrame("truncated string"))?;
    let s = std::str::from_utf8(slice)
        .map_err(|_| Error::InvalidFrame("non-UTF-8 string"))?
        .to_string();
    Ok((s, start + len))
}

/// Length of an encoded frame carrying an empty payload
pub fn header_overhead(topic: &str, codec: &str) -> usize {
    FIXED_HEADER_LEN + codec.len().min(255) + topic.len().min(255)
}

/// Payload bytes that fit in one frame on a link with the given MTU.
///
/// Zero means this topic/codec pair cannot be sent on the active profile.
pub fn max_payload_bytes(mtu: usize, topic: &str, codec: &str) -> usize {
    mtu.saturating_sub(header_overhead(topic, codec))
}
