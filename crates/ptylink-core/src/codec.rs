//! PTC1 framing for terminal output frames and base64 transport helpers.
//!
//! Wire format: `["PTC1"][2-byte big-endian id length][session id][payload]`
//!
//! Binary frames that do not start with the sentinel are untagged output
//! for the currently bound session.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::error::{PtyError, PtyResult};

/// Frame sentinel: "PTC1" in ASCII.
pub const PTC1_SENTINEL: [u8; 4] = *b"PTC1";

const HEADER_LEN: usize = 6;

/// A decoded output frame borrowing from the wire buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedFrame<'a> {
    /// Session the payload belongs to; `None` for untagged frames.
    pub session_id: Option<&'a str>,
    pub payload: &'a [u8],
}

/// Wrap terminal output in a PTC1 frame tagged with `session_id`.
pub fn frame_encode(session_id: &str, payload: &[u8]) -> PtyResult<Vec<u8>> {
    let id = session_id.as_bytes();
    let id_len = u16::try_from(id.len()).map_err(|_| {
        PtyError::Codec(format!("session id too long for PTC1 frame: {} bytes", id.len()))
    })?;

    let mut frame = Vec::with_capacity(HEADER_LEN + id.len() + payload.len());
    frame.extend_from_slice(&PTC1_SENTINEL);
    frame.extend_from_slice(&id_len.to_be_bytes());
    frame.extend_from_slice(id);
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Split a binary frame into its session tag and payload.
pub fn frame_decode(data: &[u8]) -> PtyResult<DecodedFrame<'_>> {
    if data.len() < PTC1_SENTINEL.len() || data[..4] != PTC1_SENTINEL {
        return Ok(DecodedFrame {
            session_id: None,
            payload: data,
        });
    }
    if data.len() < HEADER_LEN {
        return Err(PtyError::Codec("truncated PTC1 header".into()));
    }

    let id_len = u16::from_be_bytes([data[4], data[5]]) as usize;
    if data.len() < HEADER_LEN + id_len {
        return Err(PtyError::Codec(format!(
            "PTC1 frame declares {id_len}-byte session id but only {} bytes follow",
            data.len() - HEADER_LEN
        )));
    }

    let id = std::str::from_utf8(&data[HEADER_LEN..HEADER_LEN + id_len])
        .map_err(|e| PtyError::Codec(format!("PTC1 session id is not UTF-8: {e}")))?;

    Ok(DecodedFrame {
        session_id: Some(id),
        payload: &data[HEADER_LEN + id_len..],
    })
}

/// Encode raw bytes for the JSON control channel.
pub fn encode_base64(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// Decode bytes received over the JSON control channel.
pub fn decode_base64(data: &str) -> PtyResult<Vec<u8>> {
    Ok(STANDARD.decode(data)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tagged_frame_layout() {
        let frame = frame_encode("job-42", b"hello").unwrap();
        assert_eq!(&frame[..4], b"PTC1");
        assert_eq!(&frame[4..6], &[0, 6]);
        assert_eq!(&frame[6..12], b"job-42");
        assert_eq!(&frame[12..], b"hello");

        let decoded = frame_decode(&frame).unwrap();
        assert_eq!(decoded.session_id, Some("job-42"));
        assert_eq!(decoded.payload, b"hello");
    }

    #[test]
    fn untagged_frame_passes_through() {
        let decoded = frame_decode(b"\x1b[2J$ ").unwrap();
        assert_eq!(decoded.session_id, None);
        assert_eq!(decoded.payload, b"\x1b[2J$ ");
    }

    #[test]
    fn empty_payload_is_allowed() {
        let frame = frame_encode("s", b"").unwrap();
        let decoded = frame_decode(&frame).unwrap();
        assert_eq!(decoded.session_id, Some("s"));
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn truncated_frames_are_rejected() {
        assert!(frame_decode(b"PTC1\x00").is_err());
        assert!(frame_decode(b"PTC1\x00\x09short").is_err());
    }

    #[test]
    fn non_utf8_session_id_is_rejected() {
        assert!(frame_decode(b"PTC1\x00\x02\xff\xfeabc").is_err());
    }

    #[test]
    fn base64_preserves_every_byte() {
        let all: Vec<u8> = (0..=255u8).collect();
        let encoded = encode_base64(&all);
        assert_eq!(decode_base64(&encoded).unwrap(), all);
    }

    #[test]
    fn invalid_base64_is_codec_error() {
        assert!(matches!(decode_base64("@@@"), Err(PtyError::Codec(_))));
    }
}
