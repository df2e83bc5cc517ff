//! Length-prefixed request payload framing.
//!
//! Every nonstandard payload exchanged with the deployer agent is framed as:
//!
//! ```text
//! uint32 (big-endian) payload length || payload bytes
//! ```
//!
//! The receiver rejects frames whose declared length does not match the
//! actual payload length, so a truncated or concatenated request never
//! reaches the dispatch logic.

use drover_platform::{DroverError, DroverResult};

/// Byte length of the frame header.
pub const HEADER_LEN: usize = 4;

/// Subsystem name hosting the SFTP server on the agent.
pub const SUBSYSTEM_SFTP: &str = "sftp";

/// Subsystem name carrying framed deployer self-update requests.
pub const SUBSYSTEM_UPDATE: &str = "update";

/// Frames `payload` with its big-endian length header.
pub fn frame_payload(payload: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(HEADER_LEN + payload.len());
    framed.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    framed.extend_from_slice(payload);
    framed
}

/// Validates and strips the length header from a framed request.
///
/// # Errors
///
/// Returns [`DroverError::Protocol`] when the frame is shorter than its
/// header or the declared length does not match the payload length.
pub fn strip_payload_header(request: &[u8]) -> DroverResult<&[u8]> {
    if request.len() < HEADER_LEN {
        return Err(DroverError::Protocol(
            "invalid payload length (did the client send anything?)".to_string(),
        ));
    }

    let declared =
        u32::from_be_bytes([request[0], request[1], request[2], request[3]]) as usize;
    if declared + HEADER_LEN != request.len() {
        return Err(DroverError::Protocol(
            "payload length does not match header metadata".to_string(),
        ));
    }

    Ok(&request[HEADER_LEN..])
}

/// Strips the frame header and decodes the payload as UTF-8.
pub fn strip_payload_string(request: &[u8]) -> DroverResult<String> {
    let payload = strip_payload_header(request)?;
    String::from_utf8(payload.to_vec())
        .map_err(|_| DroverError::Protocol("payload is not valid UTF-8".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_round_trip() {
        let framed = frame_payload(b"/tmp/buffer");
        assert_eq!(&framed[..4], &11u32.to_be_bytes());
        assert_eq!(strip_payload_header(&framed).unwrap(), b"/tmp/buffer");
    }

    #[test]
    fn test_frame_empty_payload() {
        let framed = frame_payload(b"");
        assert_eq!(framed, vec![0, 0, 0, 0]);
        assert_eq!(strip_payload_header(&framed).unwrap(), b"");
    }

    #[test]
    fn test_too_short_rejected() {
        let result = strip_payload_header(&[0, 0, 1]);
        assert!(matches!(result, Err(DroverError::Protocol(_))));
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let mut framed = frame_payload(b"abc");
        framed.push(b'x'); // one trailing byte the header does not cover
        let result = strip_payload_header(&framed);
        assert!(matches!(result, Err(DroverError::Protocol(_))));
    }

    #[test]
    fn test_declared_longer_than_actual_rejected() {
        let framed = vec![0, 0, 0, 10, b'a', b'b'];
        assert!(strip_payload_header(&framed).is_err());
    }

    #[test]
    fn test_string_payload() {
        let framed = frame_payload("command arg1 arg2".as_bytes());
        assert_eq!(strip_payload_string(&framed).unwrap(), "command arg1 arg2");
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let framed = frame_payload(&[0xff, 0xfe]);
        assert!(strip_payload_string(&framed).is_err());
    }
}
