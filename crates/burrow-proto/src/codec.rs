//! Codec for encoding/decoding control-channel frames

use crate::frames::Frame;
use thiserror::Error;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),
}

/// Frame codec
///
/// The transport is message-oriented, so no length delimiting happens here;
/// the codec serializes one frame per message and enforces the size bound.
pub struct FrameCodec;

impl FrameCodec {
    /// Maximum encoded frame size (4 MiB).
    ///
    /// Base64 expansion is included in the bound; a frame this large already
    /// means a misbehaving agent, not legitimate traffic.
    pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

    /// Encode a frame to its wire representation.
    pub fn encode(frame: &Frame) -> Result<String, CodecError> {
        let text = serde_json::to_string(frame)?;

        if text.len() > Self::MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(text.len()));
        }

        Ok(text)
    }

    /// Decode a single frame from a wire message.
    ///
    /// Unknown fields are ignored; a missing required field or unknown
    /// `type` tag fails the frame. Failures are recoverable at the session
    /// layer (the frame is dropped, the channel survives).
    pub fn decode(text: &str) -> Result<Frame, CodecError> {
        if text.len() > Self::MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(text.len()));
        }

        Ok(serde_json::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::RequestId;

    #[test]
    fn test_encode_decode_round_trip() {
        let frame = Frame::End {
            request_id: RequestId::generate(),
        };

        let text = FrameCodec::encode(&frame).unwrap();
        let decoded = FrameCodec::decode(&text).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_decode_malformed_json() {
        assert!(FrameCodec::decode("{not json").is_err());
    }

    #[test]
    fn test_decode_missing_type_tag() {
        assert!(FrameCodec::decode(r#"{"token": "T"}"#).is_err());
    }

    #[test]
    fn test_encode_oversize_frame() {
        let frame = Frame::Data {
            request_id: RequestId::generate(),
            data: vec![0u8; FrameCodec::MAX_FRAME_SIZE],
        };

        let result = FrameCodec::encode(&frame);
        assert!(matches!(result, Err(CodecError::FrameTooLarge(_))));
    }

    #[test]
    fn test_decode_oversize_frame() {
        let text = format!(
            r#"{{"type": "data", "requestId": "aa", "data": "{}"}}"#,
            "A".repeat(FrameCodec::MAX_FRAME_SIZE)
        );
        let result = FrameCodec::decode(&text);
        assert!(matches!(result, Err(CodecError::FrameTooLarge(_))));
    }

    #[test]
    fn test_decode_agent_auth_literal() {
        let frame = FrameCodec::decode(r#"{"type":"auth","token":"T"}"#).unwrap();
        assert_eq!(
            frame,
            Frame::Auth {
                token: "T".to_string()
            }
        );
    }
}
