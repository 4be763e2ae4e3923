//! Client-facing WebSocket protocol: the binary audio-frame envelope and
//! the JSON control/status messages exchanged over text frames.

use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

/// Metadata preceding raw PCM in a binary audio frame.
#[derive(Debug, Clone, Deserialize)]
pub struct AudioFrameMetadata {
    #[serde(rename = "sampleRate")]
    pub sample_rate: u32,
    #[serde(default, rename = "channels")]
    pub channels: Option<u8>,
    #[serde(default, rename = "bitsPerSample")]
    pub bits_per_sample: Option<u8>,
}

/// A parsed binary audio frame: `[u32 LE metadata_length][UTF-8 JSON metadata][raw PCM bytes]`.
pub struct AudioFrame {
    pub metadata: AudioFrameMetadata,
    pub pcm: Vec<u8>,
}

impl AudioFrame {
    pub fn parse(bytes: &[u8]) -> Result<Self, GatewayError> {
        if bytes.len() < 4 {
            return Err(GatewayError::Protocol("binary frame shorter than length prefix".to_string()));
        }
        let metadata_length = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        let rest = &bytes[4..];
        if rest.len() < metadata_length {
            return Err(GatewayError::Protocol("binary frame metadata length exceeds payload".to_string()));
        }
        let metadata_bytes = &rest[..metadata_length];
        let pcm = rest[metadata_length..].to_vec();

        let metadata_str = std::str::from_utf8(metadata_bytes)
            .map_err(|e| GatewayError::Protocol(format!("frame metadata was not UTF-8: {e}")))?;
        let metadata: AudioFrameMetadata = serde_json::from_str(metadata_str)
            .map_err(|e| GatewayError::Protocol(format!("malformed frame metadata: {e}")))?;

        Ok(Self { metadata, pcm })
    }
}

/// Text-frame control messages a client may send.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientControlMessage {
    SetLangs {
        source_language: String,
        target_language: String,
    },
    GetStatus,
    StartOver,
}

impl ClientControlMessage {
    pub fn parse(text: &str) -> Result<Self, GatewayError> {
        serde_json::from_str(text).map_err(|e| GatewayError::Protocol(format!("malformed control message: {e}")))
    }
}

/// JSON messages the gateway sends to a connected client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Status {
        client_id: String,
        source_language: String,
        target_language: String,
        translation_enabled: bool,
    },
    Realtime {
        text: String,
        translation: String,
        segment_id: String,
        processing_time: f64,
    },
    UtteranceEnd {
        client_id: String,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("ServerMessage always serializes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_frame(metadata_json: &str, pcm: &[u8]) -> Vec<u8> {
        let metadata_bytes = metadata_json.as_bytes();
        let mut frame = (metadata_bytes.len() as u32).to_le_bytes().to_vec();
        frame.extend_from_slice(metadata_bytes);
        frame.extend_from_slice(pcm);
        frame
    }

    #[test]
    fn parses_well_formed_audio_frame() {
        let frame = build_frame(r#"{"sampleRate":16000}"#, &[1, 2, 3, 4]);
        let parsed = AudioFrame::parse(&frame).unwrap();
        assert_eq!(parsed.metadata.sample_rate, 16_000);
        assert_eq!(parsed.pcm, vec![1, 2, 3, 4]);
    }

    #[test]
    fn rejects_frame_shorter_than_length_prefix() {
        assert!(AudioFrame::parse(&[0, 0]).is_err());
    }

    #[test]
    fn rejects_metadata_length_exceeding_payload() {
        let mut frame = 100u32.to_le_bytes().to_vec();
        frame.extend_from_slice(b"{}");
        assert!(AudioFrame::parse(&frame).is_err());
    }

    #[test]
    fn parses_set_langs_control_message() {
        let msg = ClientControlMessage::parse(
            r#"{"type":"set_langs","source_language":"en","target_language":"vi"}"#,
        )
        .unwrap();
        assert!(matches!(msg, ClientControlMessage::SetLangs { .. }));
    }

    #[test]
    fn parses_start_over_control_message() {
        let msg = ClientControlMessage::parse(r#"{"type":"start_over"}"#).unwrap();
        assert!(matches!(msg, ClientControlMessage::StartOver));
    }

    #[test]
    fn server_status_message_serializes_with_tag() {
        let msg = ServerMessage::Status {
            client_id: "c1".to_string(),
            source_language: "en".to_string(),
            target_language: "en".to_string(),
            translation_enabled: false,
        };
        let json = String::from_utf8(msg.to_bytes()).unwrap();
        assert!(json.contains("\"type\":\"status\""));
    }
}
