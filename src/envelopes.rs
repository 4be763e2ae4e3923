//! Wire envelopes exchanged with workers over Redis: the audio-job stream
//! row, the transcription stream row, and the pub/sub result message.
//! Stream rows are Redis hash fields, so every field is stringly typed on
//! the wire even where the in-process type is numeric or boolean.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

/// One row appended to the audio-jobs stream.
#[derive(Debug, Clone, PartialEq)]
pub struct JobEnvelope {
    pub job_id: String,
    pub client_id: String,
    pub segment_id: String,
    pub audio_bytes_b64: String,
    pub sample_rate: u32,
    pub source_lang: String,
    pub target_lang: String,
    pub translation_enabled: bool,
    pub is_final: bool,
    pub timestamp: f64,
    pub gateway_instance: String,
}

impl JobEnvelope {
    /// Encode as the flat string-to-string map a Redis stream entry expects.
    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            ("job_id".to_string(), self.job_id.clone()),
            ("client_id".to_string(), self.client_id.clone()),
            ("segment_id".to_string(), self.segment_id.clone()),
            ("audio_bytes_b64".to_string(), self.audio_bytes_b64.clone()),
            ("sample_rate".to_string(), self.sample_rate.to_string()),
            ("source_lang".to_string(), self.source_lang.clone()),
            ("target_lang".to_string(), self.target_lang.clone()),
            ("translation_enabled".to_string(), bool_to_wire(self.translation_enabled)),
            ("is_final".to_string(), bool_to_wire(self.is_final)),
            ("timestamp".to_string(), self.timestamp.to_string()),
            ("gateway_instance".to_string(), self.gateway_instance.clone()),
        ]
    }
}

/// A row read from the transcription stream (only appended when translation
/// is enabled for the originating job).
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptionEnvelope {
    pub job_id: String,
    pub client_id: String,
    pub segment_id: String,
    pub text: String,
    pub source_lang: String,
    pub target_lang: String,
    pub is_final: bool,
    pub timestamp: f64,
    pub audio_duration: f64,
}

/// The terminal message published to `results:<client_id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub status: String,
    pub job_id: String,
    pub client_id: String,
    pub segment_id: String,
    pub text: String,
    #[serde(default)]
    pub translation: String,
    pub source_lang: String,
    pub target_lang: String,
    #[serde(deserialize_with = "deserialize_wire_bool", serialize_with = "serialize_wire_bool")]
    pub translation_enabled: bool,
    #[serde(deserialize_with = "deserialize_wire_bool", serialize_with = "serialize_wire_bool")]
    pub is_final: bool,
    #[serde(default)]
    pub processing_time: f64,
    #[serde(default)]
    pub audio_duration: f64,
    #[serde(default)]
    pub worker_id: String,
    pub timestamp: f64,
}

impl ResultEnvelope {
    pub fn parse(bytes: &[u8]) -> Result<Self, GatewayError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| GatewayError::Protocol(format!("result message was not UTF-8: {e}")))?;
        serde_json::from_str(text)
            .map_err(|e| GatewayError::Protocol(format!("malformed result envelope: {e}")))
    }

    /// A result is a *translation result* iff `translation` is non-empty;
    /// otherwise it is an STT-only result.
    pub fn is_translation_result(&self) -> bool {
        !self.translation.is_empty()
    }

    /// Parses `segment_id` as an ordering key. Non-numeric segment ids sort
    /// lowest so they never spuriously unblock forwarding.
    pub fn segment_id_numeric(&self) -> i64 {
        self.segment_id.parse().unwrap_or(i64::MIN)
    }
}

fn bool_to_wire(b: bool) -> String {
    if b { "true".to_string() } else { "false".to_string() }
}

/// Accepts the same loose vocabulary the workers emit: `"true"`, `"1"`,
/// `"yes"`, `"on"` (case-insensitive) are truthy, everything else falsy.
pub fn parse_wire_bool(raw: &str) -> bool {
    matches!(raw.to_lowercase().as_str(), "true" | "1" | "yes" | "on")
}

fn deserialize_wire_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrBool {
        Bool(bool),
        String(String),
    }
    match StringOrBool::deserialize(deserializer)? {
        StringOrBool::Bool(b) => Ok(b),
        StringOrBool::String(s) => Ok(parse_wire_bool(&s)),
    }
}

fn serialize_wire_bool<S>(value: &bool, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(if *value { "true" } else { "false" })
}

/// Decodes a Redis stream entry's field map into a `TranscriptionEnvelope`.
pub fn decode_transcription_envelope(
    fields: &HashMap<String, String>,
) -> Result<TranscriptionEnvelope, GatewayError> {
    let get = |k: &str| fields.get(k).cloned().unwrap_or_default();
    Ok(TranscriptionEnvelope {
        job_id: get("job_id"),
        client_id: get("client_id"),
        segment_id: get("segment_id"),
        text: get("text"),
        source_lang: get("source_lang"),
        target_lang: get("target_lang"),
        is_final: parse_wire_bool(&get("is_final")),
        timestamp: get("timestamp").parse().unwrap_or(0.0),
        audio_duration: get("audio_duration").parse().unwrap_or(0.0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job() -> JobEnvelope {
        JobEnvelope {
            job_id: "client-1_abcd1234".to_string(),
            client_id: "client-1".to_string(),
            segment_id: "1700000000123".to_string(),
            audio_bytes_b64: "AAEC".to_string(),
            sample_rate: 16_000,
            source_lang: "en".to_string(),
            target_lang: "vi".to_string(),
            translation_enabled: true,
            is_final: false,
            timestamp: 1_700_000_000.5,
            gateway_instance: "gw-1".to_string(),
        }
    }

    #[test]
    fn job_envelope_booleans_are_stringly_typed_on_the_wire() {
        let fields = sample_job().to_fields();
        let map: HashMap<_, _> = fields.into_iter().collect();
        assert_eq!(map.get("translation_enabled").unwrap(), "true");
        assert_eq!(map.get("is_final").unwrap(), "false");
    }

    #[test]
    fn parse_wire_bool_accepts_loose_vocabulary() {
        for truthy in ["true", "TRUE", "1", "yes", "On"] {
            assert!(parse_wire_bool(truthy), "{truthy} should be truthy");
        }
        for falsy in ["false", "0", "no", "", "garbage"] {
            assert!(!parse_wire_bool(falsy), "{falsy} should be falsy");
        }
    }

    #[test]
    fn result_envelope_round_trips_through_json() {
        let json = r#"{
            "status":"ok","job_id":"j1","client_id":"c1","segment_id":"42",
            "text":"hello","translation":"","source_lang":"en","target_lang":"en",
            "translation_enabled":"false","is_final":"true","processing_time":0.2,
            "audio_duration":1.1,"worker_id":"w1","timestamp":1700000000.0
        }"#;
        let result = ResultEnvelope::parse(json.as_bytes()).unwrap();
        assert_eq!(result.segment_id_numeric(), 42);
        assert!(result.is_final);
        assert!(!result.is_translation_result());
    }

    #[test]
    fn translation_result_detected_by_non_empty_translation_field() {
        let json = r#"{
            "status":"ok","job_id":"j1","client_id":"c1","segment_id":"42",
            "text":"hello","translation":"xin chao","source_lang":"en","target_lang":"vi",
            "translation_enabled":"true","is_final":"false","processing_time":0.2,
            "audio_duration":1.1,"worker_id":"w1","timestamp":1700000000.0
        }"#;
        let result = ResultEnvelope::parse(json.as_bytes()).unwrap();
        assert!(result.is_translation_result());
    }

    #[test]
    fn malformed_json_surfaces_as_protocol_error() {
        let err = ResultEnvelope::parse(b"not json").unwrap_err();
        assert!(matches!(err, GatewayError::Protocol(_)));
    }
}
