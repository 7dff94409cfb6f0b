//! JSON representation of frames, one JSON object per datagram. The field names are those of the
//!  legacy relay so that existing clients interoperate unchanged.

use anyhow::Context;
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::reliability::frame::{ControlCommand, ControlFrame, ControlReason, FileChunkFrame, Frame, IntegrityReport, MessageFrame};

const INTEGRITY_VALID: &str = "valid";
const INTEGRITY_INVALID: &str = "invalid";

/// `null` is treated like an absent field, as the legacy relay does
fn null_as_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "type")]
enum WireFrame {
    #[serde(rename = "MSG")]
    Message {
        #[serde(default)]
        seq: u32,
        #[serde(default, deserialize_with = "null_as_empty")]
        payload: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        checksum: Option<String>,
    },
    #[serde(rename = "FILE_CHUNK")]
    FileChunk {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transfer_id: Option<String>,
        #[serde(default)]
        seq: u32,
        #[serde(default)]
        total_chunks: u32,
        #[serde(default)]
        chunk_size: u32,
        #[serde(default, deserialize_with = "null_as_empty")]
        filename: String,
        #[serde(default)]
        total_size: u64,
        #[serde(default, deserialize_with = "null_as_empty")]
        checksum: String,
        /// kept as a raw JSON value: a payload of the wrong type is a decoding failure of the
        ///  chunk rather than of the whole frame
        #[serde(default)]
        payload_b64: Value,
    },
    #[serde(rename = "CONTROL")]
    Control {
        #[serde(default)]
        cmd: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transfer_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        meta: Option<WireControlMeta>,
    },
}

#[derive(Serialize, Deserialize, Debug, Default)]
struct WireControlMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expected: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    received: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    integrity_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    missing: Option<Vec<u32>>,
}

impl WireControlMeta {
    fn is_empty(&self) -> bool {
        self.reason.is_none()
            && self.expected.is_none()
            && self.received.is_none()
            && self.integrity_status.is_none()
            && self.missing.is_none()
    }
}

impl From<&Frame> for WireFrame {
    fn from(frame: &Frame) -> Self {
        match frame {
            Frame::Message(msg) => WireFrame::Message {
                seq: msg.sequence,
                payload: String::from_utf8_lossy(&msg.payload).into_owned(),
                checksum: msg.integrity_tag.clone(),
            },
            Frame::FileChunk(chunk) => WireFrame::FileChunk {
                transfer_id: chunk.transfer_id.clone(),
                seq: chunk.sequence,
                total_chunks: chunk.total_chunks,
                chunk_size: chunk.chunk_size_hint,
                filename: chunk.filename.clone(),
                total_size: chunk.total_size,
                checksum: chunk.integrity_tag.clone(),
                payload_b64: chunk.payload_b64.clone().map(Value::String).unwrap_or(Value::Null),
            },
            Frame::Control(control) => {
                let mut meta = WireControlMeta {
                    reason: control.reason.as_ref().map(|r| r.to_wire()),
                    missing: control.missing.clone(),
                    ..Default::default()
                };
                if let Some(integrity) = &control.integrity {
                    meta.expected = Some(integrity.expected.clone());
                    meta.received = Some(integrity.received.clone());
                    meta.integrity_status = Some(if integrity.valid { INTEGRITY_VALID } else { INTEGRITY_INVALID }.to_string());
                }

                WireFrame::Control {
                    cmd: control.command.as_str().to_string(),
                    transfer_id: control.transfer_id.clone(),
                    seq: control.sequence,
                    meta: if meta.is_empty() { None } else { Some(meta) },
                }
            }
        }
    }
}

impl From<WireFrame> for Frame {
    fn from(wire: WireFrame) -> Self {
        match wire {
            WireFrame::Message { seq, payload, checksum } => Frame::Message(MessageFrame {
                sequence: seq,
                payload: Bytes::from(payload),
                integrity_tag: checksum,
            }),
            WireFrame::FileChunk { transfer_id, seq, total_chunks, chunk_size, filename, total_size, checksum, payload_b64 } => Frame::FileChunk(FileChunkFrame {
                transfer_id,
                sequence: seq,
                total_chunks,
                chunk_size_hint: chunk_size,
                filename,
                total_size,
                integrity_tag: checksum,
                payload_b64: match payload_b64 {
                    Value::String(s) => Some(s),
                    Value::Null => Some(String::new()),
                    _ => None,
                },
            }),
            WireFrame::Control { cmd, transfer_id, seq, meta } => {
                let meta = meta.unwrap_or_default();
                let integrity = match (meta.expected, meta.received) {
                    (None, None) => None,
                    (expected, received) => Some(IntegrityReport {
                        expected: expected.unwrap_or_default(),
                        received: received.unwrap_or_default(),
                        valid: meta.integrity_status.as_deref() == Some(INTEGRITY_VALID),
                    }),
                };

                Frame::Control(ControlFrame {
                    command: ControlCommand::from(cmd.as_str()),
                    transfer_id,
                    sequence: seq,
                    reason: meta.reason.as_deref().map(ControlReason::from_wire),
                    integrity,
                    missing: meta.missing,
                })
            }
        }
    }
}

pub fn decode_frame(buf: &[u8]) -> anyhow::Result<Frame> {
    let wire: WireFrame = serde_json::from_slice(buf)
        .context("malformed frame")?;
    Ok(wire.into())
}

pub fn encode_frame(frame: &Frame) -> anyhow::Result<Vec<u8>> {
    Ok(serde_json::to_vec(&WireFrame::from(frame))?)
}

pub fn encode_control(control: &ControlFrame) -> anyhow::Result<Vec<u8>> {
    encode_frame(&Frame::Control(control.clone()))
}

/// Best effort extraction of the `seq` field from a datagram that could not be decoded as a
///  frame, for echoing it in the error reply
pub fn sequence_hint(buf: &[u8]) -> Option<i64> {
    let value: Value = serde_json::from_slice(buf).ok()?;
    value.get("seq")?.as_i64()
}


#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;
    use super::*;

    fn decode_json(value: Value) -> Frame {
        decode_frame(&serde_json::to_vec(&value).unwrap()).unwrap()
    }

    fn encode_json(frame: &Frame) -> Value {
        serde_json::from_slice(&encode_frame(frame).unwrap()).unwrap()
    }

    #[test]
    fn test_decode_legacy_message() {
        let frame = decode_json(json!({
            "type": "MSG",
            "seq": 7,
            "from": "alice",
            "to": "room:test",
            "payload": "hello",
            "checksum": "3610a681",
        }));
        assert_eq!(frame, Frame::Message(MessageFrame {
            sequence: 7,
            payload: Bytes::from_static(b"hello"),
            integrity_tag: Some("3610a681".to_string()),
        }));
    }

    #[test]
    fn test_decode_legacy_chunk() {
        let frame = decode_json(json!({
            "type": "FILE_CHUNK",
            "transfer_id": "transfer-123",
            "seq": 2,
            "total_chunks": 4,
            "chunk_size": 8,
            "filename": "test.bin",
            "total_size": 32,
            "checksum": "0badf00d",
            "payload_b64": "AgICAgICAgI=",
        }));
        assert_eq!(frame, Frame::FileChunk(FileChunkFrame {
            transfer_id: Some("transfer-123".to_string()),
            sequence: 2,
            total_chunks: 4,
            chunk_size_hint: 8,
            filename: "test.bin".to_string(),
            total_size: 32,
            integrity_tag: "0badf00d".to_string(),
            payload_b64: Some("AgICAgICAgI=".to_string()),
        }));
    }

    #[test]
    fn test_decode_chunk_defaults() {
        let frame = decode_json(json!({"type": "FILE_CHUNK", "seq": 3}));
        match frame {
            Frame::FileChunk(chunk) => {
                assert_eq!(chunk.transfer_id(), None);
                assert_eq!(chunk.sequence, 3);
                assert_eq!(chunk.total_chunks, 0);
                assert_eq!(chunk.integrity_tag, "");
                assert_eq!(chunk.payload_b64.as_deref(), Some(""));
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[rstest]
    #[case::resume(json!({"type": "CONTROL", "cmd": "RESUME_REQUEST", "transfer_id": "t"}), ControlFrame::resume_request("t"))]
    #[case::missing(
        json!({"type": "CONTROL", "cmd": "MISSING", "transfer_id": "t", "meta": {"missing": [1, 3]}}),
        ControlFrame::new(ControlCommand::Missing).with_transfer_id("t").with_missing(vec![1, 3])
    )]
    #[case::nack(
        json!({"type": "CONTROL", "cmd": "NACK", "seq": -1, "meta": {"reason": "internal_error:boom"}}),
        ControlFrame::new(ControlCommand::Nack).with_sequence(-1).with_reason(ControlReason::InternalError("boom".to_string()))
    )]
    #[case::unknown_command(
        json!({"type": "CONTROL", "cmd": "PAUSE", "seq": 4}),
        ControlFrame::new(ControlCommand::Other("PAUSE".to_string())).with_sequence(4)
    )]
    fn test_decode_control(#[case] json: Value, #[case] expected: ControlFrame) {
        assert_eq!(decode_json(json), Frame::Control(expected));
    }

    #[test]
    fn test_encode_ack_with_integrity() {
        let control = ControlFrame::new(ControlCommand::Ack)
            .with_sequence(7)
            .with_integrity(IntegrityReport {
                expected: "3610a681".to_string(),
                received: "3610A681".to_string(),
                valid: true,
            });
        assert_eq!(encode_json(&Frame::Control(control.clone())), json!({
            "type": "CONTROL",
            "cmd": "ACK",
            "seq": 7,
            "meta": {
                "integrity_status": "valid",
                "expected": "3610a681",
                "received": "3610A681",
            },
        }));

        let decoded = decode_frame(&encode_control(&control).unwrap()).unwrap();
        assert_eq!(decoded, Frame::Control(control));
    }

    #[test]
    fn test_encode_integrity_fail() {
        let control = ControlFrame::new(ControlCommand::IntegrityFail)
            .with_sequence(0)
            .with_transfer_id("t")
            .with_reason(ControlReason::IntegrityCompromised)
            .with_integrity(IntegrityReport {
                expected: "ed82cd11".to_string(),
                received: "deadbeef".to_string(),
                valid: false,
            });
        assert_eq!(encode_json(&Frame::Control(control)), json!({
            "type": "CONTROL",
            "cmd": "INTEGRITY_FAIL",
            "transfer_id": "t",
            "seq": 0,
            "meta": {
                "reason": "integrity_compromised",
                "integrity_status": "invalid",
                "expected": "ed82cd11",
                "received": "deadbeef",
            },
        }));
    }

    #[test]
    fn test_encode_plain_control_has_no_meta() {
        let control = ControlFrame::new(ControlCommand::CumAck).with_sequence(-1).with_transfer_id("t");
        assert_eq!(encode_json(&Frame::Control(control)), json!({
            "type": "CONTROL",
            "cmd": "CUM_ACK",
            "transfer_id": "t",
            "seq": -1,
        }));
    }

    #[test]
    fn test_encode_message_without_tag() {
        assert_eq!(encode_json(&Frame::Message(MessageFrame::new(3, &b"hi"[..]))), json!({
            "type": "MSG",
            "seq": 3,
            "payload": "hi",
        }));
    }

    #[rstest]
    #[case::null_checksum(json!({"type": "FILE_CHUNK", "transfer_id": "t", "seq": 1, "checksum": null, "payload_b64": "YWJjZA=="}), "", Some("YWJjZA=="), "")]
    #[case::null_payload(json!({"type": "FILE_CHUNK", "transfer_id": "t", "seq": 1, "checksum": "00000001", "payload_b64": null}), "00000001", Some(""), "")]
    #[case::number_payload(json!({"type": "FILE_CHUNK", "transfer_id": "t", "seq": 1, "payload_b64": 123}), "", None, "")]
    #[case::object_payload(json!({"type": "FILE_CHUNK", "transfer_id": "t", "seq": 1, "payload_b64": {"a": 1}}), "", None, "")]
    #[case::null_filename(json!({"type": "FILE_CHUNK", "transfer_id": "t", "seq": 1, "filename": null, "payload_b64": "YWJjZA=="}), "", Some("YWJjZA=="), "")]
    fn test_decode_chunk_leniently(#[case] json: Value, #[case] integrity_tag: &str, #[case] payload_b64: Option<&str>, #[case] filename: &str) {
        match decode_json(json) {
            Frame::FileChunk(chunk) => {
                assert_eq!(chunk.integrity_tag, integrity_tag);
                assert_eq!(chunk.payload_b64.as_deref(), payload_b64);
                assert_eq!(chunk.filename, filename);
                assert_eq!(chunk.decode_payload().is_ok(), payload_b64.is_some());
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_decode_message_with_null_payload() {
        assert_eq!(decode_json(json!({"type": "MSG", "seq": 2, "payload": null})), Frame::Message(MessageFrame::new(2, Bytes::new())));
    }

    #[rstest]
    #[case::not_json(b"garbage".as_slice())]
    #[case::no_type(br#"{"seq": 1}"#.as_slice())]
    #[case::unknown_type(br#"{"type": "BOGUS", "seq": 1}"#.as_slice())]
    #[case::negative_sequence(br#"{"type": "FILE_CHUNK", "seq": -1}"#.as_slice())]
    #[case::sequence_too_big(br#"{"type": "MSG", "seq": 4294967296}"#.as_slice())]
    #[case::number_checksum(br#"{"type": "FILE_CHUNK", "transfer_id": "t", "seq": 1, "checksum": 17}"#.as_slice())]
    fn test_decode_malformed(#[case] buf: &[u8]) {
        assert!(decode_frame(buf).is_err());
    }

    #[rstest]
    #[case::present(br#"{"type": "BOGUS", "seq": 12}"#.as_slice(), Some(12))]
    #[case::negative(br#"{"seq": -5}"#.as_slice(), Some(-5))]
    #[case::not_a_number(br#"{"seq": "x"}"#.as_slice(), None)]
    #[case::absent(br#"{"type": "MSG"}"#.as_slice(), None)]
    #[case::not_an_object(b"[1, 2]".as_slice(), None)]
    #[case::not_json(b"\xff\xfe".as_slice(), None)]
    fn test_sequence_hint(#[case] buf: &[u8], #[case] expected: Option<i64>) {
        assert_eq!(sequence_hint(buf), expected);
    }
}
