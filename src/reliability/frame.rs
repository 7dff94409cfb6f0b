use std::fmt::{Display, Formatter};

use anyhow::bail;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;

use crate::reliability::integrity::IntegrityCodec;
use crate::reliability::transfer_state::TransferMeta;

/// A frame as it arrives from (or is sent to) a peer, after wire decoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Message(MessageFrame),
    FileChunk(FileChunkFrame),
    Control(ControlFrame),
}

impl Frame {
    /// the frame's sequence number if it has one, for reporting failures back to the sender
    pub fn sequence(&self) -> Option<i64> {
        match self {
            Frame::Message(msg) => Some(msg.sequence.into()),
            Frame::FileChunk(chunk) => Some(chunk.sequence.into()),
            Frame::Control(control) => control.sequence,
        }
    }
}

/// A short chat message. Messages are integrity checked individually, they do not take part in
///  gap tracking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageFrame {
    pub sequence: u32,
    pub payload: Bytes,
    pub integrity_tag: Option<String>,
}

impl MessageFrame {
    pub fn new(sequence: u32, payload: impl Into<Bytes>) -> MessageFrame {
        MessageFrame {
            sequence,
            payload: payload.into(),
            integrity_tag: None,
        }
    }

    pub fn tagged(sequence: u32, payload: impl Into<Bytes>, codec: &dyn IntegrityCodec) -> MessageFrame {
        let payload = payload.into();
        let integrity_tag = Some(codec.tag(&payload, sequence));
        MessageFrame {
            sequence,
            payload,
            integrity_tag,
        }
    }
}

/// One chunk of a file transfer.
///
/// The payload is kept in its base64 wire representation: decoding it is part of the protocol's
///  chunk handling, and a decoding failure is reported to the sender as `invalid_encoding`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChunkFrame {
    pub transfer_id: Option<String>,
    pub sequence: u32,
    pub total_chunks: u32,
    pub chunk_size_hint: u32,
    pub filename: String,
    pub total_size: u64,
    pub integrity_tag: String,
    /// `None` if the payload was not a string on the wire, which makes it undecodable
    pub payload_b64: Option<String>,
}

impl FileChunkFrame {
    /// the transfer id, treating an empty id like a missing one
    pub fn transfer_id(&self) -> Option<&str> {
        self.transfer_id.as_deref()
            .filter(|id| !id.is_empty())
    }

    pub fn decode_payload(&self) -> anyhow::Result<Vec<u8>> {
        match &self.payload_b64 {
            Some(payload_b64) => Ok(STANDARD.decode(payload_b64.as_bytes())?),
            None => bail!("payload is not a string"),
        }
    }

    pub fn encode_payload(payload: &[u8]) -> String {
        STANDARD.encode(payload)
    }

    pub fn meta(&self) -> TransferMeta {
        TransferMeta {
            total_chunks: self.total_chunks,
            chunk_size_hint: self.chunk_size_hint,
            filename: self.filename.clone(),
            total_size: self.total_size,
        }
    }
}


#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ControlCommand {
    Ack,
    Nack,
    CumAck,
    Missing,
    IntegrityFail,
    ResumeRequest,
    /// commands that are not (yet) part of the protocol are passed through without action
    Other(String),
}

impl ControlCommand {
    pub fn as_str(&self) -> &str {
        match self {
            ControlCommand::Ack => "ACK",
            ControlCommand::Nack => "NACK",
            ControlCommand::CumAck => "CUM_ACK",
            ControlCommand::Missing => "MISSING",
            ControlCommand::IntegrityFail => "INTEGRITY_FAIL",
            ControlCommand::ResumeRequest => "RESUME_REQUEST",
            ControlCommand::Other(s) => s,
        }
    }
}

impl From<&str> for ControlCommand {
    fn from(value: &str) -> Self {
        match value {
            "ACK" => ControlCommand::Ack,
            "NACK" => ControlCommand::Nack,
            "CUM_ACK" => ControlCommand::CumAck,
            "MISSING" => ControlCommand::Missing,
            "INTEGRITY_FAIL" => ControlCommand::IntegrityFail,
            "RESUME_REQUEST" => ControlCommand::ResumeRequest,
            other => ControlCommand::Other(other.to_string()),
        }
    }
}

impl Display for ControlCommand {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}


/// The reason attached to negative acknowledgements
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ControlReason {
    MissingTransferId,
    InvalidEncoding,
    IntegrityCompromised,
    /// an unexpected failure while handling a frame, with some human-readable detail
    InternalError(String),
    Other(String),
}

impl ControlReason {
    const INTERNAL_ERROR_PREFIX: &'static str = "internal_error:";

    pub fn to_wire(&self) -> String {
        match self {
            ControlReason::MissingTransferId => "missing_transfer_id".to_string(),
            ControlReason::InvalidEncoding => "invalid_encoding".to_string(),
            ControlReason::IntegrityCompromised => "integrity_compromised".to_string(),
            ControlReason::InternalError(detail) => format!("{}{}", Self::INTERNAL_ERROR_PREFIX, detail),
            ControlReason::Other(s) => s.clone(),
        }
    }

    pub fn from_wire(value: &str) -> ControlReason {
        match value {
            "missing_transfer_id" => ControlReason::MissingTransferId,
            "invalid_encoding" => ControlReason::InvalidEncoding,
            "integrity_compromised" => ControlReason::IntegrityCompromised,
            other => match other.strip_prefix(Self::INTERNAL_ERROR_PREFIX) {
                Some(detail) => ControlReason::InternalError(detail.to_string()),
                None => ControlReason::Other(other.to_string()),
            },
        }
    }
}

impl Display for ControlReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_wire())
    }
}


/// The outcome of an integrity check, reported back to the sender so it can see both sides
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityReport {
    pub expected: String,
    pub received: String,
    pub valid: bool,
}


#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlFrame {
    pub command: ControlCommand,
    pub transfer_id: Option<String>,
    /// NB: this is signed because a cumulative ack uses -1 for 'nothing received yet'
    pub sequence: Option<i64>,
    pub reason: Option<ControlReason>,
    pub integrity: Option<IntegrityReport>,
    pub missing: Option<Vec<u32>>,
}

impl ControlFrame {
    pub fn new(command: ControlCommand) -> ControlFrame {
        ControlFrame {
            command,
            transfer_id: None,
            sequence: None,
            reason: None,
            integrity: None,
            missing: None,
        }
    }

    pub fn resume_request(transfer_id: impl Into<String>) -> ControlFrame {
        ControlFrame::new(ControlCommand::ResumeRequest)
            .with_transfer_id(transfer_id)
    }

    pub fn with_transfer_id(mut self, transfer_id: impl Into<String>) -> ControlFrame {
        self.transfer_id = Some(transfer_id.into());
        self
    }

    pub fn with_sequence(mut self, sequence: i64) -> ControlFrame {
        self.sequence = Some(sequence);
        self
    }

    pub fn with_reason(mut self, reason: ControlReason) -> ControlFrame {
        self.reason = Some(reason);
        self
    }

    pub fn with_integrity(mut self, integrity: IntegrityReport) -> ControlFrame {
        self.integrity = Some(integrity);
        self
    }

    pub fn with_missing(mut self, missing: Vec<u32>) -> ControlFrame {
        self.missing = Some(missing);
        self
    }
}


#[cfg(test)]
mod tests {
    use rstest::rstest;
    use crate::reliability::integrity::SequenceBoundCrc32;
    use super::*;

    #[rstest]
    #[case::ack("ACK", ControlCommand::Ack)]
    #[case::nack("NACK", ControlCommand::Nack)]
    #[case::cum_ack("CUM_ACK", ControlCommand::CumAck)]
    #[case::missing("MISSING", ControlCommand::Missing)]
    #[case::integrity_fail("INTEGRITY_FAIL", ControlCommand::IntegrityFail)]
    #[case::resume("RESUME_REQUEST", ControlCommand::ResumeRequest)]
    #[case::other("PAUSE", ControlCommand::Other("PAUSE".to_string()))]
    #[case::case_sensitive("ack", ControlCommand::Other("ack".to_string()))]
    fn test_control_command(#[case] raw: &str, #[case] expected: ControlCommand) {
        let command = ControlCommand::from(raw);
        assert_eq!(command, expected);
        assert_eq!(command.as_str(), raw);
    }

    #[rstest]
    #[case::missing_transfer_id("missing_transfer_id", ControlReason::MissingTransferId)]
    #[case::invalid_encoding("invalid_encoding", ControlReason::InvalidEncoding)]
    #[case::integrity("integrity_compromised", ControlReason::IntegrityCompromised)]
    #[case::internal("internal_error:boom", ControlReason::InternalError("boom".to_string()))]
    #[case::internal_empty("internal_error:", ControlReason::InternalError("".to_string()))]
    #[case::other("checksum_mismatch", ControlReason::Other("checksum_mismatch".to_string()))]
    fn test_control_reason(#[case] raw: &str, #[case] expected: ControlReason) {
        let reason = ControlReason::from_wire(raw);
        assert_eq!(reason, expected);
        assert_eq!(reason.to_wire(), raw);
    }

    #[rstest]
    #[case::present(Some("t-1"), Some("t-1"))]
    #[case::empty(Some(""), None)]
    #[case::absent(None, None)]
    fn test_chunk_transfer_id(#[case] transfer_id: Option<&str>, #[case] expected: Option<&str>) {
        let chunk = FileChunkFrame {
            transfer_id: transfer_id.map(|s| s.to_string()),
            sequence: 0,
            total_chunks: 1,
            chunk_size_hint: 4,
            filename: "a.txt".to_string(),
            total_size: 4,
            integrity_tag: "".to_string(),
            payload_b64: Some("YWJjZA==".to_string()),
        };
        assert_eq!(chunk.transfer_id(), expected);
        assert_eq!(chunk.decode_payload().unwrap(), b"abcd");
    }

    #[rstest]
    #[case::not_base64(Some("***"))]
    #[case::bad_padding(Some("YWJjZA="))]
    #[case::not_a_string(None)]
    fn test_chunk_decode_payload_invalid(#[case] payload_b64: Option<&str>) {
        let chunk = FileChunkFrame {
            transfer_id: Some("t".to_string()),
            sequence: 0,
            total_chunks: 1,
            chunk_size_hint: 4,
            filename: "a.txt".to_string(),
            total_size: 4,
            integrity_tag: "".to_string(),
            payload_b64: payload_b64.map(|s| s.to_string()),
        };
        assert!(chunk.decode_payload().is_err());
    }

    #[test]
    fn test_message_tagged() {
        let msg = MessageFrame::tagged(7, &b"hello"[..], &SequenceBoundCrc32);
        assert_eq!(msg.integrity_tag.as_deref(), Some("3610a681"));
        assert_eq!(Frame::Message(msg).sequence(), Some(7));
    }
}
