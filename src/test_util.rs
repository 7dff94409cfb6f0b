use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Mutex;

use crate::reliability::engine::ReplySink;
use crate::reliability::frame::{ControlFrame, FileChunkFrame};
use crate::reliability::integrity::{IntegrityCodec, SequenceBoundCrc32};

/// convenience function for unit test code: create a [SocketAddr] based on a number, the same
///  number generating the same address and different numbers different addresses
pub fn test_peer_addr(number: u16) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, number))
}

/// A chunk with a valid integrity tag for its payload and sequence number
pub fn test_chunk(transfer_id: &str, sequence: u32, payload: &[u8], total_chunks: u32) -> FileChunkFrame {
    FileChunkFrame {
        transfer_id: Some(transfer_id.to_string()),
        sequence,
        total_chunks,
        chunk_size_hint: payload.len() as u32,
        filename: "test.bin".to_string(),
        total_size: payload.len() as u64 * u64::from(total_chunks),
        integrity_tag: SequenceBoundCrc32.tag(payload, sequence),
        payload_b64: Some(FileChunkFrame::encode_payload(payload)),
    }
}

/// A [ReplySink] that records all control frames it is given
#[derive(Default)]
pub struct RecordingReplySink {
    sent: Mutex<Vec<ControlFrame>>,
}

impl RecordingReplySink {
    pub fn new() -> RecordingReplySink {
        Default::default()
    }

    /// returns the control frames recorded since the last call, clearing the buffer
    pub fn sent_controls(&self) -> Vec<ControlFrame> {
        let mut sent = self.sent.lock()
            .unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *sent)
    }
}

impl ReplySink for RecordingReplySink {
    fn send_control(&self, control: ControlFrame) {
        self.sent.lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(control);
    }
}
