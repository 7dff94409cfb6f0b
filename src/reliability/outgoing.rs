use std::collections::BTreeSet;

use anyhow::bail;
use tracing::{debug, trace};

use crate::reliability::frame::{ControlCommand, ControlFrame, ControlReason, FileChunkFrame};
use crate::reliability::integrity::IntegrityCodec;

/// The sending side of a file transfer: splits a buffer into tagged chunks and keeps track of
///  which of them the receiver acknowledged, based on the control frames it sends back.
pub struct OutgoingTransfer {
    transfer_id: String,
    filename: String,
    data: Vec<u8>,
    chunk_size: usize,
    total_chunks: u32,
    integrity_tags: Vec<String>,
    acknowledged: BTreeSet<u32>,
}

impl OutgoingTransfer {
    pub fn new(transfer_id: impl Into<String>, filename: impl Into<String>, data: Vec<u8>, chunk_size: usize, codec: &dyn IntegrityCodec) -> anyhow::Result<OutgoingTransfer> {
        if chunk_size == 0 {
            bail!("chunk size must be greater than 0");
        }
        if u32::try_from(chunk_size).is_err() {
            bail!("chunk size {} is too big", chunk_size);
        }

        // an empty file is still sent as a single (empty) chunk
        let total_chunks = match u32::try_from(data.len().div_ceil(chunk_size).max(1)) {
            Ok(n) => n,
            Err(_) => bail!("{} bytes with chunk size {} require too many chunks", data.len(), chunk_size),
        };

        let mut transfer = OutgoingTransfer {
            transfer_id: transfer_id.into(),
            filename: filename.into(),
            data,
            chunk_size,
            total_chunks,
            integrity_tags: Vec::with_capacity(total_chunks as usize),
            acknowledged: BTreeSet::default(),
        };
        transfer.integrity_tags = (0..total_chunks)
            .map(|sequence| codec.tag(transfer.payload(sequence), sequence))
            .collect();
        Ok(transfer)
    }

    pub fn transfer_id(&self) -> &str {
        &self.transfer_id
    }

    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    fn payload(&self, sequence: u32) -> &[u8] {
        let start = (sequence as usize * self.chunk_size).min(self.data.len());
        let end = (start + self.chunk_size).min(self.data.len());
        &self.data[start..end]
    }

    /// the chunk with the given sequence number, or `None` if it is beyond the transfer's end
    pub fn chunk(&self, sequence: u32) -> Option<FileChunkFrame> {
        if sequence >= self.total_chunks {
            return None;
        }

        Some(FileChunkFrame {
            transfer_id: Some(self.transfer_id.clone()),
            sequence,
            total_chunks: self.total_chunks,
            chunk_size_hint: self.chunk_size as u32,
            filename: self.filename.clone(),
            total_size: self.data.len() as u64,
            integrity_tag: self.integrity_tags[sequence as usize].clone(),
            payload_b64: Some(FileChunkFrame::encode_payload(self.payload(sequence))),
        })
    }

    pub fn chunks(&self) -> impl Iterator<Item = FileChunkFrame> + '_ {
        (0..self.total_chunks)
            .filter_map(|sequence| self.chunk(sequence))
    }

    pub fn resume_request(&self) -> ControlFrame {
        ControlFrame::resume_request(self.transfer_id.clone())
    }

    pub fn is_complete(&self) -> bool {
        self.acknowledged.len() == self.total_chunks as usize
    }

    /// sequence numbers of all chunks that were not acknowledged yet, in ascending order
    pub fn unacknowledged(&self) -> Vec<u32> {
        (0..self.total_chunks)
            .filter(|sequence| !self.acknowledged.contains(sequence))
            .collect()
    }

    fn valid_sequence(&self, sequence: Option<i64>) -> Option<u32> {
        sequence
            .and_then(|s| u32::try_from(s).ok())
            .filter(|&s| s < self.total_chunks)
    }

    /// Applies a control frame received from the peer, returning the sequence numbers of chunks
    ///  that should be sent (again). Control frames for other transfers are ignored.
    pub fn on_control(&mut self, control: &ControlFrame) -> Vec<u32> {
        if control.transfer_id.as_deref() != Some(self.transfer_id.as_str()) {
            trace!("control frame for a different transfer - ignoring: {:?}", control);
            return Vec::new();
        }

        match &control.command {
            ControlCommand::Ack => {
                if let Some(sequence) = self.valid_sequence(control.sequence) {
                    self.acknowledged.insert(sequence);
                }
                Vec::new()
            }
            ControlCommand::CumAck => {
                match control.sequence {
                    Some(-1) => {
                        debug!("transfer {:?} is unknown to the receiver - sending all chunks", self.transfer_id);
                        self.acknowledged.clear();
                        self.unacknowledged()
                    }
                    Some(up_to) if up_to >= 0 => {
                        let up_to = up_to.min(i64::from(self.total_chunks) - 1);
                        for sequence in 0..=up_to {
                            self.acknowledged.insert(sequence as u32);
                        }
                        Vec::new()
                    }
                    _ => Vec::new(),
                }
            }
            ControlCommand::Missing => {
                let missing = control.missing.as_deref().unwrap_or_default()
                    .iter()
                    .cloned()
                    .filter(|&s| s < self.total_chunks)
                    .collect::<BTreeSet<_>>();
                // the receiver's answer is authoritative: everything it does not report as missing
                //  was received
                self.acknowledged = (0..self.total_chunks)
                    .filter(|s| !missing.contains(s))
                    .collect();
                debug!("transfer {:?}: receiver reports {} missing chunks", self.transfer_id, missing.len());
                missing.into_iter().collect()
            }
            ControlCommand::IntegrityFail => {
                self.valid_sequence(control.sequence).into_iter().collect()
            }
            ControlCommand::Nack => {
                match control.reason {
                    Some(ControlReason::InvalidEncoding) | Some(ControlReason::InternalError(_)) => {
                        self.valid_sequence(control.sequence).into_iter().collect()
                    }
                    _ => Vec::new(),
                }
            }
            _ => Vec::new(),
        }
    }
}
