use std::any::Any;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use anyhow::anyhow;
#[cfg(test)] use mockall::automock;
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

use crate::reliability::frame::{ControlCommand, ControlFrame, ControlReason, FileChunkFrame, Frame, IntegrityReport, MessageFrame};
use crate::reliability::integrity::{IntegrityCodec, SequenceBoundCrc32};
use crate::reliability::registry::TransferRegistry;
use crate::reliability::wire;

/// The channel for sending control frames back to the peer that sent the frame being handled.
///
/// It is provided by the transport layer. Sending is fire-and-forget: implementations must not
///  block, and they give no guarantee that the control frame is actually delivered.
#[cfg_attr(test, automock)]
pub trait ReplySink: Send + Sync {
    fn send_control(&self, control: ControlFrame);
}

/// A summary of what the engine did with a frame, for logging and testing. The actual effect
///  is what was sent to the [ReplySink].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub command: Option<ControlCommand>,
    pub sequence: Option<i64>,
    pub reason: Option<ControlReason>,
}

impl DispatchOutcome {
    fn emitted(command: ControlCommand, sequence: i64) -> DispatchOutcome {
        DispatchOutcome {
            command: Some(command),
            sequence: Some(sequence),
            reason: None,
        }
    }

    fn rejected(command: ControlCommand, sequence: i64, reason: ControlReason) -> DispatchOutcome {
        DispatchOutcome {
            command: Some(command),
            sequence: Some(sequence),
            reason: Some(reason),
        }
    }
}


/// The reliability protocol's frame handling. The engine holds no per-peer state of its own:
///  everything it remembers is in the [TransferRegistry], so a single engine can be shared by
///  any number of concurrent callers.
///
/// Dispatching a frame is a synchronous, non-blocking call: it only takes short-lived locks on
///  the registry and hands control frames to the reply sink.
pub struct ReliabilityEngine {
    registry: Arc<TransferRegistry>,
    codec: Arc<dyn IntegrityCodec>,
}

impl ReliabilityEngine {
    pub fn new(registry: Arc<TransferRegistry>, codec: Arc<dyn IntegrityCodec>) -> ReliabilityEngine {
        ReliabilityEngine {
            registry,
            codec,
        }
    }

    pub fn with_default_codec(registry: Arc<TransferRegistry>) -> ReliabilityEngine {
        Self::new(registry, Arc::new(SequenceBoundCrc32))
    }

    pub fn registry(&self) -> &Arc<TransferRegistry> {
        &self.registry
    }

    /// Decodes a frame from its wire representation and dispatches it. A buffer that can not be
    ///  decoded is answered with an `internal_error` NACK, echoing the sequence number if it can
    ///  be salvaged from the buffer.
    pub fn dispatch_raw(&self, buf: &[u8], sender: SocketAddr, reply: &dyn ReplySink) -> DispatchOutcome {
        match wire::decode_frame(buf) {
            Ok(frame) => self.dispatch(&frame, sender, reply),
            Err(e) => {
                warn!("undecodable frame from {:?}: {}", sender, e);
                let sequence = wire::sequence_hint(buf).unwrap_or(-1);
                Self::internal_error(sequence, format!("{:#}", e), reply)
            }
        }
    }

    /// Applies the protocol rules to a single frame. This never fails: any unexpected problem -
    ///  including a panic - is contained here and reported to the sender as an `internal_error`
    ///  NACK, so it can not affect the handling of other frames.
    pub fn dispatch(&self, frame: &Frame, sender: SocketAddr, reply: &dyn ReplySink) -> DispatchOutcome {
        trace!("dispatching frame from {:?}: {:?}", sender, frame);

        let sequence = frame.sequence().unwrap_or(-1);
        match panic::catch_unwind(AssertUnwindSafe(|| self.try_dispatch(frame, reply))) {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                error!("error handling frame #{} from {:?}: {:#}", sequence, sender, e);
                Self::internal_error(sequence, format!("{:#}", e), reply)
            }
            Err(panic_payload) => {
                let detail = panic_detail(panic_payload.as_ref());
                error!("panic handling frame #{} from {:?}: {}", sequence, sender, detail);
                Self::internal_error(sequence, detail, reply)
            }
        }
    }

    fn internal_error(sequence: i64, detail: String, reply: &dyn ReplySink) -> DispatchOutcome {
        let reason = ControlReason::InternalError(detail);
        reply.send_control(ControlFrame::new(ControlCommand::Nack)
            .with_sequence(sequence)
            .with_reason(reason.clone())
        );
        DispatchOutcome::rejected(ControlCommand::Nack, sequence, reason)
    }

    fn try_dispatch(&self, frame: &Frame, reply: &dyn ReplySink) -> anyhow::Result<DispatchOutcome> {
        match frame {
            Frame::Message(msg) => Ok(self.on_message(msg, reply)),
            Frame::FileChunk(chunk) => self.on_file_chunk(chunk, reply),
            Frame::Control(control) => self.on_control(control, reply),
        }
    }

    fn check_integrity(&self, payload: &[u8], sequence: u32, received: &str) -> IntegrityReport {
        IntegrityReport {
            expected: self.codec.tag(payload, sequence),
            valid: self.codec.verify(payload, sequence, received),
            received: received.to_string(),
        }
    }

    fn on_message(&self, msg: &MessageFrame, reply: &dyn ReplySink) -> DispatchOutcome {
        let sequence = i64::from(msg.sequence);

        // an empty tag is the same as no tag
        let received_tag = match msg.integrity_tag.as_deref() {
            Some(tag) if !tag.is_empty() => tag,
            _ => {
                reply.send_control(ControlFrame::new(ControlCommand::Ack).with_sequence(sequence));
                return DispatchOutcome::emitted(ControlCommand::Ack, sequence);
            }
        };

        let report = self.check_integrity(&msg.payload, msg.sequence, received_tag);
        if !report.valid {
            warn!("message #{}: integrity mismatch - expected {}, received {}", sequence, report.expected, report.received);
            reply.send_control(ControlFrame::new(ControlCommand::IntegrityFail)
                .with_sequence(sequence)
                .with_reason(ControlReason::IntegrityCompromised)
                .with_integrity(report)
            );
            return DispatchOutcome::rejected(ControlCommand::IntegrityFail, sequence, ControlReason::IntegrityCompromised);
        }

        reply.send_control(ControlFrame::new(ControlCommand::Ack)
            .with_sequence(sequence)
            .with_integrity(report)
        );
        DispatchOutcome::emitted(ControlCommand::Ack, sequence)
    }

    fn on_file_chunk(&self, chunk: &FileChunkFrame, reply: &dyn ReplySink) -> anyhow::Result<DispatchOutcome> {
        let sequence = i64::from(chunk.sequence);

        let transfer_id = match chunk.transfer_id() {
            Some(id) => id,
            None => {
                debug!("chunk #{} without transfer id - rejecting", sequence);
                reply.send_control(ControlFrame::new(ControlCommand::Nack)
                    .with_sequence(sequence)
                    .with_reason(ControlReason::MissingTransferId)
                );
                return Ok(DispatchOutcome::rejected(ControlCommand::Nack, sequence, ControlReason::MissingTransferId));
            }
        };

        let payload = match chunk.decode_payload() {
            Ok(payload) => payload,
            Err(e) => {
                debug!("transfer {:?}, chunk #{}: payload is not valid base64 - rejecting: {}", transfer_id, sequence, e);
                reply.send_control(ControlFrame::new(ControlCommand::Nack)
                    .with_sequence(sequence)
                    .with_transfer_id(transfer_id)
                    .with_reason(ControlReason::InvalidEncoding)
                );
                return Ok(DispatchOutcome::rejected(ControlCommand::Nack, sequence, ControlReason::InvalidEncoding));
            }
        };

        let report = self.check_integrity(&payload, chunk.sequence, &chunk.integrity_tag);
        if !report.valid {
            // NB: the chunk is not recorded as received, so the sender has to re-send it
            warn!("transfer {:?}, chunk #{}: integrity mismatch - expected {}, received {}", transfer_id, sequence, report.expected, report.received);
            reply.send_control(ControlFrame::new(ControlCommand::IntegrityFail)
                .with_sequence(sequence)
                .with_transfer_id(transfer_id)
                .with_reason(ControlReason::IntegrityCompromised)
                .with_integrity(report)
            );
            return Ok(DispatchOutcome::rejected(ControlCommand::IntegrityFail, sequence, ControlReason::IntegrityCompromised));
        }

        let state = self.registry.get_or_create(transfer_id, chunk.meta())?;
        let (highest_contiguous, send_cum_ack) = {
            let mut state = state.lock()
                .map_err(|_| anyhow!("state of transfer {:?} is poisoned", transfer_id))?;
            state.touch(Instant::now());

            if !state.record(chunk.sequence) {
                debug!("transfer {:?}: duplicate chunk #{}", transfer_id, sequence);
            }

            // cumulative acks are sent for every fourth chunk, plus once the transfer is complete
            let send_cum_ack = state.meta().total_chunks != 0
                && (chunk.sequence % 4 == 0 || state.is_complete());
            (state.highest_contiguous(), send_cum_ack)
        };

        reply.send_control(ControlFrame::new(ControlCommand::Ack)
            .with_sequence(sequence)
            .with_transfer_id(transfer_id)
            .with_integrity(report)
        );

        if send_cum_ack {
            trace!("transfer {:?}: cumulative ack up to #{}", transfer_id, highest_contiguous);
            reply.send_control(ControlFrame::new(ControlCommand::CumAck)
                .with_sequence(highest_contiguous)
                .with_transfer_id(transfer_id)
            );
        }

        Ok(DispatchOutcome::emitted(ControlCommand::Ack, sequence))
    }

    fn on_control(&self, control: &ControlFrame, reply: &dyn ReplySink) -> anyhow::Result<DispatchOutcome> {
        match &control.command {
            ControlCommand::ResumeRequest => {
                match control.transfer_id.as_deref().filter(|id| !id.is_empty()) {
                    Some(transfer_id) => self.on_resume_request(transfer_id, reply)?,
                    None => debug!("resume request without transfer id - ignoring"),
                }
            }
            other => {
                trace!("control command {} requires no action", other);
            }
        }

        Ok(DispatchOutcome {
            command: Some(control.command.clone()),
            sequence: control.sequence,
            reason: None,
        })
    }

    fn on_resume_request(&self, transfer_id: &str, reply: &dyn ReplySink) -> anyhow::Result<()> {
        let state = match self.registry.get(transfer_id)? {
            Some(state) => state,
            None => {
                debug!("resume request for unknown transfer {:?}", transfer_id);
                reply.send_control(ControlFrame::new(ControlCommand::CumAck)
                    .with_sequence(-1)
                    .with_transfer_id(transfer_id)
                );
                return Ok(());
            }
        };

        let (missing, highest_contiguous) = {
            let mut state = state.lock()
                .map_err(|_| anyhow!("state of transfer {:?} is poisoned", transfer_id))?;
            state.touch(Instant::now());
            (state.missing(), state.highest_contiguous())
        };

        if missing.is_empty() {
            debug!("resume request for transfer {:?}: nothing missing, up to #{}", transfer_id, highest_contiguous);
            reply.send_control(ControlFrame::new(ControlCommand::CumAck)
                .with_sequence(highest_contiguous)
                .with_transfer_id(transfer_id)
            );
        }
        else {
            debug!("resume request for transfer {:?}: {} chunks missing", transfer_id, missing.len());
            reply.send_control(ControlFrame::new(ControlCommand::Missing)
                .with_transfer_id(transfer_id)
                .with_missing(missing)
            );
        }
        Ok(())
    }
}

fn panic_detail(panic_payload: &(dyn Any + Send)) -> String {
    if let Some(s) = panic_payload.downcast_ref::<&str>() {
        s.to_string()
    }
    else if let Some(s) = panic_payload.downcast_ref::<String>() {
        s.clone()
    }
    else {
        "panic".to_string()
    }
}
