use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, trace, warn};

use crate::reliability::engine::ReplySink;
use crate::reliability::frame::ControlFrame;
use crate::reliability::wire;

/// This is an abstraction for sending a buffer on a UDP socket, introduced to facilitate mocking
///  the I/O part away for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]);
}

#[async_trait]
impl SendSocket for Arc<UdpSocket> {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) {
        trace!("UDP socket: sending packet to {:?}", to);

        if let Err(e) = self.send_to(packet_buf, to).await {
            error!("error sending UDP packet to {:?}: {}", to, e);
        }
    }
}


/// The [ReplySink] for a single received datagram. It hands control frames to the reply pipeline
///  without waiting, so the engine never blocks on socket I/O.
///
/// The queue is bounded: if the socket can not keep up, control frames are dropped, which the
///  protocol tolerates like any other lost datagram.
pub struct UdpReplySink {
    peer: SocketAddr,
    queue: mpsc::Sender<(SocketAddr, ControlFrame)>,
}

impl UdpReplySink {
    pub fn new(peer: SocketAddr, queue: mpsc::Sender<(SocketAddr, ControlFrame)>) -> UdpReplySink {
        UdpReplySink { peer, queue }
    }
}

impl ReplySink for UdpReplySink {
    fn send_control(&self, control: ControlFrame) {
        match self.queue.try_send((self.peer, control)) {
            Ok(()) => {}
            Err(TrySendError::Full((_, control))) => {
                warn!("reply queue is full - dropping {} for {:?}", control.command, self.peer);
            }
            Err(TrySendError::Closed(_)) => {
                warn!("reply pipeline is closed - dropping control frame for {:?}", self.peer);
            }
        }
    }
}


/// Encodes control frames and sends them to their peers.
pub struct ReplyPipeline {
    socket: Arc<dyn SendSocket>,
    max_missing_per_control: usize,
}

impl ReplyPipeline {
    pub fn new(socket: Arc<dyn SendSocket>, max_missing_per_control: usize) -> ReplyPipeline {
        ReplyPipeline {
            socket,
            max_missing_per_control: max_missing_per_control.max(1),
        }
    }

    /// Sends a control frame, splitting it into several frames if its list of missing sequence
    ///  numbers is longer than configured. The receiver merges them by simply handling each of
    ///  them in turn.
    pub async fn send_control(&self, to: SocketAddr, control: ControlFrame) {
        match &control.missing {
            Some(missing) if missing.len() > self.max_missing_per_control => {
                debug!("splitting {} missing sequence numbers for {:?} into batches of {}", missing.len(), to, self.max_missing_per_control);
                for batch in missing.chunks(self.max_missing_per_control) {
                    let mut partial = control.clone();
                    partial.missing = Some(batch.to_vec());
                    self.encode_and_send(to, &partial).await;
                }
            }
            _ => self.encode_and_send(to, &control).await,
        }
    }

    async fn encode_and_send(&self, to: SocketAddr, control: &ControlFrame) {
        match wire::encode_control(control) {
            Ok(buf) => self.socket.do_send_packet(to, &buf).await,
            Err(e) => error!("error encoding control frame {:?}: {}", control, e),
        }
    }

    pub async fn run(&self, mut queue: mpsc::Receiver<(SocketAddr, ControlFrame)>) {
        info!("starting reply loop");
        while let Some((to, control)) = queue.recv().await {
            self.send_control(to, control).await;
        }
        debug!("reply queue closed - shutting down reply loop");
    }
}
