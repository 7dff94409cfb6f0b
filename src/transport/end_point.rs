use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, span, trace, warn, Level};
use uuid::Uuid;

use crate::config::RelayConfig;
use crate::reliability::engine::ReliabilityEngine;
use crate::reliability::frame::ControlFrame;
use crate::reliability::registry::TransferRegistry;
use crate::transport::send_pipeline::{ReplyPipeline, UdpReplySink};

/// RelayEndPoint is where the reliability protocol meets the network: It listens on a UdpSocket,
///  hands every datagram to the [ReliabilityEngine], sends the resulting control frames back to
///  the datagram's sender, and periodically evicts abandoned transfers.
pub struct RelayEndPoint {
    socket: Arc<UdpSocket>,
    engine: Arc<ReliabilityEngine>,
    config: Arc<RelayConfig>,
}

impl RelayEndPoint {
    pub async fn new(config: Arc<RelayConfig>) -> anyhow::Result<RelayEndPoint> {
        config.validate()?;

        let socket = Arc::new(UdpSocket::bind(config.self_addr).await?);
        info!("bound relay socket to {:?}", socket.local_addr()?);

        let registry = Arc::new(TransferRegistry::new());
        Ok(RelayEndPoint {
            socket,
            engine: Arc::new(ReliabilityEngine::with_default_codec(registry)),
            config,
        })
    }

    pub fn self_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn engine(&self) -> &Arc<ReliabilityEngine> {
        &self.engine
    }

    pub fn registry(&self) -> &Arc<TransferRegistry> {
        self.engine.registry()
    }

    /// Runs the receive loop, the reply loop and idle transfer eviction until one of them
    ///  terminates, which they do only if the reply pipeline shuts down.
    pub async fn run(&self) -> anyhow::Result<()> {
        let (reply_send, reply_recv) = mpsc::channel(self.config.reply_queue_capacity);
        let reply_pipeline = ReplyPipeline::new(Arc::new(self.socket.clone()), self.config.max_missing_per_control);

        select! {
            _ = self.recv_loop(reply_send) => {}
            _ = reply_pipeline.run(reply_recv) => {}
            _ = self.eviction_loop() => {}
        }

        info!("relay end point shut down");
        Ok(())
    }

    pub async fn recv_loop(&self, reply_queue: mpsc::Sender<(SocketAddr, ControlFrame)>) {
        info!("starting receive loop");

        // one extra byte to detect datagrams that exceed the configured maximum
        let mut buf = vec![0u8; self.config.max_datagram_size + 1];
        loop {
            let (num_read, from) = match self.socket.recv_from(&mut buf).await {
                Ok(x) => x,
                Err(e) => {
                    error!("socket error: {}", e);
                    continue;
                }
            };

            self.on_datagram(&buf[..num_read], from, &reply_queue);
        }
    }

    fn on_datagram(&self, buf: &[u8], from: SocketAddr, reply_queue: &mpsc::Sender<(SocketAddr, ControlFrame)>) {
        let correlation_id = Uuid::new_v4();
        let span = span!(Level::TRACE, "datagram_received", ?correlation_id, ?from);
        let _entered = span.enter();

        trace!("received {} bytes from {:?}", buf.len(), from);

        if buf.len() > self.config.max_datagram_size {
            warn!("datagram from {:?} exceeds the maximum size of {} bytes - dropping", from, self.config.max_datagram_size);
            return;
        }

        let reply = UdpReplySink::new(from, reply_queue.clone());
        let outcome = self.engine.dispatch_raw(buf, from, &reply);
        debug!("handled datagram from {:?}: {:?}", from, outcome);
    }

    pub async fn eviction_loop(&self) {
        let ttl = match self.config.idle_transfer_ttl {
            Some(ttl) => ttl,
            None => {
                debug!("idle transfer eviction is disabled");
                return std::future::pending().await;
            }
        };

        let mut ticks = time::interval(self.config.eviction_interval);
        loop {
            ticks.tick().await;
            match self.registry().evict_idle(ttl, Instant::now()) {
                Ok(0) => {}
                Ok(num_evicted) => info!("evicted {} idle transfers", num_evicted),
                Err(e) => error!("error evicting idle transfers: {}", e),
            }
        }
    }
}
