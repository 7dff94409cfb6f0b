use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::bail;
use chatcast::reliability::frame::{FileChunkFrame, Frame};
use chatcast::reliability::integrity::SequenceBoundCrc32;
use chatcast::reliability::outgoing::OutgoingTransfer;
use chatcast::reliability::wire;
use clap::Parser;
use clap_derive::Parser;
use tokio::net::UdpSocket;
use tokio::time;
use tracing::{debug, info, warn, Level};

#[derive(Parser)]
struct Args {
    relay_address: String,
    file: String,

    #[clap(long, default_value_t = 1024)]
    chunk_size: usize,

    /// fraction of chunks to drop deliberately, for exercising resumption
    #[clap(long, default_value_t = 0.0)]
    drop_rate: f64,

    #[clap(long)]
    transfer_id: Option<String>,

    #[clap(long, default_value_t = 20)]
    max_rounds: usize,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

async fn send_chunk(socket: &UdpSocket, relay: SocketAddr, chunk: FileChunkFrame, drop_rate: f64) -> anyhow::Result<()> {
    if rand::random::<f64>() < drop_rate {
        debug!("simulating loss of chunk #{}", chunk.sequence);
        return Ok(());
    }
    socket.send_to(&wire::encode_frame(&Frame::FileChunk(chunk))?, relay).await?;
    Ok(())
}

/// handles incoming control frames until nothing arrives for a while, returning the sequence
///  numbers to re-send
async fn drain_controls(socket: &UdpSocket, transfer: &mut OutgoingTransfer) -> anyhow::Result<Vec<u32>> {
    let mut resend = Vec::new();
    let mut buf = vec![0u8; 65536];
    while let Ok(received) = time::timeout(Duration::from_millis(300), socket.recv_from(&mut buf)).await {
        let (n, _) = received?;
        match wire::decode_frame(&buf[..n]) {
            Ok(Frame::Control(control)) => {
                debug!("received {:?}", control);
                resend.extend(transfer.on_control(&control));
            }
            Ok(other) => warn!("unexpected frame from relay: {:?}", other),
            Err(e) => warn!("undecodable datagram from relay: {}", e),
        }
    }
    resend.sort_unstable();
    resend.dedup();
    Ok(resend)
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let relay: SocketAddr = args.relay_address.parse()?;
    let data = tokio::fs::read(&args.file).await?;
    let filename = Path::new(&args.file)
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| args.file.clone());
    let transfer_id = args.transfer_id.unwrap_or_else(|| format!("{}-{}", filename, rand::random::<u32>()));

    let mut transfer = OutgoingTransfer::new(transfer_id, filename, data, args.chunk_size, &SequenceBoundCrc32)?;
    info!("sending transfer {:?} in {} chunks", transfer.transfer_id(), transfer.total_chunks());

    let socket = UdpSocket::bind(if relay.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" }).await?;

    for chunk in transfer.chunks() {
        send_chunk(&socket, relay, chunk, args.drop_rate).await?;
    }

    for round in 1..=args.max_rounds {
        let mut resend = drain_controls(&socket, &mut transfer).await?;
        if transfer.is_complete() {
            info!("transfer {:?} complete", transfer.transfer_id());
            return Ok(());
        }

        if resend.is_empty() {
            socket.send_to(&wire::encode_control(&transfer.resume_request())?, relay).await?;
            resend = drain_controls(&socket, &mut transfer).await?;
        }
        info!("round {}: re-sending {} chunks", round, resend.len());
        for sequence in resend {
            if let Some(chunk) = transfer.chunk(sequence) {
                send_chunk(&socket, relay, chunk, args.drop_rate).await?;
            }
        }
    }

    bail!("transfer {:?} incomplete after {} rounds - unacknowledged: {:?}", transfer.transfer_id(), args.max_rounds, transfer.unacknowledged())
}
