use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::{task, time};
use tracing::{debug, warn};

use crate::accept_stream::tcp_accept_stream;
use crate::error::SupError;
use crate::gossip::engine::GossipEngine;
use crate::gossip::wire::{read_frame, write_frame, Envelope};
use crate::server_loop::serve_stream;
use crate::shutdown::Shutdown;
use crate::types::GenericBoxedStream;

pub async fn serve_gossip(
    listener: TcpListener,
    engine: Arc<GossipEngine>,
    ring_key: Option<Arc<str>>,
    shutdown: Arc<Shutdown>,
) {
    let io_timeout = engine.timing().pingreq_timeout + engine.timing().ping_timeout;
    let stream: GenericBoxedStream<_> = Box::pin(tcp_accept_stream(listener));
    serve_stream("gossip", stream, shutdown, move |(conn, peer)| {
        let engine = engine.clone();
        let ring_key = ring_key.clone();
        task::spawn(async move {
            if let Err(e) = handle_gossip_connection(conn, peer, &engine, ring_key.as_deref(), io_timeout).await {
                debug!("Gossip exchange with {} failed: {}", peer, e);
            }
        })
    })
    .await;
}

pub async fn handle_gossip_connection<S>(
    mut conn: S,
    peer: SocketAddr,
    engine: &GossipEngine,
    ring_key: Option<&str>,
    io_timeout: Duration,
) -> Result<(), SupError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let envelope = time::timeout(io_timeout, read_frame(&mut conn))
        .await
        .map_err(|_| SupError::NetworkTimeout {
            addr: peer.to_string(),
            timeout: io_timeout,
        })??;
    let message = envelope.open(ring_key).inspect_err(|e| {
        warn!("Rejected gossip from {}: {}", peer, e);
    })?;
    if let Some(reply) = engine.handle(message).await {
        write_frame(&mut conn, &Envelope::seal(ring_key, reply)).await?;
    }
    Ok(())
}
