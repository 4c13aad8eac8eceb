use std::net::SocketAddr;
use std::time::Duration;

use async_stream::stream;
use futures_util::Stream;
use tokio::net::{TcpListener, TcpStream};
use tokio::time;
use tracing::{error, trace};

/// Accepted connections as a stream. Accept errors are logged and skipped.
pub fn tcp_accept_stream(listener: TcpListener) -> impl Stream<Item = (TcpStream, SocketAddr)> {
    stream! {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    trace!("Accepted connection from {}", addr);
                    yield (stream, addr);
                }
                Err(e) => {
                    error!("TCP accept error: {}", e);
                    // usually fd exhaustion; back off briefly
                    time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}
