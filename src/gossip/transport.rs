use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time;
use tracing::trace;

use crate::error::SupError;
use crate::gossip::wire::{read_frame, write_frame, Envelope, GossipMessage};

/// Request/reply exchange with one peer. The engine wraps every call in its
/// own deadline, so implementations need not time out on their own.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn request(&self, addr: &str, message: GossipMessage) -> Result<GossipMessage, SupError>;
}

/// One TCP connection per exchange.
pub struct TcpTransport {
    ring_key: Option<String>,
    connect_timeout: Duration,
}

impl TcpTransport {
    pub fn new(ring_key: Option<String>, connect_timeout: Duration) -> Self {
        Self {
            ring_key,
            connect_timeout,
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn request(&self, addr: &str, message: GossipMessage) -> Result<GossipMessage, SupError> {
        let mut stream = match time::timeout(self.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(SupError::Network {
                    addr: addr.to_string(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(SupError::NetworkTimeout {
                    addr: addr.to_string(),
                    timeout: self.connect_timeout,
                })
            }
        };
        trace!("Sending {} to {}", message.kind(), addr);
        write_frame(&mut stream, &Envelope::seal(self.ring_key.as_deref(), message)).await?;
        let reply = read_frame(&mut stream).await?;
        reply.open(self.ring_key.as_deref())
    }
}
