//! Talks to a running supervisor's gateway on behalf of the CLI.

use std::net::SocketAddr;
use std::time::Duration;

use hyper::header::AUTHORIZATION;
use hyper::{Body, Client, Request, StatusCode};
use serde::Deserialize;
use tokio::time;

use crate::error::SupError;

/// The parts of a service summary the CLI prints.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct RemoteService {
    pub ident: String,
    pub service_group: String,
    pub status: String,
    pub desired_state: String,
    pub topology: String,
}

/// `GET /services` on the gateway at `addr`.
pub async fn fetch_services(
    addr: SocketAddr,
    token: Option<&str>,
    timeout: Duration,
) -> Result<Vec<RemoteService>, SupError> {
    let url = format!("http://{}/services", addr);
    let network = |reason: String| SupError::Network {
        addr: addr.to_string(),
        reason,
    };

    let mut builder = Request::get(&url);
    if let Some(token) = token {
        builder = builder.header(AUTHORIZATION, format!("Bearer {}", token));
    }
    let req = builder.body(Body::empty()).map_err(|e| network(e.to_string()))?;

    let client: Client<_, Body> = Client::new();
    let resp = match time::timeout(timeout, client.request(req)).await {
        Ok(Ok(resp)) => resp,
        Ok(Err(e)) => return Err(network(e.to_string())),
        Err(_) => {
            return Err(SupError::NetworkTimeout {
                addr: addr.to_string(),
                timeout,
            })
        }
    };
    match resp.status() {
        StatusCode::OK => {}
        StatusCode::UNAUTHORIZED => return Err(SupError::Auth),
        other => return Err(network(format!("gateway answered {}", other))),
    }
    let bytes = hyper::body::to_bytes(resp.into_body())
        .await
        .map_err(|e| network(e.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| network(format!("unexpected body: {}", e)))
}
