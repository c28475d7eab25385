//! TCP connect probe driver.

use std::net::ToSocketAddrs;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use super::{Args, Prober, Status};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Prober that considers a backend up when its port accepts a connection.
pub struct TcpProber {
    address: String,
    timeout: Duration,
}

impl TcpProber {
    /// Build a prober for the backend endpoint; `args` may override host,
    /// port and timeout.
    pub fn new(host: &str, port: u16, args: &Args) -> Self {
        let host = args.host.as_deref().unwrap_or(host);
        let port = args.port.unwrap_or(port);
        Self {
            address: format!("{host}:{port}"),
            timeout: args.timeout.map_or(DEFAULT_TIMEOUT, Duration::from_secs),
        }
    }
}

#[async_trait]
impl Prober for TcpProber {
    async fn check(&self) -> Status {
        let addr = match self.address.to_socket_addrs() {
            Ok(mut addrs) => match addrs.next() {
                Some(addr) => addr,
                None => {
                    debug!(address = %self.address, "no addresses resolved");
                    return Status::Down;
                }
            },
            Err(e) => {
                debug!(address = %self.address, error = %e, "address resolution failed");
                return Status::Down;
            }
        };

        match timeout(self.timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_stream)) => Status::Up,
            Ok(Err(e)) => {
                debug!(address = %self.address, error = %e, "connection refused");
                Status::Down
            }
            Err(_) => {
                debug!(address = %self.address, timeout = ?self.timeout, "connection timed out");
                Status::Down
            }
        }
    }
}
