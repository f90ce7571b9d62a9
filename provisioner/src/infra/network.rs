//! Network infrastructure: implements `NetworkProbe` with a bounded TCP connect.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::application::ports::NetworkProbe;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Production implementation that performs real network checks.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioNetworkProbe;

#[async_trait]
impl NetworkProbe for TokioNetworkProbe {
    async fn check_tcp_connectivity(&self, host: &str, port: u16) -> Result<bool> {
        let connected =
            tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port))).await;
        Ok(matches!(connected, Ok(Ok(_))))
    }
}
