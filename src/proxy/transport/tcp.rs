use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

use super::Dialer;
use crate::common::ProxyStream;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// 纯 TCP 拨号
#[derive(Debug, Clone)]
pub struct TcpDialer {
    pub connect_timeout: Duration,
    pub nodelay: bool,
}

impl Default for TcpDialer {
    fn default() -> Self {
        TcpDialer {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            nodelay: true,
        }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, host: &str, port: u16) -> Result<ProxyStream> {
        let tcp = tokio::time::timeout(self.connect_timeout, TcpStream::connect((host, port)))
            .await
            .with_context(|| format!("connect to {}:{} timed out", host, port))?
            .with_context(|| format!("connect to {}:{}", host, port))?;
        if self.nodelay {
            tcp.set_nodelay(true)?;
        }
        debug!(host, port, "tcp connected");
        Ok(Box::new(tcp))
    }
}
