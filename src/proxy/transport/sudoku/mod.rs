/// Sudoku 传输层
///
/// 把字节编码成数独提示数的混淆协议：混淆编解码 → AEAD 分帧 →
/// 带 epoch 轮换的记录层，握手之后按会话类型承载 TCP、UoT 或多路复用。

pub mod conn;
pub mod crypto;
pub mod framing;
pub mod grid;
pub mod handshake;
pub mod httpmask;
pub mod kip;
pub mod layout;
pub mod multiplex;
pub mod packed;
pub mod probe;
pub mod record;
pub mod replay;
pub mod table;
pub mod uot;

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::debug;

use super::{Dialer, StreamTransport, TcpDialer};
use crate::common::{Address, ProxyStream};
use crate::proxy::mux::MuxConfig;

pub use crypto::AeadMethod;
pub use handshake::{
    client_handshake, server_handshake, server_handshake_with_fallback, write_tcp_preface, Fallback, Rejection,
    ServerSession, SessionType, SudokuConfig,
};
pub use multiplex::{accept_multiplex_server, start_multiplex_client, MuxClient, MuxServer};
pub use replay::ReplayGuard;
pub use table::Table;

/// Sudoku 客户端传输
pub struct SudokuTransport {
    server_addr: String,
    server_port: u16,
    config: SudokuConfig,
    dialer: Arc<dyn Dialer>,
}

impl SudokuTransport {
    pub fn new(server_addr: String, server_port: u16, config: SudokuConfig) -> Self {
        Self::with_dialer(server_addr, server_port, config, Arc::new(TcpDialer::default()))
    }

    pub fn with_dialer(server_addr: String, server_port: u16, config: SudokuConfig, dialer: Arc<dyn Dialer>) -> Self {
        SudokuTransport {
            server_addr,
            server_port,
            config,
            dialer,
        }
    }

    pub fn config(&self) -> &SudokuConfig {
        &self.config
    }

    async fn handshake(&self) -> Result<ProxyStream> {
        let raw = self.dialer.dial(&self.server_addr, self.server_port).await?;
        let stream = client_handshake(raw, &self.config)
            .await
            .with_context(|| format!("sudoku handshake with {}:{}", self.server_addr, self.server_port))?;
        debug!(server = %self.server_addr, port = self.server_port, "sudoku handshake complete");
        Ok(stream)
    }

    /// 握手后进入 UDP over TCP 会话
    pub async fn connect_uot(&self) -> Result<ProxyStream> {
        let mut stream = self.handshake().await?;
        uot::start_uot_client(&mut stream).await?;
        Ok(stream)
    }

    /// 握手后进入多路复用会话
    pub async fn connect_mux(&self, mux: MuxConfig) -> Result<MuxClient> {
        let stream = self.handshake().await?;
        Ok(start_multiplex_client(stream, mux).await?)
    }
}

#[async_trait]
impl StreamTransport for SudokuTransport {
    async fn connect(&self, addr: &Address) -> Result<ProxyStream> {
        let mut stream = self.handshake().await?;
        write_tcp_preface(&mut stream, addr).await?;
        Ok(stream)
    }
}
