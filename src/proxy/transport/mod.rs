pub mod sudoku;
pub mod tcp;

use anyhow::Result;
use async_trait::async_trait;

use crate::common::{Address, ProxyStream};

pub use tcp::TcpDialer;

/// 传输层抽象 trait
///
/// 负责建立到远端服务器的连接并完成本层握手，
/// 返回的流上直接承载到 `addr` 的应用数据。
#[async_trait]
pub trait StreamTransport: Send + Sync {
    async fn connect(&self, addr: &Address) -> Result<ProxyStream>;
}

/// 建立到服务器的原始字节流
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, host: &str, port: u16) -> Result<ProxyStream>;
}
