/// 多路复用会话
///
/// 握手后客户端写 [0xED][version]，此后整条记录层连接交给复用底座。
/// 每条逻辑流开头是 SOCKS 格式的目标地址。
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::handshake::{MUX_MAGIC, MUX_VERSION};
use crate::common::{Address, ProxyStream, SudokuError};
use crate::proxy::mux::{MuxConfig, MuxSession, MuxStream};

pub struct MuxClient {
    session: MuxSession,
}

impl MuxClient {
    /// 开一条到 `target` 的逻辑流
    pub async fn open_tcp(&self, target: &Address) -> Result<MuxStream, SudokuError> {
        let mut stream = self.session.open_stream().await?;
        target.write_to(&mut stream).await?;
        debug!(stream = stream.id(), target = %target, "mux tcp stream opened");
        Ok(stream)
    }

    pub fn session(&self) -> &MuxSession {
        &self.session
    }

    pub fn is_closed(&self) -> bool {
        self.session.is_closed()
    }
}

/// 客户端：握手完成后进入多路复用模式
///
/// 返回的客户端被丢弃时会关闭整条会话。
pub async fn start_multiplex_client(mut stream: ProxyStream, config: MuxConfig) -> Result<MuxClient, SudokuError> {
    stream
        .write_all(&[MUX_MAGIC, MUX_VERSION])
        .await
        .map_err(SudokuError::from_io)?;
    stream.flush().await.map_err(SudokuError::from_io)?;
    Ok(MuxClient {
        session: MuxSession::client(stream, config),
    })
}

pub struct MuxServer {
    session: MuxSession,
}

impl MuxServer {
    /// 接受下一条逻辑流，不读目标地址；会话结束返回 None
    pub async fn accept_stream(&self) -> Option<MuxStream> {
        self.session.accept_stream().await
    }

    /// 读出逻辑流开头的目标地址，应在该流自己的任务里调用
    pub async fn read_target(stream: &mut MuxStream) -> Result<Address, SudokuError> {
        Address::read_from(stream).await
    }

    /// 接受下一条带有效目标地址的逻辑流；会话结束返回 None
    ///
    /// 地址读失败的流被重置后跳过，不影响会话。地址在本调用内串行读取，
    /// 需要并发时改用 `accept_stream` + `read_target`。
    pub async fn accept_tcp(&self) -> Option<(MuxStream, Address)> {
        loop {
            let mut stream = self.session.accept_stream().await?;
            match Self::read_target(&mut stream).await {
                Ok(target) => return Some((stream, target)),
                Err(e) => {
                    debug!(stream = stream.id(), error = %e, "mux stream without target, skipped");
                    stream.reset();
                }
            }
        }
    }

    pub fn session(&self) -> &MuxSession {
        &self.session
    }
}

/// 服务端：前缀已由握手消费，直接在其上建立会话
pub fn accept_multiplex_server(stream: ProxyStream, config: MuxConfig) -> MuxServer {
    MuxServer {
        session: MuxSession::server(stream, config),
    }
}
