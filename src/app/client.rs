use std::sync::Arc;

use anyhow::Result;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::common::{Address, SudokuError};
use crate::proxy::mux::MuxConfig;
use crate::proxy::relay::relay;
use crate::proxy::transport::sudoku::{MuxClient, SudokuTransport};
use crate::proxy::transport::StreamTransport;

/// 本地端口转发：每条入站连接经隧道连到固定目标
pub struct ForwardClient {
    transport: SudokuTransport,
    forward: Address,
    multiplex: bool,
    mux: Mutex<Option<Arc<MuxClient>>>,
}

impl ForwardClient {
    pub fn new(transport: SudokuTransport, forward: Address, multiplex: bool) -> Arc<Self> {
        Arc::new(Self {
            transport,
            forward,
            multiplex,
            mux: Mutex::new(None),
        })
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!(forward = %self.forward, multiplex = self.multiplex, "forward client started");
        loop {
            let (local, source) = match listener.accept().await {
                Ok(v) => v,
                Err(e) => {
                    error!(error = %e, "accept failed");
                    continue;
                }
            };
            let client = self.clone();
            tokio::spawn(async move {
                if let Err(e) = client.forward(local).await {
                    let permanent = e
                        .downcast_ref::<SudokuError>()
                        .map_or(false, |se| se.kind().is_permanent());
                    if permanent {
                        warn!(peer = %source, error = %e, "forward failed, check configuration");
                    } else {
                        debug!(peer = %source, error = %e, "forward failed");
                    }
                }
            });
        }
    }

    async fn forward(&self, local: TcpStream) -> Result<()> {
        if self.multiplex {
            let mux = self.mux_session().await?;
            let stream = mux.open_tcp(&self.forward).await?;
            relay(local, stream).await?;
        } else {
            let stream = self.transport.connect(&self.forward).await?;
            relay(local, stream).await?;
        }
        Ok(())
    }

    /// 复用已有会话，断开后重新握手
    async fn mux_session(&self) -> Result<Arc<MuxClient>> {
        let mut slot = self.mux.lock().await;
        if let Some(mux) = slot.as_ref().filter(|m| !m.is_closed()) {
            return Ok(mux.clone());
        }
        let mux = Arc::new(self.transport.connect_mux(MuxConfig::default()).await?);
        *slot = Some(mux.clone());
        Ok(mux)
    }
}
