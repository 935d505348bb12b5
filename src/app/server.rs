use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::common::ProxyStream;
use crate::proxy::mux::MuxConfig;
use crate::proxy::relay::{relay_fallback, relay_to_target};
use crate::proxy::transport::sudoku::uot::relay_uot;
use crate::proxy::transport::sudoku::{
    accept_multiplex_server, server_handshake_with_fallback, MuxServer, ServerSession, SessionType, SudokuConfig,
};

/// Sudoku 服务端：握手、按会话类型中继、失败回落
pub struct SudokuServer {
    config: SudokuConfig,
    fallback: Option<String>,
}

impl SudokuServer {
    pub fn new(config: SudokuConfig, fallback: Option<String>) -> Arc<Self> {
        Arc::new(Self { config, fallback })
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!(
            tables = self.config.tables.len(),
            method = %self.config.method,
            fallback = self.fallback.as_deref().unwrap_or("-"),
            "sudoku server started"
        );
        loop {
            let (tcp, source) = match listener.accept().await {
                Ok(v) => v,
                Err(e) => {
                    error!(error = %e, "accept failed");
                    continue;
                }
            };
            let _ = tcp.set_nodelay(true);
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle(Box::new(tcp), source).await {
                    debug!(peer = %source, error = %e, "connection finished with error");
                }
            });
        }
    }

    pub async fn handle(&self, raw: ProxyStream, source: SocketAddr) -> Result<()> {
        let session = match server_handshake_with_fallback(raw, &self.config).await {
            Ok(session) => session,
            Err(rejection) => {
                let kind = rejection.error.kind();
                debug!(peer = %source, kind = kind.as_str(), suspicious = kind.is_suspicious(), "handshake rejected");
                return match (rejection.fallback, self.fallback.as_deref()) {
                    (Some(fallback), Some(decoy)) => {
                        debug!(peer = %source, "handing rejected connection to fallback");
                        relay_fallback(fallback, decoy).await.map(|_| ())
                    }
                    _ => Err(rejection.error.into()),
                };
            }
        };
        debug!(
            peer = %source,
            user = %session.user_hash,
            session = %session.session_type,
            features = session.features,
            "sudoku session accepted"
        );
        self.dispatch(session).await
    }

    async fn dispatch(&self, session: ServerSession) -> Result<()> {
        let ServerSession {
            stream,
            session_type,
            target,
            ..
        } = session;
        match session_type {
            SessionType::Tcp => {
                let Some(target) = target else {
                    anyhow::bail!("tcp session without target");
                };
                relay_to_target(stream, &target).await?;
            }
            SessionType::UdpOverTcp => relay_uot(stream).await?,
            SessionType::Multiplex => {
                let mux = accept_multiplex_server(stream, MuxConfig::default());
                // 目标地址在各流自己的任务里读，单条流出错不影响整条会话
                while let Some(mut stream) = mux.accept_stream().await {
                    tokio::spawn(async move {
                        let id = stream.id();
                        let target = match MuxServer::read_target(&mut stream).await {
                            Ok(target) => target,
                            Err(e) => {
                                debug!(stream = id, error = %e, "mux stream without target");
                                stream.reset();
                                return;
                            }
                        };
                        if let Err(e) = relay_to_target(Box::new(stream), &target).await {
                            debug!(stream = id, target = %target, error = %e, "mux stream relay failed");
                        }
                    });
                }
            }
        }
        Ok(())
    }
}
