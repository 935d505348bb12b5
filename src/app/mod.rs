pub mod client;
pub mod server;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::info;

use crate::common::Address;
use crate::config::{AppConfig, Mode};
use crate::proxy::transport::sudoku::SudokuTransport;

use client::ForwardClient;
use server::SudokuServer;

pub struct App {
    config: AppConfig,
}

impl App {
    pub fn new(config: AppConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub async fn run(self) -> Result<()> {
        let sudoku = self.config.protocol.to_sudoku_config()?;
        let listener = TcpListener::bind(&self.config.listen)
            .await
            .with_context(|| format!("bind {}", self.config.listen))?;
        info!(mode = ?self.config.mode, addr = %self.config.listen, "sudoku listening");

        match self.config.mode {
            Mode::Server => SudokuServer::new(sudoku, self.config.fallback).serve(listener).await,
            Mode::Client => {
                let server = self.config.server.as_deref().unwrap_or_default();
                let server: Address = server.parse().with_context(|| format!("invalid server address {}", server))?;
                let forward = self.config.forward.as_deref().unwrap_or_default();
                let forward: Address = forward.parse().with_context(|| format!("invalid forward target {}", forward))?;
                let transport = SudokuTransport::new(server.host(), server.port(), sudoku);
                ForwardClient::new(transport, forward, self.config.multiplex)
                    .serve(listener)
                    .await
            }
        }
    }
}
