use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;

use crate::common::SudokuError;
use crate::proxy::transport::sudoku::kip::canonical_key;
use crate::proxy::transport::sudoku::layout::new_custom_layout;
use crate::proxy::transport::sudoku::record::DEFAULT_KEY_UPDATE_AFTER;
use crate::proxy::transport::sudoku::{AeadMethod, ReplayGuard, SudokuConfig, Table};

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub log: LogConfig,
    pub mode: Mode,
    /// 服务端监听地址；客户端本地转发监听地址
    pub listen: String,
    /// 客户端：Sudoku 服务器地址
    #[serde(default)]
    pub server: Option<String>,
    /// 客户端：经隧道转发到的目标
    #[serde(default)]
    pub forward: Option<String>,
    /// 服务端：握手失败的连接转发到这里
    #[serde(default)]
    pub fallback: Option<String>,
    /// 客户端：所有转发连接共享一条多路复用会话
    #[serde(default)]
    pub multiplex: bool,
    pub protocol: ProtocolConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Server,
    Client,
}

impl AppConfig {
    pub fn validate(&self) -> Result<()> {
        if self.listen.trim().is_empty() {
            anyhow::bail!("listen address is required");
        }
        if self.mode == Mode::Client {
            if self.server.as_deref().map_or(true, |s| s.trim().is_empty()) {
                anyhow::bail!("client mode requires 'server'");
            }
            if self.forward.as_deref().map_or(true, |s| s.trim().is_empty()) {
                anyhow::bail!("client mode requires 'forward'");
            }
        }
        if self.mode == Mode::Server && self.forward.is_some() {
            anyhow::bail!("'forward' is only meaningful in client mode");
        }
        self.protocol.validate()?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    pub key: String,
    pub aead_method: String,
    pub table_type: String,
    pub custom_table: String,
    /// 非空时优先于 custom_table，用于换表
    pub custom_tables: Vec<String>,
    pub padding_min: u8,
    pub padding_max: u8,
    pub enable_pure_downlink: bool,
    pub handshake_timeout_secs: u64,
    /// 0 关闭密钥轮换
    pub key_update_after_bytes: u64,
    pub enable_forward_secrecy: bool,
    pub disable_http_mask: bool,
    pub http_mask_host: String,
    pub http_mask_path_root: String,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        ProtocolConfig {
            key: String::new(),
            aead_method: "chacha20-poly1305".to_string(),
            table_type: "prefer_entropy".to_string(),
            custom_table: String::new(),
            custom_tables: Vec::new(),
            padding_min: 0,
            padding_max: 0,
            enable_pure_downlink: true,
            handshake_timeout_secs: 10,
            key_update_after_bytes: DEFAULT_KEY_UPDATE_AFTER,
            enable_forward_secrecy: false,
            disable_http_mask: false,
            http_mask_host: String::new(),
            http_mask_path_root: String::new(),
        }
    }
}

impl ProtocolConfig {
    fn patterns(&self) -> Vec<&str> {
        if self.custom_tables.is_empty() {
            vec![self.custom_table.as_str()]
        } else {
            self.custom_tables.iter().map(String::as_str).collect()
        }
    }

    fn is_ascii(&self) -> bool {
        matches!(self.table_type.trim().to_lowercase().as_str(), "ascii" | "prefer_ascii")
    }

    pub fn validate(&self) -> Result<(), SudokuError> {
        let bad = |msg: String| Err(SudokuError::Config(msg));

        if canonical_key(&self.key).is_empty() {
            return bad("key must not be empty".to_string());
        }
        self.aead_method.parse::<AeadMethod>()?;
        match self.table_type.trim().to_lowercase().as_str() {
            "" | "ascii" | "prefer_ascii" | "entropy" | "prefer_entropy" => {}
            other => return bad(format!("invalid table_type: {}", other)),
        }
        if self.padding_min > self.padding_max {
            return bad(format!(
                "padding_min ({}) exceeds padding_max ({})",
                self.padding_min, self.padding_max
            ));
        }
        if self.padding_max > 100 {
            return bad(format!("padding_max must be within 0..=100, got {}", self.padding_max));
        }
        if self.handshake_timeout_secs == 0 {
            return bad("handshake_timeout_secs must be positive".to_string());
        }

        let has_custom = !self.custom_table.trim().is_empty() || !self.custom_tables.is_empty();
        if !self.custom_table.trim().is_empty() && !self.custom_tables.is_empty() {
            return bad("set either custom_table or custom_tables, not both".to_string());
        }
        if has_custom && self.is_ascii() {
            return bad("custom tables require table_type prefer_entropy".to_string());
        }
        let mut seen = HashSet::new();
        for pattern in &self.custom_tables {
            let normalized = pattern.trim().to_lowercase().replace(' ', "");
            if normalized.is_empty() {
                return bad("custom_tables contains an empty pattern".to_string());
            }
            if !seen.insert(normalized) {
                return bad(format!("duplicate custom table pattern: {}", pattern));
            }
        }
        for pattern in self.patterns() {
            if !pattern.trim().is_empty() {
                new_custom_layout(pattern)?;
            }
        }
        Ok(())
    }

    /// 构建候选表，整个进程共享
    pub fn build_tables(&self) -> Result<Vec<Arc<Table>>, SudokuError> {
        let key = canonical_key(&self.key);
        self.patterns()
            .into_iter()
            .map(|pattern| Table::new(&key, &self.table_type, pattern).map(Arc::new))
            .collect()
    }

    /// 校验并生成握手配置；服务端在所有连接间共享其中的重放过滤器
    pub fn to_sudoku_config(&self) -> Result<SudokuConfig, SudokuError> {
        self.validate()?;
        let mut config = SudokuConfig::new(&self.key, self.build_tables()?);
        config.method = self.aead_method.parse()?;
        config.padding_min = self.padding_min;
        config.padding_max = self.padding_max;
        config.enable_pure_downlink = self.enable_pure_downlink;
        config.handshake_timeout = Duration::from_secs(self.handshake_timeout_secs);
        config.key_update_after_bytes = self.key_update_after_bytes;
        config.enable_forward_secrecy = self.enable_forward_secrecy;
        config.disable_http_mask = self.disable_http_mask;
        config.http_mask_host = self.http_mask_host.clone();
        config.http_mask_path_root = self.http_mask_path_root.clone();
        config.replay_guard = Arc::new(ReplayGuard::default());
        Ok(config)
    }
}
