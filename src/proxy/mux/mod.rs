//! 通用多路复用底座（yamux 帧格式）

pub mod session;
pub mod yamux;

use std::time::Duration;

pub use session::{MuxSession, MuxStream};

/// 每条流的初始接收窗口
pub const DEFAULT_WINDOW: u32 = 256 * 1024;
pub const DEFAULT_MAX_FRAME: usize = 16 * 1024;
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct MuxConfig {
    pub window: u32,
    /// 单个 Data 帧的最大负载，不应超过 window
    pub max_frame: usize,
    /// 零表示不发心跳
    pub keepalive_interval: Duration,
    pub accept_backlog: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        MuxConfig {
            window: DEFAULT_WINDOW,
            max_frame: DEFAULT_MAX_FRAME,
            keepalive_interval: DEFAULT_KEEPALIVE,
            accept_backlog: 256,
        }
    }
}
