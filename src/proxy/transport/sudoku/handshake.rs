/// Sudoku 协议握手
///
/// 客户端：
/// 1. HTTP 伪装头（可选）
/// 2. 随机选一张表，包装为 Sudoku 混淆流（上行纯编码，下行按配置）
/// 3. 包装为 AEAD 分帧
/// 4. 发送 16 字节握手 payload（8 字节时间戳 + 8 字节 key hash）
/// 5. 发送 1 字节 downlink mode
/// 6. 切换到 RecordConn，可选 KIP 前向安全
///
/// 服务端状态机：
/// 伪装头 → 表探测 → 握手 payload → downlink mode → (KIP) → 会话类型分流
///
/// 任一步失败都直接关闭连接；在客户端证明持有密钥之前失败的，
/// 可以把已读字节连同原始连接交给调用方回落。
use std::fmt;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::seq::SliceRandom;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{timeout_at, Instant};
use tracing::debug;

use super::conn::{CodecMode, SudokuStream};
use super::crypto::{AeadFramer, AeadMethod};
use super::httpmask;
use super::kip::{self, canonical_key, DirectionalKeys, UserHash, SUPPORTED_FEATURES};
use super::probe::TableSelector;
use super::record::{RecordConn, DEFAULT_KEY_UPDATE_AFTER};
use super::replay::ReplayGuard;
use super::table::Table;
use crate::common::{Address, PrefixedStream, ProxyStream, SudokuError};

pub const HANDSHAKE_PAYLOAD_LEN: usize = 16;
pub const MAX_TIMESTAMP_SKEW: i64 = 60;

pub const DOWNLINK_MODE_PURE: u8 = 0x01;
pub const DOWNLINK_MODE_PACKED: u8 = 0x02;

pub const MUX_MAGIC: u8 = 0xED;
pub const MUX_VERSION: u8 = 0x01;
pub const UOT_MAGIC: u8 = 0xEE;
pub const UOT_VERSION: u8 = 0x01;

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// 握手配置（已校验，表已构建）
#[derive(Clone)]
pub struct SudokuConfig {
    /// 规范化后的密钥
    pub key: String,
    pub method: AeadMethod,
    /// 候选表；客户端随机选一张，服务端盲探测
    pub tables: Vec<Arc<Table>>,
    pub padding_min: u8,
    pub padding_max: u8,
    pub enable_pure_downlink: bool,
    pub handshake_timeout: Duration,
    pub key_update_after_bytes: u64,
    pub enable_forward_secrecy: bool,
    /// 客户端为请求的特性，服务端为支持的特性
    pub features: u32,
    pub disable_http_mask: bool,
    pub http_mask_host: String,
    pub http_mask_path_root: String,
    pub replay_guard: Arc<ReplayGuard>,
}

impl SudokuConfig {
    pub fn new(key: &str, tables: Vec<Arc<Table>>) -> Self {
        SudokuConfig {
            key: canonical_key(key),
            method: AeadMethod::ChaCha20Poly1305,
            tables,
            padding_min: 0,
            padding_max: 0,
            enable_pure_downlink: true,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            key_update_after_bytes: DEFAULT_KEY_UPDATE_AFTER,
            enable_forward_secrecy: false,
            features: SUPPORTED_FEATURES,
            disable_http_mask: false,
            http_mask_host: String::new(),
            http_mask_path_root: String::new(),
            replay_guard: Arc::new(ReplayGuard::default()),
        }
    }

    pub fn downlink_byte(&self) -> u8 {
        if self.enable_pure_downlink {
            DOWNLINK_MODE_PURE
        } else {
            DOWNLINK_MODE_PACKED
        }
    }

    fn downlink_codec(&self) -> CodecMode {
        if self.enable_pure_downlink {
            CodecMode::Pure
        } else {
            CodecMode::Packed
        }
    }

    pub fn user_hash(&self) -> UserHash {
        UserHash::from_key(&self.key)
    }
}

impl fmt::Debug for SudokuConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SudokuConfig")
            .field("method", &self.method)
            .field("tables", &self.tables.len())
            .field("padding", &(self.padding_min, self.padding_max))
            .field("pure_downlink", &self.enable_pure_downlink)
            .field("forward_secrecy", &self.enable_forward_secrecy)
            .finish_non_exhaustive()
    }
}

/// 会话类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionType {
    Tcp,
    UdpOverTcp,
    Multiplex,
}

impl fmt::Display for SessionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionType::Tcp => "tcp",
            SessionType::UdpOverTcp => "uot",
            SessionType::Multiplex => "mux",
        })
    }
}

/// 服务端握手结果
pub struct ServerSession {
    pub stream: ProxyStream,
    pub session_type: SessionType,
    /// 仅 TCP 会话有目标地址
    pub target: Option<Address>,
    pub user_hash: UserHash,
    /// KIP 协商出的特性，未启用 KIP 时为 0
    pub features: u32,
}

impl fmt::Debug for ServerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSession")
            .field("session_type", &self.session_type)
            .field("target", &self.target)
            .field("user_hash", &self.user_hash.to_string())
            .field("features", &self.features)
            .finish()
    }
}

/// 回落：原始连接 + 已经从中读走的全部字节
pub struct Fallback {
    pub stream: ProxyStream,
    pub replay: Vec<u8>,
}

/// 服务端握手失败
pub struct Rejection {
    pub error: SudokuError,
    pub fallback: Option<Fallback>,
}

impl Rejection {
    fn fatal(error: SudokuError) -> Self {
        Rejection { error, fallback: None }
    }

    fn replayable(error: SudokuError, stream: ProxyStream, replay: Vec<u8>) -> Self {
        Rejection {
            error,
            fallback: Some(Fallback { stream, replay }),
        }
    }
}

impl fmt::Debug for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejection")
            .field("error", &self.error)
            .field("replay", &self.fallback.as_ref().map(|fb| fb.replay.len()))
            .finish()
    }
}

pub fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// |now - ts| 超过 60 秒拒绝
pub fn check_timestamp(ts: u64, now: u64) -> Result<(), SudokuError> {
    if now.abs_diff(ts) > MAX_TIMESTAMP_SKEW.unsigned_abs() {
        let skew = (now as i128 - ts as i128).clamp(i64::MIN as i128, i64::MAX as i128) as i64;
        return Err(SudokuError::TimestampSkew { skew });
    }
    Ok(())
}

/// 16 字节握手 payload
pub fn build_handshake_payload(canonical: &str, now: u64) -> [u8; HANDSHAKE_PAYLOAD_LEN] {
    let mut payload = [0u8; HANDSHAKE_PAYLOAD_LEN];
    payload[..8].copy_from_slice(&now.to_be_bytes());
    payload[8..].copy_from_slice(&Sha256::digest(canonical.as_bytes())[..8]);
    payload
}

async fn within<T, F>(deadline: Instant, fut: F) -> Result<T, SudokuError>
where
    F: Future<Output = Result<T, SudokuError>>,
{
    match timeout_at(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(SudokuError::Io(io::Error::new(
            io::ErrorKind::TimedOut,
            "sudoku handshake timed out",
        ))),
    }
}

/// 客户端握手，返回可直接写入会话前缀的加密流
pub async fn client_handshake(raw: ProxyStream, config: &SudokuConfig) -> Result<ProxyStream, SudokuError> {
    let deadline = Instant::now() + config.handshake_timeout;
    within(deadline, client_handshake_inner(raw, config)).await
}

async fn client_handshake_inner(mut raw: ProxyStream, config: &SudokuConfig) -> Result<ProxyStream, SudokuError> {
    if !config.disable_http_mask {
        let host = match config.http_mask_host.as_str() {
            "" => "www.example.com",
            host => host,
        };
        httpmask::write_mask(&mut raw, host, &config.http_mask_path_root).await?;
    }

    let table = config
        .tables
        .choose(&mut rand::thread_rng())
        .cloned()
        .ok_or_else(|| SudokuError::Config("no sudoku table configured".to_string()))?;

    let codec = SudokuStream::with_modes(
        raw,
        table,
        config.padding_min,
        config.padding_max,
        config.downlink_codec(),
        CodecMode::Pure,
    );
    let mut framer = AeadFramer::new(codec, &config.key, config.method)?;
    let io = SudokuError::from_io;
    framer
        .write_all(&build_handshake_payload(&config.key, unix_time()))
        .await
        .map_err(io)?;
    framer.write_all(&[config.downlink_byte()]).await.map_err(io)?;
    framer.flush().await.map_err(io)?;

    let codec = framer.into_inner()?;
    let psk = DirectionalKeys::from_psk(&config.key)?;
    let mut conn = RecordConn::new(codec, config.method, psk.c2s, psk.s2c, config.key_update_after_bytes);

    if config.enable_forward_secrecy {
        let selected = kip::client_kip(&mut conn, &config.key, config.features).await?;
        debug!(features = selected, "sudoku client handshake upgraded");
    }
    debug!(method = %config.method, "sudoku client handshake done");
    Ok(Box::new(conn))
}

/// 服务端握手
pub async fn server_handshake(raw: ProxyStream, config: &SudokuConfig) -> Result<ServerSession, SudokuError> {
    server_handshake_with_fallback(raw, config)
        .await
        .map_err(|rejection| rejection.error)
}

/// 服务端握手，失败时尽可能交回原始连接与已读字节
pub async fn server_handshake_with_fallback(raw: ProxyStream, config: &SudokuConfig) -> Result<ServerSession, Rejection> {
    let result = server_handshake_inner(raw, config).await;
    if let Err(rejection) = &result {
        debug!(
            error = %rejection.error,
            kind = rejection.error.kind().as_str(),
            fallback = rejection.fallback.is_some(),
            "sudoku handshake rejected"
        );
    }
    result
}

type ServerCodec = SudokuStream<PrefixedStream<ProxyStream>>;

/// 从半成品的混淆流中还原原始连接和已读字节
fn unwind(mut replay: Vec<u8>, mut codec: ServerCodec) -> (ProxyStream, Vec<u8>) {
    replay.extend(codec.take_recorded());
    let (raw, unread) = codec.into_inner().into_parts();
    replay.extend(unread);
    (raw, replay)
}

async fn server_handshake_inner(mut raw: ProxyStream, config: &SudokuConfig) -> Result<ServerSession, Rejection> {
    let deadline = Instant::now() + config.handshake_timeout;

    // 伪装头
    let mut consumed = Vec::new();
    let mut head = Vec::new();
    if !config.disable_http_mask {
        match within(deadline, httpmask::strip_mask(&mut raw, &mut consumed)).await {
            Ok(httpmask::MaskOutcome::Stripped(header_len)) => {
                let rest = consumed.split_off(header_len);
                head = std::mem::replace(&mut consumed, rest);
            }
            Ok(httpmask::MaskOutcome::Absent) => {}
            Err(e) => return Err(Rejection::replayable(e, raw, consumed)),
        }
    }

    // 表探测
    let mut selector = TableSelector::new(&config.key, config.method, consumed).map_err(Rejection::fatal)?;
    let index = match within(deadline, selector.select(&mut raw, &config.tables)).await {
        Ok(index) => index,
        Err(e) => {
            head.extend(selector.into_probe());
            return Err(Rejection::replayable(e, raw, head));
        }
    };
    let table = config.tables[index].clone();

    let mut codec = SudokuStream::with_modes(
        PrefixedStream::new(selector.into_probe(), raw),
        table,
        config.padding_min,
        config.padding_max,
        CodecMode::Pure,
        config.downlink_codec(),
    );
    codec.start_recording();
    let mut framer = match AeadFramer::new(codec, &config.key, config.method) {
        Ok(framer) => framer,
        Err(e) => return Err(Rejection::fatal(e)),
    };

    // 握手 payload
    let mut payload = [0u8; HANDSHAKE_PAYLOAD_LEN];
    let read = within(deadline, async {
        framer.read_exact(&mut payload).await.map_err(SudokuError::from_io)?;
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&payload[..8]);
        check_timestamp(u64::from_be_bytes(ts), unix_time())
    })
    .await;
    if let Err(e) = read {
        let (raw, replay) = unwind(head, framer.into_inner_lossy());
        return Err(Rejection::replayable(e, raw, replay));
    }
    let mut hash = [0u8; 8];
    hash.copy_from_slice(&payload[8..]);
    let user_hash = UserHash(hash);

    // 客户端已证明持有密钥，不再需要回放
    framer.get_mut().stop_recording();

    let mode = within(deadline, async { framer.read_u8().await.map_err(SudokuError::from_io) })
        .await
        .map_err(Rejection::fatal)?;
    let expected = config.downlink_byte();
    if mode != expected {
        return Err(Rejection::fatal(SudokuError::DownlinkMismatch { expected, got: mode }));
    }

    let codec = framer.into_inner().map_err(Rejection::fatal)?;
    let psk = DirectionalKeys::from_psk(&config.key).map_err(Rejection::fatal)?;
    let mut conn = RecordConn::new(codec, config.method, psk.s2c, psk.c2s, config.key_update_after_bytes);

    let mut features = 0;
    if config.enable_forward_secrecy {
        features = within(
            deadline,
            kip::server_kip(&mut conn, &config.key, user_hash, &config.replay_guard, config.features),
        )
        .await
        .map_err(Rejection::fatal)?;
    }

    // 会话类型分流
    let (session_type, target) = within(deadline, demux_session(&mut conn))
        .await
        .map_err(Rejection::fatal)?;
    debug!(
        user = %user_hash,
        table = index,
        session = %session_type,
        target = ?target,
        "sudoku server handshake done"
    );

    Ok(ServerSession {
        stream: Box::new(conn),
        session_type,
        target,
        user_hash,
        features,
    })
}

async fn demux_session(conn: &mut RecordConn<ServerCodec>) -> Result<(SessionType, Option<Address>), SudokuError> {
    let io = SudokuError::from_io;
    let first = conn.read_u8().await.map_err(io)?;
    match first {
        MUX_MAGIC => {
            let version = conn.read_u8().await.map_err(io)?;
            if version != MUX_VERSION {
                return Err(SudokuError::UnsupportedVersion {
                    what: "multiplex",
                    version,
                });
            }
            Ok((SessionType::Multiplex, None))
        }
        UOT_MAGIC => {
            let version = conn.read_u8().await.map_err(io)?;
            if version != UOT_VERSION {
                return Err(SudokuError::UnsupportedVersion {
                    what: "udp-over-tcp",
                    version,
                });
            }
            Ok((SessionType::UdpOverTcp, None))
        }
        0x01 | 0x03 | 0x04 => {
            let target = Address::read_with_atyp(conn, first).await?;
            Ok((SessionType::Tcp, Some(target)))
        }
        other => Err(SudokuError::UnknownSessionType(other)),
    }
}

/// TCP 会话前缀：目标地址帧
pub async fn write_tcp_preface(stream: &mut ProxyStream, target: &Address) -> Result<(), SudokuError> {
    target.write_to(stream).await?;
    stream.flush().await.map_err(SudokuError::from_io)
}
