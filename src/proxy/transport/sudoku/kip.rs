/// KIP：前向安全子握手与会话密钥派生
///
/// 基础握手完成后，在已认证的 RecordConn 上交换一次临时 X25519 公钥，
/// 用 ECDH 结果重新派生两个方向的基础密钥，之后 RecordConn 全部改用新密钥。
///
/// 消息格式：["kip"][type u8][len u16][payload]
/// - ClientHello: ts u64 | userHash 8 | nonce 16 | pubkey 32 | features u32
/// - ServerHello: nonce 16 | pubkey 32 | selected u32
use std::fmt;
use std::time::Instant;

use hkdf::Hkdf;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};
use x25519_dalek::{EphemeralSecret, PublicKey};

use super::handshake::{check_timestamp, unix_time};
use super::record::{BaseKey, RecordConn};
use super::replay::ReplayGuard;
use crate::common::SudokuError;

pub const KIP_MAGIC: &[u8; 3] = b"kip";
pub const TYPE_CLIENT_HELLO: u8 = 0x01;
pub const TYPE_SERVER_HELLO: u8 = 0x02;
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

/// 特性位
pub const FEATURE_KEY_ROTATION: u32 = 1 << 0;
pub const FEATURE_MULTIPLEX: u32 = 1 << 1;
pub const FEATURE_UDP_OVER_TCP: u32 = 1 << 2;
pub const SUPPORTED_FEATURES: u32 = FEATURE_KEY_ROTATION | FEATURE_MULTIPLEX | FEATURE_UDP_OVER_TCP;

const CLIENT_HELLO_LEN: usize = 8 + 8 + 16 + 32 + 4;
const SERVER_HELLO_LEN: usize = 16 + 32 + 4;

/// 预共享密钥的规范形式：去掉首尾空白，64 位十六进制统一小写
pub fn canonical_key(key: &str) -> String {
    let key = key.trim();
    if key.len() == 64 && key.bytes().all(|b| b.is_ascii_hexdigit()) {
        key.to_ascii_lowercase()
    } else {
        key.to_string()
    }
}

/// 由密钥派生的稳定用户标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UserHash(pub [u8; 8]);

impl UserHash {
    pub fn from_key(canonical: &str) -> Self {
        let digest = Sha256::digest(canonical.as_bytes());
        let mut hash = [0u8; 8];
        hash.copy_from_slice(&digest[..8]);
        UserHash(hash)
    }
}

impl fmt::Display for UserHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// 两个方向的基础密钥
#[derive(Clone, Copy)]
pub struct DirectionalKeys {
    pub c2s: BaseKey,
    pub s2c: BaseKey,
}

impl DirectionalKeys {
    fn expand(hk: &Hkdf<Sha256>, c2s_info: &[u8], s2c_info: &[u8]) -> Result<Self, SudokuError> {
        let mut keys = DirectionalKeys {
            c2s: [0u8; 32],
            s2c: [0u8; 32],
        };
        hk.expand(c2s_info, &mut keys.c2s)
            .and_then(|_| hk.expand(s2c_info, &mut keys.s2c))
            .map_err(|_| SudokuError::Crypto("session key expansion failed".to_string()))?;
        Ok(keys)
    }

    /// 握手后、KIP 之前使用的基础密钥
    pub fn from_psk(canonical: &str) -> Result<Self, SudokuError> {
        let ikm = Sha256::digest(canonical.as_bytes());
        let hk = Hkdf::<Sha256>::new(None, &ikm);
        Self::expand(&hk, b"sudoku-psk-c2s", b"sudoku-psk-s2c")
    }

    /// KIP 完成后的前向安全会话密钥
    pub fn from_exchange(canonical: &str, shared: &[u8; 32], nonce: &[u8; 16]) -> Result<Self, SudokuError> {
        let salt = Sha256::digest(canonical.as_bytes());
        let mut ikm = [0u8; 48];
        ikm[..32].copy_from_slice(shared);
        ikm[32..].copy_from_slice(nonce);
        let hk = Hkdf::<Sha256>::new(Some(salt.as_slice()), &ikm);
        Self::expand(&hk, b"sudoku-session-c2s", b"sudoku-session-s2c")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    pub timestamp: u64,
    pub user_hash: UserHash,
    pub nonce: [u8; 16],
    pub public_key: [u8; 32],
    pub features: u32,
}

impl ClientHello {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(CLIENT_HELLO_LEN);
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
        buf.extend_from_slice(&self.user_hash.0);
        buf.extend_from_slice(&self.nonce);
        buf.extend_from_slice(&self.public_key);
        buf.extend_from_slice(&self.features.to_be_bytes());
        buf
    }

    pub fn decode(payload: &[u8]) -> Result<Self, SudokuError> {
        if payload.len() < CLIENT_HELLO_LEN {
            return Err(SudokuError::Handshake(format!(
                "kip client hello too short: {}",
                payload.len()
            )));
        }
        let mut hello = ClientHello {
            timestamp: 0,
            user_hash: UserHash([0; 8]),
            nonce: [0; 16],
            public_key: [0; 32],
            features: 0,
        };
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&payload[..8]);
        hello.timestamp = u64::from_be_bytes(ts);
        hello.user_hash.0.copy_from_slice(&payload[8..16]);
        hello.nonce.copy_from_slice(&payload[16..32]);
        hello.public_key.copy_from_slice(&payload[32..64]);
        hello.features = u32::from_be_bytes([payload[64], payload[65], payload[66], payload[67]]);
        Ok(hello)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHello {
    pub nonce: [u8; 16],
    pub public_key: [u8; 32],
    pub selected_features: u32,
}

impl ServerHello {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(SERVER_HELLO_LEN);
        buf.extend_from_slice(&self.nonce);
        buf.extend_from_slice(&self.public_key);
        buf.extend_from_slice(&self.selected_features.to_be_bytes());
        buf
    }

    pub fn decode(payload: &[u8]) -> Result<Self, SudokuError> {
        if payload.len() < SERVER_HELLO_LEN {
            return Err(SudokuError::Handshake(format!(
                "kip server hello too short: {}",
                payload.len()
            )));
        }
        let mut hello = ServerHello {
            nonce: [0; 16],
            public_key: [0; 32],
            selected_features: 0,
        };
        hello.nonce.copy_from_slice(&payload[..16]);
        hello.public_key.copy_from_slice(&payload[16..48]);
        hello.selected_features = u32::from_be_bytes([payload[48], payload[49], payload[50], payload[51]]);
        Ok(hello)
    }
}

pub async fn write_message<W: AsyncWrite + Unpin>(w: &mut W, msg_type: u8, payload: &[u8]) -> Result<(), SudokuError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(SudokuError::Handshake("kip payload too large".to_string()));
    }
    let mut buf = Vec::with_capacity(6 + payload.len());
    buf.extend_from_slice(KIP_MAGIC);
    buf.push(msg_type);
    buf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    buf.extend_from_slice(payload);
    w.write_all(&buf).await.map_err(SudokuError::from_io)?;
    w.flush().await.map_err(SudokuError::from_io)
}

pub async fn read_message<R: AsyncRead + Unpin>(r: &mut R) -> Result<(u8, Vec<u8>), SudokuError> {
    let mut header = [0u8; 6];
    r.read_exact(&mut header).await.map_err(SudokuError::from_io)?;
    if &header[..3] != KIP_MAGIC {
        return Err(SudokuError::Handshake("bad kip magic".to_string()));
    }
    let len = u16::from_be_bytes([header[4], header[5]]) as usize;
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).await.map_err(SudokuError::from_io)?;
    Ok((header[3], payload))
}

fn agree(secret: EphemeralSecret, peer: [u8; 32]) -> Result<[u8; 32], SudokuError> {
    let shared = secret.diffie_hellman(&PublicKey::from(peer));
    if !shared.was_contributory() {
        return Err(SudokuError::Handshake("kip: non-contributory public key".to_string()));
    }
    Ok(*shared.as_bytes())
}

/// 客户端 KIP，成功后 RecordConn 已切换到会话密钥；返回服务端选定的特性
pub async fn client_kip<S>(conn: &mut RecordConn<S>, canonical: &str, features: u32) -> Result<u32, SudokuError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let secret = EphemeralSecret::random_from_rng(rand::thread_rng());
    let mut nonce = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut nonce);

    let hello = ClientHello {
        timestamp: unix_time(),
        user_hash: UserHash::from_key(canonical),
        nonce,
        public_key: PublicKey::from(&secret).to_bytes(),
        features,
    };
    write_message(conn, TYPE_CLIENT_HELLO, &hello.encode()).await?;

    let (msg_type, payload) = read_message(conn).await?;
    if msg_type != TYPE_SERVER_HELLO {
        return Err(SudokuError::Handshake(format!("kip: unexpected message type {}", msg_type)));
    }
    let reply = ServerHello::decode(&payload)?;
    if reply.nonce != nonce {
        return Err(SudokuError::Handshake("kip: nonce mismatch".to_string()));
    }

    let shared = agree(secret, reply.public_key)?;
    let keys = DirectionalKeys::from_exchange(canonical, &shared, &nonce)?;
    conn.rekey(keys.c2s, keys.s2c);
    debug!(features = reply.selected_features, "kip: session keys installed");
    Ok(reply.selected_features)
}

/// 服务端 KIP
///
/// 时间戳和 nonce 在生成本端临时密钥之前校验，重放不消耗非对称运算。
pub async fn server_kip<S>(
    conn: &mut RecordConn<S>,
    canonical: &str,
    user_hash: UserHash,
    guard: &ReplayGuard,
    supported: u32,
) -> Result<u32, SudokuError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (msg_type, payload) = read_message(conn).await?;
    if msg_type != TYPE_CLIENT_HELLO {
        return Err(SudokuError::Handshake(format!("kip: unexpected message type {}", msg_type)));
    }
    let hello = ClientHello::decode(&payload)?;
    if hello.user_hash != user_hash {
        return Err(SudokuError::Handshake("kip: user hash mismatch".to_string()));
    }
    check_timestamp(hello.timestamp, unix_time())?;
    if !guard.allow(&hello.user_hash.0, &hello.nonce, Instant::now()) {
        warn!(user = %user_hash, "kip replay rejected");
        return Err(SudokuError::ReplayRejected(user_hash.to_string()));
    }

    let secret = EphemeralSecret::random_from_rng(rand::thread_rng());
    let selected = hello.features & supported;
    let reply = ServerHello {
        nonce: hello.nonce,
        public_key: PublicKey::from(&secret).to_bytes(),
        selected_features: selected,
    };
    let shared = agree(secret, hello.public_key)?;
    let keys = DirectionalKeys::from_exchange(canonical, &shared, &hello.nonce)?;

    write_message(conn, TYPE_SERVER_HELLO, &reply.encode()).await?;
    conn.rekey(keys.s2c, keys.c2s);
    debug!(user = %user_hash, features = selected, "kip: session keys installed");
    Ok(selected)
}
