/// AEAD 加密
///
/// 支持：
/// - AES-128-GCM
/// - ChaCha20-Poly1305
/// - none（透传，仅依赖 Sudoku 混淆层）
///
/// `AeadFramer` 只用于握手阶段：静态密钥 + 每帧随机 nonce。
/// 帧格式：[2 字节帧长][nonce][密文+tag]
use std::fmt;
use std::io;
use std::pin::Pin;
use std::str::FromStr;
use std::task::{ready, Context, Poll};

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::Aes128Gcm;
use chacha20poly1305::ChaCha20Poly1305;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::framing::{FrameReader, WriteBuffer};
use crate::common::SudokuError;

pub const TAG_SIZE: usize = 16;
pub const NONCE_SIZE: usize = 12;
pub const MAX_PAYLOAD_SIZE: usize = 16384;

/// AEAD 方法
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AeadMethod {
    Aes128Gcm,
    ChaCha20Poly1305,
    None,
}

impl AeadMethod {
    pub fn name(self) -> &'static str {
        match self {
            AeadMethod::Aes128Gcm => "aes-128-gcm",
            AeadMethod::ChaCha20Poly1305 => "chacha20-poly1305",
            AeadMethod::None => "none",
        }
    }

    pub fn key_len(self) -> usize {
        match self {
            AeadMethod::Aes128Gcm => 16,
            AeadMethod::ChaCha20Poly1305 => 32,
            AeadMethod::None => 0,
        }
    }

    /// nonce 与 tag 是否存在
    pub fn is_encrypting(self) -> bool {
        self != AeadMethod::None
    }

    pub fn nonce_size(self) -> usize {
        if self.is_encrypting() {
            NONCE_SIZE
        } else {
            0
        }
    }

    pub fn tag_size(self) -> usize {
        if self.is_encrypting() {
            TAG_SIZE
        } else {
            0
        }
    }
}

impl FromStr for AeadMethod {
    type Err = SudokuError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "aes-128-gcm" => Ok(AeadMethod::Aes128Gcm),
            "chacha20-poly1305" | "" => Ok(AeadMethod::ChaCha20Poly1305),
            "none" => Ok(AeadMethod::None),
            other => Err(SudokuError::Config(format!("unsupported AEAD method: {}", other))),
        }
    }
}

impl fmt::Display for AeadMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub enum AeadCipher {
    Aes128Gcm(Box<Aes128Gcm>),
    ChaCha20(Box<ChaCha20Poly1305>),
    None,
}

impl AeadCipher {
    /// `key` 长度必须不小于方法要求，多余部分忽略
    pub fn new(method: AeadMethod, key: &[u8]) -> Result<Self, SudokuError> {
        if key.len() < method.key_len() {
            return Err(SudokuError::Crypto(format!(
                "{} needs a {}-byte key",
                method,
                method.key_len()
            )));
        }
        let key = &key[..method.key_len()];
        Ok(match method {
            AeadMethod::Aes128Gcm => {
                AeadCipher::Aes128Gcm(Box::new(Aes128Gcm::new(GenericArray::from_slice(key))))
            }
            AeadMethod::ChaCha20Poly1305 => AeadCipher::ChaCha20(Box::new(ChaCha20Poly1305::new(
                GenericArray::from_slice(key),
            ))),
            AeadMethod::None => AeadCipher::None,
        })
    }

    /// 以 SHA256(key_material) 作为静态密钥
    pub fn from_key_material(method: AeadMethod, material: &str) -> Result<Self, SudokuError> {
        let digest = Sha256::digest(material.as_bytes());
        Self::new(method, &digest)
    }

    pub fn method(&self) -> AeadMethod {
        match self {
            AeadCipher::Aes128Gcm(_) => AeadMethod::Aes128Gcm,
            AeadCipher::ChaCha20(_) => AeadMethod::ChaCha20Poly1305,
            AeadCipher::None => AeadMethod::None,
        }
    }

    pub fn seal(&self, nonce: &[u8], aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, SudokuError> {
        let payload = Payload { msg: plaintext, aad };
        let sealed = match self {
            AeadCipher::Aes128Gcm(c) => c.encrypt(GenericArray::from_slice(nonce), payload),
            AeadCipher::ChaCha20(c) => c.encrypt(GenericArray::from_slice(nonce), payload),
            AeadCipher::None => return Ok(plaintext.to_vec()),
        };
        sealed.map_err(|_| SudokuError::Crypto("AEAD encryption failed".to_string()))
    }

    pub fn open(&self, nonce: &[u8], aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, SudokuError> {
        let payload = Payload { msg: ciphertext, aad };
        let opened = match self {
            AeadCipher::Aes128Gcm(c) => c.decrypt(GenericArray::from_slice(nonce), payload),
            AeadCipher::ChaCha20(c) => c.decrypt(GenericArray::from_slice(nonce), payload),
            AeadCipher::None => return Ok(ciphertext.to_vec()),
        };
        opened.map_err(|_| SudokuError::DecryptFailed)
    }
}

/// 握手阶段的 AEAD 分帧流
pub struct AeadFramer<S> {
    inner: S,
    cipher: AeadCipher,
    reader: FrameReader,
    read_pending: Vec<u8>,
    read_pos: usize,
    write_buf: WriteBuffer,
}

impl<S> AeadFramer<S> {
    pub fn new(inner: S, key_material: &str, method: AeadMethod) -> Result<Self, SudokuError> {
        let cipher = AeadCipher::from_key_material(method, key_material)?;
        Ok(AeadFramer {
            inner,
            reader: FrameReader::new(Self::min_frame_len(method), Self::max_frame_len(method)),
            cipher,
            read_pending: Vec::new(),
            read_pos: 0,
            write_buf: WriteBuffer::default(),
        })
    }

    pub fn min_frame_len(method: AeadMethod) -> usize {
        method.nonce_size() + method.tag_size() + 1
    }

    pub fn max_frame_len(method: AeadMethod) -> usize {
        method.nonce_size() + method.tag_size() + MAX_PAYLOAD_SIZE
    }

    /// 携带 `plaintext_len` 字节明文的帧长
    pub fn frame_len_for(method: AeadMethod, plaintext_len: usize) -> usize {
        method.nonce_size() + method.tag_size() + plaintext_len
    }

    /// 解开一帧 body（nonce + 密文）
    pub fn open_body(cipher: &AeadCipher, body: &[u8]) -> Result<Vec<u8>, SudokuError> {
        let nonce_size = cipher.method().nonce_size();
        if body.len() < nonce_size {
            return Err(SudokuError::InvalidFrame("frame shorter than nonce".to_string()));
        }
        let (nonce, ciphertext) = body.split_at(nonce_size);
        cipher.open(nonce, &[], ciphertext)
    }

    pub fn cipher(&self) -> &AeadCipher {
        &self.cipher
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// 不检查帧状态直接取回底层流，仅用于放弃握手后的回落
    pub fn into_inner_lossy(self) -> S {
        self.inner
    }

    /// 取回底层流。要求读写两侧都停在帧边界，且没有未读明文。
    pub fn into_inner(self) -> Result<S, SudokuError> {
        if self.read_pos < self.read_pending.len() || !self.reader.is_idle() {
            return Err(SudokuError::Handshake(
                "unexpected data after handshake frames".to_string(),
            ));
        }
        if !self.write_buf.is_empty() {
            return Err(SudokuError::Handshake(
                "handshake frames not flushed".to_string(),
            ));
        }
        Ok(self.inner)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for AeadFramer<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.write_buf.poll_drain(&mut this.inner, cx))?;
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let payload = &buf[..buf.len().min(MAX_PAYLOAD_SIZE)];

        let mut nonce = [0u8; NONCE_SIZE];
        let nonce = &mut nonce[..this.cipher.method().nonce_size()];
        rand::thread_rng().fill_bytes(nonce);
        let sealed = this.cipher.seal(nonce, &[], payload).map_err(io::Error::from)?;
        this.write_buf.push_frame(&[&nonce[..], &sealed[..]]);

        if let Poll::Ready(Err(e)) = this.write_buf.poll_drain(&mut this.inner, cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(payload.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.write_buf.poll_drain(&mut this.inner, cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        ready!(self.as_mut().poll_flush(cx))?;
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for AeadFramer<S> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.read_pos >= this.read_pending.len() {
            let Some(body) = ready!(this.reader.poll_frame(&mut this.inner, cx))? else {
                return Poll::Ready(Ok(()));
            };
            this.read_pending = Self::open_body(&this.cipher, &body).map_err(io::Error::from)?;
            this.read_pos = 0;
        }
        let available = &this.read_pending[this.read_pos..];
        let n = available.len().min(buf.remaining());
        buf.put_slice(&available[..n]);
        this.read_pos += n;
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn method_names() {
        assert_eq!("AES-128-GCM".parse::<AeadMethod>().unwrap(), AeadMethod::Aes128Gcm);
        assert_eq!("none".parse::<AeadMethod>().unwrap(), AeadMethod::None);
        assert!("rc4".parse::<AeadMethod>().is_err());
        assert_eq!(AeadMethod::ChaCha20Poly1305.to_string(), "chacha20-poly1305");
    }

    #[test]
    fn seal_open_with_aad() {
        for method in [AeadMethod::Aes128Gcm, AeadMethod::ChaCha20Poly1305] {
            let cipher = AeadCipher::new(method, &[7u8; 32]).unwrap();
            let nonce = [1u8; NONCE_SIZE];
            let ct = cipher.seal(&nonce, b"hdr", b"secret").unwrap();
            assert_eq!(ct.len(), 6 + TAG_SIZE);
            assert_eq!(cipher.open(&nonce, b"hdr", &ct).unwrap(), b"secret");
            assert!(matches!(
                cipher.open(&nonce, b"other", &ct),
                Err(SudokuError::DecryptFailed)
            ));
        }
    }

    #[tokio::test]
    async fn framer_roundtrip_all_methods() {
        for method in [AeadMethod::Aes128Gcm, AeadMethod::ChaCha20Poly1305, AeadMethod::None] {
            let (a, b) = tokio::io::duplex(64 * 1024);
            let mut w = AeadFramer::new(a, "framer-key", method).unwrap();
            let mut r = AeadFramer::new(b, "framer-key", method).unwrap();
            w.write_all(b"0123456789abcdef").await.unwrap();
            w.write_all(&[0x02]).await.unwrap();
            w.flush().await.unwrap();

            let mut payload = [0u8; 16];
            r.read_exact(&mut payload).await.unwrap();
            assert_eq!(&payload, b"0123456789abcdef");
            assert_eq!(r.read_u8().await.unwrap(), 0x02);
            assert!(r.into_inner().is_ok());
        }
    }

    #[tokio::test]
    async fn wrong_key_fails_to_decrypt() {
        let (a, b) = tokio::io::duplex(4096);
        let mut w = AeadFramer::new(a, "right", AeadMethod::ChaCha20Poly1305).unwrap();
        let mut r = AeadFramer::new(b, "wrong", AeadMethod::ChaCha20Poly1305).unwrap();
        w.write_all(b"hello").await.unwrap();
        let mut out = [0u8; 5];
        let err = r.read_exact(&mut out).await.unwrap_err();
        assert!(matches!(SudokuError::from_io(err), SudokuError::DecryptFailed));
    }

    #[test]
    fn frame_len_bounds() {
        assert_eq!(AeadFramer::<()>::frame_len_for(AeadMethod::Aes128Gcm, 16), 44);
        assert_eq!(AeadFramer::<()>::frame_len_for(AeadMethod::None, 16), 16);
    }
}
