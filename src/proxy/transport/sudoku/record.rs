/// 记录层
///
/// 握手完成后的正式分帧：每个方向独立的密钥序列，nonce 由 (epoch, seq)
/// 确定性生成，同一个 (epoch, seq) 永远只加密一帧。
///
/// 帧格式：[2 字节 body 长][epoch u32][seq u64][密文+tag]
/// 12 字节头部既是 nonce 也是 AAD。
///
/// 发送端累计明文达到 `key_update_after × (epoch + 1)` 后进入下一个 epoch，
/// seq 归零；接收端严格按序校验，不做滑动窗口。
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use hkdf::Hkdf;
use sha2::Sha256;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::trace;

use super::crypto::{AeadCipher, AeadMethod};
use super::framing::{FrameReader, WriteBuffer};
use crate::common::SudokuError;

pub const HEADER_SIZE: usize = 12;
pub const MAX_PLAINTEXT: usize = 16 * 1024;
/// 接收端允许的最大 epoch 跳跃
pub const MAX_EPOCH_JUMP: u32 = 8;
pub const DEFAULT_KEY_UPDATE_AFTER: u64 = 32 * 1024 * 1024;

/// 方向基础密钥
pub type BaseKey = [u8; 32];

/// 由基础密钥派生某个 epoch 的 AEAD
fn derive_epoch_cipher(method: AeadMethod, base: &BaseKey, epoch: u32) -> Result<AeadCipher, SudokuError> {
    let mut info = Vec::with_capacity(32);
    info.extend_from_slice(b"sudoku-record:");
    info.extend_from_slice(method.name().as_bytes());
    info.extend_from_slice(&epoch.to_be_bytes());

    let mut okm = [0u8; 32];
    Hkdf::<Sha256>::new(None, base)
        .expand(&info, &mut okm)
        .map_err(|_| SudokuError::Crypto("record key expansion failed".to_string()))?;
    AeadCipher::new(method, &okm)
}

fn record_header(epoch: u32, seq: u64) -> [u8; HEADER_SIZE] {
    let mut header = [0u8; HEADER_SIZE];
    header[..4].copy_from_slice(&epoch.to_be_bytes());
    header[4..].copy_from_slice(&seq.to_be_bytes());
    header
}

/// 单方向的密钥状态
struct Direction {
    base: BaseKey,
    epoch: u32,
    seq: u64,
    bytes_since_rekey: u64,
    cached: Option<(u32, AeadCipher)>,
}

impl Direction {
    fn new(base: BaseKey) -> Self {
        Direction {
            base,
            epoch: 0,
            seq: 0,
            bytes_since_rekey: 0,
            cached: None,
        }
    }

    fn cipher(&mut self, method: AeadMethod, epoch: u32) -> Result<&AeadCipher, SudokuError> {
        let stale = !matches!(&self.cached, Some((e, _)) if *e == epoch);
        if stale {
            let cipher = derive_epoch_cipher(method, &self.base, epoch)?;
            self.cached = Some((epoch, cipher));
        }
        match &self.cached {
            Some((_, cipher)) => Ok(cipher),
            None => Err(SudokuError::Crypto("record cipher missing".to_string())),
        }
    }
}

pub struct RecordConn<S> {
    inner: S,
    method: AeadMethod,
    key_update_after: u64,
    send: Direction,
    recv: Direction,
    reader: FrameReader,
    read_pending: Vec<u8>,
    read_pos: usize,
    write_buf: WriteBuffer,
}

impl<S> RecordConn<S> {
    /// `key_update_after` 为 0 时关闭自动轮换
    pub fn new(inner: S, method: AeadMethod, send_base: BaseKey, recv_base: BaseKey, key_update_after: u64) -> Self {
        let overhead = HEADER_SIZE + method.tag_size();
        RecordConn {
            inner,
            method,
            key_update_after,
            send: Direction::new(send_base),
            recv: Direction::new(recv_base),
            reader: FrameReader::new(overhead, overhead + MAX_PLAINTEXT),
            read_pending: Vec::new(),
            read_pos: 0,
            write_buf: WriteBuffer::default(),
        }
    }

    pub fn method(&self) -> AeadMethod {
        self.method
    }

    /// 当前 (发送 epoch, 接收 epoch)
    pub fn epochs(&self) -> (u32, u32) {
        (self.send.epoch, self.recv.epoch)
    }

    /// 替换两个方向的基础密钥并清零全部计数
    ///
    /// 已经加密进写缓冲的帧仍按旧密钥发出，调用方需在帧边界上调用。
    pub fn rekey(&mut self, send_base: BaseKey, recv_base: BaseKey) {
        self.send = Direction::new(send_base);
        self.recv = Direction::new(recv_base);
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    fn seal_frame(&mut self, plaintext: &[u8]) -> Result<(), SudokuError> {
        let (epoch, seq) = (self.send.epoch, self.send.seq);
        let header = record_header(epoch, seq);
        let sealed = self.send.cipher(self.method, epoch)?.seal(&header, &header, plaintext)?;
        self.write_buf.push_frame(&[&header[..], &sealed[..]]);

        self.send.bytes_since_rekey += plaintext.len() as u64;
        let threshold = self.key_update_after.saturating_mul(epoch as u64 + 1);
        let rotate = (self.key_update_after > 0 && self.send.bytes_since_rekey >= threshold) || seq == u64::MAX;
        if rotate {
            self.send.epoch = epoch
                .checked_add(1)
                .ok_or_else(|| SudokuError::Crypto("record epoch exhausted".to_string()))?;
            self.send.seq = 0;
            trace!(epoch = self.send.epoch, "record send key rotated");
        } else {
            self.send.seq = seq + 1;
        }
        Ok(())
    }

    fn open_frame(&mut self, body: &[u8]) -> Result<Vec<u8>, SudokuError> {
        let (header, ciphertext) = body.split_at(HEADER_SIZE);
        let epoch = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let mut seq_bytes = [0u8; 8];
        seq_bytes.copy_from_slice(&header[4..]);
        let seq = u64::from_be_bytes(seq_bytes);

        let expected_epoch = self.recv.epoch;
        let expected_seq = self.recv.seq;
        let in_order = if epoch == expected_epoch {
            seq == expected_seq
        } else {
            epoch > expected_epoch && epoch - expected_epoch <= MAX_EPOCH_JUMP && seq == 0
        };
        if !in_order {
            return Err(SudokuError::RecordOutOfOrder {
                expected_epoch,
                expected_seq,
                epoch,
                seq,
            });
        }

        let plaintext = self.recv.cipher(self.method, epoch)?.open(header, header, ciphertext)?;
        if epoch != expected_epoch {
            trace!(epoch, "record recv key rotated");
        }
        self.recv.epoch = epoch;
        self.recv.seq = seq.wrapping_add(1);
        Ok(plaintext)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for RecordConn<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.write_buf.poll_drain(&mut this.inner, cx))?;
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let chunk = &buf[..buf.len().min(MAX_PLAINTEXT)];
        this.seal_frame(chunk).map_err(io::Error::from)?;
        if let Poll::Ready(Err(e)) = this.write_buf.poll_drain(&mut this.inner, cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(chunk.len()))
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

impl<S: AsyncRead + Unpin> AsyncRead for RecordConn<S> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        while this.read_pos >= this.read_pending.len() {
            let Some(body) = ready!(this.reader.poll_frame(&mut this.inner, cx))? else {
                return Poll::Ready(Ok(()));
            };
            this.read_pending = this.open_frame(&body).map_err(io::Error::from)?;
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

    const C2S: BaseKey = [0x11; 32];
    const S2C: BaseKey = [0x22; 32];

    fn pair<S>(a: S, b: S, method: AeadMethod, rotate_after: u64) -> (RecordConn<S>, RecordConn<S>) {
        (
            RecordConn::new(a, method, C2S, S2C, rotate_after),
            RecordConn::new(b, method, S2C, C2S, rotate_after),
        )
    }

    #[tokio::test]
    async fn roundtrip_across_rotation() {
        for method in [AeadMethod::Aes128Gcm, AeadMethod::ChaCha20Poly1305] {
            let (a, b) = tokio::io::duplex(256 * 1024);
            let (mut client, mut server) = pair(a, b, method, 1000);

            let data: Vec<u8> = (0..40_000u32).map(|i| (i * 31 % 256) as u8).collect();
            for chunk in data.chunks(700) {
                client.write_all(chunk).await.unwrap();
            }
            client.flush().await.unwrap();

            let mut got = vec![0u8; data.len()];
            server.read_exact(&mut got).await.unwrap();
            assert_eq!(got, data);
            assert!(client.epochs().0 > 1, "{} did not rotate", method);
            assert_eq!(client.epochs().0, server.epochs().1);
        }
    }

    #[tokio::test]
    async fn rotation_disabled_with_zero() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (mut client, mut server) = pair(a, b, AeadMethod::ChaCha20Poly1305, 0);
        client.write_all(&[9u8; 30_000]).await.unwrap();
        client.flush().await.unwrap();
        let mut got = vec![0u8; 30_000];
        server.read_exact(&mut got).await.unwrap();
        assert_eq!(client.epochs().0, 0);
    }

    #[tokio::test]
    async fn rekey_switches_both_directions() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (mut client, mut server) = pair(a, b, AeadMethod::Aes128Gcm, 0);
        client.write_all(b"before").await.unwrap();
        let mut got = [0u8; 6];
        server.read_exact(&mut got).await.unwrap();

        client.rekey([0x33; 32], [0x44; 32]);
        server.rekey([0x44; 32], [0x33; 32]);
        client.write_all(b"after").await.unwrap();
        server.write_all(b"reply").await.unwrap();
        let mut got = [0u8; 5];
        server.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"after");
        client.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"reply");
    }

    /// 直接构造一帧密文
    fn craft(method: AeadMethod, base: &BaseKey, epoch: u32, seq: u64, pt: &[u8]) -> Vec<u8> {
        let header = record_header(epoch, seq);
        let sealed = derive_epoch_cipher(method, base, epoch)
            .unwrap()
            .seal(&header, &header, pt)
            .unwrap();
        let mut frame = ((HEADER_SIZE + sealed.len()) as u16).to_be_bytes().to_vec();
        frame.extend_from_slice(&header);
        frame.extend_from_slice(&sealed);
        frame
    }

    async fn read_err(wire: Vec<u8>) -> SudokuError {
        let method = AeadMethod::ChaCha20Poly1305;
        let mut conn = RecordConn::new(&wire[..], method, S2C, C2S, 0);
        let mut out = Vec::new();
        let err = conn.read_to_end(&mut out).await.unwrap_err();
        SudokuError::from_io(err)
    }

    #[tokio::test]
    async fn rejects_out_of_order_frames() {
        let m = AeadMethod::ChaCha20Poly1305;

        // epoch 0 中 seq 跳号
        let mut wire = craft(m, &C2S, 0, 0, b"a");
        wire.extend(craft(m, &C2S, 0, 2, b"b"));
        assert!(matches!(read_err(wire).await, SudokuError::RecordOutOfOrder { seq: 2, .. }));

        // 新 epoch 的首帧 seq 必须为 0
        let mut wire = craft(m, &C2S, 0, 0, b"a");
        wire.extend(craft(m, &C2S, 1, 1, b"b"));
        assert!(matches!(read_err(wire).await, SudokuError::RecordOutOfOrder { epoch: 1, .. }));

        // epoch 回退
        let mut wire = craft(m, &C2S, 0, 0, b"a");
        wire.extend(craft(m, &C2S, 1, 0, b"b"));
        wire.extend(craft(m, &C2S, 0, 1, b"c"));
        assert!(matches!(
            read_err(wire).await,
            SudokuError::RecordOutOfOrder { expected_epoch: 1, epoch: 0, .. }
        ));

        // 跳跃超过上限
        let wire = craft(m, &C2S, MAX_EPOCH_JUMP + 1, 0, b"a");
        assert!(matches!(read_err(wire).await, SudokuError::RecordOutOfOrder { .. }));
    }

    #[tokio::test]
    async fn accepts_bounded_epoch_jump() {
        let m = AeadMethod::ChaCha20Poly1305;
        let mut wire = craft(m, &C2S, 0, 0, b"a");
        wire.extend(craft(m, &C2S, 3, 0, b"b"));
        wire.extend(craft(m, &C2S, 3, 1, b"c"));
        let mut conn = RecordConn::new(&wire[..], m, S2C, C2S, 0);
        let mut out = Vec::new();
        conn.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"abc");
        assert_eq!(conn.epochs().1, 3);
    }

    #[tokio::test]
    async fn tampered_frame_fails() {
        let m = AeadMethod::ChaCha20Poly1305;
        let mut wire = craft(m, &C2S, 0, 0, b"payload");
        let last = wire.len() - 1;
        wire[last] ^= 0x01;
        assert!(matches!(read_err(wire).await, SudokuError::DecryptFailed));
    }

    #[tokio::test]
    async fn none_method_passes_payload_with_header() {
        let mut conn = RecordConn::new(Vec::new(), AeadMethod::None, C2S, S2C, 0);
        conn.write_all(b"clear").await.unwrap();
        conn.write_all(b"text").await.unwrap();
        conn.flush().await.unwrap();
        let wire = conn.into_inner();

        let mut expected = Vec::new();
        for (seq, body) in [(0u64, &b"clear"[..]), (1, &b"text"[..])] {
            expected.extend_from_slice(&((HEADER_SIZE + body.len()) as u16).to_be_bytes());
            expected.extend_from_slice(&record_header(0, seq));
            expected.extend_from_slice(body);
        }
        assert_eq!(wire, expected);

        let (a, b) = tokio::io::duplex(64 * 1024);
        let (mut client, mut server) = pair(a, b, AeadMethod::None, 1000);
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 253) as u8).collect();
        client.write_all(&data).await.unwrap();
        client.flush().await.unwrap();
        let mut got = vec![0u8; data.len()];
        server.read_exact(&mut got).await.unwrap();
        assert_eq!(got, data);
        assert!(client.epochs().0 > 1);
        assert_eq!(client.epochs().0, server.epochs().1);
    }

    #[tokio::test]
    async fn none_method_still_enforces_order() {
        let m = AeadMethod::None;
        async fn read(wire: Vec<u8>) -> (Result<usize, SudokuError>, Vec<u8>) {
            let mut conn = RecordConn::new(&wire[..], AeadMethod::None, S2C, C2S, 0);
            let mut out = Vec::new();
            let result = conn.read_to_end(&mut out).await;
            (result.map_err(SudokuError::from_io), out)
        }

        let mut wire = craft(m, &C2S, 0, 0, b"a");
        wire.extend(craft(m, &C2S, 0, 1, b"b"));
        let (result, out) = read(wire).await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(out, b"ab");

        let mut wire = craft(m, &C2S, 0, 0, b"a");
        wire.extend(craft(m, &C2S, 0, 0, b"a"));
        let (result, _) = read(wire).await;
        assert!(matches!(result, Err(SudokuError::RecordOutOfOrder { seq: 0, expected_seq: 1, .. })));

        let wire = craft(m, &C2S, MAX_EPOCH_JUMP + 1, 0, b"a");
        let (result, _) = read(wire).await;
        assert!(matches!(result, Err(SudokuError::RecordOutOfOrder { .. })));
    }
}
