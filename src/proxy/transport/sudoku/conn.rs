/// Sudoku 混淆流
///
/// 包装底层流：写入时把每个字节编码为 4 个提示符号（或 packed 模式下的 6 bit 分组符号），
/// 并按概率穿插 padding；读取时过滤 padding、还原字节。
///
/// 上下行可以使用不同的编码：客户端上行永远是纯 Sudoku 编码，
/// 服务端下行按协商结果选择纯编码或 packed 编码。
///
/// 支持录制模式：录制期间从底层读到的原始字节全部保留，
/// 握手失败时调用方可以把它们原样转发给回落目标。
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::packed::{PackedDecoder, PackedEncoder};
use super::table::Table;
use crate::common::SudokuError;

/// 24 种 4 元素排列（随机化提示发送顺序）
const PERM4: [[usize; 4]; 24] = [
    [0, 1, 2, 3],
    [0, 1, 3, 2],
    [0, 2, 1, 3],
    [0, 2, 3, 1],
    [0, 3, 1, 2],
    [0, 3, 2, 1],
    [1, 0, 2, 3],
    [1, 0, 3, 2],
    [1, 2, 0, 3],
    [1, 2, 3, 0],
    [1, 3, 0, 2],
    [1, 3, 2, 0],
    [2, 0, 1, 3],
    [2, 0, 3, 1],
    [2, 1, 0, 3],
    [2, 1, 3, 0],
    [2, 3, 0, 1],
    [2, 3, 1, 0],
    [3, 0, 1, 2],
    [3, 0, 2, 1],
    [3, 1, 0, 2],
    [3, 1, 2, 0],
    [3, 2, 0, 1],
    [3, 2, 1, 0],
];

/// 单次写入最多接收的明文字节数（编码后约 4~8 倍）
const MAX_WRITE_CHUNK: usize = 8 * 1024;
const READ_CHUNK: usize = 16 * 1024;

/// 编码方向的工作模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecMode {
    /// 每字节 4 个提示符号
    Pure,
    /// 6 bit 分组，每组 1 个符号
    Packed,
}

/// padding 决策与编码随机源
///
/// 插入概率在连接建立时从 [min%, max%] 中抽取一次，此后固定。
pub struct Padder {
    rng: ChaCha8Rng,
    threshold: u64,
}

impl Padder {
    pub fn new(padding_min: u8, padding_max: u8) -> Self {
        let mut rng = ChaCha8Rng::from_rng(rand::thread_rng())
            .unwrap_or_else(|_| ChaCha8Rng::seed_from_u64(rand::random()));
        let max = padding_max.min(100);
        let min = padding_min.min(max);
        let percent = rng.gen_range(min..=max) as u64;
        let threshold = match percent {
            0 => 0,
            100 => u64::MAX,
            p => (u64::MAX / 100) * p,
        };
        Padder { rng, threshold }
    }

    #[inline]
    fn should_pad(&mut self) -> bool {
        match self.threshold {
            0 => false,
            u64::MAX => true,
            t => self.rng.gen::<u64>() < t,
        }
    }

    #[inline]
    pub fn maybe_pad(&mut self, table: &Table, out: &mut Vec<u8>) {
        if self.should_pad() {
            out.push(table.random_padding(&mut self.rng));
        }
    }

    pub fn rng(&mut self) -> &mut ChaCha8Rng {
        &mut self.rng
    }
}

/// 纯 Sudoku 编码：每字节随机选一种 4 提示编码，随机排列后输出
pub fn encode_pure(table: &Table, padder: &mut Padder, input: &[u8], out: &mut Vec<u8>) {
    out.reserve(input.len() * 5);
    for &b in input {
        let hints = table.encode_byte(b, padder.rng());
        let perm = &PERM4[padder.rng().gen_range(0..PERM4.len())];
        for &idx in perm {
            padder.maybe_pad(table, out);
            out.push(hints[idx]);
        }
    }
    padder.maybe_pad(table, out);
}

/// 纯 Sudoku 解码状态：收集 4 个提示后查表
#[derive(Debug, Default)]
pub struct PureDecoder {
    hints: [u8; 4],
    count: usize,
}

impl PureDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, table: &Table, raw: &[u8], out: &mut Vec<u8>) -> Result<(), SudokuError> {
        for &b in raw {
            if !table.layout.is_hint(b) {
                continue;
            }
            self.hints[self.count] = b;
            self.count += 1;
            if self.count == 4 {
                self.count = 0;
                let val = table
                    .decode_hints(self.hints)
                    .ok_or(SudokuError::InvalidMapMiss)?;
                out.push(val);
            }
        }
        Ok(())
    }
}

enum Encoder {
    Pure,
    Packed(PackedEncoder),
}

enum Decoder {
    Pure(PureDecoder),
    Packed(PackedDecoder),
}

pub struct SudokuStream<S> {
    inner: S,
    table: Arc<Table>,
    padder: Padder,
    encoder: Encoder,
    decoder: Decoder,
    /// 已解码、尚未交给调用方的明文
    pending_data: Vec<u8>,
    pending_pos: usize,
    /// 已编码、尚未写入底层的符号
    write_buf: Vec<u8>,
    write_pos: usize,
    recording: Option<Vec<u8>>,
    read_eof: bool,
}

impl<S> SudokuStream<S> {
    /// 双向纯 Sudoku 编码
    pub fn new(inner: S, table: Arc<Table>, padding_min: u8, padding_max: u8) -> Self {
        Self::with_modes(inner, table, padding_min, padding_max, CodecMode::Pure, CodecMode::Pure)
    }

    /// 双向 packed 编码
    pub fn packed(inner: S, table: Arc<Table>, padding_min: u8, padding_max: u8) -> Self {
        Self::with_modes(
            inner,
            table,
            padding_min,
            padding_max,
            CodecMode::Packed,
            CodecMode::Packed,
        )
    }

    pub fn with_modes(
        inner: S,
        table: Arc<Table>,
        padding_min: u8,
        padding_max: u8,
        read_mode: CodecMode,
        write_mode: CodecMode,
    ) -> Self {
        let encoder = match write_mode {
            CodecMode::Pure => Encoder::Pure,
            CodecMode::Packed => Encoder::Packed(PackedEncoder::new()),
        };
        let decoder = match read_mode {
            CodecMode::Pure => Decoder::Pure(PureDecoder::new()),
            CodecMode::Packed => Decoder::Packed(PackedDecoder::new()),
        };
        SudokuStream {
            inner,
            table,
            padder: Padder::new(padding_min, padding_max),
            encoder,
            decoder,
            pending_data: Vec::with_capacity(4096),
            pending_pos: 0,
            write_buf: Vec::with_capacity(32 * 1024),
            write_pos: 0,
            recording: None,
            read_eof: false,
        }
    }

    pub fn table(&self) -> &Arc<Table> {
        &self.table
    }

    /// 开始录制从底层读到的原始字节
    pub fn start_recording(&mut self) {
        self.recording.get_or_insert_with(Vec::new);
    }

    /// 停止录制并丢弃已录制的内容，此后直通
    pub fn stop_recording(&mut self) {
        self.recording = None;
    }

    pub fn is_recording(&self) -> bool {
        self.recording.is_some()
    }

    /// 取走已录制的字节（录制状态保持不变）
    pub fn take_recorded(&mut self) -> Vec<u8> {
        self.recording.as_mut().map(std::mem::take).unwrap_or_default()
    }

    /// 已解码但未被读走的明文字节数
    pub fn buffered_plaintext(&self) -> usize {
        self.pending_data.len() - self.pending_pos
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncWrite + Unpin> SudokuStream<S> {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.write_pos < self.write_buf.len() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.write_buf[self.write_pos..]))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.write_pos += n;
        }
        self.write_buf.clear();
        self.write_pos = 0;
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for SudokuStream<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let chunk = &buf[..buf.len().min(MAX_WRITE_CHUNK)];
        match &mut this.encoder {
            Encoder::Pure => encode_pure(&this.table, &mut this.padder, chunk, &mut this.write_buf),
            Encoder::Packed(enc) => {
                enc.encode(&this.table, &mut this.padder, chunk, &mut this.write_buf)
            }
        }

        // 数据已进入缓冲即视为接收；尽量顺手写出，剩余部分留给下一次写入或 flush
        if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(chunk.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        if let Encoder::Packed(enc) = &mut this.encoder {
            if enc.has_pending_bits() {
                enc.finish(&this.table, &mut this.padder, &mut this.write_buf);
                ready!(this.poll_drain(cx))?;
            }
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        ready!(self.as_mut().poll_flush(cx))?;
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for SudokuStream<S> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.pending_pos < this.pending_data.len() {
                let available = &this.pending_data[this.pending_pos..];
                let n = available.len().min(buf.remaining());
                buf.put_slice(&available[..n]);
                this.pending_pos += n;
                if this.pending_pos == this.pending_data.len() {
                    this.pending_data.clear();
                    this.pending_pos = 0;
                }
                return Poll::Ready(Ok(()));
            }
            if this.read_eof {
                return Poll::Ready(Ok(()));
            }

            let mut raw = [0u8; READ_CHUNK];
            let mut raw_buf = ReadBuf::new(&mut raw);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut raw_buf))?;
            let filled = raw_buf.filled();
            if filled.is_empty() {
                this.read_eof = true;
                continue;
            }
            if let Some(rec) = this.recording.as_mut() {
                rec.extend_from_slice(filled);
            }
            match &mut this.decoder {
                Decoder::Pure(dec) => dec
                    .feed(&this.table, filled, &mut this.pending_data)
                    .map_err(io::Error::from)?,
                Decoder::Packed(dec) => dec.feed(&this.table, filled, &mut this.pending_data),
            }
        }
    }
}
