/// `u16 长度 | body` 外层分帧的读写辅助
///
/// 握手用的 AeadFramer 和正式的 RecordConn 共用同一种外层格式，
/// 区别只在 body 内部。读取端严格按帧长读取，不会多读底层流，
/// 这样握手结束后可以把同一个底层流交给下一层继续使用。
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::common::SudokuError;

pub const LEN_PREFIX: usize = 2;

/// 逐帧读取器
#[derive(Debug)]
pub struct FrameReader {
    header: [u8; LEN_PREFIX],
    header_got: usize,
    body: Vec<u8>,
    body_len: Option<usize>,
    min_len: usize,
    max_len: usize,
}

impl FrameReader {
    pub fn new(min_len: usize, max_len: usize) -> Self {
        FrameReader {
            header: [0; LEN_PREFIX],
            header_got: 0,
            body: Vec::new(),
            body_len: None,
            min_len,
            max_len,
        }
    }

    /// 是否停在帧边界上
    pub fn is_idle(&self) -> bool {
        self.header_got == 0 && self.body_len.is_none()
    }

    /// 读取下一帧 body；在帧边界遇到 EOF 返回 None
    pub fn poll_frame<S: AsyncRead + Unpin>(
        &mut self,
        inner: &mut S,
        cx: &mut Context<'_>,
    ) -> Poll<io::Result<Option<Vec<u8>>>> {
        loop {
            match self.body_len {
                None => {
                    let mut rb = ReadBuf::new(&mut self.header[self.header_got..]);
                    ready!(Pin::new(&mut *inner).poll_read(cx, &mut rb))?;
                    let n = rb.filled().len();
                    if n == 0 {
                        if self.header_got == 0 {
                            return Poll::Ready(Ok(None));
                        }
                        return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
                    }
                    self.header_got += n;
                    if self.header_got < LEN_PREFIX {
                        continue;
                    }
                    let len = u16::from_be_bytes(self.header) as usize;
                    if len < self.min_len || len > self.max_len {
                        return Poll::Ready(Err(SudokuError::InvalidFrame(format!(
                            "frame length {} outside [{}, {}]",
                            len, self.min_len, self.max_len
                        ))
                        .into()));
                    }
                    self.body = vec![0u8; len];
                    self.body_len = Some(0);
                }
                Some(got) if got < self.body.len() => {
                    let mut rb = ReadBuf::new(&mut self.body[got..]);
                    ready!(Pin::new(&mut *inner).poll_read(cx, &mut rb))?;
                    let n = rb.filled().len();
                    if n == 0 {
                        return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
                    }
                    self.body_len = Some(got + n);
                }
                Some(_) => {
                    self.header_got = 0;
                    self.body_len = None;
                    return Poll::Ready(Ok(Some(std::mem::take(&mut self.body))));
                }
            }
        }
    }
}

/// 写缓冲：先把整帧放进缓冲区，再尽量写出
#[derive(Debug, Default)]
pub struct WriteBuffer {
    buf: Vec<u8>,
    pos: usize,
}

impl WriteBuffer {
    pub fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    /// 追加一帧：u16 长度前缀 + 若干 body 片段
    pub fn push_frame(&mut self, parts: &[&[u8]]) {
        let len: usize = parts.iter().map(|p| p.len()).sum();
        debug_assert!(len <= u16::MAX as usize);
        self.buf.extend_from_slice(&(len as u16).to_be_bytes());
        for part in parts {
            self.buf.extend_from_slice(part);
        }
    }

    pub fn poll_drain<S: AsyncWrite + Unpin>(
        &mut self,
        inner: &mut S,
        cx: &mut Context<'_>,
    ) -> Poll<io::Result<()>> {
        while self.pos < self.buf.len() {
            let n = ready!(Pin::new(&mut *inner).poll_write(cx, &self.buf[self.pos..]))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.pos += n;
        }
        self.buf.clear();
        self.pos = 0;
        Poll::Ready(Ok(()))
    }
}

/// 从字节切片中解析一帧，用于探测阶段的试解
pub enum FrameParse<'a> {
    /// 数据不足
    NeedMore,
    /// 长度前缀本身非法
    Invalid,
    /// body 与整帧占用的字节数
    Frame(&'a [u8], usize),
}

pub fn parse_frame(buf: &[u8], min_len: usize, max_len: usize) -> FrameParse<'_> {
    if buf.len() < LEN_PREFIX {
        return FrameParse::NeedMore;
    }
    let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    if len < min_len || len > max_len {
        return FrameParse::Invalid;
    }
    match buf.get(LEN_PREFIX..LEN_PREFIX + len) {
        Some(body) => FrameParse::Frame(body, LEN_PREFIX + len),
        None => FrameParse::NeedMore,
    }
}
