use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// 双工字节流类型别名：任何实现了 AsyncRead + AsyncWrite + Send + Unpin 的类型
///
/// 截止时间/取消由调用方在外层用 `tokio::time::timeout` 表达，
/// 超时以 I/O 错误的形式传递给正在进行的读写。
pub type ProxyStream = Box<dyn AsyncStream>;

/// AsyncRead + AsyncWrite 的组合，供 trait object 使用
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// 带前缀缓冲的流：先吐出预读数据，然后读取底层流
pub struct PrefixedStream<S = ProxyStream> {
    prefix: Vec<u8>,
    prefix_pos: usize,
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self {
            prefix,
            prefix_pos: 0,
            inner,
        }
    }

    /// 尚未被读走的前缀字节
    pub fn unread_prefix(&self) -> &[u8] {
        &self.prefix[self.prefix_pos..]
    }

    /// 拆出底层流与未读前缀
    pub fn into_parts(mut self) -> (S, Vec<u8>) {
        let rest = self.prefix.split_off(self.prefix_pos);
        (self.inner, rest)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.prefix_pos < self.prefix.len() {
            let remaining = &self.prefix[self.prefix_pos..];
            let to_copy = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..to_copy]);
            self.prefix_pos += to_copy;
            if self.prefix_pos == self.prefix.len() {
                self.prefix = Vec::new();
                self.prefix_pos = 0;
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn prefix_is_read_first() {
        let tail: &[u8] = b" world";
        let mut stream = PrefixedStream::new(b"hello".to_vec(), tail);
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello world");
    }

    #[tokio::test]
    async fn into_parts_returns_unread_prefix() {
        let tail: &[u8] = b"";
        let mut stream = PrefixedStream::new(b"abcdef".to_vec(), tail);
        let mut two = [0u8; 2];
        stream.read_exact(&mut two).await.unwrap();
        assert_eq!(stream.unread_prefix(), b"cdef");
        let (_, rest) = stream.into_parts();
        assert_eq!(rest, b"cdef");
    }
}
