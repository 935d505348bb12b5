/// HTTP 伪装头
///
/// 客户端在 Sudoku 混淆数据之前写一个伪 HTTP/1.1 请求头；
/// 服务端按块读入，前 4 字节像 HTTP 请求就找到空行把请求头剥掉；
/// 多读的字节和非 HTTP 的开头一样，都是混淆数据，交给表探测继续使用。
use rand::seq::SliceRandom;
use rand::Rng;
use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::common::SudokuError;

pub const PEEK_LEN: usize = 4;
const MAX_HEADER_LEN: usize = 8192;
const READ_CHUNK: usize = 1024;
const HEADER_END: &[u8] = b"\r\n\r\n";

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64; rv:127.0) Gecko/20100101 Firefox/127.0",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 17_5 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Mobile/15E148",
];

const PATH_PREFIXES: &[&str] = &["api", "cdn", "static", "assets", "upload", "v1", "v2"];
const CONTENT_TYPES: &[&str] = &["application/octet-stream", "application/x-protobuf", "image/webp"];

fn random_token(rng: &mut impl Rng, len: usize) -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    (0..len)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// 生成一个随机的上传请求头
pub fn build_request_header(host: &str, path_root: &str) -> String {
    let mut rng = rand::thread_rng();
    let root = match path_root.trim_matches('/') {
        "" => PATH_PREFIXES.choose(&mut rng).copied().unwrap_or("api"),
        root => root,
    };
    let token_len = rng.gen_range(8..16);
    let path = format!("/{}/{}", root, random_token(&mut rng, token_len));
    let agent = USER_AGENTS.choose(&mut rng).copied().unwrap_or(USER_AGENTS[0]);
    let content_type = CONTENT_TYPES.choose(&mut rng).copied().unwrap_or(CONTENT_TYPES[0]);
    let length = rng.gen_range(4096..1 << 20);

    format!(
        "POST {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: {}\r\nAccept: */*\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: keep-alive\r\n\r\n",
        path, host, agent, content_type, length
    )
}

pub async fn write_mask<W: AsyncWrite + Unpin>(writer: &mut W, host: &str, path_root: &str) -> Result<(), SudokuError> {
    writer
        .write_all(build_request_header(host, path_root).as_bytes())
        .await?;
    Ok(())
}

pub fn looks_like_http_request(peek: &[u8]) -> bool {
    const METHODS: [&[u8]; 6] = [b"GET ", b"POST", b"PUT ", b"HEAD", b"PATC", b"OPTI"];
    peek.len() >= PEEK_LEN && METHODS.iter().any(|m| peek.starts_with(m))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskOutcome {
    /// 伪装头占本次读入的前 n 个字节，其后是混淆数据
    Stripped(usize),
    /// 没有伪装头，本次读入的全部是混淆数据
    Absent,
}

/// 按块读入并剥离伪装头
///
/// 读到的每个字节都追加进 `consumed`，出错时调用方仍能拿到它们做回落。
pub async fn strip_mask<R: AsyncRead + Unpin>(
    reader: &mut R,
    consumed: &mut Vec<u8>,
) -> Result<MaskOutcome, SudokuError> {
    let start = consumed.len();
    let mut chunk = [0u8; READ_CHUNK];
    let mut scanned = start;
    loop {
        let got = consumed.len() - start;
        if got >= PEEK_LEN {
            if !looks_like_http_request(&consumed[start..]) {
                return Ok(MaskOutcome::Absent);
            }
            if let Some(pos) = consumed[scanned..].windows(HEADER_END.len()).position(|w| w == HEADER_END) {
                return Ok(MaskOutcome::Stripped(scanned + pos + HEADER_END.len() - start));
            }
            // 空行可能跨块
            scanned = consumed.len() + 1 - HEADER_END.len();
            if got >= MAX_HEADER_LEN {
                return Err(SudokuError::Handshake("camouflage header too long".to_string()));
            }
        }

        let want = READ_CHUNK.min(MAX_HEADER_LEN - got);
        let n = reader.read(&mut chunk[..want]).await?;
        if n == 0 {
            return Err(SudokuError::Io(io::ErrorKind::UnexpectedEof.into()));
        }
        consumed.extend_from_slice(&chunk[..n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_shape() {
        let header = build_request_header("cdn.example.net", "/upload/");
        assert!(header.starts_with("POST /upload/"));
        assert!(header.contains("Host: cdn.example.net\r\n"));
        assert!(header.ends_with("\r\n\r\n"));
    }

    /// 每次 read 最多给出 `step` 字节，并统计调用次数
    struct Trickle<'a> {
        data: &'a [u8],
        step: usize,
        reads: usize,
    }

    impl AsyncRead for Trickle<'_> {
        fn poll_read(
            mut self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<io::Result<()>> {
            let data = self.data;
            let n = data.len().min(self.step).min(buf.remaining());
            buf.put_slice(&data[..n]);
            self.data = &data[n..];
            self.reads += 1;
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn strips_header_and_keeps_excess() {
        let mut wire = build_request_header("h", "").into_bytes();
        let header_len = wire.len();
        wire.extend_from_slice(b"\x01\x02obfuscated");
        let mut reader = &wire[..];
        let mut consumed = Vec::new();
        let outcome = strip_mask(&mut reader, &mut consumed).await.unwrap();
        assert_eq!(outcome, MaskOutcome::Stripped(header_len));
        assert_eq!(&consumed[..header_len], &wire[..header_len]);
        let rest = [&consumed[header_len..], reader].concat();
        assert_eq!(rest, b"\x01\x02obfuscated");
    }

    #[tokio::test]
    async fn header_is_read_in_chunks() {
        let mut wire = build_request_header("chunky.example", "").into_bytes();
        let header_len = wire.len();
        wire.extend_from_slice(&[0x42; 4000]);
        let mut reader = Trickle {
            data: &wire,
            step: usize::MAX,
            reads: 0,
        };
        let mut consumed = Vec::new();
        let outcome = strip_mask(&mut reader, &mut consumed).await.unwrap();
        assert_eq!(outcome, MaskOutcome::Stripped(header_len));
        assert!(reader.reads <= 2, "{} reads for a {} byte header", reader.reads, header_len);
    }

    #[tokio::test]
    async fn header_end_split_across_reads() {
        let mut wire = build_request_header("h", "").into_bytes();
        let header_len = wire.len();
        wire.extend_from_slice(b"tail");
        for step in [1, 3, 7] {
            let mut reader = Trickle {
                data: &wire,
                step,
                reads: 0,
            };
            let mut consumed = Vec::new();
            let outcome = strip_mask(&mut reader, &mut consumed).await.unwrap();
            assert_eq!(outcome, MaskOutcome::Stripped(header_len));
        }
    }

    #[tokio::test]
    async fn non_http_prefix_is_returned() {
        let wire = [0x10u8, 0x22, 0x05, 0x7f, 0x33];
        let mut reader = &wire[..];
        let mut consumed = Vec::new();
        assert_eq!(strip_mask(&mut reader, &mut consumed).await.unwrap(), MaskOutcome::Absent);
        assert_eq!(consumed, wire);
    }

    #[tokio::test]
    async fn oversized_header_keeps_consumed_bytes() {
        let mut wire = b"GET /".to_vec();
        wire.extend(std::iter::repeat(b'a').take(MAX_HEADER_LEN + 10));
        let mut reader = &wire[..];
        let mut consumed = Vec::new();
        assert!(strip_mask(&mut reader, &mut consumed).await.is_err());
        assert_eq!(consumed.len(), MAX_HEADER_LEN);
        assert_eq!(&consumed[..], &wire[..MAX_HEADER_LEN]);
    }

    #[test]
    fn detection() {
        assert!(looks_like_http_request(b"GET /"));
        assert!(looks_like_http_request(b"POST"));
        assert!(!looks_like_http_request(b"GE"));
        assert!(!looks_like_http_request(&[0x16, 0x03, 0x01, 0x00]));
    }
}
