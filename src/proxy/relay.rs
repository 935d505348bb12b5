use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::common::{Address, ProxyStream};
use crate::proxy::transport::sudoku::Fallback;

/// 双向数据转发
pub async fn relay<A, B>(mut a: A, mut b: B) -> Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (a_to_b, b_to_a) = tokio::io::copy_bidirectional(&mut a, &mut b).await?;
    debug!(up = a_to_b, down = b_to_a, "relay finished");
    Ok((a_to_b, b_to_a))
}

/// 连接目标并转发
pub async fn relay_to_target(stream: ProxyStream, target: &Address) -> Result<(u64, u64)> {
    let dest = target.resolve().await.with_context(|| format!("resolve {}", target))?;
    let remote = TcpStream::connect(dest)
        .await
        .with_context(|| format!("connect {}", target))?;
    relay(stream, remote).await
}

/// 把握手失败的连接原样交给诱饵服务：先补发已消费的字节，再双向转发
pub async fn relay_fallback(fallback: Fallback, decoy: &str) -> Result<(u64, u64)> {
    let mut remote = TcpStream::connect(decoy)
        .await
        .with_context(|| format!("connect fallback {}", decoy))?;
    remote.write_all(&fallback.replay).await?;
    debug!(replayed = fallback.replay.len(), decoy, "forwarding rejected connection");
    relay(fallback.stream, remote).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn fallback_replays_consumed_bytes_first() {
        let decoy = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let decoy_addr = decoy.local_addr().unwrap().to_string();
        let seen = tokio::spawn(async move {
            let (mut s, _) = decoy.accept().await.unwrap();
            let mut buf = Vec::new();
            s.read_to_end(&mut buf).await.unwrap();
            buf
        });

        let (mut client, server_side) = tokio::io::duplex(1024);
        let fallback = Fallback {
            stream: Box::new(server_side),
            replay: b"GET / HTTP/1.1\r\n".to_vec(),
        };
        let forward = tokio::spawn(async move { relay_fallback(fallback, &decoy_addr).await });
        client.write_all(b"Host: x\r\n\r\n").await.unwrap();
        client.shutdown().await.unwrap();
        drop(client);

        assert_eq!(seen.await.unwrap(), b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        let _ = forward.await.unwrap();
    }
}
