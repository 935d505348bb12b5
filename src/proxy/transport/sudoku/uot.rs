/// UDP over TCP
///
/// 会话前缀 [0xEE][version] 之后，每个数据报一帧：
/// [addrLen u16][payloadLen u16][addr (SOCKS 格式)][payload]
use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;
use tracing::debug;

use super::handshake::{UOT_MAGIC, UOT_VERSION};
use crate::common::{Address, ProxyStream, SudokuError};

pub const MAX_DATAGRAM: usize = u16::MAX as usize;

/// 客户端：握手完成后写入 UoT 前缀
pub async fn start_uot_client<W: AsyncWrite + Unpin>(stream: &mut W) -> Result<(), SudokuError> {
    stream
        .write_all(&[UOT_MAGIC, UOT_VERSION])
        .await
        .map_err(SudokuError::from_io)?;
    stream.flush().await.map_err(SudokuError::from_io)
}

pub async fn write_datagram<W: AsyncWrite + Unpin>(
    writer: &mut W,
    addr: &Address,
    payload: &[u8],
) -> Result<(), SudokuError> {
    if payload.len() > MAX_DATAGRAM {
        return Err(SudokuError::InvalidFrame(format!(
            "datagram too large: {}",
            payload.len()
        )));
    }
    let addr = addr.to_bytes();
    let mut frame = Vec::with_capacity(4 + addr.len() + payload.len());
    frame.extend_from_slice(&(addr.len() as u16).to_be_bytes());
    frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    frame.extend_from_slice(&addr);
    frame.extend_from_slice(payload);
    writer.write_all(&frame).await.map_err(SudokuError::from_io)?;
    writer.flush().await.map_err(SudokuError::from_io)
}

/// 读一个数据报；在帧边界遇到 EOF 返回 None
pub async fn read_datagram<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<(Address, Vec<u8>)>, SudokuError> {
    let mut header = [0u8; 4];
    // 只有第一个字节前的 EOF 算正常结束
    if reader.read(&mut header[..1]).await.map_err(SudokuError::from_io)? == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut header[1..]).await.map_err(SudokuError::from_io)?;
    let addr_len = u16::from_be_bytes([header[0], header[1]]) as usize;
    let payload_len = u16::from_be_bytes([header[2], header[3]]) as usize;

    let mut body = vec![0u8; addr_len + payload_len];
    reader.read_exact(&mut body).await.map_err(SudokuError::from_io)?;
    let (addr, used) = Address::decode(&body[..addr_len])?;
    if used != addr_len {
        return Err(SudokuError::InvalidFrame("datagram address length mismatch".to_string()));
    }
    body.drain(..addr_len);
    Ok(Some((addr, body)))
}

async fn pump_downlink<W: AsyncWrite + Unpin>(socket: &UdpSocket, writer: &mut W) -> Result<(), SudokuError> {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (n, from): (usize, SocketAddr) = socket.recv_from(&mut buf).await?;
        write_datagram(writer, &Address::Ip(from), &buf[..n]).await?;
    }
}

/// 服务端：把一条 UoT 会话中继到本地 UDP socket
///
/// 任一方向结束即返回。
pub async fn relay_uot(stream: ProxyStream) -> Result<(), SudokuError> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    let (mut reader, mut writer) = tokio::io::split(stream);

    let uplink = async {
        while let Some((target, payload)) = read_datagram(&mut reader).await? {
            let dest = target.resolve().await?;
            socket.send_to(&payload, dest).await?;
        }
        Ok::<(), SudokuError>(())
    };

    let downlink = pump_downlink(&socket, &mut writer);

    let result = tokio::select! {
        r = uplink => r,
        r = downlink => r,
    };
    debug!(ok = result.is_ok(), "uot relay finished");
    result
}
