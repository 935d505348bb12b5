use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::str::FromStr;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::error::{Result, SudokuError};

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// 代理目标地址
///
/// 线上格式与 SOCKS5 相同：`[ATYP][ADDR][PORT]`，域名以 1 字节长度为前缀。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl Address {
    pub fn port(&self) -> u16 {
        match self {
            Address::Ip(addr) => addr.port(),
            Address::Domain(_, port) => *port,
        }
    }

    pub fn host(&self) -> String {
        match self {
            Address::Ip(addr) => addr.ip().to_string(),
            Address::Domain(domain, _) => domain.clone(),
        }
    }

    /// 编码为目标地址帧
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Address::Ip(SocketAddr::V4(addr)) => {
                buf.put_u8(ATYP_IPV4);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
            Address::Ip(SocketAddr::V6(addr)) => {
                buf.put_u8(ATYP_IPV6);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
            Address::Domain(domain, port) => {
                buf.put_u8(ATYP_DOMAIN);
                buf.put_u8(domain.len() as u8);
                buf.put_slice(domain.as_bytes());
                buf.put_u16(*port);
            }
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf);
        buf.to_vec()
    }

    pub fn encoded_len(&self) -> usize {
        match self {
            Address::Ip(SocketAddr::V4(_)) => 1 + 4 + 2,
            Address::Ip(SocketAddr::V6(_)) => 1 + 16 + 2,
            Address::Domain(domain, _) => 1 + 1 + domain.len() + 2,
        }
    }

    /// 从字节切片解析地址帧，返回 (地址, 消耗的字节数)
    pub fn decode(data: &[u8]) -> Result<(Self, usize)> {
        let short = || SudokuError::InvalidFrame("truncated target address".to_string());
        let atyp = *data.first().ok_or_else(short)?;
        match atyp {
            ATYP_IPV4 => {
                if data.len() < 7 {
                    return Err(short());
                }
                let ip = Ipv4Addr::new(data[1], data[2], data[3], data[4]);
                let port = u16::from_be_bytes([data[5], data[6]]);
                Ok((Address::Ip(SocketAddr::new(IpAddr::V4(ip), port)), 7))
            }
            ATYP_DOMAIN => {
                let domain_len = *data.get(1).ok_or_else(short)? as usize;
                let total = 2 + domain_len + 2;
                if data.len() < total {
                    return Err(short());
                }
                let domain = domain_from_bytes(&data[2..2 + domain_len])?;
                let port = u16::from_be_bytes([data[2 + domain_len], data[3 + domain_len]]);
                Ok((Address::Domain(domain, port), total))
            }
            ATYP_IPV6 => {
                if data.len() < 19 {
                    return Err(short());
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&data[1..17]);
                let port = u16::from_be_bytes([data[17], data[18]]);
                Ok((
                    Address::Ip(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)),
                    19,
                ))
            }
            _ => Err(SudokuError::InvalidFrame(format!(
                "unsupported address type: 0x{:02x}",
                atyp
            ))),
        }
    }

    /// 读取完整的地址帧
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let atyp = reader.read_u8().await.map_err(SudokuError::from_io)?;
        Self::read_with_atyp(reader, atyp).await
    }

    /// ATYP 已经被调用方读走时，读取剩余部分
    pub async fn read_with_atyp<R: AsyncRead + Unpin>(reader: &mut R, atyp: u8) -> Result<Self> {
        let io = SudokuError::from_io;
        match atyp {
            ATYP_IPV4 => {
                let mut ip = [0u8; 4];
                reader.read_exact(&mut ip).await.map_err(io)?;
                let port = reader.read_u16().await.map_err(io)?;
                Ok(Address::Ip(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(ip)), port)))
            }
            ATYP_DOMAIN => {
                let len = reader.read_u8().await.map_err(io)? as usize;
                let mut domain = vec![0u8; len];
                reader.read_exact(&mut domain).await.map_err(io)?;
                let port = reader.read_u16().await.map_err(io)?;
                Ok(Address::Domain(domain_from_bytes(&domain)?, port))
            }
            ATYP_IPV6 => {
                let mut ip = [0u8; 16];
                reader.read_exact(&mut ip).await.map_err(io)?;
                let port = reader.read_u16().await.map_err(io)?;
                Ok(Address::Ip(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(ip)), port)))
            }
            other => Err(SudokuError::InvalidFrame(format!(
                "unsupported address type: 0x{:02x}",
                other
            ))),
        }
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        writer
            .write_all(&self.to_bytes())
            .await
            .map_err(SudokuError::from_io)
    }

    /// DNS 解析为 SocketAddr
    pub async fn resolve(&self) -> std::io::Result<SocketAddr> {
        match self {
            Address::Ip(addr) => Ok(*addr),
            Address::Domain(domain, port) => {
                let query = format!("{}:{}", domain, port);
                let resolved = tokio::task::spawn_blocking(move || query.to_socket_addrs())
                    .await
                    .map_err(std::io::Error::other)??
                    .next();
                resolved.ok_or_else(|| {
                    std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("DNS resolution failed for {}:{}", domain, port),
                    )
                })
            }
        }
    }
}

fn domain_from_bytes(raw: &[u8]) -> Result<String> {
    String::from_utf8(raw.to_vec())
        .map_err(|_| SudokuError::InvalidFrame("domain is not valid UTF-8".to_string()))
}

impl FromStr for Address {
    type Err = SudokuError;

    /// 解析 "host:port" / "[v6]:port"
    fn from_str(s: &str) -> Result<Self> {
        if let Ok(sock) = s.parse::<SocketAddr>() {
            return Ok(Address::Ip(sock));
        }
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| SudokuError::Config(format!("address '{}' has no port", s)))?;
        let port: u16 = port
            .parse()
            .map_err(|_| SudokuError::Config(format!("invalid port in '{}'", s)))?;
        if host.is_empty() || host.len() > 255 {
            return Err(SudokuError::Config(format!("invalid host in '{}'", s)));
        }
        Ok(Address::Domain(host.to_string(), port))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ip(addr) => write!(f, "{}", addr),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_ipv4() {
        let addr: Address = "1.2.3.4:443".parse().unwrap();
        assert_eq!(addr.to_bytes(), vec![0x01, 1, 2, 3, 4, 0x01, 0xBB]);
        assert_eq!(addr.encoded_len(), 7);
    }

    #[test]
    fn encode_domain() {
        let addr = Address::Domain("example.com".to_string(), 443);
        let bytes = addr.to_bytes();
        assert_eq!(bytes[0], 0x03);
        assert_eq!(bytes[1], 11);
        assert_eq!(&bytes[2..13], b"example.com");
        assert_eq!(u16::from_be_bytes([bytes[13], bytes[14]]), 443);
    }

    #[test]
    fn decode_consumes_exact_length() {
        let addr: Address = "[::1]:80".parse().unwrap();
        let mut bytes = addr.to_bytes();
        bytes.extend_from_slice(b"tail");
        let (decoded, used) = Address::decode(&bytes).unwrap();
        assert_eq!(decoded, addr);
        assert_eq!(used, 19);
    }

    #[test]
    fn decode_truncated_and_bad_type() {
        assert!(Address::decode(&[0x01, 1, 2]).is_err());
        assert!(Address::decode(&[0x03, 5, b'a']).is_err());
        assert!(Address::decode(&[0x7F, 0, 0]).is_err());
        assert!(Address::decode(&[]).is_err());
    }

    #[test]
    fn parse_domain_with_port() {
        let addr: Address = "example.com:8443".parse().unwrap();
        assert_eq!(addr, Address::Domain("example.com".to_string(), 8443));
        assert_eq!(addr.host(), "example.com");
        assert_eq!(addr.port(), 8443);
        assert!("example.com".parse::<Address>().is_err());
        assert!("example.com:http".parse::<Address>().is_err());
    }

    #[tokio::test]
    async fn async_read_matches_decode() {
        let addr = Address::Domain("93.example".to_string(), 80);
        let bytes = addr.to_bytes();
        let mut reader = &bytes[..];
        let read = Address::read_from(&mut reader).await.unwrap();
        assert_eq!(read, addr);
    }

    #[test]
    fn display_format() {
        let addr: Address = "93.184.216.34:80".parse().unwrap();
        assert_eq!(addr.to_string(), "93.184.216.34:80");
    }
}
