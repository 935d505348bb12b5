/// yamux 帧格式
///
/// [version: 1B] [type: 1B] [flags: 2B] [stream_id: 4B] [length: 4B]
/// 总帧头 12 字节。Data 帧后跟 length 字节负载；WindowUpdate 的 length
/// 是窗口增量；Ping 的 length 是不透明值；GoAway 的 length 是原因码。
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::common::SudokuError;

pub const VERSION: u8 = 0;
pub const HEADER_SIZE: usize = 12;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Data = 0x00,
    WindowUpdate = 0x01,
    Ping = 0x02,
    GoAway = 0x03,
}

impl FrameType {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x00 => Some(Self::Data),
            0x01 => Some(Self::WindowUpdate),
            0x02 => Some(Self::Ping),
            0x03 => Some(Self::GoAway),
            _ => None,
        }
    }
}

pub mod flags {
    pub const SYN: u16 = 0x01;
    pub const ACK: u16 = 0x02;
    pub const FIN: u16 = 0x04;
    pub const RST: u16 = 0x08;
}

/// GoAway 原因码
pub mod goaway {
    pub const NORMAL: u32 = 0;
    pub const PROTOCOL_ERROR: u32 = 1;
    pub const INTERNAL_ERROR: u32 = 2;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub frame_type: FrameType,
    pub flags: u16,
    pub stream_id: u32,
    pub length: u32,
}

impl Header {
    pub fn new(frame_type: FrameType, flags: u16, stream_id: u32, length: u32) -> Self {
        Header {
            version: VERSION,
            frame_type,
            flags,
            stream_id,
            length,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = self.version;
        buf[1] = self.frame_type as u8;
        buf[2..4].copy_from_slice(&self.flags.to_be_bytes());
        buf[4..8].copy_from_slice(&self.stream_id.to_be_bytes());
        buf[8..12].copy_from_slice(&self.length.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Result<Self, SudokuError> {
        if buf[0] != VERSION {
            return Err(SudokuError::UnsupportedVersion {
                what: "mux frame",
                version: buf[0],
            });
        }
        let frame_type = FrameType::from_u8(buf[1])
            .ok_or_else(|| SudokuError::InvalidFrame(format!("unknown mux frame type {}", buf[1])))?;
        Ok(Header {
            version: buf[0],
            frame_type,
            flags: u16::from_be_bytes([buf[2], buf[3]]),
            stream_id: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            length: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
        })
    }

    pub fn has(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }

    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self, SudokuError> {
        let mut buf = [0u8; HEADER_SIZE];
        reader.read_exact(&mut buf).await.map_err(SudokuError::from_io)?;
        Self::decode(&buf)
    }
}

pub fn encode_data(stream_id: u32, flags: u16, data: &[u8]) -> Vec<u8> {
    let header = Header::new(FrameType::Data, flags, stream_id, data.len() as u32);
    let mut frame = Vec::with_capacity(HEADER_SIZE + data.len());
    frame.extend_from_slice(&header.encode());
    frame.extend_from_slice(data);
    frame
}

pub fn encode_window_update(stream_id: u32, flags: u16, delta: u32) -> Vec<u8> {
    Header::new(FrameType::WindowUpdate, flags, stream_id, delta)
        .encode()
        .to_vec()
}

pub fn encode_ping(flags: u16, opaque: u32) -> Vec<u8> {
    Header::new(FrameType::Ping, flags, 0, opaque).encode().to_vec()
}

pub fn encode_goaway(reason: u32) -> Vec<u8> {
    Header::new(FrameType::GoAway, 0, 0, reason).encode().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_fields() {
        let header = Header::new(FrameType::Data, flags::SYN | flags::FIN, 7, 1024);
        let encoded = header.encode();
        assert_eq!(encoded[1], 0x00);
        assert_eq!(&encoded[2..4], &[0x00, 0x05]);
        let decoded = Header::decode(&encoded).unwrap();
        assert_eq!(decoded, header);
        assert!(decoded.has(flags::FIN));
        assert!(!decoded.has(flags::RST));
    }

    #[test]
    fn rejects_unknown_type_and_version() {
        let mut raw = Header::new(FrameType::Ping, 0, 0, 1).encode();
        raw[1] = 0x09;
        assert!(matches!(Header::decode(&raw), Err(SudokuError::InvalidFrame(_))));
        raw[0] = 0x02;
        assert!(matches!(
            Header::decode(&raw),
            Err(SudokuError::UnsupportedVersion { version: 2, .. })
        ));
    }

    #[test]
    fn data_frame_layout() {
        let frame = encode_data(1, flags::SYN, b"hello");
        assert_eq!(frame.len(), HEADER_SIZE + 5);
        let mut raw = [0u8; HEADER_SIZE];
        raw.copy_from_slice(&frame[..HEADER_SIZE]);
        let header = Header::decode(&raw).unwrap();
        assert_eq!(header.stream_id, 1);
        assert_eq!(header.length, 5);
        assert_eq!(&frame[HEADER_SIZE..], b"hello");
    }

    #[tokio::test]
    async fn control_frames() {
        let mut wire = encode_window_update(3, flags::ACK, 65536);
        wire.extend(encode_ping(flags::SYN, 42));
        wire.extend(encode_goaway(goaway::PROTOCOL_ERROR));
        let mut reader = &wire[..];

        let update = Header::read_from(&mut reader).await.unwrap();
        assert_eq!((update.frame_type, update.stream_id, update.length), (FrameType::WindowUpdate, 3, 65536));
        let ping = Header::read_from(&mut reader).await.unwrap();
        assert_eq!((ping.frame_type, ping.length), (FrameType::Ping, 42));
        let away = Header::read_from(&mut reader).await.unwrap();
        assert_eq!((away.frame_type, away.length), (FrameType::GoAway, goaway::PROTOCOL_ERROR));
    }
}
