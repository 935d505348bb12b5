/// 多表盲探测
///
/// 服务端配置了多张候选表时（用于换表而不影响存量客户端），
/// 客户端并不声明自己用的是哪一张。服务端逐步读入原始字节，
/// 对每张候选表做增量纯解码，再尝试从解码结果中解出第一个握手帧：
///
/// - 数据不足：保留候选，继续读
/// - 符号组非法 / 帧长不对 / 解密失败：永久淘汰（表是前缀确定的，不会误杀）
/// - 解密成功：立即选中
///
/// 只剩一个候选时直接选中，交给后续握手完成校验。
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

use super::conn::PureDecoder;
use super::crypto::{AeadCipher, AeadFramer, AeadMethod};
use super::framing::{parse_frame, FrameParse};
use super::handshake::HANDSHAKE_PAYLOAD_LEN;
use super::table::Table;
use crate::common::SudokuError;

/// 探测缓冲上限
pub const MAX_PROBE_BYTES: usize = 64 * 1024;
const PROBE_READ_CHUNK: usize = 2048;

struct Candidate {
    index: usize,
    decoder: PureDecoder,
    plain: Vec<u8>,
    fed: usize,
}

enum Verdict {
    Pending,
    Match,
    Reject,
}

pub struct TableSelector {
    cipher: AeadCipher,
    frame_len: usize,
    probe: Vec<u8>,
}

impl TableSelector {
    /// `initial` 为伪装层探测时已经读出的字节
    pub fn new(canonical_key: &str, method: AeadMethod, initial: Vec<u8>) -> Result<Self, SudokuError> {
        Ok(TableSelector {
            cipher: AeadCipher::from_key_material(method, canonical_key)?,
            frame_len: AeadFramer::<()>::frame_len_for(method, HANDSHAKE_PAYLOAD_LEN),
            probe: initial,
        })
    }

    /// 到目前为止从底层读出的全部字节
    pub fn probe(&self) -> &[u8] {
        &self.probe
    }

    pub fn into_probe(self) -> Vec<u8> {
        self.probe
    }

    fn judge(&self, table: &Table, cand: &mut Candidate) -> Verdict {
        if cand
            .decoder
            .feed(table, &self.probe[cand.fed..], &mut cand.plain)
            .is_err()
        {
            return Verdict::Reject;
        }
        cand.fed = self.probe.len();

        match parse_frame(&cand.plain, self.frame_len, self.frame_len) {
            FrameParse::NeedMore => Verdict::Pending,
            FrameParse::Invalid => Verdict::Reject,
            FrameParse::Frame(body, _) => match AeadFramer::<()>::open_body(&self.cipher, body) {
                Ok(_) => Verdict::Match,
                Err(_) => Verdict::Reject,
            },
        }
    }

    /// 选出客户端使用的表，返回其下标
    ///
    /// 本身不设超时，由外层握手截止时间约束。
    pub async fn select<R: AsyncRead + Unpin>(
        &mut self,
        reader: &mut R,
        tables: &[Arc<Table>],
    ) -> Result<usize, SudokuError> {
        if tables.len() <= 1 {
            return if tables.is_empty() {
                Err(SudokuError::ProbeExhausted)
            } else {
                Ok(0)
            };
        }

        let mut alive: Vec<Candidate> = (0..tables.len())
            .map(|index| Candidate {
                index,
                decoder: PureDecoder::new(),
                plain: Vec::new(),
                fed: 0,
            })
            .collect();

        loop {
            let mut i = 0;
            while i < alive.len() {
                let index = alive[i].index;
                match self.judge(&tables[index], &mut alive[i]) {
                    Verdict::Match => {
                        trace!(table = index, probe = self.probe.len(), "table probe matched");
                        return Ok(index);
                    }
                    Verdict::Reject => {
                        alive.swap_remove(i);
                    }
                    Verdict::Pending => i += 1,
                }
            }

            match alive.len() {
                0 => return Err(SudokuError::ProbeExhausted),
                1 => {
                    trace!(table = alive[0].index, "table probe short-circuited");
                    return Ok(alive[0].index);
                }
                _ => {}
            }
            if self.probe.len() >= MAX_PROBE_BYTES {
                return Err(SudokuError::ProbeExceeded(self.probe.len()));
            }

            let want = PROBE_READ_CHUNK.min(MAX_PROBE_BYTES - self.probe.len());
            let start = self.probe.len();
            self.probe.resize(start + want, 0);
            let n = match reader.read(&mut self.probe[start..]).await {
                Ok(n) => n,
                Err(e) => {
                    self.probe.truncate(start);
                    return Err(SudokuError::from_io(e));
                }
            };
            self.probe.truncate(start + n);
            if n == 0 {
                return Err(SudokuError::Io(std::io::ErrorKind::UnexpectedEof.into()));
            }
        }
    }
}
