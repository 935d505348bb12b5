/// Packed 下行编码
///
/// 输入字节视为比特流，每 6 bit 映射为一个符号（复用布局的提示编码表），
/// 密度约为纯 Sudoku 编码的 5 倍。未满 6 bit 的尾部在 flush 时补零输出，
/// 紧跟一个 pad_marker，接收端见到 marker 就丢弃尚未凑满一个字节的残余比特。
use super::conn::Padder;
use super::table::Table;

/// 比特流 → 符号
#[derive(Debug, Default)]
pub struct PackedEncoder {
    bits: u32,
    nbits: u8,
}

impl PackedEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 是否有尚未输出的比特
    pub fn has_pending_bits(&self) -> bool {
        self.nbits > 0
    }

    pub fn encode(&mut self, table: &Table, padder: &mut Padder, input: &[u8], out: &mut Vec<u8>) {
        out.reserve(input.len() * 2);
        for &b in input {
            self.bits = (self.bits << 8) | b as u32;
            self.nbits += 8;
            while self.nbits >= 6 {
                self.nbits -= 6;
                let group = ((self.bits >> self.nbits) & 0x3F) as u8;
                self.bits &= (1 << self.nbits) - 1;
                padder.maybe_pad(table, out);
                out.push(table.layout.encode_group(group));
            }
        }
        padder.maybe_pad(table, out);
    }

    /// 输出残余比特并以 pad_marker 收尾
    pub fn finish(&mut self, table: &Table, padder: &mut Padder, out: &mut Vec<u8>) {
        if self.nbits == 0 {
            return;
        }
        let group = ((self.bits << (6 - self.nbits)) & 0x3F) as u8;
        padder.maybe_pad(table, out);
        out.push(table.layout.encode_group(group));
        out.push(table.layout.pad_marker);
        padder.maybe_pad(table, out);
        self.bits = 0;
        self.nbits = 0;
    }
}

/// 符号 → 比特流
#[derive(Debug, Default)]
pub struct PackedDecoder {
    bits: u32,
    nbits: u8,
}

impl PackedDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, table: &Table, raw: &[u8], out: &mut Vec<u8>) {
        let layout = &table.layout;
        for &b in raw {
            if b == layout.pad_marker {
                self.bits = 0;
                self.nbits = 0;
                continue;
            }
            let Some(group) = layout.decode_group(b) else {
                continue;
            };
            self.bits = (self.bits << 6) | group as u32;
            self.nbits += 6;
            if self.nbits >= 8 {
                self.nbits -= 8;
                out.push((self.bits >> self.nbits) as u8);
                self.bits &= (1 << self.nbits) - 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::OnceLock;

    fn table() -> &'static Table {
        static TABLE: OnceLock<Table> = OnceLock::new();
        TABLE.get_or_init(|| Table::new("packed-test", "prefer_ascii", "").unwrap())
    }

    fn roundtrip(chunks: &[&[u8]], padding: (u8, u8)) -> Vec<u8> {
        let t = table();
        let mut padder = Padder::new(padding.0, padding.1);
        let mut enc = PackedEncoder::new();
        let mut wire = Vec::new();
        for chunk in chunks {
            enc.encode(t, &mut padder, chunk, &mut wire);
            enc.finish(t, &mut padder, &mut wire);
        }
        let mut dec = PackedDecoder::new();
        let mut out = Vec::new();
        dec.feed(t, &wire, &mut out);
        out
    }

    #[test]
    fn every_length_survives_flush() {
        let data: Vec<u8> = (0..=255u8).collect();
        for len in 0..16 {
            assert_eq!(roundtrip(&[&data[..len]], (0, 0)), &data[..len], "len {}", len);
        }
    }

    #[test]
    fn flush_between_chunks_realigns() {
        let out = roundtrip(&[b"a", b"bc", b"def", b"ghij"], (10, 40));
        assert_eq!(out, b"abcdefghij");
    }

    #[test]
    fn full_padding_still_decodes() {
        let data: Vec<u8> = (0..1000u32).map(|i| (i * 7 % 251) as u8).collect();
        assert_eq!(roundtrip(&[&data], (100, 100)), data);
    }

    #[test]
    fn denser_than_pure_encoding() {
        let t = table();
        let mut padder = Padder::new(0, 0);
        let mut enc = PackedEncoder::new();
        let mut wire = Vec::new();
        enc.encode(t, &mut padder, &[0xAB; 300], &mut wire);
        assert_eq!(wire.len(), 400);
        assert!(wire.iter().all(|&b| t.layout.is_hint(b)));
    }

    #[test]
    fn decoder_byte_at_a_time() {
        let t = table();
        let mut padder = Padder::new(30, 60);
        let mut enc = PackedEncoder::new();
        let mut wire = Vec::new();
        enc.encode(t, &mut padder, b"streaming", &mut wire);
        enc.finish(t, &mut padder, &mut wire);

        let mut dec = PackedDecoder::new();
        let mut out = Vec::new();
        for b in wire {
            dec.feed(t, &[b], &mut out);
        }
        assert_eq!(out, b"streaming");
    }
}
