/// 字节布局
///
/// 定义 (val, pos) 提示如何落到单个线上字节，以及如何区分提示字节与 padding 字节。
/// 三种模式：ASCII（全可打印字符）、Entropy（低汉明重量）、Custom（自定义 XVP 模式）。
///
/// 同一个 6 bit 值 `val << 4 | pos` 也是 packed 下行模式的分组编码，
/// 因此提示编码和分组编码共用一张 64 项的映射表。
use crate::common::SudokuError;

const NOT_A_HINT: u8 = 0xFF;

/// 字节布局
pub struct ByteLayout {
    pub name: &'static str,
    /// encode[val << 4 | pos] = 线上字节
    encode: [u8; 64],
    /// decode[线上字节] = val << 4 | pos，非提示字节为 NOT_A_HINT
    decode: [u8; 256],
    /// 普通 padding 池（不含 pad_marker）
    pub padding_pool: Vec<u8>,
    /// packed 模式下标记"丢弃未满分组"的专用 padding 字节
    pub pad_marker: u8,
}

impl ByteLayout {
    fn build(
        name: &'static str,
        encode: [u8; 64],
        mut padding: Vec<u8>,
    ) -> Result<Self, SudokuError> {
        let mut decode = [NOT_A_HINT; 256];
        for (group, &b) in encode.iter().enumerate() {
            if decode[b as usize] != NOT_A_HINT {
                return Err(SudokuError::Config(format!(
                    "{} layout maps two hints to 0x{:02x}",
                    name, b
                )));
            }
            decode[b as usize] = group as u8;
        }
        if padding.iter().any(|&p| decode[p as usize] != NOT_A_HINT) {
            return Err(SudokuError::Config(format!(
                "{} layout padding overlaps hint bytes",
                name
            )));
        }
        if padding.len() < 2 {
            return Err(SudokuError::Config(format!(
                "{} layout padding pool too small",
                name
            )));
        }
        let pad_marker = padding.remove(0);
        Ok(ByteLayout {
            name,
            encode,
            decode,
            padding_pool: padding,
            pad_marker,
        })
    }

    /// 判断字节是否为提示字节
    #[inline]
    pub fn is_hint(&self, b: u8) -> bool {
        self.decode[b as usize] != NOT_A_HINT
    }

    /// 将 (val: 0..3, pos: 0..15) 编码为一个字节
    #[inline]
    pub fn encode_hint(&self, val: u8, pos: u8) -> u8 {
        self.encode[(((val & 0x03) << 4) | (pos & 0x0F)) as usize]
    }

    /// encode_hint 的逆运算
    #[inline]
    pub fn decode_hint(&self, b: u8) -> Option<(u8, u8)> {
        self.decode_group(b).map(|g| (g >> 4, g & 0x0F))
    }

    /// packed 模式：6 bit 分组 → 符号
    #[inline]
    pub fn encode_group(&self, group: u8) -> u8 {
        self.encode[(group & 0x3F) as usize]
    }

    /// packed 模式：符号 → 6 bit 分组
    #[inline]
    pub fn decode_group(&self, b: u8) -> Option<u8> {
        match self.decode[b as usize] {
            NOT_A_HINT => None,
            g => Some(g),
        }
    }
}

/// ASCII 布局：所有输出为可打印 ASCII 字符（0x7F 改写为 '\n'）
pub fn new_ascii_layout() -> Result<ByteLayout, SudokuError> {
    let mut encode = [0u8; 64];
    for (group, slot) in encode.iter_mut().enumerate() {
        let b = 0x40 | group as u8;
        *slot = if b == 0x7F { b'\n' } else { b };
    }
    let padding = (0x20..=0x3Fu8).rev().collect();
    ByteLayout::build("ascii", encode, padding)
}

/// 低熵布局：提示字节的 bit 7 与 bit 4 恒为 0
pub fn new_entropy_layout() -> Result<ByteLayout, SudokuError> {
    let mut encode = [0u8; 64];
    for (group, slot) in encode.iter_mut().enumerate() {
        let g = group as u8;
        *slot = ((g >> 4) << 5) | (g & 0x0F);
    }
    let mut padding = Vec::with_capacity(16);
    for i in 0..8u8 {
        padding.push(0x80 + i);
        padding.push(0x10 + i);
    }
    ByteLayout::build("entropy", encode, padding)
}

/// 自定义 XVP 布局
///
/// pattern 为 8 字符（最高位在前），恰好 2 个 'x'、2 个 'p'、4 个 'v'，不区分大小写。
/// - x 位：标记位，提示字节中全部置 1
/// - p 位：val（2 bit）
/// - v 位：pos（4 bit）
///
/// padding 取清掉一个 x 位、且汉明重量 ≥ 5 的字节。
pub fn new_custom_layout(pattern: &str) -> Result<ByteLayout, SudokuError> {
    let cleaned: String = pattern.trim().to_lowercase().replace(' ', "");
    if cleaned.len() != 8 {
        return Err(SudokuError::Config(format!(
            "custom table must be 8 characters, got {}",
            cleaned.len()
        )));
    }

    let mut x_bits = Vec::with_capacity(2);
    let mut p_bits = Vec::with_capacity(2);
    let mut v_bits = Vec::with_capacity(4);
    for (i, c) in cleaned.chars().enumerate() {
        let bit = 7 - i as u8;
        match c {
            'x' => x_bits.push(bit),
            'p' => p_bits.push(bit),
            'v' => v_bits.push(bit),
            other => {
                return Err(SudokuError::Config(format!(
                    "invalid character '{}' in custom table",
                    other
                )))
            }
        }
    }
    if x_bits.len() != 2 || p_bits.len() != 2 || v_bits.len() != 4 {
        return Err(SudokuError::Config(
            "custom table needs exactly 2 x, 2 p and 4 v".to_string(),
        ));
    }

    let x_mask = x_bits.iter().fold(0u8, |acc, &b| acc | (1 << b));
    let spread = |group: u8| -> u8 {
        let mut out = 0u8;
        let val = group >> 4;
        for (i, &bit) in p_bits.iter().enumerate() {
            if (val >> (1 - i)) & 1 == 1 {
                out |= 1 << bit;
            }
        }
        for (i, &bit) in v_bits.iter().enumerate() {
            if (group >> (3 - i)) & 1 == 1 {
                out |= 1 << bit;
            }
        }
        out
    };

    let mut encode = [0u8; 64];
    for (group, slot) in encode.iter_mut().enumerate() {
        *slot = x_mask | spread(group as u8);
    }

    let mut padding = Vec::new();
    for &dropped in &x_bits {
        let marker = x_mask & !(1 << dropped);
        for group in 0..64u8 {
            let b = marker | spread(group);
            if b.count_ones() >= 5 && !padding.contains(&b) {
                padding.push(b);
            }
        }
    }

    ByteLayout::build("custom", encode, padding)
}

/// 解析布局模式
pub fn resolve_layout(mode: &str, custom_pattern: &str) -> Result<ByteLayout, SudokuError> {
    match mode.trim().to_lowercase().as_str() {
        "ascii" | "prefer_ascii" => new_ascii_layout(),
        "entropy" | "prefer_entropy" | "" => {
            if custom_pattern.trim().is_empty() {
                new_entropy_layout()
            } else {
                new_custom_layout(custom_pattern)
            }
        }
        other => Err(SudokuError::Config(format!("invalid table-type: {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_layouts() -> Vec<ByteLayout> {
        vec![
            new_ascii_layout().unwrap(),
            new_entropy_layout().unwrap(),
            new_custom_layout("xpxvvpvv").unwrap(),
            new_custom_layout("vvpp xx vv").unwrap(),
        ]
    }

    #[test]
    fn ascii_hints_are_printable() {
        let layout = new_ascii_layout().unwrap();
        for val in 0..4u8 {
            for pos in 0..16u8 {
                let b = layout.encode_hint(val, pos);
                assert!((0x20..=0x7E).contains(&b) || b == b'\n', "0x{:02X}", b);
            }
        }
        assert!(layout.padding_pool.iter().all(|b| (0x20..=0x3F).contains(b)));
    }

    #[test]
    fn entropy_hints_clear_bits_7_and_4() {
        let layout = new_entropy_layout().unwrap();
        for g in 0..64u8 {
            assert_eq!(layout.encode_group(g) & 0x90, 0);
        }
    }

    #[test]
    fn hint_decode_inverts_encode() {
        for layout in all_layouts() {
            for val in 0..4u8 {
                for pos in 0..16u8 {
                    let b = layout.encode_hint(val, pos);
                    assert!(layout.is_hint(b));
                    assert_eq!(layout.decode_hint(b), Some((val, pos)), "{}", layout.name);
                }
            }
        }
    }

    #[test]
    fn padding_and_marker_are_not_hints() {
        for layout in all_layouts() {
            assert!(!layout.is_hint(layout.pad_marker), "{}", layout.name);
            assert!(!layout.padding_pool.contains(&layout.pad_marker));
            for &pad in &layout.padding_pool {
                assert!(!layout.is_hint(pad), "{}: 0x{:02X}", layout.name, pad);
            }
        }
    }

    #[test]
    fn custom_pattern_validation() {
        assert!(new_custom_layout("xxppvvv").is_err());
        assert!(new_custom_layout("xxxpvvvv").is_err());
        assert!(new_custom_layout("xxppvvvq").is_err());
        assert!(resolve_layout("prefer_rainbow", "").is_err());
    }

    #[test]
    fn custom_layouts_are_independent() {
        let a = new_custom_layout("xpxvvpvv").unwrap();
        let b = new_custom_layout("vvpvxpvx").unwrap();
        assert_ne!(a.encode_hint(1, 5), b.encode_hint(1, 5));
        // 构建第二个布局不能影响第一个
        assert_eq!(a.decode_hint(a.encode_hint(2, 9)), Some((2, 9)));
    }
}
