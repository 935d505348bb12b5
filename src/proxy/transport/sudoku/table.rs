/// Sudoku 编解码表
///
/// 每个字节值对应一个（按密钥洗牌后的）4x4 数独网格；网格的任意 4 个
/// 能唯一确定它的提示 (val, pos) 都是该字节的一种编码。
/// 解码时 4 个提示排序后查表即可，和发送顺序无关。
use std::collections::HashMap;

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use sha2::{Digest, Sha256};

use super::grid::{generate_all_grids, Grid};
use super::layout::{resolve_layout, ByteLayout};
use crate::common::SudokuError;

/// 4 个提示组成的一个编码
pub type Puzzle = [u8; 4];

/// Sudoku 编解码表，构建后只读，可在连接间共享
pub struct Table {
    /// encode_table[byte] = 该字节全部可用编码
    encode_table: Vec<Vec<Puzzle>>,
    /// 排序后的 4 提示 → 原始字节
    decode_map: HashMap<u32, u8>,
    pub layout: ByteLayout,
}

impl Table {
    /// 构建编解码表
    ///
    /// - `key`: 预共享密钥（确定性洗牌网格）
    /// - `mode`: "prefer_ascii" | "prefer_entropy" | ""
    /// - `custom_pattern`: 自定义 XVP 模式（可空）
    ///
    /// 相同输入必然得到相同的表，服务端的盲探测依赖这一点。
    pub fn new(key: &str, mode: &str, custom_pattern: &str) -> Result<Self, SudokuError> {
        let layout = resolve_layout(mode, custom_pattern)?;
        let all_grids = generate_all_grids();

        let hash = Sha256::digest(key.as_bytes());
        let mut seed = [0u8; 8];
        seed.copy_from_slice(&hash[..8]);
        let mut rng = ChaCha8Rng::seed_from_u64(u64::from_be_bytes(seed));
        let mut shuffled: Vec<Grid> = all_grids.clone();
        shuffled.shuffle(&mut rng);

        // 对每个位置组合，统计全部网格在这 4 个位置上的取值分布；
        // 计数为 1 的取值即唯一确定网格的提示集合。
        let combinations = generate_combinations(16, 4);
        let counts: Vec<[u16; 256]> = combinations
            .iter()
            .map(|positions| {
                let mut hist = [0u16; 256];
                for g in &all_grids {
                    hist[clue_signature(g, positions) as usize] += 1;
                }
                hist
            })
            .collect();

        let mut encode_table: Vec<Vec<Puzzle>> = vec![Vec::new(); 256];
        let mut decode_map: HashMap<u32, u8> = HashMap::new();

        for (byte_val, target) in shuffled.iter().take(256).enumerate() {
            for (positions, hist) in combinations.iter().zip(&counts) {
                if hist[clue_signature(target, positions) as usize] != 1 {
                    continue;
                }
                let mut hints = [0u8; 4];
                for (slot, &pos) in hints.iter_mut().zip(positions) {
                    // 网格值 1..4 → 0..3
                    *slot = layout.encode_hint(target[pos] - 1, pos as u8);
                }
                encode_table[byte_val].push(hints);
                decode_map.insert(pack_hints_to_key(hints), byte_val as u8);
            }
        }

        if let Some(i) = encode_table.iter().position(|e| e.is_empty()) {
            return Err(SudokuError::Config(format!("byte {} has no usable encoding", i)));
        }

        Ok(Table {
            encode_table,
            decode_map,
            layout,
        })
    }

    /// 编码单个字节，随机选择一种编码
    pub fn encode_byte(&self, b: u8, rng: &mut impl rand::Rng) -> Puzzle {
        let encodings = &self.encode_table[b as usize];
        encodings[rng.gen_range(0..encodings.len())]
    }

    /// 某字节的全部编码
    pub fn encodings(&self, b: u8) -> &[Puzzle] {
        &self.encode_table[b as usize]
    }

    /// 解码 4 个提示字节（顺序无关）
    pub fn decode_hints(&self, hints: Puzzle) -> Option<u8> {
        self.decode_map.get(&pack_hints_to_key(hints)).copied()
    }

    pub fn padding_pool(&self) -> &[u8] {
        &self.layout.padding_pool
    }

    /// 获取随机 padding 字节
    pub fn random_padding(&self, rng: &mut impl rand::Rng) -> u8 {
        let pool = &self.layout.padding_pool;
        pool[rng.gen_range(0..pool.len())]
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("layout", &self.layout.name)
            .field("puzzles", &self.decode_map.len())
            .finish()
    }
}

/// 4 个位置上的网格值压成一个字节（每格 2 bit）
fn clue_signature(grid: &Grid, positions: &[usize]) -> u8 {
    positions
        .iter()
        .fold(0u8, |acc, &p| (acc << 2) | (grid[p] - 1))
}

/// 将 4 个提示排序后打包为 u32 键
pub fn pack_hints_to_key(mut hints: Puzzle) -> u32 {
    hints.sort_unstable();
    u32::from_be_bytes(hints)
}

/// 生成 C(n, k) 组合
fn generate_combinations(n: usize, k: usize) -> Vec<Vec<usize>> {
    let mut result = Vec::new();
    let mut current = Vec::with_capacity(k);
    combine(0, n, k, &mut current, &mut result);
    result
}

fn combine(start: usize, n: usize, k: usize, current: &mut Vec<usize>, result: &mut Vec<Vec<usize>>) {
    if k == 0 {
        result.push(current.clone());
        return;
    }
    for i in start..=(n - k) {
        current.push(i);
        combine(i + 1, n, k - 1, current, result);
        current.pop();
    }
}
