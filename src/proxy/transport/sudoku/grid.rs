/// 4x4 数独网格枚举
///
/// 有效网格满足：每行、每列、每个 2x2 宫格各含 1..4 一次，共 288 个。
/// 网格按行优先展开为 16 个格子。

pub type Grid = [u8; 16];

pub const GRID_COUNT: usize = 288;

/// 枚举全部有效网格（顺序固定，保证同一密钥得到同一张表）
pub fn generate_all_grids() -> Vec<Grid> {
    let mut out = Vec::with_capacity(GRID_COUNT);
    let mut cells = [0u8; 16];
    // 每行/列/宫已占用数字的位掩码（bit n 表示数字 n 已出现）
    let mut rows = [0u8; 4];
    let mut cols = [0u8; 4];
    let mut boxes = [0u8; 4];
    fill(0, &mut cells, &mut rows, &mut cols, &mut boxes, &mut out);
    out
}

fn fill(
    idx: usize,
    cells: &mut Grid,
    rows: &mut [u8; 4],
    cols: &mut [u8; 4],
    boxes: &mut [u8; 4],
    out: &mut Vec<Grid>,
) {
    if idx == cells.len() {
        out.push(*cells);
        return;
    }
    let (r, c) = (idx / 4, idx % 4);
    let b = (r / 2) * 2 + c / 2;
    let used = rows[r] | cols[c] | boxes[b];

    for digit in 1u8..=4 {
        let bit = 1 << digit;
        if used & bit != 0 {
            continue;
        }
        cells[idx] = digit;
        rows[r] |= bit;
        cols[c] |= bit;
        boxes[b] |= bit;
        fill(idx + 1, cells, rows, cols, boxes, out);
        rows[r] &= !bit;
        cols[c] &= !bit;
        boxes[b] &= !bit;
    }
    cells[idx] = 0;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn is_valid(grid: &Grid) -> bool {
        let groups: Vec<[usize; 4]> = (0..4)
            .map(|r| [r * 4, r * 4 + 1, r * 4 + 2, r * 4 + 3])
            .chain((0..4).map(|c| [c, c + 4, c + 8, c + 12]))
            .chain([[0, 1, 4, 5], [2, 3, 6, 7], [8, 9, 12, 13], [10, 11, 14, 15]])
            .collect();
        groups.iter().all(|g| {
            let mut seen = 0u8;
            for &i in g {
                seen |= 1 << grid[i];
            }
            seen == 0b1_1110
        })
    }

    #[test]
    fn enumerates_every_grid_once() {
        let grids = generate_all_grids();
        assert_eq!(grids.len(), GRID_COUNT);
        let unique: HashSet<Grid> = grids.iter().copied().collect();
        assert_eq!(unique.len(), GRID_COUNT);
    }

    #[test]
    fn every_grid_is_valid() {
        assert!(generate_all_grids().iter().all(is_valid));
    }
}
