//! Generic blockwise quantizer (§4.4).
//!
//! Partitions a row-major `[rows, cols]` source into 2-D quantization blocks
//! — `[block_size, 1]` when `columnwise`, `[1, block_size]` otherwise — and
//! emits a column-major, bit-packed, transposed output: element `(i, j)`
//! lives in the low nibble of `dst[j * q_rows + i/2]` when `i` is even, the
//! high nibble when `i` is odd (§3, item 2). Scales are column-major over the
//! meta grid; zero points pack two adjacent meta-rows per byte.
//!
//! Only 4-bit is supported here, per §4.4's parameter list — the QDQ family
//! (`qdq.rs`) is where 2-bit lives.
//!
//! Tiling note: the spec's reference implementation tiles 2 stacked
//! meta-blocks along the *quantization* axis and one meta-block across,
//! giving a different tile count for `columnwise` vs `rowwise`. Since tiles
//! own disjoint output bytes and tile shape is not part of the byte contract
//! (§5: "the visible ordering of writes within a tile is immaterial to
//! correctness"), this implementation always pairs two adjacent *meta-rows*
//! of the meta grid regardless of axis — the scale/zero-point indexing
//! formulas in §3 are already expressed in terms of the meta grid, not the
//! physical axis, so one tiling loop covers both cases and produces
//! identical output bytes to any other disjoint-tile scheme.

use crate::bits::DEFAULT_ZERO_POINT_4BIT;
use crate::parallel::{ParallelExecutor, SyncMutPtr};
use crate::range::{range_to_scale_symmetric, range_to_scale_zp_asymmetric};

const QBITS: u32 = 4;
const MAX_QUANT: u32 = (1 << QBITS) - 1;
const MID: u32 = 1 << (QBITS - 1);
const PACK_COUNT: usize = 2;

fn block_dims(block_size: usize, columnwise: bool) -> (usize, usize) {
    if columnwise {
        (block_size, 1)
    } else {
        (1, block_size)
    }
}

/// Shape of the scale/zero-point meta grid for a `[rows, cols]` source.
pub fn meta_shape(block_size: usize, columnwise: bool, rows: usize, cols: usize) -> (usize, usize) {
    let (block_rows, block_cols) = block_dims(block_size, columnwise);
    (rows.div_ceil(block_rows), cols.div_ceil(block_cols))
}

/// Shape of the packed payload buffer.
pub fn quantized_shape(block_size: usize, columnwise: bool, rows: usize, cols: usize) -> (usize, usize) {
    let (block_rows, block_cols) = block_dims(block_size, columnwise);
    let (meta_rows, meta_cols) = meta_shape(block_size, columnwise, rows, cols);
    let padded_rows = meta_rows * block_rows;
    let q_rows = padded_rows.div_ceil(PACK_COUNT);
    let q_cols = meta_cols * block_cols;
    (q_rows, q_cols)
}

/// Exact buffer sizes: `(payload bytes, scale count, zero-point bytes)`.
pub fn buffer_sizes(block_size: usize, columnwise: bool, rows: usize, cols: usize) -> (usize, usize, usize) {
    let (q_rows, q_cols) = quantized_shape(block_size, columnwise, rows, cols);
    let (meta_rows, meta_cols) = meta_shape(block_size, columnwise, rows, cols);
    let zp_bytes = meta_cols * meta_rows.div_ceil(PACK_COUNT);
    (q_rows * q_cols, meta_rows * meta_cols, zp_bytes)
}

struct BlockStat {
    scale: f32,
    zero_point: u8,
    recip: f32,
}

/// Scans block `[row_start, row_end) x [col_start, col_end)` of `src` (row
/// stride `ld`) and reduces it to a scale (and zero point, if asymmetric).
///
/// A block with no elements in range (possible only for the synthetic
/// out-of-grid meta-row of a ragged last tile) gets the load-bearing default
/// of zero scale, zero point 8 (§4.4 step 1, Open Question 4), rather than
/// going through the empty-scan path in `range.rs` (which would report zero
/// point 0, not 8).
fn reduce_block(
    src: &[f32],
    ld: usize,
    row_start: usize,
    row_end: usize,
    col_start: usize,
    col_end: usize,
    asymmetric: bool,
) -> BlockStat {
    if row_start >= row_end || col_start >= col_end {
        return BlockStat {
            scale: 0.0,
            zero_point: DEFAULT_ZERO_POINT_4BIT,
            recip: 0.0,
        };
    }
    let mut min = 0f32;
    let mut max = 0f32;
    for i in row_start..row_end {
        for j in col_start..col_end {
            let v = src[i * ld + j];
            if v < min {
                min = v;
            }
            if v > max {
                max = v;
            }
        }
    }
    let (scale, zero_point) = if asymmetric {
        let r = range_to_scale_zp_asymmetric(min, max, MAX_QUANT);
        (r.scale, r.zero_point)
    } else {
        (range_to_scale_symmetric(min, max, MID), MID as u8)
    };
    let recip = if scale == 0.0 { 0.0 } else { 1.0 / scale };
    BlockStat { scale, zero_point, recip }
}

fn quantize_one(v: f32, recip: f32, zero_point: u8) -> u8 {
    if recip == 0.0 {
        return zero_point;
    }
    (v * recip + zero_point as f32).round().clamp(0.0, MAX_QUANT as f32) as u8
}

/// Quantizes `src` (row-major `[rows, cols]`, row stride `ld >= cols`) into
/// the column-major packed layout of §4.4.
///
/// `dst` must be at least `buffer_sizes(..).0` bytes, `scales` at least
/// `buffer_sizes(..).1` elements. `zero_points` selects symmetric (`None`,
/// zero point fixed at 8) vs asymmetric (`Some`, at least `buffer_sizes(..).2`
/// bytes) quantization.
///
/// # Panics
/// Panics if any output buffer is undersized, or `ld < cols`.
#[allow(clippy::too_many_arguments)]
pub fn quantize_blockwise(
    dst: &mut [u8],
    scales: &mut [f32],
    mut zero_points: Option<&mut [u8]>,
    src: &[f32],
    block_size: usize,
    columnwise: bool,
    rows: usize,
    cols: usize,
    ld: usize,
    executor: &impl ParallelExecutor,
) {
    assert!(ld >= cols, "row stride {ld} shorter than column count {cols}");
    let (block_rows, block_cols) = block_dims(block_size, columnwise);
    let (meta_rows, meta_cols) = meta_shape(block_size, columnwise, rows, cols);
    let (q_rows, _) = quantized_shape(block_size, columnwise, rows, cols);
    let (data_bytes, n_scales, zp_bytes) = buffer_sizes(block_size, columnwise, rows, cols);
    assert!(dst.len() >= data_bytes, "dst too short for packed payload");
    assert!(scales.len() >= n_scales, "scales too short");
    if let Some(zp) = zero_points.as_deref() {
        assert!(zp.len() >= zp_bytes, "zero_points too short");
    }

    // Pre-fill zp bytes to the symmetric default (0x88): the high nibble of
    // the last byte of a meta_cols column whose meta_rows is odd addresses a
    // meta-row that doesn't exist, and must read back as zero point 8.
    if let Some(zp) = zero_points.as_deref_mut() {
        zp[..zp_bytes].fill(0x88);
    }
    let asymmetric = zero_points.is_some();

    let row_tiles = meta_rows.div_ceil(PACK_COUNT);
    let n_tiles = row_tiles * meta_cols;

    // Each tile writes a disjoint column range of `dst` and a disjoint
    // (meta_col, row_tile) slot of `scales`/`zero_points`; wrap the raw
    // pointers so they can cross into the `Sync` tile-body closure below.
    let dst_ptr = SyncMutPtr(dst.as_mut_ptr());
    let scales_ptr = SyncMutPtr(scales.as_mut_ptr());
    let zp_ptr = zero_points.as_deref_mut().map(|z| SyncMutPtr(z.as_mut_ptr()));

    executor.parallel_for(n_tiles, |tile| {
        let row_tile = tile % row_tiles;
        let meta_col = tile / row_tiles;
        let meta_row0 = row_tile * PACK_COUNT;

        let mut stats: [Option<BlockStat>; PACK_COUNT] = [None, None];
        for (kpack, stat_slot) in stats.iter_mut().enumerate() {
            let meta_row = meta_row0 + kpack;
            if meta_row >= meta_rows {
                continue;
            }
            let row_start = meta_row * block_rows;
            let row_end = (row_start + block_rows).min(rows);
            let col_start = meta_col * block_cols;
            let col_end = (col_start + block_cols).min(cols);
            let stat = reduce_block(src, ld, row_start, row_end, col_start, col_end, asymmetric);

            let scale_idx = meta_col * meta_rows + meta_row;
            // SAFETY: scale_idx is unique across tiles (meta_col, meta_row pair).
            unsafe { *scales_ptr.0.add(scale_idx) = stat.scale };

            if let Some(zp_ptr) = zp_ptr {
                let byte_idx = meta_col * meta_rows.div_ceil(PACK_COUNT) + meta_row / 2;
                // SAFETY: each tile owns this byte exclusively (row_tile == meta_row/2).
                unsafe {
                    let byte = zp_ptr.0.add(byte_idx);
                    let cleared = *byte & !(0x0F << (4 * kpack));
                    *byte = cleared | (stat.zero_point << (4 * kpack));
                }
            }
            *stat_slot = Some(stat);
        }

        let col_start = meta_col * block_cols;
        let col_end = (col_start + block_cols).min(cols);
        let row_lo = meta_row0 * block_rows;
        let row_hi = ((meta_row0 + PACK_COUNT) * block_rows).min(rows);

        for j in col_start..col_end {
            let mut i = row_lo;
            while i < row_hi {
                let kpack0 = (i / block_rows) - meta_row0;
                let stat0 = stats[kpack0].as_ref().expect("scanned above");
                let lo = quantize_one(src[i * ld + j], stat0.recip, stat0.zero_point);

                let hi = if i + 1 < rows && i + 1 < row_hi {
                    let kpack1 = ((i + 1) / block_rows) - meta_row0;
                    let stat1 = stats[kpack1].as_ref().expect("scanned above");
                    quantize_one(src[(i + 1) * ld + j], stat1.recip, stat1.zero_point)
                } else {
                    stat0.zero_point
                };

                let out_idx = j * q_rows + i / 2;
                // SAFETY: out_idx is unique across tiles (disjoint (j, meta_row0) pairs).
                unsafe { *dst_ptr.0.add(out_idx) = lo | (hi << 4) };
                i += 2;
            }
        }
    });
}

/// Inverse of [`quantize_blockwise`]; writes a dense, column-major
/// `rows * cols` float buffer (`dst[j * rows + i]`).
///
/// `zero_points == None` dequantizes as symmetric (zero point fixed at 8,
/// matching `0x88` in the pack path).
#[allow(clippy::too_many_arguments)]
pub fn dequantize_blockwise(
    dst: &mut [f32],
    src: &[u8],
    scales: &[f32],
    zero_points: Option<&[u8]>,
    block_size: usize,
    columnwise: bool,
    rows: usize,
    cols: usize,
) {
    let (block_rows, block_cols) = block_dims(block_size, columnwise);
    let (meta_rows, _meta_cols) = meta_shape(block_size, columnwise, rows, cols);
    let (q_rows, _q_cols) = quantized_shape(block_size, columnwise, rows, cols);
    assert!(dst.len() >= rows * cols, "dst too short for dense output");

    for j in 0..cols {
        let meta_col = j / block_cols;
        for i in 0..rows {
            let meta_row = i / block_rows;
            let scale = scales[meta_col * meta_rows + meta_row];
            let zero_point = match zero_points {
                Some(zp) => {
                    let byte_idx = meta_col * meta_rows.div_ceil(PACK_COUNT) + meta_row / 2;
                    let byte = zp[byte_idx];
                    if meta_row % 2 == 0 {
                        byte & 0x0F
                    } else {
                        byte >> 4
                    }
                }
                None => MID as u8,
            };
            let byte = src[j * q_rows + i / 2];
            let nibble = if i % 2 == 0 { byte & 0x0F } else { byte >> 4 };
            dst[j * rows + i] = (nibble as f32 - zero_point as f32) * scale;
        }
    }
}

/// `f16`-scale variant of [`quantize_blockwise`] (§6: `T ∈ {f32, f16}`).
/// Range reduction always runs in `f32` (§4.2); only the stored scale
/// narrows, the same convention the teacher's own `Q4_0Block` uses for its
/// `u16`-as-f16 scale field.
#[allow(clippy::too_many_arguments)]
pub fn quantize_blockwise_f16(
    dst: &mut [u8],
    scales: &mut [half::f16],
    zero_points: Option<&mut [u8]>,
    src: &[f32],
    block_size: usize,
    columnwise: bool,
    rows: usize,
    cols: usize,
    ld: usize,
    executor: &impl ParallelExecutor,
) {
    let (_, n_scales, _) = buffer_sizes(block_size, columnwise, rows, cols);
    let mut scales_f32 = vec![0f32; n_scales];
    quantize_blockwise(dst, &mut scales_f32, zero_points, src, block_size, columnwise, rows, cols, ld, executor);
    for (out, &s) in scales.iter_mut().zip(scales_f32.iter()) {
        *out = half::f16::from_f32(s);
    }
}

/// `f16`-scale variant of [`dequantize_blockwise`].
pub fn dequantize_blockwise_f16(
    dst: &mut [f32],
    src: &[u8],
    scales: &[half::f16],
    zero_points: Option<&[u8]>,
    block_size: usize,
    columnwise: bool,
    rows: usize,
    cols: usize,
) {
    let scales_f32: Vec<f32> = scales.iter().map(|s| s.to_f32()).collect();
    dequantize_blockwise(dst, src, &scales_f32, zero_points, block_size, columnwise, rows, cols);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parallel::SerialExecutor;

    #[test]
    fn shapes_match_spec_invariants() {
        // 4 meta-rows (B=32, rows=128), 3 columns, columnwise, qbits=4.
        let (meta_rows, meta_cols) = meta_shape(32, true, 128, 3);
        assert_eq!((meta_rows, meta_cols), (4, 3));
        let (q_rows, q_cols) = quantized_shape(32, true, 128, 3);
        assert_eq!(q_rows, 128 / 2);
        assert_eq!(q_cols, 3);
        let (data_bytes, n_scales, zp_bytes) = buffer_sizes(32, true, 128, 3);
        assert_eq!(data_bytes, q_rows * q_cols);
        assert_eq!(n_scales, meta_rows * meta_cols);
        assert_eq!(zp_bytes, meta_cols * meta_rows.div_ceil(2));
    }

    #[test]
    fn ragged_rows_pad_quantized_shape() {
        // rows=33 isn't a multiple of block_size=32: meta_rows=2, padded to 64 rows.
        let (q_rows, _) = quantized_shape(32, true, 33, 1);
        assert_eq!(q_rows, 64 / 2);
    }

    #[test]
    fn symmetric_two_meta_rows_packs_nibbles_by_row_pair() {
        let rows = 64;
        let cols = 2;
        let mut src = vec![0f32; rows * cols];
        for i in 0..rows {
            for j in 0..cols {
                src[i * cols + j] = (i as f32 - 32.0) * (j as f32 + 1.0) * 0.25;
            }
        }
        let (data_bytes, n_scales, _) = buffer_sizes(32, true, rows, cols);
        let mut dst = vec![0u8; data_bytes];
        let mut scales = vec![0f32; n_scales];
        quantize_blockwise(&mut dst, &mut scales, None, &src, 32, true, rows, cols, cols, &SerialExecutor);

        let mut dense = vec![0f32; rows * cols];
        dequantize_blockwise(&mut dense, &dst, &scales, None, 32, true, rows, cols);

        for i in 0..rows {
            for j in 0..cols {
                let meta_row = i / 32;
                let scale = scales[j * 2 + meta_row];
                let got = dense[j * rows + i];
                let orig = src[i * cols + j];
                assert!((got - orig).abs() <= scale.abs() + 1e-5, "i={i} j={j} got={got} orig={orig}");
            }
        }
    }

    #[test]
    fn asymmetric_zero_points_pack_two_per_byte() {
        // Two meta-rows (rows=64, B=32): zp[0] low nibble = meta_row 0's zp,
        // high nibble = meta_row 1's zp (§8's worked example).
        let rows = 64;
        let cols = 1;
        let mut src = vec![0f32; rows];
        for i in 0..32 {
            src[i] = i as f32; // all non-negative -> zp pinned toward 0
        }
        for i in 32..64 {
            src[i] = -(i as f32); // all non-positive -> zp pinned toward max
        }
        let (data_bytes, n_scales, zp_bytes) = buffer_sizes(32, true, rows, cols);
        let mut dst = vec![0u8; data_bytes];
        let mut scales = vec![0f32; n_scales];
        let mut zp = vec![0u8; zp_bytes];
        quantize_blockwise(&mut dst, &mut scales, Some(&mut zp), &src, 32, true, rows, cols, cols, &SerialExecutor);

        let zp0 = zp[0] & 0x0F;
        let zp1 = zp[0] >> 4;
        assert_eq!(zp0, 0); // all-positive block clamps zp low
        assert_eq!(zp1, 15); // all-non-positive block clamps zp high

        let byte0 = dst[0];
        assert_eq!(byte0 & 0x0F, zp0); // value 0 at i=0 quantizes to zp exactly
    }

    #[test]
    fn zero_points_default_to_eight_for_odd_meta_row_tail() {
        // rows=32 -> meta_rows=1 (odd): the tile's single stacked meta-row
        // leaves the zp byte's high nibble unwritten, must read back as 8.
        let rows = 32;
        let cols = 1;
        let (data_bytes, n_scales, zp_bytes) = buffer_sizes(32, true, rows, cols);
        let mut dst = vec![0u8; data_bytes];
        let mut scales = vec![0f32; n_scales];
        let mut zp = vec![0u8; zp_bytes];
        let src = vec![1.0f32; rows];
        quantize_blockwise(&mut dst, &mut scales, Some(&mut zp), &src, 32, true, rows, cols, cols, &SerialExecutor);
        assert_eq!(zp[0] >> 4, 8);
    }

    #[test]
    fn rowwise_axis_roundtrips() {
        let rows = 2;
        let cols = 64;
        let mut src = vec![0f32; rows * cols];
        for i in 0..rows {
            for j in 0..cols {
                src[i * cols + j] = (j as f32 - 32.0) * (i as f32 + 1.0) * 0.1;
            }
        }
        let (data_bytes, n_scales, _) = buffer_sizes(32, false, rows, cols);
        let mut dst = vec![0u8; data_bytes];
        let mut scales = vec![0f32; n_scales];
        quantize_blockwise(&mut dst, &mut scales, None, &src, 32, false, rows, cols, cols, &SerialExecutor);

        let mut dense = vec![0f32; rows * cols];
        dequantize_blockwise(&mut dense, &dst, &scales, None, 32, false, rows, cols);

        for i in 0..rows {
            for j in 0..cols {
                let meta_col = j / 32;
                let scale = scales[meta_col * rows + i];
                let got = dense[j * rows + i];
                let orig = src[i * cols + j];
                assert!((got - orig).abs() <= scale.abs() + 1e-5);
            }
        }
    }

    #[test]
    fn f16_scale_variant_roundtrips_within_half_precision() {
        let rows = 32;
        let cols = 2;
        let src: Vec<f32> = (0..rows * cols).map(|i| (i as f32 - 32.0) * 0.3).collect();
        let (data_bytes, n_scales, _) = buffer_sizes(32, true, rows, cols);
        let mut dst = vec![0u8; data_bytes];
        let mut scales = vec![half::f16::from_f32(0.0); n_scales];
        quantize_blockwise_f16(&mut dst, &mut scales, None, &src, 32, true, rows, cols, cols, &SerialExecutor);

        let mut dense = vec![0f32; rows * cols];
        dequantize_blockwise_f16(&mut dense, &dst, &scales, None, 32, true, rows, cols);

        for i in 0..rows {
            for j in 0..cols {
                let scale = scales[j].to_f32();
                assert!((dense[j * rows + i] - src[i * cols + j]).abs() <= scale.abs() * 2.0 + 1e-2);
            }
        }
    }

    #[test]
    fn determinism_across_executors() {
        let rows = 96;
        let cols = 5;
        let mut src = vec![0f32; rows * cols];
        for i in 0..rows {
            for j in 0..cols {
                src[i * cols + j] = ((i * 7 + j * 13) % 23) as f32 - 11.0;
            }
        }
        let (data_bytes, n_scales, zp_bytes) = buffer_sizes(32, true, rows, cols);
        let mut results = Vec::new();
        for workers in [1usize, 2, 8] {
            let mut dst = vec![0u8; data_bytes];
            let mut scales = vec![0f32; n_scales];
            let mut zp = vec![0u8; zp_bytes];
            let executor = crate::parallel::ThreadPoolExecutor::new(workers);
            quantize_blockwise(&mut dst, &mut scales, Some(&mut zp), &src, 32, true, rows, cols, cols, &executor);
            results.push((dst, scales, zp));
        }
        for pair in results.windows(2) {
            assert_eq!(pair[0].0, pair[1].0);
            assert_eq!(pair[0].1, pair[1].1);
            assert_eq!(pair[0].2, pair[1].2);
        }
    }
}
