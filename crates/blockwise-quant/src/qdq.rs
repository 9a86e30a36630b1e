//! QDQ-format quantizer (§4.5).
//!
//! Preserves the source's row-major `[rows, cols]` logical shape, and packs
//! `pack_count` adjacent *columns* of the same row into one output byte —
//! the opposite packing direction from `blockwise.rs`, which packs adjacent
//! *rows* of the same column. The quantization blocks themselves still run
//! down a column (`columnwise` tiling, §4.5), so a block's scale/zero point
//! is shared by `block_size` rows of one column, same as the generic
//! quantizer; only the final bit-packing direction differs.
//!
//! Supports both 4-bit and 2-bit (`qbits` here is a runtime [`QBits`], not a
//! hardcoded constant, since 2-bit only exists in this family).

use crate::bits::QBits;
use crate::error::{QuantError, QuantResult};
use crate::parallel::{ParallelExecutor, SyncMutPtr};
use crate::range::{quantize_level, range_to_scale_symmetric, range_to_scale_zp_asymmetric, scan_min_max};

/// Shape of the scale/zero-point grid: `[rows.div_ceil(block_size), cols]`,
/// row-major.
pub fn meta_shape(qbits: QBits, block_size: usize, rows: usize, cols: usize) -> QuantResult<(usize, usize)> {
    check_shape(qbits, cols)?;
    Ok((rows.div_ceil(block_size), cols))
}

/// Exact buffer sizes: `(payload bytes, scale count, zero-point bytes)`.
pub fn buffer_sizes(qbits: QBits, block_size: usize, rows: usize, cols: usize) -> QuantResult<(usize, usize, usize)> {
    let (meta_rows, meta_cols) = meta_shape(qbits, block_size, rows, cols)?;
    let pack_count = qbits.pack_count() as usize;
    let data_bytes = rows * cols.div_ceil(pack_count);
    let n_scales = meta_rows * meta_cols;
    let zp_bytes = n_scales / pack_count; // exact: meta_cols == cols is a multiple of pack_count
    Ok((data_bytes, n_scales, zp_bytes))
}

fn check_shape(qbits: QBits, cols: usize) -> QuantResult<()> {
    let pack_count = qbits.pack_count() as usize;
    if cols % pack_count != 0 {
        return Err(QuantError::InvalidShape {
            detail: format!("column count {cols} is not a multiple of pack_count {pack_count}"),
        });
    }
    Ok(())
}

struct ColumnStat {
    scale: f32,
    zero_point: u8,
}

fn reduce_column_block(
    src: &[f32],
    ld: usize,
    row_start: usize,
    row_end: usize,
    col: usize,
    qbits: QBits,
    asymmetric: bool,
) -> ColumnStat {
    let (min, max) = scan_min_max((row_start..row_end).map(|i| src[i * ld + col]));
    if asymmetric {
        let r = range_to_scale_zp_asymmetric(min, max, qbits.max());
        ColumnStat {
            scale: r.scale,
            zero_point: r.zero_point,
        }
    } else {
        ColumnStat {
            scale: range_to_scale_symmetric(min, max, qbits.mid()),
            zero_point: qbits.mid() as u8,
        }
    }
}

/// Quantizes `src` (row-major `[rows, cols]`, row stride `ld >= cols`) into
/// the QDQ row-packed layout (§4.5). `cols` must be a multiple of
/// `qbits.pack_count()`.
///
/// `dst` holds `rows` rows of `cols.div_ceil(pack_count)` packed bytes each;
/// `scales`/`zero_points` are row-major `[rows.div_ceil(block_size), cols]`
/// (zero points additionally packed `pack_count`-per-byte).
#[allow(clippy::too_many_arguments)]
pub fn qdq_quantize_column_wise(
    qbits: QBits,
    dst: &mut [u8],
    scales: &mut [f32],
    mut zero_points: Option<&mut [u8]>,
    src: &[f32],
    rows: usize,
    cols: usize,
    block_size: usize,
    ld: usize,
    executor: &impl ParallelExecutor,
) -> QuantResult<()> {
    assert!(ld >= cols, "row stride {ld} shorter than column count {cols}");
    let (data_bytes, n_scales, zp_bytes) = buffer_sizes(qbits, block_size, rows, cols)?;
    assert!(dst.len() >= data_bytes, "dst too short for packed payload");
    assert!(scales.len() >= n_scales, "scales too short");
    if let Some(zp) = zero_points.as_deref() {
        assert!(zp.len() >= zp_bytes, "zero_points too short");
    }

    let pack_count = qbits.pack_count() as usize;
    let byte_cols = cols / pack_count;
    let meta_rows = rows.div_ceil(block_size);
    let asymmetric = zero_points.is_some();

    let dst_ptr = SyncMutPtr(dst.as_mut_ptr());
    let scales_ptr = SyncMutPtr(scales.as_mut_ptr());
    let zp_ptr = zero_points.as_deref_mut().map(|z| SyncMutPtr(z.as_mut_ptr()));

    let n_tiles = meta_rows * byte_cols;
    executor.parallel_for(n_tiles, |tile| {
        let block_row = tile / byte_cols;
        let col_group = tile % byte_cols;
        let row_start = block_row * block_size;
        let row_end = (row_start + block_size).min(rows);
        let col0 = col_group * pack_count;

        let mut stats: Vec<ColumnStat> = Vec::with_capacity(pack_count);
        for k in 0..pack_count {
            let col = col0 + k;
            let stat = reduce_column_block(src, ld, row_start, row_end, col, qbits, asymmetric);
            let scale_idx = block_row * cols + col;
            // SAFETY: scale_idx is unique across tiles (block_row, col pair).
            unsafe { *scales_ptr.0.add(scale_idx) = stat.scale };
            stats.push(stat);
        }

        if let Some(zp_ptr) = zp_ptr {
            // SAFETY: this tile owns this byte exclusively (one (block_row, col_group) per byte).
            let byte_idx = (block_row * cols + col0) / pack_count;
            let mut byte = 0u8;
            for (k, stat) in stats.iter().enumerate() {
                byte |= stat.zero_point << shift_for(qbits, k);
            }
            unsafe { *zp_ptr.0.add(byte_idx) = byte };
        }

        for i in row_start..row_end {
            let mut byte = 0u8;
            for (k, stat) in stats.iter().enumerate() {
                let col = col0 + k;
                let level = quantize_level(src[i * ld + col], stat.scale, stat.zero_point, qbits.max());
                byte |= level << shift_for(qbits, k);
            }
            let byte_idx = i * byte_cols + col_group;
            // SAFETY: byte_idx is unique across tiles (disjoint (row, col_group) pairs).
            unsafe { *dst_ptr.0.add(byte_idx) = byte };
        }
    });

    Ok(())
}

/// Bit offset of the `k`-th of `qbits.pack_count()` values within a packed byte.
fn shift_for(qbits: QBits, k: usize) -> u32 {
    k as u32 * qbits.bits()
}

/// Inverse of [`qdq_quantize_column_wise`]; writes a dense row-major
/// `rows * cols` float buffer.
pub fn qdq_dequantize_column_wise(
    qbits: QBits,
    dst: &mut [f32],
    src: &[u8],
    scales: &[f32],
    zero_points: Option<&[u8]>,
    rows: usize,
    cols: usize,
    block_size: usize,
) -> QuantResult<()> {
    check_shape(qbits, cols)?;
    assert!(dst.len() >= rows * cols, "dst too short for dense output");
    let pack_count = qbits.pack_count() as usize;
    let byte_cols = cols / pack_count;
    let mask = qbits.max() as u8;

    for i in 0..rows {
        let block_row = i / block_size;
        for col_group in 0..byte_cols {
            let byte = src[i * byte_cols + col_group];
            for k in 0..pack_count {
                let col = col_group * pack_count + k;
                let level = (byte >> shift_for(qbits, k)) & mask;
                let scale_idx = block_row * cols + col;
                let scale = scales[scale_idx];
                let zero_point = match zero_points {
                    Some(zp) => {
                        let zp_byte = zp[scale_idx / pack_count];
                        (zp_byte >> shift_for(qbits, scale_idx % pack_count)) & mask
                    }
                    None => qbits.mid() as u8,
                };
                dst[i * cols + col] = (level as f32 - zero_point as f32) * scale;
            }
        }
    }
    Ok(())
}

/// Row-wise QDQ quantization is declared in the legacy source but reserved —
/// §4.5/Open Question 2: there is no mandated behavior, so this always
/// reports *not implemented* rather than silently doing nothing.
pub fn qdq_quantize_row_wise() -> QuantResult<()> {
    Err(QuantError::NotImplemented {
        operation: "BlockwiseQDQQuantizer::quantizeRowWise",
    })
}

/// Converts a QDQ packed buffer (row-major, row-packed) into the
/// `blockwise.rs` column-major packed layout used by the fused matmul
/// kernel (§4.5's `Transpose`).
///
/// Only defined for `qbits == 4`: the blockwise family this transposes into
/// never supports 2-bit (§4.4), so a 2-bit source has no destination layout
/// to transpose into.
///
/// Implemented as unpack-to-levels (stopping short of the final
/// dequantization multiply) followed by the blockwise column-major level
/// packer, rather than a direct nibble shuffle — see `DESIGN.md` for why.
#[allow(clippy::too_many_arguments)]
pub fn transpose_to_blockwise(
    qdq_src: &[u8],
    qdq_scales: &[f32],
    qdq_zero_points: Option<&[u8]>,
    bw_dst: &mut [u8],
    bw_scales: &mut [f32],
    mut bw_zero_points: Option<&mut [u8]>,
    rows: usize,
    cols: usize,
    block_size: usize,
) -> QuantResult<()> {
    let qbits = QBits::Four;
    check_shape(qbits, cols)?;
    let pack_count = qbits.pack_count() as usize;
    let byte_cols = cols / pack_count;
    let mask = qbits.max() as u8;
    let meta_rows = rows.div_ceil(block_size);

    let (bw_data_bytes, bw_n_scales, bw_zp_bytes) = crate::blockwise::buffer_sizes(block_size, true, rows, cols);
    assert!(bw_dst.len() >= bw_data_bytes);
    assert!(bw_scales.len() >= bw_n_scales);
    let (bw_q_rows, _) = crate::blockwise::quantized_shape(block_size, true, rows, cols);

    // Reshape scales: QDQ is row-major [meta_rows, cols], blockwise is
    // column-major over the same grid.
    for block_row in 0..meta_rows {
        for col in 0..cols {
            bw_scales[col * meta_rows + block_row] = qdq_scales[block_row * cols + col];
        }
    }

    // Repack zero points from "pack_count adjacent columns share a byte" to
    // "two adjacent meta-rows of the same column share a byte".
    if let (Some(qdq_zp), Some(bw_zp)) = (qdq_zero_points, bw_zero_points.as_deref_mut()) {
        bw_zp[..bw_zp_bytes].fill(0x88);
        for block_row in 0..meta_rows {
            for col in 0..cols {
                let scale_idx = block_row * cols + col;
                let zp_byte = qdq_zp[scale_idx / pack_count];
                let zp = (zp_byte >> shift_for(qbits, scale_idx % pack_count)) & mask;
                let out_byte = col * meta_rows.div_ceil(2) + block_row / 2;
                let shift = 4 * (block_row % 2);
                let cleared = bw_zp[out_byte] & !(0x0F << shift);
                bw_zp[out_byte] = cleared | (zp << shift);
            }
        }
    }

    // Unpack levels and repack along the blockwise nibble direction. Rows
    // are visited one at a time (not in the pair-at-a-time order
    // `blockwise.rs`'s own packer uses), so the byte each nibble lands in
    // must start zeroed or the untouched nibble would read back as garbage.
    bw_dst[..bw_data_bytes].fill(0);
    for i in 0..rows {
        for col_group in 0..byte_cols {
            let byte = qdq_src[i * byte_cols + col_group];
            for k in 0..pack_count {
                let col = col_group * pack_count + k;
                let level = (byte >> shift_for(qbits, k)) & mask;
                let out_idx = col * bw_q_rows + i / 2;
                if i % 2 == 0 {
                    bw_dst[out_idx] = (bw_dst[out_idx] & 0xF0) | level;
                } else {
                    bw_dst[out_idx] = (bw_dst[out_idx] & 0x0F) | (level << 4);
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parallel::SerialExecutor;

    #[test]
    fn rejects_column_count_not_multiple_of_pack_count() {
        let err = meta_shape(QBits::Two, 32, 4, 3).unwrap_err();
        assert!(matches!(err, QuantError::InvalidShape { .. }));
    }

    #[test]
    fn qdq_2bit_spec_vector() {
        // [0, 1, 2, 3] at positions 0..3 of a row of 4 columns packs into
        // 0xE4 = 0 | (1<<2) | (2<<4) | (3<<6) once quantized. Using a scale
        // of 1.0 and zp 0 directly exercises the packing, not the reduction.
        let rows = 1;
        let cols = 4;
        let src = vec![0.0f32, 1.0, 2.0, 3.0];
        let (data_bytes, n_scales, _) = buffer_sizes(QBits::Two, 4, rows, cols).unwrap();
        let mut dst = vec![0u8; data_bytes];
        let mut scales = vec![0f32; n_scales];
        qdq_quantize_column_wise(QBits::Two, &mut dst, &mut scales, None, &src, rows, cols, 4, cols, &SerialExecutor)
            .unwrap();
        // symmetric, mid=2: scale picks max-magnitude element (3.0) => scale = 3.0/2.0 = 1.5
        // levels = round(v/scale) + 2, clamped to [0,3]
        let scale = scales[0];
        let expected: Vec<u8> = src.iter().map(|&v| quantize_level(v, scale, 2, 3)).collect();
        let packed = expected[0] | (expected[1] << 2) | (expected[2] << 4) | (expected[3] << 6);
        assert_eq!(dst[0], packed);
    }

    #[test]
    fn qdq_4bit_roundtrip_within_one_step() {
        let rows = 64;
        let cols = 8;
        let mut src = vec![0f32; rows * cols];
        for i in 0..rows {
            for j in 0..cols {
                src[i * cols + j] = ((i as f32) - 32.0) * (j as f32 + 1.0) * 0.05;
            }
        }
        let (data_bytes, n_scales, _) = buffer_sizes(QBits::Four, 32, rows, cols).unwrap();
        let mut dst = vec![0u8; data_bytes];
        let mut scales = vec![0f32; n_scales];
        qdq_quantize_column_wise(QBits::Four, &mut dst, &mut scales, None, &src, rows, cols, 32, cols, &SerialExecutor)
            .unwrap();

        let mut dense = vec![0f32; rows * cols];
        qdq_dequantize_column_wise(QBits::Four, &mut dense, &dst, &scales, None, rows, cols, 32).unwrap();

        for i in 0..rows {
            for j in 0..cols {
                let block_row = i / 32;
                let scale = scales[block_row * cols + j];
                assert!((dense[i * cols + j] - src[i * cols + j]).abs() <= scale.abs() + 1e-5);
            }
        }
    }

    #[test]
    fn qdq_asymmetric_zero_point_roundtrip() {
        let rows = 32;
        let cols = 2;
        let src: Vec<f32> = (0..rows * cols).map(|i| (i as f32) - 20.0).collect();
        let (data_bytes, n_scales, zp_bytes) = buffer_sizes(QBits::Four, 32, rows, cols).unwrap();
        let mut dst = vec![0u8; data_bytes];
        let mut scales = vec![0f32; n_scales];
        let mut zp = vec![0u8; zp_bytes];
        qdq_quantize_column_wise(
            QBits::Four,
            &mut dst,
            &mut scales,
            Some(&mut zp),
            &src,
            rows,
            cols,
            32,
            cols,
            &SerialExecutor,
        )
        .unwrap();

        let mut dense = vec![0f32; rows * cols];
        qdq_dequantize_column_wise(QBits::Four, &mut dense, &dst, &scales, Some(&zp), rows, cols, 32).unwrap();
        assert!((dense[0] - src[0]).abs() <= scales[0].abs() + 1e-5);
    }

    #[test]
    fn row_wise_reports_not_implemented() {
        assert!(matches!(qdq_quantize_row_wise(), Err(QuantError::NotImplemented { .. })));
    }

    #[test]
    fn transpose_matches_direct_blockwise_quantize() {
        let rows = 64;
        let cols = 3;
        let block_size = 32;
        let mut src = vec![0f32; rows * cols];
        for i in 0..rows {
            for j in 0..cols {
                src[i * cols + j] = ((i as f32) - 32.0) * (j as f32 + 1.0) * 0.1;
            }
        }

        let (qdq_bytes, qdq_scales_n, _) = buffer_sizes(QBits::Four, block_size, rows, cols).unwrap();
        let mut qdq_dst = vec![0u8; qdq_bytes];
        let mut qdq_scales = vec![0f32; qdq_scales_n];
        qdq_quantize_column_wise(
            QBits::Four,
            &mut qdq_dst,
            &mut qdq_scales,
            None,
            &src,
            rows,
            cols,
            block_size,
            cols,
            &SerialExecutor,
        )
        .unwrap();

        let (bw_bytes, bw_scales_n, _) = crate::blockwise::buffer_sizes(block_size, true, rows, cols);
        let mut bw_dst_direct = vec![0u8; bw_bytes];
        let mut bw_scales_direct = vec![0f32; bw_scales_n];
        crate::blockwise::quantize_blockwise(
            &mut bw_dst_direct,
            &mut bw_scales_direct,
            None,
            &src,
            block_size,
            true,
            rows,
            cols,
            cols,
            &SerialExecutor,
        );

        let mut bw_dst_transposed = vec![0u8; bw_bytes];
        let mut bw_scales_transposed = vec![0f32; bw_scales_n];
        transpose_to_blockwise(
            &qdq_dst,
            &qdq_scales,
            None,
            &mut bw_dst_transposed,
            &mut bw_scales_transposed,
            None,
            rows,
            cols,
            block_size,
        )
        .unwrap();

        assert_eq!(bw_scales_transposed, bw_scales_direct);
        assert_eq!(bw_dst_transposed, bw_dst_direct);
    }

    #[test]
    fn determinism_across_executors() {
        let rows = 64;
        let cols = 6;
        let src: Vec<f32> = (0..rows * cols).map(|i| ((i * 31) % 17) as f32 - 8.0).collect();
        let (data_bytes, n_scales, _) = buffer_sizes(QBits::Four, 32, rows, cols).unwrap();
        let mut results = Vec::new();
        for workers in [1usize, 2, 8] {
            let mut dst = vec![0u8; data_bytes];
            let mut scales = vec![0f32; n_scales];
            let executor = crate::parallel::ThreadPoolExecutor::new(workers);
            qdq_quantize_column_wise(QBits::Four, &mut dst, &mut scales, None, &src, rows, cols, 32, cols, &executor)
                .unwrap();
            results.push((dst, scales));
        }
        for pair in results.windows(2) {
            assert_eq!(pair[0].0, pair[1].0);
            assert_eq!(pair[0].1, pair[1].1);
        }
    }
}
