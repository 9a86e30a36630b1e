//! Q4 GEMM B-matrix packing (§4.3).
//!
//! Packs an `[K, N]` row-major FP32 matrix into the per-column blob layout
//! described by a [`QuantType`], and unpacks it back. Generalizes the
//! `Q4_0Block::dequant`/`dequantize_q4_0` loop shape from
//! `crates/kernel/src/llm/quantize.rs` — fixed `BlkLen = 32`, no zero point —
//! to all four variants, with an optional per-block zero point and
//! variable `BlkLen`.

use crate::bits::QBits;
use crate::block::QuantType;
use crate::parallel::{ParallelExecutor, TileSlices};
use crate::range::{range_to_scale_symmetric, range_to_scale_zp_asymmetric};

/// Bytes `q4_gemm_pack_b` needs for an `[N, K]` packed B matrix, or 0 if
/// `qtype` doesn't support GEMM packing (never happens today — every
/// [`QuantType`] variant is a supported Q4Gemm layout — but the call stays
/// here rather than being inlined, as a single place to extend if that
/// changes).
pub fn q4_gemm_pack_b_size(qtype: QuantType, n: usize, k: usize) -> usize {
    if !q4_gemm_kernel_available(qtype) {
        return 0;
    }
    n * k_blocks(qtype, k) * qtype.blob_size()
}

/// Capability probe: does this build support packing for `qtype`? Every
/// [`QuantType`] is supported, so this currently always returns `true`; it
/// exists as the named decision point a caller should check before calling
/// `q4_gemm_pack_b_size`, matching the legacy `MlasQ4GemmPackBSize`-style
/// "ask first" convention (§6, §7).
pub const fn q4_gemm_kernel_available(_qtype: QuantType) -> bool {
    true
}

fn k_blocks(qtype: QuantType, k: usize) -> usize {
    k.div_ceil(qtype.blk_len())
}

/// Packs `src` (row-major, `k` rows by `n` columns, row stride `ld >= n`)
/// into `out`, column by column. Columns are independent, so packing fans
/// out over `executor`.
///
/// # Panics
/// Panics if `out` is shorter than [`q4_gemm_pack_b_size`] or `src` doesn't
/// hold `k` rows of `ld`-strided data covering all `n` columns.
pub fn q4_gemm_pack_b(
    qtype: QuantType,
    out: &mut [u8],
    src: &[f32],
    n: usize,
    k: usize,
    ld: usize,
    executor: &impl ParallelExecutor,
) {
    assert!(ld >= n, "row stride {ld} shorter than column count {n}");
    assert!(
        src.len() >= k.saturating_sub(1) * ld + n,
        "src too short for {k} rows of stride {ld}"
    );
    let blk_len = qtype.blk_len();
    let blob_size = qtype.blob_size();
    let n_blocks = k_blocks(qtype, k);
    let col_stride = n_blocks * blob_size;
    assert!(out.len() >= n * col_stride, "out too short for packed size");

    let tiles = TileSlices::new(out, col_stride);
    executor.parallel_for(n, |col| {
        let col_out = tiles.get(col);
        let mut buf = [0f32; 128];
        for b in 0..n_blocks {
            let k_start = b * blk_len;
            let klen = (k - k_start).min(blk_len);
            for j in 0..klen {
                buf[j] = src[(k_start + j) * ld + col];
            }
            let blob = &mut col_out[b * blob_size..(b + 1) * blob_size];
            pack_block(qtype, &buf[..klen], blob);
        }
    });
}

/// Unpacks `src` (as produced by [`q4_gemm_pack_b`]) back into `dst`
/// (row-major, `k` rows by `n` columns, row stride `ld >= n`).
///
/// Runs serially: unpacking happens once at load time, off the hot loop
/// `q4_gemm_pack_b` targets, so there's no `ParallelExecutor` parameter here.
///
/// # Panics
/// Panics if `src` is shorter than [`q4_gemm_pack_b_size`] or `dst` is too
/// short to hold `k` rows of `ld`-strided data covering all `n` columns.
pub fn q4_gemm_unpack_b(qtype: QuantType, dst: &mut [f32], src: &[u8], n: usize, k: usize, ld: usize) {
    assert!(ld >= n, "row stride {ld} shorter than column count {n}");
    let blk_len = qtype.blk_len();
    let blob_size = qtype.blob_size();
    let n_blocks = k_blocks(qtype, k);
    let col_stride = n_blocks * blob_size;
    assert!(src.len() >= n * col_stride, "src too short for packed size");
    assert!(
        dst.len() >= k.saturating_sub(1) * ld + n,
        "dst too short for {k} rows of stride {ld}"
    );

    for col in 0..n {
        let col_src = &src[col * col_stride..(col + 1) * col_stride];
        for b in 0..n_blocks {
            let k_start = b * blk_len;
            let klen = (k - k_start).min(blk_len);
            let blob = &col_src[b * blob_size..(b + 1) * blob_size];
            let mut buf = [0f32; 128];
            unpack_block(qtype, blob, &mut buf[..klen]);
            for j in 0..klen {
                dst[(k_start + j) * ld + col] = buf[j];
            }
        }
    }
}

/// Quantizes one K-block's worth of values (`values.len() <= qtype.blk_len()`,
/// shorter means a ragged tail; the uncovered tail positions pack
/// deterministically per §3 rather than running a synthetic `0.0` through the
/// quantize formula) into `blob`.
fn pack_block(qtype: QuantType, values: &[f32], blob: &mut [u8]) {
    let mut min = 0f32;
    let mut max = 0f32;
    for &v in values {
        if v < min {
            min = v;
        }
        if v > max {
            max = v;
        }
    }

    let zero_level = if qtype.asymmetric() {
        let r = range_to_scale_zp_asymmetric(min, max, QBits::Four.max());
        blob[0..4].copy_from_slice(&r.scale.to_le_bytes());
        blob[4] = r.zero_point;
        r.zero_point
    } else {
        let scale = range_to_scale_symmetric(min, max, QBits::Four.mid());
        blob[0..4].copy_from_slice(&scale.to_le_bytes());
        QBits::Four.mid() as u8
    };
    let scale = f32::from_le_bytes(blob[0..4].try_into().unwrap());

    let payload = &mut blob[qtype.payload_offset()..];
    let sub_strides = qtype.blk_len() / 32;
    for s in 0..sub_strides {
        for l in 0..16 {
            let v_lo = values.get(s * 32 + l).copied();
            let v_hi = values.get(s * 32 + l + 16).copied();
            let lo = pack_level(qtype, v_lo, scale, zero_level);
            let hi = pack_level(qtype, v_hi, scale, zero_level);
            payload[s * 16 + l] = lo | (hi << 4);
        }
    }
}

/// Quantizes one value, or produces the deterministic ragged-tail/all-zero
/// filler when `value` is absent or `scale` is zero (§3: the asymmetric pack
/// writes `zp` itself there — which dequantizes to exactly 0 — the symmetric
/// pack writes a literal `0`).
///
/// The symmetric and asymmetric branches use different rounding: asymmetric
/// rounds `v / scale` first and adds the integer zero point afterward;
/// symmetric adds an implicit `+0.5` bias before rounding (§4.3) — the two
/// are not interchangeable once `v / scale` lands near a half-integer.
fn pack_level(qtype: QuantType, value: Option<f32>, scale: f32, zero_level: u8) -> u8 {
    let filler = if qtype.asymmetric() { zero_level } else { 0 };
    let Some(v) = value else {
        return filler;
    };
    if scale == 0.0 {
        return filler;
    }
    let max_quant = QBits::Four.max() as f32;
    let q = if qtype.asymmetric() {
        (v / scale).round() + zero_level as f32
    } else {
        (v / scale + zero_level as f32 + 0.5).round()
    };
    q.clamp(0.0, max_quant) as u8
}

/// Dequantizes one blob into `out` (`out.len() <= qtype.blk_len()`, a short
/// `out` reads only the valid prefix of a ragged tail block).
fn unpack_block(qtype: QuantType, blob: &[u8], out: &mut [f32]) {
    let scale = f32::from_le_bytes(blob[0..4].try_into().unwrap());
    let zero_level = if qtype.asymmetric() { blob[4] } else { QBits::Four.mid() as u8 };
    let payload = &blob[qtype.payload_offset()..];
    let sub_strides = qtype.blk_len() / 32;
    for s in 0..sub_strides {
        for l in 0..16 {
            let byte = payload[s * 16 + l];
            let lo = byte & 0x0F;
            let hi = byte >> 4;
            if let Some(slot) = out.get_mut(s * 32 + l) {
                *slot = (lo as f32 - zero_level as f32) * scale;
            }
            if let Some(slot) = out.get_mut(s * 32 + l + 16) {
                *slot = (hi as f32 - zero_level as f32) * scale;
            }
        }
    }
}
