//! Runtime dispatch layer (§4.6).
//!
//! Two surfaces over the same underlying specializations:
//!
//! - The legacy, `MlasQuantizeBlockwise`-style entry points: a thin switch on
//!   `{block_size, qbits, columnwise}` that silently produces zero-sized
//!   buffers / no-ops for unsupported parameters, matching §7's "size
//!   helpers return 0, compute helpers silently no-op" contract.
//! - A `try_*` wrapper surface that surfaces the same failure kinds as
//!   `Result<_, QuantError>` — the idiomatic Rust rendition of what the
//!   legacy surface expresses as a silent no-op or a fatal abort (§7).

use crate::bits::QBits;
use crate::blockwise;
use crate::config::DispatchConfig;
use crate::error::{QuantError, QuantResult};
use crate::parallel::ParallelExecutor;
use crate::qdq;

/// Block sizes the dispatch layer recognizes (§4.6).
pub const SUPPORTED_BLOCK_SIZES: [usize; 5] = [16, 32, 64, 128, 256];

pub fn block_size_supported(block_size: usize) -> bool {
    SUPPORTED_BLOCK_SIZES.contains(&block_size)
}

/// Legacy buffer-size helper: `(0, 0, 0)` for any unsupported
/// `(qbits, block_size)` combination, exactly what a caller must check
/// before calling [`mlas_quantize_blockwise`] (§7).
pub fn mlas_quantize_blockwise_buffer_sizes(
    qbits: u32,
    block_size: usize,
    columnwise: bool,
    rows: usize,
    cols: usize,
) -> (usize, usize, usize) {
    if qbits != 4 || !block_size_supported(block_size) {
        return (0, 0, 0);
    }
    blockwise::buffer_sizes(block_size, columnwise, rows, cols)
}

/// Legacy quantize entry: silently no-ops for any unsupported `(qbits,
/// block_size)` combination rather than panicking (§4.6, §7) — only
/// `qbits == 4` is dispatched here, matching the legacy MLAS entry; 2-bit
/// lives solely behind the QDQ entry below.
#[allow(clippy::too_many_arguments)]
pub fn mlas_quantize_blockwise(
    qbits: u32,
    dst: &mut [u8],
    scales: &mut [f32],
    zero_points: Option<&mut [u8]>,
    src: &[f32],
    block_size: usize,
    columnwise: bool,
    rows: usize,
    cols: usize,
    ld: usize,
    executor: &impl ParallelExecutor,
) {
    if qbits != 4 || !block_size_supported(block_size) {
        return;
    }
    blockwise::quantize_blockwise(dst, scales, zero_points, src, block_size, columnwise, rows, cols, ld, executor);
}

/// Legacy dequantize entry, same no-op-on-unsupported contract.
pub fn mlas_dequantize_blockwise(
    qbits: u32,
    dst: &mut [f32],
    src: &[u8],
    scales: &[f32],
    zero_points: Option<&[u8]>,
    block_size: usize,
    columnwise: bool,
    rows: usize,
    cols: usize,
) {
    if qbits != 4 || !block_size_supported(block_size) {
        return;
    }
    blockwise::dequantize_blockwise(dst, src, scales, zero_points, block_size, columnwise, rows, cols);
}

/// QDQ buffer-size entry: supports `qbits` 2 or 4 (§4.6 "the QDQ entry adds
/// 2"). Returns `(0, 0, 0)` for any other `qbits` or unsupported
/// `block_size`; a precondition failure (column count not a multiple of
/// `pack_count`) also degrades to `(0, 0, 0)` here, since this is the
/// silent-no-op legacy surface — callers wanting the *invalid shape* error
/// kind should use [`try_qdq_quantize_column_wise`].
pub fn qdq_quantize_blockwise_buffer_sizes(
    qbits: u32,
    block_size: usize,
    rows: usize,
    cols: usize,
) -> (usize, usize, usize) {
    let Some(qbits) = QBits::from_u32(qbits) else {
        return (0, 0, 0);
    };
    if !block_size_supported(block_size) {
        return (0, 0, 0);
    }
    qdq::buffer_sizes(qbits, block_size, rows, cols).unwrap_or((0, 0, 0))
}

/// Ergonomic wrapper over [`blockwise::quantize_blockwise`] that surfaces
/// unsupported parameters as `Err` instead of a silent no-op.
#[allow(clippy::too_many_arguments)]
pub fn try_quantize_blockwise(
    cfg: DispatchConfig,
    dst: &mut [u8],
    scales: &mut [f32],
    zero_points: Option<&mut [u8]>,
    src: &[f32],
    rows: usize,
    cols: usize,
    ld: usize,
    executor: &impl ParallelExecutor,
) -> QuantResult<()> {
    if cfg.qbits != QBits::Four {
        return Err(QuantError::UnsupportedParameter {
            detail: format!("blockwise quantizer only supports 4-bit, got {}", cfg.qbits.bits()),
        });
    }
    if !block_size_supported(cfg.block_size) {
        return Err(QuantError::UnsupportedParameter {
            detail: format!("unsupported block size {}", cfg.block_size),
        });
    }
    blockwise::quantize_blockwise(
        dst,
        scales,
        zero_points,
        src,
        cfg.block_size,
        cfg.columnwise,
        rows,
        cols,
        ld,
        executor,
    );
    Ok(())
}

/// Legacy QDQ quantize entry, same no-op contract as [`mlas_quantize_blockwise`]:
/// silently does nothing for an unsupported `qbits`/`block_size` *or* for a
/// column count that isn't a multiple of `qbits.pack_count()` (§4.6, §7) —
/// the legacy surface has no error channel, so what `qdq::qdq_quantize_column_wise`
/// reports as `QuantError::InvalidShape` is swallowed here rather than
/// propagated. Callers wanting that error kind should use
/// [`try_qdq_quantize_column_wise`].
#[allow(clippy::too_many_arguments)]
pub fn qdq_quantize_blockwise(
    qbits: u32,
    dst: &mut [u8],
    scales: &mut [f32],
    zero_points: Option<&mut [u8]>,
    src: &[f32],
    block_size: usize,
    rows: usize,
    cols: usize,
    ld: usize,
    executor: &impl ParallelExecutor,
) {
    let Some(qbits) = QBits::from_u32(qbits) else {
        return;
    };
    if !block_size_supported(block_size) {
        return;
    }
    let _ = qdq::qdq_quantize_column_wise(qbits, dst, scales, zero_points, src, rows, cols, block_size, ld, executor);
}

/// Ergonomic wrapper over [`qdq::qdq_quantize_column_wise`]; propagates the
/// *invalid shape* error from `qdq.rs` and adds the *unsupported parameter*
/// check for `block_size`.
#[allow(clippy::too_many_arguments)]
pub fn try_qdq_quantize_column_wise(
    cfg: DispatchConfig,
    dst: &mut [u8],
    scales: &mut [f32],
    zero_points: Option<&mut [u8]>,
    src: &[f32],
    rows: usize,
    cols: usize,
    ld: usize,
    executor: &impl ParallelExecutor,
) -> QuantResult<()> {
    if !block_size_supported(cfg.block_size) {
        return Err(QuantError::UnsupportedParameter {
            detail: format!("unsupported block size {}", cfg.block_size),
        });
    }
    qdq::qdq_quantize_column_wise(cfg.qbits, dst, scales, zero_points, src, rows, cols, cfg.block_size, ld, executor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parallel::SerialExecutor;

    #[test]
    fn legacy_buffer_sizes_zero_for_unsupported_qbits() {
        assert_eq!(mlas_quantize_blockwise_buffer_sizes(8, 32, true, 64, 4), (0, 0, 0));
    }

    #[test]
    fn legacy_buffer_sizes_zero_for_unsupported_block_size() {
        assert_eq!(mlas_quantize_blockwise_buffer_sizes(4, 17, true, 64, 4), (0, 0, 0));
    }

    #[test]
    fn legacy_quantize_is_silent_noop_for_unsupported_params() {
        let mut dst = [0u8; 4];
        let mut scales = [0f32; 4];
        let src = [1.0f32; 64];
        mlas_quantize_blockwise(8, &mut dst, &mut scales, None, &src, 32, true, 64, 1, 1, &SerialExecutor);
        assert_eq!(dst, [0u8; 4]);
        assert_eq!(scales, [0f32; 4]);
    }

    #[test]
    fn try_quantize_blockwise_rejects_2bit() {
        let cfg = DispatchConfig {
            qbits: QBits::Two,
            ..DispatchConfig::default()
        };
        let mut dst = [0u8; 16];
        let mut scales = [0f32; 2];
        let src = [1.0f32; 32];
        let err = try_quantize_blockwise(cfg, &mut dst, &mut scales, None, &src, 32, 1, 1, &SerialExecutor).unwrap_err();
        assert!(matches!(err, QuantError::UnsupportedParameter { .. }));
    }

    #[test]
    fn try_quantize_blockwise_rejects_bad_block_size() {
        let cfg = DispatchConfig {
            block_size: 17,
            ..DispatchConfig::default()
        };
        let mut dst = [0u8; 16];
        let mut scales = [0f32; 2];
        let src = [1.0f32; 32];
        let err = try_quantize_blockwise(cfg, &mut dst, &mut scales, None, &src, 32, 1, 1, &SerialExecutor).unwrap_err();
        assert!(matches!(err, QuantError::UnsupportedParameter { .. }));
    }

    #[test]
    fn try_quantize_blockwise_succeeds_for_supported_params() {
        let cfg = DispatchConfig::default();
        let (data_bytes, n_scales, _) = blockwise::buffer_sizes(32, true, 32, 1);
        let mut dst = vec![0u8; data_bytes];
        let mut scales = vec![0f32; n_scales];
        let src = vec![1.0f32; 32];
        assert!(try_quantize_blockwise(cfg, &mut dst, &mut scales, None, &src, 32, 1, 1, &SerialExecutor).is_ok());
    }

    #[test]
    fn qdq_buffer_sizes_support_2_and_4_bit() {
        assert_ne!(qdq_quantize_blockwise_buffer_sizes(2, 32, 64, 4), (0, 0, 0));
        assert_ne!(qdq_quantize_blockwise_buffer_sizes(4, 32, 64, 4), (0, 0, 0));
        assert_eq!(qdq_quantize_blockwise_buffer_sizes(8, 32, 64, 4), (0, 0, 0));
    }

    #[test]
    fn qdq_legacy_quantize_is_silent_noop_for_unsupported_qbits() {
        let mut dst = [0u8; 64];
        let mut scales = [0f32; 4];
        let src = [1.0f32; 64 * 4];
        qdq_quantize_blockwise(8, &mut dst, &mut scales, None, &src, 32, 64, 4, 4, &SerialExecutor);
        assert_eq!(dst, [0u8; 64]);
        assert_eq!(scales, [0f32; 4]);
    }

    #[test]
    fn qdq_legacy_quantize_is_silent_noop_for_bad_column_count() {
        let mut dst = [0u8; 64];
        let mut scales = [0f32; 4];
        let src = [1.0f32; 64 * 3];
        qdq_quantize_blockwise(4, &mut dst, &mut scales, None, &src, 32, 64, 3, 3, &SerialExecutor);
        assert_eq!(dst, [0u8; 64]);
        assert_eq!(scales, [0f32; 4]);
    }

    #[test]
    fn qdq_legacy_quantize_succeeds_for_supported_params() {
        let (data_bytes, n_scales, _) = qdq_quantize_blockwise_buffer_sizes(4, 32, 64, 4);
        let mut dst = vec![0u8; data_bytes];
        let mut scales = vec![0f32; n_scales];
        let src = vec![1.0f32; 64 * 4];
        qdq_quantize_blockwise(4, &mut dst, &mut scales, None, &src, 32, 64, 4, 4, &SerialExecutor);
        assert!(scales.iter().any(|&s| s != 0.0));
    }
}
