//! Smoke-test/demo harness for `blockwise-quant` (§2.2).
//!
//! Generates a random (seeded) f32 matrix, runs each of the three packed
//! layouts over it with a configurable thread count, dequantizes, and
//! reports max-absolute-error and elapsed time via `tracing` spans. Not a
//! performance benchmark suite — just a runnable surface over the library,
//! the way the onnxruntime MLAS routines this crate generalizes are exposed
//! through a harness binary rather than as a bare library with no caller.

use std::time::{Duration, Instant};

use anyhow::Result;
use blockwise_quant::config::DispatchConfig;
use blockwise_quant::dispatch::{try_qdq_quantize_column_wise, try_quantize_blockwise};
use blockwise_quant::parallel::{ParallelExecutor, RayonExecutor, SerialExecutor, ThreadPoolExecutor};
use blockwise_quant::q4gemm::{q4_gemm_pack_b, q4_gemm_pack_b_size, q4_gemm_unpack_b};
use blockwise_quant::qdq::{buffer_sizes as qdq_buffer_sizes, qdq_dequantize_column_wise};
use blockwise_quant::{blockwise, QBits, QuantType};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{info, info_span};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Overrides read the way `crates/daemon/src/main.rs` reads `SISCTL_BIND`:
/// a couple of environment variables, falling back to sane defaults.
struct BenchConfig {
    rows: usize,
    cols: usize,
    block_size: usize,
    threads: usize,
    seed: u64,
}

impl BenchConfig {
    fn from_env() -> Self {
        let var = |name: &str, default: usize| {
            std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
        };
        Self {
            rows: var("QUANT_BENCH_ROWS", 4096),
            cols: var("QUANT_BENCH_COLS", 256),
            block_size: var("QUANT_BENCH_BLOCK_SIZE", 32),
            threads: var("QUANT_BENCH_THREADS", 0),
            seed: std::env::var("QUANT_BENCH_SEED")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0xC0FFEE),
        }
    }
}

fn format_duration(duration: Duration) -> String {
    if duration.as_nanos() < 1_000 {
        format!("{}ns", duration.as_nanos())
    } else if duration.as_micros() < 1_000 {
        format!("{:.2}μs", duration.as_nanos() as f64 / 1_000.0)
    } else if duration.as_millis() < 1_000 {
        format!("{:.2}ms", duration.as_micros() as f64 / 1_000.0)
    } else {
        format!("{:.2}s", duration.as_millis() as f64 / 1_000.0)
    }
}

fn max_abs_error(src: &[f32], dense: &[f32]) -> f32 {
    src.iter().zip(dense.iter()).map(|(a, b)| (a - b).abs()).fold(0.0f32, f32::max)
}

fn gen_matrix(rows: usize, cols: usize, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..rows * cols).map(|_| rng.gen_range(-8.0f32..8.0)).collect()
}

fn run_blockwise(cfg: &BenchConfig, src: &[f32], executor: &impl ParallelExecutor) {
    let _span = info_span!("quantize_blockwise", rows = cfg.rows, cols = cfg.cols, block_size = cfg.block_size).entered();
    let (data_bytes, n_scales, _) = blockwise::buffer_sizes(cfg.block_size, true, cfg.rows, cfg.cols);
    let mut dst = vec![0u8; data_bytes];
    let mut scales = vec![0f32; n_scales];

    let dispatch_cfg = DispatchConfig {
        block_size: cfg.block_size,
        qbits: QBits::Four,
        columnwise: true,
        ..DispatchConfig::default()
    };
    let start = Instant::now();
    try_quantize_blockwise(dispatch_cfg, &mut dst, &mut scales, None, src, cfg.rows, cfg.cols, cfg.cols, executor)
        .expect("default bench shape is always a supported (qbits, block_size) combination");
    let pack_elapsed = start.elapsed();

    let mut dense = vec![0f32; cfg.rows * cfg.cols];
    let start = Instant::now();
    blockwise::dequantize_blockwise(&mut dense, &dst, &scales, None, cfg.block_size, true, cfg.rows, cfg.cols);
    let unpack_elapsed = start.elapsed();

    // dense is column-major ([j * rows + i]); compare against a column-major
    // view of src rather than re-deriving a transpose helper just for this report.
    let mut src_colmajor = vec![0f32; cfg.rows * cfg.cols];
    for i in 0..cfg.rows {
        for j in 0..cfg.cols {
            src_colmajor[j * cfg.rows + i] = src[i * cfg.cols + j];
        }
    }

    info!(
        pack_elapsed = %format_duration(pack_elapsed),
        unpack_elapsed = %format_duration(unpack_elapsed),
        max_abs_error = max_abs_error(&src_colmajor, &dense),
        "blockwise roundtrip complete"
    );
}

fn run_qdq(cfg: &BenchConfig, src: &[f32], executor: &impl ParallelExecutor) {
    let _span = info_span!("qdq_quantize_column_wise", rows = cfg.rows, cols = cfg.cols).entered();
    let (data_bytes, n_scales, _) = qdq_buffer_sizes(QBits::Four, cfg.block_size, cfg.rows, cfg.cols).unwrap();
    let mut dst = vec![0u8; data_bytes];
    let mut scales = vec![0f32; n_scales];

    let dispatch_cfg = DispatchConfig {
        block_size: cfg.block_size,
        qbits: QBits::Four,
        columnwise: true,
        ..DispatchConfig::default()
    };
    let start = Instant::now();
    try_qdq_quantize_column_wise(dispatch_cfg, &mut dst, &mut scales, None, src, cfg.rows, cfg.cols, cfg.cols, executor)
        .expect("default bench shape is always a supported (qbits, block_size) combination");
    let pack_elapsed = start.elapsed();

    let mut dense = vec![0f32; cfg.rows * cfg.cols];
    let start = Instant::now();
    qdq_dequantize_column_wise(QBits::Four, &mut dense, &dst, &scales, None, cfg.rows, cfg.cols, cfg.block_size).unwrap();
    let unpack_elapsed = start.elapsed();

    info!(
        pack_elapsed = %format_duration(pack_elapsed),
        unpack_elapsed = %format_duration(unpack_elapsed),
        max_abs_error = max_abs_error(src, &dense),
        "qdq roundtrip complete"
    );
}

fn run_q4gemm(cfg: &BenchConfig, src: &[f32], executor: &impl ParallelExecutor) {
    let _span = info_span!("q4_gemm_pack_b", n = cfg.cols, k = cfg.rows).entered();
    let size = q4_gemm_pack_b_size(QuantType::Sym, cfg.cols, cfg.rows);
    let mut packed = vec![0u8; size];

    let start = Instant::now();
    q4_gemm_pack_b(QuantType::Sym, &mut packed, src, cfg.cols, cfg.rows, cfg.cols, executor);
    let pack_elapsed = start.elapsed();

    let mut unpacked = vec![0f32; cfg.rows * cfg.cols];
    let start = Instant::now();
    q4_gemm_unpack_b(QuantType::Sym, &mut unpacked, &packed, cfg.cols, cfg.rows, cfg.cols);
    let unpack_elapsed = start.elapsed();

    info!(
        pack_elapsed = %format_duration(pack_elapsed),
        unpack_elapsed = %format_duration(unpack_elapsed),
        max_abs_error = max_abs_error(src, &unpacked),
        "q4gemm roundtrip complete"
    );
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = BenchConfig::from_env();
    info!(rows = cfg.rows, cols = cfg.cols, block_size = cfg.block_size, seed = cfg.seed, "quant-bench starting");

    let src = gen_matrix(cfg.rows, cfg.cols, cfg.seed);

    if cfg.threads == 1 {
        info!("running with SerialExecutor");
        let executor = SerialExecutor;
        run_blockwise(&cfg, &src, &executor);
        run_qdq(&cfg, &src, &executor);
        run_q4gemm(&cfg, &src, &executor);
    } else if cfg.threads == 0 {
        info!("running with RayonExecutor (default thread pool)");
        let executor = RayonExecutor;
        run_blockwise(&cfg, &src, &executor);
        run_qdq(&cfg, &src, &executor);
        run_q4gemm(&cfg, &src, &executor);
    } else {
        info!(threads = cfg.threads, "running with ThreadPoolExecutor");
        let executor = ThreadPoolExecutor::new(cfg.threads);
        run_blockwise(&cfg, &src, &executor);
        run_qdq(&cfg, &src, &executor);
        run_q4gemm(&cfg, &src, &executor);
    }

    info!("quant-bench finished");
    Ok(())
}
