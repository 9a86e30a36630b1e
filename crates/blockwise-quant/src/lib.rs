//! Blockwise low-bit weight quantization.
//!
//! Three packed formats share one numeric core (range reduction in
//! [`range`], bit widths in [`bits`]):
//!
//! - [`q4gemm`] — the legacy per-column Q4Gemm blob layout (§4.3).
//! - [`blockwise`] — the generic 2-D blockwise quantizer, column-major packed
//!   output (§4.4).
//! - [`qdq`] — the row-major, row-packed QDQ layout used by graph-level
//!   Quantize/Dequantize operator pairs (§4.5).
//!
//! [`dispatch`] is a thin runtime switch over the above, mirroring the
//! `MlasQuantizeBlockwise`-style entry point these families were distilled
//! from. [`parallel`] is the injected threadpool collaborator every hot loop
//! runs against; [`error`] holds the `Result`-based failure surface for the
//! ergonomic wrapper API.

pub mod bits;
pub mod block;
pub mod blockwise;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod parallel;
pub mod q4gemm;
pub mod qdq;
pub mod range;

pub use bits::{Bits2, Bits4, BitWidth, QBits, DEFAULT_ZERO_POINT_4BIT};
pub use block::QuantType;
pub use error::{QuantError, QuantResult};
pub use parallel::{ParallelExecutor, SerialExecutor, ThreadPoolExecutor};

#[cfg(feature = "rayon")]
pub use parallel::RayonExecutor;
