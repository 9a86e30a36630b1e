//! Error types for the `try_*` wrapper surface (§6.1, §7).
//!
//! Follows the `thiserror`-derived enum convention used throughout the
//! teacher workspace's userland crates (`TestError` in
//! `crates/testing/src/lib.rs`, `NpuError` in
//! `crates/testing/src/npu_backend.rs`): named variants, one `#[error(...)]`
//! message each.

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum QuantError {
    #[error("invalid shape: {detail}")]
    InvalidShape { detail: String },

    #[error("not implemented: {operation}")]
    NotImplemented { operation: &'static str },

    #[error("unsupported parameter: {detail}")]
    UnsupportedParameter { detail: String },
}

pub type QuantResult<T> = Result<T, QuantError>;
