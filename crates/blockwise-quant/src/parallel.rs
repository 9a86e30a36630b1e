//! The injected threadpool collaborator (§5, §6.2).
//!
//! The core quantizers never create threads themselves; they call
//! `executor.parallel_for(n, |tile| ...)` against whatever pool the caller
//! plugs in. `SerialExecutor` is the "null pool" case from §5 — a serial loop
//! with identical per-tile semantics. `ThreadPoolExecutor` fans tiles out over
//! a fixed number of scoped threads, grounded in the `std::thread`-based
//! fan-out in `crates/testing/src/concurrency.rs`. `RayonExecutor` composes a
//! `rayon` parallel iterator, matching the dependency `jarvis-bench` (in the
//! teacher's own monorepo) already pulls in for this class of workload.

/// Runs `n` independent tile bodies, each given its tile index.
///
/// Implementations must not assume any ordering between tiles, and bodies
/// must not panic across the call boundary in a way the caller cannot
/// observe (a panicking body is allowed to abort the whole call, matching
/// §5's "a call runs to completion" model — there is no partial-result
/// recovery).
pub trait ParallelExecutor: Sync {
    fn parallel_for(&self, n: usize, body: impl Fn(usize) + Sync);
}

/// Serial fallback — the "pool is null" case in §5.
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialExecutor;

impl ParallelExecutor for SerialExecutor {
    fn parallel_for(&self, n: usize, body: impl Fn(usize) + Sync) {
        for i in 0..n {
            body(i);
        }
    }
}

/// Fixed-size scoped-thread fan-out, for callers who want real concurrency
/// without pulling in `rayon`.
#[derive(Debug, Clone, Copy)]
pub struct ThreadPoolExecutor {
    workers: usize,
}

impl ThreadPoolExecutor {
    /// `workers` is clamped to at least 1.
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }
}

impl Default for ThreadPoolExecutor {
    fn default() -> Self {
        Self::new(std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1))
    }
}

impl ParallelExecutor for ThreadPoolExecutor {
    fn parallel_for(&self, n: usize, body: impl Fn(usize) + Sync) {
        if n == 0 {
            return;
        }
        let workers = self.workers.min(n);
        std::thread::scope(|scope| {
            for w in 0..workers {
                let body = &body;
                scope.spawn(move || {
                    let mut i = w;
                    while i < n {
                        body(i);
                        i += workers;
                    }
                });
            }
        });
    }
}

/// `rayon`-backed executor, behind the default-on `rayon` feature.
#[cfg(feature = "rayon")]
#[derive(Debug, Default, Clone, Copy)]
pub struct RayonExecutor;

#[cfg(feature = "rayon")]
impl ParallelExecutor for RayonExecutor {
    fn parallel_for(&self, n: usize, body: impl Fn(usize) + Sync) {
        use rayon::prelude::*;
        (0..n).into_par_iter().for_each(|i| body(i));
    }
}

/// Splits a mutable buffer into `n` fixed-stride, non-overlapping chunks and
/// hands each one out by tile index from inside a `Sync` closure.
///
/// `parallel_for` only gives a body its tile index, not a piece of the output
/// buffer — tile bodies that write need a way to get a `&mut` to their own
/// slice while every other tile's body runs concurrently. `chunks_mut` can't
/// be called from inside the loop (it needs `&mut` once, up front), so this
/// pre-splits the addressing and uses a raw pointer to hand out the pieces.
///
/// # Safety
/// Soundness rests entirely on callers requesting each index in `0..n`
/// exactly once. `parallel_for`'s own contract (one call per tile) already
/// guarantees that, so every caller in this crate satisfies it by
/// construction; nothing here re-checks it at runtime.
pub(crate) struct TileSlices<'a, T> {
    ptr: *mut T,
    total_len: usize,
    stride: usize,
    _marker: std::marker::PhantomData<&'a mut [T]>,
}

unsafe impl<'a, T: Send> Sync for TileSlices<'a, T> {}

impl<'a, T> TileSlices<'a, T> {
    pub fn new(buf: &'a mut [T], stride: usize) -> Self {
        Self {
            ptr: buf.as_mut_ptr(),
            total_len: buf.len(),
            stride,
            _marker: std::marker::PhantomData,
        }
    }

    /// The `i`-th disjoint chunk, `stride` elements wide (shorter at the
    /// tail if `total_len` isn't a multiple of `stride`).
    pub fn get(&self, i: usize) -> &mut [T] {
        let start = (i * self.stride).min(self.total_len);
        let end = (start + self.stride).min(self.total_len);
        unsafe { std::slice::from_raw_parts_mut(self.ptr.add(start), end - start) }
    }
}

/// A bare `*mut T` wrapped so it can cross into a `Sync` tile-body closure.
///
/// Unlike [`TileSlices`], callers here address individual elements by a
/// formula rather than a fixed stride (scale/zero-point indices in
/// `blockwise.rs`, `qdq.rs`), so there's no slice to hand back — just a
/// pointer the tile body offsets itself.
///
/// # Safety
/// Soundness rests entirely on callers only ever touching indices their own
/// tile owns exclusively, exactly once.
pub(crate) struct SyncMutPtr<T>(pub *mut T);

unsafe impl<T> Sync for SyncMutPtr<T> {}
unsafe impl<T> Send for SyncMutPtr<T> {}

impl<T> Clone for SyncMutPtr<T> {
    fn clone(&self) -> Self {
        Self(self.0)
    }
}
impl<T> Copy for SyncMutPtr<T> {}
