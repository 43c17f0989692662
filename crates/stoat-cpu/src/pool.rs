// CPU buffer pool — caching allocator for host tensor buffers.
//
// Tensor churn during training allocates and frees the same handful of
// buffer sizes over and over (one set per step). Instead of round-tripping
// through the system allocator, released buffers park here in per-type
// free lists keyed by capacity; the next allocation of the same element
// type and count reuses them.
//
// Buffers enter the pool through `reclaim` (the backend's recycle hook,
// fed by weight-tensor release) and leave through the typed alloc calls on
// the creation paths. `empty_cache` hands everything back to the system
// allocator.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::CpuStorage;

/// Snapshot of the pool's state and lifetime counters.
#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    /// Bytes currently parked in the cache.
    pub cached_bytes: usize,
    /// Number of cached buffers.
    pub cached_buffers: usize,
    /// Allocations served from the cache.
    pub hits: u64,
    /// Allocations that fell through to the system allocator.
    pub misses: u64,
}

/// Per-element-type free lists: capacity → stack of empty buffers.
struct TypedPool<T> {
    buckets: Mutex<HashMap<usize, Vec<Vec<T>>>>,
}

impl<T> TypedPool<T> {
    fn new() -> Self {
        TypedPool {
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Pop a cached buffer with capacity for exactly `n` elements.
    /// Returned buffers are empty (len 0).
    fn take(&self, n: usize) -> Option<Vec<T>> {
        self.buckets.lock().unwrap().get_mut(&n)?.pop()
    }

    fn put(&self, mut buf: Vec<T>) {
        buf.clear();
        let cap = buf.capacity();
        if cap == 0 {
            return;
        }
        self.buckets.lock().unwrap().entry(cap).or_default().push(buf);
    }

    /// (buffer count, total element capacity) currently cached.
    fn stats(&self) -> (usize, usize) {
        let map = self.buckets.lock().unwrap();
        let mut count = 0;
        let mut elems = 0;
        for (cap, stack) in map.iter() {
            count += stack.len();
            elems += cap * stack.len();
        }
        (count, elems)
    }

    fn drain(&self) {
        self.buckets.lock().unwrap().clear();
    }
}

/// Caching allocator for one logical CPU device.
pub struct CpuMemPool {
    pool_f16: TypedPool<half::f16>,
    pool_f32: TypedPool<f32>,
    pool_f64: TypedPool<f64>,
    pool_u8: TypedPool<u8>,
    pool_i64: TypedPool<i64>,

    hits: AtomicU64,
    misses: AtomicU64,
}

impl Default for CpuMemPool {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuMemPool {
    pub fn new() -> Self {
        CpuMemPool {
            pool_f16: TypedPool::new(),
            pool_f32: TypedPool::new(),
            pool_f64: TypedPool::new(),
            pool_u8: TypedPool::new(),
            pool_i64: TypedPool::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn record(&self, hit: bool) {
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Allocate an empty buffer with capacity `n`, reusing a cached one
    /// when available.
    pub fn alloc_f16(&self, n: usize) -> Vec<half::f16> {
        match self.pool_f16.take(n) {
            Some(buf) => {
                self.record(true);
                buf
            }
            None => {
                self.record(false);
                Vec::with_capacity(n)
            }
        }
    }

    pub fn alloc_f32(&self, n: usize) -> Vec<f32> {
        match self.pool_f32.take(n) {
            Some(buf) => {
                self.record(true);
                buf
            }
            None => {
                self.record(false);
                Vec::with_capacity(n)
            }
        }
    }

    pub fn alloc_f64(&self, n: usize) -> Vec<f64> {
        match self.pool_f64.take(n) {
            Some(buf) => {
                self.record(true);
                buf
            }
            None => {
                self.record(false);
                Vec::with_capacity(n)
            }
        }
    }

    pub fn alloc_u8(&self, n: usize) -> Vec<u8> {
        match self.pool_u8.take(n) {
            Some(buf) => {
                self.record(true);
                buf
            }
            None => {
                self.record(false);
                Vec::with_capacity(n)
            }
        }
    }

    pub fn alloc_i64(&self, n: usize) -> Vec<i64> {
        match self.pool_i64.take(n) {
            Some(buf) => {
                self.record(true);
                buf
            }
            None => {
                self.record(false);
                Vec::with_capacity(n)
            }
        }
    }

    /// Park a released storage buffer for reuse.
    pub fn reclaim(&self, storage: CpuStorage) {
        match storage {
            CpuStorage::F16(v) => self.pool_f16.put(v),
            CpuStorage::F32(v) => self.pool_f32.put(v),
            CpuStorage::F64(v) => self.pool_f64.put(v),
            CpuStorage::U8(v) => self.pool_u8.put(v),
            CpuStorage::I64(v) => self.pool_i64.put(v),
        }
    }

    pub fn stats(&self) -> PoolStats {
        let (c16, e16) = self.pool_f16.stats();
        let (c32, e32) = self.pool_f32.stats();
        let (c64, e64) = self.pool_f64.stats();
        let (cu8, eu8) = self.pool_u8.stats();
        let (ci64, ei64) = self.pool_i64.stats();
        PoolStats {
            cached_buffers: c16 + c32 + c64 + cu8 + ci64,
            cached_bytes: e16 * 2 + e32 * 4 + e64 * 8 + eu8 + ei64 * 8,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Release every cached buffer back to the system allocator.
    pub fn empty_cache(&self) {
        self.pool_f16.drain();
        self.pool_f32.drain();
        self.pool_f64.drain();
        self.pool_u8.drain();
        self.pool_i64.drain();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuse_hits_the_cache() {
        let pool = CpuMemPool::new();
        let mut buf = pool.alloc_f32(128);
        buf.resize(128, 0.0);
        pool.reclaim(CpuStorage::F32(buf));

        let again = pool.alloc_f32(128);
        assert_eq!(again.capacity(), 128);
        let stats = pool.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.cached_buffers, 0);
    }

    #[test]
    fn empty_cache_drops_buffers() {
        let pool = CpuMemPool::new();
        pool.reclaim(CpuStorage::F64(vec![0.0; 64]));
        assert_eq!(pool.stats().cached_buffers, 1);
        assert_eq!(pool.stats().cached_bytes, 64 * 8);
        pool.empty_cache();
        assert_eq!(pool.stats().cached_buffers, 0);
    }

    #[test]
    fn distinct_sizes_use_distinct_buckets() {
        let pool = CpuMemPool::new();
        pool.reclaim(CpuStorage::F32(vec![0.0; 8]));
        assert!(pool.alloc_f32(16).capacity() >= 16);
        // The size-8 buffer must still be cached.
        assert_eq!(pool.stats().cached_buffers, 1);
    }
}
