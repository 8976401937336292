//! Per-image cache of materialized tiles.
//!
//! Entries are keyed by tile index and evicted least-recently-used first once
//! the total pixel payload exceeds the byte capacity.

use std::sync::atomic::{AtomicU64, Ordering};

use lru::LruCache;
use serde::Serialize;
use tokio::sync::Mutex;

use super::block::PixelBlock;

/// Default cache capacity: 64MB of decoded pixels per image
pub const DEFAULT_TILE_CACHE_BYTES: usize = 64 * 1024 * 1024;

/// Tile grid coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileIndex {
    pub x: u32,
    pub y: u32,
}

impl TileIndex {
    pub const fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: usize,
    pub capacity_bytes: usize,
    pub hits: u64,
    pub misses: u64,
}

struct State {
    entries: LruCache<TileIndex, PixelBlock>,
    bytes: usize,
}

/// LRU tile cache with a byte budget.
///
/// Thread-safe; a rendered image shares it between concurrent tile requests.
pub struct TileCache {
    state: Mutex<State>,
    max_bytes: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl TileCache {
    /// Create a cache holding at most `max_bytes` of pixel data.
    ///
    /// The entry count is bounded by the byte budget alone.
    pub fn new(max_bytes: usize) -> Self {
        Self {
            state: Mutex::new(State {
                entries: LruCache::unbounded(),
                bytes: 0,
            }),
            max_bytes,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Look up a tile, marking it recently used.
    pub async fn get(&self, index: TileIndex) -> Option<PixelBlock> {
        let mut state = self.state.lock().await;
        let found = state.entries.get(&index).cloned();
        drop(state);

        let counter = if found.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    /// Look up a tile without touching LRU order or counters.
    pub async fn peek(&self, index: TileIndex) -> Option<PixelBlock> {
        self.state.lock().await.entries.peek(&index).cloned()
    }

    /// Check for a tile without touching LRU order or counters.
    pub async fn contains(&self, index: TileIndex) -> bool {
        self.state.lock().await.entries.contains(&index)
    }

    /// Insert a tile, evicting least-recently-used tiles while over budget.
    ///
    /// A tile larger than the whole budget evicts everything, itself included.
    pub async fn put(&self, block: PixelBlock) {
        let index = TileIndex::new(block.tile_x, block.tile_y);
        let size = block.byte_len();

        let mut state = self.state.lock().await;

        if let Some((_, evicted)) = state.entries.push(index, block) {
            // `push` hands back either the replaced value or the LRU victim
            state.bytes = state.bytes.saturating_sub(evicted.byte_len());
        }
        state.bytes += size;

        while state.bytes > self.max_bytes {
            match state.entries.pop_lru() {
                Some((_, evicted)) => {
                    state.bytes = state.bytes.saturating_sub(evicted.byte_len());
                }
                None => break,
            }
        }
    }

    /// Drop every cached tile.
    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        state.entries.clear();
        state.bytes = 0;
    }

    /// Number of cached tiles.
    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Byte budget.
    pub fn capacity(&self) -> usize {
        self.max_bytes
    }

    pub async fn stats(&self) -> CacheStats {
        let state = self.state.lock().await;
        CacheStats {
            entries: state.entries.len(),
            bytes: state.bytes,
            capacity_bytes: self.max_bytes,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}
