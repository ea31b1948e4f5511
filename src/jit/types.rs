//! Configuration and statistics for the translation engine.

use super::cache::CacheStats;

/// Tunables for the translation engine. All limits are hard limits.
#[derive(Debug, Clone)]
pub struct JitConfig {
    /// Enable dynamic translation at all.
    pub enabled: bool,
    /// Maximum guest instructions per compiled block. Bounds compile time
    /// and guarantees every block terminates.
    pub max_block_instructions: usize,
    /// Size of the reserved executable region.
    pub arena_size: usize,
    /// Maximum blocks held in the cache.
    pub max_cache_entries: usize,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            // Native code generation targets x86-64 and the arena needs
            // mmap; everywhere else the interpreter runs alone.
            enabled: cfg!(all(unix, target_arch = "x86_64")),
            max_block_instructions: 64,
            arena_size: 8 * 1024 * 1024,
            max_cache_entries: 1024,
        }
    }
}

/// Compiler-level counters.
#[derive(Debug, Clone, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JitStats {
    /// Blocks successfully compiled and inserted.
    pub blocks_compiled: u64,
    /// Whole-arena flushes (arena reset + cache clear).
    pub flushes: u64,
    /// Windows rejected because nothing in them could be compiled.
    pub unsuitable_windows: u64,
}

/// Snapshot of the engine's health, serializable for the CLI.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JitDiagnostics {
    pub enabled: bool,
    pub cache_entries: usize,
    pub arena_used: usize,
    pub arena_capacity: usize,
    pub arena_generation: u32,
    pub stats: JitStats,
    pub cache_stats: CacheStats,
}
