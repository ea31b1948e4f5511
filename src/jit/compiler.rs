//! Block compiler.
//!
//! Orchestrates one translation: look up the entry PC in the cache; on a
//! miss, decode a bounded instruction window, drive the emitter, commit
//! the bytes into the arena and insert the wrapped block into the cache.
//!
//! Window policy, applied consistently:
//! - the window is capped at [`JitConfig::max_block_instructions`],
//! - SYSCALL/BREAK are compiled (as trap-bridge calls) and terminate the
//!   window,
//! - branches, jumps, register-indirect returns and anything the emitter
//!   cannot translate truncate the window *before* themselves — the
//!   interpreter runs them,
//! - an empty window is unsuitable; its PC is blacklisted so dispatch
//!   stops retrying it.
//!
//! Arena exhaustion is recovered by flushing: the arena is reset and the
//! cache cleared, since every cached block belongs to the old generation.

use super::arena::{CodeArena, JitError};
use super::block::{BlockFn, JitBlock};
use super::cache::BlockCache;
use super::emitter::Emitter;
use super::types::{JitConfig, JitDiagnostics, JitStats};
use crate::cpu::CpuState;
use crate::decoder::{Decoder, Op};
use crate::memory::Memory;

/// A dispatchable entry point for a compiled block.
///
/// Valid only until the next `compile`/`flush` call: a flush between
/// obtaining and invoking an entry would leave it pointing into a dead
/// arena generation. The execution loop invokes entries immediately.
#[derive(Clone, Copy)]
pub struct BlockEntry {
    code: BlockFn,
    pub entry_pc: u32,
}

impl BlockEntry {
    /// Run the block against the borrowed state.
    pub fn invoke(&self, state: &mut CpuState) {
        // SAFETY: the compiler only hands out entries from the live
        // arena generation, and the block borrows `state` exclusively
        // for the duration of this call.
        unsafe { (self.code)(state) }
    }
}

struct BuiltBlock {
    code: Vec<u8>,
    end_pc: u32,
    instructions: u32,
}

pub struct JitCompiler {
    config: JitConfig,
    decoder: Decoder,
    arena: CodeArena,
    cache: BlockCache,
    stats: JitStats,
}

impl JitCompiler {
    pub fn new(config: JitConfig) -> Result<Self, JitError> {
        let arena = CodeArena::new(config.arena_size)?;
        let cache = BlockCache::new(config.max_cache_entries);
        Ok(Self {
            config,
            decoder: Decoder::new(),
            arena,
            cache,
            stats: JitStats::default(),
        })
    }

    /// Return a usable entry for `pc`: the cached block on a hit,
    /// otherwise a freshly compiled one. `None` means the window cannot
    /// be translated and the caller must interpret.
    pub fn compile(&mut self, pc: u32, memory: &Memory) -> Option<BlockEntry> {
        if let Some(block) = self.cache.get(pc) {
            return Some(BlockEntry {
                code: block.entry(),
                entry_pc: pc,
            });
        }
        if self.cache.is_blacklisted(pc) {
            return None;
        }

        let built = match self.build_window(pc, memory) {
            Some(built) => built,
            None => {
                self.stats.unsuitable_windows += 1;
                self.cache.blacklist(pc);
                log::debug!("window at {pc:#010x} is unsuitable for translation");
                return None;
            }
        };

        let code_ptr = match self.arena.commit(&built.code) {
            Ok(ptr) => ptr,
            Err(err @ JitError::Exhausted { .. }) => {
                log::warn!("{err}; flushing code arena");
                self.flush();
                match self.arena.commit(&built.code) {
                    Ok(ptr) => ptr,
                    Err(err) => {
                        log::error!("block at {pc:#010x} does not fit an empty arena: {err}");
                        self.cache.blacklist(pc);
                        return None;
                    }
                }
            }
            Err(err) => {
                log::error!("code commit failed: {err}");
                return None;
            }
        };

        let block = JitBlock::new(
            pc,
            built.end_pc,
            code_ptr,
            built.code.len(),
            built.instructions,
            self.arena.generation(),
        );
        let entry = BlockEntry {
            code: block.entry(),
            entry_pc: pc,
        };
        log::debug!(
            "compiled {pc:#010x}..{:#010x}: {} guest instructions, {} host bytes",
            built.end_pc,
            built.instructions,
            built.code.len()
        );
        self.cache.insert(pc, block);
        self.stats.blocks_compiled += 1;
        Some(entry)
    }

    fn build_window(&self, entry_pc: u32, memory: &Memory) -> Option<BuiltBlock> {
        let mut emitter = Emitter::new();
        let mut pc = entry_pc;
        let mut count: u32 = 0;
        let mut trapped = false;

        while (count as usize) < self.config.max_block_instructions {
            let word = match memory.read32(pc) {
                Ok(word) => word,
                Err(_) => break,
            };
            let d = self.decoder.decode(pc, word);

            // Control flow (and its delay slot) stays with the
            // interpreter.
            if d.is_branch() {
                break;
            }
            if !emitter.translate(&d) {
                break;
            }
            count += 1;
            pc = pc.wrapping_add(4);
            if matches!(d.op, Op::Syscall | Op::Break) {
                trapped = true;
                break;
            }
        }

        if count == 0 {
            return None;
        }
        if !trapped {
            emitter.finish_fallthrough(pc);
        }
        Some(BuiltBlock {
            code: emitter.finish(),
            end_pc: pc,
            instructions: count,
        })
    }

    /// Invalidate any compiled block covering a written guest address.
    pub fn invalidate_write(&mut self, addr: u32) {
        self.cache.invalidate_write(addr);
    }

    /// Reset the arena and drop every cached block with it.
    pub fn flush(&mut self) {
        self.arena.reset();
        self.cache.clear();
        self.stats.flushes += 1;
        log::info!(
            "code arena flushed; generation now {}",
            self.arena.generation()
        );
    }

    pub fn cache(&self) -> &BlockCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut BlockCache {
        &mut self.cache
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    pub fn stats(&self) -> &JitStats {
        &self.stats
    }

    pub fn arena_generation(&self) -> u32 {
        self.arena.generation()
    }

    pub fn diagnostics(&self) -> JitDiagnostics {
        JitDiagnostics {
            enabled: true,
            cache_entries: self.cache.entry_count(),
            arena_used: self.arena.used(),
            arena_capacity: self.arena.capacity(),
            arena_generation: self.arena.generation(),
            stats: self.stats.clone(),
            cache_stats: self.cache.stats().clone(),
        }
    }
}
