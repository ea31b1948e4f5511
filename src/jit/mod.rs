//! Dynamic translation engine.
//!
//! Hot guest code is translated, one basic block at a time, into native
//! host code living in a pre-reserved executable arena:
//!
//! 1. [`JitCompiler`] looks up the entry PC in the [`BlockCache`]; on a
//!    miss it decodes a bounded instruction window and drives the
//!    [`Emitter`].
//! 2. The emitted bytes are committed into the [`CodeArena`] and wrapped
//!    in a [`JitBlock`] owned by the cache.
//! 3. Generated code receives a borrowed `*mut CpuState` for the duration
//!    of one invocation and communicates back through exactly one
//!    channel: the trap bridge, which raises the exit-request flag.
//!
//! Block validity is tied to the arena generation: a `reset()` of the
//! arena invalidates every outstanding block, which is why the compiler
//! clears the cache whenever it flushes the arena.

pub mod arena;
pub mod block;
pub mod bridge;
pub mod cache;
pub mod compiler;
pub mod emitter;
pub mod types;

pub use arena::{CodeArena, JitError};
pub use block::{BlockFn, JitBlock};
pub use bridge::jit_trap_bridge;
pub use cache::{BlockCache, CacheStats};
pub use compiler::{BlockEntry, JitCompiler};
pub use emitter::Emitter;
pub use types::{JitConfig, JitDiagnostics, JitStats};
