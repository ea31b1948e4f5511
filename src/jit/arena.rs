//! Executable-memory arena.
//!
//! One large read/write/execute region reserved at startup, handed out by
//! bumping a 16-byte-aligned cursor. Freed space is never reused until an
//! explicit [`reset`](CodeArena::reset), which bumps the generation
//! counter: every pointer handed out before the reset is invalid from
//! then on, and callers must not invoke code through it.
//!
//! This is the only module that touches raw executable memory; everything
//! else goes through [`commit`](CodeArena::commit).

use thiserror::Error;

/// Alignment of every allocation.
pub const ARENA_ALIGN: usize = 16;

#[derive(Debug, Error)]
pub enum JitError {
    #[error("executable memory reservation of {size} bytes failed: {source}")]
    Reserve {
        size: usize,
        source: std::io::Error,
    },
    #[error("code arena exhausted: requested {requested} bytes, {remaining} free")]
    Exhausted { requested: usize, remaining: usize },
    #[error("native code generation is not supported on this host")]
    HostUnsupported,
}

pub struct CodeArena {
    base: *mut u8,
    capacity: usize,
    cursor: usize,
    generation: u32,
}

impl CodeArena {
    /// Reserve `capacity` bytes of RWX host memory.
    #[cfg(unix)]
    pub fn new(capacity: usize) -> Result<Self, JitError> {
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                capacity,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(JitError::Reserve {
                size: capacity,
                source: std::io::Error::last_os_error(),
            });
        }
        log::info!("reserved {capacity} bytes of executable memory");
        Ok(Self {
            base: base as *mut u8,
            capacity,
            cursor: 0,
            generation: 0,
        })
    }

    #[cfg(not(unix))]
    pub fn new(_capacity: usize) -> Result<Self, JitError> {
        Err(JitError::HostUnsupported)
    }

    /// Bump-allocate `size` bytes, 16-byte aligned. Fails when the region
    /// is exhausted; never wraps or reuses space.
    pub fn allocate(&mut self, size: usize) -> Result<*mut u8, JitError> {
        let aligned = (self.cursor + ARENA_ALIGN - 1) & !(ARENA_ALIGN - 1);
        let end = aligned.checked_add(size);
        match end {
            Some(end) if end <= self.capacity => {
                // SAFETY: aligned + size <= capacity, inside the mapping.
                let ptr = unsafe { self.base.add(aligned) };
                self.cursor = end;
                Ok(ptr)
            }
            _ => Err(JitError::Exhausted {
                requested: size,
                remaining: self.capacity.saturating_sub(aligned.min(self.capacity)),
            }),
        }
    }

    /// Allocate and copy `code` into the region, returning the start of
    /// the committed bytes.
    pub fn commit(&mut self, code: &[u8]) -> Result<*const u8, JitError> {
        let dest = self.allocate(code.len())?;
        // SAFETY: dest points at code.len() freshly allocated bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), dest, code.len());
        }
        Ok(dest as *const u8)
    }

    /// Drop everything. Outstanding pointers belong to the previous
    /// generation and must not be invoked again.
    pub fn reset(&mut self) {
        self.cursor = 0;
        self.generation = self.generation.wrapping_add(1);
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn used(&self) -> usize {
        self.cursor
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.cursor
    }
}

#[cfg(unix)]
impl Drop for CodeArena {
    fn drop(&mut self) {
        // SAFETY: base/capacity describe the mapping created in new().
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.capacity);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_allocations_are_aligned_and_disjoint() {
        let mut arena = CodeArena::new(4096).unwrap();

        let a = arena.allocate(10).unwrap() as usize;
        let b = arena.allocate(10).unwrap() as usize;
        let c = arena.allocate(100).unwrap() as usize;

        assert_eq!(a % ARENA_ALIGN, 0);
        assert_eq!(b % ARENA_ALIGN, 0);
        assert_eq!(c % ARENA_ALIGN, 0);
        assert!(a + 10 <= b);
        assert!(b + 10 <= c);
    }

    #[test]
    fn test_exhaustion_fails_without_wrapping() {
        let mut arena = CodeArena::new(64).unwrap();
        arena.allocate(48).unwrap();

        let err = arena.allocate(32).unwrap_err();
        assert!(matches!(
            err,
            JitError::Exhausted {
                requested: 32,
                remaining: 16
            }
        ));
        // The failed allocation must not have moved the cursor.
        assert_eq!(arena.used(), 48);
        assert!(arena.allocate(16).is_ok());
    }

    #[test]
    fn test_reset_bumps_generation() {
        let mut arena = CodeArena::new(256).unwrap();
        let first = arena.allocate(32).unwrap();
        assert_eq!(arena.generation(), 0);

        arena.reset();

        assert_eq!(arena.generation(), 1);
        assert_eq!(arena.used(), 0);
        // Space is reused only after the reset.
        let again = arena.allocate(32).unwrap();
        assert_eq!(first, again);
    }

    #[test]
    fn test_commit_copies_bytes() {
        let mut arena = CodeArena::new(256).unwrap();
        let code = [0x90u8, 0x90, 0xC3];
        let ptr = arena.commit(&code).unwrap();

        // SAFETY: ptr points at 3 committed bytes.
        let stored = unsafe { std::slice::from_raw_parts(ptr, 3) };
        assert_eq!(stored, &code);
    }

    #[test]
    fn test_oversized_commit_fails() {
        let mut arena = CodeArena::new(32).unwrap();
        assert!(arena.commit(&[0u8; 64]).is_err());
    }
}
