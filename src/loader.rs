//! Guest image loading.
//!
//! ELF executables are loaded segment by segment through the bounds
//! checked memory contract; anything without an ELF magic is treated as a
//! raw binary placed at address 0. Container/disc parsing lives outside
//! the core and hands us plain bytes.

use crate::memory::{Memory, MemoryError};
use goblin::elf::{Elf, program_header::PT_LOAD};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to parse ELF image: {0}")]
    Elf(#[from] goblin::error::Error),
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error("ELF segment file range out of bounds")]
    SegmentRange,
}

/// Where a raw (non-ELF) image lands.
pub const RAW_IMAGE_BASE: u32 = 0;

#[derive(Debug, Clone, Copy)]
pub struct LoadedImage {
    pub entry_pc: u32,
    pub gp: u32,
}

pub fn load_image(memory: &mut Memory, image: &[u8]) -> Result<LoadedImage, LoadError> {
    if image.starts_with(b"\x7fELF") {
        load_elf(memory, image)
    } else {
        memory.write_bytes(RAW_IMAGE_BASE, image)?;
        log::info!("loaded raw image: {} bytes at {RAW_IMAGE_BASE:#010x}", image.len());
        Ok(LoadedImage {
            entry_pc: RAW_IMAGE_BASE,
            gp: 0,
        })
    }
}

fn load_elf(memory: &mut Memory, image: &[u8]) -> Result<LoadedImage, LoadError> {
    let elf = Elf::parse(image)?;

    for ph in &elf.program_headers {
        if ph.p_type != PT_LOAD {
            continue;
        }

        let start = ph.p_offset as usize;
        let size = ph.p_filesz as usize;
        let end = start.checked_add(size).ok_or(LoadError::SegmentRange)?;
        if end > image.len() {
            return Err(LoadError::SegmentRange);
        }

        let load_addr = if ph.p_paddr != 0 {
            ph.p_paddr
        } else {
            ph.p_vaddr
        } as u32;

        if size > 0 {
            memory.write_bytes(load_addr, &image[start..end])?;
        }
        if ph.p_memsz > ph.p_filesz {
            let zero_base = load_addr.wrapping_add(ph.p_filesz as u32);
            memory.fill(zero_base, 0, (ph.p_memsz - ph.p_filesz) as usize)?;
        }
    }

    log::info!("loaded ELF image, entry {:#010x}", elf.entry);
    Ok(LoadedImage {
        entry_pc: elf.entry as u32,
        gp: 0,
    })
}
