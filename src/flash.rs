//! Staging for GDB's `vFlashErase` / `vFlashWrite` / `vFlashDone` sequence.
//!
//! GDB announces the regions it will rewrite, streams data in arbitrary
//! chunks, then asks for the commit. Erase commands stage page-aligned
//! blocks prefilled with the device's erased pattern, writes land inside
//! them, and the commit performs one ordered erase-then-program pass
//! through the flash loader.

use thiserror::Error;

use crate::probe::{ConnectMode, ProbeDriver, ProbeError, ResetMode};

pub const FLASH_BASE: u32 = 0x0800_0000;

#[derive(Error, Debug)]
pub enum FlashError {
    #[error("block {addr:#010x}+{length:#x} outside device flash")]
    OutOfBounds { addr: u32, length: u32 },
    #[error("block {addr:#010x}+{length:#x} not aligned to the {page_size:#x} byte page")]
    UnalignedBlock {
        addr: u32,
        length: u32,
        page_size: u32,
    },
    #[error("write at {0:#010x} hits no erased block")]
    NoMatchingBlock(u32),
    #[error(transparent)]
    Probe(#[from] ProbeError),
}

#[derive(Debug)]
struct FlashBlock {
    addr: u32,
    data: Vec<u8>,
}

impl FlashBlock {
    fn end(&self) -> u32 {
        self.addr + self.data.len() as u32
    }
}

/// All blocks of one erase/write/done transaction. Dropped blocks never
/// outlive the transaction: `commit` consumes them, success or failure.
#[derive(Debug, Default)]
pub struct FlashStage {
    blocks: Vec<FlashBlock>,
}

impl FlashStage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages an erase region. The region must lie inside device flash and
    /// both ends must fall on page boundaries for the page size at `addr`.
    /// A zero-length erase is accepted and stages nothing.
    pub fn add_block(
        &mut self,
        probe: &mut dyn ProbeDriver,
        addr: u32,
        length: u32,
    ) -> Result<(), FlashError> {
        if length == 0 {
            return Ok(());
        }

        let flash_end = FLASH_BASE + probe.flash_size();
        let in_bounds = addr >= FLASH_BASE
            && addr
                .checked_add(length)
                .map(|end| end <= flash_end)
                .unwrap_or(false);
        if !in_bounds {
            tracing::error!("flash block {:08x}+{:x}: incorrect bounds", addr, length);
            return Err(FlashError::OutOfBounds { addr, length });
        }

        let page_size = probe.flash_pgsz(addr);
        if addr % page_size != 0 || length % page_size != 0 {
            tracing::error!("flash block {:08x}+{:x}: unaligned", addr, length);
            return Err(FlashError::UnalignedBlock {
                addr,
                length,
                page_size,
            });
        }

        self.blocks.push(FlashBlock {
            addr,
            data: vec![probe.erased_pattern(); length as usize],
        });
        Ok(())
    }

    /// Copies write data into every staged block it intersects. The data is
    /// padded to a half-word boundary first, as flash programming works on
    /// half-words at minimum.
    pub fn populate(&mut self, addr: u32, data: &[u8]) -> Result<(), FlashError> {
        let mut padded;
        let data = if data.len() % 2 != 0 {
            padded = data.to_vec();
            padded.push(0);
            &padded[..]
        } else {
            data
        };

        let length = data.len() as u32;
        let mut fit_blocks = 0u32;
        let mut fit_length = 0u32;

        for block in &mut self.blocks {
            // Half-open ranges [block.addr, block.end) and [addr, addr+length)
            // intersect iff each start lies before the other end.
            let (block_start, block_end) = (block.addr, block.end());
            let (data_start, data_end) = (addr, addr + length);

            if data_start < block_end && data_end > block_start {
                let start = data_start.max(block_start) - block_start;
                let end = data_end.min(block_end) - block_start;
                let source = (block_start + start - data_start) as usize;

                block.data[start as usize..end as usize]
                    .copy_from_slice(&data[source..source + (end - start) as usize]);

                fit_blocks += 1;
                fit_length += end - start;
            }
        }

        if fit_blocks == 0 {
            tracing::error!("unfit data block {:08x} -> {:04x}", addr, length);
            return Err(FlashError::NoMatchingBlock(addr));
        }

        if fit_length != length {
            tracing::warn!(
                "data block {:08x} -> {:04x} truncated to {:04x}",
                addr,
                length,
                fit_length
            );
            tracing::warn!("(this is not an error, just a GDB glitch)");
        }

        Ok(())
    }

    /// Erases and programs everything staged, then soft-resets the target
    /// halted. The staged blocks are always released, even if a probe call
    /// fails halfway through.
    pub fn commit(
        &mut self,
        probe: &mut dyn ProbeDriver,
        connect_mode: ConnectMode,
    ) -> Result<(), FlashError> {
        let result = Self::commit_blocks(&self.blocks, probe, connect_mode);
        self.blocks.clear();
        result
    }

    fn commit_blocks(
        blocks: &[FlashBlock],
        probe: &mut dyn ProbeDriver,
        connect_mode: ConnectMode,
    ) -> Result<(), FlashError> {
        probe.connect(connect_mode)?;
        probe.halt()?;

        for block in blocks {
            tracing::info!(
                "flash erase: block {:08x} -> {:04x}",
                block.addr,
                block.data.len()
            );

            let mut page = block.addr;
            while page < block.end() {
                // Page sizes vary inside one block on mixed-sector parts.
                let page_size = probe.flash_pgsz(page);
                tracing::info!("flash erase: page {:08x}", page);
                probe.erase_page(page)?;
                page += page_size;
            }
        }

        probe.flashloader_start()?;
        let loader: Result<(), FlashError> = (|| {
            for block in blocks {
                tracing::info!(
                    "flash write: block {:08x} -> {:04x}",
                    block.addr,
                    block.data.len()
                );

                let mut page = block.addr;
                while page < block.end() {
                    let page_size = probe.flash_pgsz(page);
                    let offset = (page - block.addr) as usize;
                    let remaining = block.data.len() - offset;
                    let chunk = remaining.min(page_size as usize);

                    tracing::info!("flash write: page {:08x}", page);
                    probe.flashloader_write(page, &block.data[offset..offset + chunk])?;
                    page += page_size;
                }
            }
            Ok(())
        })();
        probe.flashloader_stop()?;
        loader?;

        probe.reset(ResetMode::SoftAndHalt)?;
        Ok(())
    }
}
