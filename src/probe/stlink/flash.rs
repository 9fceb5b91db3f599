//! Flash controller sequences, driven over the debug port.
//!
//! Three controller generations are supported: the F0/F1/F3 FPEC with its
//! address-based page erase and half-word programming, the F2/F4/F7
//! controller with numbered sectors and word programming, and the L4
//! controller with numbered pages and double-word programming. Programming
//! assumes a 3.3 V supply (x32 parallelism on the sector controllers).

use std::time::{Duration, Instant};

use super::StLinkProbe;
use crate::chip::{self, FlashType};
use crate::probe::{ProbeDriver, ProbeError};

const FLASH_KEY1: u32 = 0x4567_0123;
const FLASH_KEY2: u32 = 0xcdef_89ab;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

// F0/F1/F3 FPEC register bank.
mod f1 {
    pub const KEYR: u32 = 0x4002_2004;
    pub const SR: u32 = 0x4002_200c;
    pub const CR: u32 = 0x4002_2010;
    pub const AR: u32 = 0x4002_2014;

    pub const CR_PG: u32 = 1 << 0;
    pub const CR_PER: u32 = 1 << 1;
    pub const CR_STRT: u32 = 1 << 6;
    pub const CR_LOCK: u32 = 1 << 7;

    pub const SR_BSY: u32 = 1 << 0;
    pub const SR_PGERR: u32 = 1 << 2;
    pub const SR_WRPRTERR: u32 = 1 << 4;
}

// F2/F4/F7 controller.
mod f4 {
    pub const KEYR: u32 = 0x4002_3c04;
    pub const SR: u32 = 0x4002_3c0c;
    pub const CR: u32 = 0x4002_3c10;

    pub const CR_PG: u32 = 1 << 0;
    pub const CR_SER: u32 = 1 << 1;
    pub const CR_SNB_SHIFT: u32 = 3;
    /// x32 program parallelism.
    pub const CR_PSIZE_X32: u32 = 0b10 << 8;
    pub const CR_STRT: u32 = 1 << 16;
    pub const CR_LOCK: u32 = 1 << 31;

    pub const SR_BSY: u32 = 1 << 16;
    pub const SR_ERRORS: u32 = 0xf2;
}

// L4 controller.
mod l4 {
    pub const KEYR: u32 = 0x4002_2008;
    pub const SR: u32 = 0x4002_2010;
    pub const CR: u32 = 0x4002_2014;

    pub const CR_PG: u32 = 1 << 0;
    pub const CR_PER: u32 = 1 << 1;
    pub const CR_PNB_SHIFT: u32 = 3;
    pub const CR_STRT: u32 = 1 << 16;
    pub const CR_LOCK: u32 = 1 << 31;

    pub const SR_BSY: u32 = 1 << 16;
    pub const SR_ERRORS: u32 = 0xc3fa;
}

fn wait_not_busy(probe: &mut StLinkProbe, sr: u32, busy: u32) -> Result<u32, ProbeError> {
    let start = Instant::now();
    loop {
        let status = probe.read_debug32(sr)?;
        if status & busy == 0 {
            return Ok(status);
        }
        if start.elapsed() > BUSY_TIMEOUT {
            return Err(ProbeError::Timeout("flash operation"));
        }
    }
}

fn unlock(probe: &mut StLinkProbe, cr: u32, keyr: u32, lock: u32) -> Result<(), ProbeError> {
    if probe.read_debug32(cr)? & lock != 0 {
        probe.write_debug32(keyr, FLASH_KEY1)?;
        probe.write_debug32(keyr, FLASH_KEY2)?;
    }
    if probe.read_debug32(cr)? & lock != 0 {
        return Err(ProbeError::UnsupportedOperation("flash stays locked"));
    }
    Ok(())
}

pub(super) fn erase_page(probe: &mut StLinkProbe, addr: u32) -> Result<(), ProbeError> {
    tracing::debug!("erasing flash page at {:#010x}", addr);
    match probe.params.flash_type {
        FlashType::PageErase => {
            unlock(probe, f1::CR, f1::KEYR, f1::CR_LOCK)?;
            probe.write_debug32(f1::CR, f1::CR_PER)?;
            probe.write_debug32(f1::AR, addr)?;
            probe.write_debug32(f1::CR, f1::CR_PER | f1::CR_STRT)?;
            let status = wait_not_busy(probe, f1::SR, f1::SR_BSY)?;
            probe.write_debug32(f1::CR, 0)?;
            if status & (f1::SR_PGERR | f1::SR_WRPRTERR) != 0 {
                return Err(ProbeError::TargetFault(addr));
            }
            Ok(())
        }
        FlashType::SectorErase => {
            let sector = chip::sector_at(probe.params, addr);
            unlock(probe, f4::CR, f4::KEYR, f4::CR_LOCK)?;
            let select = f4::CR_SER | (sector << f4::CR_SNB_SHIFT) | f4::CR_PSIZE_X32;
            probe.write_debug32(f4::CR, select)?;
            probe.write_debug32(f4::CR, select | f4::CR_STRT)?;
            let status = wait_not_busy(probe, f4::SR, f4::SR_BSY)?;
            probe.write_debug32(f4::CR, 0)?;
            if status & f4::SR_ERRORS != 0 {
                // Error flags are write-one-to-clear.
                probe.write_debug32(f4::SR, status & f4::SR_ERRORS)?;
                return Err(ProbeError::TargetFault(addr));
            }
            Ok(())
        }
        FlashType::PageNumberErase => {
            let page = chip::sector_at(probe.params, addr);
            unlock(probe, l4::CR, l4::KEYR, l4::CR_LOCK)?;
            let select = l4::CR_PER | (page << l4::CR_PNB_SHIFT);
            probe.write_debug32(l4::CR, select)?;
            probe.write_debug32(l4::CR, select | l4::CR_STRT)?;
            let status = wait_not_busy(probe, l4::SR, l4::SR_BSY)?;
            probe.write_debug32(l4::CR, 0)?;
            if status & l4::SR_ERRORS != 0 {
                probe.write_debug32(l4::SR, status & l4::SR_ERRORS)?;
                return Err(ProbeError::TargetFault(addr));
            }
            Ok(())
        }
        FlashType::Unsupported => Err(ProbeError::UnsupportedOperation(
            "flash erase is not implemented for this family",
        )),
    }
}

/// Puts the controller into programming mode.
pub(super) fn program_start(probe: &mut StLinkProbe) -> Result<(), ProbeError> {
    match probe.params.flash_type {
        FlashType::PageErase => {
            unlock(probe, f1::CR, f1::KEYR, f1::CR_LOCK)?;
            probe.write_debug32(f1::CR, f1::CR_PG)
        }
        FlashType::SectorErase => {
            unlock(probe, f4::CR, f4::KEYR, f4::CR_LOCK)?;
            probe.write_debug32(f4::CR, f4::CR_PG | f4::CR_PSIZE_X32)
        }
        FlashType::PageNumberErase => {
            unlock(probe, l4::CR, l4::KEYR, l4::CR_LOCK)?;
            probe.write_debug32(l4::CR, l4::CR_PG)
        }
        FlashType::Unsupported => Err(ProbeError::UnsupportedOperation(
            "flash programming is not implemented for this family",
        )),
    }
}

/// Streams one page (or less) into programming-mode flash. Write
/// granularity follows the controller: half-words, words or double-words.
pub(super) fn program_write(
    probe: &mut StLinkProbe,
    addr: u32,
    data: &[u8],
) -> Result<(), ProbeError> {
    match probe.params.flash_type {
        FlashType::PageErase => {
            let mut even;
            let data = if data.len() % 2 != 0 {
                even = data.to_vec();
                even.push(probe.erased_pattern());
                &even[..]
            } else {
                data
            };
            probe.write_mem16(addr, data)?;
            let status = wait_not_busy(probe, f1::SR, f1::SR_BSY)?;
            if status & (f1::SR_PGERR | f1::SR_WRPRTERR) != 0 {
                return Err(ProbeError::TargetFault(addr));
            }
            Ok(())
        }
        FlashType::SectorErase => {
            let data = pad_to(data, 4, probe.erased_pattern());
            probe.write_mem32(addr, &data)?;
            let status = wait_not_busy(probe, f4::SR, f4::SR_BSY)?;
            if status & f4::SR_ERRORS != 0 {
                probe.write_debug32(f4::SR, status & f4::SR_ERRORS)?;
                return Err(ProbeError::TargetFault(addr));
            }
            Ok(())
        }
        FlashType::PageNumberErase => {
            let data = pad_to(data, 8, probe.erased_pattern());
            probe.write_mem32(addr, &data)?;
            let status = wait_not_busy(probe, l4::SR, l4::SR_BSY)?;
            if status & l4::SR_ERRORS != 0 {
                probe.write_debug32(l4::SR, status & l4::SR_ERRORS)?;
                return Err(ProbeError::TargetFault(addr));
            }
            Ok(())
        }
        FlashType::Unsupported => Err(ProbeError::UnsupportedOperation(
            "flash programming is not implemented for this family",
        )),
    }
}

/// Leaves programming mode and relocks the controller.
pub(super) fn program_stop(probe: &mut StLinkProbe) -> Result<(), ProbeError> {
    match probe.params.flash_type {
        FlashType::PageErase => {
            probe.write_debug32(f1::CR, f1::CR_LOCK)?;
            Ok(())
        }
        FlashType::SectorErase => {
            probe.write_debug32(f4::CR, f4::CR_LOCK)?;
            Ok(())
        }
        FlashType::PageNumberErase => {
            probe.write_debug32(l4::CR, l4::CR_LOCK)?;
            Ok(())
        }
        FlashType::Unsupported => Ok(()),
    }
}

fn pad_to(data: &[u8], granule: usize, pattern: u8) -> Vec<u8> {
    let mut out = data.to_vec();
    while out.len() % granule != 0 {
        out.push(pattern);
    }
    out
}
