//! Hardware breakpoint management through the Flash Patch and Breakpoint
//! unit.
//!
//! FPB revision 1 comparators match a word address and select which
//! half-word of it breaks, so two Thumb breakpoints in the same word share a
//! comparator. Revision 2 comparators match the literal address.

use thiserror::Error;

use crate::probe::{ProbeDriver, ProbeError};
use crate::target::registers::{
    cpuid_partno, fp_comp, FpCtrl, CPUID, CPUID_PARTNO_CM7, FP_CTRL, FP_CTRL_ENABLE, FP_LAR,
    FP_LAR_KEY,
};

const CODE_BREAK_MAX: usize = 15;

/// Slot type bits: which half of a rev-1 word is matched, or the rev-2
/// literal mapping. A slot with no bits set is free.
const CODE_BREAK_LOW: u8 = 0x01;
const CODE_BREAK_HIGH: u8 = 0x02;
const CODE_BREAK_REMAP: u8 = 0x04;

#[derive(Error, Debug)]
pub enum BreakpointError {
    #[error("breakpoint address {0:#010x} is not half-word aligned")]
    UnalignedAddress(u32),
    #[error("all {0} comparators in use")]
    NoFreeComparator(usize),
    #[error(transparent)]
    Probe(#[from] ProbeError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FpbRev {
    Rev1,
    Rev2,
}

#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    addr: u32,
    ty: u8,
}

#[derive(Debug)]
pub struct BreakpointUnit {
    rev: FpbRev,
    num_code: usize,
    num_lit: usize,
    slots: [Slot; CODE_BREAK_MAX],
}

impl BreakpointUnit {
    /// Enables the FPB, reads its geometry and clears every comparator.
    /// Called at session start and again after any reset, since the
    /// hardware state does not survive one.
    pub fn init(probe: &mut dyn ProbeDriver) -> Result<Self, ProbeError> {
        probe.write_debug32(FP_CTRL, FP_CTRL_ENABLE)?;
        let ctrl = FpCtrl::from(probe.read_debug32(FP_CTRL)?);

        let num_code = ctrl.num_code() as usize;
        let num_lit = ctrl.num_lit() as usize;
        let rev = if ctrl.rev() == 0 {
            FpbRev::Rev1
        } else {
            FpbRev::Rev2
        };

        tracing::info!("found {} hw breakpoint comparators", num_code);

        // Cortex-M7 parts power up with the FP_* bank write-locked.
        let cpuid = probe.read_debug32(CPUID)?;
        if cpuid_partno(cpuid) == CPUID_PARTNO_CM7 {
            probe.write_debug32(FP_LAR, FP_LAR_KEY)?;
        }

        let unit = Self {
            rev,
            num_code,
            num_lit,
            slots: [Slot::default(); CODE_BREAK_MAX],
        };
        for index in 0..unit.num_code {
            probe.write_debug32(fp_comp(index), 0)?;
        }
        Ok(unit)
    }

    pub fn insert(
        &mut self,
        probe: &mut dyn ProbeDriver,
        addr: u32,
    ) -> Result<(), BreakpointError> {
        self.update(probe, addr, true)
    }

    /// Removing a breakpoint that is not set is not an error; GDB retries
    /// removals freely.
    pub fn remove(
        &mut self,
        probe: &mut dyn ProbeDriver,
        addr: u32,
    ) -> Result<(), BreakpointError> {
        self.update(probe, addr, false)
    }

    /// Whether any comparator slot matches the encoded address. Used by the
    /// continue loop to tell a user breakpoint from a semihosting trap.
    pub fn contains(&self, addr: u32) -> bool {
        self.slots[..self.num_code].iter().any(|s| s.addr == addr)
    }

    fn update(
        &mut self,
        probe: &mut dyn ProbeDriver,
        addr: u32,
        set: bool,
    ) -> Result<(), BreakpointError> {
        if addr & 1 != 0 {
            tracing::error!("unaligned breakpoint address {:08x}", addr);
            return Err(BreakpointError::UnalignedAddress(addr));
        }

        let (ty, fpb_addr) = match self.rev {
            FpbRev::Rev1 => {
                let ty = if addr & 0x2 != 0 {
                    CODE_BREAK_HIGH
                } else {
                    CODE_BREAK_LOW
                };
                (ty, addr & 0x1FFF_FFFC)
            }
            FpbRev::Rev2 => (CODE_BREAK_REMAP, addr),
        };

        // Prefer a slot already holding this word so the two halves pair up;
        // otherwise grab the first free one.
        let slot_index = (0..self.num_code)
            .find(|&i| self.slots[i].addr == fpb_addr || (set && self.slots[i].ty == 0));

        let Some(index) = slot_index else {
            if set {
                return Err(BreakpointError::NoFreeComparator(self.num_code));
            }
            return Ok(());
        };

        let slot = &mut self.slots[index];
        slot.addr = fpb_addr;
        if set {
            slot.ty |= ty;
        } else {
            slot.ty &= !ty;
        }

        if slot.ty == 0 {
            tracing::debug!("clearing hw break {}", index);
            probe.write_debug32(fp_comp(index), 0)?;
        } else {
            // DDI0403E p. 759, FP_COMPn register description.
            let value = ((u32::from(slot.ty) & 0x3) << 30) | slot.addr | 1;
            tracing::debug!(
                "setting hw break {} at {:08x} ({})",
                index,
                slot.addr,
                slot.ty
            );
            probe.write_debug32(fp_comp(index), value)?;
        }

        Ok(())
    }

    #[cfg(test)]
    fn slot(&self, index: usize) -> (u32, u8) {
        (self.slots[index].addr, self.slots[index].ty)
    }
}
