//! Data watchpoints on the DWT comparator bank.

use thiserror::Error;

use crate::probe::{ProbeDriver, ProbeError};
use crate::target::registers::{dwt_comp, dwt_function, dwt_mask, DEMCR, DEMCR_TRCENA};

const DATA_WATCH_NUM: usize = 4;

/// DWT_FUNCTION values; anything else the hardware supports is not used
/// here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WatchFun {
    #[default]
    Disabled,
    Read,
    Write,
    Access,
}

impl WatchFun {
    fn function_bits(self) -> u32 {
        match self {
            WatchFun::Disabled => 0,
            WatchFun::Read => 5,
            WatchFun::Write => 6,
            WatchFun::Access => 7,
        }
    }
}

#[derive(Error, Debug)]
pub enum WatchpointError {
    #[error("cannot cover {0} bytes with an address mask")]
    InvalidLength(u32),
    #[error("all {DATA_WATCH_NUM} comparators in use")]
    NoFreeComparator,
    #[error("no watchpoint at {0:#010x}")]
    NotFound(u32),
    #[error(transparent)]
    Probe(#[from] ProbeError),
}

#[derive(Debug, Clone, Copy, Default)]
struct Watchpoint {
    addr: u32,
    mask: u8,
    fun: WatchFun,
}

#[derive(Debug)]
pub struct WatchpointUnit {
    slots: [Watchpoint; DATA_WATCH_NUM],
}

/// Smallest `r` such that `value <= (1 << r)`.
pub(crate) fn ceil_log2(value: u32) -> u32 {
    let mut result = 0;
    while (1u64 << result) < u64::from(value) {
        result += 1;
    }
    result
}

impl WatchpointUnit {
    /// Turns on the DWT through DEMCR.TRCENA and disables every comparator.
    pub fn init(probe: &mut dyn ProbeDriver) -> Result<Self, ProbeError> {
        tracing::debug!("init watchpoints");

        let demcr = probe.read_debug32(DEMCR)?;
        probe.write_debug32(DEMCR, demcr | DEMCR_TRCENA)?;

        for index in 0..DATA_WATCH_NUM {
            probe.write_debug32(dwt_function(index), 0)?;
        }
        Ok(Self {
            slots: [Watchpoint::default(); DATA_WATCH_NUM],
        })
    }

    pub fn add(
        &mut self,
        probe: &mut dyn ProbeDriver,
        fun: WatchFun,
        addr: u32,
        length: u32,
    ) -> Result<(), WatchpointError> {
        let mask = ceil_log2(length);
        if length == 0 || mask >= 16 {
            tracing::debug!("failure: add watchpoint addr {:x} len {}", addr, length);
            return Err(WatchpointError::InvalidLength(length));
        }

        let Some(index) = self
            .slots
            .iter()
            .position(|slot| slot.fun == WatchFun::Disabled)
        else {
            tracing::debug!("failure: no free watchpoint for addr {:x}", addr);
            return Err(WatchpointError::NoFreeComparator);
        };

        tracing::debug!(
            "insert watchpoint {} addr {:x} fun {:?} mask {} len {}",
            index,
            addr,
            fun,
            mask,
            length
        );

        self.slots[index] = Watchpoint {
            addr,
            mask: mask as u8,
            fun,
        };

        probe.write_debug32(dwt_comp(index), addr)?;
        probe.write_debug32(dwt_mask(index), mask)?;
        probe.write_debug32(dwt_function(index), fun.function_bits())?;
        // Reading DWT_FUNCTION clears its sticky MATCHED bit.
        probe.read_debug32(dwt_function(index))?;

        Ok(())
    }

    pub fn remove(
        &mut self,
        probe: &mut dyn ProbeDriver,
        addr: u32,
    ) -> Result<(), WatchpointError> {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.addr == addr && slot.fun != WatchFun::Disabled {
                tracing::debug!("delete watchpoint {} addr {:x}", index, addr);
                slot.fun = WatchFun::Disabled;
                probe.write_debug32(dwt_function(index), 0)?;
                return Ok(());
            }
        }

        tracing::debug!("failure: delete watchpoint addr {:x}", addr);
        Err(WatchpointError::NotFound(addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::mock::MockProbe;

    #[test]
    fn ceil_log2_is_smallest_covering_power() {
        assert_eq!(ceil_log2(1), 0);
        assert_eq!(ceil_log2(2), 1);
        assert_eq!(ceil_log2(3), 2);
        assert_eq!(ceil_log2(4), 2);
        assert_eq!(ceil_log2(65536), 16);
    }

    #[test]
    fn init_sets_trcena_and_clears_functions() {
        let mut probe = MockProbe::new();
        probe.set_word(dwt_function(2), 6);
        WatchpointUnit::init(&mut probe).unwrap();
        assert_ne!(probe.word(DEMCR) & DEMCR_TRCENA, 0);
        assert_eq!(probe.word(dwt_function(2)), 0);
    }

    #[test]
    fn add_programs_comparator() {
        let mut probe = MockProbe::new();
        let mut unit = WatchpointUnit::init(&mut probe).unwrap();
        unit.add(&mut probe, WatchFun::Write, 0x2000_0010, 4).unwrap();
        assert_eq!(probe.word(dwt_comp(0)), 0x2000_0010);
        assert_eq!(probe.word(dwt_mask(0)), 2);
        assert_eq!(probe.word(dwt_function(0)), 6);
    }

    #[test]
    fn add_rejects_oversized_and_empty_ranges() {
        let mut probe = MockProbe::new();
        let mut unit = WatchpointUnit::init(&mut probe).unwrap();
        assert!(matches!(
            unit.add(&mut probe, WatchFun::Read, 0x2000_0000, 65537),
            Err(WatchpointError::InvalidLength(_))
        ));
        assert!(matches!(
            unit.add(&mut probe, WatchFun::Read, 0x2000_0000, 0),
            Err(WatchpointError::InvalidLength(_))
        ));
    }

    #[test]
    fn slots_exhaust_at_four() {
        let mut probe = MockProbe::new();
        let mut unit = WatchpointUnit::init(&mut probe).unwrap();
        for i in 0..4 {
            unit.add(&mut probe, WatchFun::Access, 0x2000_0000 + i * 8, 4)
                .unwrap();
        }
        assert!(matches!(
            unit.add(&mut probe, WatchFun::Access, 0x2000_0100, 4),
            Err(WatchpointError::NoFreeComparator)
        ));
    }

    #[test]
    fn remove_disables_matching_slot() {
        let mut probe = MockProbe::new();
        let mut unit = WatchpointUnit::init(&mut probe).unwrap();
        unit.add(&mut probe, WatchFun::Read, 0x2000_0020, 2).unwrap();
        unit.remove(&mut probe, 0x2000_0020).unwrap();
        assert_eq!(probe.word(dwt_function(0)), 0);
        // The slot is reusable afterwards.
        unit.add(&mut probe, WatchFun::Write, 0x2000_0040, 1).unwrap();
        assert_eq!(probe.word(dwt_comp(0)), 0x2000_0040);

        assert!(matches!(
            unit.remove(&mut probe, 0x2000_9999),
            Err(WatchpointError::NotFound(_))
        ));
    }
}
