//! Cache coherence for Cortex-M7 targets.
//!
//! The debug port writes straight to memory, bypassing the core caches, so
//! a host-side memory write can leave stale lines in front of the CPU.
//! Every such write marks the descriptor dirty; before the core is resumed
//! the D-cache is cleaned by set/way and the I-cache invalidated.

use crate::probe::{ProbeDriver, ProbeError};
use crate::target::registers::{
    Ccsidr, Clidr, Ctr, CCR, CCR_DC, CCR_IC, CCSIDR, CLIDR, CSSELR, CTR, DCCSW, ICIALLU,
};
use crate::target::watchpoints::ceil_log2;

const CACHE_LEVELS: usize = 7;

#[derive(Debug, Clone, Copy, Default)]
struct CacheLevelDesc {
    nsets: u32,
    nways: u32,
    log2_nways: u32,
    /// Bit position just past the set index field in a set/way operand.
    width: u32,
}

#[derive(Debug, Default)]
pub struct CacheDescriptor {
    used: bool,
    /// Smallest D-cache line in bytes across all levels.
    dminline: u32,
    iminline: u32,
    /// Level of unification (uniprocessor); cleaning stops there.
    louu: u32,
    dcache: [CacheLevelDesc; CACHE_LEVELS],
    icache: [CacheLevelDesc; CACHE_LEVELS],
    modified: bool,
}

fn read_level_desc(probe: &mut dyn ProbeDriver) -> Result<CacheLevelDesc, ProbeError> {
    let ccsidr = Ccsidr::from(probe.read_debug32(CCSIDR)?);
    let nsets = ccsidr.num_sets();
    let nways = ccsidr.num_ways();
    let log2_nsets = ceil_log2(nsets);
    let width = 4 + ccsidr.line_size() + log2_nsets;
    tracing::info!(
        "{:08x} LineSize: {}, ways: {}, sets: {} (width: {})",
        u32::from(ccsidr),
        4 << ccsidr.line_size(),
        nways,
        nsets,
        width
    );
    Ok(CacheLevelDesc {
        nsets,
        nways,
        log2_nways: ceil_log2(nways),
        width,
    })
}

impl CacheDescriptor {
    /// Discovers the cache hierarchy, if the part has one. Targets without
    /// the CM7 cache type register format come back as unused and every
    /// later call is a no-op.
    pub fn init(probe: &mut dyn ProbeDriver) -> Result<Self, ProbeError> {
        let ctr = Ctr::from(probe.read_debug32(CTR)?);
        if ctr.format() != 0b100 {
            return Ok(Self::default());
        }

        let mut desc = Self {
            used: true,
            dminline: 4 << ctr.dminline(),
            iminline: 4 << ctr.iminline(),
            ..Self::default()
        };

        let clidr = Clidr::from(probe.read_debug32(CLIDR)?);
        desc.louu = clidr.louu();

        let ccr = probe.read_debug32(CCR)?;
        tracing::info!(
            "chip clidr: {:08x}, I-Cache: {}, D-Cache: {}",
            u32::from(clidr),
            if ccr & CCR_IC != 0 { "on" } else { "off" },
            if ccr & CCR_DC != 0 { "on" } else { "off" }
        );
        tracing::info!(
            "cache: LoUU: {}, LoC: {}, LoUIS: {}",
            clidr.louu(),
            clidr.loc(),
            clidr.louis()
        );
        tracing::info!(
            "cache: ctr: {:08x}, DminLine: {} bytes, IminLine: {} bytes",
            u32::from(ctr),
            desc.dminline,
            desc.iminline
        );

        for level in 0..CACHE_LEVELS {
            let cache_type = clidr.cache_type(level);

            if matches!(cache_type, 2 | 3 | 4) {
                probe.write_debug32(CSSELR, (level as u32) << 1)?;
                tracing::info!("D-Cache L{}:", level);
                desc.dcache[level] = read_level_desc(probe)?;
            }

            if matches!(cache_type, 1 | 3) {
                probe.write_debug32(CSSELR, ((level as u32) << 1) | 1)?;
                tracing::info!("I-Cache L{}:", level);
                desc.icache[level] = read_level_desc(probe)?;
            }
        }

        Ok(desc)
    }

    /// Records that host-visible memory changed. Cheap enough to call on
    /// every write path.
    pub fn change(&mut self, count: u32) {
        if count == 0 {
            return;
        }
        self.modified = true;
    }

    #[cfg(test)]
    pub fn is_modified(&self) -> bool {
        self.modified
    }

    /// Makes the caches coherent with memory if anything was written since
    /// the last sync. Must run before every transition to target execution.
    pub fn sync(&mut self, probe: &mut dyn ProbeDriver) -> Result<(), ProbeError> {
        if !self.used || !self.modified {
            return Ok(());
        }

        self.modified = false;
        let ccr = probe.read_debug32(CCR)?;
        if ccr & (CCR_IC | CCR_DC) != 0 {
            self.flush(probe, ccr)?;
        }
        Ok(())
    }

    fn flush(&self, probe: &mut dyn ProbeDriver, ccr: u32) -> Result<(), ProbeError> {
        if ccr & CCR_DC != 0 {
            for level in (0..self.louu as usize).rev() {
                let desc = &self.dcache[level];
                let max_addr = 1u32 << desc.width;
                let way_shift = 32 - desc.log2_nways;

                // Clean by set/way, every way of every set of this level.
                let mut addr = (level as u32) << 1;
                while addr < max_addr {
                    for way in 0..desc.nways {
                        let operand = addr | way.checked_shl(way_shift).unwrap_or(0);
                        probe.write_debug32(DCCSW, operand)?;
                    }
                    addr += self.dminline;
                }
            }
        }

        if ccr & CCR_IC != 0 {
            probe.write_debug32(ICIALLU, 0)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::mock::MockProbe;

    #[test]
    fn absent_cache_stays_unused() {
        let mut probe = MockProbe::new();
        let mut desc = CacheDescriptor::init(&mut probe).unwrap();
        assert!(!desc.used);

        // Even when marked dirty, sync touches nothing.
        desc.change(16);
        probe.set_word(ICIALLU, 0x1234_5678);
        desc.sync(&mut probe).unwrap();
        assert_eq!(probe.word(ICIALLU), 0x1234_5678);
    }

    #[test]
    fn zero_length_write_does_not_dirty() {
        let mut desc = CacheDescriptor::default();
        desc.change(0);
        assert!(!desc.is_modified());
        desc.change(4);
        assert!(desc.is_modified());
    }

    fn cm7_probe() -> MockProbe {
        let mut probe = MockProbe::new();
        // CTR format 0b100, DminLine 8 words (32 bytes), IminLine 8 words.
        probe.set_word(CTR, (0b100 << 29) | (3 << 16) | 3);
        // L1 split I+D (ct = 3), LoUU = 1.
        probe.set_word(CLIDR, (1 << 27) | 0b011);
        probe.set_word(CCR, CCR_IC | CCR_DC);
        // 4 KiB, 2-way, 64 sets of 32-byte lines:
        // line_size=1 (8 words), associativity=1, num_sets=63.
        probe.set_word(CCSIDR, (63 << 13) | (1 << 3) | 1);
        probe
    }

    #[test]
    fn discovers_cm7_geometry() {
        let mut probe = cm7_probe();
        let desc = CacheDescriptor::init(&mut probe).unwrap();
        assert!(desc.used);
        assert_eq!(desc.dminline, 32);
        assert_eq!(desc.louu, 1);
        assert_eq!(desc.dcache[0].nsets, 64);
        assert_eq!(desc.dcache[0].nways, 2);
        assert_eq!(desc.dcache[0].width, 4 + 1 + 6);
    }

    #[test]
    fn sync_invalidates_icache_and_clears_dirty_flag() {
        let mut probe = cm7_probe();
        let mut desc = CacheDescriptor::init(&mut probe).unwrap();
        probe.set_word(ICIALLU, 0xffff_ffff);

        desc.change(4);
        desc.sync(&mut probe).unwrap();
        assert_eq!(probe.word(ICIALLU), 0);
        assert!(!desc.is_modified());

        // A second sync with nothing written must not touch the hardware.
        probe.set_word(ICIALLU, 0xffff_ffff);
        desc.sync(&mut probe).unwrap();
        assert_eq!(probe.word(ICIALLU), 0xffff_ffff);
    }
}
