//! STM32 chip identification and the memory-map XML handed to GDB.
//!
//! The map is rendered once per session from the probe's geometry. A few
//! families need hand-written maps (segmented F4 sectors, the F7/H7 layout);
//! everything else uses the generic template with up to six substituted
//! geometry values.

use crate::probe::ProbeDriver;

// DBGMCU IDCODE device ids, the subset this tool knows how to describe.
pub const CHIPID_F1_MEDIUM: u32 = 0x410;
pub const CHIPID_F2: u32 = 0x411;
pub const CHIPID_F4: u32 = 0x413;
pub const CHIPID_F1_HIGH: u32 = 0x414;
pub const CHIPID_L4: u32 = 0x415;
pub const CHIPID_F4_HD: u32 = 0x419;
pub const CHIPID_F446: u32 = 0x421;
pub const CHIPID_F411: u32 = 0x431;
pub const CHIPID_F4_DE: u32 = 0x433;
pub const CHIPID_L43X: u32 = 0x435;
pub const CHIPID_F7: u32 = 0x449;
pub const CHIPID_H74X: u32 = 0x450;
pub const CHIPID_L45X: u32 = 0x462;
pub const CHIPID_L496: u32 = 0x461;
pub const CHIPID_H72X: u32 = 0x483;
pub const CHIPID_UNKNOWN: u32 = 0;

/// SWD core id of Cortex-M7F parts, which get the F7 map even when the
/// device id is not in the table.
pub const CORE_ID_M7F_SWD: u32 = 0x5ba0_2477;

/// Which flash controller sequence programs this part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashType {
    /// F0/F1/F3-style FPEC: page erase through FLASH_AR, half-word writes.
    PageErase,
    /// F2/F4/F7 controller: numbered sector erase, word writes.
    SectorErase,
    /// L4 controller: numbered page erase, double-word writes.
    PageNumberErase,
    /// Known silicon whose flash sequence this tool does not drive.
    Unsupported,
}

/// Static per-family facts the probe needs before it can size the device.
#[derive(Debug, Clone, Copy)]
pub struct ChipParams {
    pub chip_id: u32,
    pub description: &'static str,
    pub flash_type: FlashType,
    /// Location of the factory-programmed flash size, in KiB, as a
    /// half-word.
    pub flash_size_reg: u32,
    /// Page size for uniform-page parts; sector parts derive it from the
    /// address instead.
    pub flash_pgsz: u32,
    pub sram_size: u32,
    pub sys_base: u32,
    pub sys_size: u32,
}

const DEVICES: &[ChipParams] = &[
    ChipParams {
        chip_id: CHIPID_F1_MEDIUM,
        description: "F1xx Medium-density",
        flash_type: FlashType::PageErase,
        flash_size_reg: 0x1fff_f7e0,
        flash_pgsz: 0x400,
        sram_size: 0x5000,
        sys_base: 0x1fff_f000,
        sys_size: 0x800,
    },
    ChipParams {
        chip_id: CHIPID_F1_HIGH,
        description: "F1xx High-density",
        flash_type: FlashType::PageErase,
        flash_size_reg: 0x1fff_f7e0,
        flash_pgsz: 0x800,
        sram_size: 0x10000,
        sys_base: 0x1fff_f000,
        sys_size: 0x800,
    },
    ChipParams {
        chip_id: CHIPID_F2,
        description: "F2xx",
        flash_type: FlashType::SectorErase,
        flash_size_reg: 0x1fff_7a22,
        flash_pgsz: 0x20000,
        sram_size: 0x20000,
        sys_base: 0x1fff_0000,
        sys_size: 0x7800,
    },
    ChipParams {
        chip_id: CHIPID_F4,
        description: "F4xx",
        flash_type: FlashType::SectorErase,
        flash_size_reg: 0x1fff_7a22,
        flash_pgsz: 0x20000,
        sram_size: 0x30000,
        sys_base: 0x1fff_0000,
        sys_size: 0x7800,
    },
    ChipParams {
        chip_id: CHIPID_F4_HD,
        description: "F4xx High-density",
        flash_type: FlashType::SectorErase,
        flash_size_reg: 0x1fff_7a22,
        flash_pgsz: 0x20000,
        sram_size: 0x40000,
        sys_base: 0x1fff_0000,
        sys_size: 0x7800,
    },
    ChipParams {
        chip_id: CHIPID_F446,
        description: "F446",
        flash_type: FlashType::SectorErase,
        flash_size_reg: 0x1fff_7a22,
        flash_pgsz: 0x20000,
        sram_size: 0x20000,
        sys_base: 0x1fff_0000,
        sys_size: 0x7800,
    },
    ChipParams {
        chip_id: CHIPID_F411,
        description: "F411",
        flash_type: FlashType::SectorErase,
        flash_size_reg: 0x1fff_7a22,
        flash_pgsz: 0x20000,
        sram_size: 0x20000,
        sys_base: 0x1fff_0000,
        sys_size: 0x7800,
    },
    ChipParams {
        chip_id: CHIPID_F4_DE,
        description: "F4xx Dynamic Efficiency",
        flash_type: FlashType::SectorErase,
        flash_size_reg: 0x1fff_7a22,
        flash_pgsz: 0x20000,
        sram_size: 0x18000,
        sys_base: 0x1fff_0000,
        sys_size: 0x7800,
    },
    ChipParams {
        chip_id: CHIPID_F7,
        description: "F7xx",
        flash_type: FlashType::SectorErase,
        flash_size_reg: 0x1ff0_f442,
        flash_pgsz: 0x40000,
        sram_size: 0x50000,
        sys_base: 0x1ff0_0000,
        sys_size: 0xedc0,
    },
    ChipParams {
        chip_id: CHIPID_L4,
        description: "L4xx",
        flash_type: FlashType::PageNumberErase,
        flash_size_reg: 0x1fff_75e0,
        flash_pgsz: 0x800,
        sram_size: 0x18000,
        sys_base: 0x1fff_0000,
        sys_size: 0x7000,
    },
    ChipParams {
        chip_id: CHIPID_L43X,
        description: "L43x/L44x",
        flash_type: FlashType::PageNumberErase,
        flash_size_reg: 0x1fff_75e0,
        flash_pgsz: 0x800,
        sram_size: 0xc000,
        sys_base: 0x1fff_0000,
        sys_size: 0x7000,
    },
    ChipParams {
        chip_id: CHIPID_L45X,
        description: "L45x/L46x",
        flash_type: FlashType::PageNumberErase,
        flash_size_reg: 0x1fff_75e0,
        flash_pgsz: 0x800,
        sram_size: 0x20000,
        sys_base: 0x1fff_0000,
        sys_size: 0x7000,
    },
    ChipParams {
        chip_id: CHIPID_L496,
        description: "L496x/L4A6x",
        flash_type: FlashType::PageNumberErase,
        flash_size_reg: 0x1fff_75e0,
        flash_pgsz: 0x800,
        sram_size: 0x40000,
        sys_base: 0x1fff_0000,
        sys_size: 0x7000,
    },
    ChipParams {
        chip_id: CHIPID_H74X,
        description: "H74x/H75x",
        flash_type: FlashType::Unsupported,
        flash_size_reg: 0x1ff1_e880,
        flash_pgsz: 0x20000,
        sram_size: 0x20000,
        sys_base: 0x1ff0_0000,
        sys_size: 0x20000,
    },
    ChipParams {
        chip_id: CHIPID_H72X,
        description: "H72x/H73x",
        flash_type: FlashType::Unsupported,
        flash_size_reg: 0x1ff1_e880,
        flash_pgsz: 0x20000,
        sram_size: 0x20000,
        sys_base: 0x1ff0_0000,
        sys_size: 0x20000,
    },
];

/// Placeholder parameters used before the target has been identified.
pub const UNIDENTIFIED_PARAMS: &ChipParams = &DEVICES[0];

pub fn params_for(chip_id: u32) -> Option<&'static ChipParams> {
    DEVICES.iter().find(|params| params.chip_id == chip_id)
}

/// Erase-unit size at `addr` for parts with non-uniform sectors. Uniform
/// parts answer their fixed page size.
pub fn page_size_at(params: &ChipParams, addr: u32) -> u32 {
    if params.flash_type != FlashType::SectorErase {
        return params.flash_pgsz;
    }

    let offset = addr.saturating_sub(crate::flash::FLASH_BASE);
    if params.chip_id == CHIPID_F7 {
        // 4x32K, 1x128K, then 256K sectors.
        match offset {
            0..=0x1ffff => 0x8000,
            0x20000..=0x3ffff => 0x20000,
            _ => 0x40000,
        }
    } else {
        // 4x16K, 1x64K, then 128K sectors.
        match offset {
            0..=0xffff => 0x4000,
            0x10000..=0x1ffff => 0x10000,
            _ => 0x20000,
        }
    }
}

/// Sector number for the numbered-erase controllers.
pub fn sector_at(params: &ChipParams, addr: u32) -> u32 {
    let offset = addr.saturating_sub(crate::flash::FLASH_BASE);
    match params.flash_type {
        FlashType::SectorErase => {
            if params.chip_id == CHIPID_F7 {
                match offset {
                    0..=0x1ffff => offset / 0x8000,
                    0x20000..=0x3ffff => 4,
                    _ => 4 + offset / 0x40000,
                }
            } else {
                match offset {
                    0..=0xffff => offset / 0x4000,
                    0x10000..=0x1ffff => 4,
                    _ => 4 + offset / 0x20000,
                }
            }
        }
        _ => offset / params.flash_pgsz,
    }
}

const MAP_HEADER: &str = r#"<?xml version="1.0"?>
<!DOCTYPE memory-map PUBLIC "+//IDN gnu.org//DTD GDB Memory Map V1.0//EN" "http://sourceware.org/gdb/gdb-memory-map.dtd">
"#;

/// Renders the memory map for the connected target.
pub fn make_memory_map(probe: &dyn ProbeDriver) -> String {
    let chip_id = probe.chip_id();

    if matches!(chip_id, CHIPID_F4 | CHIPID_F446 | CHIPID_F411) {
        return f4_map();
    }
    if chip_id == CHIPID_F4_DE {
        return f4_de_map();
    }
    if probe.core_id() == CORE_ID_M7F_SWD {
        return f7_map(probe.sram_size());
    }
    if chip_id == CHIPID_H74X || chip_id == CHIPID_H72X {
        return h7_map(probe.flash_size(), probe.flash_pgsz(crate::flash::FLASH_BASE));
    }
    if chip_id == CHIPID_F4_HD {
        return f4_hd_map();
    }
    if chip_id == CHIPID_F2 {
        return f2_map(
            probe.flash_size(),
            probe.sram_size(),
            probe.flash_size() - 0x20000,
            probe.sys_base(),
            probe.sys_size(),
        );
    }
    if matches!(chip_id, CHIPID_L4 | CHIPID_L43X | CHIPID_L45X | CHIPID_L496) {
        return l4_map(probe.flash_size());
    }

    generic_map(
        probe.flash_size(),
        probe.sram_size(),
        probe.flash_pgsz(crate::flash::FLASH_BASE),
        probe.sys_base(),
        probe.sys_size(),
    )
}

fn generic_map(flash_size: u32, sram_size: u32, pgsz: u32, sys_base: u32, sys_size: u32) -> String {
    format!(
        r#"{MAP_HEADER}<memory-map>
  <memory type="rom" start="0x00000000" length="{flash_size:#x}"/>
  <memory type="ram" start="0x20000000" length="{sram_size:#x}"/>
  <memory type="flash" start="0x08000000" length="{flash_size:#x}">
    <property name="blocksize">{pgsz:#x}</property>
  </memory>
  <memory type="ram" start="0x40000000" length="0x1fffffff"/>
  <memory type="ram" start="0xe0000000" length="0x1fffffff"/>
  <memory type="rom" start="{sys_base:#010x}" length="{sys_size:#x}"/>
  <memory type="rom" start="0x1ffff800" length="0x10"/>
</memory-map>
"#
    )
}

// F4 sector layout: 4x16K, 1x64K, then 128K sectors.
fn f4_map() -> String {
    format!(
        r#"{MAP_HEADER}<memory-map>
  <memory type="rom" start="0x00000000" length="0x100000"/>
  <memory type="ram" start="0x10000000" length="0x10000"/>
  <memory type="ram" start="0x20000000" length="0x20000"/>
  <memory type="flash" start="0x08000000" length="0x10000">
    <property name="blocksize">0x4000</property>
  </memory>
  <memory type="flash" start="0x08010000" length="0x10000">
    <property name="blocksize">0x10000</property>
  </memory>
  <memory type="flash" start="0x08020000" length="0xe0000">
    <property name="blocksize">0x20000</property>
  </memory>
  <memory type="ram" start="0x40000000" length="0x1fffffff"/>
  <memory type="ram" start="0xe0000000" length="0x1fffffff"/>
  <memory type="rom" start="0x1fff0000" length="0x7800"/>
  <memory type="rom" start="0x1fffc000" length="0x10"/>
</memory-map>
"#
    )
}

fn f4_de_map() -> String {
    format!(
        r#"{MAP_HEADER}<memory-map>
  <memory type="rom" start="0x00000000" length="0x80000"/>
  <memory type="ram" start="0x20000000" length="0x18000"/>
  <memory type="flash" start="0x08000000" length="0x10000">
    <property name="blocksize">0x4000</property>
  </memory>
  <memory type="flash" start="0x08010000" length="0x10000">
    <property name="blocksize">0x10000</property>
  </memory>
  <memory type="flash" start="0x08020000" length="0x60000">
    <property name="blocksize">0x20000</property>
  </memory>
  <memory type="ram" start="0x40000000" length="0x1fffffff"/>
  <memory type="ram" start="0xe0000000" length="0x1fffffff"/>
  <memory type="rom" start="0x1fff0000" length="0x7800"/>
  <memory type="rom" start="0x1fffc000" length="0x10"/>
</memory-map>
"#
    )
}

fn f4_hd_map() -> String {
    format!(
        r#"{MAP_HEADER}<memory-map>
  <memory type="rom" start="0x00000000" length="0x100000"/>
  <memory type="ram" start="0x10000000" length="0x10000"/>
  <memory type="ram" start="0x20000000" length="0x40000"/>
  <memory type="ram" start="0x60000000" length="0x10000000"/>
  <memory type="flash" start="0x08000000" length="0x10000">
    <property name="blocksize">0x4000</property>
  </memory>
  <memory type="flash" start="0x08010000" length="0x10000">
    <property name="blocksize">0x10000</property>
  </memory>
  <memory type="flash" start="0x08020000" length="0xe0000">
    <property name="blocksize">0x20000</property>
  </memory>
  <memory type="ram" start="0x40000000" length="0x1fffffff"/>
  <memory type="ram" start="0xe0000000" length="0x1fffffff"/>
  <memory type="rom" start="0x1fff0000" length="0x7800"/>
  <memory type="rom" start="0x1fffc000" length="0x10"/>
</memory-map>
"#
    )
}

fn f7_map(sram_size: u32) -> String {
    format!(
        r#"{MAP_HEADER}<memory-map>
  <memory type="ram" start="0x00000000" length="0x4000"/>
  <memory type="ram" start="0x20000000" length="{sram_size:#x}"/>
  <memory type="flash" start="0x08000000" length="0x20000">
    <property name="blocksize">0x8000</property>
  </memory>
  <memory type="flash" start="0x08020000" length="0x20000">
    <property name="blocksize">0x20000</property>
  </memory>
  <memory type="flash" start="0x08040000" length="0xC0000">
    <property name="blocksize">0x40000</property>
  </memory>
  <memory type="ram" start="0x40000000" length="0x1fffffff"/>
  <memory type="ram" start="0xe0000000" length="0x1fffffff"/>
  <memory type="rom" start="0x00100000" length="0xEDC0"/>
  <memory type="rom" start="0x1fff0000" length="0x20"/>
</memory-map>
"#
    )
}

fn h7_map(flash_size: u32, pgsz: u32) -> String {
    format!(
        r#"{MAP_HEADER}<memory-map>
  <memory type="ram" start="0x00000000" length="0x10000"/>
  <memory type="ram" start="0x20000000" length="0x20000"/>
  <memory type="ram" start="0x24000000" length="0x80000"/>
  <memory type="ram" start="0x30000000" length="0x48000"/>
  <memory type="ram" start="0x38000000" length="0x10000"/>
  <memory type="flash" start="0x08000000" length="{flash_size:#x}">
    <property name="blocksize">{pgsz:#x}</property>
  </memory>
  <memory type="ram" start="0x40000000" length="0x1fffffff"/>
  <memory type="ram" start="0xe0000000" length="0x1fffffff"/>
  <memory type="rom" start="0x1ff00000" length="0x20000"/>
</memory-map>
"#
    )
}

fn f2_map(
    flash_size: u32,
    sram_size: u32,
    large_sectors: u32,
    sys_base: u32,
    sys_size: u32,
) -> String {
    format!(
        r#"{MAP_HEADER}<memory-map>
  <memory type="rom" start="0x00000000" length="{flash_size:#x}"/>
  <memory type="ram" start="0x20000000" length="{sram_size:#x}"/>
  <memory type="flash" start="0x08000000" length="0x10000">
    <property name="blocksize">0x4000</property>
  </memory>
  <memory type="flash" start="0x08010000" length="0x10000">
    <property name="blocksize">0x10000</property>
  </memory>
  <memory type="flash" start="0x08020000" length="{large_sectors:#x}">
    <property name="blocksize">0x20000</property>
  </memory>
  <memory type="ram" start="0x40000000" length="0x1fffffff"/>
  <memory type="ram" start="0xe0000000" length="0x1fffffff"/>
  <memory type="rom" start="{sys_base:#010x}" length="{sys_size:#x}"/>
  <memory type="rom" start="0x1fffc000" length="0x10"/>
</memory-map>
"#
    )
}

fn l4_map(flash_size: u32) -> String {
    format!(
        r#"{MAP_HEADER}<memory-map>
  <memory type="rom" start="0x00000000" length="{flash_size:#x}"/>
  <memory type="ram" start="0x10000000" length="0x8000"/>
  <memory type="ram" start="0x20000000" length="0x18000"/>
  <memory type="flash" start="0x08000000" length="{flash_size:#x}">
    <property name="blocksize">0x800</property>
  </memory>
  <memory type="ram" start="0x40000000" length="0x1fffffff"/>
  <memory type="ram" start="0xe0000000" length="0x1fffffff"/>
  <memory type="rom" start="0x1fff0000" length="0x7000"/>
  <memory type="rom" start="0x1fff7800" length="0x10"/>
</memory-map>
"#
    )
}

/// The target description served through `qXfer:features:read`: an
/// m-profile core with the FP register bank, register numbering matching
/// the `p`/`P` id map.
pub const TARGET_DESCRIPTION: &str = r#"<?xml version="1.0"?>
<!DOCTYPE target SYSTEM "gdb-target.dtd">
<target version="1.0">
   <architecture>arm</architecture>
   <feature name="org.gnu.gdb.arm.m-profile">
       <reg name="r0" bitsize="32"/>
       <reg name="r1" bitsize="32"/>
       <reg name="r2" bitsize="32"/>
       <reg name="r3" bitsize="32"/>
       <reg name="r4" bitsize="32"/>
       <reg name="r5" bitsize="32"/>
       <reg name="r6" bitsize="32"/>
       <reg name="r7" bitsize="32"/>
       <reg name="r8" bitsize="32"/>
       <reg name="r9" bitsize="32"/>
       <reg name="r10" bitsize="32"/>
       <reg name="r11" bitsize="32"/>
       <reg name="r12" bitsize="32"/>
       <reg name="sp" bitsize="32" type="data_ptr"/>
       <reg name="lr" bitsize="32"/>
       <reg name="pc" bitsize="32" type="code_ptr"/>
       <reg name="xpsr" bitsize="32" regnum="25"/>
       <reg name="msp" bitsize="32" regnum="26" type="data_ptr" group="general" />
       <reg name="psp" bitsize="32" regnum="27" type="data_ptr" group="general" />
       <reg name="control" bitsize="8" regnum="28" type="int" group="general" />
       <reg name="faultmask" bitsize="8" regnum="29" type="int" group="general" />
       <reg name="basepri" bitsize="8" regnum="30" type="int" group="general" />
       <reg name="primask" bitsize="8" regnum="31" type="int" group="general" />
       <reg name="s0" bitsize="32" regnum="32" type="float" group="float" />
       <reg name="s1" bitsize="32" type="float" group="float" />
       <reg name="s2" bitsize="32" type="float" group="float" />
       <reg name="s3" bitsize="32" type="float" group="float" />
       <reg name="s4" bitsize="32" type="float" group="float" />
       <reg name="s5" bitsize="32" type="float" group="float" />
       <reg name="s6" bitsize="32" type="float" group="float" />
       <reg name="s7" bitsize="32" type="float" group="float" />
       <reg name="s8" bitsize="32" type="float" group="float" />
       <reg name="s9" bitsize="32" type="float" group="float" />
       <reg name="s10" bitsize="32" type="float" group="float" />
       <reg name="s11" bitsize="32" type="float" group="float" />
       <reg name="s12" bitsize="32" type="float" group="float" />
       <reg name="s13" bitsize="32" type="float" group="float" />
       <reg name="s14" bitsize="32" type="float" group="float" />
       <reg name="s15" bitsize="32" type="float" group="float" />
       <reg name="s16" bitsize="32" type="float" group="float" />
       <reg name="s17" bitsize="32" type="float" group="float" />
       <reg name="s18" bitsize="32" type="float" group="float" />
       <reg name="s19" bitsize="32" type="float" group="float" />
       <reg name="s20" bitsize="32" type="float" group="float" />
       <reg name="s21" bitsize="32" type="float" group="float" />
       <reg name="s22" bitsize="32" type="float" group="float" />
       <reg name="s23" bitsize="32" type="float" group="float" />
       <reg name="s24" bitsize="32" type="float" group="float" />
       <reg name="s25" bitsize="32" type="float" group="float" />
       <reg name="s26" bitsize="32" type="float" group="float" />
       <reg name="s27" bitsize="32" type="float" group="float" />
       <reg name="s28" bitsize="32" type="float" group="float" />
       <reg name="s29" bitsize="32" type="float" group="float" />
       <reg name="s30" bitsize="32" type="float" group="float" />
       <reg name="s31" bitsize="32" type="float" group="float" />
       <reg name="fpscr" bitsize="32" type="int" group="float" />
   </feature>
</target>
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::mock::MockProbe;

    #[test]
    fn generic_map_substitutes_geometry() {
        let probe = MockProbe::new();
        let map = make_memory_map(&probe);
        assert!(map.contains(r#"<memory type="ram" start="0x20000000" length="0x5000"/>"#));
        assert!(map.contains(r#"<memory type="flash" start="0x08000000" length="0x10000">"#));
        assert!(map.contains(r#"<property name="blocksize">0x800</property>"#));
        assert!(map.contains(r#"start="0x1ffff000" length="0x800"/>"#));
    }

    #[test]
    fn target_description_has_fp_bank() {
        assert!(TARGET_DESCRIPTION.contains(r#"<reg name="s31""#));
        assert!(TARGET_DESCRIPTION.contains(r#"<reg name="fpscr""#));
        assert!(TARGET_DESCRIPTION.contains(r#"regnum="25""#));
    }

    #[test]
    fn f4_sector_geometry() {
        let params = params_for(CHIPID_F4).unwrap();
        assert_eq!(page_size_at(params, 0x0800_0000), 0x4000);
        assert_eq!(page_size_at(params, 0x0800_ffff), 0x4000);
        assert_eq!(page_size_at(params, 0x0801_0000), 0x10000);
        assert_eq!(page_size_at(params, 0x0802_0000), 0x20000);

        assert_eq!(sector_at(params, 0x0800_0000), 0);
        assert_eq!(sector_at(params, 0x0800_c000), 3);
        assert_eq!(sector_at(params, 0x0801_0000), 4);
        assert_eq!(sector_at(params, 0x0802_0000), 5);
        assert_eq!(sector_at(params, 0x0804_0000), 6);
    }

    #[test]
    fn uniform_page_parts_ignore_the_address() {
        let params = params_for(CHIPID_L4).unwrap();
        assert_eq!(page_size_at(params, 0x0800_0000), 0x800);
        assert_eq!(page_size_at(params, 0x0801_2340), 0x800);
        assert_eq!(sector_at(params, 0x0800_1000), 2);
    }

    #[test]
    fn unknown_chips_have_no_params() {
        assert!(params_for(0x999).is_none());
        assert!(params_for(CHIPID_F1_MEDIUM).is_some());
    }
}
