//! Typed interface to the debug probe.
//!
//! The session engine never talks USB; everything it needs from the probe is
//! expressed by [`ProbeDriver`]. The shipped implementation is the ST-Link
//! backend in [`stlink`], tests use the in-memory mock at the bottom of this
//! module.

pub mod stlink;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("USB transport error: {0}")]
    Usb(#[from] rusb::Error),
    #[error("probe not found")]
    ProbeNotFound,
    #[error("probe firmware too old (JTAG version {0})")]
    FirmwareOutdated(u8),
    #[error("probe reported status {0:#04x} for command {1:#04x}")]
    CommandFailed(u8, u8),
    #[error("unsupported target (chip id {0:#010x})")]
    UnknownChip(u32),
    #[error("operation not supported on this target: {0}")]
    UnsupportedOperation(&'static str),
    #[error("timeout waiting for {0}")]
    Timeout(&'static str),
    #[error("data alignment error at {0:#010x}")]
    Alignment(u32),
    #[error("invalid register id {0:#04x}")]
    InvalidRegister(u32),
    #[error("target fault at {0:#010x}")]
    TargetFault(u32),
}

/// How to attach to the target when a session starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectMode {
    /// Reset the board and halt it.
    #[default]
    Normal,
    /// Attach without disturbing the running target.
    HotPlug,
    /// Hold reset while attaching.
    UnderReset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetMode {
    /// Local (AIRCR) reset with the core halted afterwards.
    SoftAndHalt,
    /// Pulse the nRESET line.
    Hard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreStatus {
    Running,
    Halted,
    Unknown,
}

/// A snapshot of the Cortex-M register file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoreRegs {
    pub r: [u32; 16],
    pub xpsr: u32,
    pub main_sp: u32,
    pub process_sp: u32,
    pub control: u32,
    pub faultmask: u32,
    pub basepri: u32,
    pub primask: u32,
    pub s: [u32; 32],
    pub fpscr: u32,
}

/// Options resolved from the command line that influence probe setup.
#[derive(Debug, Clone, Default)]
pub struct ProbeOptions {
    pub connect_mode: ConnectMode,
    /// Requested SWD frequency in kHz.
    pub freq_khz: Option<u32>,
    pub serial: Option<String>,
}

/// Capability set the server needs from a debug probe.
///
/// All addresses are target addresses; multi-byte values are little-endian
/// in memory buffers, matching the Cortex-M targets this tool drives.
pub trait ProbeDriver: Send {
    /// Reads a word from the debug register space (system/debug peripherals).
    fn read_debug32(&mut self, addr: u32) -> Result<u32, ProbeError>;
    fn write_debug32(&mut self, addr: u32, value: u32) -> Result<(), ProbeError>;

    /// Reads `length` bytes; `addr` and `length` must be word-aligned.
    fn read_mem32(&mut self, addr: u32, length: u32) -> Result<Vec<u8>, ProbeError>;
    /// Writes word-aligned data.
    fn write_mem32(&mut self, addr: u32, data: &[u8]) -> Result<(), ProbeError>;
    /// Writes byte-granular data, any alignment.
    fn write_mem8(&mut self, addr: u32, data: &[u8]) -> Result<(), ProbeError>;

    fn read_all_regs(&mut self) -> Result<CoreRegs, ProbeError>;
    /// Reads one of the probe-level registers: 0-15 are r0..pc, 16 xPSR,
    /// 17 MSP, 18 PSP.
    fn read_reg(&mut self, id: u8) -> Result<u32, ProbeError>;
    fn write_reg(&mut self, value: u32, id: u8) -> Result<(), ProbeError>;
    /// Registers outside the DCRSR window GDB still asks about, addressed by
    /// GDB id: 0x1c CONTROL, 0x1d FAULTMASK, 0x1e BASEPRI, 0x1f PRIMASK,
    /// 0x20-0x3f S0-S31, 0x40 FPSCR.
    fn read_unsupported_reg(&mut self, id: u32) -> Result<u32, ProbeError>;
    fn write_unsupported_reg(&mut self, value: u32, id: u32) -> Result<(), ProbeError>;

    /// Forces the core into debug state.
    fn halt(&mut self) -> Result<(), ProbeError>;
    fn step(&mut self) -> Result<(), ProbeError>;
    /// Leaves debug state and lets the core run.
    fn run(&mut self) -> Result<(), ProbeError>;
    fn status(&mut self) -> Result<CoreStatus, ProbeError>;
    fn reset(&mut self, mode: ResetMode) -> Result<(), ProbeError>;

    /// (Re)establishes the target connection according to `mode`.
    fn connect(&mut self, mode: ConnectMode) -> Result<(), ProbeError>;
    fn exit_debug_mode(&mut self) -> Result<(), ProbeError>;
    fn close(&mut self);

    fn erase_page(&mut self, addr: u32) -> Result<(), ProbeError>;
    fn flashloader_start(&mut self) -> Result<(), ProbeError>;
    fn flashloader_write(&mut self, addr: u32, data: &[u8]) -> Result<(), ProbeError>;
    fn flashloader_stop(&mut self) -> Result<(), ProbeError>;

    fn chip_id(&self) -> u32;
    fn core_id(&self) -> u32;
    fn flash_size(&self) -> u32;
    /// Page size of the erase unit containing `addr`; varies with the
    /// address on parts with mixed sector sizes.
    fn flash_pgsz(&self, addr: u32) -> u32;
    fn sram_size(&self) -> u32;
    fn sys_base(&self) -> u32;
    fn sys_size(&self) -> u32;
    /// Byte value flash cells read as after an erase.
    fn erased_pattern(&self) -> u8;
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::collections::{HashMap, VecDeque};

    use crate::target::registers::{CPUID, FP_CTRL};

    /// Scriptable probe used by the unit tests. Debug registers and target
    /// memory share one sparse byte store; unwritten locations read zero.
    pub struct MockProbe {
        pub memory: HashMap<u32, u8>,
        pub regs: CoreRegs,
        pub unsupported: HashMap<u32, u32>,
        /// Values returned by successive `status` calls; the last entry
        /// repeats once the script runs out.
        pub status_script: VecDeque<CoreStatus>,
        pub halted: bool,
        pub erased_pages: Vec<u32>,
        pub loader_running: bool,
        pub loader_writes: Vec<(u32, usize)>,
        pub resets: Vec<ResetMode>,
        pub connects: Vec<ConnectMode>,
        pub fail_step: bool,
        pub fail_mem_reads: bool,
        pub fail_erase: bool,
        pub flash_size: u32,
        pub page_size: u32,
    }

    impl MockProbe {
        pub fn new() -> Self {
            let mut probe = Self {
                memory: HashMap::new(),
                regs: CoreRegs::default(),
                unsupported: HashMap::new(),
                status_script: VecDeque::new(),
                halted: true,
                erased_pages: Vec::new(),
                loader_running: false,
                loader_writes: Vec::new(),
                resets: Vec::new(),
                connects: Vec::new(),
                fail_step: false,
                fail_mem_reads: false,
                fail_erase: false,
                flash_size: 0x10000,
                page_size: 0x800,
            };
            // FPB rev 1 with 6 instruction and 2 literal comparators,
            // Cortex-M4 part number, no caches.
            probe.set_word(FP_CTRL, (2 << 8) | (6 << 4));
            probe.set_word(CPUID, 0x410f_c241);
            probe
        }

        pub fn set_word(&mut self, addr: u32, value: u32) {
            for (i, byte) in value.to_le_bytes().iter().enumerate() {
                self.memory.insert(addr + i as u32, *byte);
            }
        }

        pub fn word(&self, addr: u32) -> u32 {
            let mut bytes = [0u8; 4];
            for (i, byte) in bytes.iter_mut().enumerate() {
                *byte = *self.memory.get(&(addr + i as u32)).unwrap_or(&0);
            }
            u32::from_le_bytes(bytes)
        }

        pub fn bytes(&self, addr: u32, length: u32) -> Vec<u8> {
            (0..length)
                .map(|i| *self.memory.get(&(addr + i)).unwrap_or(&0))
                .collect()
        }
    }

    impl ProbeDriver for MockProbe {
        fn read_debug32(&mut self, addr: u32) -> Result<u32, ProbeError> {
            Ok(self.word(addr))
        }

        fn write_debug32(&mut self, addr: u32, value: u32) -> Result<(), ProbeError> {
            // FP_CTRL reads back its geometry, not the enable key.
            if addr != FP_CTRL {
                self.set_word(addr, value);
            }
            Ok(())
        }

        fn read_mem32(&mut self, addr: u32, length: u32) -> Result<Vec<u8>, ProbeError> {
            if self.fail_mem_reads {
                return Err(ProbeError::TargetFault(addr));
            }
            if addr % 4 != 0 || length % 4 != 0 {
                return Err(ProbeError::Alignment(addr));
            }
            Ok(self.bytes(addr, length))
        }

        fn write_mem32(&mut self, addr: u32, data: &[u8]) -> Result<(), ProbeError> {
            if addr % 4 != 0 || data.len() % 4 != 0 {
                return Err(ProbeError::Alignment(addr));
            }
            self.write_mem8(addr, data)
        }

        fn write_mem8(&mut self, addr: u32, data: &[u8]) -> Result<(), ProbeError> {
            for (i, byte) in data.iter().enumerate() {
                self.memory.insert(addr + i as u32, *byte);
            }
            Ok(())
        }

        fn read_all_regs(&mut self) -> Result<CoreRegs, ProbeError> {
            Ok(self.regs)
        }

        fn read_reg(&mut self, id: u8) -> Result<u32, ProbeError> {
            match id {
                0..=15 => Ok(self.regs.r[usize::from(id)]),
                16 => Ok(self.regs.xpsr),
                17 => Ok(self.regs.main_sp),
                18 => Ok(self.regs.process_sp),
                _ => Err(ProbeError::InvalidRegister(u32::from(id))),
            }
        }

        fn write_reg(&mut self, value: u32, id: u8) -> Result<(), ProbeError> {
            match id {
                0..=15 => self.regs.r[usize::from(id)] = value,
                16 => self.regs.xpsr = value,
                17 => self.regs.main_sp = value,
                18 => self.regs.process_sp = value,
                _ => return Err(ProbeError::InvalidRegister(u32::from(id))),
            }
            Ok(())
        }

        fn read_unsupported_reg(&mut self, id: u32) -> Result<u32, ProbeError> {
            Ok(*self.unsupported.get(&id).unwrap_or(&0))
        }

        fn write_unsupported_reg(&mut self, value: u32, id: u32) -> Result<(), ProbeError> {
            self.unsupported.insert(id, value);
            Ok(())
        }

        fn halt(&mut self) -> Result<(), ProbeError> {
            self.halted = true;
            Ok(())
        }

        fn step(&mut self) -> Result<(), ProbeError> {
            if self.fail_step {
                return Err(ProbeError::Timeout("step"));
            }
            Ok(())
        }

        fn run(&mut self) -> Result<(), ProbeError> {
            self.halted = false;
            Ok(())
        }

        fn status(&mut self) -> Result<CoreStatus, ProbeError> {
            if let Some(status) = self.status_script.pop_front() {
                if self.status_script.is_empty() {
                    self.status_script.push_back(status);
                }
                return Ok(status);
            }
            Ok(if self.halted {
                CoreStatus::Halted
            } else {
                CoreStatus::Running
            })
        }

        fn reset(&mut self, mode: ResetMode) -> Result<(), ProbeError> {
            self.resets.push(mode);
            Ok(())
        }

        fn connect(&mut self, mode: ConnectMode) -> Result<(), ProbeError> {
            self.connects.push(mode);
            Ok(())
        }

        fn exit_debug_mode(&mut self) -> Result<(), ProbeError> {
            Ok(())
        }

        fn close(&mut self) {}

        fn erase_page(&mut self, addr: u32) -> Result<(), ProbeError> {
            if self.fail_erase {
                return Err(ProbeError::TargetFault(addr));
            }
            self.erased_pages.push(addr);
            let pattern = self.erased_pattern();
            for offset in 0..self.page_size {
                self.memory.insert(addr + offset, pattern);
            }
            Ok(())
        }

        fn flashloader_start(&mut self) -> Result<(), ProbeError> {
            self.loader_running = true;
            Ok(())
        }

        fn flashloader_write(&mut self, addr: u32, data: &[u8]) -> Result<(), ProbeError> {
            assert!(self.loader_running, "loader not started");
            self.loader_writes.push((addr, data.len()));
            self.write_mem8(addr, data)
        }

        fn flashloader_stop(&mut self) -> Result<(), ProbeError> {
            self.loader_running = false;
            Ok(())
        }

        fn chip_id(&self) -> u32 {
            0x410
        }

        fn core_id(&self) -> u32 {
            0x2ba0_1477
        }

        fn flash_size(&self) -> u32 {
            self.flash_size
        }

        fn flash_pgsz(&self, _addr: u32) -> u32 {
            self.page_size
        }

        fn sram_size(&self) -> u32 {
            0x5000
        }

        fn sys_base(&self) -> u32 {
            0x1fff_f000
        }

        fn sys_size(&self) -> u32 {
            0x800
        }

        fn erased_pattern(&self) -> u8 {
            0xff
        }
    }
}
