//! ST-Link implementation of the probe interface.
//!
//! Memory and debug-register traffic uses the probe's dedicated commands;
//! core control (halt, step, run, register file) is driven through the
//! ARMv7-M debug registers, since the probe's legacy core commands are not
//! available on newer firmware.

mod flash;
mod usb;

use std::time::Duration;

use crate::chip::{self, ChipParams};
use crate::probe::{
    ConnectMode, CoreRegs, CoreStatus, ProbeDriver, ProbeError, ProbeOptions, ResetMode,
};
use crate::target::registers::{
    Dhcsr, AIRCR, AIRCR_VECTKEY, AIRCR_VECTRESET, DBGMCU_IDCODE, DCRDR, DCRSR, DCRSR_WRITE,
    DEMCR, DEMCR_VC_CORERESET, DHCSR, REGSEL_FPSCR, REGSEL_S0, REGSEL_SYSTEM,
};
use usb::StLinkUsbDevice;

mod commands {
    pub const GET_VERSION: u8 = 0xf1;
    pub const JTAG_COMMAND: u8 = 0xf2;
    pub const GET_VERSION_EXT: u8 = 0xfb;

    pub const JTAG_READMEM_32BIT: u8 = 0x07;
    pub const JTAG_WRITEMEM_32BIT: u8 = 0x08;
    pub const JTAG_WRITEMEM_8BIT: u8 = 0x0d;
    pub const JTAG_EXIT: u8 = 0x21;
    pub const JTAG_ENTER2: u8 = 0x30;
    pub const JTAG_WRITE_DEBUG_REG: u8 = 0x35;
    pub const JTAG_READ_DEBUG_REG: u8 = 0x36;
    pub const JTAG_DRIVE_NRST: u8 = 0x3c;
    pub const JTAG_GETLASTRWSTATUS2: u8 = 0x3e;
    pub const SWD_SET_FREQ: u8 = 0x43;
    pub const JTAG_READ_DAP_REG: u8 = 0x45;
    pub const JTAG_WRITEMEM_16BIT: u8 = 0x48;

    pub const JTAG_ENTER_SWD: u8 = 0xa3;

    pub const JTAG_DRIVE_NRST_LOW: u8 = 0x00;
    pub const JTAG_DRIVE_NRST_HIGH: u8 = 0x01;
    pub const JTAG_DRIVE_NRST_PULSE: u8 = 0x02;
}

const STATUS_JTAG_OK: u8 = 0x80;

/// Minimum firmware for the command set used here.
const MIN_JTAG_VERSION: u8 = 24;
/// Firmware that added 16-bit transfers.
const MIN_JTAG_VERSION_16BIT_XFER: u8 = 26;

/// Largest 32-bit block per USB transaction.
const MAX_TRANSFER_32: usize = 1024;
/// 8-bit transfers are limited to one full-speed USB packet.
const MAX_TRANSFER_8: usize = 64;

const HALT_TIMEOUT: Duration = Duration::from_secs(1);

pub struct StLinkProbe {
    device: StLinkUsbDevice,
    hw_version: u8,
    jtag_version: u8,
    chip_id: u32,
    core_id: u32,
    flash_size: u32,
    params: &'static ChipParams,
}

impl StLinkProbe {
    /// Opens the probe, brings up SWD and identifies the target.
    pub fn open(options: &ProbeOptions) -> Result<Self, ProbeError> {
        let device = StLinkUsbDevice::open(options.serial.as_deref())?;

        let mut probe = Self {
            device,
            hw_version: 0,
            jtag_version: 0,
            chip_id: 0,
            core_id: 0,
            flash_size: 0,
            params: chip::UNIDENTIFIED_PARAMS,
        };

        probe.read_version()?;
        tracing::info!(
            "ST-Link v{} (JTAG version {})",
            probe.hw_version,
            probe.jtag_version
        );

        if let Some(khz) = options.freq_khz {
            probe.set_swd_frequency(khz)?;
        }

        probe.enter_swd()?;
        probe.core_id = probe.read_dap_register(0xffff, 0)?;

        probe.identify()?;
        tracing::debug!(
            "{}: {} KiB flash, {} KiB sram",
            probe.params.description,
            probe.flash_size / 1024,
            probe.params.sram_size / 1024
        );

        if options.connect_mode == ConnectMode::UnderReset {
            probe.drive_nrst(commands::JTAG_DRIVE_NRST_LOW)?;
            probe.halt()?;
            probe.drive_nrst(commands::JTAG_DRIVE_NRST_HIGH)?;
        }

        Ok(probe)
    }

    fn command(&mut self, cmd: &[u8], response_len: usize) -> Result<Vec<u8>, ProbeError> {
        let mut response = vec![0u8; response_len];
        self.device.write(cmd, &[], &mut response)?;
        Ok(response)
    }

    /// A command whose two-byte response starts with a status code.
    fn checked_command(&mut self, cmd: &[u8]) -> Result<(), ProbeError> {
        let response = self.command(cmd, 2)?;
        if response[0] != STATUS_JTAG_OK {
            return Err(ProbeError::CommandFailed(response[0], cmd[1]));
        }
        Ok(())
    }

    fn read_version(&mut self) -> Result<(), ProbeError> {
        // Byte 0-1 big-endian: [15:12] HW version, [11:6] JTAG version.
        let buf = self.command(&[commands::GET_VERSION], 6)?;
        let version = u16::from_be_bytes([buf[0], buf[1]]);
        self.hw_version = (version >> 12) as u8 & 0x0f;
        self.jtag_version = (version >> 6) as u8 & 0x3f;

        if self.hw_version >= 3 {
            // The V3 reports its versions byte-wise instead.
            let buf = self.command(&[commands::GET_VERSION_EXT], 12)?;
            self.jtag_version = buf[2];
        }

        if self.jtag_version == 0 {
            return Err(ProbeError::UnsupportedOperation(
                "probe firmware supports SWIM only",
            ));
        }
        if self.jtag_version < MIN_JTAG_VERSION {
            return Err(ProbeError::FirmwareOutdated(self.jtag_version));
        }
        Ok(())
    }

    fn set_swd_frequency(&mut self, khz: u32) -> Result<(), ProbeError> {
        // Delay count per documented frequency step, next lower match wins.
        let delay = match khz {
            k if k >= 4600 => 0u8,
            k if k >= 1800 => 1,
            k if k >= 1200 => 2,
            k if k >= 950 => 3,
            k if k >= 650 => 5,
            k if k >= 480 => 7,
            k if k >= 400 => 9,
            k if k >= 360 => 10,
            k if k >= 240 => 15,
            k if k >= 150 => 25,
            k if k >= 125 => 31,
            _ => 40,
        };
        self.checked_command(&[commands::JTAG_COMMAND, commands::SWD_SET_FREQ, delay])
    }

    fn enter_swd(&mut self) -> Result<(), ProbeError> {
        self.checked_command(&[
            commands::JTAG_COMMAND,
            commands::JTAG_ENTER2,
            commands::JTAG_ENTER_SWD,
            0,
        ])
    }

    fn read_dap_register(&mut self, port: u16, addr: u16) -> Result<u32, ProbeError> {
        let cmd = [
            commands::JTAG_COMMAND,
            commands::JTAG_READ_DAP_REG,
            (port & 0xff) as u8,
            (port >> 8) as u8,
            (addr & 0xff) as u8,
            (addr >> 8) as u8,
        ];
        let response = self.command(&cmd, 8)?;
        if response[0] != STATUS_JTAG_OK {
            return Err(ProbeError::CommandFailed(
                response[0],
                commands::JTAG_READ_DAP_REG,
            ));
        }
        Ok(u32::from_le_bytes([
            response[4],
            response[5],
            response[6],
            response[7],
        ]))
    }

    fn drive_nrst(&mut self, state: u8) -> Result<(), ProbeError> {
        self.checked_command(&[commands::JTAG_COMMAND, commands::JTAG_DRIVE_NRST, state])
    }

    /// Reads the DBGMCU id and the factory flash size word.
    fn identify(&mut self) -> Result<(), ProbeError> {
        let idcode = self.read_debug32(DBGMCU_IDCODE)?;
        self.chip_id = idcode & 0xfff;

        self.params = chip::params_for(self.chip_id).ok_or_else(|| {
            tracing::error!(
                "unsupported target (chip id {:#010x}, core id {:#010x})",
                self.chip_id,
                self.core_id
            );
            ProbeError::UnknownChip(self.chip_id)
        })?;

        // The flash size lives in a half-word; KiB units.
        let reg = self.params.flash_size_reg;
        let word = self.read_debug32(reg & !3)?;
        let kib = if reg & 2 != 0 { word >> 16 } else { word } & 0xffff;
        self.flash_size = kib * 1024;
        Ok(())
    }

    /// Memory transfers share a status word that must be polled after each
    /// block.
    fn check_rw_status(&mut self, command: u8) -> Result<(), ProbeError> {
        let response = self.command(
            &[commands::JTAG_COMMAND, commands::JTAG_GETLASTRWSTATUS2],
            12,
        )?;
        let status = u16::from_le_bytes([response[0], response[1]]);
        if status != u16::from(STATUS_JTAG_OK) {
            let fault_addr = u32::from_le_bytes([response[4], response[5], response[6], response[7]]);
            tracing::debug!(
                "memory transfer failed, status {:#06x} at {:#010x}",
                status,
                fault_addr
            );
            return Err(ProbeError::CommandFailed(status as u8, command));
        }
        Ok(())
    }

    fn mem_command(memcmd: u8, addr: u32, length: u16) -> [u8; 8] {
        let addr = addr.to_le_bytes();
        let length = length.to_le_bytes();
        [
            commands::JTAG_COMMAND,
            memcmd,
            addr[0],
            addr[1],
            addr[2],
            addr[3],
            length[0],
            length[1],
        ]
    }

    fn read_mem_chunked(
        &mut self,
        mut addr: u32,
        length: u32,
        memcmd: u8,
        max: usize,
    ) -> Result<Vec<u8>, ProbeError> {
        let mut out = Vec::with_capacity(length as usize);
        let mut remaining = length as usize;
        while remaining > 0 {
            let chunk = remaining.min(max);
            let cmd = Self::mem_command(memcmd, addr, chunk as u16);
            let mut buf = vec![0u8; chunk];
            self.device.write(&cmd, &[], &mut buf)?;
            self.check_rw_status(memcmd)?;
            out.extend_from_slice(&buf);
            addr += chunk as u32;
            remaining -= chunk;
        }
        Ok(out)
    }

    fn write_mem_chunked(
        &mut self,
        mut addr: u32,
        data: &[u8],
        memcmd: u8,
        max: usize,
    ) -> Result<(), ProbeError> {
        for chunk in data.chunks(max) {
            let cmd = Self::mem_command(memcmd, addr, chunk.len() as u16);
            self.device.write(&cmd, chunk, &mut [])?;
            self.check_rw_status(memcmd)?;
            addr += chunk.len() as u32;
        }
        Ok(())
    }

    /// Half-word writes, needed by the page-erase flash controllers.
    /// Requires a firmware recent enough to expose 16-bit transfers.
    pub(super) fn write_mem16(&mut self, addr: u32, data: &[u8]) -> Result<(), ProbeError> {
        if self.jtag_version < MIN_JTAG_VERSION_16BIT_XFER {
            return Err(ProbeError::UnsupportedOperation(
                "16-bit transfers need ST-Link firmware J26 or newer",
            ));
        }
        if addr % 2 != 0 || data.len() % 2 != 0 {
            return Err(ProbeError::Alignment(addr));
        }
        self.write_mem_chunked(addr, data, commands::JTAG_WRITEMEM_16BIT, MAX_TRANSFER_8)
    }

    fn core_reg_read(&mut self, regsel: u32) -> Result<u32, ProbeError> {
        self.write_debug32(DCRSR, regsel)?;
        self.wait_regrdy()?;
        self.read_debug32(DCRDR)
    }

    fn core_reg_write(&mut self, regsel: u32, value: u32) -> Result<(), ProbeError> {
        self.write_debug32(DCRDR, value)?;
        self.write_debug32(DCRSR, regsel | DCRSR_WRITE)?;
        self.wait_regrdy()
    }

    fn wait_regrdy(&mut self) -> Result<(), ProbeError> {
        let start = std::time::Instant::now();
        loop {
            if Dhcsr::from(self.read_debug32(DHCSR)?).s_regrdy() {
                return Ok(());
            }
            if start.elapsed() > HALT_TIMEOUT {
                return Err(ProbeError::Timeout("core register transfer"));
            }
        }
    }

    fn wait_halted(&mut self) -> Result<(), ProbeError> {
        let start = std::time::Instant::now();
        loop {
            if Dhcsr::from(self.read_debug32(DHCSR)?).s_halt() {
                return Ok(());
            }
            if start.elapsed() > HALT_TIMEOUT {
                return Err(ProbeError::Timeout("core halt"));
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn write_dhcsr(&mut self, configure: impl FnOnce(&mut Dhcsr)) -> Result<(), ProbeError> {
        let mut dhcsr = Dhcsr::from(0);
        configure(&mut dhcsr);
        dhcsr.enable_write();
        self.write_debug32(DHCSR, dhcsr.into())
    }
}

impl ProbeDriver for StLinkProbe {
    fn read_debug32(&mut self, addr: u32) -> Result<u32, ProbeError> {
        let addr = addr.to_le_bytes();
        let cmd = [
            commands::JTAG_COMMAND,
            commands::JTAG_READ_DEBUG_REG,
            addr[0],
            addr[1],
            addr[2],
            addr[3],
        ];
        let response = self.command(&cmd, 8)?;
        if response[0] != STATUS_JTAG_OK {
            return Err(ProbeError::CommandFailed(
                response[0],
                commands::JTAG_READ_DEBUG_REG,
            ));
        }
        Ok(u32::from_le_bytes([
            response[4],
            response[5],
            response[6],
            response[7],
        ]))
    }

    fn write_debug32(&mut self, addr: u32, value: u32) -> Result<(), ProbeError> {
        let addr = addr.to_le_bytes();
        let value = value.to_le_bytes();
        self.checked_command(&[
            commands::JTAG_COMMAND,
            commands::JTAG_WRITE_DEBUG_REG,
            addr[0],
            addr[1],
            addr[2],
            addr[3],
            value[0],
            value[1],
            value[2],
            value[3],
        ])
    }

    fn read_mem32(&mut self, addr: u32, length: u32) -> Result<Vec<u8>, ProbeError> {
        if addr % 4 != 0 || length % 4 != 0 {
            return Err(ProbeError::Alignment(addr));
        }
        self.read_mem_chunked(addr, length, commands::JTAG_READMEM_32BIT, MAX_TRANSFER_32)
    }

    fn write_mem32(&mut self, addr: u32, data: &[u8]) -> Result<(), ProbeError> {
        if addr % 4 != 0 || data.len() % 4 != 0 {
            return Err(ProbeError::Alignment(addr));
        }
        self.write_mem_chunked(addr, data, commands::JTAG_WRITEMEM_32BIT, MAX_TRANSFER_32)
    }

    fn write_mem8(&mut self, addr: u32, data: &[u8]) -> Result<(), ProbeError> {
        self.write_mem_chunked(addr, data, commands::JTAG_WRITEMEM_8BIT, MAX_TRANSFER_8)
    }

    fn read_all_regs(&mut self) -> Result<CoreRegs, ProbeError> {
        let mut regs = CoreRegs::default();
        for (index, slot) in regs.r.iter_mut().enumerate() {
            *slot = self.core_reg_read(index as u32)?;
        }
        regs.xpsr = self.core_reg_read(16)?;
        regs.main_sp = self.core_reg_read(17)?;
        regs.process_sp = self.core_reg_read(18)?;
        Ok(regs)
    }

    fn read_reg(&mut self, id: u8) -> Result<u32, ProbeError> {
        if id > 18 {
            return Err(ProbeError::InvalidRegister(u32::from(id)));
        }
        self.core_reg_read(u32::from(id))
    }

    fn write_reg(&mut self, value: u32, id: u8) -> Result<(), ProbeError> {
        if id > 18 {
            return Err(ProbeError::InvalidRegister(u32::from(id)));
        }
        self.core_reg_write(u32::from(id), value)
    }

    fn read_unsupported_reg(&mut self, id: u32) -> Result<u32, ProbeError> {
        match id {
            // CONTROL sits in the top byte of the packed system word.
            0x1c..=0x1f => {
                let packed = self.core_reg_read(REGSEL_SYSTEM)?;
                let shift = (3 - (id - 0x1c)) * 8;
                Ok((packed >> shift) & 0xff)
            }
            0x20..=0x3f => self.core_reg_read(REGSEL_S0 + (id - 0x20)),
            0x40 => self.core_reg_read(REGSEL_FPSCR),
            _ => Err(ProbeError::InvalidRegister(id)),
        }
    }

    fn write_unsupported_reg(&mut self, value: u32, id: u32) -> Result<(), ProbeError> {
        match id {
            0x1c..=0x1f => {
                let shift = (3 - (id - 0x1c)) * 8;
                let mut packed = self.core_reg_read(REGSEL_SYSTEM)?;
                packed &= !(0xff << shift);
                packed |= (value & 0xff) << shift;
                self.core_reg_write(REGSEL_SYSTEM, packed)
            }
            0x20..=0x3f => self.core_reg_write(REGSEL_S0 + (id - 0x20), value),
            0x40 => self.core_reg_write(REGSEL_FPSCR, value),
            _ => Err(ProbeError::InvalidRegister(id)),
        }
    }

    fn halt(&mut self) -> Result<(), ProbeError> {
        self.write_dhcsr(|dhcsr| {
            dhcsr.set_c_halt(true);
            dhcsr.set_c_debugen(true);
        })?;
        self.wait_halted()
    }

    fn step(&mut self) -> Result<(), ProbeError> {
        self.write_dhcsr(|dhcsr| {
            dhcsr.set_c_step(true);
            dhcsr.set_c_debugen(true);
        })?;
        self.wait_halted()
    }

    fn run(&mut self) -> Result<(), ProbeError> {
        self.write_dhcsr(|dhcsr| dhcsr.set_c_debugen(true))
    }

    fn status(&mut self) -> Result<CoreStatus, ProbeError> {
        let dhcsr = Dhcsr::from(self.read_debug32(DHCSR)?);
        Ok(if dhcsr.s_halt() {
            CoreStatus::Halted
        } else {
            CoreStatus::Running
        })
    }

    fn reset(&mut self, mode: ResetMode) -> Result<(), ProbeError> {
        match mode {
            ResetMode::SoftAndHalt => {
                self.halt()?;
                // Catch the reset vector so the core halts before the
                // first instruction.
                let demcr = self.read_debug32(DEMCR)?;
                self.write_debug32(DEMCR, demcr | DEMCR_VC_CORERESET)?;
                self.write_debug32(AIRCR, AIRCR_VECTKEY | AIRCR_VECTRESET)?;
                let result = self.wait_halted();
                self.write_debug32(DEMCR, demcr & !DEMCR_VC_CORERESET)?;
                result
            }
            ResetMode::Hard => self.drive_nrst(commands::JTAG_DRIVE_NRST_PULSE),
        }
    }

    fn connect(&mut self, mode: ConnectMode) -> Result<(), ProbeError> {
        match mode {
            ConnectMode::Normal => self.reset(ResetMode::SoftAndHalt),
            ConnectMode::HotPlug => Ok(()),
            ConnectMode::UnderReset => {
                self.drive_nrst(commands::JTAG_DRIVE_NRST_LOW)?;
                self.halt()?;
                self.drive_nrst(commands::JTAG_DRIVE_NRST_HIGH)
            }
        }
    }

    fn exit_debug_mode(&mut self) -> Result<(), ProbeError> {
        self.device
            .write(&[commands::JTAG_COMMAND, commands::JTAG_EXIT], &[], &mut [])?;
        Ok(())
    }

    fn close(&mut self) {
        self.device.release();
    }

    fn erase_page(&mut self, addr: u32) -> Result<(), ProbeError> {
        flash::erase_page(self, addr)
    }

    fn flashloader_start(&mut self) -> Result<(), ProbeError> {
        flash::program_start(self)
    }

    fn flashloader_write(&mut self, addr: u32, data: &[u8]) -> Result<(), ProbeError> {
        flash::program_write(self, addr, data)
    }

    fn flashloader_stop(&mut self) -> Result<(), ProbeError> {
        flash::program_stop(self)
    }

    fn chip_id(&self) -> u32 {
        self.chip_id
    }

    fn core_id(&self) -> u32 {
        self.core_id
    }

    fn flash_size(&self) -> u32 {
        self.flash_size
    }

    fn flash_pgsz(&self, addr: u32) -> u32 {
        chip::page_size_at(self.params, addr)
    }

    fn sram_size(&self) -> u32 {
        self.params.sram_size
    }

    fn sys_base(&self) -> u32 {
        self.params.sys_base
    }

    fn sys_size(&self) -> u32 {
        self.params.sys_size
    }

    fn erased_pattern(&self) -> u8 {
        0xff
    }
}
