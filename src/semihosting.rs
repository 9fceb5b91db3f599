//! Host-side servicing of ARM semihosting calls.
//!
//! A target traps into the debugger with `BKPT #0xAB`, operation code in r0
//! and a parameter block pointer in r1. The session's continue loop detects
//! the trap and hands both values to [`Semihosting::service`], which
//! performs the host I/O and produces the value to put back into r0.
//!
//! Operations follow the ARM semihosting specification
//! (<https://github.com/ARM-software/abi-aa/blob/main/semihosting/semihosting.rst>).

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::probe::{ProbeDriver, ProbeError};

const SYS_OPEN: u32 = 0x01;
const SYS_CLOSE: u32 = 0x02;
const SYS_WRITEC: u32 = 0x03;
const SYS_WRITE0: u32 = 0x04;
const SYS_WRITE: u32 = 0x05;
const SYS_READ: u32 = 0x06;
const SYS_READC: u32 = 0x07;
const SYS_ISTTY: u32 = 0x09;
const SYS_SEEK: u32 = 0x0a;
const SYS_FLEN: u32 = 0x0c;
const SYS_REMOVE: u32 = 0x0e;
const SYS_RENAME: u32 = 0x0f;
const SYS_CLOCK: u32 = 0x10;
const SYS_TIME: u32 = 0x11;
const SYS_ERRNO: u32 = 0x13;
const SYS_EXIT: u32 = 0x18;

const ERROR: u32 = u32::MAX;

/// What the continue loop should do after a serviced call.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Write `retval` to r0, skip the BKPT and resume.
    Continue { retval: u32 },
    /// The target asked to exit; leave it halted and report the stop.
    Exit { code: u32 },
}

#[derive(Debug)]
enum Handle {
    Stdin,
    Stdout,
    Stderr,
    File(File),
}

/// Open-handle table and host-side state. Lives as long as the process, so
/// files survive target resets the way they do with a real debugger.
pub struct Semihosting {
    handles: Vec<Option<Handle>>,
    started: Instant,
    errno: i32,
}

impl Default for Semihosting {
    fn default() -> Self {
        Self::new()
    }
}

impl Semihosting {
    pub fn new() -> Self {
        Self {
            handles: Vec::new(),
            started: Instant::now(),
            errno: 0,
        }
    }

    /// Services one semihosting operation. Probe errors while reading or
    /// writing target memory propagate; host I/O failures turn into a -1
    /// return value and an errno for `SYS_ERRNO`.
    pub fn service(
        &mut self,
        probe: &mut dyn ProbeDriver,
        operation: u32,
        parameter: u32,
    ) -> Result<Outcome, ProbeError> {
        tracing::debug!("semihosting op {:#04x} param {:#010x}", operation, parameter);

        let retval = match operation {
            SYS_OPEN => self.sys_open(probe, parameter)?,
            SYS_CLOSE => self.sys_close(probe, parameter)?,
            SYS_WRITEC => self.sys_writec(probe, parameter)?,
            SYS_WRITE0 => self.sys_write0(probe, parameter)?,
            SYS_WRITE => self.sys_write(probe, parameter)?,
            SYS_READ => self.sys_read(probe, parameter)?,
            SYS_READC => self.sys_readc(),
            SYS_ISTTY => self.sys_istty(probe, parameter)?,
            SYS_SEEK => self.sys_seek(probe, parameter)?,
            SYS_FLEN => self.sys_flen(probe, parameter)?,
            SYS_REMOVE => self.sys_remove(probe, parameter)?,
            SYS_RENAME => self.sys_rename(probe, parameter)?,
            SYS_CLOCK => self.sys_clock(),
            SYS_TIME => Self::sys_time(),
            SYS_ERRNO => self.errno as u32,
            SYS_EXIT => {
                tracing::info!("target requested exit ({:#x})", parameter);
                return Ok(Outcome::Exit { code: parameter });
            }
            _ => {
                tracing::debug!("unsupported semihosting operation {:#04x}", operation);
                ERROR
            }
        };

        Ok(Outcome::Continue { retval })
    }

    fn host_error(&mut self, error: &std::io::Error) -> u32 {
        self.errno = error.raw_os_error().unwrap_or(5);
        ERROR
    }

    fn slot(&mut self, handle: u32) -> Option<&mut Handle> {
        self.handles
            .get_mut(handle.checked_sub(1)? as usize)?
            .as_mut()
    }

    fn sys_open(&mut self, probe: &mut dyn ProbeDriver, parameter: u32) -> Result<u32, ProbeError> {
        let block = read_words(probe, parameter, 3)?;
        let [name_ptr, mode, name_len] = [block[0], block[1], block[2]];
        let name_bytes = read_bytes(probe, name_ptr, name_len)?;
        let name = String::from_utf8_lossy(&name_bytes).into_owned();

        // ":tt" is the console: read modes get stdin, write modes stdout,
        // append modes stderr.
        let handle = if name == ":tt" {
            match mode {
                0..=3 => Handle::Stdin,
                4..=7 => Handle::Stdout,
                _ => Handle::Stderr,
            }
        } else {
            let mut options = OpenOptions::new();
            match mode {
                0 | 1 => options.read(true),
                2 | 3 => options.read(true).write(true),
                4 | 5 => options.write(true).create(true).truncate(true),
                6 | 7 => options.read(true).write(true).create(true).truncate(true),
                8 | 9 => options.append(true).create(true),
                _ => options.read(true).append(true).create(true),
            };
            match options.open(&name) {
                Ok(file) => Handle::File(file),
                Err(e) => {
                    tracing::debug!("open {:?} failed: {}", name, e);
                    return Ok(self.host_error(&e));
                }
            }
        };

        let index = self
            .handles
            .iter()
            .position(Option::is_none)
            .unwrap_or_else(|| {
                self.handles.push(None);
                self.handles.len() - 1
            });
        self.handles[index] = Some(handle);
        Ok(index as u32 + 1)
    }

    fn sys_close(&mut self, probe: &mut dyn ProbeDriver, parameter: u32) -> Result<u32, ProbeError> {
        let handle = read_words(probe, parameter, 1)?[0];
        match handle
            .checked_sub(1)
            .and_then(|i| self.handles.get_mut(i as usize))
        {
            Some(slot @ Some(_)) => {
                *slot = None;
                Ok(0)
            }
            _ => Ok(ERROR),
        }
    }

    fn sys_writec(&mut self, probe: &mut dyn ProbeDriver, parameter: u32) -> Result<u32, ProbeError> {
        let byte = read_bytes(probe, parameter, 1)?;
        let mut stdout = std::io::stdout();
        let _ = stdout.write_all(&byte);
        let _ = stdout.flush();
        Ok(0)
    }

    fn sys_write0(&mut self, probe: &mut dyn ProbeDriver, parameter: u32) -> Result<u32, ProbeError> {
        let mut message = Vec::new();
        let mut addr = parameter;
        'scan: loop {
            let chunk = read_bytes(probe, addr, 32)?;
            for &byte in &chunk {
                if byte == 0 {
                    break 'scan;
                }
                message.push(byte);
            }
            addr += 32;
        }
        let mut stdout = std::io::stdout();
        let _ = stdout.write_all(&message);
        let _ = stdout.flush();
        Ok(0)
    }

    fn sys_write(&mut self, probe: &mut dyn ProbeDriver, parameter: u32) -> Result<u32, ProbeError> {
        let block = read_words(probe, parameter, 3)?;
        let [handle, buf_ptr, length] = [block[0], block[1], block[2]];
        let data = read_bytes(probe, buf_ptr, length)?;

        let result = match self.slot(handle) {
            Some(Handle::Stdout) | Some(Handle::Stdin) => {
                let mut stdout = std::io::stdout();
                stdout.write_all(&data).and_then(|_| stdout.flush())
            }
            Some(Handle::Stderr) => {
                let mut stderr = std::io::stderr();
                stderr.write_all(&data).and_then(|_| stderr.flush())
            }
            Some(Handle::File(file)) => file.write_all(&data),
            None => return Ok(length),
        };

        // Returns the number of bytes NOT written.
        match result {
            Ok(()) => Ok(0),
            Err(e) => {
                self.host_error(&e);
                Ok(length)
            }
        }
    }

    fn sys_read(&mut self, probe: &mut dyn ProbeDriver, parameter: u32) -> Result<u32, ProbeError> {
        let block = read_words(probe, parameter, 3)?;
        let [handle, buf_ptr, length] = [block[0], block[1], block[2]];

        let mut data = vec![0u8; length as usize];
        let read = match self.slot(handle) {
            Some(Handle::Stdin) => std::io::stdin().read(&mut data),
            Some(Handle::File(file)) => file.read(&mut data),
            Some(_) | None => Ok(0),
        };

        // Returns the number of bytes NOT read (length means EOF).
        match read {
            Ok(count) => {
                probe.write_mem8(buf_ptr, &data[..count])?;
                Ok(length - count as u32)
            }
            Err(e) => {
                self.host_error(&e);
                Ok(length)
            }
        }
    }

    fn sys_readc(&mut self) -> u32 {
        let mut byte = [0u8; 1];
        match std::io::stdin().read_exact(&mut byte) {
            Ok(()) => u32::from(byte[0]),
            Err(e) => self.host_error(&e),
        }
    }

    fn sys_istty(&mut self, probe: &mut dyn ProbeDriver, parameter: u32) -> Result<u32, ProbeError> {
        let handle = read_words(probe, parameter, 1)?[0];
        Ok(match self.slot(handle) {
            Some(Handle::File(_)) => 0,
            Some(_) => 1,
            None => ERROR,
        })
    }

    fn sys_seek(&mut self, probe: &mut dyn ProbeDriver, parameter: u32) -> Result<u32, ProbeError> {
        let block = read_words(probe, parameter, 2)?;
        let [handle, position] = [block[0], block[1]];
        match self.slot(handle) {
            Some(Handle::File(file)) => match file.seek(SeekFrom::Start(u64::from(position))) {
                Ok(_) => Ok(0),
                Err(e) => Ok(self.host_error(&e)),
            },
            Some(_) | None => Ok(ERROR),
        }
    }

    fn sys_flen(&mut self, probe: &mut dyn ProbeDriver, parameter: u32) -> Result<u32, ProbeError> {
        let handle = read_words(probe, parameter, 1)?[0];
        match self.slot(handle) {
            Some(Handle::File(file)) => match file.metadata() {
                Ok(meta) => Ok(meta.len() as u32),
                Err(e) => Ok(self.host_error(&e)),
            },
            Some(_) | None => Ok(ERROR),
        }
    }

    fn sys_remove(&mut self, probe: &mut dyn ProbeDriver, parameter: u32) -> Result<u32, ProbeError> {
        let block = read_words(probe, parameter, 2)?;
        let name_bytes = read_bytes(probe, block[0], block[1])?;
        let name = String::from_utf8_lossy(&name_bytes).into_owned();
        match std::fs::remove_file(&name) {
            Ok(()) => Ok(0),
            Err(e) => Ok(self.host_error(&e)),
        }
    }

    fn sys_rename(&mut self, probe: &mut dyn ProbeDriver, parameter: u32) -> Result<u32, ProbeError> {
        let block = read_words(probe, parameter, 4)?;
        let from_bytes = read_bytes(probe, block[0], block[1])?;
        let to_bytes = read_bytes(probe, block[2], block[3])?;
        let from = String::from_utf8_lossy(&from_bytes).into_owned();
        let to = String::from_utf8_lossy(&to_bytes).into_owned();
        match std::fs::rename(&from, &to) {
            Ok(()) => Ok(0),
            Err(e) => Ok(self.host_error(&e)),
        }
    }

    fn sys_clock(&self) -> u32 {
        // Centiseconds since an arbitrary start point.
        (self.started.elapsed().as_millis() / 10) as u32
    }

    fn sys_time() -> u32 {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(elapsed) => elapsed.as_secs() as u32,
            Err(_) => 0,
        }
    }
}

/// Reads `count` little-endian words from a word-aligned parameter block.
fn read_words(
    probe: &mut dyn ProbeDriver,
    addr: u32,
    count: u32,
) -> Result<Vec<u32>, ProbeError> {
    let bytes = read_bytes(probe, addr, count * 4)?;
    Ok(bytes
        .chunks_exact(4)
        .map(|word| u32::from_le_bytes([word[0], word[1], word[2], word[3]]))
        .collect())
}

/// Byte-granular target read on top of the probe's word transfers: the
/// window is expanded to word boundaries and trimmed afterwards.
pub fn read_bytes(
    probe: &mut dyn ProbeDriver,
    addr: u32,
    length: u32,
) -> Result<Vec<u8>, ProbeError> {
    if length == 0 {
        return Ok(Vec::new());
    }
    let lead = addr % 4;
    let aligned = addr - lead;
    let span = (lead + length).div_ceil(4) * 4;
    let bytes = probe.read_mem32(aligned, span)?;
    Ok(bytes[lead as usize..(lead + length) as usize].to_vec())
}
