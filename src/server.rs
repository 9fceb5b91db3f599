//! The GDB session engine.
//!
//! One client at a time: bind, accept, close the listener, then run the
//! dispatch loop until the client goes away or something fatal happens.
//! All mutable target-side state (comparator tables, cache descriptor,
//! flash staging) lives in the per-connection [`Session`], so a fresh
//! connection always starts from rediscovered hardware state.

use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;

use crate::chip;
use crate::flash::FlashStage;
use crate::parser::{self, BreakpointKind, Packet, QueryPacket, VPacket};
use crate::probe::{ConnectMode, CoreStatus, ProbeDriver, ProbeError, ResetMode};
use crate::protocol::{encode_hex, GdbRemote, Transport};
use crate::semihosting::{self, Semihosting};
use crate::target::breakpoints::BreakpointUnit;
use crate::target::cache::CacheDescriptor;
use crate::target::registers::GdbRegister;
use crate::target::watchpoints::{WatchFun, WatchpointUnit};

/// Thumb `BKPT #0xAB`, the semihosting trap instruction.
const BKPT_AB: u16 = 0xBEAB;

/// Upper bound on a single memory-read reply, inherited from the probe's
/// transfer limits.
const MAX_READ_CHUNK: u32 = 0x1800;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub type SharedProbe = Arc<Mutex<Box<dyn ProbeDriver>>>;
pub type ProbeOpener = Box<dyn FnMut() -> Result<Box<dyn ProbeDriver>, ProbeError> + Send>;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("client i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("probe error: {0}")]
    Probe(#[from] ProbeError),
    #[error("session aborted after critical error")]
    Critical,
    #[error("probe disappeared while reopening")]
    ProbeLost,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_port: u16,
    pub persistent: bool,
    pub connect_mode: ConnectMode,
    pub semihosting: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_port: 4242,
            persistent: false,
            connect_mode: ConnectMode::Normal,
            semihosting: false,
        }
    }
}

/// State owned by one accepted connection.
struct Session {
    attached: bool,
    critical_error: bool,
    semihosting: bool,
    memory_map: String,
    breakpoints: BreakpointUnit,
    watchpoints: WatchpointUnit,
    cache: CacheDescriptor,
    flash: FlashStage,
    semihost: Semihosting,
}

pub struct GdbServer {
    probe: SharedProbe,
    opener: ProbeOpener,
    config: ServerConfig,
}

impl GdbServer {
    pub fn new(probe: SharedProbe, opener: ProbeOpener, config: ServerConfig) -> Self {
        Self {
            probe,
            opener,
            config,
        }
    }

    /// Serves sessions until a non-persistent session ends or the probe is
    /// lost. Between sessions the target is returned to normal execution.
    pub fn run(&mut self) -> Result<(), ServerError> {
        loop {
            let result = self.serve();
            match &result {
                Err(ServerError::ProbeLost) => return result,
                Err(e) => {
                    tracing::error!("session ended: {e}");
                    std::thread::sleep(Duration::from_millis(1));
                }
                Ok(()) => {}
            }

            let _ = self.probe().run();

            if !self.config.persistent {
                return result;
            }
        }
    }

    fn probe(&self) -> MutexGuard<'_, Box<dyn ProbeDriver>> {
        self.probe.lock().unwrap()
    }

    fn serve(&mut self) -> Result<(), ServerError> {
        let listener = listen(self.config.listen_port)?;
        tracing::info!("Listening at *:{}...", self.config.listen_port);

        let (stream, peer) = listener.accept()?;
        // One client at a time; no new connections until this one is done.
        drop(listener);
        tracing::debug!("accepted connection from {peer}");

        let mut remote = GdbRemote::new(stream);
        self.serve_client(&mut remote)
    }

    /// Initializes the target side of a session and runs the command loop.
    fn serve_client<T: Transport>(&mut self, remote: &mut GdbRemote<T>) -> Result<(), ServerError> {
        let mut session = {
            let mut probe = self.probe();
            let probe = &mut **probe;

            let chip_id = probe.chip_id();
            probe.connect(self.config.connect_mode)?;
            probe.halt()?;
            if probe.chip_id() != chip_id {
                tracing::warn!("target has changed!");
            }

            Session {
                attached: true,
                critical_error: false,
                semihosting: self.config.semihosting,
                memory_map: chip::make_memory_map(probe),
                breakpoints: BreakpointUnit::init(probe)?,
                watchpoints: WatchpointUnit::init(probe)?,
                cache: CacheDescriptor::init(probe)?,
                flash: FlashStage::new(),
                semihost: Semihosting::new(),
            }
        };

        tracing::info!("GDB connected.");

        loop {
            let payload = remote.recv_packet()?;
            tracing::debug!("recv: {}", String::from_utf8_lossy(&payload));

            let packet = parser::parse_packet(&payload);
            let reply = self.handle_packet(remote, &mut session, packet)?;

            if let Some(reply) = reply {
                tracing::debug!("send: {}", String::from_utf8_lossy(&reply));
                remote.send_packet(&reply)?;
            }

            if session.critical_error {
                return Err(ServerError::Critical);
            }
        }
    }

    fn handle_packet<T: Transport>(
        &mut self,
        remote: &mut GdbRemote<T>,
        session: &mut Session,
        packet: Packet,
    ) -> Result<Option<Vec<u8>>, ServerError> {
        let reply = match packet {
            Packet::HaltReason => {
                // The stub must answer OK when GDB believes it detached.
                if session.attached {
                    reply(b"S05")
                } else {
                    reply(b"OK")
                }
            }

            Packet::ReadAllRegisters => self.read_all_registers(),
            Packet::WriteAllRegisters { values } => self.write_all_registers(&values),
            Packet::ReadRegister { id } => self.read_register(id),
            Packet::WriteRegister { id, value } => self.write_register(id, value),

            Packet::ReadMemory { addr, length } => self.read_memory(addr, length),
            Packet::WriteMemory { addr, data } => self.write_memory(session, addr, &data),

            Packet::Continue => self.handle_continue(remote, session)?,
            Packet::SingleStep => self.single_step(session),

            Packet::InsertBreakpoint { kind, addr, length } => {
                self.insert_breakpoint(session, kind, addr, length)
            }
            Packet::RemoveBreakpoint { kind, addr, .. } => {
                self.remove_breakpoint(session, kind, addr)
            }

            Packet::ExtendedMode => {
                // Extended mode allows restarting; keep listening after the
                // client disconnects.
                self.config.persistent = true;
                reply(b"OK")
            }

            Packet::Restart => self.restart(session)?,
            Packet::Kill => return self.kill(session).map(|_| None),

            Packet::Query(query) => self.handle_query(session, query)?,
            Packet::V(verb) => self.handle_v_packet(session, verb),

            Packet::Interrupt | Packet::Unknown => reply(b""),
        };

        Ok(reply)
    }

    fn read_all_registers(&mut self) -> Option<Vec<u8>> {
        let mut probe = self.probe();
        let regs = match probe.read_all_regs() {
            Ok(regs) => regs,
            Err(e) => {
                tracing::debug!("g packet: read_all_regs failed: {e}");
                Default::default()
            }
        };

        let mut out = Vec::with_capacity(16 * 8);
        for value in regs.r {
            out.extend_from_slice(format!("{:08x}", value.swap_bytes()).as_bytes());
        }
        Some(out)
    }

    fn write_all_registers(&mut self, values: &[u32]) -> Option<Vec<u8>> {
        let mut probe = self.probe();
        for (id, value) in values.iter().take(16).enumerate() {
            if let Err(e) = probe.write_reg(value.swap_bytes(), id as u8) {
                tracing::debug!("G packet: write_reg {id} failed: {e}");
            }
        }
        reply(b"OK")
    }

    fn read_register(&mut self, id: u32) -> Option<Vec<u8>> {
        let mut probe = self.probe();
        let value = match GdbRegister::from_id(id) {
            Some(GdbRegister::Gpr(index)) => probe.read_reg(index),
            Some(GdbRegister::Xpsr) => probe.read_reg(16),
            Some(GdbRegister::Msp) => probe.read_reg(17),
            Some(GdbRegister::Psp) => probe.read_reg(18),
            Some(GdbRegister::Special(id)) => probe.read_unsupported_reg(id),
            None => {
                return reply(b"E00");
            }
        };

        match value {
            Ok(value) => Some(format!("{:08x}", value.swap_bytes()).into_bytes()),
            Err(e) => {
                tracing::debug!("p packet: could not read register {id:#x}: {e}");
                reply(b"E00")
            }
        }
    }

    fn write_register(&mut self, id: u32, value: u32) -> Option<Vec<u8>> {
        let mut probe = self.probe();
        let value = value.swap_bytes();
        let result = match GdbRegister::from_id(id) {
            Some(GdbRegister::Gpr(index)) => probe.write_reg(value, index),
            Some(GdbRegister::Xpsr) => probe.write_reg(value, 16),
            Some(GdbRegister::Msp) => probe.write_reg(value, 17),
            Some(GdbRegister::Psp) => probe.write_reg(value, 18),
            Some(GdbRegister::Special(id)) => probe.write_unsupported_reg(value, id),
            None => {
                return reply(b"E00");
            }
        };

        match result {
            Ok(()) => reply(b"OK"),
            Err(e) => {
                tracing::debug!("P packet: could not write register {id:#x}: {e}");
                reply(b"E00")
            }
        }
    }

    /// Reads are widened to word accesses and trimmed back, so unaligned
    /// requests behave as if the probe could read single bytes. The rounded
    /// window is capped at the flash page size and the transfer ceiling.
    fn read_memory(&mut self, addr: u32, length: u32) -> Option<Vec<u8>> {
        let mut probe = self.probe();

        let lead = addr % 4;
        let mut count = length;
        let mut rounded = (count + lead).div_ceil(4) * 4;

        rounded = rounded.min(probe.flash_pgsz(addr)).min(MAX_READ_CHUNK);
        count = count.min(rounded.saturating_sub(lead));
        if count == 0 {
            return reply(b"");
        }

        match probe.read_mem32(addr - lead, rounded) {
            Ok(data) => {
                let window = &data[lead as usize..(lead + count) as usize];
                Some(encode_hex(window))
            }
            // Don't return a stale buffer; an empty reply tells GDB the
            // read failed.
            Err(e) => {
                tracing::debug!("m packet: read at {addr:#010x} failed: {e}");
                reply(b"")
            }
        }
    }

    /// Head and tail bytes go out as 8-bit writes, the aligned middle as
    /// one 32-bit transfer. Every stage marks the cache dirty.
    fn write_memory(&mut self, session: &mut Session, addr: u32, data: &[u8]) -> Option<Vec<u8>> {
        let mut probe = self.probe();
        let mut start = addr;
        let mut rest = data;
        let mut failed = false;

        if start % 4 != 0 && !rest.is_empty() {
            let head = ((4 - start % 4) as usize).min(rest.len());
            failed |= probe.write_mem8(start, &rest[..head]).is_err();
            session.cache.change(head as u32);
            start += head as u32;
            rest = &rest[head..];
        }

        let aligned = rest.len() - rest.len() % 4;
        if aligned > 0 {
            failed |= probe.write_mem32(start, &rest[..aligned]).is_err();
            session.cache.change(aligned as u32);
            start += aligned as u32;
            rest = &rest[aligned..];
        }

        if !rest.is_empty() {
            failed |= probe.write_mem8(start, rest).is_err();
            session.cache.change(rest.len() as u32);
        }

        if failed {
            reply(b"E00")
        } else {
            reply(b"OK")
        }
    }

    /// The continue loop: poll the halted/running state every 100 ms,
    /// watching the socket for a break byte. Semihosting traps are serviced
    /// and execution resumed without GDB noticing; everything else stops
    /// the loop and reports a trap.
    fn handle_continue<T: Transport>(
        &mut self,
        remote: &mut GdbRemote<T>,
        session: &mut Session,
    ) -> Result<Option<Vec<u8>>, ServerError> {
        {
            let mut probe = self.probe();
            sync_cache(session, &mut **probe);
            if let Err(e) = probe.run() {
                tracing::debug!("continue: run failed: {e}");
            }
        }

        loop {
            if remote.check_for_interrupt()? {
                let mut probe = self.probe();
                if let Err(e) = probe.halt() {
                    tracing::debug!("interrupt: halt failed: {e}");
                }
                break;
            }

            let status = self.probe().status();
            match status {
                Err(e) => tracing::debug!("continue: status failed: {e}"),
                Ok(CoreStatus::Halted) => {
                    let mut probe = self.probe();
                    if !resume_from_semihost(session, &mut **probe) {
                        break;
                    }
                }
                Ok(_) => {}
            }

            std::thread::sleep(POLL_INTERVAL);
        }

        Ok(reply(b"S05"))
    }

    fn single_step(&mut self, session: &mut Session) -> Option<Vec<u8>> {
        let mut probe = self.probe();
        sync_cache(session, &mut **probe);
        match probe.step() {
            Ok(()) => reply(b"S05"),
            Err(e) => {
                // A step that cannot even be issued leaves the session in
                // an unknown state; tear it down after replying.
                tracing::error!("step: cannot send step request: {e}");
                session.critical_error = true;
                reply(b"E00")
            }
        }
    }

    fn insert_breakpoint(
        &mut self,
        session: &mut Session,
        kind: BreakpointKind,
        addr: u32,
        length: u32,
    ) -> Option<Vec<u8>> {
        let mut probe = self.probe();
        let result = match kind {
            BreakpointKind::Hardware => session
                .breakpoints
                .insert(&mut **probe, addr)
                .map_err(|e| tracing::debug!("Z1 failed: {e}")),
            BreakpointKind::WriteWatchpoint => session
                .watchpoints
                .add(&mut **probe, WatchFun::Write, addr, length)
                .map_err(|e| tracing::debug!("Z2 failed: {e}")),
            BreakpointKind::ReadWatchpoint => session
                .watchpoints
                .add(&mut **probe, WatchFun::Read, addr, length)
                .map_err(|e| tracing::debug!("Z3 failed: {e}")),
            BreakpointKind::AccessWatchpoint => session
                .watchpoints
                .add(&mut **probe, WatchFun::Access, addr, length)
                .map_err(|e| tracing::debug!("Z4 failed: {e}")),
            BreakpointKind::Software => return reply(b""),
        };

        match result {
            Ok(()) => reply(b"OK"),
            Err(()) => reply(b"E00"),
        }
    }

    fn remove_breakpoint(
        &mut self,
        session: &mut Session,
        kind: BreakpointKind,
        addr: u32,
    ) -> Option<Vec<u8>> {
        let mut probe = self.probe();
        match kind {
            BreakpointKind::Hardware => {
                // Removal of a missing breakpoint still answers OK.
                let _ = session.breakpoints.remove(&mut **probe, addr);
                reply(b"OK")
            }
            BreakpointKind::WriteWatchpoint
            | BreakpointKind::ReadWatchpoint
            | BreakpointKind::AccessWatchpoint => {
                match session.watchpoints.remove(&mut **probe, addr) {
                    Ok(()) => reply(b"OK"),
                    Err(e) => {
                        tracing::debug!("z packet failed: {e}");
                        reply(b"E00")
                    }
                }
            }
            BreakpointKind::Software => reply(b""),
        }
    }

    fn restart(&mut self, session: &mut Session) -> Result<Option<Vec<u8>>, ServerError> {
        let mut probe = self.probe();
        let probe = &mut **probe;
        if let Err(e) = probe.reset(ResetMode::SoftAndHalt) {
            tracing::debug!("R packet: reset failed: {e}");
        }

        // Reset wiped the comparators; rebuild them from scratch.
        session.breakpoints = BreakpointUnit::init(probe)?;
        session.watchpoints = WatchpointUnit::init(probe)?;
        session.attached = true;

        Ok(reply(b"OK"))
    }

    /// `k` cycles the whole probe connection so a new GDB can attach to a
    /// fresh target. Losing the probe here is not recoverable.
    fn kill(&mut self, session: &mut Session) -> Result<(), ServerError> {
        let mut probe = self.probe.lock().unwrap();

        if let Err(e) = probe.run() {
            tracing::debug!("kill: run failed: {e}");
        }
        if let Err(e) = probe.exit_debug_mode() {
            tracing::debug!("kill: exit_debug_mode failed: {e}");
        }
        probe.close();

        *probe = match (self.opener)() {
            Ok(new_probe) => new_probe,
            Err(e) => {
                tracing::error!("kill: cannot reopen probe: {e}");
                return Err(ServerError::ProbeLost);
            }
        };

        let probe = &mut **probe;
        if let Err(e) = probe.halt() {
            tracing::debug!("kill: halt failed: {e}");
        }
        session.cache = CacheDescriptor::init(probe)?;
        session.breakpoints = BreakpointUnit::init(probe)?;
        session.watchpoints = WatchpointUnit::init(probe)?;

        Ok(())
    }

    fn handle_query(
        &mut self,
        session: &mut Session,
        query: QueryPacket,
    ) -> Result<Option<Vec<u8>>, ServerError> {
        let reply_bytes = match query {
            QueryPacket::Supported => {
                reply(b"PacketSize=3fff;qXfer:memory-map:read+;qXfer:features:read+")
            }
            QueryPacket::Transfer {
                object,
                offset,
                length,
            } => {
                let data = match object {
                    parser::query::TransferObject::MemoryMap => session.memory_map.as_str(),
                    parser::query::TransferObject::Features => chip::TARGET_DESCRIPTION,
                };
                Some(xfer_slice(data, offset, length))
            }
            QueryPacket::Command(command) => return self.handle_rcmd(session, &command),
            QueryPacket::Thread | QueryPacket::Unknown => reply(b""),
        };
        Ok(reply_bytes)
    }

    fn handle_rcmd(
        &mut self,
        session: &mut Session,
        command: &[u8],
    ) -> Result<Option<Vec<u8>>, ServerError> {
        tracing::debug!("Rcmd: '{}'", String::from_utf8_lossy(command));
        let mut probe = self.probe();
        let probe = &mut **probe;

        if command.starts_with(b"resume") {
            sync_cache(session, probe);
            return Ok(match probe.run() {
                Ok(()) => reply(b"OK"),
                Err(e) => {
                    tracing::debug!("Rcmd: resume failed: {e}");
                    reply(b"E00")
                }
            });
        }

        if command.starts_with(b"halt") {
            return Ok(match probe.halt() {
                Ok(()) => reply(b"OK"),
                Err(e) => {
                    tracing::debug!("Rcmd: halt failed: {e}");
                    reply(b"E00")
                }
            });
        }

        if command.starts_with(b"jtag_reset") {
            let mut failed = false;
            if let Err(e) = probe.reset(ResetMode::Hard) {
                tracing::debug!("Rcmd: jtag_reset failed with reset: {e}");
                failed = true;
            }
            if let Err(e) = probe.halt() {
                tracing::debug!("Rcmd: jtag_reset failed with halt: {e}");
                failed = true;
            }
            return Ok(if failed { reply(b"E00") } else { reply(b"OK") });
        }

        if command.starts_with(b"reset") {
            let mut failed = false;
            if let Err(e) = probe.halt() {
                tracing::debug!("Rcmd: reset failed with halt: {e}");
                failed = true;
            }
            if let Err(e) = probe.reset(ResetMode::SoftAndHalt) {
                tracing::debug!("Rcmd: reset failed with reset: {e}");
                failed = true;
            }

            session.breakpoints = BreakpointUnit::init(probe)?;
            session.watchpoints = WatchpointUnit::init(probe)?;

            return Ok(if failed { reply(b"E00") } else { reply(b"OK") });
        }

        if let Some(arg) = command.strip_prefix(b"semihosting ") {
            let arg = trim_leading_spaces(arg);
            if arg.starts_with(b"enable") || arg.starts_with(b"1") {
                session.semihosting = true;
                return Ok(reply(b"OK"));
            }
            if arg.starts_with(b"disable") || arg.starts_with(b"0") {
                session.semihosting = false;
                return Ok(reply(b"OK"));
            }
            tracing::debug!(
                "Rcmd: unknown semihosting arg: '{}'",
                String::from_utf8_lossy(arg)
            );
            return Ok(reply(b""));
        }

        Ok(reply(b""))
    }

    fn handle_v_packet(&mut self, session: &mut Session, verb: VPacket) -> Option<Vec<u8>> {
        match verb {
            VPacket::FlashErase { addr, length } => {
                tracing::debug!("FlashErase: addr:{addr:08x},len:{length:04x}");
                let mut probe = self.probe();
                match session.flash.add_block(&mut **probe, addr, length) {
                    Ok(()) => reply(b"OK"),
                    Err(e) => {
                        tracing::debug!("FlashErase failed: {e}");
                        reply(b"E00")
                    }
                }
            }
            VPacket::FlashWrite { addr, data } => match session.flash.populate(addr, &data) {
                Ok(()) => reply(b"OK"),
                Err(e) => {
                    tracing::debug!("FlashWrite failed: {e}");
                    reply(b"E00")
                }
            },
            VPacket::FlashDone => {
                let mut probe = self.probe();
                match session.flash.commit(&mut **probe, self.config.connect_mode) {
                    Ok(()) => reply(b"OK"),
                    Err(e) => {
                        tracing::error!("FlashDone failed: {e}");
                        reply(b"E08")
                    }
                }
            }
            VPacket::Kill => {
                session.attached = false;
                reply(b"OK")
            }
            VPacket::Unknown => reply(b""),
        }
    }
}

fn reply(bytes: &[u8]) -> Option<Vec<u8>> {
    Some(bytes.to_vec())
}

fn trim_leading_spaces(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    &bytes[start..]
}

/// The cache must be coherent before any transition to target execution;
/// a probe hiccup here is logged, not fatal, like every other best-effort
/// step around a resume.
fn sync_cache(session: &mut Session, probe: &mut dyn ProbeDriver) {
    if let Err(e) = session.cache.sync(probe) {
        tracing::debug!("cache sync failed: {e}");
    }
}

/// Called with the core halted during a continue. Returns true when the
/// halt was a serviced semihosting trap and execution was resumed; false
/// when the stop must be reported to GDB.
fn resume_from_semihost(session: &mut Session, probe: &mut dyn ProbeDriver) -> bool {
    if !session.semihosting {
        return false;
    }

    let regs = match probe.read_all_regs() {
        Ok(regs) => regs,
        Err(e) => {
            tracing::debug!("semihost: read_all_regs failed: {e}");
            return false;
        }
    };

    let pc = regs.r[15];
    let offset = pc % 4;
    let aligned = pc - offset;

    // Instruction fetches must be word aligned; take eight bytes when the
    // half-word straddles the first word.
    let span = if offset > 2 { 8 } else { 4 };
    let code = match probe.read_mem32(aligned, span) {
        Ok(code) => code,
        Err(e) => {
            tracing::debug!("semihost: cannot read instructions at {aligned:#010x}: {e}");
            return false;
        }
    };

    let insn = u16::from_le_bytes([code[offset as usize], code[offset as usize + 1]]);
    if insn != BKPT_AB || session.breakpoints.contains(aligned) {
        return false;
    }

    match session.semihost.service(probe, regs.r[0], regs.r[1]) {
        Ok(semihosting::Outcome::Continue { retval }) => {
            if let Err(e) = probe.write_reg(retval, 0) {
                tracing::debug!("semihost: write_reg failed for return value: {e}");
            }
            // Skip the BKPT itself.
            if let Err(e) = probe.write_reg(pc + 2, 15) {
                tracing::debug!("semihost: write_reg failed for pc: {e}");
            }
            sync_cache(session, probe);
            if let Err(e) = probe.run() {
                tracing::debug!("semihost: resume failed: {e}");
            }
            true
        }
        Ok(semihosting::Outcome::Exit { code }) => {
            tracing::info!("semihost: target exited with {code:#x}");
            false
        }
        Err(e) => {
            tracing::debug!("semihost: service failed: {e}");
            false
        }
    }
}

/// Slices a qXfer document: `m` + data for a chunk, bare `l` once the
/// offset runs past the end. GDB keeps asking until it sees the `l`.
fn xfer_slice(data: &str, offset: u32, length: u32) -> Vec<u8> {
    let data = data.as_bytes();
    let offset = offset as usize;
    if offset >= data.len() {
        return b"l".to_vec();
    }

    let length = (length as usize).min(data.len() - offset);
    if length == 0 {
        return b"l".to_vec();
    }

    let mut out = Vec::with_capacity(length + 1);
    out.push(b'm');
    out.extend_from_slice(&data[offset..offset + length]);
    out
}

fn listen(port: u16) -> io::Result<TcpListener> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    socket.bind(&addr.into())?;
    socket.listen(5)?;
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::mock::MockProbe;
    use crate::protocol::testing::{parse_output, MockTransport};
    use crate::target::registers::fp_comp;

    /// Frames a payload the way a GDB client would.
    fn frame(payload: &[u8]) -> Vec<u8> {
        let sum: u8 = payload.iter().fold(0u8, |a, &b| a.wrapping_add(b));
        let mut out = vec![b'$'];
        out.extend_from_slice(payload);
        out.push(b'#');
        out.extend_from_slice(&encode_hex(&[sum]));
        out
    }

    /// Builds a client script: every command followed by the `+` that will
    /// acknowledge the server's reply.
    fn script(commands: &[&[u8]]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for command in commands {
            bytes.extend_from_slice(&frame(command));
            bytes.push(b'+');
        }
        bytes
    }

    struct Fixture {
        server: GdbServer,
    }

    impl Fixture {
        fn new(probe: MockProbe) -> Self {
            Self::with_config(probe, ServerConfig::default())
        }

        fn with_config(probe: MockProbe, config: ServerConfig) -> Self {
            let shared: SharedProbe = Arc::new(Mutex::new(Box::new(probe)));
            let opener: ProbeOpener = Box::new(|| Ok(Box::new(MockProbe::new())));
            Self {
                server: GdbServer::new(shared, opener, config),
            }
        }

        /// Runs a scripted session to completion and returns the replies.
        fn run(&mut self, commands: &[&[u8]]) -> Vec<Vec<u8>> {
            let mut remote = GdbRemote::new(MockTransport::new(&script(commands)));
            let result = self.server.serve_client(&mut remote);
            assert!(result.is_err(), "scripted sessions end at EOF");
            let (_acks, packets) = parse_output(remote.get_ref().output.as_slice());
            packets
        }

        fn probe(&self) -> MutexGuard<'_, Box<dyn ProbeDriver>> {
            self.server.probe()
        }
    }

    #[test]
    fn handshake_advertises_transfers() {
        let mut fixture = Fixture::new(MockProbe::new());
        let replies = fixture.run(&[b"qSupported"]);
        assert_eq!(
            replies[0],
            b"PacketSize=3fff;qXfer:memory-map:read+;qXfer:features:read+".to_vec()
        );
    }

    #[test]
    fn halt_reason_tracks_attachment() {
        let mut fixture = Fixture::new(MockProbe::new());
        let replies = fixture.run(&[b"?", b"vKill;1", b"?", b"R00", b"?"]);
        assert_eq!(replies[0], b"S05");
        assert_eq!(replies[1], b"OK");
        assert_eq!(replies[2], b"OK");
        assert_eq!(replies[3], b"OK");
        assert_eq!(replies[4], b"S05");
    }

    #[test]
    fn read_r0_is_byteswapped_on_the_wire() {
        let mut probe = MockProbe::new();
        probe.regs.r[0] = 0x1234_5678;
        let mut fixture = Fixture::new(probe);
        let replies = fixture.run(&[b"p0"]);
        assert_eq!(replies[0], b"78563412");
    }

    #[test]
    fn write_then_read_register_round_trips() {
        let mut fixture = Fixture::new(MockProbe::new());
        let replies = fixture.run(&[b"P2=efbeadde", b"p2"]);
        assert_eq!(replies[0], b"OK");
        assert_eq!(replies[1], b"efbeadde");
        assert_eq!(fixture.probe().read_reg(2).unwrap(), 0xdead_beef);
    }

    #[test]
    fn invalid_register_id_is_an_error() {
        let mut fixture = Fixture::new(MockProbe::new());
        let replies = fixture.run(&[b"p41", b"P16=00000000"]);
        assert_eq!(replies[0], b"E00");
        assert_eq!(replies[1], b"E00");
    }

    #[test]
    fn write_all_then_read_all_round_trips() {
        let mut fixture = Fixture::new(MockProbe::new());
        let mut payload = b"G".to_vec();
        for i in 0..16u32 {
            payload.extend_from_slice(format!("{:08x}", (0x1111_1111 * i).swap_bytes()).as_bytes());
        }
        let replies = fixture.run(&[&payload, b"g"]);
        assert_eq!(replies[0], b"OK");
        assert_eq!(replies[1], payload[1..].to_vec());
    }

    #[test]
    fn special_registers_go_through_the_unsupported_path() {
        let mut probe = MockProbe::new();
        probe.unsupported.insert(0x40, 0x0300_0000);
        let mut fixture = Fixture::new(probe);
        let replies = fixture.run(&[b"p40", b"P1c=01000000"]);
        assert_eq!(replies[0], b"00000003");
        assert_eq!(replies[1], b"OK");
        assert_eq!(
            fixture.probe().read_unsupported_reg(0x1c).unwrap(),
            0x0000_0001
        );
    }

    #[test]
    fn memory_write_read_round_trips_unaligned() {
        let mut fixture = Fixture::new(MockProbe::new());
        // 9 bytes at an odd address: head, aligned middle, tail.
        let replies = fixture.run(&[b"M20000001,9:112233445566778899", b"m20000001,9"]);
        assert_eq!(replies[0], b"OK");
        assert_eq!(replies[1], b"112233445566778899");
        assert_eq!(
            fixture.probe().read_mem32(0x2000_0000, 12).unwrap()[1..10],
            [0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99]
        );
    }

    #[test]
    fn memory_read_is_capped() {
        let mut probe = MockProbe::new();
        probe.page_size = 0x4000;
        let mut fixture = Fixture::new(probe);
        // 0x2000 > 0x1800: the reply carries exactly 0x1800 bytes.
        let replies = fixture.run(&[b"m20000000,2000"]);
        assert_eq!(replies[0].len(), 0x1800 * 2);

        let mut probe = MockProbe::new();
        probe.page_size = 0x400;
        let mut fixture = Fixture::new(probe);
        // Page size caps before the transfer ceiling does.
        let replies = fixture.run(&[b"m08000000,2000"]);
        assert_eq!(replies[0].len(), 0x400 * 2);
    }

    #[test]
    fn failed_memory_read_returns_empty() {
        let mut probe = MockProbe::new();
        probe.fail_mem_reads = true;
        let mut fixture = Fixture::new(probe);
        let replies = fixture.run(&[b"m20000000,4"]);
        assert_eq!(replies[0], b"");
    }

    /// CM7-flavored probe: caches present and enabled, one unified level.
    fn cm7_probe() -> MockProbe {
        use crate::target::registers::{CCR, CCR_DC, CCR_IC, CCSIDR, CLIDR, CTR};
        let mut probe = MockProbe::new();
        probe.set_word(CTR, (0b100 << 29) | (3 << 16) | 3);
        probe.set_word(CLIDR, (1 << 27) | 0b011);
        probe.set_word(CCR, CCR_IC | CCR_DC);
        probe.set_word(CCSIDR, (63 << 13) | (1 << 3) | 1);
        probe
    }

    #[test]
    fn memory_write_flushes_caches_on_resume() {
        use crate::target::registers::ICIALLU;
        let mut probe = cm7_probe();
        probe.status_script.push_back(CoreStatus::Halted);
        probe.set_word(ICIALLU, 0xffff_ffff);
        let mut fixture = Fixture::new(probe);

        let replies = fixture.run(&[b"M20000000,4:aabbccdd", b"c"]);
        assert_eq!(replies[0], b"OK");
        assert_eq!(replies[1], b"S05");
        // The resume synced the caches: I-cache invalidate was issued.
        assert_eq!(fixture.probe().read_debug32(ICIALLU).unwrap(), 0);
    }

    #[test]
    fn resume_without_memory_write_skips_cache_flush() {
        use crate::target::registers::ICIALLU;
        let mut probe = cm7_probe();
        probe.status_script.push_back(CoreStatus::Halted);
        probe.set_word(ICIALLU, 0xffff_ffff);
        let mut fixture = Fixture::new(probe);

        let replies = fixture.run(&[b"c"]);
        assert_eq!(replies[0], b"S05");
        assert_eq!(fixture.probe().read_debug32(ICIALLU).unwrap(), 0xffff_ffff);
    }

    #[test]
    fn hardware_breakpoint_set_and_clear() {
        let mut fixture = Fixture::new(MockProbe::new());
        let replies = fixture.run(&[b"Z1,8000100,2", b"z1,8000100,2"]);
        assert_eq!(replies[0], b"OK");
        assert_eq!(replies[1], b"OK");
        let comp = fixture.probe().read_debug32(fp_comp(0)).unwrap();
        assert_eq!(comp, 0);
    }

    #[test]
    fn breakpoint_comparator_is_programmed() {
        let mut fixture = Fixture::new(MockProbe::new());
        let replies = fixture.run(&[b"Z1,8000100,2"]);
        assert_eq!(replies[0], b"OK");
        assert_eq!(
            fixture.probe().read_debug32(fp_comp(0)).unwrap(),
            0x4800_0101
        );
    }

    #[test]
    fn odd_breakpoint_address_errors() {
        let mut fixture = Fixture::new(MockProbe::new());
        let replies = fixture.run(&[b"Z1,8000101,2"]);
        assert_eq!(replies[0], b"E00");
    }

    #[test]
    fn software_breakpoints_are_unsupported() {
        let mut fixture = Fixture::new(MockProbe::new());
        let replies = fixture.run(&[b"Z0,8000100,2", b"z0,8000100,2"]);
        assert_eq!(replies[0], b"");
        assert_eq!(replies[1], b"");
    }

    #[test]
    fn watchpoints_add_and_remove() {
        let mut fixture = Fixture::new(MockProbe::new());
        let replies = fixture.run(&[
            b"Z2,20000010,4",
            b"Z3,20000020,2",
            b"Z4,20000030,8",
            b"z2,20000010,4",
            b"Z2,20000000,20000",
        ]);
        assert_eq!(replies[0], b"OK");
        assert_eq!(replies[1], b"OK");
        assert_eq!(replies[2], b"OK");
        assert_eq!(replies[3], b"OK");
        // 0x20000 bytes exceeds the largest DWT mask.
        assert_eq!(replies[4], b"E00");
    }

    #[test]
    fn flash_program_one_page() {
        let mut fixture = Fixture::new(MockProbe::new());
        let mut write = b"vFlashWrite:08000000:".to_vec();
        write.extend_from_slice(&[0xaa; 0x800]);
        let replies = fixture.run(&[
            b"vFlashErase:08000000,800",
            &write,
            b"vFlashDone",
        ]);
        assert_eq!(replies[0], b"OK");
        assert_eq!(replies[1], b"OK");
        assert_eq!(replies[2], b"OK");

        // Post-condition: readback returns the programmed pattern.
        assert_eq!(
            fixture.probe().read_mem32(0x0800_0000, 0x800).unwrap(),
            vec![0xaa; 0x800]
        );
    }

    #[test]
    fn zero_length_flash_erase_is_ok() {
        let mut fixture = Fixture::new(MockProbe::new());
        let replies = fixture.run(&[b"vFlashErase:08000000,0", b"vFlashDone"]);
        assert_eq!(replies[0], b"OK");
        assert_eq!(replies[1], b"OK");
    }

    #[test]
    fn flash_write_without_erase_errors() {
        let mut fixture = Fixture::new(MockProbe::new());
        let replies = fixture.run(&[b"vFlashWrite:08000000:\x01\x02"]);
        assert_eq!(replies[0], b"E00");
    }

    #[test]
    fn continue_reports_trap_when_halted() {
        // Core halts immediately, semihosting disabled: plain S05.
        let mut probe = MockProbe::new();
        probe.status_script.push_back(CoreStatus::Halted);
        let mut fixture = Fixture::new(probe);
        let replies = fixture.run(&[b"c"]);
        assert_eq!(replies[0], b"S05");
    }

    #[test]
    fn interrupt_halts_running_target() {
        let mut fixture = Fixture::new(MockProbe::new());

        // "c" frame, then the break byte, then the ack for S05. The break
        // is seen before the first status poll, so the target is halted
        // and the loop ends.
        let mut bytes = frame(b"c");
        bytes.push(0x03);
        bytes.push(b'+');
        let mut remote = GdbRemote::new(MockTransport::new(&bytes));
        let result = fixture.server.serve_client(&mut remote);
        assert!(result.is_err());

        let (_, packets) = parse_output(remote.get_ref().output.as_slice());
        assert_eq!(packets[0], b"S05");
        assert_eq!(fixture.probe().status().unwrap(), CoreStatus::Halted);
    }

    #[test]
    fn semihosting_write_is_serviced_and_resumed() {
        let mut probe = MockProbe::new();
        // Halted at a BKPT 0xAB with r0 = SYS_WRITE, r1 = parameter block.
        probe.regs.r[15] = 0x2000_0100;
        probe
            .write_mem8(0x2000_0100, &BKPT_AB.to_le_bytes())
            .unwrap();
        probe.regs.r[0] = 0x05;
        probe.regs.r[1] = 0x2000_0200;
        // Parameter block: handle 2 (stdout via :tt open would be 1; use a
        // bogus handle so the write is a no-op but still succeeds), buffer,
        // length 0.
        probe.set_word(0x2000_0200, 99);
        probe.set_word(0x2000_0204, 0x2000_0300);
        probe.set_word(0x2000_0208, 0);
        // Halted on every poll: first halt services the trap and resumes,
        // the second (pc now past the BKPT) stops the loop.
        probe.status_script.push_back(CoreStatus::Halted);
        let mut fixture = Fixture::with_config(
            probe,
            ServerConfig {
                semihosting: true,
                ..ServerConfig::default()
            },
        );

        let replies = fixture.run(&[b"qRcmd,73656d69686f7374696e6720656e61626c65", b"c"]);
        assert_eq!(replies[0], b"OK");
        assert_eq!(replies[1], b"S05");

        let mut probe = fixture.probe();
        // r0 rewritten with "0 bytes unwritten", pc advanced past the BKPT.
        assert_eq!(probe.read_all_regs().unwrap().r[0], 0);
        assert_eq!(probe.read_all_regs().unwrap().r[15], 0x2000_0102);
    }

    #[test]
    fn step_failure_is_critical() {
        let mut probe = MockProbe::new();
        probe.fail_step = true;
        let mut fixture = Fixture::new(probe);

        let mut remote = GdbRemote::new(MockTransport::new(&script(&[b"s", b"?"])));
        let result = fixture.server.serve_client(&mut remote);
        assert!(matches!(result, Err(ServerError::Critical)));

        let (_, packets) = parse_output(remote.get_ref().output.as_slice());
        // The E00 went out, then the session died; the `?` was never read.
        assert_eq!(packets, vec![b"E00".to_vec()]);
    }

    #[test]
    fn step_replies_trap() {
        let mut fixture = Fixture::new(MockProbe::new());
        let replies = fixture.run(&[b"s"]);
        assert_eq!(replies[0], b"S05");
    }

    #[test]
    fn xfer_chunks_then_final_l() {
        let mut fixture = Fixture::new(MockProbe::new());
        let replies = fixture.run(&[
            b"qXfer:features:read:target.xml:0,20",
            b"qXfer:features:read:target.xml:fffff,20",
        ]);
        assert_eq!(replies[0][0], b'm');
        assert_eq!(&replies[0][1..], &chip::TARGET_DESCRIPTION.as_bytes()[..0x20]);
        assert_eq!(replies[1], b"l");
    }

    #[test]
    fn memory_map_is_rendered_per_session() {
        let mut fixture = Fixture::new(MockProbe::new());
        let replies = fixture.run(&[b"qXfer:memory-map:read::0,4000"]);
        let body = String::from_utf8(replies[0][1..].to_vec()).unwrap();
        assert!(body.contains("memory-map"));
        assert!(body.contains("0x800"));
    }

    #[test]
    fn rcmd_reset_reinitializes_comparators() {
        let mut fixture = Fixture::new(MockProbe::new());
        let replies = fixture.run(&[b"Z1,8000100,2", b"qRcmd,7265736574"]);
        assert_eq!(replies[1], b"OK");
        assert_eq!(fixture.probe().read_debug32(fp_comp(0)).unwrap(), 0);
    }

    #[test]
    fn kill_cycles_the_probe_without_a_reply() {
        let mut fixture = Fixture::new(MockProbe::new());
        {
            let mut probe = fixture.probe();
            probe.write_mem8(0x2000_0000, &[0x42]).unwrap();
        }

        let replies = fixture.run(&[b"k", b"?"]);
        // No reply to `k`; the next command is served by the fresh probe.
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0], b"S05");
        // The reopened probe has pristine memory.
        assert_eq!(fixture.probe().read_mem32(0x2000_0000, 4).unwrap()[0], 0);
    }

    #[test]
    fn lost_probe_on_kill_is_fatal() {
        let shared: SharedProbe = Arc::new(Mutex::new(Box::new(MockProbe::new())));
        let opener: ProbeOpener = Box::new(|| Err(ProbeError::ProbeNotFound));
        let mut server = GdbServer::new(shared, opener, ServerConfig::default());

        let mut remote = GdbRemote::new(MockTransport::new(&script(&[b"k"])));
        let result = server.serve_client(&mut remote);
        assert!(matches!(result, Err(ServerError::ProbeLost)));
    }

    #[test]
    fn unknown_packets_get_empty_replies() {
        let mut fixture = Fixture::new(MockProbe::new());
        let replies = fixture.run(&[b"D", b"qOffsets", b"vMustReplyEmpty", b"Z9,0,0"]);
        assert!(replies.iter().all(|r| r.is_empty()));
    }

    #[test]
    fn extended_mode_sets_persistence() {
        let mut fixture = Fixture::new(MockProbe::new());
        let replies = fixture.run(&[b"!"]);
        assert_eq!(replies[0], b"OK");
        assert!(fixture.server.config.persistent);
    }

    #[test]
    fn xfer_slice_boundaries() {
        assert_eq!(xfer_slice("abc", 0, 2), b"mab".to_vec());
        assert_eq!(xfer_slice("abc", 0, 10), b"mabc".to_vec());
        assert_eq!(xfer_slice("abc", 3, 10), b"l".to_vec());
        assert_eq!(xfer_slice("abc", 9, 1), b"l".to_vec());
        assert_eq!(xfer_slice("abc", 1, 0), b"l".to_vec());
    }
}
