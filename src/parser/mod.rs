//! Parser for GDB packet payloads.
//!
//! Framing (`$...#cc`) is stripped by the protocol layer before the payload
//! reaches [`parse_packet`]. Anything that does not parse as a known command
//! becomes [`Packet::Unknown`], which the session answers with an empty
//! reply as the protocol requires.

pub(crate) mod query;
pub(crate) mod v_packet;

use nom::branch::alt;
use nom::bytes::complete::tag;
use nom::character::complete::char;
use nom::combinator::{map, rest, value};
use nom::number::complete::hex_u32;
use nom::IResult;

use crate::protocol::decode_hex;
pub use query::QueryPacket;
pub use v_packet::VPacket;

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Packet {
    /// `!` — enable extended (persistent) mode
    ExtendedMode,
    /// `?` — why did the target stop
    HaltReason,
    /// `c` — continue, optional resume address ignored
    Continue,
    /// `s` — single step
    SingleStep,
    /// `g`
    ReadAllRegisters,
    /// `G` — values as written on the wire, one per register
    WriteAllRegisters { values: Vec<u32> },
    /// `p`
    ReadRegister { id: u32 },
    /// `P`
    WriteRegister { id: u32, value: u32 },
    /// `m`
    ReadMemory { addr: u32, length: u32 },
    /// `M` — data already decoded from hex
    WriteMemory { addr: u32, data: Vec<u8> },
    /// `Z`
    InsertBreakpoint {
        kind: BreakpointKind,
        addr: u32,
        length: u32,
    },
    /// `z`
    RemoveBreakpoint {
        kind: BreakpointKind,
        addr: u32,
        length: u32,
    },
    /// `R` — restart the target
    Restart,
    /// `k` — kill; the probe connection is cycled
    Kill,
    /// `q...`
    Query(QueryPacket),
    /// `v...`
    V(VPacket),
    /// Break byte 0x03 arriving as its own "packet"
    Interrupt,
    /// Anything unrecognized; answered with the empty reply
    Unknown,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum BreakpointKind {
    /// `Z0` — memory breakpoint, not supported on this target
    Software,
    /// `Z1` — FPB comparator
    Hardware,
    /// `Z2` — DWT write watch
    WriteWatchpoint,
    /// `Z3` — DWT read watch
    ReadWatchpoint,
    /// `Z4` — DWT access watch
    AccessWatchpoint,
}

pub fn parse_packet(input: &[u8]) -> Packet {
    let result = alt((
        extended_mode,
        halt_reason,
        continue_packet,
        single_step,
        read_all_registers,
        write_all_registers,
        read_register,
        write_register,
        read_memory,
        write_memory,
        insert_breakpoint,
        remove_breakpoint,
        restart,
        kill,
        query::query,
        v_packet::v,
        interrupt,
    ))(input);

    match result {
        Ok((_, packet)) => packet,
        Err(_) => Packet::Unknown,
    }
}

fn extended_mode(input: &[u8]) -> IResult<&[u8], Packet> {
    value(Packet::ExtendedMode, char('!'))(input)
}

fn halt_reason(input: &[u8]) -> IResult<&[u8], Packet> {
    value(Packet::HaltReason, char('?'))(input)
}

fn continue_packet(input: &[u8]) -> IResult<&[u8], Packet> {
    value(Packet::Continue, char('c'))(input)
}

fn single_step(input: &[u8]) -> IResult<&[u8], Packet> {
    value(Packet::SingleStep, char('s'))(input)
}

fn read_all_registers(input: &[u8]) -> IResult<&[u8], Packet> {
    value(Packet::ReadAllRegisters, char('g'))(input)
}

fn write_all_registers(input: &[u8]) -> IResult<&[u8], Packet> {
    let (input, _) = char('G')(input)?;
    let (input, raw) = rest(input)?;

    let mut values = Vec::with_capacity(raw.len() / 8);
    for word in raw.chunks_exact(8) {
        let (_, value) = hex_u32(word)?;
        values.push(value);
    }

    Ok((input, Packet::WriteAllRegisters { values }))
}

fn read_register(input: &[u8]) -> IResult<&[u8], Packet> {
    let (input, _) = char('p')(input)?;
    let (input, id) = hex_u32(input)?;

    Ok((input, Packet::ReadRegister { id }))
}

fn write_register(input: &[u8]) -> IResult<&[u8], Packet> {
    let (input, _) = char('P')(input)?;
    let (input, id) = hex_u32(input)?;
    let (input, _) = char('=')(input)?;
    let (input, value) = hex_u32(input)?;

    Ok((input, Packet::WriteRegister { id, value }))
}

fn read_memory(input: &[u8]) -> IResult<&[u8], Packet> {
    let (input, _) = char('m')(input)?;
    let (input, addr) = hex_u32(input)?;
    let (input, _) = char(',')(input)?;
    let (input, length) = hex_u32(input)?;

    Ok((input, Packet::ReadMemory { addr, length }))
}

fn write_memory(input: &[u8]) -> IResult<&[u8], Packet> {
    let (input, _) = char('M')(input)?;
    let (input, addr) = hex_u32(input)?;
    let (input, _) = char(',')(input)?;
    let (input, _length) = hex_u32(input)?;
    let (input, _) = char(':')(input)?;
    let (input, raw) = rest(input)?;

    match decode_hex(raw) {
        Some(data) => Ok((input, Packet::WriteMemory { addr, data })),
        None => Err(nom::Err::Failure(nom::error::Error::new(
            raw,
            nom::error::ErrorKind::HexDigit,
        ))),
    }
}

fn breakpoint_kind(input: &[u8]) -> IResult<&[u8], BreakpointKind> {
    alt((
        value(BreakpointKind::Software, char('0')),
        value(BreakpointKind::Hardware, char('1')),
        value(BreakpointKind::WriteWatchpoint, char('2')),
        value(BreakpointKind::ReadWatchpoint, char('3')),
        value(BreakpointKind::AccessWatchpoint, char('4')),
    ))(input)
}

fn insert_breakpoint(input: &[u8]) -> IResult<&[u8], Packet> {
    let (input, _) = char('Z')(input)?;
    let (input, kind) = breakpoint_kind(input)?;
    let (input, _) = char(',')(input)?;
    let (input, addr) = hex_u32(input)?;
    let (input, _) = char(',')(input)?;
    let (input, length) = hex_u32(input)?;

    Ok((input, Packet::InsertBreakpoint { kind, addr, length }))
}

fn remove_breakpoint(input: &[u8]) -> IResult<&[u8], Packet> {
    let (input, _) = char('z')(input)?;
    let (input, kind) = breakpoint_kind(input)?;
    let (input, _) = char(',')(input)?;
    let (input, addr) = hex_u32(input)?;
    let (input, _) = char(',')(input)?;
    let (input, length) = hex_u32(input)?;

    Ok((input, Packet::RemoveBreakpoint { kind, addr, length }))
}

fn restart(input: &[u8]) -> IResult<&[u8], Packet> {
    value(Packet::Restart, char('R'))(input)
}

fn kill(input: &[u8]) -> IResult<&[u8], Packet> {
    value(Packet::Kill, char('k'))(input)
}

fn interrupt(input: &[u8]) -> IResult<&[u8], Packet> {
    map(tag([0x03]), |_| Packet::Interrupt)(input)
}

#[cfg(test)]
mod tests {
    use super::query::TransferObject;
    use super::*;

    #[test]
    fn parses_single_byte_commands() {
        assert_eq!(parse_packet(b"!"), Packet::ExtendedMode);
        assert_eq!(parse_packet(b"?"), Packet::HaltReason);
        assert_eq!(parse_packet(b"c"), Packet::Continue);
        assert_eq!(parse_packet(b"s"), Packet::SingleStep);
        assert_eq!(parse_packet(b"g"), Packet::ReadAllRegisters);
        assert_eq!(parse_packet(b"k"), Packet::Kill);
        assert_eq!(parse_packet(b"R00"), Packet::Restart);
        assert_eq!(parse_packet(&[0x03]), Packet::Interrupt);
    }

    #[test]
    fn parses_register_access() {
        assert_eq!(parse_packet(b"p1a"), Packet::ReadRegister { id: 0x1a });
        assert_eq!(
            parse_packet(b"P0=78563412"),
            Packet::WriteRegister {
                id: 0,
                value: 0x78563412
            }
        );
    }

    #[test]
    fn parses_write_all_registers() {
        let mut payload = b"G".to_vec();
        for i in 0..16u32 {
            payload.extend_from_slice(format!("{:08x}", i).as_bytes());
        }
        match parse_packet(&payload) {
            Packet::WriteAllRegisters { values } => {
                assert_eq!(values.len(), 16);
                assert_eq!(values[3], 3);
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn parses_memory_access() {
        assert_eq!(
            parse_packet(b"m8000000,400"),
            Packet::ReadMemory {
                addr: 0x0800_0000,
                length: 0x400
            }
        );
        assert_eq!(
            parse_packet(b"M20000000,2:beef"),
            Packet::WriteMemory {
                addr: 0x2000_0000,
                data: vec![0xbe, 0xef]
            }
        );
    }

    #[test]
    fn parses_breakpoints() {
        assert_eq!(
            parse_packet(b"Z1,8000100,2"),
            Packet::InsertBreakpoint {
                kind: BreakpointKind::Hardware,
                addr: 0x0800_0100,
                length: 2
            }
        );
        assert_eq!(
            parse_packet(b"z4,20000010,4"),
            Packet::RemoveBreakpoint {
                kind: BreakpointKind::AccessWatchpoint,
                addr: 0x2000_0010,
                length: 4
            }
        );
    }

    #[test]
    fn parses_queries() {
        assert_eq!(
            parse_packet(b"qSupported:multiprocess+;xmlRegisters=arm"),
            Packet::Query(QueryPacket::Supported)
        );
        assert_eq!(
            parse_packet(b"qXfer:memory-map:read::0,fff"),
            Packet::Query(QueryPacket::Transfer {
                object: TransferObject::MemoryMap,
                offset: 0,
                length: 0xfff
            })
        );
        assert_eq!(
            parse_packet(b"qRcmd,7265736574"),
            Packet::Query(QueryPacket::Command(b"reset".to_vec()))
        );
        assert_eq!(parse_packet(b"qC"), Packet::Query(QueryPacket::Thread));
        assert_eq!(
            parse_packet(b"qOffsets"),
            Packet::Query(QueryPacket::Unknown)
        );
    }

    #[test]
    fn parses_v_packets() {
        assert_eq!(
            parse_packet(b"vFlashErase:08000000,800"),
            Packet::V(VPacket::FlashErase {
                addr: 0x0800_0000,
                length: 0x800
            })
        );
        assert_eq!(
            parse_packet(b"vFlashWrite:08000000:\x01\x02"),
            Packet::V(VPacket::FlashWrite {
                addr: 0x0800_0000,
                data: vec![1, 2]
            })
        );
        assert_eq!(parse_packet(b"vFlashDone"), Packet::V(VPacket::FlashDone));
        assert_eq!(parse_packet(b"vKill;1"), Packet::V(VPacket::Kill));
        assert_eq!(
            parse_packet(b"vMustReplyEmpty"),
            Packet::V(VPacket::Unknown)
        );
    }

    #[test]
    fn unknown_input_is_not_an_error() {
        assert_eq!(parse_packet(b"D"), Packet::Unknown);
        assert_eq!(parse_packet(b""), Packet::Unknown);
        assert_eq!(parse_packet(b"T05"), Packet::Unknown);
    }
}
