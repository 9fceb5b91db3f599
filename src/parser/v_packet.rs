//! `v` packet sub-parser.
//!
//! Only the flash programming trio and `vKill` are implemented; every other
//! verb (including `vMustReplyEmpty`, by design) gets the empty reply.

use nom::branch::alt;
use nom::bytes::complete::tag;
use nom::character::complete::char;
use nom::combinator::{map, rest, value};
use nom::number::complete::hex_u32;
use nom::IResult;

use super::Packet;

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum VPacket {
    /// `vFlashErase:addr,length`
    FlashErase { addr: u32, length: u32 },
    /// `vFlashWrite:addr:data` — data is raw binary, unescaped upstream
    FlashWrite { addr: u32, data: Vec<u8> },
    /// `vFlashDone`
    FlashDone,
    /// `vKill[;pid]`
    Kill,
    /// Unrecognized verb; answered empty
    Unknown,
}

pub(super) fn v(input: &[u8]) -> IResult<&[u8], Packet> {
    let (input, _) = char('v')(input)?;
    let (input, packet) = alt((flash_erase, flash_write, flash_done, kill, unknown))(input)?;

    Ok((input, Packet::V(packet)))
}

fn flash_erase(input: &[u8]) -> IResult<&[u8], VPacket> {
    let (input, _) = tag("FlashErase:")(input)?;
    let (input, addr) = hex_u32(input)?;
    let (input, _) = char(',')(input)?;
    let (input, length) = hex_u32(input)?;

    Ok((input, VPacket::FlashErase { addr, length }))
}

fn flash_write(input: &[u8]) -> IResult<&[u8], VPacket> {
    let (input, _) = tag("FlashWrite:")(input)?;
    let (input, addr) = hex_u32(input)?;
    let (input, _) = char(':')(input)?;
    let (input, data) = rest(input)?;

    Ok((
        input,
        VPacket::FlashWrite {
            addr,
            data: data.to_vec(),
        },
    ))
}

fn flash_done(input: &[u8]) -> IResult<&[u8], VPacket> {
    value(VPacket::FlashDone, tag("FlashDone"))(input)
}

fn kill(input: &[u8]) -> IResult<&[u8], VPacket> {
    value(VPacket::Kill, tag("Kill"))(input)
}

fn unknown(input: &[u8]) -> IResult<&[u8], VPacket> {
    map(rest, |_| VPacket::Unknown)(input)
}
