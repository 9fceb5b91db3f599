//! `q` packet sub-parser.

use nom::branch::alt;
use nom::bytes::complete::{tag, take_while};
use nom::character::complete::char;
use nom::combinator::{map, map_opt, rest, value};
use nom::number::complete::hex_u32;
use nom::IResult;

use super::Packet;
use crate::protocol::decode_hex;

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum QueryPacket {
    /// `qSupported` — feature list from the client is ignored
    Supported,
    /// `qXfer:<object>:read::offset,length`
    Transfer {
        object: TransferObject,
        offset: u32,
        length: u32,
    },
    /// `qRcmd,<hex>` — monitor command, already unhexified
    Command(Vec<u8>),
    /// `qP`, `qC`, `qL` — thread queries, always answered empty
    Thread,
    /// Every other query; answered empty
    Unknown,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum TransferObject {
    MemoryMap,
    Features,
}

pub(super) fn query(input: &[u8]) -> IResult<&[u8], Packet> {
    let (input, _) = char('q')(input)?;
    let (input, packet) = alt((thread, supported, transfer, command, unknown))(input)?;

    Ok((input, Packet::Query(packet)))
}

fn thread(input: &[u8]) -> IResult<&[u8], QueryPacket> {
    let (input, _) = alt((char('P'), char('C'), char('L')))(input)?;

    Ok((input, QueryPacket::Thread))
}

fn supported(input: &[u8]) -> IResult<&[u8], QueryPacket> {
    value(QueryPacket::Supported, tag("Supported"))(input)
}

fn transfer_object(input: &[u8]) -> IResult<&[u8], TransferObject> {
    alt((
        value(TransferObject::MemoryMap, tag("memory-map")),
        value(TransferObject::Features, tag("features")),
    ))(input)
}

fn transfer(input: &[u8]) -> IResult<&[u8], QueryPacket> {
    let (input, _) = tag("Xfer:")(input)?;
    let (input, object) = transfer_object(input)?;
    let (input, _) = tag(":read:")(input)?;
    // The annex ("target.xml", or empty for the memory map) is not used.
    let (input, _annex) = take_while(|b| b != b':')(input)?;
    let (input, _) = char(':')(input)?;
    let (input, offset) = hex_u32(input)?;
    let (input, _) = char(',')(input)?;
    let (input, length) = hex_u32(input)?;

    Ok((
        input,
        QueryPacket::Transfer {
            object,
            offset,
            length,
        },
    ))
}

fn command(input: &[u8]) -> IResult<&[u8], QueryPacket> {
    let (input, _) = tag("Rcmd,")(input)?;
    map_opt(rest, |hex| decode_hex(hex).map(QueryPacket::Command))(input)
}

fn unknown(input: &[u8]) -> IResult<&[u8], QueryPacket> {
    map(rest, |_| QueryPacket::Unknown)(input)
}
