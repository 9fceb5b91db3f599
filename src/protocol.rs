//! GDB remote serial protocol framing.
//!
//! A packet travels as `$<payload>#<checksum>` where the checksum is the
//! modulo-256 sum of the payload bytes, written as two lowercase hex digits.
//! The receiver answers `+` for a good frame and `-` for a bad one; a `-`
//! triggers retransmission. A lone `0x03` byte outside a frame is the break
//! interrupt GDB sends while the target is running.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::TcpStream;

/// Packet size advertised in the `qSupported` reply.
pub const MAX_PACKET_SIZE: usize = 0x3fff;

/// Give up resending a packet after this many NAKs.
const SEND_RETRIES: usize = 5;

const CTRL_C: u8 = 0x03;

/// Byte stream the protocol runs over.
///
/// The extra method on top of [`Read`] + [`Write`] is the non-blocking poll
/// the continue loop uses to notice a `0x03` without stalling the target
/// poll cadence.
pub trait Transport: Read + Write {
    /// Takes a single byte off the stream if one is ready, without blocking.
    fn poll_byte(&mut self) -> io::Result<Option<u8>>;
}

impl Transport for TcpStream {
    fn poll_byte(&mut self) -> io::Result<Option<u8>> {
        self.set_nonblocking(true)?;
        let mut byte = [0u8; 1];
        let result = match self.read(&mut byte) {
            Ok(0) => Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(_) => Ok(Some(byte[0])),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        };
        self.set_nonblocking(false)?;
        result
    }
}

/// One side of a remote-protocol conversation.
pub struct GdbRemote<T: Transport> {
    stream: T,
    buffer: VecDeque<u8>,
}

impl<T: Transport> GdbRemote<T> {
    pub fn new(stream: T) -> Self {
        Self {
            stream,
            buffer: VecDeque::new(),
        }
    }

    pub fn get_ref(&self) -> &T {
        &self.stream
    }

    fn next_byte(&mut self) -> io::Result<u8> {
        if let Some(byte) = self.buffer.pop_front() {
            return Ok(byte);
        }
        let mut chunk = [0u8; 4096];
        let read = self.stream.read(&mut chunk)?;
        if read == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        self.buffer.extend(&chunk[..read]);
        Ok(self.buffer.pop_front().unwrap_or_default())
    }

    /// Receives one checksummed packet, ACKing good frames and NAKing bad
    /// ones until a good frame arrives. The returned payload is unescaped.
    ///
    /// Stray bytes in front of the `$` are discarded, which re-anchors the
    /// stream after a cancelled or mangled exchange.
    pub fn recv_packet(&mut self) -> io::Result<Vec<u8>> {
        loop {
            let mut byte = self.next_byte()?;
            while byte != b'$' {
                byte = self.next_byte()?;
            }

            let mut payload = Vec::new();
            let mut sum = 0u8;
            loop {
                let byte = self.next_byte()?;
                if byte == b'#' {
                    break;
                }
                if payload.len() > MAX_PACKET_SIZE * 2 {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "unterminated packet",
                    ));
                }
                sum = sum.wrapping_add(byte);
                payload.push(byte);
            }

            let hi = from_hex_digit(self.next_byte()?);
            let lo = from_hex_digit(self.next_byte()?);
            match (hi, lo) {
                (Some(hi), Some(lo)) if (hi << 4) | lo == sum => {
                    self.stream.write_all(b"+")?;
                    return Ok(unescape(&payload));
                }
                _ => {
                    tracing::warn!("bad checksum, requesting retransmission");
                    self.stream.write_all(b"-")?;
                }
            }
        }
    }

    /// Frames and sends `payload`, retransmitting on NAK.
    pub fn send_packet(&mut self, payload: &[u8]) -> io::Result<()> {
        let mut frame = Vec::with_capacity(payload.len() + 4);
        frame.push(b'$');
        let mut sum = 0u8;
        for &byte in payload {
            if matches!(byte, b'$' | b'#' | b'}' | b'*') {
                sum = sum.wrapping_add(b'}');
                frame.push(b'}');
                let escaped = byte ^ 0x20;
                sum = sum.wrapping_add(escaped);
                frame.push(escaped);
            } else {
                sum = sum.wrapping_add(byte);
                frame.push(byte);
            }
        }
        frame.push(b'#');
        frame.extend_from_slice(&encode_hex(&[sum]));

        for _ in 0..SEND_RETRIES {
            self.stream.write_all(&frame)?;
            loop {
                match self.next_byte()? {
                    b'+' => return Ok(()),
                    b'-' => break,
                    _ => continue,
                }
            }
            tracing::warn!("NAK received, resending packet");
        }
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "packet not acknowledged",
        ))
    }

    /// True if the client has sent a break (`0x03`) since the last receive.
    /// Any other pending byte is consumed and dropped, as the client is not
    /// supposed to pipeline commands while the target runs.
    pub fn check_for_interrupt(&mut self) -> io::Result<bool> {
        if let Some(byte) = self.buffer.pop_front() {
            return Ok(byte == CTRL_C);
        }
        Ok(self.stream.poll_byte()? == Some(CTRL_C))
    }
}

/// Reverses the `}`-escape: `}` followed by `b` decodes to `b ^ 0x20`.
pub fn unescape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut iter = data.iter();
    while let Some(&byte) = iter.next() {
        if byte == b'}' {
            match iter.next() {
                Some(&escaped) => out.push(escaped ^ 0x20),
                None => out.push(byte),
            }
        } else {
            out.push(byte);
        }
    }
    out
}

/// Applies the `}`-escape to every byte that is special on the wire.
pub fn escape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for &byte in data {
        if matches!(byte, b'$' | b'#' | b'}' | b'*') {
            out.push(b'}');
            out.push(byte ^ 0x20);
        } else {
            out.push(byte);
        }
    }
    out
}

pub fn from_hex_digit(digit: u8) -> Option<u8> {
    match digit {
        b'0'..=b'9' => Some(digit - b'0'),
        b'a'..=b'f' => Some(digit - b'a' + 10),
        b'A'..=b'F' => Some(digit - b'A' + 10),
        _ => None,
    }
}

/// Lowercase hex encoding, two digits per byte.
pub fn encode_hex(data: &[u8]) -> Vec<u8> {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    let mut out = Vec::with_capacity(data.len() * 2);
    for &byte in data {
        out.push(DIGITS[usize::from(byte >> 4)]);
        out.push(DIGITS[usize::from(byte & 0xf)]);
    }
    out
}

/// Decodes pairs of hex digits; a trailing odd digit is ignored.
pub fn decode_hex(data: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len() / 2);
    for pair in data.chunks_exact(2) {
        out.push((from_hex_digit(pair[0])? << 4) | from_hex_digit(pair[1])?);
    }
    Some(out)
}


#[cfg(test)]
mod tests {
    use super::testing::MockTransport;
    use super::*;

    #[test]
    fn escape_unescape_round_trip() {
        let all_bytes: Vec<u8> = (0..=255).collect();
        assert_eq!(unescape(&escape(&all_bytes)), all_bytes);
    }

    #[test]
    fn escape_covers_specials_only() {
        assert_eq!(escape(b"abc"), b"abc".to_vec());
        assert_eq!(escape(b"}"), b"}]".to_vec());
        assert_eq!(escape(b"$#*"), b"}\x04}\x03}\x0a".to_vec());
    }

    #[test]
    fn recv_acks_good_checksum() {
        let mut remote = GdbRemote::new(MockTransport::new(b"$qSupported#37"));
        let payload = remote.recv_packet().unwrap();
        assert_eq!(payload, b"qSupported");
        assert_eq!(remote.stream.output, b"+");
    }

    #[test]
    fn recv_naks_bad_checksum_then_accepts_retry() {
        let mut remote = GdbRemote::new(MockTransport::new(b"$qSupported#00$qSupported#37"));
        let payload = remote.recv_packet().unwrap();
        assert_eq!(payload, b"qSupported");
        assert_eq!(remote.stream.output, b"-+");
    }

    #[test]
    fn recv_resyncs_on_garbage() {
        let mut remote = GdbRemote::new(MockTransport::new(b"xx+\x03$?#3f"));
        let payload = remote.recv_packet().unwrap();
        assert_eq!(payload, b"?");
    }

    #[test]
    fn recv_unescapes_binary_payload() {
        // "a}\x5d b" on the wire decodes the escaped pair to '}'.
        let wire = b"$a}\x5db#";
        let sum: u8 = wire[1..wire.len() - 1]
            .iter()
            .fold(0u8, |a, &b| a.wrapping_add(b));
        let mut framed = wire.to_vec();
        framed.extend_from_slice(&encode_hex(&[sum]));
        let mut remote = GdbRemote::new(MockTransport::new(&framed));
        assert_eq!(remote.recv_packet().unwrap(), b"a}b");
    }

    #[test]
    fn send_formats_frame_and_waits_for_ack() {
        let mut remote = GdbRemote::new(MockTransport::new(b"+"));
        remote.send_packet(b"OK").unwrap();
        assert_eq!(remote.stream.output, b"$OK#9a");
    }

    #[test]
    fn send_retries_on_nak() {
        let mut remote = GdbRemote::new(MockTransport::new(b"-+"));
        remote.send_packet(b"OK").unwrap();
        assert_eq!(remote.stream.output, b"$OK#9a$OK#9a");
    }

    #[test]
    fn interrupt_check_sees_break_byte() {
        let mut remote = GdbRemote::new(MockTransport::new(&[0x03]));
        assert!(remote.check_for_interrupt().unwrap());
        let mut remote = GdbRemote::new(MockTransport::new(b""));
        assert!(!remote.check_for_interrupt().unwrap());
    }

    #[test]
    fn hex_helpers() {
        assert_eq!(encode_hex(&[0x12, 0xab]), b"12ab");
        assert_eq!(decode_hex(b"12ab").unwrap(), vec![0x12, 0xab]);
        assert!(decode_hex(b"zz").is_none());
    }
}
