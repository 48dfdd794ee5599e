//! Protocol 7.00 packet layer.
//!
//! Packets are ASCII-framed: a raw type byte, a two-digit hex subtype, an
//! extension marker, and for extended packets a four-digit hex length and a
//! 0x5C-padded payload, all closed by a two-digit hex checksum.

pub(crate) mod flash;
pub(crate) mod flows;
pub(crate) mod ohp;

use crate::error::{Error, Result};
use crate::link::Link;
use tracing::{debug, error, trace};

/// Timeout before the first byte of a packet; 0 waits forever.
const TIMEOUT_PACKET_START: u64 = 0;
/// Timeout for every byte after the first one.
const TIMEOUT_PACKET_CONTENTS: u64 = 2000;

pub(crate) const PACKET_TYPE_COMMAND: u8 = 0x01;
pub(crate) const PACKET_TYPE_DATA: u8 = 0x02;
pub(crate) const PACKET_TYPE_ROLESWAP: u8 = 0x03;
pub(crate) const PACKET_TYPE_CHECK: u8 = 0x05;
pub(crate) const PACKET_TYPE_ACK: u8 = 0x06;
pub(crate) const PACKET_TYPE_NAK: u8 = 0x15;
pub(crate) const PACKET_TYPE_TERM: u8 = 0x18;

pub(crate) const PACKET_SUBTYPE_CHECK_INIT: u8 = 0x00;

pub(crate) const PACKET_SUBTYPE_ACK_BASIC: u8 = 0x00;
pub(crate) const PACKET_SUBTYPE_ACK_CONFIRM_OVERWRITE: u8 = 0x01;
pub(crate) const PACKET_SUBTYPE_ACK_EXTENDED: u8 = 0x02;
pub(crate) const PACKET_SUBTYPE_ACK_TERM: u8 = 0x03;

pub(crate) const PACKET_SUBTYPE_NAK_RESEND: u8 = 0x01;
pub(crate) const PACKET_SUBTYPE_NAK_OVERWRITE: u8 = 0x02;
pub(crate) const PACKET_SUBTYPE_NAK_REJECT_OVERWRITE: u8 = 0x03;

pub(crate) const PACKET_SUBTYPE_TERM_BASIC: u8 = 0x00;

/// Upper bound on the raw response to the discovery command; fx-9860G
/// devices send 164 bytes, fx-CG devices 188.
pub(crate) const RAW_DEVICE_INFO_MAX: usize = 200;

bitflags::bitflags! {
    pub(crate) struct SendFlags: u32 {
        /// Do not retry on NAK/RESEND; a single attempt only.
        const DISABLE_CHECKSUM = 0x01;
        /// Do not wait for the response packet.
        const DISABLE_RECEIVE = 0x02;
    }
}

pub(crate) struct SevenState {
    /// Code of the last executed command; data packets that follow a command
    /// reuse it as their subtype.
    pub(crate) last_command: u8,
    /// `(type, subtype)` of the last received packet.
    pub(crate) last_packet: Option<(u8, u8)>,
    /// Raw discovery response, kept so device information can be decoded on
    /// demand later.
    pub(crate) device_info: Option<Vec<u8>>,
}

impl SevenState {
    pub(crate) fn new() -> SevenState {
        SevenState {
            last_command: 0,
            last_packet: None,
            device_info: None,
        }
    }
}

pub(crate) fn is_ascii_hex(byte: u8) -> bool {
    byte.is_ascii_digit() || (b'A'..=b'F').contains(&byte)
}

pub(crate) fn nibble(byte: u8) -> u8 {
    if byte >= b'A' {
        byte - b'A' + 10
    } else {
        byte - b'0'
    }
}

/// Decode a 2-digit ASCII-hex byte. The caller has validated the digits.
pub(crate) fn hex_u8(raw: &[u8]) -> u8 {
    (nibble(raw[0]) << 4) | nibble(raw[1])
}

/// Decode a 4-digit ASCII-hex word. The caller has validated the digits.
pub(crate) fn hex_u16(raw: &[u8]) -> u16 {
    raw[..4]
        .iter()
        .fold(0u16, |acc, &b| (acc << 4) | nibble(b) as u16)
}

/// Write `value` as 2 ASCII-hex digits at the start of `buf`.
pub(crate) fn set_ascii_hex(buf: &mut [u8], value: u8) {
    const DIGITS: &[u8; 16] = b"0123456789ABCDEF";
    buf[0] = DIGITS[(value >> 4) as usize];
    buf[1] = DIGITS[(value & 15) as usize];
}

/// One-byte two's-complement checksum of the covered bytes.
pub(crate) fn checksum(data: &[u8]) -> u8 {
    crate::casiolink::checksum(data)
}

/// Apply 0x5C padding: bytes below 0x20 become `'\'` plus the byte + 0x20,
/// and `'\'` itself is doubled. Returns the padded size; `buf` must hold at
/// least `data.len() * 2` bytes.
pub(crate) fn pad(buf: &mut [u8], data: &[u8]) -> usize {
    let mut out = 0;
    for &byte in data {
        if byte < 0x20 {
            buf[out] = b'\\';
            buf[out + 1] = 0x20 + byte;
            out += 2;
        } else if byte == b'\\' {
            buf[out] = b'\\';
            buf[out + 1] = b'\\';
            out += 2;
        } else {
            buf[out] = byte;
            out += 1;
        }
    }
    out
}

/// Reverse 0x5C padding. Returns the unpadded size; `buf` must hold at
/// least `data.len()` bytes. A trailing lone `'\'` is dropped.
pub(crate) fn unpad(buf: &mut [u8], data: &[u8]) -> usize {
    let mut out = 0;
    let mut iter = data.iter();
    while let Some(&byte) = iter.next() {
        if byte == b'\\' {
            match iter.next() {
                Some(&b'\\') => buf[out] = b'\\',
                Some(&escaped) => buf[out] = escaped.wrapping_sub(0x20),
                None => break,
            }
        } else {
            buf[out] = byte;
        }
        out += 1;
    }
    out
}

/// Receive and decode one packet into the link's codec state. Extended
/// payloads are unpadded into the scratch buffer.
pub(crate) fn receive(link: &mut Link) -> Result<()> {
    let mut buf = [0u8; 540];

    // A packet is at least 6 bytes: type (1) + subtype (2) + extension
    // marker (1) + checksum (2).
    link.stream
        .read(&mut buf[..6], TIMEOUT_PACKET_START, TIMEOUT_PACKET_CONTENTS)?;

    if !is_ascii_hex(buf[1]) || !is_ascii_hex(buf[2]) || (buf[3] != b'0' && buf[3] != b'1') {
        error!("invalid format for the packet header: {:02x?}", &buf[..6]);
        return Err(Error::Unknown);
    }

    let mut data_size = 0usize;
    let packet_size = if buf[3] == b'0' {
        6
    } else {
        // Extended: four more length digits, then the payload overlaps what
        // we have already read past the length field.
        match link.stream.read(
            &mut buf[6..10],
            TIMEOUT_PACKET_CONTENTS,
            TIMEOUT_PACKET_CONTENTS,
        ) {
            Err(Error::TimeoutStart) => return Err(Error::Timeout),
            other => other?,
        }

        if buf[4..8].iter().any(|&b| !is_ascii_hex(b)) {
            error!("invalid format for the data size: {:02x?}", &buf[..10]);
            return Err(Error::Unknown);
        }
        data_size = hex_u16(&buf[4..8]) as usize;

        if data_size == 0 || data_size > 528 {
            error!(data_size, "invalid data size for the extended packet");
            if data_size > 0 {
                link.stream
                    .skip(data_size, TIMEOUT_PACKET_CONTENTS, TIMEOUT_PACKET_CONTENTS)?;
            }
            return Err(Error::DataSize);
        }

        match link.stream.read(
            &mut buf[10..10 + data_size],
            TIMEOUT_PACKET_CONTENTS,
            TIMEOUT_PACKET_CONTENTS,
        ) {
            Err(Error::TimeoutStart) => return Err(Error::Timeout),
            other => other?,
        }
        10 + data_size
    };

    trace!(packet = ?&buf[..packet_size], "received packet");

    if !is_ascii_hex(buf[packet_size - 2]) || !is_ascii_hex(buf[packet_size - 1]) {
        error!("invalid checksum format: {:02x?}", &buf[..packet_size]);
        return Err(Error::Corrupt);
    }
    let obtained = hex_u8(&buf[packet_size - 2..]);
    let computed = checksum(&buf[1..packet_size - 2]);
    if obtained != computed {
        error!(
            "obtained checksum 0x{:02X} does not match computed checksum 0x{:02X}",
            obtained, computed
        );
        return Err(Error::Corrupt);
    }

    link.seven_mut().last_packet = Some((buf[0], hex_u8(&buf[1..3])));

    link.scratch_size = if data_size > 0 {
        unpad(&mut link.scratch, &buf[8..8 + data_size])
    } else {
        0
    };

    Ok(())
}

/// Send a raw packet and receive its response, re-sending up to 3 times when
/// the peer answers NAK/RESEND.
pub(crate) fn send_and_receive(link: &mut Link, flags: SendFlags, raw: &[u8]) -> Result<()> {
    let tries = if flags.contains(SendFlags::DISABLE_CHECKSUM) {
        1
    } else {
        3
    };

    for _ in 0..tries {
        trace!(packet = ?raw, "sending packet");
        link.stream.write(raw)?;

        if flags.contains(SendFlags::DISABLE_RECEIVE) {
            return Ok(());
        }

        receive(link)?;
        if link.seven_mut().last_packet == Some((PACKET_TYPE_NAK, PACKET_SUBTYPE_NAK_RESEND)) {
            // The medium may have invalidated our checksum; try again.
            debug!("peer requested a resend");
            continue;
        }
        return Ok(());
    }

    Err(Error::Corrupt)
}

/// Send a basic packet and receive the response.
pub(crate) fn send_basic(link: &mut Link, flags: SendFlags, ty: u8, subtype: u8) -> Result<()> {
    let mut packet = [0u8; 6];
    packet[0] = ty;
    set_ascii_hex(&mut packet[1..], subtype);
    packet[3] = b'0';
    let sum = checksum(&packet[1..4]);
    set_ascii_hex(&mut packet[4..], sum);
    send_and_receive(link, flags, &packet)
}

/// Send an extended packet (payload up to 1,028 bytes before padding) and
/// receive the response.
pub(crate) fn send_extended(
    link: &mut Link,
    flags: SendFlags,
    ty: u8,
    subtype: u8,
    data: &[u8],
) -> Result<()> {
    let mut packet = [0u8; 2066];

    if data.len() > 1028 {
        error!(size = data.len(), "extended packet payload is too large");
        return Err(Error::Unknown);
    }

    let padded_size = pad(&mut packet[8..], data);

    packet[0] = ty;
    set_ascii_hex(&mut packet[1..], subtype);
    packet[3] = b'1';
    set_ascii_hex(&mut packet[4..], (padded_size >> 8) as u8);
    set_ascii_hex(&mut packet[6..], padded_size as u8);
    let sum = checksum(&packet[1..8 + padded_size]);
    set_ascii_hex(&mut packet[8 + padded_size..], sum);

    send_and_receive(link, flags, &packet[..10 + padded_size])
}

/// Fail unless the last received packet matches `(ty, subtype)`.
pub(crate) fn expect_packet(link: &mut Link, ty: u8, subtype: u8) -> Result<()> {
    let last = link.seven_mut().last_packet;
    if last != Some((ty, subtype)) {
        debug!(
            "expected a packet of type {:02X} and subtype {:02X}, got {:?}",
            ty, subtype, last
        );
        return Err(Error::Unknown);
    }
    Ok(())
}

pub(crate) fn expect_basic_ack(link: &mut Link) -> Result<()> {
    expect_packet(link, PACKET_TYPE_ACK, PACKET_SUBTYPE_ACK_BASIC)
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    /// Encode a basic packet the way a peer would put it on the wire.
    pub(crate) fn basic_packet(ty: u8, subtype: u8) -> Vec<u8> {
        let mut packet = vec![ty];
        let mut field = [0u8; 2];
        set_ascii_hex(&mut field, subtype);
        packet.extend_from_slice(&field);
        packet.push(b'0');
        let sum = checksum(&packet[1..]);
        set_ascii_hex(&mut field, sum);
        packet.extend_from_slice(&field);
        packet
    }

    /// Encode an extended packet the way a peer would put it on the wire.
    pub(crate) fn extended_packet(ty: u8, subtype: u8, data: &[u8]) -> Vec<u8> {
        let mut padded = vec![0u8; data.len() * 2];
        let padded_size = pad(&mut padded, data);
        padded.truncate(padded_size);

        let mut packet = vec![ty];
        let mut field = [0u8; 2];
        set_ascii_hex(&mut field, subtype);
        packet.extend_from_slice(&field);
        packet.push(b'1');
        set_ascii_hex(&mut field, (padded_size >> 8) as u8);
        packet.extend_from_slice(&field);
        set_ascii_hex(&mut field, padded_size as u8);
        packet.extend_from_slice(&field);
        packet.extend_from_slice(&padded);
        let sum = checksum(&packet[1..]);
        set_ascii_hex(&mut field, sum);
        packet.extend_from_slice(&field);
        packet
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pad_expands_control_bytes_and_backslashes() {
        let mut buf = [0u8; 16];
        let n = pad(&mut buf, &[0x00, 0x1F, b'\\', b'A']);
        assert_eq!(&buf[..n], b"\\\x20\\\x3F\\\\A");
    }

    #[test]
    fn unpad_reverses_pad() {
        // Round-trip over every byte value, which covers both escape rules.
        let data: Vec<u8> = (0..=255).collect();
        let mut padded = [0u8; 512];
        let padded_size = pad(&mut padded, &data);
        assert!(padded_size <= data.len() * 2);

        let mut unpadded = [0u8; 512];
        let unpadded_size = unpad(&mut unpadded, &padded[..padded_size]);
        assert_eq!(&unpadded[..unpadded_size], &data[..]);
    }

    #[test]
    fn unpad_drops_a_trailing_lone_escape() {
        let mut buf = [0u8; 8];
        let n = unpad(&mut buf, b"AB\\");
        assert_eq!(&buf[..n], b"AB");
    }

    #[test]
    fn checksum_matches_known_packets() {
        // CHECK/INIT: 05 "00" "0" -> checksum over "000".
        assert_eq!(checksum(b"000"), 0x70);
        // Any packet's body plus its checksum sums to zero modulo 256.
        let body = b"01100A4";
        let sum = checksum(body);
        let total: u32 = body.iter().map(|&b| b as u32).sum::<u32>() + sum as u32;
        assert_eq!(total & 0xFF, 0);
    }

    #[test]
    fn ascii_hex_helpers_round_trip() {
        let mut buf = [0u8; 2];
        for value in [0x00u8, 0x0F, 0xA5, 0xFF] {
            set_ascii_hex(&mut buf, value);
            assert!(buf.iter().all(|&b| is_ascii_hex(b)));
            assert_eq!(hex_u8(&buf), value);
        }
        assert_eq!(hex_u16(b"01A4"), 0x01A4);
    }

    use super::testutil::{basic_packet, extended_packet};
    use crate::link::testlink;
    use crate::medium::mock::MockMedium;

    #[test]
    fn receive_decodes_encoded_packets() {
        let payload: Vec<u8> = (0..64u8).collect();
        let mut mock = MockMedium::new();
        mock.queue_read(&basic_packet(PACKET_TYPE_ACK, 0x00));
        mock.queue_read(&extended_packet(PACKET_TYPE_DATA, 0x45, &payload));
        let mut link = testlink::seven(mock);

        receive(&mut link).unwrap();
        assert_eq!(
            link.seven_mut().last_packet,
            Some((PACKET_TYPE_ACK, PACKET_SUBTYPE_ACK_BASIC))
        );
        assert_eq!(link.scratch_size, 0);

        receive(&mut link).unwrap();
        assert_eq!(link.seven_mut().last_packet, Some((PACKET_TYPE_DATA, 0x45)));
        assert_eq!(&link.scratch[..link.scratch_size], &payload[..]);

        link.flags.remove(crate::link::LinkFlags::TERMINATE);
    }

    #[test]
    fn extended_size_out_of_bounds_is_datasize() {
        // Declared length 0x0212 = 530 > 528. The declared run must be
        // skipped so the stream stays aligned.
        let mut packet = vec![PACKET_TYPE_DATA];
        packet.extend_from_slice(b"0010212");
        packet.extend_from_slice(&[b'A'; 530]);
        packet.extend_from_slice(b"00");
        let mut mock = MockMedium::new();
        mock.queue_read(&packet);
        let mut link = testlink::seven(mock);

        assert_eq!(receive(&mut link), Err(Error::DataSize));
        assert_eq!(link.mock_mut().reads.len(), 0);
        link.flags.remove(crate::link::LinkFlags::TERMINATE);
    }

    #[test]
    fn zero_length_extended_packet_is_datasize() {
        let mut packet = vec![PACKET_TYPE_DATA];
        packet.extend_from_slice(b"0010000");
        packet.extend_from_slice(b"00"); // where the checksum would sit
        let mut mock = MockMedium::new();
        mock.queue_read(&packet);
        let mut link = testlink::seven(mock);

        assert_eq!(receive(&mut link), Err(Error::DataSize));
        link.flags.remove(crate::link::LinkFlags::TERMINATE);
    }

    #[test]
    fn resend_requests_are_honoured_three_times() {
        let mut mock = MockMedium::new();
        for _ in 0..3 {
            mock.queue_read(&basic_packet(PACKET_TYPE_NAK, PACKET_SUBTYPE_NAK_RESEND));
        }
        let mut link = testlink::seven(mock);

        let result = send_basic(
            &mut link,
            SendFlags::empty(),
            PACKET_TYPE_CHECK,
            PACKET_SUBTYPE_CHECK_INIT,
        );
        assert_eq!(result, Err(Error::Corrupt));

        // The same packet went out three times.
        let one = basic_packet(PACKET_TYPE_CHECK, PACKET_SUBTYPE_CHECK_INIT);
        let written = link.mock_mut().written.clone();
        assert_eq!(written.len(), 3 * one.len());
        assert!(written.chunks(one.len()).all(|chunk| chunk == &one[..]));
        link.flags.remove(crate::link::LinkFlags::TERMINATE);
    }
}
