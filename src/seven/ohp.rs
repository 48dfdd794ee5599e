//! Protocol 7.00 screen-streaming receiver.
//!
//! The calculator broadcasts frame packets continuously and occasionally
//! drops bytes, so the receiver re-synchronises on the six-byte prologue of
//! every known packet before parsing anything.

use super::*;
use crate::screen::{Frame, PictureFormat};
use tracing::{error, trace, warn};

const PACKET_TYPE_FRAME: u8 = 0x0B;
const OHP_PACKET_TYPE_CHECK: u8 = 0x16;

/// Prologues we can re-align on.
const ALIGNMENT_SEQUENCES: [&[u8; 6]; 4] = [
    b"\x0BTYP01",
    b"\x0BTYPZ1",
    b"\x0BTYPZ2",
    b"\x16CAL00",
];

pub(crate) struct OhpState {
    pub(crate) last_packet_type: Option<u8>,
    pub(crate) last_packet_subtype: [u8; 5],
    pub(crate) picture_width: u32,
    pub(crate) picture_height: u32,
    pub(crate) picture_format: Option<PictureFormat>,
}

impl OhpState {
    pub(crate) fn new() -> OhpState {
        OhpState {
            last_packet_type: None,
            last_packet_subtype: [0; 5],
            picture_width: 0,
            picture_height: 0,
            picture_format: None,
        }
    }
}

/// Read six bytes and slide the window until it lines up with one of the
/// known prologues. Costs at most two frames on desync, then recovers.
fn align(link: &mut Link, buf: &mut [u8], first_timeout: u64) -> Result<()> {
    let mut to_complete = 6;
    loop {
        let start = 6 - to_complete;
        link.stream
            .read(&mut buf[start..6], first_timeout, TIMEOUT_PACKET_CONTENTS)?;

        // Find the longest suffix of the window that is a prefix of a
        // known prologue.
        to_complete = 'search: loop {
            for shift in 0..6 {
                for sequence in &ALIGNMENT_SEQUENCES {
                    if buf[shift..6] == sequence[..6 - shift] {
                        break 'search shift;
                    }
                }
            }
            break 6;
        };

        if to_complete == 0 {
            return Ok(());
        }
        if to_complete < 6 {
            buf.copy_within(to_complete..6, 0);
        }
    }
}

/// Receive one screen-streaming packet into the link's codec state. Frame
/// payloads land in the scratch buffer.
pub(crate) fn receive(link: &mut Link, first_timeout: u64) -> Result<()> {
    let mut buf = [0u8; 50];

    align(link, &mut buf[..6], first_timeout)?;

    {
        let state = link.ohp_mut();
        state.last_packet_type = Some(buf[0]);
        state.last_packet_subtype.copy_from_slice(&buf[1..6]);
    }
    link.scratch_size = 0;

    let mut packet_size = 6usize;
    if buf[0] == OHP_PACKET_TYPE_CHECK || buf[0] == PACKET_TYPE_ACK {
        // Only the type and subtype matter, and they are stored already.
    } else if buf[0] == PACKET_TYPE_FRAME {
        let mut width = 0usize;
        let mut height = 0usize;
        let mut format = None;
        let mut frame_length = 0usize;

        if &buf[1..6] == b"TYP01" {
            width = 128;
            height = 64;
            format = Some(PictureFormat::Mono);
            frame_length = 1024;
        } else if &buf[1..6] == b"TYPZ1" || &buf[1..6] == b"TYPZ2" {
            // TYPZ1 carries a 6-digit frame length, TYPZ2 an 8-digit one;
            // both are followed by 4-digit height and width and a 4-char
            // format code.
            let length_digits = if buf[5] == b'1' { 6 } else { 8 };
            let tail = 12 + length_digits;
            match link.stream.read(
                &mut buf[6..6 + tail],
                TIMEOUT_PACKET_CONTENTS,
                TIMEOUT_PACKET_CONTENTS,
            ) {
                Err(Error::TimeoutStart) => return Err(Error::Timeout),
                other => other?,
            }
            packet_size += tail;

            if buf[6..6 + length_digits].iter().any(|&b| !is_ascii_hex(b)) {
                return Err(Error::Corrupt);
            }
            frame_length = buf[6..6 + length_digits]
                .iter()
                .fold(0usize, |acc, &b| (acc << 4) | nibble(b) as usize);

            if buf[packet_size - 12..packet_size - 4]
                .iter()
                .any(|&b| !is_ascii_hex(b))
            {
                // The header is corrupted; skip the payload and checksum so
                // the next reception starts aligned.
                link.stream.skip(
                    frame_length + 2,
                    TIMEOUT_PACKET_CONTENTS,
                    TIMEOUT_PACKET_CONTENTS,
                )?;
                return Err(Error::Corrupt);
            }

            height = hex_u16(&buf[packet_size - 12..]) as usize;
            width = hex_u16(&buf[packet_size - 8..]) as usize;

            format = match &buf[packet_size - 4..packet_size] {
                b"1RC2" => Some(PictureFormat::R5G6B5),
                b"1RC3" => Some(PictureFormat::Rgb4BitPacked),
                b"1RM2" => Some(PictureFormat::MonoDual),
                other => {
                    warn!("unknown frame format: {:02x?}", other);
                    None
                }
            };
        } else {
            error!(
                "unknown frame subtype: {:02x?}; the length cannot be determined",
                &buf[1..6]
            );
        }

        if frame_length == 0 {
            link.stream
                .skip(2, TIMEOUT_PACKET_CONTENTS, TIMEOUT_PACKET_CONTENTS)?;
            return Err(Error::Unknown);
        }
        let format = match format {
            Some(format) => format,
            None => {
                link.stream.skip(
                    frame_length + 2,
                    TIMEOUT_PACKET_CONTENTS,
                    TIMEOUT_PACKET_CONTENTS,
                )?;
                return Err(Error::Unknown);
            }
        };

        // The declared length must agree with the frame geometry.
        let expected = format.frame_size(width, height);
        if expected != Some(frame_length) {
            error!(
                frame_length,
                ?expected,
                width,
                height,
                "frame length does not match the announced geometry"
            );
            link.stream.skip(
                frame_length + 2,
                TIMEOUT_PACKET_CONTENTS,
                TIMEOUT_PACKET_CONTENTS,
            )?;
            return Err(Error::Unknown);
        }

        if frame_length > link.scratch.len() {
            error!(
                frame_length,
                capacity = link.scratch.len(),
                "frame exceeds the scratch buffer"
            );
            link.stream.skip(
                frame_length + 2,
                TIMEOUT_PACKET_CONTENTS,
                TIMEOUT_PACKET_CONTENTS,
            )?;
            return Err(Error::DataSize);
        }

        match link.stream.read(
            &mut link.scratch[..frame_length],
            TIMEOUT_PACKET_CONTENTS,
            TIMEOUT_PACKET_CONTENTS,
        ) {
            Err(Error::TimeoutStart) => return Err(Error::Timeout),
            other => other?,
        }

        let state = link.ohp_mut();
        state.picture_width = width as u32;
        state.picture_height = height as u32;
        state.picture_format = Some(format);
        link.scratch_size = frame_length;
    } else {
        error!("unknown packet type 0x{:02X}", buf[0]);
        link.stream
            .skip(2, TIMEOUT_PACKET_CONTENTS, TIMEOUT_PACKET_CONTENTS)?;
        return Err(Error::Unknown);
    }

    trace!(header = ?&buf[..packet_size], "received packet header");

    let mut checksum_field = [0u8; 2];
    match link.stream.read(
        &mut checksum_field,
        TIMEOUT_PACKET_CONTENTS,
        TIMEOUT_PACKET_CONTENTS,
    ) {
        Err(Error::TimeoutStart) => return Err(Error::Timeout),
        other => other?,
    }
    if !is_ascii_hex(checksum_field[0]) || !is_ascii_hex(checksum_field[1]) {
        return Err(Error::Corrupt);
    }

    // Checksums are additive: checksum(A) + checksum(B) == checksum(AB).
    let obtained = hex_u8(&checksum_field);
    let mut computed = checksum(&buf[1..packet_size]);
    if link.scratch_size > 0 {
        computed = computed.wrapping_add(checksum(&link.scratch[..link.scratch_size]));
    }
    if obtained != computed {
        error!(
            "obtained checksum 0x{:02X} does not match computed checksum 0x{:02X}",
            obtained, computed
        );
        return Err(Error::Corrupt);
    }

    Ok(())
}

/// Answer a CHECK keep-alive.
fn send_basic(link: &mut Link, ty: u8, subtype: &[u8; 5]) -> Result<()> {
    let mut buf = [0u8; 8];
    buf[0] = ty;
    buf[1..6].copy_from_slice(subtype);
    let sum = checksum(&buf[1..6]);
    set_ascii_hex(&mut buf[6..], sum);
    trace!(packet = ?&buf, "sending packet");
    link.stream.write(&buf)
}

/// Deliver frames to the sink until it asks to stop or the medium fails.
/// A corrupt frame is dropped and reception continues.
pub(crate) fn get_screen(
    link: &mut Link,
    sink: &mut dyn FnMut(&Frame<'_>) -> bool,
) -> Result<()> {
    loop {
        match receive(link, TIMEOUT_PACKET_START) {
            Ok(()) => {}
            Err(Error::Corrupt) => {
                warn!("missed a frame due to corruption");
                continue;
            }
            Err(e) => return Err(e),
        }

        match link.ohp_mut().last_packet_type {
            Some(PACKET_TYPE_FRAME) => {
                let state = link.ohp_ref();
                let frame = Frame {
                    width: state.picture_width,
                    height: state.picture_height,
                    // A successfully received frame always has a format.
                    format: state.picture_format.ok_or(Error::Unknown)?,
                    data: &link.scratch[..link.scratch_size],
                };
                if sink(&frame) {
                    return Err(Error::Interrupted);
                }
            }
            Some(OHP_PACKET_TYPE_CHECK) => {
                send_basic(link, PACKET_TYPE_ACK, b"02001")?;
            }
            other => {
                error!(?other, "unexpected packet type, exiting");
                return Err(Error::Unknown);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::testlink;
    use crate::medium::mock::MockMedium;

    fn checksum_field(covered: &[&[u8]]) -> [u8; 2] {
        let mut sum = 0u8;
        for part in covered {
            sum = sum.wrapping_add(checksum(part));
        }
        let mut field = [0u8; 2];
        set_ascii_hex(&mut field, sum);
        field
    }

    fn typ01_frame(payload: &[u8; 1024]) -> Vec<u8> {
        let mut packet = vec![PACKET_TYPE_FRAME];
        packet.extend_from_slice(b"TYP01");
        packet.extend_from_slice(payload);
        packet.extend_from_slice(&checksum_field(&[b"TYP01", payload]));
        packet
    }

    fn typz2_frame(width: u16, height: u16, format: &[u8; 4], payload: &[u8]) -> Vec<u8> {
        let header = format!(
            "TYPZ2{:08X}{:04X}{:04X}",
            payload.len(),
            height,
            width
        );
        let mut packet = vec![PACKET_TYPE_FRAME];
        packet.extend_from_slice(header.as_bytes());
        packet.extend_from_slice(format);
        packet.extend_from_slice(&checksum_field(&[header.as_bytes(), format, payload]));
        // The payload comes before the checksum on the wire.
        let checksum_at = packet.len() - 2;
        let mut wire = packet[..checksum_at].to_vec();
        wire.extend_from_slice(payload);
        wire.extend_from_slice(&packet[checksum_at..]);
        wire
    }

    fn check_packet() -> Vec<u8> {
        let mut packet = vec![OHP_PACKET_TYPE_CHECK];
        packet.extend_from_slice(b"CAL00");
        packet.extend_from_slice(&checksum_field(&[b"CAL00"]));
        packet
    }

    #[test]
    fn resyncs_over_injected_garbage() {
        // S4: three stray bytes precede a valid monochrome frame.
        let mut mock = MockMedium::new();
        let payload = [0x5Au8; 1024];
        let mut wire = vec![0xAA, 0xAA, 0xAA];
        wire.extend_from_slice(&typ01_frame(&payload));
        mock.queue_read(&wire);
        let mut link = testlink::ohp(mock);

        let mut frames = Vec::new();
        let mut sink = |frame: &Frame<'_>| {
            frames.push((frame.width, frame.height, frame.format, frame.data.to_vec()));
            true
        };
        assert_eq!(get_screen(&mut link, &mut sink), Err(Error::Interrupted));
        assert_eq!(link.ohp_ref().last_packet_subtype, *b"TYP01");

        let (width, height, format, data) = &frames[0];
        assert_eq!((*width, *height, *format), (128, 64, PictureFormat::Mono));
        assert_eq!(data[..], payload[..]);
    }

    #[test]
    fn typz2_frame_with_a_shifted_stream() {
        // Up to five bytes may be lost before the prologue; the frame after
        // it must still come out.
        let payload: Vec<u8> = (0..16u8).map(|i| i.wrapping_mul(17) | 0x20).collect();
        let mut wire = vec![0xAA; 5];
        wire.extend_from_slice(&typz2_frame(4, 2, b"1RC2", &payload));
        let mut mock = MockMedium::new();
        mock.queue_read(&wire);
        let mut link = testlink::ohp(mock);

        let mut frames = Vec::new();
        let mut sink = |frame: &Frame<'_>| {
            frames.push((frame.width, frame.height, frame.format, frame.data.to_vec()));
            true
        };
        assert_eq!(get_screen(&mut link, &mut sink), Err(Error::Interrupted));
        assert_eq!(frames[0].0, 4);
        assert_eq!(frames[0].1, 2);
        assert_eq!(frames[0].2, PictureFormat::R5G6B5);
        assert_eq!(frames[0].3, payload);
    }

    #[test]
    fn check_packets_are_acknowledged() {
        let mut mock = MockMedium::new();
        mock.queue_read(&check_packet());
        mock.queue_read(&typ01_frame(&[0u8; 1024]));
        let mut link = testlink::ohp(mock);

        let mut sink = |_: &Frame<'_>| true;
        assert_eq!(get_screen(&mut link, &mut sink), Err(Error::Interrupted));

        let mut expected = vec![PACKET_TYPE_ACK];
        expected.extend_from_slice(b"02001");
        expected.extend_from_slice(&checksum_field(&[b"02001"]));
        assert_eq!(link.mock_mut().written, expected);
    }

    #[test]
    fn corrupt_frame_is_dropped_and_reception_continues() {
        let mut corrupt = typ01_frame(&[0x11u8; 1024]);
        let len = corrupt.len();
        corrupt[len - 1] = b'0';
        corrupt[len - 2] = b'0';
        let good = [0x42u8; 1024];
        let mut mock = MockMedium::new();
        mock.queue_read(&corrupt);
        mock.queue_read(&typ01_frame(&good));
        let mut link = testlink::ohp(mock);

        let mut frames = Vec::new();
        let mut sink = |frame: &Frame<'_>| {
            frames.push(frame.data.to_vec());
            true
        };
        assert_eq!(get_screen(&mut link, &mut sink), Err(Error::Interrupted));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0][..], good[..]);
    }

    #[test]
    fn mismatched_geometry_is_rejected() {
        // 1RC2 at 4x2 needs 16 bytes; announce 18 instead.
        let payload = [0x20u8; 18];
        let wire = typz2_frame(4, 2, b"1RC2", &payload);
        let mut mock = MockMedium::new();
        mock.queue_read(&wire);
        let mut link = testlink::ohp(mock);

        assert_eq!(receive(&mut link, 0), Err(Error::Unknown));
        // The payload and checksum were skipped, leaving the stream dry but
        // aligned.
        assert_eq!(link.mock_mut().reads.len(), 0);
    }
}
