//! Protocol 7.00 command sequences and data phases.

use super::*;
use crate::link::{LinkFlags, SendFileFlags, StorageEntry};
use crate::params::{Parity, SerialParams, StopBits};
use std::io::{Read, Write};
use tracing::{debug, error};

bitflags::bitflags! {
    pub(crate) struct DataFlags: u32 {
        /// Never pipeline packets, even on non-serial mediums.
        const DISABLE_SHIFTING = 0x01;
    }
}

pub(crate) type Progress<'a> = Option<&'a mut dyn FnMut(u64, u64)>;

fn hex_u32(raw: &[u8]) -> u32 {
    raw[..8]
        .iter()
        .fold(0u32, |acc, &b| (acc << 4) | nibble(b) as u32)
}

fn report(progress: &mut Progress<'_>, current: u64, total: u64) {
    if let Some(f) = progress.as_mut() {
        f(current, total);
    }
}

/* ---
 * Command payloads.
 * --- */

/// Send a command packet. A command with no payload fields at all goes out
/// as a basic packet.
pub(crate) fn send_command(
    link: &mut Link,
    code: u8,
    overwrite: u8,
    datatype: u8,
    filesize: u32,
    params: [Option<&str>; 6],
) -> Result<()> {
    if overwrite == 0 && datatype == 0 && filesize == 0 && params.iter().all(|p| p.is_none()) {
        return send_basic(link, SendFlags::empty(), PACKET_TYPE_COMMAND, code);
    }

    let total: usize = params.iter().map(|p| p.map_or(0, str::len)).sum();
    if total > 232 {
        error!("combined lengths of the parameters cannot exceed 232 bytes");
        return Err(Error::Unknown);
    }

    // Data packets that follow the command must carry the command code as
    // their subtype.
    link.seven_mut().last_command = code;

    let mut payload = [0u8; 256];
    set_ascii_hex(&mut payload[0..], overwrite);
    set_ascii_hex(&mut payload[2..], datatype);
    set_ascii_hex(&mut payload[4..], (filesize >> 24) as u8);
    set_ascii_hex(&mut payload[6..], (filesize >> 16) as u8);
    set_ascii_hex(&mut payload[8..], (filesize >> 8) as u8);
    set_ascii_hex(&mut payload[10..], filesize as u8);
    for (i, param) in params.iter().enumerate() {
        set_ascii_hex(&mut payload[12 + 2 * i..], param.map_or(0, str::len) as u8);
    }

    let mut offset = 24;
    for param in params.iter().flatten() {
        payload[offset..offset + param.len()].copy_from_slice(param.as_bytes());
        offset += param.len();
    }

    send_extended(
        link,
        SendFlags::empty(),
        PACKET_TYPE_COMMAND,
        code,
        &payload[..offset],
    )
}

pub(crate) struct DecodedCommand {
    pub(crate) filesize: u32,
    pub(crate) params: [Vec<u8>; 6],
}

/// Decode the payload of a received command packet.
pub(crate) fn decode_command(link: &Link) -> Result<DecodedCommand> {
    let buf = &link.scratch[..link.scratch_size];

    if buf.len() < 24 {
        error!(size = buf.len(), "command payload is too small");
        return Err(Error::Unknown);
    }
    if buf[..24].iter().any(|&b| !is_ascii_hex(b)) {
        return Err(Error::Unknown);
    }

    let mut sizes = [0usize; 6];
    for (i, size) in sizes.iter_mut().enumerate() {
        *size = hex_u8(&buf[12 + 2 * i..]) as usize;
    }
    if buf.len() != 24 + sizes.iter().sum::<usize>() {
        return Err(Error::Unknown);
    }

    let filesize = hex_u32(&buf[4..12]);

    let mut params: [Vec<u8>; 6] = Default::default();
    let mut offset = 24;
    for (param, &size) in params.iter_mut().zip(&sizes) {
        *param = buf[offset..offset + size].to_vec();
        offset += size;
    }

    Ok(DecodedCommand { filesize, params })
}

/* ---
 * Handshake flows.
 * --- */

pub(crate) fn initiate(link: &mut Link) -> Result<()> {
    send_basic(
        link,
        SendFlags::empty(),
        PACKET_TYPE_CHECK,
        PACKET_SUBTYPE_CHECK_INIT,
    )?;
    if expect_basic_ack(link).is_err() {
        error!("calculator did not answer a basic ACK");
        return Err(Error::Unknown);
    }
    Ok(())
}

pub(crate) fn terminate(link: &mut Link) -> Result<()> {
    send_basic(
        link,
        SendFlags::empty(),
        PACKET_TYPE_TERM,
        PACKET_SUBTYPE_TERM_BASIC,
    )?;
    expect_basic_ack(link)
}

/// Request device information and cache the raw response for later decoding.
pub(crate) fn discover(link: &mut Link) -> Result<()> {
    send_command(link, 0x01, 0, 0, 0, [None; 6])?;
    expect_packet(link, PACKET_TYPE_ACK, PACKET_SUBTYPE_ACK_EXTENDED)?;

    if link.scratch_size > RAW_DEVICE_INFO_MAX {
        error!(
            size = link.scratch_size,
            "could not store obtained device information"
        );
        return Err(Error::DataSize);
    }
    let blob = link.scratch[..link.scratch_size].to_vec();
    link.seven_mut().device_info = Some(blob);
    Ok(())
}

/// Negotiate new serial parameters with the passive side. The local medium
/// is reprogrammed by the caller once the peer has agreed.
pub(crate) fn negotiate_serial_params(link: &mut Link, params: &SerialParams) -> Result<()> {
    let baud = params.speed.to_string();
    let parity = match params.parity {
        Parity::Even => "EVEN",
        Parity::Odd => "ODD",
        Parity::None => "NONE",
    };
    let stop_bits = match params.stop_bits {
        Some(StopBits::Two) => "2",
        _ => "1",
    };

    send_command(
        link,
        0x02,
        0,
        0,
        0,
        [Some(&baud), Some(parity), Some(stop_bits), None, None, None],
    )?;
    expect_basic_ack(link)
}

/* ---
 * Data phases.
 * --- */

/// Send a data stream as 256-byte DATA packets.
///
/// Packet shifting hides one round-trip of latency by transmitting the next
/// packet before the previous acknowledgement arrives. It is only engaged
/// for 3 packets or more, on non-serial mediums, and when the caller did
/// not opt out; a fault inside the shifted window leaves the peer's
/// counters unknowable, so the link is latched irrecoverable.
pub(crate) fn send_data(
    link: &mut Link,
    flags: DataFlags,
    reader: &mut dyn Read,
    size: usize,
    mut progress: Progress<'_>,
) -> Result<()> {
    let mut buf = [0u8; 264];
    let mut last_packet_size = size & 255;
    let packet_count = (size >> 8) + usize::from(last_packet_size != 0);
    if last_packet_size == 0 {
        last_packet_size = 256;
    }

    let subtype = link.seven_mut().last_command;
    set_ascii_hex(&mut buf[0..], (packet_count >> 8) as u8);
    set_ascii_hex(&mut buf[2..], packet_count as u8);

    let mut shifted = false;
    let mut loop_send_flags = SendFlags::empty();

    if packet_count >= 3 && !link.stream.is_serial() && !flags.contains(DataFlags::DISABLE_SHIFTING)
    {
        buf[4..8].copy_from_slice(b"0001");
        if let Err(e) = reader.read_exact(&mut buf[8..264]) {
            error!("could not read file data: {}", e);
            return Err(Error::Unknown);
        }

        send_extended(
            link,
            SendFlags::DISABLE_RECEIVE,
            PACKET_TYPE_DATA,
            subtype,
            &buf[..264],
        )?;

        shifted = true;
        loop_send_flags |= SendFlags::DISABLE_CHECKSUM;
        report(&mut progress, 1, packet_count as u64);
    }

    let latch_if_shifted = |link: &mut Link, shifted: bool| {
        if shifted {
            error!("fault while packet shifting was engaged; the link is now irrecoverable");
            link.flags.insert(LinkFlags::IRRECOVERABLE);
        }
    };

    for i in (1 + shifted as usize)..packet_count {
        set_ascii_hex(&mut buf[4..], (i >> 8) as u8);
        set_ascii_hex(&mut buf[6..], i as u8);
        if let Err(e) = reader.read_exact(&mut buf[8..264]) {
            error!("could not read file data: {}", e);
            latch_if_shifted(link, shifted);
            return Err(Error::Unknown);
        }

        debug!("sending data packet {}/{}", i, packet_count);
        if let Err(e) = send_extended(link, loop_send_flags, PACKET_TYPE_DATA, subtype, &buf[..264])
        {
            latch_if_shifted(link, shifted);
            return Err(e);
        }
        expect_basic_ack(link)?;
        report(&mut progress, i as u64, packet_count as u64);
    }

    // Resynchronise: collect the acknowledgement still in flight before the
    // last packet goes out.
    if shifted {
        receive(link)?;
        expect_basic_ack(link)?;
    }

    set_ascii_hex(&mut buf[4..], (packet_count >> 8) as u8);
    set_ascii_hex(&mut buf[6..], packet_count as u8);
    if let Err(e) = reader.read_exact(&mut buf[8..8 + last_packet_size]) {
        error!("could not read file data: {}", e);
        return Err(Error::Unknown);
    }

    debug!("sending data packet {0}/{0} (last)", packet_count);
    send_extended(
        link,
        SendFlags::empty(),
        PACKET_TYPE_DATA,
        subtype,
        &buf[..8 + last_packet_size],
    )?;

    match link.seven_mut().last_packet {
        Some((PACKET_TYPE_ACK, PACKET_SUBTYPE_ACK_BASIC)) => {}
        Some((PACKET_TYPE_ACK, PACKET_SUBTYPE_ACK_TERM)) => {
            debug!("calculator terminated the link following the data transfer");
            link.flags.insert(LinkFlags::TERMINATED);
        }
        Some((PACKET_TYPE_ACK, subtype)) => {
            error!(subtype, "unhandled ACK subtype at the end of data transfer");
            return Err(Error::Unknown);
        }
        _ => {
            error!("calculator did not answer with an ACK");
            return Err(Error::Unknown);
        }
    }

    report(&mut progress, packet_count as u64, packet_count as u64);
    Ok(())
}

/// Validate the metadata of a received DATA packet and return
/// `(total, index, payload_size)`.
fn data_packet_meta(link: &mut Link, code: u8) -> Result<(usize, usize, usize)> {
    expect_packet(link, PACKET_TYPE_DATA, code)?;
    if link.scratch_size < 9 {
        error!("data packet does not contain metadata and at least one byte");
        return Err(Error::Unknown);
    }
    if link.scratch[..8].iter().any(|&b| !is_ascii_hex(b)) {
        error!("data packet has invalid format");
        return Err(Error::Unknown);
    }
    let total = hex_u16(&link.scratch[0..4]) as usize;
    let index = hex_u16(&link.scratch[4..8]) as usize;
    Ok((total, index, link.scratch_size - 8))
}

/// Accept and receive a data stream into a writer.
///
/// The flow acknowledges the pending command first, then every data packet
/// except the last one, so the caller can close the flow with whatever
/// acknowledgement the surrounding sequence needs.
pub(crate) fn receive_data(
    link: &mut Link,
    writer: &mut dyn Write,
    mut size: usize,
    code: u8,
    mut progress: Progress<'_>,
) -> Result<()> {
    let mut packet_count = 0usize;
    let mut i = 1usize;

    while size > 0 {
        debug!("requesting packet {}/{}", i, packet_count);
        send_basic(
            link,
            SendFlags::empty(),
            PACKET_TYPE_ACK,
            PACKET_SUBTYPE_ACK_BASIC,
        )?;

        let (total, index, current) = data_packet_meta(link, code)?;
        if index != i {
            error!("unexpected sequence number (expected {}, got {})", i, index);
            return Err(Error::Unknown);
        }
        if i == 1 {
            packet_count = total;
        } else if total != packet_count {
            error!(
                "packet count was not consistent between packets (initial: 1/{}, current: {}/{})",
                packet_count, i, total
            );
            return Err(Error::Unknown);
        }

        if i < packet_count {
            if current >= size {
                error!(
                    "packet carries too much data for the flow (expected: {}, got: {})",
                    size, current
                );
                return Err(Error::Unknown);
            }
        } else if current != size {
            error!(
                "last packet did not close the flow exactly (expected: {}, got: {})",
                size, current
            );
            return Err(Error::Unknown);
        }

        if let Err(e) = writer.write_all(&link.scratch[8..8 + current]) {
            error!("could not write file data: {}", e);
            return Err(Error::Unknown);
        }
        size -= current;

        report(&mut progress, i as u64, packet_count as u64);
        i += 1;
    }

    Ok(())
}

/// Accept and receive a data stream into a buffer, with shifted reception
/// on non-serial mediums: acknowledge one packet ahead, then resynchronise
/// before the last one.
pub(crate) fn receive_data_into_buf(
    link: &mut Link,
    flags: DataFlags,
    buf: &mut [u8],
    code: u8,
    mut progress: Progress<'_>,
) -> Result<()> {
    let size = buf.len();
    if size == 0 {
        return Ok(());
    }

    let mut offset = 0usize;

    // The first packet tells us how many are coming.
    debug!("requesting first packet");
    send_basic(
        link,
        SendFlags::empty(),
        PACKET_TYPE_ACK,
        PACKET_SUBTYPE_ACK_BASIC,
    )?;
    let (packet_count, index, current) = data_packet_meta(link, code)?;
    if index != 1 {
        error!(index, "unexpected sequence number for first packet");
        return Err(Error::Unknown);
    }
    if packet_count == 0 {
        error!("unexpected packet count 0 in first packet");
        return Err(Error::Unknown);
    }

    let expected = |i: usize, packet_count: usize, current: usize, left: usize| -> Result<()> {
        if i < packet_count {
            if current >= left {
                error!(
                    "packet carries too much data for the flow (expected: {}, got: {})",
                    left, current
                );
                return Err(Error::Unknown);
            }
        } else if current != left {
            error!(
                "last packet did not close the flow exactly (expected: {}, got: {})",
                left, current
            );
            return Err(Error::Unknown);
        }
        Ok(())
    };

    expected(1, packet_count, current, size - offset)?;
    buf[..current].copy_from_slice(&link.scratch[8..8 + current]);
    offset += current;
    report(&mut progress, 1, packet_count as u64);

    let mut loop_send_flags = SendFlags::empty();
    let mut shifted = false;
    if packet_count >= 3 && !link.stream.is_serial() && !flags.contains(DataFlags::DISABLE_SHIFTING)
    {
        // Acknowledge one packet ahead from here on.
        send_basic(
            link,
            SendFlags::DISABLE_RECEIVE,
            PACKET_TYPE_ACK,
            PACKET_SUBTYPE_ACK_BASIC,
        )?;
        shifted = true;
        loop_send_flags |= SendFlags::DISABLE_CHECKSUM;
    }

    for i in 2..packet_count - shifted as usize {
        debug!("requesting packet {}/{}", i, packet_count);
        send_basic(
            link,
            loop_send_flags,
            PACKET_TYPE_ACK,
            PACKET_SUBTYPE_ACK_BASIC,
        )?;

        let (total, index, current) = data_packet_meta(link, code)?;
        if index != i {
            error!("unexpected sequence number (expected {}, got {})", i, index);
            return Err(Error::Unknown);
        }
        if total != packet_count {
            error!(
                "packet count was not consistent between packets (initial: 1/{}, current: {}/{})",
                packet_count, i, total
            );
            return Err(Error::Unknown);
        }
        expected(i, packet_count, current, size - offset)?;

        buf[offset..offset + current].copy_from_slice(&link.scratch[8..8 + current]);
        offset += current;
        report(&mut progress, i as u64, packet_count as u64);
    }

    // Resynchronise: the packet answering our shifted acknowledgement is
    // still in flight.
    if shifted {
        let i = packet_count - 1;
        debug!("requesting packet {}/{}", i, packet_count);
        receive(link)?;

        let (total, index, current) = data_packet_meta(link, code)?;
        if index != i {
            error!("unexpected sequence number (expected {}, got {})", i, index);
            return Err(Error::Unknown);
        }
        if total != packet_count {
            error!(
                "packet count was not consistent between packets (initial: 1/{}, current: {}/{})",
                packet_count, i, total
            );
            return Err(Error::Unknown);
        }
        expected(i, packet_count, current, size - offset)?;

        buf[offset..offset + current].copy_from_slice(&link.scratch[8..8 + current]);
        offset += current;
        report(&mut progress, i as u64, packet_count as u64);
    }

    if packet_count > 1 {
        debug!("requesting packet {0}/{0}", packet_count);
        send_basic(
            link,
            loop_send_flags,
            PACKET_TYPE_ACK,
            PACKET_SUBTYPE_ACK_BASIC,
        )?;

        let (total, index, current) = data_packet_meta(link, code)?;
        if index != packet_count {
            error!(
                "unexpected sequence number (expected {}, got {})",
                packet_count, index
            );
            return Err(Error::Unknown);
        }
        if total != packet_count {
            error!(
                "packet count was not consistent between packets (initial: 1/{}, current: {}/{})",
                packet_count, packet_count, total
            );
            return Err(Error::Unknown);
        }
        expected(packet_count, packet_count, current, size - offset)?;

        buf[offset..offset + current].copy_from_slice(&link.scratch[8..8 + current]);
        report(&mut progress, packet_count as u64, packet_count as u64);
    }

    Ok(())
}

/* ---
 * Use cases.
 * --- */

/// Ask for the available capacity on a storage device.
pub(crate) fn request_storage_capacity(link: &mut Link, storage: &str) -> Result<u32> {
    send_command(link, 0x4B, 0, 0, 0, [None, None, None, None, Some(storage), None])?;
    expect_basic_ack(link)?;

    send_basic(link, SendFlags::empty(), PACKET_TYPE_ROLESWAP, 0)?;
    expect_packet(link, PACKET_TYPE_COMMAND, 0x4C)?;
    let capacity = decode_command(link)?.filesize;

    send_basic(
        link,
        SendFlags::empty(),
        PACKET_TYPE_ACK,
        PACKET_SUBTYPE_ACK_BASIC,
    )?;
    expect_packet(link, PACKET_TYPE_ROLESWAP, 0)?;

    Ok(capacity)
}

/// Ask the calculator to defragment a storage device.
pub(crate) fn optimize_storage(link: &mut Link, storage: &str) -> Result<()> {
    send_command(link, 0x51, 0, 0, 0, [None, None, None, None, Some(storage), None])?;
    expect_basic_ack(link)
}

/// Send a file to a storage device.
pub(crate) fn send_file_to_storage(
    link: &mut Link,
    flags: SendFileFlags,
    directory: Option<&str>,
    name: &str,
    storage: &str,
    file: &mut dyn Read,
    file_size: u32,
    mut overwrite: Option<&mut dyn FnMut() -> bool>,
    progress: Progress<'_>,
) -> Result<()> {
    if flags.contains(SendFileFlags::OPTIMIZE) {
        debug!("requesting storage capacity");
        let capacity = request_storage_capacity(link, storage)?;
        debug!(capacity, "storage capacity obtained");
        if capacity < file_size {
            debug!("storage capacity is insufficient, requesting optimization");
            optimize_storage(link, storage)?;
        }
    }

    let overwrite_mode = if flags.contains(SendFileFlags::FORCE) {
        2
    } else {
        0
    };
    send_command(
        link,
        0x45,
        overwrite_mode,
        0,
        file_size,
        [directory, Some(name), None, None, Some(storage), None],
    )?;

    let mut rejected = false;
    if link.seven_mut().last_packet == Some((PACKET_TYPE_NAK, PACKET_SUBTYPE_NAK_OVERWRITE)) {
        // The file already exists on the device; arbitrate.
        let confirmed = overwrite.as_mut().map_or(false, |f| f());
        if confirmed {
            send_basic(
                link,
                SendFlags::empty(),
                PACKET_TYPE_ACK,
                PACKET_SUBTYPE_ACK_CONFIRM_OVERWRITE,
            )?;
        } else {
            rejected = true;
            send_basic(
                link,
                SendFlags::empty(),
                PACKET_TYPE_NAK,
                PACKET_SUBTYPE_NAK_REJECT_OVERWRITE,
            )?;
        }
    }

    // Whichever way the overwrite arbitration went, the last received packet
    // must now be an acknowledgement.
    expect_basic_ack(link)?;

    if rejected {
        return Err(Error::NotOverwritten);
    }
    if file_size > 0 {
        send_data(link, DataFlags::empty(), file, file_size as usize, progress)?;
    }
    Ok(())
}

/// Request a file from a storage device.
pub(crate) fn request_file_from_storage(
    link: &mut Link,
    directory: Option<&str>,
    name: &str,
    storage: &str,
    file: &mut dyn Write,
    progress: Progress<'_>,
) -> Result<()> {
    send_command(
        link,
        0x44,
        0,
        0,
        0,
        [directory, Some(name), None, None, Some(storage), None],
    )?;
    expect_basic_ack(link)?;

    // Hand the initiative over; the passive side announces the file size
    // with its own 0x45 command.
    send_basic(link, SendFlags::empty(), PACKET_TYPE_ROLESWAP, 0)?;
    expect_packet(link, PACKET_TYPE_COMMAND, 0x45)?;
    let filesize = decode_command(link)?.filesize;

    receive_data(link, file, filesize as usize, 0x45, progress)?;

    // Acknowledge the last data packet; the peer swaps roles back.
    send_basic(
        link,
        SendFlags::empty(),
        PACKET_TYPE_ACK,
        PACKET_SUBTYPE_ACK_BASIC,
    )?;
    expect_packet(link, PACKET_TYPE_ROLESWAP, 0)
}

/// Ask for a file to be copied on a storage device.
pub(crate) fn copy_file_on_storage(
    link: &mut Link,
    source_directory: Option<&str>,
    source_name: &str,
    target_directory: Option<&str>,
    target_name: &str,
    storage: &str,
) -> Result<()> {
    send_command(
        link,
        0x48,
        0,
        0,
        0,
        [
            source_directory,
            Some(source_name),
            target_directory,
            Some(target_name),
            Some(storage),
            None,
        ],
    )?;
    expect_basic_ack(link)
}

/// Ask for a file to be deleted on a storage device.
pub(crate) fn delete_file_from_storage(
    link: &mut Link,
    directory: Option<&str>,
    name: &str,
    storage: &str,
) -> Result<()> {
    send_command(
        link,
        0x46,
        0,
        0,
        0,
        [directory, Some(name), None, None, Some(storage), None],
    )?;
    expect_basic_ack(link)
}

/// Ask for a storage device to be reset.
pub(crate) fn reset_storage(link: &mut Link, storage: &str) -> Result<()> {
    send_command(link, 0x4A, 0, 0, 0, [None, None, None, None, Some(storage), None])?;
    expect_basic_ack(link)
}

fn entry_name(raw: &[u8]) -> Option<Option<String>> {
    if raw.is_empty() {
        return Some(None);
    }
    if raw.len() >= 23 {
        // Cannot yield this entry.
        return None;
    }
    if raw
        .iter()
        .any(|&b| !b.is_ascii() || !(b.is_ascii_graphic() || b == b' ' || b == b'\t'))
    {
        return None;
    }
    Some(Some(String::from_utf8_lossy(raw).into_owned()))
}

/// List files and directories on a storage device.
///
/// Every peer command is acknowledged exactly once, including the ones we
/// skip; once the sink asks to stop, the remaining entries are drained
/// without being yielded and the flow ends with `Interrupted`.
pub(crate) fn list_storage_entries(
    link: &mut Link,
    storage: &str,
    sink: &mut dyn FnMut(&StorageEntry) -> bool,
) -> Result<()> {
    send_command(link, 0x4D, 0, 0, 0, [None, None, None, None, Some(storage), None])?;
    expect_basic_ack(link)?;

    send_basic(link, SendFlags::empty(), PACKET_TYPE_ROLESWAP, 0)?;

    let mut should_skip = false;
    loop {
        let subtype = match link.seven_mut().last_packet {
            Some((PACKET_TYPE_COMMAND, subtype)) => subtype,
            _ => break,
        };

        if subtype == 0x4E && !should_skip {
            let decoded = decode_command(link)?;
            let directory = entry_name(&decoded.params[0]);
            let name = entry_name(&decoded.params[1]);

            match (directory, name) {
                // Entries that cannot be rendered, and entries with neither
                // a directory nor a name, are skipped.
                (Some(directory), Some(name)) if directory.is_some() || name.is_some() => {
                    let entry = StorageEntry {
                        directory,
                        name,
                        size: decoded.filesize,
                    };
                    if sink(&entry) {
                        // Protocol 7.00 has no way to interrupt a listing
                        // and become passive again; drain the rest instead.
                        should_skip = true;
                    }
                }
                _ => {}
            }
        } else if subtype != 0x4E {
            error!(subtype, "unhandled command for file listing");
        }

        send_basic(
            link,
            SendFlags::empty(),
            PACKET_TYPE_ACK,
            PACKET_SUBTYPE_ACK_BASIC,
        )?;
    }

    expect_packet(link, PACKET_TYPE_ROLESWAP, 0)?;
    if should_skip {
        Err(Error::Interrupted)
    } else {
        Ok(())
    }
}

/// Back up the calculator's ROM.
pub(crate) fn backup_rom(link: &mut Link, progress: Progress<'_>) -> Result<Vec<u8>> {
    send_command(link, 0x4F, 0, 0, 0, [None; 6])?;
    expect_basic_ack(link)?;

    send_basic(link, SendFlags::empty(), PACKET_TYPE_ROLESWAP, 0)?;
    expect_packet(link, PACKET_TYPE_COMMAND, 0x50)?;
    let rom_size = decode_command(link)?.filesize as usize;

    let mut rom = Vec::new();
    if rom_size > 0 {
        if rom.try_reserve_exact(rom_size).is_err() {
            // The peer is mid-flow and cannot be walked back.
            link.flags.insert(LinkFlags::IRRECOVERABLE);
            return Err(Error::OutOfMemory);
        }
        rom.resize(rom_size, 0);

        receive_data_into_buf(
            link,
            DataFlags::DISABLE_SHIFTING,
            &mut rom,
            0x50,
            progress,
        )?;
    }

    // Acknowledge the last data packet; the peer swaps roles back.
    send_basic(
        link,
        SendFlags::empty(),
        PACKET_TYPE_ACK,
        PACKET_SUBTYPE_ACK_BASIC,
    )?;
    expect_packet(link, PACKET_TYPE_ROLESWAP, 0)?;

    Ok(rom)
}

/// Upload a program into RAM and run it.
pub(crate) fn upload_and_run(
    link: &mut Link,
    program: &[u8],
    load_address: u32,
    start_address: u32,
    progress: Progress<'_>,
) -> Result<()> {
    if program.len() > u32::MAX as usize {
        return Err(Error::Unimplemented);
    }
    let size = program.len() as u32;

    let mut payload = [0u8; 24];
    for (i, value) in [size, load_address, start_address].iter().enumerate() {
        set_ascii_hex(&mut payload[8 * i..], (value >> 24) as u8);
        set_ascii_hex(&mut payload[8 * i + 2..], (value >> 16) as u8);
        set_ascii_hex(&mut payload[8 * i + 4..], (value >> 8) as u8);
        set_ascii_hex(&mut payload[8 * i + 6..], *value as u8);
    }

    send_extended(link, SendFlags::empty(), PACKET_TYPE_COMMAND, 0x56, &payload)?;
    expect_basic_ack(link)?;

    link.seven_mut().last_command = 0x56;
    send_data(
        link,
        DataFlags::empty(),
        &mut &program[..],
        program.len(),
        progress,
    )
}
