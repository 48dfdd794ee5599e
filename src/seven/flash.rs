//! Flash-image driver using the fxRemote update protocol.
//!
//! Sectors are staged into RAM at `0x88030000` with 0x70 commands in
//! 0x3FC-byte chunks, then committed to their flash address with a 0x71
//! command. The initial system sector is written last, so an interrupted
//! flash leaves the device bootable on the old initial sector.

use super::*;
use crate::link::FlashFlags;

/// RAM staging area used by the fxRemote bootcode.
const STAGING_ADDRESS: u32 = 0x8803_0000;
/// Chunk size accepted by a single 0x70 command.
const STAGING_CHUNK: usize = 0x3FC;
/// Flash sector size.
const SECTOR_SIZE: usize = 0x10000;
/// Address of the initial system sector, written last.
const INITIAL_SECTOR_ADDRESS: u32 = 0xA001_0000;
/// First regular system sector.
const SYSTEM_BASE_ADDRESS: u32 = 0xA002_0000;
/// End of the erased range without `RESET_SMEM`.
const ERASE_END_ADDRESS: u32 = 0xA028_0000;
/// End of the erased range with `RESET_SMEM`.
const ERASE_END_ADDRESS_SMEM: u32 = 0xA040_0000;

/// Write one sector: stage the data into RAM, then commit it to `addr`.
fn flash_sector(link: &mut Link, addr: u32, data: &[u8]) -> Result<()> {
    let mut buf = [0u8; 8 + STAGING_CHUNK];
    let mut upload_offset = STAGING_ADDRESS;

    for chunk in data.chunks(STAGING_CHUNK) {
        buf[..4].copy_from_slice(&upload_offset.to_be_bytes());
        buf[4..8].copy_from_slice(&(chunk.len() as u32).to_be_bytes());
        buf[8..8 + chunk.len()].copy_from_slice(chunk);

        send_extended(
            link,
            SendFlags::empty(),
            PACKET_TYPE_COMMAND,
            0x70,
            &buf[..8 + chunk.len()],
        )?;
        expect_basic_ack(link)?;

        upload_offset += chunk.len() as u32;
    }

    // Commit the staged bytes to their flash sector.
    let mut commit = [0u8; 12];
    commit[..4].copy_from_slice(&addr.to_be_bytes());
    commit[4..8].copy_from_slice(&(data.len() as u32).to_be_bytes());
    commit[8..12].copy_from_slice(&STAGING_ADDRESS.to_be_bytes());

    send_extended(link, SendFlags::empty(), PACKET_TYPE_COMMAND, 0x71, &commit)?;
    expect_basic_ack(link)
}

/// Flash a system image.
pub(crate) fn flash_system(link: &mut Link, flags: FlashFlags, mut system: &[u8]) -> Result<()> {
    // The 0x76 probe is not exploited, but real updaters issue it, and the
    // bootcode answers with an ACK followed by a data packet to drain.
    send_basic(link, SendFlags::empty(), PACKET_TYPE_COMMAND, 0x76)?;
    expect_basic_ack(link)?;
    receive(link)?;

    let erase_end = if flags.contains(FlashFlags::RESET_SMEM) {
        ERASE_END_ADDRESS_SMEM
    } else {
        ERASE_END_ADDRESS
    };

    let mut addr = INITIAL_SECTOR_ADDRESS;
    while addr < erase_end {
        send_extended(
            link,
            SendFlags::empty(),
            PACKET_TYPE_COMMAND,
            0x72,
            &addr.to_be_bytes(),
        )?;
        expect_basic_ack(link)?;
        addr += SECTOR_SIZE as u32;
    }

    // The first 64 KiB of the image hold the bootloader, which is never
    // rewritten.
    let bootloader_size = system.len().min(SECTOR_SIZE);
    system = &system[bootloader_size..];

    let initial_sector_size = system.len().min(SECTOR_SIZE);
    let initial_sector = &system[..initial_sector_size];
    system = &system[initial_sector_size..];

    let mut addr = SYSTEM_BASE_ADDRESS;
    for sector in system.chunks(SECTOR_SIZE) {
        flash_sector(link, addr, sector)?;
        addr += SECTOR_SIZE as u32;
    }

    if !initial_sector.is_empty() {
        flash_sector(link, INITIAL_SECTOR_ADDRESS, initial_sector)?;
    }

    send_basic(link, SendFlags::empty(), PACKET_TYPE_COMMAND, 0x78)?;
    expect_basic_ack(link)
}
