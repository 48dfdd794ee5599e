//! SCSI Bulk-Only Transport wrapping for Mass-Storage calculators.
//!
//! Every request is a 31-byte Command Block Wrapper, an optional data phase,
//! and a 13-byte Command Status Wrapper whose signature and tag must match
//! what we sent.

use crate::error::{Error, Result};
use crate::medium::usb::UsbBulk;
use tracing::error;

const CBW_SIGNATURE: &[u8; 4] = b"USBC";
const CSW_SIGNATURE: &[u8; 4] = b"USBS";
const TAG: &[u8; 4] = b"ABCD";

/// Direction and payload of the data phase.
pub(crate) enum ScsiData<'a> {
    None,
    Out(&'a [u8]),
    In(&'a mut [u8]),
}

/// Issue one SCSI command over the bulk pipes and return the status byte
/// from the CSW.
pub(crate) fn scsi_request(usb: &mut UsbBulk, command: &[u8], data: ScsiData<'_>) -> Result<u8> {
    debug_assert!(command.len() >= 1 && command.len() <= 16);

    let transfer_len = match &data {
        ScsiData::None => 0,
        ScsiData::Out(buf) => buf.len(),
        ScsiData::In(buf) => buf.len(),
    };

    let mut cbw = [0u8; 31];
    cbw[..4].copy_from_slice(CBW_SIGNATURE);
    cbw[4..8].copy_from_slice(TAG);
    cbw[8..12].copy_from_slice(&(transfer_len as u32).to_le_bytes());
    if let ScsiData::In(_) = data {
        cbw[12] |= 0x80;
    }
    cbw[14] = command.len() as u8;
    cbw[15..15 + command.len()].copy_from_slice(command);

    usb.write_all(&cbw)?;

    match data {
        ScsiData::None => {}
        ScsiData::Out(buf) => usb.write_all(buf)?,
        ScsiData::In(buf) => usb.read_exact(buf)?,
    }

    let mut csw = [0u8; 13];
    usb.read_exact(&mut csw)?;
    if &csw[..4] != CSW_SIGNATURE || &csw[4..8] != TAG {
        error!("unknown or unrecognized UMS CSW: {:02x?}", csw);
        return Err(Error::Corrupt);
    }
    Ok(csw[12])
}

#[cfg(test)]
mod tests {
    // The CBW/CSW layout itself is exercised end to end through the mock
    // medium in the stream tests; what we can check in isolation is the
    // constant layout of a wrapper.
    #[test]
    fn cbw_header_layout() {
        let mut cbw = [0u8; 31];
        cbw[..4].copy_from_slice(super::CBW_SIGNATURE);
        cbw[4..8].copy_from_slice(super::TAG);
        cbw[8..12].copy_from_slice(&0x1234u32.to_le_bytes());
        assert_eq!(&cbw[..12], b"USBCABCD\x34\x12\x00\x00");
    }
}
