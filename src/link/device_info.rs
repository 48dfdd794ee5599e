//! Decoding of the raw discovery response into device information.

use crate::error::{Error, Result};
use tracing::error;

/// Device information decoded from the discovery response.
///
/// Capacities and sizes are in bytes; the `has_*` flags tell whether the
/// corresponding section was present in the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub hwid: String,
    pub cpuid: String,

    pub has_preprog_rom: bool,
    pub preprog_rom_capacity: u64,
    pub preprog_rom_version: String,

    pub flash_rom_capacity: u64,
    pub ram_capacity: u64,

    pub has_bootcode: bool,
    pub bootcode_version: String,
    pub bootcode_offset: u32,
    pub bootcode_size: u64,

    pub has_os: bool,
    pub os_version: String,
    pub os_offset: u32,
    pub os_size: u64,

    pub product_id: String,
    pub username: String,
    pub organisation: String,
}

/// Copy an ASCII string field, stopping at a NUL or any byte outside the
/// ASCII range.
fn store_string(raw: &[u8]) -> String {
    raw.iter()
        .take_while(|&&b| b != 0 && b < 128)
        .map(|&b| b as char)
        .collect()
}

/// Decode an 8-digit decimal ASCII field, or 0 when it is not one.
fn long_dec(raw: &[u8]) -> u64 {
    if raw[..8].iter().any(|b| !b.is_ascii_digit()) {
        return 0;
    }
    raw[..8].iter().fold(0u64, |acc, &b| acc * 10 + (b - b'0') as u64)
}

/// Decode an 8-digit hexadecimal ASCII field, or 0 when it is not one.
fn long_hex(raw: &[u8]) -> u32 {
    if raw[..8]
        .iter()
        .any(|&b| !(b.is_ascii_digit() || (b'A'..=b'F').contains(&b)))
    {
        return 0;
    }
    raw[..8].iter().fold(0u32, |acc, &b| {
        let nib = if b >= b'A' { b - b'A' + 10 } else { b - b'0' };
        (acc << 4) | nib as u32
    })
}

impl DeviceInfo {
    /// Decode the fixed-offset EACK payload cached at discovery time.
    pub(crate) fn from_raw(raw: &[u8]) -> Result<DeviceInfo> {
        if raw.len() < 164 {
            error!(size = raw.len(), "device information payload is too short");
            return Err(Error::Invalid);
        }

        let (username, organisation) = if raw.len() >= 188 {
            (store_string(&raw[148..168]), store_string(&raw[168..188]))
        } else {
            (store_string(&raw[148..164]), String::new())
        };

        Ok(DeviceInfo {
            hwid: store_string(&raw[0..8]),
            cpuid: store_string(&raw[8..24]),

            has_preprog_rom: raw[50] == b'.',
            preprog_rom_capacity: long_dec(&raw[24..]) * 1024,
            preprog_rom_version: store_string(&raw[48..64]),

            flash_rom_capacity: long_dec(&raw[32..]) * 1024,
            ram_capacity: long_dec(&raw[40..]) * 1024,

            has_bootcode: raw[66] == b'.',
            bootcode_version: store_string(&raw[64..80]),
            bootcode_offset: long_hex(&raw[80..]),
            bootcode_size: long_dec(&raw[88..]) * 1024,

            has_os: raw[98] == b'.',
            os_version: store_string(&raw[96..112]),
            os_offset: long_hex(&raw[112..]),
            os_size: long_dec(&raw[120..]) * 1024,

            product_id: store_string(&raw[132..148]),
            username,
            organisation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_blob() -> Vec<u8> {
        let mut raw = vec![0u8; 164];
        raw[0..8].copy_from_slice(b"Gy363\x00\x00\x00");
        raw[8..18].copy_from_slice(b"CPU7305XX\x00");
        raw[24..32].copy_from_slice(b"00000000");
        raw[32..40].copy_from_slice(b"00004096");
        raw[40..48].copy_from_slice(b"00000512");
        raw[48..53].copy_from_slice(b"02.09");
        raw[50] = b'.';
        raw[64..69].copy_from_slice(b"01.00");
        raw[66] = b'.';
        raw[80..88].copy_from_slice(b"00010000");
        raw[88..96].copy_from_slice(b"00000064");
        raw[96..101].copy_from_slice(b"02.09");
        raw[98] = b'.';
        raw[112..120].copy_from_slice(b"00100000");
        raw[120..128].copy_from_slice(b"00001024");
        raw[132..140].copy_from_slice(b"GY363000");
        raw[148..153].copy_from_slice(b"CASIO");
        raw
    }

    #[test]
    fn decodes_a_164_byte_payload() {
        let info = DeviceInfo::from_raw(&sample_blob()).unwrap();
        assert_eq!(info.hwid, "Gy363");
        assert_eq!(info.cpuid, "CPU7305XX");
        assert_eq!(info.flash_rom_capacity, 4096 * 1024);
        assert_eq!(info.ram_capacity, 512 * 1024);
        assert!(info.has_os);
        assert_eq!(info.os_version, "02.09");
        assert_eq!(info.os_offset, 0x0010_0000);
        assert_eq!(info.os_size, 1024 * 1024);
        assert_eq!(info.bootcode_offset, 0x0001_0000);
        assert_eq!(info.username, "CASIO");
        assert_eq!(info.organisation, "");
    }

    #[test]
    fn organisation_needs_the_long_payload() {
        let mut raw = sample_blob();
        raw.resize(188, 0);
        raw[148..152].copy_from_slice(b"USER");
        raw[168..171].copy_from_slice(b"ORG");
        let info = DeviceInfo::from_raw(&raw).unwrap();
        assert_eq!(info.username, "USER");
        assert_eq!(info.organisation, "ORG");
    }

    #[test]
    fn short_payloads_are_rejected() {
        assert_eq!(DeviceInfo::from_raw(&[0; 100]), Err(Error::Invalid));
    }
}
