use crate::error::{Error, Result};

bitflags::bitflags! {
    /// Behaviour flags for opening a link.
    pub struct OpenFlags: u32 {
        /// Act as the passive / receiving side.
        const RECEIVER = 0x01;
        /// Skip the initial handshake.
        const NOCHECK = 0x02;
        /// Skip platform discovery after the handshake.
        const NODISC = 0x04;
        /// Skip the terminating handshake on close.
        const NOTERM = 0x08;
        /// Use the screen-streaming protocol (USB only).
        const OHP = 0x10;
    }
}

/// Wire protocol to speak over a serial link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerialProtocol {
    /// The legacy byte-oriented family.
    Casiolink(CasVariant),
    /// Protocol 7.00.
    Seven,
    /// Protocol 7.00 screen-streaming.
    SevenOhp,
}

/// CASIOLINK header flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasVariant {
    /// Decide from the first received header. Receiver only.
    Auto,
    Cas40,
    Cas50,
    Cas100,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopBits {
    One,
    Two,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Even,
    Odd,
}

/// Drive mode for the DTR and RTS lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineMode {
    Disabled,
    Enabled,
    Handshake,
}

/// Serial line parameters.
///
/// A `speed` of 0 and a `stop_bits` of `None` mean "pick the default for the
/// selected protocol" at open time; once the link is open both are concrete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialParams {
    /// Baud rate; one of 300..=115200, or 0 for the protocol default.
    pub speed: u32,
    pub stop_bits: Option<StopBits>,
    pub parity: Parity,
    pub xon_xoff: bool,
    pub dtr: LineMode,
    pub rts: LineMode,
}

impl Default for SerialParams {
    fn default() -> SerialParams {
        SerialParams {
            speed: 0,
            stop_bits: None,
            parity: Parity::None,
            xon_xoff: false,
            dtr: LineMode::Disabled,
            rts: LineMode::Disabled,
        }
    }
}

impl SerialParams {
    /// Check the speed against the rates both the calculators and the host
    /// serial drivers know about.
    pub(crate) fn validate_speed(speed: u32) -> Result<()> {
        match speed {
            300 | 600 | 1200 | 2400 | 4800 | 9600 | 19200 | 38400 | 57600 | 115200 => Ok(()),
            _ => {
                tracing::error!(speed, "unsupported baud rate for a serial link");
                Err(Error::Unimplemented)
            }
        }
    }

    /// Resolve defaults for the given protocol, returning concrete params.
    pub(crate) fn resolved(&self, protocol: SerialProtocol) -> Result<SerialParams> {
        let mut params = *self;

        if params.stop_bits.is_none() {
            // The fx-9860G in compatibility mode uses 1 stop bit; CAS100 and
            // Protocol 7.00 devices expect 2.
            let two = match protocol {
                SerialProtocol::Seven | SerialProtocol::SevenOhp => true,
                SerialProtocol::Casiolink(CasVariant::Cas100) => true,
                SerialProtocol::Casiolink(_) => false,
            };
            params.stop_bits = Some(if two { StopBits::Two } else { StopBits::One });
        }

        if params.speed == 0 {
            params.speed = match protocol {
                SerialProtocol::Casiolink(CasVariant::Cas100) => 38400,
                SerialProtocol::Casiolink(CasVariant::Cas40) => 4800,
                _ => 9600,
            };
        }
        SerialParams::validate_speed(params.speed)?;

        Ok(params)
    }
}
