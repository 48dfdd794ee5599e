//! Transport mediums: a closed set of backends behind one dispatch type.
//!
//! A medium performs raw timed reads, complete writes and, for Mass-Storage
//! devices, SCSI command wrapping. The exact-fill/timeout-budget logic lives
//! one layer up, in [`crate::stream`].

mod serial;
mod ums;
mod usb;

pub(crate) use self::serial::SerialPort;
pub(crate) use self::ums::ScsiData;
pub(crate) use self::usb::{UsbBulk, UsbClass};

use crate::error::{Error, Result};
use crate::params::SerialParams;
use crate::time;
use tracing::{error, trace};

/// Size of the aligned read buffer the stream layer reads into. Large enough
/// that a UMS read never has to clamp the device's available-byte count.
pub(crate) const READ_BUFFER_SIZE: usize = 65536;

/// Largest payload a single UMS C2 write request may carry.
const UMS_MAX_WRITE: usize = 0xFFFF;

/// Outcome of one raw read pass.
pub(crate) enum RawRead {
    /// `n` bytes were placed at the start of the destination. `n` may be 0
    /// when the backend yielded without waiting for the full timeout.
    Data(usize),
    /// The backend waited for its whole timeout and saw nothing.
    TimedOut,
}

pub(crate) enum MediumHandle {
    Serial(SerialPort),
    Usb(UsbBulk),
    Ums(UsbBulk),
    #[cfg(test)]
    Mock(mock::MockMedium),
}

pub(crate) struct Medium {
    handle: MediumHandle,
    gone: bool,
    /// Serial parameters currently programmed on the line, if any.
    serial: Option<SerialParams>,
}

impl Medium {
    pub(crate) fn new(handle: MediumHandle) -> Medium {
        Medium {
            handle,
            gone: false,
            serial: None,
        }
    }

    pub(crate) fn is_serial(&self) -> bool {
        matches!(self.handle, MediumHandle::Serial(_))
    }

    pub(crate) fn is_ums(&self) -> bool {
        match &self.handle {
            MediumHandle::Ums(_) => true,
            #[cfg(test)]
            MediumHandle::Mock(mock) => mock.ums,
            _ => false,
        }
    }

    pub(crate) fn is_gone(&self) -> bool {
        self.gone
    }

    /// One raw read pass with up to `timeout_ms` of waiting (0 = unlimited).
    pub(crate) fn raw_read(&mut self, dest: &mut [u8], timeout_ms: u64) -> Result<RawRead> {
        let result = if self.is_ums() {
            self.ums_read(dest)
        } else {
            match &mut self.handle {
                MediumHandle::Serial(port) => port.read(dest, timeout_ms),
                MediumHandle::Usb(usb) => usb.read(dest, timeout_ms),
                MediumHandle::Ums(_) => unreachable!(),
                #[cfg(test)]
                MediumHandle::Mock(mock) => mock.read(dest),
            }
        };
        self.latch_gone(result)
    }

    /// Emulate a byte-pipe read over the UMS vendor commands: C0 polls the
    /// available-byte count, C1 fetches that many bytes.
    fn ums_read(&mut self, dest: &mut [u8]) -> Result<RawRead> {
        let mut status = [0u8; 16];
        let mut command = [0u8; 16];

        command[0] = 0xC0;
        self.scsi_request(&command, ScsiData::In(&mut status))?;

        let avail = u16::from_be_bytes([status[6], status[7]]) as usize;
        if avail == 0 {
            // The calculator may take a moment to recharge its buffer.
            time::sleep_ms(10);
            return Ok(RawRead::Data(0));
        }
        let avail = avail.min(dest.len());

        command[0] = 0xC1;
        command[6] = (avail >> 8) as u8;
        command[7] = avail as u8;
        self.scsi_request(&command, ScsiData::In(&mut dest[..avail]))?;
        Ok(RawRead::Data(avail))
    }

    pub(crate) fn write(&mut self, buf: &[u8]) -> Result<()> {
        let result = if self.is_ums() {
            self.ums_write(buf)
        } else {
            match &mut self.handle {
                MediumHandle::Serial(port) => port.write_all(buf),
                MediumHandle::Usb(usb) => usb.write_all(buf),
                MediumHandle::Ums(_) => unreachable!(),
                #[cfg(test)]
                MediumHandle::Mock(mock) => mock.write_all(buf),
            }
        };
        self.latch_gone(result)
    }

    /// Emulate a byte-pipe write over the UMS vendor commands: C0 polls,
    /// then C2 carries up to 65,535 bytes per request.
    fn ums_write(&mut self, buf: &[u8]) -> Result<()> {
        for chunk in buf.chunks(UMS_MAX_WRITE) {
            let mut status = [0u8; 16];
            let mut command = [0u8; 16];

            command[0] = 0xC0;
            self.scsi_request(&command, ScsiData::In(&mut status))?;

            command[0] = 0xC2;
            command[6] = (chunk.len() >> 8) as u8;
            command[7] = chunk.len() as u8;
            self.scsi_request(&command, ScsiData::Out(chunk))?;
        }
        Ok(())
    }

    /// Issue an SCSI request on a Mass-Storage medium and return the status
    /// byte from the CSW.
    pub(crate) fn scsi_request(&mut self, command: &[u8], data: ScsiData<'_>) -> Result<u8> {
        let result = match &mut self.handle {
            MediumHandle::Ums(usb) => ums::scsi_request(usb, command, data),
            #[cfg(test)]
            MediumHandle::Mock(mock) if mock.ums => mock.scsi_request(command, data),
            _ => {
                error!("SCSI requests are only available on UMS mediums");
                Err(Error::Unimplemented)
            }
        };
        self.latch_gone(result)
    }

    /// Program the serial line. Programming parameters identical to the ones
    /// already in effect is a no-op.
    pub(crate) fn set_serial_params(&mut self, params: &SerialParams) -> Result<()> {
        if self.serial.as_ref() == Some(params) {
            return Ok(());
        }
        match &mut self.handle {
            MediumHandle::Serial(port) => {
                trace!(?params, "programming serial parameters");
                port.set_params(params)?;
            }
            #[cfg(test)]
            MediumHandle::Mock(mock) => mock.serial_calls += 1,
            _ => {
                error!("tried to set serial parameters on a non-serial medium");
                return Err(Error::Unimplemented);
            }
        }
        self.serial = Some(*params);
        Ok(())
    }

    fn latch_gone<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(Error::Gone) = &result {
            self.gone = true;
        }
        result
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! A scripted duplex endpoint used by the protocol and stream tests.

    use super::*;
    use std::collections::VecDeque;

    pub(crate) struct ScsiExchange {
        pub command: Vec<u8>,
        pub response: Vec<u8>,
        pub status: u8,
    }

    #[derive(Default)]
    pub(crate) struct MockMedium {
        /// When set, reads and writes go through the C0/C1/C2 byte pipe.
        pub ums: bool,
        pub reads: VecDeque<Vec<u8>>,
        pub written: Vec<u8>,
        pub scsi: VecDeque<ScsiExchange>,
        pub serial_calls: usize,
    }

    impl MockMedium {
        pub(crate) fn new() -> MockMedium {
            MockMedium::default()
        }

        /// Queue one burst of device-to-host bytes. Each burst is handed to
        /// the stream layer as a single raw-read result, so tests can shape
        /// partial reads and surpluses precisely.
        pub(crate) fn queue_read(&mut self, bytes: &[u8]) {
            self.reads.push_back(bytes.to_vec());
        }

        pub(crate) fn queue_scsi(&mut self, command: &[u8], response: &[u8], status: u8) {
            self.scsi.push_back(ScsiExchange {
                command: command.to_vec(),
                response: response.to_vec(),
                status,
            });
        }

        pub(crate) fn read(&mut self, dest: &mut [u8]) -> Result<RawRead> {
            let mut burst = match self.reads.pop_front() {
                Some(burst) => burst,
                // Script exhausted: report a full driver-level wait so that
                // tests never sleep through a real timeout budget.
                None => return Ok(RawRead::TimedOut),
            };
            if burst.len() > dest.len() {
                let rest = burst.split_off(dest.len());
                self.reads.push_front(rest);
            }
            dest[..burst.len()].copy_from_slice(&burst);
            Ok(RawRead::Data(burst.len()))
        }

        pub(crate) fn write_all(&mut self, buf: &[u8]) -> Result<()> {
            self.written.extend_from_slice(buf);
            Ok(())
        }

        pub(crate) fn scsi_request(&mut self, command: &[u8], data: ScsiData<'_>) -> Result<u8> {
            let exchange = match self.scsi.pop_front() {
                Some(exchange) => exchange,
                None => panic!("unscripted SCSI request: {:02x?}", command),
            };
            assert_eq!(exchange.command, command, "unexpected SCSI command");
            match data {
                ScsiData::None => assert!(exchange.response.is_empty()),
                ScsiData::In(buf) => buf.copy_from_slice(&exchange.response),
                ScsiData::Out(buf) => self.written.extend_from_slice(buf),
            }
            Ok(exchange.status)
        }
    }

    impl Medium {
        pub(crate) fn mock(mock: MockMedium) -> Medium {
            Medium::new(MediumHandle::Mock(mock))
        }

        pub(crate) fn mock_state(&mut self) -> &mut MockMedium {
            match &mut self.handle {
                MediumHandle::Mock(mock) => mock,
                _ => panic!("not a mock medium"),
            }
        }
    }
}
