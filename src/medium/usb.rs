//! USB bulk backend over libusb.
//!
//! Calculators expose a single interface whose class byte tells us what we
//! are talking to: 8 is a Mass Storage device (fx-CG family), 255 is the
//! vendor-specific bulk pipe (fx-9860G family).

use crate::error::{Error, Result};
use crate::medium::RawRead;
use rusb::{Context, DeviceHandle, Direction, TransferType, UsbContext};
use std::time::Duration;
use tracing::{debug, error, warn};

const CASIO_VENDOR_ID: u16 = 0x07cf;
const CASIO_PRODUCT_IDS: [u16; 2] = [0x6101, 0x6102];

/// What the interface class byte told us at open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UsbClass {
    /// Vendor-specific bulk pipe (class 255).
    Bulk,
    /// USB Mass Storage (class 8), driven through SCSI wrapping.
    Ums,
}

pub(crate) struct UsbBulk {
    handle: DeviceHandle<Context>,
    bulk_in: u8,
    bulk_out: u8,
}

impl UsbBulk {
    /// Open the calculator at `(bus, address)` and claim its interface.
    pub(crate) fn open(bus: u8, address: u8) -> Result<(UsbBulk, UsbClass)> {
        let context = Context::new().map_err(|e| {
            error!("could not create a libusb context: {}", e);
            Error::Unknown
        })?;
        let devices = context.devices().map_err(|e| {
            error!("could not list USB devices: {}", e);
            Error::Unknown
        })?;

        for device in devices.iter() {
            if device.bus_number() != bus || device.address() != address {
                continue;
            }

            let descriptor = device.device_descriptor().map_err(|_| Error::Incompatible)?;
            if descriptor.vendor_id() != CASIO_VENDOR_ID
                || !CASIO_PRODUCT_IDS.contains(&descriptor.product_id())
            {
                return Err(Error::Incompatible);
            }

            let config = device
                .active_config_descriptor()
                .map_err(|_| Error::Incompatible)?;
            if config.num_interfaces() != 1 {
                return Err(Error::Incompatible);
            }
            let interface = config.interfaces().next().ok_or(Error::Incompatible)?;
            let mut settings = interface.descriptors();
            let setting = settings.next().ok_or(Error::Incompatible)?;
            if settings.next().is_some() {
                return Err(Error::Incompatible);
            }

            let class = match setting.class_code() {
                8 => UsbClass::Ums,
                255 => UsbClass::Bulk,
                _ => return Err(Error::Incompatible),
            };

            // The endpoint addresses are not fixed across models, so look
            // them up instead of hardcoding them.
            let mut bulk_in = None;
            let mut bulk_out = None;
            for endpoint in setting.endpoint_descriptors() {
                if endpoint.transfer_type() != TransferType::Bulk {
                    continue;
                }
                match endpoint.direction() {
                    Direction::In => bulk_in = Some(endpoint.address()),
                    Direction::Out => bulk_out = Some(endpoint.address()),
                }
            }
            let bulk_in = bulk_in.ok_or_else(|| {
                error!("bulk in endpoint could not be found");
                Error::Incompatible
            })?;
            let bulk_out = bulk_out.ok_or_else(|| {
                error!("bulk out endpoint could not be found");
                Error::Incompatible
            })?;

            let mut handle = device.open().map_err(|e| match e {
                rusb::Error::Access => Error::PermissionDenied,
                rusb::Error::NoDevice => Error::NotFound,
                e => {
                    error!("could not open the USB device: {}", e);
                    Error::Unknown
                }
            })?;

            match handle.detach_kernel_driver(0) {
                Ok(()) | Err(rusb::Error::NotSupported) | Err(rusb::Error::NotFound) => {}
                Err(rusb::Error::Access) => {
                    // On macOS detaching requires a code-signing entitlement;
                    // try to use the device without detaching.
                    warn!("kernel driver could not be detached due to access");
                }
                Err(rusb::Error::NoDevice) => return Err(Error::NotFound),
                Err(e) => {
                    error!("could not detach the kernel driver: {}", e);
                    return Err(Error::Unknown);
                }
            }

            match handle.claim_interface(0) {
                Ok(()) => {}
                Err(rusb::Error::NoDevice) | Err(rusb::Error::NotFound) => {
                    return Err(Error::NotFound)
                }
                Err(rusb::Error::Access) => {
                    warn!("interface could not be claimed due to access");
                }
                Err(rusb::Error::Busy) => {
                    debug!("another program or driver has claimed the interface");
                    return Err(Error::PermissionDenied);
                }
                Err(e) => {
                    error!("could not claim the interface: {}", e);
                    return Err(Error::Unknown);
                }
            }

            debug!(bulk_in, bulk_out, ?class, "opened USB device");
            return Ok((
                UsbBulk {
                    handle,
                    bulk_in,
                    bulk_out,
                },
                class,
            ));
        }

        Err(Error::NotFound)
    }

    /// Enumerate every connected calculator as `(bus, address)` pairs.
    pub(crate) fn detect() -> Result<Vec<(u8, u8)>> {
        let context = Context::new().map_err(|e| {
            error!("could not create a libusb context: {}", e);
            Error::Unknown
        })?;
        let devices = context.devices().map_err(|e| {
            error!("could not list USB devices: {}", e);
            Error::Unknown
        })?;

        let mut found = Vec::new();
        for device in devices.iter() {
            let descriptor = match device.device_descriptor() {
                Ok(descriptor) => descriptor,
                Err(_) => continue,
            };
            if descriptor.vendor_id() == CASIO_VENDOR_ID
                && CASIO_PRODUCT_IDS.contains(&descriptor.product_id())
            {
                found.push((device.bus_number(), device.address()));
            }
        }
        Ok(found)
    }

    pub(crate) fn read(&mut self, dest: &mut [u8], timeout_ms: u64) -> Result<RawRead> {
        match self
            .handle
            .read_bulk(self.bulk_in, dest, Duration::from_millis(timeout_ms))
        {
            Ok(n) => Ok(RawRead::Data(n)),
            Err(rusb::Error::Timeout) => Ok(RawRead::TimedOut),
            Err(e) => Err(map_transfer_error(e)),
        }
    }

    pub(crate) fn write_all(&mut self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            let sent = self
                .handle
                .write_bulk(self.bulk_out, buf, Duration::ZERO)
                .map_err(map_transfer_error)?;
            buf = &buf[sent..];
        }
        Ok(())
    }

    /// Read exactly `dest.len()` bytes from the bulk IN endpoint, without a
    /// timeout. Used for SCSI data and status phases.
    pub(crate) fn read_exact(&mut self, mut dest: &mut [u8]) -> Result<()> {
        while !dest.is_empty() {
            let received = self
                .handle
                .read_bulk(self.bulk_in, dest, Duration::ZERO)
                .map_err(map_transfer_error)?;
            dest = &mut dest[received..];
        }
        Ok(())
    }
}

fn map_transfer_error(e: rusb::Error) -> Error {
    match e {
        rusb::Error::Pipe | rusb::Error::NoDevice | rusb::Error::Io => {
            error!("USB device is no longer available");
            Error::Gone
        }
        e => {
            error!("bulk transfer failed: {}", e);
            Error::Unknown
        }
    }
}
