//! The link orchestrator: one long-lived session over one medium.

mod device_info;

pub use self::device_info::DeviceInfo;

use crate::casiolink::{self, CasiolinkState};
use crate::error::{Error, Result};
use crate::medium::{Medium, MediumHandle, SerialPort, UsbBulk, UsbClass};
use crate::params::{CasVariant, OpenFlags, Parity, SerialParams, SerialProtocol, StopBits};
use crate::screen::Frame;
use crate::seven::{self, flash, flows, ohp};
use crate::stream::Stream;
use crate::time;
use std::io::{Read, Write};
use tracing::{debug, error};

/// Scratch buffer capacity: enough for the largest payload any protocol can
/// announce (a full VRAM picture).
const SCRATCH_BUFFER_SIZE: usize = 512 * 1024;

bitflags::bitflags! {
    pub(crate) struct LinkFlags: u32 {
        /// Run the protocol termination flow at close time.
        const CLOSE_PROTOCOL = 0x01;
        /// Termination should be attempted when closing.
        const TERMINATE = 0x02;
        /// The peer announced or acknowledged the end of the link.
        const TERMINATED = 0x04;
        /// This endpoint is the passive side.
        const RECEIVER = 0x08;
        /// A fault left the wire in an undefined state; only close is valid.
        const IRRECOVERABLE = 0x10;
    }
}

bitflags::bitflags! {
    /// Flags for [`Link::send_file_to_storage`].
    pub struct SendFileFlags: u32 {
        /// Overwrite an existing file without arbitration.
        const FORCE = 0x01;
        /// Optimize the storage first when its capacity looks insufficient.
        const OPTIMIZE = 0x02;
    }
}

bitflags::bitflags! {
    /// Flags for [`Link::flash_system`].
    pub struct FlashFlags: u32 {
        /// Also erase the storage memory.
        const RESET_SMEM = 0x01;
    }
}

/// One file or directory yielded by [`Link::list_storage_entries`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEntry {
    pub directory: Option<String>,
    pub name: Option<String>,
    pub size: u32,
}

/// Per-protocol codec state; exactly one variant is alive for the whole
/// life of the link.
pub(crate) enum ProtocolState {
    Casiolink(CasiolinkState),
    Seven(seven::SevenState),
    SevenOhp(ohp::OhpState),
}

/// A communication session with a calculator.
///
/// Dropping a link closes it; use [`Link::close`] to observe termination
/// errors.
pub struct Link {
    pub(crate) stream: Stream,
    pub(crate) flags: LinkFlags,
    pub(crate) serial: SerialParams,
    pub(crate) protocol: ProtocolState,
    /// Reused for every packet payload; allocated once at open.
    pub(crate) scratch: Box<[u8]>,
    pub(crate) scratch_size: usize,
    cached_device_info: Option<DeviceInfo>,
    closed: bool,
}

impl Link {
    fn build(stream: Stream, protocol: ProtocolState, flags: LinkFlags, serial: SerialParams) -> Link {
        Link {
            stream,
            flags,
            serial,
            protocol,
            scratch: vec![0; SCRATCH_BUFFER_SIZE].into_boxed_slice(),
            scratch_size: 0,
            cached_device_info: None,
            closed: false,
        }
    }

    /* ---
     * Codec state accessors. The protocol tag is immutable after open, so
     * a mismatch is a bug, not a runtime condition.
     * --- */

    pub(crate) fn seven_mut(&mut self) -> &mut seven::SevenState {
        match &mut self.protocol {
            ProtocolState::Seven(state) => state,
            _ => unreachable!("codec state out of sync with the active protocol"),
        }
    }

    pub(crate) fn casiolink_ref(&self) -> &CasiolinkState {
        match &self.protocol {
            ProtocolState::Casiolink(state) => state,
            _ => unreachable!("codec state out of sync with the active protocol"),
        }
    }

    pub(crate) fn casiolink_mut(&mut self) -> &mut CasiolinkState {
        match &mut self.protocol {
            ProtocolState::Casiolink(state) => state,
            _ => unreachable!("codec state out of sync with the active protocol"),
        }
    }

    pub(crate) fn ohp_ref(&self) -> &ohp::OhpState {
        match &self.protocol {
            ProtocolState::SevenOhp(state) => state,
            _ => unreachable!("codec state out of sync with the active protocol"),
        }
    }

    pub(crate) fn ohp_mut(&mut self) -> &mut ohp::OhpState {
        match &mut self.protocol {
            ProtocolState::SevenOhp(state) => state,
            _ => unreachable!("codec state out of sync with the active protocol"),
        }
    }

    /* ---
     * Opening.
     * --- */

    /// Open a link over a serial port.
    pub fn open_serial(
        path: &str,
        protocol: SerialProtocol,
        params: SerialParams,
        flags: OpenFlags,
    ) -> Result<Link> {
        if flags.contains(OpenFlags::OHP) {
            error!("the OHP flag is expressed through the protocol on serial links");
            return Err(Error::Unimplemented);
        }
        let receiver = flags.contains(OpenFlags::RECEIVER);
        match protocol {
            SerialProtocol::Seven if receiver => {
                error!("acting as the Protocol 7.00 passive side is not supported");
                return Err(Error::Unimplemented);
            }
            SerialProtocol::SevenOhp if !receiver => {
                error!("only the receiver role is supported for screen-streaming");
                return Err(Error::Unimplemented);
            }
            SerialProtocol::Casiolink(CasVariant::Auto) if !receiver => {
                error!("variant detection requires receiver mode");
                return Err(Error::Unimplemented);
            }
            _ => {}
        }

        let params = params.resolved(protocol)?;

        let state = match protocol {
            SerialProtocol::Casiolink(variant) => {
                ProtocolState::Casiolink(CasiolinkState::new(variant))
            }
            SerialProtocol::Seven => ProtocolState::Seven(seven::SevenState::new()),
            SerialProtocol::SevenOhp => ProtocolState::SevenOhp(ohp::OhpState::new()),
        };

        let port = SerialPort::open(path)?;
        let stream = Stream::new(Medium::new(MediumHandle::Serial(port)));

        let mut link = Link::build(stream, state, link_flags(flags), params);
        link.stream.set_serial_params(&params)?;
        link.init_protocol(flags)?;
        Ok(link)
    }

    /// Open a link over USB, to the device at `(bus, address)`.
    pub fn open_usb(bus: u8, address: u8, flags: OpenFlags) -> Result<Link> {
        if flags.contains(OpenFlags::OHP) && !flags.contains(OpenFlags::RECEIVER) {
            error!("acting as a sender for screen-streaming is not supported");
            return Err(Error::Unimplemented);
        }
        if !flags.contains(OpenFlags::OHP) && flags.contains(OpenFlags::RECEIVER) {
            error!("acting as a receiver for control is not supported");
            return Err(Error::Unimplemented);
        }

        let (usb, class) = UsbBulk::open(bus, address)?;
        let handle = match class {
            UsbClass::Bulk => MediumHandle::Usb(usb),
            UsbClass::Ums => MediumHandle::Ums(usb),
        };
        let stream = Stream::new(Medium::new(handle));

        let state = if flags.contains(OpenFlags::OHP) {
            ProtocolState::SevenOhp(ohp::OhpState::new())
        } else {
            ProtocolState::Seven(seven::SevenState::new())
        };

        let mut link = Link::build(stream, state, link_flags(flags), SerialParams::default());
        link.init_protocol(flags)?;
        Ok(link)
    }

    /// Open a link to the single connected calculator, polling enumeration
    /// for up to 5 attempts.
    pub fn open_usb_simple(flags: OpenFlags) -> Result<Link> {
        for attempt in 0..5 {
            if attempt > 0 {
                debug!("calculator not found, retrying in 1 second");
                time::sleep_ms(1000);
            }

            let mut found = UsbBulk::detect()?;
            match found.len() {
                0 => continue,
                1 => {
                    let (bus, address) = found.remove(0);
                    return Link::open_usb(bus, address, flags);
                }
                _ => {
                    error!("multiple devices were found: {:?}", found);
                    return Err(Error::TooMany);
                }
            }
        }
        Err(Error::NotFound)
    }

    fn init_protocol(&mut self, flags: OpenFlags) -> Result<()> {
        if matches!(self.protocol, ProtocolState::Casiolink(_)) {
            if !flags.contains(OpenFlags::NOCHECK) {
                casiolink::initiate(self)?;
            }
        } else if matches!(self.protocol, ProtocolState::Seven(_)) && !self.stream.is_ums() {
            // The UMS byte pipe carries no control flows.
            if !flags.contains(OpenFlags::NOCHECK) {
                flows::initiate(self)?;
            }
            if !flags.contains(OpenFlags::NODISC) {
                flows::discover(self)?;
            }
        }
        self.flags.insert(LinkFlags::CLOSE_PROTOCOL);
        Ok(())
    }

    /* ---
     * Closing.
     * --- */

    /// Run the protocol termination flow if it is still due. Safe to call
    /// more than once.
    pub(crate) fn close_protocol(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        if !self.flags.contains(LinkFlags::CLOSE_PROTOCOL)
            || !self.flags.contains(LinkFlags::TERMINATE)
            || self
                .flags
                .intersects(LinkFlags::TERMINATED | LinkFlags::IRRECOVERABLE)
            || self.stream.is_gone()
        {
            return Ok(());
        }

        if matches!(self.protocol, ProtocolState::Casiolink(_)) {
            casiolink::terminate(self)
        } else if matches!(self.protocol, ProtocolState::Seven(_)) && !self.stream.is_ums() {
            flows::terminate(self)
        } else {
            Ok(())
        }
    }

    /// Close the link, reporting any termination failure. The medium is
    /// released either way.
    pub fn close(mut self) -> Result<()> {
        debug!("closing the link");
        self.close_protocol()
    }

    /* ---
     * Operations.
     * --- */

    fn ensure_active(&self) -> Result<()> {
        if self.flags.contains(LinkFlags::IRRECOVERABLE) {
            return Err(Error::Irrecoverable);
        }
        if self.flags.contains(LinkFlags::TERMINATED) {
            return Err(Error::Terminated);
        }
        if self.stream.is_gone() {
            return Err(Error::Gone);
        }
        Ok(())
    }

    /// Check that a Seven control operation can run on this link.
    fn ensure_seven(&self) -> Result<()> {
        self.ensure_active()?;
        if !matches!(self.protocol, ProtocolState::Seven(_)) {
            return Err(Error::Unimplemented);
        }
        if self.stream.is_ums() {
            // Control commands are not carried over the UMS byte pipe.
            return Err(Error::Unimplemented);
        }
        Ok(())
    }

    /// Device information cached from discovery, decoded on first use.
    pub fn device_info(&mut self) -> Result<&DeviceInfo> {
        if self.cached_device_info.is_none() {
            let raw = match &self.protocol {
                ProtocolState::Seven(state) => state.device_info.clone(),
                _ => None,
            };
            let raw = raw.ok_or(Error::Unimplemented)?;
            self.cached_device_info = Some(DeviceInfo::from_raw(&raw)?);
        }
        match &self.cached_device_info {
            Some(info) => Ok(info),
            None => Err(Error::Unknown),
        }
    }

    /// Negotiate new serial parameters with the peer, then reprogram the
    /// local medium. `speed` 0 and `None` fields keep the current values.
    pub fn negotiate_serial_params(
        &mut self,
        speed: u32,
        stop_bits: Option<StopBits>,
        parity: Option<Parity>,
    ) -> Result<()> {
        if !self.stream.is_serial() {
            error!("tried to negotiate serial parameters on a non-serial link");
            return Err(Error::Unimplemented);
        }
        self.ensure_seven()?;

        let mut params = self.serial;
        if speed != 0 {
            SerialParams::validate_speed(speed)?;
            params.speed = speed;
        }
        if let Some(stop_bits) = stop_bits {
            params.stop_bits = Some(stop_bits);
        }
        if let Some(parity) = parity {
            params.parity = parity;
        }

        flows::negotiate_serial_params(self, &params)?;
        self.serial = params;

        if let Err(e) = self.stream.set_serial_params(&params) {
            // The peer has already switched; we cannot talk it back down.
            error!("could not apply the serial params locally; the link is now irrecoverable");
            self.flags.insert(LinkFlags::IRRECOVERABLE);
            return Err(e);
        }
        Ok(())
    }

    /// Pump screen frames into `sink` until it returns `true` (surfaced as
    /// `Interrupted`) or the medium fails.
    pub fn receive_screen(&mut self, sink: &mut dyn FnMut(&Frame<'_>) -> bool) -> Result<()> {
        self.ensure_active()?;
        if matches!(self.protocol, ProtocolState::Casiolink(_))
            && self.flags.contains(LinkFlags::RECEIVER)
        {
            casiolink::get_screen(self, sink)
        } else if matches!(self.protocol, ProtocolState::SevenOhp(_)) {
            ohp::get_screen(self, sink)
        } else {
            Err(Error::Unimplemented)
        }
    }

    /// Ask for the available capacity on a storage device, in bytes.
    pub fn request_storage_capacity(&mut self, storage: &str) -> Result<u32> {
        self.ensure_seven()?;
        flows::request_storage_capacity(self, storage)
    }

    /// Send a file to a storage device.
    #[allow(clippy::too_many_arguments)]
    pub fn send_file_to_storage(
        &mut self,
        flags: SendFileFlags,
        directory: Option<&str>,
        name: &str,
        storage: &str,
        file: &mut dyn Read,
        file_size: u32,
        overwrite: Option<&mut dyn FnMut() -> bool>,
        progress: Option<&mut dyn FnMut(u64, u64)>,
    ) -> Result<()> {
        self.ensure_seven()?;
        flows::send_file_to_storage(
            self, flags, directory, name, storage, file, file_size, overwrite, progress,
        )
    }

    /// Request a file from a storage device.
    pub fn request_file_from_storage(
        &mut self,
        directory: Option<&str>,
        name: &str,
        storage: &str,
        file: &mut dyn Write,
        progress: Option<&mut dyn FnMut(u64, u64)>,
    ) -> Result<()> {
        self.ensure_seven()?;
        flows::request_file_from_storage(self, directory, name, storage, file, progress)
    }

    /// Ask for a file to be copied on a storage device.
    pub fn copy_file_on_storage(
        &mut self,
        source_directory: Option<&str>,
        source_name: &str,
        target_directory: Option<&str>,
        target_name: &str,
        storage: &str,
    ) -> Result<()> {
        self.ensure_seven()?;
        flows::copy_file_on_storage(
            self,
            source_directory,
            source_name,
            target_directory,
            target_name,
            storage,
        )
    }

    /// Ask for a file to be deleted from a storage device.
    pub fn delete_file_from_storage(
        &mut self,
        directory: Option<&str>,
        name: &str,
        storage: &str,
    ) -> Result<()> {
        self.ensure_seven()?;
        flows::delete_file_from_storage(self, directory, name, storage)
    }

    /// List files and directories on a storage device. The sink returns
    /// `true` to stop the listing, which surfaces as `Interrupted`.
    pub fn list_storage_entries(
        &mut self,
        storage: &str,
        sink: &mut dyn FnMut(&StorageEntry) -> bool,
    ) -> Result<()> {
        self.ensure_seven()?;
        flows::list_storage_entries(self, storage, sink)
    }

    /// Ask for a storage device to be reset.
    pub fn reset_storage(&mut self, storage: &str) -> Result<()> {
        self.ensure_seven()?;
        flows::reset_storage(self, storage)
    }

    /// Ask for a storage device to be optimized (defragmented).
    pub fn optimize_storage(&mut self, storage: &str) -> Result<()> {
        self.ensure_seven()?;
        flows::optimize_storage(self, storage)
    }

    /// Back up the calculator's ROM.
    pub fn backup_rom(
        &mut self,
        progress: Option<&mut dyn FnMut(u64, u64)>,
    ) -> Result<Vec<u8>> {
        self.ensure_seven()?;
        flows::backup_rom(self, progress)
    }

    /// Upload a program into RAM and run it.
    pub fn upload_and_run(
        &mut self,
        program: &[u8],
        load_address: u32,
        start_address: u32,
        progress: Option<&mut dyn FnMut(u64, u64)>,
    ) -> Result<()> {
        self.ensure_seven()?;
        flows::upload_and_run(self, program, load_address, start_address, progress)
    }

    /// Flash a system image using the fxRemote method.
    pub fn flash_system(&mut self, flags: FlashFlags, image: &[u8]) -> Result<()> {
        self.ensure_seven()?;
        flash::flash_system(self, flags, image)
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        // Errors cannot be reported from here; `close` surfaces them.
        let _ = self.close_protocol();
    }
}

fn link_flags(flags: OpenFlags) -> LinkFlags {
    let mut link_flags = LinkFlags::empty();
    if !flags.contains(OpenFlags::NOTERM) {
        link_flags |= LinkFlags::TERMINATE;
    }
    if flags.contains(OpenFlags::RECEIVER) {
        link_flags |= LinkFlags::RECEIVER;
    }
    link_flags
}

#[cfg(test)]
pub(crate) mod testlink {
    use super::*;
    use crate::medium::mock::MockMedium;

    pub(crate) fn seven(mock: MockMedium) -> Link {
        Link::build(
            Stream::new(Medium::mock(mock)),
            ProtocolState::Seven(seven::SevenState::new()),
            LinkFlags::TERMINATE | LinkFlags::CLOSE_PROTOCOL,
            SerialParams::default(),
        )
    }

    pub(crate) fn ohp(mock: MockMedium) -> Link {
        Link::build(
            Stream::new(Medium::mock(mock)),
            ProtocolState::SevenOhp(ohp::OhpState::new()),
            LinkFlags::RECEIVER,
            SerialParams::default(),
        )
    }

    pub(crate) fn casiolink(mock: MockMedium, variant: CasVariant) -> Link {
        Link::build(
            Stream::new(Medium::mock(mock)),
            ProtocolState::Casiolink(CasiolinkState::new(variant)),
            LinkFlags::TERMINATE | LinkFlags::CLOSE_PROTOCOL | LinkFlags::RECEIVER,
            SerialParams::default(),
        )
    }

    impl Link {
        pub(crate) fn mock_mut(&mut self) -> &mut MockMedium {
            self.stream.medium_mut().mock_state()
        }
    }
}
