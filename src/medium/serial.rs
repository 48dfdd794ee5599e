//! POSIX serial port backend.
//!
//! Timed reads are implemented with `select(2)` so that the caller's timeout
//! budget is enforced by the kernel rather than by polling; DTR and RTS are
//! driven through the modem-control ioctls.

use crate::error::{Error, Result};
use crate::medium::RawRead;
use crate::params::{LineMode, Parity, SerialParams, StopBits};
use nix::errno::Errno;
use nix::fcntl::{self, OFlag};
use nix::sys::select::{select, FdSet};
use nix::sys::stat::Mode;
use nix::sys::termios::{
    self, BaudRate, ControlFlags, InputFlags, LocalFlags, SetArg, SpecialCharacterIndices,
};
use nix::sys::time::{TimeVal, TimeValLike};
use nix::unistd;
use std::os::unix::io::RawFd;
use tracing::error;

nix::ioctl_read_bad!(tiocmget, libc::TIOCMGET, libc::c_int);
nix::ioctl_write_ptr_bad!(tiocmset, libc::TIOCMSET, libc::c_int);

pub(crate) struct SerialPort {
    fd: RawFd,
}

impl SerialPort {
    pub(crate) fn open(path: &str) -> Result<SerialPort> {
        let fd = fcntl::open(path, OFlag::O_RDWR | OFlag::O_NOCTTY, Mode::empty()).map_err(
            |errno| match errno {
                Errno::ENODEV | Errno::ENOENT | Errno::ENXIO | Errno::EPIPE | Errno::ESPIPE => {
                    error!(path, "could not open serial device: {}", errno);
                    Error::NotFound
                }
                Errno::EACCES => Error::PermissionDenied,
                errno => {
                    error!(path, "could not open serial device: {}", errno);
                    Error::Unknown
                }
            },
        )?;
        Ok(SerialPort { fd })
    }

    /// Wait for input for up to `timeout_ms` (0 = forever), then read whatever
    /// is pending into `dest`.
    pub(crate) fn read(&mut self, dest: &mut [u8], timeout_ms: u64) -> Result<RawRead> {
        if timeout_ms > 0 {
            let mut read_fds = FdSet::new();
            read_fds.insert(self.fd);
            let mut timeout = TimeVal::milliseconds(timeout_ms as i64);
            match select(self.fd + 1, &mut read_fds, None, None, &mut timeout) {
                Ok(0) => return Ok(RawRead::TimedOut),
                Ok(_) => {}
                Err(errno) => {
                    error!("select() failed: {}", errno);
                    return Err(Error::Unknown);
                }
            }
        }

        match unistd::read(self.fd, dest) {
            Ok(n) => Ok(RawRead::Data(n)),
            Err(Errno::ENODEV) | Err(Errno::EIO) => Err(Error::Gone),
            Err(errno) => {
                error!("read() failed: {}", errno);
                Err(Error::Unknown)
            }
        }
    }

    pub(crate) fn write_all(&mut self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            let written = match unistd::write(self.fd, buf) {
                Ok(n) => n,
                Err(Errno::ENODEV) => return Err(Error::Gone),
                Err(errno) => {
                    error!("write() failed: {}", errno);
                    return Err(Error::Unknown);
                }
            };
            buf = &buf[written..];
        }
        Ok(())
    }

    pub(crate) fn set_params(&mut self, params: &SerialParams) -> Result<()> {
        let speed = baud_rate(params.speed)?;

        // Let pending output drain at the old speed before reprogramming.
        if let Err(errno) = termios::tcdrain(self.fd) {
            error!("tcdrain() failed: {}", errno);
            return Err(Error::Unknown);
        }

        let mut term = match termios::tcgetattr(self.fd) {
            Ok(term) => term,
            Err(errno) => {
                error!("tcgetattr() failed: {}", errno);
                return Err(Error::Unknown);
            }
        };

        let _ = termios::cfsetispeed(&mut term, speed);
        let _ = termios::cfsetospeed(&mut term, speed);

        term.input_flags.remove(
            InputFlags::IGNBRK
                | InputFlags::IGNCR
                | InputFlags::BRKINT
                | InputFlags::PARMRK
                | InputFlags::ISTRIP
                | InputFlags::INLCR
                | InputFlags::ICRNL
                | InputFlags::IGNPAR
                | InputFlags::IXON
                | InputFlags::IXOFF,
        );
        if params.xon_xoff {
            term.input_flags.insert(InputFlags::IXON | InputFlags::IXOFF);
            term.control_chars[SpecialCharacterIndices::VSTART as usize] = 0x11;
            term.control_chars[SpecialCharacterIndices::VSTOP as usize] = 0x13;
            term.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
        }

        term.output_flags = termios::OutputFlags::empty();
        term.local_flags.remove(
            LocalFlags::ECHO
                | LocalFlags::ECHONL
                | LocalFlags::ICANON
                | LocalFlags::ISIG
                | LocalFlags::IEXTEN,
        );

        term.control_flags.remove(
            ControlFlags::PARENB | ControlFlags::PARODD | ControlFlags::CSTOPB | ControlFlags::CSIZE,
        );
        term.control_flags.insert(ControlFlags::CREAD | ControlFlags::CS8);
        match params.parity {
            Parity::None => {}
            Parity::Even => term.control_flags.insert(ControlFlags::PARENB),
            Parity::Odd => term
                .control_flags
                .insert(ControlFlags::PARENB | ControlFlags::PARODD),
        }
        if params.stop_bits == Some(StopBits::Two) {
            term.control_flags.insert(ControlFlags::CSTOPB);
        }

        if let Err(errno) = termios::tcsetattr(self.fd, SetArg::TCSANOW, &term) {
            error!("tcsetattr() failed: {}", errno);
            return Err(Error::Unknown);
        }

        self.set_modem_lines(params)
    }

    fn set_modem_lines(&mut self, params: &SerialParams) -> Result<()> {
        let mut status: libc::c_int = 0;
        if unsafe { tiocmget(self.fd, &mut status) }.is_err() {
            status = 0;
        }
        let original = status;

        match params.dtr {
            LineMode::Enabled | LineMode::Handshake => status |= libc::TIOCM_DTR,
            LineMode::Disabled => status &= !libc::TIOCM_DTR,
        }
        match params.rts {
            LineMode::Enabled | LineMode::Handshake => status |= libc::TIOCM_RTS,
            LineMode::Disabled => status &= !libc::TIOCM_RTS,
        }

        if status != original && unsafe { tiocmset(self.fd, &status) }.is_err() {
            error!("could not set DTR/RTS mode");
            return Err(Error::Unknown);
        }
        Ok(())
    }
}

impl Drop for SerialPort {
    fn drop(&mut self) {
        let _ = unistd::close(self.fd);
    }
}

fn baud_rate(speed: u32) -> Result<BaudRate> {
    Ok(match speed {
        300 => BaudRate::B300,
        600 => BaudRate::B600,
        1200 => BaudRate::B1200,
        2400 => BaudRate::B2400,
        4800 => BaudRate::B4800,
        9600 => BaudRate::B9600,
        19200 => BaudRate::B19200,
        38400 => BaudRate::B38400,
        57600 => BaudRate::B57600,
        115200 => BaudRate::B115200,
        speed => {
            error!(speed, "speed unsupported by termios");
            return Err(Error::Unknown);
        }
    })
}
