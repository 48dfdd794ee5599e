//! Buffered exact reads over a medium.
//!
//! [`Stream::read`] either fills the caller's buffer completely or fails.
//! Two timeouts apply: `first_timeout` until the first byte arrives, and
//! `next_timeout` between bytes after that; 0 means wait forever. Surplus
//! bytes from a raw read are kept for the next call.

use crate::error::{Error, Result};
use crate::medium::{Medium, RawRead, READ_BUFFER_SIZE};
use crate::params::SerialParams;
use crate::time::Monotonic;
use tracing::trace;

/// Chunk size used by [`Stream::skip`] to discard bytes.
const SKIP_CHUNK: usize = 2048;

pub(crate) struct Stream {
    medium: Medium,
    buf: Box<[u8]>,
    /// Unread bytes live in `buf[start..start + size]`.
    start: usize,
    size: usize,
}

impl Stream {
    pub(crate) fn new(medium: Medium) -> Stream {
        Stream {
            medium,
            buf: vec![0; READ_BUFFER_SIZE].into_boxed_slice(),
            start: 0,
            size: 0,
        }
    }

    pub(crate) fn is_serial(&self) -> bool {
        self.medium.is_serial()
    }

    pub(crate) fn is_ums(&self) -> bool {
        self.medium.is_ums()
    }

    pub(crate) fn is_gone(&self) -> bool {
        self.medium.is_gone()
    }

    /// Fill `out` completely or fail.
    pub(crate) fn read(&mut self, out: &mut [u8], first_timeout: u64, next_timeout: u64) -> Result<()> {
        let mut filled = 0;
        let size = out.len();
        if size == 0 {
            return Ok(());
        }

        // Serve as much as possible from the buffered bytes. This may fully
        // satisfy the caller without touching the medium.
        if self.size > 0 {
            let take = self.size.min(size);
            out[..take].copy_from_slice(&self.buf[self.start..self.start + take]);
            self.start += take;
            self.size -= take;
            filled += take;
            if filled == size {
                return Ok(());
            }
            self.start = 0;
            self.size = 0;
        }

        let mut timeout = first_timeout;
        let mut timeout_error = Error::TimeoutStart;
        let mut last_time = Monotonic::now();
        // Pretend the first pass follows a productive one so it does not get
        // charged for time that has not elapsed yet.
        let mut bytes_read = 1;

        while filled < size {
            // If the last pass yielded nothing without blocking, charge the
            // elapsed time against the budget explicitly.
            if bytes_read == 0 && timeout > 0 {
                let now = Monotonic::now();
                let elapsed = now.since(last_time);
                if elapsed >= timeout {
                    return Err(timeout_error);
                }
                timeout -= elapsed;
                last_time = now;
            }

            bytes_read = match self.medium.raw_read(&mut self.buf, timeout)? {
                RawRead::Data(n) => n,
                RawRead::TimedOut => return Err(timeout_error),
            };
            if bytes_read == 0 {
                continue;
            }

            timeout = next_timeout;
            timeout_error = Error::Timeout;
            last_time = Monotonic::now();

            let need = size - filled;
            if bytes_read >= need {
                out[filled..].copy_from_slice(&self.buf[..need]);
                // Stash the surplus for the next read.
                self.start = need;
                self.size = bytes_read - need;
                filled = size;
            } else {
                out[filled..filled + bytes_read].copy_from_slice(&self.buf[..bytes_read]);
                filled += bytes_read;
            }
        }

        trace!(size, "read from medium");
        Ok(())
    }

    /// Discard exactly `size` bytes.
    pub(crate) fn skip(&mut self, mut size: usize, first_timeout: u64, next_timeout: u64) -> Result<()> {
        let mut sink = [0u8; SKIP_CHUNK];
        let mut timeout = first_timeout;
        while size > 0 {
            let chunk = size.min(SKIP_CHUNK);
            self.read(&mut sink[..chunk], timeout, next_timeout)?;
            timeout = next_timeout;
            size -= chunk;
        }
        Ok(())
    }

    /// Write the whole buffer through to the medium. No write buffering is
    /// performed; pure byte pipes have no read-overlap to invalidate.
    pub(crate) fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.medium.write(buf)
    }

    pub(crate) fn set_serial_params(&mut self, params: &SerialParams) -> Result<()> {
        self.medium.set_serial_params(params)
    }

    #[cfg(test)]
    pub(crate) fn medium_mut(&mut self) -> &mut Medium {
        &mut self.medium
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::medium::mock::MockMedium;

    fn stream(mock: MockMedium) -> Stream {
        Stream::new(Medium::mock(mock))
    }

    #[test]
    fn exact_read_across_bursts() {
        let mut mock = MockMedium::new();
        mock.queue_read(b"ab");
        mock.queue_read(b"cde");
        let mut stream = stream(mock);

        let mut out = [0u8; 5];
        stream.read(&mut out, 0, 1000).unwrap();
        assert_eq!(&out, b"abcde");
    }

    #[test]
    fn surplus_is_stashed_for_the_next_read() {
        let mut mock = MockMedium::new();
        mock.queue_read(b"abcdef");
        let mut stream = stream(mock);

        let mut out = [0u8; 2];
        stream.read(&mut out, 0, 1000).unwrap();
        assert_eq!(&out, b"ab");

        // The remaining four bytes must be served without a medium read;
        // the script is empty, so any raw read would time out.
        let mut out = [0u8; 4];
        stream.read(&mut out, 0, 1000).unwrap();
        assert_eq!(&out, b"cdef");
    }

    #[test]
    fn partial_overlap_mixes_buffered_and_fresh_bytes() {
        let mut mock = MockMedium::new();
        mock.queue_read(b"abcd");
        mock.queue_read(b"ef");
        let mut stream = stream(mock);

        let mut out = [0u8; 3];
        stream.read(&mut out, 0, 1000).unwrap();
        assert_eq!(&out, b"abc");

        let mut out = [0u8; 3];
        stream.read(&mut out, 0, 1000).unwrap();
        assert_eq!(&out, b"def");
    }

    #[test]
    fn first_byte_timeout_is_timeout_start() {
        let mut stream = stream(MockMedium::new());
        let mut out = [0u8; 1];
        assert_eq!(
            stream.read(&mut out, 100, 100),
            Err(crate::Error::TimeoutStart)
        );
    }

    #[test]
    fn stall_after_first_byte_is_timeout() {
        let mut mock = MockMedium::new();
        mock.queue_read(b"a");
        let mut stream = stream(mock);
        let mut out = [0u8; 2];
        assert_eq!(stream.read(&mut out, 100, 100), Err(crate::Error::Timeout));
    }

    #[test]
    fn skip_discards_exactly() {
        let mut mock = MockMedium::new();
        mock.queue_read(b"abcdef");
        let mut stream = stream(mock);

        stream.skip(4, 0, 1000).unwrap();
        let mut out = [0u8; 2];
        stream.read(&mut out, 0, 1000).unwrap();
        assert_eq!(&out, b"ef");
    }

    #[test]
    fn ums_byte_pipe_reads_through_c0_c1() {
        // S5: C0 reports 10 bytes available, C1 fetches them, and they come
        // out of the stream as if read from a serial port.
        let mut mock = MockMedium::new();
        mock.ums = true;

        let mut c0 = [0u8; 16];
        c0[0] = 0xC0;
        let mut c0_response = [0u8; 16];
        c0_response[6] = 0x00;
        c0_response[7] = 0x0A;
        mock.queue_scsi(&c0, &c0_response, 0);

        let mut c1 = [0u8; 16];
        c1[0] = 0xC1;
        c1[6] = 0x00;
        c1[7] = 0x0A;
        mock.queue_scsi(&c1, b"0123456789", 0);

        let mut stream = stream(mock);
        let mut out = [0u8; 10];
        stream.read(&mut out, 0, 1000).unwrap();
        assert_eq!(&out, b"0123456789");
    }

    #[test]
    fn ums_write_chunks_below_c2_limit() {
        let mut mock = MockMedium::new();
        mock.ums = true;

        // 0x1_0001 bytes require two C2 requests: 0xFFFF then 2.
        let payload = vec![0x55u8; 0x10001];
        let mut c0 = [0u8; 16];
        c0[0] = 0xC0;
        let c0_response = [0u8; 16];
        let mut c2 = [0u8; 16];
        c2[0] = 0xC2;
        c2[6] = 0xFF;
        c2[7] = 0xFF;
        mock.queue_scsi(&c0, &c0_response, 0);
        mock.queue_scsi(&c2, &[], 0);
        let mut c2_last = [0u8; 16];
        c2_last[0] = 0xC2;
        c2_last[6] = 0x00;
        c2_last[7] = 0x02;
        mock.queue_scsi(&c0, &c0_response, 0);
        mock.queue_scsi(&c2_last, &[], 0);

        let mut stream = stream(mock);
        stream.write(&payload).unwrap();
        assert_eq!(stream.medium_mut().mock_state().written.len(), 0x10001);
    }
}
