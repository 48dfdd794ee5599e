use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong while driving a link.
///
/// OS-level and libusb-level failures are translated into this taxonomy at
/// the medium boundary; callers never see an errno or a `rusb::Error`.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("Operation or feature is not implemented")]
    Unimplemented,
    #[error("An unknown error has occurred")]
    Unknown,
    #[error("A memory allocation has failed")]
    OutOfMemory,
    #[error("Insufficient privileges")]
    PermissionDenied,
    #[error("Device or resource is busy")]
    Busy,
    #[error("Operation was interrupted by a callback")]
    Interrupted,
    #[error("Declared data size is out of bounds")]
    DataSize,
    #[error("Input was truncated")]
    Truncated,
    #[error("Invalid data or behaviour")]
    Invalid,
    #[error("Device or data is incompatible")]
    Incompatible,
    #[error("The link was terminated")]
    Terminated,

    #[error("Device could not be found")]
    NotFound,
    #[error("Too many devices found")]
    TooMany,
    #[error("Device is gone, I/O has failed")]
    Gone,
    #[error("Timed out waiting for the first byte")]
    TimeoutStart,
    #[error("Timed out waiting for further bytes")]
    Timeout,
    #[error("Corrupted packet")]
    Corrupt,
    #[error("The link is in an irrecoverable state")]
    Irrecoverable,

    #[error("File was not overwritten")]
    NotOverwritten,
}
