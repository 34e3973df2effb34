use std::{error, fmt, io};

/// The error type used by the `xbios` library.
///
/// Soft conditions (an invalid 2BL, a missing preldr) are *statuses*, not
/// errors; they are reported through [`Bios::status`] and the preldr status
/// and leave the image handle usable.
///
/// [`Bios::status`]: ../struct.Bios.html#method.status
#[derive(Debug)]
pub enum Error {
    /// The file or rom size is not one of 256 KiB, 512 KiB or 1 MiB.
    InvalidSize(u32),
    /// A pointer, length or structure in the image is inconsistent.
    Malformed(String),
    /// An operation required an externally supplied key that was not given.
    KeyMissing(&'static str),
    /// The compressed kernel stream could not be decompressed.
    DecompressFailed(String),
    /// A decrypt was requested for an entity that is already plaintext.
    AlreadyPlaintext,
    Io(io::Error),
}

impl Error {
    /// Creates an `Error` denoting that an address computation would have lead
    /// to an overflow.
    pub(crate) fn addr_overflow(base: u32, offset: u32) -> Self {
        Error::Malformed(format!(
            "invalid address or length: address computation overflow ({:#08X}+{:#08X})",
            base, offset
        ))
    }
}

impl error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::InvalidSize(size) => write!(
                f,
                "invalid image size {:#X} (expected 0x40000, 0x80000 or 0x100000)",
                size
            ),
            Error::Malformed(s) => write!(f, "malformed data: {}", s),
            Error::KeyMissing(which) => write!(f, "required key not supplied: {}", which),
            Error::DecompressFailed(s) => write!(f, "kernel decompression failed: {}", s),
            Error::AlreadyPlaintext => write!(f, "entity is already plaintext"),
            Error::Io(io) => write!(f, "i/o error: {}", io),
        }
    }
}

impl From<io::Error> for Error {
    fn from(io: io::Error) -> Self {
        Error::Io(io)
    }
}
