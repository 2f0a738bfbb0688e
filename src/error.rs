use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// The component an error originated from.
///
/// Index and Bucket tag their own failures; the Volume tags the
/// cross-checks it performs itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Site {
    Volume,
    Index,
    Bucket,
}

impl Display for Site {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Site::Volume => write!(f, "volume"),
            Site::Index => write!(f, "index"),
            Site::Bucket => write!(f, "bucket"),
        }
    }
}

/// Silo errors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// Header magic bytes did not match; the file is corrupt or in a
    /// foreign format. The handle must not be used further.
    BadMagic,
    /// Header checksum mismatch; the file is corrupt. The handle must
    /// not be used further.
    BadCrc,
    /// The capacity recorded in a header exceeds the actual backend
    /// length; the file may be truncated or corrupt.
    BadCapacity,
    /// A read past the logical size of an auto-extending file.
    ShortRead,
    /// A stored id does not match the id it was looked up under.
    /// Indicates data corruption or a wrong index for a bucket. Fatal
    /// for the operation; the handle remains usable for other ids.
    IdMismatch { got: i64, expected: i64, site: Site },
    /// The backend failed, tagged with the component that called it.
    Backend { site: Site, cause: String },
    /// An IO error outside of any volume component.
    Io(String),
}

impl Error {
    /// Wraps a backend failure with the component it occurred at.
    pub fn backend(cause: impl Display, site: Site) -> Self {
        Error::Backend {
            site,
            cause: cause.to_string(),
        }
    }

    /// Builds an id cross-check failure for the given component.
    pub fn id_mismatch(got: i64, expected: i64, site: Site) -> Self {
        Error::IdMismatch { got, expected, site }
    }
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::BadMagic => write!(f, "bad header magic bytes, file corrupted or in wrong format"),
            Error::BadCrc => write!(f, "header crc mismatch"),
            Error::BadCapacity => write!(f, "capacity in header exceeds actual file size"),
            Error::ShortRead => write!(f, "read past logical end of file"),
            Error::IdMismatch { got, expected, site } => {
                write!(f, "id mismatch at {site}: got {got}, expected {expected}")
            }
            Error::Backend { site, cause } => write!(f, "backend at {site}: {cause}"),
            Error::Io(cause) => write!(f, "io error: {cause}"),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Io(err.to_string())
    }
}

/// A silo Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;
