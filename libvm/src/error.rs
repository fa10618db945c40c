use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum MapError {
    #[error("Virtual address not page aligned")]
    VirtNotAligned,

    #[error("The region to be placed has a zero or non page-multiple size")]
    BadSize,
}

#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum IoError {
    #[error("The requested I/O operation was out of bounds for the inode")]
    OutOfBounds,

    #[error("The underlying device reported an error")]
    DeviceError,

    #[error("The inode cannot be written")]
    ReadOnly,
}

#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum KernelError {
    #[error("Cannot allocate memory")]
    NoMemory,

    #[error("Invalid value")]
    InvalidValue,

    #[error("Operation not supported")]
    NotSupported,

    #[error("Page table mapping failed: {0}")]
    MappingError(#[from] MapError),

    #[error("I/O operation failed: {0}")]
    Io(#[from] IoError),
}

pub type Result<T> = core::result::Result<T, KernelError>;
