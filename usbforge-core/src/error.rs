//! The error taxonomy for a pipeline run.
//!
//! Each variant corresponds to one failure class a stage can post to the
//! [`crate::pipeline::ErrorChannel`]. Stage workers never swallow errors;
//! every failure carries a human-readable message the front-end can show
//! verbatim.

use thiserror::Error;

/// A failure reported by one of the pipeline stages.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// No device with the given id exists in the current device list.
    #[error("no device with id {0} in the current device list")]
    NotFound(u32),

    /// The download failed: connection error, non-2xx response, or a
    /// transfer that ended before the advertised content length.
    #[error("network error: {0}")]
    Network(String),

    /// The downloaded archive could not be read, the raw image member is
    /// missing, or the destination is not writable.
    #[error("extraction failed: {0}")]
    Extraction(String),

    /// The image file could not be stat'd before writing. The device is
    /// untouched; retrying the write is safe.
    #[error("could not determine image size: {0}")]
    GetFileSize(String),

    /// The write to the device failed. The device may be partially
    /// written and should not be trusted without re-verification.
    #[error("writing the image to the device failed: {0}")]
    Install(String),

    /// An internal invariant was violated, such as the disk writer
    /// claiming completion while still logically running. Always fatal
    /// to the run.
    #[error("internal state error: {0}")]
    InternalState(String),

    /// The operation was cancelled by the user.
    #[error("operation cancelled by user")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;
