//! Crate-wide error types.
//!
//! Mirrors the error-kind catalogue of the protocol specification: most
//! variants are fatal for the session that raised them, a couple are
//! recoverable at the call site (`BlobMissing` outside of stage-1,
//! `TransientReadError`), and `DeviceGone` is not really an error at all but
//! the expected way a file-server loop ends.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("blob missing: {0}")]
    BlobMissing(String),

    #[error("invalid command code: {0}")]
    InvalidCommand(u32),

    #[error("bootcode rejected by device, return code {0}")]
    BootcodeRejected(u32),

    #[error("device endpoint shape did not match expectations")]
    EndpointMismatch,

    #[error("bulk transfer stalled after retries")]
    TransferStall,

    #[error("USB transfer timed out")]
    TransferTimeout,

    /// Expected terminal condition: the device has rebooted and gone away
    /// mid read. Not surfaced as a session failure.
    #[error("device is gone (expected during re-enumeration)")]
    DeviceGone,

    #[error("transient read error: {0}")]
    TransientReadError(String),

    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

impl ProtocolError {
    /// Classifies a transport read error the way the file-server loop needs
    /// to: `NO_DEVICE`/`IO` style failures end the loop cleanly, everything
    /// else is transient and gets retried with a backoff.
    pub fn is_device_gone(&self) -> bool {
        matches!(
            self,
            ProtocolError::DeviceGone
                | ProtocolError::Usb(rusb::Error::NoDevice)
                | ProtocolError::Usb(rusb::Error::Io)
        )
    }
}
