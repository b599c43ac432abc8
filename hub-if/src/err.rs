pub type Result<T = ()> = core::result::Result<T, PortError>;

/// Error taxonomy shared by every public port-driver operation.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortError {
    #[error("Operation not allowed")]
    NotAllowed,
    #[error("Invalid argument")]
    InvalidArg,
    #[error("Invalid state for this operation")]
    InvalidState,
    /// Returned by `gone` while a device is still present on the port.
    /// The caller must run the recycle sequence before deleting.
    #[error("Not finished, recycle required first")]
    NotFinished,
    #[error("No memory available")]
    NoMemory,
    /// The parent hub failed to submit a class request.
    #[error("Gateway request failed")]
    Gateway,
}
