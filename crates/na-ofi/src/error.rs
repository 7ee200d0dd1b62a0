use ofi::FabricError;

/// The fixed error enumeration of the plugin surface.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("out of memory")]
    NoMem,
    #[error("operation timed out")]
    Timeout,
    #[error("operation canceled")]
    Canceled,
    #[error("invalid argument: {0}")]
    InvalidArg(&'static str),
    #[error("size exceeds buffer capacity")]
    Overflow,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("protocol not supported: {0}")]
    ProtocolNotSupported(String),
    #[error("address not available")]
    AddrNotAvail,
    #[error("no entry found")]
    NoEntry,
    #[error("resource busy")]
    Busy,
    #[error("fault: {0}")]
    Fault(&'static str),
    #[error("message size exceeds maximum")]
    MsgSize,
    #[error("operation not supported")]
    OpNotSupported,
    #[error("resource temporarily unavailable")]
    Again,
}

impl From<FabricError> for Error {
    fn from(err: FabricError) -> Error {
        match err {
            FabricError::Again => Error::Again,
            FabricError::Canceled => Error::Canceled,
            FabricError::AddrNotAvail => Error::AddrNotAvail,
            FabricError::TooSmall(_) => Error::Overflow,
            FabricError::NoEntry => Error::NoEntry,
            FabricError::Interrupted => Error::Again,
            FabricError::TimedOut => Error::Timeout,
            FabricError::Unsupported => Error::OpNotSupported,
            FabricError::Io => Error::Protocol("fabric I/O failure".to_string()),
            FabricError::Other(msg) => Error::Protocol(msg),
        }
    }
}
