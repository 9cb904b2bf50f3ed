use thiserror::Error;

/// Error taxonomy for every engine operation. Each variant maps onto one of
/// the status kinds the control surface reports to callers.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("device not connected: {0}")]
    NotConnected(String),

    #[error("device not streaming: {0}")]
    NotStreaming(String),

    #[error("bad parameter: {0}")]
    BadParameter(String),

    #[error("changing {0} requires a reconnect")]
    RequiresReconnect(String),

    #[error("bad shape: expected {expected} channels, got {actual}")]
    BadShape { expected: usize, actual: usize },

    #[error("unknown session: {0}")]
    UnknownSession(String),

    #[error("unknown config component: {0}")]
    UnknownComponent(String),

    #[error("processing failed: {0}")]
    ProcessingFailed(String),

    #[error("device discovery failed: {0}")]
    DiscoveryFailed(String),

    #[error("operation not supported by this device: {0}")]
    Unsupported(String),

    #[error("block of {requested} samples exceeds buffer capacity {capacity}")]
    BufferTooLarge { requested: usize, capacity: usize },

    #[error("buffer rejected chunk: overflow with drop_on_overflow disabled")]
    BufferOverflow,

    #[error("timed out after {0:.1}s")]
    Timeout(f64),

    #[error("serial I/O error: {0}")]
    Serial(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("vendor library error: {0}")]
    VendorLibrary(String),
}

impl From<serialport::Error> for EngineError {
    fn from(value: serialport::Error) -> Self {
        EngineError::Serial(value.to_string())
    }
}

impl From<libloading::Error> for EngineError {
    fn from(value: libloading::Error) -> Self {
        EngineError::VendorLibrary(value.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
