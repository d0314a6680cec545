/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// Decode was handed something other than exactly one frame.
    #[error("invalid frame length ({actual} bytes, expected {expected})")]
    InvalidLength { expected: usize, actual: usize },

    /// More parameters than the frame has slots for.
    #[error("too many parameters ({count}, max {max})")]
    TooManyParams { count: usize, max: usize },

    /// A parameter does not fit in a 32-bit field.
    #[error("parameter {index} out of 32-bit range: {value}")]
    ParamOutOfRange { index: usize, value: i64 },

    /// A frame announced more trailing bytes than the reader accepts.
    #[error("additional data too large ({size} bytes, max {max})")]
    AdditionalDataTooLarge { size: usize, max: usize },

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed before a complete frame was received.
    #[error("connection closed (incomplete frame)")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, FrameError>;
