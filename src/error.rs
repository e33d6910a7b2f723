use thiserror::Error;

/// Errors raised by the GPU frame transform flow.
#[derive(Error, Debug)]
pub enum TransformError {
    /// No adapter, device or surface could be acquired on this host.
    #[error("GPU rendering is not supported on this platform: {0}")]
    GpuUnsupported(String),

    #[error("GPU device error: {0}")]
    Device(String),

    #[error("render failed: {0}")]
    Render(String),

    #[error("failed to read back rendered surface: {0}")]
    Readback(String),

    /// Frame dimensions and pixel buffer disagree.
    #[error("invalid frame {width}x{height} with {len} bytes")]
    InvalidFrame { width: u32, height: u32, len: usize },

    #[error("output sink closed")]
    SinkClosed,
}

/// Errors raised while negotiating a call between two endpoints.
#[derive(Error, Debug)]
pub enum NegotiationError {
    /// The operation is not allowed in the endpoint's current signaling state.
    #[error("{label}: invalid state: {reason}")]
    InvalidState { label: &'static str, reason: String },

    #[error("{label}: no transceiver is bound to local track '{track_id}'")]
    NoMatchingTransceiver {
        label: &'static str,
        track_id: String,
    },

    #[error("codec not found in capabilities: {0}")]
    CodecNotFound(String),

    #[error("{label}: session description error: {reason}")]
    Sdp { label: &'static str, reason: String },

    #[error("{label}: ICE candidate error: {reason}")]
    Candidate { label: &'static str, reason: String },

    #[error("{label}: rtc error: {reason}")]
    Rtc { label: &'static str, reason: String },

    #[error("signaling channel closed")]
    ChannelClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
