/// Errors raised by the fog core.
#[derive(Debug, thiserror::Error)]
pub enum FogError {
    #[error("invalid snapshot: {cols}x{rows} grid needs {expected} cells, buffer has {actual}")]
    InvalidSnapshot {
        cols: u32,
        rows: u32,
        expected: usize,
        actual: usize,
    },
    #[error("malformed geometry: {0}")]
    MalformedGeometry(String),
    #[error("unknown cell state {0}")]
    UnknownCellState(u8),
    #[error("wire format error: {0}")]
    Wire(String),
    #[error("delta is based on update {base}, last applied was {last:?}")]
    DeltaBaseMismatch { base: u64, last: Option<u64> },
}

/// Errors raised by the realtime sync layer. These are logged, not propagated into gameplay.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("channel not ready: initialize() has not joined a session")]
    ChannelNotReady,
    #[error("failed to encode fog payload: {0}")]
    Encode(#[from] serde_json::Error),
}
