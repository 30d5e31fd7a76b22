//! Error taxonomy shared by every crate in this workspace.

/// Error kinds returned by fallible transmit-core operations.
///
/// Every fallible entry point — control-thread calls, buffer setup, DCL
/// program construction — returns one of these. There are no out-of-band
/// panics on the hot path; `IoError` is the only variant that carries an
/// underlying OS error rather than a bare code, since this is the Rust
/// equivalent of an `expected<T, error>` with an optional kernel return code.
#[derive(Debug, thiserror::Error)]
pub enum TransmitError {
    /// A caller-supplied argument was invalid (null nub, zero-sized field, out-of-range index).
    #[error("bad argument: {0}")]
    BadArgument(String),

    /// An allocation (DMA region, shared-memory mapping) failed.
    #[error("no memory")]
    NoMemory,

    /// The operation requires a state that hasn't been reached yet.
    #[error("not ready")]
    NotReady,

    /// The operation conflicts with one already in progress (e.g. double `initialize`).
    #[error("busy")]
    Busy,

    /// The hardware nub is missing or has been removed.
    #[error("no device")]
    NoDevice,

    /// The operation did not complete within its allotted window.
    #[error("timeout")]
    Timeout,

    /// The requested configuration is not supported by this build.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// An internal invariant was violated; should not happen in correct usage.
    #[error("internal error: {0}")]
    InternalError(String),

    /// An underlying OS call failed.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type alias used throughout the transmit core.
pub type Result<T> = std::result::Result<T, TransmitError>;
