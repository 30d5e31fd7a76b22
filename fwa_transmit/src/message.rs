//! Client notification surface: a single callback carrying one of a fixed
//! set of message codes.

/// Messages the transmitter delivers to its client. Invoked on whichever
/// thread produced the event (most are the DCL callback thread); clients
/// must not block or take locks that could be held by the control thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmitterMessage {
    /// Isochronous transmission has started. Delivered exactly once per
    /// successful `start_transmit`.
    StreamStarted,
    /// Isochronous transmission has stopped. Delivered exactly once per
    /// `stop_transmit` (including overrun-triggered stops).
    StreamStopped,
    /// The packet provider ran out of client data for `(segment, packet)`;
    /// silence was substituted.
    BufferUnderrun { segment: u32, packet: u32 },
    /// The DCL program ran off the end of the ring.
    OverrunError,
    /// Automatic recovery from an overrun is being attempted.
    OverrunRecoveryAttempt,
    /// Automatic overrun recovery failed; the stream is stopped.
    OverrunRecoveryFailed,
    /// A port/channel was allocated. `speed` and `channel` are message-specific.
    AllocatePort { speed: u32, channel: u32 },
    /// The port/channel was released.
    ReleasePort,
    /// An internal timestamp adjustment occurred (`expected`, `actual` cycle).
    TimestampAdjust { expected_cycle: u32, actual_cycle: u32 },
    /// A DBC continuity violation was detected post-transmission.
    DbcContinuityViolation { segment: u32, packet: u32 },
    /// A generic or unrecoverable error occurred.
    Error,
}

/// A client-registered sink for [`TransmitterMessage`]s. Boxed so the
/// transmitter can own one without a generic parameter leaking through its
/// public API; called from the callback thread, so implementations must be
/// `Send` and must not block.
pub type MessageCallback = Box<dyn FnMut(TransmitterMessage) + Send>;
