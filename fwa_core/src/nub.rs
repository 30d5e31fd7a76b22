//! The hardware boundary: a trait abstracting the isochronous port/channel
//! and transport manager, plus the small value types the DCL program
//! exchanges with it.
//!
//! Port management ("open a port, allocate a channel/speed, bind the DCL
//! program") and transport control ("start/stop the channel") are modeled
//! as two adapter roles over the same underlying kernel interface. Since
//! every real implementation of one implies the other (you cannot start a
//! channel you haven't opened a port for), this crate collapses them into
//! one trait and lets a production backend implement both halves on the
//! same type.

use crate::error::Result;

/// Bus speed, in the usual FireWire S100/S200/S400 naming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusSpeed {
    S100,
    S200,
    S400,
    S800,
}

/// Sentinel meaning "any available channel" for [`NubPort::configure`].
pub const ANY_CHANNEL: u32 = 0xFFFF_FFFF;

/// Value/mask pair controlling which bits of the hardware-generated isoch
/// header the DMA engine should overwrite with caller-supplied values.
///
/// Mask `0x0000_C00F` targets the tag (bits 15-14) and sy (bits 3-0) fields;
/// every other bit of the isoch header is left to the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsochHeaderValueMask {
    pub value: u32,
    pub mask: u32,
}

/// Build the value/mask pair for a given tag (0-3) and sy (0-15) field.
pub fn make_isoch_header(tag: u8, sy: u8) -> IsochHeaderValueMask {
    IsochHeaderValueMask {
        value: ((tag as u32 & 0x3) << 14) | (sy as u32 & 0xF),
        mask: 0x0000_C00F,
    }
}

/// One contiguous range of bytes a DMA descriptor reads from, identified by
/// a raw pointer/length pair into the buffer manager's DMA-visible region.
///
/// # Safety
/// The pointed-to memory must outlive every descriptor referencing it; this
/// is guaranteed by the buffer manager never moving or freeing its region
/// before the DCL program and port have been torn down.
#[derive(Debug, Clone, Copy)]
pub struct DmaRange {
    pub ptr: *const u8,
    pub len: usize,
}

// SAFETY: DmaRange only ever points into the single long-lived DMA buffer
// owned by the buffer manager, which the transmitter keeps alive for as
// long as any DmaRange referencing it is in use.
unsafe impl Send for DmaRange {}

/// Notification type passed to [`NubPort::notify_segment_update`]: batches a
/// contiguous run of descriptors in one group into a single kernel round-trip.
#[derive(Debug, Clone, Copy)]
pub struct SegmentHandle {
    pub group_index: u32,
    pub descriptor_count: u32,
}

/// An event the port/transport layer delivers to whichever client registered
/// itself via [`NubPort::set_event_sink`], replacing the opaque-refcon
/// callback pattern a DCL manager would otherwise use with a typed enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortEvent {
    /// The DCL program completed the callback-bearing packet of
    /// `group_index`. `timestamp_encoded` is the hardware cycle-time value
    /// latched at completion (see `fwa_core::timing`).
    GroupComplete {
        group_index: u32,
        timestamp_encoded: u32,
    },
    /// The DCL program ran off the end of the ring before the client caught
    /// up; transmission has effectively stalled until the client stops and
    /// restarts it.
    Overrun,
}

/// A client-registered sink for [`PortEvent`]s, invoked on whatever thread
/// the port implementation's hardware callback runs on. Implementations must
/// not block.
pub trait PortEventSink: Send {
    fn on_event(&mut self, event: PortEvent);
}

/// The hardware boundary for the port/channel manager and transport
/// manager. One handle represents an opened isochronous port bound to
/// a DCL program; `start`/`stop` gate packet flow.
pub trait NubPort: Send {
    /// Open the local isochronous port and bind the given program handle.
    fn open(&mut self, initial_speed: BusSpeed, initial_channel: u32) -> Result<()>;

    /// The local node ID assigned to this host on the bus.
    fn local_node_id(&self) -> Result<u16>;

    /// The isochronous channel this port is bound to (after `open`).
    fn isoch_channel(&self) -> Result<u32>;

    /// Register the sink that receives [`PortEvent`]s for this port. Only
    /// one sink is held at a time; a later call replaces the previous one.
    fn set_event_sink(&mut self, sink: Box<dyn PortEventSink>);

    /// Start isochronous transmission on the bound channel.
    fn start(&mut self) -> Result<()>;

    /// Stop isochronous transmission. Idempotent if already stopped.
    fn stop(&mut self) -> Result<()>;

    /// Batch-notify the hardware that descriptors in `group_index` changed.
    /// Implementations must cap any single underlying notify call at
    /// `kMaxDCLsPerModifyNotify` descriptors, splitting into multiple calls
    /// for larger groups rather than one unbounded notify.
    fn notify_segment_update(&mut self, segment: SegmentHandle) -> Result<()>;

    /// Notify the hardware of the circular jump target after program creation.
    fn notify_jump_fixup(&mut self) -> Result<()>;

    /// Release the port and any bound channel. Called during teardown.
    fn close(&mut self) -> Result<()>;
}

/// Maximum descriptors batched into a single hardware notify call.
pub const MAX_DCLS_PER_MODIFY_NOTIFY: u32 = 30;
