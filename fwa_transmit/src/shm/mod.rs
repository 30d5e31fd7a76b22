//! The shared-memory audio ring: a single-producer/single-consumer ring
//! of fixed-capacity audio chunks written by the host driver and drained by
//! the packet provider.
//!
//! Two backings share one POD layout and one index protocol:
//! [`LocalAudioRing`], an in-process ring used by tests and the `demos`
//! crate, and [`PosixAudioRing`], a raw `libc`-backed mapping of a real
//! POSIX shared-memory object for the cross-process case. The packet
//! provider is generic over anything implementing [`RingHandle`], so the
//! same `pop()` code path is exercised by both.

mod posix;

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

pub use posix::PosixAudioRing;

/// ABI version this crate's ring layout implements. Bumped on any layout change.
pub const SHM_ABI_VERSION: u32 = 1;

/// Ring capacity, in chunks. Must be a power of two.
pub const RING_CAPACITY_POW2: u32 = 64;

/// Maximum payload bytes held in one [`AudioChunk`]. Sized generously above
/// one packet's worth of audio at any supported rate/channel count.
pub const CHUNK_PAYLOAD_BYTES: usize = 16 * 1024;

/// Default POSIX shared-memory object name.
pub const DEFAULT_SHM_NAME: &str = "/fwa_daemon_shm_v1";

/// Fixed-order control-block fields shared by the host driver and this
/// crate. Cache-line aligned so atomics never straddle lines.
#[repr(C, align(64))]
pub struct ControlBlock {
    pub abi_version: AtomicU32,
    pub capacity: AtomicU32,
    pub write_index: AtomicU64,
    pub read_index: AtomicU64,
    pub stream_active: AtomicU32,
    pub sample_rate_hz: AtomicU32,
    pub channel_count: AtomicU32,
    pub bytes_per_frame: AtomicU32,
    pub underrun_count: AtomicU32,
    pub overrun_count: AtomicU32,
}

impl ControlBlock {
    fn zeroed(capacity: u32, sample_rate_hz: u32, channel_count: u32, bytes_per_frame: u32) -> Self {
        ControlBlock {
            abi_version: AtomicU32::new(SHM_ABI_VERSION),
            capacity: AtomicU32::new(capacity),
            write_index: AtomicU64::new(0),
            read_index: AtomicU64::new(0),
            stream_active: AtomicU32::new(0),
            sample_rate_hz: AtomicU32::new(sample_rate_hz),
            channel_count: AtomicU32::new(channel_count),
            bytes_per_frame: AtomicU32::new(bytes_per_frame),
            underrun_count: AtomicU32::new(0),
            overrun_count: AtomicU32::new(0),
        }
    }

    /// Validate `abi_version` and `capacity` against what this build expects,
    /// refusing to bind otherwise.
    pub fn validate_format(&self, expected_sample_rate: u32, expected_channels: u32) -> bool {
        self.abi_version.load(Ordering::Relaxed) == SHM_ABI_VERSION
            && self.capacity.load(Ordering::Relaxed) == RING_CAPACITY_POW2
            && self.sample_rate_hz.load(Ordering::Relaxed) == expected_sample_rate
            && self.channel_count.load(Ordering::Relaxed) == expected_channels
    }
}

/// One chunk of host-provided PCM audio: interleaved 24-in-32 little-endian
/// MSB-aligned samples, a host timestamp, and a valid byte count.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct AudioChunk {
    pub host_timestamp_nanos: u64,
    pub byte_count: u32,
    _reserved: u32,
    pub payload: [u8; CHUNK_PAYLOAD_BYTES],
}

impl AudioChunk {
    pub fn zeroed() -> Self {
        AudioChunk {
            host_timestamp_nanos: 0,
            byte_count: 0,
            _reserved: 0,
            payload: [0u8; CHUNK_PAYLOAD_BYTES],
        }
    }

    pub fn valid_bytes(&self) -> &[u8] {
        &self.payload[..(self.byte_count as usize).min(CHUNK_PAYLOAD_BYTES)]
    }
}

/// A read-only snapshot of a popped chunk: owns a copy of the valid payload
/// so the caller can keep draining it across several `fill_packet` calls
/// without holding a reference into ring memory the writer may recycle.
#[derive(Clone)]
pub struct ChunkSnapshot {
    pub host_timestamp_nanos: u64,
    pub data: Vec<u8>,
}

/// Abstraction over "a control block plus an array of chunks" shared by
/// [`LocalAudioRing`] and [`PosixAudioRing`]. `push`/`pop` are implemented
/// once, generically, against anything shaped like a control block + chunk
/// array.
pub trait RingHandle {
    fn control(&self) -> &ControlBlock;
    /// Raw pointer to the first element of the `capacity()`-length chunk array.
    fn chunks_ptr(&self) -> *mut AudioChunk;
    fn capacity(&self) -> u32;

    fn mask(&self) -> u64 {
        (self.capacity() as u64) - 1
    }

    /// # Safety
    /// Caller must not hold this reference across a concurrent writer/reader
    /// mutation of the same slot; the ring's index protocol guarantees that
    /// in the intended single-writer/single-reader usage.
    unsafe fn chunk_cell(&self, index: u64) -> &UnsafeCell<AudioChunk> {
        let slot = (index & self.mask()) as usize;
        unsafe { &*(self.chunks_ptr().add(slot) as *const UnsafeCell<AudioChunk>) }
    }
}

/// Lets a single ring be shared between a producer (`push_audio_data`) and a
/// consumer ([`crate::provider::PacketProvider`]) without duplicating the
/// mapping: both sides hold a clone of the same `Arc`.
impl<R: RingHandle> RingHandle for std::sync::Arc<R> {
    fn control(&self) -> &ControlBlock {
        (**self).control()
    }

    fn chunks_ptr(&self) -> *mut AudioChunk {
        (**self).chunks_ptr()
    }

    fn capacity(&self) -> u32 {
        (**self).capacity()
    }
}

/// Writer side (host driver / test harness): push one chunk, dropping the
/// oldest unread chunk if the ring is full.
pub fn push<H: RingHandle>(ring: &H, host_timestamp_nanos: u64, data: &[u8]) {
    let ctrl = ring.control();
    let write_index = ctrl.write_index.load(Ordering::Relaxed);
    let read_index = ctrl.read_index.load(Ordering::Acquire);

    if write_index.wrapping_sub(read_index) >= ring.capacity() as u64 {
        // Full: drop the oldest chunk by advancing the reader's index.
        ctrl.read_index
            .store(read_index.wrapping_add(1), Ordering::Release);
        ctrl.overrun_count.fetch_add(1, Ordering::Relaxed);
    }

    // SAFETY: single writer; the slot at `write_index` is not concurrently
    // read because the reader index trails write_index by at most capacity.
    let cell = unsafe { ring.chunk_cell(write_index) };
    let chunk = unsafe { &mut *cell.get() };
    chunk.host_timestamp_nanos = host_timestamp_nanos;
    let n = data.len().min(CHUNK_PAYLOAD_BYTES);
    chunk.payload[..n].copy_from_slice(&data[..n]);
    chunk.byte_count = n as u32;

    ctrl.write_index
        .store(write_index.wrapping_add(1), Ordering::Release);
}

/// Reader side (packet provider): pop one chunk, or `None` on underrun
/// (and bump `underrun_count` for diagnostics).
pub fn pop<H: RingHandle>(ring: &H) -> Option<ChunkSnapshot> {
    let ctrl = ring.control();
    let write_index = ctrl.write_index.load(Ordering::Acquire);
    let read_index = ctrl.read_index.load(Ordering::Relaxed);

    if read_index == write_index {
        ctrl.underrun_count.fetch_add(1, Ordering::Relaxed);
        return None;
    }

    // SAFETY: single reader; the writer never touches slots the reader
    // hasn't yet released (read_index <= write_index always).
    let cell = unsafe { ring.chunk_cell(read_index) };
    let chunk = unsafe { &*cell.get() };
    let snapshot = ChunkSnapshot {
        host_timestamp_nanos: chunk.host_timestamp_nanos,
        data: chunk.valid_bytes().to_vec(),
    };

    ctrl.read_index
        .store(read_index.wrapping_add(1), Ordering::Release);
    Some(snapshot)
}

/// In-process ring backing integration tests and the `demos` crate, with no
/// second process involved. Shares the exact POD layout and index protocol
/// with [`PosixAudioRing`].
pub struct LocalAudioRing {
    control: ControlBlock,
    chunks: Box<[UnsafeCell<AudioChunk>]>,
}

// SAFETY: access is synchronized entirely through the atomics in
// `ControlBlock` per the SPSC protocol documented on `push`/`pop`.
unsafe impl Send for LocalAudioRing {}
unsafe impl Sync for LocalAudioRing {}

impl LocalAudioRing {
    pub fn new(sample_rate_hz: u32, channel_count: u32, bytes_per_frame: u32) -> Self {
        let chunks = (0..RING_CAPACITY_POW2)
            .map(|_| UnsafeCell::new(AudioChunk::zeroed()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        LocalAudioRing {
            control: ControlBlock::zeroed(
                RING_CAPACITY_POW2,
                sample_rate_hz,
                channel_count,
                bytes_per_frame,
            ),
            chunks,
        }
    }

    pub fn set_stream_active(&self, active: bool) {
        self.control
            .stream_active
            .store(active as u32, Ordering::Release);
    }
}

impl RingHandle for LocalAudioRing {
    fn control(&self) -> &ControlBlock {
        &self.control
    }

    fn chunks_ptr(&self) -> *mut AudioChunk {
        self.chunks.as_ptr() as *mut AudioChunk
    }

    fn capacity(&self) -> u32 {
        RING_CAPACITY_POW2
    }
}
