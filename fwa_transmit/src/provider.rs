//! The packet provider: pulls chunks from the shared-memory ring, converts
//! 24-in-32 little-endian samples to big-endian AM824, and fills per-packet
//! payload buffers for the hardware callback to hand to the DMA engine.
//!
//! The current-chunk cursor is kept as a plain owned field rather than
//! thread-local storage, since exactly one callback thread ever calls
//! `fill_packet` on a given provider instance — `PacketProvider<R>: !Sync`
//! falls out naturally from holding `Cell`-free but exclusively-`&mut`-
//! accessed owned state.

use std::time::{Duration, Instant};

use fwa_core::am824::{encode_buffer_in_place, AUDIO_LABEL};
use tracing::{trace, warn};

use crate::shm::{self, ChunkSnapshot, RingHandle};

/// Number of histogram buckets for the observed fill-level diagnostic
/// (0-10%, 10-20%, ..., 90-100%).
const FILL_HISTOGRAM_BUCKETS: usize = 10;

/// Outcome of one [`PacketProvider::fill_packet`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillResult {
    /// Bytes actually written into the caller's buffer (always
    /// `target_size` on success; payload beyond available data is silence).
    pub data_length: usize,
    /// Whether the provider had any payload available at all for this call.
    pub data_available: bool,
    /// True if some or all of the written bytes are generated silence
    /// (either a full underrun or a partial short read).
    pub generated_silence: bool,
}

/// Running diagnostics the provider accumulates across its lifetime.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProviderStats {
    pub bytes_consumed: u64,
    pub pop_count: u64,
    pub underrun_count: u64,
    pub partial_underrun_count: u64,
    pub format_validation_errors: u64,
    total_fill_duration: Duration,
    fill_calls: u64,
    fill_histogram: [u64; FILL_HISTOGRAM_BUCKETS],
}

impl ProviderStats {
    /// Mean wall-clock duration of `fill_packet` calls so far.
    pub fn average_fill_duration(&self) -> Duration {
        if self.fill_calls == 0 {
            Duration::ZERO
        } else {
            self.total_fill_duration / self.fill_calls as u32
        }
    }

    /// Histogram of observed fill levels, bucketed into deciles of
    /// `target_size` actually satisfied from live data (not silence).
    pub fn fill_histogram(&self) -> &[u64; FILL_HISTOGRAM_BUCKETS] {
        &self.fill_histogram
    }

    fn record_fill(&mut self, duration: Duration, fraction_live: f32) {
        self.fill_calls += 1;
        self.total_fill_duration += duration;
        let bucket = ((fraction_live.clamp(0.0, 1.0) * FILL_HISTOGRAM_BUCKETS as f32) as usize)
            .min(FILL_HISTOGRAM_BUCKETS - 1);
        self.fill_histogram[bucket] += 1;
    }
}

/// Pulls audio from a shared-memory ring and formats it to AM824 for the
/// hardware callback. Parameterized over its ring implementation
/// so `fill_packet`, called once per packet, monomorphizes rather than going
/// through a trait object.
pub struct PacketProvider<R: RingHandle> {
    ring: R,
    /// The chunk currently being drained, and how far into it we are.
    current: Option<ChunkSnapshot>,
    cursor: usize,
    /// Optional proactive-silence threshold,
    /// disabled by default (`0`): the baseline path never holds data back.
    safety_hedge_chunks: u32,
    stats: ProviderStats,
}

impl<R: RingHandle> PacketProvider<R> {
    /// Bind a packet provider to an already-constructed ring handle.
    pub fn bind(ring: R) -> Self {
        PacketProvider {
            ring,
            current: None,
            cursor: 0,
            safety_hedge_chunks: 0,
            stats: ProviderStats::default(),
        }
    }

    /// Opt into the (disabled-by-default) safety-margin behavior: once fewer
    /// than `chunks` are queued, proactively emit silence instead of
    /// draining the ring further.
    pub fn set_safety_hedge_chunks(&mut self, chunks: u32) {
        self.safety_hedge_chunks = chunks;
    }

    pub fn stats(&self) -> &ProviderStats {
        &self.stats
    }

    /// Push one chunk onto the bound ring (the legacy non-SHM producer path
    /// used by `push_audio_data`). Safe to call concurrently with
    /// `fill_packet`: the ring is SPSC by construction.
    pub fn push_data(&self, host_timestamp_nanos: u64, data: &[u8]) {
        shm::push(&self.ring, host_timestamp_nanos, data);
    }

    /// Fill `target` (already sized to one packet's audio payload) with
    /// AM824-encoded audio, pulling from the bound ring as needed.
    ///
    /// `target.len()` must be a multiple of 4 (one AM824 word per sample).
    pub fn fill_packet(&mut self, target: &mut [u8]) -> FillResult {
        let start = Instant::now();
        debug_assert!(target.len() % 4 == 0, "payload length must be a whole number of AM824 words");

        let target_size = target.len();
        let mut written = 0usize;
        let mut any_live = false;

        while written < target_size {
            if self.current.as_ref().map(|c| self.cursor >= c.data.len()).unwrap_or(true) {
                if !self.refill_current() {
                    break; // ring is empty; remainder stays silent
                }
            }
            let chunk = self.current.as_ref().expect("just refilled or already present");
            let available = &chunk.data[self.cursor..];
            let take = available.len().min(target_size - written);
            target[written..written + take].copy_from_slice(&available[..take]);
            self.cursor += take;
            written += take;
            any_live = true;
        }

        let generated_silence = written < target_size;
        if generated_silence {
            for byte in &mut target[written..] {
                *byte = 0;
            }
            if written > 0 {
                self.stats.partial_underrun_count += 1;
            }
        }

        encode_buffer_in_place(target);

        self.stats.bytes_consumed += target_size as u64;
        let fraction_live = if target_size == 0 {
            1.0
        } else {
            written as f32 / target_size as f32
        };
        self.stats.record_fill(start.elapsed(), fraction_live);

        trace!(target_size, written, generated_silence, "fill_packet");

        FillResult {
            data_length: target_size,
            data_available: any_live,
            generated_silence,
        }
    }

    /// Try to pull a fresh chunk from the ring. Returns `false` on underrun.
    fn refill_current(&mut self) -> bool {
        if self.safety_hedge_chunks > 0 && self.queued_chunks_hint() < self.safety_hedge_chunks {
            return false;
        }
        match shm::pop(&self.ring) {
            Some(chunk) => {
                self.stats.pop_count += 1;
                self.current = Some(chunk);
                self.cursor = 0;
                true
            }
            None => {
                self.stats.underrun_count += 1;
                warn!("packet provider underrun: shared-memory ring empty");
                self.current = None;
                false
            }
        }
    }

    /// Best-effort estimate of chunks queued but not yet popped, used only
    /// by the (disabled-by-default) safety-hedge path.
    fn queued_chunks_hint(&self) -> u32 {
        use std::sync::atomic::Ordering;
        let ctrl = self.ring.control();
        let write = ctrl.write_index.load(Ordering::Relaxed);
        let read = ctrl.read_index.load(Ordering::Relaxed);
        write.saturating_sub(read) as u32
    }
}
