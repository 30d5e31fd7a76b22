//! A synthetic input source used when no real capture device is available
//! (the common case on a CI host or a machine with no audio hardware
//! attached). Mirrors the shape of a `cpal` input callback's buffer so the
//! rest of the demo doesn't need to know which source fed it.

use rand::Rng;

/// Low-amplitude dithered noise, interleaved per channel, as 24-in-32
/// little-endian MSB-aligned samples ready for
/// [`fwa_transmit::Transmitter::push_audio_data`].
pub struct ToneGenerator {
    channels: u32,
    amplitude: i32,
}

impl ToneGenerator {
    pub fn new(channels: u32) -> Self {
        ToneGenerator {
            channels,
            // Quiet enough not to be mistaken for a real signal, loud enough
            // that a DBC/SYT bug manifesting as dropped frames is audible.
            amplitude: 1 << 18,
        }
    }

    /// Fill `frames` worth of interleaved samples into `out` (already sized
    /// to `frames * channels * 4` bytes).
    pub fn fill(&self, out: &mut [u8], frames: usize) {
        let mut rng = rand::thread_rng();
        for frame in out.chunks_exact_mut(self.channels as usize * 4).take(frames) {
            for sample in frame.chunks_exact_mut(4) {
                let value: i32 = rng.gen_range(-self.amplitude..=self.amplitude);
                sample.copy_from_slice(&value.to_le_bytes());
            }
        }
    }
}
