//! FireWire bus cycle time ↔ host nanosecond conversions.
//!
//! FireWire exposes a 32-bit cycle time register:
//!   bits 25–31: seconds, 0–127, wraps every 128 s
//!   bits 12–24: cycles within the second, 0–7999 (125 µs per cycle)
//!   bits  0–11: offsets within the cycle, 0–3071 (~40.69 ns per offset)
//!
//! All arithmetic here stays within `u64`/`i64` by splitting each conversion
//! into an integer-seconds part and a sub-second remainder instead of going
//! through a single wide multiply, so the crate has no platform-conditional
//! 128-bit math.

use std::sync::OnceLock;

/// Bus rate: 8000 cycles per second (125 µs per cycle).
pub const CYCLES_PER_SECOND: u32 = 8_000;
/// Offsets per cycle (~40.69 ns per offset).
pub const OFFSETS_PER_CYCLE: u32 = 3_072;
/// Total offsets per second.
pub const OFFSETS_PER_SECOND: u64 = CYCLES_PER_SECOND as u64 * OFFSETS_PER_CYCLE as u64;

const NANOS_PER_SECOND: u64 = 1_000_000_000;
const NANOS_PER_CYCLE: u64 = NANOS_PER_SECOND / CYCLES_PER_SECOND as u64;

/// Wraparound period of the 32-bit cycle-time register: 128 seconds.
pub const WRAP_SECONDS: u32 = 128;
const WRAP_NANOS: u64 = WRAP_SECONDS as u64 * NANOS_PER_SECOND;

const SECONDS_MASK: u32 = 0xFE00_0000;
const SECONDS_SHIFT: u32 = 25;
const CYCLES_MASK: u32 = 0x01FF_F000;
const CYCLES_SHIFT: u32 = 12;
const OFFSETS_MASK: u32 = 0x0000_0FFF;

/// Nanoseconds-per-cycle constant, exposed for callers computing group periods.
pub const fn nanos_per_cycle() -> u64 {
    NANOS_PER_CYCLE
}

/// Decode a 32-bit FireWire cycle-time register into total nanoseconds
/// since the last 128-second wrap epoch.
pub fn encoded_to_nanos(enc: u32) -> u64 {
    let sec = (enc & SECONDS_MASK) >> SECONDS_SHIFT;
    let cyc = (enc & CYCLES_MASK) >> CYCLES_SHIFT;
    let offs = enc & OFFSETS_MASK;

    let total_offsets =
        sec as u64 * OFFSETS_PER_SECOND + cyc as u64 * OFFSETS_PER_CYCLE as u64 + offs as u64;

    let full_secs = (total_offsets / OFFSETS_PER_SECOND) * NANOS_PER_SECOND;
    let rem_offsets = total_offsets % OFFSETS_PER_SECOND;
    let frac_nanos = (rem_offsets * NANOS_PER_SECOND) / OFFSETS_PER_SECOND;
    full_secs + frac_nanos
}

/// Encode a nanosecond timestamp into the 32-bit FireWire cycle-time format,
/// wrapping modulo 128 seconds.
pub fn nanos_to_encoded(nanos: u64) -> u32 {
    let wrapped = nanos % WRAP_NANOS;

    let full_offsets = (wrapped / NANOS_PER_SECOND) * OFFSETS_PER_SECOND;
    let rem_nanos = wrapped % NANOS_PER_SECOND;
    let part_offsets = (rem_nanos * OFFSETS_PER_SECOND) / NANOS_PER_SECOND;
    let total_offsets = full_offsets + part_offsets;

    let sec = ((total_offsets / OFFSETS_PER_SECOND) as u32) & 0x7F;
    let rem = (total_offsets % OFFSETS_PER_SECOND) as u32;
    let cyc = rem / OFFSETS_PER_CYCLE;
    let offs = rem % OFFSETS_PER_CYCLE;

    (sec << SECONDS_SHIFT) | (cyc << CYCLES_SHIFT) | offs
}

/// Signed nanosecond delta `a - b` between two encoded cycle times, choosing
/// the minimal-magnitude path across the 128-second wrap.
pub fn delta_nanos(a: u32, b: u32) -> i64 {
    let na = encoded_to_nanos(a) as i64;
    let nb = encoded_to_nanos(b) as i64;
    let mut d = na - nb;

    let half_wrap = (WRAP_NANOS / 2) as i64;
    if d > half_wrap {
        d -= WRAP_NANOS as i64;
    } else if d < -half_wrap {
        d += WRAP_NANOS as i64;
    }
    d
}

/// Ratio between host monotonic-clock ticks and nanoseconds, fetched once.
///
/// On Linux, `CLOCK_MONOTONIC` already counts in nanoseconds, so the ratio is
/// `1/1`; the struct still exists so the conversion path is exercised the
/// same way it would be on a host with a genuinely non-unity timebase.
#[derive(Debug, Clone, Copy)]
pub struct TimebaseRatio {
    numer: u64,
    denom: u64,
}

impl TimebaseRatio {
    fn query() -> Self {
        Self { numer: 1, denom: 1 }
    }

    /// Convert host ticks to nanoseconds using this ratio.
    pub fn ticks_to_nanos(&self, ticks: u64) -> u64 {
        let hi = (ticks >> 32) * self.numer;
        let lo = (ticks & 0xFFFF_FFFF) * self.numer;
        ((hi << 32) + lo) / self.denom
    }

    /// Convert nanoseconds to host ticks using this ratio.
    pub fn nanos_to_ticks(&self, nanos: u64) -> u64 {
        let hi = (nanos >> 32) * self.denom;
        let lo = (nanos & 0xFFFF_FFFF) * self.denom;
        ((hi << 32) + lo) / self.numer
    }
}

static HOST_TIMEBASE: OnceLock<TimebaseRatio> = OnceLock::new();

/// Fetch the process-wide host timebase ratio, initializing it on first use.
pub fn host_timebase() -> TimebaseRatio {
    *HOST_TIMEBASE.get_or_init(TimebaseRatio::query)
}

/// Convert host monotonic-clock ticks to nanoseconds.
pub fn host_ticks_to_nanos(ticks: u64) -> u64 {
    host_timebase().ticks_to_nanos(ticks)
}

/// Convert nanoseconds to host monotonic-clock ticks.
pub fn nanos_to_host_ticks(nanos: u64) -> u64 {
    host_timebase().nanos_to_ticks(nanos)
}
