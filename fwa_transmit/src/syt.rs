//! SYT/NO-DATA decision generators: per-packet choice between "this
//! packet carries a valid SYT timestamp and new audio data" and "this packet
//! is a filler NO-DATA packet", selectable per [`crate::config::SytStyle`].
//!
//! Two independent algorithms are implemented:
//! - [`PhaseSytGenerator`]: the deterministic phase-counter rule for
//!   44.1 kHz, and a fixed-interval NO-DATA rule for 48 kHz (and its
//!   multiples).
//! - [`AppleDdaSytGenerator`]: an ideal-data-time/DDA generator seeded and
//!   re-aligned from hardware cycle time.

use fwa_core::timing;

/// One packet's SYT decision: either a NO-DATA filler, or a DATA packet
/// carrying the given 16-bit SYT field value (already masked to 0-3071 plus
/// the low cycle-offset range the CIP header's `syt` field holds).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SytDecision {
    pub is_no_data: bool,
    pub syt_value: u16,
}

impl SytDecision {
    pub const NO_DATA: SytDecision = SytDecision {
        is_no_data: true,
        syt_value: 0xFFFF,
    };
}

/// One 8000 Hz cycle's worth of offset ticks.
const TICKS_PER_CYCLE: u32 = 3072;
/// 44.1 kHz base per-packet SYT advance (`1386 + occasional extra tick`
/// averages to exactly 44100/8000 ticks per packet).
const BASE_TICKS_441: u32 = 1386;
/// Phase counter period: one full jitter cycle is 147 packets. Within each
/// cycle the extra tick lands on every 4th step of a mod-13 sub-phase
/// (skipping zero), plus once more at the last step of the outer period.
const SYT_PHASE_MOD: u32 = 147;

/// The 44.1 kHz phase rule and 48 kHz (and multiples) fixed-interval rule,
/// selected by the sample rate passed to [`PhaseSytGenerator::new`].
///
/// For 48 kHz (and its integer multiples): every 8th packet is NO-DATA, the
/// rest carry data at a fixed tick stride.
#[derive(Debug, Clone)]
pub struct PhaseSytGenerator {
    sample_rate: u32,
    // 44.1 kHz family state.
    syt_offset: u32,
    syt_phase: u32,
    // 48 kHz family state.
    packet_counter: u32,
}

impl PhaseSytGenerator {
    /// Starts primed at exactly one full cycle of ticks, so the first call
    /// to `next` immediately rolls over rather than emitting a spurious
    /// DATA packet before real timing is established.
    pub fn new(sample_rate: u32) -> Self {
        PhaseSytGenerator {
            sample_rate,
            syt_offset: TICKS_PER_CYCLE,
            syt_phase: 0,
            packet_counter: 0,
        }
    }

    fn is_44k1_family(&self) -> bool {
        matches!(self.sample_rate, 44_100 | 88_200 | 176_400)
    }

    /// Compute the next packet's decision. While `timing_established` is
    /// false, every packet is forced NO-DATA regardless of sample rate.
    pub fn next(&mut self, timing_established: bool) -> SytDecision {
        if !timing_established {
            return SytDecision::NO_DATA;
        }
        if self.is_44k1_family() {
            self.next_44k1()
        } else {
            self.next_48k_family()
        }
    }

    fn next_44k1(&mut self) -> SytDecision {
        // The decision reads the offset as it stands from the previous call;
        // the update that follows is a separate step at a later instant.
        let is_no_data = self.syt_offset >= TICKS_PER_CYCLE;
        if is_no_data {
            self.syt_offset -= TICKS_PER_CYCLE;
        } else {
            let idx = self.syt_phase % 13;
            let add_extra = (idx != 0 && idx % 4 == 0) || self.syt_phase == SYT_PHASE_MOD - 1;
            let mut inc = BASE_TICKS_441;
            if add_extra {
                inc += 1;
            }
            self.syt_offset += inc;
        }
        self.syt_phase = (self.syt_phase + 1) % SYT_PHASE_MOD;

        if is_no_data {
            SytDecision::NO_DATA
        } else {
            // Emitted from the offset after the add above, not before.
            SytDecision {
                is_no_data: false,
                syt_value: self.syt_offset as u16,
            }
        }
    }

    fn next_48k_family(&mut self) -> SytDecision {
        const SYT_INTERVAL: u32 = 8;
        let is_no_data = (self.packet_counter & (SYT_INTERVAL - 1)) == SYT_INTERVAL - 1;
        self.packet_counter = self.packet_counter.wrapping_add(1);
        SytDecision {
            is_no_data,
            // The 48 kHz family never advances a SYT offset; every DATA
            // packet's field is the untouched zero value.
            syt_value: if is_no_data { 0xFFFF } else { 0 },
        }
    }
}

/// Per-packet advance for the decision timer: half a cycle (1536 offsets).
const APPLE_CURRENT_TIME_ADVANCE_TICKS: f64 = (timing::OFFSETS_PER_CYCLE / 2) as f64;
/// 128-second wrap value for the scaled decision-timer comparison.
const APPLE_WRAP_VALUE_SCALED: u64 = 491_520_000;
/// Comparison threshold (2048 offsets) for deciding NO-DATA vs DATA.
const APPLE_COMPARISON_THRESHOLD_UNSCALED: u64 = 2048;
const APPLE_SCALE_FACTOR: u64 = 10_000;
const APPLE_COMPARISON_THRESHOLD_SCALED: u64 =
    APPLE_COMPARISON_THRESHOLD_UNSCALED * APPLE_SCALE_FACTOR;
/// SYT field base offset applied to the ideal data time before masking.
const APPLE_BASE_OFFSET_TICKS: f64 = 2506.0;

/// The Apple-style ideal-data-time generator: a free-running "current time"
/// reference advanced a half-cycle per packet decision, compared against an
/// "ideal data time" advanced by a DDA (digital differential analyzer,
/// i.e. Bresenham) accumulator tracking the exact sample rate.
///
/// `seed`/`update_time_reference` must be called with real hardware
/// cycle-time values before `next` produces anything but NO-DATA.
#[derive(Debug, Clone)]
pub struct AppleDdaSytGenerator {
    sample_rate: f64,
    syt_interval: u32,
    current_time_ref_ticks: f64,
    ideal_data_time_ticks: f64,
    dda_accumulator: i64,
    dda_ticks_whole: u64,
    dda_ticks_numerator_rem: u64,
    dda_denominator: u32,
    last_raw_cycle_time: u32,
    cycle_time_epoch_offset: u64,
    seeded: bool,
}

impl AppleDdaSytGenerator {
    pub fn new(sample_rate: u32) -> Self {
        let syt_interval = match sample_rate {
            44_100 | 88_200 => 8,
            48_000 | 96_000 => 16,
            _ => 8,
        };

        let mut gen = AppleDdaSytGenerator {
            sample_rate: sample_rate as f64,
            syt_interval,
            current_time_ref_ticks: 0.0,
            ideal_data_time_ticks: 0.0,
            dda_accumulator: 0,
            dda_ticks_whole: 0,
            dda_ticks_numerator_rem: 0,
            dda_denominator: 1,
            last_raw_cycle_time: 0,
            cycle_time_epoch_offset: 0,
            seeded: false,
        };

        let total_ticks_dividend = timing::OFFSETS_PER_SECOND as u64 * syt_interval as u64;
        gen.dda_denominator = sample_rate;
        gen.dda_ticks_whole = total_ticks_dividend / gen.dda_denominator as u64;
        gen.dda_ticks_numerator_rem = total_ticks_dividend % gen.dda_denominator as u64;
        gen.dda_accumulator = (gen.dda_ticks_numerator_rem / 2) as i64;
        gen
    }

    fn convert_raw_hw_time_to_total_unscaled_offsets(&mut self, raw_cycle_time: u32) -> u64 {
        if self.last_raw_cycle_time != 0 {
            let last_secs = (self.last_raw_cycle_time >> 25) & 0x7F;
            let current_secs = (raw_cycle_time >> 25) & 0x7F;
            if last_secs > 120 && current_secs < 10 {
                self.cycle_time_epoch_offset +=
                    128 * timing::OFFSETS_PER_CYCLE as u64;
            }
        }
        self.last_raw_cycle_time = raw_cycle_time;

        let sec = (raw_cycle_time >> 25) & 0x7F;
        let cyc = (raw_cycle_time >> 12) & 0x1FFF;
        let offs = raw_cycle_time & 0x0FFF;

        self.cycle_time_epoch_offset
            + sec as u64 * timing::OFFSETS_PER_SECOND as u64
            + cyc as u64 * timing::OFFSETS_PER_CYCLE as u64
            + offs as u64
    }

    /// Seed (or, if already seeded, re-align) the decision timer from a raw
    /// 32-bit hardware cycle-time value. Call once at stream start and then
    /// periodically (e.g. at each DCL group completion).
    pub fn update_time_reference(&mut self, raw_hardware_cycle_time: u32) {
        if raw_hardware_cycle_time == 0 {
            return;
        }
        let offsets = self.convert_raw_hw_time_to_total_unscaled_offsets(raw_hardware_cycle_time);
        if !self.seeded {
            self.current_time_ref_ticks = offsets as f64;
            self.ideal_data_time_ticks = offsets as f64;
            self.dda_accumulator = (self.dda_ticks_numerator_rem / 2) as i64;
            self.seeded = true;
        } else {
            self.current_time_ref_ticks = offsets as f64;
        }
    }

    /// Compute the next packet's decision, advancing both the decision timer
    /// and (on DATA packets) the ideal-data-time DDA accumulator. Returns
    /// NO-DATA unconditionally until [`Self::update_time_reference`] has
    /// been called at least once.
    pub fn next(&mut self) -> SytDecision {
        if !self.seeded {
            return SytDecision::NO_DATA;
        }

        self.current_time_ref_ticks += APPLE_CURRENT_TIME_ADVANCE_TICKS;
        let sct_scaled = (self.current_time_ref_ticks * APPLE_SCALE_FACTOR as f64).round() as u64;
        let idt_scaled = (self.ideal_data_time_ticks * APPLE_SCALE_FACTOR as f64).round() as u64;

        let send_no_data = if sct_scaled <= idt_scaled {
            true
        } else {
            (idt_scaled + APPLE_WRAP_VALUE_SCALED - sct_scaled) <= APPLE_COMPARISON_THRESHOLD_SCALED
        };

        let decision = if send_no_data {
            SytDecision::NO_DATA
        } else {
            let syt_calc_base = APPLE_BASE_OFFSET_TICKS + self.ideal_data_time_ticks;
            let syt_field = syt_calc_base.rem_euclid(timing::OFFSETS_PER_CYCLE as f64) as u16;

            let mut dda_ticks_to_add = self.dda_ticks_whole;
            self.dda_accumulator += self.dda_ticks_numerator_rem as i64;
            if self.dda_accumulator >= self.dda_denominator as i64 {
                dda_ticks_to_add += 1;
                self.dda_accumulator -= self.dda_denominator as i64;
            }
            self.ideal_data_time_ticks += dda_ticks_to_add as f64;

            SytDecision {
                is_no_data: false,
                syt_value: syt_field,
            }
        };

        if (self.current_time_ref_ticks * APPLE_SCALE_FACTOR as f64).round() as u64
            >= APPLE_WRAP_VALUE_SCALED
        {
            self.current_time_ref_ticks -= APPLE_WRAP_VALUE_SCALED as f64 / APPLE_SCALE_FACTOR as f64;
        }

        decision
    }

    pub fn syt_interval(&self) -> u32 {
        self.syt_interval
    }
}
