//! Data Block Counter continuity: the exact
//! increment rule a CIP header's `dbc` field must follow across a run of
//! DATA/NO-DATA packets, plus a post-hoc checker for validating a captured
//! sequence.
//!
//! A NO-DATA packet *advances* `dbc` by `blocks_per_packet` from the last
//! DATA packet's value (it is carrying the timing for the data that would
//! have gone out), and the first DATA packet immediately following a
//! NO-DATA run *preserves* that already-advanced value rather than
//! advancing again.

/// Per-stream DBC state, advanced one packet at a time by [`DbcState::next`].
///
/// Tracks both `last_data_dbc` (the anchor NO-DATA advances from) and
/// `last_any_dbc` (what the first DATA after NO-DATA preserves).
#[derive(Debug, Clone, Copy)]
pub struct DbcState {
    last_data_dbc: u8,
    last_any_dbc: u8,
    prev_was_no_data: bool,
    has_valid_dbc_state: bool,
}

impl DbcState {
    /// Fresh state for a stream about to start: no prior packet to anchor
    /// against, so the first call to `next` forces `dbc = 0` regardless of
    /// packet type.
    pub fn new() -> Self {
        DbcState {
            last_data_dbc: 0,
            last_any_dbc: 0,
            prev_was_no_data: true,
            has_valid_dbc_state: false,
        }
    }

    /// The `dbc` value currently in effect (the value the last call to
    /// `next` produced, or 0 before the first call).
    pub fn current(&self) -> u8 {
        self.last_any_dbc
    }

    /// Compute the `dbc` value for the next packet and advance state.
    /// `blocks_per_packet` is the CIP `dbs`-derived block count (8 for the
    /// 2-channel AM824 default).
    ///
    /// Rule:
    /// - The very first packet of a stream starts at `dbc = 0` regardless of
    ///   type (no prior DATA packet exists to anchor against).
    /// - A DATA packet following a DATA packet advances by `blocks_per_packet`.
    /// - A NO-DATA packet advances by `blocks_per_packet` from the last DATA
    ///   packet's `dbc`, the same as a DATA packet would have.
    /// - The first DATA packet after a NO-DATA run preserves the NO-DATA
    ///   packet's `dbc` (no further advance).
    pub fn next(&mut self, is_no_data: bool, blocks_per_packet: u8) -> u8 {
        let dbc = if !self.has_valid_dbc_state {
            0
        } else if is_no_data {
            self.last_data_dbc.wrapping_add(blocks_per_packet)
        } else if self.prev_was_no_data {
            self.last_any_dbc
        } else {
            self.last_data_dbc.wrapping_add(blocks_per_packet)
        };

        if !is_no_data {
            self.last_data_dbc = dbc;
        }
        self.last_any_dbc = dbc;
        self.prev_was_no_data = is_no_data;
        self.has_valid_dbc_state = true;
        dbc
    }
}

impl Default for DbcState {
    fn default() -> Self {
        Self::new()
    }
}

impl DbcState {
    /// Resume tracking from a known-good `(dbc, prev_was_no_data)` pair, as
    /// observed on the emission path after the emergency calculator ran.
    pub fn resume_from(dbc: u8, prev_was_no_data: bool) -> Self {
        DbcState {
            last_data_dbc: dbc,
            last_any_dbc: dbc,
            prev_was_no_data,
            has_valid_dbc_state: true,
        }
    }
}

/// One observed (dbc, is_no_data) pair, as read back from a captured CIP
/// header stream.
#[derive(Debug, Clone, Copy)]
pub struct ObservedPacket {
    pub dbc: u8,
    pub is_no_data: bool,
}

/// A single continuity violation found by [`check_continuity`], identifying
/// the packet index (0-based within the checked run) and the values that
/// disagreed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbcViolation {
    pub packet_index: usize,
    pub expected_dbc: u8,
    pub actual_dbc: u8,
}

/// Replay a captured sequence of `(dbc, is_no_data)` pairs against the same
/// rule [`DbcState::next`] implements, starting from `initial` (pass
/// `DbcState::new()` for a stream-start check), and report every packet
/// whose `dbc` does not match what the rule predicts.
///
/// Used by the transmitter's post-transmission diagnostics
/// `DbcContinuityViolation`) and by integration tests (S3) rather than by
/// the hot path itself, which only ever calls `DbcState::next` forward.
pub fn check_continuity(
    mut state: DbcState,
    blocks_per_packet: u8,
    observed: &[ObservedPacket],
) -> Vec<DbcViolation> {
    let mut violations = Vec::new();
    for (i, packet) in observed.iter().enumerate() {
        let expected = state.next(packet.is_no_data, blocks_per_packet);
        if expected != packet.dbc {
            violations.push(DbcViolation {
                packet_index: i,
                expected_dbc: expected,
                actual_dbc: packet.dbc,
            });
            // Resynchronize to the observed value so one divergence doesn't
            // cascade into a false positive for every subsequent packet.
            state = DbcState {
                last_data_dbc: if packet.is_no_data {
                    state.last_data_dbc
                } else {
                    packet.dbc
                },
                last_any_dbc: packet.dbc,
                prev_was_no_data: packet.is_no_data,
                has_valid_dbc_state: true,
            };
        }
    }
    violations
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_state_starts_at_zero_regardless_of_first_packet_type() {
        let mut state = DbcState::new();
        assert_eq!(state.next(true, 8), 0);
        assert_eq!(state.current(), 0);
    }

    #[test]
    fn first_data_packet_after_no_data_preserves_dbc() {
        let mut state = DbcState::new();
        assert_eq!(state.next(true, 8), 0); // first packet, forced to 0
        assert_eq!(state.next(false, 8), 0); // preserves the NO-DATA's dbc
    }

    #[test]
    fn consecutive_data_packets_increment_by_blocks_per_packet() {
        let mut state = DbcState::new();
        state.next(false, 8); // first packet, forced to 0
        assert_eq!(state.next(false, 8), 8);
        assert_eq!(state.next(false, 8), 16);
    }

    #[test]
    fn no_data_advances_dbc_from_the_last_data_packet() {
        let mut state = DbcState::new();
        state.next(false, 8); // dbc=0 (first packet)
        state.next(false, 8); // dbc=8, last_data_dbc=8
        assert_eq!(state.next(true, 8), 16); // NO-DATA advances by 8
        assert_eq!(state.next(true, 8), 16); // repeated NO-DATA re-anchors to the same last DATA
        assert_eq!(state.next(false, 8), 16); // first DATA after NO-DATA preserves
        assert_eq!(state.next(false, 8), 24); // resumes incrementing from there
    }

    #[test]
    fn dbc_wraps_at_256() {
        let mut state = DbcState {
            last_data_dbc: 252,
            last_any_dbc: 252,
            prev_was_no_data: false,
            has_valid_dbc_state: true,
        };
        assert_eq!(state.next(false, 8), 4);
    }

    #[test]
    fn force_sync_wraparound_scenario_s2() {
        // S2: force_sync(dbc=248, prev_was_no_data=false), then 32 packets at
        // 48 kHz (every 8th NO-DATA). Expect the 248 -> 0 transition and zero
        // continuity violations.
        let mut state = DbcState {
            last_data_dbc: 248,
            last_any_dbc: 248,
            prev_was_no_data: false,
            has_valid_dbc_state: true,
        };
        let mut observed = Vec::new();
        let mut saw_wrap = false;
        for i in 0..32u32 {
            let is_no_data = i % 8 == 7;
            let dbc = state.next(is_no_data, 8);
            if state.last_data_dbc == 0 || dbc == 0 {
                saw_wrap = true;
            }
            observed.push(ObservedPacket { dbc, is_no_data });
        }
        assert!(saw_wrap, "expected a 248 -> 0 wraparound somewhere in the run");

        let replay_start = DbcState {
            last_data_dbc: 248,
            last_any_dbc: 248,
            prev_was_no_data: false,
            has_valid_dbc_state: true,
        };
        let violations = check_continuity(replay_start, 8, &observed);
        assert!(violations.is_empty());
    }

    #[test]
    fn check_continuity_reports_no_violations_for_a_correct_stream() {
        let mut gen = DbcState::new();
        let pattern = [true, false, false, true, true, false];
        let observed: Vec<ObservedPacket> = pattern
            .iter()
            .map(|&no_data| ObservedPacket {
                dbc: gen.next(no_data, 8),
                is_no_data: no_data,
            })
            .collect();
        let violations = check_continuity(DbcState::new(), 8, &observed);
        assert!(violations.is_empty());
    }

    #[test]
    fn check_continuity_flags_a_skipped_increment() {
        let observed = [
            ObservedPacket { dbc: 0, is_no_data: false },
            ObservedPacket { dbc: 16, is_no_data: false }, // should have been 8
            ObservedPacket { dbc: 24, is_no_data: false },
        ];
        let violations = check_continuity(DbcState::new(), 8, &observed);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].packet_index, 1);
        assert_eq!(violations[0].expected_dbc, 8);
        assert_eq!(violations[0].actual_dbc, 16);
    }
}
