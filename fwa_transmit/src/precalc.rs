//! The CIP pre-calculator: a background real-time thread that decides
//! DATA/NO-DATA and computes DBC/SYT for future groups, publishing them
//! through a small ring of seqlock-protected cells (depth 4, even/odd
//! version counter) so the hardware callback thread never blocks waiting
//! for a computation.
//!
//! The rolling calculation state (SYT offset, SYT phase, running DBC count,
//! last-was-no-data flag) is modeled here as a single [`CalcState`] behind a
//! `std::sync::Mutex`, since `force_sync` and `emergency_calculate_cip` must
//! reach into it from the callback thread — "thread-local state a second
//! thread can still reach under a lock" only makes sense in Rust as one
//! shared, mutex-guarded value.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use fwa_core::cip::{CipHeader, DBS_STEREO_AM824};
use fwa_core::StackVec;
use tracing::{debug, trace, warn};

use crate::config::{SytStyle, TransmitConfig};
use crate::dbc::DbcState;
use crate::syt::{AppleDdaSytGenerator, PhaseSytGenerator, SytDecision};

/// Depth of the pre-calculated group ring.
pub const GROUP_CELL_DEPTH: usize = 4;
/// Maximum packets held by one pre-calculated group cell.
pub const MAX_PACKETS_PER_GROUP: usize = 32;

/// SYT interval (frames per data block) for the 2-channel AM824 default.
pub const SYT_INTERVAL: u8 = 8;

/// Sentinel group number meaning "this cell has never been written, or was
/// invalidated by `force_sync`".
const NO_GROUP: u64 = u64::MAX;

/// One fully-decided future packet: the CIP header plus the NO-DATA flag and
/// the DBC increment actually applied.
#[derive(Debug, Clone, Copy)]
pub struct PrecalcPacket {
    pub header: CipHeader,
    pub is_no_data: bool,
    pub dbc_increment: u8,
}

/// One seqlock-protected group's worth of pre-calculated packets, returned
/// by [`PreCalculator::get_group_state`] as an owned snapshot (copied out
/// under the seqlock protocol, not referenced, since the writer may recycle
/// this slot the instant the version check passes).
#[derive(Debug, Clone)]
pub struct GroupState {
    pub group_number: u64,
    pub final_dbc: u8,
    pub packets: StackVec<PrecalcPacket, MAX_PACKETS_PER_GROUP>,
    pub prepared_at: Instant,
}

/// Interior-mutable group slot. `version` is the seqlock counter: even means
/// stable/readable, odd means the writer is mid-update.
struct GroupCell {
    version: AtomicU64,
    group_number: UnsafeCell<u64>,
    final_dbc: UnsafeCell<u8>,
    packet_count: UnsafeCell<u32>,
    packets: UnsafeCell<[PrecalcPacket; MAX_PACKETS_PER_GROUP]>,
    prepared_at: UnsafeCell<Instant>,
}

// SAFETY: every field is only mutated by the single pre-calculator thread
// (or `force_sync`, which takes `state_lock` to exclude the producer loop
// while it invalidates cells) between a `version` odd-bump and even-bump;
// readers only ever read opportunistically and validate with the version
// check in `get_group_state`, never assuming the read was race-free.
unsafe impl Send for GroupCell {}
unsafe impl Sync for GroupCell {}

impl GroupCell {
    fn new() -> Self {
        GroupCell {
            version: AtomicU64::new(0),
            group_number: UnsafeCell::new(NO_GROUP),
            final_dbc: UnsafeCell::new(0),
            packet_count: UnsafeCell::new(0),
            packets: UnsafeCell::new(
                [PrecalcPacket {
                    header: CipHeader::no_data(0, 0, 0),
                    is_no_data: true,
                    dbc_increment: 0,
                }; MAX_PACKETS_PER_GROUP],
            ),
            prepared_at: UnsafeCell::new(Instant::now()),
        }
    }

    /// Begin a write: bump the version to odd. Must be paired with
    /// [`Self::end_write`].
    fn begin_write(&self) {
        self.version.fetch_add(1, Ordering::AcqRel);
    }

    /// Finish a write: bump the version to even, publishing the update.
    fn end_write(&self) {
        self.version.fetch_add(1, Ordering::Release);
    }

    /// Mark this cell empty (used by `force_sync`). Caller must have already
    /// called `begin_write`.
    fn clear_locked(&self) {
        // SAFETY: caller holds the writer role (odd version in flight).
        unsafe {
            *self.group_number.get() = NO_GROUP;
            *self.packet_count.get() = 0;
        }
    }

    /// Write one group's worth of packets. Caller must have already called
    /// `begin_write`.
    fn write_locked(&self, group_number: u64, final_dbc: u8, packets: &[PrecalcPacket], prepared_at: Instant) {
        // SAFETY: caller holds the writer role (odd version in flight); no
        // reader observes these fields as final until `end_write` publishes
        // the even version.
        unsafe {
            *self.group_number.get() = group_number;
            *self.final_dbc.get() = final_dbc;
            *self.packet_count.get() = packets.len() as u32;
            let dst = &mut (*self.packets.get())[..packets.len()];
            dst.copy_from_slice(packets);
            *self.prepared_at.get() = prepared_at;
        }
    }

    /// Opportunistic read: copies the cell's fields without synchronization.
    /// The caller is responsible for re-checking the version before trusting
    /// the result (the seqlock protocol in `get_group_state`).
    fn snapshot_unsynchronized(&self) -> GroupState {
        // SAFETY: this is a torn read by construction; the caller validates
        // it against the version counter before using it.
        unsafe {
            let count = (*self.packet_count.get()) as usize;
            let mut packets = StackVec::new();
            for p in &(*self.packets.get())[..count.min(MAX_PACKETS_PER_GROUP)] {
                let _ = packets.push(*p);
            }
            GroupState {
                group_number: *self.group_number.get(),
                final_dbc: *self.final_dbc.get(),
                packets,
                prepared_at: *self.prepared_at.get(),
            }
        }
    }
}

/// The per-rate SYT/NO-DATA decision generator, selected once at
/// construction by [`crate::config::SytStyle`].
#[derive(Debug, Clone)]
enum SytGenerator {
    Phase(PhaseSytGenerator),
    Apple(AppleDdaSytGenerator),
}

impl SytGenerator {
    fn new(style: SytStyle, sample_rate: u32) -> Self {
        match style {
            SytStyle::Phase => SytGenerator::Phase(PhaseSytGenerator::new(sample_rate)),
            SytStyle::AppleDda => SytGenerator::Apple(AppleDdaSytGenerator::new(sample_rate)),
        }
    }

    fn next(&mut self, timing_established: bool) -> SytDecision {
        match self {
            SytGenerator::Phase(g) => g.next(timing_established),
            SytGenerator::Apple(g) => {
                if timing_established {
                    g.next()
                } else {
                    SytDecision::NO_DATA
                }
            }
        }
    }

    fn update_time_reference(&mut self, raw_cycle_time: u32) {
        if let SytGenerator::Apple(g) = self {
            g.update_time_reference(raw_cycle_time);
        }
    }
}

/// The calculation state shared between the producer thread and the
/// synchronous `force_sync`/`emergency_calculate_cip` entry points.
struct CalcState {
    dbc: DbcState,
    syt: SytGenerator,
    timing_established: bool,
}

/// Background producer of pre-calculated CIP groups.
///
/// `sid` (sender node ID) is set once the port has opened and the local
/// node ID is known; until then, headers are built with `sid = 0`, which is
/// harmless since it is only ever overwritten by [`Self::set_sid`] before
/// `start`.
pub struct PreCalculator {
    cells: Arc<[GroupCell; GROUP_CELL_DEPTH]>,
    state: Arc<Mutex<CalcState>>,
    running: Arc<AtomicBool>,
    /// Highest absolute group number the producer has published.
    produced: Arc<AtomicU64>,
    /// Highest absolute group number the consumer has finished with.
    consumed: Arc<AtomicU64>,
    sid: Arc<Mutex<u8>>,
    fdf: u8,
    packets_per_group: u32,
    thread: Option<JoinHandle<()>>,
}

impl PreCalculator {
    /// Construct (but do not yet start) a pre-calculator for `config`.
    pub fn new(config: &TransmitConfig) -> Self {
        let fdf = fwa_core::cip::fdf_for_sample_rate(config.sample_rate)
            .expect("config.validate() rejects unsupported sample rates before this point");
        PreCalculator {
            cells: Arc::new([
                GroupCell::new(),
                GroupCell::new(),
                GroupCell::new(),
                GroupCell::new(),
            ]),
            state: Arc::new(Mutex::new(CalcState {
                dbc: DbcState::new(),
                syt: SytGenerator::new(config.syt_style, config.sample_rate),
                timing_established: false,
            })),
            running: Arc::new(AtomicBool::new(false)),
            produced: Arc::new(AtomicU64::new(0)),
            consumed: Arc::new(AtomicU64::new(0)),
            sid: Arc::new(Mutex::new(0)),
            fdf,
            packets_per_group: config.packets_per_group,
            thread: None,
        }
    }

    /// Set the sender node ID used in every header this pre-calculator
    /// produces from now on.
    pub fn set_sid(&self, sid: u8) {
        *self.sid.lock().unwrap() = sid;
    }

    /// Tell the generator that hardware timing is now established (first
    /// DCL completion observed), so it may stop forcing NO-DATA.
    pub fn mark_timing_established(&self) {
        self.state.lock().unwrap().timing_established = true;
    }

    /// Feed a raw hardware cycle-time value to the Apple DDA generator (a
    /// no-op when `SytStyle::Phase` is in use).
    pub fn update_hardware_time_reference(&self, raw_cycle_time: u32) {
        self.state.lock().unwrap().syt.update_time_reference(raw_cycle_time);
    }

    /// Start the background producer thread.
    pub fn start(&mut self) {
        if self.thread.is_some() {
            return;
        }
        self.running.store(true, Ordering::Release);

        let cells = self.cells.clone();
        let state = self.state.clone();
        let running = self.running.clone();
        let produced = self.produced.clone();
        let consumed = self.consumed.clone();
        let sid_cell = self.sid.clone();
        let fdf = self.fdf;
        let packets_per_group = self.packets_per_group;

        self.thread = Some(
            thread::Builder::new()
                .name("fwa-precalc".into())
                .spawn(move || {
                    apply_realtime_scheduling();
                    pin_to_current_cpu();
                    producer_loop(cells, state, running, produced, consumed, sid_cell, fdf, packets_per_group);
                })
                .expect("spawning the pre-calculator thread should not fail under normal operation"),
        );
    }

    /// Stop the background thread and wait for it to exit.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }

    /// Read a group's pre-calculated state via the seqlock protocol, with up
    /// to 3 retries.
    pub fn get_group_state(&self, abs_group_number: u64) -> Option<GroupState> {
        let slot = (abs_group_number % GROUP_CELL_DEPTH as u64) as usize;
        let cell = &self.cells[slot];

        for _ in 0..3 {
            let v1 = cell.version.load(Ordering::Acquire);
            if v1 % 2 != 0 {
                continue; // writer in flight; retry immediately
            }
            let snapshot = cell.snapshot_unsynchronized();
            let v2 = cell.version.load(Ordering::Acquire);
            if v1 == v2 {
                if snapshot.group_number == abs_group_number {
                    return Some(snapshot);
                }
                return None; // consistent read, but this slot holds a different group
            }
        }
        None
    }

    /// Record that the caller has finished with `abs_group_number`, allowing
    /// the producer to move that many groups further ahead.
    pub fn mark_group_consumed(&self, abs_group_number: u64) {
        self.consumed.fetch_max(abs_group_number, Ordering::AcqRel);
    }

    /// Realign the shared DBC state after the emergency path has run,
    /// invalidating every ring cell so stale pre-calculated groups (computed
    /// from the old DBC baseline) are never handed to a reader.
    pub fn force_sync(&self, dbc: u8, prev_was_no_data: bool) {
        warn!(dbc, prev_was_no_data, "pre-calculator force_sync");
        {
            let mut state = self.state.lock().unwrap();
            state.dbc = DbcState::resume_from(dbc, prev_was_no_data);
        }
        for cell in self.cells.iter() {
            cell.begin_write();
            cell.clear_locked();
            cell.end_write();
        }
        self.produced.store(0, Ordering::Release);
        self.consumed.store(0, Ordering::Release);
    }

    /// Synchronously compute one packet's CIP header using the same
    /// decision rule and DBC state the producer thread uses, for the
    /// hardware callback's emergency path when no pre-calculated group is
    /// ready in time.
    pub fn emergency_calculate_cip(&self, _packet_index: u32) -> PrecalcPacket {
        let sid = *self.sid.lock().unwrap();
        let mut state = self.state.lock().unwrap();
        trace!("emergency CIP calculation");
        compute_one_packet(&mut state, sid, self.fdf)
    }
}

impl Drop for PreCalculator {
    fn drop(&mut self) {
        self.stop();
    }
}

fn compute_one_packet(state: &mut CalcState, sid: u8, fdf: u8) -> PrecalcPacket {
    let decision = state.syt.next(state.timing_established);
    let dbc = state.dbc.next(decision.is_no_data, SYT_INTERVAL);
    let header = if decision.is_no_data {
        CipHeader::no_data(sid, dbc, fdf)
    } else {
        CipHeader::new(sid, DBS_STEREO_AM824, dbc, fdf, decision.syt_value)
    };
    PrecalcPacket {
        header,
        is_no_data: decision.is_no_data,
        dbc_increment: SYT_INTERVAL,
    }
}

#[allow(clippy::too_many_arguments)]
fn producer_loop(
    cells: Arc<[GroupCell; GROUP_CELL_DEPTH]>,
    state: Arc<Mutex<CalcState>>,
    running: Arc<AtomicBool>,
    produced: Arc<AtomicU64>,
    consumed: Arc<AtomicU64>,
    sid_cell: Arc<Mutex<u8>>,
    fdf: u8,
    packets_per_group: u32,
) {
    let mut next_group: u64 = 0;
    let mut scratch = [PrecalcPacket {
        header: CipHeader::no_data(0, 0, fdf),
        is_no_data: true,
        dbc_increment: 0,
    }; MAX_PACKETS_PER_GROUP];

    while running.load(Ordering::Acquire) {
        let consumed_now = consumed.load(Ordering::Acquire);
        if next_group >= consumed_now + GROUP_CELL_DEPTH as u64 && next_group > 0 {
            // Consumer hasn't caught up; do not overwrite a cell it may
            // still be reading from.
            thread::sleep(adaptive_sleep(next_group, consumed_now));
            continue;
        }

        let slot = (next_group % GROUP_CELL_DEPTH as u64) as usize;
        let cell = &cells[slot];
        let sid = *sid_cell.lock().unwrap();

        cell.begin_write();
        let (final_dbc, count) = {
            let mut guard = state.lock().unwrap();
            let mut count = 0usize;
            for i in 0..packets_per_group as usize {
                scratch[i] = compute_one_packet(&mut guard, sid, fdf);
                count += 1;
            }
            (guard.dbc.current(), count)
        };
        cell.write_locked(next_group, final_dbc, &scratch[..count], Instant::now());
        cell.end_write();

        produced.store(next_group, Ordering::Release);
        debug!(group = next_group, count, "pre-calculated group published");
        next_group += 1;
    }
}

/// Sleep duration for the producer's flow-control backoff: 5-200 µs,
/// longer when the ring is near-full, shorter when near-empty.
fn adaptive_sleep(next_group: u64, consumed: u64) -> Duration {
    let ahead = next_group.saturating_sub(consumed);
    let micros = 5 + (ahead.min(GROUP_CELL_DEPTH as u64) * 195 / GROUP_CELL_DEPTH as u64);
    Duration::from_micros(micros.max(5))
}

/// Best-effort `SCHED_FIFO` request. Failing (e.g. no
/// `CAP_SYS_NICE`) is not fatal; the thread simply runs at normal priority.
fn apply_realtime_scheduling() {
    // SAFETY: `sched_param`/`sched_setscheduler` are called with a
    // zero-initialized, in-range priority and the calling thread's own PID
    // (0 meaning "self"); failure is handled by checking the return value.
    unsafe {
        let mut param: libc::sched_param = std::mem::zeroed();
        param.sched_priority = libc::sched_get_priority_max(libc::SCHED_FIFO) / 2;
        if libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) != 0 {
            trace!("SCHED_FIFO unavailable for pre-calculator thread; continuing at normal priority");
        }
    }
}

/// Best-effort CPU pinning to the core the thread is already running on,
/// to avoid migration jitter.
fn pin_to_current_cpu() {
    // SAFETY: `sched_getcpu`/`CPU_SET`/`sched_setaffinity` operate on
    // well-formed, stack-local `cpu_set_t` values and the calling thread.
    unsafe {
        let cpu = libc::sched_getcpu();
        if cpu < 0 {
            return;
        }
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu as usize, &mut set);
        let _ = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransmitConfig;

    fn wait_for_group(pc: &PreCalculator, group: u64) -> GroupState {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if let Some(state) = pc.get_group_state(group) {
                return state;
            }
            if Instant::now() > deadline {
                panic!("timed out waiting for pre-calculated group {group}");
            }
            thread::sleep(Duration::from_micros(50));
        }
    }

    #[test]
    fn produces_groups_with_correct_packet_count_and_dbs() {
        let config = TransmitConfig {
            sample_rate: 48_000,
            packets_per_group: 8,
            ..TransmitConfig::default()
        };
        let mut pc = PreCalculator::new(&config);
        pc.mark_timing_established();
        pc.start();

        let state = wait_for_group(&pc, 0);
        assert_eq!(state.group_number, 0);
        assert_eq!(state.packets.as_slice().len(), 8);
        for p in state.packets.as_slice() {
            assert_eq!({ p.header.dbs }, DBS_STEREO_AM824);
        }
        pc.stop();
    }

    #[test]
    fn fdf_never_differs_between_data_and_no_data_packets() {
        let config = TransmitConfig {
            sample_rate: 44_100,
            packets_per_group: 16,
            ..TransmitConfig::default()
        };
        let mut pc = PreCalculator::new(&config);
        pc.mark_timing_established();
        pc.start();

        let state = wait_for_group(&pc, 0);
        let fdf = fwa_core::cip::FDF_44K1;
        for p in state.packets.as_slice() {
            assert_eq!(p.header.fdf, fdf);
        }
        pc.stop();
    }

    #[test]
    fn consumer_flow_control_stalls_producer_past_ring_depth() {
        let config = TransmitConfig {
            sample_rate: 48_000,
            packets_per_group: 8,
            ..TransmitConfig::default()
        };
        let mut pc = PreCalculator::new(&config);
        pc.mark_timing_established();
        pc.start();

        // Never call mark_group_consumed: the producer should not run away
        // more than GROUP_CELL_DEPTH groups ahead of group 0.
        thread::sleep(Duration::from_millis(50));
        let produced = pc.produced.load(Ordering::Acquire);
        assert!(produced < GROUP_CELL_DEPTH as u64 + 2);
        pc.stop();
    }

    #[test]
    fn force_sync_realigns_dbc_and_invalidates_cells() {
        let config = TransmitConfig {
            sample_rate: 48_000,
            packets_per_group: 8,
            ..TransmitConfig::default()
        };
        let mut pc = PreCalculator::new(&config);
        pc.mark_timing_established();
        pc.start();
        let _ = wait_for_group(&pc, 0);
        pc.mark_group_consumed(0);

        pc.force_sync(248, false);
        // After force_sync, group numbering restarts at 0 from the new baseline.
        let state = wait_for_group(&pc, 0);
        assert_eq!(state.group_number, 0);
        pc.stop();
    }

    #[test]
    fn emergency_calculation_shares_dbc_state_with_producer() {
        let config = TransmitConfig {
            sample_rate: 48_000,
            packets_per_group: 8,
            ..TransmitConfig::default()
        };
        let pc = PreCalculator::new(&config);
        pc.mark_timing_established();
        // No producer thread running: every packet comes from the
        // emergency path, exercising the same CalcState the thread would.
        let mut observed = Vec::new();
        for i in 0..20 {
            let packet = pc.emergency_calculate_cip(i);
            observed.push(crate::dbc::ObservedPacket {
                dbc: packet.header.dbc(),
                is_no_data: packet.is_no_data,
            });
        }
        let violations = crate::dbc::check_continuity(DbcState::new(), SYT_INTERVAL, &observed);
        assert!(violations.is_empty());
    }

    #[test]
    fn seqlock_reader_never_sees_a_torn_group() {
        let config = TransmitConfig {
            sample_rate: 48_000,
            packets_per_group: 8,
            ..TransmitConfig::default()
        };
        let mut pc = PreCalculator::new(&config);
        pc.mark_timing_established();
        pc.start();

        for g in 0..40u64 {
            let state = wait_for_group(&pc, g);
            assert_eq!(state.group_number, g);
            assert_eq!(state.packets.as_slice().len(), 8);
            for p in state.packets.as_slice() {
                assert_eq!({ p.header.dbs }, DBS_STEREO_AM824);
            }
            pc.mark_group_consumed(g);
        }
        pc.stop();
    }
}
