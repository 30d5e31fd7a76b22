//! The transmitter: orchestrates the buffer manager, pre-calculator, DCL
//! program, and port through a
//! `Uninitialized -> Initialized -> Running -> Uninitialized` lifecycle and
//! runs the DCL-complete hot path.
//!
//! Completion and overrun callback forwarding is modeled here as a
//! [`PortEventSink`] implementation holding a `Weak` back-reference to the
//! shared transmitter state, avoiding the reference cycle that would
//! otherwise exist between the transmitter (which owns the port) and the
//! port (which is handed the sink).

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

use fwa_core::error::Result;
use fwa_core::nub::{BusSpeed, DmaRange, NubPort, PortEvent, PortEventSink};
use fwa_core::timing;
use fwa_core::TransmitError;
use tracing::{debug, error, info, warn};

use crate::buffer::TransmitBufferManager;
use crate::config::TransmitConfig;
use crate::dbc::{check_continuity, DbcState, ObservedPacket};
use crate::dcl::DclProgram;
use crate::message::{MessageCallback, TransmitterMessage};
use crate::precalc::{PreCalculator, SYT_INTERVAL};
use crate::provider::PacketProvider;
use crate::shm::RingHandle;

/// Transmitter lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmitterState {
    Uninitialized,
    Initialized,
    Running,
}

/// Everything the DCL-complete callback needs, shared between the
/// [`Transmitter`] handle and its registered [`PortEventSink`].
struct Shared<R: RingHandle + Send + Sync + 'static> {
    state: Mutex<TransmitterState>,
    config: TransmitConfig,
    buffer: TransmitBufferManager,
    dcl: Mutex<DclProgram>,
    precalc: PreCalculator,
    provider: Mutex<PacketProvider<R>>,
    port: Mutex<Box<dyn NubPort>>,
    message_callback: Mutex<Option<MessageCallback>>,
    post_validator: Mutex<DbcState>,
    running: AtomicBool,
    first_callback_done: AtomicBool,
    next_prepare_group: AtomicU64,
    violation_count: AtomicU64,
    sid: AtomicU8,
    notify_cursor: AtomicU32,
}

impl<R: RingHandle + Send + Sync + 'static> Shared<R> {
    fn notify(&self, message: TransmitterMessage) {
        if let Some(cb) = self.message_callback.lock().unwrap().as_mut() {
            cb(message);
        }
    }

    /// One packet's worth of DMA ranges, sized for NO-DATA (CIP header only)
    /// or DATA (CIP header + audio payload).
    fn ranges_for(&self, group: u32, packet: u32, is_no_data: bool) -> Result<Vec<DmaRange>> {
        let ppg = self.config.packets_per_group;
        let cip_ptr = self.buffer.cip_header_mut(group, packet, ppg)? as *const _ as *const u8;
        let mut ranges = vec![DmaRange {
            ptr: cip_ptr,
            len: std::mem::size_of::<fwa_core::cip::CipHeader>(),
        }];
        if !is_no_data {
            let payload = self.buffer.audio_payload_mut(group, packet, ppg)?;
            ranges.push(DmaRange {
                ptr: payload.as_ptr(),
                len: payload.len(),
            });
        }
        Ok(ranges)
    }

    /// Write one packet's CIP header, fill its audio payload, and push the
    /// updated ranges to the DCL program (shared by the fast and emergency
    /// paths of [`Self::prepare_group`]).
    fn emit_packet(
        &self,
        ring_group: u32,
        packet_index: u32,
        header: fwa_core::cip::CipHeader,
        is_no_data: bool,
    ) -> Result<()> {
        let ppg = self.config.packets_per_group;
        *self.buffer.cip_header_mut(ring_group, packet_index, ppg)? = header;

        if !is_no_data {
            let payload = self.buffer.audio_payload_mut(ring_group, packet_index, ppg)?;
            let result = self.provider.lock().unwrap().fill_packet(payload);
            if result.generated_silence {
                self.notify(TransmitterMessage::BufferUnderrun {
                    segment: ring_group,
                    packet: packet_index,
                });
            }
        }

        let ranges = self.ranges_for(ring_group, packet_index, is_no_data)?;
        self.dcl
            .lock()
            .unwrap()
            .update_packet(ring_group, packet_index, is_no_data, &ranges)?;

        let expected = self.post_validator.lock().unwrap().next(is_no_data, SYT_INTERVAL);
        if expected != header.dbc() {
            self.violation_count.fetch_add(1, Ordering::Relaxed);
            error!(
                ring_group,
                packet_index,
                expected,
                actual = header.dbc(),
                "DBC continuity violation"
            );
            self.notify(TransmitterMessage::DbcContinuityViolation {
                segment: ring_group,
                packet: packet_index,
            });
        }
        Ok(())
    }

    /// Prepare one absolute group number: fast path from the pre-calculator,
    /// or the synchronous emergency path if nothing is ready in time.
    fn prepare_group(&self, abs_group: u64) -> Result<()> {
        let ring_group = (abs_group % self.config.num_groups as u64) as u32;

        match self.precalc.get_group_state(abs_group) {
            Some(group_state) => {
                for (i, packet) in group_state.packets.as_slice().iter().enumerate() {
                    self.emit_packet(ring_group, i as u32, packet.header, packet.is_no_data)?;
                }
            }
            None => {
                debug!(abs_group, "pre-calculated group not ready; taking emergency path");
                let mut last = None;
                for i in 0..self.config.packets_per_group {
                    let packet = self.precalc.emergency_calculate_cip(i);
                    self.emit_packet(ring_group, i, packet.header, packet.is_no_data)?;
                    last = Some((packet.header.dbc(), packet.is_no_data));
                }
                if let Some((dbc, is_no_data)) = last {
                    self.precalc.force_sync(dbc, is_no_data);
                }
            }
        }

        self.dcl.lock().unwrap().notify_segment_update(
            &mut **self.port.lock().unwrap(),
            ring_group,
        )?;
        self.precalc.mark_group_consumed(abs_group);
        Ok(())
    }

    /// The DCL-complete hot path.
    fn on_group_complete(&self, completed_ring_group: u32, timestamp_encoded: u32) {
        if !self.running.load(Ordering::Acquire) {
            return;
        }

        if let Ok(cell) = self.buffer.timestamp_mut(completed_ring_group, 0, self.config.packets_per_group) {
            *cell = timing::encoded_to_nanos(timestamp_encoded);
        }

        self.validate_completed_group(completed_ring_group);

        if !self.first_callback_done.swap(true, Ordering::AcqRel) {
            self.precalc.mark_timing_established();
        }
        self.precalc.update_hardware_time_reference(timestamp_encoded);

        let prepare_count = if self.notify_cursor.fetch_add(1, Ordering::Relaxed) == 0 {
            2 // prime only 2 groups on the very first callback
        } else {
            self.config.callback_group_interval
        };

        let start = self.next_prepare_group.fetch_add(prepare_count as u64, Ordering::Relaxed);
        for offset in 0..prepare_count as u64 {
            let abs_group = start + offset;
            if let Err(err) = self.prepare_group(abs_group) {
                error!(abs_group, %err, "failed to prepare group");
                self.notify(TransmitterMessage::Error);
            }
        }
    }

    /// Post-transmission DBC validation on the just-completed group:
    /// re-read the headers hardware just finished sending and check
    /// internal continuity, seeded from the group's own first packet
    /// since no prior-group baseline is threaded through here. Logs and
    /// counts a violation but never stops the stream.
    fn validate_completed_group(&self, ring_group: u32) {
        let ppg = self.config.packets_per_group;
        let mut observed = Vec::with_capacity(ppg as usize);
        for p in 0..ppg {
            match self.buffer.cip_header_mut(ring_group, p, ppg) {
                Ok(header) => observed.push(ObservedPacket {
                    dbc: header.dbc(),
                    is_no_data: header.is_no_data(),
                }),
                Err(_) => return,
            }
        }
        let Some(first) = observed.first().copied() else { return };
        let seed = DbcState::resume_from(first.dbc, first.is_no_data);
        let violations = check_continuity(seed, SYT_INTERVAL, &observed[1..]);
        if !violations.is_empty() {
            self.violation_count.fetch_add(violations.len() as u64, Ordering::Relaxed);
            warn!(ring_group, count = violations.len(), "post-transmission DBC continuity violation");
            self.notify(TransmitterMessage::DbcContinuityViolation { segment: ring_group, packet: 0 });
        }
    }

    fn on_overrun(&self) {
        warn!("DCL overrun");
        self.notify(TransmitterMessage::OverrunError);
        self.running.store(false, Ordering::Release);
        self.notify(TransmitterMessage::OverrunRecoveryAttempt);

        let restart = (|| -> Result<()> {
            self.port.lock().unwrap().stop()?;
            self.reset_dbc_and_prime()?;
            self.port.lock().unwrap().start()?;
            Ok(())
        })();

        match restart {
            Ok(()) => {
                self.running.store(true, Ordering::Release);
                self.notify(TransmitterMessage::StreamStarted);
            }
            Err(err) => {
                error!(%err, "overrun recovery failed");
                self.notify(TransmitterMessage::OverrunRecoveryFailed);
            }
        }
    }

    /// Reset rolling DBC state and fill every packet slot with the initial
    /// NO-DATA pattern, called at the start of `start_transmit`.
    fn reset_dbc_and_prime(&self) -> Result<()> {
        *self.post_validator.lock().unwrap() = DbcState::new();
        self.next_prepare_group.store(0, Ordering::Relaxed);
        self.notify_cursor.store(0, Ordering::Relaxed);
        self.first_callback_done.store(false, Ordering::Relaxed);

        let fdf = fwa_core::cip::fdf_for_sample_rate(self.config.sample_rate)
            .expect("config.validate() rejects unsupported sample rates");
        for group in 0..self.config.num_groups {
            for packet in 0..self.config.packets_per_group {
                *self.buffer.cip_header_mut(group, packet, self.config.packets_per_group)? =
                    fwa_core::cip::CipHeader::no_data(self.sid.load(Ordering::Relaxed), 0, fdf);
                let payload = self.buffer.audio_payload_mut(group, packet, self.config.packets_per_group)?;
                self.provider.lock().unwrap().fill_packet(payload);
            }
        }
        Ok(())
    }
}

/// Forwards [`PortEvent`]s from the port's callback thread into the shared
/// transmitter state. Holds a `Weak` reference so the (port -> sink ->
/// transmitter) chain never keeps the transmitter alive past its own drop.
struct TransmitterEventSink<R: RingHandle + Send + Sync + 'static> {
    shared: Weak<Shared<R>>,
}

impl<R: RingHandle + Send + Sync + 'static> PortEventSink for TransmitterEventSink<R> {
    fn on_event(&mut self, event: PortEvent) {
        let Some(shared) = self.shared.upgrade() else { return };
        match event {
            PortEvent::GroupComplete { group_index, timestamp_encoded } => {
                shared.on_group_complete(group_index, timestamp_encoded)
            }
            PortEvent::Overrun => shared.on_overrun(),
        }
    }
}

/// The transmit-core orchestrator. Generic over the
/// shared-memory ring backing its packet provider so the same code runs
/// against [`crate::shm::LocalAudioRing`] (tests, demos) and
/// [`crate::shm::PosixAudioRing`] (the real cross-process path).
pub struct Transmitter<R: RingHandle + Send + Sync + 'static> {
    shared: Arc<Shared<R>>,
}

impl<R: RingHandle + Send + Sync + 'static> Transmitter<R> {
    /// `initialize(nub)`: validate `config`, build the buffer manager,
    /// pre-calculator, and DCL program, bind `port`, and register the
    /// completion/overrun forwarder. Fails with `BadArgument` on an invalid
    /// config.
    pub fn initialize(config: TransmitConfig, ring: R, port: Box<dyn NubPort>) -> Result<Self> {
        config.validate()?;

        let buffer = TransmitBufferManager::new(&config)?;
        let dcl = DclProgram::create_program(&config, &buffer)?;
        let mut precalc = PreCalculator::new(&config);
        precalc.start();

        let shared = Arc::new(Shared {
            state: Mutex::new(TransmitterState::Initialized),
            config,
            buffer,
            dcl: Mutex::new(dcl),
            precalc,
            provider: Mutex::new(PacketProvider::bind(ring)),
            port: Mutex::new(port),
            message_callback: Mutex::new(None),
            post_validator: Mutex::new(DbcState::new()),
            running: AtomicBool::new(false),
            first_callback_done: AtomicBool::new(false),
            next_prepare_group: AtomicU64::new(0),
            violation_count: AtomicU64::new(0),
            sid: AtomicU8::new(0),
            notify_cursor: AtomicU32::new(0),
        });

        let sink = TransmitterEventSink { shared: Arc::downgrade(&shared) };
        shared.port.lock().unwrap().set_event_sink(Box::new(sink));

        info!("transmitter initialized");
        Ok(Transmitter { shared })
    }

    /// Register the client's message callback.
    pub fn set_message_callback(&self, callback: MessageCallback) {
        *self.shared.message_callback.lock().unwrap() = Some(callback);
    }

    /// `configure(speed, channel)`: legal only in `Initialized`.
    pub fn configure(&self, speed: BusSpeed, channel: u32) -> Result<()> {
        let mut state = self.shared.state.lock().unwrap();
        if *state != TransmitterState::Initialized {
            return Err(TransmitError::NotReady);
        }
        self.shared.port.lock().unwrap().open(speed, channel)?;
        let sid = self.shared.port.lock().unwrap().local_node_id()?;
        self.shared.sid.store(sid as u8, Ordering::Relaxed);
        self.shared.precalc.set_sid(sid as u8);
        self.shared.notify(TransmitterMessage::AllocatePort {
            speed: speed as u32,
            channel,
        });
        *state = TransmitterState::Initialized;
        Ok(())
    }

    /// `start_transmit()`. On any failure, state unwinds back to
    /// `Initialized`.
    pub fn start_transmit(&self) -> Result<()> {
        {
            let state = self.shared.state.lock().unwrap();
            if *state != TransmitterState::Initialized {
                return Err(TransmitError::NotReady);
            }
        }

        let result = (|| -> Result<()> {
            self.shared.reset_dbc_and_prime()?;
            self.shared.dcl.lock().unwrap().fixup_jump_targets(&mut **self.shared.port.lock().unwrap())?;
            self.shared.port.lock().unwrap().start()?;
            Ok(())
        })();

        match result {
            Ok(()) => {
                *self.shared.state.lock().unwrap() = TransmitterState::Running;
                self.shared.running.store(true, Ordering::Release);
                self.shared.notify(TransmitterMessage::StreamStarted);
                info!("transmission started");
                Ok(())
            }
            Err(err) => {
                error!(%err, "start_transmit failed");
                Err(err)
            }
        }
    }

    /// `stop_transmit()`: `Running -> Initialized`.
    pub fn stop_transmit(&self) -> Result<()> {
        {
            let state = self.shared.state.lock().unwrap();
            if *state != TransmitterState::Running {
                return Ok(()); // idempotent
            }
        }
        self.shared.running.store(false, Ordering::Release);
        self.shared.port.lock().unwrap().stop()?;
        *self.shared.state.lock().unwrap() = TransmitterState::Initialized;
        self.shared.notify(TransmitterMessage::StreamStopped);
        info!("transmission stopped");
        Ok(())
    }

    /// `push_audio_data`: the legacy non-SHM path, delegating to the
    /// provider's bound ring via the same `push`/`pop` protocol the real
    /// shared-memory path uses.
    pub fn push_audio_data(&self, host_timestamp_nanos: u64, data: &[u8]) -> Result<()> {
        self.shared.provider.lock().unwrap().push_data(host_timestamp_nanos, data);
        Ok(())
    }

    pub fn state(&self) -> TransmitterState {
        *self.shared.state.lock().unwrap()
    }

    pub fn dbc_violation_count(&self) -> u64 {
        self.shared.violation_count.load(Ordering::Relaxed)
    }
}

impl<R: RingHandle + Send + Sync + 'static> Drop for Transmitter<R> {
    fn drop(&mut self) {
        if self.shared.running.load(Ordering::Acquire) {
            let _ = self.stop_transmit();
        }
        let _ = self.shared.port.lock().unwrap().close();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use fwa_core::nub::{BusSpeed, ANY_CHANNEL};
    use fwa_port::MockNubPort;

    use super::*;
    use crate::shm::LocalAudioRing;

    /// A config with a short ring so the mock port's ticker fires often
    /// enough for these tests to observe several callbacks quickly.
    fn quick_config() -> TransmitConfig {
        TransmitConfig {
            num_groups: 9,
            packets_per_group: 8,
            callback_group_interval: 3,
            sample_rate: 48_000,
            ..TransmitConfig::default()
        }
    }

    fn build(config: TransmitConfig) -> Transmitter<LocalAudioRing> {
        let ring = LocalAudioRing::new(config.sample_rate, config.num_channels, config.num_channels * 4);
        let port = Box::new(MockNubPort::new(config.num_groups, config.callback_group_interval));
        Transmitter::initialize(config, ring, port).expect("initialize should succeed for a valid config")
    }

    #[test]
    fn lifecycle_reports_started_and_stopped_exactly_once() {
        let transmitter = build(quick_config());
        let (tx, rx) = mpsc::channel();
        transmitter.set_message_callback(Box::new(move |msg| {
            let _ = tx.send(msg);
        }));

        transmitter.configure(BusSpeed::S400, ANY_CHANNEL).unwrap();
        assert_eq!(transmitter.state(), TransmitterState::Initialized);

        transmitter.start_transmit().unwrap();
        assert_eq!(transmitter.state(), TransmitterState::Running);

        std::thread::sleep(Duration::from_millis(50));

        transmitter.stop_transmit().unwrap();
        assert_eq!(transmitter.state(), TransmitterState::Initialized);

        let mut started = 0;
        let mut stopped = 0;
        while let Ok(msg) = rx.try_recv() {
            match msg {
                TransmitterMessage::StreamStarted => started += 1,
                TransmitterMessage::StreamStopped => stopped += 1,
                _ => {}
            }
        }
        assert_eq!(started, 1);
        assert_eq!(stopped, 1);
    }

    #[test]
    fn stop_transmit_is_idempotent_when_not_running() {
        let transmitter = build(quick_config());
        transmitter.configure(BusSpeed::S400, ANY_CHANNEL).unwrap();
        assert!(transmitter.stop_transmit().is_ok());
        assert_eq!(transmitter.state(), TransmitterState::Initialized);
    }

    #[test]
    fn start_transmit_rejects_uninitialized_state() {
        let transmitter = build(quick_config());
        transmitter.configure(BusSpeed::S400, ANY_CHANNEL).unwrap();
        transmitter.start_transmit().unwrap();
        // Already Running: a second start_transmit must not re-enter.
        assert!(matches!(transmitter.start_transmit(), Err(TransmitError::NotReady)));
        transmitter.stop_transmit().unwrap();
    }

    #[test]
    fn running_stream_accumulates_no_dbc_violations() {
        let transmitter = build(quick_config());
        transmitter.configure(BusSpeed::S400, ANY_CHANNEL).unwrap();
        transmitter.start_transmit().unwrap();

        std::thread::sleep(Duration::from_millis(80));

        assert_eq!(transmitter.dbc_violation_count(), 0);
        transmitter.stop_transmit().unwrap();
    }

    #[test]
    fn push_audio_data_succeeds_while_running() {
        let transmitter = build(quick_config());
        transmitter.configure(BusSpeed::S400, ANY_CHANNEL).unwrap();
        transmitter.start_transmit().unwrap();

        let samples = vec![0u8; 64];
        assert!(transmitter.push_audio_data(1, &samples).is_ok());

        std::thread::sleep(Duration::from_millis(30));
        transmitter.stop_transmit().unwrap();
    }

    #[test]
    fn overrun_triggers_recovery_notification() {
        let config = quick_config();
        let ring = LocalAudioRing::new(config.sample_rate, config.num_channels, config.num_channels * 4);
        let failures = fwa_port::InjectedFailures { overrun_after_ticks: Some(2), ..Default::default() };
        let port = Box::new(MockNubPort::with_failures(config.num_groups, config.callback_group_interval, failures));
        let transmitter = Transmitter::initialize(config, ring, port).unwrap();

        let (tx, rx) = mpsc::channel();
        transmitter.set_message_callback(Box::new(move |msg| {
            let _ = tx.send(msg);
        }));
        transmitter.configure(BusSpeed::S400, ANY_CHANNEL).unwrap();
        transmitter.start_transmit().unwrap();

        std::thread::sleep(Duration::from_millis(100));

        let mut saw_overrun = false;
        while let Ok(msg) = rx.try_recv() {
            if matches!(msg, TransmitterMessage::OverrunError) {
                saw_overrun = true;
            }
        }
        assert!(saw_overrun, "expected an OverrunError notification after the injected overrun");
    }
}
