//! A simulated hardware nub: implements
//! [`fwa_core::nub::NubPort`] with a background ticking thread standing in
//! for the real IOFireWireFamily isochronous engine, so the transmit core
//! can be started, driven through completion callbacks, and torn down
//! without any FireWire hardware present.
//!
//! Swaps in behind the same trait boundary a real isochronous port would
//! implement, so the rest of the transmit core never knows it isn't talking
//! to hardware.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use fwa_core::error::Result;
use fwa_core::nub::{BusSpeed, NubPort, PortEvent, PortEventSink, SegmentHandle};
use fwa_core::TransmitError;
use tracing::{debug, info, warn};

/// One simulated bus cycle's wall-clock duration (125 µs, matching real
/// FireWire isochronous cycle timing).
const CYCLE_DURATION: Duration = Duration::from_micros(125);

/// Injectable failure modes a test can arm before calling `open`/`start`,
/// for exercising overrun and no-device recovery paths.
#[derive(Debug, Clone, Copy, Default)]
pub struct InjectedFailures {
    pub fail_open: bool,
    pub fail_start: bool,
    /// Fire a synthetic [`PortEvent::Overrun`] after this many completion
    /// ticks once running (`None` disables it).
    pub overrun_after_ticks: Option<u32>,
}

struct TickerState {
    sink: Option<Box<dyn PortEventSink>>,
    group_cursor: u32,
    ticks: u32,
}

/// A simulated isochronous port: `open`/`start` spin up a background thread
/// that fires [`PortEvent::GroupComplete`] at a fixed cadence, standing in
/// for real DCL completion interrupts.
pub struct MockNubPort {
    num_groups: u32,
    callback_group_interval: u32,
    local_node_id: u16,
    channel: Arc<Mutex<u32>>,
    opened: AtomicBool,
    running: Arc<AtomicBool>,
    failures: InjectedFailures,
    state: Arc<Mutex<TickerState>>,
    ticker: Option<JoinHandle<()>>,
    notify_calls: Arc<AtomicU32>,
}

impl MockNubPort {
    /// Build a mock port for a stream with `num_groups` total groups, firing
    /// a completion callback every `callback_group_interval` groups.
    pub fn new(num_groups: u32, callback_group_interval: u32) -> Self {
        MockNubPort::with_failures(num_groups, callback_group_interval, InjectedFailures::default())
    }

    pub fn with_failures(num_groups: u32, callback_group_interval: u32, failures: InjectedFailures) -> Self {
        MockNubPort {
            num_groups,
            callback_group_interval,
            local_node_id: 1,
            channel: Arc::new(Mutex::new(0)),
            opened: AtomicBool::new(false),
            running: Arc::new(AtomicBool::new(false)),
            failures,
            state: Arc::new(Mutex::new(TickerState {
                sink: None,
                group_cursor: 0,
                ticks: 0,
            })),
            ticker: None,
            notify_calls: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Total `notify_segment_update` calls observed so far (test diagnostic).
    pub fn notify_call_count(&self) -> u32 {
        self.notify_calls.load(Ordering::Relaxed)
    }
}

impl NubPort for MockNubPort {
    fn open(&mut self, _initial_speed: BusSpeed, initial_channel: u32) -> Result<()> {
        if self.failures.fail_open {
            return Err(TransmitError::NoDevice);
        }
        *self.channel.lock().unwrap() = if initial_channel == fwa_core::nub::ANY_CHANNEL {
            0
        } else {
            initial_channel
        };
        self.opened.store(true, Ordering::Release);
        info!("mock nub port opened");
        Ok(())
    }

    fn local_node_id(&self) -> Result<u16> {
        if !self.opened.load(Ordering::Acquire) {
            return Err(TransmitError::NotReady);
        }
        Ok(self.local_node_id)
    }

    fn isoch_channel(&self) -> Result<u32> {
        if !self.opened.load(Ordering::Acquire) {
            return Err(TransmitError::NotReady);
        }
        Ok(*self.channel.lock().unwrap())
    }

    fn set_event_sink(&mut self, sink: Box<dyn PortEventSink>) {
        self.state.lock().unwrap().sink = Some(sink);
    }

    fn start(&mut self) -> Result<()> {
        if !self.opened.load(Ordering::Acquire) {
            return Err(TransmitError::NotReady);
        }
        if self.failures.fail_start {
            return Err(TransmitError::NoDevice);
        }
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(()); // already running
        }

        let running = self.running.clone();
        let state = self.state.clone();
        let num_groups = self.num_groups;
        let interval = self.callback_group_interval.max(1);
        let overrun_after = self.failures.overrun_after_ticks;

        self.ticker = Some(
            thread::Builder::new()
                .name("fwa-mock-nub-ticker".into())
                .spawn(move || {
                    while running.load(Ordering::Acquire) {
                        thread::sleep(CYCLE_DURATION * interval);
                        if !running.load(Ordering::Acquire) {
                            break;
                        }
                        let mut guard = state.lock().unwrap();
                        guard.ticks += 1;
                        let completed_group = guard.group_cursor;
                        guard.group_cursor = (guard.group_cursor + interval) % num_groups.max(1);

                        let fire_overrun =
                            overrun_after.is_some_and(|n| guard.ticks == n);
                        if let Some(sink) = guard.sink.as_mut() {
                            if fire_overrun {
                                sink.on_event(PortEvent::Overrun);
                            } else {
                                sink.on_event(PortEvent::GroupComplete {
                                    group_index: completed_group,
                                    timestamp_encoded: guard.ticks,
                                });
                            }
                        }
                    }
                })
                .expect("spawning the mock ticker thread should not fail under normal operation"),
        );
        info!("mock nub port started");
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if !self.running.swap(false, Ordering::AcqRel) {
            return Ok(()); // already stopped
        }
        if let Some(handle) = self.ticker.take() {
            let _ = handle.join();
        }
        info!("mock nub port stopped");
        Ok(())
    }

    fn notify_segment_update(&mut self, segment: SegmentHandle) -> Result<()> {
        if !self.running.load(Ordering::Acquire) && !self.opened.load(Ordering::Acquire) {
            return Err(TransmitError::NotReady);
        }
        self.notify_calls.fetch_add(1, Ordering::Relaxed);
        debug!(
            group_index = segment.group_index,
            count = segment.descriptor_count,
            "mock nub port notify_segment_update"
        );
        Ok(())
    }

    fn notify_jump_fixup(&mut self) -> Result<()> {
        debug!("mock nub port notify_jump_fixup");
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let _ = self.stop();
        if self.opened.swap(false, Ordering::AcqRel) {
            info!("mock nub port closed");
        }
        Ok(())
    }
}

impl Drop for MockNubPort {
    fn drop(&mut self) {
        if self.running.load(Ordering::Acquire) {
            warn!("dropping a mock nub port that was never stopped");
        }
        let _ = self.stop();
    }
}
