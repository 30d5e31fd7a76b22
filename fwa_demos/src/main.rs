//! Runs the transmit core end to end against a simulated isochronous port,
//! feeding it from either the default `cpal` input device or, when none is
//! present, a quiet synthetic tone, and prints the client notifications and
//! running DBC-violation count until interrupted.
//!
//! ```bash
//! cargo run --release -p fwa_demos
//! ```

mod tone;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use fwa_core::nub::{BusSpeed, ANY_CHANNEL};
use fwa_port::MockNubPort;
use fwa_transmit::shm::LocalAudioRing;
use fwa_transmit::{TransmitConfig, Transmitter, TransmitterMessage};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::tone::ToneGenerator;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = TransmitConfig::classic();
    let ring = LocalAudioRing::new(config.sample_rate, config.num_channels, config.num_channels * 4);
    let port = Box::new(MockNubPort::new(config.num_groups, config.callback_group_interval));

    let transmitter = Arc::new(Transmitter::initialize(config.clone(), ring, port).expect("valid demo configuration"));
    transmitter.set_message_callback(Box::new(|message| match message {
        TransmitterMessage::StreamStarted => info!("stream started"),
        TransmitterMessage::StreamStopped => info!("stream stopped"),
        TransmitterMessage::BufferUnderrun { segment, packet } => {
            info!(segment, packet, "buffer underrun, emitting silence")
        }
        TransmitterMessage::DbcContinuityViolation { segment, packet } => {
            info!(segment, packet, "DBC continuity violation detected")
        }
        TransmitterMessage::OverrunError => info!("DCL overrun"),
        TransmitterMessage::OverrunRecoveryAttempt => info!("attempting overrun recovery"),
        TransmitterMessage::OverrunRecoveryFailed => info!("overrun recovery failed"),
        other => info!(?other, "transmitter notification"),
    }));

    transmitter.configure(BusSpeed::S400, ANY_CHANNEL).expect("mock port always opens");

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = Arc::clone(&running);
        ctrlc::set_handler(move || running.store(false, Ordering::SeqCst)).expect("error setting Ctrl-C handler");
    }

    let _input = start_input_source(&transmitter, &config, Arc::clone(&running));

    transmitter.start_transmit().expect("start_transmit should succeed against the mock port");

    let start = Instant::now();
    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(500));
        info!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            dbc_violations = transmitter.dbc_violation_count(),
            "transmitter heartbeat"
        );
    }

    transmitter.stop_transmit().expect("stop_transmit should succeed");
    info!("demo exiting");
}

/// Either a live `cpal` input stream or a background thread pushing a
/// synthetic tone, kept alive for as long as the returned value lives.
enum InputSource {
    Captured(cpal::Stream),
    Synthetic(std::thread::JoinHandle<()>),
}

fn start_input_source(
    transmitter: &Arc<Transmitter<LocalAudioRing>>,
    config: &TransmitConfig,
    running: Arc<AtomicBool>,
) -> InputSource {
    match try_build_capture_stream(transmitter, config) {
        Some(stream) => {
            stream.play().expect("failed to start capture stream");
            info!("capturing from the default input device");
            InputSource::Captured(stream)
        }
        None => {
            info!("no capture device available, falling back to a synthetic tone");
            InputSource::Synthetic(spawn_tone_source(transmitter, config, running))
        }
    }
}

fn try_build_capture_stream(
    transmitter: &Arc<Transmitter<LocalAudioRing>>,
    config: &TransmitConfig,
) -> Option<cpal::Stream> {
    let host = cpal::default_host();
    let device = host.default_input_device()?;
    let stream_config = device.default_input_config().ok()?;

    let channels = config.num_channels;
    let sample_rate = config.sample_rate;
    let transmitter = Arc::clone(transmitter);

    let stream = device
        .build_input_stream(
            &stream_config.config(),
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let mut bytes = Vec::with_capacity(data.len() * 4);
                for &sample in data {
                    let clamped = sample.clamp(-1.0, 1.0);
                    let scaled = (clamped * (1i32 << 23) as f32) as i32;
                    bytes.extend_from_slice(&scaled.to_le_bytes());
                }
                let _ = transmitter.push_audio_data(now_nanos(), &bytes);
            },
            move |err| tracing::error!(%err, "capture stream error"),
            None,
        )
        .ok()?;

    let _ = (channels, sample_rate); // format validated by the ring's bind() on construction
    Some(stream)
}

fn spawn_tone_source(
    transmitter: &Arc<Transmitter<LocalAudioRing>>,
    config: &TransmitConfig,
    running: Arc<AtomicBool>,
) -> std::thread::JoinHandle<()> {
    let transmitter = Arc::clone(transmitter);
    let generator = ToneGenerator::new(config.num_channels);
    let frames_per_chunk = 1024usize;
    let bytes_per_chunk = frames_per_chunk * config.num_channels as usize * 4;
    let period = Duration::from_secs_f64(frames_per_chunk as f64 / config.sample_rate as f64);

    std::thread::Builder::new()
        .name("fwa-demo-tone".into())
        .spawn(move || {
            let mut buf = vec![0u8; bytes_per_chunk];
            while running.load(Ordering::SeqCst) {
                generator.fill(&mut buf, frames_per_chunk);
                let _ = transmitter.push_audio_data(now_nanos(), &buf);
                std::thread::sleep(period);
            }
        })
        .expect("spawning the tone source thread should not fail under normal operation")
}

fn now_nanos() -> u64 {
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_nanos() as u64
}
