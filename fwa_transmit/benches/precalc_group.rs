use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use fwa_transmit::precalc::PreCalculator;
use fwa_transmit::{SytStyle, TransmitConfig};

const SAMPLE_RATES: [u32; 2] = [44_100, 48_000];

/// One group's worth of synchronous CIP computation, exercising the same
/// per-packet decision rule and DBC update the background producer thread
/// runs per group, without paying for thread spin-up inside the measured
/// loop.
fn bench_group_compute(c: &mut Criterion, style: SytStyle, label: &str) {
    let mut group = c.benchmark_group(format!("precalc_group_compute_{label}"));

    for sample_rate in SAMPLE_RATES {
        group.throughput(Throughput::Elements(8));

        let bench_id = BenchmarkId::from_parameter(sample_rate);
        group.bench_with_input(bench_id, &sample_rate, |b, &sample_rate| {
            let config = TransmitConfig {
                sample_rate,
                syt_style: style,
                ..TransmitConfig::default()
            };
            let precalc = PreCalculator::new(&config);
            precalc.mark_timing_established();

            b.iter(|| {
                for i in 0..config.packets_per_group {
                    let packet = precalc.emergency_calculate_cip(i);
                    black_box(packet);
                }
            });
        });
    }

    group.finish();
}

fn bench_group_compute_phase(c: &mut Criterion) {
    bench_group_compute(c, SytStyle::Phase, "phase");
}

fn bench_group_compute_apple_dda(c: &mut Criterion) {
    bench_group_compute(c, SytStyle::AppleDda, "apple_dda");
}

criterion_group!(precalc_group_benches, bench_group_compute_phase, bench_group_compute_apple_dda);
criterion_main!(precalc_group_benches);
