//! Benchmarks for sweep generation and paced segments
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use rtsa_streamer::clock::VirtualClock;
use rtsa_streamer::device::{Device, SimulatedDevice};
use rtsa_streamer::protocol::Packet;
use rtsa_streamer::streaming::{BlockSource, PacerConfig, PacketMetadata, Pacer, SweepSource};

fn bench_sweep_generation(c: &mut Criterion) {
    let mut group = c.benchmark_group("sweep_generation");

    for samples in [1024usize, 16384, 65536].iter() {
        group.throughput(Throughput::Elements(*samples as u64));
        group.bench_with_input(BenchmarkId::from_parameter(samples), samples, |b, &samples| {
            b.iter(|| black_box(SweepSource::reference(samples)));
        });
    }

    group.finish();
}

fn bench_peak_magnitude(c: &mut Criterion) {
    let mut source = SweepSource::reference(16384);
    let block = source.block(0).to_vec();

    c.bench_function("peak_magnitude_16384", |b| {
        b.iter(|| black_box(Packet::iq(&block).peak_magnitude()));
    });
}

fn bench_paced_segment(c: &mut Criterion) {
    let mut group = c.benchmark_group("paced_segment");
    group.throughput(Throughput::Elements(100));

    group.bench_function("100x16384_virtual_clock", |b| {
        b.iter(|| {
            let clock = VirtualClock::new(0.0);
            let driver = SimulatedDevice::transmitter(clock.clone()).with_startup_polls(0);
            let mut device = Device::new(driver, "spectranv6/iqtransmitter", "SIM000001");
            device.connect().ok();
            device.start().ok();
            device.state();

            let mut source = SweepSource::reference(16384);
            let mut pacer = Pacer::with_sleeper(PacerConfig::default(), PacketMetadata::default(), clock)
                .expect("default config is valid");
            black_box(pacer.run_segment(&device, &mut source, 100).ok())
        });
    });

    group.finish();
}

criterion_group!(benches, bench_sweep_generation, bench_peak_magnitude, bench_paced_segment);

criterion_main!(benches);
