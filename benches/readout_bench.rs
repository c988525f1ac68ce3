use std::time::Duration;

use camd::chip::CameraChip;
use camd::queue::ExposureRequest;
use camd::simulator::{SimulatedChip, SimulatedChipConfig};
use camd::statistics::ReadoutStatistics;
use camd::{DataType, MemoryConnection, ReadoutStatus, Shutter};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

fn chip(size: u32, statistics: bool) -> CameraChip {
    let config = SimulatedChipConfig {
        width: size,
        height: size,
        rows_per_poll: 64,
        ..SimulatedChipConfig::default()
    };
    CameraChip::new(0, Box::new(SimulatedChip::new(config)), statistics).unwrap()
}

fn read_frame(chip: &mut CameraChip, number: u64) -> u64 {
    let client = MemoryConnection::new("bench").shared();
    let request = ExposureRequest::new(0, Shutter::Light, Duration::ZERO, client);
    chip.start_exposure(request, number, None).unwrap();
    chip.end_exposure();
    chip.start_readout(None).unwrap();
    while chip.do_readout() != Some(ReadoutStatus::Complete) {}
    chip.end_readout(true).map_or(0, |s| s.bytes_sent)
}

fn benchmark_frame_readout(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_readout");
    for size in [256u32, 1024] {
        group.throughput(Throughput::Bytes(u64::from(size) * u64::from(size) * 2));
        for statistics in [false, true] {
            let id = BenchmarkId::new(if statistics { "with_stats" } else { "plain" }, size);
            group.bench_with_input(id, &size, |b, &size| {
                let mut chip = chip(size, statistics);
                let mut number = 0;
                b.iter(|| {
                    number += 1;
                    black_box(read_frame(&mut chip, number));
                });
            });
        }
    }
    group.finish();
}

fn benchmark_statistics_update(c: &mut Criterion) {
    let data: Vec<u8> = (0..1_048_576u32).map(|i| (i % 251) as u8).collect();
    let mut group = c.benchmark_group("statistics_update");
    group.throughput(Throughput::Bytes(data.len() as u64));
    for chunk in [4096usize, 4097] {
        group.bench_with_input(BenchmarkId::from_parameter(chunk), &chunk, |b, &chunk| {
            b.iter(|| {
                let mut stats = ReadoutStatistics::new(DataType::UShort, 1);
                for piece in data.chunks(chunk) {
                    stats.update(0, piece);
                }
                black_box(stats.summary());
            });
        });
    }
    group.finish();
}

criterion_group!(benches, benchmark_frame_readout, benchmark_statistics_update);
criterion_main!(benches);
