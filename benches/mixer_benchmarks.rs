//! Benchmarks for the per-block hot paths of the audio pipeline
//!
//! Run with: cargo bench
//!
//! Every device read goes through the mixer and every encoded chunk through
//! the muxer gate, so both must stay far below one block period (~23 ms for
//! 1024 frames at 44.1 kHz).

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use screenrec::audio::{mix, mix_in_place};
use screenrec::platform::ContainerWriter;
use screenrec::recording::{MuxerGate, H264_MIME};
use screenrec::testing::synthetic_pcm_block;
use screenrec::RecorderError;
use screenrec::timing::SampleClock;
use screenrec::types::{ChunkFlags, EncodedChunk, TrackFormat, TrackKind};

/// Accepts everything and keeps nothing
struct NullWriter;

impl ContainerWriter for NullWriter {
    fn add_track(&mut self, _format: &TrackFormat) -> Result<usize, RecorderError> {
        Ok(0)
    }

    fn start(&mut self) -> Result<(), RecorderError> {
        Ok(())
    }

    fn write_sample(&mut self, _track_index: usize, chunk: &EncodedChunk) -> Result<(), RecorderError> {
        black_box(chunk.data.len());
        Ok(())
    }

    fn stop(&mut self) -> Result<(), RecorderError> {
        Ok(())
    }

    fn release(&mut self) -> Result<(), RecorderError> {
        Ok(())
    }
}

fn bench_mix(c: &mut Criterion) {
    let mut group = c.benchmark_group("PCM Mixing");

    for frames in [256usize, 1024, 4096] {
        let media = synthetic_pcm_block(0, frames);
        let mic = synthetic_pcm_block(1, frames);
        group.throughput(Throughput::Elements(frames as u64));

        group.bench_with_input(BenchmarkId::new("mix", frames), &frames, |b, _| {
            b.iter(|| mix(black_box(&media.samples), black_box(&mic.samples)))
        });

        group.bench_with_input(BenchmarkId::new("mix_in_place", frames), &frames, |b, _| {
            let mut dst = media.samples.clone();
            b.iter(|| mix_in_place(black_box(&mut dst), black_box(&mic.samples)))
        });
    }

    group.finish();
}

fn bench_sample_clock(c: &mut Criterion) {
    c.bench_function("sample_clock_advance", |b| {
        let mut clock = SampleClock::new(44_100);
        b.iter(|| {
            clock.advance(black_box(1024));
            black_box(clock.pts_us())
        })
    });
}

fn bench_gate_write(c: &mut Criterion) {
    let gate = MuxerGate::new(Box::new(NullWriter), false);
    gate.register_track(&TrackFormat::Video {
        mime: H264_MIME.to_string(),
        width: 1080,
        height: 2400,
        frame_rate: 30,
        codec_config: None,
    })
    .unwrap();
    gate.begin_if_ready().unwrap();

    let payload = bytes::Bytes::from(vec![0u8; 16 * 1024]);
    let mut pts = 0i64;
    c.bench_function("muxer_gate_write_16k", |b| {
        b.iter(|| {
            pts += 33_333;
            let chunk = EncodedChunk::new(TrackKind::Video, payload.clone(), pts, ChunkFlags::default());
            black_box(gate.write(&chunk).unwrap())
        })
    });
}

criterion_group!(benches, bench_mix, bench_sample_clock, bench_gate_write);
criterion_main!(benches);
