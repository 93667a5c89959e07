//! Property-based tests for mixing and timestamp rebasing
//!
//! Run with: cargo test --test pipeline_props

use proptest::prelude::*;
use screenrec::audio::{mix, mix_in_place};
use screenrec::recording::{MuxerGate, WriteOutcome, H264_MIME};
use screenrec::testing::RecordingWriter;
use screenrec::timing::{SampleClock, ZeroReference};
use screenrec::types::{ChunkFlags, EncodedChunk, TrackFormat, TrackKind};

proptest! {
    /// Mixed output is as long as the shorter input and each sample is the clamped sum
    #[test]
    fn mix_is_clamped_sum(
        a in prop::collection::vec(any::<i16>(), 0..512),
        b in prop::collection::vec(any::<i16>(), 0..512),
    ) {
        let out = mix(&a, &b);
        prop_assert_eq!(out.len(), a.len().min(b.len()));
        for (i, sample) in out.iter().enumerate() {
            let expected = (a[i] as i32 + b[i] as i32).clamp(i16::MIN as i32, i16::MAX as i32);
            prop_assert_eq!(*sample as i32, expected);
        }
    }

    /// Mixing in place agrees with the allocating mix and leaves the tail untouched
    #[test]
    fn mix_in_place_matches_mix(
        a in prop::collection::vec(any::<i16>(), 0..256),
        b in prop::collection::vec(any::<i16>(), 0..256),
    ) {
        let mut dst = a.clone();
        let mixed = mix_in_place(&mut dst, &b);
        prop_assert_eq!(mixed, a.len().min(b.len()));
        prop_assert_eq!(&dst[..mixed], &mix(&a, &b)[..]);
        prop_assert_eq!(&dst[mixed..], &a[mixed..]);
    }

    /// Sample-clock timestamps never decrease and match frames / rate
    #[test]
    fn sample_clock_is_monotonic(reads in prop::collection::vec(0usize..4096, 1..64)) {
        let mut clock = SampleClock::new(44_100);
        let mut last = clock.pts_us();
        let mut total = 0u64;
        for frames in reads {
            clock.advance(frames);
            total += frames as u64;
            let pts = clock.pts_us();
            prop_assert!(pts >= last);
            prop_assert_eq!(pts, (total * 1_000_000 / 44_100) as i64);
            last = pts;
        }
    }

    /// Rebasing makes the first value zero and preserves distances
    #[test]
    fn rebase_preserves_offsets(
        origin in 0i64..10_000_000_000,
        deltas in prop::collection::vec(0i64..1_000_000, 1..32),
    ) {
        let zero = ZeroReference::new();
        prop_assert_eq!(zero.rebase(origin), 0);
        for delta in deltas {
            prop_assert_eq!(zero.rebase(origin + delta), delta);
        }
        prop_assert_eq!(zero.origin(), Some(origin));
    }

    /// Whatever order timestamps arrive in, the gate writes a zero-based,
    /// non-decreasing sequence
    #[test]
    fn gate_output_is_zero_based_and_monotonic(
        pts in prop::collection::vec(0i64..50_000_000, 1..64),
    ) {
        let (writer, log) = RecordingWriter::new();
        let gate = MuxerGate::new(Box::new(writer), false);
        gate.register_track(&TrackFormat::Video {
            mime: H264_MIME.to_string(),
            width: 640,
            height: 480,
            frame_rate: 30,
            codec_config: None,
        }).unwrap();
        gate.begin_if_ready().unwrap();

        for value in &pts {
            let chunk = EncodedChunk::new(TrackKind::Video, vec![1u8], *value, ChunkFlags::default());
            let outcome = gate.write(&chunk).unwrap();
            let written = matches!(outcome, WriteOutcome::Written { pts_us: _ });
            prop_assert!(written, "chunk at {} was not written", value);
        }

        let written: Vec<i64> = log.samples().iter().map(|s| s.pts_us).collect();
        prop_assert_eq!(written.len(), pts.len());
        prop_assert_eq!(written[0], 0);
        prop_assert!(written.windows(2).all(|w| w[1] >= w[0]));
    }
}
