//! Container muxer gate
//!
//! Container formats need every track declared before the first sample, but
//! the encoders learn their output formats independently and in no fixed
//! order. The gate collects track registrations, starts the writer exactly
//! once when every expected track is known, and drops anything written
//! before that point.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use serde::Serialize;

use crate::assert_invariant;
use crate::errors::RecorderError;
use crate::invariant_ppt::{
    FINISH_AT_MOST_ONCE, FIRST_PTS_IS_ZERO, GATE_START_REQUIRES_TRACKS, NO_WRITE_BEFORE_START,
    TRACK_PTS_NON_DECREASING,
};
use crate::platform::ContainerWriter;
use crate::timing::ZeroReference;
use crate::types::{EncodedChunk, TrackFormat, TrackKind};

/// Per-track write counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TrackStats {
    pub registered: bool,
    pub samples: u64,
    pub bytes: u64,
    /// Chunks dropped because the gate had not opened yet
    pub discarded: u64,
    /// Chunks whose rebased timestamp was raised to keep the track monotonic
    pub clamped: u64,
    pub last_pts_us: Option<i64>,
}

/// Snapshot of what reached the container
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MuxStats {
    pub started: bool,
    pub expects_audio: bool,
    pub video: TrackStats,
    pub audio: TrackStats,
    /// Wall-clock distance from the first video write to the first audio
    /// write. Positive when audio started later.
    pub first_write_offset_us: Option<i64>,
}

impl MuxStats {
    pub fn samples_written(&self) -> u64 {
        self.video.samples + self.audio.samples
    }

    pub fn track(&self, kind: TrackKind) -> &TrackStats {
        match kind {
            TrackKind::Video => &self.video,
            TrackKind::Audio => &self.audio,
        }
    }

    /// Tracks that were declared to the container
    pub fn track_count(&self) -> usize {
        [self.video.registered, self.audio.registered]
            .iter()
            .filter(|r| **r)
            .count()
    }
}

/// What happened to a chunk handed to [`MuxerGate::write`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written { pts_us: i64 },
    Discarded,
}

#[derive(Default)]
struct TrackSlot {
    index: Option<usize>,
    stats: TrackStats,
    first_write_at: Option<Instant>,
}

struct GateInner {
    writer: Option<Box<dyn ContainerWriter>>,
    video: TrackSlot,
    audio: TrackSlot,
    finished: bool,
}

impl GateInner {
    fn slot(&mut self, kind: TrackKind) -> &mut TrackSlot {
        match kind {
            TrackKind::Video => &mut self.video,
            TrackKind::Audio => &mut self.audio,
        }
    }
}

pub struct MuxerGate {
    inner: Mutex<GateInner>,
    started: AtomicBool,
    expects_audio: bool,
    video_zero: ZeroReference,
    audio_zero: ZeroReference,
}

impl MuxerGate {
    /// Gate over `writer`; a video track is always expected, audio only if asked
    pub fn new(writer: Box<dyn ContainerWriter>, expects_audio: bool) -> Self {
        Self {
            inner: Mutex::new(GateInner {
                writer: Some(writer),
                video: TrackSlot::default(),
                audio: TrackSlot::default(),
                finished: false,
            }),
            started: AtomicBool::new(false),
            expects_audio,
            video_zero: ZeroReference::new(),
            audio_zero: ZeroReference::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn expects_audio(&self) -> bool {
        self.expects_audio
    }

    pub fn has_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Zero-reference marker of a track
    pub fn zero_reference(&self, kind: TrackKind) -> &ZeroReference {
        match kind {
            TrackKind::Video => &self.video_zero,
            TrackKind::Audio => &self.audio_zero,
        }
    }

    /// Declare a track to the container, returning its container index
    pub fn register_track(&self, format: &TrackFormat) -> Result<usize, RecorderError> {
        let kind = format.kind();
        if kind == TrackKind::Audio && !self.expects_audio {
            return Err(RecorderError::Muxing(
                "audio track offered to a video-only session".to_string(),
            ));
        }

        let mut inner = self.lock();
        if inner.finished || self.has_started() {
            return Err(RecorderError::Muxing(format!(
                "{} track registered after the container started",
                kind
            )));
        }
        if inner.slot(kind).index.is_some() {
            return Err(RecorderError::Muxing(format!("{} track registered twice", kind)));
        }

        let writer = inner
            .writer
            .as_mut()
            .ok_or_else(|| RecorderError::Muxing("container writer already released".to_string()))?;
        let index = writer.add_track(format)?;

        let slot = inner.slot(kind);
        slot.index = Some(index);
        slot.stats.registered = true;
        log::info!("Registered {} track ({}) as index {}", kind, format.mime(), index);
        Ok(index)
    }

    fn ready(&self, inner: &GateInner) -> bool {
        inner.video.index.is_some() && (!self.expects_audio || inner.audio.index.is_some())
    }

    /// Start the writer if every expected track is registered
    ///
    /// Returns `true` only for the call that actually started it.
    pub fn begin_if_ready(&self) -> Result<bool, RecorderError> {
        let mut inner = self.lock();
        if self.has_started() || inner.finished || !self.ready(&inner) {
            return Ok(false);
        }

        assert_invariant!(
            self.ready(&inner),
            GATE_START_REQUIRES_TRACKS,
            "MuxerGate::begin_if_ready"
        );

        let writer = inner
            .writer
            .as_mut()
            .ok_or_else(|| RecorderError::Muxing("container writer already released".to_string()))?;
        writer.start()?;
        self.started.store(true, Ordering::Release);
        log::info!(
            "Container started with {} track(s)",
            if self.expects_audio { 2 } else { 1 }
        );
        Ok(true)
    }

    /// Write one encoded chunk, rebasing its timestamp onto the track's origin
    ///
    /// Chunks arriving before the container started are dropped, not buffered.
    pub fn write(&self, chunk: &EncodedChunk) -> Result<WriteOutcome, RecorderError> {
        let kind = chunk.track;
        let mut inner = self.lock();

        if !self.has_started() || inner.finished {
            inner.slot(kind).stats.discarded += 1;
            log::debug!("Dropped {} chunk at {}us before container start", kind, chunk.pts_us);
            return Ok(WriteOutcome::Discarded);
        }
        if chunk.flags.config || chunk.is_empty() {
            return Ok(WriteOutcome::Discarded);
        }

        let index = inner
            .slot(kind)
            .index
            .ok_or_else(|| RecorderError::Muxing(format!("{} track was never registered", kind)))?;

        let rebased = self.zero_reference(kind).rebase(chunk.pts_us);
        let slot = inner.slot(kind);
        let pts_us = match slot.stats.last_pts_us {
            Some(last) if rebased < last => {
                slot.stats.clamped += 1;
                log::warn!("{} timestamp went backwards ({} < {}), clamping", kind, rebased, last);
                last
            }
            _ => rebased,
        };

        if slot.stats.samples == 0 {
            assert_invariant!(pts_us == 0, FIRST_PTS_IS_ZERO, "MuxerGate::write");
        }
        assert_invariant!(
            slot.stats.last_pts_us.map_or(true, |last| pts_us >= last),
            TRACK_PTS_NON_DECREASING,
            "MuxerGate::write"
        );
        assert_invariant!(self.has_started(), NO_WRITE_BEFORE_START, "MuxerGate::write");

        let writer = inner
            .writer
            .as_mut()
            .ok_or_else(|| RecorderError::Muxing("container writer already released".to_string()))?;
        writer.write_sample(index, &chunk.with_pts(pts_us))?;

        let slot = inner.slot(kind);
        slot.stats.samples += 1;
        slot.stats.bytes += chunk.data.len() as u64;
        slot.stats.last_pts_us = Some(pts_us);
        if slot.first_write_at.is_none() {
            slot.first_write_at = Some(Instant::now());
        }
        Ok(WriteOutcome::Written { pts_us })
    }

    pub fn stats(&self) -> MuxStats {
        let inner = self.lock();
        self.snapshot(&inner)
    }

    fn snapshot(&self, inner: &GateInner) -> MuxStats {
        let first_write_offset_us = match (inner.video.first_write_at, inner.audio.first_write_at) {
            (Some(video), Some(audio)) => Some(if audio >= video {
                audio.duration_since(video).as_micros() as i64
            } else {
                -(video.duration_since(audio).as_micros() as i64)
            }),
            _ => None,
        };

        MuxStats {
            started: self.has_started(),
            expects_audio: self.expects_audio,
            video: inner.video.stats.clone(),
            audio: inner.audio.stats.clone(),
            first_write_offset_us,
        }
    }

    /// Stop and release the writer. Only valid once; both drain workers must
    /// have exited first.
    pub fn finish(&self) -> Result<MuxStats, RecorderError> {
        let mut inner = self.lock();
        if inner.finished {
            return Err(RecorderError::Muxing("container already finished".to_string()));
        }
        assert_invariant!(!inner.finished, FINISH_AT_MOST_ONCE, "MuxerGate::finish");
        inner.finished = true;

        let stats = self.snapshot(&inner);
        let mut writer = inner
            .writer
            .take()
            .ok_or_else(|| RecorderError::Muxing("container writer already released".to_string()))?;
        drop(inner);

        let stopped = if stats.started { writer.stop() } else { Ok(()) };
        let released = writer.release();
        stopped?;
        released?;

        log::info!(
            "Container finished: {} video / {} audio samples",
            stats.video.samples,
            stats.audio.samples
        );
        Ok(stats)
    }
}
