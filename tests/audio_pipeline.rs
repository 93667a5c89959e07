//! Audio capture loop against scripted devices and encoders

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use screenrec::audio::{AudioCaptureLoop, AudioSources};
use screenrec::invariant_ppt::{clear_invariant_log, contract_test, MIX_BOUNDED_BY_SLOWER_SOURCE};
use screenrec::platform::AudioInput;
use screenrec::testing::{ScriptedEncoder, ScriptedInput};
use screenrec::ScreenRecConfig;

fn capture_loop(
    sources: AudioSources,
    encoder: Arc<ScriptedEncoder>,
    running: Arc<AtomicBool>,
) -> AudioCaptureLoop {
    AudioCaptureLoop::new(
        sources,
        encoder,
        running,
        1024,
        &ScreenRecConfig::default().pipeline,
    )
}

fn mixed(media: ScriptedInput, mic: ScriptedInput) -> AudioSources {
    AudioSources::media_and_mic(Box::new(media), Box::new(mic))
}

#[test]
fn contract_mixing_is_bounded_by_slower_source() {
    clear_invariant_log();
    let encoder = Arc::new(ScriptedEncoder::audio_input(8192));
    let mut capture = capture_loop(
        mixed(ScriptedInput::new(vec![400], 10), ScriptedInput::new(vec![380], 10)),
        encoder,
        Arc::new(AtomicBool::new(true)),
    );
    assert_eq!(capture.step().unwrap(), 380);
    contract_test("mix", &[MIX_BOUNDED_BY_SLOWER_SOURCE]);
}

#[test]
fn timestamps_follow_frames_fed_not_wall_clock() {
    let encoder = Arc::new(ScriptedEncoder::audio_input(8192));
    let media = ScriptedInput::new(vec![441, 882], 1).with_delay(Duration::from_millis(3));
    let mut capture = capture_loop(
        AudioSources::media_only(Box::new(media)),
        encoder.clone(),
        Arc::new(AtomicBool::new(true)),
    );

    for _ in 0..4 {
        capture.step().unwrap();
    }
    let pts: Vec<i64> = encoder.queued_inputs().iter().map(|q| q.pts_us).collect();
    assert_eq!(pts, vec![0, 10_000, 30_000, 40_000]);
    assert_eq!(capture.clock().frames(), 441 * 2 + 882 * 2);
}

#[test]
fn mixed_samples_saturate() {
    let encoder = Arc::new(ScriptedEncoder::audio_input(8192));
    let mut capture = capture_loop(
        mixed(ScriptedInput::new(vec![256], -30_000), ScriptedInput::new(vec![256], -30_000)),
        encoder.clone(),
        Arc::new(AtomicBool::new(true)),
    );
    capture.step().unwrap();
    assert_eq!(encoder.queued_inputs()[0].first_sample, Some(i16::MIN));
}

#[test]
fn run_ends_with_single_end_of_stream_and_releases_devices() {
    let encoder = Arc::new(ScriptedEncoder::audio_input(8192));
    let media = ScriptedInput::new(vec![512], 5).with_delay(Duration::from_millis(1));
    let mic = ScriptedInput::new(vec![512], 5).with_delay(Duration::from_millis(1));
    let media_released = media.released_flag();
    let mic_released = mic.released_flag();

    let running = Arc::new(AtomicBool::new(true));
    let capture = capture_loop(mixed(media, mic), encoder.clone(), running.clone());
    let worker = thread::spawn(move || capture.run());

    thread::sleep(Duration::from_millis(30));
    running.store(false, Ordering::SeqCst);
    let summary = worker.join().unwrap().unwrap();

    assert!(summary.iterations > 0);
    assert!(summary.end_of_stream_sent);
    let inputs = encoder.queued_inputs();
    assert_eq!(inputs.iter().filter(|q| q.end_of_stream).count(), 1);
    assert!(inputs.last().unwrap().end_of_stream);
    assert!(media_released.load(Ordering::SeqCst));
    assert!(mic_released.load(Ordering::SeqCst));
}

#[test]
fn read_failure_still_signals_end_of_stream() {
    let encoder = Arc::new(ScriptedEncoder::audio_input(8192));
    let media = ScriptedInput::new(vec![512], 5).failing_after(2);
    let released = media.released_flag();

    let capture = capture_loop(
        AudioSources::media_only(Box::new(media)),
        encoder.clone(),
        Arc::new(AtomicBool::new(true)),
    );
    let result = capture.run();

    assert!(result.is_err());
    assert!(encoder.queued_inputs().iter().any(|q| q.end_of_stream));
    assert!(released.load(Ordering::SeqCst));
}

#[test]
fn sources_release_is_idempotent() {
    let media = ScriptedInput::new(vec![128], 0);
    let released = media.released_flag();
    let mut sources = AudioSources::media_only(Box::new(media));
    assert!(!sources.is_mixing());

    sources.release_all().unwrap();
    sources.release_all().unwrap();
    assert!(released.load(Ordering::SeqCst));
}

#[test]
fn scripted_input_reports_whole_frames() {
    let mut input = ScriptedInput::new(vec![100], 7);
    input.start().unwrap();
    let mut buf = vec![0i16; 2048];
    assert_eq!(input.read(&mut buf, Duration::from_millis(10)).unwrap(), 100);
    assert_eq!(buf[199], 7);
    assert_eq!(buf[200], 0);
}
