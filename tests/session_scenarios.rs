//! End-to-end session scenarios against the in-memory host
//!
//! Run with: cargo test --test session_scenarios

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use screenrec::recording::{Command, CommandOutcome, OutputDisposition, StopReason};
use screenrec::testing::{FakeHost, FakeHostOptions, HostEvent};
use screenrec::types::{AudioMode, SessionState, TrackKind};
use screenrec::{RecorderError, ScreenRecConfig, SessionController};

fn setup(options: FakeHostOptions) -> (SessionController, Arc<FakeHost>) {
    let host = Arc::new(FakeHost::with_options(options));
    let controller = SessionController::new(host.clone(), ScreenRecConfig::default()).unwrap();
    (controller, host)
}

fn wait_until_idle(controller: &SessionController) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while controller.state() != SessionState::Idle && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(controller.state(), SessionState::Idle);
}

#[test]
fn mismatched_reads_advance_by_the_shorter_read() {
    let (controller, host) = setup(FakeHostOptions {
        media_reads: vec![400],
        mic_reads: vec![380],
        ..FakeHostOptions::default()
    });
    let (auth, _) = host.authorization();
    controller.start(Box::new(auth), AudioMode::MediaAndMic).unwrap();
    thread::sleep(Duration::from_millis(40));
    let report = controller.stop().unwrap();

    let inputs: Vec<_> = host
        .encoder(TrackKind::Audio)
        .unwrap()
        .queued_inputs()
        .into_iter()
        .filter(|q| !q.end_of_stream)
        .collect();
    assert!(inputs.len() >= 2);
    assert_eq!(inputs[0].pts_us, 0);
    assert_eq!(inputs[1].pts_us, 8_616);
    assert!(inputs.iter().all(|q| q.bytes == 380 * 4));
    for pair in inputs.windows(2) {
        let step = pair[1].pts_us - pair[0].pts_us;
        assert!(step == 8_616 || step == 8_617, "step {}", step);
    }

    let audio = report.audio.unwrap();
    assert!(audio.frames_dropped > 0);
    assert_eq!(audio.frames_dropped % 20, 0);
    assert!(audio.end_of_stream_sent);
}

#[test]
fn media_mode_records_two_zero_based_tracks() {
    let (controller, host) = setup(FakeHostOptions::default());
    let (auth, _) = host.authorization();
    controller.start(Box::new(auth), AudioMode::Media).unwrap();
    thread::sleep(Duration::from_millis(50));
    let report = controller.stop().unwrap();

    assert!(report.is_finalized());
    let log = host.writer_log().unwrap();
    assert_eq!(log.tracks().len(), 2);
    for track in [TrackKind::Video, TrackKind::Audio] {
        let samples = log.samples_for(track);
        assert!(!samples.is_empty(), "{} written", track);
        assert_eq!(samples[0].pts_us, 0);
    }
    // Video frames from the fake encoder are spaced one frame step apart after rebasing
    let video = log.samples_for(TrackKind::Video);
    if video.len() > 1 {
        assert_eq!(video[1].pts_us, screenrec::testing::FAKE_FRAME_STEP_US);
    }
    assert!(log.stopped());
    assert!(log.released());
}

#[test]
fn none_mode_never_touches_audio() {
    let (controller, host) = setup(FakeHostOptions::default());
    let (auth, _) = host.authorization();
    controller.start(Box::new(auth), AudioMode::None).unwrap();
    thread::sleep(Duration::from_millis(30));
    let report = controller.stop().unwrap();

    assert!(report.audio.is_none());
    assert_eq!(report.drains.len(), 1);
    assert!(host.encoder(TrackKind::Audio).is_none());
    assert!(!host
        .events()
        .events()
        .iter()
        .any(|e| matches!(e, HostEvent::AudioInputStarted(_))));
}

#[test]
fn command_without_authorization_is_rejected() {
    let (controller, host) = setup(FakeHostOptions::default());
    let err = controller
        .handle_command(Command::Start {
            authorization: None,
            audio_mode: 1,
        })
        .unwrap_err();
    assert!(matches!(err, RecorderError::Authorization(_)));
    assert!(host.events().events().is_empty());
    assert_eq!(controller.state(), SessionState::Idle);
}

#[test]
fn unknown_mode_value_records_video_only() {
    let (controller, host) = setup(FakeHostOptions::default());
    let (auth, _) = host.authorization();
    let outcome = controller
        .handle_command(Command::Start {
            authorization: Some(Box::new(auth)),
            audio_mode: 7,
        })
        .unwrap();
    assert!(matches!(outcome, CommandOutcome::Started(_)));
    assert_eq!(controller.audio_mode(), Some(AudioMode::None));

    match controller.handle_command(Command::Stop).unwrap() {
        CommandOutcome::Stopped(Some(report)) => assert_eq!(report.audio_mode, AudioMode::None),
        other => panic!("unexpected {:?}", other),
    }
    match controller.handle_command(Command::Stop).unwrap() {
        CommandOutcome::Stopped(None) => {}
        other => panic!("second stop should be a no-op, got {:?}", other),
    }
}

#[test]
fn stale_revocation_does_not_stop_the_next_session() {
    let (controller, host) = setup(FakeHostOptions::default());

    let (first, first_handle) = host.authorization();
    let first_id = controller.start(Box::new(first), AudioMode::None).unwrap();
    thread::sleep(Duration::from_millis(20));
    controller.stop().unwrap();

    let (second, _) = host.authorization();
    let second_id = controller.start(Box::new(second), AudioMode::None).unwrap();
    assert_ne!(first_id, second_id);

    // The old grant's notifier belongs to a finished session
    first_handle.revoke();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(controller.state(), SessionState::Capturing);
    assert_eq!(controller.session_id(), Some(second_id));

    controller.stop().unwrap();
}

#[test]
fn revocation_finalizes_what_was_recorded() {
    let (controller, host) = setup(FakeHostOptions::default());
    let (auth, handle) = host.authorization();
    controller.start(Box::new(auth), AudioMode::MediaAndMic).unwrap();
    thread::sleep(Duration::from_millis(40));

    assert!(handle.revoke());
    wait_until_idle(&controller);

    let report = controller.last_report().unwrap();
    assert_eq!(report.reason, StopReason::AuthorizationRevoked);
    assert!(matches!(report.disposition, OutputDisposition::Finalized(_)));
    assert!(!controller.is_recording());
    assert_eq!(controller.status().publish_count(), 2);
    assert_eq!(host.outstanding_output_buffers(), 0);
    assert!(host.events().contains(&HostEvent::AuthorizationStopped));
}

#[test]
fn output_failure_leaves_nothing_open() {
    let (controller, host) = setup(FakeHostOptions {
        fail_output: true,
        ..FakeHostOptions::default()
    });
    let (auth, _) = host.authorization();
    let err = controller.start(Box::new(auth), AudioMode::Media).unwrap_err();
    assert!(matches!(err, RecorderError::Io(_)));

    let events = host.events();
    assert!(!events.contains(&HostEvent::EncoderCreated(TrackKind::Video)));
    assert!(!events.contains(&HostEvent::VirtualDisplayCreated));
    assert!(events.contains(&HostEvent::AuthorizationStopped));
    assert_eq!(controller.state(), SessionState::Idle);
    assert_eq!(controller.status().publish_count(), 0);
}

#[test]
fn display_failure_releases_encoders() {
    let (controller, host) = setup(FakeHostOptions {
        fail_virtual_display: true,
        ..FakeHostOptions::default()
    });
    let (auth, _) = host.authorization();
    assert!(controller.start(Box::new(auth), AudioMode::Media).is_err());

    let events = host.events();
    assert!(events.contains(&HostEvent::EncoderReleased(TrackKind::Video)));
    assert!(events.contains(&HostEvent::EncoderReleased(TrackKind::Audio)));
    assert!(events.contains(&HostEvent::SinkDiscarded));
    assert!(!events.contains(&HostEvent::SinkFinalized));

    let report = controller.last_report().unwrap();
    assert!(matches!(report.reason, StopReason::StartupFailed(_)));
    assert_eq!(report.disposition, OutputDisposition::Discarded);
}

#[test]
fn elapsed_tracks_the_active_session() {
    let (controller, host) = setup(FakeHostOptions::default());
    assert!(controller.elapsed().is_none());

    let (auth, _) = host.authorization();
    controller.start(Box::new(auth), AudioMode::None).unwrap();
    thread::sleep(Duration::from_millis(20));
    let elapsed = controller.elapsed().unwrap();
    assert!(elapsed >= Duration::from_millis(10));

    controller.stop().unwrap();
    assert!(controller.elapsed().is_none());
    assert!(controller.started_at().is_none());
}
