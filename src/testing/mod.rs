//! Testing utilities for screenrec
//!
//! An in-memory host with scripted devices and encoders, plus synthetic
//! screen and audio content, so the whole pipeline runs offline.

pub mod fakes;
pub mod synthetic_data;

pub use fakes::{
    AuthorizationHandle, EventLog, FakeAuthorization, FakeEncoder, FakeHost, FakeHostOptions,
    HostEvent, QueuedInput, RecordingWriter, ScriptedEncoder, ScriptedInput, WriterLog,
    WrittenSample, FAKE_FRAME_STEP_US,
};
pub use synthetic_data::{synthetic_pcm_block, synthetic_screen_frame, synthetic_tone};
