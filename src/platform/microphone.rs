//! Microphone input using cpal
//!
//! A cpal stream is not `Send` on every host, so it lives on its own thread
//! for its whole life. Samples reach the reader through a bounded channel;
//! when the reader falls behind, new callbacks are dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::StreamConfig;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use super::AudioInput;
use crate::errors::RecorderError;
use crate::recording::worker::spawn_named;
use crate::types::PcmFormat;

/// Callback blocks buffered before new ones are dropped
const MAX_BUFFERED_BLOCKS: usize = 256;

const STREAM_START_TIMEOUT: Duration = Duration::from_secs(2);

/// Convert a normalized float sample to 16-bit PCM
pub fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

/// Default input device captured as interleaved 16-bit PCM
pub struct CpalMicrophone {
    format: PcmFormat,
    device_name: String,
    receiver: Receiver<Vec<i16>>,
    sender: Sender<Vec<i16>>,
    pending: Vec<i16>,
    stop_tx: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
    dropped_blocks: Arc<AtomicU64>,
    released: bool,
}

impl CpalMicrophone {
    /// Check that a default input device exists. The stream opens on `start`.
    pub fn open(format: PcmFormat) -> Result<Self, RecorderError> {
        let device = cpal::default_host()
            .default_input_device()
            .ok_or_else(|| RecorderError::Capture("No default audio input device".to_string()))?;
        let device_name = device.name().unwrap_or_else(|_| "unknown".to_string());

        let (sender, receiver) = crossbeam_channel::bounded(MAX_BUFFERED_BLOCKS);
        log::debug!("Microphone '{}' opened", device_name);
        Ok(Self {
            format,
            device_name,
            receiver,
            sender,
            pending: Vec::new(),
            stop_tx: None,
            worker: None,
            dropped_blocks: Arc::new(AtomicU64::new(0)),
            released: false,
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Callback blocks dropped because the reader fell behind
    pub fn dropped_blocks(&self) -> u64 {
        self.dropped_blocks.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    fn take_frames(&mut self, buf: &mut [i16]) -> usize {
        let channels = self.format.channels.max(1) as usize;
        let frames = self.pending.len().min(buf.len()) / channels;
        let samples = frames * channels;
        buf[..samples].copy_from_slice(&self.pending[..samples]);
        self.pending.drain(..samples);
        frames
    }
}

fn run_stream(
    format: PcmFormat,
    sender: Sender<Vec<i16>>,
    dropped: Arc<AtomicU64>,
    ready: Sender<Result<(), String>>,
    stop: Receiver<()>,
) {
    let device = match cpal::default_host().default_input_device() {
        Some(device) => device,
        None => {
            let _ = ready.send(Err("No default audio input device".to_string()));
            return;
        }
    };

    let config = StreamConfig {
        channels: format.channels,
        sample_rate: cpal::SampleRate(format.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let stream = device.build_input_stream(
        &config,
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            let block: Vec<i16> = data.iter().copied().map(f32_to_i16).collect();
            if sender.try_send(block).is_err() {
                dropped.fetch_add(1, Ordering::Relaxed);
            }
        },
        move |err| {
            log::error!("Microphone stream error: {}", err);
        },
        None,
    );

    let stream = match stream {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready.send(Err(format!("Failed to build stream: {}", e)));
            return;
        }
    };
    if let Err(e) = stream.play() {
        let _ = ready.send(Err(format!("Failed to start stream: {}", e)));
        return;
    }
    let _ = ready.send(Ok(()));

    // Blocks until stop is sent or the handle is dropped
    let _ = stop.recv();
    let _ = stream.pause();
}

impl AudioInput for CpalMicrophone {
    fn start(&mut self) -> Result<(), RecorderError> {
        if self.released {
            return Err(RecorderError::Capture("microphone released".to_string()));
        }
        if self.worker.is_some() {
            return Ok(());
        }

        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
        let format = self.format;
        let sender = self.sender.clone();
        let dropped = self.dropped_blocks.clone();
        let worker = spawn_named("screenrec-microphone", move || {
            run_stream(format, sender, dropped, ready_tx, stop_rx)
        })?;

        match ready_rx.recv_timeout(STREAM_START_TIMEOUT) {
            Ok(Ok(())) => {
                self.stop_tx = Some(stop_tx);
                self.worker = Some(worker);
                log::info!(
                    "Microphone '{}' capturing {} Hz, {} ch",
                    self.device_name,
                    format.sample_rate,
                    format.channels
                );
                Ok(())
            }
            Ok(Err(message)) => {
                let _ = worker.join();
                Err(RecorderError::Capture(message))
            }
            Err(_) => {
                drop(stop_tx);
                Err(RecorderError::Capture(
                    "microphone stream did not start".to_string(),
                ))
            }
        }
    }

    fn read(&mut self, buf: &mut [i16], timeout: Duration) -> Result<usize, RecorderError> {
        if self.released {
            return Err(RecorderError::Capture("microphone released".to_string()));
        }
        if self.pending.len() < buf.len() {
            match self.receiver.recv_timeout(timeout) {
                Ok(block) => self.pending.extend_from_slice(&block),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(RecorderError::Capture("microphone stream closed".to_string()))
                }
            }
            while self.pending.len() < buf.len() {
                match self.receiver.try_recv() {
                    Ok(block) => self.pending.extend_from_slice(&block),
                    Err(_) => break,
                }
            }
        }
        Ok(self.take_frames(buf))
    }

    fn stop(&mut self) -> Result<(), RecorderError> {
        if let Some(stop) = self.stop_tx.take() {
            let _ = stop.send(());
        }
        if let Some(worker) = self.worker.take() {
            worker
                .join()
                .map_err(|_| RecorderError::Capture("microphone thread panicked".to_string()))?;
        }
        Ok(())
    }

    fn release(&mut self) -> Result<(), RecorderError> {
        if self.released {
            return Ok(());
        }
        let result = AudioInput::stop(self);
        self.released = true;
        self.pending.clear();
        while self.receiver.try_recv().is_ok() {}
        if self.dropped_blocks() > 0 {
            log::warn!("Microphone dropped {} blocks", self.dropped_blocks());
        }
        result
    }
}

impl Drop for CpalMicrophone {
    fn drop(&mut self) {
        let _ = AudioInput::release(self);
    }
}
