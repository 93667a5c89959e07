//! Synthetic screen and audio content for offline tests and the software host

use bytes::Bytes;

use crate::types::{PcmFormat, SampleBlock, ScreenFrame};

/// An RGB24 gradient that shifts every frame so the encoder sees motion
pub fn synthetic_screen_frame(frame_number: u64, width: u32, height: u32, timestamp_us: i64) -> ScreenFrame {
    let mut data = vec![0u8; (width * height * 3) as usize];
    let base = (frame_number % 256) as u8;

    for y in 0..height {
        for x in 0..width {
            let idx = ((y * width + x) * 3) as usize;
            data[idx] = base.wrapping_add((x % 256) as u8);
            data[idx + 1] = base.wrapping_add((y % 256) as u8);
            data[idx + 2] = base.wrapping_add(((x + y) % 256) as u8);
        }
    }

    ScreenFrame {
        width,
        height,
        data: Bytes::from(data),
        timestamp_us,
    }
}

/// A 440 Hz tone block in the capture format, continuing phase across blocks
pub fn synthetic_pcm_block(block_number: u64, frames: usize) -> SampleBlock {
    synthetic_tone(block_number * frames as u64, frames)
}

/// `frames` of the 440 Hz capture-format tone starting at frame `start_frame`
pub fn synthetic_tone(start_frame: u64, frames: usize) -> SampleBlock {
    let format = PcmFormat::CAPTURE;
    let channels = format.channels as usize;
    let sample_rate = format.sample_rate as f64;
    let mut samples = vec![0i16; frames * channels];

    for i in 0..frames {
        let t = (start_frame + i as u64) as f64 / sample_rate;
        let value = ((2.0 * std::f64::consts::PI * 440.0 * t).sin() * 0.3 * i16::MAX as f64) as i16;
        for c in 0..channels {
            samples[i * channels + c] = value;
        }
    }

    SampleBlock::new(samples, format.channels)
}
