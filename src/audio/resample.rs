//! Streaming linear resampler for interleaved PCM

/// Converts interleaved f32 PCM between sample rates across calls
///
/// The last input frame of each call is kept so interpolation continues
/// across block boundaries without a seam.
#[derive(Debug, Clone)]
pub struct LinearResampler {
    input_rate: u32,
    output_rate: u32,
    channels: usize,
    /// Position of the next output frame within `buffer`, in input frames
    position: f64,
    buffer: Vec<f32>,
}

impl LinearResampler {
    pub fn new(input_rate: u32, output_rate: u32, channels: u16) -> Self {
        Self {
            input_rate,
            output_rate,
            channels: channels.max(1) as usize,
            position: 0.0,
            buffer: Vec::new(),
        }
    }

    pub fn is_passthrough(&self) -> bool {
        self.input_rate == self.output_rate
    }

    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }

    /// Feed interleaved samples, returning every output frame now computable
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        if self.is_passthrough() {
            return samples.to_vec();
        }
        if self.input_rate == 0 || self.output_rate == 0 {
            return Vec::new();
        }

        self.buffer.extend_from_slice(samples);
        let channels = self.channels;
        let step = self.input_rate as f64 / self.output_rate as f64;
        let available = self.buffer.len() / channels;

        let estimate = ((available as f64 - self.position) / step).max(0.0) as usize + 1;
        let mut out = Vec::with_capacity(estimate * channels);
        while self.position + 1.0 < available as f64 {
            let i0 = self.position.floor() as usize;
            let frac = (self.position - i0 as f64) as f32;
            for ch in 0..channels {
                let s0 = self.buffer[i0 * channels + ch];
                let s1 = self.buffer[(i0 + 1) * channels + ch];
                out.push(s0 + (s1 - s0) * frac);
            }
            self.position += step;
        }

        let consumed = self.position.floor() as usize;
        if consumed > 0 {
            self.buffer.drain(..consumed * channels);
            self.position -= consumed as f64;
        }
        out
    }

    pub fn reset(&mut self) {
        self.position = 0.0;
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passthrough_at_equal_rates() {
        let mut resampler = LinearResampler::new(48_000, 48_000, 2);
        assert_eq!(resampler.process(&[0.1, 0.2, 0.3, 0.4]), vec![0.1, 0.2, 0.3, 0.4]);
    }

    #[test]
    fn test_upsampling_produces_proportional_frames() {
        let mut resampler = LinearResampler::new(44_100, 48_000, 2);
        let block = vec![0.25f32; 441 * 2];
        let mut frames = 0;
        for _ in 0..100 {
            frames += resampler.process(&block).len() / 2;
        }
        // 100 blocks of 10 ms at 44.1 kHz is one second of 48 kHz output
        assert!((47_990..=48_000).contains(&frames), "{} frames", frames);
    }

    #[test]
    fn test_constant_signal_stays_constant() {
        let mut resampler = LinearResampler::new(44_100, 48_000, 1);
        let out = resampler.process(&[0.5f32; 1000]);
        assert!(!out.is_empty());
        assert!(out.iter().all(|s| (s - 0.5).abs() < 1e-6));
    }

    #[test]
    fn test_interpolates_between_blocks() {
        let mut resampler = LinearResampler::new(1, 2, 1);
        let mut out = resampler.process(&[0.0, 1.0]);
        out.extend(resampler.process(&[2.0]));
        assert_eq!(out, vec![0.0, 0.5, 1.0, 1.5]);
    }

    #[test]
    fn test_channels_stay_separate() {
        let mut resampler = LinearResampler::new(44_100, 48_000, 2);
        let block: Vec<f32> = (0..882).map(|i| if i % 2 == 0 { 1.0 } else { -1.0 }).collect();
        let out = resampler.process(&block);
        assert!(out.chunks(2).all(|f| (f[0] - 1.0).abs() < 1e-6 && (f[1] + 1.0).abs() < 1e-6));
    }
}
