//! Single-bin tone power estimation, plus the FFT sweep used to find the
//! tone in the first place.

use std::sync::Arc;

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

use crate::Float;

/// Goertzel power of `frame` at `freq_hz`, normalized by the squared frame
/// length so it is comparable across frame sizes.
pub fn power(frame: &[Float], sample_rate: u32, freq_hz: Float) -> Float {
    let n = frame.len();
    if n == 0 {
        return 0.0;
    }
    let omega = 2.0 * std::f64::consts::PI * freq_hz as f64 / sample_rate as f64;
    let coeff = 2.0 * omega.cos();
    let mut q1 = 0.0f64;
    let mut q2 = 0.0f64;
    for &sample in frame {
        let q0 = coeff * q1 - q2 + sample as f64;
        q2 = q1;
        q1 = q0;
    }
    let power = q1 * q1 + q2 * q2 - coeff * q1 * q2;
    (power.max(0.0) / (n * n) as f64) as Float
}

/// Hann-windowed FFT peak search, reused across frames of the same size.
pub struct ToneSearch {
    fft: Arc<dyn Fft<Float>>,
    window: Vec<Float>,
    scratch: Vec<Complex<Float>>,
    sample_rate: u32,
}

impl ToneSearch {
    pub fn new(frame_len: usize, sample_rate: u32) -> Self {
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(frame_len);
        let window = (0..frame_len)
            .map(|i| {
                let x = std::f32::consts::PI * i as Float / frame_len as Float;
                x.sin() * x.sin()
            })
            .collect();
        Self {
            fft,
            window,
            scratch: vec![Complex::default(); frame_len],
            sample_rate,
        }
    }

    /// Frequency of the strongest bin within `[min_hz, max_hz]`, or `None`
    /// if the frame is too short to resolve anything there.
    pub fn dominant(&mut self, frame: &[Float], min_hz: Float, max_hz: Float) -> Option<Float> {
        let n = frame.len();
        if n < 32 || n != self.window.len() {
            return None;
        }
        for (out, (&s, &w)) in self
            .scratch
            .iter_mut()
            .zip(frame.iter().zip(self.window.iter()))
        {
            *out = Complex::new(s * w, 0.0);
        }
        self.fft.process(&mut self.scratch);

        let hz_per_bin = self.sample_rate as Float / n as Float;
        let lo = (min_hz / hz_per_bin).ceil() as usize;
        let hi = ((max_hz / hz_per_bin).floor() as usize).min(n / 2);
        if lo > hi {
            return None;
        }
        let best = (lo..=hi).max_by(|&a, &b| {
            self.scratch[a]
                .norm_sqr()
                .total_cmp(&self.scratch[b].norm_sqr())
        })?;
        // A real tone towers over the in-band average; a silence window is
        // flat and must not drag the tracked tone around.
        let peak = self.scratch[best].norm_sqr();
        let mean = (lo..=hi)
            .map(|i| self.scratch[i].norm_sqr())
            .sum::<Float>()
            / (hi - lo + 1) as Float;
        if peak < 4.0 * mean.max(1e-20) {
            return None;
        }
        Some(best as Float * hz_per_bin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: Float, sample_rate: u32, n: usize) -> Vec<Float> {
        (0..n)
            .map(|i| {
                (2.0 * std::f32::consts::PI * freq * i as Float / sample_rate as Float).sin()
            })
            .collect()
    }

    #[test]
    fn power_peaks_at_tone() {
        let frame = sine(700.0, 44100, 512);
        let at_tone = power(&frame, 44100, 700.0);
        let off_tone = power(&frame, 44100, 1400.0);
        assert!(at_tone > 10.0 * off_tone, "{at_tone} vs {off_tone}");
    }

    #[test]
    fn power_of_silence_is_zero() {
        let frame = vec![0.0; 512];
        assert_eq!(power(&frame, 44100, 700.0), 0.0);
        assert_eq!(power(&[], 44100, 700.0), 0.0);
    }

    #[test]
    fn tone_search_finds_dominant() {
        let frame = sine(650.0, 44100, 2048);
        let mut search = ToneSearch::new(2048, 44100);
        let tone = search.dominant(&frame, 300.0, 1200.0).unwrap();
        assert!((tone - 650.0).abs() < 30.0, "found {tone}");
    }

    #[test]
    fn tone_search_respects_band() {
        let frame = sine(2000.0, 44100, 2048);
        let mut search = ToneSearch::new(2048, 44100);
        // Strongest bin is outside the band; whatever comes back must be
        // inside it.
        if let Some(tone) = search.dominant(&frame, 300.0, 1200.0) {
            assert!((300.0..=1200.0).contains(&tone));
        }
    }
}
