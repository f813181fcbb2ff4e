//! Morse synthesis: text to keying pulses to PCM.
//!
//! Two stages on purpose: the pulse train is what tests and the decoder
//! loopback want, PCM rendering is what the sound card wants. Prosigns are
//! their own token class so the missing inter-letter gap is a property of
//! the pulse train, not a caller-side hack.

use crate::{Float, morse};

/// One keying interval: key state and duration in seconds.
pub type Pulse = (bool, Float);

#[derive(Debug, Clone)]
pub struct EncoderConfig {
    pub sample_rate: u32,
    pub tone_hz: Float,
    pub wpm: Float,
    /// Farnsworth spacing: stretch inter-character and inter-word gaps to
    /// this (lower) speed while keeping element speed at `wpm`.
    pub farnsworth_wpm: Option<Float>,
    pub volume: Float,
    /// Raised-cosine key-on ramp.
    pub attack_ms: Float,
    /// Raised-cosine key-off ramp.
    pub release_ms: Float,
    /// Bare token treated as a prosign even without `<>` brackets.
    pub prosign_literal: String,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            tone_hz: 600.0,
            wpm: 20.0,
            farnsworth_wpm: None,
            volume: 0.25,
            attack_ms: 4.0,
            release_ms: 6.0,
            prosign_literal: "CAVE".to_string(),
        }
    }
}

impl EncoderConfig {
    pub fn dit_seconds(&self) -> Float {
        1.2 / self.wpm.max(1.0)
    }

    fn space_dit_seconds(&self) -> Float {
        match self.farnsworth_wpm {
            Some(f) if (1.0..self.wpm).contains(&f) => 1.2 / f,
            _ => self.dit_seconds(),
        }
    }
}

pub struct CWEncoder {
    config: EncoderConfig,
}

impl CWEncoder {
    pub fn new(config: EncoderConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    /// Change speed and pitch for the next transmission.
    pub fn set_output(&mut self, wpm: Float, tone_hz: Float) {
        self.config.wpm = wpm;
        self.config.tone_hz = tone_hz;
    }

    /// Turn text into a keying pulse train. Unknown characters are skipped;
    /// prosign tokens key with single-dit letter gaps.
    pub fn text_to_pulses(&self, text: &str) -> Vec<Pulse> {
        let tokens = morse::tokenize_text(text);
        let dit = self.config.dit_seconds();
        let char_gap = 3.0 * self.config.space_dit_seconds();
        let word_gap = 7.0 * self.config.space_dit_seconds();
        let literal = morse::clean_prosign_literal(&self.config.prosign_literal);

        let mut pulses: Vec<Pulse> = Vec::new();
        for (token_idx, token) in tokens.iter().enumerate() {
            let letters: Vec<&str> =
                morse::token_chars(token).filter_map(morse::code_for).collect();
            if letters.is_empty() {
                continue;
            }
            let is_prosign =
                token.starts_with('<') || (!literal.is_empty() && *token == literal);
            let letter_gap = if is_prosign { dit } else { char_gap };
            for (letter_idx, code) in letters.iter().enumerate() {
                for (element_idx, element) in code.chars().enumerate() {
                    pulses.push((true, if element == '.' { dit } else { 3.0 * dit }));
                    if element_idx < code.len() - 1 {
                        pulses.push((false, dit));
                    }
                }
                if letter_idx < letters.len() - 1 {
                    pulses.push((false, letter_gap));
                }
            }
            if token_idx < tokens.len() - 1 {
                pulses.push((false, word_gap));
            }
        }
        merge_same_state(pulses)
    }

    /// Render a pulse train as enveloped sine PCM, phase-continuous across
    /// elements.
    pub fn render_pulses(&self, pulses: &[Pulse]) -> Vec<Float> {
        let sr = self.config.sample_rate.max(1);
        let volume = self.config.volume.clamp(0.0, 1.0);
        let attack = (sr as Float * self.config.attack_ms.max(0.0) / 1000.0) as usize;
        let release = (sr as Float * self.config.release_ms.max(0.0) / 1000.0) as usize;
        let phase_step = 2.0 * std::f32::consts::PI * self.config.tone_hz / sr as Float;

        let total: usize = pulses
            .iter()
            .map(|(_, d)| (d * sr as Float).round() as usize)
            .sum();
        let mut out = Vec::with_capacity(total);
        let mut phase = 0.0f32;
        for &(key_down, duration) in pulses {
            let n = ((duration * sr as Float).round() as usize).max(1);
            if !key_down {
                out.extend(std::iter::repeat_n(0.0, n));
                continue;
            }
            let (a, r) = fit_ramps(attack, release, n);
            for i in 0..n {
                let mut env = 1.0;
                if i < a {
                    env *= raised_cosine(i as Float / a as Float);
                }
                if i >= n - r {
                    env *= raised_cosine((n - i) as Float / r as Float);
                }
                out.push((phase + phase_step * i as Float).sin() * env * volume);
            }
            phase = (phase + phase_step * n as Float) % (2.0 * std::f32::consts::PI);
        }
        out
    }

    /// Render text as PCM with a short silence tail so downstream decoders
    /// flush cleanly.
    pub fn encode_to_audio(&self, text: &str) -> Vec<Float> {
        let pulses = self.text_to_pulses(text);
        if pulses.is_empty() {
            return vec![0.0];
        }
        let mut audio = self.render_pulses(&pulses);
        let tail = (0.3 * self.config.sample_rate as Float) as usize;
        audio.extend(std::iter::repeat_n(0.0, tail.max(1)));
        audio
    }
}

fn raised_cosine(x: Float) -> Float {
    0.5 * (1.0 - (std::f32::consts::PI * x.clamp(0.0, 1.0)).cos())
}

/// Shrink the ramps when an element is too short to hold both.
fn fit_ramps(attack: usize, release: usize, n: usize) -> (usize, usize) {
    if attack + release <= n {
        return (attack, release);
    }
    let half = n / 2;
    (attack.min(half), release.min(n - half))
}

fn merge_same_state(pulses: Vec<Pulse>) -> Vec<Pulse> {
    let mut merged: Vec<Pulse> = Vec::with_capacity(pulses.len());
    for (state, duration) in pulses {
        match merged.last_mut() {
            Some((prev_state, prev_duration)) if *prev_state == state => {
                *prev_duration += duration;
            }
            _ => merged.push((state, duration)),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enc(wpm: Float) -> CWEncoder {
        CWEncoder::new(EncoderConfig {
            wpm,
            ..Default::default()
        })
    }

    #[test]
    fn single_letter_timing() {
        // "A" at 20 WPM: dit 60 ms, gap 60 ms, dah 180 ms.
        let pulses = enc(20.0).text_to_pulses("A");
        assert_eq!(pulses.len(), 3);
        assert!((pulses[0].1 - 0.06).abs() < 1e-6);
        assert!(pulses[0].0);
        assert!(!pulses[1].0);
        assert!((pulses[2].1 - 0.18).abs() < 1e-6);
    }

    #[test]
    fn word_and_char_gaps() {
        let pulses = enc(20.0).text_to_pulses("EE E");
        // dit, char gap (3 dits), dit, word gap (7 dits), dit.
        let gaps: Vec<Float> = pulses
            .iter()
            .filter(|(down, _)| !down)
            .map(|(_, d)| d / 0.06)
            .collect();
        assert_eq!(gaps.len(), 2);
        assert!((gaps[0] - 3.0).abs() < 0.01);
        assert!((gaps[1] - 7.0).abs() < 0.01);
    }

    #[test]
    fn prosign_has_no_letter_gaps() {
        let e = enc(20.0);
        let plain = e.text_to_pulses("KN");
        let prosign = e.text_to_pulses("<KN>");
        let gap_of = |p: &[Pulse]| -> Float {
            p.iter()
                .filter(|(down, _)| !down)
                .map(|(_, d)| *d)
                .fold(0.0, Float::max)
        };
        // Plain text has a 3-dit gap between K and N, the prosign only
        // 1-dit element gaps.
        assert!((gap_of(&plain) - 0.18).abs() < 1e-6);
        assert!((gap_of(&prosign) - 0.06).abs() < 1e-6);
    }

    #[test]
    fn configured_literal_is_prosign_without_brackets() {
        let e = CWEncoder::new(EncoderConfig {
            prosign_literal: "CAVE".to_string(),
            ..Default::default()
        });
        let pulses = e.text_to_pulses("CAVE");
        let max_gap = pulses
            .iter()
            .filter(|(down, _)| !down)
            .map(|(_, d)| *d)
            .fold(0.0, Float::max);
        assert!((max_gap - 0.06).abs() < 1e-6);
    }

    #[test]
    fn farnsworth_stretches_gaps_only() {
        let plain = enc(20.0).text_to_pulses("E E");
        let farns = CWEncoder::new(EncoderConfig {
            wpm: 20.0,
            farnsworth_wpm: Some(10.0),
            ..Default::default()
        })
        .text_to_pulses("E E");
        assert_eq!(plain[0].1, farns[0].1);
        assert!(farns[1].1 > 1.9 * plain[1].1);
    }

    #[test]
    fn render_respects_volume_and_bounds() {
        let e = CWEncoder::new(EncoderConfig {
            volume: 0.5,
            ..Default::default()
        });
        let audio = e.encode_to_audio("PARIS");
        let peak = audio.iter().fold(0.0f32, |m, s| m.max(s.abs()));
        assert!(peak <= 0.5 + 1e-3);
        assert!(peak > 0.4);
    }

    #[test]
    fn ramps_suppress_hard_edges() {
        let e = enc(20.0);
        let audio = e.render_pulses(&[(true, 0.06)]);
        // First and last samples sit inside the ramps.
        assert!(audio[0].abs() < 0.01);
        assert!(audio[audio.len() - 1].abs() < 0.05);
    }

    #[test]
    fn empty_text_renders_silence() {
        let audio = enc(20.0).encode_to_audio("!!");
        assert_eq!(audio, vec![0.0]);
    }

    #[test]
    fn merge_collapses_adjacent_silence() {
        let merged = merge_same_state(vec![(false, 0.1), (false, 0.2), (true, 0.06)]);
        assert_eq!(merged.len(), 2);
        assert!((merged[0].1 - 0.3).abs() < 1e-6);
    }
}
