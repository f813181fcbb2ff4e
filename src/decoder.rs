//! Streaming CW decoder.
//!
//! Tone-power keying detection: Goertzel power at the (fixed or tracked)
//! tone, a Schmitt trigger against a running noise floor, and dit-referenced
//! timing classification into dits, dahs, and the three gap sizes. Whole
//! messages come out once the operator has been quiet for `message_gap_s`.
//!
//! The sample path never returns errors. Unknown patterns and timing
//! anomalies are queued as events and drained by the caller.

use std::collections::VecDeque;

use crate::event::{Event, EventKind};
use crate::goertzel::{self, ToneSearch};
use crate::{Float, morse};

/// Decoder tuning. The defaults hold for clean sidetone at 15-30 WPM; the
/// `noisy` preset in [`crate::config`] trades latency for stability.
#[derive(Debug, Clone)]
pub struct DecoderConfig {
    pub sample_rate: u32,
    /// Analysis frame length in milliseconds.
    pub frame_ms: Float,
    pub tone_hz: Float,
    pub auto_tone: bool,
    pub tone_min_hz: Float,
    pub tone_max_hz: Float,
    /// How often the auto-tone FFT sweep reruns.
    pub retune_ms: Float,
    /// FFT window for the sweep.
    pub retune_window_ms: Float,
    /// Key-down threshold, as a multiple of the noise floor.
    pub threshold_on: Float,
    /// Key-up threshold, likewise. Must be below `threshold_on`.
    pub threshold_off: Float,
    /// Noise floor EMA factor, applied only while key-up.
    pub alpha_noise: Float,
    /// Tone power EMA factor.
    pub power_smooth: Float,
    pub wpm_target: Float,
    pub auto_wpm: bool,
    pub dit_ms_min: Float,
    pub dit_ms_max: Float,
    pub min_key_down_ms: Float,
    pub min_key_up_ms: Float,
    /// Extra key-up debounce, as a fraction of a dit.
    pub min_up_ratio: Float,
    /// Key-down shorter than this many dits is a dit, else a dah.
    pub dah_threshold_dits: Float,
    /// Key-up shorter than this many dits stays inside the character.
    pub gap_char_dits: Float,
    pub gap_word_dits: Float,
    /// Silence that ends a message.
    pub message_gap_s: Float,
    pub prosign_literal: String,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            frame_ms: 10.0,
            tone_hz: 600.0,
            auto_tone: false,
            tone_min_hz: 300.0,
            tone_max_hz: 1200.0,
            retune_ms: 500.0,
            retune_window_ms: 40.0,
            threshold_on: 3.0,
            threshold_off: 1.8,
            alpha_noise: 0.01,
            power_smooth: 1.0,
            wpm_target: 20.0,
            auto_wpm: true,
            dit_ms_min: 25.0,
            dit_ms_max: 220.0,
            min_key_down_ms: 8.0,
            min_key_up_ms: 8.0,
            min_up_ratio: 0.0,
            dah_threshold_dits: 2.0,
            gap_char_dits: 2.5,
            gap_word_dits: 5.0,
            message_gap_s: 1.0,
            prosign_literal: "CAVE".to_string(),
        }
    }
}

impl DecoderConfig {
    /// Dit length in seconds when WPM tracking is off.
    pub fn dit_seconds_fixed(&self) -> Float {
        1.2 / self.wpm_target.max(1.0)
    }
}

/// Live view of the decoder internals, for the status line.
#[derive(Debug, Clone, Default)]
pub struct DecoderStats {
    pub level_db: Float,
    pub tone_hz: Float,
    pub tone_power: Float,
    pub noise_floor: Float,
    pub key_down: bool,
    pub dit_ms: Float,
    pub wpm_est: Float,
}

/// One decoded character with its timing context.
#[derive(Debug, Clone)]
pub struct DecodedToken {
    /// Usually one character; a recognized prosign comes out bracketed.
    pub text: String,
    /// How far the element lengths sat from the dit/dah boundary, 0..1.
    pub confidence: Float,
    pub wpm: Float,
}

pub struct CWDecoder {
    config: DecoderConfig,
    frame_len: usize,
    frame_duration: Float,

    buffer: VecDeque<Float>,
    retune_buf: VecDeque<Float>,
    tone_search: Option<ToneSearch>,
    retune_countdown: u32,
    retune_frames: u32,

    tone_hz: Float,
    noise_floor: Float,
    power_smooth: Float,
    key_down: bool,
    state_duration: Float,

    dit_estimate: Float,
    down_durations: VecDeque<Float>,

    symbol: String,
    symbol_margin: Float,
    word: String,
    words: Vec<String>,
    prosign_pattern: Option<String>,
    prosign_token: String,

    gap_flushed_symbol: bool,
    gap_flushed_word: bool,
    gap_emitted_message: bool,

    tokens: Vec<DecodedToken>,
    events: Vec<Event>,
    stats: DecoderStats,
}

impl CWDecoder {
    pub fn new(config: DecoderConfig) -> Self {
        let frame_len = ((config.sample_rate as Float * config.frame_ms / 1000.0).round()
            as usize)
            .max(16);
        let frame_duration = frame_len as Float / config.sample_rate as Float;
        let retune_frames = (config.retune_ms / config.frame_ms).max(1.0) as u32;
        let dit = config.dit_seconds_fixed();
        let prosign_pattern = morse::prosign_pattern(&config.prosign_literal);
        let prosign_token = morse::prosign_token(&config.prosign_literal);
        let stats = DecoderStats {
            level_db: -120.0,
            tone_hz: config.tone_hz,
            dit_ms: dit * 1000.0,
            wpm_est: 1.2 / dit,
            noise_floor: 1e-8,
            ..Default::default()
        };
        Self {
            tone_hz: config.tone_hz,
            config,
            frame_len,
            frame_duration,
            buffer: VecDeque::new(),
            retune_buf: VecDeque::new(),
            tone_search: None,
            retune_countdown: 0,
            retune_frames,
            noise_floor: 1e-8,
            power_smooth: 0.0,
            key_down: false,
            state_duration: 0.0,
            dit_estimate: dit,
            down_durations: VecDeque::with_capacity(256),
            symbol: String::new(),
            symbol_margin: 1.0,
            word: String::new(),
            words: Vec::new(),
            prosign_pattern,
            prosign_token,
            gap_flushed_symbol: false,
            gap_flushed_word: false,
            gap_emitted_message: false,
            tokens: Vec::new(),
            events: Vec::new(),
            stats,
        }
    }

    /// Drop all signal and keying state. The next samples start from
    /// scratch.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.retune_buf.clear();
        self.noise_floor = 1e-8;
        self.power_smooth = 0.0;
        self.key_down = false;
        self.state_duration = 0.0;
        self.dit_estimate = self.config.dit_seconds_fixed();
        self.down_durations.clear();
        self.symbol.clear();
        self.symbol_margin = 1.0;
        self.word.clear();
        self.words.clear();
        self.gap_flushed_symbol = false;
        self.gap_flushed_word = false;
        self.gap_emitted_message = false;
        self.tokens.clear();
        self.events.clear();
    }

    /// Re-anchor the noise floor and tone tracking to current conditions.
    /// Keying state and any half-received character survive.
    pub fn calibrate(&mut self) {
        self.tone_hz = self.config.tone_hz;
        self.noise_floor = 1e-8;
        self.power_smooth = 0.0;
        self.down_durations.clear();
    }

    pub fn stats(&self) -> &DecoderStats {
        &self.stats
    }

    /// Decoded characters since the last drain.
    pub fn take_tokens(&mut self) -> Vec<DecodedToken> {
        std::mem::take(&mut self.tokens)
    }

    /// Soft errors since the last drain.
    pub fn take_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }

    /// Feed a block of mono samples. Returns any messages completed by the
    /// silence inside this block.
    pub fn process(&mut self, samples: &[Float]) -> Vec<String> {
        let mut out = Vec::new();
        if samples.is_empty() {
            return out;
        }
        self.buffer.extend(samples.iter().copied());
        while self.buffer.len() >= self.frame_len {
            let frame: Vec<Float> = self.buffer.drain(..self.frame_len).collect();
            self.process_frame(&frame, &mut out);
        }
        out
    }

    /// Flush whatever is buffered as if the silence had run out.
    pub fn finalize(&mut self) -> Option<String> {
        self.flush_symbol();
        self.flush_word();
        self.flush_message()
    }

    /// Decode a complete clip in one call.
    pub fn decode_audio(&mut self, samples: &[Float]) -> String {
        let mut messages = self.process(samples);
        if let Some(tail) = self.finalize() {
            messages.push(tail);
        }
        messages.join(" ").trim().to_string()
    }

    fn process_frame(&mut self, frame: &[Float], out: &mut Vec<String>) {
        let rms = (frame.iter().map(|s| s * s).sum::<Float>() / frame.len() as Float + 1e-12)
            .sqrt();
        self.stats.level_db = 20.0 * rms.max(1e-12).log10();

        if self.config.auto_tone {
            self.retune(frame);
        }

        let raw = goertzel::power(frame, self.config.sample_rate, self.tone_hz);
        let alpha_p = self.config.power_smooth.clamp(0.01, 1.0);
        self.power_smooth = if self.power_smooth <= 0.0 {
            raw
        } else {
            (1.0 - alpha_p) * self.power_smooth + alpha_p * raw
        };
        let power = self.power_smooth;

        if !self.key_down {
            let alpha = self.config.alpha_noise.clamp(0.001, 0.5);
            self.noise_floor = ((1.0 - alpha) * self.noise_floor + alpha * power).max(1e-12);
        }

        let ratio = power / self.noise_floor.max(1e-12);
        let raw_down = if self.key_down {
            ratio >= self.config.threshold_off
        } else {
            ratio >= self.config.threshold_on
        };

        if raw_down == self.key_down {
            self.state_duration += self.frame_duration;
        } else {
            let prev_down = self.key_down;
            let prev_duration = self.state_duration;
            self.key_down = raw_down;
            self.state_duration = self.frame_duration;
            self.on_transition(prev_down, prev_duration);
            if self.key_down {
                self.gap_flushed_symbol = false;
                self.gap_flushed_word = false;
                self.gap_emitted_message = false;
            }
        }

        if !self.key_down {
            self.gap_progress(out);
        }

        self.stats.tone_hz = self.tone_hz;
        self.stats.tone_power = power;
        self.stats.noise_floor = self.noise_floor;
        self.stats.key_down = self.key_down;
        self.stats.dit_ms = self.dit_estimate * 1000.0;
        self.stats.wpm_est = 1.2 / self.dit_estimate.max(1e-6);
    }

    fn retune(&mut self, frame: &[Float]) {
        let window_len = ((self.config.sample_rate as Float * self.config.retune_window_ms
            / 1000.0) as usize)
            .max(self.frame_len);
        self.retune_buf.extend(frame.iter().copied());
        while self.retune_buf.len() > window_len {
            self.retune_buf.pop_front();
        }
        if self.retune_countdown > 0 {
            self.retune_countdown -= 1;
            return;
        }
        self.retune_countdown = self.retune_frames;
        if self.retune_buf.len() < window_len {
            return;
        }
        let search = self
            .tone_search
            .get_or_insert_with(|| ToneSearch::new(window_len, self.config.sample_rate));
        let window = self.retune_buf.make_contiguous();
        if let Some(tone) =
            search.dominant(window, self.config.tone_min_hz, self.config.tone_max_hz)
        {
            self.tone_hz = 0.8 * self.tone_hz + 0.2 * tone;
        }
    }

    fn on_transition(&mut self, prev_down: bool, duration: Float) {
        if duration <= 0.0 {
            return;
        }
        let dit_ref = self.dit_estimate.max(self.config.dit_ms_min / 1000.0);
        let min_down = self.config.min_key_down_ms / 1000.0;
        let min_up = (self.config.min_key_up_ms / 1000.0)
            .max(self.config.min_up_ratio.clamp(0.0, 1.0) * dit_ref);

        if prev_down {
            if duration < min_down {
                self.events.push(Event::new(
                    EventKind::DecoderAnomalousTiming,
                    format!("key-down {:.1} ms ignored", duration * 1000.0),
                ));
                return;
            }
            if self.down_durations.len() >= 256 {
                self.down_durations.pop_front();
            }
            self.down_durations.push_back(duration);
            self.update_dit_estimate();
            let boundary = self.config.dah_threshold_dits.max(1.6) * self.dit_estimate;
            // Dit strictly below the boundary; the epsilon keeps an exact
            // two-dit key-down on the dah side despite float accumulation.
            self.symbol
                .push(if duration + 1e-6 < boundary { '.' } else { '-' });
            let margin = ((duration - boundary).abs() / boundary).clamp(0.0, 1.0);
            self.symbol_margin = self.symbol_margin.min(margin);
            return;
        }

        if duration < min_up {
            return;
        }
        self.classify_gap(duration);
    }

    fn gap_thresholds(&self) -> (Float, Float) {
        let dit = self.dit_estimate;
        let char_threshold = self.config.gap_char_dits.max(1.6) * dit;
        let word_threshold = (self.config.gap_word_dits * dit).max(char_threshold + 0.8 * dit);
        (char_threshold, word_threshold)
    }

    fn classify_gap(&mut self, gap: Float) {
        let (char_threshold, word_threshold) = self.gap_thresholds();
        if gap < char_threshold {
            return;
        }
        self.flush_symbol();
        if gap >= word_threshold {
            self.flush_word();
        }
    }

    /// While the key stays up, flush progressively: character, then word,
    /// then the whole message, each exactly once per silence.
    fn gap_progress(&mut self, out: &mut Vec<String>) {
        let (char_threshold, word_threshold) = self.gap_thresholds();
        let gap = self.state_duration;
        if gap >= char_threshold && !self.gap_flushed_symbol {
            self.flush_symbol();
            self.gap_flushed_symbol = true;
        }
        if gap >= word_threshold && !self.gap_flushed_word {
            self.flush_word();
            self.gap_flushed_word = true;
        }
        let message_gap = self.config.message_gap_s.max(self.frame_duration);
        if gap >= message_gap && !self.gap_emitted_message {
            if let Some(msg) = self.flush_message() {
                out.push(msg);
            }
            self.gap_emitted_message = true;
        }
    }

    fn flush_symbol(&mut self) {
        if self.symbol.is_empty() {
            return;
        }
        let pattern = std::mem::take(&mut self.symbol);
        let confidence = std::mem::replace(&mut self.symbol_margin, 1.0);
        let wpm = 1.2 / self.dit_estimate.max(1e-6);
        let text = if self.prosign_pattern.as_deref() == Some(pattern.as_str()) {
            self.prosign_token.clone()
        } else if let Some(ch) = morse::char_for(&pattern) {
            ch.to_string()
        } else {
            self.events.push(Event::new(
                EventKind::DecoderUnknownPattern,
                pattern.clone(),
            ));
            "*".to_string()
        };
        self.word.push_str(&text);
        self.tokens.push(DecodedToken {
            text,
            confidence,
            wpm,
        });
    }

    fn flush_word(&mut self) {
        if !self.word.is_empty() {
            self.words.push(std::mem::take(&mut self.word));
        }
    }

    fn flush_message(&mut self) -> Option<String> {
        if self.words.is_empty() {
            return None;
        }
        let msg = self.words.join(" ");
        self.words.clear();
        Some(msg)
    }

    fn update_dit_estimate(&mut self) {
        if !self.config.auto_wpm || self.down_durations.len() < 6 {
            return;
        }
        let mut down: Vec<Float> = self.down_durations.iter().copied().collect();
        down.sort_by(Float::total_cmp);
        // The short half is dits (plus the odd clipped dah); its median is a
        // robust dit estimate.
        let half = (down.len() / 2).max(1);
        let dit = down[half / 2].clamp(
            self.config.dit_ms_min / 1000.0,
            self.config.dit_ms_max / 1000.0,
        );
        self.dit_estimate = 0.85 * self.dit_estimate + 0.15 * dit;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::{CWEncoder, EncoderConfig};

    fn decoder(wpm: Float) -> CWDecoder {
        CWDecoder::new(DecoderConfig {
            wpm_target: wpm,
            auto_wpm: false,
            tone_hz: 700.0,
            ..Default::default()
        })
    }

    fn encoded(text: &str, wpm: Float) -> Vec<Float> {
        CWEncoder::new(EncoderConfig {
            wpm,
            tone_hz: 700.0,
            volume: 0.5,
            ..Default::default()
        })
        .encode_to_audio(text)
    }

    #[test]
    fn decodes_simple_word() {
        let mut d = decoder(20.0);
        assert_eq!(d.decode_audio(&encoded("PARIS", 20.0)), "PARIS");
    }

    #[test]
    fn decodes_word_spacing() {
        let mut d = decoder(20.0);
        assert_eq!(d.decode_audio(&encoded("CQ DE EA1ABC", 20.0)), "CQ DE EA1ABC");
    }

    #[test]
    fn silence_produces_nothing() {
        let mut d = decoder(20.0);
        assert_eq!(d.process(&vec![0.0; 44100]), Vec::<String>::new());
        assert_eq!(d.finalize(), None);
    }

    #[test]
    fn message_gap_boundary() {
        let cfg = DecoderConfig {
            wpm_target: 20.0,
            auto_wpm: false,
            tone_hz: 700.0,
            message_gap_s: 1.0,
            ..Default::default()
        };
        let sr = cfg.sample_rate as usize;
        let mut d = CWDecoder::new(cfg);
        let audio = encoded("E", 20.0);
        // Encoder appends a 0.3 s tail; just under a second total must not
        // flush, just over must.
        let mut messages = d.process(&audio);
        messages.extend(d.process(&vec![0.0; sr / 2]));
        assert!(messages.is_empty(), "flushed early: {messages:?}");
        messages.extend(d.process(&vec![0.0; sr]));
        assert_eq!(messages, vec!["E".to_string()]);
    }

    #[test]
    fn unknown_pattern_emits_star_and_event() {
        let cfg = DecoderConfig {
            wpm_target: 20.0,
            auto_wpm: false,
            tone_hz: 700.0,
            ..Default::default()
        };
        let mut d = CWDecoder::new(cfg);
        // Eight dits in a row decode to nothing in the table.
        let enc = CWEncoder::new(EncoderConfig {
            wpm: 20.0,
            tone_hz: 700.0,
            ..Default::default()
        });
        let audio = enc.render_pulses(&[
            (true, 0.06),
            (false, 0.06),
            (true, 0.06),
            (false, 0.06),
            (true, 0.06),
            (false, 0.06),
            (true, 0.06),
            (false, 0.06),
            (true, 0.06),
            (false, 0.06),
            (true, 0.06),
            (false, 0.06),
            (true, 0.06),
            (false, 0.06),
            (true, 0.06),
            (false, 1.5),
        ]);
        let text = d.decode_audio(&audio);
        assert_eq!(text, "*");
        assert!(
            d.take_events()
                .iter()
                .any(|e| e.kind == EventKind::DecoderUnknownPattern)
        );
    }

    #[test]
    fn prosign_decodes_to_bracketed_token() {
        let cfg = DecoderConfig {
            wpm_target: 20.0,
            auto_wpm: false,
            tone_hz: 700.0,
            prosign_literal: "CAVE".to_string(),
            ..Default::default()
        };
        let mut d = CWDecoder::new(cfg);
        let audio = encoded("<CAVE> 73", 20.0);
        assert_eq!(d.decode_audio(&audio), "<CAVE> 73");
    }

    #[test]
    fn calibrate_keeps_accumulator() {
        let mut d = decoder(20.0);
        let audio = encoded("E", 20.0);
        // Stop mid-stream so a character is pending, then calibrate.
        d.process(&audio[..audio.len() / 2]);
        d.calibrate();
        assert!(d.stats().noise_floor <= 1e-7);
    }

    #[test]
    fn auto_wpm_tracks_sender() {
        let mut d = CWDecoder::new(DecoderConfig {
            wpm_target: 15.0,
            auto_wpm: true,
            tone_hz: 700.0,
            ..Default::default()
        });
        let text = "CQ CQ DE EA1ABC EA1ABC K";
        // First pass warms the dit estimate up from 15 to 25 WPM; the
        // second pass must then decode cleanly.
        d.decode_audio(&encoded(text, 25.0));
        let decoded = d.decode_audio(&encoded(text, 25.0));
        assert_eq!(decoded, text);
        assert!(
            (d.stats().wpm_est - 25.0).abs() < 6.0,
            "wpm estimate {}",
            d.stats().wpm_est
        );
    }

    #[test]
    fn tokens_carry_confidence_and_wpm() {
        let mut d = decoder(20.0);
        d.decode_audio(&encoded("TEST", 20.0));
        let tokens = d.take_tokens();
        assert_eq!(tokens.len(), 4);
        for t in &tokens {
            assert!((0.0..=1.0).contains(&t.confidence));
            assert!(t.wpm > 5.0);
        }
    }
}
