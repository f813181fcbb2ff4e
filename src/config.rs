//! The explicit configuration record.
//!
//! Everything the core consumes is in here, typed and enumerated; the
//! binary assembles it from defaults plus CLI flags and hands it over. The
//! core never reads option soup.

use crate::decoder::DecoderConfig;
use crate::encoder::EncoderConfig;
use crate::keyer::KeyerConfig;
use crate::qso::QsoConfig;

/// Audio device glue settings.
#[derive(Debug, Clone)]
pub struct AudioConfig {
    pub sample_rate: u32,
    /// Frames per block pushed by the source.
    pub block_size: usize,
    pub input_device: Option<usize>,
    pub output_device: Option<usize>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            block_size: 512,
            input_device: None,
            output_device: None,
        }
    }
}

/// Named decoder tunings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderPreset {
    Normal,
    /// Slower and more conservative keying for marginal signals.
    Noisy,
}

impl DecoderPreset {
    pub fn apply(&self, cfg: &mut DecoderConfig) {
        match self {
            DecoderPreset::Normal => {
                let defaults = DecoderConfig::default();
                cfg.threshold_on = defaults.threshold_on;
                cfg.threshold_off = defaults.threshold_off;
                cfg.power_smooth = defaults.power_smooth;
                cfg.dah_threshold_dits = defaults.dah_threshold_dits;
                cfg.min_up_ratio = defaults.min_up_ratio;
            }
            DecoderPreset::Noisy => {
                cfg.threshold_on = 4.5;
                cfg.threshold_off = 2.7;
                cfg.power_smooth = 0.5;
                cfg.dah_threshold_dits = 2.8;
                cfg.min_up_ratio = 0.06;
            }
        }
    }
}

impl std::str::FromStr for DecoderPreset {
    type Err = crate::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "normal" => Ok(DecoderPreset::Normal),
            "noisy" => Ok(DecoderPreset::Noisy),
            other => Err(crate::Error::msg(format!("unknown decoder preset '{other}'"))),
        }
    }
}

/// Full session configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub audio: AudioConfig,
    pub decoder: DecoderConfig,
    pub encoder: EncoderConfig,
    pub keyer: KeyerConfig,
    pub qso: QsoConfig,
}

impl Config {
    /// Make the record self-consistent: one sample rate everywhere, one
    /// prosign literal everywhere, ranges the right way around.
    pub fn normalized(mut self) -> Self {
        self.decoder.sample_rate = self.audio.sample_rate;
        self.encoder.sample_rate = self.audio.sample_rate;
        self.keyer.sample_rate = self.audio.sample_rate;

        self.decoder.prosign_literal = self.qso.prosign_literal.clone();
        self.encoder.prosign_literal = self.qso.prosign_literal.clone();

        if self.qso.wpm_out.0 > self.qso.wpm_out.1 {
            self.qso.wpm_out = (self.qso.wpm_out.1, self.qso.wpm_out.0);
        }
        if self.qso.tone_out_hz.0 > self.qso.tone_out_hz.1 {
            self.qso.tone_out_hz = (self.qso.tone_out_hz.1, self.qso.tone_out_hz.0);
        }
        self.encoder.wpm = self.qso.wpm_out.0;
        self.encoder.tone_hz = self.qso.tone_out_hz.0;
        self
    }
}
