//! Iambic mode-A paddle keyer.
//!
//! A held paddle repeats its element; a squeeze alternates starting from
//! the last element sent; releasing both finishes the element in progress
//! and stops (mode A keeps no element memory). Rendering is incremental so
//! the runtime can pull sidetone in arbitrary block sizes, and every
//! started element is reported so the same keying can be looped back into
//! the decoder.

use crate::Float;

/// Which paddle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Paddle {
    Dit,
    Dah,
}

/// Paddle state change, as delivered by the input glue (keyboard, GPIO...).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEvent {
    Press(Paddle),
    Release(Paddle),
}

/// Keyed element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Element {
    Dit,
    Dah,
}

impl Element {
    pub fn as_char(&self) -> char {
        match self {
            Element::Dit => '.',
            Element::Dah => '-',
        }
    }
}

#[derive(Debug, Clone)]
pub struct KeyerConfig {
    pub sample_rate: u32,
    pub wpm: Float,
    pub tone_hz: Float,
    pub volume: Float,
    pub attack_ms: Float,
    pub release_ms: Float,
}

impl Default for KeyerConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            wpm: 20.0,
            tone_hz: 600.0,
            volume: 0.25,
            attack_ms: 2.0,
            release_ms: 3.0,
        }
    }
}

impl KeyerConfig {
    pub fn dit_seconds(&self) -> Float {
        1.2 / self.wpm.max(1.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Mark,
    Space,
}

pub struct IambicKeyer {
    config: KeyerConfig,
    dit_pressed: bool,
    dah_pressed: bool,

    phase: Phase,
    remaining: usize,
    current: Option<Element>,
    last_sent: Option<Element>,
    iambic_active: bool,
    tone_phase: Float,
    started: Vec<Element>,
    mark_elapsed: usize,
    mark_total: usize,
}

impl IambicKeyer {
    pub fn new(config: KeyerConfig) -> Self {
        Self {
            config,
            dit_pressed: false,
            dah_pressed: false,
            phase: Phase::Idle,
            remaining: 0,
            current: None,
            last_sent: None,
            iambic_active: false,
            tone_phase: 0.0,
            started: Vec::new(),
            mark_elapsed: 0,
            mark_total: 0,
        }
    }

    pub fn reset(&mut self) {
        self.dit_pressed = false;
        self.dah_pressed = false;
        self.phase = Phase::Idle;
        self.remaining = 0;
        self.current = None;
        self.iambic_active = false;
        self.tone_phase = 0.0;
        self.started.clear();
        self.mark_elapsed = 0;
        self.mark_total = 0;
    }

    /// True while a mark is being keyed.
    pub fn key_down(&self) -> bool {
        self.phase == Phase::Mark
    }

    pub fn set_paddles(&mut self, dit: bool, dah: bool) {
        self.dit_pressed = dit;
        self.dah_pressed = dah;
    }

    /// Apply one event from the paddle input stream.
    pub fn handle(&mut self, event: InputEvent) {
        match event {
            InputEvent::Press(Paddle::Dit) => self.dit_pressed = true,
            InputEvent::Press(Paddle::Dah) => self.dah_pressed = true,
            InputEvent::Release(Paddle::Dit) => self.dit_pressed = false,
            InputEvent::Release(Paddle::Dah) => self.dah_pressed = false,
        }
    }

    /// Elements started since the last drain, oldest first.
    pub fn pop_started_elements(&mut self) -> Vec<Element> {
        std::mem::take(&mut self.started)
    }

    pub fn render_seconds(&mut self, duration: Float) -> Vec<Float> {
        let n = (duration.max(0.0) * self.config.sample_rate as Float).round() as usize;
        self.render(n)
    }

    /// Render the next `num_samples` samples of sidetone, advancing the
    /// keying state machine as needed.
    pub fn render(&mut self, num_samples: usize) -> Vec<Float> {
        let mut out = vec![0.0; num_samples];
        let amp = self.config.volume.clamp(0.0, 1.0);
        let sr = self.config.sample_rate.max(1);
        let tone_step = 2.0 * std::f32::consts::PI * self.config.tone_hz.max(1.0) / sr as Float;

        let mut pos = 0;
        while pos < num_samples {
            if self.phase == Phase::Idle && !self.start_next_element() {
                break;
            }
            let seg = self.remaining.min(num_samples - pos);
            if seg == 0 {
                self.advance_phase();
                continue;
            }
            if self.phase == Phase::Mark {
                for i in 0..seg {
                    let wave = (self.tone_phase + tone_step * i as Float).sin();
                    out[pos + i] = wave * self.mark_envelope(self.mark_elapsed + i) * amp;
                }
                self.tone_phase = (self.tone_phase + tone_step * seg as Float)
                    % (2.0 * std::f32::consts::PI);
                self.mark_elapsed += seg;
            }
            pos += seg;
            self.remaining -= seg;
            if self.remaining == 0 {
                self.advance_phase();
            }
        }
        out
    }

    fn dit_samples(&self) -> usize {
        ((self.config.dit_seconds() * self.config.sample_rate as Float).round() as usize).max(1)
    }

    fn start_next_element(&mut self) -> bool {
        let Some(element) = self.choose_next_element() else {
            self.phase = Phase::Idle;
            self.remaining = 0;
            self.current = None;
            return false;
        };
        self.current = Some(element);
        self.phase = Phase::Mark;
        self.remaining = match element {
            Element::Dit => self.dit_samples(),
            Element::Dah => 3 * self.dit_samples(),
        };
        self.mark_elapsed = 0;
        self.mark_total = self.remaining;
        self.started.push(element);
        true
    }

    fn advance_phase(&mut self) {
        match self.phase {
            Phase::Mark => {
                self.last_sent = self.current;
                self.phase = Phase::Space;
                self.remaining = self.dit_samples();
                self.mark_elapsed = 0;
                self.mark_total = 0;
            }
            Phase::Space => {
                self.phase = Phase::Idle;
                self.remaining = 0;
                self.current = None;
            }
            Phase::Idle => {}
        }
    }

    fn choose_next_element(&mut self) -> Option<Element> {
        match (self.dit_pressed, self.dah_pressed) {
            (true, false) => {
                self.iambic_active = false;
                Some(Element::Dit)
            }
            (false, true) => {
                self.iambic_active = false;
                Some(Element::Dah)
            }
            (true, true) => {
                if !self.iambic_active {
                    self.iambic_active = true;
                    return Some(self.last_sent.unwrap_or(Element::Dit));
                }
                Some(match self.last_sent {
                    Some(Element::Dit) => Element::Dah,
                    _ => Element::Dit,
                })
            }
            (false, false) => {
                self.iambic_active = false;
                None
            }
        }
    }

    fn mark_envelope(&self, idx: usize) -> Float {
        let sr = self.config.sample_rate.max(1) as Float;
        let attack = (sr * self.config.attack_ms.max(0.0) / 1000.0).round();
        let release = (sr * self.config.release_ms.max(0.0) / 1000.0).round();
        let mut env = 1.0;
        if attack > 0.0 {
            env *= ((idx as Float + 1.0) / attack).clamp(0.0, 1.0);
        }
        if release > 0.0 && self.mark_total > 0 {
            let remaining = self.mark_total as Float - idx as Float;
            env *= (remaining / release).clamp(0.0, 1.0);
        }
        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keyer(wpm: Float) -> IambicKeyer {
        IambicKeyer::new(KeyerConfig {
            sample_rate: 8000,
            wpm,
            tone_hz: 600.0,
            volume: 0.8,
            ..Default::default()
        })
    }

    fn samples_for_dits(k: &IambicKeyer, dits: Float) -> usize {
        (k.config.sample_rate as Float * k.config.dit_seconds() * dits).round() as usize
    }

    #[test]
    fn held_dit_paddle_repeats_dits() {
        let mut k = keyer(20.0);
        k.set_paddles(true, false);
        let n = samples_for_dits(&k, 12.0);
        k.render(n);
        let started = k.pop_started_elements();
        assert!(started.len() >= 4);
        assert!(started.iter().all(|e| *e == Element::Dit));
    }

    #[test]
    fn held_dah_paddle_repeats_dahs() {
        let mut k = keyer(20.0);
        k.set_paddles(false, true);
        let n = samples_for_dits(&k, 20.0);
        k.render(n);
        let started = k.pop_started_elements();
        assert!(started.len() >= 3);
        assert!(started.iter().all(|e| *e == Element::Dah));
    }

    #[test]
    fn squeeze_alternates_from_last_element() {
        let mut k = keyer(18.0);
        k.set_paddles(false, true);
        let n = samples_for_dits(&k, 5.0);
        k.render(n);
        k.set_paddles(false, false);
        let n = samples_for_dits(&k, 2.0);
        k.render(n);
        k.pop_started_elements();

        k.set_paddles(true, true);
        let n = samples_for_dits(&k, 18.0);
        k.render(n);
        let seq = k.pop_started_elements();
        assert_eq!(
            &seq[..4],
            &[Element::Dah, Element::Dit, Element::Dah, Element::Dit]
        );
    }

    #[test]
    fn mode_a_stops_without_extra_element() {
        let mut k = keyer(20.0);
        // Prime the last element to a dit so the squeeze starts with one.
        k.set_paddles(true, false);
        let n = samples_for_dits(&k, 3.0);
        k.render(n);
        k.set_paddles(false, false);
        let n = samples_for_dits(&k, 2.0);
        k.render(n);
        k.pop_started_elements();

        k.set_paddles(true, true);
        // First dit + gap + half of the following dah.
        let n = samples_for_dits(&k, 3.5);
        k.render(n);
        k.set_paddles(false, false);
        let n = samples_for_dits(&k, 12.0);
        k.render(n);
        let seq = k.pop_started_elements();
        assert_eq!(seq, vec![Element::Dit, Element::Dah]);
    }

    #[test]
    fn input_events_drive_paddles() {
        let mut k = keyer(20.0);
        k.handle(InputEvent::Press(Paddle::Dit));
        assert!(k.dit_pressed);
        k.handle(InputEvent::Release(Paddle::Dit));
        assert!(!k.dit_pressed);
    }

    #[test]
    fn idle_renders_silence() {
        let mut k = keyer(20.0);
        let out = k.render(1000);
        assert!(out.iter().all(|s| *s == 0.0));
        assert!(!k.key_down());
    }
}
