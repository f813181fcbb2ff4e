//! Encoder-to-decoder roundtrips over the air gap.

use rand::seq::IndexedRandom;
use rand::{Rng, SeedableRng};

use cwtrainer::decoder::{CWDecoder, DecoderConfig};
use cwtrainer::encoder::{CWEncoder, EncoderConfig};

fn encoder(wpm: f32, tone_hz: f32) -> CWEncoder {
    CWEncoder::new(EncoderConfig {
        wpm,
        tone_hz,
        volume: 0.5,
        ..Default::default()
    })
}

fn decoder(wpm: f32, tone_hz: f32) -> CWDecoder {
    CWDecoder::new(DecoderConfig {
        wpm_target: wpm,
        auto_wpm: false,
        tone_hz,
        ..Default::default()
    })
}

/// Character accuracy via edit distance, 0..1.
fn accuracy(want: &str, got: &str) -> f64 {
    let a: Vec<char> = want.chars().collect();
    let b: Vec<char> = got.chars().collect();
    let mut dist: Vec<Vec<usize>> = vec![vec![0; b.len() + 1]; a.len() + 1];
    for (i, row) in dist.iter_mut().enumerate() {
        row[0] = i;
    }
    for j in 0..=b.len() {
        dist[0][j] = j;
    }
    for i in 1..=a.len() {
        for j in 1..=b.len() {
            let sub = usize::from(a[i - 1] != b[j - 1]);
            dist[i][j] = (dist[i - 1][j] + 1)
                .min(dist[i][j - 1] + 1)
                .min(dist[i - 1][j - 1] + sub);
        }
    }
    1.0 - dist[a.len()][b.len()] as f64 / a.len().max(1) as f64
}

fn random_text(rng: &mut impl Rng, len: usize) -> String {
    const ALPHABET: &[char] = &[
        'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'I', 'J', 'K', 'L', 'M', 'N', 'O', 'P', 'Q',
        'R', 'S', 'T', 'U', 'V', 'W', 'X', 'Y', 'Z', '0', '1', '2', '3', '4', '5', '6', '7',
        '8', '9', '/', '?', '=', '+',
    ];
    let mut text = String::new();
    while text.len() < len {
        if !text.is_empty() {
            text.push(' ');
        }
        let word_len = rng.random_range(1..=6);
        for _ in 0..word_len {
            text.push(*ALPHABET.choose(rng).unwrap());
        }
    }
    text.truncate(len);
    text.trim().to_string()
}

#[test]
fn random_text_roundtrips_above_95_percent() {
    let mut rng = rand::rngs::StdRng::seed_from_u64(0xCAFE);
    for wpm in [15.0, 20.0, 25.0] {
        let text = random_text(&mut rng, 200);
        let audio = encoder(wpm, 650.0).encode_to_audio(&text);
        let decoded = decoder(wpm, 650.0).decode_audio(&audio);
        let acc = accuracy(&text, &decoded);
        assert!(
            acc > 0.95,
            "{wpm} WPM accuracy {acc:.3}\nwant: {text}\n got: {decoded}"
        );
    }
}

#[test]
fn quick_brown_fox_at_20_wpm() {
    let text = "THE QUICK BROWN FOX 123";
    let audio = encoder(20.0, 700.0).encode_to_audio(text);
    let decoded = decoder(20.0, 700.0).decode_audio(&audio);
    assert!(
        accuracy(text, &decoded) >= 0.95,
        "decoded {decoded:?}"
    );
}

#[test]
fn clean_text_roundtrips_exactly() {
    for text in ["PARIS", "CQ DE EA1ABC K", "5NN 5NN TU 73", "<CAVE> 73 EE"] {
        let audio = encoder(20.0, 600.0).encode_to_audio(text);
        let decoded = decoder(20.0, 600.0).decode_audio(&audio);
        assert_eq!(decoded, text);
    }
}

#[test]
fn two_dit_key_down_is_a_dah() {
    // Clean edges so the frame timing is exact.
    let enc = CWEncoder::new(EncoderConfig {
        wpm: 20.0,
        tone_hz: 600.0,
        volume: 0.5,
        attack_ms: 0.0,
        release_ms: 0.0,
        ..Default::default()
    });
    let mut dec = decoder(20.0, 600.0);
    // 120 ms is exactly two dits at 20 WPM: a dah, on the boundary.
    let audio = enc.render_pulses(&[(true, 0.12), (false, 1.5)]);
    assert_eq!(dec.decode_audio(&audio), "T");
    // Just under stays a dit.
    let mut dec = decoder(20.0, 600.0);
    let audio = enc.render_pulses(&[(true, 0.11), (false, 1.5)]);
    assert_eq!(dec.decode_audio(&audio), "E");
}

#[test]
fn auto_tone_finds_the_sender() {
    let mut dec = CWDecoder::new(DecoderConfig {
        wpm_target: 20.0,
        auto_wpm: false,
        tone_hz: 600.0,
        auto_tone: true,
        ..Default::default()
    });
    // Sender is way off the configured tone; the FFT sweep should pull
    // the decoder onto it within the first message.
    let audio = encoder(20.0, 950.0).encode_to_audio("VVV VVV CQ CQ DE EA1ABC");
    dec.decode_audio(&audio);
    let audio = encoder(20.0, 950.0).encode_to_audio("PARIS PARIS");
    assert_eq!(dec.decode_audio(&audio), "PARIS PARIS");
}

#[test]
fn prosign_survives_the_air_gap() {
    let audio = encoder(20.0, 600.0).encode_to_audio("<CAVE> UR 5NN 5NN TU 73 <CAVE>");
    let decoded = decoder(20.0, 600.0).decode_audio(&audio);
    assert_eq!(decoded, "<CAVE> UR 5NN 5NN TU 73 <CAVE>");
}
