/*! CW QSO trainer core.

Train on-air Morse exchanges against a pool of simulated stations: you key
CW into the microphone (or with paddles), the decoder turns it back into
text, the QSO engine validates it against the expected exchange for the
current state, and the encoder answers as the remote station, in audible CW.

# Architecture overview

The signal path is a straight line of workers connected by bounded queues:

```text
 [ AudioSource (cpal) ]
          ↓  sample blocks
    [ CWDecoder ]
          ↓  whole messages
    [ QsoMachine ]──────► events / completions
          ↓  TX effects
    [ CWEncoder ]
          ↓  sample blocks
 [ AudioSink (cpal) ]
```

The paddle keyer short-circuits the top of the graph: keyed elements go out
as sidetone and loop back into the decoder input, so the decode path is
identical whether the Morse came from the air or from the paddles.

All randomness (station draws, delays, per-station speed and pitch) goes
through an injected RNG, and all soft errors travel as [`event::Event`]
records rather than `Result`s, so the realtime path never unwinds.

# Example

```no_run
use cwtrainer::qso::{QsoConfig, QsoMachine};

let mut qso = QsoMachine::new(QsoConfig {
    my_call: "EA1ABC".into(),
    ..Default::default()
});
for effect in qso.feed("CQ POTA DE EA1ABC K") {
    println!("{effect:?}");
}
```
*/

pub mod callsigns;
pub mod config;
pub mod decoder;
pub mod encoder;
pub mod event;
pub mod goertzel;
pub mod keyer;
pub mod morse;
pub mod parks;
pub mod patterns;
pub mod qso;
pub mod runtime;

#[cfg(feature = "audio")]
pub mod audio_sink;

#[cfg(feature = "audio")]
pub mod audio_source;

/// Float type used for samples. Usually f32, but not guaranteed.
pub type Float = f32;

/// Crate error.
#[derive(Debug, Clone)]
pub struct Error {
    msg: String,
}

impl Error {
    /// Create error from message.
    pub fn msg(msg: impl Into<String>) -> Self {
        Self { msg: msg.into() }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "cwtrainer error: {}", self.msg)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::msg(format!("IO error: {e}"))
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::msg(format!("YAML error: {e}"))
    }
}

impl From<regex::Error> for Error {
    fn from(e: regex::Error) -> Self {
        Error::msg(format!("regex error: {e}"))
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::msg(format!("{e}"))
    }
}

/// Crate result.
pub type Result<T, E = Error> = std::result::Result<T, E>;
