//! CW QSO trainer command line.
//!
//! ```text
//! cargo run -- --my-call EA1ABC --cq-mode POTA \
//!     --other-calls-file calls.txt --parks-file parks.csv \
//!     --p2p-percent 20 --wpm-out-start 18 --wpm-out-end 28
//! ```
//!
//! `--simulate` skips the audio path entirely and feeds typed text into
//! the state machine; `--input-mode keyboard` keys typed lines as Morse
//! and loops them back through the decoder.

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use clap::Parser;

use cwtrainer::config::{Config, DecoderPreset};
use cwtrainer::event::{CollectorSink, Event, EventKind, EventSink};
use cwtrainer::qso::{CqMode, Effect, QsoMachine, S4Prefix};
use cwtrainer::{callsigns, parks, patterns};

const EXIT_CONFIG: i32 = 2;
const EXIT_AUDIO: i32 = 3;
const EXIT_INTERRUPTED: i32 = 130;

#[derive(clap::Parser, Debug)]
#[command(version, about = "CW QSO trainer: work a simulated pileup in Morse")]
struct Opt {
    /// Verbosity level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Own callsign.
    #[arg(long, default_value = "EA4XYZ")]
    my_call: String,

    /// Fallback remote callsign when no pool file is loaded.
    #[arg(long)]
    other_call: Option<String>,

    /// CQ variant: SIMPLE, POTA or SOTA.
    #[arg(long, default_value = "POTA")]
    cq_mode: String,

    /// Dynamic callsign pool file.
    #[arg(long)]
    other_calls_file: Option<PathBuf>,

    /// POTA park reference CSV.
    #[arg(long)]
    parks_file: Option<PathBuf>,

    /// Own park reference for Park-to-Park exchanges.
    #[arg(long)]
    my_park_ref: Option<String>,

    /// Exchange pattern override file (YAML).
    #[arg(long)]
    patterns_file: Option<PathBuf>,

    /// Decoder target WPM when tracking is off.
    #[arg(long)]
    wpm_target: Option<f32>,

    /// Fixed TX speed.
    #[arg(long)]
    wpm_out: Option<f32>,

    /// Per-station random TX speed range.
    #[arg(long)]
    wpm_out_start: Option<f32>,
    #[arg(long)]
    wpm_out_end: Option<f32>,

    /// RX tone when auto-tone is off.
    #[arg(long)]
    tone_hz: Option<f32>,

    /// Fixed TX tone.
    #[arg(long)]
    tone_out_hz: Option<f32>,

    /// Per-station random TX tone range.
    #[arg(long)]
    tone_out_start_hz: Option<f32>,
    #[arg(long)]
    tone_out_end_hz: Option<f32>,

    /// Silence that ends a received message, in seconds.
    #[arg(long)]
    message_gap_sec: Option<f32>,

    /// Track the sender's speed.
    #[arg(long, overrides_with = "fixed_wpm")]
    auto_wpm: bool,
    #[arg(long)]
    fixed_wpm: bool,

    /// Track the sender's tone.
    #[arg(long, overrides_with = "fixed_tone")]
    auto_tone: bool,
    #[arg(long)]
    fixed_tone: bool,

    /// Decoder tuning preset: normal or noisy.
    #[arg(long)]
    decoder_preset: Option<String>,

    /// Maximum stations answering one CQ.
    #[arg(long)]
    max_stations: Option<usize>,

    /// Park-to-Park probability, percent (POTA only).
    #[arg(long)]
    p2p_percent: Option<f32>,

    /// Chance of a fresh caller after a QSO, percent.
    #[arg(long)]
    incoming_call_percent: Option<f32>,

    /// Accept 599 besides 5NN.
    #[arg(long)]
    allow_599: bool,

    /// Accept TU in the close-out.
    #[arg(long)]
    allow_tu: bool,

    /// Do not require or send prosign framing.
    #[arg(long)]
    disable_prosigns: bool,

    /// Prosign literal.
    #[arg(long)]
    prosign_literal: Option<String>,

    /// Legacy-flow ack prefix: R or RR.
    #[arg(long)]
    s4_prefix: Option<String>,

    /// Exchange flow variant.
    #[arg(long, overrides_with = "legacy_flow")]
    direct_flow: bool,
    #[arg(long)]
    legacy_flow: bool,

    /// Input source: audio or keyboard.
    #[arg(long, default_value = "audio")]
    input_mode: String,

    /// Audio device indices (see --list-devices).
    #[arg(long)]
    input_device: Option<usize>,
    #[arg(long)]
    output_device: Option<usize>,

    /// Encoder speed for gaps only (Farnsworth spacing).
    #[arg(long)]
    farnsworth_wpm: Option<f32>,

    /// TX volume, 0..1.
    #[arg(long)]
    volume: Option<f32>,

    /// RNG seed for reproducible sessions.
    #[arg(long)]
    seed: Option<u64>,

    /// Enumerate audio devices and exit.
    #[arg(long)]
    list_devices: bool,

    /// Text-only mode: type what you would key, see what the stations
    /// answer. Commands: /reset /export /quit.
    #[arg(long)]
    simulate: bool,
}

fn main() {
    let opt = Opt::parse();
    if let Err(e) = stderrlog::new()
        .module(module_path!())
        .module("cwtrainer")
        .verbosity(opt.verbose as usize + 1)
        .timestamp(stderrlog::Timestamp::Second)
        .init()
    {
        eprintln!("failed to initialize logging: {e}");
    }

    std::process::exit(match run(opt) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            EXIT_CONFIG
        }
    });
}

fn run(opt: Opt) -> Result<i32> {
    if opt.list_devices {
        return list_devices();
    }

    let config = build_config(&opt)?;
    let (machine, events) = build_machine(&opt, &config)?;

    if opt.simulate {
        return simulate(machine, events);
    }
    run_session(&opt, config, machine, events)
}

#[cfg(feature = "audio")]
fn list_devices() -> Result<i32> {
    let (inputs, outputs) = cwtrainer::audio_source::list_devices()?;
    println!("Input devices:");
    for (idx, name) in inputs {
        println!("  [{idx}] {name}");
    }
    println!("Output devices:");
    for (idx, name) in outputs {
        println!("  [{idx}] {name}");
    }
    Ok(0)
}

#[cfg(not(feature = "audio"))]
fn list_devices() -> Result<i32> {
    eprintln!("built without the audio feature");
    Ok(EXIT_AUDIO)
}

fn build_config(opt: &Opt) -> Result<Config> {
    let mut config = Config::default();

    config.audio.input_device = opt.input_device;
    config.audio.output_device = opt.output_device;

    config.qso.my_call = opt.my_call.to_ascii_uppercase();
    if let Some(call) = &opt.other_call {
        config.qso.other_call = call.to_ascii_uppercase();
    }
    config.qso.cq_mode = opt.cq_mode.parse::<CqMode>()?;
    if let Some(park) = &opt.my_park_ref {
        config.qso.my_park_ref = park.to_ascii_uppercase();
    }
    if let Some(n) = opt.max_stations {
        config.qso.max_stations = n.max(1);
    }
    if let Some(p) = opt.p2p_percent {
        config.qso.p2p_percent = p.clamp(0.0, 100.0);
    }
    if let Some(p) = opt.incoming_call_percent {
        config.qso.incoming_call_percent = p.clamp(0.0, 100.0);
    }
    config.qso.allow_599 = opt.allow_599;
    config.qso.allow_tu = opt.allow_tu;
    if opt.disable_prosigns {
        config.qso.use_prosigns = false;
    }
    if let Some(literal) = &opt.prosign_literal {
        config.qso.prosign_literal = literal.to_ascii_uppercase();
    }
    if let Some(prefix) = &opt.s4_prefix {
        config.qso.s4_prefix = prefix.parse::<S4Prefix>()?;
    }
    if opt.legacy_flow {
        config.qso.direct_flow = false;
    }

    let wpm_lo = opt.wpm_out_start.or(opt.wpm_out).unwrap_or(config.qso.wpm_out.0);
    let wpm_hi = opt.wpm_out_end.or(opt.wpm_out).unwrap_or(config.qso.wpm_out.1);
    config.qso.wpm_out = (wpm_lo, wpm_hi);
    let tone_lo = opt
        .tone_out_start_hz
        .or(opt.tone_out_hz)
        .unwrap_or(config.qso.tone_out_hz.0);
    let tone_hi = opt
        .tone_out_end_hz
        .or(opt.tone_out_hz)
        .unwrap_or(config.qso.tone_out_hz.1);
    config.qso.tone_out_hz = (tone_lo, tone_hi);

    if let Some(wpm) = opt.wpm_target {
        config.decoder.wpm_target = wpm;
    }
    if let Some(tone) = opt.tone_hz {
        config.decoder.tone_hz = tone;
    }
    if let Some(gap) = opt.message_gap_sec {
        if gap <= 0.0 {
            anyhow::bail!("--message-gap-sec must be positive");
        }
        config.decoder.message_gap_s = gap;
    }
    if opt.auto_wpm {
        config.decoder.auto_wpm = true;
    }
    if opt.fixed_wpm {
        config.decoder.auto_wpm = false;
    }
    if opt.auto_tone {
        config.decoder.auto_tone = true;
    }
    if opt.fixed_tone {
        config.decoder.auto_tone = false;
    }
    if let Some(preset) = &opt.decoder_preset {
        preset.parse::<DecoderPreset>()?.apply(&mut config.decoder);
    }

    config.encoder.farnsworth_wpm = opt.farnsworth_wpm;
    if let Some(volume) = opt.volume {
        config.encoder.volume = volume.clamp(0.0, 1.0);
        config.keyer.volume = config.encoder.volume;
    }

    match opt.input_mode.as_str() {
        "audio" | "keyboard" => {}
        other => anyhow::bail!("unknown input mode '{other}'"),
    }

    Ok(config.normalized())
}

fn build_machine(opt: &Opt, config: &Config) -> Result<(QsoMachine, Arc<CollectorSink>)> {
    use rand::SeedableRng;

    let events = CollectorSink::new();

    let (pattern_set, warning) = patterns::load_file(opt.patterns_file.as_deref());
    if let Some(warning) = warning {
        events.event(Event::new(EventKind::PatternsInvalid, warning));
    }

    let rng: Box<dyn rand::RngCore + Send> = match opt.seed {
        Some(seed) => Box::new(rand::rngs::StdRng::seed_from_u64(seed)),
        None => Box::new(rand::rngs::StdRng::from_os_rng()),
    };
    let mut machine = QsoMachine::with_parts(config.qso.clone(), pattern_set, rng);

    if let Some(path) = &opt.other_calls_file {
        let calls = callsigns::load_callsigns_file(path)
            .map_err(|e| anyhow::Error::msg(format!("{}: {e}", path.display())))?;
        machine.set_call_pool(calls);
    }
    if let Some(path) = &opt.parks_file {
        let refs = parks::load_park_refs_file(path)
            .map_err(|e| anyhow::Error::msg(format!("{}: {e}", path.display())))?;
        machine.set_park_pool(refs);
    }
    Ok((machine, events))
}

/// Text-only training loop on stdin.
fn simulate(mut machine: QsoMachine, events: Arc<CollectorSink>) -> Result<i32> {
    println!("Simulation mode (stdin). Commands: /reset /export /quit");
    let stdin = std::io::stdin();
    let interrupted = interrupt_flag()?;
    loop {
        if interrupted.load(Ordering::SeqCst) {
            return Ok(EXIT_INTERRUPTED);
        }
        print!("rx> ");
        std::io::stdout().flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            println!();
            return Ok(0);
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line.to_ascii_lowercase().as_str() {
            "/quit" => return Ok(0),
            "/reset" => {
                machine.reset();
                println!("Reset applied.");
                continue;
            }
            "/export" => {
                let path = export_session(&machine, &events)?;
                println!("Exported to {}", path.display());
                continue;
            }
            _ => {}
        }
        for effect in machine.feed(line) {
            match effect {
                Effect::Tx(job) => {
                    println!("TX {} ({} WPM, {} Hz)", job.text, job.wpm, job.tone_hz)
                }
                Effect::Event(event) => println!("EVT {event}"),
                Effect::Complete(record) => println!("LOG worked {}", record.call),
                Effect::StateChange(_) => {}
            }
        }
        println!("state: {:?}", machine.state());
    }
}

fn export_session(machine: &QsoMachine, events: &CollectorSink) -> Result<PathBuf> {
    let dir = PathBuf::from("logs");
    std::fs::create_dir_all(&dir)?;
    let stamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let path = dir.join(format!("qso_session_{stamp}.json"));
    let payload = serde_json::json!({
        "session": machine.export_session(),
        "events": events.snapshot(),
    });
    std::fs::write(&path, serde_json::to_string_pretty(&payload)?)?;
    Ok(path)
}

fn interrupt_flag() -> Result<Arc<AtomicBool>> {
    let flag = Arc::new(AtomicBool::new(false));
    let handler_flag = flag.clone();
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::SeqCst);
    })?;
    Ok(flag)
}

#[cfg(feature = "audio")]
fn run_session(
    opt: &Opt,
    config: Config,
    machine: QsoMachine,
    events: Arc<CollectorSink>,
) -> Result<i32> {
    use cwtrainer::audio_sink::CpalSink;
    use cwtrainer::audio_source::CpalSource;
    use cwtrainer::runtime::{AudioSink, AudioSource, Session, SystemClock};

    let sink: Box<dyn AudioSink> =
        match CpalSink::new(config.audio.sample_rate, config.audio.output_device) {
            Ok(sink) => Box::new(sink),
            Err(e) => {
                eprintln!("Audio error: {e:#}");
                return Ok(EXIT_AUDIO);
            }
        };
    let source: Option<Box<dyn AudioSource>> = if opt.input_mode == "audio" {
        Some(Box::new(CpalSource::new(
            config.audio.sample_rate,
            config.audio.input_device,
        )))
    } else {
        None
    };

    let session = match Session::start(
        config,
        machine,
        sink,
        source,
        events.clone(),
        Arc::new(SystemClock),
    ) {
        Ok(session) => session,
        Err(e) => {
            eprintln!("Audio error: {e}");
            return Ok(EXIT_AUDIO);
        }
    };

    let interrupted = interrupt_flag()?;
    let keyboard = opt.input_mode == "keyboard";
    println!(
        "{} Commands: /reset /export /quit",
        if keyboard {
            "Keyboard mode: typed lines are keyed as Morse."
        } else {
            "Listening. Send your CQ."
        }
    );

    let stdin = std::io::stdin();
    let code = loop {
        if interrupted.load(Ordering::SeqCst) {
            break EXIT_INTERRUPTED;
        }
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break 0;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line.to_ascii_lowercase().as_str() {
            "/quit" => break 0,
            "/reset" => {
                session.reset();
                continue;
            }
            "/export" => {
                let machine = session.machine();
                let machine = machine.lock().unwrap();
                let path = export_session(&machine, &events)?;
                println!("Exported to {}", path.display());
                continue;
            }
            _ => {}
        }
        if keyboard {
            session.key_text(line);
        } else {
            println!("(audio mode; use /reset, /export or /quit)");
        }
    };

    session.stop();
    Ok(code)
}

#[cfg(not(feature = "audio"))]
fn run_session(
    _opt: &Opt,
    _config: Config,
    _machine: QsoMachine,
    _events: Arc<CollectorSink>,
) -> Result<i32> {
    eprintln!("built without the audio feature; use --simulate");
    Ok(EXIT_AUDIO)
}
