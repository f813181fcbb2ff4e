//! Session runtime: the worker threads and queues that connect source,
//! decoder, state machine, encoder, and sink.
//!
//! Three workers: the decoder thread drains the input block queue, the
//! session thread is the sole mutator of the QSO machine, and the TX
//! thread serializes transmissions to the sink. The audio callback only
//! ever pushes into a bounded queue (oldest block dropped on overrun) and
//! never blocks.
//!
//! Cancellation uses a TX epoch: `reset` bumps it and in-flight or queued
//! transmissions from the old epoch are dropped at the next block boundary.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::Config;
use crate::decoder::{CWDecoder, DecoderStats};
use crate::encoder::CWEncoder;
use crate::event::{Event, EventKind, EventSink};
use crate::qso::{Effect, QsoMachine, TxJob};
use crate::{Float, Result};

/// Time source. Injected so tests can run the timers without waiting.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
    fn sleep_ms(&self, ms: u64);
}

/// Wall clock.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
    fn sleep_ms(&self, ms: u64) {
        std::thread::sleep(Duration::from_millis(ms));
    }
}

/// Virtual clock: sleeping advances time instantly. For tests.
#[derive(Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
    fn sleep_ms(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

/// Where rendered audio goes. `write` mixes the samples into whatever the
/// sink is already playing; implementations hard-limit at full scale.
pub trait AudioSink: Send {
    fn write(&mut self, samples: &[Float]) -> Result<()>;
}

/// Sample supplier. `start` gets the queue to push blocks into; the
/// implementation owns the device handle and must release it in `stop`.
pub trait AudioSource: Send {
    fn start(&mut self, queue: Arc<BlockQueue>) -> Result<()>;
    fn stop(&mut self);
}

/// Sink that just collects everything. For tests and simulate mode.
#[derive(Clone, Default)]
pub struct CollectorAudioSink {
    pub samples: Arc<Mutex<Vec<Float>>>,
}

impl AudioSink for CollectorAudioSink {
    fn write(&mut self, samples: &[Float]) -> Result<()> {
        self.samples.lock().unwrap().extend_from_slice(samples);
        Ok(())
    }
}

/// Bounded block queue between the audio callback and the decoder worker.
/// Push never blocks; when full, the oldest block goes and an overrun is
/// counted.
pub struct BlockQueue {
    blocks: Mutex<VecDeque<Vec<Float>>>,
    capacity: usize,
    overruns: AtomicU64,
}

impl BlockQueue {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            blocks: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            overruns: AtomicU64::new(0),
        })
    }

    /// Push one block. Returns false if an old block had to be dropped.
    pub fn push(&self, block: Vec<Float>) -> bool {
        let mut blocks = self.blocks.lock().unwrap();
        let mut clean = true;
        while blocks.len() >= self.capacity {
            blocks.pop_front();
            self.overruns.fetch_add(1, Ordering::Relaxed);
            clean = false;
        }
        blocks.push_back(block);
        clean
    }

    pub fn pop(&self) -> Option<Vec<Float>> {
        self.blocks.lock().unwrap().pop_front()
    }

    pub fn clear(&self) {
        self.blocks.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.blocks.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Overruns since the last call.
    pub fn take_overruns(&self) -> u64 {
        self.overruns.swap(0, Ordering::Relaxed)
    }
}

enum Command {
    Message(String),
    Reset,
    Stop,
}

enum TxCommand {
    Job { job: TxJob, epoch: u64 },
    Stop,
}

/// A running training session.
pub struct Session {
    control: Sender<Command>,
    tx_queue: Sender<TxCommand>,
    input: Arc<BlockQueue>,
    paused: Arc<AtomicBool>,
    stopping: Arc<AtomicBool>,
    epoch: Arc<AtomicU64>,
    machine: Arc<Mutex<QsoMachine>>,
    decoder_stats: Arc<Mutex<DecoderStats>>,
    config: Config,
    source: Option<Box<dyn AudioSource>>,
    workers: Vec<JoinHandle<()>>,
}

impl Session {
    /// Wire up and start all workers. The machine comes in preloaded with
    /// pools and patterns; `source` is `None` for keyboard/simulate input.
    pub fn start(
        config: Config,
        machine: QsoMachine,
        sink: Box<dyn AudioSink>,
        mut source: Option<Box<dyn AudioSource>>,
        events: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let input = BlockQueue::new(256);
        let paused = Arc::new(AtomicBool::new(false));
        let stopping = Arc::new(AtomicBool::new(false));
        let epoch = Arc::new(AtomicU64::new(0));
        let machine = Arc::new(Mutex::new(machine));
        let decoder_stats = Arc::new(Mutex::new(DecoderStats::default()));

        let (control, control_rx) = channel::<Command>();
        let (tx_queue, tx_rx) = channel::<TxCommand>();

        let synthesize_silence = source.is_none();
        if let Some(source) = source.as_mut() {
            source.start(input.clone())?;
        }

        let mut workers = Vec::new();
        workers.push(Self::spawn_decoder_worker(
            &config,
            input.clone(),
            control.clone(),
            events.clone(),
            paused.clone(),
            stopping.clone(),
            decoder_stats.clone(),
            synthesize_silence,
        ));
        workers.push(Self::spawn_session_worker(
            control_rx,
            machine.clone(),
            tx_queue.clone(),
            events.clone(),
            epoch.clone(),
        ));
        workers.push(Self::spawn_tx_worker(
            &config,
            tx_rx,
            sink,
            events,
            epoch.clone(),
            clock,
        ));

        Ok(Self {
            control,
            tx_queue,
            input,
            paused,
            stopping,
            epoch,
            machine,
            decoder_stats,
            config,
            source,
            workers,
        })
    }

    fn spawn_decoder_worker(
        config: &Config,
        input: Arc<BlockQueue>,
        control: Sender<Command>,
        events: Arc<dyn EventSink>,
        paused: Arc<AtomicBool>,
        stopping: Arc<AtomicBool>,
        stats: Arc<Mutex<DecoderStats>>,
        synthesize_silence: bool,
    ) -> JoinHandle<()> {
        let mut decoder = CWDecoder::new(config.decoder.clone());
        let sample_rate = config.audio.sample_rate;
        std::thread::spawn(move || {
            let idle = Duration::from_millis(20);
            let silence = vec![0.0; (sample_rate / 50) as usize];
            while !stopping.load(Ordering::SeqCst) {
                if paused.load(Ordering::SeqCst) {
                    std::thread::sleep(idle);
                    continue;
                }
                let overruns = input.take_overruns();
                if overruns > 0 {
                    events.event(Event::new(
                        EventKind::DecoderOverrun,
                        format!("{overruns} input block(s) dropped"),
                    ));
                }
                let messages = match input.pop() {
                    Some(block) => decoder.process(&block),
                    None => {
                        std::thread::sleep(idle);
                        if synthesize_silence {
                            // No live source pushing real silence; feed it
                            // ourselves so message gaps still elapse.
                            decoder.process(&silence)
                        } else {
                            Vec::new()
                        }
                    }
                };
                *stats.lock().unwrap() = decoder.stats().clone();
                for event in decoder.take_events() {
                    events.event(event);
                }
                for message in messages {
                    if control.send(Command::Message(message)).is_err() {
                        return;
                    }
                }
            }
        })
    }

    fn spawn_session_worker(
        control_rx: Receiver<Command>,
        machine: Arc<Mutex<QsoMachine>>,
        tx_queue: Sender<TxCommand>,
        events: Arc<dyn EventSink>,
        epoch: Arc<AtomicU64>,
    ) -> JoinHandle<()> {
        std::thread::spawn(move || {
            for command in control_rx {
                match command {
                    Command::Stop => break,
                    Command::Reset => {
                        machine.lock().unwrap().reset();
                    }
                    Command::Message(text) => {
                        log::info!("RX: {text}");
                        let effects = machine.lock().unwrap().feed(&text);
                        let current = epoch.load(Ordering::SeqCst);
                        for effect in effects {
                            match effect {
                                Effect::Tx(job) => {
                                    let _ = tx_queue.send(TxCommand::Job {
                                        job,
                                        epoch: current,
                                    });
                                }
                                Effect::Event(event) => events.event(event),
                                Effect::Complete(record) => {
                                    log::info!("QSO complete: {}", record.call);
                                }
                                Effect::StateChange(state) => {
                                    log::debug!("state -> {state:?}");
                                }
                            }
                        }
                    }
                }
            }
        })
    }

    fn spawn_tx_worker(
        config: &Config,
        tx_rx: Receiver<TxCommand>,
        mut sink: Box<dyn AudioSink>,
        events: Arc<dyn EventSink>,
        epoch: Arc<AtomicU64>,
        clock: Arc<dyn Clock>,
    ) -> JoinHandle<()> {
        let mut encoder = CWEncoder::new(config.encoder.clone());
        let block_size = config.audio.block_size.max(64);
        std::thread::spawn(move || {
            for command in tx_rx {
                let (job, job_epoch) = match command {
                    TxCommand::Stop => break,
                    TxCommand::Job { job, epoch } => (job, epoch),
                };
                let stale = || epoch.load(Ordering::SeqCst) != job_epoch;

                // Honor the per-station delay in small slices so a reset
                // cancels promptly.
                let mut remaining = job.delay_ms;
                while remaining > 0 && !stale() {
                    let slice = remaining.min(10);
                    clock.sleep_ms(slice);
                    remaining -= slice;
                }
                if stale() {
                    continue;
                }

                log::info!("TX: {} ({} WPM, {} Hz)", job.text, job.wpm, job.tone_hz);
                encoder.set_output(job.wpm, job.tone_hz);
                let audio = encoder.encode_to_audio(&job.text);
                for block in audio.chunks(block_size) {
                    if stale() {
                        break;
                    }
                    if let Err(e) = sink.write(block) {
                        events.event(Event::new(EventKind::AudioError, format!("{e}")));
                        break;
                    }
                }
            }
        })
    }

    /// Queue for the audio input callback.
    pub fn input_queue(&self) -> Arc<BlockQueue> {
        self.input.clone()
    }

    pub fn machine(&self) -> Arc<Mutex<QsoMachine>> {
        self.machine.clone()
    }

    pub fn decoder_stats(&self) -> DecoderStats {
        self.decoder_stats.lock().unwrap().clone()
    }

    /// Feed a text message straight into the state machine, bypassing the
    /// decoder. Simulate mode.
    pub fn feed_text(&self, text: &str) {
        let _ = self.control.send(Command::Message(text.to_string()));
    }

    /// Keyboard input mode: encode the line and loop the audio back into
    /// the decoder input, exercising the full decode path.
    ///
    /// This is not a realtime path, so unlike the audio callback it may
    /// throttle instead of overrunning the queue on long messages.
    pub fn key_text(&self, text: &str) {
        let encoder = CWEncoder::new(self.config.encoder.clone());
        let audio = encoder.encode_to_audio(text);
        for block in audio.chunks(self.config.audio.block_size.max(64)) {
            while self.input.len() >= 192 && !self.stopping.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(5));
            }
            self.input.push(block.to_vec());
        }
    }

    /// Stop consuming input. The queue may overrun while paused; that is
    /// expected.
    pub fn pause(&self, on: bool) {
        self.paused.store(on, Ordering::SeqCst);
    }

    pub fn paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Cancel any in-flight TX, drop queued work, return the machine to
    /// idle. Safe to call repeatedly.
    pub fn reset(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.input.clear();
        let _ = self.control.send(Command::Reset);
    }

    /// Shut everything down and release the devices.
    pub fn stop(mut self) {
        if let Some(source) = self.source.as_mut() {
            source.stop();
        }
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.stopping.store(true, Ordering::SeqCst);
        let _ = self.control.send(Command::Stop);
        let _ = self.tx_queue.send(TxCommand::Stop);
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qso::QsoConfig;
    use rand::SeedableRng;

    fn test_session() -> (Session, CollectorAudioSink, Arc<crate::event::CollectorSink>) {
        let config = Config::default().normalized();
        let machine = QsoMachine::with_parts(
            QsoConfig {
                my_call: "EA1ABC".to_string(),
                use_prosigns: false,
                ..Default::default()
            },
            Default::default(),
            Box::new(rand::rngs::StdRng::seed_from_u64(3)),
        );
        let sink = CollectorAudioSink::default();
        let events = crate::event::CollectorSink::new();
        let session = Session::start(
            config,
            machine,
            Box::new(sink.clone()),
            None,
            events.clone(),
            Arc::new(ManualClock::default()),
        )
        .unwrap();
        (session, sink, events)
    }

    fn wait_until(mut done: impl FnMut() -> bool) {
        for _ in 0..500 {
            if done() {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn block_queue_drops_oldest_on_overflow() {
        let q = BlockQueue::new(2);
        assert!(q.push(vec![1.0]));
        assert!(q.push(vec![2.0]));
        assert!(!q.push(vec![3.0]));
        assert_eq!(q.len(), 2);
        assert_eq!(q.pop().unwrap(), vec![2.0]);
        assert_eq!(q.take_overruns(), 1);
        assert_eq!(q.take_overruns(), 0);
    }

    #[test]
    fn manual_clock_advances_on_sleep() {
        let clock = ManualClock::default();
        assert_eq!(clock.now_ms(), 0);
        clock.sleep_ms(1500);
        assert_eq!(clock.now_ms(), 1500);
    }

    #[test]
    fn simulate_flow_produces_tx_audio() {
        let (session, sink, _events) = test_session();
        session.feed_text("CQ POTA DE EA1ABC K");
        wait_until(|| !sink.samples.lock().unwrap().is_empty());
        session.stop();
    }

    #[test]
    fn unexpected_input_reaches_event_sink() {
        let (session, _sink, events) = test_session();
        session.feed_text("FOO BAR");
        wait_until(|| events.count(EventKind::QsoUnexpectedInput) == 1);
        session.stop();
    }

    #[test]
    fn reset_returns_machine_to_idle() {
        let (session, _sink, _events) = test_session();
        session.feed_text("CQ POTA DE EA1ABC K");
        wait_until(|| {
            session.machine().lock().unwrap().state() == crate::qso::QsoState::S2WaitReport
        });
        session.reset();
        session.reset();
        wait_until(|| {
            session.machine().lock().unwrap().state() == crate::qso::QsoState::S0Idle
        });
        session.stop();
    }

    #[test]
    fn keyed_text_decodes_through_loopback() {
        let (session, _sink, _events) = test_session();
        session.key_text("CQ POTA DE EA1ABC K");
        wait_until(|| {
            session.machine().lock().unwrap().state() == crate::qso::QsoState::S2WaitReport
        });
        session.stop();
    }

    #[test]
    fn pause_stops_consumption() {
        let (session, _sink, _events) = test_session();
        session.pause(true);
        assert!(session.paused());
        session.key_text("TEST");
        // Queue keeps the blocks while paused.
        assert!(!session.input_queue().is_empty());
        session.pause(false);
        wait_until(|| session.input_queue().is_empty());
        session.stop();
    }
}
