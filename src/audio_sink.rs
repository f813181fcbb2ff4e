//! Audio output through cpal.
//!
//! The device callback drains a shared sample buffer; writers mix into
//! that buffer additively with a hard limit, so sidetone and a station
//! reply can overlap without either path knowing about the other.
//!
//! cpal streams are not `Send`, so the stream lives on its own holder
//! thread and the handle the rest of the crate sees is just the shared
//! buffer.

use std::collections::VecDeque;
use std::sync::mpsc::{Receiver, sync_channel};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use log::{debug, error, info};

use crate::Float;
use crate::runtime::AudioSink;

type SharedBuffer = Arc<Mutex<VecDeque<Float>>>;

pub struct CpalSink {
    buffer: SharedBuffer,
    _shutdown: std::sync::mpsc::SyncSender<()>,
}

impl CpalSink {
    /// Open the output device (default, or by enumeration index) and start
    /// the stream.
    pub fn new(sample_rate: u32, device_index: Option<usize>) -> Result<Self> {
        let buffer: SharedBuffer = Arc::new(Mutex::new(VecDeque::new()));
        let (shutdown, shutdown_rx) = sync_channel::<()>(0);
        let (ready_tx, ready_rx) = sync_channel::<Result<()>>(0);

        let cb_buffer = buffer.clone();
        std::thread::spawn(move || {
            run_output_stream(sample_rate, device_index, cb_buffer, shutdown_rx, ready_tx);
        });
        ready_rx
            .recv()
            .map_err(|_| anyhow::Error::msg("audio sink: stream thread died"))??;

        Ok(Self {
            buffer,
            _shutdown: shutdown,
        })
    }
}

fn run_output_stream(
    sample_rate: u32,
    device_index: Option<usize>,
    buffer: SharedBuffer,
    shutdown: Receiver<()>,
    ready: std::sync::mpsc::SyncSender<Result<()>>,
) {
    let stream = match build_output_stream(sample_rate, device_index, buffer) {
        Ok(stream) => {
            let _ = ready.send(Ok(()));
            stream
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    if let Err(e) = stream.play() {
        error!("audio sink: failed to start stream: {e}");
        return;
    }
    // Parked here until the sink handle drops.
    let _ = shutdown.recv();
    debug!("audio sink: stream thread exiting");
}

fn build_output_stream(
    sample_rate: u32,
    device_index: Option<usize>,
    buffer: SharedBuffer,
) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    debug!("audio sink host: {}", host.id().name());
    let device = match device_index {
        None => host
            .default_output_device()
            .ok_or_else(|| anyhow::Error::msg("audio sink: no default output device"))?,
        Some(idx) => host
            .output_devices()?
            .nth(idx)
            .ok_or_else(|| anyhow::Error::msg(format!("audio sink: no output device {idx}")))?,
    };
    info!("audio sink device: {}", device.name()?);

    let mut config: cpal::StreamConfig = device.default_output_config()?.into();
    config.sample_rate = cpal::SampleRate(sample_rate);
    config.channels = 1;
    debug!("audio sink config: {config:?}");

    let channels = config.channels as usize;
    let err_fn = |err| error!("audio sink stream error: {err}");
    let stream = device.build_output_stream(
        &config,
        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
            let mut pending = buffer.lock().unwrap();
            for frame in data.chunks_mut(channels) {
                let value = pending.pop_front().unwrap_or(0.0);
                for sample in frame.iter_mut() {
                    *sample = value;
                }
            }
        },
        err_fn,
        None,
    )?;
    Ok(stream)
}

impl AudioSink for CpalSink {
    fn write(&mut self, samples: &[Float]) -> crate::Result<()> {
        let mut pending = self.buffer.lock().unwrap();
        let mixable = pending.len().min(samples.len());
        for (slot, s) in pending.iter_mut().zip(&samples[..mixable]) {
            *slot = (*slot + *s).clamp(-1.0, 1.0);
        }
        pending.extend(samples[mixable..].iter().map(|s| s.clamp(-1.0, 1.0)));
        Ok(())
    }
}
