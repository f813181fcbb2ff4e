//! Audio input through cpal.
//!
//! The input callback downmixes to mono and pushes fixed blocks into the
//! session's bounded queue. It never blocks; overruns drop the oldest
//! block and are surfaced by the decoder worker as events.

use std::sync::Arc;
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};

use anyhow::Result;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use log::{debug, error, info};

use crate::runtime::{AudioSource, BlockQueue};

pub struct CpalSource {
    sample_rate: u32,
    device_index: Option<usize>,
    shutdown: Option<SyncSender<()>>,
}

impl CpalSource {
    pub fn new(sample_rate: u32, device_index: Option<usize>) -> Self {
        Self {
            sample_rate,
            device_index,
            shutdown: None,
        }
    }
}

impl AudioSource for CpalSource {
    fn start(&mut self, queue: Arc<BlockQueue>) -> crate::Result<()> {
        let (shutdown, shutdown_rx) = sync_channel::<()>(0);
        let (ready_tx, ready_rx) = sync_channel::<Result<()>>(0);
        let sample_rate = self.sample_rate;
        let device_index = self.device_index;
        std::thread::spawn(move || {
            run_input_stream(sample_rate, device_index, queue, shutdown_rx, ready_tx);
        });
        ready_rx
            .recv()
            .map_err(|_| crate::Error::msg("audio source: stream thread died"))?
            .map_err(|e| crate::Error::msg(format!("{e}")))?;
        self.shutdown = Some(shutdown);
        Ok(())
    }

    fn stop(&mut self) {
        // Dropping the sender unparks the holder thread, which drops the
        // stream and releases the device.
        self.shutdown = None;
    }
}

fn run_input_stream(
    sample_rate: u32,
    device_index: Option<usize>,
    queue: Arc<BlockQueue>,
    shutdown: Receiver<()>,
    ready: SyncSender<Result<()>>,
) {
    let stream = match build_input_stream(sample_rate, device_index, queue) {
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
        error!("audio source: failed to start stream: {e}");
        return;
    }
    let _ = shutdown.recv();
    debug!("audio source: stream thread exiting");
}

fn build_input_stream(
    sample_rate: u32,
    device_index: Option<usize>,
    queue: Arc<BlockQueue>,
) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = match device_index {
        None => host
            .default_input_device()
            .ok_or_else(|| anyhow::Error::msg("audio source: no default input device"))?,
        Some(idx) => host
            .input_devices()?
            .nth(idx)
            .ok_or_else(|| anyhow::Error::msg(format!("audio source: no input device {idx}")))?,
    };
    info!("audio source device: {}", device.name()?);

    let mut config: cpal::StreamConfig = device.default_input_config()?.into();
    config.sample_rate = cpal::SampleRate(sample_rate);
    debug!("audio source config: {config:?}");

    let channels = config.channels as usize;
    let err_fn = |err| error!("audio source stream error: {err}");
    let stream = device.build_input_stream(
        &config,
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            let mono: Vec<f32> = if channels <= 1 {
                data.to_vec()
            } else {
                data.chunks(channels)
                    .map(|frame| frame.iter().sum::<f32>() / channels as f32)
                    .collect()
            };
            queue.push(mono);
        },
        err_fn,
        None,
    )?;
    Ok(stream)
}

/// Enumerate `(index, name)` for input and output devices.
pub fn list_devices() -> Result<(Vec<(usize, String)>, Vec<(usize, String)>)> {
    let host = cpal::default_host();
    let inputs = host
        .input_devices()?
        .enumerate()
        .map(|(idx, d)| (idx, d.name().unwrap_or_else(|_| "<unknown>".to_string())))
        .collect();
    let outputs = host
        .output_devices()?
        .enumerate()
        .map(|(idx, d)| (idx, d.name().unwrap_or_else(|_| "<unknown>".to_string())))
        .collect();
    Ok((inputs, outputs))
}
