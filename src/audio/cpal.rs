// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! CPAL-backed output device.
//!
//! The stream is created and owned by a dedicated thread (cpal streams are
//! not Send on every platform). The callback derives the mix clock from the
//! stream's reported playback timestamp, so scheduling follows the hardware
//! clock rather than a self-tracked position.

use std::{
    error::Error,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use parking_lot::Mutex;
use tracing::{error, info};

use crate::config;
use crate::engine::Mixer;

use super::thread_priority::CallbackPriority;

/// A small wrapper around a cpal::Device carrying the stream parameters from
/// the configuration.
pub struct Device {
    name: String,
    channels: u16,
    sample_rate: u32,
    buffer_size: usize,
    device: cpal::Device,
    shutdown: Arc<AtomicBool>,
    stream_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Device {
    /// Gets the configured output device, or the host default.
    pub fn get(config: &config::Engine) -> Result<Device, Box<dyn Error>> {
        let host = cpal::default_host();
        let wanted = config.device();
        let device = if wanted == "default" {
            host.default_output_device()
                .ok_or("no default output device")?
        } else {
            host.output_devices()?
                .find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
                .ok_or_else(|| format!("no output device named {}", wanted))?
        };

        Ok(Device {
            name: device.name().unwrap_or_else(|_| wanted.to_string()),
            channels: config.channels(),
            sample_rate: config.sample_rate(),
            buffer_size: config.buffer_size(),
            device,
            shutdown: Arc::new(AtomicBool::new(false)),
            stream_thread: Mutex::new(None),
        })
    }

    /// Lists the names of output devices on the default host.
    pub fn list_names() -> Result<Vec<String>, Box<dyn Error>> {
        let host = cpal::default_host();
        let mut names = Vec::new();
        for device in host.output_devices()? {
            names.push(device.name()?);
        }
        Ok(names)
    }
}

impl crate::audio::Device for Device {
    fn start(&self, mut mixer: Mixer) -> Result<(), Box<dyn Error>> {
        let mut stream_thread = self.stream_thread.lock();
        if stream_thread.is_some() {
            return Err("output stream already started".into());
        }

        let device = self.device.clone();
        let stream_config = cpal::StreamConfig {
            channels: self.channels,
            sample_rate: self.sample_rate,
            buffer_size: cpal::BufferSize::Fixed(self.buffer_size as u32),
        };
        let shutdown = self.shutdown.clone();
        let mut priority = CallbackPriority::from_env();
        let name = self.name.clone();
        let sample_rate = self.sample_rate as f64;
        let channels = self.channels as usize;

        // The stream must live on the thread that created it.
        let handle = thread::spawn(move || {
            let mut epoch: Option<cpal::StreamInstant> = None;
            let mut fallback_frames: u64 = 0;

            let callback = move |data: &mut [f32], info: &cpal::OutputCallbackInfo| {
                priority.apply();

                let playback = info.timestamp().playback;
                let clock = match epoch.as_ref() {
                    Some(epoch) => playback
                        .duration_since(epoch)
                        .map(|d| d.as_secs_f64())
                        // Covers hosts whose clock is non-monotonic.
                        .unwrap_or(fallback_frames as f64 / sample_rate),
                    None => {
                        epoch = Some(playback);
                        0.0
                    }
                };

                mixer.render(data, clock);
                fallback_frames += (data.len() / channels) as u64;
            };

            let stream = match device.build_output_stream(
                &stream_config,
                callback,
                |err| error!(error = %err, "Output stream error"),
                None,
            ) {
                Ok(stream) => stream,
                Err(e) => {
                    error!(error = %e, device = name, "Failed to build output stream");
                    return;
                }
            };

            if let Err(e) = stream.play() {
                error!(error = %e, device = name, "Failed to start output stream");
                return;
            }
            info!(device = name, "Output stream started");

            while !shutdown.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_millis(50));
            }
            drop(stream);
            info!(device = name, "Output stream stopped");
        });

        *stream_thread = Some(handle);
        Ok(())
    }

    fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.stream_thread.lock().take() {
            let _ = handle.join();
        }
    }

    #[cfg(test)]
    fn to_mock(&self) -> Result<Arc<super::mock::Device>, Box<dyn Error>> {
        Err("not a mock device".into())
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (Channels={}) (cpal)", self.name, self.channels)
    }
}
