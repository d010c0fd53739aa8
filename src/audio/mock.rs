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

//! Mock output device that paces synthetic callbacks from a plain thread.
//!
//! Used by tests and headless environments. Rendered output is captured so
//! callers can assert on the mixed audio.

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

use parking_lot::Mutex;
use tracing::info;

use crate::config;
use crate::engine::Mixer;

/// A mock device. Renders into a captured buffer instead of hardware.
#[derive(Clone)]
pub struct Device {
    name: String,
    channels: u16,
    sample_rate: u32,
    buffer_frames: usize,
    shutdown: Arc<AtomicBool>,
    is_running: Arc<AtomicBool>,
    captured: Arc<Mutex<Vec<f32>>>,
    render_thread: Arc<Mutex<Option<thread::JoinHandle<()>>>>,
}

impl Device {
    /// Gets the given mock device.
    pub fn get(name: &str, config: &config::Engine) -> Device {
        Device {
            name: name.to_string(),
            channels: config.channels(),
            sample_rate: config.sample_rate(),
            buffer_frames: config.buffer_size(),
            shutdown: Arc::new(AtomicBool::new(false)),
            is_running: Arc::new(AtomicBool::new(false)),
            captured: Arc::new(Mutex::new(Vec::new())),
            render_thread: Arc::new(Mutex::new(None)),
        }
    }

    /// Returns true while the render thread is running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Relaxed)
    }

    /// Returns a copy of everything rendered so far (interleaved).
    pub fn captured(&self) -> Vec<f32> {
        self.captured.lock().clone()
    }

    /// Returns the number of frames rendered so far.
    pub fn rendered_frames(&self) -> usize {
        self.captured.lock().len() / self.channels as usize
    }
}

impl crate::audio::Device for Device {
    /// Drives the mixer at the configured buffer cadence with a synthetic
    /// clock, standing in for a hardware callback.
    fn start(&self, mut mixer: Mixer) -> Result<(), Box<dyn Error>> {
        let mut render_thread = self.render_thread.lock();
        if render_thread.is_some() {
            return Err("mock device already started".into());
        }

        let channels = self.channels as usize;
        let buffer_frames = self.buffer_frames;
        let period = buffer_frames as f64 / self.sample_rate as f64;
        let shutdown = self.shutdown.clone();
        let is_running = self.is_running.clone();
        let captured = self.captured.clone();
        let name = self.name.clone();

        is_running.store(true, Ordering::Relaxed);
        let handle = thread::spawn(move || {
            info!(device = name, "Mock output started");
            let mut buffer = vec![0.0f32; buffer_frames * channels];
            let mut clock = 0.0;

            while !shutdown.load(Ordering::Relaxed) {
                mixer.render(&mut buffer, clock);
                captured.lock().extend_from_slice(&buffer);
                clock += period;
                spin_sleep::sleep(Duration::from_secs_f64(period));
            }

            is_running.store(false, Ordering::Relaxed);
            info!(device = name, "Mock output stopped");
        });

        *render_thread = Some(handle);
        Ok(())
    }

    fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.render_thread.lock().take() {
            let _ = handle.join();
        }
        self.is_running.store(false, Ordering::Relaxed);
    }

    #[cfg(test)]
    fn to_mock(&self) -> Result<Arc<Device>, Box<dyn Error>> {
        Ok(Arc::new(self.clone()))
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (Mock)", self.name)
    }
}
