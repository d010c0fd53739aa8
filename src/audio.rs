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

//! Audio output devices that drive the mixing engine.

use std::{error::Error, fmt, sync::Arc};

use crate::config;
use crate::engine::Mixer;

pub mod cpal;
pub mod mock;
pub mod thread_priority;

/// An audio output device that owns the callback driving a [`Mixer`].
pub trait Device: fmt::Display + Send + Sync {
    /// Starts the output stream, moving the mixer into the audio callback.
    fn start(&self, mixer: Mixer) -> Result<(), Box<dyn Error>>;

    /// Stops the output stream and joins its threads.
    fn stop(&self);

    #[cfg(test)]
    fn to_mock(&self) -> Result<Arc<mock::Device>, Box<dyn Error>>;
}

/// Lists the names of output devices known to cpal.
pub fn list_devices() -> Result<Vec<String>, Box<dyn Error>> {
    cpal::Device::list_names()
}

/// Gets the device selected by the configuration.
///
/// Device names starting with "mock" select the simulated device.
pub fn get_device(config: &config::Engine) -> Result<Arc<dyn Device>, Box<dyn Error>> {
    let device = config.device();
    if device.starts_with("mock") {
        return Ok(Arc::new(mock::Device::get(device, config)));
    }

    Ok(Arc::new(cpal::Device::get(config)?))
}
