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

use std::time::Duration;

use duration_string::DurationString;
use serde::Deserialize;

/// Default maximum number of concurrent voices.
pub const DEFAULT_MAX_VOICES: u32 = 64;

const DEFAULT_SAMPLE_RATE: u32 = 44100;
const DEFAULT_CHANNELS: u16 = 2;
const DEFAULT_BUFFER_SIZE: usize = 1024;
const DEFAULT_FADE_OUT: Duration = Duration::from_millis(50);

/// Typed error for config parse failures so callers can distinguish parse
/// errors from invalid values without string matching.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config parse error: {0}")]
    Parse(#[from] serde_yml::Error),

    #[error("Invalid duration: {0}")]
    InvalidDuration(String),
}

/// A YAML representation of the engine configuration.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct Engine {
    /// The audio device to play through. Names starting with "mock" select
    /// the simulated device.
    device: Option<String>,

    /// Target sample rate in Hz (default: 44100).
    sample_rate: Option<u32>,

    /// Number of output channels (default: 2).
    channels: Option<u16>,

    /// Maximum number of concurrent voices (default: 64).
    max_voices: Option<u32>,

    /// Initial master gain, clamped to [0, 1] (default: 1.0).
    master_gain: Option<f32>,

    /// Fade-out used by release scheduling when the caller does not specify
    /// one, e.g. "50ms".
    fade_out: Option<String>,

    /// Output buffer size in frames (default: 1024). Lower values reduce
    /// latency but are more sensitive to callback jitter.
    buffer_size: Option<usize>,
}

impl Engine {
    /// Creates a configuration with every value defaulted.
    pub fn new() -> Engine {
        Engine::default()
    }

    /// Parses a configuration from YAML.
    pub fn from_yaml(contents: &str) -> Result<Engine, ConfigError> {
        Ok(serde_yml::from_str(contents)?)
    }

    /// Returns the device name from the configuration.
    pub fn device(&self) -> &str {
        self.device.as_deref().unwrap_or("default")
    }

    /// Returns the target sample rate (default: 44100).
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate.unwrap_or(DEFAULT_SAMPLE_RATE)
    }

    /// Returns the number of output channels (default: 2).
    pub fn channels(&self) -> u16 {
        self.channels.unwrap_or(DEFAULT_CHANNELS).max(1)
    }

    /// Returns the maximum number of concurrent voices (default: 64).
    pub fn max_voices(&self) -> u32 {
        self.max_voices.unwrap_or(DEFAULT_MAX_VOICES).max(1)
    }

    /// Returns the initial master gain, clamped to [0, 1].
    pub fn master_gain(&self) -> f32 {
        let gain = self.master_gain.unwrap_or(1.0);
        if gain.is_finite() {
            gain.clamp(0.0, 1.0)
        } else {
            1.0
        }
    }

    /// Returns the default fade-out duration (default: 50ms).
    pub fn fade_out(&self) -> Result<Duration, ConfigError> {
        match &self.fade_out {
            Some(fade_out) => Ok(DurationString::from_string(fade_out.clone())
                .map_err(|e| ConfigError::InvalidDuration(format!("{}: {}", fade_out, e)))?
                .into()),
            None => Ok(DEFAULT_FADE_OUT),
        }
    }

    /// Returns the output buffer size in frames (default: 1024).
    pub fn buffer_size(&self) -> usize {
        self.buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE).max(1)
    }
}
