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

//! The producer-facing engine context.
//!
//! [`SamplerEngine`] is constructed once by the application's composition
//! root and shared (by reference or Arc) with every thread that schedules
//! notes. Its counterpart [`Mixer`] is moved into the audio device and runs
//! on the callback. The two halves communicate only through lock-free
//! channels and shared atomics.

pub mod command;
pub mod events;
pub mod mixer;
pub mod voice;

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config;
use crate::config::ConfigError;
use crate::store::SampleStore;

use command::{ScheduleCommand, ScheduleReceiver, ScheduleSender, StopCommand, StopSender};
use events::EventDrain;
use mixer::{MixerChannels, MixerShared};

pub use command::{HandleId, INVALID_HANDLE};
pub use events::{VoiceEvent, VoiceEventKind};
pub use mixer::Mixer;

/// Schedules notes and controls playback from non-real-time threads.
///
/// All methods are callable concurrently. Scheduling never blocks on the
/// audio thread; failures are reported synchronously as [`INVALID_HANDLE`],
/// never across the callback boundary.
pub struct SamplerEngine {
    store: Arc<SampleStore>,
    schedule_tx: ScheduleSender,
    /// Second endpoint on the schedule queue, used by stop_all to cancel
    /// notes that have not reached the mixer yet.
    schedule_drain: ScheduleReceiver,
    stop_tx: StopSender,
    next_handle: AtomicU64,
    master_gain: Arc<AtomicU32>,
    active_voices: Arc<AtomicUsize>,
    dropped_notes: Arc<AtomicU64>,
    missing_samples: Arc<AtomicU64>,
    /// Fade-out in seconds applied by schedule_release.
    default_fade: f64,
    events: EventDrain,
}

impl SamplerEngine {
    /// Creates the engine context and its audio-thread half.
    ///
    /// The returned [`Mixer`] must be handed to an output device (or driven
    /// manually in tests); the engine is inert until something calls
    /// [`Mixer::render`].
    pub fn new(config: &config::Engine) -> Result<(SamplerEngine, Mixer), ConfigError> {
        let (schedule_tx, schedule_rx) = crossbeam_channel::unbounded();
        let (stop_tx, stop_rx) = crossbeam_channel::unbounded();
        let (event_tx, event_rx) = events::relay();

        let store = Arc::new(SampleStore::new());
        let master_gain = Arc::new(AtomicU32::new(config.master_gain().to_bits()));
        let active_voices = Arc::new(AtomicUsize::new(0));
        let dropped_notes = Arc::new(AtomicU64::new(0));
        let missing_samples = Arc::new(AtomicU64::new(0));
        let default_fade = config.fade_out()?.as_secs_f64();

        let mixer = Mixer::new(
            config.channels(),
            config.sample_rate(),
            config.max_voices() as usize,
            MixerChannels {
                schedule_rx: schedule_rx.clone(),
                schedule_requeue: schedule_tx.clone(),
                stop_rx,
                events: event_tx,
            },
            MixerShared {
                store: store.clone(),
                master_gain: master_gain.clone(),
                active_voices: active_voices.clone(),
                dropped_notes: dropped_notes.clone(),
                missing_samples: missing_samples.clone(),
            },
        );

        let engine = SamplerEngine {
            store,
            schedule_tx,
            schedule_drain: schedule_rx,
            stop_tx,
            next_handle: AtomicU64::new(1),
            master_gain,
            active_voices,
            dropped_notes,
            missing_samples,
            default_fade,
            events: EventDrain::new(event_rx),
        };

        info!(
            sample_rate = config.sample_rate(),
            channels = config.channels(),
            max_voices = config.max_voices(),
            "Sampler engine created"
        );

        Ok((engine, mixer))
    }

    /// Schedules a note to start at an absolute mix-clock time.
    ///
    /// `stop_time` of None plays the sample to its natural end. Returns
    /// [`INVALID_HANDLE`] if the sample is unknown or a parameter is invalid.
    #[allow(clippy::too_many_arguments)]
    pub fn schedule_note(
        &self,
        sample_id: &str,
        start_time: f64,
        stop_time: Option<f64>,
        gain: f32,
        pitch: f64,
        tag: i32,
        fade_out: f64,
    ) -> HandleId {
        if !self.store.is_cached(sample_id) {
            warn!(sample = sample_id, "Cannot schedule unknown sample");
            return INVALID_HANDLE;
        }
        if !gain.is_finite() || gain < 0.0 {
            warn!(sample = sample_id, gain, "Rejecting invalid gain");
            return INVALID_HANDLE;
        }
        if !pitch.is_finite() || pitch <= 0.0 {
            warn!(sample = sample_id, pitch, "Rejecting invalid pitch");
            return INVALID_HANDLE;
        }
        if !start_time.is_finite() {
            warn!(sample = sample_id, "Rejecting non-finite start time");
            return INVALID_HANDLE;
        }

        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let command = ScheduleCommand {
            handle,
            sample_id: sample_id.to_string(),
            pitch,
            gain: gain.min(1.0),
            start_time,
            stop_time: stop_time.unwrap_or(0.0),
            fade_out: fade_out.max(0.0),
            tag,
        };
        if self.schedule_tx.send(command).is_err() {
            return INVALID_HANDLE;
        }

        debug!(handle, sample = sample_id, start_time, "Note scheduled");
        handle
    }

    /// Schedules a stop for the given note at an absolute mix-clock time.
    ///
    /// If the note has not been activated yet, the stop is held until
    /// activation; it is never silently dropped.
    pub fn schedule_stop(&self, handle: HandleId, stop_time: f64, fade_out: f64) {
        if handle == INVALID_HANDLE {
            return;
        }
        let _ = self.stop_tx.send(StopCommand {
            handle,
            stop_time,
            fade_out: fade_out.max(0.0),
            immediate: false,
        });
    }

    /// Schedules a stop using the configured default fade-out.
    pub fn schedule_release(&self, handle: HandleId, stop_time: f64) {
        self.schedule_stop(handle, stop_time, self.default_fade);
    }

    /// Silences the given note within the next callback, without a fade.
    pub fn stop_immediate(&self, handle: HandleId) {
        if handle == INVALID_HANDLE {
            return;
        }
        let _ = self.stop_tx.send(StopCommand {
            handle,
            stop_time: 0.0,
            fade_out: 0.0,
            immediate: true,
        });
    }

    /// Cancels all scheduled notes and silences all active voices.
    ///
    /// Best effort: a note enqueued concurrently by another producer thread
    /// may slip past the drain and play.
    pub fn stop_all(&self) {
        let mut cancelled = 0;
        while self.schedule_drain.try_recv().is_ok() {
            cancelled += 1;
        }
        let _ = self.stop_tx.send(StopCommand::all_immediate());
        if cancelled > 0 {
            debug!(cancelled, "Cancelled scheduled notes");
        }
    }

    /// Sets the master gain, clamped to [0, 1].
    pub fn set_master_gain(&self, gain: f32) {
        if !gain.is_finite() {
            warn!(gain, "Ignoring non-finite master gain");
            return;
        }
        self.master_gain
            .store(gain.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    /// Returns the current master gain.
    pub fn master_gain(&self) -> f32 {
        f32::from_bits(self.master_gain.load(Ordering::Relaxed))
    }

    /// Returns the number of voices live as of the last completed callback.
    pub fn active_voice_count(&self) -> usize {
        self.active_voices.load(Ordering::Relaxed)
    }

    /// Returns how many notes were dropped because the voice pool was full.
    pub fn dropped_note_count(&self) -> u64 {
        self.dropped_notes.load(Ordering::Relaxed)
    }

    /// Returns how many notes were dropped because their sample was missing
    /// at activation time.
    pub fn missing_sample_count(&self) -> u64 {
        self.missing_samples.load(Ordering::Relaxed)
    }

    /// Returns the sample store.
    pub fn store(&self) -> &SampleStore {
        &self.store
    }

    /// Registers the voice-start callback, replacing any previous one.
    pub fn on_voice_start<F>(&self, callback: F)
    where
        F: FnMut(HandleId, i32) + Send + 'static,
    {
        self.events.set_on_start(Box::new(callback));
    }

    /// Registers the voice-stop callback, replacing any previous one.
    pub fn on_voice_stop<F>(&self, callback: F)
    where
        F: FnMut(HandleId, i32) + Send + 'static,
    {
        self.events.set_on_stop(Box::new(callback));
    }

    /// Delivers queued voice events to the registered callbacks.
    ///
    /// Call from one non-real-time thread, e.g. once per UI frame. Returns
    /// the number of events delivered.
    pub fn drain_events(&self) -> usize {
        self.events.drain()
    }
}

impl std::fmt::Debug for SamplerEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SamplerEngine")
            .field("active_voices", &self.active_voice_count())
            .field("dropped_notes", &self.dropped_note_count())
            .field("cached_samples", &self.store.stats().count)
            .field("master_gain", &self.master_gain())
            .finish()
    }
}
