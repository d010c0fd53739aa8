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

//! The per-callback mixing routine that runs on the audio thread.
//!
//! Each callback drains stop commands, activates due notes, renders every
//! active voice into the output buffer, and retires finished voices. All
//! timing decisions use the clock supplied by the callback, never a
//! self-tracked position.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::store::{SampleStore, StoreSnapshot};

use super::command::{
    HandleId, ScheduleCommand, ScheduleReceiver, ScheduleSender, StopReceiver,
};
use super::events::{EventSender, VoiceEvent, VoiceEventKind};
use super::voice::VoicePool;

/// A stop recorded for a note that has not yet been activated, applied at
/// activation time. At most one per handle; a later stop overwrites.
#[derive(Clone, Copy, Debug)]
struct PendingStop {
    stop_time: f64,
    fade_out: f64,
    immediate: bool,
}

/// Channel endpoints owned by the audio thread.
pub(crate) struct MixerChannels {
    pub schedule_rx: ScheduleReceiver,
    /// Not-yet-due schedule commands go back onto the same queue.
    pub schedule_requeue: ScheduleSender,
    pub stop_rx: StopReceiver,
    pub events: EventSender,
}

/// State shared with the producer-side engine context.
pub(crate) struct MixerShared {
    pub store: Arc<SampleStore>,
    pub master_gain: Arc<AtomicU32>,
    pub active_voices: Arc<AtomicUsize>,
    pub dropped_notes: Arc<AtomicU64>,
    pub missing_samples: Arc<AtomicU64>,
}

/// The audio-thread half of the engine.
///
/// Constructed by [`SamplerEngine::new`](super::SamplerEngine::new) and moved
/// into the output device's callback. Everything it touches per callback is
/// bounded: no locks beyond the store's snapshot read, no allocation in
/// steady state.
pub struct Mixer {
    channels: u16,
    sample_rate: u32,
    pool: VoicePool,
    pending_stops: HashMap<HandleId, PendingStop>,
    schedule_rx: ScheduleReceiver,
    schedule_requeue: ScheduleSender,
    stop_rx: StopReceiver,
    events: EventSender,
    store: Arc<SampleStore>,
    master_gain: Arc<AtomicU32>,
    active_voices: Arc<AtomicUsize>,
    dropped_notes: Arc<AtomicU64>,
    missing_samples: Arc<AtomicU64>,
    /// Diagnostic only; scheduling always uses the callback-reported clock.
    clock_position: f64,
    frames_written: u64,
}

impl Mixer {
    pub(crate) fn new(
        channels: u16,
        sample_rate: u32,
        max_voices: usize,
        chans: MixerChannels,
        shared: MixerShared,
    ) -> Self {
        Self {
            channels,
            sample_rate,
            pool: VoicePool::new(max_voices),
            pending_stops: HashMap::with_capacity(max_voices),
            schedule_rx: chans.schedule_rx,
            schedule_requeue: chans.schedule_requeue,
            stop_rx: chans.stop_rx,
            events: chans.events,
            store: shared.store,
            master_gain: shared.master_gain,
            active_voices: shared.active_voices,
            dropped_notes: shared.dropped_notes,
            missing_samples: shared.missing_samples,
            clock_position: 0.0,
            frames_written: 0,
        }
    }

    /// Returns the number of output channels.
    pub fn channel_count(&self) -> u16 {
        self.channels
    }

    /// Returns the output sample rate.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Returns the total number of frames rendered so far.
    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    /// Returns the mix-clock position after the last rendered buffer.
    pub fn clock_position(&self) -> f64 {
        self.clock_position
    }

    /// Renders one callback's worth of audio.
    ///
    /// `out` is an interleaved buffer of `frames * channels` samples;
    /// `clock_start` is the callback-reported mix-clock time of its first
    /// frame. Per-note failures (missing sample, pool exhausted) drop the
    /// note and continue; nothing escapes the callback.
    pub fn render(&mut self, out: &mut [f32], clock_start: f64) {
        let channels = self.channels as usize;
        let frames = out.len() / channels;
        let output_rate = self.sample_rate as f64;
        let end_time = clock_start + frames as f64 / output_rate;
        let master_gain = f32::from_bits(self.master_gain.load(Ordering::Relaxed));

        self.process_stops();
        self.activate_due(end_time);

        out.fill(0.0);

        for index in 0..self.pool.capacity() {
            let voice = self.pool.get_mut(index);
            if !voice.is_active() {
                continue;
            }
            if !voice.mix_into(out, channels, clock_start, output_rate, master_gain) {
                self.retire(index);
            }
        }

        self.clock_position = end_time;
        self.frames_written += frames as u64;
        self.active_voices
            .store(self.pool.active_count(), Ordering::Relaxed);
    }

    /// Drains the stop channel, applying immediate and deferred stops.
    fn process_stops(&mut self) {
        while let Ok(command) = self.stop_rx.try_recv() {
            if command.is_stop_all() {
                self.silence_all();
                continue;
            }

            match self.pool.find_active_index(command.handle) {
                Some(index) => {
                    if command.immediate {
                        self.retire(index);
                    } else {
                        self.pool
                            .get_mut(index)
                            .apply_stop(command.stop_time, command.fade_out);
                    }
                }
                None => {
                    // Not yet activated; remember the stop for activation
                    // time. Immediate stops are remembered too so a note
                    // stopped before it starts never becomes audible.
                    self.pending_stops.insert(
                        command.handle,
                        PendingStop {
                            stop_time: command.stop_time,
                            fade_out: command.fade_out,
                            immediate: command.immediate,
                        },
                    );
                }
            }
        }
    }

    /// Scans the schedule queue once, activating due notes and re-enqueueing
    /// the rest.
    ///
    /// The scan is bounded by the queue length observed at entry, so
    /// commands enqueued concurrently (including our own re-enqueues) wait
    /// for the next callback. A note is due when its start time is at or
    /// before the end of this buffer, so a note landing exactly on the
    /// boundary is not delayed by a full buffer.
    fn activate_due(&mut self, end_time: f64) {
        let queued = self.schedule_rx.len();
        if queued == 0 {
            return;
        }

        let snapshot = self.store.snapshot();
        for _ in 0..queued {
            let command = match self.schedule_rx.try_recv() {
                Ok(command) => command,
                Err(_) => break,
            };
            if command.start_time > end_time {
                let _ = self.schedule_requeue.send(command);
                continue;
            }
            self.activate(command, &snapshot);
        }
    }

    fn activate(&mut self, command: ScheduleCommand, snapshot: &StoreSnapshot) {
        let pending = self.pending_stops.remove(&command.handle);
        if let Some(pending) = pending {
            if pending.immediate {
                debug!(handle = command.handle, "Note cancelled before activation");
                return;
            }
        }

        let record = match snapshot.get(&command.sample_id) {
            Some(record) => record.clone(),
            None => {
                self.missing_samples.fetch_add(1, Ordering::Relaxed);
                warn!(
                    handle = command.handle,
                    sample = %command.sample_id,
                    "Sample not found, dropping note"
                );
                return;
            }
        };

        let index = match self.pool.acquire() {
            Some(index) => index,
            None => {
                self.dropped_notes.fetch_add(1, Ordering::Relaxed);
                warn!(
                    handle = command.handle,
                    capacity = self.pool.capacity(),
                    "Voice pool exhausted, dropping note"
                );
                return;
            }
        };

        let handle = command.handle;
        let tag = command.tag;
        let voice = self.pool.get_mut(index);
        voice.activate(command, record);
        if let Some(pending) = pending {
            // A stop issued before activation overrides the note's own stop.
            voice.apply_stop(pending.stop_time, pending.fade_out);
        }

        let _ = self.events.send(VoiceEvent {
            handle,
            tag,
            kind: VoiceEventKind::Started,
        });
    }

    /// Returns the voice to the pool and reports its stop.
    fn retire(&mut self, index: usize) {
        let voice = self.pool.get_mut(index);
        let handle = voice.handle();
        let tag = voice.tag();
        voice.deactivate();
        self.pool.release(index);
        let _ = self.events.send(VoiceEvent {
            handle,
            tag,
            kind: VoiceEventKind::Stopped,
        });
    }

    /// Immediately silences every active voice and forgets pending stops.
    fn silence_all(&mut self) {
        for index in 0..self.pool.capacity() {
            if self.pool.get_mut(index).is_active() {
                self.retire(index);
            }
        }
        self.pending_stops.clear();
    }
}

impl std::fmt::Debug for Mixer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mixer")
            .field("channels", &self.channels)
            .field("sample_rate", &self.sample_rate)
            .field("active_voices", &self.pool.active_count())
            .field("pending_stops", &self.pending_stops.len())
            .field("frames_written", &self.frames_written)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use crate::config;
    use crate::engine::{Mixer, SamplerEngine};

    // A power-of-two rate keeps every frame time exactly representable, so
    // boundary comparisons in these tests are not at the mercy of rounding.
    const RATE: u32 = 128;
    const FRAME: f64 = 1.0 / 128.0;

    fn engine(max_voices: u32) -> (SamplerEngine, Mixer) {
        let config = config::Engine::from_yaml(&format!(
            "sample_rate: {}\nchannels: 1\nmax_voices: {}",
            RATE, max_voices
        ))
        .unwrap();
        SamplerEngine::new(&config).unwrap()
    }

    fn preload_ones(engine: &SamplerEngine, id: &str, frames: usize) {
        engine
            .store()
            .preload(id, vec![1.0; frames], 1, RATE)
            .unwrap();
    }

    /// Collects (kind, handle, tag) triples from the event relay.
    fn record_events(engine: &SamplerEngine) -> Arc<Mutex<Vec<(&'static str, u64, i32)>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            engine.on_voice_start(move |handle, tag| seen.lock().push(("start", handle, tag)));
        }
        {
            let seen = seen.clone();
            engine.on_voice_stop(move |handle, tag| seen.lock().push(("stop", handle, tag)));
        }
        seen
    }

    #[test]
    fn test_renders_scheduled_note() {
        let (engine, mut mixer) = engine(4);
        engine
            .store()
            .preload("tone", vec![0.1, 0.2, 0.3, 0.4], 1, RATE)
            .unwrap();
        let seen = record_events(&engine);

        let handle = engine.schedule_note("tone", 0.0, None, 1.0, 1.0, 60, 0.0);
        assert_ne!(handle, crate::engine::INVALID_HANDLE);

        let mut out = vec![0.0f32; 4];
        mixer.render(&mut out, 0.0);
        assert_eq!(out, vec![0.1, 0.2, 0.3, 0.4]);
        assert_eq!(engine.active_voice_count(), 1);

        // The cursor has passed the end; the next callback retires the voice.
        mixer.render(&mut out, 4.0 * FRAME);
        assert_eq!(out, vec![0.0; 4]);
        assert_eq!(engine.active_voice_count(), 0);

        engine.drain_events();
        assert_eq!(
            seen.lock().as_slice(),
            &[("start", handle, 60), ("stop", handle, 60)]
        );
    }

    #[test]
    fn test_sub_callback_start_offset() {
        let (engine, mut mixer) = engine(4);
        preload_ones(&engine, "tone", 16);

        engine.schedule_note("tone", 5.0 * FRAME, None, 1.0, 1.0, 0, 0.0);

        let mut out = vec![0.0f32; 8];
        mixer.render(&mut out, 0.0);
        assert_eq!(&out[..5], &[0.0; 5]);
        assert_eq!(&out[5..], &[1.0; 3]);
    }

    #[test]
    fn test_start_at_buffer_end_is_due() {
        let (engine, mut mixer) = engine(4);
        preload_ones(&engine, "tone", 16);

        // Lands exactly on the boundary between the first and second buffer.
        engine.schedule_note("tone", 8.0 * FRAME, None, 1.0, 1.0, 0, 0.0);

        let mut out = vec![0.0f32; 8];
        mixer.render(&mut out, 0.0);
        assert_eq!(out, vec![0.0; 8]);
        assert_eq!(engine.active_voice_count(), 1);

        mixer.render(&mut out, 8.0 * FRAME);
        assert_eq!(out, vec![1.0; 8]);
    }

    #[test]
    fn test_future_note_is_rescanned_until_due() {
        let (engine, mut mixer) = engine(4);
        preload_ones(&engine, "tone", 16);

        engine.schedule_note("tone", 20.0 * FRAME, None, 1.0, 1.0, 0, 0.0);

        let mut out = vec![0.0f32; 8];
        mixer.render(&mut out, 0.0);
        assert_eq!(out, vec![0.0; 8]);
        assert_eq!(engine.active_voice_count(), 0);

        mixer.render(&mut out, 8.0 * FRAME);
        assert_eq!(out, vec![0.0; 8]);

        mixer.render(&mut out, 16.0 * FRAME);
        assert_eq!(&out[..4], &[0.0; 4]);
        assert_eq!(&out[4..], &[1.0; 4]);
    }

    #[test]
    fn test_pool_exhaustion_drops_excess_notes() {
        let (engine, mut mixer) = engine(64);
        preload_ones(&engine, "tone", 32);

        for _ in 0..65 {
            engine.schedule_note("tone", 0.0, None, 1.0, 1.0, 0, 0.0);
        }

        let mut out = vec![0.0f32; 8];
        mixer.render(&mut out, 0.0);

        assert_eq!(engine.active_voice_count(), 64);
        assert_eq!(engine.dropped_note_count(), 1);
        // All 64 unit-gain voices sum.
        assert_eq!(out[0], 64.0);
    }

    #[test]
    fn test_missing_sample_at_activation_drops_note() {
        let (engine, mut mixer) = engine(4);
        preload_ones(&engine, "tone", 16);

        engine.schedule_note("tone", 0.0, None, 1.0, 1.0, 0, 0.0);
        engine.store().clear();

        let mut out = vec![0.0f32; 8];
        mixer.render(&mut out, 0.0);

        assert_eq!(out, vec![0.0; 8]);
        assert_eq!(engine.active_voice_count(), 0);
        assert_eq!(engine.missing_sample_count(), 1);
    }

    #[test]
    fn test_stop_before_activation_is_applied_at_start() {
        let (engine, mut mixer) = engine(4);
        preload_ones(&engine, "tone", 32);
        let seen = record_events(&engine);

        let handle = engine.schedule_note("tone", 8.0 * FRAME, None, 1.0, 1.0, 1, 0.0);
        engine.schedule_stop(handle, 12.0 * FRAME, 0.0);

        let mut out = vec![0.0f32; 8];
        mixer.render(&mut out, 0.0);
        assert_eq!(out, vec![0.0; 8]);

        mixer.render(&mut out, 8.0 * FRAME);
        assert_eq!(&out[..4], &[1.0; 4]);
        assert_eq!(&out[4..], &[0.0; 4]);
        assert_eq!(engine.active_voice_count(), 0);

        engine.drain_events();
        assert_eq!(
            seen.lock().as_slice(),
            &[("start", handle, 1), ("stop", handle, 1)]
        );
    }

    #[test]
    fn test_stop_immediate_before_activation_never_plays() {
        let (engine, mut mixer) = engine(4);
        preload_ones(&engine, "tone", 32);

        let handle = engine.schedule_note("tone", 8.0 * FRAME, None, 1.0, 1.0, 0, 0.0);
        engine.stop_immediate(handle);

        let mut out = vec![0.0f32; 8];
        mixer.render(&mut out, 0.0);
        mixer.render(&mut out, 8.0 * FRAME);

        assert_eq!(out, vec![0.0; 8]);
        assert_eq!(engine.active_voice_count(), 0);
        assert_eq!(engine.drain_events(), 0);
    }

    #[test]
    fn test_stop_immediate_silences_within_next_callback() {
        let (engine, mut mixer) = engine(4);
        preload_ones(&engine, "tone", 32);

        let handle = engine.schedule_note("tone", 0.0, None, 1.0, 1.0, 0, 0.0);

        let mut out = vec![0.0f32; 8];
        mixer.render(&mut out, 0.0);
        assert_eq!(out, vec![1.0; 8]);

        engine.stop_immediate(handle);
        mixer.render(&mut out, 8.0 * FRAME);
        assert_eq!(out, vec![0.0; 8]);
        assert_eq!(engine.active_voice_count(), 0);
    }

    #[test]
    fn test_deferred_stop_fades_out() {
        let (engine, mut mixer) = engine(4);
        preload_ones(&engine, "tone", 32);

        let handle = engine.schedule_note("tone", 0.0, None, 1.0, 1.0, 0, 0.0);
        // Fade over 4 frames starting at frame 8.
        engine.schedule_stop(handle, 8.0 * FRAME, 4.0 * FRAME);

        let mut out = vec![0.0f32; 16];
        mixer.render(&mut out, 0.0);

        assert_eq!(&out[..8], &[1.0; 8]);
        assert_eq!(&out[8..12], &[0.75, 0.5, 0.25, 0.0]);
        assert_eq!(&out[12..], &[0.0; 4]);
        assert_eq!(engine.active_voice_count(), 0);
    }

    #[test]
    fn test_stop_all_silences_and_cancels() {
        let (engine, mut mixer) = engine(8);
        preload_ones(&engine, "tone", 64);
        let seen = record_events(&engine);

        let a = engine.schedule_note("tone", 0.0, None, 1.0, 1.0, 10, 0.0);
        let b = engine.schedule_note("tone", 0.0, None, 1.0, 1.0, 11, 0.0);
        let future = engine.schedule_note("tone", 32.0 * FRAME, None, 1.0, 1.0, 12, 0.0);
        assert_ne!(future, crate::engine::INVALID_HANDLE);

        let mut out = vec![0.0f32; 8];
        mixer.render(&mut out, 0.0);
        assert_eq!(engine.active_voice_count(), 2);

        engine.stop_all();

        mixer.render(&mut out, 8.0 * FRAME);
        assert_eq!(out, vec![0.0; 8]);
        assert_eq!(engine.active_voice_count(), 0);

        // The far-future note was drained before it could activate.
        mixer.render(&mut out, 32.0 * FRAME);
        assert_eq!(out, vec![0.0; 8]);

        engine.drain_events();
        let events = seen.lock();
        assert_eq!(events.len(), 4);
        assert_eq!(events[0], ("start", a, 10));
        assert_eq!(events[1], ("start", b, 11));
        assert!(events[2..].contains(&("stop", a, 10)));
        assert!(events[2..].contains(&("stop", b, 11)));
    }

    #[test]
    fn test_master_gain_scales_mix() {
        let (engine, mut mixer) = engine(4);
        preload_ones(&engine, "tone", 32);

        engine.schedule_note("tone", 0.0, None, 1.0, 1.0, 0, 0.0);
        engine.set_master_gain(0.5);

        let mut out = vec![0.0f32; 8];
        mixer.render(&mut out, 0.0);
        assert_eq!(out, vec![0.5; 8]);

        engine.set_master_gain(3.0);
        assert_eq!(engine.master_gain(), 1.0);
        engine.set_master_gain(-2.0);
        assert_eq!(engine.master_gain(), 0.0);
    }

    #[test]
    fn test_telemetry_advances() {
        let (engine, mut mixer) = engine(4);
        preload_ones(&engine, "tone", 8);
        engine.schedule_note("tone", 0.0, None, 1.0, 1.0, 0, 0.0);

        let mut out = vec![0.0f32; 8];
        mixer.render(&mut out, 0.0);
        mixer.render(&mut out, 8.0 * FRAME);

        assert_eq!(mixer.frames_written(), 16);
        assert_eq!(mixer.clock_position(), 16.0 * FRAME);
        assert_eq!(mixer.channel_count(), 1);
        assert_eq!(mixer.sample_rate(), RATE);
    }
}
