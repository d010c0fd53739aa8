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

//! Voice state and the fixed-capacity voice pool.
//!
//! Voices are allocated once at engine construction and recycled between
//! notes; the audio thread never allocates or frees them.

use crate::store::SampleRecord;

use super::command::{HandleId, ScheduleCommand, INVALID_HANDLE};

/// The playback state of one concurrently-playing note.
///
/// Owned and mutated exclusively by the audio thread. Timing and the playback
/// cursor use f64 to avoid audible drift over long notes; gain and
/// interpolation use f32, matching the output sample format.
pub struct Voice {
    handle: HandleId,
    sample: Option<SampleRecord>,
    pitch: f64,
    gain: f32,
    tag: i32,
    start_time: f64,
    stop_time: f64,
    fade_out: f64,
    /// Fractional playback position in source-sample frames.
    cursor: f64,
    fade_progress: f32,
    active: bool,
    fading: bool,
}

impl Voice {
    fn idle() -> Self {
        Self {
            handle: INVALID_HANDLE,
            sample: None,
            pitch: 1.0,
            gain: 0.0,
            tag: 0,
            start_time: 0.0,
            stop_time: 0.0,
            fade_out: 0.0,
            cursor: 0.0,
            fade_progress: 0.0,
            active: false,
            fading: false,
        }
    }

    /// Populates this voice from a schedule command and starts it.
    pub fn activate(&mut self, command: ScheduleCommand, sample: SampleRecord) {
        self.handle = command.handle;
        self.sample = Some(sample);
        self.pitch = command.pitch;
        self.gain = command.gain;
        self.tag = command.tag;
        self.start_time = command.start_time;
        self.stop_time = command.stop_time;
        self.fade_out = command.fade_out;
        self.cursor = 0.0;
        self.fade_progress = 0.0;
        self.active = true;
        self.fading = false;
    }

    /// Records a deferred stop. A later stop overwrites an earlier one.
    pub fn apply_stop(&mut self, stop_time: f64, fade_out: f64) {
        self.stop_time = stop_time;
        self.fade_out = fade_out;
    }

    /// Silences the voice without a fade.
    pub fn deactivate(&mut self) {
        self.active = false;
    }

    /// Resets all fields to their defaults, releasing the sample reference.
    pub fn reset(&mut self) {
        *self = Voice::idle();
    }

    pub fn handle(&self) -> HandleId {
        self.handle
    }

    pub fn tag(&self) -> i32 {
        self.tag
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Renders this voice into the interleaved output buffer, accumulating
    /// into whatever is already there.
    ///
    /// `clock_start` is the callback-reported mix-clock time of the buffer's
    /// first frame. Returns false once the voice has finished (natural end,
    /// stop time with no fade, or fade completion) and should be retired.
    pub fn mix_into(
        &mut self,
        out: &mut [f32],
        channels: usize,
        clock_start: f64,
        output_rate: f64,
        master_gain: f32,
    ) -> bool {
        let sample = match &self.sample {
            Some(sample) => sample,
            None => {
                self.active = false;
                return false;
            }
        };
        let data = sample.data();
        let source_channels = sample.channel_count() as usize;
        let source_frames = sample.frame_count();

        let frames = out.len() / channels;
        let seconds_per_frame = 1.0 / output_rate;
        let cursor_step = (sample.sample_rate() as f64 / output_rate) * self.pitch;
        let fade_step = if self.fade_out > 0.0 {
            (1.0 / (self.fade_out * output_rate)) as f32
        } else {
            0.0
        };
        let base_gain = self.gain * master_gain;

        for frame in 0..frames {
            let now = clock_start + frame as f64 * seconds_per_frame;
            if now < self.start_time {
                continue;
            }

            // Natural end. Also retires voices over zero-length records.
            if self.cursor as usize >= source_frames {
                self.active = false;
                break;
            }

            if !self.fading && self.stop_time > 0.0 && now >= self.stop_time {
                if self.fade_out > 0.0 {
                    self.fading = true;
                } else {
                    self.active = false;
                    break;
                }
            }

            let fade_gain = if self.fading {
                self.fade_progress += fade_step;
                if self.fade_progress >= 1.0 {
                    self.active = false;
                    break;
                }
                1.0 - self.fade_progress
            } else {
                1.0
            };

            let index = self.cursor as usize;
            let frac = (self.cursor - index as f64) as f32;
            let next_index = (index + 1).min(source_frames - 1);
            let gain = base_gain * fade_gain;

            for channel in 0..channels {
                let source_channel = channel % source_channels;
                let s0 = data[index * source_channels + source_channel];
                let s1 = data[next_index * source_channels + source_channel];
                out[frame * channels + channel] += (s0 + (s1 - s0) * frac) * gain;
            }

            self.cursor += cursor_step;
        }

        self.active
    }
}

/// A fixed-capacity pool of reusable voices.
///
/// All voices and the free list are allocated up front; acquire and release
/// are O(1) and allocation-free.
pub struct VoicePool {
    voices: Vec<Voice>,
    free: Vec<usize>,
}

impl VoicePool {
    /// Creates a pool with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let voices = (0..capacity).map(|_| Voice::idle()).collect();
        let free = (0..capacity).rev().collect();
        Self { voices, free }
    }

    /// Draws a reset voice from the free list, or None if the pool is
    /// exhausted.
    pub fn acquire(&mut self) -> Option<usize> {
        self.free.pop()
    }

    /// Resets the voice at the given index and returns it to the free list.
    pub fn release(&mut self, index: usize) {
        self.voices[index].reset();
        self.free.push(index);
    }

    pub fn get_mut(&mut self, index: usize) -> &mut Voice {
        &mut self.voices[index]
    }

    /// Finds the index of the live voice backing the given handle, if any.
    pub fn find_active_index(&self, handle: HandleId) -> Option<usize> {
        self.voices
            .iter()
            .position(|v| v.active && v.handle == handle)
    }

    pub fn active_count(&self) -> usize {
        self.voices.len() - self.free.len()
    }

    pub fn capacity(&self) -> usize {
        self.voices.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SampleStore;

    fn record(frames: Vec<f32>, channels: u16, rate: u32) -> SampleRecord {
        let store = SampleStore::new();
        store.preload("test", frames, channels, rate).unwrap();
        store.try_get("test").unwrap()
    }

    fn command(handle: HandleId) -> ScheduleCommand {
        ScheduleCommand {
            handle,
            sample_id: "test".to_string(),
            pitch: 1.0,
            gain: 1.0,
            start_time: 0.0,
            stop_time: 0.0,
            fade_out: 0.0,
            tag: 0,
        }
    }

    #[test]
    fn test_pool_acquire_release() {
        let mut pool = VoicePool::new(2);
        assert_eq!(pool.capacity(), 2);

        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.active_count(), 2);
        assert!(pool.acquire().is_none());

        pool.release(a);
        assert_eq!(pool.active_count(), 1);
        assert_eq!(pool.acquire(), Some(a));
    }

    #[test]
    fn test_find_active_index() {
        let mut pool = VoicePool::new(4);
        let index = pool.acquire().unwrap();
        pool.get_mut(index)
            .activate(command(7), record(vec![0.0; 4], 1, 44100));

        assert_eq!(pool.find_active_index(7), Some(index));
        assert_eq!(pool.find_active_index(8), None);

        pool.release(index);
        assert_eq!(pool.find_active_index(7), None);
    }

    #[test]
    fn test_unit_pitch_is_passthrough() {
        // At pitch 1.0 with matching rates the cursor lands on integer
        // positions, so interpolation degenerates to the source samples.
        let source = vec![0.1f32, 0.2, 0.3, 0.4];
        let mut voice = Voice::idle();
        voice.activate(command(1), record(source.clone(), 1, 44100));

        let mut out = vec![0.0f32; 4];
        let active = voice.mix_into(&mut out, 1, 0.0, 44100.0, 1.0);
        assert!(active);
        assert_eq!(out, source);
    }

    #[test]
    fn test_mono_replicates_to_all_output_channels() {
        let mut voice = Voice::idle();
        voice.activate(command(1), record(vec![0.5, -0.5], 1, 44100));

        let mut out = vec![0.0f32; 4];
        voice.mix_into(&mut out, 2, 0.0, 44100.0, 1.0);
        assert_eq!(out, vec![0.5, 0.5, -0.5, -0.5]);
    }

    #[test]
    fn test_mix_accumulates() {
        let mut a = Voice::idle();
        let mut b = Voice::idle();
        a.activate(command(1), record(vec![0.25, 0.25], 1, 44100));
        b.activate(command(2), record(vec![0.5, 0.5], 1, 44100));

        let mut out = vec![0.0f32; 2];
        a.mix_into(&mut out, 1, 0.0, 44100.0, 1.0);
        b.mix_into(&mut out, 1, 0.0, 44100.0, 1.0);
        assert_eq!(out, vec![0.75, 0.75]);
    }

    #[test]
    fn test_half_pitch_interpolates() {
        let mut voice = Voice::idle();
        voice.activate(
            ScheduleCommand {
                pitch: 0.5,
                ..command(1)
            },
            record(vec![0.0, 1.0], 1, 44100),
        );

        let mut out = vec![0.0f32; 3];
        voice.mix_into(&mut out, 1, 0.0, 44100.0, 1.0);
        assert_eq!(out, vec![0.0, 0.5, 1.0]);
    }

    #[test]
    fn test_natural_end_deactivates() {
        let mut voice = Voice::idle();
        voice.activate(command(1), record(vec![1.0, 1.0], 1, 44100));

        let mut out = vec![0.0f32; 8];
        let active = voice.mix_into(&mut out, 1, 0.0, 44100.0, 1.0);
        assert!(!active);
        assert_eq!(&out[..2], &[1.0, 1.0]);
        assert_eq!(&out[2..], &[0.0; 6]);
    }

    #[test]
    fn test_empty_record_retires_immediately() {
        let mut voice = Voice::idle();
        voice.activate(command(1), record(Vec::new(), 1, 44100));

        let mut out = vec![0.0f32; 4];
        let active = voice.mix_into(&mut out, 1, 0.0, 44100.0, 1.0);
        assert!(!active);
        assert_eq!(out, vec![0.0; 4]);
    }

    #[test]
    fn test_frames_before_start_are_skipped() {
        let rate = 100.0;
        let mut voice = Voice::idle();
        voice.activate(
            ScheduleCommand {
                start_time: 0.02,
                ..command(1)
            },
            record(vec![1.0; 8], 1, 100),
        );

        let mut out = vec![0.0f32; 4];
        voice.mix_into(&mut out, 1, 0.0, rate, 1.0);
        // Frames at t=0.00 and t=0.01 precede the start time.
        assert_eq!(out, vec![0.0, 0.0, 1.0, 1.0]);
    }

    #[test]
    fn test_stop_without_fade_cuts() {
        let rate = 100.0;
        let mut voice = Voice::idle();
        voice.activate(
            ScheduleCommand {
                stop_time: 0.02,
                ..command(1)
            },
            record(vec![1.0; 8], 1, 100),
        );

        let mut out = vec![0.0f32; 4];
        let active = voice.mix_into(&mut out, 1, 0.0, rate, 1.0);
        assert!(!active);
        assert_eq!(out, vec![1.0, 1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_fade_out_ramps_to_silence() {
        let rate = 100.0;
        let mut voice = Voice::idle();
        voice.activate(
            ScheduleCommand {
                stop_time: 0.0, // natural end only
                ..command(1)
            },
            record(vec![1.0; 16], 1, 100),
        );
        voice.apply_stop(0.0401, 0.04);

        let mut out = vec![0.0f32; 16];
        let active = voice.mix_into(&mut out, 1, 0.0, rate, 1.0);
        assert!(!active);

        // Full level until the stop time, then a linear ramp down.
        assert_eq!(&out[..4], &[1.0; 4]);
        for window in out[4..9].windows(2) {
            assert!(window[1] < window[0], "fade must decrease: {:?}", &out);
        }
        // Fade progress reaches 1 after fade_out * rate = 4 faded frames.
        assert_eq!(&out[9..], &[0.0; 7]);
    }

    #[test]
    fn test_master_gain_scales_output() {
        let mut voice = Voice::idle();
        voice.activate(command(1), record(vec![0.8, 0.8], 1, 44100));

        let mut out = vec![0.0f32; 2];
        voice.mix_into(&mut out, 1, 0.0, 44100.0, 0.5);
        assert_eq!(out, vec![0.4, 0.4]);
    }
}
