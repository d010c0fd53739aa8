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

//! Commands crossing from producer threads to the audio thread.
//!
//! The channels are unbounded and multi-producer; the audio thread is the
//! sole consumer. Schedule commands are not time-ordered on the wire: the
//! consumer scans the queue once per callback and re-enqueues commands whose
//! start time has not arrived, so a note scheduled far in the future is
//! rescanned every callback until due.

/// Identifies a scheduled note across the thread boundary.
///
/// Handles are unique, monotonically increasing, and never reused.
pub type HandleId = u64;

/// Sentinel returned when a schedule call is rejected.
pub const INVALID_HANDLE: HandleId = 0;

/// Schedules a sample to start playing at an absolute mix-clock time.
#[derive(Clone, Debug)]
pub struct ScheduleCommand {
    pub handle: HandleId,
    /// Id of a sample previously preloaded into the store.
    pub sample_id: String,
    /// Playback rate multiplier on top of any sample-rate conversion.
    pub pitch: f64,
    /// Linear gain in [0, 1].
    pub gain: f32,
    /// Absolute mix-clock time at which playback starts.
    pub start_time: f64,
    /// Absolute mix-clock stop time; 0 plays to the natural end.
    pub stop_time: f64,
    /// Fade-out duration in seconds applied from the stop time.
    pub fade_out: f64,
    /// Opaque caller tag carried through voice events (e.g. a note number).
    pub tag: i32,
}

/// Stops a scheduled or playing note.
#[derive(Clone, Copy, Debug)]
pub struct StopCommand {
    pub handle: HandleId,
    /// Absolute mix-clock stop time; ignored for immediate stops.
    pub stop_time: f64,
    /// Fade-out duration in seconds; ignored for immediate stops.
    pub fade_out: f64,
    /// Silence the voice within the same callback, without a fade.
    pub immediate: bool,
}

impl StopCommand {
    /// A broadcast that silences every active voice within the next callback.
    pub fn all_immediate() -> Self {
        Self {
            handle: INVALID_HANDLE,
            stop_time: 0.0,
            fade_out: 0.0,
            immediate: true,
        }
    }

    /// Returns true if this is the stop-all broadcast.
    pub fn is_stop_all(&self) -> bool {
        self.handle == INVALID_HANDLE
    }
}

pub type ScheduleSender = crossbeam_channel::Sender<ScheduleCommand>;
pub type ScheduleReceiver = crossbeam_channel::Receiver<ScheduleCommand>;
pub type StopSender = crossbeam_channel::Sender<StopCommand>;
pub type StopReceiver = crossbeam_channel::Receiver<StopCommand>;
