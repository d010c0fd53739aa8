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

//! Relay of voice lifecycle events from the audio thread to observers.
//!
//! The audio thread is the sole producer. Events are delivered only when a
//! non-real-time consumer explicitly drains the relay, never synchronously
//! from the callback. For a given handle, the start event always precedes the
//! stop event; across handles no ordering is guaranteed.

use parking_lot::Mutex;

use super::command::HandleId;

/// What happened to a voice.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VoiceEventKind {
    Started,
    Stopped,
}

/// A voice lifecycle notification.
#[derive(Clone, Copy, Debug)]
pub struct VoiceEvent {
    pub handle: HandleId,
    /// The opaque tag supplied at schedule time.
    pub tag: i32,
    pub kind: VoiceEventKind,
}

pub type EventSender = crossbeam_channel::Sender<VoiceEvent>;
pub type EventReceiver = crossbeam_channel::Receiver<VoiceEvent>;

/// Creates the relay channel pair.
pub fn relay() -> (EventSender, EventReceiver) {
    crossbeam_channel::unbounded()
}

/// A registered voice notification callback.
pub type VoiceCallback = Box<dyn FnMut(HandleId, i32) + Send>;

/// Drains relay events and dispatches them to registered callbacks.
///
/// Callbacks run on whichever thread calls `drain`; by convention that is a
/// single non-real-time thread (e.g. once per UI frame).
pub struct EventDrain {
    rx: EventReceiver,
    on_start: Mutex<Option<VoiceCallback>>,
    on_stop: Mutex<Option<VoiceCallback>>,
}

impl EventDrain {
    /// Creates a drain over the consumer side of the relay.
    pub fn new(rx: EventReceiver) -> Self {
        Self {
            rx,
            on_start: Mutex::new(None),
            on_stop: Mutex::new(None),
        }
    }

    /// Registers the voice-start callback, replacing any previous one.
    pub fn set_on_start(&self, callback: VoiceCallback) {
        *self.on_start.lock() = Some(callback);
    }

    /// Registers the voice-stop callback, replacing any previous one.
    pub fn set_on_stop(&self, callback: VoiceCallback) {
        *self.on_stop.lock() = Some(callback);
    }

    /// Delivers all queued events to the registered callbacks.
    ///
    /// Returns the number of events delivered. Events with no registered
    /// callback are still consumed.
    pub fn drain(&self) -> usize {
        let mut on_start = self.on_start.lock();
        let mut on_stop = self.on_stop.lock();

        let mut delivered = 0;
        while let Ok(event) = self.rx.try_recv() {
            match event.kind {
                VoiceEventKind::Started => {
                    if let Some(callback) = on_start.as_mut() {
                        callback(event.handle, event.tag);
                    }
                }
                VoiceEventKind::Stopped => {
                    if let Some(callback) = on_stop.as_mut() {
                        callback(event.handle, event.tag);
                    }
                }
            }
            delivered += 1;
        }
        delivered
    }
}
