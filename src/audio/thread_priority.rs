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

//! Scheduling priority for the audio callback thread.
//!
//! The audio host owns the callback thread, so elevation has to happen from
//! inside the callback itself rather than at spawn time. The environment is
//! read once when the device starts, never in the hot path.

use thread_priority::{set_current_thread_priority, ThreadPriority, ThreadPriorityValue};
use tracing::{info, warn};

/// Priority used when POLYMIX_THREAD_PRIORITY is unset.
const DEFAULT_PRIORITY: u8 = 70;

/// Callback-thread priority settings, captured before the stream starts.
///
/// POLYMIX_THREAD_PRIORITY (0-99) selects the priority level;
/// POLYMIX_DISABLE_RT_AUDIO=1 opts out of SCHED_FIFO scheduling on Unix.
#[derive(Clone, Copy, Debug)]
pub struct CallbackPriority {
    level: u8,
    realtime: bool,
    applied: bool,
}

impl CallbackPriority {
    /// Captures the priority settings from the environment.
    pub fn from_env() -> Self {
        let level = std::env::var("POLYMIX_THREAD_PRIORITY")
            .ok()
            .and_then(|v| v.parse::<u8>().ok())
            .filter(|n| *n < 100)
            .unwrap_or(DEFAULT_PRIORITY);
        Self {
            level,
            realtime: !realtime_disabled(),
            applied: false,
        }
    }

    /// Elevates the calling thread on the first invocation.
    ///
    /// Later calls are no-ops, so the audio callback can invoke this
    /// unconditionally at the top of every buffer.
    pub fn apply(&mut self) {
        if self.applied {
            return;
        }
        self.applied = true;

        let value = match ThreadPriorityValue::try_from(self.level) {
            Ok(value) => value,
            Err(e) => {
                warn!(level = self.level, error = %e, "Invalid callback thread priority");
                return;
            }
        };
        let priority = ThreadPriority::Crossplatform(value);
        if let Err(e) = set_current_thread_priority(priority) {
            warn!(error = ?e, "Failed to raise callback thread priority");
        }

        #[cfg(unix)]
        if self.realtime {
            use thread_priority::unix::{
                set_thread_priority_and_policy, thread_native_id, RealtimeThreadSchedulePolicy,
                ThreadSchedulePolicy,
            };
            match set_thread_priority_and_policy(
                thread_native_id(),
                priority,
                ThreadSchedulePolicy::Realtime(RealtimeThreadSchedulePolicy::Fifo),
            ) {
                Ok(()) => info!("Audio callback thread running under SCHED_FIFO"),
                Err(e) => {
                    warn!(error = %e, "Could not enable SCHED_FIFO for audio callback thread")
                }
            }
        }
    }
}

fn realtime_disabled() -> bool {
    std::env::var("POLYMIX_DISABLE_RT_AUDIO")
        .map(|v| ["1", "true", "yes", "on"].iter().any(|t| v.eq_ignore_ascii_case(t)))
        .unwrap_or(false)
}
