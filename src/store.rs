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

//! In-memory store of decoded PCM sample records.
//!
//! Samples are preloaded by non-real-time threads and read by the audio thread
//! once per callback via an immutable snapshot. Decoding compressed audio is
//! the caller's responsibility; the store only accepts interleaved f32 frames.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

/// Error types for sample store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Sample {0} has zero channels")]
    ZeroChannels(String),

    #[error("Sample {0} has {1} samples, not divisible into {2}-channel frames")]
    PartialFrame(String, usize, u16),
}

/// A decoded PCM sample, immutable once published.
///
/// Cloning is cheap: the frame data is shared behind an Arc, so every voice
/// playing this sample reads the same allocation. A voice holds its own clone
/// for as long as it plays, which keeps the data alive even if the store is
/// cleared underneath it.
#[derive(Clone)]
pub struct SampleRecord {
    /// Interleaved f32 frames.
    data: Arc<Vec<f32>>,
    /// Number of channels in the sample.
    channel_count: u16,
    /// Native sample rate of the audio data.
    sample_rate: u32,
}

impl SampleRecord {
    /// Returns the interleaved frame data.
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Returns the number of channels.
    pub fn channel_count(&self) -> u16 {
        self.channel_count
    }

    /// Returns the native sample rate.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Returns the number of frames (samples per channel).
    pub fn frame_count(&self) -> usize {
        self.data.len() / self.channel_count as usize
    }

    /// Returns the memory size in bytes.
    pub fn memory_size(&self) -> usize {
        self.data.len() * std::mem::size_of::<f32>()
    }
}

/// An immutable view of the store contents, valid for one audio callback.
pub type StoreSnapshot = Arc<HashMap<String, SampleRecord>>;

/// Aggregate statistics over the cached samples.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StoreStats {
    /// Number of cached samples.
    pub count: usize,
    /// Total sample data memory in bytes.
    pub total_bytes: usize,
}

/// Stores decoded samples keyed by id.
///
/// Writers publish a new read-only map on every mutation; the audio thread
/// takes the read lock only long enough to clone the Arc, so record lookups
/// during note activation never contend with a long-running operation.
pub struct SampleStore {
    records: RwLock<StoreSnapshot>,
}

impl SampleStore {
    /// Creates an empty sample store.
    pub fn new() -> Self {
        Self {
            records: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    /// Stores a decoded sample under the given id.
    ///
    /// Idempotent: if the id is already cached this is a no-op, so callers may
    /// preload redundantly without invalidating in-flight reads. Replacing a
    /// sample requires a new id.
    pub fn preload(
        &self,
        id: &str,
        frames: Vec<f32>,
        channel_count: u16,
        sample_rate: u32,
    ) -> Result<(), StoreError> {
        let record = Self::validate(id, frames, channel_count, sample_rate)?;

        let mut records = self.records.write();
        if records.contains_key(id) {
            debug!(id, "Sample already cached");
            return Ok(());
        }

        info!(
            id,
            channels = channel_count,
            sample_rate,
            frames = record.frame_count(),
            memory_kb = record.memory_size() / 1024,
            "Sample preloaded"
        );

        let mut next: HashMap<String, SampleRecord> = records.as_ref().clone();
        next.insert(id.to_string(), record);
        *records = Arc::new(next);
        Ok(())
    }

    /// Stores a batch of decoded samples, publishing a single new snapshot.
    ///
    /// All-or-nothing: if any sample fails validation, none are stored.
    /// Already-cached ids are skipped.
    pub fn preload_many<I>(&self, samples: I) -> Result<(), StoreError>
    where
        I: IntoIterator<Item = (String, Vec<f32>, u16, u32)>,
    {
        let mut validated = Vec::new();
        for (id, frames, channel_count, sample_rate) in samples {
            let record = Self::validate(&id, frames, channel_count, sample_rate)?;
            validated.push((id, record));
        }

        let mut records = self.records.write();
        let mut next: HashMap<String, SampleRecord> = records.as_ref().clone();
        let mut added = 0;
        for (id, record) in validated {
            if next.contains_key(&id) {
                debug!(id, "Sample already cached");
                continue;
            }
            next.insert(id, record);
            added += 1;
        }
        *records = Arc::new(next);

        if added > 0 {
            info!(added, "Samples preloaded");
        }
        Ok(())
    }

    /// Returns the record for the given id, if cached.
    ///
    /// The returned record shares the underlying data; it stays valid even if
    /// the store is cleared afterwards.
    pub fn try_get(&self, id: &str) -> Option<SampleRecord> {
        self.records.read().get(id).cloned()
    }

    /// Returns true if the given id is cached.
    pub fn is_cached(&self, id: &str) -> bool {
        self.records.read().contains_key(id)
    }

    /// Returns the current contents as an immutable snapshot.
    ///
    /// The audio thread calls this once per callback so that activation
    /// lookups within the callback are lock-free.
    pub fn snapshot(&self) -> StoreSnapshot {
        self.records.read().clone()
    }

    /// Drops all records.
    ///
    /// Voices hold their own reference to the data they play, so clearing
    /// while voices are active releases the store's reference only.
    pub fn clear(&self) {
        let mut records = self.records.write();
        let count = records.len();
        *records = Arc::new(HashMap::new());
        info!(count, "Sample store cleared");
    }

    /// Returns aggregate statistics over the cached samples.
    pub fn stats(&self) -> StoreStats {
        let records = self.records.read();
        StoreStats {
            count: records.len(),
            total_bytes: records.values().map(|r| r.memory_size()).sum(),
        }
    }

    fn validate(
        id: &str,
        frames: Vec<f32>,
        channel_count: u16,
        sample_rate: u32,
    ) -> Result<SampleRecord, StoreError> {
        if channel_count == 0 {
            return Err(StoreError::ZeroChannels(id.to_string()));
        }
        if frames.len() % channel_count as usize != 0 {
            return Err(StoreError::PartialFrame(
                id.to_string(),
                frames.len(),
                channel_count,
            ));
        }
        Ok(SampleRecord {
            data: Arc::new(frames),
            channel_count,
            sample_rate,
        })
    }
}

impl Default for SampleStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SampleStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("SampleStore")
            .field("cached_samples", &stats.count)
            .field("memory_kb", &(stats.total_bytes / 1024))
            .finish()
    }
}
