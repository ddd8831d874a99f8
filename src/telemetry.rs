//! Latest detection and timing results, shared between stages.
//!
//! Post-process replaces the detection part of the snapshot, inference and
//! display update their own timings, and display copies the whole struct out.
//! Every access goes through one mutex so a reader never sees fields from two
//! different writers' updates mixed together. A separate binary semaphore tells
//! display that something new was published.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::detection::{DetectionList, TrackList};
use crate::error::{PipelineError, Result};
use crate::sync::Semaphore;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TelemetrySnapshot {
    pub detections: DetectionList,
    pub tracking_enabled: bool,
    /// Tracks seen in the latest frame (empty when tracking is off).
    pub tracks: TrackList,
    /// Time between the two most recent inference starts.
    pub nn_period_ms: u32,
    pub inf_ms: u32,
    pub pp_ms: u32,
    /// Render time of the previous overlay.
    pub disp_ms: u32,
    /// Frame counter of the post-process run that produced `detections`.
    pub frame_seq: u64,
}

impl TelemetrySnapshot {
    pub fn object_count(&self) -> usize {
        if self.tracking_enabled {
            self.tracks.len()
        } else {
            self.detections.len()
        }
    }
}

pub struct SharedTelemetryChannel {
    state: Mutex<TelemetrySnapshot>,
    update: Semaphore,
}

impl SharedTelemetryChannel {
    pub fn new() -> Result<Self> {
        Ok(Self {
            state: Mutex::new(TelemetrySnapshot::default()),
            update: Semaphore::binary("disp.update")?,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, TelemetrySnapshot>> {
        self.state
            .lock()
            .map_err(|_| PipelineError::Sync("telemetry lock poisoned"))
    }

    /// Mutate the snapshot under the lock. Keep `f` short.
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut TelemetrySnapshot) -> R) -> Result<R> {
        let mut guard = self.lock()?;
        Ok(f(&mut guard))
    }

    /// Whole-struct copy taken under the lock.
    pub fn snapshot(&self) -> Result<TelemetrySnapshot> {
        Ok(self.lock()?.clone())
    }

    /// Inference timings for the frame just submitted.
    pub fn record_inference(&self, inf_ms: u32, nn_period_ms: u32) -> Result<()> {
        self.with_lock(|s| {
            s.inf_ms = inf_ms;
            s.nn_period_ms = nn_period_ms;
        })
    }

    pub fn record_display(&self, disp_ms: u32) -> Result<()> {
        self.with_lock(|s| s.disp_ms = disp_ms)
    }

    /// Signal that a new snapshot is available. If the previous signal has
    /// not been consumed yet the display is behind and simply misses one
    /// update; this never blocks.
    pub fn notify(&self) {
        let _ = self.update.give();
    }

    /// Block until [`notify`](Self::notify) is called.
    pub fn wait_update(&self) -> Result<()> {
        self.update.take()
    }

    pub fn wait_update_timeout(&self, timeout: Duration) -> Result<bool> {
        self.update.take_timeout(timeout)
    }
}
