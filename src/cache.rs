//! Data-cache maintenance for regions shared with DMA masters.
//!
//! Which operation runs where depends on who last wrote a region:
//! * hardware writes, CPU reads: `invalidate` before the hardware write
//!   (accelerator outputs);
//! * CPU writes, hardware reads: `clean` after the CPU write (overlay).
//!
//! Camera input frames are written by DMA and only read by the accelerator,
//! so they never go through the CPU cache and need neither.

use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::trace;

use crate::dma::DmaBuffer;

pub trait CacheMaintenance: Send + Sync {
    /// Discard cached lines so the next CPU read sees what the DMA master wrote.
    fn invalidate(&self, region: DmaBuffer);
    /// Write dirty lines back so a DMA master reads what the CPU wrote.
    fn clean(&self, region: DmaBuffer);
    fn clean_invalidate(&self, region: DmaBuffer);
    fn is_enabled(&self) -> bool;
}

/// Platforms without a data cache.
#[derive(Debug, Default)]
pub struct NoCache;

impl CacheMaintenance for NoCache {
    fn invalidate(&self, _region: DmaBuffer) {}
    fn clean(&self, _region: DmaBuffer) {}
    fn clean_invalidate(&self, _region: DmaBuffer) {}
    fn is_enabled(&self) -> bool {
        false
    }
}

/// Cached platform. On a hosted target the cache is coherent, so maintenance
/// reduces to a full fence; operations are counted for diagnostics.
#[derive(Debug, Default)]
pub struct DataCache {
    invalidates: AtomicU64,
    cleans: AtomicU64,
}

impl DataCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn invalidate_count(&self) -> u64 {
        self.invalidates.load(Ordering::Relaxed)
    }

    pub fn clean_count(&self) -> u64 {
        self.cleans.load(Ordering::Relaxed)
    }
}

impl CacheMaintenance for DataCache {
    fn invalidate(&self, region: DmaBuffer) {
        fence(Ordering::SeqCst);
        self.invalidates.fetch_add(1, Ordering::Relaxed);
        trace!("dcache invalidate {:?}", region);
    }

    fn clean(&self, region: DmaBuffer) {
        fence(Ordering::SeqCst);
        self.cleans.fetch_add(1, Ordering::Relaxed);
        trace!("dcache clean {:?}", region);
    }

    fn clean_invalidate(&self, region: DmaBuffer) {
        fence(Ordering::SeqCst);
        self.cleans.fetch_add(1, Ordering::Relaxed);
        self.invalidates.fetch_add(1, Ordering::Relaxed);
        trace!("dcache clean+invalidate {:?}", region);
    }

    fn is_enabled(&self) -> bool {
        true
    }
}

/// Resolve the cache capability from configuration.
pub fn select(enabled: bool) -> Arc<dyn CacheMaintenance> {
    if enabled {
        Arc::new(DataCache::new())
    } else {
        Arc::new(NoCache)
    }
}
