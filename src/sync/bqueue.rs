//! Zero-copy ownership hand-off between one producer and one consumer.
//!
//! A queue owns no data. It rotates a fixed ring of DMA regions through four
//! owners: the free pool, the producer, the ready pool and the consumer.
//!
//! ```text
//!   acquire_free ──► producer ──► release_ready ──► (ready)
//!        ▲                                            │
//!     (free) ◄── release_free ◄── consumer ◄── acquire_ready
//! ```
//!
//! Both pools are counting semaphores; the buffer a caller receives is picked
//! by a cursor advanced modulo the capacity, so ready buffers come out in the
//! order they were made ready.

use std::sync::atomic::{AtomicUsize, Ordering};

use heapless::Vec as HVec;
use tracing::debug;

use super::semaphore::Semaphore;
use crate::dma::DmaBuffer;
use crate::error::{PipelineError, Result};

/// Maximum ring length supported by a queue.
pub const BQUEUE_MAX_BUFFERS: usize = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Acquire {
    /// Suspend until a free buffer exists.
    Blocking,
    /// Return `None` immediately if no free buffer exists.
    NonBlocking,
}

pub struct BoundedBufferQueue {
    name: &'static str,
    free: Semaphore,
    ready: Semaphore,
    buffers: HVec<DmaBuffer, BQUEUE_MAX_BUFFERS>,
    free_idx: AtomicUsize,
    ready_idx: AtomicUsize,
}

impl BoundedBufferQueue {
    pub fn init(name: &'static str, buffers: &[DmaBuffer]) -> Result<Self> {
        let count = buffers.len();
        if count == 0 || count > BQUEUE_MAX_BUFFERS {
            return Err(PipelineError::contract(format!(
                "{name}: {count} buffers, supported 1..={BQUEUE_MAX_BUFFERS}"
            )));
        }
        if let Some(i) = buffers.iter().position(DmaBuffer::is_empty) {
            return Err(PipelineError::contract(format!("{name}: buffer {i} is empty")));
        }
        let buffers = HVec::from_slice(buffers)
            .map_err(|_| PipelineError::contract(format!("{name}: ring overflow")))?;
        debug!("bqueue {name}: {count} x {} bytes", buffers[0].len());
        Ok(Self {
            name,
            free: Semaphore::new(name, count, count)?,
            ready: Semaphore::new(name, count, 0)?,
            buffers,
            free_idx: AtomicUsize::new(0),
            ready_idx: AtomicUsize::new(0),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> usize {
        self.buffers.len()
    }

    pub fn free_count(&self) -> usize {
        self.free.count()
    }

    pub fn ready_count(&self) -> usize {
        self.ready.count()
    }

    fn advance(&self, cursor: &AtomicUsize) -> DmaBuffer {
        // One producer and one consumer: each cursor has a single writer.
        let idx = cursor.load(Ordering::Acquire);
        cursor.store((idx + 1) % self.buffers.len(), Ordering::Release);
        self.buffers[idx]
    }

    /// Producer side. With [`Acquire::NonBlocking`] an empty free pool yields
    /// `Ok(None)` and leaves every count untouched. Callable from an
    /// interrupt handler only in non-blocking mode.
    pub fn acquire_free(&self, mode: Acquire) -> Result<Option<DmaBuffer>> {
        match mode {
            Acquire::Blocking => self.free.take()?,
            Acquire::NonBlocking => {
                if !self.free.try_take()? {
                    return Ok(None);
                }
            }
        }
        Ok(Some(self.advance(&self.free_idx)))
    }

    /// Consumer side: hand the buffer taken by [`acquire_ready`](Self::acquire_ready) back.
    pub fn release_free(&self) -> Result<()> {
        if self.free.give() {
            Ok(())
        } else {
            Err(PipelineError::Sync("release_free without matching acquire_ready"))
        }
    }

    /// Consumer side. Always blocks until a buffer is ready.
    pub fn acquire_ready(&self) -> Result<DmaBuffer> {
        self.ready.take()?;
        Ok(self.advance(&self.ready_idx))
    }

    /// Producer side, task context.
    pub fn release_ready(&self) -> Result<()> {
        if self.ready.give() {
            Ok(())
        } else {
            Err(PipelineError::Sync("release_ready without matching acquire_free"))
        }
    }

    /// Producer side, interrupt context. Requests a reschedule on handler exit.
    pub fn release_ready_from_isr(&self) -> Result<()> {
        if self.ready.give_from_isr() {
            Ok(())
        } else {
            Err(PipelineError::Sync("release_ready_from_isr without matching acquire_free"))
        }
    }
}

impl std::fmt::Debug for BoundedBufferQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedBufferQueue")
            .field("name", &self.name)
            .field("capacity", &self.capacity())
            .field("free", &self.free_count())
            .field("ready", &self.ready_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::DmaPool;
    use crate::sync::irq;
    use rand::Rng;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn queue(n: usize) -> (DmaPool, BoundedBufferQueue) {
        let pool = DmaPool::new("bq", n, 64).unwrap();
        let q = BoundedBufferQueue::init("bq", pool.buffers()).unwrap();
        (pool, q)
    }

    #[test]
    fn init_checks_capacity_and_buffers() {
        let pool = DmaPool::new("bq", 3, 64).unwrap();
        assert!(matches!(
            BoundedBufferQueue::init("big", pool.buffers()),
            Err(PipelineError::Contract(_))
        ));
        assert!(BoundedBufferQueue::init("none", &[]).is_err());

        let (_pool, q) = queue(2);
        assert_eq!(q.capacity(), 2);
        assert_eq!(q.free_count(), 2);
        assert_eq!(q.ready_count(), 0);
    }

    #[test]
    fn empty_buffer_is_rejected() {
        let pool = DmaPool::new("bq", 1, 64).unwrap();
        let empty = pool.get(0).unwrap().slice(0, 0).unwrap();
        assert!(BoundedBufferQueue::init("empty", &[pool.get(0).unwrap(), empty]).is_err());
    }

    #[test]
    fn ready_order_matches_release_order() {
        let (pool, q) = queue(2);
        let a = q.acquire_free(Acquire::Blocking).unwrap().unwrap();
        q.release_ready().unwrap();
        let b = q.acquire_free(Acquire::Blocking).unwrap().unwrap();
        q.release_ready().unwrap();
        assert_eq!((a, b), (pool.get(0).unwrap(), pool.get(1).unwrap()));

        assert_eq!(q.acquire_ready().unwrap(), a);
        assert_eq!(q.acquire_ready().unwrap(), b);
    }

    #[test]
    fn non_blocking_acquire_on_empty_leaves_counts() {
        let (_pool, q) = queue(2);
        q.acquire_free(Acquire::NonBlocking).unwrap().unwrap();
        q.acquire_free(Acquire::NonBlocking).unwrap().unwrap();
        assert_eq!(q.acquire_free(Acquire::NonBlocking).unwrap(), None);
        assert_eq!(q.free_count(), 0);
        assert_eq!(q.ready_count(), 0);
    }

    #[test]
    fn unmatched_release_is_a_sync_error() {
        let (_pool, q) = queue(1);
        assert!(matches!(q.release_free(), Err(PipelineError::Sync(_))));
        q.acquire_free(Acquire::Blocking).unwrap();
        q.release_ready().unwrap();
        assert!(q.release_ready().is_err());
    }

    #[test]
    fn isr_producer_feeds_task_consumer_in_order() {
        let (pool, q) = queue(2);
        let q = Arc::new(q);
        let capacity = q.capacity();
        let addrs: Vec<usize> = pool.buffers().iter().map(DmaBuffer::addr).collect();
        // Buffers the producer holds between two interrupts.
        let producer_held = Arc::new(AtomicUsize::new(0));

        let producer = {
            let q = q.clone();
            let producer_held = producer_held.clone();
            thread::spawn(move || {
                let mut filling: Option<DmaBuffer> = None;
                let mut sent = 0u64;
                let mut rng = rand::thread_rng();
                while sent < 200 {
                    // Like the camera: take a buffer on one frame, hand it over on the next.
                    irq::isr(|| match filling.take() {
                        Some(buf) => {
                            // SAFETY: producer owns the buffer until release_ready.
                            unsafe { buf.as_mut_slice()[..8].copy_from_slice(&sent.to_le_bytes()) };
                            q.release_ready_from_isr().unwrap();
                            producer_held.fetch_sub(1, Ordering::Relaxed);
                            sent += 1;
                        }
                        None => {
                            if let Some(buf) = q.acquire_free(Acquire::NonBlocking).unwrap() {
                                producer_held.fetch_add(1, Ordering::Relaxed);
                                filling = Some(buf);
                            }
                        }
                    });
                    if rng.gen_bool(0.3) {
                        thread::sleep(Duration::from_micros(rng.gen_range(0..200)));
                    }
                }
            })
        };

        // The producer runs masked, so this sees every count at one instant.
        let owned = |consumer_held: usize| {
            irq::free(|| {
                q.free_count() + q.ready_count() + producer_held.load(Ordering::Relaxed)
            }) + consumer_held
        };

        let mut rng = rand::thread_rng();
        for expected in 0..200u64 {
            assert_eq!(owned(0), capacity);
            let buf = q.acquire_ready().unwrap();
            assert_eq!(owned(1), capacity);
            assert!(addrs.contains(&buf.addr()));
            // SAFETY: consumer owns the buffer until release_free.
            let seq = u64::from_le_bytes(unsafe { buf.as_slice()[..8].try_into().unwrap() });
            assert_eq!(seq, expected);
            if rng.gen_bool(0.3) {
                thread::sleep(Duration::from_micros(rng.gen_range(0..200)));
            }
            assert_eq!(owned(1), capacity);
            q.release_free().unwrap();
        }
        producer.join().unwrap();
        assert_eq!(owned(0), capacity);
        assert_eq!(q.free_count() + producer_held.load(Ordering::Relaxed), 2);
    }
}
