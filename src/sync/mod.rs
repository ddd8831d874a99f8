//! Scheduler primitives shared by tasks and interrupt handlers.

pub mod bqueue;
pub mod irq;
pub mod semaphore;

pub use bqueue::{Acquire, BoundedBufferQueue, BQUEUE_MAX_BUFFERS};
pub use semaphore::Semaphore;
