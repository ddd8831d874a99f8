//! Counting semaphore with a task-context and an interrupt-context give.
//!
//! Tokens are unit messages in a bounded channel: the channel capacity is the
//! semaphore's maximum count and the number of queued tokens is its current
//! count. Takes block on the receive side; gives never block.

use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};

use super::irq;
use crate::error::{PipelineError, Result};

#[derive(Clone)]
pub struct Semaphore {
    name: &'static str,
    tx: Sender<()>,
    rx: Receiver<()>,
    max: usize,
}

impl Semaphore {
    pub fn new(name: &'static str, max: usize, initial: usize) -> Result<Self> {
        if max == 0 || initial > max {
            return Err(PipelineError::contract(format!(
                "semaphore {name}: initial {initial} / max {max}"
            )));
        }
        let (tx, rx) = bounded(max);
        for _ in 0..initial {
            tx.try_send(())
                .map_err(|_| PipelineError::Sync("semaphore preload"))?;
        }
        Ok(Self { name, tx, rx, max })
    }

    /// Binary semaphore, initially empty.
    pub fn binary(name: &'static str) -> Result<Self> {
        Self::new(name, 1, 0)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Block until a unit is available. Task context only.
    pub fn take(&self) -> Result<()> {
        debug_assert!(!irq::in_interrupt(), "blocking take from interrupt");
        self.rx
            .recv()
            .map_err(|_| PipelineError::Sync("semaphore take"))
    }

    /// Take a unit if one is available; never blocks and never changes the
    /// count when it fails.
    pub fn try_take(&self) -> Result<bool> {
        match self.rx.try_recv() {
            Ok(()) => Ok(true),
            Err(TryRecvError::Empty) => Ok(false),
            Err(TryRecvError::Disconnected) => Err(PipelineError::Sync("semaphore try_take")),
        }
    }

    pub fn take_timeout(&self, timeout: Duration) -> Result<bool> {
        match self.rx.recv_timeout(timeout) {
            Ok(()) => Ok(true),
            Err(RecvTimeoutError::Timeout) => Ok(false),
            Err(RecvTimeoutError::Disconnected) => Err(PipelineError::Sync("semaphore take")),
        }
    }

    /// Return a unit. `false` when the count is already at its maximum.
    pub fn give(&self) -> bool {
        self.tx.try_send(()).is_ok()
    }

    /// Interrupt-safe give: never blocks, and asks for a reschedule on
    /// handler exit so the woken task runs as soon as the handler returns.
    pub fn give_from_isr(&self) -> bool {
        let given = self.tx.try_send(()).is_ok();
        if given {
            irq::request_yield();
        }
        given
    }

    pub fn count(&self) -> usize {
        self.rx.len()
    }

    pub fn max(&self) -> usize {
        self.max
    }
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Semaphore({} {}/{})", self.name, self.count(), self.max)
    }
}
