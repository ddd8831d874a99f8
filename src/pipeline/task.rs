//! 任务管理 - named stage threads with a fixed relative priority.

use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{error, info, info_span};

use crate::error::{PipelineError, Result};

/// The four pipeline tasks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Task {
    Isp,
    Inference,
    PostProcess,
    Display,
}

impl Task {
    pub const ALL: [Task; 4] = [Task::Isp, Task::Inference, Task::PostProcess, Task::Display];

    pub const fn name(self) -> &'static str {
        match self {
            Task::Isp => "isp",
            Task::Inference => "nn",
            Task::PostProcess => "pp",
            Task::Display => "dp",
        }
    }

    /// Priority relative to a normal task. The host scheduler does not honour
    /// it; it is carried in the task span for the logs.
    pub const fn priority(self) -> i8 {
        match self {
            Task::Isp => 2,
            Task::Inference => 1,
            Task::PostProcess => -2,
            Task::Display => -2,
        }
    }
}

/// Spawn `body` on its own named thread. An error returned from `body` is
/// fatal for the whole process.
pub fn spawn<F>(task: Task, body: F) -> Result<JoinHandle<()>>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    thread::Builder::new()
        .name(task.name().into())
        .spawn(move || {
            let span = info_span!("task", name = task.name(), prio = task.priority());
            let _enter = span.enter();
            info!("✅ {} task started", task.name());
            match body() {
                Ok(()) => info!("{} task finished", task.name()),
                Err(err) => fatal(task.name(), &err),
            }
        })
        .map_err(PipelineError::from)
}

/// Unrecoverable failure: log and stop everything.
pub fn fatal(origin: &str, err: &PipelineError) -> ! {
    error!("❌ {origin}: {err}");
    std::process::abort()
}

/// Counts events and reports the rate roughly once per second.
#[derive(Debug)]
pub struct RateMeter {
    count: u32,
    last: Instant,
}

impl Default for RateMeter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateMeter {
    pub fn new() -> Self {
        Self {
            count: 0,
            last: Instant::now(),
        }
    }

    /// Count one event. Returns the rate once a second has passed.
    pub fn tick(&mut self) -> Option<f64> {
        self.count += 1;
        let elapsed = self.last.elapsed();
        if elapsed < Duration::from_secs(1) {
            return None;
        }
        let rate = f64::from(self.count) / elapsed.as_secs_f64();
        self.count = 0;
        self.last = Instant::now();
        Some(rate)
    }
}
