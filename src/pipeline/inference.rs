//! 推理任务 (NN thread)
//! Pull a captured frame, run the network on it and queue the raw output
//! tensors for post-process.

use std::sync::Arc;

use tracing::{debug, info};

use super::task::RateMeter;
use super::PipelineContext;
use crate::cpuload::RunTimeCounters;
use crate::error::{PipelineError, Result};
use crate::hal::{run_to_completion, Accelerator, CameraPipe};
use crate::sync::Acquire;

pub struct InferenceStage {
    ctx: Arc<PipelineContext>,
    accelerator: Box<dyn Accelerator>,
    /// Tick of the two most recent inference starts, newest first.
    period_ticks: [u32; 2],
    meter: RateMeter,
}

impl InferenceStage {
    /// Fails when the runtime's tensors differ from the layout the pipeline
    /// allocated for.
    pub fn new(ctx: Arc<PipelineContext>, accelerator: Box<dyn Accelerator>) -> Result<Self> {
        ctx.model.check_runtime(&accelerator.descriptor())?;
        Ok(Self {
            ctx,
            accelerator,
            period_ticks: [0; 2],
            meter: RateMeter::new(),
        })
    }

    /// Give the camera its first inference buffer and start the pipe.
    pub fn start(&mut self) -> Result<()> {
        let first = self
            .ctx
            .nn_input
            .acquire_free(Acquire::NonBlocking)?
            .ok_or_else(|| PipelineError::contract("no free inference input buffer at start"))?;
        let now = self.ctx.run_time.tick_ms();
        self.period_ticks = [now; 2];
        self.ctx.camera.start_pipe(CameraPipe::Inference, first)?;
        info!("🧠 inference pipe started, model {}", self.ctx.model.name);
        Ok(())
    }

    /// One frame: input ready → network → output ready.
    pub fn step(&mut self) -> Result<()> {
        let ctx = &self.ctx;
        self.period_ticks[1] = self.period_ticks[0];
        self.period_ticks[0] = ctx.run_time.tick_ms();
        let nn_period_ms = self.period_ticks[0].wrapping_sub(self.period_ticks[1]);

        let input = ctx.nn_input.acquire_ready()?;
        let output = ctx
            .nn_output
            .acquire_free(Acquire::Blocking)?
            .ok_or(PipelineError::Sync("blocking acquire returned no buffer"))?;
        let tensors = ctx.layout.split(output)?;

        let ts = ctx.run_time.tick_ms();
        {
            let _busy = ctx.run_time.busy();
            self.accelerator.set_input(input)?;
            for (i, tensor) in tensors.iter().enumerate() {
                ctx.cache.invalidate(*tensor);
                self.accelerator.set_output(i, *tensor)?;
            }
        }
        run_to_completion(self.accelerator.as_mut())?;
        let inf_ms = ctx.run_time.tick_ms().wrapping_sub(ts);

        ctx.nn_input.release_free()?;
        ctx.nn_output.release_ready()?;
        ctx.telemetry.record_inference(inf_ms, nn_period_ms)?;
        ctx.stats.record_inference();

        debug!("inference {inf_ms} ms, period {nn_period_ms} ms");
        if let Some(fps) = self.meter.tick() {
            let stats = ctx.stats.read();
            info!(
                "🧠 NN {:.1} fps | inference {} ms | dropped frames {}",
                fps, inf_ms, stats.nn_dropped
            );
        }
        Ok(())
    }

    pub fn run(mut self) -> Result<()> {
        self.start()?;
        loop {
            self.step()?;
        }
    }
}
