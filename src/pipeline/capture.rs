//! 摄像头中断处理 + ISP任务
//!
//! Everything here except [`IspStage`] runs in interrupt context and must not
//! block.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::trace;

use super::PipelineContext;
use crate::dma::DmaBuffer;
use crate::error::{PipelineError, Result};
use crate::hal::{CameraEvents, CameraPipe, IspControl, Layer};
use crate::sync::Acquire;

/// Background ring cursors: `disp` is on screen, `capt` is being written.
#[derive(Debug)]
pub struct CaptureState {
    disp_idx: AtomicUsize,
    capt_idx: AtomicUsize,
}

impl CaptureState {
    pub fn new() -> Self {
        Self {
            disp_idx: AtomicUsize::new(1),
            capt_idx: AtomicUsize::new(0),
        }
    }

    /// `(display, capture)` indices into the background ring.
    pub fn indices(&self) -> (usize, usize) {
        (
            self.disp_idx.load(Ordering::Acquire),
            self.capt_idx.load(Ordering::Acquire),
        )
    }

    fn store(&self, disp: usize, capt: usize) {
        self.disp_idx.store(disp, Ordering::Release);
        self.capt_idx.store(capt, Ordering::Release);
    }
}

impl Default for CaptureState {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineContext {
    /// Display pipe finished a frame: rotate the background ring by one,
    /// capture into the next slot and show the next one.
    fn on_display_frame(&self) -> Result<()> {
        let n = self.background.len();
        let (disp, capt) = self.capture.indices();
        let next_disp = (disp + 1) % n;
        let next_capt = (capt + 1) % n;

        let target = self.background_buffer(next_capt)?;
        self.camera.set_dma_address(CameraPipe::Display, target)?;

        let shown = self.background_buffer(next_disp)?;
        self.display.set_layer_address(Layer::Background, shown)?;
        self.display.reload_layer(Layer::Background)?;
        self.display.update()?;

        self.capture.store(next_disp, next_capt);
        self.stats.record_display_frame();
        Ok(())
    }

    /// Inference pipe finished a frame. Without a free input buffer the
    /// frame is dropped: the camera keeps overwriting the same buffer and
    /// the consumer sees nothing new.
    fn on_inference_frame(&self) -> Result<()> {
        match self.nn_input.acquire_free(Acquire::NonBlocking)? {
            Some(next) => {
                self.camera.set_dma_address(CameraPipe::Inference, next)?;
                self.nn_input.release_ready_from_isr()?;
                self.stats.record_nn_frame();
            }
            None => {
                self.stats.record_nn_drop();
                trace!("nn input queue full, frame dropped");
            }
        }
        Ok(())
    }

    fn background_buffer(&self, index: usize) -> Result<DmaBuffer> {
        self.background
            .get(index)
            .ok_or_else(|| PipelineError::contract(format!("no background buffer {index}")))
    }
}

impl CameraEvents for PipelineContext {
    fn frame_event(&self, pipe_id: u32) -> Result<()> {
        match CameraPipe::from_id(pipe_id) {
            Some(CameraPipe::Display) => self.on_display_frame(),
            Some(CameraPipe::Inference) => self.on_inference_frame(),
            None => {
                trace!("frame event on unknown pipe {pipe_id}");
                Ok(())
            }
        }
    }

    fn vsync_event(&self, pipe_id: u32) -> Result<()> {
        if pipe_id == CameraPipe::Display.id() {
            // Already signalled means the ISP task is still behind; one
            // pending update is enough.
            let _ = self.isp_signal.give_from_isr();
        }
        Ok(())
    }
}

// ========== ISP 任务 ==========

pub struct IspStage {
    ctx: Arc<PipelineContext>,
    isp: Box<dyn IspControl>,
}

impl IspStage {
    pub fn new(ctx: Arc<PipelineContext>, isp: Box<dyn IspControl>) -> Self {
        Self { ctx, isp }
    }

    /// Wait for one primary vsync and run the ISP update.
    pub fn step(&mut self) -> Result<()> {
        self.ctx.isp_signal.take()?;
        self.isp.update()
    }

    pub fn run(mut self) -> Result<()> {
        loop {
            self.step()?;
        }
    }
}
