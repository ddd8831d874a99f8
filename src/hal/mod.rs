//! Hardware collaborators of the pipeline.
//!
//! The pipeline only talks to hardware through these traits. `sim` provides
//! software models of every one of them.

pub mod sim;

use crate::dma::DmaBuffer;
use crate::error::Result;
use crate::model::ModelDescriptor;

// ========== 摄像头 ==========

/// Camera output pipes, numbered as the capture hardware reports them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CameraPipe {
    /// Full-frame stream written straight into the display background ring.
    Display,
    /// Downscaled stream feeding the accelerator input queue.
    Inference,
}

impl CameraPipe {
    pub const fn id(self) -> u32 {
        match self {
            CameraPipe::Display => 1,
            CameraPipe::Inference => 2,
        }
    }

    pub const fn from_id(id: u32) -> Option<Self> {
        match id {
            1 => Some(CameraPipe::Display),
            2 => Some(CameraPipe::Inference),
            _ => None,
        }
    }
}

pub trait CameraDriver: Send + Sync {
    /// Start continuous capture on `pipe` into `buffer`.
    fn start_pipe(&self, pipe: CameraPipe, buffer: DmaBuffer) -> Result<()>;

    /// Program the target of the next frame. Interrupt safe.
    fn set_dma_address(&self, pipe: CameraPipe, buffer: DmaBuffer) -> Result<()>;
}

/// Interrupt entry points a camera raises. Implemented by the pipeline.
pub trait CameraEvents: Send + Sync {
    fn frame_event(&self, pipe_id: u32) -> Result<()>;
    fn vsync_event(&self, pipe_id: u32) -> Result<()>;
}

/// Image-sensor pipeline maintenance, run once per primary vsync.
pub trait IspControl: Send {
    fn update(&mut self) -> Result<()>;
}

// ========== 显示 ==========

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Layer {
    /// Camera preview.
    Background,
    /// Detection overlay drawn by software.
    Overlay,
}

pub trait DisplayDriver: Send + Sync {
    fn init(&self, background: DmaBuffer, overlay: DmaBuffer) -> Result<()>;

    /// Latch a new address; it only takes effect on the next reload.
    fn set_layer_address(&self, layer: Layer, buffer: DmaBuffer) -> Result<()>;

    fn reload_layer(&self, layer: Layer) -> Result<()>;

    /// Push the composed screen out.
    fn update(&self) -> Result<()>;
}

/// Physical push button (or any two-state input).
pub trait ToggleInput: Send {
    fn is_pressed(&self) -> bool;
}

// ========== 神经网络加速器 ==========

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EpochStatus {
    /// Network finished.
    Done,
    /// Hardware is busy; call [`Accelerator::wait_for_event`] before the next epoch.
    WaitForEvent,
    /// More epochs to schedule right away.
    Continue,
}

pub trait Accelerator: Send {
    /// Tensor geometry as reported by the runtime.
    fn descriptor(&self) -> ModelDescriptor;

    fn set_input(&mut self, buffer: DmaBuffer) -> Result<()>;

    fn set_output(&mut self, index: usize, buffer: DmaBuffer) -> Result<()>;

    fn run_epoch(&mut self) -> Result<EpochStatus>;

    /// Sleep until the hardware raises its next event.
    fn wait_for_event(&mut self);

    /// Return to the start of the network for the next inference.
    fn reset(&mut self) -> Result<()>;
}

/// Run every epoch of one inference, waiting cooperatively on hardware
/// events in between, then rewind the network.
pub fn run_to_completion(acc: &mut dyn Accelerator) -> Result<()> {
    loop {
        match acc.run_epoch()? {
            EpochStatus::Done => break,
            EpochStatus::WaitForEvent => acc.wait_for_event(),
            EpochStatus::Continue => {}
        }
    }
    acc.reset()
}
