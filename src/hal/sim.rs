//! Software models of the camera, accelerator, display, ISP and button.
//!
//! The camera runs its own interrupt thread at the configured frame rate and
//! stamps every frame with a sequence number. The accelerator reads that
//! number back and reports a couple of objects moving across the frame, so
//! the whole pipeline can run (and be tested) on a workstation.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info};

use super::{
    Accelerator, CameraDriver, CameraEvents, CameraPipe, DisplayDriver, EpochStatus, IspControl,
    Layer, ToggleInput,
};
use crate::config::PipelineConfig;
use crate::detection::postprocess::{encode_row, GridDecoder};
use crate::detection::tracker;
use crate::dma::DmaBuffer;
use crate::error::{PipelineError, Result};
use crate::model::{self, ModelDescriptor, MAX_NN_OUTPUTS};
use crate::pipeline::{task, Hardware};
use crate::sync::irq;

fn lock<T>(m: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    m.lock()
        .map_err(|_| PipelineError::Driver("sim register lock poisoned".into()))
}

/// Write the frame sequence number into the first bytes of a frame.
fn stamp(buffer: DmaBuffer, seq: u64) {
    // SAFETY: the buffer is the current DMA target, owned by the camera.
    let bytes = unsafe { buffer.as_mut_slice() };
    if let Some(head) = bytes.get_mut(..8) {
        head.copy_from_slice(&seq.to_le_bytes());
    }
}

/// Sequence number stamped by [`SimCamera`], or `None` for a short buffer.
pub fn frame_stamp(bytes: &[u8]) -> Option<u64> {
    let head = bytes.get(..8)?;
    Some(u64::from_le_bytes([
        head[0], head[1], head[2], head[3], head[4], head[5], head[6], head[7],
    ]))
}

// ========== 摄像头 ==========

#[derive(Clone, Copy, Debug, Default)]
struct PipeRegs {
    started: bool,
    target: Option<DmaBuffer>,
    reprograms: u64,
}

pub struct SimCamera {
    fps: u32,
    pipes: Mutex<[PipeRegs; 2]>,
    frames: AtomicU64,
    running: AtomicBool,
}

impl SimCamera {
    pub fn new(fps: u32) -> Self {
        Self {
            fps: fps.max(1),
            pipes: Mutex::new([PipeRegs::default(); 2]),
            frames: AtomicU64::new(0),
            running: AtomicBool::new(false),
        }
    }

    fn slot(pipe: CameraPipe) -> usize {
        pipe.id() as usize - 1
    }

    fn regs(&self, pipe: CameraPipe) -> PipeRegs {
        self.pipes
            .lock()
            .map(|p| p[Self::slot(pipe)])
            .unwrap_or_default()
    }

    /// Current DMA target of `pipe`.
    pub fn target(&self, pipe: CameraPipe) -> Option<DmaBuffer> {
        self.regs(pipe).target
    }

    /// Number of `set_dma_address` calls on `pipe`.
    pub fn reprogram_count(&self, pipe: CameraPipe) -> u64 {
        self.regs(pipe).reprograms
    }

    pub fn frame_count(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    /// Complete one frame on every started pipe and raise the interrupts:
    /// vsync first, then frame-complete per pipe.
    pub fn capture_frame(&self, events: &dyn CameraEvents) -> Result<()> {
        let seq = self.frames.fetch_add(1, Ordering::Relaxed) + 1;
        let pipes = *lock(&self.pipes)?;

        irq::isr(|| events.vsync_event(CameraPipe::Display.id()))?;
        for pipe in [CameraPipe::Display, CameraPipe::Inference] {
            let regs = pipes[Self::slot(pipe)];
            if !regs.started {
                continue;
            }
            if let Some(target) = regs.target {
                stamp(target, seq);
            }
            irq::isr(|| events.frame_event(pipe.id()))?;
        }
        Ok(())
    }

    /// Start the interrupt thread. Frames are delivered until [`stop`](Self::stop).
    pub fn spawn(self: &Arc<Self>, events: Arc<dyn CameraEvents>) -> Result<JoinHandle<()>> {
        self.running.store(true, Ordering::Release);
        let camera = Arc::clone(self);
        let period = Duration::from_secs_f64(1.0 / f64::from(self.fps));
        info!("📷 sim camera {} fps", self.fps);
        thread::Builder::new()
            .name("cam-irq".into())
            .spawn(move || {
                while camera.running.load(Ordering::Acquire) {
                    thread::sleep(period);
                    if let Err(err) = camera.capture_frame(events.as_ref()) {
                        task::fatal("cam-irq", &err);
                    }
                }
            })
            .map_err(PipelineError::from)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}

impl CameraDriver for SimCamera {
    fn start_pipe(&self, pipe: CameraPipe, buffer: DmaBuffer) -> Result<()> {
        let mut pipes = lock(&self.pipes)?;
        let regs = &mut pipes[Self::slot(pipe)];
        regs.started = true;
        regs.target = Some(buffer);
        debug!("camera pipe {pipe:?} started on {buffer:?}");
        Ok(())
    }

    fn set_dma_address(&self, pipe: CameraPipe, buffer: DmaBuffer) -> Result<()> {
        let mut pipes = lock(&self.pipes)?;
        let regs = &mut pipes[Self::slot(pipe)];
        regs.target = Some(buffer);
        regs.reprograms += 1;
        Ok(())
    }
}

// ========== 神经网络加速器 ==========

pub struct SimAccelerator {
    descriptor: ModelDescriptor,
    latency: Duration,
    num_classes: usize,
    input: Option<DmaBuffer>,
    outputs: [Option<DmaBuffer>; MAX_NN_OUTPUTS],
    epoch: u32,
}

impl SimAccelerator {
    pub fn new(descriptor: ModelDescriptor, latency: Duration, num_classes: usize) -> Self {
        Self {
            descriptor,
            latency,
            num_classes: num_classes.max(1),
            input: None,
            outputs: [None; MAX_NN_OUTPUTS],
            epoch: 0,
        }
    }

    /// Fill the outputs for the frame stamped in the input buffer.
    fn compute(&mut self) -> Result<()> {
        let input = self
            .input
            .ok_or_else(|| PipelineError::Accelerator("no input buffer set".into()))?;
        // SAFETY: input and outputs were handed over by set_input/set_output
        // and stay untouched by software until the run completes.
        let seq = frame_stamp(unsafe { input.as_slice() }).unwrap_or(0);
        for (i, out) in self.outputs[..self.descriptor.outputs.len()].iter().enumerate() {
            let out = out.ok_or_else(|| {
                PipelineError::Accelerator(format!("output {i} not set"))
            })?;
            unsafe { out.as_mut_slice() }.fill(0);
        }
        let Some(head) = self.outputs[0] else {
            return Ok(());
        };
        let dst = unsafe { head.as_mut_slice() };
        let row = (5 + self.num_classes) * 4;

        // One object sweeping left to right every 4 seconds at 30 fps.
        let phase = (seq % 120) as f32 / 120.0;
        if let Some(slot) = dst.get_mut(..row) {
            encode_row(slot, 0.15 + 0.7 * phase, 0.5, 0.12, 0.3, 0.95, &[0.95]);
        }
        // A second one dropping top to bottom, present every other 3 seconds.
        if (seq / 90) % 2 == 1 {
            let phase = (seq % 90) as f32 / 90.0;
            if let Some(slot) = dst.get_mut(row..2 * row) {
                encode_row(slot, 0.5, 0.2 + 0.6 * phase, 0.1, 0.15, 0.9, &[0.9]);
            }
        }
        Ok(())
    }
}

impl Accelerator for SimAccelerator {
    fn descriptor(&self) -> ModelDescriptor {
        self.descriptor.clone()
    }

    fn set_input(&mut self, buffer: DmaBuffer) -> Result<()> {
        if buffer.len() != self.descriptor.input.size_bytes {
            return Err(PipelineError::Accelerator(format!(
                "input is {} bytes, network expects {}",
                buffer.len(),
                self.descriptor.input.size_bytes
            )));
        }
        self.input = Some(buffer);
        Ok(())
    }

    fn set_output(&mut self, index: usize, buffer: DmaBuffer) -> Result<()> {
        let info = self.descriptor.outputs.get(index).ok_or_else(|| {
            PipelineError::Accelerator(format!("no output {index}"))
        })?;
        if buffer.len() != info.size_bytes || !buffer.is_aligned(info.alignment) {
            return Err(PipelineError::Accelerator(format!(
                "output {index}: {buffer:?} does not fit {} bytes aligned {}",
                info.size_bytes, info.alignment
            )));
        }
        self.outputs[index] = Some(buffer);
        Ok(())
    }

    fn run_epoch(&mut self) -> Result<EpochStatus> {
        let status = match self.epoch {
            0 => EpochStatus::Continue,
            1 => EpochStatus::WaitForEvent,
            2 => {
                self.compute()?;
                EpochStatus::Done
            }
            _ => {
                return Err(PipelineError::Accelerator(
                    "epoch scheduled after completion".into(),
                ))
            }
        };
        self.epoch += 1;
        Ok(status)
    }

    fn wait_for_event(&mut self) {
        thread::sleep(self.latency);
    }

    fn reset(&mut self) -> Result<()> {
        self.epoch = 0;
        Ok(())
    }
}

// ========== 显示 ==========

#[derive(Clone, Copy, Debug, Default)]
struct LayerRegs {
    latched: Option<DmaBuffer>,
    visible: Option<DmaBuffer>,
    reloads: u64,
}

#[derive(Default)]
pub struct SimDisplay {
    layers: Mutex<[LayerRegs; 2]>,
    updates: AtomicU64,
}

impl SimDisplay {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(layer: Layer) -> usize {
        match layer {
            Layer::Background => 0,
            Layer::Overlay => 1,
        }
    }

    fn regs(&self, layer: Layer) -> LayerRegs {
        self.layers
            .lock()
            .map(|l| l[Self::slot(layer)])
            .unwrap_or_default()
    }

    /// Buffer the display is scanning out on `layer`.
    pub fn visible(&self, layer: Layer) -> Option<DmaBuffer> {
        self.regs(layer).visible
    }

    /// Buffer that becomes visible on the next reload of `layer`.
    pub fn latched(&self, layer: Layer) -> Option<DmaBuffer> {
        self.regs(layer).latched
    }

    pub fn reload_count(&self, layer: Layer) -> u64 {
        self.regs(layer).reloads
    }

    pub fn update_count(&self) -> u64 {
        self.updates.load(Ordering::Relaxed)
    }
}

impl DisplayDriver for SimDisplay {
    fn init(&self, background: DmaBuffer, overlay: DmaBuffer) -> Result<()> {
        let mut layers = lock(&self.layers)?;
        for (slot, buffer) in [(0, background), (1, overlay)] {
            layers[slot].latched = Some(buffer);
            layers[slot].visible = Some(buffer);
        }
        info!("🖥  sim display ready");
        Ok(())
    }

    fn set_layer_address(&self, layer: Layer, buffer: DmaBuffer) -> Result<()> {
        lock(&self.layers)?[Self::slot(layer)].latched = Some(buffer);
        Ok(())
    }

    fn reload_layer(&self, layer: Layer) -> Result<()> {
        let mut layers = lock(&self.layers)?;
        let regs = &mut layers[Self::slot(layer)];
        regs.visible = regs.latched;
        regs.reloads += 1;
        Ok(())
    }

    fn update(&self) -> Result<()> {
        self.updates.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

// ========== ISP / 按键 ==========

#[derive(Clone, Debug, Default)]
pub struct SimIsp {
    updates: Arc<AtomicU64>,
}

impl SimIsp {
    pub fn update_count(&self) -> u64 {
        self.updates.load(Ordering::Relaxed)
    }
}

impl IspControl for SimIsp {
    fn update(&mut self) -> Result<()> {
        self.updates.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Button shared between the pipeline and whoever presses it.
#[derive(Clone, Debug, Default)]
pub struct SimButton {
    pressed: Arc<AtomicBool>,
}

impl SimButton {
    pub fn press(&self) {
        self.pressed.store(true, Ordering::Release);
    }

    pub fn release(&self) {
        self.pressed.store(false, Ordering::Release);
    }
}

impl ToggleInput for SimButton {
    fn is_pressed(&self) -> bool {
        self.pressed.load(Ordering::Acquire)
    }
}

// ========== 组装 ==========

/// A complete set of simulated hardware plus handles to observe it.
pub struct SimRig {
    pub camera: Arc<SimCamera>,
    pub display: Arc<SimDisplay>,
    pub button: SimButton,
    pub isp: SimIsp,
}

impl SimRig {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            camera: Arc::new(SimCamera::new(config.camera_fps)),
            display: Arc::new(SimDisplay::new()),
            button: SimButton::default(),
            isp: SimIsp::default(),
        }
    }

    /// Hardware bundle for [`crate::pipeline::run`], sharing this rig's devices.
    pub fn hardware(&self, config: &PipelineConfig) -> Result<Hardware> {
        Ok(Hardware {
            camera: self.camera.clone(),
            display: self.display.clone(),
            accelerator: Box::new(SimAccelerator::new(
                model::by_name(&config.model)?,
                Duration::from_millis(config.sim_inference_ms),
                config.postprocess.num_classes,
            )),
            postprocessor: Box::new(GridDecoder::new(config.postprocess.clone())?),
            tracker: tracker::select(config.tracker_enabled),
            isp: Box::new(self.isp.clone()),
            toggle: Box::new(self.button.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::{DetectionList, Postprocessor};
    use crate::model::st_yolox_nano_480;
    use crate::dma::DmaPool;
    use crate::hal::run_to_completion;
    use crate::model::OutputLayout;
    use crate::config::PostprocessParams;

    #[test]
    fn accelerator_reports_stamped_object() {
        let desc = st_yolox_nano_480();
        let layout = OutputLayout::new(&desc).unwrap();
        let input = DmaPool::new("in", 1, desc.input.size_bytes).unwrap();
        let output = DmaPool::new("out", 1, layout.total_len()).unwrap();
        stamp(input.get(0).unwrap(), 60);

        let mut acc = SimAccelerator::new(desc, Duration::ZERO, 1);
        acc.set_input(input.get(0).unwrap()).unwrap();
        let parts = layout.split(output.get(0).unwrap()).unwrap();
        for (i, part) in parts.iter().enumerate() {
            acc.set_output(i, *part).unwrap();
        }
        run_to_completion(&mut acc).unwrap();

        let mut pp = GridDecoder::new(PostprocessParams::default()).unwrap();
        let tensors: Vec<&[u8]> = parts.iter().map(|p| unsafe { p.as_slice() }).collect();
        let mut dets = DetectionList::new();
        pp.run(&tensors, &mut dets).unwrap();
        assert_eq!(dets.len(), 1);
        assert!((dets[0].x_center - 0.5).abs() < 1e-5);
    }

    #[test]
    fn accelerator_rejects_wrong_buffers() {
        let desc = st_yolox_nano_480();
        let small = DmaPool::new("small", 1, 64).unwrap();
        let mut acc = SimAccelerator::new(desc, Duration::ZERO, 1);
        assert!(matches!(
            acc.set_input(small.get(0).unwrap()),
            Err(PipelineError::Accelerator(_))
        ));
        assert!(acc.set_output(0, small.get(0).unwrap()).is_err());
        assert!(acc.set_output(7, small.get(0).unwrap()).is_err());
        // Epochs without buffers fail on the compute step.
        assert_eq!(acc.run_epoch().unwrap(), EpochStatus::Continue);
        assert_eq!(acc.run_epoch().unwrap(), EpochStatus::WaitForEvent);
        assert!(acc.run_epoch().is_err());
    }

    #[test]
    fn display_reload_swaps_latched_address() {
        let pool = DmaPool::new("fb", 3, 64).unwrap();
        let display = SimDisplay::new();
        display.init(pool.get(0).unwrap(), pool.get(1).unwrap()).unwrap();
        display.set_layer_address(Layer::Overlay, pool.get(2).unwrap()).unwrap();
        assert_eq!(display.visible(Layer::Overlay), pool.get(1));
        display.reload_layer(Layer::Overlay).unwrap();
        assert_eq!(display.visible(Layer::Overlay), pool.get(2));
        assert_eq!(display.reload_count(Layer::Overlay), 1);
        assert_eq!(display.reload_count(Layer::Background), 0);
    }

    #[test]
    fn button_is_shared() {
        let button = SimButton::default();
        let input: Box<dyn ToggleInput> = Box::new(button.clone());
        assert!(!input.is_pressed());
        button.press();
        assert!(input.is_pressed());
    }
}
