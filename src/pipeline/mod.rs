/// 实时检测流水线 (Real-time detection pipeline)
///
/// 四任务 + 摄像头中断:
/// - Camera IRQ: 背景帧轮转 + 推理输入入队 (中断上下文)
/// - ISP:        每个vsync更新一次
/// - NN:         输入队列 → 加速器 → 输出队列
/// - PP:         输出队列 → 检测/跟踪 → 遥测
/// - DP:         遥测 → 叠加层渲染 → 双缓冲翻转
pub mod capture;
pub mod display;
pub mod inference;
pub mod postprocess;
pub mod task;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::info;

use crate::cache::{self, CacheMaintenance};
use crate::config::PipelineConfig;
use crate::cpuload::TaskRunTime;
use crate::detection::{Postprocessor, Tracker};
use crate::dma::{DmaBuffer, DmaPool};
use crate::error::{PipelineError, Result};
use crate::hal::{
    Accelerator, CameraDriver, CameraEvents, CameraPipe, DisplayDriver, IspControl, ToggleInput,
};
use crate::model::{self, ModelDescriptor, OutputLayout};
use crate::sync::{irq, BoundedBufferQueue, Semaphore, BQUEUE_MAX_BUFFERS};
use crate::telemetry::SharedTelemetryChannel;

pub use capture::{CaptureState, IspStage};
pub use display::{DisplayStage, OverlayRenderer};
pub use inference::InferenceStage;
pub use postprocess::PostprocessStage;
pub use task::Task;

/// Background (camera preview) pixel format: RGB565.
pub const BACKGROUND_BPP: usize = 2;

/// Everything the pipeline drives.
pub struct Hardware {
    pub camera: Arc<dyn CameraDriver>,
    pub display: Arc<dyn DisplayDriver>,
    pub accelerator: Box<dyn Accelerator>,
    pub postprocessor: Box<dyn Postprocessor>,
    pub tracker: Box<dyn Tracker>,
    pub isp: Box<dyn IspControl>,
    pub toggle: Box<dyn ToggleInput>,
}

// ========== 运行统计 ==========

#[derive(Debug, Default)]
pub struct PipelineStats {
    display_frames: AtomicU64,
    nn_frames: AtomicU64,
    nn_dropped: AtomicU64,
    inferences: AtomicU64,
    postprocessed: AtomicU64,
    renders: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub display_frames: u64,
    pub nn_frames: u64,
    pub nn_dropped: u64,
    pub inferences: u64,
    pub postprocessed: u64,
    pub renders: u64,
}

impl PipelineStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_display_frame(&self) {
        Self::bump(&self.display_frames)
    }

    pub fn record_nn_frame(&self) {
        Self::bump(&self.nn_frames)
    }

    pub fn record_nn_drop(&self) {
        Self::bump(&self.nn_dropped)
    }

    pub fn record_inference(&self) {
        Self::bump(&self.inferences)
    }

    pub fn record_postprocess(&self) {
        Self::bump(&self.postprocessed)
    }

    pub fn record_render(&self) {
        Self::bump(&self.renders)
    }

    pub fn read(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            display_frames: load(&self.display_frames),
            nn_frames: load(&self.nn_frames),
            nn_dropped: load(&self.nn_dropped),
            inferences: load(&self.inferences),
            postprocessed: load(&self.postprocessed),
            renders: load(&self.renders),
        }
    }
}

// ========== 共享上下文 ==========

/// State shared by the camera interrupts and every task.
pub struct PipelineContext {
    pub config: PipelineConfig,
    pub model: ModelDescriptor,
    pub layout: OutputLayout,
    pub nn_input: BoundedBufferQueue,
    pub nn_output: BoundedBufferQueue,
    pub telemetry: SharedTelemetryChannel,
    pub isp_signal: Semaphore,
    /// Camera preview ring, `display_delay + 2` frames.
    pub background: DmaPool,
    /// Overlay double buffer.
    pub overlay: DmaPool,
    pub capture: CaptureState,
    pub camera: Arc<dyn CameraDriver>,
    pub display: Arc<dyn DisplayDriver>,
    pub cache: Arc<dyn CacheMaintenance>,
    pub run_time: TaskRunTime,
    pub stats: PipelineStats,
    // Backing storage of the two queues.
    _nn_input_pool: DmaPool,
    _nn_output_pool: DmaPool,
}

impl PipelineContext {
    fn clear(&self, buffer: DmaBuffer) {
        // SAFETY: called before any DMA master or task is started.
        unsafe { buffer.as_mut_slice() }.fill(0);
        self.cache.clean_invalidate(buffer);
    }
}

/// Per-task state, handed to the task threads by [`run`] or stepped by hand.
pub struct Stages {
    pub isp: IspStage,
    pub inference: InferenceStage,
    pub postprocess: PostprocessStage,
    pub display: DisplayStage,
}

/// Allocate buffers, bring up the display and the display camera pipe, and
/// build every stage. No task is started.
pub fn init(config: PipelineConfig, mut hw: Hardware) -> Result<(Arc<PipelineContext>, Stages)> {
    config.validate()?;
    let model = model::by_name(&config.model)?;
    model.check_runtime(&hw.accelerator.descriptor())?;
    let layout = OutputLayout::new(&model)?;
    let nn_input_len = config.nn_input_len()?;
    if nn_input_len != model.input.size_bytes {
        return Err(PipelineError::contract(format!(
            "camera inference frame is {} bytes, model {} expects {}",
            nn_input_len, model.name, model.input.size_bytes
        )));
    }

    let pixels = config.display_width as usize * config.display_height as usize;
    let background = DmaPool::new("bg", config.display_buffer_count(), pixels * BACKGROUND_BPP)?;
    let overlay = DmaPool::new("fg", 2, pixels * display::OVERLAY_BPP)?;
    let nn_input_pool = DmaPool::new("nn_in", BQUEUE_MAX_BUFFERS, model.input.size_bytes)?;
    let nn_output_pool = DmaPool::new("nn_out", BQUEUE_MAX_BUFFERS, layout.total_len())?;

    hw.tracker.init(&config.tracker)?;

    let ctx = Arc::new(PipelineContext {
        nn_input: BoundedBufferQueue::init("nn_input", nn_input_pool.buffers())?,
        nn_output: BoundedBufferQueue::init("nn_output", nn_output_pool.buffers())?,
        telemetry: SharedTelemetryChannel::new()?,
        isp_signal: Semaphore::binary("isp")?,
        capture: CaptureState::new(),
        cache: cache::select(config.cache_enabled),
        run_time: TaskRunTime::new(),
        stats: PipelineStats::default(),
        camera: hw.camera,
        display: hw.display,
        config,
        model,
        layout,
        background,
        overlay,
        _nn_input_pool: nn_input_pool,
        _nn_output_pool: nn_output_pool,
    });

    for buffer in ctx.background.buffers().iter().chain(ctx.overlay.buffers()) {
        ctx.clear(*buffer);
    }
    let (disp, _) = ctx.capture.indices();
    let shown = ctx
        .background
        .get(disp)
        .ok_or_else(|| PipelineError::contract("background ring too short"))?;
    let front = ctx
        .overlay
        .get(1)
        .ok_or_else(|| PipelineError::contract("overlay pool too short"))?;
    ctx.display.init(shown, front)?;

    let stages = Stages {
        isp: IspStage::new(Arc::clone(&ctx), hw.isp),
        inference: InferenceStage::new(Arc::clone(&ctx), hw.accelerator)?,
        postprocess: PostprocessStage::new(
            Arc::clone(&ctx),
            hw.postprocessor,
            hw.tracker,
            hw.toggle,
        ),
        display: DisplayStage::new(Arc::clone(&ctx))?,
    };

    let first = ctx
        .background
        .get(0)
        .ok_or_else(|| PipelineError::contract("background ring is empty"))?;
    ctx.camera.start_pipe(CameraPipe::Display, first)?;

    info!(
        "🚀 pipeline ready: model {} | {} bg buffers | outputs {} bytes | cache {}",
        ctx.model.name,
        ctx.background.len(),
        ctx.layout.total_len(),
        if ctx.cache.is_enabled() { "on" } else { "off" }
    );
    Ok((ctx, stages))
}

/// A started pipeline.
pub struct Pipeline {
    ctx: Arc<PipelineContext>,
    handles: Vec<JoinHandle<()>>,
}

impl Pipeline {
    pub fn context(&self) -> &Arc<PipelineContext> {
        &self.ctx
    }

    /// Interrupt entry points for the camera.
    pub fn events(&self) -> Arc<dyn CameraEvents> {
        self.ctx.clone()
    }

    /// Frame-complete interrupt for `pipe_id`.
    pub fn frame_event(&self, pipe_id: u32) -> Result<()> {
        irq::isr(|| self.ctx.frame_event(pipe_id))
    }

    /// Vsync interrupt for `pipe_id`.
    pub fn vsync_event(&self, pipe_id: u32) -> Result<()> {
        irq::isr(|| self.ctx.vsync_event(pipe_id))
    }

    /// Number of task threads running.
    pub fn task_count(&self) -> usize {
        self.handles.iter().filter(|h| !h.is_finished()).count()
    }
}

/// [`init`] and start the four task threads.
pub fn run(config: PipelineConfig, hw: Hardware) -> Result<Pipeline> {
    let (ctx, stages) = init(config, hw)?;
    let Stages {
        isp,
        inference,
        postprocess,
        display,
    } = stages;
    let handles = vec![
        task::spawn(Task::Isp, move || isp.run())?,
        task::spawn(Task::Inference, move || inference.run())?,
        task::spawn(Task::PostProcess, move || postprocess.run())?,
        task::spawn(Task::Display, move || display.run())?,
    ];
    Ok(Pipeline { ctx, handles })
}
