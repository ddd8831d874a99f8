//! 显示任务 (DP thread)
//!
//! Renders the latest telemetry into one of two overlay buffers while the
//! other is on screen, then flips. The new address is latched before
//! drawing starts but only reloaded once the buffer is complete and cleaned.

use std::fs;
use std::sync::Arc;

use ab_glyph::{FontVec, PxScale};
use image::{Rgba, RgbaImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use tracing::{info, warn};

use super::PipelineContext;
use crate::config::{PipelineConfig, PostprocessParams};
use crate::cpuload::{CpuLoadInfo, CpuLoadMonitor, RunTimeCounters};
use crate::error::{PipelineError, Result};
use crate::hal::Layer;
use crate::sync::irq;
use crate::telemetry::TelemetrySnapshot;

/// Overlay pixel format: RGBA8888.
pub const OVERLAY_BPP: usize = 4;

/// Box colours, indexed by class (detections) or id (tracks) modulo 10.
pub const PALETTE: [Rgba<u8>; 10] = [
    Rgba([0, 255, 0, 255]),     // green
    Rgba([255, 0, 0, 255]),     // red
    Rgba([0, 255, 255, 255]),   // cyan
    Rgba([255, 0, 255, 255]),   // magenta
    Rgba([255, 255, 0, 255]),   // yellow
    Rgba([128, 128, 128, 255]), // gray
    Rgba([0, 0, 0, 255]),       // black
    Rgba([165, 42, 42, 255]),   // brown
    Rgba([0, 0, 255, 255]),     // blue
    Rgba([255, 165, 0, 255]),   // orange
];

const TEXT_COLOR: Rgba<u8> = Rgba([255, 255, 255, 255]);
const TRANSPARENT: Rgba<u8> = Rgba([0, 0, 0, 0]);

pub fn palette_color(index: u32) -> Rgba<u8> {
    PALETTE[index as usize % PALETTE.len()]
}

/// Frames per second for an inference period; 0 for an unknown period.
pub fn fps_from_period(period_ms: u32) -> f32 {
    if period_ms == 0 {
        0.0
    } else {
        1000.0 / period_ms as f32
    }
}

// ========== 叠加层渲染 ==========

pub struct OverlayRenderer {
    width: u32,
    height: u32,
    canvas: RgbaImage,
    font: Option<FontVec>,
    scale: PxScale,
    postprocess: PostprocessParams,
}

impl OverlayRenderer {
    pub fn new(config: &PipelineConfig) -> Result<Self> {
        let font = match &config.font_path {
            Some(path) => {
                let bytes = fs::read(path)?;
                let font = FontVec::try_from_vec(bytes).map_err(|_| {
                    PipelineError::config(format!("{} is not a usable font", path.display()))
                })?;
                info!("overlay font {}", path.display());
                Some(font)
            }
            None => {
                warn!("no overlay font configured, labels and metrics are not drawn");
                None
            }
        };
        Ok(Self {
            width: config.display_width,
            height: config.display_height,
            canvas: RgbaImage::new(config.display_width, config.display_height),
            font,
            scale: PxScale::from(config.font_size),
            postprocess: config.postprocess.clone(),
        })
    }

    pub fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * OVERLAY_BPP
    }

    /// Display pixel rectangle for a normalised centre/size box, clamped to
    /// the screen.
    pub fn to_rect(&self, cx: f32, cy: f32, w: f32, h: f32) -> Rect {
        let (fw, fh) = (self.width as f32, self.height as f32);
        let (max_x, max_y) = (self.width as i32 - 1, self.height as i32 - 1);
        let xc = (fw * cx) as i32;
        let yc = (fh * cy) as i32;
        let bw = (fw * w) as i32;
        let bh = (fh * h) as i32;
        let x0 = (xc - (bw + 1) / 2).clamp(0, max_x);
        let y0 = (yc - (bh + 1) / 2).clamp(0, max_y);
        let x1 = (xc + (bw + 1) / 2).clamp(0, max_x);
        let y1 = (yc + (bh + 1) / 2).clamp(0, max_y);
        Rect::at(x0, y0).of_size((x1 - x0).max(1) as u32, (y1 - y0).max(1) as u32)
    }

    fn label(&mut self, x: i32, y: i32, color: Rgba<u8>, text: &str) {
        if let Some(font) = &self.font {
            draw_text_mut(&mut self.canvas, color, x, y, self.scale, font, text);
        }
    }

    fn draw_box(&mut self, rect: Rect, color: Rgba<u8>, text: &str) {
        draw_hollow_rect_mut(&mut self.canvas, rect, color);
        let y = (rect.top() - self.scale.y as i32).max(0);
        self.label(rect.left(), y, color, text);
    }

    fn draw_metrics(&mut self, snap: &TelemetrySnapshot, cpu: &CpuLoadInfo) {
        let load = cpu.last_second.or(cpu.last).unwrap_or(0.0);
        let lines = [
            "Cpu load".to_string(),
            format!("{:.1}%", load),
            String::new(),
            "Inference".to_string(),
            format!("{}ms", snap.inf_ms),
            String::new(),
            "FPS".to_string(),
            format!("{:.2}", fps_from_period(snap.nn_period_ms)),
            String::new(),
            format!("Objects {}", snap.object_count()),
        ];
        let step = self.scale.y as i32;
        for (i, line) in lines.iter().enumerate() {
            if !line.is_empty() {
                self.label(4, 4 + i as i32 * step, TEXT_COLOR, line);
            }
        }
    }

    /// Draw `snap` over a cleared canvas and copy the result into `dst`.
    pub fn render(
        &mut self,
        dst: &mut [u8],
        snap: &TelemetrySnapshot,
        cpu: &CpuLoadInfo,
    ) -> Result<()> {
        if dst.len() != self.frame_len() {
            return Err(PipelineError::contract(format!(
                "overlay buffer is {} bytes, expected {}",
                dst.len(),
                self.frame_len()
            )));
        }
        self.canvas.pixels_mut().for_each(|p| *p = TRANSPARENT);

        if snap.tracking_enabled {
            for track in &snap.tracks {
                let rect = self.to_rect(track.cx, track.cy, track.w, track.h);
                self.draw_box(rect, palette_color(track.id), &format!("{:3}", track.id));
            }
        } else {
            for det in &snap.detections {
                let rect = self.to_rect(det.x_center, det.y_center, det.width, det.height);
                let name = self.postprocess.class_name(det.class_index).to_string();
                self.draw_box(rect, palette_color(det.class_index), &name);
            }
        }
        self.draw_metrics(snap, cpu);

        dst.copy_from_slice(self.canvas.as_raw());
        Ok(())
    }
}

// ========== 显示任务 ==========

pub struct DisplayStage {
    ctx: Arc<PipelineContext>,
    renderer: OverlayRenderer,
    cpu: CpuLoadMonitor,
    /// Overlay buffer drawn next; the other one is on screen.
    rd_idx: usize,
    last_render_ms: u32,
}

impl DisplayStage {
    pub fn new(ctx: Arc<PipelineContext>) -> Result<Self> {
        let renderer = OverlayRenderer::new(&ctx.config)?;
        if ctx.overlay.region_len() < renderer.frame_len() {
            return Err(PipelineError::contract("overlay buffers smaller than the display"));
        }
        Ok(Self {
            ctx,
            renderer,
            cpu: CpuLoadMonitor::new(),
            rd_idx: 0,
            last_render_ms: 0,
        })
    }

    /// Index of the overlay buffer the next render goes to.
    pub fn draw_index(&self) -> usize {
        self.rd_idx
    }

    /// Wait for an update and render it.
    pub fn step(&mut self) -> Result<()> {
        self.ctx.telemetry.wait_update()?;
        self.render_latest()
    }

    /// Render the current snapshot into the back overlay and flip.
    pub fn render_latest(&mut self) -> Result<()> {
        let ctx = Arc::clone(&self.ctx);
        let mut snap = ctx.telemetry.snapshot()?;
        snap.disp_ms = self.last_render_ms;

        let ts = ctx.run_time.tick_ms();
        let target = ctx
            .overlay
            .get(self.rd_idx)
            .and_then(|b| b.slice(0, self.renderer.frame_len()))
            .ok_or_else(|| PipelineError::contract(format!("no overlay buffer {}", self.rd_idx)))?;
        irq::free(|| ctx.display.set_layer_address(Layer::Overlay, target))?;

        self.cpu.update(&ctx.run_time);
        let load = self.cpu.get_info();
        {
            let _busy = ctx.run_time.busy();
            // SAFETY: buffer rd is not on screen and only this task writes it.
            let dst = unsafe { target.as_mut_slice() };
            self.renderer.render(dst, &snap, &load)?;
        }
        ctx.cache.clean(target);
        irq::free(|| ctx.display.reload_layer(Layer::Overlay))?;

        self.rd_idx = 1 - self.rd_idx;
        self.last_render_ms = ctx.run_time.tick_ms().wrapping_sub(ts);
        ctx.telemetry.record_display(self.last_render_ms)?;
        ctx.stats.record_render();
        Ok(())
    }

    pub fn run(mut self) -> Result<()> {
        loop {
            self.step()?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::{Detection, TrackedBox};

    fn renderer(w: u32, h: u32) -> OverlayRenderer {
        let config = PipelineConfig {
            display_width: w,
            display_height: h,
            ..PipelineConfig::default()
        };
        OverlayRenderer::new(&config).unwrap()
    }

    fn pixel(buf: &[u8], width: u32, x: u32, y: u32) -> [u8; 4] {
        let i = ((y * width + x) as usize) * OVERLAY_BPP;
        [buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]
    }

    #[test]
    fn rect_is_clamped_to_screen() {
        let r = renderer(100, 100);
        let rect = r.to_rect(0.5, 0.5, 0.5, 0.5);
        assert_eq!((rect.left(), rect.top(), rect.width(), rect.height()), (25, 25, 50, 50));

        let edge = r.to_rect(0.0, 1.0, 0.4, 0.4);
        assert_eq!((edge.left(), edge.top()), (0, 80));
        assert_eq!((edge.width(), edge.height()), (20, 19));

        let tiny = r.to_rect(0.5, 0.5, 0.0, 0.0);
        assert_eq!((tiny.width(), tiny.height()), (1, 1));
    }

    #[test]
    fn detections_use_class_colour() {
        let mut r = renderer(100, 100);
        let mut snap = TelemetrySnapshot::default();
        snap.detections
            .push(Detection {
                x_center: 0.5,
                y_center: 0.5,
                width: 0.5,
                height: 0.5,
                conf: 0.9,
                class_index: 1,
            })
            .unwrap();
        let mut buf = vec![0xAA; r.frame_len()];
        r.render(&mut buf, &snap, &CpuLoadInfo::default()).unwrap();

        assert_eq!(pixel(&buf, 100, 25, 50), PALETTE[1].0);
        assert_eq!(pixel(&buf, 100, 50, 50), [0, 0, 0, 0]);
        assert_eq!(pixel(&buf, 100, 5, 95), [0, 0, 0, 0]);
    }

    #[test]
    fn tracks_replace_detections_when_tracking() {
        let mut r = renderer(100, 100);
        let mut snap = TelemetrySnapshot {
            tracking_enabled: true,
            ..TelemetrySnapshot::default()
        };
        snap.detections.push(Detection {
            x_center: 0.2,
            y_center: 0.2,
            width: 0.2,
            height: 0.2,
            conf: 0.9,
            class_index: 0,
        })
        .unwrap();
        snap.tracks
            .push(TrackedBox { cx: 0.5, cy: 0.5, w: 0.5, h: 0.5, id: 13 })
            .unwrap();
        let mut buf = vec![0; r.frame_len()];
        r.render(&mut buf, &snap, &CpuLoadInfo::default()).unwrap();

        assert_eq!(pixel(&buf, 100, 25, 50), palette_color(13).0);
        // The detection at (10..30, 10..30) is not drawn.
        assert_eq!(pixel(&buf, 100, 10, 20), [0, 0, 0, 0]);
    }

    #[test]
    fn wrong_buffer_size_is_rejected() {
        let mut r = renderer(10, 10);
        let mut buf = vec![0; 10];
        assert!(r
            .render(&mut buf, &TelemetrySnapshot::default(), &CpuLoadInfo::default())
            .is_err());
    }

    #[test]
    fn fps_handles_zero_period() {
        assert_eq!(fps_from_period(0), 0.0);
        assert!((fps_from_period(40) - 25.0).abs() < 1e-6);
    }
}
