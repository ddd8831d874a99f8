//! 后处理任务 (PP thread)
//! Decode output tensors, optionally track, and publish the result for
//! display.

use std::sync::Arc;

use heapless::Vec as HVec;
use tracing::{debug, info, trace};

use super::task::RateMeter;
use super::PipelineContext;
use crate::cpuload::RunTimeCounters;
use crate::detection::types::{copy_bounded, MAX_TRACKS};
use crate::detection::{
    DetectionBox, DetectionList, Postprocessor, TrackedBox, Tracker, MAX_DETECTIONS,
};
use crate::error::Result;
use crate::hal::ToggleInput;
use crate::model::MAX_NN_OUTPUTS;

pub struct PostprocessStage {
    ctx: Arc<PipelineContext>,
    postprocessor: Box<dyn Postprocessor>,
    tracker: Box<dyn Tracker>,
    toggle: Box<dyn ToggleInput>,
    tracking_enabled: bool,
    was_pressed: bool,
    detections: DetectionList,
    frame_seq: u64,
    meter: RateMeter,
}

impl PostprocessStage {
    pub fn new(
        ctx: Arc<PipelineContext>,
        postprocessor: Box<dyn Postprocessor>,
        tracker: Box<dyn Tracker>,
        toggle: Box<dyn ToggleInput>,
    ) -> Self {
        let tracking_enabled = tracker.is_enabled();
        Self {
            ctx,
            postprocessor,
            tracker,
            toggle,
            tracking_enabled,
            was_pressed: false,
            detections: DetectionList::new(),
            frame_seq: 0,
            meter: RateMeter::new(),
        }
    }

    pub fn tracking_enabled(&self) -> bool {
        self.tracking_enabled
    }

    /// Flip tracking on a press (rising edge). Re-enabling starts from an
    /// empty track table.
    fn poll_toggle(&mut self) -> Result<()> {
        let pressed = self.toggle.is_pressed();
        let rising = pressed && !self.was_pressed;
        self.was_pressed = pressed;
        if !rising || !self.tracker.is_enabled() {
            return Ok(());
        }
        self.tracking_enabled = !self.tracking_enabled;
        if self.tracking_enabled {
            self.tracker.init(&self.ctx.config.tracker)?;
        }
        info!(
            "🎯 tracking {}",
            if self.tracking_enabled { "enabled" } else { "disabled" }
        );
        Ok(())
    }

    pub fn step(&mut self) -> Result<()> {
        let ctx = Arc::clone(&self.ctx);
        let output = ctx.nn_output.acquire_ready()?;
        let tensors = ctx.layout.split(output)?;

        let ts = ctx.run_time.tick_ms();
        {
            let _busy = ctx.run_time.busy();
            // SAFETY: the output buffer is owned by this task between
            // acquire_ready and release_free; the accelerator is done with it.
            let views: HVec<&[u8], MAX_NN_OUTPUTS> =
                tensors.iter().map(|t| unsafe { t.as_slice() }).collect();
            self.postprocessor.run(&views, &mut self.detections)?;

            self.poll_toggle()?;
            if self.tracking_enabled {
                let boxes: HVec<DetectionBox, MAX_DETECTIONS> =
                    self.detections.iter().map(DetectionBox::from).collect();
                self.tracker.update(&boxes)?;
            }
        }
        let pp_ms = ctx.run_time.tick_ms().wrapping_sub(ts);
        self.frame_seq += 1;

        let detections = &self.detections;
        let tracking = self.tracking_enabled;
        let mut visible: HVec<TrackedBox, MAX_TRACKS> = HVec::new();
        let mut overflow = 0;
        if tracking {
            for track in self.tracker.tracks().iter().filter(|t| t.is_visible()) {
                if visible.push(track.to_box()).is_err() {
                    overflow += 1;
                }
            }
        }
        let seq = self.frame_seq;
        let dropped = ctx.telemetry.with_lock(|s| {
            s.detections.clone_from(detections);
            s.tracking_enabled = tracking;
            let dropped = overflow + copy_bounded(&visible, &mut s.tracks);
            s.pp_ms = pp_ms;
            s.frame_seq = seq;
            dropped
        })?;
        if dropped > 0 {
            trace!("pp frame {seq}: {dropped} tracks over the display limit");
        }

        ctx.nn_output.release_free()?;
        ctx.telemetry.notify();
        ctx.stats.record_postprocess();

        debug!("pp frame {seq}: {} detections in {pp_ms} ms", detections.len());
        if let Some(rate) = self.meter.tick() {
            info!(
                "📦 PP {:.1} fps | {} objects | tracking {}",
                rate,
                detections.len(),
                tracking
            );
        }
        Ok(())
    }

    pub fn run(mut self) -> Result<()> {
        loop {
            self.step()?;
        }
    }
}
