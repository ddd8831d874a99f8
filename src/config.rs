//! 流水线配置 - CLI参数 + JSON文件
//! Pipeline configuration: command line flags layered over a JSON file.

use std::fs;
use std::path::{Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{PipelineError, Result};

/// Upper bound on the video pipeline delay (frames).
pub const MAX_DISPLAY_DELAY: usize = 8;

/// Largest accepted width or height, display and network input alike.
pub const MAX_DIMENSION: u32 = 4096;

/// Largest accepted network input depth (bytes per pixel).
pub const MAX_NN_BPP: u32 = 4;

/// 命令行参数
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Camera → NPU → overlay detection pipeline", long_about = None)]
pub struct Args {
    /// JSON config file (created with defaults when missing)
    #[arg(short, long, default_value = "sentinel.json")]
    pub config: PathBuf,

    /// Frames between capture and display
    #[arg(long)]
    pub display_delay: Option<usize>,

    /// Camera frame rate
    #[arg(long)]
    pub fps: Option<u32>,

    /// Display width in pixels
    #[arg(long)]
    pub width: Option<u32>,

    /// Display height in pixels
    #[arg(long)]
    pub height: Option<u32>,

    /// Build without the object tracker
    #[arg(long)]
    pub no_tracker: bool,

    /// Skip data-cache maintenance
    #[arg(long)]
    pub no_cache: bool,

    /// TrueType font used for overlay text
    #[arg(long)]
    pub font: Option<PathBuf>,

    /// Exit after this many seconds (runs forever otherwise)
    #[arg(long)]
    pub run_for: Option<u64>,

    /// Log filter, e.g. `info` or `sentinel_rt=debug`
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// 跟踪器参数
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerParams {
    /// Detections at or above this score join the first association round;
    /// weaker ones are only used to rescue unmatched tracks.
    pub track_thresh: f32,
    /// Minimum confidence for an unmatched detection to open a new track.
    pub det_thresh: f32,
    /// Largest matching cost (`1 - IoU`) accepted in the first round.
    pub sim1_thresh: f32,
    /// Largest matching cost (`1 - IoU`) accepted in the rescue round.
    pub sim2_thresh: f32,
    /// Frames a track may stay unmatched before it is dropped.
    pub tlost_cnt: u32,
}

impl Default for TrackerParams {
    fn default() -> Self {
        Self {
            track_thresh: 0.25,
            det_thresh: 0.8,
            sim1_thresh: 0.8,
            sim2_thresh: 0.5,
            tlost_cnt: 30,
        }
    }
}

/// 后处理参数
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostprocessParams {
    pub conf_threshold: f32,
    pub iou_threshold: f32,
    pub num_classes: usize,
    pub class_names: Vec<String>,
}

impl Default for PostprocessParams {
    fn default() -> Self {
        Self {
            conf_threshold: 0.6,
            iou_threshold: 0.5,
            num_classes: 1,
            class_names: vec!["person".to_string()],
        }
    }
}

impl PostprocessParams {
    pub fn class_name(&self, class_index: u32) -> &str {
        self.class_names
            .get(class_index as usize)
            .map(String::as_str)
            .unwrap_or("?")
    }
}

/// 流水线配置
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    // === 显示 ===
    pub display_width: u32,
    pub display_height: u32,
    pub display_delay: usize,
    pub font_path: Option<PathBuf>,
    pub font_size: f32,

    // === 摄像头 ===
    pub camera_fps: u32,

    // === 神经网络 ===
    /// Built-in model descriptor the buffers are laid out for.
    pub model: String,
    pub nn_width: u32,
    pub nn_height: u32,
    pub nn_bpp: u32,
    /// Simulated accelerator latency per frame.
    pub sim_inference_ms: u64,

    // === 能力开关 ===
    pub tracker_enabled: bool,
    pub cache_enabled: bool,

    pub tracker: TrackerParams,
    pub postprocess: PostprocessParams,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            display_width: 800,
            display_height: 480,
            display_delay: 1,
            font_path: None,
            font_size: 20.0,
            camera_fps: 30,
            model: "st_yolox_nano_480".to_string(),
            nn_width: 480,
            nn_height: 480,
            nn_bpp: 3,
            sim_inference_ms: 45,
            tracker_enabled: true,
            cache_enabled: true,
            tracker: TrackerParams::default(),
            postprocess: PostprocessParams::default(),
        }
    }
}

impl PipelineConfig {
    /// 从JSON文件加载配置; writes the defaults out when the file is missing.
    pub fn load(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(json) => {
                let config: Self = serde_json::from_str(&json)?;
                info!("config loaded from {}", path.display());
                Ok(config)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let config = Self::default();
                if let Err(err) = config.save(path) {
                    warn!("could not write default config to {}: {err}", path.display());
                }
                Ok(config)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// 保存配置到JSON文件
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        info!("config saved to {}", path.display());
        Ok(())
    }

    /// Layer command line overrides on top of the file values.
    pub fn apply_args(&mut self, args: &Args) {
        if let Some(delay) = args.display_delay {
            self.display_delay = delay;
        }
        if let Some(fps) = args.fps {
            self.camera_fps = fps;
        }
        if let Some(width) = args.width {
            self.display_width = width;
        }
        if let Some(height) = args.height {
            self.display_height = height;
        }
        if args.no_tracker {
            self.tracker_enabled = false;
        }
        if args.no_cache {
            self.cache_enabled = false;
        }
        if let Some(font) = &args.font {
            self.font_path = Some(font.clone());
        }
    }

    pub fn validate(&self) -> Result<()> {
        let dims = 1..=MAX_DIMENSION;
        for (name, value) in [
            ("display_width", self.display_width),
            ("display_height", self.display_height),
            ("nn_width", self.nn_width),
            ("nn_height", self.nn_height),
        ] {
            if !dims.contains(&value) {
                return Err(PipelineError::config(format!(
                    "{name} = {value} out of range 1..={MAX_DIMENSION}"
                )));
            }
        }
        if !(1..=MAX_NN_BPP).contains(&self.nn_bpp) {
            return Err(PipelineError::config(format!(
                "nn_bpp = {} out of range 1..={MAX_NN_BPP}",
                self.nn_bpp
            )));
        }
        if !(self.font_size.is_finite() && self.font_size > 0.0) {
            return Err(PipelineError::config(format!(
                "font_size = {} must be positive",
                self.font_size
            )));
        }
        crate::model::by_name(&self.model)?;
        if self.display_delay > MAX_DISPLAY_DELAY {
            return Err(PipelineError::config(format!(
                "display_delay {} exceeds {MAX_DISPLAY_DELAY}",
                self.display_delay
            )));
        }
        if !(1..=120).contains(&self.camera_fps) {
            return Err(PipelineError::config(format!(
                "camera_fps {} out of range 1..=120",
                self.camera_fps
            )));
        }
        let unit = 0.0..=1.0;
        let t = &self.tracker;
        let p = &self.postprocess;
        for (name, value) in [
            ("track_thresh", t.track_thresh),
            ("det_thresh", t.det_thresh),
            ("sim1_thresh", t.sim1_thresh),
            ("sim2_thresh", t.sim2_thresh),
            ("conf_threshold", p.conf_threshold),
            ("iou_threshold", p.iou_threshold),
        ] {
            if !unit.contains(&value) {
                return Err(PipelineError::config(format!(
                    "{name} = {value} is outside [0, 1]"
                )));
            }
        }
        if p.num_classes == 0 {
            return Err(PipelineError::config("num_classes must be at least 1"));
        }
        Ok(())
    }

    /// Display ring depth: the delayed frames plus one being captured and one shown.
    pub fn display_buffer_count(&self) -> usize {
        self.display_delay + 2
    }

    /// Bytes in one camera inference frame.
    pub fn nn_input_len(&self) -> Result<usize> {
        [self.nn_height, self.nn_bpp]
            .iter()
            .try_fold(self.nn_width as usize, |len, &n| len.checked_mul(n as usize))
            .ok_or_else(|| {
                PipelineError::config(format!(
                    "nn input {}x{}x{} overflows",
                    self.nn_width, self.nn_height, self.nn_bpp
                ))
            })
    }

    /// 打印当前配置
    pub fn log_summary(&self) {
        info!(
            "display {}x{} delay={} | camera {}fps | nn {} {}x{}x{} | tracker={} cache={}",
            self.display_width,
            self.display_height,
            self.display_delay,
            self.camera_fps,
            self.model,
            self.nn_width,
            self.nn_height,
            self.nn_bpp,
            self.tracker_enabled,
            self.cache_enabled,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = PipelineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.display_buffer_count(), 3);
        assert_eq!(config.nn_input_len().unwrap(), 691_200);
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        let mut config = PipelineConfig::default();
        config.tracker.sim1_thresh = 1.5;
        assert!(matches!(config.validate(), Err(PipelineError::Config(_))));
    }

    #[test]
    fn rejects_excessive_delay() {
        let mut config = PipelineConfig::default();
        config.display_delay = MAX_DISPLAY_DELAY + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_oversized_nn_geometry() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{ "nn_width": 70000, "nn_height": 70000 }"#).unwrap();
        assert!(matches!(config.validate(), Err(PipelineError::Config(_))));

        let mut config = PipelineConfig::default();
        config.nn_bpp = 5;
        assert!(config.validate().is_err());

        // The length itself never panics, even for values validate refuses.
        config.nn_width = u32::MAX;
        config.nn_height = u32::MAX;
        config.nn_bpp = u32::MAX;
        assert!(matches!(config.nn_input_len(), Err(PipelineError::Config(_))));
    }

    #[test]
    fn rejects_bad_font_size_and_unknown_model() {
        let mut config = PipelineConfig::default();
        config.font_size = 0.0;
        assert!(matches!(config.validate(), Err(PipelineError::Config(_))));
        config.font_size = f32::NAN;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.model = "yolov8n".into();
        assert!(matches!(config.validate(), Err(PipelineError::Config(_))));
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{ "display_delay": 3, "tracker": { "tlost_cnt": 5 } }"#)
                .unwrap();
        assert_eq!(config.display_delay, 3);
        assert_eq!(config.tracker.tlost_cnt, 5);
        assert_eq!(config.tracker.det_thresh, 0.8);
        assert_eq!(config.camera_fps, 30);
    }

    #[test]
    fn args_override_file_values() {
        let args = Args::parse_from(["sentinel", "--fps", "15", "--no-tracker", "--display-delay", "2"]);
        let mut config = PipelineConfig::default();
        config.apply_args(&args);
        assert_eq!(config.camera_fps, 15);
        assert!(!config.tracker_enabled);
        assert_eq!(config.display_buffer_count(), 4);
        assert!(config.cache_enabled);
    }

    #[test]
    fn missing_file_creates_defaults() {
        let path = std::env::temp_dir().join(format!("sentinel-cfg-{}.json", std::process::id()));
        let _ = fs::remove_file(&path);
        let config = PipelineConfig::load(&path).unwrap();
        assert_eq!(config, PipelineConfig::default());
        let reloaded = PipelineConfig::load(&path).unwrap();
        assert_eq!(reloaded, config);
        let _ = fs::remove_file(&path);
    }
}
