/// 检测系统 (Detection System)
///
/// Collaborators of the post-process stage:
/// - Postprocessor: 输出张量 → 检测框
/// - Tracker:       目标追踪
pub mod postprocess;
pub mod tracker;
pub mod types;

pub use postprocess::{GridDecoder, Postprocessor};
pub use tracker::{ByteTracker, NoTracker, Track, Tracker};
pub use types::{Detection, DetectionBox, DetectionList, TrackList, TrackedBox, MAX_DETECTIONS};
