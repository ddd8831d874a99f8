//! 检测/跟踪数据结构
//! Detection and tracking records exchanged between post-process and display.
//!
//! All coordinates are fractions of the network input frame (0.0..=1.0),
//! boxes are centre + size.

use heapless::Vec as HVec;

// ========== 公共常量 ==========

/// Most detections a single post-process run reports.
pub const MAX_DETECTIONS: usize = 10;

/// Tracker slots: live tracks plus lost ones still waiting to be matched.
pub const MAX_TRACKS: usize = 2 * MAX_DETECTIONS;

pub type DetectionList = HVec<Detection, MAX_DETECTIONS>;

/// Tracks published for display (only the ones seen this frame).
pub type TrackList = HVec<TrackedBox, MAX_DETECTIONS>;

// ========== 数据结构 ==========

/// 检测框
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Detection {
    pub x_center: f32,
    pub y_center: f32,
    pub width: f32,
    pub height: f32,
    pub conf: f32,
    pub class_index: u32,
}

impl Detection {
    /// (x1, y1, x2, y2)
    pub fn corners(&self) -> (f32, f32, f32, f32) {
        corners(self.x_center, self.y_center, self.width, self.height)
    }

    pub fn iou(&self, other: &Detection) -> f32 {
        iou(self.corners(), other.corners())
    }
}

/// Tracker input: one detection stripped to what association needs.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct DetectionBox {
    pub cx: f32,
    pub cy: f32,
    pub w: f32,
    pub h: f32,
    pub conf: f32,
}

impl From<&Detection> for DetectionBox {
    fn from(d: &Detection) -> Self {
        Self {
            cx: d.x_center,
            cy: d.y_center,
            w: d.width,
            h: d.height,
            conf: d.conf,
        }
    }
}

/// 跟踪框 (显示用)
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TrackedBox {
    pub cx: f32,
    pub cy: f32,
    pub w: f32,
    pub h: f32,
    pub id: u32,
}

pub fn corners(cx: f32, cy: f32, w: f32, h: f32) -> (f32, f32, f32, f32) {
    (cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0)
}

/// 计算两个边界框的IOU (Intersection over Union)
pub fn iou(a: (f32, f32, f32, f32), b: (f32, f32, f32, f32)) -> f32 {
    let x1 = a.0.max(b.0);
    let y1 = a.1.max(b.1);
    let x2 = a.2.min(b.2);
    let y2 = a.3.min(b.3);

    if x2 <= x1 || y2 <= y1 {
        return 0.0;
    }

    let intersection = (x2 - x1) * (y2 - y1);
    let area1 = (a.2 - a.0) * (a.3 - a.1);
    let area2 = (b.2 - b.0) * (b.3 - b.1);
    let union = area1 + area2 - intersection;

    if union <= 0.0 {
        return 0.0;
    }

    intersection / union
}

/// Copy `src` into `dst` up to its capacity. Returns how many were left out.
pub fn copy_bounded<T: Clone, const N: usize>(src: &[T], dst: &mut HVec<T, N>) -> usize {
    dst.clear();
    let kept = src.len().min(N);
    // kept <= N, cannot fail.
    let _ = dst.extend_from_slice(&src[..kept]);
    src.len() - kept
}
