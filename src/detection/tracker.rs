//! 多目标跟踪 (ByteTrack)
//! Multi-object tracking over post-process detections.
//!
//! 核心思想:
//! 1. 高低分检测框分开处理
//! 2. 高分框优先匹配 (IOU)
//! 3. 低分框救援丢失的轨迹
//! 4. 纯运动模型,无需外观特征
//!
//! Tracks live in a fixed table of [`MAX_TRACKS`] slots; nothing is allocated
//! per frame.

use heapless::Vec as HVec;
use tracing::{debug, info};

use super::types::{corners, iou, DetectionBox, TrackedBox, MAX_DETECTIONS, MAX_TRACKS};
use crate::config::TrackerParams;
use crate::error::{PipelineError, Result};

/// Detections below this score are ignored entirely.
const LOW_SCORE_FLOOR: f32 = 0.1;

/// The filter runs in per-mille frame units so its noise terms keep the
/// magnitudes they were tuned for.
const COORD_SCALE: f32 = 1000.0;

// ========== 跟踪器统一接口 ==========

/// One tracker slot as seen from outside.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Track {
    pub id: u32,
    pub cx: f32,
    pub cy: f32,
    pub w: f32,
    pub h: f32,
    pub conf: f32,
    /// Confirmed track (tentative ones are not shown).
    pub is_tracking: bool,
    /// Frames since the last matching detection; 0 means seen this frame.
    pub tlost_cnt: u32,
}

impl Track {
    pub fn is_visible(&self) -> bool {
        self.is_tracking && self.tlost_cnt == 0
    }

    pub fn to_box(&self) -> TrackedBox {
        TrackedBox {
            cx: self.cx,
            cy: self.cy,
            w: self.w,
            h: self.h,
            id: self.id,
        }
    }
}

/// 多目标跟踪器 Trait
pub trait Tracker: Send {
    /// Drop every track and restart id numbering with `params`.
    fn init(&mut self, params: &TrackerParams) -> Result<()>;

    fn update(&mut self, detections: &[DetectionBox]) -> Result<()>;

    fn tracks(&self) -> &[Track];

    /// `false` for the no-op tracker used when tracking is compiled out.
    fn is_enabled(&self) -> bool {
        true
    }
}

/// Tracking capability absent.
#[derive(Debug, Default)]
pub struct NoTracker;

impl Tracker for NoTracker {
    fn init(&mut self, _params: &TrackerParams) -> Result<()> {
        Ok(())
    }

    fn update(&mut self, _detections: &[DetectionBox]) -> Result<()> {
        Ok(())
    }

    fn tracks(&self) -> &[Track] {
        &[]
    }

    fn is_enabled(&self) -> bool {
        false
    }
}

/// Resolve the tracking capability from configuration.
pub fn select(enabled: bool) -> Box<dyn Tracker> {
    if enabled {
        Box::new(ByteTracker::new())
    } else {
        Box::new(NoTracker)
    }
}

// ========== 卡尔曼滤波器 ==========

/// 简化卡尔曼滤波器
/// 状态向量: [cx, cy, w, h, vx, vy, vw, vh], diagonal covariance.
#[derive(Clone, Debug)]
pub struct KalmanBoxFilter {
    state: [f32; 8],
    p: [f32; 8],
    /// 过程噪声
    q: f32,
    /// 观测噪声
    r: f32,
    velocity_decay: f32,
    stationary_threshold: f32,
    stationary_count: u32,
}

impl KalmanBoxFilter {
    /// `(cx, cy, w, h)` in filter units.
    pub fn new(measurement: [f32; 4], q: f32, r: f32) -> Self {
        let [cx, cy, w, h] = measurement;
        Self {
            state: [cx, cy, w, h, 0.0, 0.0, 0.0, 0.0],
            p: [10.0; 8],
            q,
            r,
            velocity_decay: 0.95,
            stationary_threshold: 2.0,
            stationary_count: 0,
        }
    }

    /// 预测下一帧状态 (匀速运动模型 + 速度衰减)
    pub fn predict(&mut self) {
        let speed = (self.state[4] * self.state[4] + self.state[5] * self.state[5]).sqrt();
        let is_stationary = speed < self.stationary_threshold;

        let (decay_pos, decay_size) = if is_stationary {
            self.stationary_count += 1;
            let decay = if self.stationary_count > 3 {
                0.7
            } else {
                self.velocity_decay
            };
            (decay, decay)
        } else {
            self.stationary_count = 0;
            (self.velocity_decay, 0.98)
        };
        self.state[4] *= decay_pos;
        self.state[5] *= decay_pos;
        self.state[6] *= decay_size;
        self.state[7] *= decay_size;

        for i in 0..4 {
            self.state[i] += self.state[i + 4];
        }

        let q = if is_stationary { self.q * 0.5 } else { self.q };
        for p in &mut self.p {
            *p += q;
        }
    }

    /// 更新 (融合观测值,自适应噪声调整)
    pub fn update(&mut self, measurement: [f32; 4]) {
        let y = [
            measurement[0] - self.state[0],
            measurement[1] - self.state[1],
            measurement[2] - self.state[2],
            measurement[3] - self.state[3],
        ];

        let residual_norm = (y[0] * y[0] + y[1] * y[1]).sqrt();
        let r = if residual_norm < self.stationary_threshold {
            self.r * 0.3
        } else if residual_norm < 10.0 {
            self.r
        } else {
            self.r * 3.0
        };

        let mut k = [0.0; 8];
        for i in 0..4 {
            k[i] = self.p[i] / (self.p[i] + r);
            k[i + 4] = self.p[i + 4] / (self.p[i + 4] + r * 10.0);
        }

        let velocity_gain = if residual_norm < self.stationary_threshold {
            0.3
        } else {
            1.0
        };
        for i in 0..4 {
            self.state[i] += k[i] * y[i];
            self.state[i + 4] += k[i + 4] * y[i] * velocity_gain;
        }

        for (p, k) in self.p.iter_mut().zip(k) {
            *p *= 1.0 - k;
        }

        if residual_norm >= self.stationary_threshold {
            self.stationary_count = 0;
        }
    }

    /// `(cx, cy, w, h)` of the current estimate.
    pub fn state(&self) -> [f32; 4] {
        [
            self.state[0],
            self.state[1],
            self.state[2].max(1.0),
            self.state[3].max(1.0),
        ]
    }

    /// `(cx, cy, w, h)` one step ahead, used for association.
    pub fn predicted(&self) -> [f32; 4] {
        [
            self.state[0] + self.state[4],
            self.state[1] + self.state[5],
            (self.state[2] + self.state[6]).max(1.0),
            (self.state[3] + self.state[7]).max(1.0),
        ]
    }
}

// ========== ByteTrack ==========

#[derive(Clone, Debug)]
struct Slot {
    track: Track,
    kalman: KalmanBoxFilter,
    /// Matched a detection in the current frame.
    hit: bool,
}

impl Slot {
    fn new(id: u32, det: &DetectionBox, confirmed: bool) -> Self {
        let kalman = KalmanBoxFilter::new(to_filter(det), 0.1, 0.5);
        let mut slot = Self {
            track: Track {
                id,
                cx: 0.0,
                cy: 0.0,
                w: 0.0,
                h: 0.0,
                conf: det.conf,
                is_tracking: confirmed,
                tlost_cnt: 0,
            },
            kalman,
            hit: true,
        };
        slot.publish();
        slot
    }

    fn publish(&mut self) {
        let [cx, cy, w, h] = self.kalman.state();
        self.track.cx = cx / COORD_SCALE;
        self.track.cy = cy / COORD_SCALE;
        self.track.w = w / COORD_SCALE;
        self.track.h = h / COORD_SCALE;
    }

    fn predicted_corners(&self) -> (f32, f32, f32, f32) {
        let [cx, cy, w, h] = self.kalman.predicted();
        corners(cx, cy, w, h)
    }

    fn matched_with(&mut self, det: &DetectionBox) {
        self.kalman.update(to_filter(det));
        self.track.conf = det.conf;
        self.track.tlost_cnt = 0;
        self.track.is_tracking = true;
        self.hit = true;
        self.publish();
    }

    fn miss(&mut self) {
        self.track.tlost_cnt += 1;
        self.publish();
    }
}

fn to_filter(det: &DetectionBox) -> [f32; 4] {
    [
        det.cx * COORD_SCALE,
        det.cy * COORD_SCALE,
        det.w * COORD_SCALE,
        det.h * COORD_SCALE,
    ]
}

/// `(cost, detection index, slot index)`
type Candidate = (f32, usize, usize);

/// ByteTrack 追踪器
pub struct ByteTracker {
    params: TrackerParams,
    slots: HVec<Slot, MAX_TRACKS>,
    tracks: HVec<Track, MAX_TRACKS>,
    candidates: HVec<Candidate, { MAX_TRACKS * MAX_DETECTIONS }>,
    next_id: u32,
    frame: u64,
}

impl Default for ByteTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteTracker {
    pub fn new() -> Self {
        Self {
            params: TrackerParams::default(),
            slots: HVec::new(),
            tracks: HVec::new(),
            candidates: HVec::new(),
            next_id: 1,
            frame: 0,
        }
    }

    /// Greedy IoU association of `dets` (indices into `detections`) against
    /// the slots not yet hit this frame, accepting costs up to `max_cost`.
    fn associate(
        &mut self,
        detections: &[DetectionBox],
        dets: &[usize],
        max_cost: f32,
        only_confirmed: bool,
        det_matched: &mut [bool; MAX_DETECTIONS],
    ) {
        self.candidates.clear();
        for &d in dets {
            let det = &detections[d];
            let det_corners = corners(det.cx, det.cy, det.w, det.h);
            for (s, slot) in self.slots.iter().enumerate() {
                if slot.hit || (only_confirmed && !slot.track.is_tracking) {
                    continue;
                }
                let (x1, y1, x2, y2) = slot.predicted_corners();
                let predicted = (
                    x1 / COORD_SCALE,
                    y1 / COORD_SCALE,
                    x2 / COORD_SCALE,
                    y2 / COORD_SCALE,
                );
                let cost = 1.0 - iou(det_corners, predicted);
                if cost <= max_cost {
                    // Capacity covers every (detection, slot) pair.
                    let _ = self.candidates.push((cost, d, s));
                }
            }
        }

        // 贪心匹配: 按代价排序
        self.candidates.sort_unstable_by(|a, b| a.0.total_cmp(&b.0));

        for i in 0..self.candidates.len() {
            let (_, d, s) = self.candidates[i];
            if det_matched[d] || self.slots[s].hit {
                continue;
            }
            det_matched[d] = true;
            self.slots[s].matched_with(&detections[d]);
        }
    }

    fn refresh_tracks(&mut self) {
        self.tracks.clear();
        for slot in &self.slots {
            let _ = self.tracks.push(slot.track);
        }
    }

    /// 获取跟踪统计信息
    pub fn stats(&self) -> String {
        format!(
            "tracks: {} live / {} slots | ids issued: {}",
            self.tracks.iter().filter(|t| t.is_visible()).count(),
            self.slots.len(),
            self.next_id - 1
        )
    }
}

impl Tracker for ByteTracker {
    fn init(&mut self, params: &TrackerParams) -> Result<()> {
        for (name, value) in [
            ("track_thresh", params.track_thresh),
            ("det_thresh", params.det_thresh),
            ("sim1_thresh", params.sim1_thresh),
            ("sim2_thresh", params.sim2_thresh),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(PipelineError::Tracker(format!("{name} = {value} outside [0, 1]")));
            }
        }
        if params.tlost_cnt == 0 {
            return Err(PipelineError::Tracker("tlost_cnt must be positive".into()));
        }
        self.params = params.clone();
        self.slots.clear();
        self.tracks.clear();
        self.next_id = 1;
        self.frame = 0;
        info!(
            "tracker init: track={} det={} sim1={} sim2={} lost={}",
            params.track_thresh,
            params.det_thresh,
            params.sim1_thresh,
            params.sim2_thresh,
            params.tlost_cnt
        );
        Ok(())
    }

    /// 更新跟踪 (ByteTrack 两轮匹配)
    fn update(&mut self, detections: &[DetectionBox]) -> Result<()> {
        let detections = &detections[..detections.len().min(MAX_DETECTIONS)];
        self.frame += 1;

        // 1. 所有轨迹先预测
        for slot in &mut self.slots {
            slot.kalman.predict();
            slot.hit = false;
        }

        // 2. 分离高低分检测框
        let mut high: HVec<usize, MAX_DETECTIONS> = HVec::new();
        let mut low: HVec<usize, MAX_DETECTIONS> = HVec::new();
        for (i, det) in detections.iter().enumerate() {
            if det.conf >= self.params.track_thresh {
                let _ = high.push(i);
            } else if det.conf >= LOW_SCORE_FLOOR {
                let _ = low.push(i);
            }
        }

        // 3. 第一轮匹配: 高分检测 + 所有轨迹
        let mut det_matched = [false; MAX_DETECTIONS];
        let sim1 = self.params.sim1_thresh;
        self.associate(detections, &high, sim1, false, &mut det_matched);

        // 4. 第二轮匹配: 低分检测 + 未匹配的已确认轨迹 (救援)
        let sim2 = self.params.sim2_thresh;
        self.associate(detections, &low, sim2, true, &mut det_matched);

        // 5. 未匹配的轨迹 → 标记丢失; unconfirmed ones are dropped at once
        let tlost_max = self.params.tlost_cnt;
        let mut i = 0;
        while i < self.slots.len() {
            let slot = &mut self.slots[i];
            if !slot.hit {
                if !slot.track.is_tracking {
                    self.slots.swap_remove(i);
                    continue;
                }
                slot.miss();
                if slot.track.tlost_cnt > tlost_max {
                    debug!("track {} lost", slot.track.id);
                    self.slots.swap_remove(i);
                    continue;
                }
            }
            i += 1;
        }

        // 6. 未匹配的高分检测 → 新建轨迹
        let confirm_immediately = self.frame == 1;
        for &d in &high {
            let det = &detections[d];
            if det_matched[d] || det.conf < self.params.det_thresh {
                continue;
            }
            let slot = Slot::new(self.next_id, det, confirm_immediately);
            if self.slots.push(slot).is_err() {
                debug!("tracker full, detection {d} not tracked");
                break;
            }
            self.next_id += 1;
        }

        self.refresh_tracks();
        debug!("bytetrack frame {}: {}", self.frame, self.stats());
        Ok(())
    }

    fn tracks(&self) -> &[Track] {
        &self.tracks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dbox(cx: f32, cy: f32, conf: f32) -> DetectionBox {
        DetectionBox {
            cx,
            cy,
            w: 0.1,
            h: 0.2,
            conf,
        }
    }

    fn tracker(tlost_cnt: u32) -> ByteTracker {
        let mut t = ByteTracker::new();
        t.init(&TrackerParams {
            tlost_cnt,
            ..TrackerParams::default()
        })
        .unwrap();
        t
    }

    fn visible(t: &ByteTracker) -> Vec<Track> {
        t.tracks().iter().copied().filter(Track::is_visible).collect()
    }

    #[test]
    fn first_frame_detections_are_confirmed() {
        let mut t = tracker(30);
        t.update(&[dbox(0.2, 0.5, 0.9), dbox(0.5, 0.5, 0.85), dbox(0.8, 0.5, 0.95)])
            .unwrap();
        let v = visible(&t);
        assert_eq!(v.len(), 3);
        let mut ids: Vec<u32> = v.iter().map(|t| t.id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!((v[0].cx - 0.2).abs() < 1e-3);
    }

    #[test]
    fn stats_count_live_tracks_and_issued_ids() {
        let mut t = tracker(30);
        t.update(&[dbox(0.2, 0.5, 0.9), dbox(0.8, 0.5, 0.9)]).unwrap();
        assert_eq!(t.stats(), "tracks: 2 live / 2 slots | ids issued: 2");
    }

    #[test]
    fn moving_object_keeps_its_id() {
        let mut t = tracker(30);
        for frame in 0..20 {
            let cx = 0.3 + frame as f32 * 0.005;
            t.update(&[dbox(cx, 0.5, 0.9)]).unwrap();
            let v = visible(&t);
            assert_eq!(v.len(), 1, "frame {frame}");
            assert_eq!(v[0].id, 1);
        }
    }

    #[test]
    fn unmatched_track_goes_stale_then_expires() {
        let mut t = tracker(3);
        t.update(&[dbox(0.5, 0.5, 0.9)]).unwrap();
        for lost in 1..=3 {
            t.update(&[]).unwrap();
            assert_eq!(t.tracks().len(), 1);
            assert_eq!(t.tracks()[0].tlost_cnt, lost);
            assert!(visible(&t).is_empty());
        }
        t.update(&[]).unwrap();
        assert!(t.tracks().is_empty());
    }

    #[test]
    fn low_score_detection_rescues_track() {
        let mut t = tracker(30);
        t.update(&[dbox(0.5, 0.5, 0.9)]).unwrap();
        t.update(&[]).unwrap();
        t.update(&[dbox(0.5, 0.5, 0.2)]).unwrap();
        let v = visible(&t);
        assert_eq!(v.len(), 1);
        assert_eq!(v[0].id, 1);
        assert_eq!(v[0].conf, 0.2);
    }

    #[test]
    fn later_tracks_need_a_second_hit() {
        let mut t = tracker(30);
        t.update(&[]).unwrap();
        t.update(&[dbox(0.4, 0.4, 0.9)]).unwrap();
        assert_eq!(t.tracks().len(), 1);
        assert!(visible(&t).is_empty());
        t.update(&[dbox(0.4, 0.4, 0.9)]).unwrap();
        assert_eq!(visible(&t).len(), 1);

        // A tentative track that misses once is discarded.
        t.update(&[dbox(0.4, 0.4, 0.9), dbox(0.9, 0.1, 0.9)]).unwrap();
        t.update(&[dbox(0.4, 0.4, 0.9)]).unwrap();
        assert_eq!(t.tracks().len(), 1);
    }

    #[test]
    fn weak_detection_does_not_start_a_track() {
        let mut t = tracker(30);
        t.update(&[dbox(0.5, 0.5, 0.5)]).unwrap();
        assert!(t.tracks().is_empty());
    }

    #[test]
    fn init_validates_and_resets() {
        let mut t = tracker(30);
        t.update(&[dbox(0.5, 0.5, 0.9)]).unwrap();
        let bad = TrackerParams {
            sim1_thresh: 2.0,
            ..TrackerParams::default()
        };
        assert!(matches!(t.init(&bad), Err(PipelineError::Tracker(_))));
        t.init(&TrackerParams::default()).unwrap();
        assert!(t.tracks().is_empty());
        t.update(&[dbox(0.1, 0.1, 0.9)]).unwrap();
        assert_eq!(t.tracks()[0].id, 1);
    }

    #[test]
    fn no_tracker_reports_nothing() {
        let mut t = select(false);
        assert!(!t.is_enabled());
        t.update(&[dbox(0.5, 0.5, 0.9)]).unwrap();
        assert!(t.tracks().is_empty());
    }
}
