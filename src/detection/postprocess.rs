//! 后处理 (Post-process)
//! Turn raw accelerator output tensors into a bounded list of detections.

use tracing::trace;

use super::types::{copy_bounded, Detection, DetectionList};
use crate::config::PostprocessParams;
use crate::error::{PipelineError, Result};

/// Detection decoding over the accelerator's output tensors.
pub trait Postprocessor: Send {
    /// `outputs` are the output tensors in descriptor order. On return `out`
    /// holds the kept detections sorted by confidence.
    fn run(&mut self, outputs: &[&[u8]], out: &mut DetectionList) -> Result<()>;
}

/// Rows of little-endian `f32`: `cx, cy, w, h, objectness, class scores...`
/// across every output tensor, followed by thresholding and NMS.
pub struct GridDecoder {
    params: PostprocessParams,
    row_len: usize,
    /// Scratch reused across frames; grows only while warming up.
    candidates: Vec<Detection>,
}

const BOX_FIELDS: usize = 5;
const MAX_CANDIDATES: usize = 256;

impl GridDecoder {
    pub fn new(params: PostprocessParams) -> Result<Self> {
        if params.num_classes == 0 {
            return Err(PipelineError::config("num_classes must be at least 1"));
        }
        Ok(Self {
            row_len: (BOX_FIELDS + params.num_classes) * 4,
            params,
            candidates: Vec::with_capacity(MAX_CANDIDATES),
        })
    }

    /// Size in bytes of one encoded row.
    pub fn row_len(&self) -> usize {
        self.row_len
    }

    fn decode_row(&self, row: &[u8]) -> Option<Detection> {
        let field = |i: usize| {
            let b = &row[i * 4..i * 4 + 4];
            f32::from_le_bytes([b[0], b[1], b[2], b[3]])
        };
        let objectness = field(4);
        if objectness <= 0.0 {
            return None;
        }
        let (class_index, class_score) = (0..self.params.num_classes)
            .map(|c| (c, field(BOX_FIELDS + c)))
            .max_by(|a, b| a.1.total_cmp(&b.1))?;
        let conf = objectness * class_score;
        if !(conf > 0.0 && conf >= self.params.conf_threshold) {
            return None;
        }
        Some(Detection {
            x_center: field(0),
            y_center: field(1),
            width: field(2),
            height: field(3),
            conf,
            class_index: class_index as u32,
        })
    }
}

impl Postprocessor for GridDecoder {
    fn run(&mut self, outputs: &[&[u8]], out: &mut DetectionList) -> Result<()> {
        self.candidates.clear();
        for tensor in outputs {
            for row in tensor.chunks_exact(self.row_len) {
                if self.candidates.len() == MAX_CANDIDATES {
                    break;
                }
                if let Some(det) = self.decode_row(row) {
                    self.candidates.push(det);
                }
            }
        }
        non_max_suppression(&mut self.candidates, self.params.iou_threshold);
        let dropped = copy_bounded(&self.candidates, out);
        if dropped > 0 {
            trace!("postprocess: {dropped} detections over the display limit");
        }
        Ok(())
    }
}

/// Greedy NMS: highest confidence first, drop anything overlapping a kept box
/// by more than `iou_threshold`.
pub fn non_max_suppression(xs: &mut Vec<Detection>, iou_threshold: f32) {
    xs.sort_by(|b1, b2| b2.conf.total_cmp(&b1.conf));

    let mut current_index = 0;
    for index in 0..xs.len() {
        let mut drop = false;
        for prev_index in 0..current_index {
            let iou = xs[prev_index].iou(&xs[index]);
            if iou > iou_threshold {
                drop = true;
                break;
            }
        }
        if !drop {
            xs.swap(current_index, index);
            current_index += 1;
        }
    }
    xs.truncate(current_index);
}

/// Encode one row in the layout [`GridDecoder`] reads. Used by the simulated
/// accelerator and by tests.
pub fn encode_row(dst: &mut [u8], cx: f32, cy: f32, w: f32, h: f32, objectness: f32, scores: &[f32]) {
    let fields = [cx, cy, w, h, objectness];
    for (i, v) in fields.iter().chain(scores.iter()).enumerate() {
        if let Some(slot) = dst.get_mut(i * 4..i * 4 + 4) {
            slot.copy_from_slice(&v.to_le_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::types::MAX_DETECTIONS;

    fn params(num_classes: usize) -> PostprocessParams {
        PostprocessParams {
            conf_threshold: 0.5,
            iou_threshold: 0.5,
            num_classes,
            class_names: Vec::new(),
        }
    }

    #[test]
    fn decodes_rows_above_threshold() {
        let mut pp = GridDecoder::new(params(2)).unwrap();
        let row = pp.row_len();
        let mut tensor = vec![0u8; row * 4];
        encode_row(&mut tensor[..row], 0.2, 0.3, 0.1, 0.1, 0.9, &[0.1, 0.8]);
        encode_row(&mut tensor[row..2 * row], 0.7, 0.7, 0.1, 0.1, 0.6, &[0.9, 0.1]);
        // Too weak: 0.9 * 0.4 < 0.5
        encode_row(&mut tensor[2 * row..3 * row], 0.5, 0.5, 0.1, 0.1, 0.9, &[0.4, 0.0]);

        let mut out = DetectionList::new();
        pp.run(&[&tensor[..]], &mut out).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].class_index, 1);
        assert!((out[0].conf - 0.72).abs() < 1e-6);
        assert_eq!(out[0].x_center, 0.2);
        assert_eq!(out[1].class_index, 0);
        assert_eq!(out[1].x_center, 0.7);
    }

    #[test]
    fn zero_tensors_yield_nothing() {
        let mut pp = GridDecoder::new(params(1)).unwrap();
        let zeros = vec![0u8; 16_200];
        let mut out = DetectionList::new();
        out.push(Detection::default()).unwrap();
        pp.run(&[&zeros[..], &zeros[..]], &mut out).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn nms_keeps_strongest_of_overlapping() {
        let mk = |cx: f32, conf: f32| Detection {
            x_center: cx,
            y_center: 0.5,
            width: 0.2,
            height: 0.2,
            conf,
            class_index: 0,
        };
        let mut xs = vec![mk(0.50, 0.7), mk(0.51, 0.9), mk(0.9, 0.6)];
        non_max_suppression(&mut xs, 0.5);
        assert_eq!(xs.len(), 2);
        assert_eq!(xs[0].conf, 0.9);
        assert_eq!(xs[1].x_center, 0.9);
    }

    #[test]
    fn output_is_truncated_to_limit() {
        let mut pp = GridDecoder::new(params(1)).unwrap();
        let row = pp.row_len();
        let n = MAX_DETECTIONS + 5;
        let mut tensor = vec![0u8; row * n];
        for i in 0..n {
            let cx = 0.03 + i as f32 * 0.06;
            encode_row(&mut tensor[i * row..(i + 1) * row], cx, 0.5, 0.02, 0.02, 0.9, &[0.9]);
        }
        let mut out = DetectionList::new();
        pp.run(&[&tensor[..]], &mut out).unwrap();
        assert_eq!(out.len(), MAX_DETECTIONS);
    }
}
