//! Network descriptor and the output sub-buffer layout derived from it.

use heapless::Vec as HVec;

use crate::dma::{align_up, DmaBuffer, DMA_ALIGN};
use crate::error::{PipelineError, Result};

/// Build-time limit on accelerator output tensors.
pub const MAX_NN_OUTPUTS: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TensorInfo {
    pub name: &'static str,
    pub size_bytes: usize,
    /// Required start alignment of the tensor's buffer, a power of two.
    pub alignment: usize,
}

impl TensorInfo {
    pub const fn new(name: &'static str, size_bytes: usize, alignment: usize) -> Self {
        Self {
            name,
            size_bytes,
            alignment,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ModelDescriptor {
    pub name: &'static str,
    pub input: TensorInfo,
    pub outputs: HVec<TensorInfo, MAX_NN_OUTPUTS>,
}

impl ModelDescriptor {
    pub fn new(name: &'static str, input: TensorInfo, outputs: &[TensorInfo]) -> Result<Self> {
        let outputs = HVec::from_slice(outputs).map_err(|_| {
            PipelineError::contract(format!(
                "{name}: {} outputs exceed the limit of {MAX_NN_OUTPUTS}",
                outputs.len()
            ))
        })?;
        Ok(Self {
            name,
            input,
            outputs,
        })
    }

    /// Output count and every tensor length must agree with `other`.
    pub fn check_outputs(&self, other: &ModelDescriptor) -> Result<()> {
        if self.outputs.len() != other.outputs.len() {
            return Err(PipelineError::contract(format!(
                "{}: runtime reports {} outputs, expected {}",
                self.name,
                other.outputs.len(),
                self.outputs.len()
            )));
        }
        for (i, (want, got)) in self.outputs.iter().zip(other.outputs.iter()).enumerate() {
            if want.size_bytes != got.size_bytes {
                return Err(PipelineError::contract(format!(
                    "{}: output {i} is {} bytes, expected {}",
                    self.name, got.size_bytes, want.size_bytes
                )));
            }
        }
        Ok(())
    }

    /// The whole runtime contract: outputs plus the input tensor length.
    pub fn check_runtime(&self, runtime: &ModelDescriptor) -> Result<()> {
        self.check_outputs(runtime)?;
        if runtime.input.size_bytes != self.input.size_bytes {
            return Err(PipelineError::contract(format!(
                "{}: runtime input is {} bytes, expected {}",
                self.name, runtime.input.size_bytes, self.input.size_bytes
            )));
        }
        Ok(())
    }
}

/// Built-in descriptor selected by name.
pub fn by_name(name: &str) -> Result<ModelDescriptor> {
    match name {
        "st_yolox_nano_480" => Ok(st_yolox_nano_480()),
        other => Err(PipelineError::config(format!("unknown model `{other}`"))),
    }
}

/// 480x480 single-class YOLOX nano: one input image, three detection heads.
pub fn st_yolox_nano_480() -> ModelDescriptor {
    ModelDescriptor {
        name: "st_yolox_nano_480",
        input: TensorInfo::new("input_0", 480 * 480 * 3, 32),
        outputs: HVec::from_slice(&[
            TensorInfo::new("output_0", 16_200, 32),
            TensorInfo::new("output_1", 259_200, 32),
            TensorInfo::new("output_2", 64_800, 32),
        ])
        .unwrap_or_default(),
    }
}

/// Byte offsets of each output tensor inside one contiguous output buffer.
#[derive(Clone, Debug, PartialEq)]
pub struct OutputLayout {
    offsets: HVec<usize, MAX_NN_OUTPUTS>,
    lengths: HVec<usize, MAX_NN_OUTPUTS>,
    total: usize,
}

impl OutputLayout {
    pub fn new(descriptor: &ModelDescriptor) -> Result<Self> {
        if descriptor.outputs.is_empty() {
            return Err(PipelineError::contract(format!(
                "{}: model has no outputs",
                descriptor.name
            )));
        }
        let mut offsets = HVec::new();
        let mut lengths = HVec::new();
        let mut offset = 0;
        for tensor in &descriptor.outputs {
            let align = tensor.alignment;
            // Alignment is relative to the buffer start, which is DMA_ALIGN aligned.
            if !align.is_power_of_two() || align > DMA_ALIGN {
                return Err(PipelineError::contract(format!(
                    "{}: unsupported alignment {align}",
                    tensor.name
                )));
            }
            if tensor.size_bytes == 0 {
                return Err(PipelineError::contract(format!("{}: empty tensor", tensor.name)));
            }
            if offset % align != 0 {
                return Err(PipelineError::contract(format!(
                    "{}: offset {offset} breaks {align}-byte alignment",
                    tensor.name
                )));
            }
            // Capacity equals the descriptor's, so these cannot overflow.
            let _ = offsets.push(offset);
            let _ = lengths.push(tensor.size_bytes);
            offset += align_up(tensor.size_bytes, align);
        }
        Ok(Self {
            offsets,
            lengths,
            total: align_up(offset, DMA_ALIGN),
        })
    }

    /// Size of one whole output buffer.
    pub fn total_len(&self) -> usize {
        self.total
    }

    pub fn count(&self) -> usize {
        self.offsets.len()
    }

    pub fn offset(&self, index: usize) -> Option<usize> {
        self.offsets.get(index).copied()
    }

    /// Carve `buffer` into per-tensor sub-buffers.
    pub fn split(&self, buffer: DmaBuffer) -> Result<HVec<DmaBuffer, MAX_NN_OUTPUTS>> {
        if buffer.len() < self.total {
            return Err(PipelineError::contract(format!(
                "output buffer of {} bytes is smaller than layout {}",
                buffer.len(),
                self.total
            )));
        }
        let mut parts = HVec::new();
        for (&offset, &len) in self.offsets.iter().zip(self.lengths.iter()) {
            let part = buffer
                .slice(offset, len)
                .ok_or_else(|| PipelineError::contract("sub-buffer outside output buffer"))?;
            let _ = parts.push(part);
        }
        Ok(parts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::DmaPool;

    #[test]
    fn yolox_layout_is_contiguous() {
        let layout = OutputLayout::new(&st_yolox_nano_480()).unwrap();
        assert_eq!(layout.count(), 3);
        assert_eq!(layout.offset(0), Some(0));
        // 16200 rounds up to 16224 before the second head.
        assert_eq!(layout.offset(1), Some(16_224));
        assert_eq!(layout.offset(2), Some(16_224 + 259_200));
        assert_eq!(layout.total_len(), 16_224 + 259_200 + 64_800);
    }

    #[test]
    fn mixed_alignments() {
        let desc = ModelDescriptor::new(
            "mixed",
            TensorInfo::new("in", 16, 32),
            &[
                TensorInfo::new("a", 3, 4),
                TensorInfo::new("b", 10, 4),
                TensorInfo::new("c", 1, 16),
            ],
        )
        .unwrap();
        let layout = OutputLayout::new(&desc).unwrap();
        assert_eq!(layout.offset(1), Some(4));
        assert_eq!(layout.offset(2), Some(16));
        assert_eq!(layout.total_len(), 32);

        let skewed = ModelDescriptor::new(
            "skewed",
            TensorInfo::new("in", 16, 32),
            &[TensorInfo::new("a", 4, 4), TensorInfo::new("b", 4, 16)],
        )
        .unwrap();
        assert!(OutputLayout::new(&skewed).is_err());
    }

    #[test]
    fn rejects_bad_alignment_and_too_many_outputs() {
        let desc = ModelDescriptor::new(
            "odd",
            TensorInfo::new("in", 16, 32),
            &[TensorInfo::new("a", 8, 3)],
        )
        .unwrap();
        assert!(OutputLayout::new(&desc).is_err());

        let five = [TensorInfo::new("t", 8, 8); 5];
        assert!(matches!(
            ModelDescriptor::new("wide", TensorInfo::new("in", 16, 32), &five),
            Err(PipelineError::Contract(_))
        ));
    }

    #[test]
    fn output_mismatch_is_detected() {
        let expected = st_yolox_nano_480();
        let mut reported = expected.clone();
        expected.check_outputs(&reported).unwrap();
        reported.outputs[1].size_bytes += 1;
        assert!(expected.check_outputs(&reported).is_err());
        reported.outputs.pop();
        assert!(expected.check_outputs(&reported).is_err());

        let mut wide_input = expected.clone();
        wide_input.input.size_bytes *= 2;
        expected.check_outputs(&wide_input).unwrap();
        assert!(matches!(
            expected.check_runtime(&wide_input),
            Err(PipelineError::Contract(_))
        ));
    }

    #[test]
    fn lookup_by_name() {
        assert_eq!(by_name("st_yolox_nano_480").unwrap(), st_yolox_nano_480());
        assert!(matches!(by_name("yolov8n"), Err(PipelineError::Config(_))));
    }

    #[test]
    fn split_produces_aligned_sub_buffers() {
        let layout = OutputLayout::new(&st_yolox_nano_480()).unwrap();
        let pool = DmaPool::new("out", 1, layout.total_len()).unwrap();
        let parts = layout.split(pool.get(0).unwrap()).unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[2].len(), 64_800);
        assert!(parts.iter().all(|p| p.is_aligned(32)));

        let small = DmaPool::new("small", 1, 64).unwrap();
        assert!(layout.split(small.get(0).unwrap()).is_err());
    }
}
