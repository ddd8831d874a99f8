pub mod cache; // 数据缓存维护
pub mod config; // 配置参数
pub mod cpuload; // CPU负载统计
pub mod detection; // 检测后处理 + 跟踪
pub mod dma; // DMA缓冲区
pub mod error;
pub mod hal; // 硬件接口 + 仿真
pub mod logging;
pub mod model; // 网络张量描述
pub mod pipeline; // 实时流水线
pub mod sync; // 中断/信号量/缓冲队列
pub mod telemetry; // 共享遥测

pub use crate::config::{Args, PipelineConfig};
pub use crate::error::{PipelineError, Result};
pub use crate::pipeline::{init, run, Hardware, Pipeline, PipelineContext, Stages};
