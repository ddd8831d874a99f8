/// 数字卫兵 (Digital Sentinel)
///
/// 实时检测流水线, 运行于仿真硬件:
/// 1. 摄像头中断: 预览帧轮转 + 推理帧入队
/// 2. NN任务:     加速器推理
/// 3. PP任务:     检测解码 + 目标跟踪
/// 4. DP任务:     叠加层渲染
use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use sentinel_rt::hal::sim::SimRig;
use sentinel_rt::{logging, pipeline, Args, PipelineConfig};

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init(&args.log_level);

    let mut config = PipelineConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    config.apply_args(&args);
    config.validate().context("checking configuration")?;
    config.log_summary();

    let rig = SimRig::new(&config);
    let hardware = rig.hardware(&config).context("building sim hardware")?;
    let pipeline = pipeline::run(config, hardware).context("starting pipeline")?;
    let _camera = rig
        .camera
        .spawn(pipeline.events())
        .context("starting camera")?;

    info!("🚀 数字卫兵 running with {} tasks", pipeline.task_count());

    match args.run_for {
        Some(secs) => {
            thread::sleep(Duration::from_secs(secs));
            rig.camera.stop();
            let stats = pipeline.context().stats.read();
            info!(
                "done: {} frames shown, {} inferences ({} dropped), {} overlays",
                stats.display_frames, stats.inferences, stats.nn_dropped, stats.renders
            );
        }
        None => loop {
            thread::park();
        },
    }
    Ok(())
}
