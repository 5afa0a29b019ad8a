use clap::Parser;
use eyed_common::{shutdown_handler::ShutdownHandler, tracing::initialize_tracing};
use eyed_capture::config::{CaptureConfig, Opt, SourceKind};
use eyed_capture::supervisor;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let opt = Opt::parse();
    let cfg = CaptureConfig::load(&opt.config);
    initialize_tracing(&cfg.device.log_level)?;

    tracing::info!("EyeD capture device starting");
    tracing::info!("  device_id:  {}", cfg.device.id);
    tracing::info!("  gateway:    {}", cfg.gateway.address);
    tracing::info!("  source:     {:?}", cfg.camera.source);
    match cfg.camera.source {
        SourceKind::Directory => {
            tracing::info!("  image_dir:  {}", cfg.camera.image_dir.display())
        }
        SourceKind::Webcam => tracing::info!("  device:     {}", cfg.camera.device),
    }
    tracing::info!("  quality:    {:.2}", cfg.quality.threshold);
    tracing::info!("  fps:        {}", cfg.camera.frame_rate_fps);

    let shutdown = ShutdownHandler::new(5);
    shutdown.register_signal_handler().await;

    if let Err(e) = supervisor::run(cfg, shutdown).await {
        tracing::error!("Startup failed: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}
