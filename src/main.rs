use anyhow::{Context, Result};
use clap::Parser;
use gstreamer as gst;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use rpi_mjpeg_streamer::probe::{probe, PROBE_FRAMES};
use rpi_mjpeg_streamer::{
    router, run_server, AppState, CameraSession, CaptureBackendKind, Config, MjpegStreamer,
    SystemBackends,
};

#[derive(Parser, Debug)]
#[command(name = "mjpeg-streamer")]
#[command(author, version, about = "MJPEG camera streaming server", long_about = None)]
struct CliArgs {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Camera backend opened at startup: opencv or libcamera
    #[arg(long, env = "CAMERA_SOURCE")]
    source: Option<CaptureBackendKind>,

    /// V4L2 device index used by the opencv backend
    #[arg(long, env = "OPENCV_DEVICE")]
    opencv_device: Option<usize>,

    /// Device reported for the libcamera backend
    #[arg(long, env = "LIBCAMERA_DEVICE")]
    libcamera_device: Option<String>,

    /// Address to bind the HTTP server to
    #[arg(long)]
    bind_ip: Option<String>,

    /// HTTP port
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Read a few frames from the camera, report and exit
    #[arg(long)]
    probe: bool,
}

fn build_config(args: &CliArgs) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::default(),
    };

    if let Some(source) = args.source {
        config.camera.source = source;
    }
    if let Some(device) = args.opencv_device {
        config.override_opencv_device(device);
    }
    if let Some(device) = &args.libcamera_device {
        config.camera.libcamera_device = device.clone();
    }
    if let Some(bind_ip) = &args.bind_ip {
        config.server.bind_ip = bind_ip.clone();
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    config.validate()?;
    Ok(config)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    // Setup logging
    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    fmt().with_env_filter(filter).with_target(false).init();

    let config = build_config(&args)?;
    info!(
        source = %config.camera.source,
        opencv_device = %config.opencv_device_label(),
        libcamera_device = %config.camera.libcamera_device,
        "Configuration loaded"
    );

    // Initialize GStreamer once globally; without it only the V4L2 backend works
    if let Err(e) = gst::init() {
        warn!(error = %e, "GStreamer unavailable, libcamera backend disabled");
    }

    let capture_config = config.capture_config();

    if args.probe {
        let kind = tokio::task::spawn_blocking(move || {
            probe(&SystemBackends, &capture_config, PROBE_FRAMES)
        })
        .await?
        .context("No camera backend is working")?;
        info!(backend = %kind, "Camera probe completed successfully");
        return Ok(());
    }

    let session = Arc::new(CameraSession::new(capture_config, Arc::new(SystemBackends)));
    let init_session = Arc::clone(&session);
    match tokio::task::spawn_blocking(move || init_session.initialize()).await? {
        Some(kind) => info!(backend = %kind, "Camera ready"),
        None => warn!("No camera available, streams will stay empty until a switch succeeds"),
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutting down");
        let _ = shutdown_tx.send(true);
    });

    let streamer = Arc::new(MjpegStreamer::new(
        Arc::clone(&session),
        config.stream_settings(),
        shutdown_rx.clone(),
    ));
    let config = Arc::new(config);
    let app = router(AppState::new(
        Arc::clone(&config),
        Arc::clone(&session),
        streamer,
    ));

    let mut server_shutdown = shutdown_rx;
    let result = run_server(&config.bind_addr(), app, async move {
        let _ = server_shutdown.wait_for(|stop| *stop).await;
    })
    .await;

    let release_session = Arc::clone(&session);
    tokio::task::spawn_blocking(move || release_session.release()).await?;

    result
}
