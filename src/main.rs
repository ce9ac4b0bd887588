//! Standalone (non-GUI) runner: wires the three collaborating tasks
//! (acquisition, VISCA listener, control loop) together over stdio/log
//! output only (SPEC_FULL.md §0). No HTTP/GUI/recording/OSD adapter lives
//! here — those are the excluded external collaborators named in spec.md §1.

use std::env;
use std::sync::Arc;

use ptzcam_core::control::ControlLoop;
use ptzcam_core::tracker::CorrelationTracker;
use ptzcam_core::video::VideoSource;
use ptzcam_core::visca::{Transport, DEFAULT_PORT};
use ptzcam_core::TrackingConfig;

#[cfg(feature = "rtsp")]
use ptzcam_core::video::{FrameDecoder, RetinaDecoder};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let mut args = env::args().skip(1);
    let camera_host = args.next().unwrap_or_else(|| "127.0.0.1".to_string());
    let rtsp_url = args.next().unwrap_or_else(|| format!("rtsp://{camera_host}/stream"));

    let config = TrackingConfig::default();

    let transport = Arc::new(Transport::connect(&camera_host, DEFAULT_PORT).await?);
    log::info!("connected VISCA transport to {camera_host}:{DEFAULT_PORT}");

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let listener_transport = transport.clone();
    let inquiry_interval = std::time::Duration::from_secs_f64(config.inquiry_interval);
    let recv_timeout = std::time::Duration::from_secs_f64(config.visca_recv_timeout);
    let listener_shutdown = shutdown_rx.clone();
    let listener_task = tokio::spawn(async move {
        listener_transport.run_listener(inquiry_interval, recv_timeout, listener_shutdown).await;
    });

    let video = open_video_source(&rtsp_url).await?;

    let tracker = Box::new(CorrelationTracker::new(8.0, 0.5));
    let mut control = ControlLoop::new(video, transport.clone(), tracker, config);

    let control_shutdown = shutdown_rx.clone();
    let control_task = tokio::spawn(async move {
        if let Err(e) = control.run(control_shutdown).await {
            log::error!("control loop exited fatally: {e}");
        }
    });

    tokio::signal::ctrl_c().await?;
    log::info!("shutdown requested, stopping tasks");
    let _ = shutdown_tx.send(true);

    let _ = tokio::time::timeout(std::time::Duration::from_secs(1), control_task).await;
    let _ = tokio::time::timeout(std::time::Duration::from_secs(1), listener_task).await;

    Ok(())
}

#[cfg(feature = "rtsp")]
async fn open_video_source(rtsp_url: &str) -> Result<VideoSource, Box<dyn std::error::Error>> {
    let decoder = RetinaDecoder::open(rtsp_url).await?;
    Ok(VideoSource::spawn(decoder))
}

#[cfg(not(feature = "rtsp"))]
async fn open_video_source(_rtsp_url: &str) -> Result<VideoSource, Box<dyn std::error::Error>> {
    Err("no video decoder compiled in; rebuild with --features rtsp".into())
}
