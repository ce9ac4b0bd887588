//! Crate-wide error types.

/// Errors from the video acquisition stage.
///
/// Only a permanent decoder-open failure is surfaced this way; transient
/// read gaps are logged and retried inside the acquisition task.
#[derive(Debug, thiserror::Error)]
pub enum VideoError {
    #[error("failed to open RTSP source: {0}")]
    OpenFailed(String),

    #[error("RTSP support not compiled in (enable the `rtsp` feature)")]
    FeatureDisabled,
}

/// Errors from the VISCA transport.
#[derive(Debug, thiserror::Error)]
pub enum ViscaError {
    #[error("failed to bind UDP socket: {0}")]
    BindFailed(String),

    #[error("failed to connect to camera: {0}")]
    ConnectFailed(String),

    #[error("failed to send VISCA packet: {0}")]
    SendFailed(String),
}

/// Fatal error state for the control loop (spec.md §7 "Fatal").
///
/// Anything else inside the loop body (transient VISCA send errors,
/// tracker failures, video read gaps) is non-fatal and handled in place.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error(transparent)]
    Video(#[from] VideoError),

    #[error(transparent)]
    Visca(#[from] ViscaError),

    #[error("fatal control loop error: {0}")]
    Fatal(String),
}
