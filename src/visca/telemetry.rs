//! The Telemetry Snapshot (spec.md §3, §6): atomic, replace-only, last-known
//! VISCA-reported values, or "unknown" until first successful inquiry.

/// Last-known camera pose, or `None` until the first successful inquiry of
/// that axis has been received.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub pan_raw: Option<i16>,
    pub tilt_raw: Option<i16>,
    pub zoom_raw: Option<u16>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }
}
