//! VISCA-over-UDP transport (spec.md §4.B, §5). Grounded on the teacher's
//! `visca/client.rs` (`Mutex<Option<UdpSocket>>`, `ensure_connected`,
//! sequence counter) for the connect/send shape; the interleaved
//! inquiry-injection + short-timeout drain loop is grounded on
//! `original_source/visca_control.py`'s `_listen_loop`/`_process_packet`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex};

use crate::error::ViscaError;

use super::frame::{self, InquiryResponse, PanDir, TiltDir, ZoomCommand};
use super::telemetry::Snapshot;

/// Default VISCA-over-UDP port (spec.md §6).
pub const DEFAULT_PORT: u16 = 1259;

/// Speaks VISCA over UDP to a single camera endpoint.
///
/// The socket is shared by the send path (drive commands from the control
/// task) and the listener task's periodic inquiries, serialized by a
/// mutex — matches spec.md §5 "UDP socket — multi-writer ... single-reader
/// ... serialized by mutex."
pub struct Transport {
    socket: Mutex<UdpSocket>,
    sequence: AtomicU32,
    telemetry: StdMutex<Snapshot>,
}

impl Transport {
    /// Bind a local socket and connect it to the camera endpoint.
    pub async fn connect(host: &str, port: u16) -> Result<Self, ViscaError> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| ViscaError::BindFailed(e.to_string()))?;
        socket
            .connect((host, port))
            .await
            .map_err(|e| ViscaError::ConnectFailed(e.to_string()))?;
        Ok(Self {
            socket: Mutex::new(socket),
            sequence: AtomicU32::new(1),
            telemetry: StdMutex::new(Snapshot::new()),
        })
    }

    fn next_sequence(&self) -> u32 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }

    async fn send(&self, payload: &[u8]) -> Result<(), ViscaError> {
        // Sequence numbering is maintained but not used for response
        // matching (spec.md §9 "Bit-exact framing").
        let _seq = self.next_sequence();
        let socket = self.socket.lock().await;
        socket
            .send(payload)
            .await
            .map_err(|e| ViscaError::SendFailed(e.to_string()))?;
        Ok(())
    }

    pub async fn send_drive(
        &self,
        pan_speed: u8,
        pan_dir: PanDir,
        tilt_speed: u8,
        tilt_dir: TiltDir,
    ) -> Result<(), ViscaError> {
        self.send(&frame::pan_tilt_drive(pan_speed, tilt_speed, pan_dir, tilt_dir))
            .await
    }

    pub async fn send_stop(&self) -> Result<(), ViscaError> {
        self.send(&frame::pan_tilt_stop()).await
    }

    pub async fn send_zoom(&self, cmd: ZoomCommand) -> Result<(), ViscaError> {
        self.send(&frame::zoom_drive(cmd)).await
    }

    async fn send_inquiries(&self) {
        // Failure to send is logged and ignored — the next tick retries
        // (spec.md §4.B).
        if let Err(e) = self.send(&frame::zoom_inquiry()).await {
            log::warn!("VISCA zoom inquiry send failed: {e}");
        }
        if let Err(e) = self.send(&frame::pan_tilt_inquiry()).await {
            log::warn!("VISCA pan/tilt inquiry send failed: {e}");
        }
    }

    /// Current telemetry snapshot (spec.md §3).
    pub fn telemetry(&self) -> Snapshot {
        *self.telemetry.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn apply_response(&self, bytes: &[u8]) {
        match frame::classify_response(bytes) {
            InquiryResponse::Zoom(z) => {
                let mut snap = self.telemetry.lock().unwrap_or_else(|e| e.into_inner());
                snap.zoom_raw = Some(z);
            }
            InquiryResponse::PanTilt { pan, tilt } => {
                let mut snap = self.telemetry.lock().unwrap_or_else(|e| e.into_inner());
                snap.pan_raw = Some(pan);
                snap.tilt_raw = Some(tilt);
            }
            InquiryResponse::Unknown => {
                log::debug!("discarded malformed/unrecognized VISCA packet ({} bytes)", bytes.len());
            }
        }
    }

    /// Background task: alternates periodic inquiry injection with a
    /// continuous short-timeout drain of inbound packets (spec.md §4.B).
    /// Runs until `shutdown` reports `true`.
    pub async fn run_listener(
        &self,
        inquiry_interval: Duration,
        recv_timeout: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut last_query = tokio::time::Instant::now() - inquiry_interval;
        let mut buf = [0u8; 1024];
        loop {
            if *shutdown.borrow() {
                return;
            }

            if last_query.elapsed() >= inquiry_interval {
                self.send_inquiries().await;
                last_query = tokio::time::Instant::now();
            }

            let socket = self.socket.lock().await;
            match tokio::time::timeout(recv_timeout, socket.recv(&mut buf)).await {
                Ok(Ok(len)) => {
                    drop(socket);
                    self.apply_response(&buf[..len]);
                }
                Ok(Err(e)) => {
                    drop(socket);
                    log::warn!("VISCA recv error: {e}");
                }
                Err(_timeout) => {
                    // Normal — yields regularly so sends can proceed.
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// An unconnected socket standing in for the camera, so it can receive
    /// from the transport's arbitrary ephemeral source port.
    async fn fake_camera() -> UdpSocket {
        UdpSocket::bind("127.0.0.1:0").await.unwrap()
    }

    #[tokio::test]
    async fn connect_binds_and_connects() {
        let camera = fake_camera().await;
        let addr = camera.local_addr().unwrap();
        let transport = Transport::connect(&addr.ip().to_string(), addr.port())
            .await
            .unwrap();
        assert_eq!(transport.telemetry(), Snapshot::default());
    }

    #[tokio::test]
    async fn send_drive_transmits_expected_bytes() {
        let camera = fake_camera().await;
        let addr = camera.local_addr().unwrap();
        let transport = Transport::connect(&addr.ip().to_string(), addr.port())
            .await
            .unwrap();
        transport.send_drive(5, PanDir::Right, 3, TiltDir::Up).await.unwrap();
        let mut buf = [0u8; 16];
        let (len, _from) = tokio::time::timeout(Duration::from_millis(200), camera.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], &[0x81, 0x01, 0x06, 0x01, 5, 3, 0x02, 0x01, 0xFF]);
    }

    #[tokio::test]
    async fn apply_response_updates_snapshot() {
        let camera = fake_camera().await;
        let addr = camera.local_addr().unwrap();
        let transport = Transport::connect(&addr.ip().to_string(), addr.port())
            .await
            .unwrap();
        transport.apply_response(&[0x90, 0x50, 0x01, 0x02, 0x03, 0x04, 0xFF]);
        assert_eq!(transport.telemetry().zoom_raw, Some(0x1234));
    }

    #[tokio::test]
    async fn malformed_packet_does_not_update_snapshot() {
        let camera = fake_camera().await;
        let addr = camera.local_addr().unwrap();
        let transport = Transport::connect(&addr.ip().to_string(), addr.port())
            .await
            .unwrap();
        transport.apply_response(&[0x90, 0x41, 0xFF]);
        assert_eq!(transport.telemetry(), Snapshot::default());
    }
}
