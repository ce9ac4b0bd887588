//! VISCA Transport (spec.md §4.B) — wire framing, UDP transport, and the
//! cached Telemetry Snapshot.

pub mod frame;
pub mod telemetry;
pub mod transport;

pub use frame::{PanDir, TiltDir, ZoomCommand};
pub use telemetry::Snapshot;
pub use transport::{Transport, DEFAULT_PORT};
