//! Core flow metering pipeline
//!
//! Packet buffers are decoded and folded into per-session flow
//! collections; a rotate task publishes window snapshots to the
//! accounting hub, which keeps per-interface history and answers
//! aggregation queries.

pub mod accounting;
pub mod flow;
pub mod session;

pub use accounting::Accounting;
pub use session::CaptureSession;
