//! IPC bridge for host-engine communication.
//!
//! This module provides the wire protocol and codec spoken between the host
//! (parent) and the Node.js engine subprocess.
//!
//! # Architecture
//!
//! - **protocol**: Envelope, EventPayload and the reserved channel names
//! - **codec**: newline-delimited JSON framing for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
