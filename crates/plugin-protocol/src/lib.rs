//! # Enclave Plugin Protocol
//!
//! Frames exchanged between the host runtime and an isolated worker process
//! over its stdin/stdout.
//!
//! The worker writes [`WorkerFrame::Ready`] first. After that the host sends
//! [`HostFrame`]s and the worker answers each one carrying a request id with
//! exactly one [`WorkerFrame`] carrying the same id. Replies may arrive out
//! of order.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod error;
mod frame;

pub use codec::{DEFAULT_MAX_FRAME_BYTES, decode_line, encode_line, read_frame, write_frame};
pub use error::ProtocolError;
pub use frame::{HostFrame, PROTOCOL_VERSION, RequestId, WorkerFrame};
