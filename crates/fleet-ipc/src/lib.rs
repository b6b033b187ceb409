//! Fleet IPC - length-prefixed message transport between controller and workers
//!
//! The controller talks to each worker over the child's stdio pipes: it
//! writes [`ControllerMessage`] frames to the worker's stdin and reads
//! [`WorkerMessage`] frames from its stdout.
//!
//! # Framing
//!
//! `[len: u32 big-endian][bincode payload: len bytes]`
//!
//! `len` must be between 1 and [`MAX_PAYLOAD_SIZE`]. A reader that sees a
//! bad prefix cannot resynchronise, so the channel is torn down. A payload
//! that fails to decode is skipped.
//!
//! # Example
//!
//! ```rust
//! use fleet_ipc::{FrameReader, FrameWriter, WorkerMessage};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let (worker_side, controller_side) = tokio::io::duplex(64 * 1024);
//! let mut writer = FrameWriter::new(worker_side);
//! let mut reader = FrameReader::new(controller_side);
//!
//! writer.send(&WorkerMessage::Heartbeat { rss_bytes: Some(1024) }).await?;
//! let received: WorkerMessage = reader.recv().await?;
//! assert_eq!(received, WorkerMessage::Heartbeat { rss_bytes: Some(1024) });
//! # Ok(())
//! # }
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

mod error;
mod messages;
mod transport;

pub use error::{Direction, TransportError, TransportResult};
pub use messages::{ControllerMessage, LogLevel, RequestKind, WorkerMessage};
pub use transport::{FrameReader, FrameWriter, decode_frame, encode_frame};

/// Largest payload a frame may carry, 1 MiB.
pub const MAX_PAYLOAD_SIZE: usize = 1_048_576;

pub const LENGTH_PREFIX_SIZE: usize = 4;
