//! Live block-device migration core.
//!
//! Reads sectors off writable block devices, classifies them, pipelines
//! asynchronous I/O against a rate budget, tracks dirtied regions, and decides
//! when the remaining delta is small enough for a brief guest-paused cut-over —
//! plus the receiver side that reconstructs the image from the resulting byte
//! stream.

pub mod bitmap;
pub mod bulk;
pub mod chunk;
pub mod config;
pub mod convergence;
pub mod dirty;
pub mod dms;
pub mod driver;
pub mod error;
pub mod executor;
pub mod lifecycle;
pub mod pipeline;
pub mod record;
pub mod send;
pub mod transport;
pub mod wire;

pub use chunk::{CHUNK_BYTES, CHUNK_SECTORS, SECTOR_BITS, SECTOR_BYTES};
pub use config::MigrationParams;
pub use driver::{BlockDriver, FileBlockDriver};
pub use error::{MigrationError, Result};
pub use lifecycle::Migration;
pub use transport::{MemTransport, TcpTransport, Transport};
pub use wire::Receiver;
