//! Errors surfaced by the migration core.

use std::io;

/// Errors fatal to the current migration attempt. Every variant triggers the caller
/// to run cleanup; there is no retry at this layer.
#[derive(thiserror::Error, Debug)]
pub enum MigrationError {
    #[error("transport error: {0}")]
    Transport(#[source] io::Error),

    #[error("read failed for device {device} at sector {sector}: {source}")]
    Read {
        device: String,
        sector: u64,
        #[source]
        source: io::Error,
    },

    #[error("write failed for device {device} at sector {sector}: {source}")]
    Write {
        device: String,
        sector: u64,
        #[source]
        source: io::Error,
    },

    #[error("unknown block device {0:?}")]
    UnknownDevice(String),

    #[error("unknown wire flags {0:#x}")]
    UnknownFlags(u64),

    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),
}

pub type Result<T> = std::result::Result<T, MigrationError>;
