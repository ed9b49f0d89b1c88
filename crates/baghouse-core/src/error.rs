//! Error Types for Baghouse
//!
//! Every fallible operation in the workspace returns `Result<T>`, aliased to
//! `Result<T, Error>` so callers can propagate with `?`.
//!
//! ## Error Categories
//!
//! - `Io`: underlying file or stream failure. Propagated fatally; the engine
//!   never retries.
//! - `Format`: malformed record framing, unknown opcode, missing or duplicate
//!   header field, bad magic, truncated file.
//! - `Unindexed`: the file header reports `index_pos = 0`, meaning the writer
//!   never reached close. The bag's trailing index records are absent.
//! - `Codec`: compression or decompression of a chunk failed.
//! - `InvalidArgument`: caller error — a timestamp below the representable
//!   minimum, an unknown mode, compression name, or encryptor plugin name,
//!   or an operation against a closed bag.
//! - `Encryption`: an encryptor plugin hook failed.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed bag: {0}")]
    Format(String),

    #[error("bag is unindexed (writer did not close cleanly)")]
    Unindexed,

    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("encryption error: {0}")]
    Encryption(String),
}

pub type Result<T> = std::result::Result<T, Error>;
