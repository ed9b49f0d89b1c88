//! Baghouse Core
//!
//! Format-level building blocks of the baghouse bag-file format: the error
//! type, timestamps, the reusable byte buffer, the record header map and
//! framing codec, the in-memory index structures, and the typed-message
//! trait. The engine, chunk I/O, and query surface live in
//! `baghouse-storage`.

pub mod buffer;
pub mod error;
pub mod header;
pub mod message;
pub mod record;
pub mod structures;
pub mod time;

pub use buffer::Buffer;
pub use error::{Error, Result};
pub use header::HeaderMap;
pub use message::{BagMessage, MessageDescriptor};
pub use structures::{ChunkHeader, ChunkInfo, CompressionType, ConnectionInfo, IndexEntry};
pub use time::Time;
