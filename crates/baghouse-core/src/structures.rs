//! In-Memory Bag Structures
//!
//! The bookkeeping types the engine maintains while a bag is open:
//!
//! - [`CompressionType`]: chunk codec, stored on disk as an ASCII name.
//! - [`ConnectionInfo`]: one recorded stream — a topic plus its message-type
//!   descriptors and the caller's connection header.
//! - [`ChunkInfo`]: per-chunk summary emitted in the trailing chunk-info
//!   records.
//! - [`ChunkHeader`]: the decoded header of a chunk record.
//! - [`IndexEntry`]: locates one message as `(time, chunk_pos, offset)`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::header::HeaderMap;
use crate::time::Time;

/// Chunk compression codec.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    #[default]
    None,
    Bz2,
    Lz4,
}

impl CompressionType {
    /// The ASCII name stored in chunk record headers.
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionType::None => "none",
            CompressionType::Bz2 => "bz2",
            CompressionType::Lz4 => "lz4",
        }
    }
}

impl std::fmt::Display for CompressionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CompressionType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(CompressionType::None),
            "bz2" => Ok(CompressionType::Bz2),
            "lz4" => Ok(CompressionType::Lz4),
            other => Err(Error::InvalidArgument(format!(
                "unknown compression '{other}'"
            ))),
        }
    }
}

/// One recorded stream: topic, message-type descriptors, connection header.
///
/// Ids are dense and assigned in first-write order starting at 0. Two
/// connections may share a topic while differing in other header fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub id: u32,
    pub topic: String,
    pub datatype: String,
    pub md5sum: String,
    pub msg_def: String,
    pub header: HeaderMap,
}

/// Summary of one chunk, kept in memory and emitted as a trailing
/// chunk-info record at close.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    /// Absolute file offset of the chunk record.
    pub pos: u64,
    pub start_time: Time,
    pub end_time: Time,
    /// Message count per connection id within this chunk.
    pub connection_counts: BTreeMap<u32, u32>,
}

impl ChunkInfo {
    pub fn new(pos: u64, time: Time) -> Self {
        Self {
            pos,
            start_time: time,
            end_time: time,
            connection_counts: BTreeMap::new(),
        }
    }

    pub fn message_count(&self) -> u32 {
        self.connection_counts.values().sum()
    }
}

/// Decoded header of a chunk record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkHeader {
    pub compression: CompressionType,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
}

/// Locates one message: its timestamp, the chunk record holding it, and the
/// byte offset of its record inside the uncompressed chunk.
///
/// The derived `Ord` is the index sort key `(time, chunk_pos, offset)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IndexEntry {
    pub time: Time,
    pub chunk_pos: u64,
    pub offset: u32,
}
