//! Baghouse Storage Layer
//!
//! The bag-file engine: an append-only container format for recording
//! time-stamped message streams into chunked, indexed, optionally-compressed
//! and optionally-encrypted files, plus the query surface for reading them
//! back.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌────────────┐  write(topic, time, bytes)
//! │  Recorder  │──────────────┐
//! └────────────┘              ▼
//!                      ┌─────────────┐
//!                      │     Bag     │  chunk lifecycle, indexes,
//!                      │   (engine)  │  trailing records, header patch
//!                      └──────┬──────┘
//!                record codec │ encryptor hooks
//!                             ▼
//!                      ┌─────────────┐
//!                      │ ChunkedFile │  raw / bz2 / lz4 write streams
//!                      └──────┬──────┘
//!                             ▼
//!                          bag file
//! ```
//!
//! Reading runs the same stack upward: `View` merges the per-connection
//! indexes into time order and yields `MessageInstance` handles, which pull
//! payloads through the engine's single-slot decompressed-chunk cache.
//!
//! ## Main Components
//!
//! - [`Bag`]: open/close lifecycle, the writer path (chunking, per-connection
//!   indexing, trailing records) and the reader path (index ingestion, lazy
//!   chunk decompression).
//! - [`View`] / [`Query`]: topic- and time-filtered merge iteration.
//! - [`MessageInstance`]: deferred payload access for one message.
//! - [`Encryptor`]: pluggable chunk/header encryption, selected by name.
//! - [`ChunkedFile`]: the file abstraction that applies chunk compression.
//!
//! ## Usage
//!
//! ### Recording
//! ```ignore
//! use baghouse_storage::{Bag, BagMode};
//! use baghouse_core::{CompressionType, MessageDescriptor, Time};
//!
//! let mut bag = Bag::open("run.bag", BagMode::Write)?;
//! bag.set_compression(CompressionType::Lz4);
//! bag.write_raw("/scan", Time::new(10, 0), &payload, descriptor, None)?;
//! bag.close()?;
//! ```
//!
//! ### Replaying
//! ```ignore
//! use baghouse_storage::{Bag, BagMode, View};
//!
//! let bag = Bag::open("run.bag", BagMode::Read)?;
//! for message in &View::new(&bag)? {
//!     println!("{} @ {}: {} bytes", message.topic(), message.time(), message.size()?);
//! }
//! ```
//!
//! ## Threading
//!
//! The engine is single-threaded and synchronous. Read operations fill
//! internal caches, so a `Bag` is not `Sync`; use one `Bag` per reader.

pub mod bag;
pub mod chunked_file;
pub mod config;
pub mod encryptor;
pub mod message_instance;
pub mod view;

pub use bag::{Bag, BagMode};
pub use chunked_file::ChunkedFile;
pub use config::BagConfig;
pub use encryptor::{register_encryptor, Encryptor, EncryptorFactory, NoEncryptor, NO_ENCRYPTION};
pub use message_instance::MessageInstance;
pub use view::{Query, View, ViewIter};
