//! Bag Engine
//!
//! This module implements the bag-file engine: the record state machine, the
//! chunk lifecycle, per-connection index bookkeeping, and the
//! read/write/append lifecycle.
//!
//! ## File Layout (version 2.0)
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ magic line "#ROSBAG V2.0\n"                  │
//! ├──────────────────────────────────────────────┤
//! │ file-header record (padded to 4096 bytes)    │
//! │ - index_pos, conn_count, chunk_count         │
//! ├──────────────────────────────────────────────┤
//! │ chunk record (compressed body)               │
//! │ index-data records, one per connection       │
//! ├──────────────────────────────────────────────┤
//! │ ... more chunks ...                          │
//! ├──────────────────────────────────────────────┤
//! │ connection records    ◄── index_pos          │
//! │ chunk-info records                           │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! A chunk holds message-data records plus a copy of each connection record
//! it references, so a chunk is recoverable on its own. While a chunk is
//! open its uncompressed bytes are mirrored into `outgoing_chunk_buffer`,
//! which lets Append-mode queries read messages that have not been flushed.
//!
//! Close is the commit point: it flushes the open chunk, emits the trailing
//! connection and chunk-info records, and patches the file header with their
//! position. A writer that never reaches close leaves `index_pos = 0` and
//! the reader reports the bag as unindexed.
//!
//! ## Sharing
//!
//! Read operations fill a single-slot decompressed-chunk cache through a
//! shared borrow (the cache lives behind a `RefCell`), so a `Bag` is not
//! `Sync`: concurrent readers need separate `Bag` instances.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, info};

use baghouse_core::record::{
    self, BAG_MAGIC_V1, BAG_MAGIC_V2, CHUNK_COUNT_FIELD, CHUNK_INFO_VERSION, CHUNK_POS_FIELD,
    COMPRESSION_FIELD, CONNECTION_COUNT_FIELD, CONNECTION_FIELD, COUNT_FIELD, DEF_FIELD_102,
    ENCRYPTOR_FIELD, END_TIME_FIELD, FILE_HEADER_LENGTH, INDEX_POS_FIELD, INDEX_VERSION,
    MD5_FIELD, MD5_FIELD_102, MESSAGE_DEFINITION_FIELD, OP_CHUNK, OP_CHUNK_INFO, OP_CONNECTION,
    OP_FIELD, OP_FILE_HEADER, OP_INDEX_DATA, OP_MSG_DATA, OP_MSG_DEF, SIZE_FIELD,
    START_TIME_FIELD, TIME_FIELD, TOPIC_FIELD, TYPE_FIELD, VERSION_102, VERSION_200, VER_FIELD,
};
use baghouse_core::{
    BagMessage, Buffer, ChunkHeader, ChunkInfo, CompressionType, ConnectionInfo, Error, HeaderMap,
    IndexEntry, MessageDescriptor, Result, Time,
};

use crate::chunked_file::{self, ChunkedFile};
use crate::config::BagConfig;
use crate::encryptor::{create_encryptor, Encryptor, NO_ENCRYPTION};

/// The mode a bag is opened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BagMode {
    Read,
    Write,
    Append,
}

/// Bookkeeping for the chunk currently being written.
struct CurrentChunk {
    info: ChunkInfo,
    /// File offset where the chunk body starts (just past the chunk record
    /// header).
    data_pos: u64,
}

/// File handle plus reader caches. Read operations mutate these through a
/// `RefCell`, keeping the public read surface on `&self`.
struct BagIo {
    file: ChunkedFile,
    /// Scratch for assembling outgoing records.
    scratch: BytesMut,
    /// Compressed (decrypted) chunk bytes.
    chunk_buffer: Buffer,
    /// Single-slot uncompressed chunk cache.
    decompress_buffer: Buffer,
    /// Chunk position currently held in `decompress_buffer`.
    decompressed_chunk: Option<u64>,
    /// Payload of the last legacy (v1.02) message record read.
    record_buffer: Buffer,
    /// Number of chunk bodies loaded from disk since open.
    chunk_loads: u64,
}

impl BagIo {
    fn new(file: ChunkedFile) -> Self {
        Self {
            file,
            scratch: BytesMut::new(),
            chunk_buffer: Buffer::new(),
            decompress_buffer: Buffer::new(),
            decompressed_chunk: None,
            record_buffer: Buffer::new(),
            chunk_loads: 0,
        }
    }
}

impl std::fmt::Debug for Bag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bag")
            .field("file_name", &self.file_name)
            .field("mode", &self.mode)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

/// A bag file open for reading, writing, or appending.
pub struct Bag {
    mode: BagMode,
    file_name: PathBuf,
    /// `major * 100 + minor`: 200 or 102.
    version: u32,
    config: BagConfig,
    open: bool,

    file_size: u64,
    file_header_pos: u64,
    index_data_pos: u64,
    connection_count: u32,
    chunk_count: u32,

    curr_chunk: Option<CurrentChunk>,

    topic_connection_ids: HashMap<String, u32>,
    header_connection_ids: BTreeMap<HeaderMap, u32>,
    connections: BTreeMap<u32, ConnectionInfo>,
    chunks: Vec<ChunkInfo>,

    connection_indexes: BTreeMap<u32, Vec<IndexEntry>>,
    curr_chunk_connection_indexes: BTreeMap<u32, Vec<IndexEntry>>,

    /// Uncompressed mirror of the open chunk.
    outgoing_chunk_buffer: Buffer,

    encryptor: Box<dyn Encryptor>,
    io: RefCell<BagIo>,
}

impl Bag {
    /// Open a bag file.
    pub fn open(path: impl AsRef<Path>, mode: BagMode) -> Result<Bag> {
        let file_name = path.as_ref().to_path_buf();
        let file = ChunkedFile::open(&file_name, mode)?;

        let mut bag = Bag {
            mode,
            file_name,
            version: 0,
            config: BagConfig::default(),
            open: true,
            file_size: 0,
            file_header_pos: 0,
            index_data_pos: 0,
            connection_count: 0,
            chunk_count: 0,
            curr_chunk: None,
            topic_connection_ids: HashMap::new(),
            header_connection_ids: BTreeMap::new(),
            connections: BTreeMap::new(),
            chunks: Vec::new(),
            connection_indexes: BTreeMap::new(),
            curr_chunk_connection_indexes: BTreeMap::new(),
            outgoing_chunk_buffer: Buffer::new(),
            encryptor: create_encryptor(NO_ENCRYPTION)?,
            io: RefCell::new(BagIo::new(file)),
        };

        match mode {
            BagMode::Write => bag.start_writing()?,
            BagMode::Read => bag.start_reading()?,
            BagMode::Append => bag.start_appending()?,
        }
        bag.file_size = bag.io.get_mut().file.seek(SeekFrom::End(0))?;

        info!(
            path = %bag.file_name.display(),
            mode = ?bag.mode,
            version = bag.version,
            "opened bag"
        );
        Ok(bag)
    }

    /// Finish the bag. For a writable bag this flushes the open chunk, emits
    /// the trailing index records, and patches the file header; it is the
    /// commit point. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        if matches!(self.mode, BagMode::Write | BagMode::Append) {
            self.stop_writing()?;
        }
        self.open = false;
        info!(path = %self.file_name.display(), "closed bag");
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn file_name(&self) -> &Path {
        &self.file_name
    }

    pub fn mode(&self) -> BagMode {
        self.mode
    }

    pub fn major_version(&self) -> u32 {
        self.version / 100
    }

    pub fn minor_version(&self) -> u32 {
        self.version % 100
    }

    /// Current size of the bag file (a lower bound while writing).
    pub fn size(&self) -> u64 {
        self.file_size
    }

    pub fn compression(&self) -> CompressionType {
        self.config.compression
    }

    /// Set the codec used for subsequently started chunks.
    pub fn set_compression(&mut self, compression: CompressionType) {
        self.config.compression = compression;
    }

    pub fn chunk_threshold(&self) -> u32 {
        self.config.chunk_threshold
    }

    /// Set the uncompressed size past which a chunk is closed.
    pub fn set_chunk_threshold(&mut self, chunk_threshold: u32) {
        self.config.chunk_threshold = chunk_threshold;
    }

    /// Select an encryptor plugin for writing. Readers and appenders recover
    /// the plugin from the file header instead.
    pub fn set_encryptor_plugin(&mut self, plugin_name: &str, plugin_param: &str) -> Result<()> {
        if self.mode != BagMode::Write {
            return Err(Error::InvalidArgument(
                "encryptor can only be selected on a bag open for writing".to_string(),
            ));
        }
        if self.curr_chunk.is_some() || !self.chunks.is_empty() {
            return Err(Error::InvalidArgument(
                "encryptor must be selected before the first write".to_string(),
            ));
        }
        let mut encryptor = create_encryptor(plugin_name)?;
        encryptor.initialize(plugin_param)?;
        self.encryptor = encryptor;
        Ok(())
    }

    /// Record a typed message.
    pub fn write<M: BagMessage>(&mut self, topic: &str, time: Time, msg: &M) -> Result<()> {
        let data = msg.encode()?;
        self.write_raw(topic, time, &data, M::descriptor(), None)
    }

    /// Record a message from raw bytes plus its type descriptors.
    ///
    /// When `connection_header` is given, connection identity is keyed on the
    /// header (with the topic mixed in, so identical headers on different
    /// topics stay distinct); otherwise identity is keyed on the topic alone.
    pub fn write_raw(
        &mut self,
        topic: &str,
        time: Time,
        data: &[u8],
        descriptor: MessageDescriptor<'_>,
        connection_header: Option<&HeaderMap>,
    ) -> Result<()> {
        if !self.open || self.mode == BagMode::Read {
            return Err(Error::InvalidArgument(
                "bag is not open for writing".to_string(),
            ));
        }
        if time < Time::MIN {
            return Err(Error::InvalidArgument(format!(
                "message time {time} is before the minimum {}",
                Time::MIN
            )));
        }

        let (conn_id, known) = self.resolve_connection_id(topic, connection_header);

        // Reads may have moved the file position; writes always resume at
        // the end of the file.
        self.file_size = self.io.get_mut().file.seek(SeekFrom::End(0))?;

        let chunk_pos = match &self.curr_chunk {
            Some(chunk) => chunk.info.pos,
            None => self.start_writing_chunk(time)?,
        };

        if !known {
            // The connection record's data section must always carry the
            // descriptor fields, whether or not the caller supplied a header.
            let mut header = connection_header.cloned().unwrap_or_default();
            if !header.contains(TYPE_FIELD) {
                header.put_str(TYPE_FIELD, descriptor.datatype);
            }
            if !header.contains(MD5_FIELD) {
                header.put_str(MD5_FIELD, descriptor.md5sum);
            }
            if !header.contains(MESSAGE_DEFINITION_FIELD) {
                header.put_str(MESSAGE_DEFINITION_FIELD, descriptor.definition);
            }
            self.connections.insert(
                conn_id,
                ConnectionInfo {
                    id: conn_id,
                    topic: topic.to_string(),
                    datatype: descriptor.datatype.to_string(),
                    md5sum: descriptor.md5sum.to_string(),
                    msg_def: descriptor.definition.to_string(),
                    header,
                },
            );
            self.write_connection_record_in_chunk(conn_id)?;
            debug!(topic, conn_id, "new connection");
        }

        let entry = IndexEntry {
            time,
            chunk_pos,
            offset: self.chunk_offset(),
        };
        self.curr_chunk_connection_indexes
            .entry(conn_id)
            .or_default()
            .push(entry);
        if self.mode != BagMode::Write {
            self.connection_indexes
                .entry(conn_id)
                .or_default()
                .push(entry);
        }

        self.write_message_data_record(conn_id, time, data)?;

        if let Some(chunk) = &mut self.curr_chunk {
            *chunk.info.connection_counts.entry(conn_id).or_insert(0) += 1;
            if time > chunk.info.end_time {
                chunk.info.end_time = time;
            }
            if time < chunk.info.start_time {
                chunk.info.start_time = time;
            }
        }

        if self.chunk_offset() > self.config.chunk_threshold {
            self.stop_writing_chunk()?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Writer path
    // ------------------------------------------------------------------

    fn start_writing(&mut self) -> Result<()> {
        self.version = VERSION_200;
        let io = self.io.get_mut();
        io.file.write(BAG_MAGIC_V2)?;
        self.file_header_pos = io.file.offset();
        self.write_file_header_record()
    }

    fn start_appending(&mut self) -> Result<()> {
        self.read_version()?;
        if self.version != VERSION_200 {
            return Err(Error::Format(format!(
                "can only append to a version 2.0 bag, found {}.{}",
                self.major_version(),
                self.minor_version()
            )));
        }
        self.start_reading_200()?;

        // Chop off the trailing index records; they are rewritten at close.
        let trailing_pos = self.index_data_pos;
        {
            let io = self.io.get_mut();
            io.file.truncate(trailing_pos)?;
        }
        self.index_data_pos = 0;

        // Rewrite the header now so a crash mid-append leaves a bag that
        // reads as unindexed rather than silently truncated.
        {
            let io = self.io.get_mut();
            io.file.seek(SeekFrom::Start(self.file_header_pos))?;
        }
        self.write_file_header_record()?;
        self.io.get_mut().file.seek(SeekFrom::End(0))?;

        debug!(
            path = %self.file_name.display(),
            truncated_at = trailing_pos,
            connections = self.connections.len(),
            chunks = self.chunks.len(),
            "appending to existing bag"
        );
        Ok(())
    }

    /// Emit the trailing records and patch the file header.
    fn stop_writing(&mut self) -> Result<()> {
        self.stop_writing_chunk()?;

        let io = self.io.get_mut();
        self.index_data_pos = io.file.seek(SeekFrom::End(0))?;

        self.write_connection_records()?;
        self.write_chunk_info_records()?;

        {
            let io = self.io.get_mut();
            io.file.seek(SeekFrom::Start(self.file_header_pos))?;
        }
        self.write_file_header_record()?;
        self.file_size = self.io.get_mut().file.seek(SeekFrom::End(0))?;

        debug!(
            connections = self.connections.len(),
            chunks = self.chunks.len(),
            index_pos = self.index_data_pos,
            "wrote trailing index"
        );
        Ok(())
    }

    /// Write the fixed-width file-header record at the current position.
    fn write_file_header_record(&mut self) -> Result<()> {
        let mut header = HeaderMap::new();
        header.put_u8(OP_FIELD, OP_FILE_HEADER);
        header.put_u64(INDEX_POS_FIELD, self.index_data_pos);
        header.put_u32(CONNECTION_COUNT_FIELD, self.connections.len() as u32);
        header.put_u32(CHUNK_COUNT_FIELD, self.chunks.len() as u32);
        self.encryptor.add_fields_to_file_header(&mut header)?;

        let io = self.io.get_mut();
        io.scratch.clear();
        record::encode_header(&mut io.scratch, &header);
        let header_total = io.scratch.len();
        if header_total + 8 > FILE_HEADER_LENGTH as usize {
            return Err(Error::Format(
                "file header record exceeds its fixed width".to_string(),
            ));
        }
        // Pad the data section out to the fixed record width.
        let padding = FILE_HEADER_LENGTH as usize - header_total - 4;
        io.scratch.put_u32_le(padding as u32);
        io.scratch.resize(header_total + 4 + padding, b' ');
        io.file.write(&io.scratch)
    }

    fn resolve_connection_id(
        &mut self,
        topic: &str,
        connection_header: Option<&HeaderMap>,
    ) -> (u32, bool) {
        match connection_header {
            None => match self.topic_connection_ids.get(topic) {
                Some(&id) => (id, true),
                None => {
                    let id = self.connections.len() as u32;
                    self.topic_connection_ids.insert(topic.to_string(), id);
                    (id, false)
                }
            },
            Some(header) => {
                // Key on a copy of the header with the topic forced in, so
                // otherwise-identical headers on different topics stay
                // distinct. The copy is bookkeeping only and never hits disk.
                let mut key = header.clone();
                key.put_str(TOPIC_FIELD, topic);
                match self.header_connection_ids.get(&key) {
                    Some(&id) => (id, true),
                    None => {
                        let id = self.connections.len() as u32;
                        self.header_connection_ids.insert(key, id);
                        (id, false)
                    }
                }
            }
        }
    }

    /// Begin a chunk at the current end of file. Returns the chunk position.
    fn start_writing_chunk(&mut self, time: Time) -> Result<u64> {
        let compression = self.config.compression;
        let io = self.io.get_mut();
        let pos = io.file.offset();
        // Placeholder sizes, patched when the chunk closes. The compression
        // name is final, so the patched header has the same width.
        Self::write_chunk_header(io, compression, 0, 0)?;
        let data_pos = io.file.offset();
        io.file.set_write_mode(compression)?;

        self.curr_chunk = Some(CurrentChunk {
            info: ChunkInfo::new(pos, time),
            data_pos,
        });
        self.outgoing_chunk_buffer.clear();
        Ok(pos)
    }

    /// Close the open chunk: flush the compressor, patch the chunk record,
    /// and emit this chunk's index-data records. No-op when no chunk is open.
    fn stop_writing_chunk(&mut self) -> Result<()> {
        let Some(CurrentChunk { info, data_pos }) = self.curr_chunk.take() else {
            return Ok(());
        };
        let compression = self.config.compression;

        let io = self.io.get_mut();
        io.file.seek(SeekFrom::End(0))?;
        let (compressed, uncompressed) = io.file.stop_write()?;
        let compressed = self
            .encryptor
            .encrypt_chunk(compressed, data_pos, &mut io.file)?;
        let end_of_chunk = io.file.offset();

        io.file.seek(SeekFrom::Start(info.pos))?;
        Self::write_chunk_header(io, compression, compressed, uncompressed)?;
        io.file.seek(SeekFrom::Start(end_of_chunk))?;

        let indexes = std::mem::take(&mut self.curr_chunk_connection_indexes);
        for (conn_id, entries) in &indexes {
            self.write_index_record(*conn_id, entries)?;
        }

        debug!(
            pos = info.pos,
            compressed,
            uncompressed,
            messages = info.message_count(),
            "closed chunk"
        );
        self.chunks.push(info);
        self.outgoing_chunk_buffer.clear();
        Ok(())
    }

    fn write_chunk_header(
        io: &mut BagIo,
        compression: CompressionType,
        compressed_size: u32,
        uncompressed_size: u32,
    ) -> Result<()> {
        let mut header = HeaderMap::new();
        header.put_u8(OP_FIELD, OP_CHUNK);
        header.put_str(COMPRESSION_FIELD, compression.as_str());
        header.put_u32(SIZE_FIELD, uncompressed_size);

        io.scratch.clear();
        record::encode_header(&mut io.scratch, &header);
        io.scratch.put_u32_le(compressed_size);
        io.file.write(&io.scratch)
    }

    /// Uncompressed size of the open chunk so far.
    fn chunk_offset(&mut self) -> u32 {
        self.io.get_mut().file.uncompressed_in() as u32
    }

    /// Write a connection record into the open chunk stream, mirroring it
    /// into the outgoing buffer.
    fn write_connection_record_in_chunk(&mut self, conn_id: u32) -> Result<()> {
        let Some(conn) = self.connections.get(&conn_id) else {
            return Err(Error::Format(format!("unknown connection id {conn_id}")));
        };
        let mut header = HeaderMap::new();
        header.put_u8(OP_FIELD, OP_CONNECTION);
        header.put_u32(CONNECTION_FIELD, conn_id);
        header.put_str(TOPIC_FIELD, &conn.topic);

        let io = self.io.get_mut();
        io.scratch.clear();
        record::encode_header(&mut io.scratch, &header);
        // The data section of a connection record is itself header-encoded.
        record::encode_header(&mut io.scratch, &conn.header);
        io.file.write(&io.scratch)?;
        self.outgoing_chunk_buffer.extend_from_slice(&io.scratch);
        Ok(())
    }

    fn write_message_data_record(&mut self, conn_id: u32, time: Time, data: &[u8]) -> Result<()> {
        let mut header = HeaderMap::new();
        header.put_u8(OP_FIELD, OP_MSG_DATA);
        header.put_u32(CONNECTION_FIELD, conn_id);
        header.put_time(TIME_FIELD, time);

        let io = self.io.get_mut();
        io.scratch.clear();
        record::encode_record(&mut io.scratch, &header, data);
        io.file.write(&io.scratch)?;
        self.outgoing_chunk_buffer.extend_from_slice(&io.scratch);
        Ok(())
    }

    /// Emit the trailing connection records through the encryptor's header
    /// hook (both the record header and the connection-header data section).
    fn write_connection_records(&mut self) -> Result<()> {
        let records: Vec<(HeaderMap, HeaderMap)> = self
            .connections
            .values()
            .map(|conn| {
                let mut header = HeaderMap::new();
                header.put_u8(OP_FIELD, OP_CONNECTION);
                header.put_u32(CONNECTION_FIELD, conn.id);
                header.put_str(TOPIC_FIELD, &conn.topic);
                (header, conn.header.clone())
            })
            .collect();

        for (header, data) in &records {
            let io = self.io.get_mut();
            self.encryptor.write_encrypted_header(header, &mut io.file)?;
            self.encryptor.write_encrypted_header(data, &mut io.file)?;
        }
        Ok(())
    }

    fn write_chunk_info_records(&mut self) -> Result<()> {
        for chunk_info in &self.chunks {
            let mut header = HeaderMap::new();
            header.put_u8(OP_FIELD, OP_CHUNK_INFO);
            header.put_u32(VER_FIELD, CHUNK_INFO_VERSION);
            header.put_u64(CHUNK_POS_FIELD, chunk_info.pos);
            header.put_time(START_TIME_FIELD, chunk_info.start_time);
            header.put_time(END_TIME_FIELD, chunk_info.end_time);
            header.put_u32(COUNT_FIELD, chunk_info.connection_counts.len() as u32);

            let io = self.io.get_mut();
            io.scratch.clear();
            record::encode_header(&mut io.scratch, &header);
            io.scratch
                .put_u32_le(chunk_info.connection_counts.len() as u32 * 8);
            for (conn_id, count) in &chunk_info.connection_counts {
                io.scratch.put_u32_le(*conn_id);
                io.scratch.put_u32_le(*count);
            }
            io.file.write(&io.scratch)?;
        }
        Ok(())
    }

    fn write_index_record(&mut self, conn_id: u32, entries: &[IndexEntry]) -> Result<()> {
        let mut header = HeaderMap::new();
        header.put_u8(OP_FIELD, OP_INDEX_DATA);
        header.put_u32(VER_FIELD, INDEX_VERSION);
        header.put_u32(CONNECTION_FIELD, conn_id);
        header.put_u32(COUNT_FIELD, entries.len() as u32);

        let io = self.io.get_mut();
        io.scratch.clear();
        record::encode_header(&mut io.scratch, &header);
        io.scratch.put_u32_le(entries.len() as u32 * 12);
        for entry in entries {
            io.scratch.put_u32_le(entry.time.sec);
            io.scratch.put_u32_le(entry.time.nsec);
            io.scratch.put_u32_le(entry.offset);
        }
        io.file.write(&io.scratch)
    }

    // ------------------------------------------------------------------
    // Reader path
    // ------------------------------------------------------------------

    fn start_reading(&mut self) -> Result<()> {
        self.read_version()?;
        match self.version {
            VERSION_200 => self.start_reading_200(),
            VERSION_102 => self.start_reading_102(),
            v => Err(Error::Format(format!("unhandled bag version {v}"))),
        }
    }

    fn read_version(&mut self) -> Result<()> {
        let io = self.io.get_mut();
        io.file.seek(SeekFrom::Start(0))?;
        let mut magic = [0u8; 13];
        io.file.read_exact_buf(&mut magic).map_err(|e| match e {
            Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::UnexpectedEof => {
                Error::Format("file too short for a bag magic line".to_string())
            }
            other => other,
        })?;
        self.version = if &magic == BAG_MAGIC_V2 {
            VERSION_200
        } else if &magic == BAG_MAGIC_V1 {
            VERSION_102
        } else {
            return Err(Error::Format("bad bag magic line".to_string()));
        };
        self.file_header_pos = io.file.offset();
        Ok(())
    }

    fn read_file_header_record(&mut self) -> Result<()> {
        let io = self.io.get_mut();
        io.file.seek(SeekFrom::Start(self.file_header_pos))?;
        let header = record::read_header(&mut io.file)?;
        record::check_op(&header, OP_FILE_HEADER)?;
        let data_len = record::read_data_length(&mut io.file)?;
        io.file.seek(SeekFrom::Current(data_len as i64))?;

        self.index_data_pos = header.u64_field(INDEX_POS_FIELD)?;
        if self.version >= VERSION_200 {
            self.connection_count = header.u32_field(CONNECTION_COUNT_FIELD)?;
            self.chunk_count = header.u32_field(CHUNK_COUNT_FIELD)?;
        }
        if self.index_data_pos == 0 {
            return Err(Error::Unindexed);
        }

        if let Some(name) = header.opt_str_field(ENCRYPTOR_FIELD)? {
            let name = name.to_string();
            self.encryptor = create_encryptor(&name)?;
            self.encryptor.read_fields_from_file_header(&header)?;
            debug!(plugin = %name, "bag uses an encryptor");
        }
        Ok(())
    }

    fn start_reading_200(&mut self) -> Result<()> {
        self.read_file_header_record()?;

        self.io
            .get_mut()
            .file
            .seek(SeekFrom::Start(self.index_data_pos))?;
        for _ in 0..self.connection_count {
            self.read_connection_record()?;
        }
        for _ in 0..self.chunk_count {
            self.read_chunk_info_record()?;
        }

        // Walk each chunk's trailing index-data records to learn offsets.
        let chunks = self.chunks.clone();
        for chunk_info in &chunks {
            let chunk_header = {
                let io = self.io.get_mut();
                io.file.seek(SeekFrom::Start(chunk_info.pos))?;
                Self::read_chunk_header(&mut io.file)?
            };
            self.io
                .get_mut()
                .file
                .seek(SeekFrom::Current(chunk_header.compressed_size as i64))?;
            for _ in 0..chunk_info.connection_counts.len() {
                self.read_connection_index_record(chunk_info.pos)?;
            }
        }

        for entries in self.connection_indexes.values_mut() {
            entries.sort();
        }
        Ok(())
    }

    fn read_connection_record(&mut self) -> Result<()> {
        let io = self.io.get_mut();
        let header = self.encryptor.read_encrypted_header(&mut io.file)?;
        record::check_op(&header, OP_CONNECTION)?;
        let id = header.u32_field(CONNECTION_FIELD)?;
        let topic = header.str_field(TOPIC_FIELD)?.to_string();

        let conn_fields = self.encryptor.read_encrypted_header(&mut io.file)?;
        let datatype = conn_fields.str_field(TYPE_FIELD)?.to_string();
        let md5sum = conn_fields.str_field(MD5_FIELD)?.to_string();
        let msg_def = conn_fields.str_field(MESSAGE_DEFINITION_FIELD)?.to_string();

        // Seed the identity maps so Append reuses existing connections.
        self.topic_connection_ids.entry(topic.clone()).or_insert(id);
        let mut key = conn_fields.clone();
        key.put_str(TOPIC_FIELD, &topic);
        self.header_connection_ids.entry(key).or_insert(id);

        self.connections.insert(
            id,
            ConnectionInfo {
                id,
                topic,
                datatype,
                md5sum,
                msg_def,
                header: conn_fields,
            },
        );
        Ok(())
    }

    fn read_chunk_info_record(&mut self) -> Result<()> {
        let io = self.io.get_mut();
        let header = record::read_header(&mut io.file)?;
        record::check_op(&header, OP_CHUNK_INFO)?;
        let version = header.u32_field(VER_FIELD)?;
        if version != CHUNK_INFO_VERSION {
            return Err(Error::Format(format!(
                "unsupported chunk-info version {version}"
            )));
        }
        let pos = header.u64_field(CHUNK_POS_FIELD)?;
        let start_time = header.time_field(START_TIME_FIELD)?;
        let end_time = header.time_field(END_TIME_FIELD)?;
        let count = header.u32_field(COUNT_FIELD)?;

        let data_len = record::read_data_length(&mut io.file)?;
        if data_len != count * 8 {
            return Err(Error::Format(format!(
                "chunk-info record data is {data_len} bytes for {count} connections"
            )));
        }
        let mut data = vec![0u8; data_len as usize];
        io.file.read_exact_buf(&mut data)?;

        let mut connection_counts = BTreeMap::new();
        for pair in data.chunks_exact(8) {
            let conn_id = u32::from_le_bytes(pair[0..4].try_into().unwrap());
            let msg_count = u32::from_le_bytes(pair[4..8].try_into().unwrap());
            connection_counts.insert(conn_id, msg_count);
        }

        self.chunks.push(ChunkInfo {
            pos,
            start_time,
            end_time,
            connection_counts,
        });
        Ok(())
    }

    fn read_chunk_header(file: &mut ChunkedFile) -> Result<ChunkHeader> {
        let header = record::read_header(file)?;
        record::check_op(&header, OP_CHUNK)?;
        let compression: CompressionType = header
            .str_field(COMPRESSION_FIELD)?
            .parse()
            .map_err(|e: Error| Error::Format(e.to_string()))?;
        let uncompressed_size = header.u32_field(SIZE_FIELD)?;
        let compressed_size = record::read_data_length(file)?;
        Ok(ChunkHeader {
            compression,
            compressed_size,
            uncompressed_size,
        })
    }

    fn read_connection_index_record(&mut self, chunk_pos: u64) -> Result<()> {
        let io = self.io.get_mut();
        let header = record::read_header(&mut io.file)?;
        record::check_op(&header, OP_INDEX_DATA)?;
        let version = header.u32_field(VER_FIELD)?;
        if version != INDEX_VERSION {
            return Err(Error::Format(format!(
                "unsupported index-data version {version}"
            )));
        }
        let conn_id = header.u32_field(CONNECTION_FIELD)?;
        let count = header.u32_field(COUNT_FIELD)?;

        let data_len = record::read_data_length(&mut io.file)?;
        if data_len != count * 12 {
            return Err(Error::Format(format!(
                "index-data record is {data_len} bytes for {count} entries"
            )));
        }
        let mut data = vec![0u8; data_len as usize];
        io.file.read_exact_buf(&mut data)?;

        let entries = self.connection_indexes.entry(conn_id).or_default();
        for raw in data.chunks_exact(12) {
            entries.push(IndexEntry {
                time: Time::new(
                    u32::from_le_bytes(raw[0..4].try_into().unwrap()),
                    u32::from_le_bytes(raw[4..8].try_into().unwrap()),
                ),
                chunk_pos,
                offset: u32::from_le_bytes(raw[8..12].try_into().unwrap()),
            });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Legacy 1.2 reader
    // ------------------------------------------------------------------

    fn start_reading_102(&mut self) -> Result<()> {
        let file_length = self.io.get_mut().file.seek(SeekFrom::End(0))?;
        self.read_file_header_record()?;

        self.io
            .get_mut()
            .file
            .seek(SeekFrom::Start(self.index_data_pos))?;
        while self.io.get_mut().file.offset() < file_length {
            self.read_topic_index_record_102()?;
        }

        // The first entry of each topic index points at that topic's
        // message-definition record.
        let firsts: Vec<(u32, u64)> = self
            .connection_indexes
            .iter()
            .filter_map(|(id, entries)| entries.first().map(|e| (*id, e.chunk_pos)))
            .collect();
        for (conn_id, pos) in firsts {
            self.read_message_definition_record_102(conn_id, pos)?;
        }

        for entries in self.connection_indexes.values_mut() {
            entries.sort();
        }
        Ok(())
    }

    fn read_topic_index_record_102(&mut self) -> Result<()> {
        let io = self.io.get_mut();
        let header = record::read_header(&mut io.file)?;
        record::check_op(&header, OP_INDEX_DATA)?;
        let version = header.u32_field(VER_FIELD)?;
        if version != 0 {
            return Err(Error::Format(format!(
                "unsupported legacy index version {version}"
            )));
        }
        let topic = header.str_field(TOPIC_FIELD)?.to_string();
        let count = header.u32_field(COUNT_FIELD)?;

        let data_len = record::read_data_length(&mut io.file)?;
        if data_len != count * 16 {
            return Err(Error::Format(format!(
                "legacy index record is {data_len} bytes for {count} entries"
            )));
        }
        let mut data = vec![0u8; data_len as usize];
        io.file.read_exact_buf(&mut data)?;

        let conn_id = match self.topic_connection_ids.get(&topic) {
            Some(&id) => id,
            None => {
                // Legacy bags have no connection records; synthesize one per
                // topic. Descriptors are filled in from the definition record.
                let id = self.connections.len() as u32;
                self.topic_connection_ids.insert(topic.clone(), id);
                self.connections.insert(
                    id,
                    ConnectionInfo {
                        id,
                        topic,
                        datatype: String::new(),
                        md5sum: String::new(),
                        msg_def: String::new(),
                        header: HeaderMap::new(),
                    },
                );
                id
            }
        };

        let entries = self.connection_indexes.entry(conn_id).or_default();
        for raw in data.chunks_exact(16) {
            entries.push(IndexEntry {
                time: Time::new(
                    u32::from_le_bytes(raw[0..4].try_into().unwrap()),
                    u32::from_le_bytes(raw[4..8].try_into().unwrap()),
                ),
                chunk_pos: u64::from_le_bytes(raw[8..16].try_into().unwrap()),
                offset: 0,
            });
        }
        Ok(())
    }

    fn read_message_definition_record_102(&mut self, conn_id: u32, pos: u64) -> Result<()> {
        let io = self.io.get_mut();
        io.file.seek(SeekFrom::Start(pos))?;
        let header = record::read_header(&mut io.file)?;
        if header.op()? != OP_MSG_DEF {
            // Some legacy bags index straight into message data.
            return Ok(());
        }
        let datatype = header.str_field(TYPE_FIELD)?.to_string();
        let md5sum = header.str_field(MD5_FIELD_102)?.to_string();
        let msg_def = header.str_field(DEF_FIELD_102)?.to_string();
        if let Some(conn) = self.connections.get_mut(&conn_id) {
            conn.datatype = datatype;
            conn.md5sum = md5sum;
            conn.msg_def = msg_def;
        }
        Ok(())
    }

    /// Seek to a legacy message record, skipping any definition records in
    /// front of it, and load its payload into the record buffer.
    fn read_message_data_record_102(&self, pos: u64) -> Result<HeaderMap> {
        let io = &mut *self.io.borrow_mut();
        io.file.seek(SeekFrom::Start(pos))?;
        loop {
            let header = record::read_header(&mut io.file)?;
            let data_len = record::read_data_length(&mut io.file)?;
            match header.op()? {
                OP_MSG_DEF => {
                    io.file.seek(SeekFrom::Current(data_len as i64))?;
                }
                OP_MSG_DATA => {
                    io.record_buffer.set_size(data_len as usize);
                    io.file.read_exact_buf(io.record_buffer.as_mut_slice())?;
                    return Ok(header);
                }
                op => {
                    return Err(Error::Format(format!(
                        "expected message data record, found op {op:#04x}"
                    )))
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Chunk cache and message access
    // ------------------------------------------------------------------

    /// Ensure the chunk at `chunk_pos` is available in the decompress
    /// buffer. No-op when it is already cached; the chunk currently being
    /// written is served from its uncompressed mirror.
    fn decompress_chunk(&self, chunk_pos: u64) -> Result<()> {
        if let Some(chunk) = &self.curr_chunk {
            if chunk.info.pos == chunk_pos {
                let io = &mut *self.io.borrow_mut();
                io.decompress_buffer
                    .copy_from_slice(self.outgoing_chunk_buffer.as_slice());
                io.decompressed_chunk = None;
                return Ok(());
            }
        }

        let io = &mut *self.io.borrow_mut();
        if io.decompressed_chunk == Some(chunk_pos) {
            return Ok(());
        }

        io.file.seek(SeekFrom::Start(chunk_pos))?;
        let chunk_header = Self::read_chunk_header(&mut io.file)?;
        match chunk_header.compression {
            CompressionType::None => {
                self.encryptor
                    .decrypt_chunk(&chunk_header, &mut io.decompress_buffer, &mut io.file)?;
                if io.decompress_buffer.len() != chunk_header.uncompressed_size as usize {
                    return Err(Error::Codec(format!(
                        "uncompressed chunk is {} bytes, record says {}",
                        io.decompress_buffer.len(),
                        chunk_header.uncompressed_size
                    )));
                }
            }
            compression => {
                self.encryptor
                    .decrypt_chunk(&chunk_header, &mut io.chunk_buffer, &mut io.file)?;
                chunked_file::decompress_into(
                    compression,
                    io.chunk_buffer.as_slice(),
                    chunk_header.uncompressed_size as usize,
                    &mut io.decompress_buffer,
                )?;
            }
        }
        io.decompressed_chunk = Some(chunk_pos);
        io.chunk_loads += 1;
        Ok(())
    }

    /// Copy out the payload of the message at `entry`.
    pub(crate) fn read_message_data(&self, entry: &IndexEntry) -> Result<Bytes> {
        match self.version {
            VERSION_200 => {
                self.decompress_chunk(entry.chunk_pos)?;
                let io = self.io.borrow();
                let chunk = io.decompress_buffer.as_slice();
                let rec = record::parse_record_at(chunk, entry.offset as usize)?;
                record::check_op(&rec.header, OP_MSG_DATA)?;
                Ok(Bytes::copy_from_slice(rec.data(chunk)))
            }
            VERSION_102 => {
                self.read_message_data_record_102(entry.chunk_pos)?;
                let io = self.io.borrow();
                Ok(Bytes::copy_from_slice(io.record_buffer.as_slice()))
            }
            v => Err(Error::Format(format!("unhandled bag version {v}"))),
        }
    }

    /// Payload size of the message at `entry`, without copying it out.
    pub(crate) fn read_message_data_size(&self, entry: &IndexEntry) -> Result<u32> {
        match self.version {
            VERSION_200 => {
                self.decompress_chunk(entry.chunk_pos)?;
                let io = self.io.borrow();
                let chunk = io.decompress_buffer.as_slice();
                let rec = record::parse_record_at(chunk, entry.offset as usize)?;
                record::check_op(&rec.header, OP_MSG_DATA)?;
                Ok(rec.data_len as u32)
            }
            VERSION_102 => {
                self.read_message_data_record_102(entry.chunk_pos)?;
                Ok(self.io.borrow().record_buffer.len() as u32)
            }
            v => Err(Error::Format(format!("unhandled bag version {v}"))),
        }
    }

    // ------------------------------------------------------------------
    // Introspection for the view layer
    // ------------------------------------------------------------------

    pub(crate) fn bag_version(&self) -> u32 {
        self.version
    }

    pub(crate) fn connection(&self, id: u32) -> Option<&ConnectionInfo> {
        self.connections.get(&id)
    }

    pub(crate) fn connection_indexes(&self) -> &BTreeMap<u32, Vec<IndexEntry>> {
        &self.connection_indexes
    }

    pub(crate) fn chunk_infos(&self) -> &[ChunkInfo] {
        &self.chunks
    }
}

impl Drop for Bag {
    fn drop(&mut self) {
        // Errors surface from an explicit close; the destructor swallows them.
        let _ = self.close();
    }
}
