//! Record Framing
//!
//! Every on-disk unit in a bag is a record:
//!
//! ```text
//! ┌────────────────┬──────────────┬──────────────┬────────────┐
//! │ header_len u32 │ header bytes │ data_len u32 │ data bytes │
//! └────────────────┴──────────────┴──────────────┴────────────┘
//! ```
//!
//! All integers are little-endian. The header is a [`HeaderMap`] whose `op`
//! field discriminates the record kind. This module holds the opcode and
//! field-name constants plus the framing primitives used by both the file
//! reader (streaming, `io::Read`) and the chunk reader (slicing a
//! decompressed buffer).

use std::io::Read;

use bytes::{BufMut, BytesMut};

use crate::error::{Error, Result};
use crate::header::HeaderMap;

/// Magic line opening a current-format bag.
pub const BAG_MAGIC_V2: &[u8; 13] = b"#ROSBAG V2.0\n";
/// Magic line opening a legacy bag.
pub const BAG_MAGIC_V1: &[u8; 13] = b"#ROSBAG V1.2\n";

/// Version encoded as `major * 100 + minor`.
pub const VERSION_200: u32 = 200;
pub const VERSION_102: u32 = 102;

/// Total on-disk length of the file-header record, padding included.
pub const FILE_HEADER_LENGTH: u32 = 4096;

// Record opcodes.
pub const OP_MSG_DEF: u8 = 0x01; // legacy 1.2 message definition
pub const OP_MSG_DATA: u8 = 0x02;
pub const OP_FILE_HEADER: u8 = 0x03;
pub const OP_INDEX_DATA: u8 = 0x04;
pub const OP_CHUNK: u8 = 0x05;
pub const OP_CHUNK_INFO: u8 = 0x06;
pub const OP_CONNECTION: u8 = 0x07;

// Header field names.
pub const OP_FIELD: &str = "op";
pub const TOPIC_FIELD: &str = "topic";
pub const CONNECTION_FIELD: &str = "conn";
pub const TIME_FIELD: &str = "time";
pub const VER_FIELD: &str = "ver";
pub const COUNT_FIELD: &str = "count";
pub const INDEX_POS_FIELD: &str = "index_pos";
pub const CONNECTION_COUNT_FIELD: &str = "conn_count";
pub const CHUNK_COUNT_FIELD: &str = "chunk_count";
pub const COMPRESSION_FIELD: &str = "compression";
pub const SIZE_FIELD: &str = "size";
pub const CHUNK_POS_FIELD: &str = "chunk_pos";
pub const START_TIME_FIELD: &str = "start_time";
pub const END_TIME_FIELD: &str = "end_time";
pub const ENCRYPTOR_FIELD: &str = "encryptor";

// Connection-header field names.
pub const TYPE_FIELD: &str = "type";
pub const MD5_FIELD: &str = "md5sum";
pub const MESSAGE_DEFINITION_FIELD: &str = "message_definition";
pub const CALLERID_FIELD: &str = "callerid";
pub const LATCHING_FIELD: &str = "latching";

// Legacy 1.2 field names.
pub const MD5_FIELD_102: &str = "md5";
pub const DEF_FIELD_102: &str = "def";

/// Version stamp carried by index-data records.
pub const INDEX_VERSION: u32 = 1;
/// Version stamp carried by chunk-info records.
pub const CHUNK_INFO_VERSION: u32 = 1;

/// Refuse absurd length prefixes instead of attempting the allocation.
const MAX_REGION_LEN: u32 = 1 << 28;

/// Append `u32 header_len` + header fields.
pub fn encode_header(buf: &mut BytesMut, header: &HeaderMap) {
    header.encode(buf);
}

/// Append a complete record: header, `u32 data_len`, data.
pub fn encode_record(buf: &mut BytesMut, header: &HeaderMap, data: &[u8]) {
    header.encode(buf);
    buf.put_u32_le(data.len() as u32);
    buf.put_slice(data);
}

fn read_exact<R: Read>(reader: &mut R, len: usize, what: &str) -> Result<Vec<u8>> {
    let mut bytes = vec![0u8; len];
    reader
        .read_exact(&mut bytes)
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => Error::Format(format!("truncated {what}")),
            _ => Error::Io(e),
        })?;
    Ok(bytes)
}

/// Read a little-endian u32 length prefix.
pub fn read_u32<R: Read>(reader: &mut R) -> Result<u32> {
    let bytes = read_exact(reader, 4, "length prefix")?;
    Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
}

/// Read `u32 header_len` + header fields from a stream.
pub fn read_header<R: Read>(reader: &mut R) -> Result<HeaderMap> {
    let header_len = read_u32(reader)?;
    if header_len > MAX_REGION_LEN {
        return Err(Error::Format(format!(
            "implausible header length {header_len}"
        )));
    }
    let bytes = read_exact(reader, header_len as usize, "record header")?;
    HeaderMap::decode(&bytes)
}

/// Read the `u32 data_len` that follows a record header.
pub fn read_data_length<R: Read>(reader: &mut R) -> Result<u32> {
    let data_len = read_u32(reader)?;
    if data_len > MAX_REGION_LEN {
        return Err(Error::Format(format!("implausible data length {data_len}")));
    }
    Ok(data_len)
}

/// A record located inside an in-memory buffer.
#[derive(Debug)]
pub struct RawRecord {
    pub header: HeaderMap,
    /// Absolute offset of the data bytes within the buffer.
    pub data_offset: usize,
    pub data_len: usize,
}

impl RawRecord {
    pub fn data<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        &buf[self.data_offset..self.data_offset + self.data_len]
    }
}

/// Parse a full record starting at `offset` inside `buf`.
pub fn parse_record_at(buf: &[u8], offset: usize) -> Result<RawRecord> {
    let read_len = |pos: usize| -> Result<usize> {
        let end = pos
            .checked_add(4)
            .filter(|&e| e <= buf.len())
            .ok_or_else(|| Error::Format("record extends past end of buffer".to_string()))?;
        Ok(u32::from_le_bytes(buf[pos..end].try_into().unwrap()) as usize)
    };

    let header_len = read_len(offset)?;
    let header_start = offset + 4;
    let header_end = header_start
        .checked_add(header_len)
        .filter(|&e| e <= buf.len())
        .ok_or_else(|| Error::Format("record header extends past end of buffer".to_string()))?;
    let header = HeaderMap::decode(&buf[header_start..header_end])?;

    let data_len = read_len(header_end)?;
    let data_offset = header_end + 4;
    if data_offset + data_len > buf.len() {
        return Err(Error::Format(
            "record data extends past end of buffer".to_string(),
        ));
    }

    Ok(RawRecord {
        header,
        data_offset,
        data_len,
    })
}

/// Verify that `header` carries the expected opcode.
pub fn check_op(header: &HeaderMap, expected: u8) -> Result<()> {
    let op = header.op()?;
    if op != expected {
        return Err(Error::Format(format!(
            "unexpected op {op:#04x}, expected {expected:#04x}"
        )));
    }
    Ok(())
}
