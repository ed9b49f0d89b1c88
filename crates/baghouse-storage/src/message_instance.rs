//! Message Handles
//!
//! A [`MessageInstance`] points into a bag: a connection reference plus the
//! index entry of one message. The handle itself is cheap; the payload is
//! only read (and its chunk only decompressed) when the handle is
//! materialized through [`data`](MessageInstance::data),
//! [`write_to`](MessageInstance::write_to), or
//! [`instantiate`](MessageInstance::instantiate).

use std::io::Write;

use bytes::Bytes;

use baghouse_core::record::{CALLERID_FIELD, LATCHING_FIELD};
use baghouse_core::{BagMessage, ConnectionInfo, HeaderMap, IndexEntry, Result, Time};

use crate::bag::Bag;

/// A lightweight reference to one recorded message.
#[derive(Clone, Copy)]
pub struct MessageInstance<'a> {
    bag: &'a Bag,
    connection: &'a ConnectionInfo,
    entry: IndexEntry,
}

impl<'a> MessageInstance<'a> {
    pub(crate) fn new(bag: &'a Bag, connection: &'a ConnectionInfo, entry: IndexEntry) -> Self {
        Self {
            bag,
            connection,
            entry,
        }
    }

    pub fn time(&self) -> Time {
        self.entry.time
    }

    pub fn topic(&self) -> &'a str {
        &self.connection.topic
    }

    pub fn datatype(&self) -> &'a str {
        &self.connection.datatype
    }

    pub fn md5sum(&self) -> &'a str {
        &self.connection.md5sum
    }

    pub fn message_definition(&self) -> &'a str {
        &self.connection.msg_def
    }

    pub fn connection_header(&self) -> &'a HeaderMap {
        &self.connection.header
    }

    pub fn caller_id(&self) -> Option<&'a str> {
        self.connection
            .header
            .get(CALLERID_FIELD)
            .and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn is_latching(&self) -> bool {
        self.connection.header.get(LATCHING_FIELD) == Some(b"1".as_slice())
    }

    /// Copy out the raw payload bytes.
    pub fn data(&self) -> Result<Bytes> {
        self.bag.read_message_data(&self.entry)
    }

    /// Size of the raw payload in bytes.
    pub fn size(&self) -> Result<u32> {
        self.bag.read_message_data_size(&self.entry)
    }

    /// Copy the raw payload into `writer`.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        let data = self.data()?;
        writer.write_all(&data)?;
        Ok(())
    }

    /// Decode the payload as `T`. Returns `None` when the recorded md5sum
    /// does not match `T`'s (the `"*"` wildcard matches anything).
    pub fn instantiate<T: BagMessage>(&self) -> Result<Option<T>> {
        if !T::matches(&self.connection.md5sum) {
            return Ok(None);
        }
        let data = self.data()?;
        T::decode(&data).map(Some)
    }
}

impl std::fmt::Debug for MessageInstance<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageInstance")
            .field("topic", &self.topic())
            .field("time", &self.time())
            .field("datatype", &self.datatype())
            .finish()
    }
}
