//! Record Header Fields
//!
//! Every record in a bag file carries a header: a set of `name=value` entries
//! where the name is ASCII and the value is opaque bytes. On disk each field
//! is a little-endian u32 length followed by the `name=value` bytes, and the
//! whole set is prefixed with a little-endian u32 total length.
//!
//! `HeaderMap` is the in-memory form. Field order on disk is unspecified,
//! except that the `op` discriminator is emitted first so readers can
//! dispatch on the record kind without scanning the full header.
//!
//! Fixed-width values (`u32`, `u64`, times) are stored little-endian; the
//! typed accessors reject values of the wrong width.

use std::collections::BTreeMap;

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::record::OP_FIELD;
use crate::time::Time;

/// An ordered `name -> value` field set for one record header.
///
/// Ordering and equality are derived from the underlying map so a `HeaderMap`
/// can itself be used as a lookup key (the writer keys connection identity on
/// the caller-supplied connection header).
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HeaderMap {
    fields: BTreeMap<String, Vec<u8>>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.fields.get(name).map(|v| v.as_slice())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.fields.insert(name.into(), value.into());
    }

    pub fn put_u8(&mut self, name: &str, value: u8) {
        self.insert(name, vec![value]);
    }

    pub fn put_u32(&mut self, name: &str, value: u32) {
        self.insert(name, value.to_le_bytes().to_vec());
    }

    pub fn put_u64(&mut self, name: &str, value: u64) {
        self.insert(name, value.to_le_bytes().to_vec());
    }

    pub fn put_time(&mut self, name: &str, value: Time) {
        let mut bytes = Vec::with_capacity(8);
        bytes.extend_from_slice(&value.sec.to_le_bytes());
        bytes.extend_from_slice(&value.nsec.to_le_bytes());
        self.insert(name, bytes);
    }

    pub fn put_str(&mut self, name: &str, value: &str) {
        self.insert(name, value.as_bytes().to_vec());
    }

    fn required(&self, name: &str) -> Result<&[u8]> {
        self.get(name)
            .ok_or_else(|| Error::Format(format!("missing required field '{name}'")))
    }

    fn fixed_width<const N: usize>(&self, name: &str) -> Result<[u8; N]> {
        let value = self.required(name)?;
        value.try_into().map_err(|_| {
            Error::Format(format!(
                "field '{name}' has length {}, expected {N}",
                value.len()
            ))
        })
    }

    pub fn u8_field(&self, name: &str) -> Result<u8> {
        Ok(self.fixed_width::<1>(name)?[0])
    }

    pub fn u32_field(&self, name: &str) -> Result<u32> {
        Ok(u32::from_le_bytes(self.fixed_width::<4>(name)?))
    }

    pub fn u64_field(&self, name: &str) -> Result<u64> {
        Ok(u64::from_le_bytes(self.fixed_width::<8>(name)?))
    }

    pub fn time_field(&self, name: &str) -> Result<Time> {
        let raw = self.fixed_width::<8>(name)?;
        Ok(Time::new(
            u32::from_le_bytes(raw[0..4].try_into().unwrap()),
            u32::from_le_bytes(raw[4..8].try_into().unwrap()),
        ))
    }

    pub fn str_field(&self, name: &str) -> Result<&str> {
        let value = self.required(name)?;
        std::str::from_utf8(value)
            .map_err(|_| Error::Format(format!("field '{name}' is not valid UTF-8")))
    }

    pub fn opt_str_field(&self, name: &str) -> Result<Option<&str>> {
        match self.get(name) {
            None => Ok(None),
            Some(value) => std::str::from_utf8(value)
                .map(Some)
                .map_err(|_| Error::Format(format!("field '{name}' is not valid UTF-8"))),
        }
    }

    /// The 1-byte record opcode.
    pub fn op(&self) -> Result<u8> {
        self.u8_field(OP_FIELD)
    }

    /// Encoded length of the field set, excluding the u32 length prefix.
    pub fn encoded_len(&self) -> usize {
        self.fields
            .iter()
            .map(|(name, value)| 4 + name.len() + 1 + value.len())
            .sum()
    }

    /// Append `u32 total_len` plus the fields. The `op` field, if present,
    /// is written first.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.encoded_len() as u32);
        if let Some(op) = self.fields.get(OP_FIELD) {
            encode_field(buf, OP_FIELD, op);
        }
        for (name, value) in &self.fields {
            if name == OP_FIELD {
                continue;
            }
            encode_field(buf, name, value);
        }
    }

    /// Parse a field region (the bytes following the u32 length prefix).
    pub fn decode(data: &[u8]) -> Result<HeaderMap> {
        let mut fields = BTreeMap::new();
        let mut pos = 0usize;
        while pos < data.len() {
            if pos + 4 > data.len() {
                return Err(Error::Format("truncated header field length".to_string()));
            }
            let field_len =
                u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap()) as usize;
            pos += 4;
            if pos + field_len > data.len() {
                return Err(Error::Format("truncated header field".to_string()));
            }
            let field = &data[pos..pos + field_len];
            pos += field_len;

            let sep = field
                .iter()
                .position(|&b| b == b'=')
                .ok_or_else(|| Error::Format("header field without '='".to_string()))?;
            let name = std::str::from_utf8(&field[..sep])
                .map_err(|_| Error::Format("header field name is not ASCII".to_string()))?;
            if !name.is_ascii() {
                return Err(Error::Format("header field name is not ASCII".to_string()));
            }
            let value = field[sep + 1..].to_vec();
            if fields.insert(name.to_string(), value).is_some() {
                return Err(Error::Format(format!("duplicate header field '{name}'")));
            }
        }
        Ok(HeaderMap { fields })
    }
}

fn encode_field(buf: &mut BytesMut, name: &str, value: &[u8]) {
    buf.put_u32_le((name.len() + 1 + value.len()) as u32);
    buf.put_slice(name.as_bytes());
    buf.put_u8(b'=');
    buf.put_slice(value);
}
