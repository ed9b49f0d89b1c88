//! Encryptor Plugins
//!
//! A bag may encrypt its chunks and its file-level record headers. The engine
//! stays codec-agnostic: it drives the hooks on an [`Encryptor`] at the
//! points where bytes cross between the record codec and the file.
//!
//! Plugins are looked up by name through a registration table. The writer
//! selects one with `Bag::set_encryptor_plugin`; the reader recovers the name
//! from the `encryptor` field of the file header and instantiates the same
//! plugin, so any non-trivial plugin MUST contribute that field in
//! `add_fields_to_file_header`.
//!
//! The built-in [`NoEncryptor`] (name `"none"`) forwards chunks and headers
//! unchanged and contributes no file-header fields.

use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

use baghouse_core::record;
use baghouse_core::{Buffer, ChunkHeader, Error, HeaderMap, Result};

use crate::chunked_file::ChunkedFile;

/// Hook set for encrypting a bag.
///
/// Chunk hooks work on the compressed chunk body; header hooks wrap the
/// file-level record headers written outside chunks (the trailing connection
/// records). Records inside a chunk are covered by the chunk hooks.
pub trait Encryptor {
    /// Called once when the plugin is selected for writing.
    fn initialize(&mut self, param: &str) -> Result<()>;

    /// Re-read the just-written chunk body at `chunk_data_pos`, encrypt it,
    /// write it back in place, and return the encrypted size.
    fn encrypt_chunk(
        &mut self,
        chunk_size: u32,
        chunk_data_pos: u64,
        file: &mut ChunkedFile,
    ) -> Result<u32>;

    /// Read the encrypted chunk body at the current file position into
    /// `decrypted` (the compressed-but-no-longer-encrypted bytes).
    fn decrypt_chunk(
        &self,
        chunk_header: &ChunkHeader,
        decrypted: &mut Buffer,
        file: &mut ChunkedFile,
    ) -> Result<()>;

    /// Contribute plugin state to the bag file header.
    fn add_fields_to_file_header(&self, fields: &mut HeaderMap) -> Result<()>;

    /// Recover plugin state from the bag file header.
    fn read_fields_from_file_header(&mut self, fields: &HeaderMap) -> Result<()>;

    /// Write one record header, encrypted.
    fn write_encrypted_header(&self, fields: &HeaderMap, file: &mut ChunkedFile) -> Result<()>;

    /// Read back one record header written by `write_encrypted_header`.
    fn read_encrypted_header(&self, file: &mut ChunkedFile) -> Result<HeaderMap>;
}

impl std::fmt::Debug for dyn Encryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Encryptor")
    }
}

/// Pass-through plugin: plaintext chunks and headers.
#[derive(Debug, Default)]
pub struct NoEncryptor;

impl Encryptor for NoEncryptor {
    fn initialize(&mut self, _param: &str) -> Result<()> {
        Ok(())
    }

    fn encrypt_chunk(
        &mut self,
        chunk_size: u32,
        _chunk_data_pos: u64,
        _file: &mut ChunkedFile,
    ) -> Result<u32> {
        Ok(chunk_size)
    }

    fn decrypt_chunk(
        &self,
        chunk_header: &ChunkHeader,
        decrypted: &mut Buffer,
        file: &mut ChunkedFile,
    ) -> Result<()> {
        decrypted.set_size(chunk_header.compressed_size as usize);
        file.read_exact_buf(decrypted.as_mut_slice())
    }

    fn add_fields_to_file_header(&self, _fields: &mut HeaderMap) -> Result<()> {
        Ok(())
    }

    fn read_fields_from_file_header(&mut self, _fields: &HeaderMap) -> Result<()> {
        Ok(())
    }

    fn write_encrypted_header(&self, fields: &HeaderMap, file: &mut ChunkedFile) -> Result<()> {
        let mut buf = bytes::BytesMut::new();
        record::encode_header(&mut buf, fields);
        file.write(&buf)
    }

    fn read_encrypted_header(&self, file: &mut ChunkedFile) -> Result<HeaderMap> {
        record::read_header(file)
    }
}

/// Name of the built-in pass-through plugin.
pub const NO_ENCRYPTION: &str = "none";

pub type EncryptorFactory = fn() -> Box<dyn Encryptor>;

fn registry() -> &'static RwLock<HashMap<String, EncryptorFactory>> {
    static REGISTRY: OnceLock<RwLock<HashMap<String, EncryptorFactory>>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut map: HashMap<String, EncryptorFactory> = HashMap::new();
        map.insert(NO_ENCRYPTION.to_string(), || Box::new(NoEncryptor));
        RwLock::new(map)
    })
}

/// Register an encryptor plugin under `name`, replacing any previous
/// registration.
pub fn register_encryptor(name: impl Into<String>, factory: EncryptorFactory) {
    let mut map = registry().write().unwrap_or_else(|e| e.into_inner());
    map.insert(name.into(), factory);
}

/// Instantiate the plugin registered under `name`. The empty string selects
/// the pass-through plugin.
pub(crate) fn create_encryptor(name: &str) -> Result<Box<dyn Encryptor>> {
    let name = if name.is_empty() { NO_ENCRYPTION } else { name };
    let map = registry().read().unwrap_or_else(|e| e.into_inner());
    match map.get(name) {
        Some(factory) => Ok(factory()),
        None => Err(Error::InvalidArgument(format!(
            "unknown encryptor plugin '{name}'"
        ))),
    }
}
