//! Chunked File I/O
//!
//! `ChunkedFile` wraps the underlying bag file and layers a *write stream*
//! over it while a chunk is open. Writes outside a stream, reads, and seeks
//! go straight to the file. Once `set_write_mode` opens a stream, writes are
//! routed by codec:
//!
//! - `none` streams straight through, counting bytes;
//! - `bz2` / `lz4` buffer the uncompressed payload and emit one compressed
//!   block when `stop_write` closes the stream.
//!
//! `stop_write` reports `(compressed_size, uncompressed_size)` so the engine
//! can patch the chunk record it wrote ahead of the data. The file offset is
//! tracked locally; the engine is responsible for seeking back to the end of
//! the file before writing, since reads may move the position arbitrarily.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use baghouse_core::{Buffer, CompressionType, Error, Result};

use crate::bag::BagMode;

enum WriteStream {
    Idle,
    Raw { uncompressed: u64 },
    Block { compression: CompressionType, data: Vec<u8> },
}

pub struct ChunkedFile {
    file: File,
    offset: u64,
    stream: WriteStream,
}

impl ChunkedFile {
    pub fn open(path: &Path, mode: BagMode) -> Result<Self> {
        let file = match mode {
            BagMode::Write => OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)?,
            BagMode::Read => OpenOptions::new().read(true).open(path)?,
            BagMode::Append => OpenOptions::new().read(true).write(true).open(path)?,
        };
        Ok(Self {
            file,
            offset: 0,
            stream: WriteStream::Idle,
        })
    }

    /// Current absolute position in the underlying file.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn is_writing(&self) -> bool {
        !matches!(self.stream, WriteStream::Idle)
    }

    /// Open a write stream for one chunk.
    pub fn set_write_mode(&mut self, compression: CompressionType) -> Result<()> {
        if self.is_writing() {
            return Err(Error::InvalidArgument(
                "a chunk write stream is already open".to_string(),
            ));
        }
        self.stream = match compression {
            CompressionType::None => WriteStream::Raw { uncompressed: 0 },
            c => WriteStream::Block {
                compression: c,
                data: Vec::new(),
            },
        };
        Ok(())
    }

    /// Write bytes, through the open stream if there is one.
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        match &mut self.stream {
            WriteStream::Idle => {
                self.file.write_all(bytes)?;
                self.offset += bytes.len() as u64;
            }
            WriteStream::Raw { uncompressed } => {
                self.file.write_all(bytes)?;
                self.offset += bytes.len() as u64;
                *uncompressed += bytes.len() as u64;
            }
            WriteStream::Block { data, .. } => {
                data.extend_from_slice(bytes);
            }
        }
        Ok(())
    }

    /// Close the write stream, flushing any buffered block to the file.
    /// Returns `(compressed_size, uncompressed_size)`.
    pub fn stop_write(&mut self) -> Result<(u32, u32)> {
        match std::mem::replace(&mut self.stream, WriteStream::Idle) {
            WriteStream::Idle => Err(Error::InvalidArgument(
                "no chunk write stream is open".to_string(),
            )),
            WriteStream::Raw { uncompressed } => Ok((uncompressed as u32, uncompressed as u32)),
            WriteStream::Block { compression, data } => {
                let compressed = compress(compression, &data)?;
                self.file.write_all(&compressed)?;
                self.offset += compressed.len() as u64;
                Ok((compressed.len() as u32, data.len() as u32))
            }
        }
    }

    /// Uncompressed bytes fed into the open write stream so far.
    pub fn uncompressed_in(&self) -> u64 {
        match &self.stream {
            WriteStream::Idle => 0,
            WriteStream::Raw { uncompressed } => *uncompressed,
            WriteStream::Block { data, .. } => data.len() as u64,
        }
    }

    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.offset = self.file.seek(pos)?;
        Ok(self.offset)
    }

    pub fn read_exact_buf(&mut self, buf: &mut [u8]) -> Result<()> {
        self.file.read_exact(buf)?;
        self.offset += buf.len() as u64;
        Ok(())
    }

    pub fn truncate(&mut self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        if self.offset > len {
            self.seek(SeekFrom::Start(len))?;
        }
        Ok(())
    }
}

impl Read for ChunkedFile {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.file.read(buf)?;
        self.offset += n as u64;
        Ok(n)
    }
}

fn codec_err(e: impl std::fmt::Display) -> Error {
    Error::Codec(e.to_string())
}

fn compress(compression: CompressionType, data: &[u8]) -> Result<Vec<u8>> {
    match compression {
        CompressionType::None => Ok(data.to_vec()),
        CompressionType::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
        CompressionType::Bz2 => {
            let mut encoder =
                bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
            encoder.write_all(data).map_err(codec_err)?;
            encoder.finish().map_err(codec_err)
        }
    }
}

/// Decompress a chunk body into `out`, which ends up exactly `expected`
/// bytes long. The declared uncompressed size comes from the chunk record
/// header; any disagreement is treated as corruption.
pub(crate) fn decompress_into(
    compression: CompressionType,
    src: &[u8],
    expected: usize,
    out: &mut Buffer,
) -> Result<()> {
    out.set_size(expected);
    match compression {
        CompressionType::None => {
            if src.len() != expected {
                return Err(Error::Codec(format!(
                    "uncompressed chunk is {} bytes, expected {expected}",
                    src.len()
                )));
            }
            out.as_mut_slice().copy_from_slice(src);
        }
        CompressionType::Lz4 => {
            if src.len() < 4 {
                return Err(Error::Codec("lz4 chunk too short".to_string()));
            }
            let stated = u32::from_le_bytes(src[0..4].try_into().unwrap()) as usize;
            if stated != expected {
                return Err(Error::Codec(format!(
                    "lz4 chunk declares {stated} bytes, chunk record says {expected}"
                )));
            }
            let written =
                lz4_flex::block::decompress_into(&src[4..], out.as_mut_slice()).map_err(codec_err)?;
            if written != expected {
                return Err(Error::Codec(format!(
                    "lz4 chunk decompressed to {written} bytes, expected {expected}"
                )));
            }
        }
        CompressionType::Bz2 => {
            let mut decoder = bzip2::read::BzDecoder::new(src);
            decoder.read_exact(out.as_mut_slice()).map_err(codec_err)?;
            let mut probe = [0u8; 1];
            let extra = decoder.read(&mut probe).map_err(codec_err)?;
            if extra != 0 {
                return Err(Error::Codec(format!(
                    "bz2 chunk decompressed past the declared {expected} bytes"
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_for_write(dir: &tempfile::TempDir) -> ChunkedFile {
        ChunkedFile::open(&dir.path().join("chunks.bin"), BagMode::Write).unwrap()
    }

    #[test]
    fn test_raw_stream_counts_and_passes_through() {
        let dir = tempdir().unwrap();
        let mut file = open_for_write(&dir);

        file.write(b"head").unwrap();
        file.set_write_mode(CompressionType::None).unwrap();
        file.write(b"hello ").unwrap();
        file.write(b"world").unwrap();
        assert_eq!(file.uncompressed_in(), 11);

        let (compressed, uncompressed) = file.stop_write().unwrap();
        assert_eq!((compressed, uncompressed), (11, 11));
        assert_eq!(file.offset(), 15);

        file.seek(SeekFrom::Start(4)).unwrap();
        let mut back = [0u8; 11];
        file.read_exact_buf(&mut back).unwrap();
        assert_eq!(&back, b"hello world");
    }

    #[test]
    fn test_block_stream_defers_until_stop() {
        let dir = tempdir().unwrap();
        let mut file = open_for_write(&dir);

        file.set_write_mode(CompressionType::Lz4).unwrap();
        file.write(&[0xAB; 4096]).unwrap();
        assert_eq!(file.uncompressed_in(), 4096);
        // Nothing on disk until the stream closes.
        assert_eq!(file.offset(), 0);

        let (compressed, uncompressed) = file.stop_write().unwrap();
        assert_eq!(uncompressed, 4096);
        assert!(compressed < uncompressed);
        assert_eq!(file.offset(), compressed as u64);
    }

    #[test]
    fn test_set_write_mode_twice_fails() {
        let dir = tempdir().unwrap();
        let mut file = open_for_write(&dir);
        file.set_write_mode(CompressionType::None).unwrap();
        assert!(matches!(
            file.set_write_mode(CompressionType::Lz4),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_stop_write_without_stream_fails() {
        let dir = tempdir().unwrap();
        let mut file = open_for_write(&dir);
        assert!(matches!(
            file.stop_write(),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_truncate_clamps_offset() {
        let dir = tempdir().unwrap();
        let mut file = open_for_write(&dir);
        file.write(&[1u8; 100]).unwrap();
        file.truncate(40).unwrap();
        assert_eq!(file.offset(), 40);
        assert_eq!(file.seek(SeekFrom::End(0)).unwrap(), 40);
    }

    #[test]
    fn test_open_append_missing_file_fails() {
        let dir = tempdir().unwrap();
        let result = ChunkedFile::open(&dir.path().join("absent.bag"), BagMode::Append);
        assert!(matches!(result, Err(Error::Io(_))));
    }

    // ---------------------------------------------------------------
    // Codec round-trips
    // ---------------------------------------------------------------

    #[test]
    fn test_decompress_roundtrip_all_codecs() {
        let payload: Vec<u8> = (0..10_000).map(|i| (i % 251) as u8).collect();
        for compression in [
            CompressionType::None,
            CompressionType::Bz2,
            CompressionType::Lz4,
        ] {
            let compressed = compress(compression, &payload).unwrap();
            let mut out = Buffer::new();
            decompress_into(compression, &compressed, payload.len(), &mut out).unwrap();
            assert_eq!(out.as_slice(), &payload[..], "codec {compression}");
        }
    }

    #[test]
    fn test_decompress_size_mismatch_is_codec_error() {
        let payload = vec![7u8; 256];
        for compression in [CompressionType::Bz2, CompressionType::Lz4] {
            let compressed = compress(compression, &payload).unwrap();
            let mut out = Buffer::new();
            let err = decompress_into(compression, &compressed, 100, &mut out).unwrap_err();
            assert!(matches!(err, Error::Codec(_)), "codec {compression}");
        }
    }

    #[test]
    fn test_decompress_garbage_is_codec_error() {
        let garbage = vec![0x5Au8; 64];
        let mut out = Buffer::new();
        assert!(matches!(
            decompress_into(CompressionType::Bz2, &garbage, 128, &mut out),
            Err(Error::Codec(_))
        ));
    }
}
