use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::sync::Arc;

use crate::error::DecodeError;
use crate::log_site::{LogSiteMetadata, Severity};
use crate::packer::{ArgType, ByteReader};

/// On-disk container format.
///
/// ```text
/// header  = magic "NLOG" | version u16 | cycles_per_second u64
/// block   = block_type u8 | payload_length u32 | payload
/// dict    = { site_id u32 | severity u8 | arg_types run | format run | location run }*
/// data    = uncompressed_length u32 | lz4 block
/// record  = site_id u32 | timestamp u64 | thread_id u32 | packed_args run
/// ```
///
/// All integers are little-endian; a "run" is a `u32` length followed by
/// that many bytes.

pub const MAGIC: [u8; 4] = *b"NLOG";
pub const FORMAT_VERSION: u16 = 1;
pub const HEADER_LEN: usize = 4 + 2 + 8;
pub const BLOCK_HEADER_LEN: usize = 1 + 4;
/// Fixed part of a record, before the packed argument bytes.
pub const RECORD_HEADER_LEN: usize = 4 + 8 + 4 + 4;

/// Upper bound on a data block's declared uncompressed size; anything larger
/// is treated as corruption rather than allocated.
pub const MAX_DECOMPRESSED_BLOCK: usize = 256 << 20;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    Dictionary = 1,
    Data = 2,
}

impl BlockType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(BlockType::Dictionary),
            2 => Some(BlockType::Data),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub version: u16,
    pub cycles_per_second: u64,
}

impl FileHeader {
    pub fn new(cycles_per_second: u64) -> Self {
        Self {
            version: FORMAT_VERSION,
            cycles_per_second,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..4].copy_from_slice(&MAGIC);
        out[4..6].copy_from_slice(&self.version.to_le_bytes());
        out[6..].copy_from_slice(&self.cycles_per_second.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = ByteReader::new(bytes);
        let magic = reader.read_bytes(4).ok_or(DecodeError::TruncatedHeader)?;
        if magic != &MAGIC[..] {
            let mut found = [0u8; 4];
            found.copy_from_slice(magic);
            return Err(DecodeError::BadMagic(found));
        }
        let version = reader.read_u16().ok_or(DecodeError::TruncatedHeader)?;
        if version != FORMAT_VERSION {
            return Err(DecodeError::UnsupportedVersion(version));
        }
        let cycles_per_second = reader.read_u64().ok_or(DecodeError::TruncatedHeader)?;
        Ok(Self {
            version,
            cycles_per_second,
        })
    }
}

/// Destination for container bytes.
///
/// `persist` must not return until everything written so far would survive
/// a crash of this process (and, for files, of the machine).
pub trait Storage: Write + Send {
    fn persist(&mut self) -> io::Result<()>;
}

impl Storage for File {
    fn persist(&mut self) -> io::Result<()> {
        self.sync_data()
    }
}

impl<W: Storage> Storage for BufWriter<W> {
    fn persist(&mut self) -> io::Result<()> {
        self.flush()?;
        self.get_mut().persist()
    }
}

impl Storage for Vec<u8> {
    fn persist(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<S: Storage + ?Sized> Storage for Box<S> {
    fn persist(&mut self) -> io::Result<()> {
        (**self).persist()
    }
}

/// Appends blocks to a container. Owned by the background writer thread.
pub struct ContainerWriter<S: Storage> {
    storage: S,
    bytes_written: u64,
    uncompressed_bytes: u64,
    compressed_bytes: u64,
    scratch: Vec<u8>,
}

impl<S: Storage> ContainerWriter<S> {
    /// Writes the file header and returns a writer positioned after it.
    pub fn create(mut storage: S, cycles_per_second: u64) -> io::Result<Self> {
        storage.write_all(&FileHeader::new(cycles_per_second).encode())?;
        Ok(Self {
            storage,
            bytes_written: HEADER_LEN as u64,
            uncompressed_bytes: 0,
            compressed_bytes: 0,
            scratch: Vec::new(),
        })
    }

    fn write_block(&mut self, block_type: BlockType, payload: &[u8]) -> io::Result<()> {
        let len = u32::try_from(payload.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "block payload exceeds 4 GiB"))?;
        let mut header = [0u8; BLOCK_HEADER_LEN];
        header[0] = block_type as u8;
        header[1..].copy_from_slice(&len.to_le_bytes());
        self.storage.write_all(&header)?;
        self.storage.write_all(payload)?;
        self.bytes_written += (BLOCK_HEADER_LEN + payload.len()) as u64;
        Ok(())
    }

    /// Writes dictionary entries for newly seen sites. A no-op for an empty
    /// slice.
    pub fn append_dictionary_block(&mut self, entries: &[Arc<LogSiteMetadata>]) -> io::Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut payload = std::mem::take(&mut self.scratch);
        payload.clear();
        for entry in entries {
            encode_dictionary_entry(entry, &mut payload);
        }
        let result = self.write_block(BlockType::Dictionary, &payload);
        self.scratch = payload;
        result
    }

    /// Compresses the concatenated encoded records and writes one data block.
    pub fn append_data_block(&mut self, records: &[u8]) -> io::Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let compressed = lz4_flex::compress_prepend_size(records);
        self.write_block(BlockType::Data, &compressed)?;
        self.uncompressed_bytes += records.len() as u64;
        self.compressed_bytes += compressed.len() as u64;
        Ok(())
    }

    /// Pushes buffered bytes to the underlying storage.
    pub fn flush(&mut self) -> io::Result<()> {
        self.storage.flush()
    }

    /// Flushes and waits for the storage to make everything durable.
    pub fn persist(&mut self) -> io::Result<()> {
        self.storage.flush()?;
        self.storage.persist()
    }

    /// Total container bytes, header included.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn uncompressed_bytes(&self) -> u64 {
        self.uncompressed_bytes
    }

    pub fn compressed_bytes(&self) -> u64 {
        self.compressed_bytes
    }

    pub fn into_inner(self) -> S {
        self.storage
    }
}

fn push_run(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
}

pub fn encode_dictionary_entry(meta: &LogSiteMetadata, out: &mut Vec<u8>) {
    out.extend_from_slice(&meta.id.to_le_bytes());
    out.push(meta.severity as u8);
    let tags: Vec<u8> = meta.arg_types.iter().map(|t| *t as u8).collect();
    push_run(out, &tags);
    push_run(out, meta.format_string.as_bytes());
    push_run(out, meta.source_location.as_bytes());
}

/// Parses a whole dictionary payload. Fails on the first malformed entry.
pub fn decode_dictionary_payload(payload: &[u8]) -> Result<Vec<LogSiteMetadata>, String> {
    let mut reader = ByteReader::new(payload);
    let mut entries = Vec::new();

    while reader.remaining() > 0 {
        let at = reader.position();
        let truncated = || format!("dictionary entry at payload offset {} is truncated", at);

        let id = reader.read_u32().ok_or_else(truncated)?;
        let severity_raw = reader.read_u8().ok_or_else(truncated)?;
        let severity = Severity::from_u8(severity_raw)
            .ok_or_else(|| format!("site {} has unknown severity {}", id, severity_raw))?;
        let tags = reader.read_run().ok_or_else(truncated)?;
        let arg_types = tags
            .iter()
            .map(|&tag| ArgType::from_u8(tag).ok_or_else(|| format!("site {} has unknown argument tag {}", id, tag)))
            .collect::<Result<Vec<_>, _>>()?;
        let format_string = String::from_utf8_lossy(reader.read_run().ok_or_else(truncated)?).into_owned();
        let source_location = String::from_utf8_lossy(reader.read_run().ok_or_else(truncated)?).into_owned();

        entries.push(LogSiteMetadata {
            id,
            format_string,
            arg_types,
            severity,
            source_location,
        });
    }

    Ok(entries)
}

/// Writes the fixed record header into `out[..RECORD_HEADER_LEN]`.
#[inline(always)]
pub fn write_record_header(out: &mut [u8], site_id: u32, timestamp: u64, thread_id: u32, args_len: usize) {
    out[0..4].copy_from_slice(&site_id.to_le_bytes());
    out[4..12].copy_from_slice(&timestamp.to_le_bytes());
    out[12..16].copy_from_slice(&thread_id.to_le_bytes());
    out[16..20].copy_from_slice(&(args_len as u32).to_le_bytes());
}

/// Appends one encoded record to `out`.
pub fn encode_record(site_id: u32, timestamp: u64, thread_id: u32, packed_args: &[u8], out: &mut Vec<u8>) {
    let start = out.len();
    out.resize(start + RECORD_HEADER_LEN, 0);
    write_record_header(&mut out[start..], site_id, timestamp, thread_id, packed_args.len());
    out.extend_from_slice(packed_args);
}

/// A record as stored in a decompressed data block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawRecord<'a> {
    pub site_id: u32,
    pub timestamp: u64,
    pub thread_id: u32,
    pub packed_args: &'a [u8],
}

/// Splits decompressed block contents into records.
pub struct RawRecords<'a> {
    reader: ByteReader<'a>,
}

impl<'a> RawRecords<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            reader: ByteReader::new(data),
        }
    }

    /// Bytes not yet consumed. Non-zero after `next` returns `None` means the
    /// tail could not be framed as a record.
    pub fn remaining(&self) -> usize {
        self.reader.remaining()
    }
}

impl<'a> Iterator for RawRecords<'a> {
    type Item = RawRecord<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut probe = ByteReader::new(self.reader.rest());
        let site_id = probe.read_u32()?;
        let timestamp = probe.read_u64()?;
        let thread_id = probe.read_u32()?;
        let packed_args = probe.read_run()?;
        let consumed = probe.position();
        self.reader.read_bytes(consumed)?;
        Some(RawRecord {
            site_id,
            timestamp,
            thread_id,
            packed_args,
        })
    }
}

/// Undoes [`ContainerWriter::append_data_block`]'s compression.
pub fn decompress_data_payload(payload: &[u8]) -> Result<Vec<u8>, String> {
    let mut reader = ByteReader::new(payload);
    let size = reader
        .read_u32()
        .ok_or_else(|| "data block is missing its uncompressed length".to_string())? as usize;
    if size > MAX_DECOMPRESSED_BLOCK {
        return Err(format!("declared uncompressed length {} is implausible", size));
    }
    let compressed = &payload[4..];
    let data = lz4_flex::block::decompress(compressed, size).map_err(|e| e.to_string())?;
    if data.len() != size {
        return Err(format!(
            "decompressed {} bytes, header declared {}",
            data.len(),
            size
        ));
    }
    Ok(data)
}
