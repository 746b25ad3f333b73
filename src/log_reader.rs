use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::container::{
    decode_dictionary_payload, decompress_data_payload, BlockType, FileHeader, RawRecords,
    BLOCK_HEADER_LEN, HEADER_LEN,
};
use crate::efficient_clock::cycles_to_duration;
use crate::error::{DecodeError, RecordError};
use crate::log_format::FormatTemplate;
use crate::log_site::LogSiteMetadata;
use crate::packer::{unpack, ArgValue};

/// Reader for log containers.
///
/// Streams entries in file order. Problems confined to one record or block
/// are skipped, counted in the [`DecodeSummary`] and reported through
/// `tracing`; only damage to the header or to block framing stops the
/// reader.

/// Per-record errors kept in the summary; later ones are only counted.
const MAX_KEPT_ERRORS: usize = 64;

/// One decoded log statement.
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Raw counter value captured by the log call.
    pub timestamp: u64,
    /// `timestamp` converted with the file's calibration.
    pub time: Duration,
    pub thread_id: u32,
    pub site: Arc<LogSiteMetadata>,
    pub args: Vec<ArgValue>,
    /// The format string with `args` substituted.
    pub message: String,
}

impl fmt::Display for LogEntry {
    /// `<seconds>.<nanoseconds> <location> <SEVERITY>[<thread>]: <message>`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{:09} {} {}[{}]: {}",
            self.time.as_secs(),
            self.time.subsec_nanos(),
            self.site.source_location,
            self.site.severity,
            self.thread_id,
            self.message
        )
    }
}

/// What a decode pass saw.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodeSummary {
    pub records: u64,
    pub skipped_records: u64,
    pub skipped_blocks: u64,
    pub dictionary_entries: u64,
    /// The first few skip reasons, in file order.
    pub errors: Vec<RecordError>,
}

impl DecodeSummary {
    pub fn is_clean(&self) -> bool {
        self.skipped_records == 0 && self.skipped_blocks == 0
    }
}

impl fmt::Display for DecodeSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Decoded {} records from {} dictionary entries; skipped {} corrupt records and {} corrupt blocks",
            self.records, self.dictionary_entries, self.skipped_records, self.skipped_blocks
        )
    }
}

struct SiteEntry {
    meta: Arc<LogSiteMetadata>,
    template: FormatTemplate,
}

struct Block {
    offset: u64,
    kind: u8,
    payload: Vec<u8>,
}

/// Decodes a container from any byte source.
///
/// ```no_run
/// # use nanolog::LogReader;
/// let mut reader = LogReader::open("./compressedLog")?;
/// while let Some(entry) = reader.read_entry()? {
///     println!("{}", entry);
/// }
/// eprintln!("{}", reader.summary());
/// # Ok::<(), nanolog::DecodeError>(())
/// ```
pub struct LogReader<R: Read> {
    source: R,
    header: FileHeader,
    offset: u64,
    dictionary: HashMap<u32, SiteEntry>,
    /// Decompressed records of the current data block.
    records: Vec<u8>,
    cursor: usize,
    summary: DecodeSummary,
}

impl LogReader<BufReader<File>> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DecodeError> {
        Self::new(BufReader::new(File::open(path)?))
    }
}

impl<R: Read> LogReader<R> {
    /// Reads and validates the header.
    pub fn new(mut source: R) -> Result<Self, DecodeError> {
        let mut bytes = [0u8; HEADER_LEN];
        let found = read_full(&mut source, &mut bytes)?;
        let header = FileHeader::decode(&bytes[..found])?;
        Ok(Self {
            source,
            header,
            offset: HEADER_LEN as u64,
            dictionary: HashMap::new(),
            records: Vec::new(),
            cursor: 0,
            summary: DecodeSummary::default(),
        })
    }

    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    pub fn summary(&self) -> &DecodeSummary {
        &self.summary
    }

    /// Next decodable entry, `None` at the end of the file.
    pub fn read_entry(&mut self) -> Result<Option<LogEntry>, DecodeError> {
        loop {
            if let Some(entry) = self.next_buffered_entry() {
                return Ok(Some(entry));
            }
            let Some(block) = self.next_block()? else {
                return Ok(None);
            };
            self.load_block(block);
        }
    }

    /// Renders every remaining entry to `out`, one line each.
    pub fn decompress_to<W: Write>(&mut self, out: &mut W) -> Result<DecodeSummary, DecodeError> {
        while let Some(entry) = self.read_entry()? {
            writeln!(out, "{}", entry)?;
        }
        out.flush()?;
        Ok(self.summary.clone())
    }

    /// Every dictionary entry in the remaining blocks, by site id. Data
    /// blocks are skipped without being decompressed.
    pub fn read_dictionary(&mut self) -> Result<Vec<Arc<LogSiteMetadata>>, DecodeError> {
        while let Some(block) = self.next_block()? {
            if block.kind == BlockType::Dictionary as u8 {
                self.load_block(block);
            }
        }
        let mut sites: Vec<_> = self.dictionary.values().map(|entry| entry.meta.clone()).collect();
        sites.sort_by_key(|site| site.id);
        Ok(sites)
    }

    fn next_block(&mut self) -> Result<Option<Block>, DecodeError> {
        let offset = self.offset;
        let mut header = [0u8; BLOCK_HEADER_LEN];
        let found = read_full(&mut self.source, &mut header)?;
        if found == 0 {
            return Ok(None);
        }
        if found < BLOCK_HEADER_LEN {
            return Err(DecodeError::TruncatedBlock {
                offset,
                expected: BLOCK_HEADER_LEN,
                found,
            });
        }

        let kind = header[0];
        let len = u32::from_le_bytes([header[1], header[2], header[3], header[4]]) as usize;
        let mut payload = Vec::new();
        let found = (&mut self.source).take(len as u64).read_to_end(&mut payload)?;
        if found < len {
            return Err(DecodeError::TruncatedBlock {
                offset,
                expected: BLOCK_HEADER_LEN + len,
                found: BLOCK_HEADER_LEN + found,
            });
        }

        self.offset += (BLOCK_HEADER_LEN + len) as u64;
        Ok(Some(Block {
            offset,
            kind,
            payload,
        }))
    }

    fn load_block(&mut self, block: Block) {
        match BlockType::from_u8(block.kind) {
            Some(BlockType::Dictionary) => match decode_dictionary_payload(&block.payload) {
                Ok(entries) => {
                    for meta in entries {
                        self.summary.dictionary_entries += 1;
                        let template = FormatTemplate::parse(&meta.format_string);
                        self.dictionary.insert(
                            meta.id,
                            SiteEntry {
                                meta: Arc::new(meta),
                                template,
                            },
                        );
                    }
                }
                Err(reason) => self.skip_block(block.offset, reason),
            },
            Some(BlockType::Data) => match decompress_data_payload(&block.payload) {
                Ok(records) => {
                    self.records = records;
                    self.cursor = 0;
                }
                Err(reason) => self.skip_block(block.offset, reason),
            },
            None => self.skip_block(block.offset, format!("unknown block type {}", block.kind)),
        }
    }

    fn next_buffered_entry(&mut self) -> Option<LogEntry> {
        while self.cursor < self.records.len() {
            let mut raw = RawRecords::new(&self.records[self.cursor..]);
            let Some(record) = raw.next() else {
                let trailing = self.records.len() - self.cursor;
                self.cursor = self.records.len();
                self.skip_record(RecordError::CorruptBlock {
                    offset: self.offset,
                    reason: format!("{} trailing bytes do not form a record", trailing),
                });
                return None;
            };
            let consumed = self.records.len() - self.cursor - raw.remaining();

            let decoded = match self.dictionary.get(&record.site_id) {
                None => Err(RecordError::UnknownSite(record.site_id)),
                Some(site) => unpack(record.packed_args, &site.meta.arg_types)
                    .map(|args| LogEntry {
                        timestamp: record.timestamp,
                        time: cycles_to_duration(record.timestamp, self.header.cycles_per_second),
                        thread_id: record.thread_id,
                        site: site.meta.clone(),
                        message: site.template.render(&args),
                        args,
                    })
                    .map_err(|source| RecordError::Corrupt {
                        site_id: record.site_id,
                        source,
                    }),
            };
            self.cursor += consumed;

            match decoded {
                Ok(entry) => {
                    self.summary.records += 1;
                    return Some(entry);
                }
                Err(err) => self.skip_record(err),
            }
        }
        None
    }

    fn skip_record(&mut self, err: RecordError) {
        tracing::warn!(error = %err, "skipping log record");
        self.summary.skipped_records += 1;
        self.keep(err);
    }

    fn skip_block(&mut self, offset: u64, reason: String) {
        let err = RecordError::CorruptBlock { offset, reason };
        tracing::warn!(error = %err, "skipping log block");
        self.summary.skipped_blocks += 1;
        self.keep(err);
    }

    fn keep(&mut self, err: RecordError) {
        if self.summary.errors.len() < MAX_KEPT_ERRORS {
            self.summary.errors.push(err);
        }
    }
}

/// Fills `buf` as far as the source allows; returns the bytes read.
fn read_full<R: Read>(source: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
