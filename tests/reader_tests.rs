mod common;

use std::sync::Arc;

use common::{decode, SharedBuffer};
use nanolog::container::{encode_record, BlockType, ContainerWriter, BLOCK_HEADER_LEN, HEADER_LEN};
use nanolog::log_site::{LogSiteMetadata, Severity};
use nanolog::packer::pack;
use nanolog::{nano_log, ArgType, ArgValue, DecodeError, LogReader, Logger, LoggerConfig, RecordError};

fn site(id: u32, format: &str, arg_types: Vec<ArgType>) -> Arc<LogSiteMetadata> {
    Arc::new(LogSiteMetadata {
        id,
        format_string: format.to_string(),
        arg_types,
        severity: Severity::Warning,
        source_location: "reader_tests.rs:1".to_string(),
    })
}

/// A container with one dictionary block and one data block per entry of
/// `values`, each holding a single `"n=%d"` record.
fn three_block_file(values: &[i32]) -> Vec<u8> {
    let mut writer = ContainerWriter::create(Vec::new(), 1_000_000).unwrap();
    writer.append_dictionary_block(&[site(0, "n=%d", vec![ArgType::I32])]).unwrap();
    for (i, value) in values.iter().enumerate() {
        let mut records = Vec::new();
        encode_record(0, i as u64, 1, &pack(&(value,)), &mut records);
        writer.append_data_block(&records).unwrap();
    }
    writer.into_inner()
}

/// Byte offset of the `index`-th block.
fn block_offset(bytes: &[u8], index: usize) -> usize {
    let mut pos = HEADER_LEN;
    for _ in 0..index {
        let len = u32::from_le_bytes(bytes[pos + 1..pos + 5].try_into().unwrap()) as usize;
        pos += BLOCK_HEADER_LEN + len;
    }
    pos
}

#[test]
fn test_every_primitive_round_trips() {
    let buffer = SharedBuffer::default();
    let logger = Logger::with_storage(LoggerConfig::default(), buffer.clone());

    let marker = 0u8;
    let pointer: *const u8 = &marker;
    let blob: &[u8] = &[0xde, 0xad];
    let owned = String::from("owned");

    nano_log!(logger: logger, Notice, "%hhd %hd %d %lld %zd", -8i8, -16i16, -32i32, -64i64, -1isize);
    nano_log!(logger: logger, Notice, "%hhu %hu %u %llu %zu", 8u8, 16u16, 32u32, 64u64, 1usize);
    nano_log!(logger: logger, Notice, "%f %f %d %c", 1.5f32, -2.25f64, true, 'é');
    nano_log!(logger: logger, Notice, "%s %s %s %p", "borrowed", owned, blob, pointer);
    logger.sync().unwrap();

    let (entries, summary) = decode(&buffer.contents());
    assert!(summary.is_clean());
    assert_eq!(entries.len(), 4);
    assert_eq!(
        entries[0].args,
        vec![
            ArgValue::I8(-8),
            ArgValue::I16(-16),
            ArgValue::I32(-32),
            ArgValue::I64(-64),
            ArgValue::I64(-1),
        ]
    );
    assert_eq!(
        entries[1].args,
        vec![
            ArgValue::U8(8),
            ArgValue::U16(16),
            ArgValue::U32(32),
            ArgValue::U64(64),
            ArgValue::U64(1),
        ]
    );
    assert_eq!(
        entries[2].args,
        vec![
            ArgValue::F32(1.5),
            ArgValue::F64(-2.25),
            ArgValue::Bool(true),
            ArgValue::Char('é'),
        ]
    );
    assert_eq!(entries[2].message, "1.500000 -2.250000 1 é");
    assert_eq!(
        entries[3].args[..3],
        [
            ArgValue::Str("borrowed".into()),
            ArgValue::Str("owned".into()),
            ArgValue::Bytes(vec![0xde, 0xad]),
        ]
    );
    assert_eq!(entries[3].args[3], ArgValue::Pointer(pointer as u64));
}

#[test]
fn test_corrupt_data_block_is_skipped() {
    let mut bytes = three_block_file(&[1, 2, 3]);
    // Clobber the middle data block's compressed bytes, keeping its framing.
    let middle = block_offset(&bytes, 2);
    let len = u32::from_le_bytes(bytes[middle + 1..middle + 5].try_into().unwrap()) as usize;
    for b in &mut bytes[middle + BLOCK_HEADER_LEN + 4..middle + BLOCK_HEADER_LEN + len] {
        *b = 0xFF;
    }

    let (entries, summary) = decode(&bytes);
    let messages: Vec<_> = entries.iter().map(|e| e.message.as_str()).collect();
    assert_eq!(messages, vec!["n=1", "n=3"]);
    assert!(summary.skipped_blocks > 0);
    assert!(matches!(
        summary.errors[0],
        RecordError::CorruptBlock { offset, .. } if offset == middle as u64
    ));
}

#[test]
fn test_truncated_file_keeps_rendered_output() {
    let bytes = three_block_file(&[10, 20]);
    let cut = &bytes[..bytes.len() - 3];

    let mut reader = LogReader::new(cut).unwrap();
    let mut out = Vec::new();
    let err = reader.decompress_to(&mut out).unwrap_err();
    assert!(matches!(err, DecodeError::TruncatedBlock { .. }));
    let text = String::from_utf8(out).unwrap();
    assert!(text.ends_with("WARNING[1]: n=10\n"), "got {:?}", text);
    assert_eq!(reader.summary().records, 1);
}

#[test]
fn test_unknown_block_type_and_site_are_skipped() {
    let mut bytes = three_block_file(&[5]);
    bytes.push(9);
    bytes.extend_from_slice(&3u32.to_le_bytes());
    bytes.extend_from_slice(b"???");

    let mut orphan = ContainerWriter::create(Vec::new(), 1).unwrap();
    let mut records = Vec::new();
    encode_record(42, 0, 1, &[], &mut records);
    orphan.append_data_block(&records).unwrap();
    bytes.extend_from_slice(&orphan.into_inner()[HEADER_LEN..]);

    let (entries, summary) = decode(&bytes);
    assert_eq!(entries.len(), 1);
    assert_eq!(summary.skipped_blocks, 1);
    assert_eq!(summary.skipped_records, 1);
    assert!(summary.errors.contains(&RecordError::UnknownSite(42)));
}

#[test]
fn test_payload_mismatch_is_a_corrupt_record() {
    let mut writer = ContainerWriter::create(Vec::new(), 1).unwrap();
    writer.append_dictionary_block(&[site(0, "wide %ld", vec![ArgType::I64])]).unwrap();
    let mut records = Vec::new();
    encode_record(0, 0, 1, &pack(&(&1i32,)), &mut records);
    encode_record(0, 0, 1, &pack(&(&2i64,)), &mut records);
    writer.append_data_block(&records).unwrap();

    let (entries, summary) = decode(&writer.into_inner());
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].message, "wide 2");
    assert!(matches!(summary.errors[0], RecordError::Corrupt { site_id: 0, .. }));
}

#[test]
fn test_header_errors_are_fatal() {
    let mut bytes = three_block_file(&[1]);
    bytes[4] = 7;
    assert!(matches!(LogReader::new(&bytes[..]), Err(DecodeError::UnsupportedVersion(7))));
    assert!(matches!(LogReader::new(&bytes[..HEADER_LEN - 1]), Err(DecodeError::TruncatedHeader)));
}

#[test]
fn test_dictionary_listing() {
    let mut writer = ContainerWriter::create(Vec::new(), 1).unwrap();
    writer.append_dictionary_block(&[site(3, "c", Vec::new())]).unwrap();
    writer.append_data_block(&[1, 2, 3]).unwrap();
    writer
        .append_dictionary_block(&[site(1, "a %s", vec![ArgType::Str])])
        .unwrap();

    let bytes = writer.into_inner();
    let mut reader = LogReader::new(&bytes[..]).unwrap();
    let sites = reader.read_dictionary().unwrap();
    let ids: Vec<u32> = sites.iter().map(|s| s.id).collect();
    assert_eq!(ids, vec![1, 3]);
    assert_eq!(sites[0].arg_types, vec![ArgType::Str]);
}
