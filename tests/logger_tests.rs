mod common;

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::OnceLock;
use std::thread;

use common::{decode, FlakyStorage, SharedBuffer};
use nanolog::container::{
    decode_dictionary_payload, decompress_data_payload, BlockType, RawRecords, BLOCK_HEADER_LEN,
    HEADER_LEN,
};
use nanolog::{nano_log, ArgType, ArgValue, Error, LogReader, Loggable, Logger, LoggerConfig};

fn memory_logger(config: LoggerConfig) -> (Logger, SharedBuffer) {
    let buffer = SharedBuffer::default();
    (Logger::with_storage(config, buffer.clone()), buffer)
}

#[test]
fn test_value_renders_after_sync() {
    let (logger, buffer) = memory_logger(LoggerConfig::default());
    nano_log!(logger: logger, Notice, "value=%d", 7);
    logger.sync().unwrap();

    let (entries, summary) = decode(&buffer.contents());
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].message, "value=7");
    assert_eq!(entries[0].args, vec![ArgValue::I32(7)]);
    assert!(entries[0].site.source_location.contains("logger_tests.rs"));
    assert!(summary.is_clean());
}

#[test]
fn test_two_threads_thousand_records_each() {
    let (logger, buffer) = memory_logger(LoggerConfig::default());
    let logger = &logger;

    thread::scope(|s| {
        s.spawn(move || {
            for i in 0..1000 {
                nano_log!(logger: logger, Notice, "alpha %d", i);
            }
        });
        s.spawn(move || {
            for i in 0..1000u64 {
                nano_log!(logger: logger, Warning, "beta %lu", i);
            }
        });
    });
    logger.sync().unwrap();

    assert_eq!(logger.statistics().messages_logged, 2000);
    let (entries, _) = decode(&buffer.contents());
    assert_eq!(entries.len(), 2000);
    assert_eq!(entries.iter().filter(|e| e.message.starts_with("alpha")).count(), 1000);
    assert_eq!(entries.iter().filter(|e| e.message.starts_with("beta")).count(), 1000);
}

#[test]
fn test_per_thread_order_under_backpressure() {
    const THREADS: usize = 4;
    const PER_THREAD: u32 = 5000;

    let config = LoggerConfig::default().with_staging_buffer_size(256);
    let (logger, buffer) = memory_logger(config);
    let logger = &logger;

    thread::scope(|s| {
        for t in 0..THREADS as u32 {
            s.spawn(move || {
                for seq in 0..PER_THREAD {
                    nano_log!(logger: logger, Notice, "worker %u seq %u", t, seq);
                }
            });
        }
    });
    logger.sync().unwrap();

    let stats = logger.statistics();
    assert_eq!(stats.messages_logged, THREADS as u64 * PER_THREAD as u64);
    assert_eq!(stats.records_dropped, 0);
    assert!(stats.records_blocked_on_backpressure > 0, "tiny rings should have blocked");

    let (entries, summary) = decode(&buffer.contents());
    assert!(summary.is_clean());
    assert_eq!(entries.len(), THREADS * PER_THREAD as usize);

    let mut next_seq: HashMap<u32, u32> = HashMap::new();
    for entry in &entries {
        let (worker, seq) = match entry.args[..] {
            [ArgValue::U32(worker), ArgValue::U32(seq)] => (worker, seq),
            _ => panic!("unexpected args {:?}", entry.args),
        };
        let expected = next_seq.entry(worker).or_insert(0);
        assert_eq!(seq, *expected, "worker {} records out of order", worker);
        *expected += 1;
    }
    assert_eq!(next_seq.len(), THREADS);
}

#[test]
fn test_dictionary_entries_precede_records() {
    let config = LoggerConfig::default().with_max_block_size(64);
    let (logger, buffer) = memory_logger(config);
    for i in 0..50 {
        nano_log!(logger: logger, Notice, "first site %d", i);
        if i % 10 == 0 {
            logger.sync().unwrap();
        }
        nano_log!(logger: logger, Error, "second site %s", "x");
    }
    drop(logger);

    let bytes = buffer.contents();
    let mut known = std::collections::HashSet::new();
    let mut pos = HEADER_LEN;
    let mut data_blocks = 0;
    while pos < bytes.len() {
        let kind = bytes[pos];
        let len = u32::from_le_bytes(bytes[pos + 1..pos + 5].try_into().unwrap()) as usize;
        let payload = &bytes[pos + BLOCK_HEADER_LEN..pos + BLOCK_HEADER_LEN + len];
        match BlockType::from_u8(kind).unwrap() {
            BlockType::Dictionary => {
                for entry in decode_dictionary_payload(payload).unwrap() {
                    known.insert(entry.id);
                }
            }
            BlockType::Data => {
                data_blocks += 1;
                let records = decompress_data_payload(payload).unwrap();
                for record in RawRecords::new(&records) {
                    assert!(known.contains(&record.site_id), "site {} used before its dictionary entry", record.site_id);
                }
            }
        }
        pos += BLOCK_HEADER_LEN + len;
    }
    assert!(data_blocks > 1, "small max block size should split batches");
}

#[test]
fn test_drop_persists_pending_records() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("drop.nlog");
    {
        let logger = Logger::new(LoggerConfig::default().with_output_path(&path));
        nano_log!(logger: logger, Notice, "closing %s", "cleanly");
    }

    let mut reader = LogReader::open(&path).unwrap();
    let entry = reader.read_entry().unwrap().expect("one entry");
    assert_eq!(entry.message, "closing cleanly");
    assert!(reader.read_entry().unwrap().is_none());
}

#[test]
fn test_output_path_is_fixed_once_started() {
    let dir = tempfile::tempdir().unwrap();
    let first = dir.path().join("first.nlog");
    let second = dir.path().join("second.nlog");

    let logger = Logger::new(LoggerConfig::default().with_output_path(dir.path().join("unused.nlog")));
    logger.set_output_path(&first).unwrap();
    assert!(matches!(
        logger.set_output_path(dir.path()),
        Err(Error::InvalidPath { .. })
    ));

    logger.sync().unwrap();
    assert!(matches!(logger.set_output_path(&second), Err(Error::AlreadyStarted)));
    drop(logger);

    assert!(first.exists());
    assert!(!second.exists());
    assert!(!dir.path().join("unused.nlog").exists());
}

#[test]
fn test_write_failure_surfaces_on_sync() {
    let storage = FlakyStorage::default();
    let logger = Logger::with_storage(LoggerConfig::default(), storage.clone());
    nano_log!(logger: logger, Notice, "before failure");
    logger.sync().unwrap();

    storage.broken.store(true, Ordering::SeqCst);
    nano_log!(logger: logger, Notice, "lost %d", 1);
    assert!(matches!(logger.sync(), Err(Error::WriterFailed(_))));

    // Later calls neither block nor succeed.
    for i in 0..10_000 {
        nano_log!(logger: logger, Notice, "after failure %d", i);
    }
    assert!(matches!(logger.sync(), Err(Error::WriterFailed(_))));
    assert!(logger.statistics().records_dropped > 0);
}

#[test]
fn test_oversized_record_is_dropped() {
    let config = LoggerConfig::default().with_staging_buffer_size(64);
    let (logger, buffer) = memory_logger(config);
    let big = "x".repeat(500);
    nano_log!(logger: logger, Notice, "big %s", big);
    nano_log!(logger: logger, Notice, "small %d", 1);
    logger.sync().unwrap();

    assert_eq!(logger.statistics().records_dropped, 1);
    let (entries, _) = decode(&buffer.contents());
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].message, "small 1");
}

#[test]
fn test_preallocate_and_statistics() {
    let (logger, buffer) = memory_logger(LoggerConfig::default());
    logger.preallocate();
    logger.preallocate();
    for i in 0..100 {
        nano_log!(logger: logger, Notice, "repetitive message number %d", i);
    }
    logger.sync().unwrap();

    let stats = logger.statistics();
    assert_eq!(stats.messages_logged, 100);
    assert_eq!(stats.bytes_written, buffer.contents().len() as u64);
    // 20-byte record header plus one i32.
    assert_eq!(stats.uncompressed_bytes, 100 * 24);
    assert!(stats.compressed_bytes > 0);
    assert!(stats.to_string().contains("Wrote 100 messages"));
}

#[test]
fn test_sync_without_records_writes_header() {
    let (logger, buffer) = memory_logger(LoggerConfig::default());
    logger.sync().unwrap();
    let (entries, summary) = decode(&buffer.contents());
    assert!(entries.is_empty());
    assert_eq!(summary.records, 0);
}

#[test]
fn test_default_logger() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("default.nlog");
    nanolog::set_output_path(&path).unwrap();
    nanolog::preallocate();

    nano_log!(Notice, "default logger %s", "works");
    nanolog::sync().unwrap();
    assert!(matches!(nanolog::set_output_path(&path), Err(Error::AlreadyStarted)));
    assert!(nanolog::statistics().messages_logged >= 1);

    let mut reader = LogReader::open(&path).unwrap();
    let entry = reader.read_entry().unwrap().expect("one entry");
    assert_eq!(entry.message, "default logger works");
}

fn log_generic<T: Loggable>(logger: &Logger, value: T) {
    nano_log!(logger: logger, Notice, "generic %d", value);
}

#[test]
fn test_generic_call_site_records_each_type() {
    let (logger, buffer) = memory_logger(LoggerConfig::default());
    log_generic(&logger, 7i32);
    log_generic(&logger, 8u64);
    log_generic(&logger, 9i32);
    logger.sync().unwrap();

    let (entries, summary) = decode(&buffer.contents());
    assert!(summary.is_clean(), "{:?}", summary);
    let messages: Vec<_> = entries.iter().map(|e| e.message.as_str()).collect();
    assert_eq!(messages, vec!["generic 7", "generic 8", "generic 9"]);
    assert_eq!(entries[1].args, vec![ArgValue::U64(8)]);
    assert_ne!(entries[0].site.id, entries[1].site.id);
    assert_eq!(entries[0].site.id, entries[2].site.id);
}

/// Logs through the same logger while its own record is being packed.
struct Nested<'a>(&'a Logger);

impl Loggable for Nested<'_> {
    const ARG_TYPE: ArgType = ArgType::U8;

    fn packed_len(&self) -> usize {
        1
    }

    fn pack(&self, out: &mut [u8]) -> usize {
        nano_log!(logger: self.0, Notice, "nested %d", 1);
        out[0] = 9;
        1
    }
}

#[test]
fn test_log_from_inside_pack_is_counted_as_dropped() {
    let (logger, buffer) = memory_logger(LoggerConfig::default());
    nano_log!(logger: logger, Notice, "outer %hhu", Nested(&logger));
    logger.sync().unwrap();

    assert_eq!(logger.statistics().records_dropped, 1);
    let (entries, _) = decode(&buffer.contents());
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].message, "outer 9");
}

static EXIT_LOGGER: OnceLock<Logger> = OnceLock::new();

struct LogOnExit;

impl Drop for LogOnExit {
    fn drop(&mut self) {
        if let Some(logger) = EXIT_LOGGER.get() {
            nano_log!(logger: logger, Notice, "thread exiting %d", 1);
        }
    }
}

thread_local! {
    static ON_EXIT: LogOnExit = const { LogOnExit };
}

#[test]
fn test_log_from_thread_local_destructor_is_counted_as_dropped() {
    let buffer = SharedBuffer::default();
    let logger = EXIT_LOGGER.get_or_init(|| Logger::with_storage(LoggerConfig::default(), buffer.clone()));

    thread::spawn(move || {
        // Registered first, so destroyed after the staging buffers.
        ON_EXIT.with(|_| {});
        nano_log!(logger: logger, Notice, "thread running %d", 0);
    })
    .join()
    .unwrap();
    logger.sync().unwrap();

    assert_eq!(logger.statistics().records_dropped, 1);
    let (entries, _) = decode(&buffer.contents());
    let messages: Vec<_> = entries.iter().map(|e| e.message.as_str()).collect();
    assert_eq!(messages, vec!["thread running 0"]);
}
