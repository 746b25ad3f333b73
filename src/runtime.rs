use std::cell::RefCell;
use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use lazy_static::lazy_static;
use parking_lot::{Condvar, Mutex};

use crate::config::{LoggerConfig, BACKPRESSURE_MAX_SLEEP, BACKPRESSURE_SPIN_LIMIT};
use crate::container::{write_record_header, ContainerWriter, Storage, RECORD_HEADER_LEN};
use crate::efficient_clock::{cycles_per_second, get_timestamp};
use crate::error::Error;
use crate::log_site::{self, CallSite, Severity};
use crate::packer::LogArgs;
use crate::staging_buffer::{Consumer, Producer, RingProgress, StagingBuffer};

/// The asynchronous logging runtime.
///
/// A [`Logger`] owns one background writer thread. Every thread that logs
/// through it gets its own staging ring the first time it does so; log calls
/// only pack their arguments into that ring. The writer drains all rings,
/// emits dictionary entries for sites it has not written yet, compresses the
/// records into data blocks and appends both to the container.
///
/// # Output lifecycle
///
/// The output is opened and the header written the first time the writer
/// has something to persist (a record, a `sync`, or shutdown). Until then
/// the destination can still be changed with [`Logger::set_output_path`].

static NEXT_LOGGER_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_THREAD_ID: AtomicU32 = AtomicU32::new(1);
/// Bumped whenever a logger is dropped, after its consumers are gone.
static RETIRED_LOGGERS: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static THREAD_ID: u32 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
    static PRODUCERS: RefCell<ThreadProducers> = const {
        RefCell::new(ThreadProducers {
            retired_seen: 0,
            entries: Vec::new(),
        })
    };
}

/// This thread's producer end for each logger it has logged through.
struct ThreadProducers {
    retired_seen: u64,
    entries: Vec<(u64, Producer)>,
}

impl ThreadProducers {
    /// Releases rings of dropped loggers once per logger drop, instead of
    /// waiting for this thread to attach a new ring.
    #[inline]
    fn prune_orphans(&mut self) {
        let retired = RETIRED_LOGGERS.load(Ordering::Acquire);
        if retired != self.retired_seen {
            self.retired_seen = retired;
            self.entries.retain(|(_, producer)| !producer.is_orphaned());
        }
    }
}

fn current_thread_id() -> u32 {
    THREAD_ID.try_with(|id| *id).unwrap_or(0)
}

/// Counters reported by [`Logger::statistics`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Statistics {
    /// Records written to the output by the background thread.
    pub messages_logged: u64,
    /// Container bytes written, header and block framing included.
    pub bytes_written: u64,
    /// Log calls that had to wait for staging space.
    pub records_blocked_on_backpressure: u64,
    /// Records discarded: larger than a whole staging ring, or logged after
    /// the writer failed.
    pub records_dropped: u64,
    /// Record bytes before compression.
    pub uncompressed_bytes: u64,
    /// Data block bytes after compression.
    pub compressed_bytes: u64,
    /// `uncompressed_bytes / compressed_bytes`, zero before the first block.
    pub compression_ratio: f64,
}

impl fmt::Display for Statistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Wrote {} messages ({} bytes of records) into {} bytes of log data",
            self.messages_logged, self.uncompressed_bytes, self.bytes_written
        )?;
        writeln!(
            f,
            "Compression ratio: {:.2}x ({} compressed bytes)",
            self.compression_ratio, self.compressed_bytes
        )?;
        write!(
            f,
            "{} records waited for staging space, {} were dropped",
            self.records_blocked_on_backpressure, self.records_dropped
        )
    }
}

#[derive(Default)]
struct Counters {
    messages_logged: AtomicU64,
    bytes_written: AtomicU64,
    records_blocked: AtomicU64,
    records_dropped: AtomicU64,
    uncompressed_bytes: AtomicU64,
    compressed_bytes: AtomicU64,
}

enum Destination {
    Path(PathBuf),
    Storage(Box<dyn Storage>),
}

struct Output {
    destination: Option<Destination>,
    started: bool,
}

/// Rings created by producers, waiting to be adopted by the writer, plus a
/// progress handle for every ring `sync` has to wait on.
#[derive(Default)]
struct RingTable {
    next_key: u64,
    pending: Vec<(u64, Consumer)>,
    live: Vec<(u64, RingProgress)>,
}

#[derive(Default)]
struct SyncState {
    requested: u64,
    completed: u64,
    failure: Option<String>,
}

struct Inner {
    id: u64,
    staging_size: AtomicUsize,
    poll_interval: Duration,
    max_block_size: usize,
    output: Mutex<Output>,
    rings: Mutex<RingTable>,
    sync: Mutex<SyncState>,
    synced: Condvar,
    wake: Mutex<bool>,
    wake_cond: Condvar,
    shutdown: AtomicBool,
    failed: AtomicBool,
    oversize_reported: AtomicBool,
    unstaged_reported: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
    counters: Counters,
}

/// Handle to one logging pipeline and its output.
///
/// Dropping it drains every ring, persists the output and joins the
/// background thread.
///
/// ```no_run
/// use nanolog::{nano_log, Logger, LoggerConfig};
///
/// let logger = Logger::new(LoggerConfig::default().with_output_path("/tmp/app.nlog"));
/// nano_log!(logger: logger, Notice, "started with %d workers", 4);
/// logger.sync().unwrap();
/// ```
pub struct Logger {
    inner: Arc<Inner>,
}

impl Logger {
    /// A logger writing to `config.output_path`.
    pub fn new(config: LoggerConfig) -> Self {
        let destination = Destination::Path(config.output_path.clone());
        Self::build(config, destination)
    }

    /// A logger writing to `storage`; `config.output_path` is ignored.
    pub fn with_storage(config: LoggerConfig, storage: impl Storage + 'static) -> Self {
        Self::build(config, Destination::Storage(Box::new(storage)))
    }

    fn build(config: LoggerConfig, destination: Destination) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: NEXT_LOGGER_ID.fetch_add(1, Ordering::Relaxed),
                staging_size: AtomicUsize::new(config.staging_buffer_size),
                poll_interval: config.poll_interval,
                max_block_size: config.max_block_size.max(1),
                output: Mutex::new(Output {
                    destination: Some(destination),
                    started: false,
                }),
                rings: Mutex::new(RingTable::default()),
                sync: Mutex::new(SyncState::default()),
                synced: Condvar::new(),
                wake: Mutex::new(false),
                wake_cond: Condvar::new(),
                shutdown: AtomicBool::new(false),
                failed: AtomicBool::new(false),
                oversize_reported: AtomicBool::new(false),
                unstaged_reported: AtomicBool::new(false),
                worker: Mutex::new(None),
                counters: Counters::default(),
            }),
        }
    }

    /// Stages one record. Called by `nano_log!` after its level check.
    ///
    /// Blocks while the calling thread's ring is full; returns immediately
    /// once the background writer has failed. A record that cannot be staged
    /// at all (thread-local storage already torn down, or logging from inside
    /// another record's `pack`) counts as dropped.
    #[inline]
    pub fn log<A: LogArgs>(&self, site: &CallSite, args: A) {
        let inner = &self.inner;
        if inner.failed.load(Ordering::Relaxed) {
            inner.counters.records_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let site_id = site.id::<A>();
        let timestamp = get_timestamp();
        let args_len = args.packed_len();
        let len = RECORD_HEADER_LEN + args_len;

        let staged = PRODUCERS.try_with(|cell| {
            let Ok(mut producers) = cell.try_borrow_mut() else {
                return false;
            };
            let Some(producer) = inner.producer(&mut producers) else {
                return false;
            };
            let thread_id = producer.thread_id();
            inner.push_blocking(producer, len, |slot: &mut [u8]| {
                write_record_header(slot, site_id, timestamp, thread_id, args_len);
                args.pack(&mut slot[RECORD_HEADER_LEN..]);
            });
            true
        });
        if !matches!(staged, Ok(true)) {
            inner.discard_unstaged();
        }
    }

    /// Redirects output to `path`. Fails once the output has been started.
    pub fn set_output_path(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        let path = path.as_ref();
        validate_output_path(path)?;
        let mut output = self.inner.output.lock();
        if output.started {
            return Err(Error::AlreadyStarted);
        }
        output.destination = Some(Destination::Path(path.to_path_buf()));
        Ok(())
    }

    /// Ring size for threads that log through this logger for the first
    /// time after the call. Existing rings keep their size.
    pub fn set_staging_buffer_size(&self, bytes: usize) {
        self.inner.staging_size.store(bytes, Ordering::Relaxed);
    }

    pub fn set_level(&self, level: Severity) {
        log_site::set_level(level);
    }

    pub fn current_level(&self) -> Severity {
        log_site::current_level()
    }

    /// Creates the calling thread's staging ring now instead of on its first
    /// log call.
    pub fn preallocate(&self) {
        let inner = &self.inner;
        let _ = PRODUCERS.try_with(|cell| {
            if let Ok(mut producers) = cell.try_borrow_mut() {
                inner.producer(&mut producers);
            }
        });
    }

    /// Blocks until everything logged before the call is durably stored.
    pub fn sync(&self) -> Result<(), Error> {
        self.inner.sync()
    }

    pub fn statistics(&self) -> Statistics {
        let counters = &self.inner.counters;
        let uncompressed_bytes = counters.uncompressed_bytes.load(Ordering::Relaxed);
        let compressed_bytes = counters.compressed_bytes.load(Ordering::Relaxed);
        Statistics {
            messages_logged: counters.messages_logged.load(Ordering::Relaxed),
            bytes_written: counters.bytes_written.load(Ordering::Relaxed),
            records_blocked_on_backpressure: counters.records_blocked.load(Ordering::Relaxed),
            records_dropped: counters.records_dropped.load(Ordering::Relaxed),
            uncompressed_bytes,
            compressed_bytes,
            compression_ratio: if compressed_bytes == 0 {
                0.0
            } else {
                uncompressed_bytes as f64 / compressed_bytes as f64
            },
        }
    }
}

impl Drop for Logger {
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.wake();
        let worker = self.inner.worker.lock().take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                tracing::error!("background writer panicked");
            }
        }
        // Rings the writer never adopted.
        self.inner.rings.lock().pending.clear();
        RETIRED_LOGGERS.fetch_add(1, Ordering::Release);
    }
}

fn validate_output_path(path: &Path) -> Result<(), Error> {
    let invalid = |reason: &str| Error::InvalidPath {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };
    if path.as_os_str().is_empty() {
        return Err(invalid("path is empty"));
    }
    if path.is_dir() {
        return Err(invalid("path is a directory"));
    }
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() && !parent.is_dir() => {
            Err(invalid("parent directory does not exist"))
        }
        _ => Ok(()),
    }
}

impl Inner {
    fn wake(&self) {
        *self.wake.lock() = true;
        self.wake_cond.notify_one();
    }

    /// This logger's producer among the thread's, attaching a new ring on
    /// first use.
    fn producer<'p>(self: &Arc<Self>, producers: &'p mut ThreadProducers) -> Option<&'p mut Producer> {
        producers.prune_orphans();
        let producers = &mut producers.entries;
        if let Some(index) = producers.iter().position(|(id, _)| *id == self.id) {
            return Some(&mut producers[index].1);
        }
        if !self.ensure_worker() {
            return None;
        }
        // Also covers loggers whose writer failed but which are still alive.
        producers.retain(|(_, producer)| !producer.is_orphaned());

        let (producer, consumer) = StagingBuffer::new(
            self.staging_size.load(Ordering::Relaxed),
            current_thread_id(),
        );
        {
            let mut rings = self.rings.lock();
            let key = rings.next_key;
            rings.next_key += 1;
            rings.live.push((key, consumer.progress()));
            rings.pending.push((key, consumer));
        }
        producers.push((self.id, producer));
        producers.last_mut().map(|(_, producer)| producer)
    }

    /// Starts the background thread if it is not running. False when it
    /// cannot be started or has already failed.
    fn ensure_worker(self: &Arc<Self>) -> bool {
        if self.failed.load(Ordering::Acquire) {
            return false;
        }
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return true;
        }
        let writer = Writer::new(self.clone());
        match thread::Builder::new()
            .name("nanolog-writer".into())
            .spawn(move || writer.run())
        {
            Ok(handle) => {
                *worker = Some(handle);
                true
            }
            Err(e) => {
                drop(worker);
                self.fail(format!("could not start background writer: {}", e));
                false
            }
        }
    }

    #[inline]
    fn push_blocking<F: FnOnce(&mut [u8])>(&self, producer: &mut Producer, len: usize, fill: F) {
        if len > producer.max_record_len() {
            self.counters.records_dropped.fetch_add(1, Ordering::Relaxed);
            if !self.oversize_reported.swap(true, Ordering::Relaxed) {
                tracing::warn!(
                    record_len = len,
                    max_record_len = producer.max_record_len(),
                    "dropping log record larger than the staging buffer"
                );
            }
            return;
        }

        let mut fill = match producer.try_push_with(len, fill) {
            Ok(()) => return,
            Err(fill) => fill,
        };

        self.counters.records_blocked.fetch_add(1, Ordering::Relaxed);
        let mut attempts: u32 = 0;
        let mut sleep = Duration::from_micros(1);
        loop {
            if self.failed.load(Ordering::Relaxed) || producer.is_orphaned() {
                self.counters.records_dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
            attempts = attempts.saturating_add(1);
            if attempts < BACKPRESSURE_SPIN_LIMIT {
                std::hint::spin_loop();
            } else {
                if attempts == BACKPRESSURE_SPIN_LIMIT {
                    self.wake();
                }
                thread::sleep(sleep);
                sleep = (sleep * 2).min(BACKPRESSURE_MAX_SLEEP);
            }
            fill = match producer.try_push_with(len, fill) {
                Ok(()) => return,
                Err(fill) => fill,
            };
        }
    }

    #[cold]
    fn discard_unstaged(&self) {
        self.counters.records_dropped.fetch_add(1, Ordering::Relaxed);
        if !self.failed.load(Ordering::Relaxed) && !self.unstaged_reported.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                logger = self.id,
                "dropping log record: no staging buffer is usable from this context"
            );
        }
    }

    fn sync(self: &Arc<Self>) -> Result<(), Error> {
        if !self.ensure_worker() {
            return Err(self.failure());
        }

        let targets: Vec<(RingProgress, usize)> = self
            .rings
            .lock()
            .live
            .iter()
            .map(|(_, progress)| (progress.clone(), progress.produced()))
            .collect();

        let mut state = self.sync.lock();
        state.requested += 1;
        let generation = state.requested;
        self.wake();

        loop {
            if let Some(reason) = &state.failure {
                return Err(Error::WriterFailed(reason.clone()));
            }
            let caught_up = targets
                .iter()
                .all(|(progress, target)| progress.persisted() >= *target || progress.is_detached());
            if state.completed >= generation && caught_up {
                return Ok(());
            }
            self.synced.wait_for(&mut state, self.poll_interval);
        }
    }

    fn failure(&self) -> Error {
        let reason = self
            .sync
            .lock()
            .failure
            .clone()
            .unwrap_or_else(|| "background writer is not running".to_string());
        Error::WriterFailed(reason)
    }

    fn fail(&self, reason: String) {
        tracing::error!(%reason, "background writer stopped; further records are discarded");
        self.failed.store(true, Ordering::Release);
        let mut state = self.sync.lock();
        state.failure = Some(reason);
        self.synced.notify_all();
    }

    fn open_destination(&self) -> io::Result<Box<dyn Storage>> {
        let mut output = self.output.lock();
        let destination = output
            .destination
            .take()
            .ok_or_else(|| io::Error::other("log output was already consumed"))?;
        let storage: Box<dyn Storage> = match destination {
            Destination::Path(path) => {
                tracing::debug!(path = %path.display(), "opening log output");
                Box::new(BufWriter::new(File::create(&path)?))
            }
            Destination::Storage(storage) => storage,
        };
        output.started = true;
        Ok(storage)
    }
}

/// Record bytes of one pass, split into blocks of at most `max` bytes
/// (a single larger record gets a block of its own).
struct Batch {
    max: usize,
    blocks: Vec<Vec<u8>>,
}

impl Batch {
    fn new(max: usize) -> Self {
        Self {
            max,
            blocks: Vec::new(),
        }
    }

    fn push(&mut self, record: &[u8]) {
        match self.blocks.last_mut() {
            Some(block) if block.len() + record.len() <= self.max => block.extend_from_slice(record),
            _ => self.blocks.push(record.to_vec()),
        }
    }

    fn take(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.blocks)
    }
}

/// State owned by the background thread.
struct Writer {
    inner: Arc<Inner>,
    rings: Vec<(u64, Consumer)>,
    container: Option<ContainerWriter<Box<dyn Storage>>>,
    /// Registry sites already present in this file's dictionary.
    emitted_sites: usize,
    completed: u64,
    batch: Batch,
}

impl Writer {
    fn new(inner: Arc<Inner>) -> Self {
        let max_block_size = inner.max_block_size;
        Self {
            inner,
            rings: Vec::new(),
            container: None,
            emitted_sites: 0,
            completed: 0,
            batch: Batch::new(max_block_size),
        }
    }

    fn run(mut self) {
        tracing::debug!(logger = self.inner.id, "background writer started");
        loop {
            let stopping = self.inner.shutdown.load(Ordering::Acquire);
            match self.pass(stopping) {
                Ok(true) => {}
                Ok(false) if !stopping => self.idle(),
                Ok(false) => {}
                Err(e) => {
                    self.inner.fail(e.to_string());
                    return;
                }
            }
            if stopping {
                break;
            }
        }
        tracing::debug!(
            logger = self.inner.id,
            messages = self.inner.counters.messages_logged.load(Ordering::Relaxed),
            "background writer stopped"
        );
    }

    fn idle(&self) {
        let mut pending = self.inner.wake.lock();
        if !*pending && !self.inner.shutdown.load(Ordering::Acquire) {
            self.inner.wake_cond.wait_for(&mut pending, self.inner.poll_interval);
        }
        *pending = false;
    }

    /// One drain/write cycle. Returns whether it did any work.
    fn pass(&mut self, final_pass: bool) -> io::Result<bool> {
        let requested = self.inner.sync.lock().requested;
        let persist = final_pass || requested > self.completed;

        self.rings.append(&mut self.inner.rings.lock().pending);

        let mut drained = 0;
        let mut retired = Vec::new();
        let Self { rings, batch, .. } = &mut *self;
        for (key, ring) in rings.iter_mut() {
            // Checked before draining: once the producer is gone, one more
            // drain empties the ring for good.
            let abandoned = ring.is_abandoned();
            let (records, _) = ring.drain_ready(|record| batch.push(record));
            drained += records;
            if abandoned {
                retired.push(*key);
            }
        }

        if drained == 0 && !persist {
            self.retire(&retired);
            return Ok(false);
        }

        let blocks = self.batch.take();
        let container = match &mut self.container {
            Some(container) => container,
            slot => {
                let storage = self.inner.open_destination()?;
                slot.insert(ContainerWriter::create(storage, cycles_per_second())?)
            }
        };

        // Sites used by the drained records were registered before the
        // records were staged, so reading the registry now covers them.
        let new_sites = log_site::sites_from(self.emitted_sites);
        container.append_dictionary_block(&new_sites)?;
        self.emitted_sites += new_sites.len();

        for block in &blocks {
            container.append_data_block(block)?;
        }

        if persist {
            container.persist()?;
            for (_, ring) in &self.rings {
                ring.mark_persisted(ring.drained_cursor());
            }
        } else {
            container.flush()?;
        }

        let counters = &self.inner.counters;
        counters.messages_logged.fetch_add(drained as u64, Ordering::Relaxed);
        counters.bytes_written.store(container.bytes_written(), Ordering::Relaxed);
        counters.uncompressed_bytes.store(container.uncompressed_bytes(), Ordering::Relaxed);
        counters.compressed_bytes.store(container.compressed_bytes(), Ordering::Relaxed);

        self.retire(&retired);

        if persist && requested > self.completed {
            self.completed = requested;
            let mut state = self.inner.sync.lock();
            state.completed = state.completed.max(requested);
            self.inner.synced.notify_all();
        }
        Ok(true)
    }

    fn retire(&mut self, keys: &[u64]) {
        if keys.is_empty() {
            return;
        }
        self.rings.retain(|(key, _)| !keys.contains(key));
        self.inner.rings.lock().live.retain(|(key, _)| !keys.contains(key));
        tracing::debug!(count = keys.len(), "released staging buffers of exited threads");
    }
}

lazy_static! {
    static ref DEFAULT_LOGGER: Logger = Logger::new(LoggerConfig::default());
}

/// The process-wide logger used by `nano_log!` without a `logger:` argument.
///
/// It is never dropped; call [`sync`] before exiting to make sure the last
/// records reach the file.
pub fn default_logger() -> &'static Logger {
    &DEFAULT_LOGGER
}

/// [`Logger::set_output_path`] on the default logger.
pub fn set_output_path(path: impl AsRef<Path>) -> Result<(), Error> {
    DEFAULT_LOGGER.set_output_path(path)
}

/// [`Logger::preallocate`] on the default logger.
pub fn preallocate() {
    DEFAULT_LOGGER.preallocate();
}

/// [`Logger::sync`] on the default logger.
pub fn sync() -> Result<(), Error> {
    DEFAULT_LOGGER.sync()
}

/// [`Logger::statistics`] of the default logger.
pub fn statistics() -> Statistics {
    DEFAULT_LOGGER.statistics()
}

/// Logs a printf-style message.
///
/// The format string is checked at compile time and its conversion count
/// must match the number of arguments. Arguments are only evaluated when
/// the severity passes the current level.
///
/// ```no_run
/// use nanolog::nano_log;
///
/// nano_log!(Notice, "value=%d", 7);
/// nano_log!(Warning, "%s took %.2f ms", "flush", 1.5);
/// nanolog::sync().unwrap();
/// ```
///
/// Use `logger: <expr>` as the first argument to log through a specific
/// [`Logger`] instead of the default one.
#[macro_export]
macro_rules! nano_log {
    (logger: $logger:expr, $severity:ident, $fmt:literal $(, $arg:expr)* $(,)?) => {{
        const _: () = {
            assert!(
                $crate::log_format::validate_format($fmt),
                "invalid printf-style format string"
            );
            assert!(
                $crate::log_format::count_specifiers($fmt) == $crate::__nano_log_count!($($arg),*),
                "number of arguments does not match the format string"
            );
        };
        static __NANO_LOG_SITE: $crate::log_site::CallSite = $crate::log_site::CallSite::new(
            $fmt,
            $crate::log_site::Severity::$severity,
            concat!(file!(), ":", line!()),
        );
        if $crate::log_site::is_enabled(__NANO_LOG_SITE.severity()) {
            $logger.log(&__NANO_LOG_SITE, ($(&$arg,)*));
        }
    }};
    ($severity:ident, $fmt:literal $(, $arg:expr)* $(,)?) => {
        $crate::nano_log!(logger: $crate::runtime::default_logger(), $severity, $fmt $(, $arg)*)
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __nano_log_count {
    () => { 0usize };
    ($head:expr $(, $tail:expr)*) => { 1usize + $crate::__nano_log_count!($($tail),*) };
}
