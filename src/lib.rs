//! # nanolog
//!
//! A low-latency logging engine that keeps formatting and I/O off the
//! calling thread:
//!
//! * **Cheap log calls**: a level check, a cached site id and a copy of the
//!   raw arguments into a per-thread lock-free ring
//! * **Compact files**: format strings are stored once per file, records
//!   carry only binary arguments and are LZ4-compressed in blocks
//! * **Offline rendering**: the `decompressor` tool turns a log file back
//!   into text
//!
//! ## Main Components
//!
//! * `log_site`: registry giving every log statement a numeric id, plus the
//!   runtime level
//! * `packer`: binary encoding of log arguments
//! * `staging_buffer`: single-producer/single-consumer byte ring
//! * `runtime`: the `Logger` and its background writer thread
//! * `container`: the on-disk file format
//! * `log_reader`: decoding log files back into entries and text
//! * `efficient_clock`: CPU-counter timestamps
//!
//! ## Quick Start
//!
//! ```no_run
//! use nanolog::{nano_log, Severity};
//!
//! nanolog::set_output_path("/tmp/service.nlog").unwrap();
//! nanolog::set_level(Severity::Debug);
//!
//! nano_log!(Notice, "listening on port %d", 8080);
//! nano_log!(Debug, "%s cache hit ratio %.2f", "session", 0.93);
//!
//! nanolog::sync().unwrap();
//! println!("{}", nanolog::statistics());
//! ```
//!
//! The file can then be expanded with `decompressor decompress /tmp/service.nlog`.

pub mod config;
pub mod container;
pub mod efficient_clock;
pub mod error;
pub mod log_format;
pub mod log_reader;
pub mod log_site;
pub mod packer;
pub mod runtime;
pub mod staging_buffer;

pub use config::LoggerConfig;
pub use container::Storage;
pub use error::{DecodeError, Error, RecordError};
pub use log_reader::{DecodeSummary, LogEntry, LogReader};
pub use log_site::{current_level, set_level, Severity};
pub use packer::{ArgType, ArgValue, Loggable};
pub use runtime::{preallocate, set_output_path, statistics, sync, Logger, Statistics};
