//! Level changes are process-wide, so everything touching them lives in this
//! one test binary.

mod common;

use std::cell::Cell;

use common::{decode, SharedBuffer};
use nanolog::{current_level, nano_log, set_level, Logger, LoggerConfig, Severity};

#[test]
fn test_level_filtering() {
    assert_eq!(current_level(), Severity::Notice, "default threshold");

    let buffer = SharedBuffer::default();
    let logger = Logger::with_storage(LoggerConfig::default(), buffer.clone());
    let evaluated = Cell::new(0);
    let count = || {
        evaluated.set(evaluated.get() + 1);
        evaluated.get()
    };

    nano_log!(logger: logger, Debug, "hidden %d", count());
    nano_log!(logger: logger, Notice, "shown %d", count());
    assert_eq!(evaluated.get(), 1, "filtered calls must not evaluate arguments");

    logger.set_level(Severity::Error);
    assert_eq!(logger.current_level(), Severity::Error);
    nano_log!(logger: logger, Warning, "hidden %d", count());
    nano_log!(logger: logger, Error, "shown %d", count());

    set_level(Severity::Debug);
    nano_log!(logger: logger, Debug, "shown %d", count());
    logger.sync().unwrap();
    set_level(Severity::Notice);

    let (entries, _) = decode(&buffer.contents());
    let messages: Vec<_> = entries.iter().map(|e| e.message.clone()).collect();
    assert_eq!(messages, vec!["shown 1", "shown 2", "shown 3"]);
    assert_eq!(entries[1].site.severity, Severity::Error);
}
