#![allow(dead_code)]

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use nanolog::{DecodeSummary, LogEntry, LogReader, Storage};

/// In-memory storage the test keeps a handle to after the logger takes it.
#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Storage for SharedBuffer {
    fn persist(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Storage whose writes fail once `broken` is set.
#[derive(Clone, Default)]
pub struct FlakyStorage {
    pub broken: Arc<AtomicBool>,
}

impl Write for FlakyStorage {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Storage for FlakyStorage {
    fn persist(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub fn decode(bytes: &[u8]) -> (Vec<LogEntry>, DecodeSummary) {
    let mut reader = LogReader::new(bytes).expect("valid header");
    let mut entries = Vec::new();
    while let Some(entry) = reader.read_entry().expect("no fatal decode error") {
        entries.push(entry);
    }
    (entries, reader.summary().clone())
}
