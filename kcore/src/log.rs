//! Ring-buffered, level-filtered kernel log, grounded in the teacher's
//! `lib::printk` + `lib::ringbuf` pair. Output goes through a pluggable
//! [`LogSink`] instead of a hardcoded UART so host-side tests can capture
//! it.

use core::fmt;
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use spin::Mutex;

use crate::config::{LOG_MESSAGE_CAP, LOG_RING_CAPACITY};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Level {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        }
    }
}

static MIN_LEVEL: AtomicU8 = AtomicU8::new(Level::Info as u8);

pub fn set_level(level: Level) {
    MIN_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn min_level() -> Level {
    match MIN_LEVEL.load(Ordering::Relaxed) {
        0 => Level::Error,
        1 => Level::Warn,
        2 => Level::Info,
        3 => Level::Debug,
        _ => Level::Trace,
    }
}

/// Platform hand-off for emitted log lines. Architecture ports back this
/// with a UART; host-side tests back it with an in-memory `Vec<String>`.
pub trait LogSink: Sync {
    fn write_line(&self, level: Level, line: &str);
}

struct NullSink;
impl LogSink for NullSink {
    fn write_line(&self, _level: Level, _line: &str) {}
}

static NULL_SINK: NullSink = NullSink;
static SINK: Mutex<Option<&'static dyn LogSink>> = Mutex::new(None);

/// Install the platform's log sink. Calling this more than once simply
/// replaces the previous sink.
pub fn set_sink(sink: &'static dyn LogSink) {
    *SINK.lock() = Some(sink);
}

fn sink() -> &'static dyn LogSink {
    SINK.lock().unwrap_or(&NULL_SINK)
}

#[derive(Clone, Copy)]
pub struct LogEntry {
    pub seq: u64,
    pub level: Level,
    message: [u8; LOG_MESSAGE_CAP],
    len: usize,
}

impl LogEntry {
    pub fn message(&self) -> &str {
        core::str::from_utf8(&self.message[..self.len]).unwrap_or("<invalid utf8>")
    }
}

struct RingBuffer {
    entries: [Option<LogEntry>; LOG_RING_CAPACITY],
    head: usize,
    tail: usize,
}

impl RingBuffer {
    const fn new() -> Self {
        Self {
            entries: [None; LOG_RING_CAPACITY],
            head: 0,
            tail: 0,
        }
    }

    fn push(&mut self, entry: LogEntry) {
        let next_head = (self.head + 1) % LOG_RING_CAPACITY;
        if next_head == self.tail {
            self.tail = (self.tail + 1) % LOG_RING_CAPACITY;
        }
        self.entries[self.head] = Some(entry);
        self.head = next_head;
    }

    fn drain_all(&mut self) -> alloc::vec::Vec<LogEntry> {
        let mut out = alloc::vec::Vec::new();
        while self.tail != self.head {
            if let Some(entry) = self.entries[self.tail].take() {
                out.push(entry);
            }
            self.tail = (self.tail + 1) % LOG_RING_CAPACITY;
        }
        out
    }
}

static LOG_BUFFER: Mutex<RingBuffer> = Mutex::new(RingBuffer::new());
static SEQ: AtomicUsize = AtomicUsize::new(0);

/// Format `args` into a fixed-size buffer, push it to the ring, and forward
/// it to the installed sink if `level` passes the current filter.
pub fn log(level: Level, args: fmt::Arguments) {
    use core::fmt::Write;

    let mut message = [0u8; LOG_MESSAGE_CAP];
    let mut cursor = FixedWriter {
        buf: &mut message,
        len: 0,
    };
    let _ = write!(cursor, "{}", args);
    let len = cursor.len;

    let entry = LogEntry {
        seq: SEQ.fetch_add(1, Ordering::Relaxed) as u64,
        level,
        message,
        len,
    };

    LOG_BUFFER.lock().push(entry);

    if level <= min_level() {
        sink().write_line(level, entry.message());
    }
}

pub fn drain_all() -> alloc::vec::Vec<LogEntry> {
    LOG_BUFFER.lock().drain_all()
}

struct FixedWriter<'a> {
    buf: &'a mut [u8; LOG_MESSAGE_CAP],
    len: usize,
}

impl fmt::Write for FixedWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let remaining = LOG_MESSAGE_CAP - self.len;
        let take = core::cmp::min(remaining, s.len());
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

#[macro_export]
macro_rules! klog {
    ($level:expr, $($arg:tt)*) => {
        $crate::log::log($level, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => { $crate::klog!($crate::log::Level::Error, $($arg)*) };
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => { $crate::klog!($crate::log::Level::Warn, $($arg)*) };
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => { $crate::klog!($crate::log::Level::Info, $($arg)*) };
}

#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => { $crate::klog!($crate::log::Level::Debug, $($arg)*) };
}

#[macro_export]
macro_rules! trace {
    ($($arg:tt)*) => { $crate::klog!($crate::log::Level::Trace, $($arg)*) };
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize as StdAtomicUsize;

    struct CapturingSink {
        count: StdAtomicUsize,
    }
    impl LogSink for CapturingSink {
        fn write_line(&self, _level: Level, _line: &str) {
            self.count.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn ring_buffer_drains_in_order() {
        let mut rb = RingBuffer::new();
        for i in 0..5u64 {
            rb.push(LogEntry {
                seq: i,
                level: Level::Info,
                message: [0u8; LOG_MESSAGE_CAP],
                len: 0,
            });
        }
        let drained = rb.drain_all();
        assert_eq!(drained.len(), 5);
        for (i, e) in drained.iter().enumerate() {
            assert_eq!(e.seq, i as u64);
        }
    }

    #[test]
    fn log_truncates_to_message_cap() {
        let long = "x".repeat(LOG_MESSAGE_CAP * 2);
        log(Level::Debug, format_args!("{}", long));
        let drained = drain_all();
        let last = drained.last().unwrap();
        assert_eq!(last.message().len(), LOG_MESSAGE_CAP);
    }
}
