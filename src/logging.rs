//! Kernel logger for the `log` facade with optional in-memory capture.
//!
//! Records are formatted as `LEVEL target: message` and handed to a
//! pluggable sink (the serial port on hardware). When capture is enabled the
//! same records are also appended to a fixed buffer that can later be dumped
//! per target.

use core::fmt::{self, Write as _};

use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};
use spin::Mutex;

const CAPTURE_BUF_SIZE: usize = 16 * 1024;

/// Output routine for formatted log lines (without trailing newline).
pub type LogSink = fn(fmt::Arguments<'_>);

struct CaptureState {
    enabled: bool,
    len: usize,
    overflow: bool,
    buf: [u8; CAPTURE_BUF_SIZE],
}

impl CaptureState {
    const fn new() -> Self {
        Self {
            enabled: false,
            len: 0,
            overflow: false,
            buf: [0; CAPTURE_BUF_SIZE],
        }
    }
}

impl fmt::Write for CaptureState {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let bytes = s.as_bytes();
        let remaining = self.buf.len().saturating_sub(self.len);
        let write_len = remaining.min(bytes.len());

        if write_len > 0 {
            let end = self.len + write_len;
            self.buf[self.len..end].copy_from_slice(&bytes[..write_len]);
            self.len = end;
        }

        if write_len < bytes.len() {
            self.overflow = true;
        }
        Ok(())
    }
}

pub struct KernelLogger {
    sink: Mutex<Option<LogSink>>,
    capture: Mutex<CaptureState>,
}

impl KernelLogger {
    pub const fn new() -> Self {
        Self {
            sink: Mutex::new(None),
            capture: Mutex::new(CaptureState::new()),
        }
    }

    pub fn set_sink(&self, sink: Option<LogSink>) {
        *self.sink.lock() = sink;
    }

    /// Enables or disables capture and resets the buffer.
    pub fn set_capture_enabled(&self, enabled: bool) {
        let mut capture = self.capture.lock();
        capture.enabled = enabled;
        capture.len = 0;
        capture.overflow = false;
    }

    /// Feeds every captured message logged under `target` to `f`, oldest first.
    ///
    /// Returns `true` if the buffer overflowed and later records were dropped.
    pub fn for_each_captured(&self, target: &str, mut f: impl FnMut(&str)) -> bool {
        let capture = self.capture.lock();
        let Ok(text) = core::str::from_utf8(&capture.buf[..capture.len]) else {
            return capture.overflow;
        };

        for raw_line in text.split('\n') {
            let Some((line_target, msg)) = raw_line.split_once('|') else {
                continue;
            };
            if line_target == target {
                f(msg);
            }
        }

        capture.overflow
    }
}

impl Default for KernelLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }

        if let Some(sink) = *self.sink.lock() {
            sink(format_args!(
                "{:5} {}: {}",
                record.level(),
                record.target(),
                record.args()
            ));
        }

        let mut capture = self.capture.lock();
        if capture.enabled {
            let _ = writeln!(
                capture,
                "{}|{} {}",
                record.target(),
                record.level(),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

static LOGGER: KernelLogger = KernelLogger::new();

/// The process-wide logger installed by [`init`].
pub fn logger() -> &'static KernelLogger {
    &LOGGER
}

/// Installs the kernel logger as the `log` backend.
pub fn init(level: LevelFilter, sink: Option<LogSink>) -> Result<(), SetLoggerError> {
    LOGGER.set_sink(sink);
    log::set_logger(&LOGGER)?;
    log::set_max_level(level);
    Ok(())
}
