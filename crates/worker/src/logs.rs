//! Per-datum log capture for stats publication.

use std::sync::{Mutex, MutexGuard};

/// Collects one datum's user-visible log bytes (captured user-code output
/// and worker retry messages) so they can be published into the datum's
/// stats tree.
#[derive(Default)]
pub struct DatumLogger {
    buf: Mutex<Vec<u8>>,
}

impl DatumLogger {
    /// Create an empty logger.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.buf.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append raw bytes.
    pub fn write(&self, bytes: &[u8]) {
        self.lock().extend_from_slice(bytes);
    }

    /// Append one line.
    pub fn write_line(&self, line: &str) {
        let mut buf = self.lock();
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
    }

    /// Flush the captured bytes, or `None` when nothing was logged.
    pub fn take(&self) -> Option<Vec<u8>> {
        let mut buf = self.lock();
        if buf.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut *buf))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_drains_and_empties() {
        let logger = DatumLogger::new();
        assert!(logger.take().is_none());

        logger.write(b"stdout bytes");
        logger.write_line("retrying");
        let bytes = logger.take().expect("captured");
        assert_eq!(bytes, b"stdout bytesretrying\n");
        assert!(logger.take().is_none());
    }
}
