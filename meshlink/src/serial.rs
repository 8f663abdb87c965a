//! Owns the physical serial port: opens it 8N1 with the configured
//! buffers, and runs a background reader thread pumping bytes into a
//! single registered sink. No `serialport`/physical-I/O precedent exists
//! in the teacher or the rest of the pack, so this crate is sourced
//! directly from the wider ecosystem (see DESIGN.md).

use crate::config::Config;
use slog::Logger;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const SCRATCH_SIZE: usize = 1024;

/// Receives a batch of freshly read bytes from the reader thread.
pub trait SerialSink: Send + Sync {
    fn on_bytes(&self, bytes: &[u8]);
}

/// Owns an open serial port and the background thread draining it.
pub struct SerialReader {
    log: Logger,
    port: Mutex<Option<Box<dyn serialport::SerialPort>>>,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SerialReader {
    pub fn new<L: Into<Option<Logger>>>(log: L) -> SerialReader {
        let log = log.into().unwrap_or_else(|| Logger::root(slog::Discard, slog::o!()));
        SerialReader {
            log: log.new(slog::o!("component" => "serial_reader")),
            port: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    /// Opens `path` at the configured baud rate and buffer sizes, and
    /// starts the background reader feeding `sink`.
    pub fn open(&self, path: &str, config: &Config, sink: Arc<dyn SerialSink>) -> io::Result<()> {
        let port = serialport::new(path, config.baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .timeout(Duration::from_millis(100))
            .open()?;

        let _ = port.clear(serialport::ClearBuffer::All);

        *self.port.lock().unwrap() = Some(port);
        self.spawn_reader(sink);
        Ok(())
    }

    fn spawn_reader(&self, sink: Arc<dyn SerialSink>) {
        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        let port_handle = self.port.lock().unwrap().as_ref().unwrap().try_clone();
        let log = self.log.clone();

        let mut reader = match port_handle {
            Ok(reader) => reader,
            Err(e) => {
                slog::error!(log, "failed to clone serial handle"; "error" => e.to_string());
                self.running.store(false, Ordering::SeqCst);
                return;
            }
        };

        let handle = thread::spawn(move || {
            let mut scratch = [0u8; SCRATCH_SIZE];
            while running.load(Ordering::SeqCst) {
                match reader.read(&mut scratch) {
                    Ok(0) => {}
                    Ok(n) => sink.on_bytes(&scratch[..n]),
                    Err(e) if e.kind() == io::ErrorKind::TimedOut => {}
                    Err(e) => {
                        slog::warn!(log, "serial read error"; "error" => e.to_string());
                        thread::sleep(Duration::from_millis(50));
                    }
                }
            }
        });
        *self.handle.lock().unwrap() = Some(handle);
    }

    /// Writes a complete, already-framed buffer. Short writes are not
    /// expected since the API-frame codec always produces whole frames.
    pub fn write_frame(&self, frame: &[u8]) -> io::Result<()> {
        let mut guard = self.port.lock().unwrap();
        match guard.as_mut() {
            Some(port) => port.write_all(frame),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "serial port closed")),
        }
    }

    pub fn is_open(&self) -> bool {
        self.port.lock().unwrap().is_some()
    }

    /// Idempotent close: signals the reader to stop and joins it. The
    /// reader's own 100ms read timeout bounds how long this blocks.
    pub fn close(&self) {
        self.running.store(false, Ordering::SeqCst);
        *self.port.lock().unwrap() = None;
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Default for SerialReader {
    fn default() -> Self {
        SerialReader::new(None)
    }
}

impl Drop for SerialReader {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct RecordingSink {
        batches: StdMutex<Vec<Vec<u8>>>,
    }

    impl SerialSink for RecordingSink {
        fn on_bytes(&self, bytes: &[u8]) {
            self.batches.lock().unwrap().push(bytes.to_vec());
        }
    }

    #[test]
    fn close_without_open_is_a_no_op() {
        let reader = SerialReader::new(None);
        reader.close();
        assert!(!reader.is_open());
    }

    #[test]
    fn write_to_closed_port_fails_without_panicking() {
        let reader = SerialReader::new(None);
        let err = reader.write_frame(&[0x7E, 0x00, 0x01]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[test]
    fn sink_trait_is_object_safe_and_callable() {
        let sink = Arc::new(RecordingSink { batches: StdMutex::new(Vec::new()) });
        sink.on_bytes(&[1, 2, 3]);
        assert_eq!(sink.batches.lock().unwrap().len(), 1);
    }
}
