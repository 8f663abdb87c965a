//! Combines the API-frame codec with the serial transport: builds and
//! sends TX-request/AT-command frames, and dispatches parsed incoming
//! frames to pending TX-status/AT-response completions or to the RF
//! receive sink.

use crate::config::Config;
use crate::counters::Counters;
use crate::oneshot::{CancelToken, Completion, WaitError};
use crate::serial::{SerialReader, SerialSink};
use slog::Logger;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use xbee_frame::{ApiFrame, FrameBuilder, FrameIdAllocator, FrameParser};

const SETTLE_DELAY: Duration = Duration::from_millis(200);
const ADDRESS_READBACK_TIMEOUT: Duration = Duration::from_secs(2);

/// The outcome of a status-tracked transmit request.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct TxStatus {
    pub delivery_status: u8,
    pub discovery_status: u8,
}

/// The seam the fragment receiver/transmitter send RF payloads through,
/// so tests can swap in an in-memory peer instead of a real radio.
pub trait RfTransmit: Send + Sync {
    fn transmit(&self, dest64: u64, rf_data: &[u8]) -> io::Result<()>;
}

/// Receives fully reassembled RF payloads from 0x90/0x91 frames.
pub trait RfSink: Send + Sync {
    fn on_rf_received(&self, data: &[u8], src64: u64);
}

struct PendingMaps {
    tx_status: HashMap<u8, Completion<Option<TxStatus>>>,
    at_response: HashMap<u8, Completion<Option<(u8, Vec<u8>)>>>,
}

/// The XBee radio reachable over a serial port, addressed by 64-bit
/// hardware address.
pub struct XbeeDevice {
    log: Logger,
    config: Config,
    serial: Arc<SerialReader>,
    parser: Mutex<FrameParser>,
    tx_ids: Mutex<FrameIdAllocator>,
    at_ids: Mutex<FrameIdAllocator>,
    pending: Mutex<PendingMaps>,
    own_address: AtomicU64,
    rf_sink: Mutex<Option<Arc<dyn RfSink>>>,
    counters: Arc<Counters>,
}

impl XbeeDevice {
    pub fn new<L: Into<Option<Logger>>>(config: Config, counters: Arc<Counters>, log: L) -> Arc<XbeeDevice> {
        let log = log.into().unwrap_or_else(|| Logger::root(slog::Discard, slog::o!()));
        Arc::new(XbeeDevice {
            log: log.new(slog::o!("component" => "xbee_device")),
            serial: Arc::new(SerialReader::new(log.clone())),
            config,
            parser: Mutex::new(FrameParser::new()),
            tx_ids: Mutex::new(FrameIdAllocator::new()),
            at_ids: Mutex::new(FrameIdAllocator::new()),
            pending: Mutex::new(PendingMaps {
                tx_status: HashMap::new(),
                at_response: HashMap::new(),
            }),
            own_address: AtomicU64::new(0),
            rf_sink: Mutex::new(None),
            counters,
        })
    }

    pub fn set_rf_sink(&self, sink: Arc<dyn RfSink>) {
        *self.rf_sink.lock().unwrap() = Some(sink);
    }

    /// Opens the port, waits briefly for the radio to settle, then reads
    /// its own 64-bit address via `SH`/`SL`. Failing to read either leaves
    /// the address at zero and only logs a warning.
    pub fn connect(self: &Arc<Self>, path: &str) -> io::Result<()> {
        self.serial.open(path, &self.config, self.clone())?;
        std::thread::sleep(SETTLE_DELAY);

        let sh = self.read_address_half(*b"SH");
        let sl = self.read_address_half(*b"SL");
        match (sh, sl) {
            (Some(sh), Some(sl)) => {
                self.own_address.store(((sh as u64) << 32) | sl as u64, Ordering::SeqCst);
            }
            _ => {
                slog::warn!(self.log, "failed to read own address via SH/SL");
            }
        }
        Ok(())
    }

    /// Sends a local AT command and awaits its response: `(status, data)`,
    /// or the given timeout/cancellation.
    pub fn at_command(
        &self,
        code: [u8; 2],
        params: Option<&[u8]>,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<(u8, Vec<u8>), WaitError> {
        let (frame_id, wire) = {
            let mut ids = self.at_ids.lock().unwrap();
            FrameBuilder::at_command(&mut ids, code, params)
        };
        let completion = self.register_at_response(frame_id);
        if self.serial.write_frame(&wire).is_err() {
            self.pending.lock().unwrap().at_response.remove(&frame_id);
            return Err(WaitError::Cancelled);
        }
        match completion.wait(timeout, cancel)? {
            Some(response) => Ok(response),
            None => Err(WaitError::Cancelled),
        }
    }

    fn read_address_half(&self, code: [u8; 2]) -> Option<u32> {
        match self.at_command(code, None, ADDRESS_READBACK_TIMEOUT, &CancelToken::new()) {
            Ok((status, data)) if status == 0 && data.len() == 4 => {
                Some(u32::from_be_bytes([data[0], data[1], data[2], data[3]]))
            }
            _ => None,
        }
    }

    pub fn own_address(&self) -> u64 {
        self.own_address.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.serial.is_open()
    }

    pub fn disconnect(&self) {
        self.serial.close();
        self.fail_all_pending();
    }

    /// Fire-and-forget send: `frame_id = 0`, no TX-status requested.
    pub fn send(&self, dest64: u64, rf_data: &[u8]) -> Result<(), io::Error> {
        let (_, wire) = FrameBuilder::tx_request(dest64, rf_data, 0);
        self.serial.write_frame(&wire)
    }

    /// Status-tracked send: assigns a frame id and awaits the matching
    /// TX-status, or the given timeout.
    pub fn send_with_status(
        &self,
        dest64: u64,
        rf_data: &[u8],
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<TxStatus, WaitError> {
        let frame_id = self.tx_ids.lock().unwrap().next_id();
        let (_, wire) = FrameBuilder::tx_request(dest64, rf_data, frame_id);
        let completion = self.register_tx_status(frame_id);

        if self.serial.write_frame(&wire).is_err() {
            self.pending.lock().unwrap().tx_status.remove(&frame_id);
            return Err(WaitError::Cancelled);
        }

        match completion.wait(timeout, cancel)? {
            Some(status) => Ok(status),
            None => Err(WaitError::Cancelled),
        }
    }

    fn register_tx_status(&self, frame_id: u8) -> Completion<Option<TxStatus>> {
        let completion = Completion::new();
        self.pending.lock().unwrap().tx_status.insert(frame_id, completion.clone());
        completion
    }

    fn register_at_response(&self, frame_id: u8) -> Completion<Option<(u8, Vec<u8>)>> {
        let completion = Completion::new();
        self.pending.lock().unwrap().at_response.insert(frame_id, completion.clone());
        completion
    }

    /// Resolves every pending slot with failure, e.g. on disconnect.
    fn fail_all_pending(&self) {
        let mut pending = self.pending.lock().unwrap();
        for (_, completion) in pending.tx_status.drain() {
            completion.resolve(None);
        }
        for (_, completion) in pending.at_response.drain() {
            completion.resolve(None);
        }
    }

    fn dispatch(&self, frame: ApiFrame) {
        match frame {
            ApiFrame::RxPacket { src64, rf_data, .. } => {
                if let Some(sink) = self.rf_sink.lock().unwrap().as_ref() {
                    sink.on_rf_received(&rf_data, src64);
                }
            }
            ApiFrame::TxStatus {
                frame_id,
                delivery_status,
                discovery_status,
                ..
            } => {
                if let Some(completion) = self.pending.lock().unwrap().tx_status.remove(&frame_id) {
                    completion.resolve(Some(TxStatus {
                        delivery_status,
                        discovery_status,
                    }));
                }
            }
            ApiFrame::AtResponse { frame_id, status, data, .. } => {
                if let Some(completion) = self.pending.lock().unwrap().at_response.remove(&frame_id) {
                    completion.resolve(Some((status, data)));
                }
            }
        }
    }
}

impl RfTransmit for XbeeDevice {
    fn transmit(&self, dest64: u64, rf_data: &[u8]) -> io::Result<()> {
        self.send(dest64, rf_data)
    }
}

impl SerialSink for XbeeDevice {
    fn on_bytes(&self, bytes: &[u8]) {
        let results = self.parser.lock().unwrap().feed_bytes(bytes);
        for result in results {
            match result {
                Ok(frame) => self.dispatch(frame),
                Err(e) => {
                    self.counters.inc_crc_failures();
                    slog::debug!(self.log, "dropped malformed api frame"; "error" => format!("{}", e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct RecordingSink {
        events: StdMutex<Vec<(Vec<u8>, u64)>>,
    }

    impl RfSink for RecordingSink {
        fn on_rf_received(&self, data: &[u8], src64: u64) {
            self.events.lock().unwrap().push((data.to_vec(), src64));
        }
    }

    fn device() -> Arc<XbeeDevice> {
        XbeeDevice::new(Config::default(), Arc::new(Counters::new()), None)
    }

    #[test]
    fn disconnect_without_connect_does_not_panic() {
        let device = device();
        device.disconnect();
        assert!(!device.is_connected());
    }

    #[test]
    fn rx_packet_bytes_reach_the_rf_sink() {
        let device = device();
        let sink = Arc::new(RecordingSink { events: StdMutex::new(Vec::new()) });
        device.set_rf_sink(sink.clone());

        let mut body = vec![0x90u8];
        body.extend_from_slice(&0x0013A200_40000001u64.to_be_bytes());
        body.extend_from_slice(&0xFFFEu16.to_be_bytes());
        body.push(0x01);
        body.extend_from_slice(b"hello");

        let len = body.len() as u16;
        let checksum = 0xFFu8.wrapping_sub(body.iter().fold(0u8, |a, &b| a.wrapping_add(b)));
        let mut wire = vec![0x7E];
        wire.extend_from_slice(&len.to_be_bytes());
        wire.extend_from_slice(&body);
        wire.push(checksum);

        device.on_bytes(&wire);

        let events = sink.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, b"hello");
        assert_eq!(events[0].1, 0x0013A200_40000001);
    }

    #[test]
    fn send_without_open_port_fails() {
        let device = device();
        assert!(device.send(0x1, b"x").is_err());
    }

    #[test]
    fn at_command_without_open_port_fails_fast() {
        let device = device();
        let result = device.at_command(*b"SH", None, Duration::from_millis(50), &CancelToken::new());
        assert_eq!(result, Err(WaitError::Cancelled));
    }

    #[test]
    fn at_command_resolves_from_dispatched_response() {
        let device = device();
        let frame_id = {
            let mut ids = device.at_ids.lock().unwrap();
            ids.next_id()
        };
        let completion = device.register_at_response(frame_id);

        device.dispatch(ApiFrame::AtResponse {
            frame_id,
            at_code: *b"SH",
            status: 0,
            data: vec![0x12, 0x34, 0x56, 0x78],
        });

        let (status, data) = completion.wait(Duration::from_millis(10), &CancelToken::new()).unwrap().unwrap();
        assert_eq!(status, 0);
        assert_eq!(data, vec![0x12, 0x34, 0x56, 0x78]);
    }

    #[test]
    fn tx_status_dispatch_resolves_pending_completion() {
        let device = device();
        let completion = device.register_tx_status(7);

        device.dispatch(ApiFrame::TxStatus {
            frame_id: 7,
            dst16: 0xFFFE,
            retries: 0,
            delivery_status: 0,
            discovery_status: 0,
        });

        let status = completion
            .wait(Duration::from_millis(10), &CancelToken::new())
            .unwrap()
            .unwrap();
        assert_eq!(status.delivery_status, 0);
    }
}
