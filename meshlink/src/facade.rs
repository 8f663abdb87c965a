//! `MeshLink`: combines the device, session manager, fragment receiver and
//! transmitter into the single surface applications talk to. Per the
//! source's design note, the facade is the *only* internal subscriber of
//! the lower layers' one-shot events; `on_message` is the one place a
//! multi-consumer broadcast is exposed outward.

use crate::broadcast::Broadcast;
use crate::config::Config;
use crate::counters::{CounterSnapshot, Counters};
use crate::device::XbeeDevice;
use crate::oneshot::CancelToken;
use crate::receiver::{FragmentReceiver, MessageSink};
use crate::session::SessionManager;
use crate::transmitter::FragmentTransmitter;
use slog::Logger;
use std::io;
use std::sync::mpsc::Receiver;
use std::sync::Arc;

struct MessageRelay {
    broadcast: Arc<Broadcast<(Vec<u8>, u64)>>,
}

impl MessageSink for MessageRelay {
    fn on_message(&self, data: Vec<u8>, src64: u64) {
        self.broadcast.publish((data, src64));
    }
}

pub struct MeshLink {
    log: Logger,
    device: Arc<XbeeDevice>,
    sessions: Arc<SessionManager>,
    transmitter: Arc<FragmentTransmitter>,
    on_message: Arc<Broadcast<(Vec<u8>, u64)>>,
    counters: Arc<Counters>,
}

impl MeshLink {
    pub fn new<L: Into<Option<Logger>>>(config: Config, log: L) -> Arc<MeshLink> {
        let log = log.into().unwrap_or_else(|| Logger::root(slog::Discard, slog::o!()));
        let counters = Arc::new(Counters::new());
        let sessions = Arc::new(SessionManager::new(config.clone(), log.clone()));
        let device = XbeeDevice::new(config.clone(), counters.clone(), log.clone());
        let receiver = FragmentReceiver::new(config.clone(), sessions.clone(), device.clone(), counters.clone(), log.clone());
        let transmitter = FragmentTransmitter::new(config, sessions.clone(), device.clone(), counters.clone(), log.clone());

        device.set_rf_sink(receiver.clone());
        receiver.set_upstream(transmitter.clone());

        let on_message = Arc::new(Broadcast::new());
        receiver.set_message_sink(Arc::new(MessageRelay { broadcast: on_message.clone() }));

        sessions.start_housekeeping(receiver.clone());

        Arc::new(MeshLink {
            log: log.new(slog::o!("component" => "meshlink")),
            device,
            sessions,
            transmitter,
            on_message,
            counters,
        })
    }

    pub fn connect(self: &Arc<Self>, port: &str) -> io::Result<()> {
        slog::info!(self.log, "connecting"; "port" => port);
        self.device.connect(port)
    }

    /// Idempotent: closes the port, fails every pending future, and
    /// clears all live sessions, resolving any TX completion with failure.
    pub fn disconnect(&self) {
        self.device.disconnect();
        self.sessions.dispose();
    }

    /// Suspends until DONE, failure, cancellation, or session-timeout.
    /// `data.len()` must not exceed the configured message limit.
    pub fn send_message(&self, data: &[u8], dest64: u64, cancel: &CancelToken) -> bool {
        self.transmitter.send_message(data, dest64, cancel).succeeded()
    }

    /// Subscribes to the stream of `(data, src64)` events for fully
    /// reassembled inbound messages.
    pub fn on_message(&self) -> Receiver<(Vec<u8>, u64)> {
        self.on_message.subscribe()
    }

    pub fn own_address(&self) -> u64 {
        self.device.own_address()
    }

    pub fn is_connected(&self) -> bool {
        self.device.is_connected()
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn fresh_facade_is_disconnected_with_zero_counters() {
        let mesh = MeshLink::new(Config::default(), None);
        assert!(!mesh.is_connected());
        assert_eq!(mesh.counters(), CounterSnapshot::default());
    }

    #[test]
    fn send_without_connecting_fails_fast() {
        let mut config = Config::default();
        config.session_timeout_ms = 30;
        let mesh = MeshLink::new(config, None);

        let cancel = CancelToken::new();
        assert!(!mesh.send_message(b"hi", 0x1, &cancel));
    }

    #[test]
    fn on_message_has_no_pending_events_before_any_delivery() {
        let mesh = MeshLink::new(Config::default(), None);
        let rx = mesh.on_message();
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn disconnect_resolves_a_pending_send_promptly() {
        let mut config = Config::default();
        config.session_timeout_ms = 5_000;
        config.housekeeping_interval_ms = 10;
        let mesh = MeshLink::new(config, None);

        let other = mesh.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            other.disconnect();
        });

        let start = Instant::now();
        let delivered = mesh.send_message(b"hi", 0x1, &CancelToken::new());

        assert!(!delivered);
        assert!(start.elapsed() < Duration::from_millis(500));
    }
}
