//! Fragment receiver: the single dispatcher for inbound RF payloads.
//! DATA fragments are reassembled here; NACK and DONE are parsed and
//! forwarded upward to whoever handles transmitter-side retransmission
//! (the facade wires the transmitter in after construction).

use crate::config::Config;
use crate::counters::Counters;
use crate::device::{RfSink, RfTransmit};
use crate::session::{HousekeepingSink, SessionManager};
use slog::Logger;
use std::sync::{Arc, Mutex};
use xbee_frame::fragment;

/// Delivers a fully reassembled application message, and forwards parsed
/// NACK/DONE messages to the transmitter.
pub trait NackDoneSink: Send + Sync {
    fn handle_nack(&self, msg_id: u16, missing_indices: Vec<u16>);
    fn handle_done(&self, msg_id: u16);
}

/// Delivers a fully reassembled application message to the facade.
pub trait MessageSink: Send + Sync {
    fn on_message(&self, data: Vec<u8>, src64: u64);
}

pub struct FragmentReceiver {
    log: Logger,
    config: Config,
    sessions: Arc<SessionManager>,
    device: Arc<dyn RfTransmit>,
    counters: Arc<Counters>,
    upstream: Mutex<Option<Arc<dyn NackDoneSink>>>,
    message_sink: Mutex<Option<Arc<dyn MessageSink>>>,
}

impl FragmentReceiver {
    pub fn new<L: Into<Option<Logger>>>(
        config: Config,
        sessions: Arc<SessionManager>,
        device: Arc<dyn RfTransmit>,
        counters: Arc<Counters>,
        log: L,
    ) -> Arc<FragmentReceiver> {
        let log = log.into().unwrap_or_else(|| Logger::root(slog::Discard, slog::o!()));
        Arc::new(FragmentReceiver {
            log: log.new(slog::o!("component" => "fragment_receiver")),
            config,
            sessions,
            device,
            counters,
            upstream: Mutex::new(None),
            message_sink: Mutex::new(None),
        })
    }

    pub fn set_upstream(&self, upstream: Arc<dyn NackDoneSink>) {
        *self.upstream.lock().unwrap() = Some(upstream);
    }

    pub fn set_message_sink(&self, sink: Arc<dyn MessageSink>) {
        *self.message_sink.lock().unwrap() = Some(sink);
    }

    fn handle_data(&self, data: &[u8], src64: u64) {
        let (header, payload) = match fragment::parse_data(data) {
            Ok(parsed) => parsed,
            Err(e) => {
                if matches!(e, xbee_frame::FragmentParseError::BadCrc) {
                    self.counters.inc_crc_failures();
                }
                slog::debug!(self.log, "dropped bad data fragment"; "error" => format!("{}", e));
                return;
            }
        };

        self.counters.inc_fragments_received();

        let session = match self
            .sessions
            .get_or_create_rx_session(header.msg_id, src64, header.total_len, header.frag_cnt)
        {
            Some(session) => session,
            None => {
                slog::debug!(self.log, "fragment disagrees with live session shape"; "msg_id" => header.msg_id);
                return;
            }
        };

        session.try_fill(header.frag_idx, payload);

        if session.is_complete() {
            self.complete_session(&session, src64);
            return;
        }

        if header.frag_idx as u32 + 1 == header.frag_cnt as u32 {
            self.raise_nack(&session);
        }
    }

    fn complete_session(&self, session: &Arc<crate::session::RxSession>, src64: u64) {
        match session.reassemble() {
            Ok(data) => {
                self.counters.inc_messages_completed();
                if let Some(sink) = self.message_sink.lock().unwrap().as_ref() {
                    sink.on_message(data, src64);
                }
                let done = fragment::build_done(session.msg_id);
                let _ = self.device.transmit(src64, &done);
            }
            Err(e) => {
                slog::error!(self.log, "reassembly failed on a complete session"; "error" => format!("{}", e));
            }
        }
        self.sessions.remove_rx_session(session.msg_id);
    }

    /// Builds and sends a NACK for every still-missing slot, bumping the
    /// session's NACK-round counter and dropping it if the budget is
    /// exhausted.
    fn raise_nack(&self, session: &Arc<crate::session::RxSession>) {
        let missing = session.missing_indices();
        let nack = fragment::build_nack(session.msg_id, &missing);
        let _ = self.device.transmit(session.src64, &nack);
        self.counters.inc_nacks_sent();

        if session.bump_nack_round() > self.config.max_nack_rounds {
            slog::warn!(self.log, "rx session exceeded max nack rounds"; "msg_id" => session.msg_id);
            self.sessions.remove_rx_session(session.msg_id);
        }
    }
}

impl RfSink for FragmentReceiver {
    fn on_rf_received(&self, data: &[u8], src64: u64) {
        match fragment::peek_type(data) {
            Some(fragment::TYPE_DATA) => self.handle_data(data, src64),
            Some(fragment::TYPE_NACK) => match fragment::parse_nack(data) {
                Ok(nack) => {
                    if let Some(upstream) = self.upstream.lock().unwrap().as_ref() {
                        upstream.handle_nack(nack.msg_id, nack.missing_indices);
                    }
                }
                Err(e) => slog::debug!(self.log, "dropped bad nack"; "error" => format!("{}", e)),
            },
            Some(fragment::TYPE_DONE) => match fragment::parse_done(data) {
                Ok(msg_id) => {
                    if let Some(upstream) = self.upstream.lock().unwrap().as_ref() {
                        upstream.handle_done(msg_id);
                    }
                }
                Err(e) => slog::debug!(self.log, "dropped bad done"; "error" => format!("{}", e)),
            },
            _ => slog::debug!(self.log, "dropped rf payload of unknown fragment type"),
        }
    }
}

impl HousekeepingSink for FragmentReceiver {
    fn rx_activity_timeout(&self, msg_id: u16) {
        if let Some(session) = self.sessions.get_rx_session(msg_id) {
            if !session.is_complete() {
                self.raise_nack(&session);
            }
        }
    }
}
