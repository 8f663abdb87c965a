//! Fragment transmitter: splits an application payload into pre-encoded
//! DATA fragments, paces the initial send, and drives NACK-triggered
//! retransmission until DONE arrives or the session gives up.

use crate::config::Config;
use crate::counters::Counters;
use crate::device::RfTransmit;
use crate::error::SendOutcome;
use crate::oneshot::{CancelToken, WaitError};
use crate::receiver::NackDoneSink;
use crate::session::{SessionManager, TxSession};
use slog::Logger;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use xbee_frame::fragment::{self, DataHeader};

fn initial_pacing(frag_cnt: usize) -> Duration {
    Duration::from_millis(if frag_cnt <= 10 {
        10
    } else if frag_cnt <= 30 {
        15
    } else if frag_cnt <= 50 {
        20
    } else {
        30
    })
}

fn split_fragments(data: &[u8], payload_size: usize, msg_id: u16) -> Vec<Vec<u8>> {
    let total_len = data.len() as u32;
    if data.is_empty() {
        let header = DataHeader {
            version: fragment::VERSION,
            msg_id,
            total_len: 0,
            frag_idx: 0,
            frag_cnt: 1,
            payload_len: 0,
        };
        return vec![fragment::build_data(&header, &[])];
    }

    let frag_cnt = ((data.len() + payload_size - 1) / payload_size) as u16;
    data.chunks(payload_size)
        .enumerate()
        .map(|(idx, chunk)| {
            let header = DataHeader {
                version: fragment::VERSION,
                msg_id,
                total_len,
                frag_idx: idx as u16,
                frag_cnt,
                payload_len: chunk.len() as u8,
            };
            fragment::build_data(&header, chunk)
        })
        .collect()
}

pub struct FragmentTransmitter {
    log: Logger,
    config: Config,
    sessions: Arc<SessionManager>,
    device: Arc<dyn RfTransmit>,
    counters: Arc<Counters>,
}

impl FragmentTransmitter {
    pub fn new<L: Into<Option<Logger>>>(
        config: Config,
        sessions: Arc<SessionManager>,
        device: Arc<dyn RfTransmit>,
        counters: Arc<Counters>,
        log: L,
    ) -> Arc<FragmentTransmitter> {
        let log = log.into().unwrap_or_else(|| Logger::root(slog::Discard, slog::o!()));
        Arc::new(FragmentTransmitter {
            log: log.new(slog::o!("component" => "fragment_transmitter")),
            config,
            sessions,
            device,
            counters,
        })
    }

    /// Splits, pre-encodes, and sends `data` to `dest64`, then suspends
    /// until DONE, failure, cancellation, or the session-timeout bound.
    pub fn send_message(&self, data: &[u8], dest64: u64, cancel: &CancelToken) -> SendOutcome {
        if data.len() > self.config.max_message_len {
            slog::warn!(self.log, "message exceeds max length"; "len" => data.len());
            return SendOutcome::Failed;
        }

        let msg_id = self.sessions.next_msg_id();
        let fragments = split_fragments(data, self.config.fragment_payload_size as usize, msg_id);
        let frag_cnt = fragments.len();
        let session = self
            .sessions
            .create_tx_session(TxSession::new(msg_id, dest64, data.len(), fragments));

        let pacing = initial_pacing(frag_cnt);
        for (idx, fragment) in session.fragments.iter().enumerate() {
            if cancel.is_cancelled() {
                self.sessions.remove_tx_session(msg_id);
                return SendOutcome::Cancelled;
            }
            let _ = self.device.transmit(dest64, fragment);
            self.counters.inc_fragments_sent();
            if idx + 1 < frag_cnt {
                thread::sleep(pacing);
            }
        }

        let outcome = match session.completion.wait(self.config.session_timeout(), cancel) {
            Ok(true) => SendOutcome::Delivered,
            Ok(false) => SendOutcome::Failed,
            Err(WaitError::Cancelled) => SendOutcome::Cancelled,
            Err(WaitError::TimedOut) => SendOutcome::TimedOut,
        };
        self.sessions.remove_tx_session(msg_id);
        outcome
    }
}

impl NackDoneSink for FragmentTransmitter {
    /// Retransmits exactly the listed indices from the session's stored
    /// fragment array, pausing 20ms every fifth retransmit.
    fn handle_nack(&self, msg_id: u16, missing_indices: Vec<u16>) {
        let session = match self.sessions.get_tx_session(msg_id) {
            Some(session) => session,
            None => return,
        };

        if session.bump_nack_round() > self.config.max_nack_rounds {
            slog::warn!(self.log, "tx session exceeded max nack rounds"; "msg_id" => msg_id);
            session.completion.resolve(false);
            self.sessions.remove_tx_session(msg_id);
            return;
        }

        for (count, &idx) in missing_indices.iter().enumerate() {
            if let Some(fragment) = session.fragments.get(idx as usize) {
                let _ = self.device.transmit(session.dest64, fragment);
                self.counters.add_retransmitted(1);
            }
            if (count + 1) % 5 == 0 {
                thread::sleep(Duration::from_millis(20));
            }
        }
    }

    fn handle_done(&self, msg_id: u16) {
        if let Some(session) = self.sessions.remove_tx_session(msg_id) {
            session.completion.resolve(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::Counters;
    use crate::device::XbeeDevice;

    fn transmitter() -> (Arc<FragmentTransmitter>, Arc<SessionManager>) {
        let config = Config::default();
        let counters = Arc::new(Counters::new());
        let sessions = Arc::new(SessionManager::new(config.clone(), None));
        let device = XbeeDevice::new(config.clone(), counters.clone(), None);
        (
            FragmentTransmitter::new(config, sessions.clone(), device, counters, None),
            sessions,
        )
    }

    #[test]
    fn split_fragments_counts_match_spec_example() {
        let data = vec![0u8; 95];
        let fragments = split_fragments(&data, 30, 1);
        assert_eq!(fragments.len(), 4);
        let (h0, p0) = fragment::parse_data(&fragments[0]).unwrap();
        assert_eq!(h0.frag_cnt, 4);
        assert_eq!(p0.len(), 30);
        let (h3, p3) = fragment::parse_data(&fragments[3]).unwrap();
        assert_eq!(h3.frag_idx, 3);
        assert_eq!(p3.len(), 5);
    }

    #[test]
    fn empty_message_produces_one_zero_length_fragment() {
        let fragments = split_fragments(&[], 30, 1);
        assert_eq!(fragments.len(), 1);
        let (header, payload) = fragment::parse_data(&fragments[0]).unwrap();
        assert_eq!(header.frag_cnt, 1);
        assert_eq!(header.total_len, 0);
        assert!(payload.is_empty());
    }

    #[test]
    fn send_message_times_out_without_a_receiver() {
        let (transmitter, _sessions) = transmitter();
        let mut config = transmitter.config.clone();
        config.session_timeout_ms = 30;
        // Rebuild with a short session timeout so the test doesn't block.
        let counters = Arc::new(Counters::new());
        let sessions = Arc::new(SessionManager::new(config.clone(), None));
        let device = XbeeDevice::new(config.clone(), counters.clone(), None);
        let transmitter = FragmentTransmitter::new(config, sessions.clone(), device, counters, None);

        let outcome = transmitter.send_message(b"hi", 0x1, &CancelToken::new());
        assert_eq!(outcome, SendOutcome::TimedOut);
        assert_eq!(sessions.tx_session_count(), 0);
    }

    #[test]
    fn handle_done_resolves_completion_as_delivered() {
        let (transmitter, sessions) = transmitter();
        let session = sessions.create_tx_session(TxSession::new(5, 0x1, 3, vec![vec![1, 2, 3]]));
        transmitter.handle_done(5);
        assert_eq!(
            session.completion.wait(Duration::from_millis(10), &CancelToken::new()),
            Ok(true)
        );
        assert_eq!(sessions.tx_session_count(), 0);
    }

    #[test]
    fn handle_nack_retransmits_only_listed_indices() {
        let (transmitter, sessions) = transmitter();
        let fragments = split_fragments(&vec![0u8; 95], 30, 1);
        sessions.create_tx_session(TxSession::new(1, 0x1, 95, fragments));

        transmitter.handle_nack(1, vec![1]);
        assert_eq!(transmitter.counters.snapshot().retransmitted, 1);
    }

    #[test]
    fn handle_nack_past_round_budget_fails_the_session() {
        let (transmitter, sessions) = transmitter();
        let session = sessions.create_tx_session(TxSession::new(2, 0x1, 3, vec![vec![1]]));
        for _ in 0..=transmitter.config.max_nack_rounds {
            transmitter.handle_nack(2, vec![0]);
        }
        assert_eq!(
            session.completion.wait(Duration::from_millis(10), &CancelToken::new()),
            Ok(false)
        );
        assert!(sessions.get_tx_session(2).is_none());
    }
}
