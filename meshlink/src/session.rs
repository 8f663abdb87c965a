//! Session manager: owns the live TX/RX session tables, msg_id allocation,
//! and the periodic housekeeping tick. Mutation discipline follows the
//! teacher's `Endpoint::housekeeping`: snapshot keys, then look up and
//! mutate one session at a time, never while holding the table lock.

use crate::config::Config;
use crate::error::SessionError;
use crate::oneshot::Completion;
use slog::Logger;
use std::collections::HashMap;
use std::panic;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// Sender-side state for one in-flight outbound message.
pub struct TxSession {
    pub msg_id: u16,
    pub dest64: u64,
    pub payload_len: usize,
    /// Pre-encoded fragment-protocol DATA messages, index == frag_idx.
    pub fragments: Vec<Vec<u8>>,
    pub created_at: Instant,
    pub completion: Completion<bool>,
    nack_rounds: AtomicU32,
}

impl TxSession {
    pub fn new(msg_id: u16, dest64: u64, payload_len: usize, fragments: Vec<Vec<u8>>) -> TxSession {
        TxSession {
            msg_id,
            dest64,
            payload_len,
            fragments,
            created_at: Instant::now(),
            completion: Completion::new(),
            nack_rounds: AtomicU32::new(0),
        }
    }

    pub fn nack_rounds(&self) -> u32 {
        self.nack_rounds.load(Ordering::SeqCst)
    }

    /// Increments the NACK-round counter and returns the new value.
    pub fn bump_nack_round(&self) -> u32 {
        self.nack_rounds.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }
}

struct RxSlots {
    slots: Vec<Option<Vec<u8>>>,
    last_activity: Instant,
    nack_rounds: u32,
}

/// Receiver-side state for one in-flight inbound message.
pub struct RxSession {
    pub msg_id: u16,
    pub src64: u64,
    pub total_len: u32,
    pub frag_cnt: u16,
    pub created_at: Instant,
    slots: Mutex<RxSlots>,
}

impl RxSession {
    pub fn new(msg_id: u16, src64: u64, total_len: u32, frag_cnt: u16) -> RxSession {
        let now = Instant::now();
        RxSession {
            msg_id,
            src64,
            total_len,
            frag_cnt,
            created_at: now,
            slots: Mutex::new(RxSlots {
                slots: vec![None; frag_cnt as usize],
                last_activity: now,
                nack_rounds: 0,
            }),
        }
    }

    /// Fills `slots[frag_idx]` with `payload` if it is empty and in range.
    /// Returns `true` if the fragment was newly stored, `false` if it was
    /// out of range or a duplicate.
    pub fn try_fill(&self, frag_idx: u16, payload: &[u8]) -> bool {
        if frag_idx >= self.frag_cnt {
            return false;
        }
        let mut state = self.slots.lock().unwrap();
        state.last_activity = Instant::now();
        let idx = frag_idx as usize;
        if state.slots[idx].is_some() {
            return false;
        }
        state.slots[idx] = Some(payload.to_vec());
        true
    }

    pub fn touch(&self) {
        self.slots.lock().unwrap().last_activity = Instant::now();
    }

    pub fn last_activity(&self) -> Instant {
        self.slots.lock().unwrap().last_activity
    }

    pub fn is_complete(&self) -> bool {
        self.slots.lock().unwrap().slots.iter().all(Option::is_some)
    }

    /// Sorted indices of slots not yet received.
    pub fn missing_indices(&self) -> Vec<u16> {
        self.slots
            .lock()
            .unwrap()
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| if slot.is_none() { Some(i as u16) } else { None })
            .collect()
    }

    pub fn nack_rounds(&self) -> u32 {
        self.slots.lock().unwrap().nack_rounds
    }

    pub fn bump_nack_round(&self) -> u32 {
        let mut state = self.slots.lock().unwrap();
        state.nack_rounds += 1;
        state.nack_rounds
    }

    /// Concatenates every slot in order, verifying the total length.
    /// Only meaningful once `is_complete` is true.
    pub fn reassemble(&self) -> Result<Vec<u8>, SessionError> {
        let state = self.slots.lock().unwrap();
        let mut out = Vec::with_capacity(self.total_len as usize);
        for slot in state.slots.iter() {
            match slot {
                Some(bytes) => out.extend_from_slice(bytes),
                None => return Err(SessionError::ReassemblyInconsistent),
            }
        }
        if out.len() as u32 != self.total_len {
            return Err(SessionError::ReassemblyInconsistent);
        }
        Ok(out)
    }

    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }
}

/// Callback surface the housekeeping tick drives. Implemented by the
/// fragment receiver, which is the only component that needs to react to
/// RX-side inactivity.
pub trait HousekeepingSink: Send + Sync {
    /// An RX session went quiet for longer than the fragment-timeout bound
    /// without completing: time to raise a NACK.
    fn rx_activity_timeout(&self, msg_id: u16);
}

/// Owns the live TX/RX session tables and msg_id allocation, and drives a
/// background housekeeping tick.
pub struct SessionManager {
    config: Config,
    log: Logger,
    tx_sessions: Mutex<HashMap<u16, Arc<TxSession>>>,
    rx_sessions: Mutex<HashMap<u16, Arc<RxSession>>>,
    next_msg_id: AtomicU64,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    pub fn new<L: Into<Option<Logger>>>(config: Config, log: L) -> SessionManager {
        let log = log.into().unwrap_or_else(|| Logger::root(slog::Discard, slog::o!()));
        SessionManager {
            config,
            log: log.new(slog::o!("component" => "session_manager")),
            tx_sessions: Mutex::new(HashMap::new()),
            rx_sessions: Mutex::new(HashMap::new()),
            next_msg_id: AtomicU64::new(1),
            running: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    /// Allocates the next msg_id, wrapping at 2^16 and skipping 0.
    pub fn next_msg_id(&self) -> u16 {
        loop {
            let candidate = self.next_msg_id.fetch_add(1, Ordering::SeqCst) & 0xFFFF;
            if candidate != 0 {
                return candidate as u16;
            }
        }
    }

    pub fn create_tx_session(&self, session: TxSession) -> Arc<TxSession> {
        let session = Arc::new(session);
        self.tx_sessions.lock().unwrap().insert(session.msg_id, session.clone());
        session
    }

    pub fn get_tx_session(&self, msg_id: u16) -> Option<Arc<TxSession>> {
        self.tx_sessions.lock().unwrap().get(&msg_id).cloned()
    }

    pub fn remove_tx_session(&self, msg_id: u16) -> Option<Arc<TxSession>> {
        self.tx_sessions.lock().unwrap().remove(&msg_id)
    }

    pub fn get_or_create_rx_session(
        &self,
        msg_id: u16,
        src64: u64,
        total_len: u32,
        frag_cnt: u16,
    ) -> Option<Arc<RxSession>> {
        let mut sessions = self.rx_sessions.lock().unwrap();
        if let Some(existing) = sessions.get(&msg_id) {
            if existing.total_len != total_len || existing.frag_cnt != frag_cnt {
                return None;
            }
            return Some(existing.clone());
        }
        let session = Arc::new(RxSession::new(msg_id, src64, total_len, frag_cnt));
        sessions.insert(msg_id, session.clone());
        Some(session)
    }

    pub fn get_rx_session(&self, msg_id: u16) -> Option<Arc<RxSession>> {
        self.rx_sessions.lock().unwrap().get(&msg_id).cloned()
    }

    pub fn remove_rx_session(&self, msg_id: u16) -> Option<Arc<RxSession>> {
        self.rx_sessions.lock().unwrap().remove(&msg_id)
    }

    pub fn tx_session_count(&self) -> usize {
        self.tx_sessions.lock().unwrap().len()
    }

    pub fn rx_session_count(&self) -> usize {
        self.rx_sessions.lock().unwrap().len()
    }

    /// Starts the background housekeeping thread. A no-op if already
    /// running.
    pub fn start_housekeeping(self: &Arc<Self>, sink: Arc<dyn HousekeepingSink>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let manager = self.clone();
        let running = self.running.clone();
        let interval = self.config.housekeeping_interval();
        let handle = thread::spawn(move || {
            while running.load(Ordering::SeqCst) {
                thread::sleep(interval);
                manager.housekeeping_tick(&*sink);
            }
        });
        *self.handle.lock().unwrap() = Some(handle);
    }

    pub fn stop_housekeeping(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    /// Stops housekeeping, then drains both session tables, resolving every
    /// live TX completion with failure so no caller blocked in `send_message`
    /// is left waiting out the session-timeout bound.
    pub fn dispose(&self) {
        self.stop_housekeeping();
        for (_, session) in self.tx_sessions.lock().unwrap().drain() {
            session.completion.resolve(false);
        }
        self.rx_sessions.lock().unwrap().clear();
    }

    /// Runs exactly one housekeeping pass: snapshots keys, then looks up
    /// and mutates one session at a time under no table lock, per the
    /// teacher's discipline. Swallows any panicking callback so the tick
    /// survives a single bad session.
    fn housekeeping_tick(&self, sink: &dyn HousekeepingSink) {
        let fragment_timeout = self.config.fragment_timeout();
        let session_timeout = self.config.session_timeout();

        let rx_keys: Vec<u16> = self.rx_sessions.lock().unwrap().keys().copied().collect();
        for msg_id in rx_keys {
            let session = match self.get_rx_session(msg_id) {
                Some(s) => s,
                None => continue,
            };
            if session.age() >= session_timeout {
                self.remove_rx_session(msg_id);
                slog::warn!(self.log, "rx session timed out"; "msg_id" => msg_id);
                continue;
            }
            if !session.is_complete() && session.last_activity().elapsed() >= fragment_timeout {
                let result = panic::catch_unwind(panic::AssertUnwindSafe(|| sink.rx_activity_timeout(msg_id)));
                if result.is_err() {
                    slog::error!(self.log, "housekeeping callback panicked"; "msg_id" => msg_id);
                }
            }
        }

        let tx_keys: Vec<u16> = self.tx_sessions.lock().unwrap().keys().copied().collect();
        for msg_id in tx_keys {
            let session = match self.get_tx_session(msg_id) {
                Some(s) => s,
                None => continue,
            };
            if session.age() >= session_timeout {
                self.remove_tx_session(msg_id);
                session.completion.resolve(false);
                slog::warn!(self.log, "tx session timed out"; "msg_id" => msg_id);
            }
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.stop_housekeeping();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rx(frag_cnt: u16, total_len: u32) -> RxSession {
        RxSession::new(1, 0x42, total_len, frag_cnt)
    }

    #[test]
    fn fill_rejects_out_of_range_and_duplicate() {
        let session = rx(2, 6);
        assert!(session.try_fill(0, b"abc"));
        assert!(!session.try_fill(0, b"xyz")); // duplicate
        assert!(!session.try_fill(5, b"xyz")); // out of range
        assert!(session.try_fill(1, b"def"));
        assert!(session.is_complete());
    }

    #[test]
    fn missing_indices_reports_empty_slots_sorted() {
        let session = rx(4, 12);
        session.try_fill(2, b"cc");
        assert_eq!(session.missing_indices(), vec![0, 1, 3]);
    }

    #[test]
    fn reassemble_concatenates_in_order() {
        let session = rx(3, 9);
        session.try_fill(1, b"bbb");
        session.try_fill(0, b"aaa");
        session.try_fill(2, b"ccc");
        assert_eq!(session.reassemble().unwrap(), b"aaabbbccc".to_vec());
    }

    #[test]
    fn reassemble_fails_when_incomplete() {
        let session = rx(2, 4);
        session.try_fill(0, b"aa");
        assert_eq!(session.reassemble(), Err(SessionError::ReassemblyInconsistent));
    }

    #[test]
    fn msg_id_allocation_wraps_and_skips_zero() {
        let manager = SessionManager::new(Config::default(), None);
        assert_eq!(manager.next_msg_id(), 1);
        for _ in 0..u16::MAX as u32 {
            manager.next_msg_id();
        }
        assert_ne!(manager.next_msg_id(), 0);
    }

    #[test]
    fn tx_session_create_get_remove_round_trips() {
        let manager = SessionManager::new(Config::default(), None);
        let session = manager.create_tx_session(TxSession::new(5, 0x1, 3, vec![vec![1, 2, 3]]));
        assert_eq!(manager.tx_session_count(), 1);
        assert_eq!(manager.get_tx_session(5).unwrap().dest64, 0x1);
        assert!(manager.remove_tx_session(5).is_some());
        assert_eq!(manager.tx_session_count(), 0);
        let _ = session;
    }

    #[test]
    fn rx_session_rejects_mismatched_redeclaration() {
        let manager = SessionManager::new(Config::default(), None);
        assert!(manager.get_or_create_rx_session(9, 0x1, 10, 2).is_some());
        assert!(manager.get_or_create_rx_session(9, 0x1, 99, 2).is_none());
        assert!(manager.get_or_create_rx_session(9, 0x1, 10, 2).is_some());
    }

    struct RecordingSink {
        hits: Mutex<Vec<u16>>,
    }

    impl HousekeepingSink for RecordingSink {
        fn rx_activity_timeout(&self, msg_id: u16) {
            self.hits.lock().unwrap().push(msg_id);
        }
    }

    #[test]
    fn housekeeping_tick_raises_activity_timeout_and_drops_expired_sessions() {
        let mut config = Config::default();
        config.fragment_timeout_ms = 1;
        config.session_timeout_ms = 10_000;
        let manager = SessionManager::new(config, None);

        manager.get_or_create_rx_session(1, 0x1, 10, 2).unwrap();
        thread::sleep(std::time::Duration::from_millis(5));

        let sink = Arc::new(RecordingSink { hits: Mutex::new(Vec::new()) });
        manager.housekeeping_tick(&*sink);

        assert_eq!(sink.hits.lock().unwrap().as_slice(), &[1]);
        assert_eq!(manager.rx_session_count(), 1); // not yet session-timed-out
    }

    #[test]
    fn housekeeping_tick_fails_tx_session_on_session_timeout() {
        let mut config = Config::default();
        config.session_timeout_ms = 1;
        let manager = SessionManager::new(config, None);
        let session = manager.create_tx_session(TxSession::new(1, 0x1, 3, vec![]));
        thread::sleep(std::time::Duration::from_millis(5));

        let sink = Arc::new(RecordingSink { hits: Mutex::new(Vec::new()) });
        manager.housekeeping_tick(&*sink);

        assert_eq!(manager.tx_session_count(), 0);
        assert_eq!(
            session.completion.wait(
                std::time::Duration::from_millis(10),
                &crate::oneshot::CancelToken::new()
            ),
            Ok(false)
        );
    }

    #[test]
    fn dispose_resolves_tx_completions_and_drains_both_tables() {
        let manager = SessionManager::new(Config::default(), None);
        let session = manager.create_tx_session(TxSession::new(1, 0x1, 3, vec![]));
        manager.get_or_create_rx_session(2, 0x1, 10, 2).unwrap();

        manager.dispose();

        assert_eq!(manager.tx_session_count(), 0);
        assert_eq!(manager.rx_session_count(), 0);
        assert_eq!(
            session.completion.wait(
                std::time::Duration::from_millis(10),
                &crate::oneshot::CancelToken::new()
            ),
            Ok(false)
        );
    }
}
