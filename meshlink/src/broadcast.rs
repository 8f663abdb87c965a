//! Multi-consumer broadcast for the facade's `on_message` stream. Every
//! other async boundary in this crate is one-shot (see `oneshot.rs`); this
//! is the one exception, per the source's "single subscriber internally,
//! broadcast only at the application edge" design.

use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Mutex;

pub struct Broadcast<T: Clone> {
    subscribers: Mutex<Vec<Sender<T>>>,
}

impl<T: Clone> Broadcast<T> {
    pub fn new() -> Broadcast<T> {
        Broadcast {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Registers a new subscriber and returns its receiving half.
    pub fn subscribe(&self) -> Receiver<T> {
        let (tx, rx) = channel();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    /// Publishes a value to every live subscriber, dropping any whose
    /// receiver has gone away.
    pub fn publish(&self, value: T) {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|tx| tx.send(value.clone()).is_ok());
    }
}

impl<T: Clone> Default for Broadcast<T> {
    fn default() -> Self {
        Broadcast::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn every_subscriber_receives_published_values() {
        let broadcast: Broadcast<u32> = Broadcast::new();
        let a = broadcast.subscribe();
        let b = broadcast.subscribe();

        broadcast.publish(1);
        broadcast.publish(2);

        assert_eq!(a.recv_timeout(Duration::from_secs(1)).unwrap(), 1);
        assert_eq!(a.recv_timeout(Duration::from_secs(1)).unwrap(), 2);
        assert_eq!(b.recv_timeout(Duration::from_secs(1)).unwrap(), 1);
        assert_eq!(b.recv_timeout(Duration::from_secs(1)).unwrap(), 2);
    }

    #[test]
    fn dropped_subscriber_is_pruned_without_error() {
        let broadcast: Broadcast<u32> = Broadcast::new();
        let rx = broadcast.subscribe();
        drop(rx);

        broadcast.publish(1);
        assert_eq!(broadcast.subscribers.lock().unwrap().len(), 0);
    }
}
