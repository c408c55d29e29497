//! Message broker relaying writes to every attached reader.
//!
//! The broker owns a single listening task. Readers subscribe with a small
//! bounded buffer; a write that would block a slow reader is dropped for
//! that reader only. Fan-out is best effort: every message carries full
//! state, so a dropped message is superseded by the next one.

use log::debug;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Buffer size of each reader channel.
const READER_BUFFER: usize = 5;

#[derive(Clone)]
pub struct Broker<T> {
    tx_source: mpsc::Sender<T>,
    tx_readers: mpsc::Sender<mpsc::Sender<T>>,
}

impl<T: Clone + Send + 'static> Broker<T> {
    /// Creates a broker and spawns its listening task. The task ends once
    /// every broker handle has been dropped.
    pub fn new() -> Self {
        let (tx_source, mut rx_source) = mpsc::channel::<T>(1);
        let (tx_readers, mut rx_readers) = mpsc::channel::<mpsc::Sender<T>>(1);

        tokio::spawn(async move {
            let mut readers: Vec<mpsc::Sender<T>> = Vec::new();

            loop {
                tokio::select! {
                    reader = rx_readers.recv() => match reader {
                        Some(tx) => readers.push(tx),
                        None => break,
                    },
                    msg = rx_source.recv() => match msg {
                        Some(msg) => {
                            readers.retain(|tx| match tx.try_send(msg.clone()) {
                                Ok(()) => true,
                                Err(TrySendError::Full(_)) => {
                                    // slow reader, drop the message for it
                                    debug!("Dropping broker message for a slow reader");
                                    true
                                }
                                Err(TrySendError::Closed(_)) => false,
                            });
                        }
                        None => break,
                    },
                }
            }
        });

        Self {
            tx_source,
            tx_readers,
        }
    }

    /// Attaches a new reader and returns its receiving end.
    pub async fn subscribe(&self) -> mpsc::Receiver<T> {
        let (tx, rx) = mpsc::channel(READER_BUFFER);
        let _ = self.tx_readers.send(tx).await;

        rx
    }

    /// Relays a message to all currently attached readers.
    pub async fn publish(&self, msg: T) {
        let _ = self.tx_source.send(msg).await;
    }
}

impl<T: Clone + Send + 'static> Default for Broker<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fans_out_to_multiple_readers() {
        let broker = Broker::new();

        let mut readers = Vec::new();
        for _ in 0..3 {
            readers.push(broker.subscribe().await);
        }

        for i in 0..3 {
            broker.publish(i).await;
        }

        for rx in &mut readers {
            for expected in 0..3 {
                assert_eq!(rx.recv().await, Some(expected));
            }
        }
    }

    #[tokio::test]
    async fn accepts_multiple_writers() {
        let broker = Broker::new();
        let mut rx = broker.subscribe().await;

        for _ in 0..3 {
            let writer = broker.clone();
            tokio::spawn(async move {
                writer.publish("dummy").await;
            });
        }

        for _ in 0..3 {
            assert_eq!(rx.recv().await, Some("dummy"));
        }
    }

    #[tokio::test]
    async fn drops_messages_for_slow_readers_only() {
        let broker = Broker::new();

        let mut stalled = broker.subscribe().await;
        let mut active = broker.subscribe().await;

        // the active reader keeps up and sees every message; awaiting its
        // copy guarantees the fan-out of each message has happened before
        // the next publish
        for i in 0..8 {
            broker.publish(i).await;
            assert_eq!(active.recv().await, Some(i));
        }

        // the stalled reader kept only its buffer's worth; the rest were
        // dropped rather than blocking the broker
        let mut received = Vec::new();
        while let Ok(msg) = stalled.try_recv() {
            received.push(msg);
        }
        assert_eq!(received, vec![0, 1, 2, 3, 4]);
    }
}
