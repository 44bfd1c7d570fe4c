//! Preload broker: audio generated before the media socket exists.
//!
//! Outbound calls pre-generate the greeting before dialing; inbound calls
//! start generation in the background while the answer command and the
//! socket race to catch up. Either way the frames land in a per-call queue
//! here, and the session's initial-audio sender drains it once attached.

use crate::error::{BridgeError, Result};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Producer half of a preload queue.
///
/// Dropping the frame sender closes the queue; the consumer observes
/// end-of-stream exactly once.
pub struct PreloadProducer {
    /// Pre-encoded wire-codec frames, in playback order.
    pub frames: mpsc::UnboundedSender<Vec<u8>>,
    /// Greeting text, set once the generation step knows it. The session
    /// late-binds this into history so the first user turn has context.
    pub greeting: watch::Sender<Option<String>>,
}

/// Consumer half of a preload queue.
pub struct PreloadQueue {
    pub frames: mpsc::UnboundedReceiver<Vec<u8>>,
    pub greeting: watch::Receiver<Option<String>>,
}

struct Slot {
    queue: PreloadQueue,
    created_at: Instant,
}

/// Process-wide map from provider call id to its preload queue.
pub struct PreloadBroker {
    ttl: Duration,
    inner: Mutex<HashMap<String, Slot>>,
}

impl PreloadBroker {
    /// Create a broker whose unclaimed queues expire after `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Create the queue for a call id and return the producer half.
    ///
    /// # Errors
    ///
    /// Fails if a queue already exists for the id: two producers for one
    /// call is a bug condition, not a race to tolerate.
    pub fn create(&self, call_id: &str) -> Result<PreloadProducer> {
        let mut map = self.inner.lock().expect("broker lock");
        Self::sweep(&mut map, self.ttl);
        if map.contains_key(call_id) {
            return Err(BridgeError::Preload(format!(
                "preload queue already exists for call {call_id}"
            )));
        }
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (greeting_tx, greeting_rx) = watch::channel(None);
        map.insert(
            call_id.to_owned(),
            Slot {
                queue: PreloadQueue {
                    frames: frame_rx,
                    greeting: greeting_rx,
                },
                created_at: Instant::now(),
            },
        );
        debug!("created preload queue for call {call_id}");
        Ok(PreloadProducer {
            frames: frame_tx,
            greeting: greeting_tx,
        })
    }

    /// Claim the queue for a call id, if one exists. Consumes the entry.
    pub fn take(&self, call_id: &str) -> Option<PreloadQueue> {
        let mut map = self.inner.lock().expect("broker lock");
        Self::sweep(&mut map, self.ttl);
        map.remove(call_id).map(|slot| slot.queue)
    }

    /// Claim the queue for a call id, polling until `total_wait` elapses.
    ///
    /// Inbound calls legitimately start generation after the socket
    /// attaches, so absence now does not mean absence soon. Returns `None`
    /// once the deadline passes.
    pub async fn wait_for(&self, call_id: &str, total_wait: Duration) -> Option<PreloadQueue> {
        const POLL_INTERVAL: Duration = Duration::from_millis(100);
        let deadline = Instant::now() + total_wait;
        loop {
            if let Some(queue) = self.take(call_id) {
                return Some(queue);
            }
            if Instant::now() >= deadline {
                warn!("preload queue never appeared for call {call_id}");
                return None;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    fn sweep(map: &mut HashMap<String, Slot>, ttl: Duration) {
        map.retain(|id, slot| {
            let alive = slot.created_at.elapsed() < ttl;
            if !alive {
                warn!("evicting unclaimed preload queue for call {id}");
            }
            alive
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_producer_is_a_bug_condition() {
        let broker = PreloadBroker::new(Duration::from_secs(60));
        let _producer = broker.create("call-1").expect("create");
        assert!(broker.create("call-1").is_err());
    }

    #[tokio::test]
    async fn frames_drain_in_order_with_one_end_marker() {
        let broker = PreloadBroker::new(Duration::from_secs(60));
        let producer = broker.create("call-1").expect("create");
        for i in 0..5u8 {
            producer.frames.send(vec![i; 4]).expect("send");
        }
        drop(producer);

        let mut queue = broker.take("call-1").expect("take");
        let mut seen = Vec::new();
        while let Some(frame) = queue.frames.recv().await {
            seen.push(frame[0]);
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        // Closed channel keeps reporting end-of-stream without frames.
        assert!(queue.frames.recv().await.is_none());
        // The entry was consumed.
        assert!(broker.take("call-1").is_none());
    }

    #[tokio::test]
    async fn late_queue_is_found_within_the_poll_ceiling() {
        let broker = std::sync::Arc::new(PreloadBroker::new(Duration::from_secs(60)));
        let creator = std::sync::Arc::clone(&broker);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            let producer = creator.create("late").expect("create");
            producer.frames.send(vec![7]).expect("send");
        });

        let mut queue = broker
            .wait_for("late", Duration::from_secs(2))
            .await
            .expect("queue appears");
        assert_eq!(queue.frames.recv().await, Some(vec![7]));
        handle.await.expect("creator task");
    }

    #[tokio::test]
    async fn missing_queue_gives_up_cleanly() {
        let broker = PreloadBroker::new(Duration::from_secs(60));
        let waited = Instant::now();
        assert!(
            broker
                .wait_for("never", Duration::from_millis(300))
                .await
                .is_none()
        );
        assert!(waited.elapsed() >= Duration::from_millis(300));
    }

    #[test]
    fn unclaimed_queue_expires() {
        let broker = PreloadBroker::new(Duration::from_millis(10));
        let _producer = broker.create("old").expect("create");
        std::thread::sleep(Duration::from_millis(25));
        assert!(broker.take("old").is_none());
    }

    #[test]
    fn greeting_late_binding() {
        let broker = PreloadBroker::new(Duration::from_secs(60));
        let producer = broker.create("call-1").expect("create");
        let queue = broker.take("call-1").expect("take");
        assert!(queue.greeting.borrow().is_none());
        producer
            .greeting
            .send(Some("Hello there!".to_owned()))
            .expect("send greeting");
        assert_eq!(queue.greeting.borrow().as_deref(), Some("Hello there!"));
    }
}
