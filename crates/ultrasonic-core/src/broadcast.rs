use crate::frame::WireFrame;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

pub const DEFAULT_SUBSCRIBER_QUEUE: usize = 4;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct BroadcastSnapshot {
    pub subscriber_count: usize,
    pub total_published: u64,
    pub total_dropped: u64,
    pub latest_sequence: u64,
}

struct Shared {
    tx: broadcast::Sender<Arc<WireFrame>>,
    latest: RwLock<Option<Arc<WireFrame>>>,
    published: AtomicU64,
    dropped: AtomicU64,
}

/// Per-device fan-out hub with latest-wins semantics for slow consumers.
///
/// `publish` never blocks the producer: each subscriber sits behind a
/// bounded queue and a consumer that falls behind loses the oldest frames,
/// not the producer's time. The hub outlives pipeline restarts so
/// subscribers just observe a sequence gap.
pub struct Broadcaster {
    shared: Arc<Shared>,
}

impl Broadcaster {
    pub fn new(subscriber_queue: usize) -> Self {
        let (tx, _) = broadcast::channel(subscriber_queue.max(1));
        Self {
            shared: Arc::new(Shared {
                tx,
                latest: RwLock::new(None),
                published: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    pub fn publish(&self, frame: Arc<WireFrame>) {
        match self.shared.latest.write() {
            Ok(mut latest) => *latest = Some(frame.clone()),
            Err(poisoned) => *poisoned.into_inner() = Some(frame.clone()),
        }
        self.shared.published.fetch_add(1, Ordering::Relaxed);
        // Err means no live subscribers; the frame stays cached as "latest".
        let _ = self.shared.tx.send(frame);
    }

    pub fn subscribe(&self) -> Subscription {
        let pending_latest = match self.shared.latest.read() {
            Ok(latest) => latest.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        Subscription {
            rx: self.shared.tx.subscribe(),
            pending_latest,
            last_sequence: 0,
            dropped_by_lag: 0,
            shared: self.shared.clone(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.tx.receiver_count()
    }

    pub fn snapshot(&self) -> BroadcastSnapshot {
        let latest_sequence = match self.shared.latest.read() {
            Ok(latest) => latest.as_ref().map(|f| f.sequence_id).unwrap_or(0),
            Err(poisoned) => poisoned
                .into_inner()
                .as_ref()
                .map(|f| f.sequence_id)
                .unwrap_or(0),
        };
        BroadcastSnapshot {
            subscriber_count: self.shared.tx.receiver_count(),
            total_published: self.shared.published.load(Ordering::Relaxed),
            total_dropped: self.shared.dropped.load(Ordering::Relaxed),
            latest_sequence,
        }
    }
}

/// One subscriber's view of a broadcaster. Dropping it unsubscribes.
pub struct Subscription {
    rx: broadcast::Receiver<Arc<WireFrame>>,
    pending_latest: Option<Arc<WireFrame>>,
    last_sequence: u64,
    dropped_by_lag: u64,
    shared: Arc<Shared>,
}

impl Subscription {
    /// Next frame in strictly increasing sequence order. The first delivery
    /// may be the cached latest frame; `None` means the hub shut down.
    pub async fn next(&mut self) -> Option<Arc<WireFrame>> {
        if let Some(frame) = self.pending_latest.take() {
            self.last_sequence = frame.sequence_id;
            return Some(frame);
        }
        loop {
            match self.rx.recv().await {
                Ok(frame) => {
                    if frame.sequence_id <= self.last_sequence {
                        continue;
                    }
                    self.last_sequence = frame.sequence_id;
                    return Some(frame);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    self.dropped_by_lag += skipped;
                    self.shared.dropped.fetch_add(skipped, Ordering::Relaxed);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn dropped_by_lag(&self) -> u64 {
        self.dropped_by_lag
    }

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }
}
