//! Bounded in-memory work queue with a fixed worker pool.
//!
//! Strictly no persistence: a message lives in the FIFO until a worker
//! slot picks it up, and redelivery on loss is the backend's problem.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use common::types::InboundMessage;

const MIN_DRAIN_DEADLINE: Duration = Duration::from_secs(1);
const DRAIN_POLL: Duration = Duration::from_millis(25);

/// Consumer seam for dequeued messages. Implementations own their error
/// handling: a failed message still counts as processed here.
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    async fn process(&self, message: InboundMessage);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum EnqueueError {
    #[error("queue is not accepting new messages")]
    QueueClosed,
    #[error("queue is full (max {max_queue})")]
    QueueFull { max_queue: usize },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueState {
    pub queue_length: usize,
    pub in_flight: usize,
    pub accepting: bool,
    pub max_queue: usize,
}

pub struct WorkQueue {
    shared: Arc<QueueShared>,
}

struct QueueShared {
    items: Mutex<VecDeque<InboundMessage>>,
    notify: Notify,
    accepting: AtomicBool,
    in_flight: AtomicUsize,
    max_queue: usize,
    concurrency: usize,
}

impl WorkQueue {
    pub fn new(
        concurrency: usize,
        max_queue: usize,
        processor: Arc<dyn MessageProcessor>,
    ) -> Self {
        let concurrency = concurrency.max(1);
        let shared = Arc::new(QueueShared {
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            accepting: AtomicBool::new(true),
            in_flight: AtomicUsize::new(0),
            max_queue: max_queue.max(1),
            concurrency,
        });
        for worker_id in 0..concurrency {
            let shared = shared.clone();
            let processor = processor.clone();
            tokio::spawn(worker_loop(shared, processor, worker_id));
        }
        Self { shared }
    }

    pub fn enqueue(&self, message: InboundMessage) -> Result<(), EnqueueError> {
        if !self.shared.accepting.load(Ordering::SeqCst) {
            return Err(EnqueueError::QueueClosed);
        }
        {
            let mut items = lock_items(&self.shared);
            if items.len() >= self.shared.max_queue {
                return Err(EnqueueError::QueueFull {
                    max_queue: self.shared.max_queue,
                });
            }
            items.push_back(message);
        }
        self.shared.notify.notify_one();
        Ok(())
    }

    /// Refuse new messages; queued and in-flight work keeps processing.
    pub fn stop_accepting(&self) {
        self.shared.accepting.store(false, Ordering::SeqCst);
    }

    /// True once the FIFO is empty and no worker is busy; false after the
    /// deadline (which is at least one second) elapses first.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout.max(MIN_DRAIN_DEADLINE);
        loop {
            let state = self.state();
            if state.queue_length == 0 && state.in_flight == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }
    }

    pub fn state(&self) -> QueueState {
        QueueState {
            queue_length: lock_items(&self.shared).len(),
            in_flight: self.shared.in_flight.load(Ordering::SeqCst),
            accepting: self.shared.accepting.load(Ordering::SeqCst),
            max_queue: self.shared.max_queue,
        }
    }

    pub fn concurrency(&self) -> usize {
        self.shared.concurrency
    }
}

async fn worker_loop(
    shared: Arc<QueueShared>,
    processor: Arc<dyn MessageProcessor>,
    worker_id: usize,
) {
    loop {
        // The in-flight count moves up under the same lock as the pop so a
        // drain observer never sees the message in neither place.
        let message = {
            let mut items = lock_items(&shared);
            match items.pop_front() {
                Some(message) => {
                    shared.in_flight.fetch_add(1, Ordering::SeqCst);
                    Some(message)
                }
                None => None,
            }
        };

        match message {
            Some(message) => {
                // The processor owns error callbacks for its failures,
                // panics included; the worker only guarantees the slot
                // comes back.
                let message_id = message.message_id.clone();
                let task = {
                    let processor = processor.clone();
                    tokio::spawn(async move { processor.process(message).await })
                };
                if task.await.is_err() {
                    tracing::error!(
                        worker_id,
                        message_id,
                        "processor task aborted; slot released"
                    );
                }
                shared.in_flight.fetch_sub(1, Ordering::SeqCst);
            }
            None => shared.notify.notified().await,
        }
    }
}

fn lock_items(shared: &QueueShared) -> MutexGuard<'_, VecDeque<InboundMessage>> {
    match shared.items.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
