//! Work queue shared by producers and workers
//!
//! ```text
//!  buffered                         synchronous
//!  ────────                         ───────────
//!  offer ─► [ a b c d ] ─► poll     poll ─► registers a one-shot slot
//!                                   offer ─► hands the item to the oldest
//!                                            live slot, or waits for one
//! ```
//!
//! A synchronous consumer that gives up (timeout or cancellation) closes its
//! slot and recovers any item a producer managed to hand over in between, so
//! a handed-off item always ends up with exactly one worker.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Outcome of [`WorkQueue::offer`]
#[derive(Debug)]
pub(crate) enum Offer<T> {
    Accepted,
    /// Not taken within the wait, or the wait was cancelled
    Pending(T),
    /// The queue no longer accepts items
    Closed(T),
}

enum Refused<T> {
    NoConsumer(T),
    Closed(T),
}

struct QueueState<T> {
    items: VecDeque<T>,
    consumers: VecDeque<oneshot::Sender<T>>,
    closed: bool,
}

pub(crate) struct WorkQueue<T> {
    synchronous: bool,
    state: Mutex<QueueState<T>>,
    item_ready: Notify,
    consumer_ready: Notify,
}

impl<T> WorkQueue<T> {
    pub(crate) fn new(synchronous: bool) -> Self {
        Self {
            synchronous,
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                consumers: VecDeque::new(),
                closed: false,
            }),
            item_ready: Notify::new(),
            consumer_ready: Notify::new(),
        }
    }

    /// Offer an item, waiting at most `wait` for a consumer in synchronous mode
    pub(crate) async fn offer(
        &self,
        item: T,
        wait: Duration,
        cancel: &CancellationToken,
    ) -> Offer<T> {
        let deadline = Instant::now() + wait;
        let mut item = item;
        loop {
            let notified = self.consumer_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            item = match self.try_offer(item) {
                Ok(()) => return Offer::Accepted,
                Err(Refused::Closed(item)) => return Offer::Closed(item),
                Err(Refused::NoConsumer(item)) => item,
            };

            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => return Offer::Pending(item),
                _ = tokio::time::sleep_until(deadline) => return Offer::Pending(item),
            }
        }
    }

    fn try_offer(&self, item: T) -> Result<(), Refused<T>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Refused::Closed(item));
        }

        if !self.synchronous {
            state.items.push_back(item);
            drop(state);
            self.item_ready.notify_one();
            return Ok(());
        }

        let mut item = item;
        while let Some(consumer) = state.consumers.pop_front() {
            match consumer.send(item) {
                Ok(()) => return Ok(()),
                Err(returned) => item = returned,
            }
        }
        Err(Refused::NoConsumer(item))
    }

    /// Take the next item, waiting at most `wait`
    ///
    /// Returns `None` on timeout, cancellation, or once the queue is closed
    /// and holds nothing.
    pub(crate) async fn poll(&self, wait: Duration, cancel: &CancellationToken) -> Option<T> {
        if cancel.is_cancelled() {
            return None;
        }
        if self.synchronous {
            self.receive(wait, cancel).await
        } else {
            self.dequeue(wait, cancel).await
        }
    }

    async fn dequeue(&self, wait: Duration, cancel: &CancellationToken) -> Option<T> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.item_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(item) = state.items.pop_front() {
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep_until(deadline) => return None,
            }
        }
    }

    async fn receive(&self, wait: Duration, cancel: &CancellationToken) -> Option<T> {
        let (slot, mut handed) = oneshot::channel();
        {
            let mut state = self.state.lock();
            if state.closed {
                return None;
            }
            state.consumers.retain(|consumer| !consumer.is_closed());
            state.consumers.push_back(slot);
        }
        self.consumer_ready.notify_waiters();

        tokio::select! {
            received = &mut handed => return received.ok(),
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(wait) => {}
        }

        // A producer may have won the race against the timeout
        handed.close();
        handed.try_recv().ok()
    }

    /// Stop accepting items; buffered items stay available to consumers
    pub(crate) fn close(&self) {
        {
            let mut state = self.state.lock();
            state.closed = true;
            state.consumers.clear();
        }
        self.item_ready.notify_waiters();
        self.consumer_ready.notify_waiters();
    }

    /// Close the queue and take every buffered item
    pub(crate) fn drain(&self) -> Vec<T> {
        let items = {
            let mut state = self.state.lock();
            state.closed = true;
            state.consumers.clear();
            state.items.drain(..).collect()
        };
        self.item_ready.notify_waiters();
        self.consumer_ready.notify_waiters();
        items
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().items.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    const WAIT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn test_buffered_fifo() {
        let queue = WorkQueue::new(false);
        let cancel = CancellationToken::new();
        for i in 0..5 {
            assert!(matches!(queue.offer(i, WAIT, &cancel).await, Offer::Accepted));
        }
        assert_eq!(queue.len(), 5);

        let mut polled = Vec::new();
        while let Some(item) = queue.poll(WAIT, &cancel).await {
            polled.push(item);
            if queue.is_empty() {
                break;
            }
        }
        assert_eq!(polled, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_buffered_poll_times_out() {
        let queue: WorkQueue<u32> = WorkQueue::new(false);
        let started = Instant::now();
        assert!(queue.poll(WAIT, &CancellationToken::new()).await.is_none());
        assert!(started.elapsed() >= WAIT);
    }

    #[tokio::test]
    async fn test_buffered_close_keeps_items() {
        let queue = WorkQueue::new(false);
        let cancel = CancellationToken::new();
        queue.offer(1, WAIT, &cancel).await;
        queue.close();

        assert!(matches!(queue.offer(2, WAIT, &cancel).await, Offer::Closed(2)));
        assert_eq!(queue.poll(WAIT, &cancel).await, Some(1));
        assert_eq!(queue.poll(WAIT, &cancel).await, None);
    }

    #[tokio::test]
    async fn test_drain_returns_buffered_items() {
        let queue = WorkQueue::new(false);
        let cancel = CancellationToken::new();
        for i in 0..3 {
            queue.offer(i, WAIT, &cancel).await;
        }
        assert_eq!(queue.drain(), vec![0, 1, 2]);
        assert!(queue.drain().is_empty());
        assert!(matches!(queue.offer(9, WAIT, &cancel).await, Offer::Closed(9)));
    }

    #[tokio::test]
    async fn test_synchronous_offer_without_consumer_is_pending() {
        let queue = WorkQueue::new(true);
        match queue.offer(7, WAIT, &CancellationToken::new()).await {
            Offer::Pending(item) => assert_eq!(item, 7),
            other => panic!("unexpected offer outcome: {other:?}"),
        }
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_synchronous_handoff() {
        let queue = Arc::new(WorkQueue::new(true));
        let cancel = CancellationToken::new();

        let consumer = {
            let queue = Arc::clone(&queue);
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.poll(Duration::from_secs(5), &cancel).await })
        };

        let outcome = queue.offer(42, Duration::from_secs(5), &cancel).await;
        assert!(matches!(outcome, Offer::Accepted));
        assert_eq!(consumer.await.unwrap(), Some(42));
    }

    #[tokio::test]
    async fn test_cancel_wakes_waiters() {
        let queue = Arc::new(WorkQueue::<u32>::new(true));
        let cancel = CancellationToken::new();

        let consumer = {
            let queue = Arc::clone(&queue);
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.poll(Duration::from_secs(30), &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let polled = tokio::time::timeout(Duration::from_secs(5), consumer)
            .await
            .expect("consumer should wake on cancel")
            .unwrap();
        assert_eq!(polled, None);

        let offered = tokio::time::timeout(
            Duration::from_secs(5),
            queue.offer(1, Duration::from_secs(30), &cancel),
        )
        .await
        .expect("producer should not wait once cancelled");
        assert!(matches!(offered, Offer::Pending(1)));
    }

    #[tokio::test]
    async fn test_close_releases_synchronous_consumer() {
        let queue = Arc::new(WorkQueue::<u32>::new(true));
        let cancel = CancellationToken::new();

        let consumer = {
            let queue = Arc::clone(&queue);
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.poll(Duration::from_secs(30), &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();

        let polled = tokio::time::timeout(Duration::from_secs(5), consumer)
            .await
            .expect("consumer should wake on close")
            .unwrap();
        assert_eq!(polled, None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_synchronous_handoff_loses_nothing_under_timeouts() {
        const ITEMS: u64 = 2_000;

        let queue = Arc::new(WorkQueue::new(true));
        let cancel = CancellationToken::new();
        let received = Arc::new(AtomicU64::new(0));
        let sum = Arc::new(AtomicU64::new(0));

        let mut consumers = Vec::new();
        for _ in 0..4 {
            let queue = Arc::clone(&queue);
            let cancel = cancel.clone();
            let received = Arc::clone(&received);
            let sum = Arc::clone(&sum);
            consumers.push(tokio::spawn(async move {
                while received.load(Ordering::SeqCst) < ITEMS {
                    // Very short waits so that timeouts race with handoffs
                    if let Some(item) = queue.poll(Duration::from_micros(50), &cancel).await {
                        received.fetch_add(1, Ordering::SeqCst);
                        sum.fetch_add(item, Ordering::SeqCst);
                    }
                }
            }));
        }

        for i in 0..ITEMS {
            let mut item = i;
            loop {
                match queue.offer(item, Duration::from_millis(5), &cancel).await {
                    Offer::Accepted => break,
                    Offer::Pending(returned) => item = returned,
                    Offer::Closed(_) => panic!("queue closed unexpectedly"),
                }
            }
        }

        for consumer in consumers {
            tokio::time::timeout(Duration::from_secs(10), consumer)
                .await
                .expect("consumers should finish")
                .unwrap();
        }
        assert_eq!(received.load(Ordering::SeqCst), ITEMS);
        assert_eq!(sum.load(Ordering::SeqCst), ITEMS * (ITEMS - 1) / 2);
    }
}
