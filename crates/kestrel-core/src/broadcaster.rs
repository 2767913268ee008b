//! Console output fan-out.
//!
//! A [`Broadcaster`] keeps a bounded history of everything written to it and
//! forwards each write to every live [`Subscription`]. Delivery never blocks
//! the writer: a subscriber whose queue is full misses that write.

use bytes::Bytes;
use futures::Stream;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;

/// Default number of bytes of console history retained.
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Default number of pending messages per subscriber.
pub const DEFAULT_QUEUE_LEN: usize = 256;

struct Inner {
    history: VecDeque<u8>,
    capacity: usize,
    queue_len: usize,
    subscribers: HashMap<u64, mpsc::Sender<Bytes>>,
    next_id: u64,
    closed: bool,
}

impl Inner {
    fn retain(&mut self, data: &[u8]) {
        if self.capacity == 0 {
            return;
        }
        if data.len() >= self.capacity {
            self.history.clear();
            self.history
                .extend(&data[data.len() - self.capacity..]);
            return;
        }
        let overflow = (self.history.len() + data.len()).saturating_sub(self.capacity);
        self.history.drain(..overflow);
        self.history.extend(data);
    }

    fn snapshot(&self) -> Bytes {
        let (a, b) = self.history.as_slices();
        let mut out = Vec::with_capacity(a.len() + b.len());
        out.extend_from_slice(a);
        out.extend_from_slice(b);
        Bytes::from(out)
    }
}

/// Single-producer, multi-consumer console broadcaster.
///
/// Cloning is cheap; all clones share the same history and subscribers.
#[derive(Clone)]
pub struct Broadcaster {
    inner: Arc<Mutex<Inner>>,
}

impl std::fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("Broadcaster")
            .field("retained", &inner.history.len())
            .field("subscribers", &inner.subscribers.len())
            .field("closed", &inner.closed)
            .finish()
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE, DEFAULT_QUEUE_LEN)
    }
}

impl Broadcaster {
    /// Create a broadcaster retaining `capacity` bytes of history and
    /// queueing up to `queue_len` writes per subscriber.
    pub fn new(capacity: usize, queue_len: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                history: VecDeque::with_capacity(capacity),
                capacity,
                queue_len: queue_len.max(1),
                subscribers: HashMap::new(),
                next_id: 0,
                closed: false,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append `data` to the history and offer it to every subscriber.
    ///
    /// # Errors
    /// Returns [`io::ErrorKind::UnexpectedEof`] once the broadcaster is closed.
    pub fn publish(&self, data: &[u8]) -> io::Result<usize> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "broadcaster closed",
            ));
        }
        if data.is_empty() {
            return Ok(0);
        }
        inner.retain(data);

        let chunk = Bytes::copy_from_slice(data);
        inner.subscribers.retain(|id, tx| match tx.try_send(chunk.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::trace!(subscriber = id, bytes = chunk.len(), "Subscriber queue full, dropping write");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        Ok(data.len())
    }

    /// Subscribe to future writes.
    ///
    /// The retained history, if any, is the first message delivered. A
    /// subscription taken after [`close`](Self::close) ends right after it.
    pub fn subscribe(&self) -> Subscription {
        let mut inner = self.lock();
        let (tx, rx) = mpsc::channel(inner.queue_len);

        if !inner.history.is_empty() {
            // Fresh channel, cannot be full
            let _ = tx.try_send(inner.snapshot());
        }

        let id = inner.next_id;
        inner.next_id += 1;
        if !inner.closed {
            inner.subscribers.insert(id, tx);
        }

        Subscription {
            id,
            rx,
            owner: Arc::downgrade(&self.inner),
        }
    }

    /// Retained history without subscribing.
    pub fn snapshot(&self) -> Bytes {
        self.lock().snapshot()
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Close the broadcaster and end every subscription.
    ///
    /// Subscribers still receive whatever was already queued for them.
    pub fn close(&self) {
        let mut inner = self.lock();
        if inner.closed {
            return;
        }
        inner.closed = true;
        let count = inner.subscribers.len();
        inner.subscribers.clear();
        tracing::debug!(subscribers = count, "Broadcaster closed");
    }

    /// Copy everything from `reader` into the broadcaster until EOF or close.
    ///
    /// Returns the number of bytes published.
    pub async fn copy_from<R>(&self, mut reader: R) -> io::Result<u64>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = vec![0u8; 4096];
        let mut total = 0u64;
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                return Ok(total);
            }
            match self.publish(&buf[..n]) {
                Ok(_) => total += n as u64,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(total),
                Err(e) => return Err(e),
            }
        }
    }
}

impl io::Write for Broadcaster {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.publish(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// One consumer's view of a [`Broadcaster`].
///
/// Dropping the subscription unregisters it.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Bytes>,
    owner: Weak<Mutex<Inner>>,
}

impl Subscription {
    /// Receive the next chunk, or `None` once the subscription has ended.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Unregister from the broadcaster and discard anything still queued.
    pub fn close(&mut self) {
        self.unregister();
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
    }

    fn unregister(&self) {
        if let Some(owner) = self.owner.upgrade() {
            owner
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .subscribers
                .remove(&self.id);
        }
    }
}

impl Stream for Subscription {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unregister();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::io::Write;

    #[tokio::test]
    async fn test_snapshot_is_first_message() {
        let b = Broadcaster::new(1024, 16);
        b.publish(b"boot ").unwrap();
        b.publish(b"ok\n").unwrap();

        let mut sub = b.subscribe();
        b.publish(b"login: ").unwrap();

        assert_eq!(sub.recv().await.unwrap(), Bytes::from_static(b"boot ok\n"));
        assert_eq!(sub.recv().await.unwrap(), Bytes::from_static(b"login: "));
    }

    #[tokio::test]
    async fn test_no_snapshot_when_empty() {
        let b = Broadcaster::new(1024, 16);
        let mut sub = b.subscribe();
        b.publish(b"first").unwrap();
        assert_eq!(sub.recv().await.unwrap(), Bytes::from_static(b"first"));
    }

    #[test]
    fn test_history_is_bounded() {
        let b = Broadcaster::new(8, 4);
        b.publish(b"abcdef").unwrap();
        b.publish(b"ghij").unwrap();
        assert_eq!(b.snapshot(), Bytes::from_static(b"cdefghij"));

        b.publish(b"0123456789").unwrap();
        assert_eq!(b.snapshot(), Bytes::from_static(b"23456789"));
    }

    #[tokio::test]
    async fn test_full_queue_drops_writes_without_blocking() {
        let b = Broadcaster::new(1024, 2);
        let mut sub = b.subscribe();
        for chunk in [&b"a"[..], b"b", b"c", b"d"] {
            b.publish(chunk).unwrap();
        }
        b.close();

        let received: Vec<Bytes> = (&mut sub).collect().await;
        assert_eq!(received, vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]);
    }

    #[tokio::test]
    async fn test_every_write_delivered_with_capacity() {
        let b = Broadcaster::new(16, 64);
        let sub = b.subscribe();
        for i in 0..50u8 {
            b.publish(&[i]).unwrap();
        }
        b.close();

        let received: Vec<u8> = sub.map(|chunk| chunk[0]).collect().await;
        assert_eq!(received, (0..50u8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_close_ends_all_subscriptions() {
        let b = Broadcaster::new(64, 4);
        let mut first = b.subscribe();
        let mut second = b.subscribe();
        assert_eq!(b.subscriber_count(), 2);

        b.close();
        assert!(first.recv().await.is_none());
        assert!(second.recv().await.is_none());
        assert_eq!(b.subscriber_count(), 0);
    }

    #[test]
    fn test_write_after_close_is_eof() {
        let mut b = Broadcaster::default();
        b.close();
        let err = b.write(b"late").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_subscription_close_unregisters() {
        let b = Broadcaster::new(64, 4);
        let mut sub = b.subscribe();
        b.publish(b"queued").unwrap();

        sub.close();
        assert_eq!(b.subscriber_count(), 0);
        assert!(sub.recv().await.is_none());

        // Writes continue to succeed with nobody listening
        b.publish(b"more").unwrap();
    }

    #[test]
    fn test_drop_unregisters() {
        let b = Broadcaster::new(64, 4);
        {
            let _sub = b.subscribe();
            assert_eq!(b.subscriber_count(), 1);
        }
        assert_eq!(b.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_after_close_gets_history_then_ends() {
        let b = Broadcaster::new(64, 4);
        b.publish(b"last words").unwrap();
        b.close();

        let mut sub = b.subscribe();
        assert_eq!(sub.recv().await.unwrap(), Bytes::from_static(b"last words"));
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_copy_from_reader() {
        let b = Broadcaster::new(64, 4);
        let reader: &[u8] = b"serial output";
        let copied = b.copy_from(reader).await.unwrap();
        assert_eq!(copied, 13);
        assert_eq!(b.snapshot(), Bytes::from_static(b"serial output"));
    }

    #[tokio::test]
    async fn test_copy_from_forwards_each_read() {
        let b = Broadcaster::new(64, 4);
        let mut sub = b.subscribe();
        let reader = tokio_test::io::Builder::new()
            .read(b"login: ")
            .read(b"root\n")
            .build();

        assert_eq!(b.copy_from(reader).await.unwrap(), 12);
        assert_eq!(sub.recv().await.unwrap(), Bytes::from_static(b"login: "));
        assert_eq!(sub.recv().await.unwrap(), Bytes::from_static(b"root\n"));
    }
}
