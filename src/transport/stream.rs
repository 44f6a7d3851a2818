//! Generic streaming request/response multiplexer.
//!
//! Models a reader/writer split: the client holds a [`Writer`] to push
//! outbound requests onto a single logical stream: a driver off on the
//! other end — the piece this crate does not provide (the concrete gRPC
//! transport is out of scope) — consumes the paired [`Outbound`] receiver,
//! ships each request to the server, and feeds responses back through
//! [`Stream::dispatch`] as they arrive out of order. On stream failure the
//! driver calls [`Stream::fail_all`] once, and every caller still waiting
//! on a response for that stream receives the same failure status.
//!
//! This is a building block: [`crate::transport::Transport`] is the surface
//! the [`crate::Client`] façade actually calls, and a concrete transport
//! would typically be `Stream` plus a task driving the network I/O.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::error::Error;

/// The outbound half of a [`Stream`]: requests a driver task should forward
/// to the network, tagged with the id their response must carry.
pub type Outbound<Req> = mpsc::UnboundedReceiver<(u64, Req)>;

/// A multiplexed request/response stream. `Req` and `Resp` correspond to one
/// RPC's request/response pair (e.g. `CheckRequest`/`CheckResponse`).
pub struct Stream<Req, Resp> {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<Resp, Error>>>>,
    outbound: mpsc::UnboundedSender<(u64, Req)>,
}

impl<Req, Resp> Stream<Req, Resp> {
    /// Create a new stream, returning it alongside the outbound channel a
    /// driver task should drain.
    pub fn new() -> (Arc<Self>, Outbound<Req>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let stream = Arc::new(Self {
            next_id: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            outbound,
        });
        (stream, rx)
    }

    /// Obtain a [`Writer`] handle for sending requests on this stream.
    pub fn writer(self: &Arc<Self>) -> Writer<Req, Resp> {
        Writer {
            stream: self.clone(),
        }
    }

    /// Deliver a response to whichever caller is waiting on `id`. Silently
    /// dropped if that caller already gave up (e.g. cancellation).
    pub fn dispatch(&self, id: u64, response: Result<Resp, Error>) {
        if let Some(tx) = self.pending.lock().remove(&id) {
            let _ = tx.send(response);
        }
    }

    /// Fail every currently-pending request with `status`, as required when
    /// the underlying stream breaks.
    pub fn fail_all(&self, status: Error) {
        let pending: Vec<_> = self.pending.lock().drain().collect();
        for (_, tx) in pending {
            let _ = tx.send(Err(status.clone()));
        }
    }

    fn register(&self) -> (u64, oneshot::Receiver<Result<Resp, Error>>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        (id, rx)
    }
}

/// The writer half of a [`Stream`]: pushes requests and awaits their
/// correlated response.
pub struct Writer<Req, Resp> {
    stream: Arc<Stream<Req, Resp>>,
}

impl<Req, Resp> Clone for Writer<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            stream: self.stream.clone(),
        }
    }
}

impl<Req, Resp> Writer<Req, Resp> {
    /// Send `request` and await its response. Fails with
    /// [`crate::error::ErrorKind::Unavailable`] if the stream is torn down
    /// (via [`Stream::fail_all`]) before a response arrives, or if the
    /// driver task has gone away entirely.
    pub async fn send(&self, request: Req) -> Result<Resp, Error> {
        let (id, rx) = self.stream.register();
        if self.stream.outbound.send((id, request)).is_err() {
            self.stream.pending.lock().remove(&id);
            return Err(Error::unavailable("transport stream driver is gone"));
        }
        rx.await
            .unwrap_or_else(|_| Err(Error::unavailable("transport stream closed")))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn dispatch_resolves_the_matching_waiter() {
        let (stream, mut outbound) = Stream::<&'static str, i32>::new();
        let writer = stream.writer();

        let driver = tokio::spawn(async move {
            let (id, req) = outbound.recv().await.unwrap();
            assert_eq!(req, "ping");
            id
        });

        let send = writer.send("ping");
        let id = driver.await.unwrap();
        stream.dispatch(id, Ok(42));
        assert_eq!(send.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn fail_all_fails_every_pending_waiter() {
        let (stream, mut outbound) = Stream::<&'static str, i32>::new();
        let writer1 = stream.writer();
        let writer2 = stream.writer();

        tokio::spawn(async move {
            outbound.recv().await.unwrap();
            outbound.recv().await.unwrap();
        });

        let f1 = tokio::spawn({
            let writer1 = writer1.clone();
            async move { writer1.send("a").await }
        });
        let f2 = tokio::spawn(async move { writer2.send("b").await });

        // give both sends a chance to register before the stream dies
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        stream.fail_all(Error::unavailable("stream reset"));

        assert!(f1.await.unwrap().is_err());
        assert!(f2.await.unwrap().is_err());
    }
}
