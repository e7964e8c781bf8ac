//! Transaction lifecycle scenarios driven through the public surface.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt as _;

use dialtone::transaction::{
    Executor, RequestBody, ResponseHead, Scheduler, Transaction,
};
use dialtone::{Error, PoolKey, Scheme, Target};

fn key() -> PoolKey {
    PoolKey {
        scheme: Scheme::Http,
        target: Target::new("example.com", 80),
        sni_override: None,
        tls_fingerprint: None,
    }
}

fn head() -> ResponseHead {
    ResponseHead {
        status: http::StatusCode::OK,
        version: http::Version::HTTP_11,
        headers: http::HeaderMap::new(),
    }
}

#[derive(Default)]
struct NoopScheduler;

impl Scheduler for NoopScheduler {
    fn cancel_request(&self) {}
}

/// An executor that pauses the request body stream after the first part, the
/// way a real connection does when its write buffer fills.
#[derive(Default)]
struct PausingExecutor {
    transaction: OnceLock<Transaction>,
    parts: Mutex<Vec<Bytes>>,
    cancelled: AtomicUsize,
}

impl Executor for PausingExecutor {
    fn write_request_body_part(&self, part: Bytes) {
        let mut parts = self.parts.lock().unwrap();
        parts.push(part);
        if parts.len() == 1 {
            drop(parts);
            self.transaction
                .get()
                .expect("transaction registered")
                .pause_request_body_stream();
        }
    }

    fn finish_request_body_stream(&self) {}

    fn cancel_request(&self) {
        self.cancelled.fetch_add(1, Ordering::SeqCst);
    }

    fn demand_response_body_stream(&self) {}
}

#[tokio::test]
async fn cancel_mid_body_fails_the_promise_and_the_parked_write() {
    let _ = tracing_subscriber::fmt::try_init();

    let (parts_tx, parts_rx) =
        tokio::sync::mpsc::channel::<Result<Bytes, dialtone::BoxError>>(4);
    let body = RequestBody::Streaming(Box::pin(
        tokio_stream_adapter::ReceiverStream::new(parts_rx),
    ));

    let (transaction, response) = Transaction::new(key(), body);
    let executor = Arc::new(PausingExecutor::default());
    executor.transaction.set(transaction.clone()).ok().unwrap();

    transaction.request_queued(Arc::new(NoopScheduler));
    transaction.will_execute_request(executor.clone());
    transaction.resume_request_body_stream();

    // First part flows, and pauses the stream; the second parks the pump.
    parts_tx.send(Ok(Bytes::from_static(b"one"))).await.unwrap();
    parts_tx.send(Ok(Bytes::from_static(b"two"))).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(executor.parts.lock().unwrap().len(), 2);

    transaction.cancel();

    // The response promise resolves with the cancellation, the executor is
    // told to abort, and the pump never writes the third part.
    assert!(matches!(response.await, Err(Error::Cancelled)));
    assert_eq!(executor.cancelled.load(Ordering::SeqCst), 1);

    parts_tx
        .send(Ok(Bytes::from_static(b"three")))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(executor.parts.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn cancel_after_head_finishes_the_body_stream_with_the_error() {
    let _ = tracing_subscriber::fmt::try_init();

    #[derive(Default)]
    struct QuietExecutor;

    impl Executor for QuietExecutor {
        fn write_request_body_part(&self, _part: Bytes) {}
        fn finish_request_body_stream(&self) {}
        fn cancel_request(&self) {}
        fn demand_response_body_stream(&self) {}
    }

    let (transaction, response) = Transaction::new(key(), RequestBody::Empty);
    transaction.request_queued(Arc::new(NoopScheduler));
    transaction.will_execute_request(Arc::new(QuietExecutor));
    transaction.receive_response_head(head());
    transaction.receive_response_body_part(Bytes::from_static(b"partial"));

    let mut response = response.await.unwrap();
    let first = response.body.next().await.unwrap().unwrap();
    assert_eq!(first, "partial");

    transaction.cancel();
    assert!(matches!(
        response.body.next().await,
        Some(Err(Error::Cancelled))
    ));
    assert!(response.body.next().await.is_none());
}

/// Minimal local adapter from an mpsc receiver to a `Stream`.
mod tokio_stream_adapter {
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use futures_core::Stream;
    use tokio::sync::mpsc::Receiver;

    pub struct ReceiverStream<T> {
        receiver: Receiver<T>,
    }

    impl<T> ReceiverStream<T> {
        pub fn new(receiver: Receiver<T>) -> Self {
            Self { receiver }
        }
    }

    impl<T> Stream for ReceiverStream<T> {
        type Item = T;

        fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
            self.receiver.poll_recv(cx)
        }
    }
}
