//! A single HTTP request/response exchange over an established channel.
//!
//! The [`Transaction`] sits between the HTTP layer's scheduler/executor and
//! the caller who awaits the response: it meters the request body out under
//! the executor's backpressure, delivers the response head exactly once
//! through a promise, streams the response body through a bounded source,
//! and funnels cancellation, deadline, and transport failure into a single
//! idempotent fail path.
//!
//! All state lives behind one mutex taken only for transitions, never across
//! I/O; the pool key is immutable and readable without it.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::StreamExt as _;
use tokio::sync::oneshot;
use tracing::trace;

use crate::target::PoolKey;
use crate::Error;

mod body;
mod state;

pub use body::{BodyDataStream, ResponseBodyStream};

use body::{BodyShared, Producing};
use state::{
    BodyPartAction, BodySource, ExecuteAction, FailAction, HeadAction, QueueAction, ResumeAction,
    StateMachine, SucceedAction, WriteAction,
};

/// The executor half of the HTTP layer: receives request body parts and
/// demand signals for the response body.
pub trait Executor: Send + Sync + 'static {
    /// Write one request body part.
    fn write_request_body_part(&self, part: Bytes);
    /// The request body is complete.
    fn finish_request_body_stream(&self);
    /// Abort the request. Called at most once per transaction.
    fn cancel_request(&self);
    /// The response body consumer has room; produce more parts.
    fn demand_response_body_stream(&self);
}

/// The scheduler half of the HTTP layer, owning the transaction before an
/// executor picks it up.
pub trait Scheduler: Send + Sync + 'static {
    /// Forget the queued request.
    fn cancel_request(&self);
}

/// The request body handed to a new transaction.
pub enum RequestBody {
    /// No body.
    Empty,
    /// A single buffered body, written with one part.
    Buffered(Bytes),
    /// A streaming body, pumped under executor backpressure.
    Streaming(BodyDataStream),
}

impl std::fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestBody::Empty => f.write_str("Empty"),
            RequestBody::Buffered(part) => f.debug_tuple("Buffered").field(&part.len()).finish(),
            RequestBody::Streaming(_) => f.write_str("Streaming"),
        }
    }
}

/// The response head, delivered through the response promise.
#[derive(Debug)]
pub struct ResponseHead {
    /// The response status.
    pub status: http::StatusCode,
    /// The negotiated HTTP version.
    pub version: http::Version,
    /// The response headers.
    pub headers: http::HeaderMap,
}

/// A response: the head plus the streaming body.
#[derive(Debug)]
pub struct Response {
    /// The response head.
    pub head: ResponseHead,
    /// The response body.
    pub body: ResponseBodyStream,
}

/// Resolves once, with the response head or the transaction's failure.
pub struct ResponseFuture {
    receiver: oneshot::Receiver<Result<Response, Error>>,
}

impl Future for ResponseFuture {
    type Output = Result<Response, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::Cancelled)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl std::fmt::Debug for ResponseFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseFuture").finish_non_exhaustive()
    }
}

/// Drives one request/response exchange.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<Inner>,
}

pub(crate) struct Inner {
    key: PoolKey,
    machine: Mutex<StateMachine>,
    body: Arc<BodyShared>,
}

impl Transaction {
    /// Create a transaction for one request.
    ///
    /// The returned future resolves with the response head (and body stream)
    /// or with the transaction's failure, exactly once.
    pub fn new(key: PoolKey, request_body: RequestBody) -> (Self, ResponseFuture) {
        let (promise, receiver) = oneshot::channel();
        let source = match request_body {
            RequestBody::Empty => BodySource::None,
            RequestBody::Buffered(part) => BodySource::Buffered(part),
            RequestBody::Streaming(stream) => BodySource::Streaming(stream),
        };
        let inner = Arc::new(Inner {
            key,
            machine: Mutex::new(StateMachine::new(source, promise)),
            body: Arc::new(BodyShared::new()),
        });
        (Self { inner }, ResponseFuture { receiver })
    }

    /// The identity of the connection this transaction may run on.
    pub fn pool_key(&self) -> &PoolKey {
        &self.inner.key
    }

    /// The scheduler took ownership of the queued request.
    pub fn request_queued(&self, scheduler: Arc<dyn Scheduler>) {
        let action = self.inner.lock().request_queued(scheduler);
        match action {
            QueueAction::None => {}
            QueueAction::Cancel(scheduler) => scheduler.cancel_request(),
        }
    }

    /// An executor is about to run the request.
    ///
    /// If the transaction was cancelled while queued, the executor is told to
    /// abort instead.
    pub fn will_execute_request(&self, executor: Arc<dyn Executor>) {
        let action = self.inner.lock().will_execute_request(executor);
        match action {
            ExecuteAction::None => {}
            ExecuteAction::Cancel(executor) => executor.cancel_request(),
        }
    }

    /// Producer-side credit: start or resume request body production.
    pub fn resume_request_body_stream(&self) {
        let action = self.inner.lock().resume_request_body_stream();
        match action {
            ResumeAction::None => {}
            ResumeAction::StartStream(stream) => {
                trace!("starting request body stream");
                tokio::spawn(run_request_body_pump(self.inner.clone(), stream));
            }
            ResumeAction::WriteBufferedAndFinish { executor, part } => {
                executor.write_request_body_part(part);
                executor.finish_request_body_stream();
            }
            ResumeAction::ResumeWaiter(waiter) => {
                let _ = waiter.send(Ok(()));
            }
        }
    }

    /// The executor's write buffer is full; park the next write.
    pub fn pause_request_body_stream(&self) {
        self.inner.lock().pause_request_body_stream();
    }

    /// The response head arrived; resolves the response promise.
    pub fn receive_response_head(&self, head: ResponseHead) {
        let action = self.inner.lock().receive_response_head();
        match action {
            HeadAction::Resolve(promise) => {
                let response = Response {
                    head,
                    body: ResponseBodyStream::new(
                        self.inner.body.clone(),
                        Arc::downgrade(&self.inner),
                    ),
                };
                let _ = promise.send(Ok(response));
            }
            HeadAction::None => {}
        }
    }

    /// A response body part arrived; forward it to the bounded source.
    pub fn receive_response_body_part(&self, part: Bytes) {
        let action = self.inner.lock().receive_response_body_part();
        match action {
            BodyPartAction::Forward(executor) => {
                if self.inner.body.push(part) == Producing::More {
                    executor.demand_response_body_stream();
                }
            }
            BodyPartAction::Drop => {}
        }
    }

    /// The exchange completed; finish the response body stream, optionally
    /// yielding a trailing buffer first. Terminal.
    pub fn succeed_request(&self, trailing: Option<Bytes>) {
        let action = self.inner.lock().succeed_request();
        match action {
            SucceedAction::Finish { waiter } => {
                if let Some(part) = trailing {
                    self.inner.body.push(part);
                }
                self.inner.body.finish(Ok(()));
                if let Some(waiter) = waiter {
                    let _ = waiter.send(Ok(()));
                }
            }
            SucceedAction::None => {}
        }
    }

    /// Terminal failure from any source: transport error, protocol error,
    /// user cancellation, deadline. Idempotent.
    pub fn fail(&self, error: Error) {
        self.inner.fail(error)
    }

    /// The user cancelled the request.
    pub fn cancel(&self) {
        self.fail(Error::Cancelled)
    }

    /// The transaction deadline fired.
    pub fn deadline_exceeded(&self) {
        self.fail(Error::DeadlineExceeded)
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("key", &self.inner.key)
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn lock(&self) -> std::sync::MutexGuard<'_, StateMachine> {
        self.machine.lock().expect("transaction state poisoned")
    }

    fn fail(&self, error: Error) {
        let action = self.lock().fail();
        match action {
            FailAction::None => {}
            FailAction::Fail {
                promise,
                finish_body,
                waiter,
                executor,
                scheduler,
            } => {
                trace!(%error, "transaction failed");
                if let Some(waiter) = waiter {
                    let _ = waiter.send(Err(error.clone()));
                }
                if let Some(promise) = promise {
                    let _ = promise.send(Err(error));
                } else if finish_body {
                    self.body.finish(Err(error));
                }
                if let Some(scheduler) = scheduler {
                    scheduler.cancel_request();
                }
                if let Some(executor) = executor {
                    executor.cancel_request();
                }
            }
        }
    }

    /// Demand resumed by the response body consumer.
    pub(crate) fn produce_more(&self) {
        let executor = self.lock().executor();
        if let Some(executor) = executor {
            executor.demand_response_body_stream();
        }
    }
}

/// The request body pump: one producer task metering the caller's stream
/// into the executor.
///
/// Failures are reported through the transaction's primary error path; the
/// pump itself always exits silently.
async fn run_request_body_pump(inner: Arc<Inner>, mut stream: BodyDataStream) {
    loop {
        match stream.next().await {
            Some(Ok(part)) => {
                let action = inner.lock().write_next_request_part(part);
                match action {
                    WriteAction::Write { executor, part } => {
                        executor.write_request_body_part(part);
                    }
                    WriteAction::WriteAndWait {
                        executor,
                        part,
                        waiter,
                    } => {
                        executor.write_request_body_part(part);
                        match waiter.await {
                            Ok(Ok(())) => {}
                            Ok(Err(_)) | Err(_) => return,
                        }
                    }
                    WriteAction::Fail => return,
                }
            }
            Some(Err(error)) => {
                inner.fail(Error::Io(std::io::Error::other(error)));
                return;
            }
            None => break,
        }
    }

    let executor = inner.lock().request_stream_finished();
    if let Some(executor) = executor {
        executor.finish_request_body_stream();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures_util::stream;
    use futures_util::StreamExt as _;

    use crate::{Scheme, Target};

    #[derive(Debug, Default)]
    struct RecordingExecutor {
        parts: Mutex<Vec<Bytes>>,
        finished: AtomicUsize,
        cancelled: AtomicUsize,
        demanded: AtomicUsize,
    }

    impl Executor for RecordingExecutor {
        fn write_request_body_part(&self, part: Bytes) {
            self.parts.lock().unwrap().push(part);
        }

        fn finish_request_body_stream(&self) {
            self.finished.fetch_add(1, Ordering::SeqCst);
        }

        fn cancel_request(&self) {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
        }

        fn demand_response_body_stream(&self) {
            self.demanded.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Debug, Default)]
    struct RecordingScheduler {
        cancelled: AtomicUsize,
    }

    impl Scheduler for RecordingScheduler {
        fn cancel_request(&self) {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
        }
    }

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

    #[tokio::test]
    async fn buffered_body_round_trip() {
        let (transaction, response) =
            Transaction::new(key(), RequestBody::Buffered(Bytes::from_static(b"ping")));
        let executor = Arc::new(RecordingExecutor::default());

        transaction.request_queued(Arc::new(RecordingScheduler::default()));
        transaction.will_execute_request(executor.clone());
        transaction.resume_request_body_stream();

        assert_eq!(executor.parts.lock().unwrap().as_slice(), &["ping"]);
        assert_eq!(executor.finished.load(Ordering::SeqCst), 1);

        transaction.receive_response_head(head());
        transaction.receive_response_body_part(Bytes::from_static(b"pong"));
        transaction.succeed_request(None);

        let mut response = response.await.unwrap();
        assert_eq!(response.head.status, http::StatusCode::OK);
        let part = response.body.next().await.unwrap().unwrap();
        assert_eq!(part, "pong");
        assert!(response.body.next().await.is_none());
    }

    #[tokio::test]
    async fn empty_body_resume_is_a_no_op() {
        let (transaction, _response) = Transaction::new(key(), RequestBody::Empty);
        let executor = Arc::new(RecordingExecutor::default());

        transaction.request_queued(Arc::new(RecordingScheduler::default()));
        transaction.will_execute_request(executor.clone());
        transaction.resume_request_body_stream();
        // Repeated credit changes nothing.
        transaction.resume_request_body_stream();

        assert!(executor.parts.lock().unwrap().is_empty());
        assert_eq!(executor.finished.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn streaming_body_pumps_all_parts() {
        let parts: Vec<Result<Bytes, crate::BoxError>> = vec![
            Ok(Bytes::from_static(b"one")),
            Ok(Bytes::from_static(b"two")),
        ];
        let (transaction, _response) = Transaction::new(
            key(),
            RequestBody::Streaming(Box::pin(stream::iter(parts))),
        );
        let executor = Arc::new(RecordingExecutor::default());

        transaction.request_queued(Arc::new(RecordingScheduler::default()));
        transaction.will_execute_request(executor.clone());
        transaction.resume_request_body_stream();

        // The pump runs on its own task; give it time to drain the stream.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(
            executor.parts.lock().unwrap().as_slice(),
            &["one", "two"]
        );
        assert_eq!(executor.finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_before_execution_aborts_the_executor() {
        let (transaction, response) = Transaction::new(key(), RequestBody::Empty);
        let scheduler = Arc::new(RecordingScheduler::default());
        let executor = Arc::new(RecordingExecutor::default());

        transaction.request_queued(scheduler.clone());
        transaction.cancel();

        assert_eq!(scheduler.cancelled.load(Ordering::SeqCst), 1);
        assert!(matches!(response.await, Err(Error::Cancelled)));

        // The executor arriving late is told to abort.
        transaction.will_execute_request(executor.clone());
        assert_eq!(executor.cancelled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fail_is_idempotent_and_cancels_executor_once() {
        let (transaction, response) = Transaction::new(key(), RequestBody::Empty);
        let executor = Arc::new(RecordingExecutor::default());

        transaction.request_queued(Arc::new(RecordingScheduler::default()));
        transaction.will_execute_request(executor.clone());

        transaction.fail(Error::RemoteConnectionClosed);
        transaction.fail(Error::Cancelled);
        transaction.deadline_exceeded();

        assert_eq!(executor.cancelled.load(Ordering::SeqCst), 1);
        assert!(matches!(response.await, Err(Error::RemoteConnectionClosed)));
    }

    /// A transaction whose body stream never produces, so the request
    /// substate can be driven by hand, as the pump would.
    fn parked_transaction() -> (Transaction, ResponseFuture, Arc<RecordingExecutor>) {
        let (transaction, response) = Transaction::new(
            key(),
            RequestBody::Streaming(Box::pin(stream::pending())),
        );
        let executor = Arc::new(RecordingExecutor::default());

        transaction.request_queued(Arc::new(RecordingScheduler::default()));
        transaction.will_execute_request(executor.clone());

        let action = transaction.inner.lock().resume_request_body_stream();
        assert!(matches!(action, ResumeAction::StartStream(_)));

        (transaction, response, executor)
    }

    #[tokio::test]
    async fn pause_parks_writes_and_resume_releases_them() {
        let (transaction, _response, _executor) = parked_transaction();
        transaction.pause_request_body_stream();

        let action = transaction
            .inner
            .lock()
            .write_next_request_part(Bytes::from_static(b"parked"));
        let waiter = match action {
            WriteAction::WriteAndWait { waiter, .. } => waiter,
            _ => panic!("expected a parked write"),
        };

        transaction.resume_request_body_stream();
        assert!(matches!(waiter.await, Ok(Ok(()))));
    }

    #[tokio::test]
    async fn deadline_fails_a_parked_write() {
        let (transaction, response, _executor) = parked_transaction();
        transaction.pause_request_body_stream();

        let action = transaction
            .inner
            .lock()
            .write_next_request_part(Bytes::from_static(b"parked"));
        let waiter = match action {
            WriteAction::WriteAndWait { waiter, .. } => waiter,
            _ => panic!("expected a parked write"),
        };

        transaction.deadline_exceeded();
        assert!(matches!(waiter.await, Ok(Err(Error::DeadlineExceeded))));
        assert!(matches!(response.await, Err(Error::DeadlineExceeded)));
    }

    #[tokio::test]
    async fn response_body_backpressure_pauses_demand() {
        let (transaction, response) = Transaction::new(key(), RequestBody::Empty);
        let executor = Arc::new(RecordingExecutor::default());

        transaction.request_queued(Arc::new(RecordingScheduler::default()));
        transaction.will_execute_request(executor.clone());
        transaction.receive_response_head(head());

        // A small part leaves room; a huge part does not.
        transaction.receive_response_body_part(Bytes::from_static(b"small"));
        assert_eq!(executor.demanded.load(Ordering::SeqCst), 1);

        transaction.receive_response_body_part(Bytes::from(vec![0u8; 128 * 1024]));
        assert_eq!(executor.demanded.load(Ordering::SeqCst), 1);

        // Draining the stream resumes demand.
        let mut response = response.await.unwrap();
        let _ = response.body.next().await.unwrap().unwrap();
        let _ = response.body.next().await.unwrap().unwrap();
        assert_eq!(executor.demanded.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn error_after_head_finishes_the_body_stream() {
        let (transaction, response) = Transaction::new(key(), RequestBody::Empty);
        let executor = Arc::new(RecordingExecutor::default());

        transaction.request_queued(Arc::new(RecordingScheduler::default()));
        transaction.will_execute_request(executor.clone());
        transaction.receive_response_head(head());

        let mut response = response.await.unwrap();
        transaction.fail(Error::RemoteConnectionClosed);

        assert!(matches!(
            response.body.next().await,
            Some(Err(Error::RemoteConnectionClosed))
        ));
        assert!(response.body.next().await.is_none());
    }

    #[tokio::test]
    async fn trailing_buffer_precedes_the_end() {
        let (transaction, response) = Transaction::new(key(), RequestBody::Empty);
        let executor = Arc::new(RecordingExecutor::default());

        transaction.request_queued(Arc::new(RecordingScheduler::default()));
        transaction.will_execute_request(executor.clone());
        transaction.receive_response_head(head());
        transaction.succeed_request(Some(Bytes::from_static(b"trailer")));

        let mut response = response.await.unwrap();
        let part = response.body.next().await.unwrap().unwrap();
        assert_eq!(part, "trailer");
        assert!(response.body.next().await.is_none());
    }

    #[tokio::test]
    #[should_panic(expected = "second response head")]
    async fn second_response_head_is_a_protocol_error() {
        let (transaction, _response) = Transaction::new(key(), RequestBody::Empty);
        let executor = Arc::new(RecordingExecutor::default());

        transaction.request_queued(Arc::new(RecordingScheduler::default()));
        transaction.will_execute_request(executor);
        transaction.receive_response_head(head());
        transaction.receive_response_head(head());
    }

    #[tokio::test]
    async fn late_events_after_failure_are_dropped() {
        let (transaction, response) = Transaction::new(key(), RequestBody::Empty);
        let executor = Arc::new(RecordingExecutor::default());

        transaction.request_queued(Arc::new(RecordingScheduler::default()));
        transaction.will_execute_request(executor.clone());
        transaction.fail(Error::RemoteConnectionClosed);

        // The connection keeps delivering; everything is dropped.
        transaction.receive_response_head(head());
        transaction.receive_response_body_part(Bytes::from_static(b"late"));
        transaction.succeed_request(None);
        transaction.resume_request_body_stream();

        assert!(matches!(response.await, Err(Error::RemoteConnectionClosed)));
        assert_eq!(executor.demanded.load(Ordering::SeqCst), 0);
    }
}
