//! Request and response body plumbing.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll, Waker};

use bytes::Bytes;
use futures_core::Stream;

use crate::{BoxError, Error};

use super::Inner;

/// A caller-supplied streaming request body.
pub type BodyDataStream = Pin<Box<dyn Stream<Item = Result<Bytes, BoxError>> + Send + 'static>>;

/// Stop demanding once this much response body is buffered unread.
const HIGH_WATERMARK: usize = 64 * 1024;

/// Resume demand once the unread buffer drains below this.
const LOW_WATERMARK: usize = 16 * 1024;

/// Producer-side verdict after buffering a response body part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Producing {
    /// There is room; demand the next part.
    More,
    /// The buffer is full; wait for the consumer.
    Stop,
}

/// The bounded buffer between the executor and the response body consumer.
pub(super) struct BodyShared {
    state: Mutex<BodyState>,
}

struct BodyState {
    parts: VecDeque<Bytes>,
    buffered: usize,
    /// Producer is paused; the consumer signals when demand may resume.
    paused: bool,
    /// `Some` once the stream is finished; an error is yielded exactly once.
    ended: Option<Result<(), Error>>,
    waker: Option<Waker>,
}

impl BodyShared {
    pub(super) fn new() -> Self {
        Self {
            state: Mutex::new(BodyState {
                parts: VecDeque::new(),
                buffered: 0,
                paused: false,
                ended: None,
                waker: None,
            }),
        }
    }

    /// Buffer a part, waking the consumer.
    pub(super) fn push(&self, part: Bytes) -> Producing {
        let mut state = self.state.lock().expect("response body state poisoned");
        if state.ended.is_some() {
            return Producing::Stop;
        }

        state.buffered += part.len();
        state.parts.push_back(part);
        if let Some(waker) = state.waker.take() {
            waker.wake();
        }

        if state.buffered >= HIGH_WATERMARK {
            state.paused = true;
            Producing::Stop
        } else {
            Producing::More
        }
    }

    /// Finish the stream. The first call wins; later calls no-op.
    pub(super) fn finish(&self, result: Result<(), Error>) {
        let mut state = self.state.lock().expect("response body state poisoned");
        if state.ended.is_none() {
            state.ended = Some(result);
            if let Some(waker) = state.waker.take() {
                waker.wake();
            }
        }
    }

    /// Consumer-side poll. The boolean is true when demand should resume.
    fn poll_next(&self, cx: &mut Context<'_>) -> (Poll<Option<Result<Bytes, Error>>>, bool) {
        let mut state = self.state.lock().expect("response body state poisoned");

        if let Some(part) = state.parts.pop_front() {
            state.buffered -= part.len();
            let resume = state.paused && state.buffered <= LOW_WATERMARK;
            if resume {
                state.paused = false;
            }
            return (Poll::Ready(Some(Ok(part))), resume);
        }

        match state.ended.take() {
            Some(Ok(())) => {
                state.ended = Some(Ok(()));
                (Poll::Ready(None), false)
            }
            Some(Err(error)) => {
                // Terminate cleanly on the next poll.
                state.ended = Some(Ok(()));
                (Poll::Ready(Some(Err(error))), false)
            }
            None => {
                state.waker = Some(cx.waker().clone());
                (Poll::Pending, false)
            }
        }
    }
}

/// The response body, delivered to the caller inside
/// [`Response`][super::Response].
///
/// Backpressure is end-to-end: while the consumer lags, the transaction stops
/// demanding body parts from the executor, and demand resumes as this stream
/// is polled.
pub struct ResponseBodyStream {
    shared: Arc<BodyShared>,
    transaction: Weak<Inner>,
}

impl ResponseBodyStream {
    pub(super) fn new(shared: Arc<BodyShared>, transaction: Weak<Inner>) -> Self {
        Self {
            shared,
            transaction,
        }
    }
}

impl Stream for ResponseBodyStream {
    type Item = Result<Bytes, Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let (poll, resume_demand) = self.shared.poll_next(cx);
        if resume_demand {
            if let Some(transaction) = self.transaction.upgrade() {
                transaction.produce_more();
            }
        }
        poll
    }
}

impl std::fmt::Debug for ResponseBodyStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseBodyStream").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use futures_util::task::noop_waker_ref;

    fn context() -> Context<'static> {
        Context::from_waker(noop_waker_ref())
    }

    #[test]
    fn parts_flow_in_order() {
        let shared = BodyShared::new();
        assert_eq!(shared.push(Bytes::from_static(b"one")), Producing::More);
        assert_eq!(shared.push(Bytes::from_static(b"two")), Producing::More);

        let mut cx = context();
        assert!(matches!(
            shared.poll_next(&mut cx).0,
            Poll::Ready(Some(Ok(part))) if part == "one"
        ));
        assert!(matches!(
            shared.poll_next(&mut cx).0,
            Poll::Ready(Some(Ok(part))) if part == "two"
        ));
        assert!(matches!(shared.poll_next(&mut cx).0, Poll::Pending));
    }

    #[test]
    fn high_watermark_pauses_demand() {
        let shared = BodyShared::new();
        let big = Bytes::from(vec![0u8; HIGH_WATERMARK]);
        assert_eq!(shared.push(big), Producing::Stop);

        // Draining below the low watermark resumes demand exactly once.
        let mut cx = context();
        let (poll, resume) = shared.poll_next(&mut cx);
        assert!(matches!(poll, Poll::Ready(Some(Ok(_)))));
        assert!(resume);

        let (_, resume) = shared.poll_next(&mut cx);
        assert!(!resume);
    }

    #[test]
    fn finish_is_first_writer_wins() {
        let shared = BodyShared::new();
        shared.finish(Err(Error::Cancelled));
        shared.finish(Ok(()));

        let mut cx = context();
        assert!(matches!(
            shared.poll_next(&mut cx).0,
            Poll::Ready(Some(Err(Error::Cancelled)))
        ));
        assert!(matches!(shared.poll_next(&mut cx).0, Poll::Ready(None)));
    }

    #[test]
    fn buffered_parts_drain_before_the_end() {
        let shared = BodyShared::new();
        shared.push(Bytes::from_static(b"tail"));
        shared.finish(Ok(()));

        let mut cx = context();
        assert!(matches!(
            shared.poll_next(&mut cx).0,
            Poll::Ready(Some(Ok(part))) if part == "tail"
        ));
        assert!(matches!(shared.poll_next(&mut cx).0, Poll::Ready(None)));
    }
}
