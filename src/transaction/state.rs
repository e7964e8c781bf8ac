//! The pure transaction state machine.
//!
//! Transitions are tagged variants matched under a mutex; every method
//! returns an action the caller executes after releasing the lock, so no
//! user or executor code ever runs while the state is held. Out-of-order
//! transitions driven by the HTTP layer are programmer errors and panic;
//! external events (cancellation, transport failure) arriving after a
//! terminal state are idempotent no-ops.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::Error;

use super::body::BodyDataStream;
use super::{Executor, Response, Scheduler};

pub(super) type ResponsePromise = oneshot::Sender<Result<Response, Error>>;
pub(super) type WriteWaiter = oneshot::Sender<Result<(), Error>>;

/// Top-level transaction state.
enum State {
    Initialized,
    Queued {
        scheduler: Arc<dyn Scheduler>,
    },
    Executing {
        executor: Arc<dyn Executor>,
        request: RequestStream,
    },
    StreamingResponseBody {
        executor: Arc<dyn Executor>,
        request: RequestStream,
    },
    Finished,
    Failed,
}

impl State {
    fn name(&self) -> &'static str {
        match self {
            State::Initialized => "initialized",
            State::Queued { .. } => "queued",
            State::Executing { .. } => "executing",
            State::StreamingResponseBody { .. } => "streaming response body",
            State::Finished => "finished",
            State::Failed => "failed",
        }
    }
}

/// Request body production substate.
enum RequestStream {
    /// Producer credit has not arrived yet.
    Idle,
    /// Writes flow freely.
    Producing,
    /// The executor asked for a pause; the next write must wait.
    Paused,
    /// A write is parked, waiting for credit or failure.
    Suspended(WriteWaiter),
    /// End-of-stream was forwarded.
    Finished,
}

/// The request body, held until production starts.
pub(super) enum BodySource {
    None,
    Buffered(Bytes),
    Streaming(BodyDataStream),
    Taken,
}

pub(super) enum QueueAction {
    None,
    Cancel(Arc<dyn Scheduler>),
}

pub(super) enum ExecuteAction {
    None,
    Cancel(Arc<dyn Executor>),
}

pub(super) enum ResumeAction {
    None,
    /// Spawn the request body pump over this stream.
    StartStream(BodyDataStream),
    /// Write the single buffered body and signal end-of-stream.
    WriteBufferedAndFinish {
        executor: Arc<dyn Executor>,
        part: Bytes,
    },
    /// Resume a parked write with fresh credit.
    ResumeWaiter(WriteWaiter),
}

pub(super) enum WriteAction {
    /// Write the part and keep pumping.
    Write {
        executor: Arc<dyn Executor>,
        part: Bytes,
    },
    /// Write the part, then park until credit or failure.
    WriteAndWait {
        executor: Arc<dyn Executor>,
        part: Bytes,
        waiter: oneshot::Receiver<Result<(), Error>>,
    },
    /// The transaction is over; exit the pump silently.
    Fail,
}

pub(super) enum HeadAction {
    /// Resolve the response promise.
    Resolve(ResponsePromise),
    /// The transaction already failed; drop the head.
    None,
}

pub(super) enum BodyPartAction {
    /// Buffer the part and, when the source still has room, demand more.
    Forward(Arc<dyn Executor>),
    /// The transaction already failed; drop the part.
    Drop,
}

pub(super) enum SucceedAction {
    /// Finish the response body stream, resuming a parked write first.
    Finish { waiter: Option<WriteWaiter> },
    /// The transaction already failed.
    None,
}

pub(super) enum FailAction {
    /// Already terminal; nothing to do.
    None,
    /// Deliver the error and cancel whatever is still live.
    Fail {
        promise: Option<ResponsePromise>,
        finish_body: bool,
        waiter: Option<WriteWaiter>,
        executor: Option<Arc<dyn Executor>>,
        scheduler: Option<Arc<dyn Scheduler>>,
    },
}

pub(super) struct StateMachine {
    state: State,
    body: BodySource,
    promise: Option<ResponsePromise>,
    started_stream: bool,
    executor_cancelled: bool,
}

impl StateMachine {
    pub(super) fn new(body: BodySource, promise: ResponsePromise) -> Self {
        Self {
            state: State::Initialized,
            body,
            promise: Some(promise),
            started_stream: false,
            executor_cancelled: false,
        }
    }

    pub(super) fn request_queued(&mut self, scheduler: Arc<dyn Scheduler>) -> QueueAction {
        match self.state {
            State::Initialized => {
                self.state = State::Queued { scheduler };
                QueueAction::None
            }
            State::Failed => QueueAction::Cancel(scheduler),
            ref state => panic!("request queued while {}", state.name()),
        }
    }

    pub(super) fn will_execute_request(&mut self, executor: Arc<dyn Executor>) -> ExecuteAction {
        match self.state {
            State::Queued { .. } => {
                self.state = State::Executing {
                    executor,
                    request: RequestStream::Idle,
                };
                ExecuteAction::None
            }
            State::Failed => {
                self.executor_cancelled = true;
                ExecuteAction::Cancel(executor)
            }
            ref state => panic!("execution started while {}", state.name()),
        }
    }

    pub(super) fn resume_request_body_stream(&mut self) -> ResumeAction {
        let (executor, request) = match &mut self.state {
            State::Executing { executor, request }
            | State::StreamingResponseBody { executor, request } => (executor, request),
            State::Failed | State::Finished => return ResumeAction::None,
            state => panic!("request body resumed while {}", state.name()),
        };

        match request {
            RequestStream::Idle => match std::mem::replace(&mut self.body, BodySource::Taken) {
                BodySource::Streaming(stream) => {
                    debug_assert!(!self.started_stream, "request body stream started twice");
                    self.started_stream = true;
                    *request = RequestStream::Producing;
                    ResumeAction::StartStream(stream)
                }
                BodySource::Buffered(part) => {
                    let executor = executor.clone();
                    *request = RequestStream::Finished;
                    ResumeAction::WriteBufferedAndFinish { executor, part }
                }
                BodySource::None => {
                    *request = RequestStream::Finished;
                    ResumeAction::None
                }
                BodySource::Taken => unreachable!("body taken while request stream idle"),
            },
            RequestStream::Paused => {
                *request = RequestStream::Producing;
                ResumeAction::None
            }
            RequestStream::Suspended(_) => {
                let RequestStream::Suspended(waiter) =
                    std::mem::replace(request, RequestStream::Producing)
                else {
                    unreachable!();
                };
                ResumeAction::ResumeWaiter(waiter)
            }
            RequestStream::Producing | RequestStream::Finished => ResumeAction::None,
        }
    }

    pub(super) fn pause_request_body_stream(&mut self) {
        if let State::Executing { request, .. } | State::StreamingResponseBody { request, .. } =
            &mut self.state
        {
            if matches!(request, RequestStream::Producing) {
                *request = RequestStream::Paused;
            }
        }
    }

    pub(super) fn write_next_request_part(&mut self, part: Bytes) -> WriteAction {
        let (executor, request) = match &mut self.state {
            State::Executing { executor, request }
            | State::StreamingResponseBody { executor, request } => (executor, request),
            State::Failed | State::Finished => return WriteAction::Fail,
            state => panic!("request body write while {}", state.name()),
        };

        match request {
            RequestStream::Producing => WriteAction::Write {
                executor: executor.clone(),
                part,
            },
            RequestStream::Paused => {
                let (tx, rx) = oneshot::channel();
                let executor = executor.clone();
                *request = RequestStream::Suspended(tx);
                WriteAction::WriteAndWait {
                    executor,
                    part,
                    waiter: rx,
                }
            }
            RequestStream::Suspended(_) => panic!("request body write while a write is parked"),
            RequestStream::Idle => panic!("request body write before production started"),
            RequestStream::Finished => panic!("request body write after end-of-stream"),
        }
    }

    /// The pump saw end-of-stream; forward it, unless the transaction ended.
    pub(super) fn request_stream_finished(&mut self) -> Option<Arc<dyn Executor>> {
        match &mut self.state {
            State::Executing { executor, request }
            | State::StreamingResponseBody { executor, request } => {
                let executor = executor.clone();
                *request = RequestStream::Finished;
                Some(executor)
            }
            State::Failed | State::Finished => None,
            state => panic!("request stream finished while {}", state.name()),
        }
    }

    pub(super) fn receive_response_head(&mut self) -> HeadAction {
        match std::mem::replace(&mut self.state, State::Failed) {
            State::Executing { executor, request } => {
                self.state = State::StreamingResponseBody { executor, request };
                let promise = self
                    .promise
                    .take()
                    .expect("response promise resolved before the head arrived");
                HeadAction::Resolve(promise)
            }
            State::StreamingResponseBody { .. } => panic!("second response head received"),
            state @ State::Failed => {
                self.state = state;
                HeadAction::None
            }
            state => panic!("response head received while {}", state.name()),
        }
    }

    pub(super) fn receive_response_body_part(&mut self) -> BodyPartAction {
        match &self.state {
            State::StreamingResponseBody { executor, .. } => {
                BodyPartAction::Forward(executor.clone())
            }
            State::Failed | State::Finished => BodyPartAction::Drop,
            state => panic!("response body received while {}", state.name()),
        }
    }

    pub(super) fn succeed_request(&mut self) -> SucceedAction {
        match std::mem::replace(&mut self.state, State::Finished) {
            State::StreamingResponseBody { request, .. } => {
                let waiter = match request {
                    RequestStream::Suspended(waiter) => Some(waiter),
                    _ => None,
                };
                SucceedAction::Finish { waiter }
            }
            state @ State::Failed => {
                self.state = state;
                SucceedAction::None
            }
            state => panic!("request succeeded while {}", state.name()),
        }
    }

    pub(super) fn fail(&mut self) -> FailAction {
        match std::mem::replace(&mut self.state, State::Failed) {
            State::Initialized => FailAction::Fail {
                promise: self.promise.take(),
                finish_body: false,
                waiter: None,
                executor: None,
                scheduler: None,
            },
            State::Queued { scheduler } => FailAction::Fail {
                promise: self.promise.take(),
                finish_body: false,
                waiter: None,
                executor: None,
                scheduler: Some(scheduler),
            },
            State::Executing { executor, request } => FailAction::Fail {
                promise: self.promise.take(),
                finish_body: false,
                waiter: suspended(request),
                executor: self.cancellable(executor),
                scheduler: None,
            },
            State::StreamingResponseBody { executor, request } => FailAction::Fail {
                promise: None,
                finish_body: true,
                waiter: suspended(request),
                executor: self.cancellable(executor),
                scheduler: None,
            },
            state @ (State::Finished | State::Failed) => {
                self.state = state;
                FailAction::None
            }
        }
    }

    /// The live executor, for response-body demand.
    pub(super) fn executor(&self) -> Option<Arc<dyn Executor>> {
        match &self.state {
            State::Executing { executor, .. } | State::StreamingResponseBody { executor, .. } => {
                Some(executor.clone())
            }
            _ => None,
        }
    }

    fn cancellable(&mut self, executor: Arc<dyn Executor>) -> Option<Arc<dyn Executor>> {
        if self.executor_cancelled {
            None
        } else {
            self.executor_cancelled = true;
            Some(executor)
        }
    }
}

fn suspended(request: RequestStream) -> Option<WriteWaiter> {
    match request {
        RequestStream::Suspended(waiter) => Some(waiter),
        _ => None,
    }
}
