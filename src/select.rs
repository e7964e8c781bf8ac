//! First-success racing over a set of connection attempts.

use std::future::Future;
use std::marker::PhantomData;

use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;
use tracing::trace;

/// Races a set of futures, completing with the first success accepted by a
/// predicate.
///
/// Successful-but-rejected values are dropped and the race continues. When
/// every future has failed or been rejected, the race fails with the last
/// error seen, or [`RaceError::Exhausted`] when there was none.
///
/// This is the building block for Happy-Eyeballs-style endpoint selection;
/// stagger attempts by delaying the futures before pushing them.
pub(crate) struct RaceSet<F, T, E> {
    tasks: FuturesUnordered<F>,
    result: PhantomData<fn() -> Result<T, E>>,
}

#[derive(Debug)]
pub(crate) enum RaceError<E> {
    /// Every attempt failed; this was the last failure.
    Failed(E),
    /// No attempt failed, but none was accepted either.
    Exhausted,
}

impl<F, T, E> RaceSet<F, T, E>
where
    F: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    pub(crate) fn new() -> Self {
        Self {
            tasks: FuturesUnordered::new(),
            result: PhantomData,
        }
    }

    pub(crate) fn push(&mut self, future: F) {
        self.tasks.push(future);
    }

    /// Drive the race to completion.
    pub(crate) async fn finish<P>(mut self, accept: P) -> Result<T, RaceError<E>>
    where
        P: Fn(&T) -> bool,
    {
        let mut last_error = None;

        while let Some(outcome) = self.tasks.next().await {
            match outcome {
                Ok(value) if accept(&value) => return Ok(value),
                Ok(_) => {
                    trace!("attempt succeeded but was rejected");
                }
                Err(error) => {
                    trace!("attempt error: {}", error);
                    last_error = Some(error);
                }
            }
        }

        match last_error {
            Some(error) => Err(RaceError::Failed(error)),
            None => Err(RaceError::Exhausted),
        }
    }
}
