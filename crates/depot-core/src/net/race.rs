//! Staggered racing of equivalent requests.
//!
//! Attempt 0 starts at once. Each further attempt starts either when `stagger`
//! elapses without a winner or as soon as an in-flight attempt fails. The first
//! success wins and every other attempt is dropped on the spot.

use std::future::Future;
use std::time::Duration;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::ErrorKind;

/// Why a single attempt lost.
#[derive(Error, Debug)]
pub enum AttemptError<E> {
    #[error("attempt timed out after {0:?}")]
    TimedOut(Duration),

    #[error("{0}")]
    Failed(E),
}

#[derive(Error, Debug)]
pub enum RaceError<E> {
    #[error("no endpoints to try")]
    Empty,

    #[error("all {attempts} endpoints failed, last error: {last}")]
    AllFailed {
        attempts: usize,
        last: AttemptError<E>,
    },

    #[error("cancelled")]
    Cancelled,
}

impl<E> RaceError<E> {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Empty | Self::AllFailed { .. } => ErrorKind::Unreachable,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }
}

/// The winning attempt.
#[derive(Debug)]
pub struct Won<T> {
    pub value: T,
    /// Position of the winning endpoint.
    pub index: usize,
}

/// Races attempts against a list of endpoints.
#[derive(Debug, Clone, Copy)]
pub struct MirrorRacer {
    stagger: Duration,
    attempt_timeout: Option<Duration>,
}

impl MirrorRacer {
    /// Start one attempt every `stagger` until one wins.
    pub fn new(stagger: Duration) -> Self {
        Self {
            stagger,
            attempt_timeout: None,
        }
    }

    /// Bound every attempt. Hitting the bound counts as that attempt failing.
    pub fn with_attempt_timeout(mut self, limit: Duration) -> Self {
        self.attempt_timeout = Some(limit);
        self
    }

    /// Delay between attempt starts.
    pub fn stagger(&self) -> Duration {
        self.stagger
    }

    /// Per-attempt bound, if any. Body reads reuse it as their stall limit.
    pub fn attempt_timeout(&self) -> Option<Duration> {
        self.attempt_timeout
    }

    /// Race `count` attempts built by `attempt(index)`.
    ///
    /// # Errors
    ///
    /// [`RaceError::AllFailed`] carries the error of the last attempt to finish.
    /// [`RaceError::Cancelled`] when `cancel` fires first.
    pub async fn race<T, E, F, Fut>(
        &self,
        count: usize,
        cancel: &CancellationToken,
        mut attempt: F,
    ) -> Result<Won<T>, RaceError<E>>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if count == 0 {
            return Err(RaceError::Empty);
        }

        let mut in_flight = FuturesUnordered::new();
        in_flight.push(guarded(0, attempt(0), self.attempt_timeout));
        let mut next = 1;

        let tick = tokio::time::sleep(self.stagger);
        tokio::pin!(tick);

        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    tracing::debug!(in_flight = in_flight.len(), "race cancelled");
                    return Err(RaceError::Cancelled);
                }

                Some((index, result)) = in_flight.next() => match result {
                    Ok(value) => {
                        tracing::debug!(index, dropped = in_flight.len(), "race won");
                        return Ok(Won { value, index });
                    }
                    Err(err) => {
                        tracing::debug!(index, error = %AttemptLabel(&err), "race attempt failed");
                        if next < count {
                            in_flight.push(guarded(next, attempt(next), self.attempt_timeout));
                            next += 1;
                            tick.as_mut().reset(Instant::now() + self.stagger);
                        } else if in_flight.is_empty() {
                            return Err(RaceError::AllFailed {
                                attempts: count,
                                last: err,
                            });
                        }
                    }
                },

                () = &mut tick, if next < count => {
                    tracing::debug!(index = next, "starting staggered attempt");
                    in_flight.push(guarded(next, attempt(next), self.attempt_timeout));
                    next += 1;
                    tick.as_mut().reset(Instant::now() + self.stagger);
                }
            }
        }
    }
}

struct AttemptLabel<'a, E>(&'a AttemptError<E>);

impl<E> std::fmt::Display for AttemptLabel<'_, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            AttemptError::TimedOut(limit) => write!(f, "timed out after {limit:?}"),
            AttemptError::Failed(_) => f.write_str("failed"),
        }
    }
}

async fn guarded<T, E, Fut>(
    index: usize,
    fut: Fut,
    limit: Option<Duration>,
) -> (usize, Result<T, AttemptError<E>>)
where
    Fut: Future<Output = Result<T, E>>,
{
    let result = match limit {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => result.map_err(AttemptError::Failed),
            Err(_) => Err(AttemptError::TimedOut(limit)),
        },
        None => fut.await.map_err(AttemptError::Failed),
    };
    (index, result)
}
