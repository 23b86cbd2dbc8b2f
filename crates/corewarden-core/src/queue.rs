//! Reply plumbing for the single-worker queues.
//!
//! A caller enqueues a job together with a [`Responder`] and immediately gets
//! the matching [`Ticket`]. Enqueueing happens when the job is created, not when
//! the ticket is awaited, so jobs run in call order regardless of await order.

use crate::error::QueueClosed;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Sending half handed to the worker along with a job
#[derive(Debug)]
pub struct Responder<T, E> {
    tx: oneshot::Sender<Result<T, E>>,
}

impl<T, E> Responder<T, E> {
    /// Deliver the job's result; a caller that dropped its ticket is ignored
    pub fn send(self, result: Result<T, E>) {
        let _ = self.tx.send(result);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Future resolving to the result of a queued job
#[derive(Debug)]
#[must_use = "a ticket does nothing unless awaited, the job itself is already queued"]
pub struct Ticket<T, E> {
    rx: oneshot::Receiver<Result<T, E>>,
}

impl<T, E> Unpin for Ticket<T, E> {}

impl<T, E> Ticket<T, E> {
    /// A ticket for a job that could not be queued
    pub fn closed() -> Self {
        let (_, rx) = oneshot::channel();
        Self { rx }
    }
}

/// Create a connected responder/ticket pair
pub fn ticket<T, E>() -> (Responder<T, E>, Ticket<T, E>) {
    let (tx, rx) = oneshot::channel();
    (Responder { tx }, Ticket { rx })
}

impl<T, E> Future for Ticket<T, E>
where
    E: From<QueueClosed>,
{
    type Output = Result<T, E>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or_else(|_| Err(E::from(QueueClosed))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    enum JobError {
        Closed,
    }

    impl From<QueueClosed> for JobError {
        fn from(_: QueueClosed) -> Self {
            JobError::Closed
        }
    }

    #[tokio::test]
    async fn test_ticket_receives_result() {
        let (responder, ticket) = ticket::<u32, JobError>();
        responder.send(Ok(7));
        assert_eq!(ticket.await, Ok(7));
    }

    #[tokio::test]
    async fn test_dropped_responder_reports_closed() {
        let (responder, ticket) = ticket::<u32, JobError>();
        drop(responder);
        assert_eq!(ticket.await, Err(JobError::Closed));
    }

    #[tokio::test]
    async fn test_closed_ticket() {
        let ticket = Ticket::<(), JobError>::closed();
        assert_eq!(ticket.await, Err(JobError::Closed));
    }

    #[test]
    fn test_responder_sees_dropped_ticket() {
        let (responder, ticket) = ticket::<(), JobError>();
        drop(ticket);
        assert!(responder.is_closed());
        responder.send(Ok(()));
    }
}
