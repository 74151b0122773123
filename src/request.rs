//! A single `execute` call: the query, its completion handle, and its retry/timeout state.

use std::{fmt, time::Duration};

use cassandra_protocol::types::cql_value::CqlValue;
use derive_more::Display;
use tokio::sync::{mpsc, oneshot};

use crate::{
    error::{Error, Result},
    pool::{ConnectionId, RequestKey, WorkerMessage},
    results::QueryResult,
};

/// A CQL statement to execute, along with any bound values. Treated as an opaque payload by the
/// pool and connection; only `Request`/`Connection` look inside it, to build the `QUERY` frame
/// body.
#[derive(Clone, Debug)]
pub struct Statement {
    pub cql: String,
    pub values: Vec<CqlValue>,
}

impl Statement {
    pub fn new(cql: impl Into<String>) -> Self {
        Self {
            cql: cql.into(),
            values: Vec::new(),
        }
    }

    pub fn with_values(cql: impl Into<String>, values: Vec<CqlValue>) -> Self {
        Self {
            cql: cql.into(),
            values,
        }
    }
}

/// The channel a request's timer delivers its fire-event on: the same channel the pool worker
/// reads every other event from, so the timer is just one more producer into that single stream.
pub(crate) type TimeoutSender = mpsc::UnboundedSender<WorkerMessage>;

/// Per-request state: retry budget, connection affinity, and the single-fire completion handle.
///
/// All of `Request`'s fields are mutated only by the pool worker task that owns it (see
/// `pool::worker`), never concurrently, matching the single-threaded cooperative model the rest of
/// the pool follows.
pub(crate) struct Request {
    pub(crate) query: Statement,
    completion: Option<oneshot::Sender<Result<QueryResult>>>,
    timeouts: Vec<Duration>,
    tries: u32,
    used_connections: u64,
    pub(crate) current_connection: Option<ConnectionId>,
    timer: Option<tokio::task::JoinHandle<()>>,
    failed: bool,
    idempotent: bool,
}

/// A point-in-time copy of a request's retry counters, detached from the `Request` itself so it
/// can be captured for an error message after the `Request` has been consumed.
#[derive(Clone, Copy, Debug, Display)]
#[display("Request, {tries} of {max_tries} retries")]
pub struct RequestSnapshot {
    pub(crate) tries: u32,
    pub(crate) max_tries: u32,
}

impl Request {
    pub(crate) fn new(
        query: Statement,
        timeouts: Vec<Duration>,
        idempotent: bool,
        completion: oneshot::Sender<Result<QueryResult>>,
    ) -> Self {
        Self {
            query,
            completion: Some(completion),
            timeouts,
            tries: 0,
            used_connections: 0,
            current_connection: None,
            timer: None,
            failed: false,
            idempotent,
        }
    }

    /// `tries < len(timeouts)`: whether another attempt is allowed by the budget alone. Callers
    /// also need to check `can_retry_after` for the idempotence gate on backend errors.
    pub(crate) fn is_retry_possible(&self) -> bool {
        (self.tries as usize) < self.timeouts.len()
    }

    /// Whether this request may be resubmitted after failing with `cause`. Exhausted budget always
    /// forbids it; a non-idempotent statement additionally forbids retrying a `Backend` error,
    /// since that implies the server already processed (or definitively rejected) the statement.
    pub(crate) fn can_retry_after(&self, cause: &Error) -> bool {
        if !self.is_retry_possible() {
            return false;
        }
        self.idempotent || cause.is_connection_error()
    }

    pub(crate) fn snapshot(&self) -> RequestSnapshot {
        RequestSnapshot {
            tries: self.tries,
            max_tries: self.timeouts.len() as u32,
        }
    }

    /// Schedules `on_timeout(key)` to be delivered on `sender` after `timeouts[tries]`. At most one
    /// timer is ever live: a previously armed timer must be cancelled (via `register_response`)
    /// before this is called again.
    pub(crate) fn arm_timeout(&mut self, sender: TimeoutSender, key: RequestKey) {
        debug_assert!(self.timer.is_none(), "at most one live timer per request");
        let delay = self.timeouts[self.tries as usize];
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = sender.send(WorkerMessage::Timeout(key));
        }));
    }

    /// Cancels the live timer (if any), increments `tries`, and records whether the response was
    /// an error.
    pub(crate) fn register_response(&mut self, failed: bool) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.tries += 1;
        self.failed = failed;
    }

    pub(crate) fn failed(&self) -> bool {
        self.failed
    }

    /// Marks `connection` as used and returns the bitmask of all connections tried so far,
    /// including this one.
    pub(crate) fn mark_dispatched(&mut self, connection: ConnectionId) -> u64 {
        self.current_connection = Some(connection);
        self.used_connections |= connection.mask();
        self.used_connections
    }

    pub(crate) fn used_connections(&self) -> u64 {
        self.used_connections
    }

    /// Resolves the completion handle. A no-op if the caller already dropped their receiver
    /// (abandoned the request) — we still ran it to completion, we just have nobody left to tell.
    pub(crate) fn complete(&mut self, result: Result<QueryResult>) {
        if let Some(sender) = self.completion.take() {
            let _ = sender.send(result);
        }
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.snapshot())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn new_request(timeouts: Vec<Duration>) -> (Request, oneshot::Receiver<Result<QueryResult>>) {
        let (tx, rx) = oneshot::channel();
        (Request::new(Statement::new("SELECT 1"), timeouts, true, tx), rx)
    }

    #[test]
    fn retry_budget_tracks_timeouts_length() {
        let (mut request, _rx) = new_request(vec![Duration::from_millis(1), Duration::from_millis(2)]);
        assert!(request.is_retry_possible());
        request.register_response(true);
        assert!(request.is_retry_possible());
        request.register_response(true);
        assert!(!request.is_retry_possible());
    }

    #[test]
    fn display_matches_historical_format() {
        let (mut request, _rx) = new_request(vec![Duration::from_millis(1); 3]);
        request.register_response(true);
        assert_eq!(request.to_string(), "Request, 1 of 3 retries");
    }

    #[test]
    fn non_idempotent_forbids_retry_after_backend_error() {
        let (tx, _rx) = oneshot::channel();
        let mut request = Request::new(
            Statement::new("INSERT INTO t (k) VALUES (1)"),
            vec![Duration::from_millis(1); 2],
            false,
            tx,
        );
        let backend_error = Error::new(crate::error::ErrorKind::Backend {
            code: 0x2200,
            message: "boom".into(),
        });
        assert!(!request.can_retry_after(&backend_error));

        let shutdown = Error::connection_shutdown("127.0.0.1:9042");
        assert!(request.can_retry_after(&shutdown));
    }
}
