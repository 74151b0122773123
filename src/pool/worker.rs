//! The pool's actor task: a single `tokio::select!` loop that owns every connection to every
//! configured contact point and is the sole mutator of all pool/connection/request state, per the
//! invariant that no more than one task may touch that state concurrently.

use std::{
    collections::{HashMap, VecDeque},
    net::SocketAddr,
    time::Duration,
};

use cassandra_protocol::{consistency::Consistency, frame::Opcode};
use rand::Rng;
use tokio::sync::{mpsc, oneshot};

use crate::{
    codec,
    error::{Error, ErrorKind, Result},
    frame::{self, Header},
    pool::{
        connection::{Connection, ConnectionId},
        events::{RequestKey, WorkerMessage},
        options::PoolOptions,
    },
    request::{Request, Statement},
    results::QueryResult,
};

/// A handle callers use to submit work to a running pool. Cloneable; the worker task exits once
/// every clone (and the worker's own copy) is dropped and its channel is empty.
#[derive(Clone)]
pub(crate) struct PoolHandle {
    events: mpsc::UnboundedSender<WorkerMessage>,
}

impl PoolHandle {
    /// Submits `statement` for execution and returns a receiver that resolves once the request
    /// either succeeds, exhausts its retry budget, or is abandoned (dropped without a response,
    /// per the "fire into the void" cancellation model).
    pub(crate) fn execute(
        &self,
        statement: Statement,
        timeouts: Vec<Duration>,
        idempotent: bool,
    ) -> oneshot::Receiver<Result<QueryResult>> {
        let (tx, rx) = oneshot::channel();
        let request = Request::new(statement, timeouts, idempotent, tx);
        // If the worker is already gone, the receiver is dropped with it and the caller observes
        // a closed channel, which reads the same as any other abandoned request.
        let _ = self.events.send(WorkerMessage::Submit(request));
        rx
    }

    pub(crate) fn close(&self) {
        let _ = self.events.send(WorkerMessage::Shutdown);
    }
}

pub(crate) struct PoolWorker {
    /// The contact point each connection identifier dials. Fixed for the pool's lifetime: a
    /// connection always reconnects to the same address it was first assigned.
    hosts: HashMap<ConnectionId, SocketAddr>,
    /// Human-readable rendering of every contact point, used in pool-wide (not per-connection)
    /// error messages such as the shutdown error every in-flight request receives on `close()`.
    description: String,
    options: PoolOptions,
    connections: HashMap<ConnectionId, Connection>,
    status_mask: u64,
    /// Current reconnect back-off per connection id, kept independent of `Connection`'s lifetime
    /// since a closed connection's back-off must survive its `Connection` value being dropped.
    backoffs: HashMap<ConnectionId, Duration>,
    pending: HashMap<RequestKey, Request>,
    backlog: VecDeque<RequestKey>,
    next_key: u64,
    events_tx: mpsc::UnboundedSender<WorkerMessage>,
    events_rx: mpsc::UnboundedReceiver<WorkerMessage>,
    shutting_down: bool,
}

impl PoolWorker {
    /// Spawns the pool's actor task and returns a handle to it. `hosts` must already be resolved
    /// addresses, one per configured contact point, in the order their connection identifiers are
    /// assigned (`hosts[0]` gets identifier `1`, `hosts[1]` gets `2`, and so on). Every host gets
    /// its own connection, sharing this one pool's `status_mask`/failover bitmask.
    pub(crate) fn spawn(hosts: Vec<SocketAddr>, options: PoolOptions) -> PoolHandle {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let handle = PoolHandle {
            events: events_tx.clone(),
        };

        let description = hosts.iter().map(SocketAddr::to_string).collect::<Vec<_>>().join(", ");
        #[cfg(feature = "tracing-unstable")]
        tracing::info!(contact_points = %description, count = hosts.len(), "connection pool initialized");

        let hosts: HashMap<ConnectionId, SocketAddr> = hosts
            .into_iter()
            .enumerate()
            .map(|(index, addr)| (ConnectionId::nth(index as u32), addr))
            .collect();

        let mut worker = PoolWorker {
            hosts,
            description,
            options,
            connections: HashMap::new(),
            status_mask: 0,
            backoffs: HashMap::new(),
            pending: HashMap::new(),
            backlog: VecDeque::new(),
            next_key: 0,
            events_tx,
            events_rx,
            shutting_down: false,
        };

        crate::runtime::spawn(async move {
            worker.init().await;
            worker.run().await;
        });

        handle
    }

    /// Opens a connection to every configured contact point concurrently at start-up.
    #[cfg_attr(feature = "tracing-unstable", tracing::instrument(skip(self)))]
    async fn init(&mut self) {
        let ids: Vec<ConnectionId> = self.hosts.keys().copied().collect();
        for id in ids {
            self.start_connect(id).await;
        }
    }

    async fn run(&mut self) {
        while !self.shutting_down || !self.connections.is_empty() {
            let Some(message) = self.events_rx.recv().await else {
                break;
            };
            self.handle(message).await;
        }
    }

    async fn handle(&mut self, message: WorkerMessage) {
        match message {
            WorkerMessage::Submit(request) => self.on_submit(request),
            WorkerMessage::Frame {
                connection,
                stream,
                opcode,
                body,
            } => self.on_frame(connection, stream, opcode, body),
            WorkerMessage::Closed { connection, error } => self.on_closed(connection, error).await,
            WorkerMessage::Timeout(key) => self.on_timeout(key),
            WorkerMessage::Reconnect(connection) => self.start_connect(connection).await,
            WorkerMessage::Shutdown => self.on_shutdown(),
        }
    }

    fn on_shutdown(&mut self) {
        #[cfg(feature = "tracing-unstable")]
        tracing::info!(contact_points = %self.description, "connection pool closed");
        self.shutting_down = true;
        for (_, connection) in self.connections.iter_mut() {
            connection.close();
        }
        self.connections.clear();
        self.status_mask = 0;
        for (_, mut request) in self.pending.drain() {
            request.complete(Err(Error::connection_shutdown(self.description.clone())));
        }
        self.backlog.clear();
    }

    fn on_submit(&mut self, request: Request) {
        if self.shutting_down {
            return;
        }
        let key = RequestKey(self.next_key);
        self.next_key += 1;
        self.pending.insert(key, request);
        self.try_dispatch(key);
    }

    /// Picks a connection for `key`: among connections not yet tried by this request (or, if all
    /// have been tried, among every live connection), choose uniformly at random. Queues the
    /// request if no connection currently has a free stream id.
    fn try_dispatch(&mut self, key: RequestKey) {
        let Some(request) = self.pending.get(&key) else {
            return;
        };

        let used = request.used_connections();
        let mut candidates = self.status_mask & !used;
        if candidates == 0 {
            candidates = self.status_mask;
        }
        if candidates == 0 {
            self.backlog.push_back(key);
            return;
        }

        let mut order = set_bits(candidates);
        shuffle(&mut order);

        for bit in order {
            let id = ConnectionId::nth(bit.trailing_zeros());

            let eligible = self
                .connections
                .get(&id)
                .map(|connection| connection.is_ready() && !connection.is_full())
                .unwrap_or(false);
            if !eligible {
                continue;
            }

            let Some(stream) = self.connections.get_mut(&id).and_then(|c| c.alloc_stream(key)) else {
                continue;
            };
            self.update_capacity_mask(id);

            let request = self.pending.get_mut(&key).expect("checked above");
            request.mark_dispatched(id);

            let version = self.options.connection.protocol_version;
            let encoded = match codec::encode_query(version, &request.query, Consistency::One) {
                Ok(body) => body,
                Err(err) => {
                    if let Some(connection) = self.connections.get_mut(&id) {
                        connection.release_stream(stream);
                    }
                    self.update_capacity_mask(id);
                    self.fail_request(key, err);
                    return;
                }
            };
            let frame = build_frame(frame::version_byte(version), stream, frame::opcode::QUERY, &encoded);

            let sent = self
                .connections
                .get(&id)
                .map(|connection| connection.send(frame))
                .unwrap_or_else(|| Err(Error::connection_shutdown(self.description.clone())));
            if sent.is_err() {
                if let Some(connection) = self.connections.get_mut(&id) {
                    connection.release_stream(stream);
                }
                self.update_capacity_mask(id);
                continue;
            }

            let request = self.pending.get_mut(&key).expect("checked above");
            request.arm_timeout(self.events_tx.clone(), key);
            return;
        }

        self.backlog.push_back(key);
    }

    fn on_frame(&mut self, connection_id: ConnectionId, stream: i16, opcode: Opcode, body: Vec<u8>) {
        let Some(connection) = self.connections.get_mut(&connection_id) else {
            return;
        };

        if !connection.is_ready() {
            self.on_startup_response(connection_id, opcode, body);
            return;
        }

        let Some(key) = connection.release_stream(stream) else {
            return;
        };
        self.update_capacity_mask(connection_id);

        let version = self.options.connection.protocol_version;
        let outcome = match opcode {
            Opcode::Error => match codec::decode_error(version, &body) {
                Ok((code, message)) => Err(Error::new(ErrorKind::Backend { code, message })),
                Err(err) => Err(err),
            },
            Opcode::Result => codec::decode_result(version, &body),
            other => Err(Error::protocol(format!("unexpected opcode {other:?} in response"))),
        };

        if let Some(connection) = self.connections.get_mut(&connection_id) {
            connection.record_success();
        }
        self.resolve(key, outcome);
        self.drain_backlog();
    }

    fn on_startup_response(&mut self, connection_id: ConnectionId, opcode: Opcode, body: Vec<u8>) {
        let host = self.hosts.get(&connection_id).copied();
        match opcode {
            Opcode::Ready => {
                if let Some(connection) = self.connections.get_mut(&connection_id) {
                    connection.state = crate::pool::connection::State::Ready;
                }
                self.update_capacity_mask(connection_id);
                #[cfg(feature = "tracing-unstable")]
                tracing::debug!(?host, connection = ?connection_id, "connection ready");
                self.backoffs
                    .insert(connection_id, self.options.reconnect_backoff_start);
                self.drain_backlog();
            }
            Opcode::Error => {
                let version = self.options.connection.protocol_version;
                let (code, message) = codec::decode_error(version, &body).unwrap_or((0, "startup failed".into()));
                #[cfg(feature = "tracing-unstable")]
                tracing::warn!(?host, connection = ?connection_id, code, message, "STARTUP rejected");
                self.close_connection(connection_id, Error::new(ErrorKind::Backend { code, message }));
            }
            other => {
                self.close_connection(
                    connection_id,
                    Error::protocol(format!("unexpected opcode {other:?} during startup")),
                );
            }
        }
    }

    async fn on_closed(&mut self, connection_id: ConnectionId, error: Error) {
        self.close_connection(connection_id, error);
    }

    fn close_connection(&mut self, connection_id: ConnectionId, error: Error) {
        self.status_mask &= !connection_id.mask();
        let Some(mut connection) = self.connections.remove(&connection_id) else {
            return;
        };
        #[cfg(feature = "tracing-unstable")]
        tracing::warn!(
            host = %self.hosts.get(&connection_id).map(SocketAddr::to_string).unwrap_or_default(),
            connection = ?connection_id,
            %error,
            "connection closed"
        );
        connection.close();

        for key in connection.drain_pending() {
            self.fail_or_retry(key, error.clone());
        }

        if self.shutting_down {
            return;
        }

        let backoff = self.escalate_backoff(connection_id);
        self.schedule_reconnect(connection_id, backoff);
    }

    #[cfg_attr(feature = "tracing-unstable", tracing::instrument(skip(self)))]
    async fn start_connect(&mut self, id: ConnectionId) {
        let Some(&host) = self.hosts.get(&id) else {
            return;
        };
        match Connection::connect(id, host, &self.options.connection, self.events_tx.clone()).await {
            Ok(connection) => {
                let version = self.options.connection.protocol_version;
                let startup = codec::encode_startup(version, &self.options.connection.startup_options);
                let frame = build_frame(frame::version_byte(version), 0, frame::opcode::STARTUP, &startup);
                if connection.send(frame).is_ok() {
                    #[cfg(feature = "tracing-unstable")]
                    tracing::debug!(%host, connection = ?id, "TCP connected, STARTUP sent");
                    self.connections.insert(id, connection);
                } else {
                    let backoff = self.escalate_backoff(id);
                    self.schedule_reconnect(id, backoff);
                }
            }
            Err(err) => {
                #[cfg(feature = "tracing-unstable")]
                tracing::debug!(%host, connection = ?id, %err, "connect attempt failed");
                let backoff = self.escalate_backoff(id);
                self.schedule_reconnect(id, backoff);
            }
        }
    }

    /// Returns the back-off to wait before `id`'s next reconnect attempt, then doubles (capped at
    /// `reconnect_backoff_max`) what's stored so the *following* close waits longer. The first
    /// close after a successful `READY` — or after start-up — waits `reconnect_backoff_start`.
    fn escalate_backoff(&mut self, id: ConnectionId) -> Duration {
        let current = *self
            .backoffs
            .get(&id)
            .unwrap_or(&self.options.reconnect_backoff_start);
        let next = (current * 2).min(self.options.reconnect_backoff_max);
        self.backoffs.insert(id, next);
        current
    }

    fn schedule_reconnect(&mut self, id: ConnectionId, backoff: Duration) {
        if self.shutting_down {
            return;
        }
        #[cfg(feature = "tracing-unstable")]
        tracing::debug!(connection = ?id, ?backoff, "scheduling reconnect");
        let events = self.events_tx.clone();
        crate::runtime::spawn(async move {
            crate::runtime::sleep(backoff).await;
            let _ = events.send(WorkerMessage::Reconnect(id));
        });
    }

    fn on_timeout(&mut self, key: RequestKey) {
        if self.shutting_down {
            return;
        }
        let Some(connection_id) = self.pending.get(&key).and_then(|r| r.current_connection) else {
            return;
        };
        let mut ejected = false;
        if let Some(connection) = self.connections.get_mut(&connection_id) {
            // The stream is abandoned, not freed: the server may still answer on it later, and
            // freeing it for reuse would let that stray reply be misdelivered to a new request.
            if let Some(stream) = connection.stream_for(key) {
                connection.abandon_stream(stream);
            }
            ejected = connection.record_failure(self.options.consecutive_error_threshold);
        }
        if ejected {
            #[cfg(feature = "tracing-unstable")]
            tracing::warn!(
                connection = ?connection_id,
                threshold = self.options.consecutive_error_threshold,
                "ejecting connection after consecutive failures"
            );
        }
        // `close_connection` drains every *other* request still pending on this connection; `key`
        // was already detached above so it's resolved exactly once, here, either way.
        if ejected {
            self.close_connection(connection_id, Error::request_timeout());
        }
        self.fail_or_retry(key, Error::request_timeout());
    }

    /// Decides whether `key` gets another attempt after failing with `error`, or is resolved as a
    /// final failure.
    fn fail_or_retry(&mut self, key: RequestKey, error: Error) {
        let Some(request) = self.pending.get_mut(&key) else {
            return;
        };
        request.register_response(true);

        if request.can_retry_after(&error) {
            self.try_dispatch(key);
        } else {
            self.fail_request(key, error);
        }
    }

    /// Resolves `key` as a terminal failure, annotating `error` with the request's retry history.
    fn fail_request(&mut self, key: RequestKey, error: Error) {
        if let Some(mut request) = self.pending.remove(&key) {
            let snapshot = request.snapshot();
            request.complete(Err(error.with_retry_history(&snapshot)));
        }
    }

    fn resolve(&mut self, key: RequestKey, outcome: Result<QueryResult>) {
        let Some(mut request) = self.pending.remove(&key) else {
            return;
        };
        match outcome {
            Ok(value) => {
                request.register_response(false);
                request.complete(Ok(value));
            }
            Err(error) => {
                request.register_response(true);
                if request.can_retry_after(&error) {
                    self.pending.insert(key, request);
                    self.try_dispatch(key);
                } else {
                    let snapshot = request.snapshot();
                    request.complete(Err(error.with_retry_history(&snapshot)));
                }
            }
        }
    }

    fn drain_backlog(&mut self) {
        let backlog = std::mem::take(&mut self.backlog);
        for key in backlog {
            if self.pending.contains_key(&key) {
                self.try_dispatch(key);
            }
        }
    }

    /// Recomputes whether `id` belongs in `status_mask`'s dispatch candidacy (ready and not full),
    /// toggling the shared bit so every other in-flight dispatch attempt across the pool sees the
    /// connection removed from, or restored to, candidacy — not just this one call's inline check.
    fn update_capacity_mask(&mut self, id: ConnectionId) {
        let eligible = self
            .connections
            .get(&id)
            .map(|connection| connection.is_ready() && !connection.is_full())
            .unwrap_or(false);
        let was_eligible = self.status_mask & id.mask() != 0;
        if eligible == was_eligible {
            return;
        }
        if eligible {
            self.status_mask |= id.mask();
        } else {
            self.status_mask &= !id.mask();
        }
        #[cfg(feature = "tracing-unstable")]
        tracing::debug!(connection = ?id, eligible, "status mask transition");
    }
}

fn build_frame(version: u8, stream: i16, opcode: cassandra_protocol::frame::Opcode, body: &[u8]) -> Vec<u8> {
    let header = Header::encode(version, stream, frame::opcode_byte(opcode), body.len() as i32);
    let mut frame = Vec::with_capacity(frame::HEADER_LEN + body.len());
    frame.extend_from_slice(&header);
    frame.extend_from_slice(body);
    frame
}

fn set_bits(mask: u64) -> Vec<u64> {
    let mut bits = Vec::new();
    let mut remaining = mask;
    while remaining != 0 {
        let bit = remaining & remaining.wrapping_neg();
        bits.push(bit);
        remaining &= !bit;
    }
    bits
}

fn shuffle<T>(items: &mut [T]) {
    let mut rng = rand::rng();
    for i in (1..items.len()).rev() {
        let j = rng.random_range(0..=i);
        items.swap(i, j);
    }
}
