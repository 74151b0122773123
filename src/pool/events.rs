use cassandra_protocol::frame::Opcode;

use crate::{error::Error, pool::connection::ConnectionId, request::Request};

/// Identifies a request for the lifetime of a single attempt, so a timeout fired by a spawned
/// timer task can be matched back to the request it belongs to even though the request itself
/// isn't `Send` across the channel a second time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct RequestKey(pub(crate) u64);

/// Everything the pool worker's single event loop reacts to. Every source that can advance the
/// pool's state funnels through this one channel, so the worker never needs more than one
/// `tokio::select!` arm per source.
pub(crate) enum WorkerMessage {
    /// A new statement was submitted by a `Cluster::execute` caller.
    Submit(Request),
    /// A full frame was decoded off `connection`'s socket by its read-loop task.
    Frame {
        connection: ConnectionId,
        stream: i16,
        opcode: Opcode,
        body: Vec<u8>,
    },
    /// `connection`'s socket closed, or its read loop gave up on it (protocol violation).
    Closed { connection: ConnectionId, error: Error },
    /// The current attempt of the request keyed by `RequestKey` timed out.
    Timeout(RequestKey),
    /// A previously scheduled reconnect back-off elapsed; try to reconnect `connection` again.
    Reconnect(ConnectionId),
    /// `Cluster::close` was called; drain in-flight work and stop.
    Shutdown,
}
