//! A single TCP connection to one host: stream-id bookkeeping and the read/write halves' own
//! tasks. The `Connection` value itself lives inside [`super::worker::PoolWorker`] and is touched
//! only from that one task, per the pool's single-owner concurrency model.

use std::{
    collections::{HashMap, VecDeque},
    net::SocketAddr,
    time::Duration,
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::mpsc,
    task::JoinHandle,
};

use crate::{
    error::{Error, Result},
    frame::{Header, HEADER_LEN},
    pool::{events::WorkerMessage, options::ConnectionOptions},
};

/// Connection identifiers double as the bitmask bit a connection occupies in a pool's
/// `status_mask`/`used_connections` bitmaps: the first connection opened is `1`, the second `2`,
/// the third `4`, and so on.
pub(crate) const MAX_CONNECTIONS: u32 = 63;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn nth(index: u32) -> Self {
        debug_assert!(index < MAX_CONNECTIONS);
        ConnectionId(1u64 << index)
    }

    /// This identifier's contribution to a `status_mask`/`used_connections` bitmap. Connection
    /// identifiers already *are* single-bit masks, so this is an identity function; it exists so
    /// call sites read as bitmask algebra rather than leaning on the representation.
    pub(crate) fn mask(self) -> u64 {
        self.0
    }
}

/// The lifecycle state of one connection: dialing out, negotiating `STARTUP`/`READY`, serving
/// requests, or torn down.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum State {
    /// TCP connect is in flight.
    Connecting,
    /// TCP connected; `STARTUP` sent, awaiting `READY`.
    Starting,
    /// `READY` received; eligible to carry requests.
    Ready,
    /// Closed, awaiting its reconnect back-off.
    Closed,
}

/// Allocates CQL stream ids (0..32768) via a FIFO free-list with a high-water mark, so ids are
/// reused once freed instead of only ever incrementing. FIFO (rather than LIFO) reuse spreads
/// reuse across the whole id space instead of hammering the most-recently-freed id.
#[derive(Debug)]
struct StreamAllocator {
    free: VecDeque<i16>,
    high_water_mark: i32,
}

const MAX_STREAMS: i32 = 1 << 15;

impl StreamAllocator {
    fn new() -> Self {
        Self {
            free: VecDeque::new(),
            high_water_mark: 0,
        }
    }

    fn alloc(&mut self) -> Option<i16> {
        if let Some(id) = self.free.pop_front() {
            return Some(id);
        }
        if self.high_water_mark < MAX_STREAMS {
            let id = self.high_water_mark as i16;
            self.high_water_mark += 1;
            return Some(id);
        }
        None
    }

    fn free(&mut self, id: i16) {
        self.free.push_back(id);
    }

    /// Whether every stream id is currently either allocated or beyond the protocol's range.
    fn is_exhausted(&self) -> bool {
        self.free.is_empty() && self.high_water_mark >= MAX_STREAMS
    }
}

/// One connection's worker-side handle.
pub(crate) struct Connection {
    pub(crate) id: ConnectionId,
    pub(crate) host: String,
    pub(crate) state: State,
    outbox: mpsc::UnboundedSender<Vec<u8>>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
    streams: StreamAllocator,
    pending: HashMap<i16, super::events::RequestKey>,
    consecutive_errors: u32,
}

impl Connection {
    /// Connects to `host`, spawning its reader and writer tasks, and returns it in the
    /// [`State::Connecting`] state. Callers still need to send a `STARTUP` frame and wait for the
    /// worker message stream to deliver the matching `READY`.
    pub(crate) async fn connect(
        id: ConnectionId,
        host: SocketAddr,
        options: &ConnectionOptions,
        events: mpsc::UnboundedSender<WorkerMessage>,
    ) -> Result<Self> {
        let stream = tokio::time::timeout(options.connect_timeout, TcpStream::connect(host))
            .await
            .map_err(|_| Error::protocol(format!("connect to {host} timed out")))??;
        stream.set_nodelay(true)?;

        let socket = socket2::Socket::from(stream.into_std()?);
        let keepalive = socket2::TcpKeepalive::new().with_time(Duration::from_secs(60));
        socket.set_tcp_keepalive(&keepalive)?;
        let stream = TcpStream::from_std(socket.into())?;

        let (mut read_half, mut write_half) = stream.into_split();
        let (outbox, mut outbox_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let writer_task = tokio::spawn(async move {
            while let Some(bytes) = outbox_rx.recv().await {
                if write_half.write_all(&bytes).await.is_err() {
                    break;
                }
            }
        });

        let reader_events = events.clone();
        let reader_task = tokio::spawn(async move {
            loop {
                let mut header_buf = [0u8; HEADER_LEN];
                if let Err(err) = read_half.read_exact(&mut header_buf).await {
                    let _ = reader_events.send(WorkerMessage::Closed {
                        connection: id,
                        error: err.into(),
                    });
                    return;
                }
                let header = match Header::decode(&header_buf) {
                    Ok(header) => header,
                    Err(err) => {
                        let _ = reader_events.send(WorkerMessage::Closed { connection: id, error: err });
                        return;
                    }
                };

                let mut body = vec![0u8; header.length as usize];
                if let Err(err) = read_half.read_exact(&mut body).await {
                    let _ = reader_events.send(WorkerMessage::Closed {
                        connection: id,
                        error: err.into(),
                    });
                    return;
                }

                let opcode = match cassandra_protocol::frame::Opcode::try_from(header.opcode) {
                    Ok(opcode) => opcode,
                    Err(_) => {
                        let _ = reader_events.send(WorkerMessage::Closed {
                            connection: id,
                            error: Error::protocol(format!("unknown opcode {:#04x}", header.opcode)),
                        });
                        return;
                    }
                };

                if reader_events
                    .send(WorkerMessage::Frame {
                        connection: id,
                        stream: header.stream,
                        opcode,
                        body,
                    })
                    .is_err()
                {
                    return;
                }
            }
        });

        Ok(Self {
            id,
            host: host.to_string(),
            state: State::Connecting,
            outbox,
            reader_task,
            writer_task,
            streams: StreamAllocator::new(),
            pending: HashMap::new(),
            consecutive_errors: 0,
        })
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.state == State::Ready
    }

    /// Whether every stream id is in use, i.e. this connection cannot accept another request right
    /// now even though it's otherwise healthy.
    pub(crate) fn is_full(&self) -> bool {
        self.streams.is_exhausted()
    }

    pub(crate) fn alloc_stream(&mut self, request: super::events::RequestKey) -> Option<i16> {
        let stream = self.streams.alloc()?;
        self.pending.insert(stream, request);
        Some(stream)
    }

    /// Releases `stream` back to the pool, returning the request it was carrying if any.
    pub(crate) fn release_stream(&mut self, stream: i16) -> Option<super::events::RequestKey> {
        let request = self.pending.remove(&stream);
        self.streams.free(stream);
        request
    }

    pub(crate) fn pending_request(&self, stream: i16) -> Option<super::events::RequestKey> {
        self.pending.get(&stream).copied()
    }

    /// Finds the stream id currently carrying `key`, if any.
    pub(crate) fn stream_for(&self, key: super::events::RequestKey) -> Option<i16> {
        self.pending
            .iter()
            .find_map(|(stream, pending)| (*pending == key).then_some(*stream))
    }

    /// Detaches `stream` from `key` without returning the id to the free list: a reply may still
    /// arrive for it later, and reusing the id immediately would let that stray reply be
    /// misdelivered to whatever new request claims it next.
    pub(crate) fn abandon_stream(&mut self, stream: i16) {
        self.pending.remove(&stream);
    }

    /// Queues a pre-encoded frame for the writer task. Never blocks: the writer task is the only
    /// thing that awaits on the socket.
    pub(crate) fn send(&self, frame: Vec<u8>) -> Result<()> {
        self.outbox
            .send(frame)
            .map_err(|_| Error::connection_shutdown(self.host.clone()))
    }

    pub(crate) fn record_success(&mut self) {
        self.consecutive_errors = 0;
    }

    /// Records a failed attempt on this connection and returns whether it has now crossed the
    /// ejection threshold.
    pub(crate) fn record_failure(&mut self, threshold: u32) -> bool {
        self.consecutive_errors += 1;
        self.consecutive_errors > threshold
    }

    /// All requests still awaiting a response on this connection, releasing their stream ids.
    pub(crate) fn drain_pending(&mut self) -> Vec<super::events::RequestKey> {
        let keys = self.pending.values().copied().collect();
        self.pending.clear();
        self.streams = StreamAllocator::new();
        keys
    }

    pub(crate) fn close(&mut self) {
        self.state = State::Closed;
        self.reader_task.abort();
        self.writer_task.abort();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader_task.abort();
        self.writer_task.abort();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn stream_ids_are_reused_after_release() {
        let mut streams = StreamAllocator::new();
        let a = streams.alloc().unwrap();
        let b = streams.alloc().unwrap();
        assert_ne!(a, b);
        streams.free(a);
        let c = streams.alloc().unwrap();
        assert_eq!(a, c);
    }

    #[test]
    fn freed_ids_are_reused_fifo_not_lifo() {
        let mut streams = StreamAllocator::new();
        let a = streams.alloc().unwrap();
        let b = streams.alloc().unwrap();
        streams.free(a);
        streams.free(b);
        // `a` was freed first, so it must come back first: a stack (LIFO) would hand back `b`.
        assert_eq!(streams.alloc().unwrap(), a);
        assert_eq!(streams.alloc().unwrap(), b);
    }

    #[test]
    fn exhausting_every_stream_id_reports_full_until_one_is_freed() {
        let mut streams = StreamAllocator::new();
        let mut allocated = Vec::new();
        while let Some(id) = streams.alloc() {
            allocated.push(id);
        }
        assert_eq!(allocated.len(), MAX_STREAMS as usize);
        assert!(streams.is_exhausted());

        let freed = allocated.pop().unwrap();
        streams.free(freed);
        assert!(!streams.is_exhausted());

        let reallocated = streams.alloc().unwrap();
        assert_eq!(reallocated, freed);
        assert!(streams.is_exhausted());
    }

    #[test]
    fn connection_id_masks_are_disjoint_powers_of_two() {
        let a = ConnectionId::nth(0);
        let b = ConnectionId::nth(1);
        let c = ConnectionId::nth(2);
        assert_eq!(a.mask(), 1);
        assert_eq!(b.mask(), 2);
        assert_eq!(c.mask(), 4);
        assert_eq!(a.mask() & b.mask(), 0);
    }
}
