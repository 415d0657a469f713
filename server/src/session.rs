//! Server-side state for one connected peer
//!
//! A [`ClientSession`] owns the peer's [`Connection`] and runs two tasks for it:
//! the receive loop, which hands every inbound line to the [`Broadcaster`], and
//! a writer task draining a bounded outbound queue. Everything else in the
//! server talks to the session through a cloneable [`SessionHandle`].

use crate::broadcaster::Broadcaster;
use log::{debug, info, warn};
use shared::{Connection, LineReader, LineWriter};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::timeout;

/// Lines a peer may fall behind before it is treated as gone
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Longest a single line write may stall before the peer is treated as gone
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle of a session. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Closed,
}

/// Why a line could not be queued for a peer
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("outbound queue is full")]
    Full,
    #[error("session is closed")]
    Closed,
}

/// Cheap, cloneable reference to a session, stored in the roster
#[derive(Debug, Clone)]
pub struct SessionHandle {
    identity: Arc<str>,
    outbound: mpsc::Sender<String>,
    shutdown: Arc<Notify>,
    state: watch::Receiver<SessionState>,
}

impl SessionHandle {
    /// Builds a handle that is not backed by a socket.
    ///
    /// Lines delivered to it land in the returned receiver. Used to attach
    /// in-process observers to a [`Broadcaster`].
    pub fn channel(identity: &str, capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (outbound, outbound_rx) = mpsc::channel(capacity);
        let (_, state) = watch::channel(SessionState::Active);

        let handle = Self {
            identity: Arc::from(identity),
            outbound,
            shutdown: Arc::new(Notify::new()),
            state,
        };

        (handle, outbound_rx)
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Queues `line` for the peer without waiting.
    ///
    /// A full queue means the peer stopped reading; a closed one means its
    /// writer already failed. Either way the caller should drop the session.
    pub fn deliver(&self, line: &str) -> Result<(), DeliveryError> {
        self.outbound
            .try_send(line.to_string())
            .map_err(|e| match e {
                TrySendError::Full(_) => DeliveryError::Full,
                TrySendError::Closed(_) => DeliveryError::Closed,
            })
    }

    /// Asks the session to stop. Safe to call from any task, any number of times.
    pub fn close(&self) {
        self.shutdown.notify_one();
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }
}

/// One accepted peer, from wrap to teardown
pub struct ClientSession {
    connection: Connection,
    handle: SessionHandle,
    outbound_rx: mpsc::Receiver<String>,
    state: watch::Sender<SessionState>,
    write_timeout: Duration,
}

impl ClientSession {
    pub fn new(identity: String, connection: Connection) -> Self {
        Self::with_write_timeout(identity, connection, WRITE_TIMEOUT)
    }

    /// Like [`ClientSession::new`], with a custom limit on how long one line
    /// write may stall before the peer counts as gone
    pub fn with_write_timeout(
        identity: String,
        connection: Connection,
        write_timeout: Duration,
    ) -> Self {
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let (state, state_rx) = watch::channel(SessionState::Connecting);

        let handle = SessionHandle {
            identity: Arc::from(identity),
            outbound,
            shutdown: Arc::new(Notify::new()),
            state: state_rx,
        };

        Self {
            connection,
            handle,
            outbound_rx,
            state,
            write_timeout,
        }
    }

    pub fn identity(&self) -> &str {
        self.handle.identity()
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.connection.peer_addr()
    }

    /// Drives the session until the peer leaves, I/O fails or `close` is called.
    ///
    /// Registers with `broadcaster` on entry and reports the disconnect exactly
    /// once on exit. Both socket halves are released before this returns.
    pub async fn run(self, broadcaster: Arc<Broadcaster>) {
        let ClientSession {
            connection,
            handle,
            outbound_rx,
            state,
            write_timeout,
        } = self;

        let peer = connection.peer_addr();
        let (mut reader, writer) = connection.into_split();

        let writer_task = tokio::spawn(write_loop(
            OutboundWriter {
                identity: Arc::clone(&handle.identity),
                writer,
                write_timeout,
                shutdown: Arc::clone(&handle.shutdown),
            },
            outbound_rx,
            state.subscribe(),
        ));

        state.send_replace(SessionState::Active);
        broadcaster.register(handle.clone()).await;

        receive_loop(&handle, &mut reader, &broadcaster).await;

        state.send_replace(SessionState::Closed);
        broadcaster.on_disconnect(&handle).await;

        // Writer sees Closed, drains what is queued, then shuts the socket
        drop(reader);
        if let Err(e) = writer_task.await {
            warn!("Writer task for {} ended abnormally: {}", peer, e);
        }

        info!("Session for {} closed", peer);
    }
}

async fn receive_loop(handle: &SessionHandle, reader: &mut LineReader, broadcaster: &Broadcaster) {
    loop {
        tokio::select! {
            result = reader.read_line() => match result {
                Ok(Some(line)) => {
                    if line.is_empty() {
                        continue;
                    }
                    debug!("{} sent {} bytes", handle.identity(), line.len());
                    broadcaster.on_line(handle, &line).await;
                }
                Ok(None) => {
                    info!("{} closed the connection", handle.identity());
                    break;
                }
                Err(e) => {
                    warn!("Read error from {}: {}", handle.identity(), e);
                    break;
                }
            },

            _ = handle.shutdown.notified() => {
                info!("{} shut down", handle.identity());
                break;
            }
        }
    }
}

/// Socket side of the writer task
struct OutboundWriter {
    identity: Arc<str>,
    writer: LineWriter,
    write_timeout: Duration,
    shutdown: Arc<Notify>,
}

impl OutboundWriter {
    /// Writes one line; false means the peer is unusable and the session was told to stop
    async fn write_one(&mut self, line: &str) -> bool {
        match timeout(self.write_timeout, self.writer.write_line(line)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) if !e.is_disconnect() => {
                warn!("Dropped a line for {}: {}", self.identity, e);
                true
            }
            Ok(Err(e)) => {
                warn!("Write to {} failed: {}", self.identity, e);
                self.shutdown.notify_one();
                false
            }
            Err(_) => {
                warn!(
                    "Write to {} timed out after {:?}",
                    self.identity, self.write_timeout
                );
                self.shutdown.notify_one();
                false
            }
        }
    }

    async fn close(mut self) {
        if let Err(e) = self.writer.close().await {
            debug!("Closing writer for {} failed: {}", self.identity, e);
        }
    }
}

async fn write_loop(
    mut out: OutboundWriter,
    mut outbound: mpsc::Receiver<String>,
    mut state: watch::Receiver<SessionState>,
) {
    loop {
        tokio::select! {
            biased;

            line = outbound.recv() => match line {
                Some(line) => {
                    if !out.write_one(&line).await {
                        break;
                    }
                }
                None => break,
            },

            _ = session_closed(&mut state) => {
                // Flush what was queued before teardown, then stop
                while let Ok(line) = outbound.try_recv() {
                    if !out.write_one(&line).await {
                        break;
                    }
                }
                break;
            }
        }
    }

    out.close().await;
}

async fn session_closed(state: &mut watch::Receiver<SessionState>) {
    while *state.borrow_and_update() != SessionState::Closed {
        if state.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::{TcpListener, TcpSocket, TcpStream};
    use tokio::time::timeout;

    async fn accepted_connection() -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let peer = TcpStream::connect(addr).await.unwrap();
        let connection = Connection::accept(&listener).await.unwrap();

        (connection, peer)
    }

    #[test]
    fn test_channel_handle_delivery() {
        let (handle, mut rx) = SessionHandle::channel("Client1", 2);

        assert_eq!(handle.identity(), "Client1");
        assert_eq!(handle.state(), SessionState::Active);

        assert_eq!(handle.deliver("a"), Ok(()));
        assert_eq!(handle.deliver("b"), Ok(()));
        assert_eq!(handle.deliver("c"), Err(DeliveryError::Full));

        assert_eq!(rx.try_recv().unwrap(), "a");
        assert_eq!(rx.try_recv().unwrap(), "b");

        drop(rx);
        assert_eq!(handle.deliver("d"), Err(DeliveryError::Closed));
    }

    #[tokio::test]
    async fn test_new_session_is_connecting() {
        let (connection, peer) = accepted_connection().await;
        let session = ClientSession::new("Client7".to_string(), connection);

        assert_eq!(session.identity(), "Client7");
        assert_eq!(session.state(), SessionState::Connecting);
        assert_eq!(session.handle().state(), SessionState::Connecting);
        assert_eq!(session.peer_addr(), peer.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_session_lifecycle_over_socket() {
        let (display_tx, mut display_rx) = mpsc::unbounded_channel();
        let broadcaster = Arc::new(Broadcaster::new(display_tx));

        let (connection, peer) = accepted_connection().await;
        let session = ClientSession::new("Client1".to_string(), connection);
        let handle = session.handle();

        let task = tokio::spawn(session.run(Arc::clone(&broadcaster)));

        let (peer_read, mut peer_write) = peer.into_split();
        let mut peer_lines = BufReader::new(peer_read).lines();

        assert_eq!(
            peer_lines.next_line().await.unwrap(),
            Some("Client1 connected".to_string())
        );
        assert_eq!(handle.state(), SessionState::Active);

        peer_write.write_all(b"hi\n").await.unwrap();
        assert_eq!(
            peer_lines.next_line().await.unwrap(),
            Some("Client1: hi".to_string())
        );

        peer_write.shutdown().await.unwrap();
        timeout(Duration::from_secs(2), task).await.unwrap().unwrap();

        assert_eq!(handle.state(), SessionState::Closed);
        assert_eq!(peer_lines.next_line().await.unwrap(), None);
        assert!(broadcaster.roster().await.is_empty());

        assert_eq!(display_rx.recv().await.unwrap(), "Client1 connected");
        assert_eq!(display_rx.recv().await.unwrap(), "Client1: hi");
        assert_eq!(
            display_rx.recv().await.unwrap(),
            "Client1 has disconnected!"
        );
    }

    #[tokio::test]
    async fn test_close_unblocks_receive_loop() {
        let (display_tx, _display_rx) = mpsc::unbounded_channel();
        let broadcaster = Arc::new(Broadcaster::new(display_tx));

        let (connection, peer) = accepted_connection().await;
        let session = ClientSession::new("Client1".to_string(), connection);
        let handle = session.handle();

        let task = tokio::spawn(session.run(Arc::clone(&broadcaster)));

        let mut peer_lines = BufReader::new(peer).lines();
        assert_eq!(
            peer_lines.next_line().await.unwrap(),
            Some("Client1 connected".to_string())
        );

        // The peer stays silent; only the close request can end the loop
        handle.close();
        timeout(Duration::from_secs(2), task).await.unwrap().unwrap();

        assert_eq!(handle.state(), SessionState::Closed);
        assert_eq!(peer_lines.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_stalled_write_ends_session() {
        let (display_tx, _display_rx) = mpsc::unbounded_channel();
        let broadcaster = Arc::new(Broadcaster::new(display_tx));

        let (observer, mut observer_rx) = SessionHandle::channel("Client0", 128);
        broadcaster.register(observer.clone()).await;

        // Peer with a tiny receive window that never reads
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let socket = TcpSocket::new_v4().unwrap();
        socket.set_recv_buffer_size(4096).unwrap();
        let _silent_peer = socket.connect(listener.local_addr().unwrap()).await.unwrap();
        let connection = Connection::accept(&listener).await.unwrap();

        let session = ClientSession::with_write_timeout(
            "Client1".to_string(),
            connection,
            Duration::from_millis(50),
        );
        let handle = session.handle();
        let task = tokio::spawn(session.run(Arc::clone(&broadcaster)));

        // Both joins, so the session is in the roster before any traffic
        let mut announcements = Vec::new();
        for _ in 0..2 {
            let line = timeout(Duration::from_secs(2), observer_rx.recv()).await.unwrap();
            announcements.push(line.unwrap());
        }

        // Far fewer lines than the queue holds, so only a stalled write can end it
        let big = "x".repeat(1 << 20);
        for _ in 0..64 {
            if handle.state() == SessionState::Closed {
                break;
            }
            broadcaster.on_line(&observer, &big).await;
            while let Ok(line) = observer_rx.try_recv() {
                if line.len() < 64 {
                    announcements.push(line);
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert_eq!(handle.state(), SessionState::Closed);
        assert!(!broadcaster.roster().await.contains(&"Client1".to_string()));

        while let Ok(line) = observer_rx.try_recv() {
            if line.len() < 64 {
                announcements.push(line);
            }
        }
        assert_eq!(
            announcements,
            vec![
                "Client0 connected",
                "Client1 connected",
                "Client1 has disconnected!"
            ]
        );
    }

    #[tokio::test]
    async fn test_empty_lines_are_not_broadcast() {
        let (display_tx, mut display_rx) = mpsc::unbounded_channel();
        let broadcaster = Arc::new(Broadcaster::new(display_tx));

        let (connection, mut peer) = accepted_connection().await;
        let session = ClientSession::new("Client1".to_string(), connection);
        let task = tokio::spawn(session.run(Arc::clone(&broadcaster)));

        peer.write_all(b"\n\nafter\n").await.unwrap();
        peer.shutdown().await.unwrap();
        timeout(Duration::from_secs(2), task).await.unwrap().unwrap();

        assert_eq!(display_rx.recv().await.unwrap(), "Client1 connected");
        assert_eq!(display_rx.recv().await.unwrap(), "Client1: after");
        assert_eq!(
            display_rx.recv().await.unwrap(),
            "Client1 has disconnected!"
        );
    }
}
