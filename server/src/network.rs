//! Listening endpoint and accept loop

use crate::broadcaster::Broadcaster;
use crate::session::ClientSession;
use log::{error, info, warn};
use shared::{server_started_message, ChatError, Connection};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};

/// Pause after a failed accept before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

/// How long shutdown waits for sessions to flush and tear down
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Relay server: one listener, one broadcaster, one task per connection
pub struct Server {
    listener: TcpListener,
    broadcaster: Arc<Broadcaster>,
    sessions: JoinSet<()>,
}

impl Server {
    /// Binds `addr` and announces the port on the local display sink.
    ///
    /// Fails with [`ChatError::Bind`] if the address is taken; nothing is
    /// started in that case.
    pub async fn bind(
        addr: &str,
        display: mpsc::UnboundedSender<String>,
    ) -> Result<Self, ChatError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ChatError::Bind {
                addr: addr.to_string(),
                source,
            })?;

        let local_addr = listener.local_addr()?;
        info!("Server listening on {}", local_addr);

        let broadcaster = Arc::new(Broadcaster::new(display));
        broadcaster.display(server_started_message(local_addr.port()));

        Ok(Server {
            listener,
            broadcaster,
            sessions: JoinSet::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ChatError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn broadcaster(&self) -> Arc<Broadcaster> {
        Arc::clone(&self.broadcaster)
    }

    /// Accepts connections forever
    pub async fn run(self) -> Result<(), ChatError> {
        self.run_until(std::future::pending::<()>()).await
    }

    /// Accepts connections until `shutdown` resolves.
    ///
    /// Then drops the listener, closes every session and waits up to
    /// [`SHUTDOWN_GRACE`] for them to flush their queues and report their
    /// departure. Sessions still running after that are aborted.
    pub async fn run_until<F>(mut self, shutdown: F) -> Result<(), ChatError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        info!("Server started successfully");

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Server shutting down");
                    break;
                }

                accepted = Connection::accept(&self.listener) => match accepted {
                    Ok(connection) => self.spawn_session(connection).await,
                    Err(e) => {
                        error!("{}", e);
                        sleep(ACCEPT_BACKOFF).await;
                    }
                },

                Some(finished) = self.sessions.join_next(), if !self.sessions.is_empty() => {
                    if let Err(e) = finished {
                        warn!("Session task ended abnormally: {}", e);
                    }
                }
            }
        }

        drop(self.listener);
        self.broadcaster.close_all().await;

        let sessions = &mut self.sessions;
        let drained = timeout(SHUTDOWN_GRACE, async {
            while let Some(finished) = sessions.join_next().await {
                if let Err(e) = finished {
                    warn!("Session task ended abnormally: {}", e);
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                "{} sessions still running after {:?}, aborting them",
                self.sessions.len(),
                SHUTDOWN_GRACE
            );
            self.sessions.shutdown().await;
        }

        Ok(())
    }

    /// Wraps an accepted connection and runs it on its own task
    async fn spawn_session(&mut self, connection: Connection) {
        let identity = self.broadcaster.next_identity().await;
        info!("Accepted {} from {}", identity, connection.peer_addr());

        let session = ClientSession::new(identity, connection);
        self.sessions.spawn(session.run(Arc::clone(&self.broadcaster)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpStream;
    use tokio::sync::oneshot;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_bind_announces_port_on_display() {
        let (display_tx, mut display_rx) = mpsc::unbounded_channel();
        let server = Server::bind("127.0.0.1:0", display_tx).await.unwrap();
        let port = server.local_addr().unwrap().port();

        assert_eq!(
            display_rx.recv().await.unwrap(),
            format!("Server started on PORT {}", port)
        );
    }

    #[tokio::test]
    async fn test_second_bind_fails_with_bind_error() {
        let (display_tx, _display_rx) = mpsc::unbounded_channel();
        let first = Server::bind("127.0.0.1:0", display_tx.clone()).await.unwrap();
        let addr = first.local_addr().unwrap().to_string();

        match Server::bind(&addr, display_tx).await {
            Err(ChatError::Bind { addr: reported, .. }) => assert_eq!(reported, addr),
            Err(e) => panic!("Unexpected error: {}", e),
            Ok(_) => panic!("Second bind on {} succeeded", addr),
        }
    }

    #[tokio::test]
    async fn test_accept_loop_assigns_identities() {
        let (display_tx, _display_rx) = mpsc::unbounded_channel();
        let server = Server::bind("127.0.0.1:0", display_tx).await.unwrap();
        let addr = server.local_addr().unwrap();
        let broadcaster = server.broadcaster();
        tokio::spawn(server.run());

        let first = TcpStream::connect(addr).await.unwrap();
        let mut first_lines = BufReader::new(first).lines();
        assert_eq!(
            first_lines.next_line().await.unwrap(),
            Some("Client0 connected".to_string())
        );

        let second = TcpStream::connect(addr).await.unwrap();
        let mut second_lines = BufReader::new(second).lines();
        assert_eq!(
            second_lines.next_line().await.unwrap(),
            Some("Client1 connected".to_string())
        );
        assert_eq!(
            first_lines.next_line().await.unwrap(),
            Some("Client1 connected".to_string())
        );

        assert_eq!(broadcaster.roster().await, vec!["Client0", "Client1"]);
    }

    #[tokio::test]
    async fn test_shutdown_stops_accepting() {
        let (display_tx, _display_rx) = mpsc::unbounded_channel();
        let server = Server::bind("127.0.0.1:0", display_tx).await.unwrap();
        let addr = server.local_addr().unwrap();

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(server.run_until(async {
            let _ = stop_rx.await;
        }));

        stop_tx.send(()).unwrap();
        let result = timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        tokio_test::assert_ok!(result);

        // Listener is dropped with the server
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_closes_sessions_before_returning() {
        let (display_tx, mut display_rx) = mpsc::unbounded_channel();
        let server = Server::bind("127.0.0.1:0", display_tx).await.unwrap();
        let addr = server.local_addr().unwrap();
        let broadcaster = server.broadcaster();

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(server.run_until(async {
            let _ = stop_rx.await;
        }));

        // A peer that stays connected and silent
        let peer = TcpStream::connect(addr).await.unwrap();
        let mut peer_lines = BufReader::new(peer).lines();
        assert_eq!(
            peer_lines.next_line().await.unwrap(),
            Some("Client0 connected".to_string())
        );

        stop_tx.send(()).unwrap();
        let result = timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        tokio_test::assert_ok!(result);

        // Teardown finished before run_until returned
        assert!(broadcaster.is_empty().await);
        assert_eq!(peer_lines.next_line().await.unwrap(), None);

        let mut displayed = Vec::new();
        while let Ok(line) = display_rx.try_recv() {
            displayed.push(line);
        }
        assert_eq!(
            displayed,
            vec![
                format!("Server started on PORT {}", addr.port()),
                "Client0 connected".to_string(),
                "Client0 has disconnected!".to_string(),
            ]
        );
    }
}
