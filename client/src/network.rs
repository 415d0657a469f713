use log::{debug, info, warn};
use shared::{ChatError, Connection, LineReader};
use std::net::SocketAddr;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;

/// One connection to the relay server
pub struct ChatClient {
    connection: Connection,
}

impl ChatClient {
    /// Dials the server. Failure is reported as [`ChatError::Connect`] and not retried.
    pub async fn connect(server_addr: &str) -> Result<Self, ChatError> {
        info!("Connecting to server at {}...", server_addr);

        let connection = Connection::open(server_addr).await?;
        info!("Connected to {}", connection.peer_addr());

        Ok(ChatClient { connection })
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.connection.peer_addr()
    }

    /// Sends every non-empty line of `input` and forwards every received line to `display`.
    ///
    /// Outgoing lines are trimmed first. Returns when the server closes the
    /// connection, or once `input` is exhausted and the server has finished
    /// sending.
    pub async fn run<R>(
        self,
        input: R,
        display: mpsc::UnboundedSender<String>,
    ) -> Result<(), ChatError>
    where
        R: AsyncBufRead + Unpin,
    {
        let (reader, mut writer) = self.connection.into_split();
        let mut listener = tokio::spawn(listen(reader, display));
        let mut input = input.lines();

        loop {
            tokio::select! {
                line = input.next_line() => match line? {
                    Some(line) => {
                        let message = line.trim();
                        if message.is_empty() {
                            continue;
                        }
                        writer.write_line(message).await?;
                    }
                    None => {
                        info!("Input closed, disconnecting");
                        writer.close().await?;
                        break;
                    }
                },

                _ = &mut listener => {
                    info!("Server closed the connection");
                    return Ok(());
                }
            }
        }

        // Server closes its side once it has processed our departure
        if let Err(e) = listener.await {
            warn!("Listener task ended abnormally: {}", e);
        }

        Ok(())
    }
}

/// Forwards received lines to the display until the server hangs up
async fn listen(mut reader: LineReader, display: mpsc::UnboundedSender<String>) {
    loop {
        match reader.read_line().await {
            Ok(Some(line)) => {
                if display.send(line).is_err() {
                    debug!("Display closed, stop listening");
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Error receiving message: {}", e);
                break;
            }
        }
    }
}
