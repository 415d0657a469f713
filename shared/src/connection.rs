//! Line-framed TCP transport used on both ends of the relay
//!
//! Every message is one UTF-8 line terminated by `\n`. A [`Connection`] can be
//! split into a [`LineReader`] and a [`LineWriter`] so that reading and writing
//! run on separate tasks.

use crate::ChatError;
use log::debug;
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

/// Bidirectional line channel to one remote peer
pub struct Connection {
    reader: LineReader,
    writer: LineWriter,
    peer: SocketAddr,
}

impl Connection {
    /// Dials the server at `addr`
    pub async fn open(addr: &str) -> Result<Self, ChatError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| ChatError::Connect {
                addr: addr.to_string(),
                source,
            })?;

        Self::from_stream(stream)
    }

    /// Waits for the next inbound connection on `listener`
    pub async fn accept(listener: &TcpListener) -> Result<Self, ChatError> {
        let (stream, _) = listener.accept().await.map_err(ChatError::Accept)?;
        Self::from_stream(stream)
    }

    pub fn from_stream(stream: TcpStream) -> Result<Self, ChatError> {
        let peer = stream.peer_addr()?;
        // Lines are small and must go out immediately
        stream.set_nodelay(true)?;

        let (read_half, write_half) = stream.into_split();

        Ok(Self {
            reader: LineReader::new(read_half),
            writer: LineWriter::new(write_half),
            peer,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub async fn read_line(&mut self) -> Result<Option<String>, ChatError> {
        self.reader.read_line().await
    }

    pub async fn write_line(&mut self, text: &str) -> Result<(), ChatError> {
        self.writer.write_line(text).await
    }

    pub async fn close(&mut self) -> Result<(), ChatError> {
        self.writer.close().await
    }

    /// Separates the read and write directions so each can live on its own task
    pub fn into_split(self) -> (LineReader, LineWriter) {
        (self.reader, self.writer)
    }
}

/// Receiving half of a [`Connection`]
pub struct LineReader {
    lines: Lines<BufReader<OwnedReadHalf>>,
}

impl LineReader {
    fn new(read_half: OwnedReadHalf) -> Self {
        Self {
            lines: BufReader::new(read_half).lines(),
        }
    }

    /// Returns the next line without its terminator, or `None` once the peer
    /// has closed its side.
    ///
    /// Any run of `\r` before the `\n` counts as part of the terminator, so a
    /// line read here can always be written back out unchanged.
    ///
    /// Cancel safe, so it can sit in a `select!` next to a shutdown signal.
    /// Bytes that are not valid UTF-8 surface as [`ChatError::Io`].
    pub async fn read_line(&mut self) -> Result<Option<String>, ChatError> {
        Ok(self.lines.next_line().await?.map(|mut line| {
            let len = line.trim_end_matches('\r').len();
            line.truncate(len);
            line
        }))
    }
}

/// Sending half of a [`Connection`]
pub struct LineWriter {
    inner: OwnedWriteHalf,
    closed: bool,
}

impl LineWriter {
    fn new(write_half: OwnedWriteHalf) -> Self {
        Self {
            inner: write_half,
            closed: false,
        }
    }

    /// Writes `text` followed by `\n` and flushes before returning.
    ///
    /// Text with a `\n` anywhere or a trailing `\r` is refused: the reader
    /// would split the first and strip the second.
    pub async fn write_line(&mut self, text: &str) -> Result<(), ChatError> {
        if text.contains('\n') || text.ends_with('\r') {
            return Err(ChatError::EmbeddedTerminator);
        }

        if self.closed {
            return Err(ChatError::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection already closed",
            )));
        }

        let mut frame = Vec::with_capacity(text.len() + 1);
        frame.extend_from_slice(text.as_bytes());
        frame.push(b'\n');

        self.inner.write_all(&frame).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Shuts down the write direction. Calling it again is a no-op.
    pub async fn close(&mut self) -> Result<(), ChatError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        match self.inner.shutdown().await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => {
                debug!("Peer already gone while closing: {}", e);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}
