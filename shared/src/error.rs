//! Error taxonomy shared by the server and the client

use std::io;
use thiserror::Error;

/// Everything that can go wrong on the chat transport.
///
/// End of stream is not an error: [`crate::LineReader::read_line`] reports it
/// as `Ok(None)`.
#[derive(Debug, Error)]
pub enum ChatError {
    /// The listening endpoint could not be bound, usually because the port is taken
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: String, source: io::Error },

    /// The client could not reach the server
    #[error("failed to connect to {addr}: {source}")]
    Connect { addr: String, source: io::Error },

    /// A single accept call failed; the listener itself stays usable
    #[error("failed to accept connection: {0}")]
    Accept(#[source] io::Error),

    /// Read or write fault on an established connection
    #[error("connection i/o error: {0}")]
    Io(#[from] io::Error),

    /// Refused to write a line that would not arrive intact: an embedded `\n`
    /// or a trailing `\r`
    #[error("line contains an embedded line terminator")]
    EmbeddedTerminator,
}

impl ChatError {
    /// True for the errors that end a connection
    pub fn is_disconnect(&self) -> bool {
        matches!(self, ChatError::Io(_))
    }
}
