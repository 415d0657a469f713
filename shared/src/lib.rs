//! Transport and wire vocabulary shared by the relay server and its clients.
//!
//! The wire format is plain newline-delimited text with no envelope, so the
//! system lines built here are indistinguishable from a client typing the same
//! words.

pub mod connection;
pub mod error;

pub use connection::{Connection, LineReader, LineWriter};
pub use error::ChatError;

/// Port the relay listens on unless told otherwise
pub const DEFAULT_PORT: u16 = 12345;

/// Interface the server binds by default
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Prefix for server-assigned identities
pub const IDENTITY_PREFIX: &str = "Client";

pub fn identity_for(sequence: u32) -> String {
    format!("{}{}", IDENTITY_PREFIX, sequence)
}

/// Announced to everyone when a session joins
pub fn connected_message(identity: &str) -> String {
    format!("{} connected", identity)
}

/// A relayed chat line
pub fn chat_message(identity: &str, text: &str) -> String {
    format!("{}: {}", identity, text)
}

/// Announced to the remaining sessions when one leaves
pub fn disconnected_message(identity: &str) -> String {
    format!("{} has disconnected!", identity)
}

pub fn server_started_message(port: u16) -> String {
    format!("Server started on PORT {}", port)
}
