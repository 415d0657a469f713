//! # Chat Relay Server Library
//!
//! Accepts TCP connections, gives each one an identity and relays every line
//! a client sends to all connected clients and to a local display sink.
//!
//! ## Architecture
//!
//! ### Task Per Connection
//! The accept loop runs on its own task and spawns one task per accepted
//! connection for the receive loop, plus a writer task that drains that
//! session's outbound queue. The accept loop never waits on a session's I/O.
//!
//! ### Single Roster Lock
//! The [`broadcaster::Broadcaster`] keeps the roster behind one mutex. Joins,
//! departures and fan-outs all take it, which gives:
//! - per-destination FIFO delivery, since fan-outs never interleave
//! - no delivery to a session after its removal
//! - identities from a counter under the same lock, unique for the process
//!
//! ### Non-Blocking Delivery
//! Delivering a line only enqueues it. A peer whose queue is full or whose
//! writer failed is evicted and announced as disconnected; the remaining
//! peers still get the line.
//!
//! ## Module Organization
//!
//! ### Broadcaster (`broadcaster`)
//! Registration, line relay, disconnect announcements.
//!
//! ### Client Manager (`client_manager`)
//! The roster data structure and identity counter.
//!
//! ### Network (`network`)
//! Binding the listener and the accept loop.
//!
//! ### Session (`session`)
//! Per-connection state machine, receive loop and writer task.
//!
//! ## Wire Messages
//!
//! | Event      | Line                            |
//! |------------|---------------------------------|
//! | join       | `<identity> connected`          |
//! | chat       | `<identity>: <text>`            |
//! | departure  | `<identity> has disconnected!`  |
//!
//! These are plain text and cannot be told apart from a client typing the
//! same words.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::network::Server;
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (display_tx, mut display_rx) = mpsc::unbounded_channel();
//!     tokio::spawn(async move {
//!         while let Some(line) = display_rx.recv().await {
//!             println!("{}", line);
//!         }
//!     });
//!
//!     let server = Server::bind("0.0.0.0:12345", display_tx).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod broadcaster;
pub mod client_manager;
pub mod network;
pub mod session;
