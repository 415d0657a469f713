//! # Chat Relay Client Library
//!
//! Terminal-side collaborator of the relay server. A [`network::ChatClient`]
//! opens one connection, writes lines typed by the user and hands every line
//! the server sends to a display sink.
//!
//! ## Behaviour
//!
//! - Outgoing lines are trimmed; empty ones are never sent.
//! - Every line written is flushed immediately.
//! - Received lines are shown verbatim, system announcements included.
//! - A failed dial is reported once and not retried.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::network::ChatClient;
//! use tokio::io::BufReader;
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = ChatClient::connect("127.0.0.1:12345").await?;
//!
//!     let (display_tx, mut display_rx) = mpsc::unbounded_channel();
//!     tokio::spawn(async move {
//!         while let Some(line) = display_rx.recv().await {
//!             println!("{}", line);
//!         }
//!     });
//!
//!     client
//!         .run(BufReader::new(tokio::io::stdin()), display_tx)
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod network;
