//! # Bot Core Module
//!
//! The mesh ↔ completion pipeline and the server that wires it to a radio.
//!
//! ## Components
//!
//! - [`dedup`] - bounded record of packet ids already handled
//! - [`parser`] - command prefix recognition
//! - [`completion`] - completion service adapter and OpenAI-compatible backend
//! - [`format`] - reply length budget enforcement
//! - [`sender`] - broadcast of replies over the transport
//! - [`dispatch`] - one asynchronous unit per query (unbounded or pooled)
//! - [`state`] - connection / service / active gating
//! - [`listener`] - per-packet entry point
//! - [`server`] - owns everything and exposes the control operations
//!
//! ## Pipeline
//!
//! ```text
//! packet ─► dedup ─► state gate ─► parser ─► dispatcher ─┬─► completion ─► format ─► sender
//!                                                        ├─► completion ─► format ─► sender
//!                                                        └─► ...
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use meshai::bot::BotServer;
//! use meshai::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     let mut server = BotServer::new(config);
//!     server.connect_device(None).await?;
//!     server.enable_service().await?;
//!     server.start()?;
//!     server.run().await
//! }
//! ```

pub mod completion;
pub mod dedup;
pub mod dispatch;
pub mod format;
pub mod listener;
pub mod parser;
pub mod sender;
pub mod server;
pub mod state;

pub use server::BotServer;
