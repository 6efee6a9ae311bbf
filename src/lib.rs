//! # meshai - AI completion bridge for Meshtastic networks
//!
//! meshai listens to a Meshtastic radio, picks out text messages that start
//! with a command prefix (`!` by default), asks an OpenAI-compatible completion
//! service for an answer under a strict character budget, and broadcasts the
//! reply back onto the mesh.
//!
//! ## Features
//!
//! - **Meshtastic Integration**: USB/UART serial link using the firmware's protobuf stream API.
//! - **Duplicate suppression**: rebroadcast packets are answered once (bounded memory).
//! - **Concurrent queries**: every query runs independently; an optional worker pool bounds load.
//! - **Length budget**: replies are trimmed to the configured size with a visible `...` marker.
//! - **Explicit gating**: the bot only answers while connected, armed and started.
//!
//! ## Quick Start
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
//!
//! ## Module Organization
//!
//! - [`bot`] - the message pipeline and the server that owns it
//! - [`meshtastic`] - device communication (reader/writer tasks, framing)
//! - [`protobuf`] - Meshtastic protobuf message subset
//! - [`config`] - configuration loading and validation
//! - [`errors`] - typed errors for each component boundary
//! - [`metrics`] - process-wide counters
//! - [`logutil`] - helpers for one-line log output
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   Bot Server    │ ← gating, dedup, parsing, dispatch
//! └─────────────────┘
//!     │         │
//! ┌────────┐ ┌────────────┐
//! │ Mesh   │ │ Completion │
//! │ link   │ │ service    │
//! └────────┘ └────────────┘
//! ```

pub mod bot;
pub mod config;
pub mod errors;
pub mod logutil;
pub mod meshtastic;
pub mod metrics;
pub mod protobuf;
