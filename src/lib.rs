//! # slowlease
//!
//! A non-authoritative DHCP/BOOTP server (RFC 2131, RFC 2132) that holds
//! every reply back for a fixed delay, so any faster server on the same
//! segment answers the client first.
//!
//! ## Features
//!
//! - DISCOVER, REQUEST, RELEASE, DECLINE and INFORM handling
//! - BOOTP compatibility for legacy clients
//! - Deferred, cancellable replies keyed by client
//! - In-memory lease table with a time-driven reaper
//! - Line-oriented admin console over TCP
//!
//! ## Quick Start
//!
//! ```no_run
//! use slowlease::{Config, DhcpServer};
//!
//! #[tokio::main]
//! async fn main() -> slowlease::Result<()> {
//!     let config = Config::load_or_create("config.json")?;
//!     let server = DhcpServer::new(config)?;
//!     server.run().await
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`DhcpMessage`] - packet codec
//! - [`Leases`] - the lease table, the only shared mutable state
//! - [`Engine`] - the DHCP state machine
//! - [`DelayScheduler`] - holds replies for the configured delay
//! - [`AdminConsole`] - admin command protocol
//! - [`DhcpServer`] - UDP listener and background tasks

pub mod admin;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod lease;
pub mod options;
pub mod packet;
pub mod pool;
pub mod scheduler;
pub mod server;

pub use admin::{AdminConsole, Command, parse_command};
pub use config::Config;
pub use engine::Engine;
pub use error::{Error, Result};
pub use events::EventLog;
pub use lease::{ClientId, Lease, LeaseState, Leases};
pub use options::{DhcpOption, MessageType};
pub use packet::{DhcpMessage, MessageKind};
pub use pool::AddressPool;
pub use scheduler::{DelayScheduler, Reply};
pub use server::DhcpServer;
