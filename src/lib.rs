//! Server-mediated chat with peer file sharing.
//!
//! Clients hold one long-lived control connection to the server for chat and
//! file requests, and each runs a small transfer endpoint that peers' files
//! are relayed through. Each module focuses on a concrete responsibility:
//!
//! - [`cli`] parses the command-line interface for server and client modes.
//! - [`protocol`] defines the control-line codec and the length-prefixed
//!   transfer-frame codec.
//! - [`registry`] tracks live sessions behind a single lock, the only state
//!   shared across tasks.
//! - [`server`] accepts control connections, dispatches frames, and fans
//!   chat out to every other session.
//! - [`relay`] bridges an owner's and a requestor's transfer endpoints for
//!   one file.
//! - [`endpoint`] is the per-client transfer listener that transmits and
//!   receives the actual file bodies.
//! - [`client`] is the interactive terminal client.
//!
//! Integration tests use this crate directly to exercise the dispatch loop,
//! the relay, and the wire protocol.

pub mod cli;
pub mod client;
pub mod endpoint;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod server;
