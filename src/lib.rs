//! Centralized, occasionally-connected synchronization of relational data
//! between many client nodes and one authoritative server, over HTTP/JSON.
//!
//! A host embeds this crate on both ends: client processes call
//! [`client::register`]/[`client::pull`]/[`client::push`]/[`client::repair`]
//! against a [`net::Transport`]; a server process feeds incoming requests
//! to [`server::handle_push`]/[`server::handle_pull`]/etc. Both sides share
//! the same [`engine::Engine`], [`registry::Registry`] and wire [`message`]
//! types.

pub mod client;
pub mod codec;
pub mod compression;
pub mod conflict;
pub mod dialect;
pub mod engine;
pub mod error;
pub mod extensions;
pub mod merge;
pub mod message;
pub mod model;
pub mod net;
pub mod registry;
pub mod server;
pub mod tracking;

pub use engine::{drop_all, get_engine, set_engine, Engine};
pub use error::{Result, SyncError};
pub use model::{Command, ContentType, Node, Operation, Version};
pub use net::Transport;
pub use registry::{Direction, Registry, TrackedTable};
