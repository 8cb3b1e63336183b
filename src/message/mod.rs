//! Wire message containers (spec §4.6).

pub mod base;
pub mod pull;
pub mod push;
pub mod register;

pub use base::{BaseMessage, Payload, WrappedObject};
pub use pull::{PullMessage, PullRequestMessage};
pub use push::PushMessage;
pub use register::{generate_secret, RegisterMessage};
