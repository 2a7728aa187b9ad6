//! Realtime channel layer for the deckhand admin console.
//!
//! A [`registry::ChannelRegistry`] owns exactly one connection per named
//! channel. Views subscribe through a [`channel::Subscription`], receive an
//! immediate snapshot of the channel's canonical state, and then observe
//! every merged update in arrival order. Long-running server operations are
//! driven through an [`executor::OperationExecutor`].

pub mod channel;
pub mod config;
pub mod executor;
pub mod operation;
pub mod registry;
pub mod terminal;

pub use channel::{ChannelUpdate, Subscription};
pub use config::{ReconnectPolicy, RegistryConfig};
pub use executor::{
    ActionReply, ExecuteOptions, OperationError, OperationExecutor, DEFAULT_COMPLETION_GRACE,
};
pub use operation::{OperationState, OperationUpdate};
pub use registry::{ChannelHandle, ChannelRegistry};
pub use terminal::TerminalLogBuffer;
