//! # Transport Layer
//!
//! Framed TCP channels and the roles that own them.
//!
//! ## Components
//! - **Channel**: one socket with its reader, writer and dispatcher tasks
//! - **Client**: dialing side with serialized connects and reconnect cooldown
//! - **Server**: accept loop, channel pool and active channel registry

pub mod channel;
pub mod client;
pub mod server;

pub use channel::{Channel, ChannelHandler, ChannelSettings, ChannelState};
pub use client::ClientChannel;
pub use server::{ChannelManager, FramerFactory};
