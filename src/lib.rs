//! # packet-channel
//!
//! Length-framed TCP channels for Rust services.
//!
//! The crate turns a socket byte stream into discrete logical messages and
//! provides the connection machinery around it: an accept loop with pooled
//! channels, client channels with reconnect, tracked sends with exactly one
//! completion each, and backpressure through a bounded write queue.
//!
//! ## Modules
//! - [`core`]: frame format, packetizer, reassembler and codec
//! - [`transport`]: channels, client and server roles
//! - [`utils`]: object pool, descriptor pool, logging, metrics, timeouts
//! - [`config`]: TOML and environment configuration
//! - [`error`]: the [`ProtocolError`] type
//!
//! ## Wire Format
//! ```text
//! [SequenceId(8)] [TotalLength(8)] [ContentLength(4)] [Content(N)]
//! ```
//! All integers are little-endian. A frame with a zero total or content length
//! is a keep-alive.
//!
//! ## Example
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use bytes::Bytes;
//! use packet_channel::config::NetworkConfig;
//! use packet_channel::core::Message;
//! use packet_channel::transport::{Channel, ChannelHandler, ChannelManager, ClientChannel};
//!
//! struct Echo;
//!
//! impl ChannelHandler for Echo {
//!     fn on_received(&self, channel: &Arc<Channel>, message: Message) {
//!         if let Some(bytes) = message.as_bytes().cloned() {
//!             let _ = channel.try_send(bytes);
//!         }
//!     }
//! }
//!
//! # async fn demo() -> packet_channel::error::Result<()> {
//! let config = NetworkConfig::default();
//! let manager = ChannelManager::bind(config.clone()).await?;
//! manager.set_handler(Arc::new(Echo));
//! let _accepting = manager.start();
//!
//! let client = ClientChannel::from_config(&config);
//! client.send(Bytes::from_static(b"ping")).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod transport;
pub mod utils;

pub use error::{ProtocolError, Result};
