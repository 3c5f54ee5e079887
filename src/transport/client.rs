//! # Client Channel
//!
//! The connect-initiating side of a channel.
//!
//! Connect attempts are serialized through one async gate, so concurrent
//! callers share a single dial. A failed dial is retried up to
//! `max_reconnect_attempts` times with a doubling delay, each attempt bounded
//! by `connection_timeout`. The channel keeps its id and packetizer across
//! reconnects.
//!
//! ## Example
//! ```rust,no_run
//! use bytes::Bytes;
//! use packet_channel::config::NetworkConfig;
//! use packet_channel::transport::client::ClientChannel;
//!
//! # async fn demo() -> packet_channel::error::Result<()> {
//! let client = ClientChannel::from_config(&NetworkConfig::default());
//! client.connect().await?;
//! let sequence_id = client.send(Bytes::from_static(b"hello")).await?;
//! # let _ = sequence_id;
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::{ClientConfig, NetworkConfig, TransportConfig};
use crate::core::packetizer::Packetizer;
use crate::error::{constants, ProtocolError, Result};
use crate::transport::channel::{Channel, ChannelHandler, ChannelSettings, ChannelState};
use crate::utils::buffer_pool::DescriptorPool;
use crate::utils::metrics::{global_metrics, Timer};
use crate::utils::timeout::with_timeout_error;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// A channel that dials its peer and reconnects on demand
pub struct ClientChannel {
    channel: Arc<Channel>,
    address: String,
    config: ClientConfig,
    connect_gate: tokio::sync::Mutex<()>,
    last_attempt: Mutex<Option<Instant>>,
}

impl std::fmt::Debug for ClientChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientChannel")
            .field("address", &self.address)
            .field("channel", &self.channel)
            .finish()
    }
}

impl ClientChannel {
    pub fn new(address: impl Into<String>, client: ClientConfig, transport: &TransportConfig) -> Self {
        let settings = ChannelSettings::for_client(transport, &client);
        let descriptors = DescriptorPool::new(transport.write_descriptor_capacity);
        let channel = Arc::new(Channel::new(
            NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed),
            settings,
            descriptors,
        ));
        channel.set_packetizer(Packetizer::from_config(transport));

        Self {
            channel,
            address: address.into(),
            config: client,
            connect_gate: tokio::sync::Mutex::new(()),
            last_attempt: Mutex::new(None),
        }
    }

    /// Client for `config.client.address`
    pub fn from_config(config: &NetworkConfig) -> Self {
        Self::new(
            config.client.address.clone(),
            config.client.clone(),
            &config.transport,
        )
    }

    pub fn with_packetizer(self, packetizer: Packetizer) -> Self {
        self.channel.set_packetizer(packetizer);
        self
    }

    pub fn with_handler(self, handler: Arc<dyn ChannelHandler>) -> Self {
        self.channel.set_handler(handler);
        self
    }

    /// The underlying channel; its id survives reconnects
    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Connect if not already connected, retrying with backoff.
    ///
    /// # Errors
    /// [`ProtocolError::ConnectFailure`] once every attempt has failed.
    #[instrument(skip(self), fields(channel_id = self.channel.id(), address = %self.address))]
    pub async fn connect(&self) -> Result<()> {
        let _gate = self.connect_gate.lock().await;
        if self.channel.is_active() {
            return Ok(());
        }

        let _timer = Timer::start("client_connect");
        let attempts = self.config.max_reconnect_attempts.max(1);
        let mut delay = self.config.reconnect_delay;
        let mut last_error = None;

        self.channel.set_state(ChannelState::Connecting);
        for attempt in 1..=attempts {
            *self.last_attempt.lock() = Some(Instant::now());

            match self.dial().await {
                Ok(stream) => {
                    self.channel.attach(stream)?;
                    global_metrics().channel_connected();
                    info!(attempt, "Connected");
                    return Ok(());
                }
                Err(e) => {
                    global_metrics().connect_failed();
                    warn!(attempt, attempts, error = %e, "Connect attempt failed");
                    last_error = Some(e);
                }
            }

            if attempt < attempts {
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
            }
        }

        self.channel.set_state(ChannelState::Idle);
        Err(ProtocolError::ConnectFailure(format!(
            "{} after {attempts} attempts: {}",
            self.address,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    async fn dial(&self) -> Result<TcpStream> {
        with_timeout_error(
            async {
                TcpStream::connect(&self.address)
                    .await
                    .map_err(|e| ProtocolError::ConnectFailure(e.to_string()))
            },
            self.config.connection_timeout,
        )
        .await
    }

    /// Run [`ClientChannel::connect`] on a spawned task
    pub fn connect_async(self: &Arc<Self>) -> JoinHandle<Result<()>> {
        let client = self.clone();
        tokio::spawn(async move { client.connect().await })
    }

    /// Make sure the channel can send, reconnecting when the cooldown allows.
    ///
    /// # Errors
    /// [`ProtocolError::NotConnected`] while down inside the cooldown window,
    /// or the connect error if the reconnect fails.
    pub async fn prepare_send(&self) -> Result<()> {
        if self.channel.is_active() {
            return Ok(());
        }

        let cooled_down = self
            .last_attempt
            .lock()
            .map_or(true, |at| at.elapsed() > self.config.connect_cooldown);
        if !cooled_down {
            debug!(channel_id = self.channel.id(), "Send refused during connect cooldown");
            return Err(ProtocolError::NotConnected(
                constants::ERR_CONNECT_COOLDOWN.into(),
            ));
        }

        self.connect().await
    }

    /// Send `payload`, connecting first if needed
    pub async fn send(&self, payload: Bytes) -> Result<u64> {
        self.prepare_send().await?;
        self.channel.send(payload).await
    }

    /// Liveness probe: writes a keep-alive and waits for the write to finish.
    /// Never errors; any failure or expiry reads as not connected.
    pub async fn is_connected(&self, timeout: Duration) -> bool {
        self.channel.is_active() && self.channel.probe(timeout).await
    }

    pub fn close(&self) -> bool {
        self.channel.close()
    }
}
