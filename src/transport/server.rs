//! # Channel Manager
//!
//! Server side of the protocol: accepts connections, arms pooled channels
//! for them and recycles each channel when it closes.
//!
//! ## Lifecycle
//! 1. [`ChannelManager::bind`] opens the listener
//! 2. [`ChannelManager::serve`] (or [`ChannelManager::start`]) runs the accept
//!    loop, one accept at a time
//! 3. Every accepted socket gets a channel from the pool. A new channel takes
//!    the next ascending id; a recycled one keeps its id.
//! 4. When the channel closes it leaves the registry and returns to the pool
//! 5. [`ChannelManager::shutdown`] stops accepting, closes every active
//!    channel and disposes the pools. [`ChannelManager::shutdown_graceful`]
//!    first gives queued sends up to `server.shutdown_timeout` to drain.
//!
//! The pool capacity is `max_connections`. At capacity the accept loop waits
//! for a channel to be released before taking the next connection.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::NetworkConfig;
use crate::core::message::Message;
use crate::core::packetizer::Packetizer;
use crate::error::{ProtocolError, Result};
use crate::transport::channel::{Channel, ChannelHandler, ChannelSettings, ChannelState};
use crate::utils::buffer_pool::DescriptorPool;
use crate::utils::metrics::global_metrics;
use crate::utils::pool::ObjectPool;
use crate::utils::timeout::with_timeout;

/// Builds the packetizer bound to a channel the first time it is armed
pub type FramerFactory = Arc<dyn Fn(&Channel) -> Packetizer + Send + Sync>;

/// Accept backoff gives up once the delay would exceed this many seconds
const MAX_ACCEPT_BACKOFF_SECS: u64 = 64;

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Accepts connections and owns the channels serving them
#[derive(Clone)]
pub struct ChannelManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    config: NetworkConfig,
    local_addr: SocketAddr,
    listener: Mutex<Option<Arc<TcpListener>>>,
    pool: ObjectPool<Arc<Channel>>,
    registry: DashMap<u64, Arc<Channel>>,
    framer_factory: RwLock<FramerFactory>,
    handler: RwLock<Option<Arc<dyn ChannelHandler>>>,
    descriptors: DescriptorPool,
    shutdown: CancellationToken,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for ChannelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelManager")
            .field("local_addr", &self.inner.local_addr)
            .field("active_channels", &self.inner.registry.len())
            .field("pool", &self.inner.pool)
            .finish()
    }
}

/// Handler installed on every managed channel. Forwards to the user handler
/// and recycles the channel on close.
struct ManagedHandler {
    manager: Weak<ManagerInner>,
    user: Option<Arc<dyn ChannelHandler>>,
}

impl ChannelHandler for ManagedHandler {
    fn on_accepted(&self, channel: &Arc<Channel>) {
        if let Some(user) = &self.user {
            user.on_accepted(channel);
        }
    }

    fn on_received(&self, channel: &Arc<Channel>, message: Message) {
        if let Some(user) = &self.user {
            user.on_received(channel, message);
        }
    }

    fn on_sent(&self, channel: &Arc<Channel>, sequence_id: u64) {
        if let Some(user) = &self.user {
            user.on_sent(channel, sequence_id);
        }
    }

    fn on_failed(&self, channel: &Arc<Channel>, error: &ProtocolError) {
        if let Some(user) = &self.user {
            user.on_failed(channel, error);
        }
    }

    fn on_closed(&self, channel: &Arc<Channel>) {
        let manager = self.manager.upgrade();
        if let Some(manager) = &manager {
            manager.registry.remove(&channel.id());
        }
        if let Some(user) = &self.user {
            user.on_closed(channel);
        }
        if let Some(manager) = manager {
            manager.recycle(channel.clone());
        }
    }
}

impl ChannelManager {
    /// Bind the listener at `config.server.address`
    #[instrument(skip(config), fields(address = %config.server.address))]
    pub async fn bind(config: NetworkConfig) -> Result<Self> {
        let listener = TcpListener::bind(&config.server.address).await?;
        Self::from_listener(listener, config)
    }

    /// Manage connections accepted from an already bound listener
    pub fn from_listener(listener: TcpListener, config: NetworkConfig) -> Result<Self> {
        let local_addr = listener.local_addr()?;
        let descriptors = DescriptorPool::new(config.transport.write_descriptor_capacity);
        let settings = ChannelSettings::from_transport(&config.transport);

        let next_id = AtomicU64::new(1);
        let factory_descriptors = descriptors.clone();
        let pool = ObjectPool::new(config.server.max_connections, move || {
            let id = next_id.fetch_add(1, Ordering::Relaxed);
            trace!(channel_id = id, "Creating channel");
            Arc::new(Channel::new(id, settings.clone(), factory_descriptors.clone()))
        })
        .with_take_in(|channel: &mut Arc<Channel>| {
            channel.clear_handler();
            channel.set_state(ChannelState::Idle);
        })
        .with_remove(|channel: Arc<Channel>| {
            debug!(channel_id = channel.id(), "Dropping pooled channel");
        });

        let transport = config.transport.clone();
        let default_factory: FramerFactory =
            Arc::new(move |_channel: &Channel| Packetizer::from_config(&transport));

        info!(address = %local_addr, max_connections = config.server.max_connections, "Listening");

        Ok(Self {
            inner: Arc::new(ManagerInner {
                config,
                local_addr,
                listener: Mutex::new(Some(Arc::new(listener))),
                pool,
                registry: DashMap::new(),
                framer_factory: RwLock::new(default_factory),
                handler: RwLock::new(None),
                descriptors,
                shutdown: CancellationToken::new(),
                shut_down: AtomicBool::new(false),
            }),
        })
    }

    /// Replace the packetizer factory used for channels without one
    pub fn set_framer_factory(&self, factory: FramerFactory) {
        *self.inner.framer_factory.write() = factory;
    }

    /// Receive the events of every channel accepted from now on
    pub fn set_handler(&self, handler: Arc<dyn ChannelHandler>) {
        *self.inner.handler.write() = Some(handler);
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.inner.config
    }

    /// Run the accept loop on a spawned task
    pub fn start(&self) -> JoinHandle<Result<()>> {
        let manager = self.clone();
        tokio::spawn(async move { manager.serve().await })
    }

    /// Accept connections until [`ChannelManager::shutdown`] is called.
    ///
    /// # Errors
    /// Fails if the accept loop is started after shutdown, or if accepting keeps
    /// failing past the maximum backoff.
    #[instrument(skip(self), fields(address = %self.inner.local_addr))]
    pub async fn serve(&self) -> Result<()> {
        let listener = self
            .inner
            .listener
            .lock()
            .clone()
            .ok_or(ProtocolError::ConnectionClosed)?;

        let sweeper = self.spawn_idle_sweep();
        let result = self.accept_loop(&listener).await;
        if let Some(sweeper) = sweeper {
            sweeper.abort();
        }
        result
    }

    async fn accept_loop(&self, listener: &TcpListener) -> Result<()> {
        let shutdown = self.inner.shutdown.clone();

        loop {
            let stream = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Accept loop stopped");
                    return Ok(());
                }
                accepted = accept(listener) => match accepted {
                    Ok(stream) => stream,
                    Err(e) => {
                        error!(error = %e, "Giving up on accepting connections");
                        return Err(e);
                    }
                },
            };

            let channel = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                channel = self.inner.pool.get() => channel,
            };
            let channel = match channel {
                Ok(channel) => channel,
                Err(ProtocolError::PoolDisposed) => return Ok(()),
                Err(e) => return Err(e),
            };

            if let Err(e) = self.arm(&channel, stream) {
                warn!(channel_id = channel.id(), error = %e, "Failed to arm accepted channel");
                self.inner.registry.remove(&channel.id());
                self.inner.recycle(channel);
            }
        }
    }

    fn arm(&self, channel: &Arc<Channel>, stream: TcpStream) -> Result<()> {
        if !channel.has_packetizer() {
            let factory = self.inner.framer_factory.read().clone();
            channel.set_packetizer(factory(channel));
        }

        let user = self.inner.handler.read().clone();
        channel.set_handler(Arc::new(ManagedHandler {
            manager: Arc::downgrade(&self.inner),
            user,
        }));
        self.inner.registry.insert(channel.id(), channel.clone());

        channel.attach(stream)?;
        global_metrics().channel_accepted();
        debug!(channel_id = channel.id(), peer = ?channel.peer_addr(), "Channel accepted");

        if let Some(handler) = channel.handler() {
            handler.on_accepted(channel);
        }
        Ok(())
    }

    fn spawn_idle_sweep(&self) -> Option<JoinHandle<()>> {
        let idle_timeout = self.inner.config.server.idle_timeout;
        if idle_timeout.is_zero() {
            return None;
        }

        let inner = Arc::downgrade(&self.inner);
        let shutdown = self.inner.shutdown.clone();
        let period = (idle_timeout / 2).max(Duration::from_millis(10));

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                inner.close_idle(idle_timeout);
            }
        }))
    }

    /// Channels currently connected
    pub fn active_channel_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Snapshot of the connected channels
    pub fn active_channels(&self) -> Vec<Arc<Channel>> {
        self.inner
            .registry
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn channel(&self, id: u64) -> Option<Arc<Channel>> {
        self.inner.registry.get(&id).map(|entry| entry.value().clone())
    }

    /// Closed channels waiting in the pool for reuse
    pub fn idle_channel_count(&self) -> usize {
        self.inner.pool.idle_count()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }

    /// Stop accepting, wait up to `server.shutdown_timeout` for every active
    /// channel to finish its queued sends, then [`ChannelManager::shutdown`].
    ///
    /// Returns false when sends were still pending at the deadline.
    pub async fn shutdown_graceful(&self) -> bool {
        self.inner.shutdown.cancel();

        let timeout = self.inner.config.server.shutdown_timeout;
        let drained = with_timeout(
            async {
                while self
                    .inner
                    .registry
                    .iter()
                    .any(|entry| entry.value().pending_sends() > 0)
                {
                    tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
                }
            },
            timeout,
        )
        .await
        .is_some();

        if !drained {
            warn!(timeout_ms = timeout.as_millis() as u64, "Shutdown deadline passed with sends pending");
        }
        self.shutdown();
        drained
    }

    /// Stop accepting, close every active channel and dispose the pools.
    /// Later calls do nothing.
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        let listener = self.inner.listener.lock().take();
        self.inner.shutdown.cancel();

        let channels = self.active_channels();
        info!(active = channels.len(), "Shutting down channel manager");
        for channel in channels {
            channel.close();
        }

        self.inner.pool.dispose();
        self.inner.descriptors.dispose();
        drop(listener);
        global_metrics().log_metrics();
    }
}

impl ManagerInner {
    fn recycle(&self, channel: Arc<Channel>) {
        let id = channel.id();
        match self.pool.release(channel) {
            Ok(()) => trace!(channel_id = id, "Channel returned to pool"),
            Err(e) => debug!(channel_id = id, error = %e, "Channel not recycled"),
        }
    }

    fn close_idle(&self, idle_timeout: Duration) {
        let idle: Vec<Arc<Channel>> = self
            .registry
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .last_receive()
                    .is_some_and(|at| at.elapsed() > idle_timeout)
            })
            .map(|entry| entry.value().clone())
            .collect();

        for channel in idle {
            info!(channel_id = channel.id(), "Closing idle channel");
            channel.close();
        }
    }
}

/// Accept one connection, backing off exponentially on errors
async fn accept(listener: &TcpListener) -> Result<TcpStream> {
    let mut backoff = 1;

    loop {
        match listener.accept().await {
            Ok((stream, _)) => return Ok(stream),
            Err(e) => {
                if backoff > MAX_ACCEPT_BACKOFF_SECS {
                    return Err(ProtocolError::Io(e));
                }
                warn!(error = %e, backoff_secs = backoff, "Accept failed");
            }
        }

        tokio::time::sleep(Duration::from_secs(backoff)).await;
        backoff *= 2;
    }
}
