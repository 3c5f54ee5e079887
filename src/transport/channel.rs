//! # Channel
//!
//! One framed connection: a socket, the packetizer bound to it and the tasks
//! pumping bytes in both directions.
//!
//! A channel keeps its numeric id for its whole life. The socket is present
//! only between [`Channel::attach`] and [`Channel::close`]; an idle channel
//! refuses to send. Every attach starts a new *generation*, and teardown
//! requests from the tasks of an earlier generation are ignored, so a pooled
//! channel can be re-armed without a stale reader closing its new socket.
//!
//! ## Tasks
//! - **Reader**: sequential reads into the reassembler
//! - **Dispatcher**: hands complete messages to [`ChannelHandler::on_received`]
//!   in arrival order, off the reader. After an orderly close by the peer it
//!   drains what the reader queued before closing the channel, so
//!   `on_closed` always follows the last `on_received`.
//! - **Writer**: drains the bounded write queue one frame at a time
//!
//! ## Send Completion
//! Each logical send is tracked by sequence id. The submitter counts frames as
//! it queues them and seals the tracker when done; the writer counts frames as
//! they hit the socket. Whichever side observes `sealed && queued == written`
//! first removes the tracker from the table, and only the remover raises
//! [`ChannelHandler::on_sent`].

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::{ClientConfig, TransportConfig};
use crate::core::message::Message;
use crate::core::packet::Frame;
use crate::core::packetizer::{next_sequence_id, Packetizer};
use crate::error::{constants, is_transient_io, ProtocolError, Result};
use crate::utils::buffer_pool::DescriptorPool;
use crate::utils::metrics::global_metrics;

/// Event sink for a channel. Every method has an empty default.
///
/// Callbacks run on the channel's own tasks and should not block.
pub trait ChannelHandler: Send + Sync + 'static {
    /// The channel was accepted by a manager and is ready to use
    fn on_accepted(&self, _channel: &Arc<Channel>) {}

    /// A complete message arrived
    fn on_received(&self, _channel: &Arc<Channel>, _message: Message) {}

    /// Every frame of the send with this sequence id was written
    fn on_sent(&self, _channel: &Arc<Channel>, _sequence_id: u64) {}

    /// A transport error occurred; the channel closes right after
    fn on_failed(&self, _channel: &Arc<Channel>, _error: &ProtocolError) {}

    /// The channel closed. Raised once per connection.
    fn on_closed(&self, _channel: &Arc<Channel>) {}
}

/// Lifecycle state of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelState {
    Idle = 0,
    Connecting = 1,
    Active = 2,
    Closed = 3,
}

impl ChannelState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ChannelState::Connecting,
            2 => ChannelState::Active,
            3 => ChannelState::Closed,
            _ => ChannelState::Idle,
        }
    }
}

/// Per-channel tuning taken from configuration
#[derive(Debug, Clone)]
pub struct ChannelSettings {
    /// Frames the write queue holds before senders wait
    pub send_queue_depth: usize,
    pub read_buffer_size: usize,
    /// Send-idle time before a keep-alive frame is written; zero disables
    pub heartbeat_interval: Duration,
}

impl ChannelSettings {
    /// Settings for accepted channels, which do not send keep-alives
    pub fn from_transport(transport: &TransportConfig) -> Self {
        Self {
            send_queue_depth: transport.send_queue_depth.max(1),
            read_buffer_size: transport.read_buffer_size.max(1),
            heartbeat_interval: Duration::ZERO,
        }
    }

    /// Settings for client channels
    pub fn for_client(transport: &TransportConfig, client: &ClientConfig) -> Self {
        Self::from_transport(transport).with_heartbeat(client.heartbeat_interval)
    }

    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_send_queue_depth(mut self, depth: usize) -> Self {
        self.send_queue_depth = depth.max(1);
        self
    }
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self::from_transport(&TransportConfig::default())
    }
}

/// Outbound send descriptor
#[derive(Debug)]
struct SendTracker {
    sequence_id: u64,
    payload_len: u64,
    queued: AtomicU32,
    written: AtomicU32,
    sealed: AtomicBool,
}

impl SendTracker {
    fn new(sequence_id: u64, payload_len: u64) -> Self {
        Self {
            sequence_id,
            payload_len,
            queued: AtomicU32::new(0),
            written: AtomicU32::new(0),
            sealed: AtomicBool::new(false),
        }
    }

    fn is_complete(&self) -> bool {
        self.sealed.load(Ordering::SeqCst)
            && self.queued.load(Ordering::SeqCst) == self.written.load(Ordering::SeqCst)
    }
}

enum WriteRequest {
    Frame {
        frame: Frame,
        tracker: Arc<SendTracker>,
    },
    KeepAlive,
    /// Keep-alive whose write completion is reported back
    Probe(oneshot::Sender<()>),
}

/// Socket-bound state of one generation
struct ChannelIo {
    generation: u64,
    writes: mpsc::Sender<WriteRequest>,
    cancel: CancellationToken,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
}

/// A framed, bidirectional connection
pub struct Channel {
    id: u64,
    state: AtomicU8,
    generation: AtomicU64,
    settings: ChannelSettings,
    packetizer: RwLock<Option<Packetizer>>,
    handler: RwLock<Option<Arc<dyn ChannelHandler>>>,
    io: Mutex<Option<ChannelIo>>,
    pending: DashMap<u64, Arc<SendTracker>>,
    last_send: Mutex<Option<Instant>>,
    last_receive: Mutex<Option<Instant>>,
    descriptors: DescriptorPool,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("generation", &self.generation())
            .field("pending_sends", &self.pending.len())
            .finish()
    }
}

impl Channel {
    pub fn new(id: u64, settings: ChannelSettings, descriptors: DescriptorPool) -> Self {
        Self {
            id,
            state: AtomicU8::new(ChannelState::Idle as u8),
            generation: AtomicU64::new(0),
            settings,
            packetizer: RwLock::new(None),
            handler: RwLock::new(None),
            io: Mutex::new(None),
            pending: DashMap::new(),
            last_send: Mutex::new(None),
            last_receive: Mutex::new(None),
            descriptors,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: ChannelState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// True while a socket is attached
    pub fn is_active(&self) -> bool {
        self.io.lock().is_some()
    }

    /// Number of times a socket has been attached
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn settings(&self) -> &ChannelSettings {
        &self.settings
    }

    pub fn packetizer(&self) -> Option<Packetizer> {
        self.packetizer.read().clone()
    }

    pub fn has_packetizer(&self) -> bool {
        self.packetizer.read().is_some()
    }

    /// Bind the framing used from the next attach on
    pub fn set_packetizer(&self, packetizer: Packetizer) {
        *self.packetizer.write() = Some(packetizer);
    }

    pub fn handler(&self) -> Option<Arc<dyn ChannelHandler>> {
        self.handler.read().clone()
    }

    pub fn set_handler(&self, handler: Arc<dyn ChannelHandler>) {
        *self.handler.write() = Some(handler);
    }

    pub fn clear_handler(&self) {
        *self.handler.write() = None;
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.io.lock().as_ref().and_then(|io| io.local_addr)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.io.lock().as_ref().and_then(|io| io.peer_addr)
    }

    pub fn last_send(&self) -> Option<Instant> {
        *self.last_send.lock()
    }

    pub fn last_receive(&self) -> Option<Instant> {
        *self.last_receive.lock()
    }

    /// Logical sends queued but not yet completed
    pub fn pending_sends(&self) -> usize {
        self.pending.len()
    }

    /// Frames the write queue can take right now, 0 when idle
    pub fn send_capacity(&self) -> usize {
        self.io
            .lock()
            .as_ref()
            .map(|io| io.writes.capacity())
            .unwrap_or(0)
    }

    /// Take ownership of a connected socket and start the reader, writer
    /// and dispatcher for a new generation.
    ///
    /// # Errors
    /// Fails if the channel already has a socket attached.
    #[instrument(skip(self, stream), fields(channel_id = self.id))]
    pub fn attach(self: &Arc<Self>, stream: TcpStream) -> Result<()> {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }
        let local_addr = stream.local_addr().ok();
        let peer_addr = stream.peer_addr().ok();
        let (reader, writer) = stream.into_split();

        let (write_tx, write_rx) = mpsc::channel(self.settings.send_queue_depth.max(1));
        let (deliver_tx, deliver_rx) = mpsc::channel(self.settings.send_queue_depth.max(1));
        let cancel = CancellationToken::new();

        let generation = {
            let mut slot = self.io.lock();
            if slot.is_some() {
                return Err(ProtocolError::Custom(format!(
                    "Channel {} already has a socket attached",
                    self.id
                )));
            }
            let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
            // Sends abandoned mid-submission by an earlier generation
            self.pending.clear();
            *slot = Some(ChannelIo {
                generation,
                writes: write_tx,
                cancel: cancel.clone(),
                local_addr,
                peer_addr,
            });
            generation
        };

        let now = Instant::now();
        *self.last_send.lock() = Some(now);
        *self.last_receive.lock() = Some(now);
        self.set_state(ChannelState::Active);

        let packetizer = self.packetizer().unwrap_or_default();
        info!(
            generation,
            peer = ?peer_addr,
            "Channel attached"
        );

        tokio::spawn(self.clone().read_loop(
            generation,
            reader,
            packetizer,
            deliver_tx,
            cancel.clone(),
        ));
        tokio::spawn(self.clone().dispatch_loop(generation, deliver_rx));
        tokio::spawn(self.clone().write_loop(generation, writer, write_rx, cancel));
        Ok(())
    }

    fn writer(&self) -> Result<(u64, mpsc::Sender<WriteRequest>)> {
        self.io
            .lock()
            .as_ref()
            .map(|io| (io.generation, io.writes.clone()))
            .ok_or_else(|| ProtocolError::NotConnected(constants::ERR_NOT_CONNECTED.into()))
    }

    /// Register a tracker for `generation`. A close that already cleared the
    /// table for that generation makes this fail instead of leaving it behind.
    fn track(&self, generation: u64, tracker: &Arc<SendTracker>) -> Result<()> {
        self.pending.insert(tracker.sequence_id, tracker.clone());
        let current = self
            .io
            .lock()
            .as_ref()
            .is_some_and(|io| io.generation == generation);
        if current {
            Ok(())
        } else {
            self.pending.remove(&tracker.sequence_id);
            Err(ProtocolError::NotConnected(constants::ERR_NOT_CONNECTED.into()))
        }
    }

    /// Frame and queue `payload`, waiting while the write queue is full.
    ///
    /// Returns the sequence id that [`ChannelHandler::on_sent`] will report.
    /// An empty payload is sent as a single header-only frame and still
    /// completes.
    ///
    /// # Errors
    /// [`ProtocolError::NotConnected`] on an idle or closed channel and
    /// [`ProtocolError::SendFailure`] if the channel closes mid-submission.
    #[instrument(skip(self, payload), fields(channel_id = self.id, len = payload.len()))]
    pub async fn send(self: &Arc<Self>, payload: Bytes) -> Result<u64> {
        let (generation, writes) = self.writer()?;
        let frames = self.packetizer().unwrap_or_default().pack(payload);
        let tracker = Arc::new(SendTracker::new(frames.sequence_id(), frames.total_length()));
        self.track(generation, &tracker)?;

        for frame in frames {
            tracker.queued.fetch_add(1, Ordering::SeqCst);
            let request = WriteRequest::Frame {
                frame,
                tracker: tracker.clone(),
            };
            if writes.send(request).await.is_err() {
                self.pending.remove(&tracker.sequence_id);
                global_metrics().send_failed();
                return Err(ProtocolError::SendFailure(constants::ERR_WRITER_GONE.into()));
            }
        }

        Ok(self.seal(&tracker))
    }

    /// Queue `payload` only if the write queue can take all of its frames now.
    ///
    /// # Errors
    /// [`ProtocolError::Backpressure`] when the queue is too full, in addition
    /// to the errors of [`Channel::send`]. A payload needing more frames than
    /// the queue depth can never be queued this way and fails with
    /// [`ProtocolError::SendFailure`].
    pub fn try_send(self: &Arc<Self>, payload: Bytes) -> Result<u64> {
        let (generation, writes) = self.writer()?;
        let frames = self.packetizer().unwrap_or_default().pack(payload);
        let count = frames.len();
        if count > writes.max_capacity() {
            return Err(ProtocolError::SendFailure(format!(
                "payload needs {count} frames, write queue holds {}",
                writes.max_capacity()
            )));
        }

        let permits = match writes.try_reserve_many(count) {
            Ok(permits) => permits,
            Err(mpsc::error::TrySendError::Full(())) => {
                global_metrics().backpressure();
                trace!(channel_id = self.id, frames = count, "Write queue full");
                return Err(ProtocolError::Backpressure);
            }
            Err(mpsc::error::TrySendError::Closed(())) => {
                return Err(ProtocolError::SendFailure(constants::ERR_WRITER_GONE.into()));
            }
        };

        let tracker = Arc::new(SendTracker::new(frames.sequence_id(), frames.total_length()));
        self.track(generation, &tracker)?;
        for (permit, frame) in permits.zip(frames) {
            tracker.queued.fetch_add(1, Ordering::SeqCst);
            permit.send(WriteRequest::Frame {
                frame,
                tracker: tracker.clone(),
            });
        }

        Ok(self.seal(&tracker))
    }

    fn seal(self: &Arc<Self>, tracker: &SendTracker) -> u64 {
        tracker.sealed.store(true, Ordering::SeqCst);
        self.try_complete(tracker.sequence_id);
        tracker.sequence_id
    }

    fn try_complete(self: &Arc<Self>, sequence_id: u64) {
        let Some((_, tracker)) = self
            .pending
            .remove_if(&sequence_id, |_, tracker| tracker.is_complete())
        else {
            return;
        };

        global_metrics().message_sent(tracker.payload_len);
        trace!(channel_id = self.id, sequence_id, "Send completed");
        if let Some(handler) = self.handler() {
            handler.on_sent(self, sequence_id);
        }
    }

    /// Write a keep-alive and wait for it to reach the socket.
    ///
    /// Returns false on an idle channel, a full queue that does not drain in
    /// time, or a write that does not finish within `timeout`.
    pub async fn probe(&self, timeout: Duration) -> bool {
        let Ok((_, writes)) = self.writer() else {
            return false;
        };
        let (done_tx, done_rx) = oneshot::channel();

        let written = async move {
            writes.send(WriteRequest::Probe(done_tx)).await.ok()?;
            done_rx.await.ok()
        };
        matches!(tokio::time::timeout(timeout, written).await, Ok(Some(())))
    }

    /// Close the current connection. Safe to call repeatedly and concurrently;
    /// only the first call for a connection raises `on_closed`.
    ///
    /// Returns whether this call performed the close.
    pub fn close(self: &Arc<Self>) -> bool {
        let io = self.io.lock().take();
        self.finish_close(io)
    }

    /// Close only if `generation` is still the attached one
    pub(crate) fn close_generation(self: &Arc<Self>, generation: u64) -> bool {
        let io = {
            let mut slot = self.io.lock();
            match slot.as_ref() {
                Some(io) if io.generation == generation => slot.take(),
                _ => None,
            }
        };
        self.finish_close(io)
    }

    fn finish_close(self: &Arc<Self>, io: Option<ChannelIo>) -> bool {
        let Some(io) = io else {
            return false;
        };

        io.cancel.cancel();
        self.set_state(ChannelState::Closed);
        let abandoned = self.pending.len();
        self.pending.clear();
        global_metrics().channel_closed();

        info!(
            channel_id = self.id,
            generation = io.generation,
            peer = ?io.peer_addr,
            abandoned_sends = abandoned,
            "Channel closed"
        );

        if let Some(handler) = self.handler() {
            handler.on_closed(self);
        }
        true
    }

    fn fail(self: &Arc<Self>, generation: u64, error: ProtocolError) {
        let current = self
            .io
            .lock()
            .as_ref()
            .is_some_and(|io| io.generation == generation);
        if !current {
            return;
        }

        warn!(channel_id = self.id, generation, error = %error, "Channel failed");
        if let Some(handler) = self.handler() {
            handler.on_failed(self, &error);
        }
        self.close_generation(generation);
    }

    async fn read_loop(
        self: Arc<Self>,
        generation: u64,
        mut reader: OwnedReadHalf,
        packetizer: Packetizer,
        deliver: mpsc::Sender<Message>,
        cancel: CancellationToken,
    ) {
        let read_size = self.settings.read_buffer_size;
        let mut reassembler = packetizer.reassembler();
        let mut buffer = BytesMut::with_capacity(read_size);
        let mut complete = Vec::new();

        loop {
            buffer.clear();
            buffer.reserve(read_size);

            let read = tokio::select! {
                _ = cancel.cancelled() => break,
                read = reader.read_buf(&mut buffer) => read,
            };

            match read {
                Ok(0) => {
                    // The dispatcher closes once the queued messages are delivered
                    debug!(channel_id = self.id, "Peer closed the connection");
                    break;
                }
                Ok(n) => {
                    *self.last_receive.lock() = Some(Instant::now());
                    trace!(channel_id = self.id, bytes = n, "Read");

                    if let Err(e) = reassembler.feed(&buffer[..n], &mut complete) {
                        global_metrics().receive_failed();
                        self.fail(generation, e);
                        break;
                    }

                    for message in complete.drain(..) {
                        global_metrics().message_received(message.len());
                        if deliver.send(message).await.is_err() {
                            return;
                        }
                    }
                }
                Err(e) if is_transient_io(&e) => continue,
                Err(e) => {
                    global_metrics().receive_failed();
                    self.fail(generation, ProtocolError::ReceiveFailure(e.to_string()));
                    break;
                }
            }
        }
    }

    async fn dispatch_loop(self: Arc<Self>, generation: u64, mut messages: mpsc::Receiver<Message>) {
        while let Some(message) = messages.recv().await {
            if self.generation() != generation {
                return;
            }
            if let Some(handler) = self.handler() {
                handler.on_received(&self, message);
            }
        }
        // Reader gone: either the peer closed or the channel is already down
        self.close_generation(generation);
    }

    async fn write_loop(
        self: Arc<Self>,
        generation: u64,
        mut writer: OwnedWriteHalf,
        mut requests: mpsc::Receiver<WriteRequest>,
        cancel: CancellationToken,
    ) {
        let heartbeat = self.settings.heartbeat_interval;

        loop {
            let request = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                request = next_request(&mut requests, heartbeat) => request,
            };
            let Some(request) = request else {
                break;
            };

            let written = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                written = self.write_request(&mut writer, request) => written,
            };
            if let Err(e) = written {
                global_metrics().send_failed();
                self.fail(generation, e);
                break;
            }
        }

        if let Err(e) = writer.shutdown().await {
            trace!(channel_id = self.id, error = %e, "Socket shutdown failed");
        }
    }

    async fn write_request(
        self: &Arc<Self>,
        writer: &mut OwnedWriteHalf,
        request: WriteRequest,
    ) -> Result<()> {
        let (frame, tracker, probe) = match request {
            WriteRequest::Frame { frame, tracker } => (frame, Some(tracker), None),
            WriteRequest::KeepAlive => (Frame::keep_alive(next_sequence_id()), None, None),
            WriteRequest::Probe(done) => (Frame::keep_alive(next_sequence_id()), None, Some(done)),
        };

        let mut descriptor = self.descriptors.acquire().await?;
        descriptor.bind(frame.header.sequence_id);
        frame.encode_into(&mut descriptor.buffer);

        if let Err(e) = writer.write_all(&descriptor.buffer).await {
            if let Some(tracker) = &tracker {
                self.pending.remove(&tracker.sequence_id);
            }
            return Err(ProtocolError::SendFailure(e.to_string()));
        }
        drop(descriptor);

        *self.last_send.lock() = Some(Instant::now());
        global_metrics().frame_written();

        match (tracker, probe) {
            (Some(tracker), _) => {
                tracker.written.fetch_add(1, Ordering::SeqCst);
                self.try_complete(tracker.sequence_id);
            }
            (None, Some(done)) => {
                global_metrics().keepalive_sent();
                let _ = done.send(());
            }
            (None, None) => {
                global_metrics().keepalive_sent();
                trace!(channel_id = self.id, "Keep-alive written");
            }
        }
        Ok(())
    }
}

async fn next_request(
    requests: &mut mpsc::Receiver<WriteRequest>,
    heartbeat: Duration,
) -> Option<WriteRequest> {
    if heartbeat.is_zero() {
        return requests.recv().await;
    }
    match tokio::time::timeout(heartbeat, requests.recv()).await {
        Ok(request) => request,
        Err(_) => Some(WriteRequest::KeepAlive),
    }
}
