//! Edge cases: malformed peers, keep-alives on the wire, large messages
//! reassembled into a buffer store.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use packet_channel::config::NetworkConfig;
use packet_channel::core::{
    fixed_sizer, BufferStore, FileBufferStore, Frame, FrameHeader, Message, MessageBody,
    Packetizer,
};
use packet_channel::error::ProtocolError;
use packet_channel::transport::{Channel, ChannelHandler, ChannelManager, FramerFactory};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

#[derive(Debug)]
enum Event {
    Received(Message),
    Failed(String),
    Closed,
}

struct Recorder(mpsc::UnboundedSender<Event>);

impl ChannelHandler for Recorder {
    fn on_received(&self, _channel: &Arc<Channel>, message: Message) {
        let _ = self.0.send(Event::Received(message));
    }

    fn on_failed(&self, _channel: &Arc<Channel>, error: &ProtocolError) {
        let _ = self.0.send(Event::Failed(error.to_string()));
    }

    fn on_closed(&self, _channel: &Arc<Channel>) {
        let _ = self.0.send(Event::Closed);
    }
}

async fn manager_with(
    mutate: impl FnOnce(&mut NetworkConfig),
) -> (ChannelManager, mpsc::UnboundedReceiver<Event>) {
    let config = NetworkConfig::default_with_overrides(|cfg| {
        cfg.server.address = "127.0.0.1:0".to_string();
        mutate(cfg);
    });
    let manager = ChannelManager::bind(config).await.unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    manager.set_handler(Arc::new(Recorder(tx)));
    let _task = manager.start();
    (manager, rx)
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("event in time")
        .expect("handler alive")
}

#[tokio::test]
async fn test_oversized_header_fails_then_closes() {
    let (manager, mut events) = manager_with(|cfg| cfg.transport.max_message_size = 1024).await;
    let mut peer = TcpStream::connect(manager.local_addr()).await.unwrap();

    let header = FrameHeader {
        sequence_id: 1,
        total_length: 4096,
        content_length: 16,
    };
    peer.write_all(&header.to_bytes()).await.unwrap();

    match next_event(&mut events).await {
        Event::Failed(message) => assert!(message.contains("4096"), "{message}"),
        other => panic!("expected failure, got {other:?}"),
    }
    assert!(matches!(next_event(&mut events).await, Event::Closed));

    let mut buf = [0u8; 8];
    let read = tokio::time::timeout(Duration::from_secs(2), peer.read(&mut buf))
        .await
        .expect("server closes the socket");
    assert!(matches!(read, Ok(0) | Err(_)));
    manager.shutdown();
}

#[tokio::test]
async fn test_content_overrun_fails() {
    let (manager, mut events) = manager_with(|_| {}).await;
    let mut peer = TcpStream::connect(manager.local_addr()).await.unwrap();

    let header = FrameHeader {
        sequence_id: 9,
        total_length: 4,
        content_length: 8,
    };
    peer.write_all(&header.to_bytes()).await.unwrap();

    assert!(matches!(next_event(&mut events).await, Event::Failed(_)));
    assert!(matches!(next_event(&mut events).await, Event::Closed));
    manager.shutdown();
}

#[tokio::test]
async fn test_peer_close_mid_frame_is_orderly() {
    let (manager, mut events) = manager_with(|_| {}).await;
    let mut peer = TcpStream::connect(manager.local_addr()).await.unwrap();

    let frame = Frame {
        header: FrameHeader {
            sequence_id: 3,
            total_length: 100,
            content_length: 100,
        },
        content: Bytes::from(vec![5u8; 100]),
    };
    let bytes = frame.to_bytes();
    peer.write_all(&bytes[..50]).await.unwrap();
    drop(peer);

    assert!(matches!(next_event(&mut events).await, Event::Closed));
    manager.shutdown();
}

#[tokio::test]
async fn test_message_before_orderly_close_is_delivered() {
    let (manager, mut events) = manager_with(|_| {}).await;
    let packetizer = Packetizer::new();

    for round in 0..20u32 {
        let mut peer = TcpStream::connect(manager.local_addr()).await.unwrap();
        let payload = Bytes::from(format!("last words {round}"));
        let mut wire = Vec::new();
        for frame in packetizer.pack(payload.clone()) {
            wire.extend_from_slice(&frame.to_bytes());
        }
        peer.write_all(&wire).await.unwrap();
        peer.shutdown().await.unwrap();

        match next_event(&mut events).await {
            Event::Received(message) => assert_eq!(message.as_bytes(), Some(&payload)),
            other => panic!("round {round}: expected message, got {other:?}"),
        }
        assert!(matches!(next_event(&mut events).await, Event::Closed));
    }

    assert_eq!(manager.active_channel_count(), 0);
    manager.shutdown();
}

#[tokio::test]
async fn test_pending_message_limit_closes_flooding_peer() {
    let (manager, mut events) = manager_with(|cfg| cfg.transport.max_pending_messages = 4).await;
    let mut peer = TcpStream::connect(manager.local_addr()).await.unwrap();

    let mut wire = Vec::new();
    for sequence_id in 0..64u64 {
        let header = FrameHeader {
            sequence_id,
            total_length: 1024 * 1024,
            content_length: 1,
        };
        wire.extend_from_slice(&header.to_bytes());
        wire.push(1);
    }
    let _ = peer.write_all(&wire).await;

    match next_event(&mut events).await {
        Event::Failed(message) => assert!(message.contains("partially received"), "{message}"),
        other => panic!("expected failure, got {other:?}"),
    }
    assert!(matches!(next_event(&mut events).await, Event::Closed));
    manager.shutdown();
}

#[tokio::test]
async fn test_raw_frames_split_byte_by_byte() {
    let (manager, mut events) = manager_with(|_| {}).await;
    let mut peer = TcpStream::connect(manager.local_addr()).await.unwrap();
    peer.set_nodelay(true).unwrap();

    let packetizer = Packetizer::new().with_chunk_sizer(fixed_sizer(5));
    let mut wire = Frame::keep_alive(77).to_bytes().to_vec();
    for frame in packetizer.pack(Bytes::from_static(b"split into tiny frames")) {
        wire.extend_from_slice(&frame.to_bytes());
    }
    for byte in wire {
        peer.write_all(&[byte]).await.unwrap();
    }

    match next_event(&mut events).await {
        Event::Received(message) => {
            assert_eq!(message.as_bytes().unwrap().as_ref(), b"split into tiny frames");
        }
        other => panic!("expected message, got {other:?}"),
    }
    manager.shutdown();
}

#[tokio::test]
async fn test_large_message_goes_through_file_store() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn BufferStore> = Arc::new(FileBufferStore::new(dir.path()).unwrap());

    let (manager, mut events) = manager_with(|_| {}).await;
    let factory_store = store.clone();
    let factory: FramerFactory = Arc::new(move |_channel: &Channel| {
        Packetizer::new()
            .with_large_message_threshold(64 * 1024)
            .with_store(factory_store.clone())
    });
    manager.set_framer_factory(factory);

    let mut peer = TcpStream::connect(manager.local_addr()).await.unwrap();
    let data: Vec<u8> = (0..200_000u32).map(|i| (i % 253) as u8).collect();
    let small = Bytes::from_static(b"small stays inline");

    let sender = Packetizer::new();
    for payload in [Bytes::from(data.clone()), small.clone()] {
        for frame in sender.pack(payload) {
            peer.write_all(&frame.to_bytes()).await.unwrap();
        }
    }

    let stored = match next_event(&mut events).await {
        Event::Received(message) => message,
        other => panic!("expected message, got {other:?}"),
    };
    assert!(matches!(stored.body, MessageBody::Stored { len: 200_000, .. }));
    let loaded = stored.into_bytes(Some(store.as_ref())).unwrap();
    assert_eq!(loaded.as_ref(), &data[..]);

    match next_event(&mut events).await {
        Event::Received(message) => assert_eq!(message.as_bytes(), Some(&small)),
        other => panic!("expected message, got {other:?}"),
    }

    let leftover = std::fs::read_dir(dir.path()).unwrap().count();
    assert_eq!(leftover, 0, "read-back releases the stored buffer");
    manager.shutdown();
}

#[tokio::test]
async fn test_codec_with_framed() {
    use futures::{SinkExt, StreamExt};
    use packet_channel::core::PacketCodec;
    use tokio_util::codec::Framed;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    let received = Arc::new(Mutex::new(Vec::new()));

    let sink = received.clone();
    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut framed = Framed::new(stream, PacketCodec::default());
        while let Some(message) = framed.next().await {
            sink.lock().push(message.unwrap());
        }
    });

    let packetizer = Packetizer::new().with_chunk_sizer(fixed_sizer(3));
    let stream = TcpStream::connect(address).await.unwrap();
    let mut framed = Framed::new(stream, PacketCodec::new(&packetizer));
    for frame in packetizer.pack(Bytes::from_static(b"framed codec")) {
        framed.send(frame).await.unwrap();
    }
    framed.send(packetizer.keep_alive()).await.unwrap();
    drop(framed);

    server.await.unwrap();
    let received = received.lock();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].as_bytes().unwrap().as_ref(), b"framed codec");
}
