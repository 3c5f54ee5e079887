//! Registry and pool bookkeeping of the channel manager under churn.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::HashSet;
use std::time::Duration;

use packet_channel::config::NetworkConfig;
use packet_channel::transport::ChannelManager;
use tokio::net::TcpStream;

fn config(max_connections: usize) -> NetworkConfig {
    NetworkConfig::default_with_overrides(|cfg| {
        cfg.server.address = "127.0.0.1:0".to_string();
        cfg.server.max_connections = max_connections;
    })
}

async fn wait_for<F: Fn() -> bool>(what: &str, condition: F) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn test_accepts_minus_closes() {
    let manager = ChannelManager::bind(config(0)).await.unwrap();
    let _task = manager.start();

    let n = 12;
    let m = 5;
    let mut peers = Vec::new();
    for _ in 0..n {
        peers.push(TcpStream::connect(manager.local_addr()).await.unwrap());
    }
    wait_for("all accepts", || manager.active_channel_count() == n).await;

    let ids: HashSet<u64> = manager.active_channels().iter().map(|c| c.id()).collect();
    assert_eq!(ids.len(), n, "channel ids must be distinct");

    peers.truncate(n - m);
    wait_for("closes", || manager.active_channel_count() == n - m).await;
    wait_for("recycling", || manager.idle_channel_count() == m).await;

    for channel in manager.active_channels() {
        assert!(channel.is_active());
        assert!(manager.channel(channel.id()).is_some());
    }

    manager.shutdown();
    assert_eq!(manager.active_channel_count(), 0);
}

#[tokio::test]
async fn test_recycled_channels_keep_their_ids() {
    let manager = ChannelManager::bind(config(0)).await.unwrap();
    let _task = manager.start();

    let first = TcpStream::connect(manager.local_addr()).await.unwrap();
    wait_for("first accept", || manager.active_channel_count() == 1).await;
    let original = manager.active_channels()[0].clone();
    let generation = original.generation();

    drop(first);
    wait_for("recycle", || manager.idle_channel_count() == 1).await;

    let _second = TcpStream::connect(manager.local_addr()).await.unwrap();
    wait_for("second accept", || manager.active_channel_count() == 1).await;
    let reused = manager.active_channels()[0].clone();

    assert_eq!(reused.id(), original.id());
    assert_eq!(reused.generation(), generation + 1);
    manager.shutdown();
}

#[tokio::test]
async fn test_capacity_holds_back_accepts() {
    let manager = ChannelManager::bind(config(2)).await.unwrap();
    let _task = manager.start();

    let a = TcpStream::connect(manager.local_addr()).await.unwrap();
    let _b = TcpStream::connect(manager.local_addr()).await.unwrap();
    let _c = TcpStream::connect(manager.local_addr()).await.unwrap();

    wait_for("two accepts", || manager.active_channel_count() == 2).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(manager.active_channel_count(), 2, "third must wait for a slot");

    drop(a);
    wait_for("slot reuse", || {
        manager.active_channel_count() == 2 && manager.idle_channel_count() == 0
    })
    .await;
    let ids: HashSet<u64> = manager.active_channels().iter().map(|c| c.id()).collect();
    assert!(ids.iter().all(|id| *id <= 2));
    manager.shutdown();
}

#[tokio::test]
async fn test_shutdown_is_idempotent_and_stops_accepting() {
    let manager = ChannelManager::bind(config(0)).await.unwrap();
    let task = manager.start();

    let _peer = TcpStream::connect(manager.local_addr()).await.unwrap();
    wait_for("accept", || manager.active_channel_count() == 1).await;

    manager.shutdown();
    manager.shutdown();
    assert!(manager.is_shut_down());

    let result = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("accept loop stops")
        .unwrap();
    assert!(result.is_ok());
    assert_eq!(manager.active_channel_count(), 0);
    assert!(manager.serve().await.is_err());
}
