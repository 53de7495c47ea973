//! Resilience tests
//!
//! Concurrency edge cases: racing closes, revocations racing registrations,
//! slow subscribers and connection churn.

use futures::{SinkExt, StreamExt};
use keyhub::auth::{KeyDigest, KeyId, KeyStore};
use keyhub::config::{HubConfig, ServerConfig};
use keyhub::server::{base_router, CloseReason, Hub, HubError, KeyhubServer};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

fn hub_for(store: &Arc<KeyStore>) -> Arc<Hub> {
    let router = Arc::new(base_router().unwrap());
    Arc::new(Hub::new(HubConfig::default(), store.clone(), router))
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_issuance_yields_distinct_keys() {
    let store = Arc::new(KeyStore::in_memory());

    let handles: Vec<_> = (0..100)
        .map(|i| {
            let store = store.clone();
            tokio::spawn(async move { store.issue(&format!("svc-{}", i)).await.unwrap() })
        })
        .collect();

    let mut ids = HashSet::new();
    let mut digests = HashSet::new();
    for handle in handles {
        let issued = handle.await.unwrap();
        ids.insert(issued.id);
        digests.insert(KeyDigest::of(&issued.key).encode());
    }

    assert_eq!(ids.len(), 100);
    assert_eq!(digests.len(), 100);
    assert_eq!(store.list().await.unwrap().len(), 100);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_closes_close_exactly_once() {
    let store = Arc::new(KeyStore::in_memory());
    let hub = hub_for(&store);

    for _ in 0..50 {
        let key = KeyId::new();
        let (conn, _rx) = hub.open(Some(key), hub.begin_upgrade()).unwrap();

        let by_reader = {
            let (hub, conn) = (hub.clone(), conn.clone());
            tokio::spawn(async move {
                usize::from(hub.close(&conn, CloseReason::Transport("reset".to_string())))
            })
        };
        let by_revocation = {
            let hub = hub.clone();
            tokio::spawn(async move { hub.revoke(key) })
        };

        let closed = by_reader.await.unwrap() + by_revocation.await.unwrap();
        assert_eq!(closed, 1);
        assert!(conn.is_closing());
        assert_eq!(hub.connections().count_for_key(&key), 0);
    }

    assert_eq!(hub.connection_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_revocation_racing_registration_never_leaks() {
    let store = Arc::new(KeyStore::in_memory());
    let hub = hub_for(&store);

    for _ in 0..100 {
        let key = KeyId::new();

        // The upgrade has authenticated; registration and revocation now race
        let ticket = hub.begin_upgrade();
        let opener = {
            let hub = hub.clone();
            tokio::spawn(async move { hub.open(Some(key), ticket).map(|(conn, _rx)| conn) })
        };
        let revoker = {
            let hub = hub.clone();
            tokio::spawn(async move { hub.revoke(key) })
        };

        let opened = opener.await.unwrap();
        revoker.await.unwrap();

        // Either registration saw the tombstone, or revocation saw the connection
        match opened {
            Ok(conn) => assert!(conn.is_closing()),
            Err(e) => assert!(matches!(e, HubError::Revoked(_))),
        }
        assert_eq!(hub.connections().count_for_key(&key), 0);
    }

    assert_eq!(hub.connection_count(), 0);
    assert_eq!(hub.connections().tombstone_count(), 0);
}

#[tokio::test]
async fn test_revoked_secret_fails_authentication() {
    let store = Arc::new(KeyStore::in_memory());
    let hub = hub_for(&store);
    let issued = store.issue("svc1").await.unwrap();

    assert!(hub.authenticate(Some(&issued.key)).await.is_ok());
    store.revoke(&issued.id.to_string()).await.unwrap();

    for _ in 0..10 {
        assert!(matches!(
            hub.authenticate(Some(&issued.key)).await,
            Err(HubError::Unauthorized)
        ));
    }
}

#[tokio::test]
async fn test_idle_lossy_subscriber_never_blocks_revoker() {
    let store = Arc::new(KeyStore::in_memory());
    let (_idle, _idle_guard) = store.subscribe();
    let (mut reliable, _reliable_guard) = store.subscribe_reliable();

    let mut issued = Vec::new();
    for i in 0..50 {
        issued.push(store.issue(&format!("svc-{}", i)).await.unwrap());
    }

    timeout(Duration::from_secs(1), async {
        for key in &issued {
            store.revoke(&key.id.to_string()).await.unwrap();
        }
    })
    .await
    .expect("revocations blocked on an idle subscriber");

    let mut seen = HashSet::new();
    while let Some(event) = reliable.try_recv() {
        seen.insert(event.key_id);
    }
    assert_eq!(seen.len(), 50);
}

#[tokio::test]
async fn test_dropped_subscription_is_released() {
    let store = Arc::new(KeyStore::in_memory());

    let subscriptions: Vec<_> = (0..10).map(|_| store.subscribe()).collect();
    assert_eq!(store.subscriber_count(), 10);

    for (_rx, guard) in subscriptions {
        guard.unsubscribe();
    }
    assert_eq!(store.subscriber_count(), 0);

    let issued = store.issue("svc1").await.unwrap();
    store.revoke(&issued.id.to_string()).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mass_revocation_closes_everything() {
    let store = Arc::new(KeyStore::in_memory());
    let hub = hub_for(&store);
    let _watcher = hub.watch_revocations(store.as_ref());

    let mut keys = Vec::new();
    let mut conns = Vec::new();
    let mut receivers = Vec::new();
    for i in 0..20 {
        let issued = store.issue(&format!("svc-{}", i)).await.unwrap();
        let key_id = hub.authenticate(Some(&issued.key)).await.unwrap();
        for _ in 0..5 {
            let (conn, rx) = hub.open(key_id, hub.begin_upgrade()).unwrap();
            conns.push(conn);
            receivers.push(rx);
        }
        keys.push(issued);
    }
    assert_eq!(hub.connection_count(), 100);

    let revokers: Vec<_> = keys
        .iter()
        .map(|issued| {
            let store = store.clone();
            let id = issued.id.to_string();
            tokio::spawn(async move { store.revoke(&id).await.unwrap() })
        })
        .collect();
    for revoker in revokers {
        revoker.await.unwrap();
    }

    wait_until(|| hub.connection_count() == 0).await;
    assert_eq!(hub.connections().tombstone_count(), 0);
    for conn in &conns {
        assert!(matches!(conn.close_reason(), Some(CloseReason::Revoked(_))));
    }
}

#[tokio::test]
async fn test_rapid_connect_disconnect_cycles() {
    let config = ServerConfig::new("127.0.0.1:0".parse().unwrap());
    let store = Arc::new(KeyStore::in_memory());
    let server = KeyhubServer::new(config, store.clone(), Arc::new(base_router().unwrap()));
    let (addr, _handle) = server.listen().await.unwrap();
    let issued = store.issue("svc1").await.unwrap();

    let clients: Vec<_> = (0..20)
        .map(|i| {
            let url = format!("ws://{}/ws?api_key={}", addr, issued.key);
            tokio::spawn(async move {
                let (mut ws, _) = connect_async(url).await.unwrap();
                ws.send(Message::binary(rmp_serde::to_vec(&(0u8, i as i64)).unwrap()))
                    .await
                    .unwrap();
                while let Some(Ok(msg)) = ws.next().await {
                    if msg.is_binary() {
                        break;
                    }
                }
                ws.close(None).await.unwrap();
            })
        })
        .collect();

    for client in clients {
        client.await.unwrap();
    }

    wait_until(|| server.connection_count() == 0).await;
    assert_eq!(server.hub().connections().count_for_key(&issued.id), 0);
}
