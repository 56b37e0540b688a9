//! Integration tests for DHT advertise and resolve.
//!
//! These spin up real swarms on loopback, so the address policy is relaxed
//! to admit 127.0.0.1.

use std::net::IpAddr;
use std::time::Duration;

use tokio::time::timeout;

use spegel::routing::{AddressPolicy, P2pRouter, Router, StaticBootstrapper};

fn loopback_policy() -> AddressPolicy {
    AddressPolicy {
        allow_loopback: true,
    }
}

async fn leader() -> P2pRouter {
    P2pRouter::new("127.0.0.1:0", &StaticBootstrapper::new(None), loopback_policy())
        .await
        .expect("leader router starts")
}

async fn follower(leader: &P2pRouter) -> P2pRouter {
    P2pRouter::new(
        "127.0.0.1:0",
        &StaticBootstrapper::new(Some(leader.local_multiaddr().clone())),
        loopback_policy(),
    )
    .await
    .expect("follower router starts")
}

async fn wait_ready(router: &P2pRouter) {
    let deadline = Duration::from_secs(20);
    timeout(deadline, async {
        loop {
            if router.ready().await.unwrap_or(false) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("router should become ready");
}

#[tokio::test]
async fn test_fresh_node_is_not_ready() {
    let node = leader().await;
    assert!(!node.ready().await.unwrap());
    node.close();
}

#[tokio::test]
async fn test_ready_once_peer_connects() {
    let node1 = leader().await;
    let node2 = follower(&node1).await;

    wait_ready(&node2).await;
    wait_ready(&node1).await;

    node1.close();
    node2.close();
}

#[tokio::test]
async fn test_two_node_advertise_and_resolve() {
    let node1 = leader().await;
    let node2 = follower(&node1).await;
    wait_ready(&node2).await;
    wait_ready(&node1).await;

    let key = format!("sha256:{}", "a".repeat(64));
    node1.advertise(vec![key.clone()]).await.unwrap();
    // Give the provider record a moment to replicate.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let mut peers = node2.resolve(&key, false, 5).await.unwrap();
    let ip = timeout(Duration::from_secs(20), peers.recv())
        .await
        .expect("resolve should not hang")
        .expect("expected a provider for the advertised key");
    assert_eq!(ip, "127.0.0.1".parse::<IpAddr>().unwrap());

    node1.close();
    node2.close();
}

#[tokio::test]
async fn test_resolve_unknown_key_closes_stream() {
    let node1 = leader().await;
    let node2 = follower(&node1).await;
    wait_ready(&node2).await;

    let key = format!("sha256:{}", "b".repeat(64));
    let mut peers = node2.resolve(&key, false, 2).await.unwrap();
    let got = timeout(Duration::from_secs(30), peers.recv())
        .await
        .expect("stream should close rather than hang");
    assert!(got.is_none());

    node1.close();
    node2.close();
}

#[tokio::test]
async fn test_self_resolution_respects_allow_self() {
    let node = leader().await;

    let key = "docker.io/library/alpine:3.18";
    // Advertising twice is idempotent: still one provider record.
    node.advertise(vec![key.to_owned()]).await.unwrap();
    node.advertise(vec![key.to_owned()]).await.unwrap();

    let mut peers = node.resolve(key, true, 2).await.unwrap();
    let ip = timeout(Duration::from_secs(20), peers.recv())
        .await
        .expect("resolve should not hang")
        .expect("expected self as provider with allow_self");
    assert_eq!(ip, "127.0.0.1".parse::<IpAddr>().unwrap());
    let second = timeout(Duration::from_secs(20), peers.recv())
        .await
        .expect("stream should close after the only provider");
    assert!(second.is_none());

    // Without allow_self the own record is filtered and the stream drains
    // empty.
    let mut peers = node.resolve(key, false, 1).await.unwrap();
    let got = timeout(Duration::from_secs(30), peers.recv())
        .await
        .expect("stream should close rather than hang");
    assert!(got.is_none());

    node.close();
}

#[tokio::test]
async fn test_advertise_reports_bad_keys() {
    let node = leader().await;

    let err = node
        .advertise(vec!["sha256:notvalidhex".to_owned()])
        .await
        .unwrap_err();
    assert!(matches!(err, spegel::Error::Advertise { failed } if failed.len() == 1));

    node.close();
}
