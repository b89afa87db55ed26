//! Integration tests for Mesh Tunnel
//!
//! Tests the full flow between tunnels including:
//! - Discovery, open/accept and encrypted data transfer
//! - Unicast, multicast and loopback routing
//! - Listener teardown and link reconnection

use mesh_tunnel::config::Config;
use mesh_tunnel::protocol::ProtocolError;
use mesh_tunnel::transport::{MemoryTransport, Message, TcpTransport, Transport};
use mesh_tunnel::tunnel::{DialOptions, ListenOptions, Mode, Session, TunnelError};
use mesh_tunnel::Tunnel;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn config(address: &str, nodes: &[String], token: &str) -> Config {
    let mut config = Config::default();
    config.tunnel.address = address.to_string();
    config.tunnel.nodes = nodes.to_vec();
    config.tunnel.token = token.to_string();
    config.tunnel.reconnect_interval_ms = 100;
    config
}

/// Start a listening tunnel and a second one linked to it
async fn tunnel_pair(transport: Arc<dyn Transport>, a_token: &str, b_token: &str) -> (Tunnel, Tunnel) {
    let b = Tunnel::new(&config("127.0.0.1:0", &[], b_token), transport.clone());
    b.connect().await.unwrap();

    let a = Tunnel::new(&config("127.0.0.1:0", &[b.address().await], a_token), transport);
    a.connect().await.unwrap();
    assert_eq!(a.links().await.len(), 1);

    (a, b)
}

/// Wait until `tunnel` has `count` links routing `channel`
async fn wait_for_routes(tunnel: &Tunnel, channel: &str, count: usize) {
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        let mut routes = 0;
        for link in tunnel.links().await {
            if link.has_channel(channel).await {
                routes += 1;
            }
        }
        if routes >= count {
            return;
        }
        assert!(Instant::now() < deadline, "no route to {}", channel);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn echo_once(session: Session) {
    let msg = session.recv().await.unwrap();
    session.send(msg).await.unwrap();
}

async fn ping(a: &Tunnel, b: &Tunnel) {
    let listener = b.listen("svc", ListenOptions::default()).await.unwrap();
    let server = tokio::spawn(async move {
        let session = listener.accept().await.unwrap();
        let msg = session.recv().await.unwrap();
        (listener, msg)
    });

    let session = a.dial("svc", DialOptions::default()).await.unwrap();
    assert!(session.link().await.is_some());
    session.send(Message::new(&b"ping"[..])).await.unwrap();

    let (listener, msg) = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&msg.body[..], b"ping");

    // Once the listener is gone nobody answers for the channel
    listener.close().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let err = a
        .dial("svc", DialOptions::default().timeout(Duration::from_millis(500)))
        .await
        .unwrap_err();
    assert!(err.is_not_found(), "unexpected error: {}", err);
}

/// Dial, send and receive over the in-memory transport, then lose the listener
#[tokio::test]
async fn test_ping_memory() {
    let (a, b) = tunnel_pair(Arc::new(MemoryTransport::new()), "token", "token").await;
    ping(&a, &b).await;

    a.close().await.unwrap();
    b.close().await.unwrap();
}

/// Same flow over real TCP sockets
#[tokio::test]
async fn test_ping_tcp() {
    let (a, b) = tunnel_pair(Arc::new(TcpTransport::default()), "token", "token").await;
    ping(&a, &b).await;

    a.close().await.unwrap();
    b.close().await.unwrap();
}

/// An oversized message fails on its own session and leaves the shared link up
#[tokio::test]
async fn test_oversized_message_keeps_link() {
    let (a, b) = tunnel_pair(Arc::new(TcpTransport::default()), "token", "token").await;

    let listener = b.listen("svc", ListenOptions::default()).await.unwrap();
    tokio::spawn(async move {
        while let Ok(session) = listener.accept().await {
            tokio::spawn(echo_once(session));
        }
    });

    let big = a.dial("svc", DialOptions::default()).await.unwrap();
    let small = a.dial("svc", DialOptions::default()).await.unwrap();
    assert_eq!(a.links().await.len(), 1);

    let err = big
        .send(Message::new(vec![0u8; 5 * 1024 * 1024]))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TunnelError::Protocol(ProtocolError::MessageTooLarge(_))
    ));
    assert_eq!(a.links().await.len(), 1);

    small.send(Message::new(&b"still here"[..])).await.unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(5), small.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&reply.body[..], b"still here");

    a.close().await.unwrap();
    b.close().await.unwrap();
}

/// Replies travel back over the session they arrived on
#[tokio::test]
async fn test_request_reply() {
    let (a, b) = tunnel_pair(Arc::new(MemoryTransport::new()), "token", "token").await;

    let listener = b.listen("svc", ListenOptions::default()).await.unwrap();
    tokio::spawn(async move {
        while let Ok(session) = listener.accept().await {
            tokio::spawn(echo_once(session));
        }
    });

    let session = a.dial("svc", DialOptions::default()).await.unwrap();
    session
        .send(Message::new(&b"hello"[..]).with_header("Content-Type", "text/plain"))
        .await
        .unwrap();

    let reply = session.recv().await.unwrap();
    assert_eq!(&reply.body[..], b"hello");
    assert_eq!(reply.header["Content-Type"], "text/plain");

    a.close().await.unwrap();
    b.close().await.unwrap();
}

/// Many sessions share one link without crossing streams
#[tokio::test]
async fn test_concurrent_dials() {
    let (a, b) = tunnel_pair(Arc::new(MemoryTransport::new()), "token", "token").await;

    let listener = b.listen("svc", ListenOptions::default()).await.unwrap();
    tokio::spawn(async move {
        while let Ok(session) = listener.accept().await {
            tokio::spawn(echo_once(session));
        }
    });

    let mut clients = Vec::new();
    for i in 0..8 {
        let a = a.clone();
        clients.push(tokio::spawn(async move {
            let session = a.dial("svc", DialOptions::default()).await.unwrap();
            let body = format!("message {}", i);
            session.send(Message::new(body.clone())).await.unwrap();

            let reply = session.recv().await.unwrap();
            assert_eq!(reply.body, body.as_bytes());
            session.close().await;
        }));
    }

    for client in clients {
        tokio::time::timeout(Duration::from_secs(5), client)
            .await
            .unwrap()
            .unwrap();
    }

    a.close().await.unwrap();
    b.close().await.unwrap();
}

/// A multicast send reaches every tunnel listening on the channel
#[tokio::test]
async fn test_multicast() {
    let transport: Arc<dyn Transport> = Arc::new(MemoryTransport::new());

    let mut receivers = Vec::new();
    let mut nodes = Vec::new();
    for _ in 0..2 {
        let t = Tunnel::new(&config("127.0.0.1:0", &[], "token"), transport.clone());
        t.connect().await.unwrap();
        nodes.push(t.address().await);

        let listener = t
            .listen(
                "events",
                ListenOptions {
                    mode: Mode::Multicast,
                    read_timeout: Some(Duration::from_secs(5)),
                },
            )
            .await
            .unwrap();
        receivers.push((t, listener));
    }

    let a = Tunnel::new(&config("127.0.0.1:0", &nodes, "token"), transport);
    a.connect().await.unwrap();
    wait_for_routes(&a, "events", 2).await;

    let session = a
        .dial("events", DialOptions::default().mode(Mode::Multicast))
        .await
        .unwrap();
    assert_eq!(session.mode(), Mode::Multicast);
    session.send(Message::new(&b"hello all"[..])).await.unwrap();

    for (t, listener) in receivers {
        let shared = tokio::time::timeout(Duration::from_secs(5), listener.accept())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(shared.mode(), Mode::Multicast);

        let msg = shared.recv().await.unwrap();
        assert_eq!(&msg.body[..], b"hello all");
        t.close().await.unwrap();
    }

    a.close().await.unwrap();
}

/// Tunnels with different tokens cannot read each other's sessions
#[tokio::test]
async fn test_token_mismatch() {
    let (a, b) = tunnel_pair(Arc::new(MemoryTransport::new()), "token-a", "token-b").await;

    let listener = b.listen("svc", ListenOptions::default()).await.unwrap();
    let server = tokio::spawn(async move {
        let session = listener.accept().await.unwrap();
        session.recv().await
    });

    let session = a.dial("svc", DialOptions::default()).await.unwrap();
    session.send(Message::new(&b"secret"[..])).await.unwrap();

    let res = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(res, Err(TunnelError::DecryptionFailed)));

    a.close().await.unwrap();
    b.close().await.unwrap();
}

/// A tunnel linked to itself dials its own listener
#[tokio::test]
async fn test_loopback() {
    let address = "127.0.0.1:7001";
    let t = Tunnel::new(
        &config(address, &[address.to_string()], "token"),
        Arc::new(MemoryTransport::new()),
    );
    t.connect().await.unwrap();

    let listener = t.listen("svc", ListenOptions::default()).await.unwrap();
    tokio::spawn(async move {
        while let Ok(session) = listener.accept().await {
            tokio::spawn(echo_once(session));
        }
    });

    // Wait for the inbound half of the link to see the connect
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        let mut loopback = false;
        for link in t.links().await {
            loopback |= link.loopback().await;
        }
        if loopback {
            break;
        }
        assert!(Instant::now() < deadline, "loopback link never connected");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let session = t.dial("svc", DialOptions::default()).await.unwrap();
    session.send(Message::new(&b"myself"[..])).await.unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(5), session.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&reply.body[..], b"myself");

    t.close().await.unwrap();
}

/// A peer that goes away and comes back is linked again
#[tokio::test]
async fn test_reconnect() {
    let transport: Arc<dyn Transport> = Arc::new(MemoryTransport::new());
    let address = "127.0.0.1:7002";

    let b = Tunnel::new(&config(address, &[], "token"), transport.clone());
    b.connect().await.unwrap();

    let a = Tunnel::new(&config("127.0.0.1:0", &[address.to_string()], "token"), transport);
    a.connect().await.unwrap();
    assert_eq!(a.links().await.len(), 1);

    b.close().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(a.links().await.is_empty());

    b.connect().await.unwrap();
    let listener = b.listen("svc", ListenOptions::default()).await.unwrap();
    tokio::spawn(async move {
        while let Ok(session) = listener.accept().await {
            tokio::spawn(echo_once(session));
        }
    });

    wait_for_routes(&a, "svc", 1).await;

    let session = a.dial("svc", DialOptions::default()).await.unwrap();
    session.send(Message::new(&b"again"[..])).await.unwrap();
    assert_eq!(&session.recv().await.unwrap().body[..], b"again");

    a.close().await.unwrap();
    b.close().await.unwrap();
}

/// Dialing a named link that does not route the channel fails fast
#[tokio::test]
async fn test_dial_unknown_link() {
    let (a, b) = tunnel_pair(Arc::new(MemoryTransport::new()), "token", "token").await;

    let err = a
        .dial("svc", DialOptions::default().link("no-such-link"))
        .await
        .unwrap_err();
    assert!(matches!(err, TunnelError::LinkNotFound));

    a.close().await.unwrap();
    b.close().await.unwrap();
}
